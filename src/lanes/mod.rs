//! Lane-based command scheduling
//!
//! A lane is a named queue with its own concurrency ceiling. Agent runs go
//! through `main` (nested inside a per-conversation `session:*` lane),
//! delegated runs through `subagent`, and scheduled jobs through `cron`.

pub mod queue;
pub mod registry;

use serde::{Deserialize, Serialize};

use crate::config::LaneConfig;

pub use queue::{
    CommandError, CommandHandle, CommandQueue, CommandState, DEFAULT_WARN_AFTER, EnqueueOptions,
};
pub use registry::{Admission, DEFAULT_CONCURRENCY, LaneRegistry, LaneSnapshot, LaneTicket};

/// Built-in lanes with configurable ceilings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandLane {
    /// Agent runs triggered by inbound messages
    Main,
    /// Scheduled jobs
    Cron,
    /// Agent runs spawned by other agent runs
    Subagent,
}

impl CommandLane {
    pub const ALL: [Self; 3] = [Self::Main, Self::Cron, Self::Subagent];

    /// Lane name as used by the registry
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Main => "main",
            Self::Cron => "cron",
            Self::Subagent => "subagent",
        }
    }

    /// Ceiling used when configuration gives no usable value
    #[must_use]
    pub const fn default_concurrency(self) -> usize {
        match self {
            Self::Main => 4,
            Self::Cron => 1,
            Self::Subagent => 8,
        }
    }
}

impl std::fmt::Display for CommandLane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-conversation lane key
///
/// Messages from the same chat are handled one at a time, in order.
#[must_use]
pub fn session_lane(channel: &str, chat_id: &str) -> String {
    format!("session:{channel}:{chat_id}")
}

/// Turn a raw configured limit into a usable ceiling
///
/// Absent and non-positive values fall back to the lane's default.
#[must_use]
pub fn resolve_limit(lane: CommandLane, raw: Option<i64>) -> usize {
    let default = lane.default_concurrency();
    match raw {
        None => default,
        Some(value) => match usize::try_from(value) {
            Ok(n) if n > 0 => n,
            _ => {
                tracing::warn!(
                    lane = %lane,
                    value,
                    default,
                    "invalid lane concurrency, using default"
                );
                default
            }
        },
    }
}

/// Apply configured ceilings to the built-in lanes
///
/// Called once at startup and again on every config reload.
pub fn apply_lane_concurrency(registry: &LaneRegistry, config: &LaneConfig) {
    for lane in CommandLane::ALL {
        let limit = resolve_limit(lane, config.raw(lane));
        if let Err(e) = registry.set_concurrency(lane.as_str(), limit) {
            tracing::warn!(lane = %lane, error = %e, "failed to apply lane concurrency");
        }
    }
    tracing::debug!(
        main = registry.concurrency(CommandLane::Main.as_str()),
        cron = registry.concurrency(CommandLane::Cron.as_str()),
        subagent = registry.concurrency(CommandLane::Subagent.as_str()),
        "lane concurrency applied"
    );
}
