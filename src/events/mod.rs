//! Gateway events published to bridge listeners
//!
//! Publishing is best-effort; delivery failures are logged by the bridge and
//! never propagate to callers.
//!
//! Services that are built before the bridge exists hold a [`Publisher`]
//! and the bridge is attached to it once at startup.

use std::sync::{Arc, OnceLock};

use serde_json::{Value, json};

use crate::bridge::{Bridge, EventFrame};
use crate::lanes::LaneSnapshot;

pub const AGENT_RUN_STARTED: &str = "agent.run.started";
pub const AGENT_RUN_FINISHED: &str = "agent.run.finished";
pub const CRON_RUN_STARTED: &str = "cron.run.started";
pub const CRON_RUN_FINISHED: &str = "cron.run.finished";
pub const LANES_CHANGED: &str = "lanes.changed";

fn stamped(event_type: &str, mut payload: Value) -> EventFrame {
    if let Value::Object(map) = &mut payload {
        map.insert(
            "timestamp".to_string(),
            Value::String(chrono::Utc::now().to_rfc3339()),
        );
    }
    EventFrame::new(event_type, payload)
}

/// Build an `agent.run.started` event.
///
/// # Arguments
///
/// - `run_id` - Command id of the run
/// - `lane` - Lane the run was admitted on
/// - `channel` - Channel the triggering message came from
/// - `chat_id` - Conversation within the channel
#[must_use]
pub fn agent_run_started(run_id: &str, lane: &str, channel: &str, chat_id: &str) -> EventFrame {
    stamped(
        AGENT_RUN_STARTED,
        json!({
            "runId": run_id,
            "lane": lane,
            "channel": channel,
            "chatId": chat_id,
        }),
    )
}

/// Build an `agent.run.finished` event.
///
/// `error` is `None` for a successful run.
#[must_use]
pub fn agent_run_finished(run_id: &str, lane: &str, duration_ms: u64, error: Option<&str>) -> EventFrame {
    stamped(
        AGENT_RUN_FINISHED,
        json!({
            "runId": run_id,
            "lane": lane,
            "ok": error.is_none(),
            "error": error,
            "durationMs": duration_ms,
        }),
    )
}

/// Build a `cron.run.started` event.
#[must_use]
pub fn cron_run_started(job_id: &str, job_name: &str) -> EventFrame {
    stamped(
        CRON_RUN_STARTED,
        json!({
            "jobId": job_id,
            "name": job_name,
        }),
    )
}

/// Build a `cron.run.finished` event.
///
/// # Arguments
///
/// - `job_id` - Job identifier
/// - `status` - `"ok"`, `"error"` or `"skipped"`
/// - `duration_ms` - Wall time of the run, zero when skipped
/// - `error` - Executor error message, if any
#[must_use]
pub fn cron_run_finished(job_id: &str, status: &str, duration_ms: u64, error: Option<&str>) -> EventFrame {
    stamped(
        CRON_RUN_FINISHED,
        json!({
            "jobId": job_id,
            "status": status,
            "durationMs": duration_ms,
            "error": error,
        }),
    )
}

/// Build a `lanes.changed` event carrying the snapshot of one lane.
#[must_use]
pub fn lanes_changed(snapshot: &LaneSnapshot) -> EventFrame {
    stamped(
        LANES_CHANGED,
        json!({
            "lane": snapshot.lane,
            "maxConcurrent": snapshot.max_concurrent,
            "active": snapshot.active,
            "queued": snapshot.queued,
        }),
    )
}

/// Publish an event on a bridge (best-effort, fire-and-forget).
pub fn publish(bridge: &dyn Bridge, event: EventFrame) {
    tracing::debug!(event_type = %event.event_type, "publishing event");
    bridge.send_event(event);
}

/// Late-bound handle to the process bridge
#[derive(Clone, Default)]
pub struct Publisher {
    bridge: Arc<OnceLock<Arc<dyn Bridge>>>,
}

impl std::fmt::Debug for Publisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publisher")
            .field("attached", &self.bridge.get().is_some())
            .finish()
    }
}

impl Publisher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Publisher already attached to `bridge`
    #[must_use]
    pub fn attached(bridge: Arc<dyn Bridge>) -> Self {
        let publisher = Self::new();
        publisher.attach(bridge);
        publisher
    }

    /// Attach the bridge. No-op if one is already attached.
    pub fn attach(&self, bridge: Arc<dyn Bridge>) {
        if self.bridge.set(bridge).is_err() {
            tracing::debug!("event publisher already attached");
        }
    }

    /// Publish if a bridge is attached; drop the event otherwise
    pub fn publish(&self, event: EventFrame) {
        match self.bridge.get() {
            Some(bridge) => publish(bridge.as_ref(), event),
            None => tracing::trace!(event_type = %event.event_type, "no bridge attached, event dropped"),
        }
    }
}
