//! Configuration management for the Switchboard gateway
//!
//! Values resolve as environment variable > TOML file > built-in default.

pub mod file;

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;

use crate::bridge::{DEFAULT_MAX_FRAME_BYTES, InvokeTarget};
use crate::lanes::CommandLane;
use crate::{Error, Result};

pub use file::{SwitchboardConfigFile, config_file_path, load_config_file, load_config_file_from};

/// Default bridge listen address
pub const DEFAULT_BRIDGE_BIND: &str = "127.0.0.1:18790";

/// Default admin API port
pub const DEFAULT_API_PORT: u16 = 18791;

/// Switchboard gateway configuration
#[derive(Debug, Clone, Default, Serialize)]
pub struct Config {
    /// Raw lane ceilings; resolved by [`crate::lanes::apply_lane_concurrency`]
    pub lanes: LaneConfig,

    /// Scheduled jobs
    pub cron: CronConfig,

    /// Agent runs
    pub agents: AgentsConfig,

    /// Host bridge
    pub bridge: BridgeConfig,

    /// Admin HTTP API
    pub api: ApiServerConfig,

    /// File the configuration was read from, if any
    pub config_path: Option<PathBuf>,
}

/// Lane concurrency values as configured
///
/// Kept unresolved so that invalid values can be reported and replaced by
/// defaults at the single place they are applied.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LaneConfig {
    /// `cron.max_concurrent_runs`
    pub cron_max_concurrent_runs: Option<i64>,
    /// `agents.max_concurrent`, ceiling of the `main` lane
    pub agent_max_concurrent: Option<i64>,
    /// `agents.subagent_max_concurrent`
    pub subagent_max_concurrent: Option<i64>,
}

impl LaneConfig {
    /// Configured value for a built-in lane
    #[must_use]
    pub const fn raw(&self, lane: CommandLane) -> Option<i64> {
        match lane {
            CommandLane::Main => self.agent_max_concurrent,
            CommandLane::Cron => self.cron_max_concurrent_runs,
            CommandLane::Subagent => self.subagent_max_concurrent,
        }
    }
}

/// Cron service configuration
#[derive(Debug, Clone, Serialize)]
pub struct CronConfig {
    /// Run the cron timer loop
    pub enabled: bool,
}

impl Default for CronConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Agent run configuration
#[derive(Debug, Clone, Serialize)]
pub struct AgentsConfig {
    /// Upper bound for one agent run forwarded to the host
    pub timeout_secs: u64,
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self { timeout_secs: 600 }
    }
}

impl AgentsConfig {
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Host bridge configuration
#[derive(Debug, Clone, Serialize)]
pub struct BridgeConfig {
    /// Start the live bridge; the disabled variant is used otherwise
    pub enabled: bool,

    /// Listen address
    pub bind: String,

    /// Idle time before TCP keepalive probes start
    pub keepalive_secs: u64,

    /// Routing policy for untargeted invokes
    pub invoke_target: InvokeTarget,

    /// Timeout the gateway applies to its own invokes
    pub invoke_timeout_ms: u64,

    /// Per-connection outbound queue length
    pub event_buffer: usize,

    /// Largest accepted frame
    pub max_frame_bytes: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: DEFAULT_BRIDGE_BIND.to_string(),
            keepalive_secs: 15,
            invoke_target: InvokeTarget::Primary,
            invoke_timeout_ms: 30_000,
            event_buffer: 256,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

impl BridgeConfig {
    #[must_use]
    pub const fn invoke_timeout(&self) -> Duration {
        Duration::from_millis(self.invoke_timeout_ms)
    }
}

/// Admin HTTP API configuration
#[derive(Debug, Clone, Serialize)]
pub struct ApiServerConfig {
    /// Serve the admin API
    pub enabled: bool,

    /// Port to listen on (localhost only)
    pub port: u16,
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: DEFAULT_API_PORT,
        }
    }
}

impl Config {
    /// Load configuration from the environment and the default config file
    ///
    /// # Errors
    ///
    /// Returns error if the resolved configuration is invalid
    pub fn load() -> Result<Self> {
        Self::load_with_options(None, false)
    }

    /// Load configuration with CLI overrides
    ///
    /// # Errors
    ///
    /// Returns error if the resolved configuration is invalid
    pub fn load_with_options(path: Option<&Path>, disable_bridge: bool) -> Result<Self> {
        let config_path = path.map(Path::to_path_buf).or_else(config_file_path);
        let fc = config_path
            .as_deref()
            .map(load_config_file_from)
            .unwrap_or_default();

        let mut config = Self::from_sources(fc, |key| std::env::var(key).ok())?;
        config.config_path = config_path;

        if disable_bridge {
            tracing::info!("bridge explicitly disabled via --disable-bridge");
            config.bridge.enabled = false;
        }
        Ok(config)
    }

    /// Resolve configuration from a parsed file and an environment lookup
    ///
    /// # Errors
    ///
    /// Returns error if the resolved configuration is invalid
    pub fn from_sources(
        fc: SwitchboardConfigFile,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let env_flag = |key: &str| {
            env(key).map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        };
        let env_parse = |key: &str| -> Option<i64> {
            let raw = env(key)?;
            match raw.trim().parse() {
                Ok(n) => Some(n),
                Err(_) => {
                    tracing::warn!(key, value = %raw, "ignoring non-numeric environment value");
                    None
                }
            }
        };

        // Lane ceilings (env > toml > default applied later)
        let lanes = LaneConfig {
            cron_max_concurrent_runs: env_parse("SWITCHBOARD_CRON_MAX_CONCURRENT_RUNS")
                .or(fc.cron.max_concurrent_runs),
            agent_max_concurrent: env_parse("SWITCHBOARD_AGENT_MAX_CONCURRENT")
                .or(fc.agents.max_concurrent),
            subagent_max_concurrent: env_parse("SWITCHBOARD_SUBAGENT_MAX_CONCURRENT")
                .or(fc.agents.subagent_max_concurrent),
        };

        let cron = CronConfig {
            enabled: env_flag("SWITCHBOARD_CRON_ENABLED")
                .or(fc.cron.enabled)
                .unwrap_or(true),
        };

        let agents = AgentsConfig {
            timeout_secs: fc
                .agents
                .timeout_secs
                .unwrap_or_else(|| AgentsConfig::default().timeout_secs),
        };

        // Bridge (env > toml > default); SWITCHBOARD_DISABLE_BRIDGE wins over everything
        let bridge_defaults = BridgeConfig::default();
        let invoke_target = match env("SWITCHBOARD_BRIDGE_INVOKE_TARGET") {
            Some(raw) => raw.parse::<InvokeTarget>().unwrap_or_else(|e: String| {
                tracing::warn!(error = %e, "ignoring invalid invoke target");
                fc.bridge.invoke_target.unwrap_or_default()
            }),
            None => fc.bridge.invoke_target.unwrap_or_default(),
        };
        let mut bridge = BridgeConfig {
            enabled: env_flag("SWITCHBOARD_BRIDGE_ENABLED")
                .or(fc.bridge.enabled)
                .unwrap_or(bridge_defaults.enabled),
            bind: env("SWITCHBOARD_BRIDGE_BIND")
                .or(fc.bridge.bind)
                .unwrap_or(bridge_defaults.bind),
            keepalive_secs: fc
                .bridge
                .keepalive_secs
                .unwrap_or(bridge_defaults.keepalive_secs),
            invoke_target,
            invoke_timeout_ms: fc
                .bridge
                .invoke_timeout_ms
                .unwrap_or(bridge_defaults.invoke_timeout_ms),
            event_buffer: fc
                .bridge
                .event_buffer
                .unwrap_or(bridge_defaults.event_buffer),
            max_frame_bytes: fc
                .bridge
                .max_frame_bytes
                .unwrap_or(bridge_defaults.max_frame_bytes),
        };
        if env_flag("SWITCHBOARD_DISABLE_BRIDGE") == Some(true) {
            bridge.enabled = false;
        }

        let api = ApiServerConfig {
            enabled: env_flag("SWITCHBOARD_API_ENABLED")
                .or(fc.api.enabled)
                .unwrap_or(true),
            port: env("SWITCHBOARD_API_PORT")
                .and_then(|p| p.parse().ok())
                .or(fc.api.port)
                .unwrap_or(DEFAULT_API_PORT),
        };

        let config = Self {
            lanes,
            cron,
            agents,
            bridge,
            api,
            config_path: None,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.bridge.bind.trim().is_empty() {
            return Err(Error::Config("bridge.bind must not be empty".to_string()));
        }
        if self.bridge.max_frame_bytes == 0 {
            return Err(Error::Config(
                "bridge.max_frame_bytes must be positive".to_string(),
            ));
        }
        if self.bridge.event_buffer == 0 {
            return Err(Error::Config(
                "bridge.event_buffer must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    fn file(toml_src: &str) -> SwitchboardConfigFile {
        toml::from_str(toml_src).unwrap()
    }

    #[test]
    fn defaults_without_sources() {
        let config = Config::from_sources(SwitchboardConfigFile::default(), env_of(&[])).unwrap();
        assert!(config.bridge.enabled);
        assert_eq!(config.bridge.bind, DEFAULT_BRIDGE_BIND);
        assert_eq!(config.bridge.invoke_target, InvokeTarget::Primary);
        assert_eq!(config.api.port, DEFAULT_API_PORT);
        assert_eq!(config.lanes, LaneConfig::default());
    }

    #[test]
    fn env_overrides_file() {
        let fc = file("[cron]\nmax_concurrent_runs = 2\n[agents]\nmax_concurrent = 6\n[api]\nport = 9000");
        let env = env_of(&[
            ("SWITCHBOARD_CRON_MAX_CONCURRENT_RUNS", "3"),
            ("SWITCHBOARD_API_PORT", "9100"),
        ]);
        let config = Config::from_sources(fc, env).unwrap();

        assert_eq!(config.lanes.cron_max_concurrent_runs, Some(3));
        assert_eq!(config.lanes.agent_max_concurrent, Some(6));
        assert_eq!(config.api.port, 9100);
    }

    #[test]
    fn non_numeric_env_falls_back_to_file() {
        let fc = file("[agents]\nsubagent_max_concurrent = 5");
        let env = env_of(&[("SWITCHBOARD_SUBAGENT_MAX_CONCURRENT", "lots")]);
        let config = Config::from_sources(fc, env).unwrap();
        assert_eq!(config.lanes.subagent_max_concurrent, Some(5));
    }

    #[test]
    fn disable_bridge_env_wins() {
        let fc = file("[bridge]\nenabled = true");
        let env = env_of(&[("SWITCHBOARD_DISABLE_BRIDGE", "1")]);
        let config = Config::from_sources(fc, env).unwrap();
        assert!(!config.bridge.enabled);
    }

    #[test]
    fn invoke_target_from_env() {
        let env = env_of(&[("SWITCHBOARD_BRIDGE_INVOKE_TARGET", "newest")]);
        let config = Config::from_sources(SwitchboardConfigFile::default(), env).unwrap();
        assert_eq!(config.bridge.invoke_target, InvokeTarget::Newest);
    }

    #[test]
    fn rejects_zero_frame_limit() {
        let fc = file("[bridge]\nmax_frame_bytes = 0");
        let err = Config::from_sources(fc, env_of(&[])).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn lane_config_maps_builtin_lanes() {
        let lanes = LaneConfig {
            cron_max_concurrent_runs: Some(1),
            agent_max_concurrent: Some(4),
            subagent_max_concurrent: Some(8),
        };
        assert_eq!(lanes.raw(CommandLane::Main), Some(4));
        assert_eq!(lanes.raw(CommandLane::Cron), Some(1));
        assert_eq!(lanes.raw(CommandLane::Subagent), Some(8));
    }

    #[test]
    fn load_with_explicit_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[cron]\nenabled = false\n").unwrap();

        let config = Config::load_with_options(Some(&path), true).unwrap();
        assert!(!config.cron.enabled);
        assert!(!config.bridge.enabled);
        assert_eq!(config.config_path.as_deref(), Some(path.as_path()));
    }
}
