//! TOML configuration file loading
//!
//! Supports `~/.config/switchboard/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::bridge::InvokeTarget;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct SwitchboardConfigFile {
    /// Scheduled jobs
    #[serde(default)]
    pub cron: CronFileConfig,

    /// Agent run limits
    #[serde(default)]
    pub agents: AgentsFileConfig,

    /// Host bridge
    #[serde(default)]
    pub bridge: BridgeFileConfig,

    /// Admin HTTP API
    #[serde(default)]
    pub api: ApiFileConfig,
}

#[derive(Debug, Default, Deserialize)]
pub struct CronFileConfig {
    pub enabled: Option<bool>,
    /// Ceiling for the `cron` lane
    pub max_concurrent_runs: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct AgentsFileConfig {
    /// Ceiling for the `main` lane
    pub max_concurrent: Option<i64>,
    /// Ceiling for the `subagent` lane
    pub subagent_max_concurrent: Option<i64>,
    /// Upper bound for one agent run through the bridge
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct BridgeFileConfig {
    pub enabled: Option<bool>,
    /// Listen address, e.g. "127.0.0.1:18790"
    pub bind: Option<String>,
    pub keepalive_secs: Option<u64>,
    /// "primary" or "newest"
    pub invoke_target: Option<InvokeTarget>,
    pub invoke_timeout_ms: Option<u64>,
    /// Per-connection outbound queue length
    pub event_buffer: Option<usize>,
    pub max_frame_bytes: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ApiFileConfig {
    pub enabled: Option<bool>,
    pub port: Option<u16>,
}

/// Load the TOML config file from the standard path
///
/// Returns `SwitchboardConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file() -> SwitchboardConfigFile {
    config_file_path().map_or_else(SwitchboardConfigFile::default, |path| {
        load_config_file_from(&path)
    })
}

/// Load a specific TOML config file
///
/// A missing file yields defaults silently; an unreadable or invalid one
/// yields defaults with a warning.
pub fn load_config_file_from(path: &Path) -> SwitchboardConfigFile {
    if !path.exists() {
        return SwitchboardConfigFile::default();
    }

    match std::fs::read_to_string(path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                SwitchboardConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            SwitchboardConfigFile::default()
        }
    }
}

/// Return the config file path: `~/.config/switchboard/config.toml`
#[must_use]
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("switchboard").join("config.toml"))
}
