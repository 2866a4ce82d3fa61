//! Error types for the Switchboard gateway

use thiserror::Error;

use crate::bridge::{BridgeError, ProtocolError};

/// Result type alias for gateway operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the Switchboard gateway
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Lane concurrency must be a positive integer
    #[error("invalid concurrency {value} for lane '{lane}': must be at least 1")]
    InvalidConcurrency {
        /// Lane being configured
        lane: String,
        /// Rejected value
        value: usize,
    },

    /// Bridge transport or RPC error
    #[error(transparent)]
    Bridge(#[from] BridgeError),

    /// Bridge frame could not be decoded
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Channel delivery error
    #[error("channel error: {0}")]
    Channel(String),

    /// Agent run error
    #[error("agent error: {0}")]
    Agent(String),

    /// Cron job error
    #[error("cron error: {0}")]
    Cron(String),

    /// Resource not found
    #[error("not found: {0}")]
    NotFound(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}
