//! Host bridge
//!
//! A persistent, newline-framed JSON channel between the gateway and an
//! external host process. The gateway invokes host functionality with
//! correlated request/response pairs and broadcasts events to every
//! subscribed connection; the host can call gateway methods the same way.
//!
//! The [`Bridge`] trait has two implementations chosen once at startup by
//! [`start`]: the live TCP [`BridgeServer`] and the [`DisabledBridge`].

pub mod client;
pub mod disabled;
pub mod frame;
pub mod methods;
pub mod server;

use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::config::BridgeConfig;

pub use client::{BridgeClient, RequestHandler};
pub use disabled::DisabledBridge;
pub use frame::{
    DEFAULT_MAX_FRAME_BYTES, EventFrame, Frame, FrameDecoder, ProtocolError, RequestFrame,
    ResponseFrame, decode_frame, encode_frame,
};
pub use methods::{HandlerFn, MethodContext, MethodRegistry, MethodResult};
pub use server::BridgeServer;

/// Bridge transport and RPC errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BridgeError {
    /// No host bridge in this process
    #[error("bridge disabled")]
    Disabled,

    /// The connection carrying the request went away
    #[error("bridge connection closed")]
    ConnectionClosed,

    /// No response within the caller's timeout
    #[error("bridge invoke timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    /// Explicit target is not connected
    #[error("bridge client not found: {0}")]
    ClientNotFound(String),

    /// The other side answered with an error
    #[error("remote error: {0}")]
    Remote(String),

    /// The bridge has been shut down
    #[error("bridge closed")]
    Closed,

    /// Socket error
    #[error("bridge io error: {0}")]
    Io(String),

    /// Outgoing frame could not be encoded
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl From<std::io::Error> for BridgeError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

/// Which connection an untargeted invoke goes to
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvokeTarget {
    /// The connection that called `bridge.setPrimary`, else the oldest
    #[default]
    Primary,
    /// The most recently opened connection
    Newest,
}

impl FromStr for InvokeTarget {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "primary" => Ok(Self::Primary),
            "newest" => Ok(Self::Newest),
            other => Err(format!("unknown invoke target: {other}")),
        }
    }
}

/// Per-call invoke options
#[derive(Debug, Clone, Default)]
pub struct InvokeOptions {
    /// Connection id to address; routing policy decides when absent
    pub target: Option<String>,
    /// Give up after this long; wait indefinitely when absent
    pub timeout: Option<Duration>,
}

impl InvokeOptions {
    #[must_use]
    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Connection summary for administration
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientSummary {
    pub id: String,
    pub peer: String,
    pub connected_at: DateTime<Utc>,
    pub listener: bool,
    pub primary: bool,
    pub pending: usize,
}

/// Capability interface shared by the live and disabled bridge
#[async_trait]
pub trait Bridge: Send + Sync {
    /// Call `method` on a connected host and wait for its answer
    async fn invoke(
        &self,
        method: &str,
        args: Value,
        options: InvokeOptions,
    ) -> Result<Value, BridgeError>;

    /// Broadcast an event to every subscribed connection, best effort
    fn send_event(&self, event: EventFrame);

    /// Currently open connections
    fn list_connected(&self) -> Vec<ClientSummary>;

    /// Close every connection and stop accepting new ones
    async fn close(&self);

    /// Whether a host can be attached at all
    fn is_enabled(&self) -> bool;

    /// Address the bridge accepts connections on
    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }
}

/// Start the bridge variant selected by configuration
///
/// # Errors
///
/// Returns an error if the live bridge cannot bind its listener
pub async fn start(config: &BridgeConfig, methods: MethodRegistry) -> crate::Result<Arc<dyn Bridge>> {
    if !config.enabled {
        tracing::info!("host bridge disabled");
        return Ok(Arc::new(DisabledBridge));
    }
    let server = BridgeServer::bind(config, methods).await?;
    Ok(Arc::new(server))
}
