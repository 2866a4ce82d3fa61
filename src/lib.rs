//! Switchboard Gateway - multi-channel messaging gateway
//!
//! This library provides the core functionality for the Switchboard gateway:
//! - Lane-based command scheduling with per-lane concurrency ceilings
//! - A serialized operation lock for stateful services
//! - A newline-framed JSON RPC bridge to an external host process
//! - Cron jobs, agent runs and channel delivery wired on top of those
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                      Inbound                         │
//! │  WhatsApp │ Telegram │ Slack │ Feishu │ Cron │ Host  │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │                  Lanes                               │
//! │  session:* → main │ subagent │ cron                  │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │                  Bridge                              │
//! │  invoke ↔ host  │  events → listeners               │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod agent;
pub mod api;
pub mod bridge;
pub mod channels;
pub mod config;
pub mod cron;
pub mod error;
pub mod events;
pub mod gateway;
pub mod lanes;
pub mod serial;

pub use bridge::{Bridge, BridgeClient, BridgeError, BridgeServer, DisabledBridge, EventFrame, Frame};
pub use config::Config;
pub use error::{Error, Result};
pub use gateway::{Gateway, GatewayBuilder};
pub use lanes::{CommandLane, CommandQueue, LaneRegistry};
pub use serial::SerialLock;
