//! Bridge stand-in for processes with no host attached

use async_trait::async_trait;
use serde_json::Value;

use super::{Bridge, BridgeError, ClientSummary, EventFrame, InvokeOptions};

/// Bridge that never connects to anything
///
/// Every invoke fails immediately with [`BridgeError::Disabled`]; events
/// are discarded.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledBridge;

#[async_trait]
impl Bridge for DisabledBridge {
    async fn invoke(
        &self,
        method: &str,
        _args: Value,
        _options: InvokeOptions,
    ) -> Result<Value, BridgeError> {
        tracing::debug!(method, "invoke on disabled bridge");
        Err(BridgeError::Disabled)
    }

    fn send_event(&self, event: EventFrame) {
        tracing::trace!(event_type = %event.event_type, "event dropped, bridge disabled");
    }

    fn list_connected(&self) -> Vec<ClientSummary> {
        Vec::new()
    }

    async fn close(&self) {}

    fn is_enabled(&self) -> bool {
        false
    }
}
