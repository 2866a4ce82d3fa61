//! Outbound delivery through the host bridge
//!
//! The host owns the platform connections; the gateway asks it to send with
//! `channel.send` and reads back the delivery result.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use super::{ChannelKind, DeliveryResult, MediaRef, OutboundAdapter};
use crate::Result;
use crate::bridge::{Bridge, InvokeOptions};

/// Host method that performs the actual platform send
pub const METHOD_CHANNEL_SEND: &str = "channel.send";

/// Adapter that forwards sends to the attached host
pub struct BridgeOutbound {
    kind: ChannelKind,
    bridge: Arc<dyn Bridge>,
    timeout: Duration,
}

impl BridgeOutbound {
    #[must_use]
    pub fn new(kind: ChannelKind, bridge: Arc<dyn Bridge>, timeout: Duration) -> Self {
        Self {
            kind,
            bridge,
            timeout,
        }
    }

    async fn send(&self, args: Value) -> Result<DeliveryResult> {
        let result = self
            .bridge
            .invoke(
                METHOD_CHANNEL_SEND,
                args,
                InvokeOptions::default().with_timeout(self.timeout),
            )
            .await?;
        if result.is_null() {
            return Ok(DeliveryResult::default());
        }
        serde_json::from_value(result).map_err(|e| {
            crate::Error::Channel(format!("{}: invalid delivery result: {e}", self.kind))
        })
    }
}

#[async_trait]
impl OutboundAdapter for BridgeOutbound {
    fn kind(&self) -> ChannelKind {
        self.kind
    }

    async fn send_text(
        &self,
        recipient: &str,
        text: &str,
        account_id: Option<&str>,
    ) -> Result<DeliveryResult> {
        tracing::debug!(channel = %self.kind, recipient, "sending text via host");
        self.send(json!({
            "channel": self.kind,
            "recipient": recipient,
            "text": text,
            "accountId": account_id,
        }))
        .await
    }

    async fn send_media(
        &self,
        recipient: &str,
        text: &str,
        media: &MediaRef,
        account_id: Option<&str>,
    ) -> Result<DeliveryResult> {
        tracing::debug!(channel = %self.kind, recipient, url = %media.url, "sending media via host");
        self.send(json!({
            "channel": self.kind,
            "recipient": recipient,
            "text": text,
            "media": media,
            "accountId": account_id,
        }))
        .await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::bridge::{BridgeError, ClientSummary, DisabledBridge, EventFrame};

    /// Records every invoke and acknowledges it with a message id
    #[derive(Default)]
    struct Recording {
        calls: Mutex<Vec<(String, Value)>>,
    }

    #[async_trait]
    impl Bridge for Recording {
        async fn invoke(
            &self,
            method: &str,
            args: Value,
            _options: InvokeOptions,
        ) -> std::result::Result<Value, BridgeError> {
            self.calls.lock().unwrap().push((method.to_string(), args));
            Ok(json!({"messageId": "m-7"}))
        }

        fn send_event(&self, _event: EventFrame) {}

        fn list_connected(&self) -> Vec<ClientSummary> {
            Vec::new()
        }

        async fn close(&self) {}

        fn is_enabled(&self) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn media_is_forwarded_to_host() {
        let bridge = Arc::new(Recording::default());
        let adapter = BridgeOutbound::new(ChannelKind::WhatsApp, bridge.clone(), Duration::from_secs(1));
        let media = MediaRef {
            url: "https://cdn.example.com/cat.png".into(),
            mime_type: Some("image/png".into()),
        };

        let delivered = adapter
            .send_media("+15550001", "look", &media, Some("work"))
            .await
            .unwrap();
        assert_eq!(delivered.message_id.as_deref(), Some("m-7"));

        let calls = bridge.calls.lock().unwrap();
        let (method, args) = &calls[0];
        assert_eq!(method, METHOD_CHANNEL_SEND);
        assert_eq!(
            *args,
            json!({
                "channel": "whatsapp",
                "recipient": "+15550001",
                "text": "look",
                "media": {"url": "https://cdn.example.com/cat.png", "mimeType": "image/png"},
                "accountId": "work",
            })
        );
    }

    #[tokio::test]
    async fn disabled_bridge_fails_delivery() {
        let adapter = BridgeOutbound::new(
            ChannelKind::Feishu,
            Arc::new(DisabledBridge),
            Duration::from_secs(1),
        );
        let err = adapter.send_text("ou_1", "hello", None).await.unwrap_err();
        assert!(matches!(err, crate::Error::Bridge(BridgeError::Disabled)));
    }
}
