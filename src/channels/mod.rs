//! Messaging channel boundary
//!
//! Platform senders live outside the gateway. Each one is reached through an
//! [`OutboundAdapter`]; the gateway never looks at message content beyond
//! handing it over.

mod bridge;

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use bridge::BridgeOutbound;

use crate::Result;

/// Supported chat platforms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    WhatsApp,
    Telegram,
    Discord,
    Slack,
    Feishu,
    IMessage,
    Teams,
}

impl ChannelKind {
    pub const ALL: [Self; 7] = [
        Self::WhatsApp,
        Self::Telegram,
        Self::Discord,
        Self::Slack,
        Self::Feishu,
        Self::IMessage,
        Self::Teams,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::WhatsApp => "whatsapp",
            Self::Telegram => "telegram",
            Self::Discord => "discord",
            Self::Slack => "slack",
            Self::Feishu => "feishu",
            Self::IMessage => "imessage",
            Self::Teams => "teams",
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChannelKind {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self> {
        let lower = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == lower)
            .ok_or_else(|| crate::Error::Channel(format!("unknown channel: {s}")))
    }
}

/// Reference to media already hosted somewhere the sender can reach
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaRef {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// What a sender reports back after delivery
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryResult {
    /// Platform message id, when the platform returns one
    #[serde(default)]
    pub message_id: Option<String>,
    /// Platform-specific extra detail
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub meta: serde_json::Value,
}

/// A message received from a channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundMessage {
    pub channel: ChannelKind,
    /// Conversation the message belongs to; replies go here
    pub chat_id: String,
    pub sender_id: String,
    pub text: String,
    /// Which of several accounts on the same platform received it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
}

impl InboundMessage {
    #[must_use]
    pub fn new(
        channel: ChannelKind,
        chat_id: impl Into<String>,
        sender_id: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            channel,
            chat_id: chat_id.into(),
            sender_id: sender_id.into(),
            text: text.into(),
            account_id: None,
        }
    }

    /// Lane that serializes this conversation
    #[must_use]
    pub fn session_lane(&self) -> String {
        crate::lanes::session_lane(self.channel.as_str(), &self.chat_id)
    }
}

/// Outbound sender for one platform
#[async_trait]
pub trait OutboundAdapter: Send + Sync {
    /// Platform this adapter delivers to
    fn kind(&self) -> ChannelKind;

    /// Send a text message
    ///
    /// # Errors
    ///
    /// Returns an error if delivery fails
    async fn send_text(
        &self,
        recipient: &str,
        text: &str,
        account_id: Option<&str>,
    ) -> Result<DeliveryResult>;

    /// Send media with an optional caption
    ///
    /// # Errors
    ///
    /// Returns an error if delivery fails
    async fn send_media(
        &self,
        recipient: &str,
        text: &str,
        media: &MediaRef,
        account_id: Option<&str>,
    ) -> Result<DeliveryResult>;
}

/// Channel registry - one outbound adapter per platform
#[derive(Clone, Default)]
pub struct ChannelRegistry {
    adapters: HashMap<ChannelKind, Arc<dyn OutboundAdapter>>,
}

impl fmt::Debug for ChannelRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelRegistry")
            .field("channels", &self.kinds())
            .finish()
    }
}

impl ChannelRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter, replacing any previous one for the same platform
    pub fn register(&mut self, adapter: Arc<dyn OutboundAdapter>) {
        let kind = adapter.kind();
        if self.adapters.insert(kind, adapter).is_some() {
            tracing::warn!(channel = %kind, "replaced outbound adapter");
        } else {
            tracing::debug!(channel = %kind, "registered outbound adapter");
        }
    }

    /// Route every platform through the host bridge
    #[must_use]
    pub fn via_bridge(bridge: &Arc<dyn crate::bridge::Bridge>, timeout: std::time::Duration) -> Self {
        let mut registry = Self::new();
        for kind in ChannelKind::ALL {
            registry.register(Arc::new(BridgeOutbound::new(kind, Arc::clone(bridge), timeout)));
        }
        registry
    }

    #[must_use]
    pub fn get(&self, kind: ChannelKind) -> Option<Arc<dyn OutboundAdapter>> {
        self.adapters.get(&kind).cloned()
    }

    /// Registered platforms, in declaration order
    #[must_use]
    pub fn kinds(&self) -> Vec<ChannelKind> {
        ChannelKind::ALL
            .into_iter()
            .filter(|kind| self.adapters.contains_key(kind))
            .collect()
    }

    /// Send text through the adapter for `kind`
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Channel`] if no adapter is registered, or the
    /// adapter's own error
    pub async fn send_text(
        &self,
        kind: ChannelKind,
        recipient: &str,
        text: &str,
        account_id: Option<&str>,
    ) -> Result<DeliveryResult> {
        let adapter = self
            .get(kind)
            .ok_or_else(|| crate::Error::Channel(format!("no outbound adapter for {kind}")))?;
        adapter.send_text(recipient, text, account_id).await
    }
}
