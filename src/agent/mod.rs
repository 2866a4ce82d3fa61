//! Agent runner boundary
//!
//! The reasoning loop lives elsewhere. The gateway only schedules runs and
//! hands their replies to channels.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::Result;
use crate::bridge::{Bridge, InvokeOptions};
use crate::channels::{ChannelKind, InboundMessage};

/// Host method that runs one agent turn
pub const METHOD_AGENT_RUN: &str = "agent.run";

/// Input for one agent run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRequest {
    pub channel: ChannelKind,
    pub chat_id: String,
    pub sender_id: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    /// Run that spawned this one, for sub-agent runs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_run_id: Option<String>,
}

impl From<InboundMessage> for AgentRequest {
    fn from(message: InboundMessage) -> Self {
        Self {
            channel: message.channel,
            chat_id: message.chat_id,
            sender_id: message.sender_id,
            text: message.text,
            account_id: message.account_id,
            parent_run_id: None,
        }
    }
}

/// Output of one agent run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentReply {
    /// Text to deliver; nothing is sent when empty
    #[serde(default)]
    pub text: String,
}

/// Runs one agent turn
#[async_trait]
pub trait AgentRunner: Send + Sync {
    /// # Errors
    ///
    /// Returns an error if the run fails
    async fn run(&self, request: AgentRequest) -> Result<AgentReply>;
}

/// Runner that asks the attached host to do the work
pub struct BridgeAgentRunner {
    bridge: Arc<dyn Bridge>,
    timeout: Duration,
}

impl BridgeAgentRunner {
    #[must_use]
    pub fn new(bridge: Arc<dyn Bridge>, timeout: Duration) -> Self {
        Self { bridge, timeout }
    }
}

#[async_trait]
impl AgentRunner for BridgeAgentRunner {
    async fn run(&self, request: AgentRequest) -> Result<AgentReply> {
        let args = serde_json::to_value(&request)?;
        let result = self
            .bridge
            .invoke(
                METHOD_AGENT_RUN,
                args,
                InvokeOptions::default().with_timeout(self.timeout),
            )
            .await?;
        serde_json::from_value(result)
            .map_err(|e| crate::Error::Agent(format!("invalid agent reply: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::bridge::{BridgeError, DisabledBridge};

    #[test]
    fn request_from_inbound() {
        let mut message = InboundMessage::new(ChannelKind::Discord, "guild-1", "u-9", "hello");
        message.account_id = Some("bot-2".into());

        let request = AgentRequest::from(message);
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({
                "channel": "discord",
                "chatId": "guild-1",
                "senderId": "u-9",
                "text": "hello",
                "accountId": "bot-2",
            })
        );
    }

    #[tokio::test]
    async fn bridge_runner_without_host() {
        let runner = BridgeAgentRunner::new(Arc::new(DisabledBridge), Duration::from_secs(1));
        let request = AgentRequest::from(InboundMessage::new(ChannelKind::Slack, "c", "u", "t"));
        let err = runner.run(request).await.unwrap_err();
        assert!(matches!(err, crate::Error::Bridge(BridgeError::Disabled)));
    }
}
