//! Cron jobs that run an agent turn and deliver its reply

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use crate::agent::{AgentRequest, AgentRunner};
use crate::channels::{ChannelKind, ChannelRegistry};
use crate::cron::{CronExecutor, CronJob};

/// Payload of an agent job
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AgentJob {
    channel: ChannelKind,
    chat_id: String,
    text: String,
    #[serde(default)]
    account_id: Option<String>,
    /// Send the reply to the conversation
    #[serde(default = "default_deliver")]
    deliver: bool,
}

const fn default_deliver() -> bool {
    true
}

/// Default cron executor: the job payload is an agent prompt
pub struct AgentCronExecutor {
    agent: Arc<dyn AgentRunner>,
    channels: ChannelRegistry,
}

impl AgentCronExecutor {
    #[must_use]
    pub fn new(agent: Arc<dyn AgentRunner>, channels: ChannelRegistry) -> Self {
        Self { agent, channels }
    }
}

#[async_trait]
impl CronExecutor for AgentCronExecutor {
    async fn execute(&self, job: &CronJob) -> Result<(), String> {
        let payload: AgentJob = serde_json::from_value(job.payload.clone())
            .map_err(|e| format!("invalid job payload: {e}"))?;

        let request = AgentRequest {
            channel: payload.channel,
            chat_id: payload.chat_id.clone(),
            sender_id: format!("cron:{}", job.id),
            text: payload.text,
            account_id: payload.account_id.clone(),
            parent_run_id: None,
        };
        let reply = self.agent.run(request).await.map_err(|e| e.to_string())?;

        if payload.deliver && !reply.text.is_empty() {
            self.channels
                .send_text(
                    payload.channel,
                    &payload.chat_id,
                    &reply.text,
                    payload.account_id.as_deref(),
                )
                .await
                .map_err(|e| e.to_string())?;
        }
        Ok(())
    }
}
