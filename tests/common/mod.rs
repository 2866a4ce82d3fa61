//! Shared test utilities

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use switchboard_gateway::agent::{AgentReply, AgentRequest, AgentRunner};
use switchboard_gateway::bridge::RequestHandler;
use switchboard_gateway::channels::{
    ChannelKind, ChannelRegistry, DeliveryResult, MediaRef, OutboundAdapter,
};
use switchboard_gateway::{Bridge, Config, Gateway};

/// Configuration with no bridge and no cron timer
#[must_use]
pub fn offline_config() -> Config {
    let mut config = Config::default();
    config.bridge.enabled = false;
    config.cron.enabled = false;
    config
}

/// Configuration with a live bridge on an ephemeral port
#[must_use]
pub fn live_config() -> Config {
    let mut config = Config::default();
    config.bridge.bind = "127.0.0.1:0".to_string();
    config.cron.enabled = false;
    config
}

/// Agent that answers with the request text and tracks concurrency
#[derive(Default)]
pub struct EchoAgent {
    pub active: AtomicUsize,
    pub peak: AtomicUsize,
    pub delay: Duration,
    pub seen: Mutex<Vec<String>>,
}

impl EchoAgent {
    #[must_use]
    pub fn with_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            ..Self::default()
        })
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn seen(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl AgentRunner for EchoAgent {
    async fn run(&self, request: AgentRequest) -> switchboard_gateway::Result<AgentReply> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        self.seen.lock().unwrap().push(request.text.clone());
        tokio::time::sleep(self.delay).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(AgentReply {
            text: format!("echo: {}", request.text),
        })
    }
}

/// Outbound adapter that records what it was asked to send
pub struct Outbox {
    kind: ChannelKind,
    pub sent: Mutex<Vec<(String, String)>>,
}

impl Outbox {
    #[must_use]
    pub fn new(kind: ChannelKind) -> Arc<Self> {
        Arc::new(Self {
            kind,
            sent: Mutex::new(Vec::new()),
        })
    }

    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl OutboundAdapter for Outbox {
    fn kind(&self) -> ChannelKind {
        self.kind
    }

    async fn send_text(
        &self,
        recipient: &str,
        text: &str,
        _account_id: Option<&str>,
    ) -> switchboard_gateway::Result<DeliveryResult> {
        self.sent
            .lock()
            .unwrap()
            .push((recipient.to_string(), text.to_string()));
        Ok(DeliveryResult::default())
    }

    async fn send_media(
        &self,
        recipient: &str,
        text: &str,
        _media: &MediaRef,
        account_id: Option<&str>,
    ) -> switchboard_gateway::Result<DeliveryResult> {
        self.send_text(recipient, text, account_id).await
    }
}

/// Offline gateway with an echo agent and a Telegram outbox
pub async fn echo_gateway(delay: Duration) -> (Gateway, Arc<EchoAgent>, Arc<Outbox>) {
    let agent = EchoAgent::with_delay(delay);
    let outbox = Outbox::new(ChannelKind::Telegram);
    let mut channels = ChannelRegistry::new();
    channels.register(outbox.clone());

    let gateway = Gateway::builder(offline_config())
        .agent(agent.clone())
        .channels(channels)
        .build()
        .await
        .expect("failed to build gateway");
    (gateway, agent, outbox)
}

/// Host-side handler that plays the agent and the platform connections
#[derive(Default)]
pub struct FakeHost {
    pub calls: Mutex<Vec<(String, Value)>>,
}

impl FakeHost {
    pub fn calls(&self, method: &str) -> Vec<Value> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(m, _)| m == method)
            .map(|(_, args)| args.clone())
            .collect()
    }
}

#[async_trait]
impl RequestHandler for FakeHost {
    async fn handle(&self, method: &str, args: Value) -> Result<Value, String> {
        self.calls
            .lock()
            .unwrap()
            .push((method.to_string(), args.clone()));
        match method {
            "agent.run" => {
                let text = args.get("text").and_then(Value::as_str).unwrap_or_default();
                Ok(json!({ "text": format!("host: {text}") }))
            }
            "channel.send" => Ok(json!({ "messageId": "m-1" })),
            "echo" => Ok(args),
            other => Err(format!("unsupported: {other}")),
        }
    }
}

/// Wait until the bridge reports `n` open connections
pub async fn wait_for_clients(bridge: &dyn Bridge, n: usize) {
    for _ in 0..200 {
        if bridge.list_connected().len() == n {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("expected {n} connected clients");
}

/// Poll `condition` for up to two seconds
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}
