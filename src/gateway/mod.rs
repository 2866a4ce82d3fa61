//! Gateway - process-wide wiring
//!
//! One lane registry, one dispatcher and one bridge per process. Inbound
//! messages are serialized per conversation, bounded by the `main` lane,
//! handed to the agent runner, and the reply goes back out through the
//! channel the message came from.

mod jobs;
pub mod methods;

use std::sync::{Arc, OnceLock, PoisonError, RwLock, Weak};
use std::time::Instant;

use tokio_util::sync::CancellationToken;

pub use jobs::AgentCronExecutor;

use crate::agent::{AgentReply, AgentRequest, AgentRunner, BridgeAgentRunner};
use crate::api::ApiServer;
use crate::bridge::{self, Bridge};
use crate::channels::{ChannelRegistry, InboundMessage};
use crate::cron::{CronExecutor, CronService};
use crate::events::{self, Publisher};
use crate::lanes::{
    CommandError, CommandHandle, CommandLane, CommandQueue, EnqueueOptions, LaneRegistry,
    LaneSnapshot, apply_lane_concurrency,
};
use crate::{Config, Error, Result};

/// Late link from bridge method handlers back to the gateway
type CoreSlot = Arc<OnceLock<Weak<Core>>>;

struct Core {
    config: RwLock<Config>,
    lanes: LaneRegistry,
    queue: CommandQueue,
    bridge: Arc<dyn Bridge>,
    agent: Arc<dyn AgentRunner>,
    channels: ChannelRegistry,
    cron: CronService,
    publisher: Publisher,
}

/// Builder for a [`Gateway`]
///
/// Collaborators left unset are routed through the host bridge.
pub struct GatewayBuilder {
    config: Config,
    agent: Option<Arc<dyn AgentRunner>>,
    channels: Option<ChannelRegistry>,
    cron_executor: Option<Arc<dyn CronExecutor>>,
}

impl GatewayBuilder {
    /// Use a local agent runner instead of the host
    #[must_use]
    pub fn agent(mut self, agent: Arc<dyn AgentRunner>) -> Self {
        self.agent = Some(agent);
        self
    }

    /// Use these outbound adapters instead of the host
    #[must_use]
    pub fn channels(mut self, channels: ChannelRegistry) -> Self {
        self.channels = Some(channels);
        self
    }

    /// Replace the default agent-backed cron executor
    #[must_use]
    pub fn cron_executor(mut self, executor: Arc<dyn CronExecutor>) -> Self {
        self.cron_executor = Some(executor);
        self
    }

    /// Build the gateway and start the bridge
    ///
    /// # Errors
    ///
    /// Returns error if the bridge listener cannot be bound
    pub async fn build(self) -> Result<Gateway> {
        let config = self.config;

        let lanes = LaneRegistry::new();
        apply_lane_concurrency(&lanes, &config.lanes);
        let queue = CommandQueue::new(lanes.clone());
        let publisher = Publisher::new();

        let slot = CoreSlot::default();
        let bridge = bridge::start(&config.bridge, methods::registry(&slot)).await?;
        publisher.attach(Arc::clone(&bridge));

        let agent = self.agent.unwrap_or_else(|| {
            Arc::new(BridgeAgentRunner::new(
                Arc::clone(&bridge),
                config.agents.timeout(),
            ))
        });
        let channels = self
            .channels
            .unwrap_or_else(|| ChannelRegistry::via_bridge(&bridge, config.bridge.invoke_timeout()));
        let executor = self.cron_executor.unwrap_or_else(|| {
            Arc::new(AgentCronExecutor::new(Arc::clone(&agent), channels.clone()))
        });
        let cron = CronService::new(queue.clone(), executor, publisher.clone());

        tracing::info!(
            bridge_enabled = bridge.is_enabled(),
            bridge_addr = ?bridge.local_addr(),
            channels = ?channels.kinds(),
            "gateway initialized"
        );

        let core = Arc::new(Core {
            config: RwLock::new(config),
            lanes,
            queue,
            bridge,
            agent,
            channels,
            cron,
            publisher,
        });
        if slot.set(Arc::downgrade(&core)).is_err() {
            tracing::warn!("gateway method slot already set");
        }
        Ok(Gateway { core })
    }
}

/// The Switchboard gateway
#[derive(Clone)]
pub struct Gateway {
    core: Arc<Core>,
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("lanes", &self.core.lanes)
            .field("bridge_enabled", &self.core.bridge.is_enabled())
            .finish_non_exhaustive()
    }
}

impl Gateway {
    #[must_use]
    pub fn builder(config: Config) -> GatewayBuilder {
        GatewayBuilder {
            config,
            agent: None,
            channels: None,
            cron_executor: None,
        }
    }

    /// Gateway whose agent runs and deliveries all go through the host
    ///
    /// # Errors
    ///
    /// Returns error if the bridge listener cannot be bound
    pub async fn new(config: Config) -> Result<Self> {
        Self::builder(config).build().await
    }

    /// Snapshot of the current configuration
    #[must_use]
    pub fn config(&self) -> Config {
        self.core
            .config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    #[must_use]
    pub fn lanes(&self) -> &LaneRegistry {
        &self.core.lanes
    }

    #[must_use]
    pub fn queue(&self) -> &CommandQueue {
        &self.core.queue
    }

    #[must_use]
    pub fn bridge(&self) -> &Arc<dyn Bridge> {
        &self.core.bridge
    }

    #[must_use]
    pub fn cron(&self) -> &CronService {
        &self.core.cron
    }

    #[must_use]
    pub fn channels(&self) -> &ChannelRegistry {
        &self.core.channels
    }

    /// Snapshots of every lane referenced so far
    #[must_use]
    pub fn lane_snapshots(&self) -> Vec<LaneSnapshot> {
        self.core.lanes.snapshots()
    }

    /// Change one lane's ceiling at runtime and announce it
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConcurrency`] for zero
    pub fn set_lane_concurrency(&self, lane: &str, max_concurrent: usize) -> Result<LaneSnapshot> {
        self.core.lanes.set_concurrency(lane, max_concurrent)?;
        let snapshot = self.core.lanes.snapshot(lane);
        self.core.publisher.publish(events::lanes_changed(&snapshot));
        Ok(snapshot)
    }

    /// Adopt a new configuration
    ///
    /// Lane ceilings take effect immediately. Bridge and API settings only
    /// apply on the next start.
    pub fn apply_config(&self, config: Config) {
        apply_lane_concurrency(&self.core.lanes, &config.lanes);
        for lane in CommandLane::ALL {
            let snapshot = self.core.lanes.snapshot(lane.as_str());
            self.core.publisher.publish(events::lanes_changed(&snapshot));
        }
        *self
            .core
            .config
            .write()
            .unwrap_or_else(PoisonError::into_inner) = config;
    }

    /// Re-read the configuration from its sources and apply it
    ///
    /// # Errors
    ///
    /// Returns error if the reloaded configuration is invalid; the current
    /// one stays in effect
    pub fn reload_config(&self) -> Result<()> {
        let current = self.config();
        let reloaded =
            Config::load_with_options(current.config_path.as_deref(), !current.bridge.enabled)?;
        if reloaded.bridge.bind != current.bridge.bind {
            tracing::warn!("bridge settings changed, restart to apply");
        }
        self.apply_config(reloaded);
        tracing::info!("configuration reloaded");
        Ok(())
    }

    /// Handle a message received from a channel
    ///
    /// Messages from the same conversation run one at a time in arrival
    /// order; across conversations the `main` lane bounds concurrency. The
    /// reply, if any, is delivered back to the conversation.
    pub fn handle_inbound(&self, message: InboundMessage) -> CommandHandle<AgentReply, Error> {
        let session = message.session_lane();
        tracing::debug!(
            channel = %message.channel,
            chat_id = %message.chat_id,
            lane = %session,
            "inbound message"
        );

        let core = Arc::clone(&self.core);
        self.core.queue.enqueue(&session, move |token| async move {
            let queue = core.queue.clone();
            let run = queue.enqueue_with(
                CommandLane::Main.as_str(),
                EnqueueOptions::default().with_cancel(token),
                move |token| run_agent(core, CommandLane::Main, AgentRequest::from(message), true, token),
            );
            run.await.map_err(into_error)
        })
    }

    /// Run an agent on behalf of another run
    ///
    /// The reply is returned to the caller, not delivered.
    pub fn spawn_subagent(&self, request: AgentRequest) -> CommandHandle<AgentReply, Error> {
        let core = Arc::clone(&self.core);
        self.core
            .queue
            .enqueue(CommandLane::Subagent.as_str(), move |token| {
                run_agent(core, CommandLane::Subagent, request, false, token)
            })
    }

    /// Run until interrupted
    ///
    /// Starts cron and the admin API, reloads configuration on SIGHUP and
    /// shuts everything down on ctrl-c.
    ///
    /// # Errors
    ///
    /// Returns error if the admin API cannot be bound
    pub async fn run(self) -> Result<()> {
        let config = self.config();

        if config.cron.enabled {
            self.core.cron.start().await;
        } else {
            tracing::info!("cron disabled");
        }

        let stop_api = CancellationToken::new();
        let api = if config.api.enabled {
            let server = ApiServer::bind(self.clone(), config.api.port).await?;
            Some(tokio::spawn(server.serve(stop_api.clone())))
        } else {
            None
        };

        tracing::info!(
            bridge_addr = ?self.core.bridge.local_addr(),
            api_port = config.api.enabled.then_some(config.api.port),
            "gateway running"
        );

        self.wait_for_shutdown().await;

        stop_api.cancel();
        if let Some(api) = api {
            match api.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::error!(error = %e, "admin API failed"),
                Err(e) => tracing::error!(error = %e, "admin API task panicked"),
            }
        }
        self.shutdown().await;
        Ok(())
    }

    async fn wait_for_shutdown(&self) {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};

            match signal(SignalKind::hangup()) {
                Ok(mut hangup) => loop {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => break,
                        _ = hangup.recv() => {
                            tracing::info!("SIGHUP received, reloading configuration");
                            if let Err(e) = self.reload_config() {
                                tracing::warn!(error = %e, "configuration reload failed");
                            }
                        }
                    }
                },
                Err(e) => {
                    tracing::warn!(error = %e, "cannot listen for SIGHUP");
                    let _ = tokio::signal::ctrl_c().await;
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        tracing::info!("shutdown requested");
    }

    /// Stop cron and close the bridge
    pub async fn shutdown(&self) {
        self.core.cron.stop().await;
        self.core.bridge.close().await;
        tracing::info!(pending = self.core.queue.total_depth(), "gateway stopped");
    }
}

/// Collapse a nested dispatcher outcome into a gateway error
fn into_error(err: CommandError<Error>) -> Error {
    match err {
        CommandError::Failed(e) => e,
        CommandError::Cancelled => Error::Agent("run cancelled".to_string()),
        CommandError::Aborted(reason) => Error::Agent(format!("run aborted: {reason}")),
    }
}

async fn run_agent(
    core: Arc<Core>,
    lane: CommandLane,
    request: AgentRequest,
    deliver: bool,
    token: CancellationToken,
) -> Result<AgentReply> {
    let run_id = uuid::Uuid::new_v4().to_string();
    let channel = request.channel;
    let chat_id = request.chat_id.clone();
    let account_id = request.account_id.clone();
    let started = Instant::now();

    core.publisher.publish(events::agent_run_started(
        &run_id,
        lane.as_str(),
        channel.as_str(),
        &chat_id,
    ));

    let outcome = tokio::select! {
        biased;
        () = token.cancelled() => Err(Error::Agent("run cancelled".to_string())),
        reply = core.agent.run(request) => reply,
    };
    let outcome = match outcome {
        Ok(reply) if deliver && !reply.text.is_empty() => core
            .channels
            .send_text(channel, &chat_id, &reply.text, account_id.as_deref())
            .await
            .map(|_| reply),
        other => other,
    };

    let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
    let error = outcome.as_ref().err().map(ToString::to_string);
    match &error {
        None => tracing::debug!(run_id = %run_id, lane = %lane, duration_ms, "agent run finished"),
        Some(e) => tracing::warn!(run_id = %run_id, lane = %lane, duration_ms, error = %e, "agent run failed"),
    }
    core.publisher.publish(events::agent_run_finished(
        &run_id,
        lane.as_str(),
        duration_ms,
        error.as_deref(),
    ));
    outcome
}
