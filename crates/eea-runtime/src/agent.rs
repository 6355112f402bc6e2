//! Execution pump and hot-swap coordinator
//!
//! [`EdgeAgent`] is a single task that owns the active [`ModuleInstance`].
//! Timer ticks, inbound transport traffic, direct triggers and artifact swaps
//! are all handled on that task one at a time, so no guest export is ever
//! entered while another is still running and only one swap is ever in flight.
//! Other tasks talk to it through a cloneable [`AgentHandle`]. Transport work
//! (subscriptions, hello, disconnect) is queued on the outbound channel behind
//! any guest messages and never awaited here.

use serde::Serialize;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::artifact::{ModuleArtifact, NULL_BUNDLE};
use super::instance::{InstanceState, ModuleInstance};
use super::runtime::EeaRuntime;
use super::storage::ArtifactStore;
use super::transport::{CompilerOptions, HelloMessage, Route, TopicLayout, TransportEvent};
use super::types::{EeaError, EeaResult, Outbound, OutboundSender, QoS};

/// Agent behaviour that is not part of the instance configuration
#[derive(Debug, Clone)]
pub struct AgentOptions {
    pub layout: TopicLayout,
    /// Cadence of `eea_loop`
    pub loop_interval: Duration,
    /// Reported as `version` in the hello message
    pub agent_version: String,
    pub compiler_options: CompilerOptions,
    /// Bound of the command queue
    pub command_capacity: usize,
}

impl AgentOptions {
    pub fn new(layout: TopicLayout) -> Self {
        Self {
            layout,
            loop_interval: Duration::from_millis(1000),
            agent_version: "1.0.0".to_string(),
            compiler_options: CompilerOptions::default(),
            command_capacity: 64,
        }
    }
}

/// Snapshot returned by [`AgentHandle::info`]
#[derive(Debug, Clone, Serialize)]
pub struct AgentInfo {
    pub device_id: String,
    pub bundle: String,
    pub state: Option<String>,
    pub connected: bool,
    pub loop_interval_ms: u64,
    pub ticks: u64,
    pub instances_created: u64,
    pub rejected_candidates: u64,
}

enum AgentCommand {
    Event(TransportEvent),
    LoadArtifact {
        bytes: Vec<u8>,
        reply: oneshot::Sender<EeaResult<String>>,
    },
    DirectTrigger {
        trigger_id: String,
        payload: String,
        reply: oneshot::Sender<EeaResult<()>>,
    },
    Info(oneshot::Sender<AgentInfo>),
    Shutdown(oneshot::Sender<()>),
}

/// Cloneable front door to a running [`EdgeAgent`]
#[derive(Clone)]
pub struct AgentHandle {
    commands: mpsc::Sender<AgentCommand>,
}

impl AgentHandle {
    async fn send(&self, command: AgentCommand) -> EeaResult<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| EeaError::AgentStopped)
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> AgentCommand,
    ) -> EeaResult<T> {
        let (tx, rx) = oneshot::channel();
        self.send(build(tx)).await?;
        rx.await.map_err(|_| EeaError::AgentStopped)
    }

    /// Queue a transport event; connection changes and routing happen on the agent task
    pub async fn handle_event(&self, event: TransportEvent) -> EeaResult<()> {
        self.send(AgentCommand::Event(event)).await
    }

    pub async fn message_received(
        &self,
        topic: impl Into<String>,
        payload: impl Into<Vec<u8>>,
    ) -> EeaResult<()> {
        self.handle_event(TransportEvent::Message {
            topic: topic.into(),
            payload: payload.into(),
        })
        .await
    }

    pub async fn set_connection_status(&self, connected: bool) -> EeaResult<()> {
        let event = if connected {
            TransportEvent::Connected
        } else {
            TransportEvent::Disconnected
        };
        self.handle_event(event).await
    }

    /// Swap in a new artifact; resolves to its bundle identifier
    pub async fn load_artifact(&self, bytes: impl Into<Vec<u8>>) -> EeaResult<String> {
        let bytes = bytes.into();
        self.request(|reply| AgentCommand::LoadArtifact { bytes, reply })
            .await?
    }

    pub async fn direct_trigger(
        &self,
        trigger_id: impl Into<String>,
        payload: impl Into<String>,
    ) -> EeaResult<()> {
        let trigger_id = trigger_id.into();
        let payload = payload.into();
        self.request(|reply| AgentCommand::DirectTrigger {
            trigger_id,
            payload,
            reply,
        })
        .await?
    }

    pub async fn info(&self) -> EeaResult<AgentInfo> {
        self.request(AgentCommand::Info).await
    }

    /// Shut the guest down, disconnect the transport and stop the agent task
    pub async fn shutdown(&self) -> EeaResult<()> {
        self.request(AgentCommand::Shutdown).await
    }
}

pub struct EdgeAgent {
    runtime: EeaRuntime,
    active: Option<ModuleInstance>,
    connected: bool,
    outbound: OutboundSender,
    artifacts: Option<ArtifactStore>,
    options: AgentOptions,
    commands: mpsc::Receiver<AgentCommand>,
    ticks: u64,
    rejected: u64,
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

impl EdgeAgent {
    pub fn new(
        runtime: EeaRuntime,
        artifacts: Option<ArtifactStore>,
        options: AgentOptions,
    ) -> (Self, AgentHandle) {
        let (tx, rx) = mpsc::channel(options.command_capacity.max(1));
        let outbound = runtime.outbound();
        let agent = Self {
            runtime,
            active: None,
            connected: false,
            outbound,
            artifacts,
            options,
            commands: rx,
            ticks: 0,
            rejected: 0,
        };
        (agent, AgentHandle { commands: tx })
    }

    /// Run the agent on its own task
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Load the persisted artifact, then pump until shutdown
    pub async fn run(mut self) {
        self.load_persisted().await;

        let mut interval = tokio::time::interval(self.options.loop_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            device_id = %self.runtime.device_id(),
            interval_ms = self.options.loop_interval.as_millis() as u64,
            "Edge agent started"
        );

        loop {
            tokio::select! {
                _ = interval.tick() => self.tick(),
                command = self.commands.recv() => match command {
                    Some(AgentCommand::Shutdown(reply)) => {
                        self.stop();
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle(command).await,
                    None => {
                        self.stop();
                        break;
                    }
                },
            }
        }

        info!("Edge agent stopped");
    }

    async fn load_persisted(&mut self) {
        let Some(store) = &self.artifacts else {
            return;
        };

        match store.load().await {
            Ok(Some(bytes)) => {
                if let Err(e) = self.swap(bytes, false).await {
                    warn!(error = %e, "Persisted artifact could not be loaded");
                }
            }
            Ok(None) => {}
            Err(e) => error!(error = %e, "Failed to read persisted artifact"),
        }
    }

    fn tick(&mut self) {
        let Some(instance) = self.active.as_mut() else {
            return;
        };
        if instance.state() != InstanceState::Running {
            return;
        }

        self.ticks += 1;
        if let Err(e) = instance.tick(now_ms()) {
            error!(error = %e, "eea_loop failed");
        }
    }

    async fn handle(&mut self, command: AgentCommand) {
        match command {
            AgentCommand::Event(event) => self.on_event(event).await,
            AgentCommand::LoadArtifact { bytes, reply } => {
                let _ = reply.send(self.swap(bytes, true).await);
            }
            AgentCommand::DirectTrigger {
                trigger_id,
                payload,
                reply,
            } => {
                let _ = reply.send(self.direct_trigger(&trigger_id, &payload));
            }
            AgentCommand::Info(reply) => {
                let _ = reply.send(self.info());
            }
            // Handled by the run loop
            AgentCommand::Shutdown(reply) => {
                let _ = reply.send(());
            }
        }
    }

    async fn on_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected => self.on_connection(true),
            TransportEvent::Disconnected => self.on_connection(false),
            TransportEvent::Message { topic, payload } => match self.options.layout.route(&topic) {
                Route::Artifact => {
                    info!(bytes = payload.len(), "Received new workflow artifact");
                    // Outcome is already logged by swap
                    let _ = self.swap(payload, true).await;
                }
                Route::Guest => {
                    let payload = String::from_utf8_lossy(&payload);
                    self.deliver(&topic, &payload);
                }
            },
        }
    }

    fn on_connection(&mut self, connected: bool) {
        let changed = self.connected != connected;
        self.connected = connected;
        if changed {
            info!(connected, "Connection status changed");
        }

        if let Some(instance) = self.active.as_mut() {
            if let Err(e) = instance.set_connection_status(connected) {
                error!(error = %e, "Failed to update guest connection status");
            }
        }

        if connected {
            self.queue(Outbound::Subscribe {
                topics: self.options.layout.subscriptions(),
                qos: QoS::AtLeastOnce,
            });
            self.send_hello();
        }
    }

    fn deliver(&mut self, topic: &str, payload: &str) {
        let Some(instance) = self.active.as_mut() else {
            debug!(%topic, "No workflow loaded; dropping message");
            return;
        };

        match instance.deliver_message(topic, payload) {
            Ok(()) => debug!(%topic, "Message delivered to guest"),
            Err(EeaError::BuffersNotNegotiated) => {
                warn!(%topic, "Guest has not set message buffers; dropping message")
            }
            Err(e) => error!(%topic, error = %e, "Failed to deliver message"),
        }
    }

    fn direct_trigger(&mut self, trigger_id: &str, payload: &str) -> EeaResult<()> {
        let instance = self
            .active
            .as_mut()
            .ok_or_else(|| EeaError::InvalidState("no workflow loaded".to_string()))?;
        instance.direct_trigger(trigger_id, payload)
    }

    /// Replace the active instance with one built from `bytes`
    ///
    /// The candidate is validated and instantiated first; any failure there
    /// leaves the current instance running untouched.
    async fn swap(&mut self, bytes: Vec<u8>, persist: bool) -> EeaResult<String> {
        let candidate = ModuleArtifact::parse(bytes)
            .and_then(|artifact| {
                let instance = self.runtime.instantiate(&artifact, self.connected)?;
                Ok((artifact, instance))
            });

        let (artifact, candidate) = match candidate {
            Ok(pair) => pair,
            Err(e) => {
                self.rejected += 1;
                if e.is_candidate_rejection() {
                    warn!(error = %e, "Rejected workflow artifact");
                } else {
                    error!(error = %e, "Failed to load workflow artifact");
                }
                return Err(e);
            }
        };

        // Promote, then retire the previous instance so its final save
        // lands before the candidate's init reads storage
        if let Some(mut previous) = self.active.replace(candidate) {
            if let Err(e) = previous.shutdown() {
                error!(bundle = %previous.bundle_identifier(), error = %e, "Previous instance shutdown failed");
            }
        }

        let connected = self.connected;
        if let Some(active) = self.active.as_mut() {
            if let Err(e) = active.start() {
                error!(error = %e, "eea_init failed");
            }
            if let Err(e) = active.set_connection_status(connected) {
                error!(error = %e, "Failed to announce connection status");
            }
        }

        if persist {
            if let Some(store) = &self.artifacts {
                if let Err(e) = store.save(artifact.raw()).await {
                    error!(error = %e, "Failed to persist workflow artifact");
                }
            }
        }

        info!(bundle = %artifact.bundle_identifier, "Workflow artifact loaded");
        self.send_hello();
        Ok(artifact.bundle_identifier)
    }

    fn bundle(&self) -> &str {
        self.active
            .as_ref()
            .map(|instance| instance.bundle_identifier())
            .unwrap_or(NULL_BUNDLE)
    }

    fn queue(&self, request: Outbound) {
        if self.outbound.send(request).is_err() {
            warn!("Outbound forwarder is gone; dropping transport request");
        }
    }

    fn send_hello(&self) {
        let hello = HelloMessage::new(
            self.options.agent_version.clone(),
            self.bundle(),
            self.options.compiler_options.clone(),
        );

        match hello.to_message(&self.options.layout) {
            Ok(message) => {
                debug!(bundle = %hello.bundle, "Hello queued");
                self.queue(Outbound::Publish(message));
            }
            Err(e) => warn!(error = %e, "Failed to build hello"),
        }
    }

    fn info(&self) -> AgentInfo {
        let stats = self.runtime.stats();
        AgentInfo {
            device_id: self.runtime.device_id().to_string(),
            bundle: self.bundle().to_string(),
            state: self.active.as_ref().map(|i| i.state().to_string()),
            connected: self.connected,
            loop_interval_ms: self.options.loop_interval.as_millis() as u64,
            ticks: self.ticks,
            instances_created: stats.instances_created,
            rejected_candidates: self.rejected,
        }
    }

    /// Shut the guest down; its last messages are flushed before the disconnect
    fn stop(&mut self) {
        if let Some(mut instance) = self.active.take() {
            if let Err(e) = instance.shutdown() {
                error!(error = %e, "Guest shutdown failed");
            }
        }
        self.queue(Outbound::Disconnect);
    }
}
