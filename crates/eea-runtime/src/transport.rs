//! Bridge between the agent and a publish/subscribe transport
//!
//! The agent never awaits the transport: it queues [`Outbound`] work that
//! [`forward_outbound`] applies to a [`Transport`] on its own task. Concrete
//! clients (MQTT in the `eea-agent` binary, [`MemoryTransport`] in tests) turn
//! broker traffic into [`TransportEvent`]s and feed them to [`pump_events`].

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::agent::AgentHandle;
use super::types::{EeaError, EeaResult, Message, Outbound, OutboundReceiver, QoS};

pub const HELLO_SERVICE: &str = "embeddedWorkflowAgent";

/// Outbound side of a broker connection
#[async_trait]
pub trait Transport: Send + Sync {
    async fn publish(&self, message: Message) -> EeaResult<()>;

    async fn subscribe(&self, topics: &[String], qos: QoS) -> EeaResult<()>;

    async fn disconnect(&self) -> EeaResult<()>;
}

/// Inbound traffic from a transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Connected,
    Disconnected,
    Message { topic: String, payload: Vec<u8> },
}

/// Where an inbound topic goes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// New workflow artifact for the hot-swap path
    Artifact,
    /// Everything else is handed to the guest
    Guest,
}

/// Topic names for one device under a root prefix
#[derive(Debug, Clone)]
pub struct TopicLayout {
    root: String,
    device_id: String,
    extra: Vec<String>,
}

impl TopicLayout {
    pub fn new(root: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            device_id: device_id.into(),
            extra: Vec::new(),
        }
    }

    pub fn with_extra_topics(mut self, topics: impl IntoIterator<Item = String>) -> Self {
        self.extra.extend(topics);
        self
    }

    fn device_topic(&self, suffix: &str) -> String {
        format!("{}/{}/{}", self.root, self.device_id, suffix)
    }

    pub fn hello(&self) -> String {
        self.device_topic("fromAgent/hello")
    }

    pub fn flows(&self) -> String {
        self.device_topic("toAgent/flows")
    }

    pub fn command(&self) -> String {
        self.device_topic("command")
    }

    pub fn to_agent(&self) -> String {
        self.device_topic("toAgent/#")
    }

    /// Topics subscribed on every connect
    pub fn subscriptions(&self) -> Vec<String> {
        let mut topics = vec![self.to_agent(), self.command()];
        topics.extend(self.extra.iter().cloned());
        topics
    }

    pub fn route(&self, topic: &str) -> Route {
        if topic == self.flows() {
            Route::Artifact
        } else {
            Route::Guest
        }
    }
}

/// Compiler options echoed in the hello message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompilerOptions {
    pub trace_level: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub export_memory: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disable_debug_message: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug_symbols: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_size: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gzip: Option<bool>,
}

impl Default for CompilerOptions {
    fn default() -> Self {
        Self {
            trace_level: 1,
            export_memory: None,
            disable_debug_message: None,
            debug_symbols: None,
            stack_size: None,
            gzip: None,
        }
    }
}

/// Capability announcement published on connect and after every swap
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloMessage {
    pub service: String,
    pub version: String,
    pub bundle: String,
    pub compiler_options: CompilerOptions,
}

impl HelloMessage {
    pub fn new(version: impl Into<String>, bundle: impl Into<String>, options: CompilerOptions) -> Self {
        Self {
            service: HELLO_SERVICE.to_string(),
            version: version.into(),
            bundle: bundle.into(),
            compiler_options: options,
        }
    }

    pub fn to_message(&self, layout: &TopicLayout) -> EeaResult<Message> {
        let payload = serde_json::to_string(self)
            .map_err(|e| EeaError::Transport(format!("hello serialization: {}", e)))?;
        Ok(Message::new(layout.hello(), payload, QoS::AtMostOnce))
    }
}

/// Drive the transport from the outbound queue
///
/// Runs until [`Outbound::Disconnect`] is dequeued or every sender is gone.
/// Everything queued ahead of the disconnect is published first.
pub fn forward_outbound(mut outbound: OutboundReceiver, transport: Arc<dyn Transport>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(request) = outbound.recv().await {
            match request {
                Outbound::Publish(message) => {
                    let topic = message.topic.clone();
                    if let Err(e) = transport.publish(message).await {
                        // Best effort; the guest was already told the send succeeded
                        warn!(%topic, error = %e, "Failed to publish message");
                    }
                }
                Outbound::Subscribe { topics, qos } => {
                    if let Err(e) = transport.subscribe(&topics, qos).await {
                        error!(error = %e, "Failed to subscribe");
                    }
                }
                Outbound::Disconnect => {
                    if let Err(e) = transport.disconnect().await {
                        warn!(error = %e, "Transport disconnect failed");
                    }
                    break;
                }
            }
        }
        debug!("Outbound forwarder stopped");
    })
}

/// Hand transport events to the agent until either side goes away
pub async fn pump_events(mut events: mpsc::Receiver<TransportEvent>, agent: AgentHandle) {
    while let Some(event) = events.recv().await {
        if let Err(e) = agent.handle_event(event).await {
            match e {
                EeaError::AgentStopped => break,
                other => error!(error = %other, "Failed to handle transport event"),
            }
        }
    }
    info!("Transport event pump stopped");
}

/// In-process transport that records everything it is asked to do
#[derive(Default)]
pub struct MemoryTransport {
    published: Mutex<Vec<Message>>,
    subscriptions: Mutex<Vec<(String, QoS)>>,
    disconnected: AtomicBool,
    observer: Mutex<Option<mpsc::UnboundedSender<Message>>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Also stream every publish to the returned receiver
    pub fn observed() -> (Self, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Self::default();
        *transport.observer.lock() = Some(tx);
        (transport, rx)
    }

    pub fn published(&self) -> Vec<Message> {
        self.published.lock().clone()
    }

    pub fn subscriptions(&self) -> Vec<(String, QoS)> {
        self.subscriptions.lock().clone()
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn publish(&self, message: Message) -> EeaResult<()> {
        if self.is_disconnected() {
            return Err(EeaError::Transport("disconnected".to_string()));
        }
        if let Some(observer) = self.observer.lock().as_ref() {
            let _ = observer.send(message.clone());
        }
        self.published.lock().push(message);
        Ok(())
    }

    async fn subscribe(&self, topics: &[String], qos: QoS) -> EeaResult<()> {
        self.subscriptions
            .lock()
            .extend(topics.iter().map(|t| (t.clone(), qos)));
        Ok(())
    }

    async fn disconnect(&self) -> EeaResult<()> {
        self.disconnected.store(true, Ordering::SeqCst);
        Ok(())
    }
}
