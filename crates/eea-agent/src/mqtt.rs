//! MQTT transport on top of `rumqttc`
//!
//! The client half implements [`Transport`]; the event loop half runs on its
//! own task and turns broker traffic into [`TransportEvent`]s for the agent.

use async_trait::async_trait;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use eea_runtime::{AgentConfig, EeaError, EeaResult, Message, QoS, Transport, TransportEvent};

/// Client request queue depth
const REQUEST_CAPACITY: usize = 64;
const MAX_INCOMING_PACKET: usize = 262_144;
const MAX_OUTGOING_PACKET: usize = 90_508;
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

fn mqtt_qos(qos: QoS) -> rumqttc::QoS {
    match qos {
        QoS::AtMostOnce => rumqttc::QoS::AtMostOnce,
        QoS::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
        QoS::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
    }
}

fn transport_error(e: rumqttc::ClientError) -> EeaError {
    EeaError::Transport(e.to_string())
}

/// Broker options for the configured device
pub fn options(config: &AgentConfig) -> MqttOptions {
    let mut options = MqttOptions::new(&config.device_id, &config.broker_host, config.broker_port);
    options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));
    options.set_max_packet_size(MAX_INCOMING_PACKET, MAX_OUTGOING_PACKET);

    if let (Some(key), Some(secret)) = (&config.access_key, &config.access_secret) {
        options.set_credentials(key, secret);
    }
    if config.broker_tls {
        options.set_transport(rumqttc::Transport::tls_with_default_config());
    }
    options
}

pub struct MqttTransport {
    client: AsyncClient,
}

impl MqttTransport {
    /// Create the client; nothing is sent until the event loop is polled
    pub fn connect(config: &AgentConfig) -> (Self, EventLoop) {
        info!(
            host = %config.broker_host,
            port = config.broker_port,
            tls = config.broker_tls,
            "Connecting to MQTT broker"
        );
        let (client, event_loop) = AsyncClient::new(options(config), REQUEST_CAPACITY);
        (Self { client }, event_loop)
    }
}

#[async_trait]
impl Transport for MqttTransport {
    async fn publish(&self, message: Message) -> EeaResult<()> {
        self.client
            .publish(
                message.topic,
                mqtt_qos(message.qos),
                false,
                message.payload.into_bytes(),
            )
            .await
            .map_err(transport_error)
    }

    async fn subscribe(&self, topics: &[String], qos: QoS) -> EeaResult<()> {
        for topic in topics {
            debug!(%topic, "Subscribing");
            self.client
                .subscribe(topic.as_str(), mqtt_qos(qos))
                .await
                .map_err(transport_error)?;
        }
        Ok(())
    }

    async fn disconnect(&self) -> EeaResult<()> {
        self.client.disconnect().await.map_err(transport_error)
    }
}

/// Poll the broker connection until the client's disconnect goes out
///
/// Polling continues after the agent stops listening so queued publishes
/// still reach the broker. `rumqttc` reconnects on the next poll after an
/// error, so errors only report a disconnect and back off briefly.
pub fn spawn_event_loop(
    mut event_loop: EventLoop,
    events: mpsc::Sender<TransportEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let event = match event_loop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    if ack.code == ConnectReturnCode::Success {
                        info!("MQTT connected");
                        TransportEvent::Connected
                    } else {
                        warn!(code = ?ack.code, "MQTT connection refused");
                        TransportEvent::Disconnected
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => TransportEvent::Message {
                    topic: publish.topic,
                    payload: publish.payload.to_vec(),
                },
                Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                    info!("MQTT disconnected");
                    break;
                }
                Ok(_) => continue,
                Err(e) => {
                    warn!(error = %e, "MQTT connection error");
                    let _ = events.send(TransportEvent::Disconnected).await;
                    tokio::time::sleep(RECONNECT_DELAY).await;
                    continue;
                }
            };

            if events.send(event).await.is_err() {
                debug!("Agent no longer listening; dropping broker event");
            }
        }
        debug!("MQTT event loop stopped");
    })
}
