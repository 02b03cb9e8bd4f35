//! MQTT client collaborator.
//!
//! Sessions only talk to brokers through [`MqttConnector`], [`SessionClient`]
//! and [`SessionEvents`]. [`RumqttConnector`] implements them on top of
//! rumqttc's `AsyncClient` and `EventLoop`.

use std::sync::Arc;

use async_trait::async_trait;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Packet, QoS};
use tokio::time::{timeout, Duration};
use tracing::{debug, info};

use crate::error::TransportError;
use crate::models::BrokerConfig;

/// Notification produced by a live connection.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Connected,
    Message {
        topic: String,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    },
    Disconnected {
        reason: Option<String>,
    },
}

#[async_trait]
pub trait SessionClient: Send + Sync {
    async fn subscribe(&self, filter: &str) -> Result<(), TransportError>;

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError>;

    async fn disconnect(&self) -> Result<(), TransportError>;
}

#[async_trait]
pub trait SessionEvents: Send {
    /// Waits for the next notification of the connection.
    async fn next_event(&mut self) -> Result<ClientEvent, TransportError>;
}

#[async_trait]
pub trait MqttConnector: Send + Sync {
    /// Opens a connection and completes the handshake.
    async fn connect(
        &self,
        client_id: &str,
        config: &BrokerConfig,
    ) -> Result<(Arc<dyn SessionClient>, Box<dyn SessionEvents>), TransportError>;
}

#[derive(Debug, Clone)]
pub struct RumqttConnector {
    keep_alive: Duration,
    connect_timeout: Duration,
    channel_capacity: usize,
}

impl Default for RumqttConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(10), Duration::from_secs(5))
    }
}

impl RumqttConnector {
    pub fn new(keep_alive: Duration, connect_timeout: Duration) -> Self {
        Self {
            keep_alive,
            connect_timeout,
            channel_capacity: 10,
        }
    }
}

#[async_trait]
impl MqttConnector for RumqttConnector {
    async fn connect(
        &self,
        client_id: &str,
        config: &BrokerConfig,
    ) -> Result<(Arc<dyn SessionClient>, Box<dyn SessionEvents>), TransportError> {
        debug!("Configuring MQTT broker at {}...", config.address());

        let mut mqtt_options = MqttOptions::new(client_id, config.host.clone(), config.port);
        mqtt_options.set_keep_alive(self.keep_alive);
        mqtt_options.set_clean_session(true);

        let (client, mut eventloop) = AsyncClient::new(mqtt_options, self.channel_capacity);

        let handshake = async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                        return if ack.code == ConnectReturnCode::Success {
                            Ok(())
                        } else {
                            Err(TransportError::Refused(format!("{:?}", ack.code)))
                        };
                    }
                    Ok(event) => debug!("Event before CONNACK: {:?}", event),
                    Err(e) => return Err(TransportError::Connection(e.to_string())),
                }
            }
        };

        timeout(self.connect_timeout, handshake)
            .await
            .map_err(|_| TransportError::Timeout(millis(self.connect_timeout)))??;

        info!("Connected to MQTT broker at {}.", config.address());
        let client: Arc<dyn SessionClient> = Arc::new(RumqttClient { client });
        let events: Box<dyn SessionEvents> = Box::new(RumqttEvents { eventloop });
        Ok((client, events))
    }
}

/// Whole milliseconds of `duration`, saturating at `u64::MAX`.
fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

pub struct RumqttClient {
    client: AsyncClient,
}

#[async_trait]
impl SessionClient for RumqttClient {
    async fn subscribe(&self, filter: &str) -> Result<(), TransportError> {
        self.client
            .subscribe(filter, QoS::AtMostOnce)
            .await
            .map_err(|e| TransportError::Request(e.to_string()))
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        self.client
            .publish(topic, QoS::AtMostOnce, false, payload)
            .await
            .map_err(|e| TransportError::Request(e.to_string()))
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.client
            .disconnect()
            .await
            .map_err(|e| TransportError::Request(e.to_string()))
    }
}

pub struct RumqttEvents {
    eventloop: EventLoop,
}

#[async_trait]
impl SessionEvents for RumqttEvents {
    async fn next_event(&mut self) -> Result<ClientEvent, TransportError> {
        loop {
            match self.eventloop.poll().await {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    return Ok(ClientEvent::Message {
                        topic: publish.topic,
                        payload: publish.payload.to_vec(),
                        qos: publish.qos,
                        retain: publish.retain,
                    });
                }
                Ok(Event::Incoming(Packet::ConnAck(_))) => return Ok(ClientEvent::Connected),
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    return Ok(ClientEvent::Disconnected {
                        reason: Some("broker sent DISCONNECT".to_string()),
                    });
                }
                Ok(Event::Outgoing(outgoing)) => debug!("Outgoing event: {:?}", outgoing),
                Ok(event) => debug!("Unhandled event: {:?}", event),
                Err(e) => {
                    return Ok(ClientEvent::Disconnected {
                        reason: Some(e.to_string()),
                    });
                }
            }
        }
    }
}
