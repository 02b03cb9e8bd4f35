//! Broker registrations and the live session of each broker.
//!
//! Every session walks `Disconnected -> Connecting -> {Connected, Failed}`;
//! a connected session drops back to `Disconnected` when the collaborator
//! reports the connection gone or the operator disconnects it. Inbound
//! traffic and state changes leave the manager as [`SessionEvent`]s.

use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rumqttc::QoS;
use time::OffsetDateTime;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::SessionError;
use crate::models::{BrokerConfig, SessionState, WILDCARD_FILTER};
use crate::mqtt_service::{ClientEvent, MqttConnector, SessionClient, SessionEvents};
use crate::topic_tree::SharedTrees;

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged { broker: String, state: SessionState },
    Message(InboundMessage),
}

#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub broker: String,
    pub topic: String,
    pub payload: String,
    pub qos: QoS,
    pub retain: bool,
    /// Some bytes were not valid UTF-8 and got replaced.
    pub degraded: bool,
}

/// Why a receive loop returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenOutcome {
    Cancelled,
    ConnectionLost(Option<String>),
}

/// Decodes a payload as text, replacing invalid byte sequences.
pub fn decode_payload(raw: &[u8]) -> (String, bool) {
    match String::from_utf8_lossy(raw) {
        Cow::Borrowed(text) => (text.to_string(), false),
        Cow::Owned(text) => (text, true),
    }
}

/// Client identifier unique per connect attempt.
pub fn client_id_for(broker: &str) -> String {
    format!(
        "mqtt-explorer-{}-{}",
        broker,
        OffsetDateTime::now_utc().unix_timestamp_nanos()
    )
}

struct BrokerSession {
    state: SessionState,
    attempt: u64,
    client: Option<Arc<dyn SessionClient>>,
    events: Option<Box<dyn SessionEvents>>,
    cancel: CancellationToken,
}

pub struct BrokerSessionManager {
    connector: Arc<dyn MqttConnector>,
    configs: Mutex<HashMap<String, BrokerConfig>>,
    sessions: Mutex<HashMap<String, BrokerSession>>,
    /// Per-broker operator stop signal. Outlives connect attempts; replaced
    /// after every operator disconnect.
    stops: Mutex<HashMap<String, CancellationToken>>,
    trees: SharedTrees,
    events: mpsc::UnboundedSender<SessionEvent>,
    attempts: AtomicU64,
}

impl BrokerSessionManager {
    pub fn new(
        connector: Arc<dyn MqttConnector>,
        trees: SharedTrees,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        Self {
            connector,
            configs: Mutex::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
            stops: Mutex::new(HashMap::new()),
            trees,
            events,
            attempts: AtomicU64::new(0),
        }
    }

    /// Registers a broker. A name can only be registered once.
    pub async fn register_config(
        &self,
        name: &str,
        host: &str,
        port: u16,
    ) -> Result<(), SessionError> {
        let mut configs = self.configs.lock().await;
        if configs.contains_key(name) {
            return Err(SessionError::DuplicateName(name.to_string()));
        }

        configs.insert(name.to_string(), BrokerConfig::new(name, host, port));
        self.stops
            .lock()
            .await
            .insert(name.to_string(), CancellationToken::new());
        info!("Registered broker '{}' at {}:{}.", name, host, port);
        Ok(())
    }

    /// Disconnects the broker if needed and forgets its config, session and topics.
    pub async fn remove_broker(&self, name: &str) -> Result<(), SessionError> {
        if self.configs.lock().await.remove(name).is_none() {
            return Err(SessionError::UnknownBroker(name.to_string()));
        }

        if let Some(stop) = self.stops.lock().await.remove(name) {
            stop.cancel();
        }
        let session = self.sessions.lock().await.remove(name);
        if let Some(session) = session {
            session.cancel.cancel();
            if let Some(client) = session.client {
                if let Err(e) = client.disconnect().await {
                    debug!("Disconnect of removed broker '{}' not flushed: {}", name, e);
                }
            }
        }

        self.trees.lock().await.remove(name);
        info!("Removed broker '{}'.", name);
        Ok(())
    }

    /// Cancelled by the next operator disconnect or removal of `name`.
    /// Supervisors hold on to it across reconnect attempts.
    pub async fn stop_signal(&self, name: &str) -> Result<CancellationToken, SessionError> {
        self.stops
            .lock()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| SessionError::UnknownBroker(name.to_string()))
    }

    pub async fn config(&self, name: &str) -> Option<BrokerConfig> {
        self.configs.lock().await.get(name).cloned()
    }

    /// Registered broker names, sorted.
    pub async fn broker_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.configs.lock().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn state(&self, name: &str) -> Option<SessionState> {
        self.sessions
            .lock()
            .await
            .get(name)
            .map(|session| session.state.clone())
    }

    /// Opens a session, completes the handshake and subscribes to every topic.
    ///
    /// A failed attempt leaves the session in `Failed` and is reported back as
    /// `ConnectionFailed`.
    pub async fn connect(&self, name: &str) -> Result<(), SessionError> {
        let config = self
            .config(name)
            .await
            .ok_or_else(|| SessionError::UnknownBroker(name.to_string()))?;
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;

        {
            let mut sessions = self.sessions.lock().await;
            if let Some(existing) = sessions.get(name) {
                if existing.state.is_active() {
                    return Err(SessionError::AlreadyConnected(name.to_string()));
                }
                existing.cancel.cancel();
            }
            sessions.insert(
                name.to_string(),
                BrokerSession {
                    state: SessionState::Connecting,
                    attempt,
                    client: None,
                    events: None,
                    cancel: CancellationToken::new(),
                },
            );
        }
        self.trees.lock().await.entry(name.to_string()).or_default();
        self.emit_state(name, SessionState::Connecting);

        info!("Connecting to broker '{}' at {}...", name, config.address());
        let client_id = client_id_for(name);
        let (client, events) = match self.connector.connect(&client_id, &config).await {
            Ok(connection) => connection,
            Err(e) => {
                error!("Failed to connect to broker '{}': {}", name, e);
                return Err(self.fail(name, attempt, e.to_string()).await);
            }
        };

        let current = {
            let mut sessions = self.sessions.lock().await;
            match sessions.get_mut(name) {
                Some(session)
                    if session.attempt == attempt && session.state == SessionState::Connecting =>
                {
                    session.state = SessionState::Connected;
                    session.client = Some(client.clone());
                    session.events = Some(events);
                    true
                }
                _ => false,
            }
        };
        if !current {
            warn!("Connection attempt to broker '{}' was cancelled.", name);
            let _ = client.disconnect().await;
            return Err(SessionError::ConnectionFailed {
                broker: name.to_string(),
                reason: "connection attempt was cancelled".to_string(),
            });
        }
        self.emit_state(name, SessionState::Connected);

        if let Err(e) = client.subscribe(WILDCARD_FILTER).await {
            error!("Failed to subscribe to '{}' on '{}': {}", WILDCARD_FILTER, name, e);
            return Err(self.fail(name, attempt, e.to_string()).await);
        }
        info!("Successfully subscribed to topic '{}' on '{}'.", WILDCARD_FILTER, name);
        Ok(())
    }

    /// Runs the receive loop of a connected session until it is cancelled or
    /// the connection goes away.
    pub async fn listen(&self, name: &str) -> Result<ListenOutcome, SessionError> {
        let (mut events, cancel, attempt) = {
            let mut sessions = self.sessions.lock().await;
            let session = sessions
                .get_mut(name)
                .ok_or_else(|| SessionError::UnknownBroker(name.to_string()))?;
            let events = session
                .events
                .take()
                .ok_or_else(|| SessionError::BrokerNotConnected(name.to_string()))?;
            (events, session.cancel.clone(), session.attempt)
        };

        debug!("Listening for messages from '{}'.", name);
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Receive loop of '{}' cancelled.", name);
                    return Ok(ListenOutcome::Cancelled);
                }
                next = events.next_event() => next,
            };

            match next {
                Ok(ClientEvent::Connected) => self.on_connect(name).await,
                Ok(ClientEvent::Message {
                    topic,
                    payload,
                    qos,
                    retain,
                }) => self.on_message(name, &topic, &payload, qos, retain),
                Ok(ClientEvent::Disconnected { reason }) => {
                    self.lost(name, attempt, reason.as_deref()).await;
                    return Ok(ListenOutcome::ConnectionLost(reason));
                }
                Err(e) => {
                    let reason = e.to_string();
                    self.lost(name, attempt, Some(&reason)).await;
                    return Ok(ListenOutcome::ConnectionLost(Some(reason)));
                }
            }
        }
    }

    /// Closes the session of `name`. Its topics stay queryable.
    pub async fn disconnect(&self, name: &str) -> Result<(), SessionError> {
        // Stop supervisors first so none reconnects once the session is closed.
        if let Some(stop) = self.stops.lock().await.get_mut(name) {
            std::mem::replace(stop, CancellationToken::new()).cancel();
        }
        let closed = {
            let mut sessions = self.sessions.lock().await;
            sessions.get_mut(name).map(|session| {
                session.cancel.cancel();
                session.events = None;
                session.state = SessionState::Disconnected;
                session.client.take()
            })
        };
        let Some(client) = closed else {
            return Err(if self.configs.lock().await.contains_key(name) {
                SessionError::BrokerNotConnected(name.to_string())
            } else {
                SessionError::UnknownBroker(name.to_string())
            });
        };
        self.emit_state(name, SessionState::Disconnected);

        // The receive loop is gone, so the DISCONNECT packet is best effort.
        if let Some(client) = client {
            if let Err(e) = client.disconnect().await {
                debug!("Disconnect from '{}' not flushed: {}", name, e);
            }
        }
        info!("Disconnected from broker '{}'.", name);
        Ok(())
    }

    /// Closes every session.
    pub async fn disconnect_all(&self) {
        let names: Vec<String> = self.sessions.lock().await.keys().cloned().collect();
        for name in names {
            if let Err(e) = self.disconnect(&name).await {
                debug!("Skipping '{}': {}", name, e);
            }
        }
    }

    /// Publish handle of a connected session.
    pub async fn publisher(&self, name: &str) -> Result<Arc<dyn SessionClient>, SessionError> {
        let sessions = self.sessions.lock().await;
        sessions
            .get(name)
            .filter(|session| session.state == SessionState::Connected)
            .and_then(|session| session.client.clone())
            .ok_or_else(|| SessionError::BrokerNotConnected(name.to_string()))
    }

    /// The collaborator (re)established the connection. Only a session that
    /// still holds its client and was connected, or lost its connection, is
    /// brought back; `Connecting`, `Failed` and operator-closed sessions wait
    /// for an explicit `connect`.
    pub async fn on_connect(&self, name: &str) {
        let client = {
            let mut sessions = self.sessions.lock().await;
            let Some(session) = sessions.get_mut(name) else {
                return;
            };
            let resumable = matches!(
                session.state,
                SessionState::Connected | SessionState::Disconnected
            );
            let Some(client) = session.client.clone().filter(|_| resumable) else {
                debug!("Ignoring connect notification for '{}' in state {}.", name, session.state);
                return;
            };
            session.state = SessionState::Connected;
            client
        };
        self.emit_state(name, SessionState::Connected);
        info!("Connected to broker '{}'.", name);

        match client.subscribe(WILDCARD_FILTER).await {
            Ok(()) => info!("Successfully subscribed to topic '{}' on '{}'.", WILDCARD_FILTER, name),
            Err(e) => error!("Failed to subscribe to '{}' on '{}': {}", WILDCARD_FILTER, name, e),
        }
    }

    /// The collaborator reported the connection closed. Only a connected
    /// session moves to `Disconnected`.
    pub async fn on_disconnect(&self, name: &str) {
        self.lost_if(name, None, None).await;
    }

    /// The collaborator delivered a message.
    pub fn on_message(&self, name: &str, topic: &str, raw: &[u8], qos: QoS, retain: bool) {
        let (payload, degraded) = decode_payload(raw);
        if degraded {
            warn!("Payload on '{}' from '{}' is not valid UTF-8; invalid bytes replaced.", topic, name);
        }
        debug!("Message from '{}' on '{}' ({} bytes).", name, topic, raw.len());

        self.emit(SessionEvent::Message(InboundMessage {
            broker: name.to_string(),
            topic: topic.to_string(),
            payload,
            qos,
            retain,
            degraded,
        }));
    }

    /// Latest payload of `topic` on `broker`, absent while nothing arrived.
    pub async fn lookup(&self, broker: &str, topic: &str) -> Option<String> {
        let trees = self.trees.lock().await;
        trees
            .get(broker)
            .and_then(|tree| tree.lookup(topic))
            .map(str::to_string)
    }

    pub async fn topic_count(&self, broker: &str) -> usize {
        self.trees.lock().await.get(broker).map_or(0, |tree| tree.len())
    }

    pub async fn outline(&self, broker: &str) -> Option<String> {
        self.trees.lock().await.get(broker).map(|tree| tree.outline())
    }

    pub fn trees(&self) -> SharedTrees {
        self.trees.clone()
    }

    async fn lost(&self, name: &str, attempt: u64, reason: Option<&str>) {
        self.lost_if(name, Some(attempt), reason).await;
    }

    async fn lost_if(&self, name: &str, attempt: Option<u64>, reason: Option<&str>) {
        {
            let mut sessions = self.sessions.lock().await;
            let Some(session) = sessions.get_mut(name) else {
                return;
            };
            if attempt.is_some_and(|attempt| attempt != session.attempt)
                || session.state != SessionState::Connected
            {
                return;
            }
            session.state = SessionState::Disconnected;
        }
        self.emit_state(name, SessionState::Disconnected);
        warn!(
            "Lost connection to broker '{}': {}",
            name,
            reason.unwrap_or("connection closed")
        );
    }

    async fn fail(&self, name: &str, attempt: u64, reason: String) -> SessionError {
        let updated = {
            let mut sessions = self.sessions.lock().await;
            match sessions.get_mut(name) {
                Some(session) if session.attempt == attempt && session.state.is_active() => {
                    session.state = SessionState::Failed(reason.clone());
                    session.client = None;
                    session.events = None;
                    true
                }
                _ => false,
            }
        };
        if updated {
            self.emit_state(name, SessionState::Failed(reason.clone()));
        }

        SessionError::ConnectionFailed {
            broker: name.to_string(),
            reason,
        }
    }

    fn emit_state(&self, name: &str, state: SessionState) {
        self.emit(SessionEvent::StateChanged {
            broker: name.to_string(),
            state,
        });
    }

    fn emit(&self, event: SessionEvent) {
        if self.events.send(event).is_err() {
            debug!("No consumer for session events.");
        }
    }
}
