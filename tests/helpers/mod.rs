#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use mqtt_explorer::error::TransportError;
use mqtt_explorer::ingest::MessageIngestPipeline;
use mqtt_explorer::models::BrokerConfig;
use mqtt_explorer::mqtt_service::{ClientEvent, MqttConnector, SessionClient, SessionEvents};
use mqtt_explorer::session_manager::BrokerSessionManager;
use rumqttc::QoS;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration, Instant};

#[derive(Default)]
pub struct FakeClient {
    pub subscriptions: StdMutex<Vec<String>>,
    pub published: StdMutex<Vec<(String, Vec<u8>)>>,
    pub disconnected: AtomicBool,
}

#[async_trait]
impl SessionClient for FakeClient {
    async fn subscribe(&self, filter: &str) -> Result<(), TransportError> {
        self.subscriptions.lock().unwrap().push(filter.to_string());
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        self.published
            .lock()
            .unwrap()
            .push((topic.to_string(), payload));
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.disconnected.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct FakeEvents {
    rx: mpsc::UnboundedReceiver<ClientEvent>,
}

#[async_trait]
impl SessionEvents for FakeEvents {
    async fn next_event(&mut self) -> Result<ClientEvent, TransportError> {
        match self.rx.recv().await {
            Some(event) => Ok(event),
            None => Err(TransportError::Connection("connection reset".to_string())),
        }
    }
}

/// One connection opened through the fake connector.
#[derive(Clone)]
pub struct FakeConnection {
    pub client_id: String,
    pub client: Arc<FakeClient>,
    events: mpsc::UnboundedSender<ClientEvent>,
}

impl FakeConnection {
    /// Delivers a message as if another client published it.
    pub fn publish(&self, topic: &str, payload: &[u8]) {
        self.events
            .send(ClientEvent::Message {
                topic: topic.to_string(),
                payload: payload.to_vec(),
                qos: QoS::AtMostOnce,
                retain: false,
            })
            .unwrap();
    }

    pub fn drop_connection(&self, reason: &str) {
        self.events
            .send(ClientEvent::Disconnected {
                reason: Some(reason.to_string()),
            })
            .unwrap();
    }
}

#[derive(Default)]
pub struct FakeConnector {
    unreachable: StdMutex<HashSet<String>>,
    held: AtomicBool,
    release: Notify,
    connections: StdMutex<HashMap<String, Vec<FakeConnection>>>,
}

impl FakeConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_unreachable(&self, host: &str) {
        self.unreachable.lock().unwrap().insert(host.to_string());
    }

    /// Connect attempts block until [`FakeConnector::release`].
    pub fn hold_connects(&self) {
        self.held.store(true, Ordering::SeqCst);
    }

    pub fn release(&self) {
        self.held.store(false, Ordering::SeqCst);
        self.release.notify_waiters();
    }

    /// Latest connection opened to `broker`.
    pub fn connection(&self, broker: &str) -> FakeConnection {
        self.connections.lock().unwrap()[broker]
            .last()
            .cloned()
            .unwrap()
    }

    pub fn connect_count(&self, broker: &str) -> usize {
        self.connections
            .lock()
            .unwrap()
            .get(broker)
            .map_or(0, Vec::len)
    }
}

#[async_trait]
impl MqttConnector for FakeConnector {
    async fn connect(
        &self,
        client_id: &str,
        config: &BrokerConfig,
    ) -> Result<(Arc<dyn SessionClient>, Box<dyn SessionEvents>), TransportError> {
        let released = self.release.notified();
        if self.held.load(Ordering::SeqCst) {
            released.await;
        }
        if self.unreachable.lock().unwrap().contains(&config.host) {
            return Err(TransportError::Connection("connection refused".to_string()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let client = Arc::new(FakeClient::default());
        self.connections
            .lock()
            .unwrap()
            .entry(config.name.clone())
            .or_default()
            .push(FakeConnection {
                client_id: client_id.to_string(),
                client: client.clone(),
                events: tx,
            });

        let shared: Arc<dyn SessionClient> = client;
        let events: Box<dyn SessionEvents> = Box::new(FakeEvents { rx });
        Ok((shared, events))
    }
}

pub struct Harness {
    pub connector: Arc<FakeConnector>,
    pub sessions: Arc<BrokerSessionManager>,
    pub pipeline: Arc<MessageIngestPipeline>,
    pub ingest: JoinHandle<()>,
}

pub fn setup() -> Harness {
    let connector = FakeConnector::new();
    let trees = Arc::new(Mutex::new(HashMap::new()));
    let (tx, rx) = mpsc::unbounded_channel();
    let sessions = Arc::new(BrokerSessionManager::new(connector.clone(), trees.clone(), tx));
    let pipeline = Arc::new(MessageIngestPipeline::new(trees, 100));
    let ingest = tokio::spawn(pipeline.clone().run(rx));

    Harness {
        connector,
        sessions,
        pipeline,
        ingest,
    }
}

/// Polls `check` until it holds or two seconds pass.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if check().await {
            return true;
        }
        sleep(Duration::from_millis(5)).await;
    }
    false
}
