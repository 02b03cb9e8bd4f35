//! Consumer of session events.
//!
//! Every inbound message lands in its broker's topic tree, is appended to
//! the activity log and, when it targets the current selection, re-renders
//! the selection view.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use time::OffsetDateTime;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info};

use crate::session_manager::SessionEvent;
use crate::topic_tree::SharedTrees;

pub const NO_PAYLOAD_YET: &str = "No payload received for this topic yet.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub broker: String,
    pub topic: String,
}

impl Selection {
    pub fn new(broker: impl Into<String>, topic: impl Into<String>) -> Self {
        Self {
            broker: broker.into(),
            topic: topic.into(),
        }
    }

    fn matches(&self, broker: &str, topic: &str) -> bool {
        self.broker == broker && self.topic == topic
    }
}

/// Display form of the selected topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedPayload {
    pub broker: String,
    pub topic: String,
    pub body: String,
}

impl fmt::Display for RenderedPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} → {}\n{}", self.broker, self.topic, self.body)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActivityEntry {
    pub timestamp: OffsetDateTime,
    pub broker: String,
    pub topic: String,
    pub payload: String,
}

impl fmt::Display for ActivityEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{} - {}] {}", self.broker, self.topic, self.payload)
    }
}

/// Append-only record of received messages, keeping the newest `capacity`.
#[derive(Debug)]
pub struct ActivityLog {
    entries: VecDeque<ActivityEntry>,
    capacity: usize,
    appended: u64,
}

impl ActivityLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity: capacity.max(1),
            appended: 0,
        }
    }

    pub fn append(&mut self, entry: ActivityEntry) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
        self.appended += 1;
    }

    pub fn entries(&self) -> impl Iterator<Item = &ActivityEntry> {
        self.entries.iter()
    }

    /// Entries appended since creation, evicted ones included.
    pub fn appended(&self) -> u64 {
        self.appended
    }
}

/// Pretty prints JSON payloads; anything else is returned as is.
pub fn pretty_print(payload: &str) -> String {
    serde_json::from_str::<serde_json::Value>(payload)
        .and_then(|value| serde_json::to_string_pretty(&value))
        .unwrap_or_else(|_| payload.to_string())
}

fn render(broker: &str, topic: &str, payload: Option<&str>) -> RenderedPayload {
    let body = match payload {
        Some(payload) if !payload.is_empty() => pretty_print(payload),
        _ => NO_PAYLOAD_YET.to_string(),
    };
    RenderedPayload {
        broker: broker.to_string(),
        topic: topic.to_string(),
        body,
    }
}

pub struct MessageIngestPipeline {
    trees: SharedTrees,
    selection: Mutex<Option<Selection>>,
    display: watch::Sender<Option<RenderedPayload>>,
    activity: Mutex<ActivityLog>,
}

impl MessageIngestPipeline {
    pub fn new(trees: SharedTrees, activity_capacity: usize) -> Self {
        let (display, _) = watch::channel(None);
        Self {
            trees,
            selection: Mutex::new(None),
            display,
            activity: Mutex::new(ActivityLog::new(activity_capacity)),
        }
    }

    /// Receives every re-render of the selection.
    pub fn subscribe_display(&self) -> watch::Receiver<Option<RenderedPayload>> {
        self.display.subscribe()
    }

    /// Consumes session events until every sender is gone.
    pub async fn run(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<SessionEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                SessionEvent::Message(message) => {
                    self.ingest(&message.broker, &message.topic, &message.payload)
                        .await
                }
                SessionEvent::StateChanged { broker, state } => {
                    info!("Broker '{}' is now {}.", broker, state)
                }
            }
        }
        info!("Session event channel closed.");
    }

    /// Stores a message in its broker's tree. Messages for brokers without a
    /// tree (never connected, or removed while the message was queued) are dropped.
    pub async fn ingest(&self, broker: &str, topic: &str, payload: &str) {
        {
            let mut trees = self.trees.lock().await;
            let Some(tree) = trees.get_mut(broker) else {
                debug!("Dropping message on '{}' for unknown broker '{}'.", topic, broker);
                return;
            };
            tree.insert(topic, payload);
        }

        self.activity.lock().await.append(ActivityEntry {
            timestamp: OffsetDateTime::now_utc(),
            broker: broker.to_string(),
            topic: topic.to_string(),
            payload: payload.to_string(),
        });
        debug!("[{} - {}] {}", broker, topic, payload);

        let selected = self
            .selection
            .lock()
            .await
            .as_ref()
            .is_some_and(|selection| selection.matches(broker, topic));
        if selected {
            self.display
                .send_replace(Some(render(broker, topic, Some(payload))));
        }
    }

    /// Makes `topic` on `broker` the displayed topic and renders it right away.
    pub async fn select(&self, broker: &str, topic: &str) -> RenderedPayload {
        *self.selection.lock().await = Some(Selection::new(broker, topic));

        let rendered = {
            let trees = self.trees.lock().await;
            let payload = trees.get(broker).and_then(|tree| tree.lookup(topic));
            render(broker, topic, payload)
        };
        self.display.send_replace(Some(rendered.clone()));
        rendered
    }

    pub async fn clear_selection(&self) {
        *self.selection.lock().await = None;
        self.display.send_replace(None);
    }

    pub async fn selection(&self) -> Option<Selection> {
        self.selection.lock().await.clone()
    }

    pub async fn activity(&self) -> Vec<ActivityEntry> {
        self.activity.lock().await.entries().cloned().collect()
    }

    pub async fn activity_count(&self) -> u64 {
        self.activity.lock().await.appended()
    }
}
