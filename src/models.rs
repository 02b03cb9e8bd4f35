use std::fmt;

use time::OffsetDateTime;

/// Port used when a broker is registered without one.
pub const DEFAULT_PORT: u16 = 1883;

/// Multi-level wildcard every session subscribes to.
pub const WILDCARD_FILTER: &str = "#";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerConfig {
    pub name: String,
    pub host: String,
    pub port: u16,
}

impl BrokerConfig {
    pub fn new(name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port,
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Failed(String),
}

impl SessionState {
    /// A session in this state blocks a new connect attempt.
    pub fn is_active(&self) -> bool {
        matches!(self, SessionState::Connecting | SessionState::Connected)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Disconnected => write!(f, "disconnected"),
            SessionState::Connecting => write!(f, "connecting"),
            SessionState::Connected => write!(f, "connected"),
            SessionState::Failed(reason) => write!(f, "failed ({})", reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StressTestParams {
    pub broker: String,
    pub topic: String,
    pub count: u32,
    pub interval_ms: u64,
    pub size_bytes: usize,
}

impl StressTestParams {
    pub fn new(broker: impl Into<String>, topic: impl Into<String>) -> Self {
        Self {
            broker: broker.into(),
            topic: topic.into(),
            count: 100,
            interval_ms: 100,
            size_bytes: 1024,
        }
    }
}

/// One publish recorded during a stress run.
#[derive(Debug, Clone, PartialEq)]
pub struct TestSample {
    pub sequence_number: u32,
    pub timestamp: OffsetDateTime,
    pub size_bytes: usize,
    /// Time since the previous publish, 0 for the first one.
    pub interval_ms: f64,
    /// Time since the run began.
    pub total_elapsed_ms: f64,
    pub topic: String,
    pub broker: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TestMetrics {
    pub total_time_seconds: f64,
    pub messages_per_second: f64,
    pub avg_interval_ms: f64,
}

impl TestMetrics {
    /// Derives the aggregate metrics of a run from its samples.
    ///
    /// The first sample's interval carries no information and is left out of
    /// the average.
    pub fn from_samples(samples: &[TestSample]) -> Self {
        let Some(last) = samples.last() else {
            return Self::default();
        };

        let total_time_seconds = last.total_elapsed_ms / 1000.0;
        let messages_per_second = if total_time_seconds > 0.0 {
            samples.len() as f64 / total_time_seconds
        } else {
            0.0
        };

        let intervals = &samples[1..];
        let avg_interval_ms = if intervals.is_empty() {
            0.0
        } else {
            intervals.iter().map(|s| s.interval_ms).sum::<f64>() / intervals.len() as f64
        };

        Self {
            total_time_seconds,
            messages_per_second,
            avg_interval_ms,
        }
    }
}

impl fmt::Display for TestMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "finished in {:.2} s, {:.2} messages/s, average interval {:.2} ms",
            self.total_time_seconds, self.messages_per_second, self.avg_interval_ms
        )
    }
}
