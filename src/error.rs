use thiserror::Error;

/// Failures reported by the MQTT client collaborator.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection error: {0}")]
    Connection(String),
    #[error("Broker refused the connection: {0}")]
    Refused(String),
    #[error("Timed out after {0} ms waiting for the broker")]
    Timeout(u64),
    #[error("Client request failed: {0}")]
    Request(String),
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Broker '{0}' is already registered.")]
    DuplicateName(String),
    #[error("Broker '{0}' is not registered.")]
    UnknownBroker(String),
    #[error("Broker '{0}' is already connecting or connected.")]
    AlreadyConnected(String),
    #[error("Could not connect to broker '{broker}': {reason}")]
    ConnectionFailed { broker: String, reason: String },
    #[error("Broker '{0}' is not connected.")]
    BrokerNotConnected(String),
}

#[derive(Debug, Error)]
pub enum StressTestError {
    #[error("Invalid stress test parameters: {0}")]
    InvalidParameters(String),
    #[error("Broker '{0}' is not connected.")]
    BrokerNotConnected(String),
    #[error("A stress test is already running.")]
    TestAlreadyRunning,
    #[error("Run a stress test before exporting results.")]
    NoCompletedTest,
    #[error("Publishing message {sequence} failed: {reason}")]
    PublishFailed { sequence: u32, reason: String },
    #[error("Stress test cancelled after {sent} messages.")]
    Cancelled { sent: u32 },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}
