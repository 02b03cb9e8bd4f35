use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;
use tracing::{error, info, warn};

use crate::error::SessionError;
use crate::ingest::MessageIngestPipeline;
use crate::models::{SessionState, StressTestParams};
use crate::session_manager::{BrokerSessionManager, ListenOutcome};
use crate::stress_test::StressTestEngine;

/// Backoff between connect attempts: doubling from `interval_ms`, capped at 60 s.
pub fn retry_strategy(interval_ms: u64, attempts: usize) -> impl Iterator<Item = Duration> {
    ExponentialBackoff::from_millis(2)
        .factor(interval_ms / 2)
        .max_delay(Duration::from_secs(60))
        .map(jitter)
        .take(attempts.saturating_sub(1))
}

/// Connects `name` and keeps its receive loop running, reconnecting when the
/// broker drops the connection. Returns once the operator disconnects or
/// removes the broker, or every retry failed.
pub async fn supervise_session(
    sessions: Arc<BrokerSessionManager>,
    name: String,
    retry_interval_ms: u64,
    attempts: usize,
) {
    let stop = match sessions.stop_signal(&name).await {
        Ok(stop) => stop,
        Err(e) => {
            error!("Cannot supervise '{}': {}", name, e);
            return;
        }
    };

    loop {
        let connecting = RetryIf::start(
            retry_strategy(retry_interval_ms, attempts),
            || {
                let sessions = sessions.clone();
                let name = name.clone();
                async move { sessions.connect(&name).await }
            },
            |e: &SessionError| {
                matches!(e, SessionError::ConnectionFailed { .. }) && !stop.is_cancelled()
            },
        );
        let connected = tokio::select! {
            biased;
            _ = stop.cancelled() => {
                info!("Stopped supervising broker '{}'.", name);
                return;
            }
            connected = connecting => connected,
        };

        if let Err(e) = connected {
            if !stop.is_cancelled() {
                error!("Giving up on broker '{}': {}", name, e);
            }
            return;
        }

        match sessions.listen(&name).await {
            Ok(ListenOutcome::Cancelled) => return,
            Ok(ListenOutcome::ConnectionLost(reason)) => {
                warn!(
                    "Lost connection to MQTT broker '{}' ({}). Reconnecting...",
                    name,
                    reason.as_deref().unwrap_or("no reason given")
                );
                tokio::select! {
                    biased;
                    _ = stop.cancelled() => {
                        info!("Stopped supervising broker '{}'.", name);
                        return;
                    }
                    _ = sleep(Duration::from_millis(retry_interval_ms)) => {}
                }
            }
            Err(e) => {
                if !stop.is_cancelled() {
                    error!("Receive loop of '{}' could not start: {}", name, e);
                }
                return;
            }
        }
    }
}

/// Start the session supervisor of a broker
pub fn start_session(
    sessions: Arc<BrokerSessionManager>,
    name: String,
    retry_interval_ms: u64,
    attempts: usize,
) -> JoinHandle<()> {
    tokio::spawn(supervise_session(sessions, name, retry_interval_ms, attempts))
}

/// Start periodic status updates
pub fn periodic_status_update(
    sessions: Arc<BrokerSessionManager>,
    pipeline: Arc<MessageIngestPipeline>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            sleep(interval).await;
            for name in sessions.broker_names().await {
                let state = sessions
                    .state(&name)
                    .await
                    .unwrap_or(SessionState::Disconnected);
                info!(
                    "Broker '{}': {}, {} topics.",
                    name,
                    state,
                    sessions.topic_count(&name).await
                );
                if let Some(outline) = sessions.outline(&name).await {
                    if !outline.is_empty() {
                        info!("Topics of '{}':\n{}", name, outline.trim_end());
                    }
                }
            }
            info!("{} messages received so far.", pipeline.activity_count().await);
        }
    })
}

/// Logs every re-render of the selected topic.
pub fn print_selection(pipeline: Arc<MessageIngestPipeline>) -> JoinHandle<()> {
    let mut display = pipeline.subscribe_display();
    tokio::spawn(async move {
        while display.changed().await.is_ok() {
            let rendered = display.borrow_and_update().clone();
            if let Some(rendered) = rendered {
                info!("\n{}", rendered);
            }
        }
    })
}

/// Waits for `params.broker` to connect, runs the stress test and exports its results.
pub fn run_configured_stress_test(
    sessions: Arc<BrokerSessionManager>,
    engine: Arc<StressTestEngine>,
    params: StressTestParams,
    connect_timeout: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let connected = tokio::time::timeout(connect_timeout, async {
            while sessions.state(&params.broker).await != Some(SessionState::Connected) {
                sleep(Duration::from_millis(100)).await;
            }
        })
        .await;
        if connected.is_err() {
            error!(
                "Stress test not started: broker '{}' did not connect within {:?}.",
                params.broker, connect_timeout
            );
            return;
        }

        if let Err(e) = engine.run_test(&sessions, &params).await {
            error!("Stress test failed: {}", e);
            return;
        }
        if let Err(e) = engine.export_results().await {
            error!("Error exporting results: {}", e);
        }
    })
}

/// Waits for Ctrl-C, then stops the stress test and closes every session.
pub async fn handle_shutdown(sessions: Arc<BrokerSessionManager>, engine: Arc<StressTestEngine>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to handle termination signal: {:?}", e);
    }

    info!("Explorer is shutting down...");
    engine.cancel().await;
    sessions.disconnect_all().await;
}
