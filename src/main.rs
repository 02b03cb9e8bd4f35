use std::collections::HashMap;
use std::sync::Arc;

use mqtt_explorer::config::Config;
use mqtt_explorer::ingest::MessageIngestPipeline;
use mqtt_explorer::mqtt_service::RumqttConnector;
use mqtt_explorer::service_utils::{
    handle_shutdown, periodic_status_update, print_selection, run_configured_stress_test,
    start_session,
};
use mqtt_explorer::session_manager::BrokerSessionManager;
use mqtt_explorer::stress_test::StressTestEngine;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Duration;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    // Load configuration
    let config = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("Error loading configuration: {:?}", e);
            return;
        }
    };

    let trees = Arc::new(Mutex::new(HashMap::new()));
    let (events_tx, events_rx) = mpsc::unbounded_channel();

    let connector = Arc::new(RumqttConnector::new(
        Duration::from_secs(config.mqtt_keep_alive_secs),
        Duration::from_millis(config.mqtt_connect_timeout_ms),
    ));
    let sessions = Arc::new(BrokerSessionManager::new(connector, trees.clone(), events_tx));
    let pipeline = Arc::new(MessageIngestPipeline::new(trees, config.activity_log_capacity));
    let engine = Arc::new(StressTestEngine::new(config.results_dir.clone()));

    let ingest_task = tokio::spawn(pipeline.clone().run(events_rx));

    if let Some(selection) = &config.watch {
        print_selection(pipeline.clone());
        pipeline.select(&selection.broker, &selection.topic).await;
    }

    // Register every broker and keep its session alive
    let mut session_tasks = Vec::new();
    for broker in &config.brokers {
        if let Err(e) = sessions
            .register_config(&broker.name, &broker.host, broker.port)
            .await
        {
            error!("Skipping broker: {}", e);
            continue;
        }
        session_tasks.push(start_session(
            sessions.clone(),
            broker.name.clone(),
            config.mqtt_retry_interval_ms,
            config.connect_attempts(),
        ));
    }

    periodic_status_update(
        sessions.clone(),
        pipeline.clone(),
        Duration::from_secs(config.status_interval_secs),
    );

    if let Some(params) = config.stress_test.clone() {
        let wait = Duration::from_millis(config.mqtt_retry_interval_ms)
            * config.connect_attempts() as u32
            + Duration::from_millis(config.mqtt_connect_timeout_ms);
        run_configured_stress_test(sessions.clone(), engine.clone(), params, wait);
    }

    handle_shutdown(sessions.clone(), engine).await;

    // Wait for the receive loops to wind down
    let aborts: Vec<_> = session_tasks.iter().map(|task| task.abort_handle()).collect();
    if tokio::time::timeout(Duration::from_secs(5), futures::future::join_all(session_tasks))
        .await
        .is_err()
    {
        aborts.iter().for_each(|task| task.abort());
    }
    ingest_task.abort();
    info!("All sessions shut down successfully.");
}
