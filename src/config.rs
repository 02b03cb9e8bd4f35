use dotenvy::dotenv;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

use crate::ingest::Selection;
use crate::models::{BrokerConfig, StressTestParams, DEFAULT_PORT};

#[derive(Debug, Clone)]
pub struct Config {
    pub brokers: Vec<BrokerConfig>,
    pub mqtt_keep_alive_secs: u64,
    pub mqtt_connect_timeout_ms: u64,
    pub mqtt_max_retries: i32,
    pub mqtt_retry_interval_ms: u64,

    pub activity_log_capacity: usize,
    pub status_interval_secs: u64,
    pub results_dir: PathBuf,
    pub watch: Option<Selection>,
    pub stress_test: Option<StressTestParams>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Environment variable {0} is missing or invalid.")]
    MissingOrInvalid(String),
    #[error("Parsing error: {0}")]
    ParsingError(String),
}

/// Parses `name=host[:port]`.
pub fn parse_broker(entry: &str) -> Result<BrokerConfig, ConfigError> {
    let (name, address) = entry
        .split_once('=')
        .ok_or_else(|| ConfigError::ParsingError(format!("broker entry '{}' is not name=host[:port]", entry)))?;
    let name = name.trim();
    let address = address.trim();

    let (host, port) = match address.rsplit_once(':') {
        Some((host, port)) => {
            let port = port.parse::<u16>().map_err(|_| {
                ConfigError::ParsingError(format!("port of broker '{}' must be a valid number", name))
            })?;
            (host, port)
        }
        None => (address, DEFAULT_PORT),
    };

    if name.is_empty() || host.is_empty() {
        return Err(ConfigError::ParsingError(format!(
            "broker entry '{}' needs a name and a host",
            entry
        )));
    }
    Ok(BrokerConfig::new(name, host, port))
}

impl Config {
    /// Validate timeout values and other critical configurations.
    fn validate_timeouts(&self) -> Result<(), ConfigError> {
        const MIN_TIMEOUT: u64 = 100;
        const MAX_TIMEOUT: u64 = 1_000_000;

        if !(MIN_TIMEOUT..=MAX_TIMEOUT).contains(&self.mqtt_retry_interval_ms) {
            return Err(ConfigError::ParsingError(format!(
                "MQTT_RETRY_INTERVAL_MS must be between {} and {} ms",
                MIN_TIMEOUT, MAX_TIMEOUT
            )));
        }
        if !(MIN_TIMEOUT..=MAX_TIMEOUT).contains(&self.mqtt_connect_timeout_ms) {
            return Err(ConfigError::ParsingError(format!(
                "MQTT_CONNECT_TIMEOUT_MS must be between {} and {} ms",
                MIN_TIMEOUT, MAX_TIMEOUT
            )));
        }

        Ok(())
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv().ok(); // Load environment variables from .env file
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from any key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let brokers = lookup("MQTT_BROKERS")
            .filter(|value| !value.trim().is_empty())
            .ok_or_else(|| ConfigError::MissingOrInvalid("MQTT_BROKERS".to_string()))?
            .split(',')
            .filter(|entry| !entry.trim().is_empty())
            .map(parse_broker)
            .collect::<Result<Vec<_>, _>>()?;

        let watch = match lookup("WATCH_TOPIC") {
            Some(value) => {
                let (broker, topic) = value.split_once(':').ok_or_else(|| {
                    ConfigError::ParsingError("WATCH_TOPIC must be broker:topic".to_string())
                })?;
                Some(Selection::new(broker, topic))
            }
            None => None,
        };

        let stress_test = match (lookup("STRESS_BROKER"), lookup("STRESS_TOPIC")) {
            (Some(broker), Some(topic)) => Some(StressTestParams {
                broker,
                topic,
                count: setting(&lookup, "STRESS_COUNT", "100")?,
                interval_ms: setting(&lookup, "STRESS_INTERVAL_MS", "100")?,
                size_bytes: setting(&lookup, "STRESS_SIZE_BYTES", "1024")?,
            }),
            _ => None,
        };

        let config = Self {
            brokers,
            mqtt_keep_alive_secs: setting(&lookup, "MQTT_KEEP_ALIVE_SECS", "10")?,
            mqtt_connect_timeout_ms: setting(&lookup, "MQTT_CONNECT_TIMEOUT_MS", "5000")?,
            mqtt_max_retries: setting(&lookup, "MQTT_MAX_RETRIES", "5")?,
            mqtt_retry_interval_ms: setting(&lookup, "MQTT_RETRY_INTERVAL_MS", "5000")?,
            activity_log_capacity: setting(&lookup, "ACTIVITY_LOG_CAPACITY", "10000")?,
            status_interval_secs: setting(&lookup, "STATUS_INTERVAL_SECS", "30")?,
            results_dir: PathBuf::from(lookup("RESULTS_DIR").unwrap_or_else(|| "results".to_string())),
            watch,
            stress_test,
        };

        // Validate timeouts after constructing the configuration
        config.validate_timeouts()?;

        Ok(config)
    }

    /// Connect attempts made before giving up on a broker; defaults to 5, capped at 100.
    pub fn connect_attempts(&self) -> usize {
        if self.mqtt_max_retries > 0 {
            self.mqtt_max_retries.min(100) as usize
        } else {
            5
        }
    }
}

fn setting<T, F>(lookup: &F, key: &str, default: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .unwrap_or_else(|| default.to_string())
        .trim()
        .parse::<T>()
        .map_err(|_| ConfigError::ParsingError(format!("{} must be a valid number", key)))
}
