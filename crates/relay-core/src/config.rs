use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use protocol::DataKind;

use crate::error::{RelayError, RelayResult};
use crate::health::HealthConfig;
use crate::reconnect::ReconnectPolicy;

pub const DEFAULT_WS_URL: &str = "ws://127.0.0.1:3001/ws";
pub const DEFAULT_STORAGE_PREFIX: &str = "wellness_";
pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Debug)]
pub struct RelayConfig {
    pub ws_url: String,
    pub reconnect: ReconnectPolicy,
    pub health: HealthConfig,
    pub queue_capacity: usize,
    pub request_timeout: Duration,
    pub store_capacities: HashMap<DataKind, usize>,
    /// Directory for the file-backed mirror. `None` keeps the mirror in memory.
    pub storage_dir: Option<PathBuf>,
    pub storage_prefix: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            ws_url: DEFAULT_WS_URL.to_string(),
            reconnect: ReconnectPolicy::socket(),
            health: HealthConfig::default(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            store_capacities: HashMap::new(),
            storage_dir: None,
            storage_prefix: DEFAULT_STORAGE_PREFIX.to_string(),
        }
    }
}

impl RelayConfig {
    pub fn capacity(&self, kind: DataKind) -> usize {
        self.store_capacities.get(&kind).copied().unwrap_or_else(|| kind.default_capacity())
    }

    pub fn with_capacity(mut self, kind: DataKind, capacity: usize) -> Self {
        self.store_capacities.insert(kind, capacity);
        self
    }

    /// Read `RELAY_*` variables, falling back to defaults for unset ones.
    pub fn from_env() -> RelayResult<Self> {
        let defaults = Self::default();
        let max_attempts = match std::env::var("RELAY_MAX_ATTEMPTS") {
            Ok(v) if v.trim().is_empty() || v == "0" => None,
            Ok(v) => Some(parse_value::<u32>("RELAY_MAX_ATTEMPTS", &v)?),
            Err(_) => defaults.reconnect.max_attempts,
        };

        let mut store_capacities = HashMap::new();
        for kind in DataKind::ALL {
            let key = format!("RELAY_{}_CAPACITY", kind.as_str().to_uppercase());
            if let Ok(v) = std::env::var(&key) {
                store_capacities.insert(kind, parse_value::<usize>(&key, &v)?);
            }
        }

        Ok(Self {
            ws_url: std::env::var("RELAY_WS_URL").unwrap_or(defaults.ws_url),
            reconnect: ReconnectPolicy {
                base_delay: Duration::from_millis(env_or(
                    "RELAY_RECONNECT_BASE_MS",
                    defaults.reconnect.base_delay.as_millis() as u64,
                )?),
                max_delay: Duration::from_millis(env_or(
                    "RELAY_RECONNECT_MAX_MS",
                    defaults.reconnect.max_delay.as_millis() as u64,
                )?),
                max_attempts,
                connect_timeout: Duration::from_millis(env_or(
                    "RELAY_CONNECT_TIMEOUT_MS",
                    defaults.reconnect.connect_timeout.as_millis() as u64,
                )?),
            },
            health: HealthConfig {
                interval: Duration::from_secs(
                    env_or("RELAY_HB_SECS", defaults.health.interval.as_secs())?.max(1),
                ),
                timeout: Duration::from_millis(env_or(
                    "RELAY_HB_TIMEOUT_MS",
                    defaults.health.timeout.as_millis() as u64,
                )?),
                resync_interval: Duration::from_secs(env_or(
                    "RELAY_RESYNC_SECS",
                    defaults.health.resync_interval.as_secs(),
                )?),
            },
            queue_capacity: env_or("RELAY_QUEUE_CAPACITY", defaults.queue_capacity)?,
            request_timeout: Duration::from_millis(env_or(
                "RELAY_REQUEST_TIMEOUT_MS",
                defaults.request_timeout.as_millis() as u64,
            )?),
            store_capacities,
            storage_dir: std::env::var("RELAY_STORAGE_DIR").ok().map(PathBuf::from),
            storage_prefix: std::env::var("RELAY_STORAGE_PREFIX").unwrap_or(defaults.storage_prefix),
        })
    }
}

/// Load `.env` from the working directory or its parents (best-effort).
pub fn load_dotenv() {
    if let Ok(path) = dotenvy::dotenv() {
        tracing::debug!(path = %path.display(), "loaded .env");
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> RelayResult<T> {
    match std::env::var(key) {
        Ok(v) => parse_value(key, &v),
        Err(_) => Ok(default),
    }
}

fn parse_value<T: FromStr>(key: &str, raw: &str) -> RelayResult<T> {
    raw.trim()
        .parse()
        .map_err(|_| RelayError::InvalidConfig(format!("{}={:?}", key, raw)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = RelayConfig::default();
        assert_eq!(cfg.queue_capacity, 1000);
        assert_eq!(cfg.capacity(DataKind::Gaze), 100);
        assert_eq!(cfg.capacity(DataKind::Emotion), 50);
        assert_eq!(cfg.health.interval, Duration::from_secs(30));
        assert_eq!(cfg.reconnect.base_delay, Duration::from_millis(1000));
        assert_eq!(cfg.reconnect.max_delay, Duration::from_millis(30_000));
        assert_eq!(cfg.reconnect.connect_timeout, Duration::from_secs(10));
    }

    #[test]
    fn capacity_override() {
        let cfg = RelayConfig::default().with_capacity(DataKind::Gaze, 10);
        assert_eq!(cfg.capacity(DataKind::Gaze), 10);
        assert_eq!(cfg.capacity(DataKind::Webcam), 500);
    }

    #[test]
    fn parse_value_reports_key() {
        let err = parse_value::<u64>("RELAY_HB_SECS", "soon").unwrap_err();
        assert!(err.to_string().contains("RELAY_HB_SECS"));
    }
}
