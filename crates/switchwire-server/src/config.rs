use crate::{ConfigError, ENDPOINT_CHANGE_CONFIG, ENDPOINT_FULL_SYNC, ENDPOINT_FULL_SYNC_CONFIG};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use switchwire_conn::{ConnectionSettings, RetryPolicy};
use switchwire_core::{DEFAULT_PROTOCOL_VERSION, serde_duration};

/// Named retry parameter sets for reliable pushes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryProfiles {
    pub default: RetryPolicy,
    pub switch_data: RetryPolicy,
    pub full_config: RetryPolicy,
    pub config_change: RetryPolicy,
}

/// Server configuration, loadable from TOML.
///
/// Durations are written as integer milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address.
    pub address: String,
    /// Advertised in the hello.
    pub name: String,
    pub server_version: String,
    #[serde(with = "serde_duration")]
    pub read_timeout: Duration,
    #[serde(with = "serde_duration")]
    pub write_timeout: Duration,
    /// Per-connection ping interval, also the eviction sweep interval.
    #[serde(with = "serde_duration")]
    pub heartbeat_interval: Duration,
    /// Evict a connection silent for longer than this.
    #[serde(with = "serde_duration")]
    pub client_timeout: Duration,
    pub max_connections: usize,
    pub send_queue_capacity: usize,
    /// Paths that accept websocket upgrades.
    pub endpoints: Vec<String>,
    pub retry: RetryProfiles,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let settings = ConnectionSettings::default();
        Self {
            address: "0.0.0.0:8080".to_string(),
            name: "WebSocket Persistent Connection Server".to_string(),
            server_version: DEFAULT_PROTOCOL_VERSION.to_string(),
            read_timeout: settings.read_timeout,
            write_timeout: settings.write_timeout,
            heartbeat_interval: settings.heartbeat_interval,
            client_timeout: Duration::from_secs(90),
            max_connections: 1000,
            send_queue_capacity: settings.send_queue_capacity,
            endpoints: vec![
                ENDPOINT_CHANGE_CONFIG.to_string(),
                ENDPOINT_FULL_SYNC_CONFIG.to_string(),
                ENDPOINT_FULL_SYNC.to_string(),
            ],
            retry: RetryProfiles::default(),
        }
    }
}

impl ServerConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(s)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::from_toml_str(&std::fs::read_to_string(path)?)
    }

    /// Parameters for each proxy connection. Zero durations fall back to the
    /// defaults.
    pub fn settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            heartbeat_interval: self.heartbeat_interval,
            write_timeout: self.write_timeout,
            read_timeout: self.read_timeout,
            version: self.server_version.clone(),
            send_queue_capacity: self.send_queue_capacity,
        }
        .normalized()
    }

    /// `client_timeout`, or 90s when unset.
    pub fn eviction_timeout(&self) -> Duration {
        if self.client_timeout.is_zero() {
            Duration::from_secs(90)
        } else {
            self.client_timeout
        }
    }
}
