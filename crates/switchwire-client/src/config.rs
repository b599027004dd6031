use crate::{ConfigError, ReconnectStrategy};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use switchwire_conn::ConnectionSettings;
use switchwire_core::{DEFAULT_PROTOCOL_VERSION, serde_duration};

/// Client configuration, loadable from TOML.
///
/// Durations are written as integer milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Websocket URL of a server upgrade endpoint.
    pub address: String,
    /// Protocol version put on every request envelope.
    pub version: String,
    /// Extra headers sent with the upgrade request.
    pub headers: BTreeMap<String, String>,
    #[serde(with = "serde_duration")]
    pub heartbeat_interval: Duration,
    #[serde(with = "serde_duration")]
    pub write_timeout: Duration,
    #[serde(with = "serde_duration")]
    pub read_timeout: Duration,
    #[serde(with = "serde_duration")]
    pub dial_timeout: Duration,
    /// How long to wait for the server's hello.
    #[serde(with = "serde_duration")]
    pub handshake_timeout: Duration,
    pub send_queue_capacity: usize,
    pub reconnect: ReconnectStrategy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        let settings = ConnectionSettings::default();
        Self {
            address: "ws://127.0.0.1:8080/ws/config/fullSync".to_string(),
            version: DEFAULT_PROTOCOL_VERSION.to_string(),
            headers: BTreeMap::new(),
            heartbeat_interval: settings.heartbeat_interval,
            write_timeout: settings.write_timeout,
            read_timeout: settings.read_timeout,
            dial_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(30),
            send_queue_capacity: settings.send_queue_capacity,
            reconnect: ReconnectStrategy::default(),
        }
    }
}

impl ClientConfig {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ..Default::default()
        }
    }

    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(s)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::from_toml_str(&std::fs::read_to_string(path)?)
    }

    /// Parameters for each connection this client opens. Zero durations fall
    /// back to the defaults.
    pub fn settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            heartbeat_interval: self.heartbeat_interval,
            write_timeout: self.write_timeout,
            read_timeout: self.read_timeout,
            version: self.version.clone(),
            send_queue_capacity: self.send_queue_capacity,
        }
        .normalized()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = ClientConfig::from_toml_str(
            r#"
            address = "ws://switch.internal:9000/ws/config/change"
            heartbeat_interval = 5000

            [headers]
            Authorization = "Bearer t"

            [reconnect]
            max_retries = 5
            enable_jitter = false
            "#,
        )
        .unwrap();
        assert_eq!(config.address, "ws://switch.internal:9000/ws/config/change");
        assert_eq!(config.heartbeat_interval, Duration::from_secs(5));
        assert_eq!(config.read_timeout, Duration::from_secs(60));
        assert_eq!(config.headers["Authorization"], "Bearer t");
        assert_eq!(config.reconnect.max_retries, 5);
        assert!(!config.reconnect.enable_jitter);
        assert_eq!(config.reconnect.max_delay, Duration::from_secs(10));
    }

    #[test]
    fn settings_follow_config() {
        let mut config = ClientConfig::default();
        config.version = "2.0.0".into();
        config.write_timeout = Duration::from_secs(3);
        let settings = config.settings();
        assert_eq!(settings.version, "2.0.0");
        assert_eq!(settings.write_timeout, Duration::from_secs(3));
        assert_eq!(settings.send_queue_capacity, 256);
    }

    #[test]
    fn zero_timings_fall_back() {
        let config = ClientConfig::from_toml_str(
            r#"
            heartbeat_interval = 0
            read_timeout = 0
            write_timeout = 0
            "#,
        )
        .unwrap();
        let settings = config.settings();
        assert_eq!(settings.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(settings.read_timeout, Duration::from_secs(60));
        assert_eq!(settings.write_timeout, Duration::from_secs(10));
    }

    #[test]
    fn bad_toml() {
        assert!(matches!(
            ClientConfig::from_toml_str("address = 3"),
            Err(ConfigError::Parse(_))
        ));
    }
}
