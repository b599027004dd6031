use std::time::Duration;
use switchwire_core::DEFAULT_PROTOCOL_VERSION;

/// Per-connection timing and protocol parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSettings {
    /// Interval between liveness pings; a pong older than two intervals fails
    /// the connection.
    pub heartbeat_interval: Duration,
    /// Bound on a single frame write.
    pub write_timeout: Duration,
    /// Read deadline, refreshed by every pong.
    pub read_timeout: Duration,
    /// Protocol version (client) or server version (proxy) put on envelopes.
    pub version: String,
    /// Frames the outbound queue holds before `send` fails.
    pub send_queue_capacity: usize,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            write_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(60),
            version: DEFAULT_PROTOCOL_VERSION.to_string(),
            send_queue_capacity: 256,
        }
    }
}

impl ConnectionSettings {
    /// Replace zero durations and an empty queue with the defaults.
    pub fn normalized(mut self) -> Self {
        let defaults = Self::default();
        if self.heartbeat_interval.is_zero() {
            self.heartbeat_interval = defaults.heartbeat_interval;
        }
        if self.write_timeout.is_zero() {
            self.write_timeout = defaults.write_timeout;
        }
        if self.read_timeout.is_zero() {
            self.read_timeout = defaults.read_timeout;
        }
        if self.send_queue_capacity == 0 {
            self.send_queue_capacity = defaults.send_queue_capacity;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_values_fall_back_to_defaults() {
        let settings = ConnectionSettings {
            heartbeat_interval: Duration::ZERO,
            write_timeout: Duration::ZERO,
            read_timeout: Duration::ZERO,
            version: "2.0.0".into(),
            send_queue_capacity: 0,
        }
        .normalized();
        assert_eq!(settings.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(settings.write_timeout, Duration::from_secs(10));
        assert_eq!(settings.read_timeout, Duration::from_secs(60));
        assert_eq!(settings.send_queue_capacity, 256);
        assert_eq!(settings.version, "2.0.0");
    }

    #[test]
    fn set_values_are_kept() {
        let settings = ConnectionSettings {
            heartbeat_interval: Duration::from_millis(250),
            send_queue_capacity: 1,
            ..Default::default()
        };
        assert_eq!(settings.clone().normalized(), settings);
    }
}
