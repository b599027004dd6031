//! Connection roles, lifecycle events and disconnect reasons.

use std::fmt;

/// Which end of a link a connection represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionRole {
    /// An SDK's outbound connection.
    Client,
    /// The server's handle to one remote SDK.
    Proxy,
}

impl fmt::Display for ConnectionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Client => f.write_str("client"),
            Self::Proxy => f.write_str("proxy"),
        }
    }
}

/// Lifecycle events reported through state-change callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    Disconnected,
}

/// Why a connection closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DisconnectReason {
    Unknown,
    NetworkError,
    ReadTimeout,
    WriteError,
    HeartbeatTimeout,
    HandshakeFailed,
    AuthFailed,
    ExternalClose,
    ServerKick,
}

impl DisconnectReason {
    /// Whether a client should dial again after this reason.
    pub fn should_reconnect(self) -> bool {
        matches!(
            self,
            Self::NetworkError
                | Self::ReadTimeout
                | Self::WriteError
                | Self::HeartbeatTimeout
                | Self::HandshakeFailed
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "Unknown",
            Self::NetworkError => "NetworkError",
            Self::ReadTimeout => "ReadTimeout",
            Self::WriteError => "WriteError",
            Self::HeartbeatTimeout => "HeartbeatTimeout",
            Self::HandshakeFailed => "HandshakeFailed",
            Self::AuthFailed => "AuthFailed",
            Self::ExternalClose => "ExternalClose",
            Self::ServerKick => "ServerKick",
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reconnect_eligibility() {
        use DisconnectReason::*;
        for r in [NetworkError, ReadTimeout, WriteError, HeartbeatTimeout, HandshakeFailed] {
            assert!(r.should_reconnect(), "{r} should reconnect");
        }
        for r in [Unknown, AuthFailed, ExternalClose, ServerKick] {
            assert!(!r.should_reconnect(), "{r} should not reconnect");
        }
    }
}
