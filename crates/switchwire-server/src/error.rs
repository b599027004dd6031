use std::fmt;
use switchwire_conn::ConnectionError;

/// One target a broadcast could not reach.
#[derive(Debug)]
pub struct BroadcastFailure {
    pub client_id: String,
    pub error: ConnectionError,
}

/// Every failed target of a reliable broadcast.
#[derive(Debug, Default)]
pub struct BroadcastFailures(pub Vec<BroadcastFailure>);

impl fmt::Display for BroadcastFailures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, failure) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "failed to send to client {}: {}", failure.client_id, failure.error)?;
        }
        Ok(())
    }
}

/// Failure of a server operation.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("server is not running")]
    NotRunning,
    #[error("server is already running")]
    AlreadyRunning,
    #[error("invalid endpoint {0}")]
    InvalidEndpoint(String),
    #[error("client {0} not found")]
    ClientNotFound(String),
    #[error("client {0} is not trusted or not found")]
    ClientNotTrusted(String),
    #[error("client {0} is not active")]
    ClientNotActive(String),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("server I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("broadcast failed for some clients: {0}")]
    Broadcast(BroadcastFailures),
}

/// Failure loading a [`ServerConfig`](crate::ServerConfig).
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}
