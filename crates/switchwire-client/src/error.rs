use switchwire_conn::ConnectionError;
use switchwire_core::IdError;
use tokio_tungstenite::tungstenite;

/// Failure of a client operation.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("client is not connected")]
    NotConnected,
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error("dial failed: {0}")]
    Dial(#[from] tungstenite::Error),
    #[error("dial timed out")]
    DialTimeout,
    #[error("invalid request header: {0}")]
    InvalidHeader(String),
    #[error("could not generate connection id: {0}")]
    Id(#[from] IdError),
}

/// Failure loading a [`ClientConfig`](crate::ClientConfig).
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}
