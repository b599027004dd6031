/// Failure of a send-side operation on a connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("connection is not active")]
    NotActive,
    #[error("send queue is full")]
    QueueFull,
    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Failure while handling one inbound message.
///
/// These are logged by the read loop; they never close the connection.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("malformed message: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("client {0} is not trusted")]
    Untrusted(String),
    #[error(transparent)]
    Send(#[from] ConnectionError),
}
