use crate::{Connection, ProcessError};
use futures_util::future::BoxFuture;
use std::sync::Arc;
use switchwire_core::DisconnectReason;
use tokio_util::sync::CancellationToken;

/// Role-specific behaviour plugged into a [`Connection`].
///
/// The client and the server's proxy each supply one implementation; the
/// connection engine itself knows nothing about handshakes or trust.
pub trait MessageProcessor: Send + Sync + 'static {
    /// Handle one inbound envelope. Acknowledgments never reach this method.
    ///
    /// Errors are logged by the read loop and do not close the connection.
    fn process_message(&self, conn: &Arc<Connection>, raw: &[u8]) -> Result<(), ProcessError>;

    /// Run the post-connect handshake.
    ///
    /// Spawned once per connection when it starts. `shutdown` is the external
    /// signal passed to [`Connection::start`]; internal failure is observable
    /// through [`Connection::cancelled`].
    fn on_connect<'a>(
        &'a self,
        conn: &'a Arc<Connection>,
        shutdown: &'a CancellationToken,
    ) -> BoxFuture<'a, ()>;

    /// Called exactly once, after the connection has closed.
    fn on_disconnect(&self, conn: &Connection, reason: DisconnectReason);
}
