use std::sync::Arc;
use switchwire_conn::Connection;
use switchwire_core::{DisconnectReason, RegisterPayload};

/// Application hooks for a [`Client`](crate::Client).
///
/// Every method has a no-op default. Hooks run on connection workers and
/// should not block.
pub trait ClientHandler: Send + Sync + 'static {
    /// Identity sent in the registration signal once the server said hello.
    /// Returning `None` skips registration, so the connection never becomes
    /// trusted.
    fn register_payload(&self, _conn: &Connection) -> Option<RegisterPayload> {
        None
    }

    /// The registration signal has been sent.
    fn on_connect(&self, _conn: &Arc<Connection>) {}

    /// The server accepted our registration. Fires once per connection.
    fn on_trusted(&self, _conn: &Arc<Connection>) {}

    fn on_disconnect(&self, _conn: &Connection, _reason: DisconnectReason) {}

    /// A business envelope arrived and was acknowledged. Any `processing`
    /// acknowledgment is up to the handler.
    fn on_message(&self, _conn: &Arc<Connection>, _raw: &[u8]) {}
}
