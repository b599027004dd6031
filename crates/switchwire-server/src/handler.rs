use crate::Server;
use std::sync::Arc;
use switchwire_conn::Connection;
use switchwire_core::{ClientProxyInfo, DisconnectReason};

/// Application hooks for a [`Server`]. Every method has a no-op default.
pub trait ServerHandler: Send + Sync + 'static {
    /// The hello has been sent to a new connection.
    fn on_connect(&self, _conn: &Arc<Connection>) {}

    fn on_disconnect(&self, _conn: &Connection, _reason: DisconnectReason) {}

    /// A client registered and is now trusted.
    fn on_client_trusted(&self, _info: &ClientProxyInfo) {}

    /// A business envelope passed acknowledgment and trust checks.
    fn on_message(&self, _server: &Arc<Server>, _conn: &Arc<Connection>, _raw: &[u8]) {}
}
