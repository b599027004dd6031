//! Server side of switchwire.
//!
//! A [`Server`] accepts websocket upgrades on its configured endpoints, wraps
//! each as a proxy-role [`Connection`], and keeps two registries: every live
//! connection, and the subset that completed registration. Business traffic
//! is pushed to trusted connections one at a time or by filtered broadcast.

mod config;
mod error;
mod filter;
mod handler;
mod http;
mod proxy;
mod server;

pub use config::{RetryProfiles, ServerConfig};
pub use error::{BroadcastFailure, BroadcastFailures, ConfigError, ServerError};
pub use filter::{ConnectionFilter, and_filter, endpoint_match, env_match, namespace_match};
pub use handler::ServerHandler;
pub use proxy::ProxyMessageProcessor;
pub use server::Server;

pub use switchwire_conn::{Connection, ConnectionError, RetryPolicy};

/// Upgrade endpoint for incremental configuration changes.
pub const ENDPOINT_CHANGE_CONFIG: &str = "/ws/config/change";
/// Upgrade endpoint for full driver configuration sync.
pub const ENDPOINT_FULL_SYNC_CONFIG: &str = "/ws/config/fullSyncConfig";
/// Upgrade endpoint for full switch sync.
pub const ENDPOINT_FULL_SYNC: &str = "/ws/config/fullSync";
