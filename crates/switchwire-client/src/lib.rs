//! SDK side of switchwire.
//!
//! A [`Client`] dials the server, runs the hello/register handshake through a
//! [`ClientMessageProcessor`], and redials with exponential backoff whenever
//! the connection drops for a reconnect-eligible reason. Applications plug in
//! through the [`ClientHandler`] listener trait.

mod client;
mod config;
mod error;
mod handler;
mod processor;
mod reconnect;

pub use client::Client;
pub use config::ClientConfig;
pub use error::{ClientError, ConfigError};
pub use handler::ClientHandler;
pub use processor::ClientMessageProcessor;
pub use reconnect::{ReconnectState, ReconnectStrategy};

pub use switchwire_conn::{Connection, RetryPolicy};
