//! The switchwire connection engine.
//!
//! A [`Connection`] runs the application protocol over one duplex
//! [`Transport`]: a read loop, a write loop with heartbeat, a handshake worker
//! driven by the injected [`MessageProcessor`], and a tracker of reliable
//! requests awaiting acknowledgment. The same type serves both the client end
//! and the server's per-client proxy; the role only changes envelope shape and
//! which processor is plugged in.

mod connection;
mod error;
mod pending;
mod processor;
mod settings;
mod transport;

pub use connection::{Connection, ConnectionStateChange, StateChangeCallback};
pub use error::{ConnectionError, ProcessError};
pub use pending::{PendingRequest, PendingRequests, RetryPolicy};
pub use processor::MessageProcessor;
pub use settings::ConnectionSettings;
pub use transport::{Frame, FrameSink, FrameStream, Transport, TransportError};

pub use tokio_util::sync::CancellationToken;

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a mutex, recovering the guard if a holder panicked.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}
