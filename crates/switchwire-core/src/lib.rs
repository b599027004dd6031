//! Core types for switchwire.
//!
//! This crate provides the protocol primitives shared by both ends of a
//! persistent connection: the JSON envelopes, message types and their
//! security tiers, disconnect reasons, and the identity a proxy keeps for
//! each remote SDK. It carries no I/O.

mod id;
mod identity;
mod message;
mod reason;
pub mod serde_duration;

pub use id::{IdError, IdGenerator};
pub use identity::{ClientProxyInfo, ServerInfo};
pub use message::{
    ConnectHelloPayload, DriverConfigPayload, IncrementChangeKind, Inbound, MessageType,
    ReceiveAck, RegisterPayload, RegisterResult, RequestMessage, ResponseMessage, SecurityTier,
    ACK_STATUS_PROCESSING, ACK_STATUS_RECEIVED,
};
pub use reason::{ConnectionEvent, ConnectionRole, DisconnectReason};

use std::time::{SystemTime, UNIX_EPOCH};

/// Protocol version a client advertises when none is configured.
pub const DEFAULT_PROTOCOL_VERSION: &str = "1.0.0";

/// Header carrying the caller-generated connection ID on upgrade.
pub const CONNECTION_ID_HEADER: &str = "ConnectionId";

/// Largest inbound websocket message either end accepts.
pub const MAX_MESSAGE_SIZE: usize = 512 * 1024;

/// Current wall-clock time as unix seconds.
pub fn unix_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

/// Current wall-clock time as unix milliseconds.
pub fn unix_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}
