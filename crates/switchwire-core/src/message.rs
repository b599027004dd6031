//! Protocol messages.
//!
//! Every frame is a JSON text message. Clients send [`RequestMessage`]s,
//! servers send [`ResponseMessage`]s, and either side answers a reliable
//! message with a [`ReceiveAck`]. Payloads travel as raw JSON in `data`; the
//! typed payloads in this module are what the handshake puts there.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Ack status sent as soon as a frame is received (phase 1).
pub const ACK_STATUS_RECEIVED: &str = "received";

/// Ack status a business handler sends once processing finished (phase 2).
pub const ACK_STATUS_PROCESSING: &str = "processing";

/// The type tag of an envelope.
///
/// The reserved types are named variants; anything else a peer sends is kept
/// verbatim in [`MessageType::Other`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageType {
    /// Full switch snapshot pushed after startup.
    SwitchFull,
    /// Full driver configuration pushed after startup.
    DriverConfigFull,
    /// Incremental driver configuration change.
    DriverConfigChange,
    /// Server greeting sent as soon as the upgrade completes.
    ConnectHello,
    /// Client registration, and the server's answer to it.
    RegisterSignal,
    /// Any application-defined type.
    Other(String),
}

impl MessageType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::SwitchFull => "SWITCH_FULL",
            Self::DriverConfigFull => "DRIVER_CONFIG_FULL",
            Self::DriverConfigChange => "DRIVER_CONFIG_CHANGE",
            Self::ConnectHello => "CONNECT_HELLO",
            Self::RegisterSignal => "REGISTER_SIGNAL",
            Self::Other(s) => s,
        }
    }

    /// The security tier governing acknowledgment and trust gating.
    pub fn security(&self) -> SecurityTier {
        match self {
            Self::RegisterSignal | Self::ConnectHello => SecurityTier::Special,
            Self::SwitchFull | Self::DriverConfigFull | Self::DriverConfigChange => {
                SecurityTier::Trusted
            }
            Self::Other(_) => SecurityTier::Public,
        }
    }

    /// Types a server advertises in its hello.
    pub fn supported() -> Vec<MessageType> {
        vec![
            Self::SwitchFull,
            Self::DriverConfigFull,
            Self::DriverConfigChange,
            Self::RegisterSignal,
            Self::ConnectHello,
        ]
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for MessageType {
    fn from(s: String) -> Self {
        match s.as_str() {
            "SWITCH_FULL" => Self::SwitchFull,
            "DRIVER_CONFIG_FULL" => Self::DriverConfigFull,
            "DRIVER_CONFIG_CHANGE" => Self::DriverConfigChange,
            "CONNECT_HELLO" => Self::ConnectHello,
            "REGISTER_SIGNAL" => Self::RegisterSignal,
            _ => Self::Other(s),
        }
    }
}

impl From<&str> for MessageType {
    fn from(s: &str) -> Self {
        s.to_string().into()
    }
}

impl From<MessageType> for String {
    fn from(t: MessageType) -> Self {
        match t {
            MessageType::Other(s) => s,
            other => other.as_str().to_string(),
        }
    }
}

/// Per-type classification deciding how a received envelope is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityTier {
    /// No trust requirement; acknowledged then dispatched.
    Public,
    /// Acknowledged, then dispatched only if the sender is trusted.
    Trusted,
    /// Handshake traffic; never acknowledged, handled by the processor.
    Special,
}

/// Envelope sent from client to server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestMessage {
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub request_id: String,
    pub client_id: String,
    pub timestamp: i64,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// Envelope sent from server to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseMessage {
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub request_id: String,
    #[serde(default)]
    pub server_version: String,
    pub timestamp: i64,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub service_name: String,
    #[serde(default)]
    pub namespace_tag: String,
    #[serde(default)]
    pub env_tag: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// Receive acknowledgment, valid in either direction.
///
/// Distinguished from an envelope by having a `status` and no `type`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiveAck {
    pub request_id: String,
    pub status: String,
    #[serde(default)]
    pub message: String,
    pub timestamp: i64,
}

impl ReceiveAck {
    /// Phase-1 acknowledgment for `request_id`.
    pub fn received(request_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            status: ACK_STATUS_RECEIVED.to_string(),
            message: message.into(),
            timestamp: crate::unix_seconds(),
        }
    }

    /// Phase-2 acknowledgment, sent by business handlers.
    pub fn processed(request_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status: ACK_STATUS_PROCESSING.to_string(),
            ..Self::received(request_id, message)
        }
    }
}

/// What a client tells the server about itself when registering.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterPayload {
    pub service_name: String,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub sdk_version: String,
    #[serde(default)]
    pub internal_ips: Vec<String>,
    #[serde(default)]
    pub public_ips: Vec<String>,
    #[serde(default)]
    pub namespace_tag: String,
    #[serde(default)]
    pub env_tag: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<BTreeMap<String, String>>,
}

/// Greeting the server pushes right after the upgrade.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectHelloPayload {
    pub server_info: String,
    #[serde(default)]
    pub support_types: Vec<MessageType>,
    pub server_time: i64,
    pub max_clients: usize,
    pub current_count: usize,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

/// Body of the server's answer to a registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterResult {
    pub success: bool,
    #[serde(default)]
    pub message: String,
}

/// One driver's configuration, carried by `DRIVER_CONFIG_*` messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverConfigPayload {
    #[serde(rename = "type")]
    pub driver_type: String,
    pub config: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change: Option<IncrementChangeKind>,
}

/// How an incremental driver change applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum IncrementChangeKind {
    Update,
    Add,
    Delete,
}

/// Shape of an inbound frame, decided before full decoding.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// A receive acknowledgment for one of our pending requests.
    Ack(ReceiveAck),
    /// A business or handshake envelope.
    Envelope,
}

#[derive(Deserialize)]
struct Shape {
    #[serde(default, rename = "type")]
    kind: Option<serde_json::Value>,
    #[serde(default)]
    status: String,
    #[serde(default)]
    request_id: String,
}

impl Inbound {
    /// Sort a raw frame into one of the two known shapes.
    pub fn classify(raw: &[u8]) -> Result<Self, serde_json::Error> {
        let shape: Shape = serde_json::from_slice(raw)?;
        let untyped = match &shape.kind {
            None | Some(serde_json::Value::Null) => true,
            Some(serde_json::Value::String(s)) => s.is_empty(),
            Some(_) => false,
        };
        if untyped && !shape.status.is_empty() && !shape.request_id.is_empty() {
            return Ok(Self::Ack(serde_json::from_slice(raw)?));
        }
        Ok(Self::Envelope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_types_roundtrip() {
        for t in MessageType::supported() {
            let s = serde_json::to_string(&t).unwrap();
            let back: MessageType = serde_json::from_str(&s).unwrap();
            assert_eq!(t, back);
        }
        let custom: MessageType = serde_json::from_str("\"PING_APP\"").unwrap();
        assert_eq!(custom, MessageType::Other("PING_APP".into()));
    }

    #[test]
    fn tiers() {
        assert_eq!(MessageType::ConnectHello.security(), SecurityTier::Special);
        assert_eq!(MessageType::RegisterSignal.security(), SecurityTier::Special);
        assert_eq!(MessageType::SwitchFull.security(), SecurityTier::Trusted);
        assert_eq!(MessageType::DriverConfigChange.security(), SecurityTier::Trusted);
        assert_eq!(MessageType::from("anything").security(), SecurityTier::Public);
    }

    #[test]
    fn classify_ack() {
        let ack = ReceiveAck::received("req-1", "ok");
        let raw = serde_json::to_vec(&ack).unwrap();
        assert_eq!(Inbound::classify(&raw).unwrap(), Inbound::Ack(ack));
    }

    #[test]
    fn classify_envelope() {
        let raw = br#"{"type":"SWITCH_FULL","request_id":"r","status":"x","timestamp":1}"#;
        assert_eq!(Inbound::classify(raw).unwrap(), Inbound::Envelope);
        let no_id = br#"{"status":"received"}"#;
        assert_eq!(Inbound::classify(no_id).unwrap(), Inbound::Envelope);
        assert!(Inbound::classify(b"not json").is_err());
    }

    #[test]
    fn request_omits_empty_data() {
        let msg = RequestMessage {
            kind: MessageType::RegisterSignal,
            request_id: "r".into(),
            client_id: "c".into(),
            timestamp: 0,
            version: "1.0.0".into(),
            data: None,
        };
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["type"], "REGISTER_SIGNAL");
        assert!(v.get("data").is_none());
    }

    #[test]
    fn increment_kind_is_uppercase() {
        let p = DriverConfigPayload {
            driver_type: "kafka_consumer".into(),
            config: serde_json::json!({"topic": "t"}),
            change: Some(IncrementChangeKind::Delete),
        };
        let v = serde_json::to_value(&p).unwrap();
        assert_eq!(v["change"], "DELETE");
        assert_eq!(v["type"], "kafka_consumer");
    }
}
