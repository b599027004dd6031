//! Who is on the other end of a connection.
//!
//! A proxy keeps a [`ClientProxyInfo`] per remote SDK, filled first from the
//! upgrade request and then from the registration payload. A client keeps
//! the [`ServerInfo`] it learned from the hello.

use crate::RegisterPayload;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Identity of a remote SDK as seen by the server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientProxyInfo {
    /// Connection ID supplied in the upgrade header.
    pub id: String,
    pub remote_addr: String,
    #[serde(default)]
    pub public_ip: Vec<String>,
    #[serde(default)]
    pub internal_ip: Vec<String>,
    #[serde(default)]
    pub user_agent: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Unix milliseconds at upgrade.
    pub connect_time: i64,
    #[serde(default)]
    pub service_name: String,
    #[serde(default, rename = "serverVersion")]
    pub server_version: String,
    #[serde(default)]
    pub namespace_tag: String,
    #[serde(default)]
    pub env_tag: String,
    /// Upgrade path the client connected through.
    #[serde(default)]
    pub endpoint: String,
}

impl ClientProxyInfo {
    /// Fold a registration payload into this record.
    pub fn apply_registration(&mut self, payload: &RegisterPayload) {
        self.service_name = payload.service_name.clone();
        self.internal_ip = payload.internal_ips.clone();
        self.public_ip = payload.public_ips.clone();
        self.namespace_tag = payload.namespace_tag.clone();
        self.env_tag = payload.env_tag.clone();
    }

    /// Key identifying the physical device behind this connection.
    ///
    /// First internal IP, else first public IP, else the transport address,
    /// combined with service name, namespace and env.
    pub fn device_key(&self) -> String {
        let host = first_non_empty(&self.internal_ip)
            .or_else(|| first_non_empty(&self.public_ip))
            .unwrap_or(&self.remote_addr);
        format!(
            "{}:{}:{}:{}",
            host, self.service_name, self.namespace_tag, self.env_tag
        )
    }
}

fn first_non_empty(ips: &[String]) -> Option<&String> {
    ips.first().filter(|ip| !ip.is_empty())
}

/// Server metadata, advertised by a proxy and learned by a client.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub version: String,
    pub name: String,
    pub description: String,
    pub capabilities: Vec<String>,
    pub config: BTreeMap<String, String>,
    /// Unix seconds reported by the server.
    pub start_time: i64,
}
