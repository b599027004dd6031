//! switchwire server daemon.
//!
//! Serves a JSON snapshot of switches and driver configs to registered SDKs.
//!
//! Run:
//!   switchwire-server --config server.toml --snapshot snapshot.json
//!
//! where `snapshot.json` looks like `{"switches": [...], "drivers": [...]}`.

use anyhow::Context;
use clap::Parser;
use serde::Deserialize;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use switchwire_core::{ClientProxyInfo, DisconnectReason, DriverConfigPayload, MessageType, RequestMessage};
use switchwire_server::{Connection, Server, ServerConfig, ServerError, ServerHandler};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "switchwire-server", version, about = "Push switch and driver configuration to connected SDKs")]
struct Args {
    /// TOML config file.
    #[arg(short, long, env = "SWITCHWIRE_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address, overriding the config file.
    #[arg(long, env = "SWITCHWIRE_ADDRESS")]
    address: Option<String>,

    #[arg(long)]
    max_connections: Option<usize>,

    /// JSON file with `switches` and `drivers` arrays.
    #[arg(long, env = "SWITCHWIRE_SNAPSHOT")]
    snapshot: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Snapshot {
    switches: Vec<serde_json::Value>,
    drivers: Vec<DriverConfigPayload>,
}

struct Publisher {
    snapshot: Snapshot,
}

impl Publisher {
    fn answer(
        &self,
        server: &Server,
        conn: &Arc<Connection>,
        msg: &RequestMessage,
    ) -> Result<(), ServerError> {
        let retry = &server.config().retry;
        match &msg.kind {
            MessageType::SwitchFull => {
                server.send_reliable_message_with_retry(
                    conn.id(),
                    MessageType::SwitchFull,
                    &json!({ "switches": self.snapshot.switches }),
                    retry.switch_data,
                )?;
            }
            MessageType::DriverConfigFull => {
                server.send_reliable_message_with_retry(
                    conn.id(),
                    MessageType::DriverConfigFull,
                    &json!({ "drivers": self.snapshot.drivers }),
                    retry.full_config,
                )?;
            }
            other => conn.send_reply(
                other.clone(),
                &msg.request_id,
                &json!({ "error": true, "message": format!("unsupported message type {other}") }),
            )?,
        }
        Ok(())
    }
}

impl ServerHandler for Publisher {
    fn on_client_trusted(&self, info: &ClientProxyInfo) {
        tracing::info!(
            "{} trusted: {} ({}/{}) via {}",
            info.id,
            info.service_name,
            info.namespace_tag,
            info.env_tag,
            info.endpoint
        );
    }

    fn on_disconnect(&self, conn: &Connection, reason: DisconnectReason) {
        tracing::info!("{} gone: {}", conn.id(), reason);
    }

    fn on_message(&self, server: &Arc<Server>, conn: &Arc<Connection>, raw: &[u8]) {
        let msg: RequestMessage = match serde_json::from_slice(raw) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!("unreadable message from {}: {}", conn.id(), e);
                return;
            }
        };
        if let Err(e) = self.answer(server, conn, &msg) {
            tracing::warn!("failed to answer {} from {}: {}", msg.kind, conn.id(), e);
        }
    }
}

fn load_snapshot(path: Option<&PathBuf>) -> anyhow::Result<Snapshot> {
    let Some(path) = path else {
        return Ok(Snapshot::default());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading snapshot {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing snapshot {}", path.display()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("switchwire=info".parse()?))
        .init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => ServerConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => ServerConfig::default(),
    };
    if let Some(address) = args.address {
        config.address = address;
    }
    if let Some(max) = args.max_connections {
        config.max_connections = max;
    }

    let snapshot = load_snapshot(args.snapshot.as_ref())?;
    tracing::info!(
        "Loaded {} switches and {} drivers",
        snapshot.switches.len(),
        snapshot.drivers.len()
    );

    let server = Server::new(config, Arc::new(Publisher { snapshot }));
    let addr = server.start().await?;
    tracing::info!("Serving on {} (Ctrl-C to stop)", addr);

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    server.stop().await?;
    Ok(())
}
