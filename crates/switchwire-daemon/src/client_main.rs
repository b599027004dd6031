//! switchwire client daemon.
//!
//! Registers with a server, asks for the full switch and driver snapshots,
//! and logs every push it receives.
//!
//! Run:
//!   switchwire-client --address ws://127.0.0.1:8080/ws/config/fullSync \
//!       --service-name billing --namespace payments --env prod

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use switchwire_client::{Client, ClientConfig, ClientHandler, Connection, RetryPolicy};
use switchwire_core::{DisconnectReason, DriverConfigPayload, MessageType, ReceiveAck, RegisterPayload, ResponseMessage};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "switchwire-client", version, about = "Register with a switchwire server and log configuration pushes")]
struct Args {
    /// TOML config file.
    #[arg(short, long, env = "SWITCHWIRE_CONFIG")]
    config: Option<PathBuf>,

    /// Server websocket URL, overriding the config file.
    #[arg(long, env = "SWITCHWIRE_ADDRESS")]
    address: Option<String>,

    #[arg(long, env = "SWITCHWIRE_SERVICE", default_value = "switchwire-client")]
    service_name: String,

    #[arg(long, env = "SWITCHWIRE_NAMESPACE", default_value = "default")]
    namespace: String,

    #[arg(long, env = "SWITCHWIRE_ENV", default_value = "dev")]
    env: String,

    /// Internal IP to report. Repeatable.
    #[arg(long = "internal-ip")]
    internal_ips: Vec<String>,

    /// Public IP to report. Repeatable.
    #[arg(long = "public-ip")]
    public_ips: Vec<String>,
}

struct Subscriber {
    identity: RegisterPayload,
}

impl Subscriber {
    fn log_push(msg: &ResponseMessage) {
        let Some(data) = &msg.data else {
            tracing::info!("{} with no data", msg.kind);
            return;
        };
        match msg.kind {
            MessageType::SwitchFull => {
                let count = data["switches"].as_array().map_or(0, Vec::len);
                tracing::info!("Received {} switches", count);
            }
            MessageType::DriverConfigFull => {
                match serde_json::from_value::<Vec<DriverConfigPayload>>(data["drivers"].clone()) {
                    Ok(drivers) => {
                        for driver in drivers {
                            tracing::info!("Driver {}: {}", driver.driver_type, driver.config);
                        }
                    }
                    Err(e) => tracing::warn!("unreadable driver list: {}", e),
                }
            }
            _ => tracing::info!("{}: {}", msg.kind, data),
        }
    }
}

impl ClientHandler for Subscriber {
    fn register_payload(&self, conn: &Connection) -> Option<RegisterPayload> {
        Some(RegisterPayload {
            client_id: conn.id().to_string(),
            ..self.identity.clone()
        })
    }

    fn on_trusted(&self, conn: &Arc<Connection>) {
        tracing::info!("Registered as {}", self.identity.service_name);
        for kind in [MessageType::SwitchFull, MessageType::DriverConfigFull] {
            if let Err(e) =
                conn.send_request_with_retry(kind.clone(), &serde_json::json!({}), RetryPolicy::default())
            {
                tracing::warn!("failed to request {}: {}", kind, e);
            }
        }
    }

    fn on_disconnect(&self, conn: &Connection, reason: DisconnectReason) {
        tracing::warn!("{} disconnected: {}", conn.id(), reason);
    }

    fn on_message(&self, conn: &Arc<Connection>, raw: &[u8]) {
        let msg: ResponseMessage = match serde_json::from_slice(raw) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!("unreadable push: {}", e);
                return;
            }
        };
        Self::log_push(&msg);
        if let Err(e) = conn.send_json(&ReceiveAck::processed(&msg.request_id, "Message processed")) {
            tracing::warn!("failed to confirm {}: {}", msg.request_id, e);
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("switchwire=info".parse()?))
        .init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => ClientConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => ClientConfig::default(),
    };
    if let Some(address) = args.address {
        config.address = address;
    }

    let identity = RegisterPayload {
        service_name: args.service_name,
        sdk_version: env!("CARGO_PKG_VERSION").to_string(),
        internal_ips: args.internal_ips,
        public_ips: args.public_ips,
        namespace_tag: args.namespace,
        env_tag: args.env,
        ..Default::default()
    };
    tracing::info!("Connecting to {} as {}", config.address, identity.service_name);

    let client = Client::new(config, Arc::new(Subscriber { identity }));
    client.start();

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            tracing::info!("Interrupted, closing");
            client.close();
        }
        _ = client.closed() => {}
    }
    client.closed().await;
    Ok(())
}
