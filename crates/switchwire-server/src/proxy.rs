//! Server-side protocol handling for one accepted SDK.

use crate::{Server, ServerHandler};
use futures_util::future::BoxFuture;
use std::sync::{Arc, Weak};
use switchwire_conn::{CancellationToken, Connection, MessageProcessor, ProcessError};
use switchwire_core::{DisconnectReason, MessageType, RegisterPayload, RegisterResult, RequestMessage, SecurityTier};

const UNTRUSTED_ERROR: &str = "Client not trusted for this operation";

/// Sends the hello, runs registration, and gates trusted-tier traffic.
pub struct ProxyMessageProcessor {
    server: Weak<Server>,
    handler: Arc<dyn ServerHandler>,
}

impl ProxyMessageProcessor {
    pub fn new(server: Weak<Server>, handler: Arc<dyn ServerHandler>) -> Self {
        Self { server, handler }
    }

    fn register(&self, conn: &Arc<Connection>, msg: &RequestMessage) -> Result<(), ProcessError> {
        let payload = match msg.data.clone().map(serde_json::from_value::<RegisterPayload>) {
            Some(Err(e)) => {
                tracing::warn!("connection {} sent an unreadable registration: {}", conn.id(), e);
                return Ok(conn.send_reply(
                    MessageType::RegisterSignal,
                    &msg.request_id,
                    &RegisterResult {
                        success: false,
                        message: format!("invalid registration payload: {e}"),
                    },
                )?);
            }
            Some(Ok(payload)) => payload,
            None => RegisterPayload::default(),
        };
        conn.update_client_info(|info| info.apply_registration(&payload));

        let trusted = match self.server.upgrade() {
            Some(server) => server.trust_client(conn.id()),
            None => Err(crate::ServerError::NotRunning),
        };
        let result = match trusted {
            Ok(()) => {
                conn.set_trusted(true);
                if let Some(info) = conn.client_info() {
                    tracing::info!(
                        "client {} registered as {} ({}/{})",
                        conn.id(),
                        info.service_name,
                        info.namespace_tag,
                        info.env_tag
                    );
                    self.handler.on_client_trusted(&info);
                }
                RegisterResult {
                    success: true,
                    message: "Registration successful".to_string(),
                }
            }
            Err(e) => {
                tracing::warn!("registration of {} failed: {}", conn.id(), e);
                RegisterResult {
                    success: false,
                    message: e.to_string(),
                }
            }
        };
        Ok(conn.send_reply(MessageType::RegisterSignal, &msg.request_id, &result)?)
    }

    fn dispatch(&self, conn: &Arc<Connection>, raw: &[u8]) {
        if let Some(server) = self.server.upgrade() {
            self.handler.on_message(&server, conn, raw);
        }
    }
}

impl MessageProcessor for ProxyMessageProcessor {
    fn process_message(&self, conn: &Arc<Connection>, raw: &[u8]) -> Result<(), ProcessError> {
        let msg: RequestMessage = serde_json::from_slice(raw)?;
        match msg.kind.security() {
            SecurityTier::Special => {
                if msg.kind == MessageType::RegisterSignal {
                    self.register(conn, &msg)?;
                } else {
                    tracing::warn!("connection {} sent unexpected {}", conn.id(), msg.kind);
                }
            }
            SecurityTier::Trusted => {
                conn.acknowledge(&msg.request_id)?;
                if !conn.is_trusted() {
                    conn.send_reply(
                        msg.kind.clone(),
                        &msg.request_id,
                        &serde_json::json!({ "error": UNTRUSTED_ERROR }),
                    )?;
                    return Err(ProcessError::Untrusted(conn.id().to_string()));
                }
                self.dispatch(conn, raw);
            }
            SecurityTier::Public => {
                if let Err(e) = conn.acknowledge(&msg.request_id) {
                    tracing::warn!("failed to acknowledge {}: {}", msg.request_id, e);
                }
                self.dispatch(conn, raw);
            }
        }
        Ok(())
    }

    fn on_connect<'a>(
        &'a self,
        conn: &'a Arc<Connection>,
        _shutdown: &'a CancellationToken,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let Some(server) = self.server.upgrade() else {
                return;
            };
            match conn.send_request(MessageType::ConnectHello, &server.hello_payload()) {
                Ok(_) => tracing::debug!("sent hello to {}", conn.id()),
                Err(e) => {
                    tracing::warn!("failed to greet {}: {}", conn.id(), e);
                    conn.fail(DisconnectReason::NetworkError);
                    return;
                }
            }
            self.handler.on_connect(conn);
        })
    }

    fn on_disconnect(&self, conn: &Connection, reason: DisconnectReason) {
        tracing::info!("client {} disconnected: {}", conn.id(), reason);
        self.handler.on_disconnect(conn, reason);
    }
}
