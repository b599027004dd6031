//! Client half of the handshake.
//!
//! The server speaks first with a hello. Only then does the client send its
//! registration, and the server's answer decides whether the connection is
//! trusted, rejected for good, or retried.

use crate::ClientHandler;
use futures_util::future::BoxFuture;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use switchwire_conn::{Connection, MessageProcessor, ProcessError};
use switchwire_core::{
    ConnectHelloPayload, DisconnectReason, MessageType, RegisterResult, ResponseMessage,
    SecurityTier, ServerInfo,
};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// [`MessageProcessor`] for client-role connections. One per connection.
pub struct ClientMessageProcessor {
    handler: Arc<dyn ClientHandler>,
    handshake_timeout: Duration,
    /// Signalled once the hello has been parsed.
    ready: Notify,
    trusted: AtomicBool,
}

impl ClientMessageProcessor {
    pub fn new(handler: Arc<dyn ClientHandler>, handshake_timeout: Duration) -> Self {
        Self {
            handler,
            handshake_timeout,
            ready: Notify::new(),
            trusted: AtomicBool::new(false),
        }
    }

    fn register(&self, conn: &Arc<Connection>) {
        if let Some(payload) = self.handler.register_payload(conn) {
            match conn.send_request(MessageType::RegisterSignal, &payload) {
                Ok(_) => tracing::info!("sent registration for service {}", payload.service_name),
                Err(e) => tracing::error!(
                    "registration for service {} not sent: {}",
                    payload.service_name,
                    e
                ),
            }
        }
        self.handler.on_connect(conn);
    }

    fn handle_hello(&self, conn: &Connection, msg: &ResponseMessage) {
        let hello = msg
            .data
            .clone()
            .map(serde_json::from_value::<ConnectHelloPayload>);
        let hello = match hello {
            Some(Ok(hello)) => hello,
            Some(Err(e)) => {
                tracing::error!("connection {} got a malformed hello: {}", conn.id(), e);
                conn.fail(DisconnectReason::HandshakeFailed);
                return;
            }
            None => {
                tracing::error!("connection {} got a hello without payload", conn.id());
                conn.fail(DisconnectReason::HandshakeFailed);
                return;
            }
        };

        conn.set_server_info(ServerInfo {
            version: msg.server_version.clone(),
            name: hello.server_info,
            description: format!(
                "Max clients: {}, Current: {}",
                hello.max_clients, hello.current_count
            ),
            capabilities: hello.support_types.into_iter().map(String::from).collect(),
            config: hello.metadata,
            start_time: hello.server_time,
        });
        // Notify keeps a single permit, so a repeated hello is not an error.
        self.ready.notify_one();
        tracing::debug!("connection {} ready to register", conn.id());
    }

    fn handle_register_response(&self, conn: &Arc<Connection>, msg: &ResponseMessage) {
        let result = msg
            .data
            .clone()
            .and_then(|data| serde_json::from_value::<RegisterResult>(data).ok());
        match result {
            None => {
                tracing::error!(
                    "connection {} got a malformed registration response",
                    conn.id()
                );
                conn.fail(DisconnectReason::HandshakeFailed);
            }
            Some(RegisterResult { success: true, .. }) => {
                if !self.trusted.swap(true, Ordering::SeqCst) {
                    tracing::info!("connection {} registered and trusted", conn.id());
                    self.handler.on_trusted(conn);
                }
            }
            Some(RegisterResult { message, .. }) => {
                tracing::error!("connection {} registration rejected: {}", conn.id(), message);
                conn.fail(DisconnectReason::AuthFailed);
            }
        }
    }
}

impl MessageProcessor for ClientMessageProcessor {
    fn process_message(&self, conn: &Arc<Connection>, raw: &[u8]) -> Result<(), ProcessError> {
        let msg: ResponseMessage = serde_json::from_slice(raw)?;
        match msg.kind.security() {
            SecurityTier::Special => match msg.kind {
                MessageType::ConnectHello => self.handle_hello(conn, &msg),
                MessageType::RegisterSignal => self.handle_register_response(conn, &msg),
                _ => tracing::warn!("unexpected handshake message {}", msg.kind),
            },
            SecurityTier::Trusted | SecurityTier::Public => {
                if let Err(e) = conn.acknowledge(&msg.request_id) {
                    tracing::warn!("ack for {} not sent: {}", msg.request_id, e);
                }
                self.handler.on_message(conn, raw);
            }
        }
        Ok(())
    }

    fn on_connect<'a>(
        &'a self,
        conn: &'a Arc<Connection>,
        shutdown: &'a CancellationToken,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            tokio::select! {
                _ = self.ready.notified() => self.register(conn),
                _ = tokio::time::sleep(self.handshake_timeout) => {
                    tracing::error!("handshake timed out on connection {}", conn.id());
                    conn.fail(DisconnectReason::HandshakeFailed);
                }
                _ = shutdown.cancelled() => {
                    tracing::info!("handshake on connection {} cancelled", conn.id());
                }
                _ = conn.cancelled() => {}
            }
        })
    }

    fn on_disconnect(&self, conn: &Connection, reason: DisconnectReason) {
        self.handler.on_disconnect(conn, reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{SinkExt, StreamExt};
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;
    use switchwire_conn::{ConnectionSettings, Frame, FrameStream, Transport};
    use switchwire_core::{ReceiveAck, RegisterPayload, RequestMessage, unix_seconds};

    #[derive(Default)]
    struct Hooks {
        trusted: AtomicUsize,
        connected: AtomicUsize,
        messages: Mutex<Vec<String>>,
        disconnects: Mutex<Vec<DisconnectReason>>,
    }

    impl ClientHandler for Hooks {
        fn register_payload(&self, _conn: &Connection) -> Option<RegisterPayload> {
            Some(RegisterPayload {
                service_name: "svc-a".into(),
                namespace_tag: "ns1".into(),
                env_tag: "prod".into(),
                ..Default::default()
            })
        }

        fn on_connect(&self, _conn: &Arc<Connection>) {
            self.connected.fetch_add(1, Ordering::SeqCst);
        }

        fn on_trusted(&self, _conn: &Arc<Connection>) {
            self.trusted.fetch_add(1, Ordering::SeqCst);
        }

        fn on_disconnect(&self, _conn: &Connection, reason: DisconnectReason) {
            self.disconnects.lock().unwrap().push(reason);
        }

        fn on_message(&self, _conn: &Arc<Connection>, raw: &[u8]) {
            self.messages
                .lock()
                .unwrap()
                .push(String::from_utf8_lossy(raw).into_owned());
        }
    }

    fn response(kind: MessageType, request_id: &str, data: serde_json::Value) -> Frame {
        let msg = ResponseMessage {
            kind,
            request_id: request_id.into(),
            server_version: "3.1.0".into(),
            timestamp: unix_seconds(),
            client_id: "c1".into(),
            service_name: String::new(),
            namespace_tag: String::new(),
            env_tag: String::new(),
            data: Some(data),
        };
        Frame::Text(serde_json::to_string(&msg).unwrap())
    }

    fn hello() -> Frame {
        response(
            MessageType::ConnectHello,
            "hello-1",
            serde_json::json!({
                "server_info": "test server",
                "support_types": ["SWITCH_FULL", "REGISTER_SIGNAL"],
                "server_time": 1_700_000_000,
                "max_clients": 1000,
                "current_count": 0,
                "metadata": {"region": "eu"}
            }),
        )
    }

    async fn next_text(stream: &mut FrameStream) -> String {
        loop {
            if let Frame::Text(text) = stream.next().await.unwrap().unwrap() {
                return text;
            }
        }
    }

    fn setup(timeout: Duration) -> (Arc<Hooks>, Arc<Connection>, Transport) {
        let hooks = Arc::new(Hooks::default());
        let processor = ClientMessageProcessor::new(hooks.clone(), timeout);
        let (local, peer) = Transport::pair();
        let conn = Connection::client(
            "c1",
            local,
            ConnectionSettings::default(),
            Arc::new(processor),
        );
        conn.start(CancellationToken::new());
        (hooks, conn, peer)
    }

    #[tokio::test]
    async fn hello_then_register_then_trusted() {
        let (hooks, conn, peer) = setup(Duration::from_secs(30));
        let (mut sink, mut stream) = peer.into_parts();

        sink.send(hello()).await.unwrap();
        let register: RequestMessage = serde_json::from_str(&next_text(&mut stream).await).unwrap();
        assert_eq!(register.kind, MessageType::RegisterSignal);
        let payload: RegisterPayload = serde_json::from_value(register.data.unwrap()).unwrap();
        assert_eq!(payload.service_name, "svc-a");

        let info = conn.server_info().unwrap();
        assert_eq!(info.version, "3.1.0");
        assert_eq!(info.name, "test server");
        assert_eq!(info.description, "Max clients: 1000, Current: 0");
        assert_eq!(info.capabilities, vec!["SWITCH_FULL", "REGISTER_SIGNAL"]);

        let ok = serde_json::json!({"success": true, "message": "ok"});
        sink.send(response(MessageType::RegisterSignal, &register.request_id, ok.clone()))
            .await
            .unwrap();
        sink.send(response(MessageType::RegisterSignal, &register.request_id, ok))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(hooks.trusted.load(Ordering::SeqCst), 1);
        assert_eq!(hooks.connected.load(Ordering::SeqCst), 1);
        assert!(conn.is_active());
    }

    #[tokio::test]
    async fn rejection_is_auth_failure() {
        let (hooks, conn, peer) = setup(Duration::from_secs(30));
        let (mut sink, mut stream) = peer.into_parts();
        sink.send(hello()).await.unwrap();
        let register: RequestMessage = serde_json::from_str(&next_text(&mut stream).await).unwrap();

        let no = serde_json::json!({"success": false, "message": "unknown service"});
        sink.send(response(MessageType::RegisterSignal, &register.request_id, no))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(conn.disconnect_reason(), Some(DisconnectReason::AuthFailed));
        assert_eq!(*hooks.disconnects.lock().unwrap(), vec![DisconnectReason::AuthFailed]);
        assert_eq!(hooks.trusted.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn malformed_hello_fails_handshake() {
        let (_hooks, conn, peer) = setup(Duration::from_secs(30));
        let (mut sink, _stream) = peer.into_parts();
        sink.send(response(MessageType::ConnectHello, "h", serde_json::json!("nope")))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(conn.disconnect_reason(), Some(DisconnectReason::HandshakeFailed));
    }

    #[tokio::test]
    async fn malformed_register_response_fails_handshake() {
        let (_hooks, conn, peer) = setup(Duration::from_secs(30));
        let (mut sink, _stream) = peer.into_parts();
        sink.send(response(MessageType::RegisterSignal, "r", serde_json::json!({"message": "?"})))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(conn.disconnect_reason(), Some(DisconnectReason::HandshakeFailed));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_server_times_out_handshake() {
        let (hooks, conn, _peer) = setup(Duration::from_secs(30));
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(conn.disconnect_reason(), Some(DisconnectReason::HandshakeFailed));
        assert_eq!(hooks.connected.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn business_message_is_acked_then_handled() {
        let (hooks, _conn, peer) = setup(Duration::from_secs(30));
        let (mut sink, mut stream) = peer.into_parts();
        sink.send(response(MessageType::SwitchFull, "push-1", serde_json::json!({"switches": []})))
            .await
            .unwrap();

        let ack: ReceiveAck = serde_json::from_str(&next_text(&mut stream).await).unwrap();
        assert_eq!(ack.request_id, "push-1");
        assert_eq!(ack.status, "received");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(hooks.messages.lock().unwrap().len(), 1);
    }
}
