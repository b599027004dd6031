//! The reconnecting client.

use crate::{ClientConfig, ClientError, ClientHandler, ClientMessageProcessor, ReconnectState};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use switchwire_conn::{Connection, ConnectionStateChange, RetryPolicy, Transport};
use switchwire_core::{
    CONNECTION_ID_HEADER, ConnectionEvent, DisconnectReason, IdGenerator, MAX_MESSAGE_SIZE,
    MessageType, ServerInfo,
};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_util::sync::CancellationToken;

/// One logical connection to a switchwire server, redialed as needed.
///
/// Every dial builds a fresh [`Connection`]; the client only ever holds the
/// most recent one.
pub struct Client {
    config: ClientConfig,
    handler: Arc<dyn ClientHandler>,
    ids: IdGenerator,
    conn: Mutex<Option<Arc<Connection>>>,
    shutdown: CancellationToken,
    done: CancellationToken,
    started: AtomicBool,
    closed: AtomicBool,
}

impl Client {
    pub fn new(config: ClientConfig, handler: Arc<dyn ClientHandler>) -> Arc<Self> {
        Arc::new(Self {
            config,
            handler,
            ids: IdGenerator::connections(),
            conn: Mutex::new(None),
            shutdown: CancellationToken::new(),
            done: CancellationToken::new(),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    /// Spawn the run loop. Later calls do nothing.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("starting client for {}", self.config.address);
        tokio::spawn(Arc::clone(self).run());
    }

    async fn run(self: Arc<Self>) {
        let strategy = self.config.reconnect.clone();
        let mut state = ReconnectState::new();
        let (state_tx, mut state_rx) = mpsc::channel::<ConnectionStateChange>(1);

        while !self.shutdown.is_cancelled() {
            if state.should_reset(&strategy, Instant::now()) {
                tracing::info!(
                    "resetting reconnect counter after {:?}",
                    strategy.reset_interval
                );
                state.reset();
            }

            if let Err(e) = self.connect(state_tx.clone()).await {
                if strategy.exhausted(state.attempts) {
                    tracing::error!("giving up after {} failed attempts: {}", state.attempts, e);
                    break;
                }
                let delay = state.next_delay(&strategy);
                state.record_attempt(Instant::now());
                tracing::warn!(
                    "connection attempt {} failed: {}, retrying in {:?}",
                    state.attempts,
                    e,
                    delay
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => continue,
                    _ = self.shutdown.cancelled() => break,
                }
            }

            tracing::info!("connected to {}", self.config.address);
            let connected_at = Instant::now();

            let reason = tokio::select! {
                change = state_rx.recv() => match change {
                    Some(change) => change.reason.unwrap_or(DisconnectReason::Unknown),
                    None => break,
                },
                _ = self.shutdown.cancelled() => break,
            };
            if !reason.should_reconnect() {
                tracing::info!("connection closed ({}), not reconnecting", reason);
                break;
            }
            // Only a connection that outlived the reset interval clears the backoff.
            if connected_at.elapsed() >= strategy.reset_interval {
                state.reset();
            }
            let delay = state.next_delay(&strategy);
            state.record_attempt(Instant::now());
            tracing::warn!("connection lost ({}), reconnecting in {:?}", reason, delay);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.shutdown.cancelled() => break,
            }
        }

        self.slot().take();
        self.done.cancel();
        tracing::info!("client for {} stopped", self.config.address);
    }

    async fn connect(&self, state_tx: mpsc::Sender<ConnectionStateChange>) -> Result<(), ClientError> {
        let id = self.ids.next_prefixed()?;
        let mut request = self.config.address.as_str().into_client_request()?;
        let headers = request.headers_mut();
        for (name, value) in &self.config.headers {
            headers.insert(header_name(name)?, header_value(value)?);
        }
        headers.insert(header_name(CONNECTION_ID_HEADER)?, header_value(&id)?);
        tracing::info!("dialing {} as {}", self.config.address, id);

        let mut ws_config = WebSocketConfig::default();
        ws_config.max_message_size = Some(MAX_MESSAGE_SIZE);
        let (ws, _) = tokio::time::timeout(
            self.config.dial_timeout,
            tokio_tungstenite::connect_async_with_config(request, Some(ws_config), false),
        )
        .await
        .map_err(|_| ClientError::DialTimeout)??;
        let transport = Transport::from_websocket(ws).with_remote_addr(self.config.address.clone());

        let processor = ClientMessageProcessor::new(
            Arc::clone(&self.handler),
            self.config.handshake_timeout,
        );
        let conn = Connection::client(id, transport, self.config.settings(), Arc::new(processor));

        let fired = AtomicBool::new(false);
        conn.on_state_change(Arc::new(move |change: ConnectionStateChange| {
            if change.event != ConnectionEvent::Disconnected || fired.swap(true, Ordering::SeqCst) {
                return;
            }
            if state_tx.try_send(change).is_err() {
                tracing::warn!("state change already pending");
            }
        }));

        *self.slot() = Some(Arc::clone(&conn));
        conn.start(self.shutdown.child_token());
        Ok(())
    }

    fn slot(&self) -> MutexGuard<'_, Option<Arc<Connection>>> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The current connection, if one is live.
    pub fn connection(&self) -> Option<Arc<Connection>> {
        self.slot().clone()
    }

    fn active(&self) -> Result<Arc<Connection>, ClientError> {
        self.connection().ok_or(ClientError::NotConnected)
    }

    /// Queue a raw frame on the current connection.
    pub fn send(&self, raw: impl Into<String>) -> Result<(), ClientError> {
        Ok(self.active()?.send(raw)?)
    }

    /// Send an envelope without tracking acknowledgment.
    pub fn send_without_retry<P: Serialize + ?Sized>(
        &self,
        kind: impl Into<MessageType>,
        payload: &P,
    ) -> Result<String, ClientError> {
        Ok(self.active()?.send_request(kind, payload)?)
    }

    /// Reliable send: three retries, two seconds apart.
    pub fn send_request<P: Serialize + ?Sized>(
        &self,
        kind: impl Into<MessageType>,
        payload: &P,
        timeout: Duration,
    ) -> Result<String, ClientError> {
        self.send_request_with_custom_retry(kind, payload, RetryPolicy::with_timeout(timeout))
    }

    pub fn send_request_with_custom_retry<P: Serialize + ?Sized>(
        &self,
        kind: impl Into<MessageType>,
        payload: &P,
        policy: RetryPolicy,
    ) -> Result<String, ClientError> {
        Ok(self
            .active()?
            .send_request_with_retry(kind, payload, policy)?)
    }

    pub fn is_connected(&self) -> bool {
        self.connection().is_some_and(|conn| conn.is_active())
    }

    pub fn connection_id(&self) -> Option<String> {
        self.connection().map(|conn| conn.id().to_string())
    }

    pub fn server_version(&self) -> Option<String> {
        self.connection().and_then(|conn| conn.server_version())
    }

    pub fn server_info(&self) -> Option<ServerInfo> {
        self.connection().and_then(|conn| conn.server_info())
    }

    /// Stop the client and close the live connection. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            tracing::debug!("client already closed");
            return;
        }
        self.shutdown.cancel();
        if let Some(conn) = self.slot().take() {
            conn.close(DisconnectReason::ExternalClose);
        }
        if !self.started.load(Ordering::SeqCst) {
            self.done.cancel();
        }
        tracing::info!("client for {} closed", self.config.address);
    }

    /// Resolves once the run loop has ended.
    pub async fn closed(&self) {
        self.done.cancelled().await;
    }
}

fn header_name(name: &str) -> Result<HeaderName, ClientError> {
    HeaderName::from_bytes(name.as_bytes()).map_err(|_| ClientError::InvalidHeader(name.to_string()))
}

fn header_value(value: &str) -> Result<HeaderValue, ClientError> {
    HeaderValue::from_str(value).map_err(|_| ClientError::InvalidHeader(value.to_string()))
}
