//! One duplex link and the workers that drive it.

use crate::pending::{PendingRequest, PendingRequests, RetryPolicy};
use crate::transport::{Frame, FrameSink, FrameStream, Transport, TransportError};
use crate::{ConnectionError, ConnectionSettings, MessageProcessor, lock};
use futures_util::{FutureExt, SinkExt, StreamExt};
use serde::Serialize;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};
use switchwire_core::{
    ClientProxyInfo, ConnectionEvent, ConnectionRole, DisconnectReason, Inbound, MessageType,
    ReceiveAck, RequestMessage, ResponseMessage, ServerInfo, unix_millis, unix_seconds,
};
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep, timeout, timeout_at};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

/// Reported to the state-change callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStateChange {
    pub event: ConnectionEvent,
    pub connection_id: String,
    pub role: ConnectionRole,
    pub reason: Option<DisconnectReason>,
}

pub type StateChangeCallback = Arc<dyn Fn(ConnectionStateChange) + Send + Sync>;

/// Data only a client-role connection carries.
#[derive(Debug, Default)]
struct ClientConnectionData {
    /// Learned from the server's hello.
    server_info: RwLock<Option<ServerInfo>>,
}

/// Data only a proxy-role connection carries.
#[derive(Debug)]
struct ProxyConnectionData {
    info: RwLock<ClientProxyInfo>,
    trusted: AtomicBool,
    /// What this server advertises about itself.
    server_info: ServerInfo,
}

#[derive(Debug)]
enum RoleData {
    Client(ClientConnectionData),
    Proxy(ProxyConnectionData),
}

struct Outbound {
    active: bool,
    tx: Option<mpsc::Sender<Frame>>,
}

struct Liveness {
    last_seen: Instant,
    last_pong: Instant,
}

/// A persistent connection in either the client or the proxy role.
///
/// Created fresh for every dial or accepted upgrade and never reused. Closing
/// is final: the connection goes inactive exactly once and the outbound queue
/// is dropped at the same moment.
pub struct Connection {
    id: String,
    role: RoleData,
    settings: ConnectionSettings,
    processor: Arc<dyn MessageProcessor>,
    remote_addr: Option<String>,
    connected_at: i64,

    outbound: Mutex<Outbound>,
    queue: Mutex<Option<mpsc::Receiver<Frame>>>,
    transport: Mutex<Option<Transport>>,
    pending: PendingRequests,
    liveness: Mutex<Liveness>,

    internal: CancellationToken,
    failure: Mutex<Option<DisconnectReason>>,
    closed_with: Mutex<Option<DisconnectReason>>,
    started: AtomicBool,
    request_seq: AtomicU64,
    state_callback: Mutex<Option<StateChangeCallback>>,
}

impl Connection {
    /// A connection dialed by an SDK.
    pub fn client(
        id: impl Into<String>,
        transport: Transport,
        settings: ConnectionSettings,
        processor: Arc<dyn MessageProcessor>,
    ) -> Arc<Self> {
        let role = RoleData::Client(ClientConnectionData::default());
        Self::build(id.into(), role, transport, settings, processor)
    }

    /// The server's handle to one accepted SDK.
    pub fn proxy(
        id: impl Into<String>,
        transport: Transport,
        settings: ConnectionSettings,
        processor: Arc<dyn MessageProcessor>,
        info: ClientProxyInfo,
        server_info: ServerInfo,
    ) -> Arc<Self> {
        let role = RoleData::Proxy(ProxyConnectionData {
            info: RwLock::new(info),
            trusted: AtomicBool::new(false),
            server_info,
        });
        Self::build(id.into(), role, transport, settings, processor)
    }

    fn build(
        id: String,
        role: RoleData,
        transport: Transport,
        settings: ConnectionSettings,
        processor: Arc<dyn MessageProcessor>,
    ) -> Arc<Self> {
        let settings = settings.normalized();
        let (tx, rx) = mpsc::channel(settings.send_queue_capacity);
        let now = Instant::now();
        Arc::new(Self {
            id,
            role,
            processor,
            remote_addr: transport.remote_addr().map(str::to_owned),
            connected_at: unix_millis(),
            outbound: Mutex::new(Outbound {
                active: true,
                tx: Some(tx),
            }),
            queue: Mutex::new(Some(rx)),
            transport: Mutex::new(Some(transport)),
            pending: PendingRequests::new(),
            liveness: Mutex::new(Liveness {
                last_seen: now,
                last_pong: now,
            }),
            internal: CancellationToken::new(),
            failure: Mutex::new(None),
            closed_with: Mutex::new(None),
            started: AtomicBool::new(false),
            request_seq: AtomicU64::new(0),
            state_callback: Mutex::new(None),
            settings,
        })
    }

    /// Install the callback fired on start and on close.
    pub fn on_state_change(&self, callback: StateChangeCallback) {
        *lock(&self.state_callback) = Some(callback);
    }

    /// Launch the read, write and handshake workers.
    ///
    /// Only the first call has any effect. Cancelling `shutdown` closes the
    /// connection with [`DisconnectReason::ExternalClose`].
    pub fn start(self: &Arc<Self>, shutdown: CancellationToken) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(transport) = lock(&self.transport).take() else {
            return;
        };
        let Some(queue) = lock(&self.queue).take() else {
            return;
        };
        if !self.is_active() {
            return;
        }
        let (sink, stream) = transport.into_parts();
        tracing::debug!("starting {} connection {}", self.role(), self.id);
        self.notify(ConnectionEvent::Connected, None);

        self.spawn_worker("read", Arc::clone(self).read_loop(stream));
        self.spawn_worker(
            "write",
            Arc::clone(self).write_loop(sink, queue, shutdown.clone()),
        );

        let conn = Arc::clone(self);
        let processor = Arc::clone(&self.processor);
        let token = shutdown.clone();
        self.spawn_worker("handshake", async move {
            processor.on_connect(&conn, &token).await;
        });

        let conn = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    conn.close(DisconnectReason::ExternalClose);
                }
                _ = conn.internal.cancelled() => {
                    let reason = conn.failure_reason().unwrap_or(DisconnectReason::NetworkError);
                    conn.close(reason);
                }
            }
        });
    }

    /// Run a worker, turning a panic into a connection failure.
    fn spawn_worker<F>(self: &Arc<Self>, name: &'static str, worker: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let conn = Arc::clone(self);
        tokio::spawn(async move {
            if AssertUnwindSafe(worker).catch_unwind().await.is_err() {
                tracing::error!("{} worker of connection {} panicked", name, conn.id);
                conn.fail(DisconnectReason::NetworkError);
            }
        });
    }

    /// Record why the connection is failing and trigger internal cancellation.
    ///
    /// The first recorded reason wins; the supervisor closes with it.
    pub fn fail(&self, reason: DisconnectReason) {
        {
            let mut failure = lock(&self.failure);
            if failure.is_none() {
                *failure = Some(reason);
            }
        }
        self.internal.cancel();
    }

    fn failure_reason(&self) -> Option<DisconnectReason> {
        *lock(&self.failure)
    }

    /// Close the connection. Returns false if it was already closed.
    pub fn close(&self, reason: DisconnectReason) -> bool {
        {
            let mut out = lock(&self.outbound);
            if !out.active {
                return false;
            }
            out.active = false;
            out.tx = None;
        }
        *lock(&self.closed_with) = Some(reason);
        self.internal.cancel();

        // Never started: the write loop will not close the transport for us.
        if let Some(transport) = lock(&self.transport).take() {
            let write_timeout = self.settings.write_timeout;
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    let (mut sink, _) = transport.into_parts();
                    let _ = timeout(write_timeout, sink.close()).await;
                });
            }
        }

        let dropped = self.pending.clear();
        if dropped > 0 {
            tracing::info!(
                "dropped {} pending requests of connection {}",
                dropped,
                self.id
            );
        }
        tracing::info!("{} connection {} closed: {}", self.role(), self.id, reason);

        self.notify(ConnectionEvent::Disconnected, Some(reason));
        self.processor.on_disconnect(self, reason);
        true
    }

    fn notify(&self, event: ConnectionEvent, reason: Option<DisconnectReason>) {
        let callback = lock(&self.state_callback).clone();
        if let Some(callback) = callback {
            callback(ConnectionStateChange {
                event,
                connection_id: self.id.clone(),
                role: self.role(),
                reason,
            });
        }
    }

    async fn read_loop(self: Arc<Self>, mut stream: FrameStream) {
        let read_timeout = self.settings.read_timeout;
        let mut deadline = Instant::now() + read_timeout;
        loop {
            let next = tokio::select! {
                _ = self.internal.cancelled() => break,
                next = timeout_at(deadline, stream.next()) => next,
            };
            let frame = match next {
                Err(_) => {
                    tracing::warn!("connection {} read timed out", self.id);
                    self.fail(DisconnectReason::ReadTimeout);
                    break;
                }
                Ok(None) => {
                    tracing::debug!("connection {} closed by peer", self.id);
                    self.fail(DisconnectReason::NetworkError);
                    break;
                }
                Ok(Some(Err(e))) => {
                    tracing::warn!("connection {} read error: {}", self.id, e);
                    self.fail(DisconnectReason::NetworkError);
                    break;
                }
                Ok(Some(Ok(frame))) => frame,
            };

            let now = Instant::now();
            lock(&self.liveness).last_seen = now;
            match frame {
                Frame::Pong(_) => {
                    lock(&self.liveness).last_pong = now;
                    deadline = now + read_timeout;
                }
                Frame::Ping(_) => {}
                Frame::Close => {
                    tracing::debug!("connection {} received close frame", self.id);
                    self.fail(DisconnectReason::NetworkError);
                    break;
                }
                Frame::Text(text) => self.handle_message(text.as_bytes()),
                Frame::Binary(bytes) => self.handle_message(&bytes),
            }
        }
        tracing::debug!("read loop of connection {} exited", self.id);
    }

    async fn write_loop(
        self: Arc<Self>,
        mut sink: FrameSink,
        mut queue: mpsc::Receiver<Frame>,
        shutdown: CancellationToken,
    ) {
        let heartbeat = self.settings.heartbeat_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + heartbeat, heartbeat);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.internal.cancelled() => break,
                frame = queue.recv() => {
                    let Some(frame) = frame else { break };
                    if let Err(e) = self.write_frame(&mut sink, frame).await {
                        tracing::warn!("connection {} write failed: {}", self.id, e);
                        self.fail(DisconnectReason::WriteError);
                        break;
                    }
                }
                _ = ticker.tick() => {
                    let since_pong = lock(&self.liveness).last_pong.elapsed();
                    if since_pong > heartbeat * 2 {
                        tracing::warn!(
                            "connection {} missed heartbeat, last pong {:?} ago",
                            self.id,
                            since_pong
                        );
                        self.fail(DisconnectReason::HeartbeatTimeout);
                        break;
                    }
                    if let Err(e) = self.write_frame(&mut sink, Frame::Ping(Vec::new())).await {
                        tracing::warn!("connection {} heartbeat failed: {}", self.id, e);
                        self.fail(DisconnectReason::WriteError);
                        break;
                    }
                }
            }
        }
        let _ = timeout(self.settings.write_timeout, sink.close()).await;
        tracing::debug!("write loop of connection {} exited", self.id);
    }

    async fn write_frame(&self, sink: &mut FrameSink, frame: Frame) -> Result<(), TransportError> {
        timeout(self.settings.write_timeout, sink.send(frame))
            .await
            .map_err(|_| TransportError::WriteTimeout)?
    }

    fn handle_message(self: &Arc<Self>, raw: &[u8]) {
        match Inbound::classify(raw) {
            Err(e) => {
                tracing::warn!("connection {} sent an unreadable frame: {}", self.id, e);
            }
            Ok(Inbound::Ack(ack)) => {
                if self.pending.remove(&ack.request_id).is_some() {
                    tracing::debug!(
                        "request {} acknowledged ({}) on connection {}",
                        ack.request_id,
                        ack.status,
                        self.id
                    );
                }
            }
            Ok(Inbound::Envelope) => {
                if let Err(e) = self.processor.process_message(self, raw) {
                    tracing::warn!("connection {} message rejected: {}", self.id, e);
                }
            }
        }
    }

    /// Queue a raw text frame.
    pub fn send(&self, message: impl Into<String>) -> Result<(), ConnectionError> {
        self.enqueue(Frame::Text(message.into()))
    }

    /// Serialize `value` and queue it.
    pub fn send_json<T: Serialize + ?Sized>(&self, value: &T) -> Result<(), ConnectionError> {
        self.send(serde_json::to_string(value)?)
    }

    fn enqueue(&self, frame: Frame) -> Result<(), ConnectionError> {
        let out = lock(&self.outbound);
        let tx = match (&out.tx, out.active) {
            (Some(tx), true) => tx,
            _ => return Err(ConnectionError::NotActive),
        };
        tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ConnectionError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => ConnectionError::NotActive,
        })
    }

    /// Send a phase-1 receive acknowledgment.
    pub fn acknowledge(&self, request_id: &str) -> Result<(), ConnectionError> {
        self.send_json(&ReceiveAck::received(request_id, "Message received"))
    }

    /// Send an envelope without tracking it. Returns the new request ID.
    pub fn send_request<P: Serialize + ?Sized>(
        &self,
        kind: impl Into<MessageType>,
        payload: &P,
    ) -> Result<String, ConnectionError> {
        let request_id = self.next_request_id();
        self.send(self.envelope(&kind.into(), &request_id, payload)?)?;
        Ok(request_id)
    }

    /// Send an envelope reusing an existing request ID, as a reply.
    pub fn send_reply<P: Serialize + ?Sized>(
        &self,
        kind: impl Into<MessageType>,
        request_id: &str,
        payload: &P,
    ) -> Result<(), ConnectionError> {
        self.send(self.envelope(&kind.into(), request_id, payload)?)
    }

    /// Send an envelope and retransmit it until acknowledged or out of retries.
    ///
    /// Returns the request ID once the first transmission is queued. If that
    /// first send fails nothing is tracked and the error is returned.
    pub fn send_request_with_retry<P: Serialize + ?Sized>(
        self: &Arc<Self>,
        kind: impl Into<MessageType>,
        payload: &P,
        policy: RetryPolicy,
    ) -> Result<String, ConnectionError> {
        let kind = kind.into();
        let request_id = self.next_request_id();
        let original = self.envelope(&kind, &request_id, payload)?;
        self.pending.insert(PendingRequest::new(
            request_id.clone(),
            kind,
            original.clone(),
            policy,
        ));
        if let Err(e) = self.send(original) {
            self.pending.remove(&request_id);
            return Err(e);
        }
        tokio::spawn(Arc::clone(self).retry_until_acked(request_id.clone()));
        Ok(request_id)
    }

    async fn retry_until_acked(self: Arc<Self>, request_id: String) {
        let Some(first) = self.pending.get(&request_id) else {
            return;
        };
        let mut wait = first.timeout;
        loop {
            tokio::select! {
                _ = self.internal.cancelled() => return,
                _ = sleep(wait) => {}
            }
            let Some(request) = self.pending.get(&request_id) else {
                return;
            };
            if request.retries_exhausted() {
                self.pending.remove(&request_id);
                tracing::warn!(
                    "request {} ({}) on connection {} not acknowledged after {} retries",
                    request_id,
                    request.message_type,
                    self.id,
                    request.max_retries
                );
                return;
            }
            if !self.is_active() {
                self.pending.remove(&request_id);
                return;
            }
            let attempt = self
                .pending
                .bump_retry(&request_id)
                .unwrap_or(request.current_retry + 1);
            tracing::info!(
                "retrying request {} on connection {} ({}/{})",
                request_id,
                self.id,
                attempt,
                request.max_retries
            );
            if let Err(e) = self.send(request.original.clone()) {
                tracing::warn!("retry of request {} failed: {}", request_id, e);
            }
            tokio::select! {
                _ = self.internal.cancelled() => return,
                _ = sleep(request.retry_delay) => {}
            }
            wait = request.timeout;
        }
    }

    fn envelope<P: Serialize + ?Sized>(
        &self,
        kind: &MessageType,
        request_id: &str,
        payload: &P,
    ) -> Result<String, ConnectionError> {
        let data = serde_json::to_value(payload)?;
        let data = (!data.is_null()).then_some(data);
        let text = match &self.role {
            RoleData::Client(_) => serde_json::to_string(&RequestMessage {
                kind: kind.clone(),
                request_id: request_id.to_string(),
                client_id: self.id.clone(),
                timestamp: unix_seconds(),
                version: self.settings.version.clone(),
                data,
            })?,
            RoleData::Proxy(proxy) => {
                let info = proxy.info.read().unwrap_or_else(PoisonError::into_inner);
                serde_json::to_string(&ResponseMessage {
                    kind: kind.clone(),
                    request_id: request_id.to_string(),
                    server_version: self.settings.version.clone(),
                    timestamp: unix_seconds(),
                    client_id: info.id.clone(),
                    service_name: info.service_name.clone(),
                    namespace_tag: info.namespace_tag.clone(),
                    env_tag: info.env_tag.clone(),
                    data,
                })?
            }
        };
        Ok(text)
    }

    fn next_request_id(&self) -> String {
        let prefix = match self.role {
            RoleData::Client(_) => "client",
            RoleData::Proxy(_) => "server",
        };
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let seq = self.request_seq.fetch_add(1, Ordering::Relaxed);
        format!("{}-{}-{}-{}", prefix, self.id, nanos, seq)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn role(&self) -> ConnectionRole {
        match self.role {
            RoleData::Client(_) => ConnectionRole::Client,
            RoleData::Proxy(_) => ConnectionRole::Proxy,
        }
    }

    pub fn is_active(&self) -> bool {
        lock(&self.outbound).active
    }

    /// Resolves once the connection has failed or closed.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.internal.cancelled()
    }

    /// The reason the connection closed with, once closed.
    pub fn disconnect_reason(&self) -> Option<DisconnectReason> {
        *lock(&self.closed_with)
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    pub fn pending(&self) -> &PendingRequests {
        &self.pending
    }

    pub fn remote_addr(&self) -> Option<&str> {
        self.remote_addr.as_deref()
    }

    /// Unix milliseconds at construction.
    pub fn connected_at(&self) -> i64 {
        self.connected_at
    }

    /// Time of the last inbound frame of any kind.
    pub fn last_seen(&self) -> Instant {
        lock(&self.liveness).last_seen
    }

    pub fn last_pong(&self) -> Instant {
        lock(&self.liveness).last_pong
    }

    /// Whether the remote SDK finished registration. Always false for a
    /// client-role connection.
    pub fn is_trusted(&self) -> bool {
        match &self.role {
            RoleData::Proxy(proxy) => proxy.trusted.load(Ordering::SeqCst),
            RoleData::Client(_) => false,
        }
    }

    pub fn set_trusted(&self, trusted: bool) {
        if let RoleData::Proxy(proxy) = &self.role {
            proxy.trusted.store(trusted, Ordering::SeqCst);
        }
    }

    /// Identity of the remote SDK, for a proxy-role connection.
    pub fn client_info(&self) -> Option<ClientProxyInfo> {
        match &self.role {
            RoleData::Proxy(proxy) => Some(
                proxy
                    .info
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone(),
            ),
            RoleData::Client(_) => None,
        }
    }

    /// Modify the remote identity in place. No-op on a client connection.
    pub fn update_client_info(&self, update: impl FnOnce(&mut ClientProxyInfo)) {
        if let RoleData::Proxy(proxy) = &self.role {
            update(&mut proxy.info.write().unwrap_or_else(PoisonError::into_inner));
        }
    }

    /// What the server told us (client) or what we advertise (proxy).
    pub fn server_info(&self) -> Option<ServerInfo> {
        match &self.role {
            RoleData::Client(client) => client
                .server_info
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
            RoleData::Proxy(proxy) => Some(proxy.server_info.clone()),
        }
    }

    /// Record server metadata learned during the handshake.
    pub fn set_server_info(&self, info: ServerInfo) {
        if let RoleData::Client(client) = &self.role {
            *client
                .server_info
                .write()
                .unwrap_or_else(PoisonError::into_inner) = Some(info);
        }
    }

    pub fn server_version(&self) -> Option<String> {
        match &self.role {
            RoleData::Client(_) => self.server_info().map(|info| info.version),
            RoleData::Proxy(_) => Some(self.settings.version.clone()),
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("role", &self.role())
            .field("active", &self.is_active())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ProcessError;
    use futures_util::future::BoxFuture;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        messages: Mutex<Vec<String>>,
        connects: AtomicUsize,
        disconnects: Mutex<Vec<DisconnectReason>>,
        panic_on_connect: bool,
    }

    impl MessageProcessor for Recorder {
        fn process_message(&self, _conn: &Arc<Connection>, raw: &[u8]) -> Result<(), ProcessError> {
            let text = String::from_utf8_lossy(raw).into_owned();
            self.messages.lock().unwrap().push(text);
            Ok(())
        }

        fn on_connect<'a>(
            &'a self,
            _conn: &'a Arc<Connection>,
            _shutdown: &'a CancellationToken,
        ) -> BoxFuture<'a, ()> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            let panic = self.panic_on_connect;
            Box::pin(async move {
                if panic {
                    panic!("handshake bug");
                }
            })
        }

        fn on_disconnect(&self, _conn: &Connection, reason: DisconnectReason) {
            self.disconnects.lock().unwrap().push(reason);
        }
    }

    fn client(recorder: &Arc<Recorder>, settings: ConnectionSettings) -> (Arc<Connection>, Transport) {
        let (local, peer) = Transport::pair();
        let conn = Connection::client("c1", local, settings, recorder.clone());
        (conn, peer)
    }

    fn watch(conn: &Connection) -> mpsc::UnboundedReceiver<ConnectionStateChange> {
        let (tx, rx) = mpsc::unbounded_channel();
        conn.on_state_change(Arc::new(move |change| {
            let _ = tx.send(change);
        }));
        rx
    }

    async fn disconnected(rx: &mut mpsc::UnboundedReceiver<ConnectionStateChange>) -> DisconnectReason {
        loop {
            let change = rx.recv().await.unwrap();
            if change.event == ConnectionEvent::Disconnected {
                return change.reason.unwrap();
            }
        }
    }

    fn drain_text(stream: &mut FrameStream) -> Vec<String> {
        let mut out = Vec::new();
        while let Some(Some(Ok(frame))) = stream.next().now_or_never() {
            if let Frame::Text(text) = frame {
                out.push(text);
            }
        }
        out
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let recorder = Arc::new(Recorder::default());
        let (conn, _peer) = client(&recorder, ConnectionSettings::default());
        conn.start(CancellationToken::new());

        assert!(conn.close(DisconnectReason::ServerKick));
        assert!(!conn.close(DisconnectReason::NetworkError));
        assert!(!conn.is_active());
        assert!(matches!(conn.send("x"), Err(ConnectionError::NotActive)));

        tokio::task::yield_now().await;
        assert_eq!(*recorder.disconnects.lock().unwrap(), vec![DisconnectReason::ServerKick]);
        assert_eq!(conn.disconnect_reason(), Some(DisconnectReason::ServerKick));
    }

    #[tokio::test]
    async fn start_runs_one_handshake() {
        let recorder = Arc::new(Recorder::default());
        let (conn, _peer) = client(&recorder, ConnectionSettings::default());
        let token = CancellationToken::new();

        let a = tokio::spawn({
            let (conn, token) = (conn.clone(), token.clone());
            async move { conn.start(token) }
        });
        let b = tokio::spawn({
            let (conn, token) = (conn.clone(), token.clone());
            async move { conn.start(token) }
        });
        a.await.unwrap();
        b.await.unwrap();
        conn.start(token);
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(recorder.connects.load(Ordering::SeqCst), 1);
        assert!(conn.is_active());
    }

    #[tokio::test]
    async fn external_shutdown_closes_with_external_reason() {
        let recorder = Arc::new(Recorder::default());
        let (conn, _peer) = client(&recorder, ConnectionSettings::default());
        let mut changes = watch(&conn);
        let token = CancellationToken::new();
        conn.start(token.clone());

        token.cancel();
        assert_eq!(disconnected(&mut changes).await, DisconnectReason::ExternalClose);
    }

    #[tokio::test]
    async fn peer_drop_is_network_error() {
        let recorder = Arc::new(Recorder::default());
        let (conn, peer) = client(&recorder, ConnectionSettings::default());
        let mut changes = watch(&conn);
        conn.start(CancellationToken::new());

        drop(peer);
        assert_eq!(disconnected(&mut changes).await, DisconnectReason::NetworkError);
        assert!(!conn.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn retries_stop_after_budget() {
        let recorder = Arc::new(Recorder::default());
        let (conn, peer) = client(&recorder, ConnectionSettings::default());
        let (_peer_sink, mut peer_stream) = peer.into_parts();
        conn.start(CancellationToken::new());

        let policy = RetryPolicy::new(Duration::from_millis(100), 3, Duration::from_millis(50));
        let id = conn
            .send_request_with_retry("SWITCH_FULL", &serde_json::json!({"k": 1}), policy)
            .unwrap();
        assert!(conn.pending().contains(&id));

        tokio::time::sleep(Duration::from_millis(700)).await;

        let sent = drain_text(&mut peer_stream);
        assert_eq!(sent.len(), 4);
        assert!(sent.iter().all(|s| s == &sent[0]));
        assert!(!conn.pending().contains(&id));
    }

    #[tokio::test(start_paused = true)]
    async fn ack_stops_retries() {
        let recorder = Arc::new(Recorder::default());
        let (conn, peer) = client(&recorder, ConnectionSettings::default());
        let (mut peer_sink, mut peer_stream) = peer.into_parts();
        conn.start(CancellationToken::new());

        let policy = RetryPolicy::new(Duration::from_secs(1), 3, Duration::from_millis(500));
        let id = conn.send_request_with_retry("SWITCH_FULL", &(), policy).unwrap();

        let ack = serde_json::to_string(&ReceiveAck::received(&id, "ok")).unwrap();
        peer_sink.send(Frame::Text(ack)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(conn.pending().is_empty());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(drain_text(&mut peer_stream).len(), 1);
        assert!(recorder.messages.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn envelopes_reach_processor() {
        let recorder = Arc::new(Recorder::default());
        let (conn, peer) = client(&recorder, ConnectionSettings::default());
        let (mut peer_sink, _peer_stream) = peer.into_parts();
        conn.start(CancellationToken::new());

        let stray_ack = serde_json::to_string(&ReceiveAck::received("unknown", "")).unwrap();
        let envelope = r#"{"type":"CUSTOM","request_id":"r1","timestamp":1}"#;
        peer_sink.send(Frame::Text(stray_ack)).await.unwrap();
        peer_sink.send(Frame::Text(envelope.into())).await.unwrap();
        peer_sink.send(Frame::Text("not json".into())).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(*recorder.messages.lock().unwrap(), vec![envelope.to_string()]);
        assert!(conn.is_active());
    }

    #[tokio::test]
    async fn envelope_shape_follows_role() {
        let recorder = Arc::new(Recorder::default());
        let (conn, peer) = client(&recorder, ConnectionSettings::default());
        let (_peer_sink, mut peer_stream) = peer.into_parts();
        conn.start(CancellationToken::new());
        conn.send_request("PING_APP", &serde_json::json!({"a": 1})).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let sent = drain_text(&mut peer_stream);
        let req: RequestMessage = serde_json::from_str(&sent[0]).unwrap();
        assert_eq!(req.client_id, "c1");
        assert_eq!(req.version, "1.0.0");
        assert!(req.request_id.starts_with("client-c1-"));

        let (local, peer) = Transport::pair();
        let info = ClientProxyInfo {
            id: "p1".into(),
            service_name: "svc-a".into(),
            env_tag: "prod".into(),
            ..Default::default()
        };
        let proxy = Connection::proxy(
            "p1",
            local,
            ConnectionSettings::default(),
            recorder.clone(),
            info,
            ServerInfo::default(),
        );
        let (_peer_sink, mut peer_stream) = peer.into_parts();
        proxy.start(CancellationToken::new());
        proxy.send_reply("SWITCH_FULL", "r9", &()).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let sent = drain_text(&mut peer_stream);
        let resp: ResponseMessage = serde_json::from_str(&sent[0]).unwrap();
        assert_eq!(resp.request_id, "r9");
        assert_eq!(resp.service_name, "svc-a");
        assert_eq!(resp.env_tag, "prod");
        assert!(resp.data.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn silent_peer_fails_heartbeat() {
        let recorder = Arc::new(Recorder::default());
        let sink: FrameSink = Box::pin(
            futures_util::sink::drain::<Frame>()
                .sink_map_err(|never: std::convert::Infallible| -> TransportError { match never {} }),
        );
        let stream: FrameStream = Box::pin(futures_util::stream::pending::<Result<Frame, TransportError>>());
        let settings = ConnectionSettings {
            heartbeat_interval: Duration::from_secs(1),
            ..Default::default()
        };
        let conn = Connection::client("c1", Transport::new(sink, stream), settings, recorder.clone());
        let mut changes = watch(&conn);
        conn.start(CancellationToken::new());

        assert_eq!(disconnected(&mut changes).await, DisconnectReason::HeartbeatTimeout);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_peer_hits_read_deadline() {
        let recorder = Arc::new(Recorder::default());
        let (local, peer) = Transport::pair();
        let settings = ConnectionSettings {
            read_timeout: Duration::from_secs(1),
            ..Default::default()
        };
        let conn = Connection::client("c1", local, settings, recorder.clone());
        let mut changes = watch(&conn);
        conn.start(CancellationToken::new());

        assert_eq!(disconnected(&mut changes).await, DisconnectReason::ReadTimeout);
        drop(peer);
    }

    #[tokio::test]
    async fn zero_timings_use_defaults() {
        let recorder = Arc::new(Recorder::default());
        let settings = ConnectionSettings {
            heartbeat_interval: Duration::ZERO,
            write_timeout: Duration::ZERO,
            read_timeout: Duration::ZERO,
            ..Default::default()
        };
        let (conn, _peer) = client(&recorder, settings);
        assert_eq!(conn.settings().heartbeat_interval, Duration::from_secs(30));
        conn.start(CancellationToken::new());
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(conn.is_active());
        assert_eq!(conn.disconnect_reason(), None);
        conn.send("still writable").unwrap();
    }

    #[tokio::test]
    async fn full_queue_is_reported() {
        let recorder = Arc::new(Recorder::default());
        let settings = ConnectionSettings {
            send_queue_capacity: 1,
            ..Default::default()
        };
        let (conn, _peer) = client(&recorder, settings);

        conn.send("one").unwrap();
        assert!(matches!(conn.send("two"), Err(ConnectionError::QueueFull)));
        let err = conn
            .send_request_with_retry("SWITCH_FULL", &(), RetryPolicy::default())
            .unwrap_err();
        assert!(matches!(err, ConnectionError::QueueFull));
        assert!(conn.pending().is_empty());
    }

    #[tokio::test]
    async fn worker_panic_becomes_network_error() {
        let recorder = Arc::new(Recorder {
            panic_on_connect: true,
            ..Default::default()
        });
        let (conn, _peer) = client(&recorder, ConnectionSettings::default());
        let mut changes = watch(&conn);
        conn.start(CancellationToken::new());

        assert_eq!(disconnected(&mut changes).await, DisconnectReason::NetworkError);
    }

    #[tokio::test]
    async fn close_drops_pending() {
        let recorder = Arc::new(Recorder::default());
        let (conn, _peer) = client(&recorder, ConnectionSettings::default());
        conn.start(CancellationToken::new());
        conn.send_request_with_retry("SWITCH_FULL", &(), RetryPolicy::default())
            .unwrap();
        assert_eq!(conn.pending().len(), 1);

        conn.close(DisconnectReason::ExternalClose);
        assert!(conn.pending().is_empty());
    }
}
