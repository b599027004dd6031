//! Connection registry, trust bookkeeping and broadcast.

use crate::{
    BroadcastFailure, BroadcastFailures, ConnectionFilter, ProxyMessageProcessor, ServerConfig,
    ServerError, ServerHandler, http,
};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::{
    Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
};
use std::time::Duration;
use switchwire_conn::{Connection, ConnectionStateChange, RetryPolicy, Transport};
use switchwire_core::{
    ClientProxyInfo, ConnectHelloPayload, ConnectionEvent, DisconnectReason, MessageType,
    ServerInfo, unix_seconds,
};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const REGISTER_QUEUE: usize = 10;
const UNREGISTER_QUEUE: usize = 100;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Default)]
struct Registry {
    clients: HashMap<String, Arc<Connection>>,
    trusted: HashMap<String, Arc<Connection>>,
}

struct Running {
    addr: SocketAddr,
    shutdown: CancellationToken,
    register: mpsc::Sender<Arc<Connection>>,
    unregister: mpsc::Sender<Arc<Connection>>,
    http: JoinHandle<std::io::Result<()>>,
}

/// A switchwire server.
///
/// Inserts into the registry happen on a single coordination task fed by
/// the accept queue. Removals go through the unregister queue, falling back
/// to a direct removal when the queue is full or the server is stopped.
pub struct Server {
    config: ServerConfig,
    handler: Arc<dyn ServerHandler>,
    endpoints: Mutex<Vec<String>>,
    registry: RwLock<Registry>,
    running: Mutex<Option<Running>>,
    start_time: i64,
}

impl Server {
    pub fn new(config: ServerConfig, handler: Arc<dyn ServerHandler>) -> Arc<Self> {
        let mut endpoints = Vec::new();
        for endpoint in &config.endpoints {
            if !is_valid_endpoint(endpoint) {
                tracing::warn!("ignoring invalid endpoint {}", endpoint);
            } else if !endpoints.contains(endpoint) {
                endpoints.push(endpoint.clone());
            }
        }
        Arc::new(Self {
            config,
            handler,
            endpoints: Mutex::new(endpoints),
            registry: RwLock::new(Registry::default()),
            running: Mutex::new(None),
            start_time: unix_seconds(),
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Add an upgrade endpoint. Only allowed before [`start`](Self::start).
    pub fn register_endpoint(&self, path: impl Into<String>) -> Result<(), ServerError> {
        let path = path.into();
        if self.is_running() {
            return Err(ServerError::AlreadyRunning);
        }
        if !is_valid_endpoint(&path) {
            return Err(ServerError::InvalidEndpoint(path));
        }
        let mut endpoints = lock(&self.endpoints);
        if !endpoints.contains(&path) {
            tracing::info!("registered endpoint {}", path);
            endpoints.push(path);
        }
        Ok(())
    }

    pub fn endpoints(&self) -> Vec<String> {
        lock(&self.endpoints).clone()
    }

    /// Bind, then start the coordination task and the HTTP surface.
    pub async fn start(self: &Arc<Self>) -> Result<SocketAddr, ServerError> {
        if self.is_running() {
            return Err(ServerError::AlreadyRunning);
        }
        let listener = tokio::net::TcpListener::bind(&self.config.address).await?;
        let addr = listener.local_addr()?;
        let app = http::router(Arc::clone(self), &self.endpoints());

        let mut running = lock(&self.running);
        if running.is_some() {
            return Err(ServerError::AlreadyRunning);
        }
        let shutdown = CancellationToken::new();
        let (register, register_rx) = mpsc::channel(REGISTER_QUEUE);
        let (unregister, unregister_rx) = mpsc::channel(UNREGISTER_QUEUE);
        tokio::spawn(Arc::clone(self).coordinate(register_rx, unregister_rx, shutdown.clone()));
        let http = tokio::spawn(http::serve(listener, app, shutdown.clone()));
        *running = Some(Running {
            addr,
            shutdown,
            register,
            unregister,
            http,
        });
        drop(running);

        tracing::info!("listening on ws://{}", addr);
        Ok(addr)
    }

    /// Close every connection and shut the HTTP surface down.
    pub async fn stop(&self) -> Result<(), ServerError> {
        let Some(mut running) = lock(&self.running).take() else {
            return Err(ServerError::NotRunning);
        };
        tracing::info!("stopping server on {}", running.addr);
        running.shutdown.cancel();

        let connections: Vec<_> = self.read_registry().clients.values().cloned().collect();
        for conn in connections {
            conn.close(DisconnectReason::ExternalClose);
        }

        match tokio::time::timeout(SHUTDOWN_GRACE, &mut running.http).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => tracing::error!("HTTP server error: {}", e),
            Ok(Err(e)) => tracing::error!("HTTP server task failed: {}", e),
            Err(_) => {
                tracing::warn!("HTTP server did not stop within {:?}", SHUTDOWN_GRACE);
                running.http.abort();
            }
        }
        tracing::info!("server stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        lock(&self.running).is_some()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        lock(&self.running).as_ref().map(|r| r.addr)
    }

    async fn coordinate(
        self: Arc<Self>,
        mut register: mpsc::Receiver<Arc<Connection>>,
        mut unregister: mpsc::Receiver<Arc<Connection>>,
        shutdown: CancellationToken,
    ) {
        let period = self.config.settings().heartbeat_interval;
        let mut health = tokio::time::interval_at(Instant::now() + period, period);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                Some(conn) = register.recv() => self.admit(conn, &shutdown),
                Some(conn) = unregister.recv() => self.remove_connection(&conn),
                _ = health.tick() => self.evict_silent_clients(),
            }
        }
        tracing::debug!("coordinator stopped");
    }

    /// Wrap an upgraded transport as a proxy connection wired to this server.
    pub(crate) fn proxy_connection(
        self: &Arc<Self>,
        transport: Transport,
        info: ClientProxyInfo,
    ) -> Arc<Connection> {
        let processor = ProxyMessageProcessor::new(Arc::downgrade(self), Arc::clone(&self.handler));
        let conn = Connection::proxy(
            info.id.clone(),
            transport,
            self.config.settings(),
            Arc::new(processor),
            info,
            self.server_info(),
        );

        let server = Arc::downgrade(self);
        let weak = Arc::downgrade(&conn);
        conn.on_state_change(Arc::new(move |change: ConnectionStateChange| {
            if change.event != ConnectionEvent::Disconnected {
                return;
            }
            if let (Some(server), Some(conn)) = (server.upgrade(), weak.upgrade()) {
                server.unregister(conn);
            }
        }));
        conn
    }

    /// Hand a connection to the coordination task for admission.
    pub async fn register_client(&self, conn: Arc<Connection>) -> Result<(), ServerError> {
        let tx = lock(&self.running).as_ref().map(|r| r.register.clone());
        let Some(tx) = tx else {
            conn.close(DisconnectReason::ExternalClose);
            return Err(ServerError::NotRunning);
        };
        if let Err(mpsc::error::SendError(conn)) = tx.send(conn).await {
            conn.close(DisconnectReason::ExternalClose);
            return Err(ServerError::NotRunning);
        }
        Ok(())
    }

    pub(crate) fn admit(&self, conn: Arc<Connection>, shutdown: &CancellationToken) {
        let admitted = {
            let mut registry = self.write_registry();
            if registry.clients.len() >= self.config.max_connections {
                None
            } else {
                let replaced = registry
                    .clients
                    .insert(conn.id().to_string(), Arc::clone(&conn));
                if replaced.is_some() {
                    registry.trusted.remove(conn.id());
                }
                Some((registry.clients.len(), replaced))
            }
        };

        let Some((count, replaced)) = admitted else {
            tracing::warn!(
                "rejecting connection {}: limit of {} reached",
                conn.id(),
                self.config.max_connections
            );
            conn.close(DisconnectReason::ServerKick);
            return;
        };
        if let Some(old) = replaced {
            tracing::warn!("connection {} replaced by a newer upgrade", old.id());
            old.close(DisconnectReason::ServerKick);
        }
        tracing::info!("client {} registered ({} connected)", conn.id(), count);
        conn.start(shutdown.child_token());
    }

    fn unregister(&self, conn: Arc<Connection>) {
        let tx = lock(&self.running).as_ref().map(|r| r.unregister.clone());
        match tx {
            Some(tx) => {
                if let Err(e) = tx.try_send(conn) {
                    self.remove_connection(&e.into_inner());
                }
            }
            None => self.remove_connection(&conn),
        }
    }

    fn remove_connection(&self, conn: &Arc<Connection>) {
        let removed = {
            let mut registry = self.write_registry();
            let present = registry
                .clients
                .get(conn.id())
                .is_some_and(|c| Arc::ptr_eq(c, conn));
            if present {
                registry.clients.remove(conn.id());
            }
            if registry
                .trusted
                .get(conn.id())
                .is_some_and(|c| Arc::ptr_eq(c, conn))
            {
                registry.trusted.remove(conn.id());
            }
            present
        };
        if removed {
            tracing::info!("client {} unregistered", conn.id());
        }
    }

    pub(crate) fn evict_silent_clients(&self) {
        let limit = self.config.eviction_timeout();
        let now = Instant::now();
        let silent: Vec<_> = self
            .read_registry()
            .clients
            .values()
            .filter(|c| now.saturating_duration_since(c.last_seen()) > limit)
            .cloned()
            .collect();
        for conn in silent {
            tracing::warn!(
                "client {} silent for over {:?}, evicting",
                conn.id(),
                limit
            );
            conn.close(DisconnectReason::HeartbeatTimeout);
        }
    }

    /// Mark a registered connection as trusted.
    pub fn trust_client(&self, id: &str) -> Result<(), ServerError> {
        let mut registry = self.write_registry();
        let conn = registry
            .clients
            .get(id)
            .cloned()
            .ok_or_else(|| ServerError::ClientNotFound(id.to_string()))?;
        registry.trusted.insert(id.to_string(), conn);
        Ok(())
    }

    pub fn is_trusted_client(&self, id: &str) -> bool {
        self.read_registry().trusted.contains_key(id)
    }

    pub fn get_client(&self, id: &str) -> Option<Arc<Connection>> {
        self.read_registry().clients.get(id).cloned()
    }

    pub fn client_count(&self) -> usize {
        self.read_registry().clients.len()
    }

    pub fn trusted_count(&self) -> usize {
        self.read_registry().trusted.len()
    }

    /// Identities of every active connection.
    pub fn clients_info(&self) -> Vec<ClientProxyInfo> {
        self.read_registry()
            .clients
            .values()
            .filter(|c| c.is_active())
            .filter_map(|c| c.client_info())
            .collect()
    }

    /// What each proxy connection advertises about this server.
    pub fn server_info(&self) -> ServerInfo {
        ServerInfo {
            version: self.config.server_version.clone(),
            name: self.config.name.clone(),
            description: String::new(),
            capabilities: MessageType::supported()
                .into_iter()
                .map(String::from)
                .collect(),
            config: self.metadata(),
            start_time: self.start_time,
        }
    }

    pub(crate) fn hello_payload(&self) -> ConnectHelloPayload {
        ConnectHelloPayload {
            server_info: self.config.name.clone(),
            support_types: MessageType::supported(),
            server_time: unix_seconds(),
            max_clients: self.config.max_connections,
            current_count: self.client_count(),
            metadata: self.metadata(),
        }
    }

    fn metadata(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("server_address".to_string(), self.config.address.clone()),
            ("protocol".to_string(), "websocket".to_string()),
            ("version".to_string(), self.config.server_version.clone()),
        ])
    }

    /// Active trusted connections, optionally narrowed by `filter`.
    pub fn trusted_connections(&self, filter: Option<&ConnectionFilter>) -> Vec<Arc<Connection>> {
        self.read_registry()
            .trusted
            .values()
            .filter(|c| {
                let conn: &Connection = c;
                conn.is_active() && filter.is_none_or(|f| f(conn))
            })
            .cloned()
            .collect()
    }

    /// Trusted connections with one entry per device, keeping the most
    /// recently connected.
    pub fn unique_device_connections(
        &self,
        filter: Option<&ConnectionFilter>,
    ) -> Vec<Arc<Connection>> {
        let mut by_device: HashMap<String, (i64, Arc<Connection>)> = HashMap::new();
        for conn in self.trusted_connections(filter) {
            let Some(info) = conn.client_info() else {
                continue;
            };
            let key = info.device_key();
            if by_device
                .get(&key)
                .is_none_or(|(seen, _)| info.connect_time > *seen)
            {
                by_device.insert(key, (info.connect_time, conn));
            }
        }
        by_device.into_values().map(|(_, conn)| conn).collect()
    }

    fn trusted_active(&self, id: &str) -> Result<Arc<Connection>, ServerError> {
        let conn = self
            .read_registry()
            .trusted
            .get(id)
            .cloned()
            .ok_or_else(|| ServerError::ClientNotTrusted(id.to_string()))?;
        if !conn.is_active() {
            return Err(ServerError::ClientNotActive(id.to_string()));
        }
        Ok(conn)
    }

    /// Queue a raw frame to one trusted client.
    pub fn send_to_client(&self, id: &str, raw: impl Into<String>) -> Result<(), ServerError> {
        Ok(self.trusted_active(id)?.send(raw)?)
    }

    pub fn send_json_to_client<T: Serialize + ?Sized>(
        &self,
        id: &str,
        value: &T,
    ) -> Result<(), ServerError> {
        self.send_to_client(id, serde_json::to_string(value)?)
    }

    /// Reliable push: three retries, two seconds apart.
    pub fn send_reliable_message<P: Serialize + ?Sized>(
        &self,
        id: &str,
        kind: impl Into<MessageType>,
        payload: &P,
        timeout: Duration,
    ) -> Result<String, ServerError> {
        self.send_reliable_message_with_retry(id, kind, payload, RetryPolicy::with_timeout(timeout))
    }

    pub fn send_reliable_message_with_retry<P: Serialize + ?Sized>(
        &self,
        id: &str,
        kind: impl Into<MessageType>,
        payload: &P,
        policy: RetryPolicy,
    ) -> Result<String, ServerError> {
        Ok(self
            .trusted_active(id)?
            .send_request_with_retry(kind, payload, policy)?)
    }

    /// Best-effort send to every trusted connection. Returns how many took it.
    pub async fn broadcast_to_trusted(&self, raw: impl Into<String>) -> usize {
        Self::fan_out(self.trusted_connections(None), raw.into()).await
    }

    /// Best-effort send to the trusted connections `filter` passes.
    pub async fn broadcast_to_group(&self, raw: impl Into<String>, filter: &ConnectionFilter) -> usize {
        Self::fan_out(self.trusted_connections(Some(filter)), raw.into()).await
    }

    async fn fan_out(targets: Vec<Arc<Connection>>, raw: String) -> usize {
        tracing::debug!("broadcasting to {} connections", targets.len());
        let mut tasks = JoinSet::new();
        for conn in targets {
            let raw = raw.clone();
            tasks.spawn(async move {
                let sent = conn.send(raw);
                if let Err(e) = &sent {
                    tracing::warn!("broadcast to {} failed: {}", conn.id(), e);
                }
                sent.is_ok()
            });
        }
        let mut delivered = 0;
        while let Some(result) = tasks.join_next().await {
            if matches!(result, Ok(true)) {
                delivered += 1;
            }
        }
        delivered
    }

    /// Reliable push to every trusted connection `filter` passes.
    ///
    /// Every target is attempted; the error lists each one that failed.
    pub async fn broadcast_reliable_to_group<P: Serialize + ?Sized>(
        &self,
        kind: impl Into<MessageType>,
        payload: &P,
        filter: &ConnectionFilter,
        policy: RetryPolicy,
    ) -> Result<Vec<String>, ServerError> {
        let kind = kind.into();
        let payload = Arc::new(serde_json::to_value(payload)?);
        let targets = self.trusted_connections(Some(filter));
        tracing::debug!("reliable broadcast of {} to {} connections", kind, targets.len());

        let mut tasks = JoinSet::new();
        for conn in targets {
            let kind = kind.clone();
            let payload = Arc::clone(&payload);
            tasks.spawn(async move {
                let sent = conn.send_request_with_retry(kind, &*payload, policy);
                (conn.id().to_string(), sent)
            });
        }

        let mut request_ids = Vec::new();
        let mut failures = Vec::new();
        while let Some(result) = tasks.join_next().await {
            match result {
                Ok((_, Ok(request_id))) => request_ids.push(request_id),
                Ok((client_id, Err(error))) => failures.push(BroadcastFailure { client_id, error }),
                Err(e) => tracing::error!("broadcast task failed: {}", e),
            }
        }
        if failures.is_empty() {
            Ok(request_ids)
        } else {
            Err(ServerError::Broadcast(BroadcastFailures(failures)))
        }
    }

    fn read_registry(&self) -> RwLockReadGuard<'_, Registry> {
        self.registry.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_registry(&self) -> RwLockWriteGuard<'_, Registry> {
        self.registry.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn is_valid_endpoint(path: &str) -> bool {
    path.starts_with('/') && !matches!(path, "/health" | "/clients")
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}
