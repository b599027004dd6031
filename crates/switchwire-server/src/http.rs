//! HTTP surface: health, client listing and websocket upgrades.

use crate::Server;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade, rejection::WebSocketUpgradeRejection};
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt, future};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use switchwire_conn::{Frame, Transport, TransportError};
use switchwire_core::{
    CONNECTION_ID_HEADER, ClientProxyInfo, MAX_MESSAGE_SIZE, unix_millis, unix_seconds,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

#[derive(Serialize)]
struct Health {
    status: &'static str,
    running: bool,
    clients: usize,
    max_clients: usize,
    timestamp: i64,
}

pub(crate) fn router(server: Arc<Server>, endpoints: &[String]) -> Router {
    let mut router = Router::new()
        .route("/health", get(health))
        .route("/clients", get(clients));
    for endpoint in endpoints {
        router = router.route(endpoint, get(upgrade));
    }
    router.with_state(server)
}

pub(crate) async fn serve(
    listener: TcpListener,
    app: Router,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { shutdown.cancelled().await })
    .await
}

async fn health(State(server): State<Arc<Server>>) -> Json<Health> {
    Json(Health {
        status: "ok",
        running: server.is_running(),
        clients: server.client_count(),
        max_clients: server.config().max_connections,
        timestamp: unix_seconds(),
    })
}

async fn clients(State(server): State<Arc<Server>>) -> Json<Vec<ClientProxyInfo>> {
    Json(server.clients_info())
}

async fn upgrade(
    State(server): State<Arc<Server>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    uri: Uri,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let is_websocket = headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"));
    let id = headers
        .get(CONNECTION_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_owned);
    let (true, Some(id), Ok(ws)) = (is_websocket, id, ws) else {
        tracing::debug!("rejected upgrade from {} on {}", remote, uri.path());
        return (StatusCode::BAD_REQUEST, "Expected WebSocket connection").into_response();
    };

    let info = ClientProxyInfo {
        id,
        remote_addr: remote.to_string(),
        user_agent: header_str(&headers, header::USER_AGENT.as_str()),
        headers: headers
            .keys()
            .map(|name| (name.to_string(), header_str(&headers, name.as_str())))
            .collect(),
        connect_time: unix_millis(),
        server_version: server.config().server_version.clone(),
        endpoint: uri.path().to_string(),
        ..Default::default()
    };
    tracing::info!("upgrading {} from {} on {}", info.id, remote, info.endpoint);

    ws.max_message_size(MAX_MESSAGE_SIZE)
        .on_upgrade(move |socket| async move {
            let transport = socket_transport(socket, remote);
            let conn = server.proxy_connection(transport, info);
            if let Err(e) = server.register_client(conn).await {
                tracing::warn!("dropping upgraded connection: {}", e);
            }
        })
}

/// First value of `name`, or empty.
fn header_str(headers: &HeaderMap, name: &str) -> String {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

fn socket_transport(socket: WebSocket, remote: SocketAddr) -> Transport {
    let (sink, stream) = socket.split();
    let sink = sink
        .sink_map_err(TransportError::backend)
        .with(|frame: Frame| future::ready(Ok::<_, TransportError>(to_message(frame))));
    let stream = stream.map(|msg| msg.map(from_message).map_err(TransportError::backend));
    Transport::new(Box::pin(sink), Box::pin(stream)).with_remote_addr(remote.to_string())
}

fn to_message(frame: Frame) -> Message {
    match frame {
        Frame::Text(t) => Message::Text(t.into()),
        Frame::Binary(b) => Message::Binary(b.into()),
        Frame::Ping(p) => Message::Ping(p.into()),
        Frame::Pong(p) => Message::Pong(p.into()),
        Frame::Close => Message::Close(None),
    }
}

fn from_message(msg: Message) -> Frame {
    match msg {
        Message::Text(t) => Frame::Text(t.as_str().to_owned()),
        Message::Binary(b) => Frame::Binary(b.to_vec()),
        Message::Ping(p) => Frame::Ping(p.to_vec()),
        Message::Pong(p) => Frame::Pong(p.to_vec()),
        Message::Close(_) => Frame::Close,
    }
}
