use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::Instrument;

use murmur_core::UserId;
use murmur_store::Database;

use crate::config::{AuthMode, ServerConfig};
use crate::hub::EventHub;
use crate::identity::{DeviceOwnerVerifier, Handshake, IdentityVerifier, QueryParamVerifier};
use crate::registry::{self, Connection, ConnectionRegistry};
use crate::rest;

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub db: Database,
    pub registry: Arc<ConnectionRegistry>,
    pub hub: Arc<EventHub>,
    pub verifier: Arc<dyn IdentityVerifier>,
    pub shutdown: CancellationToken,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(config: ServerConfig, db: Database) -> Self {
        let registry = Arc::new(ConnectionRegistry::with_timeout(
            config.max_send_queue,
            config.client_timeout(),
        ));
        let hub = EventHub::new(db.clone(), Arc::clone(&registry))
            .with_blob_base_url(config.blob_base_url.clone())
            .with_max_attachments(config.max_attachments);
        let verifier: Arc<dyn IdentityVerifier> = match config.auth_mode {
            AuthMode::QueryParam => Arc::new(QueryParamVerifier),
            AuthMode::DeviceOwner => Arc::new(DeviceOwnerVerifier::new(db.clone())),
        };

        Self {
            config: Arc::new(config),
            db,
            registry,
            hub: Arc::new(hub),
            verifier,
            shutdown: CancellationToken::new(),
            started_at: Instant::now(),
        }
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/chat_socket", get(ws_handler))
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .merge(rest::routes())
        .with_state(state)
        .layer(rest::cors())
        .layer(TraceLayer::new_for_http())
}

/// Bind and serve. The returned handle owns the shutdown token.
pub async fn start(config: ServerConfig, db: Database) -> Result<ServerHandle, std::io::Error> {
    let addr = format!("{}:{}", config.host, config.port);
    let cleanup_interval = config.cleanup_interval();
    let state = AppState::new(config, db);
    let shutdown = state.shutdown.clone();

    let cleanup = registry::start_cleanup_task(
        Arc::clone(&state.registry),
        cleanup_interval,
        shutdown.clone(),
    );

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;
    tracing::info!(port = local_addr.port(), host = %local_addr.ip(), "Murmur server started");

    let router = build_router(state.clone());
    let server_shutdown = shutdown.clone();
    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router)
            .with_graceful_shutdown(server_shutdown.cancelled_owned())
            .await
        {
            tracing::error!(error = %e, "server terminated");
        }
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        state,
        shutdown,
        server,
        cleanup,
    })
}

/// Handle returned by `start()`; keeps background tasks alive.
pub struct ServerHandle {
    pub port: u16,
    state: AppState,
    shutdown: CancellationToken,
    server: tokio::task::JoinHandle<()>,
    cleanup: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    pub fn state(&self) -> &AppState {
        &self.state
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stop accepting, close every socket, and wait for the server task.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        let _ = self.server.await;
        let _ = self.cleanup.await;
        tracing::info!("Murmur server stopped");
    }
}

/// WebSocket upgrade handler. Identity is settled before the upgrade; a
/// rejected handshake never reaches the registry.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Response {
    let handshake = Handshake {
        query,
        authorization: headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned),
    };

    match state.verifier.verify(&handshake).await {
        Ok(user_id) => ws.on_upgrade(move |socket| handle_socket(socket, user_id, state)),
        Err(e) => {
            tracing::warn!(error = %e, "socket handshake rejected");
            (
                StatusCode::UNAUTHORIZED,
                Json(json!({"error": {"message": e.to_string()}})),
            )
                .into_response()
        }
    }
}

/// Run one connection until the peer leaves, it is reaped, or the server
/// shuts down.
async fn handle_socket(socket: WebSocket, user_id: UserId, state: AppState) {
    let (conn, rx) = state.registry.open(user_id);
    let span = tracing::info_span!("connection", conn_id = %conn.id, user_id = %user_id);

    async move {
        tracing::info!("WebSocket client connected");
        run_connection(socket, Arc::clone(&conn), rx, &state).await;
        state.registry.unregister(&conn.id);
        tracing::info!(
            dropped = conn.dropped_messages(),
            "WebSocket client disconnected"
        );
    }
    .instrument(span)
    .await;
}

async fn run_connection(
    socket: WebSocket,
    conn: Arc<Connection>,
    mut rx: mpsc::Receiver<String>,
    state: &AppState,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let heartbeat = state.config.heartbeat_interval();
    let shutdown = state.shutdown.clone();

    // Writer: drain the outbound queue in order, ping on the heartbeat.
    let writer_conn = Arc::clone(&conn);
    let writer_shutdown = shutdown.clone();
    let mut writer = tokio::spawn(
        async move {
            let mut ping_interval = tokio::time::interval(heartbeat);
            ping_interval.tick().await;

            loop {
                tokio::select! {
                    msg = rx.recv() => {
                        let Some(text) = msg else { break };
                        if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    _ = ping_interval.tick() => {
                        if !writer_conn.is_open() {
                            break;
                        }
                        if ws_tx.send(WsMessage::Ping(Default::default())).await.is_err() {
                            break;
                        }
                        tracing::trace!("Sent ping");
                    }
                    _ = writer_shutdown.cancelled() => {
                        let _ = ws_tx.send(WsMessage::Close(None)).await;
                        break;
                    }
                    _ = writer_conn.closed() => {
                        let _ = ws_tx.send(WsMessage::Close(None)).await;
                        break;
                    }
                }
            }
        }
        .in_current_span(),
    );

    // Reader: requests from one connection are handled strictly in order,
    // and none once the connection is closed.
    let hub = Arc::clone(&state.hub);
    let reader_conn = Arc::clone(&conn);
    let mut reader = tokio::spawn(
        async move {
            loop {
                let frame = tokio::select! {
                    biased;
                    _ = reader_conn.closed() => break,
                    _ = shutdown.cancelled() => break,
                    frame = ws_rx.next() => frame,
                };
                match frame {
                    Some(Ok(WsMessage::Text(text))) => {
                        hub.process(&reader_conn, text.as_str()).await;
                    }
                    Some(Ok(WsMessage::Pong(_))) => reader_conn.record_pong(),
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!(error = %e, "socket read failed");
                        break;
                    }
                }
            }
        }
        .in_current_span(),
    );

    tokio::select! {
        _ = &mut writer => reader.abort(),
        _ = &mut reader => writer.abort(),
    }
}

/// Liveness probe.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "connections": state.registry.count(),
        "uptimeSecs": state.started_at.elapsed().as_secs(),
    }))
}
