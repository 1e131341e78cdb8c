//! WebSocket transport and HTTP wiring.
//!
//! Each socket is authenticated at upgrade time and then owned by one task
//! that multiplexes three sources: the connection's outbound queue, inbound
//! frames, and the heartbeat timer. Clients speak JSON text frames by
//! default; a client that sends a binary frame is answered in
//! length-prefixed MessagePack from then on.

use crate::api;
use crate::auth::TokenVerifier;
use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use crate::rtc;
use anyhow::{anyhow, Result};
use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use bytes::BytesMut;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use vigil_core::{
    CloseReason, ConnectionHandle, ConnectionId, EventRouter, InMemoryStore, Outbound, Store,
};
use vigil_protocol::codec::{self, ProtocolError};
use vigil_protocol::{ClientEvent, ErrorCode, ServerEvent, UserId, PROTOCOL_VERSION};

/// Close code sent to a connection replaced by a newer one.
const CLOSE_SUPERSEDED: u16 = 4000;
/// Close code sent when the heartbeat timed out.
const CLOSE_IDLE: u16 = 4001;

/// Shared server state.
pub struct AppState {
    pub router: Arc<EventRouter>,
    pub verifier: TokenVerifier,
    pub config: Config,
    connections: Arc<AtomicUsize>,
}

impl AppState {
    /// Create state backed by an in-memory store.
    ///
    /// # Errors
    ///
    /// Returns an error if no JWT secret is configured.
    pub fn new(config: Config) -> Result<Self> {
        Self::with_store(config, Arc::new(InMemoryStore::new()))
    }

    /// Create state backed by `store`.
    ///
    /// # Errors
    ///
    /// Returns an error if no JWT secret is configured.
    pub fn with_store(config: Config, store: Arc<dyn Store>) -> Result<Self> {
        let secret = config
            .auth
            .jwt_secret
            .as_deref()
            .ok_or_else(|| anyhow!("auth.jwt_secret must be set"))?;
        let verifier = TokenVerifier::new(secret.as_bytes(), config.auth.issuer.as_deref());
        let router = EventRouter::new(store, rtc::issuer_for(&config.calls), config.router_config());

        Ok(Self {
            router: Arc::new(router),
            verifier,
            config,
            connections: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Number of open sockets.
    #[must_use]
    pub fn open_connections(&self) -> usize {
        self.connections.load(Ordering::Relaxed)
    }

    fn try_acquire_slot(&self) -> Option<ConnectionSlot> {
        let max = self.config.limits.max_connections;
        self.connections
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < max).then_some(n + 1))
            .ok()
            .map(|_| ConnectionSlot(Arc::clone(&self.connections)))
    }
}

/// One unit of socket capacity, released on drop.
struct ConnectionSlot(Arc<AtomicUsize>);

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Build the HTTP application.
pub fn build_app(state: Arc<AppState>) -> Router {
    Router::new()
        .route(&state.config.transport.websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .merge(api::routes())
        .with_state(state)
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let addr = config.bind_addr()?;
    let state = Arc::new(AppState::new(config)?);
    let listener = TcpListener::bind(addr).await?;
    spawn_sweeper(Arc::clone(&state));

    info!("Vigil server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, state.config.transport.websocket_path
    );

    serve(listener, state).await
}

/// Serve the application on an already bound listener.
///
/// # Errors
///
/// Returns an error if the server stops abnormally.
pub async fn serve(listener: TcpListener, state: Arc<AppState>) -> Result<()> {
    axum::serve(listener, build_app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

/// Periodically release idle conversations and long-ended calls.
fn spawn_sweeper(state: Arc<AppState>) {
    let period = Duration::from_secs(state.config.limits.sweep_interval_secs);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            state.router.sweep();
            metrics::set_active_calls(state.router.calls().active_count());
        }
    });
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}

async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "connections": state.open_connections(),
        "online": state.router.registry().online_count(),
        "calls": state.router.calls().active_count(),
    }))
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
    State(state): State<Arc<AppState>>,
) -> Response {
    let claims = match state
        .verifier
        .verify_request(&headers, params.get("token").map(String::as_str))
    {
        Ok(claims) => claims,
        Err(e) => {
            debug!(error = %e, "Upgrade rejected");
            metrics::record_rejected("unauthenticated");
            return (StatusCode::UNAUTHORIZED, e.to_string()).into_response();
        }
    };

    let Some(slot) = state.try_acquire_slot() else {
        warn!(user = %claims.sub, "Connection limit reached");
        metrics::record_rejected("capacity");
        return (StatusCode::SERVICE_UNAVAILABLE, "Server at capacity").into_response();
    };

    ws.on_upgrade(move |socket| handle_websocket(socket, state, claims.sub, slot))
}

/// Encoding used for outbound events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WireFormat {
    Json,
    MessagePack,
}

impl WireFormat {
    fn encode(self, event: &ServerEvent) -> Result<Message, ProtocolError> {
        match self {
            WireFormat::Json => codec::encode_text(event).map(Message::Text),
            WireFormat::MessagePack => codec::encode(event).map(|data| Message::Binary(data.to_vec())),
        }
    }
}

fn message_len(message: &Message) -> usize {
    match message {
        Message::Text(text) => text.len(),
        Message::Binary(data) => data.len(),
        _ => 0,
    }
}

fn close_frame(code: u16, reason: &'static str) -> Message {
    Message::Close(Some(CloseFrame {
        code,
        reason: reason.into(),
    }))
}

/// Per-socket state owned by the transport task.
struct Session {
    state: Arc<AppState>,
    user_id: UserId,
    connection_id: ConnectionId,
    handle: ConnectionHandle,
    format: WireFormat,
    read_buffer: BytesMut,
    last_seen: Instant,
}

impl Session {
    /// Queue an error for this connection.
    fn reject(&self, event: Option<&str>, code: ErrorCode, message: impl Into<String>) {
        self.handle
            .send(Arc::new(ServerEvent::error(event, code, message)));
    }

    fn too_large(&self, len: usize) -> bool {
        let max = self.state.config.limits.max_message_size;
        if len > max {
            metrics::record_event_error("frame", "too_large");
            self.reject(
                None,
                ErrorCode::InvalidEvent,
                format!("Frame of {len} bytes exceeds the {max} byte limit"),
            );
            return true;
        }
        false
    }

    async fn on_text(&mut self, text: &str) {
        if self.too_large(text.len()) {
            return;
        }
        match codec::decode_text::<ClientEvent>(text) {
            Ok(event) => self.dispatch(event, text.len()).await,
            Err(e) => {
                debug!(connection = %self.connection_id, error = %e, "Undecodable text frame");
                metrics::record_event_error("frame", "decode");
                self.reject(None, ErrorCode::InvalidEvent, e.to_string());
            }
        }
    }

    async fn on_binary(&mut self, data: &[u8]) {
        self.format = WireFormat::MessagePack;
        if self.too_large(data.len()) {
            return;
        }
        self.read_buffer.extend_from_slice(data);

        loop {
            match codec::decode_from::<ClientEvent>(&mut self.read_buffer) {
                Ok(Some(event)) => self.dispatch(event, data.len()).await,
                Ok(None) => break,
                Err(e) => {
                    debug!(connection = %self.connection_id, error = %e, "Undecodable binary frame");
                    metrics::record_event_error("frame", "decode");
                    self.read_buffer.clear();
                    self.reject(None, ErrorCode::InvalidEvent, e.to_string());
                    break;
                }
            }
        }
    }

    async fn dispatch(&self, event: ClientEvent, bytes: usize) {
        let name = event.name();
        metrics::record_event(name, "inbound", bytes);

        let start = std::time::Instant::now();
        let result = self.state.router.handle(self.connection_id, event).await;
        metrics::record_dispatch(start.elapsed().as_secs_f64());

        match result {
            Ok(()) if matches!(name, "message:send") => metrics::record_message_sent(),
            Ok(()) => {}
            Err(e) => {
                warn!(
                    user = %self.user_id,
                    connection = %self.connection_id,
                    event = name,
                    kind = e.kind(),
                    error = %e,
                    "Event rejected"
                );
                metrics::record_event_error(name, e.kind());
                self.reject(Some(name), e.code(), e.to_string());
            }
        }
        if name.starts_with("call:") {
            metrics::set_active_calls(self.state.router.calls().active_count());
        }
    }
}

/// Write one queued event. Returns `false` once the socket is unusable.
async fn write_event(
    sender: &mut SplitSink<WebSocket, Message>,
    format: WireFormat,
    event: &ServerEvent,
) -> bool {
    match format.encode(event) {
        Ok(message) => {
            metrics::record_event(event.name(), "outbound", message_len(&message));
            sender.send(message).await.is_ok()
        }
        Err(e) => {
            error!(event = event.name(), error = %e, "Failed to encode event");
            metrics::record_error("encode");
            true
        }
    }
}

/// Handle an authenticated WebSocket connection.
async fn handle_websocket(
    socket: WebSocket,
    state: Arc<AppState>,
    user_id: UserId,
    _slot: ConnectionSlot,
) {
    let _metrics_guard = ConnectionMetricsGuard::new();

    let (handle, mut outbound) = ConnectionHandle::channel();
    let connection_id = handle.id();
    let heartbeat = Duration::from_millis(state.config.heartbeat.interval_ms);
    let timeout = Duration::from_millis(state.config.heartbeat.timeout_ms);

    // Queued before registration so it is the first thing written.
    handle.send(Arc::new(ServerEvent::Connected {
        connection_id: connection_id.to_string(),
        user_id: user_id.clone(),
        version: PROTOCOL_VERSION,
        heartbeat: u32::try_from(state.config.heartbeat.interval_ms).unwrap_or(u32::MAX),
    }));

    if let Err(e) = state.router.connect(&user_id, handle.clone()).await {
        warn!(user = %user_id, error = %e, "Registration failed");
        return;
    }

    debug!(user = %user_id, connection = %connection_id, "WebSocket connected");

    let (mut sender, mut receiver) = socket.split();
    let mut session = Session {
        state: Arc::clone(&state),
        user_id,
        connection_id,
        handle,
        format: WireFormat::Json,
        read_buffer: BytesMut::with_capacity(4096),
        last_seen: Instant::now(),
    };

    let mut ticker = tokio::time::interval_at(Instant::now() + heartbeat, heartbeat);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            Some(next) = outbound.recv() => {
                match next {
                    Outbound::Event(event) => {
                        if !write_event(&mut sender, session.format, &event).await {
                            break;
                        }
                    }
                    Outbound::Close(reason) => {
                        let code = match reason {
                            CloseReason::Superseded => CLOSE_SUPERSEDED,
                            CloseReason::Shutdown => close_code::AWAY,
                        };
                        let _ = sender.send(close_frame(code, reason.as_str())).await;
                        break;
                    }
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        session.last_seen = Instant::now();
                        session.on_text(&text).await;
                    }
                    Some(Ok(Message::Binary(data))) => {
                        session.last_seen = Instant::now();
                        session.on_binary(&data).await;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        session.last_seen = Instant::now();
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        session.last_seen = Instant::now();
                    }
                    Some(Ok(Message::Close(_))) => {
                        debug!(connection = %connection_id, "Received close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(connection = %connection_id, error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        break;
                    }
                    None => {
                        debug!(connection = %connection_id, "WebSocket stream ended");
                        break;
                    }
                }
            }

            _ = ticker.tick() => {
                if session.last_seen.elapsed() > timeout {
                    info!(user = %session.user_id, connection = %connection_id, "Heartbeat timeout");
                    let _ = sender.send(close_frame(CLOSE_IDLE, "heartbeat timeout")).await;
                    break;
                }
                if sender.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }

    state.router.disconnect(connection_id).await;
    metrics::set_active_calls(state.router.calls().active_count());

    debug!(connection = %connection_id, "WebSocket disconnected");
}
