//! WebSocket transport server using Axum.
//!
//! Handles HTTP upgrade to WebSocket, connection identity, inbound message
//! parsing, and outbound queue draining. Each connection runs in its own
//! task: messages from different connections dispatch concurrently, while
//! messages within one connection dispatch in arrival order.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Router,
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::get,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use vmhub_protocol::ClientMessage;

use crate::connection::ConnectionMap;

/// Trait implemented by the hub to handle inbound client operations.
/// The transport layer calls this for every parsed wire message. Entry
/// points never fail — the hub classifies and absorbs all errors.
pub trait VmHandler: Send + Sync + 'static {
    fn request_vm(
        &self,
        connection_id: &str,
        vm_id: &str,
        vm_arg: Option<Value>,
    ) -> impl std::future::Future<Output = ()> + Send;

    fn update_vm(
        &self,
        connection_id: &str,
        vm_id: &str,
        vm_data: HashMap<String, Value>,
    ) -> impl std::future::Future<Output = ()> + Send;

    fn dispose_vm(
        &self,
        connection_id: &str,
        vm_id: &str,
    ) -> impl std::future::Future<Output = ()> + Send;

    /// Invoked exactly once when a connection ends. `graceful` is true when
    /// the client sent a close frame, false when the connection was lost.
    fn connection_closed(&self, connection_id: &str, graceful: bool);
}

/// Transport server configuration.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Port to listen on (0 for OS-assigned)
    pub port: u16,
    /// Hostname to bind to
    pub hostname: String,
    /// Maximum concurrent connections
    pub max_connections: Option<usize>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            port: 5100,
            hostname: "127.0.0.1".into(),
            max_connections: Some(64),
        }
    }
}

/// Shared state for the transport server.
struct AppState<H: VmHandler> {
    handler: Arc<H>,
    config: TransportConfig,
    /// Outbound queues for all live connections
    connections: Arc<ConnectionMap>,
}

/// The transport server — accepts WebSocket connections and routes messages.
pub struct TransportServer {
    /// Shutdown signal
    shutdown_tx: Option<mpsc::Sender<()>>,
    /// Server task handle
    handle: Option<tokio::task::JoinHandle<()>>,
    /// Actual bound port
    port: u16,
}

impl TransportServer {
    /// Start the transport server with the given handler. `connections` is
    /// the same map the hub's response path sends through, so pushes reach
    /// connections registered here.
    pub async fn start<H: VmHandler>(
        config: TransportConfig,
        handler: Arc<H>,
        connections: Arc<ConnectionMap>,
    ) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);

        let state = Arc::new(AppState {
            handler,
            config: config.clone(),
            connections,
        });

        let app = Router::new()
            .route("/ws", get(ws_upgrade_handler::<H>))
            .route("/health", get(health_handler::<H>))
            .with_state(state);

        let addr: SocketAddr = format!("{}:{}", config.hostname, config.port).parse()?;
        let listener = tokio::net::TcpListener::bind(addr).await?;
        let actual_port = listener.local_addr()?.port();

        info!("vmhub transport listening on ws://{}:{}/ws", config.hostname, actual_port);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.recv().await;
                })
                .await
                .ok();
        });

        Ok(Self {
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
            port: actual_port,
        })
    }

    /// Get the actual bound port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Gracefully stop the server.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(()).await;
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
        info!("vmhub transport server stopped");
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// HTTP Handlers
// ─────────────────────────────────────────────────────────────────────────────

async fn ws_upgrade_handler<H: VmHandler>(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState<H>>>,
) -> impl IntoResponse {
    // Check connection limit
    if let Some(max) = state.config.max_connections {
        let current = state.connections.len();
        if current >= max {
            warn!("Connection rejected: max connections reached ({max})");
            return StatusCode::SERVICE_UNAVAILABLE.into_response();
        }
    }

    ws.on_upgrade(move |socket| handle_ws_connection(socket, state))
        .into_response()
}

async fn health_handler<H: VmHandler>(
    State(state): State<Arc<AppState<H>>>,
) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "clients": state.connections.len(),
    }))
}

// ─────────────────────────────────────────────────────────────────────────────
// WebSocket Connection Handler
// ─────────────────────────────────────────────────────────────────────────────

async fn handle_ws_connection<H: VmHandler>(
    socket: WebSocket,
    state: Arc<AppState<H>>,
) {
    let connection_id = uuid::Uuid::new_v4().to_string();
    info!("Client connected: {connection_id}");

    let (mut ws_tx, mut ws_rx) = socket.split();

    // Register the outbound queue so pushes can reach this connection
    let mut outbound_rx = state.connections.register(&connection_id);

    let mut graceful = false;
    loop {
        tokio::select! {
            // Incoming WebSocket message
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        dispatch_message(&text, &connection_id, state.handler.as_ref()).await;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = ws_tx.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) => {
                        debug!("Client closed connection: {connection_id}");
                        graceful = true;
                        break;
                    }
                    None => {
                        debug!("Client stream ended: {connection_id}");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!("WebSocket error for {connection_id}: {e}");
                        break;
                    }
                    _ => {}
                }
            }

            // Queued pushes for this connection
            outbound = outbound_rx.recv() => {
                match outbound {
                    Some(text) => {
                        if let Err(e) = ws_tx.send(Message::Text(text.into())).await {
                            warn!("Failed to push to {connection_id}: {e}");
                            break;
                        }
                    }
                    // Sender side was deregistered elsewhere
                    None => break,
                }
            }
        }
    }

    state.connections.deregister(&connection_id);
    state.handler.connection_closed(&connection_id, graceful);
    info!(
        "Client disconnected: {connection_id} (graceful: {graceful}, total: {})",
        state.connections.len()
    );
}

/// Parse one inbound frame and dispatch it to the hub. Malformed frames are
/// logged and dropped — the wire has no error message type.
async fn dispatch_message<H: VmHandler>(text: &str, connection_id: &str, handler: &H) {
    let message: ClientMessage = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            warn!("Discarding malformed frame from {connection_id}: {e}");
            return;
        }
    };

    match message {
        ClientMessage::RequestVm { vm_id, vm_arg } => {
            handler.request_vm(connection_id, &vm_id, vm_arg).await;
        }
        ClientMessage::UpdateVm { vm_id, vm_data } => {
            handler.update_vm(connection_id, &vm_id, vm_data).await;
        }
        ClientMessage::DisposeVm { vm_id } => {
            handler.dispose_vm(connection_id, &vm_id).await;
        }
    }
}
