//! Standalone sync server
//!
//! `GET /health` reports storage and peer health as JSON. `GET /sync`
//! upgrades to a WebSocket and attaches the socket to the node as a client
//! peer; every text frame carries one JSON sync message.

use crate::core_node::LocalNode;
use crate::core_sync::{PeerConnection, PeerId, PeerRole, SyncMessage, CHANNEL_CAPACITY};
use crate::health::HealthChecker;
use crate::shutdown::{wait_for_signal, ShutdownHandler};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct ServerState {
    node: LocalNode,
    health: Arc<HealthChecker>,
    connections: Arc<Semaphore>,
    next_client: Arc<AtomicU64>,
}

impl ServerState {
    pub fn new(node: LocalNode) -> Self {
        let max_connections = node.config().server.max_connections;
        Self {
            node,
            health: Arc::new(HealthChecker::new(env!("CARGO_PKG_VERSION"))),
            connections: Arc::new(Semaphore::new(max_connections)),
            next_client: Arc::new(AtomicU64::new(1)),
        }
    }
}

pub fn build_router(state: ServerState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/sync", get(sync))
        .with_state(state)
}

pub struct SyncServer {
    state: ServerState,
}

impl SyncServer {
    pub fn new(node: LocalNode) -> Self {
        Self { state: ServerState::new(node) }
    }

    /// Bind to the configured address and serve until a signal or shutdown
    pub async fn run(self) -> anyhow::Result<()> {
        let addr = self.state.node.config().server.bind_address;
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener).await
    }

    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let node = self.state.node.clone();
        let addr: SocketAddr = listener.local_addr()?;
        let gc = node.spawn_gc();
        info!(%addr, account = %node.account_id(), "Sync server listening");

        let mut stop = node.inner.shutdown.subscribe();
        let router = build_router(self.state);
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                tokio::select! {
                    _ = wait_for_signal() => {}
                    _ = stop.recv() => {}
                }
            })
            .await?;

        node.shutdown().await;
        if let Some(gc) = gc {
            gc.abort();
        }
        info!(%addr, "Sync server stopped");
        Ok(())
    }
}

async fn health(State(state): State<ServerState>) -> Response {
    let report = state.health.refresh(&state.node).await;
    let status = StatusCode::from_u16(report.status.to_http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(report)).into_response()
}

#[derive(Debug, Deserialize)]
struct SyncParams {
    /// Stable id so a reconnecting client replaces its old peer entry
    peer: Option<String>,
}

async fn sync(ws: WebSocketUpgrade, Query(params): Query<SyncParams>, State(state): State<ServerState>) -> Response {
    let Ok(permit) = state.connections.clone().try_acquire_owned() else {
        warn!("Refusing sync connection, limit reached");
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    };
    let peer_id = match params.peer {
        Some(peer) if !peer.is_empty() => PeerId::from(peer.as_str()),
        _ => PeerId::from(format!("client-{}", state.next_client.fetch_add(1, Ordering::Relaxed)).as_str()),
    };
    ws.on_upgrade(move |socket| bridge(socket, state.node, peer_id, permit))
}

/// Pump frames between the socket and the node until either side closes
async fn bridge(socket: WebSocket, node: LocalNode, peer_id: PeerId, _permit: OwnedSemaphorePermit) {
    let (to_node, incoming) = mpsc::channel(CHANNEL_CAPACITY);
    let (outgoing, mut from_node) = mpsc::channel::<SyncMessage>(CHANNEL_CAPACITY);
    let entry = node.add_peer(PeerConnection::new(peer_id.clone(), PeerRole::Client, incoming, outgoing));
    let (mut sink, mut stream) = socket.split();

    let handler = ShutdownHandler::new(&node.inner.shutdown, format!("peer {peer_id}"));
    let peer = peer_id.clone();
    handler
        .run(async move {
            loop {
                tokio::select! {
                    frame = stream.next() => match frame {
                        Some(Ok(Message::Text(text))) => match SyncMessage::from_json(&text) {
                            Ok(message) => {
                                if to_node.send(message).await.is_err() {
                                    break;
                                }
                            }
                            Err(err) => warn!(peer = %peer, error = %err, "Dropping malformed frame"),
                        },
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(err)) => {
                            debug!(peer = %peer, error = %err, "Socket error");
                            break;
                        }
                    },
                    message = from_node.recv() => {
                        let Some(message) = message else { break };
                        let text = match message.to_json() {
                            Ok(text) => text,
                            Err(err) => {
                                warn!(peer = %peer, error = %err, "Cannot encode message");
                                continue;
                            }
                        };
                        if sink.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                }
            }
            let _ = sink.close().await;
        })
        .await;

    entry.close();
    info!(peer = %peer_id, "Sync connection closed");
}
