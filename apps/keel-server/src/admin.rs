//! HTTP admin surface.
//!
//! Exposes node introspection and operator actions:
//! - `GET /health` - 200 when serving, 503 once the node is faulted
//! - `GET /status` - full node status as JSON
//! - `POST /snapshot` - force a snapshot and compact the log
//! - `POST /members/add` - start adding a member, body `{"node": "n4"}`
//! - `POST /members/remove` - start removing a member, same body
//!
//! Membership and snapshot calls go through the local node, so they
//! answer with 421 and the leader id when this node cannot serve them.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;

use keel_raft::{LogIndex, NodeId, NodeStatus, RaftError, RaftNode};

/// HTTP server for the admin endpoints.
pub struct AdminServer {
    addr: SocketAddr,
    node: Arc<RaftNode>,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
    server_handle: Option<JoinHandle<Result<(), std::io::Error>>>,
}

impl AdminServer {
    pub fn new(addr: SocketAddr, node: Arc<RaftNode>) -> Self {
        Self {
            addr,
            node,
            shutdown_tx: None,
            server_handle: None,
        }
    }

    /// Bind the listener and start serving.
    pub async fn start(&mut self) -> Result<(), AdminError> {
        let app = Router::new()
            .route("/health", get(health_handler))
            .route("/status", get(status_handler))
            .route("/snapshot", post(snapshot_handler))
            .route("/members/add", post(add_member_handler))
            .route("/members/remove", post(remove_member_handler))
            .with_state(self.node.clone());

        let listener = tokio::net::TcpListener::bind(self.addr)
            .await
            .map_err(|e| AdminError::Startup(format!("Failed to bind {}: {}", self.addr, e)))?;
        // Keep the actual address so callers binding port 0 can find it.
        self.addr = listener
            .local_addr()
            .map_err(|e| AdminError::Startup(format!("Failed to read local addr: {}", e)))?;

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
        self.shutdown_tx = Some(shutdown_tx);

        let server_handle = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    shutdown_rx.await.ok();
                })
                .await
        });
        self.server_handle = Some(server_handle);

        tracing::info!(addr = %self.addr, "admin server started");
        Ok(())
    }

    /// The bound address, once started.
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting and wait for in-flight requests to finish.
    pub async fn shutdown(mut self) -> Result<(), AdminError> {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.server_handle.take() {
            handle
                .await
                .map_err(|e| AdminError::Shutdown(format!("Join error: {}", e)))?
                .map_err(|e| AdminError::Shutdown(format!("Server error: {}", e)))?;
        }
        Ok(())
    }
}

async fn health_handler(State(node): State<Arc<RaftNode>>) -> Response {
    if node.status().faulted {
        (StatusCode::SERVICE_UNAVAILABLE, "FAULTED").into_response()
    } else {
        (StatusCode::OK, "OK").into_response()
    }
}

async fn status_handler(State(node): State<Arc<RaftNode>>) -> Json<NodeStatus> {
    Json(node.status())
}

#[derive(Debug, Serialize)]
struct SnapshotTaken {
    /// Last index covered by the snapshot, absent when there was nothing
    /// new to compact.
    snapshot_index: Option<LogIndex>,
}

async fn snapshot_handler(State(node): State<Arc<RaftNode>>) -> Response {
    match node.force_snapshot().await {
        Ok(snapshot_index) => Json(SnapshotTaken { snapshot_index }).into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Deserialize)]
struct MemberChange {
    node: String,
}

async fn add_member_handler(
    State(node): State<Arc<RaftNode>>,
    Json(change): Json<MemberChange>,
) -> Response {
    match node.add_member(NodeId::new(change.node)).await {
        Ok(()) => (StatusCode::OK, "OK").into_response(),
        Err(e) => error_response(e),
    }
}

async fn remove_member_handler(
    State(node): State<Arc<RaftNode>>,
    Json(change): Json<MemberChange>,
) -> Response {
    match node.remove_member(NodeId::new(change.node)).await {
        Ok(()) => (StatusCode::OK, "OK").into_response(),
        Err(e) => error_response(e),
    }
}

fn error_response(error: RaftError) -> Response {
    let status = match &error {
        RaftError::NotLeader { .. } => StatusCode::MISDIRECTED_REQUEST,
        RaftError::MembershipRejected { .. } => StatusCode::CONFLICT,
        RaftError::CommitTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        RaftError::Shutdown | RaftError::Faulted { .. } => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, error.to_string()).into_response()
}

/// Admin server errors.
#[derive(Debug, thiserror::Error)]
pub enum AdminError {
    #[error("Startup error: {0}")]
    Startup(String),

    #[error("Shutdown error: {0}")]
    Shutdown(String),
}
