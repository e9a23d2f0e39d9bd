//! Transport abstraction for peer RPC traffic.
//!
//! `RaftTransport` keeps the consensus core independent of how bytes move:
//! production uses the TCP transport in the server crate, tests use
//! in-process channels. All calls are async and return
//! `Result<Response, RaftError>`.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

use crate::error::{RaftError, Result};
use crate::types::*;

/// Pluggable peer-to-peer transport.
///
/// Implementations own connection management and serialization. Transient
/// failures surface as errors; the core treats a failed RPC like a silent
/// peer and retries on its own schedule, so transports should fail fast
/// rather than retry internally.
#[async_trait]
pub trait RaftTransport: Send + Sync {
    /// Sends a RequestVote RPC and awaits the peer's response.
    async fn request_vote(&self, target: &NodeId, request: VoteRequest) -> Result<VoteResponse>;

    /// Sends an AppendEntries RPC (replication or heartbeat) and awaits the
    /// peer's response.
    async fn append_entries(
        &self,
        target: &NodeId,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse>;

    /// Sends one InstallSnapshot chunk and awaits the peer's response.
    async fn install_snapshot(
        &self,
        target: &NodeId,
        request: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse>;
}

/// An inbound RPC paired with the channel its response goes back on.
#[derive(Debug)]
pub enum PeerRpc {
    Vote {
        request: VoteRequest,
        response_tx: oneshot::Sender<VoteResponse>,
    },
    Append {
        request: AppendEntriesRequest,
        response_tx: oneshot::Sender<AppendEntriesResponse>,
    },
    Snapshot {
        request: InstallSnapshotRequest,
        response_tx: oneshot::Sender<InstallSnapshotResponse>,
    },
}

pub type RpcSender = mpsc::Sender<PeerRpc>;
pub type RpcReceiver = mpsc::Receiver<PeerRpc>;

/// In-process transport over channels, for tests.
///
/// Each node registers an [`RpcSender`] under its ID; removing a peer
/// simulates a network partition, re-adding it heals the partition.
pub struct InMemoryTransport {
    local_id: NodeId,
    peers: Arc<RwLock<HashMap<NodeId, RpcSender>>>,
}

impl InMemoryTransport {
    pub fn new(local_id: NodeId, peers: HashMap<NodeId, RpcSender>) -> Self {
        Self {
            local_id,
            peers: Arc::new(RwLock::new(peers)),
        }
    }

    pub fn local_id(&self) -> &NodeId {
        &self.local_id
    }

    pub fn add_peer(&self, peer_id: NodeId, sender: RpcSender) {
        self.peers.write().insert(peer_id, sender);
    }

    pub fn remove_peer(&self, peer_id: &NodeId) {
        self.peers.write().remove(peer_id);
    }

    fn get_peer(&self, peer_id: &NodeId) -> Result<RpcSender> {
        self.peers
            .read()
            .get(peer_id)
            .cloned()
            .ok_or_else(|| RaftError::Transport {
                peer: peer_id.clone(),
                reason: "peer unreachable".to_string(),
            })
    }
}

fn channel_closed(peer: &NodeId) -> RaftError {
    RaftError::Transport {
        peer: peer.clone(),
        reason: "peer channel closed".to_string(),
    }
}

#[async_trait]
impl RaftTransport for InMemoryTransport {
    async fn request_vote(&self, target: &NodeId, request: VoteRequest) -> Result<VoteResponse> {
        let peer = self.get_peer(target)?;
        let (response_tx, response_rx) = oneshot::channel();
        peer.send(PeerRpc::Vote {
            request,
            response_tx,
        })
        .await
        .map_err(|_| channel_closed(target))?;
        response_rx.await.map_err(|_| channel_closed(target))
    }

    async fn append_entries(
        &self,
        target: &NodeId,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        let peer = self.get_peer(target)?;
        let (response_tx, response_rx) = oneshot::channel();
        peer.send(PeerRpc::Append {
            request,
            response_tx,
        })
        .await
        .map_err(|_| channel_closed(target))?;
        response_rx.await.map_err(|_| channel_closed(target))
    }

    async fn install_snapshot(
        &self,
        target: &NodeId,
        request: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse> {
        let peer = self.get_peer(target)?;
        let (response_tx, response_rx) = oneshot::channel();
        peer.send(PeerRpc::Snapshot {
            request,
            response_tx,
        })
        .await
        .map_err(|_| channel_closed(target))?;
        response_rx.await.map_err(|_| channel_closed(target))
    }
}
