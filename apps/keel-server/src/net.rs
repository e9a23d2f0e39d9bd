//! TCP listeners and the peer transport.
//!
//! All connections carry [`keel_raft::wire`] frames. Peer connections
//! multiplex concurrent RPCs with a correlation id; client connections
//! are strictly request/response.
//!
//! [`serve_peer`] and [`serve_client`] are the inbound halves.
//! [`TcpPeerTransport`] is the outbound half, implementing the consensus
//! core's transport trait. The outbound client half lives in
//! `keel_client` so client binaries need not link the server.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use keel_client::{response_from_error, ClientRequest, ClientResponse};
use keel_raft::transport::{PeerRpc, RaftTransport, RpcSender};
use keel_raft::wire::{read_frame, write_frame};
use keel_raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    NodeId, RaftError, RaftNode, VoteRequest, VoteResponse,
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(3);

// ---------------------------------------------------------------------------
// Peer wire protocol

#[derive(Debug, Serialize, Deserialize)]
struct PeerRequest {
    correlation: u64,
    body: PeerRequestBody,
}

#[derive(Debug, Serialize, Deserialize)]
enum PeerRequestBody {
    Vote(VoteRequest),
    Append(AppendEntriesRequest),
    Snapshot(InstallSnapshotRequest),
}

#[derive(Debug, Serialize, Deserialize)]
struct PeerReply {
    correlation: u64,
    body: PeerReplyBody,
}

#[derive(Debug, Serialize, Deserialize)]
enum PeerReplyBody {
    Vote(VoteResponse),
    Append(AppendEntriesResponse),
    Snapshot(InstallSnapshotResponse),
}

// ---------------------------------------------------------------------------
// Inbound peer listener

/// Accepts peer connections and forwards their RPCs into the consensus
/// core. Runs until the listener task is dropped or aborted.
pub async fn serve_peer(listener: TcpListener, rpc_tx: RpcSender) {
    loop {
        match listener.accept().await {
            Ok((stream, remote)) => {
                debug!(%remote, "peer connected");
                tokio::spawn(handle_peer_conn(stream, rpc_tx.clone()));
            }
            Err(e) => {
                warn!(error = %e, "peer accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn handle_peer_conn(stream: TcpStream, rpc_tx: RpcSender) {
    let _ = stream.set_nodelay(true);
    let (mut reader, writer) = stream.into_split();
    let writer = Arc::new(tokio::sync::Mutex::new(writer));

    loop {
        let request: PeerRequest = match read_frame(&mut reader).await {
            Ok(request) => request,
            Err(e) => {
                if e.kind() != io::ErrorKind::UnexpectedEof {
                    debug!(error = %e, "peer connection closed");
                }
                return;
            }
        };

        let correlation = request.correlation;
        // Each RPC gets its own reply task so a slow response (a vote held
        // by a busy core, say) never blocks the next frame on this
        // connection.
        let forwarded = match request.body {
            PeerRequestBody::Vote(vote) => {
                let (response_tx, response_rx) = oneshot::channel();
                let sent = rpc_tx
                    .send(PeerRpc::Vote {
                        request: vote,
                        response_tx,
                    })
                    .await;
                spawn_reply(&writer, correlation, response_rx, PeerReplyBody::Vote);
                sent.is_ok()
            }
            PeerRequestBody::Append(append) => {
                let (response_tx, response_rx) = oneshot::channel();
                let sent = rpc_tx
                    .send(PeerRpc::Append {
                        request: append,
                        response_tx,
                    })
                    .await;
                spawn_reply(&writer, correlation, response_rx, PeerReplyBody::Append);
                sent.is_ok()
            }
            PeerRequestBody::Snapshot(snapshot) => {
                let (response_tx, response_rx) = oneshot::channel();
                let sent = rpc_tx
                    .send(PeerRpc::Snapshot {
                        request: snapshot,
                        response_tx,
                    })
                    .await;
                spawn_reply(&writer, correlation, response_rx, PeerReplyBody::Snapshot);
                sent.is_ok()
            }
        };

        if !forwarded {
            debug!("consensus core is gone, dropping peer connection");
            return;
        }
    }
}

fn spawn_reply<T>(
    writer: &Arc<tokio::sync::Mutex<OwnedWriteHalf>>,
    correlation: u64,
    response_rx: oneshot::Receiver<T>,
    wrap: fn(T) -> PeerReplyBody,
) where
    T: Send + 'static,
{
    let writer = Arc::clone(writer);
    tokio::spawn(async move {
        // The core drops the sender when it cannot answer; the caller
        // times out on its side, so no reply is the right reply.
        let Ok(response) = response_rx.await else {
            return;
        };
        let reply = PeerReply {
            correlation,
            body: wrap(response),
        };
        let mut writer = writer.lock().await;
        if let Err(e) = write_frame(&mut *writer, &reply).await {
            debug!(error = %e, "failed to write peer reply");
        }
    });
}

// ---------------------------------------------------------------------------
// Outbound peer transport

/// One pooled connection to a peer. Cheap to clone; the reader task and
/// every in-flight request share the same pending map.
#[derive(Clone)]
struct PeerConn {
    writer: Arc<tokio::sync::Mutex<OwnedWriteHalf>>,
    pending: Arc<parking_lot::Mutex<HashMap<u64, oneshot::Sender<PeerReplyBody>>>>,
    next_correlation: Arc<AtomicU64>,
}

/// Consensus transport over pooled TCP connections.
///
/// Connections are dialed on first use and dropped on any error; the
/// next request reconnects. Concurrent RPCs to the same peer share one
/// connection, matched up by correlation id.
pub struct TcpPeerTransport {
    peer_addrs: HashMap<NodeId, String>,
    conns: Arc<tokio::sync::Mutex<HashMap<NodeId, PeerConn>>>,
}

impl TcpPeerTransport {
    /// `peer_addrs` maps every other member to its peer listen address.
    pub fn new(peer_addrs: HashMap<NodeId, String>) -> Self {
        Self {
            peer_addrs,
            conns: Arc::new(tokio::sync::Mutex::new(HashMap::new())),
        }
    }

    async fn get_conn(&self, target: &NodeId) -> Result<PeerConn, RaftError> {
        let mut conns = self.conns.lock().await;
        if let Some(conn) = conns.get(target) {
            return Ok(conn.clone());
        }

        let addr = self
            .peer_addrs
            .get(target)
            .ok_or_else(|| RaftError::Transport {
                peer: target.clone(),
                reason: "no address configured".to_string(),
            })?;

        let stream = match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(RaftError::Transport {
                    peer: target.clone(),
                    reason: format!("connect to {}: {}", addr, e),
                })
            }
            Err(_) => {
                return Err(RaftError::Transport {
                    peer: target.clone(),
                    reason: format!("connect to {}: timed out", addr),
                })
            }
        };
        let _ = stream.set_nodelay(true);

        let (read_half, write_half) = stream.into_split();
        let conn = PeerConn {
            writer: Arc::new(tokio::sync::Mutex::new(write_half)),
            pending: Arc::new(parking_lot::Mutex::new(HashMap::new())),
            next_correlation: Arc::new(AtomicU64::new(1)),
        };
        conns.insert(target.clone(), conn.clone());

        tokio::spawn(run_reader(
            read_half,
            target.clone(),
            conn.pending.clone(),
            Arc::clone(&self.conns),
        ));

        Ok(conn)
    }

    /// Removes `conn` from the pool unless a newer connection replaced it.
    async fn drop_conn(&self, target: &NodeId, conn: &PeerConn) {
        let mut conns = self.conns.lock().await;
        if let Some(current) = conns.get(target) {
            if Arc::ptr_eq(&current.pending, &conn.pending) {
                conns.remove(target);
            }
        }
    }

    async fn request(
        &self,
        target: &NodeId,
        body: PeerRequestBody,
    ) -> Result<PeerReplyBody, RaftError> {
        let conn = self.get_conn(target).await?;
        let correlation = conn.next_correlation.fetch_add(1, Ordering::Relaxed);
        let (reply_tx, reply_rx) = oneshot::channel();
        conn.pending.lock().insert(correlation, reply_tx);

        let frame = PeerRequest { correlation, body };
        {
            let mut writer = conn.writer.lock().await;
            if let Err(e) = write_frame(&mut *writer, &frame).await {
                drop(writer);
                conn.pending.lock().remove(&correlation);
                self.drop_conn(target, &conn).await;
                return Err(RaftError::Transport {
                    peer: target.clone(),
                    reason: format!("send failed: {}", e),
                });
            }
        }

        match tokio::time::timeout(REQUEST_TIMEOUT, reply_rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(RaftError::Transport {
                peer: target.clone(),
                reason: "connection closed before reply".to_string(),
            }),
            Err(_) => {
                conn.pending.lock().remove(&correlation);
                self.drop_conn(target, &conn).await;
                Err(RaftError::Transport {
                    peer: target.clone(),
                    reason: "request timed out".to_string(),
                })
            }
        }
    }
}

/// Dispatches replies to their waiting requests until the stream dies,
/// then retires the connection so the next request redials.
async fn run_reader(
    mut reader: OwnedReadHalf,
    target: NodeId,
    pending: Arc<parking_lot::Mutex<HashMap<u64, oneshot::Sender<PeerReplyBody>>>>,
    conns: Arc<tokio::sync::Mutex<HashMap<NodeId, PeerConn>>>,
) {
    loop {
        match read_frame::<_, PeerReply>(&mut reader).await {
            Ok(reply) => {
                if let Some(tx) = pending.lock().remove(&reply.correlation) {
                    let _ = tx.send(reply.body);
                }
            }
            Err(e) => {
                if e.kind() != io::ErrorKind::UnexpectedEof {
                    debug!(peer = %target, error = %e, "peer connection lost");
                }
                break;
            }
        }
    }

    let mut conns = conns.lock().await;
    if let Some(current) = conns.get(&target) {
        if Arc::ptr_eq(&current.pending, &pending) {
            conns.remove(&target);
        }
    }
    // Dropping the senders wakes every waiter with a closed-channel error.
    pending.lock().clear();
}

#[async_trait]
impl RaftTransport for TcpPeerTransport {
    async fn request_vote(
        &self,
        target: &NodeId,
        request: VoteRequest,
    ) -> Result<VoteResponse, RaftError> {
        match self.request(target, PeerRequestBody::Vote(request)).await? {
            PeerReplyBody::Vote(response) => Ok(response),
            _ => Err(mismatched_reply(target)),
        }
    }

    async fn append_entries(
        &self,
        target: &NodeId,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse, RaftError> {
        match self
            .request(target, PeerRequestBody::Append(request))
            .await?
        {
            PeerReplyBody::Append(response) => Ok(response),
            _ => Err(mismatched_reply(target)),
        }
    }

    async fn install_snapshot(
        &self,
        target: &NodeId,
        request: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse, RaftError> {
        match self
            .request(target, PeerRequestBody::Snapshot(request))
            .await?
        {
            PeerReplyBody::Snapshot(response) => Ok(response),
            _ => Err(mismatched_reply(target)),
        }
    }
}

fn mismatched_reply(target: &NodeId) -> RaftError {
    RaftError::Transport {
        peer: target.clone(),
        reason: "reply type does not match request".to_string(),
    }
}

// ---------------------------------------------------------------------------
// Client listener

/// Accepts client connections and serves their requests against the
/// local node. Each connection is request/response; redirects and
/// retries are the client library's job.
pub async fn serve_client(listener: TcpListener, node: Arc<RaftNode>) {
    loop {
        match listener.accept().await {
            Ok((stream, remote)) => {
                debug!(%remote, "client connected");
                tokio::spawn(handle_client_conn(stream, node.clone()));
            }
            Err(e) => {
                warn!(error = %e, "client accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn handle_client_conn(mut stream: TcpStream, node: Arc<RaftNode>) {
    let _ = stream.set_nodelay(true);
    loop {
        let request: ClientRequest = match read_frame(&mut stream).await {
            Ok(request) => request,
            Err(_) => return,
        };
        let response = dispatch_client(&node, request).await;
        if write_frame(&mut stream, &response).await.is_err() {
            return;
        }
    }
}

async fn dispatch_client(node: &RaftNode, request: ClientRequest) -> ClientResponse {
    match request {
        ClientRequest::Submit {
            client,
            sequence,
            data,
        } => match node.submit(client, sequence, data).await {
            Ok(response) => ClientResponse::Committed { response },
            Err(e) => response_from_error(e),
        },
        ClientRequest::KeepAlive { client } => match node.keep_alive(client).await {
            Ok(()) => ClientResponse::Ok,
            Err(e) => response_from_error(e),
        },
        ClientRequest::Close { client } => match node.close_session(client).await {
            Ok(()) => ClientResponse::Ok,
            Err(e) => response_from_error(e),
        },
    }
}
