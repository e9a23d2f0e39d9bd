//! Public node handle.
//!
//! [`RaftNode::start`] recovers durable state from disk, then spawns the
//! consensus task, the election timer, the heartbeat ticker, and a
//! forwarder that funnels peer RPCs into the consensus event queue. The
//! handle itself is cheap to clone behind an [`Arc`] and every method is
//! safe to call from any task.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::config::RaftConfig;
use crate::core::{ClientOp, ControlOp, CoreArgs, CoreEvent, RaftCore};
use crate::error::{RaftError, Result};
use crate::machine::StateMachine;
use crate::timer::ElectionTimer;
use crate::transport::{PeerRpc, RaftTransport};
use crate::types::*;

/// Point-in-time view of a node, refreshed after every consensus event.
#[derive(Debug, Clone, Serialize)]
pub struct NodeStatus {
    pub node: NodeId,
    pub role: Role,
    pub term: u64,
    /// Last known leader, if any. A hint, not a guarantee.
    pub leader: Option<NodeId>,
    pub commit_index: u64,
    pub applied_index: u64,
    pub last_log_index: u64,
    /// Last log index covered by the newest snapshot.
    pub snapshot_index: u64,
    pub members: Vec<NodeId>,
    /// True while a configuration change is between its two entries.
    pub joint: bool,
    /// Live client sessions in the replicated table.
    pub sessions: usize,
    /// True once the node hit an unrecoverable storage error and stopped
    /// accepting work.
    pub faulted: bool,
}

impl NodeStatus {
    pub(crate) fn initial(node: NodeId) -> Self {
        Self {
            node,
            role: Role::Follower,
            term: 0,
            leader: None,
            commit_index: 0,
            applied_index: 0,
            last_log_index: 0,
            snapshot_index: 0,
            members: Vec::new(),
            joint: false,
            sessions: 0,
            faulted: false,
        }
    }
}

/// Everything needed to start a node.
pub struct NodeOptions {
    pub id: NodeId,
    pub config: RaftConfig,
    /// Directory for the log, snapshots, and vote state. Created if
    /// missing.
    pub data_dir: PathBuf,
    /// Seed configuration, used only when neither a snapshot nor a
    /// membership entry exists on disk.
    pub initial_members: Vec<NodeId>,
    pub transport: Arc<dyn RaftTransport>,
    pub machine: Box<dyn StateMachine>,
}

/// Handle to a running consensus node.
pub struct RaftNode {
    id: NodeId,
    events_tx: mpsc::Sender<CoreEvent>,
    peers_tx: mpsc::Sender<PeerRpc>,
    status: Arc<RwLock<NodeStatus>>,
    shutdown_tx: broadcast::Sender<()>,
    propose_timeout: Duration,
}

impl RaftNode {
    /// Recovers durable state and spawns the background tasks.
    pub async fn start(options: NodeOptions) -> Result<Arc<Self>> {
        let (events_tx, events_rx) = mpsc::channel(256);
        let (peers_tx, mut peers_rx) = mpsc::channel::<PeerRpc>(64);
        let (shutdown_tx, _) = broadcast::channel(16);
        let status = Arc::new(RwLock::new(NodeStatus::initial(options.id.clone())));
        let timer = ElectionTimer::new(options.config.clone());
        let propose_timeout = options.config.propose_timeout;
        let heartbeat = options.config.heartbeat_interval;
        let id = options.id.clone();

        let core = RaftCore::recover(CoreArgs {
            id: options.id,
            config: options.config,
            data_dir: options.data_dir,
            initial_members: options.initial_members,
            transport: options.transport,
            machine: options.machine,
            events_tx: events_tx.clone(),
            timer: timer.clone(),
            status: status.clone(),
        })
        .await?;

        tokio::spawn(core.run(events_rx, shutdown_tx.subscribe()));
        tokio::spawn(timer.run(events_tx.clone(), shutdown_tx.subscribe()));

        // Peer RPCs go through the same queue as everything else, so the
        // core stays the single writer of consensus state.
        let forward_tx = events_tx.clone();
        let mut forward_shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = forward_shutdown.recv() => break,
                    rpc = peers_rx.recv() => {
                        let Some(rpc) = rpc else { break };
                        if forward_tx.send(CoreEvent::Peer(rpc)).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        let tick_tx = events_tx.clone();
        let mut tick_shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(heartbeat);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = tick_shutdown.recv() => break,
                    _ = interval.tick() => {
                        if tick_tx.send(CoreEvent::HeartbeatTick).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        Ok(Arc::new(Self {
            id,
            events_tx,
            peers_tx,
            status,
            shutdown_tx,
            propose_timeout,
        }))
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    /// Channel for delivering inbound peer RPCs to this node. Server
    /// frontends and test harnesses feed it.
    pub fn peer_sender(&self) -> mpsc::Sender<PeerRpc> {
        self.peers_tx.clone()
    }

    pub fn status(&self) -> NodeStatus {
        self.status.read().clone()
    }

    /// Submits one command and waits for it to commit and apply. Resent
    /// commands (same client and sequence) return the original response
    /// without re-executing.
    pub async fn submit(&self, client: ClientId, sequence: u64, data: Bytes) -> Result<Bytes> {
        let (tx, rx) = oneshot::channel();
        self.send_client(ClientOp::Submit {
            client,
            sequence,
            data,
            reply: tx,
        })
        .await?;
        self.wait(rx).await
    }

    /// Refreshes the session's liveness window without running a command.
    pub async fn keep_alive(&self, client: ClientId) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send_client(ClientOp::KeepAlive { client, reply: tx })
            .await?;
        self.wait(rx).await
    }

    /// Retires the session. Best effort; an unreachable leader just means
    /// the session ages out later.
    pub async fn close_session(&self, client: ClientId) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send_client(ClientOp::Close { client, reply: tx })
            .await?;
        self.wait(rx).await
    }

    /// Snapshots now, regardless of thresholds. Returns the covered index,
    /// or `None` when nothing has been applied since the last snapshot.
    pub async fn force_snapshot(&self) -> Result<Option<LogIndex>> {
        let (tx, rx) = oneshot::channel();
        self.send_control(ControlOp::ForceSnapshot { reply: tx })
            .await?;
        self.wait(rx).await
    }

    /// Adds a node through joint consensus. Resolves once the final
    /// configuration commits; a timeout does not abort the change.
    pub async fn add_member(&self, node: NodeId) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send_control(ControlOp::AddMember { node, reply: tx })
            .await?;
        self.wait(rx).await
    }

    /// Removes a node through joint consensus.
    pub async fn remove_member(&self, node: NodeId) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send_control(ControlOp::RemoveMember { node, reply: tx })
            .await?;
        self.wait(rx).await
    }

    /// Stops every background task. Durable state stays on disk; a new
    /// node can be started over the same directory.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(());
    }

    async fn send_client(&self, op: ClientOp) -> Result<()> {
        self.events_tx
            .send(CoreEvent::Client(op))
            .await
            .map_err(|_| RaftError::Shutdown)
    }

    async fn send_control(&self, op: ControlOp) -> Result<()> {
        self.events_tx
            .send(CoreEvent::Control(op))
            .await
            .map_err(|_| RaftError::Shutdown)
    }

    /// Waits for the core's reply within the propose timeout. A dropped
    /// reply channel also reads as a timeout: the command may or may not
    /// have committed, and the caller retries with the same sequence.
    async fn wait<T>(&self, rx: oneshot::Receiver<Result<T>>) -> Result<T> {
        let timeout_err = || RaftError::CommitTimeout {
            elapsed_ms: self.propose_timeout.as_millis() as u64,
        };
        match tokio::time::timeout(self.propose_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(timeout_err()),
            Err(_) => Err(timeout_err()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::testing::{test_config, EchoMachine};
    use crate::transport::InMemoryTransport;
    use std::collections::HashMap;
    use tempfile::TempDir;

    async fn started_node(dir: &std::path::Path, id: &str, members: &[&str]) -> Arc<RaftNode> {
        RaftNode::start(NodeOptions {
            id: NodeId::new(id),
            config: test_config(),
            data_dir: dir.to_path_buf(),
            initial_members: members.iter().map(|n| NodeId::new(*n)).collect(),
            transport: Arc::new(InMemoryTransport::new(NodeId::new(id), HashMap::new())),
            machine: Box::new(EchoMachine::default()),
        })
        .await
        .unwrap()
    }

    async fn wait_for_leader(node: &RaftNode) {
        for _ in 0..200 {
            if node.status().role == Role::Leader {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("node never became leader: {:?}", node.status());
    }

    #[tokio::test]
    async fn test_single_node_serves_commands() {
        let temp = TempDir::new().unwrap();
        let node = started_node(temp.path(), "n1", &["n1"]).await;
        wait_for_leader(&node).await;

        let out = node
            .submit(ClientId(1), 1, Bytes::from_static(b"hello"))
            .await
            .unwrap();
        assert_eq!(out, Bytes::from_static(b"hello"));

        // Retry with the same sequence: cached, not re-applied.
        let again = node
            .submit(ClientId(1), 1, Bytes::from_static(b"hello"))
            .await
            .unwrap();
        assert_eq!(again, out);

        let status = node.status();
        assert_eq!(status.role, Role::Leader);
        assert!(status.commit_index >= 2);
        assert_eq!(status.commit_index, status.applied_index);
        assert_eq!(status.sessions, 1);
        assert_eq!(status.leader, Some(NodeId::new("n1")));

        node.keep_alive(ClientId(1)).await.unwrap();
        node.close_session(ClientId(1)).await.unwrap();
        node.stop();
    }

    #[tokio::test]
    async fn test_force_snapshot_and_restart() {
        let temp = TempDir::new().unwrap();
        {
            let node = started_node(temp.path(), "n1", &["n1"]).await;
            wait_for_leader(&node).await;
            for seq in 1..=3 {
                node.submit(ClientId(9), seq, Bytes::from_static(b"cmd"))
                    .await
                    .unwrap();
            }
            let index = node.force_snapshot().await.unwrap();
            assert!(index.is_some());
            assert!(node.status().snapshot_index > 0);
            node.stop();
            // Give the core task a moment to drain.
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let node = started_node(temp.path(), "n1", &["n1"]).await;
        let status = node.status();
        assert!(status.applied_index >= 4);
        assert_eq!(status.sessions, 1);

        wait_for_leader(&node).await;
        // Session survived the restart: the old sequence is still dedup'd.
        let cached = node
            .submit(ClientId(9), 3, Bytes::from_static(b"cmd"))
            .await
            .unwrap();
        assert_eq!(cached, Bytes::from_static(b"cmd"));
        node.stop();
    }

    #[tokio::test]
    async fn test_stopped_node_rejects_work() {
        let temp = TempDir::new().unwrap();
        let node = started_node(temp.path(), "n1", &["n1"]).await;
        wait_for_leader(&node).await;
        node.stop();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let result = node
            .submit(ClientId(1), 1, Bytes::from_static(b"late"))
            .await;
        assert!(matches!(result, Err(RaftError::Shutdown)));
    }
}
