//! Single-writer consensus core.
//!
//! One task owns every piece of consensus state and drains one event
//! channel. Peer RPCs, client submissions, timer ticks, and completions of
//! outbound RPCs all arrive as [`CoreEvent`]s, so no lock guards any
//! consensus decision and no interleaving can observe half-updated state.
//!
//! Storage writes are awaited inline: handling an event is not finished
//! until its durability obligations are met. Outbound RPCs never block the
//! core; they run in spawned tasks whose results come back as events.

use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, mpsc, oneshot};

use keel_store::{
    HardState, HardStateFile, LogConfig, LogStore, SnapshotStore, StoredEntry,
};

use crate::config::RaftConfig;
use crate::error::{RaftError, Result};
use crate::machine::StateMachine;
use crate::node::NodeStatus;
use crate::session::{Admission, SessionTable};
use crate::snapshot::{IncomingSnapshot, SnapshotPayload};
use crate::timer::ElectionTimer;
use crate::transport::{PeerRpc, RaftTransport};
use crate::types::*;

/// Everything the core task reacts to.
#[derive(Debug)]
pub enum CoreEvent {
    /// Inbound RPC from a peer.
    Peer(PeerRpc),
    /// Client-facing operation.
    Client(ClientOp),
    /// Administrative operation.
    Control(ControlOp),
    /// Election timer fired.
    ElectionTimeout,
    /// Heartbeat cadence tick (leader replication driver).
    HeartbeatTick,
    /// A RequestVote RPC we sent completed. `term` is our term at send
    /// time; failed RPCs are logged in the sender task and produce no event.
    VoteReply {
        term: Term,
        from: NodeId,
        response: VoteResponse,
    },
    /// An AppendEntries RPC we sent completed or failed. Failures must come
    /// back too, to clear the single-inflight slot for the peer.
    AppendReply {
        peer: NodeId,
        term: Term,
        /// Highest entry index carried by the request.
        sent_up_to: LogIndex,
        result: Result<AppendEntriesResponse>,
    },
    /// A snapshot transfer to a peer finished (all chunks) or failed.
    SnapshotReply {
        peer: NodeId,
        term: Term,
        last_included: LogIndex,
        result: Result<InstallSnapshotResponse>,
    },
}

/// Client-facing operations, entered through [`RaftNode`].
///
/// [`RaftNode`]: crate::node::RaftNode
#[derive(Debug)]
pub enum ClientOp {
    /// Submit a command for replication. The reply resolves once the entry
    /// commits and applies, with the state machine's response.
    Submit {
        client: ClientId,
        sequence: u64,
        data: Bytes,
        reply: oneshot::Sender<Result<Bytes>>,
    },
    /// Refresh session liveness without writing to the log.
    KeepAlive {
        client: ClientId,
        reply: oneshot::Sender<Result<()>>,
    },
    /// Retire a session cluster-wide.
    Close {
        client: ClientId,
        reply: oneshot::Sender<Result<()>>,
    },
}

/// Administrative operations.
#[derive(Debug)]
pub enum ControlOp {
    /// Snapshot now, regardless of thresholds. Resolves with the covered
    /// index, or None when there is nothing to snapshot.
    ForceSnapshot {
        reply: oneshot::Sender<Result<Option<LogIndex>>>,
    },
    /// Add a node via joint consensus. Resolves when the final
    /// configuration commits.
    AddMember {
        node: NodeId,
        reply: oneshot::Sender<Result<()>>,
    },
    /// Remove a node via joint consensus.
    RemoveMember {
        node: NodeId,
        reply: oneshot::Sender<Result<()>>,
    },
}

/// A submitted command waiting for its index to commit.
pub(crate) struct PendingSubmit {
    /// Term the entry was appended in. If a different term's entry commits
    /// at this index, ours was overwritten.
    pub term: Term,
    pub reply: oneshot::Sender<Result<Bytes>>,
}

/// An in-flight membership change on the leader.
pub(crate) struct PendingConfig {
    pub reply: oneshot::Sender<Result<()>>,
    /// Index of the final Single entry once the joint phase committed.
    pub final_index: Option<LogIndex>,
}

/// Parameters for building a core.
pub(crate) struct CoreArgs {
    pub id: NodeId,
    pub config: RaftConfig,
    pub data_dir: PathBuf,
    pub initial_members: Vec<NodeId>,
    pub transport: Arc<dyn RaftTransport>,
    pub machine: Box<dyn StateMachine>,
    pub events_tx: mpsc::Sender<CoreEvent>,
    pub timer: ElectionTimer,
    pub status: Arc<RwLock<NodeStatus>>,
}

/// The consensus state machine. Owned by exactly one task.
pub(crate) struct RaftCore {
    pub(crate) id: NodeId,
    pub(crate) config: RaftConfig,
    pub(crate) transport: Arc<dyn RaftTransport>,

    // Durable state.
    pub(crate) log: LogStore,
    pub(crate) hard_state_file: HardStateFile,
    pub(crate) snapshots: SnapshotStore,
    pub(crate) term: Term,
    pub(crate) voted_for: Option<NodeId>,

    // Volatile state.
    pub(crate) role: Role,
    pub(crate) leader_hint: Option<NodeId>,
    pub(crate) commit_index: LogIndex,
    pub(crate) applied_index: LogIndex,

    // Membership. `members` is the latest configuration in the log and
    // governs every quorum decision from the moment the entry is appended.
    pub(crate) members: MemberConfig,
    pub(crate) members_index: LogIndex,
    /// Configuration as of `applied_index`, recorded into snapshots.
    pub(crate) applied_members: MemberConfig,
    /// Configuration recorded in the latest local snapshot; the base for
    /// rebuilding `members` after a suffix truncation.
    pub(crate) snapshot_members: MemberConfig,

    // Application state.
    pub(crate) machine: Box<dyn StateMachine>,
    pub(crate) sessions: SessionTable,
    pub(crate) snapshot_last_index: LogIndex,
    pub(crate) snapshot_last_term: Term,

    // Leader-only volatile state.
    pub(crate) next_index: HashMap<NodeId, LogIndex>,
    pub(crate) match_index: HashMap<NodeId, LogIndex>,
    pub(crate) inflight_append: HashSet<NodeId>,
    pub(crate) inflight_snapshot: HashSet<NodeId>,
    pub(crate) votes_received: Vec<NodeId>,
    pub(crate) pending: HashMap<LogIndex, PendingSubmit>,
    pub(crate) pending_config: Option<PendingConfig>,
    /// Leader-local session liveness; never replicated.
    pub(crate) contact: HashMap<ClientId, Instant>,
    pub(crate) ticks_since_gc: u32,

    // Follower-side snapshot transfer in progress.
    pub(crate) incoming_snapshot: Option<IncomingSnapshot>,

    // Plumbing.
    pub(crate) events_tx: mpsc::Sender<CoreEvent>,
    pub(crate) timer: ElectionTimer,
    pub(crate) status: Arc<RwLock<NodeStatus>>,
    /// Set on the first unrecoverable storage error; the node then refuses
    /// all work instead of serving from state it cannot persist.
    pub(crate) faulted: Option<String>,
}

impl RaftCore {
    /// Builds a core from disk, replaying snapshot and log.
    ///
    /// After recovery `commit_index == applied_index == snapshot boundary`:
    /// entries beyond the snapshot are re-applied only once their
    /// commitment is re-learned through normal protocol traffic.
    pub(crate) async fn recover(args: CoreArgs) -> Result<Self> {
        args.config
            .validate()
            .map_err(|reason| RaftError::Config { reason })?;

        tokio::fs::create_dir_all(&args.data_dir).await?;
        let hard_state_file = HardStateFile::new(&args.data_dir);
        let hard_state = hard_state_file.load().await?.unwrap_or_default();

        let snapshots = SnapshotStore::open(&args.data_dir.join("snap")).await?;
        let blob = snapshots.load_latest().await?;

        let (mut log, report) = LogStore::open(LogConfig {
            dir: args.data_dir.join("log"),
            max_segment_size: args.config.log_segment_size,
            fsync: args.config.log_fsync,
        })
        .await?;

        let mut machine = args.machine;
        let mut sessions = SessionTable::new();
        let mut snapshot_members = MemberConfig::Single(args.initial_members.clone());
        let mut snapshot_last_index = LogIndex::ZERO;
        let mut snapshot_last_term = Term::ZERO;

        if let Some(blob) = blob {
            let payload: SnapshotPayload = bincode::deserialize(&blob.data)?;
            machine.restore(&payload.machine)?;
            sessions = payload.sessions;
            snapshot_members = payload.members;
            snapshot_last_index = LogIndex(blob.last_index);
            snapshot_last_term = Term(blob.last_term);
        }

        // A crash between snapshot install and log reset leaves the log
        // behind the snapshot; the snapshot wins.
        if log.last_index() < snapshot_last_index.as_u64() {
            log.reset(snapshot_last_index.as_u64(), snapshot_last_term.as_u64())
                .await?;
        }
        if log.first_index() > snapshot_last_index.as_u64() + 1 {
            return Err(RaftError::Internal {
                reason: format!(
                    "log starts at {} but latest snapshot covers only up to {}",
                    log.first_index(),
                    snapshot_last_index
                ),
            });
        }

        let mut core = Self {
            id: args.id,
            config: args.config,
            transport: args.transport,
            log,
            hard_state_file,
            snapshots,
            term: Term(hard_state.term),
            voted_for: hard_state.voted_for.map(NodeId),
            role: Role::Follower,
            leader_hint: None,
            commit_index: snapshot_last_index,
            applied_index: snapshot_last_index,
            members: snapshot_members.clone(),
            members_index: LogIndex::ZERO,
            applied_members: snapshot_members.clone(),
            snapshot_members,
            machine,
            sessions,
            snapshot_last_index,
            snapshot_last_term,
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            inflight_append: HashSet::new(),
            inflight_snapshot: HashSet::new(),
            votes_received: Vec::new(),
            pending: HashMap::new(),
            pending_config: None,
            contact: HashMap::new(),
            ticks_since_gc: 0,
            incoming_snapshot: None,
            events_tx: args.events_tx,
            timer: args.timer,
            status: args.status,
            faulted: None,
        };
        core.rebuild_members_from_log()?;

        tracing::info!(
            node = %core.id,
            term = %core.term,
            last_log = %LogIndex(core.log.last_index()),
            snapshot = %core.snapshot_last_index,
            entries_recovered = report.entries_recovered,
            corruption = report.corruption_detected,
            "node recovered"
        );

        Ok(core)
    }

    /// Event loop. Runs until shutdown fires or the event channel closes.
    pub(crate) async fn run(
        mut self,
        mut events: mpsc::Receiver<CoreEvent>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        self.publish_status();
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                event = events.recv() => {
                    let Some(event) = event else { break };
                    if let Err(e) = self.handle_event(event).await {
                        // Only storage failures propagate this far. The node
                        // latches faulted and refuses further work rather
                        // than serving from state it cannot persist.
                        tracing::error!(node = %self.id, error = %e, "unrecoverable storage error, node faulted");
                        self.faulted = Some(e.to_string());
                        self.fail_pending(|| RaftError::Faulted {
                            reason: "storage failure".to_string(),
                        });
                    }
                    self.publish_status();
                }
            }
        }
        self.fail_pending(|| RaftError::Shutdown);
        self.publish_status();
        tracing::info!(node = %self.id, "core task stopped");
    }

    async fn handle_event(&mut self, event: CoreEvent) -> Result<()> {
        if let Some(reason) = self.faulted.clone() {
            self.reject_faulted(event, &reason);
            return Ok(());
        }
        match event {
            CoreEvent::Peer(rpc) => self.handle_peer_rpc(rpc).await,
            CoreEvent::Client(op) => self.handle_client_op(op).await,
            CoreEvent::Control(op) => self.handle_control_op(op).await,
            CoreEvent::ElectionTimeout => self.handle_election_timeout().await,
            CoreEvent::HeartbeatTick => self.handle_heartbeat_tick().await,
            CoreEvent::VoteReply {
                term,
                from,
                response,
            } => self.handle_vote_reply(term, from, response).await,
            CoreEvent::AppendReply {
                peer,
                term,
                sent_up_to,
                result,
            } => self.handle_append_reply(peer, term, sent_up_to, result).await,
            CoreEvent::SnapshotReply {
                peer,
                term,
                last_included,
                result,
            } => {
                self.handle_snapshot_reply(peer, term, last_included, result)
                    .await
            }
        }
    }

    async fn handle_peer_rpc(&mut self, rpc: PeerRpc) -> Result<()> {
        match rpc {
            PeerRpc::Vote {
                request,
                response_tx,
            } => {
                let response = self.handle_vote_request(request).await?;
                let _ = response_tx.send(response);
            }
            PeerRpc::Append {
                request,
                response_tx,
            } => {
                let response = self.handle_append_request(request).await?;
                let _ = response_tx.send(response);
            }
            PeerRpc::Snapshot {
                request,
                response_tx,
            } => {
                let response = self.handle_install_request(request).await?;
                let _ = response_tx.send(response);
            }
        }
        Ok(())
    }

    pub(crate) async fn handle_client_op(&mut self, op: ClientOp) -> Result<()> {
        match op {
            ClientOp::Submit {
                client,
                sequence,
                data,
                reply,
            } => self.handle_submit(client, sequence, data, reply).await,
            ClientOp::KeepAlive { client, reply } => {
                if self.role == Role::Leader {
                    self.contact.insert(client, Instant::now());
                    let _ = reply.send(Ok(()));
                } else {
                    let _ = reply.send(Err(self.not_leader()));
                }
                Ok(())
            }
            ClientOp::Close { client, reply } => self.handle_close(client, reply).await,
        }
    }

    /// Admits, appends, and starts replicating one client command.
    pub(crate) async fn handle_submit(
        &mut self,
        client: ClientId,
        sequence: u64,
        data: Bytes,
        reply: oneshot::Sender<Result<Bytes>>,
    ) -> Result<()> {
        if self.role != Role::Leader {
            let _ = reply.send(Err(self.not_leader()));
            return Ok(());
        }
        self.contact.insert(client, Instant::now());

        match self.sessions.admit(client, sequence) {
            Admission::Duplicate(cached) => {
                tracing::debug!(node = %self.id, %client, sequence, "duplicate command, serving cached response");
                let _ = reply.send(Ok(cached));
                return Ok(());
            }
            Admission::Stale => {
                // The original response is gone. Dropping the reply turns
                // into a client-side timeout, keeping the failure surface to
                // NotLeader-or-Timeout.
                tracing::debug!(node = %self.id, %client, sequence, "stale sequence dropped");
                drop(reply);
                return Ok(());
            }
            Admission::Accept => {}
        }

        let index = self
            .append_local(LogPayload::Command {
                client,
                sequence,
                data,
            })
            .await?;
        self.pending.insert(
            index,
            PendingSubmit {
                term: self.term,
                reply,
            },
        );
        self.replicate_to_all()?;
        // A single-node cluster commits without any peer traffic.
        self.advance_commit().await?;
        Ok(())
    }

    /// Proposes session retirement. Best effort: replies once the eviction
    /// entry is durable locally rather than waiting for commit.
    async fn handle_close(
        &mut self,
        client: ClientId,
        reply: oneshot::Sender<Result<()>>,
    ) -> Result<()> {
        if self.role != Role::Leader {
            let _ = reply.send(Err(self.not_leader()));
            return Ok(());
        }
        if self.sessions.contains(client) {
            self.append_local(LogPayload::EvictSession { client }).await?;
            self.replicate_to_all()?;
            self.advance_commit().await?;
        }
        let _ = reply.send(Ok(()));
        Ok(())
    }

    async fn handle_control_op(&mut self, op: ControlOp) -> Result<()> {
        match op {
            ControlOp::ForceSnapshot { reply } => {
                let result = self.take_snapshot().await;
                let _ = reply.send(result);
                Ok(())
            }
            ControlOp::AddMember { node, reply } => self.handle_add_member(node, reply).await,
            ControlOp::RemoveMember { node, reply } => self.handle_remove_member(node, reply).await,
        }
    }

    /// Appends one entry to the local log (fsynced per policy) and tracks
    /// any membership payload immediately.
    pub(crate) async fn append_local(&mut self, payload: LogPayload) -> Result<LogIndex> {
        let index = LogIndex(self.log.last_index() + 1);
        let entry = LogEntry::new(self.term, index, payload);
        self.log.append(&[to_stored(&entry)?]).await?;

        if let LogPayload::Membership(config) = &entry.payload {
            self.install_member_config(config.clone(), index);
        }
        Ok(index)
    }

    /// Applies every committed-but-unapplied entry in order, answering
    /// waiting clients and honoring session dedup at apply time.
    pub(crate) async fn apply_committed(&mut self) -> Result<()> {
        while self.applied_index < self.commit_index {
            let next = self.applied_index.next();
            let stored = self
                .log
                .entry(next.as_u64())?
                .ok_or_else(|| RaftError::Internal {
                    reason: format!("committed entry {} missing from log", next),
                })?;
            let entry = from_stored(&stored)?;

            let response = match entry.payload {
                LogPayload::Noop => None,
                LogPayload::Command {
                    client,
                    sequence,
                    data,
                } => match self.sessions.admit(client, sequence) {
                    Admission::Accept => {
                        let out = self.machine.apply(&data);
                        self.sessions.record(client, sequence, out.clone());
                        Some(out)
                    }
                    // The same command can commit behind two different
                    // indexes across a leader change; only the first
                    // execution touches the machine.
                    Admission::Duplicate(cached) => Some(cached),
                    Admission::Stale => None,
                },
                LogPayload::Membership(config) => {
                    self.applied_members = config.clone();
                    self.on_membership_applied(config, next).await?;
                    None
                }
                LogPayload::EvictSession { client } => {
                    if self.sessions.evict(client) {
                        tracing::debug!(node = %self.id, %client, "session evicted");
                    }
                    self.contact.remove(&client);
                    None
                }
            };

            self.applied_index = next;

            if let Some(waiter) = self.pending.remove(&next) {
                match response {
                    Some(bytes) if waiter.term == entry.term => {
                        let _ = waiter.reply.send(Ok(bytes));
                    }
                    // A different term's entry landed here: the submitted
                    // command was overwritten during a leader change.
                    _ => {
                        let _ = waiter.reply.send(Err(self.not_leader()));
                    }
                }
            }
        }

        self.maybe_snapshot().await?;
        Ok(())
    }

    /// Reverts to follower, adopting `new_term` if it is higher. The term
    /// change is persisted before anything else happens in it.
    pub(crate) async fn step_down(
        &mut self,
        new_term: Term,
        leader: Option<NodeId>,
    ) -> Result<()> {
        if new_term > self.term {
            self.term = new_term;
            self.voted_for = None;
            self.persist_hard_state().await?;
        }
        if self.role != Role::Follower {
            tracing::info!(node = %self.id, term = %self.term, "stepping down to follower");
        }
        self.role = Role::Follower;
        if leader.is_some() {
            self.leader_hint = leader;
        }
        self.votes_received.clear();
        self.next_index.clear();
        self.match_index.clear();
        self.inflight_append.clear();
        self.inflight_snapshot.clear();
        self.contact.clear();
        let hint = self.leader_hint.clone();
        self.fail_pending(move || RaftError::NotLeader {
            leader: hint.clone(),
        });
        self.timer.reset();
        Ok(())
    }

    /// Rebuilds the effective configuration from the snapshot base plus
    /// every membership entry still in the log. Called after recovery and
    /// after suffix truncation, either of which can drop the entry that
    /// produced `members`.
    pub(crate) fn rebuild_members_from_log(&mut self) -> Result<()> {
        let mut config = self.snapshot_members.clone();
        let mut config_index = LogIndex::ZERO;
        for index in self.log.first_index()..=self.log.last_index() {
            if let Some(stored) = self.log.entry(index)? {
                let entry = from_stored(&stored)?;
                if let LogPayload::Membership(c) = entry.payload {
                    config = c;
                    config_index = LogIndex(index);
                }
            }
        }
        self.members = config;
        self.members_index = config_index;
        Ok(())
    }

    pub(crate) fn install_member_config(&mut self, config: MemberConfig, index: LogIndex) {
        tracing::info!(
            node = %self.id,
            index = %index,
            joint = config.is_joint(),
            members = ?config.all_nodes(),
            "membership configuration active"
        );
        self.members = config;
        self.members_index = index;
    }

    pub(crate) async fn persist_hard_state(&mut self) -> Result<()> {
        self.hard_state_file
            .save(&HardState {
                term: self.term.as_u64(),
                voted_for: self.voted_for.as_ref().map(|n| n.0.clone()),
            })
            .await?;
        Ok(())
    }

    pub(crate) fn not_leader(&self) -> RaftError {
        RaftError::NotLeader {
            leader: self.leader_hint.clone(),
        }
    }

    /// Fails every waiting client and any pending membership change.
    pub(crate) fn fail_pending(&mut self, error: impl Fn() -> RaftError) {
        for (_, waiter) in self.pending.drain() {
            let _ = waiter.reply.send(Err(error()));
        }
        if let Some(pending) = self.pending_config.take() {
            let _ = pending.reply.send(Err(error()));
        }
    }

    fn reject_faulted(&mut self, event: CoreEvent, reason: &str) {
        let err = || RaftError::Faulted {
            reason: reason.to_string(),
        };
        match event {
            CoreEvent::Client(ClientOp::Submit { reply, .. }) => {
                let _ = reply.send(Err(err()));
            }
            CoreEvent::Client(ClientOp::KeepAlive { reply, .. })
            | CoreEvent::Client(ClientOp::Close { reply, .. }) => {
                let _ = reply.send(Err(err()));
            }
            CoreEvent::Control(ControlOp::ForceSnapshot { reply }) => {
                let _ = reply.send(Err(err()));
            }
            CoreEvent::Control(ControlOp::AddMember { reply, .. })
            | CoreEvent::Control(ControlOp::RemoveMember { reply, .. }) => {
                let _ = reply.send(Err(err()));
            }
            // Dropping a peer RPC's response channel reads as a transport
            // failure on the other side.
            _ => {}
        }
    }

    pub(crate) fn publish_status(&self) {
        let mut status = self.status.write();
        *status = NodeStatus {
            node: self.id.clone(),
            role: self.role,
            term: self.term.as_u64(),
            leader: self.leader_hint.clone(),
            commit_index: self.commit_index.as_u64(),
            applied_index: self.applied_index.as_u64(),
            last_log_index: self.log.last_index(),
            snapshot_index: self.snapshot_last_index.as_u64(),
            members: self.members.all_nodes(),
            joint: self.members.is_joint(),
            sessions: self.sessions.len(),
            faulted: self.faulted.is_some(),
        };
    }
}

/// Encodes a consensus entry into its storage form.
pub(crate) fn to_stored(entry: &LogEntry) -> Result<StoredEntry> {
    Ok(StoredEntry {
        index: entry.index.as_u64(),
        term: entry.term.as_u64(),
        payload: Bytes::from(bincode::serialize(&entry.payload)?),
    })
}

/// Decodes a stored entry back into its consensus form.
pub(crate) fn from_stored(stored: &StoredEntry) -> Result<LogEntry> {
    Ok(LogEntry {
        term: Term(stored.term),
        index: LogIndex(stored.index),
        payload: bincode::deserialize(&stored.payload)?,
    })
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::transport::InMemoryTransport;
    use keel_store::FsyncPolicy;
    use std::path::Path;
    use std::time::Duration;

    /// Deterministic machine for handler-level tests: echoes each command
    /// back and remembers everything it applied.
    #[derive(Default)]
    pub(crate) struct EchoMachine {
        pub applied: Vec<Bytes>,
    }

    impl StateMachine for EchoMachine {
        fn apply(&mut self, command: &[u8]) -> Bytes {
            let out = Bytes::copy_from_slice(command);
            self.applied.push(out.clone());
            out
        }

        fn snapshot(&self) -> Bytes {
            let raw: Vec<Vec<u8>> = self.applied.iter().map(|b| b.to_vec()).collect();
            Bytes::from(bincode::serialize(&raw).unwrap())
        }

        fn restore(&mut self, data: &[u8]) -> Result<()> {
            let raw: Vec<Vec<u8>> = bincode::deserialize(data)?;
            self.applied = raw.into_iter().map(Bytes::from).collect();
            Ok(())
        }
    }

    pub(crate) fn test_config() -> RaftConfig {
        RaftConfig {
            heartbeat_interval: Duration::from_millis(20),
            election_timeout_min: Duration::from_millis(50),
            election_timeout_max: Duration::from_millis(100),
            session_ttl: Duration::from_millis(200),
            log_fsync: FsyncPolicy::Os,
            ..RaftConfig::default()
        }
    }

    /// Builds a recovered core over `dir` with an unconnected transport.
    pub(crate) async fn recovered_core(
        dir: &Path,
        id: &str,
        members: &[&str],
    ) -> (RaftCore, mpsc::Receiver<CoreEvent>) {
        let config = test_config();
        let (events_tx, events_rx) = mpsc::channel(256);
        let timer = ElectionTimer::new(config.clone());
        let status = Arc::new(RwLock::new(NodeStatus::initial(NodeId::new(id))));
        let core = RaftCore::recover(CoreArgs {
            id: NodeId::new(id),
            config,
            data_dir: dir.to_path_buf(),
            initial_members: members.iter().map(|n| NodeId::new(*n)).collect(),
            transport: Arc::new(InMemoryTransport::new(
                NodeId::new(id),
                HashMap::new(),
            )),
            machine: Box::new(EchoMachine::default()),
            events_tx,
            timer,
            status,
        })
        .await
        .unwrap();
        (core, events_rx)
    }
}
