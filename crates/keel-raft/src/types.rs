//! Core consensus types: terms, indexes, log entries, RPC messages.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Election term number (monotonically increasing).
///
/// Terms are the logical clock of the protocol. Each term has at most one
/// leader; a node starting an election first increments its term.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Term(pub u64);

impl Term {
    pub const ZERO: Term = Term(0);

    pub fn next(self) -> Term {
        Term(self.0 + 1)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{}", self.0)
    }
}

/// Log index (1-indexed, 0 is the "before the log" sentinel).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LogIndex(pub u64);

impl LogIndex {
    pub const ZERO: LogIndex = LogIndex(0);

    pub fn next(self) -> LogIndex {
        LogIndex(self.0 + 1)
    }

    pub fn prev(self) -> Option<LogIndex> {
        if self.0 > 0 {
            Some(LogIndex(self.0 - 1))
        } else {
            None
        }
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for LogIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "I{}", self.0)
    }
}

/// Node identifier, unique across the cluster.
///
/// A string so deployments can use DNS names, UUIDs, or host:port pairs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        NodeId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Client session identifier.
///
/// Chosen randomly by the client library at startup; collisions across
/// 64 bits are not a practical concern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClientId(pub u64);

impl ClientId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "C{:016x}", self.0)
    }
}

/// What a log entry carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogPayload {
    /// Barrier a fresh leader appends so its term has a committable entry.
    Noop,
    /// Client command, tagged with session identity for deduplication.
    Command {
        client: ClientId,
        sequence: u64,
        data: Bytes,
    },
    /// Cluster membership change. Takes effect as soon as it is appended,
    /// not when it commits.
    Membership(MemberConfig),
    /// Retires a client session on every replica.
    EvictSession { client: ClientId },
}

/// A replicated log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: Term,
    pub index: LogIndex,
    pub payload: LogPayload,
}

impl LogEntry {
    pub fn new(term: Term, index: LogIndex, payload: LogPayload) -> Self {
        Self {
            term,
            index,
            payload,
        }
    }
}

/// Cluster membership, possibly mid-transition.
///
/// Changes go through joint consensus: while `Joint`, every election and
/// commit decision needs a majority of the old set AND a majority of the
/// new set, so no window exists where two disjoint majorities could decide
/// independently.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemberConfig {
    /// Stable configuration.
    Single(Vec<NodeId>),
    /// Transitional configuration.
    Joint { old: Vec<NodeId>, new: Vec<NodeId> },
}

impl MemberConfig {
    /// All nodes that should receive replication traffic (union for joint).
    pub fn all_nodes(&self) -> Vec<NodeId> {
        match self {
            MemberConfig::Single(nodes) => nodes.clone(),
            MemberConfig::Joint { old, new } => {
                let mut all = old.clone();
                for node in new {
                    if !all.contains(node) {
                        all.push(node.clone());
                    }
                }
                all
            }
        }
    }

    /// Whether `node` participates in any active configuration.
    pub fn contains(&self, node: &NodeId) -> bool {
        match self {
            MemberConfig::Single(nodes) => nodes.contains(node),
            MemberConfig::Joint { old, new } => old.contains(node) || new.contains(node),
        }
    }

    pub fn is_joint(&self) -> bool {
        matches!(self, MemberConfig::Joint { .. })
    }

    /// Checks whether `acked` satisfies this configuration's quorum rule.
    ///
    /// Single needs one majority; Joint needs a majority of old AND a
    /// majority of new.
    pub fn has_quorum(&self, acked: &[NodeId]) -> bool {
        fn majority(nodes: &[NodeId], acked: &[NodeId]) -> bool {
            let quorum = nodes.len() / 2 + 1;
            nodes.iter().filter(|n| acked.contains(n)).count() >= quorum
        }
        match self {
            MemberConfig::Single(nodes) => majority(nodes, acked),
            MemberConfig::Joint { old, new } => majority(old, acked) && majority(new, acked),
        }
    }
}

/// RequestVote RPC request, sent by a candidate to every peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteRequest {
    /// Candidate's term
    pub term: Term,

    /// Candidate requesting the vote
    pub candidate_id: NodeId,

    /// Index of candidate's last log entry
    pub last_log_index: LogIndex,

    /// Term of candidate's last log entry
    pub last_log_term: Term,
}

/// RequestVote RPC response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteResponse {
    /// Voter's current term, for the candidate to update itself
    pub term: Term,

    /// True if the candidate received the vote
    pub vote_granted: bool,
}

/// AppendEntries RPC request. An empty entries list is a heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    /// Leader's term
    pub term: Term,

    /// Leader's ID, so followers can redirect clients
    pub leader_id: NodeId,

    /// Index of the entry immediately preceding `entries`
    pub prev_log_index: LogIndex,

    /// Term of the `prev_log_index` entry
    pub prev_log_term: Term,

    /// Entries to store (empty for heartbeat)
    pub entries: Vec<LogEntry>,

    /// Leader's commit index
    pub leader_commit: LogIndex,
}

/// AppendEntries RPC response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    /// Follower's current term, for the leader to update itself
    pub term: Term,

    /// True if the consistency check at prev_log_index/prev_log_term passed
    pub success: bool,

    /// On failure, the lowest index the leader should send from next
    pub conflict_index: Option<LogIndex>,

    /// Follower's last log index after processing, for match tracking
    pub last_log_index: LogIndex,
}

/// InstallSnapshot RPC request, one chunk of a snapshot transfer.
///
/// Sent when a follower needs entries the leader has already compacted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotRequest {
    /// Leader's term
    pub term: Term,

    /// Leader's ID
    pub leader_id: NodeId,

    /// Index of the last entry covered by the snapshot
    pub last_included_index: LogIndex,

    /// Term of that entry
    pub last_included_term: Term,

    /// Byte offset of this chunk within the snapshot
    pub offset: u64,

    /// Chunk data
    pub data: Bytes,

    /// True on the final chunk
    pub done: bool,
}

/// InstallSnapshot RPC response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotResponse {
    /// Follower's current term, for the leader to update itself
    pub term: Term,

    /// Bytes the follower has buffered so far; lets the leader detect a
    /// transfer the follower abandoned
    pub bytes_stored: u64,
}

/// Node role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Follower => write!(f, "Follower"),
            Role::Candidate => write!(f, "Candidate"),
            Role::Leader => write!(f, "Leader"),
        }
    }
}
