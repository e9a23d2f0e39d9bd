//! Consensus error types.

use thiserror::Error;

use crate::types::NodeId;

/// Consensus errors.
#[derive(Error, Debug)]
pub enum RaftError {
    /// Not the leader (cannot accept writes). Carries the best known leader
    /// hint for client redirection.
    #[error("Not leader (known leader: {leader:?})")]
    NotLeader { leader: Option<NodeId> },

    /// Commit wait exceeded the propose timeout.
    #[error("Commit timeout after {elapsed_ms}ms")]
    CommitTimeout { elapsed_ms: u64 },

    /// Membership change cannot proceed.
    #[error("Membership change rejected: {reason}")]
    MembershipRejected { reason: String },

    /// Snapshot transfer or installation failed.
    #[error("Snapshot install failed: {reason}")]
    SnapshotFailed { reason: String },

    /// Node is shutting down.
    #[error("Node is shutting down")]
    Shutdown,

    /// Node hit an unrecoverable storage error and stopped participating.
    #[error("Node is faulted: {reason}")]
    Faulted { reason: String },

    /// Configuration error.
    #[error("Configuration error: {reason}")]
    Config { reason: String },

    /// I/O error.
    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// Serialization error.
    #[error("Serialization error: {source}")]
    Serialization {
        #[from]
        source: bincode::Error,
    },

    /// Storage error.
    #[error("Storage error: {source}")]
    Storage {
        #[from]
        source: keel_store::StoreError,
    },

    /// Failed to reach a peer.
    #[error("Transport error to {peer}: {reason}")]
    Transport { peer: NodeId, reason: String },

    /// Internal error (bug).
    #[error("Internal error: {reason}")]
    Internal { reason: String },
}

/// Consensus result type.
pub type Result<T> = std::result::Result<T, RaftError>;
