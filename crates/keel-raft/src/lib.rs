//! keel-raft: replicated state machine consensus.
//!
//! Raft consensus over a pluggable [`StateMachine`]:
//! - Leader election with randomized timeouts
//! - Log replication with conflict backtracking
//! - Crash-safe persistence (entries fsynced before acknowledgement,
//!   votes persisted before they are granted)
//! - Snapshot compaction and chunked InstallSnapshot for lagging peers
//! - Joint consensus for safe membership changes
//! - Replicated client sessions for at-most-once command execution
//!
//! Based on the Raft paper (Ongaro & Ousterhout, 2014).
//!
//! All consensus state lives in a single task; RPCs, client commands,
//! timer events, and replies from peers arrive over one queue and are
//! handled one at a time. Everything else talks to that task through
//! [`RaftNode`].

pub mod config;
pub mod error;
pub mod machine;
pub mod node;
pub mod session;
pub mod timer;
pub mod transport;
pub mod types;
pub mod wire;

mod core;
mod election;
mod membership;
mod replication;
mod snapshot;

pub use config::RaftConfig;
pub use error::{RaftError, Result};
pub use keel_store::FsyncPolicy;
pub use machine::StateMachine;
pub use node::{NodeOptions, NodeStatus, RaftNode};
pub use types::*;
