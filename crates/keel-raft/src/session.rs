//! Replicated client session table for at-most-once command execution.
//!
//! Every node maintains this table as part of the replicated state: it is
//! updated when entries apply and included in snapshots, so a follower that
//! becomes leader can still recognize retries of commands the old leader
//! already executed.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::types::ClientId;

/// Outcome of checking a command against the session table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// New work: apply it.
    Accept,
    /// Retry of the most recent command; return the cached response without
    /// re-applying.
    Duplicate(Bytes),
    /// Sequence older than the newest seen. The original response is gone;
    /// there is nothing safe to return.
    Stale,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct SessionState {
    last_sequence: u64,
    last_response: Bytes,
}

/// Per-client dedup state.
///
/// Keyed by a BTreeMap so serialization is deterministic: every node must
/// produce identical snapshot bytes for identical logical state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionTable {
    sessions: BTreeMap<ClientId, SessionState>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Classifies a command by its session identity.
    ///
    /// An unknown client is always accepted: sessions register implicitly
    /// with their first command. A client whose session was evicted loses
    /// its dedup history, which is why eviction requires a liveness window
    /// far longer than any client retry loop.
    pub fn admit(&self, client: ClientId, sequence: u64) -> Admission {
        match self.sessions.get(&client) {
            None => Admission::Accept,
            Some(state) => {
                if sequence > state.last_sequence {
                    Admission::Accept
                } else if sequence == state.last_sequence {
                    Admission::Duplicate(state.last_response.clone())
                } else {
                    Admission::Stale
                }
            }
        }
    }

    /// Records the applied command's response, registering the session if
    /// needed.
    pub fn record(&mut self, client: ClientId, sequence: u64, response: Bytes) {
        self.sessions.insert(
            client,
            SessionState {
                last_sequence: sequence,
                last_response: response,
            },
        );
    }

    /// Removes a session. Returns false if it was not present.
    pub fn evict(&mut self, client: ClientId) -> bool {
        self.sessions.remove(&client).is_some()
    }

    pub fn contains(&self, client: ClientId) -> bool {
        self.sessions.contains_key(&client)
    }

    /// Clients with live sessions, in key order.
    pub fn clients(&self) -> impl Iterator<Item = ClientId> + '_ {
        self.sessions.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
