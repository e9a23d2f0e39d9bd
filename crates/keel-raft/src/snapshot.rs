//! Snapshot capture, log compaction, and chunked transfer to peers that
//! have fallen behind the compacted log.
//!
//! A snapshot carries the state machine image plus the session table and
//! member configuration as of its last included index, so a node restored
//! from one resumes with full dedup and quorum bookkeeping. The blob is
//! made durable before any local state switches over.

use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use keel_store::{SnapshotBlob, SnapshotStore};

use crate::core::{CoreEvent, RaftCore};
use crate::error::{RaftError, Result};
use crate::session::SessionTable;
use crate::transport::RaftTransport;
use crate::types::*;

/// Everything a restored node needs beyond the raw machine image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct SnapshotPayload {
    pub members: MemberConfig,
    pub machine: Bytes,
    pub sessions: SessionTable,
}

/// Reassembly buffer for an inbound transfer in progress.
#[derive(Debug)]
pub(crate) struct IncomingSnapshot {
    pub last_index: LogIndex,
    pub last_term: Term,
    pub buf: Vec<u8>,
}

impl RaftCore {
    /// Captures a snapshot at the applied index and compacts the log
    /// behind it. Returns the snapshot index, or `None` when nothing has
    /// been applied since the last one.
    pub(crate) async fn take_snapshot(&mut self) -> Result<Option<LogIndex>> {
        if self.applied_index == self.snapshot_last_index || self.applied_index == LogIndex::ZERO {
            return Ok(None);
        }
        let last_index = self.applied_index;
        let last_term = match self.log.term_of(last_index.as_u64())? {
            Some(t) => Term(t),
            None => {
                return Err(RaftError::Internal {
                    reason: format!("applied entry {} missing from log", last_index),
                })
            }
        };

        let payload = SnapshotPayload {
            members: self.applied_members.clone(),
            machine: self.machine.snapshot(),
            sessions: self.sessions.clone(),
        };
        let data = bincode::serialize(&payload)?;
        let blob = SnapshotBlob {
            last_index: last_index.as_u64(),
            last_term: last_term.as_u64(),
            data: Bytes::from(data),
        };
        self.snapshots.save(&blob).await?;

        let removed = self
            .log
            .compact(last_index.as_u64(), last_term.as_u64())
            .await?;
        let pruned = self.snapshots.prune_older_than(last_index.as_u64()).await?;

        self.snapshot_last_index = last_index;
        self.snapshot_last_term = last_term;
        self.snapshot_members = payload.members;
        tracing::info!(
            node = %self.id,
            index = %last_index,
            term = %last_term,
            entries_removed = removed,
            snapshots_pruned = pruned,
            "snapshot taken"
        );
        Ok(Some(last_index))
    }

    /// Takes a snapshot once enough entries have been applied since the
    /// last one. Called after every apply batch.
    pub(crate) async fn maybe_snapshot(&mut self) -> Result<()> {
        let since = self.applied_index.as_u64() - self.snapshot_last_index.as_u64();
        if since >= self.config.snapshot_threshold {
            self.take_snapshot().await?;
        }
        Ok(())
    }

    /// Follower-side InstallSnapshot handler. Chunks are buffered in
    /// memory and the whole state switches over on the final chunk.
    pub(crate) async fn handle_install_request(
        &mut self,
        request: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse> {
        if request.term > self.term {
            self.step_down(request.term, Some(request.leader_id.clone()))
                .await?;
        }
        if request.term < self.term {
            return Ok(InstallSnapshotResponse {
                term: self.term,
                bytes_stored: 0,
            });
        }
        self.leader_hint = Some(request.leader_id.clone());
        self.timer.reset();
        if self.role != Role::Follower {
            self.step_down(request.term, Some(request.leader_id.clone()))
                .await?;
        }

        // Local state already covers this snapshot: ack every chunk so the
        // leader finishes the transfer and moves back to appends.
        if request.last_included_index <= self.applied_index {
            return Ok(InstallSnapshotResponse {
                term: self.term,
                bytes_stored: request.offset + request.data.len() as u64,
            });
        }

        if request.offset == 0 {
            self.incoming_snapshot = Some(IncomingSnapshot {
                last_index: request.last_included_index,
                last_term: request.last_included_term,
                buf: Vec::new(),
            });
        }
        let Some(incoming) = self.incoming_snapshot.as_mut() else {
            // Mid-transfer chunk with no transfer open; report zero so the
            // leader restarts from the first chunk.
            return Ok(InstallSnapshotResponse {
                term: self.term,
                bytes_stored: 0,
            });
        };
        if incoming.last_index != request.last_included_index
            || incoming.last_term != request.last_included_term
            || incoming.buf.len() as u64 != request.offset
        {
            let stored = incoming.buf.len() as u64;
            tracing::debug!(
                node = %self.id,
                offset = request.offset,
                stored,
                "out-of-order snapshot chunk"
            );
            return Ok(InstallSnapshotResponse {
                term: self.term,
                bytes_stored: stored,
            });
        }
        incoming.buf.extend_from_slice(&request.data);
        let stored = incoming.buf.len() as u64;

        if request.done {
            let incoming = match self.incoming_snapshot.take() {
                Some(incoming) => incoming,
                None => {
                    return Err(RaftError::Internal {
                        reason: "snapshot buffer vanished mid-transfer".to_string(),
                    })
                }
            };
            self.install_snapshot_state(incoming).await?;
        }
        Ok(InstallSnapshotResponse {
            term: self.term,
            bytes_stored: stored,
        })
    }

    /// Makes the received snapshot durable, then replaces machine,
    /// sessions, membership, and log wholesale.
    async fn install_snapshot_state(&mut self, incoming: IncomingSnapshot) -> Result<()> {
        let payload: SnapshotPayload = bincode::deserialize(&incoming.buf)?;
        let blob = SnapshotBlob {
            last_index: incoming.last_index.as_u64(),
            last_term: incoming.last_term.as_u64(),
            data: Bytes::from(incoming.buf),
        };
        // Durable first: a crash after this point recovers from the new
        // snapshot instead of the stale log.
        self.snapshots.save(&blob).await?;
        self.snapshots.prune_older_than(blob.last_index).await?;

        self.machine.restore(&payload.machine)?;
        self.sessions = payload.sessions;
        self.members = payload.members.clone();
        self.members_index = incoming.last_index;
        self.applied_members = payload.members.clone();
        self.snapshot_members = payload.members;

        self.log
            .reset(incoming.last_index.as_u64(), incoming.last_term.as_u64())
            .await?;
        self.commit_index = incoming.last_index;
        self.applied_index = incoming.last_index;
        self.snapshot_last_index = incoming.last_index;
        self.snapshot_last_term = incoming.last_term;
        tracing::info!(
            node = %self.id,
            index = %incoming.last_index,
            term = %incoming.last_term,
            "installed snapshot from leader"
        );
        Ok(())
    }

    /// Starts streaming the latest snapshot to `peer` in the background.
    /// One completion event comes back per transfer, success or not.
    pub(crate) fn start_snapshot_transfer(&mut self, peer: NodeId) {
        if self.inflight_snapshot.contains(&peer) {
            return;
        }
        self.inflight_snapshot.insert(peer.clone());
        tracing::info!(
            node = %self.id,
            peer = %peer,
            log_first = self.log.first_index(),
            "peer is behind the compacted log, sending snapshot"
        );

        let snapshots = self.snapshots.clone();
        let transport = self.transport.clone();
        let events = self.events_tx.clone();
        let term = self.term;
        let leader_id = self.id.clone();
        let chunk_size = self.config.snapshot_chunk_size;
        tokio::spawn(async move {
            let outcome =
                send_snapshot(snapshots, transport, leader_id, term, &peer, chunk_size).await;
            let (last_included, result) = match outcome {
                Ok((index, response)) => (index, Ok(response)),
                Err(e) => (LogIndex::ZERO, Err(e)),
            };
            let _ = events
                .send(CoreEvent::SnapshotReply {
                    peer,
                    term,
                    last_included,
                    result,
                })
                .await;
        });
    }

    pub(crate) async fn handle_snapshot_reply(
        &mut self,
        peer: NodeId,
        term: Term,
        last_included: LogIndex,
        result: Result<InstallSnapshotResponse>,
    ) -> Result<()> {
        self.inflight_snapshot.remove(&peer);

        let response = match result {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(node = %self.id, peer = %peer, error = %e, "snapshot transfer failed, will retry");
                return Ok(());
            }
        };

        if response.term > self.term {
            return self.step_down(response.term, None).await;
        }
        if self.role != Role::Leader || term != self.term {
            return Ok(());
        }

        let matched = self
            .match_index
            .entry(peer.clone())
            .or_insert(LogIndex::ZERO);
        if last_included > *matched {
            *matched = last_included;
        }
        self.next_index.insert(peer.clone(), last_included.next());
        tracing::info!(node = %self.id, peer = %peer, through = %last_included, "snapshot transfer complete");

        // The peer can take appends from the snapshot boundary onward now.
        self.maybe_send_append(&peer)
    }
}

/// Streams one snapshot to one peer, chunk by chunk. Aborts on the first
/// transport error, a peer that reports a higher term, or a byte count
/// that does not line up with what we sent.
async fn send_snapshot(
    snapshots: SnapshotStore,
    transport: Arc<dyn RaftTransport>,
    leader_id: NodeId,
    term: Term,
    peer: &NodeId,
    chunk_size: usize,
) -> Result<(LogIndex, InstallSnapshotResponse)> {
    let Some(blob) = snapshots.load_latest().await? else {
        return Err(RaftError::SnapshotFailed {
            reason: "no snapshot on disk to send".to_string(),
        });
    };
    let last_included_index = LogIndex(blob.last_index);
    let last_included_term = Term(blob.last_term);
    let total = blob.data.len();
    let mut offset = 0usize;

    loop {
        let end = (offset + chunk_size).min(total);
        let done = end == total;
        let request = InstallSnapshotRequest {
            term,
            leader_id: leader_id.clone(),
            last_included_index,
            last_included_term,
            offset: offset as u64,
            data: blob.data.slice(offset..end),
            done,
        };
        let response = transport.install_snapshot(peer, request).await?;
        if response.term > term {
            // Let the core observe the term and step down.
            return Ok((last_included_index, response));
        }
        if response.bytes_stored != end as u64 {
            return Err(RaftError::SnapshotFailed {
                reason: format!(
                    "peer {} stored {} bytes, expected {}",
                    peer, response.bytes_stored, end
                ),
            });
        }
        if done {
            return Ok((last_included_index, response));
        }
        offset = end;
    }
}
