//! Log replication: AppendEntries on both sides, commit advancement, and
//! the leader's session liveness sweep.
//!
//! The leader keeps at most one AppendEntries in flight per peer and sends
//! the next batch as soon as the previous reply lands, falling back to the
//! heartbeat tick to retry after transport failures. Followers never
//! truncate except at a genuine conflict, and never at or below their
//! commit index.

use std::time::Instant;

use keel_store::StoreError;

use crate::core::{from_stored, to_stored, CoreEvent, RaftCore};
use crate::error::{RaftError, Result};
use crate::types::*;

impl RaftCore {
    /// Kicks replication toward every configured peer.
    pub(crate) fn replicate_to_all(&mut self) -> Result<()> {
        for peer in self.members.all_nodes() {
            if peer != self.id {
                self.maybe_send_append(&peer)?;
            }
        }
        Ok(())
    }

    /// Sends the next AppendEntries to `peer` unless one is already in
    /// flight. Switches to a snapshot transfer when the peer needs entries
    /// the log no longer has.
    pub(crate) fn maybe_send_append(&mut self, peer: &NodeId) -> Result<()> {
        if self.inflight_append.contains(peer) || self.inflight_snapshot.contains(peer) {
            return Ok(());
        }

        let next = self
            .next_index
            .get(peer)
            .copied()
            .unwrap_or_else(|| LogIndex(self.log.last_index()).next());

        if next.as_u64() < self.log.first_index() {
            self.start_snapshot_transfer(peer.clone());
            return Ok(());
        }

        let prev = next.as_u64() - 1;
        let prev_log_term = match self.log.term_of(prev) {
            Ok(Some(t)) => Term(t),
            Ok(None) => {
                return Err(RaftError::Internal {
                    reason: format!("next_index {} for {} beyond leader log", next, peer),
                })
            }
            // Compacted between the first_index check and here.
            Err(StoreError::Compacted { .. }) => {
                self.start_snapshot_transfer(peer.clone());
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let to = next.as_u64() + self.config.max_entries_per_append as u64;
        let mut entries = Vec::new();
        for stored in self.log.range(next.as_u64(), to)? {
            entries.push(from_stored(&stored)?);
        }
        let sent_up_to = LogIndex(prev + entries.len() as u64);

        let request = AppendEntriesRequest {
            term: self.term,
            leader_id: self.id.clone(),
            prev_log_index: LogIndex(prev),
            prev_log_term,
            entries,
            leader_commit: self.commit_index,
        };

        self.inflight_append.insert(peer.clone());
        let transport = self.transport.clone();
        let events = self.events_tx.clone();
        let term = self.term;
        let peer = peer.clone();
        tokio::spawn(async move {
            let result = transport.append_entries(&peer, request).await;
            // Failures come back as events too; the inflight slot must be
            // cleared on the core task.
            let _ = events
                .send(CoreEvent::AppendReply {
                    peer,
                    term,
                    sent_up_to,
                    result,
                })
                .await;
        });
        Ok(())
    }

    pub(crate) async fn handle_append_reply(
        &mut self,
        peer: NodeId,
        term: Term,
        sent_up_to: LogIndex,
        result: Result<AppendEntriesResponse>,
    ) -> Result<()> {
        self.inflight_append.remove(&peer);

        let response = match result {
            Ok(response) => response,
            Err(e) => {
                tracing::debug!(node = %self.id, peer = %peer, error = %e, "append failed, will retry on next tick");
                return Ok(());
            }
        };

        if response.term > self.term {
            return self.step_down(response.term, None).await;
        }
        if self.role != Role::Leader || term != self.term {
            return Ok(());
        }

        if response.success {
            let matched = self
                .match_index
                .entry(peer.clone())
                .or_insert(LogIndex::ZERO);
            if sent_up_to > *matched {
                *matched = sent_up_to;
            }
            self.next_index.insert(peer.clone(), sent_up_to.next());
            self.advance_commit().await?;

            // Keep streaming while the peer is behind.
            if sent_up_to.as_u64() < self.log.last_index() {
                self.maybe_send_append(&peer)?;
            }
        } else {
            let fallback = self
                .next_index
                .get(&peer)
                .and_then(|n| n.prev())
                .unwrap_or(LogIndex(1));
            let mut next = response.conflict_index.unwrap_or(fallback);
            if next < LogIndex(1) {
                next = LogIndex(1);
            }
            let cap = LogIndex(self.log.last_index()).next();
            if next > cap {
                next = cap;
            }
            self.next_index.insert(peer.clone(), next);
            tracing::debug!(node = %self.id, peer = %peer, next = %next, "log conflict, backtracking");
            self.maybe_send_append(&peer)?;
        }
        Ok(())
    }

    /// Advances the commit index as far as quorum allows and applies.
    ///
    /// Only entries from the current term commit by counting replicas;
    /// older entries commit transitively. Under a joint configuration the
    /// count must satisfy both majorities.
    pub(crate) async fn advance_commit(&mut self) -> Result<()> {
        if self.role != Role::Leader {
            return Ok(());
        }
        loop {
            let mut new_commit = None;
            let mut n = self.log.last_index();
            while n > self.commit_index.as_u64() {
                let Some(t) = self.log.term_of(n)? else { break };
                if t < self.term.as_u64() {
                    break;
                }
                let mut acked = vec![self.id.clone()];
                for (peer, matched) in &self.match_index {
                    if matched.as_u64() >= n {
                        acked.push(peer.clone());
                    }
                }
                if self.members.has_quorum(&acked) {
                    new_commit = Some(n);
                    break;
                }
                n -= 1;
            }

            let Some(n) = new_commit else { break };
            self.commit_index = LogIndex(n);
            tracing::debug!(node = %self.id, commit = n, "commit index advanced");
            // Applying can append follow-up entries (configuration
            // transitions) that may commit immediately on small clusters,
            // so loop until nothing more moves.
            self.apply_committed().await?;
        }
        Ok(())
    }

    /// Replication driver: on each tick the leader re-sends to idle peers
    /// (a heartbeat when they are caught up) and runs the session sweep.
    pub(crate) async fn handle_heartbeat_tick(&mut self) -> Result<()> {
        if self.role != Role::Leader {
            return Ok(());
        }
        self.replicate_to_all()?;
        self.sweep_sessions().await
    }

    /// Proposes eviction entries for sessions whose owners went silent.
    async fn sweep_sessions(&mut self) -> Result<()> {
        self.ticks_since_gc += 1;
        if self.ticks_since_gc < self.config.session_gc_ticks {
            return Ok(());
        }
        self.ticks_since_gc = 0;

        let now = Instant::now();
        let ttl = self.config.session_ttl;
        let expired: Vec<ClientId> = self
            .sessions
            .clients()
            .filter(|client| {
                self.contact
                    .get(client)
                    .map_or(true, |seen| now.duration_since(*seen) > ttl)
            })
            .collect();
        if expired.is_empty() {
            return Ok(());
        }

        for client in expired {
            tracing::info!(node = %self.id, %client, "session expired, proposing eviction");
            self.append_local(LogPayload::EvictSession { client }).await?;
            self.contact.remove(&client);
        }
        self.replicate_to_all()?;
        self.advance_commit().await
    }

    /// Follower-side AppendEntries handler.
    pub(crate) async fn handle_append_request(
        &mut self,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        if request.term > self.term {
            self.step_down(request.term, Some(request.leader_id.clone()))
                .await?;
        }
        if request.term < self.term {
            return Ok(AppendEntriesResponse {
                term: self.term,
                success: false,
                conflict_index: None,
                last_log_index: LogIndex(self.log.last_index()),
            });
        }

        // Valid traffic from the current leader.
        self.leader_hint = Some(request.leader_id.clone());
        self.timer.reset();
        if self.role != Role::Follower {
            self.step_down(request.term, Some(request.leader_id.clone()))
                .await?;
        }

        // Consistency check at prev. Anything at or below the log's
        // compaction boundary is covered by a snapshot, hence committed,
        // hence guaranteed to match.
        let prev = request.prev_log_index.as_u64();
        let prev_ok = if prev == 0 {
            true
        } else {
            match self.log.term_of(prev) {
                Ok(Some(t)) => t == request.prev_log_term.as_u64(),
                Ok(None) => false,
                Err(StoreError::Compacted { .. }) => true,
                Err(e) => return Err(e.into()),
            }
        };

        if !prev_ok {
            let conflict_index = self.conflict_hint(prev)?;
            return Ok(AppendEntriesResponse {
                term: self.term,
                success: false,
                conflict_index: Some(conflict_index),
                last_log_index: LogIndex(self.log.last_index()),
            });
        }

        self.store_entries(&request.entries).await?;

        // Commit can only cover what this request vouched for: the log may
        // extend past it with entries this leader has not confirmed.
        let last_new = prev + request.entries.len() as u64;
        if request.leader_commit.as_u64() > self.commit_index.as_u64() {
            self.commit_index = LogIndex(request.leader_commit.as_u64().min(last_new));
            self.apply_committed().await?;
        }

        Ok(AppendEntriesResponse {
            term: self.term,
            success: true,
            conflict_index: None,
            last_log_index: LogIndex(self.log.last_index()),
        })
    }

    /// Computes the backtracking hint after a failed consistency check:
    /// the lowest index the leader should send from.
    fn conflict_hint(&self, prev: u64) -> Result<LogIndex> {
        let last = self.log.last_index();
        if prev > last {
            // Log too short; everything from our end onward is needed.
            return Ok(LogIndex(last + 1));
        }
        // Term mismatch at prev: skip our entire run of the conflicting
        // term so the leader rewinds past it in one round trip.
        let bad_term = match self.log.term_of(prev)? {
            Some(t) => t,
            None => return Ok(LogIndex(last + 1)),
        };
        let mut first = prev;
        let floor = self.log.first_index();
        while first > floor {
            match self.log.term_of(first - 1) {
                Ok(Some(t)) if t == bad_term => first -= 1,
                _ => break,
            }
        }
        Ok(LogIndex(first))
    }

    /// Reconciles the request's entries with the local log: skips entries
    /// already present with a matching term, truncates at the first genuine
    /// conflict, appends the remainder.
    async fn store_entries(&mut self, entries: &[LogEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }

        let boundary = self.log.first_index() - 1;
        let mut start = 0;
        let mut truncated = false;

        while start < entries.len() {
            let entry = &entries[start];
            let index = entry.index.as_u64();

            // Covered by our snapshot: committed, identical by definition.
            if index <= boundary {
                start += 1;
                continue;
            }

            match self.log.term_of(index)? {
                Some(t) if t == entry.term.as_u64() => {
                    start += 1;
                }
                Some(_) => {
                    if index <= self.commit_index.as_u64() {
                        return Err(RaftError::Internal {
                            reason: format!(
                                "leader disagrees with committed entry {}",
                                entry.index
                            ),
                        });
                    }
                    tracing::warn!(
                        node = %self.id,
                        from = %entry.index,
                        last = self.log.last_index(),
                        "truncating conflicting log suffix"
                    );
                    self.log.truncate_suffix(index).await?;
                    truncated = true;
                    break;
                }
                None => break,
            }
        }

        if truncated {
            // The dropped suffix may have carried a membership entry.
            self.rebuild_members_from_log()?;
        }

        if start < entries.len() {
            let mut batch = Vec::with_capacity(entries.len() - start);
            for entry in &entries[start..] {
                batch.push(to_stored(entry)?);
            }
            self.log.append(&batch).await?;

            for entry in &entries[start..] {
                if let LogPayload::Membership(config) = &entry.payload {
                    self.install_member_config(config.clone(), entry.index);
                }
            }
        }
        Ok(())
    }
}
