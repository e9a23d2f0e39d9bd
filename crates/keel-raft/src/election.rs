//! Leader election: timeouts, vote handling, vote counting.
//!
//! A follower whose election timer fires becomes a candidate, increments
//! its term, votes for itself, and asks every configured peer for a vote.
//! Votes are granted at most once per term and only to candidates whose log
//! is at least as up to date, compared by last term then last index. Both
//! term bumps and granted votes hit disk before any response leaves the
//! node, so a restart cannot double-vote.

use std::time::Instant;

use crate::core::{CoreEvent, RaftCore};
use crate::error::Result;
use crate::types::*;

impl RaftCore {
    pub(crate) async fn handle_election_timeout(&mut self) -> Result<()> {
        if self.role == Role::Leader {
            return Ok(());
        }
        // A node outside the configuration (removed, or new and still
        // catching up) must not disturb the cluster with elections.
        if !self.members.contains(&self.id) {
            tracing::debug!(node = %self.id, "election timeout ignored, not a configured member");
            return Ok(());
        }
        self.start_election().await
    }

    pub(crate) async fn start_election(&mut self) -> Result<()> {
        self.term = self.term.next();
        self.voted_for = Some(self.id.clone());
        self.role = Role::Candidate;
        self.leader_hint = None;
        self.votes_received = vec![self.id.clone()];
        self.persist_hard_state().await?;

        tracing::info!(node = %self.id, term = %self.term, "starting election");

        // A single-node configuration wins on its own vote.
        if self.members.has_quorum(&self.votes_received) {
            return self.become_leader().await;
        }

        let request = VoteRequest {
            term: self.term,
            candidate_id: self.id.clone(),
            last_log_index: LogIndex(self.log.last_index()),
            last_log_term: Term(self.log.last_term()),
        };

        for peer in self.members.all_nodes() {
            if peer == self.id {
                continue;
            }
            let transport = self.transport.clone();
            let events = self.events_tx.clone();
            let term = self.term;
            let request = request.clone();
            tokio::spawn(async move {
                match transport.request_vote(&peer, request).await {
                    Ok(response) => {
                        let _ = events
                            .send(CoreEvent::VoteReply {
                                term,
                                from: peer,
                                response,
                            })
                            .await;
                    }
                    Err(e) => {
                        tracing::debug!(peer = %peer, error = %e, "vote request failed");
                    }
                }
            });
        }
        Ok(())
    }

    /// Grants or denies a vote. The grant is durable before the response
    /// exists.
    pub(crate) async fn handle_vote_request(&mut self, request: VoteRequest) -> Result<VoteResponse> {
        if request.term > self.term {
            self.step_down(request.term, None).await?;
        }

        let mut vote_granted = false;
        if request.term == self.term {
            let voted_for_other = self
                .voted_for
                .as_ref()
                .map_or(false, |id| id != &request.candidate_id);

            if !voted_for_other {
                let last_log_term = Term(self.log.last_term());
                let last_log_index = LogIndex(self.log.last_index());
                let log_ok = request.last_log_term > last_log_term
                    || (request.last_log_term == last_log_term
                        && request.last_log_index >= last_log_index);

                if log_ok {
                    vote_granted = true;
                    if self.voted_for.is_none() {
                        self.voted_for = Some(request.candidate_id.clone());
                        self.persist_hard_state().await?;
                    }
                    self.timer.reset();
                }
            }
        }

        tracing::debug!(
            node = %self.id,
            candidate = %request.candidate_id,
            term = %request.term,
            granted = vote_granted,
            "vote request handled"
        );

        Ok(VoteResponse {
            term: self.term,
            vote_granted,
        })
    }

    pub(crate) async fn handle_vote_reply(
        &mut self,
        term: Term,
        from: NodeId,
        response: VoteResponse,
    ) -> Result<()> {
        if response.term > self.term {
            return self.step_down(response.term, None).await;
        }
        // Only count votes for the election we are still running.
        if self.role != Role::Candidate || term != self.term {
            return Ok(());
        }
        if response.vote_granted && !self.votes_received.contains(&from) {
            self.votes_received.push(from);
            if self.members.has_quorum(&self.votes_received) {
                self.become_leader().await?;
            }
        }
        Ok(())
    }

    pub(crate) async fn become_leader(&mut self) -> Result<()> {
        tracing::info!(node = %self.id, term = %self.term, "won election");
        self.role = Role::Leader;
        self.leader_hint = Some(self.id.clone());
        self.votes_received.clear();

        let next = LogIndex(self.log.last_index()).next();
        self.next_index.clear();
        self.match_index.clear();
        self.inflight_append.clear();
        self.inflight_snapshot.clear();
        for node in self.members.all_nodes() {
            if node != self.id {
                self.next_index.insert(node.clone(), next);
                self.match_index.insert(node, LogIndex::ZERO);
            }
        }

        // Every live session gets a fresh liveness window; the old leader's
        // contact times died with it.
        self.ticks_since_gc = 0;
        let now = Instant::now();
        for client in self.sessions.clients() {
            self.contact.insert(client, now);
        }

        // Barrier entry: commit advancement only counts current-term
        // entries, so the term needs one of its own to commit.
        self.append_local(LogPayload::Noop).await?;

        self.finish_joint_if_needed().await?;

        self.replicate_to_all()?;
        self.advance_commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::testing::recovered_core;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_grants_vote_and_adopts_term() {
        let temp = TempDir::new().unwrap();
        let (mut core, _rx) = recovered_core(temp.path(), "n1", &["n1", "n2", "n3"]).await;

        let response = core
            .handle_vote_request(VoteRequest {
                term: Term(5),
                candidate_id: NodeId::new("n2"),
                last_log_index: LogIndex::ZERO,
                last_log_term: Term::ZERO,
            })
            .await
            .unwrap();

        assert!(response.vote_granted);
        assert_eq!(response.term, Term(5));
        assert_eq!(core.term, Term(5));
        assert_eq!(core.voted_for, Some(NodeId::new("n2")));
    }

    #[tokio::test]
    async fn test_rejects_stale_term() {
        let temp = TempDir::new().unwrap();
        let (mut core, _rx) = recovered_core(temp.path(), "n1", &["n1", "n2", "n3"]).await;
        core.term = Term(10);

        let response = core
            .handle_vote_request(VoteRequest {
                term: Term(5),
                candidate_id: NodeId::new("n2"),
                last_log_index: LogIndex(100),
                last_log_term: Term(5),
            })
            .await
            .unwrap();

        assert!(!response.vote_granted);
        assert_eq!(response.term, Term(10));
    }

    #[tokio::test]
    async fn test_rejects_candidate_with_worse_log() {
        let temp = TempDir::new().unwrap();
        let (mut core, _rx) = recovered_core(temp.path(), "n1", &["n1", "n2", "n3"]).await;
        core.term = Term(3);
        core.append_local(LogPayload::Noop).await.unwrap();
        core.append_local(LogPayload::Noop).await.unwrap();

        // Same term, shorter log.
        let response = core
            .handle_vote_request(VoteRequest {
                term: Term(4),
                candidate_id: NodeId::new("n2"),
                last_log_index: LogIndex(1),
                last_log_term: Term(3),
            })
            .await
            .unwrap();
        assert!(!response.vote_granted);

        // Older last term loses even with a longer log.
        let response = core
            .handle_vote_request(VoteRequest {
                term: Term(5),
                candidate_id: NodeId::new("n2"),
                last_log_index: LogIndex(50),
                last_log_term: Term(2),
            })
            .await
            .unwrap();
        assert!(!response.vote_granted);

        // Better last term wins regardless of length.
        let response = core
            .handle_vote_request(VoteRequest {
                term: Term(6),
                candidate_id: NodeId::new("n2"),
                last_log_index: LogIndex(1),
                last_log_term: Term(4),
            })
            .await
            .unwrap();
        assert!(response.vote_granted);
    }

    #[tokio::test]
    async fn test_votes_once_per_term() {
        let temp = TempDir::new().unwrap();
        let (mut core, _rx) = recovered_core(temp.path(), "n1", &["n1", "n2", "n3"]).await;

        let first = core
            .handle_vote_request(VoteRequest {
                term: Term(2),
                candidate_id: NodeId::new("n2"),
                last_log_index: LogIndex::ZERO,
                last_log_term: Term::ZERO,
            })
            .await
            .unwrap();
        assert!(first.vote_granted);

        // A different candidate in the same term is refused.
        let second = core
            .handle_vote_request(VoteRequest {
                term: Term(2),
                candidate_id: NodeId::new("n3"),
                last_log_index: LogIndex(10),
                last_log_term: Term(1),
            })
            .await
            .unwrap();
        assert!(!second.vote_granted);

        // The original candidate may ask again (lost response).
        let again = core
            .handle_vote_request(VoteRequest {
                term: Term(2),
                candidate_id: NodeId::new("n2"),
                last_log_index: LogIndex::ZERO,
                last_log_term: Term::ZERO,
            })
            .await
            .unwrap();
        assert!(again.vote_granted);
    }

    #[tokio::test]
    async fn test_vote_survives_restart() {
        let temp = TempDir::new().unwrap();
        {
            let (mut core, _rx) = recovered_core(temp.path(), "n1", &["n1", "n2", "n3"]).await;
            let granted = core
                .handle_vote_request(VoteRequest {
                    term: Term(7),
                    candidate_id: NodeId::new("n2"),
                    last_log_index: LogIndex::ZERO,
                    last_log_term: Term::ZERO,
                })
                .await
                .unwrap();
            assert!(granted.vote_granted);
        }

        let (mut core, _rx) = recovered_core(temp.path(), "n1", &["n1", "n2", "n3"]).await;
        assert_eq!(core.term, Term(7));
        assert_eq!(core.voted_for, Some(NodeId::new("n2")));

        // Still refuses a competing candidate for term 7 after restart.
        let response = core
            .handle_vote_request(VoteRequest {
                term: Term(7),
                candidate_id: NodeId::new("n3"),
                last_log_index: LogIndex(10),
                last_log_term: Term(6),
            })
            .await
            .unwrap();
        assert!(!response.vote_granted);
    }

    #[tokio::test]
    async fn test_non_member_ignores_timeout() {
        let temp = TempDir::new().unwrap();
        let (mut core, _rx) = recovered_core(temp.path(), "n9", &["n1", "n2", "n3"]).await;

        core.handle_election_timeout().await.unwrap();

        assert_eq!(core.role, Role::Follower);
        assert_eq!(core.term, Term::ZERO);
    }

    #[tokio::test]
    async fn test_single_node_elects_itself_and_commits() {
        let temp = TempDir::new().unwrap();
        let (mut core, _rx) = recovered_core(temp.path(), "n1", &["n1"]).await;

        core.handle_election_timeout().await.unwrap();

        assert_eq!(core.role, Role::Leader);
        assert_eq!(core.term, Term(1));
        // The noop barrier committed without any peer traffic.
        assert_eq!(core.log.last_index(), 1);
        assert_eq!(core.commit_index, LogIndex(1));
        assert_eq!(core.applied_index, LogIndex(1));
    }

    #[tokio::test]
    async fn test_vote_reply_counting() {
        let temp = TempDir::new().unwrap();
        let (mut core, _rx) = recovered_core(temp.path(), "n1", &["n1", "n2", "n3"]).await;

        core.start_election().await.unwrap();
        assert_eq!(core.role, Role::Candidate);
        assert_eq!(core.term, Term(1));

        // A denial changes nothing.
        core.handle_vote_reply(
            Term(1),
            NodeId::new("n2"),
            VoteResponse {
                term: Term(1),
                vote_granted: false,
            },
        )
        .await
        .unwrap();
        assert_eq!(core.role, Role::Candidate);

        // One grant reaches quorum (2 of 3 with self).
        core.handle_vote_reply(
            Term(1),
            NodeId::new("n3"),
            VoteResponse {
                term: Term(1),
                vote_granted: true,
            },
        )
        .await
        .unwrap();
        assert_eq!(core.role, Role::Leader);
    }

    #[tokio::test]
    async fn test_higher_term_reply_steps_down() {
        let temp = TempDir::new().unwrap();
        let (mut core, _rx) = recovered_core(temp.path(), "n1", &["n1", "n2", "n3"]).await;

        core.start_election().await.unwrap();
        core.handle_vote_reply(
            Term(1),
            NodeId::new("n2"),
            VoteResponse {
                term: Term(9),
                vote_granted: false,
            },
        )
        .await
        .unwrap();

        assert_eq!(core.role, Role::Follower);
        assert_eq!(core.term, Term(9));
    }

    #[tokio::test]
    async fn test_stale_vote_reply_ignored() {
        let temp = TempDir::new().unwrap();
        let (mut core, _rx) = recovered_core(temp.path(), "n1", &["n1", "n2", "n3"]).await;

        core.start_election().await.unwrap();
        core.start_election().await.unwrap(); // term 2 now

        // A grant from the term-1 election must not count toward term 2.
        core.handle_vote_reply(
            Term(1),
            NodeId::new("n2"),
            VoteResponse {
                term: Term(1),
                vote_granted: true,
            },
        )
        .await
        .unwrap();
        assert_eq!(core.role, Role::Candidate);
        assert_eq!(core.votes_received, vec![NodeId::new("n1")]);
    }
}
