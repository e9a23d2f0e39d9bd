//! Joint-consensus membership changes.
//!
//! A change moves through two replicated entries: first a joint
//! configuration carrying both the old and new sets, then the new set
//! alone once the joint entry has committed under both majorities. Each
//! configuration takes effect the moment it is appended, so agreement
//! never depends on a set that only one side knows about. One change runs
//! at a time.

use tokio::sync::oneshot;

use crate::core::{PendingConfig, RaftCore};
use crate::error::{RaftError, Result};
use crate::types::*;

impl RaftCore {
    pub(crate) async fn handle_add_member(
        &mut self,
        node: NodeId,
        reply: oneshot::Sender<Result<()>>,
    ) -> Result<()> {
        if let Err(e) = self.validate_change(&node, true) {
            let _ = reply.send(Err(e));
            return Ok(());
        }
        self.begin_change(node, true, reply).await
    }

    pub(crate) async fn handle_remove_member(
        &mut self,
        node: NodeId,
        reply: oneshot::Sender<Result<()>>,
    ) -> Result<()> {
        if let Err(e) = self.validate_change(&node, false) {
            let _ = reply.send(Err(e));
            return Ok(());
        }
        self.begin_change(node, false, reply).await
    }

    fn validate_change(&self, node: &NodeId, adding: bool) -> Result<()> {
        if self.role != Role::Leader {
            return Err(self.not_leader());
        }
        if self.members.is_joint() || self.pending_config.is_some() {
            return Err(RaftError::MembershipRejected {
                reason: "another configuration change is in progress".to_string(),
            });
        }
        let current = self.members.all_nodes();
        if adding && current.contains(node) {
            return Err(RaftError::MembershipRejected {
                reason: format!("{} is already a member", node),
            });
        }
        if !adding {
            if !current.contains(node) {
                return Err(RaftError::MembershipRejected {
                    reason: format!("{} is not a member", node),
                });
            }
            if current.len() == 1 {
                return Err(RaftError::MembershipRejected {
                    reason: "cannot remove the last member".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Appends the joint configuration and starts replicating it. The
    /// reply resolves only when the final configuration commits.
    async fn begin_change(
        &mut self,
        node: NodeId,
        adding: bool,
        reply: oneshot::Sender<Result<()>>,
    ) -> Result<()> {
        let old = self.members.all_nodes();
        let mut new = old.clone();
        if adding {
            new.push(node.clone());
        } else {
            new.retain(|n| n != &node);
        }
        tracing::info!(
            node = %self.id,
            target = %node,
            adding,
            "starting configuration change"
        );

        self.append_local(LogPayload::Membership(MemberConfig::Joint { old, new }))
            .await?;
        self.pending_config = Some(PendingConfig {
            reply,
            final_index: None,
        });
        self.replicate_to_all()?;
        self.advance_commit().await
    }

    /// Runs when a membership entry is applied. On the leader a joint
    /// entry committing triggers the final configuration; the final entry
    /// committing resolves the waiting caller, and a leader that is no
    /// longer a member steps down.
    pub(crate) async fn on_membership_applied(
        &mut self,
        config: MemberConfig,
        index: LogIndex,
    ) -> Result<()> {
        match config {
            MemberConfig::Joint { new, .. } => {
                if self.role == Role::Leader {
                    let final_index = self
                        .append_local(LogPayload::Membership(MemberConfig::Single(new)))
                        .await?;
                    if let Some(pending) = self.pending_config.as_mut() {
                        pending.final_index = Some(final_index);
                    }
                    self.replicate_to_all()?;
                }
            }
            MemberConfig::Single(nodes) => {
                if let Some(pending) = &self.pending_config {
                    if pending.final_index == Some(index) {
                        if let Some(pending) = self.pending_config.take() {
                            let _ = pending.reply.send(Ok(()));
                        }
                        tracing::info!(
                            node = %self.id,
                            members = ?nodes,
                            "configuration change complete"
                        );
                    }
                }
                // A removed leader serves until the final configuration is
                // committed, then leaves.
                if self.role == Role::Leader && !nodes.contains(&self.id) {
                    tracing::info!(node = %self.id, "removed from configuration, stepping down");
                    self.step_down(self.term, None).await?;
                }
            }
        }
        Ok(())
    }

    /// Completes a configuration change inherited from a dead leader: the
    /// joint entry committed but its final entry was never appended.
    pub(crate) async fn finish_joint_if_needed(&mut self) -> Result<()> {
        if let MemberConfig::Joint { new, .. } = &self.members {
            if self.members_index <= self.applied_index {
                let new = new.clone();
                tracing::info!(node = %self.id, "finishing inherited configuration change");
                self.append_local(LogPayload::Membership(MemberConfig::Single(new)))
                    .await?;
            }
        }
        Ok(())
    }
}
