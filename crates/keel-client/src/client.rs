//! The retrying client.
//!
//! A [`Client`] owns one session: a random identity plus a sequence
//! counter that stamps every command. Commands retried across leader
//! changes keep their sequence number, which is what lets the cluster
//! deduplicate them. The client chases redirects without delay and backs
//! off exponentially (with jitter) on anything that looks like a down or
//! electing cluster.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use rand::Rng;

use keel_raft::{ClientId, NodeId};

use crate::error::{ClientError, Result};
use crate::transport::{ClientRequest, ClientResponse, ClientTransport};

/// Retry tuning.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// First pause after a failed attempt.
    pub initial_backoff: Duration,
    /// Backoff doubles up to this cap.
    pub max_backoff: Duration,
    /// Per-attempt timeout.
    pub request_timeout: Duration,
    /// Total budget for one operation across all retries.
    pub submit_deadline: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(1),
            request_timeout: Duration::from_secs(2),
            submit_deadline: Duration::from_secs(10),
        }
    }
}

/// One client session against the cluster.
pub struct Client {
    id: ClientId,
    sequence: u64,
    members: Vec<NodeId>,
    leader_hint: Option<NodeId>,
    next_probe: usize,
    transport: Arc<dyn ClientTransport>,
    config: ClientConfig,
}

impl Client {
    /// A fresh session with a random identity.
    pub fn new(members: Vec<NodeId>, transport: Arc<dyn ClientTransport>) -> Self {
        Self::with_config(members, transport, ClientConfig::default())
    }

    pub fn with_config(
        members: Vec<NodeId>,
        transport: Arc<dyn ClientTransport>,
        config: ClientConfig,
    ) -> Self {
        Self {
            id: ClientId(rand::random()),
            sequence: 0,
            members,
            leader_hint: None,
            next_probe: 0,
            transport,
            config,
        }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Runs one command through the replicated machine, retrying until it
    /// commits or the deadline passes. At most one execution: a command
    /// that committed on an earlier attempt is answered from the session
    /// cache, not re-applied.
    pub async fn submit(&mut self, data: Bytes) -> Result<Bytes> {
        self.sequence += 1;
        let request = ClientRequest::Submit {
            client: self.id,
            sequence: self.sequence,
            data,
        };
        match self.run(request).await? {
            ClientResponse::Committed { response } => Ok(response),
            other => Err(ClientError::Transport {
                reason: format!("unexpected response to submit: {:?}", other),
            }),
        }
    }

    /// Refreshes the session's liveness window. Call this during idle
    /// periods shorter than the cluster's session TTL.
    pub async fn keep_alive(&mut self) -> Result<()> {
        let request = ClientRequest::KeepAlive { client: self.id };
        self.run(request).await?;
        Ok(())
    }

    /// Retires the session. Best effort: on failure, the session simply
    /// ages out on the cluster side.
    pub async fn close(mut self) -> Result<()> {
        let request = ClientRequest::Close { client: self.id };
        self.run(request).await?;
        Ok(())
    }

    async fn run(&mut self, request: ClientRequest) -> Result<ClientResponse> {
        if self.members.is_empty() {
            return Err(ClientError::Transport {
                reason: "no cluster members configured".to_string(),
            });
        }
        let started = Instant::now();
        let mut backoff = self.config.initial_backoff;

        loop {
            if started.elapsed() >= self.config.submit_deadline {
                return Err(ClientError::Timeout {
                    elapsed_ms: started.elapsed().as_millis() as u64,
                });
            }

            let target = self.pick_target();
            let attempt = tokio::time::timeout(
                self.config.request_timeout,
                self.transport.request(&target, request.clone()),
            )
            .await;

            let failure = match attempt {
                Ok(Ok(ClientResponse::Redirect { hint })) => match hint {
                    // Follow a usable hint immediately.
                    Some(leader) if leader != target => {
                        tracing::debug!(from = %target, to = %leader, "redirected");
                        self.leader_hint = Some(leader);
                        continue;
                    }
                    // No leader known (likely an election): back off.
                    _ => {
                        self.leader_hint = None;
                        self.rotate();
                        "redirected without a leader".to_string()
                    }
                },
                Ok(Ok(ClientResponse::Failed { reason })) => {
                    self.leader_hint = None;
                    self.rotate();
                    reason
                }
                Ok(Ok(response)) => {
                    self.leader_hint = Some(target);
                    return Ok(response);
                }
                Ok(Err(e)) => {
                    self.leader_hint = None;
                    self.rotate();
                    e.to_string()
                }
                Err(_) => {
                    self.leader_hint = None;
                    self.rotate();
                    "attempt timed out".to_string()
                }
            };

            tracing::debug!(node = %target, error = %failure, backoff_ms = backoff.as_millis() as u64, "attempt failed");
            tokio::time::sleep(jittered(backoff)).await;
            backoff = (backoff * 2).min(self.config.max_backoff);
        }
    }

    fn pick_target(&self) -> NodeId {
        match &self.leader_hint {
            Some(hint) => hint.clone(),
            None => self.members[self.next_probe % self.members.len()].clone(),
        }
    }

    fn rotate(&mut self) {
        self.next_probe = (self.next_probe + 1) % self.members.len();
    }
}

/// 50-100% of the nominal backoff, so synchronized clients fan out.
fn jittered(backoff: Duration) -> Duration {
    backoff.mul_f64(0.5 + rand::thread_rng().gen::<f64>() * 0.5)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    fn test_config() -> ClientConfig {
        ClientConfig {
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            request_timeout: Duration::from_millis(100),
            submit_deadline: Duration::from_millis(300),
        }
    }

    /// Plays back a fixed list of responses and records every attempt.
    struct ScriptedTransport {
        script: Mutex<VecDeque<Result<ClientResponse>>>,
        seen: Mutex<Vec<(NodeId, ClientRequest)>>,
    }

    impl ScriptedTransport {
        fn new(script: Vec<Result<ClientResponse>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                seen: Mutex::new(Vec::new()),
            })
        }

        fn targets(&self) -> Vec<String> {
            self.seen.lock().iter().map(|(n, _)| n.0.clone()).collect()
        }

        fn sequences(&self) -> Vec<u64> {
            self.seen
                .lock()
                .iter()
                .filter_map(|(_, r)| match r {
                    ClientRequest::Submit { sequence, .. } => Some(*sequence),
                    _ => None,
                })
                .collect()
        }
    }

    #[async_trait]
    impl ClientTransport for ScriptedTransport {
        async fn request(
            &self,
            target: &NodeId,
            request: ClientRequest,
        ) -> Result<ClientResponse> {
            self.seen.lock().push((target.clone(), request));
            self.script
                .lock()
                .pop_front()
                .unwrap_or(Err(ClientError::Transport {
                    reason: "script exhausted".to_string(),
                }))
        }
    }

    fn members() -> Vec<NodeId> {
        vec![NodeId::new("n1"), NodeId::new("n2"), NodeId::new("n3")]
    }

    fn committed(data: &str) -> Result<ClientResponse> {
        Ok(ClientResponse::Committed {
            response: Bytes::from(data.to_string()),
        })
    }

    #[tokio::test]
    async fn test_follows_redirect_to_leader() {
        let transport = ScriptedTransport::new(vec![
            Ok(ClientResponse::Redirect {
                hint: Some(NodeId::new("n2")),
            }),
            committed("done"),
        ]);
        let mut client = Client::with_config(members(), transport.clone(), test_config());

        let out = client.submit(Bytes::from_static(b"cmd")).await.unwrap();
        assert_eq!(out, Bytes::from_static(b"done"));
        assert_eq!(transport.targets(), vec!["n1", "n2"]);
        // The hint sticks for the next operation.
        assert_eq!(client.leader_hint, Some(NodeId::new("n2")));
    }

    #[tokio::test]
    async fn test_rotates_after_transport_failure() {
        let transport = ScriptedTransport::new(vec![
            Err(ClientError::Transport {
                reason: "connection refused".to_string(),
            }),
            committed("done"),
        ]);
        let mut client = Client::with_config(members(), transport.clone(), test_config());

        client.submit(Bytes::from_static(b"cmd")).await.unwrap();
        assert_eq!(transport.targets(), vec!["n1", "n2"]);
    }

    #[tokio::test]
    async fn test_retries_keep_the_same_sequence() {
        let transport = ScriptedTransport::new(vec![
            Err(ClientError::Transport {
                reason: "timeout".to_string(),
            }),
            Ok(ClientResponse::Redirect {
                hint: Some(NodeId::new("n3")),
            }),
            committed("done"),
        ]);
        let mut client = Client::with_config(members(), transport.clone(), test_config());

        client.submit(Bytes::from_static(b"cmd")).await.unwrap();
        // Three attempts, one sequence number: the cluster can dedup.
        assert_eq!(transport.sequences(), vec![1, 1, 1]);

        // A new command gets the next sequence.
        let transport2 = ScriptedTransport::new(vec![committed("again")]);
        client.transport = transport2.clone();
        client.submit(Bytes::from_static(b"cmd2")).await.unwrap();
        assert_eq!(transport2.sequences(), vec![2]);
    }

    #[tokio::test]
    async fn test_deadline_expires_into_timeout() {
        let transport = ScriptedTransport::new(vec![]);
        let mut client = Client::with_config(members(), transport, test_config());

        let result = client.submit(Bytes::from_static(b"cmd")).await;
        assert!(matches!(result, Err(ClientError::Timeout { .. })));
    }

    #[tokio::test]
    async fn test_hintless_redirect_probes_other_nodes() {
        let transport = ScriptedTransport::new(vec![
            Ok(ClientResponse::Redirect { hint: None }),
            Ok(ClientResponse::Redirect { hint: None }),
            committed("done"),
        ]);
        let mut client = Client::with_config(members(), transport.clone(), test_config());

        client.submit(Bytes::from_static(b"cmd")).await.unwrap();
        assert_eq!(transport.targets(), vec!["n1", "n2", "n3"]);
    }

    #[tokio::test]
    async fn test_keep_alive_and_close() {
        let transport = ScriptedTransport::new(vec![Ok(ClientResponse::Ok)]);
        let mut client = Client::with_config(members(), transport.clone(), test_config());
        client.keep_alive().await.unwrap();

        let transport2 = ScriptedTransport::new(vec![Ok(ClientResponse::Ok)]);
        client.transport = transport2.clone();
        client.close().await.unwrap();
        let seen = transport2.seen.lock();
        assert!(matches!(seen[0].1, ClientRequest::Close { .. }));
    }
}
