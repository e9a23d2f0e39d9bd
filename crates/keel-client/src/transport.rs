//! Client-to-node transport: the wire protocol and the transport seam.
//!
//! [`ClientRequest`]/[`ClientResponse`] are the protocol between a client
//! and any node; server frontends decode them off their listener and feed
//! the node handle. [`TcpClientTransport`] speaks that protocol in wire
//! frames; [`InProcessTransport`] short-circuits it for embedded clusters
//! and tests.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;

use keel_raft::wire::{read_frame, write_frame};
use keel_raft::{ClientId, NodeId, RaftError, RaftNode};

use crate::error::{ClientError, Result};

/// One client operation addressed to one node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ClientRequest {
    /// Run a command through the replicated machine.
    Submit {
        client: ClientId,
        sequence: u64,
        data: Bytes,
    },
    /// Refresh the session's liveness window.
    KeepAlive { client: ClientId },
    /// Retire the session.
    Close { client: ClientId },
}

/// The node's answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ClientResponse {
    /// The command committed and applied; this is the machine's output.
    Committed { response: Bytes },
    /// This node is not the leader. `hint` names the leader if known.
    Redirect { hint: Option<NodeId> },
    /// Acknowledgement for operations without output.
    Ok,
    /// The node could not serve the request and a different node might.
    Failed { reason: String },
}

/// Carries one request to one named node. Implementations do not retry;
/// the client owns redirect and backoff policy.
#[async_trait]
pub trait ClientTransport: Send + Sync {
    async fn request(&self, target: &NodeId, request: ClientRequest) -> Result<ClientResponse>;
}

/// Maps a node-side error into the wire response. Shared with server
/// frontends so every surface redirects the same way.
pub fn response_from_error(error: RaftError) -> ClientResponse {
    match error {
        RaftError::NotLeader { leader } => ClientResponse::Redirect { hint: leader },
        other => ClientResponse::Failed {
            reason: other.to_string(),
        },
    }
}

/// Transport over in-process node handles.
pub struct InProcessTransport {
    nodes: HashMap<NodeId, Arc<RaftNode>>,
}

impl InProcessTransport {
    pub fn new(nodes: HashMap<NodeId, Arc<RaftNode>>) -> Self {
        Self { nodes }
    }
}

#[async_trait]
impl ClientTransport for InProcessTransport {
    async fn request(&self, target: &NodeId, request: ClientRequest) -> Result<ClientResponse> {
        let node = self.nodes.get(target).ok_or_else(|| ClientError::Transport {
            reason: format!("unknown node {}", target),
        })?;
        let response = match request {
            ClientRequest::Submit {
                client,
                sequence,
                data,
            } => match node.submit(client, sequence, data).await {
                Ok(response) => ClientResponse::Committed { response },
                Err(e) => response_from_error(e),
            },
            ClientRequest::KeepAlive { client } => match node.keep_alive(client).await {
                Ok(()) => ClientResponse::Ok,
                Err(e) => response_from_error(e),
            },
            ClientRequest::Close { client } => match node.close_session(client).await {
                Ok(()) => ClientResponse::Ok,
                Err(e) => response_from_error(e),
            },
        };
        Ok(response)
    }
}

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Transport over pooled TCP connections, one per node.
///
/// Connections carry strictly request/response wire frames. A failed
/// exchange drops the connection and surfaces a transport error; the
/// client decides which node to try next and the following request
/// redials.
pub struct TcpClientTransport {
    addrs: HashMap<NodeId, String>,
    conns: tokio::sync::Mutex<HashMap<NodeId, TcpStream>>,
}

impl TcpClientTransport {
    /// `addrs` maps every node to its client listen address.
    pub fn new(addrs: HashMap<NodeId, String>) -> Self {
        Self {
            addrs,
            conns: tokio::sync::Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl ClientTransport for TcpClientTransport {
    async fn request(&self, target: &NodeId, request: ClientRequest) -> Result<ClientResponse> {
        let addr = self.addrs.get(target).ok_or_else(|| ClientError::Transport {
            reason: format!("unknown node {}", target),
        })?;

        let mut conns = self.conns.lock().await;
        let mut stream = match conns.remove(target) {
            Some(stream) => stream,
            None => {
                let stream =
                    match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
                        Ok(Ok(stream)) => stream,
                        Ok(Err(e)) => {
                            return Err(ClientError::Transport {
                                reason: format!("connect to {}: {}", addr, e),
                            })
                        }
                        Err(_) => {
                            return Err(ClientError::Transport {
                                reason: format!("connect to {}: timed out", addr),
                            })
                        }
                    };
                let _ = stream.set_nodelay(true);
                stream
            }
        };

        match exchange(&mut stream, &request).await {
            Ok(response) => {
                conns.insert(target.clone(), stream);
                Ok(response)
            }
            Err(e) => Err(ClientError::Transport {
                reason: format!("{}: {}", target, e),
            }),
        }
    }
}

async fn exchange(stream: &mut TcpStream, request: &ClientRequest) -> io::Result<ClientResponse> {
    write_frame(stream, request).await?;
    read_frame(stream).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn tcp_transport_roundtrip_and_pooling() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        // Echo server speaking the client protocol.
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            loop {
                let request: ClientRequest = match read_frame(&mut stream).await {
                    Ok(request) => request,
                    Err(_) => return,
                };
                let response = match request {
                    ClientRequest::Submit { data, .. } => {
                        ClientResponse::Committed { response: data }
                    }
                    _ => ClientResponse::Ok,
                };
                write_frame(&mut stream, &response).await.unwrap();
            }
        });

        let target = NodeId::new("n1");
        let transport =
            TcpClientTransport::new(HashMap::from([(target.clone(), addr.to_string())]));

        let response = transport
            .request(
                &target,
                ClientRequest::Submit {
                    client: ClientId(1),
                    sequence: 1,
                    data: Bytes::from_static(b"ping"),
                },
            )
            .await
            .unwrap();
        match response {
            ClientResponse::Committed { response } => assert_eq!(&response[..], b"ping"),
            other => panic!("wrong response: {:?}", other),
        }

        // The connection is pooled: a second request rides the same
        // stream, which the single-accept server can only serve once.
        let response = transport
            .request(&target, ClientRequest::KeepAlive { client: ClientId(1) })
            .await
            .unwrap();
        assert!(matches!(response, ClientResponse::Ok));
    }

    #[tokio::test]
    async fn dead_node_is_a_transport_error() {
        // Reserve a port, then close the listener so the dial is refused.
        let addr = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };

        let target = NodeId::new("n1");
        let transport =
            TcpClientTransport::new(HashMap::from([(target.clone(), addr.to_string())]));

        let err = transport
            .request(&target, ClientRequest::KeepAlive { client: ClientId(9) })
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Transport { .. }));
    }

    #[tokio::test]
    async fn unknown_node_is_a_transport_error() {
        let transport = TcpClientTransport::new(HashMap::new());
        let err = transport
            .request(
                &NodeId::new("ghost"),
                ClientRequest::KeepAlive { client: ClientId(1) },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Transport { .. }));
    }
}
