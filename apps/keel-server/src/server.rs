//! Server composition.
//!
//! Wires the consensus node to its three listeners: peer TCP, client
//! TCP, and HTTP admin.

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use keel_raft::{NodeId, NodeOptions, RaftNode};

use crate::admin::AdminServer;
use crate::config::ServerConfig;
use crate::machine::RegisterMachine;
use crate::net::{self, TcpPeerTransport};

/// A full keel node: consensus core plus all network surfaces.
pub struct Server {
    config: ServerConfig,
    node: Option<Arc<RaftNode>>,
    admin: Option<AdminServer>,
    peer_task: Option<JoinHandle<()>>,
    client_task: Option<JoinHandle<()>>,
    peer_addr: Option<SocketAddr>,
    client_addr: Option<SocketAddr>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            node: None,
            admin: None,
            peer_task: None,
            client_task: None,
            peer_addr: None,
            client_addr: None,
        }
    }

    /// Recover durable state, start the consensus node, and bring up the
    /// listeners.
    pub async fn start(&mut self) -> Result<(), ServerError> {
        tracing::info!(node = %self.config.node_id, "starting keel node");

        let transport = Arc::new(TcpPeerTransport::new(self.config.peer_addresses()));
        let node = RaftNode::start(NodeOptions {
            id: NodeId::new(self.config.node_id.clone()),
            config: self.config.raft.to_raft_config(),
            data_dir: self.config.data_dir.clone(),
            initial_members: self.config.initial_members(),
            transport,
            machine: Box::new(RegisterMachine::default()),
        })
        .await
        .map_err(|e| ServerError::Startup(format!("Failed to start consensus node: {}", e)))?;

        let peer_listener = TcpListener::bind(&self.config.peer_addr)
            .await
            .map_err(|e| {
                ServerError::Startup(format!("Failed to bind {}: {}", self.config.peer_addr, e))
            })?;
        let peer_addr = peer_listener
            .local_addr()
            .map_err(|e| ServerError::Startup(format!("Failed to read local addr: {}", e)))?;
        self.peer_task = Some(tokio::spawn(net::serve_peer(
            peer_listener,
            node.peer_sender(),
        )));
        self.peer_addr = Some(peer_addr);
        tracing::info!(addr = %peer_addr, "peer listener ready");

        let client_listener = TcpListener::bind(&self.config.client_addr)
            .await
            .map_err(|e| {
                ServerError::Startup(format!(
                    "Failed to bind {}: {}",
                    self.config.client_addr, e
                ))
            })?;
        let client_addr = client_listener
            .local_addr()
            .map_err(|e| ServerError::Startup(format!("Failed to read local addr: {}", e)))?;
        self.client_task = Some(tokio::spawn(net::serve_client(client_listener, node.clone())));
        self.client_addr = Some(client_addr);
        tracing::info!(addr = %client_addr, "client listener ready");

        let admin_addr: SocketAddr = self.config.admin_addr.parse().map_err(|e| {
            ServerError::Startup(format!("Invalid admin_addr {}: {}", self.config.admin_addr, e))
        })?;
        let mut admin = AdminServer::new(admin_addr, node.clone());
        admin
            .start()
            .await
            .map_err(|e| ServerError::Startup(e.to_string()))?;
        self.admin = Some(admin);

        self.node = Some(node);
        Ok(())
    }

    /// The running consensus node, once started.
    pub fn node(&self) -> Option<&Arc<RaftNode>> {
        self.node.as_ref()
    }

    /// Bound peer listener address, once started.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Bound client listener address, once started.
    pub fn client_addr(&self) -> Option<SocketAddr> {
        self.client_addr
    }

    /// Bound admin listener address, once started.
    pub fn admin_addr(&self) -> Option<SocketAddr> {
        self.admin.as_ref().map(|a| a.local_addr())
    }

    /// Stop the listeners, then the consensus node.
    pub async fn shutdown(mut self) -> Result<(), ServerError> {
        tracing::info!("shutting down keel node");

        if let Some(task) = self.client_task.take() {
            task.abort();
        }
        if let Some(task) = self.peer_task.take() {
            task.abort();
        }
        if let Some(admin) = self.admin.take() {
            admin
                .shutdown()
                .await
                .map_err(|e| ServerError::Shutdown(e.to_string()))?;
        }
        if let Some(node) = self.node.take() {
            node.stop();
        }

        tracing::info!("shutdown complete");
        Ok(())
    }
}

/// Server lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Startup error: {0}")]
    Startup(String),

    #[error("Shutdown error: {0}")]
    Shutdown(String),
}
