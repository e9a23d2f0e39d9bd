//! Server configuration.
//!
//! Loads and validates configuration from YAML files or environment
//! variables.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use keel_raft::{FsyncPolicy, NodeId, RaftConfig};

/// Server configuration.
///
/// Example YAML:
/// ```yaml
/// node_id: "n1"
/// data_dir: "/var/lib/keel"
/// peer_addr: "0.0.0.0:7400"
/// client_addr: "0.0.0.0:7401"
/// admin_addr: "0.0.0.0:7402"
/// cluster:
///   peers:
///     - { id: "n1", addr: "10.0.1.10:7400" }
///     - { id: "n2", addr: "10.0.1.11:7400" }
///     - { id: "n3", addr: "10.0.1.12:7400" }
/// raft:
///   heartbeat_interval_ms: 150
///   election_timeout_min_ms: 300
///   election_timeout_max_ms: 600
///   fsync: always
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Unique node identifier. Must appear in `cluster.peers` when a
    /// peer list is configured.
    pub node_id: String,

    /// Data directory for the log, snapshots, and vote state.
    pub data_dir: PathBuf,

    /// Listen address for peer-to-peer consensus traffic.
    #[serde(default = "default_peer_addr")]
    pub peer_addr: String,

    /// Listen address for client sessions.
    #[serde(default = "default_client_addr")]
    pub client_addr: String,

    /// Listen address for the HTTP admin surface.
    #[serde(default = "default_admin_addr")]
    pub admin_addr: String,

    /// Cluster configuration.
    #[serde(default)]
    pub cluster: ClusterConfig,

    /// Consensus tuning.
    #[serde(default)]
    pub raft: RaftTuning,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// All cluster members, this node included. Empty means single-node.
    #[serde(default)]
    pub peers: Vec<PeerEntry>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self { peers: Vec::new() }
    }
}

/// One cluster member and its peer listen address.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerEntry {
    pub id: String,
    pub addr: String,
}

/// Consensus timing and durability knobs, in config-file units.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaftTuning {
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    #[serde(default = "default_election_timeout_min_ms")]
    pub election_timeout_min_ms: u64,

    #[serde(default = "default_election_timeout_max_ms")]
    pub election_timeout_max_ms: u64,

    /// Applied entries between automatic snapshots.
    #[serde(default = "default_snapshot_threshold")]
    pub snapshot_threshold: u64,

    /// Idle time before a client session is evicted.
    #[serde(default = "default_session_ttl_ms")]
    pub session_ttl_ms: u64,

    /// How long a client request may wait for commit and apply.
    #[serde(default = "default_propose_timeout_ms")]
    pub propose_timeout_ms: u64,

    /// Log durability: `always` fsyncs every append, `os` leaves flushing
    /// to the operating system.
    #[serde(default = "default_fsync")]
    pub fsync: FsyncMode,
}

impl Default for RaftTuning {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            election_timeout_min_ms: default_election_timeout_min_ms(),
            election_timeout_max_ms: default_election_timeout_max_ms(),
            snapshot_threshold: default_snapshot_threshold(),
            session_ttl_ms: default_session_ttl_ms(),
            propose_timeout_ms: default_propose_timeout_ms(),
            fsync: default_fsync(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FsyncMode {
    Always,
    Os,
}

impl FsyncMode {
    fn to_policy(self) -> FsyncPolicy {
        match self {
            FsyncMode::Always => FsyncPolicy::Always,
            FsyncMode::Os => FsyncPolicy::Os,
        }
    }
}

impl RaftTuning {
    /// Maps the tuning block onto a full consensus configuration.
    pub fn to_raft_config(&self) -> RaftConfig {
        RaftConfig {
            heartbeat_interval: Duration::from_millis(self.heartbeat_interval_ms),
            election_timeout_min: Duration::from_millis(self.election_timeout_min_ms),
            election_timeout_max: Duration::from_millis(self.election_timeout_max_ms),
            snapshot_threshold: self.snapshot_threshold,
            session_ttl: Duration::from_millis(self.session_ttl_ms),
            propose_timeout: Duration::from_millis(self.propose_timeout_ms),
            log_fsync: self.fsync.to_policy(),
            ..RaftConfig::default()
        }
    }
}

fn default_peer_addr() -> String {
    "0.0.0.0:7400".to_string()
}

fn default_client_addr() -> String {
    "0.0.0.0:7401".to_string()
}

fn default_admin_addr() -> String {
    "0.0.0.0:7402".to_string()
}

fn default_heartbeat_interval_ms() -> u64 {
    150
}

fn default_election_timeout_min_ms() -> u64 {
    300
}

fn default_election_timeout_max_ms() -> u64 {
    600
}

fn default_snapshot_threshold() -> u64 {
    10_000
}

fn default_session_ttl_ms() -> u64 {
    120_000
}

fn default_propose_timeout_ms() -> u64 {
    5_000
}

fn default_fsync() -> FsyncMode {
    FsyncMode::Always
}

impl ServerConfig {
    /// Load configuration from a YAML file.
    pub fn load_from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("Failed to read config file: {}", e)))?;

        let config: ServerConfig = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::Parse(format!("Failed to parse YAML: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from environment variables.
    ///
    /// Supported variables:
    /// - KEEL_NODE_ID
    /// - KEEL_DATA_DIR
    /// - KEEL_PEER_ADDR
    /// - KEEL_CLIENT_ADDR
    /// - KEEL_ADMIN_ADDR
    /// - KEEL_PEERS (comma-separated `id=addr` pairs)
    pub fn load_from_env() -> Result<Self, ConfigError> {
        let node_id = std::env::var("KEEL_NODE_ID")
            .map_err(|_| ConfigError::MissingField("KEEL_NODE_ID".to_string()))?;

        let data_dir = std::env::var("KEEL_DATA_DIR")
            .map_err(|_| ConfigError::MissingField("KEEL_DATA_DIR".to_string()))?;

        let peer_addr = std::env::var("KEEL_PEER_ADDR").unwrap_or_else(|_| default_peer_addr());
        let client_addr =
            std::env::var("KEEL_CLIENT_ADDR").unwrap_or_else(|_| default_client_addr());
        let admin_addr = std::env::var("KEEL_ADMIN_ADDR").unwrap_or_else(|_| default_admin_addr());

        let peers = match std::env::var("KEEL_PEERS") {
            Ok(raw) => parse_peer_list(&raw)?,
            Err(_) => Vec::new(),
        };

        let config = ServerConfig {
            node_id,
            data_dir: PathBuf::from(data_dir),
            peer_addr,
            client_addr,
            admin_addr,
            cluster: ClusterConfig { peers },
            raft: RaftTuning::default(),
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node_id.is_empty() {
            return Err(ConfigError::InvalidField(
                "node_id cannot be empty".to_string(),
            ));
        }

        for (name, addr) in [
            ("peer_addr", &self.peer_addr),
            ("client_addr", &self.client_addr),
            ("admin_addr", &self.admin_addr),
        ] {
            addr.parse::<SocketAddr>()
                .map_err(|e| ConfigError::InvalidField(format!("Invalid {}: {}", name, e)))?;
        }

        if !self.cluster.peers.is_empty() {
            let mut seen = std::collections::HashSet::new();
            for peer in &self.cluster.peers {
                if peer.id.is_empty() {
                    return Err(ConfigError::InvalidField(
                        "peer id cannot be empty".to_string(),
                    ));
                }
                if !seen.insert(peer.id.as_str()) {
                    return Err(ConfigError::InvalidField(format!(
                        "duplicate peer id {}",
                        peer.id
                    )));
                }
                peer.addr.parse::<SocketAddr>().map_err(|e| {
                    ConfigError::InvalidField(format!(
                        "Invalid address for peer {}: {}",
                        peer.id, e
                    ))
                })?;
            }
            if !seen.contains(self.node_id.as_str()) {
                return Err(ConfigError::InvalidField(format!(
                    "cluster.peers must include this node ({})",
                    self.node_id
                )));
            }
        }

        if self.raft.election_timeout_min_ms >= self.raft.election_timeout_max_ms {
            return Err(ConfigError::InvalidField(
                "election_timeout_min_ms must be below election_timeout_max_ms".to_string(),
            ));
        }

        if self.raft.heartbeat_interval_ms >= self.raft.election_timeout_min_ms {
            return Err(ConfigError::InvalidField(
                "heartbeat_interval_ms must be below election_timeout_min_ms".to_string(),
            ));
        }

        if self.raft.snapshot_threshold == 0 {
            return Err(ConfigError::InvalidField(
                "snapshot_threshold must be > 0".to_string(),
            ));
        }

        Ok(())
    }

    /// The seed membership: the configured peer list, or just this node.
    pub fn initial_members(&self) -> Vec<NodeId> {
        if self.cluster.peers.is_empty() {
            vec![NodeId::new(self.node_id.clone())]
        } else {
            self.cluster
                .peers
                .iter()
                .map(|p| NodeId::new(p.id.clone()))
                .collect()
        }
    }

    /// Dialable addresses of the other cluster members.
    pub fn peer_addresses(&self) -> HashMap<NodeId, String> {
        self.cluster
            .peers
            .iter()
            .filter(|p| p.id != self.node_id)
            .map(|p| (NodeId::new(p.id.clone()), p.addr.clone()))
            .collect()
    }
}

fn parse_peer_list(raw: &str) -> Result<Vec<PeerEntry>, ConfigError> {
    raw.split(',')
        .filter(|part| !part.trim().is_empty())
        .map(|part| {
            let (id, addr) = part.trim().split_once('=').ok_or_else(|| {
                ConfigError::InvalidField(format!("peer entry {:?} is not id=addr", part.trim()))
            })?;
            Ok(PeerEntry {
                id: id.trim().to_string(),
                addr: addr.trim().to_string(),
            })
        })
        .collect()
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid field: {0}")]
    InvalidField(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> ServerConfig {
        ServerConfig {
            node_id: "n1".to_string(),
            data_dir: PathBuf::from("/tmp/keel-test"),
            peer_addr: default_peer_addr(),
            client_addr: default_client_addr(),
            admin_addr: default_admin_addr(),
            cluster: ClusterConfig::default(),
            raft: RaftTuning::default(),
        }
    }

    #[test]
    fn default_config_validates() {
        let config = base_config();
        assert!(config.validate().is_ok());
        assert_eq!(config.initial_members(), vec![NodeId::new("n1")]);
        assert!(config.peer_addresses().is_empty());
    }

    #[test]
    fn yaml_with_peer_list_parses() {
        let yaml = r#"
node_id: "n2"
data_dir: "/tmp/keel-yaml"
peer_addr: "127.0.0.1:7500"
cluster:
  peers:
    - { id: "n1", addr: "127.0.0.1:7400" }
    - { id: "n2", addr: "127.0.0.1:7500" }
raft:
  heartbeat_interval_ms: 100
  election_timeout_min_ms: 250
  election_timeout_max_ms: 500
  fsync: os
"#;
        let config: ServerConfig = serde_yaml::from_str(yaml).unwrap();
        config.validate().unwrap();

        assert_eq!(config.node_id, "n2");
        assert_eq!(config.cluster.peers.len(), 2);
        assert_eq!(config.raft.fsync, FsyncMode::Os);

        let members = config.initial_members();
        assert_eq!(members.len(), 2);

        let addrs = config.peer_addresses();
        assert_eq!(addrs.len(), 1);
        assert_eq!(addrs[&NodeId::new("n1")], "127.0.0.1:7400");

        let raft = config.raft.to_raft_config();
        assert_eq!(raft.heartbeat_interval, Duration::from_millis(100));
        assert_eq!(raft.log_fsync, FsyncPolicy::Os);
    }

    #[test]
    fn peer_list_must_include_self() {
        let mut config = base_config();
        config.cluster.peers = vec![PeerEntry {
            id: "n2".to_string(),
            addr: "127.0.0.1:7400".to_string(),
        }];
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_invalid_listen_address() {
        let mut config = base_config();
        config.client_addr = "not-an-address".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_heartbeat_slower_than_election() {
        let mut config = base_config();
        config.raft.heartbeat_interval_ms = 400;
        assert!(config.validate().is_err());
    }

    #[test]
    fn parses_peer_list_from_env_format() {
        let peers = parse_peer_list("n1=127.0.0.1:7400, n2=127.0.0.1:7500").unwrap();
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[1].id, "n2");
        assert_eq!(peers[1].addr, "127.0.0.1:7500");

        assert!(parse_peer_list("n1:127.0.0.1:7400").is_err());
    }
}
