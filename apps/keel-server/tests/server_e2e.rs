//! End-to-end tests: full servers on real sockets, driven through the
//! client library and the admin HTTP surface.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::{sleep, timeout};

use keel_client::{Client, TcpClientTransport};
use keel_raft::{NodeId, Role};
use keel_server::config::{ClusterConfig, FsyncMode, PeerEntry, RaftTuning, ServerConfig};
use keel_server::machine::{decode_response, encode_command, RegisterCommand};
use keel_server::server::Server;

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_test_writer()
        .try_init()
        .ok();
}

/// Reserves a distinct loopback address by binding port 0 and dropping
/// the listener. The tiny reuse window is fine for tests.
fn reserve_addr() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    listener.local_addr().expect("local addr").to_string()
}

fn test_tuning() -> RaftTuning {
    RaftTuning {
        heartbeat_interval_ms: 50,
        election_timeout_min_ms: 150,
        election_timeout_max_ms: 300,
        fsync: FsyncMode::Os,
        ..RaftTuning::default()
    }
}

fn node_config(id: &str, data_dir: &TempDir, peer_addr: String, peers: Vec<PeerEntry>) -> ServerConfig {
    ServerConfig {
        node_id: id.to_string(),
        data_dir: data_dir.path().to_path_buf(),
        peer_addr,
        client_addr: "127.0.0.1:0".to_string(),
        admin_addr: "127.0.0.1:0".to_string(),
        cluster: ClusterConfig { peers },
        raft: test_tuning(),
    }
}

async fn wait_for_leader(servers: &[&Server]) -> NodeId {
    let deadline = Duration::from_secs(5);
    timeout(deadline, async {
        loop {
            for server in servers {
                let status = server.node().expect("node started").status();
                if status.role == Role::Leader {
                    return status.node;
                }
            }
            sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .expect("a leader within the deadline")
}

async fn http_get(addr: SocketAddr, path: &str) -> String {
    let mut stream = tokio::net::TcpStream::connect(addr).await.expect("connect");
    let request = format!(
        "GET {} HTTP/1.1\r\nHost: keel\r\nConnection: close\r\n\r\n",
        path
    );
    stream.write_all(request.as_bytes()).await.expect("write");
    let mut response = String::new();
    stream
        .read_to_string(&mut response)
        .await
        .expect("read response");
    response
}

async fn submit(client: &mut Client, command: RegisterCommand) -> u64 {
    let response = client
        .submit(encode_command(&command))
        .await
        .expect("submit");
    decode_response(&response).expect("decode").value
}

#[tokio::test(flavor = "multi_thread")]
async fn single_node_serves_clients() {
    init_tracing();

    let dir = TempDir::new().expect("tempdir");
    let config = node_config("n1", &dir, reserve_addr(), Vec::new());

    let mut server = Server::new(config);
    server.start().await.expect("start");
    wait_for_leader(&[&server]).await;

    let client_addr = server.client_addr().expect("client addr");
    let transport = Arc::new(TcpClientTransport::new(HashMap::from([(
        NodeId::new("n1"),
        client_addr.to_string(),
    )])));
    let mut client = Client::new(vec![NodeId::new("n1")], transport);

    assert_eq!(submit(&mut client, RegisterCommand::Set { value: 7 }).await, 7);
    assert_eq!(submit(&mut client, RegisterCommand::Add { delta: 5 }).await, 12);
    assert_eq!(submit(&mut client, RegisterCommand::Get).await, 12);

    let admin_addr = server.admin_addr().expect("admin addr");
    let health = http_get(admin_addr, "/health").await;
    assert!(health.contains("200 OK"), "health: {}", health);

    let status = http_get(admin_addr, "/status").await;
    assert!(status.contains("\"Leader\""), "status: {}", status);
    assert!(status.contains("\"n1\""), "status: {}", status);

    client.close().await.expect("close session");
    server.shutdown().await.expect("shutdown");
}

#[tokio::test(flavor = "multi_thread")]
async fn two_nodes_replicate_over_tcp() {
    init_tracing();

    let peer1 = reserve_addr();
    let peer2 = reserve_addr();
    let peers = vec![
        PeerEntry {
            id: "n1".to_string(),
            addr: peer1.clone(),
        },
        PeerEntry {
            id: "n2".to_string(),
            addr: peer2.clone(),
        },
    ];

    let dir1 = TempDir::new().expect("tempdir");
    let dir2 = TempDir::new().expect("tempdir");

    let mut server1 = Server::new(node_config("n1", &dir1, peer1, peers.clone()));
    let mut server2 = Server::new(node_config("n2", &dir2, peer2, peers));
    server1.start().await.expect("start n1");
    server2.start().await.expect("start n2");

    wait_for_leader(&[&server1, &server2]).await;

    let transport = Arc::new(TcpClientTransport::new(HashMap::from([
        (
            NodeId::new("n1"),
            server1.client_addr().expect("addr").to_string(),
        ),
        (
            NodeId::new("n2"),
            server2.client_addr().expect("addr").to_string(),
        ),
    ])));
    let mut client = Client::new(vec![NodeId::new("n1"), NodeId::new("n2")], transport);

    // A two node cluster needs both nodes for quorum, so a committed
    // write proves replication crossed the wire.
    assert_eq!(
        submit(&mut client, RegisterCommand::Set { value: 42 }).await,
        42
    );
    assert_eq!(submit(&mut client, RegisterCommand::Get).await, 42);

    // Both nodes converge on the same applied index.
    timeout(Duration::from_secs(5), async {
        loop {
            let s1 = server1.node().expect("node").status();
            let s2 = server2.node().expect("node").status();
            if s1.applied_index == s2.applied_index && s1.applied_index > 0 {
                return;
            }
            sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .expect("replicas converge");

    client.close().await.expect("close session");
    server1.shutdown().await.expect("shutdown n1");
    server2.shutdown().await.expect("shutdown n2");
}
