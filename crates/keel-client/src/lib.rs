//! keel-client: client library for keel clusters.
//!
//! A [`Client`] is one session: a random identity plus a monotonically
//! increasing sequence number on every command. The cluster replicates
//! the session table, so a command retried across leader changes and
//! node crashes executes at most once and the original response comes
//! back from the cache.
//!
//! The client tracks the leader from redirect hints, probes the member
//! list round-robin when no leader is known, and backs off exponentially
//! with jitter while the cluster is electing or unreachable.
//!
//! Transport is pluggable through [`ClientTransport`]:
//! [`TcpClientTransport`] speaks the wire protocol against server
//! listeners, [`InProcessTransport`] short-circuits it for embedded
//! clusters and tests.

pub mod client;
pub mod error;
pub mod transport;

pub use client::{Client, ClientConfig};
pub use error::{ClientError, Result};
pub use transport::{
    response_from_error, ClientRequest, ClientResponse, ClientTransport, InProcessTransport,
    TcpClientTransport,
};
