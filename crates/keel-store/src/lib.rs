//! Durable storage for a replicated log: segmented entries, election state,
//! and snapshots.
//!
//! Provides the persistence layer a consensus core needs:
//! - Varint-framed records with CRC32C checksumming
//! - A segmented entry log with rotation, suffix truncation, and
//!   whole-segment compaction
//! - Crash recovery with partial-tail truncation
//! - Atomic hard-state (term / vote) persistence
//! - Snapshot files with temp-and-rename durability
//!
//! # Example
//!
//! ```no_run
//! use bytes::Bytes;
//! use keel_store::{FsyncPolicy, LogConfig, LogStore, StoredEntry};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = LogConfig {
//!         dir: "data/log".into(),
//!         ..LogConfig::default()
//!     };
//!     let (mut log, report) = LogStore::open(config).await?;
//!
//!     println!("recovered {} entries", report.entries_recovered);
//!
//!     log.append(&[StoredEntry {
//!         index: log.last_index() + 1,
//!         term: 1,
//!         payload: Bytes::from_static(b"command"),
//!     }])
//!     .await?;
//!
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod hard_state;
pub mod log;
pub mod record;
pub mod snapshot;

pub use error::{Result, StoreError};
pub use hard_state::{HardState, HardStateFile};
pub use log::{FsyncPolicy, LogConfig, LogStore, RecoveryReport, StoredEntry};
pub use record::RecordError;
pub use snapshot::{SnapshotBlob, SnapshotStore};
