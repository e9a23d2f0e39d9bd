//! Storage error types.

use std::path::PathBuf;
use thiserror::Error;

use crate::record::RecordError;

/// Storage errors.
#[derive(Error, Debug)]
pub enum StoreError {
    /// I/O error (disk full, permission, etc.).
    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// Frame-level error (checksum, torn write).
    #[error("Record error: {source}")]
    Record {
        #[from]
        source: RecordError,
    },

    /// Serialization error.
    #[error("Serialization error: {source}")]
    Encode {
        #[from]
        source: bincode::Error,
    },

    /// Persisted state exists but cannot be read back. A node must refuse
    /// to start rather than rejoin with amnesia.
    #[error("Corrupt persisted state at {path}: {reason}")]
    CorruptState { path: PathBuf, reason: String },

    /// Read below the compaction boundary (entry discarded by a snapshot).
    #[error("Index {index} has been compacted")]
    Compacted { index: u64 },

    /// Append that would leave a gap in the log.
    #[error("Non-contiguous append: expected index {expected}, got {got}")]
    NonContiguous { expected: u64, got: u64 },

    /// Operation addressed into the compacted or non-existent region.
    #[error("Index {index} is out of range: {reason}")]
    OutOfRange { index: u64, reason: String },

    /// Invalid store configuration.
    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },
}

/// Storage result type.
pub type Result<T> = std::result::Result<T, StoreError>;
