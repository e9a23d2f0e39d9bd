//! Client error types.

use thiserror::Error;

/// Client-side errors.
///
/// Redirects and transient node failures are retried internally, so the
/// surface is small: either the deadline ran out or the transport itself
/// is misconfigured.
#[derive(Error, Debug)]
pub enum ClientError {
    /// No node committed the request before the deadline. The command may
    /// still commit; retrying with the same session is safe.
    #[error("Request deadline exceeded after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    /// The transport cannot carry the request at all.
    #[error("Transport error: {reason}")]
    Transport { reason: String },

    /// I/O error.
    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, ClientError>;
