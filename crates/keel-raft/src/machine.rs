//! The application state machine seam.

use bytes::Bytes;

use crate::error::Result;

/// A deterministic state machine replicated by the cluster.
///
/// Implementations must be deterministic: the same command sequence yields
/// the same state and the same responses on every node. A malformed command
/// must produce a deterministic error response rather than a panic, since
/// every replica will apply it.
///
/// All calls happen on the consensus core task, so implementations need no
/// internal locking.
pub trait StateMachine: Send + 'static {
    /// Applies a committed command. The returned bytes are cached for the
    /// issuing session and sent back to the client.
    fn apply(&mut self, command: &[u8]) -> Bytes;

    /// Serializes the complete state for a snapshot.
    fn snapshot(&self) -> Bytes;

    /// Replaces the state with one previously produced by [`snapshot`].
    ///
    /// [`snapshot`]: StateMachine::snapshot
    fn restore(&mut self, data: &[u8]) -> Result<()>;
}
