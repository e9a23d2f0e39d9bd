//! Randomized election timer.
//!
//! Fires when the election timeout elapses without a reset. Followers and
//! candidates reset it whenever they hear from a live leader or grant a
//! vote; a timeout reaching the core means it is time to stand for
//! election. Timeouts are randomized per iteration to break split votes.

use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Notify};

use crate::config::RaftConfig;
use crate::core::CoreEvent;

/// Resettable election timer.
///
/// Clone one handle into the timer task's run loop and keep another on the
/// core for resets.
#[derive(Clone)]
pub struct ElectionTimer {
    config: RaftConfig,
    reset_notify: Arc<Notify>,
}

impl ElectionTimer {
    pub fn new(config: RaftConfig) -> Self {
        Self {
            config,
            reset_notify: Arc::new(Notify::new()),
        }
    }

    /// Restarts the current timeout window with a fresh random duration.
    pub fn reset(&self) {
        self.reset_notify.notify_one();
    }

    /// Timer loop. Runs until the event channel closes or shutdown fires.
    pub async fn run(self, events: mpsc::Sender<CoreEvent>, mut shutdown: broadcast::Receiver<()>) {
        loop {
            let timeout = self.config.random_election_timeout();
            tokio::select! {
                _ = tokio::time::sleep(timeout) => {
                    if events.send(CoreEvent::ElectionTimeout).await.is_err() {
                        break;
                    }
                }
                _ = self.reset_notify.notified() => continue,
                _ = shutdown.recv() => break,
            }
        }
    }
}
