//! Consensus configuration (timeouts, limits, tuning parameters).

use keel_store::FsyncPolicy;
use std::time::Duration;

/// Tuning for one consensus node.
///
/// Controls election timeouts, heartbeat cadence, snapshot triggers, and
/// session liveness.
#[derive(Debug, Clone)]
pub struct RaftConfig {
    /// Heartbeat interval (leader to followers).
    ///
    /// The leader sends AppendEntries (heartbeat or real entries) at this
    /// cadence. Must be < election_timeout_min or followers will start
    /// spurious elections.
    ///
    /// Default: 150ms
    pub heartbeat_interval: Duration,

    /// Minimum election timeout.
    ///
    /// A follower that hears nothing from a leader for this long becomes a
    /// candidate. Randomized between [min, max] to break split votes.
    ///
    /// Default: 300ms
    pub election_timeout_min: Duration,

    /// Maximum election timeout.
    ///
    /// Default: 600ms
    pub election_timeout_max: Duration,

    /// Maximum entries per AppendEntries RPC.
    ///
    /// Default: 1000 entries
    pub max_entries_per_append: usize,

    /// Snapshot trigger: applied entries since the last snapshot.
    ///
    /// Default: 10,000 entries
    pub snapshot_threshold: u64,

    /// InstallSnapshot chunk size in bytes.
    ///
    /// Default: 1 MiB
    pub snapshot_chunk_size: usize,

    /// How long a client session may go silent before the leader proposes
    /// its eviction.
    ///
    /// Default: 120s
    pub session_ttl: Duration,

    /// Heartbeat ticks between session liveness sweeps on the leader.
    ///
    /// Default: 10
    pub session_gc_ticks: u32,

    /// How long a submitted command may wait for commitment before the
    /// caller gets a timeout.
    ///
    /// Default: 5000ms
    pub propose_timeout: Duration,

    /// Log segment size before rotation.
    ///
    /// Default: 64 MiB
    pub log_segment_size: u64,

    /// Log fsync policy. Anything but `Always` forfeits the durability the
    /// replication acks promise; use `Os` only in tests.
    pub log_fsync: FsyncPolicy,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(150),
            election_timeout_min: Duration::from_millis(300),
            election_timeout_max: Duration::from_millis(600),

            max_entries_per_append: 1000,

            snapshot_threshold: 10_000,
            snapshot_chunk_size: 1024 * 1024, // 1 MiB

            session_ttl: Duration::from_secs(120),
            session_gc_ticks: 10,

            propose_timeout: Duration::from_millis(5000),

            log_segment_size: 64 * 1024 * 1024, // 64 MiB
            log_fsync: FsyncPolicy::Always,
        }
    }
}

impl RaftConfig {
    /// Validate configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        if self.heartbeat_interval >= self.election_timeout_min {
            return Err(format!(
                "heartbeat_interval ({:?}) must be < election_timeout_min ({:?})",
                self.heartbeat_interval, self.election_timeout_min
            ));
        }

        if self.election_timeout_min >= self.election_timeout_max {
            return Err(format!(
                "election_timeout_min ({:?}) must be < election_timeout_max ({:?})",
                self.election_timeout_min, self.election_timeout_max
            ));
        }

        if self.max_entries_per_append == 0 {
            return Err("max_entries_per_append must be > 0".to_string());
        }

        if self.snapshot_threshold == 0 {
            return Err("snapshot_threshold must be > 0".to_string());
        }

        if self.snapshot_chunk_size == 0 {
            return Err("snapshot_chunk_size must be > 0".to_string());
        }

        if self.session_gc_ticks == 0 {
            return Err("session_gc_ticks must be > 0".to_string());
        }

        if self.session_ttl < self.election_timeout_max {
            return Err(format!(
                "session_ttl ({:?}) must be >= election_timeout_max ({:?})",
                self.session_ttl, self.election_timeout_max
            ));
        }

        if self.log_segment_size == 0 {
            return Err("log_segment_size must be > 0".to_string());
        }

        Ok(())
    }

    /// Random duration in [election_timeout_min, election_timeout_max].
    ///
    /// Each node draws its own timeout so split votes resolve quickly.
    pub fn random_election_timeout(&self) -> Duration {
        use rand::Rng;
        let min_ms = self.election_timeout_min.as_millis() as u64;
        let max_ms = self.election_timeout_max.as_millis() as u64;
        let random_ms = rand::thread_rng().gen_range(min_ms..=max_ms);
        Duration::from_millis(random_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_valid() {
        let config = RaftConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_heartbeat_too_long() {
        let mut config = RaftConfig::default();
        config.heartbeat_interval = Duration::from_millis(400);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_election_timeout_range() {
        let mut config = RaftConfig::default();
        config.election_timeout_min = Duration::from_millis(700);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_session_ttl() {
        let mut config = RaftConfig::default();
        config.session_ttl = Duration::from_millis(100);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_random_election_timeout_in_range() {
        let config = RaftConfig::default();
        for _ in 0..100 {
            let timeout = config.random_election_timeout();
            assert!(timeout >= config.election_timeout_min);
            assert!(timeout <= config.election_timeout_max);
        }
    }
}
