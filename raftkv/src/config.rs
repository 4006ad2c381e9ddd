//! Closed configuration record with the defaults table from spec.md §6.

use serde::Deserialize;
use serde::Serialize;

/// Runtime tunables for a `Node`. All fields have defaults matching spec.md
/// §6; construct via `Config::default()` and override only what you need, or
/// deserialize a full record from TOML/JSON (see `examples/node.rs`).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Per-RPC reply wait, also reused as the consensus-seek timeout.
    pub rpc_timeout_ms: u64,
    /// Leader heartbeat interval.
    pub append_entries_interval_ms: u64,
    /// Lower bound of the randomized follower election-trigger range.
    pub heartbeat_timeout_min_ms: u64,
    /// Upper bound of the randomized follower election-trigger range.
    pub heartbeat_timeout_max_ms: u64,
    /// Candidate re-election spacing range, lower bound.
    pub election_timeout_min_ms: u64,
    /// Candidate re-election spacing range, upper bound.
    pub election_timeout_max_ms: u64,
    /// Entries per `InstallSnapshot` chunk.
    pub install_snapshot_chunk_size: usize,
    /// Entries per `AppendEntries` batch.
    pub batch_entries_limit: usize,
    /// Delay between client retry attempts.
    pub client_retry_rpc_timeout_ms: u64,
    /// Maximum client retry attempts before surfacing the error.
    pub client_max_retries: u32,
    /// Grace period before a leaving peer's transport/replicator is dropped.
    pub wait_before_leave_ms: u64,
    /// In-memory log retention window above `lastAppliedIndex`.
    pub max_log_retention: u64,
    /// Bound on queued requests/replies per dispatcher (§4.6).
    pub max_pending: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            rpc_timeout_ms: 2000,
            append_entries_interval_ms: 100,
            heartbeat_timeout_min_ms: 300,
            heartbeat_timeout_max_ms: 600,
            election_timeout_min_ms: 500,
            election_timeout_max_ms: 1000,
            install_snapshot_chunk_size: 10,
            batch_entries_limit: 10,
            client_retry_rpc_timeout_ms: 200,
            client_max_retries: 10,
            wait_before_leave_ms: 4000,
            max_log_retention: 100,
            max_pending: 1024,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("heartbeat_timeout_min_ms ({min}) must be < heartbeat_timeout_max_ms ({max})")]
    HeartbeatRange { min: u64, max: u64 },
    #[error("election_timeout_min_ms ({min}) must be < election_timeout_max_ms ({max})")]
    ElectionRange { min: u64, max: u64 },
    #[error("batch_entries_limit must be > 0")]
    ZeroBatchLimit,
    #[error("install_snapshot_chunk_size must be > 0")]
    ZeroChunkSize,
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat_timeout_min_ms >= self.heartbeat_timeout_max_ms {
            return Err(ConfigError::HeartbeatRange {
                min: self.heartbeat_timeout_min_ms,
                max: self.heartbeat_timeout_max_ms,
            });
        }
        if self.election_timeout_min_ms >= self.election_timeout_max_ms {
            return Err(ConfigError::ElectionRange {
                min: self.election_timeout_min_ms,
                max: self.election_timeout_max_ms,
            });
        }
        if self.batch_entries_limit == 0 {
            return Err(ConfigError::ZeroBatchLimit);
        }
        if self.install_snapshot_chunk_size == 0 {
            return Err(ConfigError::ZeroChunkSize);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn rejects_inverted_heartbeat_range() {
        let mut c = Config::default();
        c.heartbeat_timeout_min_ms = 900;
        assert!(c.validate().is_err());
    }
}
