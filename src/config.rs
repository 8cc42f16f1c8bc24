//! Node Configuration
//!
//! All knobs are passed explicitly to component constructors; nothing is
//! read from global state. Binaries build a `NodeConfig` from environment
//! variables and hand it to `KvNode::open`.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Default maximum segment size: 1 MiB.
pub const DEFAULT_MAX_SEGMENT_SIZE: u64 = 1024 * 1024;
/// Default heartbeat interval in seconds.
pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 10;
/// Default dedup cache TTL in seconds.
pub const DEFAULT_DEDUP_TTL_SECS: u64 = 3600;

/// Role of a node in the cluster. Static for the process lifetime; there is
/// no election.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Leader,
    Follower { leader_url: String },
}

impl Role {
    pub fn is_leader(&self) -> bool {
        matches!(self, Role::Leader)
    }
}

/// A peer this node heartbeats and (as leader) replicates to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
    pub id: String,
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique node identifier, used as the heartbeat sender id.
    pub node_id: String,
    pub role: Role,
    /// Directory holding the WAL segment files.
    pub data_dir: PathBuf,
    /// URL other nodes use to reach this node's peer listener.
    pub advertise_url: String,
    /// Statically configured peers (followers for a leader, the leader and
    /// any siblings for a follower).
    pub peers: Vec<PeerConfig>,
    pub max_segment_size: u64,
    /// Retained historical versions per key. 0 = unbounded.
    pub max_history: usize,
    pub heartbeat_interval_secs: u64,
    /// Silence longer than this marks a peer down. Defaults to 3x interval.
    pub heartbeat_timeout_secs: u64,
    pub dedup_ttl_secs: u64,
    pub dedup_max_entries: usize,
    pub compaction: CompactionConfig,
    pub replication: ReplicationConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            node_id: "node-1".to_string(),
            role: Role::Leader,
            data_dir: PathBuf::from("data"),
            advertise_url: "127.0.0.1:9400".to_string(),
            peers: Vec::new(),
            max_segment_size: DEFAULT_MAX_SEGMENT_SIZE,
            max_history: 10,
            heartbeat_interval_secs: DEFAULT_HEARTBEAT_INTERVAL_SECS,
            heartbeat_timeout_secs: DEFAULT_HEARTBEAT_INTERVAL_SECS * 3,
            dedup_ttl_secs: DEFAULT_DEDUP_TTL_SECS,
            dedup_max_entries: 10_000,
            compaction: CompactionConfig::default(),
            replication: ReplicationConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Config for tests: tiny segments, tight timings.
    pub fn test() -> Self {
        NodeConfig {
            node_id: "test-node".to_string(),
            max_segment_size: 200,
            heartbeat_interval_secs: 1,
            heartbeat_timeout_secs: 3,
            dedup_ttl_secs: 60,
            compaction: CompactionConfig::test(),
            replication: ReplicationConfig::test(),
            ..NodeConfig::default()
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    pub fn dedup_ttl(&self) -> Duration {
        Duration::from_secs(self.dedup_ttl_secs)
    }
}

/// Compaction scheduling knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionConfig {
    pub enabled: bool,
    /// Cadence of the background compaction loop, seconds.
    pub interval_secs: u64,
    /// Floor between two consecutive runs, seconds.
    pub min_interval_secs: u64,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        CompactionConfig {
            enabled: true,
            interval_secs: 3600,
            min_interval_secs: 600,
        }
    }
}

impl CompactionConfig {
    pub fn test() -> Self {
        CompactionConfig {
            enabled: true,
            interval_secs: 1,
            min_interval_secs: 0,
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn min_interval(&self) -> Duration {
        Duration::from_secs(self.min_interval_secs)
    }
}

/// Replication push/pull tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Attempts per entry per healthy peer before giving up on push.
    pub push_retry_limit: u32,
    /// Base backoff between push retries, doubled per attempt.
    pub push_retry_backoff_ms: u64,
    /// Deadline on every outbound peer call.
    pub request_timeout_secs: u64,
    /// A follower lagging more than this many entries bulk-fetches instead
    /// of waiting for pushes.
    pub lag_threshold: u64,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        ReplicationConfig {
            push_retry_limit: 3,
            push_retry_backoff_ms: 100,
            request_timeout_secs: 5,
            lag_threshold: 64,
        }
    }
}

impl ReplicationConfig {
    pub fn test() -> Self {
        ReplicationConfig {
            push_retry_limit: 2,
            push_retry_backoff_ms: 10,
            request_timeout_secs: 1,
            lag_threshold: 4,
        }
    }

    pub fn push_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.push_retry_backoff_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = NodeConfig::default();
        assert_eq!(config.max_segment_size, 1024 * 1024);
        assert_eq!(config.heartbeat_interval_secs, 10);
        assert_eq!(config.heartbeat_timeout_secs, 30);
        assert_eq!(config.dedup_ttl_secs, 3600);
        assert_eq!(config.compaction.interval_secs, 3600);
        assert_eq!(config.compaction.min_interval_secs, 600);
    }

    #[test]
    fn test_role_round_trips_through_json() {
        let role = Role::Follower {
            leader_url: "127.0.0.1:9400".to_string(),
        };
        let json = serde_json::to_string(&role).unwrap();
        let back: Role = serde_json::from_str(&json).unwrap();
        assert_eq!(role, back);
        assert!(!back.is_leader());
    }
}
