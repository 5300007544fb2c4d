//! Runtime configuration for the log and the consensus node.

use std::time::Duration;

#[derive(Debug, Clone, Default)]
pub struct Config {
    pub segment: SegmentConfig,
    pub raft: RaftConfig,
}

/// Bounds governing segment rotation and the base offset of a fresh log.
#[derive(Debug, Clone)]
pub struct SegmentConfig {
    pub max_store_bytes: u64,
    pub max_index_bytes: u64,
    pub initial_offset: u64,
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self {
            max_store_bytes: 1024,
            max_index_bytes: 1024,
            initial_offset: 0,
        }
    }
}

/// Consensus timing and identity. `bind_addr` is the address advertised
/// to peers; it must be reachable through the shared listener.
#[derive(Debug, Clone)]
pub struct RaftConfig {
    pub local_id: String,
    pub bind_addr: String,
    pub heartbeat_timeout: Duration,
    pub election_timeout: Duration,
    pub leader_lease_timeout: Duration,
    pub commit_timeout: Duration,
    pub bootstrap: bool,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            local_id: String::new(),
            bind_addr: String::new(),
            heartbeat_timeout: Duration::from_secs(1),
            election_timeout: Duration::from_secs(1),
            leader_lease_timeout: Duration::from_millis(500),
            commit_timeout: Duration::from_secs(1),
            bootstrap: false,
        }
    }
}
