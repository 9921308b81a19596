//! Peer-to-peer network parameters (§6 "Configuration"): the subset of
//! `NodeConfig` the `network` crate needs for admission, discovery, sync,
//! and propagation. The binary crate loads these from TOML/CLI and passes
//! this struct down, mirroring how `core::ChainParams` is threaded in.

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkParams {
    pub max_peers_total: usize,
    pub max_peers_per_ip: usize,
    pub max_peers_per_subnet: usize,
    pub min_diverse_peers: usize,
    pub target_peers: usize,
    pub discovery_interval_secs: u64,
    pub peer_max_idle_secs: i64,
    pub peer_io_timeout_secs: u64,
    pub ban_duration_secs: i64,
    pub rate_limit_rps: u32,
    pub dedup_capacity: usize,
    pub max_peer_queue: usize,
    pub max_inflight_blocks: usize,
}

impl Default for NetworkParams {
    fn default() -> Self {
        Self {
            max_peers_total: 125,
            max_peers_per_ip: 3,
            max_peers_per_subnet: 8,
            min_diverse_peers: 4,
            target_peers: 16,
            discovery_interval_secs: 30,
            peer_max_idle_secs: 900,
            peer_io_timeout_secs: 10,
            ban_duration_secs: 3_600,
            rate_limit_rps: 50,
            dedup_capacity: 4_096,
            max_peer_queue: 256,
            max_inflight_blocks: 64,
        }
    }
}

impl NetworkParams {
    #[must_use]
    pub fn discovery_interval(&self) -> Duration {
        Duration::from_secs(self.discovery_interval_secs)
    }

    #[must_use]
    pub fn peer_io_timeout(&self) -> Duration {
        Duration::from_secs(self.peer_io_timeout_secs)
    }
}
