//! Consensus node configuration

use crate::types::NodeId;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Timing and sizing knobs of one consensus node
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    /// This node's identity
    pub node_id: NodeId,
    /// Every other voting member of the cluster
    pub peers: Vec<NodeId>,
    /// Lower bound of the randomized election timeout
    pub election_timeout_min_ms: u64,
    /// Upper bound of the randomized election timeout
    pub election_timeout_max_ms: u64,
    /// Leader heartbeat period
    pub heartbeat_interval_ms: u64,
    /// How often the ticker thread checks timers
    pub tick_interval_ms: u64,
    /// Deadline for each peer RPC
    pub rpc_timeout_ms: u64,
    /// Entries carried by one AppendEntries round trip
    pub max_entries_per_append: usize,
    /// Bytes per InstallSnapshot chunk
    pub snapshot_chunk_size: usize,
    /// Per-subscriber event buffer
    pub event_buffer_size: usize,
    /// Seed for election jitter (deterministic tests)
    pub rng_seed: Option<u64>,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            node_id: "node-1".to_string(),
            peers: Vec::new(),
            election_timeout_min_ms: 150,
            election_timeout_max_ms: 300,
            heartbeat_interval_ms: 50,
            tick_interval_ms: 10,
            rpc_timeout_ms: 100,
            max_entries_per_append: 512,
            snapshot_chunk_size: 64 * 1024,
            event_buffer_size: 1024,
            rng_seed: None,
        }
    }
}

impl ConsensusConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    /// All voting members, self first
    pub fn members(&self) -> Vec<NodeId> {
        std::iter::once(self.node_id.clone())
            .chain(self.peers.iter().filter(|p| **p != self.node_id).cloned())
            .collect()
    }
}
