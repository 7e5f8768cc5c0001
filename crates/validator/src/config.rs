//! Node Configuration

use anyhow::Context;
use ledger_consensus::{
    ConsensusConfig, MessageBatcherConfig, PipelineConfig, TransactionBatcherConfig,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Synthetic transaction load
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkloadConfig {
    /// Transactions submitted per second (0 disables the workload)
    pub tx_per_sec: u64,
    /// Payload bytes per transaction
    pub payload_bytes: usize,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            tx_per_sec: 1_000,
            payload_bytes: 64,
        }
    }
}

/// Everything the node binary needs to run an in-process cluster
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidatorConfig {
    /// Number of consensus nodes
    pub cluster_size: usize,
    /// Timing template; `node_id` and `peers` are filled in per node
    pub consensus: ConsensusConfig,
    pub pipeline: PipelineConfig,
    pub transactions: TransactionBatcherConfig,
    pub messages: MessageBatcherConfig,
    pub workload: WorkloadConfig,
    /// Vote weights per node id; absent means simple majority
    pub weights: Option<HashMap<String, u64>>,
    /// Seconds between metrics reports
    pub metrics_interval_secs: u64,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            cluster_size: 3,
            consensus: ConsensusConfig::default(),
            pipeline: PipelineConfig::default(),
            transactions: TransactionBatcherConfig::default(),
            messages: MessageBatcherConfig::default(),
            workload: WorkloadConfig::default(),
            weights: None,
            metrics_interval_secs: 5,
        }
    }
}

impl ValidatorConfig {
    /// Read a JSON config file; missing fields take their defaults
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn node_ids(&self) -> Vec<String> {
        (1..=self.cluster_size.max(1))
            .map(|i| format!("node-{}", i))
            .collect()
    }

    /// Consensus config for one member
    pub fn node_config(&self, id: &str, index: usize) -> ConsensusConfig {
        let ids = self.node_ids();
        ConsensusConfig {
            node_id: id.to_string(),
            peers: ids.into_iter().filter(|p| p != id).collect(),
            rng_seed: self.consensus.rng_seed.map(|seed| seed + index as u64),
            ..self.consensus.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config: ValidatorConfig =
            serde_json::from_str(r#"{"cluster_size":5,"workload":{"tx_per_sec":10}}"#).unwrap();
        assert_eq!(config.cluster_size, 5);
        assert_eq!(config.workload.tx_per_sec, 10);
        assert_eq!(config.workload.payload_bytes, 64);
        assert_eq!(config.pipeline.aggregation_timeout_ms, 2_000);
    }

    #[test]
    fn test_node_config_lists_other_members() {
        let config = ValidatorConfig {
            consensus: ConsensusConfig {
                rng_seed: Some(40),
                ..Default::default()
            },
            ..Default::default()
        };
        let node = config.node_config("node-2", 1);
        assert_eq!(node.node_id, "node-2");
        assert_eq!(node.peers, vec!["node-1", "node-3"]);
        assert_eq!(node.rng_seed, Some(41));
    }
}
