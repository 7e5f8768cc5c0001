//! Consensus errors

use crate::types::NodeId;
use thiserror::Error;

/// Errors surfaced by the consensus engine
///
/// Protocol disagreements (stale terms, log mismatches) are normally absorbed
/// inside the core and show up as rejected responses. The variants here are the
/// failures callers have to act on.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConsensusError {
    #[error("not the leader (leader hint: {leader_hint:?})")]
    NotLeader { leader_hint: Option<NodeId> },

    #[error("stale term, current term is {current_term}")]
    StaleTerm { current_term: u64 },

    #[error("timed out waiting for {what}")]
    Timeout { what: String },

    #[error("pool {pool} exhausted")]
    PoolExhausted { pool: &'static str },

    #[error("block {block_number} did not reach quorum in time")]
    QuorumTimeout { block_number: u64 },

    #[error("block {block_number} failed validation: {reason}")]
    ValidationFailed { block_number: u64, reason: String },

    #[error("batch failed: {reason}")]
    BatchFailed { reason: String },

    #[error("transport error talking to {peer}: {reason}")]
    Transport { peer: NodeId, reason: String },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("encoding error: {0}")]
    Encoding(String),

    #[error("component is shut down")]
    Shutdown,
}

impl ConsensusError {
    /// Whether the caller may resubmit the same work
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ConsensusError::NotLeader { .. }
                | ConsensusError::StaleTerm { .. }
                | ConsensusError::Timeout { .. }
                | ConsensusError::PoolExhausted { .. }
                | ConsensusError::QuorumTimeout { .. }
                | ConsensusError::Transport { .. }
        )
    }

    pub(crate) fn timeout(what: impl Into<String>) -> Self {
        ConsensusError::Timeout { what: what.into() }
    }
}

impl From<std::io::Error> for ConsensusError {
    fn from(e: std::io::Error) -> Self {
        ConsensusError::Encoding(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ConsensusError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quorum_timeout_is_retryable() {
        assert!(ConsensusError::QuorumTimeout { block_number: 3 }.is_retryable());
        assert!(!ConsensusError::ValidationFailed {
            block_number: 3,
            reason: "empty hash".into()
        }
        .is_retryable());
    }
}
