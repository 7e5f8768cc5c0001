//! Blocks moving through the finality pipeline

use crate::types::{BlockCommit, BlockProposal, NodeId};
use serde::{Deserialize, Serialize};

/// A proposed block and its progress through validation and voting
///
/// Once `finalized` is set the block is frozen behind an `Arc` and never
/// mutated again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub block_number: u64,
    pub proposer_id: NodeId,
    pub block_hash: Vec<u8>,
    pub transaction_ids: Vec<String>,
    /// Position of the block's entry in the replicated log
    pub log_index: u64,
    /// Term the block entry was proposed in
    pub term: u64,
    pub validated: bool,
    /// Voters that formed the quorum
    pub votes: Vec<NodeId>,
    pub finalized: bool,
    /// Unix millis
    pub finalized_at: Option<i64>,
}

impl Block {
    pub fn from_proposal(proposal: &BlockProposal, log_index: u64, term: u64) -> Self {
        Self {
            block_number: proposal.block_number,
            proposer_id: proposal.proposer_id.clone(),
            block_hash: proposal.block_hash.clone(),
            transaction_ids: proposal.transaction_ids.clone(),
            log_index,
            term,
            validated: false,
            votes: Vec::new(),
            finalized: false,
            finalized_at: None,
        }
    }

    pub fn commit(&self) -> BlockCommit {
        BlockCommit {
            block_number: self.block_number,
            block_hash: self.block_hash.clone(),
            log_index: self.log_index,
            voters: self.votes.clone(),
        }
    }
}
