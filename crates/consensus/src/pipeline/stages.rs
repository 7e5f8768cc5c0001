//! Stage loops of the finality pipeline
//!
//! Each stage owns one thread, pulls from its bounded input queue and pushes
//! into the next one. A stage exits once its input queue is disconnected and
//! drained, which cascades shutdown downstream.

use super::block::Block;
use super::vote_set::VoteBook;
use super::{FinalitySink, PipelineCounters, TransactionResolver};
use crate::completion::Completion;
use crate::error::{ConsensusError, Result};
use crate::pool::{ObjectPool, ValidationContext};
use crate::quorum::QuorumPolicy;
use crate::types::{block_hash, now_millis, BlockCommit, NodeId};
use crossbeam_channel::{Receiver, Sender};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A block in flight together with its proposer's receipt
pub(crate) struct InFlight {
    pub block: Block,
    pub receipt: Completion<Result<BlockCommit>>,
}

impl InFlight {
    fn fail(self, error: ConsensusError) {
        self.receipt.resolve(Err(error));
    }
}

pub(crate) struct ValidationStage {
    pub input: Receiver<InFlight>,
    pub output: Sender<InFlight>,
    pub resolver: Arc<dyn TransactionResolver>,
    pub contexts: ObjectPool<ValidationContext>,
    pub counters: Arc<PipelineCounters>,
}

impl ValidationStage {
    pub fn run(self) {
        // highest validated block number per proposer
        let mut last_number: HashMap<NodeId, u64> = HashMap::new();

        for mut item in self.input.iter() {
            let block_number = item.block.block_number;
            let verdict = self.validate(&item.block, &last_number);
            match verdict {
                Ok(()) => {
                    item.block.validated = true;
                    last_number.insert(item.block.proposer_id.clone(), block_number);
                    self.counters.validated.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!("Block {} validated", block_number);
                    if let Err(e) = self.output.send(item) {
                        e.into_inner().fail(ConsensusError::Shutdown);
                    }
                }
                Err(reason) => {
                    tracing::warn!("Block {} rejected: {}", block_number, reason);
                    self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                    item.fail(ConsensusError::ValidationFailed {
                        block_number,
                        reason,
                    });
                }
            }
        }
        tracing::debug!("Validation stage stopped");
    }

    fn validate(
        &self,
        block: &Block,
        last_number: &HashMap<NodeId, u64>,
    ) -> std::result::Result<(), String> {
        let mut ctx = self.contexts.acquire().map_err(|e| e.to_string())?;
        ctx.block_number = block.block_number;

        if block.block_hash.is_empty() {
            ctx.fail("empty block hash");
        } else if block.block_hash
            != block_hash(&block.proposer_id, block.block_number, &block.transaction_ids)
        {
            ctx.fail("block hash does not match contents");
        }
        if let Some(last) = last_number.get(&block.proposer_id) {
            if block.block_number <= *last {
                ctx.fail(format!(
                    "block number {} not above {} from {}",
                    block.block_number, last, block.proposer_id
                ));
            }
        }
        for tx_id in &block.transaction_ids {
            if !ctx.seen_tx_ids.insert(tx_id.clone()) {
                ctx.fail(format!("duplicate transaction {}", tx_id));
            } else if !self.resolver.resolve(tx_id) {
                ctx.fail(format!("unknown transaction {}", tx_id));
            }
        }

        if ctx.is_valid() {
            Ok(())
        } else {
            Err(ctx.errors.join("; "))
        }
    }
}

pub(crate) struct AggregationStage {
    pub input: Receiver<InFlight>,
    pub output: Sender<InFlight>,
    pub votes: Arc<VoteBook>,
    pub quorum: Arc<dyn QuorumPolicy>,
    pub members: Vec<NodeId>,
    pub timeout: Duration,
    pub counters: Arc<PipelineCounters>,
}

impl AggregationStage {
    pub fn run(self) {
        for mut item in self.input.iter() {
            let block_number = item.block.block_number;
            let deadline = Instant::now() + self.timeout;
            match self.votes.wait_for_quorum(
                block_number,
                item.block.term,
                self.quorum.as_ref(),
                &self.members,
                deadline,
            ) {
                Ok(voters) => {
                    tracing::debug!(
                        "Block {} reached quorum with {} votes",
                        block_number,
                        voters.len()
                    );
                    item.block.votes = voters;
                    if let Err(e) = self.output.send(item) {
                        e.into_inner().fail(ConsensusError::Shutdown);
                    }
                }
                Err(error) => {
                    match &error {
                        ConsensusError::QuorumTimeout { .. } => {
                            tracing::warn!("Block {} timed out waiting for votes", block_number);
                            self.counters.timed_out.fetch_add(1, Ordering::Relaxed);
                        }
                        ConsensusError::StaleTerm { current_term } => {
                            tracing::info!(
                                "Block {} of term {} abandoned, node is at term {}",
                                block_number,
                                item.block.term,
                                current_term
                            );
                        }
                        _ => {}
                    }
                    item.fail(error);
                }
            }
        }
        tracing::debug!("Aggregation stage stopped");
    }
}

pub(crate) struct FinalizationStage {
    pub input: Receiver<InFlight>,
    pub quorum: Arc<dyn QuorumPolicy>,
    pub members: Vec<NodeId>,
    pub sinks: Arc<RwLock<Vec<Arc<dyn FinalitySink>>>>,
    pub counters: Arc<PipelineCounters>,
}

impl FinalizationStage {
    pub fn run(self) {
        let mut last_finalized: HashMap<NodeId, u64> = HashMap::new();

        for item in self.input.iter() {
            let InFlight { mut block, receipt } = item;
            let block_number = block.block_number;

            let voters: Vec<&NodeId> = block.votes.iter().collect();
            if !block.validated || !self.quorum.is_quorum(&voters, &self.members) {
                receipt.resolve(Err(ConsensusError::QuorumTimeout { block_number }));
                continue;
            }
            if let Some(last) = last_finalized.get(&block.proposer_id) {
                if block_number < *last {
                    receipt.resolve(Err(ConsensusError::ValidationFailed {
                        block_number,
                        reason: format!("finalized out of order after {}", last),
                    }));
                    continue;
                }
            }

            block.finalized = true;
            block.finalized_at = Some(now_millis());
            last_finalized.insert(block.proposer_id.clone(), block_number);
            let block = Arc::new(block);

            self.counters.finalized.fetch_add(1, Ordering::Relaxed);
            tracing::debug!("Block {} finalized at log index {}", block_number, block.log_index);
            receipt.resolve(Ok(block.commit()));

            for sink in self.sinks.read().iter() {
                sink.block_finalized(&block);
            }
        }
        tracing::debug!("Finalization stage stopped");
    }
}
