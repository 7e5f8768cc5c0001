//! Block finality pipeline
//!
//! Three stages on their own threads, connected by bounded queues:
//!
//! ```text
//! submit ──► [validation] ──► [vote aggregation] ──► [finalization] ──► sinks
//!                 │                   ▲                     │
//!          ValidationContext     record_vote          receipt resolved
//!              (pooled)
//! ```
//!
//! A full queue blocks the upstream producer, including `submit`. Blocks from
//! one proposer leave every stage in submission order.

mod block;
mod stages;
mod vote_set;

pub use block::Block;
pub use vote_set::VoteSet;

use crate::completion::completion;
use crate::error::{ConsensusError, Result};
use crate::pool::{ObjectPool, PoolConfig, ValidationContext};
use crate::quorum::QuorumPolicy;
use crate::types::{FinalityReceipt, NodeId};
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use stages::{AggregationStage, FinalizationStage, InFlight, ValidationStage};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use vote_set::VoteBook;

/// Receives every finalized block (delivery and observability collaborators)
pub trait FinalitySink: Send + Sync {
    fn block_finalized(&self, block: &Arc<Block>);
}

/// Answers whether a transaction id refers to a known transaction
pub trait TransactionResolver: Send + Sync {
    fn resolve(&self, tx_id: &str) -> bool;
}

/// Resolver that knows every transaction
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAll;

impl TransactionResolver for AcceptAll {
    fn resolve(&self, _tx_id: &str) -> bool {
        true
    }
}

/// Pipeline sizing and timeouts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Capacity of each inter-stage queue
    pub queue_capacity: usize,
    /// How long a block may wait for a vote quorum
    pub aggregation_timeout_ms: u64,
    /// Pool of validation contexts
    pub validation_pool: PoolConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            aggregation_timeout_ms: 2_000,
            validation_pool: PoolConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn aggregation_timeout(&self) -> Duration {
        Duration::from_millis(self.aggregation_timeout_ms)
    }
}

#[derive(Debug, Default)]
pub(crate) struct PipelineCounters {
    submitted: AtomicU64,
    validated: AtomicU64,
    rejected: AtomicU64,
    finalized: AtomicU64,
    timed_out: AtomicU64,
}

/// Pipeline counters and queue depths
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineStats {
    pub submitted: u64,
    pub validated: u64,
    pub rejected: u64,
    pub finalized: u64,
    pub timed_out: u64,
    pub validation_queue: usize,
    pub aggregation_queue: usize,
    pub finalization_queue: usize,
}

/// Running three-stage pipeline
pub struct BlockPipeline {
    input: Mutex<Option<Sender<InFlight>>>,
    depths: [Receiver<InFlight>; 3],
    votes: Arc<VoteBook>,
    observed_term: AtomicU64,
    sinks: Arc<RwLock<Vec<Arc<dyn FinalitySink>>>>,
    counters: Arc<PipelineCounters>,
    validation_pool: ObjectPool<ValidationContext>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl BlockPipeline {
    /// Spawn the stage threads
    pub fn start(
        config: PipelineConfig,
        members: Vec<NodeId>,
        quorum: Arc<dyn QuorumPolicy>,
        resolver: Arc<dyn TransactionResolver>,
    ) -> Result<Self> {
        let capacity = config.queue_capacity.max(1);
        let (submit_tx, validate_rx) = bounded(capacity);
        let (validated_tx, aggregate_rx) = bounded(capacity);
        let (quorum_tx, finalize_rx) = bounded(capacity);

        let votes = Arc::new(VoteBook::default());
        let sinks: Arc<RwLock<Vec<Arc<dyn FinalitySink>>>> = Arc::new(RwLock::new(Vec::new()));
        let counters = Arc::new(PipelineCounters::default());
        let validation_pool = ObjectPool::new("validation_context", config.validation_pool.clone());
        let depths = [validate_rx.clone(), aggregate_rx.clone(), finalize_rx.clone()];

        let validation = ValidationStage {
            input: validate_rx,
            output: validated_tx,
            resolver,
            contexts: validation_pool.clone(),
            counters: counters.clone(),
        };
        let aggregation = AggregationStage {
            input: aggregate_rx,
            output: quorum_tx,
            votes: votes.clone(),
            quorum: quorum.clone(),
            members: members.clone(),
            timeout: config.aggregation_timeout(),
            counters: counters.clone(),
        };
        let finalization = FinalizationStage {
            input: finalize_rx,
            quorum,
            members,
            sinks: sinks.clone(),
            counters: counters.clone(),
        };

        let workers = vec![
            std::thread::Builder::new()
                .name("pipeline-validate".into())
                .spawn(move || validation.run())?,
            std::thread::Builder::new()
                .name("pipeline-aggregate".into())
                .spawn(move || aggregation.run())?,
            std::thread::Builder::new()
                .name("pipeline-finalize".into())
                .spawn(move || finalization.run())?,
        ];
        tracing::info!("Block pipeline started (queue capacity {})", capacity);

        Ok(Self {
            input: Mutex::new(Some(submit_tx)),
            depths,
            votes,
            observed_term: AtomicU64::new(0),
            sinks,
            counters,
            validation_pool,
            workers: Mutex::new(workers),
        })
    }

    /// Hand a block to the validation stage
    ///
    /// Blocks while the validation queue is full.
    pub fn submit(&self, block: Block) -> Result<FinalityReceipt> {
        let sender = self.input.lock().clone().ok_or(ConsensusError::Shutdown)?;
        let (done, receipt) = completion();
        let block_number = block.block_number;
        sender
            .send(InFlight {
                block,
                receipt: done,
            })
            .map_err(|_| ConsensusError::Shutdown)?;
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);
        tracing::trace!("Block {} submitted to pipeline", block_number);
        Ok(receipt)
    }

    /// Count `voter`'s vote for `block_number`; false if discarded
    pub fn record_vote(&self, block_number: u64, voter: &str) -> bool {
        self.votes.record(block_number, voter)
    }

    /// The proposing node reached `term`
    ///
    /// Blocks of earlier terms still short of a quorum fail with
    /// [`ConsensusError::StaleTerm`].
    pub fn observe_term(&self, term: u64) {
        if self.observed_term.fetch_max(term, Ordering::AcqRel) < term {
            self.votes.advance_term(term);
        }
    }

    pub fn add_sink(&self, sink: Arc<dyn FinalitySink>) {
        self.sinks.write().push(sink);
    }

    pub fn stats(&self) -> PipelineStats {
        let c = &self.counters;
        PipelineStats {
            submitted: c.submitted.load(Ordering::Relaxed),
            validated: c.validated.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
            finalized: c.finalized.load(Ordering::Relaxed),
            timed_out: c.timed_out.load(Ordering::Relaxed),
            validation_queue: self.depths[0].len(),
            aggregation_queue: self.depths[1].len(),
            finalization_queue: self.depths[2].len(),
        }
    }

    pub fn validation_pool(&self) -> &ObjectPool<ValidationContext> {
        &self.validation_pool
    }

    /// Stop accepting blocks, fail the ones still waiting for votes and join
    /// the stage threads
    pub fn shutdown(&self) {
        let Some(input) = self.input.lock().take() else {
            return;
        };
        drop(input);
        self.votes.shutdown();
        for worker in self.workers.lock().drain(..) {
            if worker.join().is_err() {
                tracing::error!("Pipeline stage panicked");
            }
        }
        tracing::info!("Block pipeline stopped");
    }
}

impl Drop for BlockPipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}
