//! Ledger Consensus - Raft-family replication with a pipelined finality path
//!
//! Architecture:
//! - `RaftNode` elects a leader and replicates an ordered command log
//! - Blocks are log entries; the leader also drives them through a
//!   validate -> vote -> finalize pipeline
//! - Transactions and outbound messages are batched on size or time windows
//! - Hot-path contexts and buffers come from bounded object pools

pub mod types;
pub mod config;
pub mod error;
pub mod completion;
pub mod pool;
pub mod quorum;
pub mod log;
pub mod storage;
pub mod snapshot;
mod role;
pub mod raft;
pub mod node;
pub mod transport;
pub mod events;
pub mod pipeline;
pub mod batch;

pub use types::*;
pub use config::ConsensusConfig;
pub use error::{ConsensusError, Result};
pub use completion::{completion, Completion, CompletionHandle};
pub use pool::{
    ExhaustionPolicy, MessageBuffer, ObjectPool, PoolConfig, PoolStats, Poolable, Pooled,
    TransactionContext, ValidationContext,
};
pub use quorum::{Majority, QuorumPolicy, Weighted};
pub use storage::{HardState, LogStorage, MemoryStorage};
pub use snapshot::Snapshot;
pub use role::PeerProgress;
pub use log::RaftLog;
pub use raft::{RaftCore, ReplicationOutcome, ReplicationRequest};
pub use node::{NodeMetrics, RaftNode, RaftNodeBuilder};
pub use transport::{LocalNetwork, LocalTransport, PeerTransport, RpcHandler};
pub use events::{EventHub, EventStream};
pub use pipeline::{
    AcceptAll, Block, BlockPipeline, FinalitySink, PipelineConfig, PipelineStats,
    TransactionResolver, VoteSet,
};
pub use batch::{
    BatchDelivery, MessageBatcher, MessageBatcherConfig, MessageBatcherStats, MessageSink,
    OutboundMessage, Transaction, TransactionBatcher, TransactionBatcherConfig,
    TransactionBatcherStats, TransactionSink, TxIndex, TxReceipt,
};
