//! Batching layer
//!
//! Both batchers accept items one at a time, hand each caller its own
//! completion handle, and group items into batches that flush on size or on a
//! time window. Every accepted item lands in exactly one batch and its handle
//! resolves exactly once, including on shutdown, which flushes what is pending.

mod message;
mod transaction;

pub use message::{
    MessageBatcher, MessageBatcherConfig, MessageBatcherStats, MessageSink, OutboundMessage,
};
pub use transaction::{
    BatchDelivery, Transaction, TransactionBatcher, TransactionBatcherConfig,
    TransactionBatcherStats, TransactionSink, TxIndex, TxReceipt,
};

/// Why a batch was flushed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FlushReason {
    Size,
    Timer,
    /// Explicit flush or shutdown
    Drain,
}
