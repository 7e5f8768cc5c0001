//! Transaction batching
//!
//! ```text
//! submit ──► [batcher thread] ──► TransactionSink::deliver ──► [completer thread]
//!   │          size / window          (propose block)            waits for finality
//!   └── CompletionHandle<TxReceipt> ◄───────────────────────────── resolves each item
//! ```
//!
//! Pending transactions sit in pooled [`TransactionContext`]s until their
//! batch completes. The [`TxIndex`] remembers submitted transactions so the
//! validation stage can resolve the ids a block references.

use super::FlushReason;
use crate::completion::{completion, Completion, CompletionHandle};
use crate::error::{ConsensusError, Result};
use crate::pipeline::{Block, FinalitySink, TransactionResolver};
use crate::pool::{ObjectPool, PoolConfig, Pooled, TransactionContext};
use crate::types::{now_millis, FinalityReceipt};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// A transaction submitted for ordering
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub tx_id: String,
    pub payload: Vec<u8>,
}

impl Transaction {
    pub fn new(tx_id: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            tx_id: tx_id.into(),
            payload,
        }
    }
}

/// Per-transaction outcome of a finalized batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxReceipt {
    pub tx_id: String,
    pub batch_id: u64,
    pub block_number: u64,
    pub log_index: u64,
}

/// What a sink returns for an accepted batch
#[derive(Debug)]
pub struct BatchDelivery {
    pub block_number: u64,
    pub log_index: u64,
    /// Resolves when the batch's block is finalized
    pub finality: FinalityReceipt,
}

/// Destination of flushed batches
pub trait TransactionSink: Send + Sync {
    fn deliver(&self, transaction_ids: Vec<String>) -> Result<BatchDelivery>;
}

/// Known transactions by id
#[derive(Debug, Default)]
pub struct TxIndex {
    transactions: DashMap<String, Vec<u8>>,
}

impl TxIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert unless already known; false for duplicates
    pub fn insert(&self, tx_id: &str, payload: &[u8]) -> bool {
        match self.transactions.entry(tx_id.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(payload.to_vec());
                true
            }
        }
    }

    pub fn contains(&self, tx_id: &str) -> bool {
        self.transactions.contains_key(tx_id)
    }

    pub fn payload(&self, tx_id: &str) -> Option<Vec<u8>> {
        self.transactions.get(tx_id).map(|p| p.value().clone())
    }

    pub fn remove(&self, tx_id: &str) {
        self.transactions.remove(tx_id);
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }
}

impl TransactionResolver for TxIndex {
    fn resolve(&self, tx_id: &str) -> bool {
        self.contains(tx_id)
    }
}

/// Finalized transactions are forgotten so they cannot be included again
impl FinalitySink for TxIndex {
    fn block_finalized(&self, block: &Arc<Block>) {
        for tx_id in &block.transaction_ids {
            self.remove(tx_id);
        }
    }
}

/// Transaction batcher configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionBatcherConfig {
    /// Items per batch before a forced flush
    pub max_batch_size: usize,
    /// Longest time the first item of a batch waits
    pub batch_window_ms: u64,
    /// How long the completer waits for a batch to be finalized
    pub completion_timeout_ms: u64,
    /// Submissions buffered ahead of the batcher thread
    pub queue_capacity: usize,
    /// Pool of transaction contexts
    pub pool: PoolConfig,
}

impl Default for TransactionBatcherConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 256,
            batch_window_ms: 5,
            completion_timeout_ms: 5_000,
            queue_capacity: 8_192,
            pool: PoolConfig {
                capacity: 8_192,
                ..Default::default()
            },
        }
    }
}

impl TransactionBatcherConfig {
    pub fn batch_window(&self) -> Duration {
        Duration::from_millis(self.batch_window_ms.max(1))
    }

    pub fn completion_timeout(&self) -> Duration {
        Duration::from_millis(self.completion_timeout_ms)
    }
}

/// Statistics for the transaction batcher
#[derive(Debug, Default)]
pub struct TransactionBatcherStats {
    pub submitted: AtomicU64,
    pub rejected: AtomicU64,
    pub batches_flushed: AtomicU64,
    pub items_flushed: AtomicU64,
    pub flushes_by_size: AtomicU64,
    pub flushes_by_timer: AtomicU64,
    pub completed: AtomicU64,
    pub failed: AtomicU64,
}

impl TransactionBatcherStats {
    pub fn avg_batch_size(&self) -> f64 {
        let batches = self.batches_flushed.load(Ordering::Relaxed);
        let items = self.items_flushed.load(Ordering::Relaxed);
        if batches == 0 {
            0.0
        } else {
            items as f64 / batches as f64
        }
    }

    fn count_flush(&self, reason: FlushReason, items: usize) {
        self.batches_flushed.fetch_add(1, Ordering::Relaxed);
        self.items_flushed.fetch_add(items as u64, Ordering::Relaxed);
        match reason {
            FlushReason::Size => self.flushes_by_size.fetch_add(1, Ordering::Relaxed),
            FlushReason::Timer => self.flushes_by_timer.fetch_add(1, Ordering::Relaxed),
            FlushReason::Drain => 0,
        };
    }
}

struct PendingTx {
    ctx: Pooled<TransactionContext>,
    done: Completion<Result<TxReceipt>>,
}

enum Command {
    Submit(PendingTx),
    Flush,
    Shutdown,
}

struct InFlightBatch {
    batch_id: u64,
    delivery: BatchDelivery,
    items: Vec<PendingTx>,
}

/// Groups submitted transactions into blocks
pub struct TransactionBatcher {
    tx: Sender<Command>,
    contexts: ObjectPool<TransactionContext>,
    index: Arc<TxIndex>,
    stats: Arc<TransactionBatcherStats>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl TransactionBatcher {
    /// Spawn the batcher and completer threads
    pub fn start(
        config: TransactionBatcherConfig,
        sink: Arc<dyn TransactionSink>,
        index: Arc<TxIndex>,
    ) -> Result<Self> {
        let (tx, rx) = bounded(config.queue_capacity.max(1));
        let (completer_tx, completer_rx) = bounded(config.queue_capacity.max(1));
        let stats = Arc::new(TransactionBatcherStats::default());
        let contexts = ObjectPool::new("transaction_context", config.pool.clone());

        let batcher = BatchLoop {
            config: config.clone(),
            sink,
            index: index.clone(),
            stats: stats.clone(),
            completer: completer_tx,
            pending: Vec::with_capacity(config.max_batch_size),
            window_start: None,
            next_batch_id: 1,
        };
        let completer = CompleterLoop {
            timeout: config.completion_timeout(),
            index: index.clone(),
            stats: stats.clone(),
        };

        let workers = vec![
            std::thread::Builder::new()
                .name("tx-batcher".into())
                .spawn(move || batcher.run(rx))?,
            std::thread::Builder::new()
                .name("tx-completer".into())
                .spawn(move || completer.run(completer_rx))?,
        ];
        tracing::info!(
            "Transaction batcher started (max batch {}, window {}ms)",
            config.max_batch_size,
            config.batch_window_ms
        );

        Ok(Self {
            tx,
            contexts,
            index,
            stats,
            workers: Mutex::new(workers),
        })
    }

    /// Queue a transaction; the handle resolves with its receipt or failure
    pub fn submit(&self, transaction: Transaction) -> CompletionHandle<Result<TxReceipt>> {
        let mut ctx = match self.contexts.acquire() {
            Ok(ctx) => ctx,
            Err(e) => {
                self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                return CompletionHandle::ready(Err(e));
            }
        };
        if !self.index.insert(&transaction.tx_id, &transaction.payload) {
            self.stats.rejected.fetch_add(1, Ordering::Relaxed);
            return CompletionHandle::ready(Err(ConsensusError::BatchFailed {
                reason: format!("duplicate transaction {}", transaction.tx_id),
            }));
        }

        ctx.tx_id = transaction.tx_id;
        ctx.payload = transaction.payload;
        ctx.received_at = now_millis();
        let (done, handle) = completion();

        match self.tx.send(Command::Submit(PendingTx { ctx, done })) {
            Ok(()) => {
                self.stats.submitted.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                if let Command::Submit(pending) = e.into_inner() {
                    self.index.remove(&pending.ctx.tx_id);
                    pending.done.resolve(Err(ConsensusError::Shutdown));
                }
            }
        }
        handle
    }

    /// Flush the pending batch now
    pub fn flush(&self) {
        let _ = self.tx.send(Command::Flush);
    }

    pub fn stats(&self) -> &TransactionBatcherStats {
        &self.stats
    }

    pub fn pool(&self) -> &ObjectPool<TransactionContext> {
        &self.contexts
    }

    pub fn index(&self) -> &Arc<TxIndex> {
        &self.index
    }

    /// Flush what is pending and stop both threads
    pub fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown);
        for worker in self.workers.lock().drain(..) {
            if worker.join().is_err() {
                tracing::error!("Transaction batcher thread panicked");
            }
        }
    }
}

impl Drop for TransactionBatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct BatchLoop {
    config: TransactionBatcherConfig,
    sink: Arc<dyn TransactionSink>,
    index: Arc<TxIndex>,
    stats: Arc<TransactionBatcherStats>,
    completer: Sender<InFlightBatch>,
    pending: Vec<PendingTx>,
    window_start: Option<Instant>,
    next_batch_id: u64,
}

impl BatchLoop {
    fn run(mut self, rx: Receiver<Command>) {
        let window = self.config.batch_window();
        loop {
            let wait = match self.window_start {
                Some(start) => (start + window).saturating_duration_since(Instant::now()),
                None => window,
            };
            match rx.recv_timeout(wait) {
                Ok(Command::Submit(item)) => {
                    if self.pending.is_empty() {
                        self.window_start = Some(Instant::now());
                    }
                    self.pending.push(item);
                    if self.pending.len() >= self.config.max_batch_size {
                        self.flush(FlushReason::Size);
                    } else if self.window_expired(window) {
                        self.flush(FlushReason::Timer);
                    }
                }
                Ok(Command::Flush) => self.flush(FlushReason::Drain),
                Ok(Command::Shutdown) | Err(RecvTimeoutError::Disconnected) => {
                    // submissions that raced the shutdown still get a batch
                    while let Ok(Command::Submit(item)) = rx.try_recv() {
                        self.pending.push(item);
                    }
                    self.flush(FlushReason::Drain);
                    break;
                }
                Err(RecvTimeoutError::Timeout) => {
                    if self.window_expired(window) {
                        self.flush(FlushReason::Timer);
                    }
                }
            }
        }
        tracing::debug!("Transaction batcher stopped");
    }

    fn window_expired(&self, window: Duration) -> bool {
        self.window_start
            .map_or(false, |start| start.elapsed() >= window)
    }

    fn flush(&mut self, reason: FlushReason) {
        self.window_start = None;
        if self.pending.is_empty() {
            return;
        }
        let items = std::mem::take(&mut self.pending);
        let batch_id = self.next_batch_id;
        self.next_batch_id += 1;
        self.stats.count_flush(reason, items.len());

        let ids: Vec<String> = items.iter().map(|item| item.ctx.tx_id.clone()).collect();
        tracing::debug!(
            "Flushing batch {} with {} transactions ({:?})",
            batch_id,
            ids.len(),
            reason
        );

        match self.sink.deliver(ids) {
            Ok(delivery) => {
                let batch = InFlightBatch {
                    batch_id,
                    delivery,
                    items,
                };
                if let Err(e) = self.completer.send(batch) {
                    let items = e.into_inner().items;
                    fail_items(&self.index, &self.stats, items, ConsensusError::Shutdown);
                }
            }
            Err(e) => {
                tracing::warn!("Batch {} was not accepted: {}", batch_id, e);
                fail_items(&self.index, &self.stats, items, e);
            }
        }
    }
}

struct CompleterLoop {
    timeout: Duration,
    index: Arc<TxIndex>,
    stats: Arc<TransactionBatcherStats>,
}

impl CompleterLoop {
    fn run(self, rx: Receiver<InFlightBatch>) {
        for batch in rx.iter() {
            let outcome = batch
                .delivery
                .finality
                .wait_timeout(self.timeout)
                .and_then(|result| result);
            match outcome {
                Ok(commit) => {
                    self.stats
                        .completed
                        .fetch_add(batch.items.len() as u64, Ordering::Relaxed);
                    for item in batch.items {
                        let receipt = TxReceipt {
                            tx_id: item.ctx.tx_id.clone(),
                            batch_id: batch.batch_id,
                            block_number: commit.block_number,
                            log_index: commit.log_index,
                        };
                        item.done.resolve(Ok(receipt));
                    }
                }
                Err(e) => {
                    tracing::warn!("Batch {} did not finalize: {}", batch.batch_id, e);
                    fail_items(&self.index, &self.stats, batch.items, e);
                }
            }
        }
        tracing::debug!("Transaction completer stopped");
    }
}

fn fail_items(
    index: &TxIndex,
    stats: &TransactionBatcherStats,
    items: Vec<PendingTx>,
    error: ConsensusError,
) {
    stats.failed.fetch_add(items.len() as u64, Ordering::Relaxed);
    for item in items {
        index.remove(&item.ctx.tx_id);
        item.done.resolve(Err(error.clone()));
    }
}
