//! Batched outbound messages
//!
//! Messages for the same peer are accumulated and sent together as one buffer
//! of length-prefixed borsh frames. A peer's batch flushes when it reaches
//! `max_batch_size` or when its oldest message has waited `flush_interval`.

use super::FlushReason;
use crate::completion::{completion, Completion, CompletionHandle};
use crate::error::{ConsensusError, Result};
use crate::pool::{MessageBuffer, ObjectPool, PoolConfig, Pooled};
use crate::types::NodeId;
use borsh::{BorshDeserialize, BorshSerialize};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// One message for one peer
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub peer: NodeId,
    pub topic: String,
    pub payload: Vec<u8>,
}

impl OutboundMessage {
    pub fn new(peer: impl Into<NodeId>, topic: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            peer: peer.into(),
            topic: topic.into(),
            payload,
        }
    }

    /// Decode every message framed into a flushed buffer
    pub fn decode_frames(bytes: &[u8]) -> Result<Vec<OutboundMessage>> {
        MessageBuffer::frames(bytes)?
            .into_iter()
            .map(|frame| {
                borsh::from_slice(frame).map_err(|e| ConsensusError::Encoding(e.to_string()))
            })
            .collect()
    }
}

/// Where flushed batches go
pub trait MessageSink: Send + Sync {
    fn send_batch(&self, peer: &str, buffer: &MessageBuffer) -> Result<()>;
}

/// Message batcher configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MessageBatcherConfig {
    /// Longest time a message waits before its batch is flushed
    pub flush_interval_ms: u64,
    /// Messages per peer batch before a forced flush
    pub max_batch_size: usize,
    /// Messages buffered ahead of the batcher thread
    pub queue_capacity: usize,
    /// Pool of framing buffers
    pub pool: PoolConfig,
}

impl Default for MessageBatcherConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: 50,
            max_batch_size: 64,
            queue_capacity: 4_096,
            pool: PoolConfig {
                capacity: 64,
                ..Default::default()
            },
        }
    }
}

impl MessageBatcherConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms.max(1))
    }
}

/// Statistics for the message batcher
#[derive(Debug, Default)]
pub struct MessageBatcherStats {
    pub items_queued: AtomicU64,
    pub batches_sent: AtomicU64,
    pub items_sent: AtomicU64,
    pub send_failures: AtomicU64,
    pub flushes_by_size: AtomicU64,
    pub flushes_by_timer: AtomicU64,
}

impl MessageBatcherStats {
    pub fn avg_batch_size(&self) -> f64 {
        let batches = self.batches_sent.load(Ordering::Relaxed);
        let items = self.items_sent.load(Ordering::Relaxed);
        if batches == 0 {
            0.0
        } else {
            items as f64 / batches as f64
        }
    }
}

struct Queued {
    message: OutboundMessage,
    done: Completion<Result<()>>,
}

enum Command {
    Queue(Queued),
    Flush,
    Shutdown,
}

#[derive(Default)]
struct PendingBatch {
    items: Vec<Queued>,
    first_item_time: Option<Instant>,
}

/// Handle for queueing outbound messages
pub struct MessageBatcher {
    tx: Sender<Command>,
    stats: Arc<MessageBatcherStats>,
    buffers: ObjectPool<MessageBuffer>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl MessageBatcher {
    pub fn start(config: MessageBatcherConfig, sink: Arc<dyn MessageSink>) -> Result<Self> {
        let (tx, rx) = bounded(config.queue_capacity.max(1));
        let stats = Arc::new(MessageBatcherStats::default());
        let buffers = ObjectPool::new("message_buffer", config.pool.clone());

        let worker = FlushLoop {
            config,
            sink,
            stats: stats.clone(),
            buffers: buffers.clone(),
            pending: HashMap::new(),
        };
        let handle = std::thread::Builder::new()
            .name("msg-batcher".into())
            .spawn(move || worker.run(rx))?;

        Ok(Self {
            tx,
            stats,
            buffers,
            worker: Mutex::new(Some(handle)),
        })
    }

    /// Queue a message; the handle resolves once its batch was sent
    pub fn queue(&self, message: OutboundMessage) -> CompletionHandle<Result<()>> {
        let (done, handle) = completion();
        match self.tx.send(Command::Queue(Queued { message, done })) {
            Ok(()) => {
                self.stats.items_queued.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                if let Command::Queue(queued) = e.into_inner() {
                    queued.done.resolve(Err(ConsensusError::Shutdown));
                }
            }
        }
        handle
    }

    /// Force flush all pending batches
    pub fn flush(&self) {
        let _ = self.tx.send(Command::Flush);
    }

    pub fn stats(&self) -> &MessageBatcherStats {
        &self.stats
    }

    pub fn pool(&self) -> &ObjectPool<MessageBuffer> {
        &self.buffers
    }

    /// Flush everything pending and stop the batcher thread
    pub fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown);
        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                tracing::error!("Message batcher thread panicked");
            }
        }
    }
}

impl Drop for MessageBatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct FlushLoop {
    config: MessageBatcherConfig,
    sink: Arc<dyn MessageSink>,
    stats: Arc<MessageBatcherStats>,
    buffers: ObjectPool<MessageBuffer>,
    pending: HashMap<NodeId, PendingBatch>,
}

impl FlushLoop {
    fn run(mut self, rx: Receiver<Command>) {
        loop {
            // sleep until the oldest pending batch is due
            let received = match self.next_deadline() {
                Some(deadline) => rx.recv_deadline(deadline),
                None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
            };
            match received {
                Ok(Command::Queue(item)) => self.queue_item(item),
                Ok(Command::Flush) => self.flush_all(),
                Ok(Command::Shutdown) | Err(RecvTimeoutError::Disconnected) => {
                    while let Ok(Command::Queue(item)) = rx.try_recv() {
                        self.queue_item(item);
                    }
                    self.flush_all();
                    tracing::debug!("Message batcher shutting down");
                    return;
                }
                Err(RecvTimeoutError::Timeout) => {}
            }
            self.flush_expired();
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        let interval = self.config.flush_interval();
        self.pending
            .values()
            .filter_map(|batch| batch.first_item_time)
            .min()
            .map(|first| first + interval)
    }

    fn queue_item(&mut self, item: Queued) {
        let peer = item.message.peer.clone();
        let batch = self.pending.entry(peer.clone()).or_default();
        if batch.first_item_time.is_none() {
            batch.first_item_time = Some(Instant::now());
        }
        batch.items.push(item);

        if batch.items.len() >= self.config.max_batch_size {
            self.flush_peer(&peer, FlushReason::Size);
        }
    }

    fn flush_expired(&mut self) {
        let now = Instant::now();
        let interval = self.config.flush_interval();
        let expired: Vec<NodeId> = self
            .pending
            .iter()
            .filter(|(_, batch)| {
                batch
                    .first_item_time
                    .map(|t| now.duration_since(t) >= interval)
                    .unwrap_or(false)
            })
            .map(|(peer, _)| peer.clone())
            .collect();

        for peer in expired {
            self.flush_peer(&peer, FlushReason::Timer);
        }
    }

    fn flush_all(&mut self) {
        let peers: Vec<NodeId> = self.pending.keys().cloned().collect();
        for peer in peers {
            self.flush_peer(&peer, FlushReason::Drain);
        }
    }

    fn flush_peer(&mut self, peer: &str, reason: FlushReason) {
        let Some(batch) = self.pending.remove(peer) else {
            return;
        };
        if batch.items.is_empty() {
            return;
        }
        match reason {
            FlushReason::Size => self.stats.flushes_by_size.fetch_add(1, Ordering::Relaxed),
            FlushReason::Timer => self.stats.flushes_by_timer.fetch_add(1, Ordering::Relaxed),
            FlushReason::Drain => 0,
        };

        let count = batch.items.len();
        let result = self
            .encode(&batch.items)
            .and_then(|buffer| self.sink.send_batch(peer, &buffer));

        match &result {
            Ok(()) => {
                tracing::trace!("Flushed {} messages to {}", count, peer);
                self.stats.batches_sent.fetch_add(1, Ordering::Relaxed);
                self.stats
                    .items_sent
                    .fetch_add(count as u64, Ordering::Relaxed);
            }
            Err(e) => {
                tracing::debug!("Failed to send batch of {} to {}: {}", count, peer, e);
                self.stats.send_failures.fetch_add(1, Ordering::Relaxed);
            }
        }
        for item in batch.items {
            item.done.resolve(result.clone());
        }
    }

    fn encode(&self, items: &[Queued]) -> Result<Pooled<MessageBuffer>> {
        let mut buffer = self.buffers.acquire()?;
        for item in items {
            let frame =
                borsh::to_vec(&item.message).map_err(|e| ConsensusError::Encoding(e.to_string()))?;
            buffer.push_frame(&frame);
        }
        Ok(buffer)
    }
}
