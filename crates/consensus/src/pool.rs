//! Bounded object pool for hot-path scratch objects
//!
//! Instances are created lazily up to `capacity` and recycled through a
//! bounded free list. [`ObjectPool::acquire`] hands out a [`Pooled`] guard with
//! exclusive ownership; dropping the guard resets the instance and returns it.
//!
//! Exhaustion (every instance checked out) is governed by
//! [`ExhaustionPolicy`]: either wait for a release up to a deadline, or hand
//! out a fresh unpooled instance that is discarded on release if the free list
//! is already full.

use crate::error::{ConsensusError, Result};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Objects that can be recycled by an [`ObjectPool`]
pub trait Poolable: Default + Send + 'static {
    /// Clear every field back to its default, keeping allocations
    fn reset(&mut self);
}

/// What `acquire` does when every instance is checked out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExhaustionPolicy {
    /// Wait for a release; fail with `PoolExhausted` after `timeout_ms`
    Block { timeout_ms: u64 },
    /// Fall back to a fresh allocation outside the pool
    Allocate,
}

/// Pool sizing and exhaustion policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub capacity: usize,
    pub exhaustion: ExhaustionPolicy,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity: 256,
            exhaustion: ExhaustionPolicy::Allocate,
        }
    }
}

/// Pool counters (pull-based)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PoolStats {
    pub total_acquires: u64,
    pub total_releases: u64,
    pub reused_acquires: u64,
    /// Pooled instances constructed so far (never exceeds capacity)
    pub created: usize,
    /// Instances currently checked out, pooled or not
    pub in_use: u64,
    /// `reused_acquires / total_acquires`, 0 when cold
    pub hit_rate: f64,
}

struct PoolInner<T> {
    name: &'static str,
    free_tx: Sender<T>,
    free_rx: Receiver<T>,
    capacity: usize,
    created: AtomicUsize,
    exhaustion: ExhaustionPolicy,
    acquires: AtomicU64,
    releases: AtomicU64,
    reused: AtomicU64,
}

/// Thread-safe bounded pool
pub struct ObjectPool<T: Poolable> {
    inner: Arc<PoolInner<T>>,
}

impl<T: Poolable> Clone for ObjectPool<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Poolable> ObjectPool<T> {
    pub fn new(name: &'static str, config: PoolConfig) -> Self {
        let capacity = config.capacity.max(1);
        let (free_tx, free_rx) = bounded(capacity);
        Self {
            inner: Arc::new(PoolInner {
                name,
                free_tx,
                free_rx,
                capacity,
                created: AtomicUsize::new(0),
                exhaustion: config.exhaustion,
                acquires: AtomicU64::new(0),
                releases: AtomicU64::new(0),
                reused: AtomicU64::new(0),
            }),
        }
    }

    /// Check out an instance
    pub fn acquire(&self) -> Result<Pooled<T>> {
        let inner = &self.inner;

        if let Ok(value) = inner.free_rx.try_recv() {
            inner.acquires.fetch_add(1, Ordering::Relaxed);
            inner.reused.fetch_add(1, Ordering::Relaxed);
            return Ok(self.guard(value));
        }

        if self.try_reserve_slot() {
            inner.acquires.fetch_add(1, Ordering::Relaxed);
            return Ok(self.guard(T::default()));
        }

        match inner.exhaustion {
            ExhaustionPolicy::Allocate => {
                inner.acquires.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(pool = inner.name, "pool exhausted, allocating fresh instance");
                Ok(self.guard(T::default()))
            }
            ExhaustionPolicy::Block { timeout_ms } => {
                match inner.free_rx.recv_timeout(Duration::from_millis(timeout_ms)) {
                    Ok(value) => {
                        inner.acquires.fetch_add(1, Ordering::Relaxed);
                        inner.reused.fetch_add(1, Ordering::Relaxed);
                        Ok(self.guard(value))
                    }
                    Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                        tracing::warn!(pool = inner.name, "pool exhausted");
                        Err(ConsensusError::PoolExhausted { pool: inner.name })
                    }
                }
            }
        }
    }

    /// Explicit release; same as dropping the guard
    pub fn release(&self, object: Pooled<T>) {
        drop(object);
    }

    pub fn stats(&self) -> PoolStats {
        let inner = &self.inner;
        let acquires = inner.acquires.load(Ordering::Relaxed);
        let releases = inner.releases.load(Ordering::Relaxed);
        let reused = inner.reused.load(Ordering::Relaxed);
        PoolStats {
            total_acquires: acquires,
            total_releases: releases,
            reused_acquires: reused,
            created: inner.created.load(Ordering::Relaxed),
            in_use: acquires.saturating_sub(releases),
            hit_rate: if acquires == 0 {
                0.0
            } else {
                reused as f64 / acquires as f64
            },
        }
    }

    /// Instances sitting in the free list
    pub fn available(&self) -> usize {
        self.inner.free_rx.len()
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    fn try_reserve_slot(&self) -> bool {
        self.inner
            .created
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |created| {
                (created < self.inner.capacity).then_some(created + 1)
            })
            .is_ok()
    }

    fn guard(&self, value: T) -> Pooled<T> {
        Pooled {
            object: value,
            pool: self.inner.clone(),
        }
    }
}

/// Exclusive handle to a pooled instance
pub struct Pooled<T: Poolable> {
    object: T,
    pool: Arc<PoolInner<T>>,
}

impl<T: Poolable> Deref for Pooled<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.object
    }
}

impl<T: Poolable> DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.object
    }
}

impl<T: Poolable> Drop for Pooled<T> {
    fn drop(&mut self) {
        let mut value = std::mem::take(&mut self.object);
        value.reset();
        self.pool.releases.fetch_add(1, Ordering::Relaxed);
        // A full free list means this was an overflow allocation
        let _ = self.pool.free_tx.try_send(value);
    }
}

// -- pooled hot-path objects --

/// Scratch state for one submitted transaction
#[derive(Debug, Default)]
pub struct TransactionContext {
    pub tx_id: String,
    pub payload: Vec<u8>,
    pub received_at: i64,
}

impl Poolable for TransactionContext {
    fn reset(&mut self) {
        self.tx_id.clear();
        self.payload.clear();
        self.received_at = 0;
    }
}

/// Scratch state for validating one block
#[derive(Debug, Default)]
pub struct ValidationContext {
    pub block_number: u64,
    pub seen_tx_ids: HashSet<String>,
    pub errors: Vec<String>,
}

impl ValidationContext {
    pub fn fail(&mut self, reason: impl Into<String>) {
        self.errors.push(reason.into());
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

impl Poolable for ValidationContext {
    fn reset(&mut self) {
        self.block_number = 0;
        self.seen_tx_ids.clear();
        self.errors.clear();
    }
}

/// Reusable byte buffer for framing outbound messages
#[derive(Debug, Default)]
pub struct MessageBuffer {
    pub bytes: Vec<u8>,
    pub message_count: usize,
}

impl MessageBuffer {
    /// Append one length-prefixed frame
    pub fn push_frame(&mut self, frame: &[u8]) {
        self.bytes.extend_from_slice(&(frame.len() as u32).to_le_bytes());
        self.bytes.extend_from_slice(frame);
        self.message_count += 1;
    }

    /// Split a buffer produced by [`MessageBuffer::push_frame`] back into frames
    pub fn frames(bytes: &[u8]) -> Result<Vec<&[u8]>> {
        let mut frames = Vec::new();
        let mut rest = bytes;
        while !rest.is_empty() {
            if rest.len() < 4 {
                return Err(ConsensusError::Encoding("truncated frame header".into()));
            }
            let (header, body) = rest.split_at(4);
            let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
            if body.len() < len {
                return Err(ConsensusError::Encoding("truncated frame body".into()));
            }
            let (frame, tail) = body.split_at(len);
            frames.push(frame);
            rest = tail;
        }
        Ok(frames)
    }
}

impl Poolable for MessageBuffer {
    fn reset(&mut self) {
        self.bytes.clear();
        self.message_count = 0;
    }
}
