//! Persistence interface consumed by the consensus core
//!
//! The storage engine itself lives outside this crate. The core only needs
//! durable append, point reads, truncation on both ends, the hard state
//! (term + vote) and the latest snapshot. [`MemoryStorage`] backs tests and the
//! in-process cluster.

use crate::error::Result;
use crate::snapshot::Snapshot;
use crate::types::{LogEntry, NodeId};
use parking_lot::RwLock;
use std::collections::BTreeMap;

/// Durable state that must survive a restart before an RPC is answered
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HardState {
    pub current_term: u64,
    pub voted_for: Option<NodeId>,
}

/// Durable log and snapshot storage
pub trait LogStorage: Send + Sync {
    /// Append entries (indices follow the last stored entry)
    fn append(&self, entries: &[LogEntry]) -> Result<()>;

    /// Read the entry at `index`
    fn entry(&self, index: u64) -> Result<Option<LogEntry>>;

    /// All stored entries in index order (crash recovery)
    fn entries(&self) -> Result<Vec<LogEntry>>;

    /// Drop entries at or after `index` (conflict resolution)
    fn truncate_from(&self, index: u64) -> Result<()>;

    /// Drop entries before `index` (compaction)
    fn truncate_before(&self, index: u64) -> Result<()>;

    fn save_hard_state(&self, state: &HardState) -> Result<()>;

    fn load_hard_state(&self) -> Result<HardState>;

    fn save_snapshot(&self, snapshot: &Snapshot) -> Result<()>;

    fn load_snapshot(&self) -> Result<Option<Snapshot>>;
}

/// In-memory storage; nothing survives the process
#[derive(Default)]
pub struct MemoryStorage {
    log: RwLock<BTreeMap<u64, LogEntry>>,
    hard_state: RwLock<HardState>,
    snapshot: RwLock<Option<Snapshot>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.log.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.log.read().is_empty()
    }
}

impl LogStorage for MemoryStorage {
    fn append(&self, entries: &[LogEntry]) -> Result<()> {
        let mut log = self.log.write();
        for entry in entries {
            log.insert(entry.index, entry.clone());
        }
        Ok(())
    }

    fn entry(&self, index: u64) -> Result<Option<LogEntry>> {
        Ok(self.log.read().get(&index).cloned())
    }

    fn entries(&self) -> Result<Vec<LogEntry>> {
        Ok(self.log.read().values().cloned().collect())
    }

    fn truncate_from(&self, index: u64) -> Result<()> {
        self.log.write().split_off(&index);
        Ok(())
    }

    fn truncate_before(&self, index: u64) -> Result<()> {
        let mut log = self.log.write();
        let kept = log.split_off(&index);
        *log = kept;
        Ok(())
    }

    fn save_hard_state(&self, state: &HardState) -> Result<()> {
        *self.hard_state.write() = state.clone();
        Ok(())
    }

    fn load_hard_state(&self) -> Result<HardState> {
        Ok(self.hard_state.read().clone())
    }

    fn save_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        *self.snapshot.write() = Some(snapshot.clone());
        Ok(())
    }

    fn load_snapshot(&self) -> Result<Option<Snapshot>> {
        Ok(self.snapshot.read().clone())
    }
}
