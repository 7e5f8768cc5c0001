//! In-memory view of the replicated log
//!
//! Indices are 1-based and contiguous. Entries up to `snapshot_index` live only
//! in the installed snapshot; `entries[i]` has index `snapshot_index + 1 + i`.

use crate::types::LogEntry;

/// Result of merging leader entries into the local log
#[derive(Debug, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    /// First index of a conflicting suffix that was dropped
    pub truncated_from: Option<u64>,
    /// Entries that were actually added
    pub appended: Vec<LogEntry>,
}

#[derive(Debug, Default, Clone)]
pub struct RaftLog {
    entries: Vec<LogEntry>,
    snapshot_index: u64,
    snapshot_term: u64,
}

impl RaftLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from persisted state
    pub fn restore(snapshot_index: u64, snapshot_term: u64, entries: Vec<LogEntry>) -> Self {
        let entries = entries
            .into_iter()
            .filter(|e| e.index > snapshot_index)
            .collect();
        Self {
            entries,
            snapshot_index,
            snapshot_term,
        }
    }

    pub fn last_index(&self) -> u64 {
        self.snapshot_index + self.entries.len() as u64
    }

    pub fn last_term(&self) -> u64 {
        self.entries
            .last()
            .map(|e| e.term)
            .unwrap_or(self.snapshot_term)
    }

    /// Number of entries held (compacted prefix excluded)
    pub fn len(&self) -> u64 {
        self.entries.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn snapshot_index(&self) -> u64 {
        self.snapshot_index
    }

    pub fn snapshot_term(&self) -> u64 {
        self.snapshot_term
    }

    /// Term of the entry at `index`; `None` if compacted away or past the end
    pub fn term_at(&self, index: u64) -> Option<u64> {
        if index == self.snapshot_index {
            return Some(self.snapshot_term);
        }
        self.entry(index).map(|e| e.term)
    }

    pub fn entry(&self, index: u64) -> Option<&LogEntry> {
        if index <= self.snapshot_index {
            return None;
        }
        self.entries.get((index - self.snapshot_index - 1) as usize)
    }

    /// Consistency check for AppendEntries
    pub fn matches(&self, prev_index: u64, prev_term: u64) -> bool {
        self.term_at(prev_index) == Some(prev_term)
    }

    /// First index (after the snapshot) holding the same term as `index`
    pub fn first_index_of_term(&self, index: u64) -> u64 {
        let Some(term) = self.term_at(index) else {
            return self.last_index() + 1;
        };
        let mut first = index;
        while first > self.snapshot_index + 1 && self.term_at(first - 1) == Some(term) {
            first -= 1;
        }
        first.max(self.snapshot_index + 1)
    }

    /// Candidate log at least as up to date as ours
    pub fn is_up_to_date(&self, last_log_term: u64, last_log_index: u64) -> bool {
        let our_term = self.last_term();
        last_log_term > our_term
            || (last_log_term == our_term && last_log_index >= self.last_index())
    }

    /// Append one entry at the tail
    pub fn push(&mut self, entry: LogEntry) {
        debug_assert_eq!(entry.index, self.last_index() + 1);
        self.entries.push(entry);
    }

    /// Merge leader entries, dropping only a suffix that actually conflicts
    ///
    /// Entries already present with the same term are left untouched so a
    /// stale or reordered request never shortens the log.
    pub fn merge(&mut self, entries: &[LogEntry]) -> MergeOutcome {
        let mut outcome = MergeOutcome::default();
        for entry in entries {
            if entry.index <= self.snapshot_index {
                continue;
            }
            match self.term_at(entry.index) {
                Some(term) if term == entry.term => continue,
                Some(_) => {
                    self.truncate_from(entry.index);
                    outcome.truncated_from.get_or_insert(entry.index);
                }
                None => {}
            }
            if entry.index != self.last_index() + 1 {
                // gap: the consistency check guarantees this cannot happen
                break;
            }
            self.entries.push(entry.clone());
            outcome.appended.push(entry.clone());
        }
        outcome
    }

    /// Drop every entry at or after `index`
    pub fn truncate_from(&mut self, index: u64) {
        if index <= self.snapshot_index {
            self.entries.clear();
            return;
        }
        let keep = (index - self.snapshot_index - 1) as usize;
        self.entries.truncate(keep);
    }

    /// Up to `max` entries starting at `start`
    pub fn entries_from(&self, start: u64, max: usize) -> Vec<LogEntry> {
        if start <= self.snapshot_index || start > self.last_index() {
            return Vec::new();
        }
        let offset = (start - self.snapshot_index - 1) as usize;
        self.entries[offset..].iter().take(max).cloned().collect()
    }

    /// Discard everything covered by a snapshot ending at `index`/`term`
    ///
    /// If our entry at `index` carries the same term, the suffix after it is
    /// kept; otherwise the whole log is superseded by the snapshot.
    pub fn compact_through(&mut self, index: u64, term: u64) {
        if index <= self.snapshot_index {
            return;
        }
        if self.term_at(index) == Some(term) {
            let drop = (index - self.snapshot_index) as usize;
            self.entries.drain(..drop);
        } else {
            self.entries.clear();
        }
        self.snapshot_index = index;
        self.snapshot_term = term;
    }
}
