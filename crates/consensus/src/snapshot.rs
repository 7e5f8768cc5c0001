//! Snapshots and chunked snapshot transfer

use serde::{Deserialize, Serialize};

/// Application state covering the log through `last_included_index`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub last_included_index: u64,
    pub last_included_term: u64,
    pub data: Vec<u8>,
}

impl Snapshot {
    /// The chunk starting at `offset`, and whether it is the last one
    pub fn chunk(&self, offset: u64, chunk_size: usize) -> (&[u8], bool) {
        let start = (offset as usize).min(self.data.len());
        let end = start.saturating_add(chunk_size.max(1)).min(self.data.len());
        (&self.data[start..end], end == self.data.len())
    }
}

/// What happened to an incoming chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// Buffered, more chunks expected
    Buffered,
    /// Last chunk arrived; the assembled snapshot is ready to install
    Complete(Snapshot),
    /// Offset leaves a gap; the sender must resend from the buffered length
    Gap { expected_offset: u64 },
}

/// Reassembles a snapshot from chunks written by offset
///
/// A chunk for a different snapshot point, or at offset 0, restarts the
/// buffer. Re-sent chunks overwrite what was buffered from their offset.
#[derive(Debug, Default)]
pub struct SnapshotBuffer {
    last_included_index: u64,
    last_included_term: u64,
    data: Vec<u8>,
}

impl SnapshotBuffer {
    pub fn accept(
        &mut self,
        last_included_index: u64,
        last_included_term: u64,
        offset: u64,
        chunk: &[u8],
        done: bool,
    ) -> ChunkOutcome {
        let same_snapshot = self.last_included_index == last_included_index
            && self.last_included_term == last_included_term;
        if offset == 0 || !same_snapshot {
            self.last_included_index = last_included_index;
            self.last_included_term = last_included_term;
            self.data.clear();
        }

        let offset = offset as usize;
        if offset > self.data.len() {
            return ChunkOutcome::Gap {
                expected_offset: self.data.len() as u64,
            };
        }
        self.data.truncate(offset);
        self.data.extend_from_slice(chunk);

        if !done {
            return ChunkOutcome::Buffered;
        }
        let snapshot = Snapshot {
            last_included_index: self.last_included_index,
            last_included_term: self.last_included_term,
            data: std::mem::take(&mut self.data),
        };
        self.last_included_index = 0;
        self.last_included_term = 0;
        ChunkOutcome::Complete(snapshot)
    }

    pub fn buffered_len(&self) -> usize {
        self.data.len()
    }
}
