//! Vote collection for pipeline blocks
//!
//! Votes may arrive before the block reaches the aggregation stage, so sets
//! are created on first use. Whether a set is a quorum is never stored; it is
//! recomputed from the current voters and the quorum policy. Once the
//! aggregation stage decides (quorum, timeout or a newer term) the set is
//! closed and later votes are discarded.
//!
//! A block belongs to its proposer's leadership term. When the node moves to
//! a later term, a block of an earlier term that has no quorum yet fails with
//! [`ConsensusError::StaleTerm`] instead of waiting out its timeout.

use crate::error::{ConsensusError, Result};
use crate::quorum::QuorumPolicy;
use crate::types::{now_millis, NodeId};
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Instant;

/// Closed sets remembered so late votes for them are still discarded
const RETAINED_CLOSED_SETS: usize = 4096;

/// Votes for one block
#[derive(Debug, Default, Clone)]
pub struct VoteSet {
    /// Voter -> vote time (unix millis)
    votes: BTreeMap<NodeId, i64>,
    closed: bool,
}

impl VoteSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a vote; false if it is a duplicate or the set is closed
    pub fn add(&mut self, voter: &str) -> bool {
        if self.closed || self.votes.contains_key(voter) {
            return false;
        }
        self.votes.insert(voter.to_string(), now_millis());
        true
    }

    pub fn voters(&self) -> Vec<&NodeId> {
        self.votes.keys().collect()
    }

    pub fn len(&self) -> usize {
        self.votes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.votes.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn close(&mut self) {
        self.closed = true;
    }

    pub fn has_quorum(&self, policy: &dyn QuorumPolicy, members: &[NodeId]) -> bool {
        policy.is_quorum(&self.voters(), members)
    }
}

#[derive(Default)]
struct Book {
    sets: HashMap<u64, VoteSet>,
    closed_order: VecDeque<u64>,
    /// Latest term the node has reached
    term: u64,
    shutdown: bool,
}

impl Book {
    fn close(&mut self, block_number: u64) {
        let set = self.sets.entry(block_number).or_default();
        if set.closed {
            return;
        }
        set.close();
        set.votes.clear();
        self.closed_order.push_back(block_number);
        while self.closed_order.len() > RETAINED_CLOSED_SETS {
            if let Some(old) = self.closed_order.pop_front() {
                self.sets.remove(&old);
            }
        }
    }
}

/// Vote sets for every in-flight block, shared between the vote producers
/// and the aggregation stage
#[derive(Default)]
pub(crate) struct VoteBook {
    book: Mutex<Book>,
    changed: Condvar,
}

impl VoteBook {
    pub(crate) fn record(&self, block_number: u64, voter: &str) -> bool {
        let mut book = self.book.lock();
        let added = book.sets.entry(block_number).or_default().add(voter);
        if added {
            self.changed.notify_all();
        } else {
            tracing::trace!("Discarded vote from {} for block {}", voter, block_number);
        }
        added
    }

    /// Block until the votes for `block_number` form a quorum, `deadline`
    /// passes or the node moves past `block_term`; the set is closed either way
    pub(crate) fn wait_for_quorum(
        &self,
        block_number: u64,
        block_term: u64,
        policy: &dyn QuorumPolicy,
        members: &[NodeId],
        deadline: Instant,
    ) -> Result<Vec<NodeId>> {
        let mut book = self.book.lock();
        loop {
            if book.shutdown {
                return Err(ConsensusError::Shutdown);
            }
            let set = book.sets.entry(block_number).or_default();
            if set.has_quorum(policy, members) {
                let voters = set.voters().into_iter().cloned().collect();
                book.close(block_number);
                return Ok(voters);
            }
            if book.term > block_term {
                let current_term = book.term;
                book.close(block_number);
                return Err(ConsensusError::StaleTerm { current_term });
            }
            if Instant::now() >= deadline {
                book.close(block_number);
                return Err(ConsensusError::QuorumTimeout { block_number });
            }
            self.changed.wait_until(&mut book, deadline);
        }
    }

    /// Record that the node reached `term`; waiters of earlier terms give up
    pub(crate) fn advance_term(&self, term: u64) {
        let mut book = self.book.lock();
        if term > book.term {
            book.term = term;
            self.changed.notify_all();
        }
    }

    pub(crate) fn shutdown(&self) {
        self.book.lock().shutdown = true;
        self.changed.notify_all();
    }

    /// Sets still open
    pub(crate) fn open_sets(&self) -> usize {
        self.book.lock().sets.values().filter(|s| !s.closed).count()
    }
}
