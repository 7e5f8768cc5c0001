//! Raft state machine
//!
//! `RaftCore` is synchronous and transport-agnostic: RPC handlers take a
//! request and the current instant and return the response. Everything that
//! must happen on the network (vote fan-out, replication rounds) is returned to
//! the caller as plain request values. The owning [`RaftNode`] serializes all
//! access behind one lock, which is the per-node ordering guard for term, vote,
//! log suffix and commit index.
//!
//! [`RaftNode`]: crate::node::RaftNode

use crate::config::ConsensusConfig;
use crate::error::{ConsensusError, Result};
use crate::log::RaftLog;
use crate::quorum::QuorumPolicy;
use crate::role::{RoleEvent, RoleState};
use crate::snapshot::{ChunkOutcome, Snapshot, SnapshotBuffer};
use crate::storage::{HardState, LogStorage};
use crate::types::{
    AppendEntriesRequest, AppendEntriesResponse, BlockProposal, CommandType, ConsensusEvent,
    ConsensusState, EventType, InstallSnapshotRequest, InstallSnapshotResponse, LogEntry, NodeId,
    Role, VoteRequest, VoteResponse,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// One outbound replication message for a peer
#[derive(Debug, Clone)]
pub enum ReplicationRequest {
    Append(AppendEntriesRequest),
    Snapshot(InstallSnapshotRequest),
}

/// What a replication response changed on the leader
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReplicationOutcome {
    /// Block numbers whose log entry the peer now holds
    pub acknowledged_blocks: Vec<u64>,
    pub commit_advanced: bool,
    pub stepped_down: bool,
}

pub struct RaftCore {
    id: NodeId,
    peers: Vec<NodeId>,
    members: Vec<NodeId>,
    config: ConsensusConfig,
    quorum: Arc<dyn QuorumPolicy>,
    storage: Arc<dyn LogStorage>,

    current_term: u64,
    voted_for: Option<NodeId>,
    log: RaftLog,
    commit_index: u64,
    last_applied: u64,
    role: RoleState,
    election_deadline: Instant,
    last_heartbeat_sent: Option<Instant>,

    snapshot: Option<Snapshot>,
    incoming_snapshot: SnapshotBuffer,

    /// Highest block number seen in the log
    last_block_number: u64,
    /// Log index -> block number for blocks proposed in this leadership
    leader_blocks: BTreeMap<u64, u64>,

    events: Vec<ConsensusEvent>,
    rng: StdRng,
}

impl RaftCore {
    /// Build a core, recovering term, vote, snapshot and log from storage
    pub fn new(
        config: ConsensusConfig,
        quorum: Arc<dyn QuorumPolicy>,
        storage: Arc<dyn LogStorage>,
        now: Instant,
    ) -> Result<Self> {
        let hard_state = storage.load_hard_state()?;
        let snapshot = storage.load_snapshot()?;
        let (snapshot_index, snapshot_term) = snapshot
            .as_ref()
            .map(|s| (s.last_included_index, s.last_included_term))
            .unwrap_or((0, 0));
        let log = RaftLog::restore(snapshot_index, snapshot_term, storage.entries()?);

        let members = config.members();
        let peers = members[1..].to_vec();
        let rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let last_block_number = (log.snapshot_index() + 1..=log.last_index())
            .filter_map(|i| log.entry(i).and_then(|e| e.block_ref()))
            .map(|b| b.block_number)
            .max()
            .unwrap_or(0);

        let mut core = Self {
            id: config.node_id.clone(),
            peers,
            members,
            quorum,
            storage,
            current_term: hard_state.current_term,
            voted_for: hard_state.voted_for,
            log,
            commit_index: snapshot_index,
            last_applied: snapshot_index,
            role: RoleState::default(),
            election_deadline: now,
            last_heartbeat_sent: None,
            snapshot,
            incoming_snapshot: SnapshotBuffer::default(),
            last_block_number,
            leader_blocks: BTreeMap::new(),
            events: Vec::new(),
            rng,
            config,
        };
        core.reset_election_deadline(now);
        Ok(core)
    }

    // === accessors ===

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn peers(&self) -> &[NodeId] {
        &self.peers
    }

    pub fn members(&self) -> &[NodeId] {
        &self.members
    }

    pub fn role(&self) -> Role {
        self.role.role()
    }

    pub fn current_term(&self) -> u64 {
        self.current_term
    }

    pub fn voted_for(&self) -> Option<&NodeId> {
        self.voted_for.as_ref()
    }

    pub fn commit_index(&self) -> u64 {
        self.commit_index
    }

    pub fn last_applied(&self) -> u64 {
        self.last_applied
    }

    pub fn log(&self) -> &RaftLog {
        &self.log
    }

    pub fn leader_hint(&self) -> Option<NodeId> {
        match self.role {
            RoleState::Leader { .. } => Some(self.id.clone()),
            _ => self.role.leader_id().cloned(),
        }
    }

    /// Block number a new proposal on this node should use
    pub fn next_block_number(&self) -> u64 {
        self.last_block_number + 1
    }

    /// Replication progress of `peer` (leader only)
    pub fn match_index(&self, peer: &str) -> Option<u64> {
        match &self.role {
            RoleState::Leader { progress } => progress.get(peer).map(|p| p.match_index),
            _ => None,
        }
    }

    pub fn state(&self) -> ConsensusState {
        ConsensusState {
            node_id: self.id.clone(),
            role: self.role(),
            current_term: self.current_term,
            log_size: self.log.len(),
            commit_index: self.commit_index,
            last_log_index: self.log.last_index(),
            last_applied: self.last_applied,
            snapshot_index: self.log.snapshot_index(),
            leader_id: self.leader_hint(),
            voted_for: self.voted_for.clone(),
        }
    }

    /// Events generated since the last drain, in generation order
    pub fn drain_events(&mut self) -> Vec<ConsensusEvent> {
        std::mem::take(&mut self.events)
    }

    // === timers ===

    /// Pure read: has the election deadline passed
    pub fn is_election_timeout_expired(&self, now: Instant) -> bool {
        now > self.election_deadline
    }

    pub fn election_deadline(&self) -> Instant {
        self.election_deadline
    }

    /// Leader whose heartbeat period has elapsed
    pub fn heartbeat_due(&self, now: Instant) -> bool {
        matches!(self.role, RoleState::Leader { .. })
            && self
                .last_heartbeat_sent
                .map_or(true, |sent| now >= sent + self.config.heartbeat_interval())
    }

    /// Leader with at least one peer missing entries
    pub fn replication_pending(&self) -> bool {
        match &self.role {
            RoleState::Leader { progress } => progress
                .values()
                .any(|p| p.next_index <= self.log.last_index()),
            _ => false,
        }
    }

    fn reset_election_deadline(&mut self, now: Instant) {
        let min = self.config.election_timeout_min_ms;
        let max = self.config.election_timeout_max_ms.max(min);
        let timeout = self.rng.gen_range(min..=max);
        self.election_deadline = now + Duration::from_millis(timeout);
    }

    // === state helpers ===

    fn emit(&mut self, event: ConsensusEvent) {
        self.events.push(event);
    }

    fn transition(&mut self, event: RoleEvent<'_>) {
        let before = self.role.role();
        let state = std::mem::take(&mut self.role);
        self.role = state.next(event);
        let after = self.role.role();
        if before != after {
            tracing::info!(
                "{} {:?} -> {:?} in term {}",
                self.id,
                before,
                after,
                self.current_term
            );
            let event = ConsensusEvent::new(EventType::RoleChanged, &self.id, self.current_term)
                .with_detail(format!("{:?} -> {:?}", before, after));
            self.emit(event);
        }
    }

    fn persist_hard_state(&self) -> Result<()> {
        self.storage.save_hard_state(&HardState {
            current_term: self.current_term,
            voted_for: self.voted_for.clone(),
        })
    }

    /// Adopt a newer term and fall back to follower
    fn observe_term(&mut self, term: u64) {
        if term <= self.current_term {
            return;
        }
        self.current_term = term;
        self.voted_for = None;
        self.leader_blocks.clear();
        self.transition(RoleEvent::HigherTerm);
        if let Err(e) = self.persist_hard_state() {
            tracing::error!("{} failed to persist term {}: {}", self.id, term, e);
        }
    }

    fn track_block(&mut self, entry: &LogEntry, leader_owned: bool) {
        if let Some(block) = entry.block_ref() {
            self.last_block_number = self.last_block_number.max(block.block_number);
            if leader_owned {
                self.leader_blocks.insert(entry.index, block.block_number);
            }
        }
    }

    fn apply_committed(&mut self) {
        while self.last_applied < self.commit_index {
            self.last_applied += 1;
            let index = self.last_applied;
            if let Some(entry) = self.log.entry(index) {
                let detail = format!("{:?}", entry.command_type);
                let event =
                    ConsensusEvent::new(EventType::EntryCommitted, &self.id, self.current_term)
                        .with_index(index)
                        .with_detail(detail);
                self.emit(event);
            }
        }
    }

    // === RequestVote ===

    pub fn handle_request_vote(&mut self, req: &VoteRequest, now: Instant) -> VoteResponse {
        let reject = |term: u64, voter: &NodeId| VoteResponse {
            vote_granted: false,
            term,
            voter_id: voter.clone(),
        };

        if req.term < self.current_term {
            return reject(self.current_term, &self.id);
        }
        self.observe_term(req.term);

        let free_to_vote = match &self.voted_for {
            None => true,
            Some(candidate) => *candidate == req.candidate_id,
        };
        let up_to_date = self.log.is_up_to_date(req.last_log_term, req.last_log_index);
        if !free_to_vote || !up_to_date {
            tracing::debug!(
                "{} refused vote for {} in term {} (free: {}, up to date: {})",
                self.id,
                req.candidate_id,
                req.term,
                free_to_vote,
                up_to_date
            );
            return reject(self.current_term, &self.id);
        }

        self.voted_for = Some(req.candidate_id.clone());
        if let Err(e) = self.persist_hard_state() {
            tracing::error!("{} could not persist vote: {}", self.id, e);
            self.voted_for = None;
            return reject(self.current_term, &self.id);
        }
        self.reset_election_deadline(now);
        let event = ConsensusEvent::new(EventType::VoteGranted, &self.id, self.current_term)
            .with_detail(req.candidate_id.clone());
        self.emit(event);

        VoteResponse {
            vote_granted: true,
            term: self.current_term,
            voter_id: self.id.clone(),
        }
    }

    // === AppendEntries ===

    pub fn handle_append_entries(
        &mut self,
        req: &AppendEntriesRequest,
        now: Instant,
    ) -> AppendEntriesResponse {
        if req.term < self.current_term {
            return self.append_rejection(None);
        }
        self.observe_term(req.term);
        if matches!(self.role, RoleState::Leader { .. }) {
            tracing::warn!(
                "{} is leader of term {} but received entries from {}",
                self.id,
                req.term,
                req.leader_id
            );
            return self.append_rejection(None);
        }
        self.transition(RoleEvent::LeaderContact(&req.leader_id));
        self.reset_election_deadline(now);

        if req.is_heartbeat() {
            let event = ConsensusEvent::new(EventType::Heartbeat, &self.id, self.current_term)
                .with_detail(req.leader_id.clone());
            self.emit(event);
        }

        // Entries at or below the snapshot are committed and therefore match
        let prev_covered = req.prev_log_index <= self.log.snapshot_index();
        if !prev_covered && !self.log.matches(req.prev_log_index, req.prev_log_term) {
            let conflict = if req.prev_log_index > self.log.last_index() {
                self.log.last_index() + 1
            } else {
                self.log.first_index_of_term(req.prev_log_index)
            };
            tracing::debug!(
                "{} log mismatch at {} (term {}), resume at {}",
                self.id,
                req.prev_log_index,
                req.prev_log_term,
                conflict
            );
            return self.append_rejection(Some(conflict));
        }

        let outcome = self.log.merge(&req.entries);
        if let Some(from) = outcome.truncated_from {
            if let Err(e) = self.storage.truncate_from(from) {
                tracing::error!("{} failed to truncate log at {}: {}", self.id, from, e);
                return self.append_rejection(None);
            }
        }
        if !outcome.appended.is_empty() {
            if let Err(e) = self.storage.append(&outcome.appended) {
                tracing::error!("{} failed to append entries: {}", self.id, e);
                return self.append_rejection(None);
            }
            for entry in &outcome.appended {
                self.track_block(entry, false);
            }
        }

        let last_new = req
            .entries
            .last()
            .map(|e| e.index)
            .unwrap_or(req.prev_log_index)
            .max(self.log.snapshot_index());
        if req.leader_commit > self.commit_index {
            let target = req.leader_commit.min(last_new).min(self.log.last_index());
            if target > self.commit_index {
                self.commit_index = target;
                self.apply_committed();
            }
        }

        AppendEntriesResponse {
            success: true,
            term: self.current_term,
            follower_id: self.id.clone(),
            match_index: last_new,
            conflict_index: None,
        }
    }

    fn append_rejection(&self, conflict_index: Option<u64>) -> AppendEntriesResponse {
        AppendEntriesResponse {
            success: false,
            term: self.current_term,
            follower_id: self.id.clone(),
            match_index: 0,
            conflict_index,
        }
    }

    // === InstallSnapshot ===

    pub fn handle_install_snapshot(
        &mut self,
        req: &InstallSnapshotRequest,
        now: Instant,
    ) -> InstallSnapshotResponse {
        let respond = |success: bool, term: u64| InstallSnapshotResponse { success, term };

        if req.term < self.current_term {
            return respond(false, self.current_term);
        }
        self.observe_term(req.term);
        if matches!(self.role, RoleState::Leader { .. }) {
            return respond(false, self.current_term);
        }
        self.transition(RoleEvent::LeaderContact(&req.leader_id));
        self.reset_election_deadline(now);

        match self.incoming_snapshot.accept(
            req.last_included_index,
            req.last_included_term,
            req.offset,
            &req.data,
            req.done,
        ) {
            ChunkOutcome::Buffered => respond(true, self.current_term),
            ChunkOutcome::Gap { expected_offset } => {
                tracing::debug!(
                    "{} snapshot chunk at {} leaves a gap, expected {}",
                    self.id,
                    req.offset,
                    expected_offset
                );
                respond(false, self.current_term)
            }
            ChunkOutcome::Complete(snapshot) => {
                let installed = self.install_snapshot(snapshot);
                respond(installed, self.current_term)
            }
        }
    }

    fn install_snapshot(&mut self, snapshot: Snapshot) -> bool {
        let index = snapshot.last_included_index;
        let term = snapshot.last_included_term;
        if index <= self.log.snapshot_index() {
            return true;
        }

        let keeps_suffix = self.log.term_at(index) == Some(term);
        let persisted = self
            .storage
            .save_snapshot(&snapshot)
            .and_then(|_| self.storage.truncate_before(index + 1))
            .and_then(|_| {
                if keeps_suffix {
                    Ok(())
                } else {
                    self.storage.truncate_from(index + 1)
                }
            });
        if let Err(e) = persisted {
            tracing::error!("{} failed to persist snapshot at {}: {}", self.id, index, e);
            return false;
        }

        self.log.compact_through(index, term);
        self.commit_index = self.commit_index.max(index);
        self.last_applied = self.last_applied.max(index);
        self.snapshot = Some(snapshot);
        self.apply_committed();

        tracing::info!("{} installed snapshot through index {} (term {})", self.id, index, term);
        let event = ConsensusEvent::new(EventType::SnapshotInstalled, &self.id, self.current_term)
            .with_index(index);
        self.emit(event);
        true
    }

    /// Snapshot applied state through `through_index` and drop that log prefix
    pub fn compact(&mut self, through_index: u64, data: Vec<u8>) -> Result<()> {
        if through_index > self.last_applied {
            return Err(ConsensusError::Storage(format!(
                "cannot compact through {} beyond last applied {}",
                through_index, self.last_applied
            )));
        }
        if through_index <= self.log.snapshot_index() {
            return Ok(());
        }
        let term = self.log.term_at(through_index).ok_or_else(|| {
            ConsensusError::Storage(format!("no entry at index {}", through_index))
        })?;
        let snapshot = Snapshot {
            last_included_index: through_index,
            last_included_term: term,
            data,
        };
        self.storage.save_snapshot(&snapshot)?;
        self.storage.truncate_before(through_index + 1)?;
        self.log.compact_through(through_index, term);
        self.snapshot = Some(snapshot);
        tracing::debug!("{} compacted log through {}", self.id, through_index);
        Ok(())
    }

    // === elections ===

    /// Become candidate for the next term
    ///
    /// Returns the vote request to fan out, or `None` when no peer needs to be
    /// asked (already leader, or a single-member cluster that won outright).
    pub fn start_election(&mut self, now: Instant) -> Option<VoteRequest> {
        if matches!(self.role, RoleState::Leader { .. }) {
            return None;
        }

        self.current_term += 1;
        self.voted_for = Some(self.id.clone());
        self.leader_blocks.clear();
        let me = self.id.clone();
        self.transition(RoleEvent::ElectionStarted(&me));
        if let Err(e) = self.persist_hard_state() {
            tracing::error!("{} failed to persist election state: {}", self.id, e);
        }
        self.reset_election_deadline(now);
        tracing::debug!("{} starting election for term {}", self.id, self.current_term);

        if self.has_vote_quorum() {
            self.become_leader();
            return None;
        }

        Some(VoteRequest {
            candidate_id: self.id.clone(),
            term: self.current_term,
            last_log_index: self.log.last_index(),
            last_log_term: self.log.last_term(),
        })
    }

    /// Count a vote response; true if this node just became leader
    pub fn handle_vote_response(&mut self, resp: &VoteResponse) -> bool {
        if resp.term > self.current_term {
            self.observe_term(resp.term);
            return false;
        }
        if resp.term < self.current_term || !matches!(self.role, RoleState::Candidate { .. }) {
            return false;
        }
        if !resp.vote_granted {
            return false;
        }
        self.transition(RoleEvent::VoteGranted(&resp.voter_id));
        if self.has_vote_quorum() {
            self.become_leader();
            return true;
        }
        false
    }

    fn has_vote_quorum(&self) -> bool {
        match &self.role {
            RoleState::Candidate { votes } => {
                let voters: Vec<&NodeId> = votes.iter().collect();
                self.quorum.is_quorum(&voters, &self.members)
            }
            _ => false,
        }
    }

    fn become_leader(&mut self) {
        let peers = self.peers.clone();
        let last_index = self.log.last_index();
        self.transition(RoleEvent::Elected {
            peers: &peers,
            last_index,
        });
        self.last_heartbeat_sent = None;
        self.leader_blocks.clear();

        let noop = LogEntry::new(
            self.log.last_index() + 1,
            self.current_term,
            Vec::new(),
            CommandType::Noop,
        );
        if let Err(e) = self.append_local(noop) {
            tracing::error!("{} failed to append leader noop: {}", self.id, e);
        }
    }

    // === proposals ===

    fn append_local(&mut self, entry: LogEntry) -> Result<()> {
        self.storage.append(std::slice::from_ref(&entry))?;
        self.track_block(&entry, true);
        self.log.push(entry);
        self.advance_commit();
        Ok(())
    }

    fn not_leader(&self) -> ConsensusError {
        ConsensusError::NotLeader {
            leader_hint: self.role.leader_id().cloned(),
        }
    }

    /// Append a command as leader
    pub fn propose(&mut self, command: Vec<u8>, command_type: CommandType) -> Result<LogEntry> {
        if !matches!(self.role, RoleState::Leader { .. }) {
            return Err(self.not_leader());
        }
        let entry = LogEntry::new(
            self.log.last_index() + 1,
            self.current_term,
            command,
            command_type,
        );
        self.append_local(entry.clone())?;
        Ok(entry)
    }

    /// Append a block's transaction references as leader; returns the log index
    pub fn propose_block(&mut self, proposal: &BlockProposal) -> Result<u64> {
        if !matches!(self.role, RoleState::Leader { .. }) {
            return Err(self.not_leader());
        }
        let command = proposal.block_ref().to_bytes()?;
        self.propose(command, CommandType::Block).map(|e| e.index)
    }

    // === replication (leader side) ===

    /// Build this round's message for every peer
    pub fn replication_requests(&mut self, now: Instant) -> Vec<(NodeId, ReplicationRequest)> {
        let RoleState::Leader { progress } = &mut self.role else {
            return Vec::new();
        };

        let mut requests = Vec::with_capacity(progress.len());
        let mut heartbeat_only = true;
        for (peer, p) in progress.iter_mut() {
            if p.next_index <= self.log.snapshot_index() {
                if let Some(snapshot) = &self.snapshot {
                    let offset = p.snapshot_offset.unwrap_or(0);
                    let (chunk, done) = snapshot.chunk(offset, self.config.snapshot_chunk_size);
                    p.snapshot_offset = Some(offset);
                    heartbeat_only = false;
                    requests.push((
                        peer.clone(),
                        ReplicationRequest::Snapshot(InstallSnapshotRequest {
                            leader_id: self.id.clone(),
                            term: self.current_term,
                            last_included_index: snapshot.last_included_index,
                            last_included_term: snapshot.last_included_term,
                            data: chunk.to_vec(),
                            offset,
                            done,
                        }),
                    ));
                    continue;
                }
                p.next_index = self.log.snapshot_index() + 1;
            }

            let prev_log_index = p.next_index - 1;
            let prev_log_term = self.log.term_at(prev_log_index).unwrap_or(0);
            let entries = self
                .log
                .entries_from(p.next_index, self.config.max_entries_per_append);
            if !entries.is_empty() {
                heartbeat_only = false;
            }
            requests.push((
                peer.clone(),
                ReplicationRequest::Append(AppendEntriesRequest {
                    leader_id: self.id.clone(),
                    term: self.current_term,
                    prev_log_index,
                    prev_log_term,
                    leader_commit: self.commit_index,
                    batch_append: entries.len() > 1,
                    entries,
                }),
            ));
        }

        self.last_heartbeat_sent = Some(now);
        if heartbeat_only {
            tracing::trace!("{} heartbeat round in term {}", self.id, self.current_term);
            let event = ConsensusEvent::new(EventType::Heartbeat, &self.id, self.current_term)
                .with_detail("sent");
            self.emit(event);
        }
        requests
    }

    pub fn handle_append_response(
        &mut self,
        peer: &str,
        resp: &AppendEntriesResponse,
    ) -> ReplicationOutcome {
        let mut outcome = ReplicationOutcome::default();
        if resp.term > self.current_term {
            self.observe_term(resp.term);
            outcome.stepped_down = true;
            return outcome;
        }
        if resp.term < self.current_term {
            return outcome;
        }
        let last_index = self.log.last_index();
        let RoleState::Leader { progress } = &mut self.role else {
            return outcome;
        };
        let Some(p) = progress.get_mut(peer) else {
            return outcome;
        };

        if resp.success {
            let old_match = p.match_index;
            let new_match = resp.match_index.min(last_index);
            if new_match > old_match {
                p.match_index = new_match;
                outcome.acknowledged_blocks = self
                    .leader_blocks
                    .range((Bound::Excluded(old_match), Bound::Included(new_match)))
                    .map(|(_, block)| *block)
                    .collect();
            }
            p.next_index = p.next_index.max(p.match_index + 1);

            let min_match = progress.values().map(|p| p.match_index).min().unwrap_or(0);
            self.leader_blocks = self.leader_blocks.split_off(&(min_match + 1));
            outcome.commit_advanced = self.advance_commit();
        } else {
            let next = match resp.conflict_index {
                Some(hint) if hint < p.next_index => hint,
                _ => p.next_index.saturating_sub(1),
            };
            p.next_index = next.max(p.match_index + 1).max(1);
            tracing::trace!("{} backtracking {} to {}", self.id, peer, p.next_index);
        }
        outcome
    }

    pub fn handle_snapshot_response(
        &mut self,
        peer: &str,
        req: &InstallSnapshotRequest,
        resp: &InstallSnapshotResponse,
    ) -> ReplicationOutcome {
        let mut outcome = ReplicationOutcome::default();
        if resp.term > self.current_term {
            self.observe_term(resp.term);
            outcome.stepped_down = true;
            return outcome;
        }
        let RoleState::Leader { progress } = &mut self.role else {
            return outcome;
        };
        let Some(p) = progress.get_mut(peer) else {
            return outcome;
        };

        if !resp.success {
            p.snapshot_offset = Some(0);
            return outcome;
        }
        if req.done {
            p.snapshot_offset = None;
            p.match_index = p.match_index.max(req.last_included_index);
            p.next_index = p.match_index + 1;
            outcome.commit_advanced = self.advance_commit();
        } else {
            p.snapshot_offset = Some(req.offset + req.data.len() as u64);
        }
        outcome
    }

    /// Commit the highest current-term index replicated on a quorum
    fn advance_commit(&mut self) -> bool {
        let RoleState::Leader { progress } = &self.role else {
            return false;
        };
        let mut new_commit = None;
        for n in (self.commit_index + 1..=self.log.last_index()).rev() {
            if self.log.term_at(n) != Some(self.current_term) {
                // earlier entries belong to older terms and commit indirectly
                break;
            }
            let mut voters: Vec<&NodeId> = vec![&self.id];
            voters.extend(
                progress
                    .iter()
                    .filter(|(_, p)| p.match_index >= n)
                    .map(|(peer, _)| peer),
            );
            if self.quorum.is_quorum(&voters, &self.members) {
                new_commit = Some(n);
                break;
            }
        }

        match new_commit {
            Some(n) => {
                self.commit_index = n;
                self.apply_committed();
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quorum::Majority;
    use crate::storage::MemoryStorage;

    fn core(id: &str, peers: &[&str]) -> RaftCore {
        core_with(id, peers, ConsensusConfig::default())
    }

    fn core_with(id: &str, peers: &[&str], base: ConsensusConfig) -> RaftCore {
        let config = ConsensusConfig {
            node_id: id.to_string(),
            peers: peers.iter().map(|p| p.to_string()).collect(),
            rng_seed: Some(7),
            ..base
        };
        RaftCore::new(
            config,
            Arc::new(Majority),
            Arc::new(MemoryStorage::new()),
            Instant::now(),
        )
        .unwrap()
    }

    fn entry(index: u64, term: u64) -> LogEntry {
        LogEntry::new(index, term, vec![index as u8], CommandType::Application)
    }

    fn append(
        leader: &str,
        term: u64,
        prev: (u64, u64),
        commit: u64,
        entries: Vec<LogEntry>,
    ) -> AppendEntriesRequest {
        AppendEntriesRequest {
            leader_id: leader.to_string(),
            term,
            prev_log_index: prev.0,
            prev_log_term: prev.1,
            leader_commit: commit,
            batch_append: entries.len() > 1,
            entries,
        }
    }

    fn vote(candidate: &str, term: u64, last_index: u64, last_term: u64) -> VoteRequest {
        VoteRequest {
            candidate_id: candidate.to_string(),
            term,
            last_log_index: last_index,
            last_log_term: last_term,
        }
    }

    /// Elect `c` leader with the vote of its first peer
    fn elected(c: &mut RaftCore) {
        let now = Instant::now();
        let req = c.start_election(now).unwrap();
        let resp = VoteResponse {
            vote_granted: true,
            term: req.term,
            voter_id: c.peers()[0].clone(),
        };
        assert!(c.handle_vote_response(&resp));
    }

    #[test]
    fn test_second_candidate_same_term_is_refused() {
        let mut follower = core("n3", &["n1", "n2"]);
        let now = Instant::now();

        let first = follower.handle_request_vote(&vote("c1", 1, 0, 0), now);
        assert!(first.vote_granted);
        assert_eq!(first.term, 1);

        let second = follower.handle_request_vote(&vote("c2", 1, 0, 0), now);
        assert!(!second.vote_granted);
        assert_eq!(second.term, 1);
    }

    #[test]
    fn test_repeat_request_from_same_candidate_is_granted() {
        let mut follower = core("n3", &["n1", "n2"]);
        let now = Instant::now();
        assert!(follower.handle_request_vote(&vote("c1", 1, 0, 0), now).vote_granted);
        assert!(follower.handle_request_vote(&vote("c1", 1, 0, 0), now).vote_granted);
    }

    #[test]
    fn test_stale_vote_request_reports_newer_term() {
        let mut follower = core("n3", &["n1", "n2"]);
        let now = Instant::now();
        follower.handle_request_vote(&vote("c1", 4, 0, 0), now);

        let resp = follower.handle_request_vote(&vote("c2", 3, 10, 3), now);
        assert!(!resp.vote_granted);
        assert_eq!(resp.term, 4);
    }

    #[test]
    fn test_vote_refused_to_outdated_log() {
        let mut follower = core("n3", &["n1", "n2"]);
        let now = Instant::now();
        follower.handle_append_entries(&append("n1", 2, (0, 0), 0, vec![entry(1, 2)]), now);

        let resp = follower.handle_request_vote(&vote("n2", 3, 5, 1), now);
        assert!(!resp.vote_granted);
        // the newer term is still adopted
        assert_eq!(resp.term, 3);
        assert_eq!(follower.voted_for(), None);
    }

    #[test]
    fn test_refused_vote_does_not_reset_deadline() {
        let mut follower = core("n3", &["n1", "n2"]);
        let now = Instant::now();
        follower.handle_request_vote(&vote("c1", 1, 0, 0), now);
        let deadline = follower.election_deadline();

        let later = now + Duration::from_millis(40);
        follower.handle_request_vote(&vote("c2", 1, 0, 0), later);
        assert_eq!(follower.election_deadline(), deadline);
    }

    #[test]
    fn test_append_to_empty_log() {
        let mut follower = core("n2", &["n1", "n3"]);
        let resp = follower.handle_append_entries(
            &append("n1", 1, (0, 0), 0, vec![entry(1, 1)]),
            Instant::now(),
        );
        assert!(resp.success);
        assert_eq!(resp.match_index, 1);
        assert_eq!(resp.follower_id, "n2");
    }

    #[test]
    fn test_batch_append_of_hundred_entries() {
        let mut follower = core("n2", &["n1", "n3"]);
        let entries: Vec<_> = (1..=100).map(|i| entry(i, 1)).collect();
        let resp =
            follower.handle_append_entries(&append("n1", 1, (0, 0), 0, entries), Instant::now());
        assert!(resp.success);
        assert_eq!(resp.match_index, 100);
        assert_eq!(follower.log().last_index(), 100);
    }

    #[test]
    fn test_inconsistent_prev_is_rejected_with_hint() {
        let mut follower = core("n2", &["n1", "n3"]);
        let now = Instant::now();
        follower.handle_append_entries(
            &append("n1", 2, (0, 0), 0, vec![entry(1, 1), entry(2, 2), entry(3, 2)]),
            now,
        );

        let too_far = follower.handle_append_entries(&append("n1", 3, (7, 3), 0, vec![]), now);
        assert!(!too_far.success);
        assert_eq!(too_far.conflict_index, Some(4));

        let wrong_term = follower.handle_append_entries(&append("n1", 3, (3, 3), 0, vec![]), now);
        assert!(!wrong_term.success);
        assert_eq!(wrong_term.conflict_index, Some(2));
    }

    #[test]
    fn test_stale_leader_is_rejected() {
        let mut follower = core("n2", &["n1", "n3"]);
        let now = Instant::now();
        follower.handle_request_vote(&vote("n3", 5, 0, 0), now);
        let req = append("n1", 4, (0, 0), 0, vec![entry(1, 4)]);
        let resp = follower.handle_append_entries(&req, now);
        assert!(!resp.success);
        assert_eq!(resp.term, 5);
        assert_eq!(follower.log().last_index(), 0);
    }

    #[test]
    fn test_commit_follows_leader_but_never_past_new_entries() {
        let mut follower = core("n2", &["n1", "n3"]);
        let now = Instant::now();
        let resp = follower.handle_append_entries(
            &append("n1", 1, (0, 0), 10, vec![entry(1, 1), entry(2, 1)]),
            now,
        );
        assert!(resp.success);
        assert_eq!(follower.commit_index(), 2);
        assert_eq!(follower.last_applied(), 2);
    }

    #[test]
    fn test_commit_index_never_decreases() {
        let mut follower = core("n2", &["n1", "n3"]);
        let now = Instant::now();
        let entries: Vec<_> = (1..=5).map(|i| entry(i, 1)).collect();
        follower.handle_append_entries(&append("n1", 1, (0, 0), 5, entries), now);
        assert_eq!(follower.commit_index(), 5);

        // delayed request with an older commit
        follower.handle_append_entries(&append("n1", 1, (0, 0), 2, vec![entry(1, 1)]), now);
        assert_eq!(follower.commit_index(), 5);
        assert_eq!(follower.log().last_index(), 5);
    }

    #[test]
    fn test_single_chunk_snapshot_truncates_log() {
        let mut follower = core("n2", &["n1", "n3"]);
        let now = Instant::now();
        let entries: Vec<_> = (1..=20).map(|i| entry(i, 1)).collect();
        follower.handle_append_entries(&append("n1", 1, (0, 0), 0, entries), now);

        let resp = follower.handle_install_snapshot(
            &InstallSnapshotRequest {
                leader_id: "n1".into(),
                term: 2,
                last_included_index: 100,
                last_included_term: 2,
                data: vec![0xAB; 1024],
                offset: 0,
                done: true,
            },
            now,
        );
        assert!(resp.success);

        let state = follower.state();
        assert_eq!(state.log_size, 0);
        assert_eq!(state.snapshot_index, 100);
        assert_eq!(state.commit_index, 100);
        assert_eq!(state.last_log_index, 100);
    }

    #[test]
    fn test_stale_snapshot_is_rejected() {
        let mut follower = core("n2", &["n1", "n3"]);
        let now = Instant::now();
        follower.handle_request_vote(&vote("n3", 3, 0, 0), now);
        let resp = follower.handle_install_snapshot(
            &InstallSnapshotRequest {
                leader_id: "n1".into(),
                term: 2,
                last_included_index: 10,
                last_included_term: 2,
                data: vec![1],
                offset: 0,
                done: true,
            },
            now,
        );
        assert!(!resp.success);
        assert_eq!(resp.term, 3);
        assert_eq!(follower.state().snapshot_index, 0);
    }

    #[test]
    fn test_election_increments_term_and_votes_for_self() {
        let mut c = core("n1", &["n2", "n3"]);
        let req = c.start_election(Instant::now()).unwrap();
        assert_eq!(req.term, 1);
        assert_eq!(c.role(), Role::Candidate);
        assert_eq!(c.voted_for().map(String::as_str), Some("n1"));
    }

    #[test]
    fn test_majority_makes_leader_with_noop() {
        let mut c = core("n1", &["n2", "n3"]);
        elected(&mut c);
        assert_eq!(c.role(), Role::Leader);
        assert_eq!(c.log().last_index(), 1);
        assert_eq!(c.log().entry(1).unwrap().command_type, CommandType::Noop);
    }

    #[test]
    fn test_single_node_wins_immediately() {
        let mut c = core("solo", &[]);
        assert!(c.start_election(Instant::now()).is_none());
        assert_eq!(c.role(), Role::Leader);
        // noop committed on its own
        assert_eq!(c.commit_index(), 1);
    }

    #[test]
    fn test_higher_term_response_demotes_candidate() {
        let mut c = core("n1", &["n2", "n3"]);
        c.start_election(Instant::now());
        let became = c.handle_vote_response(&VoteResponse {
            vote_granted: false,
            term: 9,
            voter_id: "n2".into(),
        });
        assert!(!became);
        assert_eq!(c.role(), Role::Follower);
        assert_eq!(c.current_term(), 9);
    }

    #[test]
    fn test_non_leader_proposal_redirects() {
        let mut follower = core("n2", &["n1", "n3"]);
        follower.handle_append_entries(&append("n1", 1, (0, 0), 0, vec![]), Instant::now());
        let err = follower
            .propose(b"x".to_vec(), CommandType::Application)
            .unwrap_err();
        assert_eq!(
            err,
            ConsensusError::NotLeader {
                leader_hint: Some("n1".into())
            }
        );
    }

    #[test]
    fn test_leader_commits_on_quorum_ack_and_reports_blocks() {
        let mut c = core("n1", &["n2", "n3"]);
        elected(&mut c);
        let proposal = BlockProposal::new("n1", 1, vec!["t1".into()]);
        let index = c.propose_block(&proposal).unwrap();
        assert_eq!(index, 2);
        assert_eq!(c.commit_index(), 0);

        let requests = c.replication_requests(Instant::now());
        assert_eq!(requests.len(), 2);
        let (peer, ReplicationRequest::Append(req)) = &requests[0] else {
            panic!("expected append");
        };
        assert_eq!(req.entries.len(), 2);
        assert!(req.batch_append);

        let outcome = c.handle_append_response(
            peer,
            &AppendEntriesResponse {
                success: true,
                term: c.current_term(),
                follower_id: peer.clone(),
                match_index: 2,
                conflict_index: None,
            },
        );
        assert!(outcome.commit_advanced);
        assert_eq!(outcome.acknowledged_blocks, vec![1]);
        assert_eq!(c.commit_index(), 2);
        assert_eq!(c.next_block_number(), 2);
    }

    #[test]
    fn test_leader_backtracks_to_conflict_hint() {
        let mut c = core("n1", &["n2", "n3"]);
        elected(&mut c);
        for _ in 0..5 {
            c.propose(vec![1], CommandType::Application).unwrap();
        }
        c.replication_requests(Instant::now());
        c.handle_append_response(
            "n2",
            &AppendEntriesResponse {
                success: false,
                term: c.current_term(),
                follower_id: "n2".into(),
                match_index: 0,
                conflict_index: Some(1),
            },
        );

        let requests = c.replication_requests(Instant::now());
        let req = requests
            .iter()
            .find_map(|(peer, r)| match r {
                ReplicationRequest::Append(a) if peer == "n2" => Some(a.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(req.prev_log_index, 0);
        assert_eq!(req.entries.len(), 6);
    }

    #[test]
    fn test_lagging_peer_gets_snapshot_after_compaction() {
        let mut c = core("n1", &["n2", "n3"]);
        elected(&mut c);
        c.propose(vec![1], CommandType::Application).unwrap();
        c.replication_requests(Instant::now());
        c.handle_append_response(
            "n2",
            &AppendEntriesResponse {
                success: true,
                term: c.current_term(),
                follower_id: "n2".into(),
                match_index: 2,
                conflict_index: None,
            },
        );
        assert_eq!(c.last_applied(), 2);
        c.compact(2, b"state".to_vec()).unwrap();

        // n3 never acknowledged anything and now needs entries that are gone
        let requests = c.replication_requests(Instant::now());
        let (_, to_n3) = requests.iter().find(|(peer, _)| peer == "n3").unwrap();
        match to_n3 {
            ReplicationRequest::Snapshot(req) => {
                assert_eq!(req.last_included_index, 2);
                assert_eq!(req.offset, 0);
                assert!(req.done);
                assert_eq!(req.data, b"state".to_vec());
            }
            other => panic!("expected snapshot, got {:?}", other),
        }
    }

    #[test]
    fn test_snapshot_ships_in_chunks_until_done() {
        let config = ConsensusConfig {
            snapshot_chunk_size: 4,
            ..Default::default()
        };
        let mut leader = core_with("n1", &["n2", "n3"], config);
        elected(&mut leader);
        leader.propose(vec![1], CommandType::Application).unwrap();
        leader.replication_requests(Instant::now());
        leader.handle_append_response(
            "n2",
            &AppendEntriesResponse {
                success: true,
                term: leader.current_term(),
                follower_id: "n2".into(),
                match_index: 2,
                conflict_index: None,
            },
        );
        leader.compact(2, b"0123456789".to_vec()).unwrap();

        let mut follower = core("n3", &["n1", "n2"]);
        let mut chunks = Vec::new();
        for _ in 0..3 {
            let req = leader
                .replication_requests(Instant::now())
                .into_iter()
                .find_map(|(peer, request)| match request {
                    ReplicationRequest::Snapshot(req) if peer == "n3" => Some(req),
                    _ => None,
                })
                .unwrap();
            chunks.push((req.offset, req.data.len(), req.done));
            let resp = follower.handle_install_snapshot(&req, Instant::now());
            assert!(resp.success);
            leader.handle_snapshot_response("n3", &req, &resp);
        }

        assert_eq!(chunks, vec![(0, 4, false), (4, 4, false), (8, 2, true)]);
        let state = follower.state();
        assert_eq!(state.snapshot_index, 2);
        assert_eq!(state.commit_index, 2);

        // with the snapshot in place, n3 is back on plain AppendEntries
        let requests = leader.replication_requests(Instant::now());
        let (_, to_n3) = requests.iter().find(|(peer, _)| peer == "n3").unwrap();
        match to_n3 {
            ReplicationRequest::Append(req) => assert_eq!(req.prev_log_index, 2),
            other => panic!("expected append, got {:?}", other),
        }
    }

    #[test]
    fn test_election_timeout_check_is_pure() {
        let c = core("n1", &["n2", "n3"]);
        let before = c.election_deadline();
        assert!(!c.is_election_timeout_expired(before));
        assert!(c.is_election_timeout_expired(before + Duration::from_millis(1)));
        assert_eq!(c.election_deadline(), before);
    }
}
