//! Consensus node handle
//!
//! `RaftNode` owns one [`RaftCore`] behind a single mutex and drives it:
//! RPC handlers run on the caller's thread, a ticker thread fires elections
//! and heartbeats, and vote and replication rounds fan out to peers on worker
//! threads. A round waits for its peers until the RPC deadline and no longer.
//! The transport is never called while the core lock is held.
//!
//! After every core mutation the node republishes a [`ConsensusState`]
//! snapshot (so state reads never wait on the core) and queues the events
//! the core generated. A per-node publisher thread feeds that queue into the
//! [`EventHub`], so a subscriber that stops reading stalls the publisher and
//! never the core.

use crate::batch::{BatchDelivery, TransactionSink};
use crate::config::ConsensusConfig;
use crate::raft::{RaftCore, ReplicationOutcome, ReplicationRequest};
use crate::error::{ConsensusError, Result};
use crate::events::{EventHub, EventStream};
use crate::pipeline::{
    AcceptAll, Block, BlockPipeline, FinalitySink, PipelineConfig, PipelineStats,
    TransactionResolver,
};
use crate::quorum::{Majority, QuorumPolicy};
use crate::storage::{LogStorage, MemoryStorage};
use crate::transport::{LocalNetwork, PeerTransport, RpcHandler};
use crate::types::{
    AppendEntriesRequest, AppendEntriesResponse, BlockProposal, CommandType, ConsensusEvent,
    ConsensusState, EventType, InstallSnapshotRequest, InstallSnapshotResponse, LogEntry, NodeId,
    ProposalResponse, Role, VoteRequest, VoteResponse,
};
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Instant;

#[derive(Debug, Default)]
struct NodeCounters {
    elections_started: AtomicU64,
    proposals_accepted: AtomicU64,
    proposals_rejected: AtomicU64,
    replication_rounds: AtomicU64,
    rpc_failures: AtomicU64,
}

/// Pull-based node metrics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeMetrics {
    pub state: ConsensusState,
    pub elections_started: u64,
    pub proposals_accepted: u64,
    pub proposals_rejected: u64,
    pub replication_rounds: u64,
    pub rpc_failures: u64,
    pub event_subscribers: usize,
    pub pipeline: Option<PipelineStats>,
}

/// Queues a `BlockFinalized` event for every finalized block
struct FinalityEvents {
    node_id: NodeId,
    events: Sender<Vec<ConsensusEvent>>,
}

impl FinalitySink for FinalityEvents {
    fn block_finalized(&self, block: &Arc<Block>) {
        let event = ConsensusEvent::new(EventType::BlockFinalized, &self.node_id, block.term)
            .with_index(block.block_number)
            .with_detail(format!("log index {}", block.log_index));
        let _ = self.events.send(vec![event]);
    }
}

/// Drain queued events into the hub until every sender is gone
fn spawn_event_publisher(
    id: &str,
    hub: Arc<EventHub>,
    queue: Receiver<Vec<ConsensusEvent>>,
) -> Result<()> {
    std::thread::Builder::new()
        .name(format!("raft-events-{}", id))
        .spawn(move || {
            for events in queue.iter() {
                hub.publish(events);
            }
        })?;
    Ok(())
}

/// A running consensus node
pub struct RaftNode {
    /// Handle given to the per-peer RPC workers
    this: Weak<RaftNode>,
    id: NodeId,
    config: ConsensusConfig,
    core: Mutex<RaftCore>,
    published: RwLock<ConsensusState>,
    transport: Arc<dyn PeerTransport>,
    events: Arc<EventHub>,
    /// Ordered queue in front of `events`
    event_queue: Sender<Vec<ConsensusEvent>>,
    pipeline: Option<Arc<BlockPipeline>>,
    /// Serializes block numbering and pipeline submission
    propose_lock: Mutex<()>,
    /// Held for the duration of one replication round
    replicating: Mutex<()>,
    running: AtomicBool,
    ticker: Mutex<Option<JoinHandle<()>>>,
    counters: NodeCounters,
}

impl RaftNode {
    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn config(&self) -> &ConsensusConfig {
        &self.config
    }

    /// Run `f` against the core, then republish state and queue events
    ///
    /// Events are queued before the core lock is released so subscribers
    /// see them in generation order. Queueing never blocks.
    fn with_core<R>(&self, f: impl FnOnce(&mut RaftCore) -> R) -> R {
        let (result, term) = {
            let mut core = self.core.lock();
            let result = f(&mut core);
            *self.published.write() = core.state();
            let events = core.drain_events();
            if !events.is_empty() {
                let _ = self.event_queue.send(events);
            }
            (result, core.current_term())
        };
        if let Some(pipeline) = &self.pipeline {
            pipeline.observe_term(term);
        }
        result
    }

    /// Run `job` for one peer on a worker thread of its own
    ///
    /// The worker keeps the node alive until the job returns, which the
    /// transport bounds by the RPC deadline.
    fn spawn_rpc(&self, peer: NodeId, job: impl FnOnce(&RaftNode, &str) + Send + 'static) {
        let Some(node) = self.this.upgrade() else {
            return;
        };
        let name = format!("raft-rpc-{}-{}", self.id, peer);
        if let Err(e) = std::thread::Builder::new()
            .name(name)
            .spawn(move || job(&node, &peer))
        {
            self.counters.rpc_failures.fetch_add(1, Ordering::Relaxed);
            tracing::error!("{} could not dispatch an RPC worker: {}", self.id, e);
        }
    }

    // === peer RPCs ===

    pub fn handle_request_vote(&self, req: &VoteRequest) -> VoteResponse {
        self.with_core(|core| core.handle_request_vote(req, Instant::now()))
    }

    pub fn handle_append_entries(&self, req: &AppendEntriesRequest) -> AppendEntriesResponse {
        self.with_core(|core| core.handle_append_entries(req, Instant::now()))
    }

    pub fn handle_install_snapshot(&self, req: &InstallSnapshotRequest) -> InstallSnapshotResponse {
        self.with_core(|core| core.handle_install_snapshot(req, Instant::now()))
    }

    // === elections ===

    /// Run one election round; true if this node ends up leader
    pub fn start_election(&self) -> bool {
        let request = self.with_core(|core| core.start_election(Instant::now()));
        self.counters.elections_started.fetch_add(1, Ordering::Relaxed);

        let Some(request) = request else {
            let leader = self.role() == Role::Leader;
            if leader {
                self.replicate();
            }
            return leader;
        };

        let timeout = self.config.rpc_timeout();
        let deadline = Instant::now() + timeout;
        let peers = self.core.lock().peers().to_vec();
        let (tx, rx) = crossbeam_channel::bounded(peers.len());
        for peer in peers {
            let tx = tx.clone();
            let request = request.clone();
            self.spawn_rpc(peer, move |node, peer| {
                let result = node.transport.request_vote(peer, &request, timeout);
                let _ = tx.send((peer.to_string(), result));
            });
        }
        drop(tx);

        // count votes as they arrive; stragglers past the deadline are ignored
        let mut won = false;
        while let Ok((peer, result)) = rx.recv_deadline(deadline) {
            match result {
                Ok(resp) => {
                    if self.with_core(|core| core.handle_vote_response(&resp)) {
                        won = true;
                    }
                }
                Err(e) => {
                    self.counters.rpc_failures.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!("{} RequestVote to {} failed: {}", self.id, peer, e);
                }
            }
        }

        if won {
            // assert leadership before anyone else times out
            self.replicate();
        }
        won
    }

    pub fn is_election_timeout_expired(&self) -> bool {
        self.core.lock().is_election_timeout_expired(Instant::now())
    }

    // === replication ===

    /// Run one replication round (heartbeat or entries) if this node leads
    ///
    /// Skipped when another round is still in flight. The round ends when
    /// every peer has answered or the RPC deadline has passed; a late answer
    /// is still applied when it arrives.
    pub fn replicate(&self) {
        let Some(_round) = self.replicating.try_lock() else {
            return;
        };
        let requests = self.with_core(|core| core.replication_requests(Instant::now()));
        if requests.is_empty() {
            return;
        }
        self.counters.replication_rounds.fetch_add(1, Ordering::Relaxed);

        let deadline = Instant::now() + self.config.rpc_timeout();
        let (done_tx, done_rx) = crossbeam_channel::bounded::<()>(requests.len());
        for (peer, request) in requests {
            let done_tx = done_tx.clone();
            self.spawn_rpc(peer, move |node, peer| {
                node.replicate_to(peer, request);
                drop(done_tx);
            });
        }
        drop(done_tx);
        // disconnects once every worker has finished
        let _ = done_rx.recv_deadline(deadline);
    }

    fn replicate_to(&self, peer: &str, request: ReplicationRequest) {
        let timeout = self.config.rpc_timeout();
        let outcome: ReplicationOutcome = match &request {
            ReplicationRequest::Append(req) => {
                match self.transport.append_entries(peer, req, timeout) {
                    Ok(resp) => self.with_core(|core| core.handle_append_response(peer, &resp)),
                    Err(e) => {
                        self.counters.rpc_failures.fetch_add(1, Ordering::Relaxed);
                        tracing::trace!("{} AppendEntries to {} failed: {}", self.id, peer, e);
                        return;
                    }
                }
            }
            ReplicationRequest::Snapshot(req) => {
                match self.transport.install_snapshot(peer, req, timeout) {
                    Ok(resp) => {
                        self.with_core(|core| core.handle_snapshot_response(peer, req, &resp))
                    }
                    Err(e) => {
                        self.counters.rpc_failures.fetch_add(1, Ordering::Relaxed);
                        tracing::debug!("{} InstallSnapshot to {} failed: {}", self.id, peer, e);
                        return;
                    }
                }
            }
        };

        if let Some(pipeline) = &self.pipeline {
            for block_number in outcome.acknowledged_blocks {
                pipeline.record_vote(block_number, peer);
            }
        }
    }

    /// One timer step: election on an expired deadline, replication when due
    pub fn tick(&self) {
        let now = Instant::now();
        let (role, expired, heartbeat_due, pending) = {
            let core = self.core.lock();
            (
                core.role(),
                core.is_election_timeout_expired(now),
                core.heartbeat_due(now),
                core.replication_pending(),
            )
        };
        match role {
            Role::Leader if heartbeat_due || pending => self.replicate(),
            Role::Leader => {}
            _ if expired => {
                self.start_election();
            }
            _ => {}
        }
    }

    // === client operations ===

    /// Snapshot of the node state; never waits on replication or the pipeline
    pub fn get_consensus_state(&self) -> ConsensusState {
        self.published.read().clone()
    }

    pub fn role(&self) -> Role {
        self.published.read().role
    }

    pub fn is_leader(&self) -> bool {
        self.role() == Role::Leader
    }

    pub fn leader_hint(&self) -> Option<NodeId> {
        self.published.read().leader_id.clone()
    }

    /// Subscribe to consensus events from now on
    pub fn stream_consensus_events(&self, include_heartbeats: bool) -> EventStream {
        self.events.subscribe(include_heartbeats)
    }

    /// Append an application command (leader only)
    pub fn propose(&self, command: Vec<u8>) -> Result<LogEntry> {
        let entry = self.with_core(|core| core.propose(command, CommandType::Application))?;
        self.replicate();
        Ok(entry)
    }

    /// Append a block to the log and start it through the finality pipeline
    pub fn propose_block(&self, proposal: BlockProposal) -> ProposalResponse {
        let _guard = self.propose_lock.lock();
        self.propose_block_locked(proposal)
    }

    /// Propose the next block number over `transaction_ids`
    pub fn propose_transactions(&self, transaction_ids: Vec<String>) -> ProposalResponse {
        let _guard = self.propose_lock.lock();
        let block_number = self.core.lock().next_block_number();
        let proposal = BlockProposal::new(&self.id, block_number, transaction_ids);
        self.propose_block_locked(proposal)
    }

    fn propose_block_locked(&self, proposal: BlockProposal) -> ProposalResponse {
        let block_number = proposal.block_number;
        let appended = self.with_core(|core| {
            core.propose_block(&proposal)
                .map(|index| (index, core.current_term()))
        });
        let (log_index, term) = match appended {
            Ok(appended) => appended,
            Err(e) => {
                self.counters.proposals_rejected.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("{} rejected block {}: {}", self.id, block_number, e);
                return ProposalResponse::rejected(block_number, e);
            }
        };

        let receipt = match &self.pipeline {
            Some(pipeline) => {
                pipeline.record_vote(block_number, &self.id);
                match pipeline.submit(Block::from_proposal(&proposal, log_index, term)) {
                    Ok(receipt) => Some(receipt),
                    Err(e) => {
                        self.counters.proposals_rejected.fetch_add(1, Ordering::Relaxed);
                        return ProposalResponse::rejected(block_number, e);
                    }
                }
            }
            None => None,
        };

        self.counters.proposals_accepted.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            "{} accepted block {} at log index {}",
            self.id,
            block_number,
            log_index
        );
        self.replicate();

        ProposalResponse {
            accepted: true,
            block_number,
            log_index: Some(log_index),
            leader_hint: Some(self.id.clone()),
            error: None,
            receipt,
        }
    }

    /// Snapshot applied state through `through_index` and drop that prefix
    pub fn compact(&self, through_index: u64, data: Vec<u8>) -> Result<()> {
        self.with_core(|core| core.compact(through_index, data))
    }

    /// Up to `max` retained log entries starting at `start`
    pub fn log_entries(&self, start: u64, max: usize) -> Vec<LogEntry> {
        self.core.lock().log().entries_from(start, max)
    }

    pub fn pipeline(&self) -> Option<&Arc<BlockPipeline>> {
        self.pipeline.as_ref()
    }

    pub fn metrics(&self) -> NodeMetrics {
        let c = &self.counters;
        NodeMetrics {
            state: self.get_consensus_state(),
            elections_started: c.elections_started.load(Ordering::Relaxed),
            proposals_accepted: c.proposals_accepted.load(Ordering::Relaxed),
            proposals_rejected: c.proposals_rejected.load(Ordering::Relaxed),
            replication_rounds: c.replication_rounds.load(Ordering::Relaxed),
            rpc_failures: c.rpc_failures.load(Ordering::Relaxed),
            event_subscribers: self.events.subscriber_count(),
            pipeline: self.pipeline.as_ref().map(|p| p.stats()),
        }
    }

    // === lifecycle ===

    /// Spawn the ticker thread
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let weak: Weak<Self> = Arc::downgrade(self);
        let interval = self.config.tick_interval();
        let handle = std::thread::Builder::new()
            .name(format!("raft-tick-{}", self.id))
            .spawn(move || loop {
                std::thread::sleep(interval);
                let Some(node) = weak.upgrade() else {
                    break;
                };
                if !node.running.load(Ordering::SeqCst) {
                    break;
                }
                node.tick();
            })?;
        *self.ticker.lock() = Some(handle);
        tracing::info!("Node {} started", self.id);
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stop the ticker and the pipeline and end every event stream
    pub fn shutdown(&self) {
        let was_running = self.running.swap(false, Ordering::SeqCst);
        if let Some(handle) = self.ticker.lock().take() {
            if handle.thread().id() != std::thread::current().id() && handle.join().is_err() {
                tracing::error!("Ticker of {} panicked", self.id);
            }
        }
        if let Some(pipeline) = &self.pipeline {
            pipeline.shutdown();
        }
        self.events.close();
        if was_running {
            tracing::info!("Node {} stopped", self.id);
        }
    }
}

impl Drop for RaftNode {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(pipeline) = &self.pipeline {
            pipeline.shutdown();
        }
    }
}

impl RpcHandler for RaftNode {
    fn request_vote(&self, req: VoteRequest) -> VoteResponse {
        self.handle_request_vote(&req)
    }

    fn append_entries(&self, req: AppendEntriesRequest) -> AppendEntriesResponse {
        self.handle_append_entries(&req)
    }

    fn install_snapshot(&self, req: InstallSnapshotRequest) -> InstallSnapshotResponse {
        self.handle_install_snapshot(&req)
    }
}

/// Batches become blocks proposed by this node
impl TransactionSink for RaftNode {
    fn deliver(&self, transaction_ids: Vec<String>) -> Result<BatchDelivery> {
        if self.pipeline.is_none() {
            return Err(ConsensusError::BatchFailed {
                reason: format!("{} has no finality pipeline", self.id),
            });
        }
        let response = self.propose_transactions(transaction_ids);
        match (response.accepted, response.receipt) {
            (true, Some(finality)) => Ok(BatchDelivery {
                block_number: response.block_number,
                log_index: response.log_index.unwrap_or_default(),
                finality,
            }),
            _ => Err(response
                .error
                .unwrap_or_else(|| ConsensusError::BatchFailed {
                    reason: "proposal not accepted".to_string(),
                })),
        }
    }
}

/// Builder for RaftNode
pub struct RaftNodeBuilder {
    config: ConsensusConfig,
    quorum: Arc<dyn QuorumPolicy>,
    storage: Option<Arc<dyn LogStorage>>,
    transport: Option<Arc<dyn PeerTransport>>,
    network: Option<Arc<LocalNetwork>>,
    pipeline: Option<PipelineConfig>,
    resolver: Arc<dyn TransactionResolver>,
    sinks: Vec<Arc<dyn FinalitySink>>,
}

impl RaftNodeBuilder {
    pub fn new() -> Self {
        Self {
            config: ConsensusConfig::default(),
            quorum: Arc::new(Majority),
            storage: None,
            transport: None,
            network: None,
            pipeline: None,
            resolver: Arc::new(AcceptAll),
            sinks: Vec::new(),
        }
    }

    pub fn config(mut self, config: ConsensusConfig) -> Self {
        self.config = config;
        self
    }

    pub fn node_id(mut self, id: impl Into<NodeId>) -> Self {
        self.config.node_id = id.into();
        self
    }

    pub fn peers(mut self, peers: Vec<NodeId>) -> Self {
        self.config.peers = peers;
        self
    }

    pub fn quorum(mut self, quorum: Arc<dyn QuorumPolicy>) -> Self {
        self.quorum = quorum;
        self
    }

    pub fn storage(mut self, storage: Arc<dyn LogStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Use a custom transport; the node is not registered anywhere
    pub fn transport(mut self, transport: Arc<dyn PeerTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Join an in-process network (transport and registration)
    pub fn network(mut self, network: Arc<LocalNetwork>) -> Self {
        self.network = Some(network);
        self
    }

    /// Run a block finality pipeline on this node
    pub fn pipeline(mut self, config: PipelineConfig) -> Self {
        self.pipeline = Some(config);
        self
    }

    pub fn resolver(mut self, resolver: Arc<dyn TransactionResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn finality_sink(mut self, sink: Arc<dyn FinalitySink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn build(self) -> Result<Arc<RaftNode>> {
        let id = self.config.node_id.clone();
        let storage: Arc<dyn LogStorage> = match self.storage {
            Some(storage) => storage,
            None => Arc::new(MemoryStorage::new()),
        };
        let (transport, network) = match (self.transport, self.network) {
            (Some(transport), network) => (transport, network),
            (None, network) => {
                let network = network.unwrap_or_else(LocalNetwork::new);
                let transport: Arc<dyn PeerTransport> = network.transport(&id);
                (transport, Some(network))
            }
        };

        let core = RaftCore::new(
            self.config.clone(),
            self.quorum.clone(),
            storage,
            Instant::now(),
        )?;
        let events = Arc::new(EventHub::new(self.config.event_buffer_size));
        let (event_queue, queued) = unbounded();
        spawn_event_publisher(&id, events.clone(), queued)?;

        let pipeline = match self.pipeline {
            Some(config) => {
                let pipeline = BlockPipeline::start(
                    config,
                    core.members().to_vec(),
                    self.quorum.clone(),
                    self.resolver,
                )?;
                pipeline.add_sink(Arc::new(FinalityEvents {
                    node_id: id.clone(),
                    events: event_queue.clone(),
                }));
                for sink in self.sinks {
                    pipeline.add_sink(sink);
                }
                Some(Arc::new(pipeline))
            }
            None => None,
        };

        let node = Arc::new_cyclic(|this| RaftNode {
            this: this.clone(),
            id: id.clone(),
            published: RwLock::new(core.state()),
            core: Mutex::new(core),
            config: self.config,
            transport,
            events,
            event_queue,
            pipeline,
            propose_lock: Mutex::new(()),
            replicating: Mutex::new(()),
            running: AtomicBool::new(false),
            ticker: Mutex::new(None),
            counters: NodeCounters::default(),
        });

        if let Some(network) = network {
            let handler: Arc<dyn RpcHandler> = node.clone();
            network.register(&id, Arc::downgrade(&handler));
        }
        tracing::debug!("Built node {}", id);
        Ok(node)
    }
}

impl Default for RaftNodeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn solo() -> Arc<RaftNode> {
        RaftNodeBuilder::new()
            .node_id("solo")
            .pipeline(PipelineConfig::default())
            .build()
            .unwrap()
    }

    #[test]
    fn test_single_node_elects_itself() {
        let node = solo();
        assert!(node.start_election());
        let state = node.get_consensus_state();
        assert_eq!(state.role, Role::Leader);
        assert_eq!(state.current_term, 1);
        assert_eq!(state.leader_id.as_deref(), Some("solo"));
    }

    #[test]
    fn test_follower_rejects_proposal() {
        let node = solo();
        let response = node.propose_block(BlockProposal::new("solo", 1, vec![]));
        assert!(!response.accepted);
        assert!(response.receipt.is_none());
        assert!(matches!(response.error, Some(ConsensusError::NotLeader { .. })));
    }

    #[test]
    fn test_single_node_finalizes_block() {
        let node = solo();
        node.start_election();

        let response = node.propose_transactions(vec!["tx-1".into()]);
        assert!(response.accepted);
        assert_eq!(response.block_number, 1);
        let commit = response
            .receipt
            .unwrap()
            .wait_timeout(Duration::from_secs(5))
            .unwrap()
            .unwrap();
        assert_eq!(commit.voters, vec!["solo".to_string()]);
        assert_eq!(node.get_consensus_state().commit_index, 2);
    }

    #[test]
    fn test_events_follow_state_changes() {
        let node = solo();
        let stream = node.stream_consensus_events(false);
        node.start_election();

        let mut kinds = Vec::new();
        while let Some(event) = stream.next_timeout(Duration::from_secs(5)) {
            kinds.push(event.event_type);
            if event.event_type == EventType::EntryCommitted {
                break;
            }
        }
        assert!(kinds.contains(&EventType::RoleChanged));
        assert!(kinds.contains(&EventType::EntryCommitted));
        assert!(!kinds.contains(&EventType::Heartbeat));
    }

    #[test]
    fn test_concurrent_candidates_in_one_term_get_one_vote() {
        let node = RaftNodeBuilder::new()
            .node_id("voter")
            .peers(vec!["c1".into(), "c2".into()])
            .build()
            .unwrap();
        let barrier = std::sync::Barrier::new(2);

        let granted: Vec<bool> = std::thread::scope(|scope| {
            let handles: Vec<_> = ["c1", "c2"]
                .into_iter()
                .map(|candidate| {
                    let node = &node;
                    let barrier = &barrier;
                    scope.spawn(move || {
                        barrier.wait();
                        node.handle_request_vote(&VoteRequest {
                            candidate_id: candidate.to_string(),
                            term: 1,
                            last_log_index: 0,
                            last_log_term: 0,
                        })
                        .vote_granted
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(granted.iter().filter(|g| **g).count(), 1);
        assert_eq!(node.get_consensus_state().current_term, 1);
    }

    /// Grants every vote and never accepts entries
    struct GrantOnly;

    impl RpcHandler for GrantOnly {
        fn request_vote(&self, req: VoteRequest) -> VoteResponse {
            VoteResponse {
                vote_granted: true,
                term: req.term,
                voter_id: "n2".into(),
            }
        }

        fn append_entries(&self, req: AppendEntriesRequest) -> AppendEntriesResponse {
            AppendEntriesResponse {
                success: false,
                term: req.term,
                follower_id: "n2".into(),
                match_index: 0,
                conflict_index: Some(1),
            }
        }

        fn install_snapshot(&self, req: InstallSnapshotRequest) -> InstallSnapshotResponse {
            InstallSnapshotResponse {
                success: false,
                term: req.term,
            }
        }
    }

    #[test]
    fn test_deposed_leader_fails_pending_block_with_stale_term() {
        let network = LocalNetwork::new();
        let peer: Arc<dyn RpcHandler> = Arc::new(GrantOnly);
        network.register("n2", Arc::downgrade(&peer));
        let node = RaftNodeBuilder::new()
            .node_id("n1")
            .peers(vec!["n2".into()])
            .network(network)
            .pipeline(PipelineConfig::default())
            .build()
            .unwrap();
        assert!(node.start_election());
        let response = node.propose_transactions(vec!["tx-1".into()]);
        assert!(response.accepted);

        node.handle_append_entries(&AppendEntriesRequest {
            leader_id: "n2".into(),
            term: 2,
            prev_log_index: 0,
            prev_log_term: 0,
            leader_commit: 0,
            entries: vec![],
            batch_append: false,
        });
        assert_eq!(node.role(), Role::Follower);

        let err = response
            .receipt
            .unwrap()
            .wait_timeout(Duration::from_secs(5))
            .unwrap()
            .unwrap_err();
        assert_eq!(err, ConsensusError::StaleTerm { current_term: 2 });
    }

    #[test]
    fn test_ticker_starts_and_stops() {
        let config = ConsensusConfig {
            node_id: "solo".into(),
            election_timeout_min_ms: 20,
            election_timeout_max_ms: 40,
            tick_interval_ms: 5,
            ..Default::default()
        };
        let node = RaftNodeBuilder::new().config(config).build().unwrap();
        node.start().unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while !node.is_leader() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(node.is_leader());
        node.shutdown();
        assert!(!node.is_running());
    }
}
