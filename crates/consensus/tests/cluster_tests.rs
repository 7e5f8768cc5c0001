//! Multi-node clusters over the in-memory network

use ledger_consensus::{
    AppendEntriesRequest, AppendEntriesResponse, BatchDelivery, Block, ConsensusConfig,
    ConsensusError, EventType, FinalitySink, InstallSnapshotRequest, InstallSnapshotResponse,
    LocalNetwork, Majority, NodeId, PipelineConfig, QuorumPolicy, RaftNode, RaftNodeBuilder,
    Result, Role, RpcHandler, Transaction, TransactionBatcher, TransactionBatcherConfig,
    TransactionSink, TxIndex, VoteRequest, VoteResponse,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const WAIT: Duration = Duration::from_secs(10);

#[derive(Default)]
struct Finalized {
    blocks: Mutex<Vec<Arc<Block>>>,
}

impl FinalitySink for Finalized {
    fn block_finalized(&self, block: &Arc<Block>) {
        self.blocks.lock().push(block.clone());
    }
}

struct Cluster {
    network: Arc<LocalNetwork>,
    nodes: Vec<Arc<RaftNode>>,
    index: Arc<TxIndex>,
    finalized: Arc<Finalized>,
}

impl Cluster {
    fn start(size: usize, pipeline: PipelineConfig) -> Self {
        Self::start_with(size, pipeline, |_| {})
    }

    /// Start a cluster after `tune` has adjusted each node's config
    fn start_with(
        size: usize,
        pipeline: PipelineConfig,
        tune: impl Fn(&mut ConsensusConfig),
    ) -> Self {
        let network = LocalNetwork::new();
        let index = Arc::new(TxIndex::new());
        let finalized = Arc::new(Finalized::default());
        let ids: Vec<NodeId> = (1..=size).map(|i| format!("n{}", i)).collect();

        let nodes: Vec<Arc<RaftNode>> = ids
            .iter()
            .enumerate()
            .map(|(i, id)| {
                let mut config = ConsensusConfig {
                    node_id: id.clone(),
                    peers: ids.iter().filter(|p| *p != id).cloned().collect(),
                    election_timeout_min_ms: 80,
                    election_timeout_max_ms: 160,
                    heartbeat_interval_ms: 20,
                    tick_interval_ms: 5,
                    rpc_timeout_ms: 200,
                    rng_seed: Some(7 + i as u64),
                    ..Default::default()
                };
                tune(&mut config);
                RaftNodeBuilder::new()
                    .config(config)
                    .network(network.clone())
                    .pipeline(pipeline.clone())
                    .resolver(index.clone())
                    .finality_sink(index.clone())
                    .finality_sink(finalized.clone())
                    .build()
                    .unwrap()
            })
            .collect();

        for node in &nodes {
            node.start().unwrap();
        }
        Self {
            network,
            nodes,
            index,
            finalized,
        }
    }

    fn node(&self, id: &str) -> &Arc<RaftNode> {
        self.nodes.iter().find(|n| n.id() == id).unwrap()
    }

    /// The leader of the highest term among `candidates`
    fn leader_among(&self, candidates: &[&Arc<RaftNode>]) -> Option<Arc<RaftNode>> {
        candidates
            .iter()
            .filter(|n| n.is_leader())
            .max_by_key(|n| n.get_consensus_state().current_term)
            .map(|n| Arc::clone(n))
    }

    fn wait_for_leader(&self) -> Arc<RaftNode> {
        let all: Vec<&Arc<RaftNode>> = self.nodes.iter().collect();
        wait_until(|| self.leader_among(&all))
    }

    fn shutdown(&self) {
        for node in &self.nodes {
            node.shutdown();
        }
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn wait_until<T>(mut check: impl FnMut() -> Option<T>) -> T {
    let deadline = Instant::now() + WAIT;
    loop {
        if let Some(value) = check() {
            return value;
        }
        assert!(Instant::now() < deadline, "condition not reached in time");
        thread::sleep(Duration::from_millis(5));
    }
}

fn three_nodes() -> Cluster {
    Cluster::start(3, PipelineConfig::default())
}

#[test]
fn test_at_most_one_leader_per_term() {
    let cluster = three_nodes();
    let mut leaders: BTreeMap<u64, BTreeSet<NodeId>> = BTreeMap::new();

    let until = Instant::now() + Duration::from_millis(600);
    while Instant::now() < until {
        for node in &cluster.nodes {
            let state = node.get_consensus_state();
            if state.role == Role::Leader {
                leaders
                    .entry(state.current_term)
                    .or_default()
                    .insert(state.node_id);
            }
        }
        thread::sleep(Duration::from_millis(2));
    }

    assert!(!leaders.is_empty());
    for (term, ids) in &leaders {
        assert_eq!(ids.len(), 1, "term {} had leaders {:?}", term, ids);
    }
}

#[test]
fn test_followers_learn_the_leader() {
    let cluster = three_nodes();
    let leader = cluster.wait_for_leader();

    for node in &cluster.nodes {
        wait_until(|| (node.leader_hint().as_ref() == Some(leader.id())).then_some(()));
    }
    let follower = cluster.nodes.iter().find(|n| n.id() != leader.id()).unwrap();
    let response = follower.propose_transactions(vec!["tx-x".into()]);
    assert!(!response.accepted);
    assert_eq!(response.leader_hint.as_ref(), Some(leader.id()));
}

#[test]
fn test_committed_entries_match_on_every_node() {
    let cluster = three_nodes();
    let leader = cluster.wait_for_leader();

    for i in 0..20u8 {
        leader.propose(vec![i]).unwrap();
    }
    let last = leader.get_consensus_state().last_log_index;
    for node in &cluster.nodes {
        wait_until(|| (node.get_consensus_state().commit_index >= last).then_some(()));
    }

    let reference = leader.log_entries(1, last as usize);
    assert_eq!(reference.len() as u64, last);
    for node in &cluster.nodes {
        let entries = node.log_entries(1, last as usize);
        let ours: Vec<_> = entries.iter().map(|e| (e.index, e.term, &e.command)).collect();
        let theirs: Vec<_> = reference.iter().map(|e| (e.index, e.term, &e.command)).collect();
        assert_eq!(ours, theirs, "log of {} diverges", node.id());
    }
}

#[test]
fn test_block_finalizes_with_majority_votes() {
    let cluster = three_nodes();
    let leader = cluster.wait_for_leader();
    cluster.index.insert("tx-a", b"a");
    cluster.index.insert("tx-b", b"b");

    let response = leader.propose_transactions(vec!["tx-a".into(), "tx-b".into()]);
    assert!(response.accepted);
    let commit = response
        .receipt
        .unwrap()
        .wait_timeout(WAIT)
        .unwrap()
        .unwrap();
    assert!(commit.voters.len() >= 2);
    assert!(commit.voters.contains(leader.id()));

    let blocks = wait_until(|| {
        let blocks = cluster.finalized.blocks.lock().clone();
        (!blocks.is_empty()).then_some(blocks)
    });
    assert_eq!(blocks.len(), 1);
    let block = &blocks[0];
    assert!(block.finalized);
    assert_eq!(block.transaction_ids, vec!["tx-a", "tx-b"]);

    let members: Vec<NodeId> = cluster.nodes.iter().map(|n| n.id().clone()).collect();
    let voters: Vec<&NodeId> = block.votes.iter().collect();
    assert!(Majority.is_quorum(&voters, &members));
}

#[test]
fn test_isolated_leader_cannot_finalize() {
    let cluster = Cluster::start(
        3,
        PipelineConfig {
            aggregation_timeout_ms: 300,
            ..Default::default()
        },
    );
    let leader = cluster.wait_for_leader();
    cluster.index.insert("tx-lost", b"");
    cluster.network.isolate(leader.id());

    let response = leader.propose_transactions(vec!["tx-lost".into()]);
    assert!(response.accepted);
    let block_number = response.block_number;
    let err = response
        .receipt
        .unwrap()
        .wait_timeout(WAIT)
        .unwrap()
        .unwrap_err();
    assert_eq!(err, ConsensusError::QuorumTimeout { block_number });
    assert!(err.is_retryable());
    assert!(cluster.finalized.blocks.lock().is_empty());
}

#[test]
fn test_new_leader_after_isolation_and_old_leader_steps_down() {
    let cluster = three_nodes();
    let old = cluster.wait_for_leader();
    let old_term = old.get_consensus_state().current_term;
    cluster.network.isolate(old.id());

    let rest: Vec<&Arc<RaftNode>> = cluster.nodes.iter().filter(|n| n.id() != old.id()).collect();
    let new = wait_until(|| cluster.leader_among(&rest));
    assert_ne!(new.id(), old.id());
    assert!(new.get_consensus_state().current_term > old_term);

    cluster.index.insert("tx-after", b"");
    let response = new.propose_transactions(vec!["tx-after".into()]);
    assert!(response.accepted);
    response.receipt.unwrap().wait_timeout(WAIT).unwrap().unwrap();

    cluster.network.heal();
    wait_until(|| (old.role() == Role::Follower).then_some(()));
    wait_until(|| (old.leader_hint().as_ref() == Some(new.id())).then_some(()));

    let committed = new.get_consensus_state().commit_index;
    wait_until(|| (old.get_consensus_state().commit_index >= committed).then_some(()));
}

#[test]
fn test_lagging_follower_catches_up_from_snapshot() {
    let cluster = three_nodes();
    let leader = cluster.wait_for_leader();
    let lagging = cluster
        .nodes
        .iter()
        .find(|n| n.id() != leader.id())
        .unwrap()
        .clone();
    cluster.network.isolate(lagging.id());

    for i in 0..30u8 {
        leader.propose(vec![i]).unwrap();
    }
    let last = leader.get_consensus_state().last_log_index;
    wait_until(|| (leader.get_consensus_state().last_applied >= last).then_some(()));
    leader.compact(last, b"applied-state".to_vec()).unwrap();
    assert_eq!(leader.get_consensus_state().snapshot_index, last);

    // compact the other up-to-date node too, so whoever leads after the heal
    // has to ship a snapshot
    let other = cluster
        .nodes
        .iter()
        .find(|n| n.id() != leader.id() && n.id() != lagging.id())
        .unwrap();
    wait_until(|| (other.get_consensus_state().last_applied >= last).then_some(()));
    other.compact(last, b"applied-state".to_vec()).unwrap();

    cluster.network.heal();
    wait_until(|| {
        let state = cluster.node(lagging.id()).get_consensus_state();
        (state.snapshot_index >= last && state.commit_index >= last).then_some(())
    });
    assert!(lagging.get_consensus_state().last_applied >= last);
}

#[test]
fn test_install_snapshot_truncates_node_log() {
    let node = RaftNodeBuilder::new().node_id("f1").build().unwrap();
    let response = node.handle_install_snapshot(&InstallSnapshotRequest {
        leader_id: "l1".into(),
        term: 1,
        last_included_index: 100,
        last_included_term: 1,
        data: vec![0xab; 1024],
        offset: 0,
        done: true,
    });
    assert!(response.success);

    let state = node.get_consensus_state();
    assert_eq!(state.snapshot_index, 100);
    assert_eq!(state.log_size, 0);
    assert_eq!(state.commit_index, 100);
    assert_eq!(state.leader_id.as_deref(), Some("l1"));
}

/// Routes each batch to whichever node currently leads
struct LeaderRouter {
    nodes: Vec<Arc<RaftNode>>,
}

impl TransactionSink for LeaderRouter {
    fn deliver(&self, transaction_ids: Vec<String>) -> Result<BatchDelivery> {
        let leader = self
            .nodes
            .iter()
            .find(|n| n.is_leader())
            .ok_or(ConsensusError::NotLeader { leader_hint: None })?;
        leader.deliver(transaction_ids)
    }
}

#[test]
fn test_batched_transactions_each_get_their_own_receipt() {
    let cluster = three_nodes();
    cluster.wait_for_leader();

    let router = Arc::new(LeaderRouter {
        nodes: cluster.nodes.clone(),
    });
    let config = TransactionBatcherConfig {
        max_batch_size: 8,
        batch_window_ms: 5,
        ..Default::default()
    };
    let batcher = TransactionBatcher::start(config, router, cluster.index.clone()).unwrap();

    let handles: Vec<_> = (0..40)
        .map(|i| {
            let id = format!("tx-{}", i);
            (id.clone(), batcher.submit(Transaction::new(id, vec![i as u8])))
        })
        .collect();

    let mut seen = HashSet::new();
    for (id, handle) in handles {
        let receipt = handle.wait_timeout(WAIT).unwrap().unwrap();
        assert_eq!(receipt.tx_id, id);
        assert!(seen.insert(receipt.tx_id));
    }
    assert_eq!(seen.len(), 40);
    batcher.shutdown();

    wait_until(|| {
        let finalized: usize = cluster
            .finalized
            .blocks
            .lock()
            .iter()
            .map(|b| b.transaction_ids.len())
            .sum();
        (finalized == 40).then_some(())
    });
}

#[test]
fn test_event_stream_reports_election_in_order() {
    let network = LocalNetwork::new();
    let node = RaftNodeBuilder::new()
        .node_id("solo")
        .network(network)
        .pipeline(PipelineConfig::default())
        .build()
        .unwrap();
    let stream = node.stream_consensus_events(false);

    assert!(node.start_election());
    let response = node.propose_transactions(vec![]);
    response.receipt.unwrap().wait_timeout(WAIT).unwrap().unwrap();

    let mut finalized = Vec::new();
    wait_until(|| {
        finalized.extend(stream.drain());
        finalized
            .iter()
            .any(|e| e.event_type == EventType::BlockFinalized)
            .then_some(())
    });

    assert_eq!(finalized[0].event_type, EventType::RoleChanged);
    assert!(finalized.windows(2).all(|w| w[0].sequence < w[1].sequence));
    assert!(finalized.iter().all(|e| e.event_type != EventType::Heartbeat));
    node.shutdown();
    stream.drain();
    assert!(stream.next_timeout(Duration::from_millis(10)).is_none());
}

#[test]
fn test_unread_event_stream_does_not_stall_consensus() {
    let cluster = Cluster::start_with(3, PipelineConfig::default(), |config| {
        config.event_buffer_size = 1;
    });
    // subscribed everywhere and never read
    let _stalled: Vec<_> = cluster
        .nodes
        .iter()
        .map(|n| n.stream_consensus_events(true))
        .collect();

    let leader = cluster.wait_for_leader();
    for i in 0..10u8 {
        leader.propose(vec![i]).unwrap();
    }
    let last = leader.get_consensus_state().last_log_index;
    for node in &cluster.nodes {
        wait_until(|| (node.get_consensus_state().commit_index >= last).then_some(()));
    }

    // a follower still answers promptly
    let follower = cluster.nodes.iter().find(|n| n.id() != leader.id()).unwrap();
    let started = Instant::now();
    follower.handle_append_entries(&AppendEntriesRequest {
        leader_id: leader.id().clone(),
        term: leader.get_consensus_state().current_term,
        prev_log_index: 0,
        prev_log_term: 0,
        leader_commit: 0,
        entries: vec![],
        batch_append: false,
    });
    assert!(started.elapsed() < Duration::from_secs(1));
}

/// Answers every RPC only after a long pause
struct Stalled;

impl RpcHandler for Stalled {
    fn request_vote(&self, req: VoteRequest) -> VoteResponse {
        thread::sleep(Duration::from_secs(2));
        VoteResponse {
            vote_granted: false,
            term: req.term,
            voter_id: "slow".into(),
        }
    }

    fn append_entries(&self, req: AppendEntriesRequest) -> AppendEntriesResponse {
        thread::sleep(Duration::from_secs(2));
        AppendEntriesResponse {
            success: false,
            term: req.term,
            follower_id: "slow".into(),
            match_index: 0,
            conflict_index: None,
        }
    }

    fn install_snapshot(&self, req: InstallSnapshotRequest) -> InstallSnapshotResponse {
        thread::sleep(Duration::from_secs(2));
        InstallSnapshotResponse {
            success: false,
            term: req.term,
        }
    }
}

#[test]
fn test_stalled_peer_cannot_pin_a_round() {
    let network = LocalNetwork::new();
    let stalled: Arc<dyn RpcHandler> = Arc::new(Stalled);
    network.register("slow", Arc::downgrade(&stalled));
    let node = RaftNodeBuilder::new()
        .config(ConsensusConfig {
            node_id: "n1".into(),
            peers: vec!["slow".into()],
            rpc_timeout_ms: 50,
            ..Default::default()
        })
        .network(network)
        .build()
        .unwrap();

    let started = Instant::now();
    assert!(!node.start_election());
    assert!(started.elapsed() < Duration::from_millis(1_000));
    assert_eq!(node.role(), Role::Candidate);
}
