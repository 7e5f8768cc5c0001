//! Peer transport
//!
//! The consensus core never talks to the network itself. A node is handed a
//! [`PeerTransport`] and calls it with a deadline per RPC. [`LocalNetwork`] is
//! an in-memory implementation connecting nodes of one process, with link and
//! node partitions for fault injection.

use crate::error::{ConsensusError, Result};
use crate::types::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    NodeId, VoteRequest, VoteResponse,
};
use crossbeam_channel::{bounded, RecvTimeoutError};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Outbound side of the peer RPCs
///
/// Every call must return by its `timeout`, with a
/// [`ConsensusError::Timeout`] if the peer has not answered.
pub trait PeerTransport: Send + Sync {
    fn request_vote(
        &self,
        peer: &str,
        req: &VoteRequest,
        timeout: Duration,
    ) -> Result<VoteResponse>;

    fn append_entries(
        &self,
        peer: &str,
        req: &AppendEntriesRequest,
        timeout: Duration,
    ) -> Result<AppendEntriesResponse>;

    fn install_snapshot(
        &self,
        peer: &str,
        req: &InstallSnapshotRequest,
        timeout: Duration,
    ) -> Result<InstallSnapshotResponse>;
}

/// Inbound side of the peer RPCs
pub trait RpcHandler: Send + Sync {
    fn request_vote(&self, req: VoteRequest) -> VoteResponse;

    fn append_entries(&self, req: AppendEntriesRequest) -> AppendEntriesResponse;

    fn install_snapshot(&self, req: InstallSnapshotRequest) -> InstallSnapshotResponse;
}

/// In-process network of nodes
#[derive(Default)]
pub struct LocalNetwork {
    nodes: DashMap<NodeId, Weak<dyn RpcHandler>>,
    isolated: RwLock<HashSet<NodeId>>,
    cut_links: RwLock<HashSet<(NodeId, NodeId)>>,
}

impl LocalNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make `handler` reachable as `id`
    pub fn register(&self, id: &str, handler: Weak<dyn RpcHandler>) {
        self.nodes.insert(id.to_string(), handler);
    }

    pub fn unregister(&self, id: &str) {
        self.nodes.remove(id);
    }

    /// Transport used by node `id` to reach the others
    pub fn transport(self: &Arc<Self>, id: &str) -> Arc<LocalTransport> {
        Arc::new(LocalTransport {
            from: id.to_string(),
            network: Arc::clone(self),
        })
    }

    /// Cut every link to and from `id`
    pub fn isolate(&self, id: &str) {
        tracing::info!("Network: isolating {}", id);
        self.isolated.write().insert(id.to_string());
    }

    /// Cut the link between `a` and `b` in both directions
    pub fn disconnect(&self, a: &str, b: &str) {
        let mut cut = self.cut_links.write();
        cut.insert((a.to_string(), b.to_string()));
        cut.insert((b.to_string(), a.to_string()));
    }

    /// Restore all links
    pub fn heal(&self) {
        tracing::info!("Network: healing all partitions");
        self.isolated.write().clear();
        self.cut_links.write().clear();
    }

    pub fn is_reachable(&self, from: &str, to: &str) -> bool {
        let isolated = self.isolated.read();
        if isolated.contains(from) || isolated.contains(to) {
            return false;
        }
        !self
            .cut_links
            .read()
            .contains(&(from.to_string(), to.to_string()))
    }

    fn route(&self, from: &str, to: &str) -> Result<Arc<dyn RpcHandler>> {
        if !self.is_reachable(from, to) {
            return Err(ConsensusError::Transport {
                peer: to.to_string(),
                reason: "unreachable".to_string(),
            });
        }
        self.nodes
            .get(to)
            .and_then(|weak| weak.upgrade())
            .ok_or_else(|| ConsensusError::Transport {
                peer: to.to_string(),
                reason: "unknown peer".to_string(),
            })
    }
}

/// One node's view of a [`LocalNetwork`]
pub struct LocalTransport {
    from: NodeId,
    network: Arc<LocalNetwork>,
}

impl LocalTransport {
    /// Deliver a call on a worker thread and give up once `timeout` passes
    ///
    /// A handler that answers late keeps running to completion, but its
    /// answer is discarded.
    fn call<T: Send + 'static>(
        &self,
        peer: &str,
        what: &str,
        timeout: Duration,
        f: impl FnOnce(&dyn RpcHandler) -> T + Send + 'static,
    ) -> Result<T> {
        let handler = self.network.route(&self.from, peer)?;
        let (reply_tx, reply_rx) = bounded(1);
        std::thread::Builder::new()
            .name(format!("rpc-{}-{}", self.from, peer))
            .spawn(move || {
                let _ = reply_tx.send(f(handler.as_ref()));
            })
            .map_err(|e| ConsensusError::Transport {
                peer: peer.to_string(),
                reason: format!("dispatch failed: {}", e),
            })?;

        let response = match reply_rx.recv_timeout(timeout) {
            Ok(response) => response,
            Err(RecvTimeoutError::Timeout) => {
                return Err(ConsensusError::timeout(format!("{} to {}", what, peer)));
            }
            Err(RecvTimeoutError::Disconnected) => {
                return Err(ConsensusError::Transport {
                    peer: peer.to_string(),
                    reason: "handler panicked".to_string(),
                });
            }
        };
        // the reply path can be cut while the call was in flight
        if !self.network.is_reachable(peer, &self.from) {
            return Err(ConsensusError::Transport {
                peer: peer.to_string(),
                reason: "unreachable".to_string(),
            });
        }
        Ok(response)
    }
}

impl PeerTransport for LocalTransport {
    fn request_vote(
        &self,
        peer: &str,
        req: &VoteRequest,
        timeout: Duration,
    ) -> Result<VoteResponse> {
        let req = req.clone();
        self.call(peer, "RequestVote", timeout, move |h| h.request_vote(req))
    }

    fn append_entries(
        &self,
        peer: &str,
        req: &AppendEntriesRequest,
        timeout: Duration,
    ) -> Result<AppendEntriesResponse> {
        let req = req.clone();
        self.call(peer, "AppendEntries", timeout, move |h| h.append_entries(req))
    }

    fn install_snapshot(
        &self,
        peer: &str,
        req: &InstallSnapshotRequest,
        timeout: Duration,
    ) -> Result<InstallSnapshotResponse> {
        let req = req.clone();
        self.call(peer, "InstallSnapshot", timeout, move |h| {
            h.install_snapshot(req)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    struct Echo {
        id: NodeId,
        delay: Duration,
    }

    impl RpcHandler for Echo {
        fn request_vote(&self, req: VoteRequest) -> VoteResponse {
            std::thread::sleep(self.delay);
            VoteResponse {
                vote_granted: true,
                term: req.term,
                voter_id: self.id.clone(),
            }
        }

        fn append_entries(&self, req: AppendEntriesRequest) -> AppendEntriesResponse {
            AppendEntriesResponse {
                success: true,
                term: req.term,
                follower_id: self.id.clone(),
                match_index: req.prev_log_index,
                conflict_index: None,
            }
        }

        fn install_snapshot(&self, req: InstallSnapshotRequest) -> InstallSnapshotResponse {
            InstallSnapshotResponse {
                success: true,
                term: req.term,
            }
        }
    }

    fn vote_request() -> VoteRequest {
        VoteRequest {
            candidate_id: "a".into(),
            term: 1,
            last_log_index: 0,
            last_log_term: 0,
        }
    }

    fn setup(delay: Duration) -> (Arc<LocalNetwork>, Arc<Echo>) {
        let network = LocalNetwork::new();
        let echo = Arc::new(Echo {
            id: "b".into(),
            delay,
        });
        let handler: Arc<dyn RpcHandler> = echo.clone();
        network.register("b", Arc::downgrade(&handler));
        (network, echo)
    }

    #[test]
    fn test_call_reaches_registered_peer() {
        let (network, _echo) = setup(Duration::ZERO);
        let transport = network.transport("a");
        let resp = transport
            .request_vote("b", &vote_request(), Duration::from_secs(1))
            .unwrap();
        assert!(resp.vote_granted);
        assert_eq!(resp.voter_id, "b");
    }

    #[test]
    fn test_isolated_peer_is_unreachable() {
        let (network, _echo) = setup(Duration::ZERO);
        network.isolate("b");
        let err = network
            .transport("a")
            .request_vote("b", &vote_request(), Duration::from_secs(1))
            .unwrap_err();
        assert!(matches!(err, ConsensusError::Transport { .. }));

        network.heal();
        assert!(network.is_reachable("a", "b"));
    }

    #[test]
    fn test_slow_peer_times_out() {
        let (network, _echo) = setup(Duration::from_millis(30));
        let err = network
            .transport("a")
            .request_vote("b", &vote_request(), Duration::from_millis(5))
            .unwrap_err();
        assert!(matches!(err, ConsensusError::Timeout { .. }));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_stalled_peer_does_not_block_past_deadline() {
        let (network, _echo) = setup(Duration::from_millis(1_500));
        let started = Instant::now();
        let err = network
            .transport("a")
            .request_vote("b", &vote_request(), Duration::from_millis(50))
            .unwrap_err();
        assert!(matches!(err, ConsensusError::Timeout { .. }));
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn test_dropped_node_is_unknown() {
        let (network, echo) = setup(Duration::ZERO);
        drop(echo);
        let err = network
            .transport("a")
            .request_vote("b", &vote_request(), Duration::from_secs(1))
            .unwrap_err();
        assert!(matches!(err, ConsensusError::Transport { .. }));
    }
}
