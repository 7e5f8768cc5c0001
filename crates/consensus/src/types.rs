//! Core types for consensus messages, log entries and observability

use crate::completion::CompletionHandle;
use crate::error::{ConsensusError, Result};
use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};

/// Identifier of a cluster member
pub type NodeId = String;

/// Current unix time in milliseconds
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Role of a node in the current term
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    /// Passive, accepts entries from the leader and votes when asked
    Follower,
    /// Collecting votes to become leader
    Candidate,
    /// Replicates the log and drives block proposals
    Leader,
}

impl Default for Role {
    fn default() -> Self {
        Self::Follower
    }
}

/// What a log entry carries
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize,
)]
pub enum CommandType {
    /// Appended by a new leader to commit entries of earlier terms
    Noop,
    /// A borsh-encoded [`BlockRef`]
    Block,
    /// Opaque application command
    Application,
}

/// A single entry in the replicated log
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct LogEntry {
    /// Position in the log (1-based, contiguous)
    pub index: u64,
    /// Term of the leader that created the entry
    pub term: u64,
    /// Command bytes
    pub command: Vec<u8>,
    pub command_type: CommandType,
    /// Creation time (unix millis)
    pub timestamp: i64,
}

impl LogEntry {
    pub fn new(index: u64, term: u64, command: Vec<u8>, command_type: CommandType) -> Self {
        Self {
            index,
            term,
            command,
            command_type,
            timestamp: now_millis(),
        }
    }

    /// Decode the block reference of a `Block` entry
    pub fn block_ref(&self) -> Option<BlockRef> {
        if self.command_type != CommandType::Block {
            return None;
        }
        BlockRef::from_bytes(&self.command).ok()
    }
}

/// Transaction references of a proposed block, as stored in the log
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct BlockRef {
    pub block_number: u64,
    pub proposer_id: NodeId,
    pub block_hash: Vec<u8>,
    pub transaction_ids: Vec<String>,
}

impl BlockRef {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        borsh::to_vec(self).map_err(|e| ConsensusError::Encoding(e.to_string()))
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        borsh::from_slice(data).map_err(|e| ConsensusError::Encoding(e.to_string()))
    }
}

/// RequestVote arguments
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct VoteRequest {
    pub candidate_id: NodeId,
    pub term: u64,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

/// RequestVote result
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct VoteResponse {
    pub vote_granted: bool,
    /// Receiver's term after processing the request
    pub term: u64,
    pub voter_id: NodeId,
}

/// AppendEntries arguments (an empty `entries` is a heartbeat)
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub leader_id: NodeId,
    pub term: u64,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub leader_commit: u64,
    pub entries: Vec<LogEntry>,
    /// Bulk replication of many entries in one round trip
    pub batch_append: bool,
}

impl AppendEntriesRequest {
    pub fn is_heartbeat(&self) -> bool {
        self.entries.is_empty()
    }
}

/// AppendEntries result
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub success: bool,
    pub term: u64,
    pub follower_id: NodeId,
    /// Highest index known to match the leader (0 on rejection)
    pub match_index: u64,
    /// On a consistency rejection, where the leader should resume
    pub conflict_index: Option<u64>,
}

/// InstallSnapshot arguments (one chunk)
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct InstallSnapshotRequest {
    pub leader_id: NodeId,
    pub term: u64,
    pub last_included_index: u64,
    pub last_included_term: u64,
    pub data: Vec<u8>,
    /// Byte offset of `data` within the snapshot
    pub offset: u64,
    pub done: bool,
}

/// InstallSnapshot result
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct InstallSnapshotResponse {
    pub success: bool,
    pub term: u64,
}

/// Point-in-time view of a node
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusState {
    pub node_id: NodeId,
    pub role: Role,
    pub current_term: u64,
    /// Entries currently held in the log (excludes the compacted prefix)
    pub log_size: u64,
    pub commit_index: u64,
    pub last_log_index: u64,
    pub last_applied: u64,
    /// Last index covered by the installed snapshot
    pub snapshot_index: u64,
    pub leader_id: Option<NodeId>,
    pub voted_for: Option<NodeId>,
}

/// Kind of state transition carried by a [`ConsensusEvent`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    RoleChanged,
    VoteGranted,
    EntryCommitted,
    Heartbeat,
    SnapshotInstalled,
    BlockFinalized,
}

/// Immutable record of a state transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusEvent {
    /// Position in the node's event stream, assigned at publish time
    pub sequence: u64,
    pub event_type: EventType,
    pub node_id: NodeId,
    pub term: u64,
    /// Log index or block number, depending on the event
    pub index: Option<u64>,
    /// Unix millis
    pub timestamp: i64,
    pub detail: String,
}

impl ConsensusEvent {
    pub fn new(event_type: EventType, node_id: &str, term: u64) -> Self {
        Self {
            sequence: 0,
            event_type,
            node_id: node_id.to_string(),
            term,
            index: None,
            timestamp: now_millis(),
            detail: String::new(),
        }
    }

    pub fn with_index(mut self, index: u64) -> Self {
        self.index = Some(index);
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = detail.into();
        self
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| ConsensusError::Encoding(e.to_string()))
    }
}

/// blake3 over the block number, proposer and NUL-separated transaction ids
pub fn block_hash(proposer_id: &str, block_number: u64, transaction_ids: &[String]) -> Vec<u8> {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&block_number.to_le_bytes());
    hasher.update(proposer_id.as_bytes());
    for id in transaction_ids {
        hasher.update(id.as_bytes());
        hasher.update(&[0u8]);
    }
    hasher.finalize().as_bytes().to_vec()
}

/// A block proposal submitted to the leader
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockProposal {
    pub proposer_id: NodeId,
    pub block_number: u64,
    pub block_hash: Vec<u8>,
    pub transaction_ids: Vec<String>,
}

impl BlockProposal {
    /// Build a proposal whose hash covers its number, proposer and transactions
    pub fn new(proposer_id: &str, block_number: u64, transaction_ids: Vec<String>) -> Self {
        Self {
            proposer_id: proposer_id.to_string(),
            block_number,
            block_hash: block_hash(proposer_id, block_number, &transaction_ids),
            transaction_ids,
        }
    }

    pub(crate) fn block_ref(&self) -> BlockRef {
        BlockRef {
            block_number: self.block_number,
            proposer_id: self.proposer_id.clone(),
            block_hash: self.block_hash.clone(),
            transaction_ids: self.transaction_ids.clone(),
        }
    }
}

/// Summary of a finalized block handed back to its proposer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockCommit {
    pub block_number: u64,
    pub block_hash: Vec<u8>,
    pub log_index: u64,
    pub voters: Vec<NodeId>,
}

/// Resolves once the block is finalized or definitively failed
pub type FinalityReceipt = CompletionHandle<Result<BlockCommit>>;

/// Answer to a [`BlockProposal`]
#[derive(Debug)]
pub struct ProposalResponse {
    pub accepted: bool,
    pub block_number: u64,
    /// Log index of the block entry when accepted
    pub log_index: Option<u64>,
    /// Where to redirect when this node is not the leader
    pub leader_hint: Option<NodeId>,
    pub error: Option<ConsensusError>,
    /// Finality outcome of an accepted block
    pub receipt: Option<FinalityReceipt>,
}

impl ProposalResponse {
    pub(crate) fn rejected(block_number: u64, error: ConsensusError) -> Self {
        let leader_hint = match &error {
            ConsensusError::NotLeader { leader_hint } => leader_hint.clone(),
            _ => None,
        };
        Self {
            accepted: false,
            block_number,
            log_index: None,
            leader_hint,
            error: Some(error),
            receipt: None,
        }
    }
}
