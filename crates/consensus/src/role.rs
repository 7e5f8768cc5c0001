//! Role state machine
//!
//! Each role carries only the data that exists in that role: a follower knows
//! its leader, a candidate its votes, a leader the replication progress of
//! every peer. Transitions are a pure function of the current state and an
//! event; the core decides *when* an event happens (quorum checks, term
//! comparisons), this module decides *what* the next state is.

use crate::types::{NodeId, Role};
use std::collections::{BTreeMap, BTreeSet};

/// Leader-side replication progress for one peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerProgress {
    /// Next log index to send
    pub next_index: u64,
    /// Highest index known to be replicated on the peer
    pub match_index: u64,
    /// Byte offset of an in-flight snapshot transfer
    pub snapshot_offset: Option<u64>,
}

impl PeerProgress {
    fn new(last_index: u64) -> Self {
        Self {
            next_index: last_index + 1,
            match_index: 0,
            snapshot_offset: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum RoleState {
    Follower { leader_id: Option<NodeId> },
    Candidate { votes: BTreeSet<NodeId> },
    Leader { progress: BTreeMap<NodeId, PeerProgress> },
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum RoleEvent<'a> {
    /// A message carried a newer term
    HigherTerm,
    /// A valid AppendEntries/InstallSnapshot from the current-term leader
    LeaderContact(&'a NodeId),
    /// Election timer fired; the node votes for itself
    ElectionStarted(&'a NodeId),
    /// A peer granted its vote in the current term
    VoteGranted(&'a NodeId),
    /// Votes form a quorum
    Elected { peers: &'a [NodeId], last_index: u64 },
}

impl Default for RoleState {
    fn default() -> Self {
        RoleState::Follower { leader_id: None }
    }
}

impl RoleState {
    pub(crate) fn next(self, event: RoleEvent<'_>) -> RoleState {
        use RoleEvent::*;
        use RoleState::*;

        match (self, event) {
            (_, HigherTerm) => Follower { leader_id: None },
            (Leader { progress }, LeaderContact(_)) => Leader { progress },
            (_, LeaderContact(leader)) => Follower {
                leader_id: Some(leader.clone()),
            },
            (Leader { progress }, ElectionStarted(_)) => Leader { progress },
            (_, ElectionStarted(me)) => Candidate {
                votes: BTreeSet::from([me.clone()]),
            },
            (Candidate { mut votes }, VoteGranted(voter)) => {
                votes.insert(voter.clone());
                Candidate { votes }
            }
            (Candidate { .. }, Elected { peers, last_index }) => Leader {
                progress: peers
                    .iter()
                    .map(|p| (p.clone(), PeerProgress::new(last_index)))
                    .collect(),
            },
            (state, _) => state,
        }
    }

    pub(crate) fn role(&self) -> Role {
        match self {
            RoleState::Follower { .. } => Role::Follower,
            RoleState::Candidate { .. } => Role::Candidate,
            RoleState::Leader { .. } => Role::Leader,
        }
    }

    pub(crate) fn leader_id(&self) -> Option<&NodeId> {
        match self {
            RoleState::Follower { leader_id } => leader_id.as_ref(),
            _ => None,
        }
    }
}
