//! Pluggable quorum predicates
//!
//! Elections, commit advancement and block finality all ask the same question:
//! does this set of agreeing members make the decision binding? The answer is
//! always recomputed from the current voter set, never stored.

use crate::types::NodeId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Decides whether a set of voters is a quorum of `members`
pub trait QuorumPolicy: Send + Sync + fmt::Debug {
    fn is_quorum(&self, voters: &[&NodeId], members: &[NodeId]) -> bool;
}

/// Strict majority, one vote per member
#[derive(Debug, Clone, Copy, Default)]
pub struct Majority;

impl QuorumPolicy for Majority {
    fn is_quorum(&self, voters: &[&NodeId], members: &[NodeId]) -> bool {
        let counted = members.iter().filter(|m| voters.contains(m)).count();
        counted * 2 > members.len()
    }
}

/// Voting weight per member with a fractional threshold
///
/// A set is a quorum when its weight is strictly greater than
/// `threshold_num / threshold_den` of the total active weight. Members missing
/// from `weights` carry `default_weight`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Weighted {
    pub weights: HashMap<NodeId, u64>,
    pub default_weight: u64,
    pub threshold_num: u64,
    pub threshold_den: u64,
}

impl Weighted {
    pub fn new(weights: HashMap<NodeId, u64>) -> Self {
        Self {
            weights,
            default_weight: 1,
            threshold_num: 1,
            threshold_den: 2,
        }
    }

    /// Require strictly more than `num / den` of the total weight
    pub fn with_threshold(mut self, num: u64, den: u64) -> Self {
        self.threshold_num = num;
        self.threshold_den = den.max(1);
        self
    }

    fn weight_of(&self, id: &NodeId) -> u64 {
        self.weights.get(id).copied().unwrap_or(self.default_weight)
    }
}

impl QuorumPolicy for Weighted {
    fn is_quorum(&self, voters: &[&NodeId], members: &[NodeId]) -> bool {
        let total: u64 = members.iter().map(|m| self.weight_of(m)).sum();
        if total == 0 {
            return false;
        }
        let agreed: u64 = members
            .iter()
            .filter(|m| voters.contains(m))
            .map(|m| self.weight_of(m))
            .sum();
        (agreed as u128) * (self.threshold_den as u128)
            > (total as u128) * (self.threshold_num as u128)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn members(n: usize) -> Vec<NodeId> {
        (1..=n).map(|i| format!("n{}", i)).collect()
    }

    #[test]
    fn test_majority_for_cluster_sizes() {
        let three = members(3);
        let five = members(5);
        assert!(!Majority.is_quorum(&[&three[0]], &three));
        assert!(Majority.is_quorum(&[&three[0], &three[1]], &three));
        assert!(!Majority.is_quorum(&[&five[0], &five[1]], &five));
        assert!(Majority.is_quorum(&[&five[0], &five[1], &five[2]], &five));
    }

    #[test]
    fn test_majority_ignores_non_members() {
        let three = members(3);
        let stranger = "x".to_string();
        assert!(!Majority.is_quorum(&[&three[0], &stranger], &three));
    }

    #[test]
    fn test_single_node_is_its_own_quorum() {
        let one = members(1);
        assert!(Majority.is_quorum(&[&one[0]], &one));
    }

    #[test]
    fn test_weighted_heavy_member_decides() {
        let m = members(3);
        let policy = Weighted::new(HashMap::from([(m[0].clone(), 5)]));
        // total 7, n1 alone holds 5
        assert!(policy.is_quorum(&[&m[0]], &m));
        assert!(!policy.is_quorum(&[&m[1], &m[2]], &m));
    }

    #[test]
    fn test_weighted_two_thirds_threshold() {
        let m = members(4);
        let policy = Weighted::new(HashMap::new()).with_threshold(2, 3);
        assert!(!policy.is_quorum(&[&m[0], &m[1]], &m));
        assert!(policy.is_quorum(&[&m[0], &m[1], &m[2]], &m));
    }
}
