//! Deterministic membership-list merge
//!
//! Every record starts in its own cluster. Decisions are applied strictly in
//! pair order:
//! - "yes" between different clusters moves every member of the higher id
//!   into the lower id (cost proportional to the moved cluster)
//! - "no" between members of the same cluster is a transitivity violation;
//!   it is recorded and the clusters are left unchanged
//!
//! Final ids are renumbered contiguously in order of first appearance.

use serde::{Deserialize, Serialize};

/// One decided candidate pair, expressed as record slots
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Edge {
    /// Position of the pair in candidate order
    pub pair_index: usize,
    pub left: usize,
    pub right: usize,
    pub is_match: bool,
}

/// A "no" decision contradicting earlier merges
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitivityViolation {
    pub pair_index: usize,
    /// Record index of the left endpoint
    pub left: usize,
    /// Record index of the right endpoint
    pub right: usize,
    /// Final (renumbered) cluster holding both endpoints
    pub cluster_id: usize,
}

/// Result of the merge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    /// Contiguous cluster id per record, in record order
    pub cluster_ids: Vec<usize>,
    pub num_clusters: usize,
    pub violations: Vec<TransitivityViolation>,
}

/// Merge `edges` over records
///
/// `slots[i]` is the slot of record `i`: records sharing a slot (duplicate
/// content) always share a cluster. Every slot and edge endpoint must be a
/// valid record index.
pub fn consolidate(slots: &[usize], edges: &[Edge]) -> Partition {
    let n = slots.len();
    let mut cluster_of: Vec<usize> = (0..n).collect();
    let mut members: Vec<Vec<usize>> = (0..n).map(|i| vec![i]).collect();
    let mut pending: Vec<Edge> = Vec::new();

    for edge in edges {
        let a = cluster_of[edge.left];
        let b = cluster_of[edge.right];

        if edge.is_match {
            if a == b {
                continue;
            }
            let (low, high) = if a < b { (a, b) } else { (b, a) };
            let moved = std::mem::take(&mut members[high]);
            for &m in &moved {
                cluster_of[m] = low;
            }
            members[low].extend(moved);
        } else if a == b {
            tracing::debug!(
                pair_index = edge.pair_index,
                left = edge.left,
                right = edge.right,
                "Negative decision inside an existing cluster"
            );
            pending.push(*edge);
        }
    }

    // Renumber by first appearance in record order
    let mut final_id: Vec<Option<usize>> = vec![None; n];
    let mut next = 0;
    let cluster_ids: Vec<usize> = slots
        .iter()
        .map(|&slot| {
            let internal = cluster_of[slot];
            *final_id[internal].get_or_insert_with(|| {
                next += 1;
                next - 1
            })
        })
        .collect();

    let violations = pending
        .into_iter()
        .map(|edge| TransitivityViolation {
            pair_index: edge.pair_index,
            left: edge.left,
            right: edge.right,
            cluster_id: final_id[cluster_of[edge.left]].unwrap_or_default(),
        })
        .collect();

    Partition {
        cluster_ids,
        num_clusters: next,
        violations,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn edge(pair_index: usize, left: usize, right: usize, is_match: bool) -> Edge {
        Edge {
            pair_index,
            left,
            right,
            is_match,
        }
    }

    #[test]
    fn test_transitive_merge_with_violation() {
        // a=b yes, b=c yes, a=c no
        let edges = [edge(0, 0, 1, true), edge(1, 1, 2, true), edge(2, 0, 2, false)];
        let partition = consolidate(&[0, 1, 2], &edges);
        assert_eq!(partition.cluster_ids, vec![0, 0, 0]);
        assert_eq!(partition.num_clusters, 1);
        assert_eq!(
            partition.violations,
            vec![TransitivityViolation {
                pair_index: 2,
                left: 0,
                right: 2,
                cluster_id: 0
            }]
        );
    }

    #[test]
    fn test_renumbering_is_contiguous_by_first_appearance() {
        // Records 3 and 1 merge; record 0 and 2 stay alone
        let partition = consolidate(&[0, 1, 2, 3], &[edge(0, 3, 1, true)]);
        assert_eq!(partition.cluster_ids, vec![0, 1, 2, 1]);
        assert_eq!(partition.num_clusters, 3);
        assert!(partition.violations.is_empty());
    }

    #[test]
    fn test_no_between_distinct_clusters_is_not_a_violation() {
        let partition = consolidate(&[0, 1], &[edge(0, 0, 1, false)]);
        assert_eq!(partition.cluster_ids, vec![0, 1]);
        assert!(partition.violations.is_empty());
    }

    #[test]
    fn test_duplicate_slots_share_cluster() {
        // Record 2 duplicates record 0
        let partition = consolidate(&[0, 1, 0], &[]);
        assert_eq!(partition.cluster_ids, vec![0, 1, 0]);
        assert_eq!(partition.num_clusters, 2);
    }

    #[test]
    fn test_empty_and_single() {
        let empty = consolidate(&[], &[]);
        assert!(empty.cluster_ids.is_empty());
        assert_eq!(empty.num_clusters, 0);

        let single = consolidate(&[0], &[]);
        assert_eq!(single.cluster_ids, vec![0]);
        assert_eq!(single.num_clusters, 1);
    }
}
