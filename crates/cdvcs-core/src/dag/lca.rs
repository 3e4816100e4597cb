//! Lowest Common Ancestors across two causal graphs.
//!
//! Given head sets on two replicas' graphs, the *cut* is the set of most
//! recent commits that are ancestors of (or equal to) heads on **both**
//! sides. It marks where the histories diverged and is the input for
//! splicing one history into the other.
//!
//! # Algorithm
//!
//! A bidirectional BFS walks up from both head sets, one frontier level per
//! side per round. A commit visited by both walks is common; neither walk
//! expands past it, because everything above it is common too. The walk ends
//! when both frontiers are empty. Common commits that are ancestors of other
//! common commits are then dropped, which leaves the lowest ones.
//!
//! While walking, side B records every commit that side A's graph does not
//! know. Those entries are the *return paths*: the part of B's history that
//! has to be grafted into A to make B's heads resolvable there.
//!
//! # Tie-breaking
//!
//! Diamond histories can have several lowest common ancestors. All of them
//! are part of the cut; no single one is privileged.
//!
//! # Edge Cases
//!
//! - Identical head sets: the cut is the head set, nothing to graft.
//! - One side's heads are ancestors of the other's: the cut is those heads.
//! - Disjoint histories: the cut is empty and the return paths hold B's
//!   whole reachable history.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use tracing::trace;

use super::graph::{CommitGraph, GraphUnion, Heads, ParentLookup, remove_ancestors};
use crate::ids::CommitId;

/// Errors from LCA computation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LcaError {
    /// A head is not present in the graph it was declared against.
    #[error("head commit not found in graph: {0}")]
    UnknownCommit(CommitId),
}

/// Result of [`lowest_common_ancestors`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Lca {
    /// Lowest commits common to both histories.
    pub cut: BTreeSet<CommitId>,
    /// Entries of B's graph, reachable from B's heads, that A lacks.
    pub return_paths_b: CommitGraph,
}

/// Compute the cut between `heads_a` on `graph_a` and `heads_b` on `graph_b`.
///
/// # Errors
///
/// Returns [`LcaError::UnknownCommit`] if a head is missing from its graph.
///
/// # Performance
///
/// Proportional to the commits walked before the frontiers meet, not the
/// whole history, as long as both sides stay on their own lines.
pub fn lowest_common_ancestors(
    graph_a: &CommitGraph,
    heads_a: &Heads,
    graph_b: &CommitGraph,
    heads_b: &Heads,
) -> Result<Lca, LcaError> {
    for head in heads_a {
        if !graph_a.contains(head) {
            return Err(LcaError::UnknownCommit(head.clone()));
        }
    }
    for head in heads_b {
        if !graph_b.contains(head) && !graph_a.contains(head) {
            return Err(LcaError::UnknownCommit(head.clone()));
        }
    }

    if heads_a == heads_b {
        return Ok(Lca {
            cut: heads_a.clone(),
            return_paths_b: CommitGraph::new(),
        });
    }

    // Content ids make both graphs agree on every shared entry, so B can be
    // walked over the union and A over its own graph.
    let view_b = GraphUnion {
        first: graph_b,
        second: graph_a,
    };

    let mut visited_a: BTreeSet<CommitId> = heads_a.clone();
    let mut visited_b: BTreeSet<CommitId> = heads_b.clone();
    let mut common: BTreeSet<CommitId> = heads_a.intersection(heads_b).cloned().collect();

    let mut frontier_a: VecDeque<CommitId> =
        heads_a.iter().filter(|h| !common.contains(*h)).cloned().collect();
    let mut frontier_b: VecDeque<CommitId> =
        heads_b.iter().filter(|h| !common.contains(*h)).cloned().collect();

    // A head of B might already be known to A without being one of A's heads.
    let mut return_paths_b = CommitGraph::new();
    for head in &frontier_b {
        record_return_path(graph_a, graph_b, head, &mut return_paths_b);
    }

    let mut rounds = 0_usize;
    while !frontier_a.is_empty() || !frontier_b.is_empty() {
        rounds += 1;
        frontier_a = step_level(graph_a, frontier_a, &mut visited_a, &visited_b, &mut common);
        frontier_b = step_level(&view_b, frontier_b, &mut visited_b, &visited_a, &mut common);
        for id in &frontier_b {
            record_return_path(graph_a, graph_b, id, &mut return_paths_b);
        }
    }

    let cut = remove_ancestors(&view_b, &common);
    trace!(rounds, cut = cut.len(), grafted = return_paths_b.len(), "lca walk finished");

    Ok(Lca {
        cut,
        return_paths_b,
    })
}

/// Expand one frontier level. Newly visited commits that the other walk has
/// already seen become common and are not expanded further.
fn step_level<G: ParentLookup + ?Sized>(
    graph: &G,
    frontier: VecDeque<CommitId>,
    visited: &mut BTreeSet<CommitId>,
    other_visited: &BTreeSet<CommitId>,
    common: &mut BTreeSet<CommitId>,
) -> VecDeque<CommitId> {
    let mut next = VecDeque::new();
    for current in frontier {
        // The other side may have reached this commit after we queued it.
        if other_visited.contains(&current) {
            common.insert(current);
            continue;
        }
        let Some(parents) = graph.parents(&current) else {
            continue;
        };
        for parent in parents {
            if !visited.insert(parent.clone()) {
                continue;
            }
            if other_visited.contains(parent) {
                common.insert(parent.clone());
            } else {
                next.push_back(parent.clone());
            }
        }
    }
    next
}

fn record_return_path(
    graph_a: &CommitGraph,
    graph_b: &CommitGraph,
    id: &CommitId,
    return_paths: &mut CommitGraph,
) {
    if graph_a.contains(id) {
        return;
    }
    if let Some(parents) = graph_b.get(id) {
        return_paths.insert(id.clone(), parents.clone());
    }
}

/// Graft `return_paths` into `graph` starting from the `cut`.
///
/// Walks downward from the cut (and from return-path commits that hang off
/// ids outside the return paths, such as other known commits or roots),
/// inserting each reached commit with its full parent set. Ids already in
/// `graph` are never duplicated or overwritten.
#[must_use]
pub fn merge_ancestors(
    graph: &CommitGraph,
    cut: &BTreeSet<CommitId>,
    return_paths: &CommitGraph,
) -> CommitGraph {
    let mut children: BTreeMap<&CommitId, Vec<&CommitId>> = BTreeMap::new();
    for (id, parents) in return_paths.iter() {
        for parent in parents {
            children.entry(parent).or_default().push(id);
        }
    }

    let mut merged = graph.clone();
    let mut queue: VecDeque<&CommitId> = cut.iter().collect();

    for (id, parents) in return_paths.iter() {
        let anchored = parents.iter().all(|p| !return_paths.contains(p));
        if anchored && merged.insert(id.clone(), parents.clone()) {
            queue.push_back(id);
        }
    }

    while let Some(node) = queue.pop_front() {
        let Some(kids) = children.get(node) else {
            continue;
        };
        for child in kids {
            if merged.contains(child) {
                continue;
            }
            if let Some(parents) = return_paths.get(child) {
                merged.insert((*child).clone(), parents.clone());
                queue.push_back(child);
            }
        }
    }

    merged
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::graph::all_commit_ids;

    fn ids(list: &[&str]) -> BTreeSet<CommitId> {
        list.iter().map(|s| CommitId::from(*s)).collect()
    }

    // ===================================================================
    // lowest_common_ancestors
    // ===================================================================

    #[test]
    fn simple_fork_across_graphs() {
        let a = CommitGraph::from_pairs(&[("1", &[]), ("2", &["1"]), ("3", &["2"])]);
        let b = CommitGraph::from_pairs(&[("1", &[]), ("2", &["1"]), ("4", &["2"])]);

        let lca = lowest_common_ancestors(&a, &ids(&["3"]), &b, &ids(&["4"])).unwrap();
        assert_eq!(lca.cut, ids(&["2"]));
        assert_eq!(lca.return_paths_b, CommitGraph::from_pairs(&[("4", &["2"])]));
    }

    #[test]
    fn identical_heads() {
        let a = CommitGraph::from_pairs(&[("1", &[]), ("2", &["1"])]);
        let lca = lowest_common_ancestors(&a, &ids(&["2"]), &a, &ids(&["2"])).unwrap();
        assert_eq!(lca.cut, ids(&["2"]));
        assert!(lca.return_paths_b.is_empty());
    }

    #[test]
    fn fast_forward_cut_is_local_head() {
        let a = CommitGraph::from_pairs(&[("1", &[]), ("2", &["1"])]);
        let b = CommitGraph::from_pairs(&[("1", &[]), ("2", &["1"]), ("3", &["2"]), ("4", &["3"])]);

        let lca = lowest_common_ancestors(&a, &ids(&["2"]), &b, &ids(&["4"])).unwrap();
        assert_eq!(lca.cut, ids(&["2"]));
        assert_eq!(all_commit_ids(&lca.return_paths_b), ids(&["3", "4"]));
    }

    #[test]
    fn remote_behind_local() {
        let a = CommitGraph::from_pairs(&[("1", &[]), ("2", &["1"]), ("3", &["2"]), ("4", &["3"])]);
        let b = CommitGraph::from_pairs(&[("1", &[]), ("2", &["1"])]);

        let lca = lowest_common_ancestors(&a, &ids(&["4"]), &b, &ids(&["2"])).unwrap();
        assert_eq!(lca.cut, ids(&["2"]));
        assert!(lca.return_paths_b.is_empty());
    }

    #[test]
    fn asymmetric_depth() {
        //  1 → 2 → 3 → 4 → 5   (A)
        //   \→ 6               (B)
        let a = CommitGraph::from_pairs(&[
            ("1", &[]),
            ("2", &["1"]),
            ("3", &["2"]),
            ("4", &["3"]),
            ("5", &["4"]),
        ]);
        let b = CommitGraph::from_pairs(&[("1", &[]), ("6", &["1"])]);

        let lca = lowest_common_ancestors(&a, &ids(&["5"]), &b, &ids(&["6"])).unwrap();
        assert_eq!(lca.cut, ids(&["1"]));
        assert_eq!(all_commit_ids(&lca.return_paths_b), ids(&["6"]));
    }

    #[test]
    fn criss_cross_yields_two_ancestors() {
        //     1
        //    / \
        //   2   3
        //   |\ /|
        //   | X |
        //   |/ \|
        //   4   5
        let graph = CommitGraph::from_pairs(&[
            ("1", &[]),
            ("2", &["1"]),
            ("3", &["1"]),
            ("4", &["2", "3"]),
            ("5", &["2", "3"]),
        ]);
        let lca = lowest_common_ancestors(&graph, &ids(&["4"]), &graph, &ids(&["5"])).unwrap();
        assert_eq!(lca.cut, ids(&["2", "3"]));
    }

    #[test]
    fn merge_commit_on_remote_grafts_both_parents() {
        // Remote head 5 merges a known commit (3) with a remote-only line (4).
        let a = CommitGraph::from_pairs(&[("1", &[]), ("2", &["1"]), ("3", &["2"])]);
        let b = CommitGraph::from_pairs(&[
            ("1", &[]),
            ("2", &["1"]),
            ("3", &["2"]),
            ("4", &["1"]),
            ("5", &["3", "4"]),
        ]);

        let lca = lowest_common_ancestors(&a, &ids(&["3"]), &b, &ids(&["5"])).unwrap();
        assert_eq!(lca.cut, ids(&["3"]));
        assert_eq!(all_commit_ids(&lca.return_paths_b), ids(&["4", "5"]));

        let merged = merge_ancestors(&a, &lca.cut, &lca.return_paths_b);
        assert_eq!(merged.get(&"5".into()), Some(&ids(&["3", "4"])));
        assert!(merged.dangling_parents().is_empty());
    }

    #[test]
    fn disjoint_histories() {
        let a = CommitGraph::from_pairs(&[("1", &[])]);
        let b = CommitGraph::from_pairs(&[("9", &[]), ("10", &["9"])]);

        let lca = lowest_common_ancestors(&a, &ids(&["1"]), &b, &ids(&["10"])).unwrap();
        assert!(lca.cut.is_empty());
        assert_eq!(all_commit_ids(&lca.return_paths_b), ids(&["9", "10"]));

        let merged = merge_ancestors(&a, &lca.cut, &lca.return_paths_b);
        assert_eq!(all_commit_ids(&merged), ids(&["1", "9", "10"]));
    }

    #[test]
    fn lca_is_symmetric_in_cut() {
        let a = CommitGraph::from_pairs(&[("1", &[]), ("2", &["1"]), ("3", &["1"])]);
        let ab = lowest_common_ancestors(&a, &ids(&["2"]), &a, &ids(&["3"])).unwrap();
        let ba = lowest_common_ancestors(&a, &ids(&["3"]), &a, &ids(&["2"])).unwrap();
        assert_eq!(ab.cut, ba.cut);
    }

    #[test]
    fn unknown_head_is_an_error() {
        let a = CommitGraph::from_pairs(&[("1", &[])]);
        let err = lowest_common_ancestors(&a, &ids(&["7"]), &a, &ids(&["1"])).unwrap_err();
        assert_eq!(err, LcaError::UnknownCommit("7".into()));
    }

    // ===================================================================
    // merge_ancestors
    // ===================================================================

    #[test]
    fn merge_ancestors_does_not_duplicate() {
        let a = CommitGraph::from_pairs(&[("1", &[]), ("2", &["1"])]);
        let paths = CommitGraph::from_pairs(&[("2", &["1"]), ("3", &["2"])]);
        let merged = merge_ancestors(&a, &ids(&["2"]), &paths);
        assert_eq!(all_commit_ids(&merged), ids(&["1", "2", "3"]));
        assert_eq!(merged.get(&"2".into()), Some(&ids(&["1"])));
    }

    #[test]
    fn merge_ancestors_with_empty_paths_is_identity() {
        let a = CommitGraph::from_pairs(&[("1", &[]), ("2", &["1"])]);
        let merged = merge_ancestors(&a, &ids(&["2"]), &CommitGraph::new());
        assert_eq!(merged, a);
    }
}
