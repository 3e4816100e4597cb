//! Commit graph: mapping from commit id to its set of parent ids.
//!
//! The graph is a DAG by construction. Commit ids are content hashes that
//! cover the parent ids, so a cycle would require a hash fixpoint. Traversals
//! still track visited ids, which keeps them finite on hostile input.
//!
//! # Live graph vs. full history
//!
//! A replica only keeps the recent part of its history in memory; older
//! portions are compacted into snapshot blobs (see [`crate::compact`]). A
//! parent id that is not a key of the live graph is therefore not an error:
//! it is either resolvable through the snapshot chain or a boundary of the
//! portion being exchanged. Traversals record such ids but cannot walk past
//! them.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::ids::CommitId;

/// The head commit ids of a branch. More than one head means conflict.
pub type Heads = BTreeSet<CommitId>;

// ---------------------------------------------------------------------------
// Parent lookup
// ---------------------------------------------------------------------------

/// Anything that can answer "what are the parents of this commit".
pub trait ParentLookup {
    fn parents(&self, id: &CommitId) -> Option<&BTreeSet<CommitId>>;

    fn contains_commit(&self, id: &CommitId) -> bool {
        self.parents(id).is_some()
    }
}

/// Read-only union of two graphs; the first answers before the second.
#[derive(Debug, Clone, Copy)]
pub struct GraphUnion<'a> {
    pub first: &'a CommitGraph,
    pub second: &'a CommitGraph,
}

impl ParentLookup for GraphUnion<'_> {
    fn parents(&self, id: &CommitId) -> Option<&BTreeSet<CommitId>> {
        self.first.parents(id).or_else(|| self.second.parents(id))
    }
}

// ---------------------------------------------------------------------------
// CommitGraph
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommitGraph {
    edges: BTreeMap<CommitId, BTreeSet<CommitId>>,
}

impl ParentLookup for CommitGraph {
    fn parents(&self, id: &CommitId) -> Option<&BTreeSet<CommitId>> {
        self.edges.get(id)
    }
}

impl CommitGraph {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a commit with its parents.
    ///
    /// Returns `false` and leaves the graph untouched if the id is already
    /// present: ids are content hashes, so a second entry for the same id
    /// carries the same parents.
    pub fn insert(&mut self, id: CommitId, parents: BTreeSet<CommitId>) -> bool {
        if self.edges.contains_key(&id) {
            return false;
        }
        self.edges.insert(id, parents);
        true
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.edges.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    #[must_use]
    pub fn contains(&self, id: &CommitId) -> bool {
        self.edges.contains_key(id)
    }

    #[must_use]
    pub fn get(&self, id: &CommitId) -> Option<&BTreeSet<CommitId>> {
        self.edges.get(id)
    }

    /// Iterate `(id, parents)` entries in id order.
    pub fn iter(&self) -> impl Iterator<Item = (&CommitId, &BTreeSet<CommitId>)> {
        self.edges.iter()
    }

    /// Iterate commit ids in id order.
    pub fn ids(&self) -> impl Iterator<Item = &CommitId> {
        self.edges.keys()
    }

    /// Commits without parents.
    #[must_use]
    pub fn roots(&self) -> Vec<&CommitId> {
        self.edges
            .iter()
            .filter(|(_, parents)| parents.is_empty())
            .map(|(id, _)| id)
            .collect()
    }

    /// Parent ids referenced by some entry but not present as keys.
    ///
    /// For a live graph these must all be resolvable through the snapshot
    /// history.
    #[must_use]
    pub fn dangling_parents(&self) -> BTreeSet<CommitId> {
        self.edges
            .values()
            .flatten()
            .filter(|parent| !self.edges.contains_key(*parent))
            .cloned()
            .collect()
    }

    /// Key-wise union; entries already present in `self` win.
    pub fn extend_from(&mut self, other: &Self) {
        for (id, parents) in &other.edges {
            if !self.edges.contains_key(id) {
                self.edges.insert(id.clone(), parents.clone());
            }
        }
    }

    /// Key-wise union of two graphs.
    #[must_use]
    pub fn union(&self, other: &Self) -> Self {
        let mut merged = self.clone();
        merged.extend_from(other);
        merged
    }

    /// Entries of `self` whose ids are not keys of `other`.
    #[must_use]
    pub fn difference(&self, other: &Self) -> Self {
        self.edges
            .iter()
            .filter(|(id, _)| !other.contains(id))
            .map(|(id, parents)| (id.clone(), parents.clone()))
            .collect()
    }

    /// Entries whose ids are in `ids`.
    #[must_use]
    pub fn restrict(&self, ids: &BTreeSet<CommitId>) -> Self {
        self.edges
            .iter()
            .filter(|(id, _)| ids.contains(*id))
            .map(|(id, parents)| (id.clone(), parents.clone()))
            .collect()
    }

    /// Check if `a` is a strict causal ancestor of `b`.
    #[must_use]
    pub fn is_ancestor(&self, a: &CommitId, b: &CommitId) -> bool {
        a != b && ancestors(self, [b]).contains(a)
    }
}

impl FromIterator<(CommitId, BTreeSet<CommitId>)> for CommitGraph {
    fn from_iter<I: IntoIterator<Item = (CommitId, BTreeSet<CommitId>)>>(iter: I) -> Self {
        Self {
            edges: iter.into_iter().collect(),
        }
    }
}

impl CommitGraph {
    /// Build a graph from literal `(id, parents)` pairs.
    ///
    /// ```
    /// use cdvcs_core::dag::graph::CommitGraph;
    ///
    /// let graph = CommitGraph::from_pairs(&[("1", &[]), ("2", &["1"])]);
    /// assert_eq!(graph.len(), 2);
    /// ```
    #[must_use]
    pub fn from_pairs(pairs: &[(&str, &[&str])]) -> Self {
        pairs
            .iter()
            .map(|(id, parents)| {
                (
                    CommitId::from(*id),
                    parents.iter().map(|p| CommitId::from(*p)).collect(),
                )
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Structural queries
// ---------------------------------------------------------------------------

/// Every commit id that is a key of the graph.
#[must_use]
pub fn all_commit_ids(graph: &CommitGraph) -> BTreeSet<CommitId> {
    graph.ids().cloned().collect()
}

/// `true` if a branch is in the unresolved-conflict state.
#[must_use]
pub fn has_multiple_heads(heads: &Heads) -> bool {
    heads.len() > 1
}

/// All strict ancestors of `starts` (transitive parents).
///
/// Performs a BFS up the parent chain. Ids referenced as parents are
/// included even when the graph holds no entry for them; the walk simply
/// stops there. The start ids themselves are included only if one of them
/// is an ancestor of another.
pub fn ancestors<'a, G, I>(graph: &G, starts: I) -> BTreeSet<CommitId>
where
    G: ParentLookup + ?Sized,
    I: IntoIterator<Item = &'a CommitId>,
{
    let mut visited = BTreeSet::new();
    let mut queue = VecDeque::new();

    for start in starts {
        if let Some(parents) = graph.parents(start) {
            for parent in parents {
                if visited.insert(parent.clone()) {
                    queue.push_back(parent.clone());
                }
            }
        }
    }

    while let Some(current) = queue.pop_front() {
        if let Some(parents) = graph.parents(&current) {
            for parent in parents {
                if visited.insert(parent.clone()) {
                    queue.push_back(parent.clone());
                }
            }
        }
    }

    visited
}

/// The subgraph reachable from `heads` by walking parent edges.
///
/// Heads and ancestors without an entry in `graph` are skipped; with a
/// compacted graph they live in the snapshot chain.
#[must_use]
pub fn isolate_branch<G: ParentLookup + ?Sized>(graph: &G, heads: &Heads) -> CommitGraph {
    let mut isolated = CommitGraph::new();
    let mut queue: VecDeque<&CommitId> = heads.iter().collect();

    while let Some(current) = queue.pop_front() {
        if isolated.contains(current) {
            continue;
        }
        if let Some(parents) = graph.parents(current) {
            isolated.insert(current.clone(), parents.clone());
            queue.extend(parents.iter());
        }
    }

    isolated
}

/// Drop every id that is a strict ancestor of another id in the set.
///
/// Used to prune branch heads: a head replaced by one of its descendants is
/// no longer a head. A single multi-source walk over the ancestry decides
/// all candidates at once.
#[must_use]
pub fn remove_ancestors<G: ParentLookup + ?Sized>(graph: &G, heads: &Heads) -> Heads {
    if heads.len() < 2 {
        return heads.clone();
    }
    let covered = ancestors(graph, heads.iter());
    heads
        .iter()
        .filter(|head| !covered.contains(*head))
        .cloned()
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(list: &[&str]) -> BTreeSet<CommitId> {
        list.iter().map(|s| CommitId::from(*s)).collect()
    }

    //      1
    //     / \
    //    2   3
    //     \ /
    //      4
    fn diamond() -> CommitGraph {
        CommitGraph::from_pairs(&[("1", &[]), ("2", &["1"]), ("3", &["1"]), ("4", &["2", "3"])])
    }

    // ===================================================================
    // Basic structure
    // ===================================================================

    #[test]
    fn new_repository_has_single_root() {
        let graph = CommitGraph::from_pairs(&[("1", &[])]);
        assert_eq!(graph.roots(), vec![&CommitId::from("1")]);
        assert!(graph.dangling_parents().is_empty());
    }

    #[test]
    fn insert_is_idempotent() {
        let mut graph = CommitGraph::new();
        assert!(graph.insert("1".into(), BTreeSet::new()));
        assert!(!graph.insert("1".into(), ids(&["bogus"])));
        assert_eq!(graph.get(&"1".into()), Some(&BTreeSet::new()));
    }

    #[test]
    fn all_commit_ids_lists_keys() {
        assert_eq!(all_commit_ids(&diamond()), ids(&["1", "2", "3", "4"]));
    }

    #[test]
    fn union_and_difference() {
        let a = CommitGraph::from_pairs(&[("1", &[]), ("2", &["1"])]);
        let b = CommitGraph::from_pairs(&[("1", &[]), ("3", &["1"])]);
        let merged = a.union(&b);
        assert_eq!(all_commit_ids(&merged), ids(&["1", "2", "3"]));
        assert_eq!(all_commit_ids(&merged.difference(&a)), ids(&["3"]));
    }

    #[test]
    fn dangling_parents_reported() {
        let graph = CommitGraph::from_pairs(&[("5", &["4"]), ("6", &["5"])]);
        assert_eq!(graph.dangling_parents(), ids(&["4"]));
    }

    // ===================================================================
    // Traversal
    // ===================================================================

    #[test]
    fn ancestors_excludes_start() {
        let graph = diamond();
        assert_eq!(ancestors(&graph, [&"4".into()]), ids(&["1", "2", "3"]));
        assert!(ancestors(&graph, [&"1".into()]).is_empty());
    }

    #[test]
    fn is_ancestor_is_strict() {
        let graph = diamond();
        assert!(graph.is_ancestor(&"1".into(), &"4".into()));
        assert!(!graph.is_ancestor(&"4".into(), &"1".into()));
        assert!(!graph.is_ancestor(&"2".into(), &"2".into()));
        assert!(!graph.is_ancestor(&"2".into(), &"3".into()));
    }

    #[test]
    fn isolate_branch_walks_reachable_commits() {
        let mut graph = diamond();
        graph.insert("5".into(), ids(&["1"]));
        let isolated = isolate_branch(&graph, &ids(&["2"]));
        assert_eq!(all_commit_ids(&isolated), ids(&["1", "2"]));

        let isolated = isolate_branch(&graph, &ids(&["4", "5"]));
        assert_eq!(all_commit_ids(&isolated), ids(&["1", "2", "3", "4", "5"]));
    }

    #[test]
    fn isolate_branch_stops_at_missing_entries() {
        let graph = CommitGraph::from_pairs(&[("5", &["4"]), ("6", &["5"])]);
        let isolated = isolate_branch(&graph, &ids(&["6"]));
        assert_eq!(all_commit_ids(&isolated), ids(&["5", "6"]));
    }

    // ===================================================================
    // Head pruning
    // ===================================================================

    #[test]
    fn remove_ancestors_prunes_replaced_heads() {
        let graph = diamond();
        assert_eq!(remove_ancestors(&graph, &ids(&["1", "4"])), ids(&["4"]));
        assert_eq!(remove_ancestors(&graph, &ids(&["2", "3"])), ids(&["2", "3"]));
        assert_eq!(remove_ancestors(&graph, &ids(&["2", "3", "4"])), ids(&["4"]));
    }

    #[test]
    fn remove_ancestors_sees_boundary_parents() {
        // 4 lives in a snapshot; 5 references it directly.
        let graph = CommitGraph::from_pairs(&[("5", &["4"])]);
        assert_eq!(remove_ancestors(&graph, &ids(&["4", "5"])), ids(&["5"]));
    }

    #[test]
    fn multiple_heads_detection() {
        assert!(!has_multiple_heads(&ids(&["1"])));
        assert!(has_multiple_heads(&ids(&["1", "2"])));
    }

    #[test]
    fn graph_union_prefers_first() {
        let a = CommitGraph::from_pairs(&[("2", &["1"])]);
        let b = CommitGraph::from_pairs(&[("1", &[]), ("3", &["2"])]);
        let view = GraphUnion { first: &a, second: &b };
        assert_eq!(ancestors(&view, [&"3".into()]), ids(&["1", "2"]));
    }
}
