//! Causal commit graph.
//!
//! Commits form a Merkle-DAG: every commit is identified by the hash of its
//! content including its parent ids, so the graph cannot contain cycles and
//! two replicas that know the same id agree on its parents.
//!
//! # Sub-modules
//!
//! - [`commit`]: Commit values and the wire projection.
//!   ([`Commit`](commit::Commit), [`WireCommit`](commit::WireCommit))
//! - [`graph`]: `id -> parents` map with structural queries.
//!   ([`CommitGraph`](graph::CommitGraph), [`isolate_branch`](graph::isolate_branch),
//!   [`remove_ancestors`](graph::remove_ancestors))
//! - [`hash`]: Commit id computation and verification.
//!   ([`commit_id`](hash::commit_id), [`verify_chain`](hash::verify_chain))
//! - [`lca`]: Lowest common ancestors across two graphs and grafting.
//!   ([`lowest_common_ancestors`](lca::lowest_common_ancestors),
//!   [`merge_ancestors`](lca::merge_ancestors))

pub mod commit;
pub mod graph;
pub mod hash;
pub mod lca;
