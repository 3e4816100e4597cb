//! CDVCS: the commit-graph CRDT.
//!
//! A CDVCS value is a causal graph of commits plus named branches pointing at
//! head commits. Replicas exchange [`CdvcsOp`] deltas carrying only the graph
//! entries and branch heads relevant to a change; [`CdvcsState::join`] merges
//! a delta into local state.
//!
//! # Join
//!
//! - The commit graphs are unioned key-wise. Ids are content hashes, so two
//!   entries for the same id are always identical.
//! - For every branch named in the op, the head sets are unioned and heads
//!   that are strict ancestors of another head are pruned. Branches that are
//!   already conflicted are re-pruned as well, since new edges can make
//!   their heads comparable.
//!
//! Join is idempotent, commutative and monotonic: graph keys only grow and
//! a head only disappears when one of its descendants replaces it.
//!
//! # Local operations
//!
//! [`new_repository`], [`commit`], [`branch`], [`merge`], [`merge_heads`]
//! and [`checkout`] are pure. They return a [`Staged`] bundle with the next
//! state, the op to propagate and the commit values to persist. Replicated
//! effects are always produced by joining the op, so local and remote
//! application share one code path.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::dag::commit::{COMMIT_VERSION, Commit, Transaction};
use crate::dag::graph::{CommitGraph, GraphUnion, Heads, ParentLookup, isolate_branch, remove_ancestors};
use crate::dag::hash::commit_id;
use crate::dag::lca::{LcaError, lowest_common_ancestors, merge_ancestors};
use crate::error::{CoreError, Rejection};
use crate::ids::{CommitId, ContentId, Context};

/// Type tag of the CDVCS kind.
pub const CDVCS_TAG: &str = "cdvcs";

/// Branch created by [`new_repository`].
pub const DEFAULT_BRANCH: &str = "master";

pub const SCHEMA_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// State and op
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    #[serde(rename = "type")]
    pub kind: String,
    pub version: u32,
}

impl Default for Schema {
    fn default() -> Self {
        Self {
            kind: CDVCS_TAG.to_string(),
            version: SCHEMA_VERSION,
        }
    }
}

/// The full replicated value.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CdvcsState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub schema: Schema,
    pub branches: BTreeMap<String, Heads>,
    pub commit_graph: CommitGraph,
    /// Content id of the ordered list of snapshot ids compacted out of
    /// `commit_graph`. Local to a replica, never carried in ops.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history: Option<ContentId>,
    /// Checked-out branch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub head: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update: Option<DateTime<Utc>>,
}

/// What produced an op. Informational; join treats all methods alike.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OpMethod {
    Init,
    Commit,
    Branch,
    Merge,
    Pull,
}

/// A downstream delta: a partial CDVCS value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CdvcsOp {
    pub method: OpMethod,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub commit_graph: CommitGraph,
    pub branches: BTreeMap<String, Heads>,
}

impl CdvcsOp {
    #[must_use]
    pub fn new(method: OpMethod) -> Self {
        Self {
            method,
            id: None,
            description: None,
            commit_graph: CommitGraph::new(),
            branches: BTreeMap::new(),
        }
    }

    /// Every commit id the op introduces.
    pub fn commit_ids(&self) -> impl Iterator<Item = &CommitId> {
        self.commit_graph.ids()
    }

    /// Branch names the op touches.
    #[must_use]
    pub fn identities(&self) -> BTreeSet<String> {
        self.branches.keys().cloned().collect()
    }

    /// Restrict the op to `allowed` branches, keeping only the part of the
    /// graph reachable from their heads.
    #[must_use]
    pub fn select_identities(&self, allowed: &BTreeSet<String>) -> Self {
        let mut selected = Self {
            method: self.method,
            id: self.id.clone(),
            description: self.description.clone(),
            commit_graph: CommitGraph::new(),
            branches: BTreeMap::new(),
        };
        for (name, heads) in &self.branches {
            if !allowed.contains(name) {
                continue;
            }
            selected
                .commit_graph
                .extend_from(&isolate_branch(&self.commit_graph, heads));
            selected.branches.insert(name.clone(), heads.clone());
        }
        selected
    }
}

// Keeps the smaller value so metadata converges regardless of arrival order.
fn join_meta(slot: &mut Option<String>, incoming: Option<&String>) {
    if let Some(incoming) = incoming {
        match slot {
            Some(current) if current.as_str() <= incoming.as_str() => {}
            _ => *slot = Some(incoming.clone()),
        }
    }
}

impl CdvcsState {
    /// The bootstrapped empty value used by the type registry.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn heads(&self, branch: &str) -> Option<&Heads> {
        self.branches.get(branch)
    }

    /// `true` if `branch` exists and has more than one head.
    #[must_use]
    pub fn has_multiple_heads(&self, branch: &str) -> bool {
        self.heads(branch).is_some_and(|heads| heads.len() > 1)
    }

    /// Join a downstream op into this state.
    pub fn join(&mut self, op: &CdvcsOp) {
        self.join_with_history(op, &CommitGraph::new());
    }

    /// Join, pruning heads over the live graph plus `history`.
    ///
    /// After compaction the path between two heads may run through commits
    /// that only live in snapshots; passing the resolved snapshot graph lets
    /// the pruning see them. Op entries already compacted into `history`
    /// stay out of the live graph.
    #[instrument(level = "trace", skip_all, fields(method = ?op.method, commits = op.commit_graph.len()))]
    pub fn join_with_history(&mut self, op: &CdvcsOp, history: &CommitGraph) {
        join_meta(&mut self.id, op.id.as_ref());
        join_meta(&mut self.description, op.description.as_ref());

        for (id, parents) in op.commit_graph.iter() {
            if !history.contains(id) {
                self.commit_graph.insert(id.clone(), parents.clone());
            }
        }

        for (name, incoming) in &op.branches {
            self.branches
                .entry(name.clone())
                .or_default()
                .extend(incoming.iter().cloned());
        }

        let lookup = GraphUnion {
            first: &self.commit_graph,
            second: history,
        };
        for (name, heads) in &mut self.branches {
            if heads.len() > 1 && (op.branches.contains_key(name) || !op.commit_graph.is_empty()) {
                *heads = remove_ancestors(&lookup, heads);
            }
        }
    }

    /// `join` on a copy.
    #[must_use]
    pub fn joined(&self, op: &CdvcsOp) -> Self {
        let mut next = self.clone();
        next.join(op);
        next
    }
}

// ---------------------------------------------------------------------------
// Local operations
// ---------------------------------------------------------------------------

/// Result of a local operation.
#[derive(Debug, Clone)]
pub struct Staged {
    /// State after joining `op`.
    pub state: CdvcsState,
    /// Delta to propagate to other replicas.
    pub op: CdvcsOp,
    /// New commit values to persist under their ids.
    pub commits: BTreeMap<CommitId, Commit>,
}

impl Staged {
    fn from_op(
        ctx: &Context,
        base: &CdvcsState,
        history: &CommitGraph,
        op: CdvcsOp,
        commits: BTreeMap<CommitId, Commit>,
    ) -> Self {
        let mut state = base.clone();
        state.join_with_history(&op, history);
        state.last_update = Some(ctx.now());
        Self { state, op, commits }
    }
}

fn make_commit(
    ctx: &Context,
    author: &str,
    parents: Heads,
    transactions: Vec<Transaction>,
) -> Result<(CommitId, Commit), CoreError> {
    let commit = Commit {
        transactions,
        parents,
        author: author.to_string(),
        crdt: CDVCS_TAG.to_string(),
        version: COMMIT_VERSION,
        ts: ctx.now(),
    };
    let id = commit_id(ctx, &commit)?;
    Ok((id, commit))
}

fn single_head<'a>(state: &'a CdvcsState, branch: &str) -> Result<&'a CommitId, CoreError> {
    let heads = state
        .heads(branch)
        .ok_or_else(|| CoreError::UnknownBranch(branch.to_string()))?;
    match heads.first() {
        Some(head) if heads.len() == 1 => Ok(head),
        _ => Err(CoreError::MultipleHeads {
            branch: branch.to_string(),
            heads: heads.len(),
        }),
    }
}

/// Create a repository with a root commit on `master`.
///
/// # Errors
///
/// Returns an error if the root commit cannot be hashed.
pub fn new_repository(
    ctx: &Context,
    author: &str,
    description: Option<&str>,
    init_transactions: Vec<Transaction>,
) -> Result<Staged, CoreError> {
    let (root, commit) = make_commit(ctx, author, Heads::new(), init_transactions)?;

    let mut op = CdvcsOp::new(OpMethod::Init);
    op.id = Some(root.to_string());
    op.description = description.map(str::to_string);
    op.commit_graph.insert(root.clone(), BTreeSet::new());
    op.branches
        .insert(DEFAULT_BRANCH.to_string(), Heads::from([root.clone()]));

    let mut staged = Staged::from_op(
        ctx,
        &CdvcsState::empty(),
        &CommitGraph::new(),
        op,
        BTreeMap::from([(root, commit)]),
    );
    staged.state.head = Some(DEFAULT_BRANCH.to_string());
    Ok(staged)
}

/// Append a commit to `branch`.
///
/// # Errors
///
/// [`CoreError::UnknownBranch`] if the branch does not exist,
/// [`CoreError::MultipleHeads`] if it is conflicted.
pub fn commit(
    ctx: &Context,
    state: &CdvcsState,
    author: &str,
    branch: &str,
    transactions: Vec<Transaction>,
) -> Result<Staged, CoreError> {
    let parent = single_head(state, branch)?.clone();
    let (id, commit) = make_commit(ctx, author, Heads::from([parent.clone()]), transactions)?;

    let mut op = CdvcsOp::new(OpMethod::Commit);
    op.commit_graph.insert(id.clone(), BTreeSet::from([parent]));
    op.branches.insert(branch.to_string(), Heads::from([id.clone()]));

    Ok(Staged::from_op(ctx, state, &CommitGraph::new(), op, BTreeMap::from([(id, commit)])))
}

/// Create branch `name` pointing at `parent`.
///
/// # Errors
///
/// [`CoreError::BranchExists`] if `name` is taken, [`CoreError::UnknownCommit`]
/// if `parent` is neither in the live graph nor a current head.
pub fn branch(ctx: &Context, state: &CdvcsState, name: &str, parent: &CommitId) -> Result<Staged, CoreError> {
    branch_with_history(ctx, state, &CommitGraph::new(), name, parent)
}

/// [`branch`] on a compacted value: `parent` may also live in `history`.
///
/// # Errors
///
/// As [`branch`].
pub fn branch_with_history(
    ctx: &Context,
    state: &CdvcsState,
    history: &CommitGraph,
    name: &str,
    parent: &CommitId,
) -> Result<Staged, CoreError> {
    if state.branches.contains_key(name) {
        return Err(CoreError::BranchExists(name.to_string()));
    }
    let lookup = GraphUnion {
        first: &state.commit_graph,
        second: history,
    };
    let known_head = state.branches.values().any(|heads| heads.contains(parent));
    if !lookup.contains_commit(parent) && !known_head {
        return Err(CoreError::UnknownCommit(parent.clone()));
    }

    let mut op = CdvcsOp::new(OpMethod::Branch);
    if let Some(parents) = lookup.parents(parent) {
        op.commit_graph.insert(parent.clone(), parents.clone());
    }
    op.branches.insert(name.to_string(), Heads::from([parent.clone()]));

    Ok(Staged::from_op(ctx, state, history, op, BTreeMap::new()))
}

/// Three-way merge of remote history into `branch`.
///
/// Grafts the part of `remote_graph` reachable from `remote_heads` that the
/// local graph lacks, then commits over local and remote heads together.
///
/// # Errors
///
/// [`CoreError::UnknownBranch`] for a missing branch, or an LCA error when a
/// head cannot be found in its graph.
pub fn merge(
    ctx: &Context,
    state: &CdvcsState,
    author: &str,
    branch: &str,
    remote_graph: &CommitGraph,
    remote_heads: &Heads,
    correcting_transactions: Vec<Transaction>,
) -> Result<Staged, CoreError> {
    merge_with_history(
        ctx,
        state,
        &CommitGraph::new(),
        author,
        branch,
        remote_graph,
        remote_heads,
        correcting_transactions,
    )
}

/// [`merge`] on a compacted value: the ancestry walk sees the live graph
/// plus `history`, and commits already in either are not grafted again.
///
/// # Errors
///
/// As [`merge`].
#[allow(clippy::too_many_arguments)]
pub fn merge_with_history(
    ctx: &Context,
    state: &CdvcsState,
    history: &CommitGraph,
    author: &str,
    branch: &str,
    remote_graph: &CommitGraph,
    remote_heads: &Heads,
    correcting_transactions: Vec<Transaction>,
) -> Result<Staged, CoreError> {
    let local_heads = state
        .heads(branch)
        .ok_or_else(|| CoreError::UnknownBranch(branch.to_string()))?;

    let known = history.union(&state.commit_graph);
    let lca = lowest_common_ancestors(&known, local_heads, remote_graph, remote_heads)?;
    let grafted = merge_ancestors(&known, &lca.cut, &lca.return_paths_b);

    let parents: Heads = local_heads.union(remote_heads).cloned().collect();
    let (id, commit) = make_commit(ctx, author, parents.clone(), correcting_transactions)?;

    let mut op = CdvcsOp::new(OpMethod::Merge);
    op.commit_graph = grafted.difference(&known);
    op.commit_graph.insert(id.clone(), parents);
    op.branches.insert(branch.to_string(), Heads::from([id.clone()]));

    debug!(%branch, cut = lca.cut.len(), grafted = op.commit_graph.len(), "staged merge");
    Ok(Staged::from_op(ctx, state, history, op, BTreeMap::from([(id, commit)])))
}

/// Resolve a conflicted `branch` by committing over all of its heads.
///
/// # Errors
///
/// [`CoreError::UnknownBranch`] if the branch does not exist.
pub fn merge_heads(
    ctx: &Context,
    state: &CdvcsState,
    author: &str,
    branch: &str,
    correcting_transactions: Vec<Transaction>,
) -> Result<Staged, CoreError> {
    let heads = state
        .heads(branch)
        .ok_or_else(|| CoreError::UnknownBranch(branch.to_string()))?
        .clone();
    let (id, commit) = make_commit(ctx, author, heads.clone(), correcting_transactions)?;

    let mut op = CdvcsOp::new(OpMethod::Merge);
    op.commit_graph.insert(id.clone(), heads);
    op.branches.insert(branch.to_string(), Heads::from([id.clone()]));

    Ok(Staged::from_op(ctx, state, &CommitGraph::new(), op, BTreeMap::from([(id, commit)])))
}

/// Switch the checked-out branch. Local only; produces no op.
///
/// # Errors
///
/// [`CoreError::UnknownBranch`] if the branch does not exist.
pub fn checkout(state: &CdvcsState, branch: &str) -> Result<CdvcsState, CoreError> {
    if !state.branches.contains_key(branch) {
        return Err(CoreError::UnknownBranch(branch.to_string()));
    }
    let mut next = state.clone();
    next.head = Some(branch.to_string());
    Ok(next)
}

// ---------------------------------------------------------------------------
// Graph-level pull
// ---------------------------------------------------------------------------

/// Why a graph-level pull could not produce an op.
#[derive(Debug, thiserror::Error)]
pub enum PullError {
    #[error("cannot pull into conflicting branch {branch} ({heads} heads)")]
    MultipleHeads { branch: String, heads: usize },

    #[error("remote history does not contain the heads of {branch}; pull would induce a conflict")]
    InducesConflict { branch: String },

    #[error("no pull necessary")]
    Unnecessary,

    #[error("branch {0} does not exist locally")]
    MissingBranch(String),

    #[error("remote tip {0} is not part of the remote graph")]
    UnknownTip(CommitId),

    #[error(transparent)]
    Lca(#[from] LcaError),
}

impl PullError {
    /// Downgrade to a [`Rejection`], or hand back the fatal error.
    ///
    /// # Errors
    ///
    /// LCA failures mean a malformed graph and stay fatal.
    pub fn into_rejection(self) -> Result<Rejection, CoreError> {
        match self {
            Self::MultipleHeads { branch, heads } => Ok(Rejection::DestinationConflict { branch, heads }),
            Self::InducesConflict { .. } => Ok(Rejection::InsufficientHistory),
            Self::Unnecessary => Ok(Rejection::PullUnnecessary),
            err @ (Self::MissingBranch(_) | Self::UnknownTip(_)) => {
                Ok(Rejection::MetadataMismatch(err.to_string()))
            }
            Self::Lca(err) => Err(err.into()),
        }
    }
}

/// Fast-forward `branch` of `state` to `remote_tip` from `remote`.
///
/// Creates no commit. The op grafts the remote ancestry of the tip that the
/// local graph lacks and moves the branch to `{remote_tip}`. With
/// `allow_induced_conflict` the local heads need not be ancestors of the
/// tip; joining the op then leaves the branch with several heads.
///
/// # Errors
///
/// See [`PullError`].
pub fn pull(
    state: &CdvcsState,
    branch: &str,
    remote: &CdvcsState,
    remote_tip: &CommitId,
    allow_induced_conflict: bool,
) -> Result<CdvcsOp, PullError> {
    let local_heads = state
        .heads(branch)
        .ok_or_else(|| PullError::MissingBranch(branch.to_string()))?;

    if !allow_induced_conflict && local_heads.len() > 1 {
        return Err(PullError::MultipleHeads {
            branch: branch.to_string(),
            heads: local_heads.len(),
        });
    }
    if !remote.commit_graph.contains(remote_tip) {
        return Err(PullError::UnknownTip(remote_tip.clone()));
    }

    let tip = Heads::from([remote_tip.clone()]);
    let lca = lowest_common_ancestors(&state.commit_graph, local_heads, &remote.commit_graph, &tip)?;

    if lca.cut == tip {
        return Err(PullError::Unnecessary);
    }
    if !allow_induced_conflict && !lca.cut.is_superset(local_heads) {
        return Err(PullError::InducesConflict {
            branch: branch.to_string(),
        });
    }

    let grafted = merge_ancestors(&state.commit_graph, &lca.cut, &lca.return_paths_b);

    let mut op = CdvcsOp::new(OpMethod::Pull);
    op.commit_graph = grafted.difference(&state.commit_graph);
    op.branches.insert(branch.to_string(), tip);
    Ok(op)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
