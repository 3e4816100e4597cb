use std::collections::{BTreeMap, BTreeSet};

use cdvcs_core::crdt::cdvcs::{self, CdvcsOp, CdvcsState, DEFAULT_BRANCH, Staged};
use cdvcs_core::dag::commit::Transaction;
use cdvcs_core::dag::graph::{CommitGraph, Heads};
use cdvcs_core::{Context, CoreError, Rejection};
use serde::{Deserialize, Serialize};
use serde_json::json;

/// Stable identifier for a simulated agent.
pub type AgentId = usize;

/// Snapshot of the replicated part of an agent's value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentState {
    pub id: AgentId,
    pub branches: BTreeMap<String, Heads>,
    pub commit_graph: CommitGraph,
    /// Op ids the agent has joined.
    pub seen_ops: BTreeSet<usize>,
}

impl AgentState {
    /// Same replicated value, ignoring which ops carried it.
    #[must_use]
    pub fn same_value(&self, other: &Self) -> bool {
        self.branches == other.branches && self.commit_graph == other.commit_graph
    }

    /// The replicated value as a fresh [`CdvcsState`].
    #[must_use]
    pub fn value(&self) -> CdvcsState {
        let mut value = CdvcsState::empty();
        value.branches = self.branches.clone();
        value.commit_graph = self.commit_graph.clone();
        value
    }
}

/// One replica of a shared CDVCS value.
///
/// Agents never mutate their value directly: local work is staged as an op
/// and joined like any remote op.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulatedAgent {
    id: AgentId,
    name: String,
    state: CdvcsState,
    seen_ops: BTreeSet<usize>,
}

impl SimulatedAgent {
    #[must_use]
    pub fn new(id: AgentId) -> Self {
        Self {
            id,
            name: format!("agent-{id}"),
            state: CdvcsState::empty(),
            seen_ops: BTreeSet::new(),
        }
    }

    #[must_use]
    pub const fn id(&self) -> AgentId {
        self.id
    }

    #[must_use]
    pub const fn state(&self) -> &CdvcsState {
        &self.state
    }

    #[must_use]
    pub fn has_seen(&self, op_id: usize) -> bool {
        self.seen_ops.contains(&op_id)
    }

    /// Commit on the default branch, or resolve it first if it is
    /// conflicted.
    ///
    /// # Errors
    ///
    /// Fails if the agent has not joined the repository yet.
    pub fn work(&self, ctx: &Context, round: u64) -> Result<Staged, CoreError> {
        let tx = vec![Transaction::new("append", json!({ "agent": self.id, "round": round }))];
        if self.state.has_multiple_heads(DEFAULT_BRANCH) {
            cdvcs::merge_heads(ctx, &self.state, &self.name, DEFAULT_BRANCH, tx)
        } else {
            cdvcs::commit(ctx, &self.state, &self.name, DEFAULT_BRANCH, tx)
        }
    }

    /// Fast-forward the default branch to a peer's tip.
    ///
    /// # Errors
    ///
    /// Only structural failures; refusals come back as the inner `Err`.
    pub fn pull_from(&self, peer: &CdvcsState) -> Result<Result<CdvcsOp, Rejection>, CoreError> {
        let Some(peer_heads) = peer.heads(DEFAULT_BRANCH) else {
            return Ok(Err(Rejection::MetadataMismatch("peer has no default branch".into())));
        };
        let tip = match peer_heads.first() {
            Some(tip) if peer_heads.len() == 1 => tip,
            _ => {
                return Ok(Err(Rejection::SourceConflict {
                    branch: DEFAULT_BRANCH.to_string(),
                    heads: peer_heads.len(),
                }));
            }
        };
        match cdvcs::pull(&self.state, DEFAULT_BRANCH, peer, tip, false) {
            Ok(op) => Ok(Ok(op)),
            Err(err) => err.into_rejection().map(Err),
        }
    }

    /// Join op `op_id`. Returns the live graph size before and after.
    pub fn observe(&mut self, op_id: usize, op: &CdvcsOp) -> (usize, usize) {
        let before = self.state.commit_graph.len();
        self.state.join(op);
        self.seen_ops.insert(op_id);
        (before, self.state.commit_graph.len())
    }

    #[must_use]
    pub fn snapshot(&self) -> AgentState {
        AgentState {
            id: self.id,
            branches: self.state.branches.clone(),
            commit_graph: self.state.commit_graph.clone(),
            seen_ops: self.seen_ops.clone(),
        }
    }
}
