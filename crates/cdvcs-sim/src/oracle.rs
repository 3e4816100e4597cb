use std::collections::BTreeSet;

use cdvcs_core::crdt::cdvcs::{CdvcsOp, CdvcsState};
use cdvcs_core::dag::graph::remove_ancestors;
use cdvcs_core::ids::CommitId;

use crate::agent::AgentState;
use crate::rng::DeterministicRng;
use crate::{SimulationResult, TraceEvent, TraceEventKind};

/// Shuffled replays per commutativity check in [`ConvergenceOracle::check_all`].
pub const DEFAULT_PERMUTATIONS: usize = 8;

// ── Core result types ─────────────────────────────────────────────────────────

/// Oracle result for an invariant check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OracleResult {
    /// `true` iff no violations were found.
    pub passed: bool,
    pub violations: Vec<InvariantViolation>,
}

impl OracleResult {
    fn from_violations(violations: Vec<InvariantViolation>) -> Self {
        Self {
            passed: violations.is_empty(),
            violations,
        }
    }

    /// Merge another result into this one (failures accumulate).
    #[must_use]
    fn merge(mut self, other: Self) -> Self {
        if !other.passed {
            self.passed = false;
            self.violations.extend(other.violations);
        }
        self
    }
}

// ── Invariant violation diagnostics ──────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvariantViolation {
    /// Two agents hold different values after repair.
    Convergence {
        agent_a: usize,
        agent_b: usize,
        only_in_a: Vec<String>,
        only_in_b: Vec<String>,
        heads_differ: bool,
    },

    /// Joining the ops in another order produced a different value.
    Commutativity {
        permutation_index: usize,
        missing_commits: Vec<String>,
        extra_commits: Vec<String>,
        heads_differ: bool,
    },

    /// Re-joining an op changed a value that already contained it.
    Idempotence { agent: usize, op_id: usize },

    /// A join lost commits, or dropped a head without replacing it by a
    /// descendant.
    Monotonicity {
        agent: usize,
        op_id: usize,
        round: u64,
        lost_heads: Vec<String>,
        graph_before: usize,
        graph_after: usize,
    },

    /// A branch's heads include an ancestor of another head, or a commit
    /// missing from the graph.
    HeadPruning {
        agent: usize,
        branch: String,
        heads: Vec<String>,
    },
}

// ── Oracle ────────────────────────────────────────────────────────────────────

/// Checks the join laws on a finished run.
///
/// 1. **Convergence**: every replica holds the same value.
/// 2. **Commutativity**: any order of the ops yields that value.
/// 3. **Idempotence**: re-joining any op is a no-op.
/// 4. **Monotonicity**: no join loses commits or regresses a head.
/// 5. **Head pruning**: branch heads are antichains of known commits.
pub struct ConvergenceOracle;

impl ConvergenceOracle {
    /// Run every check.
    #[must_use]
    pub fn check_all(result: &SimulationResult, rng: &mut DeterministicRng) -> OracleResult {
        let convergence = Self::check_convergence(&result.states);
        let Some(reference) = result.states.first() else {
            return convergence;
        };
        convergence
            .merge(Self::check_commutativity(
                &result.ops,
                reference,
                rng,
                DEFAULT_PERMUTATIONS,
            ))
            .merge(Self::check_idempotence(&result.states, &result.ops))
            .merge(Self::check_monotonicity(&result.trace, &result.states))
            .merge(Self::check_head_pruning(&result.states))
    }

    // ── Invariant 1: Convergence ─────────────────────────────────────────────

    /// Every pair of agents holds the same branches and commit graph.
    #[must_use]
    pub fn check_convergence(states: &[AgentState]) -> OracleResult {
        let mut violations = Vec::new();
        for (i, a) in states.iter().enumerate() {
            for b in &states[i + 1..] {
                if a.same_value(b) {
                    continue;
                }
                let ids_a = commit_ids(a);
                let ids_b = commit_ids(b);
                violations.push(InvariantViolation::Convergence {
                    agent_a: a.id,
                    agent_b: b.id,
                    only_in_a: ids_a.difference(&ids_b).map(ToString::to_string).collect(),
                    only_in_b: ids_b.difference(&ids_a).map(ToString::to_string).collect(),
                    heads_differ: a.branches != b.branches,
                });
            }
        }
        OracleResult::from_violations(violations)
    }

    // ── Invariant 2: Commutativity ───────────────────────────────────────────

    /// Fold `ops` from an empty value in `iterations` shuffled orders and
    /// compare each outcome with `reference`.
    #[must_use]
    pub fn check_commutativity(
        ops: &[CdvcsOp],
        reference: &AgentState,
        rng: &mut DeterministicRng,
        iterations: usize,
    ) -> OracleResult {
        let expected = commit_ids(reference);
        let mut violations = Vec::new();

        for permutation_index in 0..iterations {
            let shuffled = rng.shuffled(ops);
            let folded = shuffled.iter().fold(CdvcsState::empty(), |mut state, op| {
                state.join(op);
                state
            });
            if folded.branches == reference.branches && folded.commit_graph == reference.commit_graph {
                continue;
            }
            let actual: BTreeSet<CommitId> = folded.commit_graph.ids().cloned().collect();
            violations.push(InvariantViolation::Commutativity {
                permutation_index,
                missing_commits: expected.difference(&actual).map(ToString::to_string).collect(),
                extra_commits: actual.difference(&expected).map(ToString::to_string).collect(),
                heads_differ: folded.branches != reference.branches,
            });
        }
        OracleResult::from_violations(violations)
    }

    // ── Invariant 3: Idempotence ─────────────────────────────────────────────

    /// Re-joining any op an agent has seen leaves its value unchanged.
    #[must_use]
    pub fn check_idempotence(states: &[AgentState], ops: &[CdvcsOp]) -> OracleResult {
        let mut violations = Vec::new();
        for state in states {
            let value = state.value();
            for &op_id in &state.seen_ops {
                let Some(op) = ops.get(op_id) else {
                    continue;
                };
                let rejoined = value.joined(op);
                if rejoined.branches != value.branches || rejoined.commit_graph != value.commit_graph {
                    violations.push(InvariantViolation::Idempotence { agent: state.id, op_id });
                }
            }
        }
        OracleResult::from_violations(violations)
    }

    // ── Invariant 4: Monotonicity ────────────────────────────────────────────

    /// Walk the delivered joins: graphs never shrink, and every head that
    /// disappears is an ancestor of a head that replaced it. Ancestry is
    /// judged on the agent's final graph, a superset of every earlier one.
    #[must_use]
    pub fn check_monotonicity(trace: &[TraceEvent], states: &[AgentState]) -> OracleResult {
        let mut violations = Vec::new();
        for event in trace {
            let TraceEventKind::Deliver {
                to,
                op_id,
                graph_before,
                graph_after,
                heads_before,
                heads_after,
                ..
            } = &event.kind
            else {
                continue;
            };
            let Some(state) = states.get(*to) else {
                continue;
            };

            let lost_heads: Vec<String> = heads_before
                .iter()
                .filter(|head| !heads_after.contains(head))
                .filter(|head| {
                    let head = CommitId::from(head.as_str());
                    !heads_after
                        .iter()
                        .any(|after| state.commit_graph.is_ancestor(&head, &CommitId::from(after.as_str())))
                })
                .cloned()
                .collect();

            if graph_after < graph_before || !lost_heads.is_empty() {
                violations.push(InvariantViolation::Monotonicity {
                    agent: *to,
                    op_id: *op_id,
                    round: event.round,
                    lost_heads,
                    graph_before: *graph_before,
                    graph_after: *graph_after,
                });
            }
        }
        OracleResult::from_violations(violations)
    }

    // ── Invariant 5: Head pruning ────────────────────────────────────────────

    /// No head is an ancestor of another head on the same branch, and every
    /// head is a known commit.
    #[must_use]
    pub fn check_head_pruning(states: &[AgentState]) -> OracleResult {
        let mut violations = Vec::new();
        for state in states {
            for (branch, heads) in &state.branches {
                let pruned = remove_ancestors(&state.commit_graph, heads);
                let known = heads.iter().all(|head| state.commit_graph.contains(head));
                if pruned != *heads || !known {
                    violations.push(InvariantViolation::HeadPruning {
                        agent: state.id,
                        branch: branch.clone(),
                        heads: heads.iter().map(ToString::to_string).collect(),
                    });
                }
            }
        }
        OracleResult::from_violations(violations)
    }
}

fn commit_ids(state: &AgentState) -> BTreeSet<CommitId> {
    state.commit_graph.ids().cloned().collect()
}
