use std::collections::BTreeSet;
use std::sync::Arc;

use cdvcs_core::compact::resolve_full_graph;
use cdvcs_core::config::{CompactionConfig, EngineConfig};
use cdvcs_core::crdt::cdvcs::{self, CdvcsOp, CdvcsState, DEFAULT_BRANCH, OpMethod};
use cdvcs_core::dag::commit::Transaction;
use cdvcs_core::dag::graph::{CommitGraph, Heads, isolate_branch};
use cdvcs_core::dag::lca::lowest_common_ancestors;
use cdvcs_core::store::{MemoryStore, Store};
use cdvcs_core::sync::missing::collect_missing;
use cdvcs_core::sync::pull::{AcceptAll, ContentAddressCheck, PullDestination, PullRequest, PullSource};
use cdvcs_core::{CommitId, Context, Crdt, DownstreamOp, Identity, PullOutcome, Rejection, Replica};
use serde_json::json;

fn tx(n: usize) -> Vec<Transaction> {
    vec![Transaction::new("set", json!({ "n": n }))]
}

fn heads(ids: &[&str]) -> Heads {
    ids.iter().map(|id| CommitId::from(*id)).collect()
}

fn replica_with_threshold(threshold: usize) -> Replica {
    let config = EngineConfig {
        compaction: CompactionConfig {
            enabled: true,
            threshold,
        },
        ..EngineConfig::default()
    };
    Replica::in_memory(Context::deterministic(1_700_000_000_000), config)
}

fn pull_request(from: &str, source: &CdvcsState, identity: &Identity, destination: &CdvcsState) -> PullRequest {
    PullRequest {
        source: PullSource {
            user: from.to_string(),
            branch: DEFAULT_BRANCH.to_string(),
            state: source.clone(),
        },
        destination: PullDestination {
            identity: identity.clone(),
            branch: DEFAULT_BRANCH.to_string(),
            state: destination.clone(),
        },
        integrity: Arc::new(AcceptAll),
        allow_induced_conflict: false,
    }
}

fn cdvcs_value(value: &Crdt) -> &CdvcsState {
    value.as_cdvcs().expect("cdvcs value")
}

// ===========================================================================
// Join scenario
// ===========================================================================

#[test]
fn descendant_replaces_head() {
    let mut state = CdvcsState::empty();
    let mut init = CdvcsOp::new(OpMethod::Init);
    init.commit_graph = CommitGraph::from_pairs(&[("1", &[])]);
    init.branches.insert(DEFAULT_BRANCH.into(), heads(&["1"]));
    state.join(&init);

    let mut op = CdvcsOp::new(OpMethod::Commit);
    op.commit_graph = CommitGraph::from_pairs(&[("2", &["1"])]);
    op.branches.insert(DEFAULT_BRANCH.into(), heads(&["2"]));
    state.join(&op);

    assert_eq!(state.heads(DEFAULT_BRANCH), Some(&heads(&["2"])));
    assert_eq!(state.commit_graph, CommitGraph::from_pairs(&[("1", &[]), ("2", &["1"])]));
}

#[test]
fn lca_of_diverged_lines() {
    let a = CommitGraph::from_pairs(&[("1", &[]), ("2", &["1"]), ("3", &["2"])]);
    let b = CommitGraph::from_pairs(&[("1", &[]), ("2", &["1"]), ("4", &["2"])]);
    let lca = lowest_common_ancestors(&a, &heads(&["3"]), &b, &heads(&["4"])).expect("lca");
    assert_eq!(lca.cut, heads(&["2"]));
}

// ===========================================================================
// Pull between replicas
// ===========================================================================

#[tokio::test]
async fn pull_round_trip_between_replicas() {
    let alice = replica_with_threshold(100);
    let bob = replica_with_threshold(100);
    let ctx = alice.ctx().clone();
    let alice_repo = Identity::new("alice", "notes");
    let bob_repo = Identity::new("bob", "notes");

    let origin = cdvcs::new_repository(&ctx, "alice", Some("shared notes"), tx(0)).expect("repo");
    alice.commit_staged(&alice_repo, &origin).await.expect("init");
    bob.commit_staged(&bob_repo, &origin).await.expect("init");

    // Bob works ahead.
    let mut bob_state = origin.state.clone();
    let mut bob_commits = Vec::new();
    for n in 1..4 {
        let staged = cdvcs::commit(&ctx, &bob_state, "bob", DEFAULT_BRANCH, tx(n)).expect("commit");
        bob.commit_staged(&bob_repo, &staged).await.expect("commit");
        bob_state = staged.state.clone();
        bob_commits.push(staged);
    }

    // The transport fetches the blobs Alice lacks before the pull.
    let mut offer = CdvcsOp::new(OpMethod::Pull);
    offer.commit_graph = bob_state.commit_graph.clone();
    offer.branches = bob_state.branches.clone();
    let offered = DownstreamOp::Cdvcs(offer);
    let missing = collect_missing(alice.cold(), &offered).await.expect("missing");
    assert_eq!(missing.len(), 3);
    for staged in &bob_commits {
        alice.persist_commits(&staged.commits).await.expect("persist");
    }
    assert!(collect_missing(alice.cold(), &offered).await.expect("missing").is_empty());

    let mut request = pull_request("bob", &bob_state, &alice_repo, &origin.state);
    request.integrity = Arc::new(ContentAddressCheck::new(ctx.clone()));
    let PullOutcome::Applied(applied) = alice.pull(&request).await.expect("pull") else {
        panic!("pull should apply");
    };
    assert_eq!(cdvcs_value(&applied.value).heads(DEFAULT_BRANCH), bob_state.heads(DEFAULT_BRANCH));

    // Both replicas now agree on the branch.
    let bob_value = bob.materialize(&bob_repo).await.expect("get").expect("value");
    assert_eq!(
        cdvcs_value(&bob_value).heads(DEFAULT_BRANCH),
        cdvcs_value(&applied.value).heads(DEFAULT_BRANCH)
    );
}

#[tokio::test]
async fn conflicted_source_is_declined() {
    let alice = replica_with_threshold(100);
    let ctx = alice.ctx().clone();
    let identity = Identity::new("alice", "notes");

    let origin = cdvcs::new_repository(&ctx, "alice", None, tx(0)).expect("repo");
    alice.commit_staged(&identity, &origin).await.expect("init");
    let left = cdvcs::commit(&ctx, &origin.state, "bob", DEFAULT_BRANCH, tx(1)).expect("commit");
    let right = cdvcs::commit(&ctx, &origin.state, "carol", DEFAULT_BRANCH, tx(2)).expect("commit");
    let conflicted = left.state.joined(&right.op);
    assert!(conflicted.has_multiple_heads(DEFAULT_BRANCH));

    let outcome = alice
        .pull(&pull_request("bob", &conflicted, &identity, &origin.state))
        .await
        .expect("pull");
    assert!(matches!(outcome, PullOutcome::Rejected(Rejection::SourceConflict { heads: 2, .. })));
}

#[tokio::test]
async fn induced_conflict_needs_permission() {
    let alice = replica_with_threshold(100);
    let ctx = alice.ctx().clone();
    let identity = Identity::new("alice", "notes");

    let origin = cdvcs::new_repository(&ctx, "alice", None, tx(0)).expect("repo");
    alice.commit_staged(&identity, &origin).await.expect("init");
    let ours = cdvcs::commit(&ctx, &origin.state, "alice", DEFAULT_BRANCH, tx(1)).expect("commit");
    alice.commit_staged(&identity, &ours).await.expect("commit");
    let theirs = cdvcs::commit(&ctx, &origin.state, "bob", DEFAULT_BRANCH, tx(2)).expect("commit");

    let mut request = pull_request("bob", &theirs.state, &identity, &ours.state);
    let outcome = alice.pull(&request).await.expect("pull");
    assert!(matches!(outcome, PullOutcome::Rejected(_)));

    request.allow_induced_conflict = true;
    let PullOutcome::Applied(applied) = alice.pull(&request).await.expect("pull") else {
        panic!("pull should apply when conflicts are allowed");
    };
    let state = cdvcs_value(&applied.value);
    assert!(state.has_multiple_heads(DEFAULT_BRANCH));

    // Resolving the conflict brings the branch back to one head.
    let resolved = cdvcs::merge_heads(&ctx, state, "alice", DEFAULT_BRANCH, tx(3)).expect("merge");
    let applied = alice.commit_staged(&identity, &resolved).await.expect("resolve");
    assert!(!cdvcs_value(&applied.value).has_multiple_heads(DEFAULT_BRANCH));
}

// ===========================================================================
// Compaction and materialization
// ===========================================================================

#[tokio::test]
async fn compaction_preserves_reachable_history() {
    let replica = replica_with_threshold(100);
    let ctx = replica.ctx().clone();
    let identity = Identity::new("alice", "long");

    let mut staged = cdvcs::new_repository(&ctx, "alice", None, tx(0)).expect("repo");
    replica.commit_staged(&identity, &staged).await.expect("init");
    let mut compactions = 0;
    for n in 1..130 {
        staged = cdvcs::commit(&ctx, &staged.state, "alice", DEFAULT_BRANCH, tx(n)).expect("commit");
        let applied = replica.commit_staged(&identity, &staged).await.expect("commit");
        compactions += usize::from(applied.compaction.is_some());
    }
    assert_eq!(compactions, 1);

    let value = replica.materialize(&identity).await.expect("get").expect("value");
    let live = cdvcs_value(&value);
    assert!(live.commit_graph.len() < 100);
    assert!(live.history.is_some());

    let head = live.heads(DEFAULT_BRANCH).cloned().unwrap_or_default();
    let full = resolve_full_graph(replica.cold(), live).await.expect("full");
    assert_eq!(isolate_branch(&full, &head), isolate_branch(&staged.state.commit_graph, &head));
}

#[tokio::test]
async fn log_replay_matches_live_value() {
    let ctx = Context::deterministic(0);
    let config = EngineConfig {
        compaction: CompactionConfig {
            enabled: false,
            threshold: 100,
        },
        ..EngineConfig::default()
    };
    let cold: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let replica = Replica::new(cold.clone(), Arc::new(MemoryStore::new()), ctx.clone(), config.clone());
    let identity = Identity::new("alice", "notes");

    let origin = cdvcs::new_repository(&ctx, "alice", None, tx(0)).expect("repo");
    replica.commit_staged(&identity, &origin).await.expect("init");
    let root = origin.state.heads(DEFAULT_BRANCH).and_then(BTreeSet::first).cloned().expect("root");
    let mut staged = cdvcs::branch(&ctx, &origin.state, "side", &root).expect("branch");
    replica.commit_staged(&identity, &staged).await.expect("branch");
    for n in 1..8 {
        let branch = if n % 2 == 0 { DEFAULT_BRANCH } else { "side" };
        staged = cdvcs::commit(&ctx, &staged.state, "alice", branch, tx(n)).expect("commit");
        replica.commit_staged(&identity, &staged).await.expect("commit");
    }
    let live = replica.materialize(&identity).await.expect("get");

    // A fresh mem store over the same cold store rebuilds the same value.
    let restarted = Replica::new(cold, Arc::new(MemoryStore::new()), ctx, config);
    assert_eq!(restarted.materialize(&identity).await.expect("get"), live);
}

// ===========================================================================
// Concurrency
// ===========================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_delivery_converges() {
    let ctx = Context::deterministic(0);
    let origin = cdvcs::new_repository(&ctx, "alice", None, tx(0)).expect("repo");

    // Independent branches from several authors.
    let mut ops = vec![DownstreamOp::Cdvcs(origin.op.clone())];
    let root = origin.state.heads(DEFAULT_BRANCH).cloned().unwrap_or_default();
    for author in ["bob", "carol", "dave", "erin"] {
        let root_id = root.first().cloned().expect("root");
        let mut staged = cdvcs::branch(&ctx, &origin.state, author, &root_id).expect("branch");
        ops.push(DownstreamOp::Cdvcs(staged.op.clone()));
        for n in 0..5 {
            staged = cdvcs::commit(&ctx, &staged.state, author, author, tx(n)).expect("commit");
            ops.push(DownstreamOp::Cdvcs(staged.op.clone()));
        }
    }

    let replica = Arc::new(Replica::in_memory(ctx.clone(), EngineConfig::default()));
    let identity = Identity::new("shared", "repo");
    let mut tasks = Vec::new();
    for chunk in ops.chunks(3).map(<[DownstreamOp]>::to_vec) {
        let (replica, identity) = (replica.clone(), identity.clone());
        tasks.push(tokio::spawn(async move {
            for op in chunk.iter().rev() {
                replica.apply(&identity, op).await.expect("apply");
            }
        }));
    }
    for task in tasks {
        task.await.expect("task");
    }

    let sequential = ops.iter().fold(Crdt::empty(cdvcs_core::CrdtKind::Cdvcs), |mut value, op| {
        value.join(op).expect("join");
        value
    });
    let concurrent = replica.materialize(&identity).await.expect("get").expect("value");
    assert_eq!(concurrent, sequential);
}
