//! The application path of one replica.
//!
//! A [`Replica`] ties the pieces together over a cold store (commit blobs,
//! snapshots, operation logs) and a mem store (live values):
//!
//! - [`Replica::apply`] joins an op into the live value under
//!   compare-and-swap, logs it and compacts opportunistically.
//! - [`Replica::apply_guarded`] does the same but leaves the live value
//!   untouched if the join would create several heads on a branch.
//! - [`Replica::pull`] runs the pull protocol and admits the result through
//!   the guarded path.
//! - [`Replica::merge`] and [`Replica::branch`] run local operations
//!   against the live value with its compacted ancestry resolved.
//!
//! Joins into CDVCS values prune heads over the live graph plus every
//! compacted snapshot. The snapshots are resolved before the swap; if a
//! concurrent compaction moves `history` in between, the join is retried
//! with the new chain.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, instrument, trace};

use crate::compact::{CompactionReport, maybe_compact, resolve_snapshots};
use crate::config::EngineConfig;
use crate::crdt::cdvcs::{self, CdvcsState, Staged};
use crate::crdt::{Crdt, DownstreamOp};
use crate::dag::commit::{Commit, Transaction};
use crate::dag::graph::{CommitGraph, Heads};
use crate::error::{CoreError, Rejection};
use crate::ids::{CommitId, ContentId, Context, Identity};
use crate::materialize::get_crdt;
use crate::store::{MemoryStore, Store, StoreError, assoc_typed, atomic_update_typed, get_typed};
use crate::sync::pull::{PullDecision, PullRequest, pull_cdvcs};

/// An op that was joined into the live value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Applied {
    pub value: Crdt,
    pub compaction: Option<CompactionReport>,
}

/// Outcome of [`Replica::apply_guarded`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Applied(Applied),
    /// The join would have created several heads; the stored value is
    /// unchanged.
    Suppressed(Crdt),
}

/// Outcome of [`Replica::pull`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PullOutcome {
    Applied(Applied),
    Rejected(Rejection),
}

pub struct Replica {
    cold: Arc<dyn Store>,
    mem: Arc<dyn Store>,
    ctx: Context,
    config: EngineConfig,
}

impl std::fmt::Debug for Replica {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replica")
            .field("ctx", &self.ctx)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Replica {
    #[must_use]
    pub fn new(cold: Arc<dyn Store>, mem: Arc<dyn Store>, ctx: Context, config: EngineConfig) -> Self {
        Self {
            cold,
            mem,
            ctx,
            config,
        }
    }

    /// A replica over two fresh [`MemoryStore`]s.
    #[must_use]
    pub fn in_memory(ctx: Context, config: EngineConfig) -> Self {
        let retries = config.store.max_cas_retries;
        Self::new(
            Arc::new(MemoryStore::with_max_retries(retries)),
            Arc::new(MemoryStore::with_max_retries(retries)),
            ctx,
            config,
        )
    }

    #[must_use]
    pub fn cold(&self) -> &dyn Store {
        self.cold.as_ref()
    }

    #[must_use]
    pub fn mem(&self) -> &dyn Store {
        self.mem.as_ref()
    }

    #[must_use]
    pub const fn ctx(&self) -> &Context {
        &self.ctx
    }

    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Write commit blobs under their ids.
    ///
    /// # Errors
    ///
    /// Store and serialization failures.
    pub async fn persist_commits(&self, commits: &BTreeMap<CommitId, Commit>) -> Result<(), CoreError> {
        for (id, commit) in commits {
            assoc_typed(self.cold(), id.as_str(), commit).await?;
        }
        Ok(())
    }

    /// Persist the commits of a local operation and apply its op.
    ///
    /// # Errors
    ///
    /// See [`Replica::apply`].
    pub async fn commit_staged(&self, identity: &Identity, staged: &Staged) -> Result<Applied, CoreError> {
        self.persist_commits(&staged.commits).await?;
        self.apply(identity, &DownstreamOp::Cdvcs(staged.op.clone())).await
    }

    /// The live value of `identity`, materializing it from the log if needed.
    ///
    /// # Errors
    ///
    /// See [`get_crdt`].
    pub async fn materialize(&self, identity: &Identity) -> Result<Option<Crdt>, CoreError> {
        get_crdt(self.cold(), self.mem(), identity).await
    }

    /// Join `op` into the live value of `identity`.
    ///
    /// The op is logged only once the swap succeeded; a rejected op never
    /// reaches the log.
    ///
    /// # Errors
    ///
    /// [`CoreError::KindMismatch`] if the identity holds another kind,
    /// store failures and contention.
    #[instrument(skip_all, fields(%identity, kind = %op.kind()))]
    pub async fn apply(&self, identity: &Identity, op: &DownstreamOp) -> Result<Applied, CoreError> {
        let (_, value) = self.join_live(identity, op, None, None).await?;
        self.cold
            .append_log(&identity.log_key(), serde_json::to_value(op)?)
            .await?;
        self.finish(identity, value).await
    }

    /// Join `op` unless that would create several heads on `branch`.
    ///
    /// `seed` initializes an absent value; without it the empty value of the
    /// op's kind is used. The op is logged only if it was applied.
    ///
    /// # Errors
    ///
    /// As [`Replica::apply`].
    #[instrument(skip_all, fields(%identity, %branch))]
    pub async fn apply_guarded(
        &self,
        identity: &Identity,
        op: &DownstreamOp,
        branch: &str,
        seed: Option<&Crdt>,
    ) -> Result<Admission, CoreError> {
        let (history, value) = self.join_live(identity, op, Some(branch), seed).await?;

        // The swap returns the stored value either way; joining it again
        // tells whether the op is in it.
        if join_with_snapshots(&value, op, &history)? != value {
            debug!("join would create multiple heads, suppressed");
            return Ok(Admission::Suppressed(value));
        }

        self.cold
            .append_log(&identity.log_key(), serde_json::to_value(op)?)
            .await?;
        self.finish(identity, value).await.map(Admission::Applied)
    }

    /// Run the pull protocol for `request` and admit the result.
    ///
    /// A delta that passed the protocol's dry run can still be suppressed by
    /// the guarded swap if the live value moved concurrently; that surfaces
    /// as [`Rejection::InducedConflict`].
    ///
    /// # Errors
    ///
    /// Structural failures from the protocol or the application path.
    pub async fn pull(&self, request: &PullRequest) -> Result<PullOutcome, CoreError> {
        let (identity, op) = match pull_cdvcs(self.cold(), self.mem(), request).await? {
            PullDecision::Rejected(rejection) => return Ok(PullOutcome::Rejected(rejection)),
            PullDecision::Apply { identity, op, .. } => (identity, op),
        };

        let branch = &request.destination.branch;
        let seed = Crdt::Cdvcs(request.destination.state.clone());
        if request.allow_induced_conflict {
            self.seed_if_absent(&identity, &seed).await?;
            return self.apply(&identity, &op).await.map(PullOutcome::Applied);
        }
        match self.apply_guarded(&identity, &op, branch, Some(&seed)).await? {
            Admission::Applied(applied) => Ok(PullOutcome::Applied(applied)),
            Admission::Suppressed(_) => Ok(PullOutcome::Rejected(Rejection::InducedConflict {
                branch: branch.clone(),
            })),
        }
    }

    /// Three-way merge of remote history into `branch` of the live value.
    ///
    /// # Errors
    ///
    /// [`CoreError::KindMismatch`] if the identity holds another kind, plus
    /// anything [`cdvcs::merge_with_history`] or [`Replica::apply`] returns.
    pub async fn merge(
        &self,
        identity: &Identity,
        author: &str,
        branch: &str,
        remote_graph: &CommitGraph,
        remote_heads: &Heads,
        correcting_transactions: Vec<Transaction>,
    ) -> Result<Applied, CoreError> {
        let (state, history) = self.live_cdvcs(identity).await?;
        let staged = cdvcs::merge_with_history(
            &self.ctx,
            &state,
            &history,
            author,
            branch,
            remote_graph,
            remote_heads,
            correcting_transactions,
        )?;
        self.commit_staged(identity, &staged).await
    }

    /// Create branch `name` at `parent`, which may already be compacted.
    ///
    /// # Errors
    ///
    /// As [`cdvcs::branch_with_history`] and [`Replica::apply`].
    pub async fn branch(&self, identity: &Identity, name: &str, parent: &CommitId) -> Result<Applied, CoreError> {
        let (state, history) = self.live_cdvcs(identity).await?;
        let staged = cdvcs::branch_with_history(&self.ctx, &state, &history, name, parent)?;
        self.commit_staged(identity, &staged).await
    }

    /// Compact the value of `identity` if it reached the threshold.
    ///
    /// # Errors
    ///
    /// See [`maybe_compact`].
    pub async fn compact(&self, identity: &Identity) -> Result<Option<CompactionReport>, CoreError> {
        maybe_compact(self.cold(), self.mem(), &self.ctx, &self.config.compaction, identity).await
    }

    async fn finish(&self, identity: &Identity, value: Crdt) -> Result<Applied, CoreError> {
        let compaction = match value {
            Crdt::Cdvcs(_) => self.compact(identity).await?,
            _ => None,
        };
        Ok(Applied { value, compaction })
    }

    /// The live CDVCS value of `identity` (empty if absent) and its resolved
    /// snapshots.
    async fn live_cdvcs(&self, identity: &Identity) -> Result<(CdvcsState, CommitGraph), CoreError> {
        let state = match self.materialize(identity).await? {
            Some(Crdt::Cdvcs(state)) => state,
            Some(other) => {
                return Err(CoreError::KindMismatch {
                    state: other.kind().tag(),
                    op: cdvcs::CDVCS_TAG,
                });
            }
            None => CdvcsState::empty(),
        };
        let history = resolve_snapshots(self.cold(), state.history.as_ref()).await?;
        Ok((state, history))
    }

    async fn seed_if_absent(&self, identity: &Identity, seed: &Crdt) -> Result<(), CoreError> {
        atomic_update_typed(self.mem(), &identity.state_key(), |current: Option<Crdt>| {
            Ok(current.unwrap_or_else(|| seed.clone()))
        })
        .await?;
        Ok(())
    }

    /// History pointer and resolved snapshots of the value the next swap
    /// will start from.
    async fn history_of(
        &self,
        key: &str,
        seed: Option<&Crdt>,
    ) -> Result<(Option<ContentId>, CommitGraph), CoreError> {
        let current = get_typed::<Crdt>(self.mem(), key).await?;
        let history = current
            .as_ref()
            .or(seed)
            .and_then(Crdt::as_cdvcs)
            .and_then(|state| state.history.clone());
        let snapshots = resolve_snapshots(self.cold(), history.as_ref()).await?;
        Ok((history, snapshots))
    }

    /// Compare-and-swap the live value to its join with `op`.
    ///
    /// With `guard`, a join that would create several heads on that branch
    /// keeps the current value instead. Returns the snapshots used for
    /// pruning and the stored value after the swap.
    async fn join_live(
        &self,
        identity: &Identity,
        op: &DownstreamOp,
        guard: Option<&str>,
        seed: Option<&Crdt>,
    ) -> Result<(CommitGraph, Crdt), CoreError> {
        // Rebuild from the log first so a cold restart never joins into an
        // empty value.
        get_crdt(self.cold(), self.mem(), identity).await?;

        let key = identity.state_key();
        let attempts = self.config.store.max_cas_retries.max(1);

        for attempt in 1..=attempts {
            let (expected, snapshots) = self.history_of(&key, seed).await?;
            let stale = AtomicBool::new(false);

            let (_, value) = atomic_update_typed(self.mem(), &key, |current: Option<Crdt>| {
                let base = current
                    .or_else(|| seed.cloned())
                    .unwrap_or_else(|| Crdt::empty(op.kind()));
                let history = base.as_cdvcs().and_then(|state| state.history.as_ref());
                let moved = history != expected.as_ref();
                stale.store(moved, Ordering::Relaxed);
                if moved {
                    return Ok(base);
                }

                let next = join_with_snapshots(&base, op, &snapshots)?;
                if guard.is_some_and(|branch| creates_conflict(&base, &next, branch)) {
                    return Ok(base);
                }
                Ok(next)
            })
            .await?;

            if !stale.load(Ordering::Relaxed) {
                return Ok((snapshots, value));
            }
            trace!(attempt, "history moved during join, retrying");
        }

        Err(StoreError::Contention { key, attempts }.into())
    }
}

fn join_with_snapshots(base: &Crdt, op: &DownstreamOp, snapshots: &CommitGraph) -> Result<Crdt, CoreError> {
    match (base, op) {
        (Crdt::Cdvcs(state), DownstreamOp::Cdvcs(op)) => {
            let mut next = state.clone();
            next.join_with_history(op, snapshots);
            Ok(Crdt::Cdvcs(next))
        }
        _ => base.joined(op),
    }
}

fn creates_conflict(before: &Crdt, after: &Crdt, branch: &str) -> bool {
    match (before, after) {
        (Crdt::Cdvcs(before), Crdt::Cdvcs(after)) => {
            !before.has_multiple_heads(branch) && after.has_multiple_heads(branch)
        }
        _ => false,
    }
}
