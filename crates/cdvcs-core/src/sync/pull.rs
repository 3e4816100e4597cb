//! Pull protocol: decide whether a remote branch may be pulled into a
//! local CDVCS value, and compute the delta to apply.
//!
//! # Protocol
//!
//! 1. Reject if the source branch has several heads.
//! 2. Run the graph-level pull ([`cdvcs::pull`]) from the source tip into
//!    the destination's full history. Conflicts, redundancy and metadata
//!    problems become [`Rejection`]s; malformed graphs stay fatal.
//! 3. Collect the commits the delta introduces.
//! 4. Unless induced conflicts are allowed, dry-run the join against the
//!    current live value and reject if the branch would end up with
//!    several heads ([`would_induce_conflict`]).
//! 5. Run the caller's [`IntegrityCheck`] over the new commits.
//! 6. Hand back the destination identity and the delta.
//!
//! The protocol never writes. Admission goes through the guarded
//! compare-and-swap in [`crate::replica::Replica::apply_guarded`].

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, instrument};

use crate::compact::{resolve_full_state, resolve_snapshots};
use crate::crdt::cdvcs::{self, CdvcsOp, CdvcsState};
use crate::crdt::{Crdt, DownstreamOp};
use crate::dag::commit::Commit;
use crate::dag::graph::{CommitGraph, all_commit_ids};
use crate::dag::hash::{HashError, verify_chain};
use crate::error::{CoreError, Rejection};
use crate::ids::{CommitId, Context, Identity};
use crate::store::{Store, get_typed};

// ---------------------------------------------------------------------------
// Integrity checks
// ---------------------------------------------------------------------------

/// Caller-supplied trust policy over the commits a pull introduces.
///
/// Content addressing only proves a blob matches its id; signatures,
/// quotas or author allow-lists are enforced here. `known` is the
/// destination's full history before the pull.
#[async_trait]
pub trait IntegrityCheck: Send + Sync {
    async fn verify(
        &self,
        store: &dyn Store,
        commits: &BTreeSet<CommitId>,
        known: &CommitGraph,
    ) -> Result<bool, CoreError>;
}

/// Accepts every commit.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

#[async_trait]
impl IntegrityCheck for AcceptAll {
    async fn verify(
        &self,
        _store: &dyn Store,
        _commits: &BTreeSet<CommitId>,
        _known: &CommitGraph,
    ) -> Result<bool, CoreError> {
        Ok(true)
    }
}

/// Requires every new commit to be present in the store, to hash to its id
/// and to name only parents that are new as well or already known.
#[derive(Debug, Clone, Default)]
pub struct ContentAddressCheck {
    ctx: Context,
}

impl ContentAddressCheck {
    #[must_use]
    pub const fn new(ctx: Context) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl IntegrityCheck for ContentAddressCheck {
    async fn verify(
        &self,
        store: &dyn Store,
        commits: &BTreeSet<CommitId>,
        known: &CommitGraph,
    ) -> Result<bool, CoreError> {
        let mut batch = BTreeMap::new();
        for id in commits {
            let Some(commit) = get_typed::<Commit>(store, id.as_str()).await? else {
                debug!(%id, "commit blob missing");
                return Ok(false);
            };
            batch.insert(id.clone(), commit);
        }
        match verify_chain(&self.ctx, &batch, known) {
            Ok(()) => Ok(true),
            Err(err @ (HashError::HashMismatch { .. } | HashError::UnknownParent { .. })) => {
                debug!(%err, "commit chain refused");
                Ok(false)
            }
            Err(err) => Err(err.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Request / decision
// ---------------------------------------------------------------------------

/// The replica being pulled from.
#[derive(Debug, Clone)]
pub struct PullSource {
    pub user: String,
    pub branch: String,
    pub state: CdvcsState,
}

/// The local value being pulled into.
#[derive(Debug, Clone)]
pub struct PullDestination {
    pub identity: Identity,
    pub branch: String,
    /// Fallback used when the mem store holds no value for `identity` yet.
    pub state: CdvcsState,
}

#[derive(Clone)]
pub struct PullRequest {
    pub source: PullSource,
    pub destination: PullDestination,
    pub integrity: Arc<dyn IntegrityCheck>,
    pub allow_induced_conflict: bool,
}

impl fmt::Debug for PullRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PullRequest")
            .field("source", &self.source.user)
            .field("source_branch", &self.source.branch)
            .field("destination", &self.destination.identity)
            .field("destination_branch", &self.destination.branch)
            .field("allow_induced_conflict", &self.allow_induced_conflict)
            .finish_non_exhaustive()
    }
}

/// Outcome of [`pull_cdvcs`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PullDecision {
    /// Admissible: join `op` into the value of `identity`.
    Apply {
        identity: Identity,
        op: DownstreamOp,
        new_commits: BTreeSet<CommitId>,
    },
    Rejected(Rejection),
}

impl PullDecision {
    #[must_use]
    pub const fn is_rejected(&self) -> bool {
        matches!(self, Self::Rejected(_))
    }
}

fn reject(request: &PullRequest, rejection: Rejection) -> PullDecision {
    debug!(
        destination = %request.destination.identity,
        branch = %request.destination.branch,
        source = %request.source.user,
        kind = rejection.kind(),
        "{rejection}"
    );
    PullDecision::Rejected(rejection)
}

// ---------------------------------------------------------------------------
// Protocol
// ---------------------------------------------------------------------------

/// Decide admissibility of `request` and compute the delta.
///
/// `cold` provides commit blobs and compaction snapshots; `mem` holds the
/// live value of the destination identity.
///
/// # Errors
///
/// Only structural failures: malformed graphs, missing history blobs,
/// store I/O. Every expected refusal is a [`PullDecision::Rejected`].
#[instrument(skip_all, fields(destination = %request.destination.identity, branch = %request.destination.branch))]
pub async fn pull_cdvcs(
    cold: &dyn Store,
    mem: &dyn Store,
    request: &PullRequest,
) -> Result<PullDecision, CoreError> {
    let source = &request.source;
    let destination = &request.destination;

    // 1. The source must not be mid-conflict.
    let Some(source_heads) = source.state.heads(&source.branch) else {
        return Ok(reject(
            request,
            Rejection::MetadataMismatch(format!("source branch {} does not exist", source.branch)),
        ));
    };
    let tip = match source_heads.first() {
        Some(tip) if source_heads.len() == 1 => tip,
        _ => {
            return Ok(reject(
                request,
                Rejection::SourceConflict {
                    branch: source.branch.clone(),
                    heads: source_heads.len(),
                },
            ));
        }
    };

    // 2. Graph-level pull against the destination's full history.
    let base = current_value(mem, &destination.identity, &destination.state).await?;
    let full = resolve_full_state(cold, &base).await?;
    let op = match cdvcs::pull(
        &full,
        &destination.branch,
        &source.state,
        tip,
        request.allow_induced_conflict,
    ) {
        Ok(op) => op,
        Err(err) => return err.into_rejection().map(|rejection| reject(request, rejection)),
    };

    // 3. Commits the delta introduces.
    let known = all_commit_ids(&full.commit_graph);
    let new_commits: BTreeSet<CommitId> = op.commit_ids().filter(|id| !known.contains(*id)).cloned().collect();

    // 4. Induced-conflict dry run.
    if !request.allow_induced_conflict
        && would_induce_conflict(cold, mem, &destination.identity, &op, &destination.state, &destination.branch)
            .await?
    {
        return Ok(reject(
            request,
            Rejection::InducedConflict {
                branch: destination.branch.clone(),
            },
        ));
    }

    // 5. Caller's integrity policy.
    if !request.integrity.verify(cold, &new_commits, &full.commit_graph).await? {
        return Ok(reject(
            request,
            Rejection::IntegrityFailed {
                commits: new_commits.len(),
            },
        ));
    }

    debug!(tip = %tip, new_commits = new_commits.len(), "pull admissible");
    Ok(PullDecision::Apply {
        identity: destination.identity.clone(),
        op: DownstreamOp::Cdvcs(op),
        new_commits,
    })
}

/// The live CDVCS value of `identity`, or `fallback` when none exists.
///
/// # Errors
///
/// [`CoreError::KindMismatch`] if the identity holds another kind.
pub async fn current_value(
    mem: &dyn Store,
    identity: &Identity,
    fallback: &CdvcsState,
) -> Result<CdvcsState, CoreError> {
    match get_typed::<Crdt>(mem, &identity.state_key()).await? {
        Some(Crdt::Cdvcs(state)) => Ok(state),
        Some(other) => Err(CoreError::KindMismatch {
            state: other.kind().tag(),
            op: cdvcs::CDVCS_TAG,
        }),
        None => Ok(fallback.clone()),
    }
}

/// Would joining `op` into the live value of `identity` leave `branch` with
/// more than one head?
///
/// A dry run: reads the current value (or `fallback`), joins speculatively
/// with snapshot ancestry visible, inspects the branch and discards the
/// result.
///
/// # Errors
///
/// Store failures and missing history blobs.
pub async fn would_induce_conflict(
    cold: &dyn Store,
    mem: &dyn Store,
    identity: &Identity,
    op: &CdvcsOp,
    fallback: &CdvcsState,
    branch: &str,
) -> Result<bool, CoreError> {
    let mut speculative = current_value(mem, identity, fallback).await?;
    let history = resolve_snapshots(cold, speculative.history.as_ref()).await?;
    speculative.join_with_history(op, &history);
    Ok(speculative.has_multiple_heads(branch))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
