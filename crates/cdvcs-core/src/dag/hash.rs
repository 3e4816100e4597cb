//! Content-addressed commit hashing.
//!
//! # Properties
//!
//! - A commit id covers the commit's content AND its parent ids.
//! - Modifying any commit changes its id and therefore invalidates the ids
//!   of all its descendants.
//! - The pre-image is canonical JSON, so map ordering never changes an id.
//! - Id format is decided by the [`Context`]'s hasher (`blake3:<hex>` by
//!   default).

use std::collections::BTreeMap;

use super::commit::Commit;
use super::graph::ParentLookup;
use crate::ids::{CommitId, Context};

// ---------------------------------------------------------------------------
// Machine-readable error codes
// ---------------------------------------------------------------------------

/// Machine-readable codes for [`HashError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashErrorCode {
    /// The id a commit is stored under is not the hash of its content.
    HashMismatch,
    /// A commit references a parent that cannot be resolved.
    UnknownParent,
    /// The id could not be computed (serialization failure).
    ComputeFailure,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from commit hash verification.
#[derive(Debug, thiserror::Error)]
pub enum HashError {
    #[error("commit hash mismatch: stored={stored} expected={expected}")]
    HashMismatch {
        /// The id the commit was presented under.
        stored: CommitId,
        /// The id computed from the commit's content.
        expected: CommitId,
    },

    #[error("commit {commit} references unknown parent {parent}")]
    UnknownParent { commit: CommitId, parent: CommitId },

    #[error("failed to compute commit id: {0}")]
    Compute(#[from] serde_json::Error),
}

impl HashError {
    #[must_use]
    pub fn code(&self) -> HashErrorCode {
        match self {
            Self::HashMismatch { .. } => HashErrorCode::HashMismatch,
            Self::UnknownParent { .. } => HashErrorCode::UnknownParent,
            Self::Compute(_) => HashErrorCode::ComputeFailure,
        }
    }
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Content id of a commit.
///
/// # Errors
///
/// Returns [`HashError::Compute`] if the commit cannot be serialized.
pub fn commit_id(ctx: &Context, commit: &Commit) -> Result<CommitId, HashError> {
    Ok(ctx.content_id(commit)?)
}

/// Verify a batch of commits against their ids and against a graph.
///
/// Every commit must hash to its id, and every parent it names must either
/// be part of the batch or already be known to `known`.
///
/// # Errors
///
/// Returns the first [`HashError`] found, in id order.
pub fn verify_chain<G: ParentLookup + ?Sized>(
    ctx: &Context,
    commits: &BTreeMap<CommitId, Commit>,
    known: &G,
) -> Result<(), HashError> {
    for (id, commit) in commits {
        let expected = commit_id(ctx, commit)?;
        if &expected != id {
            return Err(HashError::HashMismatch {
                stored: id.clone(),
                expected,
            });
        }

        for parent in &commit.parents {
            if !commits.contains_key(parent) && !known.contains_commit(parent) {
                return Err(HashError::UnknownParent {
                    commit: id.clone(),
                    parent: parent.clone(),
                });
            }
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
