//! Error taxonomy for the replication engine.
//!
//! Two families of outcome leave this crate:
//!
//! - **Structural errors** ([`CoreError`]): malformed causal graphs, unknown
//!   CRDT type tags, store I/O failures. These are fatal for the operation
//!   and propagate unchanged so the caller can abort a sync session.
//! - **Rejections** ([`Rejection`]): pulls declined because of conflicts,
//!   insufficient history, redundancy or failed integrity checks. These are
//!   routine CRDT states and travel as values, never as errors.
//!
//! Contention inside `atomic_update` is retried by the store and only
//! surfaces as [`ErrorCode::Contention`] once the retry budget is spent.

use std::fmt;

use crate::dag::hash::{HashError, HashErrorCode};
use crate::dag::lca::LcaError;
use crate::ids::CommitId;
use crate::store::StoreError;

/// Machine-readable error codes for agent-friendly decision making.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    MalformedGraph,
    UnknownCommit,
    MultipleHeads,
    BranchExists,
    UnknownBranch,
    UnknownCrdtType,
    KindMismatch,
    HashMismatch,
    StoreFailure,
    SerializeFailure,
    Contention,
}

impl ErrorCode {
    /// Stable code identifier (`E####`) for machine parsing.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::MalformedGraph => "E2001",
            Self::UnknownCommit => "E2002",
            Self::MultipleHeads => "E2003",
            Self::BranchExists => "E2004",
            Self::UnknownBranch => "E2005",
            Self::UnknownCrdtType => "E3001",
            Self::KindMismatch => "E3002",
            Self::HashMismatch => "E3003",
            Self::StoreFailure => "E5001",
            Self::SerializeFailure => "E5002",
            Self::Contention => "E5003",
        }
    }

    /// Short human-facing summary for logs and terminal output.
    #[must_use]
    pub const fn message(self) -> &'static str {
        match self {
            Self::MalformedGraph => "Malformed commit graph",
            Self::UnknownCommit => "Commit not found",
            Self::MultipleHeads => "Branch has multiple heads",
            Self::BranchExists => "Branch already exists",
            Self::UnknownBranch => "Branch not found",
            Self::UnknownCrdtType => "Unknown CRDT type tag",
            Self::KindMismatch => "Operation does not match CRDT kind",
            Self::HashMismatch => "Content hash mismatch",
            Self::StoreFailure => "Store operation failed",
            Self::SerializeFailure => "Value (de)serialization failed",
            Self::Contention => "Atomic update contention",
        }
    }

    /// Optional remediation hint that can be surfaced to operators and agents.
    #[must_use]
    pub const fn hint(self) -> Option<&'static str> {
        match self {
            Self::MalformedGraph => Some("Re-fetch the affected commits from a trusted replica."),
            Self::UnknownCommit | Self::UnknownBranch => None,
            Self::MultipleHeads => Some("Merge the branch heads before committing."),
            Self::BranchExists => Some("Pick a different branch name."),
            Self::UnknownCrdtType => {
                Some("Use one of: cdvcs, simple-gset, simple-ormap.")
            }
            Self::KindMismatch => Some("Route operations to a CRDT of the matching kind."),
            Self::HashMismatch => Some("Discard the blob; it does not match its content id."),
            Self::StoreFailure => Some("Check the backing store and retry the sync session."),
            Self::SerializeFailure => None,
            Self::Contention => Some("Retry later or raise store.max_cas_retries."),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Fatal failures of engine operations.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// A commit graph violated a structural invariant.
    #[error("malformed commit graph: {0}")]
    MalformedGraph(String),

    /// A referenced commit is not part of the graph.
    #[error("unknown commit {0}")]
    UnknownCommit(CommitId),

    /// A local operation needs a single head but the branch is conflicted.
    #[error("branch {branch} has {heads} heads")]
    MultipleHeads { branch: String, heads: usize },

    /// A branch with this name already exists.
    #[error("branch {0} already exists")]
    BranchExists(String),

    /// The named branch does not exist.
    #[error("unknown branch {0}")]
    UnknownBranch(String),

    /// The type registry has no constructor for this tag.
    #[error("cannot materialize unknown CRDT type {0:?}")]
    UnknownCrdtType(String),

    /// An operation of one CRDT kind was routed to a value of another.
    #[error("{op} operation cannot be joined into a {state} value")]
    KindMismatch {
        state: &'static str,
        op: &'static str,
    },

    #[error(transparent)]
    Lca(#[from] LcaError),

    #[error(transparent)]
    Hash(#[from] HashError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("failed to (de)serialize value: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl CoreError {
    /// Machine-readable code associated with this error.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::MalformedGraph(_) => ErrorCode::MalformedGraph,
            Self::UnknownCommit(_) => ErrorCode::UnknownCommit,
            Self::MultipleHeads { .. } => ErrorCode::MultipleHeads,
            Self::BranchExists(_) => ErrorCode::BranchExists,
            Self::UnknownBranch(_) => ErrorCode::UnknownBranch,
            Self::UnknownCrdtType(_) => ErrorCode::UnknownCrdtType,
            Self::KindMismatch { .. } => ErrorCode::KindMismatch,
            Self::Lca(LcaError::UnknownCommit(_)) => ErrorCode::UnknownCommit,
            Self::Hash(err) => match err.code() {
                HashErrorCode::HashMismatch => ErrorCode::HashMismatch,
                HashErrorCode::UnknownParent => ErrorCode::UnknownCommit,
                HashErrorCode::ComputeFailure => ErrorCode::SerializeFailure,
            },
            Self::Store(StoreError::Contention { .. }) => ErrorCode::Contention,
            Self::Store(_) => ErrorCode::StoreFailure,
            Self::Serialize(_) => ErrorCode::SerializeFailure,
        }
    }

    /// Optional remediation hint for operators and agents.
    #[must_use]
    pub fn hint(&self) -> Option<&'static str> {
        self.code().hint()
    }
}

/// Why a pull was declined.
///
/// Rejections are expected outcomes: callers retry later or surface them as
/// "pull declined". They are never raised as errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// The source branch is itself mid-conflict.
    SourceConflict { branch: String, heads: usize },
    /// The destination branch is conflicted, so there is no single base to
    /// fast-forward from.
    DestinationConflict { branch: String, heads: usize },
    /// The local branch heads are not contained in the remote history.
    InsufficientHistory,
    /// Branch or tip metadata did not have the expected shape.
    MetadataMismatch(String),
    /// The destination already contains the remote tip.
    PullUnnecessary,
    /// Admitting the delta would leave the destination branch with several heads.
    InducedConflict { branch: String },
    /// The caller's integrity check refused the new commits.
    IntegrityFailed { commits: usize },
}

impl Rejection {
    /// Stable short label used in structured logs.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::SourceConflict { .. } => "source-conflict",
            Self::DestinationConflict { .. } => "destination-conflict",
            Self::InsufficientHistory => "insufficient-history",
            Self::MetadataMismatch(_) => "metadata-mismatch",
            Self::PullUnnecessary => "pull-unnecessary",
            Self::InducedConflict { .. } => "induced-conflict",
            Self::IntegrityFailed { .. } => "integrity-failed",
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SourceConflict { branch, heads } => {
                write!(f, "pull declined: source branch {branch} has {heads} heads")
            }
            Self::DestinationConflict { branch, heads } => {
                write!(f, "pull declined: destination branch {branch} has {heads} heads")
            }
            Self::InsufficientHistory => {
                write!(f, "pull declined: remote history does not contain local heads")
            }
            Self::MetadataMismatch(detail) => write!(f, "pull declined: {detail}"),
            Self::PullUnnecessary => write!(f, "pull declined: already up to date"),
            Self::InducedConflict { branch } => {
                write!(f, "pull declined: would create multiple heads on {branch}")
            }
            Self::IntegrityFailed { commits } => {
                write!(f, "pull declined: integrity check refused {commits} new commits")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{CoreError, ErrorCode, Rejection};
    use crate::dag::hash::HashError;
    use crate::ids::CommitId;
    use crate::store::StoreError;
    use std::collections::HashSet;

    #[test]
    fn all_codes_are_unique() {
        let all = [
            ErrorCode::MalformedGraph,
            ErrorCode::UnknownCommit,
            ErrorCode::MultipleHeads,
            ErrorCode::BranchExists,
            ErrorCode::UnknownBranch,
            ErrorCode::UnknownCrdtType,
            ErrorCode::KindMismatch,
            ErrorCode::HashMismatch,
            ErrorCode::StoreFailure,
            ErrorCode::SerializeFailure,
            ErrorCode::Contention,
        ];

        let mut seen = HashSet::new();
        for code in all {
            assert!(seen.insert(code.code()), "duplicate code {}", code.code());
        }
    }

    #[test]
    fn every_code_is_produced_by_some_error() {
        let id = CommitId::from("blake3:x");
        let serde_err = serde_json::from_str::<u8>("nope").unwrap_err();
        let errors = [
            CoreError::MalformedGraph("cycle".into()),
            CoreError::UnknownCommit(id.clone()),
            CoreError::MultipleHeads {
                branch: "master".into(),
                heads: 2,
            },
            CoreError::BranchExists("dev".into()),
            CoreError::UnknownBranch("dev".into()),
            CoreError::UnknownCrdtType("lww".into()),
            CoreError::KindMismatch {
                state: "simple-gset",
                op: "cdvcs",
            },
            CoreError::Hash(HashError::HashMismatch {
                stored: id.clone(),
                expected: id,
            }),
            CoreError::Store(StoreError::Backend("disk".into())),
            CoreError::Serialize(serde_err),
            CoreError::Store(StoreError::Contention {
                key: "k".into(),
                attempts: 1,
            }),
        ];
        let produced: HashSet<&str> = errors.iter().map(|err| err.code().code()).collect();
        assert_eq!(produced.len(), errors.len());
    }

    #[test]
    fn code_format_is_machine_friendly() {
        let code = ErrorCode::MalformedGraph.code();
        assert_eq!(code.len(), 5);
        assert!(code.starts_with('E'));
        assert!(code.chars().skip(1).all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn contention_maps_to_its_own_code() {
        let err = CoreError::Store(StoreError::Contention {
            key: "alice/repo".into(),
            attempts: 3,
        });
        assert_eq!(err.code(), ErrorCode::Contention);
        assert!(err.hint().is_some());
    }

    #[test]
    fn unknown_type_message_names_the_tag() {
        let err = CoreError::UnknownCrdtType("lww-register".into());
        assert_eq!(err.code(), ErrorCode::UnknownCrdtType);
        assert!(err.to_string().contains("lww-register"));
    }

    #[test]
    fn rejection_display_mentions_branch() {
        let rejection = Rejection::InducedConflict {
            branch: "master".into(),
        };
        assert_eq!(rejection.kind(), "induced-conflict");
        assert!(rejection.to_string().contains("master"));
    }
}
