//! Replica synchronisation.
//!
//! - [`missing`]: which commit blobs an incoming op references that the
//!   local store lacks.
//! - [`pull`]: admissibility of pulling a remote branch, including the
//!   induced-conflict dry run.

pub mod missing;
pub mod pull;

pub use missing::{collect_missing, commit_values, missing_commits};
pub use pull::{
    AcceptAll, ContentAddressCheck, IntegrityCheck, PullDecision, PullDestination, PullRequest, PullSource,
    pull_cdvcs,
};
