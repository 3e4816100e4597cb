//! cdvcs-core library.
//!
//! A causally-ordered commit-graph CRDT: commit graph model, downstream
//! join, lowest-common-ancestor merge, pull protocol with induced-conflict
//! detection, graph compaction and state materialization.

pub mod canonical;
pub mod compact;
pub mod config;
pub mod crdt;
pub mod dag;
pub mod error;
pub mod ids;
pub mod materialize;
pub mod replica;
pub mod store;
pub mod sync;

pub use crdt::{Crdt, CrdtKind, DownstreamOp};
pub use error::{CoreError, ErrorCode, Rejection};
pub use ids::{CommitId, ContentId, Context, Identity};
pub use replica::{Admission, Applied, PullOutcome, Replica};

/// # Conventions
///
/// - **Errors**: Library operations return `Result<_, CoreError>`. Expected
///   pull refusals are [`Rejection`] values, never errors. `anyhow::Result`
///   only at the configuration boundary.
/// - **Logging**: Use `tracing` macros (`info!`, `debug!`, `trace!`). The
///   library never installs a subscriber.
/// - **Ids and time**: Always through an explicit [`Context`].
pub fn init() {
    tracing::info!("cdvcs-core initialized");
}
