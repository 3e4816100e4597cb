//! Missing-commit computation and wire projection.
//!
//! Before an op is admitted, the transport fetches the commit blobs it
//! references but the local cold store lacks. [`missing_commits`] yields
//! those ids lazily, one existence check per id, so a caller can stop as
//! soon as it has seen enough. Dropping the stream early has no side
//! effects.

use std::collections::{BTreeMap, BTreeSet};

use futures::stream::{self, Stream, StreamExt, TryStreamExt};

use crate::crdt::DownstreamOp;
use crate::dag::commit::{Commit, WireCommit};
use crate::error::CoreError;
use crate::ids::CommitId;
use crate::store::{Store, StoreError, get_typed};

/// Ids referenced by `op` that `store` does not hold, in id order.
pub fn missing_commits<'a>(
    store: &'a dyn Store,
    op: &DownstreamOp,
) -> impl Stream<Item = Result<CommitId, StoreError>> + Send + 'a {
    stream::iter(op.commit_ids()).filter_map(move |id| async move {
        match store.exists(id.as_str()).await {
            Ok(true) => None,
            Ok(false) => Some(Ok(id)),
            Err(err) => Some(Err(err)),
        }
    })
}

/// Drain [`missing_commits`] into a set.
///
/// # Errors
///
/// The first store failure.
pub async fn collect_missing(store: &dyn Store, op: &DownstreamOp) -> Result<BTreeSet<CommitId>, StoreError> {
    missing_commits(store, op).try_collect().await
}

/// Load commit values and project them to their wire form.
///
/// Ids without a stored commit are skipped.
///
/// # Errors
///
/// Store failures or stored values that are not commits.
pub async fn commit_values(
    store: &dyn Store,
    ids: &BTreeSet<CommitId>,
) -> Result<BTreeMap<CommitId, WireCommit>, CoreError> {
    let mut values = BTreeMap::new();
    for id in ids {
        if let Some(commit) = get_typed::<Commit>(store, id.as_str()).await? {
            values.insert(id.clone(), commit.commit_value());
        }
    }
    Ok(values)
}
