//! State materialization: rebuild a replicated value from its operation log.
//!
//! Every applied op is appended to the identity's log in the cold store.
//! [`get_crdt`] returns the live value from the mem store when present and
//! otherwise folds the log through join, starting from the empty value of
//! the kind recorded in the first entry. The result is published with a
//! compare-and-swap that only writes into an empty slot, so concurrent
//! materializations agree on one in-memory value per identity.

use serde_json::Value;
use tracing::{debug, instrument};

use crate::crdt::{Crdt, CrdtKind, DownstreamOp};
use crate::error::CoreError;
use crate::ids::Identity;
use crate::store::{Store, atomic_update_typed, get_typed, reduce_log};

/// Kind recorded in a serialized log entry.
fn entry_kind(entry: &Value) -> Result<CrdtKind, CoreError> {
    let tag = entry.get("crdt").and_then(Value::as_str).unwrap_or_default();
    CrdtKind::from_tag(tag)
}

/// Fold the log of `identity` into a fresh value. `None` for an empty log.
///
/// # Errors
///
/// [`CoreError::UnknownCrdtType`] if an entry names an unregistered kind,
/// [`CoreError::KindMismatch`] if the log mixes kinds, store and decoding
/// failures otherwise.
pub async fn replay_log(cold: &dyn Store, identity: &Identity) -> Result<Option<Crdt>, CoreError> {
    reduce_log(cold, &identity.log_key(), None, |acc: Option<Crdt>, entry| {
        let mut value = match acc {
            Some(value) => value,
            None => Crdt::empty(entry_kind(&entry)?),
        };
        let op: DownstreamOp = serde_json::from_value(entry)?;
        value.join(&op)?;
        Ok(Some(value))
    })
    .await
}

/// The current value of `identity`, materializing it from the log on a
/// cache miss.
///
/// # Errors
///
/// See [`replay_log`].
#[instrument(skip_all, fields(%identity))]
pub async fn get_crdt(cold: &dyn Store, mem: &dyn Store, identity: &Identity) -> Result<Option<Crdt>, CoreError> {
    let key = identity.state_key();
    if let Some(value) = get_typed::<Crdt>(mem, &key).await? {
        return Ok(Some(value));
    }

    let Some(rebuilt) = replay_log(cold, identity).await? else {
        return Ok(None);
    };

    // First writer wins: keep whatever a concurrent materialization stored.
    let (previous, value) = atomic_update_typed(mem, &key, |current: Option<Crdt>| {
        Ok(current.unwrap_or_else(|| rebuilt.clone()))
    })
    .await?;
    if previous.is_some() {
        debug!("concurrent materialization won, discarding rebuilt value");
    } else {
        debug!(kind = %value.kind(), "materialized from log");
    }
    Ok(Some(value))
}

/// Like [`get_crdt`], falling back to the empty value registered for `tag`.
///
/// The fallback is not stored.
///
/// # Errors
///
/// [`CoreError::UnknownCrdtType`] for an unregistered `tag`, plus anything
/// [`get_crdt`] returns.
pub async fn ensure_crdt(
    cold: &dyn Store,
    mem: &dyn Store,
    identity: &Identity,
    tag: &str,
) -> Result<Crdt, CoreError> {
    match get_crdt(cold, mem, identity).await? {
        Some(value) => Ok(value),
        None => Crdt::empty_for_tag(tag),
    }
}
