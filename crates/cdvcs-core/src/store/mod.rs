//! Content-addressable store contract.
//!
//! The engine keeps two stores: a *cold* store holding commit blobs,
//! compaction snapshots and append-only operation logs, and a *mem* store
//! holding the live value per identity. Both implement [`Store`].
//!
//! # Atomicity
//!
//! Every mutation of an identity's live value goes through
//! [`Store::atomic_update`]: read, compute, then write only if the value did
//! not change in between, retrying on contention. Independent keys never
//! contend with each other. Blind read-then-write is never used.
//!
//! Store futures only suspend at I/O boundaries and implementations must not
//! hold locks across an `.await`.

pub mod memory;

use std::sync::Mutex;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::CoreError;

pub use memory::MemoryStore;

/// Errors surfaced by store implementations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// `atomic_update` lost the race too many times.
    #[error("atomic update of {key} gave up after {attempts} attempts")]
    Contention { key: String, attempts: u32 },

    /// The update function declined to produce a value.
    #[error("atomic update of {key} aborted")]
    Aborted { key: String },

    /// The backing medium failed.
    #[error("store backend failure: {0}")]
    Backend(String),
}

/// Update function passed to [`Store::atomic_update`].
///
/// Called once per attempt with the current value (or `None` when absent);
/// it may therefore run more than once and must be free of side effects.
pub type UpdateFn<'a> = dyn Fn(Option<&Value>) -> Result<Value, StoreError> + Send + Sync + 'a;

#[async_trait]
pub trait Store: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError>;

    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    /// Write `value` under `key`. Keys are content ids by convention, so
    /// writes are effectively write-once.
    async fn assoc(&self, key: &str, value: Value) -> Result<(), StoreError>;

    /// Compare-and-swap `key` through `f`, returning `(old, new)`.
    ///
    /// If `f` returns the value it was given, no write happens and
    /// `old == new` signals the no-op.
    async fn atomic_update(
        &self,
        key: &str,
        f: &UpdateFn<'_>,
    ) -> Result<(Option<Value>, Value), StoreError>;

    /// Append one entry to the log at `key`.
    async fn append_log(&self, key: &str, entry: Value) -> Result<(), StoreError>;

    /// All entries of the log at `key`, oldest first. Absent logs are empty.
    async fn read_log(&self, key: &str) -> Result<Vec<Value>, StoreError>;
}

/// Fold the log at `key` into an accumulated value.
///
/// # Errors
///
/// Propagates store failures and any error returned by `f`.
pub async fn reduce_log<T, F>(
    store: &dyn Store,
    key: &str,
    init: T,
    mut f: F,
) -> Result<T, CoreError>
where
    F: FnMut(T, Value) -> Result<T, CoreError>,
{
    let mut acc = init;
    for entry in store.read_log(key).await? {
        acc = f(acc, entry)?;
    }
    Ok(acc)
}

/// Deserialize the value stored at `key`.
///
/// # Errors
///
/// Returns an error on store failure or if the stored value has the wrong
/// shape.
pub async fn get_typed<T: DeserializeOwned>(
    store: &dyn Store,
    key: &str,
) -> Result<Option<T>, CoreError> {
    match store.get(key).await? {
        Some(value) => Ok(Some(serde_json::from_value(value)?)),
        None => Ok(None),
    }
}

/// Serialize and write `value` under `key`.
///
/// # Errors
///
/// Returns an error on store failure or if `value` cannot be serialized.
pub async fn assoc_typed<T: Serialize + Sync>(
    store: &dyn Store,
    key: &str,
    value: &T,
) -> Result<(), CoreError> {
    store.assoc(key, serde_json::to_value(value)?).await?;
    Ok(())
}

/// Typed wrapper around [`Store::atomic_update`].
///
/// `f` receives the decoded current value and returns the replacement.
/// Errors raised by `f` abort the update and are returned unchanged.
///
/// # Errors
///
/// Returns store failures, contention, decoding errors and errors from `f`.
pub async fn atomic_update_typed<T, F>(
    store: &dyn Store,
    key: &str,
    f: F,
) -> Result<(Option<T>, T), CoreError>
where
    T: Serialize + DeserializeOwned,
    F: Fn(Option<T>) -> Result<T, CoreError> + Send + Sync,
{
    let failure: Mutex<Option<CoreError>> = Mutex::new(None);

    let update = |current: Option<&Value>| -> Result<Value, StoreError> {
        let attempt = current
            .map(|v| serde_json::from_value::<T>(v.clone()))
            .transpose()
            .map_err(CoreError::from)
            .and_then(&f)
            .and_then(|next| serde_json::to_value(next).map_err(CoreError::from));
        match attempt {
            Ok(value) => Ok(value),
            Err(err) => {
                if let Ok(mut slot) = failure.lock() {
                    *slot = Some(err);
                }
                Err(StoreError::Aborted {
                    key: key.to_string(),
                })
            }
        }
    };

    match store.atomic_update(key, &update).await {
        Ok((old, new)) => {
            let old = old.map(serde_json::from_value).transpose()?;
            Ok((old, serde_json::from_value(new)?))
        }
        Err(StoreError::Aborted { key }) => {
            let captured = failure.lock().ok().and_then(|mut slot| slot.take());
            Err(captured.unwrap_or(CoreError::Store(StoreError::Aborted { key })))
        }
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn reduce_log_folds_in_order() {
        let store = MemoryStore::new();
        for n in 1..=4 {
            store.append_log("log", json!(n)).await.unwrap();
        }
        let digits = reduce_log(&store, "log", String::new(), |mut acc, entry| {
            acc.push_str(&entry.to_string());
            Ok(acc)
        })
        .await
        .unwrap();
        assert_eq!(digits, "1234");
    }

    #[tokio::test]
    async fn reduce_log_of_absent_key_is_init() {
        let store = MemoryStore::new();
        let total = reduce_log(&store, "nope", 7_i64, |acc, _| Ok(acc + 1))
            .await
            .unwrap();
        assert_eq!(total, 7);
    }

    #[tokio::test]
    async fn typed_update_round_trips() {
        let store = MemoryStore::new();
        let (old, new) = atomic_update_typed(&store, "n", |cur: Option<u64>| {
            Ok(cur.unwrap_or(0) + 1)
        })
        .await
        .unwrap();
        assert_eq!((old, new), (None, 1));

        let (old, new) = atomic_update_typed(&store, "n", |cur: Option<u64>| {
            Ok(cur.unwrap_or(0) + 1)
        })
        .await
        .unwrap();
        assert_eq!((old, new), (Some(1), 2));
    }

    #[tokio::test]
    async fn typed_update_surfaces_inner_error() {
        let store = MemoryStore::new();
        let err = atomic_update_typed(&store, "n", |_: Option<u64>| {
            Err(CoreError::UnknownBranch("dev".into()))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, CoreError::UnknownBranch(b) if b == "dev"));
        assert!(!store.exists("n").await.unwrap());
    }
}
