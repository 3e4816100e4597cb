//! In-memory [`Store`] backed by [`DashMap`].
//!
//! # Concurrency Model
//!
//! - DashMap shards give per-key concurrent access; no global lock.
//! - Every value carries a version counter bumped on each write.
//! - `atomic_update` reads a snapshot, runs the update function without any
//!   lock held, and commits only if the version is still the one it read.
//!   Losing the race yields to the scheduler and retries.

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde_json::Value;
use tracing::trace;

use super::{Store, StoreError, UpdateFn};

/// Default bound on `atomic_update` attempts.
pub const DEFAULT_MAX_CAS_RETRIES: u32 = 64;

#[derive(Debug, Clone)]
struct Versioned {
    version: u64,
    value: Value,
}

#[derive(Debug)]
pub struct MemoryStore {
    values: DashMap<String, Versioned>,
    logs: DashMap<String, Vec<Value>>,
    max_retries: u32,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_retries(DEFAULT_MAX_CAS_RETRIES)
    }

    #[must_use]
    pub fn with_max_retries(max_retries: u32) -> Self {
        Self {
            values: DashMap::new(),
            logs: DashMap::new(),
            max_retries: max_retries.max(1),
        }
    }

    /// Number of plain values held (logs excluded).
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Current version of `key`, `None` when absent.
    #[must_use]
    pub fn version(&self, key: &str) -> Option<u64> {
        self.values.get(key).map(|entry| entry.version)
    }

    /// Install `value` if `key` is still at `expected`. Returns `false` if
    /// another writer got there first.
    fn try_swap(&self, key: &str, expected: Option<u64>, value: Value) -> bool {
        match (self.values.entry(key.to_string()), expected) {
            (Entry::Occupied(mut slot), Some(version)) if slot.get().version == version => {
                slot.insert(Versioned {
                    version: version + 1,
                    value,
                });
                true
            }
            (Entry::Vacant(slot), None) => {
                slot.insert(Versioned { version: 1, value });
                true
            }
            _ => false,
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.values.get(key).map(|entry| entry.value.clone()))
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.values.contains_key(key))
    }

    async fn assoc(&self, key: &str, value: Value) -> Result<(), StoreError> {
        self.values
            .entry(key.to_string())
            .and_modify(|slot| {
                slot.version += 1;
                slot.value = value.clone();
            })
            .or_insert_with(|| Versioned { version: 1, value });
        Ok(())
    }

    async fn atomic_update(
        &self,
        key: &str,
        f: &UpdateFn<'_>,
    ) -> Result<(Option<Value>, Value), StoreError> {
        for attempt in 1..=self.max_retries {
            let snapshot = self.values.get(key).map(|entry| entry.value().clone());
            let (expected, old) = match snapshot {
                Some(Versioned { version, value }) => (Some(version), Some(value)),
                None => (None, None),
            };

            let new = f(old.as_ref())?;
            if old.as_ref() == Some(&new) {
                return Ok((old, new));
            }

            if self.try_swap(key, expected, new.clone()) {
                return Ok((old, new));
            }

            trace!(key, attempt, "atomic update lost race, retrying");
            tokio::task::yield_now().await;
        }

        Err(StoreError::Contention {
            key: key.to_string(),
            attempts: self.max_retries,
        })
    }

    async fn append_log(&self, key: &str, entry: Value) -> Result<(), StoreError> {
        self.logs.entry(key.to_string()).or_default().push(entry);
        Ok(())
    }

    async fn read_log(&self, key: &str) -> Result<Vec<Value>, StoreError> {
        Ok(self.logs.get(key).map(|log| log.value().clone()).unwrap_or_default())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;

    fn increment(current: Option<&Value>) -> Result<Value, StoreError> {
        let n = current.and_then(Value::as_u64).unwrap_or(0);
        Ok(json!(n + 1))
    }

    #[tokio::test]
    async fn get_and_exists() {
        let store = MemoryStore::new();
        assert!(!store.exists("a").await.unwrap());
        store.assoc("a", json!({"x": 1})).await.unwrap();
        assert!(store.exists("a").await.unwrap());
        assert_eq!(store.get("a").await.unwrap(), Some(json!({"x": 1})));
        assert_eq!(store.get("b").await.unwrap(), None);
    }

    #[tokio::test]
    async fn atomic_update_reports_old_and_new() {
        let store = MemoryStore::new();
        let (old, new) = store.atomic_update("n", &increment).await.unwrap();
        assert_eq!((old, new), (None, json!(1)));
        let (old, new) = store.atomic_update("n", &increment).await.unwrap();
        assert_eq!((old, new), (Some(json!(1)), json!(2)));
        assert_eq!(store.version("n"), Some(2));
    }

    #[tokio::test]
    async fn unchanged_value_skips_write() {
        let store = MemoryStore::new();
        store.assoc("k", json!("v")).await.unwrap();
        let keep = |cur: Option<&Value>| -> Result<Value, StoreError> {
            Ok(cur.cloned().unwrap_or(Value::Null))
        };
        let (old, new) = store.atomic_update("k", &keep).await.unwrap();
        assert_eq!(old.as_ref(), Some(&new));
        assert_eq!(store.version("k"), Some(1));
    }

    #[tokio::test]
    async fn update_error_leaves_value() {
        let store = MemoryStore::new();
        store.assoc("k", json!(1)).await.unwrap();
        let fail = |_: Option<&Value>| -> Result<Value, StoreError> {
            Err(StoreError::Aborted { key: "k".into() })
        };
        assert!(store.atomic_update("k", &fail).await.is_err());
        assert_eq!(store.get("k").await.unwrap(), Some(json!(1)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_updates_are_not_lost() {
        let store = Arc::new(MemoryStore::with_max_retries(10_000));
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let store = Arc::clone(&store);
            tasks.push(tokio::spawn(async move {
                for _ in 0..50 {
                    store.atomic_update("counter", &increment).await.unwrap();
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(store.get("counter").await.unwrap(), Some(json!(400)));
    }

    #[tokio::test]
    async fn independent_keys_do_not_contend() {
        let store = MemoryStore::with_max_retries(1);
        store.atomic_update("a", &increment).await.unwrap();
        store.atomic_update("b", &increment).await.unwrap();
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn logs_append_in_order() {
        let store = MemoryStore::new();
        assert!(store.read_log("l").await.unwrap().is_empty());
        store.append_log("l", json!(1)).await.unwrap();
        store.append_log("l", json!(2)).await.unwrap();
        assert_eq!(store.read_log("l").await.unwrap(), vec![json!(1), json!(2)]);
    }
}
