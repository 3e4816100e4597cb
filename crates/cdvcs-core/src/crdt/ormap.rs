//! OR-Map (Observed-Remove Map) with add-wins semantics, registered as
//! `simple-ormap`.
//!
//! Every `assoc` stores the value under a fresh unique tag. A `dissoc` only
//! tombstones the tags that were observed at the time of removal, so a
//! concurrent `assoc` introduces a tag the removal never saw and survives.
//!
//! # Semilattice Properties
//!
//! Join is a union of both the add map and the removal map, which is
//! commutative, associative and idempotent. After a join a key is present
//! iff it has at least one add-tag not covered by a removal.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::merge::Merge;
use crate::ids::{ContentId, Context};

/// Unique tag attached to one `assoc`.
pub type Tag = ContentId;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrMap {
    pub adds: BTreeMap<String, BTreeMap<Tag, Value>>,
    pub removals: BTreeMap<String, BTreeSet<Tag>>,
}

/// Downstream op of an OR-Map: a partial map carrying only the new tags.
pub type OrMapOp = OrMap;

#[derive(Serialize)]
struct TagSeed<'a> {
    key: &'a str,
    value: &'a Value,
    ts: DateTime<Utc>,
}

impl OrMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `value` under `key` with a fresh tag.
    ///
    /// # Errors
    ///
    /// Returns `serde_json::Error` if the tag cannot be computed.
    pub fn assoc(
        &mut self,
        ctx: &Context,
        key: &str,
        value: Value,
    ) -> Result<OrMapOp, serde_json::Error> {
        let tag = ctx.content_id(&TagSeed {
            key,
            value: &value,
            ts: ctx.now(),
        })?;
        let mut op = Self::new();
        op.adds
            .entry(key.to_string())
            .or_default()
            .insert(tag, value);
        self.join(&op);
        Ok(op)
    }

    /// Remove every currently observed binding of `key`.
    pub fn dissoc(&mut self, key: &str) -> OrMapOp {
        let observed: BTreeSet<Tag> = self.live_tags(key).cloned().collect();
        let mut op = Self::new();
        if !observed.is_empty() {
            op.removals.insert(key.to_string(), observed);
        }
        self.join(&op);
        op
    }

    /// Join an incoming op.
    pub fn join(&mut self, op: &OrMapOp) {
        for (key, tagged) in &op.adds {
            let slot = self.adds.entry(key.clone()).or_default();
            for (tag, value) in tagged {
                slot.entry(tag.clone()).or_insert_with(|| value.clone());
            }
        }
        for (key, tags) in &op.removals {
            self.removals
                .entry(key.clone())
                .or_default()
                .extend(tags.iter().cloned());
        }
    }

    fn live_tags<'a>(&'a self, key: &str) -> impl Iterator<Item = &'a Tag> + 'a {
        let removed = self.removals.get(key);
        self.adds
            .get(key)
            .into_iter()
            .flat_map(BTreeMap::keys)
            .filter(move |tag| removed.is_none_or(|r| !r.contains(*tag)))
    }

    /// Live values bound to `key`, in tag order. Concurrent `assoc`s of the
    /// same key all stay visible.
    #[must_use]
    pub fn get(&self, key: &str) -> Vec<&Value> {
        let Some(tagged) = self.adds.get(key) else {
            return Vec::new();
        };
        self.live_tags(key).filter_map(|tag| tagged.get(tag)).collect()
    }

    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.live_tags(key).next().is_some()
    }

    /// Keys with at least one live binding.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.adds
            .keys()
            .filter(|key| self.contains_key(key))
            .map(String::as_str)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.keys().count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Merge for OrMap {
    fn merge(&mut self, other: Self) {
        self.join(&other);
    }
}
