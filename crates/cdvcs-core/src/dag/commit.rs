//! Commit values.
//!
//! A commit is immutable once created and is identified by the content id
//! of its canonical JSON form (see [`super::hash::commit_id`]). The commit
//! graph only stores `id -> parents`; the full value lives in the store
//! under its id.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::CommitId;

/// Schema version written into every new commit.
pub const COMMIT_VERSION: u32 = 1;

/// One step of a commit: a value plus a reference to the pure function that
/// applies it to the previous state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub params: serde_json::Value,
    pub trans_fn: String,
}

impl Transaction {
    #[must_use]
    pub fn new(trans_fn: impl Into<String>, params: serde_json::Value) -> Self {
        Self {
            params,
            trans_fn: trans_fn.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub transactions: Vec<Transaction>,
    pub parents: BTreeSet<CommitId>,
    pub author: String,
    /// Type tag of the CRDT the commit belongs to.
    pub crdt: String,
    pub version: u32,
    pub ts: DateTime<Utc>,
}

/// The part of a commit that travels over the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireCommit {
    pub transactions: Vec<Transaction>,
    pub parents: BTreeSet<CommitId>,
}

impl Commit {
    /// Reduce to transactions and parents, stripping author and bookkeeping.
    #[must_use]
    pub fn commit_value(&self) -> WireCommit {
        WireCommit {
            transactions: self.transactions.clone(),
            parents: self.parents.clone(),
        }
    }
}
