//! The closed set of replicated data types.
//!
//! Every kind implements the same capabilities (join, select identities,
//! missing commits, commit values, pull) and is dispatched by its type tag:
//!
//! | Tag | Value | Op |
//! |---|---|---|
//! | `cdvcs` | [`CdvcsState`] | [`CdvcsOp`] |
//! | `simple-gset` | [`GSet`] | [`GSetOp`] |
//! | `simple-ormap` | [`OrMap`] | [`OrMapOp`] |
//!
//! Only CDVCS carries a commit graph; for the other kinds the graph-related
//! capabilities are empty.

pub mod cdvcs;
pub mod gset;
pub mod merge;
pub mod ormap;

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

pub use cdvcs::{CdvcsOp, CdvcsState};
pub use gset::{GSet, GSetOp};
pub use merge::Merge;
pub use ormap::{OrMap, OrMapOp};

use crate::error::CoreError;
use crate::ids::CommitId;

/// Type tag of a replicated value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CrdtKind {
    #[serde(rename = "cdvcs")]
    Cdvcs,
    #[serde(rename = "simple-gset")]
    GSet,
    #[serde(rename = "simple-ormap")]
    OrMap,
}

impl CrdtKind {
    pub const ALL: [Self; 3] = [Self::Cdvcs, Self::GSet, Self::OrMap];

    #[must_use]
    pub const fn tag(self) -> &'static str {
        match self {
            Self::Cdvcs => cdvcs::CDVCS_TAG,
            Self::GSet => "simple-gset",
            Self::OrMap => "simple-ormap",
        }
    }

    /// Look up a kind by tag.
    ///
    /// # Errors
    ///
    /// [`CoreError::UnknownCrdtType`] for tags outside the registry.
    pub fn from_tag(tag: &str) -> Result<Self, CoreError> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.tag() == tag)
            .ok_or_else(|| CoreError::UnknownCrdtType(tag.to_string()))
    }
}

impl fmt::Display for CrdtKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// A materialized replicated value of any registered kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "crdt", content = "state")]
pub enum Crdt {
    #[serde(rename = "cdvcs")]
    Cdvcs(CdvcsState),
    #[serde(rename = "simple-gset")]
    GSet(GSet<String>),
    #[serde(rename = "simple-ormap")]
    OrMap(OrMap),
}

/// A downstream op of any registered kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "crdt", content = "op")]
pub enum DownstreamOp {
    #[serde(rename = "cdvcs")]
    Cdvcs(CdvcsOp),
    #[serde(rename = "simple-gset")]
    GSet(GSetOp<String>),
    #[serde(rename = "simple-ormap")]
    OrMap(OrMapOp),
}

impl Crdt {
    /// Registry: the empty value of `kind`.
    #[must_use]
    pub fn empty(kind: CrdtKind) -> Self {
        match kind {
            CrdtKind::Cdvcs => Self::Cdvcs(CdvcsState::empty()),
            CrdtKind::GSet => Self::GSet(GSet::new()),
            CrdtKind::OrMap => Self::OrMap(OrMap::new()),
        }
    }

    /// Registry lookup by tag.
    ///
    /// # Errors
    ///
    /// [`CoreError::UnknownCrdtType`] for unregistered tags.
    pub fn empty_for_tag(tag: &str) -> Result<Self, CoreError> {
        CrdtKind::from_tag(tag).map(Self::empty)
    }

    #[must_use]
    pub const fn kind(&self) -> CrdtKind {
        match self {
            Self::Cdvcs(_) => CrdtKind::Cdvcs,
            Self::GSet(_) => CrdtKind::GSet,
            Self::OrMap(_) => CrdtKind::OrMap,
        }
    }

    /// Join `op` into this value.
    ///
    /// # Errors
    ///
    /// [`CoreError::KindMismatch`] if `op` belongs to another kind.
    pub fn join(&mut self, op: &DownstreamOp) -> Result<(), CoreError> {
        match (self, op) {
            (Self::Cdvcs(state), DownstreamOp::Cdvcs(op)) => state.join(op),
            (Self::GSet(set), DownstreamOp::GSet(op)) => set.join(op),
            (Self::OrMap(map), DownstreamOp::OrMap(op)) => map.join(op),
            (value, op) => {
                return Err(CoreError::KindMismatch {
                    state: value.kind().tag(),
                    op: op.kind().tag(),
                });
            }
        }
        Ok(())
    }

    /// `join` on a copy.
    ///
    /// # Errors
    ///
    /// See [`Crdt::join`].
    pub fn joined(&self, op: &DownstreamOp) -> Result<Self, CoreError> {
        let mut next = self.clone();
        next.join(op)?;
        Ok(next)
    }

    #[must_use]
    pub const fn as_cdvcs(&self) -> Option<&CdvcsState> {
        match self {
            Self::Cdvcs(state) => Some(state),
            _ => None,
        }
    }
}

impl DownstreamOp {
    #[must_use]
    pub const fn kind(&self) -> CrdtKind {
        match self {
            Self::Cdvcs(_) => CrdtKind::Cdvcs,
            Self::GSet(_) => CrdtKind::GSet,
            Self::OrMap(_) => CrdtKind::OrMap,
        }
    }

    /// Restrict the op to `allowed` branches. Kinds without branches pass
    /// through unchanged.
    #[must_use]
    pub fn select_identities(&self, allowed: &BTreeSet<String>) -> Self {
        match self {
            Self::Cdvcs(op) => Self::Cdvcs(op.select_identities(allowed)),
            other => other.clone(),
        }
    }

    /// Identities (branches) the op touches, for per-identity filtering.
    #[must_use]
    pub fn identities(&self) -> BTreeSet<String> {
        match self {
            Self::Cdvcs(op) => op.identities(),
            Self::GSet(_) | Self::OrMap(_) => BTreeSet::new(),
        }
    }

    /// Commit ids referenced by the op, candidates for fetching.
    #[must_use]
    pub fn commit_ids(&self) -> Vec<CommitId> {
        match self {
            Self::Cdvcs(op) => op.commit_ids().cloned().collect(),
            Self::GSet(_) | Self::OrMap(_) => Vec::new(),
        }
    }
}
