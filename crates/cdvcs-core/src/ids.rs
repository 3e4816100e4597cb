//! Identifiers and the id/time context.
//!
//! Content ids are derived by hashing the canonical JSON form of a value
//! (see [`crate::canonical`]). The hash function and the wall clock are not
//! ambient globals: every operation that mints ids or timestamps receives a
//! [`Context`] carrying both, so tests and simulations can substitute
//! deterministic stand-ins.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::canonical::to_canonical_json;

// ---------------------------------------------------------------------------
// ContentId
// ---------------------------------------------------------------------------

/// A content-addressed identifier, e.g. `blake3:<hex>`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentId(String);

/// Commits are identified by the content id of their value.
pub type CommitId = ContentId;

impl ContentId {
    /// Wrap an already-computed id.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ContentId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ContentId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// The logical owner of a replicated value: `[user, crdt-id]`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Identity {
    pub user: String,
    pub crdt_id: String,
}

impl Identity {
    #[must_use]
    pub fn new(user: impl Into<String>, crdt_id: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            crdt_id: crdt_id.into(),
        }
    }

    /// Store key of the live value.
    #[must_use]
    pub fn state_key(&self) -> String {
        format!("state/{}/{}", self.user, self.crdt_id)
    }

    /// Store key of the append-only operation log.
    #[must_use]
    pub fn log_key(&self) -> String {
        format!("log/{}/{}", self.user, self.crdt_id)
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.user, self.crdt_id)
    }
}

// ---------------------------------------------------------------------------
// Pluggable hash + clock
// ---------------------------------------------------------------------------

/// Deterministic, collision-resistant hash over canonical bytes.
pub trait ContentHasher: Send + Sync + fmt::Debug {
    fn hash_bytes(&self, bytes: &[u8]) -> ContentId;
}

/// BLAKE3 content hashing, rendered as `blake3:<lowercase hex>`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Blake3Hasher;

impl ContentHasher for Blake3Hasher {
    fn hash_bytes(&self, bytes: &[u8]) -> ContentId {
        ContentId(format!("blake3:{}", blake3::hash(bytes)))
    }
}

/// Wall-clock source.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that advances by a fixed step on every reading.
///
/// Two contexts built with the same start and step produce identical
/// timestamp sequences, which keeps commit ids reproducible.
#[derive(Debug)]
pub struct SteppingClock {
    next_ms: AtomicI64,
    step_ms: i64,
}

impl SteppingClock {
    #[must_use]
    pub fn new(start_ms: i64, step_ms: i64) -> Self {
        Self {
            next_ms: AtomicI64::new(start_ms),
            step_ms,
        }
    }
}

impl Clock for SteppingClock {
    fn now(&self) -> DateTime<Utc> {
        let ms = self.next_ms.fetch_add(self.step_ms, Ordering::Relaxed);
        Utc.timestamp_millis_opt(ms)
            .single()
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
    }
}

/// Id and time functions threaded through every operation that needs them.
#[derive(Debug, Clone)]
pub struct Context {
    hasher: Arc<dyn ContentHasher>,
    clock: Arc<dyn Clock>,
}

impl Context {
    #[must_use]
    pub fn new(hasher: Arc<dyn ContentHasher>, clock: Arc<dyn Clock>) -> Self {
        Self { hasher, clock }
    }

    /// BLAKE3 ids and the system clock.
    #[must_use]
    pub fn system() -> Self {
        Self::new(Arc::new(Blake3Hasher), Arc::new(SystemClock))
    }

    /// BLAKE3 ids and a [`SteppingClock`] starting at `start_ms`, one
    /// millisecond per reading.
    #[must_use]
    pub fn deterministic(start_ms: i64) -> Self {
        Self::new(Arc::new(Blake3Hasher), Arc::new(SteppingClock::new(start_ms, 1)))
    }

    /// Content id of the canonical JSON form of `value`.
    ///
    /// # Errors
    ///
    /// Returns `serde_json::Error` if `value` cannot be serialized.
    pub fn content_id<T: Serialize + ?Sized>(&self, value: &T) -> Result<ContentId, serde_json::Error> {
        let canonical = to_canonical_json(value)?;
        Ok(self.hasher.hash_bytes(canonical.as_bytes()))
    }

    #[must_use]
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::system()
    }
}
