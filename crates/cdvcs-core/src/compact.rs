//! Graph compaction for CDVCS values.
//!
//! The live `commit_graph` of a CDVCS value grows with every commit.
//! Compaction moves the current live graph into an immutable snapshot blob
//! in the cold store and shrinks the live graph to whatever was added after
//! the snapshot was taken.
//!
//! # History chain
//!
//! Snapshots are chained through `history`: the content id of an ordered
//! list of snapshot ids, oldest first. Each compaction appends one snapshot
//! id and stores the extended list under its own content id, so every blob
//! is write-once and the full graph is the live graph plus every snapshot
//! in the list.
//!
//! # Concurrency
//!
//! The shrink is a compare-and-swap on the live value that only applies
//! while `history` still points at the chain the snapshot extended. A
//! concurrent compaction that won the race leaves this one as a no-op, so
//! no snapshot reference is ever dropped. The difference against the
//! snapshot is recomputed inside the swap, so commits joined concurrently
//! stay live.
//!
//! Compaction is an optimization. A skipped compaction only costs memory.

use serde::Serialize;
use tracing::{debug, info, instrument};

use crate::config::CompactionConfig;
use crate::crdt::{CdvcsState, Crdt};
use crate::dag::graph::CommitGraph;
use crate::error::CoreError;
use crate::ids::{ContentId, Context, Identity};
use crate::store::{Store, assoc_typed, atomic_update_typed, get_typed};

// ---------------------------------------------------------------------------
// CompactionReport
// ---------------------------------------------------------------------------

/// Report from a compaction that took effect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompactionReport {
    /// Content id of the new snapshot blob.
    pub snapshot: ContentId,
    /// Content id of the extended history list.
    pub history: ContentId,
    /// Number of commits moved into the snapshot.
    pub commits_compacted: usize,
    /// Number of commits left in the live graph.
    pub commits_remaining: usize,
}

// ---------------------------------------------------------------------------
// History resolution
// ---------------------------------------------------------------------------

/// Snapshot ids of a history chain, oldest first.
///
/// # Errors
///
/// [`CoreError::MalformedGraph`] if the chain blob is missing.
pub async fn load_history(
    cold: &dyn Store,
    history: Option<&ContentId>,
) -> Result<Vec<ContentId>, CoreError> {
    let Some(history) = history else {
        return Ok(Vec::new());
    };
    get_typed::<Vec<ContentId>>(cold, history.as_str())
        .await?
        .ok_or_else(|| CoreError::MalformedGraph(format!("history blob {history} is missing")))
}

/// Union of every snapshot in a history chain.
///
/// # Errors
///
/// [`CoreError::MalformedGraph`] if a referenced blob is missing, or a store
/// failure.
pub async fn resolve_snapshots(
    cold: &dyn Store,
    history: Option<&ContentId>,
) -> Result<CommitGraph, CoreError> {
    let mut graph = CommitGraph::new();
    for snapshot_id in load_history(cold, history).await? {
        let snapshot = get_typed::<CommitGraph>(cold, snapshot_id.as_str())
            .await?
            .ok_or_else(|| CoreError::MalformedGraph(format!("snapshot blob {snapshot_id} is missing")))?;
        graph.extend_from(&snapshot);
    }
    Ok(graph)
}

/// The live graph of `state` together with every compacted snapshot.
///
/// # Errors
///
/// See [`resolve_snapshots`].
pub async fn resolve_full_graph(cold: &dyn Store, state: &CdvcsState) -> Result<CommitGraph, CoreError> {
    let mut full = resolve_snapshots(cold, state.history.as_ref()).await?;
    full.extend_from(&state.commit_graph);
    Ok(full)
}

/// `state` with its commit graph replaced by the full history.
///
/// # Errors
///
/// See [`resolve_full_graph`].
pub async fn resolve_full_state(cold: &dyn Store, state: &CdvcsState) -> Result<CdvcsState, CoreError> {
    let mut full = state.clone();
    full.commit_graph = resolve_full_graph(cold, state).await?;
    Ok(full)
}

// ---------------------------------------------------------------------------
// Compaction
// ---------------------------------------------------------------------------

/// Compact the CDVCS value of `identity` if its live graph reached the
/// configured threshold.
///
/// Returns `None` when nothing happened: compaction disabled, value absent
/// or not a CDVCS, live graph empty or below threshold, or a concurrent
/// compaction won.
///
/// # Errors
///
/// Store failures and missing history blobs.
#[instrument(skip_all, fields(%identity))]
pub async fn maybe_compact(
    cold: &dyn Store,
    mem: &dyn Store,
    ctx: &Context,
    config: &CompactionConfig,
    identity: &Identity,
) -> Result<Option<CompactionReport>, CoreError> {
    if !config.enabled {
        return Ok(None);
    }
    let key = identity.state_key();
    let Some(Crdt::Cdvcs(state)) = get_typed::<Crdt>(mem, &key).await? else {
        return Ok(None);
    };
    if state.commit_graph.is_empty() || state.commit_graph.len() < config.threshold {
        return Ok(None);
    }

    let snapshot = state.commit_graph;
    let snapshot_id = ctx.content_id(&snapshot)?;
    let base_history = state.history;

    let mut chain = load_history(cold, base_history.as_ref()).await?;
    chain.push(snapshot_id.clone());
    let history_id = ctx.content_id(&chain)?;

    assoc_typed(cold, snapshot_id.as_str(), &snapshot).await?;
    assoc_typed(cold, history_id.as_str(), &chain).await?;

    let Some(after) = shrink_live(mem, &key, base_history.as_ref(), &snapshot, &history_id).await? else {
        debug!(snapshot = %snapshot_id, "concurrent compaction won, skipping");
        return Ok(None);
    };

    let report = CompactionReport {
        snapshot: snapshot_id,
        history: history_id,
        commits_compacted: snapshot.len(),
        commits_remaining: after.commit_graph.len(),
    };
    info!(
        snapshot = %report.snapshot,
        compacted = report.commits_compacted,
        remaining = report.commits_remaining,
        "compacted commit graph"
    );
    Ok(Some(report))
}

/// Swap the live graph down to the commits not in `snapshot`, but only
/// while the live value still extends `base_history`. Returns the new live
/// value if the swap applied.
async fn shrink_live(
    mem: &dyn Store,
    key: &str,
    base_history: Option<&ContentId>,
    snapshot: &CommitGraph,
    history_id: &ContentId,
) -> Result<Option<CdvcsState>, CoreError> {
    let (_, swapped) = atomic_update_typed(mem, key, |current: Option<Crdt>| match current {
        Some(Crdt::Cdvcs(mut live)) if live.history.as_ref() == base_history => {
            live.commit_graph = live.commit_graph.difference(snapshot);
            live.history = Some(history_id.clone());
            Ok(Crdt::Cdvcs(live))
        }
        Some(other) => Ok(other),
        None => Err(CoreError::MalformedGraph(format!(
            "value of {key} vanished during compaction"
        ))),
    })
    .await?;

    match swapped {
        Crdt::Cdvcs(after) if after.history.as_ref() == Some(history_id) => Ok(Some(after)),
        _ => Ok(None),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
