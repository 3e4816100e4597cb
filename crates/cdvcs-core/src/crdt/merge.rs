use tracing::instrument;

use crate::dag::graph::CommitGraph;

/// Semilattice join of two values of the same type.
///
/// Implementations must be commutative, associative and idempotent.
pub trait Merge {
    fn merge(&mut self, other: Self);
}

impl Merge for CommitGraph {
    #[instrument(level = "trace", skip_all, fields(local = self.len(), incoming = other.len()))]
    fn merge(&mut self, other: Self) {
        self.extend_from(&other);
    }
}
