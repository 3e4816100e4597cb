use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use super::merge::Merge;

/// Grow-only Set (G-Set) CRDT, registered as `simple-gset`.
///
/// The merge operation is a simple set union. Elements are kept ordered so
/// the serialized form, and hence any content id derived from it, is stable.
///
/// Satisfies semilattice properties:
/// - Commutative: a ∪ b = b ∪ a
/// - Associative: (a ∪ b) ∪ c = a ∪ (b ∪ c)
/// - Idempotent: a ∪ a = a
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GSet<T: Ord> {
    pub elements: BTreeSet<T>,
}

/// Downstream op of a G-Set: the elements to add.
pub type GSetOp<T> = GSet<T>;

impl<T: Ord + Clone> GSet<T> {
    /// Create a new empty G-Set.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            elements: BTreeSet::new(),
        }
    }

    /// Insert an element, returning the op that propagates it.
    pub fn add(&mut self, element: T) -> GSetOp<T> {
        self.elements.insert(element.clone());
        Self {
            elements: BTreeSet::from([element]),
        }
    }

    /// Join an incoming op (set union).
    pub fn join(&mut self, op: &GSetOp<T>) {
        self.elements.extend(op.elements.iter().cloned());
    }

    pub fn contains(&self, element: &T) -> bool {
        self.elements.contains(element)
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }
}

impl<T: Ord + Clone> Default for GSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Ord + Clone> Merge for GSet<T> {
    fn merge(&mut self, other: Self) {
        self.elements.extend(other.elements);
    }
}
