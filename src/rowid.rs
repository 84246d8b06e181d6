//! Row identity.
//!
//! A [`RowId`] is an opaque handle shared by every stage in a pipeline —
//! documents, synthesized group rows, and unwound children all draw from the
//! same counter (spec §3, §9 "Row-id graph, no pointers"). It never changes
//! once assigned and is never reused.

use std::cell::Cell;
use std::fmt;

/// Stable integer identity for a document or a stage-synthesized row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RowId(u64);

impl RowId {
    /// Constructs a `RowId` from a raw value. Only for tests and
    /// deserializing debug snapshots — production code obtains ids from
    /// [`RowIdAllocator`].
    pub fn from_raw(v: u64) -> Self {
        RowId(v)
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Single counter shared across every stage of a pipeline and the root
/// document store, so ids never collide regardless of which stage
/// synthesized them.
#[derive(Debug, Default)]
pub struct RowIdAllocator {
    next: Cell<u64>,
}

impl RowIdAllocator {
    pub fn new() -> Self {
        RowIdAllocator { next: Cell::new(0) }
    }

    pub fn alloc(&self) -> RowId {
        let id = self.next.get();
        self.next.set(id + 1);
        RowId(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocator_never_repeats() {
        let alloc = RowIdAllocator::new();
        let a = alloc.alloc();
        let b = alloc.alloc();
        assert_ne!(a, b);
        assert_eq!(a.raw(), 0);
        assert_eq!(b.raw(), 1);
    }
}
