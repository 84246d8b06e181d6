//! Deltas and active sets.
//!
//! A [`Delta`] is the unit of change a stage reacts to: `+rowId` (the row
//! became visible) or `−rowId` (it stopped being visible). Batches are
//! processed strictly in order (spec §3).

use std::collections::HashSet;

use crate::rowid::RowId;

/// `(rowId, sign)` — the only thing a stage's `apply_delta` ever consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delta {
    Insert(RowId),
    Remove(RowId),
}

impl Delta {
    pub fn row_id(self) -> RowId {
        match self {
            Delta::Insert(r) | Delta::Remove(r) => r,
        }
    }

    pub fn is_insert(self) -> bool {
        matches!(self, Delta::Insert(_))
    }
}

/// The set of rowIds currently visible at a stage's output.
pub type ActiveSet = HashSet<RowId>;
