//! Order-statistics structures shared by `$sort`, `$limit`, `$skip`, and
//! `$topK` (spec §4.2).
//!
//! [`OrderedIndex`] backs `$sort`: a `BTreeSet` keyed by sort tuple plus a
//! `rowId -> key` side table so an arbitrary row can be removed without a
//! linear scan.
//!
//! [`BoundedPartition`] backs `$limit`/`$skip`/`$topK`: rather than keep a
//! fully ordered structure over every row when only a size-`N` prefix (or
//! suffix, for `$skip`) is ever consumed, rows are partitioned into a
//! bounded "window" (max-heap, capacity `N`) and an unbounded "overflow"
//! (min-heap). Insert/remove touch at most the window boundary; removing a
//! tombstoned entry from a heap is deferred until it would otherwise
//! surface at the top (lazy deletion), avoiding the need for an
//! order-statistics tree to support arbitrary-position removal.

use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeSet, BinaryHeap, HashMap, HashSet};
use std::rc::Rc;

use crate::rowid::RowId;
use crate::value::{compare_values, Value};

/// Field -> direction (`1` ascending, `-1` descending) pairs, in
/// comparison precedence order.
#[derive(Debug, Clone)]
pub struct SortSpec(pub Rc<Vec<(String, i8)>>);

impl SortSpec {
    pub fn new(fields: Vec<(String, i8)>) -> Self {
        SortSpec(Rc::new(fields))
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|(name, _)| name.as_str())
    }
}

/// A row's sort key plus the stage's sort spec, compared with row-id as a
/// stable tie-break (spec §4.2 "$sort").
#[derive(Debug, Clone)]
pub struct SortedEntry {
    pub row_id: RowId,
    pub key: Rc<Vec<Value>>,
    pub spec: SortSpec,
}

impl PartialEq for SortedEntry {
    fn eq(&self, other: &Self) -> bool {
        self.row_id == other.row_id
    }
}
impl Eq for SortedEntry {}

impl PartialOrd for SortedEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SortedEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        for (i, (_, dir)) in self.spec.0.iter().enumerate() {
            let ord = compare_values(&self.key[i], &other.key[i]);
            let ord = if *dir < 0 { ord.reverse() } else { ord };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        self.row_id.cmp(&other.row_id)
    }
}

/// Full order statistic over every active row, used by `$sort`.
#[derive(Debug)]
pub struct OrderedIndex {
    spec: SortSpec,
    by_key: BTreeSet<SortedEntry>,
    by_row: HashMap<RowId, Rc<Vec<Value>>>,
}

impl OrderedIndex {
    pub fn new(spec: SortSpec) -> Self {
        OrderedIndex {
            spec,
            by_key: BTreeSet::new(),
            by_row: HashMap::new(),
        }
    }

    pub fn insert(&mut self, row_id: RowId, key: Vec<Value>) {
        let key = Rc::new(key);
        self.by_row.insert(row_id, key.clone());
        self.by_key.insert(SortedEntry {
            row_id,
            key,
            spec: self.spec.clone(),
        });
    }

    pub fn remove(&mut self, row_id: RowId) {
        if let Some(key) = self.by_row.remove(&row_id) {
            self.by_key.remove(&SortedEntry {
                row_id,
                key,
                spec: self.spec.clone(),
            });
        }
    }

    /// Rows in ascending order per the spec's directions.
    pub fn ordered_row_ids(&self) -> Vec<RowId> {
        self.by_key.iter().map(|e| e.row_id).collect()
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct InsertOutcome {
    pub placed_in_window: bool,
    pub evicted: Option<RowId>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RemoveOutcome {
    pub was_in_window: bool,
    pub promoted: Option<RowId>,
}

/// Bounded-window partition backing `$limit(N)`/`$topK(N)` (window =
/// visible) and `$skip(K)` (window = excluded, overflow = visible) per
/// spec §4.2.
#[derive(Debug)]
pub struct BoundedPartition {
    spec: SortSpec,
    capacity: usize,
    window_members: HashSet<RowId>,
    overflow_members: HashSet<RowId>,
    window_heap: BinaryHeap<SortedEntry>,
    overflow_heap: BinaryHeap<Reverse<SortedEntry>>,
    keys: HashMap<RowId, Rc<Vec<Value>>>,
}

impl BoundedPartition {
    pub fn new(spec: SortSpec, capacity: usize) -> Self {
        BoundedPartition {
            spec,
            capacity,
            window_members: HashSet::new(),
            overflow_members: HashSet::new(),
            window_heap: BinaryHeap::new(),
            overflow_heap: BinaryHeap::new(),
            keys: HashMap::new(),
        }
    }

    pub fn window_len(&self) -> usize {
        self.window_members.len()
    }

    pub fn window_members(&self) -> &HashSet<RowId> {
        &self.window_members
    }

    pub fn overflow_members(&self) -> &HashSet<RowId> {
        &self.overflow_members
    }

    fn entry_for(&self, row_id: RowId) -> SortedEntry {
        SortedEntry {
            row_id,
            key: self.keys[&row_id].clone(),
            spec: self.spec.clone(),
        }
    }

    /// Pops tombstoned entries off the window heap until the true current
    /// maximum surfaces (or the heap is empty).
    fn clean_window_top(&mut self) -> Option<SortedEntry> {
        loop {
            let top_row = self.window_heap.peek()?.row_id;
            if self.window_members.contains(&top_row) {
                return Some(self.entry_for(top_row));
            }
            self.window_heap.pop();
        }
    }

    fn clean_overflow_top(&mut self) -> Option<SortedEntry> {
        loop {
            let Reverse(top) = self.overflow_heap.peek()?;
            let top_row = top.row_id;
            if self.overflow_members.contains(&top_row) {
                return Some(self.entry_for(top_row));
            }
            self.overflow_heap.pop();
        }
    }

    pub fn insert(&mut self, row_id: RowId, key: Vec<Value>) -> InsertOutcome {
        self.keys.insert(row_id, Rc::new(key));
        let entry = self.entry_for(row_id);

        if self.window_members.len() < self.capacity {
            self.window_members.insert(row_id);
            self.window_heap.push(entry);
            return InsertOutcome {
                placed_in_window: true,
                evicted: None,
            };
        }

        match self.clean_window_top() {
            Some(max_entry) if entry.cmp(&max_entry) == Ordering::Less => {
                self.window_heap.pop();
                self.window_members.remove(&max_entry.row_id);
                self.overflow_members.insert(max_entry.row_id);
                self.overflow_heap.push(Reverse(max_entry.clone()));

                self.window_members.insert(row_id);
                self.window_heap.push(entry);

                InsertOutcome {
                    placed_in_window: true,
                    evicted: Some(max_entry.row_id),
                }
            }
            _ => {
                self.overflow_members.insert(row_id);
                self.overflow_heap.push(Reverse(entry));
                InsertOutcome {
                    placed_in_window: false,
                    evicted: None,
                }
            }
        }
    }

    pub fn remove(&mut self, row_id: RowId) -> RemoveOutcome {
        self.keys.remove(&row_id);

        if self.window_members.remove(&row_id) {
            let promoted = self.clean_overflow_top().map(|e| e.row_id);
            if let Some(p) = promoted {
                self.overflow_heap.pop();
                self.overflow_members.remove(&p);
                self.window_members.insert(p);
                self.window_heap.push(self.entry_for(p));
            }
            RemoveOutcome {
                was_in_window: true,
                promoted,
            }
        } else {
            self.overflow_members.remove(&row_id);
            RemoveOutcome {
                was_in_window: false,
                promoted: None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn spec() -> SortSpec {
        SortSpec::new(vec![("score".to_string(), -1)])
    }

    #[test]
    fn limit_window_evicts_largest_on_smaller_insert() {
        let mut bp = BoundedPartition::new(spec(), 2);
        let a = bp.insert(RowId::from_raw(1), vec![json!(10)]);
        assert!(a.placed_in_window);
        let b = bp.insert(RowId::from_raw(2), vec![json!(20)]);
        assert!(b.placed_in_window);
        // descending order: rank(30) < rank(10) since higher score sorts first
        let c = bp.insert(RowId::from_raw(3), vec![json!(30)]);
        assert!(c.placed_in_window);
        assert_eq!(c.evicted, Some(RowId::from_raw(1)));
        assert_eq!(bp.window_len(), 2);
    }

    #[test]
    fn remove_from_window_promotes_from_overflow() {
        let mut bp = BoundedPartition::new(spec(), 1);
        bp.insert(RowId::from_raw(1), vec![json!(50)]);
        bp.insert(RowId::from_raw(2), vec![json!(10)]); // goes to overflow (lower rank)
        let outcome = bp.remove(RowId::from_raw(1));
        assert!(outcome.was_in_window);
        assert_eq!(outcome.promoted, Some(RowId::from_raw(2)));
    }

    #[test]
    fn ordered_index_tracks_ascending_order() {
        let mut idx = OrderedIndex::new(SortSpec::new(vec![("n".to_string(), 1)]));
        idx.insert(RowId::from_raw(1), vec![json!(3)]);
        idx.insert(RowId::from_raw(2), vec![json!(1)]);
        idx.insert(RowId::from_raw(3), vec![json!(2)]);
        assert_eq!(
            idx.ordered_row_ids(),
            vec![RowId::from_raw(2), RowId::from_raw(3), RowId::from_raw(1)]
        );
    }
}
