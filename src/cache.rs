//! Effective-document cache (spec §3, §4.1).
//!
//! For document-transforming stages (`$project`, `$addFields`, `$unwind`,
//! `$group`), the cache stores `(stageIndex, rowId) -> document` so
//! downstream stages never need to recompute a transformed value they've
//! already seen. Non-transforming stages forward to the nearest upstream
//! transformer; the driver resolves that forwarding (see
//! [`crate::pipeline::Pipeline::get_effective_document`]), so this cache
//! only ever holds entries for transforming stages.

use std::collections::HashMap;

use crate::rowid::RowId;
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct CacheKey {
    stage_index: usize,
    row_id: RowId,
}

/// `(stageIndex, rowId) -> document` cache owned by the pipeline driver.
#[derive(Debug, Default)]
pub struct EffectiveDocumentCache {
    entries: HashMap<CacheKey, Value>,
}

impl EffectiveDocumentCache {
    pub fn new() -> Self {
        EffectiveDocumentCache {
            entries: HashMap::new(),
        }
    }

    pub fn get(&self, stage_index: usize, row_id: RowId) -> Option<&Value> {
        self.entries.get(&CacheKey { stage_index, row_id })
    }

    pub fn put(&mut self, stage_index: usize, row_id: RowId, doc: Value) {
        self.entries.insert(CacheKey { stage_index, row_id }, doc);
    }

    pub fn invalidate(&mut self, stage_index: usize, row_id: RowId) {
        self.entries.remove(&CacheKey { stage_index, row_id });
    }

    /// Number of cached entries for a given stage — used by cache-
    /// consistency assertions (spec §8) to check no stray `(i, *)` entries
    /// outlive a row's presence in `active[i]`.
    pub fn count_for_stage(&self, stage_index: usize) -> usize {
        self.entries.keys().filter(|k| k.stage_index == stage_index).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn put_get_invalidate_roundtrip() {
        let mut cache = EffectiveDocumentCache::new();
        let row = RowId::from_raw(1);
        cache.put(2, row, json!({"a": 1}));
        assert_eq!(cache.get(2, row), Some(&json!({"a": 1})));
        cache.invalidate(2, row);
        assert_eq!(cache.get(2, row), None);
    }

    #[test]
    fn stage_counts_are_isolated() {
        let mut cache = EffectiveDocumentCache::new();
        cache.put(0, RowId::from_raw(1), json!(1));
        cache.put(1, RowId::from_raw(1), json!(2));
        assert_eq!(cache.count_for_stage(0), 1);
        assert_eq!(cache.count_for_stage(1), 1);
    }
}
