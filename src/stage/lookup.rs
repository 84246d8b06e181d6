//! `$lookup(from, localField, foreignField, as)` (spec §4.2).
//!
//! Left join by equality against a named secondary collection. An index
//! `foreignValue -> [foreignRowId]` lets a local row's join value be
//! resolved without scanning the foreign side, and lets a foreign-side
//! change find exactly the local rows whose joined array it affects.

use std::collections::{HashMap, HashSet};

use crate::rowid::RowId;
use crate::value::{get_path, Document, Value};

#[derive(Debug, Clone)]
pub struct LookupSpec {
    pub local_field: String,
    pub foreign_field: String,
    pub as_field: String,
}

#[derive(Default)]
struct ForeignIndex {
    by_value: HashMap<String, HashSet<RowId>>,
    docs: HashMap<RowId, Value>,
}

fn value_key(v: &Value) -> String {
    serde_json::to_string(v).unwrap_or_default()
}

impl ForeignIndex {
    fn insert(&mut self, row_id: RowId, doc: Value, foreign_field: &str) {
        let key = get_path(&doc, foreign_field).cloned().unwrap_or(Value::Null);
        self.by_value.entry(value_key(&key)).or_default().insert(row_id);
        self.docs.insert(row_id, doc);
    }

    fn remove(&mut self, row_id: RowId, foreign_field: &str) {
        if let Some(doc) = self.docs.remove(&row_id) {
            let key = get_path(&doc, foreign_field).cloned().unwrap_or(Value::Null);
            if let Some(set) = self.by_value.get_mut(&value_key(&key)) {
                set.remove(&row_id);
            }
        }
    }

    fn matches(&self, value: &Value) -> Vec<Value> {
        let Some(rows) = self.by_value.get(&value_key(value)) else {
            return Vec::new();
        };
        let mut rows: Vec<RowId> = rows.iter().copied().collect();
        rows.sort();
        rows.into_iter().filter_map(|r| self.docs.get(&r).cloned()).collect()
    }
}

/// Per-`$lookup`-stage state: the foreign collection's index plus the
/// local rows currently joined against it.
pub struct LookupStageState {
    spec: LookupSpec,
    foreign: ForeignIndex,
    local_docs: HashMap<RowId, Value>,
}

impl LookupStageState {
    pub fn new(spec: LookupSpec) -> Self {
        LookupStageState {
            spec,
            foreign: ForeignIndex::default(),
            local_docs: HashMap::new(),
        }
    }

    /// Adds a document to the foreign collection and returns the local
    /// rowIds whose joined array it now affects, so the pipeline driver can
    /// re-emit them downstream (spec §4.2 "updates local rows when the
    /// foreign side changes").
    pub fn add_foreign_document(&mut self, row_id: RowId, doc: Value) -> Vec<RowId> {
        let join_value = get_path(&doc, &self.spec.foreign_field).cloned().unwrap_or(Value::Null);
        self.foreign.insert(row_id, doc, &self.spec.foreign_field);
        self.local_rows_matching(&join_value)
    }

    /// Removes a document from the foreign collection and returns the
    /// local rowIds whose joined array it affected.
    pub fn remove_foreign_document(&mut self, row_id: RowId) -> Vec<RowId> {
        let join_value = self
            .foreign
            .docs
            .get(&row_id)
            .map(|doc| get_path(doc, &self.spec.foreign_field).cloned().unwrap_or(Value::Null));
        self.foreign.remove(row_id, &self.spec.foreign_field);
        match join_value {
            Some(v) => self.local_rows_matching(&v),
            None => Vec::new(),
        }
    }

    fn joined(&self, doc: &Value) -> Value {
        let mut out = match doc {
            Value::Object(m) => m.clone(),
            _ => Document::new(),
        };
        let join_value = get_path(doc, &self.spec.local_field).cloned().unwrap_or(Value::Null);
        let matches = self.foreign.matches(&join_value);
        out.insert(self.spec.as_field.clone(), Value::Array(matches));
        Value::Object(out)
    }

    pub fn insert(&mut self, row_id: RowId, doc: &Value) -> Value {
        let out = self.joined(doc);
        self.local_docs.insert(row_id, doc.clone());
        out
    }

    pub fn remove(&mut self, row_id: RowId) {
        self.local_docs.remove(&row_id);
    }

    pub fn effective_document(&self, row_id: RowId) -> Option<Value> {
        self.local_docs.get(&row_id).map(|doc| self.joined(doc))
    }

    /// Local rowIds whose joined array is affected by a foreign-side
    /// change to `join_value` — used by the pipeline driver to re-emit
    /// those rows downstream after a foreign insert/remove.
    pub fn local_rows_matching(&self, join_value: &Value) -> Vec<RowId> {
        self.local_docs
            .iter()
            .filter(|(_, doc)| {
                get_path(doc, &self.spec.local_field).unwrap_or(&Value::Null) == join_value
            })
            .map(|(row_id, _)| *row_id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn spec() -> LookupSpec {
        LookupSpec {
            local_field: "customerId".to_string(),
            foreign_field: "_id".to_string(),
            as_field: "customer".to_string(),
        }
    }

    #[test]
    fn joins_matching_foreign_documents() {
        let mut state = LookupStageState::new(spec());
        state.add_foreign_document(RowId::from_raw(100), json!({"_id": 1, "name": "Acme"}));
        let out = state.insert(RowId::from_raw(1), &json!({"customerId": 1, "amount": 5}));
        assert_eq!(out["customer"], json!([{"_id": 1, "name": "Acme"}]));
    }

    #[test]
    fn no_match_yields_empty_array() {
        let mut state = LookupStageState::new(spec());
        let out = state.insert(RowId::from_raw(1), &json!({"customerId": 9}));
        assert_eq!(out["customer"], json!([]));
    }

    #[test]
    fn foreign_removal_updates_subsequent_join() {
        let mut state = LookupStageState::new(spec());
        state.add_foreign_document(RowId::from_raw(100), json!({"_id": 1, "name": "Acme"}));
        state.remove_foreign_document(RowId::from_raw(100));
        let out = state.insert(RowId::from_raw(1), &json!({"customerId": 1}));
        assert_eq!(out["customer"], json!([]));
    }

    #[test]
    fn local_rows_matching_finds_affected_rows() {
        let mut state = LookupStageState::new(spec());
        state.insert(RowId::from_raw(1), &json!({"customerId": 1}));
        state.insert(RowId::from_raw(2), &json!({"customerId": 2}));
        let rows = state.local_rows_matching(&json!(1));
        assert_eq!(rows, vec![RowId::from_raw(1)]);
    }

    #[test]
    fn add_foreign_document_reports_affected_local_rows() {
        let mut state = LookupStageState::new(spec());
        state.insert(RowId::from_raw(1), &json!({"customerId": 1}));
        state.insert(RowId::from_raw(2), &json!({"customerId": 2}));
        let affected = state.add_foreign_document(RowId::from_raw(100), json!({"_id": 1, "name": "Acme"}));
        assert_eq!(affected, vec![RowId::from_raw(1)]);
    }

    #[test]
    fn remove_foreign_document_reports_affected_local_rows() {
        let mut state = LookupStageState::new(spec());
        state.add_foreign_document(RowId::from_raw(100), json!({"_id": 1, "name": "Acme"}));
        state.insert(RowId::from_raw(1), &json!({"customerId": 1}));
        let affected = state.remove_foreign_document(RowId::from_raw(100));
        assert_eq!(affected, vec![RowId::from_raw(1)]);
    }
}
