//! `$unwind(path)` (spec §4.2).
//!
//! State: `parentRowId -> [childRowId]`. Each array element at `path`
//! becomes one synthesized child row with the element substituted in
//! place; `preserveNullAndEmptyArrays` passes the parent through unchanged
//! (as a single child) when the target is null, missing, or `[]`.

use std::collections::HashMap;

use crate::rowid::{RowId, RowIdAllocator};
use crate::value::{get_path, set_path, Document, Value};

#[derive(Clone)]
pub struct UnwindSpec {
    pub path: String,
    pub preserve_null_and_empty_arrays: bool,
}

pub struct UnwindStageState {
    path: String,
    preserve_null_and_empty_arrays: bool,
    children_of: HashMap<RowId, Vec<RowId>>,
    documents: HashMap<RowId, Value>,
}

impl UnwindStageState {
    pub fn new(spec: &UnwindSpec) -> Self {
        UnwindStageState {
            path: spec.path.clone(),
            preserve_null_and_empty_arrays: spec.preserve_null_and_empty_arrays,
            children_of: HashMap::new(),
            documents: HashMap::new(),
        }
    }

    fn expand(&self, doc: &Value) -> Vec<Value> {
        match get_path(doc, &self.path) {
            Some(Value::Array(items)) if !items.is_empty() => items
                .iter()
                .map(|item| {
                    let mut out = match doc {
                        Value::Object(m) => m.clone(),
                        _ => Document::new(),
                    };
                    set_path(&mut out, &self.path, item.clone());
                    Value::Object(out)
                })
                .collect(),
            Some(Value::Array(_)) | None | Some(Value::Null) if self.preserve_null_and_empty_arrays => {
                vec![doc.clone()]
            }
            Some(Value::Array(_)) | None | Some(Value::Null) => vec![],
            Some(_) => vec![doc.clone()],
        }
    }

    /// Expands one parent row into its children, allocating fresh rowIds
    /// for each. Returns the newly active child rowIds in order.
    pub fn insert(&mut self, parent: RowId, doc: &Value, allocator: &RowIdAllocator) -> Vec<RowId> {
        let children_docs = self.expand(doc);
        let mut children = Vec::with_capacity(children_docs.len());
        for child_doc in children_docs {
            let child_id = allocator.alloc();
            self.documents.insert(child_id, child_doc);
            children.push(child_id);
        }
        self.children_of.insert(parent, children.clone());
        children
    }

    /// Drops a parent row and returns the child rowIds that are no longer
    /// active.
    pub fn remove(&mut self, parent: RowId) -> Vec<RowId> {
        let children = self.children_of.remove(&parent).unwrap_or_default();
        for child in &children {
            self.documents.remove(child);
        }
        children
    }

    pub fn effective_document(&self, child: RowId) -> Option<&Value> {
        self.documents.get(&child)
    }
}
