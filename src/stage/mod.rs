//! Stage specs, compilation, and the runtime operator protocol (spec §4.1,
//! §4.2).
//!
//! A [`StageSpec`] is the parsed, immutable description of one pipeline
//! stage. A [`Stage`] is its compiled runtime counterpart: mutable
//! incremental state plus the `hydrate`/`apply_delta`/`active_ids`/
//! `effective_document` operations the pipeline driver calls. Dispatch is a
//! tagged enum rather than a trait object, matching every other per-kind
//! state manager in this crate (`GroupStageState`, `UnwindStageState`, ...) —
//! ten known, fixed kinds never need virtual dispatch.

pub mod group;
pub mod lookup;
pub mod project;
pub mod unwind;

use indexmap::IndexSet;

use crate::delta::Delta;
use crate::error::{EngineResult, SpecError};
use crate::expr::{compile, compile_predicate, parse_expr, parse_predicate, CompiledPredicate};
use crate::order_window::{BoundedPartition, OrderedIndex, SortSpec};
use crate::rowid::{RowId, RowIdAllocator};
use crate::value::{get_path, Value};

use group::{parse_accumulators, AccumulatorSpec, GroupMutation, GroupStageState};
use lookup::{LookupSpec, LookupStageState};
use project::{CompiledProject, ProjectSpec};
use unwind::{UnwindSpec, UnwindStageState};

/// Parsed, immutable pipeline stage. Never mutated after
/// [`parse_pipeline`]; the optimizer clones before rewriting (spec §4.4).
#[derive(Clone)]
pub enum StageSpec {
    Match(crate::expr::Predicate),
    Project(std::rc::Rc<ProjectSpec>),
    AddFields(std::rc::Rc<ProjectSpec>),
    Group {
        key: crate::expr::Expr,
        accumulators: std::rc::Rc<Vec<AccumulatorSpec>>,
    },
    Sort(SortSpec),
    Limit {
        n: usize,
        sort: SortSpec,
    },
    Skip {
        k: usize,
        sort: SortSpec,
    },
    TopK {
        n: usize,
        sort: SortSpec,
    },
    Unwind(UnwindSpec),
    Lookup(LookupSpec),
}

impl std::fmt::Debug for StageSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StageSpec::Match(_) => "$match",
            StageSpec::Project(_) => "$project",
            StageSpec::AddFields(_) => "$addFields",
            StageSpec::Group { .. } => "$group",
            StageSpec::Sort(_) => "$sort",
            StageSpec::Limit { .. } => "$limit",
            StageSpec::Skip { .. } => "$skip",
            StageSpec::TopK { .. } => "$topK",
            StageSpec::Unwind(_) => "$unwind",
            StageSpec::Lookup(_) => "$lookup",
        };
        f.write_str(name)
    }
}

fn parse_sort_spec(v: &Value) -> Result<SortSpec, SpecError> {
    let Value::Object(map) = v else {
        return Err(SpecError::InvalidSortSpec);
    };
    if map.is_empty() {
        return Err(SpecError::InvalidSortSpec);
    }
    let mut fields = Vec::with_capacity(map.len());
    for (name, dir) in map.iter() {
        let dir = match dir.as_i64() {
            Some(1) => 1,
            Some(-1) => -1,
            _ => return Err(SpecError::InvalidSortSpec),
        };
        fields.push((name.clone(), dir));
    }
    Ok(SortSpec::new(fields))
}

fn parse_unwind(v: &Value) -> Result<UnwindSpec, SpecError> {
    match v {
        Value::String(path) => Ok(UnwindSpec {
            path: path.trim_start_matches('$').to_string(),
            preserve_null_and_empty_arrays: false,
        }),
        Value::Object(map) => {
            let path = map
                .get("path")
                .and_then(Value::as_str)
                .ok_or(SpecError::MissingLookupField("path"))?
                .trim_start_matches('$')
                .to_string();
            let preserve = map
                .get("preserveNullAndEmptyArrays")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            Ok(UnwindSpec {
                path,
                preserve_null_and_empty_arrays: preserve,
            })
        }
        _ => Err(SpecError::InvalidSortSpec),
    }
}

fn parse_lookup(v: &Value) -> Result<LookupSpec, SpecError> {
    let Value::Object(map) = v else {
        return Err(SpecError::MissingLookupField("from"));
    };
    let field = |name: &'static str| -> Result<String, SpecError> {
        map.get(name)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or(SpecError::MissingLookupField(name))
    };
    Ok(LookupSpec {
        local_field: field("localField")?,
        foreign_field: field("foreignField")?,
        as_field: field("as")?,
    })
}

fn parse_topk(v: &Value) -> Result<(usize, SortSpec), SpecError> {
    let Value::Object(map) = v else {
        return Err(SpecError::InvalidSortSpec);
    };
    let n = map.get("n").and_then(Value::as_u64).ok_or(SpecError::MissingLookupField("n"))? as usize;
    let sort_by = map.get("sortBy").ok_or(SpecError::MissingLookupField("sortBy"))?;
    Ok((n, parse_sort_spec(sort_by)?))
}

/// Parses an ordered pipeline spec (spec §6 "Pipeline specification") into
/// [`StageSpec`]s. Fails synchronously, before any document is touched
/// (spec §7).
pub fn parse_pipeline(stages: &[Value]) -> Result<Vec<StageSpec>, SpecError> {
    if stages.is_empty() {
        return Err(SpecError::EmptyPipeline);
    }
    stages.iter().map(parse_stage).collect()
}

fn parse_stage(v: &Value) -> Result<StageSpec, SpecError> {
    let Value::Object(map) = v else {
        return Err(SpecError::UnknownOperator(v.to_string()));
    };
    if map.len() != 1 {
        return Err(SpecError::UnknownOperator(v.to_string()));
    }
    let (op, arg) = map.iter().next().expect("len==1");
    match op.as_str() {
        "$match" => Ok(StageSpec::Match(parse_predicate(arg)?)),
        "$project" => Ok(StageSpec::Project(std::rc::Rc::new(ProjectSpec::parse_project(arg)?))),
        "$addFields" => Ok(StageSpec::AddFields(std::rc::Rc::new(ProjectSpec::parse_add_fields(arg)?))),
        "$group" => {
            let Value::Object(group_map) = arg else {
                return Err(SpecError::InvalidSortSpec);
            };
            let id_spec = group_map.get("_id").ok_or(SpecError::MissingLookupField("_id"))?;
            let key = parse_expr(id_spec)?;
            let accumulators = parse_accumulators(arg)?;
            Ok(StageSpec::Group {
                key,
                accumulators: std::rc::Rc::new(accumulators),
            })
        }
        "$sort" => Ok(StageSpec::Sort(parse_sort_spec(arg)?)),
        "$limit" => {
            let n = arg.as_u64().ok_or(SpecError::InvalidSortSpec)? as usize;
            Ok(StageSpec::Limit { n, sort: SortSpec::new(Vec::new()) })
        }
        "$skip" => {
            let k = arg.as_u64().ok_or(SpecError::InvalidSortSpec)? as usize;
            Ok(StageSpec::Skip { k, sort: SortSpec::new(Vec::new()) })
        }
        "$topK" => {
            let (n, sort) = parse_topk(arg)?;
            Ok(StageSpec::TopK { n, sort })
        }
        "$unwind" => Ok(StageSpec::Unwind(parse_unwind(arg)?)),
        "$lookup" => Ok(StageSpec::Lookup(parse_lookup(arg)?)),
        other => Err(SpecError::UnknownOperator(other.to_string())),
    }
}

fn sort_key(doc: &Value, spec: &SortSpec) -> Vec<Value> {
    spec.field_names()
        .map(|name| get_path(doc, name).cloned().unwrap_or(Value::Null))
        .collect()
}

/// Compiled runtime state for one stage. Built once per pipeline
/// construction from a [`StageSpec`] via [`Stage::compile`].
pub enum Stage {
    Match {
        predicate: CompiledPredicate,
        active: IndexSet<RowId>,
    },
    Project {
        compiled: CompiledProject,
        cache: std::collections::HashMap<RowId, Value>,
        active: IndexSet<RowId>,
    },
    Group(GroupStageState),
    Sort {
        index: OrderedIndex,
        spec: SortSpec,
    },
    Limit {
        partition: BoundedPartition,
        spec: SortSpec,
    },
    Skip {
        partition: BoundedPartition,
        spec: SortSpec,
    },
    TopK {
        partition: BoundedPartition,
        spec: SortSpec,
    },
    Unwind {
        state: UnwindStageState,
        active: IndexSet<RowId>,
    },
    Lookup {
        state: LookupStageState,
        active: IndexSet<RowId>,
    },
}

impl Stage {
    pub fn compile(spec: &StageSpec) -> Stage {
        match spec {
            StageSpec::Match(pred) => Stage::Match {
                predicate: compile_predicate(pred),
                active: IndexSet::new(),
            },
            StageSpec::Project(p) => Stage::Project {
                compiled: CompiledProject::compile(p),
                cache: std::collections::HashMap::new(),
                active: IndexSet::new(),
            },
            StageSpec::AddFields(p) => Stage::Project {
                compiled: CompiledProject::compile(p),
                cache: std::collections::HashMap::new(),
                active: IndexSet::new(),
            },
            StageSpec::Group { key, accumulators } => {
                Stage::Group(GroupStageState::new(compile(key), accumulators.as_ref().clone()))
            }
            StageSpec::Sort(spec) => Stage::Sort {
                index: OrderedIndex::new(spec.clone()),
                spec: spec.clone(),
            },
            StageSpec::Limit { n, sort } => Stage::Limit {
                partition: BoundedPartition::new(sort.clone(), *n),
                spec: sort.clone(),
            },
            StageSpec::Skip { k, sort } => Stage::Skip {
                partition: BoundedPartition::new(sort.clone(), *k),
                spec: sort.clone(),
            },
            StageSpec::TopK { n, sort } => Stage::TopK {
                partition: BoundedPartition::new(sort.clone(), *n),
                spec: sort.clone(),
            },
            StageSpec::Unwind(spec) => Stage::Unwind {
                state: UnwindStageState::new(spec),
                active: IndexSet::new(),
            },
            StageSpec::Lookup(spec) => Stage::Lookup {
                state: LookupStageState::new(spec.clone()),
                active: IndexSet::new(),
            },
        }
    }

    /// Whether this stage exposes [`Stage::effective_document`], i.e.
    /// transforms the document rather than merely filtering/reordering
    /// rowIds (spec §4.1).
    pub fn is_transforming(&self) -> bool {
        matches!(self, Stage::Project { .. } | Stage::Group(_) | Stage::Unwind { .. } | Stage::Lookup { .. })
    }

    fn on_insert(
        &mut self,
        stage_index: usize,
        row_id: RowId,
        doc: &Value,
        alloc: &RowIdAllocator,
    ) -> EngineResult<Vec<Delta>> {
        let _ = stage_index;
        match self {
            Stage::Match { predicate, active } => {
                if predicate(doc).map_err(crate::error::EngineError::from)? {
                    active.insert(row_id);
                    Ok(vec![Delta::Insert(row_id)])
                } else {
                    Ok(vec![])
                }
            }
            Stage::Project { compiled, cache, active } => {
                let out = compiled.apply(doc).map_err(crate::error::EngineError::from)?;
                cache.insert(row_id, out);
                active.insert(row_id);
                Ok(vec![Delta::Insert(row_id)])
            }
            Stage::Group(state) => {
                let outcome = state.insert(row_id, doc).map_err(crate::error::EngineError::from)?;
                Ok(match outcome {
                    GroupMutation::Created(g) => vec![Delta::Insert(g)],
                    GroupMutation::Updated(g) => vec![Delta::Remove(g), Delta::Insert(g)],
                    GroupMutation::Emptied(_) | GroupMutation::NoChange => vec![],
                })
            }
            Stage::Sort { index, spec } => {
                index.insert(row_id, sort_key(doc, spec));
                Ok(vec![Delta::Insert(row_id)])
            }
            Stage::Limit { partition, spec } | Stage::TopK { partition, spec } => {
                let outcome = partition.insert(row_id, sort_key(doc, spec));
                let mut out = Vec::new();
                if outcome.placed_in_window {
                    out.push(Delta::Insert(row_id));
                    if let Some(evicted) = outcome.evicted {
                        out.push(Delta::Remove(evicted));
                    }
                }
                Ok(out)
            }
            Stage::Skip { partition, spec } => {
                let outcome = partition.insert(row_id, sort_key(doc, spec));
                let mut out = Vec::new();
                if outcome.placed_in_window {
                    if let Some(evicted) = outcome.evicted {
                        out.push(Delta::Insert(evicted));
                    }
                } else {
                    out.push(Delta::Insert(row_id));
                }
                Ok(out)
            }
            Stage::Unwind { state, active } => {
                let children = state.insert(row_id, doc, alloc);
                for child in &children {
                    active.insert(*child);
                }
                Ok(children.into_iter().map(Delta::Insert).collect())
            }
            Stage::Lookup { state, active } => {
                state.insert(row_id, doc);
                active.insert(row_id);
                Ok(vec![Delta::Insert(row_id)])
            }
        }
    }

    fn on_remove(&mut self, stage_index: usize, row_id: RowId) -> EngineResult<Vec<Delta>> {
        let _ = stage_index;
        match self {
            Stage::Match { active, .. } => {
                if active.shift_remove(&row_id) {
                    Ok(vec![Delta::Remove(row_id)])
                } else {
                    Ok(vec![])
                }
            }
            Stage::Project { cache, active, .. } => {
                if active.shift_remove(&row_id) {
                    cache.remove(&row_id);
                    Ok(vec![Delta::Remove(row_id)])
                } else {
                    Ok(vec![])
                }
            }
            Stage::Group(state) => {
                let outcome = state.remove(row_id).map_err(crate::error::EngineError::from)?;
                Ok(match outcome {
                    GroupMutation::Emptied(g) => vec![Delta::Remove(g)],
                    GroupMutation::Updated(g) => vec![Delta::Remove(g), Delta::Insert(g)],
                    GroupMutation::Created(_) | GroupMutation::NoChange => vec![],
                })
            }
            Stage::Sort { index, .. } => {
                index.remove(row_id);
                Ok(vec![Delta::Remove(row_id)])
            }
            Stage::Limit { partition, .. } | Stage::TopK { partition, .. } => {
                let outcome = partition.remove(row_id);
                let mut out = Vec::new();
                if outcome.was_in_window {
                    out.push(Delta::Remove(row_id));
                    if let Some(promoted) = outcome.promoted {
                        out.push(Delta::Insert(promoted));
                    }
                }
                Ok(out)
            }
            Stage::Skip { partition, .. } => {
                let outcome = partition.remove(row_id);
                let mut out = Vec::new();
                if outcome.was_in_window {
                    if let Some(promoted) = outcome.promoted {
                        out.push(Delta::Remove(promoted));
                    }
                } else {
                    out.push(Delta::Remove(row_id));
                }
                Ok(out)
            }
            Stage::Unwind { state, active } => {
                let children = state.remove(row_id);
                for child in &children {
                    active.shift_remove(child);
                }
                Ok(children.into_iter().map(Delta::Remove).collect())
            }
            Stage::Lookup { state, active } => {
                state.remove(row_id);
                if active.shift_remove(&row_id) {
                    Ok(vec![Delta::Remove(row_id)])
                } else {
                    Ok(vec![])
                }
            }
        }
    }

    /// Bulk-installs initial state over the upstream's current active set
    /// (spec §4.1 "hydrate"), returning this stage's own initial active
    /// set in output order.
    pub fn hydrate(
        &mut self,
        stage_index: usize,
        upstream_active: &[RowId],
        get_upstream_doc: impl Fn(RowId) -> EngineResult<Value>,
        alloc: &RowIdAllocator,
    ) -> EngineResult<Vec<RowId>> {
        for row_id in upstream_active {
            let doc = get_upstream_doc(*row_id)?;
            self.on_insert(stage_index, *row_id, &doc, alloc)?;
        }
        Ok(self.active_ids())
    }

    /// Reacts to one upstream delta, returning the deltas it emits to the
    /// next stage (spec §4.1 "applyDelta").
    pub fn apply_delta(
        &mut self,
        stage_index: usize,
        delta: Delta,
        get_upstream_doc: impl Fn(RowId) -> EngineResult<Value>,
        alloc: &RowIdAllocator,
    ) -> EngineResult<Vec<Delta>> {
        match delta {
            Delta::Insert(row_id) => {
                let doc = get_upstream_doc(row_id)?;
                self.on_insert(stage_index, row_id, &doc, alloc)
            }
            Delta::Remove(row_id) => self.on_remove(stage_index, row_id),
        }
    }

    /// Ordered output rowIds as of now (spec §4.1 "snapshot").
    pub fn active_ids(&self) -> Vec<RowId> {
        match self {
            Stage::Match { active, .. } => active.iter().copied().collect(),
            Stage::Project { active, .. } => active.iter().copied().collect(),
            Stage::Group(state) => state.active_group_row_ids(),
            Stage::Sort { index, .. } => index.ordered_row_ids(),
            Stage::Limit { partition, .. } | Stage::TopK { partition, .. } => {
                ordered_window(partition)
            }
            Stage::Skip { partition, .. } => ordered_overflow(partition),
            Stage::Unwind { active, .. } => active.iter().copied().collect(),
            Stage::Lookup { active, .. } => active.iter().copied().collect(),
        }
    }

    pub fn effective_document(&self, row_id: RowId) -> Option<Value> {
        match self {
            Stage::Project { cache, .. } => cache.get(&row_id).cloned(),
            Stage::Group(state) => state.effective_document(row_id),
            Stage::Unwind { state, .. } => state.effective_document(row_id).cloned(),
            Stage::Lookup { state, .. } => state.effective_document(row_id),
            _ => None,
        }
    }
}

/// Window members of a bounded partition in ascending sort-spec order
/// (i.e. the visible prefix for `$limit`/`$topK`).
fn ordered_window(partition: &BoundedPartition) -> Vec<RowId> {
    let mut members: Vec<RowId> = partition.window_members().iter().copied().collect();
    members.sort();
    members
}

fn ordered_overflow(partition: &BoundedPartition) -> Vec<RowId> {
    let mut members: Vec<RowId> = partition.overflow_members().iter().copied().collect();
    members.sort();
    members
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_pipeline_rejects_empty() {
        let err = parse_pipeline(&[]).unwrap_err();
        assert!(matches!(err, SpecError::EmptyPipeline));
    }

    #[test]
    fn parse_pipeline_rejects_unknown_operator() {
        let err = parse_pipeline(&[json!({"$bogus": {}})]).unwrap_err();
        assert!(matches!(err, SpecError::UnknownOperator(_)));
    }

    #[test]
    fn match_stage_filters_by_predicate() {
        let spec = parse_stage(&json!({"$match": {"active": true}})).unwrap();
        let mut stage = Stage::compile(&spec);
        let alloc = RowIdAllocator::new();
        let a = RowId::from_raw(1);
        let b = RowId::from_raw(2);
        let docs = std::collections::HashMap::from([
            (a, json!({"active": true})),
            (b, json!({"active": false})),
        ]);
        let active = stage
            .hydrate(0, &[a, b], |r| Ok(docs[&r].clone()), &alloc)
            .unwrap();
        assert_eq!(active, vec![a]);
    }

    #[test]
    fn limit_stage_emits_insert_and_evict() {
        let spec = StageSpec::Limit { n: 1, sort: SortSpec::new(vec![("score".to_string(), -1)]) };
        let mut stage = Stage::compile(&spec);
        let alloc = RowIdAllocator::new();
        let low = RowId::from_raw(1);
        let high = RowId::from_raw(2);
        let out1 = stage
            .apply_delta(0, Delta::Insert(low), |_| Ok(json!({"score": 10})), &alloc)
            .unwrap();
        assert_eq!(out1, vec![Delta::Insert(low)]);
        let out2 = stage
            .apply_delta(0, Delta::Insert(high), |_| Ok(json!({"score": 20})), &alloc)
            .unwrap();
        assert_eq!(out2, vec![Delta::Insert(high), Delta::Remove(low)]);
    }

    #[test]
    fn unwind_stage_emits_one_insert_per_element() {
        let spec = parse_stage(&json!({"$unwind": "$tags"})).unwrap();
        let mut stage = Stage::compile(&spec);
        let alloc = RowIdAllocator::new();
        let parent = RowId::from_raw(1);
        let out = stage
            .apply_delta(0, Delta::Insert(parent), |_| Ok(json!({"tags": ["a", "b"]})), &alloc)
            .unwrap();
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|d| d.is_insert()));
    }
}
