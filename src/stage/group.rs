//! `$group` accumulators (spec §4.2).
//!
//! Every accumulator is incrementally updateable in both directions:
//! `apply_insert` folds a contributing row in, `apply_remove` folds it back
//! out using the *same* document that was used to insert it (the group
//! stage retains each member's document for exactly this purpose), so
//! removal never needs to re-derive a value from state that may have
//! already changed.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::error::{EvalError, SpecError};
use crate::expr::{compile, parse_expr, CompiledExpr, Expr};
use crate::rowid::RowId;
use crate::value::{Document, Value};

#[derive(Clone)]
struct OrdKey(Value);

impl PartialEq for OrdKey {
    fn eq(&self, other: &Self) -> bool {
        crate::value::compare_values(&self.0, &other.0) == Ordering::Equal
    }
}
impl Eq for OrdKey {}
impl PartialOrd for OrdKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for OrdKey {
    fn cmp(&self, other: &Self) -> Ordering {
        crate::value::compare_values(&self.0, &other.0)
    }
}

/// Arrival-ordered, per-row-removable contribution log backing
/// `$first`/`$last`/`$push`.
#[derive(Default)]
struct OrderedContributions {
    next_seq: u64,
    by_seq: BTreeMap<u64, Value>,
    row_seq: std::collections::HashMap<RowId, u64>,
}

impl OrderedContributions {
    fn push(&mut self, row_id: RowId, value: Value) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.by_seq.insert(seq, value);
        self.row_seq.insert(row_id, seq);
    }

    fn remove(&mut self, row_id: RowId) {
        if let Some(seq) = self.row_seq.remove(&row_id) {
            self.by_seq.remove(&seq);
        }
    }

    fn first(&self) -> Value {
        self.by_seq.values().next().cloned().unwrap_or(Value::Null)
    }

    fn last(&self) -> Value {
        self.by_seq.values().next_back().cloned().unwrap_or(Value::Null)
    }

    fn values_in_order(&self) -> Vec<Value> {
        self.by_seq.values().cloned().collect()
    }
}

#[derive(Clone, Copy)]
enum Num {
    Int(i64),
    Float(f64),
}

fn to_num(v: &Value, op: &'static str) -> Result<Num, EvalError> {
    match v {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(Num::Int(i))
            } else {
                Ok(Num::Float(n.as_f64().unwrap_or(f64::NAN)))
            }
        }
        other => Err(EvalError::TypeMismatch { op, detail: format!("expected number, got {other}") }),
    }
}

enum AccumulatorState {
    Sum { total_int: i64, total_float: f64, is_float: bool },
    Avg { sum_int: i64, sum_float: f64, is_float: bool, count: u64 },
    Min { multiset: BTreeMap<OrdKey, usize> },
    Max { multiset: BTreeMap<OrdKey, usize> },
    First(OrderedContributions),
    Last(OrderedContributions),
    Push(OrderedContributions),
    AddToSet { counts: BTreeMap<OrdKey, (usize, u64)>, next_seq: u64 },
    Count(u64),
}

/// A single named accumulator inside a `$group` stage: a compiled
/// expression plus the incremental state needed to support both
/// directions of `apply`.
pub struct Accumulator {
    expr: Option<CompiledExpr>,
    state: AccumulatorState,
}

impl Accumulator {
    fn numeric_delta(&mut self, op: &'static str, doc: &Value, sign: i64) -> Result<(), EvalError> {
        let expr = self.expr.as_ref().expect("numeric accumulators carry an expr");
        let value = expr(doc)?.or_null();
        let n = to_num(&value, op)?;
        match &mut self.state {
            AccumulatorState::Sum { total_int, total_float, is_float } => match n {
                Num::Int(i) if !*is_float => *total_int += sign * i,
                Num::Int(i) => *total_float += sign as f64 * i as f64,
                Num::Float(f) => {
                    if !*is_float {
                        *total_float = *total_int as f64;
                        *is_float = true;
                    }
                    *total_float += sign as f64 * f;
                }
            },
            AccumulatorState::Avg { sum_int, sum_float, is_float, count } => {
                match n {
                    Num::Int(i) if !*is_float => *sum_int += sign * i,
                    Num::Int(i) => *sum_float += sign as f64 * i as f64,
                    Num::Float(f) => {
                        if !*is_float {
                            *sum_float = *sum_int as f64;
                            *is_float = true;
                        }
                        *sum_float += sign as f64 * f;
                    }
                }
                *count = (*count as i64 + sign).max(0) as u64;
            }
            _ => unreachable!("numeric_delta only called for Sum/Avg"),
        }
        Ok(())
    }

    pub fn apply_insert(&mut self, row_id: RowId, doc: &Value) -> Result<(), EvalError> {
        match &self.state {
            AccumulatorState::Sum { .. } => self.numeric_delta("$sum", doc, 1),
            AccumulatorState::Avg { .. } => self.numeric_delta("$avg", doc, 1),
            AccumulatorState::Min { .. } | AccumulatorState::Max { .. } => {
                let value = self.expr.as_ref().unwrap()(doc)?.or_null();
                let key = OrdKey(value);
                let multiset = match &mut self.state {
                    AccumulatorState::Min { multiset } | AccumulatorState::Max { multiset } => multiset,
                    _ => unreachable!(),
                };
                *multiset.entry(key).or_insert(0) += 1;
                Ok(())
            }
            AccumulatorState::First(_) | AccumulatorState::Last(_) | AccumulatorState::Push(_) => {
                let value = self.expr.as_ref().unwrap()(doc)?.or_null();
                match &mut self.state {
                    AccumulatorState::First(c) | AccumulatorState::Last(c) | AccumulatorState::Push(c) => {
                        c.push(row_id, value)
                    }
                    _ => unreachable!(),
                }
                Ok(())
            }
            AccumulatorState::AddToSet { .. } => {
                let value = self.expr.as_ref().unwrap()(doc)?.or_null();
                let key = OrdKey(value);
                if let AccumulatorState::AddToSet { counts, next_seq } = &mut self.state {
                    let seq = *next_seq;
                    let entry = counts.entry(key).or_insert((0, seq));
                    if entry.0 == 0 {
                        entry.1 = seq;
                        *next_seq += 1;
                    }
                    entry.0 += 1;
                }
                Ok(())
            }
            AccumulatorState::Count(_) => {
                if let AccumulatorState::Count(n) = &mut self.state {
                    *n += 1;
                }
                Ok(())
            }
        }
    }

    pub fn apply_remove(&mut self, row_id: RowId, doc: &Value) -> Result<(), EvalError> {
        match &self.state {
            AccumulatorState::Sum { .. } => self.numeric_delta("$sum", doc, -1),
            AccumulatorState::Avg { .. } => self.numeric_delta("$avg", doc, -1),
            AccumulatorState::Min { .. } | AccumulatorState::Max { .. } => {
                let value = self.expr.as_ref().unwrap()(doc)?.or_null();
                let key = OrdKey(value);
                let multiset = match &mut self.state {
                    AccumulatorState::Min { multiset } | AccumulatorState::Max { multiset } => multiset,
                    _ => unreachable!(),
                };
                match multiset.get_mut(&key) {
                    Some(count) if *count > 1 => *count -= 1,
                    Some(_) => {
                        multiset.remove(&key);
                    }
                    None => return Err(EvalError::NonDecrementableExtremum { row_id }),
                }
                Ok(())
            }
            AccumulatorState::First(_) | AccumulatorState::Last(_) | AccumulatorState::Push(_) => {
                match &mut self.state {
                    AccumulatorState::First(c) | AccumulatorState::Last(c) | AccumulatorState::Push(c) => {
                        c.remove(row_id)
                    }
                    _ => unreachable!(),
                }
                Ok(())
            }
            AccumulatorState::AddToSet { .. } => {
                let value = self.expr.as_ref().unwrap()(doc)?.or_null();
                let key = OrdKey(value);
                if let AccumulatorState::AddToSet { counts, .. } = &mut self.state {
                    match counts.get_mut(&key) {
                        Some((count, _)) if *count > 1 => *count -= 1,
                        Some(_) => {
                            counts.remove(&key);
                        }
                        None => return Err(EvalError::NonDecrementableExtremum { row_id }),
                    }
                }
                Ok(())
            }
            AccumulatorState::Count(_) => {
                if let AccumulatorState::Count(n) = &mut self.state {
                    *n = n.saturating_sub(1);
                }
                Ok(())
            }
        }
    }

    pub fn current_value(&self) -> Value {
        match &self.state {
            AccumulatorState::Sum { total_int, total_float, is_float } => {
                if *is_float {
                    serde_json::Number::from_f64(*total_float).map(Value::Number).unwrap_or(Value::Null)
                } else {
                    Value::Number((*total_int).into())
                }
            }
            AccumulatorState::Avg { sum_int, sum_float, is_float, count } => {
                if *count == 0 {
                    return Value::Null;
                }
                let sum = if *is_float { *sum_float } else { *sum_int as f64 };
                serde_json::Number::from_f64(sum / *count as f64).map(Value::Number).unwrap_or(Value::Null)
            }
            AccumulatorState::Min { multiset } => {
                multiset.keys().next().map(|k| k.0.clone()).unwrap_or(Value::Null)
            }
            AccumulatorState::Max { multiset } => {
                multiset.keys().next_back().map(|k| k.0.clone()).unwrap_or(Value::Null)
            }
            AccumulatorState::First(c) => c.first(),
            AccumulatorState::Last(c) => c.last(),
            AccumulatorState::Push(c) => Value::Array(c.values_in_order()),
            AccumulatorState::AddToSet { counts, .. } => {
                let mut entries: Vec<_> = counts.iter().collect();
                entries.sort_by_key(|(_, (_, seq))| *seq);
                Value::Array(entries.into_iter().map(|(k, _)| k.0.clone()).collect())
            }
            AccumulatorState::Count(n) => Value::Number((*n).into()),
        }
    }

}

/// Parsed `$group` accumulator spec: `{field: {$sum: expr}}` and friends.
#[derive(Clone)]
pub struct AccumulatorSpec {
    pub field: String,
    pub kind: &'static str,
    pub expr: Option<Expr>,
}

pub fn parse_accumulators(v: &Value) -> Result<Vec<AccumulatorSpec>, SpecError> {
    let map = match v {
        Value::Object(m) => m,
        _ => return Err(SpecError::InvalidSortSpec),
    };
    let mut out = Vec::with_capacity(map.len());
    for (field, spec) in map.iter() {
        if field == "_id" {
            continue;
        }
        let (op, arg) = match spec {
            Value::Object(m) if m.len() == 1 => m.iter().next().expect("len==1"),
            _ => {
                return Err(SpecError::InvalidAccumulator {
                    name: field.clone(),
                    reason: "accumulator spec must be a single-key object".to_string(),
                })
            }
        };
        let kind: &'static str = match op.as_str() {
            "$sum" => "$sum",
            "$avg" => "$avg",
            "$min" => "$min",
            "$max" => "$max",
            "$first" => "$first",
            "$last" => "$last",
            "$push" => "$push",
            "$addToSet" => "$addToSet",
            "$count" => "$count",
            other => {
                return Err(SpecError::InvalidAccumulator {
                    name: field.clone(),
                    reason: format!("unknown accumulator '{other}'"),
                })
            }
        };
        let expr = if kind == "$count" { None } else { Some(parse_expr(arg)?) };
        out.push(AccumulatorSpec { field: field.clone(), kind, expr });
    }
    Ok(out)
}

/// Precompiled accumulator template — the expression is compiled once at
/// pipeline build; each new group clones the cheap `Rc` and starts from
/// fresh empty state.
pub struct AccumulatorTemplate {
    pub field: String,
    kind: &'static str,
    compiled: Option<CompiledExpr>,
}

pub fn build_templates(specs: &[AccumulatorSpec]) -> Vec<AccumulatorTemplate> {
    specs
        .iter()
        .map(|s| AccumulatorTemplate {
            field: s.field.clone(),
            kind: s.kind,
            compiled: s.expr.as_ref().map(compile),
        })
        .collect()
}

pub fn instantiate_template(tpl: &AccumulatorTemplate) -> Accumulator {
    let expr = tpl.compiled.clone();
    let state = match tpl.kind {
        "$sum" => AccumulatorState::Sum { total_int: 0, total_float: 0.0, is_float: false },
        "$avg" => AccumulatorState::Avg { sum_int: 0, sum_float: 0.0, is_float: false, count: 0 },
        "$min" => AccumulatorState::Min { multiset: BTreeMap::new() },
        "$max" => AccumulatorState::Max { multiset: BTreeMap::new() },
        "$first" => AccumulatorState::First(OrderedContributions::default()),
        "$last" => AccumulatorState::Last(OrderedContributions::default()),
        "$push" => AccumulatorState::Push(OrderedContributions::default()),
        "$addToSet" => AccumulatorState::AddToSet { counts: BTreeMap::new(), next_seq: 0 },
        "$count" => AccumulatorState::Count(0),
        other => unreachable!("unknown accumulator kind reached instantiate: {other}"),
    };
    Accumulator { expr, state }
}

fn canonical_key_hash(key: &Value) -> u64 {
    let bytes = serde_json::to_vec(key).expect("a Value is always serializable");
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    // Tag group-synthesized rowIds so they can never collide with the
    // sequential ids the shared RowIdAllocator hands out for real documents.
    hash | (1u64 << 63)
}

struct GroupEntry {
    row_id: RowId,
    accumulators: Vec<Accumulator>,
    member_docs: std::collections::HashMap<RowId, Value>,
}

/// Outcome of folding one member's contribution in or out of its group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupMutation {
    /// The group didn't exist before this call; emit `+groupRowId`.
    Created(RowId),
    /// The group existed before and after; its document changed in place.
    /// Downstream only observes the change as `-groupRowId, +groupRowId`.
    Updated(RowId),
    /// The group had its last member removed; emit `-groupRowId`.
    Emptied(RowId),
    /// `remove` was called for a row that wasn't a tracked member.
    NoChange,
}

/// Per-group-key state for a `$group` stage: locates-or-creates a group on
/// insert, folds the contribution into every accumulator, and drops the
/// group (emitting `-groupRowId`) once its last member is removed.
pub struct GroupStageState {
    key_expr: CompiledExpr,
    accumulator_field_order: Vec<String>,
    templates: Vec<AccumulatorTemplate>,
    groups: BTreeMap<OrdKey, GroupEntry>,
    row_to_key: std::collections::HashMap<RowId, Value>,
}

impl GroupStageState {
    pub fn new(key_expr: CompiledExpr, specs: Vec<AccumulatorSpec>) -> Self {
        let accumulator_field_order = specs.iter().map(|s| s.field.clone()).collect();
        GroupStageState {
            key_expr,
            accumulator_field_order,
            templates: build_templates(&specs),
            groups: BTreeMap::new(),
            row_to_key: std::collections::HashMap::new(),
        }
    }

    fn fresh_group(&self, row_id: RowId) -> GroupEntry {
        GroupEntry {
            row_id,
            accumulators: self.templates.iter().map(instantiate_template).collect(),
            member_docs: std::collections::HashMap::new(),
        }
    }

    /// Folds one contributing row into its group, creating the group if
    /// needed. `Created` means the group didn't exist before (emit
    /// `+groupRowId`); `Updated` means an existing group's accumulators
    /// changed in place, which downstream stages only observe correctly as
    /// a retract-then-assert of the same rowId (`-groupRowId, +groupRowId`),
    /// since nothing else notifies them the cached document changed.
    pub fn insert(&mut self, row_id: RowId, doc: &Value) -> Result<GroupMutation, EvalError> {
        let key = self.key_expr.as_ref()(doc)?.or_null();
        let group_row_id = RowId::from_raw(canonical_key_hash(&key));
        let ord_key = OrdKey(key.clone());
        let created = !self.groups.contains_key(&ord_key);
        let entry = self.groups.entry(ord_key).or_insert_with(|| self.fresh_group(group_row_id));
        for acc in &mut entry.accumulators {
            acc.apply_insert(row_id, doc)?;
        }
        entry.member_docs.insert(row_id, doc.clone());
        self.row_to_key.insert(row_id, key);
        Ok(if created { GroupMutation::Created(group_row_id) } else { GroupMutation::Updated(group_row_id) })
    }

    /// Removes one contributing row from its group. `Emptied` means the
    /// group has just lost its last member (emit `-groupRowId`); `Updated`
    /// means the group survives with different accumulator values, which
    /// (as in [`insert`](Self::insert)) downstream only sees correctly as a
    /// retract-then-assert of the same rowId.
    pub fn remove(&mut self, row_id: RowId) -> Result<GroupMutation, EvalError> {
        let Some(key) = self.row_to_key.remove(&row_id) else {
            return Ok(GroupMutation::NoChange);
        };
        let ord_key = OrdKey(key);
        let Some(entry) = self.groups.get_mut(&ord_key) else {
            return Ok(GroupMutation::NoChange);
        };
        let Some(doc) = entry.member_docs.remove(&row_id) else {
            return Ok(GroupMutation::NoChange);
        };
        for acc in &mut entry.accumulators {
            acc.apply_remove(row_id, &doc)?;
        }
        if entry.member_docs.is_empty() {
            let group_row_id = entry.row_id;
            self.groups.remove(&ord_key);
            Ok(GroupMutation::Emptied(group_row_id))
        } else {
            Ok(GroupMutation::Updated(entry.row_id))
        }
    }

    pub fn group_row_id_for(&self, row_id: RowId) -> Option<RowId> {
        let key = self.row_to_key.get(&row_id)?;
        self.groups.get(&OrdKey(key.clone())).map(|e| e.row_id)
    }

    /// Materializes the current document for a group, keyed by its own
    /// rowId (not a member's).
    pub fn effective_document(&self, group_row_id: RowId) -> Option<Value> {
        let (key, entry) = self.groups.iter().find(|(_, e)| e.row_id == group_row_id)?;
        let mut out = Document::new();
        out.insert("_id".to_string(), key.0.clone());
        for (field, acc) in self.accumulator_field_order.iter().zip(entry.accumulators.iter()) {
            out.insert(field.clone(), acc.current_value());
        }
        Some(Value::Object(out))
    }

    pub fn active_group_row_ids(&self) -> Vec<RowId> {
        self.groups.values().map(|e| e.row_id).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn single(specs: Vec<AccumulatorSpec>) -> Accumulator {
        let templates = build_templates(&specs);
        instantiate_template(&templates[0])
    }

    #[test]
    fn sum_increments_and_decrements() {
        let specs = parse_accumulators(&json!({"total": {"$sum": "$n"}})).unwrap();
        let mut acc = single(specs);
        acc.apply_insert(RowId::from_raw(1), &json!({"n": 5})).unwrap();
        acc.apply_insert(RowId::from_raw(2), &json!({"n": 3})).unwrap();
        assert_eq!(acc.current_value(), json!(8));
        acc.apply_remove(RowId::from_raw(1), &json!({"n": 5})).unwrap();
        assert_eq!(acc.current_value(), json!(3));
    }

    #[test]
    fn min_tracks_multiset_after_removal() {
        let specs = parse_accumulators(&json!({"m": {"$min": "$n"}})).unwrap();
        let mut acc = single(specs);
        acc.apply_insert(RowId::from_raw(1), &json!({"n": 5})).unwrap();
        acc.apply_insert(RowId::from_raw(2), &json!({"n": 2})).unwrap();
        assert_eq!(acc.current_value(), json!(2));
        acc.apply_remove(RowId::from_raw(2), &json!({"n": 2})).unwrap();
        assert_eq!(acc.current_value(), json!(5));
    }

    #[test]
    fn push_preserves_arrival_order() {
        let specs = parse_accumulators(&json!({"tags": {"$push": "$tag"}})).unwrap();
        let mut acc = single(specs);
        acc.apply_insert(RowId::from_raw(1), &json!({"tag": "a"})).unwrap();
        acc.apply_insert(RowId::from_raw(2), &json!({"tag": "b"})).unwrap();
        assert_eq!(acc.current_value(), json!(["a", "b"]));
        acc.apply_remove(RowId::from_raw(1), &json!({"tag": "a"})).unwrap();
        assert_eq!(acc.current_value(), json!(["b"]));
    }

    #[test]
    fn count_ignores_the_field_value() {
        let specs = parse_accumulators(&json!({"n": {"$count": {}}})).unwrap();
        let mut acc = single(specs);
        acc.apply_insert(RowId::from_raw(1), &json!({})).unwrap();
        acc.apply_insert(RowId::from_raw(2), &json!({})).unwrap();
        assert_eq!(acc.current_value(), json!(2));
    }

    #[test]
    fn group_state_creates_and_drops_groups() {
        let key_expr = compile(&parse_expr(&json!("$category")).unwrap());
        let specs = parse_accumulators(&json!({"n": {"$sum": 1}})).unwrap();
        let mut state = GroupStageState::new(key_expr, specs);

        let created = state.insert(RowId::from_raw(1), &json!({"category": "a"})).unwrap();
        let GroupMutation::Created(group_id) = created else {
            panic!("expected Created, got {created:?}");
        };

        let created_again = state.insert(RowId::from_raw(2), &json!({"category": "a"})).unwrap();
        assert_eq!(created_again, GroupMutation::Updated(group_id));

        let doc = state.effective_document(group_id).unwrap();
        assert_eq!(doc.get("n"), Some(&json!(2)));

        let updated = state.remove(RowId::from_raw(1)).unwrap();
        assert_eq!(updated, GroupMutation::Updated(group_id));
        assert!(state.effective_document(group_id).is_some());
        let dropped = state.remove(RowId::from_raw(2)).unwrap();
        assert_eq!(dropped, GroupMutation::Emptied(group_id));
    }
}
