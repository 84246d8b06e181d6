//! `$project` / `$addFields` spec parsing and application (spec §4.2).
//!
//! Both stages share this representation: `$addFields` is exactly a
//! `$project` whose mode is always inclusion-of-everything-plus-computed
//! (it never drops a field). Nested specs (`{a: {b: 1}}`) are flattened to
//! dot-paths at parse time — [`crate::value::get_path`]/`set_path` are
//! already dot-path aware, so the stage itself never needs a tree walk.

use crate::error::SpecError;
use crate::expr::{compile, parse_expr, CompiledExpr, Expr};
use crate::value::{get_path, set_path, Document, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectMode {
    Include,
    Exclude,
    /// `$addFields`: keep the whole document, only add/overwrite the
    /// listed computed fields.
    AddFields,
}

#[derive(Debug, Clone)]
pub struct ProjectSpec {
    pub mode: ProjectMode,
    /// Dot-path fields to keep (Include) or drop (Exclude), in spec order.
    pub simple_fields: Vec<String>,
    /// Dot-path -> expression, for computed fields (both modes).
    pub computed: Vec<(String, Expr)>,
    pub suppress_id: bool,
}

enum FieldKind {
    Include,
    Exclude,
    Computed(Expr),
    Nested(Value),
}

fn classify_field(value: &Value) -> Result<FieldKind, SpecError> {
    match value {
        Value::Bool(b) => Ok(if *b { FieldKind::Include } else { FieldKind::Exclude }),
        Value::Number(n) => {
            let truthy = n.as_i64().map(|i| i != 0).unwrap_or(true);
            Ok(if truthy { FieldKind::Include } else { FieldKind::Exclude })
        }
        Value::Object(map) if map.len() == 1 && map.keys().next().expect("len==1").starts_with('$') => {
            Ok(FieldKind::Computed(parse_expr(value)?))
        }
        Value::Object(_) => Ok(FieldKind::Nested(value.clone())),
        _ => Ok(FieldKind::Computed(parse_expr(value)?)),
    }
}

fn flatten(
    prefix: &str,
    v: &Value,
    simple_fields: &mut Vec<(String, bool)>,
    computed: &mut Vec<(String, Expr)>,
) -> Result<(), SpecError> {
    let map = match v {
        Value::Object(m) => m,
        _ => return Err(SpecError::InvalidSortSpec),
    };
    for (name, val) in map.iter() {
        let path = if prefix.is_empty() {
            name.clone()
        } else {
            format!("{prefix}.{name}")
        };
        match classify_field(val)? {
            FieldKind::Include => simple_fields.push((path, true)),
            FieldKind::Exclude => simple_fields.push((path, false)),
            FieldKind::Computed(e) => computed.push((path, e)),
            FieldKind::Nested(obj) => flatten(&path, &obj, simple_fields, computed)?,
        }
    }
    Ok(())
}

impl ProjectSpec {
    pub fn parse_project(v: &Value) -> Result<Self, SpecError> {
        let mut simple: Vec<(String, bool)> = Vec::new();
        let mut computed = Vec::new();
        flatten("", v, &mut simple, &mut computed)?;

        let mut suppress_id = false;
        let mut saw_include = false;
        let mut saw_exclude = false;
        let mut fields = Vec::new();
        for (path, include) in simple {
            if path == "_id" {
                suppress_id = !include;
                continue;
            }
            if include {
                saw_include = true;
            } else {
                saw_exclude = true;
            }
            fields.push(path);
        }
        if saw_include && saw_exclude {
            return Err(SpecError::MixedProjection {
                field: fields.join(","),
            });
        }
        let mode = if saw_exclude { ProjectMode::Exclude } else { ProjectMode::Include };
        Ok(ProjectSpec {
            mode,
            simple_fields: fields,
            computed,
            suppress_id,
        })
    }

    pub fn parse_add_fields(v: &Value) -> Result<Self, SpecError> {
        let mut simple: Vec<(String, bool)> = Vec::new();
        let mut computed = Vec::new();
        flatten("", v, &mut simple, &mut computed)?;
        if !simple.is_empty() {
            return Err(SpecError::InvalidAccumulator {
                name: "$addFields".to_string(),
                reason: "all fields must be computed expressions".to_string(),
            });
        }
        Ok(ProjectSpec {
            mode: ProjectMode::AddFields,
            simple_fields: Vec::new(),
            computed,
            suppress_id: false,
        })
    }

    /// Fields this stage reads from its input document — used by the
    /// optimizer's projection-pruning/predicate-pushdown passes.
    pub fn referenced_fields(&self) -> Vec<String> {
        let mut out: Vec<String> = self.simple_fields.clone();
        for (_, expr) in &self.computed {
            collect_referenced(expr, &mut out);
        }
        out
    }
}

/// Fields a single expression reads, used both by [`ProjectSpec::referenced_fields`]
/// and by the optimizer's predicate-pushdown pass.
pub(crate) fn collect_referenced(expr: &Expr, out: &mut Vec<String>) {
    match expr {
        Expr::Field(p) => out.push(p.clone()),
        Expr::RootOrCurrent | Expr::Literal(_) => {}
        Expr::Add(items) | Expr::Multiply(items) | Expr::And(items) | Expr::Or(items)
        | Expr::Concat(items) | Expr::ConcatArrays(items) => {
            for i in items {
                collect_referenced(i, out);
            }
        }
        Expr::Subtract(a, b) | Expr::Divide(a, b) | Expr::Mod(a, b) | Expr::Eq(a, b)
        | Expr::Ne(a, b) | Expr::Gt(a, b) | Expr::Gte(a, b) | Expr::Lt(a, b) | Expr::Lte(a, b)
        | Expr::IfNull(a, b) | Expr::Split(a, b) | Expr::ArrayElemAt(a, b) | Expr::Slice2(a, b)
        | Expr::In(a, b) => {
            collect_referenced(a, out);
            collect_referenced(b, out);
        }
        Expr::Abs(a) | Expr::Ceil(a) | Expr::Floor(a) | Expr::Round(a) | Expr::Sqrt(a)
        | Expr::Not(a) | Expr::ToUpper(a) | Expr::ToLower(a) | Expr::StrLen(a) | Expr::Trim(a)
        | Expr::Size(a) | Expr::IsArray(a) | Expr::Month(a) | Expr::Year(a)
        | Expr::DayOfMonth(a) | Expr::Hour(a) => collect_referenced(a, out),
        Expr::Cond(a, b, c) | Expr::Substr(a, b, c) | Expr::Slice3(a, b, c) => {
            collect_referenced(a, out);
            collect_referenced(b, out);
            collect_referenced(c, out);
        }
    }
}

/// Compiled form of a [`ProjectSpec`], built once at pipeline construction.
pub struct CompiledProject {
    mode: ProjectMode,
    simple_fields: Vec<String>,
    computed: Vec<(String, CompiledExpr)>,
    suppress_id: bool,
}

impl CompiledProject {
    pub fn compile(spec: &ProjectSpec) -> Self {
        CompiledProject {
            mode: spec.mode,
            simple_fields: spec.simple_fields.clone(),
            computed: spec.computed.iter().map(|(p, e)| (p.clone(), compile(e))).collect(),
            suppress_id: spec.suppress_id,
        }
    }

    pub fn apply(&self, doc: &Value) -> Result<Value, crate::error::EvalError> {
        let mut out = Document::new();
        match self.mode {
            ProjectMode::AddFields => {
                if let Value::Object(src) = doc {
                    out = src.clone();
                }
            }
            ProjectMode::Include => {
                if !self.suppress_id {
                    if let Some(id) = get_path(doc, "_id") {
                        set_path(&mut out, "_id", id.clone());
                    }
                }
                for path in &self.simple_fields {
                    if let Some(v) = get_path(doc, path) {
                        set_path(&mut out, path, v.clone());
                    }
                }
            }
            ProjectMode::Exclude => {
                if let Value::Object(src) = doc {
                    out = src.clone();
                }
                for path in &self.simple_fields {
                    remove_path(&mut out, path);
                }
                if self.suppress_id {
                    out.remove("_id");
                }
            }
        }
        for (path, expr) in &self.computed {
            let value = expr(doc)?.or_null();
            set_path(&mut out, path, value);
        }
        Ok(Value::Object(out))
    }
}

fn remove_path(doc: &mut Document, path: &str) {
    let mut segments: Vec<&str> = path.split('.').collect();
    let last = segments.pop().expect("non-empty path");
    let mut current = doc;
    for seg in segments {
        match current.get_mut(seg).and_then(|v| v.as_object_mut()) {
            Some(next) => current = next,
            None => return,
        }
    }
    current.remove(last);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn inclusion_mode_keeps_id_by_default() {
        let spec = ProjectSpec::parse_project(&json!({"name": 1})).unwrap();
        let compiled = CompiledProject::compile(&spec);
        let doc = json!({"_id": 1, "name": "A", "tags": ["a"], "extra": "x"});
        let out = compiled.apply(&doc).unwrap();
        let obj = out.as_object().unwrap();
        assert_eq!(obj.len(), 2);
        assert!(obj.contains_key("_id"));
        assert!(obj.contains_key("name"));
    }

    #[test]
    fn mixed_inclusion_exclusion_is_an_error() {
        let err = ProjectSpec::parse_project(&json!({"name": 1, "tags": 0})).unwrap_err();
        assert!(matches!(err, SpecError::MixedProjection { .. }));
    }

    #[test]
    fn nested_spec_flattens_to_dot_path() {
        let spec = ProjectSpec::parse_project(&json!({"a": {"b": 1}})).unwrap();
        assert_eq!(spec.simple_fields, vec!["a.b".to_string()]);
    }

    #[test]
    fn add_fields_keeps_existing_and_adds_computed() {
        let spec = ProjectSpec::parse_add_fields(&json!({"total": {"$multiply": ["$price", "$qty"]}})).unwrap();
        let compiled = CompiledProject::compile(&spec);
        let doc = json!({"price": 2, "qty": 3, "other": "x"});
        let out = compiled.apply(&doc).unwrap();
        assert_eq!(out, json!({"price": 2, "qty": 3, "other": "x", "total": 6}));
    }
}
