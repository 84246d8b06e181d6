//! Lowers [`Expr`]/[`Predicate`] trees to closures, built once per pipeline
//! and reused for every delta (spec §9 "Expression evaluation").

use std::rc::Rc;

use chrono::{DateTime, Datelike, TimeZone, Timelike, Utc};
use serde_json::{Number, Value};

use crate::error::EvalError;
use crate::value::{compare_values, get_path};

use super::{CmpOp, EvalValue, Expr, Predicate};

pub type CompiledExpr = Rc<dyn Fn(&Value) -> Result<EvalValue, EvalError>>;
pub type CompiledPredicate = Rc<dyn Fn(&Value) -> Result<bool, EvalError>>;

/// Mongo-style truthiness: only `false`, `null`, and missing are falsy;
/// everything else — including `0` and `""` — is truthy.
fn truthy(v: &EvalValue) -> bool {
    match v {
        EvalValue::Missing => false,
        EvalValue::Value(Value::Null) => false,
        EvalValue::Value(Value::Bool(b)) => *b,
        EvalValue::Value(_) => true,
    }
}

#[derive(Clone, Copy)]
enum Num {
    Int(i64),
    Float(f64),
}

impl Num {
    fn as_f64(self) -> f64 {
        match self {
            Num::Int(i) => i as f64,
            Num::Float(f) => f,
        }
    }
}

fn numeric(v: &EvalValue, op: &'static str) -> Result<Num, EvalError> {
    match v {
        EvalValue::Value(Value::Number(n)) => {
            if let Some(i) = n.as_i64() {
                Ok(Num::Int(i))
            } else {
                Ok(Num::Float(n.as_f64().unwrap_or(f64::NAN)))
            }
        }
        other => Err(EvalError::TypeMismatch {
            op,
            detail: format!("expected number, got {}", other.as_value()),
        }),
    }
}

fn num_to_value(n: Num) -> Value {
    match n {
        Num::Int(i) => Value::Number(Number::from(i)),
        Num::Float(f) => Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
    }
}

fn as_string(v: &EvalValue, op: &'static str) -> Result<String, EvalError> {
    match v.as_value() {
        Value::String(s) => Ok(s.clone()),
        other => Err(EvalError::TypeMismatch {
            op,
            detail: format!("expected string, got {other}"),
        }),
    }
}

fn as_array(v: &EvalValue, op: &'static str) -> Result<Vec<Value>, EvalError> {
    match v.as_value() {
        Value::Array(items) => Ok(items.clone()),
        other => Err(EvalError::TypeMismatch {
            op,
            detail: format!("expected array, got {other}"),
        }),
    }
}

fn parse_datetime(v: &EvalValue, op: &'static str) -> Result<DateTime<Utc>, EvalError> {
    match v.as_value() {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|_| EvalError::TypeMismatch {
                op,
                detail: format!("'{s}' is not a valid RFC3339 timestamp"),
            }),
        Value::Number(n) => {
            let millis = n.as_i64().ok_or_else(|| EvalError::TypeMismatch {
                op,
                detail: "epoch millis must be an integer".to_string(),
            })?;
            Utc.timestamp_millis_opt(millis)
                .single()
                .ok_or_else(|| EvalError::TypeMismatch {
                    op,
                    detail: format!("{millis} is not a valid epoch millis value"),
                })
        }
        other => Err(EvalError::TypeMismatch {
            op,
            detail: format!("expected date string or epoch millis, got {other}"),
        }),
    }
}

/// Compiles an expression tree into a closure `doc -> EvalValue`.
pub fn compile(expr: &Expr) -> CompiledExpr {
    match expr {
        Expr::Literal(v) => {
            let v = v.clone();
            Rc::new(move |_doc| Ok(EvalValue::Value(v.clone())))
        }
        Expr::Field(path) => {
            let path = path.clone();
            Rc::new(move |doc| {
                Ok(match get_path(doc, &path) {
                    Some(v) => EvalValue::Value(v.clone()),
                    None => EvalValue::Missing,
                })
            })
        }
        Expr::RootOrCurrent => Rc::new(|doc| Ok(EvalValue::Value(doc.clone()))),

        Expr::Add(items) => {
            let items: Vec<_> = items.iter().map(compile).collect();
            Rc::new(move |doc| {
                let mut acc_int: i64 = 0;
                let mut acc_float: f64 = 0.0;
                let mut is_float = false;
                for item in &items {
                    match numeric(&item(doc)?, "$add")? {
                        Num::Int(i) if !is_float => acc_int += i,
                        Num::Int(i) => acc_float += i as f64,
                        Num::Float(f) => {
                            if !is_float {
                                acc_float = acc_int as f64;
                                is_float = true;
                            }
                            acc_float += f;
                        }
                    }
                }
                Ok(EvalValue::Value(num_to_value(if is_float {
                    Num::Float(acc_float)
                } else {
                    Num::Int(acc_int)
                })))
            })
        }
        Expr::Multiply(items) => {
            let items: Vec<_> = items.iter().map(compile).collect();
            Rc::new(move |doc| {
                let mut acc_int: i64 = 1;
                let mut acc_float: f64 = 1.0;
                let mut is_float = false;
                for item in &items {
                    match numeric(&item(doc)?, "$multiply")? {
                        Num::Int(i) if !is_float => acc_int *= i,
                        Num::Int(i) => acc_float *= i as f64,
                        Num::Float(f) => {
                            if !is_float {
                                acc_float = acc_int as f64;
                                is_float = true;
                            }
                            acc_float *= f;
                        }
                    }
                }
                Ok(EvalValue::Value(num_to_value(if is_float {
                    Num::Float(acc_float)
                } else {
                    Num::Int(acc_int)
                })))
            })
        }
        Expr::Subtract(a, b) => binary_numeric(a, b, "$subtract", |a, b| match (a, b) {
            (Num::Int(x), Num::Int(y)) => Num::Int(x - y),
            _ => Num::Float(a.as_f64() - b.as_f64()),
        }),
        Expr::Divide(a, b) => {
            let a = compile(a);
            let b = compile(b);
            Rc::new(move |doc| {
                let x = numeric(&a(doc)?, "$divide")?.as_f64();
                let y = numeric(&b(doc)?, "$divide")?.as_f64();
                if y == 0.0 {
                    return Err(EvalError::DivisionByZero);
                }
                Ok(EvalValue::Value(num_to_value(Num::Float(x / y))))
            })
        }
        Expr::Mod(a, b) => binary_numeric(a, b, "$mod", |a, b| match (a, b) {
            (Num::Int(x), Num::Int(y)) if y != 0 => Num::Int(x % y),
            _ => Num::Float(a.as_f64() % b.as_f64()),
        }),
        Expr::Abs(a) => unary_numeric(a, "$abs", |n| match n {
            Num::Int(i) => Num::Int(i.abs()),
            Num::Float(f) => Num::Float(f.abs()),
        }),
        Expr::Ceil(a) => unary_numeric(a, "$ceil", |n| Num::Float(n.as_f64().ceil())),
        Expr::Floor(a) => unary_numeric(a, "$floor", |n| Num::Float(n.as_f64().floor())),
        Expr::Round(a) => unary_numeric(a, "$round", |n| Num::Float(n.as_f64().round())),
        Expr::Sqrt(a) => unary_numeric(a, "$sqrt", |n| Num::Float(n.as_f64().sqrt())),

        Expr::Eq(a, b) => binary_eq(a, b, false),
        Expr::Ne(a, b) => binary_eq(a, b, true),
        Expr::Gt(a, b) => binary_cmp(a, b, std::cmp::Ordering::Greater, false),
        Expr::Gte(a, b) => binary_cmp(a, b, std::cmp::Ordering::Less, true),
        Expr::Lt(a, b) => binary_cmp(a, b, std::cmp::Ordering::Less, false),
        Expr::Lte(a, b) => binary_cmp(a, b, std::cmp::Ordering::Greater, true),

        Expr::And(items) => {
            let items: Vec<_> = items.iter().map(compile).collect();
            Rc::new(move |doc| {
                for item in &items {
                    if !truthy(&item(doc)?) {
                        return Ok(EvalValue::Value(Value::Bool(false)));
                    }
                }
                Ok(EvalValue::Value(Value::Bool(true)))
            })
        }
        Expr::Or(items) => {
            let items: Vec<_> = items.iter().map(compile).collect();
            Rc::new(move |doc| {
                for item in &items {
                    if truthy(&item(doc)?) {
                        return Ok(EvalValue::Value(Value::Bool(true)));
                    }
                }
                Ok(EvalValue::Value(Value::Bool(false)))
            })
        }
        Expr::Not(a) => {
            let a = compile(a);
            Rc::new(move |doc| Ok(EvalValue::Value(Value::Bool(!truthy(&a(doc)?)))))
        }
        Expr::Cond(c, t, f) => {
            let c = compile(c);
            let t = compile(t);
            let f = compile(f);
            Rc::new(move |doc| if truthy(&c(doc)?) { t(doc) } else { f(doc) })
        }
        Expr::IfNull(a, b) => {
            let a = compile(a);
            let b = compile(b);
            Rc::new(move |doc| {
                let av = a(doc)?;
                match av {
                    EvalValue::Missing | EvalValue::Value(Value::Null) => b(doc),
                    other => Ok(other),
                }
            })
        }

        Expr::ToUpper(a) => {
            let a = compile(a);
            Rc::new(move |doc| Ok(EvalValue::Value(Value::String(as_string(&a(doc)?, "$toUpper")?.to_uppercase()))))
        }
        Expr::ToLower(a) => {
            let a = compile(a);
            Rc::new(move |doc| Ok(EvalValue::Value(Value::String(as_string(&a(doc)?, "$toLower")?.to_lowercase()))))
        }
        Expr::Concat(items) => {
            let items: Vec<_> = items.iter().map(compile).collect();
            Rc::new(move |doc| {
                let mut out = String::new();
                for item in &items {
                    out.push_str(&as_string(&item(doc)?, "$concat")?);
                }
                Ok(EvalValue::Value(Value::String(out)))
            })
        }
        Expr::Split(s, delim) => {
            let s = compile(s);
            let delim = compile(delim);
            Rc::new(move |doc| {
                let s = as_string(&s(doc)?, "$split")?;
                let delim = as_string(&delim(doc)?, "$split")?;
                let parts: Vec<Value> = s.split(delim.as_str()).map(|p| Value::String(p.to_string())).collect();
                Ok(EvalValue::Value(Value::Array(parts)))
            })
        }
        Expr::StrLen(a) => {
            let a = compile(a);
            Rc::new(move |doc| Ok(EvalValue::Value(Value::Number(Number::from(
                as_string(&a(doc)?, "$strLen")?.chars().count() as i64,
            )))))
        }
        Expr::Trim(a) => {
            let a = compile(a);
            Rc::new(move |doc| Ok(EvalValue::Value(Value::String(as_string(&a(doc)?, "$trim")?.trim().to_string()))))
        }
        Expr::Substr(s, start, len) => {
            let s = compile(s);
            let start = compile(start);
            let len = compile(len);
            Rc::new(move |doc| {
                let s: Vec<char> = as_string(&s(doc)?, "$substr")?.chars().collect();
                let start = numeric(&start(doc)?, "$substr")?.as_f64().max(0.0) as usize;
                let len = numeric(&len(doc)?, "$substr")?.as_f64().max(0.0) as usize;
                let end = (start + len).min(s.len());
                let start = start.min(s.len());
                let out: String = s[start..end].iter().collect();
                Ok(EvalValue::Value(Value::String(out)))
            })
        }

        Expr::Size(a) => {
            let a = compile(a);
            Rc::new(move |doc| Ok(EvalValue::Value(Value::Number(Number::from(
                as_array(&a(doc)?, "$size")?.len() as i64,
            )))))
        }
        Expr::ArrayElemAt(arr, idx) => {
            let arr = compile(arr);
            let idx = compile(idx);
            Rc::new(move |doc| {
                let items = as_array(&arr(doc)?, "$arrayElemAt")?;
                let i = numeric(&idx(doc)?, "$arrayElemAt")?.as_f64() as i64;
                let resolved = if i < 0 { items.len() as i64 + i } else { i };
                Ok(EvalValue::Value(if resolved >= 0 && (resolved as usize) < items.len() {
                    items[resolved as usize].clone()
                } else {
                    Value::Null
                }))
            })
        }
        Expr::ConcatArrays(items) => {
            let items: Vec<_> = items.iter().map(compile).collect();
            Rc::new(move |doc| {
                let mut out = Vec::new();
                for item in &items {
                    out.extend(as_array(&item(doc)?, "$concatArrays")?);
                }
                Ok(EvalValue::Value(Value::Array(out)))
            })
        }
        Expr::Slice2(arr, n) => {
            let arr = compile(arr);
            let n = compile(n);
            Rc::new(move |doc| {
                let items = as_array(&arr(doc)?, "$slice")?;
                let n = numeric(&n(doc)?, "$slice")?.as_f64() as i64;
                Ok(EvalValue::Value(Value::Array(slice2(&items, n))))
            })
        }
        Expr::Slice3(arr, start, n) => {
            let arr = compile(arr);
            let start = compile(start);
            let n = compile(n);
            Rc::new(move |doc| {
                let items = as_array(&arr(doc)?, "$slice")?;
                let start = numeric(&start(doc)?, "$slice")?.as_f64() as i64;
                let n = numeric(&n(doc)?, "$slice")?.as_f64() as i64;
                Ok(EvalValue::Value(Value::Array(slice3(&items, start, n))))
            })
        }
        Expr::In(needle, haystack) => {
            let needle = compile(needle);
            let haystack = compile(haystack);
            Rc::new(move |doc| {
                let needle = needle(doc)?.or_null();
                let items = as_array(&haystack(doc)?, "$in")?;
                Ok(EvalValue::Value(Value::Bool(
                    items.iter().any(|item| compare_values(item, &needle) == std::cmp::Ordering::Equal),
                )))
            })
        }
        Expr::IsArray(a) => {
            let a = compile(a);
            Rc::new(move |doc| Ok(EvalValue::Value(Value::Bool(a(doc)?.as_value().is_array()))))
        }

        Expr::Month(a) => date_part(a, "$month", |dt| dt.month() as i64),
        Expr::Year(a) => date_part(a, "$year", |dt| dt.year() as i64),
        Expr::DayOfMonth(a) => date_part(a, "$dayOfMonth", |dt| dt.day() as i64),
        Expr::Hour(a) => date_part(a, "$hour", |dt| dt.hour() as i64),
    }
}

fn slice2(items: &[Value], n: i64) -> Vec<Value> {
    if n >= 0 {
        items.iter().take(n as usize).cloned().collect()
    } else {
        let start = (items.len() as i64 + n).max(0) as usize;
        items[start..].to_vec()
    }
}

fn slice3(items: &[Value], start: i64, n: i64) -> Vec<Value> {
    let len = items.len() as i64;
    let start = if start < 0 { (len + start).max(0) } else { start.min(len) };
    let end = (start + n.max(0)).min(len);
    if start >= end {
        Vec::new()
    } else {
        items[start as usize..end as usize].to_vec()
    }
}

fn date_part(a: &Expr, op: &'static str, f: impl Fn(&DateTime<Utc>) -> i64 + 'static) -> CompiledExpr {
    let a = compile(a);
    Rc::new(move |doc| {
        let av = a(doc)?;
        if av.is_missing() {
            return Ok(EvalValue::Missing);
        }
        let dt = parse_datetime(&av, op)?;
        Ok(EvalValue::Value(Value::Number(Number::from(f(&dt)))))
    })
}

fn unary_numeric(a: &Expr, op: &'static str, f: impl Fn(Num) -> Num + 'static) -> CompiledExpr {
    let a = compile(a);
    Rc::new(move |doc| Ok(EvalValue::Value(num_to_value(f(numeric(&a(doc)?, op)?)))))
}

fn binary_numeric(a: &Expr, b: &Expr, op: &'static str, f: impl Fn(Num, Num) -> Num + 'static) -> CompiledExpr {
    let a = compile(a);
    let b = compile(b);
    Rc::new(move |doc| {
        let x = numeric(&a(doc)?, op)?;
        let y = numeric(&b(doc)?, op)?;
        Ok(EvalValue::Value(num_to_value(f(x, y))))
    })
}

fn binary_eq(a: &Expr, b: &Expr, negate: bool) -> CompiledExpr {
    let a = compile(a);
    let b = compile(b);
    Rc::new(move |doc| {
        let av = a(doc)?;
        let bv = b(doc)?;
        let equal = match (av.is_missing(), bv.is_missing()) {
            (true, true) => true,
            (true, false) | (false, true) => false,
            (false, false) => compare_values(av.as_value(), bv.as_value()) == std::cmp::Ordering::Equal,
        };
        Ok(EvalValue::Value(Value::Bool(equal != negate)))
    })
}

fn binary_cmp(a: &Expr, b: &Expr, want: std::cmp::Ordering, or_eq: bool) -> CompiledExpr {
    let a = compile(a);
    let b = compile(b);
    Rc::new(move |doc| {
        let av = a(doc)?.or_null();
        let bv = b(doc)?.or_null();
        let ord = compare_values(&av, &bv);
        Ok(EvalValue::Value(Value::Bool(ord == want || (or_eq && ord == std::cmp::Ordering::Equal))))
    })
}

/// Compiles a `$match`-style predicate tree into a closure `doc -> bool`.
pub fn compile_predicate(pred: &Predicate) -> CompiledPredicate {
    match pred {
        Predicate::FieldEq(field, expected) => {
            let field = field.clone();
            let expected = expected.clone();
            Rc::new(move |doc| {
                Ok(match get_path(doc, &field) {
                    Some(v) => compare_values(v, &expected) == std::cmp::Ordering::Equal,
                    None => expected.is_null(),
                })
            })
        }
        Predicate::FieldExists(field, want) => {
            let field = field.clone();
            let want = *want;
            Rc::new(move |doc| Ok(get_path(doc, &field).is_some() == want))
        }
        Predicate::FieldCmp(field, op, expected) => {
            let field = field.clone();
            let op = *op;
            let expected = expected.clone();
            Rc::new(move |doc| {
                let actual = get_path(doc, &field).cloned().unwrap_or(Value::Null);
                let ord = compare_values(&actual, &expected);
                Ok(match op {
                    CmpOp::Eq => ord == std::cmp::Ordering::Equal,
                    CmpOp::Ne => ord != std::cmp::Ordering::Equal,
                    CmpOp::Gt => ord == std::cmp::Ordering::Greater,
                    CmpOp::Gte => ord != std::cmp::Ordering::Less,
                    CmpOp::Lt => ord == std::cmp::Ordering::Less,
                    CmpOp::Lte => ord != std::cmp::Ordering::Greater,
                })
            })
        }
        Predicate::And(clauses) => {
            let clauses: Vec<_> = clauses.iter().map(compile_predicate).collect();
            Rc::new(move |doc| {
                for c in &clauses {
                    if !c(doc)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            })
        }
        Predicate::Or(clauses) => {
            let clauses: Vec<_> = clauses.iter().map(compile_predicate).collect();
            Rc::new(move |doc| {
                for c in &clauses {
                    if c(doc)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            })
        }
        Predicate::Not(inner) => {
            let inner = compile_predicate(inner);
            Rc::new(move |doc| Ok(!inner(doc)?))
        }
        Predicate::Expr(expr) => {
            let expr = compile(expr);
            Rc::new(move |doc| Ok(truthy(&expr(doc)?)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{parse_expr, parse_predicate};
    use serde_json::json;

    #[test]
    fn compiled_add_keeps_integers_exact() {
        let expr = parse_expr(&json!({"$add": [1, 2, 3]})).unwrap();
        let f = compile(&expr);
        let result = f(&json!({})).unwrap();
        assert_eq!(result.or_null(), json!(6));
    }

    #[test]
    fn divide_by_zero_is_an_eval_error() {
        let expr = parse_expr(&json!({"$divide": [1, 0]})).unwrap();
        let f = compile(&expr);
        assert!(matches!(f(&json!({})), Err(EvalError::DivisionByZero)));
    }

    #[test]
    fn array_elem_at_out_of_bounds_is_null() {
        let expr = parse_expr(&json!({"$arrayElemAt": ["$xs", 5]})).unwrap();
        let f = compile(&expr);
        let doc = json!({"xs": [10, 20]});
        assert_eq!(f(&doc).unwrap().or_null(), Value::Null);
    }

    #[test]
    fn missing_field_is_distinct_from_null() {
        let expr = parse_expr(&json!("$absent")).unwrap();
        let f = compile(&expr);
        let result = f(&json!({})).unwrap();
        assert!(result.is_missing());
    }

    #[test]
    fn if_null_collapses_missing_and_null() {
        let expr = parse_expr(&json!({"$ifNull": ["$absent", "fallback"]})).unwrap();
        let f = compile(&expr);
        assert_eq!(f(&json!({})).unwrap().or_null(), json!("fallback"));
    }

    #[test]
    fn exists_predicate_matches_spec_scenario() {
        let pred = parse_predicate(&json!({"tags": {"$exists": true}})).unwrap();
        let f = compile_predicate(&pred);
        assert!(f(&json!({"tags": ["a"]})).unwrap());
        assert!(!f(&json!({"name": "B"})).unwrap());
        assert!(f(&json!({"tags": null})).unwrap());
    }

    #[test]
    fn month_extracts_from_rfc3339() {
        let expr = parse_expr(&json!({"$month": "$date"})).unwrap();
        let f = compile(&expr);
        let doc = json!({"date": "2026-07-28T00:00:00Z"});
        assert_eq!(f(&doc).unwrap().or_null(), json!(7));
    }
}
