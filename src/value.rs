//! Document and value types.
//!
//! A [`Document`] is an ordered mapping from field name to [`Value`]; field
//! order is preserved for output but never semantically significant to the
//! engine (spec §3). We reuse `serde_json`'s object/array representation
//! directly — built with the `preserve_order` feature so `Document` iterates
//! in insertion order — rather than inventing a parallel value enum.

use std::cmp::Ordering;

/// A value drawn from: null, boolean, 64-bit integer, double, string,
/// ordered sequence of value, mapping of value.
pub type Value = serde_json::Value;

/// An ordered mapping from field name to value.
pub type Document = serde_json::Map<String, Value>;

/// Relative rank used to order values of different JSON types against each
/// other in `$sort`. Mirrors the conventional BSON/MongoDB type ordering:
/// null < numbers < strings < arrays < objects < booleans is NOT used here;
/// we follow null < bool < number < string < array < object, which is the
/// ordering `$sort` specs in the aggregation family commonly assume.
fn type_rank(v: &Value) -> u8 {
    match v {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

/// Total order over [`Value`], used by `$sort`, `$min`/`$max`, and
/// comparison operators. Missing is not a `Value` variant — callers that
/// need missing-vs-null semantics (spec §4.3) must special-case before
/// calling this.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => {
            let xf = x.as_f64().unwrap_or(f64::NAN);
            let yf = y.as_f64().unwrap_or(f64::NAN);
            xf.total_cmp(&yf)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => {
            for (xi, yi) in x.iter().zip(y.iter()) {
                match compare_values(xi, yi) {
                    Ordering::Equal => continue,
                    other => return other,
                }
            }
            x.len().cmp(&y.len())
        }
        (Value::Object(x), Value::Object(y)) => {
            for (xk, xv) in x.iter() {
                match y.get(xk) {
                    Some(yv) => match compare_values(xv, yv) {
                        Ordering::Equal => continue,
                        other => return other,
                    },
                    None => return Ordering::Greater,
                }
            }
            x.len().cmp(&y.len())
        }
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

/// Whether a numeric value is an exact integer representable as `i64`.
pub fn as_exact_i64(v: &Value) -> Option<i64> {
    v.as_i64()
}

/// Read a dot-separated, array-index-transparent path out of a document.
///
/// `"$$ROOT"` and `"$$CURRENT"` are handled by the expression compiler
/// before reaching here; this only walks plain field paths.
pub fn get_path<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = doc;
    for segment in path.split('.') {
        match current {
            Value::Object(map) => current = map.get(segment)?,
            Value::Array(items) => {
                let idx: usize = segment.parse().ok()?;
                current = items.get(idx)?;
            }
            _ => return None,
        }
    }
    Some(current)
}

/// Set a dot-separated path inside a document, creating intermediate
/// objects as needed. Used by `$project`/`$addFields` for nested specs.
pub fn set_path(doc: &mut Document, path: &str, value: Value) {
    let mut segments = path.split('.').peekable();
    let mut current = doc;
    while let Some(segment) = segments.next() {
        if segments.peek().is_none() {
            current.insert(segment.to_string(), value);
            return;
        }
        let entry = current
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Document::new()));
        if !entry.is_object() {
            *entry = Value::Object(Document::new());
        }
        current = entry.as_object_mut().expect("just normalized to object");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn compare_numbers_mixed_int_float() {
        let a = json!(3);
        let b = json!(3.5);
        assert_eq!(compare_values(&a, &b), Ordering::Less);
    }

    #[test]
    fn compare_type_rank_precedes_value_compare() {
        let a = json!(null);
        let b = json!(false);
        assert_eq!(compare_values(&a, &b), Ordering::Less);
    }

    #[test]
    fn get_path_nested_and_array_index() {
        let doc = json!({"a": {"b": [10, 20, 30]}});
        assert_eq!(get_path(&doc, "a.b.1"), Some(&json!(20)));
        assert_eq!(get_path(&doc, "a.missing"), None);
    }

    #[test]
    fn set_path_creates_intermediate_objects() {
        let mut doc = Document::new();
        set_path(&mut doc, "a.b", json!(1));
        assert_eq!(doc.get("a").unwrap().get("b"), Some(&json!(1)));
    }

    #[test]
    fn field_order_is_preserved() {
        let raw = r#"{"z": 1, "a": 2, "m": 3}"#;
        let doc: Document = serde_json::from_str(raw).unwrap();
        let keys: Vec<_> = doc.keys().collect();
        assert_eq!(keys, vec!["z", "a", "m"]);
    }
}
