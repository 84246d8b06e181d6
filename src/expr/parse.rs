//! Parses pipeline-spec JSON into [`Expr`] / [`Predicate`] trees.

use crate::error::SpecError;
use crate::value::Value;

use super::{CmpOp, Expr, Predicate};

/// Parses a single-argument operand, which may itself be wrapped in a
/// one-element array (both `{$abs: "$x"}` and `{$abs: ["$x"]}` are
/// accepted, matching the family's usual leniency).
fn unary_operand(v: &Value) -> &Value {
    if let Value::Array(items) = v {
        if items.len() == 1 {
            return &items[0];
        }
    }
    v
}

fn array_operands<'a>(v: &'a Value, op: &str, arity: usize) -> Result<Vec<&'a Value>, SpecError> {
    match v {
        Value::Array(items) if items.len() == arity => Ok(items.iter().collect()),
        _ => Err(SpecError::UnknownExpressionOperator(format!(
            "{op} requires an array of {arity} operands"
        ))),
    }
}

fn variadic_operands<'a>(v: &'a Value) -> Vec<&'a Value> {
    match v {
        Value::Array(items) => items.iter().collect(),
        other => vec![other],
    }
}

/// Parses an expression tree from a pipeline-spec JSON value.
pub fn parse_expr(v: &Value) -> Result<Expr, SpecError> {
    match v {
        Value::String(s) if s == "$$ROOT" || s == "$$CURRENT" => Ok(Expr::RootOrCurrent),
        Value::String(s) if s.starts_with('$') => Ok(Expr::Field(s[1..].to_string())),
        Value::Object(map) if map.len() == 1 => {
            let (op, arg) = map.iter().next().expect("len == 1");
            parse_operator(op, arg)
        }
        other => Ok(Expr::Literal(other.clone())),
    }
}

fn b(v: &Value) -> Result<Box<Expr>, SpecError> {
    Ok(Box::new(parse_expr(v)?))
}

fn parse_operator(op: &str, arg: &Value) -> Result<Expr, SpecError> {
    let mut variadic = || -> Result<Vec<Expr>, SpecError> {
        variadic_operands(arg).into_iter().map(parse_expr).collect()
    };
    Ok(match op {
        "$add" => Expr::Add(variadic()?),
        "$multiply" => Expr::Multiply(variadic()?),
        "$and" => Expr::And(variadic()?),
        "$or" => Expr::Or(variadic()?),
        "$concat" => Expr::Concat(variadic()?),
        "$concatArrays" => Expr::ConcatArrays(variadic()?),

        "$subtract" => {
            let ops = array_operands(arg, op, 2)?;
            Expr::Subtract(b(ops[0])?, b(ops[1])?)
        }
        "$divide" => {
            let ops = array_operands(arg, op, 2)?;
            Expr::Divide(b(ops[0])?, b(ops[1])?)
        }
        "$mod" => {
            let ops = array_operands(arg, op, 2)?;
            Expr::Mod(b(ops[0])?, b(ops[1])?)
        }
        "$eq" => {
            let ops = array_operands(arg, op, 2)?;
            Expr::Eq(b(ops[0])?, b(ops[1])?)
        }
        "$ne" => {
            let ops = array_operands(arg, op, 2)?;
            Expr::Ne(b(ops[0])?, b(ops[1])?)
        }
        "$gt" => {
            let ops = array_operands(arg, op, 2)?;
            Expr::Gt(b(ops[0])?, b(ops[1])?)
        }
        "$gte" => {
            let ops = array_operands(arg, op, 2)?;
            Expr::Gte(b(ops[0])?, b(ops[1])?)
        }
        "$lt" => {
            let ops = array_operands(arg, op, 2)?;
            Expr::Lt(b(ops[0])?, b(ops[1])?)
        }
        "$lte" => {
            let ops = array_operands(arg, op, 2)?;
            Expr::Lte(b(ops[0])?, b(ops[1])?)
        }
        "$ifNull" => {
            let ops = array_operands(arg, op, 2)?;
            Expr::IfNull(b(ops[0])?, b(ops[1])?)
        }
        "$split" => {
            let ops = array_operands(arg, op, 2)?;
            Expr::Split(b(ops[0])?, b(ops[1])?)
        }
        "$arrayElemAt" => {
            let ops = array_operands(arg, op, 2)?;
            Expr::ArrayElemAt(b(ops[0])?, b(ops[1])?)
        }
        "$in" => {
            let ops = array_operands(arg, op, 2)?;
            Expr::In(b(ops[0])?, b(ops[1])?)
        }
        "$cond" => {
            let ops = array_operands(arg, op, 3)?;
            Expr::Cond(b(ops[0])?, b(ops[1])?, b(ops[2])?)
        }
        "$substr" => {
            let ops = array_operands(arg, op, 3)?;
            Expr::Substr(b(ops[0])?, b(ops[1])?, b(ops[2])?)
        }
        "$slice" => match arg {
            Value::Array(items) if items.len() == 2 => {
                Expr::Slice2(Box::new(parse_expr(&items[0])?), Box::new(parse_expr(&items[1])?))
            }
            Value::Array(items) if items.len() == 3 => Expr::Slice3(
                Box::new(parse_expr(&items[0])?),
                Box::new(parse_expr(&items[1])?),
                Box::new(parse_expr(&items[2])?),
            ),
            _ => {
                return Err(SpecError::UnknownExpressionOperator(
                    "$slice requires 2 or 3 operands".into(),
                ))
            }
        },

        "$abs" => Expr::Abs(Box::new(parse_expr(unary_operand(arg))?)),
        "$ceil" => Expr::Ceil(Box::new(parse_expr(unary_operand(arg))?)),
        "$floor" => Expr::Floor(Box::new(parse_expr(unary_operand(arg))?)),
        "$round" => Expr::Round(Box::new(parse_expr(unary_operand(arg))?)),
        "$sqrt" => Expr::Sqrt(Box::new(parse_expr(unary_operand(arg))?)),
        "$not" => Expr::Not(Box::new(parse_expr(unary_operand(arg))?)),
        "$toUpper" => Expr::ToUpper(Box::new(parse_expr(unary_operand(arg))?)),
        "$toLower" => Expr::ToLower(Box::new(parse_expr(unary_operand(arg))?)),
        "$strLen" => Expr::StrLen(Box::new(parse_expr(unary_operand(arg))?)),
        "$trim" => Expr::Trim(Box::new(parse_expr(unary_operand(arg))?)),
        "$size" => Expr::Size(Box::new(parse_expr(unary_operand(arg))?)),
        "$isArray" => Expr::IsArray(Box::new(parse_expr(unary_operand(arg))?)),
        "$month" => Expr::Month(Box::new(parse_expr(unary_operand(arg))?)),
        "$year" => Expr::Year(Box::new(parse_expr(unary_operand(arg))?)),
        "$dayOfMonth" => Expr::DayOfMonth(Box::new(parse_expr(unary_operand(arg))?)),
        "$hour" => Expr::Hour(Box::new(parse_expr(unary_operand(arg))?)),

        other => return Err(SpecError::UnknownExpressionOperator(other.to_string())),
    })
}

/// Parses a `$match`-style query document into a [`Predicate`] tree.
pub fn parse_predicate(v: &Value) -> Result<Predicate, SpecError> {
    let map = match v {
        Value::Object(map) => map,
        _ => {
            return Err(SpecError::UnknownExpressionOperator(
                "match spec must be an object".into(),
            ))
        }
    };

    let mut clauses = Vec::with_capacity(map.len());
    for (key, val) in map.iter() {
        clauses.push(match key.as_str() {
            "$and" => Predicate::And(parse_predicate_list(val)?),
            "$or" => Predicate::Or(parse_predicate_list(val)?),
            "$not" => Predicate::Not(Box::new(parse_predicate(val)?)),
            "$expr" => Predicate::Expr(parse_expr(val)?),
            field => parse_field_predicate(field, val)?,
        });
    }
    Ok(if clauses.len() == 1 {
        clauses.into_iter().next().expect("len == 1")
    } else {
        Predicate::And(clauses)
    })
}

fn parse_predicate_list(v: &Value) -> Result<Vec<Predicate>, SpecError> {
    match v {
        Value::Array(items) => items.iter().map(parse_predicate).collect(),
        _ => Err(SpecError::UnknownExpressionOperator(
            "$and/$or require an array of sub-predicates".into(),
        )),
    }
}

fn parse_field_predicate(field: &str, v: &Value) -> Result<Predicate, SpecError> {
    if let Value::Object(map) = v {
        if map.len() == 1 {
            let (op, operand) = map.iter().next().expect("len == 1");
            let cmp = match op.as_str() {
                "$exists" => {
                    let want = operand.as_bool().ok_or_else(|| {
                        SpecError::UnknownExpressionOperator("$exists requires a boolean".into())
                    })?;
                    return Ok(Predicate::FieldExists(field.to_string(), want));
                }
                "$eq" => CmpOp::Eq,
                "$ne" => CmpOp::Ne,
                "$gt" => CmpOp::Gt,
                "$gte" => CmpOp::Gte,
                "$lt" => CmpOp::Lt,
                "$lte" => CmpOp::Lte,
                other => {
                    return Err(SpecError::UnknownExpressionOperator(other.to_string()));
                }
            };
            return Ok(Predicate::FieldCmp(field.to_string(), cmp, operand.clone()));
        }
    }
    Ok(Predicate::FieldEq(field.to_string(), v.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_field_path() {
        let e = parse_expr(&json!("$a.b")).unwrap();
        assert!(matches!(e, Expr::Field(ref p) if p == "a.b"));
    }

    #[test]
    fn parses_binary_arithmetic() {
        let e = parse_expr(&json!({"$multiply": ["$price", "$quantity"]})).unwrap();
        assert!(matches!(e, Expr::Multiply(ref v) if v.len() == 2));
    }

    #[test]
    fn rejects_unknown_operator() {
        let err = parse_expr(&json!({"$bogus": 1})).unwrap_err();
        assert!(matches!(err, SpecError::UnknownExpressionOperator(_)));
    }

    #[test]
    fn parses_exists_predicate() {
        let p = parse_predicate(&json!({"tags": {"$exists": true}})).unwrap();
        assert!(matches!(p, Predicate::FieldExists(ref f, true) if f == "tags"));
    }

    #[test]
    fn parses_equality_predicate_shorthand() {
        let p = parse_predicate(&json!({"name": "A"})).unwrap();
        assert!(matches!(p, Predicate::FieldEq(ref f, _) if f == "name"));
    }
}
