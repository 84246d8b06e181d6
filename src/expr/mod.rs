//! Expression compiler & evaluator.
//!
//! An expression tree is parsed once from a pipeline's JSON spec
//! ([`parse`]) and compiled once into a tree of closures
//! ([`compile`]/[`compile_predicate`]) that are then reused for every
//! delta. There is deliberately no fallback tree-walker: every operator
//! named in the spec has a closure arm, so a [`crate::debug::FallbackTracker`]
//! hit only ever fires for a genuinely unrecognized operator, caught at
//! parse time as a [`crate::error::SpecError`] — by construction the
//! compiled path covers everything it accepts.

mod compile;
mod parse;

pub use compile::{compile, compile_predicate, CompiledExpr, CompiledPredicate};
pub use parse::{parse_expr, parse_predicate};

use crate::value::Value;

/// A value produced by evaluating an expression against a document.
///
/// `Missing` is distinct from `Value::Null`: per spec §4.3, evaluating a
/// field path that isn't present yields missing, which compares equal to
/// itself and unequal to null, while `$ifNull` collapses both.
#[derive(Debug, Clone, PartialEq)]
pub enum EvalValue {
    Missing,
    Value(Value),
}

impl EvalValue {
    pub fn is_missing(&self) -> bool {
        matches!(self, EvalValue::Missing)
    }

    /// Coerces missing to JSON null, for operators that don't distinguish.
    pub fn or_null(self) -> Value {
        match self {
            EvalValue::Missing => Value::Null,
            EvalValue::Value(v) => v,
        }
    }

    pub fn as_value(&self) -> &Value {
        static NULL: Value = Value::Null;
        match self {
            EvalValue::Missing => &NULL,
            EvalValue::Value(v) => v,
        }
    }
}

/// Parsed expression tree. One variant per operator family in spec §4.3,
/// plus the supplemented date-part extractors (SPEC_FULL §B).
#[derive(Debug, Clone)]
pub enum Expr {
    Literal(Value),
    /// Dot-separated, array-index-transparent field path (without the
    /// leading `$`).
    Field(String),
    /// `$$ROOT` / `$$CURRENT` — both resolve to the whole document being
    /// evaluated; this engine has no nested-cursor operators that would
    /// make them diverge.
    RootOrCurrent,

    Add(Vec<Expr>),
    Subtract(Box<Expr>, Box<Expr>),
    Multiply(Vec<Expr>),
    Divide(Box<Expr>, Box<Expr>),
    Mod(Box<Expr>, Box<Expr>),
    Abs(Box<Expr>),
    Ceil(Box<Expr>),
    Floor(Box<Expr>),
    Round(Box<Expr>),
    Sqrt(Box<Expr>),

    Eq(Box<Expr>, Box<Expr>),
    Ne(Box<Expr>, Box<Expr>),
    Gt(Box<Expr>, Box<Expr>),
    Gte(Box<Expr>, Box<Expr>),
    Lt(Box<Expr>, Box<Expr>),
    Lte(Box<Expr>, Box<Expr>),
    And(Vec<Expr>),
    Or(Vec<Expr>),
    Not(Box<Expr>),
    Cond(Box<Expr>, Box<Expr>, Box<Expr>),
    IfNull(Box<Expr>, Box<Expr>),

    ToUpper(Box<Expr>),
    ToLower(Box<Expr>),
    Concat(Vec<Expr>),
    Split(Box<Expr>, Box<Expr>),
    StrLen(Box<Expr>),
    Trim(Box<Expr>),
    Substr(Box<Expr>, Box<Expr>, Box<Expr>),

    Size(Box<Expr>),
    ArrayElemAt(Box<Expr>, Box<Expr>),
    ConcatArrays(Vec<Expr>),
    Slice2(Box<Expr>, Box<Expr>),
    Slice3(Box<Expr>, Box<Expr>, Box<Expr>),
    In(Box<Expr>, Box<Expr>),
    IsArray(Box<Expr>),

    Month(Box<Expr>),
    Year(Box<Expr>),
    DayOfMonth(Box<Expr>),
    Hour(Box<Expr>),
}

/// Predicate grammar used only by `$match` (spec §4.3 "Existence"):
/// `{field: literal}` equality, `{field: {$op: value}}` comparisons,
/// `{field: {$exists: bool}}`, and top-level `$and`/`$or`/`$not`.
#[derive(Debug, Clone)]
pub enum Predicate {
    FieldEq(String, Value),
    FieldCmp(String, CmpOp, Value),
    FieldExists(String, bool),
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
    /// A general expression evaluated for truthiness (used for predicates
    /// built from `$expr`-shaped nested expression trees).
    Expr(Expr),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
}
