//! Error types.
//!
//! Mirrors the three-tier error model of spec §7: spec errors are raised
//! synchronously before any state mutates, evaluation errors cause the
//! offending delta to be dropped and counted, and internal errors poison
//! the pipeline outright. Fallback is deliberately not an `Err` variant —
//! it is a debug counter (see [`crate::debug`]), since falling back to the
//! tree-walking evaluator is a correctness regression, not a failed
//! operation.

use thiserror::Error;

use crate::rowid::RowId;

/// Top-level error type returned by pipeline construction and execution.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// Malformed pipeline spec, caught before any document is touched.
    #[error("spec error: {0}")]
    Spec(#[from] SpecError),

    /// A single delta could not be applied; the delta is dropped and the
    /// stage's prior state is left untouched.
    #[error("evaluation error: {0}")]
    Evaluation(#[from] EvalError),

    /// An internal invariant was violated. The pipeline is marked poisoned
    /// and every subsequent call on it must fail until rebuilt.
    #[error("internal invariant violated: {0}")]
    Poisoned(#[from] InternalError),
}

/// Errors raised while building or optimizing a pipeline, before any
/// document has been ingested.
#[derive(Debug, Clone, Error)]
pub enum SpecError {
    #[error("unknown stage operator: {0}")]
    UnknownOperator(String),

    #[error("unknown expression operator: {0}")]
    UnknownExpressionOperator(String),

    #[error("field spec for '{field}' mixes inclusion and exclusion")]
    MixedProjection { field: String },

    #[error("$group accumulator '{name}' has invalid spec: {reason}")]
    InvalidAccumulator { name: String, reason: String },

    #[error("$lookup spec is missing required field '{0}'")]
    MissingLookupField(&'static str),

    #[error("$sort spec must be a non-empty object of field -> 1|-1")]
    InvalidSortSpec,

    #[error("pipeline must contain at least one stage")]
    EmptyPipeline,
}

/// Errors raised while applying a single delta. Per spec §7 these are
/// recoverable at the driver level: the delta is dropped, this error is
/// logged and counted, and the stage's state is left as it was before the
/// attempt.
#[derive(Debug, Clone, Error)]
pub enum EvalError {
    #[error("type mismatch in '{op}': {detail}")]
    TypeMismatch { op: &'static str, detail: String },

    #[error("division by zero in $divide")]
    DivisionByZero,

    #[error("$min/$max contribution for row {row_id} cannot be decremented")]
    NonDecrementableExtremum { row_id: RowId },
}

/// Fatal errors: the delta stream itself is inconsistent with the
/// invariants the pipeline depends on, or a cache the protocol guarantees
/// is missing. Recovery is not attempted; callers must rebuild the engine.
#[derive(Debug, Clone, Error)]
pub enum InternalError {
    #[error("delta references inactive row {row_id} at stage {stage_index}")]
    InactiveRowReference { stage_index: usize, row_id: RowId },

    #[error("duplicate insert of already-active row {row_id} at stage {stage_index}")]
    DuplicateInsert { stage_index: usize, row_id: RowId },

    #[error("effective-document cache miss for ({stage_index}, {row_id}) where a hit was required")]
    CacheMiss { stage_index: usize, row_id: RowId },

    #[error("pipeline is poisoned and must be rebuilt before further use")]
    PipelinePoisoned,

    #[error("stage {stage_index} is not a $lookup stage")]
    NotALookupStage { stage_index: usize },
}

pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_messages_are_human_readable() {
        let err = EngineError::from(SpecError::UnknownOperator("$foo".into()));
        assert_eq!(err.to_string(), "spec error: unknown stage operator: $foo");
    }

    #[test]
    fn internal_error_carries_location() {
        let err = InternalError::CacheMiss {
            stage_index: 2,
            row_id: RowId::from_raw(7),
        };
        assert!(err.to_string().contains("(2, #7)"));
    }
}
