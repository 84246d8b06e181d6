//! Debug/fallback tracking (spec §6, §7).
//!
//! `getFallbackCount` is a correctness-regression sentinel, not a
//! performance metric: the test suite asserts it stays zero across the
//! benchmark corpus. Kept as a plain counter on the engine rather than a
//! global so multiple engines in the same process don't interfere.

use std::cell::Cell;

use tracing::warn;

/// Counts compiled-evaluator fallbacks to tree-walking interpretation.
#[derive(Debug, Default)]
pub struct FallbackTracker {
    count: Cell<u64>,
}

impl FallbackTracker {
    pub fn new() -> Self {
        FallbackTracker {
            count: Cell::new(0),
        }
    }

    /// Records a fallback for `operator`, emitting a warning when tracing
    /// is enabled so the regression is visible in logs, not just counters.
    pub fn record(&self, operator: &str) {
        self.count.set(self.count.get() + 1);
        warn!(operator, "expression compiler fell back to interpretation");
    }

    pub fn count(&self) -> u64 {
        self.count.get()
    }

    pub fn reset(&self) {
        self.count.set(0);
    }
}
