//! Shared primitive types used across the entire settlement engine.

/// A stable, unique identifier for a case.
pub type CaseId = String;

/// Identifier of one payment batch (utbetaling).
pub type BatchId = String;

/// Identifier of one payment line (utbetalingslinje).
pub type LineId = String;

/// Identifier of a persisted case decision.
pub type DecisionId = String;

/// Whole currency units. Every amount on a payment line is rounded to this.
pub type Amount = i64;

/// Optimistic version of a case. Advances by exactly one per appended batch,
/// so it doubles as the sequence number of the newest batch in the chain.
pub type CaseVersion = u64;

/// Generate a fresh identifier with a readable prefix, e.g. `batch-3f9c…`.
pub fn new_id(prefix: &str) -> String {
    format!("{prefix}-{}", uuid::Uuid::new_v4().simple())
}
