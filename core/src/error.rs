use chrono::NaiveDate;
use thiserror::Error;

use crate::{
    delivery::DeliveryError,
    simulation::SimulationError,
    strategy::StrategyError,
    types::{BatchId, CaseId, CaseVersion, LineId},
};

#[derive(Error, Debug)]
pub enum SettleError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid input: {0}")]
    Input(#[from] InputError),

    #[error("Strategy rejected the decision: {0}")]
    Strategy(#[from] StrategyError),

    #[error("Decision not allowed on the current timeline: {0}")]
    NotAllowed(String),

    #[error("Simulation failed: {0}")]
    Simulation(#[from] SimulationError),

    #[error("Simulation differs from the prior simulation of this decision")]
    ConcurrentModification,

    #[error("Simulation does not match the projected timeline: {0}")]
    SimulationMismatch(String),

    #[error("Stale case version for '{case_id}': expected {expected}, persisted {actual}")]
    StaleCaseVersion {
        case_id:  CaseId,
        expected: CaseVersion,
        actual:   CaseVersion,
    },

    #[error("Delivery failed: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("Invariant violated: {0}")]
    Invariant(#[from] InvariantViolation),

    #[error("Case '{case_id}' not found")]
    CaseNotFound { case_id: CaseId },

    #[error("Batch '{batch_id}' not found")]
    BatchNotFound { batch_id: BatchId },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type SettleResult<T> = Result<T, SettleError>;

/// Malformed caller input. Rejected before any I/O and never retried.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum InputError {
    #[error("period {from}..{to} is not aligned to calendar months")]
    NotMonthAligned { from: NaiveDate, to: NaiveDate },

    #[error("period ends ({to}) before it starts ({from})")]
    ReversedPeriod { from: NaiveDate, to: NaiveDate },

    #[error("date {0} is not the first day of a month")]
    NotFirstOfMonth(NaiveDate),

    #[error("month {year}-{month:02} does not exist")]
    InvalidMonth { year: i32, month: u32 },

    #[error("no calculated amount for {0}")]
    MissingCalculation(String),

    #[error("more than one calculated amount for {0}")]
    OverlappingCalculation(String),

    #[error("calculated amount for {month} is not a finite, non-negative number: {amount}")]
    InvalidAmount { month: String, amount: f64 },

    #[error("calculation for {0} lies outside the decision period")]
    CalculationOutsidePeriod(String),
}

/// A broken engine invariant. Always a defect: it fails loudly and is never
/// corrected silently.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InvariantViolation {
    #[error("batch {batch_id} has two lines covering {month}")]
    OverlapWithinBatch { batch_id: BatchId, month: String },

    #[error("case {case_id} already has an outstanding claw-back in state {state}")]
    ClawbackAlreadyOutstanding { case_id: CaseId, state: String },

    #[error("claw-back {clawback_id} cannot move from {from} to {to}")]
    ClawbackTransition { clawback_id: String, from: String, to: String },

    #[error("line {line_id} supersedes {supersedes}, which is not an overlapping line of an earlier batch")]
    DanglingSupersedes { line_id: LineId, supersedes: LineId },

    #[error("line id {0} appears more than once in the chain")]
    DuplicateLineId(LineId),

    #[error("batch {batch_id} cannot move from status {from} to {to}")]
    StatusRegression { batch_id: BatchId, from: String, to: String },

    #[error("batch {batch_id} does not extend the chain: {reason}")]
    ChainBroken { batch_id: BatchId, reason: String },
}
