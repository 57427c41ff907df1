//! Payment batches (utbetalinger) and the append-only chain they form.
//!
//! RULES:
//!   - A batch is produced by exactly one strategy run and never edited.
//!   - Batches for a case form a singly linked chain via `previous_batch_id`.
//!     The chain only ever grows at its tail.
//!   - `status` only moves forward:
//!     ForSimulation → Simulated → Sent → ConfirmedOk | ConfirmedWithError.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;

use crate::{
    error::InvariantViolation,
    line::PaymentLine,
    period::Period,
    simulation::SimulationResult,
    types::{new_id, BatchId, CaseId},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    ForSimulation,
    Simulated,
    Sent,
    ConfirmedOk,
    ConfirmedWithError,
}

impl BatchStatus {
    pub fn can_advance_to(self, next: BatchStatus) -> bool {
        matches!(
            (self, next),
            (Self::ForSimulation, Self::Simulated)
                | (Self::Simulated, Self::Sent)
                | (Self::Sent, Self::ConfirmedOk)
                | (Self::Sent, Self::ConfirmedWithError)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::ConfirmedOk | Self::ConfirmedWithError)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ForSimulation => "for_simulation",
            Self::Simulated => "simulated",
            Self::Sent => "sent",
            Self::ConfirmedOk => "confirmed_ok",
            Self::ConfirmedWithError => "confirmed_with_error",
        }
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which strategy produced a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchKind {
    New,
    Halt,
    Resume,
    Cease,
}

impl BatchKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Halt => "halt",
            Self::Resume => "resume",
            Self::Cease => "cease",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "new" => Some(Self::New),
            "halt" => Some(Self::Halt),
            "resume" => Some(Self::Resume),
            "cease" => Some(Self::Cease),
            _ => None,
        }
    }
}

/// External acknowledgment of a sent batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Receipt {
    Ok,
    WithError,
}

impl Receipt {
    pub fn status(self) -> BatchStatus {
        match self {
            Self::Ok => BatchStatus::ConfirmedOk,
            Self::WithError => BatchStatus::ConfirmedWithError,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::WithError => "with_error",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "ok" => Some(Self::Ok),
            "with_error" => Some(Self::WithError),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentBatch {
    pub id:                BatchId,
    pub case_id:           CaseId,
    pub kind:              BatchKind,
    /// 1-based position in the case's chain.
    pub sequence_no:       u64,
    pub previous_batch_id: Option<BatchId>,
    pub created_by:        String,
    pub created_at:        DateTime<Utc>,
    pub(crate) status:     BatchStatus,
    pub(crate) lines:      Vec<PaymentLine>,
    pub(crate) simulation: Option<SimulationResult>,
}

impl PaymentBatch {
    /// A fresh batch positioned right after the tail of `chain`.
    pub fn for_simulation(
        case_id: &str,
        kind: BatchKind,
        chain: &[PaymentBatch],
        lines: Vec<PaymentLine>,
        created_by: &str,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: new_id("batch"),
            case_id: case_id.to_string(),
            kind,
            sequence_no: chain.len() as u64 + 1,
            previous_batch_id: chain.last().map(|b| b.id.clone()),
            created_by: created_by.to_string(),
            created_at,
            status: BatchStatus::ForSimulation,
            lines,
            simulation: None,
        }
    }

    pub fn status(&self) -> BatchStatus {
        self.status
    }

    pub fn lines(&self) -> &[PaymentLine] {
        &self.lines
    }

    pub fn simulation(&self) -> Option<&SimulationResult> {
        self.simulation.as_ref()
    }

    pub fn line(&self, line_id: &str) -> Option<&PaymentLine> {
        self.lines.iter().find(|l| l.id == line_id)
    }

    /// Span of all lines, `None` for an empty batch.
    pub fn period(&self) -> Option<Period> {
        self.lines
            .iter()
            .map(|l| l.period)
            .reduce(|acc, p| acc.union_span(&p))
    }

    /// Batches rejected by the disbursement system never pay anything.
    pub fn counts_towards_timeline(&self) -> bool {
        self.status != BatchStatus::ConfirmedWithError
    }

    pub fn into_simulated(mut self, simulation: SimulationResult) -> Result<Self, InvariantViolation> {
        self.advance(BatchStatus::Simulated)?;
        self.simulation = Some(simulation);
        Ok(self)
    }

    pub fn into_sent(mut self) -> Result<Self, InvariantViolation> {
        self.advance(BatchStatus::Sent)?;
        Ok(self)
    }

    pub fn with_receipt(mut self, receipt: Receipt) -> Result<Self, InvariantViolation> {
        self.advance(receipt.status())?;
        Ok(self)
    }

    fn advance(&mut self, next: BatchStatus) -> Result<(), InvariantViolation> {
        if !self.status.can_advance_to(next) {
            return Err(InvariantViolation::StatusRegression {
                batch_id: self.id.clone(),
                from:     self.status.to_string(),
                to:       next.to_string(),
            });
        }
        self.status = next;
        Ok(())
    }
}

/// Check that `batch` is a well-formed tail extension of `chain`.
///
/// - position and back-link match the current tail
/// - line ids are unique across the whole chain
/// - no two lines of the batch cover the same month
/// - every `supersedes` names an overlapping line of an earlier batch
pub fn verify_extension(chain: &[PaymentBatch], batch: &PaymentBatch) -> Result<(), InvariantViolation> {
    let broken = |reason: String| InvariantViolation::ChainBroken {
        batch_id: batch.id.clone(),
        reason,
    };

    let expected_seq = chain.len() as u64 + 1;
    if batch.sequence_no != expected_seq {
        return Err(broken(format!(
            "sequence {} but chain expects {expected_seq}",
            batch.sequence_no
        )));
    }
    let tail = chain.last().map(|b| b.id.as_str());
    if batch.previous_batch_id.as_deref() != tail {
        return Err(broken(format!(
            "links to {:?} but tail is {tail:?}",
            batch.previous_batch_id
        )));
    }
    if let Some(other) = chain.iter().find(|b| b.case_id != batch.case_id) {
        return Err(broken(format!("chain contains batch {} of another case", other.id)));
    }

    let earlier: HashMap<&str, &PaymentLine> = chain
        .iter()
        .flat_map(|b| b.lines.iter())
        .map(|l| (l.id.as_str(), l))
        .collect();

    let mut seen_ids: HashSet<&str> = HashSet::new();
    let mut seen_months = HashSet::new();
    for line in &batch.lines {
        if earlier.contains_key(line.id.as_str()) || !seen_ids.insert(line.id.as_str()) {
            return Err(InvariantViolation::DuplicateLineId(line.id.clone()));
        }
        for month in line.period.months() {
            if !seen_months.insert(month) {
                return Err(InvariantViolation::OverlapWithinBatch {
                    batch_id: batch.id.clone(),
                    month:    month.to_string(),
                });
            }
        }
        if let Some(target) = &line.supersedes {
            let overlaps = earlier
                .get(target.as_str())
                .is_some_and(|prior| prior.period.overlaps(&line.period));
            if !overlaps {
                return Err(InvariantViolation::DanglingSupersedes {
                    line_id:    line.id.clone(),
                    supersedes: target.clone(),
                });
            }
        }
    }
    Ok(())
}

/// True when `longer` starts with every batch of `shorter`, in order.
pub fn is_extension_of(longer: &[PaymentBatch], shorter: &[PaymentBatch]) -> bool {
    longer.len() >= shorter.len()
        && longer.iter().zip(shorter).all(|(a, b)| a.id == b.id && a.lines == b.lines)
}

