//! Decisions the case-workflow layer hands to the settlement engine.
//!
//! Variants are a closed set; strategies and the projector match on them
//! exhaustively, so adding one fails compilation until it is handled.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::{
    batch::BatchKind,
    error::InputError,
    line::RetroPayment,
    period::{Period, YearMonth},
    types::{Amount, BatchId, CaseId, DecisionId},
};

/// Largest monthly amount a calculation may carry, in whole currency units.
/// Keeps every sum over a case's months well inside `Amount`.
pub const MAX_MONTHLY_AMOUNT: f64 = 1_000_000_000.0;

/// A calculated benefit amount for a run of months.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Calculation {
    pub period: Period,
    /// Monthly amount before rounding to whole currency units.
    pub amount: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewPayment {
    pub period:       Period,
    pub calculations: Vec<Calculation>,
    pub retro:        RetroPayment,
}

impl NewPayment {
    /// Every month of the decision period must have exactly one calculation.
    pub fn validate(&self) -> Result<(), InputError> {
        let mut seen: BTreeMap<YearMonth, ()> = BTreeMap::new();
        for calc in &self.calculations {
            if self.period.intersection(&calc.period) != Some(calc.period) {
                return Err(InputError::CalculationOutsidePeriod(calc.period.to_string()));
            }
            if !calc.amount.is_finite() || calc.amount < 0.0 || calc.amount.round() > MAX_MONTHLY_AMOUNT {
                return Err(InputError::InvalidAmount {
                    month:  calc.period.first_month().to_string(),
                    amount: calc.amount,
                });
            }
            for month in calc.period.months() {
                if seen.insert(month, ()).is_some() {
                    return Err(InputError::OverlappingCalculation(month.to_string()));
                }
            }
        }
        if let Some(missing) = self.period.months().find(|m| !seen.contains_key(m)) {
            return Err(InputError::MissingCalculation(missing.to_string()));
        }
        Ok(())
    }

    /// Calculated amount per month, rounded half away from zero.
    pub fn amounts_by_month(&self) -> BTreeMap<YearMonth, Amount> {
        self.calculations
            .iter()
            .flat_map(|c| {
                let rounded = c.amount.round() as Amount;
                c.period.months().map(move |m| (m, rounded))
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HaltPayment {
    pub from: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CeasePayment {
    pub period: Period,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Decision {
    New(NewPayment),
    Halt(HaltPayment),
    Resume,
    Cease(CeasePayment),
}

impl Decision {
    pub fn kind(&self) -> BatchKind {
        match self {
            Self::New(_) => BatchKind::New,
            Self::Halt(_) => BatchKind::Halt,
            Self::Resume => BatchKind::Resume,
            Self::Cease(_) => BatchKind::Cease,
        }
    }

    /// Input checks that need no I/O. Periods are already month-aligned by
    /// construction; this covers what a period cannot express.
    pub fn validate(&self) -> Result<(), InputError> {
        match self {
            Self::New(params) => params.validate(),
            Self::Halt(params) => {
                if YearMonth::of(params.from).first_day() != params.from {
                    return Err(InputError::NotFirstOfMonth(params.from));
                }
                Ok(())
            }
            Self::Resume | Self::Cease(_) => Ok(()),
        }
    }
}

/// The persisted record of a decision that produced a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub id:         DecisionId,
    pub case_id:    CaseId,
    pub batch_id:   BatchId,
    pub decided_by: String,
    pub decided_at: DateTime<Utc>,
    pub decision:   Decision,
}
