//! Simulation oracle interface and the checks run against its answers.
//!
//! RULES:
//!   - The oracle is called before the settlement transaction opens,
//!     never inside it.
//!   - A fresh simulation must equal the prior simulation of the same
//!     decision exactly. No tolerance is applied to rounding differences.
//!   - Every simulated month must equal what the projected timeline pays.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;

use crate::{
    batch::PaymentBatch,
    clock::Clock,
    delivery::{DeliveryError, DeliverySink, OutboxMessage},
    period::{Period, YearMonth},
    timeline::Timeline,
    types::{Amount, CaseId},
};

/// The oracle's view of one month after the pending batch is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulatedMonth {
    pub month:           YearMonth,
    /// Gross amount the month pays once the batch is in effect.
    pub amount:          Amount,
    /// Gross amount already disbursed for the month.
    pub previously_paid: Amount,
}

impl SimulatedMonth {
    /// Positive: still to be paid out. Negative: paid too much.
    pub fn delta(&self) -> Amount {
        self.amount.saturating_sub(self.previously_paid)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulationResult {
    pub computed_on: NaiveDate,
    pub net_amount:  Amount,
    pub months:      Vec<SimulatedMonth>,
}

impl SimulationResult {
    pub fn from_months(computed_on: NaiveDate, mut months: Vec<SimulatedMonth>) -> Self {
        months.sort_by_key(|m| m.month);
        let net_amount = months
            .iter()
            .map(SimulatedMonth::delta)
            .fold(0, Amount::saturating_add);
        Self { computed_on, net_amount, months }
    }

    /// Month → (amount, previously paid). The structure compared by the cross-check.
    pub fn breakdown(&self) -> BTreeMap<YearMonth, (Amount, Amount)> {
        self.months
            .iter()
            .map(|m| (m.month, (m.amount, m.previously_paid)))
            .collect()
    }

    /// Exact structural equality of breakdown and net amount.
    /// The date the oracle computed on is not compared.
    pub fn matches(&self, other: &SimulationResult) -> bool {
        self.net_amount == other.net_amount && self.breakdown() == other.breakdown()
    }

    /// Months whose new amount is below what was already disbursed.
    pub fn overpaid_months(&self) -> impl Iterator<Item = &SimulatedMonth> {
        self.months.iter().filter(|m| m.delta() < 0)
    }

    /// Span of the overpaid months.
    pub fn overpaid_period(&self) -> Option<Period> {
        let first = self.overpaid_months().map(|m| m.month).min()?;
        let last = self.overpaid_months().map(|m| m.month).max()?;
        Period::months_between(first, last).ok()
    }

    /// Sum of positive deltas within `period`.
    pub fn repaid_within(&self, period: &Period) -> Amount {
        self.months
            .iter()
            .filter(|m| period.contains_month(m.month))
            .map(|m| m.delta().max(0))
            .fold(0, Amount::saturating_add)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SimulationError {
    #[error("oracle unavailable: {0}")]
    Unavailable(String),

    #[error("oracle did not answer within {0:?}")]
    Timeout(Duration),

    #[error("oracle rejected the batch: {0}")]
    Rejected(String),
}

/// External system computing the disbursement a pending batch would cause.
/// Idempotent and side-effect free on the oracle's side.
///
/// The saga calls `simulate` on a worker thread and stops waiting once
/// `timeout` has passed, so an implementation should give up by then too.
/// An answer that arrives late is discarded.
pub trait SimulationOracle: Send + Sync {
    fn simulate(
        &self,
        batch: &PaymentBatch,
        window: Period,
        timeout: Duration,
    ) -> Result<SimulationResult, SimulationError>;
}

/// Compare a fresh simulation with the one the decision was made on.
/// `false` means the case moved between deciding and settling.
pub fn cross_check(prior: Option<&SimulationResult>, fresh: &SimulationResult) -> bool {
    match prior {
        Some(prior) => prior.matches(fresh),
        None => true,
    }
}

/// Every simulated month must pay exactly what `after` (the timeline with the
/// pending batch applied) says. Returns a description of the first mismatch.
pub fn control_against_timeline(simulation: &SimulationResult, after: &Timeline) -> Result<(), String> {
    for month in &simulation.months {
        let expected = after.paid_amount(month.month);
        if month.amount != expected {
            return Err(format!(
                "{}: simulated {} but timeline pays {expected}",
                month.month, month.amount
            ));
        }
    }
    Ok(())
}

// ── Stub oracle ────────────────────────────────────────────────────

/// In-process stand-in for the disbursement system.
///
/// It learns what has been disbursed through the delivery sink and answers
/// simulations from that knowledge, so it agrees with the engine's own
/// timeline as long as every committed batch has been relayed to it.
pub struct StubOracle {
    clock:     Arc<dyn Clock>,
    delivered: Mutex<HashMap<CaseId, Vec<PaymentBatch>>>,
}

impl StubOracle {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            delivered: Mutex::new(HashMap::new()),
        }
    }

    pub fn record_delivered(&self, batch: PaymentBatch) {
        let mut delivered = self.delivered.lock().unwrap_or_else(|e| e.into_inner());
        delivered.entry(batch.case_id.clone()).or_default().push(batch);
    }

    fn delivered_chain(&self, case_id: &str) -> Vec<PaymentBatch> {
        let delivered = self.delivered.lock().unwrap_or_else(|e| e.into_inner());
        delivered.get(case_id).cloned().unwrap_or_default()
    }
}

impl SimulationOracle for StubOracle {
    fn simulate(
        &self,
        batch: &PaymentBatch,
        window: Period,
        _timeout: Duration,
    ) -> Result<SimulationResult, SimulationError> {
        let chain = self.delivered_chain(&batch.case_id);
        let before = Timeline::project(&chain).map_err(|e| SimulationError::Rejected(e.to_string()))?;
        let after = Timeline::project_with(&chain, batch)
            .map_err(|e| SimulationError::Rejected(e.to_string()))?;

        let today = self.clock.today();
        let current = YearMonth::of(today);
        let mut months: BTreeMap<YearMonth, SimulatedMonth> = BTreeMap::new();
        for line in batch.lines() {
            for month in line.period.months().filter(|m| window.contains_month(*m)) {
                let previously_paid = if month < current { before.paid_amount(month) } else { 0 };
                months.insert(
                    month,
                    SimulatedMonth {
                        month,
                        amount: after.paid_amount(month),
                        previously_paid,
                    },
                );
            }
        }
        Ok(SimulationResult::from_months(today, months.into_values().collect()))
    }
}

impl DeliverySink for StubOracle {
    fn deliver(&self, message: &OutboxMessage) -> Result<(), DeliveryError> {
        self.record_delivered(message.payload.batch.clone());
        Ok(())
    }
}
