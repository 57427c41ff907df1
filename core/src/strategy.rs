//! Strategy set: turns a decision into the next batch of the chain.
//!
//! RULES:
//!   - Strategies are pure: chain + decision + clock in, batch out.
//!     They never talk to the simulation oracle or the store.
//!   - Input is validated by the caller before a strategy runs.
//!   - Legality checks that depend on policy (may this case be halted now?)
//!     belong to the caller too; strategies only refuse what they cannot
//!     express.

use chrono::NaiveDate;
use thiserror::Error;

use crate::{
    batch::{BatchKind, PaymentBatch},
    clock::Clock,
    decision::{CeasePayment, Decision, HaltPayment, NewPayment},
    error::InvariantViolation,
    line::PaymentLine,
    period::{Period, YearMonth},
    timeline::{Effective, Timeline},
};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StrategyError {
    #[error("the decision produces no payment lines")]
    EmptyDecision,

    #[error("the case has no payments")]
    NoPayments,

    #[error("no paid months on or after {0}")]
    NothingToHalt(NaiveDate),

    #[error("the latest instruction is already a halt")]
    LatestIsHalt,

    #[error("the latest instruction is a cessation")]
    LatestIsCease,

    #[error("the latest instruction is not a halt")]
    LatestIsNotHalt,

    #[error("the halted months had no amount in effect before the halt")]
    NoAmountBeforeHalt,

    #[error("nothing left to cease on or after {0}")]
    NothingToCease(NaiveDate),

    #[error(transparent)]
    Invariant(#[from] InvariantViolation),
}

/// Run the strategy matching `decision`.
pub fn generate(
    case_id: &str,
    chain: &[PaymentBatch],
    decision: &Decision,
    created_by: &str,
    clock: &dyn Clock,
) -> Result<PaymentBatch, StrategyError> {
    match decision {
        Decision::New(params) => new_payment(case_id, chain, params, created_by, clock),
        Decision::Halt(params) => halt(case_id, chain, params, created_by, clock),
        Decision::Resume => resume(case_id, chain, created_by, clock),
        Decision::Cease(params) => cease(case_id, chain, params, created_by, clock),
    }
}

/// One line per month of the decision period. Each line supersedes whatever
/// line currently covers that month, so a month is never paid twice.
pub fn new_payment(
    case_id: &str,
    chain: &[PaymentBatch],
    params: &NewPayment,
    created_by: &str,
    clock: &dyn Clock,
) -> Result<PaymentBatch, StrategyError> {
    let timeline = Timeline::project(chain)?;
    let now = clock.now();

    let lines: Vec<PaymentLine> = params
        .amounts_by_month()
        .into_iter()
        .map(|(month, amount)| {
            PaymentLine::payment(
                Period::single(month),
                amount,
                params.retro,
                timeline.source_line(month).cloned(),
                now,
            )
        })
        .collect();

    if lines.is_empty() {
        return Err(StrategyError::EmptyDecision);
    }
    Ok(PaymentBatch::for_simulation(case_id, BatchKind::New, chain, lines, created_by, now))
}

/// A single halt line from `params.from` to the end of the timeline.
pub fn halt(
    case_id: &str,
    chain: &[PaymentBatch],
    params: &HaltPayment,
    created_by: &str,
    clock: &dyn Clock,
) -> Result<PaymentBatch, StrategyError> {
    let timeline = Timeline::project(chain)?;
    let last = timeline.last_entry().ok_or(StrategyError::NoPayments)?;
    match last.effective {
        Effective::Halted => return Err(StrategyError::LatestIsHalt),
        Effective::Ceased => return Err(StrategyError::LatestIsCease),
        Effective::Paid { .. } => {}
    }

    let from = YearMonth::of(params.from);
    if !timeline.has_paid_months_from(from) {
        return Err(StrategyError::NothingToHalt(params.from));
    }
    let period = Period::months_between(from, last.period.last_month())
        .map_err(|_| StrategyError::NothingToHalt(params.from))?;

    let now = clock.now();
    let line = PaymentLine::halt(period, Some(last.source_line_id.clone()), now);
    Ok(PaymentBatch::for_simulation(case_id, BatchKind::Halt, chain, vec![line], created_by, now))
}

/// A single resume line over the latest halt, paying what was paid before it.
pub fn resume(
    case_id: &str,
    chain: &[PaymentBatch],
    created_by: &str,
    clock: &dyn Clock,
) -> Result<PaymentBatch, StrategyError> {
    let timeline = Timeline::project(chain)?;
    let last = timeline.last_entry().ok_or(StrategyError::NoPayments)?;
    if last.effective != Effective::Halted {
        return Err(StrategyError::LatestIsNotHalt);
    }
    let halt = timeline.latest_halt().ok_or(StrategyError::LatestIsNotHalt)?;
    let amount = timeline
        .amount_before_latest_halt()
        .ok_or(StrategyError::NoAmountBeforeHalt)?;

    let now = clock.now();
    let line = PaymentLine::resume(halt.period, amount, Some(halt.line_id.clone()), now);
    Ok(PaymentBatch::for_simulation(case_id, BatchKind::Resume, chain, vec![line], created_by, now))
}

/// Cease everything from the start of `params.period` onward.
///
/// A control line can only reference one earlier line, so the strategy
/// emits one cease line per timeline entry still in force after the
/// cessation date. Nothing scheduled past that date is left paying.
pub fn cease(
    case_id: &str,
    chain: &[PaymentBatch],
    params: &CeasePayment,
    created_by: &str,
    clock: &dyn Clock,
) -> Result<PaymentBatch, StrategyError> {
    let timeline = Timeline::project(chain)?;
    let last = timeline.last_month().ok_or(StrategyError::NoPayments)?;
    let cease_from = params.period.first_month();
    let nothing = || StrategyError::NothingToCease(params.period.from_date());
    if cease_from > last {
        return Err(nothing());
    }
    let range = Period::months_between(cease_from, params.period.last_month().max(last))
        .map_err(|_| nothing())?;

    let now = clock.now();
    let lines: Vec<PaymentLine> = timeline
        .entries()
        .iter()
        .filter(|e| e.effective != Effective::Ceased)
        .filter_map(|e| {
            e.period
                .intersection(&range)
                .map(|p| PaymentLine::cease(p, Some(e.source_line_id.clone()), now))
        })
        .collect();

    if lines.is_empty() {
        return Err(nothing());
    }
    Ok(PaymentBatch::for_simulation(case_id, BatchKind::Cease, chain, lines, created_by, now))
}
