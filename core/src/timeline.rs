//! Timeline projector: folds a batch chain into "what is actually paid".
//!
//! Algorithm:
//!   - Walk batches oldest → newest, skipping batches the disbursement
//!     system rejected.
//!   - Every line overwrites each month it covers. The later batch wins the
//!     whole month; amounts are never blended.
//!   - Halt and Cease leave an entry behind (the last known instruction) but
//!     the month no longer counts as paid.
//!   - Resume restores, month by month, the paid entry that was in effect
//!     before the halt it lifts. Only months still halted are touched.
//!
//! The projector is pure: no I/O, no clock, recomputed on demand.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

use crate::{
    batch::PaymentBatch,
    error::InvariantViolation,
    line::{LineKind, PaymentLine},
    period::{Period, YearMonth},
    types::{Amount, LineId},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Effective {
    Paid { amount: Amount },
    Halted,
    Ceased,
}

impl Effective {
    pub fn paid_amount(&self) -> Option<Amount> {
        match self {
            Self::Paid { amount } => Some(*amount),
            Self::Halted | Self::Ceased => None,
        }
    }
}

/// One contiguous run of months sharing the same effective instruction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimelineEntry {
    pub period:         Period,
    pub effective:      Effective,
    pub source_line_id: LineId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct MonthEntry {
    effective: Effective,
    source:    LineId,
}

/// The most recent halt seen while folding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HaltMark {
    pub line_id:       LineId,
    pub period:        Period,
    /// Last amount paid for the halt's first month before it was halted.
    pub amount_before: Option<Amount>,
}

#[derive(Debug, Clone, Default)]
pub struct Timeline {
    /// Full per-month history; the last element is what is in effect.
    months:      BTreeMap<YearMonth, Vec<MonthEntry>>,
    entries:     Vec<TimelineEntry>,
    latest_halt: Option<HaltMark>,
}

impl Timeline {
    pub fn project(chain: &[PaymentBatch]) -> Result<Self, InvariantViolation> {
        let mut timeline = Timeline::default();
        for batch in chain.iter().filter(|b| b.counts_towards_timeline()) {
            let mut touched: HashSet<YearMonth> = HashSet::new();
            for line in batch.lines() {
                for month in line.period.months() {
                    if !touched.insert(month) {
                        log::error!(
                            "batch {} covers {month} twice; strategy produced overlapping lines",
                            batch.id
                        );
                        return Err(InvariantViolation::OverlapWithinBatch {
                            batch_id: batch.id.clone(),
                            month:    month.to_string(),
                        });
                    }
                }
                timeline.apply(line);
            }
        }
        timeline.entries = timeline.segments();
        Ok(timeline)
    }

    /// Project `chain` as if `pending` had already been appended.
    pub fn project_with(chain: &[PaymentBatch], pending: &PaymentBatch) -> Result<Self, InvariantViolation> {
        let mut all = chain.to_vec();
        all.push(pending.clone());
        Self::project(&all)
    }

    fn apply(&mut self, line: &PaymentLine) {
        match &line.kind {
            LineKind::Payment { amount_per_month, .. } => {
                self.overwrite(line, Effective::Paid { amount: *amount_per_month });
            }
            LineKind::Halt => {
                let amount_before = self.last_paid_in(line.period.first_month());
                self.latest_halt = Some(HaltMark {
                    line_id: line.id.clone(),
                    period: line.period,
                    amount_before,
                });
                self.overwrite(line, Effective::Halted);
            }
            LineKind::Resume { amount_per_month } => {
                // Months paid again by a later decision stay as they are.
                let halted: Vec<YearMonth> = line
                    .period
                    .months()
                    .filter(|m| self.current(*m) == Some(Effective::Halted))
                    .collect();
                for month in halted {
                    let amount = self
                        .amount_before_last_halt_in(month)
                        .unwrap_or(*amount_per_month);
                    self.push(month, Effective::Paid { amount }, &line.id);
                }
            }
            LineKind::Cease => self.overwrite(line, Effective::Ceased),
        }
    }

    fn overwrite(&mut self, line: &PaymentLine, effective: Effective) {
        for month in line.period.months() {
            self.push(month, effective, &line.id);
        }
    }

    fn push(&mut self, month: YearMonth, effective: Effective, source: &str) {
        self.months.entry(month).or_default().push(MonthEntry {
            effective,
            source: source.to_string(),
        });
    }

    /// Most recent paid amount in the month's history, halted or not since.
    fn last_paid_in(&self, month: YearMonth) -> Option<Amount> {
        self.months
            .get(&month)?
            .iter()
            .rev()
            .find_map(|e| e.effective.paid_amount())
    }

    fn amount_before_last_halt_in(&self, month: YearMonth) -> Option<Amount> {
        let history = self.months.get(&month)?;
        let halt_at = history.iter().rposition(|e| e.effective == Effective::Halted)?;
        history[..halt_at]
            .iter()
            .rev()
            .find_map(|e| e.effective.paid_amount())
    }

    fn segments(&self) -> Vec<TimelineEntry> {
        let mut out: Vec<TimelineEntry> = Vec::new();
        for (month, history) in &self.months {
            let Some(current) = history.last() else { continue };
            if let Some(last) = out.last_mut() {
                let adjacent = last.period.last_month().next() == *month;
                if adjacent && last.effective == current.effective && last.source_line_id == current.source {
                    last.period = last.period.union_span(&Period::single(*month));
                    continue;
                }
            }
            out.push(TimelineEntry {
                period:         Period::single(*month),
                effective:      current.effective,
                source_line_id: current.source.clone(),
            });
        }
        out
    }

    // ── Queries ────────────────────────────────────────────────────

    /// Sorted, non-overlapping entries.
    pub fn entries(&self) -> &[TimelineEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entry_for_month(&self, month: YearMonth) -> Option<&TimelineEntry> {
        self.entries.iter().find(|e| e.period.contains_month(month))
    }

    pub fn entry_for_date(&self, date: NaiveDate) -> Option<&TimelineEntry> {
        self.entry_for_month(YearMonth::of(date))
    }

    pub fn current(&self, month: YearMonth) -> Option<Effective> {
        self.months
            .get(&month)
            .and_then(|h| h.last())
            .map(|e| e.effective)
    }

    /// Amount paid for `month`; zero when halted, ceased or never paid.
    pub fn paid_amount(&self, month: YearMonth) -> Amount {
        self.current(month)
            .and_then(|e| e.paid_amount())
            .unwrap_or(0)
    }

    pub fn paid_months(&self) -> BTreeMap<YearMonth, Amount> {
        self.months
            .iter()
            .filter_map(|(m, h)| h.last().and_then(|e| e.effective.paid_amount()).map(|a| (*m, a)))
            .collect()
    }

    pub fn first_month(&self) -> Option<YearMonth> {
        self.months.keys().next().copied()
    }

    pub fn last_month(&self) -> Option<YearMonth> {
        self.months.keys().next_back().copied()
    }

    /// The entry covering the last month on the timeline.
    pub fn last_entry(&self) -> Option<&TimelineEntry> {
        self.entries.last()
    }

    pub fn has_paid_months_from(&self, month: YearMonth) -> bool {
        self.months
            .range(month..)
            .any(|(_, h)| h.last().is_some_and(|e| e.effective.paid_amount().is_some()))
    }

    /// True if any month from `from` to the end of the timeline is ceased or
    /// has no entry at all.
    pub fn has_future_cease_or_gap(&self, from: NaiveDate) -> bool {
        let Some(last) = self.last_month() else { return false };
        let start = YearMonth::of(from);
        if start > last {
            return false;
        }
        let mut month = start;
        loop {
            match self.current(month) {
                None | Some(Effective::Ceased) => return true,
                Some(_) => {}
            }
            if month == last {
                return false;
            }
            month = month.next();
        }
    }

    pub fn latest_halt(&self) -> Option<&HaltMark> {
        self.latest_halt.as_ref()
    }

    /// Amount in effect immediately before the most recent halt.
    pub fn amount_before_latest_halt(&self) -> Option<Amount> {
        self.latest_halt.as_ref().and_then(|h| h.amount_before)
    }

    /// Source line of the entry covering `month`, if any.
    pub fn source_line(&self, month: YearMonth) -> Option<&LineId> {
        self.months
            .get(&month)
            .and_then(|h| h.last())
            .map(|e| &e.source)
    }
}
