//! Payment lines (utbetalingslinjer).
//!
//! A line is either a fixed monthly amount over a period, or a control
//! instruction (halt, resume, cease) that changes what an earlier line pays.
//! Lines are never mutated after creation; a correction is a new line that
//! points back at the line it supersedes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    period::Period,
    types::{new_id, Amount, LineId},
};

/// When retroactive months of a new payment should be disbursed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetroPayment {
    AsSoonAsPossible,
    Scheduled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LineKind {
    Payment {
        amount_per_month: Amount,
        retro:            RetroPayment,
    },
    Halt,
    /// Reinstates payment. Carries the amount in effect right before the halt.
    Resume { amount_per_month: Amount },
    Cease,
}

impl LineKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Payment { .. } => "payment",
            Self::Halt => "halt",
            Self::Resume { .. } => "resume",
            Self::Cease => "cease",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentLine {
    pub id:         LineId,
    pub period:     Period,
    pub kind:       LineKind,
    pub created_at: DateTime<Utc>,
    pub supersedes: Option<LineId>,
}

impl PaymentLine {
    pub fn payment(
        period: Period,
        amount_per_month: Amount,
        retro: RetroPayment,
        supersedes: Option<LineId>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self::with_kind(
            period,
            LineKind::Payment { amount_per_month, retro },
            supersedes,
            created_at,
        )
    }

    pub fn halt(period: Period, supersedes: Option<LineId>, created_at: DateTime<Utc>) -> Self {
        Self::with_kind(period, LineKind::Halt, supersedes, created_at)
    }

    pub fn resume(
        period: Period,
        amount_per_month: Amount,
        supersedes: Option<LineId>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self::with_kind(period, LineKind::Resume { amount_per_month }, supersedes, created_at)
    }

    pub fn cease(period: Period, supersedes: Option<LineId>, created_at: DateTime<Utc>) -> Self {
        Self::with_kind(period, LineKind::Cease, supersedes, created_at)
    }

    fn with_kind(
        period: Period,
        kind: LineKind,
        supersedes: Option<LineId>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: new_id("line"),
            period,
            kind,
            created_at,
            supersedes,
        }
    }

    pub fn is_control(&self) -> bool {
        !matches!(self.kind, LineKind::Payment { .. })
    }

    /// Monthly amount this line disburses, if it disburses anything.
    pub fn amount_per_month(&self) -> Option<Amount> {
        match self.kind {
            LineKind::Payment { amount_per_month, .. } | LineKind::Resume { amount_per_month } => {
                Some(amount_per_month)
            }
            LineKind::Halt | LineKind::Cease => None,
        }
    }
}
