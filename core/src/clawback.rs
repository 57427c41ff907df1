//! Claw-back tracker (avkortingsvarsel).
//!
//! STATES:
//!   (none) → Created → Pending → Settled
//!                  ↘         ↘
//!                   Annulled   Annulled
//!
//! RULES:
//!   - At most one tracker per case is outstanding (Created or Pending).
//!   - Trackers are created and advanced only by the settlement saga,
//!     inside its transaction.
//!   - Discovering a new reduction while a tracker is outstanding is an
//!     invariant violation, never a silent merge.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{
    decision::Decision,
    error::InvariantViolation,
    period::Period,
    simulation::SimulationResult,
    types::{new_id, Amount, BatchId, CaseId, CaseVersion, DecisionId},
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ClawbackState {
    Created,
    /// Earmarked against the next qualifying case action ("skal avkortes").
    Pending,
    Settled { linked_action_id: DecisionId },
    /// The overpaid months were paid again in full by a later settlement.
    Annulled { by_batch_id: BatchId },
}

impl ClawbackState {
    pub fn is_outstanding(&self) -> bool {
        matches!(self, Self::Created | Self::Pending)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Pending => "pending",
            Self::Settled { .. } => "settled",
            Self::Annulled { .. } => "annulled",
        }
    }
}

impl fmt::Display for ClawbackState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnticipatedClawback {
    pub id:               String,
    pub case_id:          CaseId,
    pub amount:           Amount,
    pub source_period:    Period,
    pub state:            ClawbackState,
    pub created_by_batch: BatchId,
    /// Case version at the last write of this tracker.
    pub case_version:     CaseVersion,
    pub created_at:       DateTime<Utc>,
    pub updated_at:       DateTime<Utc>,
}

impl AnticipatedClawback {
    fn transition(&self, next: ClawbackState, version: CaseVersion, at: DateTime<Utc>) -> Result<Self, InvariantViolation> {
        let allowed = matches!(
            (&self.state, &next),
            (ClawbackState::Created, ClawbackState::Pending)
                | (ClawbackState::Pending, ClawbackState::Settled { .. })
                | (ClawbackState::Created | ClawbackState::Pending, ClawbackState::Annulled { .. })
        );
        if !allowed {
            return Err(InvariantViolation::ClawbackTransition {
                clawback_id: self.id.clone(),
                from:        self.state.to_string(),
                to:          next.to_string(),
            });
        }
        Ok(Self {
            state: next,
            case_version: version,
            updated_at: at,
            ..self.clone()
        })
    }

    pub fn mark_pending(&self, version: CaseVersion, at: DateTime<Utc>) -> Result<Self, InvariantViolation> {
        self.transition(ClawbackState::Pending, version, at)
    }

    pub fn settle(&self, linked_action_id: &str, version: CaseVersion, at: DateTime<Utc>) -> Result<Self, InvariantViolation> {
        let next = ClawbackState::Settled { linked_action_id: linked_action_id.to_string() };
        self.transition(next, version, at)
    }

    pub fn annul(&self, by_batch_id: &str, version: CaseVersion, at: DateTime<Utc>) -> Result<Self, InvariantViolation> {
        let next = ClawbackState::Annulled { by_batch_id: by_batch_id.to_string() };
        self.transition(next, version, at)
    }
}

/// What the tracker must write for one settlement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClawbackAction {
    Create(AnticipatedClawback),
    Advance {
        from:    ClawbackState,
        tracker: AnticipatedClawback,
    },
}

impl ClawbackAction {
    pub fn tracker(&self) -> &AnticipatedClawback {
        match self {
            Self::Create(tracker) | Self::Advance { tracker, .. } => tracker,
        }
    }
}

/// The settlement being committed, as seen by the tracker.
pub struct Settlement<'a> {
    pub case_id:     &'a str,
    pub batch_id:    &'a str,
    pub decision_id: &'a str,
    pub decision:    &'a Decision,
    pub simulation:  &'a SimulationResult,
    /// Case version the settlement commits at.
    pub version:     CaseVersion,
    pub at:          DateTime<Utc>,
}

/// Decide the tracker writes for `settlement` given the case's outstanding
/// tracker, if any.
///
/// In order:
/// 1. a Pending tracker is settled by a New decision starting after its
///    source period;
/// 2. an outstanding tracker is annulled when the batch pays its source
///    period again in full;
/// 3. a Created tracker becomes Pending;
/// 4. a reduction the batch cannot net away creates a tracker, which
///    requires that none is outstanding after steps 1 and 2.
pub fn adjudicate(
    outstanding: Option<&AnticipatedClawback>,
    settlement: &Settlement<'_>,
) -> Result<Vec<ClawbackAction>, InvariantViolation> {
    let mut actions = Vec::new();
    let mut still_outstanding = None;

    if let Some(tracker) = outstanding.filter(|t| t.state.is_outstanding()) {
        let advanced = if qualifies_for_settlement(tracker, settlement.decision) {
            tracker.settle(settlement.decision_id, settlement.version, settlement.at)?
        } else if settlement.simulation.repaid_within(&tracker.source_period) >= tracker.amount {
            tracker.annul(settlement.batch_id, settlement.version, settlement.at)?
        } else if tracker.state == ClawbackState::Created {
            tracker.mark_pending(settlement.version, settlement.at)?
        } else {
            tracker.clone()
        };
        if advanced.state.is_outstanding() {
            still_outstanding = Some(advanced.state.clone());
        }
        if advanced.state != tracker.state {
            actions.push(ClawbackAction::Advance {
                from:    tracker.state.clone(),
                tracker: advanced,
            });
        }
    }

    let unrecovered = settlement.simulation.net_amount.saturating_neg();
    if unrecovered > 0 {
        if let Some(state) = still_outstanding {
            return Err(InvariantViolation::ClawbackAlreadyOutstanding {
                case_id: settlement.case_id.to_string(),
                state:   state.to_string(),
            });
        }
        let source_period = settlement
            .simulation
            .overpaid_period()
            .or_else(|| {
                let first = settlement.simulation.months.first()?.month;
                let last = settlement.simulation.months.last()?.month;
                Period::months_between(first, last).ok()
            });
        if let Some(source_period) = source_period {
            actions.push(ClawbackAction::Create(AnticipatedClawback {
                id: new_id("clawback"),
                case_id: settlement.case_id.to_string(),
                amount: unrecovered,
                source_period,
                state: ClawbackState::Created,
                created_by_batch: settlement.batch_id.to_string(),
                case_version: settlement.version,
                created_at: settlement.at,
                updated_at: settlement.at,
            }));
        }
    }
    Ok(actions)
}

fn qualifies_for_settlement(tracker: &AnticipatedClawback, decision: &Decision) -> bool {
    match decision {
        Decision::New(params) => {
            tracker.state == ClawbackState::Pending
                && params.period.first_month() > tracker.source_period.last_month()
        }
        Decision::Halt(_) | Decision::Resume | Decision::Cease(_) => false,
    }
}
