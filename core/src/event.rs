//! Settlement events, written to the event log after a transaction commits.
//!
//! RULE: Events describe what already happened. Nothing reads them back to
//! make a settlement decision, and failing to write one never undoes a
//! committed settlement.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    batch::{BatchKind, Receipt},
    error::SettleResult,
    period::Period,
    saga::FailureReason,
    types::{Amount, BatchId, CaseId, CaseVersion, DecisionId},
};

/// Variants are only ever appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SettlementEvent {
    BatchCommitted {
        case_id:     CaseId,
        batch_id:    BatchId,
        decision_id: DecisionId,
        kind:        BatchKind,
        version:     CaseVersion,
        net_amount:  Amount,
    },
    SettlementFailed {
        case_id: CaseId,
        reason:  FailureReason,
        message: String,
    },
    ReceiptRecorded {
        case_id:  CaseId,
        batch_id: BatchId,
        receipt:  Receipt,
    },

    // ── Claw-back ──────────────────────────────────
    ClawbackCreated {
        case_id:       CaseId,
        clawback_id:   String,
        amount:        Amount,
        source_period: Period,
    },
    ClawbackPending {
        case_id:     CaseId,
        clawback_id: String,
    },
    ClawbackSettled {
        case_id:          CaseId,
        clawback_id:      String,
        linked_action_id: DecisionId,
    },
    ClawbackAnnulled {
        case_id:     CaseId,
        clawback_id: String,
        by_batch_id: BatchId,
    },
}

impl SettlementEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::BatchCommitted { .. } => "batch_committed",
            Self::SettlementFailed { .. } => "settlement_failed",
            Self::ReceiptRecorded { .. } => "receipt_recorded",
            Self::ClawbackCreated { .. } => "clawback_created",
            Self::ClawbackPending { .. } => "clawback_pending",
            Self::ClawbackSettled { .. } => "clawback_settled",
            Self::ClawbackAnnulled { .. } => "clawback_annulled",
        }
    }

    pub fn case_id(&self) -> &str {
        match self {
            Self::BatchCommitted { case_id, .. }
            | Self::SettlementFailed { case_id, .. }
            | Self::ReceiptRecorded { case_id, .. }
            | Self::ClawbackCreated { case_id, .. }
            | Self::ClawbackPending { case_id, .. }
            | Self::ClawbackSettled { case_id, .. }
            | Self::ClawbackAnnulled { case_id, .. } => case_id,
        }
    }
}

/// The event log entry as persisted to SQLite.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventLogEntry {
    pub id:         Option<i64>,
    pub case_id:    CaseId,
    pub event_type: String,
    pub payload:    String, // JSON-serialized SettlementEvent
    pub created_at: DateTime<Utc>,
}

impl EventLogEntry {
    pub fn from_event(event: &SettlementEvent, at: DateTime<Utc>) -> SettleResult<Self> {
        Ok(Self {
            id:         None,
            case_id:    event.case_id().to_string(),
            event_type: event.event_type().to_string(),
            payload:    serde_json::to_string(event)?,
            created_at: at,
        })
    }

    pub fn event(&self) -> SettleResult<SettlementEvent> {
        Ok(serde_json::from_str(&self.payload)?)
    }
}
