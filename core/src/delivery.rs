//! Outbound delivery of committed batches.
//!
//! Enqueueing writes an outbox row inside the settlement transaction, so a
//! batch is queued if and only if its decision is committed. The relay hands
//! committed rows to the real transport afterwards.

use chrono::{DateTime, Utc};
use rusqlite::Transaction;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    batch::PaymentBatch,
    error::SettleResult,
    store::SettlementStore,
    types::{BatchId, CaseId, DecisionId},
};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("delivery channel rejected batch {batch_id}: {reason}")]
    Rejected { batch_id: BatchId, reason: String },

    #[error("delivery channel unavailable: {0}")]
    Unavailable(String),

    #[error("could not write the outbox: {0}")]
    Outbox(String),
}

/// What the disbursement system receives for one batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryPayload {
    pub decision_id: DecisionId,
    pub batch:       PaymentBatch,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxMessage {
    pub id:          i64,
    pub batch_id:    BatchId,
    pub case_id:     CaseId,
    pub payload:     DeliveryPayload,
    pub enqueued_at: DateTime<Utc>,
    pub attempts:    u32,
}

/// Hands a batch to delivery as part of an open transaction.
pub trait OutboundDelivery: Send + Sync {
    fn enqueue(
        &self,
        tx: &Transaction<'_>,
        batch_id: &str,
        payload: &DeliveryPayload,
        at: DateTime<Utc>,
    ) -> Result<(), DeliveryError>;
}

/// Default delivery: an outbox row in the same database.
#[derive(Debug, Default, Clone, Copy)]
pub struct OutboxDelivery;

impl OutboundDelivery for OutboxDelivery {
    fn enqueue(
        &self,
        tx: &Transaction<'_>,
        batch_id: &str,
        payload: &DeliveryPayload,
        at: DateTime<Utc>,
    ) -> Result<(), DeliveryError> {
        crate::store::outbox::insert(tx, batch_id, payload, at)
            .map_err(|e| DeliveryError::Outbox(e.to_string()))
    }
}

/// The transport the relay delivers to once a transaction has committed.
pub trait DeliverySink: Send + Sync {
    fn deliver(&self, message: &OutboxMessage) -> Result<(), DeliveryError>;
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RelayReport {
    pub delivered: usize,
    pub failed:    usize,
}

/// Drains pending outbox rows into a sink, oldest first.
pub struct OutboxRelay;

impl OutboxRelay {
    /// A failed row stays pending with its attempt count bumped; rows after
    /// it for the same case are held back so batches arrive in chain order.
    pub fn drain(store: &SettlementStore, sink: &dyn DeliverySink, now: DateTime<Utc>) -> SettleResult<RelayReport> {
        let mut report = RelayReport::default();
        let mut blocked: Vec<CaseId> = Vec::new();
        for message in store.pending_outbox()? {
            if blocked.contains(&message.case_id) {
                continue;
            }
            match sink.deliver(&message) {
                Ok(()) => {
                    store.mark_outbox_delivered(message.id, now)?;
                    report.delivered += 1;
                }
                Err(e) => {
                    log::warn!("[{}] delivery of batch {} failed: {e}", message.case_id, message.batch_id);
                    store.record_outbox_attempt(message.id)?;
                    blocked.push(message.case_id.clone());
                    report.failed += 1;
                }
            }
        }
        if report.delivered + report.failed > 0 {
            log::debug!("outbox relay: {} delivered, {} failed", report.delivered, report.failed);
        }
        Ok(report)
    }
}
