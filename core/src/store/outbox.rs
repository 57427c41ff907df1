//! Store functions for the delivery outbox.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};

use super::{parse_instant, parse_json, SettlementStore};
use crate::{
    delivery::{DeliveryPayload, OutboxMessage},
    error::SettleResult,
};

pub fn insert(conn: &Connection, batch_id: &str, payload: &DeliveryPayload, at: DateTime<Utc>) -> SettleResult<()> {
    conn.execute(
        "INSERT INTO outbox (batch_id, case_id, payload, enqueued_at) VALUES (?1, ?2, ?3, ?4)",
        params![
            batch_id,
            payload.batch.case_id,
            serde_json::to_string(payload)?,
            at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

impl SettlementStore {
    /// Undelivered rows, oldest first.
    pub fn pending_outbox(&self) -> SettleResult<Vec<OutboxMessage>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, batch_id, case_id, payload, enqueued_at, attempts
             FROM outbox WHERE delivered_at IS NULL
             ORDER BY id ASC",
        )?;
        let messages = stmt
            .query_map([], |row| {
                Ok(OutboxMessage {
                    id:          row.get(0)?,
                    batch_id:    row.get(1)?,
                    case_id:     row.get(2)?,
                    payload:     parse_json(3, row.get(3)?)?,
                    enqueued_at: parse_instant(4, row.get(4)?)?,
                    attempts:    row.get::<_, i64>(5)? as u32,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(messages)
    }

    pub fn mark_outbox_delivered(&self, id: i64, at: DateTime<Utc>) -> SettleResult<()> {
        self.conn.execute(
            "UPDATE outbox SET delivered_at = ?1, attempts = attempts + 1 WHERE id = ?2",
            params![at.to_rfc3339(), id],
        )?;
        Ok(())
    }

    pub fn record_outbox_attempt(&self, id: i64) -> SettleResult<()> {
        self.conn.execute("UPDATE outbox SET attempts = attempts + 1 WHERE id = ?1", params![id])?;
        Ok(())
    }

    /// Number of outbox rows for a case, delivered or not.
    pub fn outbox_count(&self, case_id: &str) -> SettleResult<i64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM outbox WHERE case_id = ?1",
            params![case_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}
