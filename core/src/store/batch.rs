//! Store functions for the payment chain: decisions, batches, lines, receipts.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;

use super::{case_version, parse_date, parse_instant, parse_json, unknown_value, SettlementStore};
use crate::{
    batch::{BatchKind, BatchStatus, PaymentBatch, Receipt},
    decision::DecisionRecord,
    error::{InvariantViolation, SettleError, SettleResult},
    line::{LineKind, PaymentLine},
    period::Period,
    simulation::SimulationResult,
    types::{BatchId, CaseId, CaseVersion},
};

/// Result of an optimistic append. `StaleVersion` is a value, not an error:
/// the caller decides whether it aborts the transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Appended { version: CaseVersion },
    StaleVersion { actual: CaseVersion },
}

/// Append `batch` and the decision that produced it, provided the case is
/// still at `expected_version`. Runs inside the caller's transaction.
pub fn append_batch_and_decision(
    conn: &Connection,
    case_id: &str,
    expected_version: CaseVersion,
    batch: &PaymentBatch,
    record: &DecisionRecord,
) -> SettleResult<AppendOutcome> {
    let updated = conn.execute(
        "UPDATE case_record SET version = version + 1
         WHERE case_id = ?1 AND version = ?2",
        params![case_id, expected_version as i64],
    )?;
    if updated == 0 {
        let actual = case_version(conn, case_id)?.ok_or_else(|| SettleError::CaseNotFound {
            case_id: case_id.to_string(),
        })?;
        return Ok(AppendOutcome::StaleVersion { actual });
    }

    let version = expected_version + 1;
    if batch.sequence_no != version {
        return Err(InvariantViolation::ChainBroken {
            batch_id: batch.id.clone(),
            reason:   format!("sequence {} appended at case version {version}", batch.sequence_no),
        }
        .into());
    }

    let simulation = batch.simulation().map(serde_json::to_string).transpose()?;
    conn.execute(
        "INSERT INTO payment_batch
            (case_id, sequence_no, batch_id, kind, previous_batch_id, created_by, created_at, simulation)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            case_id,
            batch.sequence_no as i64,
            batch.id,
            batch.kind.as_str(),
            batch.previous_batch_id,
            batch.created_by,
            batch.created_at.to_rfc3339(),
            simulation,
        ],
    )?;

    let mut insert_line = conn.prepare(
        "INSERT INTO payment_line
            (line_id, batch_id, position, period_from, period_to, kind, detail, supersedes_line_id, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
    )?;
    for (position, line) in batch.lines().iter().enumerate() {
        insert_line.execute(params![
            line.id,
            batch.id,
            position as i64,
            line.period.from_date().to_string(),
            line.period.to_date().to_string(),
            line.kind.name(),
            serde_json::to_string(&line.kind)?,
            line.supersedes,
            line.created_at.to_rfc3339(),
        ])?;
    }

    conn.execute(
        "INSERT INTO decision (decision_id, case_id, batch_id, decided_by, decided_at, payload)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            record.id,
            case_id,
            record.batch_id,
            record.decided_by,
            record.decided_at.to_rfc3339(),
            serde_json::to_string(&record.decision)?,
        ],
    )?;

    Ok(AppendOutcome::Appended { version })
}

/// The whole chain of a case, oldest batch first.
pub fn load_chain(conn: &Connection, case_id: &str) -> SettleResult<Vec<PaymentBatch>> {
    let mut lines = load_lines(conn, case_id)?;

    let mut stmt = conn.prepare(
        "SELECT b.batch_id, b.sequence_no, b.kind, b.previous_batch_id, b.created_by,
                b.created_at, b.simulation, r.receipt
         FROM payment_batch b
         LEFT JOIN batch_receipt r ON r.batch_id = b.batch_id
         WHERE b.case_id = ?1
         ORDER BY b.sequence_no ASC",
    )?;
    let chain = stmt
        .query_map(params![case_id], |row| {
            let id: String = row.get(0)?;
            let kind: String = row.get(2)?;
            let simulation: Option<String> = row.get(6)?;
            let receipt: Option<String> = row.get(7)?;
            let status = match receipt.as_deref() {
                None => BatchStatus::Sent,
                Some(raw) => Receipt::parse(raw)
                    .ok_or_else(|| unknown_value(7, "receipt", raw))?
                    .status(),
            };
            Ok(PaymentBatch {
                case_id: case_id.to_string(),
                kind: BatchKind::parse(&kind).ok_or_else(|| unknown_value(2, "batch kind", &kind))?,
                sequence_no: row.get::<_, i64>(1)? as u64,
                previous_batch_id: row.get(3)?,
                created_by: row.get(4)?,
                created_at: parse_instant(5, row.get(5)?)?,
                status,
                lines: lines.remove(&id).unwrap_or_default(),
                simulation: simulation
                    .map(|raw| parse_json::<SimulationResult>(6, raw))
                    .transpose()?,
                id,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(chain)
}

fn load_lines(conn: &Connection, case_id: &str) -> SettleResult<HashMap<BatchId, Vec<PaymentLine>>> {
    let mut stmt = conn.prepare(
        "SELECT l.batch_id, l.line_id, l.period_from, l.period_to, l.detail,
                l.supersedes_line_id, l.created_at
         FROM payment_line l
         JOIN payment_batch b ON b.batch_id = l.batch_id
         WHERE b.case_id = ?1
         ORDER BY b.sequence_no ASC, l.position ASC",
    )?;
    let rows = stmt
        .query_map(params![case_id], |row| {
            let from = parse_date(2, row.get(2)?)?;
            let to = parse_date(3, row.get(3)?)?;
            let period = Period::new(from, to).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
            })?;
            let batch_id: BatchId = row.get(0)?;
            let line = PaymentLine {
                id:         row.get(1)?,
                period,
                kind:       parse_json::<LineKind>(4, row.get(4)?)?,
                supersedes: row.get(5)?,
                created_at: parse_instant(6, row.get(6)?)?,
            };
            Ok((batch_id, line))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut by_batch: HashMap<BatchId, Vec<PaymentLine>> = HashMap::new();
    for (batch_id, line) in rows {
        by_batch.entry(batch_id).or_default().push(line);
    }
    Ok(by_batch)
}

impl SettlementStore {
    pub fn chain(&self, case_id: &str) -> SettleResult<Vec<PaymentBatch>> {
        load_chain(&self.conn, case_id)
    }

    pub fn decisions_for_case(&self, case_id: &str) -> SettleResult<Vec<DecisionRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT d.decision_id, d.case_id, d.batch_id, d.decided_by, d.decided_at, d.payload
             FROM decision d
             JOIN payment_batch b ON b.batch_id = d.batch_id
             WHERE d.case_id = ?1
             ORDER BY b.sequence_no ASC",
        )?;
        let records = stmt
            .query_map(params![case_id], |row| {
                Ok(DecisionRecord {
                    id:         row.get(0)?,
                    case_id:    row.get(1)?,
                    batch_id:   row.get(2)?,
                    decided_by: row.get(3)?,
                    decided_at: parse_instant(4, row.get(4)?)?,
                    decision:   parse_json(5, row.get(5)?)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// Record the disbursement system's acknowledgment of a sent batch.
    /// A batch takes exactly one receipt; a second is a status regression.
    pub fn record_receipt(&self, batch_id: &str, receipt: Receipt, at: DateTime<Utc>) -> SettleResult<CaseId> {
        let row: Option<(CaseId, Option<String>)> = self
            .conn
            .query_row(
                "SELECT b.case_id, r.receipt
                 FROM payment_batch b
                 LEFT JOIN batch_receipt r ON r.batch_id = b.batch_id
                 WHERE b.batch_id = ?1",
                params![batch_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let (case_id, existing) = row.ok_or_else(|| SettleError::BatchNotFound {
            batch_id: batch_id.to_string(),
        })?;

        let current = match existing.as_deref().and_then(Receipt::parse) {
            Some(prior) => prior.status(),
            None => BatchStatus::Sent,
        };
        if !current.can_advance_to(receipt.status()) {
            log::error!("[{case_id}] batch {batch_id} already {current}, refusing receipt {}", receipt.as_str());
            return Err(InvariantViolation::StatusRegression {
                batch_id: batch_id.to_string(),
                from:     current.to_string(),
                to:       receipt.status().to_string(),
            }
            .into());
        }

        self.conn.execute(
            "INSERT INTO batch_receipt (batch_id, receipt, received_at) VALUES (?1, ?2, ?3)",
            params![batch_id, receipt.as_str(), at.to_rfc3339()],
        )?;
        Ok(case_id)
    }
}
