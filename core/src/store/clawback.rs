//! Store functions for claw-back trackers.

use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{parse_date, parse_instant, unknown_value, SettlementStore};
use crate::{
    clawback::{AnticipatedClawback, ClawbackState},
    error::{InvariantViolation, SettleResult},
    period::Period,
};

const COLUMNS: &str = "clawback_id, case_id, state, amount, source_from, source_to,
                       linked_action_id, annulled_by, created_by_batch, case_version,
                       created_at, updated_at";

fn from_row(row: &Row<'_>) -> rusqlite::Result<AnticipatedClawback> {
    let state: String = row.get(2)?;
    let linked: Option<String> = row.get(6)?;
    let annulled_by: Option<String> = row.get(7)?;
    let state = match (state.as_str(), linked, annulled_by) {
        ("created", _, _) => ClawbackState::Created,
        ("pending", _, _) => ClawbackState::Pending,
        ("settled", Some(linked_action_id), _) => ClawbackState::Settled { linked_action_id },
        ("annulled", _, Some(by_batch_id)) => ClawbackState::Annulled { by_batch_id },
        (other, _, _) => return Err(unknown_value(2, "claw-back state", other)),
    };
    let from = parse_date(4, row.get(4)?)?;
    let to = parse_date(5, row.get(5)?)?;
    let source_period = Period::new(from, to).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(AnticipatedClawback {
        id: row.get(0)?,
        case_id: row.get(1)?,
        amount: row.get(3)?,
        source_period,
        state,
        created_by_batch: row.get(8)?,
        case_version: row.get::<_, i64>(9)? as u64,
        created_at: parse_instant(10, row.get(10)?)?,
        updated_at: parse_instant(11, row.get(11)?)?,
    })
}

/// The case's Created or Pending tracker, if any.
pub fn outstanding(conn: &Connection, case_id: &str) -> SettleResult<Option<AnticipatedClawback>> {
    let tracker = conn
        .query_row(
            &format!(
                "SELECT {COLUMNS} FROM clawback
                 WHERE case_id = ?1 AND state IN ('created', 'pending')"
            ),
            params![case_id],
            from_row,
        )
        .optional()?;
    Ok(tracker)
}

pub fn insert(conn: &Connection, tracker: &AnticipatedClawback) -> SettleResult<()> {
    conn.execute(
        &format!(
            "INSERT INTO clawback ({COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
        ),
        params![
            tracker.id,
            tracker.case_id,
            tracker.state.as_str(),
            tracker.amount,
            tracker.source_period.from_date().to_string(),
            tracker.source_period.to_date().to_string(),
            linked_action(&tracker.state),
            annulled_by(&tracker.state),
            tracker.created_by_batch,
            tracker.case_version as i64,
            tracker.created_at.to_rfc3339(),
            tracker.updated_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

/// Move a tracker out of `from`. Fails if the row is no longer in `from`.
pub fn advance(conn: &Connection, from: &ClawbackState, tracker: &AnticipatedClawback) -> SettleResult<()> {
    let updated = conn.execute(
        "UPDATE clawback
         SET state = ?1, linked_action_id = ?2, annulled_by = ?3, case_version = ?4, updated_at = ?5
         WHERE clawback_id = ?6 AND state = ?7",
        params![
            tracker.state.as_str(),
            linked_action(&tracker.state),
            annulled_by(&tracker.state),
            tracker.case_version as i64,
            tracker.updated_at.to_rfc3339(),
            tracker.id,
            from.as_str(),
        ],
    )?;
    if updated == 0 {
        return Err(InvariantViolation::ClawbackTransition {
            clawback_id: tracker.id.clone(),
            from:        from.to_string(),
            to:          tracker.state.to_string(),
        }
        .into());
    }
    Ok(())
}

fn linked_action(state: &ClawbackState) -> Option<&str> {
    match state {
        ClawbackState::Settled { linked_action_id } => Some(linked_action_id.as_str()),
        _ => None,
    }
}

fn annulled_by(state: &ClawbackState) -> Option<&str> {
    match state {
        ClawbackState::Annulled { by_batch_id } => Some(by_batch_id.as_str()),
        _ => None,
    }
}

impl SettlementStore {
    pub fn outstanding_clawback(&self, case_id: &str) -> SettleResult<Option<AnticipatedClawback>> {
        outstanding(&self.conn, case_id)
    }

    /// Every tracker the case ever had, oldest first.
    pub fn clawbacks_for_case(&self, case_id: &str) -> SettleResult<Vec<AnticipatedClawback>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {COLUMNS} FROM clawback WHERE case_id = ?1 ORDER BY created_at ASC, rowid ASC"
        ))?;
        let trackers = stmt
            .query_map(params![case_id], from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(trackers)
    }
}
