//! SQLite persistence layer.
//!
//! RULE: Only the store talks to the database.
//! The saga calls store functions; it never executes SQL directly.
//!
//! Functions that must run inside the settlement transaction take a
//! `&Connection` (a `Transaction` derefs to one) and live in the submodules.
//! `SettlementStore` methods wrap them for reads outside a transaction.

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, types::Type, Connection, OptionalExtension, Transaction, TransactionBehavior};
use serde::de::DeserializeOwned;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use crate::{
    batch::PaymentBatch,
    error::{InvariantViolation, SettleError, SettleResult},
    event::EventLogEntry,
    types::{CaseId, CaseVersion},
};

pub mod batch;
pub mod clawback;
pub mod outbox;

pub use batch::AppendOutcome;

/// A case as read at one point in time.
#[derive(Debug, Clone)]
pub struct CaseSnapshot {
    pub case_id: CaseId,
    pub version: CaseVersion,
    /// Oldest first.
    pub chain:   Vec<PaymentBatch>,
}

pub struct SettlementStore {
    conn:           Connection,
    path:           Option<String>, // None for :memory:, Some(path) for file
    in_transaction: Arc<AtomicBool>,
}

/// Raised while a write transaction is open; cleared when it ends either way.
pub struct TransactionGuard {
    flag: Arc<AtomicBool>,
}

impl Drop for TransactionGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

impl SettlementStore {
    pub fn open(path: &str) -> SettleResult<Self> {
        if path == ":memory:" {
            return Self::in_memory();
        }
        let conn = Connection::open_with_flags(
            path,
            rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                | rusqlite::OpenFlags::SQLITE_OPEN_URI,
        )?;
        let _ = conn.execute_batch("PRAGMA journal_mode=WAL;");
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Ok(Self {
            conn,
            path: Some(path.to_string()),
            in_transaction: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Open an in-memory database (used in tests).
    pub fn in_memory() -> SettleResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Ok(Self {
            conn,
            path: None,
            in_transaction: Arc::new(AtomicBool::new(false)),
        })
    }

    /// A second connection to the same database file.
    /// An in-memory store gets a fresh, isolated database.
    pub fn reopen(&self) -> SettleResult<Self> {
        match &self.path {
            Some(p) => Self::open(p),
            None => Self::in_memory(),
        }
    }

    /// Apply all schema migrations in order.
    pub fn migrate(&self) -> SettleResult<()> {
        self.conn
            .execute_batch(include_str!("../../../migrations/001_foundation.sql"))?;
        self.conn
            .execute_batch(include_str!("../../../migrations/002_payment_chain.sql"))?;
        self.conn
            .execute_batch(include_str!("../../../migrations/003_clawback.sql"))?;
        self.conn
            .execute_batch(include_str!("../../../migrations/004_outbox.sql"))?;
        Ok(())
    }

    // ── Transactions ───────────────────────────────────────────

    /// Begin the write transaction of one settlement. The write lock is taken
    /// up front so two settlements never interleave their writes.
    pub fn begin(&mut self) -> SettleResult<(Transaction<'_>, TransactionGuard)> {
        let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        self.in_transaction.store(true, Ordering::SeqCst);
        let guard = TransactionGuard {
            flag: Arc::clone(&self.in_transaction),
        };
        Ok((tx, guard))
    }

    /// Shared flag that is `true` exactly while `begin`'s transaction is open.
    pub fn transaction_probe(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.in_transaction)
    }

    // ── Cases ──────────────────────────────────────────────────

    pub fn create_case(&self, case_id: &str, at: DateTime<Utc>) -> SettleResult<()> {
        self.conn.execute(
            "INSERT INTO case_record (case_id, version, created_at) VALUES (?1, 0, ?2)",
            params![case_id, at.to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn case_version(&self, case_id: &str) -> SettleResult<Option<CaseVersion>> {
        case_version(&self.conn, case_id)
    }

    pub fn case_ids(&self) -> SettleResult<Vec<CaseId>> {
        let mut stmt = self.conn.prepare("SELECT case_id FROM case_record ORDER BY case_id")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(ids)
    }

    /// Version and chain, read in one transaction so they agree.
    pub fn load(&self, case_id: &str) -> SettleResult<CaseSnapshot> {
        let tx = self.conn.unchecked_transaction()?;
        let version = case_version(&tx, case_id)?.ok_or_else(|| SettleError::CaseNotFound {
            case_id: case_id.to_string(),
        })?;
        let chain = batch::load_chain(&tx, case_id)?;
        tx.finish()?;

        if chain.len() as u64 != version {
            log::error!(
                "[{case_id}] case version {version} but chain holds {} batches",
                chain.len()
            );
            return Err(InvariantViolation::ChainBroken {
                batch_id: chain.last().map(|b| b.id.clone()).unwrap_or_default(),
                reason:   format!("case version {version} disagrees with chain length {}", chain.len()),
            }
            .into());
        }
        Ok(CaseSnapshot {
            case_id: case_id.to_string(),
            version,
            chain,
        })
    }

    // ── Event log ──────────────────────────────────────────────

    pub fn append_event(&self, entry: &EventLogEntry) -> SettleResult<()> {
        self.conn.execute(
            "INSERT INTO event_log (case_id, event_type, payload, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                entry.case_id,
                entry.event_type,
                entry.payload,
                entry.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn events_for_case(&self, case_id: &str) -> SettleResult<Vec<EventLogEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, case_id, event_type, payload, created_at
             FROM event_log WHERE case_id = ?1
             ORDER BY id ASC",
        )?;
        let entries = stmt
            .query_map(params![case_id], |row| {
                Ok(EventLogEntry {
                    id:         Some(row.get(0)?),
                    case_id:    row.get(1)?,
                    event_type: row.get(2)?,
                    payload:    row.get(3)?,
                    created_at: parse_instant(4, row.get(4)?)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }
}

pub(crate) fn case_version(conn: &Connection, case_id: &str) -> SettleResult<Option<CaseVersion>> {
    let version: Option<i64> = conn
        .query_row(
            "SELECT version FROM case_record WHERE case_id = ?1",
            params![case_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(version.map(|v| v as CaseVersion))
}

// ── Column decoding ────────────────────────────────────────────

fn conversion_error<E>(idx: usize, e: E) -> rusqlite::Error
where
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into())
}

pub(crate) fn parse_date(idx: usize, raw: String) -> rusqlite::Result<NaiveDate> {
    raw.parse::<NaiveDate>().map_err(|e| conversion_error(idx, e))
}

pub(crate) fn parse_instant(idx: usize, raw: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

pub(crate) fn parse_json<T: DeserializeOwned>(idx: usize, raw: String) -> rusqlite::Result<T> {
    serde_json::from_str(&raw).map_err(|e| conversion_error(idx, e))
}

pub(crate) fn unknown_value(idx: usize, what: &str, raw: &str) -> rusqlite::Error {
    conversion_error(idx, format!("unknown {what} '{raw}'"))
}
