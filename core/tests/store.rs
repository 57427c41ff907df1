//! Store-level guarantees: append-only tables, receipts, outbox relay.

mod common;

use common::*;
use rusqlite::Connection;
use settlement_core::{
    batch::{BatchStatus, Receipt},
    delivery::{DeliveryError, DeliverySink, OutboxMessage},
    error::{InvariantViolation, SettleError},
    event::SettlementEvent,
    store::SettlementStore,
    types::new_id,
};
use std::sync::Mutex;

fn temp_db() -> String {
    std::env::temp_dir()
        .join(format!("{}.db", new_id("settle-store")))
        .to_string_lossy()
        .to_string()
}

#[test]
fn migrate_is_idempotent() {
    let store = SettlementStore::in_memory().unwrap();
    store.migrate().unwrap();
    store.migrate().unwrap();
    assert!(store.case_ids().unwrap().is_empty());
}

#[test]
fn batches_and_lines_cannot_be_changed_after_commit() {
    let path = temp_db();
    let store = SettlementStore::open(&path).unwrap();
    store.migrate().unwrap();
    let mut h = Harness::with_store(store, date(2024, 2, 1), settlement_core::config::SettlementConfig::default_test());
    h.open("case-ro");
    assert_committed(&h.settle("case-ro", new_payment(ym(2024, 1), ym(2024, 3), 1000.0)));

    let raw = Connection::open(&path).unwrap();
    let update = raw.execute("UPDATE payment_line SET detail = '{}' WHERE 1 = 1", []);
    assert!(update.is_err(), "payment_line accepted an update");
    let delete = raw.execute("DELETE FROM payment_batch", []);
    assert!(delete.is_err(), "payment_batch accepted a delete");
    let err = update.unwrap_err().to_string();
    assert!(err.contains("append-only"), "unexpected error: {err}");

    assert_eq!(h.saga.store().chain("case-ro").unwrap()[0].lines().len(), 3);
    drop(raw);
    let _ = std::fs::remove_file(&path);
}

#[test]
fn receipt_is_recorded_once() {
    let mut h = Harness::new(date(2024, 2, 1));
    h.open("case-rcpt");
    let report = h.settle("case-rcpt", new_payment(ym(2024, 1), ym(2024, 2), 400.0));
    let batch_id = report.batch_id().unwrap().to_string();

    assert_eq!(h.saga.store().chain("case-rcpt").unwrap()[0].status(), BatchStatus::Sent);
    h.saga.record_receipt(&batch_id, Receipt::Ok).unwrap();
    assert_eq!(h.saga.store().chain("case-rcpt").unwrap()[0].status(), BatchStatus::ConfirmedOk);

    let second = h.saga.record_receipt(&batch_id, Receipt::WithError);
    assert!(matches!(
        second,
        Err(SettleError::Invariant(InvariantViolation::StatusRegression { .. }))
    ));

    let missing = h.saga.record_receipt("batch-unknown", Receipt::Ok);
    assert!(matches!(missing, Err(SettleError::BatchNotFound { .. })));

    let receipts: Vec<SettlementEvent> = h
        .saga
        .store()
        .events_for_case("case-rcpt")
        .unwrap()
        .iter()
        .map(|e| e.event().unwrap())
        .filter(|e| matches!(e, SettlementEvent::ReceiptRecorded { .. }))
        .collect();
    assert_eq!(receipts.len(), 1);
}

#[test]
fn rejected_batch_stops_paying() {
    let mut h = Harness::new(date(2024, 2, 1));
    h.open("case-err");
    assert_committed(&h.settle("case-err", new_payment(ym(2024, 1), ym(2024, 4), 400.0)));
    let report = h.settle("case-err", new_payment(ym(2024, 3), ym(2024, 4), 900.0));
    h.saga.record_receipt(report.batch_id().unwrap(), Receipt::WithError).unwrap();

    let timeline = h.timeline("case-err");
    assert_eq!(timeline.paid_amount(ym(2024, 3)), 400);
    assert_eq!(h.saga.store().chain("case-err").unwrap().len(), 2, "the batch itself is kept");
}

/// Sink that refuses everything until told otherwise.
struct FlakySink {
    up:        Mutex<bool>,
    delivered: Mutex<Vec<String>>,
}

impl DeliverySink for FlakySink {
    fn deliver(&self, message: &OutboxMessage) -> Result<(), DeliveryError> {
        if !*self.up.lock().unwrap() {
            return Err(DeliveryError::Unavailable("disbursement offline".into()));
        }
        self.delivered.lock().unwrap().push(message.batch_id.clone());
        Ok(())
    }
}

#[test]
fn relay_keeps_failed_rows_and_preserves_chain_order() {
    let mut h = Harness::new(date(2024, 2, 1));
    h.open("case-relay");
    // Settle without relaying so rows pile up.
    for m in 1..=3 {
        let request = h.request("case-relay", new_payment(ym(2024, m), ym(2024, m), 300.0));
        assert_committed(&h.saga.settle(request));
    }
    let sink = FlakySink { up: Mutex::new(false), delivered: Mutex::new(Vec::new()) };

    let report = h.saga.relay(&sink).unwrap();
    assert_eq!((report.delivered, report.failed), (0, 1), "later rows wait behind the failed one");
    let pending = h.saga.store().pending_outbox().unwrap();
    assert_eq!(pending.len(), 3);
    assert_eq!(pending[0].attempts, 1);

    *sink.up.lock().unwrap() = true;
    let report = h.saga.relay(&sink).unwrap();
    assert_eq!(report.delivered, 3);
    let chain_ids: Vec<String> = h.saga.store().chain("case-relay").unwrap().into_iter().map(|b| b.id).collect();
    assert_eq!(*sink.delivered.lock().unwrap(), chain_ids);
    assert!(h.saga.store().pending_outbox().unwrap().is_empty());
}

#[test]
fn events_round_trip_through_the_log() {
    let mut h = Harness::new(date(2024, 7, 10));
    h.open("case-log");
    assert_committed(&h.settle("case-log", new_payment(ym(2024, 1), ym(2024, 2), 1000.0)));
    assert_committed(&h.settle("case-log", new_payment(ym(2024, 1), ym(2024, 2), 800.0)));

    let events: Vec<SettlementEvent> = h
        .saga
        .store()
        .events_for_case("case-log")
        .unwrap()
        .iter()
        .map(|e| e.event().unwrap())
        .collect();
    let created = events
        .iter()
        .find_map(|e| match e {
            SettlementEvent::ClawbackCreated { amount, .. } => Some(*amount),
            _ => None,
        })
        .expect("claw-back event logged");
    assert_eq!(created, 400);
    assert!(events.iter().all(|e| e.case_id() == "case-log"));
}
