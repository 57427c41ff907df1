//! Shared fixtures for the settlement integration tests.
#![allow(dead_code)]

use chrono::NaiveDate;
use rusqlite::Transaction;
use settlement_core::{
    batch::PaymentBatch,
    clock::{Clock, FixedClock},
    config::SettlementConfig,
    decision::{Calculation, CeasePayment, Decision, HaltPayment, NewPayment},
    delivery::{DeliveryError, DeliveryPayload, DeliverySink, OutboundDelivery, OutboxMessage},
    line::RetroPayment,
    period::{Period, YearMonth},
    saga::{SettlementReport, SettlementRequest, SettlementSaga},
    simulation::{SimulationError, SimulationOracle, SimulationResult, StubOracle},
    store::SettlementStore,
    timeline::Timeline,
    types::CaseVersion,
};
use std::collections::VecDeque;
use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc, Mutex,
};
use std::time::Duration;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn ym(year: i32, month: u32) -> YearMonth {
    YearMonth::new(year, month).unwrap()
}

pub fn date(year: i32, month: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, day).unwrap()
}

pub fn months(from: YearMonth, to: YearMonth) -> Period {
    Period::months_between(from, to).unwrap()
}

/// New payment of a flat monthly `amount` over `from..=to`.
pub fn new_payment(from: YearMonth, to: YearMonth, amount: f64) -> Decision {
    let period = months(from, to);
    Decision::New(NewPayment {
        period,
        calculations: vec![Calculation { period, amount }],
        retro: RetroPayment::AsSoonAsPossible,
    })
}

pub fn halt_from(month: YearMonth) -> Decision {
    Decision::Halt(HaltPayment { from: month.first_day() })
}

pub fn cease_from(month: YearMonth) -> Decision {
    Decision::Cease(CeasePayment { period: Period::single(month) })
}

// ── Oracle ──────────────────────────────────────────────────────────

type Hook = Box<dyn FnOnce() + Send>;

/// Stub oracle with knobs: queued answers, an artificial delay, a hook run
/// on the next call, and a record of whether a store transaction was open
/// while it was being asked.
pub struct ScriptedOracle {
    stub:                 StubOracle,
    scripted:             Mutex<VecDeque<Result<SimulationResult, SimulationError>>>,
    delay:                Mutex<Option<Duration>>,
    hook:                 Mutex<Option<Hook>>,
    probe:                Mutex<Option<Arc<AtomicBool>>>,
    pub calls:            AtomicUsize,
    pub saw_transaction:  AtomicBool,
}

impl ScriptedOracle {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            stub:            StubOracle::new(clock),
            scripted:        Mutex::new(VecDeque::new()),
            delay:           Mutex::new(None),
            hook:            Mutex::new(None),
            probe:           Mutex::new(None),
            calls:           AtomicUsize::new(0),
            saw_transaction: AtomicBool::new(false),
        }
    }

    pub fn answer_next(&self, answer: Result<SimulationResult, SimulationError>) {
        self.scripted.lock().unwrap().push_back(answer);
    }

    pub fn delay_by(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn on_next_call(&self, hook: impl FnOnce() + Send + 'static) {
        *self.hook.lock().unwrap() = Some(Box::new(hook));
    }

    pub fn watch(&self, probe: Arc<AtomicBool>) {
        *self.probe.lock().unwrap() = Some(probe);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl SimulationOracle for ScriptedOracle {
    fn simulate(
        &self,
        batch: &PaymentBatch,
        window: Period,
        timeout: Duration,
    ) -> Result<SimulationResult, SimulationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(probe) = self.probe.lock().unwrap().as_ref() {
            if probe.load(Ordering::SeqCst) {
                self.saw_transaction.store(true, Ordering::SeqCst);
            }
        }
        let hook = self.hook.lock().unwrap().take();
        if let Some(hook) = hook {
            hook();
        }
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        let scripted = self.scripted.lock().unwrap().pop_front();
        match scripted {
            Some(answer) => answer,
            None => self.stub.simulate(batch, window, timeout),
        }
    }
}

impl DeliverySink for ScriptedOracle {
    fn deliver(&self, message: &OutboxMessage) -> Result<(), DeliveryError> {
        self.stub.deliver(message)
    }
}

/// Delivery that refuses every enqueue.
pub struct FailingDelivery;

impl OutboundDelivery for FailingDelivery {
    fn enqueue(
        &self,
        _tx: &Transaction<'_>,
        batch_id: &str,
        _payload: &DeliveryPayload,
        _at: chrono::DateTime<chrono::Utc>,
    ) -> Result<(), DeliveryError> {
        Err(DeliveryError::Unavailable(format!("queue down while enqueuing {batch_id}")))
    }
}

// ── Harness ─────────────────────────────────────────────────────────

pub struct Harness {
    pub saga:   SettlementSaga,
    pub oracle: Arc<ScriptedOracle>,
    pub clock:  Arc<FixedClock>,
}

impl Harness {
    /// Fresh in-memory store, halt month window off.
    pub fn new(today: NaiveDate) -> Self {
        let store = SettlementStore::in_memory().unwrap();
        store.migrate().unwrap();
        Self::with_store(store, today, SettlementConfig::default_test())
    }

    pub fn with_store(store: SettlementStore, today: NaiveDate, config: SettlementConfig) -> Self {
        init_logging();
        let clock = Arc::new(FixedClock::on(today));
        let oracle = Arc::new(ScriptedOracle::new(clock.clone()));
        let saga = SettlementSaga::new(store, oracle.clone(), clock.clone(), config);
        Self { saga, oracle, clock }
    }

    pub fn open(&self, case_id: &str) {
        self.saga.open_case(case_id).unwrap();
    }

    pub fn version(&self, case_id: &str) -> CaseVersion {
        self.saga.store().case_version(case_id).unwrap().unwrap()
    }

    pub fn request(&self, case_id: &str, decision: Decision) -> SettlementRequest {
        SettlementRequest::new(case_id, self.version(case_id), decision, "caseworker-1")
    }

    /// Settle at the current version, then relay the outbox to the oracle.
    pub fn settle(&mut self, case_id: &str, decision: Decision) -> SettlementReport {
        let request = self.request(case_id, decision);
        self.submit(request)
    }

    pub fn submit(&mut self, request: SettlementRequest) -> SettlementReport {
        let report = self.saga.settle(request);
        self.relay();
        report
    }

    pub fn relay(&self) {
        self.saga.relay(self.oracle.as_ref()).unwrap();
    }

    pub fn timeline(&self, case_id: &str) -> Timeline {
        self.saga.timeline(case_id).unwrap()
    }
}

/// Assert a report committed, with its failure message otherwise.
pub fn assert_committed(report: &SettlementReport) {
    assert!(report.is_committed(), "expected a commit, got {:?}", report.outcome);
}
