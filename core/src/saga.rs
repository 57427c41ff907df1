//! The settlement saga: decision in, committed and enqueued batch out.
//!
//! EXECUTION ORDER (fixed, never reordered):
//!   1. Validate the decision.                       no I/O
//!   2. Load the case; fail fast on a stale version.  read
//!   3. Legality checks and strategy.                 pure
//!   4. Simulation oracle, with timeout.              external, no transaction
//!   5. Cross-check and control against timeline.     pure
//!   6. One transaction: append batch + decision, adjudicate the claw-back,
//!      enqueue for delivery as the last write, commit.
//!   7. Post-commit events.                           never rolls back 6
//!
//! RULES:
//!   - The oracle is never called while the transaction is open.
//!   - Inside the transaction every failure is an `Err` and leaves through
//!     `?`; dropping the transaction rolls it back. Typed outcomes such as
//!     `AppendOutcome::StaleVersion` are turned into errors first.
//!   - `settle` never returns an error: every failure becomes a
//!     `FailureReason` from a closed set.

use serde::{Deserialize, Serialize};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::{
    batch::{verify_extension, PaymentBatch, Receipt},
    clawback::{self, ClawbackAction, ClawbackState, Settlement},
    clock::Clock,
    config::SettlementConfig,
    decision::{Decision, DecisionRecord},
    delivery::{DeliveryPayload, DeliverySink, OutboundDelivery, OutboxDelivery, OutboxRelay, RelayReport},
    error::{InvariantViolation, SettleError, SettleResult},
    event::{EventLogEntry, SettlementEvent},
    period::YearMonth,
    simulation::{control_against_timeline, cross_check, SimulationError, SimulationOracle, SimulationResult},
    store::{self, AppendOutcome, CaseSnapshot, SettlementStore},
    strategy::{self, StrategyError},
    timeline::Timeline,
    types::{new_id, BatchId, CaseId, CaseVersion},
};

// ── Outcomes ──────────────────────────────────────────────────────

/// Why a settlement failed. A closed set the case-workflow layer can match on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    InvalidInput,
    /// The strategy cannot express the decision on this chain.
    Rejected,
    /// The decision is well-formed but not legal on the current timeline.
    NotAllowed,
    NotFound,
    SimulationFailed,
    ConcurrentModification,
    SimulationMismatch,
    StaleCaseVersion,
    DeliveryFailed,
    Storage,
    InvariantViolation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    Input,
    Concurrency,
    External,
    Invariant,
}

impl FailureReason {
    pub fn of(err: &SettleError) -> Self {
        match err {
            SettleError::Input(_) => Self::InvalidInput,
            SettleError::Strategy(StrategyError::Invariant(_)) | SettleError::Invariant(_) => {
                Self::InvariantViolation
            }
            SettleError::Strategy(_) => Self::Rejected,
            SettleError::NotAllowed(_) => Self::NotAllowed,
            SettleError::CaseNotFound { .. } | SettleError::BatchNotFound { .. } => Self::NotFound,
            SettleError::Simulation(_) => Self::SimulationFailed,
            SettleError::ConcurrentModification => Self::ConcurrentModification,
            SettleError::SimulationMismatch(_) => Self::SimulationMismatch,
            SettleError::StaleCaseVersion { .. } => Self::StaleCaseVersion,
            SettleError::Delivery(_) => Self::DeliveryFailed,
            SettleError::Database(_) | SettleError::Serialization(_) | SettleError::Other(_) => Self::Storage,
        }
    }

    pub fn class(self) -> FailureClass {
        match self {
            Self::InvalidInput | Self::Rejected | Self::NotAllowed | Self::NotFound => FailureClass::Input,
            Self::ConcurrentModification | Self::StaleCaseVersion => FailureClass::Concurrency,
            Self::SimulationFailed | Self::SimulationMismatch | Self::DeliveryFailed | Self::Storage => {
                FailureClass::External
            }
            Self::InvariantViolation => FailureClass::Invariant,
        }
    }

    /// Concurrency failures are retried after a re-read, external ones with backoff.
    pub fn is_retryable(self) -> bool {
        matches!(self.class(), FailureClass::Concurrency | FailureClass::External)
    }
}

/// One step of a saga run, in the order it happened.
///
/// `Enqueued` is recorded before `Committed`: the outbox row is the last
/// write inside the transaction and only becomes visible once the commit
/// lands. Read the pair as "committed, then queued for delivery".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum SagaStep {
    Decided { batch_id: BatchId },
    Simulated { net_amount: i64 },
    CrossChecked,
    TransactionOpened,
    Persisted { version: CaseVersion },
    Enqueued,
    Committed,
    Failed { reason: FailureReason },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SettlementOutcome {
    Committed { batch_id: BatchId, version: CaseVersion },
    Failed { reason: FailureReason, message: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementReport {
    pub case_id: CaseId,
    pub outcome: SettlementOutcome,
    pub trace:   Vec<SagaStep>,
}

impl SettlementReport {
    pub fn is_committed(&self) -> bool {
        matches!(self.outcome, SettlementOutcome::Committed { .. })
    }

    pub fn batch_id(&self) -> Option<&str> {
        match &self.outcome {
            SettlementOutcome::Committed { batch_id, .. } => Some(batch_id.as_str()),
            SettlementOutcome::Failed { .. } => None,
        }
    }

    pub fn failure(&self) -> Option<FailureReason> {
        match &self.outcome {
            SettlementOutcome::Committed { .. } => None,
            SettlementOutcome::Failed { reason, .. } => Some(*reason),
        }
    }

    /// Position of `step` in the trace, compared by variant only.
    pub fn position(&self, step: &SagaStep) -> Option<usize> {
        self.trace
            .iter()
            .position(|s| std::mem::discriminant(s) == std::mem::discriminant(step))
    }
}

// ── Request ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettlementRequest {
    pub case_id:               CaseId,
    /// The version the decision was made on.
    pub expected_version:      CaseVersion,
    pub decision:              Decision,
    pub decided_by:            String,
    /// The simulation the decision was made on, if the caller simulated first.
    #[serde(default)]
    pub prior_simulation:      Option<SimulationResult>,
    #[serde(default)]
    pub simulation_timeout_ms: Option<u64>,
}

impl SettlementRequest {
    pub fn new(case_id: &str, expected_version: CaseVersion, decision: Decision, decided_by: &str) -> Self {
        Self {
            case_id: case_id.to_string(),
            expected_version,
            decision,
            decided_by: decided_by.to_string(),
            prior_simulation: None,
            simulation_timeout_ms: None,
        }
    }

    pub fn with_prior_simulation(mut self, simulation: SimulationResult) -> Self {
        self.prior_simulation = Some(simulation);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.simulation_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }
}

// ── Saga ──────────────────────────────────────────────────────────

struct Prepared {
    snapshot:   CaseSnapshot,
    batch:      PaymentBatch,
    simulation: SimulationResult,
}

struct Committed {
    batch_id: BatchId,
    version:  CaseVersion,
    events:   Vec<SettlementEvent>,
}

pub struct SettlementSaga {
    store:    SettlementStore,
    oracle:   Arc<dyn SimulationOracle>,
    delivery: Box<dyn OutboundDelivery>,
    clock:    Arc<dyn Clock>,
    config:   SettlementConfig,
}

impl SettlementSaga {
    pub fn new(
        store: SettlementStore,
        oracle: Arc<dyn SimulationOracle>,
        clock: Arc<dyn Clock>,
        config: SettlementConfig,
    ) -> Self {
        Self {
            store,
            oracle,
            delivery: Box::new(OutboxDelivery),
            clock,
            config,
        }
    }

    pub fn with_delivery(mut self, delivery: Box<dyn OutboundDelivery>) -> Self {
        self.delivery = delivery;
        self
    }

    pub fn store(&self) -> &SettlementStore {
        &self.store
    }

    pub fn config(&self) -> &SettlementConfig {
        &self.config
    }

    pub fn open_case(&self, case_id: &str) -> SettleResult<()> {
        self.store.create_case(case_id, self.clock.now())?;
        log::info!("[{case_id}] case opened");
        Ok(())
    }

    pub fn timeline(&self, case_id: &str) -> SettleResult<Timeline> {
        let snapshot = self.store.load(case_id)?;
        Ok(Timeline::project(&snapshot.chain)?)
    }

    /// Decide phase: run strategy and oracle without touching the store.
    /// The returned batch's simulation is what `settle` later cross-checks.
    pub fn simulate(&self, request: &SettlementRequest) -> SettleResult<PaymentBatch> {
        let Prepared { batch, simulation, .. } = self.prepare(request, &mut Vec::new())?;
        Ok(batch.into_simulated(simulation)?)
    }

    pub fn settle(&mut self, request: SettlementRequest) -> SettlementReport {
        let case_id = request.case_id.clone();
        let mut trace = Vec::new();
        match self.run(&request, &mut trace) {
            Ok(committed) => {
                log::info!(
                    "[{case_id}] committed {} batch {} at version {}",
                    request.decision.kind().as_str(),
                    committed.batch_id,
                    committed.version
                );
                for event in committed.events {
                    self.emit(event);
                }
                SettlementReport {
                    case_id,
                    outcome: SettlementOutcome::Committed {
                        batch_id: committed.batch_id,
                        version:  committed.version,
                    },
                    trace,
                }
            }
            Err(err) => {
                let reason = FailureReason::of(&err);
                match reason.class() {
                    FailureClass::Invariant => log::error!("[{case_id}] settlement failed: {err}"),
                    _ => log::warn!("[{case_id}] settlement failed ({reason:?}): {err}"),
                }
                trace.push(SagaStep::Failed { reason });
                let message = err.to_string();
                self.emit(SettlementEvent::SettlementFailed {
                    case_id: case_id.clone(),
                    reason,
                    message: message.clone(),
                });
                SettlementReport {
                    case_id,
                    outcome: SettlementOutcome::Failed { reason, message },
                    trace,
                }
            }
        }
    }

    /// Record the disbursement system's receipt for a batch.
    pub fn record_receipt(&self, batch_id: &str, receipt: Receipt) -> SettleResult<()> {
        let case_id = self.store.record_receipt(batch_id, receipt, self.clock.now())?;
        log::info!("[{case_id}] batch {batch_id} confirmed {}", receipt.as_str());
        self.emit(SettlementEvent::ReceiptRecorded {
            case_id,
            batch_id: batch_id.to_string(),
            receipt,
        });
        Ok(())
    }

    /// Hand committed outbox rows to `sink`.
    pub fn relay(&self, sink: &dyn DeliverySink) -> SettleResult<RelayReport> {
        OutboxRelay::drain(&self.store, sink, self.clock.now())
    }

    // ── Phases ─────────────────────────────────────────────────────

    fn prepare(&self, request: &SettlementRequest, trace: &mut Vec<SagaStep>) -> SettleResult<Prepared> {
        let case_id = request.case_id.as_str();
        request.decision.validate()?;

        let snapshot = self.store.load(case_id)?;
        if snapshot.version != request.expected_version {
            return Err(SettleError::StaleCaseVersion {
                case_id:  case_id.to_string(),
                expected: request.expected_version,
                actual:   snapshot.version,
            });
        }

        let timeline = Timeline::project(&snapshot.chain)?;
        self.check_legality(&request.decision, &timeline)?;

        let batch = strategy::generate(
            case_id,
            &snapshot.chain,
            &request.decision,
            &request.decided_by,
            self.clock.as_ref(),
        )?;
        if let Err(violation) = verify_extension(&snapshot.chain, &batch) {
            log::error!("[{case_id}] strategy produced a malformed batch: {violation}");
            return Err(violation.into());
        }
        log::debug!(
            "[{case_id}] decided {} batch {} with {} lines",
            batch.kind.as_str(),
            batch.id,
            batch.lines().len()
        );
        trace.push(SagaStep::Decided { batch_id: batch.id.clone() });

        let simulation = self.call_oracle(request, &batch)?;
        log::debug!("[{case_id}] simulated batch {}: net {}", batch.id, simulation.net_amount);
        trace.push(SagaStep::Simulated { net_amount: simulation.net_amount });

        Ok(Prepared { snapshot, batch, simulation })
    }

    fn check_legality(&self, decision: &Decision, timeline: &Timeline) -> SettleResult<()> {
        match decision {
            Decision::Halt(params) => {
                if self.config.enforce_halt_month_window {
                    let current = YearMonth::of(self.clock.today());
                    let start = YearMonth::of(params.from);
                    if start != current && start != current.next() {
                        return Err(SettleError::NotAllowed(format!(
                            "a halt must start in {current} or {}, not {start}",
                            current.next()
                        )));
                    }
                }
                if timeline.has_future_cease_or_gap(params.from) {
                    return Err(SettleError::NotAllowed(format!(
                        "a cessation or gap follows {}",
                        params.from
                    )));
                }
            }
            Decision::Resume => {
                if let Some(halt) = timeline.latest_halt() {
                    if timeline.has_future_cease_or_gap(halt.period.from_date()) {
                        return Err(SettleError::NotAllowed(format!(
                            "a cessation or gap follows the halt from {}",
                            halt.period.from_date()
                        )));
                    }
                }
            }
            Decision::New(_) | Decision::Cease(_) => {}
        }
        Ok(())
    }

    fn call_oracle(&self, request: &SettlementRequest, batch: &PaymentBatch) -> SettleResult<SimulationResult> {
        let timeout = request
            .simulation_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.config.simulation_timeout());
        let window = batch.period().ok_or(StrategyError::EmptyDecision)?;

        // Runs on its own thread so an oracle that never answers cannot hold
        // the saga past `timeout`. A late answer is dropped with the channel.
        let (tx, rx) = mpsc::channel();
        let oracle = Arc::clone(&self.oracle);
        let pending = batch.clone();
        thread::Builder::new()
            .name(format!("oracle-{}", batch.id))
            .spawn(move || {
                let _ = tx.send(oracle.simulate(&pending, window, timeout));
            })
            .map_err(|e| SimulationError::Unavailable(e.to_string()))?;

        match rx.recv_timeout(timeout) {
            Ok(answer) => Ok(answer?),
            Err(RecvTimeoutError::Timeout) => {
                log::warn!("[{}] oracle gave no answer within {timeout:?}", request.case_id);
                Err(SimulationError::Timeout(timeout).into())
            }
            Err(RecvTimeoutError::Disconnected) => {
                Err(SimulationError::Unavailable("oracle call ended without an answer".into()).into())
            }
        }
    }

    fn run(&mut self, request: &SettlementRequest, trace: &mut Vec<SagaStep>) -> SettleResult<Committed> {
        let case_id = request.case_id.as_str();
        let Prepared { snapshot, batch, simulation } = self.prepare(request, trace)?;

        if !cross_check(request.prior_simulation.as_ref(), &simulation) {
            log::error!(
                "[{case_id}] simulation moved since the decision: prior {} fresh {}",
                serde_json::to_string(&request.prior_simulation)?,
                serde_json::to_string(&simulation)?
            );
            return Err(SettleError::ConcurrentModification);
        }
        let after = Timeline::project_with(&snapshot.chain, &batch)?;
        if let Err(mismatch) = control_against_timeline(&simulation, &after) {
            log::error!("[{case_id}] oracle disagrees with the timeline: {mismatch}");
            return Err(SettleError::SimulationMismatch(mismatch));
        }
        trace.push(SagaStep::CrossChecked);

        let now = self.clock.now();
        let version = snapshot.version + 1;
        let batch = batch.into_simulated(simulation.clone())?.into_sent()?;
        let record = DecisionRecord {
            id:         new_id("decision"),
            case_id:    case_id.to_string(),
            batch_id:   batch.id.clone(),
            decided_by: request.decided_by.clone(),
            decided_at: now,
            decision:   request.decision.clone(),
        };
        let settlement = Settlement {
            case_id,
            batch_id: &batch.id,
            decision_id: &record.id,
            decision: &request.decision,
            simulation: &simulation,
            version,
            at: now,
        };

        // A reduction against an outstanding claw-back is refused here, before
        // any write. Inside the transaction the same finding is a defect.
        let outstanding = self.store.outstanding_clawback(case_id)?;
        if let Err(InvariantViolation::ClawbackAlreadyOutstanding { state, .. }) =
            clawback::adjudicate(outstanding.as_ref(), &settlement)
        {
            return Err(SettleError::NotAllowed(format!(
                "the decision reduces past payments while a claw-back is {state}"
            )));
        }

        let payload = DeliveryPayload {
            decision_id: record.id.clone(),
            batch:       batch.clone(),
        };

        let actions = {
            let (tx, _guard) = self.store.begin()?;
            trace.push(SagaStep::TransactionOpened);

            match store::batch::append_batch_and_decision(&tx, case_id, request.expected_version, &batch, &record)? {
                AppendOutcome::Appended { .. } => {}
                AppendOutcome::StaleVersion { actual } => {
                    return Err(SettleError::StaleCaseVersion {
                        case_id:  case_id.to_string(),
                        expected: request.expected_version,
                        actual,
                    });
                }
            }

            let outstanding = store::clawback::outstanding(&tx, case_id)?;
            let actions = clawback::adjudicate(outstanding.as_ref(), &settlement).map_err(|violation| {
                log::error!("[{case_id}] claw-back adjudication failed inside the transaction: {violation}");
                violation
            })?;
            for action in &actions {
                match action {
                    ClawbackAction::Create(tracker) => store::clawback::insert(&tx, tracker)?,
                    ClawbackAction::Advance { from, tracker } => store::clawback::advance(&tx, from, tracker)?,
                }
            }
            trace.push(SagaStep::Persisted { version });

            self.delivery.enqueue(&tx, &batch.id, &payload, now)?;
            trace.push(SagaStep::Enqueued);

            tx.commit()?;
            actions
        };
        trace.push(SagaStep::Committed);

        let mut events = vec![SettlementEvent::BatchCommitted {
            case_id: case_id.to_string(),
            batch_id: batch.id.clone(),
            decision_id: record.id.clone(),
            kind: batch.kind,
            version,
            net_amount: simulation.net_amount,
        }];
        events.extend(actions.iter().map(|a| clawback_event(case_id, a)));

        Ok(Committed {
            batch_id: batch.id,
            version,
            events,
        })
    }

    /// Append to the event log. A failure here is logged and dropped.
    fn emit(&self, event: SettlementEvent) {
        let written = EventLogEntry::from_event(&event, self.clock.now()).and_then(|entry| self.store.append_event(&entry));
        if let Err(e) = written {
            log::warn!("[{}] could not log {}: {e}", event.case_id(), event.event_type());
        }
    }
}

fn clawback_event(case_id: &str, action: &ClawbackAction) -> SettlementEvent {
    let tracker = action.tracker();
    let case_id = case_id.to_string();
    let clawback_id = tracker.id.clone();
    match &tracker.state {
        ClawbackState::Created => SettlementEvent::ClawbackCreated {
            case_id,
            clawback_id,
            amount: tracker.amount,
            source_period: tracker.source_period,
        },
        ClawbackState::Pending => SettlementEvent::ClawbackPending { case_id, clawback_id },
        ClawbackState::Settled { linked_action_id } => SettlementEvent::ClawbackSettled {
            case_id,
            clawback_id,
            linked_action_id: linked_action_id.clone(),
        },
        ClawbackState::Annulled { by_batch_id } => SettlementEvent::ClawbackAnnulled {
            case_id,
            clawback_id,
            by_batch_id: by_batch_id.clone(),
        },
    }
}
