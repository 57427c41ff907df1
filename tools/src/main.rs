//! settle-runner: headless driver for the settlement engine.
//!
//! Usage:
//!   settle-runner --db cases.db                     JSON-lines commands on stdin
//!   settle-runner --random 200 --seed 12345         seeded random decision stream
//!   settle-runner --config settle.json --today 2024-06-15 ...
//!
//! The runner answers simulations with the in-process stub oracle and relays
//! the outbox to it after every settlement.

use anyhow::Result;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use settlement_core::{
    batch::Receipt,
    clock::{Clock, FixedClock, SystemClock},
    config::SettlementConfig,
    decision::Decision,
    rng::ScenarioRng,
    saga::{FailureReason, SettlementRequest, SettlementSaga},
    simulation::{SimulationResult, StubOracle},
    store::SettlementStore,
    timeline::TimelineEntry,
    types::CaseVersion,
};
use std::collections::BTreeMap;
use std::env;
use std::io::{self, BufRead, Write};
use std::sync::Arc;

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum RunnerCommand {
    OpenCase {
        case_id: String,
    },
    Simulate(SettleCommand),
    Settle(SettleCommand),
    Receipt {
        batch_id: String,
        receipt:  Receipt,
    },
    Timeline {
        case_id: String,
    },
    Relay,
    Quit,
}

#[derive(Deserialize)]
struct SettleCommand {
    case_id:          String,
    decision:         Decision,
    /// Defaults to the case's current version.
    #[serde(default)]
    expected_version: Option<CaseVersion>,
    #[serde(default)]
    decided_by:       Option<String>,
    #[serde(default)]
    prior_simulation: Option<SimulationResult>,
}

#[derive(Serialize)]
struct TimelineView {
    case_id: String,
    version: CaseVersion,
    entries: Vec<TimelineEntry>,
}

struct Runner {
    saga:   SettlementSaga,
    oracle: Arc<StubOracle>,
    clock:  Arc<dyn Clock>,
    /// Set when the runner controls time (`--today` or random mode).
    fixed:  Option<Arc<FixedClock>>,
}

fn main() -> Result<()> {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    let mut config = match flag_value(&args, "--config") {
        Some(path) => SettlementConfig::load(path)?,
        None => SettlementConfig::default(),
    };
    if let Some(db) = flag_value(&args, "--db") {
        config.database = db.to_string();
    }
    let today = flag_value(&args, "--today")
        .map(|raw| raw.parse::<NaiveDate>())
        .transpose()?;
    let random = parse_arg(&args, "--random", 0u64);
    let seed = parse_arg(&args, "--seed", 42u64);

    let fixed = match today {
        Some(date) => Some(Arc::new(FixedClock::on(date))),
        None if random > 0 => Some(Arc::new(FixedClock::on(SystemClock.today()))),
        None => None,
    };
    let clock: Arc<dyn Clock> = match &fixed {
        Some(f) => Arc::clone(f) as Arc<dyn Clock>,
        None => Arc::new(SystemClock),
    };

    let store = SettlementStore::open(&config.database)?;
    store.migrate()?;
    let oracle = Arc::new(StubOracle::new(Arc::clone(&clock)));
    let saga = SettlementSaga::new(store, oracle.clone(), Arc::clone(&clock), config);
    let mut runner = Runner { saga, oracle, clock, fixed };

    if random > 0 {
        run_random(&mut runner, random, seed)
    } else {
        run_command_loop(&mut runner)
    }
}

fn run_command_loop(runner: &mut Runner) -> Result<()> {
    let stdin = io::stdin();
    let mut stdout = io::stdout();
    let mut handle = stdin.lock();
    let mut buffer = String::new();

    loop {
        buffer.clear();
        let bytes_read = handle.read_line(&mut buffer)?;
        if bytes_read == 0 {
            break; // EOF
        }
        if buffer.trim().is_empty() {
            continue;
        }

        let cmd: RunnerCommand = match serde_json::from_str(&buffer) {
            Ok(c) => c,
            Err(e) => {
                writeln!(stdout, "{}", serde_json::json!({ "error": e.to_string() }))?;
                stdout.flush()?;
                continue;
            }
        };
        if matches!(cmd, RunnerCommand::Quit) {
            break;
        }
        let reply = match handle_command(runner, cmd) {
            Ok(value) => value,
            Err(e) => serde_json::json!({ "error": e.to_string() }),
        };
        writeln!(stdout, "{reply}")?;
        stdout.flush()?;
    }
    Ok(())
}

fn handle_command(runner: &mut Runner, cmd: RunnerCommand) -> Result<serde_json::Value> {
    let value = match cmd {
        RunnerCommand::OpenCase { case_id } => {
            runner.saga.open_case(&case_id)?;
            serde_json::json!({ "case_id": case_id, "version": 0 })
        }
        RunnerCommand::Simulate(command) => {
            let request = build_request(runner, command)?;
            let batch = runner.saga.simulate(&request)?;
            serde_json::to_value(&batch)?
        }
        RunnerCommand::Settle(command) => {
            let request = build_request(runner, command)?;
            let report = runner.saga.settle(request);
            runner.saga.relay(runner.oracle.as_ref())?;
            serde_json::to_value(&report)?
        }
        RunnerCommand::Receipt { batch_id, receipt } => {
            runner.saga.record_receipt(&batch_id, receipt)?;
            serde_json::json!({ "batch_id": batch_id, "receipt": receipt })
        }
        RunnerCommand::Timeline { case_id } => {
            let version = runner.saga.store().case_version(&case_id)?.unwrap_or_default();
            let timeline = runner.saga.timeline(&case_id)?;
            serde_json::to_value(TimelineView {
                case_id,
                version,
                entries: timeline.entries().to_vec(),
            })?
        }
        RunnerCommand::Relay => {
            let report = runner.saga.relay(runner.oracle.as_ref())?;
            serde_json::to_value(report)?
        }
        RunnerCommand::Quit => serde_json::Value::Null,
    };
    Ok(value)
}

fn build_request(runner: &Runner, command: SettleCommand) -> Result<SettlementRequest> {
    let expected_version = match command.expected_version {
        Some(v) => v,
        None => runner
            .saga
            .store()
            .case_version(&command.case_id)?
            .ok_or_else(|| anyhow::anyhow!("unknown case {}", command.case_id))?,
    };
    let decided_by = command
        .decided_by
        .unwrap_or_else(|| runner.saga.config().actor.clone());
    let mut request = SettlementRequest::new(&command.case_id, expected_version, command.decision, &decided_by);
    request.prior_simulation = command.prior_simulation;
    Ok(request)
}

/// Drive one case through `count` random decisions, simulating first and
/// settling against that simulation the way a caseworker would.
fn run_random(runner: &mut Runner, count: u64, seed: u64) -> Result<()> {
    let case_id = format!("case-{seed}");
    let clock = runner
        .fixed
        .clone()
        .ok_or_else(|| anyhow::anyhow!("random mode needs a fixed clock"))?;
    let start = clock.today();
    runner.saga.open_case(&case_id)?;

    let mut rng = ScenarioRng::new(seed);
    let mut committed = 0u64;
    let mut failures: BTreeMap<String, u64> = BTreeMap::new();

    println!("settle-runner: random mode");
    println!("  seed:   {seed}");
    println!("  count:  {count}");
    println!("  start:  {start}");
    println!();

    for _ in 0..count {
        let timeline = runner.saga.timeline(&case_id)?;
        let version = runner.saga.store().case_version(&case_id)?.unwrap_or_default();
        let decision = rng.next_decision(&timeline, runner.clock.today());
        let actor = runner.saga.config().actor.clone();
        let mut request = SettlementRequest::new(&case_id, version, decision, &actor);
        if let Ok(batch) = runner.saga.simulate(&request) {
            request.prior_simulation = batch.simulation().cloned();
        }

        let report = runner.saga.settle(request);
        runner.saga.relay(runner.oracle.as_ref())?;
        match report.failure() {
            None => committed += 1,
            Some(reason) => *failures.entry(reason_name(reason)).or_default() += 1,
        }
        clock.set_date(clock.today() + chrono::Days::new(rng.next_u64_below(20)));
    }

    let timeline = runner.saga.timeline(&case_id)?;
    let clawbacks = runner.saga.store().clawbacks_for_case(&case_id)?;
    println!("=== RUN SUMMARY ===");
    println!("  case:         {case_id}");
    println!("  committed:    {committed}");
    for (reason, n) in &failures {
        println!("  failed {reason:<22} {n}");
    }
    println!("  claw-backs:   {}", clawbacks.len());
    println!();
    println!("=== TIMELINE ===");
    for entry in timeline.entries() {
        println!("  {} | {:?}", entry.period, entry.effective);
    }
    Ok(())
}

fn reason_name(reason: FailureReason) -> String {
    serde_json::to_value(reason)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_else(|| format!("{reason:?}"))
}

fn flag_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.windows(2).find(|w| w[0] == flag).map(|w| w[1].as_str())
}

fn parse_arg<T: std::str::FromStr + Copy>(args: &[String], flag: &str, default: T) -> T {
    args.windows(2)
        .find(|w| w[0] == flag)
        .and_then(|w| w[1].parse().ok())
        .unwrap_or(default)
}
