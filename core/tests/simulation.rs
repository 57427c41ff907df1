//! Simulation checks and the stub oracle.

mod common;

use common::*;
use settlement_core::{
    clock::FixedClock,
    simulation::{control_against_timeline, cross_check, SimulatedMonth, SimulationOracle, SimulationResult, StubOracle},
    strategy,
    timeline::Timeline,
};
use std::sync::Arc;
use std::time::Duration;

fn result(months: &[(u32, i64, i64)]) -> SimulationResult {
    let months = months
        .iter()
        .map(|&(m, amount, previously_paid)| SimulatedMonth { month: ym(2024, m), amount, previously_paid })
        .collect();
    SimulationResult::from_months(date(2024, 6, 1), months)
}

#[test]
fn net_amount_is_the_sum_of_deltas() {
    let sim = result(&[(1, 800, 1000), (2, 800, 1000), (7, 800, 0)]);
    assert_eq!(sim.net_amount, 400);
    assert_eq!(sim.overpaid_period(), Some(months(ym(2024, 1), ym(2024, 2))));
    assert_eq!(sim.repaid_within(&months(ym(2024, 1), ym(2024, 12))), 800);
}

#[test]
fn sums_saturate_instead_of_overflowing() {
    let sim = result(&[(1, i64::MAX, 0), (2, i64::MAX, 0), (3, 0, i64::MAX)]);
    assert_eq!(sim.months[2].delta(), -i64::MAX);
    assert_eq!(sim.repaid_within(&months(ym(2024, 1), ym(2024, 3))), i64::MAX);

    let sim = result(&[(1, 0, i64::MAX), (2, i64::MIN, 1)]);
    assert_eq!(sim.net_amount, i64::MIN);
}

#[test]
fn cross_check_ignores_the_computation_date_only() {
    let prior = result(&[(1, 1000, 0)]);
    let mut later = prior.clone();
    later.computed_on = date(2024, 6, 2);
    assert!(cross_check(Some(&prior), &later));
    assert!(cross_check(None, &later), "nothing to compare without a prior simulation");

    let off_by_one = result(&[(1, 1001, 0)]);
    assert!(!cross_check(Some(&prior), &off_by_one));
}

#[test]
fn stub_counts_only_past_months_as_disbursed() {
    let clock = Arc::new(FixedClock::on(date(2024, 4, 10)));
    let oracle = StubOracle::new(clock.clone());

    let first = strategy::generate("case-sim", &[], &new_payment(ym(2024, 1), ym(2024, 6), 1000.0), "t", clock.as_ref())
        .unwrap();
    let first = first
        .into_simulated(result(&[]))
        .unwrap()
        .into_sent()
        .unwrap();
    oracle.record_delivered(first.clone());

    let chain = vec![first];
    let cut = strategy::generate("case-sim", &chain, &new_payment(ym(2024, 1), ym(2024, 6), 700.0), "t", clock.as_ref())
        .unwrap();
    let sim = oracle
        .simulate(&cut, cut.period().unwrap(), Duration::from_secs(1))
        .unwrap();

    // January to March were disbursed at 1000; April onward not yet.
    assert_eq!(sim.net_amount, 3 * (700 - 1000) + 3 * 700);
    assert_eq!(sim.months[0].previously_paid, 1000);
    assert_eq!(sim.months[3].previously_paid, 0);

    let after = Timeline::project_with(&chain, &cut).unwrap();
    assert_eq!(control_against_timeline(&sim, &after), Ok(()));
}

#[test]
fn control_reports_the_first_disagreeing_month() {
    let chain = Vec::new();
    let clock = FixedClock::on(date(2024, 1, 1));
    let batch = strategy::generate("case-ctl", &chain, &new_payment(ym(2024, 1), ym(2024, 2), 500.0), "t", &clock)
        .unwrap();
    let after = Timeline::project_with(&chain, &batch).unwrap();

    let wrong = result(&[(1, 500, 0), (2, 450, 0)]);
    let err = control_against_timeline(&wrong, &after).unwrap_err();
    assert!(err.starts_with("2024-02"), "unexpected message: {err}");
}
