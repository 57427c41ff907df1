//! Strategy set: one decision in, one well-formed batch out.

mod common;

use common::*;
use settlement_core::{
    batch::{verify_extension, BatchKind, PaymentBatch},
    clock::FixedClock,
    decision::{Calculation, CeasePayment, Decision, NewPayment},
    line::{LineKind, RetroPayment},
    period::Period,
    simulation::SimulationResult,
    strategy::{self, StrategyError},
};

/// Run the strategy and settle the batch as if it committed.
fn extend(chain: &mut Vec<PaymentBatch>, decision: &Decision, clock: &FixedClock) -> Result<(), StrategyError> {
    let batch = strategy::generate("case-s", chain, decision, "tester", clock)?;
    verify_extension(chain, &batch).expect("strategy output must extend the chain");
    let simulation = SimulationResult::from_months(date(2024, 1, 1), vec![]);
    chain.push(batch.into_simulated(simulation).unwrap().into_sent().unwrap());
    Ok(())
}

fn clock() -> FixedClock {
    FixedClock::on(date(2024, 1, 1))
}

#[test]
fn new_payment_emits_one_line_per_month() {
    let clock = clock();
    let batch = strategy::generate("case-s", &[], &new_payment(ym(2024, 1), ym(2024, 6), 1000.0), "tester", &clock)
        .unwrap();
    assert_eq!(batch.kind, BatchKind::New);
    assert_eq!(batch.sequence_no, 1);
    assert_eq!(batch.previous_batch_id, None);
    assert_eq!(batch.lines().len(), 6);
    for (i, line) in batch.lines().iter().enumerate() {
        assert_eq!(line.period, Period::single(ym(2024, i as u32 + 1)));
        assert_eq!(line.amount_per_month(), Some(1000));
        assert!(line.supersedes.is_none(), "nothing to supersede on an empty chain");
    }
}

#[test]
fn new_payment_rounds_half_away_from_zero() {
    let clock = clock();
    let decision = Decision::New(NewPayment {
        period:       months(ym(2024, 1), ym(2024, 2)),
        calculations: vec![
            Calculation { period: Period::single(ym(2024, 1)), amount: 1000.5 },
            Calculation { period: Period::single(ym(2024, 2)), amount: 999.49 },
        ],
        retro:        RetroPayment::Scheduled,
    });
    let batch = strategy::generate("case-s", &[], &decision, "tester", &clock).unwrap();
    let amounts: Vec<_> = batch.lines().iter().map(|l| l.amount_per_month()).collect();
    assert_eq!(amounts, vec![Some(1001), Some(999)]);
}

#[test]
fn new_payment_supersedes_the_lines_it_replaces() {
    let clock = clock();
    let mut chain = Vec::new();
    extend(&mut chain, &new_payment(ym(2024, 1), ym(2024, 3), 1000.0), &clock).unwrap();
    extend(&mut chain, &new_payment(ym(2024, 2), ym(2024, 4), 1100.0), &clock).unwrap();

    let second = &chain[1];
    assert_eq!(second.previous_batch_id.as_deref(), Some(chain[0].id.as_str()));
    let feb = &second.lines()[0];
    assert_eq!(feb.supersedes.as_deref(), Some(chain[0].lines()[1].id.as_str()));
    let apr = &second.lines()[2];
    assert!(apr.supersedes.is_none(), "April was never paid before");
}

#[test]
fn halt_covers_from_start_to_end_of_timeline() {
    let clock = clock();
    let mut chain = Vec::new();
    extend(&mut chain, &new_payment(ym(2024, 1), ym(2024, 6), 1000.0), &clock).unwrap();
    extend(&mut chain, &halt_from(ym(2024, 4)), &clock).unwrap();

    let halt = &chain[1];
    assert_eq!(halt.kind, BatchKind::Halt);
    assert_eq!(halt.lines().len(), 1);
    assert_eq!(halt.lines()[0].kind, LineKind::Halt);
    assert_eq!(halt.lines()[0].period, months(ym(2024, 4), ym(2024, 6)));
}

#[test]
fn halt_refuses_what_it_cannot_express() {
    let clock = clock();
    assert_eq!(
        extend(&mut Vec::new(), &halt_from(ym(2024, 1)), &clock),
        Err(StrategyError::NoPayments)
    );

    let mut chain = Vec::new();
    extend(&mut chain, &new_payment(ym(2024, 1), ym(2024, 3), 1000.0), &clock).unwrap();
    assert!(matches!(
        extend(&mut chain.clone(), &halt_from(ym(2024, 7)), &clock),
        Err(StrategyError::NothingToHalt(_))
    ));

    extend(&mut chain, &halt_from(ym(2024, 2)), &clock).unwrap();
    assert_eq!(
        extend(&mut chain, &halt_from(ym(2024, 2)), &clock),
        Err(StrategyError::LatestIsHalt)
    );
}

#[test]
fn resume_carries_the_amount_before_the_halt() {
    let clock = clock();
    let mut chain = Vec::new();
    extend(&mut chain, &new_payment(ym(2024, 1), ym(2024, 6), 1000.0), &clock).unwrap();
    assert_eq!(
        extend(&mut chain.clone(), &Decision::Resume, &clock),
        Err(StrategyError::LatestIsNotHalt)
    );
    extend(&mut chain, &halt_from(ym(2024, 3)), &clock).unwrap();
    extend(&mut chain, &Decision::Resume, &clock).unwrap();

    let resume = &chain[2];
    assert_eq!(resume.kind, BatchKind::Resume);
    assert_eq!(resume.lines()[0].kind, LineKind::Resume { amount_per_month: 1000 });
    assert_eq!(resume.lines()[0].period, months(ym(2024, 3), ym(2024, 6)));
    assert_eq!(resume.lines()[0].supersedes.as_deref(), Some(chain[1].lines()[0].id.as_str()));
}

#[test]
fn cease_extends_to_the_end_of_the_timeline() {
    let clock = clock();
    let mut chain = Vec::new();
    extend(&mut chain, &new_payment(ym(2024, 1), ym(2024, 6), 1000.0), &clock).unwrap();
    extend(
        &mut chain,
        &Decision::Cease(CeasePayment { period: Period::single(ym(2024, 4)) }),
        &clock,
    )
    .unwrap();

    let cease = &chain[1];
    let covered: Vec<Period> = cease.lines().iter().map(|l| l.period).collect();
    assert_eq!(
        covered,
        vec![Period::single(ym(2024, 4)), Period::single(ym(2024, 5)), Period::single(ym(2024, 6))]
    );
    assert!(cease.lines().iter().all(|l| l.kind == LineKind::Cease));

    assert_eq!(
        extend(&mut chain.clone(), &halt_from(ym(2024, 2)), &clock),
        Err(StrategyError::LatestIsCease)
    );
    assert!(matches!(
        extend(&mut chain, &cease_from(ym(2024, 9)), &clock),
        Err(StrategyError::NothingToCease(_))
    ));
}
