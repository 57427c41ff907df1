//! Deterministic random decision streams.
//!
//! RULE: Nothing in the engine draws randomness. Only the runner's random
//! mode and the property tests do, and always through a seeded ScenarioRng
//! so every run can be replayed from its seed.

use chrono::NaiveDate;
use rand::SeedableRng;
use rand_pcg::Pcg64Mcg;

use crate::{
    decision::{Calculation, CeasePayment, Decision, HaltPayment, NewPayment},
    line::RetroPayment,
    period::{Period, YearMonth},
    timeline::Timeline,
};

pub struct ScenarioRng {
    pub seed: u64,
    inner:    Pcg64Mcg,
}

impl ScenarioRng {
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            inner: Pcg64Mcg::seed_from_u64(seed),
        }
    }

    /// A float in [0.0, 1.0).
    pub fn next_f64(&mut self) -> f64 {
        use rand::RngCore;
        let bits = self.inner.next_u64();
        (bits >> 11) as f64 * (1.0 / (1u64 << 53) as f64)
    }

    /// A u64 in [0, n).
    pub fn next_u64_below(&mut self, n: u64) -> u64 {
        use rand::RngCore;
        assert!(n > 0, "n must be > 0");
        self.inner.next_u64() % n
    }

    /// An i64 in [low, high].
    pub fn between(&mut self, low: i64, high: i64) -> i64 {
        low + self.next_u64_below((high - low + 1) as u64) as i64
    }

    /// True with probability p.
    pub fn chance(&mut self, p: f64) -> bool {
        self.next_f64() < p
    }

    /// Draw a plausible decision for a case whose timeline is `timeline`,
    /// decided on `today`. Decisions are not guaranteed to be legal; a
    /// stream exercises rejections as well as commits.
    pub fn next_decision(&mut self, timeline: &Timeline, today: NaiveDate) -> Decision {
        let current = YearMonth::of(today);
        let roll = self.next_f64();
        if timeline.is_empty() || roll < 0.45 {
            return Decision::New(self.new_payment(current));
        }
        if roll < 0.65 {
            let start = if self.chance(0.5) { current } else { current.next() };
            return Decision::Halt(HaltPayment { from: start.first_day() });
        }
        if roll < 0.85 {
            return Decision::Resume;
        }
        let mut from = current;
        for _ in 0..self.between(0, 3) {
            from = from.previous();
        }
        let to = add_months(from, self.between(0, 4));
        Decision::Cease(CeasePayment { period: span(from, to) })
    }

    fn new_payment(&mut self, current: YearMonth) -> NewPayment {
        let mut from = current;
        for _ in 0..self.between(0, 5) {
            from = from.previous();
        }
        let months = self.between(1, 8);
        let to = add_months(from, months - 1);
        let period = span(from, to);

        // Sometimes split the period into two calculations with different amounts.
        let mut calculations = Vec::new();
        if months > 1 && self.chance(0.3) {
            let split = add_months(from, self.between(0, months - 2));
            calculations.push(Calculation {
                period: span(from, split),
                amount: self.amount(),
            });
            calculations.push(Calculation {
                period: span(split.next(), to),
                amount: self.amount(),
            });
        } else {
            calculations.push(Calculation { period, amount: self.amount() });
        }

        let retro = if self.chance(0.5) {
            RetroPayment::AsSoonAsPossible
        } else {
            RetroPayment::Scheduled
        };
        NewPayment { period, calculations, retro }
    }

    fn amount(&mut self) -> f64 {
        self.between(200, 3000) as f64 + self.next_f64()
    }
}

fn span(from: YearMonth, to: YearMonth) -> Period {
    Period::months_between(from, to).unwrap_or(Period::single(from))
}

fn add_months(month: YearMonth, n: i64) -> YearMonth {
    (0..n).fold(month, |m, _| m.next())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_seed_same_stream() {
        let today = NaiveDate::from_ymd_opt(2024, 6, 10).unwrap();
        let timeline = Timeline::default();
        let mut a = ScenarioRng::new(42);
        let mut b = ScenarioRng::new(42);
        for _ in 0..20 {
            assert_eq!(a.next_decision(&timeline, today), b.next_decision(&timeline, today));
        }
    }

    #[test]
    fn generated_payments_validate() {
        let today = NaiveDate::from_ymd_opt(2024, 6, 10).unwrap();
        let timeline = Timeline::default();
        let mut rng = ScenarioRng::new(7);
        for _ in 0..50 {
            let decision = rng.next_decision(&timeline, today);
            assert!(decision.validate().is_ok(), "{decision:?}");
        }
    }
}
