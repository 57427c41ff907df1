//! Calendar-month periods.
//!
//! RULE: every period the engine handles starts on the first day of a month
//! and ends on the last day of a month. Construction is the only place this
//! is checked; everything downstream relies on it.

use chrono::{Datelike, Days, Months, NaiveDate};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::InputError;

/// One calendar month, stored as its first day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "NaiveDate", into = "NaiveDate")]
pub struct YearMonth(NaiveDate);

impl YearMonth {
    pub fn new(year: i32, month: u32) -> Result<Self, InputError> {
        NaiveDate::from_ymd_opt(year, month, 1)
            .map(Self)
            .ok_or(InputError::InvalidMonth { year, month })
    }

    /// The month containing `date`.
    pub fn of(date: NaiveDate) -> Self {
        Self(date - Days::new(u64::from(date.day0())))
    }

    pub fn first_day(&self) -> NaiveDate {
        self.0
    }

    pub fn last_day(&self) -> NaiveDate {
        self.next().0 - Days::new(1)
    }

    pub fn next(&self) -> Self {
        Self(self.0 + Months::new(1))
    }

    pub fn previous(&self) -> Self {
        Self(self.0 - Months::new(1))
    }

    pub fn year(&self) -> i32 {
        self.0.year()
    }

    pub fn month(&self) -> u32 {
        self.0.month()
    }
}

impl TryFrom<NaiveDate> for YearMonth {
    type Error = InputError;

    fn try_from(date: NaiveDate) -> Result<Self, Self::Error> {
        if date.day() != 1 {
            return Err(InputError::NotFirstOfMonth(date));
        }
        Ok(Self(date))
    }
}

impl From<YearMonth> for NaiveDate {
    fn from(month: YearMonth) -> Self {
        month.0
    }
}

impl fmt::Display for YearMonth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year(), self.month())
    }
}

/// A contiguous run of whole months, inclusive on both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawPeriod", into = "RawPeriod")]
pub struct Period {
    from: YearMonth,
    to:   YearMonth,
}

#[derive(Serialize, Deserialize)]
struct RawPeriod {
    from: NaiveDate,
    to:   NaiveDate,
}

impl Period {
    /// Build a period from two dates. `from` must be the first day of a month
    /// and `to` the last day of a month.
    pub fn new(from: NaiveDate, to: NaiveDate) -> Result<Self, InputError> {
        if to < from {
            return Err(InputError::ReversedPeriod { from, to });
        }
        let first = YearMonth::of(from);
        let last = YearMonth::of(to);
        if first.first_day() != from || last.last_day() != to {
            return Err(InputError::NotMonthAligned { from, to });
        }
        Ok(Self { from: first, to: last })
    }

    pub fn months_between(from: YearMonth, to: YearMonth) -> Result<Self, InputError> {
        Self::new(from.first_day(), to.last_day())
    }

    pub fn single(month: YearMonth) -> Self {
        Self { from: month, to: month }
    }

    pub fn from_date(&self) -> NaiveDate {
        self.from.first_day()
    }

    pub fn to_date(&self) -> NaiveDate {
        self.to.last_day()
    }

    pub fn first_month(&self) -> YearMonth {
        self.from
    }

    pub fn last_month(&self) -> YearMonth {
        self.to
    }

    pub fn months(&self) -> impl Iterator<Item = YearMonth> {
        let last = self.to;
        std::iter::successors(Some(self.from), move |m| {
            let next = m.next();
            (next <= last).then_some(next)
        })
    }

    pub fn month_count(&self) -> usize {
        let years = self.to.year() - self.from.year();
        let months = years * 12 + self.to.month() as i32 - self.from.month() as i32 + 1;
        months as usize
    }

    pub fn contains_date(&self, date: NaiveDate) -> bool {
        self.from_date() <= date && date <= self.to_date()
    }

    pub fn contains_month(&self, month: YearMonth) -> bool {
        self.from <= month && month <= self.to
    }

    pub fn overlaps(&self, other: &Period) -> bool {
        self.from <= other.to && other.from <= self.to
    }

    pub fn intersection(&self, other: &Period) -> Option<Period> {
        let from = self.from.max(other.from);
        let to = self.to.min(other.to);
        (from <= to).then_some(Period { from, to })
    }

    /// Smallest period spanning both.
    pub fn union_span(&self, other: &Period) -> Period {
        Period {
            from: self.from.min(other.from),
            to:   self.to.max(other.to),
        }
    }
}

impl TryFrom<RawPeriod> for Period {
    type Error = InputError;

    fn try_from(raw: RawPeriod) -> Result<Self, Self::Error> {
        Period::new(raw.from, raw.to)
    }
}

impl From<Period> for RawPeriod {
    fn from(period: Period) -> Self {
        RawPeriod {
            from: period.from_date(),
            to:   period.to_date(),
        }
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.from_date(), self.to_date())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn rejects_periods_not_aligned_to_months() {
        assert!(matches!(
            Period::new(date(2021, 1, 2), date(2021, 1, 31)),
            Err(InputError::NotMonthAligned { .. })
        ));
        assert!(matches!(
            Period::new(date(2021, 1, 1), date(2021, 2, 27)),
            Err(InputError::NotMonthAligned { .. })
        ));
        assert!(matches!(
            Period::new(date(2021, 3, 1), date(2021, 1, 31)),
            Err(InputError::ReversedPeriod { .. })
        ));
    }

    #[test]
    fn february_in_a_leap_year_ends_on_the_29th() {
        let feb = YearMonth::new(2024, 2).unwrap();
        assert_eq!(feb.last_day(), date(2024, 2, 29));
        assert!(Period::new(date(2024, 2, 1), date(2024, 2, 29)).is_ok());
    }

    #[test]
    fn months_iterate_across_year_boundary() {
        let period = Period::new(date(2021, 11, 1), date(2022, 2, 28)).unwrap();
        let months: Vec<String> = period.months().map(|m| m.to_string()).collect();
        assert_eq!(months, vec!["2021-11", "2021-12", "2022-01", "2022-02"]);
        assert_eq!(period.month_count(), 4);
    }

    #[test]
    fn intersection_and_overlap_agree() {
        let a = Period::new(date(2021, 1, 1), date(2021, 6, 30)).unwrap();
        let b = Period::new(date(2021, 4, 1), date(2021, 12, 31)).unwrap();
        let c = Period::new(date(2022, 1, 1), date(2022, 1, 31)).unwrap();
        assert!(a.overlaps(&b));
        assert_eq!(
            a.intersection(&b),
            Some(Period::new(date(2021, 4, 1), date(2021, 6, 30)).unwrap())
        );
        assert!(!a.overlaps(&c));
        assert_eq!(a.intersection(&c), None);
    }

    #[test]
    fn deserializing_validates_alignment() {
        let ok: Result<Period, _> =
            serde_json::from_str(r#"{"from":"2021-01-01","to":"2021-03-31"}"#);
        assert!(ok.is_ok());
        let bad: Result<Period, _> =
            serde_json::from_str(r#"{"from":"2021-01-15","to":"2021-03-31"}"#);
        assert!(bad.is_err());
    }
}
