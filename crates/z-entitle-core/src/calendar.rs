//! Billing-cycle calendar arithmetic.
//!
//! A cycle is defined by an anchor instant and a [`Cadence`]. The anchor's
//! lattice is every `anchor + k * cadence` for integer `k` (positive or
//! negative). Calendar-based cadences are always computed from the anchor, never
//! by repeated stepping, so an anchor on the 31st lands on the last day of short
//! months without drifting to the 28th afterwards.
//!
//! Cycles are half-open on the left: `(cycle_start, cycle_end]`. A boundary that
//! falls exactly on `now` ends the current cycle.

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Unit of a billing or reset interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Interval {
    /// One hour. Reset intervals only.
    Hour,
    /// One calendar day (24 hours in UTC). Reset intervals only.
    Day,
    /// Seven days.
    Week,
    /// One calendar month.
    Month,
    /// Three calendar months.
    Quarter,
    /// Six calendar months.
    SemiAnnual,
    /// Twelve calendar months.
    Year,
}

impl Interval {
    /// Number of calendar months in one unit, for month-based intervals.
    #[must_use]
    pub const fn months(self) -> Option<i64> {
        match self {
            Self::Month => Some(1),
            Self::Quarter => Some(3),
            Self::SemiAnnual => Some(6),
            Self::Year => Some(12),
            Self::Hour | Self::Day | Self::Week => None,
        }
    }

    /// Length in seconds of one unit, for fixed-length intervals.
    #[must_use]
    pub const fn fixed_seconds(self) -> Option<i64> {
        match self {
            Self::Hour => Some(3_600),
            Self::Day => Some(86_400),
            Self::Week => Some(604_800),
            Self::Month | Self::Quarter | Self::SemiAnnual | Self::Year => None,
        }
    }

    /// Whether this interval may be used as a recurring billing cadence.
    #[must_use]
    pub const fn is_billing_interval(self) -> bool {
        !matches!(self, Self::Hour | Self::Day)
    }

    /// Get the interval name as a string.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Hour => "hour",
            Self::Day => "day",
            Self::Week => "week",
            Self::Month => "month",
            Self::Quarter => "quarter",
            Self::SemiAnnual => "semi_annual",
            Self::Year => "year",
        }
    }
}

/// An interval with a repeat count, e.g. "every 3 months".
///
/// The count is at least 1; deserialization enforces it like [`Cadence::new`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawCadence")]
pub struct Cadence {
    interval: Interval,
    count: u32,
}

#[derive(Deserialize)]
struct RawCadence {
    interval: Interval,
    count: u32,
}

impl TryFrom<RawCadence> for Cadence {
    type Error = CalendarError;

    fn try_from(raw: RawCadence) -> Result<Self, Self::Error> {
        Self::new(raw.interval, raw.count)
    }
}

impl Cadence {
    /// Create a cadence.
    ///
    /// # Errors
    ///
    /// Returns `CalendarError::ZeroCount` if `count` is zero.
    pub const fn new(interval: Interval, count: u32) -> Result<Self, CalendarError> {
        if count == 0 {
            return Err(CalendarError::ZeroCount);
        }
        Ok(Self { interval, count })
    }

    /// The interval unit.
    #[must_use]
    pub const fn interval(&self) -> Interval {
        self.interval
    }

    /// How many units make one cycle.
    #[must_use]
    pub const fn count(&self) -> u32 {
        self.count
    }

    /// A single-unit cadence.
    #[must_use]
    pub const fn every(interval: Interval) -> Self {
        Self { interval, count: 1 }
    }

    /// Every calendar month.
    #[must_use]
    pub const fn monthly() -> Self {
        Self::every(Interval::Month)
    }

    /// Every calendar year.
    #[must_use]
    pub const fn yearly() -> Self {
        Self::every(Interval::Year)
    }

    /// Approximate cycle length in months, used to normalise recurring prices.
    #[must_use]
    pub fn approx_months(&self) -> Decimal {
        let count = Decimal::from(self.count);
        match (self.interval.months(), self.interval.fixed_seconds()) {
            (Some(months), _) => Decimal::from(months) * count,
            // 365.25 / 12 days per month
            (None, Some(secs)) => {
                Decimal::from(secs) * count / Decimal::new(2_629_800, 0)
            }
            (None, None) => Decimal::ONE,
        }
    }
}

/// Errors produced by calendar arithmetic.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CalendarError {
    /// A cadence was declared with a zero repeat count.
    #[error("cadence count must be at least 1")]
    ZeroCount,

    /// The computed instant is outside the representable range.
    #[error("instant out of range")]
    OutOfRange,
}

/// Shift `instant` by `n` cadences (negative `n` shifts backwards).
///
/// Month-based cadences clamp the day of month to the target month's length and
/// keep the time of day exactly.
///
/// # Errors
///
/// Returns `CalendarError::OutOfRange` if the result is not representable.
pub fn add_intervals(
    instant: DateTime<Utc>,
    cadence: Cadence,
    n: i64,
) -> Result<DateTime<Utc>, CalendarError> {
    let steps = n
        .checked_mul(i64::from(cadence.count))
        .ok_or(CalendarError::OutOfRange)?;

    if let Some(months) = cadence.interval.months() {
        let total = steps.checked_mul(months).ok_or(CalendarError::OutOfRange)?;
        return shift_months(instant, total).ok_or(CalendarError::OutOfRange);
    }

    let unit = cadence
        .interval
        .fixed_seconds()
        .ok_or(CalendarError::OutOfRange)?;
    let secs = steps.checked_mul(unit).ok_or(CalendarError::OutOfRange)?;
    if secs.checked_abs().map_or(true, |s| s > i64::MAX / 1_000) {
        return Err(CalendarError::OutOfRange);
    }
    instant
        .checked_add_signed(Duration::seconds(secs))
        .ok_or(CalendarError::OutOfRange)
}

/// Shift `instant` backwards by `n` cadences.
///
/// # Errors
///
/// Returns `CalendarError::OutOfRange` if the result is not representable.
pub fn subtract_intervals(
    instant: DateTime<Utc>,
    cadence: Cadence,
    n: i64,
) -> Result<DateTime<Utc>, CalendarError> {
    let neg = n.checked_neg().ok_or(CalendarError::OutOfRange)?;
    add_intervals(instant, cadence, neg)
}

/// Fraction of `(start, end]` still remaining at `at`, clamped to `[0, 1]`.
///
/// A zero-length period has nothing remaining.
#[must_use]
pub fn remaining_fraction(start: DateTime<Utc>, end: DateTime<Utc>, at: DateTime<Utc>) -> Decimal {
    let total = (end - start).num_seconds();
    if total <= 0 {
        return Decimal::ZERO;
    }
    let remaining = (end - at).num_seconds().clamp(0, total);
    Decimal::from(remaining) / Decimal::from(total)
}

/// The cycle lattice of one anchor and cadence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleCalendar {
    /// The reference instant defining the lattice.
    pub anchor: DateTime<Utc>,
    /// The cycle length.
    pub cadence: Cadence,
}

impl CycleCalendar {
    /// Create a calendar for an anchor and cadence.
    #[must_use]
    pub const fn new(anchor: DateTime<Utc>, cadence: Cadence) -> Self {
        Self { anchor, cadence }
    }

    /// The `k`-th lattice point (`k = 0` is the anchor).
    ///
    /// # Errors
    ///
    /// Returns `CalendarError::OutOfRange` if the point is not representable.
    pub fn point(&self, k: i64) -> Result<DateTime<Utc>, CalendarError> {
        add_intervals(self.anchor, self.cadence, k)
    }

    /// Smallest lattice point `>= now`.
    ///
    /// # Errors
    ///
    /// Returns `CalendarError::OutOfRange` if the boundary is not representable.
    pub fn cycle_end(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>, CalendarError> {
        let k = self.end_index(now)?;
        self.point(k)
    }

    /// Largest lattice point `< now`.
    ///
    /// # Errors
    ///
    /// Returns `CalendarError::OutOfRange` if the boundary is not representable.
    pub fn cycle_start(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>, CalendarError> {
        let k = self.end_index(now)?;
        self.point(k - 1)
    }

    /// Both bounds of the cycle containing `now`.
    ///
    /// # Errors
    ///
    /// Returns `CalendarError::OutOfRange` if a boundary is not representable.
    pub fn current_period(
        &self,
        now: DateTime<Utc>,
    ) -> Result<(DateTime<Utc>, DateTime<Utc>), CalendarError> {
        let k = self.end_index(now)?;
        Ok((self.point(k - 1)?, self.point(k)?))
    }

    /// Whether `target` lies within `tolerance_seconds` of a lattice point.
    ///
    /// # Errors
    ///
    /// Returns `CalendarError::OutOfRange` if a neighbouring boundary is not representable.
    pub fn is_aligned(
        &self,
        target: DateTime<Utc>,
        tolerance_seconds: i64,
    ) -> Result<bool, CalendarError> {
        let (start, end) = self.current_period(target)?;
        let tolerance = tolerance_seconds.abs();
        Ok((target - start).num_seconds() <= tolerance || (end - target).num_seconds() <= tolerance)
    }

    /// Index of the smallest lattice point `>= now`.
    fn end_index(&self, now: DateTime<Utc>) -> Result<i64, CalendarError> {
        let mut k = self.estimate_index(now);
        while self.point(k)? < now {
            k += 1;
        }
        while self.point(k - 1)? >= now {
            k -= 1;
        }
        Ok(k)
    }

    /// Close estimate of the lattice index around `now`; corrected by `end_index`.
    fn estimate_index(&self, now: DateTime<Utc>) -> i64 {
        let count = i64::from(self.cadence.count);
        if let Some(months) = self.cadence.interval.months() {
            let month_index =
                |t: DateTime<Utc>| i64::from(t.year()) * 12 + i64::from(t.month0());
            let diff = month_index(now) - month_index(self.anchor);
            return diff.div_euclid(months * count);
        }
        let unit = self.cadence.interval.fixed_seconds().unwrap_or(1) * count;
        (now - self.anchor).num_seconds().div_euclid(unit)
    }
}

/// Shift by whole calendar months, clamping the day of month.
fn shift_months(instant: DateTime<Utc>, months: i64) -> Option<DateTime<Utc>> {
    let naive = instant.naive_utc();
    let total = i64::from(naive.year()) * 12 + i64::from(naive.month0()) + months;
    let year = i32::try_from(total.div_euclid(12)).ok()?;
    let month = u32::try_from(total.rem_euclid(12)).ok()? + 1;
    let day = naive.day().min(days_in_month(year, month)?);
    let date = NaiveDate::from_ymd_opt(year, month, day)?;
    Some(Utc.from_utc_datetime(&date.and_time(naive.time())))
}

fn days_in_month(year: i32, month: u32) -> Option<u32> {
    let first_of_next = if month == 12 {
        NaiveDate::from_ymd_opt(year.checked_add(1)?, 1, 1)?
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)?
    };
    Some(first_of_next.pred_opt()?.day())
}
