//! Relative-time arithmetic for next-run calculations.
//!
//! A [`Scheduler`] accumulates deltas per unit and resolves them against a base
//! instant. Deltas of the same unit sum, and the units are always applied in a
//! fixed order (calendar months, then days, then minutes, then the optional
//! time-of-day pin), so the order of chained calls never changes the result:
//!
//! ```
//! use afterhours_core::Scheduler;
//! use chrono::{TimeZone, Utc};
//!
//! let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
//! let next = Scheduler::new().month(1).week(2).day(3).resolve(base).unwrap();
//! assert_eq!(next, Utc.with_ymd_and_hms(2024, 2, 18, 0, 0, 0).unwrap());
//! ```
//!
//! All arithmetic is in UTC.

use core::fmt;
use core::str::FromStr;

use chrono::{DateTime, Days, Duration, Months, NaiveTime, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

/// Unit of a relative delta.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum TimeUnit {
    Minutes,
    Days,
    Weeks,
    Months,
    Years,
}

/// A validated wall-clock time (UTC) with second precision.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TimeOfDay {
    hour: u32,
    minute: u32,
    second: u32,
}

impl TimeOfDay {
    /// Hour in `[0, 23]`, minute and second in `[0, 59]`. Out-of-range values are
    /// rejected, never clamped.
    pub fn new(hour: u32, minute: u32, second: u32) -> CoreResult<Self> {
        if hour > 23 {
            return Err(CoreError::validation(format!("hour {hour} not in [0, 23]")));
        }
        if minute > 59 {
            return Err(CoreError::validation(format!("minute {minute} not in [0, 59]")));
        }
        if second > 59 {
            return Err(CoreError::validation(format!("second {second} not in [0, 59]")));
        }
        Ok(Self {
            hour,
            minute,
            second,
        })
    }

    pub fn hm(hour: u32, minute: u32) -> CoreResult<Self> {
        Self::new(hour, minute, 0)
    }

    pub fn hour(&self) -> u32 {
        self.hour
    }

    pub fn minute(&self) -> u32 {
        self.minute
    }

    pub fn second(&self) -> u32 {
        self.second
    }

    pub fn to_naive(&self) -> NaiveTime {
        // Components were validated on construction.
        NaiveTime::from_hms_opt(self.hour, self.minute, self.second).unwrap_or(NaiveTime::MIN)
    }

    /// Whether `instant` falls within this hour:minute (seconds ignored).
    pub fn matches_minute(&self, instant: &DateTime<Utc>) -> bool {
        instant.hour() == self.hour && instant.minute() == self.minute
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.second == 0 {
            write!(f, "{:02}:{:02}", self.hour, self.minute)
        } else {
            write!(f, "{:02}:{:02}:{:02}", self.hour, self.minute, self.second)
        }
    }
}

impl FromStr for TimeOfDay {
    type Err = CoreError;

    /// Parses `HH:MM` or `HH:MM:SS`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split(':').collect();
        if !(2..=3).contains(&parts.len()) {
            return Err(CoreError::validation(format!(
                "time of day must be HH:MM[:SS], got {s:?}"
            )));
        }
        let field = |raw: &str, name: &str| {
            raw.parse::<u32>()
                .map_err(|_| CoreError::validation(format!("invalid {name} in {s:?}")))
        };
        let hour = field(parts[0], "hour")?;
        let minute = field(parts[1], "minute")?;
        let second = match parts.get(2) {
            Some(raw) => field(raw, "second")?,
            None => 0,
        };
        Self::new(hour, minute, second)
    }
}

impl TryFrom<String> for TimeOfDay {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TimeOfDay> for String {
    fn from(value: TimeOfDay) -> Self {
        value.to_string()
    }
}

/// Chainable accumulator of relative time deltas.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Scheduler {
    base: Option<DateTime<Utc>>,
    minutes: u64,
    days: u64,
    weeks: u64,
    months: u64,
    years: u64,
    at: Option<TimeOfDay>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// A scheduler seeded with a base instant, used when `resolve` gets no base.
    pub fn starting_at(base: DateTime<Utc>) -> Self {
        Self {
            base: Some(base),
            ..Self::default()
        }
    }

    pub fn base(&self) -> Option<DateTime<Utc>> {
        self.base
    }

    pub fn add(mut self, unit: TimeUnit, amount: u32) -> Self {
        let amount = u64::from(amount);
        let slot = match unit {
            TimeUnit::Minutes => &mut self.minutes,
            TimeUnit::Days => &mut self.days,
            TimeUnit::Weeks => &mut self.weeks,
            TimeUnit::Months => &mut self.months,
            TimeUnit::Years => &mut self.years,
        };
        *slot = slot.saturating_add(amount);
        self
    }

    pub fn minute(self, amount: u32) -> Self {
        self.add(TimeUnit::Minutes, amount)
    }

    pub fn day(self, amount: u32) -> Self {
        self.add(TimeUnit::Days, amount)
    }

    pub fn week(self, amount: u32) -> Self {
        self.add(TimeUnit::Weeks, amount)
    }

    pub fn month(self, amount: u32) -> Self {
        self.add(TimeUnit::Months, amount)
    }

    pub fn year(self, amount: u32) -> Self {
        self.add(TimeUnit::Years, amount)
    }

    /// Pin the time of day on the resulting date.
    pub fn at(mut self, time: TimeOfDay) -> Self {
        self.at = Some(time);
        self
    }

    /// Validating shorthand for [`Scheduler::at`].
    pub fn at_hms(self, hour: u32, minute: u32, second: u32) -> CoreResult<Self> {
        Ok(self.at(TimeOfDay::new(hour, minute, second)?))
    }

    /// Whether no delta and no pin were configured.
    pub fn is_empty(&self) -> bool {
        self.minutes == 0
            && self.days == 0
            && self.weeks == 0
            && self.months == 0
            && self.years == 0
            && self.at.is_none()
    }

    /// Resolve against `base`, falling back to the seeded base, then to now.
    pub fn resolve(&self, base: impl Into<Option<DateTime<Utc>>>) -> CoreResult<DateTime<Utc>> {
        let base = base.into().or(self.base).unwrap_or_else(Utc::now);

        let total_months = self.years.saturating_mul(12).saturating_add(self.months);
        let total_months = u32::try_from(total_months)
            .map_err(|_| CoreError::out_of_range(format!("{total_months} months")))?;
        let mut next = base
            .checked_add_months(Months::new(total_months))
            .ok_or_else(|| CoreError::out_of_range(format!("{base} + {total_months} months")))?;

        let total_days = self.weeks.saturating_mul(7).saturating_add(self.days);
        next = next
            .checked_add_days(Days::new(total_days))
            .ok_or_else(|| CoreError::out_of_range(format!("{next} + {total_days} days")))?;

        let minutes = i64::try_from(self.minutes)
            .ok()
            .and_then(Duration::try_minutes)
            .ok_or_else(|| CoreError::out_of_range(format!("{} minutes", self.minutes)))?;
        next = next
            .checked_add_signed(minutes)
            .ok_or_else(|| CoreError::out_of_range(format!("{next} + {} minutes", self.minutes)))?;

        if let Some(time) = self.at {
            next = next.date_naive().and_time(time.to_naive()).and_utc();
        }

        Ok(next)
    }

    /// Resolve against the seeded base (or now).
    pub fn resolve_now(&self) -> CoreResult<DateTime<Utc>> {
        self.resolve(None)
    }
}
