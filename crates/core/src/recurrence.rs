//! Recurrence rules for schedule definitions.
//!
//! Rules are evaluated at minute granularity against a *due window*: the minute
//! that contains the evaluation instant. Textual form (used by schedule files and
//! the CLI):
//!
//! | form | meaning |
//! |------|---------|
//! | `every 15m`, `every 2h`, `every 1d` | fixed interval, aligned to the Unix epoch |
//! | `hourly` | `every 60m` |
//! | `daily 03:30` | once a day at the given UTC time |
//! | `weekly mon,thu 09:00` | on the listed weekdays at the given UTC time |
//! | `cron */5 * * * *` or a bare 5-field expression | standard cron |

use core::fmt;
use core::str::FromStr;

use chrono::{DateTime, Datelike, Days, DurationRound, TimeDelta, Utc, Weekday};
use croner::Cron;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::scheduler::TimeOfDay;

/// Parsed cron expression; compared by its source text.
#[derive(Debug, Clone)]
pub struct CronExpr {
    expr: String,
    cron: Cron,
}

impl CronExpr {
    /// Parse a 5-field expression (minute hour day month weekday).
    pub fn parse(expr: &str) -> CoreResult<Self> {
        let expr = expr.trim();
        let cron = Cron::new(expr)
            .parse()
            .map_err(|e| CoreError::validation(format!("invalid cron expression {expr:?}: {e}")))?;
        Ok(Self {
            expr: expr.to_string(),
            cron,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.expr
    }
}

impl PartialEq for CronExpr {
    fn eq(&self, other: &Self) -> bool {
        self.expr == other.expr
    }
}

impl Eq for CronExpr {}

/// When a schedule definition is due.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Recurrence {
    /// Every `minutes` minutes, on minutes divisible by the interval since the epoch.
    Every { minutes: u32 },
    /// Once a day.
    Daily { at: TimeOfDay },
    /// On a set of weekdays.
    Weekly { days: Vec<Weekday>, at: TimeOfDay },
    Cron(CronExpr),
}

impl Recurrence {
    pub fn every_minutes(minutes: u32) -> CoreResult<Self> {
        if minutes == 0 {
            return Err(CoreError::validation("interval must be at least one minute"));
        }
        Ok(Self::Every { minutes })
    }

    pub fn daily(at: TimeOfDay) -> Self {
        Self::Daily { at }
    }

    pub fn weekly(days: impl IntoIterator<Item = Weekday>, at: TimeOfDay) -> CoreResult<Self> {
        let mut days: Vec<Weekday> = days.into_iter().collect();
        if days.is_empty() {
            return Err(CoreError::validation("weekly recurrence needs at least one day"));
        }
        days.sort_by_key(|d| d.num_days_from_monday());
        days.dedup();
        Ok(Self::Weekly { days, at })
    }

    pub fn cron(expr: &str) -> CoreResult<Self> {
        Ok(Self::Cron(CronExpr::parse(expr)?))
    }

    /// The due window containing `now`: `now` truncated to the minute.
    pub fn due_window(now: DateTime<Utc>) -> DateTime<Utc> {
        now.duration_trunc(TimeDelta::minutes(1)).unwrap_or(now)
    }

    /// Whether the rule fires within the minute starting at `window`.
    pub fn matches(&self, window: DateTime<Utc>) -> bool {
        let window = Self::due_window(window);
        match self {
            Recurrence::Every { minutes } => {
                let minute_of_epoch = window.timestamp().div_euclid(60);
                *minutes > 0 && minute_of_epoch.rem_euclid(i64::from(*minutes)) == 0
            }
            Recurrence::Daily { at } => at.matches_minute(&window),
            Recurrence::Weekly { days, at } => {
                days.contains(&window.weekday()) && at.matches_minute(&window)
            }
            Recurrence::Cron(expr) => expr.cron.is_time_matching(&window).unwrap_or(false),
        }
    }

    /// The first due window strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> CoreResult<DateTime<Utc>> {
        match self {
            Recurrence::Every { minutes } => {
                let step = i64::from((*minutes).max(1));
                let current = after.timestamp().div_euclid(60);
                let next = (current.div_euclid(step) + 1) * step;
                DateTime::from_timestamp(next * 60, 0)
                    .ok_or_else(|| CoreError::out_of_range(format!("minute {next} since epoch")))
            }
            Recurrence::Daily { at } => {
                let at = TimeOfDay::hm(at.hour(), at.minute())?;
                let today = after.date_naive().and_time(at.to_naive()).and_utc();
                if today > after {
                    return Ok(today);
                }
                today
                    .checked_add_days(Days::new(1))
                    .ok_or_else(|| CoreError::out_of_range(format!("{today} + 1 day")))
            }
            Recurrence::Weekly { days, at } => {
                let at = TimeOfDay::hm(at.hour(), at.minute())?;
                for offset in 0..=7 {
                    let Some(date) = after.date_naive().checked_add_days(Days::new(offset)) else {
                        break;
                    };
                    let candidate = date.and_time(at.to_naive()).and_utc();
                    if candidate > after && days.contains(&candidate.weekday()) {
                        return Ok(candidate);
                    }
                }
                Err(CoreError::out_of_range(format!("no weekly occurrence after {after}")))
            }
            Recurrence::Cron(expr) => expr.cron.find_next_occurrence(&after, false).map_err(|e| {
                CoreError::out_of_range(format!("no occurrence of {:?}: {e}", expr.as_str()))
            }),
        }
    }
}

fn weekday_name(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "mon",
        Weekday::Tue => "tue",
        Weekday::Wed => "wed",
        Weekday::Thu => "thu",
        Weekday::Fri => "fri",
        Weekday::Sat => "sat",
        Weekday::Sun => "sun",
    }
}

impl fmt::Display for Recurrence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Recurrence::Every { minutes } => write!(f, "every {minutes}m"),
            Recurrence::Daily { at } => write!(f, "daily {at}"),
            Recurrence::Weekly { days, at } => {
                let days: Vec<&str> = days.iter().copied().map(weekday_name).collect();
                write!(f, "weekly {} {at}", days.join(","))
            }
            Recurrence::Cron(expr) => write!(f, "cron {}", expr.as_str()),
        }
    }
}

fn parse_interval(raw: &str) -> CoreResult<u32> {
    let raw = raw.trim();
    let (digits, factor) = match raw.chars().last() {
        Some('m') => (&raw[..raw.len() - 1], 1),
        Some('h') => (&raw[..raw.len() - 1], 60),
        Some('d') => (&raw[..raw.len() - 1], 60 * 24),
        _ => (raw, 1),
    };
    let amount: u32 = digits
        .parse()
        .map_err(|_| CoreError::validation(format!("invalid interval {raw:?}")))?;
    amount
        .checked_mul(factor)
        .ok_or_else(|| CoreError::validation(format!("interval {raw:?} too large")))
}

impl FromStr for Recurrence {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (head, rest) = s.split_once(char::is_whitespace).unwrap_or((s, ""));
        let rest = rest.trim();

        match head.to_ascii_lowercase().as_str() {
            "hourly" if rest.is_empty() => Self::every_minutes(60),
            "every" => Self::every_minutes(parse_interval(rest)?),
            "daily" => Ok(Self::daily(rest.parse()?)),
            "weekly" => {
                let (days, at) = rest.split_once(char::is_whitespace).ok_or_else(|| {
                    CoreError::validation(format!("weekly needs days and a time, got {s:?}"))
                })?;
                let days = days
                    .split(',')
                    .map(|d| {
                        d.trim()
                            .parse::<Weekday>()
                            .map_err(|_| CoreError::validation(format!("invalid weekday {d:?}")))
                    })
                    .collect::<CoreResult<Vec<_>>>()?;
                Self::weekly(days, at.trim().parse()?)
            }
            "cron" => Self::cron(rest),
            _ if s.split_whitespace().count() == 5 => Self::cron(s),
            _ => Err(CoreError::validation(format!("unrecognized recurrence {s:?}"))),
        }
    }
}

impl TryFrom<String> for Recurrence {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Recurrence> for String {
    fn from(value: Recurrence) -> Self {
        value.to_string()
    }
}
