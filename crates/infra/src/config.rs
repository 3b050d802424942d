//! Dispatch configuration loaded from `AFTERHOURS_*` environment variables.

use std::path::PathBuf;
use std::str::FromStr;

use crate::jobs::DEFAULT_QUEUE;

pub const DEFAULT_SCHEDULE_FILE: &str = "afterhours.schedules.toml";

/// Upper bound for `stuck_timeout` and `backoff_delay` (one year).
pub const MAX_DELAY_MINUTES: i64 = 366 * 24 * 60;

/// Upper bound for `max_attempts`.
pub const MAX_ATTEMPTS_LIMIT: u32 = 1_000;

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?} ({reason})")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },
    #[error("missing required setting: {0}")]
    Missing(&'static str),
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid schedule file {path}: {message}")]
    Schedule { path: PathBuf, message: String },
}

impl ConfigError {
    fn invalid(key: &str, value: &str, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}

/// Knobs for batch and cycle runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchConfig {
    /// Records claimed per queue per batch
    pub batch_size: usize,
    /// Attempt ceiling stamped on new records
    pub max_attempts: u32,
    /// Reservations older than this are released
    pub stuck_timeout: chrono::Duration,
    /// Delay before a failed record is eligible again
    pub backoff_delay: chrono::Duration,
    /// Whether cycles consult the pause flag
    pub check_pause_flag: bool,
    /// Queues served by background cycles, in order
    pub queues: Vec<String>,
    /// Sleep between cycles of a long-running worker
    pub poll_interval: std::time::Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            max_attempts: 3,
            stuck_timeout: chrono::Duration::minutes(5),
            backoff_delay: chrono::Duration::minutes(5),
            check_pause_flag: true,
            queues: vec![DEFAULT_QUEUE.to_string()],
            poll_interval: std::time::Duration::from_secs(5),
        }
    }
}

impl DispatchConfig {
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.clamp(1, MAX_ATTEMPTS_LIMIT);
        self
    }

    pub fn with_stuck_timeout(mut self, timeout: chrono::Duration) -> Self {
        self.stuck_timeout = clamp_delay(timeout);
        self
    }

    pub fn with_backoff_delay(mut self, delay: chrono::Duration) -> Self {
        self.backoff_delay = clamp_delay(delay);
        self
    }

    pub fn with_check_pause_flag(mut self, check: bool) -> Self {
        self.check_pause_flag = check;
        self
    }

    pub fn with_queues<I, Q>(mut self, queues: I) -> Self
    where
        I: IntoIterator<Item = Q>,
        Q: Into<String>,
    {
        let queues: Vec<String> = queues.into_iter().map(Into::into).collect();
        if !queues.is_empty() {
            self.queues = queues;
        }
        self
    }

    pub fn with_poll_interval(mut self, interval: std::time::Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Read from the process environment, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(v) = parse_positive::<usize>(&lookup, "AFTERHOURS_BATCH_SIZE")? {
            config.batch_size = v;
        }
        if let Some(v) = parse_positive::<u32>(&lookup, "AFTERHOURS_MAX_ATTEMPTS")? {
            if v > MAX_ATTEMPTS_LIMIT {
                return Err(ConfigError::invalid(
                    "AFTERHOURS_MAX_ATTEMPTS",
                    &v.to_string(),
                    format!("at most {MAX_ATTEMPTS_LIMIT}"),
                ));
            }
            config.max_attempts = v;
        }
        if let Some(v) = parse_positive::<i64>(&lookup, "AFTERHOURS_STUCK_TIMEOUT_MINUTES")? {
            config.stuck_timeout = minutes("AFTERHOURS_STUCK_TIMEOUT_MINUTES", v)?;
        }
        if let Some(v) = parse_positive::<i64>(&lookup, "AFTERHOURS_BACKOFF_DELAY_MINUTES")? {
            config.backoff_delay = minutes("AFTERHOURS_BACKOFF_DELAY_MINUTES", v)?;
        }
        if let Some(raw) = lookup("AFTERHOURS_CHECK_PAUSE_FLAG") {
            config.check_pause_flag = parse_bool("AFTERHOURS_CHECK_PAUSE_FLAG", &raw)?;
        }
        if let Some(raw) = lookup("AFTERHOURS_QUEUES") {
            let queues: Vec<String> = raw
                .split(',')
                .map(str::trim)
                .filter(|q| !q.is_empty())
                .map(str::to_string)
                .collect();
            if queues.is_empty() {
                return Err(ConfigError::invalid("AFTERHOURS_QUEUES", &raw, "no queue names"));
            }
            config.queues = queues;
        }
        if let Some(v) = parse_positive::<u64>(&lookup, "AFTERHOURS_POLL_INTERVAL_SECS")? {
            config.poll_interval = std::time::Duration::from_secs(v);
        }

        Ok(config)
    }
}

/// Everything a process needs to start dispatching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    pub dispatch: DispatchConfig,
    pub database_url: Option<String>,
    pub schedule_file: PathBuf,
}

impl RuntimeConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        Ok(Self {
            dispatch: DispatchConfig::from_lookup(&lookup)?,
            database_url: lookup("DATABASE_URL").filter(|url| !url.trim().is_empty()),
            schedule_file: lookup("AFTERHOURS_SCHEDULE_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_SCHEDULE_FILE)),
        })
    }

    pub fn require_database_url(&self) -> Result<&str, ConfigError> {
        self.database_url
            .as_deref()
            .ok_or(ConfigError::Missing("DATABASE_URL"))
    }
}

fn parse_positive<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, ConfigError>
where
    T: FromStr + PartialOrd + Default,
    T::Err: std::fmt::Display,
{
    let Some(raw) = lookup(key) else {
        return Ok(None);
    };
    let value: T = raw
        .trim()
        .parse()
        .map_err(|e: T::Err| ConfigError::invalid(key, &raw, e.to_string()))?;
    if value <= T::default() {
        return Err(ConfigError::invalid(key, &raw, "must be greater than zero"));
    }
    Ok(Some(value))
}

fn minutes(key: &str, value: i64) -> Result<chrono::Duration, ConfigError> {
    if value > MAX_DELAY_MINUTES {
        return Err(ConfigError::invalid(
            key,
            &value.to_string(),
            format!("at most {MAX_DELAY_MINUTES} minutes"),
        ));
    }
    chrono::Duration::try_minutes(value)
        .ok_or_else(|| ConfigError::invalid(key, &value.to_string(), "out of range"))
}

fn clamp_delay(delay: chrono::Duration) -> chrono::Duration {
    delay.clamp(chrono::Duration::zero(), chrono::Duration::minutes(MAX_DELAY_MINUTES))
}

fn parse_bool(key: &str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::invalid(key, raw, "expected a boolean")),
    }
}
