//! Job record types and filters.

use core::fmt;
use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use afterhours_core::JobId;

/// Queue used when a producer does not name one.
pub const DEFAULT_QUEUE: &str = "default";

/// Job record status.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for `scheduled_at`, then claimable
    Pending,
    /// Claimed by exactly one worker
    Reserved,
    /// Ran successfully (terminal)
    Completed,
    /// Retries exhausted or unrecoverable (terminal)
    Failed,
}

impl JobStatus {
    pub const ALL: [JobStatus; 4] = [
        JobStatus::Pending,
        JobStatus::Reserved,
        JobStatus::Completed,
        JobStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Reserved => "reserved",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(JobStatus::Pending),
            "reserved" => Ok(JobStatus::Reserved),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// A persisted job record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    /// Registered task handler to run
    pub task_type: String,
    pub payload: serde_json::Value,
    pub queue: String,
    pub status: JobStatus,
    /// Execution attempts so far
    pub attempts: u32,
    /// Ceiling copied from configuration at creation
    pub max_attempts: u32,
    /// Earliest instant the record may be claimed
    pub scheduled_at: DateTime<Utc>,
    /// Set while `Reserved`
    pub reserved_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    /// Set once the record reaches a terminal status
    pub finished_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Name of the schedule definition that materialized this record
    pub schedule: Option<String>,
    /// Unique key; a second insert with the same key is rejected
    pub dedupe_key: Option<String>,
}

impl JobRecord {
    /// Build a fresh `Pending` record from a submission.
    pub fn from_new(job: NewJob, default_max_attempts: u32, now: DateTime<Utc>) -> Self {
        Self {
            id: JobId::new(),
            task_type: job.task_type,
            payload: job.payload,
            queue: job.queue,
            status: JobStatus::Pending,
            attempts: 0,
            max_attempts: job.max_attempts.unwrap_or(default_max_attempts).max(1),
            scheduled_at: job.scheduled_at.unwrap_or(now),
            reserved_at: None,
            created_at: now,
            finished_at: None,
            last_error: None,
            schedule: job.schedule,
            dedupe_key: job.dedupe_key,
        }
    }

    /// Whether a worker may claim this record at `now`.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending && self.scheduled_at <= now
    }

    /// Whether a reservation has been held longer than `timeout`.
    pub fn is_stuck(&self, timeout: chrono::Duration, now: DateTime<Utc>) -> bool {
        match (self.status, self.reserved_at) {
            (JobStatus::Reserved, Some(at)) => at < stuck_cutoff(timeout, now),
            _ => false,
        }
    }
}

/// Reservations taken before this instant count as stuck. Saturates at the
/// earliest representable instant, so an oversized timeout releases nothing.
pub fn stuck_cutoff(timeout: chrono::Duration, now: DateTime<Utc>) -> DateTime<Utc> {
    now.checked_sub_signed(timeout)
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// A job submission, before defaults are applied.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub task_type: String,
    pub payload: serde_json::Value,
    pub queue: String,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub max_attempts: Option<u32>,
    pub schedule: Option<String>,
    pub dedupe_key: Option<String>,
}

impl NewJob {
    pub fn new(task_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            task_type: task_type.into(),
            payload,
            queue: DEFAULT_QUEUE.to_string(),
            scheduled_at: None,
            max_attempts: None,
            schedule: None,
            dedupe_key: None,
        }
    }

    pub fn on_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    /// Do not run before `at`.
    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn from_schedule(mut self, name: impl Into<String>) -> Self {
        self.schedule = Some(name.into());
        self
    }

    pub fn dedupe_key(mut self, key: impl Into<String>) -> Self {
        self.dedupe_key = Some(key.into());
        self
    }
}

/// What to do with a reserved record whose execution failed.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Count the attempt; back to `Pending` at `at` unless the ceiling is reached.
    Retry { at: DateTime<Utc> },
    /// Straight to `Failed`, attempt counter untouched.
    Permanent,
}

/// Selection used by listing and bulk operations. Empty fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobFilter {
    pub id: Option<JobId>,
    pub status: Option<JobStatus>,
    pub queue: Option<String>,
    pub task_type: Option<String>,
    pub limit: Option<usize>,
}

impl JobFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn with_id(mut self, id: JobId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn with_task_type(mut self, task_type: impl Into<String>) -> Self {
        self.task_type = Some(task_type.into());
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether `job` is selected (ignores `limit`).
    pub fn matches(&self, job: &JobRecord) -> bool {
        self.id.is_none_or(|id| job.id == id)
            && self.status.is_none_or(|s| job.status == s)
            && self.queue.as_deref().is_none_or(|q| job.queue == q)
            && self.task_type.as_deref().is_none_or(|t| job.task_type == t)
    }
}

/// Record counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub pending: u64,
    pub reserved: u64,
    pub completed: u64,
    pub failed: u64,
}

impl JobStats {
    pub fn record(&mut self, status: JobStatus, count: u64) {
        match status {
            JobStatus::Pending => self.pending += count,
            JobStatus::Reserved => self.reserved += count,
            JobStatus::Completed => self.completed += count,
            JobStatus::Failed => self.failed += count,
        }
    }

    pub fn total(&self) -> u64 {
        self.pending + self.reserved + self.completed + self.failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn from_new_applies_defaults() {
        let job = JobRecord::from_new(NewJob::new("mail.send", serde_json::json!({})), 3, t0());

        assert_eq!(job.queue, DEFAULT_QUEUE);
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 0);
        assert_eq!(job.max_attempts, 3);
        assert_eq!(job.scheduled_at, t0());
        assert_eq!(job.created_at, t0());
        assert!(job.reserved_at.is_none());
    }

    #[test]
    fn explicit_submission_fields_win() {
        let later = t0() + Duration::hours(1);
        let job = JobRecord::from_new(
            NewJob::new("mail.send", serde_json::json!({}))
                .on_queue("mail")
                .scheduled_at(later)
                .max_attempts(7),
            3,
            t0(),
        );

        assert_eq!(job.queue, "mail");
        assert_eq!(job.scheduled_at, later);
        assert_eq!(job.max_attempts, 7);
        assert!(!job.is_eligible(t0()));
        assert!(job.is_eligible(later));
    }

    #[test]
    fn stuck_detection_uses_reserved_at() {
        let mut job = JobRecord::from_new(NewJob::new("x", serde_json::json!({})), 3, t0());
        job.status = JobStatus::Reserved;
        job.reserved_at = Some(t0());

        assert!(!job.is_stuck(Duration::minutes(5), t0() + Duration::minutes(5)));
        assert!(job.is_stuck(Duration::minutes(5), t0() + Duration::minutes(6)));

        let huge = Duration::days(1_000_000_000);
        assert_eq!(stuck_cutoff(huge, t0()), DateTime::<Utc>::MIN_UTC);
        assert!(!job.is_stuck(huge, t0() + Duration::minutes(6)));
    }

    #[test]
    fn status_parses_case_insensitively() {
        assert_eq!("FAILED".parse::<JobStatus>().unwrap(), JobStatus::Failed);
        assert!("done".parse::<JobStatus>().is_err());
        assert!(JobStatus::Completed.is_terminal());
        assert!(!JobStatus::Reserved.is_terminal());
    }

    #[test]
    fn filter_matching() {
        let job = JobRecord::from_new(
            NewJob::new("x", serde_json::json!({})).on_queue("mail"),
            3,
            t0(),
        );

        assert!(JobFilter::all().matches(&job));
        assert!(JobFilter::all().with_queue("mail").matches(&job));
        assert!(!JobFilter::all().with_queue("default").matches(&job));
        assert!(!JobFilter::all().with_status(JobStatus::Failed).matches(&job));
        assert!(JobFilter::all().with_id(job.id).matches(&job));
        assert!(JobFilter::all().with_task_type("x").matches(&job));
        assert!(!JobFilter::all().with_task_type("y").matches(&job));
    }
}
