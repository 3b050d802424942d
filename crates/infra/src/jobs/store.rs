//! Job storage boundary and the in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use afterhours_core::JobId;

use super::types::{FailureDisposition, JobFilter, JobRecord, JobStats, JobStatus};

/// Durable storage of job records.
///
/// Every mutating operation is a single atomic transition. `claim_batch` is the
/// serialization point of the whole system: two concurrent callers never both
/// receive the same record.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a new record.
    ///
    /// Fails with [`JobStoreError::Duplicate`] when the id or `dedupe_key` exists.
    async fn insert(&self, job: JobRecord) -> Result<JobId, JobStoreError>;

    /// Get a record by id.
    async fn get(&self, id: JobId) -> Result<Option<JobRecord>, JobStoreError>;

    /// Move up to `limit` eligible `queue` records to `Reserved` and return them,
    /// earliest `scheduled_at` first.
    async fn claim_batch(
        &self,
        queue: &str,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<JobRecord>, JobStoreError>;

    /// Mark a reserved record `Completed`.
    async fn complete(&self, id: JobId, now: DateTime<Utc>) -> Result<(), JobStoreError>;

    /// Record a failed execution of a reserved record and return its new status.
    async fn fail(
        &self,
        id: JobId,
        message: &str,
        disposition: FailureDisposition,
        now: DateTime<Utc>,
    ) -> Result<JobStatus, JobStoreError>;

    /// Return reservations older than `timeout` to `Pending` without touching
    /// `attempts`. Returns the number released.
    async fn release_stuck(
        &self,
        timeout: Duration,
        now: DateTime<Utc>,
    ) -> Result<u64, JobStoreError>;

    /// List records, oldest first.
    async fn list(&self, filter: &JobFilter) -> Result<Vec<JobRecord>, JobStoreError>;

    /// Count records by status, optionally for one queue.
    async fn stats(&self, queue: Option<&str>) -> Result<JobStats, JobStoreError>;

    /// Delete every record matching `filter` (`limit` ignored).
    async fn purge(&self, filter: &JobFilter) -> Result<u64, JobStoreError>;

    /// Delete `status` records that finished before `older_than`.
    async fn prune(
        &self,
        status: JobStatus,
        older_than: DateTime<Utc>,
    ) -> Result<u64, JobStoreError>;

    /// Put `Failed` records matching `filter` back to `Pending` with a fresh
    /// attempt budget, eligible at `now`.
    async fn requeue_failed(
        &self,
        filter: &JobFilter,
        now: DateTime<Utc>,
    ) -> Result<u64, JobStoreError>;

    /// Whether a record materialized by `schedule` is still pending or reserved.
    async fn has_active_for_schedule(&self, schedule: &str) -> Result<bool, JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("duplicate job: {0}")]
    Duplicate(String),
    #[error("job {id} is {status}, expected {expected}")]
    InvalidState {
        id: JobId,
        status: JobStatus,
        expected: JobStatus,
    },
    #[error("storage error: {0}")]
    Storage(String),
}

impl JobStoreError {
    /// The record exists but is no longer held by the caller (or never was).
    pub fn is_lost_reservation(&self) -> bool {
        matches!(self, JobStoreError::NotFound(_) | JobStoreError::InvalidState { .. })
    }
}

/// In-memory job store for tests and single-process use.
///
/// A single `RwLock` guards all records; each operation holds the write lock for
/// its whole transition, which makes the claim atomic.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, JobRecord>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<JobId, JobRecord>>, JobStoreError> {
        self.jobs
            .read()
            .map_err(|_| JobStoreError::Storage("job store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<JobId, JobRecord>>, JobStoreError> {
        self.jobs
            .write()
            .map_err(|_| JobStoreError::Storage("job store lock poisoned".to_string()))
    }

    fn reserved_mut(
        jobs: &mut HashMap<JobId, JobRecord>,
        id: JobId,
    ) -> Result<&mut JobRecord, JobStoreError> {
        let job = jobs.get_mut(&id).ok_or(JobStoreError::NotFound(id))?;
        if job.status != JobStatus::Reserved {
            return Err(JobStoreError::InvalidState {
                id,
                status: job.status,
                expected: JobStatus::Reserved,
            });
        }
        Ok(job)
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert(&self, job: JobRecord) -> Result<JobId, JobStoreError> {
        let mut jobs = self.write()?;
        if jobs.contains_key(&job.id) {
            return Err(JobStoreError::Duplicate(job.id.to_string()));
        }
        if let Some(key) = &job.dedupe_key {
            if jobs.values().any(|j| j.dedupe_key.as_ref() == Some(key)) {
                return Err(JobStoreError::Duplicate(key.clone()));
            }
        }
        let id = job.id;
        jobs.insert(id, job);
        Ok(id)
    }

    async fn get(&self, id: JobId) -> Result<Option<JobRecord>, JobStoreError> {
        Ok(self.read()?.get(&id).cloned())
    }

    async fn claim_batch(
        &self,
        queue: &str,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<JobRecord>, JobStoreError> {
        let mut jobs = self.write()?;

        let mut candidates: Vec<_> = jobs
            .values()
            .filter(|j| j.queue == queue && j.is_eligible(now))
            .map(|j| (j.scheduled_at, j.created_at, j.id))
            .collect();
        candidates.sort();
        candidates.truncate(limit);

        let mut claimed = Vec::with_capacity(candidates.len());
        for (_, _, id) in candidates {
            if let Some(job) = jobs.get_mut(&id) {
                job.status = JobStatus::Reserved;
                job.reserved_at = Some(now);
                claimed.push(job.clone());
            }
        }
        Ok(claimed)
    }

    async fn complete(&self, id: JobId, now: DateTime<Utc>) -> Result<(), JobStoreError> {
        let mut jobs = self.write()?;
        let job = Self::reserved_mut(&mut jobs, id)?;
        job.status = JobStatus::Completed;
        job.reserved_at = None;
        job.finished_at = Some(now);
        Ok(())
    }

    async fn fail(
        &self,
        id: JobId,
        message: &str,
        disposition: FailureDisposition,
        now: DateTime<Utc>,
    ) -> Result<JobStatus, JobStoreError> {
        let mut jobs = self.write()?;
        let job = Self::reserved_mut(&mut jobs, id)?;

        job.reserved_at = None;
        job.last_error = Some(message.to_string());

        match disposition {
            FailureDisposition::Retry { at } => {
                job.attempts = (job.attempts + 1).min(job.max_attempts);
                if job.attempts < job.max_attempts {
                    job.status = JobStatus::Pending;
                    job.scheduled_at = at;
                } else {
                    job.status = JobStatus::Failed;
                    job.finished_at = Some(now);
                }
            }
            FailureDisposition::Permanent => {
                job.status = JobStatus::Failed;
                job.finished_at = Some(now);
            }
        }
        Ok(job.status)
    }

    async fn release_stuck(
        &self,
        timeout: Duration,
        now: DateTime<Utc>,
    ) -> Result<u64, JobStoreError> {
        let mut jobs = self.write()?;
        let mut released = 0;
        for job in jobs.values_mut().filter(|j| j.is_stuck(timeout, now)) {
            job.status = JobStatus::Pending;
            job.reserved_at = None;
            released += 1;
        }
        Ok(released)
    }

    async fn list(&self, filter: &JobFilter) -> Result<Vec<JobRecord>, JobStoreError> {
        let jobs = self.read()?;
        let mut result: Vec<_> = jobs.values().filter(|j| filter.matches(j)).cloned().collect();
        result.sort_by_key(|j| (j.created_at, j.id));
        if let Some(limit) = filter.limit {
            result.truncate(limit);
        }
        Ok(result)
    }

    async fn stats(&self, queue: Option<&str>) -> Result<JobStats, JobStoreError> {
        let jobs = self.read()?;
        let mut stats = JobStats::default();
        for job in jobs.values().filter(|j| queue.is_none_or(|q| j.queue == q)) {
            stats.record(job.status, 1);
        }
        Ok(stats)
    }

    async fn purge(&self, filter: &JobFilter) -> Result<u64, JobStoreError> {
        let mut jobs = self.write()?;
        let before = jobs.len();
        jobs.retain(|_, j| !filter.matches(j));
        Ok((before - jobs.len()) as u64)
    }

    async fn prune(
        &self,
        status: JobStatus,
        older_than: DateTime<Utc>,
    ) -> Result<u64, JobStoreError> {
        let mut jobs = self.write()?;
        let before = jobs.len();
        jobs.retain(|_, j| !(j.status == status && j.finished_at.is_some_and(|f| f < older_than)));
        Ok((before - jobs.len()) as u64)
    }

    async fn requeue_failed(
        &self,
        filter: &JobFilter,
        now: DateTime<Utc>,
    ) -> Result<u64, JobStoreError> {
        let mut jobs = self.write()?;
        let mut requeued = 0;
        for job in jobs
            .values_mut()
            .filter(|j| j.status == JobStatus::Failed && filter.matches(j))
        {
            job.status = JobStatus::Pending;
            job.attempts = 0;
            job.scheduled_at = now;
            job.reserved_at = None;
            job.finished_at = None;
            requeued += 1;
        }
        Ok(requeued)
    }

    async fn has_active_for_schedule(&self, schedule: &str) -> Result<bool, JobStoreError> {
        let jobs = self.read()?;
        Ok(jobs.values().any(|j| {
            j.schedule.as_deref() == Some(schedule)
                && matches!(j.status, JobStatus::Pending | JobStatus::Reserved)
        }))
    }
}

#[async_trait]
impl<S: JobStore + ?Sized> JobStore for Arc<S> {
    async fn insert(&self, job: JobRecord) -> Result<JobId, JobStoreError> {
        (**self).insert(job).await
    }

    async fn get(&self, id: JobId) -> Result<Option<JobRecord>, JobStoreError> {
        (**self).get(id).await
    }

    async fn claim_batch(
        &self,
        queue: &str,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<JobRecord>, JobStoreError> {
        (**self).claim_batch(queue, limit, now).await
    }

    async fn complete(&self, id: JobId, now: DateTime<Utc>) -> Result<(), JobStoreError> {
        (**self).complete(id, now).await
    }

    async fn fail(
        &self,
        id: JobId,
        message: &str,
        disposition: FailureDisposition,
        now: DateTime<Utc>,
    ) -> Result<JobStatus, JobStoreError> {
        (**self).fail(id, message, disposition, now).await
    }

    async fn release_stuck(
        &self,
        timeout: Duration,
        now: DateTime<Utc>,
    ) -> Result<u64, JobStoreError> {
        (**self).release_stuck(timeout, now).await
    }

    async fn list(&self, filter: &JobFilter) -> Result<Vec<JobRecord>, JobStoreError> {
        (**self).list(filter).await
    }

    async fn stats(&self, queue: Option<&str>) -> Result<JobStats, JobStoreError> {
        (**self).stats(queue).await
    }

    async fn purge(&self, filter: &JobFilter) -> Result<u64, JobStoreError> {
        (**self).purge(filter).await
    }

    async fn prune(
        &self,
        status: JobStatus,
        older_than: DateTime<Utc>,
    ) -> Result<u64, JobStoreError> {
        (**self).prune(status, older_than).await
    }

    async fn requeue_failed(
        &self,
        filter: &JobFilter,
        now: DateTime<Utc>,
    ) -> Result<u64, JobStoreError> {
        (**self).requeue_failed(filter, now).await
    }

    async fn has_active_for_schedule(&self, schedule: &str) -> Result<bool, JobStoreError> {
        (**self).has_active_for_schedule(schedule).await
    }
}
