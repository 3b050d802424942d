//! Queue dispatcher: claims due records and drives them through their lifecycle.
//!
//! ```text
//! pending --claim--> reserved --success, once----> completed
//! pending --claim--> reserved --success, always--> new pending at period() + completed
//! pending --claim--> reserved --success, period() errors--> failed
//! pending --claim--> reserved --failure, attempts < max--> pending at now + backoff
//! pending --claim--> reserved --failure, attempts = max--> failed
//! reserved --timeout--> pending (attempts unchanged)
//! ```

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use tracing::{debug, info, warn};

use afterhours_core::{Clock, CoreError, JobId, Recurrence, Scheduler, SystemClock};

use super::store::{JobStore, JobStoreError};
use super::types::{FailureDisposition, JobFilter, JobRecord, JobStatus, NewJob};
use crate::config::DispatchConfig;
use crate::tasks::{Occurrence, Task, TaskOutcome, TaskRegistry};

/// Error that aborts a batch or cycle.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Store(#[from] JobStoreError),
    #[error(transparent)]
    Core(#[from] CoreError),
}

/// Counters for one batch run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    /// Stuck reservations returned to pending
    pub released: u64,
    pub claimed: usize,
    pub completed: usize,
    /// Follow-up records inserted for recurring tasks
    pub rescheduled: usize,
    /// Failures returned to pending for another attempt
    pub retried: usize,
    /// Records that ended `failed`
    pub failed: usize,
}

impl BatchReport {
    pub fn merge(&mut self, other: &BatchReport) {
        self.released += other.released;
        self.claimed += other.claimed;
        self.completed += other.completed;
        self.rescheduled += other.rescheduled;
        self.retried += other.retried;
        self.failed += other.failed;
    }
}

/// Result of [`QueueDispatcher::retry_failed`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RetryReport {
    pub requeued: u64,
    pub batch: BatchReport,
}

/// Runs batches of due records from a [`JobStore`] against a [`TaskRegistry`].
pub struct QueueDispatcher<S: JobStore> {
    store: S,
    registry: Arc<TaskRegistry>,
    config: DispatchConfig,
    clock: Arc<dyn Clock>,
}

impl<S: JobStore> QueueDispatcher<S> {
    pub fn new(store: S, registry: Arc<TaskRegistry>, config: DispatchConfig) -> Self {
        Self {
            store,
            registry,
            config,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Enqueue on the default queue, eligible now.
    pub async fn enqueue(
        &self,
        task_type: &str,
        payload: serde_json::Value,
    ) -> Result<JobId, DispatchError> {
        self.submit(NewJob::new(task_type, payload)).await
    }

    pub async fn enqueue_to(
        &self,
        queue: &str,
        task_type: &str,
        payload: serde_json::Value,
    ) -> Result<JobId, DispatchError> {
        self.submit(NewJob::new(task_type, payload).on_queue(queue))
            .await
    }

    /// Enqueue with explicit options (delay, dedupe key, attempt ceiling).
    pub async fn submit(&self, job: NewJob) -> Result<JobId, DispatchError> {
        if !self.registry.contains(&job.task_type) {
            warn!(task_type = %job.task_type, "enqueueing job with no registered task");
        }
        let record = JobRecord::from_new(job, self.config.max_attempts, self.clock.now());
        let id = self.store.insert(record).await?;
        debug!(job_id = %id, "enqueued job");
        Ok(id)
    }

    /// Enqueue `job` unless a pending or reserved record of the same task type
    /// already exists on its queue. Used to seed self-rescheduling tasks.
    ///
    /// Seeds carry a dedupe key per task type, queue and minute, so racing
    /// installers insert one record between them.
    pub async fn ensure_recurring(&self, job: NewJob) -> Result<Option<JobId>, DispatchError> {
        for status in [JobStatus::Pending, JobStatus::Reserved] {
            let filter = JobFilter::all()
                .with_task_type(&job.task_type)
                .with_queue(&job.queue)
                .with_status(status)
                .with_limit(1);
            if !self.store.list(&filter).await?.is_empty() {
                return Ok(None);
            }
        }

        let job = match job.dedupe_key {
            Some(_) => job,
            None => {
                let window = Recurrence::due_window(self.clock.now());
                let key = format!(
                    "recurring:{}:{}:{}",
                    job.task_type,
                    job.queue,
                    window.format("%Y-%m-%dT%H:%MZ")
                );
                job.dedupe_key(key)
            }
        };
        match self.submit(job).await {
            Ok(id) => Ok(Some(id)),
            Err(DispatchError::Store(JobStoreError::Duplicate(key))) => {
                debug!(dedupe_key = %key, "recurring job already seeded");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Release stuck reservations, then claim and run one batch from `queue`.
    pub async fn run_batch(&self, queue: &str) -> Result<BatchReport, DispatchError> {
        let released = self
            .store
            .release_stuck(self.config.stuck_timeout, self.clock.now())
            .await?;
        if released > 0 {
            warn!(queue, released, "released stuck reservations");
        }

        let mut report = self.run_pending_only(queue).await?;
        report.released = released;
        Ok(report)
    }

    /// Claim and run one batch without releasing stuck reservations.
    pub async fn run_pending_only(&self, queue: &str) -> Result<BatchReport, DispatchError> {
        let claimed = self
            .store
            .claim_batch(queue, self.config.batch_size, self.clock.now())
            .await?;

        let mut report = BatchReport {
            claimed: claimed.len(),
            ..BatchReport::default()
        };
        for job in claimed {
            self.process(job, &mut report).await?;
        }

        if report.claimed > 0 {
            info!(
                queue,
                claimed = report.claimed,
                completed = report.completed,
                rescheduled = report.rescheduled,
                retried = report.retried,
                failed = report.failed,
                "batch finished"
            );
        }
        Ok(report)
    }

    /// Put matching failed records back to pending, then run a batch on each
    /// affected queue (the filter's queue, or every configured queue).
    pub async fn retry_failed(&self, filter: &JobFilter) -> Result<RetryReport, DispatchError> {
        let requeued = self
            .store
            .requeue_failed(filter, self.clock.now())
            .await?;
        info!(requeued, "requeued failed jobs");

        let queues = match &filter.queue {
            Some(queue) => vec![queue.clone()],
            None => self.config.queues.clone(),
        };
        let mut batch = BatchReport::default();
        for queue in &queues {
            batch.merge(&self.run_pending_only(queue).await?);
        }
        Ok(RetryReport { requeued, batch })
    }

    async fn process(&self, job: JobRecord, report: &mut BatchReport) -> Result<(), DispatchError> {
        let task = match self.registry.resolve(&job.task_type) {
            Ok(task) => task,
            Err(e) => {
                warn!(job_id = %job.id, task_type = %job.task_type, "no task registered");
                let status = self
                    .store
                    .fail(job.id, &e.to_string(), FailureDisposition::Permanent, self.clock.now())
                    .await;
                if settled(&job, status)?.is_some() {
                    report.failed += 1;
                }
                return Ok(());
            }
        };

        debug!(job_id = %job.id, task_type = %job.task_type, attempt = job.attempts + 1, "running job");
        let outcome = match AssertUnwindSafe(task.execute(&job.payload)).catch_unwind().await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => TaskOutcome::Failure(e.to_string()),
            Err(panic) => {
                TaskOutcome::Failure(format!("task panicked: {}", crate::panic_message(&*panic)))
            }
        };
        let now = self.clock.now();

        match outcome {
            TaskOutcome::Failure(message) => {
                let retry_at = now.checked_add_signed(self.config.backoff_delay).ok_or_else(|| {
                    CoreError::out_of_range(format!(
                        "backoff of {} minutes overflows the retry time",
                        self.config.backoff_delay.num_minutes()
                    ))
                })?;
                let status = self
                    .store
                    .fail(job.id, &message, FailureDisposition::Retry { at: retry_at }, now)
                    .await;
                match settled(&job, status)? {
                    Some(JobStatus::Failed) => {
                        warn!(job_id = %job.id, task_type = %job.task_type, error = %message, "job failed permanently");
                        report.failed += 1;
                    }
                    Some(_) => {
                        warn!(job_id = %job.id, task_type = %job.task_type, error = %message, %retry_at, "job failed, will retry");
                        report.retried += 1;
                    }
                    None => {}
                }
            }
            success => {
                let next_run = match success {
                    TaskOutcome::Reschedule(at) => Some(at),
                    // Schedule definitions own the recurrence of their records.
                    _ if task.occurrence() == Occurrence::Always && job.schedule.is_none() => {
                        match next_period(task.as_ref(), &job, now) {
                            Ok(at) => Some(at),
                            Err(e) => {
                                let message = format!("could not compute next run: {e}");
                                let status = self
                                    .store
                                    .fail(job.id, &message, FailureDisposition::Permanent, now)
                                    .await;
                                if settled(&job, status)?.is_some() {
                                    warn!(job_id = %job.id, task_type = %job.task_type, error = %e, "recurring job failed to reschedule");
                                    report.failed += 1;
                                }
                                return Ok(());
                            }
                        }
                    }
                    _ => None,
                };

                // The follow-up lands before the record settles; a rerun after a
                // lost reservation hits the dedupe key instead of forking the chain.
                if let Some(at) = next_run {
                    let follow_up = NewJob::new(&job.task_type, job.payload.clone())
                        .on_queue(&job.queue)
                        .scheduled_at(at)
                        .max_attempts(job.max_attempts)
                        .dedupe_key(format!("followup:{}", job.id));
                    match self
                        .store
                        .insert(JobRecord::from_new(follow_up, job.max_attempts, now))
                        .await
                    {
                        Ok(id) => {
                            debug!(job_id = %job.id, next_job_id = %id, next_run = %at, "rescheduled job");
                            report.rescheduled += 1;
                        }
                        Err(JobStoreError::Duplicate(_)) => {
                            debug!(job_id = %job.id, "follow-up already inserted");
                        }
                        Err(e) => return Err(e.into()),
                    }
                }

                let completed = self.store.complete(job.id, now).await;
                if settled(&job, completed)?.is_none() {
                    return Ok(());
                }
                report.completed += 1;
                debug!(job_id = %job.id, "job completed");
            }
        }
        Ok(())
    }
}

/// Next run of an `Always` task, counted from the slot the record was
/// scheduled for so run latency does not accumulate. A slot already in the
/// past restarts the cadence from `now` instead of replaying missed runs.
fn next_period(
    task: &dyn Task,
    job: &JobRecord,
    now: DateTime<Utc>,
) -> Result<DateTime<Utc>, CoreError> {
    let at = task.period(Scheduler::starting_at(job.scheduled_at))?;
    if at > now {
        return Ok(at);
    }
    task.period(Scheduler::starting_at(now))
}

/// A lost reservation (released as stuck and claimed elsewhere) is logged and
/// skipped; any other store error aborts the batch.
fn settled<T>(job: &JobRecord, result: Result<T, JobStoreError>) -> Result<Option<T>, DispatchError> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.is_lost_reservation() => {
            warn!(job_id = %job.id, error = %e, "lost reservation before settling job");
            Ok(None)
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::store::InMemoryJobStore;
    use crate::tasks::TaskError;
    use afterhours_core::{CoreResult, FakeClock};
    use async_trait::async_trait;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    struct Hourly;

    #[async_trait]
    impl Task for Hourly {
        fn task_type(&self) -> &str {
            "hourly"
        }

        fn occurrence(&self) -> Occurrence {
            Occurrence::Always
        }

        fn period(&self, scheduler: Scheduler) -> CoreResult<DateTime<Utc>> {
            scheduler.minute(60).resolve_now()
        }

        async fn execute(&self, _payload: &serde_json::Value) -> Result<TaskOutcome, TaskError> {
            Ok(TaskOutcome::Success)
        }
    }

    struct Stalled;

    #[async_trait]
    impl Task for Stalled {
        fn task_type(&self) -> &str {
            "stalled"
        }

        fn occurrence(&self) -> Occurrence {
            Occurrence::Always
        }

        fn period(&self, _scheduler: Scheduler) -> CoreResult<DateTime<Utc>> {
            Err(CoreError::out_of_range("no next run"))
        }

        async fn execute(&self, _payload: &serde_json::Value) -> Result<TaskOutcome, TaskError> {
            Ok(TaskOutcome::Success)
        }
    }

    fn registry() -> Arc<TaskRegistry> {
        let mut registry = TaskRegistry::new();
        registry
            .register(Hourly)
            .register(Stalled)
            .register_fn("ok", |_| async { Ok(TaskOutcome::Success) })
            .register_fn("broken", |_| async {
                Ok(TaskOutcome::Failure("always broken".to_string()))
            })
            .register_fn("erroring", |_| async { Err(TaskError::execution("io")) })
            .register_fn("panicking", |_| async { panic!("kaboom") })
            .register_fn("later", |payload| async move {
                match payload["at"].as_str().and_then(|s| s.parse::<DateTime<Utc>>().ok()) {
                    Some(at) => Ok(TaskOutcome::Reschedule(at)),
                    None => Err(TaskError::InvalidPayload("missing at".to_string())),
                }
            });
        Arc::new(registry)
    }

    fn dispatcher(
        config: DispatchConfig,
    ) -> (QueueDispatcher<Arc<InMemoryJobStore>>, Arc<InMemoryJobStore>, Arc<FakeClock>) {
        let store = InMemoryJobStore::arc();
        let clock = Arc::new(FakeClock::new(t0()));
        let dispatcher =
            QueueDispatcher::new(store.clone(), registry(), config).with_clock(clock.clone());
        (dispatcher, store, clock)
    }

    #[tokio::test]
    async fn once_task_completes_without_follow_up() {
        let (dispatcher, store, _) = dispatcher(DispatchConfig::default());
        let id = dispatcher.enqueue("ok", serde_json::json!({})).await.unwrap();

        let report = dispatcher.run_batch("default").await.unwrap();
        assert_eq!(report.claimed, 1);
        assert_eq!(report.completed, 1);
        assert_eq!(report.rescheduled, 0);

        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.finished_at, Some(t0()));
        assert_eq!(store.stats(None).await.unwrap().total(), 1);
    }

    #[tokio::test]
    async fn recurring_task_inserts_next_run() {
        let (dispatcher, store, _) = dispatcher(DispatchConfig::default());
        let id = dispatcher
            .enqueue_to("default", "hourly", serde_json::json!({"n": 1}))
            .await
            .unwrap();

        let report = dispatcher.run_batch("default").await.unwrap();
        assert_eq!(report.completed, 1);
        assert_eq!(report.rescheduled, 1);

        assert_eq!(store.get(id).await.unwrap().unwrap().status, JobStatus::Completed);
        let pending = store
            .list(&JobFilter::all().with_status(JobStatus::Pending))
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].task_type, "hourly");
        assert_eq!(pending[0].payload, serde_json::json!({"n": 1}));
        assert_eq!(pending[0].attempts, 0);
        assert_eq!(pending[0].scheduled_at, t0() + Duration::minutes(60));
    }

    #[tokio::test]
    async fn explicit_reschedule_outcome_wins() {
        let (dispatcher, store, _) = dispatcher(DispatchConfig::default());
        let at = t0() + Duration::days(3);
        dispatcher
            .enqueue("later", serde_json::json!({"at": at.to_rfc3339()}))
            .await
            .unwrap();

        dispatcher.run_batch("default").await.unwrap();
        let pending = store
            .list(&JobFilter::all().with_status(JobStatus::Pending))
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].scheduled_at, at);
    }

    #[tokio::test]
    async fn failures_retry_with_backoff_until_exhausted() {
        let (dispatcher, store, clock) = dispatcher(DispatchConfig::default().with_max_attempts(3));
        let id = dispatcher.enqueue("broken", serde_json::json!({})).await.unwrap();

        for (attempt, expected) in [
            (1, JobStatus::Pending),
            (2, JobStatus::Pending),
            (3, JobStatus::Failed),
        ] {
            dispatcher.run_batch("default").await.unwrap();
            let job = store.get(id).await.unwrap().unwrap();
            assert_eq!(job.attempts, attempt);
            assert_eq!(job.status, expected);
            assert_eq!(job.last_error.as_deref(), Some("always broken"));
            if expected == JobStatus::Pending {
                assert_eq!(job.scheduled_at, clock.now() + Duration::minutes(5));
                // Not eligible again until the backoff has passed.
                assert_eq!(dispatcher.run_batch("default").await.unwrap().claimed, 0);
            }
            clock.advance(Duration::minutes(5));
        }

        let before = store.get(id).await.unwrap().unwrap();
        let report = dispatcher.run_batch("default").await.unwrap();
        assert_eq!(report, BatchReport::default());
        assert_eq!(store.get(id).await.unwrap().unwrap(), before);
    }

    #[tokio::test]
    async fn errors_and_panics_count_as_failures() {
        let (dispatcher, store, _) = dispatcher(DispatchConfig::default());
        let erroring = dispatcher.enqueue("erroring", serde_json::json!({})).await.unwrap();
        let panicking = dispatcher.enqueue("panicking", serde_json::json!({})).await.unwrap();
        let ok = dispatcher.enqueue("ok", serde_json::json!({})).await.unwrap();

        let report = dispatcher.run_batch("default").await.unwrap();
        assert_eq!(report.claimed, 3);
        assert_eq!(report.retried, 2);
        assert_eq!(report.completed, 1);

        let job = store.get(panicking).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.last_error.unwrap().contains("kaboom"));
        assert_eq!(store.get(erroring).await.unwrap().unwrap().attempts, 1);
        assert_eq!(store.get(ok).await.unwrap().unwrap().status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn unknown_task_type_fails_permanently() {
        let (dispatcher, store, _) = dispatcher(DispatchConfig::default());
        let id = dispatcher.enqueue("nobody.home", serde_json::json!({})).await.unwrap();

        let report = dispatcher.run_batch("default").await.unwrap();
        assert_eq!(report.failed, 1);

        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 0);
        assert!(job.last_error.unwrap().contains("nobody.home"));
    }

    #[tokio::test]
    async fn stuck_reservation_is_released_then_run() {
        let (dispatcher, store, clock) = dispatcher(DispatchConfig::default());
        let id = dispatcher.enqueue("ok", serde_json::json!({})).await.unwrap();
        // A worker claimed it and died.
        store.claim_batch("default", 1, t0()).await.unwrap();

        clock.advance(Duration::minutes(6));
        let report = dispatcher.run_batch("default").await.unwrap();
        assert_eq!(report.released, 1);
        assert_eq!(report.completed, 1);

        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.attempts, 0);
    }

    #[tokio::test]
    async fn run_pending_only_leaves_stuck_reservations() {
        let (dispatcher, store, clock) = dispatcher(DispatchConfig::default());
        dispatcher.enqueue("ok", serde_json::json!({})).await.unwrap();
        store.claim_batch("default", 1, t0()).await.unwrap();

        clock.advance(Duration::minutes(6));
        let report = dispatcher.run_pending_only("default").await.unwrap();
        assert_eq!(report, BatchReport::default());
        assert_eq!(store.stats(None).await.unwrap().reserved, 1);
    }

    #[tokio::test]
    async fn batch_size_and_queue_are_honored() {
        let (dispatcher, store, _) = dispatcher(DispatchConfig::default().with_batch_size(2));
        for _ in 0..3 {
            dispatcher.enqueue("ok", serde_json::json!({})).await.unwrap();
        }
        dispatcher.enqueue_to("mail", "ok", serde_json::json!({})).await.unwrap();

        assert_eq!(dispatcher.run_batch("default").await.unwrap().completed, 2);
        assert_eq!(dispatcher.run_batch("default").await.unwrap().completed, 1);
        assert_eq!(dispatcher.run_batch("default").await.unwrap().claimed, 0);
        assert_eq!(store.stats(Some("mail")).await.unwrap().pending, 1);
    }

    #[tokio::test]
    async fn retry_failed_requeues_and_runs() {
        let (dispatcher, store, _) = dispatcher(DispatchConfig::default().with_max_attempts(1));
        let id = dispatcher.enqueue("broken", serde_json::json!({})).await.unwrap();
        dispatcher.run_batch("default").await.unwrap();
        assert_eq!(store.get(id).await.unwrap().unwrap().status, JobStatus::Failed);

        let report = dispatcher.retry_failed(&JobFilter::all().with_id(id)).await.unwrap();
        assert_eq!(report.requeued, 1);
        assert_eq!(report.batch.claimed, 1);
        assert_eq!(report.batch.failed, 1);
    }

    #[tokio::test]
    async fn ensure_recurring_seeds_once() {
        let (dispatcher, store, _) = dispatcher(DispatchConfig::default());
        let first = dispatcher
            .ensure_recurring(NewJob::new("hourly", serde_json::json!({})))
            .await
            .unwrap();
        let second = dispatcher
            .ensure_recurring(NewJob::new("hourly", serde_json::json!({})))
            .await
            .unwrap();

        assert!(first.is_some());
        assert!(second.is_none());
        assert_eq!(store.stats(None).await.unwrap().pending, 1);
    }

    #[tokio::test]
    async fn recurring_cadence_ignores_run_latency() {
        let (dispatcher, store, clock) = dispatcher(DispatchConfig::default());
        dispatcher.enqueue("hourly", serde_json::json!({})).await.unwrap();
        clock.advance(Duration::minutes(3));

        dispatcher.run_batch("default").await.unwrap();

        let pending = store
            .list(&JobFilter::all().with_status(JobStatus::Pending))
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].scheduled_at, t0() + Duration::minutes(60));
    }

    #[tokio::test]
    async fn overdue_recurring_restarts_from_now() {
        let (dispatcher, store, clock) = dispatcher(DispatchConfig::default());
        dispatcher.enqueue("hourly", serde_json::json!({})).await.unwrap();
        clock.advance(Duration::minutes(150));

        let report = dispatcher.run_batch("default").await.unwrap();
        assert_eq!(report.rescheduled, 1);

        let pending = store
            .list(&JobFilter::all().with_status(JobStatus::Pending))
            .await
            .unwrap();
        assert_eq!(pending[0].scheduled_at, t0() + Duration::minutes(210));
    }

    #[tokio::test]
    async fn recurring_period_error_fails_job() {
        let (dispatcher, store, _) = dispatcher(DispatchConfig::default());
        let id = dispatcher.enqueue("stalled", serde_json::json!({})).await.unwrap();

        let report = dispatcher.run_batch("default").await.unwrap();
        assert_eq!(report.completed, 0);
        assert_eq!(report.rescheduled, 0);
        assert_eq!(report.failed, 1);

        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        let error = job.last_error.unwrap();
        assert!(error.contains("could not compute next run"), "{error}");
        assert!(error.contains("no next run"), "{error}");
    }

    #[tokio::test]
    async fn rerun_does_not_fork_recurring_chain() {
        let (dispatcher, store, _) = dispatcher(DispatchConfig::default());
        let id = dispatcher.enqueue("hourly", serde_json::json!({})).await.unwrap();
        // An earlier run of the same record already inserted its follow-up
        // before losing the reservation.
        dispatcher
            .submit(
                NewJob::new("hourly", serde_json::json!({}))
                    .scheduled_at(t0() + Duration::minutes(60))
                    .dedupe_key(format!("followup:{id}")),
            )
            .await
            .unwrap();

        let report = dispatcher.run_batch("default").await.unwrap();
        assert_eq!(report.completed, 1);
        assert_eq!(report.rescheduled, 0);

        let stats = store.stats(None).await.unwrap();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.pending, 1);
    }

    #[tokio::test]
    async fn overflowing_backoff_aborts_batch() {
        let mut config = DispatchConfig::default();
        config.backoff_delay = Duration::days(1_000_000_000);
        let (dispatcher, _, _) = dispatcher(config);
        dispatcher.enqueue("broken", serde_json::json!({})).await.unwrap();

        let err = dispatcher.run_batch("default").await.unwrap_err();
        assert!(matches!(err, DispatchError::Core(CoreError::OutOfRange(_))));
    }

    #[tokio::test]
    async fn racing_ensure_recurring_seeds_once() {
        let (dispatcher, store, _) = dispatcher(DispatchConfig::default());
        let (first, second) = tokio::join!(
            dispatcher.ensure_recurring(NewJob::new("hourly", serde_json::json!({}))),
            dispatcher.ensure_recurring(NewJob::new("hourly", serde_json::json!({}))),
        );

        let seeded = [first.unwrap(), second.unwrap()];
        assert_eq!(seeded.iter().filter(|id| id.is_some()).count(), 1);
        assert_eq!(store.stats(None).await.unwrap().pending, 1);
    }

    #[tokio::test]
    async fn seed_key_collision_is_not_an_error() {
        let (dispatcher, store, _) = dispatcher(DispatchConfig::default());
        // Another installer seeded this minute and its record already finished.
        let id = dispatcher
            .submit(
                NewJob::new("hourly", serde_json::json!({}))
                    .dedupe_key("recurring:hourly:default:2024-01-01T12:00Z"),
            )
            .await
            .unwrap();
        store.claim_batch("default", 1, t0()).await.unwrap();
        store.complete(id, t0()).await.unwrap();

        let seeded = dispatcher
            .ensure_recurring(NewJob::new("hourly", serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(seeded, None);
        assert_eq!(store.stats(None).await.unwrap().total(), 1);
    }
}
