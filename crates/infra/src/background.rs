//! Background cycles: materialize due schedules, dispatch every queue, drain
//! deferred callbacks.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use afterhours_core::Recurrence;

use crate::deferred::{DeferredBuffer, DeferredReport};
use crate::jobs::{BatchReport, DispatchError, JobRecord, JobStore, JobStoreError, QueueDispatcher};
use crate::pause::PauseFlag;
use crate::schedules::ScheduleDefinition;

/// Most minute windows evaluated in one cycle. Windows older than this when a
/// cycle finally runs are dropped rather than replayed.
pub const SCHEDULE_CATCH_UP_MINUTES: i64 = 15;

/// Outcome of one cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    /// Schedule records inserted this cycle
    pub enqueued: usize,
    /// Due schedules skipped because a previous record is unfinished
    pub skipped_overlap: usize,
    pub paused: bool,
    /// Per-queue batch results, in configured order
    pub batches: Vec<(String, BatchReport)>,
    pub deferred: DeferredReport,
}

impl CycleReport {
    /// All batches summed.
    pub fn totals(&self) -> BatchReport {
        let mut totals = BatchReport::default();
        for (_, batch) in &self.batches {
            totals.merge(batch);
        }
        totals
    }
}

/// Drives schedule materialization and queue dispatch.
pub struct BackgroundDispatcher<S: JobStore> {
    dispatcher: QueueDispatcher<S>,
    schedules: Vec<ScheduleDefinition>,
    pause: Arc<dyn PauseFlag>,
    /// Last window whose schedules were materialized.
    evaluated: Mutex<Option<DateTime<Utc>>>,
}

impl<S: JobStore> BackgroundDispatcher<S> {
    pub fn new(
        dispatcher: QueueDispatcher<S>,
        schedules: Vec<ScheduleDefinition>,
        pause: Arc<dyn PauseFlag>,
    ) -> Self {
        Self {
            dispatcher,
            schedules,
            pause,
            evaluated: Mutex::new(None),
        }
    }

    pub fn dispatcher(&self) -> &QueueDispatcher<S> {
        &self.dispatcher
    }

    pub fn schedules(&self) -> &[ScheduleDefinition] {
        &self.schedules
    }

    pub fn pause_flag(&self) -> &dyn PauseFlag {
        self.pause.as_ref()
    }

    /// Run one cycle, reading the pause flag when configured to.
    pub async fn run_cycle(&self, deferred: &DeferredBuffer) -> Result<CycleReport, DispatchError> {
        self.run_cycle_with(deferred, None).await
    }

    /// Run one cycle; `paused` overrides the stored pause flag when given.
    ///
    /// The deferred buffer is drained even when the cycle fails, and the error
    /// is returned afterwards.
    pub async fn run_cycle_with(
        &self,
        deferred: &DeferredBuffer,
        paused: Option<bool>,
    ) -> Result<CycleReport, DispatchError> {
        let mut report = CycleReport::default();
        let result = self.dispatch(&mut report, paused).await;
        report.deferred = deferred.drain_all().await;

        match result {
            Ok(()) => {
                let totals = report.totals();
                info!(
                    enqueued = report.enqueued,
                    paused = report.paused,
                    claimed = totals.claimed,
                    completed = totals.completed,
                    failed = totals.failed,
                    deferred = report.deferred.executed,
                    "cycle finished"
                );
                Ok(report)
            }
            Err(e) => {
                error!(error = %e, deferred = report.deferred.executed, "cycle aborted");
                Err(e)
            }
        }
    }

    async fn dispatch(
        &self,
        report: &mut CycleReport,
        paused: Option<bool>,
    ) -> Result<(), DispatchError> {
        let (enqueued, skipped) = self.materialize_due(self.dispatcher.now()).await?;
        report.enqueued = enqueued;
        report.skipped_overlap = skipped;

        report.paused = match paused {
            Some(paused) => paused,
            None if self.dispatcher.config().check_pause_flag => self.pause.is_paused().await?,
            None => false,
        };
        if report.paused {
            info!("dispatch paused");
            return Ok(());
        }

        for queue in &self.dispatcher.config().queues {
            let batch = self.dispatcher.run_batch(queue).await?;
            report.batches.push((queue.clone(), batch));
        }
        Ok(())
    }

    /// Materialize every window since the last evaluated one, up to the window
    /// containing `now`. The first call looks back one poll interval. Returns
    /// `(enqueued, skipped for overlap)`.
    pub async fn materialize_due(
        &self,
        now: DateTime<Utc>,
    ) -> Result<(usize, usize), DispatchError> {
        let current = Recurrence::due_window(now);
        let last = *self.evaluated.lock().unwrap_or_else(|e| e.into_inner());
        let oldest = current - chrono::Duration::minutes(SCHEDULE_CATCH_UP_MINUTES - 1);
        let first = match last {
            Some(last) => last + chrono::Duration::minutes(1),
            None => {
                let interval = chrono::Duration::from_std(self.dispatcher.config().poll_interval)
                    .unwrap_or(chrono::Duration::zero());
                Recurrence::due_window(now - interval)
            }
        };
        if first < oldest {
            debug!(from = %first, to = %oldest, "dropping schedule windows older than catch-up limit");
        }

        let (mut enqueued, mut skipped) = (0, 0);
        let mut window = first.max(oldest);
        while window <= current {
            let (e, s) = self.materialize_window(window, now).await?;
            enqueued += e;
            skipped += s;
            window += chrono::Duration::minutes(1);
        }

        let mut evaluated = self.evaluated.lock().unwrap_or_else(|e| e.into_inner());
        if evaluated.map_or(true, |last| last < current) {
            *evaluated = Some(current);
        }
        Ok((enqueued, skipped))
    }

    /// Insert one record for every definition due in the window containing
    /// `now`. Returns `(enqueued, skipped for overlap)`.
    pub async fn materialize_schedules(
        &self,
        now: DateTime<Utc>,
    ) -> Result<(usize, usize), DispatchError> {
        self.materialize_window(Recurrence::due_window(now), now).await
    }

    async fn materialize_window(
        &self,
        window: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(usize, usize), DispatchError> {
        let store = self.dispatcher.store();
        let max_attempts = self.dispatcher.config().max_attempts;
        let (mut enqueued, mut skipped) = (0, 0);

        for def in self.schedules.iter().filter(|d| d.recurrence.matches(window)) {
            if !def.allow_overlap && store.has_active_for_schedule(&def.name).await? {
                debug!(schedule = %def.name, "previous run unfinished, skipping");
                skipped += 1;
                continue;
            }

            let record = JobRecord::from_new(def.job_for(window), max_attempts, now);
            match store.insert(record).await {
                Ok(id) => {
                    info!(schedule = %def.name, job_id = %id, %window, "materialized schedule");
                    enqueued += 1;
                }
                Err(JobStoreError::Duplicate(_)) => {
                    debug!(schedule = %def.name, %window, "schedule already materialized");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok((enqueued, skipped))
    }

    /// Each definition with its next due window after `now`.
    pub fn upcoming(&self, now: DateTime<Utc>) -> Vec<(&ScheduleDefinition, Option<DateTime<Utc>>)> {
        self.schedules
            .iter()
            .map(|def| (def, def.next_run(now).ok()))
            .collect()
    }
}

impl<S: JobStore + 'static> BackgroundDispatcher<S> {
    /// Run cycles every `poll_interval` on the current tokio runtime until the
    /// handle is shut down. Callbacks pushed to [`DispatcherHandle::deferred`]
    /// run at the end of the next cycle.
    pub fn spawn(self: Arc<Self>, poll_interval: Duration) -> DispatcherHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let stats = Arc::new(Mutex::new(DispatcherStats::default()));
        let deferred = Arc::new(DeferredBuffer::new());

        let join = tokio::spawn({
            let stats = stats.clone();
            let deferred = deferred.clone();
            async move {
                info!(poll_interval_ms = poll_interval.as_millis() as u64, "dispatcher started");
                let started = Instant::now();

                loop {
                    let result = self.run_cycle(&deferred).await;
                    {
                        let mut s = stats.lock().unwrap_or_else(|e| e.into_inner());
                        s.record(&result, self.dispatcher.now());
                        s.uptime_secs = started.elapsed().as_secs();
                    }

                    tokio::select! {
                        _ = shutdown_rx.changed() => break,
                        _ = tokio::time::sleep(poll_interval) => {}
                    }
                }

                // Callbacks queued after the last cycle still run.
                deferred.drain_all().await;
                info!("dispatcher stopped");
            }
        });

        DispatcherHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
            deferred,
        }
    }
}

/// Runtime statistics of a spawned dispatcher.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DispatcherStats {
    pub cycles: u64,
    pub failed_cycles: u64,
    pub paused_cycles: u64,
    pub jobs_completed: u64,
    pub jobs_retried: u64,
    pub jobs_failed: u64,
    pub schedules_enqueued: u64,
    pub last_cycle_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub uptime_secs: u64,
}

impl DispatcherStats {
    fn record(&mut self, result: &Result<CycleReport, DispatchError>, at: DateTime<Utc>) {
        self.cycles += 1;
        self.last_cycle_at = Some(at);
        match result {
            Ok(report) => {
                let totals = report.totals();
                self.jobs_completed += totals.completed as u64;
                self.jobs_retried += totals.retried as u64;
                self.jobs_failed += totals.failed as u64;
                self.schedules_enqueued += report.enqueued as u64;
                if report.paused {
                    self.paused_cycles += 1;
                }
            }
            Err(e) => {
                self.failed_cycles += 1;
                self.last_error = Some(e.to_string());
            }
        }
    }
}

/// Handle to control a spawned dispatcher.
#[derive(Debug)]
pub struct DispatcherHandle {
    shutdown: watch::Sender<bool>,
    join: Option<JoinHandle<()>>,
    stats: Arc<Mutex<DispatcherStats>>,
    deferred: Arc<DeferredBuffer>,
}

impl DispatcherHandle {
    /// Request graceful shutdown and wait for the in-flight cycle to finish.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(join) = self.join.take() {
            if let Err(e) = join.await {
                error!(error = %e, "dispatcher task ended abnormally");
            }
        }
    }

    pub fn stats(&self) -> DispatcherStats {
        self.stats.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Buffer drained at the end of every cycle.
    pub fn deferred(&self) -> &DeferredBuffer {
        &self.deferred
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DispatchConfig;
    use crate::jobs::{InMemoryJobStore, JobFilter, JobStatus};
    use crate::pause::InMemoryPauseFlag;
    use crate::tasks::{TaskOutcome, TaskRegistry};
    use afterhours_core::{Clock, FakeClock, TimeOfDay};
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 30).unwrap()
    }

    struct Fixture {
        background: BackgroundDispatcher<Arc<InMemoryJobStore>>,
        store: Arc<InMemoryJobStore>,
        clock: Arc<FakeClock>,
        pause: Arc<InMemoryPauseFlag>,
    }

    fn fixture(schedules: Vec<ScheduleDefinition>, config: DispatchConfig) -> Fixture {
        let mut registry = TaskRegistry::new();
        registry
            .register_fn("ok", |_| async { Ok(TaskOutcome::Success) })
            .register_fn("broken", |_| async { Ok(TaskOutcome::Failure("nope".to_string())) });

        let store = InMemoryJobStore::arc();
        let clock = Arc::new(FakeClock::new(t0()));
        let pause = Arc::new(InMemoryPauseFlag::new());
        let dispatcher = QueueDispatcher::new(store.clone(), Arc::new(registry), config)
            .with_clock(clock.clone());
        Fixture {
            background: BackgroundDispatcher::new(dispatcher, schedules, pause.clone()),
            store,
            clock,
            pause,
        }
    }

    fn every_minute(name: &str, task: &str) -> ScheduleDefinition {
        ScheduleDefinition::new(name, task, Recurrence::every_minutes(1).unwrap())
    }

    #[tokio::test]
    async fn empty_cycle_is_idempotent() {
        let f = fixture(vec![], DispatchConfig::default());
        let deferred = DeferredBuffer::new();

        let first = f.background.run_cycle(&deferred).await.unwrap();
        let second = f.background.run_cycle(&deferred).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first.totals(), BatchReport::default());
        assert_eq!(f.store.stats(None).await.unwrap().total(), 0);
    }

    #[tokio::test]
    async fn schedule_materializes_once_per_window() {
        let schedule = every_minute("heartbeat", "ok");
        let f = fixture(vec![schedule], DispatchConfig::default());
        let deferred = DeferredBuffer::new();

        let first = f.background.run_cycle(&deferred).await.unwrap();
        assert_eq!(first.enqueued, 1);
        assert_eq!(first.totals().completed, 1);

        // Same minute: the record exists (completed), nothing new.
        f.clock.advance(chrono::Duration::seconds(20));
        let second = f.background.run_cycle(&deferred).await.unwrap();
        assert_eq!(second.enqueued, 0);
        assert_eq!(f.store.stats(None).await.unwrap().total(), 1);

        // Next minute: a new window.
        f.clock.advance(chrono::Duration::seconds(20));
        let third = f.background.run_cycle(&deferred).await.unwrap();
        assert_eq!(third.enqueued, 1);
        assert_eq!(f.store.stats(None).await.unwrap().completed, 2);
    }

    #[tokio::test]
    async fn materialized_record_carries_schedule_fields() {
        let schedule = ScheduleDefinition::new(
            "nightly",
            "ok",
            Recurrence::daily(TimeOfDay::hm(12, 0).unwrap()),
        )
        .on_queue("reports")
        .with_payload(serde_json::json!({"format": "pdf"}));
        let f = fixture(vec![schedule], DispatchConfig::default());

        let (enqueued, _) = f.background.materialize_schedules(f.clock.now()).await.unwrap();
        assert_eq!(enqueued, 1);

        let jobs = f.store.list(&JobFilter::all()).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].queue, "reports");
        assert_eq!(jobs[0].schedule.as_deref(), Some("nightly"));
        assert_eq!(jobs[0].payload, serde_json::json!({"format": "pdf"}));
        assert_eq!(jobs[0].scheduled_at, Recurrence::due_window(t0()));

        // Not due an hour later.
        let later = t0() + chrono::Duration::hours(1);
        assert_eq!(f.background.materialize_schedules(later).await.unwrap(), (0, 0));
    }

    #[tokio::test]
    async fn window_between_cycles_is_not_lost() {
        let schedule = ScheduleDefinition::new(
            "report",
            "ok",
            Recurrence::daily(TimeOfDay::hm(12, 1).unwrap()),
        );
        let f = fixture(vec![schedule], DispatchConfig::default());
        let deferred = DeferredBuffer::new();

        let first = f.background.run_cycle(&deferred).await.unwrap();
        assert_eq!(first.enqueued, 0);

        // The next cycle lands after 12:01 has already passed.
        f.clock.set(Utc.with_ymd_and_hms(2024, 1, 1, 12, 2, 0).unwrap());
        let second = f.background.run_cycle(&deferred).await.unwrap();
        assert_eq!(second.enqueued, 1);
        assert_eq!(second.totals().completed, 1);

        let jobs = f.store.list(&JobFilter::all()).await.unwrap();
        assert_eq!(
            jobs[0].scheduled_at,
            Utc.with_ymd_and_hms(2024, 1, 1, 12, 1, 0).unwrap()
        );

        // Re-evaluating the same span adds nothing.
        let third = f.background.run_cycle(&deferred).await.unwrap();
        assert_eq!(third.enqueued, 0);
        assert_eq!(f.store.stats(None).await.unwrap().total(), 1);
    }

    #[tokio::test]
    async fn first_cycle_looks_back_one_poll_interval() {
        let schedule = ScheduleDefinition::new(
            "report",
            "ok",
            Recurrence::daily(TimeOfDay::hm(11, 58).unwrap()),
        );
        let config = DispatchConfig::default().with_poll_interval(Duration::from_secs(180));
        let f = fixture(vec![schedule], config);

        let (enqueued, _) = f.background.materialize_due(f.clock.now()).await.unwrap();
        assert_eq!(enqueued, 1);
    }

    #[tokio::test]
    async fn catch_up_is_bounded() {
        let schedule = every_minute("heartbeat", "ok").allow_overlap(true);
        let f = fixture(vec![schedule], DispatchConfig::default());
        f.background.materialize_due(t0()).await.unwrap();

        // Two hours without a cycle: only the most recent windows are replayed.
        let later = t0() + chrono::Duration::hours(2);
        let (enqueued, _) = f.background.materialize_due(later).await.unwrap();
        assert_eq!(enqueued, SCHEDULE_CATCH_UP_MINUTES as usize);

        let oldest = f
            .store
            .list(&JobFilter::all())
            .await
            .unwrap()
            .into_iter()
            .map(|j| j.scheduled_at)
            .filter(|at| *at > t0())
            .min();
        assert_eq!(
            oldest,
            Some(Recurrence::due_window(later) - chrono::Duration::minutes(SCHEDULE_CATCH_UP_MINUTES - 1))
        );
    }

    #[tokio::test]
    async fn unfinished_previous_run_blocks_overlap() {
        // "broken" stays pending between retries, so the schedule stays active.
        let f = fixture(vec![every_minute("flaky", "broken")], DispatchConfig::default());
        let deferred = DeferredBuffer::new();

        f.background.run_cycle(&deferred).await.unwrap();
        f.clock.advance(chrono::Duration::minutes(1));
        let report = f.background.run_cycle(&deferred).await.unwrap();

        assert_eq!(report.enqueued, 0);
        assert_eq!(report.skipped_overlap, 1);
        assert_eq!(f.store.stats(None).await.unwrap().total(), 1);
    }

    #[tokio::test]
    async fn overlap_allowed_when_configured() {
        let schedule = every_minute("flaky", "broken").allow_overlap(true);
        let f = fixture(vec![schedule], DispatchConfig::default());
        let deferred = DeferredBuffer::new();

        f.background.run_cycle(&deferred).await.unwrap();
        f.clock.advance(chrono::Duration::minutes(1));
        let report = f.background.run_cycle(&deferred).await.unwrap();

        assert_eq!(report.enqueued, 1);
        assert_eq!(f.store.stats(None).await.unwrap().total(), 2);
    }

    #[tokio::test]
    async fn paused_cycle_claims_nothing_but_drains_deferred() {
        let f = fixture(vec![], DispatchConfig::default());
        f.background.dispatcher().enqueue("ok", serde_json::json!({})).await.unwrap();
        f.pause.set_paused(true).await.unwrap();

        let ran = Arc::new(AtomicUsize::new(0));
        let deferred = DeferredBuffer::new();
        let r = ran.clone();
        deferred.push(async move {
            r.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let report = f.background.run_cycle(&deferred).await.unwrap();
        assert!(report.paused);
        assert!(report.batches.is_empty());
        assert_eq!(report.deferred.executed, 1);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(f.store.stats(None).await.unwrap().pending, 1);

        // An explicit override beats the stored flag.
        let report = f.background.run_cycle_with(&deferred, Some(false)).await.unwrap();
        assert!(!report.paused);
        assert_eq!(report.totals().completed, 1);
    }

    #[tokio::test]
    async fn pause_flag_ignored_when_not_checked() {
        let f = fixture(vec![], DispatchConfig::default().with_check_pause_flag(false));
        f.background.dispatcher().enqueue("ok", serde_json::json!({})).await.unwrap();
        f.pause.set_paused(true).await.unwrap();

        let report = f.background.run_cycle(&DeferredBuffer::new()).await.unwrap();
        assert!(!report.paused);
        assert_eq!(report.totals().completed, 1);
    }

    #[tokio::test]
    async fn every_configured_queue_is_dispatched() {
        let f = fixture(vec![], DispatchConfig::default().with_queues(["default", "mail"]));
        let dispatcher = f.background.dispatcher();
        dispatcher.enqueue("ok", serde_json::json!({})).await.unwrap();
        dispatcher.enqueue_to("mail", "ok", serde_json::json!({})).await.unwrap();
        dispatcher.enqueue_to("ignored", "ok", serde_json::json!({})).await.unwrap();

        let report = f.background.run_cycle(&DeferredBuffer::new()).await.unwrap();
        let queues: Vec<_> = report.batches.iter().map(|(q, _)| q.as_str()).collect();
        assert_eq!(queues, vec!["default", "mail"]);
        assert_eq!(report.totals().completed, 2);
        assert_eq!(
            f.store
                .list(&JobFilter::all().with_status(JobStatus::Pending))
                .await
                .unwrap()[0]
                .queue,
            "ignored"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn spawned_dispatcher_runs_until_shutdown() {
        let f = fixture(vec![], DispatchConfig::default());
        let background = Arc::new(f.background);
        background.dispatcher().enqueue("ok", serde_json::json!({})).await.unwrap();

        let handle = background.clone().spawn(Duration::from_secs(5));
        tokio::time::sleep(Duration::from_secs(12)).await;

        let stats = handle.stats();
        assert!(stats.cycles >= 2);
        assert_eq!(stats.jobs_completed, 1);

        let ran = Arc::new(AtomicUsize::new(0));
        let r = ran.clone();
        handle.deferred().push(async move {
            r.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        handle.shutdown().await;
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
