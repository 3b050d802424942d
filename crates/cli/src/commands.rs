//! Subcommand handlers. Each prints a JSON document to `out`.

use std::io::Write;
use std::sync::Arc;

use anyhow::{bail, Context};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::json;
use tracing::info;

use afterhours_infra::jobs::{JobFilter, JobStore, NewJob};
use afterhours_infra::tasks::{PrunePayload, PruneTask, PRUNE_TASK_TYPE};
use afterhours_infra::{BackgroundDispatcher, DeferredBuffer, PauseFlag, ScheduleDefinition};

use crate::Command;

fn print<T: Serialize>(out: &mut dyn Write, value: &T) -> anyhow::Result<()> {
    let text = serde_json::to_string_pretty(value)?;
    writeln!(out, "{text}")?;
    Ok(())
}

/// Run `command` against an assembled dispatcher.
///
/// `schedules` and `migrate` need no dispatcher and are handled by
/// [`crate::run`]; they are rejected here.
pub async fn execute<S>(
    command: Command,
    background: Arc<BackgroundDispatcher<S>>,
    out: &mut dyn Write,
) -> anyhow::Result<()>
where
    S: JobStore + Clone + 'static,
{
    let dispatcher = background.dispatcher();
    let store = dispatcher.store();

    match command {
        Command::Run { ignore_pause } => {
            let deferred = DeferredBuffer::new();
            let paused = ignore_pause.then_some(false);
            let report = background.run_cycle_with(&deferred, paused).await?;
            print(out, &report)
        }
        Command::RunPending => {
            let mut batches = Vec::new();
            for queue in &dispatcher.config().queues {
                batches.push((queue.clone(), dispatcher.run_pending_only(queue).await?));
            }
            print(out, &batches)
        }
        Command::RetryFailed { queue, id } => {
            let mut filter = JobFilter::all();
            if let Some(queue) = queue {
                filter = filter.with_queue(queue);
            }
            if let Some(id) = id {
                filter = filter.with_id(id);
            }
            let report = dispatcher.retry_failed(&filter).await?;
            print(out, &report)
        }
        Command::Flush { status, queue, all } => {
            if status.is_none() && queue.is_none() && !all {
                bail!("refusing to flush every job without --all");
            }
            let mut filter = JobFilter::all();
            if let Some(status) = status {
                filter = filter.with_status(status);
            }
            if let Some(queue) = queue {
                filter = filter.with_queue(queue);
            }
            let deleted = store.purge(&filter).await?;
            info!(deleted, "flushed jobs");
            print(out, &json!({ "deleted": deleted }))
        }
        Command::Pause => {
            background.pause_flag().set_paused(true).await?;
            print(out, &json!({ "paused": true }))
        }
        Command::Resume => {
            background.pause_flag().set_paused(false).await?;
            print(out, &json!({ "paused": false }))
        }
        Command::List {
            status,
            queue,
            limit,
        } => {
            let mut filter = JobFilter::all().with_limit(limit);
            if let Some(status) = status {
                filter = filter.with_status(status);
            }
            if let Some(queue) = queue {
                filter = filter.with_queue(queue);
            }
            print(out, &store.list(&filter).await?)
        }
        Command::Describe { id } => {
            let job = store
                .get(id)
                .await?
                .with_context(|| format!("job not found: {id}"))?;
            print(out, &job)
        }
        Command::Stats { queue } => {
            let stats = store.stats(queue.as_deref()).await?;
            print(
                out,
                &json!({
                    "pending": stats.pending,
                    "reserved": stats.reserved,
                    "completed": stats.completed,
                    "failed": stats.failed,
                    "total": stats.total(),
                    "paused": background.pause_flag().is_paused().await?,
                }),
            )
        }
        Command::Enqueue {
            task_type,
            payload,
            queue,
            delay_minutes,
        } => {
            let payload: serde_json::Value =
                serde_json::from_str(&payload).context("payload is not valid JSON")?;
            let mut job = NewJob::new(task_type, payload);
            if let Some(queue) = queue {
                job = job.on_queue(queue);
            }
            if let Some(minutes) = delay_minutes {
                job = job.scheduled_at(dispatcher.now() + Duration::minutes(i64::from(minutes)));
            }
            let id = dispatcher.submit(job).await?;
            print(out, &json!({ "id": id }))
        }
        Command::Work { .. } => {
            let interval = dispatcher.config().poll_interval;
            let handle = background.clone().spawn(interval);
            tokio::signal::ctrl_c()
                .await
                .context("failed to listen for ctrl-c")?;
            info!("shutdown requested");
            let stats = handle.stats();
            handle.shutdown().await;
            print(out, &stats)
        }
        Command::Prune {
            completed_days,
            failed_days,
            install,
        } => {
            let retention = PrunePayload {
                completed_days,
                failed_days,
            };
            let task = PruneTask::new(Arc::new(store.clone()));
            let (completed, failed) = task.prune(retention).await?;
            let seeded = if install {
                let job = NewJob::new(PRUNE_TASK_TYPE, retention.to_value());
                dispatcher.ensure_recurring(job).await?
            } else {
                None
            };
            print(
                out,
                &json!({ "completed": completed, "failed": failed, "seeded": seeded }),
            )
        }
        Command::Schedules => show_schedules(background.schedules(), dispatcher.now(), out),
        Command::Migrate => bail!("migrate needs a Postgres connection"),
    }
}

#[derive(Serialize)]
struct ScheduleView<'a> {
    name: &'a str,
    task: &'a str,
    queue: &'a str,
    when: String,
    allow_overlap: bool,
    next_run: Option<DateTime<Utc>>,
}

/// Print every definition with its next due window after `now`.
pub fn show_schedules(
    schedules: &[ScheduleDefinition],
    now: DateTime<Utc>,
    out: &mut dyn Write,
) -> anyhow::Result<()> {
    let views: Vec<_> = schedules
        .iter()
        .map(|def| ScheduleView {
            name: &def.name,
            task: &def.task_type,
            queue: &def.queue,
            when: def.recurrence.to_string(),
            allow_overlap: def.allow_overlap,
            next_run: def.next_run(now).ok(),
        })
        .collect();
    print(out, &views)
}
