//! `afterhours` command-line interface.
//!
//! Applications embed the CLI by building their own [`TaskRegistry`] and
//! handing it to [`run`]; the built-in retention task is always registered.

pub mod commands;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use afterhours_core::JobId;
use afterhours_infra::jobs::{postgres, JobStatus, PostgresJobStore, QueueDispatcher};
use afterhours_infra::tasks::{PruneTask, TaskRegistry, PRUNE_TASK_TYPE};
use afterhours_infra::{BackgroundDispatcher, PostgresPauseFlag, RuntimeConfig, ScheduleFile};
use afterhours_observability::LogFormat;

const MAX_CONNECTIONS: u32 = 5;

#[derive(Parser, Debug)]
#[command(name = "afterhours", version, about = "Background task dispatch")]
pub struct Cli {
    /// Postgres connection string.
    #[arg(long, env = "DATABASE_URL", global = true, hide_env_values = true)]
    pub database_url: Option<String>,

    /// TOML file with schedule definitions (overrides AFTERHOURS_SCHEDULE_FILE).
    #[arg(long, global = true)]
    pub schedule_file: Option<PathBuf>,

    /// Comma-separated queues to dispatch (overrides AFTERHOURS_QUEUES).
    #[arg(long, global = true, value_delimiter = ',')]
    pub queues: Vec<String>,

    /// Records claimed per queue per batch (overrides AFTERHOURS_BATCH_SIZE).
    #[arg(long, global = true)]
    pub batch_size: Option<usize>,

    /// Log output format: json or pretty.
    #[arg(long, global = true, default_value = "json")]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Run one background cycle: schedules, every queue, deferred callbacks.
    Run {
        /// Dispatch even when the pause flag is set.
        #[arg(long)]
        ignore_pause: bool,
    },
    /// Run one batch per queue without releasing stuck reservations.
    RunPending,
    /// Put failed jobs back to pending and run them.
    RetryFailed {
        #[arg(long)]
        queue: Option<String>,
        #[arg(long)]
        id: Option<JobId>,
    },
    /// Delete jobs by status and/or queue.
    Flush {
        #[arg(long)]
        status: Option<JobStatus>,
        #[arg(long)]
        queue: Option<String>,
        /// Required to delete every job when no filter is given.
        #[arg(long)]
        all: bool,
    },
    /// Set the global pause flag.
    Pause,
    /// Clear the global pause flag.
    Resume,
    /// List jobs, oldest first.
    List {
        #[arg(long)]
        status: Option<JobStatus>,
        #[arg(long)]
        queue: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// Show one job.
    Describe { id: JobId },
    /// Count jobs by status.
    Stats {
        #[arg(long)]
        queue: Option<String>,
    },
    /// Show schedule definitions and their next run.
    Schedules,
    /// Enqueue a job.
    Enqueue {
        task_type: String,
        /// JSON payload.
        #[arg(long, default_value = "{}")]
        payload: String,
        #[arg(long)]
        queue: Option<String>,
        /// Delay before the job becomes eligible.
        #[arg(long)]
        delay_minutes: Option<u32>,
    },
    /// Run cycles until interrupted.
    Work {
        /// Seconds between cycles (overrides AFTERHOURS_POLL_INTERVAL_SECS).
        #[arg(long)]
        poll_interval: Option<u64>,
    },
    /// Delete finished jobs past their retention age.
    Prune {
        #[arg(long, default_value_t = 7)]
        completed_days: u32,
        #[arg(long, default_value_t = 30)]
        failed_days: u32,
        /// Also seed the recurring daily prune job.
        #[arg(long)]
        install: bool,
    },
    /// Apply database migrations.
    Migrate,
}

impl Cli {
    /// Layer command-line flags over environment configuration.
    pub fn apply(&self, runtime: &mut RuntimeConfig) {
        if let Some(url) = &self.database_url {
            runtime.database_url = Some(url.clone());
        }
        if let Some(path) = &self.schedule_file {
            runtime.schedule_file = path.clone();
        }
        if !self.queues.is_empty() {
            runtime.dispatch = runtime.dispatch.clone().with_queues(self.queues.clone());
        }
        if let Some(batch_size) = self.batch_size {
            runtime.dispatch = runtime.dispatch.clone().with_batch_size(batch_size);
        }
        if let Command::Work {
            poll_interval: Some(secs),
        } = self.command
        {
            runtime.dispatch = runtime
                .dispatch
                .clone()
                .with_poll_interval(std::time::Duration::from_secs(secs.max(1)));
        }
    }
}

/// Execute `cli` against Postgres, with `registry` plus the built-in tasks.
pub async fn run(cli: Cli, mut registry: TaskRegistry) -> anyhow::Result<()> {
    let mut runtime = RuntimeConfig::from_env()?;
    cli.apply(&mut runtime);
    let mut out = std::io::stdout();

    let schedules = ScheduleFile::load_optional(&runtime.schedule_file)?.schedules;
    if cli.command == Command::Schedules {
        return commands::show_schedules(&schedules, chrono::Utc::now(), &mut out);
    }

    let pool = postgres::connect(runtime.require_database_url()?, MAX_CONNECTIONS).await?;
    if cli.command == Command::Migrate {
        postgres::migrate(&pool).await?;
        tracing::info!("migrations applied");
        return Ok(());
    }

    let store = PostgresJobStore::new(pool.clone());
    if !registry.contains(PRUNE_TASK_TYPE) {
        registry.register(PruneTask::new(Arc::new(store.clone())));
    }

    let dispatcher = QueueDispatcher::new(store, Arc::new(registry), runtime.dispatch.clone());
    let background = BackgroundDispatcher::new(
        dispatcher,
        schedules,
        Arc::new(PostgresPauseFlag::new(pool)),
    );
    commands::execute(cli.command, Arc::new(background), &mut out).await
}
