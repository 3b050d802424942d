//! Units of work executed by the dispatcher.
//!
//! A [`Task`] is looked up by its `task_type` in a [`TaskRegistry`] and run with
//! the payload stored on the job record. Tasks never touch storage for their own
//! bookkeeping: they return a [`TaskOutcome`] and the dispatcher performs the
//! state transition (and any follow-up insert).

pub mod prune;
pub mod registry;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;

use afterhours_core::{CoreError, CoreResult, Scheduler};

pub use prune::{PrunePayload, PruneTask, PRUNE_TASK_TYPE};
pub use registry::TaskRegistry;

/// Whether a task re-enqueues itself after a successful run.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Occurrence {
    Once,
    Always,
}

/// Result of a single execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Success,
    /// Success, and run again at the given instant.
    Reschedule(DateTime<Utc>),
    /// Failed; counts against the attempt budget.
    Failure(String),
}

/// Task error.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("no task registered for type: {0}")]
    UnknownTaskType(String),
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    #[error("execution failed: {0}")]
    Execution(String),
    #[error(transparent)]
    Schedule(#[from] CoreError),
}

impl TaskError {
    pub fn execution(msg: impl Into<String>) -> Self {
        Self::Execution(msg.into())
    }
}

/// A registered unit of work.
#[async_trait]
pub trait Task: Send + Sync {
    fn task_type(&self) -> &str;

    fn occurrence(&self) -> Occurrence {
        Occurrence::Once
    }

    /// Next-run instant after a successful run of an `Always` task. `scheduler`
    /// is fresh and seeded at the completion instant.
    fn period(&self, scheduler: Scheduler) -> CoreResult<DateTime<Utc>> {
        scheduler.day(1).resolve_now()
    }

    /// Run once. Must be safe to repeat: a run whose reservation timed out is
    /// executed again.
    async fn execute(&self, payload: &serde_json::Value) -> Result<TaskOutcome, TaskError>;
}

/// Decode a job payload into a task's input type.
pub fn parse_payload<T: DeserializeOwned>(payload: &serde_json::Value) -> Result<T, TaskError> {
    serde_json::from_value(payload.clone()).map_err(|e| TaskError::InvalidPayload(e.to_string()))
}
