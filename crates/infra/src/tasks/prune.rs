//! Built-in retention task.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use afterhours_core::{Clock, CoreResult, Scheduler, SystemClock};

use super::{parse_payload, Occurrence, Task, TaskError, TaskOutcome};
use crate::jobs::{JobStatus, JobStore};

pub const PRUNE_TASK_TYPE: &str = "afterhours.prune";

/// Retention ages, in days, per terminal status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrunePayload {
    pub completed_days: u32,
    pub failed_days: u32,
}

impl Default for PrunePayload {
    fn default() -> Self {
        Self {
            completed_days: 7,
            failed_days: 30,
        }
    }
}

impl PrunePayload {
    pub fn to_value(self) -> serde_json::Value {
        serde_json::json!({
            "completed_days": self.completed_days,
            "failed_days": self.failed_days,
        })
    }
}

/// Deletes terminal records past their retention age. Runs daily at 03:00 UTC.
pub struct PruneTask {
    store: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
}

impl PruneTask {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Delete expired records now; returns `(completed, failed)` counts.
    pub async fn prune(&self, retention: PrunePayload) -> Result<(u64, u64), TaskError> {
        let now = self.clock.now();
        let completed = self
            .prune_status(JobStatus::Completed, now, retention.completed_days)
            .await?;
        let failed = self
            .prune_status(JobStatus::Failed, now, retention.failed_days)
            .await?;
        info!(completed, failed, "pruned finished jobs");
        Ok((completed, failed))
    }

    async fn prune_status(
        &self,
        status: JobStatus,
        now: DateTime<Utc>,
        days: u32,
    ) -> Result<u64, TaskError> {
        let cutoff = now - Duration::days(i64::from(days));
        self.store
            .prune(status, cutoff)
            .await
            .map_err(|e| TaskError::execution(e.to_string()))
    }
}

#[async_trait]
impl Task for PruneTask {
    fn task_type(&self) -> &str {
        PRUNE_TASK_TYPE
    }

    fn occurrence(&self) -> Occurrence {
        Occurrence::Always
    }

    fn period(&self, scheduler: Scheduler) -> CoreResult<DateTime<Utc>> {
        scheduler.day(1).at_hms(3, 0, 0)?.resolve_now()
    }

    async fn execute(&self, payload: &serde_json::Value) -> Result<TaskOutcome, TaskError> {
        let retention = if payload.is_null() {
            PrunePayload::default()
        } else {
            parse_payload(payload)?
        };
        self.prune(retention).await?;
        Ok(TaskOutcome::Success)
    }
}
