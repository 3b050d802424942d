//! Schedule definitions: recurring jobs materialized by background cycles.
//!
//! Definitions are usually loaded from a TOML file:
//!
//! ```toml
//! [[schedule]]
//! name = "nightly-report"
//! task = "reports.nightly"
//! when = "daily 02:00"
//! queue = "reports"
//! payload = { format = "pdf" }
//!
//! [[schedule]]
//! name = "sync"
//! task = "crm.sync"
//! when = "every 15m"
//! allow_overlap = true
//! ```

use std::collections::HashSet;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use afterhours_core::{CoreResult, Recurrence};

use crate::config::ConfigError;
use crate::jobs::{NewJob, DEFAULT_QUEUE};

/// A named recurring job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleDefinition {
    pub name: String,
    #[serde(rename = "task")]
    pub task_type: String,
    #[serde(default = "empty_payload")]
    pub payload: serde_json::Value,
    #[serde(default = "default_queue")]
    pub queue: String,
    #[serde(rename = "when")]
    pub recurrence: Recurrence,
    /// Materialize even while an earlier record of this schedule is unfinished.
    #[serde(default)]
    pub allow_overlap: bool,
}

fn empty_payload() -> serde_json::Value {
    serde_json::Value::Object(Default::default())
}

fn default_queue() -> String {
    DEFAULT_QUEUE.to_string()
}

impl ScheduleDefinition {
    pub fn new(
        name: impl Into<String>,
        task_type: impl Into<String>,
        recurrence: Recurrence,
    ) -> Self {
        Self {
            name: name.into(),
            task_type: task_type.into(),
            payload: empty_payload(),
            queue: default_queue(),
            recurrence,
            allow_overlap: false,
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn on_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn allow_overlap(mut self, allow: bool) -> Self {
        self.allow_overlap = allow;
        self
    }

    /// Unique key of the record materialized for `window`.
    pub fn dedupe_key(&self, window: DateTime<Utc>) -> String {
        format!("schedule:{}:{}", self.name, window.format("%Y-%m-%dT%H:%MZ"))
    }

    /// The submission for `window`.
    pub fn job_for(&self, window: DateTime<Utc>) -> NewJob {
        NewJob::new(&self.task_type, self.payload.clone())
            .on_queue(&self.queue)
            .scheduled_at(window)
            .from_schedule(&self.name)
            .dedupe_key(self.dedupe_key(window))
    }

    pub fn next_run(&self, after: DateTime<Utc>) -> CoreResult<DateTime<Utc>> {
        self.recurrence.next_after(after)
    }
}

/// Contents of a schedule file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleFile {
    #[serde(default, rename = "schedule")]
    pub schedules: Vec<ScheduleDefinition>,
}

impl ScheduleFile {
    pub fn parse(path: &Path, contents: &str) -> Result<Self, ConfigError> {
        let file: ScheduleFile = toml::from_str(contents).map_err(|e| ConfigError::Schedule {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        file.validate(path)?;
        Ok(file)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(path, &contents)
    }

    /// Like [`ScheduleFile::load`], but a missing file yields no schedules.
    pub fn load_optional(path: &Path) -> Result<Self, ConfigError> {
        match Self::load(path) {
            Err(ConfigError::Read { source, .. })
                if source.kind() == std::io::ErrorKind::NotFound =>
            {
                Ok(Self::default())
            }
            other => other,
        }
    }

    fn validate(&self, path: &Path) -> Result<(), ConfigError> {
        let invalid = |message: String| ConfigError::Schedule {
            path: path.to_path_buf(),
            message,
        };
        let mut seen = HashSet::new();
        for def in &self.schedules {
            if def.name.trim().is_empty() {
                return Err(invalid("schedule name must not be empty".to_string()));
            }
            if def.task_type.trim().is_empty() {
                return Err(invalid(format!("schedule {:?} has no task", def.name)));
            }
            if !seen.insert(def.name.as_str()) {
                return Err(invalid(format!("duplicate schedule name {:?}", def.name)));
            }
        }
        Ok(())
    }
}
