//! Task lookup by `task_type`.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use super::{Task, TaskError, TaskOutcome};

type TaskFactory = Arc<dyn Fn() -> Arc<dyn Task> + Send + Sync>;

/// Explicit map from `task_type` to a task factory, populated at process start.
#[derive(Clone, Default)]
pub struct TaskRegistry {
    factories: BTreeMap<String, TaskFactory>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a shared task instance under its own `task_type`.
    pub fn register<T: Task + 'static>(&mut self, task: T) -> &mut Self {
        let task: Arc<dyn Task> = Arc::new(task);
        let task_type = task.task_type().to_string();
        self.factories
            .insert(task_type, Arc::new(move || Arc::clone(&task)));
        self
    }

    /// Register a factory that builds a fresh task per resolution.
    pub fn register_factory<F>(&mut self, task_type: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn() -> Arc<dyn Task> + Send + Sync + 'static,
    {
        self.factories.insert(task_type.into(), Arc::new(factory));
        self
    }

    /// Register a closure as a one-shot task.
    pub fn register_fn<F, Fut>(&mut self, task_type: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<TaskOutcome, TaskError>> + Send + 'static,
    {
        self.register(FnTask {
            task_type: task_type.into(),
            f,
        })
    }

    pub fn resolve(&self, task_type: &str) -> Result<Arc<dyn Task>, TaskError> {
        self.factories
            .get(task_type)
            .map(|factory| factory())
            .ok_or_else(|| TaskError::UnknownTaskType(task_type.to_string()))
    }

    pub fn contains(&self, task_type: &str) -> bool {
        self.factories.contains_key(task_type)
    }

    /// Registered types, sorted.
    pub fn task_types(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

impl fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("task_types", &self.task_types())
            .finish()
    }
}

struct FnTask<F> {
    task_type: String,
    f: F,
}

#[async_trait]
impl<F, Fut> Task for FnTask<F>
where
    F: Fn(serde_json::Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<TaskOutcome, TaskError>> + Send + 'static,
{
    fn task_type(&self) -> &str {
        &self.task_type
    }

    async fn execute(&self, payload: &serde_json::Value) -> Result<TaskOutcome, TaskError> {
        (self.f)(payload.clone()).await
    }
}
