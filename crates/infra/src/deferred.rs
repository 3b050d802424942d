//! In-process buffer of callbacks run at the end of a background cycle.
//!
//! The buffer is not durable: callbacks still queued when the process exits are
//! lost. Use a job for anything that must survive a crash.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::{Mutex, MutexGuard};

use futures::FutureExt;
use serde::Serialize;
use tracing::{debug, warn};

type Callback = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

struct Entry {
    scope: Option<String>,
    callback: Callback,
}

/// Ordered, optionally scoped list of pending callbacks.
#[derive(Default)]
pub struct DeferredBuffer {
    entries: Mutex<Vec<Entry>>,
}

/// A callback that returned an error or panicked during a drain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeferredFailure {
    /// Position in drain order
    pub index: usize,
    pub scope: Option<String>,
    pub message: String,
}

/// Outcome of [`DeferredBuffer::drain_all`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeferredReport {
    pub executed: usize,
    pub failures: Vec<DeferredFailure>,
}

impl DeferredReport {
    pub fn succeeded(&self) -> usize {
        self.executed - self.failures.len()
    }
}

impl DeferredBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Entry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn push<F>(&self, callback: F)
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.lock().push(Entry {
            scope: None,
            callback: Box::pin(callback),
        });
    }

    pub fn push_scoped<F>(&self, scope: impl Into<String>, callback: F)
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.lock().push(Entry {
            scope: Some(scope.into()),
            callback: Box::pin(callback),
        });
    }

    /// Queue a closure; the future is only created when the buffer is drained.
    pub fn push_fn<F, Fut>(&self, f: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.push(async move { f().await });
    }

    /// Drop every callback queued under `scope`. Returns how many were dropped.
    pub fn discard_scope(&self, scope: &str) -> usize {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|e| e.scope.as_deref() != Some(scope));
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Distinct scopes currently queued, in first-seen order.
    pub fn scopes(&self) -> Vec<String> {
        let entries = self.lock();
        let mut scopes: Vec<String> = Vec::new();
        for scope in entries.iter().filter_map(|e| e.scope.as_ref()) {
            if !scopes.contains(scope) {
                scopes.push(scope.clone());
            }
        }
        scopes
    }

    /// Run every queued callback in insertion order and clear the buffer.
    ///
    /// Errors and panics are logged and collected; they never stop later
    /// callbacks. Callbacks pushed while draining wait for the next drain.
    pub async fn drain_all(&self) -> DeferredReport {
        let entries = std::mem::take(&mut *self.lock());
        let mut report = DeferredReport::default();

        for (index, entry) in entries.into_iter().enumerate() {
            report.executed += 1;
            let message = match AssertUnwindSafe(entry.callback).catch_unwind().await {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => format!("{e:#}"),
                Err(panic) => format!("callback panicked: {}", crate::panic_message(&*panic)),
            };
            warn!(index, scope = ?entry.scope, error = %message, "deferred callback failed");
            report.failures.push(DeferredFailure {
                index,
                scope: entry.scope,
                message,
            });
        }

        if report.executed > 0 {
            debug!(
                executed = report.executed,
                failed = report.failures.len(),
                "drained deferred callbacks"
            );
        }
        report
    }
}

impl std::fmt::Debug for DeferredBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeferredBuffer")
            .field("len", &self.len())
            .field("scopes", &self.scopes())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn recorder() -> Arc<Mutex<Vec<&'static str>>> {
        Arc::new(Mutex::new(Vec::new()))
    }

    async fn fail() -> anyhow::Result<()> {
        anyhow::bail!("first failed")
    }

    async fn explode() -> anyhow::Result<()> {
        panic!("second panicked")
    }

    #[tokio::test]
    async fn runs_in_insertion_order_and_clears() {
        let seen = recorder();
        let buffer = DeferredBuffer::new();
        for (scope, name) in [(None, "a"), (Some("s1"), "b"), (Some("s2"), "c"), (None, "d")] {
            let seen = seen.clone();
            let callback = async move {
                seen.lock().unwrap().push(name);
                Ok(())
            };
            match scope {
                Some(scope) => buffer.push_scoped(scope, callback),
                None => buffer.push(callback),
            }
        }
        assert_eq!(buffer.len(), 4);
        assert_eq!(buffer.scopes(), vec!["s1", "s2"]);

        let report = buffer.drain_all().await;
        assert_eq!(report.executed, 4);
        assert!(report.failures.is_empty());
        assert_eq!(*seen.lock().unwrap(), vec!["a", "b", "c", "d"]);
        assert!(buffer.is_empty());
    }

    #[tokio::test]
    async fn failing_callback_does_not_stop_the_rest() {
        let seen = recorder();
        let buffer = DeferredBuffer::new();

        buffer.push(fail());
        buffer.push_scoped("boom", explode());
        let s = seen.clone();
        buffer.push_fn(move || async move {
            s.lock().unwrap().push("third");
            Ok(())
        });

        let report = buffer.drain_all().await;
        assert_eq!(report.executed, 3);
        assert_eq!(report.succeeded(), 1);
        assert_eq!(report.failures.len(), 2);
        assert_eq!(report.failures[0].message, "first failed");
        assert_eq!(report.failures[1].scope.as_deref(), Some("boom"));
        assert!(report.failures[1].message.contains("second panicked"));
        assert_eq!(*seen.lock().unwrap(), vec!["third"]);
    }

    #[tokio::test]
    async fn discarded_scope_never_runs() {
        let seen = recorder();
        let buffer = DeferredBuffer::new();
        let s = seen.clone();
        buffer.push_scoped("tx-1", async move {
            s.lock().unwrap().push("rolled back");
            Ok(())
        });
        let s = seen.clone();
        buffer.push(async move {
            s.lock().unwrap().push("kept");
            Ok(())
        });

        assert_eq!(buffer.discard_scope("tx-1"), 1);
        buffer.drain_all().await;
        assert_eq!(*seen.lock().unwrap(), vec!["kept"]);
    }
}
