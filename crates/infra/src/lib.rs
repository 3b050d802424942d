//! Infrastructure layer: job storage, dispatch, schedules and configuration.

pub mod background;
pub mod config;
pub mod deferred;
pub mod jobs;
pub mod pause;
pub mod schedules;
pub mod tasks;

pub use background::{
    BackgroundDispatcher, CycleReport, DispatcherHandle, DispatcherStats, SCHEDULE_CATCH_UP_MINUTES,
};
pub use config::{ConfigError, DispatchConfig, RuntimeConfig};
pub use deferred::{DeferredBuffer, DeferredReport};
pub use pause::{InMemoryPauseFlag, PauseFlag, PostgresPauseFlag};
pub use schedules::{ScheduleDefinition, ScheduleFile};

/// Best-effort text of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
