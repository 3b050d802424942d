//! `afterhours-core`: time and identity primitives for background dispatch.
//!
//! This crate contains **pure** building blocks (no storage, no async): job
//! identifiers, the error model, the clock abstraction, the relative-time
//! `Scheduler` and the `Recurrence` rules used by schedule definitions.

pub mod clock;
pub mod error;
pub mod id;
pub mod recurrence;
pub mod scheduler;

pub use clock::{Clock, FakeClock, SystemClock};
pub use error::{CoreError, CoreResult};
pub use id::JobId;
pub use recurrence::Recurrence;
pub use scheduler::{Scheduler, TimeOfDay, TimeUnit};
