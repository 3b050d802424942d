//! Durable job records and their dispatch.
//!
//! ## Components
//!
//! - `JobRecord`: one unit of deferred work and its lifecycle state
//! - `JobStore`: persistence (in-memory or Postgres) with atomic claims
//! - `QueueDispatcher`: claims due records, runs their tasks, settles outcomes

pub mod dispatcher;
pub mod postgres;
pub mod store;
pub mod types;

pub use dispatcher::{BatchReport, DispatchError, QueueDispatcher, RetryReport};
pub use postgres::PostgresJobStore;
pub use store::{InMemoryJobStore, JobStore, JobStoreError};
pub use types::{
    stuck_cutoff, FailureDisposition, JobFilter, JobRecord, JobStats, JobStatus, NewJob,
    DEFAULT_QUEUE,
};
