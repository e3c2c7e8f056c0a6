//! queuectl: durable background job queue.
//!
//! Jobs are shell commands stored in a SQLite database shared by every
//! process. Workers claim jobs atomically, run them under a timeout, retry
//! failures with exponential backoff and move exhausted jobs to a dead
//! letter queue.

pub mod cli;
pub mod config;
pub mod error;
pub mod metrics;
pub mod scheduler;
pub mod storage;

// Re-export commonly used types
pub use config::{ConfigError, ConfigKey, GlobalSettings, QueueConfig};
pub use error::{SubmitError, UnknownState};
pub use scheduler::{Job, JobQueue, JobSpec, JobState, WorkerPool, WorkerPoolConfig};
pub use storage::{Store, StoreError};
