//! SQLite persistent storage.
//!
//! The storage system consists of:
//! - **Store**: Job rows, configuration, control signals and worker heartbeats
//! - **Migrations**: Schema management and versioning
//!
//! # Usage
//!
//! ```rust,ignore
//! use queuectl::storage::Store;
//! use queuectl::scheduler::{JobFilter, JobSpec, JobState};
//!
//! let store = Store::open("/tmp/queue.db").await?;
//! let job = store.insert_job(&JobSpec::new("echo hi"), chrono::Utc::now()).await?;
//! let dead = store.list_jobs(&JobFilter::new().with_state(JobState::Dead)).await?;
//! ```

pub mod database;
pub mod migrations;
pub mod schema;

pub use database::{JobUpdate, StateSummary, Store, StoreError, TerminalEvent};
pub use migrations::{MigrationError, MigrationRunner};
