//! Error types shared across queuectl subsystems.
//!
//! Subsystem-specific errors live next to their code (`StoreError` in
//! `storage::database`, `PoolError` in `scheduler::worker_pool`,
//! `ConfigError` in `config`). This module holds the errors that cross module
//! boundaries.

use thiserror::Error;

use crate::storage::StoreError;

/// A state string that is not part of the job lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Unknown job state '{0}'")]
pub struct UnknownState(pub String);

/// Errors that can occur while submitting a job.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("Job command cannot be empty")]
    EmptyCommand,

    #[error("Invalid job JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("Invalid job option: {0}")]
    InvalidOverride(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Store(#[from] StoreError),
}
