//! SQLite-backed job queue facade.
//!
//! `JobQueue` is the entry point for producers and operators: submission,
//! inspection, dead letter queue management, configuration and the status
//! report. Execution lives in [`WorkerPool`](super::worker_pool::WorkerPool).
//!
//! # Reliability
//!
//! Every change is a conditional update against the shared database, so
//! several CLI invocations and worker pools can operate on one queue file at
//! the same time.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tracing::info;

use crate::config::{ConfigError, ConfigKey};
use crate::error::SubmitError;
use crate::storage::{Store, StoreError};

use super::job::{Job, JobFilter, JobSpec, JobState};
use super::retry::DeadLetterQueue;

/// Errors that can occur during queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Snapshot of queue health.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueStatus {
    /// Execution loops with a fresh heartbeat, across all processes.
    pub workers_active: u64,
    /// Job count for every state, zero included.
    pub job_counts: BTreeMap<JobState, u64>,
    pub dlq_size: u64,
}

/// Effective value of one configuration key.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConfigEntry {
    pub key: String,
    pub value: String,
    /// True when the key was never set and the default applies.
    pub is_default: bool,
}

/// Job queue over a shared [`Store`].
#[derive(Debug, Clone)]
pub struct JobQueue {
    store: Store,
    dlq: DeadLetterQueue,
    stale_after: Duration,
}

impl JobQueue {
    /// Creates a queue over an opened store.
    pub fn new(store: Store) -> Self {
        Self {
            dlq: DeadLetterQueue::new(store.clone()),
            store,
            stale_after: Duration::from_secs(30),
        }
    }

    /// Opens the database at `path` and wraps it in a queue.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Ok(Self::new(Store::open(path).await?))
    }

    /// Heartbeat age beyond which a worker no longer counts as active.
    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn dlq(&self) -> &DeadLetterQueue {
        &self.dlq
    }

    /// Submits a job. It starts `pending` with zero attempts.
    pub async fn enqueue(&self, spec: JobSpec) -> Result<Job, SubmitError> {
        spec.validate()?;
        let job = self.store.insert_job(&spec, Utc::now()).await?;

        info!(
            job_id = %job.id,
            priority = job.priority,
            run_at = %job.run_at,
            "Job enqueued"
        );
        Ok(job)
    }

    /// Submits a job described as JSON.
    pub async fn enqueue_json(&self, json: &str) -> Result<Job, SubmitError> {
        self.enqueue(JobSpec::from_json(json)?).await
    }

    pub async fn get(&self, id: &str) -> Result<Option<Job>, StoreError> {
        self.store.get_job(id).await
    }

    pub async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError> {
        self.store.list_jobs(filter).await
    }

    /// Effective value of `key`: the stored value, or its default.
    pub async fn get_config(&self, key: ConfigKey) -> Result<String, StoreError> {
        Ok(self
            .store
            .get_config(key.as_str())
            .await?
            .unwrap_or_else(|| key.default_value().to_string()))
    }

    /// Validates and stores `value`; returns the normalised value written.
    ///
    /// Takes effect for jobs claimed after the write.
    pub async fn set_config(&self, key: ConfigKey, value: &str) -> Result<String, QueueError> {
        let normalised = key.validate(value)?;
        self.store.set_config(key.as_str(), &normalised).await?;
        info!(key = key.as_str(), value = %normalised, "Configuration updated");
        Ok(normalised)
    }

    /// Every known key with its effective value.
    pub async fn config_entries(&self) -> Result<Vec<ConfigEntry>, StoreError> {
        let stored: BTreeMap<String, String> = self.store.config_entries().await?.into_iter().collect();

        Ok(ConfigKey::ALL
            .iter()
            .map(|key| match stored.get(key.as_str()) {
                Some(value) => ConfigEntry {
                    key: key.as_str().to_string(),
                    value: value.clone(),
                    is_default: false,
                },
                None => ConfigEntry {
                    key: key.as_str().to_string(),
                    value: key.default_value().to_string(),
                    is_default: true,
                },
            })
            .collect())
    }

    /// Counts per state, active workers and DLQ size.
    pub async fn status(&self) -> Result<QueueStatus, StoreError> {
        let stale = chrono::Duration::milliseconds(self.stale_after.as_millis() as i64);
        let workers_active = self.store.active_worker_count(Utc::now() - stale).await?;
        let stored = self.store.count_by_state().await?;

        let job_counts: BTreeMap<JobState, u64> = JobState::ALL
            .iter()
            .map(|state| (*state, stored.get(state).copied().unwrap_or(0)))
            .collect();
        let dlq_size = job_counts.get(&JobState::Dead).copied().unwrap_or(0);

        Ok(QueueStatus {
            workers_active,
            job_counts,
            dlq_size,
        })
    }

    /// Asks every worker pool sharing this database to stop after its current jobs.
    pub async fn request_stop(&self) -> Result<(), StoreError> {
        self.store.write_control_signal(true).await?;
        info!("Stop requested for all workers");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn temp_queue() -> (tempfile::TempDir, JobQueue) {
        let dir = tempfile::tempdir().unwrap();
        let queue = JobQueue::open(dir.path().join("queue.db")).await.unwrap();
        (dir, queue)
    }

    #[tokio::test]
    async fn test_enqueue_defaults() {
        let (_dir, queue) = temp_queue().await;
        let before = Utc::now();

        let job = queue.enqueue(JobSpec::new("echo hi")).await.unwrap();

        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.attempts, 0);
        assert_eq!(job.priority, 5);
        assert!(job.run_at.timestamp_millis() >= before.timestamp_millis());
        assert!(job.max_retries.is_none());
    }

    #[tokio::test]
    async fn test_enqueue_rejects_empty_command() {
        let (_dir, queue) = temp_queue().await;
        let err = queue.enqueue(JobSpec::new("")).await.unwrap_err();
        assert!(matches!(err, SubmitError::EmptyCommand));
        assert!(queue.list(&JobFilter::new()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_enqueue_json_and_duplicate() {
        let (_dir, queue) = temp_queue().await;
        let json = r#"{"id": "job1", "command": "sleep 1", "priority": 2}"#;

        let job = queue.enqueue_json(json).await.unwrap();
        assert_eq!(job.id, "job1");
        assert_eq!(job.priority, 2);

        let err = queue.enqueue_json(json).await.unwrap_err();
        assert!(matches!(err, SubmitError::Store(StoreError::DuplicateJob(_))));
    }

    #[tokio::test]
    async fn test_config_roundtrip() {
        let (_dir, queue) = temp_queue().await;

        assert_eq!(queue.get_config(ConfigKey::MaxRetries).await.unwrap(), "3");
        assert_eq!(
            queue.set_config(ConfigKey::MaxRetries, "5").await.unwrap(),
            "5"
        );
        assert_eq!(queue.get_config(ConfigKey::MaxRetries).await.unwrap(), "5");

        assert!(matches!(
            queue.set_config(ConfigKey::BaseBackoff, "0.2").await,
            Err(QueueError::Config(_))
        ));

        let entries = queue.config_entries().await.unwrap();
        assert_eq!(entries.len(), 3);
        let max_retries = entries.iter().find(|e| e.key == "max_retries").unwrap();
        assert!(!max_retries.is_default);
        let timeout = entries.iter().find(|e| e.key == "job_timeout_sec").unwrap();
        assert!(timeout.is_default);
        assert_eq!(timeout.value, "30");
    }

    #[tokio::test]
    async fn test_status_zero_fills() {
        let (_dir, queue) = temp_queue().await;
        queue.enqueue(JobSpec::new("true")).await.unwrap();

        let status = queue.status().await.unwrap();
        assert_eq!(status.workers_active, 0);
        assert_eq!(status.dlq_size, 0);
        assert_eq!(status.job_counts.len(), 5);
        assert_eq!(status.job_counts[&JobState::Pending], 1);
        assert_eq!(status.job_counts[&JobState::Dead], 0);

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["job_counts"]["pending"], 1);
    }

    #[tokio::test]
    async fn test_request_stop_sets_control_flag() {
        let (_dir, queue) = temp_queue().await;
        queue.request_stop().await.unwrap();
        assert!(queue.store().read_control_signal().await.unwrap());
    }
}
