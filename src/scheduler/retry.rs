//! Retry/backoff decisions and the dead letter queue.
//!
//! After every execution the [`RetryManager`] moves the job out of
//! `processing`: to `completed`, back to `pending` with an exponential delay,
//! or to `dead` once its retries are exhausted. Dead jobs form the DLQ; the
//! [`DeadLetterQueue`] lets an operator inspect, requeue or purge them.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::storage::{JobUpdate, Store, StoreError};

use super::executor::{ExecutionResult, Outcome};
use super::job::{ClaimedJob, Job, JobFilter, JobState};

/// Upper bound on a single backoff delay.
pub const MAX_BACKOFF: Duration = Duration::from_secs(24 * 60 * 60);

/// Delay before retry number `attempts`: `base ^ attempts` seconds, capped at [`MAX_BACKOFF`].
pub fn backoff_delay(base: f64, attempts: u32) -> Duration {
    let exponent = i32::try_from(attempts).unwrap_or(i32::MAX);
    let secs = base.powi(exponent);
    if !secs.is_finite() || secs >= MAX_BACKOFF.as_secs_f64() {
        return MAX_BACKOFF;
    }
    Duration::from_secs_f64(secs.max(0.0))
}

/// State change applied after an execution.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Completed,
    /// Back to `pending`, eligible again at `run_at`.
    Retrying {
        attempts: u32,
        run_at: DateTime<Utc>,
    },
    /// Retries exhausted; the job is now in the DLQ.
    Dead { attempts: u32 },
    /// The job had already left `processing`; nothing was written.
    Lost,
}

/// Applies execution outcomes to claimed jobs.
#[derive(Debug, Clone)]
pub struct RetryManager {
    store: Store,
}

impl RetryManager {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Computes the transition and row update for an outcome without touching the store.
    pub fn plan(
        claimed: &ClaimedJob,
        outcome: &Outcome,
        duration_sec: f64,
        now: DateTime<Utc>,
    ) -> (Transition, JobUpdate) {
        let job = &claimed.job;
        let base = JobUpdate::new()
            .duration_sec(Some(duration_sec))
            .claimed_by(None);

        let error = match outcome {
            Outcome::Success => {
                let update = base
                    .state(JobState::Completed)
                    .last_error(None)
                    .finished_at(Some(now));
                return (Transition::Completed, update);
            }
            Outcome::Failure { error, .. } => error.clone(),
        };

        let attempts = job.attempts.saturating_add(1);
        let max_retries = claimed.settings.max_retries;
        let base = base.last_error(Some(error));

        if attempts < max_retries {
            let delay = backoff_delay(claimed.settings.base_backoff, attempts);
            let delay = chrono::Duration::milliseconds(delay.as_millis() as i64);
            // Never pull run_at backwards.
            let run_at = std::cmp::max(now + delay, job.run_at);
            let update = base.attempts(attempts).state(JobState::Pending).run_at(run_at);
            (Transition::Retrying { attempts, run_at }, update)
        } else {
            // max_retries may have been lowered since the earlier failures.
            let attempts = attempts.min(max_retries);
            let update = base
                .attempts(attempts)
                .state(JobState::Dead)
                .finished_at(Some(now));
            (Transition::Dead { attempts }, update)
        }
    }

    /// Records the result of executing `claimed`.
    ///
    /// Guarded on the job still being `processing`, so calling it twice for
    /// the same execution writes once and reports [`Transition::Lost`] after.
    pub async fn record_outcome(
        &self,
        claimed: &ClaimedJob,
        result: &ExecutionResult,
        now: DateTime<Utc>,
    ) -> Result<Transition, StoreError> {
        let (transition, update) = Self::plan(claimed, &result.outcome, result.duration_sec(), now);

        if !self
            .store
            .update_job(&claimed.job.id, JobState::Processing, &update)
            .await?
        {
            warn!(job_id = %claimed.job.id, "Job left processing before its outcome was recorded");
            return Ok(Transition::Lost);
        }

        match &transition {
            Transition::Retrying { attempts, run_at } => {
                info!(job_id = %claimed.job.id, attempt = attempts, run_at = %run_at, "Job scheduled for retry");
            }
            Transition::Dead { attempts } => {
                warn!(job_id = %claimed.job.id, attempts, "Job moved to dead letter queue");
            }
            _ => {}
        }

        Ok(transition)
    }
}

/// Operator view of the dead letter queue.
#[derive(Debug, Clone)]
pub struct DeadLetterQueue {
    store: Store,
}

impl DeadLetterQueue {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Lists dead jobs in submission order.
    pub async fn list(&self) -> Result<Vec<Job>, StoreError> {
        self.store
            .list_jobs(&JobFilter::new().with_state(JobState::Dead))
            .await
    }

    /// Requeues a dead job with a fresh retry budget, eligible immediately.
    pub async fn retry(&self, id: &str, now: DateTime<Utc>) -> Result<Job, StoreError> {
        let update = JobUpdate::new()
            .state(JobState::Pending)
            .attempts(0)
            .run_at(now)
            .last_error(None)
            .claimed_by(None)
            .finished_at(None);

        if !self.store.update_job(id, JobState::Dead, &update).await? {
            return match self.store.get_job(id).await? {
                Some(_) => Err(StoreError::NotDead(id.to_string())),
                None => Err(StoreError::NotFound(id.to_string())),
            };
        }

        info!(job_id = id, "Dead job requeued");
        self.store
            .get_job(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    /// Deletes one dead job, or every dead job when `id` is `None`.
    pub async fn purge(&self, id: Option<&str>) -> Result<u64, StoreError> {
        let removed = self.store.purge_dead_jobs(id).await?;
        if let (Some(id), 0) = (id, removed) {
            return match self.store.get_job(id).await? {
                Some(_) => Err(StoreError::NotDead(id.to_string())),
                None => Err(StoreError::NotFound(id.to_string())),
            };
        }
        info!(removed, "Purged dead letter queue");
        Ok(removed)
    }
}
