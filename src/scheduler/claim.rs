//! Claim protocol.
//!
//! A claim is a select-then-conditional-update: the best eligible row is
//! picked, then moved to `processing` only if it is still `pending`. Losing
//! that race is ordinary and leads to another selection.

use chrono::{DateTime, Utc};
use tracing::{debug, trace};

use crate::config::GlobalSettings;
use crate::storage::{JobUpdate, Store, StoreError};

use super::job::{ClaimedJob, JobState, RetrySettings};

/// Consecutive lost races after which a claim attempt gives up for this cycle.
pub const MAX_CLAIM_CONTENTION: u32 = 3;

/// Result of one claim attempt.
#[derive(Debug, Clone)]
pub enum Claim {
    /// The worker now owns the job.
    Claimed(ClaimedJob),
    /// No job is eligible right now.
    Idle,
    /// Every selected job was taken by another worker first.
    Contended,
}

impl Claim {
    pub fn is_claimed(&self) -> bool {
        matches!(self, Claim::Claimed(_))
    }
}

/// Claims jobs on behalf of workers.
#[derive(Debug, Clone)]
pub struct ClaimProtocol {
    store: Store,
}

impl ClaimProtocol {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Atomically takes the highest-ranked eligible job for `worker_id`.
    ///
    /// Only store failures are errors; an empty or contested queue is reported
    /// through [`Claim`].
    pub async fn claim_next(&self, worker_id: &str, now: DateTime<Utc>) -> Result<Claim, StoreError> {
        let mut lost_races = 0;

        while lost_races < MAX_CLAIM_CONTENTION {
            let Some(job_id) = self.store.next_eligible_job_id(now).await? else {
                return Ok(Claim::Idle);
            };

            let update = JobUpdate::new()
                .state(JobState::Processing)
                .claimed_by(Some(worker_id.to_string()));

            if !self.store.update_job(&job_id, JobState::Pending, &update).await? {
                lost_races += 1;
                trace!(worker_id, job_id = %job_id, lost_races, "Lost claim race");
                continue;
            }

            let job = self
                .store
                .get_job(&job_id)
                .await?
                .ok_or_else(|| StoreError::NotFound(job_id.clone()))?;

            // Resolved once here so a later config change cannot affect this run.
            let global = GlobalSettings::load(&self.store).await?;
            let settings = RetrySettings::resolve(&job, &global);

            debug!(worker_id, job_id = %job.id, priority = job.priority, "Claimed job");
            return Ok(Claim::Claimed(ClaimedJob {
                job,
                settings,
                worker_id: worker_id.to_string(),
            }));
        }

        debug!(worker_id, "Claim contended, giving up this cycle");
        Ok(Claim::Contended)
    }
}
