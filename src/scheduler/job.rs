//! Job definitions for the scheduler.
//!
//! This module defines the core job types used in the scheduling system:
//!
//! - `Job`: A persisted unit of work (a shell command) and its lifecycle fields
//! - `JobState`: The five-state lifecycle
//! - `JobSpec`: A submission request, also accepted as JSON
//! - `RetrySettings` / `ClaimedJob`: Effective settings resolved at claim time

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::GlobalSettings;
use crate::error::{SubmitError, UnknownState};

/// Default priority for jobs (lower values run earlier).
pub const DEFAULT_PRIORITY: i64 = 5;

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// Waiting for `run_at` and a free worker.
    Pending,
    /// Claimed by a worker and executing.
    Processing,
    /// Finished successfully. Terminal.
    Completed,
    /// Failed with retries left.
    Failed,
    /// Exhausted its retries; member of the dead letter queue.
    Dead,
}

impl JobState {
    /// Every state, in lifecycle order.
    pub const ALL: [JobState; 5] = [
        JobState::Pending,
        JobState::Processing,
        JobState::Completed,
        JobState::Failed,
        JobState::Dead,
    ];

    /// Returns the string stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Processing => "processing",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Dead => "dead",
        }
    }

    /// Returns whether no further automatic transition will happen.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Dead)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = UnknownState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(JobState::Pending),
            "processing" => Ok(JobState::Processing),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            "dead" => Ok(JobState::Dead),
            _ => Err(UnknownState(s.to_string())),
        }
    }
}

/// A persisted job row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique, immutable identifier.
    pub id: String,
    /// Shell command to execute.
    pub command: String,
    /// Lower values are claimed first.
    pub priority: i64,
    /// The job is not eligible before this instant.
    pub run_at: DateTime<Utc>,
    /// Current lifecycle state.
    pub state: JobState,
    /// Number of failed execution attempts so far.
    pub attempts: u32,
    /// Per-job override of the `max_retries` configuration.
    pub max_retries: Option<u32>,
    /// Per-job override of the `base_backoff` configuration.
    pub base_backoff: Option<f64>,
    /// Per-job override of the `job_timeout_sec` configuration.
    pub timeout_sec: Option<u64>,
    /// Error of the most recent failed attempt.
    pub last_error: Option<String>,
    /// Wall time of the most recent execution.
    pub duration_sec: Option<f64>,
    /// Worker currently holding the claim.
    pub claimed_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// When the job last reached `completed` or `dead`.
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Returns whether the claim protocol may pick this job at `now`.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.state == JobState::Pending && self.run_at <= now
    }
}

/// A job submission.
///
/// Deserializes from the JSON accepted by `queuectl enqueue`, e.g.
/// `{"command": "echo hi", "priority": 1, "max_retries": 5}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    /// Explicit identifier; a UUID is generated when absent.
    #[serde(default)]
    pub id: Option<String>,
    pub command: String,
    #[serde(default)]
    pub priority: Option<i64>,
    #[serde(default)]
    pub run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub base_backoff: Option<f64>,
    #[serde(default)]
    pub timeout_sec: Option<u64>,
}

impl JobSpec {
    /// Creates a submission for `command` with every option defaulted.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Default::default()
        }
    }

    /// Parses a JSON job description.
    pub fn from_json(json: &str) -> Result<Self, SubmitError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_run_at(mut self, run_at: DateTime<Utc>) -> Self {
        self.run_at = Some(run_at);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_base_backoff(mut self, base_backoff: f64) -> Self {
        self.base_backoff = Some(base_backoff);
        self
    }

    pub fn with_timeout_sec(mut self, timeout_sec: u64) -> Self {
        self.timeout_sec = Some(timeout_sec);
        self
    }

    /// Rejects submissions the worker could never run.
    pub fn validate(&self) -> Result<(), SubmitError> {
        if self.command.trim().is_empty() {
            return Err(SubmitError::EmptyCommand);
        }
        if let Some(id) = &self.id {
            if id.trim().is_empty() {
                return Err(SubmitError::InvalidOverride("id cannot be empty".to_string()));
            }
        }
        if self.max_retries == Some(0) {
            return Err(SubmitError::InvalidOverride(
                "max_retries must be at least 1".to_string(),
            ));
        }
        if let Some(base) = self.base_backoff {
            if !base.is_finite() || base < 1.0 {
                return Err(SubmitError::InvalidOverride(format!(
                    "base_backoff must be >= 1.0, got {}",
                    base
                )));
            }
        }
        if let Some(timeout) = self.timeout_sec {
            if timeout == 0 || i64::try_from(timeout).is_err() {
                return Err(SubmitError::InvalidOverride(format!(
                    "timeout_sec must be between 1 and {}, got {}",
                    i64::MAX,
                    timeout
                )));
            }
        }
        Ok(())
    }
}

/// Retry and timeout settings in force for one execution.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub base_backoff: f64,
    pub timeout_sec: u64,
}

impl RetrySettings {
    /// Per-job overrides win; unset fields fall back to the live configuration.
    pub fn resolve(job: &Job, global: &GlobalSettings) -> Self {
        Self {
            max_retries: job.max_retries.unwrap_or(global.max_retries),
            base_backoff: job.base_backoff.unwrap_or(global.base_backoff),
            timeout_sec: job.timeout_sec.unwrap_or(global.job_timeout_sec),
        }
    }
}

/// A job owned by one worker, with the settings captured at claim time.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub job: Job,
    pub settings: RetrySettings,
    pub worker_id: String,
}

/// Filter for listing jobs.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub state: Option<JobState>,
    pub limit: Option<usize>,
}

impl JobFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(mut self, state: JobState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_job() -> Job {
        let now = Utc::now();
        Job {
            id: "job-1".to_string(),
            command: "echo hi".to_string(),
            priority: DEFAULT_PRIORITY,
            run_at: now,
            state: JobState::Pending,
            attempts: 0,
            max_retries: None,
            base_backoff: None,
            timeout_sec: None,
            last_error: None,
            duration_sec: None,
            claimed_by: None,
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }

    #[test]
    fn test_job_state_parse() {
        for state in JobState::ALL {
            assert_eq!(state.as_str().parse::<JobState>().unwrap(), state);
        }
        assert_eq!(" DEAD ".parse::<JobState>().unwrap(), JobState::Dead);
        assert!("running".parse::<JobState>().is_err());
    }

    #[test]
    fn test_job_state_terminal() {
        assert!(JobState::Completed.is_terminal());
        assert!(JobState::Dead.is_terminal());
        assert!(!JobState::Pending.is_terminal());
        assert!(!JobState::Failed.is_terminal());
    }

    #[test]
    fn test_job_state_serializes_lowercase() {
        let json = serde_json::to_string(&JobState::Processing).unwrap();
        assert_eq!(json, "\"processing\"");
    }

    #[test]
    fn test_eligibility() {
        let mut job = sample_job();
        let now = job.run_at;
        assert!(job.is_eligible(now));
        assert!(!job.is_eligible(now - chrono::Duration::seconds(1)));

        job.state = JobState::Processing;
        assert!(!job.is_eligible(now));
    }

    #[test]
    fn test_job_spec_from_json() {
        let spec = JobSpec::from_json(r#"{"command": "echo Hello", "priority": 1, "max_retries": 4}"#)
            .unwrap();
        assert_eq!(spec.command, "echo Hello");
        assert_eq!(spec.priority, Some(1));
        assert_eq!(spec.max_retries, Some(4));
        assert!(spec.id.is_none());
        assert!(spec.run_at.is_none());
    }

    #[test]
    fn test_job_spec_from_json_requires_command() {
        assert!(matches!(
            JobSpec::from_json(r#"{"priority": 1}"#),
            Err(SubmitError::InvalidJson(_))
        ));
    }

    #[test]
    fn test_job_spec_validate() {
        assert!(JobSpec::new("true").validate().is_ok());
        assert!(matches!(
            JobSpec::new("   ").validate(),
            Err(SubmitError::EmptyCommand)
        ));
        assert!(JobSpec::new("true").with_max_retries(0).validate().is_err());
        assert!(JobSpec::new("true").with_base_backoff(0.5).validate().is_err());
        assert!(JobSpec::new("true").with_timeout_sec(0).validate().is_err());
    }

    #[test]
    fn test_job_spec_rejects_unstorable_timeout() {
        let huge = i64::MAX as u64 + 1;
        assert!(matches!(
            JobSpec::new("true").with_timeout_sec(huge).validate(),
            Err(SubmitError::InvalidOverride(_))
        ));
        assert!(JobSpec::new("true")
            .with_timeout_sec(i64::MAX as u64)
            .validate()
            .is_ok());
    }

    #[test]
    fn test_retry_settings_overrides_win() {
        let global = GlobalSettings {
            max_retries: 3,
            base_backoff: 2.0,
            job_timeout_sec: 30,
        };
        let mut job = sample_job();

        assert_eq!(
            RetrySettings::resolve(&job, &global),
            RetrySettings {
                max_retries: 3,
                base_backoff: 2.0,
                timeout_sec: 30
            }
        );

        job.max_retries = Some(7);
        job.timeout_sec = Some(1);
        let settings = RetrySettings::resolve(&job, &global);
        assert_eq!(settings.max_retries, 7);
        assert_eq!(settings.base_backoff, 2.0);
        assert_eq!(settings.timeout_sec, 1);
    }
}
