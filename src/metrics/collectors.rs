//! Recording helpers over the raw Prometheus metrics.
//!
//! Every method is a no-op until [`init_metrics`](super::init_metrics) has run,
//! so library users and tests that never export metrics pay nothing.

use std::collections::BTreeMap;

use crate::scheduler::job::JobState;
use crate::scheduler::retry::Transition;

use super::prometheus::{
    ACTIVE_WORKERS, CLAIM_CONTENTION, JOBS_IN_PROGRESS, JOBS_TOTAL, JOB_DURATION, QUEUE_DEPTH,
};

/// Metrics collector for recording queuectl operational metrics.
///
/// ```ignore
/// use queuectl::metrics::{init_metrics, MetricsCollector};
///
/// init_metrics()?;
/// let collector = MetricsCollector::new();
/// collector.job_started();
/// collector.record_execution(&transition, 1.25);
/// ```
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    /// Label recorded for a transition.
    pub fn outcome_label(transition: &Transition) -> &'static str {
        match transition {
            Transition::Completed => "completed",
            Transition::Retrying { .. } => "retried",
            Transition::Dead { .. } => "dead",
            Transition::Lost => "lost",
        }
    }

    pub fn job_started(&self) {
        if let Some(gauge) = JOBS_IN_PROGRESS.get() {
            gauge.inc();
        }
    }

    /// Records a finished execution and the transition it caused.
    pub fn record_execution(&self, transition: &Transition, duration_secs: f64) {
        let outcome = Self::outcome_label(transition);

        if let Some(gauge) = JOBS_IN_PROGRESS.get() {
            gauge.dec();
        }

        if let Some(jobs_total) = JOBS_TOTAL.get() {
            jobs_total.with_label_values(&[outcome]).inc();
        }

        if let Some(job_duration) = JOB_DURATION.get() {
            job_duration
                .with_label_values(&[outcome])
                .observe(duration_secs);
        }

        tracing::trace!(outcome, duration_secs, "Recorded job metric");
    }

    pub fn worker_started(&self) {
        if let Some(gauge) = ACTIVE_WORKERS.get() {
            gauge.inc();
        }
    }

    pub fn worker_stopped(&self) {
        if let Some(gauge) = ACTIVE_WORKERS.get() {
            gauge.dec();
        }
    }

    pub fn record_claim_contention(&self) {
        if let Some(counter) = CLAIM_CONTENTION.get() {
            counter.inc();
        }
    }

    /// Publishes per-state job counts. Missing states are reported as zero.
    pub fn set_queue_depth(&self, counts: &BTreeMap<JobState, u64>) {
        let Some(queue_depth) = QUEUE_DEPTH.get() else {
            return;
        };

        for state in JobState::ALL {
            let count = counts.get(&state).copied().unwrap_or(0);
            queue_depth
                .with_label_values(&[state.as_str()])
                .set(count as f64);
        }
    }
}
