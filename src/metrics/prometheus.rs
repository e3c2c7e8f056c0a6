//! Prometheus metrics registration and export.
//!
//! This module defines the Prometheus metrics exposed by queuectl and provides
//! functions for initializing, registering, and exporting them.

use prometheus::{
    Counter, CounterVec, Encoder, Gauge, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};
use std::sync::{Mutex, OnceLock};

/// Serializes initialization so every static comes from the same registry.
static INIT_LOCK: Mutex<()> = Mutex::new(());

/// Global Prometheus registry for all queuectl metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Executions finished, labeled by outcome (completed, retried, dead, lost).
pub static JOBS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Execution wall time in seconds, labeled by outcome.
pub static JOB_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Number of jobs currently executing in this process.
pub static JOBS_IN_PROGRESS: OnceLock<Gauge> = OnceLock::new();

/// Number of execution loops running in this process.
pub static ACTIVE_WORKERS: OnceLock<Gauge> = OnceLock::new();

/// Claim attempts that gave up after repeatedly losing races.
pub static CLAIM_CONTENTION: OnceLock<Counter> = OnceLock::new();

/// Number of jobs per state, as last observed.
pub static QUEUE_DEPTH: OnceLock<GaugeVec> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Safe to call more than once; later calls leave the first registration in place.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric creation or registration fails.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let _guard = INIT_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    if REGISTRY.get().is_some() {
        return Ok(());
    }

    let registry = Registry::new();

    // Job metrics
    let jobs_total = CounterVec::new(
        Opts::new("queuectl_jobs_total", "Total number of job executions"),
        &["outcome"],
    )?;

    let job_duration = HistogramVec::new(
        HistogramOpts::new(
            "queuectl_job_duration_seconds",
            "Job execution duration in seconds",
        )
        .buckets(vec![0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0]),
        &["outcome"],
    )?;

    let jobs_in_progress = Gauge::new(
        "queuectl_jobs_in_progress",
        "Number of jobs currently being executed",
    )?;

    // Worker metrics
    let active_workers = Gauge::new("queuectl_active_workers", "Number of running execution loops")?;

    let claim_contention = Counter::new(
        "queuectl_claim_contention_total",
        "Claim attempts abandoned after repeated lost races",
    )?;

    // Queue metrics
    let queue_depth = GaugeVec::new(
        Opts::new("queuectl_queue_depth", "Number of jobs per state"),
        &["state"],
    )?;

    registry.register(Box::new(jobs_total.clone()))?;
    registry.register(Box::new(job_duration.clone()))?;
    registry.register(Box::new(jobs_in_progress.clone()))?;
    registry.register(Box::new(active_workers.clone()))?;
    registry.register(Box::new(claim_contention.clone()))?;
    registry.register(Box::new(queue_depth.clone()))?;

    let _ = REGISTRY.set(registry);
    let _ = JOBS_TOTAL.set(jobs_total);
    let _ = JOB_DURATION.set(job_duration);
    let _ = JOBS_IN_PROGRESS.set(jobs_in_progress);
    let _ = ACTIVE_WORKERS.set(active_workers);
    let _ = CLAIM_CONTENTION.set(claim_contention);
    let _ = QUEUE_DEPTH.set(queue_depth);

    tracing::debug!("Prometheus metrics initialized");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// Returns a comment line instead if the registry was never initialized or
/// encoding fails.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics_is_idempotent() {
        assert!(init_metrics().is_ok());
        assert!(init_metrics().is_ok());
        assert!(REGISTRY.get().is_some());
    }

    #[test]
    fn test_metrics_after_init() {
        init_metrics().unwrap();

        if let Some(gauge) = ACTIVE_WORKERS.get() {
            gauge.set(2.0);
        }

        let metrics = export_metrics();
        assert!(!metrics.starts_with("# Error"));
        assert!(metrics.contains("queuectl_active_workers"));
    }
}
