//! Metrics for queue monitoring.
//!
//! Two independent sources are provided:
//!
//! - **Aggregator**: job counts, mean durations and per-minute throughput read
//!   from the shared database, covering every process that uses it
//! - **Prometheus**: in-process counters and gauges recorded by the worker pool
//!
//! # Example
//!
//! ```ignore
//! use queuectl::metrics::{init_metrics, export_metrics, MetricsAggregator};
//!
//! init_metrics()?;
//!
//! let aggregator = MetricsAggregator::new(store.clone());
//! let snapshot = aggregator.snapshot().await?;
//! let series = aggregator.timeseries(chrono::Utc::now()).await?;
//!
//! let metrics_text = export_metrics();
//! ```

pub mod aggregator;
pub mod collectors;
pub mod prometheus;

// Re-export key types for convenient access
pub use aggregator::{
    bucket_terminal_events, snapshot_from_summaries, MetricsAggregator, MetricsSnapshot,
    StateMetrics, TimeSeries, TIMESERIES_BUCKETS,
};
pub use collectors::MetricsCollector;
pub use prometheus::{export_metrics, init_metrics};

// Re-export metric statics for direct access when needed
pub use prometheus::{
    ACTIVE_WORKERS, CLAIM_CONTENTION, JOBS_IN_PROGRESS, JOBS_TOTAL, JOB_DURATION, QUEUE_DEPTH,
    REGISTRY,
};
