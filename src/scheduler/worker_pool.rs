//! Worker pool for executing jobs from the SQLite queue.
//!
//! This module provides a pool of execution loops that claim jobs from the
//! shared store. Each loop runs as an independent async task; any number of
//! pools, in any number of processes, may share one database.
//!
//! # Features
//!
//! - Configurable number of workers
//! - Graceful stop: in-flight jobs finish (or time out) before a loop exits
//! - Stop requests from other processes through the persisted control flag
//! - Heartbeats and recovery of jobs abandoned by crashed processes
//! - Pool statistics tracking

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::metrics::MetricsCollector;
use crate::storage::{Store, StoreError};

use super::claim::{Claim, ClaimProtocol};
use super::control::StopSignal;
use super::executor::{CommandExecutor, ExecutionResult};
use super::job::ClaimedJob;
use super::log_sink::{JobLog, JobLogSink};
use super::retry::{RetryManager, Transition};

/// Attempts at recording an outcome before the job is left to stale-claim recovery.
const MAX_RECORD_ATTEMPTS: u32 = 5;

/// Errors that can occur in the worker pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// The store could not be reached while starting the pool.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Pool configuration is unusable.
    #[error("Invalid pool configuration: {0}")]
    InvalidConfig(String),

    /// Pool is already running.
    #[error("Pool is already running")]
    AlreadyRunning,

    /// Pool is not running.
    #[error("Pool is not running")]
    NotRunning,

    /// Shutdown timed out.
    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),
}

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of execution loops to spawn.
    pub num_workers: usize,
    /// How long an idle loop waits before trying to claim again.
    pub poll_interval: Duration,
    /// How often the pool refreshes its heartbeat rows.
    pub heartbeat_interval: Duration,
    /// Heartbeat age after which another pool may requeue a loop's job.
    pub stale_after: Duration,
    /// Timeout for graceful shutdown.
    pub shutdown_timeout: Duration,
    /// Wait before retrying after a store error.
    pub store_retry_backoff: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            num_workers: 1,
            poll_interval: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(5),
            stale_after: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(600),
            store_retry_backoff: Duration::from_secs(1),
        }
    }
}

impl WorkerPoolConfig {
    /// Creates a new configuration with the specified number of workers.
    pub fn new(num_workers: usize) -> Self {
        Self {
            num_workers,
            ..Default::default()
        }
    }

    /// Sets the poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets the heartbeat interval.
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Sets the stale-claim threshold.
    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    /// Sets the shutdown timeout.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Sets the backoff after store errors.
    pub fn with_store_retry_backoff(mut self, backoff: Duration) -> Self {
        self.store_retry_backoff = backoff;
        self
    }

    fn stale_cutoff(&self) -> chrono::DateTime<Utc> {
        let stale = chrono::Duration::milliseconds(self.stale_after.as_millis() as i64);
        Utc::now() - stale
    }
}

/// Statistics about the worker pool.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Total number of workers in the pool.
    pub num_workers: usize,
    /// Number of workers currently executing a job.
    pub active_workers: usize,
    /// Executions that completed the job.
    pub jobs_completed: u64,
    /// Executions that failed and scheduled a retry.
    pub jobs_retried: u64,
    /// Executions that moved the job to the dead letter queue.
    pub jobs_dead: u64,
    /// Average execution duration.
    pub average_job_duration: Duration,
}

impl PoolStats {
    /// Returns the total number of executions recorded.
    pub fn total_processed(&self) -> u64 {
        self.jobs_completed + self.jobs_retried + self.jobs_dead
    }

    /// Returns the share of executions that succeeded, as a percentage.
    pub fn success_rate(&self) -> f64 {
        let total = self.total_processed();
        if total == 0 {
            return 0.0;
        }
        (self.jobs_completed as f64 / total as f64) * 100.0
    }
}

/// Shared state for tracking pool statistics.
struct SharedPoolStats {
    jobs_completed: AtomicU64,
    jobs_retried: AtomicU64,
    jobs_dead: AtomicU64,
    total_duration_ms: AtomicU64,
    active_workers: AtomicU64,
}

impl SharedPoolStats {
    fn new() -> Self {
        Self {
            jobs_completed: AtomicU64::new(0),
            jobs_retried: AtomicU64::new(0),
            jobs_dead: AtomicU64::new(0),
            total_duration_ms: AtomicU64::new(0),
            active_workers: AtomicU64::new(0),
        }
    }

    fn record(&self, transition: &Transition, duration: Duration) {
        let counter = match transition {
            Transition::Completed => &self.jobs_completed,
            Transition::Retrying { .. } => &self.jobs_retried,
            Transition::Dead { .. } => &self.jobs_dead,
            Transition::Lost => return,
        };
        counter.fetch_add(1, Ordering::SeqCst);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn increment_active(&self) {
        self.active_workers.fetch_add(1, Ordering::SeqCst);
    }

    fn decrement_active(&self) {
        self.active_workers.fetch_sub(1, Ordering::SeqCst);
    }

    fn to_pool_stats(&self, num_workers: usize) -> PoolStats {
        let completed = self.jobs_completed.load(Ordering::SeqCst);
        let retried = self.jobs_retried.load(Ordering::SeqCst);
        let dead = self.jobs_dead.load(Ordering::SeqCst);
        let total_duration_ms = self.total_duration_ms.load(Ordering::SeqCst);
        let active = self.active_workers.load(Ordering::SeqCst);

        let total_jobs = completed + retried + dead;
        let average_duration = if total_jobs > 0 {
            Duration::from_millis(total_duration_ms / total_jobs)
        } else {
            Duration::ZERO
        };

        PoolStats {
            num_workers,
            active_workers: active as usize,
            jobs_completed: completed,
            jobs_retried: retried,
            jobs_dead: dead,
            average_job_duration: average_duration,
        }
    }
}

/// Worker pool that runs execution loops against a shared store.
pub struct WorkerPool {
    id: String,
    config: WorkerPoolConfig,
    store: Store,
    stop: StopSignal,
    executor: CommandExecutor,
    log_sink: Arc<dyn JobLogSink>,
    worker_handles: Vec<JoinHandle<()>>,
    heartbeat_handle: Option<JoinHandle<()>>,
    stats: Arc<SharedPoolStats>,
    is_running: AtomicBool,
}

impl WorkerPool {
    /// Creates a new, stopped worker pool.
    pub fn new(store: Store, config: WorkerPoolConfig, log_sink: Arc<dyn JobLogSink>) -> Self {
        let id = Uuid::new_v4().simple().to_string();
        Self {
            id,
            config,
            stop: StopSignal::new(store.clone()),
            store,
            executor: CommandExecutor::new(),
            log_sink,
            worker_handles: Vec::new(),
            heartbeat_handle: None,
            stats: Arc::new(SharedPoolStats::new()),
            is_running: AtomicBool::new(false),
        }
    }

    /// Replaces the command executor used by every loop.
    pub fn with_executor(mut self, executor: CommandExecutor) -> Self {
        self.executor = executor;
        self
    }

    /// Identifier of this pool; worker ids are derived from it.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Starts all workers in the pool.
    ///
    /// Clears any earlier stop request, returns abandoned claims to the queue,
    /// then spawns the execution loops and the heartbeat task.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::AlreadyRunning` if the pool is already running, or
    /// `PoolError::Store` if the store cannot be prepared.
    pub async fn start(&mut self) -> Result<(), PoolError> {
        if self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::AlreadyRunning);
        }
        if self.config.num_workers == 0 {
            return Err(PoolError::InvalidConfig(
                "num_workers must be greater than 0".to_string(),
            ));
        }

        self.stop.clear().await?;

        let recovered = self.store.requeue_stale_jobs(self.config.stale_cutoff()).await?;
        if recovered > 0 {
            info!(recovered, "Recovered jobs abandoned by stopped workers");
        }

        let short_id = &self.id[..8.min(self.id.len())];
        let worker_ids: Vec<String> = (0..self.config.num_workers)
            .map(|i| format!("{}-worker-{}", short_id, i))
            .collect();

        let now = Utc::now();
        for worker_id in &worker_ids {
            self.store.register_worker(worker_id, &self.id, now).await?;
        }

        for worker_id in &worker_ids {
            let worker = Worker {
                id: worker_id.clone(),
                store: self.store.clone(),
                claims: ClaimProtocol::new(self.store.clone()),
                retries: RetryManager::new(self.store.clone()),
                executor: self.executor.clone(),
                log_sink: Arc::clone(&self.log_sink),
                stop: self.stop.clone(),
                poll_interval: self.config.poll_interval,
                store_retry_backoff: self.config.store_retry_backoff,
                stats: Arc::clone(&self.stats),
                metrics: MetricsCollector::new(),
            };

            self.worker_handles.push(tokio::spawn(worker.run()));
        }

        self.heartbeat_handle = Some(tokio::spawn(heartbeat_loop(
            self.store.clone(),
            self.id.clone(),
            worker_ids,
            self.config.clone(),
            self.stop.clone(),
        )));

        self.is_running.store(true, Ordering::SeqCst);
        info!(pool_id = %self.id, num_workers = self.config.num_workers, "Worker pool started");

        Ok(())
    }

    /// Gracefully shuts down all workers of this pool.
    ///
    /// Loops finish their current job and exit; other processes sharing the
    /// store are not affected.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::ShutdownTimeout` if workers don't stop within
    /// the configured timeout; the pool then stays running and `shutdown`
    /// may be called again.
    pub async fn shutdown(&mut self) -> Result<(), PoolError> {
        if !self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::NotRunning);
        }

        info!(pool_id = %self.id, "Initiating worker pool shutdown");
        self.stop.request_local_stop();
        self.join_workers().await
    }

    /// Waits until every loop has exited on its own, e.g. after
    /// `queuectl worker stop` was run from another process.
    ///
    /// Cancel-safe: dropping the future leaves the pool running with every
    /// unjoined loop still tracked, so `shutdown` drains them afterwards.
    pub async fn wait_for_stop(&mut self) -> Result<(), PoolError> {
        if !self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::NotRunning);
        }

        loop {
            match self.stop.is_stop_requested().await {
                Ok(true) => break,
                Ok(false) => {}
                Err(e) => warn!(error = %e, "Failed to read control signal"),
            }
            if self.worker_handles.iter().all(|h| h.is_finished()) {
                break;
            }
            self.stop.idle(self.config.poll_interval).await;
        }

        info!(pool_id = %self.id, "Stop requested, waiting for workers");
        self.join_workers().await
    }

    /// Joins every loop, bounded by `shutdown_timeout`.
    ///
    /// Handles stay in `self` until their loop has been joined, so a caller
    /// that drops this future can join the remaining loops later.
    async fn join_workers(&mut self) -> Result<(), PoolError> {
        let handles = &mut self.worker_handles;
        let joined = tokio::time::timeout(self.config.shutdown_timeout, async move {
            while let Some(handle) = handles.last_mut() {
                let result = handle.await;
                handles.pop();
                if let Err(e) = result {
                    error!(error = %e, "Worker task panicked during shutdown");
                }
            }
        })
        .await;

        if joined.is_err() {
            error!(
                pool_id = %self.id,
                timeout = ?self.config.shutdown_timeout,
                "Workers did not stop in time"
            );
            // Loops still running keep their heartbeat so their jobs are not requeued.
            return Err(PoolError::ShutdownTimeout(self.config.shutdown_timeout));
        }

        // Heartbeats continue until loops are done so in-flight jobs stay owned.
        if let Some(heartbeat) = self.heartbeat_handle.take() {
            heartbeat.abort();
            // Wait for the abort so no registration lands after the cleanup below.
            let _ = heartbeat.await;
        }
        if let Err(e) = self.store.unregister_pool(&self.id).await {
            warn!(pool_id = %self.id, error = %e, "Failed to remove worker registrations");
        }
        self.is_running.store(false, Ordering::SeqCst);

        info!(pool_id = %self.id, "Worker pool shutdown complete");
        Ok(())
    }

    /// Returns current pool statistics.
    pub fn stats(&self) -> PoolStats {
        self.stats.to_pool_stats(self.config.num_workers)
    }

    /// Returns the stop signal shared by this pool's loops.
    pub fn stop_signal(&self) -> &StopSignal {
        &self.stop
    }

    /// Returns whether the pool is currently running.
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// Returns the number of workers in the pool.
    pub fn num_workers(&self) -> usize {
        self.config.num_workers
    }
}

/// Keeps this pool's heartbeat rows fresh and requeues other pools' abandoned jobs.
async fn heartbeat_loop(
    store: Store,
    pool_id: String,
    worker_ids: Vec<String>,
    config: WorkerPoolConfig,
    stop: StopSignal,
) {
    loop {
        tokio::time::sleep(config.heartbeat_interval).await;

        let now = Utc::now();
        match store.heartbeat_pool(&pool_id, now).await {
            // Draining loops unregister themselves and must stay gone.
            Ok(touched) if (touched as usize) < worker_ids.len() && !stop.is_local_stop() => {
                // Rows were reaped by another pool.
                warn!(pool_id = %pool_id, touched, "Heartbeat rows missing, re-registering");
                for worker_id in &worker_ids {
                    if let Err(e) = store.register_worker(worker_id, &pool_id, now).await {
                        warn!(worker_id = %worker_id, error = %e, "Failed to re-register worker");
                    }
                }
            }
            Ok(_) => {}
            Err(e) => warn!(pool_id = %pool_id, error = %e, "Heartbeat failed"),
        }

        match store.requeue_stale_jobs(config.stale_cutoff()).await {
            Ok(0) => {}
            Ok(recovered) => info!(recovered, "Recovered jobs abandoned by stopped workers"),
            Err(e) => warn!(error = %e, "Stale claim recovery failed"),
        }
    }
}

/// A single execution loop.
pub struct Worker {
    id: String,
    store: Store,
    claims: ClaimProtocol,
    retries: RetryManager,
    executor: CommandExecutor,
    log_sink: Arc<dyn JobLogSink>,
    stop: StopSignal,
    poll_interval: Duration,
    store_retry_backoff: Duration,
    stats: Arc<SharedPoolStats>,
    metrics: MetricsCollector,
}

impl Worker {
    /// Main worker loop.
    ///
    /// The stop signal is only checked between jobs, never during one.
    async fn run(self) {
        info!(worker_id = %self.id, "Worker started");
        self.metrics.worker_started();

        loop {
            match self.stop.is_stop_requested().await {
                Ok(true) => {
                    info!(worker_id = %self.id, "Worker received stop signal");
                    break;
                }
                Ok(false) => {}
                Err(e) => {
                    error!(worker_id = %self.id, error = %e, "Failed to read control signal");
                    self.stop.idle(self.store_retry_backoff).await;
                    continue;
                }
            }

            match self.claims.claim_next(&self.id, Utc::now()).await {
                Ok(Claim::Claimed(claimed)) => {
                    self.process_job(claimed).await;
                }
                Ok(Claim::Idle) => {
                    debug!(worker_id = %self.id, "No jobs available");
                    self.stop.idle(self.poll_interval).await;
                }
                Ok(Claim::Contended) => {
                    self.metrics.record_claim_contention();
                    self.stop.idle(self.poll_interval).await;
                }
                Err(e) => {
                    error!(worker_id = %self.id, error = %e, "Failed to claim job");
                    self.stop.idle(self.store_retry_backoff).await;
                }
            }
        }

        if let Err(e) = self.store.unregister_worker(&self.id).await {
            warn!(worker_id = %self.id, error = %e, "Failed to unregister worker");
        }
        self.metrics.worker_stopped();
        info!(worker_id = %self.id, "Worker stopped");
    }

    /// Executes a claimed job and records the outcome.
    async fn process_job(&self, claimed: ClaimedJob) {
        let job_id = claimed.job.id.clone();
        let attempt = claimed.job.attempts + 1;
        let timeout = Duration::from_secs(claimed.settings.timeout_sec);

        info!(
            worker_id = %self.id,
            job_id = %job_id,
            attempt,
            command = %claimed.job.command,
            "Processing job"
        );

        self.stats.increment_active();
        self.metrics.job_started();

        let started_at = Utc::now();
        let result = self.executor.execute(&claimed.job.command, timeout).await;

        self.stats.decrement_active();

        let log = JobLog::from_result(attempt, started_at, &result);
        if let Err(e) = self.log_sink.append(&job_id, &log).await {
            warn!(worker_id = %self.id, job_id = %job_id, error = %e, "Failed to write job log");
        }

        let Some(transition) = self.record_outcome(&claimed, &result).await else {
            // Stale-claim recovery returns the job to the queue later.
            self.metrics.record_execution(&Transition::Lost, result.duration_sec());
            return;
        };

        self.stats.record(&transition, result.duration);
        self.metrics
            .record_execution(&transition, result.duration_sec());

        let duration_ms = result.duration.as_millis() as u64;
        match &transition {
            Transition::Completed => info!(
                worker_id = %self.id,
                job_id = %job_id,
                duration_ms,
                "Job completed successfully"
            ),
            Transition::Retrying { .. } | Transition::Dead { .. } => warn!(
                worker_id = %self.id,
                job_id = %job_id,
                attempt,
                duration_ms,
                error = result.outcome.error().unwrap_or_default(),
                "Job failed"
            ),
            Transition::Lost => {}
        }
    }

    /// Applies the retry manager, retrying on store errors a bounded number of times.
    async fn record_outcome(&self, claimed: &ClaimedJob, result: &ExecutionResult) -> Option<Transition> {
        for attempt in 1..=MAX_RECORD_ATTEMPTS {
            match self.retries.record_outcome(claimed, result, Utc::now()).await {
                Ok(transition) => return Some(transition),
                Err(e) => {
                    error!(
                        worker_id = %self.id,
                        job_id = %claimed.job.id,
                        error = %e,
                        attempt,
                        "Failed to record job outcome"
                    );
                    tokio::time::sleep(self.store_retry_backoff).await;
                }
            }
        }
        None
    }

    /// Returns the worker's ID.
    pub fn id(&self) -> &str {
        &self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_pool_config_default() {
        let config = WorkerPoolConfig::default();

        assert_eq!(config.num_workers, 1);
        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(5));
        assert_eq!(config.stale_after, Duration::from_secs(30));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(600));
    }

    #[test]
    fn test_worker_pool_config_builder() {
        let config = WorkerPoolConfig::new(8)
            .with_poll_interval(Duration::from_millis(50))
            .with_heartbeat_interval(Duration::from_millis(200))
            .with_stale_after(Duration::from_secs(2))
            .with_shutdown_timeout(Duration::from_secs(120))
            .with_store_retry_backoff(Duration::from_millis(10));

        assert_eq!(config.num_workers, 8);
        assert_eq!(config.poll_interval, Duration::from_millis(50));
        assert_eq!(config.heartbeat_interval, Duration::from_millis(200));
        assert_eq!(config.stale_after, Duration::from_secs(2));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(120));
        assert_eq!(config.store_retry_backoff, Duration::from_millis(10));
    }

    #[test]
    fn test_pool_stats_default() {
        let stats = PoolStats::default();

        assert_eq!(stats.num_workers, 0);
        assert_eq!(stats.total_processed(), 0);
        assert_eq!(stats.average_job_duration, Duration::ZERO);
        assert!((stats.success_rate() - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_pool_stats_calculations() {
        let stats = PoolStats {
            num_workers: 4,
            active_workers: 2,
            jobs_completed: 80,
            jobs_retried: 15,
            jobs_dead: 5,
            average_job_duration: Duration::from_secs(60),
        };

        assert_eq!(stats.total_processed(), 100);
        assert!((stats.success_rate() - 80.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_shared_pool_stats() {
        let stats = SharedPoolStats::new();

        stats.record(&Transition::Completed, Duration::from_secs(10));
        stats.record(&Transition::Completed, Duration::from_secs(20));
        stats.record(&Transition::Dead { attempts: 3 }, Duration::from_secs(5));
        stats.record(&Transition::Lost, Duration::from_secs(100));

        let pool_stats = stats.to_pool_stats(4);

        assert_eq!(pool_stats.num_workers, 4);
        assert_eq!(pool_stats.jobs_completed, 2);
        assert_eq!(pool_stats.jobs_dead, 1);
        assert_eq!(pool_stats.jobs_retried, 0);
        // Average: (10000 + 20000 + 5000) / 3 = 11666 ms
        assert!(pool_stats.average_job_duration.as_millis() > 11000);
        assert!(pool_stats.average_job_duration.as_millis() < 12000);
    }

    #[test]
    fn test_shared_pool_stats_active_workers() {
        let stats = SharedPoolStats::new();

        stats.increment_active();
        stats.increment_active();
        assert_eq!(stats.active_workers.load(Ordering::SeqCst), 2);

        stats.decrement_active();
        assert_eq!(stats.active_workers.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_pool_error_display() {
        assert!(PoolError::AlreadyRunning.to_string().contains("already running"));
        assert!(PoolError::NotRunning.to_string().contains("not running"));
        assert!(PoolError::ShutdownTimeout(Duration::from_secs(60))
            .to_string()
            .contains("60"));
    }
}
