//! Durable job scheduling over a shared SQLite database.
//!
//! This module provides the moving parts of the queue:
//!
//! - **JobQueue**: Submission, inspection, DLQ and configuration facade
//! - **ClaimProtocol**: Atomic pending → processing handoff to one worker
//! - **CommandExecutor**: Runs a job's shell command under a hard timeout
//! - **RetryManager / DeadLetterQueue**: Exponential backoff and the DLQ
//! - **WorkerPool**: Concurrent execution loops with graceful stop
//!
//! # Architecture
//!
//! ```text
//!                      ┌──────────────┐
//!                      │   Producer   │
//!                      │    (CLI)     │
//!                      └──────┬───────┘
//!                             │
//!                      ┌──────▼───────┐
//!                      │    SQLite    │
//!                      │  jobs table  │
//!                      └──────┬───────┘
//!                             │ claim (conditional UPDATE)
//!         ┌───────────────────┼───────────────────┐
//!         │                   │                   │
//!         ▼                   ▼                   ▼
//!    ┌─────────┐         ┌─────────┐         ┌─────────┐
//!    │ Worker 1│         │ Worker 2│         │ Worker N│
//!    └─────────┘         └─────────┘         └─────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use queuectl::scheduler::{JobQueue, JobSpec, WorkerPool, WorkerPoolConfig, NullLogSink};
//! use std::sync::Arc;
//!
//! let queue = JobQueue::open("/tmp/queue.db").await?;
//! queue.enqueue(JobSpec::new("echo hello").with_priority(1)).await?;
//!
//! let mut pool = WorkerPool::new(queue.store().clone(), WorkerPoolConfig::new(4), Arc::new(NullLogSink));
//! pool.start().await?;
//!
//! // Graceful shutdown
//! pool.shutdown().await?;
//! ```
//!
//! # Reliability Features
//!
//! - **Atomic claim**: a job moves to `processing` for exactly one worker
//! - **Crash recovery**: claims whose worker stopped heartbeating are requeued
//! - **Dead letter queue**: jobs that exhaust their retries become `dead`
//! - **Graceful shutdown**: workers finish current jobs before stopping

pub mod claim;
pub mod control;
pub mod executor;
pub mod job;
pub mod log_sink;
pub mod queue;
pub mod retry;
pub mod worker_pool;

// Re-export main types for convenience
pub use claim::{Claim, ClaimProtocol, MAX_CLAIM_CONTENTION};
pub use control::StopSignal;
pub use executor::{CommandExecutor, ExecutionResult, Outcome};
pub use job::{ClaimedJob, Job, JobFilter, JobSpec, JobState, RetrySettings, DEFAULT_PRIORITY};
pub use log_sink::{FileLogSink, JobLog, JobLogSink, NullLogSink};
pub use queue::{ConfigEntry, JobQueue, QueueError, QueueStatus};
pub use retry::{backoff_delay, DeadLetterQueue, RetryManager, Transition, MAX_BACKOFF};
pub use worker_pool::{PoolError, PoolStats, Worker, WorkerPool, WorkerPoolConfig};
