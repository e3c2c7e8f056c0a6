//! Integration tests for metrics read back from the store.

use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use queuectl::metrics::{
    export_metrics, init_metrics, MetricsAggregator, MetricsCollector, TIMESERIES_BUCKETS,
};
use queuectl::scheduler::{
    Claim, ClaimProtocol, ExecutionResult, JobQueue, JobSpec, JobState, Outcome, RetryManager,
};

async fn temp_queue() -> (tempfile::TempDir, JobQueue) {
    let dir = tempfile::tempdir().unwrap();
    let queue = JobQueue::open(dir.path().join("queue.db")).await.unwrap();
    (dir, queue)
}

fn result(outcome: Outcome, secs: u64) -> ExecutionResult {
    ExecutionResult {
        outcome,
        exit_code: None,
        stdout: String::new(),
        stderr: String::new(),
        duration: Duration::from_secs(secs),
    }
}

/// Claims the next job and records `result` for it.
async fn run_next(queue: &JobQueue, result: ExecutionResult) {
    let now = Utc::now();
    let Claim::Claimed(claimed) = ClaimProtocol::new(queue.store().clone())
        .claim_next("w", now)
        .await
        .unwrap()
    else {
        panic!("expected a claim");
    };
    RetryManager::new(queue.store().clone())
        .record_outcome(&claimed, &result, now)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_empty_store_reports_every_state() {
    let (_dir, queue) = temp_queue().await;
    let aggregator = MetricsAggregator::new(queue.store().clone());

    let snapshot = aggregator.snapshot().await.unwrap();
    for state in JobState::ALL {
        assert_eq!(snapshot.get(state).count, 0);
        assert!(snapshot.get(state).mean_duration_sec.is_none());
    }

    let series = aggregator.timeseries(Utc::now()).await.unwrap();
    assert_eq!(series.labels.len(), TIMESERIES_BUCKETS);
    assert!(series.completed.iter().all(|n| *n == 0));
    assert!(series.failed.iter().all(|n| *n == 0));
}

#[tokio::test]
async fn test_snapshot_counts_and_mean_durations() {
    let (_dir, queue) = temp_queue().await;
    queue.enqueue(JobSpec::new("true").with_id("a").with_priority(1)).await.unwrap();
    queue.enqueue(JobSpec::new("true").with_id("b").with_priority(2)).await.unwrap();
    queue
        .enqueue(JobSpec::new("false").with_id("c").with_priority(3).with_max_retries(1))
        .await
        .unwrap();
    queue.enqueue(JobSpec::new("true").with_id("d").with_priority(4)).await.unwrap();

    run_next(&queue, result(Outcome::Success, 1)).await;
    run_next(&queue, result(Outcome::Success, 3)).await;
    run_next(
        &queue,
        result(
            Outcome::Failure {
                error: "exit code 1".to_string(),
                timed_out: false,
            },
            4,
        ),
    )
    .await;

    let snapshot = MetricsAggregator::new(queue.store().clone())
        .snapshot()
        .await
        .unwrap();

    assert_eq!(snapshot.get(JobState::Completed).count, 2);
    assert_eq!(snapshot.get(JobState::Completed).mean_duration_sec, Some(2.0));
    assert_eq!(snapshot.get(JobState::Dead).count, 1);
    assert_eq!(snapshot.get(JobState::Dead).mean_duration_sec, Some(4.0));
    assert_eq!(snapshot.get(JobState::Pending).count, 1);
    assert!(snapshot.get(JobState::Pending).mean_duration_sec.is_none());
    assert_eq!(snapshot.get(JobState::Processing).count, 0);

    let json = serde_json::to_value(&snapshot).unwrap();
    assert_eq!(json["completed"]["count"], 2);
    assert_eq!(json["failed"]["count"], 0);
}

#[tokio::test]
async fn test_timeseries_counts_recent_terminal_jobs() {
    let (_dir, queue) = temp_queue().await;
    queue.enqueue(JobSpec::new("true").with_id("ok").with_priority(1)).await.unwrap();
    queue
        .enqueue(JobSpec::new("false").with_id("bad").with_priority(2).with_max_retries(1))
        .await
        .unwrap();

    run_next(&queue, result(Outcome::Success, 0)).await;
    run_next(
        &queue,
        result(
            Outcome::Failure {
                error: "boom".to_string(),
                timed_out: false,
            },
            0,
        ),
    )
    .await;

    let aggregator = MetricsAggregator::new(queue.store().clone());
    let series = aggregator.timeseries(Utc::now()).await.unwrap();
    assert_eq!(series.completed.iter().sum::<u64>(), 1);
    assert_eq!(series.failed.iter().sum::<u64>(), 1);

    // Outside the window two hours later.
    let later = aggregator
        .timeseries(Utc::now() + ChronoDuration::hours(2))
        .await
        .unwrap();
    assert_eq!(later.completed.iter().sum::<u64>(), 0);
    assert_eq!(later.failed.iter().sum::<u64>(), 0);
}

#[tokio::test]
async fn test_queue_depth_exported() {
    let (_dir, queue) = temp_queue().await;
    queue.enqueue(JobSpec::new("true")).await.unwrap();

    init_metrics().unwrap();
    let snapshot = MetricsAggregator::new(queue.store().clone())
        .snapshot()
        .await
        .unwrap();
    MetricsCollector::new().set_queue_depth(&snapshot.counts());

    let text = export_metrics();
    assert!(text.contains("queuectl_queue_depth"));
    assert!(text.contains("state=\"pending\""));
}
