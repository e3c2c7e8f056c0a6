//! Job metrics read back from the store.
//!
//! Two shapes are produced: a per-state snapshot (`{state: {count,
//! mean_duration_sec}}`) and a per-minute time series of terminal
//! transitions (`{labels, completed, failed}`).

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::scheduler::job::JobState;
use crate::storage::{StateSummary, Store, StoreError, TerminalEvent};

/// Number of one-minute buckets in a time series.
pub const TIMESERIES_BUCKETS: usize = 60;

const MINUTE_MS: i64 = 60_000;

/// Count and mean execution time of the jobs in one state.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StateMetrics {
    pub count: u64,
    /// `None` when no job in this state has a recorded duration.
    pub mean_duration_sec: Option<f64>,
}

/// Per-state metrics. Every state is present.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct MetricsSnapshot(pub BTreeMap<JobState, StateMetrics>);

impl MetricsSnapshot {
    pub fn get(&self, state: JobState) -> &StateMetrics {
        // Constructors fill every state.
        static EMPTY: StateMetrics = StateMetrics {
            count: 0,
            mean_duration_sec: None,
        };
        self.0.get(&state).unwrap_or(&EMPTY)
    }

    /// Job counts per state, for the queue depth gauge.
    pub fn counts(&self) -> BTreeMap<JobState, u64> {
        self.0.iter().map(|(state, m)| (*state, m.count)).collect()
    }
}

/// Terminal transitions per minute. All vectors have the same length.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimeSeries {
    /// Bucket start, `YYYY-MM-DD HH:MM` in UTC, oldest first.
    pub labels: Vec<String>,
    pub completed: Vec<u64>,
    /// Jobs that reached `dead` in the bucket.
    pub failed: Vec<u64>,
}

/// Builds a snapshot from store summaries, zero-filling absent states.
pub fn snapshot_from_summaries(summaries: &[StateSummary]) -> MetricsSnapshot {
    let mut states: BTreeMap<JobState, StateMetrics> = JobState::ALL
        .iter()
        .map(|state| (*state, StateMetrics::default()))
        .collect();

    for summary in summaries {
        states.insert(
            summary.state,
            StateMetrics {
                count: summary.count,
                mean_duration_sec: summary.avg_duration_sec,
            },
        );
    }

    MetricsSnapshot(states)
}

/// Start of the oldest bucket of the window ending with the minute containing `now`.
pub fn window_start(now: DateTime<Utc>) -> DateTime<Utc> {
    let first_ms = first_bucket_ms(now);
    DateTime::from_timestamp_millis(first_ms).unwrap_or(now)
}

fn first_bucket_ms(now: DateTime<Utc>) -> i64 {
    let now_ms = now.timestamp_millis();
    let current_minute = now_ms - now_ms.rem_euclid(MINUTE_MS);
    current_minute - (TIMESERIES_BUCKETS as i64 - 1) * MINUTE_MS
}

/// Buckets terminal events into the window ending with the minute containing `now`.
///
/// Events outside the window are ignored.
pub fn bucket_terminal_events(events: &[TerminalEvent], now: DateTime<Utc>) -> TimeSeries {
    let first_ms = first_bucket_ms(now);

    let labels = (0..TIMESERIES_BUCKETS)
        .map(|i| {
            DateTime::from_timestamp_millis(first_ms + i as i64 * MINUTE_MS)
                .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                .unwrap_or_default()
        })
        .collect();
    let mut completed = vec![0; TIMESERIES_BUCKETS];
    let mut failed = vec![0; TIMESERIES_BUCKETS];

    for event in events {
        let offset = event.finished_at.timestamp_millis() - first_ms;
        if offset < 0 {
            continue;
        }
        let idx = (offset / MINUTE_MS) as usize;
        if idx >= TIMESERIES_BUCKETS {
            continue;
        }
        match event.state {
            JobState::Completed => completed[idx] += 1,
            JobState::Dead => failed[idx] += 1,
            _ => {}
        }
    }

    TimeSeries {
        labels,
        completed,
        failed,
    }
}

/// Reads job metrics from the store.
#[derive(Debug, Clone)]
pub struct MetricsAggregator {
    store: Store,
}

impl MetricsAggregator {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub async fn snapshot(&self) -> Result<MetricsSnapshot, StoreError> {
        let summaries = self.store.state_summaries().await?;
        Ok(snapshot_from_summaries(&summaries))
    }

    /// Time series for the hour ending with the minute containing `now`.
    pub async fn timeseries(&self, now: DateTime<Utc>) -> Result<TimeSeries, StoreError> {
        let events = self.store.terminal_events_since(window_start(now)).await?;
        Ok(bucket_terminal_events(&events, now))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, TimeZone};

    fn event(state: JobState, at: DateTime<Utc>) -> TerminalEvent {
        TerminalEvent {
            state,
            finished_at: at,
        }
    }

    #[test]
    fn test_snapshot_zero_fills() {
        let snapshot = snapshot_from_summaries(&[StateSummary {
            state: JobState::Completed,
            count: 2,
            avg_duration_sec: Some(1.5),
        }]);

        assert_eq!(snapshot.0.len(), 5);
        assert_eq!(snapshot.get(JobState::Completed).count, 2);
        assert_eq!(snapshot.get(JobState::Completed).mean_duration_sec, Some(1.5));
        assert_eq!(snapshot.get(JobState::Dead), &StateMetrics::default());
    }

    #[test]
    fn test_snapshot_serializes_by_state() {
        let snapshot = snapshot_from_summaries(&[]);
        let json = serde_json::to_value(&snapshot).unwrap();

        for state in JobState::ALL {
            assert_eq!(json[state.as_str()]["count"], 0);
            assert!(json[state.as_str()]["mean_duration_sec"].is_null());
        }
    }

    #[test]
    fn test_empty_timeseries_shape() {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 45).unwrap();
        let series = bucket_terminal_events(&[], now);

        assert_eq!(series.labels.len(), TIMESERIES_BUCKETS);
        assert_eq!(series.completed, vec![0; TIMESERIES_BUCKETS]);
        assert_eq!(series.failed, vec![0; TIMESERIES_BUCKETS]);
        assert_eq!(series.labels[0], "2024-03-01 11:31");
        assert_eq!(series.labels[TIMESERIES_BUCKETS - 1], "2024-03-01 12:30");
    }

    #[test]
    fn test_bucketing() {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 45).unwrap();
        let events = vec![
            event(JobState::Completed, now),
            event(JobState::Completed, now - ChronoDuration::seconds(40)),
            event(JobState::Dead, now - ChronoDuration::minutes(5)),
            event(JobState::Completed, now - ChronoDuration::hours(2)),
        ];

        let series = bucket_terminal_events(&events, now);

        assert_eq!(series.completed[TIMESERIES_BUCKETS - 1], 2);
        assert_eq!(series.failed[TIMESERIES_BUCKETS - 6], 1);
        assert_eq!(series.completed.iter().sum::<u64>(), 2);
        assert_eq!(series.failed.iter().sum::<u64>(), 1);
    }

    #[test]
    fn test_window_start() {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 45).unwrap();
        assert_eq!(
            window_start(now),
            Utc.with_ymd_and_hms(2024, 3, 1, 11, 31, 0).unwrap()
        );
    }
}
