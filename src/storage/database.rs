//! SQLite job store.
//!
//! The store is the single source of truth shared by every process that opens
//! the same database file. All state changes of a job go through
//! [`Store::update_job`], a conditional update keyed on the state the caller
//! last observed, so two writers can never both win the same transition.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use thiserror::Error;
use uuid::Uuid;

use crate::scheduler::job::{Job, JobFilter, JobSpec, JobState, DEFAULT_PRIORITY};

use super::migrations::MigrationRunner;
use super::schema::STOP_REQUESTED_KEY;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Query execution failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Migration error.
    #[error("Migration error: {0}")]
    Migration(#[from] super::migrations::MigrationError),

    /// Record not found.
    #[error("Job not found: {0}")]
    NotFound(String),

    /// A job with the same id already exists.
    #[error("Job '{0}' already exists")]
    DuplicateJob(String),

    /// An operator action targeted a job outside the dead letter queue.
    #[error("Job '{0}' is not in the dead letter queue")]
    NotDead(String),

    /// A stored value is not a valid job state.
    #[error("Invalid job state in database: {0}")]
    InvalidState(String),

    /// A stored timestamp is out of range.
    #[error("Invalid timestamp in database: {0}")]
    InvalidTimestamp(i64),
}

/// Field changes applied by [`Store::update_job`].
///
/// `None` leaves a column untouched; `Some(None)` clears a nullable column.
#[derive(Debug, Clone, Default)]
pub struct JobUpdate {
    pub state: Option<JobState>,
    pub attempts: Option<u32>,
    pub run_at: Option<DateTime<Utc>>,
    pub last_error: Option<Option<String>>,
    pub duration_sec: Option<Option<f64>>,
    pub claimed_by: Option<Option<String>>,
    pub finished_at: Option<Option<DateTime<Utc>>>,
}

impl JobUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(mut self, state: JobState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    pub fn run_at(mut self, run_at: DateTime<Utc>) -> Self {
        self.run_at = Some(run_at);
        self
    }

    pub fn last_error(mut self, last_error: Option<String>) -> Self {
        self.last_error = Some(last_error);
        self
    }

    pub fn duration_sec(mut self, duration_sec: Option<f64>) -> Self {
        self.duration_sec = Some(duration_sec);
        self
    }

    pub fn claimed_by(mut self, claimed_by: Option<String>) -> Self {
        self.claimed_by = Some(claimed_by);
        self
    }

    pub fn finished_at(mut self, finished_at: Option<DateTime<Utc>>) -> Self {
        self.finished_at = Some(finished_at);
        self
    }
}

/// Count and mean duration of the jobs in one state.
#[derive(Debug, Clone, PartialEq)]
pub struct StateSummary {
    pub state: JobState,
    pub count: u64,
    pub avg_duration_sec: Option<f64>,
}

/// A job reaching `completed` or `dead`.
#[derive(Debug, Clone, PartialEq)]
pub struct TerminalEvent {
    pub state: JobState,
    pub finished_at: DateTime<Utc>,
}

/// SQLite-backed job store.
#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Opens (creating if missing) the database at `path` and applies the schema.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let opts = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(opts)
            .await?;

        let store = Self { pool };
        store.run_migrations().await?;

        tracing::debug!(path = %path.as_ref().display(), "Opened job store");
        Ok(store)
    }

    /// Runs database migrations.
    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        MigrationRunner::new(self.pool.clone()).run_migrations().await?;
        Ok(())
    }

    // =========================================================================
    // Job Operations
    // =========================================================================

    /// Inserts a new pending job and returns it as stored.
    ///
    /// Fails with [`StoreError::DuplicateJob`] if the id is taken.
    pub async fn insert_job(&self, spec: &JobSpec, now: DateTime<Utc>) -> Result<Job, StoreError> {
        let id = spec
            .id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let now_ms = now.timestamp_millis();
        let run_at_ms = spec.run_at.unwrap_or(now).timestamp_millis();

        sqlx::query(
            r#"
            INSERT INTO jobs (
                id, command, priority, run_at_ms, state, attempts,
                max_retries, base_backoff, timeout_sec, created_at_ms, updated_at_ms
            ) VALUES (?1, ?2, ?3, ?4, 'pending', 0, ?5, ?6, ?7, ?8, ?8)
            "#,
        )
        .bind(&id)
        .bind(&spec.command)
        .bind(spec.priority.unwrap_or(DEFAULT_PRIORITY))
        .bind(run_at_ms)
        .bind(spec.max_retries.map(i64::from))
        .bind(spec.base_backoff)
        .bind(spec.timeout_sec.map(|t| i64::try_from(t).unwrap_or(i64::MAX)))
        .bind(now_ms)
        .execute(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db) if db.is_unique_violation() => {
                StoreError::DuplicateJob(id.clone())
            }
            other => StoreError::Database(other),
        })?;

        self.get_job(&id)
            .await?
            .ok_or_else(|| StoreError::NotFound(id.clone()))
    }

    /// Retrieves a job by id.
    pub async fn get_job(&self, id: &str) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(job_from_row).transpose()
    }

    /// Lists jobs in submission order.
    pub async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError> {
        let mut query: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT * FROM jobs");

        if let Some(state) = filter.state {
            query.push(" WHERE state = ").push_bind(state.as_str());
        }

        query.push(" ORDER BY created_at_ms, rowid");

        if let Some(limit) = filter.limit {
            query.push(" LIMIT ").push_bind(limit as i64);
        }

        let rows = query.build().fetch_all(&self.pool).await?;
        rows.iter().map(job_from_row).collect()
    }

    /// Applies `update` only if the job is still in `expected`.
    ///
    /// Returns `false` when another writer changed the job first (or it no
    /// longer exists); nothing is written in that case.
    pub async fn update_job(
        &self,
        id: &str,
        expected: JobState,
        update: &JobUpdate,
    ) -> Result<bool, StoreError> {
        let mut query: QueryBuilder<Sqlite> = QueryBuilder::new("UPDATE jobs SET updated_at_ms = ");
        query.push_bind(Utc::now().timestamp_millis());

        if let Some(state) = update.state {
            query.push(", state = ").push_bind(state.as_str());
        }
        if let Some(attempts) = update.attempts {
            query.push(", attempts = ").push_bind(i64::from(attempts));
        }
        if let Some(run_at) = update.run_at {
            query.push(", run_at_ms = ").push_bind(run_at.timestamp_millis());
        }
        if let Some(last_error) = &update.last_error {
            query.push(", last_error = ").push_bind(last_error.clone());
        }
        if let Some(duration_sec) = update.duration_sec {
            query.push(", duration_sec = ").push_bind(duration_sec);
        }
        if let Some(claimed_by) = &update.claimed_by {
            query.push(", claimed_by = ").push_bind(claimed_by.clone());
        }
        if let Some(finished_at) = update.finished_at {
            query
                .push(", finished_at_ms = ")
                .push_bind(finished_at.map(|t| t.timestamp_millis()));
        }

        query
            .push(" WHERE id = ")
            .push_bind(id.to_string())
            .push(" AND state = ")
            .push_bind(expected.as_str());

        let result = query.build().execute(&self.pool).await?;
        Ok(result.rows_affected() == 1)
    }

    /// Returns the id of the job the claim protocol should try next.
    ///
    /// Lowest priority value first, then earliest `run_at`, then submission order.
    pub async fn next_eligible_job_id(&self, now: DateTime<Utc>) -> Result<Option<String>, StoreError> {
        let row: Option<(String,)> = sqlx::query_as(
            r#"
            SELECT id FROM jobs
            WHERE state = 'pending' AND run_at_ms <= ?1
            ORDER BY priority, run_at_ms, created_at_ms, rowid
            LIMIT 1
            "#,
        )
        .bind(now.timestamp_millis())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(id,)| id))
    }

    /// Deletes dead jobs, or only the dead job `id` when given.
    pub async fn purge_dead_jobs(&self, id: Option<&str>) -> Result<u64, StoreError> {
        let mut query: QueryBuilder<Sqlite> =
            QueryBuilder::new("DELETE FROM jobs WHERE state = 'dead'");
        if let Some(id) = id {
            query.push(" AND id = ").push_bind(id.to_string());
        }

        let result = query.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    // =========================================================================
    // Configuration
    // =========================================================================

    /// Reads a persisted configuration value.
    pub async fn get_config(&self, key: &str) -> Result<Option<String>, StoreError> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM config WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|(value,)| value))
    }

    /// Writes a configuration value, replacing any previous one.
    pub async fn set_config(&self, key: &str, value: &str) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO config (key, value, updated_at_ms) VALUES (?1, ?2, ?3)
            ON CONFLICT (key) DO UPDATE SET
                value = excluded.value,
                updated_at_ms = excluded.updated_at_ms
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Returns every persisted configuration entry, sorted by key.
    pub async fn config_entries(&self) -> Result<Vec<(String, String)>, StoreError> {
        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT key, value FROM config ORDER BY key")
                .fetch_all(&self.pool)
                .await?;

        Ok(rows)
    }

    // =========================================================================
    // Control Signals
    // =========================================================================

    /// Returns whether a stop has been requested.
    pub async fn read_control_signal(&self) -> Result<bool, StoreError> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM control WHERE key = ?1")
            .bind(STOP_REQUESTED_KEY)
            .fetch_optional(&self.pool)
            .await?;

        Ok(matches!(row, Some((value,)) if value == "1"))
    }

    /// Sets or clears the persisted stop request.
    pub async fn write_control_signal(&self, stop: bool) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO control (key, value, updated_at_ms) VALUES (?1, ?2, ?3)
            ON CONFLICT (key) DO UPDATE SET
                value = excluded.value,
                updated_at_ms = excluded.updated_at_ms
            "#,
        )
        .bind(STOP_REQUESTED_KEY)
        .bind(if stop { "1" } else { "0" })
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // =========================================================================
    // Worker Heartbeats
    // =========================================================================

    /// Registers (or re-registers) an execution loop.
    pub async fn register_worker(
        &self,
        worker_id: &str,
        pool_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let now_ms = now.timestamp_millis();
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO workers (worker_id, pool_id, started_at_ms, heartbeat_at_ms)
            VALUES (?1, ?2, ?3, ?3)
            "#,
        )
        .bind(worker_id)
        .bind(pool_id)
        .bind(now_ms)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Refreshes the heartbeat of every loop belonging to `pool_id`.
    pub async fn heartbeat_pool(&self, pool_id: &str, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("UPDATE workers SET heartbeat_at_ms = ?1 WHERE pool_id = ?2")
            .bind(now.timestamp_millis())
            .bind(pool_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    /// Removes an execution loop's registration.
    pub async fn unregister_worker(&self, worker_id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM workers WHERE worker_id = ?1")
            .bind(worker_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Removes every registration of `pool_id`. Returns the number removed.
    pub async fn unregister_pool(&self, pool_id: &str) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM workers WHERE pool_id = ?1")
            .bind(pool_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    /// Counts loops whose heartbeat is not older than `cutoff`.
    pub async fn active_worker_count(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM workers WHERE heartbeat_at_ms >= ?1")
                .bind(cutoff.timestamp_millis())
                .fetch_one(&self.pool)
                .await?;

        Ok(count.max(0) as u64)
    }

    /// Returns `processing` jobs whose owner stopped heartbeating to `pending`.
    ///
    /// The interrupted execution does not count as an attempt. Registrations
    /// older than `cutoff` are removed in the same transaction.
    pub async fn requeue_stale_jobs(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let cutoff_ms = cutoff.timestamp_millis();
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'pending', claimed_by = NULL, updated_at_ms = ?1
            WHERE state = 'processing'
              AND (claimed_by IS NULL OR claimed_by NOT IN (
                    SELECT worker_id FROM workers WHERE heartbeat_at_ms >= ?2
                  ))
            "#,
        )
        .bind(Utc::now().timestamp_millis())
        .bind(cutoff_ms)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM workers WHERE heartbeat_at_ms < ?1")
            .bind(cutoff_ms)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(result.rows_affected())
    }

    // =========================================================================
    // Reporting
    // =========================================================================

    /// Counts jobs per state. States without jobs are absent.
    pub async fn count_by_state(&self) -> Result<BTreeMap<JobState, u64>, StoreError> {
        Ok(self
            .state_summaries()
            .await?
            .into_iter()
            .map(|summary| (summary.state, summary.count))
            .collect())
    }

    /// Job count and mean recorded duration per state.
    pub async fn state_summaries(&self) -> Result<Vec<StateSummary>, StoreError> {
        let rows = sqlx::query(
            "SELECT state, COUNT(*) AS count, AVG(duration_sec) AS avg_duration FROM jobs GROUP BY state",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut summaries = Vec::with_capacity(rows.len());
        for row in rows {
            let count: i64 = row.try_get("count")?;
            summaries.push(StateSummary {
                state: state_from_row(&row)?,
                count: count.max(0) as u64,
                avg_duration_sec: row.try_get("avg_duration")?,
            });
        }

        Ok(summaries)
    }

    /// Completed and dead jobs whose `finished_at` is not older than `cutoff`.
    pub async fn terminal_events_since(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<TerminalEvent>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT state, finished_at_ms FROM jobs
            WHERE state IN ('completed', 'dead') AND finished_at_ms >= ?1
            ORDER BY finished_at_ms
            "#,
        )
        .bind(cutoff.timestamp_millis())
        .fetch_all(&self.pool)
        .await?;

        let mut events = Vec::with_capacity(rows.len());
        for row in rows {
            events.push(TerminalEvent {
                state: state_from_row(&row)?,
                finished_at: from_millis(row.try_get("finished_at_ms")?)?,
            });
        }

        Ok(events)
    }
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_millis(ms).ok_or(StoreError::InvalidTimestamp(ms))
}

fn state_from_row(row: &SqliteRow) -> Result<JobState, StoreError> {
    let state: String = row.try_get("state")?;
    state
        .parse()
        .map_err(|_| StoreError::InvalidState(state.clone()))
}

fn job_from_row(row: &SqliteRow) -> Result<Job, StoreError> {
    let attempts: i64 = row.try_get("attempts")?;
    let max_retries: Option<i64> = row.try_get("max_retries")?;
    let timeout_sec: Option<i64> = row.try_get("timeout_sec")?;
    let finished_at_ms: Option<i64> = row.try_get("finished_at_ms")?;

    Ok(Job {
        id: row.try_get("id")?,
        command: row.try_get("command")?,
        priority: row.try_get("priority")?,
        run_at: from_millis(row.try_get("run_at_ms")?)?,
        state: state_from_row(row)?,
        attempts: attempts.max(0) as u32,
        max_retries: max_retries.map(|v| v.max(0) as u32),
        base_backoff: row.try_get("base_backoff")?,
        timeout_sec: timeout_sec.map(|v| v.max(0) as u64),
        last_error: row.try_get("last_error")?,
        duration_sec: row.try_get("duration_sec")?,
        claimed_by: row.try_get("claimed_by")?,
        created_at: from_millis(row.try_get("created_at_ms")?)?,
        updated_at: from_millis(row.try_get("updated_at_ms")?)?,
        finished_at: finished_at_ms.map(from_millis).transpose()?,
    })
}
