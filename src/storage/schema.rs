//! SQLite schema definitions.
//!
//! Timestamps are stored as unix milliseconds (`*_ms` INTEGER columns) so that
//! ordering and range comparisons are plain integer comparisons.

/// SQL schema for creating the jobs table.
pub const CREATE_JOBS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    id              TEXT    PRIMARY KEY,
    command         TEXT    NOT NULL,
    priority        INTEGER NOT NULL DEFAULT 5,
    run_at_ms       INTEGER NOT NULL,
    state           TEXT    NOT NULL DEFAULT 'pending',
    attempts        INTEGER NOT NULL DEFAULT 0,
    max_retries     INTEGER,
    base_backoff    REAL,
    timeout_sec     INTEGER,
    last_error      TEXT,
    duration_sec    REAL,
    claimed_by      TEXT,
    created_at_ms   INTEGER NOT NULL,
    updated_at_ms   INTEGER NOT NULL,
    finished_at_ms  INTEGER
)
"#;

/// SQL schema for the global key/value configuration table.
pub const CREATE_CONFIG_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS config (
    key             TEXT    PRIMARY KEY,
    value           TEXT    NOT NULL,
    updated_at_ms   INTEGER NOT NULL
)
"#;

/// SQL schema for process-wide control signals (stop requests).
pub const CREATE_CONTROL_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS control (
    key             TEXT    PRIMARY KEY,
    value           TEXT    NOT NULL,
    updated_at_ms   INTEGER NOT NULL
)
"#;

/// SQL schema for execution loop heartbeats.
pub const CREATE_WORKERS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS workers (
    worker_id       TEXT    PRIMARY KEY,
    pool_id         TEXT    NOT NULL,
    started_at_ms   INTEGER NOT NULL,
    heartbeat_at_ms INTEGER NOT NULL
)
"#;

/// Index backing the claim query's filter and sort order.
pub const CREATE_CLAIM_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_jobs_claim
    ON jobs(state, priority, run_at_ms, created_at_ms)
"#;

/// Index backing the per-minute time series.
pub const CREATE_FINISHED_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_jobs_finished ON jobs(finished_at_ms)
"#;

/// Index backing the stale-claim recovery scan.
pub const CREATE_HEARTBEAT_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_workers_heartbeat ON workers(heartbeat_at_ms)
"#;

/// Key of the stop-request row in the control table.
pub const STOP_REQUESTED_KEY: &str = "stop_requested";

/// Returns all schema creation statements in order.
pub fn all_schema_statements() -> Vec<&'static str> {
    vec![
        CREATE_JOBS_TABLE,
        CREATE_CONFIG_TABLE,
        CREATE_CONTROL_TABLE,
        CREATE_WORKERS_TABLE,
        CREATE_CLAIM_INDEX,
        CREATE_FINISHED_INDEX,
        CREATE_HEARTBEAT_INDEX,
    ]
}
