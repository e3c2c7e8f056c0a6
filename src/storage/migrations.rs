//! Database migration helpers.
//!
//! This module applies the schema from [`super::schema`] and records which
//! parts have been applied, so opening an existing database is cheap.

use chrono::Utc;
use sqlx::SqlitePool;
use thiserror::Error;

use super::schema;

/// Errors that can occur during migration operations.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// Database query failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Migration script failed to execute.
    #[error("Migration failed: {0}")]
    MigrationFailed(String),
}

/// Migration runner for applying schema changes.
pub struct MigrationRunner {
    pool: SqlitePool,
}

impl MigrationRunner {
    /// Creates a new migration runner.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Runs all pending migrations.
    ///
    /// Idempotent: every statement uses `IF NOT EXISTS` and applied parts are
    /// recorded with `INSERT OR IGNORE`, so two processes opening the same
    /// file at once both succeed.
    pub async fn run_migrations(&self) -> Result<(), MigrationError> {
        let applied = self.list_applied_migrations().await?;

        for (idx, statement) in schema::all_schema_statements().iter().enumerate() {
            let migration_name = format!("schema_v1_part_{}", idx);

            if !applied.contains(&migration_name) {
                self.apply_migration(&migration_name, statement).await?;
            }
        }

        Ok(())
    }

    async fn ensure_migrations_table(&self) -> Result<(), MigrationError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS _migrations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                applied_at_ms INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn apply_migration(&self, name: &str, sql: &str) -> Result<(), MigrationError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(sql)
            .execute(&mut *tx)
            .await
            .map_err(|e| MigrationError::MigrationFailed(format!("{}: {}", name, e)))?;

        sqlx::query("INSERT OR IGNORE INTO _migrations (name, applied_at_ms) VALUES (?1, ?2)")
            .bind(name)
            .bind(Utc::now().timestamp_millis())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        tracing::debug!(migration = name, "Applied migration");
        Ok(())
    }

    /// Returns the names of applied migrations in application order.
    pub async fn list_applied_migrations(&self) -> Result<Vec<String>, MigrationError> {
        self.ensure_migrations_table().await?;

        let rows: Vec<(String,)> = sqlx::query_as("SELECT name FROM _migrations ORDER BY id")
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(|(name,)| name).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};

    async fn temp_pool(dir: &tempfile::TempDir) -> SqlitePool {
        let opts = SqliteConnectOptions::new()
            .filename(dir.path().join("migrations.db"))
            .create_if_missing(true);
        SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await
            .unwrap()
    }

    #[test]
    fn test_migration_error_display() {
        let err = MigrationError::MigrationFailed("test error".to_string());
        assert!(err.to_string().contains("test error"));
    }

    #[tokio::test]
    async fn test_run_migrations_twice() {
        let dir = tempfile::tempdir().unwrap();
        let runner = MigrationRunner::new(temp_pool(&dir).await);

        runner.run_migrations().await.unwrap();
        runner.run_migrations().await.unwrap();

        let applied = runner.list_applied_migrations().await.unwrap();
        assert_eq!(applied.len(), schema::all_schema_statements().len());
        assert_eq!(applied[0], "schema_v1_part_0");
    }
}
