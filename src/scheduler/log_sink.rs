//! Per-job output logs.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::io::AsyncWriteExt;

use super::executor::ExecutionResult;

/// Output captured from one execution.
#[derive(Debug, Clone)]
pub struct JobLog {
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub error: Option<String>,
}

impl JobLog {
    pub fn from_result(attempt: u32, started_at: DateTime<Utc>, result: &ExecutionResult) -> Self {
        Self {
            attempt,
            started_at,
            exit_code: result.exit_code,
            stdout: result.stdout.clone(),
            stderr: result.stderr.clone(),
            error: result.outcome.error().map(str::to_string),
        }
    }

    /// Renders the entry appended to a job's log file.
    pub fn render(&self) -> String {
        let mut out = format!(
            "=== attempt {} at {} (exit: {}) ===\n",
            self.attempt,
            self.started_at.to_rfc3339(),
            self.exit_code
                .map(|c| c.to_string())
                .unwrap_or_else(|| "none".to_string())
        );
        if !self.stdout.is_empty() {
            out.push_str("--- stdout ---\n");
            out.push_str(&self.stdout);
            if !self.stdout.ends_with('\n') {
                out.push('\n');
            }
        }
        if !self.stderr.is_empty() {
            out.push_str("--- stderr ---\n");
            out.push_str(&self.stderr);
            if !self.stderr.ends_with('\n') {
                out.push('\n');
            }
        }
        if let Some(error) = &self.error {
            out.push_str(&format!("--- error: {} ---\n", error));
        }
        out
    }
}

/// Destination for job output.
#[async_trait]
pub trait JobLogSink: Send + Sync {
    async fn append(&self, job_id: &str, log: &JobLog) -> std::io::Result<()>;
}

/// Appends each job's output to `<dir>/<job_id>.log`.
#[derive(Debug, Clone)]
pub struct FileLogSink {
    dir: PathBuf,
}

impl FileLogSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the log file for `job_id`. Path separators in ids are replaced.
    pub fn path_for(&self, job_id: &str) -> PathBuf {
        let safe: String = job_id
            .chars()
            .map(|c| if c == '/' || c == '\\' { '_' } else { c })
            .collect();
        self.dir.join(format!("{}.log", safe))
    }
}

#[async_trait]
impl JobLogSink for FileLogSink {
    async fn append(&self, job_id: &str, log: &JobLog) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path_for(job_id))
            .await?;
        file.write_all(log.render().as_bytes()).await?;
        file.flush().await
    }
}

/// Discards job output.
#[derive(Debug, Clone, Default)]
pub struct NullLogSink;

#[async_trait]
impl JobLogSink for NullLogSink {
    async fn append(&self, _job_id: &str, _log: &JobLog) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log(attempt: u32, stdout: &str) -> JobLog {
        JobLog {
            attempt,
            started_at: Utc::now(),
            exit_code: Some(0),
            stdout: stdout.to_string(),
            stderr: String::new(),
            error: None,
        }
    }

    #[test]
    fn test_render() {
        let rendered = log(2, "hello").render();
        assert!(rendered.starts_with("=== attempt 2 at "));
        assert!(rendered.contains("(exit: 0)"));
        assert!(rendered.contains("--- stdout ---\nhello\n"));
        assert!(!rendered.contains("stderr"));
    }

    #[test]
    fn test_path_for_sanitises_separators() {
        let sink = FileLogSink::new("/tmp/logs");
        assert_eq!(sink.path_for("a/b"), PathBuf::from("/tmp/logs/a_b.log"));
    }

    #[tokio::test]
    async fn test_file_sink_appends() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileLogSink::new(dir.path().join("logs"));

        sink.append("job-1", &log(0, "first")).await.unwrap();
        sink.append("job-1", &log(1, "second")).await.unwrap();

        let content = std::fs::read_to_string(sink.path_for("job-1")).unwrap();
        assert!(content.contains("first"));
        assert!(content.contains("second"));
        assert!(content.find("first").unwrap() < content.find("second").unwrap());
    }
}
