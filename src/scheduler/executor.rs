//! Execution engine: runs a job's shell command under a hard timeout.

use std::process::{Output, Stdio};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;

/// How an execution ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Success,
    Failure {
        /// Text recorded as the job's `last_error`.
        error: String,
        timed_out: bool,
    },
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success)
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            Outcome::Success => None,
            Outcome::Failure { error, .. } => Some(error),
        }
    }
}

/// Result of one execution, including captured output.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub outcome: Outcome,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    /// Observed wall time, whatever the outcome.
    pub duration: Duration,
}

impl ExecutionResult {
    pub fn duration_sec(&self) -> f64 {
        self.duration.as_secs_f64()
    }
}

/// Runs commands through a shell.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    shell: String,
}

impl Default for CommandExecutor {
    fn default() -> Self {
        Self {
            shell: "sh".to_string(),
        }
    }
}

impl CommandExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses `shell` (invoked as `<shell> -c <command>`) instead of `sh`.
    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }

    /// Runs `command`, killing it if it outlives `timeout`.
    ///
    /// The shell runs as the leader of a new process group, so a timeout
    /// kills every process the command started, not only the shell.
    ///
    /// Never fails: spawn errors, non-zero exits and timeouts are all reported
    /// as [`Outcome::Failure`].
    pub async fn execute(&self, command: &str, timeout: Duration) -> ExecutionResult {
        let started = Instant::now();

        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                return Self::failure(format!("failed to spawn: {}", e), false, started);
            }
        };

        // Taken before the child is reaped; afterwards `id()` returns None.
        let pgid = child.id();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let run = async {
            let (status, stdout, stderr) =
                tokio::join!(child.wait(), read_pipe(stdout), read_pipe(stderr));
            status.map(|status| Output {
                status,
                stdout,
                stderr,
            })
        };

        let waited = tokio::time::timeout(timeout, run).await;
        match waited {
            Ok(Ok(output)) => Self::process_output(output, started.elapsed()),
            Ok(Err(e)) => Self::failure(format!("failed to wait for command: {}", e), false, started),
            Err(_) => {
                kill_process_group(pgid);
                if let Err(e) = child.kill().await {
                    tracing::debug!(error = %e, "Shell already exited after process group kill");
                }
                Self::failure(format!("timed out after {}s", timeout.as_secs()), true, started)
            }
        }
    }

    fn failure(error: String, timed_out: bool, started: Instant) -> ExecutionResult {
        ExecutionResult {
            outcome: Outcome::Failure { error, timed_out },
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            duration: started.elapsed(),
        }
    }

    fn process_output(output: Output, duration: Duration) -> ExecutionResult {
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        let exit_code = output.status.code();

        let outcome = if output.status.success() {
            Outcome::Success
        } else {
            let trimmed = stderr.trim();
            let error = if !trimmed.is_empty() {
                trimmed.to_string()
            } else if let Some(code) = exit_code {
                format!("exit code {}", code)
            } else {
                "terminated by signal".to_string()
            };
            Outcome::Failure {
                error,
                timed_out: false,
            }
        };

        ExecutionResult {
            outcome,
            exit_code,
            stdout,
            stderr,
            duration,
        }
    }
}

/// Reads a child pipe to EOF. Read errors keep what was read so far.
async fn read_pipe<R: AsyncRead + Unpin>(pipe: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        if let Err(e) = pipe.read_to_end(&mut buf).await {
            tracing::debug!(error = %e, "Failed to read command output");
        }
    }
    buf
}

/// Sends SIGKILL to the process group led by the job's shell.
#[cfg(unix)]
fn kill_process_group(pgid: Option<u32>) {
    let Some(pgid) = pgid.and_then(|id| libc::pid_t::try_from(id).ok()) else {
        return;
    };
    // SAFETY: killpg only sends a signal; the group was created for this job.
    let rc = unsafe { libc::killpg(pgid, libc::SIGKILL) };
    if rc != 0 {
        tracing::debug!(pgid, error = %std::io::Error::last_os_error(), "killpg failed");
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pgid: Option<u32>) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_execute_success_captures_stdout() {
        let result = CommandExecutor::new()
            .execute("echo hello", Duration::from_secs(5))
            .await;

        assert!(result.outcome.is_success());
        assert_eq!(result.exit_code, Some(0));
        assert_eq!(result.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn test_execute_failure_uses_stderr() {
        let result = CommandExecutor::new()
            .execute("echo boom >&2; exit 3", Duration::from_secs(5))
            .await;

        assert_eq!(result.exit_code, Some(3));
        assert_eq!(
            result.outcome,
            Outcome::Failure {
                error: "boom".to_string(),
                timed_out: false
            }
        );
    }

    #[tokio::test]
    async fn test_execute_failure_without_stderr() {
        let result = CommandExecutor::new()
            .execute("exit 7", Duration::from_secs(5))
            .await;

        assert_eq!(result.outcome.error(), Some("exit code 7"));
    }

    #[tokio::test]
    async fn test_execute_timeout() {
        let result = CommandExecutor::new()
            .execute("sleep 5", Duration::from_secs(1))
            .await;

        assert_eq!(
            result.outcome,
            Outcome::Failure {
                error: "timed out after 1s".to_string(),
                timed_out: true
            }
        );
        assert!(result.duration >= Duration::from_secs(1));
        assert!(result.duration < Duration::from_secs(4));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_kills_subshells() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("marker");
        let command = format!("(sleep 2; touch {}); echo after", marker.display());

        let result = CommandExecutor::new()
            .execute(&command, Duration::from_secs(1))
            .await;
        assert!(matches!(result.outcome, Outcome::Failure { timed_out: true, .. }));

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(!marker.exists(), "subshell survived the timeout");
    }

    #[tokio::test]
    async fn test_execute_spawn_failure() {
        let result = CommandExecutor::new()
            .with_shell("/nonexistent/shell")
            .execute("true", Duration::from_secs(1))
            .await;

        let error = result.outcome.error().unwrap();
        assert!(error.starts_with("failed to spawn"));
    }
}
