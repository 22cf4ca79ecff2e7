//! Process executor for external command invocation.
//!
//! Wraps tmux and git invocations with timeouts and structured results.
//! Non-zero exit codes are not errors — they are data in [`ExecOutput`] so
//! the caller decides. Only spawn failures, timeouts, and signal kills
//! surface as [`ExecError`].

use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// Default per-invocation timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors from the executor itself (distinct from non-zero exits)
#[derive(Error, Debug)]
pub enum ExecError {
    #[error("executable not found: {0}")]
    NotFound(String),

    #[error("'{program}' timed out after {timeout:?}")]
    Timeout { program: String, timeout: Duration },

    #[error("failed to spawn '{program}': {message}")]
    SpawnFailed { program: String, message: String },

    #[error("'{0}' was interrupted by a signal")]
    Interrupted(String),
}

/// Captured result of one command invocation
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Shells out with a bounded timeout, capturing output as lossy UTF-8
#[derive(Debug, Clone)]
pub struct ProcessExecutor {
    default_timeout: Duration,
}

impl ProcessExecutor {
    pub fn new(default_timeout: Duration) -> Self {
        Self { default_timeout }
    }

    /// Run a command in the current working directory
    pub async fn run(
        &self,
        argv: &[&str],
        timeout: Option<Duration>,
    ) -> Result<ExecOutput, ExecError> {
        self.spawn_and_wait(argv, None, None, timeout).await
    }

    /// Run a command with an explicit working directory
    pub async fn run_in_dir(
        &self,
        argv: &[&str],
        cwd: &Path,
        timeout: Option<Duration>,
    ) -> Result<ExecOutput, ExecError> {
        self.spawn_and_wait(argv, Some(cwd), None, timeout).await
    }

    /// Run a command feeding `input` on stdin
    pub async fn run_piped_stdin(
        &self,
        argv: &[&str],
        input: &str,
        timeout: Option<Duration>,
    ) -> Result<ExecOutput, ExecError> {
        self.spawn_and_wait(argv, None, Some(input), timeout).await
    }

    async fn spawn_and_wait(
        &self,
        argv: &[&str],
        cwd: Option<&Path>,
        stdin_data: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<ExecOutput, ExecError> {
        let program = argv.first().copied().unwrap_or_default().to_string();
        if program.is_empty() {
            return Err(ExecError::SpawnFailed {
                program,
                message: "empty argv".to_string(),
            });
        }

        let timeout = timeout.unwrap_or(self.default_timeout);
        debug!(?argv, ?cwd, ?timeout, "Running external command");

        let mut cmd = Command::new(&program);
        cmd.args(&argv[1..])
            // Child processes must never inherit the controlling terminal
            .stdin(if stdin_data.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }

        let start = Instant::now();
        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ExecError::NotFound(program.clone())
            } else {
                ExecError::SpawnFailed {
                    program: program.clone(),
                    message: e.to_string(),
                }
            }
        })?;

        if let Some(input) = stdin_data {
            if let Some(mut stdin) = child.stdin.take() {
                stdin
                    .write_all(input.as_bytes())
                    .await
                    .map_err(|e| ExecError::SpawnFailed {
                        program: program.clone(),
                        message: format!("failed to write stdin: {e}"),
                    })?;
                // Close stdin so the child sees EOF
                drop(stdin);
            }
        }

        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(ExecError::SpawnFailed {
                    program,
                    message: e.to_string(),
                })
            }
            Err(_) => {
                // kill_on_drop reaps the child when `child` is dropped here
                return Err(ExecError::Timeout { program, timeout });
            }
        };

        let exit_code = match output.status.code() {
            Some(code) => code,
            None => return Err(ExecError::Interrupted(program)),
        };

        Ok(ExecOutput {
            exit_code,
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            duration: start.elapsed(),
        })
    }
}

impl Default for ProcessExecutor {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT)
    }
}
