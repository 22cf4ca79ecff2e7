//! Tmux session management abstraction layer.
//!
//! Provides a trait-based abstraction over tmux operations to enable:
//! - Unit testing without real tmux
//! - Mocking session behavior
//! - Graceful handling when tmux is unavailable
//!
//! The production implementation shells out through the process executor,
//! so every invocation is bounded by a timeout.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use thiserror::Error;

use crate::exec::{ExecError, ProcessExecutor};

/// Errors specific to tmux operations
#[derive(Error, Debug)]
pub enum TmuxError {
    #[error("tmux is not installed or not in PATH")]
    NotInstalled,

    #[error("session '{0}' already exists")]
    SessionExists(String),

    #[error("session '{0}' not found")]
    SessionNotFound(String),

    #[error("failed to create session '{0}': {1}")]
    SessionCreationFailed(String, String),

    #[error("failed to send keys to '{0}': {1}")]
    SendKeysFailed(String, String),

    #[error("tmux command failed: {0}")]
    CommandFailed(String),
}

impl From<ExecError> for TmuxError {
    fn from(err: ExecError) -> Self {
        match err {
            ExecError::NotFound(_) => TmuxError::NotInstalled,
            other => TmuxError::CommandFailed(other.to_string()),
        }
    }
}

/// Version information for tmux
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TmuxVersion {
    pub major: u32,
    pub minor: u32,
    pub raw: String,
}

impl TmuxVersion {
    /// Parse a version string like "tmux 3.4" or "tmux 3.3a"
    pub fn parse(version_str: &str) -> Option<Self> {
        let parts: Vec<&str> = version_str.split_whitespace().collect();
        if parts.len() < 2 {
            return None;
        }

        let numeric_part: String = parts[1]
            .chars()
            .take_while(|c| c.is_ascii_digit() || *c == '.')
            .collect();

        let mut version_nums = numeric_part.split('.');
        let major: u32 = version_nums.next()?.parse().ok()?;
        let minor: u32 = version_nums.next().unwrap_or("0").parse().unwrap_or(0);

        Some(Self {
            major,
            minor,
            raw: version_str.to_string(),
        })
    }

    /// Check if this version meets the minimum requirement
    pub fn meets_minimum(&self, min_major: u32, min_minor: u32) -> bool {
        self.major > min_major || (self.major == min_major && self.minor >= min_minor)
    }
}

/// Pane addressing for send-keys: `session[:window[.pane]]`
#[derive(Debug, Clone, Default)]
pub struct SendTarget {
    pub session: String,
    pub window: Option<u32>,
    pub pane: Option<u32>,
}

impl SendTarget {
    pub fn session(session: &str) -> Self {
        Self {
            session: session.to_string(),
            window: None,
            pane: None,
        }
    }

    fn to_arg(&self) -> String {
        let mut target = self.session.clone();
        if let Some(window) = self.window {
            target.push_str(&format!(":{window}"));
            if let Some(pane) = self.pane {
                target.push_str(&format!(".{pane}"));
            }
        }
        target
    }
}

/// Trait abstracting tmux operations for testability
#[async_trait]
pub trait TmuxClient: Send + Sync {
    /// Check if tmux is available and return version info
    async fn check_available(&self) -> Result<TmuxVersion, TmuxError>;

    /// Check if a session exists
    async fn has_session(&self, name: &str) -> Result<bool, TmuxError>;

    /// Create a new detached session with the given working directory
    async fn new_session(&self, name: &str, cwd: &str) -> Result<(), TmuxError>;

    /// Kill a session
    async fn kill_session(&self, name: &str) -> Result<(), TmuxError>;

    /// List the names of all live sessions
    async fn list_sessions(&self) -> Result<Vec<String>, TmuxError>;

    /// Set an environment variable on a session
    async fn set_environment(&self, name: &str, key: &str, value: &str) -> Result<(), TmuxError>;

    /// Send literal text (no key translation, no Enter)
    async fn send_literal(&self, target: &SendTarget, content: &str) -> Result<(), TmuxError>;

    /// Send a discrete Enter keystroke
    async fn send_enter(&self, target: &SendTarget) -> Result<(), TmuxError>;
}

/// Real implementation shelling out through the process executor
pub struct SystemTmuxClient {
    executor: ProcessExecutor,
}

impl SystemTmuxClient {
    pub fn new(executor: ProcessExecutor) -> Self {
        Self { executor }
    }

    async fn run_tmux(&self, args: &[&str]) -> Result<crate::exec::ExecOutput, TmuxError> {
        let mut argv = vec!["tmux"];
        argv.extend_from_slice(args);
        Ok(self.executor.run(&argv, None).await?)
    }
}

impl Default for SystemTmuxClient {
    fn default() -> Self {
        Self::new(ProcessExecutor::default())
    }
}

#[async_trait]
impl TmuxClient for SystemTmuxClient {
    async fn check_available(&self) -> Result<TmuxVersion, TmuxError> {
        let output = self.run_tmux(&["-V"]).await?;
        if !output.success() {
            return Err(TmuxError::NotInstalled);
        }
        TmuxVersion::parse(output.stdout.trim()).ok_or_else(|| {
            TmuxError::CommandFailed(format!("could not parse version: {}", output.stdout))
        })
    }

    async fn has_session(&self, name: &str) -> Result<bool, TmuxError> {
        // Exact match with -t=; non-zero exit just means "no session"
        let target = format!("={name}");
        match self.run_tmux(&["has-session", "-t", &target]).await {
            Ok(out) => Ok(out.success()),
            Err(TmuxError::NotInstalled) => Err(TmuxError::NotInstalled),
            Err(_) => Ok(false),
        }
    }

    async fn new_session(&self, name: &str, cwd: &str) -> Result<(), TmuxError> {
        if self.has_session(name).await? {
            return Err(TmuxError::SessionExists(name.to_string()));
        }
        let output = self
            .run_tmux(&["new-session", "-d", "-s", name, "-c", cwd])
            .await?;
        if !output.success() {
            return Err(TmuxError::SessionCreationFailed(
                name.to_string(),
                output.stderr.trim().to_string(),
            ));
        }
        Ok(())
    }

    async fn kill_session(&self, name: &str) -> Result<(), TmuxError> {
        let output = self.run_tmux(&["kill-session", "-t", name]).await?;
        if !output.success() {
            return Err(TmuxError::SessionNotFound(name.to_string()));
        }
        Ok(())
    }

    async fn list_sessions(&self) -> Result<Vec<String>, TmuxError> {
        match self
            .run_tmux(&["list-sessions", "-F", "#{session_name}"])
            .await
        {
            Ok(out) if out.success() => Ok(out
                .stdout
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect()),
            // No server running or no sessions
            Ok(_) => Ok(Vec::new()),
            Err(TmuxError::NotInstalled) => Err(TmuxError::NotInstalled),
            Err(_) => Ok(Vec::new()),
        }
    }

    async fn set_environment(&self, name: &str, key: &str, value: &str) -> Result<(), TmuxError> {
        let output = self
            .run_tmux(&["set-environment", "-t", name, key, value])
            .await?;
        if !output.success() {
            return Err(TmuxError::CommandFailed(format!(
                "set-environment {key} on {name}: {}",
                output.stderr.trim()
            )));
        }
        Ok(())
    }

    async fn send_literal(&self, target: &SendTarget, content: &str) -> Result<(), TmuxError> {
        let target_arg = target.to_arg();
        let output = self
            .run_tmux(&["send-keys", "-t", &target_arg, "-l", content])
            .await?;
        if !output.success() {
            return Err(TmuxError::SendKeysFailed(
                target_arg,
                output.stderr.trim().to_string(),
            ));
        }
        Ok(())
    }

    async fn send_enter(&self, target: &SendTarget) -> Result<(), TmuxError> {
        let target_arg = target.to_arg();
        let output = self
            .run_tmux(&["send-keys", "-t", &target_arg, "Enter"])
            .await?;
        if !output.success() {
            return Err(TmuxError::SendKeysFailed(
                target_arg,
                output.stderr.trim().to_string(),
            ));
        }
        Ok(())
    }
}

/// Mock implementation for testing
#[derive(Default)]
pub struct MockTmuxClient {
    /// Simulated sessions: name -> state
    sessions: Arc<Mutex<HashMap<String, MockSession>>>,
    /// Whether tmux is "installed"
    pub installed: Arc<Mutex<bool>>,
    /// Record of commands executed
    pub command_log: Arc<Mutex<Vec<MockCommand>>>,
    /// Fail the next N send operations (for retry/breaker tests)
    pub fail_sends: Arc<Mutex<u32>>,
}

#[derive(Debug, Clone, Default)]
pub struct MockSession {
    pub working_dir: String,
    pub env: HashMap<String, String>,
    pub keys_sent: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct MockCommand {
    pub operation: String,
    pub args: Vec<String>,
}

impl MockTmuxClient {
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            installed: Arc::new(Mutex::new(true)),
            command_log: Arc::new(Mutex::new(Vec::new())),
            fail_sends: Arc::new(Mutex::new(0)),
        }
    }

    /// Create a mock that simulates tmux not being installed
    pub fn not_installed() -> Self {
        let mock = Self::new();
        *mock.installed.lock().unwrap() = false;
        mock
    }

    /// Add a pre-existing session (simulates external creation)
    pub fn add_session(&self, name: &str, working_dir: &str) {
        self.sessions.lock().unwrap().insert(
            name.to_string(),
            MockSession {
                working_dir: working_dir.to_string(),
                ..MockSession::default()
            },
        );
    }

    /// Remove a session out-of-band (simulates external kill)
    pub fn drop_session(&self, name: &str) {
        self.sessions.lock().unwrap().remove(name);
    }

    /// Fail the next `n` send_literal/send_enter calls
    pub fn fail_next_sends(&self, n: u32) {
        *self.fail_sends.lock().unwrap() = n;
    }

    /// Environment variables set on a session (for test assertions)
    pub fn session_env(&self, name: &str) -> Option<HashMap<String, String>> {
        self.sessions.lock().unwrap().get(name).map(|s| s.env.clone())
    }

    /// Keys sent to a session (for test assertions)
    pub fn keys_sent(&self, name: &str) -> Vec<String> {
        self.sessions
            .lock()
            .unwrap()
            .get(name)
            .map(|s| s.keys_sent.clone())
            .unwrap_or_default()
    }

    /// Working directory a session was created with
    pub fn working_dir(&self, name: &str) -> Option<String> {
        self.sessions
            .lock()
            .unwrap()
            .get(name)
            .map(|s| s.working_dir.clone())
    }

    /// Get the command log
    pub fn commands(&self) -> Vec<MockCommand> {
        self.command_log.lock().unwrap().clone()
    }

    fn log_command(&self, operation: &str, args: &[&str]) {
        self.command_log.lock().unwrap().push(MockCommand {
            operation: operation.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
        });
    }

    fn check_installed(&self) -> Result<(), TmuxError> {
        if *self.installed.lock().unwrap() {
            Ok(())
        } else {
            Err(TmuxError::NotInstalled)
        }
    }

    fn take_send_failure(&self, target: &str) -> Result<(), TmuxError> {
        let mut remaining = self.fail_sends.lock().unwrap();
        if *remaining > 0 {
            *remaining -= 1;
            return Err(TmuxError::SendKeysFailed(
                target.to_string(),
                "injected failure".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl TmuxClient for MockTmuxClient {
    async fn check_available(&self) -> Result<TmuxVersion, TmuxError> {
        self.log_command("check_available", &[]);
        self.check_installed()?;
        Ok(TmuxVersion {
            major: 3,
            minor: 4,
            raw: "tmux 3.4".to_string(),
        })
    }

    async fn has_session(&self, name: &str) -> Result<bool, TmuxError> {
        self.log_command("has_session", &[name]);
        self.check_installed()?;
        Ok(self.sessions.lock().unwrap().contains_key(name))
    }

    async fn new_session(&self, name: &str, cwd: &str) -> Result<(), TmuxError> {
        self.log_command("new_session", &[name, cwd]);
        self.check_installed()?;
        let mut sessions = self.sessions.lock().unwrap();
        if sessions.contains_key(name) {
            return Err(TmuxError::SessionExists(name.to_string()));
        }
        sessions.insert(
            name.to_string(),
            MockSession {
                working_dir: cwd.to_string(),
                ..MockSession::default()
            },
        );
        Ok(())
    }

    async fn kill_session(&self, name: &str) -> Result<(), TmuxError> {
        self.log_command("kill_session", &[name]);
        self.check_installed()?;
        if self.sessions.lock().unwrap().remove(name).is_some() {
            Ok(())
        } else {
            Err(TmuxError::SessionNotFound(name.to_string()))
        }
    }

    async fn list_sessions(&self) -> Result<Vec<String>, TmuxError> {
        self.log_command("list_sessions", &[]);
        self.check_installed()?;
        let mut names: Vec<String> = self.sessions.lock().unwrap().keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn set_environment(&self, name: &str, key: &str, value: &str) -> Result<(), TmuxError> {
        self.log_command("set_environment", &[name, key, value]);
        self.check_installed()?;
        let mut sessions = self.sessions.lock().unwrap();
        match sessions.get_mut(name) {
            Some(session) => {
                session.env.insert(key.to_string(), value.to_string());
                Ok(())
            }
            None => Err(TmuxError::SessionNotFound(name.to_string())),
        }
    }

    async fn send_literal(&self, target: &SendTarget, content: &str) -> Result<(), TmuxError> {
        let target_arg = target.to_arg();
        self.log_command("send_literal", &[&target_arg, content]);
        self.check_installed()?;
        self.take_send_failure(&target_arg)?;
        let mut sessions = self.sessions.lock().unwrap();
        match sessions.get_mut(&target.session) {
            Some(session) => {
                session.keys_sent.push(format!("-l {content}"));
                Ok(())
            }
            None => Err(TmuxError::SessionNotFound(target.session.clone())),
        }
    }

    async fn send_enter(&self, target: &SendTarget) -> Result<(), TmuxError> {
        let target_arg = target.to_arg();
        self.log_command("send_enter", &[&target_arg]);
        self.check_installed()?;
        self.take_send_failure(&target_arg)?;
        let mut sessions = self.sessions.lock().unwrap();
        match sessions.get_mut(&target.session) {
            Some(session) => {
                session.keys_sent.push("Enter".to_string());
                Ok(())
            }
            None => Err(TmuxError::SessionNotFound(target.session.clone())),
        }
    }
}
