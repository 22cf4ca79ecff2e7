//! Typed operation facade.
//!
//! Bundles the registry, lifecycle controller, delayed sender, and
//! reconciler behind the fixed operation surface an RPC adapter or CLI
//! dispatches to. The coordinator is constructed explicitly at process
//! start (no ambient globals) so tests can run isolated instances.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;

use crate::config::Config;
use crate::error::CoordinatorError;
use crate::exec::ProcessExecutor;
use crate::git::{SystemGitCli, WorktreeCli};
use crate::lifecycle::{CallerRole, LifecycleController, TerminationSummary};
use crate::model::{ChildInfo, Message, MessageType, RegistrySnapshot, SessionRecord, SessionStatus};
use crate::reconcile::{ChildRoster, Reconciler};
use crate::registry::SessionRegistry;
use crate::sender::metrics::MetricsSnapshot;
use crate::sender::{DelayedSender, RequestStatus, SendPriority};
use crate::tmux::{SystemTmuxClient, TmuxClient};

/// Aggregate metrics returned by `get_metrics`
#[derive(Debug, Clone, Serialize)]
pub struct CoordinatorMetrics {
    pub active_sessions: usize,
    pub active_relationships: usize,
    pub queued_messages: usize,
    pub unread_messages: usize,
    pub sender: MetricsSnapshot,
}

/// The session coordinator: one instance per process
pub struct Coordinator {
    registry: Arc<SessionRegistry>,
    lifecycle: LifecycleController,
    sender: DelayedSender,
    reconciler: Arc<Reconciler>,
}

impl Coordinator {
    /// Build against the real tmux and git CLIs
    pub fn new(config: &Config) -> Self {
        let executor = ProcessExecutor::new(config.command_timeout());
        let tmux: Arc<dyn TmuxClient> = Arc::new(SystemTmuxClient::new(executor.clone()));
        let git: Arc<dyn WorktreeCli> = Arc::new(SystemGitCli::new(executor));
        Self::with_clients(config, tmux, git)
    }

    /// Build against injected clients (mocks in tests)
    pub fn with_clients(
        config: &Config,
        tmux: Arc<dyn TmuxClient>,
        git: Arc<dyn WorktreeCli>,
    ) -> Self {
        let registry = Arc::new(SessionRegistry::new(config.registry.limits()));
        let lifecycle =
            LifecycleController::new(tmux.clone(), git, registry.clone());

        // Delivery outcomes land in the registry as message records on the
        // target session's queue
        let outcome_registry = registry.clone();
        let sender = DelayedSender::with_completion_hook(
            tmux.clone(),
            config.sender.sender_config(),
            Arc::new(move |status: &RequestStatus| {
                let body = serde_json::json!({
                    "request_id": status.request_id,
                    "state": status.state,
                    "error": status.error,
                });
                let _ = outcome_registry.enqueue_message(
                    "delayed-sender",
                    &status.session_name,
                    MessageType::StatusUpdate,
                    &body.to_string(),
                );
            }),
        );

        let reconciler = Arc::new(Reconciler::new(
            tmux,
            registry.clone(),
            config.tick_interval(),
        ));
        Self {
            registry,
            lifecycle,
            sender,
            reconciler,
        }
    }

    /// Start the reconciliation loop and the sender worker pool. Idempotent.
    pub fn start(&self) {
        Arc::clone(&self.reconciler).start();
        self.sender.start();
    }

    /// Signal both background activities to stop. Idempotent.
    pub fn shutdown(&self) {
        self.reconciler.stop();
        self.sender.stop();
    }

    /// Watch handle for the reconciler's published child roster
    pub fn roster(&self) -> watch::Receiver<ChildRoster> {
        self.reconciler.roster()
    }

    /// Run one reconciliation pass immediately
    pub async fn reconcile_now(&self) {
        self.reconciler.tick_once().await;
    }

    // ========== lifecycle operations ==========

    pub async fn create_master_session(
        &self,
        project_id: &str,
        cwd: Option<&Path>,
    ) -> Result<SessionRecord, CoordinatorError> {
        let cwd = resolve_cwd(cwd)?;
        self.lifecycle
            .create_master(project_id, &cwd, CallerRole::from_env())
            .await
    }

    pub async fn create_child_session(
        &self,
        project_id: &str,
        task_id: &str,
        cwd: Option<&Path>,
        branch: Option<&str>,
    ) -> Result<SessionRecord, CoordinatorError> {
        let cwd = resolve_cwd(cwd)?;
        self.lifecycle
            .create_child(project_id, task_id, &cwd, branch, CallerRole::from_env())
            .await
    }

    pub async fn terminate_session(
        &self,
        session_name: &str,
    ) -> Result<TerminationSummary, CoordinatorError> {
        self.lifecycle
            .terminate_session(session_name, CallerRole::from_env())
            .await
    }

    // ========== registry operations ==========

    pub fn register_relationship(
        &self,
        parent: &str,
        child: &str,
        task_id: &str,
        project_id: &str,
    ) -> Result<(), CoordinatorError> {
        self.registry
            .register_relationship(parent, child, task_id, project_id)
    }

    pub fn report_status(
        &self,
        session_name: &str,
        status: SessionStatus,
        progress: u8,
        details: &str,
    ) -> Result<SessionRecord, CoordinatorError> {
        self.registry
            .upsert_session_status(session_name, status, progress, details)
    }

    pub fn list_children(&self, parent: &str) -> Result<Vec<ChildInfo>, CoordinatorError> {
        self.registry.list_children(parent)
    }

    pub fn query_status(&self, session_name: &str) -> Result<SessionRecord, CoordinatorError> {
        self.registry.query_status(session_name)
    }

    pub fn query_all(&self) -> HashMap<String, SessionRecord> {
        self.registry.query_all()
    }

    pub fn send_message(
        &self,
        from: &str,
        to: &str,
        message_type: MessageType,
        content: &str,
    ) -> Result<String, CoordinatorError> {
        self.registry.enqueue_message(from, to, message_type, content)
    }

    pub fn drain_messages(&self, session_name: &str) -> Vec<Message> {
        self.registry.drain_unread(session_name)
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        self.registry.snapshot()
    }

    // ========== sender operations ==========

    pub fn send_delayed(
        &self,
        session_name: &str,
        content: &str,
        delay: Option<Duration>,
        priority: Option<SendPriority>,
        window: Option<u32>,
        pane: Option<u32>,
    ) -> Result<String, CoordinatorError> {
        self.sender.enqueue(
            session_name,
            content,
            delay,
            priority.unwrap_or(SendPriority::Normal),
            window,
            pane,
        )
    }

    pub fn cancel_delayed(&self, request_id: &str) -> bool {
        self.sender.cancel(request_id)
    }

    pub fn delayed_status(&self, request_id: &str) -> Option<RequestStatus> {
        self.sender.status(request_id)
    }

    pub fn get_metrics(&self) -> CoordinatorMetrics {
        let snapshot = self.registry.snapshot();
        CoordinatorMetrics {
            active_sessions: snapshot.sessions.len(),
            active_relationships: snapshot.relationships.len(),
            queued_messages: snapshot.total_messages,
            unread_messages: snapshot.unread_messages,
            sender: self.sender.metrics(),
        }
    }
}

fn resolve_cwd(cwd: Option<&Path>) -> Result<PathBuf, CoordinatorError> {
    match cwd {
        Some(path) => Ok(path.to_path_buf()),
        None => std::env::current_dir()
            .map_err(|e| CoordinatorError::Internal(format!("cannot resolve working directory: {e}"))),
    }
}
