//! Lifecycle controller for master and child sessions.
//!
//! Composes the tmux and git adapters with the registry to create and
//! terminate sessions atomically. Creation paths compensate in reverse
//! order on failure; termination reports partial results instead of
//! retrying. Every mutating entry point passes the role capability gate
//! first — a child session must never spawn or kill sessions.

use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::error::CoordinatorError;
use crate::git::WorktreeCli;
use crate::model::SessionRecord;
use crate::naming;
use crate::registry::SessionRegistry;
use crate::tmux::{SendTarget, TmuxClient};

/// Role of the caller invoking a lifecycle operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallerRole {
    Master,
    Child,
    External,
}

impl CallerRole {
    /// Infer the caller from the coordinator environment variables set on
    /// managed tmux sessions. Anything unrecognized is an external caller.
    pub fn from_env() -> Self {
        match std::env::var("MCP_SESSION_TYPE").ok().as_deref() {
            Some("master") => CallerRole::Master,
            Some("child") => CallerRole::Child,
            _ => CallerRole::External,
        }
    }
}

/// Result of a termination, listing which cleanups succeeded
#[derive(Debug, Clone, Serialize)]
pub struct TerminationSummary {
    pub session_name: String,
    /// Whether a registry record existed for the session
    pub registry_removed: bool,
    pub tmux_killed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worktree_removed: Option<bool>,
    /// Child records cascade-removed from the registry (masters only)
    pub children_cascaded: Vec<String>,
    /// Human-readable notes on tolerated partial failures
    pub warnings: Vec<String>,
}

/// Creates and terminates sessions, enforcing role capabilities
pub struct LifecycleController {
    tmux: Arc<dyn TmuxClient>,
    git: Arc<dyn WorktreeCli>,
    registry: Arc<SessionRegistry>,
}

impl LifecycleController {
    pub fn new(
        tmux: Arc<dyn TmuxClient>,
        git: Arc<dyn WorktreeCli>,
        registry: Arc<SessionRegistry>,
    ) -> Self {
        Self {
            tmux,
            git,
            registry,
        }
    }

    /// Child sessions may not create or terminate sessions. Hard rule: it
    /// prevents children from spawning nested parallel workflows.
    fn check_capability(caller: CallerRole, operation: &str) -> Result<(), CoordinatorError> {
        if caller == CallerRole::Child {
            warn!(operation, "Denied restricted operation to child session");
            return Err(CoordinatorError::SecurityViolation(format!(
                "child sessions may not perform {operation}"
            )));
        }
        // Second line of defense for create operations: a caller whose
        // session name carries the child marker is treated as a child even
        // if MCP_SESSION_TYPE was scrubbed.
        if operation.starts_with("create_") {
            if let Ok(name) = std::env::var("MCP_SESSION_NAME") {
                if naming::parse(&name).role() == crate::model::SessionRole::Child {
                    warn!(session = %name, operation, "Denied create operation to child-named caller");
                    return Err(CoordinatorError::SecurityViolation(format!(
                        "child sessions may not perform {operation}"
                    )));
                }
            }
        }
        Ok(())
    }

    async fn set_session_env(
        &self,
        name: &str,
        session_type: &str,
        project_id: &str,
        task_id: Option<&str>,
    ) -> Result<(), CoordinatorError> {
        let mut vars = vec![
            ("MCP_SESSION_NAME", name.to_string()),
            ("MCP_SESSION_TYPE", session_type.to_string()),
            ("MCP_PROJECT_ID", project_id.to_string()),
            ("MCP_COORDINATOR_ACTIVE", "true".to_string()),
        ];
        if let Some(task_id) = task_id {
            vars.push(("MCP_TASK_ID", task_id.to_string()));
        }
        for (key, value) in vars {
            self.tmux
                .set_environment(name, key, &value)
                .await
                .map_err(|e| CoordinatorError::ExternalFailure(e.to_string()))?;
        }
        Ok(())
    }

    /// Announce the session inside its own shell. Failures are tolerated.
    async fn send_banner(&self, name: &str) {
        let target = SendTarget::session(name);
        let banner = format!("echo 'coordinator session started: {name}'");
        if let Err(e) = self.tmux.send_literal(&target, &banner).await {
            warn!(session = %name, error = %e, "Failed to send session banner");
            return;
        }
        if let Err(e) = self.tmux.send_enter(&target).await {
            warn!(session = %name, error = %e, "Failed to send session banner");
        }
    }

    /// Create the master session for a project: tmux session, environment,
    /// registry record. The tmux session is killed if any later step fails.
    pub async fn create_master(
        &self,
        project_id: &str,
        cwd: &Path,
        caller: CallerRole,
    ) -> Result<SessionRecord, CoordinatorError> {
        Self::check_capability(caller, "create_master")?;
        let name = naming::master_name(project_id)?;

        if self
            .tmux
            .has_session(&name)
            .await
            .map_err(|e| CoordinatorError::ExternalFailure(e.to_string()))?
        {
            return Err(CoordinatorError::Conflict(format!(
                "tmux session already exists: {name}"
            )));
        }

        self.tmux
            .new_session(&name, &cwd.to_string_lossy())
            .await
            .map_err(|e| CoordinatorError::ExternalFailure(e.to_string()))?;

        let result = async {
            self.set_session_env(&name, "master", project_id, None).await?;
            self.registry.insert_master(project_id)
        }
        .await;

        match result {
            Ok(record) => {
                self.send_banner(&name).await;
                info!(session = %name, project = %project_id, "Created master session");
                Ok(record)
            }
            Err(e) => {
                // Best-effort rollback of the tmux session
                if let Err(kill_err) = self.tmux.kill_session(&name).await {
                    warn!(session = %name, error = %kill_err, "Rollback kill failed");
                }
                Err(e)
            }
        }
    }

    /// Create a child session: worktree first, then the tmux session, then
    /// the registry records. Compensations run in reverse on any failure
    /// past the worktree step.
    pub async fn create_child(
        &self,
        project_id: &str,
        task_id: &str,
        base_cwd: &Path,
        branch_name: Option<&str>,
        caller: CallerRole,
    ) -> Result<SessionRecord, CoordinatorError> {
        Self::check_capability(caller, "create_child")?;
        let name = naming::child_name(project_id, task_id)?;

        let worktree_root = base_cwd.join("worktree");
        std::fs::create_dir_all(&worktree_root).map_err(|e| {
            CoordinatorError::ExternalFailure(format!(
                "cannot create worktree root {}: {e}",
                worktree_root.display()
            ))
        })?;

        let worktree_path = worktree_root.join(task_id);
        if worktree_path.exists() {
            return Err(CoordinatorError::Conflict(format!(
                "worktree already exists: {}",
                worktree_path.display()
            )));
        }

        let branch = branch_name
            .map(str::to_string)
            .unwrap_or_else(|| format!("task/{task_id}"));

        self.git
            .add(base_cwd, &worktree_path, &branch)
            .await
            .map_err(|e| CoordinatorError::ExternalFailure(e.to_string()))?;

        // Everything after the worktree is compensated on failure
        let result = self
            .create_child_session_steps(&name, project_id, task_id, &worktree_path, &branch)
            .await;

        match result {
            Ok(record) => {
                self.send_banner(&name).await;
                info!(
                    session = %name,
                    project = %project_id,
                    task = %task_id,
                    worktree = %worktree_path.display(),
                    branch = %branch,
                    "Created child session"
                );
                Ok(record)
            }
            Err((e, tmux_created)) => {
                if tmux_created {
                    if let Err(kill_err) = self.tmux.kill_session(&name).await {
                        warn!(session = %name, error = %kill_err, "Rollback kill failed");
                    }
                }
                if let Err(rm_err) = self.git.remove(base_cwd, &worktree_path).await {
                    warn!(
                        worktree = %worktree_path.display(),
                        error = %rm_err,
                        "Rollback worktree removal failed"
                    );
                }
                Err(e)
            }
        }
    }

    /// Steps 6–9 of child creation. Returns whether the tmux session was
    /// created alongside the error so the caller can compensate.
    async fn create_child_session_steps(
        &self,
        name: &str,
        project_id: &str,
        task_id: &str,
        worktree_path: &Path,
        branch: &str,
    ) -> Result<SessionRecord, (CoordinatorError, bool)> {
        let exists = self
            .tmux
            .has_session(name)
            .await
            .map_err(|e| (CoordinatorError::ExternalFailure(e.to_string()), false))?;
        if exists {
            return Err((
                CoordinatorError::Conflict(format!("tmux session already exists: {name}")),
                false,
            ));
        }

        self.tmux
            .new_session(name, &worktree_path.to_string_lossy())
            .await
            .map_err(|e| (CoordinatorError::ExternalFailure(e.to_string()), false))?;

        self.set_session_env(name, "child", project_id, Some(task_id))
            .await
            .map_err(|e| (e, true))?;

        self.registry
            .insert_child(
                project_id,
                task_id,
                worktree_path.to_path_buf(),
                branch.to_string(),
            )
            .map_err(|e| (e, true))
    }

    /// Terminate a session: freeze and collect cleanup targets from the
    /// registry, kill tmux, remove the worktree for children, then drop the
    /// registry records. Partial failures are reported in the summary, not
    /// retried. Terminating an unknown session is a no-op success.
    pub async fn terminate_session(
        &self,
        session_name: &str,
        caller: CallerRole,
    ) -> Result<TerminationSummary, CoordinatorError> {
        Self::check_capability(caller, "terminate_session")?;

        let plan = self.registry.mark_terminated(session_name);
        let mut warnings = Vec::new();

        let tmux_killed = match self.tmux.kill_session(session_name).await {
            Ok(()) => true,
            Err(crate::tmux::TmuxError::SessionNotFound(_)) => false,
            Err(e) => {
                warnings.push(format!("tmux kill failed: {e}"));
                false
            }
        };

        let worktree_removed = match &plan.worktree_path {
            Some(path) => Some(self.remove_worktree(path, &mut warnings).await),
            None => None,
        };

        let children_cascaded = if plan.existed {
            self.registry.remove_session(session_name)
        } else {
            Vec::new()
        };

        info!(
            session = %session_name,
            tmux_killed,
            cascaded = children_cascaded.len(),
            "Terminated session"
        );

        Ok(TerminationSummary {
            session_name: session_name.to_string(),
            registry_removed: plan.existed,
            tmux_killed,
            worktree_removed,
            children_cascaded,
            warnings,
        })
    }

    async fn remove_worktree(&self, path: &Path, warnings: &mut Vec<String>) -> bool {
        // Run from the worktree root (a directory inside the main
        // repository), not from inside the worktree being removed.
        let repo_dir = path.parent().unwrap_or(path);
        match self.git.remove(repo_dir, path).await {
            Ok(()) => true,
            Err(e) => {
                // Absence is tolerated; anything else is a reportable
                // partial failure
                if path.exists() {
                    warnings.push(format!("worktree removal failed: {e}"));
                }
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::MockGitCli;
    use crate::model::{SessionRole, SessionStatus};
    use crate::registry::RegistryLimits;
    use crate::tmux::MockTmuxClient;

    struct Fixture {
        tmux: Arc<MockTmuxClient>,
        git: Arc<MockGitCli>,
        registry: Arc<SessionRegistry>,
        controller: LifecycleController,
    }

    fn fixture() -> Fixture {
        let tmux = Arc::new(MockTmuxClient::new());
        let git = Arc::new(MockGitCli::new());
        let registry = Arc::new(SessionRegistry::new(RegistryLimits::default()));
        let controller = LifecycleController::new(tmux.clone(), git.clone(), registry.clone());
        Fixture {
            tmux,
            git,
            registry,
            controller,
        }
    }

    #[tokio::test]
    async fn test_create_master() {
        let f = fixture();
        let cwd = tempfile::TempDir::new().unwrap();
        let record = f
            .controller
            .create_master("DEMO", cwd.path(), CallerRole::External)
            .await
            .unwrap();

        assert_eq!(record.session_name, "parallel_DEMO_task_master");
        assert_eq!(record.role, SessionRole::Master);
        assert_eq!(record.status, SessionStatus::Started);

        assert!(f
            .tmux
            .has_session("parallel_DEMO_task_master")
            .await
            .unwrap());
        let env = f.tmux.session_env("parallel_DEMO_task_master").unwrap();
        assert_eq!(env.get("MCP_SESSION_TYPE").unwrap(), "master");
        assert_eq!(env.get("MCP_PROJECT_ID").unwrap(), "DEMO");
        assert_eq!(env.get("MCP_COORDINATOR_ACTIVE").unwrap(), "true");
    }

    #[tokio::test]
    async fn test_create_master_duplicate_rejected() {
        let f = fixture();
        let cwd = tempfile::TempDir::new().unwrap();
        f.controller
            .create_master("DEMO", cwd.path(), CallerRole::External)
            .await
            .unwrap();
        let err = f
            .controller
            .create_master("DEMO", cwd.path(), CallerRole::External)
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_create_child_full_flow() {
        let f = fixture();
        let base = tempfile::TempDir::new().unwrap();
        let record = f
            .controller
            .create_child("DEMO", "T1", base.path(), None, CallerRole::Master)
            .await
            .unwrap();

        let expected_worktree = base.path().join("worktree").join("T1");
        assert_eq!(record.session_name, "parallel_DEMO_task_child_T1");
        assert_eq!(record.status, SessionStatus::Started);
        assert_eq!(record.worktree_path.as_deref(), Some(expected_worktree.as_path()));
        assert_eq!(record.branch.as_deref(), Some("task/T1"));

        assert!(f.git.has_worktree(&expected_worktree));
        assert_eq!(f.git.branch_of(&expected_worktree).unwrap(), "task/T1");
        assert!(f
            .tmux
            .has_session("parallel_DEMO_task_child_T1")
            .await
            .unwrap());
        let env = f.tmux.session_env("parallel_DEMO_task_child_T1").unwrap();
        assert_eq!(env.get("MCP_SESSION_TYPE").unwrap(), "child");
        assert_eq!(env.get("MCP_TASK_ID").unwrap(), "T1");

        // Parent auto-materialized with the relationship
        let children = f
            .registry
            .list_children("parallel_DEMO_task_master")
            .unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].task_id, "T1");
    }

    #[tokio::test]
    async fn test_create_child_custom_branch() {
        let f = fixture();
        let base = tempfile::TempDir::new().unwrap();
        let record = f
            .controller
            .create_child("DEMO", "T1", base.path(), Some("feature/x"), CallerRole::External)
            .await
            .unwrap();
        assert_eq!(record.branch.as_deref(), Some("feature/x"));
    }

    #[tokio::test]
    async fn test_create_child_denied_to_child_caller() {
        let f = fixture();
        let base = tempfile::TempDir::new().unwrap();
        let err = f
            .controller
            .create_child("P", "X", base.path(), None, CallerRole::Child)
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::SecurityViolation(_)));
        // No side effects: neither tmux nor git was touched
        assert!(f.tmux.commands().is_empty());
        assert!(f.git.commands().is_empty());
    }

    #[tokio::test]
    async fn test_terminate_denied_to_child_caller() {
        let f = fixture();
        let err = f
            .controller
            .terminate_session("parallel_P_task_child_X", CallerRole::Child)
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::SecurityViolation(_)));
    }

    #[tokio::test]
    async fn test_create_child_git_failure_no_tmux() {
        let f = fixture();
        let base = tempfile::TempDir::new().unwrap();
        f.git.fail_next_add();
        let err = f
            .controller
            .create_child("DEMO", "T1", base.path(), None, CallerRole::External)
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::ExternalFailure(_)));
        // No tmux session was ever created
        assert!(!f
            .tmux
            .has_session("parallel_DEMO_task_child_T1")
            .await
            .unwrap());
        assert!(f.registry.query_status("parallel_DEMO_task_child_T1").is_err());
    }

    #[tokio::test]
    async fn test_create_child_session_exists_rolls_back_worktree() {
        let f = fixture();
        let base = tempfile::TempDir::new().unwrap();
        // Simulate an externally created session with the child's name
        f.tmux.add_session("parallel_DEMO_task_child_T1", "/tmp");

        let err = f
            .controller
            .create_child("DEMO", "T1", base.path(), None, CallerRole::External)
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::Conflict(_)));

        // Worktree was rolled back
        let worktree = base.path().join("worktree").join("T1");
        assert!(!f.git.has_worktree(&worktree));
        assert!(f.registry.query_status("parallel_DEMO_task_child_T1").is_err());
    }

    #[tokio::test]
    async fn test_worktree_exists_rejected() {
        let f = fixture();
        let base = tempfile::TempDir::new().unwrap();
        std::fs::create_dir_all(base.path().join("worktree").join("T1")).unwrap();
        let err = f
            .controller
            .create_child("DEMO", "T1", base.path(), None, CallerRole::External)
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_terminate_child_cleans_up() {
        let f = fixture();
        let base = tempfile::TempDir::new().unwrap();
        f.controller
            .create_child("DEMO", "T1", base.path(), None, CallerRole::External)
            .await
            .unwrap();

        let summary = f
            .controller
            .terminate_session("parallel_DEMO_task_child_T1", CallerRole::Master)
            .await
            .unwrap();

        assert!(summary.registry_removed);
        assert!(summary.tmux_killed);
        assert!(summary.warnings.is_empty());
        assert!(!f
            .tmux
            .has_session("parallel_DEMO_task_child_T1")
            .await
            .unwrap());
        assert!(f.registry.query_status("parallel_DEMO_task_child_T1").is_err());
    }

    #[tokio::test]
    async fn test_terminate_master_cascades_registry_only() {
        let f = fixture();
        let base = tempfile::TempDir::new().unwrap();
        f.controller
            .create_master("DEMO", base.path(), CallerRole::External)
            .await
            .unwrap();
        f.controller
            .create_child("DEMO", "T1", base.path(), None, CallerRole::External)
            .await
            .unwrap();

        let summary = f
            .controller
            .terminate_session("parallel_DEMO_task_master", CallerRole::External)
            .await
            .unwrap();

        assert!(summary.tmux_killed);
        assert_eq!(
            summary.children_cascaded,
            vec!["parallel_DEMO_task_child_T1".to_string()]
        );
        // Child tmux session deliberately left running
        assert!(f
            .tmux
            .has_session("parallel_DEMO_task_child_T1")
            .await
            .unwrap());
        // But its registry record is gone
        assert!(f.registry.query_status("parallel_DEMO_task_child_T1").is_err());
    }

    #[tokio::test]
    async fn test_terminate_unknown_is_noop_success() {
        let f = fixture();
        let summary = f
            .controller
            .terminate_session("parallel_GHOST_task_master", CallerRole::External)
            .await
            .unwrap();
        assert!(!summary.registry_removed);
        assert!(!summary.tmux_killed);
        assert!(summary.children_cascaded.is_empty());
    }
}
