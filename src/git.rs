//! Git worktree adapter.
//!
//! Uses the git CLI directly (rather than libgit2) for worktree operations
//! to stay compatible with hooks, sparse-checkout, and other git features.
//! Only the worktree subcommands the coordinator needs are wrapped.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use crate::exec::{ExecError, ProcessExecutor};

/// Errors from git worktree operations
#[derive(Error, Debug)]
pub enum GitError {
    #[error("git is not installed or not in PATH")]
    NotInstalled,

    #[error("git {command} failed: {stderr}")]
    CommandFailed { command: String, stderr: String },

    #[error("git invocation failed: {0}")]
    ExecFailed(String),
}

impl From<ExecError> for GitError {
    fn from(err: ExecError) -> Self {
        match err {
            ExecError::NotFound(_) => GitError::NotInstalled,
            other => GitError::ExecFailed(other.to_string()),
        }
    }
}

/// Entry from `git worktree list --porcelain`
#[derive(Debug, Clone)]
pub struct WorktreeEntry {
    pub path: PathBuf,
    pub branch: Option<String>,
}

/// Trait over the git worktree operations the lifecycle controller needs
#[async_trait]
pub trait WorktreeCli: Send + Sync {
    /// `git worktree add -b <branch> <path>`, run inside `repo`
    async fn add(&self, repo: &Path, path: &Path, branch: &str) -> Result<(), GitError>;

    /// `git worktree remove --force <path>`, run inside `repo`
    async fn remove(&self, repo: &Path, path: &Path) -> Result<(), GitError>;

    /// `git worktree list --porcelain`, run inside `repo`
    async fn list(&self, repo: &Path) -> Result<Vec<WorktreeEntry>, GitError>;
}

/// Real implementation shelling out through the process executor
pub struct SystemGitCli {
    executor: ProcessExecutor,
}

impl SystemGitCli {
    pub fn new(executor: ProcessExecutor) -> Self {
        Self { executor }
    }

    async fn run_git(&self, args: &[&str], cwd: &Path) -> Result<String, GitError> {
        debug!(?args, ?cwd, "Running git command");
        let mut argv = vec!["git"];
        argv.extend_from_slice(args);
        let output = self.executor.run_in_dir(&argv, cwd, None).await?;
        if !output.success() {
            return Err(GitError::CommandFailed {
                command: args.join(" "),
                stderr: output.stderr.trim().to_string(),
            });
        }
        Ok(output.stdout)
    }
}

impl Default for SystemGitCli {
    fn default() -> Self {
        Self::new(ProcessExecutor::default())
    }
}

#[async_trait]
impl WorktreeCli for SystemGitCli {
    async fn add(&self, repo: &Path, path: &Path, branch: &str) -> Result<(), GitError> {
        let path_str = path.to_string_lossy();
        self.run_git(&["worktree", "add", "-b", branch, &path_str], repo)
            .await?;
        Ok(())
    }

    async fn remove(&self, repo: &Path, path: &Path) -> Result<(), GitError> {
        let path_str = path.to_string_lossy();
        self.run_git(&["worktree", "remove", "--force", &path_str], repo)
            .await?;
        Ok(())
    }

    async fn list(&self, repo: &Path) -> Result<Vec<WorktreeEntry>, GitError> {
        let output = self.run_git(&["worktree", "list", "--porcelain"], repo).await?;

        let mut entries = Vec::new();
        let mut current: Option<WorktreeEntry> = None;
        for line in output.lines() {
            if let Some(path) = line.strip_prefix("worktree ") {
                if let Some(entry) = current.take() {
                    entries.push(entry);
                }
                current = Some(WorktreeEntry {
                    path: PathBuf::from(path),
                    branch: None,
                });
            } else if let Some(branch) = line.strip_prefix("branch ") {
                if let Some(ref mut entry) = current {
                    entry.branch = Some(branch.to_string());
                }
            }
        }
        if let Some(entry) = current {
            entries.push(entry);
        }
        Ok(entries)
    }
}

/// Mock implementation for testing
#[derive(Default)]
pub struct MockGitCli {
    /// worktree path -> branch
    worktrees: Mutex<HashMap<PathBuf, String>>,
    /// Fail the next add call (for rollback tests)
    fail_next_add: Mutex<bool>,
    pub command_log: Mutex<Vec<String>>,
}

impl MockGitCli {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_add(&self) {
        *self.fail_next_add.lock().unwrap() = true;
    }

    pub fn has_worktree(&self, path: &Path) -> bool {
        self.worktrees.lock().unwrap().contains_key(path)
    }

    pub fn branch_of(&self, path: &Path) -> Option<String> {
        self.worktrees.lock().unwrap().get(path).cloned()
    }

    pub fn commands(&self) -> Vec<String> {
        self.command_log.lock().unwrap().clone()
    }
}

#[async_trait]
impl WorktreeCli for MockGitCli {
    async fn add(&self, _repo: &Path, path: &Path, branch: &str) -> Result<(), GitError> {
        self.command_log
            .lock()
            .unwrap()
            .push(format!("add {} {}", path.display(), branch));
        let mut fail = self.fail_next_add.lock().unwrap();
        if *fail {
            *fail = false;
            return Err(GitError::CommandFailed {
                command: "worktree add".to_string(),
                stderr: "injected failure".to_string(),
            });
        }
        self.worktrees
            .lock()
            .unwrap()
            .insert(path.to_path_buf(), branch.to_string());
        Ok(())
    }

    async fn remove(&self, _repo: &Path, path: &Path) -> Result<(), GitError> {
        self.command_log
            .lock()
            .unwrap()
            .push(format!("remove {}", path.display()));
        // --force tolerates absence; mirror that here
        self.worktrees.lock().unwrap().remove(path);
        Ok(())
    }

    async fn list(&self, _repo: &Path) -> Result<Vec<WorktreeEntry>, GitError> {
        self.command_log.lock().unwrap().push("list".to_string());
        Ok(self
            .worktrees
            .lock()
            .unwrap()
            .iter()
            .map(|(path, branch)| WorktreeEntry {
                path: path.clone(),
                branch: Some(branch.clone()),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_add_remove_list() {
        let git = MockGitCli::new();
        let repo = Path::new("/repo");
        let wt = Path::new("/repo/worktree/T1");

        git.add(repo, wt, "task/T1").await.unwrap();
        assert!(git.has_worktree(wt));
        assert_eq!(git.branch_of(wt).unwrap(), "task/T1");

        let listed = git.list(repo).await.unwrap();
        assert_eq!(listed.len(), 1);

        git.remove(repo, wt).await.unwrap();
        assert!(!git.has_worktree(wt));
        // Removing again is tolerated
        git.remove(repo, wt).await.unwrap();
    }

    #[tokio::test]
    async fn test_mock_injected_failure() {
        let git = MockGitCli::new();
        git.fail_next_add();
        let err = git
            .add(Path::new("/r"), Path::new("/r/w"), "b")
            .await
            .unwrap_err();
        assert!(matches!(err, GitError::CommandFailed { .. }));
        // Next add succeeds
        git.add(Path::new("/r"), Path::new("/r/w"), "b").await.unwrap();
    }
}
