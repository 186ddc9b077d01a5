//! Safety-gated git operations.
//!
//! Generalizes `crate::worktree::WorktreeManager`'s worktree lifecycle with
//! the full surface a worker/orchestrator needs against a single repository:
//! status/diff/log reads, staging, commit, working-tree mutation, remote
//! push/fetch, merge, and branch management. Every write consults a
//! `BranchGuard` and, for destructive operations, an `AllowDestructive` flag,
//! recording the outcome through an optional `AuditLogger`.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::worktree::{WorktreeError, WorktreeInfo, WorktreeManager};

/// Errors from the GitOps capability.
#[derive(Debug, Error)]
pub enum GitOpsError {
    /// A write was attempted against a branch in the protected set.
    #[error("refusing to write to protected branch {branch}")]
    ErrProtectedBranch { branch: String },

    /// A write was attempted while on a branch the guard does not expect.
    #[error("current branch {found} does not match expected {expected}")]
    ErrUnexpectedBranch { expected: String, found: String },

    /// A destructive operation was attempted without `AllowDestructive`.
    #[error("destructive operation {operation} not allowed")]
    ErrDestructiveNotAllowed { operation: String },

    /// The underlying git command failed.
    #[error("git command failed: {0}")]
    GitCommand(#[from] WorktreeError),

    /// A git command exited non-zero outside the worktree-lifecycle paths.
    #[error("git {command} failed (exit {code}): {stderr}")]
    GitExit {
        command: String,
        code: i32,
        stderr: String,
    },

    #[error("failed to run git: {0}")]
    Io(#[from] std::io::Error),
}

/// Branch-matching policy consulted by every write operation.
#[derive(Debug, Clone, Default)]
pub struct BranchGuard {
    /// If set, the current branch must equal this value exactly.
    pub expected: Option<String>,
    /// If non-empty, the current branch must start with one of these prefixes.
    pub allowed_prefixes: Vec<String>,
    /// Remotes permitted for `push`/`fetch`. Empty means any remote.
    pub allowed_remotes: HashSet<String>,
    /// Branches that may never be written to, regardless of other checks.
    pub protected: HashSet<String>,
}

impl BranchGuard {
    /// A guard with the conventional default protected set `{main, master}`
    /// and no other constraints.
    pub fn default_protected() -> Self {
        Self {
            protected: ["main", "master"].iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    /// Restrict writes to an exact branch, keeping the default protected set.
    pub fn expecting(branch: impl Into<String>) -> Self {
        Self {
            expected: Some(branch.into()),
            ..Self::default_protected()
        }
    }

    fn check(&self, current_branch: &str) -> Result<(), GitOpsError> {
        if self.protected.contains(current_branch) {
            return Err(GitOpsError::ErrProtectedBranch {
                branch: current_branch.to_string(),
            });
        }
        if let Some(expected) = &self.expected {
            if expected != current_branch {
                return Err(GitOpsError::ErrUnexpectedBranch {
                    expected: expected.clone(),
                    found: current_branch.to_string(),
                });
            }
        }
        if !self.allowed_prefixes.is_empty()
            && !self
                .allowed_prefixes
                .iter()
                .any(|p| current_branch.starts_with(p.as_str()))
        {
            return Err(GitOpsError::ErrUnexpectedBranch {
                expected: self.allowed_prefixes.join("|"),
                found: current_branch.to_string(),
            });
        }
        Ok(())
    }

    fn check_remote(&self, remote: &str) -> Result<(), GitOpsError> {
        if !self.allowed_remotes.is_empty() && !self.allowed_remotes.contains(remote) {
            return Err(GitOpsError::ErrUnexpectedBranch {
                expected: format!("remote in {:?}", self.allowed_remotes),
                found: remote.to_string(),
            });
        }
        Ok(())
    }
}

/// One audited invocation of a `GitOps` method.
#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub operation: String,
    pub repo_path: PathBuf,
    pub branch: Option<String>,
    pub checks: Vec<String>,
    pub checks_passed: bool,
    pub failure_reason: Option<String>,
    pub duration: Duration,
}

/// Receives one `AuditEntry` per `GitOps` call.
pub trait AuditLogger: Send + Sync {
    fn record(&self, entry: AuditEntry);
}

/// An `AuditLogger` that discards everything. The default when none is configured.
#[derive(Debug, Default)]
pub struct NoopAuditLogger;

impl AuditLogger for NoopAuditLogger {
    fn record(&self, _entry: AuditEntry) {}
}

/// An `AuditLogger` that accumulates entries in memory, for tests and the CLI dashboard.
#[derive(Debug, Default)]
pub struct VecAuditLogger {
    entries: Mutex<Vec<AuditEntry>>,
}

impl AuditLogger for VecAuditLogger {
    fn record(&self, entry: AuditEntry) {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).push(entry);
    }
}

impl VecAuditLogger {
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

/// Options used to construct a `GitOps` instance.
pub struct GitOpsOptions {
    pub guard: BranchGuard,
    pub allow_destructive: bool,
    pub audit: Arc<dyn AuditLogger>,
}

impl Default for GitOpsOptions {
    fn default() -> Self {
        Self {
            guard: BranchGuard::default_protected(),
            allow_destructive: false,
            audit: Arc::new(NoopAuditLogger),
        }
    }
}

/// Safety-gated git operations scoped to a single repository path.
///
/// Worktree lifecycle (`create_worktree`/`remove_worktree`/`list_worktrees`/
/// `cleanup_stale`) delegates to an internal `WorktreeManager`; every other
/// operation runs `git` directly against `repo_path`, serialized through the
/// same lock the worktree manager uses so concurrent workers never race on
/// the repository's index.
pub struct GitOps {
    repo_path: PathBuf,
    worktrees: WorktreeManager,
    git_lock: Arc<Mutex<()>>,
    guard: BranchGuard,
    allow_destructive: bool,
    audit: Arc<dyn AuditLogger>,
}

impl GitOps {
    pub fn new(
        repo_path: impl Into<PathBuf>,
        worktree_base: Option<PathBuf>,
        options: GitOpsOptions,
    ) -> Result<Self, GitOpsError> {
        let repo_path = repo_path.into();
        let worktrees = WorktreeManager::new(&repo_path, worktree_base)?;
        Ok(Self {
            repo_path,
            worktrees,
            git_lock: Arc::new(Mutex::new(())),
            guard: options.guard,
            allow_destructive: options.allow_destructive,
            audit: options.audit,
        })
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    fn run(&self, args: &[&str]) -> Result<std::process::Output, GitOpsError> {
        Command::new("git")
            .args(args)
            .current_dir(&self.repo_path)
            .output()
            .map_err(GitOpsError::Io)
    }

    fn require_success(
        &self,
        command: &str,
        output: std::process::Output,
    ) -> Result<String, GitOpsError> {
        if !output.status.success() {
            return Err(GitOpsError::GitExit {
                command: command.to_string(),
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn audit_write(
        &self,
        operation: &str,
        branch: Option<String>,
        checks: Vec<String>,
        result: &Result<(), GitOpsError>,
        started: Instant,
    ) {
        self.audit.record(AuditEntry {
            operation: operation.to_string(),
            repo_path: self.repo_path.clone(),
            branch,
            checks,
            checks_passed: result.is_ok(),
            failure_reason: result.as_ref().err().map(|e| e.to_string()),
            duration: started.elapsed(),
        });
    }

    fn guard_write(&self, destructive: bool, operation: &str) -> Result<(), GitOpsError> {
        let started = Instant::now();
        let current = self.current_branch().unwrap_or_default();
        let mut checks = vec!["branch_guard".to_string()];

        let result = self.guard.check(&current).and_then(|()| {
            if destructive && !self.allow_destructive {
                Err(GitOpsError::ErrDestructiveNotAllowed {
                    operation: operation.to_string(),
                })
            } else {
                Ok(())
            }
        });

        if destructive {
            checks.push("allow_destructive".to_string());
        }

        self.audit_write(operation, Some(current), checks, &result, started);
        result
    }

    // -- read operations --------------------------------------------------

    pub fn status(&self) -> Result<String, GitOpsError> {
        let out = self.run(&["status", "--porcelain=v1"])?;
        self.require_success("status", out)
    }

    pub fn rev_parse(&self, rev: &str) -> Result<String, GitOpsError> {
        let out = self.run(&["rev-parse", rev])?;
        Ok(self.require_success("rev-parse", out)?.trim().to_string())
    }

    pub fn diff(&self, base: &str) -> Result<String, GitOpsError> {
        let out = self.run(&["diff", base])?;
        self.require_success("diff", out)
    }

    pub fn log(&self, rev_range: &str, max_count: usize) -> Result<String, GitOpsError> {
        let out = self.run(&[
            "log",
            "--oneline",
            &format!("-n{max_count}"),
            rev_range,
        ])?;
        self.require_success("log", out)
    }

    pub fn current_branch(&self) -> Result<String, GitOpsError> {
        let out = self.run(&["rev-parse", "--abbrev-ref", "HEAD"])?;
        Ok(self.require_success("current-branch", out)?.trim().to_string())
    }

    pub fn branch_exists(&self, branch: &str) -> Result<bool, GitOpsError> {
        Ok(self.worktrees.branch_exists(branch)?)
    }

    // -- staging ------------------------------------------------------------

    pub fn add(&self, pathspec: &[&str]) -> Result<(), GitOpsError> {
        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut args = vec!["add"];
        args.extend(pathspec);
        let out = self.run(&args)?;
        self.require_success("add", out)?;
        Ok(())
    }

    pub fn add_all(&self) -> Result<(), GitOpsError> {
        self.add(&["-A"])
    }

    pub fn reset(&self, pathspec: &[&str]) -> Result<(), GitOpsError> {
        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut args = vec!["reset"];
        args.extend(pathspec);
        let out = self.run(&args)?;
        self.require_success("reset", out)?;
        Ok(())
    }

    // -- commit ---------------------------------------------------------------

    pub fn commit(&self, message: &str) -> Result<(), GitOpsError> {
        self.guard_write(false, "commit")?;
        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());
        let out = self.run(&["commit", "-m", message])?;
        self.require_success("commit", out)?;
        Ok(())
    }

    // -- working-tree mutation (destructive) ---------------------------------

    pub fn checkout_files(&self, rev: &str, pathspec: &[&str]) -> Result<(), GitOpsError> {
        self.guard_write(true, "checkout_files")?;
        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut args = vec!["checkout", rev, "--"];
        args.extend(pathspec);
        let out = self.run(&args)?;
        self.require_success("checkout-files", out)?;
        Ok(())
    }

    pub fn clean(&self) -> Result<(), GitOpsError> {
        self.guard_write(true, "clean")?;
        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());
        let out = self.run(&["clean", "-fd"])?;
        self.require_success("clean", out)?;
        Ok(())
    }

    pub fn reset_hard(&self, rev: &str) -> Result<(), GitOpsError> {
        self.guard_write(true, "reset_hard")?;
        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());
        let out = self.run(&["reset", "--hard", rev])?;
        self.require_success("reset-hard", out)?;
        Ok(())
    }

    // -- remote ---------------------------------------------------------------

    pub fn fetch(&self, remote: &str) -> Result<(), GitOpsError> {
        self.guard.check_remote(remote)?;
        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());
        let out = self.run(&["fetch", remote])?;
        self.require_success("fetch", out)?;
        Ok(())
    }

    pub fn push(&self, remote: &str, branch: &str, force: bool) -> Result<(), GitOpsError> {
        self.guard.check_remote(remote)?;
        self.guard_write(force, "push")?;
        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut args = vec!["push"];
        if force {
            args.push("--force-with-lease");
        }
        args.push(remote);
        args.push(branch);
        let out = self.run(&args)?;
        self.require_success("push", out)?;
        Ok(())
    }

    // -- merge ----------------------------------------------------------------

    pub fn merge(&self, branch_name: &str) -> Result<crate::worktree::MergeResult, GitOpsError> {
        self.guard_write(false, "merge")?;
        Ok(self.worktrees.merge_branch(branch_name)?)
    }

    pub fn merge_abort(&self) -> Result<(), GitOpsError> {
        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());
        let out = self.run(&["merge", "--abort"])?;
        self.require_success("merge-abort", out)?;
        Ok(())
    }

    // -- branch management ----------------------------------------------------

    pub fn checkout_branch(&self, name: &str, create: bool) -> Result<(), GitOpsError> {
        self.guard_write(false, "checkout_branch")?;
        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());
        let out = if create {
            self.run(&["checkout", "-b", name])?
        } else {
            self.run(&["checkout", name])?
        };
        self.require_success("checkout-branch", out)?;
        Ok(())
    }

    // -- worktree lifecycle (delegates to WorktreeManager) ---------------------

    pub fn create_worktree(&self, branch_name: &str) -> Result<WorktreeInfo, GitOpsError> {
        Ok(self.worktrees.create_worktree(branch_name)?)
    }

    pub fn remove_worktree(&self, path: &Path) -> Result<(), GitOpsError> {
        Ok(self.worktrees.remove_worktree(path)?)
    }

    pub fn list_worktrees(&self) -> Result<Vec<WorktreeInfo>, GitOpsError> {
        Ok(self.worktrees.list_worktrees()?)
    }

    pub fn cleanup_stale(&self) -> Result<(), GitOpsError> {
        Ok(self.worktrees.cleanup_stale()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command as StdCommand;
    use tempfile::TempDir;

    fn create_temp_repo() -> (TempDir, PathBuf) {
        let dir = TempDir::new().expect("tempdir");
        let repo_path = dir.path().to_path_buf();
        StdCommand::new("git").args(["init"]).current_dir(&repo_path).output().unwrap();
        StdCommand::new("git")
            .args(["config", "user.email", "test@choo.dev"])
            .current_dir(&repo_path)
            .output()
            .unwrap();
        StdCommand::new("git")
            .args(["config", "user.name", "Choo Test"])
            .current_dir(&repo_path)
            .output()
            .unwrap();
        std::fs::write(repo_path.join("README.md"), "# test\n").unwrap();
        StdCommand::new("git").args(["add", "."]).current_dir(&repo_path).output().unwrap();
        StdCommand::new("git")
            .args(["commit", "-m", "init"])
            .current_dir(&repo_path)
            .output()
            .unwrap();
        (dir, repo_path)
    }

    #[test]
    fn branch_guard_default_protects_main_and_master() {
        let guard = BranchGuard::default_protected();
        assert!(matches!(
            guard.check("main"),
            Err(GitOpsError::ErrProtectedBranch { .. })
        ));
        assert!(matches!(
            guard.check("master"),
            Err(GitOpsError::ErrProtectedBranch { .. })
        ));
        assert!(guard.check("choo/feature-x").is_ok());
    }

    #[test]
    fn branch_guard_expecting_rejects_mismatch() {
        let guard = BranchGuard::expecting("choo/feature-x");
        assert!(guard.check("choo/feature-x").is_ok());
        assert!(matches!(
            guard.check("choo/other"),
            Err(GitOpsError::ErrUnexpectedBranch { .. })
        ));
    }

    #[test]
    fn commit_on_protected_branch_is_rejected() {
        let (_dir, repo_path) = create_temp_repo();
        let ops = GitOps::new(&repo_path, None, GitOpsOptions::default()).unwrap();
        std::fs::write(repo_path.join("a.txt"), "x").unwrap();
        ops.add_all().unwrap();
        let result = ops.commit("should fail");
        assert!(matches!(result, Err(GitOpsError::ErrProtectedBranch { .. })));
    }

    #[test]
    fn commit_on_feature_branch_succeeds() {
        let (_dir, repo_path) = create_temp_repo();
        let ops = GitOps::new(
            &repo_path,
            None,
            GitOpsOptions {
                guard: BranchGuard::default(),
                ..GitOpsOptions::default()
            },
        )
        .unwrap();
        ops.checkout_branch("choo/feature-x", true).unwrap();
        std::fs::write(repo_path.join("a.txt"), "x").unwrap();
        ops.add_all().unwrap();
        ops.commit("add a.txt").unwrap();
        let log = ops.log("HEAD", 1).unwrap();
        assert!(log.contains("add a.txt"));
    }

    #[test]
    fn destructive_op_without_allow_destructive_is_rejected() {
        let (_dir, repo_path) = create_temp_repo();
        let ops = GitOps::new(
            &repo_path,
            None,
            GitOpsOptions {
                guard: BranchGuard::default(),
                ..GitOpsOptions::default()
            },
        )
        .unwrap();
        ops.checkout_branch("choo/feature-x", true).unwrap();
        let result = ops.reset_hard("HEAD");
        assert!(matches!(
            result,
            Err(GitOpsError::ErrDestructiveNotAllowed { .. })
        ));
    }

    #[test]
    fn destructive_op_with_allow_destructive_succeeds() {
        let (_dir, repo_path) = create_temp_repo();
        let ops = GitOps::new(
            &repo_path,
            None,
            GitOpsOptions {
                guard: BranchGuard::default(),
                allow_destructive: true,
                audit: Arc::new(NoopAuditLogger),
            },
        )
        .unwrap();
        ops.checkout_branch("choo/feature-x", true).unwrap();
        assert!(ops.reset_hard("HEAD").is_ok());
    }

    #[test]
    fn audit_logger_records_checks_passed_and_failed() {
        let (_dir, repo_path) = create_temp_repo();
        let audit = Arc::new(VecAuditLogger::default());
        let ops = GitOps::new(
            &repo_path,
            None,
            GitOpsOptions {
                guard: BranchGuard::default_protected(),
                allow_destructive: false,
                audit: audit.clone(),
            },
        )
        .unwrap();
        let _ = ops.commit("nope");
        let entries = audit.entries();
        assert_eq!(entries.len(), 1);
        assert!(!entries[0].checks_passed);
        assert_eq!(entries[0].operation, "commit");
    }

    #[test]
    fn create_and_remove_worktree_delegates_to_worktree_manager() {
        let (_dir, repo_path) = create_temp_repo();
        let worktree_base = TempDir::new().unwrap();
        let ops = GitOps::new(
            &repo_path,
            Some(worktree_base.path().to_path_buf()),
            GitOpsOptions::default(),
        )
        .unwrap();
        let info = ops.create_worktree("choo/units/task-1").unwrap();
        assert!(info.path.exists());
        ops.remove_worktree(&info.path).unwrap();
        assert!(!info.path.exists());
    }
}
