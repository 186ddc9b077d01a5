//! The per-unit worker pipeline: isolation, task loop, advisory review,
//! merge, teardown.
//!
//! The Provider invocation is one-shot rather than event-streamed, the gate
//! is a plain shell backpressure command, and review is an advisory loop
//! rather than a human-escalation gate.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use thiserror::Error;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use choo_db::models::EventType;

use crate::discovery::DiscoveredUnit;
use crate::gitops::{BranchGuard, GitOps, GitOpsError, GitOpsOptions};
use crate::provider::{NullSink, OutputSink, Provider, Reviewer};

/// A setup/teardown command, optionally gated on a file's existence
/// relative to the worktree root (e.g. only `npm ci` when `package-lock.json`
/// is present).
#[derive(Debug, Clone)]
pub struct GuardedCommand {
    pub command: String,
    pub requires_file: Option<String>,
}

impl GuardedCommand {
    pub fn unconditional(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            requires_file: None,
        }
    }

    pub fn guarded(command: impl Into<String>, requires_file: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            requires_file: Some(requires_file.into()),
        }
    }

    fn should_run(&self, worktree: &Path) -> bool {
        match &self.requires_file {
            Some(rel) => worktree.join(rel).exists(),
            None => true,
        }
    }
}

/// Configuration shared across all units in a run.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worktree_base: Option<PathBuf>,
    pub setup_commands: Vec<GuardedCommand>,
    pub teardown_commands: Vec<GuardedCommand>,
    pub max_task_retries: u32,
    pub max_fix_iterations: u32,
    pub feature_branch: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worktree_base: None,
            setup_commands: Vec::new(),
            teardown_commands: Vec::new(),
            max_task_retries: 2,
            max_fix_iterations: 2,
            feature_branch: "choo/integration".to_string(),
        }
    }
}

/// Errors a worker can return. Every variant is per-unit: the caller maps
/// any of these to `unit.failed` and lets the scheduler's failure cascade
/// block dependents.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("isolation failed: {0}")]
    Isolation(#[from] GitOpsError),

    #[error("setup command failed: {command} ({stderr})")]
    SetupFailed { command: String, stderr: String },

    #[error("failed to run shell command: {command} ({source})")]
    ShellIo {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("task {task} provider invocation failed: {source}")]
    Provider {
        task: u32,
        #[source]
        source: crate::provider::ProviderError,
    },

    #[error("task {task} backpressure command failed after {attempts} attempt(s): {command}")]
    BackpressureFailed {
        task: u32,
        command: String,
        attempts: u32,
    },

    #[error("merge conflict merging unit branch into {feature_branch}: {details}")]
    MergeConflict {
        feature_branch: String,
        details: String,
    },

    #[error("teardown command failed: {command} ({stderr})")]
    TeardownFailed { command: String, stderr: String },
}

/// Receives events as the worker pipeline advances. Workers are oblivious
/// to scheduler semantics -- they emit `unit.completed` on success and
/// return an error on failure without emitting `unit.failed` themselves;
/// it's the orchestrator's event handler that emits `unit.failed` and
/// converts the outcome into a `Scheduler::complete`/`fail` call.
pub trait WorkerEventSink: Send + Sync {
    fn emit(&self, event_type: EventType, unit_id: &str, payload: Option<serde_json::Value>);
}

/// A `WorkerEventSink` that discards everything, for tests that only care
/// about the return value.
#[derive(Debug, Default)]
pub struct NullEventSink;

impl WorkerEventSink for NullEventSink {
    fn emit(&self, _event_type: EventType, _unit_id: &str, _payload: Option<serde_json::Value>) {}
}

/// Bridges a `WorkerEventSink` to `OutputSink` so provider stdout/stderr can
/// be folded into the event stream as `task.provider_invoke` payloads.
struct ProviderOutputBridge {
    sink: Arc<dyn WorkerEventSink>,
    unit_id: String,
}

impl OutputSink for ProviderOutputBridge {
    fn on_stdout_line(&self, line: &str) {
        self.sink.emit(
            EventType::TaskProviderInvoke,
            &self.unit_id,
            Some(serde_json::json!({"stream": "stdout", "line": line})),
        );
    }

    fn on_stderr_line(&self, line: &str) {
        self.sink.emit(
            EventType::TaskProviderInvoke,
            &self.unit_id,
            Some(serde_json::json!({"stream": "stderr", "line": line})),
        );
    }
}

fn unit_branch_name(unit_id: &str) -> String {
    format!("choo/units/{unit_id}")
}

async fn run_shell(working_dir: &Path, command: &str) -> Result<std::process::Output, std::io::Error> {
    Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(working_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
}

/// Run the full pipeline for one unit: isolation, task loop, advisory
/// review, merge, teardown.
pub async fn run_unit(
    repo_gitops: &GitOps,
    unit: &DiscoveredUnit,
    provider: Arc<dyn Provider>,
    reviewer: Option<Arc<dyn Reviewer>>,
    config: &WorkerConfig,
    sink: Arc<dyn WorkerEventSink>,
    merge_lock: Arc<tokio::sync::Mutex<()>>,
) -> Result<(), WorkerError> {
    let unit_id = unit.unit_id.clone();
    let branch = unit
        .orch_branch
        .clone()
        .unwrap_or_else(|| unit_branch_name(&unit_id));

    sink.emit(EventType::UnitStarted, &unit_id, None);

    // 1. Isolation.
    let worktree_info = repo_gitops.create_worktree(&branch)?;
    let worktree_path = worktree_info.path.clone();

    let worktree_ops = GitOps::new(
        &worktree_path,
        None,
        GitOpsOptions {
            guard: BranchGuard::default(),
            allow_destructive: true,
            audit: Arc::new(crate::gitops::NoopAuditLogger),
        },
    )?;

    for setup in &config.setup_commands {
        if !setup.should_run(&worktree_path) {
            continue;
        }
        let output = run_shell(&worktree_path, &setup.command)
            .await
            .map_err(|e| WorkerError::SetupFailed {
                command: setup.command.clone(),
                stderr: e.to_string(),
            })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            let _ = repo_gitops.remove_worktree(&worktree_path);
            return Err(WorkerError::SetupFailed {
                command: setup.command.clone(),
                stderr,
            });
        }
    }

    // 2. Task loop, in number order.
    let mut tasks = unit.tasks.clone();
    tasks.sort_by_key(|t| t.number);

    for task in &tasks {
        sink.emit(
            EventType::TaskStarted,
            &unit_id,
            Some(serde_json::json!({"task": task.number, "title": task.title})),
        );

        let prompt = format!(
            "{content}\n\nWhen you believe this task is complete, it will be verified by running:\n{backpressure}",
            content = task.content,
            backpressure = task.backpressure,
        );

        let invoke_result = provider
            .invoke(
                &prompt,
                &worktree_path,
                Arc::new(ProviderOutputBridge {
                    sink: sink.clone(),
                    unit_id: unit_id.clone(),
                }),
                CancellationToken::new(),
            )
            .await;

        if let Err(source) = invoke_result {
            sink.emit(
                EventType::TaskFailed,
                &unit_id,
                Some(serde_json::json!({"task": task.number, "error": source.to_string()})),
            );
            let _ = repo_gitops.remove_worktree(&worktree_path);
            return Err(WorkerError::Provider {
                task: task.number,
                source,
            });
        }

        let mut attempts = 0u32;
        let passed = loop {
            attempts += 1;
            let output = run_shell(&worktree_path, &task.backpressure)
                .await
                .map_err(|source| WorkerError::ShellIo {
                    command: task.backpressure.clone(),
                    source,
                })?;
            if output.status.success() {
                break true;
            }
            if attempts > config.max_task_retries {
                break false;
            }
            warn!(unit = %unit_id, task = task.number, attempt = attempts, "backpressure command failed, retrying");
        };

        if !passed {
            sink.emit(
                EventType::TaskFailed,
                &unit_id,
                Some(serde_json::json!({"task": task.number, "command": task.backpressure})),
            );
            let _ = repo_gitops.remove_worktree(&worktree_path);
            return Err(WorkerError::BackpressureFailed {
                task: task.number,
                command: task.backpressure.clone(),
                attempts,
            });
        }

        worktree_ops.add_all()?;
        let status = worktree_ops.status()?;
        if !status.trim().is_empty() {
            let message = format!("choo: {unit_id}/{number} {title}", number = task.number, title = task.title);
            worktree_ops.commit(&message)?;
            sink.emit(
                EventType::TaskCommitted,
                &unit_id,
                Some(serde_json::json!({"task": task.number, "message": message})),
            );
        }

        sink.emit(
            EventType::TaskCompleted,
            &unit_id,
            Some(serde_json::json!({"task": task.number})),
        );
    }

    // 3. Advisory review.
    if let Some(reviewer) = &reviewer {
        sink.emit(EventType::CodereviewStarted, &unit_id, None);
        run_review_fix_loop(&worktree_ops, reviewer.as_ref(), provider.as_ref(), config, &unit_id, &sink).await;
    }

    // 4. Merge into feature branch. Checkout-then-merge is a single critical
    // section: the feature branch is shared across every unit worker in this
    // run, so only the worker holding `merge_lock` may be on it at a time.
    let _merge_guard = merge_lock.lock().await;
    repo_gitops.checkout_branch(&config.feature_branch, false)?;
    let merge_result = repo_gitops.merge(&branch)?;
    match merge_result {
        crate::worktree::MergeResult::Success => {}
        crate::worktree::MergeResult::Conflict { details } => {
            let _ = repo_gitops.remove_worktree(&worktree_path);
            return Err(WorkerError::MergeConflict {
                feature_branch: config.feature_branch.clone(),
                details,
            });
        }
    }

    // 5. Teardown.
    for teardown in &config.teardown_commands {
        if !teardown.should_run(&worktree_path) {
            continue;
        }
        let output = run_shell(&worktree_path, &teardown.command)
            .await
            .map_err(|e| WorkerError::TeardownFailed {
                command: teardown.command.clone(),
                stderr: e.to_string(),
            })?;
        if !output.status.success() {
            warn!(
                unit = %unit_id,
                command = %teardown.command,
                "teardown command failed (non-fatal, unit already merged)"
            );
        }
    }
    repo_gitops.remove_worktree(&worktree_path)?;

    info!(unit = %unit_id, "unit pipeline completed");
    sink.emit(EventType::UnitCompleted, &unit_id, None);

    Ok(())
}

/// The review-fix loop never fails the unit or blocks the merge: on
/// exhaustion or any reviewer error, it simply returns and the caller
/// proceeds to merge.
async fn run_review_fix_loop(
    worktree_ops: &GitOps,
    reviewer: &dyn Reviewer,
    provider: &dyn Provider,
    config: &WorkerConfig,
    unit_id: &str,
    sink: &Arc<dyn WorkerEventSink>,
) {
    let review = match reviewer
        .review(worktree_ops.repo_path(), &config.feature_branch, CancellationToken::new())
        .await
    {
        Ok(review) => review,
        Err(e) => {
            warn!(unit = %unit_id, error = %e, "review skipped (advisory)");
            sink.emit(
                EventType::CodereviewFailed,
                unit_id,
                Some(serde_json::json!({"error": e.to_string()})),
            );
            return;
        }
    };

    if review.passed {
        sink.emit(
            EventType::CodereviewPassed,
            unit_id,
            Some(serde_json::json!({"summary": review.summary})),
        );
        return;
    }

    sink.emit(
        EventType::CodereviewIssuesFound,
        unit_id,
        Some(serde_json::json!({"issues": review.issues.len(), "summary": review.summary})),
    );

    for iteration in 0..config.max_fix_iterations {
        let fix_prompt = build_fix_prompt(&review);
        let sink_for_invoke = Arc::new(NullSink);
        if let Err(e) = provider
            .invoke(&fix_prompt, worktree_ops.repo_path(), sink_for_invoke, CancellationToken::new())
            .await
        {
            warn!(unit = %unit_id, iteration, error = %e, "review-fix provider invocation failed (advisory)");
            return;
        }

        let status = match worktree_ops.status() {
            Ok(s) => s,
            Err(e) => {
                warn!(unit = %unit_id, error = %e, "failed to check worktree status during review-fix (advisory)");
                return;
            }
        };

        if status.trim().is_empty() {
            let _ = worktree_ops.reset_hard("HEAD");
            let _ = worktree_ops.clean();
            continue;
        }

        if worktree_ops.add_all().is_ok() {
            if worktree_ops.commit("fix: address code review feedback").is_ok() {
                sink.emit(EventType::CodereviewFixApplied, unit_id, Some(serde_json::json!({"iteration": iteration})));
            }
        }
        return;
    }
}

fn build_fix_prompt(review: &crate::provider::ReviewResult) -> String {
    let mut prompt = String::from("Address the following code review feedback:\n\n");
    for issue in &review.issues {
        let location = match issue.line {
            Some(line) => format!("{}:{}", issue.file, line),
            None => issue.file.clone(),
        };
        prompt.push_str(&format!(
            "- [{severity:?}] {location}: {message}",
            severity = issue.severity,
            message = issue.message,
        ));
        if let Some(suggestion) = &issue.suggestion {
            prompt.push_str(&format!(" (suggestion: {suggestion})"));
        }
        prompt.push('\n');
    }
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guarded_command_runs_unconditionally_without_requires_file() {
        let cmd = GuardedCommand::unconditional("echo hi");
        assert!(cmd.should_run(Path::new("/tmp")));
    }

    #[test]
    fn guarded_command_skips_when_required_file_absent() {
        let tmp = tempfile::tempdir().unwrap();
        let cmd = GuardedCommand::guarded("npm ci", "package-lock.json");
        assert!(!cmd.should_run(tmp.path()));
    }

    #[test]
    fn guarded_command_runs_when_required_file_present() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("package-lock.json"), "{}").unwrap();
        let cmd = GuardedCommand::guarded("npm ci", "package-lock.json");
        assert!(cmd.should_run(tmp.path()));
    }

    #[test]
    fn build_fix_prompt_includes_file_and_line() {
        let review = crate::provider::ReviewResult {
            passed: false,
            summary: "issues found".to_string(),
            issues: vec![crate::provider::ReviewIssue {
                file: "src/lib.rs".to_string(),
                line: Some(10),
                severity: crate::provider::Severity::Error,
                message: "missing error handling".to_string(),
                suggestion: Some("use ?".to_string()),
            }],
            raw_output: String::new(),
        };
        let prompt = build_fix_prompt(&review);
        assert!(prompt.contains("src/lib.rs:10"));
        assert!(prompt.contains("missing error handling"));
        assert!(prompt.contains("use ?"));
    }
}
