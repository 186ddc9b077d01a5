//! The orchestrator main loop: discovers units, schedules the DAG, drives a
//! worker pool, and performs post-run integration (pre-merge review, spec
//! archival, push, PR).
//!
//! The scheduler itself gates concurrency (`dispatch()` reports
//! `at_capacity` rather than blocking on a semaphore), and a single mpsc
//! channel carries worker completions back to a handler that converts them
//! into `Scheduler::complete`/`fail` calls.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use choo_db::models::EventType;

use crate::discovery::{discover, DiscoveredUnit, DiscoveryError};
use crate::gitops::{BranchGuard, GitOps, GitOpsError, GitOpsOptions};
use crate::provider::{InvocationKind, ProviderReviewer, ProviderSelector, Reviewer};
use crate::scheduler::{DispatchOutcomeWithId, Scheduler, SchedulerError};
use crate::worker::{self, WorkerConfig, WorkerError, WorkerEventSink};

const DISPATCH_IDLE_POLL: Duration = Duration::from_millis(100);
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(30);

/// Configuration for one orchestrator run.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub tasks_dir: PathBuf,
    pub repo_path: PathBuf,
    pub target_branch: String,
    pub parallelism: usize,
    pub only_unit: Option<String>,
    pub dry_run: bool,
    pub force_task_provider: Option<String>,
    pub default_provider: Option<String>,
    pub worker: WorkerConfig,
    pub review_enabled: bool,
}

/// Errors that abort a run before any worker is spawned.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("discovery failed: {0:?}")]
    Discovery(Vec<DiscoveryError>),

    #[error("scheduling failed: {0}")]
    Scheduling(#[from] SchedulerError),

    #[error("git setup failed: {0}")]
    GitOps(#[from] GitOpsError),

    #[error("no unit matches the requested id")]
    UnitNotFound,
}

/// Terminal result of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrchestratorResult {
    Completed,
    Failed { failed_units: Vec<String> },
    Interrupted,
    DryRun { levels: Vec<Vec<String>> },
}

/// Message sent from a spawned worker task back to the main loop.
struct UnitDone {
    unit_id: String,
    result: Result<(), WorkerError>,
}

/// Classify a worker failure for logging/escalation purposes. Every branch
/// is advisory-adjacent except merge conflicts, which are always terminal
/// for the unit -- see §7 of the error handling design.
fn classify_and_log_failure(unit_id: &str, error: &WorkerError) {
    match error {
        WorkerError::MergeConflict { feature_branch, details } => {
            warn!(unit = unit_id, %feature_branch, %details, "escalation: merge conflict");
        }
        WorkerError::BackpressureFailed { task, command, attempts } => {
            warn!(unit = unit_id, task, %command, attempts, "escalation: baseline/backpressure failure");
        }
        WorkerError::Provider { task, source } => {
            warn!(unit = unit_id, task, %source, "escalation: provider failure");
        }
        other => {
            error!(unit = unit_id, error = %other, "unit failed");
        }
    }
}

fn provider_selector_for(config: &OrchestratorConfig, unit: &DiscoveredUnit) -> ProviderSelector {
    ProviderSelector {
        force_task_provider: config.force_task_provider.clone(),
        unit_frontmatter_override: unit.provider.clone(),
        cli_default_provider: config.default_provider.clone(),
        env_provider: None,
        config_file_provider: None,
    }
    .with_process_env()
}

/// Run the full orchestrator main loop described in §4.6: discover, schedule,
/// dispatch onto a worker pool until the DAG is complete or blocked, then
/// perform post-run integration.
pub async fn run_orchestrator(
    config: OrchestratorConfig,
    providers: Arc<crate::provider::ProviderRegistry>,
    sink: Arc<dyn WorkerEventSink>,
    cancel: CancellationToken,
) -> Result<OrchestratorResult, OrchestratorError> {
    let mut units = discover(&config.tasks_dir).map_err(OrchestratorError::Discovery)?;

    if let Some(only) = &config.only_unit {
        units.retain(|u| &u.unit_id == only);
        if units.is_empty() {
            return Err(OrchestratorError::UnitNotFound);
        }
    }

    let pairs: Vec<(String, Vec<String>)> = units
        .iter()
        .map(|u| (u.unit_id.clone(), u.depends_on.clone()))
        .collect();

    if config.dry_run {
        return Ok(OrchestratorResult::DryRun {
            levels: Scheduler::levels(&pairs),
        });
    }

    let scheduler = Arc::new(Scheduler::schedule(&pairs, config.parallelism.max(1))?);

    let units_by_id: HashMap<String, DiscoveredUnit> =
        units.into_iter().map(|u| (u.unit_id.clone(), u)).collect();

    // Checking out the feature branch is itself a write while the repo may
    // still be sitting on `main`/`master`, which the default guard refuses.
    // Use an unguarded bootstrap instance for that one step, then switch to
    // the guarded instance -- by the time it runs, current branch is the
    // feature branch, which is never in the protected set.
    let bootstrap = GitOps::new(
        &config.repo_path,
        None,
        GitOpsOptions {
            guard: BranchGuard::default(),
            allow_destructive: true,
            audit: Arc::new(crate::gitops::NoopAuditLogger),
        },
    )?;
    if bootstrap
        .checkout_branch(&config.worker.feature_branch, true)
        .is_err()
    {
        bootstrap.checkout_branch(&config.worker.feature_branch, false)?;
    }

    let repo_gitops = Arc::new(GitOps::new(
        &config.repo_path,
        None,
        GitOpsOptions {
            guard: BranchGuard::default_protected(),
            allow_destructive: false,
            audit: Arc::new(crate::gitops::NoopAuditLogger),
        },
    )?);

    sink.emit(EventType::OrchStarted, "", None);

    let (done_tx, mut done_rx) = mpsc::channel::<UnitDone>(config.parallelism.max(1) * 2);
    let mut failed_units: Vec<String> = Vec::new();
    // Serializes the feature-branch checkout+merge step across every unit
    // worker spawned in this run; see worker::run_unit.
    let merge_lock = Arc::new(tokio::sync::Mutex::new(()));

    let result = 'main: loop {
        if cancel.is_cancelled() {
            info!("cancellation received, draining in-flight units");
            let deadline = tokio::time::sleep(SHUTDOWN_DRAIN);
            tokio::pin!(deadline);
            loop {
                if scheduler.active_count() == 0 {
                    break;
                }
                tokio::select! {
                    Some(done) = done_rx.recv() => {
                        handle_unit_done(&scheduler, &sink, &mut failed_units, done);
                    }
                    _ = &mut deadline => break,
                    else => break,
                }
            }
            break 'main OrchestratorResult::Interrupted;
        }

        while let Ok(done) = done_rx.try_recv() {
            handle_unit_done(&scheduler, &sink, &mut failed_units, done);
        }

        match scheduler.dispatch() {
            DispatchOutcomeWithId::Unit(unit_id) => {
                let Some(unit) = units_by_id.get(&unit_id) else {
                    warn!(unit = %unit_id, "dispatched unit missing from discovery set");
                    let blocked = scheduler.fail(&unit_id);
                    for b in blocked {
                        sink.emit(EventType::UnitBlocked, &b, None);
                    }
                    continue;
                };

                let selector = provider_selector_for(&config, unit);
                let provider_name = selector.resolve(InvocationKind::TaskExecution).to_string();
                let Some(provider) = providers.get_arc(&provider_name) else {
                    warn!(unit = %unit_id, provider = %provider_name, "unknown provider, failing unit");
                    sink.emit(
                        EventType::UnitFailed,
                        &unit_id,
                        Some(serde_json::json!({"error": format!("unknown provider: {provider_name}")})),
                    );
                    let blocked = scheduler.fail(&unit_id);
                    for b in blocked {
                        sink.emit(EventType::UnitBlocked, &b, None);
                    }
                    continue;
                };

                let reviewer: Option<Arc<dyn Reviewer>> = if config.review_enabled {
                    Some(Arc::new(ProviderReviewer::new(provider.clone())))
                } else {
                    None
                };

                let repo_gitops = repo_gitops.clone();
                let worker_config = config.worker.clone();
                let unit = unit.clone();
                let sink_for_worker = sink.clone();
                let done_tx = done_tx.clone();
                let merge_lock = merge_lock.clone();

                tokio::spawn(async move {
                    let result = worker::run_unit(
                        &repo_gitops,
                        &unit,
                        provider,
                        reviewer,
                        &worker_config,
                        sink_for_worker,
                        merge_lock,
                    )
                    .await;
                    let _ = done_tx
                        .send(UnitDone {
                            unit_id: unit.unit_id.clone(),
                            result,
                        })
                        .await;
                });
            }
            DispatchOutcomeWithId::AllComplete => {
                sink.emit(EventType::OrchCompleted, "", None);
                break 'main OrchestratorResult::Completed;
            }
            DispatchOutcomeWithId::AllBlocked => {
                sink.emit(
                    EventType::OrchFailed,
                    "",
                    Some(serde_json::json!({"failed_units": failed_units})),
                );
                break 'main OrchestratorResult::Failed {
                    failed_units: failed_units.clone(),
                };
            }
            DispatchOutcomeWithId::AtCapacity | DispatchOutcomeWithId::NoReadyUnits => {
                tokio::select! {
                    Some(done) = done_rx.recv() => {
                        handle_unit_done(&scheduler, &sink, &mut failed_units, done);
                    }
                    _ = tokio::time::sleep(DISPATCH_IDLE_POLL) => {}
                    _ = cancel.cancelled() => {}
                }
            }
        }
    };

    if matches!(result, OrchestratorResult::Completed) {
        run_post_integration(&config, &repo_gitops, &providers).await;
    }

    Ok(result)
}

fn handle_unit_done(
    scheduler: &Scheduler,
    sink: &Arc<dyn WorkerEventSink>,
    failed_units: &mut Vec<String>,
    done: UnitDone,
) {
    match done.result {
        Ok(()) => {
            let newly_ready = scheduler.complete(&done.unit_id);
            for id in newly_ready {
                sink.emit(EventType::UnitQueued, &id, None);
            }
        }
        Err(error) => {
            classify_and_log_failure(&done.unit_id, &error);
            sink.emit(
                EventType::UnitFailed,
                &done.unit_id,
                Some(serde_json::json!({"error": error.to_string()})),
            );
            failed_units.push(done.unit_id.clone());
            let blocked = scheduler.fail(&done.unit_id);
            for id in blocked {
                sink.emit(EventType::UnitBlocked, &id, None);
            }
        }
    }
}

/// §4.6 step 7: pre-merge review against the target branch, archive
/// completed specs, commit, push, open a PR. Best-effort -- a failure here
/// is logged but does not flip a completed run back to failed.
async fn run_post_integration(
    config: &OrchestratorConfig,
    repo_gitops: &GitOps,
    providers: &crate::provider::ProviderRegistry,
) {
    if config.review_enabled {
        let provider_name = config
            .default_provider
            .clone()
            .unwrap_or_else(|| crate::provider::BUILTIN_DEFAULT_PROVIDER.to_string());
        if let Some(provider) = providers.get_arc(&provider_name) {
            let reviewer = ProviderReviewer::new(provider);
            match reviewer
                .review(repo_gitops.repo_path(), &config.target_branch, CancellationToken::new())
                .await
            {
                Ok(review) => {
                    info!(passed = review.passed, "pre-merge review against target branch complete");
                }
                Err(error) => {
                    warn!(%error, "pre-merge review skipped (advisory)");
                }
            }
        }
    }

    if let Err(error) = archive_completed_specs(&config.tasks_dir) {
        warn!(%error, "failed to archive completed specs");
        return;
    }

    if let Err(error) = repo_gitops.add_all() {
        warn!(%error, "failed to stage archived specs");
        return;
    }
    match repo_gitops.status() {
        Ok(status) if !status.trim().is_empty() => {
            if let Err(error) = repo_gitops.commit("chore: archive completed specs") {
                warn!(%error, "failed to commit archived specs");
            }
        }
        Ok(_) => {}
        Err(error) => warn!(%error, "failed to read status before archive commit"),
    }

    if let Err(error) = repo_gitops.push("origin", &config.worker.feature_branch, false) {
        warn!(%error, "failed to push feature branch");
        return;
    }

    match open_pull_request(
        repo_gitops.repo_path(),
        &config.worker.feature_branch,
        &config.target_branch,
    )
    .await
    {
        Ok(Some(number)) => info!(pr = number, "opened pull request"),
        Ok(None) => warn!("pull request opened but number could not be parsed"),
        Err(error) => warn!(%error, "failed to open pull request"),
    }
}

/// Move every unit directory under `tasks_dir` whose tasks are all complete
/// into a `completed/` sibling directory. Tolerates a directory that
/// already exists at the destination by skipping the move.
fn archive_completed_specs(tasks_dir: &Path) -> std::io::Result<()> {
    let completed_dir = tasks_dir.parent().unwrap_or(tasks_dir).join("completed");

    let units = match discover(tasks_dir) {
        Ok(units) => units,
        Err(_) => return Ok(()),
    };

    for unit in units {
        let all_complete =
            !unit.tasks.is_empty() && unit.tasks.iter().all(|t| t.status == "complete");
        if !all_complete {
            continue;
        }
        if !completed_dir.exists() {
            std::fs::create_dir_all(&completed_dir)?;
        }
        let dest = completed_dir.join(&unit.unit_id);
        if dest.exists() {
            continue;
        }
        std::fs::rename(&unit.path, &dest)?;
    }
    Ok(())
}

async fn open_pull_request(
    repo_path: &Path,
    feature_branch: &str,
    target_branch: &str,
) -> Result<Option<i64>, std::io::Error> {
    let output = Command::new("gh")
        .args([
            "pr",
            "create",
            "--base",
            target_branch,
            "--head",
            feature_branch,
            "--title",
            &format!("choo: {feature_branch}"),
            "--body",
            "Automated run via choo.",
            "--json",
            "number",
            "-q",
            ".number",
        ])
        .current_dir(repo_path)
        .stdin(Stdio::null())
        .output()
        .await?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        return Err(std::io::Error::other(stderr));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(stdout.trim().parse::<i64>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(id: &str, deps: Vec<&str>) -> DiscoveredUnit {
        DiscoveredUnit {
            unit_id: id.to_string(),
            path: PathBuf::from(format!("/tmp/{id}")),
            depends_on: deps.into_iter().map(String::from).collect(),
            provider: None,
            orch_status: None,
            orch_branch: None,
            orch_worktree: None,
            orch_pr_number: None,
            orch_started_at: None,
            orch_completed_at: None,
            tasks: vec![],
        }
    }

    #[test]
    fn provider_selector_prefers_unit_override_over_cli_default() {
        let config = OrchestratorConfig {
            tasks_dir: PathBuf::from("/tmp"),
            repo_path: PathBuf::from("/tmp"),
            target_branch: "main".to_string(),
            parallelism: 1,
            only_unit: None,
            dry_run: false,
            force_task_provider: None,
            default_provider: Some("claude-code".to_string()),
            worker: WorkerConfig::default(),
            review_enabled: false,
        };
        let mut u = unit("u1", vec![]);
        u.provider = Some("codex".to_string());
        let selector = provider_selector_for(&config, &u);
        assert_eq!(selector.resolve(InvocationKind::TaskExecution), "codex");
    }

    #[test]
    fn dry_run_levels_group_by_dependency_depth() {
        let pairs = vec![
            ("a".to_string(), vec![]),
            ("b".to_string(), vec!["a".to_string()]),
        ];
        let levels = Scheduler::levels(&pairs);
        assert_eq!(levels, vec![vec!["a".to_string()], vec!["b".to_string()]]);
    }

    #[test]
    fn handle_unit_done_success_cascades_ready_units() {
        let units = [
            ("a".to_string(), vec![]),
            ("b".to_string(), vec!["a".to_string()]),
        ];
        let scheduler = Scheduler::schedule(&units, 2).unwrap();
        assert!(matches!(scheduler.dispatch(), DispatchOutcomeWithId::Unit(ref id) if id == "a"));

        let sink: Arc<dyn WorkerEventSink> = Arc::new(worker::NullEventSink);
        let mut failed = Vec::new();
        handle_unit_done(
            &scheduler,
            &sink,
            &mut failed,
            UnitDone { unit_id: "a".to_string(), result: Ok(()) },
        );
        assert_eq!(
            scheduler.get_state("b"),
            Some(choo_db::models::UnitStatus::Ready)
        );
        assert!(failed.is_empty());
    }

    #[test]
    fn handle_unit_done_failure_blocks_dependents() {
        let units = [
            ("a".to_string(), vec![]),
            ("b".to_string(), vec!["a".to_string()]),
        ];
        let scheduler = Scheduler::schedule(&units, 2).unwrap();
        scheduler.dispatch();

        let sink: Arc<dyn WorkerEventSink> = Arc::new(worker::NullEventSink);
        let mut failed = Vec::new();
        handle_unit_done(
            &scheduler,
            &sink,
            &mut failed,
            UnitDone {
                unit_id: "a".to_string(),
                result: Err(WorkerError::TeardownFailed {
                    command: "x".to_string(),
                    stderr: "boom".to_string(),
                }),
            },
        );
        assert_eq!(failed, vec!["a".to_string()]);
        assert_eq!(
            scheduler.get_state("b"),
            Some(choo_db::models::UnitStatus::Blocked)
        );
    }
}
