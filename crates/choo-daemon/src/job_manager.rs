//! The job manager: owns the journal pool, per-job event buses, and every
//! orchestrator run the daemon is currently driving.
//!
//! Generalizes the oddjobs-style daemon lifecycle (one long-lived process,
//! a registry of in-flight work, cooperative cancellation on shutdown) to
//! choo's unit/task model: "jobs" are orchestrator runs rather than agent
//! sessions, and each one's event stream is persisted to the journal
//! *and* fanned out live through [`choo_core::bus::EventBus`], so
//! `WatchJob` can serve both a fresh subscriber (replay from the journal)
//! and one that's been connected since the run started (live only).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use futures::Stream;
use serde_json::Value;
use sqlx::SqlitePool;
use tokio::sync::{watch, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use choo_core::bus::{BusEvent, BusRegistry, EventBus};
use choo_core::container::{
    run_container_job, ContainerDispatchConfig, ContainerEvent, ContainerEventSink,
};
use choo_core::orchestrator::{run_orchestrator, OrchestratorConfig, OrchestratorResult};
use choo_core::provider::ProviderRegistry;
use choo_core::worker::{WorkerConfig, WorkerEventSink};
use choo_db::models::{Event as JournalEvent, EventType, RunStatus};
use choo_db::queries::{events, runs};

use crate::config::daemon_version;

/// Everything needed to start a job, independent of the generated proto
/// message so this module stays testable without a tonic runtime.
#[derive(Debug, Clone)]
pub struct StartJobRequest {
    pub repo_path: PathBuf,
    pub tasks_dir: PathBuf,
    pub feature_branch: String,
    pub target_branch: String,
    pub parallelism: u32,
    pub default_provider: Option<String>,
    pub force_task_provider: Option<String>,
    pub review_enabled: bool,
    pub container_mode: bool,
    pub only_unit: Option<String>,
}

#[derive(Debug, Clone)]
pub struct JobSummary {
    pub job_id: String,
    pub status: String,
    pub feature_branch: String,
}

#[derive(Debug, Clone)]
pub struct JobStatus {
    pub job_id: String,
    pub status: String,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct HealthStatus {
    pub healthy: bool,
    pub active_jobs: u32,
    pub version: String,
}

#[derive(Debug, thiserror::Error)]
pub enum JobManagerError {
    #[error("job {0} not found")]
    NotFound(String),

    #[error("a run is already active for branch {feature_branch} in {repo_path}")]
    AlreadyActive {
        feature_branch: String,
        repo_path: String,
    },

    #[error("invalid status filter: {0}")]
    InvalidStatusFilter(String),

    #[error(transparent)]
    Db(#[from] anyhow::Error),
}

/// Bookkeeping for one in-flight job. Dropping the manager's reference to
/// this (on completion) does not stop the spawned task -- it has already
/// run to completion by the time `done` fires.
struct JobHandle {
    cancel: CancellationToken,
    done: watch::Receiver<bool>,
}

/// Image used for container-mode jobs when the caller doesn't override it.
/// Mirrors the way `DbConfig`/`DaemonConfig` read an env var with a sane
/// fallback rather than requiring every caller to supply one.
fn default_container_image() -> String {
    std::env::var("CHOO_CONTAINER_IMAGE").unwrap_or_else(|_| "choo-runner:latest".to_string())
}

pub struct JobManager {
    pool: SqlitePool,
    buses: Arc<BusRegistry>,
    providers: Arc<ProviderRegistry>,
    jobs: RwLock<HashMap<String, JobHandle>>,
}

impl JobManager {
    pub fn new(pool: SqlitePool, providers: Arc<ProviderRegistry>) -> Self {
        Self {
            pool,
            buses: Arc::new(BusRegistry::new()),
            providers,
            jobs: RwLock::new(HashMap::new()),
        }
    }

    /// Register the run, then spawn its orchestrator (or container
    /// dispatch) as a detached background task. Returns as soon as the run
    /// row exists, before any unit has started.
    pub async fn start_job(&self, req: StartJobRequest) -> Result<String, JobManagerError> {
        let repo_path_str = req.repo_path.display().to_string();
        if runs::active_run_for_branch(&self.pool, &req.feature_branch, &repo_path_str)
            .await
            .map_err(JobManagerError::Db)?
            .is_some()
        {
            return Err(JobManagerError::AlreadyActive {
                feature_branch: req.feature_branch,
                repo_path: repo_path_str,
            });
        }

        let run = runs::insert_run(
            &self.pool,
            &req.feature_branch,
            &repo_path_str,
            &req.target_branch,
            &req.tasks_dir.display().to_string(),
            req.parallelism as i64,
            daemon_version(),
            None,
        )
        .await
        .map_err(JobManagerError::Db)?;

        let job_id = run.id.clone();
        let bus = self.buses.get_or_create(&job_id).await;
        let cancel = CancellationToken::new();
        let (done_tx, done_rx) = watch::channel(false);

        self.jobs.write().await.insert(
            job_id.clone(),
            JobHandle {
                cancel: cancel.clone(),
                done: done_rx,
            },
        );

        let pool = self.pool.clone();
        let buses = self.buses.clone();

        if req.container_mode {
            let sink = Arc::new(JournalContainerSink {
                pool: pool.clone(),
                bus,
                job_id: job_id.clone(),
            });
            let config = ContainerDispatchConfig {
                job_id: job_id.clone(),
                image: default_container_image(),
                clone_url: format!("file://{repo_path_str}"),
                env: container_env(&req),
                extra_flags: Vec::new(),
                working_dir: None,
            };
            tokio::spawn(async move {
                run_container_mode(pool, buses, job_id.clone(), config, sink, done_tx).await;
            });
        } else {
            let providers = self.providers.clone();
            let sink: Arc<dyn WorkerEventSink> = Arc::new(JournalSink {
                pool: pool.clone(),
                bus,
                job_id: job_id.clone(),
            });
            let config = OrchestratorConfig {
                tasks_dir: req.tasks_dir,
                repo_path: req.repo_path,
                target_branch: req.target_branch,
                parallelism: req.parallelism.max(1) as usize,
                only_unit: req.only_unit,
                dry_run: false,
                force_task_provider: req.force_task_provider,
                default_provider: req.default_provider,
                worker: WorkerConfig {
                    feature_branch: req.feature_branch,
                    ..WorkerConfig::default()
                },
                review_enabled: req.review_enabled,
            };
            tokio::spawn(async move {
                run_in_process(pool, job_id.clone(), config, providers, sink, cancel, done_tx).await;
            });
        }

        Ok(run.id)
    }

    /// Stream events for `job_id` starting at `from_sequence`: every
    /// persisted event at or after that sequence, then every live event
    /// published after the subscription began. Subscribing before the
    /// persisted-event query runs means nothing published in between is
    /// lost; `last_seq` dedups whatever overlap results.
    pub fn watch_job(
        &self,
        job_id: &str,
        from_sequence: i64,
    ) -> impl Stream<Item = BusEvent> + Send + 'static {
        let pool = self.pool.clone();
        let buses = self.buses.clone();
        let job_id = job_id.to_string();

        async_stream::stream! {
            let bus = buses.get_or_create(&job_id).await;
            let mut live_rx = bus.subscribe();
            let mut last_seq = from_sequence - 1;

            match events::list_events_from(&pool, &job_id, from_sequence).await {
                Ok(persisted) => {
                    for event in persisted {
                        if let Some(bus_event) = journal_event_to_bus_event(&event) {
                            last_seq = bus_event.sequence as i64;
                            yield bus_event;
                        }
                    }
                }
                Err(error) => {
                    warn!(job_id, %error, "failed to replay persisted events for watch_job");
                }
            }

            while let Some(event) = choo_core::bus::recv_lossy(&mut live_rx).await {
                if event.sequence as i64 > last_seq {
                    last_seq = event.sequence as i64;
                    yield event;
                }
            }
        }
    }

    /// Request cancellation of an in-flight job. Cancellation is
    /// cooperative: the orchestrator's drain loop lets in-flight units
    /// finish their current step before stopping (see
    /// `orchestrator::SHUTDOWN_DRAIN`). `force` is honored for
    /// container-mode jobs, where the container can simply be killed;
    /// in-process jobs have no harder stop than the cooperative one.
    pub async fn stop_job(&self, job_id: &str, force: bool) -> Result<(), JobManagerError> {
        let jobs = self.jobs.read().await;
        let handle = jobs
            .get(job_id)
            .ok_or_else(|| JobManagerError::NotFound(job_id.to_string()))?;
        handle.cancel.cancel();
        if force {
            let _ = tokio::process::Command::new("docker")
                .args(["kill", &format!("choo-{job_id}")])
                .output()
                .await;
        }
        Ok(())
    }

    pub async fn list_jobs(
        &self,
        status_filter: Option<&str>,
    ) -> Result<Vec<JobSummary>, JobManagerError> {
        let filter = status_filter
            .map(|s| s.parse::<RunStatus>())
            .transpose()
            .map_err(|e| JobManagerError::InvalidStatusFilter(e.to_string()))?;
        let runs = runs::list_runs(&self.pool, filter)
            .await
            .map_err(JobManagerError::Db)?;
        Ok(runs
            .into_iter()
            .map(|r| JobSummary {
                job_id: r.id,
                status: r.status.to_string(),
                feature_branch: r.feature_branch,
            })
            .collect())
    }

    pub async fn get_job_status(&self, job_id: &str) -> Result<JobStatus, JobManagerError> {
        let run = runs::get_run(&self.pool, job_id)
            .await
            .map_err(JobManagerError::Db)?
            .ok_or_else(|| JobManagerError::NotFound(job_id.to_string()))?;
        Ok(JobStatus {
            job_id: run.id,
            status: run.status.to_string(),
            error: run.error,
        })
    }

    pub async fn health(&self) -> HealthStatus {
        HealthStatus {
            healthy: true,
            active_jobs: self.jobs.read().await.len() as u32,
            version: daemon_version().to_string(),
        }
    }

    /// Cancel every in-flight job and, if `wait`, block until each one's
    /// `done` watch fires or `timeout` elapses -- whichever is first.
    pub async fn shutdown(&self, wait: bool, timeout: std::time::Duration) {
        let job_ids: Vec<String> = {
            let jobs = self.jobs.read().await;
            for handle in jobs.values() {
                handle.cancel.cancel();
            }
            jobs.keys().cloned().collect()
        };

        if !wait {
            return;
        }

        let deadline = tokio::time::Instant::now() + timeout;
        for job_id in job_ids {
            let mut done = {
                let jobs = self.jobs.read().await;
                match jobs.get(&job_id) {
                    Some(handle) => handle.done.clone(),
                    None => continue,
                }
            };
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let _ = tokio::time::timeout(remaining, done.wait_for(|done| *done)).await;
        }
    }
}

async fn run_in_process(
    pool: SqlitePool,
    job_id: String,
    config: OrchestratorConfig,
    providers: Arc<ProviderRegistry>,
    sink: Arc<dyn WorkerEventSink>,
    cancel: CancellationToken,
    done_tx: watch::Sender<bool>,
) {
    if let Err(error) = runs::mark_run_started(&pool, &job_id, Utc::now()).await {
        warn!(job_id, %error, "failed to mark run started");
    }

    let result = run_orchestrator(config, providers, sink, cancel).await;

    let (status, error) = match result {
        Ok(OrchestratorResult::Completed) | Ok(OrchestratorResult::DryRun { .. }) => {
            (RunStatus::Completed, None)
        }
        Ok(OrchestratorResult::Failed { failed_units }) => (
            RunStatus::Failed,
            Some(format!("failed units: {}", failed_units.join(", "))),
        ),
        Ok(OrchestratorResult::Interrupted) => (RunStatus::Cancelled, None),
        Err(error) => (RunStatus::Failed, Some(error.to_string())),
    };

    if let Err(error) = runs::finish_run(&pool, &job_id, status, Utc::now(), error.as_deref()).await
    {
        warn!(job_id, %error, "failed to record run completion");
    }
    info!(job_id, %status, "job finished");
    let _ = done_tx.send(true);
}

async fn run_container_mode(
    pool: SqlitePool,
    buses: Arc<BusRegistry>,
    job_id: String,
    config: ContainerDispatchConfig,
    sink: Arc<dyn ContainerEventSink>,
    done_tx: watch::Sender<bool>,
) {
    if let Err(error) = runs::mark_run_started(&pool, &job_id, Utc::now()).await {
        warn!(job_id, %error, "failed to mark run started");
    }

    let (status, error) = match run_container_job(&config, sink).await {
        Ok(_) => (RunStatus::Completed, None),
        Err(error) => (RunStatus::Failed, Some(error.to_string())),
    };

    if let Err(error) = runs::finish_run(&pool, &job_id, status, Utc::now(), error.as_deref()).await
    {
        warn!(job_id, %error, "failed to record run completion");
    }
    buses.remove(&job_id).await;
    info!(job_id, %status, "container job finished");
    let _ = done_tx.send(true);
}

fn container_env(req: &StartJobRequest) -> HashMap<String, String> {
    let mut env = HashMap::new();
    env.insert(
        "CHOO_TASKS_DIR".to_string(),
        req.tasks_dir.display().to_string(),
    );
    env.insert("CHOO_FEATURE_BRANCH".to_string(), req.feature_branch.clone());
    env.insert("CHOO_TARGET_BRANCH".to_string(), req.target_branch.clone());
    env.insert("CHOO_PARALLELISM".to_string(), req.parallelism.to_string());
    env.insert(
        "CHOO_REVIEW_ENABLED".to_string(),
        req.review_enabled.to_string(),
    );
    if let Some(provider) = &req.default_provider {
        env.insert("CHOO_PROVIDER".to_string(), provider.clone());
    }
    if let Some(unit) = &req.only_unit {
        env.insert("CHOO_ONLY_UNIT".to_string(), unit.clone());
    }
    env
}

/// Bridges a `WorkerEventSink` to the journal and the live event bus: every
/// in-process emission is published onto the bus immediately (so a live
/// `WatchJob` subscriber sees it with no extra latency) and persisted under
/// the same sequence number the bus just assigned.
struct JournalSink {
    pool: SqlitePool,
    bus: Arc<EventBus>,
    job_id: String,
}

impl WorkerEventSink for JournalSink {
    fn emit(&self, event_type: EventType, unit_id: &str, payload: Option<Value>) {
        let unit_id = if unit_id.is_empty() {
            None
        } else {
            Some(unit_id.to_string())
        };
        let bus_event = self
            .bus
            .publish(event_type, unit_id.clone(), None, payload.clone(), Utc::now());

        let pool = self.pool.clone();
        let job_id = self.job_id.clone();
        let payload_json = payload.map(|v| v.to_string());
        tokio::spawn(async move {
            if let Err(error) = events::append_event_with_sequence(
                &pool,
                &job_id,
                bus_event.sequence as i64,
                event_type,
                unit_id.as_deref(),
                payload_json.as_deref(),
                bus_event.timestamp,
            )
            .await
            {
                warn!(job_id, sequence = bus_event.sequence, %error, "failed to persist event");
            }
        });
    }
}

/// Same bridge as `JournalSink`, but for container-mode jobs whose events
/// arrive as re-parsed JSON lines rather than direct `emit` calls.
struct JournalContainerSink {
    pool: SqlitePool,
    bus: Arc<EventBus>,
    job_id: String,
}

impl ContainerEventSink for JournalContainerSink {
    fn emit(&self, event: ContainerEvent) {
        let Ok(event_type) = event.event_type.parse::<EventType>() else {
            warn!(job_id = %self.job_id, event_type = %event.event_type, "unknown event type from container, dropping");
            return;
        };
        let unit_id = event.unit.clone();
        let payload = event.payload.clone();
        let bus_event = self.bus.publish(
            event_type,
            unit_id.clone(),
            event.task.map(|t| t as u32),
            payload.clone(),
            event.timestamp,
        );

        let pool = self.pool.clone();
        let job_id = self.job_id.clone();
        let payload_json = payload.map(|v| v.to_string());
        tokio::spawn(async move {
            if let Err(error) = events::append_event_with_sequence(
                &pool,
                &job_id,
                bus_event.sequence as i64,
                event_type,
                unit_id.as_deref(),
                payload_json.as_deref(),
                bus_event.timestamp,
            )
            .await
            {
                warn!(job_id, sequence = bus_event.sequence, %error, "failed to persist container event");
            }
        });
    }
}

fn journal_event_to_bus_event(event: &JournalEvent) -> Option<BusEvent> {
    let event_type = event.parsed_event_type().ok()?;
    let payload = event
        .payload_json
        .as_deref()
        .and_then(|s| serde_json::from_str(s).ok());
    Some(BusEvent {
        sequence: event.sequence as u64,
        event_type,
        unit_id: event.unit_id.clone(),
        task: None,
        payload,
        timestamp: event.created_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use choo_db::config::DbConfig;
    use choo_db::pool::{create_pool, default_migrations_path, run_migrations};
    use choo_test_utils::{init_test_repo, write_unit};
    use tokio_stream::StreamExt;

    async fn memory_pool() -> SqlitePool {
        let config = DbConfig::new("sqlite::memory:");
        let pool = create_pool(&config).await.unwrap();
        run_migrations(&pool, default_migrations_path()).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn starting_the_same_branch_twice_is_rejected() {
        let pool = memory_pool().await;
        let manager = JobManager::new(pool, Arc::new(ProviderRegistry::with_builtins()));
        let repo = init_test_repo();
        let tasks = tempfile::tempdir().unwrap();

        let req = StartJobRequest {
            repo_path: repo.path().to_path_buf(),
            tasks_dir: tasks.path().to_path_buf(),
            feature_branch: "choo/dup".to_string(),
            target_branch: "main".to_string(),
            parallelism: 1,
            default_provider: None,
            force_task_provider: None,
            review_enabled: false,
            container_mode: false,
            only_unit: None,
        };
        manager.start_job(req.clone()).await.unwrap();
        let second = manager.start_job(req).await;
        assert!(matches!(second, Err(JobManagerError::AlreadyActive { .. })));
    }

    #[tokio::test]
    async fn unknown_job_status_lookup_fails() {
        let pool = memory_pool().await;
        let manager = JobManager::new(pool, Arc::new(ProviderRegistry::with_builtins()));
        let result = manager.get_job_status("nope").await;
        assert!(matches!(result, Err(JobManagerError::NotFound(_))));
    }

    #[tokio::test]
    async fn stopping_an_unknown_job_fails() {
        let pool = memory_pool().await;
        let manager = JobManager::new(pool, Arc::new(ProviderRegistry::with_builtins()));
        let result = manager.stop_job("nope", false).await;
        assert!(matches!(result, Err(JobManagerError::NotFound(_))));
    }

    #[tokio::test]
    async fn health_reports_zero_active_jobs_when_idle() {
        let pool = memory_pool().await;
        let manager = JobManager::new(pool, Arc::new(ProviderRegistry::with_builtins()));
        let health = manager.health().await;
        assert!(health.healthy);
        assert_eq!(health.active_jobs, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn watch_job_replays_persisted_events_from_the_given_sequence() {
        let pool = memory_pool().await;
        let run = runs::insert_run(&pool, "choo/watch", "/repo", "main", "tasks", 1, "0.1.0", None)
            .await
            .unwrap();
        for i in 0..3 {
            events::append_event(&pool, &run.id, EventType::TaskStarted, Some("a"), None)
                .await
                .unwrap();
            let _ = i;
        }

        let manager = JobManager::new(pool, Arc::new(ProviderRegistry::with_builtins()));
        let mut stream = Box::pin(manager.watch_job(&run.id, 2));
        let first = tokio::time::timeout(std::time::Duration::from_secs(2), stream.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.sequence, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn starting_a_job_drives_it_to_completion_and_journals_events() {
        let pool = memory_pool().await;
        let repo = init_test_repo();
        let tasks = tempfile::tempdir().unwrap();
        write_unit(
            tasks.path(),
            "a",
            "---\nunit: a\n---",
            &[(
                "01-first.md",
                "---\ntask: 1\nbackpressure: \"true\"\n---\n# Task 1\nbody\n",
            )],
        );

        let mut registry = ProviderRegistry::new();
        registry.register(NoopWritingProvider);
        let manager = JobManager::new(pool.clone(), Arc::new(registry));

        let job_id = manager
            .start_job(StartJobRequest {
                repo_path: repo.path().to_path_buf(),
                tasks_dir: tasks.path().to_path_buf(),
                feature_branch: "choo/integration".to_string(),
                target_branch: "main".to_string(),
                parallelism: 1,
                default_provider: None,
                force_task_provider: None,
                review_enabled: false,
                container_mode: false,
                only_unit: None,
            })
            .await
            .unwrap();

        for _ in 0..200 {
            let status = manager.get_job_status(&job_id).await.unwrap();
            if status.status == "completed" || status.status == "failed" {
                assert_eq!(status.status, "completed", "run failed: {:?}", status.error);
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(25)).await;
        }

        let latest = events::latest_sequence(&pool, &job_id).await.unwrap();
        assert!(latest > 0, "expected events to have been journaled");
    }

    struct NoopWritingProvider;

    #[async_trait::async_trait]
    impl choo_core::provider::Provider for NoopWritingProvider {
        fn name(&self) -> &str {
            "claude-code"
        }

        async fn invoke(
            &self,
            _prompt: &str,
            working_dir: &std::path::Path,
            _sink: Arc<dyn choo_core::provider::OutputSink>,
            _cancel: CancellationToken,
        ) -> Result<(), choo_core::provider::ProviderError> {
            std::fs::write(working_dir.join("change.txt"), "x").unwrap();
            Ok(())
        }
    }
}
