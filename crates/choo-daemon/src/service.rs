//! Thin tonic service: converts between wire messages and
//! [`crate::job_manager`]'s plain Rust types. No orchestration logic lives
//! here -- it all belongs to `JobManager`.

use std::path::PathBuf;
use std::pin::Pin;
use std::time::Duration;

use futures::{Stream, StreamExt};
use tonic::{Request, Response, Status};

use crate::job_manager::{JobManager, JobManagerError, StartJobRequest as ManagerStartJobRequest};
use crate::proto::choo_daemon_server::ChooDaemon;
use crate::proto::{
    Event as ProtoEvent, GetJobStatusRequest, HealthRequest, HealthResponse, JobStatus,
    ListJobsRequest, ListJobsResponse, JobSummary as ProtoJobSummary, ShutdownRequest,
    ShutdownResponse, StartJobRequest, StartJobResponse, StopJobRequest, StopJobResponse,
    WatchJobRequest,
};

pub struct ChooDaemonService {
    jobs: std::sync::Arc<JobManager>,
}

impl ChooDaemonService {
    pub fn new(jobs: std::sync::Arc<JobManager>) -> Self {
        Self { jobs }
    }
}

impl From<JobManagerError> for Status {
    fn from(error: JobManagerError) -> Self {
        match error {
            JobManagerError::NotFound(id) => Status::not_found(format!("job {id} not found")),
            JobManagerError::AlreadyActive { .. } => {
                Status::already_exists(error.to_string())
            }
            JobManagerError::InvalidStatusFilter(_) => Status::invalid_argument(error.to_string()),
            JobManagerError::Db(_) => Status::internal(error.to_string()),
        }
    }
}

#[tonic::async_trait]
impl ChooDaemon for ChooDaemonService {
    async fn start_job(
        &self,
        request: Request<StartJobRequest>,
    ) -> Result<Response<StartJobResponse>, Status> {
        let req = request.into_inner();
        let job_id = self
            .jobs
            .start_job(ManagerStartJobRequest {
                repo_path: PathBuf::from(req.repo_path),
                tasks_dir: PathBuf::from(req.tasks_dir),
                feature_branch: req.feature_branch,
                target_branch: req.target_branch,
                parallelism: req.parallelism,
                default_provider: req.default_provider,
                force_task_provider: req.force_task_provider,
                review_enabled: req.review_enabled,
                container_mode: req.container_mode,
                only_unit: req.only_unit,
            })
            .await?;
        Ok(Response::new(StartJobResponse { job_id }))
    }

    type WatchJobStream = Pin<Box<dyn Stream<Item = Result<ProtoEvent, Status>> + Send + 'static>>;

    async fn watch_job(
        &self,
        request: Request<WatchJobRequest>,
    ) -> Result<Response<Self::WatchJobStream>, Status> {
        let req = request.into_inner();
        let inner = self.jobs.watch_job(&req.job_id, req.from_sequence);
        let mapped = inner.map(|event| {
            Ok(ProtoEvent {
                sequence: event.sequence as i64,
                event_type: event.event_type.to_string(),
                unit_id: event.unit_id,
                task: event.task.map(|t| t as i64),
                payload_json: event.payload.map(|v| v.to_string()),
                error: None,
                timestamp: event.timestamp.to_rfc3339(),
            })
        });
        Ok(Response::new(Box::pin(mapped)))
    }

    async fn stop_job(
        &self,
        request: Request<StopJobRequest>,
    ) -> Result<Response<StopJobResponse>, Status> {
        let req = request.into_inner();
        self.jobs.stop_job(&req.job_id, req.force).await?;
        Ok(Response::new(StopJobResponse {}))
    }

    async fn list_jobs(
        &self,
        request: Request<ListJobsRequest>,
    ) -> Result<Response<ListJobsResponse>, Status> {
        let req = request.into_inner();
        let jobs = self
            .jobs
            .list_jobs(req.status_filter.as_deref())
            .await?
            .into_iter()
            .map(|j| ProtoJobSummary {
                job_id: j.job_id,
                status: j.status,
                feature_branch: j.feature_branch,
            })
            .collect();
        Ok(Response::new(ListJobsResponse { jobs }))
    }

    async fn get_job_status(
        &self,
        request: Request<GetJobStatusRequest>,
    ) -> Result<Response<JobStatus>, Status> {
        let req = request.into_inner();
        let status = self.jobs.get_job_status(&req.job_id).await?;
        Ok(Response::new(JobStatus {
            job_id: status.job_id,
            status: status.status,
            error: status.error,
        }))
    }

    async fn health(
        &self,
        _request: Request<HealthRequest>,
    ) -> Result<Response<HealthResponse>, Status> {
        let health = self.jobs.health().await;
        Ok(Response::new(HealthResponse {
            healthy: health.healthy,
            active_jobs: health.active_jobs,
            version: health.version,
        }))
    }

    async fn shutdown(
        &self,
        request: Request<ShutdownRequest>,
    ) -> Result<Response<ShutdownResponse>, Status> {
        let req = request.into_inner();
        self.jobs
            .shutdown(req.wait, Duration::from_secs(req.timeout_seconds as u64))
            .await;
        Ok(Response::new(ShutdownResponse {}))
    }
}
