//! TUI application state and data model.

use std::time::Duration;

use anyhow::Result;
use tonic::transport::Channel;

use choo_daemon::proto::choo_daemon_client::ChooDaemonClient;
use choo_daemon::proto::{
    Event, GetJobStatusRequest, JobSummary, ListJobsRequest, StopJobRequest, WatchJobRequest,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum View {
    JobList,
    JobDetail(String),
}

pub struct App {
    pub client: ChooDaemonClient<Channel>,
    pub current_view: View,
    pub jobs: Vec<JobSummary>,
    pub selected_job: usize,
    pub events: Vec<Event>,
    pub tick_rate: Duration,
    pub should_quit: bool,
    pub status_message: Option<String>,
}

impl App {
    pub fn new(client: ChooDaemonClient<Channel>) -> Self {
        Self {
            client,
            current_view: View::JobList,
            jobs: Vec::new(),
            selected_job: 0,
            events: Vec::new(),
            tick_rate: Duration::from_secs(1),
            should_quit: false,
            status_message: None,
        }
    }

    pub async fn refresh(&mut self) -> Result<()> {
        match self.current_view.clone() {
            View::JobList => {
                let response = self
                    .client
                    .list_jobs(ListJobsRequest { status_filter: None })
                    .await?;
                self.jobs = response.into_inner().jobs;
                if self.selected_job >= self.jobs.len() && !self.jobs.is_empty() {
                    self.selected_job = self.jobs.len() - 1;
                }
            }
            View::JobDetail(job_id) => {
                // A snapshot read, not a live subscription: each tick re-pulls
                // from sequence 0 since the dashboard favors simplicity over
                // a persistent stream per view.
                let status = self
                    .client
                    .get_job_status(GetJobStatusRequest { job_id: job_id.clone() })
                    .await?
                    .into_inner();
                if status.error.is_some() {
                    self.status_message = status.error;
                }
                let mut stream = self
                    .client
                    .watch_job(WatchJobRequest {
                        job_id,
                        from_sequence: 0,
                    })
                    .await?
                    .into_inner();
                let mut events = Vec::new();
                // Drain whatever is immediately available; WatchJob never
                // closes on its own for a live job, so this is bounded by a
                // short collection window rather than stream completion.
                let deadline = tokio::time::Instant::now() + Duration::from_millis(200);
                loop {
                    let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
                    if remaining.is_zero() {
                        break;
                    }
                    match tokio::time::timeout(remaining, stream.message()).await {
                        Ok(Ok(Some(event))) => events.push(event),
                        _ => break,
                    }
                }
                self.events = events;
            }
        }
        Ok(())
    }

    pub fn move_down(&mut self) {
        match &self.current_view {
            View::JobList if !self.jobs.is_empty() => {
                self.selected_job = (self.selected_job + 1).min(self.jobs.len() - 1);
            }
            _ => {}
        }
    }

    pub fn move_up(&mut self) {
        self.selected_job = self.selected_job.saturating_sub(1);
    }

    pub fn navigate_enter(&mut self) {
        if let View::JobList = self.current_view {
            if let Some(job) = self.jobs.get(self.selected_job) {
                self.current_view = View::JobDetail(job.job_id.clone());
            }
        }
    }

    pub fn navigate_back(&mut self) {
        match self.current_view {
            View::JobDetail(_) => self.current_view = View::JobList,
            View::JobList => self.should_quit = true,
        }
    }

    pub async fn stop_selected(&mut self, force: bool) -> Result<()> {
        let job_id = match &self.current_view {
            View::JobList => self.jobs.get(self.selected_job).map(|j| j.job_id.clone()),
            View::JobDetail(id) => Some(id.clone()),
        };
        if let Some(job_id) = job_id {
            self.client.stop_job(StopJobRequest { job_id, force }).await?;
            self.status_message = Some("stop requested".to_string());
        }
        Ok(())
    }
}
