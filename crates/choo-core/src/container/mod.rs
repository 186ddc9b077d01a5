//! Container-mode job dispatch: runs an orchestrator run inside a Docker
//! container instead of in-process, and bridges its stdout JSON-line event
//! stream back onto the host's event sink. The container's entire stdout is
//! the event stream, line-delimited, each line a JSON object from the
//! closed `EventType` vocabulary.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::warn;

/// Line-delimited JSON events longer than this are logged and skipped
/// rather than parsed, per the wire format's line cap.
const MAX_LINE_BYTES: usize = 64 * 1024;

/// Last N lines of container logs captured when a job exits non-zero.
const ERROR_LOG_TAIL: &str = "100";

#[derive(Debug, Clone)]
pub struct ContainerDispatchConfig {
    pub job_id: String,
    pub image: String,
    pub clone_url: String,
    /// Credentials and run configuration passed through environment
    /// variables -- never mounted files.
    pub env: HashMap<String, String>,
    pub extra_flags: Vec<String>,
    pub working_dir: Option<PathBuf>,
}

impl ContainerDispatchConfig {
    fn container_name(&self) -> String {
        format!("choo-{}", self.job_id)
    }
}

#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("failed to create container: {0}")]
    Create(String),
    #[error("failed to start container: {0}")]
    Start(String),
    #[error("container exited with code {code}: {tail}")]
    Exit { code: i32, tail: String },
    #[error("io error driving container: {0}")]
    Io(#[from] std::io::Error),
}

/// One parsed line from the container's JSON-event stdout stream. Fields
/// mirror the wire format in §6 exactly.
#[derive(Debug, Clone, Deserialize)]
pub struct ContainerEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub task: Option<i64>,
    #[serde(default)]
    pub pr: Option<i64>,
    #[serde(default)]
    pub payload: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Receives events re-emitted from a container's stdout, with their
/// original timestamp preserved.
pub trait ContainerEventSink: Send + Sync {
    fn emit(&self, event: ContainerEvent);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerOutcome {
    Completed,
    Failed,
}

/// Run one job inside a container: create, start, tail stdout as JSON
/// events re-emitted onto `sink`, then reap the exit code.
pub async fn run_container_job(
    config: &ContainerDispatchConfig,
    sink: Arc<dyn ContainerEventSink>,
) -> Result<ContainerOutcome, ContainerError> {
    let name = config.container_name();
    create_container(config, &name).await?;

    let mut child = Command::new("docker")
        .args(["start", "-a", &name])
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::null())
        .spawn()
        .map_err(|e| ContainerError::Start(e.to_string()))?;

    let stdout = child.stdout.take().ok_or_else(|| {
        ContainerError::Start("container stdout unavailable".to_string())
    })?;

    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                if line.len() > MAX_LINE_BYTES {
                    warn!(bytes = line.len(), "dropping oversized container event line");
                    continue;
                }
                match serde_json::from_str::<ContainerEvent>(&line) {
                    Ok(event) => sink.emit(event),
                    Err(e) => {
                        warn!(line = %line, error = %e, "skipping malformed container event line");
                    }
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "error reading container stdout");
                break;
            }
        }
    }

    let status = child.wait().await?;
    match status.code() {
        Some(0) => Ok(ContainerOutcome::Completed),
        Some(code) => {
            let tail = tail_logs(&name).await.unwrap_or_default();
            Err(ContainerError::Exit { code, tail })
        }
        None => Err(ContainerError::Exit {
            code: -1,
            tail: tail_logs(&name).await.unwrap_or_default(),
        }),
    }
}

async fn create_container(
    config: &ContainerDispatchConfig,
    name: &str,
) -> Result<(), ContainerError> {
    let mut args: Vec<String> = vec!["create".to_string(), "--name".to_string(), name.to_string()];

    for (key, value) in &config.env {
        args.push("-e".to_string());
        args.push(format!("{key}={value}"));
    }
    args.push("-e".to_string());
    args.push(format!("CLONE_URL={}", config.clone_url));

    args.extend(config.extra_flags.iter().cloned());
    args.push(config.image.clone());
    args.push("--json-events".to_string());

    let output = Command::new("docker")
        .args(&args)
        .output()
        .await
        .map_err(|e| ContainerError::Create(e.to_string()))?;

    if !output.status.success() {
        return Err(ContainerError::Create(
            String::from_utf8_lossy(&output.stderr).to_string(),
        ));
    }
    Ok(())
}

async fn tail_logs(name: &str) -> Option<String> {
    let output = Command::new("docker")
        .args(["logs", "--tail", ERROR_LOG_TAIL, name])
        .output()
        .await
        .ok()?;
    Some(String::from_utf8_lossy(&output.stdout).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_name_is_prefixed_with_job_id() {
        let config = ContainerDispatchConfig {
            job_id: "01H000".to_string(),
            image: "choo:latest".to_string(),
            clone_url: "https://example.invalid/repo.git".to_string(),
            env: HashMap::new(),
            extra_flags: vec![],
            working_dir: None,
        };
        assert_eq!(config.container_name(), "choo-01H000");
    }

    #[test]
    fn parses_full_event_line() {
        let line = r#"{"type":"unit.completed","timestamp":"2026-01-01T00:00:00Z","unit":"u1","payload":{"ok":true}}"#;
        let event: ContainerEvent = serde_json::from_str(line).unwrap();
        assert_eq!(event.event_type, "unit.completed");
        assert_eq!(event.unit.as_deref(), Some("u1"));
        assert!(event.task.is_none());
    }

    #[test]
    fn parses_minimal_event_line() {
        let line = r#"{"type":"orch.started","timestamp":"2026-01-01T00:00:00Z"}"#;
        let event: ContainerEvent = serde_json::from_str(line).unwrap();
        assert_eq!(event.event_type, "orch.started");
        assert!(event.unit.is_none());
        assert!(event.pr.is_none());
    }

    #[test]
    fn malformed_line_fails_to_parse_without_panicking() {
        let result: Result<ContainerEvent, _> = serde_json::from_str("not json");
        assert!(result.is_err());
    }
}
