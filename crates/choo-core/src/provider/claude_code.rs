//! Claude Code provider adapter.
//!
//! Spawns `claude -p` with permissive, non-interactive flags and streams
//! stdout/stderr line-by-line to the caller's sink. Does not parse
//! stream-json into structured agent events -- a `Provider` invocation is
//! one-shot, and the worker only needs raw output for logging plus the
//! final exit status.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::trait_def::{OutputSink, Provider, ProviderError};

/// Provider adapter for Claude Code.
#[derive(Debug, Clone)]
pub struct ClaudeCodeProvider {
    binary_path: String,
}

impl ClaudeCodeProvider {
    pub fn new() -> Self {
        Self {
            binary_path: "claude".to_string(),
        }
    }

    pub fn with_binary(path: impl Into<String>) -> Self {
        Self {
            binary_path: path.into(),
        }
    }
}

impl Default for ClaudeCodeProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Provider for ClaudeCodeProvider {
    fn name(&self) -> &str {
        "claude-code"
    }

    async fn invoke(
        &self,
        prompt: &str,
        working_dir: &Path,
        sink: Arc<dyn OutputSink>,
        cancel: CancellationToken,
    ) -> Result<(), ProviderError> {
        let mut cmd = Command::new(&self.binary_path);
        cmd.arg("-p")
            .arg("--output-format")
            .arg("text")
            .arg("--allowedTools")
            .arg("Bash,Read,Edit,Write,Glob,Grep")
            .arg("--permission-mode")
            .arg("acceptEdits")
            .arg(prompt)
            .current_dir(working_dir)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());

        let mut child = cmd.spawn().map_err(|source| ProviderError::SpawnFailed {
            provider: self.name().to_string(),
            source,
        })?;

        let stdout = child.stdout.take().expect("piped stdout");
        let stderr = child.stderr.take().expect("piped stderr");

        let stdout_sink = Arc::clone(&sink);
        let stdout_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                stdout_sink.on_stdout_line(&line);
            }
        });

        let stderr_sink = Arc::clone(&sink);
        let stderr_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                stderr_sink.on_stderr_line(&line);
            }
        });

        let status = tokio::select! {
            status = child.wait() => status.map_err(|source| ProviderError::Io(self.name().to_string(), source))?,
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                let _ = stdout_task.await;
                let _ = stderr_task.await;
                return Err(ProviderError::Cancelled { provider: self.name().to_string() });
            }
        };

        let _ = stdout_task.await;
        let _ = stderr_task.await;

        if !status.success() {
            let code = status.code().unwrap_or(-1);
            warn!(provider = self.name(), code, "provider exited non-zero");
            return Err(ProviderError::NonZeroExit {
                provider: self.name().to_string(),
                code,
            });
        }

        Ok(())
    }
}
