//! Codex CLI provider adapter.
//!
//! Same one-shot invoke contract as [`super::claude_code::ClaudeCodeProvider`],
//! differing only in the flags passed to the subprocess: `codex exec` runs
//! non-interactively and `--full-auto` grants the same file/exec permissions
//! `claude -p --allowedTools` grants.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::trait_def::{OutputSink, Provider, ProviderError};

/// Provider adapter for the Codex CLI.
#[derive(Debug, Clone)]
pub struct CodexCliProvider {
    binary_path: String,
}

impl CodexCliProvider {
    pub fn new() -> Self {
        Self {
            binary_path: "codex".to_string(),
        }
    }

    pub fn with_binary(path: impl Into<String>) -> Self {
        Self {
            binary_path: path.into(),
        }
    }
}

impl Default for CodexCliProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Provider for CodexCliProvider {
    fn name(&self) -> &str {
        "codex"
    }

    async fn invoke(
        &self,
        prompt: &str,
        working_dir: &Path,
        sink: Arc<dyn OutputSink>,
        cancel: CancellationToken,
    ) -> Result<(), ProviderError> {
        let mut cmd = Command::new(&self.binary_path);
        cmd.arg("exec")
            .arg("--full-auto")
            .arg("--skip-git-repo-check")
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct CapturingSink {
        stdout: Mutex<Vec<String>>,
    }

    impl OutputSink for CapturingSink {
        fn on_stdout_line(&self, line: &str) {
            self.stdout.lock().unwrap().push(line.to_string());
        }
        fn on_stderr_line(&self, _line: &str) {}
    }

    fn write_fake_codex(tmp: &std::path::Path, body: &str) -> String {
        let script_path = tmp.join("fake_codex.sh");
        std::fs::write(&script_path, format!("#!/bin/sh\n{body}")).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&script_path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        script_path.to_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn invoke_streams_stdout_lines() {
        let tmp = tempfile::tempdir().unwrap();
        let script = write_fake_codex(tmp.path(), "echo 'hello from fake codex'\n");
        let provider = CodexCliProvider::with_binary(script);
        let sink = Arc::new(CapturingSink::default());
        let result = provider
            .invoke("ignored", tmp.path(), sink.clone(), CancellationToken::new())
            .await;
        assert!(result.is_ok());
        assert_eq!(sink.stdout.lock().unwrap().as_slice(), ["hello from fake codex"]);
    }

    #[tokio::test]
    async fn invoke_binary_not_found_returns_spawn_failed() {
        let provider = CodexCliProvider::with_binary("choo-nonexistent-codex-xyz");
        let result = provider
            .invoke("hi", Path::new("/tmp"), Arc::new(CapturingSink::default()), CancellationToken::new())
            .await;
        assert!(matches!(result, Err(ProviderError::SpawnFailed { .. })));
    }
}
