//! The `Provider` trait -- the adapter interface for AI coding CLIs.
//!
//! A `Provider` is a single operation: invoke the configured AI CLI with a
//! prompt in a given working directory, streaming its stdout/stderr to
//! caller-supplied sinks, and return the exit status. Implementations
//! differ only in argument shape; all use permissive flags that disable
//! interactive prompts.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Receives output lines as a `Provider` invocation runs.
///
/// Implementations are responsible for their own buffering; lines are
/// delivered as they are read, already stripped of the trailing newline.
pub trait OutputSink: Send + Sync {
    fn on_stdout_line(&self, line: &str);
    fn on_stderr_line(&self, line: &str);
}

/// An `OutputSink` that discards everything, for callers that only care
/// about the exit status.
#[derive(Debug, Default)]
pub struct NullSink;

impl OutputSink for NullSink {
    fn on_stdout_line(&self, _line: &str) {}
    fn on_stderr_line(&self, _line: &str) {}
}

/// Errors from a `Provider` invocation.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("{provider}: failed to spawn subprocess: {source}")]
    SpawnFailed {
        provider: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{provider}: exited with status {code}")]
    NonZeroExit { provider: String, code: i32 },

    #[error("{provider}: invocation cancelled")]
    Cancelled { provider: String },

    #[error("{provider}: io error: {0}")]
    Io(String, #[source] std::io::Error),
}

/// Adapter interface for invoking an AI coding CLI.
///
/// # Object Safety
///
/// Every method returns a concrete or boxed type, so `Box<dyn Provider>`
/// works in [`super::registry::ProviderRegistry`].
#[async_trait]
pub trait Provider: Send + Sync {
    /// Human-readable name for this provider (e.g. "claude-code").
    fn name(&self) -> &str;

    /// Run the provider against `prompt` with `working_dir` as the
    /// subprocess's current directory, streaming output to `sink`.
    ///
    /// Returns `Ok(())` on exit code 0. Any other exit code is
    /// `Err(ProviderError::NonZeroExit)`. If `cancel` is triggered while the
    /// subprocess is running, it is killed and `Err(ProviderError::Cancelled)`
    /// is returned.
    async fn invoke(
        &self,
        prompt: &str,
        working_dir: &Path,
        sink: Arc<dyn OutputSink>,
        cancel: CancellationToken,
    ) -> Result<(), ProviderError>;
}

// Compile-time assertion: Provider must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn Provider) {}
};
