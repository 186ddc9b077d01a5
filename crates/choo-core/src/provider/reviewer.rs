//! The `Reviewer` capability -- advisory code review against a base ref.
//!
//! One operation: examine a working directory against a base ref and return
//! a structured result. Errors are always advisory: callers treat any error
//! as "review skipped" and never block a merge on it.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::trait_def::{OutputSink, Provider, ProviderError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
    Suggestion,
    Info,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewIssue {
    pub file: String,
    pub line: Option<u32>,
    pub severity: Severity,
    pub message: String,
    pub suggestion: Option<String>,
}

/// The structured result of a review.
#[derive(Debug, Clone)]
pub struct ReviewResult {
    pub passed: bool,
    pub summary: String,
    pub issues: Vec<ReviewIssue>,
    pub raw_output: String,
}

impl ReviewResult {
    pub fn has_blocking_issues(&self) -> bool {
        self.issues.iter().any(|i| i.severity == Severity::Error)
    }
}

/// Errors from a `Reviewer` invocation. Always advisory -- see module docs.
#[derive(Debug, thiserror::Error)]
pub enum ReviewerError {
    #[error("reviewer provider failed: {0}")]
    Provider(#[from] ProviderError),
    #[error("reviewer produced output that could not be parsed: {0}")]
    Unparseable(String),
}

/// Adapter interface for code review.
#[async_trait]
pub trait Reviewer: Send + Sync {
    fn name(&self) -> &str;

    async fn review(
        &self,
        working_dir: &Path,
        base_ref: &str,
        cancel: CancellationToken,
    ) -> Result<ReviewResult, ReviewerError>;
}

/// Collects stdout lines produced by a review invocation; used to recover
/// the JSON payload the reviewer prompt asks the model to emit as its last line.
#[derive(Default)]
struct LineCollector {
    lines: std::sync::Mutex<Vec<String>>,
}

impl OutputSink for LineCollector {
    fn on_stdout_line(&self, line: &str) {
        self.lines.lock().unwrap_or_else(|e| e.into_inner()).push(line.to_string());
    }
    fn on_stderr_line(&self, _line: &str) {}
}

#[derive(Deserialize)]
struct ReviewVerdict {
    #[serde(default)]
    passed: bool,
    #[serde(default)]
    summary: String,
    #[serde(default)]
    issues: Vec<ReviewIssue>,
}

/// A `Reviewer` built on top of any `Provider`: prompts the provider to
/// examine the diff against `base_ref` and emit a single JSON verdict line.
pub struct ProviderReviewer {
    provider: Arc<dyn Provider>,
}

impl ProviderReviewer {
    pub fn new(provider: Arc<dyn Provider>) -> Self {
        Self { provider }
    }

    fn build_prompt(base_ref: &str) -> String {
        format!(
            "Review the working tree changes relative to `{base_ref}`. \
             Respond with exactly one line of JSON as your final output: \
             {{\"passed\": bool, \"summary\": string, \"issues\": \
             [{{\"file\": string, \"line\": number|null, \"severity\": \
             \"error\"|\"warning\"|\"suggestion\"|\"info\", \"message\": string, \
             \"suggestion\": string|null}}]}}"
        )
    }
}

#[async_trait]
impl Reviewer for ProviderReviewer {
    fn name(&self) -> &str {
        self.provider.name()
    }

    async fn review(
        &self,
        working_dir: &Path,
        base_ref: &str,
        cancel: CancellationToken,
    ) -> Result<ReviewResult, ReviewerError> {
        let prompt = Self::build_prompt(base_ref);
        let collector = Arc::new(LineCollector::default());
        self.provider
            .invoke(&prompt, working_dir, collector.clone(), cancel)
            .await?;

        let lines = collector.lines.lock().unwrap_or_else(|e| e.into_inner());
        let raw_output = lines.join("\n");

        let json_line = lines
            .iter()
            .rev()
            .find(|line| line.trim_start().starts_with('{'))
            .ok_or_else(|| ReviewerError::Unparseable("no JSON verdict line found".to_string()))?;

        let verdict: ReviewVerdict = serde_json::from_str(json_line)
            .map_err(|e| ReviewerError::Unparseable(e.to_string()))?;

        Ok(ReviewResult {
            passed: verdict.passed,
            summary: verdict.summary,
            issues: verdict.issues,
            raw_output,
        })
    }
}
