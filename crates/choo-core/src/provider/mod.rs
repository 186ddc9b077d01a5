//! Provider and Reviewer capabilities -- the AI CLI adapter interfaces.
//!
//! `Provider::invoke` is a one-shot contract: choo drives each task as a
//! single non-interactive invocation rather than a resumable conversation.
//! `Reviewer` layers a structured verdict on top of any `Provider`.

pub mod claude_code;
pub mod codex;
pub mod registry;
pub mod resolve;
pub mod reviewer;
pub mod trait_def;

pub use claude_code::ClaudeCodeProvider;
pub use codex::CodexCliProvider;
pub use registry::ProviderRegistry;
pub use resolve::{InvocationKind, ProviderSelector, BUILTIN_DEFAULT_PROVIDER};
pub use reviewer::{ProviderReviewer, ReviewIssue, ReviewResult, Reviewer, ReviewerError, Severity};
pub use trait_def::{NullSink, OutputSink, Provider, ProviderError};
