use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl FromStr for RunStatus {
    type Err = RunStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(RunStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`RunStatus`] string.
#[derive(Debug, Clone)]
pub struct RunStatusParseError(pub String);

impl fmt::Display for RunStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid run status: {:?}", self.0)
    }
}

impl std::error::Error for RunStatusParseError {}

// ---------------------------------------------------------------------------

/// Status of a unit, per the scheduler's authoritative transition table.
///
/// `PrOpen`, `InReview`, and `Merging` are retained for the state machine's
/// transition table but are not produced by the local-merge workflow; a
/// modern orchestrator never persists them. Legacy journal rows carrying one
/// of those values deserialize to `InProgress` -- see `UnitStatus::from_str`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    Pending,
    Ready,
    InProgress,
    PrOpen,
    InReview,
    Merging,
    Complete,
    Failed,
    Blocked,
}

impl UnitStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::Blocked)
    }

    pub fn is_active(self) -> bool {
        matches!(
            self,
            Self::InProgress | Self::PrOpen | Self::InReview | Self::Merging
        )
    }

    /// True if `to` is reachable from `self` in one hop of the transition table.
    pub fn can_transition_to(self, to: UnitStatus) -> bool {
        use UnitStatus::*;
        matches!(
            (self, to),
            (Pending, Ready)
                | (Pending, Blocked)
                | (Ready, InProgress)
                | (Ready, Blocked)
                | (InProgress, PrOpen)
                | (InProgress, Complete)
                | (InProgress, Failed)
                | (PrOpen, InReview)
                | (PrOpen, Complete)
                | (PrOpen, Failed)
                | (InReview, Merging)
                | (InReview, PrOpen)
                | (InReview, Failed)
                | (Merging, Complete)
                | (Merging, Failed)
        )
    }
}

impl fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::InProgress => "in_progress",
            Self::PrOpen => "pr_open",
            Self::InReview => "in_review",
            Self::Merging => "merging",
            Self::Complete => "complete",
            Self::Failed => "failed",
            Self::Blocked => "blocked",
        };
        f.write_str(s)
    }
}

impl FromStr for UnitStatus {
    type Err = UnitStatusParseError;

    /// Legacy PR-phase values (`pr_open`, `in_review`, `merging`) coerce to
    /// `in_progress` so old journal rows remain readable by a local-merge-only
    /// orchestrator.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "ready" => Ok(Self::Ready),
            "in_progress" => Ok(Self::InProgress),
            "pr_open" | "in_review" | "merging" => Ok(Self::InProgress),
            "complete" => Ok(Self::Complete),
            "failed" => Ok(Self::Failed),
            "blocked" => Ok(Self::Blocked),
            other => Err(UnitStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`UnitStatus`] string.
#[derive(Debug, Clone)]
pub struct UnitStatusParseError(pub String);

impl fmt::Display for UnitStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid unit status: {:?}", self.0)
    }
}

impl std::error::Error for UnitStatusParseError {}

// ---------------------------------------------------------------------------

/// Closed set of event types the journal and event bus will carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    OrchStarted,
    OrchCompleted,
    OrchFailed,
    UnitStarted,
    UnitQueued,
    UnitCompleted,
    UnitFailed,
    UnitBlocked,
    TaskStarted,
    TaskCommitted,
    TaskCompleted,
    TaskFailed,
    TaskProviderInvoke,
    CodereviewStarted,
    CodereviewPassed,
    CodereviewIssuesFound,
    CodereviewFixApplied,
    CodereviewFailed,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::OrchStarted => "orch.started",
            Self::OrchCompleted => "orch.completed",
            Self::OrchFailed => "orch.failed",
            Self::UnitStarted => "unit.started",
            Self::UnitQueued => "unit.queued",
            Self::UnitCompleted => "unit.completed",
            Self::UnitFailed => "unit.failed",
            Self::UnitBlocked => "unit.blocked",
            Self::TaskStarted => "task.started",
            Self::TaskCommitted => "task.committed",
            Self::TaskCompleted => "task.completed",
            Self::TaskFailed => "task.failed",
            Self::TaskProviderInvoke => "task.provider.invoke",
            Self::CodereviewStarted => "codereview.started",
            Self::CodereviewPassed => "codereview.passed",
            Self::CodereviewIssuesFound => "codereview.issues_found",
            Self::CodereviewFixApplied => "codereview.fix_applied",
            Self::CodereviewFailed => "codereview.failed",
        };
        f.write_str(s)
    }
}

impl FromStr for EventType {
    type Err = EventTypeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "orch.started" => Ok(Self::OrchStarted),
            "orch.completed" => Ok(Self::OrchCompleted),
            "orch.failed" => Ok(Self::OrchFailed),
            "unit.started" => Ok(Self::UnitStarted),
            "unit.queued" => Ok(Self::UnitQueued),
            "unit.completed" => Ok(Self::UnitCompleted),
            "unit.failed" => Ok(Self::UnitFailed),
            "unit.blocked" => Ok(Self::UnitBlocked),
            "task.started" => Ok(Self::TaskStarted),
            "task.committed" => Ok(Self::TaskCommitted),
            "task.completed" => Ok(Self::TaskCompleted),
            "task.failed" => Ok(Self::TaskFailed),
            "task.provider.invoke" => Ok(Self::TaskProviderInvoke),
            "codereview.started" => Ok(Self::CodereviewStarted),
            "codereview.passed" => Ok(Self::CodereviewPassed),
            "codereview.issues_found" => Ok(Self::CodereviewIssuesFound),
            "codereview.fix_applied" => Ok(Self::CodereviewFixApplied),
            "codereview.failed" => Ok(Self::CodereviewFailed),
            other => Err(EventTypeParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`EventType`] string.
#[derive(Debug, Clone)]
pub struct EventTypeParseError(pub String);

impl fmt::Display for EventTypeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid event type: {:?}", self.0)
    }
}

impl std::error::Error for EventTypeParseError {}

// ---------------------------------------------------------------------------
// Row structs
// ---------------------------------------------------------------------------

/// One invocation of the orchestrator.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub feature_branch: String,
    pub repo_path: String,
    pub target_branch: String,
    pub tasks_dir: String,
    pub parallelism: i64,
    pub status: RunStatus,
    pub daemon_version: String,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub config_json: Option<String>,
}

/// A unit's row in the journal -- the scheduler's persisted view of a unit.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct UnitRow {
    pub id: String,
    pub run_id: String,
    pub unit_id: String,
    pub status: UnitStatus,
    pub branch: Option<String>,
    pub worktree_path: Option<String>,
    pub blocked_by: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

/// An immutable journal event.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Event {
    pub id: i64,
    pub run_id: String,
    pub sequence: i64,
    pub event_type: String,
    pub unit_id: Option<String>,
    pub payload_json: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Event {
    pub fn parsed_event_type(&self) -> Result<EventType, EventTypeParseError> {
        self.event_type.parse()
    }
}

/// Aggregated input/output token counts, surfaced per task or summed over a
/// whole run. Not a first-class table -- derived from `task.provider.invoke`
/// payloads that happen to carry a provider-reported `usage` object.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: i64,
    pub output_tokens: i64,
}

impl TokenUsage {
    pub fn add(&mut self, other: TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }

    pub fn total(&self) -> i64 {
        self.input_tokens + self.output_tokens
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
