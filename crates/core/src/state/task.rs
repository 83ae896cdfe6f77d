//! # Task Model
//!
//! The unit of work flowing through the pipeline, its concern facet, and the
//! status state machine. Statuses move monotonically along the documented
//! edges; the only shortcut is the abort path into `failed`, which is legal
//! from any non-terminal state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Status of a task in the pipeline state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting to be claimed
    #[default]
    Pending,
    /// Claimed, lock held, not yet executing
    Locked,
    /// A worker is running the red->green loop
    InProgress,
    /// The worker produced a change that passed its local test
    CodeWritten,
    /// The consolidated batch build accepted the change
    Build,
    /// Under the review cascade
    Review,
    /// Cleared every review stage, waiting for commit handoff
    Commit,
    /// Committed, waiting for deploy handoff
    Deploy,
    /// Terminal success
    Done,
    /// Terminal failure (until an explicit requeue with retries remaining)
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Locked => "locked",
            Self::InProgress => "in_progress",
            Self::CodeWritten => "code_written",
            Self::Build => "build",
            Self::Review => "review",
            Self::Commit => "commit",
            Self::Deploy => "deploy",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => Self::Pending,
            "locked" => Self::Locked,
            "in_progress" => Self::InProgress,
            "code_written" => Self::CodeWritten,
            "build" => Self::Build,
            "review" => Self::Review,
            "commit" => Self::Commit,
            "deploy" => Self::Deploy,
            "done" => Self::Done,
            "failed" => Self::Failed,
            _ => return None,
        })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    /// Whether `self -> to` is an edge of the state machine.
    ///
    /// `failed` is reachable from every non-terminal state (abort path), and
    /// `pending` is re-enterable from the retryable stages: a stale lock is
    /// reaped back from `locked`/`in_progress`, a local test failure returns
    /// from `in_progress`, a failed batch build from `code_written`/`build`,
    /// a review rejection from `review`, and an explicit requeue from
    /// `failed` when retries remain.
    pub fn can_transition(&self, to: TaskStatus) -> bool {
        if to == Self::Failed {
            return !self.is_terminal();
        }
        match self {
            Self::Pending => to == Self::Locked,
            Self::Locked => matches!(to, Self::InProgress | Self::Pending),
            Self::InProgress => matches!(to, Self::CodeWritten | Self::Pending),
            Self::CodeWritten => matches!(to, Self::Build | Self::Pending),
            Self::Build => matches!(to, Self::Review | Self::Pending),
            Self::Review => matches!(to, Self::Commit | Self::Pending),
            Self::Commit => to == Self::Deploy,
            Self::Deploy => to == Self::Done,
            Self::Done => false,
            Self::Failed => to == Self::Pending,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decomposition facet of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Concern {
    /// Primary behavior
    Feature,
    /// Validation and invariants
    Guard,
    /// Error-path handling
    Failure,
    /// Not yet decomposed; never dispatched to a worker
    #[default]
    Unscoped,
}

impl Concern {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Feature => "feature",
            Self::Guard => "guard",
            Self::Failure => "failure",
            Self::Unscoped => "unscoped",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "feature" => Self::Feature,
            "guard" => Self::Guard,
            "failure" => Self::Failure,
            "unscoped" => Self::Unscoped,
            _ => return None,
        })
    }
}

impl fmt::Display for Concern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of work
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique, immutable identifier
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub concern: Concern,
    /// Back-reference to the task this was decomposed from
    #[serde(default)]
    pub parent_id: Option<String>,
    pub status: TaskStatus,
    /// WSJF score; higher is claimed first, ties broken by creation time
    pub priority: f64,
    /// Coarse size estimate, bounds batch composition and gates L2 review
    pub complexity: u32,
    /// Files the task is expected to touch (best-effort, used for
    /// build-failure isolation)
    #[serde(default)]
    pub files: Vec<String>,
    /// Task ids that must reach `done` before this task is claimable
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Child ids when this task has been decomposed; a non-empty set means
    /// the task completes by fan-in, never by execution
    #[serde(default)]
    pub children: Vec<String>,
    #[serde(default)]
    pub lock_owner: Option<String>,
    #[serde(default)]
    pub lock_acquired_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Create a pending, unscoped task with default bookkeeping
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            title: title.into(),
            description: String::new(),
            concern: Concern::Unscoped,
            parent_id: None,
            status: TaskStatus::Pending,
            priority: 0.0,
            complexity: 1,
            files: Vec::new(),
            dependencies: Vec::new(),
            children: Vec::new(),
            lock_owner: None,
            lock_acquired_at: None,
            retry_count: 0,
            max_retries: 3,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_concern(mut self, concern: Concern) -> Self {
        self.concern = concern;
        self
    }

    pub fn with_priority(mut self, priority: f64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_complexity(mut self, complexity: u32) -> Self {
        self.complexity = complexity.max(1);
        self
    }

    pub fn with_files(mut self, files: Vec<String>) -> Self {
        self.files = files;
        self
    }

    pub fn is_decomposed(&self) -> bool {
        !self.children.is_empty()
    }

    pub fn retries_remaining(&self) -> bool {
        self.retry_count < self.max_retries
    }
}

/// Generate a unique task id (timestamp + entropy)
pub fn generate_task_id() -> String {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_nanos();
    let salt = RandomState::new().build_hasher().finish() as u32;
    format!("t-{:x}-{:x}", nanos, salt)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_roundtrip() {
        for s in [
            TaskStatus::Pending,
            TaskStatus::Locked,
            TaskStatus::InProgress,
            TaskStatus::CodeWritten,
            TaskStatus::Build,
            TaskStatus::Review,
            TaskStatus::Commit,
            TaskStatus::Deploy,
            TaskStatus::Done,
            TaskStatus::Failed,
        ] {
            assert_eq!(TaskStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(TaskStatus::parse("bogus"), None);
    }

    #[test]
    fn test_happy_path_edges() {
        use TaskStatus::*;
        let path = [
            Pending,
            Locked,
            InProgress,
            CodeWritten,
            Build,
            Review,
            Commit,
            Deploy,
            Done,
        ];
        for pair in path.windows(2) {
            assert!(
                pair[0].can_transition(pair[1]),
                "{} -> {} should be legal",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn test_no_stage_skipping() {
        use TaskStatus::*;
        assert!(!Pending.can_transition(InProgress));
        assert!(!Pending.can_transition(CodeWritten));
        assert!(!InProgress.can_transition(Build));
        assert!(!CodeWritten.can_transition(Review));
        assert!(!Build.can_transition(Commit));
        assert!(!Review.can_transition(Deploy));
        assert!(!Commit.can_transition(Done));
    }

    #[test]
    fn test_failed_reachable_from_non_terminal_only() {
        use TaskStatus::*;
        for s in [
            Pending,
            Locked,
            InProgress,
            CodeWritten,
            Build,
            Review,
            Commit,
            Deploy,
        ] {
            assert!(s.can_transition(Failed), "{} -> failed should be legal", s);
        }
        assert!(!Done.can_transition(Failed));
        assert!(!Failed.can_transition(Failed));
    }

    #[test]
    fn test_pending_reentry_edges() {
        use TaskStatus::*;
        for s in [Locked, InProgress, CodeWritten, Build, Review, Failed] {
            assert!(s.can_transition(Pending), "{} -> pending should be legal", s);
        }
        assert!(!Commit.can_transition(Pending));
        assert!(!Deploy.can_transition(Pending));
        assert!(!Done.can_transition(Pending));
    }

    #[test]
    fn test_task_id_uniqueness() {
        let a = generate_task_id();
        let b = generate_task_id();
        assert_ne!(a, b);
        assert!(a.starts_with("t-"));
    }
}
