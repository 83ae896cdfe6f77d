//! # Error Types
//!
//! Domain errors for the orchestration core. Task-local failures are absorbed
//! into state transitions and never cross component boundaries as errors;
//! the variants here cover scheduling misses, lost transition races, and
//! store-level faults that callers genuinely need to branch on.

use thiserror::Error;

use crate::state::TaskStatus;

/// Errors surfaced by the orchestration core
#[derive(Debug, Error)]
pub enum ForgeError {
    /// No pending task matches the claim filter (non-fatal; the cycle
    /// simply processes fewer tasks)
    #[error("no eligible task matches the claim filter")]
    NoEligibleTask,

    /// A compare-and-swap transition lost a race; the caller should
    /// re-fetch and retry
    #[error("task {task_id}: expected status '{expected}', found '{actual}'")]
    StaleStatus {
        task_id: String,
        expected: TaskStatus,
        actual: TaskStatus,
    },

    /// The requested transition is not an edge of the task state machine
    #[error("task {task_id}: illegal transition '{from}' -> '{to}'")]
    InvalidTransition {
        task_id: String,
        from: TaskStatus,
        to: TaskStatus,
    },

    /// Decomposition was requested twice for the same parent
    #[error("task {0} is already decomposed")]
    AlreadyDecomposed(String),

    /// Decomposition was requested for a task that already carries a concern
    #[error("task {0} is concern-scoped and cannot be decomposed")]
    NotDecomposable(String),

    #[error("task {0} not found")]
    TaskNotFound(String),

    /// The analyzer's codebase handle could not be read; the run is
    /// all-or-nothing so no tasks were created
    #[error("codebase unreadable: {0}")]
    CodebaseUnreadable(String),

    /// A task hit its retry ceiling and was parked as failed
    #[error("task {0} exhausted its retry budget")]
    RetriesExhausted(String),

    /// Stored row could not be decoded (schema drift or corruption)
    #[error("task {task_id}: corrupt column '{column}': {detail}")]
    CorruptRecord {
        task_id: String,
        column: String,
        detail: String,
    },

    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    /// The in-process connection mutex was poisoned by a panicking holder
    #[error("store connection lock poisoned")]
    LockPoisoned,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ForgeError>;
