//! # Persistent State
//!
//! SQLite-backed task state: the database handle, the task model and its
//! state machine, and the store that mediates every status movement.

pub mod db;
pub mod task;
pub mod task_store;

pub use db::ForgeDb;
pub use task::{generate_task_id, Concern, Task, TaskStatus};
pub use task_store::{
    ClaimFilter, CycleRecord, HistoryEntry, StatusCounts, TaskStore, WorkOutcome,
};
