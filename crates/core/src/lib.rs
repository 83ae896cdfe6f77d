//! # Forge Core
//!
//! Autonomous test-driven task orchestration. Forge scans a codebase into
//! scored work items, splits each into feature, guard, and failure concern
//! children, and drives batches of them through a red->green worker loop,
//! a single consolidated build, a staged review cascade, and delivery.
//!
//! ## Architecture
//!
//! - **state**: SQLite-backed task store; every status movement is a
//!   compare-and-swap along the state machine's edges with an audit trail
//! - **scoring**: WSJF prioritization for claim ordering
//! - **decompose**: one unscoped task into exactly three concern children
//! - **analyzer**: codebase scans (vision, fix, security, refactor) that
//!   seed scored, decomposed tasks
//! - **scheduler**: claims a batch across worker lanes, runs red->green,
//!   barriers, then builds the whole batch once
//! - **review**: the L0/L1/L2 cascade gating tasks from build to commit
//! - **pipeline**: the outer loop wiring cycles, the gate, and delivery,
//!   with events and a stop signal
//! - **tools**: subprocess, codebase, generator, and delivery seams

pub mod analyzer;
pub mod config;
pub mod decompose;
pub mod error;
pub mod pipeline;
pub mod review;
pub mod scheduler;
pub mod scoring;
pub mod state;
pub mod tools;

pub use analyzer::{AnalyzeMode, Analyzer};
pub use config::ForgeConfig;
pub use decompose::Decomposer;
pub use error::{ForgeError, Result};
pub use pipeline::{PipelineController, PipelineEvent, PipelineStatus};
pub use review::{CascadeOutcome, CommandReviewer, ReviewCascade, ReviewStage, Reviewer};
pub use scheduler::{CycleReport, CycleScheduler};
pub use state::{Concern, ForgeDb, Task, TaskStatus, TaskStore};
