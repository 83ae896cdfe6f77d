//! # Configuration
//!
//! Pipeline tuning knobs, loaded from a JSON file with every field
//! defaulting so a partial config stays valid.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// All pipeline settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ForgeConfig {
    /// Concurrent worker lanes per cycle
    pub width: usize,
    /// Maximum tasks claimed per cycle
    pub batch_size: usize,
    /// Red->green attempts a worker makes before giving the task back
    pub worker_attempts: u32,
    /// Lock age beyond which the reaper reclaims a task, in seconds
    pub lock_max_age_secs: u64,
    /// Per-task test/generate command timeout, in seconds
    pub task_timeout_secs: u64,
    /// Whole-cycle barrier timeout, in seconds
    pub cycle_timeout_secs: u64,
    /// Consolidated build timeout, in seconds
    pub build_timeout_secs: u64,
    /// Attempts per review stage when the reviewer is unavailable
    pub review_max_attempts: u32,
    /// Base backoff between unavailable-reviewer attempts, in milliseconds
    pub review_backoff_ms: u64,
    /// Complexity above which an accepted task still goes to the deep stage
    pub l2_complexity_threshold: u32,
    /// Default retry budget for new tasks
    pub max_retries: u32,

    /// Command templates ({task_id}, {title}, {concern} placeholders)
    pub test_command: String,
    pub build_command: String,
    pub generate_command: String,
    pub commit_command: String,
    pub deploy_command: String,
    pub review_l0_command: String,
    pub review_l1_command: String,
    pub review_l2_command: String,

    /// Directory walk depth ceiling for analysis
    pub analyze_max_depth: usize,
    /// Keep cycling when the queue drains instead of exiting
    pub continuous: bool,
    /// Idle sleep between cycles in continuous mode, in seconds
    pub poll_interval_secs: u64,
}

impl Default for ForgeConfig {
    fn default() -> Self {
        Self {
            width: 2,
            batch_size: 4,
            worker_attempts: 2,
            lock_max_age_secs: 15 * 60,
            task_timeout_secs: 120,
            cycle_timeout_secs: 30 * 60,
            build_timeout_secs: 10 * 60,
            review_max_attempts: 3,
            review_backoff_ms: 500,
            l2_complexity_threshold: 5,
            max_retries: 3,
            test_command: "cargo test {task_id}".into(),
            build_command: "cargo build".into(),
            generate_command: "forge-generate {task_id}".into(),
            commit_command: "git commit -am 'forge: {task_id}'".into(),
            deploy_command: "true".into(),
            review_l0_command: "forge-review --stage l0 {task_id}".into(),
            review_l1_command: "forge-review --stage l1 {task_id}".into(),
            review_l2_command: "forge-review --stage l2 {task_id}".into(),
            analyze_max_depth: 12,
            continuous: false,
            poll_interval_secs: 30,
        }
    }
}

impl ForgeConfig {
    /// Load from a JSON file; missing fields take their defaults
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        let config = serde_json::from_str(&contents)?;
        Ok(config)
    }

    pub fn lock_max_age(&self) -> Duration {
        Duration::from_secs(self.lock_max_age_secs)
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }

    pub fn cycle_timeout(&self) -> Duration {
        Duration::from_secs(self.cycle_timeout_secs)
    }

    pub fn build_timeout(&self) -> Duration {
        Duration::from_secs(self.build_timeout_secs)
    }

    pub fn review_backoff(&self) -> Duration {
        Duration::from_millis(self.review_backoff_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}
