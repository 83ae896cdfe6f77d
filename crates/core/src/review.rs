//! # Review Cascade
//!
//! Three review stages of increasing depth and cost. L0 is a fast lint-level
//! check, L1 the standard review, L2 the deep review reserved for complex or
//! borderline changes. Rejection at any stage stops the cascade immediately;
//! an unavailable reviewer is retried with backoff and only counts as a
//! rejection once its attempt budget is spent.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;
use crate::state::{Task, TaskStatus, TaskStore};
use crate::tools::CommandRunner;

/// One reviewer's answer
#[derive(Debug, Clone)]
pub struct ReviewVerdict {
    pub accept: bool,
    /// Accepted, but close enough to the line that the next stage should
    /// look anyway
    pub borderline: bool,
    pub reason: String,
}

impl ReviewVerdict {
    pub fn accept() -> Self {
        Self {
            accept: true,
            borderline: false,
            reason: String::new(),
        }
    }

    pub fn borderline() -> Self {
        Self {
            accept: true,
            borderline: true,
            reason: String::new(),
        }
    }

    pub fn reject(reason: impl Into<String>) -> Self {
        Self {
            accept: false,
            borderline: false,
            reason: reason.into(),
        }
    }
}

/// A single review stage.
///
/// `Err` means the reviewer could not be reached at all and the cascade
/// should retry with backoff; a rejection is an `Ok` verdict.
#[async_trait]
pub trait Reviewer: Send + Sync {
    async fn review(&self, task: &Task, diff: &str) -> anyhow::Result<ReviewVerdict>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewStage {
    L0,
    L1,
    L2,
}

impl ReviewStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::L0 => "l0",
            Self::L1 => "l1",
            Self::L2 => "l2",
        }
    }
}

impl fmt::Display for ReviewStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Final cascade result for one task
#[derive(Debug, Clone)]
pub enum CascadeOutcome {
    Accepted,
    Rejected { stage: ReviewStage, reason: String },
}

/// What the review gate did to a batch
#[derive(Debug, Default)]
pub struct GateReport {
    /// Advanced to `commit`
    pub promoted: Vec<String>,
    /// Rejected and requeued with a retry charge
    pub requeued: Vec<String>,
    /// Rejected with no retries left, parked as failed
    pub parked: Vec<String>,
}

/// Runs the staged review cascade and gates tasks from `build` to `commit`
pub struct ReviewCascade {
    l0: Arc<dyn Reviewer>,
    l1: Arc<dyn Reviewer>,
    l2: Arc<dyn Reviewer>,
    complexity_threshold: u32,
    max_stage_attempts: u32,
    base_backoff: Duration,
}

impl ReviewCascade {
    pub fn new(l0: Arc<dyn Reviewer>, l1: Arc<dyn Reviewer>, l2: Arc<dyn Reviewer>) -> Self {
        Self {
            l0,
            l1,
            l2,
            complexity_threshold: 5,
            max_stage_attempts: 3,
            base_backoff: Duration::from_millis(500),
        }
    }

    pub fn with_complexity_threshold(mut self, threshold: u32) -> Self {
        self.complexity_threshold = threshold;
        self
    }

    pub fn with_retry_policy(mut self, max_attempts: u32, base_backoff: Duration) -> Self {
        self.max_stage_attempts = max_attempts.max(1);
        self.base_backoff = base_backoff;
        self
    }

    /// Run the cascade for one task. L2 runs only when the task is complex
    /// enough or L1 was borderline; everything else clears after L1.
    pub async fn review_task(&self, task: &Task, diff: &str) -> CascadeOutcome {
        let verdict = self.run_stage(ReviewStage::L0, &*self.l0, task, diff).await;
        if !verdict.accept {
            return CascadeOutcome::Rejected {
                stage: ReviewStage::L0,
                reason: verdict.reason,
            };
        }

        let verdict = self.run_stage(ReviewStage::L1, &*self.l1, task, diff).await;
        if !verdict.accept {
            return CascadeOutcome::Rejected {
                stage: ReviewStage::L1,
                reason: verdict.reason,
            };
        }

        let needs_deep = task.complexity > self.complexity_threshold || verdict.borderline;
        if needs_deep {
            let verdict = self.run_stage(ReviewStage::L2, &*self.l2, task, diff).await;
            if !verdict.accept {
                return CascadeOutcome::Rejected {
                    stage: ReviewStage::L2,
                    reason: verdict.reason,
                };
            }
        }

        CascadeOutcome::Accepted
    }

    async fn run_stage(
        &self,
        stage: ReviewStage,
        reviewer: &dyn Reviewer,
        task: &Task,
        diff: &str,
    ) -> ReviewVerdict {
        for attempt in 0..self.max_stage_attempts {
            match reviewer.review(task, diff).await {
                Ok(verdict) => {
                    tracing::debug!(
                        task = %task.id,
                        stage = %stage,
                        accept = verdict.accept,
                        borderline = verdict.borderline,
                        "Review verdict"
                    );
                    return verdict;
                }
                Err(e) => {
                    let last = attempt + 1 == self.max_stage_attempts;
                    tracing::warn!(
                        task = %task.id,
                        stage = %stage,
                        attempt = attempt + 1,
                        error = %e,
                        "Reviewer unavailable"
                    );
                    if last {
                        return ReviewVerdict::reject(format!(
                            "stage {} unavailable after {} attempts: {}",
                            stage, self.max_stage_attempts, e
                        ));
                    }
                    tokio::time::sleep(self.base_backoff * 2u32.pow(attempt)).await;
                }
            }
        }
        // Unreachable: the loop always returns on the last attempt
        ReviewVerdict::reject(format!("stage {} produced no verdict", stage))
    }

    /// Gate every task sitting in `build`: advance it into `review`, run
    /// the cascade against its stored diff, then promote to `commit` or
    /// send it back with a retry charge. Tasks already in `review` (a
    /// crash between the advance and the verdict) are swept back through
    /// the cascade first, so nothing strands there.
    pub async fn gate(&self, store: &TaskStore) -> Result<GateReport> {
        let mut report = GateReport::default();

        let stranded = store.list_by_status(TaskStatus::Review)?;
        if !stranded.is_empty() {
            tracing::warn!(count = stranded.len(), "Re-reviewing tasks left in review");
        }
        let mut batch = stranded;
        for task in store.list_by_status(TaskStatus::Build)? {
            store.advance(&task.id, TaskStatus::Build, TaskStatus::Review)?;
            batch.push(task);
        }

        for task in batch {
            let diff = store
                .read_payload(&task.id)?
                .map(|b| String::from_utf8_lossy(&b).into_owned())
                .unwrap_or_default();

            match self.review_task(&task, &diff).await {
                CascadeOutcome::Accepted => {
                    store.advance(&task.id, TaskStatus::Review, TaskStatus::Commit)?;
                    report.promoted.push(task.id);
                }
                CascadeOutcome::Rejected { stage, reason } => {
                    tracing::info!(task = %task.id, stage = %stage, reason = %reason, "Review rejected");
                    let landed = store.requeue(
                        &task.id,
                        &format!("review_{}", stage),
                        Some(&reason),
                    )?;
                    if landed == TaskStatus::Failed {
                        report.parked.push(task.id);
                    } else {
                        report.requeued.push(task.id);
                    }
                }
            }
        }
        Ok(report)
    }
}

/// Reviewer backed by an external command.
///
/// Exit 0 accepts (a first stdout line of `borderline` marks the accept
/// borderline), exit 1 rejects with stdout as the reason, and any other
/// exit code counts as the reviewer being unavailable.
pub struct CommandReviewer {
    runner: Arc<dyn CommandRunner>,
    command: String,
    stage: ReviewStage,
    timeout: Duration,
}

impl CommandReviewer {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        command: impl Into<String>,
        stage: ReviewStage,
        timeout: Duration,
    ) -> Self {
        Self {
            runner,
            command: command.into(),
            stage,
            timeout,
        }
    }
}

#[async_trait]
impl Reviewer for CommandReviewer {
    async fn review(&self, task: &Task, diff: &str) -> anyhow::Result<ReviewVerdict> {
        let command = format!(
            "FORGE_DIFF='{}' {}",
            diff.replace('\'', r"'\''"),
            self.command
                .replace("{task_id}", &task.id)
                .replace("{stage}", self.stage.as_str())
        );
        let out = self.runner.run(&command, self.timeout).await?;
        match out.exit_code {
            0 => {
                if out.stdout.lines().next().map(str::trim) == Some("borderline") {
                    Ok(ReviewVerdict::borderline())
                } else {
                    Ok(ReviewVerdict::accept())
                }
            }
            1 => Ok(ReviewVerdict::reject(out.stdout.trim().to_string())),
            code => anyhow::bail!(
                "reviewer {} exited with {}: {}",
                self.stage,
                code,
                out.stderr.trim()
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{ClaimFilter, Concern, ForgeDb, WorkOutcome};
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Scripted reviewer: pops one result per call and counts invocations
    struct ScriptedReviewer {
        verdicts: std::sync::Mutex<Vec<anyhow::Result<ReviewVerdict>>>,
        calls: AtomicU32,
    }

    impl ScriptedReviewer {
        fn new(verdicts: Vec<anyhow::Result<ReviewVerdict>>) -> Arc<Self> {
            Arc::new(Self {
                verdicts: std::sync::Mutex::new(verdicts),
                calls: AtomicU32::new(0),
            })
        }

        fn call_count(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Reviewer for ScriptedReviewer {
        async fn review(&self, _task: &Task, _diff: &str) -> anyhow::Result<ReviewVerdict> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut verdicts = self.verdicts.lock().unwrap();
            if verdicts.is_empty() {
                Ok(ReviewVerdict::accept())
            } else {
                verdicts.remove(0)
            }
        }
    }

    fn cascade(
        l0: Arc<ScriptedReviewer>,
        l1: Arc<ScriptedReviewer>,
        l2: Arc<ScriptedReviewer>,
    ) -> ReviewCascade {
        ReviewCascade::new(l0, l1, l2)
            .with_complexity_threshold(5)
            .with_retry_policy(3, Duration::from_millis(1))
    }

    fn task(complexity: u32) -> Task {
        Task::new("t", "x")
            .with_concern(Concern::Feature)
            .with_complexity(complexity)
    }

    #[tokio::test]
    async fn test_simple_change_skips_deep_stage() {
        let l0 = ScriptedReviewer::new(vec![Ok(ReviewVerdict::accept())]);
        let l1 = ScriptedReviewer::new(vec![Ok(ReviewVerdict::accept())]);
        let l2 = ScriptedReviewer::new(vec![]);

        let outcome = cascade(l0.clone(), l1.clone(), l2.clone())
            .review_task(&task(2), "diff")
            .await;
        assert!(matches!(outcome, CascadeOutcome::Accepted));
        assert_eq!(l2.call_count(), 0);
    }

    #[tokio::test]
    async fn test_complex_change_reaches_deep_stage() {
        let l0 = ScriptedReviewer::new(vec![Ok(ReviewVerdict::accept())]);
        let l1 = ScriptedReviewer::new(vec![Ok(ReviewVerdict::accept())]);
        let l2 = ScriptedReviewer::new(vec![Ok(ReviewVerdict::accept())]);

        let outcome = cascade(l0, l1, l2.clone())
            .review_task(&task(9), "diff")
            .await;
        assert!(matches!(outcome, CascadeOutcome::Accepted));
        assert_eq!(l2.call_count(), 1);
    }

    #[tokio::test]
    async fn test_borderline_standard_review_escalates() {
        let l0 = ScriptedReviewer::new(vec![Ok(ReviewVerdict::accept())]);
        let l1 = ScriptedReviewer::new(vec![Ok(ReviewVerdict::borderline())]);
        let l2 = ScriptedReviewer::new(vec![Ok(ReviewVerdict::reject("too clever"))]);

        let outcome = cascade(l0, l1, l2.clone())
            .review_task(&task(2), "diff")
            .await;
        match outcome {
            CascadeOutcome::Rejected { stage, .. } => assert_eq!(stage, ReviewStage::L2),
            other => panic!("expected rejection, got {:?}", other),
        }
        assert_eq!(l2.call_count(), 1);
    }

    #[tokio::test]
    async fn test_rejection_fails_fast() {
        let l0 = ScriptedReviewer::new(vec![Ok(ReviewVerdict::accept())]);
        let l1 = ScriptedReviewer::new(vec![Ok(ReviewVerdict::reject("missing tests"))]);
        let l2 = ScriptedReviewer::new(vec![]);

        let outcome = cascade(l0, l1, l2.clone())
            .review_task(&task(9), "diff")
            .await;
        match outcome {
            CascadeOutcome::Rejected { stage, reason } => {
                assert_eq!(stage, ReviewStage::L1);
                assert_eq!(reason, "missing tests");
            }
            other => panic!("expected rejection, got {:?}", other),
        }
        // Deep stage never runs after an earlier rejection
        assert_eq!(l2.call_count(), 0);
    }

    #[tokio::test]
    async fn test_unavailable_reviewer_retries_then_rejects() {
        let l0 = ScriptedReviewer::new(vec![
            Err(anyhow::anyhow!("connection refused")),
            Err(anyhow::anyhow!("connection refused")),
            Err(anyhow::anyhow!("connection refused")),
        ]);
        let l1 = ScriptedReviewer::new(vec![]);
        let l2 = ScriptedReviewer::new(vec![]);

        let outcome = cascade(l0.clone(), l1.clone(), l2)
            .review_task(&task(2), "diff")
            .await;
        match outcome {
            CascadeOutcome::Rejected { stage, reason } => {
                assert_eq!(stage, ReviewStage::L0);
                assert!(reason.contains("unavailable"));
            }
            other => panic!("expected rejection, got {:?}", other),
        }
        assert_eq!(l0.call_count(), 3);
        assert_eq!(l1.call_count(), 0);
    }

    #[tokio::test]
    async fn test_unavailable_then_recovered_proceeds() {
        let l0 = ScriptedReviewer::new(vec![
            Err(anyhow::anyhow!("transient")),
            Ok(ReviewVerdict::accept()),
        ]);
        let l1 = ScriptedReviewer::new(vec![Ok(ReviewVerdict::accept())]);
        let l2 = ScriptedReviewer::new(vec![]);

        let outcome = cascade(l0.clone(), l1, l2)
            .review_task(&task(2), "diff")
            .await;
        assert!(matches!(outcome, CascadeOutcome::Accepted));
        assert_eq!(l0.call_count(), 2);
    }

    #[tokio::test]
    async fn test_gate_promotes_and_requeues() {
        let path = std::env::temp_dir().join("forge_review_gate.db");
        let _ = std::fs::remove_file(&path);
        let db = ForgeDb::open_at(&path).unwrap();
        let store = crate::state::TaskStore::new(&db);

        for id in ["good", "bad"] {
            store
                .create(
                    &Task::new(id, id)
                        .with_concern(Concern::Feature)
                        .with_priority(1.0),
                )
                .unwrap();
            let claimed = store.claim("w0", &ClaimFilter::default()).unwrap();
            store
                .release(&claimed.id, "w0", WorkOutcome::CodeWritten)
                .unwrap();
            store
                .advance(&claimed.id, TaskStatus::CodeWritten, TaskStatus::Build)
                .unwrap();
            store.write_payload(&claimed.id, b"diff text").unwrap();
        }

        // L1 rejects the second task reviewed; tasks gate in priority
        // order so bump "good" ahead deterministically
        let l0 = ScriptedReviewer::new(vec![]);
        let l1 = ScriptedReviewer::new(vec![
            Ok(ReviewVerdict::accept()),
            Ok(ReviewVerdict::reject("nope")),
        ]);
        let l2 = ScriptedReviewer::new(vec![]);

        let report = cascade(l0, l1, l2).gate(&store).await.unwrap();
        assert_eq!(report.promoted.len(), 1);
        assert_eq!(report.requeued.len(), 1);
        assert!(report.parked.is_empty());

        let promoted = store.get(&report.promoted[0]).unwrap();
        assert_eq!(promoted.status, TaskStatus::Commit);
        let requeued = store.get(&report.requeued[0]).unwrap();
        assert_eq!(requeued.status, TaskStatus::Pending);
        assert_eq!(requeued.retry_count, 1);

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_gate_recovers_task_stranded_in_review() {
        let path = std::env::temp_dir().join("forge_review_stranded.db");
        let _ = std::fs::remove_file(&path);
        let db = ForgeDb::open_at(&path).unwrap();
        let store = crate::state::TaskStore::new(&db);

        // A crash after build -> review but before any verdict leaves the
        // task sitting in review with no one looking at it
        store
            .create(
                &Task::new("t", "x")
                    .with_concern(Concern::Feature)
                    .with_priority(1.0),
            )
            .unwrap();
        store.claim("w0", &ClaimFilter::default()).unwrap();
        store.release("t", "w0", WorkOutcome::CodeWritten).unwrap();
        store
            .advance("t", TaskStatus::CodeWritten, TaskStatus::Build)
            .unwrap();
        store.write_payload("t", b"diff text").unwrap();
        store
            .advance("t", TaskStatus::Build, TaskStatus::Review)
            .unwrap();

        let l0 = ScriptedReviewer::new(vec![]);
        let l1 = ScriptedReviewer::new(vec![]);
        let l2 = ScriptedReviewer::new(vec![]);

        let report = cascade(l0, l1, l2).gate(&store).await.unwrap();
        assert_eq!(report.promoted, vec!["t".to_string()]);
        assert_eq!(store.get("t").unwrap().status, TaskStatus::Commit);

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_gate_parks_exhausted_rejection_as_failed() {
        let path = std::env::temp_dir().join("forge_review_park.db");
        let _ = std::fs::remove_file(&path);
        let db = ForgeDb::open_at(&path).unwrap();
        let store = crate::state::TaskStore::new(&db);

        let mut t = Task::new("t", "x")
            .with_concern(Concern::Feature)
            .with_priority(1.0);
        t.max_retries = 0;
        store.create(&t).unwrap();
        store.claim("w0", &ClaimFilter::default()).unwrap();
        store.release("t", "w0", WorkOutcome::CodeWritten).unwrap();
        store
            .advance("t", TaskStatus::CodeWritten, TaskStatus::Build)
            .unwrap();

        let l0 = ScriptedReviewer::new(vec![Ok(ReviewVerdict::reject("never"))]);
        let l1 = ScriptedReviewer::new(vec![]);
        let l2 = ScriptedReviewer::new(vec![]);

        let report = cascade(l0, l1, l2).gate(&store).await.unwrap();
        assert_eq!(report.parked, vec!["t".to_string()]);
        assert_eq!(store.get("t").unwrap().status, TaskStatus::Failed);

        let _ = std::fs::remove_file(&path);
    }
}
