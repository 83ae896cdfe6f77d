//! # Cycle Scheduler
//!
//! Drives one batch of tasks through the red->green loop. A cycle reaps
//! stale locks, settles finished decompositions, claims up to a batch of
//! eligible tasks across a fixed number of worker lanes, runs each task's
//! failing test and generated fix, waits for every lane at the barrier, and
//! finishes with a single consolidated build for the whole batch.

use chrono::Utc;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::config::ForgeConfig;
use crate::error::{ForgeError, Result};
use crate::state::{ClaimFilter, Task, TaskStatus, TaskStore, WorkOutcome};
use crate::tools::{CodeGenerator, CommandRunner};

/// What one cycle accomplished
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    pub started_at: String,
    pub claimed: usize,
    pub code_written: usize,
    pub built: usize,
    pub requeued: usize,
    pub failed: usize,
    pub build_ok: bool,
}

impl CycleReport {
    pub fn idle(&self) -> bool {
        self.claimed == 0
    }
}

/// Batch executor for the red->green phase
pub struct CycleScheduler {
    store: TaskStore,
    runner: Arc<dyn CommandRunner>,
    generator: Arc<dyn CodeGenerator>,
    config: ForgeConfig,
}

impl CycleScheduler {
    pub fn new(
        store: TaskStore,
        runner: Arc<dyn CommandRunner>,
        generator: Arc<dyn CodeGenerator>,
        config: ForgeConfig,
    ) -> Self {
        Self {
            store,
            runner,
            generator,
            config,
        }
    }

    /// Run one full cycle. The stop signal is honored at task boundaries;
    /// tasks already claimed when it flips are returned to pending without
    /// a retry charge.
    pub async fn run_cycle(&self, stop: &watch::Receiver<bool>) -> Result<CycleReport> {
        let mut report = CycleReport {
            started_at: Utc::now().to_rfc3339(),
            build_ok: true,
            ..Default::default()
        };

        let reaped = self.store.reap_stale_locks(self.config.lock_max_age())?;
        if !reaped.is_empty() {
            tracing::warn!(count = reaped.len(), ids = ?reaped, "Reaped stale locks");
        }

        let settled = self.store.settle_decomposed()?;
        if !settled.is_empty() {
            tracing::info!(count = settled.len(), "Settled decomposed parents");
        }

        // Claim up to a batch, dealt round-robin across the lanes
        let width = self.config.width.max(1);
        let mut lanes: Vec<Vec<Task>> = vec![Vec::new(); width];
        for i in 0..self.config.batch_size {
            if *stop.borrow() {
                break;
            }
            let worker_id = format!("worker-{}", i % width);
            match self.store.claim(&worker_id, &ClaimFilter::default()) {
                Ok(task) => {
                    lanes[i % width].push(task);
                    report.claimed += 1;
                }
                Err(ForgeError::NoEligibleTask) => break,
                Err(e) => return Err(e),
            }
        }

        if report.claimed == 0 {
            tracing::debug!("No eligible tasks this cycle");
            return Ok(report);
        }
        tracing::info!(
            claimed = report.claimed,
            lanes = width,
            "Cycle claimed a batch"
        );

        let mut join = JoinSet::new();
        for lane in lanes.into_iter().filter(|l| !l.is_empty()) {
            let store = self.store.clone();
            let runner = Arc::clone(&self.runner);
            let generator = Arc::clone(&self.generator);
            let config = self.config.clone();
            let stop = stop.clone();
            join.spawn(async move {
                let mut written = 0usize;
                let mut failed = 0usize;
                for task in lane {
                    if *stop.borrow() {
                        if let Err(e) = store.return_to_pending(&task.id, "stop") {
                            tracing::error!(task = %task.id, error = %e, "Failed to release on stop");
                        }
                        continue;
                    }
                    if work_task(&store, &*runner, &*generator, &config, &task).await {
                        written += 1;
                    } else {
                        failed += 1;
                    }
                }
                (written, failed)
            });
        }

        // Barrier: every lane finishes (or the cycle deadline hits) before
        // the consolidated build
        let deadline = tokio::time::timeout(self.config.cycle_timeout(), async {
            let mut totals = (0usize, 0usize);
            while let Some(res) = join.join_next().await {
                if let Ok((written, failed)) = res {
                    totals.0 += written;
                    totals.1 += failed;
                }
            }
            totals
        })
        .await;
        match deadline {
            Ok((written, failed)) => {
                report.code_written += written;
                report.failed += failed;
            }
            Err(_) => {
                // Stragglers keep their locks and get reaped next cycle
                tracing::warn!("Cycle barrier timed out, aborting remaining lanes");
                join.abort_all();
            }
        }

        self.consolidated_build(&mut report).await?;
        Ok(report)
    }

    /// One build for the whole batch. On failure, tasks whose expected
    /// files show up in the build output take the retry charge; the rest
    /// go back to pending unblamed. With nothing to pin it on, the whole
    /// batch is charged.
    async fn consolidated_build(&self, report: &mut CycleReport) -> Result<()> {
        let ready = self.store.list_by_status(TaskStatus::CodeWritten)?;
        if ready.is_empty() {
            return Ok(());
        }

        let out = match self
            .runner
            .run(&self.config.build_command, self.config.build_timeout())
            .await
        {
            Ok(out) => out,
            Err(e) => {
                tracing::error!(error = %e, "Build command could not run");
                crate::tools::RunOutput {
                    exit_code: -1,
                    stdout: String::new(),
                    stderr: e.to_string(),
                }
            }
        };
        report.build_ok = out.success();

        if report.build_ok {
            for task in &ready {
                self.store
                    .advance(&task.id, TaskStatus::CodeWritten, TaskStatus::Build)?;
                report.built += 1;
            }
            tracing::info!(count = report.built, "Consolidated build passed");
            return Ok(());
        }

        tracing::warn!(exit = out.exit_code, "Consolidated build failed");
        let log = format!("{}\n{}", out.stdout, out.stderr);
        let implicated: Vec<String> = ready
            .iter()
            .filter(|t| t.files.iter().any(|f| !f.is_empty() && log.contains(f)))
            .map(|t| t.id.clone())
            .collect();

        for task in &ready {
            let blamed = implicated.is_empty() || implicated.contains(&task.id);
            if blamed {
                let landed = self
                    .store
                    .requeue(&task.id, "build", Some("consolidated build failed"))?;
                if landed == TaskStatus::Failed {
                    report.failed += 1;
                } else {
                    report.requeued += 1;
                }
            } else {
                self.store.return_to_pending(&task.id, "build")?;
                report.requeued += 1;
            }
        }
        Ok(())
    }
}

/// Red->green for one claimed task. Returns true when the task reached
/// `code_written`. All failure paths release the task back to the store,
/// so a false return never leaves the lock held.
async fn work_task(
    store: &TaskStore,
    runner: &dyn CommandRunner,
    generator: &dyn CodeGenerator,
    config: &ForgeConfig,
    task: &Task,
) -> bool {
    let worker = task.lock_owner.as_deref().unwrap_or("worker");
    let test_command = config.test_command.replace("{task_id}", &task.id);

    let release = |outcome: WorkOutcome| {
        if let Err(e) = store.release(&task.id, worker, outcome) {
            tracing::error!(task = %task.id, error = %e, "Failed to release task");
        }
    };

    // Red: the test must run even if it is expected to fail
    let first = match runner.run(&test_command, config.task_timeout()).await {
        Ok(out) => out,
        Err(e) => {
            release(WorkOutcome::Failed(format!("test runner broke: {}", e)));
            return false;
        }
    };
    if first.success() {
        // Already green; nothing to generate
        tracing::debug!(task = %task.id, "Test already passing");
        release(WorkOutcome::CodeWritten);
        return true;
    }

    let mut test_output = format!("{}\n{}", first.stdout, first.stderr);
    let mut last_reason = String::from("red test never went green");

    for attempt in 1..=config.worker_attempts.max(1) {
        let change = match generator.generate(task, &test_output).await {
            Ok(change) => change,
            Err(e) => {
                tracing::warn!(task = %task.id, attempt, error = %e, "Generator failed");
                last_reason = format!("generator failed: {}", e);
                continue;
            }
        };

        if let Err(e) = store.write_payload(&task.id, change.diff.as_bytes()) {
            tracing::error!(task = %task.id, error = %e, "Failed to store payload");
        }
        if !change.files.is_empty() {
            if let Err(e) = store.update_files(&task.id, &change.files) {
                tracing::error!(task = %task.id, error = %e, "Failed to update file list");
            }
        }

        // Green check
        match runner.run(&test_command, config.task_timeout()).await {
            Ok(out) if out.success() => {
                tracing::info!(task = %task.id, attempt, "Task went green");
                release(WorkOutcome::CodeWritten);
                return true;
            }
            Ok(out) => {
                test_output = format!("{}\n{}", out.stdout, out.stderr);
                last_reason = format!("test still red after attempt {}", attempt);
            }
            Err(e) => {
                last_reason = format!("test runner broke: {}", e);
                break;
            }
        }
    }

    release(WorkOutcome::Failed(last_reason));
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{Concern, ForgeDb};
    use crate::tools::{CommandGenerator, ProcessRunner};
    use std::fs;
    use std::path::PathBuf;
    use std::time::Duration;

    struct Fixture {
        scheduler: CycleScheduler,
        store: TaskStore,
        db_path: PathBuf,
        workdir: PathBuf,
        stop: watch::Receiver<bool>,
        _stop_tx: watch::Sender<bool>,
    }

    fn fixture(name: &str, config_tweak: impl FnOnce(&mut ForgeConfig)) -> Fixture {
        let db_path = std::env::temp_dir().join(format!("forge_sched_{}.db", name));
        let _ = fs::remove_file(&db_path);
        let workdir = std::env::temp_dir().join(format!("forge_sched_wd_{}", name));
        let _ = fs::remove_dir_all(&workdir);
        fs::create_dir_all(&workdir).unwrap();

        let db = ForgeDb::open_at(&db_path).unwrap();
        let store = TaskStore::new(&db);
        let runner: Arc<dyn CommandRunner> = Arc::new(ProcessRunner::new(&workdir));

        let mut config = ForgeConfig {
            width: 2,
            batch_size: 4,
            worker_attempts: 2,
            task_timeout_secs: 10,
            cycle_timeout_secs: 60,
            build_timeout_secs: 10,
            // Green means the task's mark file exists; the generator
            // creates it
            test_command: "test -f marks/{task_id}".into(),
            build_command: "true".into(),
            generate_command:
                "mkdir -p marks && touch marks/{task_id} && echo 'diff for {task_id}'".into(),
            ..Default::default()
        };
        config_tweak(&mut config);

        let generator: Arc<dyn CodeGenerator> = Arc::new(CommandGenerator::new(
            Arc::clone(&runner),
            config.generate_command.clone(),
            Duration::from_secs(10),
        ));

        let (stop_tx, stop) = watch::channel(false);
        Fixture {
            scheduler: CycleScheduler::new(store.clone(), runner, generator, config),
            store,
            db_path,
            workdir,
            stop,
            _stop_tx: stop_tx,
        }
    }

    fn cleanup(f: &Fixture) {
        let _ = fs::remove_file(&f.db_path);
        let _ = fs::remove_dir_all(&f.workdir);
    }

    fn feature(id: &str, priority: f64) -> Task {
        Task::new(id, format!("task {}", id))
            .with_concern(Concern::Feature)
            .with_priority(priority)
    }

    #[tokio::test]
    async fn test_full_batch_goes_red_green_build() {
        let f = fixture("batch", |_| {});
        for i in 0..4 {
            f.store.create(&feature(&format!("t{}", i), 1.0)).unwrap();
        }

        let report = f.scheduler.run_cycle(&f.stop).await.unwrap();
        assert_eq!(report.claimed, 4);
        assert_eq!(report.code_written, 4);
        assert_eq!(report.built, 4);
        assert!(report.build_ok);
        assert_eq!(report.failed, 0);

        for i in 0..4 {
            let t = f.store.get(&format!("t{}", i)).unwrap();
            assert_eq!(t.status, TaskStatus::Build);
            assert!(t.lock_owner.is_none());
            // The generated diff is stored for review
            assert!(f.store.read_payload(&t.id).unwrap().is_some());
        }
        cleanup(&f);
    }

    #[tokio::test]
    async fn test_already_green_task_skips_generation() {
        let f = fixture("green", |c| {
            c.test_command = "true".into();
            // A generator call would blow up loudly
            c.generate_command = "exit 7".into();
        });
        f.store.create(&feature("t", 1.0)).unwrap();

        let report = f.scheduler.run_cycle(&f.stop).await.unwrap();
        assert_eq!(report.code_written, 1);
        assert_eq!(f.store.get("t").unwrap().status, TaskStatus::Build);
        // No generator run means no payload
        assert!(f.store.read_payload("t").unwrap().is_none());
        cleanup(&f);
    }

    #[tokio::test]
    async fn test_stubborn_red_test_requeues_with_retry_charge() {
        let f = fixture("stubborn", |c| {
            // Generator "succeeds" but never makes the test pass
            c.generate_command = "echo no-op-diff".into();
        });
        f.store.create(&feature("t", 1.0)).unwrap();

        let report = f.scheduler.run_cycle(&f.stop).await.unwrap();
        assert_eq!(report.claimed, 1);
        assert_eq!(report.code_written, 0);
        assert_eq!(report.failed, 1);

        let t = f.store.get("t").unwrap();
        assert_eq!(t.status, TaskStatus::Pending);
        assert_eq!(t.retry_count, 1);
        assert!(t.lock_owner.is_none());
        cleanup(&f);
    }

    #[tokio::test]
    async fn test_build_failure_requeues_batch_and_leaves_none_stuck() {
        let f = fixture("build_fail", |c| {
            c.build_command = "false".into();
        });
        for i in 0..3 {
            f.store.create(&feature(&format!("t{}", i), 1.0)).unwrap();
        }

        let report = f.scheduler.run_cycle(&f.stop).await.unwrap();
        assert_eq!(report.code_written, 3);
        assert!(!report.build_ok);
        assert_eq!(report.built, 0);
        assert_eq!(report.requeued, 3);

        let counts = f.store.counts_by_status().unwrap();
        assert_eq!(counts.code_written, 0, "no task may be stuck after a failed build");
        assert_eq!(counts.build, 0);
        assert_eq!(counts.pending, 3);
        cleanup(&f);
    }

    #[tokio::test]
    async fn test_build_failure_isolates_implicated_task() {
        let f = fixture("isolate", |c| {
            c.build_command = "echo 'error in src/culprit.rs' && false".into();
        });
        f.store
            .create(&feature("blamed", 2.0).with_files(vec!["src/culprit.rs".into()]))
            .unwrap();
        f.store
            .create(&feature("innocent", 1.0).with_files(vec!["src/fine.rs".into()]))
            .unwrap();

        // Keep the generated file list from clobbering the fixture's
        let report = f.scheduler.run_cycle(&f.stop).await.unwrap();
        assert!(!report.build_ok);

        let blamed = f.store.get("blamed").unwrap();
        let innocent = f.store.get("innocent").unwrap();
        assert_eq!(blamed.status, TaskStatus::Pending);
        assert_eq!(innocent.status, TaskStatus::Pending);
        assert_eq!(blamed.retry_count, 1, "implicated task takes the charge");
        assert_eq!(innocent.retry_count, 0, "uninvolved task is not charged");
        cleanup(&f);
    }

    #[tokio::test]
    async fn test_unscoped_parent_is_never_claimed() {
        let f = fixture("unscoped", |_| {});
        f.store
            .create(&Task::new("umbrella", "big thing").with_priority(99.0))
            .unwrap();

        let report = f.scheduler.run_cycle(&f.stop).await.unwrap();
        assert!(report.idle());
        assert_eq!(
            f.store.get("umbrella").unwrap().status,
            TaskStatus::Pending
        );
        cleanup(&f);
    }

    #[tokio::test]
    async fn test_cycle_settles_finished_parents() {
        let f = fixture("settle", |_| {});
        // A decomposed parent whose children are already done
        f.store.create(&Task::new("p", "umbrella")).unwrap();
        let children: Vec<Task> = ["feature", "guard", "failure"]
            .iter()
            .map(|s| {
                let mut t = feature(&format!("p-{}", s), 1.0);
                t.parent_id = Some("p".into());
                t
            })
            .collect();
        f.store.register_decomposition("p", &children).unwrap();
        for c in &children {
            // Walk each child to done through the legal edges
            f.store.claim("w", &ClaimFilter::default()).unwrap();
            f.store
                .release(&c.id, "w", WorkOutcome::CodeWritten)
                .unwrap();
            f.store
                .advance(&c.id, TaskStatus::CodeWritten, TaskStatus::Build)
                .unwrap();
            f.store
                .advance(&c.id, TaskStatus::Build, TaskStatus::Review)
                .unwrap();
            f.store
                .advance(&c.id, TaskStatus::Review, TaskStatus::Commit)
                .unwrap();
            f.store
                .advance(&c.id, TaskStatus::Commit, TaskStatus::Deploy)
                .unwrap();
            f.store
                .advance(&c.id, TaskStatus::Deploy, TaskStatus::Done)
                .unwrap();
        }

        f.scheduler.run_cycle(&f.stop).await.unwrap();
        assert_eq!(f.store.get("p").unwrap().status, TaskStatus::Done);
        cleanup(&f);
    }
}
