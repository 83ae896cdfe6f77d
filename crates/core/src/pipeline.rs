//! # Pipeline Controller
//!
//! Owns the outer loop: cycle, review gate, delivery. Emits events over an
//! optional channel for observers and exposes a stop signal that takes
//! effect at task boundaries.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

use crate::config::ForgeConfig;
use crate::error::Result;
use crate::review::ReviewCascade;
use crate::scheduler::{CycleReport, CycleScheduler};
use crate::state::{generate_task_id, Concern, CycleRecord, StatusCounts, TaskStatus, TaskStore};
use crate::tools::DeliveryClient;

/// Events emitted by the running pipeline
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineEventKind {
    Started,
    CycleFinished,
    TaskPromoted,
    TaskDone,
    TaskFailed,
    Idle,
    Stopped,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineEvent {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub kind: PipelineEventKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl PipelineEvent {
    pub fn new(kind: PipelineEventKind) -> Self {
        Self {
            id: generate_task_id(),
            timestamp: Utc::now(),
            kind,
            task_id: None,
            data: None,
        }
    }

    pub fn with_task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Snapshot for the status interface
#[derive(Debug, Serialize)]
pub struct PipelineStatus {
    pub counts: StatusCounts,
    pub by_concern: Vec<(Concern, u64)>,
    pub recent_cycles: Vec<CycleRecord>,
}

/// Totals across one `run` invocation
#[derive(Debug, Default)]
pub struct RunSummary {
    pub cycles: u64,
    pub promoted: u64,
    pub delivered: u64,
    pub failed: u64,
}

/// Top-level orchestrator
pub struct PipelineController {
    store: TaskStore,
    scheduler: CycleScheduler,
    cascade: ReviewCascade,
    delivery: Arc<dyn DeliveryClient>,
    config: ForgeConfig,
    event_tx: Option<mpsc::Sender<PipelineEvent>>,
    stop_tx: watch::Sender<bool>,
    stop_rx: watch::Receiver<bool>,
}

impl PipelineController {
    pub fn new(
        store: TaskStore,
        scheduler: CycleScheduler,
        cascade: ReviewCascade,
        delivery: Arc<dyn DeliveryClient>,
        config: ForgeConfig,
    ) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        Self {
            store,
            scheduler,
            cascade,
            delivery,
            config,
            event_tx: None,
            stop_tx,
            stop_rx,
        }
    }

    pub fn with_event_channel(mut self, tx: mpsc::Sender<PipelineEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    /// Request a stop; honored at the next task boundary
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    /// A handle observers can use to stop the pipeline from another task
    pub fn stop_handle(&self) -> watch::Sender<bool> {
        self.stop_tx.clone()
    }

    async fn emit(&self, event: PipelineEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(event).await;
        }
    }

    /// Run cycles until the queue drains (or forever in continuous mode),
    /// the stop signal flips, or `max_cycles` is reached.
    pub async fn run(&self, max_cycles: Option<u64>) -> Result<RunSummary> {
        let mut summary = RunSummary::default();
        self.emit(PipelineEvent::new(PipelineEventKind::Started)).await;

        loop {
            if *self.stop_rx.borrow() {
                break;
            }

            let report = self.scheduler.run_cycle(&self.stop_rx).await?;
            let gate = self.cascade.gate(&self.store).await?;
            summary.promoted += gate.promoted.len() as u64;
            for id in &gate.promoted {
                self.emit(PipelineEvent::new(PipelineEventKind::TaskPromoted).with_task(id))
                    .await;
            }

            let (delivered, delivery_failed) = self.deliver().await?;
            summary.delivered += delivered;
            summary.failed += delivery_failed + report.failed as u64 + gate.parked.len() as u64;

            self.persist_cycle(&report, gate.promoted.len() as u64)?;
            summary.cycles += 1;
            self.emit(
                PipelineEvent::new(PipelineEventKind::CycleFinished).with_data(serde_json::json!({
                    "claimed": report.claimed,
                    "code_written": report.code_written,
                    "built": report.built,
                    "promoted": gate.promoted.len(),
                    "build_ok": report.build_ok,
                })),
            )
            .await;

            if let Some(max) = max_cycles {
                if summary.cycles >= max {
                    break;
                }
            }

            if report.idle() && gate.promoted.is_empty() {
                if self.config.continuous {
                    self.emit(PipelineEvent::new(PipelineEventKind::Idle)).await;
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.poll_interval()) => {}
                        _ = async {
                            let mut rx = self.stop_rx.clone();
                            let _ = rx.changed().await;
                        } => {}
                    }
                } else {
                    break;
                }
            }
        }

        self.emit(PipelineEvent::new(PipelineEventKind::Stopped)).await;
        tracing::info!(
            cycles = summary.cycles,
            promoted = summary.promoted,
            delivered = summary.delivered,
            failed = summary.failed,
            "Pipeline run finished"
        );
        Ok(summary)
    }

    /// Commit and deploy every task that cleared review. A delivery error
    /// parks the task as failed; it does not stop the rest of the batch.
    async fn deliver(&self) -> Result<(u64, u64)> {
        let mut delivered = 0u64;
        let mut failed = 0u64;
        for task in self.store.list_by_status(TaskStatus::Commit)? {
            let result = async {
                self.delivery.commit(&task).await?;
                self.store
                    .advance(&task.id, TaskStatus::Commit, TaskStatus::Deploy)
                    .map_err(anyhow::Error::from)?;
                self.delivery.deploy(&task).await?;
                self.store
                    .advance(&task.id, TaskStatus::Deploy, TaskStatus::Done)
                    .map_err(anyhow::Error::from)?;
                Ok::<_, anyhow::Error>(())
            }
            .await;

            match result {
                Ok(()) => {
                    delivered += 1;
                    self.emit(PipelineEvent::new(PipelineEventKind::TaskDone).with_task(&task.id))
                        .await;
                }
                Err(e) => {
                    tracing::error!(task = %task.id, error = %e, "Delivery failed");
                    // The task may already be in deploy when deploy breaks
                    self.store.fail(&task.id, "delivery", &e.to_string())?;
                    failed += 1;
                    self.emit(
                        PipelineEvent::new(PipelineEventKind::TaskFailed)
                            .with_task(&task.id)
                            .with_data(serde_json::json!({ "reason": e.to_string() })),
                    )
                    .await;
                }
            }
        }
        Ok((delivered, failed))
    }

    fn persist_cycle(&self, report: &CycleReport, promoted: u64) -> Result<()> {
        self.store.record_cycle(&CycleRecord {
            started_at: report.started_at.clone(),
            finished_at: Some(Utc::now().to_rfc3339()),
            claimed: report.claimed as u64,
            code_written: report.code_written as u64,
            built: report.built as u64,
            promoted,
            requeued: report.requeued as u64,
            failed: report.failed as u64,
            build_ok: report.build_ok,
        })
    }

    /// Current queue counts and recent cycle summaries
    pub fn status(&self) -> Result<PipelineStatus> {
        Ok(PipelineStatus {
            counts: self.store.counts_by_status()?,
            by_concern: self.store.counts_by_concern()?,
            recent_cycles: self.store.cycles(10)?,
        })
    }
}
