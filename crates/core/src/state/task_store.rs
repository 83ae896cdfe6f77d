//! # Task Store
//!
//! Persistent task state machine over the shared SQLite connection. All
//! status movement funnels through compare-and-swap updates so that
//! concurrent workers (in this process or another) can never double-claim
//! or double-advance a task, and every movement leaves an audit row in
//! `task_history`.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::io::{Read, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::{ForgeError, Result};
use crate::state::db::ForgeDb;
use crate::state::task::{Concern, Task, TaskStatus};

const TASK_COLUMNS: &str = "id, title, description, concern, parent_id, status, priority, \
     complexity, files, dependencies, children, lock_owner, lock_acquired_at, \
     retry_count, max_retries, created_at, updated_at";

/// How a worker hands a claimed task back
#[derive(Debug, Clone)]
pub enum WorkOutcome {
    /// The change passed its local test; promote to `code_written`
    CodeWritten,
    /// The red->green loop gave up; requeue or park as failed
    Failed(String),
}

/// Narrowing applied when claiming the next task
#[derive(Debug, Clone, Default)]
pub struct ClaimFilter {
    pub concern: Option<Concern>,
}

/// One audit row from `task_history`
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub task_id: String,
    pub from_status: Option<TaskStatus>,
    pub to_status: TaskStatus,
    pub changed_at: DateTime<Utc>,
    pub changed_by: Option<String>,
    pub metadata: Option<String>,
}

/// Task counts per status, for the status interface
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct StatusCounts {
    pub pending: u64,
    pub locked: u64,
    pub in_progress: u64,
    pub code_written: u64,
    pub build: u64,
    pub review: u64,
    pub commit: u64,
    pub deploy: u64,
    pub done: u64,
    pub failed: u64,
}

impl StatusCounts {
    pub fn total(&self) -> u64 {
        self.pending
            + self.locked
            + self.in_progress
            + self.code_written
            + self.build
            + self.review
            + self.commit
            + self.deploy
            + self.done
            + self.failed
    }
}

/// Summary of one scheduler cycle, persisted to `cycles`
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct CycleRecord {
    pub started_at: String,
    pub finished_at: Option<String>,
    pub claimed: u64,
    pub code_written: u64,
    pub built: u64,
    pub promoted: u64,
    pub requeued: u64,
    pub failed: u64,
    pub build_ok: bool,
}

/// Manager for the `tasks` table and its audit trail
#[derive(Clone)]
pub struct TaskStore {
    conn: Arc<Mutex<Connection>>,
}

impl TaskStore {
    pub fn new(db: &ForgeDb) -> Self {
        Self {
            conn: db.connection(),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| ForgeError::LockPoisoned)
    }

    /// Insert a new task. The id must be unique.
    pub fn create(&self, task: &Task) -> Result<()> {
        let conn = self.lock()?;
        Self::create_in(&conn, task, "create")
    }

    fn create_in(conn: &Connection, task: &Task, changed_by: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        conn.execute(
            r#"
            INSERT INTO tasks (
                id, title, description, concern, parent_id, status, priority,
                complexity, files, dependencies, children, lock_owner,
                lock_acquired_at, retry_count, max_retries, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, NULL, NULL, ?12, ?13, ?14, ?14)
            "#,
            params![
                task.id,
                task.title,
                task.description,
                task.concern.as_str(),
                task.parent_id,
                task.status.as_str(),
                task.priority,
                task.complexity,
                serde_json::to_string(&task.files).unwrap_or_else(|_| "[]".into()),
                serde_json::to_string(&task.dependencies).unwrap_or_else(|_| "[]".into()),
                serde_json::to_string(&task.children).unwrap_or_else(|_| "[]".into()),
                task.retry_count,
                task.max_retries,
                now,
            ],
        )?;
        Self::record_history_in(conn, &task.id, None, task.status, changed_by, None)?;
        Ok(())
    }

    /// Fetch a task by id
    pub fn get(&self, task_id: &str) -> Result<Task> {
        let conn = self.lock()?;
        Self::get_in(&conn, task_id)
    }

    fn get_in(conn: &Connection, task_id: &str) -> Result<Task> {
        let sql = format!("SELECT {} FROM tasks WHERE id = ?1", TASK_COLUMNS);
        let task = conn
            .query_row(&sql, params![task_id], Self::map_row)
            .optional()?;
        match task {
            Some(raw) => Self::hydrate(raw),
            None => Err(ForgeError::TaskNotFound(task_id.to_string())),
        }
    }

    /// Claim the highest-priority eligible pending task for `worker_id`.
    ///
    /// Eligible means concern-scoped (never unscoped), not decomposed, and
    /// with every dependency already done. The claim itself is a
    /// compare-and-swap on `status = 'pending'`; losing the race just moves
    /// on to the next candidate. The returned task is already `in_progress`.
    pub fn claim(&self, worker_id: &str, filter: &ClaimFilter) -> Result<Task> {
        let conn = self.lock()?;

        let base = format!(
            "SELECT {} FROM tasks \
             WHERE status = 'pending' AND concern != 'unscoped' AND children = '[]'",
            TASK_COLUMNS
        );
        let raws: Vec<RawTask> = match filter.concern {
            Some(c) => {
                let sql = format!(
                    "{} AND concern = ?1 ORDER BY priority DESC, created_at ASC",
                    base
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map(params![c.as_str()], Self::map_row)?;
                rows.collect::<std::result::Result<_, _>>()?
            }
            None => {
                let sql = format!("{} ORDER BY priority DESC, created_at ASC", base);
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map([], Self::map_row)?;
                rows.collect::<std::result::Result<_, _>>()?
            }
        };

        for raw in raws {
            let candidate = Self::hydrate(raw)?;
            if !Self::dependencies_done(&conn, &candidate)? {
                continue;
            }

            let now = Utc::now().to_rfc3339();
            let affected = conn.execute(
                "UPDATE tasks SET status = 'locked', lock_owner = ?1, \
                 lock_acquired_at = ?2, updated_at = ?2 \
                 WHERE id = ?3 AND status = 'pending'",
                params![worker_id, now, candidate.id],
            )?;
            if affected != 1 {
                // Lost the race to another worker
                continue;
            }
            Self::record_history_in(
                &conn,
                &candidate.id,
                Some(TaskStatus::Pending),
                TaskStatus::Locked,
                worker_id,
                None,
            )?;

            conn.execute(
                "UPDATE tasks SET status = 'in_progress', updated_at = ?1 WHERE id = ?2",
                params![Utc::now().to_rfc3339(), candidate.id],
            )?;
            Self::record_history_in(
                &conn,
                &candidate.id,
                Some(TaskStatus::Locked),
                TaskStatus::InProgress,
                worker_id,
                None,
            )?;

            return Self::get_in(&conn, &candidate.id);
        }

        Err(ForgeError::NoEligibleTask)
    }

    fn dependencies_done(conn: &Connection, task: &Task) -> Result<bool> {
        for dep in &task.dependencies {
            let status: Option<String> = conn
                .query_row(
                    "SELECT status FROM tasks WHERE id = ?1",
                    params![dep],
                    |row| row.get(0),
                )
                .optional()?;
            match status.as_deref() {
                Some("done") => {}
                // Missing or unfinished dependency blocks the claim
                _ => return Ok(false),
            }
        }
        Ok(true)
    }

    /// Hand a claimed task back, clearing its lock
    pub fn release(&self, task_id: &str, worker_id: &str, outcome: WorkOutcome) -> Result<()> {
        let conn = self.lock()?;
        let task = Self::get_in(&conn, task_id)?;
        if task.status != TaskStatus::InProgress {
            return Err(ForgeError::StaleStatus {
                task_id: task_id.to_string(),
                expected: TaskStatus::InProgress,
                actual: task.status,
            });
        }

        match outcome {
            WorkOutcome::CodeWritten => {
                conn.execute(
                    "UPDATE tasks SET status = 'code_written', lock_owner = NULL, \
                     lock_acquired_at = NULL, updated_at = ?1 WHERE id = ?2",
                    params![Utc::now().to_rfc3339(), task_id],
                )?;
                Self::record_history_in(
                    &conn,
                    task_id,
                    Some(TaskStatus::InProgress),
                    TaskStatus::CodeWritten,
                    worker_id,
                    None,
                )?;
            }
            WorkOutcome::Failed(reason) => {
                Self::requeue_in(&conn, &task, worker_id, Some(&reason))?;
            }
        }
        Ok(())
    }

    /// Compare-and-swap a task along a legal edge of the state machine
    pub fn advance(&self, task_id: &str, from: TaskStatus, to: TaskStatus) -> Result<()> {
        if !from.can_transition(to) {
            return Err(ForgeError::InvalidTransition {
                task_id: task_id.to_string(),
                from,
                to,
            });
        }
        let conn = self.lock()?;
        Self::transition_in(&conn, task_id, from, to, "pipeline", None)
    }

    fn transition_in(
        conn: &Connection,
        task_id: &str,
        from: TaskStatus,
        to: TaskStatus,
        changed_by: &str,
        metadata: Option<&str>,
    ) -> Result<()> {
        let affected = conn.execute(
            "UPDATE tasks SET status = ?1, updated_at = ?2 WHERE id = ?3 AND status = ?4",
            params![
                to.as_str(),
                Utc::now().to_rfc3339(),
                task_id,
                from.as_str()
            ],
        )?;
        if affected != 1 {
            let actual = Self::get_in(conn, task_id)?.status;
            return Err(ForgeError::StaleStatus {
                task_id: task_id.to_string(),
                expected: from,
                actual,
            });
        }
        Self::record_history_in(conn, task_id, Some(from), to, changed_by, metadata)
    }

    /// Requeue after a recoverable failure: retry count goes up, and the
    /// task goes back to `pending` unless the budget is spent, in which
    /// case it parks as `failed`.
    pub fn requeue(&self, task_id: &str, changed_by: &str, reason: Option<&str>) -> Result<TaskStatus> {
        let conn = self.lock()?;
        let task = Self::get_in(&conn, task_id)?;
        Self::requeue_in(&conn, &task, changed_by, reason)
    }

    fn requeue_in(
        conn: &Connection,
        task: &Task,
        changed_by: &str,
        reason: Option<&str>,
    ) -> Result<TaskStatus> {
        if task.status.is_terminal() && task.status != TaskStatus::Failed {
            return Err(ForgeError::InvalidTransition {
                task_id: task.id.clone(),
                from: task.status,
                to: TaskStatus::Pending,
            });
        }

        let target = if task.retries_remaining() {
            TaskStatus::Pending
        } else {
            TaskStatus::Failed
        };

        conn.execute(
            "UPDATE tasks SET status = ?1, retry_count = retry_count + 1, \
             lock_owner = NULL, lock_acquired_at = NULL, updated_at = ?2 \
             WHERE id = ?3",
            params![target.as_str(), Utc::now().to_rfc3339(), task.id],
        )?;
        Self::record_history_in(conn, &task.id, Some(task.status), target, changed_by, reason)?;
        Ok(target)
    }

    /// Return a task to `pending` without charging its retry budget. Used
    /// for batch members swept up in someone else's build failure.
    pub fn return_to_pending(&self, task_id: &str, changed_by: &str) -> Result<()> {
        let conn = self.lock()?;
        let task = Self::get_in(&conn, task_id)?;
        if !task.status.can_transition(TaskStatus::Pending) {
            return Err(ForgeError::InvalidTransition {
                task_id: task_id.to_string(),
                from: task.status,
                to: TaskStatus::Pending,
            });
        }
        conn.execute(
            "UPDATE tasks SET status = 'pending', lock_owner = NULL, \
             lock_acquired_at = NULL, updated_at = ?1 WHERE id = ?2",
            params![Utc::now().to_rfc3339(), task_id],
        )?;
        Self::record_history_in(
            &conn,
            task_id,
            Some(task.status),
            TaskStatus::Pending,
            changed_by,
            None,
        )
    }

    /// Operator reset: put a failed task back in the queue with a fresh
    /// retry budget. Automatic requeues never do this.
    pub fn requeue_failed(&self, task_id: &str, changed_by: &str) -> Result<()> {
        let conn = self.lock()?;
        let task = Self::get_in(&conn, task_id)?;
        if task.status != TaskStatus::Failed {
            return Err(ForgeError::InvalidTransition {
                task_id: task_id.to_string(),
                from: task.status,
                to: TaskStatus::Pending,
            });
        }
        conn.execute(
            "UPDATE tasks SET status = 'pending', retry_count = 0, \
             lock_owner = NULL, lock_acquired_at = NULL, updated_at = ?1 \
             WHERE id = ?2",
            params![Utc::now().to_rfc3339(), task_id],
        )?;
        Self::record_history_in(
            &conn,
            task_id,
            Some(TaskStatus::Failed),
            TaskStatus::Pending,
            changed_by,
            Some("retry budget reset"),
        )
    }

    /// Park a task as failed from any non-terminal state
    pub fn fail(&self, task_id: &str, changed_by: &str, reason: &str) -> Result<()> {
        let conn = self.lock()?;
        let task = Self::get_in(&conn, task_id)?;
        if task.status.is_terminal() {
            return Err(ForgeError::InvalidTransition {
                task_id: task_id.to_string(),
                from: task.status,
                to: TaskStatus::Failed,
            });
        }
        conn.execute(
            "UPDATE tasks SET status = 'failed', lock_owner = NULL, \
             lock_acquired_at = NULL, updated_at = ?1 WHERE id = ?2",
            params![Utc::now().to_rfc3339(), task_id],
        )?;
        Self::record_history_in(
            &conn,
            task_id,
            Some(task.status),
            TaskStatus::Failed,
            changed_by,
            Some(reason),
        )
    }

    /// Reclaim tasks whose lock holder went quiet. Each reaped task is
    /// requeued exactly once (one retry increment per reap), and the ids
    /// are returned for logging.
    pub fn reap_stale_locks(&self, max_age: Duration) -> Result<Vec<String>> {
        let conn = self.lock()?;
        let cutoff = (Utc::now()
            - ChronoDuration::from_std(max_age).unwrap_or_else(|_| ChronoDuration::minutes(15)))
        .to_rfc3339();

        let sql = format!(
            "SELECT {} FROM tasks \
             WHERE status IN ('locked', 'in_progress') \
             AND lock_acquired_at IS NOT NULL AND lock_acquired_at < ?1",
            TASK_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let raws: Vec<RawTask> = stmt
            .query_map(params![cutoff], Self::map_row)?
            .collect::<std::result::Result<_, _>>()?;
        drop(stmt);

        let mut reaped = Vec::new();
        for raw in raws {
            let task = Self::hydrate(raw)?;
            Self::requeue_in(&conn, &task, "reaper", Some("stale lock reclaimed"))?;
            reaped.push(task.id);
        }
        Ok(reaped)
    }

    /// Record a decomposition: insert the children and mark the parent.
    /// The parent keeps its row and completes by fan-in once every child
    /// is done.
    pub fn register_decomposition(&self, parent_id: &str, children: &[Task]) -> Result<()> {
        let conn = self.lock()?;
        let parent = Self::get_in(&conn, parent_id)?;
        if parent.is_decomposed() {
            return Err(ForgeError::AlreadyDecomposed(parent_id.to_string()));
        }

        for child in children {
            Self::create_in(&conn, child, "decompose")?;
        }

        let child_ids: Vec<&str> = children.iter().map(|c| c.id.as_str()).collect();
        let ids_json = serde_json::to_string(&child_ids).unwrap_or_else(|_| "[]".into());
        conn.execute(
            "UPDATE tasks SET children = ?1, dependencies = ?1, updated_at = ?2 WHERE id = ?3",
            params![ids_json, Utc::now().to_rfc3339(), parent_id],
        )?;
        Ok(())
    }

    /// Fan-in pass: complete every decomposed parent whose children are all
    /// done. Returns the ids of the parents settled. Parents never execute,
    /// so this is the only path that takes them to `done`.
    pub fn settle_decomposed(&self) -> Result<Vec<String>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {} FROM tasks WHERE status = 'pending' AND children != '[]'",
            TASK_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let raws: Vec<RawTask> = stmt
            .query_map([], Self::map_row)?
            .collect::<std::result::Result<_, _>>()?;
        drop(stmt);

        let mut settled = Vec::new();
        for raw in raws {
            let parent = Self::hydrate(raw)?;
            let mut all_done = true;
            for child_id in &parent.children {
                let child = Self::get_in(&conn, child_id)?;
                if child.status != TaskStatus::Done {
                    all_done = false;
                    break;
                }
            }
            if !all_done {
                continue;
            }
            let affected = conn.execute(
                "UPDATE tasks SET status = 'done', updated_at = ?1 \
                 WHERE id = ?2 AND status = 'pending'",
                params![Utc::now().to_rfc3339(), parent.id],
            )?;
            if affected == 1 {
                Self::record_history_in(
                    &conn,
                    &parent.id,
                    Some(TaskStatus::Pending),
                    TaskStatus::Done,
                    "fan_in",
                    None,
                )?;
                settled.push(parent.id);
            }
        }
        Ok(settled)
    }

    /// Store the task's working payload (diff text etc.), gzip-compressed
    pub fn write_payload(&self, task_id: &str, payload: &[u8]) -> Result<()> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(payload)?;
        let compressed = encoder.finish()?;

        let conn = self.lock()?;
        let affected = conn.execute(
            "UPDATE tasks SET payload = ?1, updated_at = ?2 WHERE id = ?3",
            params![compressed, Utc::now().to_rfc3339(), task_id],
        )?;
        if affected != 1 {
            return Err(ForgeError::TaskNotFound(task_id.to_string()));
        }
        Ok(())
    }

    /// Read back a task's payload, if any
    pub fn read_payload(&self, task_id: &str) -> Result<Option<Vec<u8>>> {
        let conn = self.lock()?;
        let blob: Option<Option<Vec<u8>>> = conn
            .query_row(
                "SELECT payload FROM tasks WHERE id = ?1",
                params![task_id],
                |row| row.get(0),
            )
            .optional()?;
        let blob = match blob {
            None => return Err(ForgeError::TaskNotFound(task_id.to_string())),
            Some(None) => return Ok(None),
            Some(Some(b)) => b,
        };

        let mut decoder = GzDecoder::new(blob.as_slice());
        let mut out = Vec::new();
        decoder
            .read_to_end(&mut out)
            .map_err(|e| ForgeError::CorruptRecord {
                task_id: task_id.to_string(),
                column: "payload".into(),
                detail: e.to_string(),
            })?;
        Ok(Some(out))
    }

    /// Replace the task's expected file list
    pub fn update_files(&self, task_id: &str, files: &[String]) -> Result<()> {
        let conn = self.lock()?;
        let affected = conn.execute(
            "UPDATE tasks SET files = ?1, updated_at = ?2 WHERE id = ?3",
            params![
                serde_json::to_string(files).unwrap_or_else(|_| "[]".into()),
                Utc::now().to_rfc3339(),
                task_id
            ],
        )?;
        if affected != 1 {
            return Err(ForgeError::TaskNotFound(task_id.to_string()));
        }
        Ok(())
    }

    /// Count tasks per status
    pub fn counts_by_status(&self) -> Result<StatusCounts> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM tasks GROUP BY status")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, u64>(1)?))
        })?;

        let mut counts = StatusCounts::default();
        for row in rows {
            let (status, n) = row?;
            match status.as_str() {
                "pending" => counts.pending = n,
                "locked" => counts.locked = n,
                "in_progress" => counts.in_progress = n,
                "code_written" => counts.code_written = n,
                "build" => counts.build = n,
                "review" => counts.review = n,
                "commit" => counts.commit = n,
                "deploy" => counts.deploy = n,
                "done" => counts.done = n,
                "failed" => counts.failed = n,
                _ => {}
            }
        }
        Ok(counts)
    }

    /// Count tasks per concern facet
    pub fn counts_by_concern(&self) -> Result<Vec<(Concern, u64)>> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT concern, COUNT(*) FROM tasks GROUP BY concern ORDER BY concern")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, u64>(1)?))
        })?;

        let mut counts = Vec::new();
        for row in rows {
            let (concern, n) = row?;
            if let Some(c) = Concern::parse(&concern) {
                counts.push((c, n));
            }
        }
        Ok(counts)
    }

    /// List tasks in a given status, highest priority first
    pub fn list_by_status(&self, status: TaskStatus) -> Result<Vec<Task>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {} FROM tasks WHERE status = ?1 ORDER BY priority DESC, created_at ASC",
            TASK_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let raws: Vec<RawTask> = stmt
            .query_map(params![status.as_str()], Self::map_row)?
            .collect::<std::result::Result<_, _>>()?;
        drop(stmt);
        raws.into_iter().map(Self::hydrate).collect()
    }

    /// Audit trail for one task, oldest first
    pub fn history(&self, task_id: &str) -> Result<Vec<HistoryEntry>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT task_id, from_status, to_status, changed_at, changed_by, metadata \
             FROM task_history WHERE task_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![task_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Option<String>>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, Option<String>>(5)?,
            ))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (task_id, from, to, changed_at, changed_by, metadata) = row?;
            let to_status =
                TaskStatus::parse(&to).ok_or_else(|| ForgeError::CorruptRecord {
                    task_id: task_id.clone(),
                    column: "to_status".into(),
                    detail: to.clone(),
                })?;
            entries.push(HistoryEntry {
                task_id,
                from_status: from.as_deref().and_then(TaskStatus::parse),
                to_status,
                changed_at: parse_timestamp(&changed_at)?,
                changed_by,
                metadata,
            });
        }
        Ok(entries)
    }

    /// Persist a cycle summary
    pub fn record_cycle(&self, record: &CycleRecord) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO cycles (started_at, finished_at, claimed, code_written, \
             built, promoted, requeued, failed, build_ok) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                record.started_at,
                record.finished_at,
                record.claimed,
                record.code_written,
                record.built,
                record.promoted,
                record.requeued,
                record.failed,
                record.build_ok as i64,
            ],
        )?;
        Ok(())
    }

    /// Most recent cycle summaries, newest first
    pub fn cycles(&self, limit: u32) -> Result<Vec<CycleRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT started_at, finished_at, claimed, code_written, built, \
             promoted, requeued, failed, build_ok \
             FROM cycles ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit], |row| {
            Ok(CycleRecord {
                started_at: row.get(0)?,
                finished_at: row.get(1)?,
                claimed: row.get(2)?,
                code_written: row.get(3)?,
                built: row.get(4)?,
                promoted: row.get(5)?,
                requeued: row.get(6)?,
                failed: row.get(7)?,
                build_ok: row.get::<_, i64>(8)? != 0,
            })
        })?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(ForgeError::from)
    }

    fn record_history_in(
        conn: &Connection,
        task_id: &str,
        from: Option<TaskStatus>,
        to: TaskStatus,
        changed_by: &str,
        metadata: Option<&str>,
    ) -> Result<()> {
        conn.execute(
            "INSERT INTO task_history (task_id, from_status, to_status, changed_at, changed_by, metadata) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                task_id,
                from.map(|s| s.as_str()),
                to.as_str(),
                Utc::now().to_rfc3339(),
                changed_by,
                metadata,
            ],
        )?;
        Ok(())
    }

    fn map_row(row: &Row<'_>) -> rusqlite::Result<RawTask> {
        Ok(RawTask {
            id: row.get(0)?,
            title: row.get(1)?,
            description: row.get(2)?,
            concern: row.get(3)?,
            parent_id: row.get(4)?,
            status: row.get(5)?,
            priority: row.get(6)?,
            complexity: row.get(7)?,
            files: row.get(8)?,
            dependencies: row.get(9)?,
            children: row.get(10)?,
            lock_owner: row.get(11)?,
            lock_acquired_at: row.get(12)?,
            retry_count: row.get(13)?,
            max_retries: row.get(14)?,
            created_at: row.get(15)?,
            updated_at: row.get(16)?,
        })
    }

    fn hydrate(raw: RawTask) -> Result<Task> {
        let corrupt = |column: &str, detail: String| ForgeError::CorruptRecord {
            task_id: raw.id.clone(),
            column: column.to_string(),
            detail,
        };

        let concern =
            Concern::parse(&raw.concern).ok_or_else(|| corrupt("concern", raw.concern.clone()))?;
        let status =
            TaskStatus::parse(&raw.status).ok_or_else(|| corrupt("status", raw.status.clone()))?;
        let files: Vec<String> =
            serde_json::from_str(&raw.files).map_err(|e| corrupt("files", e.to_string()))?;
        let dependencies: Vec<String> = serde_json::from_str(&raw.dependencies)
            .map_err(|e| corrupt("dependencies", e.to_string()))?;
        let children: Vec<String> =
            serde_json::from_str(&raw.children).map_err(|e| corrupt("children", e.to_string()))?;
        let lock_acquired_at = match &raw.lock_acquired_at {
            Some(s) => Some(parse_timestamp(s)?),
            None => None,
        };

        Ok(Task {
            id: raw.id.clone(),
            title: raw.title,
            description: raw.description,
            concern,
            parent_id: raw.parent_id,
            status,
            priority: raw.priority,
            complexity: raw.complexity,
            files,
            dependencies,
            children,
            lock_owner: raw.lock_owner,
            lock_acquired_at,
            retry_count: raw.retry_count,
            max_retries: raw.max_retries,
            created_at: parse_timestamp(&raw.created_at)?,
            updated_at: parse_timestamp(&raw.updated_at)?,
        })
    }
}

struct RawTask {
    id: String,
    title: String,
    description: String,
    concern: String,
    parent_id: Option<String>,
    status: String,
    priority: f64,
    complexity: u32,
    files: String,
    dependencies: String,
    children: String,
    lock_owner: Option<String>,
    lock_acquired_at: Option<String>,
    retry_count: u32,
    max_retries: u32,
    created_at: String,
    updated_at: String,
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| ForgeError::CorruptRecord {
            task_id: String::new(),
            column: "timestamp".into(),
            detail: format!("{}: {}", s, e),
        })
}
