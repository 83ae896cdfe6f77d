//! # Unified Forge Database
//!
//! Single SQLite database for all pipeline state: tasks, their transition
//! history, and per-cycle run records. Lives at `.forge/forge.db`.

use anyhow::{Context, Result};
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Schema version for migrations
const SCHEMA_VERSION: i32 = 1;

/// Database manager for all forge state
pub struct ForgeDb {
    conn: Arc<Mutex<Connection>>,
}

impl ForgeDb {
    /// Open or create the database at `.forge/forge.db`
    pub fn open() -> Result<Self> {
        Self::open_at(".forge/forge.db")
    }

    /// Open the database at a specific path (useful for testing)
    pub fn open_at<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let conn = Connection::open(path.as_ref()).context("Failed to open forge database")?;
        // Claim queries race across processes; busy waits beat hard errors.
        conn.busy_timeout(std::time::Duration::from_secs(30))
            .context("Failed to set busy timeout")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.run_migrations()?;

        Ok(db)
    }

    /// Get the shared connection for use by managers
    pub fn connection(&self) -> Arc<Mutex<Connection>> {
        Arc::clone(&self.conn)
    }

    /// Run schema migrations
    fn run_migrations(&self) -> Result<()> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER PRIMARY KEY)",
            [],
        )?;

        let current_version: i32 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_version",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);

        if current_version < 1 {
            self.migrate_v1(&conn)?;
            conn.execute(
                "INSERT OR REPLACE INTO schema_version (version) VALUES (?1)",
                [1],
            )?;
        }

        Ok(())
    }

    /// Migration to version 1 - complete schema
    fn migrate_v1(&self, conn: &Connection) -> Result<()> {
        // Tasks. The payload is a compressed opaque blob; claim queries
        // index on status/priority/concern and never touch payload bytes.
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                concern TEXT NOT NULL DEFAULT 'unscoped',
                parent_id TEXT,
                status TEXT NOT NULL DEFAULT 'pending',
                priority REAL NOT NULL DEFAULT 0.0,
                complexity INTEGER NOT NULL DEFAULT 1,
                files TEXT NOT NULL DEFAULT '[]',
                dependencies TEXT NOT NULL DEFAULT '[]',
                children TEXT NOT NULL DEFAULT '[]',
                lock_owner TEXT,
                lock_acquired_at TEXT,
                retry_count INTEGER NOT NULL DEFAULT 0,
                max_retries INTEGER NOT NULL DEFAULT 3,
                payload BLOB,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
            [],
        )?;

        // Status history for audit
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS task_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id TEXT NOT NULL,
                from_status TEXT,
                to_status TEXT NOT NULL,
                changed_at TEXT NOT NULL,
                changed_by TEXT,
                metadata TEXT,
                FOREIGN KEY (task_id) REFERENCES tasks(id)
            )
            "#,
            [],
        )?;

        // One row per scheduler cycle, feeding the status/history interface
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS cycles (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                started_at TEXT NOT NULL,
                finished_at TEXT,
                claimed INTEGER NOT NULL DEFAULT 0,
                code_written INTEGER NOT NULL DEFAULT 0,
                built INTEGER NOT NULL DEFAULT 0,
                promoted INTEGER NOT NULL DEFAULT 0,
                requeued INTEGER NOT NULL DEFAULT 0,
                failed INTEGER NOT NULL DEFAULT 0,
                build_ok INTEGER NOT NULL DEFAULT 0
            )
            "#,
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_tasks_priority ON tasks(priority DESC)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_tasks_parent ON tasks(parent_id)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_history_task ON task_history(task_id)",
            [],
        )?;

        tracing::info!("ForgeDb initialized with schema version {}", SCHEMA_VERSION);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_forge_db_open_creates_tables() {
        let path = std::env::temp_dir().join("forge_test_open.db");
        let _ = fs::remove_file(&path);

        let db = ForgeDb::open_at(&path).unwrap();
        let conn = db.connection();
        let conn = conn.lock().unwrap();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .filter_map(|r| r.ok())
            .collect();

        assert!(tables.contains(&"tasks".to_string()));
        assert!(tables.contains(&"task_history".to_string()));
        assert!(tables.contains(&"cycles".to_string()));

        drop(conn);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_schema_version_tracking() {
        let path = std::env::temp_dir().join("forge_test_version.db");
        let _ = fs::remove_file(&path);

        // Open twice - should not fail on second open
        let db1 = ForgeDb::open_at(&path).unwrap();
        drop(db1);

        let db2 = ForgeDb::open_at(&path).unwrap();
        let conn = db2.connection();
        let conn = conn.lock().unwrap();

        let version: i32 = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |row| {
                row.get(0)
            })
            .unwrap();

        assert_eq!(version, SCHEMA_VERSION);

        drop(conn);
        let _ = fs::remove_file(&path);
    }
}
