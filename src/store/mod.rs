//! SQLite persistence for runs, steps, the usage ledger and checkpoints.
//!
//! One connection is shared by every run in the process. Async code goes
//! through [`DbHandle`], which moves each access onto tokio's blocking pool.

pub mod checkpoints;
pub mod ledger;
pub mod runs;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::Connection;

/// Async-safe handle to the Steward database.
///
/// Wraps `StewardDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, so synchronous SQLite I/O never
/// ties up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<StewardDb>>,
}

impl DbHandle {
    pub fn new(db: StewardDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Open the database file at `path` and wrap it.
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self::new(StewardDb::new(path)?))
    }

    /// In-memory database, used by tests.
    pub fn in_memory() -> Result<Self> {
        Ok(Self::new(StewardDb::new_in_memory()?))
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&StewardDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

    /// Acquire the database mutex synchronously. Used by CLI commands that
    /// only read, and by tests. Never call this from a hot async path.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, StewardDb>> {
        self.inner
            .lock()
            .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))
    }
}

pub struct StewardDb {
    conn: Connection,
}

impl StewardDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON; PRAGMA busy_timeout = 5000;")
            .context("Failed to configure connection")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS workflow_runs (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    work_item_id TEXT NOT NULL,
                    work_item TEXT NOT NULL,
                    plan TEXT NOT NULL,
                    complexity TEXT NOT NULL,
                    current_step INTEGER NOT NULL DEFAULT 0,
                    status TEXT NOT NULL DEFAULT 'pending',
                    reason TEXT,
                    resumed_from INTEGER REFERENCES workflow_runs(id),
                    cancel_requested INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL,
                    started_at TEXT,
                    finished_at TEXT,
                    last_heartbeat TEXT
                );

                CREATE TABLE IF NOT EXISTS steps (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    run_id INTEGER NOT NULL REFERENCES workflow_runs(id),
                    seq INTEGER NOT NULL,
                    plan_index INTEGER NOT NULL,
                    role TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'pending',
                    input_summary TEXT NOT NULL DEFAULT '',
                    output_summary TEXT,
                    escalation_reason TEXT,
                    error_code TEXT,
                    artifact_accepted INTEGER,
                    started_at TEXT,
                    finished_at TEXT,
                    UNIQUE(run_id, seq)
                );

                CREATE TABLE IF NOT EXISTS model_calls (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    run_id INTEGER NOT NULL REFERENCES workflow_runs(id),
                    step_id INTEGER REFERENCES steps(id),
                    model TEXT NOT NULL,
                    prompt_tokens INTEGER NOT NULL,
                    completion_tokens INTEGER NOT NULL,
                    total_tokens INTEGER NOT NULL,
                    max_tokens INTEGER NOT NULL,
                    latency_ms INTEGER NOT NULL,
                    cost REAL NOT NULL,
                    status TEXT NOT NULL,
                    error_code TEXT,
                    prompt_hash TEXT NOT NULL,
                    response_hash TEXT,
                    prompt_preview TEXT NOT NULL DEFAULT '',
                    response_preview TEXT NOT NULL DEFAULT '',
                    messages_remaining INTEGER NOT NULL,
                    cost_remaining REAL NOT NULL,
                    tokens_remaining INTEGER NOT NULL,
                    shrink_log TEXT NOT NULL DEFAULT '[]',
                    corrects INTEGER REFERENCES model_calls(id),
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS checkpoints (
                    run_id INTEGER PRIMARY KEY REFERENCES workflow_runs(id),
                    last_completed_step INTEGER NOT NULL,
                    last_call_id INTEGER,
                    summaries TEXT NOT NULL DEFAULT '[]',
                    running_summary TEXT NOT NULL DEFAULT '',
                    messages_remaining INTEGER NOT NULL,
                    cost_remaining REAL NOT NULL,
                    tokens_remaining INTEGER NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_runs_status ON workflow_runs(status);
                CREATE INDEX IF NOT EXISTS idx_steps_run ON steps(run_id);
                CREATE INDEX IF NOT EXISTS idx_calls_run ON model_calls(run_id);
                CREATE INDEX IF NOT EXISTS idx_calls_step ON model_calls(step_id);
                CREATE INDEX IF NOT EXISTS idx_calls_created ON model_calls(created_at);
                ",
            )
            .context("Failed to create tables")?;

        // Terminal run states are final, whatever code path issues the UPDATE.
        self.conn
            .execute_batch(
                "
                CREATE TRIGGER IF NOT EXISTS workflow_runs_terminal_final
                BEFORE UPDATE OF status ON workflow_runs
                WHEN OLD.status NOT IN ('pending', 'running') AND NEW.status != OLD.status
                BEGIN
                    SELECT RAISE(ABORT, 'terminal run status is final');
                END;
                ",
            )
            .context("Failed to create run status trigger")?;

        // The ledger is insert-only. Corrections are new rows with `corrects` set.
        self.conn
            .execute_batch(
                "
                CREATE TRIGGER IF NOT EXISTS model_calls_no_update
                BEFORE UPDATE ON model_calls
                BEGIN
                    SELECT RAISE(ABORT, 'model_calls is append-only');
                END;

                CREATE TRIGGER IF NOT EXISTS model_calls_no_delete
                BEFORE DELETE ON model_calls
                BEGIN
                    SELECT RAISE(ABORT, 'model_calls is append-only');
                END;
                ",
            )
            .context("Failed to create ledger triggers")?;

        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_database_and_run_migrations() -> Result<()> {
        let db = StewardDb::new_in_memory()?;
        let table_count: i32 = db.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table'
             AND name IN ('workflow_runs', 'steps', 'model_calls', 'checkpoints')",
            [],
            |row| row.get(0),
        )?;
        assert_eq!(table_count, 4, "Expected 4 tables to exist");

        let trigger_count: i32 = db.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='trigger'",
            [],
            |row| row.get(0),
        )?;
        assert_eq!(trigger_count, 3);
        Ok(())
    }

    #[test]
    fn test_migrations_are_idempotent() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("steward.db");
        StewardDb::new(&path)?;
        StewardDb::new(&path)?;
        Ok(())
    }

    #[tokio::test]
    async fn test_db_handle_call_runs_closure() -> Result<()> {
        let handle = DbHandle::in_memory()?;
        let n: i64 = handle
            .call(|db| Ok(db.conn.query_row("SELECT 41 + 1", [], |row| row.get(0))?))
            .await?;
        assert_eq!(n, 42);
        Ok(())
    }
}
