use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};

use super::models::{Job, JobStatus};

/// Async-safe handle to the render database.
///
/// Wraps `RenderDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, so synchronous SQLite I/O never
/// ties up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<RenderDb>>,
}

impl DbHandle {
    pub fn new(db: RenderDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&RenderDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|e| anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }
}

/// Open the durable store and check that it answers queries. Callers fall
/// back to in-memory stores when this fails.
pub fn probe(path: &Path) -> Result<DbHandle> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create database directory {}", parent.display()))?;
    }
    let db = RenderDb::new(path)?;
    db.ping()?;
    Ok(DbHandle::new(db))
}

pub struct RenderDb {
    conn: Connection,
}

impl RenderDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open SQLite database at {}", path.display()))?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        // WAL keeps status polling from blocking the writing worker.
        self.conn
            .pragma_update(None, "journal_mode", "WAL")
            .context("Failed to set journal mode")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS jobs (
                    job_id TEXT PRIMARY KEY,
                    status TEXT NOT NULL DEFAULT 'queued',
                    progress INTEGER NOT NULL DEFAULT 0,
                    stage TEXT NOT NULL DEFAULT 'queued',
                    error TEXT,
                    video_path TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS cache_entries (
                    key TEXT PRIMARY KEY,
                    value TEXT NOT NULL,
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    pub fn ping(&self) -> Result<()> {
        let one: i64 = self
            .conn
            .query_row("SELECT 1", [], |row| row.get(0))
            .context("Database health probe failed")?;
        if one != 1 {
            return Err(anyhow!("Database health probe returned {}", one));
        }
        Ok(())
    }

    // ── Jobs ──────────────────────────────────────────────────────────

    pub fn insert_job(&self, job: &Job) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO jobs (job_id, status, progress, stage, error, video_path, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    job.job_id,
                    job.status.as_str(),
                    job.progress,
                    job.stage,
                    job.error,
                    job.video_path,
                    job.created_at.to_rfc3339(),
                    job.updated_at.to_rfc3339(),
                ],
            )
            .with_context(|| format!("Failed to insert job {}", job.job_id))?;
        Ok(())
    }

    /// Replace every mutable column of an existing job.
    pub fn save_job(&self, job: &Job) -> Result<()> {
        self.conn
            .execute(
                "UPDATE jobs SET status = ?2, progress = ?3, stage = ?4, error = ?5, video_path = ?6, updated_at = ?7
                 WHERE job_id = ?1",
                params![
                    job.job_id,
                    job.status.as_str(),
                    job.progress,
                    job.stage,
                    job.error,
                    job.video_path,
                    job.updated_at.to_rfc3339(),
                ],
            )
            .with_context(|| format!("Failed to update job {}", job.job_id))?;
        Ok(())
    }

    pub fn get_job(&self, job_id: &str) -> Result<Option<Job>> {
        let row = self
            .conn
            .query_row(
                "SELECT job_id, status, progress, stage, error, video_path, created_at, updated_at
                 FROM jobs WHERE job_id = ?1",
                params![job_id],
                |row| {
                    Ok(JobRow {
                        job_id: row.get(0)?,
                        status: row.get(1)?,
                        progress: row.get(2)?,
                        stage: row.get(3)?,
                        error: row.get(4)?,
                        video_path: row.get(5)?,
                        created_at: row.get(6)?,
                        updated_at: row.get(7)?,
                    })
                },
            )
            .optional()
            .context("Failed to query job")?;
        row.map(JobRow::into_job).transpose()
    }

    // ── Cache entries ─────────────────────────────────────────────────

    pub fn cache_get(&self, key: &str) -> Result<Option<String>> {
        self.conn
            .query_row(
                "SELECT value FROM cache_entries WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to query cache entry")
    }

    pub fn cache_put(&self, key: &str, value: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO cache_entries (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, created_at = datetime('now')",
                params![key, value],
            )
            .context("Failed to write cache entry")?;
        Ok(())
    }
}

struct JobRow {
    job_id: String,
    status: String,
    progress: u8,
    stage: String,
    error: Option<String>,
    video_path: Option<String>,
    created_at: String,
    updated_at: String,
}

impl JobRow {
    fn into_job(self) -> Result<Job> {
        Ok(Job {
            status: self.status.parse::<JobStatus>().map_err(|e| anyhow!(e))?,
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
            job_id: self.job_id,
            progress: self.progress,
            stage: self.stage,
            error: self.error,
            video_path: self.video_path,
        })
    }
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)
        .with_context(|| format!("Invalid timestamp '{}'", value))?
        .with_timezone(&Utc))
}

// ── Tests ─────────────────────────────────────────────────────────────
