//! Durable run records.
//!
//! The scheduler records every admitted run and its status transitions here
//! so run history survives the bridge process. SQLite keeps the bridge a
//! single self-contained binary; the trait seam lets tests and embedders
//! substitute their own storage.

use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(RunStatus::Queued),
            "running" => Some(RunStatus::Running),
            "completed" => Some(RunStatus::Completed),
            "failed" => Some(RunStatus::Failed),
            "cancelled" => Some(RunStatus::Cancelled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunRecord {
    pub run_id: String,
    pub job: Value,
    pub status: RunStatus,
    pub detail: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub trait RecordStore: Send + Sync {
    fn create(&self, run_id: &str, job: &Value, status: RunStatus) -> Result<()>;
    fn get(&self, run_id: &str) -> Result<Option<RunRecord>>;
    /// Update a run's status. `detail` replaces the stored detail when given
    /// and leaves it untouched when `None`.
    fn update_status(&self, run_id: &str, status: RunStatus, detail: Option<&Value>)
    -> Result<()>;
    fn list(&self) -> Result<Vec<RunRecord>>;
    fn delete(&self, run_id: &str) -> Result<bool>;
}

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open database {}", path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .context("failed to enable WAL")?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory database")?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS runs (
                run_id     TEXT PRIMARY KEY,
                job        TEXT NOT NULL,
                status     TEXT NOT NULL,
                detail     TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_runs_status ON runs(status);",
        )
        .context("failed to initialize schema")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl RecordStore for SqliteStore {
    fn create(&self, run_id: &str, job: &Value, status: RunStatus) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO runs (run_id, job, status, detail, created_at, updated_at)
             VALUES (?1, ?2, ?3, NULL, ?4, ?4)",
            params![run_id, job.to_string(), status.as_str(), now],
        )
        .with_context(|| format!("failed to create record for run {run_id}"))?;
        Ok(())
    }

    fn get(&self, run_id: &str) -> Result<Option<RunRecord>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(
            "SELECT run_id, job, status, detail, created_at, updated_at
             FROM runs WHERE run_id = ?1",
        )?;
        let mut rows = stmt.query(params![run_id])?;
        match rows.next()? {
            Some(row) => Ok(Some(decode_row(row)?)),
            None => Ok(None),
        }
    }

    fn update_status(
        &self,
        run_id: &str,
        status: RunStatus,
        detail: Option<&Value>,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let changed = conn
            .execute(
                "UPDATE runs
                 SET status = ?2, detail = COALESCE(?3, detail), updated_at = ?4
                 WHERE run_id = ?1",
                params![
                    run_id,
                    status.as_str(),
                    detail.map(|d| d.to_string()),
                    Utc::now().to_rfc3339()
                ],
            )
            .with_context(|| format!("failed to update record for run {run_id}"))?;
        if changed == 0 {
            bail!("no record for run {run_id}");
        }
        Ok(())
    }

    fn list(&self) -> Result<Vec<RunRecord>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(
            "SELECT run_id, job, status, detail, created_at, updated_at
             FROM runs ORDER BY created_at DESC",
        )?;
        let mut rows = stmt.query([])?;
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            records.push(decode_row(row)?);
        }
        Ok(records)
    }

    fn delete(&self, run_id: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let changed = conn
            .execute("DELETE FROM runs WHERE run_id = ?1", params![run_id])
            .with_context(|| format!("failed to delete record for run {run_id}"))?;
        Ok(changed > 0)
    }
}

fn decode_row(row: &rusqlite::Row<'_>) -> Result<RunRecord> {
    let run_id: String = row.get(0)?;
    let job: String = row.get(1)?;
    let status: String = row.get(2)?;
    let detail: Option<String> = row.get(3)?;
    let created_at: String = row.get(4)?;
    let updated_at: String = row.get(5)?;
    Ok(RunRecord {
        job: serde_json::from_str(&job)
            .with_context(|| format!("invalid job payload for run {run_id}"))?,
        status: RunStatus::parse(&status)
            .with_context(|| format!("unknown status {status:?} for run {run_id}"))?,
        detail: detail
            .map(|d| serde_json::from_str(&d))
            .transpose()
            .with_context(|| format!("invalid detail for run {run_id}"))?,
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
        run_id,
    })
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("invalid timestamp {raw:?}"))?
        .with_timezone(&Utc))
}
