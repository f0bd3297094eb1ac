//! Run records and their store.
//!
//! Status changes follow `queued -> running -> {passed | failed | error}`,
//! with `queued -> error` for runs whose process never started. The store
//! refuses anything else, so records can only move forward.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use serde::{Deserialize, Serialize};

use super::{opt_time_column, time_column, unblock, Pool, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Queued,
    Running,
    Passed,
    Failed,
    Error,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::Running => "running",
            RunStatus::Passed => "passed",
            RunStatus::Failed => "failed",
            RunStatus::Error => "error",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Passed | RunStatus::Failed | RunStatus::Error)
    }

    /// Whether a record in `self` may be moved to `next`.
    pub fn can_transition_to(self, next: RunStatus) -> bool {
        use RunStatus::*;
        match (self, next) {
            (Queued, Queued) | (Running, Running) => true,
            (Queued, Running) | (Queued, Error) => true,
            (Running, Passed) | (Running, Failed) | (Running, Error) => true,
            _ => false,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown run status '{0}'")]
pub struct UnknownStatus(String);

impl FromStr for RunStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(RunStatus::Queued),
            "running" => Ok(RunStatus::Running),
            "passed" => Ok(RunStatus::Passed),
            "failed" => Ok(RunStatus::Failed),
            "error" => Ok(RunStatus::Error),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// One execution attempt of a test case.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRecord {
    pub run_id: String,
    pub test_case_id: String,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub artifacts_dir: PathBuf,
    pub log_path: PathBuf,
    /// `None` means no exit code was recorded, which is not the same as 0.
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunRecord {
    /// A fresh `queued` record.
    pub fn queued(
        run_id: impl Into<String>,
        test_case_id: impl Into<String>,
        artifacts_dir: PathBuf,
        log_path: PathBuf,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            test_case_id: test_case_id.into(),
            status: RunStatus::Queued,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            artifacts_dir,
            log_path,
            exit_code: None,
            error: None,
        }
    }
}

/// Partial update of a run record.
///
/// `exit_code` is doubly optional: `None` leaves the stored value alone,
/// `Some(None)` clears it.
#[derive(Debug, Clone, Default)]
pub struct RunPatch {
    pub status: Option<RunStatus>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub exit_code: Option<Option<i32>>,
    pub error: Option<String>,
}

impl RunPatch {
    pub fn running(at: DateTime<Utc>) -> Self {
        Self {
            status: Some(RunStatus::Running),
            started_at: Some(at),
            ..Default::default()
        }
    }

    pub fn finished(status: RunStatus, exit_code: Option<i32>, error: Option<String>) -> Self {
        Self {
            status: Some(status),
            finished_at: Some(Utc::now()),
            exit_code: Some(exit_code),
            error,
            ..Default::default()
        }
    }
}

const SELECT_RUN: &str = "SELECT id, test_case_id, status, created_at, started_at, finished_at,
        artifacts_dir, log_path, exit_code, error FROM runs";

fn map_run(row: &Row<'_>) -> rusqlite::Result<RunRecord> {
    let status: String = row.get(2)?;
    let status = status
        .parse::<RunStatus>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(2, Type::Text, Box::new(e)))?;

    Ok(RunRecord {
        run_id: row.get(0)?,
        test_case_id: row.get(1)?,
        status,
        created_at: time_column(row, 3)?,
        started_at: opt_time_column(row, 4)?,
        finished_at: opt_time_column(row, 5)?,
        artifacts_dir: PathBuf::from(row.get::<_, String>(6)?),
        log_path: PathBuf::from(row.get::<_, String>(7)?),
        exit_code: row.get(8)?,
        error: row.get(9)?,
    })
}

fn fetch(conn: &Connection, id: &str) -> rusqlite::Result<Option<RunRecord>> {
    conn.query_row(&format!("{SELECT_RUN} WHERE id = ?1"), params![id], map_run)
        .optional()
}

/// Durable run records. Runs are never deleted here.
#[derive(Clone)]
pub struct RunStore {
    pool: Pool,
}

impl RunStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Call `f` with this store on the blocking thread pool.
    pub async fn blocking<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&RunStore) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.clone();
        unblock(move || f(&store)).await
    }

    pub fn create(&self, run: &RunRecord) -> Result<(), StoreError> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO runs (id, test_case_id, status, created_at, started_at, finished_at,
                               artifacts_dir, log_path, exit_code, error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                run.run_id,
                run.test_case_id,
                run.status.as_str(),
                run.created_at.to_rfc3339(),
                run.started_at.map(|t| t.to_rfc3339()),
                run.finished_at.map(|t| t.to_rfc3339()),
                run.artifacts_dir.to_string_lossy(),
                run.log_path.to_string_lossy(),
                run.exit_code,
                run.error,
            ],
        )?;
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Option<RunRecord>, StoreError> {
        let conn = self.pool.get()?;
        Ok(fetch(&conn, id)?)
    }

    /// All runs, newest first.
    pub fn list(&self) -> Result<Vec<RunRecord>, StoreError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!("{SELECT_RUN} ORDER BY created_at DESC, id"))?;
        let rows = stmt.query_map([], map_run)?;

        let mut runs = Vec::new();
        for r in rows {
            runs.push(r?);
        }
        Ok(runs)
    }

    /// Apply `patch` to the stored record and return the result.
    ///
    /// The read and the write share one `BEGIN IMMEDIATE` transaction, so
    /// concurrent updates of the same run are serialized by SQLite's write
    /// lock and never overwrite each other from a stale read.
    pub fn update(&self, id: &str, patch: RunPatch) -> Result<RunRecord, StoreError> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut run = fetch(&tx, id)?.ok_or_else(|| StoreError::NotFound {
            kind: "run",
            id: id.to_string(),
        })?;

        if let Some(next) = patch.status {
            if !run.status.can_transition_to(next) {
                return Err(StoreError::InvalidTransition {
                    id: id.to_string(),
                    from: run.status,
                    to: next,
                });
            }
            run.status = next;
        }
        if let Some(started_at) = patch.started_at {
            run.started_at = Some(started_at);
        }
        if let Some(finished_at) = patch.finished_at {
            run.finished_at = Some(finished_at);
        }
        if let Some(exit_code) = patch.exit_code {
            run.exit_code = exit_code;
        }
        if let Some(error) = patch.error {
            run.error = Some(error);
        }

        // finished_at is set iff the status is terminal.
        if run.status.is_terminal() {
            run.finished_at.get_or_insert_with(Utc::now);
        } else if run.finished_at.is_some() {
            return Err(StoreError::FinishedWhileActive {
                id: id.to_string(),
                status: run.status,
            });
        }

        tx.execute(
            "UPDATE runs
             SET status = ?2, started_at = ?3, finished_at = ?4, exit_code = ?5, error = ?6
             WHERE id = ?1",
            params![
                run.run_id,
                run.status.as_str(),
                run.started_at.map(|t| t.to_rfc3339()),
                run.finished_at.map(|t| t.to_rfc3339()),
                run.exit_code,
                run.error,
            ],
        )?;
        tx.commit()?;

        tracing::debug!(run_id = %run.run_id, status = %run.status, "run record updated");
        Ok(run)
    }
}
