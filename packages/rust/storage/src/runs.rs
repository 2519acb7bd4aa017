//! Batch run history.

use chrono::{DateTime, Utc};
use enrichkit_shared::{EnrichError, LookupKind, Result, RunId};
use libsql::{Row, params};

use crate::{Storage, col, parse_time};

/// Final (or current) state of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    /// Stopped by the stop signal before the batch finished.
    Interrupted,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Interrupted => "interrupted",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        match s {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "interrupted" => Ok(Self::Interrupted),
            other => Err(EnrichError::Storage(format!("unknown run status '{other}'"))),
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of `batch_runs`.
#[derive(Debug, Clone, PartialEq)]
pub struct RunRecord {
    pub id: String,
    pub batch_id: String,
    pub kind: LookupKind,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub stats_json: Option<String>,
}

impl Storage {
    // -----------------------------------------------------------------------
    // Run history operations
    // -----------------------------------------------------------------------

    /// Record the start of a run.
    pub async fn insert_run(&self, run_id: &RunId, batch_id: &str, kind: LookupKind) -> Result<()> {
        self.check_writable()?;
        let _gate = self.write_gate.lock().await;
        let id = run_id.to_string();
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO batch_runs (id, batch_id, kind, started_at, status)
                 VALUES (?1, ?2, ?3, ?4, 'running')",
                params![id.as_str(), batch_id, kind.as_str(), now.as_str()],
            )
            .await
            .map_err(EnrichError::storage)?;
        Ok(())
    }

    /// Mark a run finished with its final status and stats.
    pub async fn finish_run(
        &self,
        run_id: &RunId,
        status: RunStatus,
        stats_json: Option<&str>,
    ) -> Result<()> {
        self.check_writable()?;
        let _gate = self.write_gate.lock().await;
        let id = run_id.to_string();
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "UPDATE batch_runs SET finished_at = ?1, status = ?2, stats_json = ?3 WHERE id = ?4",
                params![now.as_str(), status.as_str(), stats_json, id.as_str()],
            )
            .await
            .map_err(EnrichError::storage)?;
        Ok(())
    }

    /// Most recent runs first, optionally for one batch.
    pub async fn list_runs(&self, batch_id: Option<&str>, limit: u32) -> Result<Vec<RunRecord>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, batch_id, kind, started_at, finished_at, status, stats_json
                 FROM batch_runs
                 WHERE ?1 IS NULL OR batch_id = ?1
                 ORDER BY started_at DESC, id DESC LIMIT ?2",
                params![batch_id, limit as i64],
            )
            .await
            .map_err(EnrichError::storage)?;

        let mut runs = Vec::new();
        while let Some(row) = rows.next().await.map_err(EnrichError::storage)? {
            runs.push(row_to_run(&row)?);
        }
        Ok(runs)
    }
}

fn row_to_run(row: &Row) -> Result<RunRecord> {
    Ok(RunRecord {
        id: col(row, 0)?,
        batch_id: col(row, 1)?,
        kind: col::<String>(row, 2)?.parse()?,
        started_at: parse_time(&col::<String>(row, 3)?)?,
        finished_at: col::<Option<String>>(row, 4)?
            .map(|raw| parse_time(&raw))
            .transpose()?,
        status: RunStatus::parse(&col::<String>(row, 5)?)?,
        stats_json: col(row, 6)?,
    })
}
