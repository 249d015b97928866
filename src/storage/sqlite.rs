//! SQLite adapter for `RunStore`.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, OptionalExtension, Row};
use tracing::{debug, info};
use uuid::Uuid;

use super::{open_pool, Pool, RunStore, StoreError, StoreResult};
use crate::model::{
    CheckResult, LogEntry, LogLevel, Metadata, NewRun, Run, RunCounts, RunId, RunStatus,
};

const RUN_COLUMNS: &str = "id, correlation_id, suite, status, started_by, started_at,
    completed_at, duration_ms, total, passed, failed, skipped, metadata_json";

const RESULT_COLUMNS: &str = "id, run_id, check_name, suite, status, duration_ms,
    error, trace, started_at, completed_at";

/// `RunStore` backed by a pooled SQLite database.
#[derive(Clone)]
pub struct SqliteStore {
    pool: Pool,
}

impl SqliteStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Open (or create) the database at `path` and run migrations.
    pub fn open(path: &str) -> anyhow::Result<Self> {
        Ok(Self::new(open_pool(path)?))
    }

    fn transition_clause(status: RunStatus) -> String {
        let from: Vec<String> = status
            .predecessors()
            .iter()
            .map(|s| format!("'{}'", s.as_str()))
            .collect();
        if from.is_empty() {
            "0".to_string()
        } else {
            format!("status IN ({})", from.join(", "))
        }
    }

    fn current_status(&self, id: RunId) -> StoreResult<RunStatus> {
        let conn = self.pool.get()?;
        let status: Option<String> = conn
            .query_row("SELECT status FROM runs WHERE id = ?1", params![id], |row| {
                row.get(0)
            })
            .optional()?;
        status
            .ok_or(StoreError::RunNotFound(id))?
            .parse()
            .map_err(StoreError::Corrupt)
    }

    /// Error for an edge the conditional UPDATE did not take.
    fn rejected(&self, id: RunId, to: RunStatus) -> StoreError {
        match self.current_status(id) {
            Ok(from) => StoreError::InvalidTransition { id, from, to },
            Err(e) => e,
        }
    }
}

impl RunStore for SqliteStore {
    fn create_run(&self, new: &NewRun) -> StoreResult<Run> {
        let correlation_id = Uuid::new_v4();
        let metadata_json = serde_json::to_string(&new.metadata)?;

        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO runs (correlation_id, suite, status, started_by, started_at, metadata_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                correlation_id.to_string(),
                new.suite,
                RunStatus::Pending.as_str(),
                new.started_by,
                ts(&new.started_at),
                metadata_json,
            ],
        )?;
        let id = conn.last_insert_rowid();

        info!(run_id = id, correlation_id = %correlation_id, suite = %new.suite, "run created");

        Ok(Run {
            id,
            correlation_id,
            suite: new.suite.clone(),
            status: RunStatus::Pending,
            started_by: new.started_by,
            started_at: new.started_at,
            completed_at: None,
            duration_ms: None,
            counts: RunCounts::default(),
            metadata: new.metadata.clone(),
        })
    }

    fn get_run(&self, id: RunId) -> StoreResult<Run> {
        let conn = self.pool.get()?;
        let row = conn
            .query_row(
                &format!("SELECT {} FROM runs WHERE id = ?1", RUN_COLUMNS),
                params![id],
                RunRow::from_row,
            )
            .optional()?;
        row.ok_or(StoreError::RunNotFound(id))?.try_into()
    }

    fn get_run_by_correlation(&self, correlation_id: Uuid) -> StoreResult<Run> {
        let conn = self.pool.get()?;
        let row = conn
            .query_row(
                &format!("SELECT {} FROM runs WHERE correlation_id = ?1", RUN_COLUMNS),
                params![correlation_id.to_string()],
                RunRow::from_row,
            )
            .optional()?;
        row.ok_or(StoreError::CorrelationNotFound(correlation_id))?
            .try_into()
    }

    fn list_runs(&self, limit: u32, offset: u32) -> StoreResult<Vec<Run>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM runs ORDER BY started_at DESC, id DESC LIMIT ?1 OFFSET ?2",
            RUN_COLUMNS
        ))?;
        let rows = stmt.query_map(params![limit, offset], RunRow::from_row)?;

        let mut runs = Vec::new();
        for r in rows {
            runs.push(r?.try_into()?);
        }
        Ok(runs)
    }

    fn update_run_status(&self, id: RunId, status: RunStatus) -> StoreResult<()> {
        let conn = self.pool.get()?;
        let changed = conn.execute(
            &format!(
                "UPDATE runs SET status = ?1 WHERE id = ?2 AND {}",
                Self::transition_clause(status)
            ),
            params![status.as_str(), id],
        )?;
        drop(conn);

        if changed == 0 {
            return Err(self.rejected(id, status));
        }
        debug!(run_id = id, %status, "run status updated");
        Ok(())
    }

    fn update_run_completion(
        &self,
        id: RunId,
        completed_at: DateTime<Utc>,
        duration_ms: i64,
    ) -> StoreResult<()> {
        let conn = self.pool.get()?;
        let changed = conn.execute(
            "UPDATE runs SET completed_at = ?1, duration_ms = ?2 WHERE id = ?3",
            params![ts(&completed_at), duration_ms, id],
        )?;
        if changed == 0 {
            return Err(StoreError::RunNotFound(id));
        }
        Ok(())
    }

    fn update_run_counts(&self, id: RunId, counts: &RunCounts) -> StoreResult<()> {
        let conn = self.pool.get()?;
        let changed = conn.execute(
            "UPDATE runs SET total = ?1, passed = ?2, failed = ?3, skipped = ?4 WHERE id = ?5",
            params![counts.total, counts.passed, counts.failed, counts.skipped, id],
        )?;
        if changed == 0 {
            return Err(StoreError::RunNotFound(id));
        }
        Ok(())
    }

    fn merge_run_metadata(&self, id: RunId, patch: &Metadata) -> StoreResult<()> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        let current: Option<String> = tx
            .query_row(
                "SELECT metadata_json FROM runs WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        let current = current.ok_or(StoreError::RunNotFound(id))?;

        let mut metadata: Metadata = serde_json::from_str(&current)?;
        for (k, v) in patch {
            metadata.insert(k.clone(), v.clone());
        }
        tx.execute(
            "UPDATE runs SET metadata_json = ?1 WHERE id = ?2",
            params![serde_json::to_string(&metadata)?, id],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn finalize_run(
        &self,
        id: RunId,
        status: RunStatus,
        completed_at: DateTime<Utc>,
        duration_ms: i64,
        counts: &RunCounts,
    ) -> StoreResult<()> {
        if !status.is_terminal() {
            return Err(self.rejected(id, status));
        }

        let conn = self.pool.get()?;
        let changed = conn.execute(
            &format!(
                "UPDATE runs
                 SET status = ?1, completed_at = ?2, duration_ms = ?3,
                     total = ?4, passed = ?5, failed = ?6, skipped = ?7
                 WHERE id = ?8 AND {}",
                Self::transition_clause(status)
            ),
            params![
                status.as_str(),
                ts(&completed_at),
                duration_ms,
                counts.total,
                counts.passed,
                counts.failed,
                counts.skipped,
                id
            ],
        )?;
        drop(conn);

        if changed == 0 {
            return Err(self.rejected(id, status));
        }
        Ok(())
    }

    fn delete_run(&self, id: RunId) -> StoreResult<()> {
        let conn = self.pool.get()?;
        // check_results and run_logs go with it through ON DELETE CASCADE.
        let changed = conn.execute("DELETE FROM runs WHERE id = ?1", params![id])?;
        if changed == 0 {
            return Err(StoreError::RunNotFound(id));
        }
        info!(run_id = id, "run deleted");
        Ok(())
    }

    fn create_check_result(&self, result: &CheckResult) -> StoreResult<i64> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO check_results (
                run_id, check_name, suite, status, duration_ms,
                error, trace, started_at, completed_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                result.run_id,
                result.check_name,
                result.suite,
                result.status.as_str(),
                result.duration_ms,
                result.error,
                result.trace,
                ts(&result.started_at),
                ts(&result.completed_at),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn list_check_results(&self, run_id: RunId) -> StoreResult<Vec<CheckResult>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM check_results WHERE run_id = ?1 ORDER BY id ASC",
            RESULT_COLUMNS
        ))?;
        let rows = stmt.query_map(params![run_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, i64>(5)?,
                row.get::<_, Option<String>>(6)?,
                row.get::<_, Option<String>>(7)?,
                row.get::<_, String>(8)?,
                row.get::<_, String>(9)?,
            ))
        })?;

        let mut results = Vec::new();
        for r in rows {
            let (id, run_id, check_name, suite, status, duration_ms, error, trace, started, done) =
                r?;
            results.push(CheckResult {
                id,
                run_id,
                check_name,
                suite,
                status: status.parse().map_err(StoreError::Corrupt)?,
                duration_ms,
                error,
                trace,
                started_at: parse_ts(&started)?,
                completed_at: parse_ts(&done)?,
            });
        }
        Ok(results)
    }

    fn create_log_entry(
        &self,
        run_id: RunId,
        level: LogLevel,
        message: &str,
        timestamp: DateTime<Utc>,
    ) -> StoreResult<i64> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO run_logs (run_id, level, message, timestamp) VALUES (?1, ?2, ?3, ?4)",
            params![run_id, level.as_str(), message, ts(&timestamp)],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn list_log_entries(&self, run_id: RunId, limit: u32) -> StoreResult<Vec<LogEntry>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT id, run_id, level, message, timestamp FROM run_logs
             WHERE run_id = ?1 ORDER BY id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![run_id, limit], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;

        let mut logs = Vec::new();
        for r in rows {
            let (id, run_id, level, message, timestamp) = r?;
            logs.push(LogEntry {
                id,
                run_id,
                level: level.parse().map_err(StoreError::Corrupt)?,
                message,
                timestamp: parse_ts(&timestamp)?,
            });
        }
        logs.reverse();
        Ok(logs)
    }
}

// =============================================================================
// Row mapping
// =============================================================================

struct RunRow {
    id: i64,
    correlation_id: String,
    suite: String,
    status: String,
    started_by: i64,
    started_at: String,
    completed_at: Option<String>,
    duration_ms: Option<i64>,
    counts: RunCounts,
    metadata_json: String,
}

impl RunRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            correlation_id: row.get(1)?,
            suite: row.get(2)?,
            status: row.get(3)?,
            started_by: row.get(4)?,
            started_at: row.get(5)?,
            completed_at: row.get(6)?,
            duration_ms: row.get(7)?,
            counts: RunCounts {
                total: row.get(8)?,
                passed: row.get(9)?,
                failed: row.get(10)?,
                skipped: row.get(11)?,
            },
            metadata_json: row.get(12)?,
        })
    }
}

impl TryFrom<RunRow> for Run {
    type Error = StoreError;

    fn try_from(row: RunRow) -> Result<Self, Self::Error> {
        Ok(Run {
            id: row.id,
            correlation_id: Uuid::parse_str(&row.correlation_id)
                .map_err(|e| StoreError::Corrupt(format!("correlation_id: {}", e)))?,
            suite: row.suite,
            status: row.status.parse().map_err(StoreError::Corrupt)?,
            started_by: row.started_by,
            started_at: parse_ts(&row.started_at)?,
            completed_at: row.completed_at.as_deref().map(parse_ts).transpose()?,
            duration_ms: row.duration_ms,
            counts: row.counts,
            metadata: serde_json::from_str(&row.metadata_json)?,
        })
    }
}

/// Fixed-width RFC 3339 so that lexical order matches time order.
fn ts(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("timestamp '{}': {}", s, e)))
}
