//! Persistence gateway: the `RunStore` port and its SQLite adapter.

pub mod schema;
mod sqlite;

pub use self::sqlite::SqliteStore;

use anyhow::Result;
use chrono::{DateTime, Utc};
use r2d2::Pool as R2D2Pool;
use r2d2_sqlite::SqliteConnectionManager;
use thiserror::Error;
use uuid::Uuid;

use crate::model::{
    CheckResult, LogEntry, LogLevel, Metadata, NewRun, Run, RunCounts, RunId, RunStatus,
};

/// Connection Pool type
pub type Pool = R2D2Pool<SqliteConnectionManager>;

/// Open (or create) the SQLite database and return a connection pool.
pub fn open_pool(path: &str) -> Result<Pool> {
    if let Some(parent) = std::path::Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let manager = SqliteConnectionManager::file(path).with_init(|c| {
        c.execute_batch(
            "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA temp_store = MEMORY;
                 PRAGMA foreign_keys = ON;
                 PRAGMA busy_timeout = 5000;",
        )
    });

    let pool = R2D2Pool::new(manager)?;

    // Run migrations on a single connection
    let conn = pool.get()?;
    schema::migrate(&conn)?;

    Ok(pool)
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("run {0} not found")]
    RunNotFound(RunId),

    #[error("no run with correlation id {0}")]
    CorrelationNotFound(Uuid),

    #[error("run {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: RunId,
        from: RunStatus,
        to: RunStatus,
    },

    #[error("connection pool: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("metadata encoding: {0}")]
    Json(#[from] serde_json::Error),

    #[error("corrupt row: {0}")]
    Corrupt(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Create/read/update operations over runs, check results and log entries.
///
/// Implementations must tolerate concurrent writers: parallel checks of one
/// run and several runs all share a single store.
pub trait RunStore: Send + Sync {
    fn create_run(&self, new: &NewRun) -> StoreResult<Run>;

    fn get_run(&self, id: RunId) -> StoreResult<Run>;

    fn get_run_by_correlation(&self, correlation_id: Uuid) -> StoreResult<Run>;

    /// Newest first.
    fn list_runs(&self, limit: u32, offset: u32) -> StoreResult<Vec<Run>>;

    /// Rejects edges outside the run lifecycle with `InvalidTransition`.
    fn update_run_status(&self, id: RunId, status: RunStatus) -> StoreResult<()>;

    fn update_run_completion(
        &self,
        id: RunId,
        completed_at: DateTime<Utc>,
        duration_ms: i64,
    ) -> StoreResult<()>;

    fn update_run_counts(&self, id: RunId, counts: &RunCounts) -> StoreResult<()>;

    /// Shallow-merge `patch` into the run's metadata object.
    fn merge_run_metadata(&self, id: RunId, patch: &Metadata) -> StoreResult<()>;

    /// Move a running run to a terminal status together with its completion
    /// time, duration and counts.
    ///
    /// The default takes the status edge first and only then writes counts
    /// and completion, so a rejected transition leaves the run untouched.
    /// Adapters that can do all three in one statement should override it.
    fn finalize_run(
        &self,
        id: RunId,
        status: RunStatus,
        completed_at: DateTime<Utc>,
        duration_ms: i64,
        counts: &RunCounts,
    ) -> StoreResult<()> {
        if !status.is_terminal() {
            let from = self.get_run(id)?.status;
            return Err(StoreError::InvalidTransition { id, from, to: status });
        }
        self.update_run_status(id, status)?;
        self.update_run_counts(id, counts)?;
        self.update_run_completion(id, completed_at, duration_ms)
    }

    /// Remove a run together with its check results and log entries.
    fn delete_run(&self, id: RunId) -> StoreResult<()>;

    /// Returns the assigned row id.
    fn create_check_result(&self, result: &CheckResult) -> StoreResult<i64>;

    fn list_check_results(&self, run_id: RunId) -> StoreResult<Vec<CheckResult>>;

    fn create_log_entry(
        &self,
        run_id: RunId,
        level: LogLevel,
        message: &str,
        timestamp: DateTime<Utc>,
    ) -> StoreResult<i64>;

    /// The newest `limit` entries, oldest first.
    fn list_log_entries(&self, run_id: RunId, limit: u32) -> StoreResult<Vec<LogEntry>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::CheckOutcome;

    /// Forwards everything to SQLite except `finalize_run`, which falls back
    /// to the trait's default.
    struct Piecewise(SqliteStore);

    impl RunStore for Piecewise {
        fn create_run(&self, new: &NewRun) -> StoreResult<Run> {
            self.0.create_run(new)
        }
        fn get_run(&self, id: RunId) -> StoreResult<Run> {
            self.0.get_run(id)
        }
        fn get_run_by_correlation(&self, correlation_id: Uuid) -> StoreResult<Run> {
            self.0.get_run_by_correlation(correlation_id)
        }
        fn list_runs(&self, limit: u32, offset: u32) -> StoreResult<Vec<Run>> {
            self.0.list_runs(limit, offset)
        }
        fn update_run_status(&self, id: RunId, status: RunStatus) -> StoreResult<()> {
            self.0.update_run_status(id, status)
        }
        fn update_run_completion(
            &self,
            id: RunId,
            completed_at: DateTime<Utc>,
            duration_ms: i64,
        ) -> StoreResult<()> {
            self.0.update_run_completion(id, completed_at, duration_ms)
        }
        fn update_run_counts(&self, id: RunId, counts: &RunCounts) -> StoreResult<()> {
            self.0.update_run_counts(id, counts)
        }
        fn merge_run_metadata(&self, id: RunId, patch: &Metadata) -> StoreResult<()> {
            self.0.merge_run_metadata(id, patch)
        }
        fn delete_run(&self, id: RunId) -> StoreResult<()> {
            self.0.delete_run(id)
        }
        fn create_check_result(&self, result: &CheckResult) -> StoreResult<i64> {
            self.0.create_check_result(result)
        }
        fn list_check_results(&self, run_id: RunId) -> StoreResult<Vec<CheckResult>> {
            self.0.list_check_results(run_id)
        }
        fn create_log_entry(
            &self,
            run_id: RunId,
            level: LogLevel,
            message: &str,
            timestamp: DateTime<Utc>,
        ) -> StoreResult<i64> {
            self.0.create_log_entry(run_id, level, message, timestamp)
        }
        fn list_log_entries(&self, run_id: RunId, limit: u32) -> StoreResult<Vec<LogEntry>> {
            self.0.list_log_entries(run_id, limit)
        }
    }

    fn piecewise() -> (tempfile::TempDir, Piecewise) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(dir.path().join("runs.db").to_str().unwrap()).unwrap();
        (dir, Piecewise(store))
    }

    fn pending(store: &Piecewise) -> Run {
        store
            .create_run(&NewRun {
                suite: "api".to_string(),
                started_by: 1,
                started_at: Utc::now(),
                metadata: Metadata::new(),
            })
            .unwrap()
    }

    #[test]
    fn test_default_finalize_rejected_edge_writes_nothing() {
        let (_dir, store) = piecewise();
        let run = pending(&store);
        let counts = RunCounts { total: 3, passed: 2, failed: 1, skipped: 0 };

        let err = store
            .finalize_run(run.id, RunStatus::Failed, Utc::now(), 10, &counts)
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::InvalidTransition { from: RunStatus::Pending, to: RunStatus::Failed, .. }
        ));

        let run = store.get_run(run.id).unwrap();
        assert_eq!(run.status, RunStatus::Pending);
        assert_eq!(run.counts, RunCounts::default());
        assert!(run.completed_at.is_none());
        assert!(run.duration_ms.is_none());
    }

    #[test]
    fn test_default_finalize_refuses_non_terminal_target() {
        let (_dir, store) = piecewise();
        let run = pending(&store);
        store.update_run_status(run.id, RunStatus::Running).unwrap();

        let counts = RunCounts { total: 1, passed: 1, failed: 0, skipped: 0 };
        assert!(store
            .finalize_run(run.id, RunStatus::Running, Utc::now(), 5, &counts)
            .is_err());
        assert_eq!(store.get_run(run.id).unwrap().counts, RunCounts::default());
    }

    #[test]
    fn test_default_finalize_from_running() {
        let (_dir, store) = piecewise();
        let run = pending(&store);
        store.update_run_status(run.id, RunStatus::Running).unwrap();
        let outcome = CheckOutcome::pass(Utc::now());
        store
            .create_check_result(&outcome.into_result(run.id, "api-a", "api"))
            .unwrap();

        let counts = RunCounts { total: 1, passed: 1, failed: 0, skipped: 0 };
        store
            .finalize_run(run.id, RunStatus::Completed, Utc::now(), 7, &counts)
            .unwrap();

        let run = store.get_run(run.id).unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.counts, counts);
        assert_eq!(run.duration_ms, Some(7));
    }
}
