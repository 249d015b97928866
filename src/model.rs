//! Run / result / log data model and the run status state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Store-assigned identifier of a run.
pub type RunId = i64;

/// Free-form run metadata (persisted as a JSON object).
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// Lifecycle of a run: `pending -> running -> {completed | failed | cancelled}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }

    /// Whether `self -> next` is an edge of the lifecycle graph.
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        match (self, next) {
            (RunStatus::Pending, RunStatus::Running) => true,
            (RunStatus::Running, n) => n.is_terminal(),
            _ => false,
        }
    }

    /// Statuses from which `self` may be entered.
    pub fn predecessors(&self) -> &'static [RunStatus] {
        match self {
            RunStatus::Pending => &[],
            RunStatus::Running => &[RunStatus::Pending],
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled => {
                &[RunStatus::Running]
            }
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RunStatus::Pending),
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            "cancelled" => Ok(RunStatus::Cancelled),
            other => Err(format!("unknown run status '{}'", other)),
        }
    }
}

/// Outcome of a single check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Passed,
    Failed,
    Skipped,
}

impl CheckStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckStatus::Passed => "passed",
            CheckStatus::Failed => "failed",
            CheckStatus::Skipped => "skipped",
        }
    }
}

impl std::fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CheckStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "passed" => Ok(CheckStatus::Passed),
            "failed" => Ok(CheckStatus::Failed),
            "skipped" => Ok(CheckStatus::Skipped),
            other => Err(format!("unknown check status '{}'", other)),
        }
    }
}

/// Aggregated per-status counts of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounts {
    pub total: u32,
    pub passed: u32,
    pub failed: u32,
    pub skipped: u32,
}

impl RunCounts {
    pub fn from_results<'a>(results: impl IntoIterator<Item = &'a CheckResult>) -> Self {
        let mut counts = RunCounts::default();
        for r in results {
            counts.total += 1;
            match r.status {
                CheckStatus::Passed => counts.passed += 1,
                CheckStatus::Failed => counts.failed += 1,
                CheckStatus::Skipped => counts.skipped += 1,
            }
        }
        counts
    }

    /// `completed` unless something failed. Skips are tolerated.
    pub fn verdict(&self) -> RunStatus {
        if self.failed > 0 {
            RunStatus::Failed
        } else {
            RunStatus::Completed
        }
    }

    pub fn is_consistent(&self) -> bool {
        self.total == self.passed + self.failed + self.skipped
    }
}

/// One invocation of a suite.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub correlation_id: Uuid,
    pub suite: String,
    pub status: RunStatus,
    pub started_by: i64,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub counts: RunCounts,
    pub metadata: Metadata,
}

/// Insert payload for a new run; the store assigns `id` and `correlation_id`.
#[derive(Debug, Clone)]
pub struct NewRun {
    pub suite: String,
    pub started_by: i64,
    pub started_at: DateTime<Utc>,
    pub metadata: Metadata,
}

/// Persisted outcome of one check within one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    pub id: i64,
    pub run_id: RunId,
    pub check_name: String,
    pub suite: String,
    pub status: CheckStatus,
    pub duration_ms: i64,
    pub error: Option<String>,
    pub trace: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

/// What a check reports back; the coordinator attaches run, name and suite.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckOutcome {
    pub status: CheckStatus,
    pub error: Option<String>,
    pub trace: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl CheckOutcome {
    pub fn pass(started_at: DateTime<Utc>) -> Self {
        Self {
            status: CheckStatus::Passed,
            error: None,
            trace: None,
            started_at,
            completed_at: Utc::now(),
        }
    }

    /// Failed outcome. The trace is the `{:?}` rendering of `source`, if any.
    pub fn fail(
        started_at: DateTime<Utc>,
        message: impl Into<String>,
        source: Option<&dyn std::fmt::Debug>,
    ) -> Self {
        Self {
            status: CheckStatus::Failed,
            error: Some(message.into()),
            trace: source.map(|s| format!("{:?}", s)),
            started_at,
            completed_at: Utc::now(),
        }
    }

    pub fn skip(started_at: DateTime<Utc>, reason: impl Into<String>) -> Self {
        Self {
            status: CheckStatus::Skipped,
            error: Some(reason.into()),
            trace: None,
            started_at,
            completed_at: Utc::now(),
        }
    }

    pub fn with_trace(mut self, trace: impl Into<String>) -> Self {
        self.trace = Some(trace.into());
        self
    }

    pub fn duration_ms(&self) -> i64 {
        (self.completed_at - self.started_at).num_milliseconds().max(0)
    }

    /// Attach ownership information. `id` stays 0 until the store assigns one.
    pub fn into_result(self, run_id: RunId, check_name: &str, suite: &str) -> CheckResult {
        CheckResult {
            id: 0,
            run_id,
            check_name: check_name.to_string(),
            suite: suite.to_string(),
            status: self.status,
            duration_ms: self.duration_ms(),
            error: self.error,
            trace: self.trace,
            started_at: self.started_at,
            completed_at: self.completed_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(format!("unknown log level '{}'", other)),
        }
    }
}

/// Append-only diagnostic line tied to a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: i64,
    pub run_id: RunId,
    pub level: LogLevel,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// A run with its results and the tail of its log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunDetail {
    pub run: Run,
    pub results: Vec<CheckResult>,
    pub logs: Vec<LogEntry>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(status: CheckStatus) -> CheckResult {
        CheckOutcome {
            status,
            error: None,
            trace: None,
            started_at: Utc::now(),
            completed_at: Utc::now(),
        }
        .into_result(1, "c", "api")
    }

    #[test]
    fn test_lifecycle_edges() {
        use RunStatus::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Running.can_transition_to(Completed));
        assert!(Running.can_transition_to(Failed));
        assert!(Running.can_transition_to(Cancelled));

        assert!(!Pending.can_transition_to(Completed));
        assert!(!Running.can_transition_to(Pending));
        assert!(!Running.can_transition_to(Running));
        for terminal in [Completed, Failed, Cancelled] {
            for next in [Pending, Running, Completed, Failed, Cancelled] {
                assert!(!terminal.can_transition_to(next), "{terminal} -> {next}");
            }
        }
    }

    #[test]
    fn test_predecessors_match_edges() {
        use RunStatus::*;
        let all = [Pending, Running, Completed, Failed, Cancelled];
        for next in all {
            for prev in all {
                assert_eq!(
                    next.predecessors().contains(&prev),
                    prev.can_transition_to(next)
                );
            }
        }
    }

    #[test]
    fn test_status_string_forms() {
        for s in ["pending", "running", "completed", "failed", "cancelled"] {
            assert_eq!(s.parse::<RunStatus>().unwrap().as_str(), s);
        }
        assert!("done".parse::<RunStatus>().is_err());
    }

    #[test]
    fn test_counts_and_verdict() {
        let results = vec![
            result(CheckStatus::Passed),
            result(CheckStatus::Passed),
            result(CheckStatus::Failed),
            result(CheckStatus::Skipped),
        ];
        let counts = RunCounts::from_results(&results);
        assert_eq!(counts.total, 4);
        assert_eq!(counts.passed, 2);
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.skipped, 1);
        assert!(counts.is_consistent());
        assert_eq!(counts.verdict(), RunStatus::Failed);
    }

    #[test]
    fn test_skips_do_not_fail_a_run() {
        let results = vec![result(CheckStatus::Skipped), result(CheckStatus::Passed)];
        assert_eq!(RunCounts::from_results(&results).verdict(), RunStatus::Completed);
        assert_eq!(RunCounts::default().verdict(), RunStatus::Completed);
    }

    #[test]
    fn test_fail_outcome_carries_trace() {
        let err = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        let outcome = CheckOutcome::fail(Utc::now(), "request failed", Some(&err));
        assert_eq!(outcome.status, CheckStatus::Failed);
        assert_eq!(outcome.error.as_deref(), Some("request failed"));
        assert!(outcome.trace.as_ref().unwrap().contains("boom"));
        assert!(outcome.duration_ms() >= 0);
    }
}
