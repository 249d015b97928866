//! Run coordinator: accepts run requests, executes them in the background,
//! and answers status, detail and cancellation requests.
//!
//! A run is persisted as `pending` and registered before `run_suite`
//! returns, so the caller can cancel it immediately. Execution happens on a
//! detached task whose cancellation scope belongs to the run itself, never to
//! the request that started it.

pub mod journal;
pub mod registry;
pub mod strategy;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use self::journal::RunJournal;
use self::registry::{RunGuard, RunRegistry};
use self::strategy::{ExecutionMode, RunContext};
use crate::auth::{self, TokenCache};
use crate::checks::CheckRegistry;
use crate::config::Config;
use crate::model::{Metadata, NewRun, Run, RunCounts, RunDetail, RunId, RunStatus};
use crate::storage::{RunStore, SqliteStore, StoreError};

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("run {0} is not running")]
    NotRunning(RunId),

    #[error("run {0} not found")]
    NotFound(RunId),

    #[error("no run with correlation id {0}")]
    UnknownCorrelation(Uuid),

    #[error("run {0} is still executing")]
    StillRunning(RunId),

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for CoordinatorError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::RunNotFound(id) => CoordinatorError::NotFound(id),
            StoreError::CorrelationNotFound(uuid) => CoordinatorError::UnknownCorrelation(uuid),
            other => CoordinatorError::Store(other),
        }
    }
}

/// What happened after a cancel signal was delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    /// The run wound down within the grace period.
    Stopped,
    /// The run was signalled but had not finished when the grace ran out.
    GraceElapsed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRequest {
    pub suite: String,
    #[serde(default)]
    pub check: Option<String>,
    pub actor_id: i64,
    #[serde(default)]
    pub parallel: bool,
}

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub base_url: String,
    pub run_timeout: Duration,
    pub cancel_grace: Duration,
    pub max_parallel: usize,
    pub log_tail: u32,
}

impl CoordinatorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            base_url: config.target.base_url.clone(),
            run_timeout: config.runner.run_timeout(),
            cancel_grace: config.runner.cancel_grace(),
            max_parallel: config.runner.max_parallel_checks,
            log_tail: config.runner.log_tail,
        }
    }
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

struct Inner {
    store: Arc<dyn RunStore>,
    tokens: Arc<TokenCache>,
    checks: CheckRegistry,
    runs: RunRegistry,
    settings: CoordinatorSettings,
}

#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

impl Coordinator {
    pub fn new(
        store: Arc<dyn RunStore>,
        tokens: Arc<TokenCache>,
        checks: CheckRegistry,
        settings: CoordinatorSettings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                tokens,
                checks,
                runs: RunRegistry::new(),
                settings,
            }),
        }
    }

    /// Wire up the SQLite store, token cache and built-in checks.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.target.request_timeout())
            .user_agent(concat!("checkrun/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build HTTP client")?;

        let store = SqliteStore::open(&config.storage.db_path)?;

        let tokens = match auth::source_from_config(&config.auth, &config.target, client.clone()) {
            Ok(source) => {
                TokenCache::new(source, Duration::from_secs(config.auth.cache_ttl_secs))
            }
            Err(e) => {
                warn!(error = %e, "runs will fail at token acquisition");
                TokenCache::unconfigured()
            }
        };

        let checks = CheckRegistry::builtin(config, client);
        info!(checks = checks.len(), db = %config.storage.db_path, "coordinator ready");

        Ok(Self::new(
            Arc::new(store),
            Arc::new(tokens),
            checks,
            CoordinatorSettings::from_config(config),
        ))
    }

    pub fn checks(&self) -> &CheckRegistry {
        &self.inner.checks
    }

    pub fn active_runs(&self) -> Vec<RunId> {
        self.inner.runs.active()
    }

    /// Persist a pending run, register it and start executing it in the
    /// background. Returns the run as created.
    pub fn run_suite(&self, request: RunRequest) -> Result<Run, CoordinatorError> {
        let mode = if request.parallel {
            ExecutionMode::Parallel {
                max_concurrency: self.inner.settings.max_parallel,
            }
        } else {
            ExecutionMode::Sequential
        };

        let mut metadata = Metadata::new();
        metadata.insert("mode".into(), json!(mode.as_str()));
        if let Some(check) = &request.check {
            metadata.insert("check".into(), json!(check));
        }

        let run = self.inner.store.create_run(&NewRun {
            suite: request.suite.clone(),
            started_by: request.actor_id,
            started_at: Utc::now(),
            metadata,
        })?;

        let (guard, scope) = self.inner.runs.register(run.id);
        info!(
            run_id = run.id,
            suite = %run.suite,
            mode = mode.as_str(),
            actor = request.actor_id,
            "run accepted"
        );

        let span = info_span!("run", run_id = run.id, correlation_id = %run.correlation_id);
        let this = self.clone();
        let accepted = run.clone();
        tokio::spawn(
            async move {
                this.execute(accepted, guard, scope, request, mode).await;
            }
            .instrument(span),
        );

        Ok(run)
    }

    async fn execute(
        self,
        run: Run,
        guard: RunGuard,
        scope: CancellationToken,
        request: RunRequest,
        mode: ExecutionMode,
    ) {
        let _guard = guard;
        let store = self.inner.store.clone();
        let settings = &self.inner.settings;
        let journal = RunJournal::new(store.clone(), run.id);

        if let Err(e) = store.update_run_status(run.id, RunStatus::Running) {
            error!(run_id = run.id, error = %e, "could not mark run as running");
            return;
        }
        journal.info(&format!(
            "Run started: suite={} mode={}",
            request.suite,
            mode.as_str()
        ));

        // A slow login must not hold off a cancel.
        let acquired = tokio::select! {
            biased;
            _ = scope.cancelled() => None,
            token = self.inner.tokens.get_token() => Some(token),
        };
        let token = match acquired {
            Some(Ok(token)) => token,
            None => {
                journal.warn("Run cancelled during token acquisition");
                self.finish(
                    &journal,
                    &run,
                    RunStatus::Cancelled,
                    RunCounts::default(),
                    outcome("cancelled", None),
                );
                return;
            }
            Some(Err(e)) => {
                journal.error(&format!("Token acquisition failed: {}", e));
                self.finish(
                    &journal,
                    &run,
                    RunStatus::Failed,
                    RunCounts::default(),
                    outcome("setup_failed", Some(e.to_string())),
                );
                return;
            }
        };

        let checks = self
            .inner
            .checks
            .resolve(&request.suite, request.check.as_deref());
        if checks.is_empty() {
            journal.warn("No checks resolved, nothing to run");
            self.finish(
                &journal,
                &run,
                RunStatus::Completed,
                RunCounts::default(),
                outcome("no_checks", None),
            );
            return;
        }

        let mut planned = Metadata::new();
        planned.insert("checks_planned".into(), json!(checks.len()));
        if let Err(e) = store.merge_run_metadata(run.id, &planned) {
            journal.warn(&format!("Failed to record planned checks: {}", e));
        }
        journal.info(&format!("Executing {} check(s)", checks.len()));

        let ctx = Arc::new(RunContext {
            run_id: run.id,
            base_url: settings.base_url.clone(),
            token,
            scope: scope.clone(),
            store: store.clone(),
            journal: journal.clone(),
        });

        let work = strategy::execute(ctx, checks, mode);
        tokio::pin!(work);
        let ceiling = tokio::time::sleep(settings.run_timeout);
        tokio::pin!(ceiling);

        let mut deadline_hit = false;
        let results = loop {
            tokio::select! {
                results = &mut work => break results,
                _ = &mut ceiling, if !deadline_hit => {
                    deadline_hit = true;
                    journal.error(&format!(
                        "Run exceeded its {}s ceiling, cancelling remaining checks",
                        settings.run_timeout.as_secs()
                    ));
                    scope.cancel();
                }
            }
        };

        let counts = RunCounts::from_results(&results);
        let (status, patch) = if deadline_hit {
            (RunStatus::Failed, outcome("deadline_exceeded", None))
        } else if scope.is_cancelled() {
            (RunStatus::Cancelled, outcome("cancelled", None))
        } else {
            (counts.verdict(), Metadata::new())
        };

        self.finish(&journal, &run, status, counts, patch);
    }

    fn finish(
        &self,
        journal: &RunJournal,
        run: &Run,
        status: RunStatus,
        counts: RunCounts,
        patch: Metadata,
    ) {
        let store = &self.inner.store;
        if !patch.is_empty() {
            if let Err(e) = store.merge_run_metadata(run.id, &patch) {
                journal.warn(&format!("Failed to record run outcome: {}", e));
            }
        }

        let completed_at = Utc::now();
        let duration_ms = (completed_at - run.started_at).num_milliseconds().max(0);
        match store.finalize_run(run.id, status, completed_at, duration_ms, &counts) {
            Ok(()) => journal.info(&format!(
                "Run {}: total={} passed={} failed={} skipped={} ({}ms)",
                status, counts.total, counts.passed, counts.failed, counts.skipped, duration_ms
            )),
            Err(e) => journal.error(&format!("Failed to finalize run as {}: {}", status, e)),
        }
    }

    /// Signal an in-flight run to stop and wait up to the grace period for it
    /// to finish.
    pub async fn cancel_run(&self, id: RunId) -> Result<CancelOutcome, CoordinatorError> {
        let Some(active) = self.inner.runs.lookup(id) else {
            return Err(CoordinatorError::NotRunning(id));
        };

        RunJournal::new(self.inner.store.clone(), id).warn("Cancellation requested");
        active.cancel.cancel();

        let grace = self.inner.settings.cancel_grace;
        let mut done = active.done;
        let stopped = tokio::time::timeout(grace, done.wait_for(|finished| *finished))
            .await
            .is_ok();

        if stopped {
            info!(run_id = id, "run stopped after cancellation");
            Ok(CancelOutcome::Stopped)
        } else {
            warn!(
                run_id = id,
                grace_secs = grace.as_secs(),
                "run still executing after cancellation grace period"
            );
            Ok(CancelOutcome::GraceElapsed)
        }
    }

    /// Resolve once run `id` is no longer executing, then return it.
    pub async fn wait_for(&self, id: RunId) -> Result<Run, CoordinatorError> {
        if let Some(active) = self.inner.runs.lookup(id) {
            let mut done = active.done;
            // A closed channel means the guard is gone, which is also done.
            let _ = done.wait_for(|finished| *finished).await;
        }
        self.get_run_status(id)
    }

    pub fn get_run_status(&self, id: RunId) -> Result<Run, CoordinatorError> {
        Ok(self.inner.store.get_run(id)?)
    }

    /// The run with every check result and the newest log lines.
    pub fn get_run_detail(&self, id: RunId) -> Result<RunDetail, CoordinatorError> {
        let run = self.inner.store.get_run(id)?;
        let results = self.inner.store.list_check_results(id)?;
        let logs = self
            .inner
            .store
            .list_log_entries(id, self.inner.settings.log_tail)?;
        Ok(RunDetail { run, results, logs })
    }

    pub fn list_runs(&self, limit: u32, offset: u32) -> Result<Vec<Run>, CoordinatorError> {
        Ok(self.inner.store.list_runs(limit, offset)?)
    }

    /// Look a run up by the correlation id handed out when it was created.
    pub fn get_run_by_correlation(&self, correlation_id: Uuid) -> Result<Run, CoordinatorError> {
        Ok(self.inner.store.get_run_by_correlation(correlation_id)?)
    }

    /// Delete a run with its results and log. In-flight runs are refused.
    pub fn delete_run(&self, id: RunId) -> Result<(), CoordinatorError> {
        if self.inner.runs.lookup(id).is_some() {
            return Err(CoordinatorError::StillRunning(id));
        }
        Ok(self.inner.store.delete_run(id)?)
    }
}

fn outcome(kind: &str, error: Option<String>) -> Metadata {
    let mut patch = Metadata::new();
    patch.insert("outcome".into(), json!(kind));
    if let Some(error) = error {
        patch.insert("error".into(), json!(error));
    }
    patch
}
