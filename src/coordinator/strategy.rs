//! Sequential and bounded-parallel execution of a run's checks.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use futures::FutureExt;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use super::journal::RunJournal;
use crate::checks::Check;
use crate::model::{CheckOutcome, CheckResult, CheckStatus, RunId};
use crate::storage::RunStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    Sequential,
    /// At most `max_concurrency` checks execute at once.
    Parallel { max_concurrency: usize },
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionMode::Sequential => "sequential",
            ExecutionMode::Parallel { .. } => "parallel",
        }
    }
}

/// Everything a check invocation needs, shared by all checks of one run.
pub struct RunContext {
    pub run_id: RunId,
    pub base_url: String,
    pub token: String,
    pub scope: CancellationToken,
    pub store: Arc<dyn RunStore>,
    pub journal: RunJournal,
}

/// Run `checks` and return their results in check order.
///
/// Checks that never started because the scope was cancelled produce no
/// result.
pub async fn execute(
    ctx: Arc<RunContext>,
    checks: Vec<Arc<dyn Check>>,
    mode: ExecutionMode,
) -> Vec<CheckResult> {
    match mode {
        ExecutionMode::Sequential => sequential(&ctx, &checks).await,
        ExecutionMode::Parallel { max_concurrency } => {
            parallel(ctx, checks, max_concurrency.max(1)).await
        }
    }
}

async fn sequential(ctx: &RunContext, checks: &[Arc<dyn Check>]) -> Vec<CheckResult> {
    let mut results = Vec::with_capacity(checks.len());
    for (i, check) in checks.iter().enumerate() {
        if ctx.scope.is_cancelled() {
            ctx.journal.warn(&format!(
                "Run cancelled, {} check(s) not started",
                checks.len() - i
            ));
            break;
        }
        results.push(run_one(ctx, check.as_ref()).await);
    }
    results
}

async fn parallel(
    ctx: Arc<RunContext>,
    checks: Vec<Arc<dyn Check>>,
    max_concurrency: usize,
) -> Vec<CheckResult> {
    let permits = Arc::new(Semaphore::new(max_concurrency));

    let handles = checks.iter().cloned().map(|check| {
        let ctx = ctx.clone();
        let permits = permits.clone();
        tokio::spawn(async move {
            let permit = tokio::select! {
                biased;
                _ = ctx.scope.cancelled() => None,
                p = permits.acquire_owned() => p.ok(),
            };
            let Some(_permit) = permit else {
                return None;
            };
            Some(run_one(&ctx, check.as_ref()).await)
        })
    });

    let joined = join_all(handles).await;

    let mut slots: Vec<Option<CheckResult>> = Vec::with_capacity(checks.len());
    let mut not_started = 0usize;
    for (joined, check) in joined.into_iter().zip(&checks) {
        match joined {
            Ok(Some(result)) => slots.push(Some(result)),
            Ok(None) => {
                not_started += 1;
                slots.push(None);
            }
            Err(e) => {
                // Panics are caught inside the task; this is an abort.
                let outcome =
                    CheckOutcome::fail(Utc::now(), format!("check task aborted: {}", e), None);
                slots.push(Some(record(&ctx, check.as_ref(), outcome)));
            }
        }
    }
    if not_started > 0 {
        ctx.journal.warn(&format!(
            "Run cancelled, {} check(s) not started",
            not_started
        ));
    }

    slots.into_iter().flatten().collect()
}

/// Invoke one check, persist its result and log a summary line.
async fn run_one(ctx: &RunContext, check: &dyn Check) -> CheckResult {
    ctx.journal.info(&format!("Starting check: {}", check.name()));

    let started = Utc::now();
    let outcome = AssertUnwindSafe(check.run(&ctx.scope, &ctx.base_url, &ctx.token))
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| {
            CheckOutcome::fail(
                started,
                format!("check panicked: {}", panic_message(panic.as_ref())),
                None,
            )
        });

    record(ctx, check, outcome)
}

fn record(ctx: &RunContext, check: &dyn Check, outcome: CheckOutcome) -> CheckResult {
    let name = check.name();
    let mut result = outcome.into_result(ctx.run_id, name, check.category().as_str());

    match ctx.store.create_check_result(&result) {
        Ok(id) => result.id = id,
        Err(e) => ctx
            .journal
            .warn(&format!("Failed to save result for {}: {}", name, e)),
    }

    let error = result.error.as_deref().unwrap_or("");
    match result.status {
        CheckStatus::Passed => ctx
            .journal
            .info(&format!("PASS {} ({}ms)", name, result.duration_ms)),
        CheckStatus::Failed => ctx.journal.error(&format!(
            "FAIL {} ({}ms): {}",
            name, result.duration_ms, error
        )),
        CheckStatus::Skipped => ctx.journal.warn(&format!("SKIP {}: {}", name, error)),
    }

    result
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_message() {
        let boxed: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(boxed.as_ref()), "boom");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(boxed.as_ref()), "bang");
        let boxed: Box<dyn Any + Send> = Box::new(42u8);
        assert_eq!(panic_message(boxed.as_ref()), "unknown panic payload");
    }

    #[test]
    fn test_mode_names() {
        assert_eq!(ExecutionMode::Sequential.as_str(), "sequential");
        assert_eq!(
            ExecutionMode::Parallel { max_concurrency: 4 }.as_str(),
            "parallel"
        );
    }
}
