//! Per-run log lines, mirrored to tracing and to the store.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::model::{LogLevel, RunId};
use crate::storage::RunStore;

/// Writes run-scoped log entries. A store failure is reported through
/// tracing and otherwise ignored.
#[derive(Clone)]
pub struct RunJournal {
    store: Arc<dyn RunStore>,
    run_id: RunId,
}

impl RunJournal {
    pub fn new(store: Arc<dyn RunStore>, run_id: RunId) -> Self {
        Self { store, run_id }
    }

    pub fn info(&self, message: &str) {
        info!(run_id = self.run_id, "{}", message);
        self.persist(LogLevel::Info, message);
    }

    pub fn warn(&self, message: &str) {
        warn!(run_id = self.run_id, "{}", message);
        self.persist(LogLevel::Warn, message);
    }

    pub fn error(&self, message: &str) {
        error!(run_id = self.run_id, "{}", message);
        self.persist(LogLevel::Error, message);
    }

    fn persist(&self, level: LogLevel, message: &str) {
        if let Err(e) = self
            .store
            .create_log_entry(self.run_id, level, message, Utc::now())
        {
            debug!(run_id = self.run_id, error = %e, "dropped run log entry");
        }
    }
}
