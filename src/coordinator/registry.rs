//! In-flight runs and their cancel handles.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::model::RunId;

/// Handles for one executing run.
#[derive(Clone)]
pub struct ActiveRun {
    pub cancel: CancellationToken,
    /// Flips to `true` once the run's task has finished.
    pub done: watch::Receiver<bool>,
}

#[derive(Clone, Default)]
pub struct RunRegistry {
    runs: Arc<Mutex<HashMap<RunId, ActiveRun>>>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<RunId, ActiveRun>> {
        // A panic while holding this lock cannot leave the map half-updated.
        self.runs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Track `id` until the returned guard is dropped.
    pub fn register(&self, id: RunId) -> (RunGuard, CancellationToken) {
        let cancel = CancellationToken::new();
        let (done_tx, done_rx) = watch::channel(false);
        self.lock().insert(
            id,
            ActiveRun {
                cancel: cancel.clone(),
                done: done_rx,
            },
        );
        let guard = RunGuard {
            id,
            registry: self.clone(),
            done: done_tx,
        };
        (guard, cancel)
    }

    pub fn lookup(&self, id: RunId) -> Option<ActiveRun> {
        self.lock().get(&id).cloned()
    }

    /// Ids of in-flight runs, ascending.
    pub fn active(&self) -> Vec<RunId> {
        let mut ids: Vec<RunId> = self.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

/// Deregisters its run and signals completion when dropped, including on
/// panic unwind.
pub struct RunGuard {
    id: RunId,
    registry: RunRegistry,
    done: watch::Sender<bool>,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.registry.lock().remove(&self.id);
        self.done.send_replace(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_register_and_drop() {
        let registry = RunRegistry::new();
        let (guard, _cancel) = registry.register(7);
        assert_eq!(registry.active(), vec![7]);

        let active = registry.lookup(7).unwrap();
        assert!(!*active.done.borrow());

        drop(guard);
        assert!(registry.lookup(7).is_none());
        assert!(registry.active().is_empty());
        assert!(*active.done.borrow());
    }

    #[test]
    fn test_cancel_handle_is_shared() {
        let registry = RunRegistry::new();
        let (_guard, cancel) = registry.register(1);
        registry.lookup(1).unwrap().cancel.cancel();
        assert!(cancel.is_cancelled());
    }

    #[test]
    fn test_runs_are_isolated() {
        let registry = RunRegistry::new();
        let (_g1, c1) = registry.register(1);
        let (_g2, c2) = registry.register(2);
        registry.lookup(2).unwrap().cancel.cancel();
        assert!(!c1.is_cancelled());
        assert!(c2.is_cancelled());
        assert_eq!(registry.active(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_done_wakes_waiter() {
        let registry = RunRegistry::new();
        let (guard, _cancel) = registry.register(3);
        let mut done = registry.lookup(3).unwrap().done;

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            drop(guard);
        });

        tokio::time::timeout(Duration::from_secs(2), done.wait_for(|d| *d))
            .await
            .expect("guard drop should signal")
            .unwrap();
    }

    #[test]
    fn test_guard_drop_on_panic() {
        let registry = RunRegistry::new();
        let r = registry.clone();
        let res = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let (_guard, _) = r.register(9);
            panic!("check blew up");
        }));
        assert!(res.is_err());
        assert!(registry.lookup(9).is_none());
    }
}
