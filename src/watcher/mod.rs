// =============================================================================
// Watch Scheduler — supervises one WatchTask per Active signal
// =============================================================================
//
// The task map is a cache of what the store says should be running:
//   - `recover` spawns a task for every Active signal at startup.
//   - `reconcile` respawns tasks that are missing or finished (including
//     panicked ones) and cancels tasks whose signal is no longer Active.
//   - `cancel` is the explicit stop used after a manual close.
//
// At most one live task exists per signal id; `watch` on an id that already
// has a live task is a no-op.
// =============================================================================

pub mod task;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::market_data::MarketDataSource;
use crate::notify::NotificationSink;
use crate::signal_store::SignalStore;
use crate::types::Signal;

pub use task::{WatchOutcome, WatchPhase, WatchSettings, WatchStatus, WatchTask};

struct TaskHandle {
    cancel: watch::Sender<bool>,
    status: Arc<WatchStatus>,
    join: JoinHandle<WatchOutcome>,
}

impl TaskHandle {
    fn is_live(&self) -> bool {
        !self.join.is_finished()
    }
}

/// Result of one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Tasks started for Active signals that had none.
    pub spawned: usize,
    /// Tasks stopped because their signal is no longer Active.
    pub cancelled: usize,
    /// Finished task entries removed from the map.
    pub pruned: usize,
}

#[derive(Clone)]
pub struct WatchScheduler {
    store: Arc<SignalStore>,
    source: Arc<dyn MarketDataSource>,
    sink: Arc<dyn NotificationSink>,
    settings: WatchSettings,
    tasks: Arc<Mutex<HashMap<String, TaskHandle>>>,
}

impl WatchScheduler {
    pub fn new(
        store: Arc<SignalStore>,
        source: Arc<dyn MarketDataSource>,
        sink: Arc<dyn NotificationSink>,
        settings: WatchSettings,
    ) -> Self {
        Self {
            store,
            source,
            sink,
            settings,
            tasks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn settings(&self) -> WatchSettings {
        self.settings
    }

    fn spawn_task(&self, signal: &Signal) -> TaskHandle {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let status = Arc::new(WatchStatus::new());
        let task = WatchTask {
            signal: signal.clone(),
            store: self.store.clone(),
            source: self.source.clone(),
            sink: self.sink.clone(),
            settings: self.settings,
            status: status.clone(),
            cancel: cancel_rx,
        };
        TaskHandle {
            cancel: cancel_tx,
            status,
            join: tokio::spawn(task.run()),
        }
    }

    /// Start watching `signal` unless a live task already exists for it.
    /// Returns `true` when a task was spawned.
    pub fn watch(&self, signal: &Signal) -> bool {
        if !signal.is_active() {
            return false;
        }
        let mut tasks = self.tasks.lock();
        if tasks.get(&signal.id).is_some_and(TaskHandle::is_live) {
            return false;
        }
        let handle = self.spawn_task(signal);
        tasks.insert(signal.id.clone(), handle);
        debug!(id = %signal.id, "watch task spawned");
        true
    }

    /// Stop the task for `id`, if any. Returns `true` when a live task was
    /// signalled.
    pub fn cancel(&self, id: &str) -> bool {
        match self.tasks.lock().remove(id) {
            Some(handle) => {
                let live = handle.is_live();
                let _ = handle.cancel.send(true);
                if live {
                    info!(id, "watch task cancelled");
                }
                live
            }
            None => false,
        }
    }

    /// Spawn a task for every Active signal in the store.
    pub fn recover(&self) -> usize {
        let active = self.store.list_active();
        let spawned = active.iter().filter(|s| self.watch(s)).count();
        info!(active = active.len(), spawned, "watch tasks recovered");
        spawned
    }

    /// Bring the task map back in line with the store.
    pub fn reconcile(&self) -> ReconcileReport {
        let active = self.store.list_active();
        let active_ids: HashSet<&str> = active.iter().map(|s| s.id.as_str()).collect();
        let mut report = ReconcileReport::default();

        {
            let mut tasks = self.tasks.lock();
            tasks.retain(|id, handle| {
                if !handle.is_live() {
                    report.pruned += 1;
                    return false;
                }
                if !active_ids.contains(id.as_str()) {
                    let _ = handle.cancel.send(true);
                    report.cancelled += 1;
                    return false;
                }
                true
            });
        }

        for signal in &active {
            if self.watch(signal) {
                warn!(id = %signal.id, "active signal had no live watch task — respawned");
                report.spawned += 1;
            }
        }

        if report != ReconcileReport::default() {
            info!(
                spawned = report.spawned,
                cancelled = report.cancelled,
                pruned = report.pruned,
                "watch reconciliation adjusted tasks"
            );
        }
        report
    }

    /// Periodically reconcile until `shutdown` flips to `true`.
    pub async fn run_reconcile_loop(self, every: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = every.as_secs(), "watch reconciliation loop started");
        let mut ticker = interval(every);
        // The first tick fires immediately; recovery already covered it.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.reconcile();
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("watch reconciliation loop stopped");
    }

    /// Cancel every task and wait for them to finish.
    pub async fn shutdown(&self) {
        let handles: Vec<(String, TaskHandle)> = self.tasks.lock().drain().collect();
        let count = handles.len();
        for (_, handle) in &handles {
            let _ = handle.cancel.send(true);
        }
        for (id, handle) in handles {
            if let Err(e) = handle.join.await {
                warn!(id = %id, error = %e, "watch task ended abnormally");
            }
        }
        info!(count, "watch tasks shut down");
    }

    // -------------------------------------------------------------------------
    // Introspection
    // -------------------------------------------------------------------------

    pub fn running_count(&self) -> usize {
        self.tasks.lock().values().filter(|h| h.is_live()).count()
    }

    pub fn is_watching(&self, id: &str) -> bool {
        self.tasks.lock().get(id).is_some_and(TaskHandle::is_live)
    }

    pub fn phase(&self, id: &str) -> Option<WatchPhase> {
        self.tasks.lock().get(id).map(|h| h.status.phase())
    }

    /// Most recent quote seen by the task for `id`.
    pub fn last_price(&self, id: &str) -> Option<f64> {
        self.tasks.lock().get(id).and_then(|h| h.status.last_price())
    }
}

impl std::fmt::Debug for WatchScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchScheduler")
            .field("settings", &self.settings)
            .field("tasks", &self.tasks.lock().len())
            .finish()
    }
}
