// =============================================================================
// Signal Store — sole owner of signal records
// =============================================================================
//
// Life-cycle:
//   Active -> ClosedTP | ClosedSL | ClosedManual
//
// Invariants:
//   - At most one Active signal per (owner, instrument).
//   - Long: TP > entry > SL. Short: TP < entry < SL.
//   - Records are never deleted; closed signals remain as history.
//
// Thread-safety: `try_open` and `close` run under a per-key mutex so that
// writers for the same key are serialized while different keys proceed in
// parallel. A key's mutex lives only while some caller holds it; the last
// one out removes it from the lock table. The shared maps are behind `parking_lot::RwLock` and only held
// for the duration of a lookup or insert. Every transition is written to
// the repository before it becomes visible in memory.
// =============================================================================

pub mod repository;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::Rejection;
use crate::types::{CloseReason, ProposedSignal, Signal, SignalKey, SignalStatus};

#[cfg(test)]
pub use repository::MemoryRepository;
pub use repository::{JsonDirRepository, SignalRepository};

pub struct SignalStore {
    /// Every signal ever opened, keyed by id.
    records: RwLock<HashMap<String, Signal>>,
    /// Id of the Active signal for each key.
    active: RwLock<HashMap<SignalKey, String>>,
    key_locks: Mutex<HashMap<SignalKey, Arc<Mutex<()>>>>,
    repository: Arc<dyn SignalRepository>,
}

impl SignalStore {
    /// Build a store from the repository's contents.
    ///
    /// If the repository holds more than one Active signal for a key, the
    /// most recently opened one stays Active and the rest are closed as
    /// `ClosedManual` without a close price.
    pub fn open(repository: Arc<dyn SignalRepository>) -> Result<Self> {
        let mut signals = repository.load_all()?;
        signals.sort_by(|a, b| b.opened_at.cmp(&a.opened_at));

        let mut records = HashMap::with_capacity(signals.len());
        let mut active: HashMap<SignalKey, String> = HashMap::new();

        for mut signal in signals {
            if signal.is_active() {
                let key = signal.key();
                if let Some(kept) = active.get(&key) {
                    warn!(
                        id = %signal.id,
                        kept = %kept,
                        key = %key,
                        "duplicate active signal in repository — closing older one"
                    );
                    signal.status = SignalStatus::ClosedManual;
                    signal.closed_at = Some(Utc::now());
                    repository.upsert(&signal)?;
                } else {
                    active.insert(key, signal.id.clone());
                }
            }
            records.insert(signal.id.clone(), signal);
        }

        info!(total = records.len(), active = active.len(), "signal store loaded");

        Ok(Self {
            records: RwLock::new(records),
            active: RwLock::new(active),
            key_locks: Mutex::new(HashMap::new()),
            repository,
        })
    }

    /// Empty store backed by a [`MemoryRepository`].
    #[cfg(test)]
    pub fn in_memory() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            active: RwLock::new(HashMap::new()),
            key_locks: Mutex::new(HashMap::new()),
            repository: Arc::new(MemoryRepository::new()),
        }
    }

    fn key_lock(&self, key: &SignalKey) -> Arc<Mutex<()>> {
        self.key_locks
            .lock()
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Hand back a lock from `key_lock`; drops the table entry when no other
    /// caller holds a clone.
    fn release_key_lock(&self, key: &SignalKey, lock: Arc<Mutex<()>>) {
        drop(lock);
        let mut locks = self.key_locks.lock();
        if locks.get(key).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(key);
        }
    }

    #[cfg(test)]
    fn key_lock_count(&self) -> usize {
        self.key_locks.lock().len()
    }

    // -------------------------------------------------------------------------
    // Gated create
    // -------------------------------------------------------------------------

    /// Atomically open a new Active signal for `(owner, instrument)`.
    ///
    /// Rejects with `AlreadyActive` (and no side effects) when one exists.
    pub fn try_open(
        &self,
        owner: &str,
        instrument: &str,
        proposed: &ProposedSignal,
        timeframe: &str,
    ) -> Result<Signal, Rejection> {
        let key = SignalKey::new(owner, instrument);

        if !proposed.targets_consistent() {
            error!(
                key = %key,
                direction = %proposed.direction,
                entry = proposed.entry,
                take_profit = proposed.take_profit,
                stop_loss = proposed.stop_loss,
                "refusing signal with inconsistent targets"
            );
            return Err(Rejection::InvalidTargets(format!(
                "{} entry={} tp={} sl={}",
                proposed.direction, proposed.entry, proposed.take_profit, proposed.stop_loss
            )));
        }

        let lock = self.key_lock(&key);
        let result = {
            let _guard = lock.lock();
            self.open_locked(key.clone(), owner, instrument, proposed, timeframe)
        };
        self.release_key_lock(&key, lock);
        result
    }

    fn open_locked(
        &self,
        key: SignalKey,
        owner: &str,
        instrument: &str,
        proposed: &ProposedSignal,
        timeframe: &str,
    ) -> Result<Signal, Rejection> {
        if self.active.read().contains_key(&key) {
            return Err(Rejection::AlreadyActive(key.to_string()));
        }

        let signal = Signal {
            id: Uuid::new_v4().to_string(),
            owner_key: owner.to_string(),
            instrument_key: instrument.to_string(),
            direction: proposed.direction,
            entry: proposed.entry,
            take_profit: proposed.take_profit,
            stop_loss: proposed.stop_loss,
            timeframe: timeframe.to_string(),
            rationale: proposed.rationale.clone(),
            opened_at: Utc::now(),
            status: SignalStatus::Active,
            closed_at: None,
            close_price: None,
        };

        if let Err(e) = self.repository.upsert(&signal) {
            error!(key = %key, error = %e, "failed to persist new signal");
            return Err(Rejection::Storage(e.to_string()));
        }

        self.records.write().insert(signal.id.clone(), signal.clone());
        self.active.write().insert(key, signal.id.clone());

        info!(
            id = %signal.id,
            owner,
            instrument,
            direction = %signal.direction,
            entry = signal.entry,
            take_profit = signal.take_profit,
            stop_loss = signal.stop_loss,
            "signal opened"
        );

        Ok(signal)
    }

    // -------------------------------------------------------------------------
    // Close
    // -------------------------------------------------------------------------

    /// Transition an Active signal to the closed state matching `reason`.
    ///
    /// Of several concurrent calls for one id exactly one succeeds; the
    /// others get `NotActive`.
    pub fn close(
        &self,
        id: &str,
        reason: CloseReason,
        close_price: Option<f64>,
    ) -> Result<Signal, Rejection> {
        let key = match self.records.read().get(id) {
            Some(s) => s.key(),
            None => return Err(Rejection::UnknownSignal(id.to_string())),
        };

        let lock = self.key_lock(&key);
        let result = {
            let _guard = lock.lock();
            self.close_locked(id, &key, reason, close_price)
        };
        self.release_key_lock(&key, lock);
        result
    }

    fn close_locked(
        &self,
        id: &str,
        key: &SignalKey,
        reason: CloseReason,
        close_price: Option<f64>,
    ) -> Result<Signal, Rejection> {
        let mut signal = match self.records.read().get(id) {
            Some(s) if s.is_active() => s.clone(),
            Some(_) => return Err(Rejection::NotActive(id.to_string())),
            None => return Err(Rejection::UnknownSignal(id.to_string())),
        };

        signal.status = reason.into();
        signal.closed_at = Some(Utc::now());
        signal.close_price = close_price;

        if let Err(e) = self.repository.upsert(&signal) {
            error!(id, error = %e, "failed to persist signal close");
            return Err(Rejection::Storage(e.to_string()));
        }

        self.records.write().insert(signal.id.clone(), signal.clone());
        {
            let mut active = self.active.write();
            if active.get(key).map(String::as_str) == Some(id) {
                active.remove(key);
            }
        }

        info!(
            id,
            key = %key,
            reason = %reason,
            close_price = ?close_price,
            "signal closed"
        );

        Ok(signal)
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    pub fn get(&self, id: &str) -> Option<Signal> {
        self.records.read().get(id).cloned()
    }

    pub fn get_active(&self, owner: &str, instrument: &str) -> Option<Signal> {
        let key = SignalKey::new(owner, instrument);
        let id = self.active.read().get(&key).cloned()?;
        self.records
            .read()
            .get(&id)
            .filter(|s| s.is_active())
            .cloned()
    }

    pub fn is_active(&self, id: &str) -> bool {
        self.records
            .read()
            .get(id)
            .is_some_and(Signal::is_active)
    }

    /// Snapshot of every Active signal, oldest first.
    pub fn list_active(&self) -> Vec<Signal> {
        let mut active: Vec<Signal> = self
            .records
            .read()
            .values()
            .filter(|s| s.is_active())
            .cloned()
            .collect();
        active.sort_by(|a, b| a.opened_at.cmp(&b.opened_at));
        active
    }

    /// The most recent `limit` closed signals, newest first.
    pub fn history(&self, limit: usize) -> Vec<Signal> {
        let mut closed: Vec<Signal> = self
            .records
            .read()
            .values()
            .filter(|s| !s.is_active())
            .cloned()
            .collect();
        closed.sort_by(|a, b| b.closed_at.cmp(&a.closed_at));
        closed.truncate(limit);
        closed
    }
}

impl std::fmt::Debug for SignalStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalStore")
            .field("signals", &self.records.read().len())
            .field("active", &self.active.read().len())
            .finish()
    }
}
