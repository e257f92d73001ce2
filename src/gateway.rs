// =============================================================================
// Signal Gateway — the gating API in front of the store
// =============================================================================
//
// request_signal:
//   0. Normalise the instrument; anything but 2-20 ASCII letters/digits is
//      rejected with InvalidInstrument.
//   1. Map the requester onto an owner key (per-subscriber or global scope).
//   2. Short-circuit with AlreadyActive if the key is occupied.
//   3. Fetch history under a timeout and run the decision engine.
//   4. `try_open` in the store (the only authority on uniqueness), then
//      emit `Opened`, then start the watch task.
//
// request_manual_close:
//   1. Authorise: requester must own the signal or be an admin key.
//   2. Close in the store first, then cancel the watch task, then emit
//      `ClosedManual`.
//
// Every evaluation is kept in a bounded ring of recent decisions.
// =============================================================================

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::decision_engine::DecisionEngine;
use crate::decision_envelope::DecisionEnvelope;
use crate::error::Rejection;
use crate::market_data::MarketDataSource;
use crate::notify::{notify, NotificationSink};
use crate::runtime_config::{OwnershipScope, RuntimeConfig};
use crate::signal_store::SignalStore;
use crate::types::{CloseReason, LifecycleEvent, Signal, GLOBAL_OWNER};
use crate::watcher::WatchScheduler;

/// Maximum number of recent decisions to retain.
const MAX_RECENT_DECISIONS: usize = 100;

#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub timeframe: String,
    pub history_bars: usize,
    pub history_timeout: Duration,
    pub ownership_scope: OwnershipScope,
    pub admin_keys: HashSet<String>,
}

impl GatewaySettings {
    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self {
            timeframe: config.timeframe.clone(),
            history_bars: config.history_bars,
            history_timeout: config.history_timeout(),
            ownership_scope: config.ownership_scope,
            admin_keys: config.admin_keys.iter().cloned().collect(),
        }
    }
}

/// Uppercased exchange symbol: 2 to 20 ASCII letters or digits.
pub fn normalize_instrument(raw: &str) -> Option<String> {
    let symbol = raw.trim().to_ascii_uppercase();
    let valid = (2..=20).contains(&symbol.len())
        && symbol.bytes().all(|b| b.is_ascii_uppercase() || b.is_ascii_digit());
    valid.then_some(symbol)
}

pub struct SignalGateway {
    engine: DecisionEngine,
    store: Arc<SignalStore>,
    scheduler: WatchScheduler,
    source: Arc<dyn MarketDataSource>,
    sink: Arc<dyn NotificationSink>,
    settings: GatewaySettings,
    recent_decisions: RwLock<VecDeque<DecisionEnvelope>>,
}

impl SignalGateway {
    pub fn new(
        engine: DecisionEngine,
        store: Arc<SignalStore>,
        scheduler: WatchScheduler,
        source: Arc<dyn MarketDataSource>,
        sink: Arc<dyn NotificationSink>,
        settings: GatewaySettings,
    ) -> Self {
        Self {
            engine,
            store,
            scheduler,
            source,
            sink,
            settings,
            recent_decisions: RwLock::new(VecDeque::with_capacity(MAX_RECENT_DECISIONS)),
        }
    }

    fn owner_for(&self, requester: &str) -> String {
        self.settings.ownership_scope.owner_key(requester)
    }

    fn is_admin(&self, requester: &str) -> bool {
        self.settings.admin_keys.contains(requester)
    }

    fn push_decision(&self, envelope: DecisionEnvelope) {
        let mut decisions = self.recent_decisions.write();
        decisions.push_back(envelope);
        while decisions.len() > MAX_RECENT_DECISIONS {
            decisions.pop_front();
        }
    }

    /// Recent decision envelopes, newest first.
    pub fn recent_decisions(&self, limit: usize) -> Vec<DecisionEnvelope> {
        self.recent_decisions
            .read()
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    // -------------------------------------------------------------------------
    // Request a signal
    // -------------------------------------------------------------------------

    pub async fn request_signal(&self, requester: &str, instrument: &str) -> Result<Signal, Rejection> {
        let instrument = normalize_instrument(instrument)
            .ok_or_else(|| Rejection::InvalidInstrument(instrument.to_string()))?;
        let owner = self.owner_for(requester);

        if let Some(active) = self.store.get_active(&owner, &instrument) {
            debug!(owner = %owner, instrument = %instrument, id = %active.id, "signal already active");
            return Err(Rejection::AlreadyActive(active.key().to_string()));
        }

        let fetch = self.source.fetch_history(
            &instrument,
            &self.settings.timeframe,
            self.settings.history_bars,
        );
        let bars = match timeout(self.settings.history_timeout, fetch).await {
            Ok(Ok(bars)) => bars,
            Ok(Err(e)) => {
                warn!(instrument = %instrument, error = %e, "history fetch failed");
                return Err(Rejection::DataUnavailable(format!("{instrument}: {e}")));
            }
            Err(_) => {
                warn!(
                    instrument = %instrument,
                    timeout_ms = self.settings.history_timeout.as_millis() as u64,
                    "history fetch timed out"
                );
                return Err(Rejection::DataUnavailable(format!("{instrument}: history timed out")));
            }
        };

        let (envelope, proposal) = self.engine.evaluate(&instrument, &bars);
        let reason = envelope.reason.clone().unwrap_or_default();
        let blocking = envelope.blocking_stage;
        self.push_decision(envelope);

        let proposal = match proposal {
            Some(p) => p,
            None => {
                debug!(instrument = %instrument, stage = ?blocking, reason = %reason, "no setup");
                return Err(Rejection::NoSetup(format!("{instrument}: {reason}")));
            }
        };

        let signal = self
            .store
            .try_open(&owner, &instrument, &proposal, &self.settings.timeframe)?;

        // Opened must reach subscribers before the watcher can emit a close.
        notify(self.sink.as_ref(), &LifecycleEvent::opened(&signal)).await;
        self.scheduler.watch(&signal);

        Ok(signal)
    }

    // -------------------------------------------------------------------------
    // Manual close
    // -------------------------------------------------------------------------

    pub async fn request_manual_close(&self, signal_id: &str, requester: &str) -> Result<Signal, Rejection> {
        let signal = self
            .store
            .get(signal_id)
            .ok_or_else(|| Rejection::UnknownSignal(signal_id.to_string()))?;

        if signal.owner_key != requester && !self.is_admin(requester) {
            warn!(id = signal_id, requester, owner = %signal.owner_key, "manual close refused");
            return Err(Rejection::NotOwner {
                signal_id: signal_id.to_string(),
                requester: requester.to_string(),
            });
        }

        if !signal.is_active() {
            return Err(Rejection::NotActive(signal_id.to_string()));
        }

        let price = self.close_price(&signal).await;
        let closed = self.store.close(signal_id, CloseReason::Manual, price)?;
        self.scheduler.cancel(signal_id);

        info!(id = signal_id, requester, price = ?price, "signal closed manually");
        notify(
            self.sink.as_ref(),
            &LifecycleEvent::closed(&closed, CloseReason::Manual),
        )
        .await;

        Ok(closed)
    }

    /// Last quote seen by the watcher, else a fresh quote, else nothing.
    async fn close_price(&self, signal: &Signal) -> Option<f64> {
        if let Some(p) = self.scheduler.last_price(&signal.id) {
            return Some(p);
        }
        let poll_timeout = self.scheduler.settings().poll_timeout;
        match timeout(poll_timeout, self.source.fetch_quote(&signal.instrument_key)).await {
            Ok(Ok(p)) if p.is_finite() && p > 0.0 => Some(p),
            _ => None,
        }
    }

    // -------------------------------------------------------------------------
    // Auto-scan
    // -------------------------------------------------------------------------

    /// Request a signal for each instrument under the global owner. Returns
    /// the signals that were opened.
    pub async fn scan_once(&self, instruments: &[String]) -> Vec<Signal> {
        let mut opened = Vec::new();
        for instrument in instruments {
            match self.request_signal(GLOBAL_OWNER, instrument).await {
                Ok(signal) => opened.push(signal),
                Err(Rejection::AlreadyActive(_)) | Err(Rejection::NoSetup(_)) => {}
                Err(e) => warn!(instrument = %instrument, error = %e, "scan request failed"),
            }
        }
        if !opened.is_empty() {
            info!(opened = opened.len(), "scan opened signals");
        }
        opened
    }
}
