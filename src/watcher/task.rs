// =============================================================================
// Watch Task — one price-polling loop per Active signal
// =============================================================================
//
// Phases:
//   Starting -> Polling -> Resolving -> Terminated
//                 ^            |
//                 +------------+   (close failed with a storage error)
//
// Each tick:
//   1. Stop if cancelled or if the store no longer reports the signal Active.
//   2. Fetch a quote under `poll_timeout`; an error or timeout skips the tick.
//   3. Compare against TP / SL. If TP and SL trigger on the same quote, TP
//      wins.
//   4. On a hit, close through the store. Only the caller whose close
//      succeeds emits the lifecycle event.
//
// Suspension happens only at the interval tick and the quote call; both are
// raced against the cancel channel.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::error::Rejection;
use crate::market_data::MarketDataSource;
use crate::notify::{notify, NotificationSink};
use crate::signal_store::SignalStore;
use crate::types::{CloseReason, Direction, LifecycleEvent, Signal};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WatchPhase {
    Starting,
    Polling,
    Resolving,
    Terminated,
}

impl std::fmt::Display for WatchPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Starting => write!(f, "Starting"),
            Self::Polling => write!(f, "Polling"),
            Self::Resolving => write!(f, "Resolving"),
            Self::Terminated => write!(f, "Terminated"),
        }
    }
}

/// How a watch task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchOutcome {
    /// This task closed the signal.
    Resolved(CloseReason),
    /// The signal was closed by someone else (manual close or a lost race).
    ClosedElsewhere,
    Cancelled,
}

#[derive(Debug, Clone, Copy)]
pub struct WatchSettings {
    pub poll_interval: Duration,
    pub poll_timeout: Duration,
}

/// Resolution rule for one quote.
///
/// Long: TP if `price >= take_profit`, SL if `price <= stop_loss`.
/// Short: TP if `price <= take_profit`, SL if `price >= stop_loss`.
pub fn resolve(
    direction: Direction,
    take_profit: f64,
    stop_loss: f64,
    price: f64,
) -> Option<CloseReason> {
    let (tp_hit, sl_hit) = match direction {
        Direction::Long => (price >= take_profit, price <= stop_loss),
        Direction::Short => (price <= take_profit, price >= stop_loss),
    };
    if tp_hit {
        Some(CloseReason::TakeProfit)
    } else if sl_hit {
        Some(CloseReason::StopLoss)
    } else {
        None
    }
}

/// Status a running task shares with the scheduler.
#[derive(Debug)]
pub struct WatchStatus {
    phase: RwLock<WatchPhase>,
    last_price: RwLock<Option<f64>>,
}

impl WatchStatus {
    pub fn new() -> Self {
        Self {
            phase: RwLock::new(WatchPhase::Starting),
            last_price: RwLock::new(None),
        }
    }

    pub fn phase(&self) -> WatchPhase {
        *self.phase.read()
    }

    pub fn last_price(&self) -> Option<f64> {
        *self.last_price.read()
    }

    fn set_phase(&self, phase: WatchPhase) {
        *self.phase.write() = phase;
    }
}

impl Default for WatchStatus {
    fn default() -> Self {
        Self::new()
    }
}

pub struct WatchTask {
    pub signal: Signal,
    pub store: Arc<SignalStore>,
    pub source: Arc<dyn MarketDataSource>,
    pub sink: Arc<dyn NotificationSink>,
    pub settings: WatchSettings,
    pub status: Arc<WatchStatus>,
    pub cancel: watch::Receiver<bool>,
}

/// Resolves once cancellation is requested or the sender is gone.
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

impl WatchTask {
    pub async fn run(self) -> WatchOutcome {
        let Self {
            signal,
            store,
            source,
            sink,
            settings,
            status,
            mut cancel,
        } = self;

        info!(
            id = %signal.id,
            instrument = %signal.instrument_key,
            direction = %signal.direction,
            take_profit = signal.take_profit,
            stop_loss = signal.stop_loss,
            "watch task started"
        );

        let outcome = poll_loop(&signal, &store, source.as_ref(), sink.as_ref(), settings, &status, &mut cancel).await;

        status.set_phase(WatchPhase::Terminated);
        info!(id = %signal.id, outcome = ?outcome, "watch task terminated");
        outcome
    }
}

async fn poll_loop(
    signal: &Signal,
    store: &SignalStore,
    source: &dyn MarketDataSource,
    sink: &dyn NotificationSink,
    settings: WatchSettings,
    status: &WatchStatus,
    cancel: &mut watch::Receiver<bool>,
) -> WatchOutcome {
    let mut ticker = interval(settings.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    status.set_phase(WatchPhase::Polling);

    loop {
        let ticked = tokio::select! {
            biased;
            _ = cancelled(cancel) => false,
            _ = ticker.tick() => true,
        };
        if !ticked {
            return WatchOutcome::Cancelled;
        }

        if !store.is_active(&signal.id) {
            debug!(id = %signal.id, "signal no longer active — stopping watch");
            return WatchOutcome::ClosedElsewhere;
        }

        let fetched = tokio::select! {
            biased;
            _ = cancelled(cancel) => None,
            r = timeout(settings.poll_timeout, source.fetch_quote(&signal.instrument_key)) => Some(r),
        };
        let price = match fetched {
            None => return WatchOutcome::Cancelled,
            Some(Ok(Ok(p))) if p.is_finite() && p > 0.0 => p,
            Some(Ok(Ok(p))) => {
                warn!(id = %signal.id, price = p, "invalid quote — skipping tick");
                continue;
            }
            Some(Ok(Err(e))) => {
                warn!(id = %signal.id, instrument = %signal.instrument_key, error = %e, "quote fetch failed — skipping tick");
                continue;
            }
            Some(Err(_)) => {
                warn!(
                    id = %signal.id,
                    instrument = %signal.instrument_key,
                    timeout_ms = settings.poll_timeout.as_millis() as u64,
                    "quote fetch timed out — skipping tick"
                );
                continue;
            }
        };

        *status.last_price.write() = Some(price);

        let reason = match resolve(signal.direction, signal.take_profit, signal.stop_loss, price) {
            Some(r) => r,
            None => {
                debug!(id = %signal.id, price, "no resolution");
                continue;
            }
        };

        status.set_phase(WatchPhase::Resolving);
        info!(id = %signal.id, price, reason = %reason, "target hit — closing signal");

        match store.close(&signal.id, reason, Some(price)) {
            Ok(closed) => {
                notify(sink, &LifecycleEvent::closed(&closed, reason)).await;
                return WatchOutcome::Resolved(reason);
            }
            Err(Rejection::NotActive(_)) | Err(Rejection::UnknownSignal(_)) => {
                debug!(id = %signal.id, "signal closed concurrently");
                return WatchOutcome::ClosedElsewhere;
            }
            Err(e) => {
                error!(id = %signal.id, error = %e, "close failed — retrying next tick");
                status.set_phase(WatchPhase::Polling);
            }
        }
    }
}
