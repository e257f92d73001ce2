// =============================================================================
// Central Application State
// =============================================================================
//
// Ties the subsystems together for the API layer and the background loops.
// All signal state lives in the store; everything else here is either an
// `Arc` handle to a subsystem or a cheap counter.
//
// Wiring:
//   source ──► gateway ──► store ◄── scheduler ──► watch tasks
//                 │                      │
//                 └──────► sink ◄────────┘
//                  (log + broadcast + optional webhook)
// =============================================================================

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{info, warn};

use crate::decision_engine::DecisionEngine;
use crate::gateway::{GatewaySettings, SignalGateway};
use crate::market_data::MarketDataSource;
use crate::notify::{BroadcastSink, FanoutSink, LogSink, NotificationSink};
use crate::runtime_config::{OwnershipScope, RuntimeConfig};
use crate::signal_store::{SignalRepository, SignalStore};
use crate::watcher::{WatchScheduler, WatchSettings};

/// Capacity of the lifecycle-event broadcast channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub uptime_secs: u64,
    pub active_signals: usize,
    pub watch_tasks: usize,
    pub ws_clients: usize,
    pub ownership_scope: OwnershipScope,
    pub symbols: Vec<String>,
    pub timeframe: String,
    pub auto_scan: bool,
    pub server_time: i64,
}

pub struct AppState {
    pub runtime_config: Arc<RwLock<RuntimeConfig>>,
    pub store: Arc<SignalStore>,
    pub scheduler: WatchScheduler,
    pub gateway: Arc<SignalGateway>,
    /// Broadcast side of the sink; WebSocket clients subscribe here.
    pub events: BroadcastSink,
    /// Bearer token front ends must present; `None` refuses every gated call.
    pub api_token: Option<String>,
    pub ws_clients: AtomicUsize,
    started_at: Instant,
}

impl AppState {
    /// Build every subsystem from `config`.
    ///
    /// Lifecycle events go to the log, to WebSocket subscribers and to each
    /// sink in `extra_sinks`.
    pub fn assemble(
        config: RuntimeConfig,
        repository: Arc<dyn SignalRepository>,
        source: Arc<dyn MarketDataSource>,
        extra_sinks: Vec<Arc<dyn NotificationSink>>,
    ) -> Result<Self> {
        let store = Arc::new(SignalStore::open(repository)?);

        let events = BroadcastSink::new(EVENT_CHANNEL_CAPACITY);
        let fanout = extra_sinks.into_iter().fold(
            FanoutSink::new()
                .with(Arc::new(LogSink))
                .with(Arc::new(events.clone())),
            FanoutSink::with,
        );
        info!(sinks = fanout.len(), "notification sinks configured");
        let sink: Arc<dyn NotificationSink> = Arc::new(fanout);

        let scheduler = WatchScheduler::new(
            store.clone(),
            source.clone(),
            sink.clone(),
            WatchSettings {
                poll_interval: config.poll_interval(),
                poll_timeout: config.poll_timeout(),
            },
        );

        let gateway = Arc::new(SignalGateway::new(
            DecisionEngine::new(config.decision.clone()),
            store.clone(),
            scheduler.clone(),
            source,
            sink,
            GatewaySettings::from_config(&config),
        ));

        let api_token = config.api_token.clone().filter(|t| !t.is_empty());
        if api_token.is_none() {
            warn!("SIGNAL_API_TOKEN not set — gated API endpoints will refuse every request");
        }

        Ok(Self {
            api_token,
            runtime_config: Arc::new(RwLock::new(config)),
            store,
            scheduler,
            gateway,
            events,
            ws_clients: AtomicUsize::new(0),
            started_at: Instant::now(),
        })
    }

    pub fn status(&self) -> StatusSnapshot {
        let config = self.runtime_config.read();
        StatusSnapshot {
            uptime_secs: self.started_at.elapsed().as_secs(),
            active_signals: self.store.list_active().len(),
            watch_tasks: self.scheduler.running_count(),
            ws_clients: self.ws_clients.load(Ordering::Relaxed),
            ownership_scope: config.ownership_scope,
            symbols: config.symbols.clone(),
            timeframe: config.timeframe.clone(),
            auto_scan: config.auto_scan,
            server_time: chrono::Utc::now().timestamp_millis(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::scripted::ScriptedSource;
    use crate::signal_store::MemoryRepository;

    #[tokio::test]
    async fn assemble_from_defaults() {
        let state = AppState::assemble(
            RuntimeConfig::default(),
            Arc::new(MemoryRepository::new()),
            Arc::new(ScriptedSource::new()),
            Vec::new(),
        )
        .unwrap();

        let status = state.status();
        assert_eq!(status.active_signals, 0);
        assert_eq!(status.watch_tasks, 0);
        assert_eq!(status.ownership_scope, OwnershipScope::PerSubscriber);
        assert_eq!(status.timeframe, "5m");
    }
}
