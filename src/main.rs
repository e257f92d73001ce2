// =============================================================================
// Signal Sentinel — Main Entry Point
// =============================================================================
//
// Startup order:
//   1. Environment, logging, config (file -> env overrides -> validate).
//   2. Signal store from the JSON record directory.
//   3. Market data client and notification sinks.
//   4. Watch recovery for every persisted Active signal.
//   5. Background loops: reconciliation, optional auto-scan, API server.
//   6. Ctrl+C: stop loops, cancel watch tasks, save the file-level config
//      (environment overrides and secrets are not written back).
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod decision_engine;
mod decision_envelope;
mod error;
mod gateway;
mod indicators;
mod market_data;
mod notify;
mod runtime_config;
mod signal_store;
mod types;
mod watcher;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::gateway::SignalGateway;
use crate::market_data::BinanceClient;
use crate::notify::{NotificationSink, WebhookSink};
use crate::runtime_config::RuntimeConfig;
use crate::signal_store::JsonDirRepository;

const CONFIG_PATH: &str = "signal_config.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Signal Sentinel — Starting Up                     ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let (file_config, config) = RuntimeConfig::load_layered(CONFIG_PATH);
    config.validate().context("refusing to start with invalid config")?;

    info!(
        symbols = ?config.symbols,
        timeframe = %config.timeframe,
        scope = %config.ownership_scope,
        poll_interval_ms = config.poll_interval_ms,
        auto_scan = config.auto_scan,
        "Configuration ready"
    );

    // ── 2. Store ─────────────────────────────────────────────────────────
    let repository = Arc::new(JsonDirRepository::open(&config.store_path)?);

    // ── 3. Market data & sinks ───────────────────────────────────────────
    let source = Arc::new(BinanceClient::new(config.history_timeout())?);

    let mut sinks: Vec<Arc<dyn NotificationSink>> = Vec::new();
    if let Some(url) = config.webhook_url.clone() {
        info!(url = %url, "Webhook notifications enabled");
        sinks.push(Arc::new(WebhookSink::new(url, config.poll_timeout())?));
    }

    let reconcile_every = Duration::from_secs(config.reconcile_interval_secs.max(1));
    let scan = config
        .auto_scan
        .then(|| (config.symbols.clone(), Duration::from_secs(config.scan_interval_secs.max(1))));
    let bind_addr = config.bind_addr.clone();

    let state = Arc::new(AppState::assemble(config, repository, source, sinks)?);

    // ── 4. Recover watch tasks ───────────────────────────────────────────
    let recovered = state.scheduler.recover();
    info!(recovered, "Watch recovery complete");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── 5a. Reconciliation loop ──────────────────────────────────────────
    let reconcile_handle = tokio::spawn(
        state
            .scheduler
            .clone()
            .run_reconcile_loop(reconcile_every, shutdown_rx.clone()),
    );

    // ── 5b. Auto-scan loop ───────────────────────────────────────────────
    let scan_handle = scan.map(|(symbols, every)| {
        tokio::spawn(run_scan_loop(
            state.gateway.clone(),
            symbols,
            every,
            shutdown_rx.clone(),
        ))
    });

    // ── 5c. API server ───────────────────────────────────────────────────
    let api_state = state.clone();
    let mut api_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        let app = api::router(api_state);
        let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
            Ok(l) => l,
            Err(e) => {
                error!(addr = %bind_addr, error = %e, "Failed to bind API server");
                return;
            }
        };
        info!(addr = %bind_addr, "API server listening");
        let graceful = async move {
            let _ = api_shutdown.wait_for(|stop| *stop).await;
        };
        if let Err(e) = axum::serve(listener, app).with_graceful_shutdown(graceful).await {
            error!(error = %e, "API server failed");
        }
    });

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 6. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — stopping gracefully");

    let _ = shutdown_tx.send(true);
    if let Err(e) = reconcile_handle.await {
        warn!(error = %e, "Reconciliation loop ended abnormally");
    }
    if let Some(handle) = scan_handle {
        if let Err(e) = handle.await {
            warn!(error = %e, "Scan loop ended abnormally");
        }
    }
    state.scheduler.shutdown().await;

    if let Err(e) = file_config.save(CONFIG_PATH) {
        error!(error = %e, "Failed to save runtime config on shutdown");
    }

    info!("Signal Sentinel shut down complete.");
    Ok(())
}

/// Request a global-scope signal for every symbol each `every`, until
/// `shutdown` flips to `true`.
async fn run_scan_loop(
    gateway: Arc<SignalGateway>,
    symbols: Vec<String>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(symbols = ?symbols, interval_secs = every.as_secs(), "Auto-scan loop started");
    let mut interval = tokio::time::interval(every);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                gateway.scan_once(&symbols).await;
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    info!("Auto-scan loop stopped");
}
