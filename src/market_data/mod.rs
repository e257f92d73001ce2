// =============================================================================
// Market Data — price bars and the source abstraction
// =============================================================================
//
// The engine never talks to an exchange directly; it goes through
// `MarketDataSource`. Either call may fail transiently and callers must treat
// failure as "skip and retry later".
// =============================================================================

pub mod binance;
#[cfg(test)]
pub mod scripted;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use binance::BinanceClient;

/// A single OHLC bar. Sequences are ordered oldest first.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceBar {
    /// Bar open time, UNIX milliseconds.
    pub timestamp: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

impl PriceBar {
    pub fn new(timestamp: i64, open: f64, high: f64, low: f64, close: f64) -> Self {
        Self {
            timestamp,
            open,
            high,
            low,
            close,
        }
    }
}

/// Source of OHLC history and live quotes.
#[async_trait]
pub trait MarketDataSource: Send + Sync {
    /// Most recent `count` bars for `instrument` on `timeframe`, oldest first.
    async fn fetch_history(
        &self,
        instrument: &str,
        timeframe: &str,
        count: usize,
    ) -> anyhow::Result<Vec<PriceBar>>;

    /// Current traded price of `instrument`.
    async fn fetch_quote(&self, instrument: &str) -> anyhow::Result<f64>;
}

/// Check that a history is usable: non-empty, strictly increasing timestamps,
/// finite prices.
pub fn validate_history(bars: &[PriceBar]) -> Result<(), String> {
    if bars.is_empty() {
        return Err("empty history".to_string());
    }
    for (i, bar) in bars.iter().enumerate() {
        let finite = bar.open.is_finite()
            && bar.high.is_finite()
            && bar.low.is_finite()
            && bar.close.is_finite();
        if !finite {
            return Err(format!("non-finite price in bar {i} (ts={})", bar.timestamp));
        }
    }
    if let Some(w) = bars.windows(2).find(|w| w[1].timestamp <= w[0].timestamp) {
        return Err(format!(
            "timestamps not strictly increasing: {} then {}",
            w[0].timestamp, w[1].timestamp
        ));
    }
    Ok(())
}
