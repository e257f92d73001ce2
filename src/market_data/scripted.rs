//! Scripted market data source for tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{MarketDataSource, PriceBar};

/// One scripted response to `fetch_quote`.
#[derive(Debug, Clone, Copy)]
pub enum Quote {
    Price(f64),
    Fail,
    /// Sleep for the given duration before answering with the price.
    Slow(Duration, f64),
}

/// Replays queued quotes per instrument. Once a queue is drained the last
/// price is repeated forever.
#[derive(Default)]
pub struct ScriptedSource {
    quotes: Mutex<HashMap<String, VecDeque<Quote>>>,
    last: Mutex<HashMap<String, f64>>,
    history: Mutex<HashMap<String, Vec<PriceBar>>>,
    history_fails: Mutex<bool>,
    quote_calls: AtomicUsize,
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quotes(self, instrument: &str, quotes: impl IntoIterator<Item = Quote>) -> Self {
        self.push_quotes(instrument, quotes);
        self
    }

    pub fn with_prices(self, instrument: &str, prices: &[f64]) -> Self {
        self.with_quotes(instrument, prices.iter().map(|&p| Quote::Price(p)))
    }

    pub fn with_history(self, instrument: &str, bars: Vec<PriceBar>) -> Self {
        self.history.lock().insert(instrument.to_string(), bars);
        self
    }

    pub fn push_quotes(&self, instrument: &str, quotes: impl IntoIterator<Item = Quote>) {
        self.quotes
            .lock()
            .entry(instrument.to_string())
            .or_default()
            .extend(quotes);
    }

    pub fn fail_history(&self, fail: bool) {
        *self.history_fails.lock() = fail;
    }

    pub fn quote_calls(&self) -> usize {
        self.quote_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MarketDataSource for ScriptedSource {
    async fn fetch_history(
        &self,
        instrument: &str,
        _timeframe: &str,
        count: usize,
    ) -> anyhow::Result<Vec<PriceBar>> {
        if *self.history_fails.lock() {
            anyhow::bail!("scripted history failure");
        }
        let map = self.history.lock();
        let bars = map
            .get(instrument)
            .ok_or_else(|| anyhow::anyhow!("no history for {instrument}"))?;
        let start = bars.len().saturating_sub(count);
        Ok(bars[start..].to_vec())
    }

    async fn fetch_quote(&self, instrument: &str) -> anyhow::Result<f64> {
        self.quote_calls.fetch_add(1, Ordering::SeqCst);
        let next = self
            .quotes
            .lock()
            .get_mut(instrument)
            .and_then(VecDeque::pop_front);

        let quote = match next {
            Some(q) => q,
            None => match self.last.lock().get(instrument) {
                Some(&p) => Quote::Price(p),
                None => anyhow::bail!("no quote scripted for {instrument}"),
            },
        };

        match quote {
            Quote::Price(p) => {
                self.last.lock().insert(instrument.to_string(), p);
                Ok(p)
            }
            Quote::Fail => anyhow::bail!("scripted quote failure"),
            Quote::Slow(delay, p) => {
                tokio::time::sleep(delay).await;
                self.last.lock().insert(instrument.to_string(), p);
                Ok(p)
            }
        }
    }
}
