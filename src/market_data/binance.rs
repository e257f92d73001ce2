// =============================================================================
// Binance public REST client — klines and ticker price
// =============================================================================
//
// Only unsigned market-data endpoints are used; no API key is required.
// Every request is bounded by the reqwest client timeout.
// =============================================================================

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, instrument, warn};

use super::{MarketDataSource, PriceBar};

const DEFAULT_BASE_URL: &str = "https://api.binance.com";

/// Binance's hard cap on `limit` for /api/v3/klines.
const MAX_KLINES: usize = 1000;

#[derive(Clone)]
pub struct BinanceClient {
    base_url: String,
    client: reqwest::Client,
}

impl BinanceClient {
    /// Create a client against the public Binance API.
    pub fn new(timeout: Duration) -> Result<Self> {
        Self::with_base_url(DEFAULT_BASE_URL, timeout)
    }

    /// Create a client against an alternative base URL (testnet, proxy).
    pub fn with_base_url(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build reqwest client")?;

        let base_url = base_url.into();
        debug!(base_url = %base_url, "BinanceClient initialised");

        Ok(Self { base_url, client })
    }

    /// GET `path` with `query` form-encoded onto the URL.
    fn request(&self, path: &str, query: &[(&str, String)]) -> reqwest::RequestBuilder {
        self.client
            .get(format!("{}{}", self.base_url, path))
            .query(query)
    }

    async fn get_json(&self, path: &str, query: &[(&str, String)]) -> Result<serde_json::Value> {
        let resp = self
            .request(path, query)
            .send()
            .await
            .with_context(|| format!("GET {path} request failed"))?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .with_context(|| format!("failed to parse {path} response"))?;

        if !status.is_success() {
            anyhow::bail!("Binance GET {path} returned {status}: {body}");
        }
        Ok(body)
    }

    /// Parse a JSON value that may be either a string or a number into `f64`.
    fn parse_str_f64(val: &serde_json::Value) -> Result<f64> {
        if let Some(s) = val.as_str() {
            s.parse::<f64>()
                .with_context(|| format!("failed to parse '{s}' as f64"))
        } else if let Some(n) = val.as_f64() {
            Ok(n)
        } else {
            anyhow::bail!("expected string or number, got: {val}")
        }
    }
}

/// Convert a /api/v3/klines body into bars.
///
/// Array indices used: [0] openTime, [1] open, [2] high, [3] low, [4] close.
fn parse_klines(body: &serde_json::Value) -> Result<Vec<PriceBar>> {
    let raw = body.as_array().context("klines response is not an array")?;

    let mut bars = Vec::with_capacity(raw.len());
    for entry in raw {
        let arr = entry.as_array().context("kline entry is not an array")?;
        if arr.len() < 5 {
            warn!("skipping malformed kline entry with {} elements", arr.len());
            continue;
        }
        let timestamp = arr[0].as_i64().context("kline open time is not an integer")?;
        bars.push(PriceBar::new(
            timestamp,
            BinanceClient::parse_str_f64(&arr[1])?,
            BinanceClient::parse_str_f64(&arr[2])?,
            BinanceClient::parse_str_f64(&arr[3])?,
            BinanceClient::parse_str_f64(&arr[4])?,
        ));
    }
    Ok(bars)
}

#[async_trait]
impl MarketDataSource for BinanceClient {
    #[instrument(skip(self), name = "binance::fetch_history")]
    async fn fetch_history(
        &self,
        instrument: &str,
        timeframe: &str,
        count: usize,
    ) -> Result<Vec<PriceBar>> {
        let limit = count.clamp(1, MAX_KLINES);
        let query = [
            ("symbol", instrument.to_string()),
            ("interval", timeframe.to_string()),
            ("limit", limit.to_string()),
        ];
        let body = self.get_json("/api/v3/klines", &query).await?;
        let bars = parse_klines(&body)?;
        debug!(instrument, timeframe, count = bars.len(), "klines fetched");
        Ok(bars)
    }

    #[instrument(skip(self), name = "binance::fetch_quote")]
    async fn fetch_quote(&self, instrument: &str) -> Result<f64> {
        let query = [("symbol", instrument.to_string())];
        let body = self.get_json("/api/v3/ticker/price", &query).await?;
        let price = Self::parse_str_f64(&body["price"]).context("ticker response missing price")?;
        debug!(instrument, price, "quote fetched");
        Ok(price)
    }
}

impl std::fmt::Debug for BinanceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinanceClient")
            .field("base_url", &self.base_url)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_string_and_number_prices() {
        assert_eq!(BinanceClient::parse_str_f64(&serde_json::json!("1.5")).unwrap(), 1.5);
        assert_eq!(BinanceClient::parse_str_f64(&serde_json::json!(2.25)).unwrap(), 2.25);
        assert!(BinanceClient::parse_str_f64(&serde_json::json!(null)).is_err());
        assert!(BinanceClient::parse_str_f64(&serde_json::json!("abc")).is_err());
    }

    #[test]
    fn parses_kline_body() {
        let body = serde_json::json!([
            [1700000000000i64, "100.0", "101.5", "99.5", "101.0", "12.0", 1700000059999i64],
            [1700000060000i64, "101.0", "102.0", "100.5", "101.8", "8.0", 1700000119999i64],
        ]);
        let bars = parse_klines(&body).unwrap();
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0].timestamp, 1_700_000_000_000);
        assert_eq!(bars[0].high, 101.5);
        assert_eq!(bars[1].close, 101.8);
    }

    #[test]
    fn skips_short_kline_entries() {
        let body = serde_json::json!([[1i64, "1"], [2i64, "1", "2", "0.5", "1.5"]]);
        let bars = parse_klines(&body).unwrap();
        assert_eq!(bars.len(), 1);
        assert_eq!(bars[0].timestamp, 2);
    }

    #[test]
    fn query_values_are_encoded() {
        let client = BinanceClient::new(Duration::from_secs(1)).unwrap();
        let req = client
            .request("/api/v3/ticker/price", &[("symbol", "BTC&USDT#x".to_string())])
            .build()
            .unwrap();
        assert_eq!(req.url().path(), "/api/v3/ticker/price");
        assert_eq!(req.url().query(), Some("symbol=BTC%26USDT%23x"));
    }

    #[test]
    fn non_array_body_is_error() {
        let body = serde_json::json!({ "code": -1121, "msg": "Invalid symbol." });
        assert!(parse_klines(&body).is_err());
    }
}
