// =============================================================================
// Runtime Configuration — engine settings with atomic save
// =============================================================================
//
// Every tunable lives here. Persistence uses an atomic tmp + rename pattern
// to prevent corruption on crash. All fields carry `#[serde(default)]` so
// that adding new fields never breaks loading an older config file.
// =============================================================================

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::indicators::IndicatorWindows;
use crate::types::GLOBAL_OWNER;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_symbols() -> Vec<String> {
    vec!["BTCUSDT".to_string(), "ETHUSDT".to_string(), "SOLUSDT".to_string()]
}

fn default_timeframe() -> String {
    "5m".to_string()
}

fn default_history_bars() -> usize {
    200
}

fn default_poll_interval_ms() -> u64 {
    5_000
}

fn default_poll_timeout_ms() -> u64 {
    3_000
}

fn default_history_timeout_ms() -> u64 {
    10_000
}

fn default_reconcile_interval_secs() -> u64 {
    30
}

fn default_scan_interval_secs() -> u64 {
    300
}

fn default_store_path() -> String {
    "signals".to_string()
}

fn default_bind_addr() -> String {
    "127.0.0.1:3001".to_string()
}

fn default_fast_period() -> usize {
    9
}

fn default_slow_period() -> usize {
    21
}

fn default_momentum_period() -> usize {
    14
}

fn default_volatility_period() -> usize {
    14
}

fn default_long_band() -> (f64, f64) {
    (50.0, 70.0)
}

fn default_short_band() -> (f64, f64) {
    (30.0, 50.0)
}

fn default_min_volatility_pct() -> f64 {
    0.05
}

fn default_tp_multiplier() -> f64 {
    2.0
}

fn default_sl_multiplier() -> f64 {
    1.0
}

// =============================================================================
// OwnershipScope
// =============================================================================

/// Scope of the "one active signal" rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OwnershipScope {
    /// One active signal per (subscriber, instrument).
    #[default]
    PerSubscriber,
    /// One active signal per instrument shared by every subscriber.
    Global,
}

impl OwnershipScope {
    /// Map a requester's key onto the owner key the store is keyed by.
    pub fn owner_key(self, requester: &str) -> String {
        match self {
            Self::PerSubscriber => requester.to_string(),
            Self::Global => GLOBAL_OWNER.to_string(),
        }
    }
}

impl std::fmt::Display for OwnershipScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PerSubscriber => write!(f, "PerSubscriber"),
            Self::Global => write!(f, "Global"),
        }
    }
}

// =============================================================================
// DecisionParams
// =============================================================================

/// Thresholds and windows for the decision engine. Numeric values are policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionParams {
    #[serde(default = "default_fast_period")]
    pub fast_period: usize,

    #[serde(default = "default_slow_period")]
    pub slow_period: usize,

    #[serde(default = "default_momentum_period")]
    pub momentum_period: usize,

    #[serde(default = "default_volatility_period")]
    pub volatility_period: usize,

    /// Inclusive momentum band a Long setup must sit in.
    #[serde(default = "default_long_band")]
    pub long_momentum_band: (f64, f64),

    /// Inclusive momentum band a Short setup must sit in.
    #[serde(default = "default_short_band")]
    pub short_momentum_band: (f64, f64),

    /// Minimum volatility as a percentage of price (0.05 means 0.05 %).
    #[serde(default = "default_min_volatility_pct")]
    pub min_volatility_pct: f64,

    /// Volatility multiple from entry to take-profit.
    #[serde(default = "default_tp_multiplier")]
    pub tp_multiplier: f64,

    /// Volatility multiple from entry to stop-loss.
    #[serde(default = "default_sl_multiplier")]
    pub sl_multiplier: f64,
}

impl Default for DecisionParams {
    fn default() -> Self {
        Self {
            fast_period: default_fast_period(),
            slow_period: default_slow_period(),
            momentum_period: default_momentum_period(),
            volatility_period: default_volatility_period(),
            long_momentum_band: default_long_band(),
            short_momentum_band: default_short_band(),
            min_volatility_pct: default_min_volatility_pct(),
            tp_multiplier: default_tp_multiplier(),
            sl_multiplier: default_sl_multiplier(),
        }
    }
}

impl DecisionParams {
    pub fn windows(&self) -> IndicatorWindows {
        IndicatorWindows {
            fast: self.fast_period,
            slow: self.slow_period,
            momentum: self.momentum_period,
            volatility: self.volatility_period,
        }
    }

    /// Reject parameter sets that could produce undefined indicators or
    /// zero-width targets.
    pub fn validate(&self) -> Result<()> {
        let periods = [
            self.fast_period,
            self.slow_period,
            self.momentum_period,
            self.volatility_period,
        ];
        if periods.contains(&0) {
            anyhow::bail!("indicator periods must be non-zero");
        }
        if self.fast_period >= self.slow_period {
            anyhow::bail!(
                "fast_period ({}) must be shorter than slow_period ({})",
                self.fast_period,
                self.slow_period
            );
        }
        for (name, (lo, hi)) in [
            ("long_momentum_band", self.long_momentum_band),
            ("short_momentum_band", self.short_momentum_band),
        ] {
            if !(0.0..=100.0).contains(&lo) || !(0.0..=100.0).contains(&hi) || lo > hi {
                anyhow::bail!("{name} must satisfy 0 <= low <= high <= 100, got ({lo}, {hi})");
            }
        }
        let positive = |v: f64| v.is_finite() && v > 0.0;
        if !positive(self.tp_multiplier) || !positive(self.sl_multiplier) {
            anyhow::bail!("tp_multiplier and sl_multiplier must be positive");
        }
        if !(self.min_volatility_pct.is_finite() && self.min_volatility_pct >= 0.0) {
            anyhow::bail!("min_volatility_pct must be non-negative");
        }
        Ok(())
    }
}

// =============================================================================
// RuntimeConfig
// =============================================================================

/// Top-level runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    // --- Instruments --------------------------------------------------------

    /// Instruments scanned by the auto-scan loop.
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,

    /// Candle interval used for history requests.
    #[serde(default = "default_timeframe")]
    pub timeframe: String,

    /// Number of bars requested per decision cycle.
    #[serde(default = "default_history_bars")]
    pub history_bars: usize,

    // --- Gating -------------------------------------------------------------

    #[serde(default)]
    pub ownership_scope: OwnershipScope,

    /// Requester keys allowed to close any signal.
    #[serde(default)]
    pub admin_keys: Vec<String>,

    // --- Watcher ------------------------------------------------------------

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Upper bound on a single quote request.
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,

    /// Upper bound on a history request.
    #[serde(default = "default_history_timeout_ms")]
    pub history_timeout_ms: u64,

    #[serde(default = "default_reconcile_interval_secs")]
    pub reconcile_interval_secs: u64,

    // --- Auto scan ----------------------------------------------------------

    #[serde(default)]
    pub auto_scan: bool,

    #[serde(default = "default_scan_interval_secs")]
    pub scan_interval_secs: u64,

    // --- I/O ----------------------------------------------------------------

    /// Directory backing the signal store, one JSON file per signal.
    #[serde(default = "default_store_path")]
    pub store_path: String,

    /// Optional HTTP endpoint receiving lifecycle events as JSON.
    #[serde(default)]
    pub webhook_url: Option<String>,

    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Bearer token the API requires. Taken from `SIGNAL_API_TOKEN` only and
    /// never written back to the config file.
    #[serde(skip)]
    pub api_token: Option<String>,

    // --- Decision -----------------------------------------------------------

    #[serde(default)]
    pub decision: DecisionParams,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            symbols: default_symbols(),
            timeframe: default_timeframe(),
            history_bars: default_history_bars(),
            ownership_scope: OwnershipScope::default(),
            admin_keys: Vec::new(),
            poll_interval_ms: default_poll_interval_ms(),
            poll_timeout_ms: default_poll_timeout_ms(),
            history_timeout_ms: default_history_timeout_ms(),
            reconcile_interval_secs: default_reconcile_interval_secs(),
            auto_scan: false,
            scan_interval_secs: default_scan_interval_secs(),
            store_path: default_store_path(),
            webhook_url: None,
            bind_addr: default_bind_addr(),
            api_token: None,
            decision: DecisionParams::default(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;

        info!(
            path = %path.display(),
            symbols = ?config.symbols,
            scope = %config.ownership_scope,
            "runtime config loaded"
        );

        Ok(config)
    }

    /// Load `path` (defaults if it cannot be read) and layer the `SIGNAL_*`
    /// environment on top. Returns `(file, effective)`: only `file` may be
    /// saved back, so overrides and secrets never end up on disk.
    pub fn load_layered(path: impl AsRef<Path>) -> (Self, Self) {
        let file = Self::load(path).unwrap_or_else(|e| {
            warn!(error = %e, "failed to load config, using defaults");
            Self::default()
        });
        let mut effective = file.clone();
        effective.apply_env_overrides();
        (file, effective)
    }

    /// Persist the configuration to `path` (write `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise runtime config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }

    /// Check cross-field consistency.
    pub fn validate(&self) -> Result<()> {
        self.decision.validate().context("invalid decision parameters")?;
        if self.poll_interval_ms == 0 {
            anyhow::bail!("poll_interval_ms must be non-zero");
        }
        if self.poll_timeout_ms == 0 || self.history_timeout_ms == 0 {
            anyhow::bail!("timeouts must be non-zero");
        }
        if self.history_bars < self.decision.windows().min_bars() {
            anyhow::bail!(
                "history_bars ({}) is below the {} bars the indicator windows need",
                self.history_bars,
                self.decision.windows().min_bars()
            );
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn history_timeout(&self) -> Duration {
        Duration::from_millis(self.history_timeout_ms)
    }

    /// Apply `SIGNAL_*` environment overrides.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(syms) = std::env::var("SIGNAL_SYMBOLS") {
            self.symbols = split_list(&syms)
                .into_iter()
                .map(|s| s.to_uppercase())
                .collect();
        }
        if let Ok(keys) = std::env::var("SIGNAL_ADMIN_KEYS") {
            self.admin_keys = split_list(&keys);
        }
        if let Ok(addr) = std::env::var("SIGNAL_BIND_ADDR") {
            self.bind_addr = addr;
        }
        if let Ok(url) = std::env::var("SIGNAL_WEBHOOK_URL") {
            self.webhook_url = Some(url).filter(|u| !u.trim().is_empty());
        }
        if let Ok(path) = std::env::var("SIGNAL_STORE_PATH") {
            self.store_path = path;
        }
        if let Ok(token) = std::env::var("SIGNAL_API_TOKEN") {
            self.api_token = Some(token).filter(|t| !t.trim().is_empty());
        }
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.symbols[0], "BTCUSDT");
        assert_eq!(cfg.timeframe, "5m");
        assert_eq!(cfg.ownership_scope, OwnershipScope::PerSubscriber);
        assert!(!cfg.auto_scan);
        assert!(cfg.webhook_url.is_none());
        assert!(cfg.api_token.is_none());
        assert_eq!(cfg.bind_addr, "127.0.0.1:3001");
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn env_overrides_stay_out_of_the_saved_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("signal_config.json");
        RuntimeConfig::default().save(&path).unwrap();

        std::env::set_var("SIGNAL_WEBHOOK_URL", "http://hooks.local/secret");
        std::env::set_var("SIGNAL_API_TOKEN", "s3cret-token");
        let (file, effective) = RuntimeConfig::load_layered(&path);
        std::env::remove_var("SIGNAL_WEBHOOK_URL");
        std::env::remove_var("SIGNAL_API_TOKEN");

        assert_eq!(effective.webhook_url.as_deref(), Some("http://hooks.local/secret"));
        assert_eq!(effective.api_token.as_deref(), Some("s3cret-token"));
        assert!(file.webhook_url.is_none());

        file.save(&path).unwrap();
        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(!raw.contains("hooks.local"));
        assert!(!raw.contains("s3cret-token"));
    }

    #[test]
    fn layered_load_without_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let (file, _) = RuntimeConfig::load_layered(dir.path().join("missing.json"));
        assert_eq!(file.history_bars, 200);
    }

    #[test]
    fn api_token_is_never_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("signal_config.json");
        let mut cfg = RuntimeConfig::default();
        cfg.api_token = Some("s3cret".into());
        cfg.save(&path).unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(!raw.contains("s3cret"));
        assert!(RuntimeConfig::load(&path).unwrap().api_token.is_none());
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: RuntimeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.history_bars, 200);
        assert_eq!(cfg.poll_interval_ms, 5_000);
        assert_eq!(cfg.decision, DecisionParams::default());
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "ownership_scope": "Global", "decision": { "fast_period": 5 } }"#;
        let cfg: RuntimeConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.ownership_scope, OwnershipScope::Global);
        assert_eq!(cfg.decision.fast_period, 5);
        assert_eq!(cfg.decision.slow_period, 21);
    }

    #[test]
    fn save_then_load_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("signal_config.json");
        let mut cfg = RuntimeConfig::default();
        cfg.symbols = vec!["XRPUSDT".into()];
        cfg.admin_keys = vec!["ops".into()];
        cfg.save(&path).unwrap();

        let loaded = RuntimeConfig::load(&path).unwrap();
        assert_eq!(loaded.symbols, vec!["XRPUSDT"]);
        assert_eq!(loaded.admin_keys, vec!["ops"]);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn load_missing_file_is_error() {
        assert!(RuntimeConfig::load("/definitely/not/here.json").is_err());
    }

    #[test]
    fn owner_key_follows_scope() {
        assert_eq!(OwnershipScope::PerSubscriber.owner_key("alice"), "alice");
        assert_eq!(OwnershipScope::Global.owner_key("alice"), GLOBAL_OWNER);
    }

    #[test]
    fn validate_rejects_bad_decision_params() {
        let mut p = DecisionParams::default();
        p.fast_period = 30;
        assert!(p.validate().is_err());

        let mut p = DecisionParams::default();
        p.long_momentum_band = (80.0, 60.0);
        assert!(p.validate().is_err());

        let mut p = DecisionParams::default();
        p.sl_multiplier = 0.0;
        assert!(p.validate().is_err());
    }

    #[test]
    fn validate_rejects_short_history() {
        let mut cfg = RuntimeConfig::default();
        cfg.history_bars = 10;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn split_list_trims_and_drops_empties() {
        assert_eq!(split_list(" a, b ,,c "), vec!["a", "b", "c"]);
    }
}
