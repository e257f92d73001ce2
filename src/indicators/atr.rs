// =============================================================================
// Average True Range (ATR) — Wilder's Smoothing Method
// =============================================================================
//
// True Range (TR) for each bar after the first:
//   TR = max(H - L, |H - prevClose|, |L - prevClose|)
//
// ATR_0 = SMA of the first `period` TR values
// ATR_t = (ATR_{t-1} * (period - 1) + TR_t) / period
// =============================================================================

use crate::market_data::PriceBar;

/// Compute the most recent ATR from parallel high / low / close slices
/// (oldest first).
///
/// # Returns
/// `None` when:
/// - `period` is zero.
/// - The slices differ in length.
/// - There are fewer than `period + 1` bars (each TR needs a previous close).
/// - Any intermediate value is non-finite.
pub fn volatility(highs: &[f64], lows: &[f64], closes: &[f64], period: usize) -> Option<f64> {
    let n = closes.len();
    if period == 0 || highs.len() != n || lows.len() != n || n < period + 1 {
        return None;
    }

    let tr_values: Vec<f64> = (1..n)
        .map(|i| true_range(highs[i], lows[i], closes[i - 1]))
        .collect();

    let seed: f64 = tr_values[..period].iter().sum::<f64>() / period as f64;
    if !seed.is_finite() {
        return None;
    }

    let period_f = period as f64;
    let mut atr = seed;
    for &tr in &tr_values[period..] {
        atr = (atr * (period_f - 1.0) + tr) / period_f;
        if !atr.is_finite() {
            return None;
        }
    }

    Some(atr)
}

/// ATR over a bar sequence.
pub fn bar_volatility(bars: &[PriceBar], period: usize) -> Option<f64> {
    let highs: Vec<f64> = bars.iter().map(|b| b.high).collect();
    let lows: Vec<f64> = bars.iter().map(|b| b.low).collect();
    let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
    volatility(&highs, &lows, &closes, period)
}

fn true_range(high: f64, low: f64, prev_close: f64) -> f64 {
    let hl = high - low;
    let hc = (high - prev_close).abs();
    let lc = (low - prev_close).abs();
    // f64::max drops NaN operands; propagate instead so bad bars poison the result.
    if hl.is_nan() || hc.is_nan() || lc.is_nan() {
        return f64::NAN;
    }
    hl.max(hc).max(lc)
}
