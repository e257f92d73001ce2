// =============================================================================
// Technical Indicators Module
// =============================================================================
//
// Pure, side-effect-free indicator functions. Every public function returns
// `Option<T>` (or an empty series) so callers must handle insufficient data
// and non-finite inputs. Identical input always yields bit-identical output.

pub mod atr;
pub mod ema;
pub mod rsi;

use serde::Serialize;

use crate::market_data::PriceBar;

/// Look-back windows for one snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndicatorWindows {
    pub fast: usize,
    pub slow: usize,
    pub momentum: usize,
    pub volatility: usize,
}

impl IndicatorWindows {
    /// Smallest number of bars for which every indicator is defined.
    pub fn min_bars(&self) -> usize {
        self.fast
            .max(self.slow)
            .max(self.momentum + 1)
            .max(self.volatility + 1)
    }
}

/// Trailing-window indicator values for one decision cycle. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct IndicatorSnapshot {
    pub fast_ma: f64,
    pub slow_ma: f64,
    pub momentum: f64,
    pub volatility: f64,
    pub last_close: f64,
}

impl IndicatorSnapshot {
    /// Compute all indicators over `bars`. `None` if any of them is undefined.
    pub fn compute(bars: &[PriceBar], windows: IndicatorWindows) -> Option<Self> {
        if bars.len() < windows.min_bars() {
            return None;
        }
        let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();

        Some(Self {
            fast_ma: ema::moving_average(&closes, windows.fast)?,
            slow_ma: ema::moving_average(&closes, windows.slow)?,
            momentum: rsi::momentum(&closes, windows.momentum)?,
            volatility: atr::bar_volatility(bars, windows.volatility)?,
            last_close: *closes.last()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const WINDOWS: IndicatorWindows = IndicatorWindows {
        fast: 9,
        slow: 21,
        momentum: 14,
        volatility: 14,
    };

    fn bars_from(closes: &[f64]) -> Vec<PriceBar> {
        closes
            .iter()
            .enumerate()
            .map(|(i, &c)| PriceBar::new(i as i64, c, c * 1.01, c * 0.99, c))
            .collect()
    }

    #[test]
    fn min_bars_covers_every_window() {
        assert_eq!(WINDOWS.min_bars(), 21);
        let w = IndicatorWindows { fast: 5, slow: 10, momentum: 20, volatility: 3 };
        assert_eq!(w.min_bars(), 21);
    }

    #[test]
    fn snapshot_undefined_on_short_history() {
        let bars = bars_from(&[100.0; 20]);
        assert!(IndicatorSnapshot::compute(&bars, WINDOWS).is_none());
    }

    #[test]
    fn snapshot_defined_at_minimum() {
        let closes: Vec<f64> = (0..21).map(|i| 100.0 + i as f64).collect();
        let snap = IndicatorSnapshot::compute(&bars_from(&closes), WINDOWS).unwrap();
        assert_eq!(snap.last_close, 120.0);
        assert!(snap.fast_ma > snap.slow_ma);
        assert!(snap.volatility > 0.0);
    }

    proptest! {
        #[test]
        fn indicators_are_bit_identical_on_repeat(
            closes in prop::collection::vec(1.0f64..10_000.0, 0..120),
            period in 1usize..30,
        ) {
            let bars = bars_from(&closes);
            let highs: Vec<f64> = bars.iter().map(|b| b.high).collect();
            let lows: Vec<f64> = bars.iter().map(|b| b.low).collect();

            let ma1 = ema::moving_average(&closes, period).map(f64::to_bits);
            let ma2 = ema::moving_average(&closes, period).map(f64::to_bits);
            prop_assert_eq!(ma1, ma2);

            let m1 = rsi::momentum(&closes, period).map(f64::to_bits);
            let m2 = rsi::momentum(&closes, period).map(f64::to_bits);
            prop_assert_eq!(m1, m2);

            let v1 = atr::volatility(&highs, &lows, &closes, period).map(f64::to_bits);
            let v2 = atr::volatility(&highs, &lows, &closes, period).map(f64::to_bits);
            prop_assert_eq!(v1, v2);
        }

        #[test]
        fn momentum_stays_in_range(closes in prop::collection::vec(1.0f64..10_000.0, 15..120)) {
            if let Some(m) = rsi::momentum(&closes, 14) {
                prop_assert!((0.0..=100.0).contains(&m));
            }
        }

        #[test]
        fn undefined_below_period(closes in prop::collection::vec(1.0f64..10_000.0, 0..10)) {
            prop_assert!(ema::moving_average(&closes, 10).is_none());
            prop_assert!(rsi::momentum(&closes, 10).is_none());
        }
    }
}
