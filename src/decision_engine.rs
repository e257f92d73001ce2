// =============================================================================
// Decision Engine — turns a price history into a proposal or "no setup"
// =============================================================================
//
// Pipeline:
//   1. Data gate: strictly increasing timestamps, enough bars, all
//      indicators defined.
//   2. Trend: fast EMA > slow EMA => Long, fast < slow => Short.
//   3. Momentum band: RSI inside the band configured for that direction.
//   4. Volatility: ATR must be positive and at least `min_volatility_pct`
//      of price.
//   5. Targets: entry = last close, TP / SL = entry ± ATR × multiplier.
//
// Pure computation: no I/O, no clock reads that affect the outcome, no
// shared state. The same bars always produce the same answer.
// =============================================================================

use crate::decision_envelope::{DecisionEnvelope, Stage};
use crate::indicators::IndicatorSnapshot;
use crate::market_data::{validate_history, PriceBar};
use crate::runtime_config::DecisionParams;
use crate::types::{Direction, ProposedSignal};

#[derive(Debug, Clone)]
pub struct DecisionEngine {
    params: DecisionParams,
}

impl DecisionEngine {
    pub fn new(params: DecisionParams) -> Self {
        Self { params }
    }

    /// Fewest bars `evaluate` will accept.
    pub fn min_bars(&self) -> usize {
        self.params.windows().min_bars()
    }

    /// Proposal only, without the audit record.
    #[cfg(test)]
    pub fn propose(&self, bars: &[PriceBar]) -> Option<ProposedSignal> {
        self.evaluate("", bars).1
    }

    /// Evaluate `bars` for `instrument` and return the audit envelope plus
    /// the proposal, if every stage passed.
    pub fn evaluate(
        &self,
        instrument: &str,
        bars: &[PriceBar],
    ) -> (DecisionEnvelope, Option<ProposedSignal>) {
        let p = &self.params;
        let mut envelope = DecisionEnvelope::new(instrument);

        // ── 1. Data gate ─────────────────────────────────────────────────
        if let Err(reason) = validate_history(bars) {
            return (envelope.block(Stage::Data, reason), None);
        }
        if bars.len() < self.min_bars() {
            let reason = format!("insufficient bars: {} < {}", bars.len(), self.min_bars());
            return (envelope.block(Stage::Data, reason), None);
        }
        let snap = match IndicatorSnapshot::compute(bars, p.windows()) {
            Some(s) => s,
            None => return (envelope.block(Stage::Data, "indicators undefined"), None),
        };
        envelope.snapshot = Some(snap);
        envelope.pass(Stage::Data);

        // ── 2. Trend ─────────────────────────────────────────────────────
        let direction = if snap.fast_ma > snap.slow_ma {
            Direction::Long
        } else if snap.fast_ma < snap.slow_ma {
            Direction::Short
        } else {
            let reason = format!("no trend: fast {:.6} == slow {:.6}", snap.fast_ma, snap.slow_ma);
            return (envelope.block(Stage::Trend, reason), None);
        };
        envelope.direction = Some(direction);
        envelope.pass(Stage::Trend);

        // ── 3. Momentum band ─────────────────────────────────────────────
        let (lo, hi) = match direction {
            Direction::Long => p.long_momentum_band,
            Direction::Short => p.short_momentum_band,
        };
        if !(lo..=hi).contains(&snap.momentum) {
            let reason = format!(
                "momentum {:.2} outside {direction} band [{lo}, {hi}]",
                snap.momentum
            );
            return (envelope.block(Stage::Momentum, reason), None);
        }
        envelope.pass(Stage::Momentum);

        // ── 4. Volatility ────────────────────────────────────────────────
        let entry = snap.last_close;
        if snap.volatility <= 0.0 || entry <= 0.0 {
            let reason = format!("flat market: volatility {:.8}", snap.volatility);
            return (envelope.block(Stage::Volatility, reason), None);
        }
        let volatility_pct = snap.volatility / entry * 100.0;
        if volatility_pct < p.min_volatility_pct {
            let reason = format!(
                "volatility {volatility_pct:.5}% below minimum {}%",
                p.min_volatility_pct
            );
            return (envelope.block(Stage::Volatility, reason), None);
        }

        // ── 5. Targets ───────────────────────────────────────────────────
        let tp_distance = snap.volatility * p.tp_multiplier;
        let sl_distance = snap.volatility * p.sl_multiplier;
        let (take_profit, stop_loss) = match direction {
            Direction::Long => (entry + tp_distance, entry - sl_distance),
            Direction::Short => (entry - tp_distance, entry + sl_distance),
        };

        let proposal = ProposedSignal {
            direction,
            entry,
            take_profit,
            stop_loss,
            rationale: format!(
                "EMA{} {:.4} vs EMA{} {:.4}, RSI{} {:.1}, ATR{} {:.4}",
                p.fast_period,
                snap.fast_ma,
                p.slow_period,
                snap.slow_ma,
                p.momentum_period,
                snap.momentum,
                p.volatility_period,
                snap.volatility
            ),
        };

        // Target distances below float resolution collapse onto the entry.
        if !proposal.targets_consistent() {
            let reason = format!("targets collapse at entry {entry}");
            return (envelope.block(Stage::Volatility, reason), None);
        }
        envelope.pass(Stage::Volatility);

        let envelope = envelope.allow(proposal.rationale.clone());
        (envelope, Some(proposal))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision_envelope::Verdict;
    use proptest::prelude::*;

    fn engine() -> DecisionEngine {
        DecisionEngine::new(DecisionParams::default())
    }

    /// Zig-zag series: alternating `up` / `down` close-to-close moves.
    fn zigzag(n: usize, start: f64, up: f64, down: f64) -> Vec<PriceBar> {
        let mut close = start;
        (0..n)
            .map(|i| {
                if i > 0 {
                    close += if i % 2 == 1 { up } else { down };
                }
                PriceBar::new(1_000 * i as i64, close, close + 0.5, close - 0.5, close)
            })
            .collect()
    }

    #[test]
    fn rising_zigzag_proposes_long() {
        let bars = zigzag(200, 100.0, 2.0, -1.5);
        let (env, proposal) = engine().evaluate("BTCUSDT", &bars);
        let proposal = proposal.expect("expected a long setup");

        assert_eq!(proposal.direction, Direction::Long);
        assert_eq!(proposal.entry, bars.last().unwrap().close);
        assert!(proposal.take_profit > proposal.entry);
        assert!(proposal.stop_loss < proposal.entry);
        assert!(env.proposed);
        assert_eq!(env.volatility_verdict, Verdict::Pass);
    }

    #[test]
    fn falling_zigzag_proposes_short() {
        let bars = zigzag(200, 300.0, -2.0, 1.5);
        let proposal = engine().propose(&bars).expect("expected a short setup");
        assert_eq!(proposal.direction, Direction::Short);
        assert!(proposal.take_profit < proposal.entry);
        assert!(proposal.stop_loss > proposal.entry);
    }

    #[test]
    fn targets_scale_with_multipliers() {
        let bars = zigzag(200, 100.0, 2.0, -1.5);
        let (env, proposal) = engine().evaluate("X", &bars);
        let proposal = proposal.unwrap();
        let atr = env.snapshot.unwrap().volatility;
        assert!((proposal.take_profit - (proposal.entry + 2.0 * atr)).abs() < 1e-9);
        assert!((proposal.stop_loss - (proposal.entry - atr)).abs() < 1e-9);
    }

    #[test]
    fn linear_rise_without_volatility_is_rejected() {
        let bars: Vec<PriceBar> = (0..200)
            .map(|i| {
                let c = 100.0 + i as f64 * 1e-4;
                PriceBar::new(i as i64, c, c, c, c)
            })
            .collect();
        assert!(engine().propose(&bars).is_none());
    }

    #[test]
    fn flat_market_blocks_at_volatility_when_bands_are_open() {
        let mut params = DecisionParams::default();
        params.long_momentum_band = (0.0, 100.0);
        let bars: Vec<PriceBar> = (0..200)
            .map(|i| {
                let c = 100.0 + i as f64 * 1e-4;
                PriceBar::new(i as i64, c, c, c, c)
            })
            .collect();
        let (env, proposal) = DecisionEngine::new(params).evaluate("X", &bars);
        assert!(proposal.is_none());
        assert_eq!(env.blocking_stage, Some(Stage::Volatility));
    }

    #[test]
    fn exhausted_momentum_is_rejected() {
        // Straight line up: RSI pinned at 100, above the long band.
        let bars: Vec<PriceBar> = (0..200)
            .map(|i| {
                let c = 100.0 + i as f64;
                PriceBar::new(i as i64, c, c + 1.0, c - 1.0, c)
            })
            .collect();
        let (env, proposal) = engine().evaluate("X", &bars);
        assert!(proposal.is_none());
        assert_eq!(env.blocking_stage, Some(Stage::Momentum));
    }

    #[test]
    fn constant_prices_have_no_trend() {
        // Power-of-two price keeps every EMA step exact.
        let bars: Vec<PriceBar> = (0..100).map(|i| PriceBar::new(i, 64.0, 65.0, 63.0, 64.0)).collect();
        let (env, proposal) = engine().evaluate("X", &bars);
        assert!(proposal.is_none());
        assert_eq!(env.blocking_stage, Some(Stage::Trend));
    }

    #[test]
    fn short_history_blocks_at_data() {
        let bars = zigzag(15, 100.0, 2.0, -1.5);
        let (env, proposal) = engine().evaluate("X", &bars);
        assert!(proposal.is_none());
        assert_eq!(env.blocking_stage, Some(Stage::Data));
    }

    #[test]
    fn non_monotonic_history_blocks_at_data() {
        let mut bars = zigzag(200, 100.0, 2.0, -1.5);
        bars[100].timestamp = bars[99].timestamp;
        let (env, proposal) = engine().evaluate("X", &bars);
        assert!(proposal.is_none());
        assert_eq!(env.blocking_stage, Some(Stage::Data));
    }

    #[test]
    fn evaluation_is_deterministic() {
        let bars = zigzag(200, 100.0, 2.0, -1.5);
        let a = engine().propose(&bars);
        let b = engine().propose(&bars);
        assert_eq!(a, b);
    }

    proptest! {
        #[test]
        fn proposals_always_respect_direction_ordering(
            start in 1.0f64..1_000.0,
            moves in prop::collection::vec(-0.03f64..0.03, 30..250),
            wick in 0.0f64..0.02,
        ) {
            let mut close = start;
            let bars: Vec<PriceBar> = moves
                .iter()
                .enumerate()
                .map(|(i, m)| {
                    let open = close;
                    close *= 1.0 + m;
                    let high = open.max(close) * (1.0 + wick);
                    let low = open.min(close) * (1.0 - wick);
                    PriceBar::new(60_000 * i as i64, open, high, low, close)
                })
                .collect();

            if let Some(p) = engine().propose(&bars) {
                prop_assert!(p.targets_consistent(), "violates ordering: {:?}", p);
                prop_assert_eq!(p.entry, bars.last().unwrap().close);
            }
        }
    }
}
