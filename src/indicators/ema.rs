// =============================================================================
// Exponential Moving Average (EMA)
// =============================================================================
//
// Formula:
//   multiplier = 2 / (period + 1)
//   EMA_t      = value_t * multiplier + EMA_{t-1} * (1 - multiplier)
//
// The first EMA value is seeded with the SMA of the first `period` values.
// =============================================================================

/// Compute the EMA series for `values` with look-back `period`.
///
/// Each output element corresponds to an input starting at index
/// `period - 1`. Returns an empty `Vec` when `period == 0` or
/// `values.len() < period`. A non-finite intermediate value truncates the
/// series.
pub fn ema_series(values: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || values.len() < period {
        return Vec::new();
    }

    let multiplier = 2.0 / (period + 1) as f64;

    let seed: f64 = values[..period].iter().sum::<f64>() / period as f64;
    if !seed.is_finite() {
        return Vec::new();
    }

    let mut result = Vec::with_capacity(values.len() - period + 1);
    result.push(seed);

    let mut prev = seed;
    for &value in &values[period..] {
        let ema = value * multiplier + prev * (1.0 - multiplier);
        if !ema.is_finite() {
            break;
        }
        result.push(ema);
        prev = ema;
    }

    result
}

/// Most recent EMA value, or `None` when the series is undefined.
///
/// A series truncated by a non-finite input is also treated as undefined:
/// a stale value would silently describe an older window.
pub fn moving_average(values: &[f64], period: usize) -> Option<f64> {
    let series = ema_series(values, period);
    if series.len() != values.len().saturating_sub(period) + 1 {
        return None;
    }
    series.last().copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ascending(n: usize) -> Vec<f64> {
        (1..=n).map(|i| i as f64).collect()
    }

    #[test]
    fn ema_empty_input() {
        assert!(ema_series(&[], 5).is_empty());
        assert!(moving_average(&[], 5).is_none());
    }

    #[test]
    fn ema_period_zero() {
        assert!(ema_series(&[1.0, 2.0, 3.0], 0).is_empty());
        assert!(moving_average(&[1.0, 2.0, 3.0], 0).is_none());
    }

    #[test]
    fn ema_insufficient_data() {
        assert!(moving_average(&[1.0, 2.0], 5).is_none());
    }

    #[test]
    fn ema_period_equals_length_is_sma() {
        let ema = moving_average(&[2.0, 4.0, 6.0], 3).unwrap();
        assert!((ema - 4.0).abs() < 1e-12);
    }

    #[test]
    fn ema_known_values() {
        let values = ascending(10);
        let series = ema_series(&values, 5);
        assert_eq!(series.len(), 6);

        let mult = 2.0 / 6.0;
        let mut expected = 3.0;
        let mut expected_vec = vec![expected];
        for &v in &values[5..] {
            expected = v * mult + expected * (1.0 - mult);
            expected_vec.push(expected);
        }
        for (a, b) in series.iter().zip(expected_vec.iter()) {
            assert!((a - b).abs() < 1e-10, "got {a}, expected {b}");
        }
        assert_eq!(moving_average(&values, 5), series.last().copied());
    }

    #[test]
    fn ema_nan_truncates_and_latest_is_undefined() {
        let values = vec![1.0, 2.0, 3.0, f64::NAN, 5.0];
        assert_eq!(ema_series(&values, 3).len(), 1);
        assert!(moving_average(&values, 3).is_none());
    }

    #[test]
    fn ema_lags_a_rising_series() {
        let values = ascending(100);
        let fast = moving_average(&values, 9).unwrap();
        let slow = moving_average(&values, 21).unwrap();
        assert!(fast > slow);
        assert!(fast < 100.0);
    }
}
