// =============================================================================
// Average True Range (ATR)
// =============================================================================
//
// Volatility as the Wilder-smoothed true range. Each bar contributes the
// widest of its own range, the gap above the prior close, and the gap below
// it; the smoother seeds on a plain average of the first period and then
// decays one share per bar.
// =============================================================================

use crate::market_data::Candle;

/// Latest ATR over `period` from oldest-first candles. `None` when the
/// series is shorter than `period + 1` bars or the data is degenerate.
pub fn calculate_atr(candles: &[Candle], period: usize) -> Option<f64> {
    if period == 0 || candles.len() <= period {
        return None;
    }
    let alpha = 1.0 / period as f64;

    let mut smoothed: Option<f64> = None;
    let mut seed = 0.0;
    let mut seeded = 0usize;

    for pair in candles.windows(2) {
        let tr = true_range(&pair[1], pair[0].close_f());
        if !tr.is_finite() {
            return None;
        }
        smoothed = match smoothed {
            None => {
                seed += tr;
                seeded += 1;
                (seeded == period).then(|| seed * alpha)
            }
            Some(prev) => Some(prev + alpha * (tr - prev)),
        };
    }

    smoothed.filter(|value| value.is_finite())
}

/// ATR rescaled to a percentage of the latest close, so volatility compares
/// across assets with different price levels. This is the volatility axis of
/// the strategy routing table.
pub fn calculate_atr_percent(candles: &[Candle], period: usize) -> Option<f64> {
    let close = candles.last().map(Candle::close_f).filter(|c| *c > 0.0)?;
    calculate_atr(candles, period).map(|atr| atr / close * 100.0)
}

/// Widest of bar range, gap up from the prior close, and gap down from it.
fn true_range(bar: &Candle, prev_close: f64) -> f64 {
    (bar.high_f() - bar.low_f())
        .max((bar.high_f() - prev_close).abs())
        .max((prev_close - bar.low_f()).abs())
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal::prelude::FromPrimitive;
    use rust_decimal::Decimal;

    fn bar(high: f64, low: f64, close: f64) -> Candle {
        let d = |v: f64| Decimal::from_f64(v).unwrap();
        Candle {
            timestamp: Utc::now(),
            open: d(close),
            high: d(high),
            low: d(low),
            close: d(close),
            volume: Decimal::ONE_HUNDRED,
        }
    }

    #[test]
    fn needs_one_bar_more_than_the_period() {
        let bars: Vec<Candle> = (0..4).map(|_| bar(102.0, 98.0, 100.0)).collect();
        assert!(calculate_atr(&bars, 3).is_some());
        assert!(calculate_atr(&bars[..3], 3).is_none());
        assert!(calculate_atr(&bars, 0).is_none());
    }

    #[test]
    fn constant_range_settles_at_the_range() {
        let bars: Vec<Candle> = (0..30).map(|_| bar(105.0, 95.0, 100.0)).collect();
        let atr = calculate_atr(&bars, 14).unwrap();
        assert!((atr - 10.0).abs() < 1e-9, "expected ATR of 10, got {atr}");
    }

    #[test]
    fn opening_gap_widens_the_range() {
        // The second bar gaps far above the first close: its true range is
        // the gap, not its own 3-point candle.
        let bars = vec![
            bar(101.0, 99.0, 100.0),
            bar(121.0, 118.0, 120.0),
            bar(122.0, 119.0, 121.0),
            bar(123.0, 120.0, 122.0),
        ];
        let atr = calculate_atr(&bars, 3).unwrap();
        assert!(atr > 5.0, "gap should dominate the average, got {atr}");
    }

    #[test]
    fn percent_rescales_with_price_level() {
        let cheap: Vec<Candle> = (0..30).map(|_| bar(101.0, 99.0, 100.0)).collect();
        let dear: Vec<Candle> = (0..30).map(|_| bar(1010.0, 990.0, 1000.0)).collect();

        let a = calculate_atr_percent(&cheap, 14).unwrap();
        let b = calculate_atr_percent(&dear, 14).unwrap();
        assert!((a - b).abs() < 1e-9, "same shape must read the same percent");
        assert!((a - 2.0).abs() < 0.01, "2-wide bars at 100 are 2%, got {a}");
    }

    #[test]
    fn percent_guards_a_dead_close() {
        let bars: Vec<Candle> = (0..30).map(|_| bar(1.0, 0.0, 0.0)).collect();
        assert!(calculate_atr_percent(&bars, 14).is_none());
    }
}
