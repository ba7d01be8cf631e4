// =============================================================================
// Indicator-based regime detector — ADX / ATR% threshold rules
// =============================================================================
//
// Classification (first match wins):
//   1. ATR% >= 2                      -> HIGH_VOL
//   2. ADX >= 25 and close rising     -> BULL
//   3. ADX >= 25 and close falling    -> BEAR
//   4. otherwise                      -> SIDEWAYS
//
// Confidence is ADX normalized by 50 and clamped to [0, 1].
// =============================================================================

use crate::indicators::adx::calculate_adx;
use crate::indicators::atr::calculate_atr_percent;
use crate::market_data::Candle;
use crate::regime::{RegimeAnalysis, RegimeKind};

/// Indicator look-back.
const PERIOD: usize = 14;
/// Bars back for the rising/falling close comparison.
const TREND_LOOKBACK: usize = 10;
/// ADX level above which the market counts as trending.
const ADX_TREND_THRESHOLD: f64 = 25.0;
/// ATR% level above which volatility dominates classification.
const ATR_HIGH_VOL_THRESHOLD: f64 = 2.0;

/// Classify the candle series with threshold rules.
pub fn detect(candles: &[Candle]) -> RegimeAnalysis {
    let adx = calculate_adx(candles, PERIOD).unwrap_or(0.0);
    let atr_percent = calculate_atr_percent(candles, PERIOD).unwrap_or(0.0);

    let rising = is_close_rising(candles);
    let regime = classify(adx, atr_percent, rising);

    RegimeAnalysis {
        regime,
        adx,
        atr_percent,
        confidence: (adx / 50.0).clamp(0.0, 1.0),
    }
}

fn classify(adx: f64, atr_percent: f64, rising: bool) -> RegimeKind {
    if atr_percent >= ATR_HIGH_VOL_THRESHOLD {
        return RegimeKind::HighVol;
    }
    if adx >= ADX_TREND_THRESHOLD {
        return if rising {
            RegimeKind::Bull
        } else {
            RegimeKind::Bear
        };
    }
    RegimeKind::Sideways
}

/// Compare the latest close against the close `TREND_LOOKBACK` bars back.
fn is_close_rising(candles: &[Candle]) -> bool {
    let n = candles.len();
    if n < TREND_LOOKBACK + 1 {
        return false;
    }
    candles[n - 1].close > candles[n - 1 - TREND_LOOKBACK].close
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

    fn candle(open: f64, high: f64, low: f64, close: f64) -> Candle {
        let d = |v: f64| Decimal::from_f64(v).unwrap();
        Candle {
            timestamp: Utc::now(),
            open: d(open),
            high: d(high),
            low: d(low),
            close: d(close),
            volume: Decimal::ONE_HUNDRED,
        }
    }

    fn trending_up(len: usize, step: f64) -> Vec<Candle> {
        (0..len)
            .map(|i| {
                let base = 100.0 + i as f64 * step;
                candle(base, base + 0.4, base - 0.2, base + 0.3)
            })
            .collect()
    }

    #[test]
    fn classify_priorities() {
        assert_eq!(classify(30.0, 3.0, true), RegimeKind::HighVol);
        assert_eq!(classify(30.0, 1.0, true), RegimeKind::Bull);
        assert_eq!(classify(30.0, 1.0, false), RegimeKind::Bear);
        assert_eq!(classify(10.0, 1.0, true), RegimeKind::Sideways);
    }

    #[test]
    fn uptrend_detects_bull() {
        let analysis = detect(&trending_up(80, 1.0));
        assert_eq!(analysis.regime, RegimeKind::Bull);
        assert!(analysis.confidence > 0.4);
    }

    #[test]
    fn downtrend_detects_bear() {
        let candles: Vec<Candle> = (0..80)
            .map(|i| {
                let base = 500.0 - i as f64 * 2.0;
                candle(base, base + 0.5, base - 1.2, base - 1.0)
            })
            .collect();
        let analysis = detect(&candles);
        assert_eq!(analysis.regime, RegimeKind::Bear);
    }

    #[test]
    fn flat_detects_sideways() {
        let candles = vec![candle(100.0, 100.4, 99.6, 100.0); 80];
        let analysis = detect(&candles);
        assert_eq!(analysis.regime, RegimeKind::Sideways);
    }

    #[test]
    fn wide_ranges_detect_high_vol() {
        let candles: Vec<Candle> = (0..80)
            .map(|i| {
                let base = 100.0 + if i % 2 == 0 { 3.0 } else { -3.0 };
                candle(base, base + 3.0, base - 3.0, base)
            })
            .collect();
        let analysis = detect(&candles);
        assert_eq!(analysis.regime, RegimeKind::HighVol);
        assert!(analysis.atr_percent >= 2.0);
    }

    #[test]
    fn insufficient_data_is_sideways_with_zero_confidence() {
        let analysis = detect(&trending_up(5, 1.0));
        assert_eq!(analysis.regime, RegimeKind::Sideways);
        assert_eq!(analysis.confidence, 0.0);
    }
}
