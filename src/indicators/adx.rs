// =============================================================================
// Average Directional Index (ADX)
// =============================================================================
//
// Trend strength irrespective of direction. Directional movement and true
// range are folded through Wilder's recursion in one streaming pass over the
// bar transitions; the DX series that falls out is smoothed the same way to
// yield ADX. Readings above 25 mean a trending tape, below 20 a ranging one.
// =============================================================================

use crate::market_data::Candle;

/// Wilder-smoothed directional sums carried across the pass.
struct Trend {
    up: f64,
    down: f64,
    range: f64,
}

impl Trend {
    /// DX for the current sums, on a 0-100 scale. The normalization by range
    /// cancels out of the ratio, so the raw sums are compared directly.
    /// `None` while the market has produced no range at all.
    fn directional_index(&self) -> Option<f64> {
        if self.range <= 0.0 {
            return None;
        }
        let total = self.up + self.down;
        if total == 0.0 {
            return Some(0.0);
        }
        Some((self.up - self.down).abs() / total * 100.0)
    }
}

/// Latest ADX over `period` from oldest-first candles. Requires
/// `2 * period + 1` bars: one period seeds the directional sums, another
/// seeds the DX average. `None` on short or degenerate input.
pub fn calculate_adx(candles: &[Candle], period: usize) -> Option<f64> {
    if period == 0 || candles.len() < 2 * period + 1 {
        return None;
    }
    let alpha = 1.0 / period as f64;

    let mut sums = Trend {
        up: 0.0,
        down: 0.0,
        range: 0.0,
    };
    let mut warmed = 0usize;

    let mut adx: Option<f64> = None;
    let mut dx_seed = 0.0;
    let mut dx_seen = 0usize;

    for pair in candles.windows(2) {
        let (up_gain, down_gain, range_gain) = bar_movement(&pair[0], &pair[1]);
        if !range_gain.is_finite() {
            return None;
        }

        if warmed < period {
            // Seed phase: plain sums over the first period of transitions.
            sums.up += up_gain;
            sums.down += down_gain;
            sums.range += range_gain;
            warmed += 1;
            if warmed < period {
                continue;
            }
        } else {
            // Wilder recursion: decay one share, add the new bar.
            sums.up += up_gain - alpha * sums.up;
            sums.down += down_gain - alpha * sums.down;
            sums.range += range_gain - alpha * sums.range;
        }

        let dx = sums.directional_index()?;
        adx = match adx {
            None => {
                dx_seed += dx;
                dx_seen += 1;
                (dx_seen == period).then(|| dx_seed / period as f64)
            }
            Some(prev) => Some(prev + alpha * (dx - prev)),
        };
    }

    adx.filter(|value| value.is_finite())
}

/// Raw +DM, -DM, and true range contributed by one bar transition.
fn bar_movement(prev: &Candle, bar: &Candle) -> (f64, f64, f64) {
    let advance = bar.high_f() - prev.high_f();
    let decline = prev.low_f() - bar.low_f();

    let up_gain = if advance > decline && advance > 0.0 {
        advance
    } else {
        0.0
    };
    let down_gain = if decline > advance && decline > 0.0 {
        decline
    } else {
        0.0
    };

    let prev_close = prev.close_f();
    let range = (bar.high_f() - bar.low_f())
        .max((bar.high_f() - prev_close).abs())
        .max((prev_close - bar.low_f()).abs());

    (up_gain, down_gain, range)
}
