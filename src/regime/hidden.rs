// =============================================================================
// Hidden-state regime detector — Viterbi pass over discretized observations
// =============================================================================
//
// Each closed candle is discretized into a (return, volatility, volume)
// observation over 5 x 3 x 3 = 45 symbols. A Viterbi pass with fixed
// transition/emission matrices seeded from domain priors decodes the most
// likely hidden-state path; the terminal state is the regime.
//
// Falls back to the indicator detector when the candle count is below the
// decoding window.
// =============================================================================

use crate::indicators::adx::calculate_adx;
use crate::indicators::atr::calculate_atr_percent;
use crate::market_data::Candle;
use crate::regime::{indicator, RegimeAnalysis, RegimeKind};

/// Number of observations decoded per pass.
const WINDOW: usize = 60;
/// Candles required: one extra close for returns, plus the volume baseline.
const MIN_CANDLES: usize = WINDOW + VOLUME_BASELINE + 1;
/// Rolling window for the relative-volume baseline.
const VOLUME_BASELINE: usize = 20;

const N_STATES: usize = 4;
const N_RETURN_BINS: usize = 5;
const N_VOL_BINS: usize = 3;
const N_VOLUME_BINS: usize = 3;

/// Hidden-state order: Bull, Bear, Sideways, HighVol.
const STATES: [RegimeKind; N_STATES] = [
    RegimeKind::Bull,
    RegimeKind::Bear,
    RegimeKind::Sideways,
    RegimeKind::HighVol,
];

/// Regimes persist: strong self-transition, uniform leakage elsewhere.
const TRANSITION: [[f64; N_STATES]; N_STATES] = [
    [0.85, 0.03, 0.09, 0.03],
    [0.03, 0.85, 0.09, 0.03],
    [0.05, 0.05, 0.85, 0.05],
    [0.04, 0.04, 0.07, 0.85],
];

/// Per-state return-bin priors (bins: strong down, down, flat, up, strong up).
const RETURN_PRIOR: [[f64; N_RETURN_BINS]; N_STATES] = [
    [0.03, 0.07, 0.20, 0.40, 0.30],
    [0.30, 0.40, 0.20, 0.07, 0.03],
    [0.05, 0.20, 0.50, 0.20, 0.05],
    [0.30, 0.12, 0.06, 0.12, 0.40],
];

/// Per-state volatility-bin priors (bins: quiet, normal, wide).
const VOL_PRIOR: [[f64; N_VOL_BINS]; N_STATES] = [
    [0.30, 0.50, 0.20],
    [0.25, 0.50, 0.25],
    [0.60, 0.35, 0.05],
    [0.05, 0.25, 0.70],
];

/// Per-state relative-volume priors (bins: thin, normal, heavy).
const VOLUME_PRIOR: [[f64; N_VOLUME_BINS]; N_STATES] = [
    [0.20, 0.50, 0.30],
    [0.20, 0.45, 0.35],
    [0.50, 0.40, 0.10],
    [0.10, 0.30, 0.60],
];

/// Decode the regime from the candle series.
pub fn detect(candles: &[Candle]) -> RegimeAnalysis {
    if candles.len() < MIN_CANDLES {
        return indicator::detect(candles);
    }

    let observations = discretize(candles);
    let (state_idx, confidence) = viterbi(&observations);

    RegimeAnalysis {
        regime: STATES[state_idx],
        adx: calculate_adx(candles, 14).unwrap_or(0.0),
        atr_percent: calculate_atr_percent(candles, 14).unwrap_or(0.0),
        confidence,
    }
}

// ---------------------------------------------------------------------------
// Discretization
// ---------------------------------------------------------------------------

fn return_bin(pct: f64) -> usize {
    if pct < -0.5 {
        0
    } else if pct < -0.1 {
        1
    } else if pct <= 0.1 {
        2
    } else if pct <= 0.5 {
        3
    } else {
        4
    }
}

fn vol_bin(range_pct: f64) -> usize {
    if range_pct < 0.5 {
        0
    } else if range_pct <= 1.5 {
        1
    } else {
        2
    }
}

fn volume_bin(ratio: f64) -> usize {
    if ratio < 0.8 {
        0
    } else if ratio <= 1.5 {
        1
    } else {
        2
    }
}

/// Build the observation sequence for the last `WINDOW` candles.
fn discretize(candles: &[Candle]) -> Vec<usize> {
    let n = candles.len();
    let start = n - WINDOW;

    let mut observations = Vec::with_capacity(WINDOW);
    for i in start..n {
        let prev_close = candles[i - 1].close_f();
        let close = candles[i].close_f();
        let ret_pct = if prev_close > 0.0 {
            (close - prev_close) / prev_close * 100.0
        } else {
            0.0
        };

        let range_pct = candles[i].range_percent();

        // Relative volume against the trailing baseline mean.
        let base_start = i.saturating_sub(VOLUME_BASELINE);
        let baseline: f64 = candles[base_start..i]
            .iter()
            .map(Candle::volume_f)
            .sum::<f64>()
            / (i - base_start).max(1) as f64;
        let ratio = if baseline > 0.0 {
            candles[i].volume_f() / baseline
        } else {
            1.0
        };

        let obs = return_bin(ret_pct) * (N_VOL_BINS * N_VOLUME_BINS)
            + vol_bin(range_pct) * N_VOLUME_BINS
            + volume_bin(ratio);
        observations.push(obs);
    }
    observations
}

// ---------------------------------------------------------------------------
// Viterbi
// ---------------------------------------------------------------------------

fn emission_log(state: usize, obs: usize) -> f64 {
    let r = obs / (N_VOL_BINS * N_VOLUME_BINS);
    let v = (obs / N_VOLUME_BINS) % N_VOL_BINS;
    let u = obs % N_VOLUME_BINS;
    let p = RETURN_PRIOR[state][r] * VOL_PRIOR[state][v] * VOLUME_PRIOR[state][u];
    p.max(1e-12).ln()
}

/// Run the Viterbi pass and return the terminal state index plus a confidence
/// derived from the margin between the best and runner-up terminal scores.
fn viterbi(observations: &[usize]) -> (usize, f64) {
    let uniform_log = (1.0 / N_STATES as f64).ln();
    let mut delta = [0.0f64; N_STATES];
    for (s, d) in delta.iter_mut().enumerate() {
        *d = uniform_log + emission_log(s, observations[0]);
    }

    for &obs in &observations[1..] {
        let mut next = [f64::NEG_INFINITY; N_STATES];
        for (s, slot) in next.iter_mut().enumerate() {
            let mut best = f64::NEG_INFINITY;
            for (prev, d) in delta.iter().enumerate() {
                let cand = d + TRANSITION[prev][s].max(1e-12).ln();
                if cand > best {
                    best = cand;
                }
            }
            *slot = best + emission_log(s, obs);
        }
        delta = next;
    }

    let mut best_idx = 0;
    let mut best = f64::NEG_INFINITY;
    let mut second = f64::NEG_INFINITY;
    for (s, &d) in delta.iter().enumerate() {
        if d > best {
            second = best;
            best = d;
            best_idx = s;
        } else if d > second {
            second = d;
        }
    }

    let margin = (best - second).max(0.0);
    let confidence = (1.0 - (-margin).exp()).clamp(0.0, 1.0);
    (best_idx, confidence)
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

    fn candle(close: f64, range: f64, volume: f64) -> Candle {
        let d = |v: f64| Decimal::from_f64(v).unwrap();
        Candle {
            timestamp: Utc::now(),
            open: d(close),
            high: d(close + range / 2.0),
            low: d(close - range / 2.0),
            close: d(close),
            volume: d(volume),
        }
    }

    fn series(mut price: f64, step_pct: f64, range_pct: f64, volume: f64, len: usize) -> Vec<Candle> {
        (0..len)
            .map(|_| {
                price *= 1.0 + step_pct / 100.0;
                candle(price, price * range_pct / 100.0, volume)
            })
            .collect()
    }

    #[test]
    fn bins_cover_edges() {
        assert_eq!(return_bin(-1.0), 0);
        assert_eq!(return_bin(-0.3), 1);
        assert_eq!(return_bin(0.0), 2);
        assert_eq!(return_bin(0.3), 3);
        assert_eq!(return_bin(1.0), 4);
        assert_eq!(vol_bin(0.1), 0);
        assert_eq!(vol_bin(1.0), 1);
        assert_eq!(vol_bin(2.0), 2);
        assert_eq!(volume_bin(0.5), 0);
        assert_eq!(volume_bin(1.0), 1);
        assert_eq!(volume_bin(2.0), 2);
    }

    #[test]
    fn short_series_falls_back_to_indicator() {
        let candles = series(100.0, 0.3, 0.8, 50.0, 30);
        // The fallback must still produce a usable analysis.
        let analysis = detect(&candles);
        assert!(analysis.confidence >= 0.0 && analysis.confidence <= 1.0);
    }

    #[test]
    fn sustained_up_moves_decode_bull() {
        let candles = series(100.0, 0.4, 0.8, 50.0, MIN_CANDLES + 5);
        let analysis = detect(&candles);
        assert_eq!(analysis.regime, RegimeKind::Bull);
    }

    #[test]
    fn sustained_down_moves_decode_bear() {
        let candles = series(100.0, -0.4, 0.8, 50.0, MIN_CANDLES + 5);
        let analysis = detect(&candles);
        assert_eq!(analysis.regime, RegimeKind::Bear);
    }

    #[test]
    fn flat_quiet_tape_decodes_sideways() {
        let candles = series(100.0, 0.0, 0.2, 50.0, MIN_CANDLES + 5);
        let analysis = detect(&candles);
        assert_eq!(analysis.regime, RegimeKind::Sideways);
    }

    #[test]
    fn wide_swings_decode_high_vol() {
        let mut candles = Vec::new();
        let mut price = 100.0;
        for i in 0..(MIN_CANDLES + 5) {
            let step = if i % 2 == 0 { 1.2 } else { -1.2 };
            price *= 1.0 + step / 100.0;
            candles.push(candle(price, price * 2.5 / 100.0, 200.0));
        }
        let analysis = detect(&candles);
        assert_eq!(analysis.regime, RegimeKind::HighVol);
    }

    #[test]
    fn transition_rows_are_stochastic() {
        for row in TRANSITION {
            let sum: f64 = row.iter().sum();
            assert!((sum - 1.0).abs() < 1e-9);
        }
    }

    #[test]
    fn priors_are_stochastic() {
        for row in RETURN_PRIOR {
            assert!((row.iter().sum::<f64>() - 1.0).abs() < 1e-9);
        }
        for row in VOL_PRIOR {
            assert!((row.iter().sum::<f64>() - 1.0).abs() < 1e-9);
        }
        for row in VOLUME_PRIOR {
            assert!((row.iter().sum::<f64>() - 1.0).abs() < 1e-9);
        }
    }
}
