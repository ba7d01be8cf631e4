// =============================================================================
// Market Regime Detection
// =============================================================================
//
// Classifies each market into one of four regimes driving strategy selection.
// Two interchangeable implementations sit behind one contract; which one runs
// is read from the configuration store on every analysis tick, so the choice
// can flip at runtime without a restart. Both are pure functions over the
// input candles — no state is shared between them.
// =============================================================================

pub mod hidden;
pub mod indicator;

use serde::{Deserialize, Serialize};

use crate::market_data::Candle;

/// High-level market regime classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RegimeKind {
    /// Persistent directional move up.
    Bull,
    /// Persistent directional move down.
    Bear,
    /// Sideways chop.
    Sideways,
    /// Volatility expansion — wide swings either way.
    HighVol,
}

impl std::fmt::Display for RegimeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bull => write!(f, "BULL"),
            Self::Bear => write!(f, "BEAR"),
            Self::Sideways => write!(f, "SIDEWAYS"),
            Self::HighVol => write!(f, "HIGH_VOL"),
        }
    }
}

/// Result of one regime analysis pass. Produced per tick, never stored
/// long-term.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegimeAnalysis {
    pub regime: RegimeKind,
    pub adx: f64,
    pub atr_percent: f64,
    /// Classification confidence in [0, 1].
    pub confidence: f64,
}

/// Which detector implementation to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorKind {
    /// ADX/ATR% threshold rules.
    Simple,
    /// Discretized-observation Viterbi pass over fixed matrices.
    Hidden,
}

impl DetectorKind {
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "hidden" => Self::Hidden,
            _ => Self::Simple,
        }
    }
}

/// Run the selected detector over the candle series.
pub fn detect(candles: &[Candle], kind: DetectorKind) -> RegimeAnalysis {
    match kind {
        DetectorKind::Simple => indicator::detect(candles),
        DetectorKind::Hidden => hidden::detect(candles),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detector_kind_parsing_defaults_to_simple() {
        assert_eq!(DetectorKind::parse("hidden"), DetectorKind::Hidden);
        assert_eq!(DetectorKind::parse("simple"), DetectorKind::Simple);
        assert_eq!(DetectorKind::parse("garbage"), DetectorKind::Simple);
    }

    #[test]
    fn regime_display_tags() {
        assert_eq!(RegimeKind::Bull.to_string(), "BULL");
        assert_eq!(RegimeKind::HighVol.to_string(), "HIGH_VOL");
    }
}
