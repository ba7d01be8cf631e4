// =============================================================================
// Volatility-survival engine — defensive scalps in turbulent tape
// =============================================================================
//
// Runs when the regime turns hostile. Default stance is HOLD; the engine only
// acts on washouts: a drop from the recent high deeper than the prevailing
// ATR band is bought for a quick mean-reversion scalp, and a blow-off spike
// above the recent low by the same margin is sold. Tight stops come from the
// strategy's parameter set, not from this module.
// =============================================================================

use async_trait::async_trait;
use rust_decimal::prelude::ToPrimitive;

use crate::strategy::{SignalAction, Strategy, StrategyContext, TradingSignal};
use crate::types::StrategyCode;

/// Look-back for the recent extreme.
const SWING_LEN: usize = 10;
/// Washout must exceed this multiple of ATR%.
const WASHOUT_ATR_MULT: f64 = 1.5;
/// Consecutive one-way candles required to call it a washout, not noise.
const ONE_WAY_CANDLES: usize = 3;

pub struct VolatilitySurvivalStrategy;

impl VolatilitySurvivalStrategy {
    pub fn new() -> Self {
        Self
    }
}

impl Default for VolatilitySurvivalStrategy {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Strategy for VolatilitySurvivalStrategy {
    fn code(&self) -> StrategyCode {
        StrategyCode::VolatilitySurvival
    }

    fn analyze(&self, ctx: &StrategyContext<'_>) -> TradingSignal {
        let candles = ctx.candles;
        let price = ctx.current_price;

        if candles.len() < SWING_LEN + ONE_WAY_CANDLES {
            return TradingSignal::hold(ctx.market, self.code(), price, "insufficient candles");
        }

        let atr_pct = ctx.regime.atr_percent.max(0.1);
        let threshold_pct = atr_pct * WASHOUT_ATR_MULT;

        let window = &candles[candles.len() - SWING_LEN..];
        let swing_high = window
            .iter()
            .map(|c| c.high_f())
            .fold(f64::NEG_INFINITY, f64::max);
        let swing_low = window
            .iter()
            .map(|c| c.low_f())
            .fold(f64::INFINITY, f64::min);
        let price_f = price.to_f64().unwrap_or(0.0);

        if price_f <= 0.0 || !swing_high.is_finite() || !swing_low.is_finite() {
            return TradingSignal::hold(ctx.market, self.code(), price, "invalid inputs");
        }

        let tail = &candles[candles.len() - ONE_WAY_CANDLES..];
        let all_down = tail.iter().all(|c| c.close < c.open);
        let all_up = tail.iter().all(|c| c.close > c.open);

        // Washout dip: buy the panic, tight exit handled by position params.
        let drop_pct = (swing_high - price_f) / swing_high * 100.0;
        if all_down && drop_pct >= threshold_pct {
            let confidence = (60.0 + (drop_pct - threshold_pct) * 10.0).clamp(60.0, 95.0);
            return TradingSignal {
                market: crate::types::normalize_market(ctx.market),
                action: SignalAction::Buy,
                confidence,
                price,
                reason: format!(
                    "washout: {drop_pct:.2}% off the {SWING_LEN}-bar high (threshold {threshold_pct:.2}%)"
                ),
                strategy: self.code(),
            };
        }

        // Blow-off spike: sell into it.
        let spike_pct = (price_f - swing_low) / swing_low * 100.0;
        if all_up && spike_pct >= threshold_pct {
            let confidence = (60.0 + (spike_pct - threshold_pct) * 10.0).clamp(60.0, 95.0);
            return TradingSignal {
                market: crate::types::normalize_market(ctx.market),
                action: SignalAction::Sell,
                confidence,
                price,
                reason: format!(
                    "blow-off: {spike_pct:.2}% above the {SWING_LEN}-bar low (threshold {threshold_pct:.2}%)"
                ),
                strategy: self.code(),
            };
        }

        TradingSignal::hold(ctx.market, self.code(), price, "surviving, not trading")
    }
}

// =============================================================================
// Tests
// =============================================================================
