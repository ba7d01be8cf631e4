// =============================================================================
// Breakout engine — Donchian-channel breaks with volume confirmation
// =============================================================================
//
// BUY when the close clears the highest high of the look-back channel on
// above-average volume; SELL when it breaks the channel floor. Conviction
// scales with the breakout margin and the regime confidence.
// =============================================================================

use async_trait::async_trait;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use crate::strategy::{SignalAction, Strategy, StrategyContext, TradingSignal};
use crate::types::StrategyCode;

/// Channel look-back (bars, excluding the breakout bar itself).
const CHANNEL_LEN: usize = 20;
/// Volume must exceed this multiple of the channel average.
const VOLUME_CONFIRM_RATIO: f64 = 1.2;

pub struct BreakoutStrategy;

impl BreakoutStrategy {
    pub fn new() -> Self {
        Self
    }
}

impl Default for BreakoutStrategy {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Strategy for BreakoutStrategy {
    fn code(&self) -> StrategyCode {
        StrategyCode::Breakout
    }

    fn analyze(&self, ctx: &StrategyContext<'_>) -> TradingSignal {
        let candles = ctx.candles;
        if candles.len() < CHANNEL_LEN + 1 {
            return TradingSignal::hold(
                ctx.market,
                self.code(),
                ctx.current_price,
                "insufficient candles for channel",
            );
        }

        let channel = &candles[candles.len() - 1 - CHANNEL_LEN..candles.len() - 1];
        let channel_high = channel
            .iter()
            .map(|c| c.high)
            .max()
            .unwrap_or(Decimal::ZERO);
        let channel_low = channel
            .iter()
            .map(|c| c.low)
            .min()
            .unwrap_or(Decimal::ZERO);
        let avg_volume =
            channel.iter().map(|c| c.volume_f()).sum::<f64>() / channel.len() as f64;

        let last = &candles[candles.len() - 1];
        let price = ctx.current_price;

        let volume_confirmed =
            avg_volume > 0.0 && last.volume_f() >= avg_volume * VOLUME_CONFIRM_RATIO;

        if price > channel_high && channel_high > Decimal::ZERO {
            if !volume_confirmed {
                return TradingSignal::hold(
                    ctx.market,
                    self.code(),
                    price,
                    "breakout without volume confirmation",
                );
            }
            let margin_pct = ((price - channel_high) / channel_high * Decimal::ONE_HUNDRED)
                .to_f64()
                .unwrap_or(0.0);
            let confidence =
                (55.0 + margin_pct * 20.0 + ctx.regime.confidence * 25.0).clamp(0.0, 100.0);
            return TradingSignal {
                market: crate::types::normalize_market(ctx.market),
                action: SignalAction::Buy,
                confidence,
                price,
                reason: format!(
                    "close broke {CHANNEL_LEN}-bar high {channel_high} by {margin_pct:.2}%"
                ),
                strategy: self.code(),
            };
        }

        if price < channel_low && channel_low > Decimal::ZERO {
            let margin_pct = ((channel_low - price) / channel_low * Decimal::ONE_HUNDRED)
                .to_f64()
                .unwrap_or(0.0);
            let confidence =
                (55.0 + margin_pct * 20.0 + ctx.regime.confidence * 25.0).clamp(0.0, 100.0);
            return TradingSignal {
                market: crate::types::normalize_market(ctx.market),
                action: SignalAction::Sell,
                confidence,
                price,
                reason: format!(
                    "close broke {CHANNEL_LEN}-bar low {channel_low} by {margin_pct:.2}%"
                ),
                strategy: self.code(),
            };
        }

        TradingSignal::hold(ctx.market, self.code(), price, "inside channel")
    }
}

// =============================================================================
// Tests
// =============================================================================
