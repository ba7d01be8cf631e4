// =============================================================================
// Risk controls — admission gate, circuit breakers, regime suspension
// =============================================================================

pub mod circuit_breaker;
pub mod gate;
pub mod suspension;

use serde::{Deserialize, Serialize};

/// Typed denial reason from the risk gate. Every veto short-circuits the
/// pipeline; only MARKET_CONDITION and API_ERRORS are surfaced to operators
/// as (rate-limited) warnings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum VetoReason {
    /// The `trading.enabled` toggle is off.
    TradingDisabled,
    /// A per-market or global circuit breaker is open.
    CircuitBreaker,
    /// Spread or orderbook depth outside acceptable bounds.
    MarketCondition,
    /// Too many API errors in the trailing minute.
    ApiErrors,
    /// Cumulative realized PnL since local midnight breached the floor.
    DailyLossLimit,
    /// Aggregate open-position cap reached.
    PositionCap,
    /// Another engine already holds this market (or dust-level coin remains).
    AlreadyHolding,
    /// Minimum holding time before a SELL has not elapsed.
    MinHolding,
    /// Post-sell cooldown before a re-BUY has not elapsed.
    TradeCooldown,
}

impl std::fmt::Display for VetoReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tag = match self {
            Self::TradingDisabled => "TRADING_DISABLED",
            Self::CircuitBreaker => "CIRCUIT_BREAKER",
            Self::MarketCondition => "MARKET_CONDITION",
            Self::ApiErrors => "API_ERRORS",
            Self::DailyLossLimit => "DAILY_LOSS_LIMIT",
            Self::PositionCap => "POSITION_CAP",
            Self::AlreadyHolding => "ALREADY_HOLDING",
            Self::MinHolding => "MIN_HOLDING",
            Self::TradeCooldown => "TRADE_COOLDOWN",
        };
        write!(f, "{tag}")
    }
}

impl VetoReason {
    /// Vetoes that warrant an operator warning.
    pub fn warns_operator(&self) -> bool {
        matches!(self, Self::MarketCondition | Self::ApiErrors)
    }
}
