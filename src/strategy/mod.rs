// =============================================================================
// Strategy engines — pluggable analyzers producing buy/sell/hold signals
// =============================================================================
//
// Each engine implements one method over (market, candles, current price,
// regime). Engines are stateless per call; the two that track intra-session
// state (DCA last-buy timestamps, grid snapshots) persist it through the
// configuration store and restore it on startup.
// =============================================================================

pub mod breakout;
pub mod dca;
pub mod grid;
pub mod selector;
pub mod volatility;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::config_store::ConfigStore;
use crate::market_data::Candle;
use crate::regime::RegimeAnalysis;
use crate::types::{Side, StrategyCode};

/// What the engine wants done.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalAction {
    Buy,
    Sell,
    Hold,
}

impl std::fmt::Display for SignalAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
            Self::Hold => write!(f, "HOLD"),
        }
    }
}

/// One analysis verdict. Ephemeral — consumed by the tick loop, surfaced in
/// the status API, never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingSignal {
    pub market: String,
    pub action: SignalAction,
    /// Conviction in [0, 100].
    pub confidence: f64,
    pub price: Decimal,
    pub reason: String,
    pub strategy: StrategyCode,
}

impl TradingSignal {
    pub fn hold(market: &str, strategy: StrategyCode, price: Decimal, reason: &str) -> Self {
        Self {
            market: crate::types::normalize_market(market),
            action: SignalAction::Hold,
            confidence: 0.0,
            price,
            reason: reason.to_string(),
            strategy,
        }
    }
}

/// Inputs to one analysis pass.
pub struct StrategyContext<'a> {
    pub market: &'a str,
    pub candles: &'a [Candle],
    pub current_price: Decimal,
    pub regime: &'a RegimeAnalysis,
}

/// The engine contract.
#[async_trait]
pub trait Strategy: Send + Sync {
    fn code(&self) -> StrategyCode;

    /// Pure analysis pass; any in-memory state mutation must be idempotent
    /// for a repeated tick.
    fn analyze(&self, ctx: &StrategyContext<'_>) -> TradingSignal;

    /// Hook invoked after the executor finalizes a fill originated by this
    /// engine. Default: nothing to track.
    async fn on_order_filled(&self, _market: &str, _side: Side, _price: Decimal) {}

    /// Flush any dirty engine state to the configuration store. Called by the
    /// tick loop after analysis. Default: nothing persisted.
    async fn persist_state(&self, _market: &str) {}
}

// ---------------------------------------------------------------------------
// Per-strategy parameters
// ---------------------------------------------------------------------------

/// Tunables resolved from `strategy.<code>.*` keys with per-code defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyParams {
    pub stop_loss_percent: f64,
    pub take_profit_percent: f64,
    pub trailing_trigger_percent: f64,
    pub trailing_offset_percent: f64,
    pub max_holding_secs: i64,
    pub fill_timeout_secs: u64,
    /// Fall back to a market order when the limit wait times out.
    pub market_fallback: bool,
}

impl StrategyParams {
    pub fn defaults(code: StrategyCode) -> Self {
        match code {
            StrategyCode::VolatilitySurvival => Self {
                stop_loss_percent: -1.0,
                take_profit_percent: 1.5,
                trailing_trigger_percent: 1.0,
                trailing_offset_percent: 0.5,
                max_holding_secs: 900,
                fill_timeout_secs: 3,
                market_fallback: true,
            },
            StrategyCode::Breakout => Self {
                stop_loss_percent: -2.0,
                take_profit_percent: 4.0,
                trailing_trigger_percent: 2.5,
                trailing_offset_percent: 1.0,
                max_holding_secs: 21_600,
                fill_timeout_secs: 30,
                market_fallback: true,
            },
            StrategyCode::Grid => Self {
                stop_loss_percent: -3.0,
                take_profit_percent: 2.0,
                trailing_trigger_percent: 1.5,
                trailing_offset_percent: 0.7,
                max_holding_secs: 86_400,
                fill_timeout_secs: 45,
                market_fallback: false,
            },
            StrategyCode::Dca => Self {
                stop_loss_percent: -10.0,
                take_profit_percent: 8.0,
                trailing_trigger_percent: 5.0,
                trailing_offset_percent: 2.0,
                max_holding_secs: 604_800,
                fill_timeout_secs: 45,
                market_fallback: false,
            },
        }
    }

    /// Resolve from the configuration store, falling back per key.
    pub fn load(config: &ConfigStore, code: StrategyCode) -> Self {
        let d = Self::defaults(code);
        let prefix = format!("strategy.{}", code.as_str());
        Self {
            stop_loss_percent: config
                .get_f64(&format!("{prefix}.stop_loss_pct"), d.stop_loss_percent),
            take_profit_percent: config
                .get_f64(&format!("{prefix}.take_profit_pct"), d.take_profit_percent),
            trailing_trigger_percent: config.get_f64(
                &format!("{prefix}.trailing_trigger_pct"),
                d.trailing_trigger_percent,
            ),
            trailing_offset_percent: config.get_f64(
                &format!("{prefix}.trailing_offset_pct"),
                d.trailing_offset_percent,
            ),
            max_holding_secs: config
                .get_i64(&format!("{prefix}.max_holding_secs"), d.max_holding_secs),
            fill_timeout_secs: config
                .get_i64(&format!("{prefix}.fill_timeout_secs"), d.fill_timeout_secs as i64)
                .max(1) as u64,
            market_fallback: config
                .get_bool(&format!("{prefix}.market_fallback"), d.market_fallback),
        }
    }
}

/// Strategy codes whose entries always go straight to market orders.
pub fn forces_market_order(code: StrategyCode) -> bool {
    matches!(code, StrategyCode::VolatilitySurvival)
}

// =============================================================================
// Tests
// =============================================================================
