// =============================================================================
// Grid engine — ladder of buy levels below a base price
// =============================================================================
//
// A grid is anchored at the price seen when a market is first analyzed.
// Crossing an unfilled level below the base emits a BUY for that rung;
// climbing one step above the cheapest filled rung emits a SELL to harvest
// it. The snapshot (base, step, filled rungs) is persisted as an encoded
// string under `grid.state.<market>` and restored on startup.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config_store::ConfigStore;
use crate::strategy::{SignalAction, Strategy, StrategyContext, TradingSignal};
use crate::types::{normalize_market, Side, StrategyCode};

/// Default grid spacing between rungs.
const DEFAULT_STEP_PERCENT: f64 = 1.0;
/// Rungs tracked below the base.
const MAX_LEVELS: i32 = 10;

fn state_key(market: &str) -> String {
    format!("grid.state.{}", normalize_market(market))
}

/// Persisted grid snapshot for one market.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridState {
    pub base_price: Decimal,
    pub step_percent: f64,
    /// Rung indexes currently holding inventory (negative = below base).
    pub filled_levels: Vec<i32>,
}

impl GridState {
    fn new(base_price: Decimal, step_percent: f64) -> Self {
        Self {
            base_price,
            step_percent,
            filled_levels: Vec::new(),
        }
    }

    /// Rung index for a price: 0 at the base, -1 one step below, and so on.
    fn level_for(&self, price: Decimal) -> i32 {
        let base = self.base_price.to_f64().unwrap_or(0.0);
        let p = price.to_f64().unwrap_or(0.0);
        if base <= 0.0 || self.step_percent <= 0.0 {
            return 0;
        }
        ((p / base - 1.0) / (self.step_percent / 100.0)).floor() as i32
    }
}

pub struct GridStrategy {
    config: Arc<ConfigStore>,
    states: RwLock<HashMap<String, GridState>>,
    dirty: RwLock<HashMap<String, bool>>,
}

impl GridStrategy {
    pub fn new(config: Arc<ConfigStore>) -> Self {
        Self {
            config,
            states: RwLock::new(HashMap::new()),
            dirty: RwLock::new(HashMap::new()),
        }
    }

    /// Fetch (restoring or initializing) the state for one market.
    fn state_for(&self, market: &str, current_price: Decimal) -> GridState {
        let market = normalize_market(market);
        if let Some(state) = self.states.read().get(&market) {
            return state.clone();
        }

        // Cold path: restore from the config store, else anchor a new grid.
        let restored = {
            let raw = self.config.get(&state_key(&market), "");
            if raw.is_empty() {
                None
            } else {
                match serde_json::from_str::<GridState>(&raw) {
                    Ok(s) => Some(s),
                    Err(e) => {
                        warn!(market = %market, error = %e, "unreadable grid snapshot, re-anchoring");
                        None
                    }
                }
            }
        };

        let state = restored.unwrap_or_else(|| {
            let step = self
                .config
                .get_f64("strategy.grid.step_pct", DEFAULT_STEP_PERCENT)
                .max(0.1);
            debug!(market = %market, base = %current_price, step, "grid anchored");
            GridState::new(current_price, step)
        });

        self.states.write().insert(market.clone(), state.clone());
        self.dirty.write().insert(market, true);
        state
    }

    fn mark_dirty(&self, market: &str) {
        self.dirty.write().insert(normalize_market(market), true);
    }
}

#[async_trait]
impl Strategy for GridStrategy {
    fn code(&self) -> StrategyCode {
        StrategyCode::Grid
    }

    fn analyze(&self, ctx: &StrategyContext<'_>) -> TradingSignal {
        let price = ctx.current_price;
        if price <= Decimal::ZERO {
            return TradingSignal::hold(ctx.market, self.code(), price, "invalid price");
        }

        let state = self.state_for(ctx.market, price);
        let level = state.level_for(price);

        // Below the base on an unfilled rung: buy it.
        if (-MAX_LEVELS..0).contains(&level) && !state.filled_levels.contains(&level) {
            let confidence = (50.0 + level.unsigned_abs() as f64 * 4.0).min(85.0);
            return TradingSignal {
                market: normalize_market(ctx.market),
                action: SignalAction::Buy,
                confidence,
                price,
                reason: format!("grid rung {level} at base {}", state.base_price),
                strategy: self.code(),
            };
        }

        // One step above the cheapest filled rung: harvest it.
        if let Some(&lowest) = state.filled_levels.iter().min() {
            if level > lowest {
                return TradingSignal {
                    market: normalize_market(ctx.market),
                    action: SignalAction::Sell,
                    confidence: 60.0,
                    price,
                    reason: format!("harvesting grid rung {lowest}"),
                    strategy: self.code(),
                };
            }
        }

        TradingSignal::hold(ctx.market, self.code(), price, "no rung crossed")
    }

    async fn on_order_filled(&self, market: &str, side: Side, price: Decimal) {
        let market = normalize_market(market);
        {
            let mut states = self.states.write();
            let Some(state) = states.get_mut(&market) else {
                return;
            };
            let level = state.level_for(price);
            match side {
                Side::Buy => {
                    if !state.filled_levels.contains(&level) {
                        state.filled_levels.push(level);
                        state.filled_levels.sort_unstable();
                    }
                }
                Side::Sell => {
                    // Harvest releases the cheapest rung.
                    if let Some(&lowest) = state.filled_levels.iter().min() {
                        state.filled_levels.retain(|&l| l != lowest);
                    }
                }
            }
        }
        self.mark_dirty(&market);
        self.persist_state(&market).await;
    }

    async fn persist_state(&self, market: &str) {
        let market = normalize_market(market);
        let is_dirty = self.dirty.read().get(&market).copied().unwrap_or(false);
        if !is_dirty {
            return;
        }

        let snapshot = match self.states.read().get(&market) {
            Some(s) => s.clone(),
            None => return,
        };
        match serde_json::to_string(&snapshot) {
            Ok(json) => {
                if let Err(e) = self
                    .config
                    .set_with_meta(&state_key(&market), &json, Some("strategy"), None)
                    .await
                {
                    warn!(market = %market, error = %e, "grid snapshot persistence failed");
                    return;
                }
                self.dirty.write().insert(market, false);
            }
            Err(e) => warn!(market = %market, error = %e, "grid snapshot serialization failed"),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::Candle;
    use crate::persistence::database::memory_pool;
    use crate::persistence::ConfigRepository;
    use crate::regime::{RegimeAnalysis, RegimeKind};
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn candles() -> Vec<Candle> {
        (0..30)
            .map(|_| Candle {
                timestamp: Utc::now(),
                open: dec!(100),
                high: dec!(100.5),
                low: dec!(99.5),
                close: dec!(100),
                volume: dec!(10),
            })
            .collect()
    }

    fn regime() -> RegimeAnalysis {
        RegimeAnalysis {
            regime: RegimeKind::Sideways,
            adx: 12.0,
            atr_percent: 0.8,
            confidence: 0.6,
        }
    }

    async fn strategy() -> GridStrategy {
        let config = Arc::new(
            ConfigStore::load(ConfigRepository::new(memory_pool().await))
                .await
                .unwrap(),
        );
        GridStrategy::new(config)
    }

    #[tokio::test]
    async fn anchors_at_first_price_and_holds() {
        let grid = strategy().await;
        let c = candles();
        let r = regime();
        let ctx = StrategyContext {
            market: "BTC-USDT",
            candles: &c,
            current_price: dec!(100),
            regime: &r,
        };
        assert_eq!(grid.analyze(&ctx).action, SignalAction::Hold);
    }

    #[tokio::test]
    async fn buys_unfilled_rung_below_base() {
        let grid = strategy().await;
        let c = candles();
        let r = regime();

        // Anchor at 100.
        let anchor = StrategyContext {
            market: "BTC-USDT",
            candles: &c,
            current_price: dec!(100),
            regime: &r,
        };
        grid.analyze(&anchor);

        // Price drops past the first rung (-1%).
        let dip = StrategyContext {
            market: "BTC-USDT",
            candles: &c,
            current_price: dec!(98.9),
            regime: &r,
        };
        let signal = grid.analyze(&dip);
        assert_eq!(signal.action, SignalAction::Buy);
        assert!(signal.reason.contains("rung"));

        // Filled rung does not re-buy.
        grid.on_order_filled("BTC-USDT", Side::Buy, dec!(98.9)).await;
        assert_eq!(grid.analyze(&dip).action, SignalAction::Hold);
    }

    #[tokio::test]
    async fn harvests_when_price_recovers() {
        let grid = strategy().await;
        let c = candles();
        let r = regime();
        let anchor = StrategyContext {
            market: "BTC-USDT",
            candles: &c,
            current_price: dec!(100),
            regime: &r,
        };
        grid.analyze(&anchor);
        grid.on_order_filled("BTC-USDT", Side::Buy, dec!(98.9)).await;

        let recovery = StrategyContext {
            market: "BTC-USDT",
            candles: &c,
            current_price: dec!(100.2),
            regime: &r,
        };
        let signal = grid.analyze(&recovery);
        assert_eq!(signal.action, SignalAction::Sell);

        // Selling releases the rung.
        grid.on_order_filled("BTC-USDT", Side::Sell, dec!(100.2)).await;
        assert_eq!(grid.analyze(&recovery).action, SignalAction::Hold);
    }

    #[tokio::test]
    async fn snapshot_restores_across_instances() {
        let config = Arc::new(
            ConfigStore::load(ConfigRepository::new(memory_pool().await))
                .await
                .unwrap(),
        );
        let c = candles();
        let r = regime();

        {
            let grid = GridStrategy::new(config.clone());
            let anchor = StrategyContext {
                market: "BTC-USDT",
                candles: &c,
                current_price: dec!(100),
                regime: &r,
            };
            grid.analyze(&anchor);
            grid.on_order_filled("BTC-USDT", Side::Buy, dec!(98.9)).await;
            grid.persist_state("BTC-USDT").await;
        }

        // New instance over the same store: the filled rung survives.
        let grid = GridStrategy::new(config);
        let dip = StrategyContext {
            market: "BTC-USDT",
            candles: &c,
            current_price: dec!(98.9),
            regime: &r,
        };
        assert_eq!(grid.analyze(&dip).action, SignalAction::Hold);
    }
}
