// =============================================================================
// Risk gate — composite admission control for every order
// =============================================================================
//
// A pipeline of independent checks, short-circuiting on the first veto:
//
//   1. trading toggle        (config `trading.enabled`, re-read every call)
//   2. circuit breaker       (per-market + global)
//   3. market condition      (spread, depth, API-error window; volatility
//                             warns but does not veto)
//   4. daily loss limit      (sticky until the next local midnight)
//   5. position cap          (aggregate across engines)
//   6. cross-engine conflict (BUY only: open position or dust-level coin)
//   7. cooldown gates        (min holding before SELL, post-sell re-BUY)
//
// The repository is authoritative; the short-TTL caches here only damp the
// query rate and are never used for state transitions.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::RwLock;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use tracing::{debug, warn};

use crate::config_store::{
    ConfigStore, KEY_DAILY_LOSS_LIMIT, KEY_MAX_CONCURRENT_POSITIONS, KEY_MIN_HOLDING_SECS,
    KEY_MIN_ORDER_AMOUNT, KEY_TRADE_COOLDOWN_SECS, KEY_TRADING_ENABLED,
};
use crate::market_data::MarketDataService;
use crate::notify::Notifier;
use crate::persistence::Repositories;
use crate::risk::circuit_breaker::CircuitBreaker;
use crate::risk::VetoReason;
use crate::types::{base_currency, normalize_market, MarketClock, Side};

const DEFAULT_DAILY_LOSS_LIMIT: f64 = -30_000.0;
const DEFAULT_MAX_CONCURRENT: i64 = 6;
const DEFAULT_MIN_ORDER_AMOUNT: f64 = 5_000.0;
const DEFAULT_MIN_HOLDING_SECS: i64 = 300;
const DEFAULT_COOLDOWN_SECS: i64 = 300;

const MAX_SPREAD_PERCENT: f64 = 0.5;
const MIN_DEPTH_MULTIPLE: f64 = 3.0;
const VOLATILITY_WARN_PERCENT: f64 = 2.0;
const MAX_API_ERRORS_PER_MINUTE: usize = 5;

/// Cache TTL for repository-backed lookups.
const CACHE_TTL_SECS: u64 = 5;
/// Minimum gap between operator warnings for one market.
const WARN_INTERVAL_SECS: u64 = 600;

pub struct RiskGate {
    config: Arc<ConfigStore>,
    breaker: Arc<CircuitBreaker>,
    repos: Arc<Repositories>,
    market_data: Arc<MarketDataService>,
    notifier: Arc<dyn Notifier>,
    clock: MarketClock,

    last_buy_at: RwLock<HashMap<String, DateTime<Utc>>>,
    last_sell_at: RwLock<HashMap<String, DateTime<Utc>>>,
    daily_loss_tripped_on: RwLock<Option<NaiveDate>>,
    open_count_cache: RwLock<Option<(Instant, u32)>>,
    holding_cache: RwLock<HashMap<String, (Instant, bool)>>,
    warned_at: RwLock<HashMap<String, Instant>>,
}

impl RiskGate {
    pub fn new(
        config: Arc<ConfigStore>,
        breaker: Arc<CircuitBreaker>,
        repos: Arc<Repositories>,
        market_data: Arc<MarketDataService>,
        notifier: Arc<dyn Notifier>,
        clock: MarketClock,
    ) -> Self {
        Self {
            config,
            breaker,
            repos,
            market_data,
            notifier,
            clock,
            last_buy_at: RwLock::new(HashMap::new()),
            last_sell_at: RwLock::new(HashMap::new()),
            daily_loss_tripped_on: RwLock::new(None),
            open_count_cache: RwLock::new(None),
            holding_cache: RwLock::new(HashMap::new()),
            warned_at: RwLock::new(HashMap::new()),
        }
    }

    // -------------------------------------------------------------------------
    // Entry admission
    // -------------------------------------------------------------------------

    /// Full pipeline for an entry order of `amount` quote units.
    pub async fn can_trade(
        &self,
        market: &str,
        side: Side,
        amount: Decimal,
    ) -> Result<(), VetoReason> {
        let market = normalize_market(market);
        let result = self.run_checks(&market, side, amount).await;

        if let Err(reason) = &result {
            debug!(market = %market, side = %side, reason = %reason, "risk gate veto");
            if reason.warns_operator() {
                self.warn_rate_limited(&market, &format!("entry vetoed: {reason}"))
                    .await;
            }
        }
        result
    }

    async fn run_checks(
        &self,
        market: &str,
        side: Side,
        amount: Decimal,
    ) -> Result<(), VetoReason> {
        // 1. Trading toggle — read inside the tick, never cached per run.
        if !self.config.get_bool(KEY_TRADING_ENABLED, false) {
            return Err(VetoReason::TradingDisabled);
        }

        // 2. Circuit breaker.
        if self.breaker.check(market).is_err() {
            return Err(VetoReason::CircuitBreaker);
        }

        // 3. Market condition.
        self.check_market_condition(market, side, amount).await?;

        // 4. Daily loss limit.
        self.check_daily_loss().await?;

        // 5. Position cap.
        self.check_position_cap().await?;

        // 6. Cross-engine conflict (double-buy prevention).
        if side == Side::Buy {
            self.check_already_holding(market).await?;
        }

        // 7. Cooldown gates.
        self.check_cooldowns(market, side)?;

        Ok(())
    }

    /// Lightweight gate for protective exits: only the API-error window can
    /// hold a close back — a dead exchange should not be hammered, but loss
    /// limits and breakers never trap an open position.
    pub fn can_close(&self) -> Result<(), VetoReason> {
        if self.breaker.api_errors().count_last_minute() > MAX_API_ERRORS_PER_MINUTE {
            return Err(VetoReason::ApiErrors);
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Individual checks
    // -------------------------------------------------------------------------

    async fn check_market_condition(
        &self,
        market: &str,
        side: Side,
        amount: Decimal,
    ) -> Result<(), VetoReason> {
        if self.breaker.api_errors().count_last_minute() > MAX_API_ERRORS_PER_MINUTE {
            return Err(VetoReason::ApiErrors);
        }

        let book = self
            .market_data
            .orderbook(market, 10)
            .await
            .map_err(|_| VetoReason::MarketCondition)?;

        match book.spread_percent() {
            Some(spread) if spread <= MAX_SPREAD_PERCENT => {}
            _ => return Err(VetoReason::MarketCondition),
        }

        let mid = book.mid().ok_or(VetoReason::MarketCondition)?;
        if mid <= Decimal::ZERO {
            return Err(VetoReason::MarketCondition);
        }
        let order_quantity = amount / mid;
        let required_depth =
            order_quantity * Decimal::from_f64(MIN_DEPTH_MULTIPLE).unwrap_or(Decimal::from(3));
        if book.depth_for(side) < required_depth {
            return Err(VetoReason::MarketCondition);
        }

        // Volatility is advisory: warn, do not veto.
        let volatility = self.market_data.volatility_1m(market);
        if volatility > VOLATILITY_WARN_PERCENT {
            self.warn_rate_limited(
                market,
                &format!("1-minute volatility {volatility:.2}% above {VOLATILITY_WARN_PERCENT}%"),
            )
            .await;
        }

        Ok(())
    }

    async fn check_daily_loss(&self) -> Result<(), VetoReason> {
        let today = self.clock.today();

        // Once tripped, stays tripped until the next local midnight.
        {
            let mut tripped = self.daily_loss_tripped_on.write();
            match *tripped {
                Some(date) if date == today => return Err(VetoReason::DailyLossLimit),
                Some(_) => *tripped = None,
                None => {}
            }
        }

        let floor = self
            .config
            .get_f64(KEY_DAILY_LOSS_LIMIT, DEFAULT_DAILY_LOSS_LIMIT);
        let midnight = self.clock.local_midnight_utc();
        let realized = self
            .repos
            .trades
            .realized_pnl_since(midnight)
            .await
            .unwrap_or(Decimal::ZERO);

        let floor_dec = Decimal::from_f64(floor).unwrap_or(Decimal::ZERO);
        if realized <= floor_dec {
            warn!(realized = %realized, floor, "daily loss limit tripped");
            *self.daily_loss_tripped_on.write() = Some(today);
            return Err(VetoReason::DailyLossLimit);
        }
        Ok(())
    }

    async fn check_position_cap(&self) -> Result<(), VetoReason> {
        let max = self
            .config
            .get_i64(KEY_MAX_CONCURRENT_POSITIONS, DEFAULT_MAX_CONCURRENT) as u32;

        let cached = {
            let cache = self.open_count_cache.read();
            cache.and_then(|(at, count)| {
                (at.elapsed().as_secs() < CACHE_TTL_SECS).then_some(count)
            })
        };

        let count = match cached {
            Some(c) => c,
            None => {
                let fresh = self.repos.positions.count_open().await.unwrap_or(0);
                *self.open_count_cache.write() = Some((Instant::now(), fresh));
                fresh
            }
        };

        if count >= max {
            return Err(VetoReason::PositionCap);
        }
        Ok(())
    }

    async fn check_already_holding(&self, market: &str) -> Result<(), VetoReason> {
        let cached = {
            let cache = self.holding_cache.read();
            cache.get(market).and_then(|(at, holding)| {
                (at.elapsed().as_secs() < CACHE_TTL_SECS).then_some(*holding)
            })
        };

        let holding = match cached {
            Some(h) => h,
            None => {
                let fresh = self
                    .repos
                    .positions
                    .has_open_position(market)
                    .await
                    .unwrap_or(false);
                self.holding_cache
                    .write()
                    .insert(market.to_string(), (Instant::now(), fresh));
                fresh
            }
        };
        if holding {
            return Err(VetoReason::AlreadyHolding);
        }

        // Dust check: a meaningful coin balance means an earlier buy is still
        // sitting on the book somewhere.
        let min_amount = Decimal::from_f64(
            self.config
                .get_f64(KEY_MIN_ORDER_AMOUNT, DEFAULT_MIN_ORDER_AMOUNT),
        )
        .unwrap_or(Decimal::ZERO);

        let base = base_currency(market);
        if let (Ok(balance), Ok(price)) = (
            self.market_data.balance(&base).await,
            self.market_data.last_price(market).await,
        ) {
            let coin_value = (balance.available + balance.locked) * price;
            if coin_value >= min_amount {
                return Err(VetoReason::AlreadyHolding);
            }
        }
        Ok(())
    }

    fn check_cooldowns(&self, market: &str, side: Side) -> Result<(), VetoReason> {
        let now = Utc::now();
        match side {
            Side::Sell => {
                let min_hold = self
                    .config
                    .get_i64(KEY_MIN_HOLDING_SECS, DEFAULT_MIN_HOLDING_SECS);
                if let Some(bought) = self.last_buy_at.read().get(market) {
                    if (now - *bought).num_seconds() < min_hold {
                        return Err(VetoReason::MinHolding);
                    }
                }
            }
            Side::Buy => {
                let cooldown = self
                    .config
                    .get_i64(KEY_TRADE_COOLDOWN_SECS, DEFAULT_COOLDOWN_SECS);
                if let Some(sold) = self.last_sell_at.read().get(market) {
                    if (now - *sold).num_seconds() < cooldown {
                        return Err(VetoReason::TradeCooldown);
                    }
                }
            }
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // State the executor reports back
    // -------------------------------------------------------------------------

    pub fn record_buy(&self, market: &str) {
        self.last_buy_at
            .write()
            .insert(normalize_market(market), Utc::now());
        self.invalidate_market(market);
    }

    pub fn record_sell(&self, market: &str) {
        self.last_sell_at
            .write()
            .insert(normalize_market(market), Utc::now());
        self.invalidate_market(market);
    }

    /// Drop cached lookups for a market after any write touching it.
    pub fn invalidate_market(&self, market: &str) {
        self.holding_cache.write().remove(&normalize_market(market));
        *self.open_count_cache.write() = None;
    }

    async fn warn_rate_limited(&self, market: &str, message: &str) {
        let should_send = {
            let mut warned = self.warned_at.write();
            match warned.get(market) {
                Some(at) if at.elapsed().as_secs() < WARN_INTERVAL_SECS => false,
                _ => {
                    warned.insert(market.to_string(), Instant::now());
                    true
                }
            }
        };
        if should_send {
            self.notifier.send_warning(market, message).await;
        }
    }

    #[cfg(test)]
    pub fn force_last_sell(&self, market: &str, at: DateTime<Utc>) {
        self.last_sell_at
            .write()
            .insert(normalize_market(market), at);
    }

    #[cfg(test)]
    pub fn force_last_buy(&self, market: &str, at: DateTime<Utc>) {
        self.last_buy_at
            .write()
            .insert(normalize_market(market), at);
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::testkit::MockExchange;
    use crate::execution::TradeRecord;
    use crate::notify::testkit::RecordingNotifier;
    use crate::persistence::database::memory_pool;
    use crate::position::{Position, PositionOpen};
    use crate::risk::circuit_breaker::ApiErrorWindow;
    use crate::types::{OrderType, StrategyCode};
    use chrono::Duration;
    use rust_decimal_macros::dec;

    struct Harness {
        gate: RiskGate,
        exchange: Arc<MockExchange>,
        repos: Arc<Repositories>,
        config: Arc<ConfigStore>,
        breaker: Arc<CircuitBreaker>,
        notifier: Arc<RecordingNotifier>,
    }

    async fn harness() -> Harness {
        let pool = memory_pool().await;
        let repos = Arc::new(Repositories::new(pool.clone()));
        let config = Arc::new(
            ConfigStore::load(crate::persistence::ConfigRepository::new(pool))
                .await
                .unwrap(),
        );
        config.set(KEY_TRADING_ENABLED, "true").await.unwrap();

        let api_errors = Arc::new(ApiErrorWindow::new());
        let breaker = Arc::new(CircuitBreaker::new(api_errors.clone()));
        let exchange = Arc::new(MockExchange::new());
        exchange.set_ticker("BTC-USDT", dec!(100));
        exchange.set_deep_book("BTC-USDT", dec!(100));
        exchange.set_balance("USDT", dec!(1_000_000), dec!(0));

        let market_data = Arc::new(MarketDataService::new(exchange.clone(), api_errors));
        let notifier = Arc::new(RecordingNotifier::default());

        let gate = RiskGate::new(
            config.clone(),
            breaker.clone(),
            repos.clone(),
            market_data,
            notifier.clone(),
            MarketClock::from_offset_hours(9),
        );

        Harness {
            gate,
            exchange,
            repos,
            config,
            breaker,
            notifier,
        }
    }

    fn open_position(market: &str) -> Position {
        Position::open(PositionOpen {
            strategy: StrategyCode::Breakout,
            market: market.into(),
            side: Side::Buy,
            entry_price: dec!(100),
            filled_quantity: dec!(1),
            target_quantity: dec!(1),
            stop_loss_percent: -2.0,
            take_profit_percent: 3.0,
            timeout_at: Utc::now() + Duration::hours(6),
        })
    }

    fn losing_trade(order_id: &str, pnl: Decimal) -> TradeRecord {
        TradeRecord {
            order_id: order_id.into(),
            market: "BTC-USDT".into(),
            side: Side::Sell,
            order_type: OrderType::Limit,
            price: dec!(100),
            quantity: dec!(1),
            total_amount: dec!(100),
            fee: dec!(0.05),
            slippage_percent: None,
            is_partial_fill: false,
            pnl: Some(pnl),
            pnl_percent: Some(-1.0),
            strategy: StrategyCode::Breakout,
            regime: None,
            confidence: 50.0,
            reason: "test".into(),
            simulated: false,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn toggle_off_vetoes_everything() {
        let h = harness().await;
        h.config.set(KEY_TRADING_ENABLED, "false").await.unwrap();
        let veto = h
            .gate
            .can_trade("BTC-USDT", Side::Buy, dec!(10000))
            .await
            .unwrap_err();
        assert_eq!(veto, VetoReason::TradingDisabled);
    }

    #[tokio::test]
    async fn clean_state_admits_a_buy() {
        let h = harness().await;
        h.exchange.set_balance("BTC", dec!(0), dec!(0));
        assert!(h.gate.can_trade("BTC-USDT", Side::Buy, dec!(10000)).await.is_ok());
    }

    #[tokio::test]
    async fn gate_is_idempotent_without_state_change() {
        let h = harness().await;
        h.exchange.set_balance("BTC", dec!(0), dec!(0));
        let first = h.gate.can_trade("BTC-USDT", Side::Buy, dec!(10000)).await;
        let second = h.gate.can_trade("BTC-USDT", Side::Buy, dec!(10000)).await;
        assert_eq!(first.is_ok(), second.is_ok());
    }

    #[tokio::test]
    async fn tripped_breaker_vetoes() {
        let h = harness().await;
        for _ in 0..3 {
            h.breaker.record_loss("BTC-USDT");
        }
        let veto = h
            .gate
            .can_trade("BTC-USDT", Side::Buy, dec!(10000))
            .await
            .unwrap_err();
        assert_eq!(veto, VetoReason::CircuitBreaker);
    }

    #[tokio::test]
    async fn wide_spread_vetoes_with_market_condition() {
        use crate::exchange::{Orderbook, OrderbookLevel};
        let h = harness().await;
        h.exchange.set_balance("BTC", dec!(0), dec!(0));
        h.exchange.set_book(
            "BTC-USDT",
            Orderbook {
                market: "BTC-USDT".into(),
                bids: vec![OrderbookLevel { price: dec!(99), quantity: dec!(100) }],
                asks: vec![OrderbookLevel { price: dec!(101), quantity: dec!(100) }],
            },
        );
        let veto = h
            .gate
            .can_trade("BTC-USDT", Side::Buy, dec!(10000))
            .await
            .unwrap_err();
        assert_eq!(veto, VetoReason::MarketCondition);
        // And the operator got a (single) warning.
        assert_eq!(h.notifier.warnings.lock().len(), 1);
    }

    #[tokio::test]
    async fn shallow_depth_vetoes() {
        use crate::exchange::{Orderbook, OrderbookLevel};
        let h = harness().await;
        h.exchange.set_balance("BTC", dec!(0), dec!(0));
        h.exchange.set_book(
            "BTC-USDT",
            Orderbook {
                market: "BTC-USDT".into(),
                bids: vec![OrderbookLevel { price: dec!(99.95), quantity: dec!(0.1) }],
                asks: vec![OrderbookLevel { price: dec!(100.05), quantity: dec!(0.1) }],
            },
        );
        // 10 000 quote at mid 100 = 100 base units, needs 300 of depth.
        let veto = h
            .gate
            .can_trade("BTC-USDT", Side::Buy, dec!(10000))
            .await
            .unwrap_err();
        assert_eq!(veto, VetoReason::MarketCondition);
    }

    #[tokio::test]
    async fn api_error_burst_vetoes_and_warns_once_per_window() {
        let h = harness().await;
        for _ in 0..6 {
            h.breaker.api_errors().record();
        }
        let veto = h
            .gate
            .can_trade("BTC-USDT", Side::Buy, dec!(10000))
            .await
            .unwrap_err();
        assert_eq!(veto, VetoReason::ApiErrors);

        // Second veto inside the 10-minute window adds no second warning.
        let _ = h.gate.can_trade("BTC-USDT", Side::Buy, dec!(10000)).await;
        assert_eq!(h.notifier.warnings.lock().len(), 1);
    }

    #[tokio::test]
    async fn daily_loss_floor_is_sticky() {
        let h = harness().await;
        h.exchange.set_balance("BTC", dec!(0), dec!(0));
        h.repos
            .trades
            .insert(&losing_trade("l1", dec!(-31000)))
            .await
            .unwrap();

        let veto = h
            .gate
            .can_trade("BTC-USDT", Side::Buy, dec!(10000))
            .await
            .unwrap_err();
        assert_eq!(veto, VetoReason::DailyLossLimit);

        // Winning back does not un-trip the same day.
        h.repos
            .trades
            .insert(&losing_trade("w1", dec!(40000)))
            .await
            .unwrap();
        let veto = h
            .gate
            .can_trade("BTC-USDT", Side::Buy, dec!(10000))
            .await
            .unwrap_err();
        assert_eq!(veto, VetoReason::DailyLossLimit);
    }

    #[tokio::test]
    async fn position_cap_counts_aggregate() {
        let h = harness().await;
        h.exchange.set_balance("BTC", dec!(0), dec!(0));
        for i in 0..6 {
            h.repos
                .positions
                .insert(&open_position(&format!("M{i}-USDT")))
                .await
                .unwrap();
        }
        let veto = h
            .gate
            .can_trade("BTC-USDT", Side::Buy, dec!(10000))
            .await
            .unwrap_err();
        assert_eq!(veto, VetoReason::PositionCap);
    }

    #[tokio::test]
    async fn open_position_blocks_double_buy() {
        let h = harness().await;
        h.exchange.set_balance("BTC", dec!(0), dec!(0));
        h.repos
            .positions
            .insert(&open_position("BTC-USDT"))
            .await
            .unwrap();
        let veto = h
            .gate
            .can_trade("BTC-USDT", Side::Buy, dec!(10000))
            .await
            .unwrap_err();
        assert_eq!(veto, VetoReason::AlreadyHolding);
    }

    #[tokio::test]
    async fn coin_dust_above_minimum_blocks_buy() {
        let h = harness().await;
        // 100 BTC-units * 100 = 10 000 quote value, above the 5 000 floor.
        h.exchange.set_balance("BTC", dec!(100), dec!(0));
        let veto = h
            .gate
            .can_trade("BTC-USDT", Side::Buy, dec!(10000))
            .await
            .unwrap_err();
        assert_eq!(veto, VetoReason::AlreadyHolding);
    }

    #[tokio::test]
    async fn sell_cooldown_prevents_rebuy_until_elapsed() {
        let h = harness().await;
        h.exchange.set_balance("BTC", dec!(0), dec!(0));

        // SELL finalized 120 s ago: BUY is vetoed with TRADE_COOLDOWN.
        h.gate
            .force_last_sell("BTC-USDT", Utc::now() - Duration::seconds(120));
        let veto = h
            .gate
            .can_trade("BTC-USDT", Side::Buy, dec!(10000))
            .await
            .unwrap_err();
        assert_eq!(veto, VetoReason::TradeCooldown);

        // At 300 s the gate admits again.
        h.gate
            .force_last_sell("BTC-USDT", Utc::now() - Duration::seconds(300));
        assert!(h.gate.can_trade("BTC-USDT", Side::Buy, dec!(10000)).await.is_ok());
    }

    #[tokio::test]
    async fn min_holding_blocks_early_sell() {
        let h = harness().await;
        h.gate
            .force_last_buy("BTC-USDT", Utc::now() - Duration::seconds(60));
        let veto = h
            .gate
            .can_trade("BTC-USDT", Side::Sell, dec!(10000))
            .await
            .unwrap_err();
        assert_eq!(veto, VetoReason::MinHolding);

        h.gate
            .force_last_buy("BTC-USDT", Utc::now() - Duration::seconds(301));
        assert!(h.gate.can_trade("BTC-USDT", Side::Sell, dec!(10000)).await.is_ok());
    }

    #[tokio::test]
    async fn close_gate_only_blocks_on_api_errors() {
        let h = harness().await;
        // Breakers and loss limits do not trap an exit.
        for _ in 0..3 {
            h.breaker.record_loss("BTC-USDT");
        }
        assert!(h.gate.can_close().is_ok());

        for _ in 0..6 {
            h.breaker.api_errors().record();
        }
        assert_eq!(h.gate.can_close().unwrap_err(), VetoReason::ApiErrors);
    }
}
