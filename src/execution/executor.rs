// =============================================================================
// Order executor — turns a trading signal into a concrete fill
// =============================================================================
//
// Pipeline per order:
//   1. mode selection  (limit at best opposite quote, or market when any two
//      of: 1-min volatility > 1.5%, confidence > 85, liquidity < 5x quantity;
//      some strategy codes always force market)
//   2. risk gate + REQUESTED lifecycle event
//   3. submit (transport errors bump the API-error counter)
//   4. wait loop with exponential backoff to the strategy's deadline; stale
//      limits are cancelled, then fall back to market or report NO_FILL
//   5. finalize: executed quantity, average fill price, slippage against the
//      mid at submit time, trade record, idempotent FILLED event, breaker
//      counter updates
//
// The executor never mutates a position; callers reconcile from the report.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config_store::ConfigStore;
use crate::error::ExecutionError;
use crate::exchange::{ExchangeApi, ExchangeError, OrderRequest, OrderSnapshot};
use crate::execution::{ExecutionReport, MarketLocks, TradeRecord};
use crate::lifecycle::{LifecycleEvent, LifecycleEventType, LifecycleTracker};
use crate::market_data::MarketDataService;
use crate::position::Position;
use crate::risk::circuit_breaker::CircuitBreaker;
use crate::risk::gate::RiskGate;
use crate::risk::VetoReason;
use crate::strategy::{forces_market_order, SignalAction, StrategyParams, TradingSignal};
use crate::types::{OrderState, OrderType, Side, StrategyCode, StrategyGroup};

/// Initial poll interval in the fill-wait loop.
const POLL_START_MS: u64 = 200;
/// Poll interval ceiling.
const POLL_CAP_MS: u64 = 2_000;
/// Volatility above which a market-order vote is cast.
const MODE_VOLATILITY_PERCENT: f64 = 1.5;
/// Confidence above which a market-order vote is cast.
const MODE_CONFIDENCE: f64 = 85.0;
/// Liquidity multiple below which a market-order vote is cast.
const MODE_LIQUIDITY_MULTIPLE: i64 = 5;
/// Fill share at or above which a partial fill still reads as on-target.
const PARTIAL_SUCCESS_PERCENT: f64 = 90.0;

pub struct OrderExecutor {
    exchange: Arc<dyn ExchangeApi>,
    market_data: Arc<MarketDataService>,
    gate: Arc<RiskGate>,
    breaker: Arc<CircuitBreaker>,
    lifecycle: Arc<LifecycleTracker>,
    config: Arc<ConfigStore>,
    entry_locks: MarketLocks,
}

struct SubmitContext {
    market: String,
    side: Side,
    strategy: StrategyCode,
    group: StrategyGroup,
    /// Orderbook mid captured just before submit; slippage is measured
    /// against it.
    mid_at_submit: Decimal,
    target_quantity: Decimal,
}

impl OrderExecutor {
    pub fn new(
        exchange: Arc<dyn ExchangeApi>,
        market_data: Arc<MarketDataService>,
        gate: Arc<RiskGate>,
        breaker: Arc<CircuitBreaker>,
        lifecycle: Arc<LifecycleTracker>,
        config: Arc<ConfigStore>,
    ) -> Self {
        Self {
            exchange,
            market_data,
            gate,
            breaker,
            lifecycle,
            config,
            entry_locks: MarketLocks::new(),
        }
    }

    // -------------------------------------------------------------------------
    // Entry path
    // -------------------------------------------------------------------------

    /// Execute an entry BUY worth `amount` quote units. The per-market entry
    /// mutex serializes gate + submit so two engines can never race a buy on
    /// the same market.
    pub async fn execute_entry(
        &self,
        signal: &TradingSignal,
        amount: Decimal,
    ) -> Result<ExecutionReport, ExecutionError> {
        if signal.action != SignalAction::Buy {
            return Err(ExecutionError::InvariantViolation(format!(
                "entry path only handles BUY, got {}",
                signal.action
            )));
        }
        if amount <= Decimal::ZERO {
            return Err(ExecutionError::InvariantViolation(format!(
                "non-positive order amount {amount}"
            )));
        }

        let lock = self.entry_locks.for_market(&signal.market);
        let _guard = lock.lock().await;

        let book = self
            .market_data
            .orderbook(&signal.market, 10)
            .await
            .map_err(|e| self.transport(&signal.market, e))?;
        let mid = book
            .mid()
            .ok_or_else(|| ExecutionError::VerificationFailed("empty orderbook".into()))?;
        let best_ask = book
            .best_ask()
            .ok_or_else(|| ExecutionError::VerificationFailed("no asks".into()))?;

        self.gate
            .can_trade(&signal.market, Side::Buy, amount)
            .await
            .map_err(|reason| match reason {
                VetoReason::CircuitBreaker => {
                    ExecutionError::CircuitBreakerOpen(signal.market.clone())
                }
                other => ExecutionError::RiskVeto(other),
            })?;

        let params = StrategyParams::load(&self.config, signal.strategy);
        let quantity = (amount / best_ask).round_dp(8);
        let order_type = self.choose_order_type(signal, &book, quantity);

        let ctx = SubmitContext {
            market: signal.market.clone(),
            side: Side::Buy,
            strategy: signal.strategy,
            group: StrategyGroup::CoreEngine,
            mid_at_submit: mid,
            target_quantity: quantity,
        };

        self.lifecycle
            .record(
                LifecycleEvent::new(&ctx.market, LifecycleEventType::BuyRequested, ctx.group)
                    .with_side(Side::Buy)
                    .with_strategy(ctx.strategy)
                    .with_message(signal.reason.clone()),
            )
            .await;

        let report = match order_type {
            OrderType::Market => {
                self.submit_and_finalize(&ctx, OrderType::Market, None, None, Some(amount), signal)
                    .await
            }
            OrderType::Limit => {
                self.limit_with_deadline(
                    &ctx,
                    best_ask,
                    quantity,
                    &params,
                    signal,
                    Some(amount),
                )
                .await
            }
        }?;

        if report.success {
            self.gate.record_buy(&ctx.market);
        }
        Ok(report)
    }

    // -------------------------------------------------------------------------
    // Close path
    // -------------------------------------------------------------------------

    /// Execute a SELL of `quantity` base units closing `position`. Caller
    /// holds the per-market close mutex.
    pub async fn execute_close(
        &self,
        position: &Position,
        quantity: Decimal,
        reason: &str,
    ) -> Result<ExecutionReport, ExecutionError> {
        if quantity <= Decimal::ZERO {
            return Err(ExecutionError::InvariantViolation(format!(
                "non-positive close quantity {quantity}"
            )));
        }

        self.gate.can_close().map_err(ExecutionError::RiskVeto)?;

        let book = self
            .market_data
            .orderbook(&position.market, 10)
            .await
            .map_err(|e| self.transport(&position.market, e))?;
        let mid = book
            .mid()
            .ok_or_else(|| ExecutionError::VerificationFailed("empty orderbook".into()))?;
        let best_bid = book
            .best_bid()
            .ok_or_else(|| ExecutionError::VerificationFailed("no bids".into()))?;

        let params = StrategyParams::load(&self.config, position.strategy);

        let ctx = SubmitContext {
            market: position.market.clone(),
            side: Side::Sell,
            strategy: position.strategy,
            group: StrategyGroup::CoreEngine,
            mid_at_submit: mid,
            target_quantity: quantity,
        };

        self.lifecycle
            .record(
                LifecycleEvent::new(&ctx.market, LifecycleEventType::SellRequested, ctx.group)
                    .with_side(Side::Sell)
                    .with_strategy(ctx.strategy)
                    .with_message(reason.to_string()),
            )
            .await;

        let close_signal = TradingSignal {
            market: position.market.clone(),
            action: SignalAction::Sell,
            confidence: 100.0,
            price: best_bid,
            reason: reason.to_string(),
            strategy: position.strategy,
        };

        let report = if forces_market_order(position.strategy) {
            self.submit_and_finalize(
                &ctx,
                OrderType::Market,
                None,
                Some(quantity),
                None,
                &close_signal,
            )
            .await
        } else {
            self.limit_with_deadline(&ctx, best_bid, quantity, &params, &close_signal, None)
                .await
        }?;

        if report.success {
            self.gate.record_sell(&ctx.market);
        }
        Ok(report)
    }

    // -------------------------------------------------------------------------
    // Mode selection
    // -------------------------------------------------------------------------

    fn choose_order_type(
        &self,
        signal: &TradingSignal,
        book: &crate::exchange::Orderbook,
        quantity: Decimal,
    ) -> OrderType {
        if forces_market_order(signal.strategy) {
            return OrderType::Market;
        }

        let mut votes = 0;
        if self.market_data.volatility_1m(&signal.market) > MODE_VOLATILITY_PERCENT {
            votes += 1;
        }
        if signal.confidence > MODE_CONFIDENCE {
            votes += 1;
        }
        let side = match signal.action {
            SignalAction::Sell => Side::Sell,
            _ => Side::Buy,
        };
        if book.depth_for(side) < quantity * Decimal::from(MODE_LIQUIDITY_MULTIPLE) {
            votes += 1;
        }

        if votes >= 2 {
            debug!(market = %signal.market, votes, "mode selection chose MARKET");
            OrderType::Market
        } else {
            OrderType::Limit
        }
    }

    // -------------------------------------------------------------------------
    // Limit wait loop
    // -------------------------------------------------------------------------

    async fn limit_with_deadline(
        &self,
        ctx: &SubmitContext,
        price: Decimal,
        quantity: Decimal,
        params: &StrategyParams,
        signal: &TradingSignal,
        fallback_amount: Option<Decimal>,
    ) -> Result<ExecutionReport, ExecutionError> {
        let order_id = self
            .submit(ctx, OrderType::Limit, Some(price), Some(quantity), None)
            .await?;

        let deadline = Duration::from_secs(params.fill_timeout_secs);
        match self.wait_for_fill(&order_id, deadline).await? {
            WaitOutcome::Done(snapshot) => {
                self.finalize(ctx, snapshot, OrderType::Limit, signal).await
            }
            WaitOutcome::Cancelled => {
                self.lifecycle
                    .record(
                        LifecycleEvent::new(&ctx.market, LifecycleEventType::Cancelled, ctx.group)
                            .with_order(&order_id)
                            .with_side(ctx.side)
                            .with_strategy(ctx.strategy),
                    )
                    .await;
                Ok(ExecutionReport::no_fill(format!(
                    "limit order {order_id} cancelled on the exchange"
                )))
            }
            WaitOutcome::StillWaiting => {
                // Deadline passed: cancel the stale limit.
                self.lifecycle
                    .record(
                        LifecycleEvent::new(
                            &ctx.market,
                            LifecycleEventType::CancelRequested,
                            ctx.group,
                        )
                        .with_order(&order_id)
                        .with_side(ctx.side)
                        .with_strategy(ctx.strategy)
                        .with_message("fill deadline elapsed"),
                    )
                    .await;

                if let Err(e) = self.exchange.cancel_order(&order_id).await {
                    warn!(order_id = %order_id, error = %e, "stale limit cancel failed");
                    // The order may have filled in the race; re-read it.
                    if let Ok(snapshot) = self.exchange.get_order(&order_id).await {
                        if snapshot.state == OrderState::Done {
                            return self.finalize(ctx, snapshot, OrderType::Limit, signal).await;
                        }
                    }
                    return Err(ExecutionError::VerificationFailed(format!(
                        "order {order_id} unreadable after cancel failure"
                    )));
                }

                self.lifecycle
                    .record(
                        LifecycleEvent::new(&ctx.market, LifecycleEventType::Cancelled, ctx.group)
                            .with_order(&order_id)
                            .with_side(ctx.side)
                            .with_strategy(ctx.strategy),
                    )
                    .await;

                if params.market_fallback {
                    debug!(market = %ctx.market, "falling back to market order");
                    let (qty, amount) = match ctx.side {
                        Side::Buy => (None, fallback_amount),
                        Side::Sell => (Some(quantity), None),
                    };
                    self.submit_and_finalize(ctx, OrderType::Market, None, qty, amount, signal)
                        .await
                } else {
                    let mut report =
                        ExecutionReport::no_fill(format!("no fill within {deadline:?}"));
                    report.order_id = Some(order_id);
                    report.rejection_reason = Some("NO_FILL".into());
                    Ok(report)
                }
            }
        }
    }

    async fn wait_for_fill(
        &self,
        order_id: &str,
        deadline: Duration,
    ) -> Result<WaitOutcome, ExecutionError> {
        let started = tokio::time::Instant::now();
        let mut poll = Duration::from_millis(POLL_START_MS);

        loop {
            match self.exchange.get_order(order_id).await {
                Ok(snapshot) => match snapshot.state {
                    OrderState::Done => return Ok(WaitOutcome::Done(snapshot)),
                    OrderState::Cancel => return Ok(WaitOutcome::Cancelled),
                    OrderState::Wait => {}
                },
                Err(ExchangeError::Transport(msg)) => {
                    self.breaker.record_api_error();
                    if started.elapsed() >= deadline {
                        return Err(ExecutionError::VerificationFailed(format!(
                            "order {order_id} status unreadable: {msg}"
                        )));
                    }
                }
                Err(ExchangeError::Rejected(msg)) => {
                    return Err(ExecutionError::VerificationFailed(msg))
                }
            }

            if started.elapsed() >= deadline {
                return Ok(WaitOutcome::StillWaiting);
            }
            tokio::time::sleep(poll.min(deadline.saturating_sub(started.elapsed()))).await;
            poll = (poll * 2).min(Duration::from_millis(POLL_CAP_MS));
        }
    }

    // -------------------------------------------------------------------------
    // Submit / finalize
    // -------------------------------------------------------------------------

    async fn submit_and_finalize(
        &self,
        ctx: &SubmitContext,
        order_type: OrderType,
        price: Option<Decimal>,
        quantity: Option<Decimal>,
        amount: Option<Decimal>,
        signal: &TradingSignal,
    ) -> Result<ExecutionReport, ExecutionError> {
        let order_id = self.submit(ctx, order_type, price, quantity, amount).await?;

        // Market orders settle immediately on most venues; give the status a
        // short verification window regardless.
        match self.wait_for_fill(&order_id, Duration::from_secs(5)).await? {
            WaitOutcome::Done(snapshot) => self.finalize(ctx, snapshot, order_type, signal).await,
            WaitOutcome::Cancelled => {
                self.lifecycle
                    .record(
                        LifecycleEvent::new(&ctx.market, LifecycleEventType::Cancelled, ctx.group)
                            .with_order(&order_id)
                            .with_side(ctx.side)
                            .with_strategy(ctx.strategy),
                    )
                    .await;
                Ok(ExecutionReport::no_fill(format!(
                    "market order {order_id} cancelled by the exchange"
                )))
            }
            WaitOutcome::StillWaiting => Err(ExecutionError::VerificationFailed(format!(
                "market order {order_id} did not settle in time"
            ))),
        }
    }

    async fn submit(
        &self,
        ctx: &SubmitContext,
        order_type: OrderType,
        price: Option<Decimal>,
        quantity: Option<Decimal>,
        amount: Option<Decimal>,
    ) -> Result<String, ExecutionError> {
        let request = OrderRequest {
            market: ctx.market.clone(),
            side: ctx.side,
            order_type,
            price,
            quantity,
            amount,
            client_token: Uuid::new_v4().to_string(),
        };

        debug!(
            market = %ctx.market,
            side = %ctx.side,
            order_type = %order_type,
            price = ?price,
            quantity = ?quantity,
            amount = ?amount,
            "submitting order"
        );

        match self.exchange.place_order(&request).await {
            Ok(order_id) => Ok(order_id),
            Err(ExchangeError::Transport(msg)) => {
                self.breaker.record_api_error();
                self.record_failed(ctx, None, &msg).await;
                Err(ExecutionError::Transport(msg))
            }
            Err(ExchangeError::Rejected(msg)) => {
                self.record_failed(ctx, None, &msg).await;
                Err(ExecutionError::OrderRejected(msg))
            }
        }
    }

    async fn finalize(
        &self,
        ctx: &SubmitContext,
        snapshot: OrderSnapshot,
        order_type: OrderType,
        signal: &TradingSignal,
    ) -> Result<ExecutionReport, ExecutionError> {
        let executed = snapshot.executed_volume;

        if executed <= Decimal::ZERO {
            self.breaker.record_exec_failure(&ctx.market);
            self.record_failed(ctx, Some(&snapshot.order_id), "zero fill").await;
            return Err(ExecutionError::ZeroFill(snapshot.order_id));
        }

        let avg_price = snapshot
            .effective_fill_price()
            .unwrap_or(ctx.mid_at_submit);

        // Adverse-positive slippage against the mid captured at submit time.
        let slippage_percent = if ctx.mid_at_submit > Decimal::ZERO {
            let raw = ((avg_price - ctx.mid_at_submit) / ctx.mid_at_submit
                * Decimal::ONE_HUNDRED)
                .to_f64()
                .unwrap_or(0.0);
            match ctx.side {
                Side::Buy => raw,
                Side::Sell => -raw,
            }
        } else {
            0.0
        };

        let fill_rate_percent = if ctx.target_quantity > Decimal::ZERO {
            (executed / ctx.target_quantity * Decimal::ONE_HUNDRED)
                .to_f64()
                .unwrap_or(0.0)
        } else {
            100.0
        };
        let is_partial_fill = fill_rate_percent < 99.999;

        self.breaker.record_exec_success(&ctx.market);
        self.breaker.record_slippage(&ctx.market, slippage_percent);

        let fill_type = match ctx.side {
            Side::Buy => LifecycleEventType::BuyFilled,
            Side::Sell => LifecycleEventType::SellFilled,
        };
        self.lifecycle
            .record(
                LifecycleEvent::new(&ctx.market, fill_type, ctx.group)
                    .with_order(&snapshot.order_id)
                    .with_side(ctx.side)
                    .with_strategy(ctx.strategy)
                    .with_fill(avg_price, executed),
            )
            .await;

        // Catch out-of-band transitions the moment after a success.
        self.lifecycle
            .reconcile_order(
                self.exchange.as_ref(),
                &snapshot.order_id,
                &ctx.market,
                ctx.side,
                ctx.group,
                ctx.strategy,
            )
            .await;

        let trade = TradeRecord {
            order_id: snapshot.order_id.clone(),
            market: ctx.market.clone(),
            side: ctx.side,
            order_type,
            price: avg_price,
            quantity: executed,
            total_amount: (avg_price * executed).round_dp(8),
            fee: snapshot.paid_fee,
            slippage_percent: Some(slippage_percent),
            is_partial_fill,
            pnl: None,
            pnl_percent: None,
            strategy: ctx.strategy,
            regime: None,
            confidence: signal.confidence,
            reason: signal.reason.clone(),
            simulated: false,
            created_at: chrono::Utc::now(),
        };

        let message = if !is_partial_fill {
            format!("filled {executed} @ {avg_price}")
        } else if fill_rate_percent >= PARTIAL_SUCCESS_PERCENT {
            format!("partial fill {fill_rate_percent:.0}% ({executed} @ {avg_price})")
        } else {
            format!("thin partial fill {fill_rate_percent:.0}% ({executed} @ {avg_price})")
        };

        info!(
            market = %ctx.market,
            side = %ctx.side,
            order_id = %snapshot.order_id,
            executed = %executed,
            avg_price = %avg_price,
            fill_rate = format!("{fill_rate_percent:.1}"),
            slippage = format!("{slippage_percent:.3}"),
            "order finalized"
        );

        Ok(ExecutionReport {
            success: true,
            order_id: Some(snapshot.order_id),
            price: Some(avg_price),
            executed_quantity: executed,
            requested_quantity: ctx.target_quantity,
            fee: snapshot.paid_fee,
            is_partial_fill,
            fill_rate_percent,
            slippage_percent,
            message,
            rejection_reason: None,
            trade: Some(trade),
        })
    }

    async fn record_failed(&self, ctx: &SubmitContext, order_id: Option<&str>, message: &str) {
        let mut event =
            LifecycleEvent::new(&ctx.market, LifecycleEventType::Failed, ctx.group)
                .with_side(ctx.side)
                .with_strategy(ctx.strategy)
                .with_message(message.to_string());
        if let Some(id) = order_id {
            event = event.with_order(id);
        }
        self.lifecycle.record(event).await;
    }

    /// Map a market-data transport failure. The market data service already
    /// recorded it into the shared API-error window.
    fn transport(&self, market: &str, err: ExchangeError) -> ExecutionError {
        match err {
            ExchangeError::Transport(msg) => {
                debug!(market, error = %msg, "transport failure");
                ExecutionError::Transport(msg)
            }
            ExchangeError::Rejected(msg) => ExecutionError::OrderRejected(msg),
        }
    }
}

enum WaitOutcome {
    Done(OrderSnapshot),
    Cancelled,
    StillWaiting,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config_store::{ConfigStore, KEY_TRADING_ENABLED};
    use crate::exchange::testkit::{MockExchange, PlaceBehavior};
    use crate::notify::testkit::RecordingNotifier;
    use crate::persistence::database::memory_pool;
    use crate::persistence::Repositories;
    use crate::risk::circuit_breaker::ApiErrorWindow;
    use crate::types::MarketClock;
    use rust_decimal_macros::dec;

    struct Harness {
        executor: OrderExecutor,
        exchange: Arc<MockExchange>,
        repos: Arc<Repositories>,
        config: Arc<ConfigStore>,
        breaker: Arc<CircuitBreaker>,
        lifecycle: Arc<LifecycleTracker>,
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
        // Keep wait loops fast under test.
        config
            .set("strategy.breakout.fill_timeout_secs", "1")
            .await
            .unwrap();
        config
            .set("strategy.grid.fill_timeout_secs", "1")
            .await
            .unwrap();

        let api_errors = Arc::new(ApiErrorWindow::new());
        let breaker = Arc::new(CircuitBreaker::new(api_errors.clone()));
        let exchange = Arc::new(MockExchange::new());
        exchange.set_ticker("BTC-USDT", dec!(100));
        exchange.set_deep_book("BTC-USDT", dec!(100));
        exchange.set_balance("USDT", dec!(1_000_000), dec!(0));
        exchange.set_balance("BTC", dec!(0), dec!(0));

        let market_data = Arc::new(MarketDataService::new(exchange.clone(), api_errors));
        let clock = MarketClock::from_offset_hours(9);
        let lifecycle = Arc::new(LifecycleTracker::new(repos.clone(), clock));
        let notifier = Arc::new(RecordingNotifier::default());
        let gate = Arc::new(RiskGate::new(
            config.clone(),
            breaker.clone(),
            repos.clone(),
            market_data.clone(),
            notifier,
            clock,
        ));

        let executor = OrderExecutor::new(
            exchange.clone(),
            market_data,
            gate,
            breaker.clone(),
            lifecycle.clone(),
            config.clone(),
        );

        Harness {
            executor,
            exchange,
            repos,
            config,
            breaker,
            lifecycle,
        }
    }

    fn buy_signal(confidence: f64) -> TradingSignal {
        TradingSignal {
            market: "BTC-USDT".into(),
            action: SignalAction::Buy,
            confidence,
            price: dec!(100),
            reason: "test entry".into(),
            strategy: StrategyCode::Breakout,
        }
    }

    #[tokio::test]
    async fn limit_buy_fills_and_reports() {
        let h = harness().await;
        let report = h
            .executor
            .execute_entry(&buy_signal(60.0), dec!(10_000))
            .await
            .unwrap();

        assert!(report.success);
        assert!(!report.is_partial_fill);
        assert!((report.fill_rate_percent - 100.0).abs() < 0.01);
        assert!(report.order_id.is_some());

        let trade = report.trade.as_ref().unwrap();
        // total_amount == price * quantity within rounding.
        assert_eq!(trade.total_amount, (trade.price * trade.quantity).round_dp(8));
        assert!(trade.fee >= Decimal::ZERO);

        // Placed as a limit at the best ask.
        let placed = h.exchange.placed.read();
        assert_eq!(placed.len(), 1);
        assert_eq!(placed[0].order_type, OrderType::Limit);
        assert_eq!(placed[0].price, Some(dec!(100.1)));
    }

    #[tokio::test]
    async fn partial_fill_ninety_three_percent() {
        let h = harness().await;
        h.exchange.script(PlaceBehavior::FillPartial(dec!(0.93)));

        let report = h
            .executor
            .execute_entry(&buy_signal(60.0), dec!(10_000))
            .await
            .unwrap();

        assert!(report.success);
        assert!(report.is_partial_fill);
        assert!((report.fill_rate_percent - 93.0).abs() < 0.01);

        let trade = report.trade.unwrap();
        assert!(trade.is_partial_fill);
        // Executed 93% of the requested quantity.
        let requested = h.exchange.placed.read()[0].quantity.unwrap();
        assert_eq!(trade.quantity, (requested * dec!(0.93)));
    }

    #[tokio::test]
    async fn veto_surfaces_without_touching_the_exchange() {
        let h = harness().await;
        h.config.set(KEY_TRADING_ENABLED, "false").await.unwrap();

        let err = h
            .executor
            .execute_entry(&buy_signal(60.0), dec!(10_000))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::RiskVeto(_)));
        assert_eq!(h.exchange.placed_count(), 0);
    }

    #[tokio::test]
    async fn breaker_veto_maps_to_circuit_breaker_open() {
        let h = harness().await;
        for _ in 0..3 {
            h.breaker.record_loss("BTC-USDT");
        }
        let err = h
            .executor
            .execute_entry(&buy_signal(60.0), dec!(10_000))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::CircuitBreakerOpen(_)));
    }

    #[tokio::test]
    async fn transport_failure_counts_api_error_and_fails_typed() {
        let h = harness().await;
        h.exchange
            .script(PlaceBehavior::TransportFail("socket reset".into()));

        let err = h
            .executor
            .execute_entry(&buy_signal(60.0), dec!(10_000))
            .await
            .unwrap_err();
        assert!(err.is_transport());
        assert_eq!(h.breaker.api_errors().count_last_minute(), 1);
    }

    #[tokio::test]
    async fn rejection_is_not_retryable() {
        let h = harness().await;
        h.exchange
            .script(PlaceBehavior::Reject("insufficient balance".into()));

        let err = h
            .executor
            .execute_entry(&buy_signal(60.0), dec!(10_000))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::OrderRejected(_)));
        assert!(!err.is_transport());
    }

    #[tokio::test]
    async fn stale_limit_without_fallback_reports_no_fill() {
        let h = harness().await;
        h.config
            .set("strategy.breakout.market_fallback", "false")
            .await
            .unwrap();
        h.exchange.script(PlaceBehavior::StayOpen);

        let report = h
            .executor
            .execute_entry(&buy_signal(60.0), dec!(10_000))
            .await
            .unwrap();
        assert!(!report.success);
        assert_eq!(report.rejection_reason.as_deref(), Some("NO_FILL"));
        // Only the original limit was placed.
        assert_eq!(h.exchange.placed_count(), 1);
    }

    #[tokio::test]
    async fn stale_limit_with_fallback_goes_to_market() {
        let h = harness().await;
        h.exchange.script(PlaceBehavior::StayOpen);
        // Second submit (the fallback) fills.
        h.exchange.script(PlaceBehavior::FillAll);

        let report = h
            .executor
            .execute_entry(&buy_signal(60.0), dec!(10_000))
            .await
            .unwrap();
        assert!(report.success);

        let placed = h.exchange.placed.read();
        assert_eq!(placed.len(), 2);
        assert_eq!(placed[0].order_type, OrderType::Limit);
        assert_eq!(placed[1].order_type, OrderType::Market);
    }

    #[tokio::test]
    async fn zero_fill_records_exec_failure() {
        let h = harness().await;
        h.exchange.script(PlaceBehavior::FillPartial(dec!(0)));

        let err = h
            .executor
            .execute_entry(&buy_signal(60.0), dec!(10_000))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::ZeroFill(_)));
    }

    #[tokio::test]
    async fn high_confidence_plus_thin_book_forces_market() {
        use crate::exchange::{Orderbook, OrderbookLevel};
        let h = harness().await;
        // Thin but tight book: spread fine, depth under 5x quantity but over
        // the 3x the risk gate wants (quantity is 100 at amount 10 000).
        h.exchange.set_book(
            "BTC-USDT",
            Orderbook {
                market: "BTC-USDT".into(),
                bids: vec![OrderbookLevel { price: dec!(99.9), quantity: dec!(400) }],
                asks: vec![OrderbookLevel { price: dec!(100.1), quantity: dec!(400) }],
            },
        );

        let report = h
            .executor
            .execute_entry(&buy_signal(90.0), dec!(10_000))
            .await
            .unwrap();
        assert!(report.success);
        let placed = h.exchange.placed.read();
        assert_eq!(placed[0].order_type, OrderType::Market);
    }

    #[tokio::test]
    async fn fill_events_are_idempotent_under_concurrent_reconcile() {
        let h = harness().await;
        let report = h
            .executor
            .execute_entry(&buy_signal(60.0), dec!(10_000))
            .await
            .unwrap();
        let order_id = report.order_id.unwrap();

        // Two concurrent reconciliation passes on the same order.
        let (a, b) = tokio::join!(
            h.lifecycle.reconcile_order(
                h.exchange.as_ref() as &dyn ExchangeApi,
                &order_id,
                "BTC-USDT",
                Side::Buy,
                StrategyGroup::CoreEngine,
                StrategyCode::Breakout,
            ),
            h.lifecycle.reconcile_order(
                h.exchange.as_ref() as &dyn ExchangeApi,
                &order_id,
                "BTC-USDT",
                Side::Buy,
                StrategyGroup::CoreEngine,
                StrategyCode::Breakout,
            ),
        );
        let _ = (a, b);

        let events = h
            .repos
            .lifecycle
            .events_between(chrono::Utc::now() - chrono::Duration::minutes(5), chrono::Utc::now())
            .await
            .unwrap();
        let fills = events
            .iter()
            .filter(|e| {
                e.event_type == LifecycleEventType::BuyFilled
                    && e.order_id.as_deref() == Some(order_id.as_str())
            })
            .count();
        assert_eq!(fills, 1);
    }

    #[tokio::test]
    async fn close_sells_at_best_bid() {
        use crate::position::{Position, PositionOpen};
        let h = harness().await;
        let position = Position::open(PositionOpen {
            strategy: StrategyCode::Grid,
            market: "BTC-USDT".into(),
            side: Side::Buy,
            entry_price: dec!(98),
            filled_quantity: dec!(1),
            target_quantity: dec!(1),
            stop_loss_percent: -2.0,
            take_profit_percent: 3.0,
            timeout_at: chrono::Utc::now() + chrono::Duration::hours(6),
        });

        let report = h
            .executor
            .execute_close(&position, dec!(1), "TAKE_PROFIT")
            .await
            .unwrap();
        assert!(report.success);

        let placed = h.exchange.placed.read();
        assert_eq!(placed[0].side, Side::Sell);
        assert_eq!(placed[0].price, Some(dec!(99.9)));
        assert_eq!(placed[0].quantity, Some(dec!(1)));
    }
}
