// =============================================================================
// Position monitor — per-strategy-family exit loops and the close path
// =============================================================================
//
// One loop per strategy family at its natural cadence (1 s scalping, 30 s
// intraday, 5 m accumulation). Each tick re-reads open positions from the
// repository (the single source of truth) and applies, in order: data guards,
// minimum holding, stop-loss / take-profit, trailing stop, timeout.
//
// Closes run under a per-market mutex separate from the entry path. Every
// attempt re-reads position state, checks the backoff/attempt budget, reads
// the actual exchange balance, and only then transitions to CLOSING and
// submits the SELL. Transport failures revert to OPEN for a later retry;
// exhausting the attempt budget abandons the position as FAILED.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config_store::{ConfigStore, KEY_MIN_HOLDING_SECS, KEY_MIN_ORDER_AMOUNT};
use crate::error::ExecutionError;
use crate::execution::executor::OrderExecutor;
use crate::execution::MarketLocks;
use crate::market_data::MarketDataService;
use crate::notify::Notifier;
use crate::persistence::Repositories;
use crate::position::{CloseGate, ExitReason, Position, PositionStatus};
use crate::risk::circuit_breaker::CircuitBreaker;
use crate::strategy::{Strategy, StrategyParams};
use crate::types::{base_currency, StrategyCode};

const DEFAULT_MIN_HOLDING_SECS: i64 = 300;
const DEFAULT_CLOSE_BACKOFF_SECS: i64 = 15;
const DEFAULT_MAX_CLOSE_ATTEMPTS: i64 = 5;
const DEFAULT_MIN_ORDER_AMOUNT: f64 = 5_000.0;

/// Which strategies a monitor loop owns, and how often it wakes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorFamily {
    Scalping,
    Intraday,
    Accumulation,
}

impl MonitorFamily {
    pub fn codes(self) -> &'static [StrategyCode] {
        match self {
            Self::Scalping => &[StrategyCode::VolatilitySurvival],
            Self::Intraday => &[StrategyCode::Breakout, StrategyCode::Grid],
            Self::Accumulation => &[StrategyCode::Dca],
        }
    }

    pub fn interval(self) -> Duration {
        match self {
            Self::Scalping => Duration::from_secs(1),
            Self::Intraday => Duration::from_secs(30),
            Self::Accumulation => Duration::from_secs(300),
        }
    }

    pub fn all() -> [MonitorFamily; 3] {
        [Self::Scalping, Self::Intraday, Self::Accumulation]
    }
}

impl std::fmt::Display for MonitorFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Scalping => write!(f, "scalping"),
            Self::Intraday => write!(f, "intraday"),
            Self::Accumulation => write!(f, "accumulation"),
        }
    }
}

pub struct PositionMonitor {
    repos: Arc<Repositories>,
    market_data: Arc<MarketDataService>,
    executor: Arc<OrderExecutor>,
    breaker: Arc<CircuitBreaker>,
    config: Arc<ConfigStore>,
    notifier: Arc<dyn Notifier>,
    /// Engine hooks for fills (grid rung release, DCA clock).
    engines: std::collections::HashMap<StrategyCode, Arc<dyn Strategy>>,
    close_locks: MarketLocks,
}

impl PositionMonitor {
    pub fn new(
        repos: Arc<Repositories>,
        market_data: Arc<MarketDataService>,
        executor: Arc<OrderExecutor>,
        breaker: Arc<CircuitBreaker>,
        config: Arc<ConfigStore>,
        notifier: Arc<dyn Notifier>,
        engines: std::collections::HashMap<StrategyCode, Arc<dyn Strategy>>,
    ) -> Self {
        Self {
            repos,
            market_data,
            executor,
            breaker,
            config,
            notifier,
            engines,
            close_locks: MarketLocks::new(),
        }
    }

    /// Run one family's monitor loop until the stop signal flips.
    pub async fn run(self: Arc<Self>, family: MonitorFamily, mut stop: watch::Receiver<bool>) {
        info!(family = %family, interval = ?family.interval(), "position monitor started");
        let mut ticker = tokio::time::interval(family.interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick(family).await;
                }
                _ = stop.changed() => {
                    if *stop.borrow() {
                        info!(family = %family, "position monitor stopping");
                        return;
                    }
                }
            }
        }
    }

    /// One monitoring pass over the family's open positions. Each position is
    /// its own failure domain.
    pub async fn tick(&self, family: MonitorFamily) {
        let positions = match self.repos.positions.find_open_by_strategies(family.codes()).await {
            Ok(p) => p,
            Err(e) => {
                warn!(family = %family, error = %e, "open-position query failed");
                return;
            }
        };

        for position in positions {
            let id = position.id.clone();
            if let Err(e) = self.evaluate(&id).await {
                warn!(position_id = %id, error = %e, "position evaluation failed");
            }
        }
    }

    // -------------------------------------------------------------------------
    // Exit decision
    // -------------------------------------------------------------------------

    /// Re-read one position and apply the exit checks.
    pub async fn evaluate(&self, position_id: &str) -> anyhow::Result<()> {
        let Some(position) = self.repos.positions.find_by_id(position_id).await? else {
            return Ok(());
        };
        if position.status.is_terminal() {
            return Ok(());
        }

        // 1. Data guards.
        if position.entry_price <= Decimal::ZERO || position.filled_quantity <= Decimal::ZERO {
            self.mark_failed(position, ExitReason::InvalidPosition).await;
            return Ok(());
        }

        let price = match self.market_data.last_price(&position.market).await {
            Ok(p) => p,
            Err(e) => {
                debug!(market = %position.market, error = %e, "price unavailable, skipping tick");
                return Ok(());
            }
        };
        if price <= Decimal::ZERO {
            return Ok(());
        }

        // 2. Minimum holding.
        let min_holding = self
            .config
            .get_i64(KEY_MIN_HOLDING_SECS, DEFAULT_MIN_HOLDING_SECS);
        if position.holding_seconds(Utc::now()) < min_holding {
            return Ok(());
        }

        let params = StrategyParams::load(&self.config, position.strategy);
        let pnl = position.pnl_percent(price);

        // 3. Stop-loss / take-profit.
        if pnl <= position.stop_loss_percent {
            self.execute_close(&position.id, ExitReason::StopLoss).await;
            return Ok(());
        }
        if pnl >= position.take_profit_percent {
            self.execute_close(&position.id, ExitReason::TakeProfit).await;
            return Ok(());
        }

        // 4. Trailing stop.
        if let Some(close) = self.update_trailing(&position, price, pnl, &params).await? {
            self.execute_close(&position.id, close).await;
            return Ok(());
        }

        // 5. Timeout.
        if Utc::now() > position.timeout_at {
            self.execute_close(&position.id, ExitReason::Timeout).await;
        }
        Ok(())
    }

    /// Arm and ratchet the trailing stop; returns the exit reason once the
    /// retrace trigger fires.
    async fn update_trailing(
        &self,
        position: &Position,
        price: Decimal,
        pnl: f64,
        params: &StrategyParams,
    ) -> anyhow::Result<Option<ExitReason>> {
        let mut position = position.clone();

        if !position.trailing_active {
            if pnl >= params.trailing_trigger_percent {
                position.trailing_active = true;
                position.trailing_peak_price = Some(price);
                self.repos.positions.update(&position).await?;
                debug!(position_id = %position.id, peak = %price, "trailing stop armed");
            }
            return Ok(None);
        }

        let peak = position.trailing_peak_price.unwrap_or(price);
        let favorable = match position.side {
            crate::types::Side::Buy => price > peak,
            crate::types::Side::Sell => price < peak,
        };
        if favorable {
            position.trailing_peak_price = Some(price);
            self.repos.positions.update(&position).await?;
            return Ok(None);
        }

        // Retrace from the running peak, in the adverse direction.
        use rust_decimal::prelude::ToPrimitive;
        if peak <= Decimal::ZERO {
            return Ok(None);
        }
        let retrace = ((peak - price) / peak * Decimal::ONE_HUNDRED)
            .to_f64()
            .unwrap_or(0.0)
            * position.side.direction();
        if retrace >= params.trailing_offset_percent {
            return Ok(Some(ExitReason::TrailingStop));
        }
        Ok(None)
    }

    // -------------------------------------------------------------------------
    // Close path
    // -------------------------------------------------------------------------

    /// Attempt to close a position. One close operation per market at a time.
    pub async fn execute_close(&self, position_id: &str, reason: ExitReason) {
        // Resolve the market first so the lock can be taken without holding
        // any state borrow across the await.
        let market = match self.repos.positions.find_by_id(position_id).await {
            Ok(Some(p)) => p.market,
            _ => return,
        };
        let lock = self.close_locks.for_market(&market);
        let _guard = lock.lock().await;

        if let Err(e) = self.close_locked(position_id, reason).await {
            warn!(position_id, error = %e, "close attempt errored");
        }
    }

    async fn close_locked(&self, position_id: &str, reason: ExitReason) -> anyhow::Result<()> {
        // Re-read under the lock; another path may have finished the close.
        let Some(mut position) = self.repos.positions.find_by_id(position_id).await? else {
            return Ok(());
        };
        if position.status.is_terminal() {
            return Ok(());
        }

        let now = Utc::now();
        let backoff = self
            .config
            .get_i64("position.close_backoff_secs", DEFAULT_CLOSE_BACKOFF_SECS);
        let max_attempts = self
            .config
            .get_i64("position.max_close_attempts", DEFAULT_MAX_CLOSE_ATTEMPTS)
            .max(1) as u32;

        match position.close_gate(now, backoff, max_attempts) {
            CloseGate::Backoff => {
                debug!(position_id = %position.id, "close attempt inside backoff window");
                return Ok(());
            }
            CloseGate::Exhausted => {
                self.mark_failed(position, ExitReason::MaxAttempts).await;
                return Ok(());
            }
            CloseGate::Proceed => {}
        }

        // Ground truth: what does the exchange actually hold?
        let base = base_currency(&position.market);
        let balance = match self.market_data.balance(&base).await {
            Ok(b) => b,
            Err(e) => {
                debug!(position_id = %position.id, error = %e, "balance read failed, retry later");
                return Ok(());
            }
        };

        if balance.available <= Decimal::ZERO && balance.locked <= Decimal::ZERO {
            // Coin is already gone (sold out-of-band or dusted away).
            let price = self
                .market_data
                .last_price(&position.market)
                .await
                .unwrap_or(position.entry_price);
            info!(position_id = %position.id, "no coin remains, closing as already gone");
            position.status = PositionStatus::Closing;
            position.finalize_exit(PositionStatus::Closed, ExitReason::AlreadyGone, Some(price), None);
            self.repos.positions.update(&position).await?;
            return Ok(());
        }
        if balance.available <= Decimal::ZERO && balance.locked > Decimal::ZERO {
            // A resting order holds the coin; let it settle and retry later.
            debug!(position_id = %position.id, "coin locked by a pending order, retry later");
            return Ok(());
        }

        let quantity = balance.available.min(position.filled_quantity);
        let price = match self.market_data.last_price(&position.market).await {
            Ok(p) => p,
            Err(_) => position.entry_price,
        };
        let min_amount = Decimal::from_f64(
            self.config
                .get_f64(KEY_MIN_ORDER_AMOUNT, DEFAULT_MIN_ORDER_AMOUNT),
        )
        .unwrap_or(Decimal::ZERO);
        if quantity * price < min_amount {
            self.mark_failed(position, ExitReason::MinAmount).await;
            return Ok(());
        }

        // Commit to the attempt: CLOSING, bump the budget, persist, submit.
        position.status = PositionStatus::Closing;
        position.close_attempt_count += 1;
        position.last_close_attempt_at = Some(now);
        position.exit_reason = Some(reason);
        self.repos.positions.update(&position).await?;

        let attempt = position.close_attempt_count;
        match self
            .executor
            .execute_close(&position, quantity, &reason.to_string())
            .await
        {
            Ok(report) if report.success && report.executed_quantity > Decimal::ZERO => {
                self.finalize_close(position, report, reason).await?;
            }
            Ok(_report) => {
                // Cancelled / no-fill: back to OPEN for the next tick.
                self.revert_to_open(position).await?;
            }
            Err(ExecutionError::OrderRejected(msg)) => {
                let permanent = {
                    let lower = msg.to_lowercase();
                    lower.contains("insufficient") || lower.contains("minimum")
                };
                if permanent {
                    warn!(position_id = %position.id, msg = %msg, "close rejected permanently");
                    self.mark_failed(position, ExitReason::MinAmount).await;
                } else if attempt >= max_attempts {
                    self.mark_failed(position, ExitReason::MaxAttempts).await;
                } else {
                    warn!(
                        position_id = %position.id,
                        attempt,
                        msg = %msg,
                        "close rejected, will retry after backoff"
                    );
                    self.revert_to_open(position).await?;
                }
            }
            Err(ExecutionError::ZeroFill(_)) => {
                // "done but zero volume": trust the balance, not the order.
                let remaining = self
                    .market_data
                    .balance(&base)
                    .await
                    .map(|b| b.available + b.locked)
                    .unwrap_or(Decimal::ZERO);
                if remaining > Decimal::ZERO {
                    self.revert_to_open(position).await?;
                } else {
                    let exit_price = self
                        .market_data
                        .last_price(&position.market)
                        .await
                        .unwrap_or(position.entry_price);
                    position.finalize_exit(
                        PositionStatus::Closed,
                        ExitReason::AlreadyGone,
                        Some(exit_price),
                        None,
                    );
                    self.repos.positions.update(&position).await?;
                }
            }
            Err(ExecutionError::VerificationFailed(msg)) => {
                // Leave CLOSING; the next monitor tick reconciles.
                warn!(position_id = %position.id, msg = %msg, "close unverifiable, leaving CLOSING");
            }
            Err(e) => {
                // Transport and veto failures: retry after backoff.
                debug!(position_id = %position.id, error = %e, "close attempt failed, reverting");
                self.revert_to_open(position).await?;
            }
        }
        Ok(())
    }

    async fn finalize_close(
        &self,
        mut position: Position,
        report: crate::execution::ExecutionReport,
        reason: ExitReason,
    ) -> anyhow::Result<()> {
        let exit_price = report.price.unwrap_or(position.entry_price);
        let quantity = report.executed_quantity;
        let direction =
            Decimal::from_f64(position.side.direction()).unwrap_or(Decimal::ONE);
        let realized_pnl =
            ((exit_price - position.entry_price) * quantity * direction) - report.fee;

        position.exit_order_id = report.order_id.clone();
        position.finalize_exit(
            PositionStatus::Closed,
            reason,
            Some(exit_price),
            Some(realized_pnl),
        );

        // Exit trade carries the realized PnL; written atomically with the
        // position update.
        let trade = match report.trade {
            Some(mut trade) => {
                trade.pnl = Some(realized_pnl);
                trade.pnl_percent = position.realized_pnl_percent;
                trade.reason = reason.to_string();
                Some(trade)
            }
            None => None,
        };

        match trade {
            Some(trade) => self.repos.record_exit(&position, &trade).await?,
            None => self.repos.positions.update(&position).await?,
        }

        if realized_pnl < Decimal::ZERO {
            self.breaker.record_loss(&position.market);
        } else {
            self.breaker.record_win(&position.market);
        }

        if let Some(engine) = self.engines.get(&position.strategy) {
            engine
                .on_order_filled(&position.market, crate::types::Side::Sell, exit_price)
                .await;
        }

        info!(
            position_id = %position.id,
            market = %position.market,
            reason = %reason,
            exit_price = %exit_price,
            realized_pnl = %realized_pnl,
            attempts = position.close_attempt_count,
            "position closed"
        );
        Ok(())
    }

    async fn revert_to_open(&self, mut position: Position) -> anyhow::Result<()> {
        if position.can_transition(PositionStatus::Open) {
            position.status = PositionStatus::Open;
            self.repos.positions.update(&position).await?;
        }
        Ok(())
    }

    /// Terminal failure: persist, and tell the operator once per position.
    async fn mark_failed(&self, mut position: Position, reason: ExitReason) {
        position.status = PositionStatus::Failed;
        position.exit_reason = Some(reason);
        position.exit_time = Some(Utc::now());
        if let Err(e) = self.repos.positions.update(&position).await {
            error!(position_id = %position.id, error = %e, "failed-state persist failed");
            return;
        }
        warn!(
            position_id = %position.id,
            market = %position.market,
            reason = %reason,
            attempts = position.close_attempt_count,
            "position marked FAILED"
        );
        self.notifier
            .send_error(
                &position.market,
                &format!("position {} failed: {reason}", position.id),
            )
            .await;
    }
}

// =============================================================================
// Tests
// =============================================================================
