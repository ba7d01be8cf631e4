// =============================================================================
// Central application state — Meridian trading engine
// =============================================================================
//
// Ties every subsystem together and hosts the per-tick analysis pipeline:
// market data -> regime detector -> strategy selector -> engine -> signal,
// and the entry/exit dispatch for non-hold signals. The HTTP API reads its
// snapshots from here.
//
// Thread safety follows the house pattern: Arc handles to subsystems that
// manage their own interior mutability, parking_lot::RwLock for the shared
// per-market maps.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use parking_lot::RwLock;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config_store::{ConfigStore, KEY_ORDER_AMOUNT, KEY_REGIME_DETECTOR, KEY_TRADING_ENABLED};
use crate::error::ExecutionError;
use crate::exchange::ExchangeApi;
use crate::execution::executor::OrderExecutor;
use crate::lifecycle::{LifecycleRollup, LifecycleTracker};
use crate::market_data::MarketDataService;
use crate::notify::Notifier;
use crate::persistence::Repositories;
use crate::position::manager::PositionMonitor;
use crate::position::{ExitReason, Position, PositionOpen};
use crate::regime::{detect, DetectorKind, RegimeAnalysis};
use crate::risk::circuit_breaker::CircuitBreaker;
use crate::risk::gate::RiskGate;
use crate::strategy::{
    selector::StrategySelector, SignalAction, Strategy, StrategyContext, StrategyParams,
    TradingSignal,
};
use crate::types::{quote_currency, MarketClock, Side, StrategyCode};

const DEFAULT_ORDER_AMOUNT: f64 = 100_000.0;
/// Candles required before an engine is consulted.
const MIN_ANALYSIS_CANDLES: usize = 30;

pub struct AppState {
    pub markets: Vec<String>,
    pub clock: MarketClock,
    pub config: Arc<ConfigStore>,
    pub repos: Arc<Repositories>,
    pub exchange: Arc<dyn ExchangeApi>,
    pub market_data: Arc<MarketDataService>,
    pub breaker: Arc<CircuitBreaker>,
    pub gate: Arc<RiskGate>,
    pub executor: Arc<OrderExecutor>,
    pub monitor: Arc<PositionMonitor>,
    pub lifecycle: Arc<LifecycleTracker>,
    pub notifier: Arc<dyn Notifier>,
    pub selector: Arc<StrategySelector>,
    pub engines: HashMap<StrategyCode, Arc<dyn Strategy>>,

    pub regimes: RwLock<HashMap<String, RegimeAnalysis>>,
    pub last_signals: RwLock<HashMap<String, TradingSignal>>,
    pub start_time: Instant,
}

impl AppState {
    // -------------------------------------------------------------------------
    // Analysis pipeline
    // -------------------------------------------------------------------------

    /// One full analysis pass for a market: refresh candles, classify the
    /// regime, pick the engine, produce a signal. Shared by the strategy tick
    /// loop and the manual `/analyze` endpoint.
    pub async fn analyze_market(&self, market: &str) -> Result<TradingSignal> {
        let market = crate::types::normalize_market(market);

        let candles = self
            .market_data
            .refresh_candles(&market)
            .await
            .with_context(|| format!("candle refresh failed for {market}"))?;

        let current_price = self
            .market_data
            .last_price(&market)
            .await
            .with_context(|| format!("ticker unavailable for {market}"))?;

        // Detector choice is re-read from config on every tick.
        let kind = DetectorKind::parse(&self.config.get(KEY_REGIME_DETECTOR, "simple"));
        let analysis = detect(&candles, kind);
        self.regimes.write().insert(market.clone(), analysis.clone());

        if candles.len() < MIN_ANALYSIS_CANDLES {
            let code = self.selector.active(&market).unwrap_or(StrategyCode::Grid);
            let signal = TradingSignal::hold(&market, code, current_price, "warming up");
            self.last_signals.write().insert(market, signal.clone());
            return Ok(signal);
        }

        let code = self.selector.select(&market, &analysis);
        let engine = self
            .engines
            .get(&code)
            .context("selected engine is not registered")?;

        let ctx = StrategyContext {
            market: &market,
            candles: &candles,
            current_price,
            regime: &analysis,
        };
        let signal = engine.analyze(&ctx);
        engine.persist_state(&market).await;

        debug!(
            market = %market,
            regime = %analysis.regime,
            strategy = %code,
            action = %signal.action,
            confidence = signal.confidence,
            "market analyzed"
        );

        self.last_signals.write().insert(market, signal.clone());
        Ok(signal)
    }

    /// Act on a non-hold signal. BUYs go through the entry path; SELLs close
    /// the engine's open position on that market, if any.
    pub async fn dispatch_signal(&self, signal: &TradingSignal) {
        match signal.action {
            SignalAction::Hold => {}
            SignalAction::Buy => self.dispatch_entry(signal).await,
            SignalAction::Sell => self.dispatch_exit(signal).await,
        }
    }

    async fn dispatch_entry(&self, signal: &TradingSignal) {
        let amount = Decimal::from_f64(self.config.get_f64(KEY_ORDER_AMOUNT, DEFAULT_ORDER_AMOUNT))
            .unwrap_or(Decimal::ZERO);
        if amount <= Decimal::ZERO {
            warn!(market = %signal.market, "order amount not configured, entry skipped");
            return;
        }

        let report = match self.executor.execute_entry(signal, amount).await {
            Ok(report) => report,
            Err(ExecutionError::RiskVeto(reason)) => {
                debug!(market = %signal.market, reason = %reason, "entry vetoed");
                return;
            }
            Err(e) => {
                warn!(market = %signal.market, error = %e, "entry execution failed");
                return;
            }
        };

        if !report.success {
            info!(market = %signal.market, message = %report.message, "entry did not fill");
            return;
        }

        let Some(trade) = report.trade.clone() else {
            warn!(market = %signal.market, "fill report carried no trade record");
            return;
        };

        let params = StrategyParams::load(&self.config, signal.strategy);
        let position = Position::open(PositionOpen {
            strategy: signal.strategy,
            market: signal.market.clone(),
            side: Side::Buy,
            entry_price: trade.price,
            filled_quantity: report.executed_quantity,
            target_quantity: report.requested_quantity.max(report.executed_quantity),
            stop_loss_percent: params.stop_loss_percent,
            take_profit_percent: params.take_profit_percent,
            timeout_at: Utc::now() + Duration::seconds(params.max_holding_secs),
        });

        if let Err(e) = self.repos.record_entry(&position, &trade).await {
            warn!(market = %signal.market, error = %e, "entry persistence failed");
            return;
        }
        self.gate.invalidate_market(&signal.market);

        if let Some(engine) = self.engines.get(&signal.strategy) {
            engine
                .on_order_filled(&signal.market, Side::Buy, trade.price)
                .await;
        }

        self.notifier.send_trade(signal, &report).await;
        info!(
            market = %signal.market,
            position_id = %position.id,
            strategy = %signal.strategy,
            filled = %report.executed_quantity,
            "position opened"
        );
    }

    async fn dispatch_exit(&self, signal: &TradingSignal) {
        let open = match self.repos.positions.find_open().await {
            Ok(open) => open,
            Err(e) => {
                warn!(error = %e, "open-position query failed");
                return;
            }
        };
        let target = open
            .into_iter()
            .find(|p| p.market == signal.market && p.strategy == signal.strategy);

        match target {
            Some(position) => {
                // The monitor's close path fires the engine fill hook once
                // the SELL actually executes.
                self.monitor
                    .execute_close(&position.id, ExitReason::SignalExit)
                    .await;
            }
            None => {
                debug!(
                    market = %signal.market,
                    strategy = %signal.strategy,
                    "sell signal with no matching position, ignored"
                );
            }
        }
    }

    // -------------------------------------------------------------------------
    // Account valuation
    // -------------------------------------------------------------------------

    /// Total asset value: quote balance plus open positions marked at the
    /// last trade price. Feeds the drawdown circuit breaker.
    pub async fn total_asset_value(&self) -> Result<Decimal> {
        let quote = self
            .markets
            .first()
            .map(|m| quote_currency(m))
            .unwrap_or_else(|| "USDT".to_string());
        let balance = self.market_data.balance(&quote).await?;
        let mut total = balance.available + balance.locked;

        for position in self.repos.positions.find_open().await? {
            let price = self
                .market_data
                .last_price(&position.market)
                .await
                .unwrap_or(position.entry_price);
            total += position.filled_quantity * price;
        }
        Ok(total)
    }

    // -------------------------------------------------------------------------
    // Snapshots for the HTTP API
    // -------------------------------------------------------------------------

    pub async fn status_snapshot(&self) -> StatusSnapshot {
        let open_positions = self.repos.positions.find_open().await.unwrap_or_default();
        let regimes = self.regimes.read().clone();
        let signals = self.last_signals.read().clone();

        let markets = self
            .markets
            .iter()
            .map(|market| {
                let open = open_positions
                    .iter()
                    .filter(|p| &p.market == market)
                    .cloned()
                    .collect::<Vec<_>>();
                MarketStatus {
                    market: market.clone(),
                    regime: regimes.get(market).cloned(),
                    strategy: self.selector.active(market).map(|c| c.to_string()),
                    last_signal: signals.get(market).cloned(),
                    open_positions: open,
                }
            })
            .collect();

        let daily_pnl = self
            .repos
            .trades
            .realized_pnl_since(self.clock.local_midnight_utc())
            .await
            .ok()
            .and_then(|d| d.to_f64());

        StatusSnapshot {
            trading_enabled: self.config.get_bool(KEY_TRADING_ENABLED, false),
            uptime_secs: self.start_time.elapsed().as_secs(),
            server_time: Utc::now().timestamp_millis(),
            daily_realized_pnl: daily_pnl,
            markets,
            lifecycle: self.lifecycle.cached_rollup(),
        }
    }
}

/// Per-market section of the status payload.
#[derive(Debug, Clone, Serialize)]
pub struct MarketStatus {
    pub market: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub regime: Option<RegimeAnalysis>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_signal: Option<TradingSignal>,
    pub open_positions: Vec<Position>,
}

/// Full engine status payload.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub trading_enabled: bool,
    pub uptime_secs: u64,
    pub server_time: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub daily_realized_pnl: Option<f64>,
    pub markets: Vec<MarketStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lifecycle: Option<LifecycleRollup>,
}
