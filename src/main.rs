// =============================================================================
// Meridian Spot Engine — main entry point
// =============================================================================
//
// The engine boots with trading disabled. An operator must enable it through
// the API (or the configuration store) after verifying the environment.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod config_store;
mod error;
mod exchange;
mod execution;
mod indicators;
mod lifecycle;
mod market_data;
mod notify;
mod optimizer;
mod persistence;
mod position;
mod regime;
mod risk;
mod strategy;
mod types;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::config_store::{ConfigStore, KEY_TRADING_ENABLED};
use crate::exchange::client::RestExchangeClient;
use crate::exchange::ExchangeApi;
use crate::execution::executor::OrderExecutor;
use crate::lifecycle::LifecycleTracker;
use crate::market_data::MarketDataService;
use crate::notify::{Notifier, WebhookNotifier};
use crate::optimizer::{Optimizer, ReasoningServiceOracle};
use crate::persistence::{database, Repositories};
use crate::position::manager::{MonitorFamily, PositionMonitor};
use crate::risk::circuit_breaker::{ApiErrorWindow, CircuitBreaker};
use crate::risk::gate::RiskGate;
use crate::risk::suspension::RegimeSuspensionWatcher;
use crate::strategy::{
    breakout::BreakoutStrategy, dca::DcaStrategy, grid::GridStrategy,
    selector::StrategySelector, volatility::VolatilitySurvivalStrategy, Strategy,
};
use crate::types::{normalize_market, MarketClock, StrategyCode};

/// Cadence of the per-market strategy tick.
const STRATEGY_TICK_SECS: u64 = 60;
/// Cadence of circuit-breaker persistence.
const BREAKER_PERSIST_SECS: u64 = 5;
/// Cadence of the lifecycle rollup sweep and account refresh.
const SWEEP_SECS: u64 = 60;
/// Cadence of the regime-suspension watcher.
const SUSPENSION_WATCH_SECS: u64 = 300;
/// Shutdown drain budget for in-flight close attempts.
const SHUTDOWN_DRAIN_SECS: u64 = 30;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & logging ─────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Meridian Spot Engine — Starting Up               ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let markets: Vec<String> = std::env::var("MERIDIAN_MARKETS")
        .unwrap_or_else(|_| "BTC-USDT,ETH-USDT,SOL-USDT,XRP-USDT,ADA-USDT".to_string())
        .split(',')
        .map(|m| normalize_market(m.trim()))
        .filter(|m| !m.is_empty())
        .collect();
    info!(markets = ?markets, "configured markets");

    let clock = MarketClock::from_env();

    // ── 2. Persistence ───────────────────────────────────────────────────
    let database_url =
        std::env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite:meridian.db".to_string());
    let pool = database::connect(&database_url).await?;
    database::init_schema(&pool).await?;
    let repos = Arc::new(Repositories::new(pool));

    let config = Arc::new(ConfigStore::load(repos.config.clone()).await?);

    // SAFETY: never resume trading automatically after a restart.
    config.set(KEY_TRADING_ENABLED, "false").await?;
    info!("trading disabled on boot — enable via POST /api/v1/control/resume");

    // ── 3. Exchange client & market data ─────────────────────────────────
    let access_key = std::env::var("EXCHANGE_ACCESS_KEY").unwrap_or_default();
    let secret_key = std::env::var("EXCHANGE_SECRET_KEY").unwrap_or_default();
    if access_key.is_empty() || secret_key.is_empty() {
        warn!("exchange credentials missing — authenticated calls will fail");
    }
    let exchange: Arc<dyn ExchangeApi> =
        Arc::new(RestExchangeClient::new(access_key, secret_key));

    let api_errors = Arc::new(ApiErrorWindow::new());
    let market_data = Arc::new(MarketDataService::new(exchange.clone(), api_errors.clone()));

    // ── 4. Risk stack ────────────────────────────────────────────────────
    let breaker = Arc::new(CircuitBreaker::new(api_errors));
    breaker.restore(&config);

    let notifier: Arc<dyn Notifier> = Arc::new(WebhookNotifier::from_env());
    let gate = Arc::new(RiskGate::new(
        config.clone(),
        breaker.clone(),
        repos.clone(),
        market_data.clone(),
        notifier.clone(),
        clock,
    ));

    // ── 5. Execution & monitoring ────────────────────────────────────────
    let lifecycle = Arc::new(LifecycleTracker::new(repos.clone(), clock));
    let executor = Arc::new(OrderExecutor::new(
        exchange.clone(),
        market_data.clone(),
        gate.clone(),
        breaker.clone(),
        lifecycle.clone(),
        config.clone(),
    ));
    // ── 6. Strategy engines & selector ───────────────────────────────────
    let mut engines: HashMap<StrategyCode, Arc<dyn Strategy>> = HashMap::new();
    engines.insert(StrategyCode::Breakout, Arc::new(BreakoutStrategy::new()));
    engines.insert(StrategyCode::Dca, Arc::new(DcaStrategy::new(config.clone())));
    engines.insert(StrategyCode::Grid, Arc::new(GridStrategy::new(config.clone())));
    engines.insert(
        StrategyCode::VolatilitySurvival,
        Arc::new(VolatilitySurvivalStrategy::new()),
    );
    let selector = Arc::new(StrategySelector::new(config.clone()));

    let monitor = Arc::new(PositionMonitor::new(
        repos.clone(),
        market_data.clone(),
        executor.clone(),
        breaker.clone(),
        config.clone(),
        notifier.clone(),
        engines.clone(),
    ));

    let state = Arc::new(AppState {
        markets: markets.clone(),
        clock,
        config: config.clone(),
        repos: repos.clone(),
        exchange,
        market_data,
        breaker: breaker.clone(),
        gate,
        executor,
        monitor: monitor.clone(),
        lifecycle: lifecycle.clone(),
        notifier: notifier.clone(),
        selector,
        engines,
        regimes: parking_lot::RwLock::new(HashMap::new()),
        last_signals: parking_lot::RwLock::new(HashMap::new()),
        start_time: std::time::Instant::now(),
    });

    // ── 7. Cooperative shutdown signal ───────────────────────────────────
    let (stop_tx, stop_rx) = watch::channel(false);

    // ── 8. API server ────────────────────────────────────────────────────
    let bind_addr =
        std::env::var("MERIDIAN_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3001".to_string());
    {
        let app = api::rest::router(state.clone());
        let bind = bind_addr.clone();
        tokio::spawn(async move {
            let listener = match tokio::net::TcpListener::bind(&bind).await {
                Ok(l) => l,
                Err(e) => {
                    error!(addr = %bind, error = %e, "API server failed to bind");
                    return;
                }
            };
            info!(addr = %bind, "API server listening");
            if let Err(e) = axum::serve(listener, app).await {
                error!(error = %e, "API server failed");
            }
        });
    }

    // ── 9. Strategy tick loop (per market, 60 s) ─────────────────────────
    {
        let state = state.clone();
        let mut stop = stop_rx.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(STRATEGY_TICK_SECS));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = stop.changed() => {
                        if *stop.borrow() { return; }
                        continue;
                    }
                }

                for market in &state.markets {
                    // One market's failure never halts the others.
                    match state.analyze_market(market).await {
                        Ok(signal) => state.dispatch_signal(&signal).await,
                        Err(e) => {
                            warn!(market = %market, error = %e, "strategy tick failed");
                        }
                    }
                }
            }
        });
        info!(interval_secs = STRATEGY_TICK_SECS, "strategy tick loop launched");
    }

    // ── 10. Position monitors (1 s / 30 s / 5 m) ─────────────────────────
    let mut monitor_handles = Vec::new();
    for family in MonitorFamily::all() {
        let handle = tokio::spawn(monitor.clone().run(family, stop_rx.clone()));
        monitor_handles.push(handle);
    }

    // ── 11. Circuit-breaker persistence (5 s) ────────────────────────────
    {
        let breaker = breaker.clone();
        let config = config.clone();
        let mut stop = stop_rx.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(BREAKER_PERSIST_SECS));
            loop {
                tokio::select! {
                    _ = ticker.tick() => breaker.persist(&config).await,
                    _ = stop.changed() => {
                        if *stop.borrow() { return; }
                    }
                }
            }
        });
    }

    // ── 12. Lifecycle sweep + account valuation (60 s) ───────────────────
    {
        let state = state.clone();
        let lifecycle = lifecycle.clone();
        let mut stop = stop_rx.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(SWEEP_SECS));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        lifecycle.sweep().await;

                        // Catch exit orders that went `done` out-of-band.
                        if let Ok(open) = state.repos.positions.find_open().await {
                            for position in open {
                                if let Some(order_id) = &position.exit_order_id {
                                    lifecycle
                                        .reconcile_order(
                                            state.exchange.as_ref(),
                                            order_id,
                                            &position.market,
                                            crate::types::Side::Sell,
                                            crate::types::StrategyGroup::CoreEngine,
                                            position.strategy,
                                        )
                                        .await;
                                }
                            }
                        }

                        match state.total_asset_value().await {
                            Ok(total) => state.breaker.update_total_asset(total),
                            Err(e) => warn!(error = %e, "account valuation failed"),
                        }
                    }
                    _ = stop.changed() => {
                        if *stop.borrow() { return; }
                    }
                }
            }
        });
    }

    // ── 13. Regime-suspension watcher (5 m) ──────────────────────────────
    {
        let state = state.clone();
        let watcher = RegimeSuspensionWatcher::new(config.clone(), notifier.clone());
        let mut stop = stop_rx.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(SUSPENSION_WATCH_SECS));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let regimes = state.regimes.read().clone();
                        watcher.evaluate(&regimes).await;
                    }
                    _ = stop.changed() => {
                        if *stop.borrow() { return; }
                    }
                }
            }
        });
    }

    // ── 14. Optimizer (daily, local midnight + 1 h) ──────────────────────
    if let Some(oracle) = ReasoningServiceOracle::from_env() {
        let optimizer = Optimizer::new(Arc::new(oracle), config.clone(), repos.clone());
        let clock = state.clock;
        let mut stop = stop_rx.clone();
        tokio::spawn(async move {
            loop {
                let wait = Duration::from_secs(clock.seconds_until_local_hour(1).max(60));
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {
                        match optimizer.run_once().await {
                            Ok(applied) => info!(applied, "optimizer pass complete"),
                            Err(e) => warn!(error = %e, "optimizer pass failed"),
                        }
                    }
                    _ = stop.changed() => {
                        if *stop.borrow() { return; }
                    }
                }
            }
        });
    } else {
        info!("REASONING_SERVICE_URL not set — optimizer loop not started");
    }

    info!("all subsystems running — press Ctrl+C to stop");

    // ── 15. Graceful shutdown ────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received — stopping loops");
    let _ = stop_tx.send(true);

    // Drain in-flight close attempts, bounded.
    let drain = async {
        for handle in monitor_handles {
            let _ = handle.await;
        }
    };
    if tokio::time::timeout(Duration::from_secs(SHUTDOWN_DRAIN_SECS), drain)
        .await
        .is_err()
    {
        warn!("monitor drain exceeded {SHUTDOWN_DRAIN_SECS}s — forcing exit");
    }

    breaker.persist(&config).await;
    info!("Meridian Spot Engine shut down complete");
    Ok(())
}
