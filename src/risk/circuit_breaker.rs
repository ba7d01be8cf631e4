// =============================================================================
// Circuit breaker — loss / failure / slippage pattern trips with cooldowns
// =============================================================================
//
// Per-market counters:
//   3 consecutive realized losses      -> market trip, 4 h
//   5 consecutive execution failures   -> market trip, 1 h
//   3 consecutive high-slippage fills  -> market trip, 4 h (slippage > 2 %)
// Global:
//   10 API errors in 60 s              -> global trip, 24 h
//   total asset >= 10 % below peak     -> global trip, 24 h
//
// A win/success resets its counter to zero. State is persisted through the
// configuration store on a 5 s cadence so restarts preserve open cooldowns.
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config_store::ConfigStore;
use crate::types::normalize_market;

const LOSS_TRIP: u32 = 3;
const EXEC_FAILURE_TRIP: u32 = 5;
const SLIPPAGE_TRIP: u32 = 3;
const HIGH_SLIPPAGE_PERCENT: f64 = 2.0;
const API_ERROR_TRIP: usize = 10;
const ASSET_DRAWDOWN_TRIP: f64 = 0.10;

const LOSS_COOLDOWN_HOURS: i64 = 4;
const EXEC_FAILURE_COOLDOWN_HOURS: i64 = 1;
const SLIPPAGE_COOLDOWN_HOURS: i64 = 4;
const GLOBAL_COOLDOWN_HOURS: i64 = 24;

/// Config key the persisted snapshot lives under.
const STATE_KEY: &str = "circuit.state";

// ---------------------------------------------------------------------------
// API error window
// ---------------------------------------------------------------------------

/// Rolling 60-second window of API transport errors, shared by the market
/// data adapter, the executor, and the risk gate.
#[derive(Default)]
pub struct ApiErrorWindow {
    events: Mutex<VecDeque<Instant>>,
}

impl ApiErrorWindow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self) {
        let mut events = self.events.lock();
        events.push_back(Instant::now());
        Self::prune(&mut events);
    }

    /// Errors observed in the trailing minute.
    pub fn count_last_minute(&self) -> usize {
        let mut events = self.events.lock();
        Self::prune(&mut events);
        events.len()
    }

    fn prune(events: &mut VecDeque<Instant>) {
        while events
            .front()
            .is_some_and(|t| t.elapsed().as_secs() >= 60)
        {
            events.pop_front();
        }
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Per-market breaker counters and trip state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MarketBreakerState {
    pub consecutive_losses: u32,
    pub consecutive_exec_failures: u32,
    pub consecutive_high_slippage: u32,
    pub opened_until: Option<DateTime<Utc>>,
    pub reason: Option<String>,
}

impl MarketBreakerState {
    fn is_open(&self, now: DateTime<Utc>) -> bool {
        self.opened_until.is_some_and(|until| until > now)
    }
}

/// Global breaker state (asset-peak tracking plus the global trip).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GlobalBreakerState {
    pub opened_until: Option<DateTime<Utc>>,
    pub reason: Option<String>,
    pub total_asset_peak: Decimal,
}

impl GlobalBreakerState {
    fn is_open(&self, now: DateTime<Utc>) -> bool {
        self.opened_until.is_some_and(|until| until > now)
    }
}

/// Serialized form of the full breaker state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct BreakerSnapshot {
    markets: HashMap<String, MarketBreakerState>,
    global: GlobalBreakerState,
}

/// Operator-facing status row for one market.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerStatus {
    pub market: String,
    pub consecutive_losses: u32,
    pub consecutive_exec_failures: u32,
    pub consecutive_high_slippage: u32,
    pub open: bool,
    pub opened_until: Option<DateTime<Utc>>,
    pub reason: Option<String>,
}

// ---------------------------------------------------------------------------
// CircuitBreaker
// ---------------------------------------------------------------------------

pub struct CircuitBreaker {
    markets: RwLock<HashMap<String, MarketBreakerState>>,
    global: RwLock<GlobalBreakerState>,
    api_errors: std::sync::Arc<ApiErrorWindow>,
}

impl CircuitBreaker {
    pub fn new(api_errors: std::sync::Arc<ApiErrorWindow>) -> Self {
        Self {
            markets: RwLock::new(HashMap::new()),
            global: RwLock::new(GlobalBreakerState::default()),
            api_errors,
        }
    }

    pub fn api_errors(&self) -> &ApiErrorWindow {
        &self.api_errors
    }

    // -------------------------------------------------------------------------
    // Admission check
    // -------------------------------------------------------------------------

    /// `Err(reason)` when either the market's breaker or the global breaker
    /// is inside its cooldown.
    pub fn check(&self, market: &str) -> Result<(), String> {
        let now = Utc::now();

        // Errors recorded straight into the shared window (market data path)
        // latch the global trip here, on the next admission check.
        let api_error_count = self.api_errors.count_last_minute();
        if api_error_count >= API_ERROR_TRIP {
            let mut global = self.global.write();
            if !global.is_open(now) {
                Self::trip_global(&mut global, format!("{api_error_count} API errors in 60s"));
            }
        }

        {
            let global = self.global.read();
            if global.is_open(now) {
                return Err(format!(
                    "global breaker open until {} ({})",
                    global.opened_until.unwrap_or(now),
                    global.reason.as_deref().unwrap_or("unknown")
                ));
            }
        }

        let market = normalize_market(market);
        let markets = self.markets.read();
        if let Some(state) = markets.get(&market) {
            if state.is_open(now) {
                return Err(format!(
                    "{} breaker open until {} ({})",
                    market,
                    state.opened_until.unwrap_or(now),
                    state.reason.as_deref().unwrap_or("unknown")
                ));
            }
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Recorders (read-modify-write under one write lock)
    // -------------------------------------------------------------------------

    /// A realized loss on `market`; trips after three in a row.
    pub fn record_loss(&self, market: &str) {
        let market = normalize_market(market);
        let mut markets = self.markets.write();
        let state = markets.entry(market.clone()).or_default();
        state.consecutive_losses += 1;

        if state.consecutive_losses >= LOSS_TRIP && !state.is_open(Utc::now()) {
            Self::trip_market(
                state,
                &market,
                LOSS_COOLDOWN_HOURS,
                format!("{} consecutive losses", state.consecutive_losses),
            );
        }
    }

    /// A realized win; consecutive-loss counter resets to zero.
    pub fn record_win(&self, market: &str) {
        let market = normalize_market(market);
        let mut markets = self.markets.write();
        markets.entry(market).or_default().consecutive_losses = 0;
    }

    pub fn record_exec_failure(&self, market: &str) {
        let market = normalize_market(market);
        let mut markets = self.markets.write();
        let state = markets.entry(market.clone()).or_default();
        state.consecutive_exec_failures += 1;

        if state.consecutive_exec_failures >= EXEC_FAILURE_TRIP && !state.is_open(Utc::now()) {
            Self::trip_market(
                state,
                &market,
                EXEC_FAILURE_COOLDOWN_HOURS,
                format!(
                    "{} consecutive execution failures",
                    state.consecutive_exec_failures
                ),
            );
        }
    }

    pub fn record_exec_success(&self, market: &str) {
        let market = normalize_market(market);
        let mut markets = self.markets.write();
        markets.entry(market).or_default().consecutive_exec_failures = 0;
    }

    /// Record a fill's slippage; counts only fills above the high-slippage
    /// threshold and resets on a clean fill.
    pub fn record_slippage(&self, market: &str, slippage_percent: f64) {
        let market = normalize_market(market);
        let mut markets = self.markets.write();
        let state = markets.entry(market.clone()).or_default();

        if slippage_percent.abs() > HIGH_SLIPPAGE_PERCENT {
            state.consecutive_high_slippage += 1;
            if state.consecutive_high_slippage >= SLIPPAGE_TRIP && !state.is_open(Utc::now()) {
                Self::trip_market(
                    state,
                    &market,
                    SLIPPAGE_COOLDOWN_HOURS,
                    format!(
                        "{} consecutive high-slippage fills",
                        state.consecutive_high_slippage
                    ),
                );
            }
        } else {
            state.consecutive_high_slippage = 0;
        }
    }

    /// One API transport error anywhere in the engine. Ten in the trailing
    /// minute trip the global breaker.
    pub fn record_api_error(&self) {
        self.api_errors.record();
        let count = self.api_errors.count_last_minute();
        if count >= API_ERROR_TRIP {
            let mut global = self.global.write();
            if !global.is_open(Utc::now()) {
                Self::trip_global(&mut global, format!("{count} API errors in 60s"));
            }
        }
    }

    /// Track the portfolio's total asset value against its running peak.
    pub fn update_total_asset(&self, value: Decimal) {
        use rust_decimal::prelude::ToPrimitive;
        let mut global = self.global.write();

        if value > global.total_asset_peak {
            global.total_asset_peak = value;
            return;
        }
        if global.total_asset_peak <= Decimal::ZERO {
            return;
        }

        let drawdown = ((global.total_asset_peak - value) / global.total_asset_peak)
            .to_f64()
            .unwrap_or(0.0);
        if drawdown >= ASSET_DRAWDOWN_TRIP && !global.is_open(Utc::now()) {
            Self::trip_global(
                &mut global,
                format!("total asset down {:.1}% from peak", drawdown * 100.0),
            );
        }
    }

    fn trip_market(state: &mut MarketBreakerState, market: &str, hours: i64, reason: String) {
        state.opened_until = Some(Utc::now() + Duration::hours(hours));
        state.reason = Some(reason.clone());
        warn!(market, cooldown_hours = hours, reason = %reason, "market circuit breaker tripped");
    }

    fn trip_global(global: &mut GlobalBreakerState, reason: String) {
        global.opened_until = Some(Utc::now() + Duration::hours(GLOBAL_COOLDOWN_HOURS));
        global.reason = Some(reason.clone());
        warn!(
            cooldown_hours = GLOBAL_COOLDOWN_HOURS,
            reason = %reason,
            "GLOBAL circuit breaker tripped"
        );
    }

    // -------------------------------------------------------------------------
    // Status / persistence
    // -------------------------------------------------------------------------

    pub fn status(&self) -> (Vec<BreakerStatus>, GlobalBreakerState) {
        let now = Utc::now();
        let markets = self.markets.read();
        let mut rows: Vec<BreakerStatus> = markets
            .iter()
            .map(|(market, state)| BreakerStatus {
                market: market.clone(),
                consecutive_losses: state.consecutive_losses,
                consecutive_exec_failures: state.consecutive_exec_failures,
                consecutive_high_slippage: state.consecutive_high_slippage,
                open: state.is_open(now),
                opened_until: state.opened_until,
                reason: state.reason.clone(),
            })
            .collect();
        rows.sort_by(|a, b| a.market.cmp(&b.market));
        (rows, self.global.read().clone())
    }

    /// Persist the full state through the configuration store.
    pub async fn persist(&self, config: &ConfigStore) {
        let snapshot = BreakerSnapshot {
            markets: self.markets.read().clone(),
            global: self.global.read().clone(),
        };
        match serde_json::to_string(&snapshot) {
            Ok(json) => {
                if let Err(e) = config
                    .set_with_meta(STATE_KEY, &json, Some("risk"), None)
                    .await
                {
                    warn!(error = %e, "circuit breaker persistence failed");
                }
            }
            Err(e) => warn!(error = %e, "circuit breaker snapshot serialization failed"),
        }
    }

    /// Restore persisted state so restarts keep open cooldowns.
    pub fn restore(&self, config: &ConfigStore) {
        let raw = config.get(STATE_KEY, "");
        if raw.is_empty() {
            return;
        }
        match serde_json::from_str::<BreakerSnapshot>(&raw) {
            Ok(snapshot) => {
                let open_markets = snapshot
                    .markets
                    .values()
                    .filter(|s| s.is_open(Utc::now()))
                    .count();
                *self.markets.write() = snapshot.markets;
                *self.global.write() = snapshot.global;
                info!(open_markets, "circuit breaker state restored");
            }
            Err(e) => warn!(error = %e, "circuit breaker state restore failed"),
        }
    }

    #[cfg(test)]
    pub fn force_market_open_until(&self, market: &str, until: DateTime<Utc>) {
        let mut markets = self.markets.write();
        let state = markets.entry(normalize_market(market)).or_default();
        state.opened_until = Some(until);
        state.reason = Some("test".into());
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("markets", &self.markets.read().len())
            .field("global_open", &self.global.read().is_open(Utc::now()))
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(Arc::new(ApiErrorWindow::new()))
    }

    #[test]
    fn three_losses_trip_the_market_for_four_hours() {
        let cb = breaker();
        cb.record_loss("BTC-USDT");
        cb.record_loss("BTC-USDT");
        assert!(cb.check("BTC-USDT").is_ok());
        cb.record_loss("BTC-USDT");
        assert!(cb.check("BTC-USDT").is_err());
        // Other markets stay clear.
        assert!(cb.check("ETH-USDT").is_ok());

        // The loss trip opens a four-hour window.
        let (rows, _) = cb.status();
        let row = rows.iter().find(|r| r.market == "BTC-USDT").unwrap();
        let window = row.opened_until.unwrap() - Utc::now();
        assert!(
            window > Duration::minutes(235) && window <= Duration::hours(4),
            "expected a 4h cooldown, got {window}"
        );
    }

    #[test]
    fn win_resets_loss_counter() {
        let cb = breaker();
        cb.record_loss("BTC-USDT");
        cb.record_loss("BTC-USDT");
        cb.record_win("BTC-USDT");
        cb.record_loss("BTC-USDT");
        cb.record_loss("BTC-USDT");
        assert!(cb.check("BTC-USDT").is_ok());
    }

    #[test]
    fn expired_cooldown_admits_again() {
        let cb = breaker();
        for _ in 0..3 {
            cb.record_loss("BTC-USDT");
        }
        assert!(cb.check("BTC-USDT").is_err());
        cb.force_market_open_until("BTC-USDT", Utc::now() - Duration::seconds(1));
        assert!(cb.check("BTC-USDT").is_ok());
    }

    #[test]
    fn five_exec_failures_trip() {
        let cb = breaker();
        for _ in 0..4 {
            cb.record_exec_failure("ETH-USDT");
        }
        assert!(cb.check("ETH-USDT").is_ok());
        cb.record_exec_failure("ETH-USDT");
        assert!(cb.check("ETH-USDT").is_err());
    }

    #[test]
    fn slippage_counts_only_above_threshold() {
        let cb = breaker();
        cb.record_slippage("BTC-USDT", 2.5);
        cb.record_slippage("BTC-USDT", 3.0);
        cb.record_slippage("BTC-USDT", 0.5); // clean fill resets
        cb.record_slippage("BTC-USDT", 2.5);
        cb.record_slippage("BTC-USDT", 2.5);
        assert!(cb.check("BTC-USDT").is_ok());
        cb.record_slippage("BTC-USDT", -2.5); // magnitude counts, sign does not
        assert!(cb.check("BTC-USDT").is_err());
    }

    #[test]
    fn api_error_burst_trips_global() {
        let cb = breaker();
        for _ in 0..9 {
            cb.record_api_error();
        }
        assert!(cb.check("BTC-USDT").is_ok());
        cb.record_api_error();
        // Global trip blocks every market.
        assert!(cb.check("BTC-USDT").is_err());
        assert!(cb.check("ETH-USDT").is_err());
    }

    #[test]
    fn asset_drawdown_trips_global() {
        let cb = breaker();
        cb.update_total_asset(dec!(1000000));
        cb.update_total_asset(dec!(950000));
        assert!(cb.check("BTC-USDT").is_ok());
        cb.update_total_asset(dec!(899999));
        assert!(cb.check("BTC-USDT").is_err());
    }

    #[test]
    fn peak_ratchets_upward() {
        let cb = breaker();
        cb.update_total_asset(dec!(100));
        cb.update_total_asset(dec!(200));
        // 10% below the old peak but well above 10% below the new one.
        cb.update_total_asset(dec!(190));
        assert!(cb.check("BTC-USDT").is_ok());
    }

    #[tokio::test]
    async fn persist_restore_roundtrip() {
        use crate::config_store::ConfigStore;
        use crate::persistence::database::memory_pool;
        use crate::persistence::ConfigRepository;

        let config = ConfigStore::load(ConfigRepository::new(memory_pool().await))
            .await
            .unwrap();

        let cb = breaker();
        for _ in 0..3 {
            cb.record_loss("BTC-USDT");
        }
        cb.persist(&config).await;

        let restored = breaker();
        restored.restore(&config);
        assert!(restored.check("BTC-USDT").is_err());
        assert!(restored.check("ETH-USDT").is_ok());
    }
}
