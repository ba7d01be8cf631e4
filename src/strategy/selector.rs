// =============================================================================
// Strategy selector — regime/volatility table with debounce and cooldown
// =============================================================================
//
// Routing table (confidence < 0.5 forces GRID):
//
//   regime     | ATR% < 2              | ATR% >= 2
//   -----------+-----------------------+----------------------
//   BULL       | BREAKOUT              | BREAKOUT
//   BEAR       | DCA                   | VOLATILITY_SURVIVAL
//   SIDEWAYS   | GRID                  | BREAKOUT
//   HIGH_VOL   | VOLATILITY_SURVIVAL   | VOLATILITY_SURVIVAL
//
// Transitions are debounced: the same new choice must be observed for N
// consecutive ticks before the switch, and a cooldown applies after any
// switch. Debounce state is per market.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use tracing::{debug, info};

use crate::config_store::ConfigStore;
use crate::regime::{RegimeAnalysis, RegimeKind};
use crate::types::{normalize_market, StrategyCode};

const DEFAULT_DEBOUNCE_TICKS: i64 = 3;
const DEFAULT_COOLDOWN_SECS: i64 = 3600;
/// Below this regime confidence the selector stays conservative.
const LOW_CONFIDENCE: f64 = 0.5;

/// The pure routing function of (regime, confidence, ATR%).
pub fn route(analysis: &RegimeAnalysis) -> StrategyCode {
    if analysis.confidence < LOW_CONFIDENCE {
        return StrategyCode::Grid;
    }
    let high_vol = analysis.atr_percent >= 2.0;
    match (analysis.regime, high_vol) {
        (RegimeKind::Bull, _) => StrategyCode::Breakout,
        (RegimeKind::Bear, false) => StrategyCode::Dca,
        (RegimeKind::Bear, true) => StrategyCode::VolatilitySurvival,
        (RegimeKind::Sideways, false) => StrategyCode::Grid,
        (RegimeKind::Sideways, true) => StrategyCode::Breakout,
        (RegimeKind::HighVol, _) => StrategyCode::VolatilitySurvival,
    }
}

#[derive(Debug, Clone)]
struct MarketSelection {
    active: StrategyCode,
    pending: Option<StrategyCode>,
    pending_ticks: i64,
    last_switch: DateTime<Utc>,
}

/// Per-market engine selection with hysteresis.
pub struct StrategySelector {
    config: Arc<ConfigStore>,
    states: RwLock<HashMap<String, MarketSelection>>,
}

impl StrategySelector {
    pub fn new(config: Arc<ConfigStore>) -> Self {
        Self {
            config,
            states: RwLock::new(HashMap::new()),
        }
    }

    fn debounce_ticks(&self) -> i64 {
        self.config
            .get_i64("selector.debounce_ticks", DEFAULT_DEBOUNCE_TICKS)
            .max(1)
    }

    fn cooldown_secs(&self) -> i64 {
        self.config
            .get_i64("selector.cooldown_secs", DEFAULT_COOLDOWN_SECS)
            .max(0)
    }

    /// Pick the engine for this market's tick.
    pub fn select(&self, market: &str, analysis: &RegimeAnalysis) -> StrategyCode {
        let market = normalize_market(market);
        let desired = route(analysis);
        let debounce = self.debounce_ticks();
        let cooldown = Duration::seconds(self.cooldown_secs());
        let now = Utc::now();

        let mut states = self.states.write();
        let state = states.entry(market.clone()).or_insert_with(|| {
            debug!(market = %market, strategy = %desired, "selector initialised");
            MarketSelection {
                active: desired,
                pending: None,
                pending_ticks: 0,
                last_switch: now - cooldown, // free to switch immediately
            }
        });

        if desired == state.active {
            state.pending = None;
            state.pending_ticks = 0;
            return state.active;
        }

        // A different choice: count consecutive observations of it.
        if state.pending == Some(desired) {
            state.pending_ticks += 1;
        } else {
            state.pending = Some(desired);
            state.pending_ticks = 1;
        }

        let cooled_down = now - state.last_switch >= cooldown;
        if state.pending_ticks >= debounce && cooled_down {
            info!(
                market = %market,
                from = %state.active,
                to = %desired,
                ticks = state.pending_ticks,
                "strategy switched"
            );
            state.active = desired;
            state.pending = None;
            state.pending_ticks = 0;
            state.last_switch = now;
        }

        state.active
    }

    /// Currently active engine for a market, if one was ever selected.
    pub fn active(&self, market: &str) -> Option<StrategyCode> {
        self.states
            .read()
            .get(&normalize_market(market))
            .map(|s| s.active)
    }

    #[cfg(test)]
    fn force_last_switch(&self, market: &str, at: DateTime<Utc>) {
        if let Some(state) = self.states.write().get_mut(&normalize_market(market)) {
            state.last_switch = at;
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::database::memory_pool;
    use crate::persistence::ConfigRepository;

    fn analysis(regime: RegimeKind, atr_percent: f64, confidence: f64) -> RegimeAnalysis {
        RegimeAnalysis {
            regime,
            adx: 30.0,
            atr_percent,
            confidence,
        }
    }

    async fn selector() -> StrategySelector {
        let config = Arc::new(
            ConfigStore::load(ConfigRepository::new(memory_pool().await))
                .await
                .unwrap(),
        );
        StrategySelector::new(config)
    }

    #[test]
    fn routing_table_by_regime_and_volatility() {
        use RegimeKind::*;
        use StrategyCode::*;
        assert_eq!(route(&analysis(Bull, 1.0, 0.8)), Breakout);
        assert_eq!(route(&analysis(Bull, 3.0, 0.8)), Breakout);
        assert_eq!(route(&analysis(Bear, 1.0, 0.8)), Dca);
        assert_eq!(route(&analysis(Bear, 3.0, 0.8)), VolatilitySurvival);
        assert_eq!(route(&analysis(Sideways, 1.0, 0.8)), Grid);
        assert_eq!(route(&analysis(Sideways, 3.0, 0.8)), Breakout);
        assert_eq!(route(&analysis(HighVol, 1.0, 0.8)), VolatilitySurvival);
        assert_eq!(route(&analysis(HighVol, 3.0, 0.8)), VolatilitySurvival);
    }

    #[test]
    fn low_confidence_forces_grid() {
        assert_eq!(
            route(&analysis(RegimeKind::Bull, 1.0, 0.3)),
            StrategyCode::Grid
        );
        assert_eq!(
            route(&analysis(RegimeKind::HighVol, 3.0, 0.49)),
            StrategyCode::Grid
        );
    }

    #[tokio::test]
    async fn switch_requires_consecutive_observations() {
        let sel = selector().await;
        let bull = analysis(RegimeKind::Bull, 1.0, 0.8);
        let bear = analysis(RegimeKind::Bear, 1.0, 0.8);

        assert_eq!(sel.select("BTC-USDT", &bull), StrategyCode::Breakout);

        // Two bear ticks are not enough with debounce 3.
        assert_eq!(sel.select("BTC-USDT", &bear), StrategyCode::Breakout);
        assert_eq!(sel.select("BTC-USDT", &bear), StrategyCode::Breakout);
        // Third consecutive observation flips it.
        assert_eq!(sel.select("BTC-USDT", &bear), StrategyCode::Dca);
    }

    #[tokio::test]
    async fn interrupted_streak_resets_debounce() {
        let sel = selector().await;
        let bull = analysis(RegimeKind::Bull, 1.0, 0.8);
        let bear = analysis(RegimeKind::Bear, 1.0, 0.8);

        sel.select("BTC-USDT", &bull);
        sel.select("BTC-USDT", &bear);
        sel.select("BTC-USDT", &bear);
        // Back to bull: streak resets.
        assert_eq!(sel.select("BTC-USDT", &bull), StrategyCode::Breakout);
        sel.select("BTC-USDT", &bear);
        sel.select("BTC-USDT", &bear);
        assert_eq!(sel.select("BTC-USDT", &bull), StrategyCode::Breakout);
    }

    #[tokio::test]
    async fn cooldown_blocks_rapid_flapping() {
        let sel = selector().await;
        let bull = analysis(RegimeKind::Bull, 1.0, 0.8);
        let bear = analysis(RegimeKind::Bear, 1.0, 0.8);

        sel.select("BTC-USDT", &bull);
        for _ in 0..3 {
            sel.select("BTC-USDT", &bear);
        }
        assert_eq!(sel.active("BTC-USDT"), Some(StrategyCode::Dca));

        // Immediately try to flip back: debounce satisfied but cooldown holds.
        for _ in 0..5 {
            assert_eq!(sel.select("BTC-USDT", &bull), StrategyCode::Dca);
        }

        // Expire the cooldown and the pending streak completes the switch.
        sel.force_last_switch("BTC-USDT", Utc::now() - Duration::seconds(7200));
        assert_eq!(sel.select("BTC-USDT", &bull), StrategyCode::Breakout);
    }

    #[tokio::test]
    async fn debounce_state_is_per_market() {
        let sel = selector().await;
        let bull = analysis(RegimeKind::Bull, 1.0, 0.8);
        let bear = analysis(RegimeKind::Bear, 1.0, 0.8);

        sel.select("BTC-USDT", &bull);
        sel.select("ETH-USDT", &bull);
        sel.select("BTC-USDT", &bear);
        sel.select("BTC-USDT", &bear);
        sel.select("BTC-USDT", &bear);

        assert_eq!(sel.active("BTC-USDT"), Some(StrategyCode::Dca));
        assert_eq!(sel.active("ETH-USDT"), Some(StrategyCode::Breakout));
    }
}
