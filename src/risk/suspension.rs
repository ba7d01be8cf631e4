// =============================================================================
// Regime-suspension watcher — auto-pause trading in broad bear conditions
// =============================================================================
//
// Watches the latest regime classification across all markets. When the bear
// ratio holds at or above the suspend threshold for the full dwell window,
// `trading.enabled` is switched off and a system notification goes out; when
// the ratio falls below the resume threshold, trading switches back on.
// Only a suspension this watcher itself issued is ever resumed, so an
// operator pause is never overridden.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::config_store::{ConfigStore, KEY_TRADING_ENABLED};
use crate::notify::Notifier;
use crate::regime::{RegimeAnalysis, RegimeKind};

/// Bear share at or above which suspension arms.
const SUSPEND_RATIO: f64 = 0.8;
/// Bear share below which trading resumes.
const RESUME_RATIO: f64 = 0.5;
/// The bear ratio must hold for this long before suspension fires.
const DWELL_MINUTES: i64 = 30;

/// Decision produced by one observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuspensionAction {
    Suspend,
    Resume,
}

/// Pure state machine, separated from I/O for testability.
#[derive(Debug, Default)]
pub struct SuspensionState {
    bear_since: Option<DateTime<Utc>>,
    suspended: bool,
}

impl SuspensionState {
    pub fn observe(&mut self, bear_ratio: f64, now: DateTime<Utc>) -> Option<SuspensionAction> {
        if self.suspended {
            if bear_ratio < RESUME_RATIO {
                self.suspended = false;
                self.bear_since = None;
                return Some(SuspensionAction::Resume);
            }
            return None;
        }

        if bear_ratio >= SUSPEND_RATIO {
            let since = *self.bear_since.get_or_insert(now);
            if now - since >= Duration::minutes(DWELL_MINUTES) {
                self.suspended = true;
                return Some(SuspensionAction::Suspend);
            }
        } else {
            self.bear_since = None;
        }
        None
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended
    }
}

/// The watcher that applies the state machine's decisions.
pub struct RegimeSuspensionWatcher {
    config: Arc<ConfigStore>,
    notifier: Arc<dyn Notifier>,
    state: Mutex<SuspensionState>,
}

impl RegimeSuspensionWatcher {
    pub fn new(config: Arc<ConfigStore>, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            config,
            notifier,
            state: Mutex::new(SuspensionState::default()),
        }
    }

    /// Evaluate the latest per-market regime snapshot.
    pub async fn evaluate(&self, regimes: &HashMap<String, RegimeAnalysis>) {
        if regimes.is_empty() {
            return;
        }
        let bears = regimes
            .values()
            .filter(|a| a.regime == RegimeKind::Bear)
            .count();
        let ratio = bears as f64 / regimes.len() as f64;

        let action = self.state.lock().observe(ratio, Utc::now());
        match action {
            Some(SuspensionAction::Suspend) => {
                warn!(
                    bear_ratio = format!("{ratio:.2}"),
                    "broad bear regime sustained, suspending trading"
                );
                if let Err(e) = self.config.set(KEY_TRADING_ENABLED, "false").await {
                    warn!(error = %e, "failed to persist trading suspension");
                }
                self.notifier
                    .send_system(
                        "Trading suspended",
                        &format!(
                            "{bears}/{} markets classified BEAR for {DWELL_MINUTES} minutes",
                            regimes.len()
                        ),
                    )
                    .await;
            }
            Some(SuspensionAction::Resume) => {
                info!(
                    bear_ratio = format!("{ratio:.2}"),
                    "bear share receded, resuming trading"
                );
                if let Err(e) = self.config.set(KEY_TRADING_ENABLED, "true").await {
                    warn!(error = %e, "failed to persist trading resume");
                }
                self.notifier
                    .send_system(
                        "Trading resumed",
                        &format!("bear share fell to {:.0}%", ratio * 100.0),
                    )
                    .await;
            }
            None => {}
        }
    }

    #[cfg(test)]
    pub fn force_bear_since(&self, at: DateTime<Utc>) {
        self.state.lock().bear_since = Some(at);
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::testkit::RecordingNotifier;
    use crate::persistence::database::memory_pool;
    use crate::persistence::ConfigRepository;

    fn analysis(regime: RegimeKind) -> RegimeAnalysis {
        RegimeAnalysis {
            regime,
            adx: 30.0,
            atr_percent: 1.0,
            confidence: 0.7,
        }
    }

    #[test]
    fn state_machine_requires_full_dwell() {
        let mut state = SuspensionState::default();
        let t0 = Utc::now();
        assert_eq!(state.observe(0.8, t0), None);
        assert_eq!(state.observe(0.8, t0 + Duration::minutes(15)), None);
        assert_eq!(
            state.observe(0.8, t0 + Duration::minutes(30)),
            Some(SuspensionAction::Suspend)
        );
    }

    #[test]
    fn dip_below_threshold_restarts_the_dwell() {
        let mut state = SuspensionState::default();
        let t0 = Utc::now();
        state.observe(0.9, t0);
        state.observe(0.4, t0 + Duration::minutes(20)); // streak broken
        assert_eq!(state.observe(0.9, t0 + Duration::minutes(31)), None);
    }

    #[test]
    fn resumes_below_half() {
        let mut state = SuspensionState::default();
        let t0 = Utc::now();
        state.observe(0.8, t0);
        state.observe(0.8, t0 + Duration::minutes(30));
        assert!(state.is_suspended());

        assert_eq!(state.observe(0.6, t0 + Duration::minutes(40)), None);
        assert_eq!(
            state.observe(0.4, t0 + Duration::minutes(50)),
            Some(SuspensionAction::Resume)
        );
        assert!(!state.is_suspended());
    }

    #[tokio::test]
    async fn four_of_five_bear_markets_suspend_and_recover() {
        let config = Arc::new(
            ConfigStore::load(ConfigRepository::new(memory_pool().await))
                .await
                .unwrap(),
        );
        config.set(KEY_TRADING_ENABLED, "true").await.unwrap();
        let notifier = Arc::new(RecordingNotifier::default());
        let watcher = RegimeSuspensionWatcher::new(config.clone(), notifier.clone());

        let mut regimes = HashMap::new();
        for market in ["A-USDT", "B-USDT", "C-USDT", "D-USDT"] {
            regimes.insert(market.to_string(), analysis(RegimeKind::Bear));
        }
        regimes.insert("E-USDT".to_string(), analysis(RegimeKind::Bull));

        // Arm the dwell 30 minutes in the past, then observe again.
        watcher.evaluate(&regimes).await;
        watcher.force_bear_since(Utc::now() - Duration::minutes(30));
        watcher.evaluate(&regimes).await;

        assert!(!config.get_bool(KEY_TRADING_ENABLED, true));
        assert_eq!(notifier.systems.lock().len(), 1);

        // Bear ratio falls to 2/5: trading resumes.
        for market in ["A-USDT", "B-USDT", "C-USDT"] {
            regimes.insert(market.to_string(), analysis(RegimeKind::Sideways));
        }
        watcher.evaluate(&regimes).await;

        assert!(config.get_bool(KEY_TRADING_ENABLED, false));
        assert_eq!(notifier.systems.lock().len(), 2);
    }
}
