// =============================================================================
// Order-lifecycle telemetry — append-only event log with daily rollups
// =============================================================================
//
// Every request, fill, cancel, and failure emits one event tagged with the
// strategy group that originated it. Fills are idempotent per order id: the
// store enforces at most one BUY_FILLED and one SELL_FILLED per order, so
// concurrent reconciliation passes cannot double-count.
// =============================================================================

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::exchange::ExchangeApi;
use crate::persistence::Repositories;
use crate::types::{MarketClock, OrderState, Side, StrategyCode, StrategyGroup};

// ---------------------------------------------------------------------------
// Event model
// ---------------------------------------------------------------------------

/// Kind of lifecycle transition being recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LifecycleEventType {
    BuyRequested,
    BuyFilled,
    SellRequested,
    SellFilled,
    CancelRequested,
    Cancelled,
    Failed,
}

impl LifecycleEventType {
    pub fn is_fill(self) -> bool {
        matches!(self, Self::BuyFilled | Self::SellFilled)
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "BUY_REQUESTED" => Some(Self::BuyRequested),
            "BUY_FILLED" => Some(Self::BuyFilled),
            "SELL_REQUESTED" => Some(Self::SellRequested),
            "SELL_FILLED" => Some(Self::SellFilled),
            "CANCEL_REQUESTED" => Some(Self::CancelRequested),
            "CANCELLED" => Some(Self::Cancelled),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for LifecycleEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tag = match self {
            Self::BuyRequested => "BUY_REQUESTED",
            Self::BuyFilled => "BUY_FILLED",
            Self::SellRequested => "SELL_REQUESTED",
            Self::SellFilled => "SELL_FILLED",
            Self::CancelRequested => "CANCEL_REQUESTED",
            Self::Cancelled => "CANCELLED",
            Self::Failed => "FAILED",
        };
        write!(f, "{tag}")
    }
}

/// One append-only lifecycle record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub id: Option<i64>,
    pub order_id: Option<String>,
    pub market: String,
    pub side: Option<Side>,
    pub event_type: LifecycleEventType,
    pub strategy_group: StrategyGroup,
    pub strategy_code: Option<StrategyCode>,
    pub price: Option<Decimal>,
    pub quantity: Option<Decimal>,
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl LifecycleEvent {
    pub fn new(
        market: &str,
        event_type: LifecycleEventType,
        strategy_group: StrategyGroup,
    ) -> Self {
        Self {
            id: None,
            order_id: None,
            market: crate::types::normalize_market(market),
            side: None,
            event_type,
            strategy_group,
            strategy_code: None,
            price: None,
            quantity: None,
            message: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_order(mut self, order_id: &str) -> Self {
        self.order_id = Some(order_id.to_string());
        self
    }

    pub fn with_side(mut self, side: Side) -> Self {
        self.side = Some(side);
        self
    }

    pub fn with_strategy(mut self, code: StrategyCode) -> Self {
        self.strategy_code = Some(code);
        self
    }

    pub fn with_fill(mut self, price: Decimal, quantity: Decimal) -> Self {
        self.price = Some(price);
        self.quantity = Some(quantity);
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Rollups
// ---------------------------------------------------------------------------

/// Per-group counts for one aggregation window.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GroupRollup {
    pub buy_requested: u64,
    pub buy_filled: u64,
    pub sell_requested: u64,
    pub sell_filled: u64,
    pub cancelled: u64,
    pub failed: u64,
}

impl GroupRollup {
    /// Requests that have neither filled, cancelled, nor failed yet.
    pub fn pending(&self) -> u64 {
        let requested = self.buy_requested + self.sell_requested;
        let resolved = self.buy_filled + self.sell_filled + self.cancelled + self.failed;
        requested.saturating_sub(resolved)
    }
}

/// Rollup for a window, grouped by strategy group.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LifecycleRollup {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub groups: std::collections::HashMap<String, GroupRollup>,
}

impl LifecycleRollup {
    /// Fold raw `(group, event_type, count)` rows into the rollup shape.
    pub fn from_counts(counts: Vec<(StrategyGroup, LifecycleEventType, u64)>) -> Self {
        let mut rollup = Self::default();
        for (group, event_type, n) in counts {
            let entry = rollup.groups.entry(group.to_string()).or_default();
            match event_type {
                LifecycleEventType::BuyRequested => entry.buy_requested += n,
                LifecycleEventType::BuyFilled => entry.buy_filled += n,
                LifecycleEventType::SellRequested => entry.sell_requested += n,
                LifecycleEventType::SellFilled => entry.sell_filled += n,
                LifecycleEventType::Cancelled | LifecycleEventType::CancelRequested => {
                    entry.cancelled += n
                }
                LifecycleEventType::Failed => entry.failed += n,
            }
        }
        rollup
    }
}

// ---------------------------------------------------------------------------
// Tracker
// ---------------------------------------------------------------------------

/// Front door for emitting events and computing rollups.
pub struct LifecycleTracker {
    repos: Arc<Repositories>,
    clock: MarketClock,
    cached_rollup: parking_lot::RwLock<Option<LifecycleRollup>>,
}

impl LifecycleTracker {
    pub fn new(repos: Arc<Repositories>, clock: MarketClock) -> Self {
        Self {
            repos,
            clock,
            cached_rollup: parking_lot::RwLock::new(None),
        }
    }

    /// Append one event. Duplicate fills for the same order id are dropped by
    /// the store's uniqueness constraint; returns whether the row landed.
    pub async fn record(&self, event: LifecycleEvent) -> bool {
        match self.repos.lifecycle.insert(&event).await {
            Ok(inserted) => {
                if !inserted {
                    debug!(
                        order_id = ?event.order_id,
                        event_type = %event.event_type,
                        "duplicate fill event dropped"
                    );
                }
                inserted
            }
            Err(e) => {
                warn!(error = %e, event_type = %event.event_type, "lifecycle event write failed");
                false
            }
        }
    }

    /// Rollup for the current local-midnight-to-now window.
    pub async fn rollup_today(&self) -> anyhow::Result<LifecycleRollup> {
        let from = self.clock.local_midnight_utc();
        let to = Utc::now();
        self.rollup_between(from, to).await
    }

    pub async fn rollup_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> anyhow::Result<LifecycleRollup> {
        let counts = self.repos.lifecycle.counts_between(from, to).await?;
        let mut rollup = LifecycleRollup::from_counts(counts);
        rollup.from = Some(from);
        rollup.to = Some(to);
        Ok(rollup)
    }

    /// Refresh the cached rollup (called by the 60 s sweep loop).
    pub async fn sweep(&self) {
        match self.rollup_today().await {
            Ok(rollup) => *self.cached_rollup.write() = Some(rollup),
            Err(e) => warn!(error = %e, "lifecycle rollup sweep failed"),
        }
    }

    pub fn cached_rollup(&self) -> Option<LifecycleRollup> {
        self.cached_rollup.read().clone()
    }

    /// Reconciliation pass: after an executor success, re-read the order from
    /// the exchange and make sure the fill event exists. Out-of-band `done`
    /// transitions are caught here; the unique-event constraint makes this
    /// safe to run concurrently.
    pub async fn reconcile_order(
        &self,
        exchange: &dyn ExchangeApi,
        order_id: &str,
        market: &str,
        side: Side,
        strategy_group: StrategyGroup,
        strategy_code: StrategyCode,
    ) {
        let snapshot = match exchange.get_order(order_id).await {
            Ok(s) => s,
            Err(e) => {
                debug!(order_id, error = %e, "reconcile: order re-read failed");
                return;
            }
        };

        if snapshot.state == OrderState::Done && snapshot.executed_volume > Decimal::ZERO {
            let fill_type = match side {
                Side::Buy => LifecycleEventType::BuyFilled,
                Side::Sell => LifecycleEventType::SellFilled,
            };
            let price = snapshot
                .effective_fill_price()
                .unwrap_or(Decimal::ZERO);
            let event = LifecycleEvent::new(market, fill_type, strategy_group)
                .with_order(order_id)
                .with_side(side)
                .with_strategy(strategy_code)
                .with_fill(price, snapshot.executed_volume)
                .with_message("reconciliation");
            self.record(event).await;
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_roundtrip() {
        for t in [
            LifecycleEventType::BuyRequested,
            LifecycleEventType::BuyFilled,
            LifecycleEventType::SellRequested,
            LifecycleEventType::SellFilled,
            LifecycleEventType::CancelRequested,
            LifecycleEventType::Cancelled,
            LifecycleEventType::Failed,
        ] {
            assert_eq!(LifecycleEventType::parse(&t.to_string()), Some(t));
        }
    }

    #[test]
    fn fill_detection() {
        assert!(LifecycleEventType::BuyFilled.is_fill());
        assert!(LifecycleEventType::SellFilled.is_fill());
        assert!(!LifecycleEventType::BuyRequested.is_fill());
    }

    #[test]
    fn rollup_folds_counts_per_group() {
        let rollup = LifecycleRollup::from_counts(vec![
            (StrategyGroup::CoreEngine, LifecycleEventType::BuyRequested, 4),
            (StrategyGroup::CoreEngine, LifecycleEventType::BuyFilled, 3),
            (StrategyGroup::CoreEngine, LifecycleEventType::Cancelled, 1),
            (StrategyGroup::Manual, LifecycleEventType::SellRequested, 2),
            (StrategyGroup::Manual, LifecycleEventType::SellFilled, 2),
        ]);

        let core = &rollup.groups["CORE_ENGINE"];
        assert_eq!(core.buy_requested, 4);
        assert_eq!(core.buy_filled, 3);
        assert_eq!(core.pending(), 0);

        let manual = &rollup.groups["MANUAL"];
        assert_eq!(manual.sell_filled, 2);
        assert_eq!(manual.pending(), 0);
    }

    #[test]
    fn pending_counts_unresolved_requests() {
        let r = GroupRollup {
            buy_requested: 5,
            buy_filled: 2,
            sell_requested: 1,
            sell_filled: 0,
            cancelled: 1,
            failed: 1,
        };
        assert_eq!(r.pending(), 2);
    }

    #[test]
    fn event_builder_normalizes_market() {
        let e = LifecycleEvent::new(
            "btc/usdt",
            LifecycleEventType::BuyRequested,
            StrategyGroup::CoreEngine,
        );
        assert_eq!(e.market, "BTC-USDT");
    }
}
