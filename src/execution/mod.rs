// =============================================================================
// Order execution — signal to fill
// =============================================================================

pub mod executor;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::types::{OrderType, Side, StrategyCode};

/// Append-only record of one executed (or simulated) trade.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub order_id: String,
    pub market: String,
    pub side: Side,
    pub order_type: OrderType,
    pub price: Decimal,
    pub quantity: Decimal,
    pub total_amount: Decimal,
    pub fee: Decimal,
    pub slippage_percent: Option<f64>,
    pub is_partial_fill: bool,
    pub pnl: Option<Decimal>,
    pub pnl_percent: Option<f64>,
    pub strategy: StrategyCode,
    pub regime: Option<String>,
    pub confidence: f64,
    pub reason: String,
    pub simulated: bool,
    pub created_at: DateTime<Utc>,
}

/// Outcome descriptor returned by the executor. The executor never mutates
/// the caller's position — callers reconcile from this.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub success: bool,
    pub order_id: Option<String>,
    /// Average fill price of the executed portion.
    pub price: Option<Decimal>,
    pub executed_quantity: Decimal,
    /// Quantity the order originally asked for.
    pub requested_quantity: Decimal,
    pub fee: Decimal,
    pub is_partial_fill: bool,
    /// Executed / requested, in percent.
    pub fill_rate_percent: f64,
    /// Fill price versus the orderbook mid at submit time, in percent
    /// (positive = filled worse than mid).
    pub slippage_percent: f64,
    pub message: String,
    pub rejection_reason: Option<String>,
    /// Trade record built from the fill, for the caller to persist in the
    /// same transaction as its position write.
    #[serde(skip)]
    pub trade: Option<TradeRecord>,
}

/// Named per-market async mutexes. One instance serializes entries, a second,
/// independent instance serializes closes; a lock is never held across the
/// boundary between the two paths.
#[derive(Default)]
pub struct MarketLocks {
    locks: parking_lot::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl MarketLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_market(&self, market: &str) -> Arc<tokio::sync::Mutex<()>> {
        let market = crate::types::normalize_market(market);
        self.locks.lock().entry(market).or_default().clone()
    }
}

impl ExecutionReport {
    /// A no-fill outcome with a message.
    pub fn no_fill(message: impl Into<String>) -> Self {
        Self {
            success: false,
            order_id: None,
            price: None,
            executed_quantity: Decimal::ZERO,
            requested_quantity: Decimal::ZERO,
            fee: Decimal::ZERO,
            is_partial_fill: false,
            fill_rate_percent: 0.0,
            slippage_percent: 0.0,
            message: message.into(),
            rejection_reason: None,
            trade: None,
        }
    }
}
