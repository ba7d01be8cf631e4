// =============================================================================
// Exchange adapter contract — REST access to one spot exchange
// =============================================================================
//
// All prices, quantities, and amounts cross this boundary as
// `rust_decimal::Decimal`. Implementations own their rate limiting and must
// be safe for concurrent use from every worker loop.
// =============================================================================

pub mod client;
pub mod rate_limit;
#[cfg(test)]
pub mod testkit;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::market_data::Candle;
use crate::types::{OrderState, OrderType, Side};

/// Errors from the exchange boundary, split into the two shapes the engine
/// cares about: the transport failed, or the exchange said no.
#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("transport: {0}")]
    Transport(String),

    #[error("rejected: {0}")]
    Rejected(String),
}

/// Last-trade snapshot for a market.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticker {
    pub market: String,
    pub last_price: Decimal,
}

/// One resting level of the order book.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderbookLevel {
    pub price: Decimal,
    pub quantity: Decimal,
}

/// Order book snapshot, best levels first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Orderbook {
    pub market: String,
    pub bids: Vec<OrderbookLevel>,
    pub asks: Vec<OrderbookLevel>,
}

impl Orderbook {
    pub fn best_bid(&self) -> Option<Decimal> {
        self.bids.first().map(|l| l.price)
    }

    pub fn best_ask(&self) -> Option<Decimal> {
        self.asks.first().map(|l| l.price)
    }

    /// Midpoint of the best bid and ask.
    pub fn mid(&self) -> Option<Decimal> {
        match (self.best_bid(), self.best_ask()) {
            (Some(b), Some(a)) => Some((b + a) / Decimal::TWO),
            _ => None,
        }
    }

    /// Bid/ask spread as a percentage of the midpoint.
    pub fn spread_percent(&self) -> Option<f64> {
        use rust_decimal::prelude::ToPrimitive;
        let (bid, ask) = (self.best_bid()?, self.best_ask()?);
        let mid = (bid + ask) / Decimal::TWO;
        if mid <= Decimal::ZERO {
            return None;
        }
        ((ask - bid) / mid * Decimal::ONE_HUNDRED).to_f64()
    }

    /// Total resting quantity on the side an order of `side` would consume.
    pub fn depth_for(&self, side: Side) -> Decimal {
        let levels = match side {
            Side::Buy => &self.asks,
            Side::Sell => &self.bids,
        };
        levels.iter().map(|l| l.quantity).sum()
    }
}

/// One asset's balance as reported by the exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Balance {
    pub currency: String,
    pub available: Decimal,
    pub locked: Decimal,
    pub avg_buy_price: Option<Decimal>,
}

/// A new-order request. Exactly one of `quantity` (base units) or `amount`
/// (quote units, market buys only) must be present.
#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub market: String,
    pub side: Side,
    pub order_type: OrderType,
    pub price: Option<Decimal>,
    pub quantity: Option<Decimal>,
    pub amount: Option<Decimal>,
    /// Client-side idempotence token; resubmitting with the same token is
    /// illegal.
    pub client_token: String,
}

/// Point-in-time view of a submitted order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderSnapshot {
    pub order_id: String,
    pub state: OrderState,
    /// Limit price, if any.
    pub price: Option<Decimal>,
    /// Average price of the executed portion, when the exchange reports it.
    pub avg_fill_price: Option<Decimal>,
    pub executed_volume: Decimal,
    pub remaining_volume: Decimal,
    pub paid_fee: Decimal,
}

impl OrderSnapshot {
    /// Best-effort fill price: the reported average, else the limit price.
    pub fn effective_fill_price(&self) -> Option<Decimal> {
        self.avg_fill_price.or(self.price)
    }
}

/// The full exchange surface the engine consumes. One implementation talks
/// REST to the real exchange; tests drive the engine with a scripted mock.
#[async_trait]
pub trait ExchangeApi: Send + Sync {
    async fn get_candles(
        &self,
        market: &str,
        interval: &str,
        count: u32,
    ) -> Result<Vec<Candle>, ExchangeError>;

    async fn get_ticker(&self, market: &str) -> Result<Ticker, ExchangeError>;

    async fn get_orderbook(&self, market: &str, depth: usize) -> Result<Orderbook, ExchangeError>;

    async fn get_balances(&self) -> Result<Vec<Balance>, ExchangeError>;

    async fn place_order(&self, request: &OrderRequest) -> Result<String, ExchangeError>;

    async fn get_order(&self, order_id: &str) -> Result<OrderSnapshot, ExchangeError>;

    async fn cancel_order(&self, order_id: &str) -> Result<(), ExchangeError>;
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn book() -> Orderbook {
        Orderbook {
            market: "BTC-USDT".into(),
            bids: vec![
                OrderbookLevel { price: dec!(99.5), quantity: dec!(2.0) },
                OrderbookLevel { price: dec!(99.0), quantity: dec!(3.0) },
            ],
            asks: vec![
                OrderbookLevel { price: dec!(100.5), quantity: dec!(1.5) },
                OrderbookLevel { price: dec!(101.0), quantity: dec!(4.0) },
            ],
        }
    }

    #[test]
    fn orderbook_mid_and_spread() {
        let b = book();
        assert_eq!(b.mid(), Some(dec!(100.0)));
        let spread = b.spread_percent().unwrap();
        assert!((spread - 1.0).abs() < 1e-9, "spread was {spread}");
    }

    #[test]
    fn orderbook_depth_sides() {
        let b = book();
        assert_eq!(b.depth_for(Side::Buy), dec!(5.5));
        assert_eq!(b.depth_for(Side::Sell), dec!(5.0));
    }

    #[test]
    fn snapshot_fill_price_fallback() {
        let snap = OrderSnapshot {
            order_id: "o1".into(),
            state: OrderState::Done,
            price: Some(dec!(100)),
            avg_fill_price: None,
            executed_volume: dec!(1),
            remaining_volume: dec!(0),
            paid_fee: dec!(0.05),
        };
        assert_eq!(snap.effective_fill_price(), Some(dec!(100)));
    }
}
