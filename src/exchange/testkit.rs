// =============================================================================
// Scripted mock exchange for tests
// =============================================================================
//
// Behaviors for `place_order` are queued ahead of time; everything else is
// plain settable state. The mock never sleeps, so fill waits resolve on the
// first poll.
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::exchange::{
    Balance, ExchangeApi, ExchangeError, OrderRequest, OrderSnapshot, Orderbook, OrderbookLevel,
    Ticker,
};
use crate::market_data::Candle;
use crate::types::{normalize_market, OrderState, Side};

/// What the next `place_order` call should do.
#[derive(Debug, Clone)]
pub enum PlaceBehavior {
    /// Order fills completely and immediately.
    FillAll,
    /// Order fills `fraction` of the requested quantity, then reads as done.
    FillPartial(Decimal),
    /// Order rests unfilled (state stays `Wait`).
    StayOpen,
    /// Exchange refuses the order.
    Reject(String),
    /// Transport-level failure.
    TransportFail(String),
}

#[derive(Default)]
pub struct MockExchange {
    pub candles: RwLock<HashMap<String, Vec<Candle>>>,
    pub tickers: RwLock<HashMap<String, Decimal>>,
    pub orderbooks: RwLock<HashMap<String, Orderbook>>,
    pub balances: RwLock<Vec<Balance>>,
    pub orders: RwLock<HashMap<String, OrderSnapshot>>,
    /// Scripted behaviors, consumed in order; empty queue means FillAll.
    pub place_script: RwLock<VecDeque<PlaceBehavior>>,
    /// Every request the engine submitted, for assertions.
    pub placed: RwLock<Vec<OrderRequest>>,
    /// When true, every data call fails at the transport level.
    pub data_outage: RwLock<bool>,
    next_id: AtomicU64,
}

impl MockExchange {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_ticker(&self, market: &str, price: Decimal) {
        self.tickers
            .write()
            .insert(normalize_market(market), price);
    }

    /// Install a deep, tight book around `price` (0.1% half-spread).
    pub fn set_deep_book(&self, market: &str, price: Decimal) {
        let half_spread = price * dec!(0.001);
        let book = Orderbook {
            market: normalize_market(market),
            bids: (1..=5)
                .map(|i| OrderbookLevel {
                    price: price - half_spread * Decimal::from(i),
                    quantity: dec!(100),
                })
                .collect(),
            asks: (1..=5)
                .map(|i| OrderbookLevel {
                    price: price + half_spread * Decimal::from(i),
                    quantity: dec!(100),
                })
                .collect(),
        };
        self.orderbooks.write().insert(normalize_market(market), book);
    }

    pub fn set_book(&self, market: &str, book: Orderbook) {
        self.orderbooks.write().insert(normalize_market(market), book);
    }

    pub fn set_balance(&self, currency: &str, available: Decimal, locked: Decimal) {
        let mut balances = self.balances.write();
        balances.retain(|b| !b.currency.eq_ignore_ascii_case(currency));
        balances.push(Balance {
            currency: currency.to_uppercase(),
            available,
            locked,
            avg_buy_price: None,
        });
    }

    pub fn script(&self, behavior: PlaceBehavior) {
        self.place_script.write().push_back(behavior);
    }

    pub fn placed_count(&self) -> usize {
        self.placed.read().len()
    }

    fn fill_price_for(&self, request: &OrderRequest) -> Decimal {
        request
            .price
            .or_else(|| self.tickers.read().get(&normalize_market(&request.market)).copied())
            .unwrap_or(dec!(100))
    }

    fn requested_quantity(&self, request: &OrderRequest, fill_price: Decimal) -> Decimal {
        if let Some(q) = request.quantity {
            return q;
        }
        match (request.side, request.amount) {
            (Side::Buy, Some(amount)) if fill_price > Decimal::ZERO => amount / fill_price,
            _ => Decimal::ZERO,
        }
    }
}

#[async_trait]
impl ExchangeApi for MockExchange {
    async fn get_candles(
        &self,
        market: &str,
        _interval: &str,
        count: u32,
    ) -> Result<Vec<Candle>, ExchangeError> {
        if *self.data_outage.read() {
            return Err(ExchangeError::Transport("mock outage".into()));
        }
        let candles = self.candles.read();
        let series = candles
            .get(&normalize_market(market))
            .cloned()
            .unwrap_or_default();
        let start = series.len().saturating_sub(count as usize);
        Ok(series[start..].to_vec())
    }

    async fn get_ticker(&self, market: &str) -> Result<Ticker, ExchangeError> {
        if *self.data_outage.read() {
            return Err(ExchangeError::Transport("mock outage".into()));
        }
        let market = normalize_market(market);
        let price = self
            .tickers
            .read()
            .get(&market)
            .copied()
            .ok_or_else(|| ExchangeError::Transport(format!("no ticker for {market}")))?;
        Ok(Ticker {
            market,
            last_price: price,
        })
    }

    async fn get_orderbook(&self, market: &str, _depth: usize) -> Result<Orderbook, ExchangeError> {
        if *self.data_outage.read() {
            return Err(ExchangeError::Transport("mock outage".into()));
        }
        let market = normalize_market(market);
        self.orderbooks
            .read()
            .get(&market)
            .cloned()
            .ok_or_else(|| ExchangeError::Transport(format!("no orderbook for {market}")))
    }

    async fn get_balances(&self) -> Result<Vec<Balance>, ExchangeError> {
        if *self.data_outage.read() {
            return Err(ExchangeError::Transport("mock outage".into()));
        }
        Ok(self.balances.read().clone())
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<String, ExchangeError> {
        let behavior = self
            .place_script
            .write()
            .pop_front()
            .unwrap_or(PlaceBehavior::FillAll);

        self.placed.write().push(request.clone());

        match behavior {
            PlaceBehavior::Reject(msg) => return Err(ExchangeError::Rejected(msg)),
            PlaceBehavior::TransportFail(msg) => return Err(ExchangeError::Transport(msg)),
            _ => {}
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let order_id = format!("{}:{}", normalize_market(&request.market).replace('-', ""), id);

        let fill_price = self.fill_price_for(request);
        let requested = self.requested_quantity(request, fill_price);

        let snapshot = match behavior {
            PlaceBehavior::FillAll => OrderSnapshot {
                order_id: order_id.clone(),
                state: OrderState::Done,
                price: request.price,
                avg_fill_price: Some(fill_price),
                executed_volume: requested,
                remaining_volume: Decimal::ZERO,
                paid_fee: fill_price * requested * dec!(0.0005),
            },
            PlaceBehavior::FillPartial(fraction) => {
                let executed = requested * fraction;
                OrderSnapshot {
                    order_id: order_id.clone(),
                    state: OrderState::Done,
                    price: request.price,
                    avg_fill_price: Some(fill_price),
                    executed_volume: executed,
                    remaining_volume: requested - executed,
                    paid_fee: fill_price * executed * dec!(0.0005),
                }
            }
            PlaceBehavior::StayOpen => OrderSnapshot {
                order_id: order_id.clone(),
                state: OrderState::Wait,
                price: request.price,
                avg_fill_price: None,
                executed_volume: Decimal::ZERO,
                remaining_volume: requested,
                paid_fee: Decimal::ZERO,
            },
            PlaceBehavior::Reject(_) | PlaceBehavior::TransportFail(_) => unreachable!(),
        };

        self.orders.write().insert(order_id.clone(), snapshot);
        Ok(order_id)
    }

    async fn get_order(&self, order_id: &str) -> Result<OrderSnapshot, ExchangeError> {
        self.orders
            .read()
            .get(order_id)
            .cloned()
            .ok_or_else(|| ExchangeError::Transport(format!("unknown order {order_id}")))
    }

    async fn cancel_order(&self, order_id: &str) -> Result<(), ExchangeError> {
        let mut orders = self.orders.write();
        match orders.get_mut(order_id) {
            Some(snapshot) if snapshot.state == OrderState::Wait => {
                snapshot.state = OrderState::Cancel;
                Ok(())
            }
            Some(_) => Ok(()),
            None => Err(ExchangeError::Rejected(format!("unknown order {order_id}"))),
        }
    }
}
