// =============================================================================
// Market data adapter — REST-pulled candles, tickers, orderbooks, balances
// =============================================================================
//
// Candles are retained in a per-market ring of the most recent candles and
// are never mutated after insertion. Every transport failure at this boundary
// is recorded in the global API-error window that feeds the risk gate's
// market-condition check and the global circuit breaker.
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::exchange::{Balance, ExchangeApi, ExchangeError, Orderbook};
use crate::risk::circuit_breaker::ApiErrorWindow;
use crate::types::normalize_market;

/// Candle interval the engine analyzes on.
pub const ANALYSIS_INTERVAL: &str = "1m";
/// How many candles each refresh requests.
pub const CANDLE_FETCH_COUNT: u32 = 200;
/// Ring capacity per market.
const MAX_CANDLES: usize = 200;

// ---------------------------------------------------------------------------
// Candle
// ---------------------------------------------------------------------------

/// A single OHLCV candle, oldest-first in every slice the engine passes
/// around. Prices and volume are decimals; indicator math converts to `f64`
/// through the accessor methods.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

impl Candle {
    pub fn open_f(&self) -> f64 {
        self.open.to_f64().unwrap_or(0.0)
    }

    pub fn high_f(&self) -> f64 {
        self.high.to_f64().unwrap_or(0.0)
    }

    pub fn low_f(&self) -> f64 {
        self.low.to_f64().unwrap_or(0.0)
    }

    pub fn close_f(&self) -> f64 {
        self.close.to_f64().unwrap_or(0.0)
    }

    pub fn volume_f(&self) -> f64 {
        self.volume.to_f64().unwrap_or(0.0)
    }

    /// High-low range as a percentage of the close.
    pub fn range_percent(&self) -> f64 {
        let close = self.close_f();
        if close <= 0.0 {
            return 0.0;
        }
        (self.high_f() - self.low_f()) / close * 100.0
    }
}

// ---------------------------------------------------------------------------
// Candle cache
// ---------------------------------------------------------------------------

/// Thread-safe ring of the most recent candles per market. Existing entries
/// are append-only; refreshes only add candles newer than the last retained
/// timestamp.
pub struct CandleCache {
    rings: RwLock<HashMap<String, VecDeque<Candle>>>,
    max_candles: usize,
}

impl CandleCache {
    pub fn new(max_candles: usize) -> Self {
        Self {
            rings: RwLock::new(HashMap::new()),
            max_candles,
        }
    }

    /// Merge a freshly fetched, oldest-first batch into the ring.
    pub fn extend(&self, market: &str, batch: Vec<Candle>) {
        let market = normalize_market(market);
        let mut map = self.rings.write();
        let ring = map
            .entry(market)
            .or_insert_with(|| VecDeque::with_capacity(self.max_candles));

        let last_ts = ring.back().map(|c| c.timestamp);
        for candle in batch {
            if last_ts.map_or(true, |ts| candle.timestamp > ts) {
                ring.push_back(candle);
            }
        }
        while ring.len() > self.max_candles {
            ring.pop_front();
        }
    }

    /// The most recent `count` candles, oldest first.
    pub fn recent(&self, market: &str, count: usize) -> Vec<Candle> {
        let market = normalize_market(market);
        let map = self.rings.read();
        match map.get(&market) {
            Some(ring) => {
                let start = ring.len().saturating_sub(count);
                ring.iter().skip(start).cloned().collect()
            }
            None => Vec::new(),
        }
    }

    pub fn len(&self, market: &str) -> usize {
        let map = self.rings.read();
        map.get(&normalize_market(market)).map_or(0, VecDeque::len)
    }
}

// ---------------------------------------------------------------------------
// MarketDataService
// ---------------------------------------------------------------------------

/// Front door for all market data reads. Wraps the exchange adapter, owns the
/// candle cache, and books transport failures into the API-error window.
pub struct MarketDataService {
    exchange: Arc<dyn ExchangeApi>,
    candles: CandleCache,
    api_errors: Arc<ApiErrorWindow>,
}

impl MarketDataService {
    pub fn new(exchange: Arc<dyn ExchangeApi>, api_errors: Arc<ApiErrorWindow>) -> Self {
        Self {
            exchange,
            candles: CandleCache::new(MAX_CANDLES),
            api_errors,
        }
    }

    fn record_if_transport(&self, err: &ExchangeError) {
        if matches!(err, ExchangeError::Transport(_)) {
            self.api_errors.record();
        }
    }

    /// Fetch the latest candles for `market` and merge them into the cache.
    /// Returns the cached series after the merge.
    pub async fn refresh_candles(&self, market: &str) -> Result<Vec<Candle>, ExchangeError> {
        match self
            .exchange
            .get_candles(market, ANALYSIS_INTERVAL, CANDLE_FETCH_COUNT)
            .await
        {
            Ok(batch) => {
                debug!(market, fetched = batch.len(), "candles refreshed");
                self.candles.extend(market, batch);
                Ok(self.candles.recent(market, MAX_CANDLES))
            }
            Err(e) => {
                self.record_if_transport(&e);
                warn!(market, error = %e, "candle refresh failed");
                Err(e)
            }
        }
    }

    /// Cached candles without a network round-trip.
    pub fn cached_candles(&self, market: &str, count: usize) -> Vec<Candle> {
        self.candles.recent(market, count)
    }

    pub async fn last_price(&self, market: &str) -> Result<Decimal, ExchangeError> {
        match self.exchange.get_ticker(market).await {
            Ok(t) => Ok(t.last_price),
            Err(e) => {
                self.record_if_transport(&e);
                Err(e)
            }
        }
    }

    pub async fn orderbook(&self, market: &str, depth: usize) -> Result<Orderbook, ExchangeError> {
        match self.exchange.get_orderbook(market, depth).await {
            Ok(ob) => Ok(ob),
            Err(e) => {
                self.record_if_transport(&e);
                Err(e)
            }
        }
    }

    pub async fn balances(&self) -> Result<Vec<Balance>, ExchangeError> {
        match self.exchange.get_balances().await {
            Ok(b) => Ok(b),
            Err(e) => {
                self.record_if_transport(&e);
                Err(e)
            }
        }
    }

    /// Balance for one currency; zeroes when the exchange reports nothing.
    pub async fn balance(&self, currency: &str) -> Result<Balance, ExchangeError> {
        let balances = self.balances().await?;
        Ok(balances
            .into_iter()
            .find(|b| b.currency.eq_ignore_ascii_case(currency))
            .unwrap_or(Balance {
                currency: currency.to_uppercase(),
                available: Decimal::ZERO,
                locked: Decimal::ZERO,
                avg_buy_price: None,
            }))
    }

    /// One-minute volatility: range of the latest cached candle as a
    /// percentage of its close.
    pub fn volatility_1m(&self, market: &str) -> f64 {
        self.candles
            .recent(market, 1)
            .last()
            .map(Candle::range_percent)
            .unwrap_or(0.0)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn candle(ts_secs: i64, close: Decimal) -> Candle {
        Candle {
            timestamp: DateTime::from_timestamp(ts_secs, 0).unwrap(),
            open: close,
            high: close + dec!(1),
            low: close - dec!(1),
            close,
            volume: dec!(10),
        }
    }

    #[test]
    fn cache_append_only_ignores_older() {
        let cache = CandleCache::new(10);
        cache.extend("BTC-USDT", vec![candle(60, dec!(100)), candle(120, dec!(101))]);
        // Re-fetch overlaps: only the strictly newer candle lands.
        cache.extend(
            "BTC-USDT",
            vec![candle(60, dec!(999)), candle(120, dec!(999)), candle(180, dec!(102))],
        );

        let got = cache.recent("BTC-USDT", 10);
        assert_eq!(got.len(), 3);
        assert_eq!(got[0].close, dec!(100));
        assert_eq!(got[1].close, dec!(101));
        assert_eq!(got[2].close, dec!(102));
    }

    #[test]
    fn cache_trims_to_capacity() {
        let cache = CandleCache::new(3);
        let batch: Vec<Candle> = (0..6).map(|i| candle(i * 60, dec!(100) + Decimal::from(i))).collect();
        cache.extend("ETH-USDT", batch);
        let got = cache.recent("ETH-USDT", 10);
        assert_eq!(got.len(), 3);
        assert_eq!(got[0].close, dec!(103));
    }

    #[test]
    fn cache_normalizes_market_keys() {
        let cache = CandleCache::new(5);
        cache.extend("btc/usdt", vec![candle(60, dec!(1))]);
        assert_eq!(cache.len("BTC-USDT"), 1);
    }

    #[test]
    fn candle_range_percent() {
        let c = Candle {
            timestamp: Utc::now(),
            open: dec!(100),
            high: dec!(102),
            low: dec!(100),
            close: dec!(100),
            volume: dec!(1),
        };
        assert!((c.range_percent() - 2.0).abs() < 1e-9);
    }
}
