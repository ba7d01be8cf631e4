// =============================================================================
// DCA engine — interval accumulation into weakness
// =============================================================================
//
// Buys a fixed tranche once per interval, only while price sits below the
// medium moving average (accumulate into weakness, not strength). Last-buy
// timestamps are persisted per market under `dca.last_buy_time.<market>` and
// restored lazily, so restarts never double-buy inside an interval.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use tracing::warn;

use crate::config_store::ConfigStore;
use crate::strategy::{SignalAction, Strategy, StrategyContext, TradingSignal};
use crate::types::{normalize_market, Side, StrategyCode};

/// Moving-average window for the weakness filter.
const MA_LEN: usize = 20;
/// Default buy interval between tranches.
const DEFAULT_INTERVAL_SECS: i64 = 86_400;

fn last_buy_key(market: &str) -> String {
    format!("dca.last_buy_time.{}", normalize_market(market))
}

pub struct DcaStrategy {
    config: Arc<ConfigStore>,
    last_buy: RwLock<HashMap<String, Option<DateTime<Utc>>>>,
}

impl DcaStrategy {
    pub fn new(config: Arc<ConfigStore>) -> Self {
        Self {
            config,
            last_buy: RwLock::new(HashMap::new()),
        }
    }

    /// Read the cached last-buy time, restoring from the config store on the
    /// first miss per market.
    fn last_buy_time(&self, market: &str) -> Option<DateTime<Utc>> {
        let market = normalize_market(market);
        if let Some(cached) = self.last_buy.read().get(&market) {
            return *cached;
        }

        let restored = {
            let raw = self.config.get(&last_buy_key(&market), "");
            if raw.is_empty() {
                None
            } else {
                match raw.parse::<DateTime<Utc>>() {
                    Ok(ts) => Some(ts),
                    Err(e) => {
                        warn!(market = %market, error = %e, "unparseable dca last-buy timestamp");
                        None
                    }
                }
            }
        };
        self.last_buy.write().insert(market, restored);
        restored
    }

    fn interval_secs(&self) -> i64 {
        self.config
            .get_i64("strategy.dca.interval_secs", DEFAULT_INTERVAL_SECS)
            .max(60)
    }
}

#[async_trait]
impl Strategy for DcaStrategy {
    fn code(&self) -> StrategyCode {
        StrategyCode::Dca
    }

    fn analyze(&self, ctx: &StrategyContext<'_>) -> TradingSignal {
        let price = ctx.current_price;

        if ctx.candles.len() < MA_LEN {
            return TradingSignal::hold(ctx.market, self.code(), price, "insufficient candles");
        }

        let interval = self.interval_secs();
        if let Some(last) = self.last_buy_time(ctx.market) {
            let elapsed = (Utc::now() - last).num_seconds();
            if elapsed < interval {
                return TradingSignal::hold(
                    ctx.market,
                    self.code(),
                    price,
                    "inside accumulation interval",
                );
            }
        }

        // Weakness filter: only accumulate below the moving average.
        let ma: f64 = ctx.candles[ctx.candles.len() - MA_LEN..]
            .iter()
            .map(|c| c.close_f())
            .sum::<f64>()
            / MA_LEN as f64;
        let ma_dec = Decimal::from_f64(ma).unwrap_or(Decimal::ZERO);
        if ma_dec <= Decimal::ZERO || price >= ma_dec {
            return TradingSignal::hold(ctx.market, self.code(), price, "price above average");
        }

        // Deeper discount, stronger conviction.
        let price_f = rust_decimal::prelude::ToPrimitive::to_f64(&price).unwrap_or(ma);
        let discount_pct = ((ma - price_f) / ma) * 100.0;
        let confidence = (50.0 + discount_pct * 5.0).clamp(40.0, 90.0);

        TradingSignal {
            market: normalize_market(ctx.market),
            action: SignalAction::Buy,
            confidence,
            price,
            reason: format!("dca tranche: {discount_pct:.2}% below {MA_LEN}-bar average"),
            strategy: self.code(),
        }
    }

    async fn on_order_filled(&self, market: &str, side: Side, _price: Decimal) {
        if side != Side::Buy {
            return;
        }
        let market = normalize_market(market);
        let now = Utc::now();
        self.last_buy.write().insert(market.clone(), Some(now));
        if let Err(e) = self
            .config
            .set_with_meta(
                &last_buy_key(&market),
                &now.to_rfc3339(),
                Some("strategy"),
                None,
            )
            .await
        {
            warn!(market = %market, error = %e, "failed to persist dca last-buy time");
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
