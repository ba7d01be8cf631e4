// =============================================================================
// Parameter optimizer — bounded, audited writes suggested by an external
// reasoning service
// =============================================================================
//
// Once a day (local midnight + 1 h) the optimizer reads recent trade history
// and asks an opaque oracle for parameter suggestions. A suggestion is
// applied only when every guardrail holds:
//   (a) within ±20 % of the current value
//   (b) trade history spans at least 30 days
//   (c) oracle confidence at least 0.9
//   (d) no accepted write for the same key in the last 7 days
// Every accept/reject decision is appended to the audit log.
// =============================================================================

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config_store::{ConfigStore, KEY_OPTIMIZER_ENABLED};
use crate::execution::TradeRecord;
use crate::persistence::Repositories;

const MAX_RELATIVE_CHANGE: f64 = 0.20;
const MIN_HISTORY_DAYS: i64 = 30;
const MIN_CONFIDENCE: f64 = 0.9;
const KEY_WRITE_QUIET_DAYS: i64 = 7;
/// Trades fed to the oracle per run.
const HISTORY_LIMIT: usize = 1000;

/// One proposed parameter change from the oracle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterSuggestion {
    pub key: String,
    pub value: f64,
    pub confidence: f64,
}

/// The opaque reasoning service.
#[async_trait]
pub trait ParameterOracle: Send + Sync {
    async fn suggest(&self, trades: &[TradeRecord]) -> anyhow::Result<Vec<ParameterSuggestion>>;
}

/// One audited accept/reject decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerAuditEntry {
    pub key: String,
    pub current_value: String,
    pub suggested_value: String,
    pub confidence: f64,
    pub accepted: bool,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

pub struct Optimizer {
    oracle: Arc<dyn ParameterOracle>,
    config: Arc<ConfigStore>,
    repos: Arc<Repositories>,
}

impl Optimizer {
    pub fn new(
        oracle: Arc<dyn ParameterOracle>,
        config: Arc<ConfigStore>,
        repos: Arc<Repositories>,
    ) -> Self {
        Self {
            oracle,
            config,
            repos,
        }
    }

    /// One optimization pass. Returns how many suggestions were applied.
    pub async fn run_once(&self) -> anyhow::Result<usize> {
        if !self.config.get_bool(KEY_OPTIMIZER_ENABLED, false) {
            debug!("optimizer disabled, skipping run");
            return Ok(0);
        }

        // Guardrail (b): enough history to trust aggregate statistics.
        let span_days = match self.repos.trades.earliest_created_at().await? {
            Some(first) => (Utc::now() - first).num_days(),
            None => 0,
        };
        if span_days < MIN_HISTORY_DAYS {
            info!(span_days, "trade history too short, optimizer pass skipped");
            return Ok(0);
        }

        let trades = self.repos.trades.recent(HISTORY_LIMIT).await?;
        let suggestions = self.oracle.suggest(&trades).await?;
        info!(count = suggestions.len(), "oracle returned suggestions");

        let mut applied = 0;
        for suggestion in suggestions {
            if self.apply(&suggestion).await? {
                applied += 1;
            }
        }
        Ok(applied)
    }

    /// Apply one suggestion if every guardrail holds; audit the decision
    /// either way.
    async fn apply(&self, suggestion: &ParameterSuggestion) -> anyhow::Result<bool> {
        let current_raw = self.config.get(&suggestion.key, "");
        let verdict = self.evaluate(suggestion, &current_raw).await?;

        let accepted = verdict.is_none();
        let entry = OptimizerAuditEntry {
            key: suggestion.key.clone(),
            current_value: current_raw.clone(),
            suggested_value: suggestion.value.to_string(),
            confidence: suggestion.confidence,
            accepted,
            reason: verdict.clone().unwrap_or_else(|| "within bounds".to_string()),
            created_at: Utc::now(),
        };
        self.repos.optimizer_audit.insert(&entry).await?;

        match verdict {
            Some(reason) => {
                debug!(key = %suggestion.key, reason = %reason, "suggestion rejected");
                Ok(false)
            }
            None => {
                self.config
                    .set_with_meta(
                        &suggestion.key,
                        &suggestion.value.to_string(),
                        Some("strategy"),
                        Some("optimizer-adjusted"),
                    )
                    .await?;
                info!(
                    key = %suggestion.key,
                    from = %current_raw,
                    to = suggestion.value,
                    confidence = suggestion.confidence,
                    "parameter adjusted"
                );
                Ok(true)
            }
        }
    }

    /// `None` means acceptable; `Some(reason)` names the violated guardrail.
    async fn evaluate(
        &self,
        suggestion: &ParameterSuggestion,
        current_raw: &str,
    ) -> anyhow::Result<Option<String>> {
        // Guardrail (c): confidence floor.
        if suggestion.confidence < MIN_CONFIDENCE {
            return Ok(Some(format!(
                "confidence {:.2} below {MIN_CONFIDENCE}",
                suggestion.confidence
            )));
        }

        // Guardrail (a): bounded relative change against the current value.
        let current: f64 = match current_raw.trim().parse() {
            Ok(v) => v,
            Err(_) => {
                return Ok(Some("current value missing or not numeric".to_string()));
            }
        };
        if current == 0.0 {
            return Ok(Some("current value is zero, relative bound undefined".to_string()));
        }
        let relative = ((suggestion.value - current) / current).abs();
        if relative > MAX_RELATIVE_CHANGE {
            return Ok(Some(format!(
                "change {:.1}% exceeds ±{:.0}%",
                relative * 100.0,
                MAX_RELATIVE_CHANGE * 100.0
            )));
        }

        // Guardrail (d): quiet period per key.
        if let Some(last) = self
            .repos
            .optimizer_audit
            .last_accepted_at(&suggestion.key)
            .await?
        {
            if Utc::now() - last < Duration::days(KEY_WRITE_QUIET_DAYS) {
                return Ok(Some(format!(
                    "key written {} days ago, quiet period is {KEY_WRITE_QUIET_DAYS} days",
                    (Utc::now() - last).num_days()
                )));
            }
        }

        Ok(None)
    }
}

// ---------------------------------------------------------------------------
// HTTP-backed oracle
// ---------------------------------------------------------------------------

/// Talks to the external reasoning service over HTTP. The payload is a small
/// aggregate of the trade history; the response is the suggestion list.
pub struct ReasoningServiceOracle {
    client: reqwest::Client,
    url: String,
}

impl ReasoningServiceOracle {
    pub fn from_env() -> Option<Self> {
        let url = std::env::var("REASONING_SERVICE_URL").ok()?;
        Some(Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(30))
                .build()
                .expect("failed to build oracle client"),
            url,
        })
    }
}

#[async_trait]
impl ParameterOracle for ReasoningServiceOracle {
    async fn suggest(&self, trades: &[TradeRecord]) -> anyhow::Result<Vec<ParameterSuggestion>> {
        use rust_decimal::prelude::ToPrimitive;

        let wins = trades
            .iter()
            .filter(|t| t.pnl.is_some_and(|p| p > rust_decimal::Decimal::ZERO))
            .count();
        let realized: f64 = trades
            .iter()
            .filter_map(|t| t.pnl.and_then(|p| p.to_f64()))
            .sum();

        let payload = serde_json::json!({
            "trade_count": trades.len(),
            "wins": wins,
            "realized_pnl": realized,
            "by_strategy": summarize_by_strategy(trades),
        });

        let resp = self
            .client
            .post(&self.url)
            .json(&payload)
            .send()
            .await?
            .error_for_status()?;

        let suggestions: Vec<ParameterSuggestion> = resp.json().await?;
        Ok(suggestions)
    }
}

fn summarize_by_strategy(trades: &[TradeRecord]) -> serde_json::Value {
    use rust_decimal::prelude::ToPrimitive;
    use std::collections::HashMap;

    let mut agg: HashMap<&'static str, (usize, f64)> = HashMap::new();
    for trade in trades {
        let entry = agg.entry(trade.strategy.as_str()).or_insert((0, 0.0));
        entry.0 += 1;
        entry.1 += trade.pnl.and_then(|p| p.to_f64()).unwrap_or(0.0);
    }
    serde_json::json!(agg
        .into_iter()
        .map(|(k, (n, pnl))| (k.to_string(), serde_json::json!({ "trades": n, "pnl": pnl })))
        .collect::<std::collections::HashMap<_, _>>())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::database::memory_pool;
    use crate::types::{OrderType, Side, StrategyCode};
    use parking_lot::Mutex;
    use rust_decimal_macros::dec;

    struct StaticOracle {
        suggestions: Mutex<Vec<ParameterSuggestion>>,
    }

    #[async_trait]
    impl ParameterOracle for StaticOracle {
        async fn suggest(&self, _trades: &[TradeRecord]) -> anyhow::Result<Vec<ParameterSuggestion>> {
            Ok(self.suggestions.lock().clone())
        }
    }

    fn old_trade(days_ago: i64) -> TradeRecord {
        TradeRecord {
            order_id: format!("o-{days_ago}"),
            market: "BTC-USDT".into(),
            side: Side::Buy,
            order_type: OrderType::Limit,
            price: dec!(100),
            quantity: dec!(1),
            total_amount: dec!(100),
            fee: dec!(0.05),
            slippage_percent: None,
            is_partial_fill: false,
            pnl: Some(dec!(10)),
            pnl_percent: Some(1.0),
            strategy: StrategyCode::Breakout,
            regime: None,
            confidence: 60.0,
            reason: "test".into(),
            simulated: false,
            created_at: Utc::now() - Duration::days(days_ago),
        }
    }

    struct Setup {
        optimizer: Optimizer,
        config: Arc<ConfigStore>,
        repos: Arc<Repositories>,
    }

    async fn setup(suggestions: Vec<ParameterSuggestion>) -> Setup {
        let pool = memory_pool().await;
        let repos = Arc::new(Repositories::new(pool.clone()));
        let config = Arc::new(
            ConfigStore::load(crate::persistence::ConfigRepository::new(pool))
                .await
                .unwrap(),
        );
        config.set(KEY_OPTIMIZER_ENABLED, "true").await.unwrap();
        config
            .set("strategy.breakout.take_profit_pct", "4.0")
            .await
            .unwrap();

        let oracle = Arc::new(StaticOracle {
            suggestions: Mutex::new(suggestions),
        });
        let optimizer = Optimizer::new(oracle, config.clone(), repos.clone());
        Setup {
            optimizer,
            config,
            repos,
        }
    }

    fn suggestion(key: &str, value: f64, confidence: f64) -> ParameterSuggestion {
        ParameterSuggestion {
            key: key.into(),
            value,
            confidence,
        }
    }

    #[tokio::test]
    async fn short_history_skips_the_pass() {
        let s = setup(vec![suggestion("strategy.breakout.take_profit_pct", 4.2, 0.95)]).await;
        s.repos.trades.insert(&old_trade(5)).await.unwrap();

        assert_eq!(s.optimizer.run_once().await.unwrap(), 0);
        assert_eq!(s.config.get("strategy.breakout.take_profit_pct", ""), "4.0");
    }

    #[tokio::test]
    async fn in_bounds_suggestion_is_applied_and_audited() {
        let s = setup(vec![suggestion("strategy.breakout.take_profit_pct", 4.4, 0.95)]).await;
        s.repos.trades.insert(&old_trade(40)).await.unwrap();

        assert_eq!(s.optimizer.run_once().await.unwrap(), 1);
        assert_eq!(s.config.get("strategy.breakout.take_profit_pct", ""), "4.4");
        assert!(s
            .repos
            .optimizer_audit
            .last_accepted_at("strategy.breakout.take_profit_pct")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn out_of_band_change_is_rejected() {
        // 4.0 -> 6.0 is +50%, outside ±20%.
        let s = setup(vec![suggestion("strategy.breakout.take_profit_pct", 6.0, 0.95)]).await;
        s.repos.trades.insert(&old_trade(40)).await.unwrap();

        assert_eq!(s.optimizer.run_once().await.unwrap(), 0);
        assert_eq!(s.config.get("strategy.breakout.take_profit_pct", ""), "4.0");
    }

    #[tokio::test]
    async fn low_confidence_is_rejected() {
        let s = setup(vec![suggestion("strategy.breakout.take_profit_pct", 4.2, 0.8)]).await;
        s.repos.trades.insert(&old_trade(40)).await.unwrap();

        assert_eq!(s.optimizer.run_once().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn quiet_period_blocks_repeat_writes() {
        let s = setup(vec![suggestion("strategy.breakout.take_profit_pct", 4.2, 0.95)]).await;
        s.repos.trades.insert(&old_trade(40)).await.unwrap();

        // A write accepted two days ago is still inside the quiet period.
        s.repos
            .optimizer_audit
            .insert(&OptimizerAuditEntry {
                key: "strategy.breakout.take_profit_pct".into(),
                current_value: "4.0".into(),
                suggested_value: "4.1".into(),
                confidence: 0.95,
                accepted: true,
                reason: "within bounds".into(),
                created_at: Utc::now() - Duration::days(2),
            })
            .await
            .unwrap();

        assert_eq!(s.optimizer.run_once().await.unwrap(), 0);
        assert_eq!(s.config.get("strategy.breakout.take_profit_pct", ""), "4.0");
    }

    #[tokio::test]
    async fn unknown_key_is_rejected_not_created() {
        let s = setup(vec![suggestion("strategy.nonexistent.knob", 1.0, 0.99)]).await;
        s.repos.trades.insert(&old_trade(40)).await.unwrap();

        assert_eq!(s.optimizer.run_once().await.unwrap(), 0);
        assert_eq!(s.config.get("strategy.nonexistent.knob", "absent"), "absent");
    }

    #[tokio::test]
    async fn disabled_optimizer_does_nothing() {
        let s = setup(vec![suggestion("strategy.breakout.take_profit_pct", 4.2, 0.95)]).await;
        s.config.set(KEY_OPTIMIZER_ENABLED, "false").await.unwrap();
        s.repos.trades.insert(&old_trade(40)).await.unwrap();

        assert_eq!(s.optimizer.run_once().await.unwrap(), 0);
    }
}
