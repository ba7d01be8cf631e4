// =============================================================================
// Configuration store — durable key/value mapping with a read-through cache
// =============================================================================
//
// Reads come from the in-memory cache and never touch the database; writes go
// store-then-cache under the write lock so readers observe either the old or
// the new value, never a torn state. Typed accessors fall back to the default
// on parse failure (logged, not thrown). There is no TTL — invalidation is
// the write itself.
// =============================================================================

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::persistence::ConfigRepository;

// Well-known keys.
pub const KEY_TRADING_ENABLED: &str = "trading.enabled";
pub const KEY_REGIME_DETECTOR: &str = "regime.detector.type";
pub const KEY_DAILY_LOSS_LIMIT: &str = "risk.daily_loss_limit";
pub const KEY_MAX_CONCURRENT_POSITIONS: &str = "risk.max_concurrent_positions";
pub const KEY_MIN_ORDER_AMOUNT: &str = "risk.min_order_amount";
pub const KEY_MIN_HOLDING_SECS: &str = "risk.min_holding_secs";
pub const KEY_TRADE_COOLDOWN_SECS: &str = "risk.trade_cooldown_secs";
pub const KEY_ORDER_AMOUNT: &str = "order.amount";
pub const KEY_OPTIMIZER_ENABLED: &str = "optimizer.enabled";

/// One persisted configuration row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigEntry {
    pub key: String,
    pub value: String,
    pub category: Option<String>,
    pub description: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Process-wide configuration store.
pub struct ConfigStore {
    repo: ConfigRepository,
    cache: RwLock<HashMap<String, ConfigEntry>>,
}

impl ConfigStore {
    /// Build the store and warm the cache from the database.
    pub async fn load(repo: ConfigRepository) -> anyhow::Result<Self> {
        let entries = repo.load_all().await?;
        let mut cache = HashMap::with_capacity(entries.len());
        for entry in entries {
            cache.insert(entry.key.clone(), entry);
        }
        info!(entries = cache.len(), "configuration cache warmed");
        Ok(Self {
            repo,
            cache: RwLock::new(cache),
        })
    }

    // -------------------------------------------------------------------------
    // Reads (cache only)
    // -------------------------------------------------------------------------

    pub fn get(&self, key: &str, default: &str) -> String {
        self.cache
            .read()
            .get(key)
            .map(|e| e.value.clone())
            .unwrap_or_else(|| default.to_string())
    }

    pub fn entry(&self, key: &str) -> Option<ConfigEntry> {
        self.cache.read().get(key).cloned()
    }

    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.cache.read().get(key) {
            None => default,
            Some(e) => match e.value.trim().to_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => true,
                "false" | "0" | "no" | "off" => false,
                other => {
                    warn!(key, value = other, "config value is not a bool, using default");
                    default
                }
            },
        }
    }

    pub fn get_f64(&self, key: &str, default: f64) -> f64 {
        match self.cache.read().get(key) {
            None => default,
            Some(e) => e.value.trim().parse().unwrap_or_else(|_| {
                warn!(key, value = %e.value, "config value is not a number, using default");
                default
            }),
        }
    }

    pub fn get_i64(&self, key: &str, default: i64) -> i64 {
        match self.cache.read().get(key) {
            None => default,
            Some(e) => e.value.trim().parse().unwrap_or_else(|_| {
                warn!(key, value = %e.value, "config value is not an integer, using default");
                default
            }),
        }
    }

    pub fn list_by_category(&self, category: &str) -> Vec<ConfigEntry> {
        let mut entries: Vec<ConfigEntry> = self
            .cache
            .read()
            .values()
            .filter(|e| e.category.as_deref() == Some(category))
            .cloned()
            .collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        entries
    }

    pub fn all(&self) -> Vec<ConfigEntry> {
        let mut entries: Vec<ConfigEntry> = self.cache.read().values().cloned().collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        entries
    }

    // -------------------------------------------------------------------------
    // Writes (store, then cache)
    // -------------------------------------------------------------------------

    pub async fn set(&self, key: &str, value: &str) -> anyhow::Result<()> {
        self.set_with_meta(key, value, None, None).await
    }

    pub async fn set_with_meta(
        &self,
        key: &str,
        value: &str,
        category: Option<&str>,
        description: Option<&str>,
    ) -> anyhow::Result<()> {
        let entry = ConfigEntry {
            key: key.to_string(),
            value: value.to_string(),
            category: category.map(str::to_string),
            description: description.map(str::to_string),
            updated_at: Utc::now(),
        };
        self.repo.upsert(&entry).await?;

        let mut cache = self.cache.write();
        // Preserve existing metadata when the write carries none.
        let merged = match cache.get(key) {
            Some(prev) if entry.category.is_none() => ConfigEntry {
                category: prev.category.clone(),
                description: entry.description.clone().or_else(|| prev.description.clone()),
                ..entry
            },
            _ => entry,
        };
        cache.insert(key.to_string(), merged);
        Ok(())
    }

    pub async fn delete(&self, key: &str) -> anyhow::Result<()> {
        self.repo.delete(key).await?;
        self.cache.write().remove(key);
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::database::memory_pool;

    async fn store() -> ConfigStore {
        let repo = ConfigRepository::new(memory_pool().await);
        ConfigStore::load(repo).await.unwrap()
    }

    #[tokio::test]
    async fn get_returns_default_for_missing_key() {
        let s = store().await;
        assert_eq!(s.get("nope", "fallback"), "fallback");
        assert!(!s.get_bool(KEY_TRADING_ENABLED, false));
    }

    #[tokio::test]
    async fn set_then_get_roundtrip() {
        let s = store().await;
        s.set(KEY_TRADING_ENABLED, "true").await.unwrap();
        assert!(s.get_bool(KEY_TRADING_ENABLED, false));

        s.set(KEY_DAILY_LOSS_LIMIT, "-30000").await.unwrap();
        assert_eq!(s.get_f64(KEY_DAILY_LOSS_LIMIT, 0.0), -30000.0);
        assert_eq!(s.get_i64(KEY_MAX_CONCURRENT_POSITIONS, 6), 6);
    }

    #[tokio::test]
    async fn parse_failure_falls_back_to_default() {
        let s = store().await;
        s.set("risk.daily_loss_limit", "not-a-number").await.unwrap();
        assert_eq!(s.get_f64("risk.daily_loss_limit", -30000.0), -30000.0);

        s.set("trading.enabled", "maybe").await.unwrap();
        assert!(s.get_bool("trading.enabled", true));
    }

    #[tokio::test]
    async fn writes_survive_a_reload() {
        let pool = memory_pool().await;
        {
            let s = ConfigStore::load(ConfigRepository::new(pool.clone()))
                .await
                .unwrap();
            s.set_with_meta("grid.state.BTC-USDT", "{}", Some("strategy"), None)
                .await
                .unwrap();
        }
        let s2 = ConfigStore::load(ConfigRepository::new(pool)).await.unwrap();
        assert_eq!(s2.get("grid.state.BTC-USDT", ""), "{}");
        assert_eq!(s2.list_by_category("strategy").len(), 1);
    }

    #[tokio::test]
    async fn delete_removes_from_cache_and_store() {
        let s = store().await;
        s.set("tmp.key", "1").await.unwrap();
        s.delete("tmp.key").await.unwrap();
        assert_eq!(s.get("tmp.key", "gone"), "gone");
    }

    #[tokio::test]
    async fn metadata_preserved_on_plain_set() {
        let s = store().await;
        s.set_with_meta("k", "1", Some("cat"), Some("desc"))
            .await
            .unwrap();
        s.set("k", "2").await.unwrap();
        let entry = s.entry("k").unwrap();
        assert_eq!(entry.value, "2");
        assert_eq!(entry.category.as_deref(), Some("cat"));
    }
}
