// =============================================================================
// Typed repositories over the shared SQLite pool
// =============================================================================
//
// The repository layer is the single source of truth for positions and
// trades. Monetary columns are stored as text and parsed back into decimals;
// timestamps are RFC 3339 text handled by sqlx's chrono support. Writes that
// must land together (position + trade) go through one transaction.
// =============================================================================

use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::debug;

use crate::config_store::ConfigEntry;
use crate::execution::TradeRecord;
use crate::lifecycle::{LifecycleEvent, LifecycleEventType};
use crate::optimizer::OptimizerAuditEntry;
use crate::position::{ExitReason, Position, PositionStatus};
use crate::types::{normalize_market, OrderType, Side, StrategyCode, StrategyGroup};

fn decimal_col(row: &SqliteRow, name: &str) -> Result<Decimal> {
    let raw: String = row.try_get(name)?;
    Decimal::from_str(&raw).with_context(|| format!("column {name} is not a decimal: {raw}"))
}

fn opt_decimal_col(row: &SqliteRow, name: &str) -> Result<Option<Decimal>> {
    let raw: Option<String> = row.try_get(name)?;
    match raw {
        Some(s) => Ok(Some(
            Decimal::from_str(&s).with_context(|| format!("column {name} is not a decimal: {s}"))?,
        )),
        None => Ok(None),
    }
}

// =============================================================================
// Config
// =============================================================================

#[derive(Clone)]
pub struct ConfigRepository {
    pool: SqlitePool,
}

impl ConfigRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn upsert(&self, entry: &ConfigEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO config_entries (key, value, category, description, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                category = COALESCE(excluded.category, config_entries.category),
                description = COALESCE(excluded.description, config_entries.description),
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&entry.key)
        .bind(&entry.value)
        .bind(&entry.category)
        .bind(&entry.description)
        .bind(entry.updated_at)
        .execute(&self.pool)
        .await
        .context("failed to upsert config entry")?;
        Ok(())
    }

    pub async fn get(&self, key: &str) -> Result<Option<ConfigEntry>> {
        let row = sqlx::query("SELECT * FROM config_entries WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| Self::map_row(&r)).transpose()
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM config_entries WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await
            .context("failed to delete config entry")?;
        Ok(())
    }

    pub async fn list_by_category(&self, category: &str) -> Result<Vec<ConfigEntry>> {
        let rows = sqlx::query("SELECT * FROM config_entries WHERE category = ? ORDER BY key")
            .bind(category)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::map_row).collect()
    }

    pub async fn load_all(&self) -> Result<Vec<ConfigEntry>> {
        let rows = sqlx::query("SELECT * FROM config_entries ORDER BY key")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::map_row).collect()
    }

    fn map_row(row: &SqliteRow) -> Result<ConfigEntry> {
        Ok(ConfigEntry {
            key: row.try_get("key")?,
            value: row.try_get("value")?,
            category: row.try_get("category")?,
            description: row.try_get("description")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

// =============================================================================
// Trades
// =============================================================================

#[derive(Clone)]
pub struct TradeRepository {
    pool: SqlitePool,
}

impl TradeRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, trade: &TradeRecord) -> Result<()> {
        Self::insert_with(&self.pool, trade).await
    }

    /// Shared insert body so transactional callers can reuse the statement.
    async fn insert_with<'e, E>(executor: E, trade: &TradeRecord) -> Result<()>
    where
        E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
    {
        sqlx::query(
            r#"
            INSERT INTO trades (
                order_id, market, side, order_type, price, quantity, total_amount,
                fee, slippage_percent, is_partial_fill, pnl, pnl_percent,
                strategy, regime, confidence, reason, simulated, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&trade.order_id)
        .bind(&trade.market)
        .bind(trade.side.to_string())
        .bind(trade.order_type.to_string())
        .bind(trade.price.to_string())
        .bind(trade.quantity.to_string())
        .bind(trade.total_amount.to_string())
        .bind(trade.fee.to_string())
        .bind(trade.slippage_percent)
        .bind(trade.is_partial_fill)
        .bind(trade.pnl.map(|p| p.to_string()))
        .bind(trade.pnl_percent)
        .bind(trade.strategy.to_string())
        .bind(&trade.regime)
        .bind(trade.confidence)
        .bind(&trade.reason)
        .bind(trade.simulated)
        .bind(trade.created_at)
        .execute(executor)
        .await
        .context("failed to insert trade")?;
        Ok(())
    }

    /// Sum of realized PnL recorded at or after `since` (the daily-loss gate
    /// input). Trades without a PnL (entries) contribute nothing.
    pub async fn realized_pnl_since(&self, since: DateTime<Utc>) -> Result<Decimal> {
        let rows = sqlx::query("SELECT pnl FROM trades WHERE created_at >= ? AND pnl IS NOT NULL")
            .bind(since)
            .fetch_all(&self.pool)
            .await?;

        let mut total = Decimal::ZERO;
        for row in &rows {
            if let Some(pnl) = opt_decimal_col(row, "pnl")? {
                total += pnl;
            }
        }
        Ok(total)
    }

    pub async fn recent(&self, limit: usize) -> Result<Vec<TradeRecord>> {
        let rows = sqlx::query("SELECT * FROM trades ORDER BY created_at DESC LIMIT ?")
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::map_row).collect()
    }

    /// Timestamp of the oldest trade on record, if any.
    pub async fn earliest_created_at(&self) -> Result<Option<DateTime<Utc>>> {
        let row = sqlx::query("SELECT MIN(created_at) AS first_at FROM trades")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("first_at").ok())
    }

    /// Most recent BUY trade time for a market.
    pub async fn last_buy_time(&self, market: &str) -> Result<Option<DateTime<Utc>>> {
        let row = sqlx::query(
            "SELECT created_at FROM trades WHERE market = ? AND side = 'BUY' ORDER BY created_at DESC LIMIT 1",
        )
        .bind(normalize_market(market))
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.try_get("created_at")).transpose()?)
    }

    fn map_row(row: &SqliteRow) -> Result<TradeRecord> {
        let side_str: String = row.try_get("side")?;
        let type_str: String = row.try_get("order_type")?;
        let strategy_str: String = row.try_get("strategy")?;

        Ok(TradeRecord {
            order_id: row.try_get("order_id")?,
            market: row.try_get("market")?,
            side: Side::parse(&side_str).unwrap_or(Side::Buy),
            order_type: if type_str == "MARKET" {
                OrderType::Market
            } else {
                OrderType::Limit
            },
            price: decimal_col(row, "price")?,
            quantity: decimal_col(row, "quantity")?,
            total_amount: decimal_col(row, "total_amount")?,
            fee: decimal_col(row, "fee")?,
            slippage_percent: row.try_get("slippage_percent")?,
            is_partial_fill: row.try_get("is_partial_fill")?,
            pnl: opt_decimal_col(row, "pnl")?,
            pnl_percent: row.try_get("pnl_percent")?,
            strategy: StrategyCode::parse(&strategy_str).unwrap_or(StrategyCode::Breakout),
            regime: row.try_get("regime")?,
            confidence: row.try_get("confidence")?,
            reason: row.try_get("reason")?,
            simulated: row.try_get("simulated")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

// =============================================================================
// Positions
// =============================================================================

#[derive(Clone)]
pub struct PositionRepository {
    pool: SqlitePool,
}

impl PositionRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, position: &Position) -> Result<()> {
        Self::insert_with(&self.pool, position).await
    }

    async fn insert_with<'e, E>(executor: E, position: &Position) -> Result<()>
    where
        E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
    {
        sqlx::query(
            r#"
            INSERT INTO positions (
                id, strategy, market, side, status, entry_price, filled_quantity,
                target_quantity, average_exit_price, stop_loss_percent,
                take_profit_percent, trailing_active, trailing_peak_price,
                timeout_at, exit_reason, exit_order_id, last_close_attempt_at,
                close_attempt_count, entry_time, exit_time, realized_pnl,
                realized_pnl_percent
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&position.id)
        .bind(position.strategy.to_string())
        .bind(&position.market)
        .bind(position.side.to_string())
        .bind(position.status.to_string())
        .bind(position.entry_price.to_string())
        .bind(position.filled_quantity.to_string())
        .bind(position.target_quantity.to_string())
        .bind(position.average_exit_price.map(|d| d.to_string()))
        .bind(position.stop_loss_percent)
        .bind(position.take_profit_percent)
        .bind(position.trailing_active)
        .bind(position.trailing_peak_price.map(|d| d.to_string()))
        .bind(position.timeout_at)
        .bind(position.exit_reason.map(|r| r.to_string()))
        .bind(&position.exit_order_id)
        .bind(position.last_close_attempt_at)
        .bind(position.close_attempt_count as i64)
        .bind(position.entry_time)
        .bind(position.exit_time)
        .bind(position.realized_pnl.map(|d| d.to_string()))
        .bind(position.realized_pnl_percent)
        .execute(executor)
        .await
        .context("failed to insert position")?;
        Ok(())
    }

    pub async fn update(&self, position: &Position) -> Result<()> {
        Self::update_with(&self.pool, position).await
    }

    async fn update_with<'e, E>(executor: E, position: &Position) -> Result<()>
    where
        E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
    {
        sqlx::query(
            r#"
            UPDATE positions SET
                status = ?, entry_price = ?, filled_quantity = ?,
                target_quantity = ?, average_exit_price = ?, stop_loss_percent = ?,
                take_profit_percent = ?, trailing_active = ?, trailing_peak_price = ?,
                timeout_at = ?, exit_reason = ?, exit_order_id = ?,
                last_close_attempt_at = ?, close_attempt_count = ?, exit_time = ?,
                realized_pnl = ?, realized_pnl_percent = ?
            WHERE id = ?
            "#,
        )
        .bind(position.status.to_string())
        .bind(position.entry_price.to_string())
        .bind(position.filled_quantity.to_string())
        .bind(position.target_quantity.to_string())
        .bind(position.average_exit_price.map(|d| d.to_string()))
        .bind(position.stop_loss_percent)
        .bind(position.take_profit_percent)
        .bind(position.trailing_active)
        .bind(position.trailing_peak_price.map(|d| d.to_string()))
        .bind(position.timeout_at)
        .bind(position.exit_reason.map(|r| r.to_string()))
        .bind(&position.exit_order_id)
        .bind(position.last_close_attempt_at)
        .bind(position.close_attempt_count as i64)
        .bind(position.exit_time)
        .bind(position.realized_pnl.map(|d| d.to_string()))
        .bind(position.realized_pnl_percent)
        .bind(&position.id)
        .execute(executor)
        .await
        .context("failed to update position")?;
        Ok(())
    }

    pub async fn find_by_id(&self, id: &str) -> Result<Option<Position>> {
        let row = sqlx::query("SELECT * FROM positions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| Self::map_row(&r)).transpose()
    }

    /// Every position still on the book (OPEN or CLOSING).
    pub async fn find_open(&self) -> Result<Vec<Position>> {
        let rows = sqlx::query(
            "SELECT * FROM positions WHERE status IN ('OPEN', 'CLOSING') ORDER BY entry_time",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::map_row).collect()
    }

    pub async fn find_open_by_strategies(&self, codes: &[StrategyCode]) -> Result<Vec<Position>> {
        let mut out = Vec::new();
        for position in self.find_open().await? {
            if codes.contains(&position.strategy) {
                out.push(position);
            }
        }
        Ok(out)
    }

    /// Aggregate open-position count across every engine.
    pub async fn count_open(&self) -> Result<u32> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM positions WHERE status IN ('OPEN', 'CLOSING')",
        )
        .fetch_one(&self.pool)
        .await?;
        let n: i64 = row.try_get("n")?;
        Ok(n as u32)
    }

    /// True while any engine has a live position on `market`.
    pub async fn has_open_position(&self, market: &str) -> Result<bool> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM positions WHERE market = ? AND status IN ('OPEN', 'CLOSING')",
        )
        .bind(normalize_market(market))
        .fetch_one(&self.pool)
        .await?;
        let n: i64 = row.try_get("n")?;
        Ok(n > 0)
    }

    fn map_row(row: &SqliteRow) -> Result<Position> {
        let strategy_str: String = row.try_get("strategy")?;
        let side_str: String = row.try_get("side")?;
        let status_str: String = row.try_get("status")?;
        let exit_reason_str: Option<String> = row.try_get("exit_reason")?;
        let attempts: i64 = row.try_get("close_attempt_count")?;

        Ok(Position {
            id: row.try_get("id")?,
            strategy: StrategyCode::parse(&strategy_str)
                .with_context(|| format!("unknown strategy code: {strategy_str}"))?,
            market: row.try_get("market")?,
            side: Side::parse(&side_str).context("unknown side")?,
            status: PositionStatus::parse(&status_str).context("unknown status")?,
            entry_price: decimal_col(row, "entry_price")?,
            filled_quantity: decimal_col(row, "filled_quantity")?,
            target_quantity: decimal_col(row, "target_quantity")?,
            average_exit_price: opt_decimal_col(row, "average_exit_price")?,
            stop_loss_percent: row.try_get("stop_loss_percent")?,
            take_profit_percent: row.try_get("take_profit_percent")?,
            trailing_active: row.try_get("trailing_active")?,
            trailing_peak_price: opt_decimal_col(row, "trailing_peak_price")?,
            timeout_at: row.try_get("timeout_at")?,
            exit_reason: exit_reason_str.as_deref().and_then(ExitReason::parse),
            exit_order_id: row.try_get("exit_order_id")?,
            last_close_attempt_at: row.try_get("last_close_attempt_at")?,
            close_attempt_count: attempts as u32,
            entry_time: row.try_get("entry_time")?,
            exit_time: row.try_get("exit_time")?,
            realized_pnl: opt_decimal_col(row, "realized_pnl")?,
            realized_pnl_percent: row.try_get("realized_pnl_percent")?,
        })
    }
}

// =============================================================================
// Lifecycle events
// =============================================================================

#[derive(Clone)]
pub struct LifecycleRepository {
    pool: SqlitePool,
}

impl LifecycleRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Append one event. Returns `false` when the fill-uniqueness constraint
    /// dropped the row (a duplicate BUY_FILLED / SELL_FILLED for the order).
    pub async fn insert(&self, event: &LifecycleEvent) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO lifecycle_events (
                order_id, market, side, event_type, strategy_group,
                strategy_code, price, quantity, message, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(&event.order_id)
        .bind(&event.market)
        .bind(event.side.map(|s| s.to_string()))
        .bind(event.event_type.to_string())
        .bind(event.strategy_group.to_string())
        .bind(event.strategy_code.map(|c| c.to_string()))
        .bind(event.price.map(|p| p.to_string()))
        .bind(event.quantity.map(|q| q.to_string()))
        .bind(&event.message)
        .bind(event.created_at)
        .execute(&self.pool)
        .await
        .context("failed to insert lifecycle event")?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn events_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<LifecycleEvent>> {
        let rows = sqlx::query(
            "SELECT * FROM lifecycle_events WHERE created_at >= ? AND created_at <= ? ORDER BY created_at",
        )
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::map_row).collect()
    }

    /// Raw `(group, event_type, count)` tuples for a window.
    pub async fn counts_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<(StrategyGroup, LifecycleEventType, u64)>> {
        let rows = sqlx::query(
            r#"
            SELECT strategy_group, event_type, COUNT(*) AS n
            FROM lifecycle_events
            WHERE created_at >= ? AND created_at <= ?
            GROUP BY strategy_group, event_type
            "#,
        )
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            let group_str: String = row.try_get("strategy_group")?;
            let type_str: String = row.try_get("event_type")?;
            let n: i64 = row.try_get("n")?;
            if let (Some(group), Some(event_type)) = (
                StrategyGroup::parse(&group_str),
                LifecycleEventType::parse(&type_str),
            ) {
                out.push((group, event_type, n as u64));
            }
        }
        Ok(out)
    }

    fn map_row(row: &SqliteRow) -> Result<LifecycleEvent> {
        let side_str: Option<String> = row.try_get("side")?;
        let type_str: String = row.try_get("event_type")?;
        let group_str: String = row.try_get("strategy_group")?;
        let code_str: Option<String> = row.try_get("strategy_code")?;

        Ok(LifecycleEvent {
            id: row.try_get("id")?,
            order_id: row.try_get("order_id")?,
            market: row.try_get("market")?,
            side: side_str.as_deref().and_then(Side::parse),
            event_type: LifecycleEventType::parse(&type_str).context("unknown event type")?,
            strategy_group: StrategyGroup::parse(&group_str).context("unknown strategy group")?,
            strategy_code: code_str.as_deref().and_then(StrategyCode::parse),
            price: opt_decimal_col(row, "price")?,
            quantity: opt_decimal_col(row, "quantity")?,
            message: row.try_get("message")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

// =============================================================================
// Optimizer audit
// =============================================================================

#[derive(Clone)]
pub struct OptimizerAuditRepository {
    pool: SqlitePool,
}

impl OptimizerAuditRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, entry: &OptimizerAuditEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO optimizer_audit (
                key, current_value, suggested_value, confidence, accepted, reason, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&entry.key)
        .bind(&entry.current_value)
        .bind(&entry.suggested_value)
        .bind(entry.confidence)
        .bind(entry.accepted)
        .bind(&entry.reason)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await
        .context("failed to insert optimizer audit entry")?;
        Ok(())
    }

    /// Most recent *accepted* write for a key.
    pub async fn last_accepted_at(&self, key: &str) -> Result<Option<DateTime<Utc>>> {
        let row = sqlx::query(
            "SELECT created_at FROM optimizer_audit WHERE key = ? AND accepted = 1 ORDER BY created_at DESC LIMIT 1",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.try_get("created_at")).transpose()?)
    }
}

// =============================================================================
// Aggregate handle
// =============================================================================

/// All repositories plus the transactional multi-entity writes.
pub struct Repositories {
    pool: SqlitePool,
    pub config: ConfigRepository,
    pub trades: TradeRepository,
    pub positions: PositionRepository,
    pub lifecycle: LifecycleRepository,
    pub optimizer_audit: OptimizerAuditRepository,
}

impl Repositories {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            config: ConfigRepository::new(pool.clone()),
            trades: TradeRepository::new(pool.clone()),
            positions: PositionRepository::new(pool.clone()),
            lifecycle: LifecycleRepository::new(pool.clone()),
            optimizer_audit: OptimizerAuditRepository::new(pool.clone()),
            pool,
        }
    }

    /// Open a position and record its entry trade atomically.
    pub async fn record_entry(&self, position: &Position, trade: &TradeRecord) -> Result<()> {
        let mut tx = self.pool.begin().await.context("begin entry tx")?;
        PositionRepository::insert_with(&mut *tx, position).await?;
        TradeRepository::insert_with(&mut *tx, trade).await?;
        tx.commit().await.context("commit entry tx")?;
        debug!(position_id = %position.id, market = %position.market, "entry recorded");
        Ok(())
    }

    /// Update a position into its terminal state and record the exit trade
    /// atomically.
    pub async fn record_exit(&self, position: &Position, trade: &TradeRecord) -> Result<()> {
        let mut tx = self.pool.begin().await.context("begin exit tx")?;
        PositionRepository::update_with(&mut *tx, position).await?;
        TradeRepository::insert_with(&mut *tx, trade).await?;
        tx.commit().await.context("commit exit tx")?;
        debug!(position_id = %position.id, market = %position.market, "exit recorded");
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
