// =============================================================================
// SQLite pool construction and schema bootstrap
// =============================================================================
//
// The schema is created with idempotent DDL at startup; monetary columns are
// TEXT holding decimal renderings so no precision is lost through storage.
// =============================================================================

use std::str::FromStr;

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::info;

/// Open (creating if missing) the SQLite database at `url`.
pub async fn connect(url: &str) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(url)
        .with_context(|| format!("invalid database url: {url}"))?
        .create_if_missing(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .context("failed to open sqlite database")?;

    info!(url, "database connected");
    Ok(pool)
}

/// Create every table and index the engine needs. Safe to run on every boot.
pub async fn init_schema(pool: &SqlitePool) -> Result<()> {
    let statements = [
        r#"
        CREATE TABLE IF NOT EXISTS config_entries (
            key         TEXT PRIMARY KEY,
            value       TEXT NOT NULL,
            category    TEXT,
            description TEXT,
            updated_at  TEXT NOT NULL
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS trades (
            id               INTEGER PRIMARY KEY AUTOINCREMENT,
            order_id         TEXT NOT NULL,
            market           TEXT NOT NULL,
            side             TEXT NOT NULL,
            order_type       TEXT NOT NULL,
            price            TEXT NOT NULL,
            quantity         TEXT NOT NULL,
            total_amount     TEXT NOT NULL,
            fee              TEXT NOT NULL,
            slippage_percent REAL,
            is_partial_fill  INTEGER NOT NULL DEFAULT 0,
            pnl              TEXT,
            pnl_percent      REAL,
            strategy         TEXT NOT NULL,
            regime           TEXT,
            confidence       REAL NOT NULL DEFAULT 0,
            reason           TEXT NOT NULL DEFAULT '',
            simulated        INTEGER NOT NULL DEFAULT 0,
            created_at       TEXT NOT NULL
        )
        "#,
        r#"CREATE INDEX IF NOT EXISTS ix_trades_created ON trades(created_at)"#,
        r#"CREATE INDEX IF NOT EXISTS ix_trades_market_side ON trades(market, side, created_at)"#,
        r#"
        CREATE TABLE IF NOT EXISTS positions (
            id                    TEXT PRIMARY KEY,
            strategy              TEXT NOT NULL,
            market                TEXT NOT NULL,
            side                  TEXT NOT NULL,
            status                TEXT NOT NULL,
            entry_price           TEXT NOT NULL,
            filled_quantity       TEXT NOT NULL,
            target_quantity       TEXT NOT NULL,
            average_exit_price    TEXT,
            stop_loss_percent     REAL NOT NULL,
            take_profit_percent   REAL NOT NULL,
            trailing_active       INTEGER NOT NULL DEFAULT 0,
            trailing_peak_price   TEXT,
            timeout_at            TEXT NOT NULL,
            exit_reason           TEXT,
            exit_order_id         TEXT,
            last_close_attempt_at TEXT,
            close_attempt_count   INTEGER NOT NULL DEFAULT 0,
            entry_time            TEXT NOT NULL,
            exit_time             TEXT,
            realized_pnl          TEXT,
            realized_pnl_percent  REAL
        )
        "#,
        r#"CREATE INDEX IF NOT EXISTS ix_positions_status ON positions(status)"#,
        r#"CREATE INDEX IF NOT EXISTS ix_positions_market ON positions(market, status)"#,
        r#"
        CREATE TABLE IF NOT EXISTS lifecycle_events (
            id             INTEGER PRIMARY KEY AUTOINCREMENT,
            order_id       TEXT,
            market         TEXT NOT NULL,
            side           TEXT,
            event_type     TEXT NOT NULL,
            strategy_group TEXT NOT NULL,
            strategy_code  TEXT,
            price          TEXT,
            quantity       TEXT,
            message        TEXT,
            created_at     TEXT NOT NULL
        )
        "#,
        // At most one BUY_FILLED and one SELL_FILLED per order id.
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS ux_lifecycle_fill
            ON lifecycle_events(order_id, event_type)
            WHERE event_type IN ('BUY_FILLED', 'SELL_FILLED')
        "#,
        r#"CREATE INDEX IF NOT EXISTS ix_lifecycle_created ON lifecycle_events(created_at)"#,
        r#"
        CREATE TABLE IF NOT EXISTS optimizer_audit (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            key             TEXT NOT NULL,
            current_value   TEXT NOT NULL,
            suggested_value TEXT NOT NULL,
            confidence      REAL NOT NULL,
            accepted        INTEGER NOT NULL,
            reason          TEXT NOT NULL,
            created_at      TEXT NOT NULL
        )
        "#,
        r#"CREATE INDEX IF NOT EXISTS ix_optimizer_audit_key ON optimizer_audit(key, created_at)"#,
    ];

    for ddl in statements {
        sqlx::query(ddl)
            .execute(pool)
            .await
            .context("schema statement failed")?;
    }

    info!("database schema ready");
    Ok(())
}

/// In-memory database for tests. Pinned to one connection so every query
/// sees the same memory instance.
#[cfg(test)]
pub async fn memory_pool() -> SqlitePool {
    let options = SqliteConnectOptions::from_str("sqlite::memory:").expect("memory url");
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .expect("memory db");
    init_schema(&pool).await.expect("schema");
    pool
}
