use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use tokio::fs;
use tracing::info;

/// Owns the SQLite pool. Every durable entity lives here; all state
/// transitions are single transactions against this pool.
#[derive(Clone)]
pub struct Database {
    pub pool: SqlitePool,
}

impl Database {
    pub async fn new(db_url: &str) -> Result<Self> {
        // Ensure the directory exists if it's a file path
        if let Some(path_part) = db_url.strip_prefix("sqlite://") {
            let path = Path::new(path_part);
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() && !parent.exists() {
                    fs::create_dir_all(parent)
                        .await
                        .context("Failed to create database directory")?;
                }
            }
        }

        let options = SqliteConnectOptions::from_str(db_url)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .context("Failed to connect to SQLite database")?;

        info!("Connected to database: {}", db_url);

        let db = Self { pool };
        db.init().await?;

        Ok(db)
    }

    /// A private in-memory database, used by tests.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?
            .foreign_keys(true);

        // One connection: each :memory: connection is its own database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .context("Failed to open in-memory database")?;

        let db = Self { pool };
        db.init().await?;
        Ok(db)
    }

    async fn init(&self) -> Result<()> {
        let mut conn = self.pool.acquire().await?;

        for timeframe in ["candles_m5", "candles_h4"] {
            sqlx::query(&format!(
                r#"
                CREATE TABLE IF NOT EXISTS {timeframe} (
                    bucket_start INTEGER PRIMARY KEY,
                    open REAL NOT NULL,
                    high REAL NOT NULL,
                    low REAL NOT NULL,
                    close REAL NOT NULL,
                    volume REAL NOT NULL,
                    created_at INTEGER DEFAULT (strftime('%s', 'now'))
                );
                "#
            ))
            .execute(&mut *conn)
            .await
            .with_context(|| format!("Failed to create {timeframe} table"))?;
        }

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS swing_levels (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timeframe TEXT NOT NULL,
                kind TEXT NOT NULL,
                bucket_start INTEGER NOT NULL,
                price REAL NOT NULL,
                active INTEGER NOT NULL DEFAULT 1,
                created_at INTEGER DEFAULT (strftime('%s', 'now')),
                updated_at INTEGER DEFAULT (strftime('%s', 'now'))
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create swing_levels table")?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_swing_active
            ON swing_levels (timeframe, kind, active);
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create swing index")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sweeps (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                detected_at INTEGER NOT NULL,
                kind TEXT NOT NULL,
                price_at_detection REAL NOT NULL,
                swing_level_id INTEGER NOT NULL REFERENCES swing_levels(id) ON DELETE RESTRICT,
                bias TEXT NOT NULL,
                active INTEGER NOT NULL DEFAULT 1,
                expires_at INTEGER NOT NULL,
                created_at INTEGER DEFAULT (strftime('%s', 'now')),
                updated_at INTEGER DEFAULT (strftime('%s', 'now'))
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create sweeps table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS confluence_states (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                sweep_id INTEGER NOT NULL UNIQUE REFERENCES sweeps(id) ON DELETE RESTRICT,
                phase TEXT NOT NULL,
                choch_price REAL,
                choch_at INTEGER,
                fvg_low REAL,
                fvg_high REAL,
                fvg_fill_price REAL,
                fvg_fill_at INTEGER,
                bos_price REAL,
                bos_at INTEGER,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create confluence_states table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS trades (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                confluence_state_id INTEGER NOT NULL REFERENCES confluence_states(id) ON DELETE RESTRICT,
                direction TEXT NOT NULL,
                entry_price REAL NOT NULL,
                entry_at INTEGER NOT NULL,
                size_base REAL NOT NULL,
                size_quote REAL NOT NULL,
                stop_price REAL NOT NULL,
                stop_source TEXT NOT NULL,
                take_profit REAL NOT NULL,
                rr_ratio REAL NOT NULL,
                entry_order_id TEXT NOT NULL,
                stop_order_id TEXT NOT NULL,
                tp_order_id TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'open',
                outcome TEXT,
                exit_price REAL,
                exit_at INTEGER,
                pnl_quote REAL,
                pnl_percent REAL,
                trailing_activated INTEGER NOT NULL DEFAULT 0,
                trailing_price REAL,
                ai_confidence REAL NOT NULL,
                ai_reasoning TEXT NOT NULL,
                created_at INTEGER DEFAULT (strftime('%s', 'now')),
                updated_at INTEGER DEFAULT (strftime('%s', 'now'))
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create trades table")?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_trades_status
            ON trades (status, exit_at);
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create trade index")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS system_flags (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at INTEGER DEFAULT (strftime('%s', 'now'))
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create system_flags table")?;

        info!("Database schema initialized");
        Ok(())
    }
}
