use anyhow::{Context, Result, bail};
use sqlx::Row;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use tokio::fs;
use tracing::info;

/// Shared store handle. Each service keeps one of these; repositories clone
/// the pool out of it.
#[derive(Clone)]
pub struct Database {
    pub pool: SqlitePool,
}

/// Tables and unique indexes the services depend on. Startup refuses to
/// proceed when any are missing; a schema mismatch is never swallowed.
const REQUIRED_TABLES: &[&str] = &[
    "sectors",
    "securities",
    "time_dimension",
    "trading_cycles",
    "scan_results",
    "orders",
    "positions",
    "risk_events",
    "watchdog_activity",
    "watchdog_rules",
    "position_monitor_status",
];

const REQUIRED_UNIQUE_INDEXES: &[&str] = &[
    "idx_securities_symbol",
    "idx_time_dimension_ts",
    "idx_cycles_date",
    "idx_orders_broker_id",
    "idx_scan_results_security_time",
    "idx_watchdog_rules_issue",
    "idx_monitor_status_position",
];

impl Database {
    pub async fn new(db_url: &str) -> Result<Self> {
        if let Some(path_part) = db_url.strip_prefix("sqlite://") {
            let path = Path::new(path_part);
            if let Some(parent) = path.parent()
                && !parent.as_os_str().is_empty()
                && !parent.exists()
            {
                fs::create_dir_all(parent)
                    .await
                    .context("Failed to create database directory")?;
            }
        }

        let options = SqliteConnectOptions::from_str(db_url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .min_connections(2)
            .max_connections(5)
            .connect_with(options)
            .await
            .context("Failed to connect to SQLite database")?;

        info!("Connected to database: {}", db_url);

        let db = Self { pool };
        db.init().await?;
        db.validate_schema().await?;

        Ok(db)
    }

    /// Create the schema. Statements are idempotent; an existing database is
    /// left untouched and checked by `validate_schema` afterwards.
    async fn init(&self) -> Result<()> {
        let mut conn = self.pool.acquire().await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sectors (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                code TEXT NOT NULL UNIQUE,
                name TEXT NOT NULL
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create sectors table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS securities (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                symbol TEXT NOT NULL,
                name TEXT,
                sector_id INTEGER REFERENCES sectors(id),
                exchange TEXT,
                asset_type TEXT NOT NULL DEFAULT 'us_equity',
                active INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_securities_symbol
            ON securities (symbol);
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create securities table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS time_dimension (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                ts TEXT NOT NULL,
                date TEXT NOT NULL,
                time TEXT NOT NULL,
                hour INTEGER NOT NULL,
                minute INTEGER NOT NULL,
                dow INTEGER NOT NULL,
                market_hours INTEGER NOT NULL,
                market_phase TEXT NOT NULL
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_time_dimension_ts
            ON time_dimension (ts);
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create time_dimension table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS trading_cycles (
                id TEXT PRIMARY KEY,
                date TEXT NOT NULL,
                state TEXT NOT NULL,
                mode TEXT NOT NULL,
                configuration TEXT,
                started_at TEXT,
                stopped_at TEXT,
                trades_executed INTEGER NOT NULL DEFAULT 0,
                trades_won INTEGER NOT NULL DEFAULT 0,
                trades_lost INTEGER NOT NULL DEFAULT 0,
                daily_pnl TEXT NOT NULL DEFAULT '0',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_cycles_date
            ON trading_cycles (date);
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create trading_cycles table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS scan_results (
                id TEXT PRIMARY KEY,
                cycle_id TEXT NOT NULL REFERENCES trading_cycles(id),
                security_id INTEGER NOT NULL REFERENCES securities(id),
                time_id INTEGER NOT NULL REFERENCES time_dimension(id),
                scan_ts TEXT NOT NULL,
                rank INTEGER NOT NULL DEFAULT 0,
                price TEXT NOT NULL,
                volume TEXT NOT NULL,
                gap_pct REAL NOT NULL DEFAULT 0,
                rel_volume REAL NOT NULL DEFAULT 1,
                float_shares INTEGER,
                catalyst_score REAL NOT NULL DEFAULT 0,
                pattern_score REAL NOT NULL DEFAULT 0,
                technical_score REAL NOT NULL DEFAULT 0,
                momentum_score REAL NOT NULL DEFAULT 0,
                volume_score REAL NOT NULL DEFAULT 0,
                composite_score REAL NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'candidate',
                metadata TEXT
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_scan_results_security_time
            ON scan_results (security_id, time_id);
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create scan_results table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS positions (
                id TEXT PRIMARY KEY,
                cycle_id TEXT NOT NULL REFERENCES trading_cycles(id),
                security_id INTEGER NOT NULL REFERENCES securities(id),
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                qty TEXT NOT NULL CHECK (CAST(qty AS REAL) >= 0),
                entry_price TEXT,
                entry_time TEXT,
                exit_price TEXT,
                exit_time TEXT,
                current_price TEXT,
                stop_loss TEXT NOT NULL,
                take_profit TEXT NOT NULL,
                risk_amount TEXT NOT NULL,
                realized_pnl TEXT NOT NULL DEFAULT '0',
                realized_pnl_pct TEXT,
                unrealized_pnl TEXT NOT NULL DEFAULT '0',
                unrealized_pnl_pct TEXT,
                status TEXT NOT NULL,
                pattern TEXT,
                catalyst TEXT,
                high_watermark TEXT,
                entry_volume TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                metadata TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_positions_cycle_status
            ON positions (cycle_id, status);
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create positions table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS orders (
                id TEXT PRIMARY KEY,
                cycle_id TEXT NOT NULL REFERENCES trading_cycles(id),
                security_id INTEGER NOT NULL REFERENCES securities(id),
                symbol TEXT NOT NULL,
                position_id TEXT REFERENCES positions(id),
                parent_order_id TEXT REFERENCES orders(id),
                order_class TEXT NOT NULL,
                purpose TEXT NOT NULL,
                side TEXT NOT NULL,
                order_type TEXT NOT NULL,
                time_in_force TEXT NOT NULL,
                qty TEXT NOT NULL CHECK (CAST(qty AS REAL) > 0),
                limit_price TEXT,
                stop_price TEXT,
                broker_order_id TEXT,
                status TEXT NOT NULL,
                filled_qty TEXT NOT NULL DEFAULT '0'
                    CHECK (CAST(filled_qty AS REAL) >= 0 AND CAST(filled_qty AS REAL) <= CAST(qty AS REAL)),
                filled_avg_price TEXT,
                created_at TEXT NOT NULL,
                submitted_at TEXT,
                accepted_at TEXT,
                filled_at TEXT,
                cancelled_at TEXT,
                expired_at TEXT,
                updated_at TEXT NOT NULL,
                reason TEXT,
                metadata TEXT
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_orders_broker_id
            ON orders (broker_order_id) WHERE broker_order_id IS NOT NULL;
            CREATE INDEX IF NOT EXISTS idx_orders_position
            ON orders (position_id);
            CREATE INDEX IF NOT EXISTS idx_orders_status
            ON orders (status, submitted_at);
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create orders table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS risk_events (
                id TEXT PRIMARY KEY,
                cycle_id TEXT REFERENCES trading_cycles(id),
                position_id TEXT REFERENCES positions(id),
                event_type TEXT NOT NULL,
                severity TEXT NOT NULL,
                message TEXT NOT NULL,
                details TEXT,
                resolved INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_risk_events_cycle
            ON risk_events (cycle_id, resolved);
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create risk_events table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS watchdog_activity (
                id TEXT PRIMARY KEY,
                logged_at TEXT NOT NULL,
                session TEXT NOT NULL,
                cycle_id TEXT REFERENCES trading_cycles(id),
                observation_type TEXT NOT NULL,
                issues_summary TEXT NOT NULL,
                decision TEXT NOT NULL,
                action_type TEXT,
                action_detail TEXT,
                action_result TEXT,
                issue_type TEXT,
                issue_severity TEXT,
                observe_ms INTEGER NOT NULL DEFAULT 0,
                act_ms INTEGER NOT NULL DEFAULT 0,
                metadata TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_watchdog_activity_logged
            ON watchdog_activity (logged_at);
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create watchdog_activity table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS watchdog_rules (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                issue_type TEXT NOT NULL,
                auto_fix_enabled INTEGER NOT NULL DEFAULT 0,
                fix_template TEXT,
                max_fixes_per_hour INTEGER NOT NULL DEFAULT 0,
                cooldown_minutes INTEGER NOT NULL DEFAULT 0,
                escalation_priority INTEGER NOT NULL DEFAULT 3,
                active INTEGER NOT NULL DEFAULT 1
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_watchdog_rules_issue
            ON watchdog_rules (issue_type);
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create watchdog_rules table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS position_monitor_status (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                position_id TEXT NOT NULL REFERENCES positions(id),
                symbol TEXT NOT NULL,
                status TEXT NOT NULL,
                last_price TEXT,
                high_watermark TEXT,
                pnl_pct REAL,
                rsi REAL,
                macd_histogram REAL,
                vwap_position TEXT,
                hold_signals TEXT NOT NULL DEFAULT '[]',
                exit_signals TEXT NOT NULL DEFAULT '[]',
                recommendation TEXT NOT NULL DEFAULT 'HOLD',
                advisor_calls INTEGER NOT NULL DEFAULT 0,
                estimated_cost REAL NOT NULL DEFAULT 0,
                last_checkin TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_monitor_status_position
            ON position_monitor_status (position_id);
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create position_monitor_status table")?;

        info!("Database schema initialized.");
        Ok(())
    }

    /// Verify every table and unique constraint the services rely on is
    /// actually present. A pre-existing database that drifted from the
    /// expected schema must stop the process here.
    pub async fn validate_schema(&self) -> Result<()> {
        let mut conn = self.pool.acquire().await?;

        let mut missing: Vec<String> = Vec::new();

        for table in REQUIRED_TABLES {
            let row = sqlx::query(
                "SELECT COUNT(*) as n FROM sqlite_master WHERE type = 'table' AND name = ?",
            )
            .bind(table)
            .fetch_one(&mut *conn)
            .await?;
            let n: i64 = row.try_get("n")?;
            if n == 0 {
                missing.push(format!("table {table}"));
            }
        }

        for index in REQUIRED_UNIQUE_INDEXES {
            let row = sqlx::query(
                "SELECT COUNT(*) as n FROM sqlite_master WHERE type = 'index' AND name = ?",
            )
            .bind(index)
            .fetch_one(&mut *conn)
            .await?;
            let n: i64 = row.try_get("n")?;
            if n == 0 {
                missing.push(format!("unique index {index}"));
            }
        }

        if !missing.is_empty() {
            bail!(
                "Schema validation failed; refusing to start. Missing: {}",
                missing.join(", ")
            );
        }

        info!("Schema validation passed.");
        Ok(())
    }
}
