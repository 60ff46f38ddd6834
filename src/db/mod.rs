//! SQLite ledger for positions, the pending stop-update queue, safety state,
//! and scheduled-job audit records.
//!
//! Everything needed to resume after a restart lives here:
//! - Position rows (pending/open/closed) with trailing-stop metadata
//! - Durable queue of stop raises the broker has not yet acknowledged
//! - The safety circuit-breaker state blob (singleton row)
//! - One audit record per scheduled job run, with per-symbol outcomes

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};

use crate::models::{Position, PositionStatus};

/// Database connection pool with ledger state management.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

/// Stored position row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredPosition {
    pub id: i64,
    pub symbol: String,
    pub shares: i64,
    pub entry_price: f64,
    pub stop_price: f64,
    pub initial_stop_price: f64,
    pub structural_high: Option<f64>,
    pub structural_low: Option<f64>,
    pub structural_high_date: Option<String>,
    pub current_price: f64,
    pub highest_price: f64,
    pub status: String,
    pub broker_order_id: Option<i64>,
    pub stop_order_id: Option<i64>,
    pub exit_price: Option<f64>,
    pub realized_pnl: Option<f64>,
    pub opened_at: String,
    pub closed_at: Option<String>,
    pub updated_at: String,
}

/// Durable work item for a stop raise that failed against the broker.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredPendingUpdate {
    pub id: i64,
    pub position_id: i64,
    pub symbol: String,
    pub old_stop: f64,
    pub new_stop: f64,
    pub retry_count: i64,
    pub last_error: Option<String>,
    pub last_retry_at: Option<String>,
    pub status: String,
    pub created_at: String,
    pub updated_at: String,
}

/// Safety circuit-breaker state (singleton row, id = 1).
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredSafetyState {
    pub id: i64,
    pub mode: String,
    pub is_paused: bool,
    pub pause_reason: Option<String>,
    pub pause_until: Option<String>,
    pub daily_pnl: f64,
    pub weekly_pnl: f64,
    pub consecutive_losses: i64,
    pub open_positions_count: i64,
    pub capital_deployed: f64,
    pub paper_trade_count: i64,
    pub paper_trading_start_date: Option<String>,
    pub streak_reset_at: Option<String>,
    pub updated_at: String,
}

/// One scheduled job run.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct JobRunRow {
    pub id: String,
    pub job_name: String,
    pub status: String,
    pub checked: i64,
    pub raised: i64,
    pub failures: i64,
    pub started_at: String,
    pub completed_at: Option<String>,
}

/// Per-symbol outcome within a job run.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct JobRunItemRow {
    pub id: i64,
    pub job_run_id: String,
    pub symbol: String,
    pub outcome: String,
    pub detail: Option<String>,
    pub created_at: String,
}

/// Parse a timestamp as stored by sqlite's `datetime('now')`, falling back
/// to RFC 3339 and finally the current time.
pub fn parse_db_time(s: &str) -> DateTime<Utc> {
    if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return DateTime::from_naive_utc_and_offset(naive, Utc);
    }
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

/// Format a timestamp the way sqlite's `datetime('now')` does, so bound
/// parameters compare correctly against stored columns.
pub fn format_db_time(dt: DateTime<Utc>) -> String {
    dt.format("%Y-%m-%d %H:%M:%S").to_string()
}

fn dec(v: f64) -> Decimal {
    Decimal::try_from(v).unwrap_or(Decimal::ZERO)
}

impl StoredPosition {
    /// Convert the raw row into the Decimal-based domain type.
    pub fn to_domain(&self) -> Position {
        Position {
            id: self.id,
            symbol: self.symbol.clone(),
            shares: self.shares,
            entry_price: dec(self.entry_price),
            stop_price: dec(self.stop_price),
            initial_stop_price: dec(self.initial_stop_price),
            structural_high: self.structural_high.map(dec),
            structural_low: self.structural_low.map(dec),
            structural_high_date: self
                .structural_high_date
                .as_deref()
                .and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok()),
            current_price: dec(self.current_price),
            highest_price: dec(self.highest_price),
            status: PositionStatus::parse(&self.status).unwrap_or(PositionStatus::Closed),
            broker_order_id: self.broker_order_id,
            stop_order_id: self.stop_order_id,
            exit_price: self.exit_price.map(dec),
            realized_pnl: self.realized_pnl.map(dec),
            opened_at: parse_db_time(&self.opened_at),
            closed_at: self.closed_at.as_deref().map(parse_db_time),
        }
    }
}

impl Database {
    /// Create a new database connection.
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context("Failed to connect to database")?;

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    /// Single-connection in-memory database for tests.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .context("Failed to open in-memory database")?;

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    /// Run all database migrations.
    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS positions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                symbol TEXT NOT NULL,
                shares INTEGER NOT NULL,
                entry_price REAL NOT NULL,
                stop_price REAL NOT NULL DEFAULT 0,
                initial_stop_price REAL NOT NULL DEFAULT 0,
                structural_high REAL,
                structural_low REAL,
                structural_high_date TEXT,
                current_price REAL NOT NULL DEFAULT 0,
                highest_price REAL NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'pending',
                broker_order_id INTEGER,
                stop_order_id INTEGER,
                exit_price REAL,
                realized_pnl REAL,
                opened_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                closed_at TEXT,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS pending_stop_updates (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                position_id INTEGER NOT NULL,
                symbol TEXT NOT NULL,
                old_stop REAL NOT NULL,
                new_stop REAL NOT NULL,
                retry_count INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                last_retry_at TEXT,
                status TEXT NOT NULL DEFAULT 'pending',
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                FOREIGN KEY (position_id) REFERENCES positions(id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS safety_state (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                mode TEXT NOT NULL DEFAULT 'paper',
                is_paused INTEGER NOT NULL DEFAULT 0,
                pause_reason TEXT,
                pause_until TEXT,
                daily_pnl REAL NOT NULL DEFAULT 0,
                weekly_pnl REAL NOT NULL DEFAULT 0,
                consecutive_losses INTEGER NOT NULL DEFAULT 0,
                open_positions_count INTEGER NOT NULL DEFAULT 0,
                capital_deployed REAL NOT NULL DEFAULT 0,
                paper_trade_count INTEGER NOT NULL DEFAULT 0,
                paper_trading_start_date TEXT,
                streak_reset_at TEXT,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS job_runs (
                id TEXT PRIMARY KEY,
                job_name TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'running',
                checked INTEGER NOT NULL DEFAULT 0,
                raised INTEGER NOT NULL DEFAULT 0,
                failures INTEGER NOT NULL DEFAULT 0,
                started_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                completed_at TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS job_run_items (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                job_run_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                outcome TEXT NOT NULL,
                detail TEXT,
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                FOREIGN KEY (job_run_id) REFERENCES job_runs(id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Indexes
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_positions_status ON positions(status)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_positions_symbol ON positions(symbol)")
            .execute(&self.pool)
            .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_pending_updates_status ON pending_stop_updates(status)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_job_runs_name ON job_runs(job_name)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    // ==================== Positions ====================

    /// Create a pending position after an entry order was placed but before
    /// the broker confirmed the fill.
    pub async fn create_pending_position(
        &self,
        symbol: &str,
        shares: i64,
        entry_price: f64,
        broker_order_id: i64,
    ) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO positions (symbol, shares, entry_price, current_price, highest_price,
                                   status, broker_order_id)
            VALUES (?, ?, ?, ?, ?, 'pending', ?)
            RETURNING id
            "#,
        )
        .bind(symbol)
        .bind(shares)
        .bind(entry_price)
        .bind(entry_price)
        .bind(entry_price)
        .bind(broker_order_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(sqlx::Row::get(&result, "id"))
    }

    /// Promote a pending position to open with broker-confirmed fill data.
    pub async fn confirm_position_open(
        &self,
        id: i64,
        shares: i64,
        entry_price: f64,
        stop_price: f64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE positions SET
                shares = ?,
                entry_price = ?,
                stop_price = ?,
                initial_stop_price = ?,
                current_price = ?,
                highest_price = ?,
                status = 'open',
                updated_at = datetime('now')
            WHERE id = ?
            "#,
        )
        .bind(shares)
        .bind(entry_price)
        .bind(stop_price)
        .bind(stop_price)
        .bind(entry_price)
        .bind(entry_price)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Create an already-open position (reconciliation sync path).
    pub async fn create_open_position(
        &self,
        symbol: &str,
        shares: i64,
        entry_price: f64,
        stop_price: f64,
        current_price: f64,
    ) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO positions (symbol, shares, entry_price, stop_price, initial_stop_price,
                                   current_price, highest_price, status)
            VALUES (?, ?, ?, ?, ?, ?, ?, 'open')
            RETURNING id
            "#,
        )
        .bind(symbol)
        .bind(shares)
        .bind(entry_price)
        .bind(stop_price)
        .bind(stop_price)
        .bind(current_price)
        .bind(current_price)
        .fetch_one(&self.pool)
        .await?;

        Ok(sqlx::Row::get(&result, "id"))
    }

    /// Remove a position row (failed open verification; no fill exists).
    pub async fn delete_position(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM positions WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get_position(&self, id: i64) -> Result<Option<StoredPosition>> {
        sqlx::query_as::<_, StoredPosition>("SELECT * FROM positions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch position")
    }

    pub async fn get_open_position_by_symbol(&self, symbol: &str) -> Result<Option<StoredPosition>> {
        sqlx::query_as::<_, StoredPosition>(
            "SELECT * FROM positions WHERE symbol = ? AND status = 'open'",
        )
        .bind(symbol)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch position by symbol")
    }

    pub async fn get_open_positions(&self) -> Result<Vec<StoredPosition>> {
        sqlx::query_as::<_, StoredPosition>(
            "SELECT * FROM positions WHERE status = 'open' ORDER BY symbol",
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch open positions")
    }

    /// Overwrite shares and cost basis from broker data (drift repair).
    pub async fn update_position_fill(&self, id: i64, shares: i64, entry_price: f64) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE positions SET
                shares = ?,
                entry_price = ?,
                updated_at = datetime('now')
            WHERE id = ?
            "#,
        )
        .bind(shares)
        .bind(entry_price)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Apply a broker-acknowledged stop raise and the structural state that
    /// produced it. Callers must have broker confirmation before this runs.
    pub async fn apply_stop_raise(
        &self,
        id: i64,
        new_stop: f64,
        structural_high: f64,
        structural_low: f64,
        structural_high_date: Option<NaiveDate>,
        highest_price: f64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE positions SET
                stop_price = ?,
                structural_high = ?,
                structural_low = ?,
                structural_high_date = ?,
                highest_price = MAX(highest_price, ?),
                updated_at = datetime('now')
            WHERE id = ?
            "#,
        )
        .bind(new_stop)
        .bind(structural_high)
        .bind(structural_low)
        .bind(structural_high_date.map(|d| d.format("%Y-%m-%d").to_string()))
        .bind(highest_price)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Raise the stop price only, leaving structural state untouched
    /// (catch-up path, where the analysis that produced the stop is past).
    pub async fn update_stop_price(&self, id: i64, new_stop: f64) -> Result<()> {
        sqlx::query(
            "UPDATE positions SET stop_price = ?, updated_at = datetime('now') WHERE id = ?",
        )
        .bind(new_stop)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_stop_order_id(&self, id: i64, stop_order_id: Option<i64>) -> Result<()> {
        sqlx::query(
            "UPDATE positions SET stop_order_id = ?, updated_at = datetime('now') WHERE id = ?",
        )
        .bind(stop_order_id)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn update_position_price(&self, id: i64, price: f64) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE positions SET
                current_price = ?,
                highest_price = MAX(highest_price, ?),
                updated_at = datetime('now')
            WHERE id = ?
            "#,
        )
        .bind(price)
        .bind(price)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn close_position(&self, id: i64, exit_price: f64, realized_pnl: f64) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE positions SET
                status = 'closed',
                exit_price = ?,
                realized_pnl = ?,
                closed_at = datetime('now'),
                updated_at = datetime('now')
            WHERE id = ?
            "#,
        )
        .bind(exit_price)
        .bind(realized_pnl)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ==================== Trade history aggregates ====================

    /// Sum of realized P&L for positions closed on or after the given date.
    pub async fn realized_pnl_since(&self, date: NaiveDate) -> Result<f64> {
        let (pnl,): (f64,) = sqlx::query_as(
            r#"
            SELECT COALESCE(SUM(realized_pnl), 0.0) FROM positions
            WHERE status = 'closed' AND date(closed_at) >= ?
            "#,
        )
        .bind(date.format("%Y-%m-%d").to_string())
        .fetch_one(&self.pool)
        .await?;

        Ok(pnl)
    }

    /// Length of the current losing streak, counting backwards from the most
    /// recently closed position. A streak reset timestamp bounds the walk.
    pub async fn consecutive_losses(&self, since: Option<&str>) -> Result<i64> {
        let rows: Vec<(f64,)> = sqlx::query_as(
            r#"
            SELECT COALESCE(realized_pnl, 0) FROM positions
            WHERE status = 'closed' AND (? IS NULL OR closed_at > ?)
            ORDER BY closed_at DESC LIMIT 100
            "#,
        )
        .bind(since)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        let mut streak = 0i64;
        for (pnl,) in rows {
            if pnl < 0.0 {
                streak += 1;
            } else {
                break;
            }
        }

        Ok(streak)
    }

    pub async fn open_positions_count(&self) -> Result<i64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM positions WHERE status = 'open'")
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    /// Capital committed to open positions at cost basis.
    pub async fn capital_deployed(&self) -> Result<f64> {
        let (total,): (f64,) = sqlx::query_as(
            "SELECT COALESCE(SUM(shares * entry_price), 0.0) FROM positions WHERE status = 'open'",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(total)
    }

    /// Count of positions closed at or after the given timestamp.
    pub async fn closed_count_since(&self, since: &str) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM positions WHERE status = 'closed' AND closed_at >= ?",
        )
        .bind(since)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    // ==================== Pending stop updates ====================

    /// Enqueue a stop raise for catch-up, merging into the position's active
    /// pending record if one exists (one active record per position).
    pub async fn upsert_pending_update(
        &self,
        position_id: i64,
        symbol: &str,
        old_stop: f64,
        new_stop: f64,
        error: &str,
    ) -> Result<()> {
        let updated = sqlx::query(
            r#"
            UPDATE pending_stop_updates SET
                new_stop = ?,
                last_error = ?,
                updated_at = datetime('now')
            WHERE position_id = ? AND status = 'pending'
            "#,
        )
        .bind(new_stop)
        .bind(error)
        .bind(position_id)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            sqlx::query(
                r#"
                INSERT INTO pending_stop_updates (position_id, symbol, old_stop, new_stop, last_error)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(position_id)
            .bind(symbol)
            .bind(old_stop)
            .bind(new_stop)
            .bind(error)
            .execute(&self.pool)
            .await?;
        }

        Ok(())
    }

    pub async fn get_pending_updates(&self) -> Result<Vec<StoredPendingUpdate>> {
        sqlx::query_as::<_, StoredPendingUpdate>(
            "SELECT * FROM pending_stop_updates WHERE status = 'pending' ORDER BY created_at",
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch pending stop updates")
    }

    pub async fn get_pending_update_for_position(
        &self,
        position_id: i64,
    ) -> Result<Option<StoredPendingUpdate>> {
        sqlx::query_as::<_, StoredPendingUpdate>(
            "SELECT * FROM pending_stop_updates WHERE position_id = ? AND status = 'pending'",
        )
        .bind(position_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch pending stop update")
    }

    pub async fn count_pending_updates(&self) -> Result<i64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM pending_stop_updates WHERE status = 'pending'")
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    /// Record one failed catch-up attempt; returns the new retry count.
    pub async fn record_pending_failure(&self, id: i64, error: &str) -> Result<i64> {
        sqlx::query(
            r#"
            UPDATE pending_stop_updates SET
                retry_count = retry_count + 1,
                last_error = ?,
                last_retry_at = datetime('now'),
                updated_at = datetime('now')
            WHERE id = ?
            "#,
        )
        .bind(error)
        .bind(id)
        .execute(&self.pool)
        .await?;

        let (count,): (i64,) =
            sqlx::query_as("SELECT retry_count FROM pending_stop_updates WHERE id = ?")
                .bind(id)
                .fetch_one(&self.pool)
                .await?;

        Ok(count)
    }

    pub async fn mark_pending_success(&self, id: i64) -> Result<()> {
        sqlx::query(
            "UPDATE pending_stop_updates SET status = 'success', updated_at = datetime('now') WHERE id = ?",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mark_pending_failed(&self, id: i64, reason: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE pending_stop_updates SET
                status = 'failed',
                last_error = ?,
                updated_at = datetime('now')
            WHERE id = ?
            "#,
        )
        .bind(reason)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ==================== Safety state ====================

    /// Fetch the safety state singleton, creating the default row on first use.
    pub async fn get_safety_state(&self) -> Result<StoredSafetyState> {
        sqlx::query(
            r#"
            INSERT INTO safety_state (id, mode, paper_trading_start_date)
            VALUES (1, 'paper', datetime('now'))
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query_as::<_, StoredSafetyState>("SELECT * FROM safety_state WHERE id = 1")
            .fetch_one(&self.pool)
            .await
            .context("Safety state not initialized")
    }

    /// Persist the full safety state blob.
    pub async fn save_safety_state(&self, state: &StoredSafetyState) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE safety_state SET
                mode = ?,
                is_paused = ?,
                pause_reason = ?,
                pause_until = ?,
                daily_pnl = ?,
                weekly_pnl = ?,
                consecutive_losses = ?,
                open_positions_count = ?,
                capital_deployed = ?,
                paper_trade_count = ?,
                paper_trading_start_date = ?,
                streak_reset_at = ?,
                updated_at = datetime('now')
            WHERE id = 1
            "#,
        )
        .bind(&state.mode)
        .bind(state.is_paused)
        .bind(&state.pause_reason)
        .bind(&state.pause_until)
        .bind(state.daily_pnl)
        .bind(state.weekly_pnl)
        .bind(state.consecutive_losses)
        .bind(state.open_positions_count)
        .bind(state.capital_deployed)
        .bind(state.paper_trade_count)
        .bind(&state.paper_trading_start_date)
        .bind(&state.streak_reset_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ==================== Job runs ====================

    pub async fn create_job_run(&self, job_name: &str) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();

        sqlx::query("INSERT INTO job_runs (id, job_name, status) VALUES (?, ?, 'running')")
            .bind(&id)
            .bind(job_name)
            .execute(&self.pool)
            .await?;

        Ok(id)
    }

    pub async fn append_job_item(
        &self,
        job_run_id: &str,
        symbol: &str,
        outcome: &str,
        detail: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO job_run_items (job_run_id, symbol, outcome, detail) VALUES (?, ?, ?, ?)",
        )
        .bind(job_run_id)
        .bind(symbol)
        .bind(outcome)
        .bind(detail)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn finalize_job_run(
        &self,
        job_run_id: &str,
        status: &str,
        checked: i64,
        raised: i64,
        failures: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE job_runs SET
                status = ?,
                checked = ?,
                raised = ?,
                failures = ?,
                completed_at = datetime('now')
            WHERE id = ?
            "#,
        )
        .bind(status)
        .bind(checked)
        .bind(raised)
        .bind(failures)
        .bind(job_run_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_job_runs(&self, job_name: &str, limit: i64) -> Result<Vec<JobRunRow>> {
        sqlx::query_as::<_, JobRunRow>(
            "SELECT * FROM job_runs WHERE job_name = ? ORDER BY started_at DESC LIMIT ?",
        )
        .bind(job_name)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch job runs")
    }

    pub async fn get_job_items(&self, job_run_id: &str) -> Result<Vec<JobRunItemRow>> {
        sqlx::query_as::<_, JobRunItemRow>(
            "SELECT * FROM job_run_items WHERE job_run_id = ? ORDER BY id",
        )
        .bind(job_run_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch job run items")
    }

    // ==================== Meta ====================

    pub async fn set_meta(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO meta (key, value) VALUES (?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = datetime('now')
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_meta(&self, key: &str) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM meta WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|(v,)| v))
    }

    /// Get the connection pool (for advanced queries).
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_position_lifecycle() {
        let db = Database::in_memory().await.unwrap();

        let id = db
            .create_pending_position("XYZ", 100, 50.0, 1001)
            .await
            .unwrap();

        let pos = db.get_position(id).await.unwrap().unwrap();
        assert_eq!(pos.status, "pending");

        db.confirm_position_open(id, 100, 50.25, 47.74).await.unwrap();
        let pos = db.get_position(id).await.unwrap().unwrap();
        assert_eq!(pos.status, "open");
        assert_eq!(pos.entry_price, 50.25);
        assert_eq!(pos.initial_stop_price, 47.74);

        db.close_position(id, 55.0, 475.0).await.unwrap();
        let pos = db.get_position(id).await.unwrap().unwrap();
        assert_eq!(pos.status, "closed");
        assert_eq!(pos.realized_pnl, Some(475.0));
        assert!(pos.closed_at.is_some());
    }

    #[tokio::test]
    async fn test_pending_update_merge() {
        let db = Database::in_memory().await.unwrap();
        let id = db.create_open_position("ABC", 50, 20.0, 19.0, 20.0).await.unwrap();

        db.upsert_pending_update(id, "ABC", 19.0, 19.5, "timeout")
            .await
            .unwrap();
        db.upsert_pending_update(id, "ABC", 19.0, 19.8, "timeout again")
            .await
            .unwrap();

        // Second failure merged into the existing record, no duplicate
        let pending = db.get_pending_updates().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].new_stop, 19.8);
        assert_eq!(pending[0].old_stop, 19.0);
    }

    #[tokio::test]
    async fn test_consecutive_losses_walk() {
        let db = Database::in_memory().await.unwrap();

        for (i, pnl) in [100.0, -50.0, -30.0].iter().enumerate() {
            let id = db
                .create_open_position(&format!("S{}", i), 10, 10.0, 9.0, 10.0)
                .await
                .unwrap();
            db.close_position(id, 10.0, *pnl).await.unwrap();
            // Distinct closed_at ordering
            sqlx::query("UPDATE positions SET closed_at = datetime('now', ? || ' seconds') WHERE id = ?")
                .bind(i as i64 - 10)
                .bind(id)
                .execute(db.pool())
                .await
                .unwrap();
        }

        // Two most recent closes are losses, the one before was a win
        assert_eq!(db.consecutive_losses(None).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_safety_state_round_trip() {
        let db = Database::in_memory().await.unwrap();

        let mut state = db.get_safety_state().await.unwrap();
        assert_eq!(state.mode, "paper");
        assert!(!state.is_paused);

        state.is_paused = true;
        state.pause_reason = Some("daily_limit".to_string());
        state.consecutive_losses = 2;
        db.save_safety_state(&state).await.unwrap();

        let reloaded = db.get_safety_state().await.unwrap();
        assert!(reloaded.is_paused);
        assert_eq!(reloaded.pause_reason.as_deref(), Some("daily_limit"));
        assert_eq!(reloaded.consecutive_losses, 2);
    }

    #[tokio::test]
    async fn test_job_run_accounting() {
        let db = Database::in_memory().await.unwrap();

        let run_id = db.create_job_run("trailing_stop_reassessment").await.unwrap();
        db.append_job_item(&run_id, "XYZ", "raised", Some("47.50 -> 48.20"))
            .await
            .unwrap();
        db.append_job_item(&run_id, "ABC", "unchanged", None).await.unwrap();
        db.finalize_job_run(&run_id, "success", 2, 1, 0).await.unwrap();

        let runs = db.get_job_runs("trailing_stop_reassessment", 10).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, "success");
        assert_eq!(runs[0].checked, 2);

        let items = db.get_job_items(&run_id).await.unwrap();
        assert_eq!(items.len(), 2);
    }
}
