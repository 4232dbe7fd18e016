//! Persistence layer.
//!
//! SQLite ledger holding two tables: `jobs` (one row per managed token,
//! the authoritative running totals) and `trades` (append-only history).
//! Restart reads the job row directly; the trade ledger is never replayed.
//!
//! Every mutation that touches both tables goes through a single
//! transaction (see `ledger.rs`).

mod jobs;
mod ledger;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

use crate::types::{Job, StackerError, Trade};

/// Default database URL.
pub const DEFAULT_DATABASE_URL: &str = "sqlite://stacker.db";

/// How long a writer waits on SQLite's lock before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

const MAX_CONNECTIONS: u32 = 8;

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS jobs (
        id TEXT PRIMARY KEY,
        token_address TEXT NOT NULL UNIQUE,
        token_symbol TEXT NOT NULL,
        chain TEXT NOT NULL,
        quote_token TEXT NOT NULL,
        mode TEXT NOT NULL,
        status TEXT NOT NULL,
        last_dca_buy_time TEXT,
        recent_high REAL NOT NULL DEFAULT 0 CHECK (recent_high >= 0),
        recent_high_time TEXT,
        total_accumulated REAL NOT NULL DEFAULT 0,
        token_balance REAL NOT NULL DEFAULT 0 CHECK (token_balance >= 0),
        last_error TEXT,
        error_count INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        started_at TEXT,
        paused_at TEXT,
        config TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS trades (
        id TEXT PRIMARY KEY,
        job_id TEXT NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
        side TEXT NOT NULL CHECK (side IN ('BUY', 'SELL')),
        reason TEXT NOT NULL,
        base_amount REAL NOT NULL CHECK (base_amount >= 0),
        quote_amount REAL NOT NULL CHECK (quote_amount >= 0),
        price_usd REAL NOT NULL,
        tx_hash TEXT,
        status TEXT NOT NULL,
        error TEXT,
        created_at TEXT NOT NULL,
        executed_at TEXT
    )",
    "CREATE INDEX IF NOT EXISTS idx_trades_job_created ON trades(job_id, created_at)",
];

/// Handle to the job/trade ledger. Cheap to clone.
#[derive(Clone)]
pub struct LedgerStore {
    pool: SqlitePool,
}

impl LedgerStore {
    /// Open (creating if needed) the database at `url` and apply the schema.
    pub async fn connect(url: &str) -> Result<Self, StackerError> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        info!(url, "Ledger store opened");
        Ok(store)
    }

    /// A private in-memory database.
    ///
    /// Each SQLite memory connection is its own database, so the pool is
    /// pinned to one connection that never expires.
    pub async fn in_memory() -> Result<Self, StackerError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), StackerError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        debug!("Schema applied");
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

#[derive(Debug, sqlx::FromRow)]
struct JobRow {
    id: String,
    token_address: String,
    token_symbol: String,
    chain: String,
    quote_token: String,
    mode: String,
    status: String,
    last_dca_buy_time: Option<DateTime<Utc>>,
    recent_high: f64,
    recent_high_time: Option<DateTime<Utc>>,
    total_accumulated: f64,
    token_balance: f64,
    last_error: Option<String>,
    error_count: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    paused_at: Option<DateTime<Utc>>,
    config: String,
}

impl TryFrom<JobRow> for Job {
    type Error = StackerError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let config = serde_json::from_str(&row.config)
            .map_err(|e| StackerError::Corrupt(format!("job {} config: {e}", row.id)))?;
        Ok(Job {
            mode: row.mode.parse()?,
            status: row.status.parse()?,
            id: row.id,
            token_address: row.token_address,
            token_symbol: row.token_symbol,
            chain: row.chain,
            quote_token: row.quote_token,
            last_dca_buy_time: row.last_dca_buy_time,
            recent_high: row.recent_high,
            recent_high_time: row.recent_high_time,
            total_accumulated: row.total_accumulated,
            token_balance: row.token_balance,
            last_error: row.last_error,
            error_count: row.error_count,
            created_at: row.created_at,
            updated_at: row.updated_at,
            started_at: row.started_at,
            paused_at: row.paused_at,
            config,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct TradeRow {
    id: String,
    job_id: String,
    side: String,
    reason: String,
    base_amount: f64,
    quote_amount: f64,
    price_usd: f64,
    tx_hash: Option<String>,
    status: String,
    error: Option<String>,
    created_at: DateTime<Utc>,
    executed_at: Option<DateTime<Utc>>,
}

impl TryFrom<TradeRow> for Trade {
    type Error = StackerError;

    fn try_from(row: TradeRow) -> Result<Self, Self::Error> {
        Ok(Trade {
            side: row.side.parse()?,
            reason: row.reason.parse()?,
            status: row.status.parse()?,
            id: row.id,
            job_id: row.job_id,
            base_amount: row.base_amount,
            quote_amount: row.quote_amount,
            price_usd: row.price_usd,
            tx_hash: row.tx_hash,
            error: row.error,
            created_at: row.created_at,
            executed_at: row.executed_at,
        })
    }
}

const JOB_COLUMNS: &str = "id, token_address, token_symbol, chain, quote_token, mode, status, \
     last_dca_buy_time, recent_high, recent_high_time, total_accumulated, token_balance, \
     last_error, error_count, created_at, updated_at, started_at, paused_at, config";

const TRADE_COLUMNS: &str = "id, job_id, side, reason, base_amount, quote_amount, price_usd, \
     tx_hash, status, error, created_at, executed_at";

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
