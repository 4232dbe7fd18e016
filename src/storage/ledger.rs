//! Trade ledger and accumulation-state writes.
//!
//! `record_trade_and_update_state` is the only way a trade enters the
//! ledger: the trade row and the job's running totals commit together or
//! not at all.

use chrono::{DateTime, Utc};
use sqlx::Row;
use tracing::{debug, info};

use super::{JobRow, LedgerStore, TradeRow, JOB_COLUMNS, TRADE_COLUMNS};
use crate::types::{
    AccumulationState, Job, LedgerTotals, NewTrade, StackerError, Trade, TradeStatus,
};

impl LedgerStore {
    /// Insert `trade` and write `state` to the job in one transaction.
    ///
    /// Returns the stored trade and the job as committed.
    pub async fn record_trade_and_update_state(
        &self,
        job_id: &str,
        trade: &NewTrade,
        state: &AccumulationState,
        now: DateTime<Utc>,
    ) -> Result<(Trade, Job), StackerError> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE jobs SET
                last_dca_buy_time = ?,
                recent_high = ?,
                recent_high_time = ?,
                total_accumulated = ?,
                token_balance = ?,
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(state.last_dca_buy_time)
        .bind(state.recent_high)
        .bind(state.recent_high_time)
        .bind(state.total_accumulated)
        .bind(state.token_balance)
        .bind(now)
        .bind(job_id)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            // Dropping `tx` rolls back.
            return Err(StackerError::NotFound(job_id.to_string()));
        }

        let trade_id = uuid::Uuid::new_v4().to_string();
        let executed_at = (trade.status == TradeStatus::Executed).then_some(now);
        sqlx::query(
            r#"
            INSERT INTO trades (
                id, job_id, side, reason, base_amount, quote_amount, price_usd,
                tx_hash, status, error, created_at, executed_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&trade_id)
        .bind(job_id)
        .bind(trade.side.as_str())
        .bind(trade.reason.as_str())
        .bind(trade.base_amount)
        .bind(trade.quote_amount)
        .bind(trade.price_usd)
        .bind(&trade.tx_hash)
        .bind(trade.status.as_str())
        .bind(&trade.error)
        .bind(now)
        .bind(executed_at)
        .execute(&mut *tx)
        .await?;

        let job_sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?");
        let job_row: JobRow = sqlx::query_as(&job_sql)
            .bind(job_id)
            .fetch_one(&mut *tx)
            .await?;
        let trade_sql = format!("SELECT {TRADE_COLUMNS} FROM trades WHERE id = ?");
        let trade_row: TradeRow = sqlx::query_as(&trade_sql)
            .bind(&trade_id)
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;

        let job = Job::try_from(job_row)?;
        let trade = Trade::try_from(trade_row)?;
        info!(
            job_id,
            trade_id = %trade.id,
            side = %trade.side,
            reason = %trade.reason,
            base = trade.base_amount,
            quote = format!("${:.2}", trade.quote_amount),
            balance = job.token_balance,
            "Trade recorded"
        );
        Ok((trade, job))
    }

    /// Write accumulation fields without a trade (recent-high decay,
    /// dry-run bookkeeping). One statement, so atomic on its own.
    pub async fn update_working_state(
        &self,
        job_id: &str,
        state: &AccumulationState,
        now: DateTime<Utc>,
    ) -> Result<(), StackerError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs SET
                last_dca_buy_time = ?,
                recent_high = ?,
                recent_high_time = ?,
                total_accumulated = ?,
                token_balance = ?,
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(state.last_dca_buy_time)
        .bind(state.recent_high)
        .bind(state.recent_high_time)
        .bind(state.total_accumulated)
        .bind(state.token_balance)
        .bind(now)
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StackerError::NotFound(job_id.to_string()));
        }
        debug!(job_id, recent_high = state.recent_high, "Working state saved");
        Ok(())
    }

    pub async fn get_trade(&self, trade_id: &str) -> Result<Option<Trade>, StackerError> {
        let sql = format!("SELECT {TRADE_COLUMNS} FROM trades WHERE id = ?");
        let row: Option<TradeRow> = sqlx::query_as(&sql)
            .bind(trade_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Trade::try_from).transpose()
    }

    /// Most recent trades for a job, newest first.
    pub async fn list_trades(&self, job_id: &str, limit: u32) -> Result<Vec<Trade>, StackerError> {
        let sql = format!(
            "SELECT {TRADE_COLUMNS} FROM trades WHERE job_id = ? \
             ORDER BY created_at DESC, rowid DESC LIMIT ?"
        );
        let rows: Vec<TradeRow> = sqlx::query_as(&sql)
            .bind(job_id)
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Trade::try_from).collect()
    }

    /// Totals over the job's executed trades.
    pub async fn ledger_totals(&self, job_id: &str) -> Result<LedgerTotals, StackerError> {
        let row = sqlx::query(
            r#"
            SELECT
                COALESCE(SUM(CASE WHEN side = 'BUY' THEN quote_amount END), 0.0) AS buy_quote,
                COALESCE(SUM(CASE WHEN side = 'BUY' THEN base_amount END), 0.0) AS buy_base,
                COALESCE(SUM(CASE WHEN side = 'SELL' THEN base_amount END), 0.0) AS sell_base,
                COUNT(*) AS trade_count
            FROM trades
            WHERE job_id = ? AND status = 'EXECUTED'
            "#,
        )
        .bind(job_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(LedgerTotals {
            buy_quote: row.try_get("buy_quote")?,
            buy_base: row.try_get("buy_base")?,
            sell_base: row.try_get("sell_base")?,
            trade_count: row.try_get("trade_count")?,
        })
    }

    /// Update the mutable settlement columns of a trade.
    ///
    /// `tx_hash` and `error` are only overwritten when provided;
    /// `executed_at` is stamped the first time status becomes EXECUTED.
    pub async fn backfill_trade(
        &self,
        trade_id: &str,
        status: TradeStatus,
        tx_hash: Option<&str>,
        error: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Trade, StackerError> {
        let executed_at = (status == TradeStatus::Executed).then_some(now);
        let result = sqlx::query(
            r#"
            UPDATE trades SET
                status = ?,
                tx_hash = COALESCE(?, tx_hash),
                error = COALESCE(?, error),
                executed_at = COALESCE(executed_at, ?)
            WHERE id = ?
            "#,
        )
        .bind(status.as_str())
        .bind(tx_hash)
        .bind(error)
        .bind(executed_at)
        .bind(trade_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StackerError::NotFound(trade_id.to_string()));
        }
        self.get_trade(trade_id)
            .await?
            .ok_or_else(|| StackerError::NotFound(trade_id.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
