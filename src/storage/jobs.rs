//! Job rows: create, lookup, lifecycle updates, reset, delete.

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use super::{JobRow, LedgerStore, JOB_COLUMNS};
use crate::types::{normalize_address, Job, StackerError};

impl LedgerStore {
    /// Insert a new job. A second job for the same token is a conflict.
    pub async fn create_job(&self, job: &Job) -> Result<Job, StackerError> {
        let config = job.config.to_string();
        let result = sqlx::query(
            r#"
            INSERT INTO jobs (
                id, token_address, token_symbol, chain, quote_token, mode, status,
                last_dca_buy_time, recent_high, recent_high_time, total_accumulated,
                token_balance, last_error, error_count, created_at, updated_at,
                started_at, paused_at, config
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&job.id)
        .bind(normalize_address(&job.token_address))
        .bind(&job.token_symbol)
        .bind(&job.chain)
        .bind(&job.quote_token)
        .bind(job.mode.as_str())
        .bind(job.status.as_str())
        .bind(job.last_dca_buy_time)
        .bind(job.recent_high)
        .bind(job.recent_high_time)
        .bind(job.total_accumulated)
        .bind(job.token_balance)
        .bind(&job.last_error)
        .bind(job.error_count)
        .bind(job.created_at)
        .bind(job.updated_at)
        .bind(job.started_at)
        .bind(job.paused_at)
        .bind(&config)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => {}
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                return Err(StackerError::Conflict(format!(
                    "a job already exists for token {}",
                    job.token_address
                )));
            }
            Err(e) => return Err(e.into()),
        }

        info!(job_id = %job.id, token = %job.token_address, symbol = %job.token_symbol, "Job created");
        self.require_job(&job.id).await
    }

    pub async fn get_job(&self, job_id: &str) -> Result<Option<Job>, StackerError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?");
        let row: Option<JobRow> = sqlx::query_as(&sql)
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Job::try_from).transpose()
    }

    /// Like `get_job`, but a missing row is an error.
    pub async fn require_job(&self, job_id: &str) -> Result<Job, StackerError> {
        self.get_job(job_id)
            .await?
            .ok_or_else(|| StackerError::NotFound(job_id.to_string()))
    }

    pub async fn get_job_by_token(&self, token_address: &str) -> Result<Option<Job>, StackerError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE token_address = ?");
        let row: Option<JobRow> = sqlx::query_as(&sql)
            .bind(normalize_address(token_address))
            .fetch_optional(&self.pool)
            .await?;
        row.map(Job::try_from).transpose()
    }

    pub async fn list_jobs(&self) -> Result<Vec<Job>, StackerError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs ORDER BY created_at");
        let rows: Vec<JobRow> = sqlx::query_as(&sql).fetch_all(&self.pool).await?;
        rows.into_iter().map(Job::try_from).collect()
    }

    /// Persist the lifecycle fields of `job` (status, session timestamps,
    /// error diagnostics). Accumulation fields are not touched.
    pub async fn save_lifecycle(&self, job: &Job) -> Result<(), StackerError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs SET
                status = ?,
                started_at = ?,
                paused_at = ?,
                last_error = ?,
                error_count = ?,
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(job.status.as_str())
        .bind(job.started_at)
        .bind(job.paused_at)
        .bind(&job.last_error)
        .bind(job.error_count)
        .bind(job.updated_at)
        .bind(&job.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StackerError::NotFound(job.id.clone()));
        }
        debug!(job_id = %job.id, status = %job.status, "Lifecycle saved");
        Ok(())
    }

    /// Replace the stored strategy blob.
    pub async fn save_config(
        &self,
        job_id: &str,
        config: &serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<(), StackerError> {
        let result = sqlx::query("UPDATE jobs SET config = ?, updated_at = ? WHERE id = ?")
            .bind(config.to_string())
            .bind(now)
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StackerError::NotFound(job_id.to_string()));
        }
        Ok(())
    }

    /// Count one failed tick: bump `error_count` and record the message.
    pub async fn record_failure(
        &self,
        job_id: &str,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StackerError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs SET
                last_error = ?,
                error_count = error_count + 1,
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(message)
        .bind(now)
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StackerError::NotFound(job_id.to_string()));
        }
        Ok(())
    }

    /// Administrative reset: IDLE, working state and counters zeroed.
    pub async fn reset_job(&self, job_id: &str, now: DateTime<Utc>) -> Result<Job, StackerError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs SET
                status = 'IDLE',
                last_dca_buy_time = NULL,
                recent_high = 0,
                recent_high_time = NULL,
                total_accumulated = 0,
                token_balance = 0,
                last_error = NULL,
                error_count = 0,
                started_at = NULL,
                paused_at = NULL,
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(now)
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StackerError::NotFound(job_id.to_string()));
        }
        info!(job_id, "Job reset");
        self.require_job(job_id).await
    }

    /// Remove a job and, by cascade, its trades.
    pub async fn delete_job(&self, job_id: &str) -> Result<(), StackerError> {
        let result = sqlx::query("DELETE FROM jobs WHERE id = ?")
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StackerError::NotFound(job_id.to_string()));
        }
        info!(job_id, "Job deleted");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::tests::sample_job;
    use crate::types::{AccumulationState, JobStatus};

    #[tokio::test]
    async fn test_create_and_lookup() {
        let store = LedgerStore::in_memory().await.unwrap();
        let job = store.create_job(&sample_job("0xAbC")).await.unwrap();

        assert_eq!(job.token_address, "0xabc");
        assert_eq!(store.require_job(&job.id).await.unwrap(), job);
        assert_eq!(store.get_job_by_token("0xABC").await.unwrap().unwrap().id, job.id);
        assert!(store.get_job("nope").await.unwrap().is_none());
        assert_eq!(store.list_jobs().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_token_is_conflict() {
        let store = LedgerStore::in_memory().await.unwrap();
        store.create_job(&sample_job("0xdup")).await.unwrap();
        let err = store.create_job(&sample_job("0xDUP")).await.unwrap_err();
        assert!(matches!(err, StackerError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_save_lifecycle() {
        let store = LedgerStore::in_memory().await.unwrap();
        let mut job = store.create_job(&sample_job("0x1")).await.unwrap();
        job.apply_transition(JobStatus::Running, Utc::now(), None).unwrap();
        store.save_lifecycle(&job).await.unwrap();

        let loaded = store.require_job(&job.id).await.unwrap();
        assert_eq!(loaded.status, JobStatus::Running);
        assert!(loaded.started_at.is_some());
    }

    #[tokio::test]
    async fn test_record_failure_increments() {
        let store = LedgerStore::in_memory().await.unwrap();
        let job = store.create_job(&sample_job("0x2")).await.unwrap();
        store.record_failure(&job.id, "feed down", Utc::now()).await.unwrap();
        store.record_failure(&job.id, "feed still down", Utc::now()).await.unwrap();

        let loaded = store.require_job(&job.id).await.unwrap();
        assert_eq!(loaded.error_count, 2);
        assert_eq!(loaded.last_error.as_deref(), Some("feed still down"));
    }

    #[tokio::test]
    async fn test_reset_zeroes_state() {
        let store = LedgerStore::in_memory().await.unwrap();
        let job = store.create_job(&sample_job("0x3")).await.unwrap();
        let state = AccumulationState {
            last_dca_buy_time: Some(Utc::now()),
            recent_high: 2.0,
            recent_high_time: Some(Utc::now()),
            total_accumulated: 50.0,
            token_balance: 25.0,
        };
        store.update_working_state(&job.id, &state, Utc::now()).await.unwrap();
        store.record_failure(&job.id, "x", Utc::now()).await.unwrap();

        let reset = store.reset_job(&job.id, Utc::now()).await.unwrap();
        assert_eq!(reset.status, JobStatus::Idle);
        assert_eq!(reset.accumulation_state(), AccumulationState::default());
        assert_eq!(reset.error_count, 0);
        assert!(reset.last_error.is_none());
    }

    #[tokio::test]
    async fn test_missing_job_errors() {
        let store = LedgerStore::in_memory().await.unwrap();
        assert!(matches!(
            store.record_failure("ghost", "x", Utc::now()).await,
            Err(StackerError::NotFound(_))
        ));
        assert!(matches!(
            store.reset_job("ghost", Utc::now()).await,
            Err(StackerError::NotFound(_))
        ));
        assert!(matches!(store.delete_job("ghost").await, Err(StackerError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_save_config() {
        let store = LedgerStore::in_memory().await.unwrap();
        let job = store.create_job(&sample_job("0x4")).await.unwrap();
        let blob = serde_json::json!({"dca_amount_usd": 42.0, "dca_interval_hours": 6.0});
        store.save_config(&job.id, &blob, Utc::now()).await.unwrap();
        assert_eq!(store.require_job(&job.id).await.unwrap().config, blob);
    }
}
