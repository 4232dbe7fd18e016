//! Job supervisor.
//!
//! Owns one `AccumulationEngine` per job behind a per-job async mutex.
//! Ticks take the mutex with `try_lock` and skip when it is held;
//! administrative operations wait for it, so a pause or reset never
//! interleaves with an in-flight tick. Lifecycle transitions and the
//! failure escalation policy live here, not in the engine.

use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use super::accumulator::{AccumulationEngine, TickError, TickOutcome};
use super::rate::TradeRateCounter;
use crate::ports::Ports;
use crate::storage::LedgerStore;
use crate::types::{
    AccumulateConfig, Job, JobMode, JobStatus, LedgerTotals, StackerError, Token, Trade,
};

// ---------------------------------------------------------------------------
// Settings and reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub dry_run: bool,
    /// Consecutive failed ticks that move a job to ERROR.
    pub max_consecutive_failures: u32,
    /// Trades included in a status report.
    pub recent_trades: u32,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            dry_run: false,
            max_consecutive_failures: 5,
            recent_trades: 20,
        }
    }
}

/// Result of a scheduler-initiated tick.
#[derive(Debug)]
pub enum TickAttempt {
    Ran(TickOutcome),
    Failed(TickError),
    /// A previous tick still holds the job.
    Skipped,
    /// The job is not RUNNING.
    Inactive(JobStatus),
}

/// Snapshot returned by `status`.
#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    #[serde(flatten)]
    pub job: Job,
    pub avg_buy_price: f64,
    pub ledger: LedgerTotals,
    pub recent_trades: Vec<Trade>,
}

// ---------------------------------------------------------------------------
// Per-job runtime
// ---------------------------------------------------------------------------

struct JobRuntime {
    engine: AccumulationEngine,
    /// Mirrors the row; every lifecycle write goes through this guard.
    status: JobStatus,
    consecutive_failures: u32,
}

struct JobHandle {
    runtime: Mutex<JobRuntime>,
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

pub struct Supervisor {
    store: LedgerStore,
    ports: Ports,
    settings: SupervisorSettings,
    rate: Arc<TradeRateCounter>,
    jobs: RwLock<HashMap<String, Arc<JobHandle>>>,
}

impl Supervisor {
    pub fn new(
        store: LedgerStore,
        ports: Ports,
        settings: SupervisorSettings,
        rate: Arc<TradeRateCounter>,
    ) -> Self {
        Self {
            store,
            ports,
            settings,
            rate,
            jobs: RwLock::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &LedgerStore {
        &self.store
    }

    pub fn rate_counter(&self) -> &Arc<TradeRateCounter> {
        &self.rate
    }

    pub fn settings(&self) -> &SupervisorSettings {
        &self.settings
    }

    /// Ids of every job with a live engine.
    pub async fn job_ids(&self) -> Vec<String> {
        self.jobs.read().await.keys().cloned().collect()
    }

    /// Create the job for `token` if needed and put it in RUNNING.
    ///
    /// An existing row is resumed with `strategy` replacing its stored
    /// parameters. A row still marked RUNNING from a previous process is
    /// taken over as-is.
    pub async fn start_job(
        &self,
        token: &Token,
        strategy: AccumulateConfig,
    ) -> Result<Job, StackerError> {
        strategy.validate()?;
        let blob = serde_json::to_value(&strategy)
            .map_err(|e| StackerError::InvalidConfig(e.to_string()))?;

        let mut job = match self.store.get_job_by_token(&token.address).await? {
            Some(job) => job,
            None => {
                let job = Job::new(token, JobMode::Accumulate, blob.clone(), Utc::now());
                self.store.create_job(&job).await?
            }
        };
        job.config = blob;

        let (handle, created) = self.register(&job).await?;
        let mut rt = handle.runtime.lock().await;
        rt.engine.set_config(strategy);
        self.begin_session(&mut rt, created).await
    }

    /// Register engines for stored jobs not started this session.
    ///
    /// Rows left RUNNING by a process that died without pausing are
    /// paused until an operator resumes them.
    pub async fn restore(&self) -> Result<usize, StackerError> {
        let mut restored = 0;
        for job in self.store.list_jobs().await? {
            if self.jobs.read().await.contains_key(&job.id) {
                continue;
            }
            let (handle, _) = match self.register(&job).await {
                Ok(registered) => registered,
                Err(e) => {
                    warn!(job_id = %job.id, token = %job.token_symbol, error = %e, "Stored job not restored");
                    continue;
                }
            };
            if job.status == JobStatus::Running {
                warn!(job_id = %job.id, token = %job.token_symbol, "Job was RUNNING at last shutdown; pausing");
                let mut rt = handle.runtime.lock().await;
                self.transition(&mut rt, JobStatus::Paused).await?;
            }
            restored += 1;
        }
        Ok(restored)
    }

    /// Run one tick for `job_id` unless one is already in flight.
    pub async fn try_tick(&self, job_id: &str) -> Result<TickAttempt, StackerError> {
        let handle = self.handle(job_id).await?;
        let Ok(mut rt) = handle.runtime.try_lock() else {
            info!(job_id, "Tick skipped: previous tick still running");
            return Ok(TickAttempt::Skipped);
        };
        if rt.status != JobStatus::Running {
            return Ok(TickAttempt::Inactive(rt.status));
        }

        match rt.engine.tick().await {
            Ok(outcome) => {
                rt.consecutive_failures = 0;
                debug!(job_id, %outcome, "Tick complete");
                Ok(TickAttempt::Ran(outcome))
            }
            Err(e) => {
                self.record_tick_failure(&mut rt, &e).await?;
                Ok(TickAttempt::Failed(e))
            }
        }
    }

    pub async fn pause(&self, job_id: &str) -> Result<Job, StackerError> {
        let handle = self.handle(job_id).await?;
        let mut rt = handle.runtime.lock().await;
        self.transition(&mut rt, JobStatus::Paused).await
    }

    pub async fn resume(&self, job_id: &str) -> Result<Job, StackerError> {
        let handle = self.handle(job_id).await?;
        let mut rt = handle.runtime.lock().await;
        self.begin_session(&mut rt, false).await
    }

    /// Sell the whole position, then return to IDLE.
    ///
    /// A failed or partial sale leaves the job LIQUIDATING with
    /// `last_error` set; calling again retries.
    pub async fn liquidate(&self, job_id: &str) -> Result<Job, StackerError> {
        let handle = self.handle(job_id).await?;
        let mut rt = handle.runtime.lock().await;

        if rt.status != JobStatus::Liquidating {
            self.transition(&mut rt, JobStatus::Liquidating).await?;
        }
        info!(job_id, "Liquidating");

        let result = rt.engine.liquidate().await;
        let now = Utc::now();
        let mut job = self.store.require_job(job_id).await?;

        let failure = match result {
            Ok(TickOutcome::DryRun { .. }) | Ok(TickOutcome::NoAction) => None,
            Ok(_) if rt.engine.current_state().token_balance > 0.0 => Some(format!(
                "liquidation partially filled; {} units remain",
                rt.engine.current_state().token_balance
            )),
            Ok(_) => None,
            Err(e) => Some(format!("liquidation failed: {e}")),
        };

        match failure {
            Some(message) => {
                warn!(job_id, error = %message, "Liquidation incomplete");
                job.last_error = Some(message);
                job.updated_at = now;
            }
            None => {
                job.apply_transition(JobStatus::Idle, now, None)?;
                info!(job_id, token = %job.token_symbol, "Liquidation complete");
            }
        }
        self.store.save_lifecycle(&job).await?;
        rt.status = job.status;
        Ok(job)
    }

    /// Administrative reset to IDLE with zeroed working state.
    pub async fn reset(&self, job_id: &str) -> Result<Job, StackerError> {
        let handle = self.handle(job_id).await?;
        let mut rt = handle.runtime.lock().await;
        let job = self.store.reset_job(job_id, Utc::now()).await?;
        rt.engine.reload(&job);
        rt.status = job.status;
        rt.consecutive_failures = 0;
        Ok(job)
    }

    /// Remove a job and its trade history. Not allowed while it trades.
    pub async fn delete(&self, job_id: &str) -> Result<(), StackerError> {
        let handle = self.handle(job_id).await?;
        let rt = handle.runtime.lock().await;
        if matches!(rt.status, JobStatus::Running | JobStatus::Liquidating) {
            return Err(StackerError::Conflict(format!(
                "job {job_id} is {}; pause it first",
                rt.status
            )));
        }
        self.store.delete_job(job_id).await?;
        drop(rt);
        self.jobs.write().await.remove(job_id);
        Ok(())
    }

    pub async fn status(&self, job_id: &str) -> Result<JobReport, StackerError> {
        let job = self.store.require_job(job_id).await?;
        let ledger = self.store.ledger_totals(job_id).await?;
        let recent_trades = self
            .store
            .list_trades(job_id, self.settings.recent_trades)
            .await?;
        Ok(JobReport {
            avg_buy_price: job.avg_buy_price(),
            job,
            ledger,
            recent_trades,
        })
    }

    pub async fn list(&self) -> Result<Vec<Job>, StackerError> {
        self.store.list_jobs().await
    }

    /// Shutdown path: wait out in-flight ticks, then pause every RUNNING job.
    pub async fn pause_all(&self) -> usize {
        let handles: Vec<Arc<JobHandle>> = self.jobs.read().await.values().cloned().collect();
        let mut paused = 0;
        for handle in handles {
            let mut rt = handle.runtime.lock().await;
            if rt.status != JobStatus::Running {
                continue;
            }
            match self.transition(&mut rt, JobStatus::Paused).await {
                Ok(_) => paused += 1,
                Err(e) => {
                    error!(job_id = %rt.engine.job_id(), error = %e, "Failed to pause job on shutdown")
                }
            }
        }
        paused
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    async fn handle(&self, job_id: &str) -> Result<Arc<JobHandle>, StackerError> {
        if let Some(handle) = self.jobs.read().await.get(job_id) {
            return Ok(handle.clone());
        }
        let job = self.store.require_job(job_id).await?;
        Ok(self.register(&job).await?.0)
    }

    /// Returns the handle and whether it was created by this call.
    async fn register(&self, job: &Job) -> Result<(Arc<JobHandle>, bool), StackerError> {
        let mut jobs = self.jobs.write().await;
        if let Some(handle) = jobs.get(&job.id) {
            return Ok((handle.clone(), false));
        }
        if job.mode != JobMode::Accumulate {
            return Err(StackerError::InvalidConfig(format!(
                "job {}: {} mode is not supported",
                job.id, job.mode
            )));
        }

        let engine = AccumulationEngine::new(
            job,
            self.ports.clone(),
            self.store.clone(),
            self.settings.dry_run,
        )?
        .with_rate_counter(self.rate.clone());
        let handle = Arc::new(JobHandle {
            runtime: Mutex::new(JobRuntime {
                engine,
                status: job.status,
                consecutive_failures: 0,
            }),
        });
        jobs.insert(job.id.clone(), handle.clone());
        Ok((handle, true))
    }

    async fn transition(
        &self,
        rt: &mut JobRuntime,
        next: JobStatus,
    ) -> Result<Job, StackerError> {
        let mut job = self.store.require_job(rt.engine.job_id()).await?;
        let previous = job.status;
        job.apply_transition(next, Utc::now(), None)?;
        self.store.save_lifecycle(&job).await?;
        rt.status = next;
        info!(job_id = %job.id, token = %job.token_symbol, from = %previous, to = %next, "Job status changed");
        Ok(job)
    }

    /// Enter RUNNING. `recovered` marks a handle created for a row the
    /// previous process left RUNNING.
    async fn begin_session(
        &self,
        rt: &mut JobRuntime,
        recovered: bool,
    ) -> Result<Job, StackerError> {
        let now = Utc::now();
        let mut job = self.store.require_job(rt.engine.job_id()).await?;
        let previous = job.status;

        match previous {
            JobStatus::Running if recovered => {
                warn!(job_id = %job.id, token = %job.token_symbol, "Recovering job left RUNNING by a previous process");
                job.started_at = Some(now);
                job.updated_at = now;
            }
            JobStatus::Error => {
                warn!(
                    job_id = %job.id,
                    last_error = job.last_error.as_deref().unwrap_or("-"),
                    error_count = job.error_count,
                    "Resuming job from ERROR"
                );
                job.apply_transition(JobStatus::Running, now, None)?;
            }
            _ => job.apply_transition(JobStatus::Running, now, None)?,
        }

        let blob = serde_json::to_value(rt.engine.config())
            .map_err(|e| StackerError::InvalidConfig(e.to_string()))?;
        if blob != job.config {
            info!(job_id = %job.id, "Strategy parameters changed; stored config replaced");
            self.store.save_config(&job.id, &blob, now).await?;
            job.config = blob;
        }

        self.store.save_lifecycle(&job).await?;
        rt.engine.reload(&job);
        rt.status = JobStatus::Running;
        rt.consecutive_failures = 0;
        info!(
            job_id = %job.id,
            token = %job.token_symbol,
            from = %previous,
            dry_run = rt.engine.is_dry_run(),
            "Job running"
        );
        Ok(job)
    }

    /// Count a failed tick; escalate to ERROR at the threshold.
    async fn record_tick_failure(
        &self,
        rt: &mut JobRuntime,
        err: &TickError,
    ) -> Result<(), StackerError> {
        rt.consecutive_failures += 1;
        let job_id = rt.engine.job_id().to_string();
        let message = err.to_string();
        let now = Utc::now();

        if rt.consecutive_failures >= self.settings.max_consecutive_failures {
            let mut job = self.store.require_job(&job_id).await?;
            job.apply_transition(JobStatus::Error, now, Some(&message))?;
            self.store.save_lifecycle(&job).await?;
            rt.status = JobStatus::Error;
            error!(
                job_id,
                failures = rt.consecutive_failures,
                error = %message,
                "Too many consecutive tick failures; job halted"
            );
        } else {
            self.store.record_failure(&job_id, &message, now).await?;
            warn!(
                job_id,
                failures = rt.consecutive_failures,
                max = self.settings.max_consecutive_failures,
                error = %message,
                "Tick failed"
            );
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
