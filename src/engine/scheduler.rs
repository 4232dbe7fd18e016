//! Tick scheduler.
//!
//! A fixed-interval timer fans out one tick per registered job. Each tick
//! runs as its own task so a slow venue on one token never delays the
//! others; a job whose previous tick is still running skips the fire.
//! A second, hourly timer zeroes the shared trade-rate counter.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::supervisor::{Supervisor, TickAttempt};

const RATE_WINDOW: Duration = Duration::from_secs(3600);

pub struct TickScheduler {
    supervisor: Arc<Supervisor>,
    interval: Duration,
    rate_window: Duration,
}

impl TickScheduler {
    pub fn new(supervisor: Arc<Supervisor>, interval: Duration) -> Self {
        Self {
            supervisor,
            interval,
            rate_window: RATE_WINDOW,
        }
    }

    /// Override the trade-rate window (tests).
    pub fn with_rate_window(mut self, window: Duration) -> Self {
        self.rate_window = window;
        self
    }

    /// Fire ticks until `shutdown` flips to true (or its sender drops).
    ///
    /// In-flight ticks are awaited before returning; none are cancelled.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut rate_reset =
            time::interval_at(time::Instant::now() + self.rate_window, self.rate_window);
        rate_reset.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut in_flight: JoinSet<()> = JoinSet::new();

        info!(
            interval_secs = self.interval.as_secs_f64(),
            "Scheduler started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    for job_id in self.supervisor.job_ids().await {
                        let supervisor = self.supervisor.clone();
                        in_flight.spawn(async move {
                            run_tick(&supervisor, &job_id).await;
                        });
                    }
                }
                _ = rate_reset.tick() => {
                    self.supervisor.rate_counter().reset();
                }
                Some(joined) = in_flight.join_next() => {
                    if let Err(e) = joined {
                        error!(error = %e, "Tick task panicked");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!(in_flight = in_flight.len(), "Scheduler stopping; waiting for in-flight ticks");
        while let Some(joined) = in_flight.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Tick task panicked");
            }
        }
        info!("Scheduler stopped");
    }
}

async fn run_tick(supervisor: &Supervisor, job_id: &str) {
    match supervisor.try_tick(job_id).await {
        Ok(TickAttempt::Ran(outcome)) => debug!(job_id, %outcome, "Tick ran"),
        Ok(TickAttempt::Failed(e)) => debug!(job_id, error = %e, "Tick failed"),
        Ok(TickAttempt::Skipped) => {}
        Ok(TickAttempt::Inactive(_)) => {}
        Err(e) => warn!(job_id, error = %e, "Tick could not run"),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::rate::TradeRateCounter;
    use crate::engine::supervisor::SupervisorSettings;
    use crate::ports::paper::PaperVenue;
    use crate::ports::Ports;
    use crate::storage::LedgerStore;
    use crate::types::{AccumulateConfig, JobStatus, Token};

    const TOKEN: &str = "0xsched";

    async fn running_supervisor(venue: Arc<PaperVenue>) -> (Arc<Supervisor>, String) {
        venue.set_price(TOKEN, 1.0);
        let store = LedgerStore::in_memory().await.unwrap();
        let sup = Arc::new(Supervisor::new(
            store,
            Ports::paper(venue),
            SupervisorSettings::default(),
            Arc::new(TradeRateCounter::new(Some(100))),
        ));
        let strategy = AccumulateConfig {
            dip_buy_threshold_pct: 0.0,
            ..AccumulateConfig::default()
        };
        let job = sup
            .start_job(&Token::new(TOKEN, "SCH", "base", "USDC"), strategy)
            .await
            .unwrap();
        (sup, job.id)
    }

    #[tokio::test]
    async fn test_slow_tick_is_never_overlapped_and_finishes_on_shutdown() {
        let venue = Arc::new(PaperVenue::new(1000.0).with_latency(Duration::from_millis(300)));
        let (sup, job_id) = running_supervisor(venue.clone()).await;

        let (tx, rx) = watch::channel(false);
        let scheduler = TickScheduler::new(sup.clone(), Duration::from_millis(20));
        let task = tokio::spawn(scheduler.run(rx));

        // Many fires land while the first tick sits in the venue.
        tokio::time::sleep(Duration::from_millis(120)).await;
        tx.send(true).unwrap();
        task.await.unwrap();

        // The in-flight tick completed; nothing else executed.
        assert_eq!(venue.executions().len(), 1);
        let trades = sup.store().list_trades(&job_id, 10).await.unwrap();
        assert_eq!(trades.len(), 1);

        assert_eq!(sup.pause_all().await, 1);
        let job = sup.store().require_job(&job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Paused);
    }

    #[tokio::test]
    async fn test_rate_counter_reset_by_timer() {
        let venue = Arc::new(PaperVenue::new(1000.0));
        let (sup, _job_id) = running_supervisor(venue).await;
        sup.rate_counter().try_acquire();

        let (tx, rx) = watch::channel(false);
        let scheduler = TickScheduler::new(sup.clone(), Duration::from_secs(3600))
            .with_rate_window(Duration::from_millis(50));
        let task = tokio::spawn(scheduler.run(rx));

        // The first interval fire ticks immediately and takes a slot; the
        // window reset clears it afterwards.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(sup.rate_counter().count(), 0);

        drop(tx);
        task.await.unwrap();
    }
}
