//! Supervisor lifecycle against a file-backed ledger: restart recovery,
//! concurrent jobs, failure escalation, and scheduler shutdown.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use stacker::engine::{
    Supervisor, SupervisorSettings, TickAttempt, TickOutcome, TickScheduler, TradeRateCounter,
};
use stacker::storage::LedgerStore;
use stacker::types::{AccumulateConfig, JobStatus, Token};

use crate::mock_ports::{FailPoint, MockMarket};

/// A temp SQLite file removed on drop.
struct TempDb {
    path: std::path::PathBuf,
}

impl TempDb {
    fn new() -> Self {
        let mut path = std::env::temp_dir();
        path.push(format!("stacker_it_{}.db", uuid::Uuid::new_v4()));
        Self { path }
    }

    fn url(&self) -> String {
        format!("sqlite://{}", self.path.to_string_lossy())
    }
}

impl Drop for TempDb {
    fn drop(&mut self) {
        let p = self.path.to_string_lossy().to_string();
        let _ = std::fs::remove_file(&p);
        let _ = std::fs::remove_file(format!("{p}-wal"));
        let _ = std::fs::remove_file(format!("{p}-shm"));
    }
}

fn strategy() -> AccumulateConfig {
    AccumulateConfig {
        dca_amount_usd: 20.0,
        dca_interval_hours: 24.0,
        dip_buy_threshold_pct: 0.0,
        ..AccumulateConfig::default()
    }
}

fn supervisor(store: LedgerStore, market: &Arc<MockMarket>, settings: SupervisorSettings) -> Arc<Supervisor> {
    Arc::new(Supervisor::new(
        store,
        market.ports(),
        settings,
        Arc::new(TradeRateCounter::new(None)),
    ))
}

#[tokio::test]
async fn test_restart_resumes_from_job_row() {
    let db = TempDb::new();
    let market = MockMarket::new(vec![4.0], 1000.0);
    let token = Token::new("0xRESTART", "RST", "base", "USDC");

    let first = {
        let store = LedgerStore::connect(&db.url()).await.unwrap();
        let sup = supervisor(store.clone(), &market, SupervisorSettings::default());
        let job = sup.start_job(&token, strategy()).await.unwrap();
        assert!(matches!(
            sup.try_tick(&job.id).await.unwrap(),
            TickAttempt::Ran(TickOutcome::Traded(_))
        ));
        let row = store.require_job(&job.id).await.unwrap();
        store.close().await;
        row
    };
    assert_eq!(first.token_balance, 5.0);

    // New process: same file, the row is still RUNNING.
    let store = LedgerStore::connect(&db.url()).await.unwrap();
    let sup = supervisor(store.clone(), &market, SupervisorSettings::default());
    let job = sup.start_job(&token, strategy()).await.unwrap();
    assert_eq!(job.id, first.id);
    assert_eq!(job.status, JobStatus::Running);
    assert_eq!(job.accumulation_state(), first.accumulation_state());

    // The restored DCA clock means nothing is due.
    assert!(matches!(
        sup.try_tick(&job.id).await.unwrap(),
        TickAttempt::Ran(TickOutcome::NoAction)
    ));
    assert_eq!(store.list_trades(&job.id, 10).await.unwrap().len(), 1);
    assert_eq!(market.fills().len(), 1);
    store.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_distinct_jobs_tick_concurrently() {
    let db = TempDb::new();
    let market = MockMarket::new(vec![2.0], 1000.0);
    let store = LedgerStore::connect(&db.url()).await.unwrap();
    let sup = supervisor(store.clone(), &market, SupervisorSettings::default());

    let a = sup
        .start_job(&Token::new("0xAAA", "AAA", "base", "USDC"), strategy())
        .await
        .unwrap();
    let b = sup
        .start_job(&Token::new("0xBBB", "BBB", "base", "USDC"), strategy())
        .await
        .unwrap();

    let (ra, rb) = tokio::join!(sup.try_tick(&a.id), sup.try_tick(&b.id));
    assert!(matches!(ra.unwrap(), TickAttempt::Ran(TickOutcome::Traded(_))));
    assert!(matches!(rb.unwrap(), TickAttempt::Ran(TickOutcome::Traded(_))));

    for id in [&a.id, &b.id] {
        let row = store.require_job(id).await.unwrap();
        assert_eq!(row.token_balance, 10.0);
        assert_eq!(store.list_trades(id, 10).await.unwrap().len(), 1);
    }
    assert_eq!(market.quote_balance(), 960.0);
    store.close().await;
}

#[tokio::test]
async fn test_port_failures_escalate_then_recover() {
    let store = LedgerStore::in_memory().await.unwrap();
    let market = MockMarket::new(vec![1.0], 1000.0);
    let settings = SupervisorSettings {
        max_consecutive_failures: 2,
        ..SupervisorSettings::default()
    };
    let sup = supervisor(store.clone(), &market, settings);
    let job = sup
        .start_job(&Token::new("0xFAIL", "FAIL", "base", "USDC"), strategy())
        .await
        .unwrap();

    market.fail(FailPoint::Balance, "rpc down");
    assert!(matches!(sup.try_tick(&job.id).await.unwrap(), TickAttempt::Failed(_)));
    assert!(matches!(sup.try_tick(&job.id).await.unwrap(), TickAttempt::Failed(_)));

    let row = store.require_job(&job.id).await.unwrap();
    assert_eq!(row.status, JobStatus::Error);
    assert_eq!(row.error_count, 2);
    assert!(row.last_error.as_deref().unwrap().contains("rpc down"));
    // Position fields survive the ERROR transition untouched.
    assert_eq!(row.token_balance, 0.0);
    assert!(market.fills().is_empty());

    market.clear_error();
    sup.resume(&job.id).await.unwrap();
    assert!(matches!(
        sup.try_tick(&job.id).await.unwrap(),
        TickAttempt::Ran(TickOutcome::Traded(_))
    ));
}

#[tokio::test]
async fn test_scheduler_shutdown_pauses_jobs() {
    let db = TempDb::new();
    let market = MockMarket::new(vec![1.0], 1000.0);
    let store = LedgerStore::connect(&db.url()).await.unwrap();
    let sup = supervisor(store.clone(), &market, SupervisorSettings::default());
    let job = sup
        .start_job(&Token::new("0xSCHED", "SCH", "base", "USDC"), strategy())
        .await
        .unwrap();

    let (tx, rx) = watch::channel(false);
    let task = tokio::spawn(TickScheduler::new(sup.clone(), Duration::from_millis(25)).run(rx));
    tokio::time::sleep(Duration::from_millis(200)).await;
    tx.send(true).unwrap();
    task.await.unwrap();

    assert_eq!(sup.pause_all().await, 1);
    let row = store.require_job(&job.id).await.unwrap();
    assert_eq!(row.status, JobStatus::Paused);
    assert!(row.paused_at.is_some());
    // Daily DCA: many ticks, one trade.
    assert_eq!(store.list_trades(&job.id, 10).await.unwrap().len(), 1);
    store.close().await;
}
