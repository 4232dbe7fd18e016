//! STACKER: tick-driven token accumulation agent
//!
//! Entry point. Loads configuration, initialises structured logging,
//! opens the ledger, starts the configured jobs (resuming any stored
//! state), and runs the tick scheduler with graceful shutdown.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

use stacker::config::{AppConfig, PriceProvider};
use stacker::dashboard;
use stacker::engine::{Supervisor, SupervisorSettings, TickScheduler, TradeRateCounter};
use stacker::ports::dexscreener::DexScreenerClient;
use stacker::ports::paper::PaperVenue;
use stacker::ports::{PriceFeed, Ports};
use stacker::storage::LedgerStore;

const BANNER: &str = r#"
 ____ _____  _    ____ _  _______ ____
/ ___|_   _|/ \  / ___| |/ / ____|  _ \
\___ \ | | / _ \| |   | ' /|  _| | |_) |
 ___) || |/ ___ \ |___| . \| |___|  _ <
|____/ |_/_/   \_\____|_|\_\_____|_| \_\

  DCA, dip buys and take-profit, one tick at a time
  v0.1.0
"#;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    init_logging();

    let config_path = std::env::var("STACKER_CONFIG").unwrap_or_else(|_| "config.toml".into());
    let cfg = AppConfig::load(&config_path)?;

    println!("{BANNER}");
    info!(
        agent_name = %cfg.agent.name,
        tick_interval_secs = cfg.agent.tick_interval_secs,
        dry_run = cfg.agent.dry_run,
        jobs = cfg.jobs.len(),
        "STACKER starting up"
    );

    // -- Components ------------------------------------------------------

    let store = LedgerStore::connect(&cfg.database.url).await?;
    let ports = build_ports(&cfg)?;
    let rate = Arc::new(TradeRateCounter::new(cfg.agent.max_trades_per_hour));
    let settings = SupervisorSettings {
        dry_run: cfg.agent.dry_run,
        max_consecutive_failures: cfg.agent.max_consecutive_failures,
        ..SupervisorSettings::default()
    };
    let supervisor = Arc::new(Supervisor::new(store.clone(), ports, settings, rate));

    // -- Jobs ------------------------------------------------------------

    for job_cfg in &cfg.jobs {
        match supervisor
            .start_job(&job_cfg.token(), job_cfg.strategy.clone())
            .await
        {
            Ok(job) => info!(job_id = %job.id, "{job}"),
            Err(e) => error!(
                token = %job_cfg.token_address,
                symbol = %job_cfg.token_symbol,
                error = %e,
                "Job not started"
            ),
        }
    }
    let restored = supervisor.restore().await?;
    if restored > 0 {
        info!(restored, "Stored jobs registered for operator commands");
    }

    if cfg.dashboard.enabled {
        dashboard::spawn_dashboard(supervisor.clone(), cfg.dashboard.port).await?;
    }

    // -- Main loop -------------------------------------------------------

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler = TickScheduler::new(
        supervisor.clone(),
        Duration::from_secs(cfg.agent.tick_interval_secs),
    );
    let mut scheduler_task = tokio::spawn(scheduler.run(shutdown_rx));

    info!(
        interval_secs = cfg.agent.tick_interval_secs,
        "Entering main loop. Press Ctrl+C to stop."
    );

    let scheduler_done = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received.");
            false
        }
        joined = &mut scheduler_task => {
            if let Err(e) = joined {
                error!(error = %e, "Scheduler task failed");
            }
            true
        }
    };

    // Stop firing, let in-flight ticks finish, then pause.
    let _ = shutdown_tx.send(true);
    if !scheduler_done {
        if let Err(e) = scheduler_task.await {
            error!(error = %e, "Scheduler task failed");
        }
    }
    let paused = supervisor.pause_all().await;

    for job in supervisor.list().await? {
        info!(job_id = %job.id, "{job}");
    }
    store.close().await;
    info!(paused, "STACKER shut down cleanly.");

    Ok(())
}

/// Wire the price feed, balance source and execution venue.
///
/// Execution is always simulated by the paper venue; with DexScreener
/// configured it fills at live prices.
fn build_ports(cfg: &AppConfig) -> Result<Ports> {
    match cfg.price_feed.provider {
        PriceProvider::Dexscreener => {
            let feed: Arc<dyn PriceFeed> =
                Arc::new(DexScreenerClient::new(cfg.price_feed.timeout_secs)?);
            let venue = Arc::new(PaperVenue::with_feed(
                feed.clone(),
                cfg.paper.quote_balance_usd,
            ));
            info!("Using DexScreener price feed");
            Ok(Ports {
                prices: feed,
                balances: venue.clone(),
                venue,
            })
        }
        PriceProvider::Paper => {
            let venue = Arc::new(PaperVenue::new(cfg.paper.quote_balance_usd));
            match cfg.paper.price_usd {
                Some(price) => {
                    for job in &cfg.jobs {
                        venue.set_price(&job.token_address, price);
                    }
                }
                None => warn!("paper.price_usd not set; ticks fail until a price is available"),
            }
            info!("Using paper price feed");
            Ok(Ports::paper(venue))
        }
    }
}

/// Initialise the `tracing` subscriber.
fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("stacker=info"));

    let json_logging = std::env::var("STACKER_LOG_JSON").is_ok();

    if json_logging {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    } else {
        fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    }
}
