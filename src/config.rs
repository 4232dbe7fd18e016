//! Configuration loading from TOML.
//!
//! Reads `config.toml` and deserializes into strongly-typed structs.
//! Every job's strategy block is validated before anything starts.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::fs;
use tracing::warn;

use crate::storage::DEFAULT_DATABASE_URL;
use crate::types::{normalize_address, AccumulateConfig, Token};

/// Ticks closer together than this outrun the slowest port (execution
/// can take tens of seconds), so shorter intervals are raised to it.
pub const MIN_TICK_INTERVAL_SECS: u64 = 30;

/// Top-level application configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub agent: AgentConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub price_feed: PriceFeedConfig,
    #[serde(default)]
    pub paper: PaperConfig,
    #[serde(default)]
    pub dashboard: DashboardConfig,
    #[serde(default)]
    pub jobs: Vec<JobConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AgentConfig {
    pub name: String,
    pub tick_interval_secs: u64,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
    /// Trades allowed per hour across all jobs. Unlimited when absent.
    #[serde(default)]
    pub max_trades_per_hour: Option<u32>,
}

fn default_max_consecutive_failures() -> u32 {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_DATABASE_URL.to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PriceProvider {
    Dexscreener,
    Paper,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PriceFeedConfig {
    pub provider: PriceProvider,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl Default for PriceFeedConfig {
    fn default() -> Self {
        Self {
            provider: PriceProvider::Paper,
            timeout_secs: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PaperConfig {
    pub quote_balance_usd: f64,
    /// Seed price for every job token when the feed is `paper`.
    #[serde(default)]
    pub price_usd: Option<f64>,
}

impl Default for PaperConfig {
    fn default() -> Self {
        Self {
            quote_balance_usd: 1000.0,
            price_usd: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct DashboardConfig {
    pub enabled: bool,
    pub port: u16,
}

/// One `[[jobs]]` entry.
#[derive(Debug, Deserialize, Clone)]
pub struct JobConfig {
    pub token_address: String,
    pub token_symbol: String,
    pub chain: String,
    #[serde(default = "default_quote_token")]
    pub quote_token: String,
    pub strategy: AccumulateConfig,
}

fn default_quote_token() -> String {
    "USDC".to_string()
}

impl JobConfig {
    pub fn token(&self) -> Token {
        Token::new(
            &self.token_address,
            &self.token_symbol,
            &self.chain,
            &self.quote_token,
        )
    }
}

impl AppConfig {
    /// Load and validate configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        Self::parse(&contents).with_context(|| format!("Invalid config file: {path}"))
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let mut config: AppConfig =
            toml::from_str(contents).context("Failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    /// Check job blocks and apply the tick-interval floor.
    fn validate(&mut self) -> Result<()> {
        if self.agent.tick_interval_secs < MIN_TICK_INTERVAL_SECS {
            warn!(
                configured = self.agent.tick_interval_secs,
                floor = MIN_TICK_INTERVAL_SECS,
                "tick_interval_secs below floor; raised"
            );
            self.agent.tick_interval_secs = MIN_TICK_INTERVAL_SECS;
        }
        if self.agent.max_consecutive_failures == 0 {
            bail!("agent.max_consecutive_failures must be at least 1");
        }
        if !(self.paper.quote_balance_usd.is_finite() && self.paper.quote_balance_usd >= 0.0) {
            bail!("paper.quote_balance_usd must be >= 0");
        }
        if let Some(price) = self.paper.price_usd {
            if !(price.is_finite() && price > 0.0) {
                bail!("paper.price_usd must be > 0");
            }
        }

        let mut seen = HashSet::new();
        for job in &self.jobs {
            let address = normalize_address(&job.token_address);
            if address.is_empty() {
                bail!("job {}: token_address is empty", job.token_symbol);
            }
            if !seen.insert(address.clone()) {
                bail!("duplicate job for token {address}");
            }
            job.strategy
                .validate()
                .with_context(|| format!("job {} ({address})", job.token_symbol))?;
        }
        Ok(())
    }
}
