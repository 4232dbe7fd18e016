//! External collaborators consumed by the accumulation engine.
//!
//! Three capabilities, each behind its own trait so jobs can mix sources:
//! - `PriceFeed` — current USD price of a token
//! - `BalanceSource` — quote-currency funds available for buying
//! - `ExecutionVenue` — turns "buy/sell $X of token" into a settled fill
//!
//! Implementations:
//! - `dexscreener` — public DEX aggregator price feed (read-only)
//! - `paper` — in-memory venue with simulated fills, also used in tests

pub mod dexscreener;
pub mod paper;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::types::{Token, TradeSide};

/// A price observation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub price: f64,
    pub timestamp: DateTime<Utc>,
}

/// A settled execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fill {
    /// Token units bought or sold.
    pub filled_amount: f64,
    pub execution_price: f64,
    /// Venue reference (tx hash, order id).
    pub external_ref: String,
}

/// Failures reported by a port.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PortError {
    #[error("Price unavailable for {token}: {reason}")]
    PriceUnavailable { token: String, reason: String },

    #[error("Balance query failed for {token}: {reason}")]
    BalanceQueryFailed { token: String, reason: String },

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PriceFeed: Send + Sync {
    /// Current price of `token` in USD.
    async fn quote(&self, token: &Token) -> Result<Quote, PortError>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BalanceSource: Send + Sync {
    /// Quote-currency balance (USD) available to buy `token`.
    async fn balance(&self, token: &Token) -> Result<f64, PortError>;
}

/// Execution may block for a long time (remote agent, chain confirmation).
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ExecutionVenue: Send + Sync {
    async fn execute(
        &self,
        side: TradeSide,
        token: &Token,
        usd_amount: f64,
    ) -> Result<Fill, PortError>;

    /// Venue name for logging.
    fn name(&self) -> &str;
}

/// The three ports a job engine talks to.
#[derive(Clone)]
pub struct Ports {
    pub prices: Arc<dyn PriceFeed>,
    pub balances: Arc<dyn BalanceSource>,
    pub venue: Arc<dyn ExecutionVenue>,
}

impl Ports {
    /// All three ports served by one paper venue.
    pub fn paper(venue: Arc<paper::PaperVenue>) -> Self {
        Self {
            prices: venue.clone(),
            balances: venue.clone(),
            venue,
        }
    }
}
