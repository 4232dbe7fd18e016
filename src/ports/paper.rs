//! Paper-trading venue.
//!
//! Simulates fills at the current price with no slippage or fees and
//! tracks a single quote-currency balance. Prices come either from an
//! upstream `PriceFeed` or from values set with `set_price`.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info};

use super::{BalanceSource, ExecutionVenue, Fill, PortError, PriceFeed, Quote};
use crate::types::{normalize_address, Token, TradeSide};

const VENUE_NAME: &str = "paper";

/// One simulated execution, kept for inspection.
#[derive(Debug, Clone, PartialEq)]
pub struct PaperExecution {
    pub side: TradeSide,
    pub token_address: String,
    pub usd_amount: f64,
    pub fill: Fill,
}

pub struct PaperVenue {
    upstream: Option<Arc<dyn PriceFeed>>,
    prices: Mutex<HashMap<String, f64>>,
    quote_balance: Mutex<f64>,
    executions: Mutex<Vec<PaperExecution>>,
    /// Artificial execution delay.
    latency: Duration,
    /// If set, every execution fails with this message.
    force_error: Mutex<Option<String>>,
}

impl PaperVenue {
    /// A venue priced by `set_price`.
    pub fn new(quote_balance: f64) -> Self {
        Self {
            upstream: None,
            prices: Mutex::new(HashMap::new()),
            quote_balance: Mutex::new(quote_balance),
            executions: Mutex::new(Vec::new()),
            latency: Duration::ZERO,
            force_error: Mutex::new(None),
        }
    }

    /// A venue that fills at prices reported by `feed`.
    pub fn with_feed(feed: Arc<dyn PriceFeed>, quote_balance: f64) -> Self {
        Self {
            upstream: Some(feed),
            ..Self::new(quote_balance)
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn set_price(&self, token_address: &str, price: f64) {
        lock(&self.prices).insert(normalize_address(token_address), price);
    }

    pub fn set_quote_balance(&self, balance: f64) {
        *lock(&self.quote_balance) = balance;
    }

    pub fn quote_balance(&self) -> f64 {
        *lock(&self.quote_balance)
    }

    pub fn set_error(&self, msg: &str) {
        *lock(&self.force_error) = Some(msg.to_string());
    }

    pub fn clear_error(&self) {
        *lock(&self.force_error) = None;
    }

    pub fn executions(&self) -> Vec<PaperExecution> {
        lock(&self.executions).clone()
    }

    async fn current_price(&self, token: &Token) -> Result<f64, PortError> {
        if let Some(feed) = &self.upstream {
            return Ok(feed.quote(token).await?.price);
        }
        lock(&self.prices)
            .get(&normalize_address(&token.address))
            .copied()
            .ok_or_else(|| PortError::PriceUnavailable {
                token: token.address.clone(),
                reason: "no paper price set".to_string(),
            })
    }
}

/// Poison-tolerant lock; the guarded data stays consistent per statement.
fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

#[async_trait]
impl PriceFeed for PaperVenue {
    async fn quote(&self, token: &Token) -> Result<Quote, PortError> {
        let price = self.current_price(token).await?;
        Ok(Quote {
            price,
            timestamp: Utc::now(),
        })
    }
}

#[async_trait]
impl BalanceSource for PaperVenue {
    async fn balance(&self, _token: &Token) -> Result<f64, PortError> {
        Ok(self.quote_balance())
    }
}

#[async_trait]
impl ExecutionVenue for PaperVenue {
    async fn execute(
        &self,
        side: TradeSide,
        token: &Token,
        usd_amount: f64,
    ) -> Result<Fill, PortError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if let Some(err) = lock(&self.force_error).as_ref() {
            return Err(PortError::ExecutionFailed(err.clone()));
        }

        let price = self
            .current_price(token)
            .await
            .map_err(|e| PortError::ExecutionFailed(e.to_string()))?;
        if !(price.is_finite() && price > 0.0) {
            return Err(PortError::ExecutionFailed(format!("bad paper price {price}")));
        }

        {
            let mut balance = lock(&self.quote_balance);
            match side {
                TradeSide::Buy => {
                    if *balance < usd_amount {
                        return Err(PortError::ExecutionFailed(format!(
                            "insufficient quote balance: need ${usd_amount:.2}, have ${:.2}",
                            *balance
                        )));
                    }
                    *balance -= usd_amount;
                }
                TradeSide::Sell => *balance += usd_amount,
            }
        }

        let fill = Fill {
            filled_amount: usd_amount / price,
            execution_price: price,
            external_ref: format!("paper-{}", uuid::Uuid::new_v4()),
        };

        info!(
            side = %side,
            token = %token.symbol,
            usd = format!("${usd_amount:.2}"),
            units = fill.filled_amount,
            price = fill.execution_price,
            "[PAPER] Filled"
        );
        lock(&self.executions).push(PaperExecution {
            side,
            token_address: token.address.clone(),
            usd_amount,
            fill: fill.clone(),
        });
        debug!(balance = self.quote_balance(), "Paper quote balance");

        Ok(fill)
    }

    fn name(&self) -> &str {
        VENUE_NAME
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
