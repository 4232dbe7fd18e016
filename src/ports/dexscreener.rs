//! DexScreener price feed.
//!
//! API docs: https://docs.dexscreener.com/api/reference
//! Endpoint: GET /latest/dex/tokens/{tokenAddress}
//! Rate limit: 300 requests/minute
//! Auth: none
//!
//! A token usually trades in several pairs across DEXes. We take the pair
//! on the job's chain with the deepest USD liquidity.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use super::{PortError, PriceFeed, Quote};
use crate::types::Token;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

const BASE_URL: &str = "https://api.dexscreener.com";
const DEFAULT_TIMEOUT_SECS: u64 = 10;

// ---------------------------------------------------------------------------
// API response types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct TokensResponse {
    #[serde(default)]
    pairs: Option<Vec<DexPair>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DexPair {
    chain_id: String,
    /// Decimal string, e.g. "0.00001234".
    #[serde(default)]
    price_usd: Option<String>,
    #[serde(default)]
    liquidity: Option<DexLiquidity>,
}

#[derive(Debug, Deserialize)]
struct DexLiquidity {
    #[serde(default)]
    usd: Option<f64>,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct DexScreenerClient {
    http: Client,
    base_url: String,
}

impl DexScreenerClient {
    pub fn new(timeout_secs: Option<u64>) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS)))
            .user_agent("stacker/0.1")
            .build()
            .context("Failed to build DexScreener HTTP client")?;
        Ok(Self {
            http,
            base_url: BASE_URL.to_string(),
        })
    }

    /// Point the client at a different host (tests, proxies).
    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    fn tokens_url(&self, address: &str) -> String {
        format!(
            "{}/latest/dex/tokens/{}",
            self.base_url,
            urlencoding::encode(address)
        )
    }
}

/// Price of the most liquid pair on `chain`, if any pair has a usable price.
fn best_pair_price(pairs: &[DexPair], chain: &str) -> Option<f64> {
    pairs
        .iter()
        .filter(|p| p.chain_id.eq_ignore_ascii_case(chain))
        .filter_map(|p| {
            let price: f64 = p.price_usd.as_deref()?.parse().ok()?;
            if !(price.is_finite() && price > 0.0) {
                return None;
            }
            let liquidity = p.liquidity.as_ref().and_then(|l| l.usd).unwrap_or(0.0);
            Some((liquidity, price))
        })
        .max_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(_, price)| price)
}

#[async_trait]
impl PriceFeed for DexScreenerClient {
    async fn quote(&self, token: &Token) -> Result<Quote, PortError> {
        let unavailable = |reason: String| PortError::PriceUnavailable {
            token: token.address.clone(),
            reason,
        };

        let url = self.tokens_url(&token.address);
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| unavailable(format!("request failed: {e}")))?;

        if !resp.status().is_success() {
            return Err(unavailable(format!("HTTP {}", resp.status())));
        }

        let body: TokensResponse = resp
            .json()
            .await
            .map_err(|e| unavailable(format!("bad response body: {e}")))?;

        let pairs = body.pairs.unwrap_or_default();
        let price = best_pair_price(&pairs, &token.chain)
            .ok_or_else(|| unavailable(format!("no priced pair on {}", token.chain)))?;

        debug!(token = %token.symbol, price, pairs = pairs.len(), "DexScreener quote");
        Ok(Quote {
            price,
            timestamp: Utc::now(),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
