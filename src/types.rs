//! Shared types for the STACKER agent.
//!
//! Jobs, trades, the accumulation working state, and the job lifecycle
//! state machine. Storage, engine, and dashboard modules all depend on
//! these without depending on each other.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ---------------------------------------------------------------------------
// Token identity
// ---------------------------------------------------------------------------

/// The token a job manages, as passed to the price/balance/execution ports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    /// Lowercase contract address.
    pub address: String,
    pub symbol: String,
    pub chain: String,
    /// Currency the token is bought with (e.g. "USDC").
    pub quote_token: String,
}

impl Token {
    pub fn new(address: &str, symbol: &str, chain: &str, quote_token: &str) -> Self {
        Self {
            address: normalize_address(address),
            symbol: symbol.to_string(),
            chain: chain.to_string(),
            quote_token: quote_token.to_string(),
        }
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}) on {}", self.symbol, self.address, self.chain)
    }
}

/// Canonical form of a token address used for lookups and uniqueness.
pub fn normalize_address(address: &str) -> String {
    address.trim().to_lowercase()
}

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Which engine drives a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobMode {
    Accumulate,
    Liquidity,
}

impl JobMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobMode::Accumulate => "ACCUMULATE",
            JobMode::Liquidity => "LIQUIDITY",
        }
    }
}

impl fmt::Display for JobMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobMode {
    type Err = StackerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ACCUMULATE" => Ok(JobMode::Accumulate),
            "LIQUIDITY" => Ok(JobMode::Liquidity),
            other => Err(StackerError::Corrupt(format!("unknown job mode: {other}"))),
        }
    }
}

/// Job lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Idle,
    Running,
    Paused,
    Liquidating,
    Error,
}

impl JobStatus {
    pub const ALL: &'static [JobStatus] = &[
        JobStatus::Idle,
        JobStatus::Running,
        JobStatus::Paused,
        JobStatus::Liquidating,
        JobStatus::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Idle => "IDLE",
            JobStatus::Running => "RUNNING",
            JobStatus::Paused => "PAUSED",
            JobStatus::Liquidating => "LIQUIDATING",
            JobStatus::Error => "ERROR",
        }
    }

    /// Whether the lifecycle allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Idle, Running)
                | (Running, Paused)
                | (Paused, Running)
                | (Running, Liquidating)
                | (Paused, Liquidating)
                | (Liquidating, Idle)
                | (Running, Error)
                | (Error, Running)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = StackerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "IDLE" => Ok(JobStatus::Idle),
            "RUNNING" => Ok(JobStatus::Running),
            "PAUSED" => Ok(JobStatus::Paused),
            "LIQUIDATING" => Ok(JobStatus::Liquidating),
            "ERROR" => Ok(JobStatus::Error),
            other => Err(StackerError::Corrupt(format!("unknown job status: {other}"))),
        }
    }
}

/// Trade direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradeSide {
    Buy,
    Sell,
}

impl TradeSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeSide::Buy => "BUY",
            TradeSide::Sell => "SELL",
        }
    }
}

impl fmt::Display for TradeSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TradeSide {
    type Err = StackerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "BUY" => Ok(TradeSide::Buy),
            "SELL" => Ok(TradeSide::Sell),
            other => Err(StackerError::Corrupt(format!("unknown trade side: {other}"))),
        }
    }
}

/// Why a trade was placed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradeReason {
    Dca,
    DipBuy,
    TakeProfit,
    Rebalance,
    SpreadBuy,
    SpreadSell,
    Liquidate,
    Manual,
}

impl TradeReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeReason::Dca => "DCA",
            TradeReason::DipBuy => "DIP_BUY",
            TradeReason::TakeProfit => "TAKE_PROFIT",
            TradeReason::Rebalance => "REBALANCE",
            TradeReason::SpreadBuy => "SPREAD_BUY",
            TradeReason::SpreadSell => "SPREAD_SELL",
            TradeReason::Liquidate => "LIQUIDATE",
            TradeReason::Manual => "MANUAL",
        }
    }
}

impl fmt::Display for TradeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TradeReason {
    type Err = StackerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DCA" => Ok(TradeReason::Dca),
            "DIP_BUY" => Ok(TradeReason::DipBuy),
            "TAKE_PROFIT" => Ok(TradeReason::TakeProfit),
            "REBALANCE" => Ok(TradeReason::Rebalance),
            "SPREAD_BUY" => Ok(TradeReason::SpreadBuy),
            "SPREAD_SELL" => Ok(TradeReason::SpreadSell),
            "LIQUIDATE" => Ok(TradeReason::Liquidate),
            "MANUAL" => Ok(TradeReason::Manual),
            other => Err(StackerError::Corrupt(format!("unknown trade reason: {other}"))),
        }
    }
}

/// Settlement status of a ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradeStatus {
    Pending,
    Submitted,
    Executed,
    Failed,
}

impl TradeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeStatus::Pending => "PENDING",
            TradeStatus::Submitted => "SUBMITTED",
            TradeStatus::Executed => "EXECUTED",
            TradeStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for TradeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TradeStatus {
    type Err = StackerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(TradeStatus::Pending),
            "SUBMITTED" => Ok(TradeStatus::Submitted),
            "EXECUTED" => Ok(TradeStatus::Executed),
            "FAILED" => Ok(TradeStatus::Failed),
            other => Err(StackerError::Corrupt(format!("unknown trade status: {other}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Strategy parameters
// ---------------------------------------------------------------------------

/// ACCUMULATE-mode strategy parameters.
///
/// Stored verbatim (as JSON) in the job's `config` column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccumulateConfig {
    /// USD spent per scheduled buy.
    pub dca_amount_usd: f64,
    pub dca_interval_hours: f64,
    /// Drop from the recent high (percent) that triggers a dip buy. 0 disables.
    #[serde(default)]
    pub dip_buy_threshold_pct: f64,
    /// Dip buys spend `dca_amount_usd * dip_buy_multiplier`.
    #[serde(default = "default_dip_multiplier")]
    pub dip_buy_multiplier: f64,
    /// Unrealized gain (percent) that triggers a partial sell. 0 disables.
    #[serde(default)]
    pub take_profit_pct: f64,
    /// Share of the position value sold on take-profit (percent).
    #[serde(default = "default_take_profit_sell_pct")]
    pub take_profit_sell_pct: f64,
    /// Position value at which buying stops. `None` means uncapped.
    #[serde(default)]
    pub max_accumulation_usd: Option<f64>,
    #[serde(default = "default_min_trade_usd")]
    pub min_trade_usd: f64,
}

fn default_dip_multiplier() -> f64 {
    2.0
}

fn default_take_profit_sell_pct() -> f64 {
    25.0
}

fn default_min_trade_usd() -> f64 {
    1.0
}

impl Default for AccumulateConfig {
    fn default() -> Self {
        Self {
            dca_amount_usd: 10.0,
            dca_interval_hours: 24.0,
            dip_buy_threshold_pct: 10.0,
            dip_buy_multiplier: default_dip_multiplier(),
            take_profit_pct: 0.0,
            take_profit_sell_pct: default_take_profit_sell_pct(),
            max_accumulation_usd: None,
            min_trade_usd: default_min_trade_usd(),
        }
    }
}

impl AccumulateConfig {
    /// Reject parameter sets the engine cannot act on sensibly.
    pub fn validate(&self) -> Result<(), StackerError> {
        fn positive(name: &str, v: f64) -> Result<(), StackerError> {
            if v.is_finite() && v > 0.0 {
                Ok(())
            } else {
                Err(StackerError::InvalidConfig(format!("{name} must be > 0, got {v}")))
            }
        }
        fn non_negative(name: &str, v: f64) -> Result<(), StackerError> {
            if v.is_finite() && v >= 0.0 {
                Ok(())
            } else {
                Err(StackerError::InvalidConfig(format!("{name} must be >= 0, got {v}")))
            }
        }

        positive("dca_amount_usd", self.dca_amount_usd)?;
        positive("dca_interval_hours", self.dca_interval_hours)?;
        non_negative("dip_buy_threshold_pct", self.dip_buy_threshold_pct)?;
        positive("dip_buy_multiplier", self.dip_buy_multiplier)?;
        non_negative("take_profit_pct", self.take_profit_pct)?;
        non_negative("min_trade_usd", self.min_trade_usd)?;

        if self.take_profit_pct > 0.0
            && !(self.take_profit_sell_pct > 0.0 && self.take_profit_sell_pct <= 100.0)
        {
            return Err(StackerError::InvalidConfig(format!(
                "take_profit_sell_pct must be in (0, 100], got {}",
                self.take_profit_sell_pct
            )));
        }
        if let Some(cap) = self.max_accumulation_usd {
            positive("max_accumulation_usd", cap)?;
        }
        Ok(())
    }

    pub fn dip_buy_amount_usd(&self) -> f64 {
        self.dca_amount_usd * self.dip_buy_multiplier
    }
}

// ---------------------------------------------------------------------------
// Accumulation working state
// ---------------------------------------------------------------------------

/// The engine's in-memory mirror of a job's accumulation fields.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AccumulationState {
    pub last_dca_buy_time: Option<DateTime<Utc>>,
    pub recent_high: f64,
    pub recent_high_time: Option<DateTime<Utc>>,
    /// USD spent on buys for the tracked position.
    pub total_accumulated: f64,
    /// Token units held.
    pub token_balance: f64,
}

impl AccumulationState {
    /// Always derived from the running totals, never stored.
    pub fn avg_buy_price(&self) -> f64 {
        avg_price(self.total_accumulated, self.token_balance)
    }

    pub fn position_value(&self, price: f64) -> f64 {
        self.token_balance * price
    }

    /// Unrealized gain in percent against the average buy price.
    pub fn gain_pct(&self, price: f64) -> Option<f64> {
        let avg = self.avg_buy_price();
        if avg > 0.0 {
            Some((price - avg) / avg * 100.0)
        } else {
            None
        }
    }

    /// Percent drop from the recent high; 0 when no high is tracked.
    pub fn dip_pct(&self, price: f64) -> f64 {
        if self.recent_high > 0.0 {
            (self.recent_high - price) / self.recent_high * 100.0
        } else {
            0.0
        }
    }

    /// Apply a buy fill.
    pub fn apply_buy(&mut self, usd_spent: f64, units: f64) {
        self.total_accumulated += usd_spent;
        self.token_balance += units;
    }

    /// Apply a sell fill. Only the held units change; `total_accumulated`
    /// stays the USD spent on buys.
    pub fn apply_sell(&mut self, units: f64) {
        let remaining = self.token_balance - units;
        if remaining <= self.token_balance * DUST_FRACTION {
            self.token_balance = 0.0;
        } else {
            self.token_balance = remaining;
        }
    }

    /// A liquidated position starts over: both running totals go to 0.
    pub fn close_position(&mut self) {
        self.token_balance = 0.0;
        self.total_accumulated = 0.0;
    }
}

/// Remaining balance below this fraction of the pre-sale balance is
/// float noise from the fill arithmetic and counts as fully sold.
const DUST_FRACTION: f64 = 1e-9;

/// `total / balance` when holding anything, else 0.
pub fn avg_price(total_accumulated: f64, token_balance: f64) -> f64 {
    if token_balance > 0.0 {
        total_accumulated / token_balance
    } else {
        0.0
    }
}

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// One managed token position and its lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub token_address: String,
    pub token_symbol: String,
    pub chain: String,
    pub quote_token: String,
    pub mode: JobMode,
    pub status: JobStatus,

    pub last_dca_buy_time: Option<DateTime<Utc>>,
    pub recent_high: f64,
    pub recent_high_time: Option<DateTime<Utc>>,
    pub total_accumulated: f64,
    pub token_balance: f64,

    pub last_error: Option<String>,
    pub error_count: i64,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub paused_at: Option<DateTime<Utc>>,

    /// Mode-specific strategy parameters, verbatim.
    pub config: serde_json::Value,
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} {} | balance={:.6} cost=${:.2} avg=${:.6} high=${:.6} | errors={}",
            self.status,
            self.token_symbol,
            self.token_address,
            self.token_balance,
            self.total_accumulated,
            self.avg_buy_price(),
            self.recent_high,
            self.error_count,
        )
    }
}

impl Job {
    /// A fresh IDLE job with zeroed working state.
    pub fn new(
        token: &Token,
        mode: JobMode,
        config: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            token_address: normalize_address(&token.address),
            token_symbol: token.symbol.clone(),
            chain: token.chain.clone(),
            quote_token: token.quote_token.clone(),
            mode,
            status: JobStatus::Idle,
            last_dca_buy_time: None,
            recent_high: 0.0,
            recent_high_time: None,
            total_accumulated: 0.0,
            token_balance: 0.0,
            last_error: None,
            error_count: 0,
            created_at: now,
            updated_at: now,
            started_at: None,
            paused_at: None,
            config,
        }
    }

    pub fn token(&self) -> Token {
        Token {
            address: self.token_address.clone(),
            symbol: self.token_symbol.clone(),
            chain: self.chain.clone(),
            quote_token: self.quote_token.clone(),
        }
    }

    pub fn avg_buy_price(&self) -> f64 {
        avg_price(self.total_accumulated, self.token_balance)
    }

    pub fn accumulation_state(&self) -> AccumulationState {
        AccumulationState {
            last_dca_buy_time: self.last_dca_buy_time,
            recent_high: self.recent_high,
            recent_high_time: self.recent_high_time,
            total_accumulated: self.total_accumulated,
            token_balance: self.token_balance,
        }
    }

    pub fn set_accumulation_state(&mut self, state: &AccumulationState) {
        self.last_dca_buy_time = state.last_dca_buy_time;
        self.recent_high = state.recent_high;
        self.recent_high_time = state.recent_high_time;
        self.total_accumulated = state.total_accumulated;
        self.token_balance = state.token_balance;
    }

    /// Decode the stored strategy blob.
    pub fn strategy(&self) -> Result<AccumulateConfig, StackerError> {
        serde_json::from_value(self.config.clone())
            .map_err(|e| StackerError::InvalidConfig(format!("job {}: {e}", self.id)))
    }

    /// Move to `next`, applying the per-state side effects.
    ///
    /// `error` is recorded as `last_error` when entering ERROR.
    pub fn apply_transition(
        &mut self,
        next: JobStatus,
        now: DateTime<Utc>,
        error: Option<&str>,
    ) -> Result<(), StackerError> {
        if self.status == JobStatus::Liquidating && next == JobStatus::Running {
            return Err(StackerError::Conflict(format!(
                "job {}: liquidation in progress",
                self.id
            )));
        }
        if !self.status.can_transition_to(next) {
            return Err(StackerError::InvalidTransition {
                job_id: self.id.clone(),
                from: self.status,
                to: next,
            });
        }

        match next {
            JobStatus::Running => {
                self.started_at = Some(now);
                self.paused_at = None;
                self.last_error = None;
            }
            JobStatus::Paused => {
                self.paused_at = Some(now);
            }
            JobStatus::Idle => {
                self.started_at = None;
                self.paused_at = None;
            }
            JobStatus::Error => {
                self.last_error = Some(error.unwrap_or("unknown error").to_string());
                self.error_count += 1;
            }
            JobStatus::Liquidating => {}
        }

        self.status = next;
        self.updated_at = now;
        Ok(())
    }

    /// Administrative reset: IDLE with all working state and counters zeroed.
    pub fn reset(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Idle;
        self.set_accumulation_state(&AccumulationState::default());
        self.last_error = None;
        self.error_count = 0;
        self.started_at = None;
        self.paused_at = None;
        self.updated_at = now;
    }
}

// ---------------------------------------------------------------------------
// Trade ledger
// ---------------------------------------------------------------------------

/// Append-only ledger entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub id: String,
    pub job_id: String,
    pub side: TradeSide,
    pub reason: TradeReason,
    /// Token units moved.
    pub base_amount: f64,
    /// USD notional.
    pub quote_amount: f64,
    pub price_usd: f64,
    pub tx_hash: Option<String>,
    pub status: TradeStatus,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub executed_at: Option<DateTime<Utc>>,
}

impl fmt::Display for Trade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {:.6} @ ${:.6} (${:.2}) [{}] {}",
            self.side,
            self.reason,
            self.base_amount,
            self.price_usd,
            self.quote_amount,
            self.status,
            self.tx_hash.as_deref().unwrap_or("-"),
        )
    }
}

/// Fields of a trade about to be inserted.
#[derive(Debug, Clone, PartialEq)]
pub struct NewTrade {
    pub side: TradeSide,
    pub reason: TradeReason,
    pub base_amount: f64,
    pub quote_amount: f64,
    pub price_usd: f64,
    pub tx_hash: Option<String>,
    pub status: TradeStatus,
    pub error: Option<String>,
}

/// Sums over a job's executed BUY ledger rows.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct LedgerTotals {
    pub buy_quote: f64,
    pub buy_base: f64,
    pub sell_base: f64,
    pub trade_count: i64,
}

impl LedgerTotals {
    /// Average buy price implied by the ledger.
    pub fn avg_buy_price(&self) -> f64 {
        avg_price(self.buy_quote, self.buy_base)
    }
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Job-level errors surfaced by the store and supervisor.
#[derive(Debug, thiserror::Error)]
pub enum StackerError {
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("Invalid transition for job {job_id}: {from} -> {to}")]
    InvalidTransition {
        job_id: String,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error("Corrupt record: {0}")]
    Corrupt(String),

    #[error("Storage error: {0}")]
    Storage(#[from] sqlx::Error),
}

impl StackerError {
    /// Rejected state-machine requests (no mutation happened).
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            StackerError::Conflict(_) | StackerError::InvalidTransition { .. }
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
