//! Accumulation engine.
//!
//! One engine per ACCUMULATE job. Each tick fetches a price and the
//! quote balance, maintains the recent high, then evaluates in order:
//! take-profit, dip buy, scheduled DCA. The first rule that matches
//! decides the tick, so a tick records at most one trade.
//!
//! The engine holds the job's working state in memory and writes it back
//! through the ledger store; it never touches lifecycle fields.

use chrono::{DateTime, Duration, Utc};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info};

use super::rate::TradeRateCounter;
use crate::ports::{Fill, PortError, Ports};
use crate::storage::LedgerStore;
use crate::types::{
    AccumulateConfig, AccumulationState, Job, NewTrade, StackerError, Token, Trade, TradeReason,
    TradeSide, TradeStatus,
};

/// A recent high not revisited for this long is replaced by the current price.
const RECENT_HIGH_TTL_HOURS: i64 = 24;

// ---------------------------------------------------------------------------
// Outcomes and errors
// ---------------------------------------------------------------------------

/// What a tick (or liquidation) decided.
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// A trade executed and was recorded.
    Traded(Trade),
    /// Dry run: the trade was decided but not executed.
    DryRun {
        side: TradeSide,
        reason: TradeReason,
        usd_amount: f64,
        price: f64,
    },
    /// A rule matched but the trade was not allowed.
    Rejected {
        reason: TradeReason,
        rejection: Rejection,
    },
    NoAction,
}

impl TickOutcome {
    pub fn trade(&self) -> Option<&Trade> {
        match self {
            TickOutcome::Traded(trade) => Some(trade),
            _ => None,
        }
    }
}

impl fmt::Display for TickOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TickOutcome::Traded(trade) => write!(f, "traded: {trade}"),
            TickOutcome::DryRun {
                side,
                reason,
                usd_amount,
                price,
            } => write!(f, "dry run: {side} {reason} ${usd_amount:.2} @ ${price:.6}"),
            TickOutcome::Rejected { reason, rejection } => {
                write!(f, "{reason} rejected: {rejection}")
            }
            TickOutcome::NoAction => f.write_str("no action"),
        }
    }
}

/// Soft rejections. The tick still succeeds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Rejection {
    BelowMinimum { amount: f64, min: f64 },
    PositionCapReached { value: f64, cap: f64 },
    InsufficientFunds { needed: f64, available: f64 },
    RateLimited { limit: u32 },
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::BelowMinimum { amount, min } => {
                write!(f, "amount ${amount:.2} below minimum ${min:.2}")
            }
            Rejection::PositionCapReached { value, cap } => {
                write!(f, "position value ${value:.2} at cap ${cap:.2}")
            }
            Rejection::InsufficientFunds { needed, available } => {
                write!(f, "need ${needed:.2}, have ${available:.2}")
            }
            Rejection::RateLimited { limit } => write!(f, "hourly limit of {limit} trades reached"),
        }
    }
}

/// Hard tick failures. No partial trade state is left behind.
#[derive(Debug, thiserror::Error)]
pub enum TickError {
    #[error(transparent)]
    Port(#[from] PortError),

    #[error("Invalid price from feed: {0}")]
    InvalidPrice(f64),

    #[error("Invalid quote balance: {0}")]
    InvalidBalance(f64),

    #[error("Invalid fill: {0}")]
    InvalidFill(String),

    #[error("Persistence failed: {0}")]
    Persistence(#[from] StackerError),
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct AccumulationEngine {
    job_id: String,
    token: Token,
    config: AccumulateConfig,
    state: AccumulationState,
    dry_run: bool,
    ports: Ports,
    store: LedgerStore,
    rate: Option<Arc<TradeRateCounter>>,
}

impl AccumulationEngine {
    /// Build an engine for `job`, seeding the working state from its row.
    pub fn new(
        job: &Job,
        ports: Ports,
        store: LedgerStore,
        dry_run: bool,
    ) -> Result<Self, StackerError> {
        let config = job.strategy()?;
        config.validate()?;
        Ok(Self {
            job_id: job.id.clone(),
            token: job.token(),
            config,
            state: job.accumulation_state(),
            dry_run,
            ports,
            store,
            rate: None,
        })
    }

    pub fn with_rate_counter(mut self, counter: Arc<TradeRateCounter>) -> Self {
        self.rate = Some(counter);
        self
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn token(&self) -> &Token {
        &self.token
    }

    pub fn config(&self) -> &AccumulateConfig {
        &self.config
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    /// Snapshot of the working state.
    pub fn current_state(&self) -> AccumulationState {
        self.state.clone()
    }

    pub fn set_config(&mut self, config: AccumulateConfig) {
        self.config = config;
    }

    /// Re-seed the working state after the row was changed outside the engine.
    pub fn reload(&mut self, job: &Job) {
        self.state = job.accumulation_state();
    }

    pub async fn tick(&mut self) -> Result<TickOutcome, TickError> {
        self.tick_at(Utc::now()).await
    }

    /// One evaluation at time `now`.
    ///
    /// Nothing is written until the decision is final: a refreshed recent
    /// high commits with the trade, or alone when the tick does not trade.
    /// A failed tick leaves the row and the working state untouched.
    pub async fn tick_at(&mut self, now: DateTime<Utc>) -> Result<TickOutcome, TickError> {
        let price = self.fetch_price().await?;
        let quote_balance = self.ports.balances.balance(&self.token).await?;
        if !(quote_balance.is_finite() && quote_balance >= 0.0) {
            return Err(TickError::InvalidBalance(quote_balance));
        }

        let mut base = self.state.clone();
        let refreshed = self.refresh_recent_high(&mut base, price, now);

        let outcome = self.decide(&base, price, quote_balance, now).await?;
        let settled = matches!(
            outcome,
            TickOutcome::NoAction | TickOutcome::Rejected { .. }
        );
        if refreshed && settled {
            self.store
                .update_working_state(&self.job_id, &base, now)
                .await?;
            self.state = base;
        }
        Ok(outcome)
    }

    /// Take-profit, then dip buy, then DCA. The first rule that matches wins.
    async fn decide(
        &mut self,
        base: &AccumulationState,
        price: f64,
        quote_balance: f64,
        now: DateTime<Utc>,
    ) -> Result<TickOutcome, TickError> {
        if let Some(usd_amount) = self.take_profit_amount(base, price) {
            return self
                .sell(TradeReason::TakeProfit, base, usd_amount, price, now)
                .await;
        }

        if self.config.dip_buy_threshold_pct > 0.0 {
            let dip = base.dip_pct(price);
            if dip >= self.config.dip_buy_threshold_pct {
                debug!(
                    job_id = %self.job_id,
                    dip = format!("{dip:.2}%"),
                    high = base.recent_high,
                    price,
                    "Dip detected"
                );
                let amount = self.config.dip_buy_amount_usd();
                return self
                    .buy(TradeReason::DipBuy, base, amount, price, quote_balance, now)
                    .await;
            }
        }

        if self.dca_due(base, now) {
            let amount = self.config.dca_amount_usd;
            return self
                .buy(TradeReason::Dca, base, amount, price, quote_balance, now)
                .await;
        }

        Ok(TickOutcome::NoAction)
    }

    pub async fn liquidate(&mut self) -> Result<TickOutcome, TickError> {
        self.liquidate_at(Utc::now()).await
    }

    /// Sell the entire tracked balance at market. Not rate limited.
    pub async fn liquidate_at(&mut self, now: DateTime<Utc>) -> Result<TickOutcome, TickError> {
        if self.state.token_balance <= 0.0 {
            return Ok(TickOutcome::NoAction);
        }
        let price = self.fetch_price().await?;
        let base = self.state.clone();
        let usd_amount = base.position_value(price);
        self.sell(TradeReason::Liquidate, &base, usd_amount, price, now)
            .await
    }

    // -----------------------------------------------------------------------
    // Decision helpers
    // -----------------------------------------------------------------------

    async fn fetch_price(&self) -> Result<f64, TickError> {
        let quote = self.ports.prices.quote(&self.token).await?;
        if quote.price.is_finite() && quote.price > 0.0 {
            Ok(quote.price)
        } else {
            Err(TickError::InvalidPrice(quote.price))
        }
    }

    /// Raise the recent high to `price`, or replace a high older than a day.
    /// Returns whether `state` changed.
    fn refresh_recent_high(
        &self,
        state: &mut AccumulationState,
        price: f64,
        now: DateTime<Utc>,
    ) -> bool {
        let stale = match state.recent_high_time {
            Some(at) => now - at > Duration::hours(RECENT_HIGH_TTL_HOURS),
            None => true,
        };
        if price <= state.recent_high && !stale {
            return false;
        }
        debug!(
            job_id = %self.job_id,
            previous = state.recent_high,
            high = price,
            decayed = stale,
            "Recent high updated"
        );
        state.recent_high = price;
        state.recent_high_time = Some(now);
        true
    }

    fn take_profit_amount(&self, state: &AccumulationState, price: f64) -> Option<f64> {
        let cfg = &self.config;
        if cfg.take_profit_pct <= 0.0 || state.token_balance <= 0.0 {
            return None;
        }
        let value = state.position_value(price);
        if value < cfg.min_trade_usd {
            return None;
        }
        let gain = state.gain_pct(price)?;
        (gain >= cfg.take_profit_pct).then(|| value * cfg.take_profit_sell_pct / 100.0)
    }

    fn dca_due(&self, state: &AccumulationState, now: DateTime<Utc>) -> bool {
        match state.last_dca_buy_time {
            None => true,
            Some(last) => {
                let elapsed_hours = (now - last).num_milliseconds() as f64 / 3_600_000.0;
                elapsed_hours >= self.config.dca_interval_hours
            }
        }
    }

    /// Eligibility gate shared by dip buys and DCA.
    fn check_buy(
        &self,
        state: &AccumulationState,
        amount: f64,
        price: f64,
        quote_balance: f64,
    ) -> Result<(), Rejection> {
        if amount < self.config.min_trade_usd {
            return Err(Rejection::BelowMinimum {
                amount,
                min: self.config.min_trade_usd,
            });
        }
        if let Some(cap) = self.config.max_accumulation_usd {
            let value = state.position_value(price);
            if value >= cap {
                return Err(Rejection::PositionCapReached { value, cap });
            }
        }
        if quote_balance < amount {
            return Err(Rejection::InsufficientFunds {
                needed: amount,
                available: quote_balance,
            });
        }
        Ok(())
    }

    fn take_rate_slot(&self) -> Result<(), Rejection> {
        match &self.rate {
            Some(counter) if !counter.try_acquire() => Err(Rejection::RateLimited {
                limit: counter.limit().unwrap_or_default(),
            }),
            _ => Ok(()),
        }
    }

    fn release_rate_slot(&self) {
        if let Some(counter) = &self.rate {
            counter.release();
        }
    }

    // -----------------------------------------------------------------------
    // Trades
    // -----------------------------------------------------------------------

    async fn buy(
        &mut self,
        reason: TradeReason,
        base: &AccumulationState,
        amount: f64,
        price: f64,
        quote_balance: f64,
        now: DateTime<Utc>,
    ) -> Result<TickOutcome, TickError> {
        if let Err(rejection) = self.check_buy(base, amount, price, quote_balance) {
            info!(job_id = %self.job_id, reason = %reason, %rejection, "Buy skipped");
            return Ok(TickOutcome::Rejected { reason, rejection });
        }

        let mut next = base.clone();
        if reason == TradeReason::DipBuy {
            next.recent_high = price;
            next.recent_high_time = Some(now);
        } else {
            next.last_dca_buy_time = Some(now);
        }

        if self.dry_run {
            self.store
                .update_working_state(&self.job_id, &next, now)
                .await?;
            self.state = next;
            info!(
                job_id = %self.job_id,
                token = %self.token.symbol,
                reason = %reason,
                amount = format!("${amount:.2}"),
                price,
                "[DRY RUN] Would buy"
            );
            return Ok(TickOutcome::DryRun {
                side: TradeSide::Buy,
                reason,
                usd_amount: amount,
                price,
            });
        }

        if let Err(rejection) = self.take_rate_slot() {
            info!(job_id = %self.job_id, reason = %reason, %rejection, "Buy skipped");
            return Ok(TickOutcome::Rejected { reason, rejection });
        }

        let fill = self.execute(TradeSide::Buy, amount, true).await?;
        next.apply_buy(amount, fill.filled_amount);

        let trade = NewTrade {
            side: TradeSide::Buy,
            reason,
            base_amount: fill.filled_amount,
            quote_amount: amount,
            price_usd: fill.execution_price,
            tx_hash: Some(fill.external_ref),
            status: TradeStatus::Executed,
            error: None,
        };
        self.commit(trade, next, now).await
    }

    async fn sell(
        &mut self,
        reason: TradeReason,
        base: &AccumulationState,
        usd_amount: f64,
        price: f64,
        now: DateTime<Utc>,
    ) -> Result<TickOutcome, TickError> {
        let mut next = base.clone();
        if reason == TradeReason::TakeProfit {
            next.recent_high = price;
            next.recent_high_time = Some(now);
        }

        if self.dry_run {
            if next != self.state {
                self.store
                    .update_working_state(&self.job_id, &next, now)
                    .await?;
                self.state = next;
            }
            info!(
                job_id = %self.job_id,
                token = %self.token.symbol,
                reason = %reason,
                amount = format!("${usd_amount:.2}"),
                price,
                "[DRY RUN] Would sell"
            );
            return Ok(TickOutcome::DryRun {
                side: TradeSide::Sell,
                reason,
                usd_amount,
                price,
            });
        }

        if reason != TradeReason::Liquidate {
            if let Err(rejection) = self.take_rate_slot() {
                info!(job_id = %self.job_id, reason = %reason, %rejection, "Sell skipped");
                return Ok(TickOutcome::Rejected { reason, rejection });
            }
        }

        let holds_slot = reason != TradeReason::Liquidate;
        let fill = self.execute(TradeSide::Sell, usd_amount, holds_slot).await?;
        let units = fill.filled_amount.min(base.token_balance);
        next.apply_sell(units);
        if reason == TradeReason::Liquidate && next.token_balance == 0.0 {
            next.close_position();
        }

        let trade = NewTrade {
            side: TradeSide::Sell,
            reason,
            base_amount: units,
            quote_amount: units * fill.execution_price,
            price_usd: fill.execution_price,
            tx_hash: Some(fill.external_ref),
            status: TradeStatus::Executed,
            error: None,
        };
        self.commit(trade, next, now).await
    }

    /// Call the venue and validate the fill. A failed call gives its rate
    /// slot back; a bad fill does not, since the venue may have traded.
    async fn execute(
        &self,
        side: TradeSide,
        usd_amount: f64,
        holds_slot: bool,
    ) -> Result<Fill, TickError> {
        let fill = match self
            .ports
            .venue
            .execute(side, &self.token, usd_amount)
            .await
        {
            Ok(fill) => fill,
            Err(e) => {
                if holds_slot {
                    self.release_rate_slot();
                }
                return Err(e.into());
            }
        };

        let problem = if !(fill.filled_amount.is_finite() && fill.filled_amount > 0.0) {
            Some(format!("filled amount {}", fill.filled_amount))
        } else if !(fill.execution_price.is_finite() && fill.execution_price > 0.0) {
            Some(format!("execution price {}", fill.execution_price))
        } else {
            None
        };
        if let Some(problem) = problem {
            error!(
                job_id = %self.job_id,
                side = %side,
                external_ref = %fill.external_ref,
                %problem,
                "Venue returned an unusable fill; nothing recorded"
            );
            return Err(TickError::InvalidFill(problem));
        }
        Ok(fill)
    }

    async fn commit(
        &mut self,
        trade: NewTrade,
        next: AccumulationState,
        now: DateTime<Utc>,
    ) -> Result<TickOutcome, TickError> {
        let (trade, job) = match self
            .store
            .record_trade_and_update_state(&self.job_id, &trade, &next, now)
            .await
        {
            Ok(recorded) => recorded,
            Err(e) => {
                error!(
                    job_id = %self.job_id,
                    side = %trade.side,
                    reason = %trade.reason,
                    external_ref = ?trade.tx_hash,
                    error = %e,
                    "Executed trade could not be recorded"
                );
                return Err(e.into());
            }
        };

        self.state = job.accumulation_state();
        info!(
            job_id = %self.job_id,
            token = %self.token.symbol,
            trade = %trade,
            balance = self.state.token_balance,
            avg = self.state.avg_buy_price(),
            "Trade recorded"
        );
        Ok(TickOutcome::Traded(trade))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
