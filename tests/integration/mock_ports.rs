//! Scripted market for integration testing.
//!
//! A deterministic implementation of all three ports: prices follow a
//! fixed path advanced by the test, buys debit an in-memory quote
//! balance, and any port can be told to fail.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use stacker::ports::{BalanceSource, ExecutionVenue, Fill, PortError, Ports, PriceFeed, Quote};
use stacker::types::{Token, TradeSide};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailPoint {
    Price,
    Balance,
    Execution,
}

pub struct MockMarket {
    path: Vec<f64>,
    cursor: Mutex<usize>,
    balance: Mutex<f64>,
    fills: Mutex<Vec<(TradeSide, Fill)>>,
    /// If set, the named port returns an error.
    force_error: Mutex<Option<(FailPoint, String)>>,
}

impl MockMarket {
    pub fn new(path: Vec<f64>, quote_balance: f64) -> Arc<Self> {
        assert!(!path.is_empty(), "price path must not be empty");
        Arc::new(Self {
            path,
            cursor: Mutex::new(0),
            balance: Mutex::new(quote_balance),
            fills: Mutex::new(Vec::new()),
            force_error: Mutex::new(None),
        })
    }

    pub fn ports(self: &Arc<Self>) -> Ports {
        Ports {
            prices: self.clone(),
            balances: self.clone(),
            venue: self.clone(),
        }
    }

    pub fn price(&self) -> f64 {
        self.path[*self.cursor.lock().unwrap()]
    }

    /// Move to the next price. Returns false at the end of the path.
    pub fn advance(&self) -> bool {
        let mut cursor = self.cursor.lock().unwrap();
        if *cursor + 1 < self.path.len() {
            *cursor += 1;
            true
        } else {
            false
        }
    }

    pub fn len(&self) -> usize {
        self.path.len()
    }

    pub fn is_empty(&self) -> bool {
        self.path.is_empty()
    }

    pub fn quote_balance(&self) -> f64 {
        *self.balance.lock().unwrap()
    }

    pub fn fills(&self) -> Vec<(TradeSide, Fill)> {
        self.fills.lock().unwrap().clone()
    }

    pub fn fail(&self, point: FailPoint, msg: &str) {
        *self.force_error.lock().unwrap() = Some((point, msg.to_string()));
    }

    pub fn clear_error(&self) {
        *self.force_error.lock().unwrap() = None;
    }

    fn check(&self, point: FailPoint) -> Option<String> {
        match self.force_error.lock().unwrap().as_ref() {
            Some((p, msg)) if *p == point => Some(msg.clone()),
            _ => None,
        }
    }
}

#[async_trait]
impl PriceFeed for MockMarket {
    async fn quote(&self, token: &Token) -> Result<Quote, PortError> {
        if let Some(reason) = self.check(FailPoint::Price) {
            return Err(PortError::PriceUnavailable {
                token: token.address.clone(),
                reason,
            });
        }
        Ok(Quote {
            price: self.price(),
            timestamp: Utc::now(),
        })
    }
}

#[async_trait]
impl BalanceSource for MockMarket {
    async fn balance(&self, token: &Token) -> Result<f64, PortError> {
        if let Some(reason) = self.check(FailPoint::Balance) {
            return Err(PortError::BalanceQueryFailed {
                token: token.address.clone(),
                reason,
            });
        }
        Ok(self.quote_balance())
    }
}

#[async_trait]
impl ExecutionVenue for MockMarket {
    async fn execute(
        &self,
        side: TradeSide,
        _token: &Token,
        usd_amount: f64,
    ) -> Result<Fill, PortError> {
        if let Some(reason) = self.check(FailPoint::Execution) {
            return Err(PortError::ExecutionFailed(reason));
        }
        let price = self.price();
        {
            let mut balance = self.balance.lock().unwrap();
            match side {
                TradeSide::Buy => *balance -= usd_amount,
                TradeSide::Sell => *balance += usd_amount,
            }
        }
        let fill = Fill {
            filled_amount: usd_amount / price,
            execution_price: price,
            external_ref: format!("0x{}", Uuid::new_v4().simple()),
        };
        self.fills.lock().unwrap().push((side, fill.clone()));
        Ok(fill)
    }

    fn name(&self) -> &str {
        "mock"
    }
}
