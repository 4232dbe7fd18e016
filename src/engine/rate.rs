//! Process-wide hourly trade budget.
//!
//! Shared by every job engine. The scheduler zeroes it once an hour; an
//! engine takes a slot just before executing and gives it back if the
//! execution fails.

use std::sync::atomic::{AtomicU32, Ordering};
use tracing::debug;

#[derive(Debug)]
pub struct TradeRateCounter {
    max_per_hour: Option<u32>,
    count: AtomicU32,
}

impl TradeRateCounter {
    /// `None` means unlimited; the counter still counts.
    pub fn new(max_per_hour: Option<u32>) -> Self {
        Self {
            max_per_hour,
            count: AtomicU32::new(0),
        }
    }

    pub fn limit(&self) -> Option<u32> {
        self.max_per_hour
    }

    /// Trades counted in the current window.
    pub fn count(&self) -> u32 {
        self.count.load(Ordering::SeqCst)
    }

    /// Take one slot. Returns false when the hourly budget is spent.
    pub fn try_acquire(&self) -> bool {
        let limit = self.max_per_hour.unwrap_or(u32::MAX);
        self.count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < limit).then_some(n + 1)
            })
            .is_ok()
    }

    /// Return a slot taken for an execution that did not happen.
    pub fn release(&self) {
        let _ = self
            .count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    pub fn reset(&self) {
        let previous = self.count.swap(0, Ordering::SeqCst);
        debug!(previous, "Hourly trade counter reset");
    }
}
