//! Core engine: per-job accumulation logic, lifecycle supervision, and
//! the tick loop that drives them.

pub mod accumulator;
pub mod rate;
pub mod scheduler;
pub mod supervisor;

pub use accumulator::{AccumulationEngine, Rejection, TickError, TickOutcome};
pub use rate::TradeRateCounter;
pub use scheduler::TickScheduler;
pub use supervisor::{JobReport, Supervisor, SupervisorSettings, TickAttempt};
