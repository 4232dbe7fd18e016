//! STACKER: tick-driven token accumulation agent.
//!
//! Library crate exposing all modules for use by integration tests
//! and the binary entry point.

pub mod config;
pub mod dashboard;
pub mod engine;
pub mod ports;
pub mod storage;
pub mod types;
