//! Integration tests: full engine/supervisor/store stack against a
//! scripted market.

mod lifecycle;
mod mock_ports;
mod simulation;
