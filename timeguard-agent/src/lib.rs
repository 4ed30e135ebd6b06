//! timeguard-agent library
//!
//! Command protocol, command server and local enforcement for a monitored machine.

pub mod config;
pub mod daemon;
pub mod logging;
pub mod metrics;
pub mod monitor;
pub mod session;
pub mod state;
