//! timeguard-controller library
//!
//! Finds agents on the LAN and sends them commands.

pub mod actions;
pub mod api;
pub mod config;
pub mod controller;
pub mod directory;
pub mod discovery;
pub mod dispatch;

#[cfg(test)]
mod testing;

pub use actions::Action;
pub use controller::Controller;
pub use dispatch::{AgentClient, CommandOutcome, DispatchError};
