//! Agent command daemon
//!
//! This module provides:
//! - the text command protocol and its framing
//! - command dispatch against the enforcement state
//! - the TCP server with per-connection tasks

pub mod processor;
pub mod protocol;
pub mod server;

pub use processor::CommandProcessor;
pub use protocol::{Command, ProtocolError};
pub use server::{AgentServer, ConnectionInfo, ServerConfig, ServerError, ServerHandle};
