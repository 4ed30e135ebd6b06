//! One-shot command exchange with an agent
//!
//! Each call opens a fresh connection, sends one command frame, waits for one
//! response frame (skipping keepalives) and closes. The whole exchange is
//! bounded by a single timeout and is never retried here.

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::debug;

use timeguard_agent::daemon::protocol::{frame_codec, Reply, ReplyError};
use timeguard_agent::daemon::Command;

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Connection to {addr} failed: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("No response within {0:?}")]
    Timeout(Duration),
    #[error("Connection error: {0}")]
    Io(#[from] io::Error),
    #[error("Connection closed before a response arrived")]
    Closed,
    #[error("Malformed response: {0}")]
    Malformed(#[from] ReplyError),
}

/// Result of a dispatched command as handed to the presentation layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandOutcome {
    pub success: bool,
    pub response: String,
}

impl CommandOutcome {
    pub fn ok(response: impl Into<String>) -> Self {
        Self {
            success: true,
            response: response.into(),
        }
    }

    pub fn failed(response: impl Into<String>) -> Self {
        Self {
            success: false,
            response: response.into(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AgentClient {
    port: u16,
}

impl AgentClient {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Send one command line and return the agent's response text
    pub async fn request(
        &self,
        ip: IpAddr,
        line: &str,
        timeout: Duration,
    ) -> Result<String, DispatchError> {
        let addr = SocketAddr::new(ip, self.port);
        tokio::time::timeout(timeout, exchange(addr, line))
            .await
            .map_err(|_| DispatchError::Timeout(timeout))?
    }

    /// Like [`request`](Self::request), with transport failures folded into
    /// an unsuccessful outcome
    pub async fn send_command(&self, ip: IpAddr, line: &str, timeout: Duration) -> CommandOutcome {
        match self.request(ip, line, timeout).await {
            Ok(response) => CommandOutcome::ok(response),
            Err(e) => {
                debug!(%ip, error = %e, "Command failed");
                CommandOutcome::failed(e.to_string())
            }
        }
    }

    pub async fn execute(&self, ip: IpAddr, command: &Command, timeout: Duration) -> CommandOutcome {
        self.send_command(ip, &command.to_string(), timeout).await
    }
}

async fn exchange(addr: SocketAddr, line: &str) -> Result<String, DispatchError> {
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|source| DispatchError::Connect { addr, source })?;
    let mut framed = Framed::new(stream, frame_codec());

    framed.send(Bytes::from(line.to_string())).await?;

    while let Some(frame) = framed.next().await {
        match Reply::decode(&frame?)? {
            Reply::KeepAlive => continue,
            Reply::Response(text) => return Ok(text),
        }
    }
    Err(DispatchError::Closed)
}
