//! TCP command server

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, info_span, warn, Instrument, Span};

use crate::config::AgentConfig;
use crate::daemon::processor::CommandProcessor;
use crate::daemon::protocol::{frame_codec, Reply};
use crate::metrics::MetricsCollector;

/// Pause after a failed accept so a persistent error (e.g. fd exhaustion)
/// does not spin the accept loop
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: IpAddr,
    pub port: u16,
    /// Silence after which a keepalive is sent; also bounds every write
    pub idle_timeout: Duration,
}

impl From<&AgentConfig> for ServerConfig {
    fn from(config: &AgentConfig) -> Self {
        Self {
            bind: config.bind,
            port: config.port,
            idle_timeout: config.idle_timeout(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
}

/// A live connection, as seen from the registry
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub id: u64,
    pub peer: SocketAddr,
    pub connected_for: Duration,
}

struct ConnectionEntry {
    peer: SocketAddr,
    opened_at: Instant,
    cancel: CancellationToken,
}

/// Active connections keyed by a monotonically increasing id
#[derive(Default)]
pub struct ConnectionRegistry {
    next_id: AtomicU64,
    connections: Mutex<HashMap<u64, ConnectionEntry>>,
}

impl ConnectionRegistry {
    fn connections(&self) -> MutexGuard<'_, HashMap<u64, ConnectionEntry>> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn register(&self, peer: SocketAddr, cancel: CancellationToken) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.connections().insert(
            id,
            ConnectionEntry {
                peer,
                opened_at: Instant::now(),
                cancel,
            },
        );
        id
    }

    fn remove(&self, id: u64) {
        self.connections().remove(&id);
    }

    /// Cancel and forget every connection
    fn close_all(&self) -> usize {
        let drained: Vec<_> = self.connections().drain().collect();
        for (_, entry) in &drained {
            entry.cancel.cancel();
        }
        drained.len()
    }

    pub fn len(&self) -> usize {
        self.connections().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn list(&self) -> Vec<ConnectionInfo> {
        let mut list: Vec<_> = self
            .connections()
            .iter()
            .map(|(id, entry)| ConnectionInfo {
                id: *id,
                peer: entry.peer,
                connected_for: entry.opened_at.elapsed(),
            })
            .collect();
        list.sort_by_key(|c| c.id);
        list
    }
}

/// Command server for the agent
pub struct AgentServer {
    config: ServerConfig,
    processor: Arc<CommandProcessor>,
    span: Span,
}

impl AgentServer {
    pub fn new(config: ServerConfig, processor: Arc<CommandProcessor>) -> Self {
        let span = info_span!("agent_server", port = config.port);
        Self {
            config,
            processor,
            span,
        }
    }

    /// Bind the listener and start accepting connections.
    ///
    /// A port that is already taken is reported as [`ServerError::Bind`];
    /// nothing is retried.
    pub async fn start(&self) -> Result<ServerHandle, ServerError> {
        let addr = SocketAddr::new(self.config.bind, self.config.port);
        let listener = bind_listener(addr).map_err(|source| ServerError::Bind { addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| ServerError::Bind { addr, source })?;

        self.span.in_scope(|| info!(%local_addr, "Server started"));

        let shutdown = CancellationToken::new();
        let registry = Arc::new(ConnectionRegistry::default());
        let tracker = TaskTracker::new();

        let acceptor = Acceptor {
            listener,
            shutdown: shutdown.clone(),
            registry: Arc::clone(&registry),
            tracker: tracker.clone(),
            processor: Arc::clone(&self.processor),
            idle_timeout: self.config.idle_timeout,
        };
        tracker.spawn(acceptor.run().instrument(self.span.clone()));

        Ok(ServerHandle {
            local_addr,
            shutdown,
            registry,
            tracker,
            idle_timeout: self.config.idle_timeout,
            span: self.span.clone(),
        })
    }
}

fn bind_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };
    // Lets a restarted agent rebind while old connections sit in TIME_WAIT.
    // On Windows the same flag would allow two live listeners.
    #[cfg(not(windows))]
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(128)
}

/// Handle to a running server
pub struct ServerHandle {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    registry: Arc<ConnectionRegistry>,
    tracker: TaskTracker,
    idle_timeout: Duration,
    span: Span,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_running(&self) -> bool {
        !self.shutdown.is_cancelled()
    }

    pub fn connections(&self) -> Vec<ConnectionInfo> {
        self.registry.list()
    }

    pub fn active_connections(&self) -> usize {
        self.registry.len()
    }

    /// Stop accepting, close every connection and wait for all units to exit.
    ///
    /// Safe to call more than once and from several tasks at a time.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        let closed = self.registry.close_all();
        self.tracker.close();

        self.span.in_scope(|| info!(closed, "Stopping server"));

        if tokio::time::timeout(self.idle_timeout, self.tracker.wait())
            .await
            .is_err()
        {
            self.span
                .in_scope(|| warn!("Connection units still running after stop"));
        } else {
            self.span.in_scope(|| info!("Server stopped"));
        }
    }

    /// Wait until the server has been stopped from elsewhere
    pub async fn stopped(&self) {
        self.shutdown.cancelled().await;
        self.tracker.wait().await;
    }
}

struct Acceptor {
    listener: TcpListener,
    shutdown: CancellationToken,
    registry: Arc<ConnectionRegistry>,
    tracker: TaskTracker,
    processor: Arc<CommandProcessor>,
    idle_timeout: Duration,
}

impl Acceptor {
    async fn run(self) {
        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => self.spawn_connection(stream, peer),
                Err(e) => {
                    warn!(error = %e, "Accept error");
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            }
        }

        // Dropping the listener closes the port
        drop(self.listener);
        debug!("Accept loop exited");
    }

    fn spawn_connection(&self, stream: TcpStream, peer: SocketAddr) {
        let cancel = self.shutdown.child_token();
        let id = self.registry.register(peer, cancel.clone());
        let metrics = Arc::clone(self.processor.metrics());
        metrics.record_connection_opened();
        info!(conn_id = id, %peer, "New connection");

        let registry = Arc::clone(&self.registry);
        let processor = Arc::clone(&self.processor);
        let idle_timeout = self.idle_timeout;

        self.tracker.spawn(
            async move {
                if let Err(e) = stream.set_nodelay(true) {
                    debug!(error = %e, "Could not disable Nagle");
                }
                let mut framed = Framed::new(stream, frame_codec());

                match serve_connection(&mut framed, &processor, &cancel, idle_timeout).await {
                    Ok(()) => {}
                    Err(e) => warn!(error = %e, "Client error"),
                }

                registry.remove(id);
                metrics.record_connection_closed();
                info!("Client disconnected");
            }
            .instrument(info_span!("connection", conn_id = id, %peer)),
        );
    }
}

/// Read commands until the peer leaves, an I/O error occurs or `cancel` fires
async fn serve_connection(
    framed: &mut Framed<TcpStream, LengthDelimitedCodec>,
    processor: &CommandProcessor,
    cancel: &CancellationToken,
    idle_timeout: Duration,
) -> io::Result<()> {
    loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            read = tokio::time::timeout(idle_timeout, framed.next()) => read,
        };

        let frame = match read {
            Err(_elapsed) => {
                debug!("Idle timeout, sending keepalive");
                send_frame(framed, Reply::KeepAlive.encode(), cancel, idle_timeout)
                    .await?;
                processor.metrics().record_keepalive();
                continue;
            }
            Ok(None) => return Ok(()),
            Ok(Some(frame)) => frame?,
        };

        let line = String::from_utf8_lossy(&frame);
        let line = line.trim();
        info!(command = line, "Received command");

        // A hung collaborator call must not keep the socket open past stop()
        let response = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            response = processor.process(line) => response,
        };
        send_frame(framed, Reply::Response(response).encode(), cancel, idle_timeout).await?;
    }
}

async fn send_frame(
    framed: &mut Framed<TcpStream, LengthDelimitedCodec>,
    frame: Bytes,
    cancel: &CancellationToken,
    limit: Duration,
) -> io::Result<()> {
    tokio::select! {
        _ = cancel.cancelled() => Ok(()),
        sent = tokio::time::timeout(limit, framed.send(frame)) => match sent {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "write timed out")),
        },
    }
}
