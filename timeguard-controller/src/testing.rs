//! In-process agents for controller tests

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use timeguard_agent::daemon::{AgentServer, CommandProcessor, ServerConfig, ServerHandle};
use timeguard_agent::metrics::MetricsCollector;
use timeguard_agent::session::DryRunSession;
use timeguard_agent::state::EnforcementState;

/// Start an agent on `bind:port` whose session is a dry run reporting `hostname`
pub async fn spawn_agent(bind: IpAddr, port: u16, hostname: &str) -> ServerHandle {
    spawn_agent_with(bind, port, Arc::new(DryRunSession::new(hostname))).await
}

pub async fn spawn_agent_with(bind: IpAddr, port: u16, session: Arc<DryRunSession>) -> ServerHandle {
    let processor = Arc::new(CommandProcessor::new(
        Arc::new(RwLock::new(EnforcementState::new())),
        session,
        Arc::new(MetricsCollector::new()),
        Duration::from_secs(60),
    ));
    AgentServer::new(
        ServerConfig {
            bind,
            port,
            idle_timeout: Duration::from_secs(5),
        },
        processor,
    )
    .start()
    .await
    .unwrap()
}
