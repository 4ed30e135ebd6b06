//! Operator-side facade over discovery, the directory and dispatch

use chrono::Local;
use futures::future::join_all;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use timeguard_agent::daemon::protocol::response;
use timeguard_agent::daemon::Command;

use crate::actions::Action;
use crate::config::ControllerConfig;
use crate::directory::{AgentDirectory, DirectorySnapshot};
use crate::discovery::{local_ipv4, DiscoveryScanner, ReverseResolver, ScanConfig, SystemResolver};
use crate::dispatch::{AgentClient, CommandOutcome};

pub struct Controller {
    client: AgentClient,
    scanner: DiscoveryScanner,
    directory: AgentDirectory,
    subnet: Option<Ipv4Addr>,
    status_timeout: Duration,
    command_timeout: Duration,
}

impl Controller {
    pub fn new(config: &ControllerConfig) -> Self {
        Self::with_resolver(config, Arc::new(SystemResolver))
    }

    pub fn with_resolver(config: &ControllerConfig, resolver: Arc<dyn ReverseResolver>) -> Self {
        let client = AgentClient::new(config.port);
        Self {
            client,
            scanner: DiscoveryScanner::new(client, ScanConfig::from(config), resolver),
            directory: AgentDirectory::new(),
            subnet: config.subnet,
            status_timeout: config.timeouts.status(),
            command_timeout: config.timeouts.command(),
        }
    }

    pub fn directory(&self) -> Arc<DirectorySnapshot> {
        self.directory.snapshot()
    }

    /// Scan the configured subnet (or the local one) and replace the directory
    pub async fn scan(&self) -> Arc<DirectorySnapshot> {
        let local = self.subnet.unwrap_or_else(local_ipv4);
        let found = self.scanner.scan(local).await;
        self.directory
            .replace(DirectorySnapshot::from_scan(found, Local::now()));
        self.directory.snapshot()
    }

    /// Ask every known agent for its lock status and publish the results together.
    ///
    /// Agents that do not answer keep their previous status.
    pub async fn refresh_status(&self) -> Arc<DirectorySnapshot> {
        let current = self.directory.snapshot();
        let queries = current.agents.keys().map(|&ip| async move {
            let outcome = self
                .client
                .execute(IpAddr::V4(ip), &Command::GetStatus, self.status_timeout)
                .await;
            (ip, outcome)
        });
        let results = join_all(queries).await;

        let now = Local::now();
        self.directory.update(|snapshot| {
            for (ip, outcome) in results {
                let Some(agent) = snapshot.agents.get_mut(&ip) else {
                    continue;
                };
                match parse_status(&outcome) {
                    Some(locked) => {
                        agent.locked = locked;
                        agent.last_seen = now;
                    }
                    None => warn!(%ip, response = %outcome.response, "Status query failed"),
                }
            }
        });
        self.directory.snapshot()
    }

    pub async fn query_status(&self, ip: IpAddr) -> CommandOutcome {
        self.client
            .execute(ip, &Command::GetStatus, self.status_timeout)
            .await
    }

    /// Send a raw command line
    pub async fn send_command(&self, ip: IpAddr, line: &str) -> CommandOutcome {
        self.client.send_command(ip, line, self.command_timeout).await
    }

    pub async fn perform(&self, ip: IpAddr, action: &Action) -> CommandOutcome {
        let command = match action.to_command() {
            Ok(command) => command,
            Err(e) => return CommandOutcome::failed(e.to_string()),
        };

        let timeout = match command {
            Command::GetStatus => self.status_timeout,
            _ => self.command_timeout,
        };
        let outcome = self.client.execute(ip, &command, timeout).await;
        info!(%ip, command = %command, success = outcome.success, "Action sent");

        if let IpAddr::V4(v4) = ip {
            if command == Command::Lock && outcome.success {
                self.directory.mark_locked(v4, true);
            } else if let (Command::GetStatus, Some(locked)) = (&command, parse_status(&outcome)) {
                self.directory.mark_locked(v4, locked);
            }
        }
        outcome
    }
}

fn parse_status(outcome: &CommandOutcome) -> Option<bool> {
    if !outcome.success {
        return None;
    }
    match outcome.response.as_str() {
        response::STATUS_LOCKED => Some(true),
        response::STATUS_UNLOCKED => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{DiscoveredAgent, NameSource};
    use crate::testing::spawn_agent_with;
    use timeguard_agent::session::{DryRunSession, SessionAction};

    const LOCALHOST: Ipv4Addr = Ipv4Addr::LOCALHOST;

    fn controller(port: u16) -> Controller {
        let config = ControllerConfig {
            port,
            subnet: Some(LOCALHOST),
            ..ControllerConfig::default()
        };
        let controller = Controller::new(&config);
        controller.directory.replace(DirectorySnapshot::from_scan(
            [DiscoveredAgent {
                address: LOCALHOST,
                display_name: "desk".into(),
                name_source: NameSource::Override,
                last_seen: Local::now(),
                locked: false,
            }],
            Local::now(),
        ));
        controller
    }

    #[tokio::test]
    async fn test_lock_marks_directory_entry() {
        let session = Arc::new(DryRunSession::new("desk"));
        let agent = spawn_agent_with(IpAddr::V4(LOCALHOST), 0, session.clone()).await;
        let controller = controller(agent.local_addr().port());

        let outcome = controller.perform(IpAddr::V4(LOCALHOST), &Action::Lock).await;
        assert_eq!(outcome, CommandOutcome::ok(response::LOCKED));
        assert!(controller.directory().get(&LOCALHOST).unwrap().locked);
        assert_eq!(session.actions(), vec![SessionAction::Lock]);

        agent.stop().await;
    }

    #[tokio::test]
    async fn test_refresh_status_reads_real_lock_state() {
        let session = Arc::new(DryRunSession::new("desk"));
        let agent = spawn_agent_with(IpAddr::V4(LOCALHOST), 0, session.clone()).await;
        let controller = controller(agent.local_addr().port());

        session.set_locked(true);
        let snapshot = controller.refresh_status().await;
        assert!(snapshot.get(&LOCALHOST).unwrap().locked);

        session.set_locked(false);
        let snapshot = controller.refresh_status().await;
        assert!(!snapshot.get(&LOCALHOST).unwrap().locked);

        agent.stop().await;

        // Unreachable agents keep their last known state
        session.set_locked(true);
        let snapshot = controller.refresh_status().await;
        assert!(!snapshot.get(&LOCALHOST).unwrap().locked);
    }

    #[tokio::test]
    async fn test_invalid_action_is_not_sent() {
        let session = Arc::new(DryRunSession::new("desk"));
        let agent = spawn_agent_with(IpAddr::V4(LOCALHOST), 0, session.clone()).await;
        let controller = controller(agent.local_addr().port());

        let outcome = controller
            .perform(
                IpAddr::V4(LOCALHOST),
                &Action::AddLockTime {
                    time: "99:00".into(),
                },
            )
            .await;
        assert!(!outcome.success);
        assert_eq!(outcome.response, "Invalid time format (use HH:MM)");

        agent.stop().await;
    }

    #[tokio::test]
    async fn test_send_raw_command() {
        let agent = spawn_agent_with(IpAddr::V4(LOCALHOST), 0, Arc::new(DryRunSession::new("desk"))).await;
        let controller = controller(agent.local_addr().port());

        let outcome = controller
            .send_command(IpAddr::V4(LOCALHOST), "EXTEND_TIME:10")
            .await;
        assert_eq!(outcome, CommandOutcome::ok(response::NO_LIMIT_TO_EXTEND));

        agent.stop().await;
    }
}
