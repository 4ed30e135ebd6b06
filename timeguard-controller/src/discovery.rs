//! LAN discovery of agents
//!
//! A scan probes every host of a /24 concurrently. Presence is a successful
//! TCP connect to the agent port; no handshake is needed. Each present agent
//! then gets a display name from, in order: an operator override, the
//! agent's own `GET_NAME` answer, reverse DNS, or a synthesized fallback.
//! Probes are isolated by their own timeouts and the scan waits for all of
//! them.

use chrono::Local;
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use timeguard_agent::daemon::Command;

use crate::config::ControllerConfig;
use crate::directory::{DiscoveredAgent, NameSource};
use crate::dispatch::AgentClient;

/// Looks up a host name for an address
pub trait ReverseResolver: Send + Sync {
    fn lookup(&self, ip: IpAddr) -> Option<String>;
}

/// Resolver backed by the system's `getnameinfo`
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResolver;

impl ReverseResolver for SystemResolver {
    fn lookup(&self, ip: IpAddr) -> Option<String> {
        let host = dns_lookup::lookup_addr(&ip).ok()?;
        // getnameinfo hands back the numeric form when no name exists
        if host.parse::<IpAddr>().is_ok() {
            return None;
        }
        let label = host.split('.').next()?.trim();
        if label.is_empty() {
            None
        } else {
            Some(label.to_uppercase())
        }
    }
}

/// The address this machine uses to reach the LAN.
///
/// Connecting a UDP socket sends nothing; it only makes the OS pick a route.
/// Falls back to loopback when no route exists.
pub fn local_ipv4() -> Ipv4Addr {
    let probe = || -> std::io::Result<IpAddr> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        socket.connect(SocketAddr::from(([8, 8, 8, 8], 80)))?;
        Ok(socket.local_addr()?.ip())
    };
    match probe() {
        Ok(IpAddr::V4(ip)) if !ip.is_unspecified() => ip,
        Ok(other) => {
            warn!(address = %other, "No usable IPv4 address, using loopback");
            Ipv4Addr::LOCALHOST
        }
        Err(e) => {
            warn!(error = %e, "Could not determine local address, using loopback");
            Ipv4Addr::LOCALHOST
        }
    }
}

/// Host addresses .1 through .254 of the /24 containing `ip`
pub fn subnet_hosts(ip: Ipv4Addr) -> impl Iterator<Item = Ipv4Addr> {
    let [a, b, c, _] = ip.octets();
    (1..=254).map(move |d| Ipv4Addr::new(a, b, c, d))
}

#[derive(Debug, Clone)]
pub struct ScanConfig {
    pub probe_timeout: Duration,
    pub name_timeout: Duration,
    pub names: BTreeMap<Ipv4Addr, String>,
}

impl From<&ControllerConfig> for ScanConfig {
    fn from(config: &ControllerConfig) -> Self {
        Self {
            probe_timeout: config.timeouts.probe(),
            name_timeout: config.timeouts.name(),
            names: config.names.clone(),
        }
    }
}

#[derive(Clone)]
pub struct DiscoveryScanner {
    client: AgentClient,
    config: Arc<ScanConfig>,
    resolver: Arc<dyn ReverseResolver>,
}

impl DiscoveryScanner {
    pub fn new(client: AgentClient, config: ScanConfig, resolver: Arc<dyn ReverseResolver>) -> Self {
        Self {
            client,
            config: Arc::new(config),
            resolver,
        }
    }

    /// Scan the /24 around `local` and return every agent found, by address
    pub async fn scan(&self, local: Ipv4Addr) -> Vec<DiscoveredAgent> {
        info!(subnet = %format!("{}/24", subnet_base(local)), port = self.client.port(), "Scanning");

        let mut probes = JoinSet::new();
        for ip in subnet_hosts(local) {
            let scanner = self.clone();
            probes.spawn(async move { scanner.probe(ip).await });
        }

        let mut found = Vec::new();
        while let Some(result) = probes.join_next().await {
            match result {
                Ok(Some(agent)) => found.push(agent),
                Ok(None) => {}
                Err(e) => warn!(error = %e, "Probe task failed"),
            }
        }
        found.sort_by_key(|agent| agent.address);

        info!(found = found.len(), "Scan complete");
        found
    }

    async fn probe(&self, ip: Ipv4Addr) -> Option<DiscoveredAgent> {
        let addr = SocketAddr::from((ip, self.client.port()));
        match tokio::time::timeout(self.config.probe_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => drop(stream),
            _ => return None,
        }

        let (display_name, name_source) = self.resolve_name(ip).await;
        debug!(%ip, name = %display_name, source = ?name_source, "Agent found");
        Some(DiscoveredAgent {
            address: ip,
            display_name,
            name_source,
            last_seen: Local::now(),
            locked: false,
        })
    }

    async fn resolve_name(&self, ip: Ipv4Addr) -> (String, NameSource) {
        if let Some(name) = self.config.names.get(&ip) {
            return (name.clone(), NameSource::Override);
        }

        if let Ok(name) = self
            .client
            .request(IpAddr::V4(ip), &Command::GetName.to_string(), self.config.name_timeout)
            .await
        {
            let name = name.trim();
            if !name.is_empty() {
                return (name.to_string(), NameSource::Agent);
            }
        }

        let resolver = Arc::clone(&self.resolver);
        let lookup = tokio::task::spawn_blocking(move || resolver.lookup(IpAddr::V4(ip)));
        if let Ok(Ok(Some(name))) = tokio::time::timeout(self.config.name_timeout, lookup).await {
            return (name, NameSource::ReverseDns);
        }

        (format!("PC at {}", ip), NameSource::Fallback)
    }
}

fn subnet_base(ip: Ipv4Addr) -> Ipv4Addr {
    let [a, b, c, _] = ip.octets();
    Ipv4Addr::new(a, b, c, 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{spawn_agent, spawn_agent_with};
    use timeguard_agent::session::DryRunSession;

    struct StaticResolver(Option<&'static str>);

    impl ReverseResolver for StaticResolver {
        fn lookup(&self, _ip: IpAddr) -> Option<String> {
            self.0.map(str::to_string)
        }
    }

    fn scanner(port: u16, names: BTreeMap<Ipv4Addr, String>, dns: Option<&'static str>) -> DiscoveryScanner {
        DiscoveryScanner::new(
            AgentClient::new(port),
            ScanConfig {
                probe_timeout: Duration::from_millis(500),
                name_timeout: Duration::from_secs(1),
                names,
            },
            Arc::new(StaticResolver(dns)),
        )
    }

    #[test]
    fn test_subnet_hosts_cover_slash_24() {
        let hosts: Vec<_> = subnet_hosts(Ipv4Addr::new(192, 168, 1, 37)).collect();
        assert_eq!(hosts.len(), 254);
        assert_eq!(hosts[0], Ipv4Addr::new(192, 168, 1, 1));
        assert_eq!(hosts[253], Ipv4Addr::new(192, 168, 1, 254));
    }

    #[tokio::test]
    async fn test_name_resolution_order() {
        let ip = Ipv4Addr::LOCALHOST;
        let agent = spawn_agent(IpAddr::V4(ip), 0, "kids-pc").await;
        let port = agent.local_addr().port();

        let overrides = BTreeMap::from([(ip, "Living Room".to_string())]);
        assert_eq!(
            scanner(port, overrides, Some("HOST")).resolve_name(ip).await,
            ("Living Room".to_string(), NameSource::Override)
        );
        assert_eq!(
            scanner(port, BTreeMap::new(), Some("HOST")).resolve_name(ip).await,
            ("kids-pc".to_string(), NameSource::Agent)
        );
        agent.stop().await;

        // Nothing answers GET_NAME any more
        assert_eq!(
            scanner(port, BTreeMap::new(), Some("HOST")).resolve_name(ip).await,
            ("HOST".to_string(), NameSource::ReverseDns)
        );
        assert_eq!(
            scanner(port, BTreeMap::new(), None).resolve_name(ip).await,
            ("PC at 127.0.0.1".to_string(), NameSource::Fallback)
        );
    }

    #[tokio::test]
    async fn test_blank_agent_name_falls_through() {
        let ip = Ipv4Addr::LOCALHOST;
        let agent = spawn_agent_with(IpAddr::V4(ip), 0, Arc::new(DryRunSession::new("  "))).await;
        let port = agent.local_addr().port();

        assert_eq!(
            scanner(port, BTreeMap::new(), None).resolve_name(ip).await,
            ("PC at 127.0.0.1".to_string(), NameSource::Fallback)
        );
        agent.stop().await;
    }

    // Loopback aliases beyond 127.0.0.1 are only routable out of the box on Linux
    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_scan_finds_exactly_the_listening_agents() {
        let first = spawn_agent(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 2)), 0, "pc-two").await;
        let port = first.local_addr().port();
        let second = spawn_agent(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 3)), port, "pc-three").await;
        let third = spawn_agent(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 4)), port, "").await;

        let scanner = scanner(port, BTreeMap::new(), None);
        let found = tokio::time::timeout(
            Duration::from_secs(10),
            scanner.scan(Ipv4Addr::LOCALHOST),
        )
        .await
        .expect("scan did not finish");

        let addresses: Vec<_> = found.iter().map(|a| a.address).collect();
        assert_eq!(
            addresses,
            vec![
                Ipv4Addr::new(127, 0, 0, 2),
                Ipv4Addr::new(127, 0, 0, 3),
                Ipv4Addr::new(127, 0, 0, 4),
            ]
        );
        assert!(found.iter().all(|a| !a.display_name.is_empty()));
        assert_eq!(found[0].display_name, "pc-two");
        assert_eq!(found[2].display_name, "PC at 127.0.0.4");

        for agent in [first, second, third] {
            agent.stop().await;
        }
    }
}
