//! Discovery directory
//!
//! Readers always get a complete snapshot: every update builds a new
//! [`DirectorySnapshot`] and swaps it in under a single write lock.

use chrono::{DateTime, Local};
use serde::Serialize;
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::{Arc, PoisonError, RwLock};

/// Where a display name came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NameSource {
    Override,
    Agent,
    ReverseDns,
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscoveredAgent {
    pub address: Ipv4Addr,
    pub display_name: String,
    pub name_source: NameSource,
    pub last_seen: DateTime<Local>,
    pub locked: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DirectorySnapshot {
    pub agents: BTreeMap<Ipv4Addr, DiscoveredAgent>,
    /// When the last scan completed
    pub scanned_at: Option<DateTime<Local>>,
}

impl DirectorySnapshot {
    pub fn from_scan(agents: impl IntoIterator<Item = DiscoveredAgent>, at: DateTime<Local>) -> Self {
        Self {
            agents: agents.into_iter().map(|a| (a.address, a)).collect(),
            scanned_at: Some(at),
        }
    }

    pub fn get(&self, address: &Ipv4Addr) -> Option<&DiscoveredAgent> {
        self.agents.get(address)
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct AgentDirectory {
    current: RwLock<Arc<DirectorySnapshot>>,
}

impl AgentDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Arc<DirectorySnapshot> {
        Arc::clone(&self.current.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Publish a complete new directory
    pub fn replace(&self, snapshot: DirectorySnapshot) {
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(snapshot);
    }

    /// Copy the current snapshot, edit it and publish the result atomically
    pub fn update<F>(&self, f: F)
    where
        F: FnOnce(&mut DirectorySnapshot),
    {
        let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = DirectorySnapshot::clone(&guard);
        f(&mut next);
        *guard = Arc::new(next);
    }

    /// Returns false if the address is not in the directory
    pub fn mark_locked(&self, address: Ipv4Addr, locked: bool) -> bool {
        let mut found = false;
        self.update(|snapshot| {
            if let Some(agent) = snapshot.agents.get_mut(&address) {
                agent.locked = locked;
                agent.last_seen = Local::now();
                found = true;
            }
        });
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent(last_octet: u8) -> DiscoveredAgent {
        let address = Ipv4Addr::new(192, 168, 1, last_octet);
        DiscoveredAgent {
            address,
            display_name: format!("PC at {}", address),
            name_source: NameSource::Fallback,
            last_seen: Local::now(),
            locked: false,
        }
    }

    #[test]
    fn test_replace_swaps_whole_directory() {
        let directory = AgentDirectory::new();
        assert!(directory.snapshot().is_empty());
        assert!(directory.snapshot().scanned_at.is_none());

        directory.replace(DirectorySnapshot::from_scan([agent(2), agent(3)], Local::now()));
        let before = directory.snapshot();
        assert_eq!(before.len(), 2);

        directory.replace(DirectorySnapshot::from_scan([agent(9)], Local::now()));

        // Earlier readers keep the snapshot they were handed
        assert_eq!(before.len(), 2);
        let after = directory.snapshot();
        assert_eq!(after.len(), 1);
        assert!(after.get(&Ipv4Addr::new(192, 168, 1, 9)).is_some());
    }

    #[test]
    fn test_mark_locked() {
        let directory = AgentDirectory::new();
        directory.replace(DirectorySnapshot::from_scan([agent(2)], Local::now()));

        assert!(directory.mark_locked(Ipv4Addr::new(192, 168, 1, 2), true));
        assert!(!directory.mark_locked(Ipv4Addr::new(192, 168, 1, 7), true));

        let snapshot = directory.snapshot();
        assert!(snapshot.get(&Ipv4Addr::new(192, 168, 1, 2)).unwrap().locked);
        assert_eq!(snapshot.len(), 1);
    }
}
