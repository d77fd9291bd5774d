//! Known peers, deduplicated by IP. Entries live for the process lifetime.

use std::collections::HashMap;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A peer seen on the LAN. Unique by `ip`; never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerAddress {
    pub ip: IpAddr,
    pub discovered_at: DateTime<Utc>,
}

impl PeerAddress {
    pub fn new(ip: IpAddr) -> Self {
        Self {
            ip,
            discovered_at: Utc::now(),
        }
    }
}

#[derive(Debug, Default)]
pub struct AddressBook {
    peers: HashMap<IpAddr, PeerAddress>,
}

impl AddressBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent insert. Returns true if the IP was not known before.
    pub fn record(&mut self, ip: IpAddr) -> bool {
        if self.peers.contains_key(&ip) {
            return false;
        }
        self.peers.insert(ip, PeerAddress::new(ip));
        true
    }

    pub fn get(&self, ip: &IpAddr) -> Option<&PeerAddress> {
        self.peers.get(ip)
    }

    pub fn contains(&self, ip: &IpAddr) -> bool {
        self.peers.contains_key(ip)
    }

    /// Snapshot of every known peer. Order is unspecified.
    pub fn all(&self) -> Vec<PeerAddress> {
        self.peers.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
