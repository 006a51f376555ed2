//! Discovered host representation

use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// An open host seen on the discovery port.
#[derive(Debug, Clone)]
pub struct DiscoveredHost {
    /// Source address of the presence heartbeat.
    pub addr: SocketAddr,
    /// Advertised host name.
    pub name: String,
    /// Maximum number of peers the host admits.
    pub capacity: u8,
    /// Currently connected peers.
    pub occupancy: u8,
    /// When the host was first seen.
    pub discovered_at: Instant,
    /// Last heartbeat time.
    pub last_seen: Instant,
}

impl DiscoveredHost {
    pub fn new(addr: SocketAddr, name: String, capacity: u8, occupancy: u8) -> Self {
        let now = Instant::now();
        Self {
            addr,
            name,
            capacity,
            occupancy,
            discovered_at: now,
            last_seen: now,
        }
    }

    /// Refresh from a new heartbeat.
    pub fn refresh(&mut self, name: String, capacity: u8, occupancy: u8) {
        self.name = name;
        self.capacity = capacity;
        self.occupancy = occupancy;
        self.last_seen = Instant::now();
    }

    /// Whether the host has no admission slots left.
    pub fn is_full(&self) -> bool {
        self.occupancy >= self.capacity
    }

    /// Whether the last heartbeat is older than `timeout`.
    pub fn is_stale(&self, timeout: Duration) -> bool {
        self.last_seen.elapsed() > timeout
    }
}
