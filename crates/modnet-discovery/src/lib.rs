//! ModNet Discovery
//!
//! Out-of-band LAN discovery: open hosts broadcast a presence heartbeat on
//! the discovery port ([`Announcer`]); prospective clients listen, keep a
//! registry of open hosts, and evict entries that fall silent ([`Browser`]).

pub mod announce;
pub mod browse;
pub mod error;
pub mod host;

pub use announce::{Announcement, Announcer};
pub use browse::Browser;
pub use error::{DiscoveryError, Result};
pub use host::DiscoveredHost;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Where presence heartbeats are sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnounceTarget {
    /// LAN-wide broadcast (255.255.255.255).
    Broadcast,
    /// A multicast group.
    Multicast(Ipv4Addr),
    /// One explicit listener (directed announce, loopback tests).
    Unicast(SocketAddr),
}

/// Discovery event emitted by a [`Browser`].
#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    /// Host seen for the first time.
    Found(DiscoveredHost),
    /// Known host refreshed (name/occupancy may have changed).
    Updated(DiscoveredHost),
    /// Host fell silent past the timeout and was evicted.
    Lost(SocketAddr),
}

/// Discovery configuration, shared by announcer and browser.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Discovery port.
    pub port: u16,
    /// Heartbeat destination.
    pub target: AnnounceTarget,
    /// Announcer heartbeat interval.
    pub interval: Duration,
    /// Browser-side silence window before a host is evicted.
    pub host_timeout: Duration,
    /// Local IP whose heartbeats the browser ignores (self-origination).
    pub local_ip: Option<IpAddr>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            port: modnet_core::DEFAULT_DISCOVERY_PORT,
            target: AnnounceTarget::Broadcast,
            interval: Duration::from_secs(1),
            host_timeout: Duration::from_secs(3),
            local_ip: None,
        }
    }
}
