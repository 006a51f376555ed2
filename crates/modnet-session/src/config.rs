//! Session configuration
//!
//! Consumed, not owned, by the transport core: engine-side settings objects
//! feed these values in and the roles validate them once at construction.

use std::net::Ipv4Addr;
use std::time::Duration;

use modnet_core::{PeerColor, DEFAULT_DISCOVERY_PORT, DEFAULT_MTU, DEFAULT_PORT, MAX_NAME_LEN};

use crate::error::SessionError;

/// Smallest admissible peer capacity.
pub const MIN_PEERS: u8 = 2;

/// Largest admissible peer capacity (ids 2..=254 minus the host).
pub const MAX_PEERS: u8 = 253;

/// Configuration for a [`crate::Host`] or [`crate::Client`] role.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Local display name (≤ 100 ASCII bytes).
    pub username: String,
    /// Local display color.
    pub color: PeerColor,
    /// Application port the host binds. Clients bind an ephemeral port and
    /// send here.
    pub port: u16,
    /// Discovery heartbeat port.
    pub discovery_port: u16,
    /// Optional multicast group for discovery (broadcast when `None`).
    pub multicast_group: Option<Ipv4Addr>,
    /// Whether an open host announces itself on the discovery port.
    pub announce: bool,
    /// Largest payload sent in a single datagram; larger reliable payloads
    /// are chunked, larger unreliable payloads are rejected.
    pub mtu: usize,
    /// Round-trip-time estimate used to pace retransmits.
    pub rtt: Duration,
    /// Unanswered retransmits before a peer is treated as gone.
    pub max_retries: u32,
    /// Keep-alive cadence (client request beacon, host presence heartbeat,
    /// host roster sweep).
    pub heartbeat_interval: Duration,
    /// How long a client handshake may take, and how long the client
    /// tolerates host silence once connected.
    pub connection_timeout: Duration,
    /// Host-side silence window before a peer is evicted.
    pub peer_timeout: Duration,
    /// Maximum number of connected peers (2–253).
    pub max_peers: u8,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            username: "player".to_string(),
            color: PeerColor::default(),
            port: DEFAULT_PORT,
            discovery_port: DEFAULT_DISCOVERY_PORT,
            multicast_group: None,
            announce: true,
            mtu: DEFAULT_MTU,
            rtt: Duration::from_millis(200),
            max_retries: 5,
            heartbeat_interval: Duration::from_secs(1),
            connection_timeout: Duration::from_secs(5),
            peer_timeout: Duration::from_secs(5),
            max_peers: MAX_PEERS,
        }
    }
}

impl SessionConfig {
    /// Validate user-supplied values. Called by the role constructors.
    pub fn validate(&self) -> Result<(), SessionError> {
        validate_name(&self.username)?;
        if !(MIN_PEERS..=MAX_PEERS).contains(&self.max_peers) {
            return Err(SessionError::InvalidConfig(format!(
                "max_peers must be within {MIN_PEERS}..={MAX_PEERS}, got {}",
                self.max_peers
            )));
        }
        if self.mtu == 0 {
            return Err(SessionError::InvalidConfig("mtu must be non-zero".into()));
        }
        Ok(())
    }

    /// Retransmit delay derived from the RTT estimate.
    pub(crate) fn retransmit_delay(&self) -> Duration {
        self.rtt * 5 / 4
    }
}

/// Shared identity-string validation (usernames and host names).
pub fn validate_name(name: &str) -> Result<(), SessionError> {
    if name.len() > MAX_NAME_LEN {
        return Err(SessionError::InvalidConfig(format!(
            "name is {} bytes, max {MAX_NAME_LEN}",
            name.len()
        )));
    }
    if !name.is_ascii() {
        return Err(SessionError::InvalidConfig(
            "name must be ASCII".to_string(),
        ));
    }
    Ok(())
}
