//! Session events
//!
//! Application-facing notifications, delivered over the single event channel
//! returned by the role constructors. Dropping the receiver simply discards
//! further events; tearing the role down closes the channel, so nothing can
//! fire after disposal.

use modnet_core::packet::PeerId;

/// Connection lifecycle of a role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Why a role left the connected state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Local shutdown/disposal.
    Shutdown,
    /// The remote side closed the connection explicitly.
    ClosedByRemote,
    /// Silence beyond the configured timeout.
    Timeout,
    /// A reliable packet went unacknowledged through every retry.
    RetriesExhausted,
}

/// Notifications surfaced to the application.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// The role is up: host opened, or client admitted.
    Connected,
    /// The role stopped.
    Disconnected(DisconnectReason),
    /// A peer entered the roster.
    PeerJoined(PeerId),
    /// A peer left the roster.
    PeerLeft(PeerId),
    /// Roster metadata changed (identity updates included).
    RosterChanged,
}
