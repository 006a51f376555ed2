//! Peer state
//!
//! One [`Peer`] per connected remote: the host keeps one per admitted client,
//! a client keeps exactly one for the host. Owns the four sequence counters
//! and the four delivery buffers; counters are only touched by the owning
//! role's send and receive loops.

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use modnet_core::packet::PeerId;
use modnet_core::PeerColor;
use modnet_transport::TransportSender;

use crate::reliable::Sequenced;

/// Display identity of a peer.
#[derive(Debug, Clone)]
pub struct PeerIdentity {
    pub username: String,
    pub color: PeerColor,
}

impl Default for PeerIdentity {
    fn default() -> Self {
        Self {
            username: "player".to_string(),
            color: PeerColor::default(),
        }
    }
}

/// A connected remote endpoint.
pub struct Peer {
    pub id: PeerId,
    pub addr: SocketAddr,
    pub(crate) sender: Arc<dyn TransportSender>,

    identity: RwLock<PeerIdentity>,
    last_seen: RwLock<Instant>,

    reliable_local: AtomicU16,
    reliable_remote: AtomicU16,
    unreliable_local: AtomicU16,
    unreliable_remote: AtomicU16,

    /// Outstanding reliable sends awaiting ack, keyed by sequence.
    pub(crate) outstanding: DashMap<u16, Bytes>,
    /// Outstanding slice sends awaiting ack, keyed by (sequence, index).
    pub(crate) outstanding_slices: DashMap<(u16, u16), Bytes>,
    /// Received reliable packets parked until their sequence gap closes.
    pub(crate) out_of_order: DashMap<u16, Sequenced>,
    /// Partially received chunks: sequence → slice index → bytes.
    pub(crate) chunks: DashMap<u16, BTreeMap<u16, Bytes>>,
}

impl Peer {
    pub(crate) fn new(id: PeerId, addr: SocketAddr, sender: Arc<dyn TransportSender>) -> Self {
        Self {
            id,
            addr,
            sender,
            identity: RwLock::new(PeerIdentity::default()),
            last_seen: RwLock::new(Instant::now()),
            reliable_local: AtomicU16::new(0),
            reliable_remote: AtomicU16::new(0),
            unreliable_local: AtomicU16::new(0),
            unreliable_remote: AtomicU16::new(0),
            outstanding: DashMap::new(),
            outstanding_slices: DashMap::new(),
            out_of_order: DashMap::new(),
            chunks: DashMap::new(),
        }
    }

    /// Refresh the liveness stamp.
    pub fn touch(&self) {
        *self.last_seen.write() = Instant::now();
    }

    /// Time since the last packet from this peer.
    pub fn idle_for(&self) -> Duration {
        self.last_seen.read().elapsed()
    }

    pub fn identity(&self) -> PeerIdentity {
        self.identity.read().clone()
    }

    pub(crate) fn set_identity(&self, username: String, color: PeerColor) {
        *self.identity.write() = PeerIdentity { username, color };
    }

    /// Claim the next reliable sequence number (shared by both reliable
    /// classes, so every reliable send is uniquely numbered).
    pub(crate) fn next_reliable(&self) -> u16 {
        self.reliable_local.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }

    /// Claim the next unreliable sequence number.
    pub(crate) fn next_unreliable(&self) -> u16 {
        self.unreliable_local
            .fetch_add(1, Ordering::Relaxed)
            .wrapping_add(1)
    }

    pub(crate) fn reliable_remote(&self) -> u16 {
        self.reliable_remote.load(Ordering::Relaxed)
    }

    pub(crate) fn set_reliable_remote(&self, sequence: u16) {
        self.reliable_remote.store(sequence, Ordering::Relaxed);
    }

    pub(crate) fn unreliable_remote(&self) -> u16 {
        self.unreliable_remote.load(Ordering::Relaxed)
    }

    pub(crate) fn set_unreliable_remote(&self, sequence: u16) {
        self.unreliable_remote.store(sequence, Ordering::Relaxed);
    }

    /// Drop every buffered packet. Called on disconnect so no retransmit
    /// task finds anything left to resend.
    pub(crate) fn clear_buffers(&self) {
        self.outstanding.clear();
        self.outstanding_slices.clear();
        self.out_of_order.clear();
        self.chunks.clear();
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id)
            .field("addr", &self.addr)
            .field("username", &self.identity.read().username)
            .finish()
    }
}

/// Roster snapshot entry handed to the application.
#[derive(Debug, Clone)]
pub struct PeerSummary {
    pub id: PeerId,
    pub username: String,
    pub color: PeerColor,
}
