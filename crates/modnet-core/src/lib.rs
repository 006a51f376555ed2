//! ModNet Core
//!
//! Packet model, wire codec, and protocol primitives for ModNet.
//!
//! This crate provides:
//! - Protocol packet types ([`Packet`], [`PacketKind`], [`Reliability`])
//! - Binary encoding/decoding with CRC32 integrity ([`codec`])
//! - Wrap-aware 16-bit sequence arithmetic ([`sequence`])
//! - Module identifiers ([`ModuleId`])
//!
//! Everything here is pure data and arithmetic; sockets and tasks live in
//! `modnet-transport` and `modnet-session`.

pub mod codec;
pub mod error;
pub mod packet;
pub mod sequence;

pub use codec::{decode, encode};
pub use error::{Error, Result};
pub use packet::{ChunkInfo, ModuleId, Packet, PacketKind, PeerColor, Reliability};

/// Salt mixed into every checksum. Packets from other protocols (or other
/// ModNet versions that bump this) fail the integrity check and are dropped.
pub const PROTOCOL_SALT: u32 = 0x4D4E_0004;

/// Default application port.
pub const DEFAULT_PORT: u16 = 26822;

/// Default discovery port.
pub const DEFAULT_DISCOVERY_PORT: u16 = 26823;

/// Default maximum payload size before a reliable send is chunked.
pub const DEFAULT_MTU: usize = 1200;

/// Peer id of the host itself.
pub const HOST_PEER_ID: u8 = 1;

/// Target id addressing every other peer.
pub const BROADCAST_PEER_ID: u8 = 0;

/// Maximum byte length of usernames and host names on the wire.
pub const MAX_NAME_LEN: usize = 100;
