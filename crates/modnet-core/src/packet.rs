//! Packet model
//!
//! One [`Packet`] variant per wire kind. The kind byte reserves bit 7 as the
//! "payload is chunked" flag; the remaining bits are the [`PacketKind`]
//! discriminant.

use bytes::Bytes;

/// Identifies a connected endpoint. 1 is the host, 0 addresses every other
/// peer, admitted peers start at 2.
pub type PeerId = u8;

/// Bit 7 of the kind byte: the packet carries a chunk header.
pub const CHUNK_FLAG: u8 = 1 << 7;

/// Module identifier carried by every data packet.
///
/// Deterministic: derive it from a stable module name with [`ModuleId::from_name`]
/// or supply a precomputed constant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleId(pub u32);

impl ModuleId {
    /// Derive an id from a module name (CRC32 of the name bytes).
    pub fn from_name(name: &str) -> Self {
        Self(crc32fast::hash(name.as_bytes()))
    }
}

impl std::fmt::Display for ModuleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

/// RGB display color attached to a peer's identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerColor {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Default for PeerColor {
    fn default() -> Self {
        Self {
            r: 255,
            g: 255,
            b: 255,
        }
    }
}

/// Delivery class of a data packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reliability {
    ReliableOrdered,
    ReliableUnordered,
    UnreliableOrdered,
    UnreliableUnordered,
}

impl Reliability {
    /// Acked, buffered, retransmitted.
    pub fn is_reliable(self) -> bool {
        matches!(self, Self::ReliableOrdered | Self::ReliableUnordered)
    }

    /// Subject to the staleness/ordering gate.
    pub fn is_ordered(self) -> bool {
        matches!(self, Self::ReliableOrdered | Self::UnreliableOrdered)
    }

    pub(crate) fn kind(self) -> PacketKind {
        match self {
            Self::ReliableOrdered => PacketKind::ReliableOrderedData,
            Self::ReliableUnordered => PacketKind::ReliableUnorderedData,
            Self::UnreliableOrdered => PacketKind::UnreliableOrderedData,
            Self::UnreliableUnordered => PacketKind::UnreliableUnorderedData,
        }
    }
}

/// Wire packet kinds (the kind byte without the chunk flag).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketKind {
    ConnectRequest = 0,
    ConnectChallenge = 1,
    ChallengeAnswer = 2,
    ConnectAccepted = 3,
    ConnectDenied = 4,
    ConnectClosed = 5,
    PeerDisconnected = 6,
    PeerInfo = 7,
    Ack = 8,
    HostPresence = 9,
    ReliableOrderedData = 10,
    ReliableUnorderedData = 11,
    UnreliableOrderedData = 12,
    UnreliableUnorderedData = 13,
}

impl PacketKind {
    pub fn from_u8(byte: u8) -> Option<Self> {
        Some(match byte {
            0 => Self::ConnectRequest,
            1 => Self::ConnectChallenge,
            2 => Self::ChallengeAnswer,
            3 => Self::ConnectAccepted,
            4 => Self::ConnectDenied,
            5 => Self::ConnectClosed,
            6 => Self::PeerDisconnected,
            7 => Self::PeerInfo,
            8 => Self::Ack,
            9 => Self::HostPresence,
            10 => Self::ReliableOrderedData,
            11 => Self::ReliableUnorderedData,
            12 => Self::UnreliableOrderedData,
            13 => Self::UnreliableUnorderedData,
            _ => return None,
        })
    }

    pub fn is_data(self) -> bool {
        self.reliability().is_some()
    }

    /// Kinds that may legally carry the chunk flag.
    pub fn may_chunk(self) -> bool {
        matches!(
            self,
            Self::Ack | Self::ReliableOrderedData | Self::ReliableUnorderedData
        )
    }

    pub fn reliability(self) -> Option<Reliability> {
        Some(match self {
            Self::ReliableOrderedData => Reliability::ReliableOrdered,
            Self::ReliableUnorderedData => Reliability::ReliableUnordered,
            Self::UnreliableOrderedData => Reliability::UnreliableOrdered,
            Self::UnreliableUnorderedData => Reliability::UnreliableUnordered,
            _ => return None,
        })
    }
}

/// Chunk header of a sliced reliable payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkInfo {
    /// Total number of slices in the logical payload.
    pub count: u16,
    /// 0-based index of this slice.
    pub index: u16,
}

/// A data packet (any of the four delivery classes).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPacket {
    pub reliability: Reliability,
    /// Channel sequence number, assigned at serialization time by the sender.
    pub sequence: u16,
    /// Sender id on receive; target id on send (0 = all other peers).
    pub peer: PeerId,
    pub module: ModuleId,
    pub chunk: Option<ChunkInfo>,
    pub payload: Bytes,
}

/// A decoded ModNet packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    ConnectRequest,
    ConnectChallenge {
        nonce: u64,
    },
    ChallengeAnswer {
        digest: [u8; 32],
    },
    ConnectAccepted {
        peer_id: PeerId,
        host_name: String,
        capacity: u8,
    },
    ConnectDenied,
    ConnectClosed,
    PeerDisconnected {
        peer_id: PeerId,
    },
    /// Identity broadcast for a roster entry. Rides the reliable-ordered
    /// channel like data does.
    PeerInfo {
        sequence: u16,
        peer_id: PeerId,
        username: String,
        color: PeerColor,
    },
    Ack {
        sequence: u16,
        /// Present when acking a single slice of a chunked send.
        slice_index: Option<u16>,
    },
    /// Discovery heartbeat broadcast by an open host.
    HostPresence {
        host_name: String,
        capacity: u8,
        occupancy: u8,
    },
    Data(DataPacket),
}

impl Packet {
    pub fn kind(&self) -> PacketKind {
        match self {
            Packet::ConnectRequest => PacketKind::ConnectRequest,
            Packet::ConnectChallenge { .. } => PacketKind::ConnectChallenge,
            Packet::ChallengeAnswer { .. } => PacketKind::ChallengeAnswer,
            Packet::ConnectAccepted { .. } => PacketKind::ConnectAccepted,
            Packet::ConnectDenied => PacketKind::ConnectDenied,
            Packet::ConnectClosed => PacketKind::ConnectClosed,
            Packet::PeerDisconnected { .. } => PacketKind::PeerDisconnected,
            Packet::PeerInfo { .. } => PacketKind::PeerInfo,
            Packet::Ack { .. } => PacketKind::Ack,
            Packet::HostPresence { .. } => PacketKind::HostPresence,
            Packet::Data(data) => data.reliability.kind(),
        }
    }
}
