//! Binary wire codec
//!
//! ModNet packet layout (all integers big-endian):
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │ Bytes 0-3:  Checksum (CRC32 over salt ++ everything below)     │
//! │ Byte  4:    Kind byte                                          │
//! │             [7]   chunk flag                                   │
//! │             [6:0] packet kind                                  │
//! ├────────────────────────────────────────────────────────────────┤
//! │ Kind-specific fields:                                          │
//! │   sequenced kinds:  sequence:u16                               │
//! │   data kinds:       sender-or-target:u8, module:u32            │
//! │   chunked packets:  slice count:u16, slice index:u16           │
//! │   names:            length:u8, ASCII bytes (max 100)           │
//! │ Payload (data kinds): remaining bytes                          │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The checksum is computed last, over every byte after it, prefixed with
//! [`PROTOCOL_SALT`]. Decoding verifies it before reading any field and
//! fails closed on every structural error.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::packet::{
    ChunkInfo, DataPacket, ModuleId, Packet, PacketKind, PeerColor, CHUNK_FLAG,
};
use crate::{MAX_NAME_LEN, PROTOCOL_SALT};

/// Checksum field plus kind byte.
pub const MIN_PACKET_LEN: usize = 5;

/// CRC32 over the protocol salt followed by the packet body.
pub fn checksum(body: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&PROTOCOL_SALT.to_be_bytes());
    hasher.update(body);
    hasher.finalize()
}

/// Encode a packet, checksum first.
pub fn encode(packet: &Packet) -> Result<Bytes> {
    let mut body = BytesMut::with_capacity(64);

    match packet {
        Packet::ConnectRequest => {
            body.put_u8(PacketKind::ConnectRequest as u8);
        }
        Packet::ConnectChallenge { nonce } => {
            body.put_u8(PacketKind::ConnectChallenge as u8);
            body.put_u64(*nonce);
        }
        Packet::ChallengeAnswer { digest } => {
            body.put_u8(PacketKind::ChallengeAnswer as u8);
            body.put_slice(digest);
        }
        Packet::ConnectAccepted {
            peer_id,
            host_name,
            capacity,
        } => {
            body.put_u8(PacketKind::ConnectAccepted as u8);
            body.put_u8(*peer_id);
            put_name(&mut body, host_name)?;
            body.put_u8(*capacity);
        }
        Packet::ConnectDenied => {
            body.put_u8(PacketKind::ConnectDenied as u8);
        }
        Packet::ConnectClosed => {
            body.put_u8(PacketKind::ConnectClosed as u8);
        }
        Packet::PeerDisconnected { peer_id } => {
            body.put_u8(PacketKind::PeerDisconnected as u8);
            body.put_u8(*peer_id);
        }
        Packet::PeerInfo {
            sequence,
            peer_id,
            username,
            color,
        } => {
            body.put_u8(PacketKind::PeerInfo as u8);
            body.put_u16(*sequence);
            body.put_u8(*peer_id);
            put_name(&mut body, username)?;
            body.put_u8(color.r);
            body.put_u8(color.g);
            body.put_u8(color.b);
        }
        Packet::Ack {
            sequence,
            slice_index,
        } => {
            let mut kind = PacketKind::Ack as u8;
            if slice_index.is_some() {
                kind |= CHUNK_FLAG;
            }
            body.put_u8(kind);
            body.put_u16(*sequence);
            if let Some(index) = slice_index {
                body.put_u16(*index);
            }
        }
        Packet::HostPresence {
            host_name,
            capacity,
            occupancy,
        } => {
            body.put_u8(PacketKind::HostPresence as u8);
            put_name(&mut body, host_name)?;
            body.put_u8(*capacity);
            body.put_u8(*occupancy);
        }
        Packet::Data(data) => {
            let kind = data.reliability.kind();
            if let Some(chunk) = &data.chunk {
                if !kind.may_chunk() {
                    return Err(Error::UnexpectedChunkFlag(kind as u8));
                }
                if chunk.count == 0 || chunk.index >= chunk.count {
                    return Err(Error::InvalidChunk {
                        index: chunk.index,
                        count: chunk.count,
                    });
                }
            }
            let mut kind_byte = kind as u8;
            if data.chunk.is_some() {
                kind_byte |= CHUNK_FLAG;
            }
            body.put_u8(kind_byte);
            body.put_u16(data.sequence);
            body.put_u8(data.peer);
            body.put_u32(data.module.0);
            if let Some(chunk) = &data.chunk {
                body.put_u16(chunk.count);
                body.put_u16(chunk.index);
            }
            body.put_slice(&data.payload);
        }
    }

    let mut buf = BytesMut::with_capacity(4 + body.len());
    buf.put_u32(checksum(&body));
    buf.extend_from_slice(&body);
    Ok(buf.freeze())
}

/// Decode a datagram. Verifies the checksum before reading any field.
pub fn decode(bytes: &[u8]) -> Result<Packet> {
    if bytes.len() < MIN_PACKET_LEN {
        return Err(Error::BufferTooSmall {
            needed: MIN_PACKET_LEN,
            have: bytes.len(),
        });
    }

    let received = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    let body = &bytes[4..];
    let computed = checksum(body);
    if received != computed {
        return Err(Error::ChecksumMismatch {
            expected: computed,
            actual: received,
        });
    }

    let mut buf = body;
    let kind_byte = buf.get_u8();
    let chunked = kind_byte & CHUNK_FLAG != 0;
    let raw_kind = kind_byte & !CHUNK_FLAG;
    let kind = PacketKind::from_u8(raw_kind).ok_or(Error::UnknownKind(raw_kind))?;
    if chunked && !kind.may_chunk() {
        return Err(Error::UnexpectedChunkFlag(raw_kind));
    }

    match kind {
        PacketKind::ConnectRequest => Ok(Packet::ConnectRequest),
        PacketKind::ConnectChallenge => {
            need(&buf, 8)?;
            Ok(Packet::ConnectChallenge {
                nonce: buf.get_u64(),
            })
        }
        PacketKind::ChallengeAnswer => {
            need(&buf, 32)?;
            let mut digest = [0u8; 32];
            buf.copy_to_slice(&mut digest);
            Ok(Packet::ChallengeAnswer { digest })
        }
        PacketKind::ConnectAccepted => {
            need(&buf, 1)?;
            let peer_id = buf.get_u8();
            let host_name = get_name(&mut buf)?;
            need(&buf, 1)?;
            let capacity = buf.get_u8();
            Ok(Packet::ConnectAccepted {
                peer_id,
                host_name,
                capacity,
            })
        }
        PacketKind::ConnectDenied => Ok(Packet::ConnectDenied),
        PacketKind::ConnectClosed => Ok(Packet::ConnectClosed),
        PacketKind::PeerDisconnected => {
            need(&buf, 1)?;
            Ok(Packet::PeerDisconnected {
                peer_id: buf.get_u8(),
            })
        }
        PacketKind::PeerInfo => {
            need(&buf, 3)?;
            let sequence = buf.get_u16();
            let peer_id = buf.get_u8();
            let username = get_name(&mut buf)?;
            need(&buf, 3)?;
            let color = PeerColor {
                r: buf.get_u8(),
                g: buf.get_u8(),
                b: buf.get_u8(),
            };
            Ok(Packet::PeerInfo {
                sequence,
                peer_id,
                username,
                color,
            })
        }
        PacketKind::Ack => {
            need(&buf, 2)?;
            let sequence = buf.get_u16();
            let slice_index = if chunked {
                need(&buf, 2)?;
                Some(buf.get_u16())
            } else {
                None
            };
            Ok(Packet::Ack {
                sequence,
                slice_index,
            })
        }
        PacketKind::HostPresence => {
            let host_name = get_name(&mut buf)?;
            need(&buf, 2)?;
            let capacity = buf.get_u8();
            let occupancy = buf.get_u8();
            Ok(Packet::HostPresence {
                host_name,
                capacity,
                occupancy,
            })
        }
        PacketKind::ReliableOrderedData
        | PacketKind::ReliableUnorderedData
        | PacketKind::UnreliableOrderedData
        | PacketKind::UnreliableUnorderedData => {
            need(&buf, 7)?;
            let sequence = buf.get_u16();
            let peer = buf.get_u8();
            let module = ModuleId(buf.get_u32());
            let chunk = if chunked {
                need(&buf, 4)?;
                let count = buf.get_u16();
                let index = buf.get_u16();
                if count == 0 || index >= count {
                    return Err(Error::InvalidChunk { index, count });
                }
                Some(ChunkInfo { count, index })
            } else {
                None
            };
            let payload = Bytes::copy_from_slice(buf);
            Ok(Packet::Data(DataPacket {
                reliability: kind.reliability().ok_or(Error::UnknownKind(raw_kind))?,
                sequence,
                peer,
                module,
                chunk,
                payload,
            }))
        }
    }
}

fn need(buf: &&[u8], n: usize) -> Result<()> {
    if buf.remaining() < n {
        return Err(Error::BufferTooSmall {
            needed: n,
            have: buf.remaining(),
        });
    }
    Ok(())
}

fn put_name(buf: &mut BytesMut, name: &str) -> Result<()> {
    if name.len() > MAX_NAME_LEN {
        return Err(Error::NameTooLong(name.len()));
    }
    if !name.is_ascii() {
        return Err(Error::NameNotAscii);
    }
    buf.put_u8(name.len() as u8);
    buf.put_slice(name.as_bytes());
    Ok(())
}

fn get_name(buf: &mut &[u8]) -> Result<String> {
    need(buf, 1)?;
    let len = buf.get_u8() as usize;
    if len > MAX_NAME_LEN {
        return Err(Error::NameTooLong(len));
    }
    need(buf, len)?;
    let raw = &buf[..len];
    if !raw.is_ascii() {
        return Err(Error::NameNotAscii);
    }
    let name = String::from_utf8(raw.to_vec()).map_err(|_| Error::NameNotAscii)?;
    buf.advance(len);
    Ok(name)
}
