//! Error types for ModNet core

use thiserror::Error;

/// Result type alias for codec operations
pub type Result<T> = std::result::Result<T, Error>;

/// Decode/encode failures. Every decode-side variant means "drop the packet";
/// encode-side variants are surfaced to the caller before anything hits the
/// wire.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum Error {
    /// Checksum did not match the packet contents
    #[error("checksum mismatch: expected 0x{expected:08x}, got 0x{actual:08x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    /// Packet shorter than its fixed header
    #[error("buffer too small: need {needed} bytes, have {have}")]
    BufferTooSmall { needed: usize, have: usize },

    /// Unknown packet kind byte
    #[error("unknown packet kind: 0x{0:02x}")]
    UnknownKind(u8),

    /// Chunk flag set on a kind that cannot be chunked
    #[error("kind 0x{0:02x} cannot carry a chunk header")]
    UnexpectedChunkFlag(u8),

    /// String field longer than the protocol allows
    #[error("name too long: {0} bytes (max {max})", max = crate::MAX_NAME_LEN)]
    NameTooLong(usize),

    /// String field contains non-ASCII bytes
    #[error("name is not ASCII")]
    NameNotAscii,

    /// Declared slice count of zero or slice index out of range
    #[error("invalid chunk header: index {index} of {count}")]
    InvalidChunk { index: u16, count: u16 },
}
