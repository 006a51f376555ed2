//! Challenge/response handshake primitives
//!
//! The host hands a connecting address a random nonce and remembers only its
//! digest; the client proves it saw the challenge by sending the same digest
//! back. Keeps spoofed source addresses out of the roster without any key
//! material.

use sha2::{Digest, Sha256};

/// Digest the host stores and the client answers with.
pub(crate) fn challenge_digest(nonce: u64) -> [u8; 32] {
    Sha256::digest(nonce.to_be_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_matches_itself_only() {
        assert_eq!(challenge_digest(42), challenge_digest(42));
        assert_ne!(challenge_digest(42), challenge_digest(43));
    }
}
