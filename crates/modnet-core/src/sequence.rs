//! Wrap-aware 16-bit sequence arithmetic
//!
//! These two predicates are the only ordering primitives in the protocol.
//! Reliable ordering correctness depends on their exact behavior, including
//! the half-wrap boundary: a packet exactly 32768 ahead still counts as
//! newer; one 32769 ahead has wrapped behind.

const HALF_U16: u16 = u16::MAX / 2 + 1; // 32768

/// Whether `sequence` is ahead of `remote` on the u16 ring.
///
/// True iff `sequence` leads `remote` by at most half the sequence space.
/// `is_newer(a, a)` is false. At the exact half-wrap distance the leading
/// side wins: `is_newer(b + 32768, b)` is true, `is_newer(b, b + 32768)`
/// is false.
#[inline]
pub fn is_newer(sequence: u16, remote: u16) -> bool {
    (sequence > remote && sequence - remote <= HALF_U16)
        || (sequence < remote && remote - sequence > HALF_U16)
}

/// Whether `sequence` is the immediate successor of `remote` (mod 2^16).
#[inline]
pub fn is_next(sequence: u16, remote: u16) -> bool {
    sequence == remote.wrapping_add(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_is_never_newer() {
        for s in [0u16, 1, 255, 32767, 32768, 65535] {
            assert!(!is_newer(s, s));
        }
    }

    #[test]
    fn simple_ordering() {
        assert!(is_newer(2, 1));
        assert!(is_newer(1000, 1));
        assert!(!is_newer(1, 2));
        assert!(!is_newer(1, 1000));
    }

    #[test]
    fn wraparound_ordering() {
        // 0 follows 65535
        assert!(is_newer(0, u16::MAX));
        assert!(!is_newer(u16::MAX, 0));
        assert!(is_newer(5, 65530));
        assert!(!is_newer(65530, 5));
    }

    #[test]
    fn half_wrap_boundary() {
        // Exactly half the ring ahead counts as newer; the reverse does not.
        assert!(is_newer(32768, 0));
        assert!(!is_newer(0, 32768));
        assert!(is_newer(33000, 232));
        assert!(!is_newer(232, 33000));
        // One past half has wrapped behind.
        assert!(!is_newer(32769, 0));
        assert!(is_newer(0, 32769));
    }

    #[test]
    fn antisymmetric() {
        // For a != b exactly one direction is newer. At distance 32768 the
        // tie is broken by raw magnitude (the numerically greater value is
        // the newer one), which the boundary test above pins down.
        for delta in [1u16, 2, 100, 32767, 32768, 32769, 65535] {
            for base in [0u16, 1, 17, 32768, 65534] {
                let other = base.wrapping_add(delta);
                assert_ne!(
                    is_newer(other, base),
                    is_newer(base, other),
                    "delta {delta} base {base}"
                );
            }
        }
    }

    #[test]
    fn next_sequence() {
        assert!(is_next(1, 0));
        assert!(is_next(0, u16::MAX));
        assert!(!is_next(2, 0));
        assert!(!is_next(0, 0));
        assert!(!is_next(u16::MAX, 0));
    }
}
