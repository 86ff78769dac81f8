//! Lock token formatting and the broker's wire-format byte reorder.
//!
//! The delivery tag on a peek-locked transfer is 16 raw bytes. We expose it to
//! the application as a canonical UUID string, and when asking the broker to
//! renew the lock we have to re-encode those same 16 bytes in the order the
//! broker actually expects, which is not the canonical byte order. This is a
//! hard-coded compatibility quirk of the broker's management protocol, not a
//! general-purpose UUID operation — keep it isolated here.

use std::fmt;

use uuid::Uuid;

/// The byte permutation the broker expects for a `renew-lock` request body.
/// `canonical[PERMUTATION[i]]` is byte `i` of the reordered token.
const PERMUTATION: [usize; 16] = [3, 2, 1, 0, 5, 4, 7, 6, 8, 9, 10, 11, 12, 13, 14, 15];

/// A 16-byte AMQP delivery tag, exposed to applications as a canonical UUID string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockToken(pub [u8; 16]);

impl LockToken {
    /// Builds a lock token from the raw bytes of a delivery tag.
    ///
    /// Returns `None` if the tag isn't exactly 16 bytes (e.g. the receiver is
    /// in receive-and-delete mode and the broker didn't hand out a lock token
    /// at all).
    pub fn from_delivery_tag(tag: &[u8]) -> Option<Self> {
        let bytes: [u8; 16] = tag.try_into().ok()?;
        Some(LockToken(bytes))
    }

    /// The canonical UUID string representation, e.g. `"3f2504e0-4f89-11d3-9a0c-0305e82c3301"`.
    pub fn to_uuid_string(self) -> String {
        Uuid::from_bytes(self.0).to_string()
    }

    /// The byte order the `com.microsoft:renew-lock` management request requires.
    pub fn to_reordered_bytes(self) -> [u8; 16] {
        let mut out = [0u8; 16];
        for (i, &src) in PERMUTATION.iter().enumerate() {
            out[i] = self.0[src];
        }
        out
    }
}

impl fmt::Display for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_uuid_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Canonical token `00010203-0405-0607-0809-0a0b0c0d0e0f`.
    const CANONICAL: [u8; 16] = [
        0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0a, 0x0b, 0x0c, 0x0d, 0x0e,
        0x0f,
    ];

    #[test]
    fn formats_as_canonical_uuid() {
        let token = LockToken(CANONICAL);
        assert_eq!(token.to_uuid_string(), "00010203-0405-0607-0809-0a0b0c0d0e0f");
    }

    #[test]
    fn reorders_bytes_per_permutation_table() {
        let token = LockToken(CANONICAL);
        let reordered = token.to_reordered_bytes();
        // [3,2,1,0, 5,4, 7,6, 8,9, 10,11,12,13,14,15]
        assert_eq!(
            reordered,
            [
                0x03, 0x02, 0x01, 0x00, 0x05, 0x04, 0x07, 0x06, 0x08, 0x09, 0x0a, 0x0b, 0x0c,
                0x0d, 0x0e, 0x0f,
            ]
        );
    }

    #[test]
    fn reorder_is_an_involution() {
        // PERMUTATION is four disjoint transpositions (0<->3, 1<->2, 4<->5,
        // 6<->7) plus fixed points, so applying it twice recovers the
        // original bytes.
        let token = LockToken(CANONICAL);
        let once = LockToken(token.to_reordered_bytes());
        let twice = once.to_reordered_bytes();
        assert_eq!(twice, CANONICAL);
    }

    #[test]
    fn from_delivery_tag_rejects_wrong_length() {
        assert!(LockToken::from_delivery_tag(&[0u8; 15]).is_none());
        assert!(LockToken::from_delivery_tag(&[0u8; 17]).is_none());
        assert!(LockToken::from_delivery_tag(&CANONICAL).is_some());
    }
}
