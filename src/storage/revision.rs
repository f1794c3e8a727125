//! Revision numbers and their on-disk encoding.
//!
//! Every mutation is identified by a `(main, sub)` pair. `main` advances once per
//! committed write batch, `sub` is the position of the change inside that batch.
//!
//! In the `key` bucket a revision is stored as 17 bytes:
//! `{main_be_bytes}_{sub_be_bytes}`, optionally followed by a single `t` marking a
//! tombstone. Big-endian keeps the byte order equal to the revision order, so a
//! range scan over the bucket walks history oldest-first.

use std::fmt;

/// Length of an encoded revision without the tombstone marker.
pub const REV_BYTES_LEN: usize = 8 + 1 + 8;

/// Length of an encoded tombstone revision.
pub const MARKED_REV_BYTES_LEN: usize = REV_BYTES_LEN + 1;

const SEPARATOR: u8 = b'_';
const TOMBSTONE_MARK: u8 = b't';

/// Represents a specific revision (main, sub).
///
/// Ordering is lexicographic on `(main, sub)`, which the derived `Ord` gives us
/// through field declaration order.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Revision {
    /// Main revision number (global counter)
    pub main: i64,
    /// Sub-revision (operation index within a main revision)
    pub sub: i64,
}

impl Revision {
    pub const fn new(main: i64, sub: i64) -> Self {
        Self { main, sub }
    }

    /// The smallest revision with a main component of `main`.
    pub const fn first_of(main: i64) -> Self {
        Self { main, sub: 0 }
    }

    /// Encodes this revision as a `key` bucket key.
    pub fn to_bytes(self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(MARKED_REV_BYTES_LEN);
        buf.extend_from_slice(&self.main.to_be_bytes());
        buf.push(SEPARATOR);
        buf.extend_from_slice(&self.sub.to_be_bytes());
        buf
    }

    /// Encodes this revision with the tombstone marker appended.
    pub fn to_tombstone_bytes(self) -> Vec<u8> {
        let mut buf = self.to_bytes();
        buf.push(TOMBSTONE_MARK);
        buf
    }

    /// Decodes a revision from a `key` bucket key, ignoring any tombstone marker.
    ///
    /// Returns `None` if the slice is not an encoded revision.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != REV_BYTES_LEN && bytes.len() != MARKED_REV_BYTES_LEN {
            return None;
        }
        if bytes[8] != SEPARATOR {
            return None;
        }
        let main = i64::from_be_bytes(bytes[0..8].try_into().ok()?);
        let sub = i64::from_be_bytes(bytes[9..17].try_into().ok()?);
        Some(Self { main, sub })
    }

    /// The next revision in `(main, sub)` order. Used as an exclusive upper
    /// bound when scanning for exactly one revision (tombstoned or not).
    pub fn successor(self) -> Self {
        Self {
            main: self.main,
            sub: self.sub + 1,
        }
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.main, self.sub)
    }
}

/// Whether an encoded revision key carries the tombstone marker.
pub fn is_tombstone(bytes: &[u8]) -> bool {
    bytes.len() == MARKED_REV_BYTES_LEN && bytes[REV_BYTES_LEN] == TOMBSTONE_MARK
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordering_is_lexicographic() {
        assert!(Revision::new(1, 5) < Revision::new(2, 0));
        assert!(Revision::new(2, 0) < Revision::new(2, 1));
        assert_eq!(Revision::new(3, 3), Revision::new(3, 3));
    }

    #[test]
    fn test_byte_order_matches_revision_order() {
        let a = Revision::new(2, 9).to_bytes();
        let b = Revision::new(3, 0).to_bytes();
        let c = Revision::new(3, 0).to_tombstone_bytes();
        let d = Revision::new(3, 1).to_bytes();
        assert!(a < b);
        assert!(b < c);
        assert!(c < d);
    }

    #[test]
    fn test_tombstone_marker() {
        let rev = Revision::new(7, 2);
        let live = rev.to_bytes();
        let dead = rev.to_tombstone_bytes();

        assert!(!is_tombstone(&live));
        assert!(is_tombstone(&dead));
        assert_eq!(Revision::from_bytes(&live), Some(rev));
        assert_eq!(Revision::from_bytes(&dead), Some(rev));
    }

    #[test]
    fn test_from_bytes_rejects_garbage() {
        assert_eq!(Revision::from_bytes(b"short"), None);
        let mut bad = Revision::new(1, 1).to_bytes();
        bad[8] = b'x';
        assert_eq!(Revision::from_bytes(&bad), None);
    }
}
