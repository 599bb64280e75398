//! Bit-prefix intervals over node identifiers.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::NodeId;

/// A prefix interval of node ids: all ids sharing the first `mask` bits
/// of `from`.
///
/// `from` must have every bit at position `mask` or beyond cleared. The
/// universal range has `mask == 0` and contains every id.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeIdRange {
    from: NodeId,
    mask: u8,
}

impl NodeIdRange {
    /// The range containing every node id.
    pub const UNIVERSAL: Self = Self {
        from: NodeId::ZERO,
        mask: 0,
    };

    /// Creates a range from a starting id and a prefix length.
    ///
    /// Debug-asserts the alignment invariant; use [`Self::is_aligned`]
    /// to validate untrusted input first.
    #[must_use]
    pub fn new(from: NodeId, mask: u8) -> Self {
        debug_assert!(mask <= NodeId::BITS);
        debug_assert!(from.has_mask(mask));
        Self { from, mask }
    }

    /// Returns true if `(from, mask)` is a well-formed range.
    #[must_use]
    pub fn is_aligned(from: &NodeId, mask: u8) -> bool {
        mask <= NodeId::BITS && from.has_mask(mask)
    }

    /// The first id of the range.
    #[inline]
    #[must_use]
    pub fn from(&self) -> &NodeId {
        &self.from
    }

    /// The number of leading bits that define the prefix.
    #[inline]
    #[must_use]
    pub fn mask(&self) -> u8 {
        self.mask
    }

    /// Returns true if `id` shares the first `mask` bits of `from`.
    #[must_use]
    pub fn contains(&self, id: &NodeId) -> bool {
        let full_bytes = (self.mask / 8) as usize;
        let from = self.from.as_bytes();
        let them = id.as_bytes();
        if from[..full_bytes] != them[..full_bytes] {
            return false;
        }
        let rest = self.mask % 8;
        if rest > 0 {
            let high = !(0xFFu8 >> rest);
            if from[full_bytes] & high != them[full_bytes] & high {
                return false;
            }
        }
        true
    }

    /// Returns true if `other` is wholly contained in this range.
    #[must_use]
    pub fn contains_range(&self, other: &NodeIdRange) -> bool {
        self.mask <= other.mask && self.contains(&other.from)
    }

    /// Splits the range into its two children, appending 0 and 1 at bit
    /// position `mask`.
    ///
    /// # Panics
    ///
    /// Panics if the range is already a single id (`mask == 160`).
    #[must_use]
    pub fn split(&self) -> (NodeIdRange, NodeIdRange) {
        assert!(self.mask < NodeId::BITS, "cannot split a single-id range");

        let left = NodeIdRange {
            from: self.from,
            mask: self.mask + 1,
        };
        let mut right_from = self.from;
        right_from.set_bit_at(self.mask, true);
        let right = NodeIdRange {
            from: right_from,
            mask: self.mask + 1,
        };
        (left, right)
    }
}

impl Default for NodeIdRange {
    fn default() -> Self {
        Self::UNIVERSAL
    }
}

impl fmt::Debug for NodeIdRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeIdRange({}/{})", self.from.to_hex(), self.mask)
    }
}

impl fmt::Display for NodeIdRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.from.to_hex(), self.mask)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_universal_contains_everything() {
        let mut id = NodeId::ZERO;
        id.set_bit_at(0, true);
        id.mark_set();
        assert!(NodeIdRange::UNIVERSAL.contains(&id));
        assert!(NodeIdRange::UNIVERSAL.contains(&NodeId::ZERO));
    }

    #[test]
    fn test_split_children() {
        let (left, right) = NodeIdRange::UNIVERSAL.split();
        assert_eq!(left.mask(), 1);
        assert_eq!(right.mask(), 1);
        assert_eq!(*left.from(), NodeId::ZERO);
        assert!(right.from().bit_at(0));

        let mut in_right = NodeId::ZERO;
        in_right.set_bit_at(0, true);
        in_right.set_bit_at(100, true);
        assert!(right.contains(&in_right));
        assert!(!left.contains(&in_right));

        let mut in_left = NodeId::ZERO;
        in_left.set_bit_at(1, true);
        assert!(left.contains(&in_left));
        assert!(!right.contains(&in_left));
    }

    #[test]
    fn test_split_partitions_parent() {
        let (left, _) = NodeIdRange::UNIVERSAL.split();
        let (ll, lr) = left.split();
        assert!(left.contains_range(&ll));
        assert!(left.contains_range(&lr));
        assert!(!ll.contains_range(&left));

        // siblings are disjoint
        assert!(!ll.contains(lr.from()));
        assert!(!lr.contains(ll.from()));
    }

    #[test]
    fn test_contains_range_needs_wider_mask() {
        let (left, _) = NodeIdRange::UNIVERSAL.split();
        assert!(NodeIdRange::UNIVERSAL.contains_range(&left));
        assert!(!left.contains_range(&NodeIdRange::UNIVERSAL));
        assert!(left.contains_range(&left));
    }

    #[test]
    fn test_contains_partial_byte() {
        // a /11 range: prefix crosses a byte boundary
        let mut from = NodeId::ZERO;
        from.set_bit_at(1, true);
        from.set_bit_at(9, true);
        let range = NodeIdRange::new(from, 11);

        let mut inside = from;
        inside.set_bit_at(12, true);
        inside.mark_set();
        assert!(range.contains(&inside));

        let mut outside = from;
        outside.set_bit_at(10, true);
        assert!(!range.contains(&outside));
    }

    #[test]
    fn test_alignment_check() {
        let mut from = NodeId::ZERO;
        from.set_bit_at(5, true);
        assert!(NodeIdRange::is_aligned(&from, 6));
        assert!(!NodeIdRange::is_aligned(&from, 5));
        assert!(!NodeIdRange::is_aligned(&from, 200));
    }
}
