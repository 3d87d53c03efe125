//! Serial number arithmetic for 32-bit wrapping sequence numbers.
//!
//! Delivery ids, transfer ids and delivery counts wrap at 2^32 and are
//! compared with RFC 1982 semantics over a 2^31 window.

use std::cmp::Ordering;
use std::fmt;

/// A 32-bit serial number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SequenceNo(pub u32);

impl SequenceNo {
    #[inline]
    pub fn new(value: u32) -> Self {
        Self(value)
    }

    #[inline]
    pub fn get(self) -> u32 {
        self.0
    }

    /// Successor, wrapping at 2^32.
    #[inline]
    pub fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }

    #[inline]
    pub fn add(self, n: u32) -> Self {
        Self(self.0.wrapping_add(n))
    }

    /// Post-increment: returns the current value and advances.
    #[inline]
    pub fn take_next(&mut self) -> Self {
        let current = *self;
        *self = self.next();
        current
    }

    /// Number of steps from `earlier` to `self` (wrapping).
    #[inline]
    pub fn distance_from(self, earlier: SequenceNo) -> u32 {
        self.0.wrapping_sub(earlier.0)
    }

    /// Serial comparison. `None` when the two values are exactly 2^31
    /// apart, where the ordering is undefined.
    pub fn serial_cmp(self, other: SequenceNo) -> Option<Ordering> {
        let diff = self.0.wrapping_sub(other.0);
        match diff {
            0 => Some(Ordering::Equal),
            0x8000_0000 => None,
            d if d < 0x8000_0000 => Some(Ordering::Greater),
            _ => Some(Ordering::Less),
        }
    }

    #[inline]
    pub fn is_after(self, other: SequenceNo) -> bool {
        self.serial_cmp(other) == Some(Ordering::Greater)
    }

    /// True if `self` lies in the inclusive serial range `[first, last]`.
    pub fn in_range(self, first: SequenceNo, last: SequenceNo) -> bool {
        self.distance_from(first) <= last.distance_from(first)
    }
}

impl From<u32> for SequenceNo {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl fmt::Display for SequenceNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
