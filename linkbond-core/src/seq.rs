//! Shared sequence and message numbers.
//!
//! Every outbound message gets one sequence number from the group, carried
//! identically on every member link that transmits it. The space is 31-bit
//! and wraps, so all comparisons go through wrap-aware distance arithmetic
//! rather than plain integer ordering.

use std::fmt;

use rand::Rng;

/// Largest valid sequence number. The space is `0..=SEQ_MAX` and wraps.
pub const SEQ_MAX: i32 = 0x7FFF_FFFF;

/// Distances at or above this are treated as wrap-around.
const SEQ_THRESHOLD: i32 = 0x3FFF_FFFF;

/// Largest valid message number (26-bit space).
pub const MSG_MAX: i32 = 0x03FF_FFFF;

const MSG_THRESHOLD: i32 = MSG_MAX / 2;

/// A shared sequence number, or the `NONE` sentinel before assignment.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SeqNo(i32);

impl SeqNo {
    /// Sentinel: no sequence assigned yet.
    pub const NONE: SeqNo = SeqNo(-1);

    /// Wrap a raw value into the valid space. Negative input maps to `NONE`.
    pub fn new(raw: i32) -> SeqNo {
        if raw < 0 {
            SeqNo::NONE
        } else {
            SeqNo(raw & SEQ_MAX)
        }
    }

    pub fn raw(self) -> i32 {
        self.0
    }

    pub fn is_none(self) -> bool {
        self.0 < 0
    }

    /// Next sequence number, wrapping at the end of the space.
    pub fn next(self) -> SeqNo {
        debug_assert!(!self.is_none());
        SeqNo((self.0 + 1) & SEQ_MAX)
    }

    /// Sequence number `n` steps ahead, wrapping.
    pub fn advance(self, n: i32) -> SeqNo {
        debug_assert!(!self.is_none() && n >= 0);
        SeqNo((self.0.wrapping_add(n)) & SEQ_MAX)
    }

    /// Signed wrap-aware distance from `self` to `other`.
    ///
    /// Positive means `other` is ahead of `self`. Both numbers must be
    /// within half the space of each other for the sign to be meaningful.
    pub fn offset_to(self, other: SeqNo) -> i32 {
        debug_assert!(!self.is_none() && !other.is_none());
        let diff = other.0 - self.0;
        if diff.abs() < SEQ_THRESHOLD {
            diff
        } else if diff < 0 {
            diff + SEQ_MAX + 1
        } else {
            diff - SEQ_MAX - 1
        }
    }

    /// Wrap-aware `self < other`. `NONE` sorts before everything.
    pub fn precedes(self, other: SeqNo) -> bool {
        if self.is_none() {
            return !other.is_none();
        }
        if other.is_none() {
            return false;
        }
        self.offset_to(other) > 0
    }
}

impl fmt::Debug for SeqNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "SeqNo(NONE)")
        } else {
            write!(f, "SeqNo({})", self.0)
        }
    }
}

impl fmt::Display for SeqNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "%NONE")
        } else {
            write!(f, "%{}", self.0)
        }
    }
}

/// A shared message number (26-bit space, wrapping).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MsgNo(i32);

impl MsgNo {
    /// Sentinel: no message assigned yet.
    pub const NONE: MsgNo = MsgNo(-1);

    pub fn new(raw: i32) -> MsgNo {
        if raw < 0 {
            MsgNo::NONE
        } else {
            MsgNo(raw & MSG_MAX)
        }
    }

    pub fn raw(self) -> i32 {
        self.0
    }

    pub fn is_none(self) -> bool {
        self.0 < 0
    }

    pub fn next(self) -> MsgNo {
        debug_assert!(!self.is_none());
        MsgNo((self.0 + 1) & MSG_MAX)
    }

    pub fn offset_to(self, other: MsgNo) -> i32 {
        debug_assert!(!self.is_none() && !other.is_none());
        let diff = other.0 - self.0;
        if diff.abs() < MSG_THRESHOLD {
            diff
        } else if diff < 0 {
            diff + MSG_MAX + 1
        } else {
            diff - MSG_MAX - 1
        }
    }

    /// Wrap-aware `self < other`. `NONE` sorts before everything.
    pub fn precedes(self, other: MsgNo) -> bool {
        if self.is_none() {
            return !other.is_none();
        }
        if other.is_none() {
            return false;
        }
        self.offset_to(other) > 0
    }
}

impl fmt::Debug for MsgNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "MsgNo(NONE)")
        } else {
            write!(f, "MsgNo({})", self.0)
        }
    }
}

/// Generate a fresh initial sequence number.
///
/// Used when a group starts a new numbering space: at construction and
/// whenever the last member is removed.
pub fn generate_isn() -> SeqNo {
    SeqNo(rand::thread_rng().gen_range(0..=SEQ_MAX))
}
