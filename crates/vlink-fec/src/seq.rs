//! # 16-bit Sequence Arithmetic
//!
//! RTP sequence numbers wrap at 65536. Every comparison in this crate goes
//! through these helpers so that ordering stays correct across the
//! 65535 → 0 boundary.

use std::ops::RangeInclusive;

/// Number of distinct RTP sequence numbers.
pub const SEQ_SPACE: usize = 1 << 16;

/// Forward distance from `from` to `to`, modulo 2^16.
#[inline]
pub fn seq_distance(from: u16, to: u16) -> u16 {
    to.wrapping_sub(from)
}

/// Whether `a` comes after `b` in modular order (half-space rule).
#[inline]
pub fn seq_is_newer(a: u16, b: u16) -> bool {
    a != b && seq_distance(b, a) < 0x8000
}

// ─── SeqRange ───────────────────────────────────────────────────────────────

/// A window of `span` consecutive sequence numbers starting at `base`.
///
/// When `base + span` exceeds 65535 the window covers two contiguous
/// segments: `base..=65535` and `0..=(base + span - 65537)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeqRange {
    base: u16,
    span: u16,
}

impl SeqRange {
    /// Create a window. `span` must be non-zero.
    pub fn new(base: u16, span: u16) -> Self {
        debug_assert!(span > 0, "empty sequence window");
        SeqRange { base, span }
    }

    pub fn base(&self) -> u16 {
        self.base
    }

    pub fn span(&self) -> u16 {
        self.span
    }

    /// Last sequence number covered by the window.
    pub fn last(&self) -> u16 {
        self.base.wrapping_add(self.span - 1)
    }

    /// Offset of `seq` from the window base, if covered.
    #[inline]
    pub fn offset_of(&self, seq: u16) -> Option<u16> {
        let n = seq_distance(self.base, seq);
        (n < self.span).then_some(n)
    }

    #[inline]
    pub fn contains(&self, seq: u16) -> bool {
        self.offset_of(seq).is_some()
    }

    /// Sequence number at `offset` from the base.
    #[inline]
    pub fn seq_at(&self, offset: u16) -> u16 {
        self.base.wrapping_add(offset)
    }

    /// Whether the window straddles the 65535 → 0 boundary.
    pub fn wraps(&self) -> bool {
        self.base as u32 + self.span as u32 > SEQ_SPACE as u32
    }

    /// The one or two contiguous segments the window covers.
    pub fn segments(&self) -> (RangeInclusive<u16>, Option<RangeInclusive<u16>>) {
        if self.wraps() {
            (self.base..=u16::MAX, Some(0..=self.last()))
        } else {
            (self.base..=self.last(), None)
        }
    }
}
