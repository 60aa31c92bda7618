//! Wrap-around comparisons on 32-bit sequence numbers.
//!
//! Two sequence numbers are compared by the sign of their wrapping
//! difference, which is correct as long as they are less than `2^31` apart.
//! Windows here never come close to that.

/// `a < b` in sequence space.
#[inline]
pub fn seq_lt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

/// `a <= b` in sequence space.
#[inline]
pub fn seq_le(a: u32, b: u32) -> bool {
    a == b || seq_lt(a, b)
}

/// `a > b` in sequence space.
#[inline]
pub fn seq_gt(a: u32, b: u32) -> bool {
    seq_lt(b, a)
}

/// Number of sequence numbers from `from` up to `to` (`to - from`).
#[inline]
pub fn seq_distance(from: u32, to: u32) -> usize {
    to.wrapping_sub(from) as usize
}
