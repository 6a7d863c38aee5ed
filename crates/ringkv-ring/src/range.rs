//! Arithmetic over arcs of the circular hash space.

use std::fmt;

/// An inclusive arc `[start, end]` of the hash space `[0, max]`.
///
/// When `start > end` the arc wraps: it runs from `start` up to `max` and
/// continues from `0` up to `end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RingRange {
    start: u128,
    end: u128,
    max: u128,
}

impl RingRange {
    /// Create a range. Both bounds are clamped to `max`.
    pub fn new(start: u128, end: u128, max: u128) -> Self {
        debug_assert!(start <= max && end <= max, "range bounds exceed hash space");
        Self {
            start: start.min(max),
            end: end.min(max),
            max,
        }
    }

    /// The whole hash space as a single range
    pub fn full(max: u128) -> Self {
        Self::new(0, max, max)
    }

    /// First position, inclusive
    pub fn start(&self) -> u128 {
        self.start
    }

    /// Last position, inclusive
    pub fn end(&self) -> u128 {
        self.end
    }

    /// Largest position of the underlying hash space
    pub fn max(&self) -> u128 {
        self.max
    }

    /// Whether the range crosses `max` back to zero
    pub fn wraps(&self) -> bool {
        self.start > self.end
    }

    /// Number of positions covered. Saturates at `u128::MAX` for a full
    /// 128-bit space.
    pub fn len(&self) -> u128 {
        self.segments()
            .iter()
            .fold(0u128, |acc, (lo, hi)| acc.saturating_add((hi - lo).saturating_add(1)))
    }

    /// A range always covers at least one position.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Whether `value` lies on this arc
    pub fn contains(&self, value: u128) -> bool {
        if value > self.max {
            return false;
        }
        if self.wraps() {
            value >= self.start || value <= self.end
        } else {
            value >= self.start && value <= self.end
        }
    }

    /// Whether every position of `other` lies on this arc
    pub fn contains_range(&self, other: &RingRange) -> bool {
        other.difference(self).is_empty()
    }

    /// Whether the two arcs share at least one position
    pub fn overlaps(&self, other: &RingRange) -> bool {
        let rest = self.difference(other);
        rest.len() != 1 || rest[0] != *self
    }

    /// Positions of `self` not covered by `other`.
    ///
    /// The result is disjoint and ordered clockwise starting at `self.start`.
    /// Pieces that meet across the `max`/`0` boundary are reported as one
    /// wrapping range.
    pub fn difference(&self, other: &RingRange) -> Vec<RingRange> {
        let mut cut = other.segments();
        cut.sort_unstable();

        let mut pieces: Vec<(u128, u128)> = Vec::new();
        for (lo, hi) in self.segments() {
            subtract_segment(lo, hi, &cut, &mut pieces);
        }

        let mut result: Vec<RingRange> = Vec::with_capacity(pieces.len());
        let mut iter = pieces.into_iter().peekable();
        while let Some((lo, hi)) = iter.next() {
            if hi == self.max && lo != 0 {
                if let Some(&(0, next_hi)) = iter.peek() {
                    iter.next();
                    result.push(RingRange::new(lo, next_hi, self.max));
                    continue;
                }
            }
            result.push(RingRange::new(lo, hi, self.max));
        }
        result
    }

    /// The arc split into non-wrapping `(lo, hi)` segments, clockwise from `start`
    pub fn segments(&self) -> Vec<(u128, u128)> {
        if self.wraps() {
            vec![(self.start, self.max), (0, self.end)]
        } else {
            vec![(self.start, self.end)]
        }
    }
}

fn subtract_segment(lo: u128, hi: u128, cut: &[(u128, u128)], out: &mut Vec<(u128, u128)>) {
    let mut cursor = lo;
    for &(cut_lo, cut_hi) in cut {
        if cut_hi < cursor || cut_lo > hi {
            continue;
        }
        if cut_lo > cursor {
            out.push((cursor, cut_lo - 1));
        }
        match cut_hi.checked_add(1) {
            Some(next) if next <= hi => cursor = next,
            _ => return,
        }
    }
    out.push((cursor, hi));
}

impl fmt::Display for RingRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:x}, {:x}]", self.start, self.end)
    }
}
