//! Range and slice payloads.

use serde::{Deserialize, Serialize};

use crate::value::Value;

/// A guest `range(start, stop, step)` with a non-zero step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct Range {
    pub start: i64,
    pub stop: i64,
    pub step: i64,
}

impl Range {
    /// Number of elements the range produces.
    #[must_use]
    pub fn len(&self) -> usize {
        let (lo, hi, step) = if self.step > 0 {
            (self.start, self.stop, self.step)
        } else {
            (self.stop, self.start, -self.step)
        };
        if hi <= lo {
            return 0;
        }
        let span = hi.wrapping_sub(lo) as u64;
        usize::try_from(span.div_ceil(step as u64)).unwrap_or(usize::MAX)
    }

    /// Element at `index`, when in bounds.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<i64> {
        if index >= self.len() {
            return None;
        }
        Some(self.start + self.step * i64::try_from(index).ok()?)
    }

    /// Whether `value` is a member of the range.
    #[must_use]
    pub fn contains(&self, value: i64) -> bool {
        if self.step > 0 {
            value >= self.start && value < self.stop && (value - self.start) % self.step == 0
        } else {
            value <= self.start && value > self.stop && (self.start - value) % (-self.step) == 0
        }
    }
}

/// A guest slice object; each bound is `None` or an integer value.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct Slice {
    pub start: Value,
    pub stop: Value,
    pub step: Value,
}

impl Slice {
    /// Resolves the slice against a sequence length, yielding
    /// `(start, stop, step)` with clamped bounds.
    ///
    /// Returns `None` when `step` is zero (the caller raises the value
    /// kind).
    #[must_use]
    pub fn indices(start: Option<i64>, stop: Option<i64>, step: Option<i64>, len: usize) -> Option<(i64, i64, i64)> {
        let step = step.unwrap_or(1);
        if step == 0 {
            return None;
        }
        let len = i64::try_from(len).unwrap_or(i64::MAX);
        let clamp = |idx: i64, hi: i64| -> i64 {
            let idx = if idx < 0 { idx + len } else { idx };
            idx.clamp(if step < 0 { -1 } else { 0 }, hi)
        };
        let default_start = if step > 0 { 0 } else { len - 1 };
        let default_stop = if step > 0 { len } else { -1 };
        let hi = if step > 0 { len } else { len - 1 };
        let start = start.map_or(default_start, |s| clamp(s, hi));
        let stop = stop.map_or(default_stop, |s| clamp(s, hi));
        Some((start, stop, step))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_len_matches_iteration() {
        let r = Range { start: 0, stop: 10, step: 3 };
        assert_eq!(r.len(), 4);
        assert_eq!(r.get(3), Some(9));
        assert_eq!(r.get(4), None);

        let rev = Range { start: 10, stop: 0, step: -2 };
        assert_eq!(rev.len(), 5);
        assert_eq!(rev.get(0), Some(10));
        assert_eq!(rev.get(4), Some(2));
    }

    #[test]
    fn range_membership() {
        let r = Range { start: 0, stop: 10, step: 3 };
        assert!(r.contains(9));
        assert!(!r.contains(10));
        assert!(!r.contains(8));
        let rev = Range { start: 10, stop: 0, step: -2 };
        assert!(rev.contains(2));
        assert!(!rev.contains(0));
    }

    #[test]
    fn slice_indices_clamp_like_the_guest() {
        assert_eq!(Slice::indices(None, None, None, 5), Some((0, 5, 1)));
        assert_eq!(Slice::indices(Some(-2), None, None, 5), Some((3, 5, 1)));
        assert_eq!(Slice::indices(None, None, Some(-1), 5), Some((4, -1, -1)));
        assert_eq!(Slice::indices(Some(100), None, None, 5), Some((5, 5, 1)));
        assert_eq!(Slice::indices(None, None, Some(0), 5), None);
    }
}
