//! Inclusive integer intervals and normalized interval sets
//!
//! Bounds are `u128` so IPv4 addresses, IPv6 addresses and ports share one
//! implementation. An [`IntervalSet`] is always sorted, disjoint and merged
//! (no two members overlap or touch), which makes equality structural.

use std::fmt;

/// Inclusive range `[start, end]` with `start <= end`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Interval {
    start: u128,
    end: u128,
}

impl Interval {
    /// Returns `None` when `start > end`.
    pub fn new(start: u128, end: u128) -> Option<Self> {
        (start <= end).then_some(Self { start, end })
    }

    pub fn point(value: u128) -> Self {
        Self {
            start: value,
            end: value,
        }
    }

    /// `[0, max]`
    pub fn up_to(max: u128) -> Self {
        Self { start: 0, end: max }
    }

    pub fn start(&self) -> u128 {
        self.start
    }

    pub fn end(&self) -> u128 {
        self.end
    }

    pub fn contains(&self, value: u128) -> bool {
        self.start <= value && value <= self.end
    }

    pub fn intersect(&self, other: &Interval) -> Option<Interval> {
        Interval::new(self.start.max(other.start), self.end.min(other.end))
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct IntervalSet {
    ranges: Vec<Interval>,
}

impl IntervalSet {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn single(interval: Interval) -> Self {
        Self {
            ranges: vec![interval],
        }
    }

    /// Builds a normalized set from arbitrary (possibly overlapping) intervals.
    pub fn from_intervals(intervals: impl IntoIterator<Item = Interval>) -> Self {
        let mut ranges: Vec<Interval> = intervals.into_iter().collect();
        normalize(&mut ranges);
        Self { ranges }
    }

    pub fn intervals(&self) -> &[Interval] {
        &self.ranges
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn contains(&self, value: u128) -> bool {
        self.ranges
            .binary_search_by(|r| {
                if r.end < value {
                    std::cmp::Ordering::Less
                } else if r.start > value {
                    std::cmp::Ordering::Greater
                } else {
                    std::cmp::Ordering::Equal
                }
            })
            .is_ok()
    }

    pub fn union(&self, other: &IntervalSet) -> IntervalSet {
        Self::from_intervals(self.ranges.iter().chain(other.ranges.iter()).copied())
    }

    pub fn intersection(&self, other: &IntervalSet) -> IntervalSet {
        let (a, b) = (&self.ranges, &other.ranges);
        let mut out = Vec::new();
        let (mut i, mut j) = (0, 0);
        while i < a.len() && j < b.len() {
            if let Some(overlap) = a[i].intersect(&b[j]) {
                out.push(overlap);
            }
            if a[i].end < b[j].end {
                i += 1;
            } else {
                j += 1;
            }
        }
        normalize(&mut out);
        IntervalSet { ranges: out }
    }

    /// Elements of `self` not in `other`.
    pub fn subtract(&self, other: &IntervalSet) -> IntervalSet {
        let mut out = Vec::new();
        for a in &self.ranges {
            let mut start = a.start;
            let mut consumed = false;
            for b in &other.ranges {
                if b.end < start {
                    continue;
                }
                if b.start > a.end {
                    break;
                }
                if b.start > start {
                    out.push(Interval {
                        start,
                        end: b.start - 1,
                    });
                }
                if b.end >= a.end {
                    consumed = true;
                    break;
                }
                start = b.end + 1;
            }
            if !consumed {
                out.push(Interval { start, end: a.end });
            }
        }
        IntervalSet { ranges: out }
    }

    pub fn is_subset(&self, other: &IntervalSet) -> bool {
        self.subtract(other).is_empty()
    }

    pub fn overlaps(&self, other: &IntervalSet) -> bool {
        !self.intersection(other).is_empty()
    }
}

impl fmt::Display for IntervalSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, r) in self.ranges.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{r}")?;
        }
        f.write_str("}")
    }
}

fn normalize(ranges: &mut Vec<Interval>) {
    ranges.sort_unstable();
    let mut merged: Vec<Interval> = Vec::with_capacity(ranges.len());
    for r in ranges.drain(..) {
        match merged.last_mut() {
            Some(last) if r.start <= last.end.saturating_add(1) => {
                last.end = last.end.max(r.end);
            }
            _ => merged.push(r),
        }
    }
    *ranges = merged;
}
