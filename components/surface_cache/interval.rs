/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Interval algebra over guest physical addresses. Surfaces, dirty
//! regions and validity bookkeeping all operate on right-open byte
//! intervals `[start, end)`; the containers here provide the small set of
//! operations the cache needs (add, subtract, overlap enumeration,
//! coverage tests) on top of sorted vectors, which comfortably beat tree
//! structures at the handful-to-hundreds entry counts a frame produces.

use gpu_traits::PAddr;

/// A right-open byte interval `[start, end)` in guest physical memory.
/// `start == end` is the canonical empty interval.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct SurfaceInterval {
    pub start: PAddr,
    pub end: PAddr,
}

impl SurfaceInterval {
    pub fn new(start: PAddr, end: PAddr) -> SurfaceInterval {
        debug_assert!(start <= end);
        SurfaceInterval { start, end }
    }

    /// Builds the interval covering `size` bytes from `addr`.
    pub fn from_extent(addr: PAddr, size: u32) -> SurfaceInterval {
        SurfaceInterval::new(addr, addr.saturating_add(size))
    }

    pub fn len(&self) -> u32 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    pub fn overlaps(&self, other: &SurfaceInterval) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Whether `other` lies entirely inside this interval.
    pub fn contains(&self, other: &SurfaceInterval) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    pub fn intersection(&self, other: &SurfaceInterval) -> SurfaceInterval {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        if start < end {
            SurfaceInterval::new(start, end)
        } else {
            SurfaceInterval::default()
        }
    }
}

/// A set of disjoint intervals kept sorted and coalesced: inserting
/// `[0,4)` then `[4,8)` stores one span `[0,8)`.
#[derive(Clone, Debug, Default)]
pub struct IntervalSet {
    spans: Vec<SurfaceInterval>,
}

impl IntervalSet {
    pub fn new() -> IntervalSet {
        IntervalSet::default()
    }

    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }

    pub fn clear(&mut self) {
        self.spans.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = SurfaceInterval> + '_ {
        self.spans.iter().copied()
    }

    pub fn first(&self) -> Option<SurfaceInterval> {
        self.spans.first().copied()
    }

    /// Index of the first span whose end lies past `addr`, i.e. the first
    /// span that could overlap or follow an interval starting at `addr`.
    fn lower_bound(&self, addr: PAddr) -> usize {
        self.spans.partition_point(|span| span.end < addr)
    }

    pub fn insert(&mut self, interval: SurfaceInterval) {
        if interval.is_empty() {
            return;
        }
        let mut merged = interval;
        let begin = self.lower_bound(interval.start);
        let mut end = begin;
        while end < self.spans.len() && self.spans[end].start <= merged.end {
            merged.start = merged.start.min(self.spans[end].start);
            merged.end = merged.end.max(self.spans[end].end);
            end += 1;
        }
        self.spans.splice(begin..end, [merged]);
    }

    pub fn remove(&mut self, interval: SurfaceInterval) {
        if interval.is_empty() {
            return;
        }
        let mut replacement: Vec<SurfaceInterval> = Vec::new();
        let begin = self.spans.partition_point(|span| span.end <= interval.start);
        let mut end = begin;
        while end < self.spans.len() && self.spans[end].start < interval.end {
            let span = self.spans[end];
            if span.start < interval.start {
                replacement.push(SurfaceInterval::new(span.start, interval.start));
            }
            if interval.end < span.end {
                replacement.push(SurfaceInterval::new(interval.end, span.end));
            }
            end += 1;
        }
        self.spans.splice(begin..end, replacement);
    }

    /// Whether any stored byte overlaps `interval`.
    pub fn overlaps(&self, interval: &SurfaceInterval) -> bool {
        if interval.is_empty() {
            return false;
        }
        let idx = self.spans.partition_point(|span| span.end <= interval.start);
        self.spans.get(idx).is_some_and(|span| span.start < interval.end)
    }

    /// Whether every byte of `interval` is stored. Empty intervals are
    /// trivially covered.
    pub fn covers(&self, interval: &SurfaceInterval) -> bool {
        if interval.is_empty() {
            return true;
        }
        // Coalescing guarantees a covered interval sits inside one span.
        let idx = self.spans.partition_point(|span| span.end < interval.end);
        self.spans.get(idx).is_some_and(|span| span.contains(interval))
    }

    /// The subset of this set lying inside `interval`.
    pub fn intersection(&self, interval: &SurfaceInterval) -> IntervalSet {
        let mut result = IntervalSet::new();
        let mut idx = self.spans.partition_point(|span| span.end <= interval.start);
        while idx < self.spans.len() && self.spans[idx].start < interval.end {
            let clipped = self.spans[idx].intersection(interval);
            if !clipped.is_empty() {
                result.spans.push(clipped);
            }
            idx += 1;
        }
        result
    }

    /// Set difference `self - other`.
    pub fn difference(&self, other: &IntervalSet) -> IntervalSet {
        let mut result = self.clone();
        for span in &other.spans {
            result.remove(*span);
        }
        result
    }

    pub fn union_with(&mut self, other: &IntervalSet) {
        for span in &other.spans {
            self.insert(*span);
        }
    }
}

/// Maps disjoint intervals to values; `set` overwrites whatever the range
/// previously mapped to, which is exactly the "most recent writer wins"
/// rule the dirty-region table needs.
#[derive(Clone, Debug)]
pub struct IntervalMap<V> {
    entries: Vec<(SurfaceInterval, V)>,
}

impl<V> Default for IntervalMap<V> {
    fn default() -> IntervalMap<V> {
        IntervalMap { entries: Vec::new() }
    }
}

impl<V: Clone> IntervalMap<V> {
    pub fn new() -> IntervalMap<V> {
        IntervalMap::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Maps `interval` to `value`, splitting any previous entries that
    /// spill past either edge.
    pub fn set(&mut self, interval: SurfaceInterval, value: V) {
        if interval.is_empty() {
            return;
        }
        self.subtract(interval);
        let idx = self.entries.partition_point(|(span, _)| span.start < interval.start);
        self.entries.insert(idx, (interval, value));
    }

    /// Removes `interval` from the mapping, keeping the protruding parts
    /// of partially covered entries.
    pub fn subtract(&mut self, interval: SurfaceInterval) {
        if interval.is_empty() {
            return;
        }
        let mut replacement: Vec<(SurfaceInterval, V)> = Vec::new();
        let begin = self.entries.partition_point(|(span, _)| span.end <= interval.start);
        let mut end = begin;
        while end < self.entries.len() && self.entries[end].0.start < interval.end {
            let (span, value) = &self.entries[end];
            if span.start < interval.start {
                replacement
                    .push((SurfaceInterval::new(span.start, interval.start), value.clone()));
            }
            if interval.end < span.end {
                replacement.push((SurfaceInterval::new(interval.end, span.end), value.clone()));
            }
            end += 1;
        }
        self.entries.splice(begin..end, replacement);
    }

    /// Iterates the stored entries overlapping `interval`. Entries come
    /// back as stored, not clipped to the query; callers that want the
    /// intersection clip themselves.
    pub fn iter_overlaps(
        &self,
        interval: SurfaceInterval,
    ) -> impl Iterator<Item = (SurfaceInterval, &V)> + '_ {
        let begin = self.entries.partition_point(move |(span, _)| span.end <= interval.start);
        self.entries[begin..]
            .iter()
            .take_while(move |(span, _)| span.start < interval.end)
            .map(|(span, value)| (*span, value))
    }

    /// Whether the mapped ranges cover every byte of `interval`.
    pub fn covers(&self, interval: SurfaceInterval) -> bool {
        if interval.is_empty() {
            return true;
        }
        let mut next = interval.start;
        for (span, _) in self.iter_overlaps(interval) {
            if span.start > next {
                return false;
            }
            next = next.max(span.end);
            if next >= interval.end {
                return true;
            }
        }
        false
    }
}

/// The live-surface index: multiple values may cover overlapping (or
/// identical) intervals. Entries are kept sorted by start address; each
/// surface registers exactly one entry spanning its full byte range.
#[derive(Clone, Debug)]
pub struct IntervalMultiMap<V> {
    entries: Vec<(SurfaceInterval, V)>,
}

impl<V> Default for IntervalMultiMap<V> {
    fn default() -> IntervalMultiMap<V> {
        IntervalMultiMap { entries: Vec::new() }
    }
}

impl<V> IntervalMultiMap<V> {
    pub fn new() -> IntervalMultiMap<V> {
        IntervalMultiMap::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn insert(&mut self, interval: SurfaceInterval, value: V) {
        let idx = self.entries.partition_point(|(span, _)| span.start < interval.start);
        self.entries.insert(idx, (interval, value));
    }

    /// Removes the first entry at `interval` for which `matches` returns
    /// true. Returns whether anything was removed.
    pub fn remove(&mut self, interval: SurfaceInterval, matches: impl Fn(&V) -> bool) -> bool {
        let Some(idx) = self
            .entries
            .iter()
            .position(|(span, value)| *span == interval && matches(value))
        else {
            return false;
        };
        self.entries.remove(idx);
        true
    }

    /// Iterates every entry whose interval overlaps `interval`.
    ///
    /// Entries are sorted by start only, so an entry starting far before
    /// the query can still reach into it; the scan walks from the first
    /// entry whose end could touch the query rather than binary-searching
    /// on start.
    pub fn iter_overlaps(
        &self,
        interval: SurfaceInterval,
    ) -> impl Iterator<Item = (SurfaceInterval, &V)> + '_ {
        self.entries
            .iter()
            .take_while(move |(span, _)| span.start < interval.end)
            .filter(move |(span, _)| span.overlaps(&interval))
            .map(|(span, value)| (*span, value))
    }

    pub fn iter(&self) -> impl Iterator<Item = (SurfaceInterval, &V)> + '_ {
        self.entries.iter().map(|(span, value)| (*span, value))
    }

    pub fn first(&self) -> Option<(SurfaceInterval, &V)> {
        self.entries.first().map(|(span, value)| (*span, value))
    }
}
