// Copyright (C) 2025, The quill Authors.
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, are permitted provided that the following conditions are
// met:
//
//     * Redistributions of source code must retain the above copyright notice,
//       this list of conditions and the following disclaimer.
//
//     * Redistributions in binary form must reproduce the above copyright
//       notice, this list of conditions and the following disclaimer in the
//       documentation and/or other materials provided with the distribution.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS "AS
// IS" AND ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT LIMITED TO,
// THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A PARTICULAR
// PURPOSE ARE DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT HOLDER OR
// CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL, SPECIAL,
// EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT LIMITED TO,
// PROCUREMENT OF SUBSTITUTE GOODS OR SERVICES; LOSS OF USE, DATA, OR
// PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY THEORY OF
// LIABILITY, WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT (INCLUDING
// NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE USE OF THIS
// SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

use std::ops::Range;

/// A set of disjoint half-open `u64` intervals in strictly ascending order.
///
/// Overlapping or abutting intervals are merged eagerly on insertion, so the
/// set is normalized after every operation. Entries are addressable by index
/// because the send scheduler and receive reassembly walk them positionally.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct RangeSet {
    inner: Vec<Range<u64>>,
}

impl RangeSet {
    pub fn new() -> Self {
        RangeSet::default()
    }

    /// Inserts `item` into the set, merging any overlapped or abutting
    /// entries.
    pub fn insert(&mut self, item: Range<u64>) {
        if item.start >= item.end {
            return;
        }

        let mut start = item.start;
        let mut end = item.end;

        // First entry that could merge with the new one (its end touches or
        // passes the new start).
        let lo = self.inner.partition_point(|r| r.end < start);

        // One past the last entry that could merge (its start is at or below
        // the new end).
        let hi = self.inner.partition_point(|r| r.start <= end);

        if lo < hi {
            start = std::cmp::min(start, self.inner[lo].start);
            end = std::cmp::max(end, self.inner[hi - 1].end);
        }

        self.inner.splice(lo..hi, std::iter::once(start..end));
    }

    pub fn push_item(&mut self, item: u64) {
        self.insert(item..item + 1);
    }

    /// Removes everything below `new_start`, splitting a straddling entry.
    pub fn shrink_left(&mut self, new_start: u64) {
        let covered = self.inner.partition_point(|r| r.end <= new_start);
        self.inner.drain(..covered);

        if let Some(first) = self.inner.first_mut() {
            if first.start < new_start {
                first.start = new_start;
            }
        }
    }

    /// Removes the entries with indices in `[from, to)`.
    pub fn remove_entries(&mut self, from: usize, to: usize) {
        let to = std::cmp::min(to, self.inner.len());

        if from < to {
            self.inner.drain(from..to);
        }
    }

    /// Moves the start of the entry at `index` forward to `new_start`.
    ///
    /// The entry must exist and `new_start` must fall inside it.
    pub fn set_entry_start(&mut self, index: usize, new_start: u64) {
        let r = &mut self.inner[index];

        debug_assert!(r.start <= new_start && new_start < r.end);

        r.start = new_start;
    }

    pub fn clear(&mut self) {
        self.inner.clear();
    }

    pub fn get(&self, index: usize) -> Option<Range<u64>> {
        self.inner.get(index).cloned()
    }

    pub fn contains(&self, item: u64) -> bool {
        let i = self.inner.partition_point(|r| r.end <= item);

        self.inner.get(i).is_some_and(|r| r.start <= item)
    }

    pub fn first(&self) -> Option<u64> {
        self.inner.first().map(|r| r.start)
    }

    pub fn last(&self) -> Option<u64> {
        self.inner.last().map(|r| r.end - 1)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = Range<u64>> + '_ {
        self.inner.iter().cloned()
    }

    pub fn flatten(&self) -> impl DoubleEndedIterator<Item = u64> + '_ {
        self.inner.iter().flat_map(|r| r.clone())
    }
}

// This implements comparison between `RangeSet` and standard `Range`. The
// idea is that a `RangeSet` with no gaps (i.e. that only contains a single
// range) is basically equivalent to a normal `Range` so they should be
// comparable.
impl PartialEq<Range<u64>> for RangeSet {
    fn eq(&self, other: &Range<u64>) -> bool {
        if self.inner.len() != 1 {
            return false;
        }

        self.inner[0] == *other
    }
}

impl std::fmt::Debug for RangeSet {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self.inner)
    }
}
