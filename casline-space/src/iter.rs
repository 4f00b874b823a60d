// Copyright 2025 casline Project Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Round-robin selection of LRU shards.
//!
//! A partition's lines are spread over [`NUM_LRU_LISTS`] shards. Iterators walk the non-empty shards in rotation,
//! starting at a caller-chosen shard, so consecutive scans that start at consecutive shards spread the work evenly.
//!
//! The set of shards still worth visiting is a 32-bit mask kept rotated relative to the current shard: bit `k` stands
//! for shard `(current + k + 1) % NUM_LRU_LISTS`, so the current shard itself sits at the most significant bit. The
//! next shard to visit is therefore always the lowest set bit, found with one trailing-zeros count, and the rotation
//! after each step keeps that property. Scanning an unrotated mask from bit 0 instead would always favour low shards.

use casline_common::strict_assert;

/// Number of LRU shards per partition.
pub const NUM_LRU_LISTS: usize = 32;

const MSB: u32 = 1 << (NUM_LRU_LISTS - 1);

/// Rotating mask of shards with lines left to visit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RotatingMask {
    mask: u32,
    num_avail: u32,
    lru_idx: usize,
}

impl RotatingMask {
    /// Create a mask from the set of non-empty shards (bit `s` set for shard `s`), to be walked from shard `start`.
    pub fn new(nonempty: u32, start: usize) -> Self {
        let start = start % NUM_LRU_LISTS;
        Self {
            // Shard `start` lands at bit 0, which is the first one visited.
            mask: nonempty.rotate_right(start as u32),
            num_avail: nonempty.count_ones(),
            // The shard before `start` is the current one.
            lru_idx: (start + NUM_LRU_LISTS - 1) % NUM_LRU_LISTS,
        }
    }

    /// Advance to the next shard with lines left and return its index.
    ///
    /// # Panics
    ///
    /// Panics if every shard is exhausted.
    pub fn next_lru(&mut self) -> usize {
        assert!(!self.all_empty(), "no shard left to visit");
        let increment = self.mask.trailing_zeros() + 1;
        self.mask = self.mask.rotate_right(increment);
        self.lru_idx = (self.lru_idx + increment as usize) % NUM_LRU_LISTS;
        self.lru_idx
    }

    /// Index of the current shard.
    pub fn current(&self) -> usize {
        self.lru_idx
    }

    /// Returns true if the current shard is exhausted.
    pub fn is_empty(&self) -> bool {
        self.mask & MSB == 0
    }

    /// Mark the current shard as exhausted.
    pub fn set_empty(&mut self) {
        strict_assert!(!self.is_empty() && self.num_avail > 0);
        self.mask &= !MSB;
        self.num_avail -= 1;
        tracing::trace!("[lru]: shard {} exhausted, {} left", self.lru_idx, self.num_avail);
    }

    /// Returns true if every shard is exhausted.
    pub fn all_empty(&self) -> bool {
        self.num_avail == 0
    }
}

/// Walk shards through `scan` until it yields a line or every shard is exhausted.
///
/// `scan` gets the shard index and returns the line found there, if any. A shard where nothing is found is not visited
/// again.
pub(crate) fn next_line<T>(mask: &mut RotatingMask, mut scan: impl FnMut(usize) -> Option<T>) -> Option<T> {
    while !mask.all_empty() {
        let lru = mask.next_lru();
        if let Some(found) = scan(lru) {
            return Some(found);
        }
        if !mask.is_empty() {
            mask.set_empty();
        }
    }
    None
}
