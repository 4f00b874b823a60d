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

use crate::code::{CacheLine, CoreId, CoreLine, PartId};

/// Lookup result of one core line of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupStatus {
    /// The core line is not mapped to any cache line.
    Miss,
    /// The core line is mapped to a cache line.
    Hit,
    /// A cache line has been assigned to the core line by this request.
    Remapped,
}

/// Mapping state of one core line of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapEntry {
    /// The core line.
    pub core_line: CoreLine,
    /// Lookup status.
    pub status: LookupStatus,
    /// Mapped cache line, if any.
    pub cache_line: Option<CacheLine>,
}

/// An I/O request covering a contiguous range of core lines.
///
/// Only the parts consumed by admission and eviction are modeled: the core line range, the per-line mapping and the
/// target partition.
#[derive(Debug, Clone)]
pub struct Request {
    core_id: CoreId,
    core_line_first: u64,
    core_line_last: u64,
    part_id: PartId,
    map: Vec<MapEntry>,
}

impl Request {
    /// Create a request over `count` core lines starting at `core_line_first`, all entries missed.
    ///
    /// # Panics
    ///
    /// Panics if `count` is zero.
    pub fn new(core_id: CoreId, core_line_first: u64, count: u64, part_id: PartId) -> Self {
        assert!(count > 0, "request must cover at least one core line");
        let core_line_last = core_line_first + count - 1;
        let map = (core_line_first..=core_line_last)
            .map(|line| MapEntry {
                core_line: CoreLine::new(core_id, line),
                status: LookupStatus::Miss,
                cache_line: None,
            })
            .collect();
        Self {
            core_id,
            core_line_first,
            core_line_last,
            part_id,
            map,
        }
    }

    /// The core the request targets.
    pub fn core_id(&self) -> CoreId {
        self.core_id
    }

    /// First core line of the request.
    pub fn core_line_first(&self) -> u64 {
        self.core_line_first
    }

    /// Last core line of the request, inclusive.
    pub fn core_line_last(&self) -> u64 {
        self.core_line_last
    }

    /// Number of core lines covered.
    pub fn core_line_count(&self) -> usize {
        self.map.len()
    }

    /// Target partition.
    pub fn part_id(&self) -> PartId {
        self.part_id
    }

    /// Per-line mapping.
    pub fn map(&self) -> &[MapEntry] {
        &self.map
    }

    /// Iterate over the core lines of the request.
    pub fn core_lines(&self) -> impl Iterator<Item = CoreLine> + '_ {
        self.map.iter().map(|entry| entry.core_line)
    }

    /// Number of core lines already mapped into the cache.
    pub fn mapped_count(&self) -> usize {
        self.map.iter().filter(|e| e.status == LookupStatus::Hit).count()
    }

    /// Number of core lines without a cache line.
    pub fn unmapped_count(&self) -> usize {
        self.map.iter().filter(|e| e.status == LookupStatus::Miss).count()
    }

    /// Returns true if the core line is one of the request's own targets.
    pub fn contains(&self, core_line: &CoreLine) -> bool {
        core_line.core_id == self.core_id && (self.core_line_first..=self.core_line_last).contains(&core_line.line)
    }

    /// Record a lookup hit for the entry at `idx`.
    pub fn set_hit(&mut self, idx: usize, cache_line: CacheLine) {
        let entry = &mut self.map[idx];
        entry.status = LookupStatus::Hit;
        entry.cache_line = Some(cache_line);
    }

    /// Assign a freshly acquired cache line to the entry at `idx`.
    pub fn remap(&mut self, idx: usize, cache_line: CacheLine) {
        let entry = &mut self.map[idx];
        entry.status = LookupStatus::Remapped;
        entry.cache_line = Some(cache_line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_counts() {
        let mut req = Request::new(CoreId::new(1), 10, 4, PartId::DEFAULT);
        assert_eq!(req.core_line_last(), 13);
        assert_eq!(req.unmapped_count(), 4);
        assert_eq!(req.mapped_count(), 0);

        req.set_hit(1, CacheLine::new(7));
        req.remap(2, CacheLine::new(8));
        assert_eq!(req.mapped_count(), 1);
        assert_eq!(req.unmapped_count(), 2);

        assert!(req.contains(&CoreLine::new(CoreId::new(1), 13)));
        assert!(!req.contains(&CoreLine::new(CoreId::new(1), 14)));
        assert!(!req.contains(&CoreLine::new(CoreId::new(2), 10)));
    }
}
