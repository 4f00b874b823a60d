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

use std::{
    fmt::Debug,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
};

use casline_common::{
    code::{CacheLine, CoreLine, PartId},
    error::Result,
    metrics::Metrics,
    request::{LookupStatus, Request},
    strict_assert, strict_assert_eq,
};
use itertools::Itertools;
use parking_lot::{RwLock, RwLockWriteGuard};

use crate::{
    concurrency::{BucketConcurrency, HashLocked, LineConcurrency},
    iter::{next_line, RotatingMask, NUM_LRU_LISTS},
    list::{LruList, LruNode, Nodes},
    partition::PartitionRuntime,
};

/// Largest number of dirty lines handed out by one [`Space::clean`] call.
pub const EVICTION_CLEAN_SIZE: usize = 32;

/// Per-line metadata kept by the eviction engine.
#[derive(Debug, Clone, Copy)]
struct LineMeta {
    node: LruNode,
    part: PartId,
    dirty: bool,
    core: Option<CoreLine>,
}

impl Default for LineMeta {
    fn default() -> Self {
        Self {
            node: LruNode::default(),
            part: PartId::FREELIST,
            dirty: false,
            core: None,
        }
    }
}

/// Metadata of the lines of one shard, at position `cline / NUM_LRU_LISTS`.
#[derive(Debug)]
struct ShardLines(Vec<LineMeta>);

impl ShardLines {
    fn meta(&self, line: CacheLine) -> &LineMeta {
        &self.0[line.index() / NUM_LRU_LISTS]
    }

    fn meta_mut(&mut self, line: CacheLine) -> &mut LineMeta {
        &mut self.0[line.index() / NUM_LRU_LISTS]
    }
}

impl Nodes for ShardLines {
    fn node(&self, line: CacheLine) -> &LruNode {
        &self.meta(line).node
    }

    fn node_mut(&mut self, line: CacheLine) -> &mut LruNode {
        &mut self.meta_mut(line).node
    }
}

#[derive(Debug)]
struct LruLists {
    clean: LruList,
    dirty: LruList,
}

impl LruLists {
    fn new(part: PartId) -> Self {
        let track_hot = part != PartId::FREELIST;
        Self {
            clean: LruList::new(track_hot),
            dirty: LruList::new(track_hot),
        }
    }
}

/// One of the [`NUM_LRU_LISTS`] slices of the cache. Line `cline` belongs to shard `cline % NUM_LRU_LISTS`.
#[derive(Debug)]
struct LruShard {
    lines: ShardLines,
    lists: Vec<LruLists>,
}

impl LruShard {
    fn list(&self, part: PartId, clean: bool) -> &LruList {
        strict_assert_ne_unspecified(part);
        let lists = &self.lists[part.index()];
        // Freelist lines always live on the clean list.
        if clean || part == PartId::FREELIST {
            &lists.clean
        } else {
            &lists.dirty
        }
    }

    fn split(&mut self, part: PartId, clean: bool) -> (&mut LruList, &mut ShardLines) {
        strict_assert_ne_unspecified(part);
        let lists = &mut self.lists[part.index()];
        let list = if clean || part == PartId::FREELIST {
            &mut lists.clean
        } else {
            &mut lists.dirty
        };
        (list, &mut self.lines)
    }

    /// Link a line into the list matching its partition and dirty bit.
    fn add(&mut self, line: CacheLine) {
        let meta = *self.lines.meta(line);
        let (list, lines) = self.split(meta.part, !meta.dirty);
        list.add_head(lines, line);
    }

    fn remove(&mut self, line: CacheLine) {
        let meta = *self.lines.meta(line);
        let (list, lines) = self.split(meta.part, !meta.dirty);
        list.remove(lines, line);
    }

    fn set_hot(&mut self, line: CacheLine) {
        let meta = *self.lines.meta(line);
        let (list, lines) = self.split(meta.part, !meta.dirty);
        list.set_hot(lines, line);
    }
}

fn strict_assert_ne_unspecified(part: PartId) {
    strict_assert!(part != PartId::UNSPECIFIED, "the unspecified partition owns no lists");
}

/// Rotating LRU start index of an I/O queue.
///
/// Each scan started on behalf of the queue begins one shard after the previous one.
#[derive(Debug, Default)]
pub struct IoQueue {
    lru_idx: AtomicU32,
}

impl IoQueue {
    /// Create a queue starting at shard 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the start shard of the next scan.
    pub fn next_lru_idx(&self) -> usize {
        self.lru_idx.fetch_add(1, Ordering::Relaxed) as usize % NUM_LRU_LISTS
    }
}

/// Iterator over the eviction candidates of a user partition. See [`Space::eviction_next`].
#[derive(Debug)]
pub struct EvictIter {
    mask: RotatingMask,
    src: PartId,
}

/// Iterator over the lines of the freelist. See [`Space::free_next`].
#[derive(Debug)]
pub struct FreeIter {
    mask: RotatingMask,
}

/// Dirty lines handed out for cleaning.
///
/// The lines are read locked and the partition's cleaning reference is held until the batch is completed or dropped.
pub struct CleaningBatch {
    part: PartId,
    lines: Vec<CacheLine>,
    runtime: Arc<PartitionRuntime>,
    concurrency: Arc<dyn LineConcurrency>,
}

impl Debug for CleaningBatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CleaningBatch")
            .field("part", &self.part)
            .field("lines", &self.lines)
            .finish()
    }
}

impl CleaningBatch {
    /// Partition the lines belong to.
    pub fn part(&self) -> PartId {
        self.part
    }

    /// Lines to clean, in the order they were gathered.
    pub fn lines(&self) -> &[CacheLine] {
        &self.lines
    }

    /// Release the lines and the cleaning reference.
    pub fn complete(self) {}
}

impl Drop for CleaningBatch {
    fn drop(&mut self) {
        for &line in &self.lines {
            self.concurrency.unlock_rd(line);
        }
        self.runtime.cleaning().dec();
    }
}

/// LRU eviction engine.
///
/// Every cache line is on exactly one list once the freelist has been populated: the clean or dirty list of its
/// partition in shard `cline % NUM_LRU_LISTS`. Freelist lines are always on the clean list.
pub struct Space {
    cachelines: u32,
    shards: Box<[RwLock<LruShard>]>,
    runtimes: Box<[Arc<PartitionRuntime>]>,
    lines: Arc<dyn LineConcurrency>,
    buckets: Arc<dyn BucketConcurrency>,
    metrics: Arc<Metrics>,
}

impl Debug for Space {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Space")
            .field("cachelines", &self.cachelines)
            .field("num_free", &self.num_free())
            .finish()
    }
}

impl Space {
    /// Create the engine for `cachelines` lines, none of them listed yet.
    ///
    /// `runtimes` are indexed by [`PartId::index`] and cover user partitions and the freelist.
    pub fn new(
        cachelines: u32,
        runtimes: &[Arc<PartitionRuntime>],
        lines: Arc<dyn LineConcurrency>,
        buckets: Arc<dyn BucketConcurrency>,
        metrics: Arc<Metrics>,
    ) -> Result<Self> {
        assert_eq!(runtimes.len(), PartId::COUNT);

        let mut shards = Vec::with_capacity(NUM_LRU_LISTS);
        for shard in 0..NUM_LRU_LISTS {
            let len = (cachelines as usize + NUM_LRU_LISTS - 1 - shard) / NUM_LRU_LISTS;
            let mut metas = Vec::new();
            metas.try_reserve_exact(len)?;
            metas.resize(len, LineMeta::default());
            let lists = (0..PartId::COUNT as u16)
                .map(|id| LruLists::new(part_id(id)))
                .collect();
            shards.push(RwLock::new(LruShard {
                lines: ShardLines(metas),
                lists,
            }));
        }

        let space = Self {
            cachelines,
            shards: shards.into_boxed_slice(),
            runtimes: runtimes.to_vec().into_boxed_slice(),
            lines,
            buckets,
            metrics,
        };
        space
            .runtimes
            .iter()
            .for_each(|runtime| runtime.set_curr_size(0));
        Ok(space)
    }

    /// Number of cache lines.
    pub fn cachelines(&self) -> u32 {
        self.cachelines
    }

    fn shard(&self, line: CacheLine) -> &RwLock<LruShard> {
        &self.shards[line.index() % NUM_LRU_LISTS]
    }

    fn runtime(&self, part: PartId) -> &Arc<PartitionRuntime> {
        strict_assert_ne_unspecified(part);
        &self.runtimes[part.index()]
    }

    fn lock_all(&self) -> Vec<RwLockWriteGuard<'_, LruShard>> {
        self.shards.iter().map(|shard| shard.write()).collect()
    }

    /// Reset the lists and the size of a partition.
    ///
    /// Only valid while no line is assigned to the partition.
    pub fn init_part(&self, part: PartId) {
        for shard in self.shards.iter() {
            shard.write().lists[part.index()] = LruLists::new(part);
        }
        self.runtime(part).set_curr_size(0);
    }

    /// Put every line that holds no core line on the freelist.
    ///
    /// # Panics
    ///
    /// Panics if the number of such lines is not `num_free`.
    pub fn populate(&self, num_free: u32) {
        let mut shards = self.lock_all();
        let mut added = 0;
        for line in (0..self.cachelines).map(CacheLine::new) {
            let shard = &mut shards[line.index() % NUM_LRU_LISTS];
            let meta = shard.lines.meta_mut(line);
            if meta.core.is_some() {
                continue;
            }
            meta.part = PartId::FREELIST;
            meta.dirty = false;
            shard.add(line);
            added += 1;
        }
        drop(shards);

        assert_eq!(added, num_free, "free line count mismatch");
        self.runtime(PartId::FREELIST).set_curr_size(num_free);
        self.metrics.lru_populate.increase(num_free as u64);
        self.metrics.free_lines.absolute(num_free as u64);
        tracing::debug!("[lru]: populate freelist with {num_free} lines");
    }

    /// Load the state of a line that already holds data, and link it into its partition.
    ///
    /// Used before [`Space::populate`] when the cache starts with mapped lines.
    pub fn restore_line(&self, line: CacheLine, core_line: CoreLine, part: PartId, dirty: bool) {
        assert!(part.is_user(), "mapped lines belong to user partitions");
        let mut shard = self.shard(line).write();
        let meta = shard.lines.meta_mut(line);
        strict_assert!(meta.core.is_none());
        meta.core = Some(core_line);
        meta.part = part;
        meta.dirty = dirty;
        shard.add(line);
        self.runtime(part).inc_size();
    }

    /// Link a line into the list of its partition and dirty bit.
    pub fn add(&self, line: CacheLine) {
        self.shard(line).write().add(line);
    }

    /// Unlink a line from its list. Partition sizes are not changed.
    pub fn remove(&self, line: CacheLine) {
        self.shard(line).write().remove(line);
    }

    fn repart_locked(&self, shard: &mut LruShard, line: CacheLine, src: PartId, dst: PartId) {
        strict_assert_eq!(shard.lines.meta(line).part, src);
        shard.remove(line);
        shard.lines.meta_mut(line).part = dst;
        shard.add(line);
        self.runtime(src).dec_size();
        self.runtime(dst).inc_size();
    }

    /// Move a line from partition `src` to partition `dst`.
    pub fn repart(&self, line: CacheLine, src: PartId, dst: PartId) {
        let mut shard = self.shard(line).write();
        self.repart_locked(&mut shard, line, src, dst);
    }

    /// Move every line of partition `src`, clean and dirty, to partition `dst`. Returns the number of lines moved.
    ///
    /// Used when an io class is removed, so that its lines stay reclaimable. All shards are locked for the move.
    pub fn repart_all(&self, src: PartId, dst: PartId) -> u32 {
        assert!(src.is_user() && dst.is_user(), "lines move between user partitions only");
        if src == dst {
            return 0;
        }
        let mut shards = self.lock_all();
        let mut moved = 0;
        for shard in shards.iter_mut() {
            for clean in [true, false] {
                // Taking lines from the tail keeps their relative order on the destination list.
                while let Some(line) = shard.list(src, clean).tail() {
                    self.repart_locked(shard, line, src, dst);
                    moved += 1;
                }
            }
        }
        drop(shards);
        strict_assert_eq!(self.runtime(src).curr_size(), 0);
        tracing::debug!("[lru]: move {moved} lines from partition {src} to partition {dst}");
        moved
    }

    /// Return a line to the freelist. The line forgets its core line and dirty bit.
    pub fn rm_cline(&self, line: CacheLine) {
        {
            let mut shard = self.shard(line).write();
            let part = shard.lines.meta(line).part;
            self.repart_locked(&mut shard, line, part, PartId::FREELIST);
            let meta = shard.lines.meta_mut(line);
            meta.core = None;
            meta.dirty = false;
        }
        self.metrics.free_lines.absolute(self.num_free() as u64);
    }

    /// Move a line to the head of its list, unless it is already hot.
    pub fn hot_cline(&self, line: CacheLine) {
        if self.shard(line).read().lines.node(line).hot {
            return;
        }
        self.shard(line).write().set_hot(line);
    }

    /// Move a line of `part` from its dirty list to its clean list.
    ///
    /// Returns false and leaves the line alone if it is not in `part` or is already clean.
    pub fn clean_cline(&self, part: PartId, line: CacheLine) -> bool {
        self.set_dirty(Some(part), line, false)
    }

    /// Move a line of `part` from its clean list to its dirty list.
    ///
    /// Returns false and leaves the line alone if it is not in `part` or is already dirty.
    pub fn dirty_cline(&self, part: PartId, line: CacheLine) -> bool {
        self.set_dirty(Some(part), line, true)
    }

    /// Move a line of whatever user partition it is in between its clean and dirty lists.
    ///
    /// Returns false and leaves the line alone if it is on the freelist or its dirty bit already is `dirty`.
    pub fn set_cline_dirty(&self, line: CacheLine, dirty: bool) -> bool {
        self.set_dirty(None, line, dirty)
    }

    fn set_dirty(&self, part: Option<PartId>, line: CacheLine, dirty: bool) -> bool {
        let mut shard = self.shard(line).write();
        let meta = *shard.lines.meta(line);
        if !meta.part.is_user() || part.is_some_and(|part| part != meta.part) || meta.dirty == dirty {
            return false;
        }
        shard.remove(line);
        shard.lines.meta_mut(line).dirty = dirty;
        shard.add(line);
        true
    }

    /// Number of lines on the freelist.
    pub fn num_free(&self) -> u32 {
        self.runtime(PartId::FREELIST).curr_size()
    }

    /// Core line held by a cache line.
    pub fn core_line(&self, line: CacheLine) -> Option<CoreLine> {
        self.shard(line).read().lines.meta(line).core
    }

    /// Partition a cache line belongs to.
    pub fn part_of(&self, line: CacheLine) -> PartId {
        self.shard(line).read().lines.meta(line).part
    }

    /// Returns true if the line is on a dirty list.
    pub fn is_dirty(&self, line: CacheLine) -> bool {
        self.shard(line).read().lines.meta(line).dirty
    }

    /// Returns true if the line is in the hot prefix of its list.
    pub fn is_hot(&self, line: CacheLine) -> bool {
        self.shard(line).read().lines.node(line).hot
    }

    fn nonempty(&self, part: PartId, clean: bool) -> u32 {
        self.shards
            .iter()
            .enumerate()
            .filter(|(_, shard)| !shard.read().list(part, clean).is_empty())
            .fold(0, |mask, (lru, _)| mask | 1 << lru)
    }

    /// Create an iterator over the clean lines of user partition `src`, starting at shard `start`.
    pub fn evict_iter(&self, src: PartId, start: usize) -> EvictIter {
        assert!(src.is_user(), "eviction source must be a user partition");
        EvictIter {
            mask: RotatingMask::new(self.nonempty(src, true), start),
            src,
        }
    }

    /// Create an iterator over the freelist, starting at shard `start`.
    pub fn free_iter(&self, start: usize) -> FreeIter {
        FreeIter {
            mask: RotatingMask::new(self.nonempty(PartId::FREELIST, true), start),
        }
    }

    /// Lock a victim for eviction. Returns the core line it holds on success.
    ///
    /// On success the line is write locked and the hash bucket of its core line is write locked unless the request
    /// already holds it.
    fn try_evict(
        &self,
        line: CacheLine,
        core_line: Option<CoreLine>,
        req: &Request,
        hash_locked: HashLocked<'_>,
    ) -> Option<CoreLine> {
        strict_assert!(core_line.is_some(), "line {line} of a user partition holds no core line");
        if !self.lines.try_lock_wr(line) {
            return None;
        }
        let Some(core_line) = core_line else {
            self.lines.unlock_wr(line);
            return None;
        };
        // The request holds the lines of its own range.
        if req.contains(&core_line) {
            self.lines.unlock_wr(line);
            return None;
        }
        let locked_by_req = hash_locked(req, core_line);
        if !locked_by_req && !self.buckets.try_lock_wr(core_line) {
            self.lines.unlock_wr(line);
            return None;
        }
        if self.lines.are_waiters(line) {
            if !locked_by_req {
                self.buckets.unlock_wr(core_line);
            }
            self.lines.unlock_wr(line);
            return None;
        }
        Some(core_line)
    }

    /// Take the next eviction victim and move it to partition `dst`.
    ///
    /// The victim is write locked and its hash bucket is locked unless `hash_locked` reports that `req` holds it. If
    /// `dst` is the source partition the victim is made hot instead.
    pub fn eviction_next(
        &self,
        iter: &mut EvictIter,
        dst: PartId,
        req: &Request,
        hash_locked: HashLocked<'_>,
    ) -> Option<(CacheLine, CoreLine)> {
        let src = iter.src;
        next_line(&mut iter.mask, |lru| {
            let mut shard = self.shards[lru].write();
            let mut cursor = shard.list(src, true).tail();
            let found = loop {
                let line = cursor?;
                let meta = shard.lines.meta(line);
                if let Some(core_line) = self.try_evict(line, meta.core, req, hash_locked) {
                    break (line, core_line);
                }
                cursor = meta.node.prev;
            };
            if dst != src {
                self.repart_locked(&mut shard, found.0, src, dst);
            } else {
                shard.set_hot(found.0);
            }
            Some(found)
        })
    }

    /// Take the next free line and move it to partition `dst`. The line is write locked.
    pub fn free_next(&self, iter: &mut FreeIter, dst: PartId) -> Option<CacheLine> {
        next_line(&mut iter.mask, |lru| {
            let mut shard = self.shards[lru].write();
            let mut cursor = shard.list(PartId::FREELIST, true).tail();
            let line = loop {
                let line = cursor?;
                if self.lines.try_lock_wr(line) {
                    break line;
                }
                cursor = shard.lines.node(line).prev;
            };
            self.repart_locked(&mut shard, line, PartId::FREELIST, dst);
            Some(line)
        })
    }

    /// Assign up to `count` lines taken from partition `src` to the missed core lines of a request.
    ///
    /// Lines come from the freelist if `src` is [`PartId::FREELIST`], otherwise they are evicted from the user
    /// partition `src`. Assigned lines join the request's partition, stay write locked and their map entries become
    /// [`LookupStatus::Remapped`]. The caller holds the hash buckets of the request's range.
    ///
    /// Returns the number of lines assigned.
    pub fn req_clines(
        &self,
        req: &mut Request,
        src: PartId,
        count: u32,
        queue: &IoQueue,
        hash_locked: HashLocked<'_>,
    ) -> u32 {
        if count == 0 {
            return 0;
        }
        let dst = req.part_id();
        assert!(req.unmapped_count() >= count as usize, "more lines requested than the request misses");
        assert!(dst.is_user(), "request must target a user partition");

        let start = queue.next_lru_idx();
        let mut evict = src.is_user().then(|| self.evict_iter(src, start));
        let mut free = (!src.is_user()).then(|| self.free_iter(start));

        let mut assigned = 0;
        let mut req_idx = 0;
        while assigned < count {
            let (line, evicted) = match (&mut evict, &mut free) {
                (Some(iter), _) => match self.eviction_next(iter, dst, &*req, hash_locked) {
                    Some((line, core_line)) => (line, Some(core_line)),
                    None => break,
                },
                (None, Some(iter)) => match self.free_next(iter, dst) {
                    Some(line) => (line, None),
                    None => break,
                },
                (None, None) => unreachable!(),
            };
            strict_assert!(!self.is_dirty(line));

            while req_idx + 1 < req.core_line_count() && req.map()[req_idx].status != LookupStatus::Miss {
                req_idx += 1;
            }
            strict_assert_eq!(req.map()[req_idx].status, LookupStatus::Miss);
            let core_line = req.map()[req_idx].core_line;

            if let Some(evicted) = evicted {
                if !hash_locked(&*req, evicted) {
                    self.buckets.unlock_wr(evicted);
                }
                self.metrics.lru_evict.increase(1);
            } else {
                self.metrics.lru_free_assign.increase(1);
            }
            self.shard(line).write().lines.meta_mut(line).core = Some(core_line);
            req.remap(req_idx, line);

            req_idx += 1;
            assigned += 1;
        }

        if free.is_some() {
            self.metrics.free_lines.absolute(self.num_free() as u64);
        }
        assigned
    }

    /// Hand out up to `min(count, EVICTION_CLEAN_SIZE)` dirty lines of `part`, least recently used first.
    ///
    /// Returns `None` if cleaning of the partition is frozen or already running, or if no dirty line can be read
    /// locked. The shards are all locked while the lines are gathered.
    pub fn clean(&self, part: PartId, queue: &IoQueue, count: usize) -> Option<CleaningBatch> {
        assert!(part.is_user(), "only user partitions are cleaned");
        let runtime = self.runtime(part).clone();
        match runtime.cleaning().inc() {
            0 => return None,
            1 => {}
            _ => {
                runtime.cleaning().dec();
                return None;
            }
        }

        let start = queue.next_lru_idx();
        let count = count.min(EVICTION_CLEAN_SIZE);
        let lines = {
            let shards = self.lock_all();
            let mut cursors = shards.iter().map(|shard| shard.list(part, false).tail()).collect_vec();
            let nonempty = cursors
                .iter()
                .enumerate()
                .filter(|(_, cursor)| cursor.is_some())
                .fold(0, |mask, (lru, _)| mask | 1 << lru);
            let mut mask = RotatingMask::new(nonempty, start);

            let mut lines = Vec::with_capacity(count);
            while lines.len() < count {
                let found = next_line(&mut mask, |lru| {
                    let shard = &shards[lru];
                    while let Some(line) = cursors[lru] {
                        cursors[lru] = shard.lines.node(line).prev;
                        if self.lines.try_lock_rd(line) {
                            return Some(line);
                        }
                    }
                    None
                });
                match found {
                    Some(line) => lines.push(line),
                    None => break,
                }
            }
            lines
        };

        if lines.is_empty() {
            runtime.cleaning().dec();
            return None;
        }

        self.metrics.lru_clean.increase(lines.len() as u64);
        self.metrics.lru_clean_batch_size.record(lines.len() as f64);
        tracing::trace!("[lru]: gather {} dirty lines of partition {part} for cleaning", lines.len());

        Some(CleaningBatch {
            part,
            lines,
            runtime,
            concurrency: self.lines.clone(),
        })
    }

    /// Lines of one list from head to tail.
    #[cfg(test)]
    fn dump(&self, lru: usize, part: PartId, clean: bool) -> Vec<CacheLine> {
        let shard = self.shards[lru].read();
        shard.list(part, clean).dump(&shard.lines)
    }
}

fn part_id(id: u16) -> PartId {
    match PartId::user(id) {
        Some(part) => part,
        None if id == PartId::FREELIST.get() => PartId::FREELIST,
        None => PartId::UNSPECIFIED,
    }
}
