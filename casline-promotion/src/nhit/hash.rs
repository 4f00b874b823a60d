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

//! Hit history of core lines for the n-hit promotion policy.
//!
//! Keys live in a fixed ring of slots that is recycled in FIFO order: every insert claims the slot under the ring
//! pointer, unlinks whatever key the slot held before, and links the new key into its bucket chain. Lookups only
//! take the read lock of the key's bucket and bump the hit counter atomically.

use std::{
    mem::size_of,
    sync::{
        atomic::{AtomicI32, AtomicU16, AtomicU32, AtomicU64, Ordering},
        Arc,
    },
};

use casline_common::{
    code::{CoreId, HASH_PRIME},
    error::{Error, Result},
    metrics::Metrics,
    strict_assert, strict_assert_eq,
};
use parking_lot::{Mutex, RwLock, RwLockWriteGuard};

/// Index of an occupied-or-free ring slot.
///
/// Always addresses a real slot. The "no slot" state of chain links and bucket heads is `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SlotIdx(u32);

impl SlotIdx {
    fn index(self) -> usize {
        self.0 as usize
    }
}

/// Chain link stored in a slot, encoded as a raw index with a private "none" value.
#[derive(Debug)]
struct AtomicLink(AtomicU32);

impl AtomicLink {
    const NONE: u32 = u32::MAX;

    fn none() -> Self {
        Self(AtomicU32::new(Self::NONE))
    }

    fn load(&self) -> Option<SlotIdx> {
        match self.0.load(Ordering::Relaxed) {
            Self::NONE => None,
            raw => Some(SlotIdx(raw)),
        }
    }

    fn store(&self, link: Option<SlotIdx>) {
        self.0.store(link.map(|s| s.0).unwrap_or(Self::NONE), Ordering::Relaxed);
    }
}

/// One ring slot.
///
/// Key and links are mutated only while holding the write lock of the bucket the slot is chained into. The counter
/// is also bumped under the read lock.
#[derive(Debug)]
struct Slot {
    core_lba: AtomicU64,
    core_id: AtomicU16,
    counter: AtomicI32,
    prev: AtomicLink,
    next: AtomicLink,
}

impl Slot {
    fn empty() -> Self {
        Self {
            core_lba: AtomicU64::new(0),
            core_id: AtomicU16::new(CoreId::INVALID_RAW),
            counter: AtomicI32::new(0),
            prev: AtomicLink::none(),
            next: AtomicLink::none(),
        }
    }

    fn key(&self) -> (Option<CoreId>, u64) {
        (
            CoreId::from_raw(self.core_id.load(Ordering::Relaxed)),
            self.core_lba.load(Ordering::Relaxed),
        )
    }
}

/// Ring pointer and per-slot "free for claim" bits, guarded together.
#[derive(Debug)]
struct Ring {
    pointer: usize,
    free: Vec<bool>,
}

type Bucket = RwLock<Option<SlotIdx>>;

/// Write guards of the one or two buckets an insert touches, taken in ascending bucket order.
struct BucketGuards<'a> {
    first: (usize, RwLockWriteGuard<'a, Option<SlotIdx>>),
    second: Option<(usize, RwLockWriteGuard<'a, Option<SlotIdx>>)>,
}

impl BucketGuards<'_> {
    fn head(&mut self, bucket: usize) -> &mut Option<SlotIdx> {
        match &mut self.second {
            Some((b, guard)) if *b == bucket => guard,
            _ => {
                strict_assert_eq!(self.first.0, bucket);
                &mut self.first.1
            }
        }
    }
}

/// Hit history keyed by `(core id, core line)`.
#[derive(Debug)]
pub struct NhitHash {
    buckets: Box<[Bucket]>,
    slots: Box<[Slot]>,
    ring: Mutex<Ring>,
    metrics: Arc<Metrics>,
}

impl NhitHash {
    /// Number of buckets for a ring of `hash_size` slots.
    ///
    /// Rounded up to a multiple of [`HASH_PRIME`] minus one, at about four slots per bucket.
    pub fn hash_entries(hash_size: u64) -> u64 {
        (hash_size / 4).div_ceil(HASH_PRIME).max(1) * HASH_PRIME - 1
    }

    /// Bucket of a key. Returns `limit` for an absent core id, which never addresses a real bucket.
    pub fn hash_function(core_id: Option<CoreId>, core_lba: u64, limit: u64) -> u64 {
        match core_id {
            None => limit,
            Some(core_id) => core_lba.wrapping_mul(HASH_PRIME).wrapping_add(core_id.get() as u64) % limit,
        }
    }

    /// Exact number of bytes [`NhitHash::new`] allocates for a ring of `hash_size` slots.
    pub fn sizeof_estimate(hash_size: u64) -> u64 {
        size_of::<Self>() as u64
            + Self::hash_entries(hash_size) * size_of::<Bucket>() as u64
            + hash_size * size_of::<Slot>() as u64
            + hash_size * size_of::<bool>() as u64
    }

    /// Create a hit history with `hash_size` ring slots, all free.
    pub fn new(hash_size: u64, metrics: Arc<Metrics>) -> Result<Self> {
        if hash_size == 0 || hash_size >= AtomicLink::NONE as u64 {
            return Err(Error::invalid("hit history size out of range").with_context("hash_size", hash_size));
        }
        let hash_entries = Self::hash_entries(hash_size) as usize;
        let hash_size = hash_size as usize;

        let buckets = try_alloc(hash_entries, |_| RwLock::new(None))?;
        let slots = try_alloc(hash_size, |_| Slot::empty())?;
        let mut free = Vec::new();
        free.try_reserve_exact(hash_size)?;
        free.resize(hash_size, true);

        tracing::debug!("[nhit]: create hit history with {hash_size} slots and {hash_entries} buckets");

        Ok(Self {
            buckets,
            slots,
            ring: Mutex::new(Ring { pointer: 0, free }),
            metrics,
        })
    }

    /// Number of ring slots.
    pub fn rb_entries(&self) -> usize {
        self.slots.len()
    }

    /// Number of buckets.
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    fn bucket_of(&self, core_id: Option<CoreId>, core_lba: u64) -> Option<usize> {
        let limit = self.buckets.len() as u64;
        let bucket = Self::hash_function(core_id, core_lba, limit);
        (bucket < limit).then_some(bucket as usize)
    }

    fn slot(&self, idx: SlotIdx) -> &Slot {
        &self.slots[idx.index()]
    }

    /// Walk the chain starting at `head`. The caller holds a lock on the chain's bucket.
    fn find(&self, head: Option<SlotIdx>, core_id: CoreId, core_lba: u64) -> Option<SlotIdx> {
        let mut cursor = head;
        let mut steps = 0;
        while let Some(idx) = cursor {
            let slot = self.slot(idx);
            if slot.key() == (Some(core_id), core_lba) {
                return Some(idx);
            }
            cursor = slot.next.load();
            steps += 1;
            strict_assert!(steps <= self.slots.len(), "cycle in collision chain");
        }
        None
    }

    /// Look up a key and bump its hit counter. Returns the counter after the bump, saturated at `i32::MAX`.
    pub fn query(&self, core_id: CoreId, core_lba: u64) -> Option<i32> {
        let bucket = self.bucket_of(Some(core_id), core_lba)?;
        let head = self.buckets[bucket].read();
        match self.find(*head, core_id, core_lba) {
            Some(idx) => {
                self.metrics.nhit_hit.increase(1);
                let counter = &self.slot(idx).counter;
                let (Ok(prev) | Err(prev)) =
                    counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |c| Some(c.saturating_add(1)));
                Some(prev.saturating_add(1))
            }
            None => {
                self.metrics.nhit_miss.increase(1);
                None
            }
        }
    }

    /// Overwrite the hit counter of a key. Returns false if the key is not tracked.
    pub fn set_occurrences(&self, core_id: CoreId, core_lba: u64, occurrences: i32) -> bool {
        let Some(bucket) = self.bucket_of(Some(core_id), core_lba) else {
            return false;
        };
        let head = self.buckets[bucket].read();
        match self.find(*head, core_id, core_lba) {
            Some(idx) => {
                self.slot(idx).counter.store(occurrences, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    /// Write-lock bucket `a` and, if present and different, bucket `b`, always in ascending index order.
    ///
    /// Every path that holds two bucket locks at once goes through here, so two inserts can never wait on each
    /// other's buckets.
    fn lock_ordered(&self, a: usize, b: Option<usize>) -> BucketGuards<'_> {
        match b {
            Some(b) if b != a => {
                let (lo, hi) = if a < b { (a, b) } else { (b, a) };
                let first = (lo, self.buckets[lo].write());
                let second = Some((hi, self.buckets[hi].write()));
                BucketGuards { first, second }
            }
            _ => BucketGuards {
                first: (a, self.buckets[a].write()),
                second: None,
            },
        }
    }

    /// Claim the slot under the ring pointer and advance the pointer.
    ///
    /// Returns `None` if the previous insert into that slot has not committed yet. The pointer moves on either way, so
    /// a stalled insert costs one dropped key instead of blocking the ring.
    fn claim(&self) -> Option<SlotIdx> {
        let mut ring = self.ring.lock();
        let pointer = ring.pointer;
        ring.pointer = (pointer + 1) % ring.free.len();
        if !ring.free[pointer] {
            return None;
        }
        ring.free[pointer] = false;
        Some(SlotIdx(pointer as u32))
    }

    fn commit(&self, idx: SlotIdx) {
        self.ring.lock().free[idx.index()] = true;
    }

    /// Record a key as seen once, recycling the oldest slot.
    ///
    /// Best effort: if the ring has lapped an insert that is still in flight, the key is dropped and `false` is
    /// returned.
    pub fn insert(&self, core_id: CoreId, core_lba: u64) -> bool {
        let Some(idx) = self.claim() else {
            tracing::trace!("[nhit]: ring slot busy, drop insert of {core_id}:{core_lba}");
            self.metrics.nhit_drop.increase(1);
            return false;
        };
        let slot = self.slot(idx);

        let (old_core_id, old_core_lba) = slot.key();
        let old_bucket = self.bucket_of(old_core_id, old_core_lba);
        // A valid core id always maps into range.
        let Some(new_bucket) = self.bucket_of(Some(core_id), core_lba) else {
            self.commit(idx);
            return false;
        };

        let mut guards = self.lock_ordered(new_bucket, old_bucket);

        if let Some(old_bucket) = old_bucket {
            self.unlink(&mut guards, old_bucket, idx);
            slot.core_id.store(CoreId::INVALID_RAW, Ordering::Relaxed);
        }

        slot.core_id.store(core_id.get(), Ordering::Relaxed);
        slot.core_lba.store(core_lba, Ordering::Relaxed);
        let head = guards.head(new_bucket);
        slot.prev.store(None);
        slot.next.store(*head);
        if let Some(old_head) = *head {
            self.slot(old_head).prev.store(Some(idx));
        }
        *head = Some(idx);
        slot.counter.store(1, Ordering::Relaxed);

        drop(guards);
        self.commit(idx);
        self.metrics.nhit_insert.increase(1);
        true
    }

    fn unlink(&self, guards: &mut BucketGuards<'_>, bucket: usize, idx: SlotIdx) {
        let slot = self.slot(idx);
        let prev = slot.prev.load();
        let next = slot.next.load();
        match prev {
            Some(prev) => self.slot(prev).next.store(next),
            None => {
                let head = guards.head(bucket);
                strict_assert_eq!(*head, Some(idx));
                *head = next;
            }
        }
        if let Some(next) = next {
            self.slot(next).prev.store(prev);
        }
        slot.prev.store(None);
        slot.next.store(None);
    }
}

fn try_alloc<T>(len: usize, f: impl FnMut(usize) -> T) -> Result<Box<[T]>> {
    let mut v = Vec::new();
    v.try_reserve_exact(len)?;
    v.extend((0..len).map(f));
    Ok(v.into_boxed_slice())
}
