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

//! Lock collaborators of the eviction engine.
//!
//! The engine never blocks on a cache line or a hash bucket. It only try-locks them while it walks the LRU lists, and
//! skips whatever is busy.

use std::{
    fmt::Debug,
    sync::atomic::{AtomicBool, AtomicI32, Ordering},
};

use casline_common::{
    code::{CacheLine, CoreLine, HASH_PRIME},
    error::{Error, Result},
    request::Request,
};
use itertools::Itertools;

/// Per cache line reader/writer locks.
pub trait LineConcurrency: Send + Sync + Debug + 'static {
    /// Try to take the write lock of a cache line.
    fn try_lock_wr(&self, line: CacheLine) -> bool;

    /// Release the write lock of a cache line.
    fn unlock_wr(&self, line: CacheLine);

    /// Try to take a read lock of a cache line.
    fn try_lock_rd(&self, line: CacheLine) -> bool;

    /// Release a read lock of a cache line.
    fn unlock_rd(&self, line: CacheLine);

    /// Returns true if requests are queued on the cache line.
    fn are_waiters(&self, line: CacheLine) -> bool;
}

/// Write locks of the hash buckets that map core lines to cache lines.
pub trait BucketConcurrency: Send + Sync + Debug + 'static {
    /// Try to take the write lock of the bucket of a core line.
    fn try_lock_wr(&self, core_line: CoreLine) -> bool;

    /// Release the write lock of the bucket of a core line.
    fn unlock_wr(&self, core_line: CoreLine);
}

/// Reports whether the request driving an eviction already holds the bucket lock of a core line.
pub type HashLocked<'a> = &'a dyn Fn(&Request, CoreLine) -> bool;

/// Atomic reader/writer lock per cache line.
///
/// `0` is unlocked, a positive value counts readers, `-1` is a writer. There is no waiter queue, so
/// [`LineConcurrency::are_waiters`] always returns false.
#[derive(Debug)]
pub struct LineLocks {
    states: Box<[AtomicI32]>,
}

impl LineLocks {
    const WRITER: i32 = -1;

    /// Create unlocked locks for `cachelines` cache lines.
    pub fn new(cachelines: u32) -> Self {
        Self {
            states: (0..cachelines).map(|_| AtomicI32::new(0)).collect(),
        }
    }

    fn state(&self, line: CacheLine) -> &AtomicI32 {
        &self.states[line.index()]
    }

    /// Returns true if the cache line is locked in any mode.
    pub fn is_locked(&self, line: CacheLine) -> bool {
        self.state(line).load(Ordering::Acquire) != 0
    }
}

impl LineConcurrency for LineLocks {
    fn try_lock_wr(&self, line: CacheLine) -> bool {
        self.state(line)
            .compare_exchange(0, Self::WRITER, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    fn unlock_wr(&self, line: CacheLine) {
        let prev = self.state(line).swap(0, Ordering::Release);
        assert_eq!(prev, Self::WRITER, "cache line {line} is not write locked");
    }

    fn try_lock_rd(&self, line: CacheLine) -> bool {
        self.state(line)
            .fetch_update(Ordering::Acquire, Ordering::Relaxed, |v| (v >= 0).then_some(v + 1))
            .is_ok()
    }

    fn unlock_rd(&self, line: CacheLine) {
        let prev = self.state(line).fetch_sub(1, Ordering::Release);
        assert!(prev > 0, "cache line {line} is not read locked");
    }

    fn are_waiters(&self, _: CacheLine) -> bool {
        false
    }
}

/// Hash bucket write locks, one flag per bucket.
#[derive(Debug)]
pub struct BucketLocks {
    buckets: Box<[AtomicBool]>,
}

impl BucketLocks {
    /// Create `buckets` unlocked bucket locks.
    ///
    /// # Panics
    ///
    /// Panics if `buckets` is zero.
    pub fn new(buckets: usize) -> Self {
        assert!(buckets > 0, "bucket count must be positive");
        Self {
            buckets: (0..buckets).map(|_| AtomicBool::new(false)).collect(),
        }
    }

    /// Bucket index of a core line.
    pub fn bucket_of(&self, core_line: CoreLine) -> usize {
        let hash = core_line
            .line
            .wrapping_mul(HASH_PRIME)
            .wrapping_add(core_line.core_id.get() as u64);
        (hash % self.buckets.len() as u64) as usize
    }

    /// Sorted, deduplicated buckets of the core lines of a request.
    pub fn request_buckets(&self, req: &Request) -> Vec<usize> {
        req.core_lines().map(|cl| self.bucket_of(cl)).sorted_unstable().dedup().collect()
    }

    /// Returns true if the bucket of `core_line` is one of the buckets of the request.
    ///
    /// Used as the [`HashLocked`] callback while the request holds all its buckets.
    pub fn hash_in_range(&self, req: &Request, core_line: CoreLine) -> bool {
        let bucket = self.bucket_of(core_line);
        req.core_lines().any(|cl| self.bucket_of(cl) == bucket)
    }

    fn try_lock_bucket(&self, bucket: usize) -> bool {
        self.buckets[bucket]
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    fn unlock_bucket(&self, bucket: usize) {
        let prev = self.buckets[bucket].swap(false, Ordering::Release);
        assert!(prev, "hash bucket {bucket} is not locked");
    }

    /// Take the write locks of every bucket of a request, in ascending bucket order.
    ///
    /// Either all buckets are locked or none is: on a busy bucket the ones already taken are released and
    /// [`Error::no_lock`] is returned.
    pub fn try_lock_request(&self, req: &Request) -> Result<()> {
        let buckets = self.request_buckets(req);
        for (i, &bucket) in buckets.iter().enumerate() {
            if !self.try_lock_bucket(bucket) {
                buckets[..i].iter().for_each(|&b| self.unlock_bucket(b));
                return Err(Error::no_lock().with_context("bucket", bucket));
            }
        }
        Ok(())
    }

    /// Release the write locks taken by [`BucketLocks::try_lock_request`].
    pub fn unlock_request(&self, req: &Request) {
        self.request_buckets(req)
            .into_iter()
            .for_each(|bucket| self.unlock_bucket(bucket));
    }
}

impl BucketConcurrency for BucketLocks {
    fn try_lock_wr(&self, core_line: CoreLine) -> bool {
        self.try_lock_bucket(self.bucket_of(core_line))
    }

    fn unlock_wr(&self, core_line: CoreLine) {
        self.unlock_bucket(self.bucket_of(core_line))
    }
}
