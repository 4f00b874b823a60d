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

//! Utilities for testing.

use std::collections::{HashMap, HashSet};

use casline_common::code::{CacheLine, CoreLine};
use parking_lot::Mutex;

use crate::concurrency::{BucketConcurrency, LineConcurrency};

/// Cache line locks that record their state and can be told to refuse.
#[derive(Debug, Default)]
pub struct MockLines {
    written: Mutex<HashSet<CacheLine>>,
    read: Mutex<HashMap<CacheLine, u32>>,
    waiters: Mutex<HashSet<CacheLine>>,
}

impl MockLines {
    /// Write lock a line on behalf of someone else.
    pub fn set_busy(&self, line: CacheLine) {
        self.written.lock().insert(line);
    }

    /// Report queued requests on a line.
    pub fn set_waiters(&self, line: CacheLine) {
        self.waiters.lock().insert(line);
    }

    /// Returns true if the line is write locked.
    pub fn is_write_locked(&self, line: CacheLine) -> bool {
        self.written.lock().contains(&line)
    }

    /// Number of read locks held on the line.
    pub fn read_count(&self, line: CacheLine) -> u32 {
        self.read.lock().get(&line).copied().unwrap_or_default()
    }
}

impl LineConcurrency for MockLines {
    fn try_lock_wr(&self, line: CacheLine) -> bool {
        if self.read_count(line) > 0 {
            return false;
        }
        self.written.lock().insert(line)
    }

    fn unlock_wr(&self, line: CacheLine) {
        assert!(self.written.lock().remove(&line), "line {line} is not write locked");
    }

    fn try_lock_rd(&self, line: CacheLine) -> bool {
        if self.is_write_locked(line) {
            return false;
        }
        *self.read.lock().entry(line).or_default() += 1;
        true
    }

    fn unlock_rd(&self, line: CacheLine) {
        let mut read = self.read.lock();
        let count = read.get_mut(&line).expect("line is not read locked");
        *count -= 1;
        if *count == 0 {
            read.remove(&line);
        }
    }

    fn are_waiters(&self, line: CacheLine) -> bool {
        self.waiters.lock().contains(&line)
    }
}

/// Hash bucket locks with one bucket per core line.
#[derive(Debug, Default)]
pub struct MockBuckets {
    locked: Mutex<HashSet<CoreLine>>,
}

impl MockBuckets {
    /// Lock the bucket of a core line on behalf of someone else.
    pub fn set_busy(&self, core_line: CoreLine) {
        self.locked.lock().insert(core_line);
    }

    /// Returns true if the bucket of the core line is locked.
    pub fn is_locked(&self, core_line: CoreLine) -> bool {
        self.locked.lock().contains(&core_line)
    }
}

impl BucketConcurrency for MockBuckets {
    fn try_lock_wr(&self, core_line: CoreLine) -> bool {
        self.locked.lock().insert(core_line)
    }

    fn unlock_wr(&self, core_line: CoreLine) {
        assert!(self.locked.lock().remove(&core_line), "bucket of {core_line:?} is not locked");
    }
}
