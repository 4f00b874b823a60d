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

//! Partitions and LRU eviction for casline.
//!
//! Cache lines are spread over [`NUM_LRU_LISTS`] shards. Each partition owns one clean and one dirty LRU list per
//! shard, and the freelist partition holds every line that is not assigned yet. [`Space`] moves lines between those
//! lists, hands out victims for new data and dirty lines for cleaning.

mod concurrency;
mod iter;
mod list;
mod partition;
mod space;

#[cfg(any(test, feature = "test_utils"))]
pub mod test_utils;

pub use concurrency::{BucketConcurrency, BucketLocks, HashLocked, LineConcurrency, LineLocks};
pub use iter::{RotatingMask, NUM_LRU_LISTS};
pub use list::{LruList, LruNode, LRU_HOT_RATIO};
pub use partition::{
    CacheMode, IoClassConfig, PartitionFlags, PartitionInfo, PartitionRuntime, PartitionTable, RefCount,
    DEFAULT_PARTITION_NAME, INACTIVE_PARTITION_NAME, IO_CLASS_NAME_MAX, IO_CLASS_PRIO_HIGHEST, IO_CLASS_PRIO_LOWEST,
    PARTITION_SIZE_MAX,
};
pub use space::{CleaningBatch, EvictIter, FreeIter, IoQueue, Space, EVICTION_CLEAN_SIZE};
