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

pub use casline_common::{
    async_lock::{AsyncRwLock, AsyncRwLockReadGuard, AsyncRwLockWriteGuard},
    code::{CacheLine, CoreId, CoreLine, PartId},
    error::{Error, ErrorKind, Result},
    metrics::Metrics,
    request::{LookupStatus, MapEntry, Request},
    status::CacheStatus,
};
pub use casline_promotion::{
    nhit::{NHIT_MAX_THRESHOLD, NHIT_MIN_THRESHOLD, NHIT_TRIGGER_MAX, NHIT_TRIGGER_MIN},
    NhitConfig, NhitParam, PromotionConfigSnapshot, PromotionPolicyKind,
};
pub use casline_space::{
    CacheMode, CleaningBatch, IoClassConfig, PartitionFlags, PartitionInfo, Space, DEFAULT_PARTITION_NAME,
    IO_CLASS_PRIO_HIGHEST, IO_CLASS_PRIO_LOWEST, NUM_LRU_LISTS, PARTITION_SIZE_MAX,
};
#[cfg(feature = "prometheus")]
pub use mixtrics::registry::prometheus::PrometheusMetricsRegistry;
pub use mixtrics::{metrics::RegistryOps, registry::noop::NoopMetricsRegistry};

pub use crate::cache::{Cache, CacheBuilder, DEFAULT_LINE_SIZE};
