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

use std::{fmt::Debug, sync::Arc};

use casline_common::{
    async_lock::AsyncRwLock,
    code::{CacheLine, CoreLine, PartId},
    error::{Error, Result},
    metrics::Metrics,
    request::{LookupStatus, Request},
    status::CacheStatus,
};
use casline_promotion::{NhitConfig, Promotion, PromotionConfig, PromotionConfigSnapshot, PromotionPolicyKind};
use casline_space::{
    BucketLocks, CleaningBatch, IoClassConfig, IoQueue, LineConcurrency, LineLocks, PartitionFlags, PartitionInfo,
    PartitionTable, Space,
};
use itertools::Itertools;
use mixtrics::{
    metrics::{BoxedRegistry, RegistryOps},
    registry::noop::NoopMetricsRegistry,
};
use parking_lot::RwLock;

/// Default cache line size, 4 KiB.
pub const DEFAULT_LINE_SIZE: u64 = 4096;

/// Occupancy view handed to promotion policies.
#[derive(Debug)]
struct Status {
    line_size: u64,
    space: Arc<Space>,
}

impl CacheStatus for Status {
    fn line_size(&self) -> u64 {
        self.line_size
    }

    fn cachelines_count(&self) -> u64 {
        self.space.cachelines() as u64
    }

    fn free_cachelines_count(&self) -> u64 {
        self.space.num_free() as u64
    }
}

/// Builder of a [`Cache`].
pub struct CacheBuilder {
    name: &'static str,
    cachelines: u32,
    line_size: u64,
    promotion: PromotionConfigSnapshot,
    io_classes: Vec<IoClassConfig>,
    hash_buckets: Option<usize>,
    registry: BoxedRegistry,
}

impl Debug for CacheBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheBuilder")
            .field("name", &self.name)
            .field("cachelines", &self.cachelines)
            .field("line_size", &self.line_size)
            .field("promotion", &self.promotion)
            .field("io_classes", &self.io_classes)
            .field("hash_buckets", &self.hash_buckets)
            .finish()
    }
}

impl CacheBuilder {
    /// Create a builder for a cache of `cachelines` lines.
    pub fn new(cachelines: u32) -> Self {
        Self {
            name: "casline",
            cachelines,
            line_size: DEFAULT_LINE_SIZE,
            promotion: PromotionConfigSnapshot::default(),
            io_classes: vec![],
            hash_buckets: None,
            registry: Box::new(NoopMetricsRegistry),
        }
    }

    /// Set the name of the cache. Used as the metrics label.
    ///
    /// The default value is "casline".
    pub fn with_name(mut self, name: &'static str) -> Self {
        self.name = name;
        self
    }

    /// Set the cache line size in bytes. Must be a power of two.
    ///
    /// The default value is 4 KiB.
    pub fn with_line_size(mut self, line_size: u64) -> Self {
        self.line_size = line_size;
        self
    }

    /// Set the promotion policy the cache starts with.
    ///
    /// The default value is [`PromotionPolicyKind::Always`].
    pub fn with_promotion_policy(mut self, kind: PromotionPolicyKind) -> Self {
        self.promotion.kind = kind;
        self
    }

    /// Set the n-hit thresholds. They apply whenever the n-hit policy is active.
    pub fn with_nhit_config(mut self, config: NhitConfig) -> Self {
        self.promotion.nhit = config;
        self
    }

    /// Configure io classes on top of the default partition.
    pub fn with_io_classes(mut self, io_classes: impl IntoIterator<Item = IoClassConfig>) -> Self {
        self.io_classes = io_classes.into_iter().collect();
        self
    }

    /// Set the number of hash buckets guarding core line mappings.
    ///
    /// The default value is one bucket per cache line.
    pub fn with_hash_buckets(mut self, hash_buckets: usize) -> Self {
        self.hash_buckets = Some(hash_buckets);
        self
    }

    /// Set the metrics registry.
    ///
    /// The default value is a registry that drops every record.
    pub fn with_metrics_registry(mut self, registry: impl RegistryOps) -> Self {
        self.registry = Box::new(registry);
        self
    }

    /// Start the cache.
    ///
    /// Every line starts on the freelist.
    pub fn build(self) -> Result<Cache> {
        if self.cachelines == 0 {
            return Err(Error::invalid("cache must have at least one line"));
        }
        if !self.line_size.is_power_of_two() {
            return Err(
                Error::invalid("cache line size must be a power of two").with_context("line_size", self.line_size)
            );
        }
        if self.hash_buckets == Some(0) {
            return Err(Error::invalid("hash bucket count must be positive"));
        }
        self.promotion.nhit.validate()?;

        let metrics = Arc::new(Metrics::new(self.name, &self.registry));

        let mut partitions = PartitionTable::new();
        if !self.io_classes.is_empty() {
            partitions.configure(&self.io_classes)?;
        }

        let lines = Arc::new(LineLocks::new(self.cachelines));
        let buckets = Arc::new(BucketLocks::new(self.hash_buckets.unwrap_or(self.cachelines as usize)));
        let space = Arc::new(Space::new(
            self.cachelines,
            partitions.runtimes(),
            lines.clone(),
            buckets.clone(),
            metrics.clone(),
        )?);
        for part in PartId::users().chain([PartId::FREELIST]) {
            space.init_part(part);
        }
        space.populate(self.cachelines);

        let status: Arc<dyn CacheStatus> = Arc::new(Status {
            line_size: self.line_size,
            space: space.clone(),
        });
        let config = Arc::new(PromotionConfig::new(self.promotion.kind));
        Promotion::setup(&config);
        config.restore(&self.promotion)?;
        let promotion = Promotion::init(status.clone(), config, metrics.clone())?;

        partitions.sort();
        partitions.unfreeze_cleaning();

        tracing::info!(
            "[cache]: start cache '{}' with {} lines of {} bytes, promotion policy: '{}'",
            self.name,
            self.cachelines,
            self.line_size,
            promotion.kind().name()
        );

        Ok(Cache {
            inner: Arc::new(CacheInner {
                name: self.name,
                status,
                partitions: RwLock::new(partitions),
                space,
                promotion,
                lines,
                buckets,
                mngt: Arc::new(AsyncRwLock::new().with_metrics(metrics.clone())),
                queue: IoQueue::new(),
            }),
        })
    }
}

struct CacheInner {
    name: &'static str,
    status: Arc<dyn CacheStatus>,
    partitions: RwLock<PartitionTable>,
    space: Arc<Space>,
    promotion: Promotion,
    lines: Arc<LineLocks>,
    buckets: Arc<BucketLocks>,
    mngt: Arc<AsyncRwLock>,
    queue: IoQueue,
}

/// A cache instance: partitions, LRU eviction and promotion wired together.
///
/// Management operations are serialized by an [`AsyncRwLock`]: mutations take it exclusively, queries take it shared.
/// The I/O path helpers never wait on it.
#[derive(Clone)]
pub struct Cache {
    inner: Arc<CacheInner>,
}

impl Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("name", &self.inner.name)
            .field("space", &self.inner.space)
            .field("promotion", &self.inner.promotion.kind())
            .finish()
    }
}

impl CacheStatus for Cache {
    fn line_size(&self) -> u64 {
        self.inner.status.line_size()
    }

    fn cachelines_count(&self) -> u64 {
        self.inner.status.cachelines_count()
    }

    fn free_cachelines_count(&self) -> u64 {
        self.inner.status.free_cachelines_count()
    }
}

impl Cache {
    /// Name of the cache.
    pub fn name(&self) -> &'static str {
        self.inner.name
    }

    /// Number of lines on the freelist.
    pub fn num_free(&self) -> u32 {
        self.inner.space.num_free()
    }

    /// The LRU engine.
    pub fn space(&self) -> &Arc<Space> {
        &self.inner.space
    }

    /// Switch the promotion policy.
    ///
    /// If the new policy fails to initialize, the cache falls back to the `always` policy and the error is returned.
    pub async fn set_promotion_policy(&self, kind: PromotionPolicyKind) -> Result<()> {
        let _guard = self.inner.mngt.write().await?;
        self.inner.promotion.set_policy(kind)
    }

    /// Kind of the active promotion policy.
    pub async fn promotion_policy(&self) -> Result<PromotionPolicyKind> {
        let _guard = self.inner.mngt.read().await?;
        Ok(self.inner.promotion.kind())
    }

    /// Set a parameter of a promotion policy. The policy does not need to be active.
    pub async fn set_promotion_param(&self, kind: PromotionPolicyKind, param_id: u8, value: u32) -> Result<()> {
        let _guard = self.inner.mngt.write().await?;
        self.inner.promotion.set_param(kind, param_id, value)
    }

    /// Get a parameter of a promotion policy. The policy does not need to be active.
    pub async fn promotion_param(&self, kind: PromotionPolicyKind, param_id: u8) -> Result<u32> {
        let _guard = self.inner.mngt.read().await?;
        self.inner.promotion.get_param(kind, param_id)
    }

    /// Serializable copy of the promotion config.
    pub fn promotion_config(&self) -> PromotionConfigSnapshot {
        self.inner.promotion.config().snapshot()
    }

    /// Apply a batch of io class configs. Nothing is applied if any entry is rejected.
    ///
    /// The lines of a removed class move to the default partition.
    pub async fn configure_io_classes(&self, configs: &[IoClassConfig]) -> Result<()> {
        let _guard = self.inner.mngt.write().await?;
        let removed = {
            let mut partitions = self.inner.partitions.write();
            let removed = configs
                .iter()
                .filter(|config| config.name.is_none())
                .filter_map(|config| PartId::user(config.id))
                .filter(|&part| {
                    partitions
                        .get(part)
                        .is_some_and(|info| info.flags.contains(PartitionFlags::VALID))
                })
                .collect_vec();
            partitions.configure(configs)?;
            removed
        };
        for part in removed {
            let moved = self.inner.space.repart_all(part, PartId::DEFAULT);
            tracing::info!("[cache]: io class {part} removed, {moved} lines moved to the default class");
        }
        Ok(())
    }

    /// Configured view of every user partition.
    pub fn io_classes(&self) -> Vec<PartitionInfo> {
        self.inner.partitions.read().iter().cloned().collect()
    }

    /// Number of lines assigned to a partition.
    pub fn partition_size(&self, part: PartId) -> u32 {
        self.inner.partitions.read().runtime(part).curr_size()
    }

    /// Returns true if the core lines of a request should be admitted.
    pub fn should_promote(&self, req: &Request) -> bool {
        self.inner.promotion.req_should_promote(req)
    }

    /// Forget the access history of the core lines of a request.
    pub fn purge(&self, req: &Request) {
        self.inner.promotion.req_purge(req);
    }

    /// Partitions to evict from, in order: partitions that are no longer valid but still hold lines, those above
    /// their upper bound, then every eviction-eligible one.
    fn eviction_sources(&self) -> Vec<PartId> {
        let partitions = self.inner.partitions.read();
        let total = self.inner.space.cachelines();
        let stale = partitions
            .iter()
            .filter(|info| !info.flags.contains(PartitionFlags::VALID))
            .filter(|info| partitions.runtime(info.id).curr_size() > 0)
            .map(|info| info.id)
            .collect_vec();
        let (overflown, rest): (Vec<_>, Vec<_>) = partitions
            .eviction_order()
            .partition(|&part| partitions.overflow_size(part, total) > 0);
        stale.into_iter().chain(overflown).chain(rest).collect()
    }

    /// Assign cache lines to every missed core line of a request.
    ///
    /// Lines are taken from the freelist first, then evicted from other partitions. The request's hash buckets are
    /// locked for the duration of the call: if one of them is busy, nothing is assigned and [`Error::no_lock`] is
    /// returned. Assigned lines stay write locked until [`Cache::unlock_lines`].
    ///
    /// Returns the number of lines assigned, which is lower than the number of misses if not enough lines could be
    /// taken.
    pub fn assign_lines(&self, req: &mut Request) -> Result<usize> {
        let needed = req.unmapped_count() as u32;
        if needed == 0 {
            return Ok(0);
        }

        let inner = &self.inner;
        inner.buckets.try_lock_request(req)?;
        let hash_locked = |req: &Request, core_line: CoreLine| inner.buckets.hash_in_range(req, core_line);

        let mut assigned = inner
            .space
            .req_clines(req, PartId::FREELIST, needed, &inner.queue, &hash_locked);
        if assigned < needed {
            for part in self.eviction_sources() {
                assigned += inner
                    .space
                    .req_clines(req, part, needed - assigned, &inner.queue, &hash_locked);
                if assigned == needed {
                    break;
                }
            }
        }

        inner.buckets.unlock_request(req);
        if assigned < needed {
            tracing::debug!("[cache]: assigned {assigned} of {needed} lines to request");
        }
        Ok(assigned as usize)
    }

    /// Release the write locks of the lines assigned to a request.
    pub fn unlock_lines(&self, req: &Request) {
        req.map()
            .iter()
            .filter(|entry| entry.status == LookupStatus::Remapped)
            .filter_map(|entry| entry.cache_line)
            .for_each(|line| self.inner.lines.unlock_wr(line));
    }

    /// Move a line to the head of its LRU list.
    pub fn touch(&self, line: CacheLine) {
        self.inner.space.hot_cline(line);
    }

    /// Mark a line dirty.
    ///
    /// Returns false if the line is free or already dirty, in which case nothing changes.
    pub fn mark_dirty(&self, line: CacheLine) -> bool {
        self.inner.space.set_cline_dirty(line, true)
    }

    /// Mark a dirty line clean.
    ///
    /// Returns false if the line is free or already clean, in which case nothing changes.
    pub fn mark_clean(&self, line: CacheLine) -> bool {
        self.inner.space.set_cline_dirty(line, false)
    }

    /// Return a line to the freelist.
    pub fn invalidate(&self, line: CacheLine) {
        self.inner.space.rm_cline(line);
    }

    /// Hand out up to `count` dirty lines of a partition for cleaning.
    ///
    /// Returns `None` while a management operation holds the cache.
    pub fn clean(&self, part: PartId, count: usize) -> Option<CleaningBatch> {
        if self.inner.mngt.is_locked() {
            return None;
        }
        self.inner.space.clean(part, &self.inner.queue, count)
    }
}
