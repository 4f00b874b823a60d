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

//! Io classes (partitions): named, bounded shares of the cache capacity.

use std::sync::{
    atomic::{AtomicI32, AtomicU32, Ordering},
    Arc,
};

use bitflags::bitflags;
use casline_common::{
    code::PartId,
    error::{Error, Result},
    strict_assert,
};
use itertools::Itertools;
use serde::{Deserialize, Serialize};

/// Upper bound of partition size bounds, in percent of the cache.
pub const PARTITION_SIZE_MAX: u32 = 100;
/// Exclusive upper bound of an io class name length, in bytes.
pub const IO_CLASS_NAME_MAX: usize = 1024;
/// Highest io class priority.
pub const IO_CLASS_PRIO_HIGHEST: i16 = 0;
/// Lowest io class priority.
pub const IO_CLASS_PRIO_LOWEST: i16 = 255;

/// Name of the always present default partition.
pub const DEFAULT_PARTITION_NAME: &str = "unclassified";
/// Name of user partition slots that are not configured.
pub const INACTIVE_PARTITION_NAME: &str = "Inactive";

/// Cache mode override of an io class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheMode {
    /// Write-through.
    WriteThrough,
    /// Write-back.
    WriteBack,
    /// Write-around.
    WriteAround,
    /// Pass-through.
    PassThrough,
    /// Write-invalidate.
    WriteInvalidate,
    /// Write-only.
    WriteOnly,
    /// No override, the cache-wide mode applies.
    #[default]
    Unset,
}

const CACHE_MODE_NAMES: [(CacheMode, &str); 7] = [
    (CacheMode::WriteThrough, "wt"),
    (CacheMode::WriteBack, "wb"),
    (CacheMode::WriteAround, "wa"),
    (CacheMode::PassThrough, "pt"),
    (CacheMode::WriteInvalidate, "wi"),
    (CacheMode::WriteOnly, "wo"),
    (CacheMode::Unset, "none"),
];

impl CacheMode {
    /// Short name of the cache mode.
    pub fn name(self) -> &'static str {
        CACHE_MODE_NAMES
            .iter()
            .find_map(|&(mode, name)| (mode == self).then_some(name))
            .unwrap_or("none")
    }

    /// Parse a short name.
    pub fn from_name(name: &str) -> Option<Self> {
        CACHE_MODE_NAMES
            .iter()
            .find_map(|&(mode, n)| (n == name).then_some(mode))
    }
}

bitflags! {
    /// State flags of a partition.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PartitionFlags: u8 {
        /// Configured and allowed to receive data.
        const VALID = 0b0000_0001;
        /// Added to the cache by configuration.
        const ADDED = 0b0000_0010;
        /// The eviction engine may take lines from this partition.
        const EVICTION = 0b0000_0100;
    }
}

/// Reference counter that can be frozen.
///
/// While frozen, [`RefCount::inc`] fails and leaves the count untouched. Freezing nests.
#[derive(Debug, Default)]
pub struct RefCount {
    counter: AtomicI32,
    freeze: AtomicI32,
}

impl RefCount {
    /// Take a reference. Returns the new count, or `0` if the counter is frozen.
    pub fn inc(&self) -> i32 {
        if self.frozen() {
            return 0;
        }
        let ret = self.counter.fetch_add(1, Ordering::AcqRel) + 1;
        if !self.frozen() {
            return ret;
        }
        // Frozen in the meantime, back out.
        self.counter.fetch_sub(1, Ordering::AcqRel);
        0
    }

    /// Drop a reference. Returns the new count.
    pub fn dec(&self) -> i32 {
        let ret = self.counter.fetch_sub(1, Ordering::AcqRel) - 1;
        assert!(ret >= 0, "reference counter underflow");
        ret
    }

    /// Current count.
    pub fn count(&self) -> i32 {
        self.counter.load(Ordering::Acquire)
    }

    /// Forbid new references.
    pub fn freeze(&self) {
        self.freeze.fetch_add(1, Ordering::AcqRel);
    }

    /// Undo one [`RefCount::freeze`].
    pub fn unfreeze(&self) {
        let ret = self.freeze.fetch_sub(1, Ordering::AcqRel) - 1;
        assert!(ret >= 0, "unfreeze of a reference counter that is not frozen");
    }

    /// Returns true if the counter is frozen.
    pub fn frozen(&self) -> bool {
        self.freeze.load(Ordering::Acquire) != 0
    }
}

/// Runtime bookkeeping of a partition, shared with the eviction engine.
#[derive(Debug, Default)]
pub struct PartitionRuntime {
    curr_size: AtomicU32,
    cleaning: RefCount,
}

impl PartitionRuntime {
    /// Number of cache lines assigned to the partition.
    pub fn curr_size(&self) -> u32 {
        self.curr_size.load(Ordering::Relaxed)
    }

    pub(crate) fn set_curr_size(&self, size: u32) {
        self.curr_size.store(size, Ordering::Relaxed);
    }

    pub(crate) fn inc_size(&self) {
        self.curr_size.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn dec_size(&self) {
        let prev = self.curr_size.fetch_sub(1, Ordering::Relaxed);
        strict_assert!(prev > 0);
    }

    /// Cleaning reference counter.
    pub fn cleaning(&self) -> &RefCount {
        &self.cleaning
    }
}

/// Bulk configuration of one io class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IoClassConfig {
    /// User partition id.
    pub id: u16,
    /// Name of the io class. `None` removes a configured class.
    pub name: Option<String>,
    /// Lower size bound, in percent of the cache.
    #[serde(default)]
    pub min_size: u32,
    /// Upper size bound, in percent of the cache.
    #[serde(default = "IoClassConfig::default_max_size")]
    pub max_size: u32,
    /// Priority, lower values are evicted later.
    #[serde(default = "IoClassConfig::default_priority")]
    pub priority: i32,
    /// Cache mode override.
    #[serde(default)]
    pub cache_mode: CacheMode,
}

impl IoClassConfig {
    fn default_max_size() -> u32 {
        PARTITION_SIZE_MAX
    }

    fn default_priority() -> i32 {
        IO_CLASS_PRIO_LOWEST as i32
    }
}

/// Configured view of a partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionInfo {
    /// Partition id.
    pub id: PartId,
    /// Name.
    pub name: String,
    /// Lower size bound, in percent of the cache.
    pub min_size: u32,
    /// Upper size bound, in percent of the cache.
    pub max_size: u32,
    /// Priority.
    pub priority: i16,
    /// Cache mode override.
    pub cache_mode: CacheMode,
    /// State flags.
    pub flags: PartitionFlags,
}

#[derive(Debug)]
struct Partition {
    info: PartitionInfo,
    runtime: Arc<PartitionRuntime>,
}

impl Partition {
    fn inactive(id: PartId, runtime: Arc<PartitionRuntime>) -> Self {
        Self {
            info: PartitionInfo {
                id,
                name: INACTIVE_PARTITION_NAME.to_string(),
                min_size: 0,
                max_size: PARTITION_SIZE_MAX,
                priority: IO_CLASS_PRIO_LOWEST,
                cache_mode: CacheMode::Unset,
                flags: PartitionFlags::empty(),
            },
            runtime,
        }
    }
}

/// The io classes of a cache.
#[derive(Debug)]
pub struct PartitionTable {
    parts: Vec<Partition>,
    runtimes: Box<[Arc<PartitionRuntime>]>,
    sorted: Vec<PartId>,
}

impl Default for PartitionTable {
    fn default() -> Self {
        Self::new()
    }
}

impl PartitionTable {
    /// Create the partitions of a starting cache.
    ///
    /// The default partition is valid, every other user slot is an inactive placeholder. Cleaning is frozen for all
    /// user partitions until [`PartitionTable::unfreeze_cleaning`].
    pub fn new() -> Self {
        // One runtime per LRU-owning id. The slot of the unspecified id is never addressed.
        let runtimes: Box<[Arc<PartitionRuntime>]> = (0..PartId::COUNT).map(|_| Arc::default()).collect();
        let parts = PartId::users()
            .map(|id| Partition::inactive(id, runtimes[id.index()].clone()))
            .collect();
        let mut table = Self {
            parts,
            runtimes,
            sorted: vec![],
        };

        let res = table.add_partition(
            PartId::DEFAULT.get(),
            DEFAULT_PARTITION_NAME,
            0,
            PARTITION_SIZE_MAX,
            IO_CLASS_PRIO_LOWEST as i32,
            true,
        );
        assert!(res.is_ok(), "default partition must always be valid");

        table.freeze_cleaning();
        table
    }

    /// Runtimes indexed by [`PartId::index`], user partitions followed by the freelist.
    pub fn runtimes(&self) -> &[Arc<PartitionRuntime>] {
        &self.runtimes
    }

    /// Runtime of a partition.
    pub fn runtime(&self, id: PartId) -> &Arc<PartitionRuntime> {
        assert_ne!(id, PartId::UNSPECIFIED);
        &self.runtimes[id.index()]
    }

    /// Configured view of a user partition.
    pub fn get(&self, id: PartId) -> Option<&PartitionInfo> {
        id.is_user().then(|| &self.parts[id.index()].info)
    }

    /// Iterate over all user partitions.
    pub fn iter(&self) -> impl Iterator<Item = &PartitionInfo> {
        self.parts.iter().map(|p| &p.info)
    }

    fn check(id: u16, name: &str, min_size: u32, max_size: u32, priority: i32) -> Result<(PartId, i16)> {
        let Some(part) = PartId::user(id) else {
            return Err(Error::invalid("io class id out of range").with_context("id", id));
        };
        if name.is_empty() {
            return Err(Error::invalid("io class name is empty").with_context("id", id));
        }
        if name.len() >= IO_CLASS_NAME_MAX {
            tracing::info!("[partition]: name of the partition is too long, id: {id}");
            return Err(Error::invalid("io class name too long")
                .with_context("id", id)
                .with_context("len", name.len()));
        }
        if min_size > max_size {
            return Err(Error::invalid("partition size bounds out of order")
                .with_context("min_size", min_size)
                .with_context("max_size", max_size));
        }
        if max_size > PARTITION_SIZE_MAX {
            return Err(Error::invalid("partition size above maximum").with_context("max_size", max_size));
        }
        let Ok(priority) = i16::try_from(priority) else {
            return Err(Error::invalid("io class priority out of range").with_context("priority", priority));
        };
        Ok((part, priority))
    }

    /// Add a user partition.
    ///
    /// Nothing is changed if the arguments are rejected or the partition is already valid.
    pub fn add_partition(
        &mut self,
        id: u16,
        name: &str,
        min_size: u32,
        max_size: u32,
        priority: i32,
        valid: bool,
    ) -> Result<()> {
        let (part, priority) = Self::check(id, name, min_size, max_size, priority)?;
        let info = &mut self.parts[part.index()].info;
        if info.flags.contains(PartitionFlags::VALID) {
            return Err(Error::invalid("io class already added").with_context("id", id));
        }

        info.name = name.to_string();
        info.min_size = min_size;
        info.max_size = max_size;
        info.priority = priority;
        info.cache_mode = CacheMode::Unset;
        info.flags = if valid {
            PartitionFlags::VALID | PartitionFlags::ADDED
        } else {
            PartitionFlags::empty()
        };

        tracing::debug!(
            "[partition]: add partition {part} '{name}', min: {min_size}%, max: {max_size}%, priority: {priority}, valid: {valid}"
        );
        Ok(())
    }

    /// Apply a batch of io class configs.
    ///
    /// Every entry is validated before any is applied. The partitions are re-sorted afterwards.
    pub fn configure(&mut self, configs: &[IoClassConfig]) -> Result<()> {
        if let Some(id) = configs.iter().map(|c| c.id).duplicates().next() {
            return Err(Error::invalid("io class configured twice").with_context("id", id));
        }
        for config in configs {
            match &config.name {
                Some(name) => {
                    let (_, priority) =
                        Self::check(config.id, name, config.min_size, config.max_size, config.priority)?;
                    if !(IO_CLASS_PRIO_HIGHEST..=IO_CLASS_PRIO_LOWEST).contains(&priority) {
                        return Err(Error::invalid("io class priority out of range")
                            .with_context("id", config.id)
                            .with_context("priority", priority));
                    }
                }
                None if config.id == PartId::DEFAULT.get() => {
                    return Err(Error::invalid("default io class cannot be removed"));
                }
                None if PartId::user(config.id).is_none() => {
                    return Err(Error::invalid("io class id out of range").with_context("id", config.id));
                }
                None => {}
            }
        }
        for config in configs {
            let Some(part) = PartId::user(config.id) else {
                unreachable!("io class ids are validated above");
            };
            let slot = &mut self.parts[part.index()];
            match &config.name {
                Some(name) => {
                    slot.info.name = name.clone();
                    slot.info.min_size = config.min_size;
                    slot.info.max_size = config.max_size;
                    slot.info.priority = config.priority as i16;
                    slot.info.cache_mode = config.cache_mode;
                    slot.info.flags |= PartitionFlags::VALID | PartitionFlags::ADDED;
                    tracing::debug!("[partition]: configure io class {part} '{name}'");
                }
                None => {
                    *slot = Partition::inactive(part, slot.runtime.clone());
                    tracing::debug!("[partition]: remove io class {part}");
                }
            }
        }

        self.sort();
        Ok(())
    }

    /// Order valid partitions by priority, then id, and mark them eviction-eligible.
    pub fn sort(&mut self) {
        for part in self.parts.iter_mut() {
            let valid = part.info.flags.contains(PartitionFlags::VALID);
            part.info.flags.set(PartitionFlags::EVICTION, valid);
        }
        self.sorted = self
            .parts
            .iter()
            .filter(|p| p.info.flags.contains(PartitionFlags::VALID))
            .sorted_by_key(|p| (p.info.priority, p.info.id))
            .map(|p| p.info.id)
            .collect();
        tracing::debug!("[partition]: sorted partitions: {:?}", self.sorted);
    }

    /// Valid partitions, highest priority first, as of the last [`PartitionTable::sort`].
    pub fn sorted(&self) -> &[PartId] {
        &self.sorted
    }

    /// Eviction-eligible partitions in the order they give up lines: lowest priority first.
    pub fn eviction_order(&self) -> impl Iterator<Item = PartId> + '_ {
        self.sorted
            .iter()
            .rev()
            .copied()
            .filter(|&id| self.parts[id.index()].info.flags.contains(PartitionFlags::EVICTION))
    }

    /// Freeze cleaning of every user partition.
    pub fn freeze_cleaning(&self) {
        self.parts.iter().for_each(|p| p.runtime.cleaning().freeze());
    }

    /// Undo one [`PartitionTable::freeze_cleaning`].
    pub fn unfreeze_cleaning(&self) {
        self.parts.iter().for_each(|p| p.runtime.cleaning().unfreeze());
    }

    fn percent_of(total_lines: u32, percent: u32) -> u32 {
        (total_lines as u64 * percent as u64 / PARTITION_SIZE_MAX as u64) as u32
    }

    /// Lower size bound of a user partition, in cache lines.
    pub fn min_lines(&self, id: PartId, total_lines: u32) -> u32 {
        Self::percent_of(total_lines, self.parts[id.index()].info.min_size)
    }

    /// Upper size bound of a user partition, in cache lines.
    pub fn max_lines(&self, id: PartId, total_lines: u32) -> u32 {
        Self::percent_of(total_lines, self.parts[id.index()].info.max_size)
    }

    /// Number of cache lines a user partition holds above its upper bound.
    pub fn overflow_size(&self, id: PartId, total_lines: u32) -> u32 {
        self.parts[id.index()]
            .runtime
            .curr_size()
            .saturating_sub(self.max_lines(id, total_lines))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(table: &PartitionTable) -> Vec<PartitionInfo> {
        table.iter().cloned().collect()
    }

    #[test]
    fn test_initial_partitions() {
        let table = PartitionTable::new();
        let default = table.get(PartId::DEFAULT).unwrap();
        assert_eq!(default.name, DEFAULT_PARTITION_NAME);
        assert_eq!(default.flags, PartitionFlags::VALID | PartitionFlags::ADDED);
        assert_eq!(default.priority, IO_CLASS_PRIO_LOWEST);

        for info in table.iter().skip(1) {
            assert_eq!(info.name, INACTIVE_PARTITION_NAME);
            assert!(info.flags.is_empty());
        }
        for id in PartId::users() {
            assert!(table.runtime(id).cleaning().frozen());
        }
        assert!(!table.runtime(PartId::FREELIST).cleaning().frozen());
        assert!(table.get(PartId::FREELIST).is_none());
    }

    #[test]
    fn test_add_partition_rejects_without_mutation() {
        let mut table = PartitionTable::new();
        let before = snapshot(&table);

        assert!(table.add_partition(1, "x", 60, 40, 1, true).is_err());
        assert!(table.add_partition(1, "x", 0, 101, 1, true).is_err());
        assert!(table.add_partition(1, "", 0, 50, 1, true).is_err());
        assert!(table
            .add_partition(1, &"n".repeat(IO_CLASS_NAME_MAX), 0, 50, 1, true)
            .is_err());
        assert!(table.add_partition(1, "x", 0, 50, i16::MAX as i32 + 1, true).is_err());
        assert!(table.add_partition(PartId::USER_MAX, "x", 0, 50, 1, true).is_err());
        assert!(table.add_partition(0, "again", 0, 50, 1, true).is_err());

        assert_eq!(snapshot(&table), before);
        assert_eq!(table.get(PartId::user(1).unwrap()).unwrap().name, INACTIVE_PARTITION_NAME);
    }

    #[test]
    fn test_add_partition() {
        let mut table = PartitionTable::new();
        table.add_partition(3, "metadata", 10, 40, -5, true).unwrap();
        let info = table.get(PartId::user(3).unwrap()).unwrap();
        assert_eq!(info.name, "metadata");
        assert_eq!((info.min_size, info.max_size, info.priority), (10, 40, -5));
        assert!(!info.flags.contains(PartitionFlags::EVICTION));

        table.add_partition(4, "later", 0, 100, 1, false).unwrap();
        let info = table.get(PartId::user(4).unwrap()).unwrap();
        assert_eq!(info.name, "later");
        assert!(info.flags.is_empty());
    }

    #[test]
    fn test_sort_and_eviction_order() {
        let mut table = PartitionTable::new();
        table.add_partition(1, "hot", 0, 100, 1, true).unwrap();
        table.add_partition(2, "warm", 0, 100, 10, true).unwrap();
        table.add_partition(3, "also-warm", 0, 100, 10, true).unwrap();
        table.add_partition(4, "off", 0, 100, 0, false).unwrap();
        assert_eq!(table.eviction_order().count(), 0);

        table.sort();
        let id = |i| PartId::user(i).unwrap();
        assert_eq!(table.sorted(), &[id(1), id(2), id(3), id(0)]);
        assert_eq!(table.eviction_order().collect_vec(), vec![id(0), id(3), id(2), id(1)]);
        assert!(table.get(id(2)).unwrap().flags.contains(PartitionFlags::EVICTION));
        assert!(!table.get(id(4)).unwrap().flags.contains(PartitionFlags::EVICTION));
    }

    #[test]
    fn test_configure() {
        let mut table = PartitionTable::new();
        let configs: Vec<IoClassConfig> = serde_json::from_str(
            r#"[
                {"id": 1, "name": "journal", "max_size": 20, "priority": 2, "cache_mode": "write_back"},
                {"id": 2, "name": "bulk", "min_size": 5, "max_size": 50}
            ]"#,
        )
        .unwrap();
        table.configure(&configs).unwrap();

        let journal = table.get(PartId::user(1).unwrap()).unwrap();
        assert_eq!(journal.cache_mode.name(), "wb");
        assert_eq!(journal.max_size, 20);
        let bulk = table.get(PartId::user(2).unwrap()).unwrap();
        assert_eq!(bulk.priority, IO_CLASS_PRIO_LOWEST);
        assert!(bulk.flags.contains(PartitionFlags::EVICTION));

        // One bad entry rejects the whole batch.
        let before = snapshot(&table);
        let bad = vec![
            IoClassConfig {
                id: 5,
                name: Some("fine".to_string()),
                min_size: 0,
                max_size: 10,
                priority: 3,
                cache_mode: CacheMode::Unset,
            },
            IoClassConfig {
                id: 6,
                name: Some("negative".to_string()),
                min_size: 0,
                max_size: 10,
                priority: -1,
                cache_mode: CacheMode::Unset,
            },
        ];
        assert!(table.configure(&bad).is_err());
        let dup = vec![bad[0].clone(), bad[0].clone()];
        assert!(table.configure(&dup).is_err());
        assert_eq!(snapshot(&table), before);

        // Remove a class.
        let remove = IoClassConfig {
            id: 2,
            name: None,
            min_size: 0,
            max_size: 100,
            priority: 0,
            cache_mode: CacheMode::Unset,
        };
        table.configure(std::slice::from_ref(&remove)).unwrap();
        assert_eq!(table.get(PartId::user(2).unwrap()).unwrap().name, INACTIVE_PARTITION_NAME);
        assert!(!table.sorted().contains(&PartId::user(2).unwrap()));

        let remove_default = IoClassConfig { id: 0, ..remove };
        assert!(table.configure(&[remove_default]).is_err());
    }

    #[test]
    fn test_size_bounds() {
        let mut table = PartitionTable::new();
        table.add_partition(1, "x", 10, 30, 1, true).unwrap();
        let id = PartId::user(1).unwrap();
        assert_eq!(table.min_lines(id, 1000), 100);
        assert_eq!(table.max_lines(id, 1000), 300);
        assert_eq!(table.overflow_size(id, 1000), 0);
        table.runtime(id).set_curr_size(350);
        assert_eq!(table.overflow_size(id, 1000), 50);
    }

    #[test]
    fn test_ref_count_freeze() {
        let rc = RefCount::default();
        assert_eq!(rc.inc(), 1);
        rc.freeze();
        rc.freeze();
        assert_eq!(rc.inc(), 0);
        rc.unfreeze();
        assert!(rc.frozen());
        rc.unfreeze();
        assert_eq!(rc.inc(), 2);
        assert_eq!(rc.dec(), 1);
        assert_eq!(rc.dec(), 0);
        assert_eq!(rc.count(), 0);
    }

    #[test]
    fn test_cache_mode_names() {
        for (mode, name) in CACHE_MODE_NAMES {
            assert_eq!(mode.name(), name);
            assert_eq!(CacheMode::from_name(name), Some(mode));
        }
        assert_eq!(CacheMode::from_name("xx"), None);
    }
}
