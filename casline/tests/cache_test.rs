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

//! End-to-end tests of line assignment, eviction, cleaning and promotion.

use std::collections::HashSet;

use casline::{
    CacheBuilder, CacheLine, CoreId, ErrorKind, IoClassConfig, LookupStatus, NhitParam, PartId,
    PromotionPolicyKind, Request, NUM_LRU_LISTS,
};
use itertools::Itertools;

fn assigned_lines(req: &Request) -> Vec<CacheLine> {
    req.map()
        .iter()
        .filter(|e| e.status == LookupStatus::Remapped)
        .map(|e| e.cache_line.unwrap())
        .collect()
}

#[test_log::test]
fn test_fill_then_evict() {
    const LINES: u32 = 64;
    let cache = CacheBuilder::new(LINES).build().unwrap();
    let core = CoreId::new(1);

    let mut fill = Request::new(core, 0, LINES as u64, PartId::DEFAULT);
    assert_eq!(cache.assign_lines(&mut fill).unwrap(), LINES as usize);
    cache.unlock_lines(&fill);
    assert_eq!(cache.num_free(), 0);
    assert_eq!(cache.partition_size(PartId::DEFAULT), LINES);

    let filled = assigned_lines(&fill);
    assert_eq!(filled.iter().unique().count(), LINES as usize);

    let mut req = Request::new(core, 100, 4, PartId::DEFAULT);
    assert_eq!(cache.assign_lines(&mut req).unwrap(), 4);
    cache.unlock_lines(&req);
    assert_eq!(cache.num_free(), 0);
    assert_eq!(cache.partition_size(PartId::DEFAULT), LINES);

    for (entry, line) in req.map().iter().zip_eq(assigned_lines(&req)) {
        assert_eq!(cache.space().core_line(line), Some(entry.core_line));
    }
    let still_mapped = filled
        .iter()
        .filter(|&&line| cache.space().core_line(line).is_some_and(|cl| cl.line < LINES as u64))
        .count();
    assert_eq!(still_mapped, LINES as usize - 4);
}

#[test_log::test]
fn test_locked_lines_are_not_evicted() {
    const LINES: u32 = 8;
    let cache = CacheBuilder::new(LINES).build().unwrap();
    let core = CoreId::new(1);

    let mut fill = Request::new(core, 0, LINES as u64, PartId::DEFAULT);
    assert_eq!(cache.assign_lines(&mut fill).unwrap(), LINES as usize);

    // Still write locked by the first request.
    let mut req = Request::new(core, 100, 2, PartId::DEFAULT);
    assert_eq!(cache.assign_lines(&mut req).unwrap(), 0);
    assert_eq!(req.unmapped_count(), 2);

    cache.unlock_lines(&fill);
    assert_eq!(cache.assign_lines(&mut req).unwrap(), 2);
    cache.unlock_lines(&req);
}

#[test_log::test]
fn test_dirty_lines_need_cleaning() {
    const LINES: u32 = 32;
    let cache = CacheBuilder::new(LINES).build().unwrap();
    let core = CoreId::new(2);

    let mut fill = Request::new(core, 0, LINES as u64, PartId::DEFAULT);
    cache.assign_lines(&mut fill).unwrap();
    cache.unlock_lines(&fill);
    let filled = assigned_lines(&fill);
    filled.iter().for_each(|&line| assert!(cache.mark_dirty(line)));

    let mut req = Request::new(core, 1000, 1, PartId::DEFAULT);
    assert_eq!(cache.assign_lines(&mut req).unwrap(), 0);

    let batch = cache.clean(PartId::DEFAULT, LINES as usize).unwrap();
    assert_eq!(batch.part(), PartId::DEFAULT);
    assert_eq!(batch.lines().len(), LINES as usize);
    assert_eq!(batch.lines().iter().collect::<HashSet<_>>(), filled.iter().collect::<HashSet<_>>());
    // One cleaner per partition at a time.
    assert!(cache.clean(PartId::DEFAULT, 1).is_none());

    batch.lines().iter().for_each(|&line| assert!(cache.mark_clean(line)));
    batch.complete();
    assert!(cache.clean(PartId::DEFAULT, 1).is_none());

    assert_eq!(cache.assign_lines(&mut req).unwrap(), 1);
    cache.unlock_lines(&req);
}

#[test_log::test]
fn test_invalidate_returns_lines() {
    let cache = CacheBuilder::new(16).build().unwrap();
    let mut req = Request::new(CoreId::new(3), 0, 4, PartId::DEFAULT);
    cache.assign_lines(&mut req).unwrap();
    cache.unlock_lines(&req);
    assert_eq!(cache.num_free(), 12);

    let lines = assigned_lines(&req);
    cache.mark_dirty(lines[0]);
    lines.iter().for_each(|&line| cache.invalidate(line));
    assert_eq!(cache.num_free(), 16);
    assert_eq!(cache.partition_size(PartId::DEFAULT), 0);
    assert!(lines.iter().all(|&line| cache.space().core_line(line).is_none()));
    assert!(!cache.space().is_dirty(lines[0]));
}

#[test_log::test]
fn test_repeated_and_free_marks_are_ignored() {
    let cache = CacheBuilder::new(8).build().unwrap();
    let mut req = Request::new(CoreId::new(1), 0, 2, PartId::DEFAULT);
    cache.assign_lines(&mut req).unwrap();
    cache.unlock_lines(&req);
    let lines = assigned_lines(&req);

    assert!(!cache.mark_clean(lines[0]));
    assert!(cache.mark_dirty(lines[0]));
    assert!(!cache.mark_dirty(lines[0]));
    assert!(cache.space().is_dirty(lines[0]));
    assert!(cache.mark_clean(lines[0]));
    assert!(!cache.mark_clean(lines[0]));

    cache.invalidate(lines[1]);
    assert!(!cache.mark_dirty(lines[1]));
    assert!(!cache.mark_clean(lines[1]));
    assert!(!cache.space().is_dirty(lines[1]));
    assert_eq!(cache.num_free(), 7);
    assert_eq!(cache.partition_size(PartId::DEFAULT), 1);
}

#[test_log::test]
fn test_touch_makes_line_hot() {
    // Two lines per shard: one hot, one cold.
    const LINES: u32 = 2 * NUM_LRU_LISTS as u32;
    let cache = CacheBuilder::new(LINES).build().unwrap();
    let core = CoreId::new(1);

    let mut fill = Request::new(core, 0, LINES as u64, PartId::DEFAULT);
    cache.assign_lines(&mut fill).unwrap();
    cache.unlock_lines(&fill);
    let filled = assigned_lines(&fill);
    let hot = filled.iter().filter(|&&line| cache.space().is_hot(line)).count();
    assert_eq!(hot, NUM_LRU_LISTS);

    let cold = *filled.iter().find(|&&line| !cache.space().is_hot(line)).unwrap();
    let core_line = cache.space().core_line(cold);
    cache.touch(cold);
    assert!(cache.space().is_hot(cold));
    assert_eq!(cache.space().core_line(cold), core_line);
    let hot = filled.iter().filter(|&&line| cache.space().is_hot(line)).count();
    assert_eq!(hot, NUM_LRU_LISTS);
}

#[test_log::test]
fn test_io_class_partitions() {
    const LINES: u32 = 100;
    let cache = CacheBuilder::new(LINES)
        .with_io_classes([IoClassConfig {
            id: 1,
            name: Some("metadata".to_string()),
            min_size: 0,
            max_size: 20,
            priority: 0,
            cache_mode: Default::default(),
        }])
        .build()
        .unwrap();
    let meta = PartId::user(1).unwrap();

    let classes = cache.io_classes();
    assert_eq!(classes[0].name, "unclassified");
    assert_eq!(classes[1].name, "metadata");
    assert_eq!(classes[1].max_size, 20);

    let mut data = Request::new(CoreId::new(1), 0, 80, PartId::DEFAULT);
    assert_eq!(cache.assign_lines(&mut data).unwrap(), 80);
    cache.unlock_lines(&data);
    let mut metadata = Request::new(CoreId::new(1), 1000, 30, meta);
    assert_eq!(cache.assign_lines(&mut metadata).unwrap(), 30);
    cache.unlock_lines(&metadata);

    // 20 lines came from the freelist, 10 were evicted from the lowest priority partition.
    assert_eq!(cache.partition_size(meta), 30);
    assert_eq!(cache.partition_size(PartId::DEFAULT), 70);

    // The metadata partition is above its bound, so it gives lines up first.
    let mut more = Request::new(CoreId::new(1), 2000, 5, PartId::DEFAULT);
    assert_eq!(cache.assign_lines(&mut more).unwrap(), 5);
    cache.unlock_lines(&more);
    assert_eq!(cache.partition_size(meta), 25);
    assert_eq!(cache.partition_size(PartId::DEFAULT), 75);
}

#[test_log::test(tokio::test)]
async fn test_configure_io_classes_atomically() {
    let cache = CacheBuilder::new(64).build().unwrap();
    let class = |id: u16, name: &str| IoClassConfig {
        id,
        name: Some(name.to_string()),
        min_size: 0,
        max_size: 100,
        priority: 10,
        cache_mode: Default::default(),
    };

    let err = cache
        .configure_io_classes(&[class(2, "a"), class(2, "b")])
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Invalid);
    assert_eq!(cache.io_classes()[2].name, "Inactive");

    cache.configure_io_classes(&[class(2, "logs")]).await.unwrap();
    assert_eq!(cache.io_classes()[2].name, "logs");

    // The default class cannot be removed.
    let mut remove_default = class(0, "x");
    remove_default.name = None;
    assert!(cache.configure_io_classes(&[remove_default]).await.is_err());
}

#[test_log::test(tokio::test)]
async fn test_removed_io_class_lines_are_reclaimed() {
    const LINES: u32 = 16;
    let class = IoClassConfig {
        id: 1,
        name: Some("scratch".to_string()),
        min_size: 0,
        max_size: 100,
        priority: 0,
        cache_mode: Default::default(),
    };
    let cache = CacheBuilder::new(LINES).with_io_classes([class.clone()]).build().unwrap();
    let scratch = PartId::user(1).unwrap();

    let mut fill = Request::new(CoreId::new(1), 0, LINES as u64, scratch);
    assert_eq!(cache.assign_lines(&mut fill).unwrap(), LINES as usize);
    cache.unlock_lines(&fill);
    assert_eq!(cache.partition_size(scratch), LINES);

    cache
        .configure_io_classes(&[IoClassConfig { name: None, ..class }])
        .await
        .unwrap();
    assert_eq!(cache.io_classes()[1].name, "Inactive");
    assert_eq!(cache.partition_size(scratch), 0);
    assert_eq!(cache.partition_size(PartId::DEFAULT), LINES);

    let mut req = Request::new(CoreId::new(1), 1000, 4, PartId::DEFAULT);
    assert_eq!(cache.assign_lines(&mut req).unwrap(), 4);
    cache.unlock_lines(&req);
    assert_eq!(cache.partition_size(PartId::DEFAULT), LINES);
}

#[test_log::test(tokio::test)]
async fn test_nhit_promotion_at_runtime() {
    let cache = CacheBuilder::new(256).build().unwrap();
    let req = Request::new(CoreId::new(1), 10, 1, PartId::DEFAULT);
    assert!(cache.should_promote(&req));

    cache.set_promotion_policy(PromotionPolicyKind::Nhit).await.unwrap();
    assert_eq!(cache.promotion_policy().await.unwrap(), PromotionPolicyKind::Nhit);

    cache
        .set_promotion_param(PromotionPolicyKind::Nhit, NhitParam::InsertionThreshold as u8, 2)
        .await
        .unwrap();
    cache
        .set_promotion_param(PromotionPolicyKind::Nhit, NhitParam::TriggerThreshold as u8, 0)
        .await
        .unwrap();
    assert_eq!(
        cache
            .promotion_param(PromotionPolicyKind::Nhit, NhitParam::InsertionThreshold as u8)
            .await
            .unwrap(),
        2
    );

    assert!(!cache.should_promote(&req));
    assert!(cache.should_promote(&req));

    cache.purge(&req);
    assert!(!cache.should_promote(&req));
    assert!(cache.should_promote(&req));

    let err = cache
        .set_promotion_param(PromotionPolicyKind::Nhit, NhitParam::InsertionThreshold as u8, 1)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Invalid);

    let config = cache.promotion_config();
    assert_eq!(config.kind, PromotionPolicyKind::Nhit);
    assert_eq!(config.nhit.insertion_threshold, 2);
    assert_eq!(config.nhit.trigger_threshold, 0);

    cache.set_promotion_policy(PromotionPolicyKind::Always).await.unwrap();
    assert!(cache.should_promote(&Request::new(CoreId::new(1), 500, 1, PartId::DEFAULT)));
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_concurrent_assignment() {
    const LINES: u32 = 512;
    const TASKS: u64 = 8;
    const ROUNDS: u64 = 100;

    let cache = CacheBuilder::new(LINES).with_name("concurrent").build().unwrap();

    let handles = (0..TASKS)
        .map(|task| {
            let cache = cache.clone();
            tokio::spawn(async move {
                for round in 0..ROUNDS {
                    let first = (task * ROUNDS + round) * 4;
                    let mut req = Request::new(CoreId::new(task as u16), first, 4, PartId::DEFAULT);
                    loop {
                        match cache.assign_lines(&mut req) {
                            Ok(_) => break,
                            Err(e) if e.kind() == ErrorKind::NoLock => tokio::task::yield_now().await,
                            Err(e) => panic!("assign lines error: {e}"),
                        }
                    }
                    cache.unlock_lines(&req);
                    if round % 10 == 0 {
                        assigned_lines(&req).iter().for_each(|&line| {
                            cache.mark_dirty(line);
                        });
                    }
                }
            })
        })
        .collect_vec();

    let switcher = {
        let cache = cache.clone();
        tokio::spawn(async move {
            for kind in PromotionPolicyKind::ALL.iter().cycle().take(20) {
                cache.set_promotion_policy(*kind).await.unwrap();
                tokio::task::yield_now().await;
            }
        })
    };

    for handle in handles {
        handle.await.unwrap();
    }
    switcher.await.unwrap();

    assert_eq!(cache.num_free() + cache.partition_size(PartId::DEFAULT), LINES);
    let cleaned = cache.clean(PartId::DEFAULT, LINES as usize).map(|batch| batch.lines().len());
    assert!(cleaned.is_some_and(|n| n > 0));
}
