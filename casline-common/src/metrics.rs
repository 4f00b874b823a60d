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

use std::borrow::Cow;

use mixtrics::{
    metrics::{BoxedCounter, BoxedGauge, BoxedHistogram, BoxedRegistry},
    registry::noop::NoopMetricsRegistry,
};

/// Metrics shared by the components of one cache instance.
#[derive(Debug)]
pub struct Metrics {
    /* promotion metrics */
    /// Requests admitted by the active promotion policy.
    pub promotion_admit: BoxedCounter,
    /// Requests rejected by the active promotion policy.
    pub promotion_reject: BoxedCounter,
    /// Requests admitted without consulting the hit history, because occupancy is below the trigger.
    pub promotion_bypass: BoxedCounter,

    /* n-hit hash metrics */
    /// Keys inserted into the hit history.
    pub nhit_insert: BoxedCounter,
    /// Hit history lookups that found the key.
    pub nhit_hit: BoxedCounter,
    /// Hit history lookups that missed.
    pub nhit_miss: BoxedCounter,
    /// Inserts dropped because the claimed ring slot was still in flight.
    pub nhit_drop: BoxedCounter,

    /* lru metrics */
    /// Lines evicted from a user partition.
    pub lru_evict: BoxedCounter,
    /// Lines taken from the freelist.
    pub lru_free_assign: BoxedCounter,
    /// Lines added to the freelist by population.
    pub lru_populate: BoxedCounter,
    /// Lines handed to the cleaner.
    pub lru_clean: BoxedCounter,
    /// Size of each cleaning batch.
    pub lru_clean_batch_size: BoxedHistogram,

    /// Lines currently on the freelist.
    pub free_lines: BoxedGauge,

    /* management lock metrics */
    /// Lock acquisitions granted.
    pub lock_granted: BoxedCounter,
    /// Lock acquisitions that had to queue.
    pub lock_queued: BoxedCounter,
    /// Queued waiters completed with a failure on teardown.
    pub lock_drained: BoxedCounter,
}

impl Metrics {
    /// Create the metrics of the cache named `name` on the given registry.
    pub fn new(name: impl Into<Cow<'static, str>>, registry: &BoxedRegistry) -> Self {
        let name = name.into();

        let promotion = registry.register_counter_vec(
            "casline_promotion_op_total".into(),
            "casline promotion decisions".into(),
            &["name", "op"],
        );
        let promotion_admit = promotion.counter(&[name.clone(), "admit".into()]);
        let promotion_reject = promotion.counter(&[name.clone(), "reject".into()]);
        let promotion_bypass = promotion.counter(&[name.clone(), "bypass".into()]);

        let nhit = registry.register_counter_vec(
            "casline_nhit_op_total".into(),
            "casline n-hit history operations".into(),
            &["name", "op"],
        );
        let nhit_insert = nhit.counter(&[name.clone(), "insert".into()]);
        let nhit_hit = nhit.counter(&[name.clone(), "hit".into()]);
        let nhit_miss = nhit.counter(&[name.clone(), "miss".into()]);
        let nhit_drop = nhit.counter(&[name.clone(), "drop".into()]);

        let lru = registry.register_counter_vec(
            "casline_lru_op_total".into(),
            "casline lru line movements".into(),
            &["name", "op"],
        );
        let lru_evict = lru.counter(&[name.clone(), "evict".into()]);
        let lru_free_assign = lru.counter(&[name.clone(), "free_assign".into()]);
        let lru_populate = lru.counter(&[name.clone(), "populate".into()]);
        let lru_clean = lru.counter(&[name.clone(), "clean".into()]);

        let lru_batch = registry.register_histogram_vec(
            "casline_lru_batch_size".into(),
            "casline lru batch sizes".into(),
            &["name", "op"],
        );
        let lru_clean_batch_size = lru_batch.histogram(&[name.clone(), "clean".into()]);

        let free = registry.register_gauge_vec("casline_free_lines".into(), "casline free lines".into(), &["name"]);
        let free_lines = free.gauge(&[name.clone()]);

        let lock = registry.register_counter_vec(
            "casline_lock_op_total".into(),
            "casline management lock operations".into(),
            &["name", "op"],
        );
        let lock_granted = lock.counter(&[name.clone(), "granted".into()]);
        let lock_queued = lock.counter(&[name.clone(), "queued".into()]);
        let lock_drained = lock.counter(&[name, "drained".into()]);

        Self {
            promotion_admit,
            promotion_reject,
            promotion_bypass,
            nhit_insert,
            nhit_hit,
            nhit_miss,
            nhit_drop,
            lru_evict,
            lru_free_assign,
            lru_populate,
            lru_clean,
            lru_clean_batch_size,
            free_lines,
            lock_granted,
            lock_queued,
            lock_drained,
        }
    }

    /// Build noop metrics.
    ///
    /// Normally only used in tests or benches.
    pub fn noop() -> Self {
        Self::new("test", &(Box::new(NoopMetricsRegistry) as BoxedRegistry))
    }
}
