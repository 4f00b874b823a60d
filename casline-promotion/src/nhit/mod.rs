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

use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc,
};

use casline_common::{
    code::CoreLine,
    error::{Error, Result},
    metrics::Metrics,
    request::Request,
    status::CacheStatus,
};
use serde::{Deserialize, Serialize};

use crate::policy::{PromotionConfig, PromotionPolicy, PromotionPolicyKind};

mod hash;

pub use casline_common::code::HASH_PRIME;
pub use hash::{NhitHash, SlotIdx};

/// Smallest accepted insertion threshold.
pub const NHIT_MIN_THRESHOLD: u32 = 2;
/// Largest accepted insertion threshold.
pub const NHIT_MAX_THRESHOLD: u32 = 1000;
/// Default insertion threshold.
pub const NHIT_THRESHOLD_DEFAULT: u32 = 3;

/// Smallest accepted trigger threshold, in percent of cache occupancy.
pub const NHIT_TRIGGER_MIN: u32 = 0;
/// Largest accepted trigger threshold, in percent of cache occupancy.
pub const NHIT_TRIGGER_MAX: u32 = 100;
/// Default trigger threshold, in percent of cache occupancy.
pub const NHIT_TRIGGER_DEFAULT: u32 = 80;

/// Hit history slots per cache line.
pub const NHIT_MAPPING_RATIO: u64 = 2;

/// Parameter ids of the n-hit promotion policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum NhitParam {
    /// Hits a core line needs before it is promoted.
    InsertionThreshold = 0,
    /// Cache occupancy, in percent, from which the hit history is consulted at all.
    TriggerThreshold = 1,
}

impl TryFrom<u8> for NhitParam {
    type Error = Error;

    fn try_from(id: u8) -> Result<Self> {
        match id {
            0 => Ok(Self::InsertionThreshold),
            1 => Ok(Self::TriggerThreshold),
            _ => Err(Error::invalid("unknown n-hit parameter").with_context("param_id", id)),
        }
    }
}

/// n-hit promotion policy config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NhitConfig {
    /// Hits a core line needs before it is promoted.
    ///
    /// Must be in `NHIT_MIN_THRESHOLD..=NHIT_MAX_THRESHOLD`.
    pub insertion_threshold: u32,
    /// Cache occupancy, in percent, from which the hit history is consulted at all.
    ///
    /// Must be in `NHIT_TRIGGER_MIN..=NHIT_TRIGGER_MAX`.
    pub trigger_threshold: u32,
}

impl Default for NhitConfig {
    fn default() -> Self {
        Self {
            insertion_threshold: NHIT_THRESHOLD_DEFAULT,
            trigger_threshold: NHIT_TRIGGER_DEFAULT,
        }
    }
}

impl NhitConfig {
    /// Check that both thresholds are in range.
    pub fn validate(&self) -> Result<()> {
        check(NhitParam::InsertionThreshold, self.insertion_threshold)?;
        check(NhitParam::TriggerThreshold, self.trigger_threshold)
    }
}

fn check(param: NhitParam, value: u32) -> Result<()> {
    let range = match param {
        NhitParam::InsertionThreshold => NHIT_MIN_THRESHOLD..=NHIT_MAX_THRESHOLD,
        NhitParam::TriggerThreshold => NHIT_TRIGGER_MIN..=NHIT_TRIGGER_MAX,
    };
    if range.contains(&value) {
        return Ok(());
    }
    Err(Error::invalid("n-hit parameter out of range")
        .with_context("param", format!("{param:?}"))
        .with_context("value", value)
        .with_context("min", range.start())
        .with_context("max", range.end()))
}

/// Persisted n-hit thresholds.
///
/// Shared between the cache config and a running policy, so a threshold change is visible to the admission path
/// without re-initializing the policy.
#[derive(Debug)]
pub struct NhitParams {
    insertion_threshold: AtomicU32,
    trigger_threshold: AtomicU32,
}

impl Default for NhitParams {
    fn default() -> Self {
        Self::new(NhitConfig::default())
    }
}

impl NhitParams {
    /// Create params from a config. The config is not validated.
    pub fn new(config: NhitConfig) -> Self {
        Self {
            insertion_threshold: AtomicU32::new(config.insertion_threshold),
            trigger_threshold: AtomicU32::new(config.trigger_threshold),
        }
    }

    /// Current thresholds.
    pub fn load(&self) -> NhitConfig {
        NhitConfig {
            insertion_threshold: self.insertion_threshold.load(Ordering::Relaxed),
            trigger_threshold: self.trigger_threshold.load(Ordering::Relaxed),
        }
    }

    /// Replace both thresholds. The config is not validated.
    pub fn store(&self, config: NhitConfig) {
        self.insertion_threshold
            .store(config.insertion_threshold, Ordering::Relaxed);
        self.trigger_threshold.store(config.trigger_threshold, Ordering::Relaxed);
    }

    fn get(&self, param: NhitParam) -> u32 {
        match param {
            NhitParam::InsertionThreshold => self.insertion_threshold.load(Ordering::Relaxed),
            NhitParam::TriggerThreshold => self.trigger_threshold.load(Ordering::Relaxed),
        }
    }

    fn set(&self, param: NhitParam, value: u32) -> Result<()> {
        check(param, value)?;
        match param {
            NhitParam::InsertionThreshold => self.insertion_threshold.store(value, Ordering::Relaxed),
            NhitParam::TriggerThreshold => self.trigger_threshold.store(value, Ordering::Relaxed),
        }
        Ok(())
    }
}

/// Promotion policy that admits a core line only after it has been seen `insertion_threshold` times, once the cache
/// is at least `trigger_threshold` percent full.
#[derive(Debug)]
pub struct NhitPromotion {
    hash: NhitHash,
    params: Arc<NhitParams>,
    cache: Arc<dyn CacheStatus>,
    metrics: Arc<Metrics>,
}

impl NhitPromotion {
    fn core_line_should_promote(&self, core_line: CoreLine, insertion_threshold: i32) -> bool {
        match self.hash.query(core_line.core_id, core_line.line) {
            Some(counter) => insertion_threshold <= counter,
            None => {
                self.hash.insert(core_line.core_id, core_line.line);
                false
            }
        }
    }

    /// The hit history backing this policy.
    pub fn hash(&self) -> &NhitHash {
        &self.hash
    }
}

impl PromotionPolicy for NhitPromotion {
    const KIND: PromotionPolicyKind = PromotionPolicyKind::Nhit;

    fn setup(config: &PromotionConfig) {
        config.nhit().store(NhitConfig::default());
    }

    fn init(cache: &Arc<dyn CacheStatus>, config: &PromotionConfig, metrics: &Arc<Metrics>) -> Result<Self> {
        let hash_size = cache.cachelines_count() * NHIT_MAPPING_RATIO;
        let required = NhitHash::sizeof_estimate(hash_size);
        let available = cache.available_system_memory();
        if required >= available {
            tracing::error!(
                "[nhit]: not enough free memory for hit history, required: {required}, available: {available}"
            );
            return Err(Error::no_free_ram(required, available));
        }

        let hash = NhitHash::new(hash_size, metrics.clone())?;

        Ok(Self {
            hash,
            params: config.nhit().clone(),
            cache: cache.clone(),
            metrics: metrics.clone(),
        })
    }

    fn set_param(config: &PromotionConfig, param_id: u8, value: u32) -> Result<()> {
        let param = NhitParam::try_from(param_id)?;
        config.nhit().set(param, value).inspect_err(|e| {
            tracing::warn!("[nhit]: reject parameter change: {e}");
        })?;
        tracing::info!("[nhit]: set {param:?} to {value}");
        Ok(())
    }

    fn get_param(config: &PromotionConfig, param_id: u8) -> Result<u32> {
        let param = NhitParam::try_from(param_id)?;
        Ok(config.nhit().get(param))
    }

    fn req_purge(&self, req: &Request) {
        for core_line in req.core_lines() {
            self.hash.set_occurrences(core_line.core_id, core_line.line, 0);
        }
    }

    fn req_should_promote(&self, req: &Request) -> bool {
        let NhitConfig {
            insertion_threshold,
            trigger_threshold,
        } = self.params.load();

        let total = self.cache.cachelines_count();
        let occupied = self.cache.occupied_cachelines_count();
        if occupied < (trigger_threshold as u64 * total).div_ceil(100) {
            self.metrics.promotion_bypass.increase(1);
            return true;
        }

        let insertion_threshold = insertion_threshold as i32;
        // Every line is looked up so each one records the access, no short circuit.
        let result = req
            .core_lines()
            .fold(true, |acc, core_line| {
                self.core_line_should_promote(core_line, insertion_threshold) && acc
            });

        // A partially mapped request is admitted to avoid a mix of cached and pass-through lines.
        result || req.mapped_count() > 0
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU64;

    use casline_common::{
        code::{CacheLine, CoreId, PartId},
        error::ErrorKind,
    };

    use super::*;

    #[derive(Debug)]
    struct Occupancy {
        total: u64,
        free: AtomicU64,
        memory: u64,
    }

    impl CacheStatus for Occupancy {
        fn line_size(&self) -> u64 {
            4096
        }

        fn cachelines_count(&self) -> u64 {
            self.total
        }

        fn free_cachelines_count(&self) -> u64 {
            self.free.load(Ordering::Relaxed)
        }

        fn available_system_memory(&self) -> u64 {
            self.memory
        }
    }

    fn cache(total: u64, occupied: u64) -> Arc<Occupancy> {
        Arc::new(Occupancy {
            total,
            free: AtomicU64::new(total - occupied),
            memory: u64::MAX,
        })
    }

    fn policy(cache: Arc<Occupancy>) -> (NhitPromotion, PromotionConfig) {
        let config = PromotionConfig::new(PromotionPolicyKind::Nhit);
        NhitPromotion::setup(&config);
        let cache: Arc<dyn CacheStatus> = cache;
        let policy = NhitPromotion::init(&cache, &config, &Arc::new(Metrics::noop())).unwrap();
        (policy, config)
    }

    fn req(line: u64, count: u64) -> Request {
        Request::new(CoreId::new(1), line, count, PartId::DEFAULT)
    }

    #[test]
    fn test_below_trigger_always_promotes() {
        let (policy, _) = policy(cache(100, 50));
        for _ in 0..3 {
            assert!(policy.req_should_promote(&req(7, 4)));
        }
        // Nothing was recorded while bypassing.
        assert_eq!(policy.hash().query(CoreId::new(1), 7), None);
    }

    #[test]
    fn test_promote_after_threshold_hits() {
        let (policy, _) = policy(cache(100, 90));
        assert!(!policy.req_should_promote(&req(7, 1)));
        assert!(!policy.req_should_promote(&req(7, 1)));
        assert!(policy.req_should_promote(&req(7, 1)));
        assert!(policy.req_should_promote(&req(7, 1)));
    }

    #[test]
    fn test_all_lines_must_qualify() {
        let (policy, _) = policy(cache(100, 90));
        for _ in 0..2 {
            assert!(!policy.req_should_promote(&req(10, 1)));
        }
        // Line 10 reaches the threshold but line 11 is fresh, and both lines record the access.
        assert!(!policy.req_should_promote(&req(10, 2)));
        assert_eq!(policy.hash().query(CoreId::new(1), 11), Some(2));
    }

    #[test]
    fn test_partial_hit_is_admitted() {
        let (policy, _) = policy(cache(100, 90));
        let mut r = req(20, 4);
        r.set_hit(0, CacheLine::new(3));
        assert!(policy.req_should_promote(&r));
    }

    #[test]
    fn test_purge_resets_counters() {
        let (policy, _) = policy(cache(100, 90));
        for _ in 0..3 {
            policy.req_should_promote(&req(30, 2));
        }
        policy.req_purge(&req(30, 2));
        assert_eq!(policy.hash().query(CoreId::new(1), 30), Some(1));
        assert_eq!(policy.hash().query(CoreId::new(1), 31), Some(1));
    }

    #[test]
    fn test_threshold_change_is_visible() {
        let (policy, config) = policy(cache(100, 50));
        assert!(policy.req_should_promote(&req(40, 1)));

        NhitPromotion::set_param(&config, NhitParam::TriggerThreshold as u8, 10).unwrap();
        assert!(!policy.req_should_promote(&req(40, 1)));
    }

    #[test_log::test]
    fn test_set_param_validation() {
        let config = PromotionConfig::new(PromotionPolicyKind::Nhit);
        NhitPromotion::setup(&config);

        for (id, value) in [(0, 1), (0, 1001), (1, 101), (2, 5)] {
            let err = NhitPromotion::set_param(&config, id, value).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Invalid);
        }
        assert_eq!(config.nhit().load(), NhitConfig::default());

        NhitPromotion::set_param(&config, 0, 1000).unwrap();
        NhitPromotion::set_param(&config, 1, 0).unwrap();
        assert_eq!(NhitPromotion::get_param(&config, 0).unwrap(), 1000);
        assert_eq!(NhitPromotion::get_param(&config, 1).unwrap(), 0);
        assert_eq!(
            NhitPromotion::get_param(&config, 9).unwrap_err().kind(),
            ErrorKind::Invalid
        );
    }

    #[test_log::test]
    fn test_init_checks_free_memory() {
        let config = PromotionConfig::new(PromotionPolicyKind::Nhit);
        let cache: Arc<dyn CacheStatus> = Arc::new(Occupancy {
            total: 1024,
            free: AtomicU64::new(1024),
            memory: NhitHash::sizeof_estimate(1024 * NHIT_MAPPING_RATIO),
        });
        let err = NhitPromotion::init(&cache, &config, &Arc::new(Metrics::noop())).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoFreeRam);
    }

    #[test]
    fn test_config_serde() {
        let config: NhitConfig = serde_json::from_str(r#"{"insertion_threshold":5,"trigger_threshold":60}"#).unwrap();
        config.validate().unwrap();
        assert_eq!(config.insertion_threshold, 5);

        let config = NhitConfig {
            insertion_threshold: 1,
            trigger_threshold: 60,
        };
        assert_eq!(config.validate().unwrap_err().kind(), ErrorKind::Invalid);
    }
}
