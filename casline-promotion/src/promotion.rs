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

use std::sync::Arc;

use casline_common::{error::Result, metrics::Metrics, request::Request, status::CacheStatus};
use parking_lot::RwLock;

use crate::{
    always::AlwaysPromotion,
    nhit::NhitPromotion,
    policy::{PromotionConfig, PromotionPolicy, PromotionPolicyKind},
};

/// Runtime state of the active policy.
#[derive(Debug)]
enum PolicyState {
    Always(AlwaysPromotion),
    Nhit(NhitPromotion),
}

impl PolicyState {
    fn init(
        kind: PromotionPolicyKind,
        cache: &Arc<dyn CacheStatus>,
        config: &PromotionConfig,
        metrics: &Arc<Metrics>,
    ) -> Result<Self> {
        match kind {
            PromotionPolicyKind::Always => AlwaysPromotion::init(cache, config, metrics).map(Self::Always),
            PromotionPolicyKind::Nhit => NhitPromotion::init(cache, config, metrics).map(Self::Nhit),
        }
    }

    fn kind(&self) -> PromotionPolicyKind {
        match self {
            Self::Always(_) => AlwaysPromotion::KIND,
            Self::Nhit(_) => NhitPromotion::KIND,
        }
    }

    fn deinit(self) {
        match self {
            Self::Always(policy) => policy.deinit(),
            Self::Nhit(policy) => policy.deinit(),
        }
    }

    fn req_purge(&self, req: &Request) {
        match self {
            Self::Always(policy) => policy.req_purge(req),
            Self::Nhit(policy) => policy.req_purge(req),
        }
    }

    fn req_should_promote(&self, req: &Request) -> bool {
        match self {
            Self::Always(policy) => policy.req_should_promote(req),
            Self::Nhit(policy) => policy.req_should_promote(req),
        }
    }
}

/// The promotion layer of a cache: the persisted config plus the runtime state of the active policy.
#[derive(Debug)]
pub struct Promotion {
    state: RwLock<PolicyState>,
    config: Arc<PromotionConfig>,
    cache: Arc<dyn CacheStatus>,
    metrics: Arc<Metrics>,
}

impl Promotion {
    /// Install default parameters of every policy kind into the config.
    pub fn setup(config: &PromotionConfig) {
        AlwaysPromotion::setup(config);
        NhitPromotion::setup(config);
    }

    /// Initialize the policy the config selects.
    pub fn init(cache: Arc<dyn CacheStatus>, config: Arc<PromotionConfig>, metrics: Arc<Metrics>) -> Result<Self> {
        let kind = config.kind();
        let state = PolicyState::init(kind, &cache, &config, &metrics).inspect_err(|e| {
            tracing::error!("[promotion]: initialize '{}' promotion policy error: {e}", kind.name());
        })?;
        Ok(Self {
            state: RwLock::new(state),
            config,
            cache,
            metrics,
        })
    }

    /// Kind of the active policy.
    pub fn kind(&self) -> PromotionPolicyKind {
        self.state.read().kind()
    }

    /// The persisted config.
    pub fn config(&self) -> &Arc<PromotionConfig> {
        &self.config
    }

    /// Switch the active policy.
    ///
    /// The old policy is torn down before the new one is initialized. If the new one fails to initialize, the
    /// `always` policy is installed instead and the error is returned.
    pub fn set_policy(&self, kind: PromotionPolicyKind) -> Result<()> {
        let mut state = self.state.write();
        if state.kind() == kind {
            tracing::info!("[promotion]: promotion policy already set to '{}'", kind.name());
            return Ok(());
        }

        let old = std::mem::replace(&mut *state, PolicyState::Always(AlwaysPromotion));
        old.deinit();

        self.config.set_kind(kind);
        match PolicyState::init(kind, &self.cache, &self.config, &self.metrics) {
            Ok(new) => {
                *state = new;
                tracing::info!("[promotion]: switched to '{}' promotion policy", kind.name());
                Ok(())
            }
            Err(e) => {
                tracing::error!("[promotion]: switch to '{}' promotion policy error: {e}", kind.name());
                tracing::error!("[promotion]: falling back to 'always' promotion policy");
                self.config.set_kind(PromotionPolicyKind::Always);
                Err(e)
            }
        }
    }

    /// Set a parameter of the given policy kind. The kind does not need to be active.
    pub fn set_param(&self, kind: PromotionPolicyKind, param_id: u8, value: u32) -> Result<()> {
        match kind {
            PromotionPolicyKind::Always => AlwaysPromotion::set_param(&self.config, param_id, value),
            PromotionPolicyKind::Nhit => NhitPromotion::set_param(&self.config, param_id, value),
        }
    }

    /// Get a parameter of the given policy kind. The kind does not need to be active.
    pub fn get_param(&self, kind: PromotionPolicyKind, param_id: u8) -> Result<u32> {
        match kind {
            PromotionPolicyKind::Always => AlwaysPromotion::get_param(&self.config, param_id),
            PromotionPolicyKind::Nhit => NhitPromotion::get_param(&self.config, param_id),
        }
    }

    /// Forget the access history of the core lines of a request.
    pub fn req_purge(&self, req: &Request) {
        self.state.read().req_purge(req);
    }

    /// Returns true if the core lines of a request should be admitted.
    pub fn req_should_promote(&self, req: &Request) -> bool {
        let promote = self.state.read().req_should_promote(req);
        if promote {
            self.metrics.promotion_admit.increase(1);
        } else {
            self.metrics.promotion_reject.increase(1);
        }
        promote
    }

    /// Tear down the active policy.
    pub fn deinit(self) {
        self.state.into_inner().deinit();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};

    use casline_common::{
        code::{CoreId, PartId},
        error::ErrorKind,
    };

    use super::*;
    use crate::nhit::{NhitHash, NhitParam, NHIT_MAPPING_RATIO};

    #[derive(Debug)]
    struct Occupancy {
        total: u64,
        free: AtomicU64,
        memory: AtomicU64,
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
            self.memory.load(Ordering::Relaxed)
        }
    }

    fn promotion(kind: PromotionPolicyKind) -> (Promotion, Arc<Occupancy>) {
        let status = Arc::new(Occupancy {
            total: 100,
            free: AtomicU64::new(5),
            memory: AtomicU64::new(u64::MAX),
        });
        let config = Arc::new(PromotionConfig::new(kind));
        Promotion::setup(&config);
        let promotion = Promotion::init(status.clone(), config, Arc::new(Metrics::noop())).unwrap();
        (promotion, status)
    }

    fn req(line: u64) -> Request {
        Request::new(CoreId::new(0), line, 1, PartId::DEFAULT)
    }

    #[test_log::test]
    fn test_same_policy_is_noop() {
        let (promotion, _) = promotion(PromotionPolicyKind::Nhit);
        assert!(!promotion.req_should_promote(&req(1)));
        promotion.set_policy(PromotionPolicyKind::Nhit).unwrap();
        // The hit history survived.
        assert!(!promotion.req_should_promote(&req(1)));
        assert!(promotion.req_should_promote(&req(1)));
    }

    #[test_log::test]
    fn test_switch_policy() {
        let (promotion, _) = promotion(PromotionPolicyKind::Always);
        assert!(promotion.req_should_promote(&req(1)));

        promotion.set_policy(PromotionPolicyKind::Nhit).unwrap();
        assert_eq!(promotion.kind(), PromotionPolicyKind::Nhit);
        assert_eq!(promotion.config().kind(), PromotionPolicyKind::Nhit);
        assert!(!promotion.req_should_promote(&req(1)));

        promotion.set_policy(PromotionPolicyKind::Always).unwrap();
        assert!(promotion.req_should_promote(&req(2)));
        promotion.deinit();
    }

    #[test_log::test]
    fn test_failed_switch_falls_back_to_always() {
        let (promotion, status) = promotion(PromotionPolicyKind::Always);
        status
            .memory
            .store(NhitHash::sizeof_estimate(100 * NHIT_MAPPING_RATIO), Ordering::Relaxed);

        let err = promotion.set_policy(PromotionPolicyKind::Nhit).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoFreeRam);
        assert_eq!(promotion.kind(), PromotionPolicyKind::Always);
        assert_eq!(promotion.config().kind(), PromotionPolicyKind::Always);
        assert!(promotion.req_should_promote(&req(1)));
    }

    #[test]
    fn test_params_of_inactive_policy() {
        let (promotion, _) = promotion(PromotionPolicyKind::Always);
        assert_eq!(
            promotion
                .set_param(PromotionPolicyKind::Always, 0, 1)
                .unwrap_err()
                .kind(),
            ErrorKind::Invalid
        );
        assert_eq!(
            promotion.get_param(PromotionPolicyKind::Always, 0).unwrap_err().kind(),
            ErrorKind::Invalid
        );

        promotion
            .set_param(PromotionPolicyKind::Nhit, NhitParam::InsertionThreshold as u8, 2)
            .unwrap();
        promotion.set_policy(PromotionPolicyKind::Nhit).unwrap();
        assert!(!promotion.req_should_promote(&req(1)));
        assert!(promotion.req_should_promote(&req(1)));
    }
}
