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
    error::{Error, Result},
    metrics::Metrics,
    request::Request,
    status::CacheStatus,
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::nhit::{NhitConfig, NhitParams};

/// Kinds of promotion policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromotionPolicyKind {
    /// Admit every request.
    #[default]
    Always,
    /// Admit a core line after it has been seen a configured number of times.
    Nhit,
}

impl PromotionPolicyKind {
    /// All policy kinds.
    pub const ALL: [PromotionPolicyKind; 2] = [PromotionPolicyKind::Always, PromotionPolicyKind::Nhit];

    /// Name of the policy.
    pub fn name(self) -> &'static str {
        match self {
            PromotionPolicyKind::Always => "always",
            PromotionPolicyKind::Nhit => "nhit",
        }
    }
}

/// Persisted promotion config of a cache: the active policy kind and the parameters of every kind.
#[derive(Debug)]
pub struct PromotionConfig {
    kind: RwLock<PromotionPolicyKind>,
    nhit: Arc<NhitParams>,
}

impl PromotionConfig {
    /// Create a config for the given policy kind with default parameters for every kind.
    pub fn new(kind: PromotionPolicyKind) -> Self {
        Self {
            kind: RwLock::new(kind),
            nhit: Arc::default(),
        }
    }

    /// The active policy kind.
    pub fn kind(&self) -> PromotionPolicyKind {
        *self.kind.read()
    }

    pub(crate) fn set_kind(&self, kind: PromotionPolicyKind) {
        *self.kind.write() = kind;
    }

    /// Parameters of the n-hit policy.
    pub fn nhit(&self) -> &Arc<NhitParams> {
        &self.nhit
    }

    /// Serializable copy of the config.
    pub fn snapshot(&self) -> PromotionConfigSnapshot {
        PromotionConfigSnapshot {
            kind: self.kind(),
            nhit: self.nhit.load(),
        }
    }

    /// Load a serialized copy of the config, validating every parameter first.
    pub fn restore(&self, snapshot: &PromotionConfigSnapshot) -> Result<()> {
        snapshot.nhit.validate()?;
        self.set_kind(snapshot.kind);
        self.nhit.store(snapshot.nhit);
        Ok(())
    }
}

/// Serializable promotion config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PromotionConfigSnapshot {
    /// The active policy kind.
    pub kind: PromotionPolicyKind,
    /// Parameters of the n-hit policy.
    #[serde(default)]
    pub nhit: NhitConfig,
}

/// A promotion policy decides whether the core lines of a request are admitted into the cache.
///
/// Every hook has a default that matches a policy without state or parameters.
pub trait PromotionPolicy: Send + Sync + Debug + Sized + 'static {
    /// Kind of the policy.
    const KIND: PromotionPolicyKind;

    /// Install default parameters into the persisted config.
    fn setup(config: &PromotionConfig) {
        let _ = config;
    }

    /// Create the runtime state of the policy.
    fn init(cache: &Arc<dyn CacheStatus>, config: &PromotionConfig, metrics: &Arc<Metrics>) -> Result<Self>;

    /// Release the runtime state of the policy.
    fn deinit(self) {}

    /// Set a parameter in the persisted config.
    fn set_param(config: &PromotionConfig, param_id: u8, value: u32) -> Result<()> {
        let _ = (config, value);
        Err(Error::invalid("promotion policy has no parameters")
            .with_context("policy", Self::KIND.name())
            .with_context("param_id", param_id))
    }

    /// Get a parameter from the persisted config.
    fn get_param(config: &PromotionConfig, param_id: u8) -> Result<u32> {
        let _ = config;
        Err(Error::invalid("promotion policy has no parameters")
            .with_context("policy", Self::KIND.name())
            .with_context("param_id", param_id))
    }

    /// Forget the access history of the core lines of a request.
    fn req_purge(&self, req: &Request) {
        let _ = req;
    }

    /// Returns true if the core lines of a request should be admitted.
    fn req_should_promote(&self, req: &Request) -> bool {
        let _ = req;
        true
    }
}
