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

use casline_common::{error::Result, metrics::Metrics, status::CacheStatus};

use crate::policy::{PromotionConfig, PromotionPolicy, PromotionPolicyKind};

/// Promotion policy that admits every request.
#[derive(Debug, Default)]
pub struct AlwaysPromotion;

impl PromotionPolicy for AlwaysPromotion {
    const KIND: PromotionPolicyKind = PromotionPolicyKind::Always;

    fn init(_: &Arc<dyn CacheStatus>, _: &PromotionConfig, _: &Arc<Metrics>) -> Result<Self> {
        Ok(Self)
    }
}
