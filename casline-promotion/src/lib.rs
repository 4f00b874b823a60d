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

//! Promotion policies decide which core lines are admitted into the cache.
//!
//! [`Promotion`] owns the persisted [`PromotionConfig`] and the runtime state of the active policy, and switches
//! policies at runtime with a fallback to [`AlwaysPromotion`].

mod always;
pub mod nhit;
mod policy;
mod promotion;

pub use always::AlwaysPromotion;
pub use nhit::{NhitConfig, NhitParam, NhitPromotion};
pub use policy::{PromotionConfig, PromotionConfigSnapshot, PromotionPolicy, PromotionPolicyKind};
pub use promotion::Promotion;
