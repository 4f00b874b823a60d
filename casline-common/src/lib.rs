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

//! Shared components for casline.

/// Allow to enable debug assertions in release profile with feature "strict_assertions".
pub mod assert;
/// Non-blocking reader/writer lock with completion callbacks.
pub mod async_lock;
/// Identifiers of cores, cache lines and partitions.
pub mod code;
/// The error type of casline.
pub mod error;
/// Metrics abstraction and provisioned registries.
pub mod metrics;
/// The I/O request model consumed by admission and eviction.
pub mod request;
/// Occupancy view of a cache instance and system memory probe.
pub mod status;
