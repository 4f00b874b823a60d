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

//! casline - cache-line admission and eviction core.
//!
//! A cache built with [`CacheBuilder`] spreads its lines over io class partitions kept in sharded LRU lists, decides
//! which core lines are admitted with a runtime-switchable promotion policy, and hands out victims and dirty lines to
//! the I/O engine on top of it.
//!
//! ```
//! use casline::{CacheBuilder, CoreId, PartId, Request};
//!
//! let cache = CacheBuilder::new(1024).build().unwrap();
//! let mut req = Request::new(CoreId::new(1), 0, 4, PartId::DEFAULT);
//! if cache.should_promote(&req) {
//!     let assigned = cache.assign_lines(&mut req).unwrap();
//!     assert_eq!(assigned, 4);
//!     cache.unlock_lines(&req);
//! }
//! assert_eq!(cache.num_free(), 1020);
//! ```

mod cache;
mod prelude;

pub use prelude::*;
