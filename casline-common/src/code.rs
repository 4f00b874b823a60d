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

use std::fmt::Display;

use serde::{Deserialize, Serialize};

/// Multiplier of core line hashing, shared by the hit history and the hash bucket locks.
pub const HASH_PRIME: u64 = 4099;

/// Identifier of a core (backing) device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CoreId(u16);

impl CoreId {
    /// The largest valid core id.
    pub const MAX: u16 = 4095;

    /// Raw value reserved for "no core". Never a valid [`CoreId`].
    pub const INVALID_RAW: u16 = Self::MAX + 1;

    /// Create a core id.
    ///
    /// # Panics
    ///
    /// Panics if `id` exceeds [`CoreId::MAX`].
    pub fn new(id: u16) -> Self {
        assert!(id <= Self::MAX, "core id out of range: {id}");
        Self(id)
    }

    /// Decode a raw value, mapping the invalid sentinel to `None`.
    pub fn from_raw(raw: u16) -> Option<Self> {
        (raw <= Self::MAX).then_some(Self(raw))
    }

    /// Encode an optional core id, mapping `None` to the invalid sentinel.
    pub fn into_raw(id: Option<Self>) -> u16 {
        id.map(|id| id.0).unwrap_or(Self::INVALID_RAW)
    }

    /// Get the raw value.
    pub fn get(self) -> u16 {
        self.0
    }
}

impl Display for CoreId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A logical line of a core device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CoreLine {
    /// Owning core.
    pub core_id: CoreId,
    /// Line index on the core, in cache-line-size units.
    pub line: u64,
}

impl CoreLine {
    /// Create a core line.
    pub fn new(core_id: CoreId, line: u64) -> Self {
        Self { core_id, line }
    }
}

/// Index of a cache line in the collision table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CacheLine(u32);

impl CacheLine {
    /// Create a cache line index.
    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    /// Get the raw index.
    pub const fn get(self) -> u32 {
        self.0
    }

    /// Get the raw index as `usize`.
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl Display for CacheLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a partition (io class).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PartId(u16);

impl PartId {
    /// Number of user io classes.
    pub const USER_MAX: u16 = 33;

    /// The always present default partition.
    pub const DEFAULT: PartId = PartId(0);

    /// Id of a partition that is not assigned yet. One past the last user class.
    pub const UNSPECIFIED: PartId = PartId(Self::USER_MAX);

    /// The reserved partition holding lines that are not assigned to any user partition.
    pub const FREELIST: PartId = PartId(Self::USER_MAX + 1);

    /// Number of partitions that own LRU lists, user partitions followed by the freelist.
    pub const COUNT: usize = Self::USER_MAX as usize + 2;

    /// Create a user partition id.
    ///
    /// Returns `None` if `id` is not a user partition id.
    pub fn user(id: u16) -> Option<Self> {
        (id < Self::USER_MAX).then_some(Self(id))
    }

    /// Get the raw id.
    pub fn get(self) -> u16 {
        self.0
    }

    /// Get the raw id as `usize`.
    pub fn index(self) -> usize {
        self.0 as usize
    }

    /// Returns true if the id addresses a user partition.
    pub fn is_user(self) -> bool {
        self.0 < Self::USER_MAX
    }

    /// Iterate over all user partition ids.
    pub fn users() -> impl Iterator<Item = PartId> {
        (0..Self::USER_MAX).map(PartId)
    }
}

impl Display for PartId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Self::FREELIST => write!(f, "freelist"),
            Self::UNSPECIFIED => write!(f, "unspecified"),
            Self(id) => write!(f, "{id}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_core_id_sentinel() {
        assert_eq!(CoreId::from_raw(CoreId::INVALID_RAW), None);
        assert_eq!(CoreId::from_raw(7), Some(CoreId::new(7)));
        assert_eq!(CoreId::into_raw(None), CoreId::INVALID_RAW);
        assert_eq!(CoreId::into_raw(Some(CoreId::new(7))), 7);
    }

    #[test]
    fn test_part_id_ranges() {
        assert_eq!(PartId::UNSPECIFIED.get(), PartId::USER_MAX);
        assert_eq!(PartId::FREELIST.get(), PartId::USER_MAX + 1);
        assert!(!PartId::FREELIST.is_user());
        assert!(PartId::user(PartId::USER_MAX).is_none());
        assert_eq!(PartId::users().count(), PartId::USER_MAX as usize);
    }
}
