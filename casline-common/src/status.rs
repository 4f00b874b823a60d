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

use std::fmt::Debug;

/// Occupancy view of a cache instance, consumed by admission policies.
pub trait CacheStatus: Send + Sync + Debug {
    /// Cache line size in bytes.
    fn line_size(&self) -> u64;

    /// Total number of cache lines.
    fn cachelines_count(&self) -> u64;

    /// Number of cache lines not assigned to any partition.
    fn free_cachelines_count(&self) -> u64;

    /// Free system memory in bytes, probed before large allocations.
    fn available_system_memory(&self) -> u64 {
        available_system_memory()
    }

    /// Number of cache lines currently holding data.
    fn occupied_cachelines_count(&self) -> u64 {
        self.cachelines_count().saturating_sub(self.free_cachelines_count())
    }
}

/// Free system memory in bytes.
///
/// Returns `u64::MAX` on platforms where the probe is not supported.
#[cfg(target_os = "linux")]
pub fn available_system_memory() -> u64 {
    let mut info = std::mem::MaybeUninit::<libc::sysinfo>::uninit();
    // SAFETY: `sysinfo` only writes into the provided struct.
    let res = unsafe { libc::sysinfo(info.as_mut_ptr()) };
    if res != 0 {
        tracing::warn!(
            "[status]: sysinfo failed, error: {}",
            std::io::Error::last_os_error()
        );
        return u64::MAX;
    }
    // SAFETY: `sysinfo` returned success, the struct is initialized.
    let info = unsafe { info.assume_init() };
    (info.freeram as u64).saturating_mul(info.mem_unit as u64)
}

/// Free system memory in bytes.
///
/// Returns `u64::MAX` on platforms where the probe is not supported.
#[cfg(not(target_os = "linux"))]
pub fn available_system_memory() -> u64 {
    u64::MAX
}
