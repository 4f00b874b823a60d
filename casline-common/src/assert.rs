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

//! Assertions that stay on in release builds with the "strict_assertions" feature.
//!
//! The feature is checked where the macro expands, so every crate that uses these macros forwards its own
//! "strict_assertions" feature to `casline-common`.
//!
//! Cheap structural checks on lists, chains and counters go through these macros. Lock protocol violations use a
//! plain `assert!` instead, they are fatal in every build.

#[doc(hidden)]
#[macro_export]
macro_rules! __strict_or_debug {
    ($strict:ident, $debug:ident, $($arg:tt)*) => {
        #[cfg(feature = "strict_assertions")]
        $strict!($($arg)*);
        #[cfg(not(feature = "strict_assertions"))]
        $debug!($($arg)*);
    };
}

/// `assert!` with "strict_assertions", `debug_assert!` otherwise.
#[macro_export]
macro_rules! strict_assert {
    ($($arg:tt)*) => {
        $crate::__strict_or_debug!(assert, debug_assert, $($arg)*)
    };
}

/// `assert_eq!` with "strict_assertions", `debug_assert_eq!` otherwise.
#[macro_export]
macro_rules! strict_assert_eq {
    ($($arg:tt)*) => {
        $crate::__strict_or_debug!(assert_eq, debug_assert_eq, $($arg)*)
    };
}

/// `assert_ne!` with "strict_assertions", `debug_assert_ne!` otherwise.
#[macro_export]
macro_rules! strict_assert_ne {
    ($($arg:tt)*) => {
        $crate::__strict_or_debug!(assert_ne, debug_assert_ne, $($arg)*)
    };
}
