// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License in the LICENSE file at the
// root of this repository, or online at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Cast utilities.

use std::time::Duration;

/// A trait for safe, simple, and infallible casts.
///
/// `CastFrom` is like [`std::convert::From`], but it is implemented for some
/// platform-specific casts that are missing from the standard library. We only
/// target 64-bit platforms, so `usize` and `u64` convert freely in both
/// directions.
///
/// `CastFrom` should be preferred to the `as` operator, since the `as` operator
/// will silently truncate if the target type is smaller than the source type.
pub trait CastFrom<T> {
    /// Performs the cast.
    fn cast_from(from: T) -> Self;
}

macro_rules! cast_from {
    ($from:ty, $to:ty) => {
        impl CastFrom<$from> for $to {
            #[allow(clippy::as_conversions)]
            fn cast_from(from: $from) -> $to {
                from as $to
            }
        }
    };
}

cast_from!(u32, usize);

#[cfg(target_pointer_width = "64")]
cast_from!(u64, usize);

cast_from!(usize, u64);

/// A trait for casts that may lose precision, such as integers to floats.
///
/// Intended for values that only feed approximate consumers, like histogram
/// observations.
pub trait CastLossy<T> {
    /// Performs the cast.
    fn cast_lossy(from: T) -> Self;
}

macro_rules! cast_lossy {
    ($from:ty, $to:ty) => {
        impl CastLossy<$from> for $to {
            #[allow(clippy::as_conversions)]
            fn cast_lossy(from: $from) -> $to {
                from as $to
            }
        }
    };
}

cast_lossy!(usize, f64);
cast_lossy!(u64, f64);

/// Converts a [`Duration`] to whole milliseconds, saturating at `u64::MAX`.
///
/// Durations in configuration can be arbitrarily large, while the clocks we
/// compare them against count milliseconds in a `u64`.
pub fn duration_to_millis_saturating(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_duration_millis() {
        assert_eq!(duration_to_millis_saturating(Duration::from_secs(2)), 2_000);
        assert_eq!(duration_to_millis_saturating(Duration::from_micros(1_500)), 1);
        assert_eq!(duration_to_millis_saturating(Duration::MAX), u64::MAX);
    }

    #[test]
    fn test_lossy() {
        assert_eq!(f64::cast_lossy(3usize), 3.0);
        assert_eq!(f64::cast_lossy(u64::MAX), 18_446_744_073_709_551_616.0);
    }

    #[test]
    fn test_usize_round_trip() {
        assert_eq!(usize::cast_from(u64::cast_from(17usize)), 17);
    }
}
