// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Moments in time.
//!
//! A [`Moment`] is a reading of a monotonic, high-resolution clock
//! expressed as nanoseconds since an arbitrary origin fixed for the
//! life of the process (much like `gethrtime(9F)`). SA lifetimes store
//! whole seconds taken from the same clock, which is why the raw value
//! is exposed.

use core::ops::Add;
use core::time::Duration;
use std::sync::OnceLock;
use std::time::Instant;

/// The number of milliseconds in a second.
pub const MILLIS: u64 = 1_000;
/// The number of nanoseconds in a second.
pub const NANOS: u64 = 1_000_000_000;
/// The conversion from nanoseconds to milliseconds.
pub const NANOS_TO_MILLIS: u64 = NANOS / MILLIS;

static ORIGIN: OnceLock<Instant> = OnceLock::new();

#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub struct Moment {
    nanos: u64,
}

impl Moment {
    pub fn now() -> Self {
        let origin = ORIGIN.get_or_init(Instant::now);
        let nanos = u64::try_from(origin.elapsed().as_nanos())
            .unwrap_or(u64::MAX);
        // Keep zero free: a lifetime count of zero means "never set".
        Self { nanos: nanos.saturating_add(NANOS) }
    }

    /// Build a moment from a raw nanosecond reading.
    pub fn from_raw_nanos(nanos: u64) -> Self {
        Self { nanos }
    }

    /// Build a moment from whole seconds.
    pub fn from_secs(secs: u64) -> Self {
        Self { nanos: secs.saturating_mul(NANOS) }
    }

    pub fn raw_nanos(&self) -> u64 {
        self.nanos
    }

    /// Whole seconds since the clock origin.
    pub fn secs(&self) -> u64 {
        self.nanos / NANOS
    }

    /// Compute the delta between `self` and `earlier` in
    /// milliseconds, saturating at zero.
    pub fn delta_as_millis(&self, earlier: Moment) -> u64 {
        self.nanos.saturating_sub(earlier.nanos) / NANOS_TO_MILLIS
    }
}

impl Add<Duration> for Moment {
    type Output = Self;

    fn add(self, rhs: Duration) -> Self {
        let delta = u64::try_from(rhs.as_nanos()).unwrap_or(u64::MAX);
        Self { nanos: self.nanos.saturating_add(delta) }
    }
}
