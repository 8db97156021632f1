// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! SA lifetimes.
//!
//! Every SA carries a [`Lifetime64`] per [`LifeKind`]. A lifetime is a
//! running count plus a soft threshold (time to renegotiate) and a
//! hard threshold (time to tear down). A threshold of zero is unset.
//!
//! For a count-based kind the count is the amount consumed so far.
//! For a time-based kind the count is the moment, in whole seconds,
//! the clock started; zero means it has not started yet.

use crate::api::LifetimeDump;
use alloc::string::String;
use core::fmt;
use core::fmt::Display;
use core::fmt::Write;
use serde::Deserialize;
use serde::Serialize;

/// How a lifetime's count is interpreted.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LifeBasis {
    Count,
    Time,
}

/// The lifetimes tracked for each SA.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum LifeKind {
    Bytes,
    Packets,
    AddTime,
    UseTime,
    Allocations,
}

impl LifeKind {
    /// The kinds consulted by the outbound pre-check, in the order
    /// they are checked.
    pub const CHECKED: [LifeKind; 4] =
        [Self::Bytes, Self::AddTime, Self::UseTime, Self::Packets];

    pub const ALL: [LifeKind; 5] = [
        Self::Bytes,
        Self::Packets,
        Self::AddTime,
        Self::UseTime,
        Self::Allocations,
    ];

    pub fn basis(&self) -> LifeBasis {
        match self {
            Self::AddTime | Self::UseTime => LifeBasis::Time,
            Self::Bytes | Self::Packets | Self::Allocations => {
                LifeBasis::Count
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Bytes => "bytes",
            Self::Packets => "packets",
            Self::AddTime => "addtime",
            Self::UseTime => "usetime",
            Self::Allocations => "allocations",
        }
    }
}

impl Display for LifeKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// The verdict of a lifetime check.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LifeStatus {
    Alive,
    SoftExpired,
    HardExpired,
}

/// A single soft/hard lifetime.
///
/// The thresholds are only reachable through [`Self::update_soft()`]
/// and [`Self::update_hard()`], which keep `soft <= hard` whenever both
/// are set.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize,
)]
pub struct Lifetime64 {
    count: u64,
    soft: u64,
    hard: u64,
    last: u64,
}

impl Lifetime64 {
    /// A lifetime with the given thresholds (zero for unset).
    pub fn new(soft: u64, hard: u64) -> Self {
        let mut lt = Self::default();
        lt.update_hard(hard);
        lt.update_soft(soft);
        lt
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn soft(&self) -> u64 {
        self.soft
    }

    pub fn hard(&self) -> u64 {
        self.hard
    }

    pub fn last(&self) -> u64 {
        self.last
    }

    /// Add to a count-based lifetime and record the latest delta.
    pub fn consume(&mut self, amount: u64) {
        self.count = self.count.saturating_add(amount);
        self.last = amount;
    }

    /// Start a time-based lifetime, if it has not been started, and
    /// record `now_secs` as the latest use.
    pub fn touch(&mut self, now_secs: u64) {
        if self.count == 0 {
            self.count = now_secs;
        }
        self.last = now_secs;
    }

    /// Overwrite the running count. This is for the control actor
    /// restoring state (e.g. the add time of an SA being updated);
    /// thresholds are never set this way.
    pub fn set_count(&mut self, count: u64) {
        self.count = count;
    }

    /// The value compared against the thresholds.
    pub fn elapsed(&self, basis: LifeBasis, now_secs: u64) -> u64 {
        match basis {
            LifeBasis::Count => self.count,
            LifeBasis::Time if self.count == 0 => 0,
            LifeBasis::Time => now_secs.saturating_sub(self.count),
        }
    }

    /// Check this lifetime.
    ///
    /// `pending` is added to a count-based lifetime before the
    /// comparison: it is what the caller is about to consume, so a
    /// packet that would carry the SA past its hard limit is refused
    /// rather than counted. It has no effect on time-based lifetimes.
    pub fn check(
        &self,
        basis: LifeBasis,
        now_secs: u64,
        pending: u64,
    ) -> LifeStatus {
        let mut val = self.elapsed(basis, now_secs);
        if basis == LifeBasis::Count {
            val = val.saturating_add(pending);
        }

        if self.hard != 0 && val > self.hard {
            return LifeStatus::HardExpired;
        }

        if self.soft != 0 && val > self.soft {
            return LifeStatus::SoftExpired;
        }

        LifeStatus::Alive
    }

    /// Lower the soft threshold to `newvalue` if it is unset or
    /// larger. Zero is ignored.
    pub fn update_soft(&mut self, newvalue: u64) {
        if newvalue != 0 && (self.soft == 0 || newvalue < self.soft) {
            self.soft = newvalue;

            if self.hard != 0 && self.hard < self.soft {
                self.soft = self.hard;
            }
        }
    }

    /// Lower the hard threshold to `newvalue` if it is unset or
    /// larger. Zero is ignored.
    pub fn update_hard(&mut self, newvalue: u64) {
        if newvalue != 0 && (self.hard == 0 || newvalue < self.hard) {
            self.hard = newvalue;

            if self.soft != 0 && self.hard < self.soft {
                self.soft = self.hard;
            }
        }
    }

    /// Is this lifetime still at its defaults?
    pub fn is_default(&self) -> bool {
        self.count <= 1 && self.soft == 0 && self.hard == 0
    }

    /// Append `name(elapsed,soft,hard)` to `buf`. Nothing is written
    /// for a lifetime at its defaults.
    pub fn format<W: Write>(
        &self,
        buf: &mut W,
        name: &str,
        basis: LifeBasis,
        now_secs: u64,
    ) -> fmt::Result {
        if self.is_default() {
            return Ok(());
        }

        write!(
            buf,
            "{}({},{},{})",
            name,
            self.elapsed(basis, now_secs),
            self.soft,
            self.hard
        )
    }

    pub fn dump(&self, kind: LifeKind, now_secs: u64) -> LifetimeDump {
        let mut text = String::new();
        // Writing into a String cannot fail.
        let _ = self.format(&mut text, kind.name(), kind.basis(), now_secs);
        LifetimeDump {
            name: kind.name().into(),
            count: self.count,
            soft: self.soft,
            hard: self.hard,
            last: self.last,
            text,
        }
    }
}

/// The full set of lifetimes carried by an SA.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct SaLifetimes {
    pub bytes: Lifetime64,
    pub packets: Lifetime64,
    pub addtime: Lifetime64,
    pub usetime: Lifetime64,
    pub allocations: Lifetime64,
}

impl SaLifetimes {
    pub fn get(&self, kind: LifeKind) -> &Lifetime64 {
        match kind {
            LifeKind::Bytes => &self.bytes,
            LifeKind::Packets => &self.packets,
            LifeKind::AddTime => &self.addtime,
            LifeKind::UseTime => &self.usetime,
            LifeKind::Allocations => &self.allocations,
        }
    }

    pub fn get_mut(&mut self, kind: LifeKind) -> &mut Lifetime64 {
        match kind {
            LifeKind::Bytes => &mut self.bytes,
            LifeKind::Packets => &mut self.packets,
            LifeKind::AddTime => &mut self.addtime,
            LifeKind::UseTime => &mut self.usetime,
            LifeKind::Allocations => &mut self.allocations,
        }
    }

    /// Space-separated renderings of every non-default lifetime.
    pub fn format(&self, now_secs: u64) -> String {
        let mut out = String::new();
        for kind in LifeKind::ALL {
            let lt = self.get(kind);
            if lt.is_default() {
                continue;
            }
            if !out.is_empty() {
                out.push(' ');
            }
            let _ = lt.format(&mut out, kind.name(), kind.basis(), now_secs);
        }
        out
    }
}
