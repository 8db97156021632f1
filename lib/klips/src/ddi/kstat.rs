// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Named 64-bit counters, in the style of illumos named kstats.
//!
//! The counters are updated from many workers at once without taking
//! the lock of whatever structure they describe, so each
//! [`KStatU64`] is an atomic. A reader taking a snapshot may observe
//! a group of counters that is not consistent *as a whole* (one packet
//! counted in `out_pkts` but not yet in `out_modified`), but each
//! individual value is intact.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::string::ToString;
use alloc::vec::Vec;
use core::fmt;
use core::fmt::Display;
use core::sync::atomic::AtomicU64;
use core::sync::atomic::Ordering;

/// The longest module or statistic name accepted, including the
/// terminating NUL a kstat consumer would expect.
pub const KSTAT_STRLEN: usize = 31;

/// A group of named counters, normally declared with
/// `#[derive(KStatProvider)]` on a struct whose fields are all
/// [`KStatU64`]:
///
/// ```ignore
/// #[derive(KStatProvider)]
/// struct TunnelStats {
///     out_pkts: KStatU64,
///     out_drop: KStatU64,
/// }
/// ```
///
/// Workers bump a counter through a shared reference with `incr()`.
pub trait KStatProvider {
    const FIELD_NAMES: &'static [&'static str];

    /// A plain copy of every counter, with the same field names.
    type Snap;

    /// Validate the field names.
    fn init(&mut self) -> Result<(), Error>;
    fn new() -> Self;
    fn snapshot(&self) -> Self::Snap;

    /// The current values, in the order of `FIELD_NAMES`.
    fn values(&self) -> Vec<u64>;
}

/// A [`KStatProvider`] registered under a module and instance name.
pub struct KStatNamed<T: KStatProvider> {
    pub vals: Box<T>,
    module: String,
    name: String,
}

impl<T: KStatProvider> KStatNamed<T> {
    pub fn new(
        module: &str,
        name: &str,
        provider: T,
    ) -> Result<KStatNamed<T>, Error> {
        check_name(module)?;
        check_name(name)?;

        let mut vals = Box::new(provider);
        vals.init()?;
        Ok(Self { vals, module: module.to_string(), name: name.to_string() })
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Each counter as a `(name, value)` pair.
    pub fn pairs(&self) -> Vec<(&'static str, u64)> {
        T::FIELD_NAMES.iter().copied().zip(self.vals.values()).collect()
    }
}

fn check_name(name: &str) -> Result<(), Error> {
    if name.as_bytes().contains(&0) {
        return Err(Error::NulChar);
    }

    if name.len() + 1 > KSTAT_STRLEN {
        return Err(Error::NameTooLong(name.to_string()));
    }

    Ok(())
}

/// A 64-bit unsigned named kstat.
#[derive(Debug, Default)]
pub struct KStatU64 {
    value: AtomicU64,
}

impl KStatU64 {
    pub fn init(&mut self, name: &str) -> Result<(), Error> {
        check_name(name)
    }

    pub fn new() -> Self {
        Self { value: AtomicU64::new(0) }
    }

    #[inline]
    pub fn incr(&self, val: u64) {
        self.value.fetch_add(val, Ordering::Relaxed);
    }

    pub fn val(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

impl core::ops::AddAssign<u64> for KStatU64 {
    fn add_assign(&mut self, other: u64) {
        *self.value.get_mut() += other;
    }
}

#[derive(Clone, Debug)]
pub enum Error {
    NameTooLong(String),
    NulChar,
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::NameTooLong(name) => write!(f, "name too long: {name}"),
            Self::NulChar => write!(f, "name holds a NUL"),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use kstat_macro::KStatProvider;

    #[derive(KStatProvider)]
    struct TestStats {
        hits: KStatU64,
        misses: KStatU64,
    }

    #[test]
    fn derive_and_count() {
        let mut ks =
            KStatNamed::new("klips", "test0", TestStats::new()).unwrap();
        ks.vals.hits.incr(3);
        ks.vals.misses += 1;

        let snap = ks.vals.snapshot();
        assert_eq!(snap.hits, 3);
        assert_eq!(snap.misses, 1);
        assert_eq!(ks.pairs(), vec![("hits", 3), ("misses", 1)]);
        assert_eq!(TestStats::FIELD_NAMES.len(), 2);
        assert_eq!(ks.name(), "test0");
    }

    #[test]
    fn bad_names() {
        let long = "x".repeat(KSTAT_STRLEN);
        assert!(matches!(
            KStatNamed::new("klips", &long, TestStats::new()),
            Err(Error::NameTooLong(_))
        ));
        assert!(matches!(
            KStatNamed::new("kl\0ips", "x", TestStats::new()),
            Err(Error::NulChar)
        ));
    }
}
