// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The eroute table: outbound policy.
//!
//! An eroute maps a [`Selector`] to an SAId, which is either a real SA
//! or one of the shunt pseudo-SAs (pass, drop, reject, hold, trap,
//! trapsubnet). Entries are kept sorted from most to least specific,
//! so the first entry matching a packet is the best match:
//!
//! 1. smallest destination address space,
//! 2. then smallest source address space,
//! 3. then a specified protocol before a wildcard,
//! 4. then specified ports before wildcards,
//! 5. then the most recently added.
//!
//! Subnet entries are indexed on the selector's fixed-width key. All
//! entries sharing a mask live in one group, keyed by their masked
//! selector, so a lookup masks the packet's key once per group. Groups
//! are ordered by specificity and the search stops once no later group
//! can beat the best hit. Address ranges do not fit a mask and are
//! kept in a short list of their own.
//!
//! A hold entry may retain one packet while negotiation completes.
//! The entry owns that packet until it is replaced, the entry is
//! removed, or the table is cleared.

use super::ip4::FlowId;
use super::packet::Packet;
use crate::api::DumpErouteResp;
use crate::api::ErouteDump;
use crate::api::Identity;
use crate::api::KlipsError;
use crate::api::SaId;
use crate::api::SELECTOR_KEY_LEN;
use crate::api::Selector;
use crate::ddi::kstat::KStatProvider;
use crate::ddi::kstat::KStatU64;
use crate::ddi::sync::KMutex;
use crate::ddi::sync::KMutexGuard;
use alloc::collections::BTreeMap;
use alloc::string::ToString;
use alloc::vec::Vec;
use core::cmp::Reverse;
use core::fmt;
use core::fmt::Display;
use kstat_macro::KStatProvider;

pub const EROUTE_DEF_LIMIT: usize = 8192;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ErouteError {
    Exists(Selector),
    NotFound(Selector),
    /// The table is at its configured limit.
    OutOfMemory(usize),
}

impl Display for ErouteError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Exists(sel) => write!(f, "eroute exists: {sel}"),
            Self::NotFound(sel) => write!(f, "eroute not found: {sel}"),
            Self::OutOfMemory(limit) => {
                write!(f, "eroute table full ({limit} entries)")
            }
        }
    }
}

impl From<ErouteError> for KlipsError {
    fn from(err: ErouteError) -> Self {
        match err {
            ErouteError::Exists(sel) => KlipsError::ErouteExists(sel.to_string()),
            ErouteError::NotFound(sel) => {
                KlipsError::ErouteNotFound(sel.to_string())
            }
            ErouteError::OutOfMemory(limit) => {
                KlipsError::MaxCapacity(limit as u64)
            }
        }
    }
}

type SelKey = [u8; SELECTOR_KEY_LEN];

// (dst span, src span, proto wildcard, wildcard ports)
type Shape = (u64, u64, bool, u8);

// The shape, then newest first.
type SpecKey = (Shape, Reverse<u64>);

fn shape_of(sel: &Selector) -> Shape {
    let wild_ports = u8::from(sel.sport == 0) + u8::from(sel.dport == 0);
    (sel.dst.span(), sel.src.span(), sel.proto == 0, wild_ports)
}

fn masked(key: &SelKey, mask: &SelKey) -> SelKey {
    let mut out = *key;
    out.iter_mut().zip(mask).for_each(|(b, m)| *b &= m);
    out
}

fn is_subnet(sel: &Selector) -> bool {
    !sel.src.is_range() && !sel.dst.is_range()
}

pub struct Eroute {
    pub sel: Selector,
    pub said: SaId,
    pub pid: u32,
    /// Packets matched.
    pub count: u64,
    /// When the entry last matched, in seconds.
    pub lasttime: u64,
    pub ident_s: Option<Identity>,
    pub ident_d: Option<Identity>,
    retained: Option<Packet>,
    seq: u64,
}

impl Eroute {
    pub fn new(sel: Selector, said: SaId) -> Self {
        Self {
            sel,
            said,
            pid: 0,
            count: 0,
            lasttime: 0,
            ident_s: None,
            ident_d: None,
            retained: None,
            seq: 0,
        }
    }

    pub fn with_pid(mut self, pid: u32) -> Self {
        self.pid = pid;
        self
    }

    pub fn with_idents(
        mut self,
        ident_s: Option<Identity>,
        ident_d: Option<Identity>,
    ) -> Self {
        self.ident_s = ident_s;
        self.ident_d = ident_d;
        self
    }

    pub fn with_packet(mut self, pkt: Packet) -> Self {
        self.retained = Some(pkt);
        self
    }

    /// Does the packet described by `flow` fall under this entry?
    pub fn matches(&self, flow: &FlowId) -> bool {
        self.sel.src.contains(flow.src)
            && self.sel.dst.contains(flow.dst)
            && (self.sel.proto == 0 || self.sel.proto == flow.proto)
            && (self.sel.sport == 0 || self.sel.sport == flow.sport)
            && (self.sel.dport == 0 || self.sel.dport == flow.dport)
    }

    /// Count a match.
    pub fn hit(&mut self, now_secs: u64) {
        self.count += 1;
        self.lasttime = now_secs;
    }

    /// Hold `pkt`, handing back the packet it replaces.
    pub fn retain_packet(&mut self, pkt: Packet) -> Option<Packet> {
        self.retained.replace(pkt)
    }

    pub fn take_packet(&mut self) -> Option<Packet> {
        self.retained.take()
    }

    pub fn retained(&self) -> Option<&Packet> {
        self.retained.as_ref()
    }

    fn spec_key(&self) -> SpecKey {
        (shape_of(&self.sel), Reverse(self.seq))
    }

    pub fn dump(&self) -> ErouteDump {
        ErouteDump {
            count: self.count,
            sel: self.sel,
            said: self.said,
            pid: self.pid,
            ident_s: self.ident_s.clone(),
            ident_d: self.ident_d.clone(),
            retained: self.retained.is_some(),
        }
    }
}

impl fmt::Debug for Eroute {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Eroute")
            .field("sel", &self.sel)
            .field("said", &self.said)
            .field("pid", &self.pid)
            .field("count", &self.count)
            .field("retained", &self.retained.is_some())
            .finish()
    }
}

#[derive(KStatProvider)]
pub struct ErouteStats {
    pub adds: KStatU64,
    pub removes: KStatU64,
    pub finds: KStatU64,
    pub misses: KStatU64,
}

/// The subnet entries sharing one selector mask.
struct MaskGroup {
    shape: Shape,
    mask: SelKey,
    entries: BTreeMap<SelKey, Eroute>,
}

// Where a lookup landed.
enum Slot {
    Group(usize, SelKey),
    Range(usize),
}

pub struct ErouteTable {
    limit: usize,
    len: usize,
    /// Sorted by shape, most specific first.
    groups: Vec<MaskGroup>,
    /// Sorted by [`SpecKey`].
    ranges: Vec<Eroute>,
    next_seq: u64,
    pub stats: ErouteStats,
}

impl ErouteTable {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            len: 0,
            groups: Vec::new(),
            ranges: Vec::new(),
            next_seq: 0,
            stats: ErouteStats::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// The number of distinct subnet masks in use.
    pub fn mask_groups(&self) -> usize {
        self.groups.len()
    }

    fn group_idx(&self, mask: &SelKey) -> Option<usize> {
        self.groups.iter().position(|g| g.mask == *mask)
    }

    fn slot_of(&self, sel: &Selector) -> Option<Slot> {
        if is_subnet(sel) {
            let gi = self.group_idx(&sel.mask())?;
            let key = sel.key();
            let found = self.groups[gi].entries.contains_key(&key);
            found.then_some(Slot::Group(gi, key))
        } else {
            self.ranges.iter().position(|e| e.sel == *sel).map(Slot::Range)
        }
    }

    fn slot(&self, slot: &Slot) -> Option<&Eroute> {
        match slot {
            Slot::Group(gi, key) => self.groups.get(*gi)?.entries.get(key),
            Slot::Range(ri) => self.ranges.get(*ri),
        }
    }

    fn slot_mut(&mut self, slot: &Slot) -> Option<&mut Eroute> {
        match slot {
            Slot::Group(gi, key) => {
                self.groups.get_mut(*gi)?.entries.get_mut(key)
            }
            Slot::Range(ri) => self.ranges.get_mut(*ri),
        }
    }

    fn take_slot(&mut self, slot: Slot) -> Option<Eroute> {
        let er = match slot {
            Slot::Group(gi, key) => {
                let group = self.groups.get_mut(gi)?;
                let er = group.entries.remove(&key)?;
                if group.entries.is_empty() {
                    self.groups.remove(gi);
                }
                er
            }
            Slot::Range(ri) => self.ranges.remove(ri),
        };
        self.len -= 1;
        Some(er)
    }

    fn insert(&mut self, mut er: Eroute) {
        er.seq = self.next_seq;
        self.next_seq += 1;
        self.len += 1;
        self.stats.adds.incr(1);

        if !is_subnet(&er.sel) {
            let key = er.spec_key();
            let idx = self.ranges.partition_point(|e| e.spec_key() < key);
            self.ranges.insert(idx, er);
            return;
        }

        let mask = er.sel.mask();
        let gi = match self.group_idx(&mask) {
            Some(gi) => gi,
            None => {
                let shape = shape_of(&er.sel);
                let gi = self
                    .groups
                    .partition_point(|g| (g.shape, g.mask) < (shape, mask));
                self.groups.insert(
                    gi,
                    MaskGroup { shape, mask, entries: BTreeMap::new() },
                );
                gi
            }
        };
        self.groups[gi].entries.insert(er.sel.key(), er);
    }

    /// Add an entry.
    ///
    /// # Errors
    ///
    /// An entry with an identical selector already exists, or the
    /// table is at its limit. Either way the table is unchanged.
    pub fn add(&mut self, er: Eroute) -> Result<(), ErouteError> {
        if self.slot_of(&er.sel).is_some() {
            return Err(ErouteError::Exists(er.sel));
        }

        if self.len >= self.limit {
            return Err(ErouteError::OutOfMemory(self.limit));
        }

        self.insert(er);
        Ok(())
    }

    /// Add an entry, displacing any entry with an identical selector.
    /// The displaced entry's retained packet is handed back.
    pub fn replace(&mut self, er: Eroute) -> Result<Option<Packet>, ErouteError> {
        let displaced = match self.slot_of(&er.sel) {
            Some(slot) => self.take_slot(slot),
            None if self.len >= self.limit => {
                return Err(ErouteError::OutOfMemory(self.limit));
            }
            None => None,
        };

        self.insert(er);
        Ok(displaced.and_then(|mut d| d.take_packet()))
    }

    // The best match: walk the groups in shape order, probing each
    // with the masked flow key, then the ranges.
    fn best(&self, flow: &FlowId) -> Option<Slot> {
        let fkey = flow.key();
        let mut best: Option<(SpecKey, Slot)> = None;

        for (gi, g) in self.groups.iter().enumerate() {
            if best.as_ref().is_some_and(|(k, _)| k.0 < g.shape) {
                break;
            }
            let key = masked(&fkey, &g.mask);
            if let Some(er) = g.entries.get(&key) {
                let sk = er.spec_key();
                if best.as_ref().is_none_or(|(k, _)| sk < *k) {
                    best = Some((sk, Slot::Group(gi, key)));
                }
            }
        }

        for (ri, er) in self.ranges.iter().enumerate() {
            let sk = er.spec_key();
            if best.as_ref().is_some_and(|(k, _)| *k < sk) {
                break;
            }
            if er.matches(flow) {
                best = Some((sk, Slot::Range(ri)));
                break;
            }
        }

        best.map(|(_, slot)| slot)
    }

    /// The best match for `flow`.
    pub fn find(&self, flow: &FlowId) -> Option<&Eroute> {
        self.stats.finds.incr(1);
        let found = self.best(flow).and_then(|slot| self.slot(&slot));
        if found.is_none() {
            self.stats.misses.incr(1);
        }
        found
    }

    /// The mutable flavor of [`Self::find()`].
    pub fn find_mut(&mut self, flow: &FlowId) -> Option<&mut Eroute> {
        self.stats.finds.incr(1);
        match self.best(flow) {
            Some(slot) => self.slot_mut(&slot),
            None => {
                self.stats.misses.incr(1);
                None
            }
        }
    }

    /// The entry with exactly this selector.
    pub fn get(&self, sel: &Selector) -> Option<&Eroute> {
        self.slot_of(sel).and_then(|slot| self.slot(&slot))
    }

    pub fn get_mut(&mut self, sel: &Selector) -> Option<&mut Eroute> {
        let slot = self.slot_of(sel)?;
        self.slot_mut(&slot)
    }

    /// Remove the entry with exactly this selector, handing back any
    /// packet it was holding.
    pub fn remove(&mut self, sel: &Selector) -> Result<Option<Packet>, ErouteError> {
        let slot = self.slot_of(sel).ok_or(ErouteError::NotFound(*sel))?;
        let mut er = self.take_slot(slot).ok_or(ErouteError::NotFound(*sel))?;
        self.stats.removes.incr(1);
        Ok(er.take_packet())
    }

    /// Drop every entry, and every retained packet with it. Returns the
    /// number of entries released.
    pub fn clear(&mut self) -> usize {
        let n = self.len;
        self.groups.clear();
        self.ranges.clear();
        self.len = 0;
        self.stats.removes.incr(n as u64);
        n
    }

    /// Every entry, subnet groups first in shape order, then ranges.
    pub fn iter(&self) -> impl Iterator<Item = &Eroute> {
        self.groups
            .iter()
            .flat_map(|g| g.entries.values())
            .chain(self.ranges.iter())
    }

    pub fn dump(&self) -> DumpErouteResp {
        DumpErouteResp {
            limit: self.limit as u64,
            entries: self.iter().map(Eroute::dump).collect(),
        }
    }
}

/// The eroute table behind its lock. This lock is distinct from the
/// SA store's.
pub struct Eroutes {
    table: KMutex<ErouteTable>,
}

impl Eroutes {
    pub fn new(limit: usize) -> Self {
        Self { table: KMutex::new(ErouteTable::new(limit)) }
    }

    pub fn lock(&self) -> KMutexGuard<'_, ErouteTable> {
        self.table.lock()
    }

    pub fn add(&self, er: Eroute) -> Result<(), ErouteError> {
        self.table.lock().add(er)
    }

    pub fn replace(&self, er: Eroute) -> Result<Option<Packet>, ErouteError> {
        self.table.lock().replace(er)
    }

    pub fn remove(&self, sel: &Selector) -> Result<Option<Packet>, ErouteError> {
        self.table.lock().remove(sel)
    }

    pub fn clear(&self) -> usize {
        self.table.lock().clear()
    }

    /// The SAId the best match for `flow` resolves to, without
    /// counting a hit.
    pub fn resolve(&self, flow: &FlowId) -> Option<SaId> {
        self.table.lock().find(flow).map(|e| e.said)
    }

    pub fn dump(&self) -> DumpErouteResp {
        self.table.lock().dump()
    }

    pub fn stats(&self) -> ErouteStatsSnap {
        self.table.lock().stats.snapshot()
    }

    /// A copy of the packet held by the entry for `sel`, if any.
    #[cfg(any(feature = "test-help", test))]
    pub fn retained_copy(&self, sel: &Selector) -> Option<alloc::vec::Vec<u8>> {
        let tbl = self.table.lock();
        tbl.get(sel)?.retained().map(|p| p.data().to_vec())
    }
}

impl Default for Eroutes {
    fn default() -> Self {
        Self::new(EROUTE_DEF_LIMIT)
    }
}
