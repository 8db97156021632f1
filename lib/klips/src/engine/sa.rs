// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The SA store.
//!
//! SAs live in an arena of slots and are addressed by an [`SaHandle`]:
//! a slot index plus the generation of the slot when the handle was
//! issued. Releasing an SA bumps the generation, so a handle kept
//! past removal resolves to nothing rather than to whatever SA later
//! reuses the slot.
//!
//! Lookup by [`SaId`] goes through a fixed array of hash buckets. The
//! bundle ("next transform"/"previous transform") links are kept
//! beside the SA in its slot, separate from bucket membership.
//!
//! The whole table sits behind a single [`KMutex`] in [`SaStore`].
//! The outbound path takes it once per bundle and does its pre-check,
//! sizing, and transforms within that one critical section.

use super::alg::AlgBinding;
use super::life::LifeKind;
use super::life::LifeStatus;
use super::life::SaLifetimes;
use crate::api::Direction;
use crate::api::DumpSaResp;
use crate::api::Identity;
use crate::api::Ipv4Addr;
use crate::api::KlipsError;
use crate::api::SaDump;
use crate::api::SaId;
use crate::api::SaProto;
use crate::api::SaState;
use crate::ddi::kstat::KStatProvider;
use crate::ddi::kstat::KStatU64;
use crate::ddi::sync::KMutex;
use crate::ddi::sync::KMutexGuard;
use alloc::boxed::Box;
use alloc::string::ToString;
use alloc::vec::Vec;
use core::fmt;
use core::fmt::Display;
use kstat_macro::KStatProvider;
use rand::RngCore;
use zeroize::Zeroize;

pub const SA_HASH_DEF_BUCKETS: usize = 257;

/// The longest bundle the store will hand out.
pub const BUNDLE_MAX: usize = 8;

pub type Bundle = heapless::Vec<SaHandle, BUNDLE_MAX>;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SaError {
    Exists(SaId),
    NotFound(SaId),
    /// The handle refers to an SA that has since been released.
    StaleHandle,
    StillLinked(SaId),
    AlreadyLinked(SaId),
    BundleTooLong,
}

impl Display for SaError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Exists(said) => write!(f, "SA exists: {said}"),
            Self::NotFound(said) => write!(f, "SA not found: {said}"),
            Self::StaleHandle => write!(f, "stale SA handle"),
            Self::StillLinked(said) => write!(f, "SA still linked: {said}"),
            Self::AlreadyLinked(said) => {
                write!(f, "SA already in a bundle: {said}")
            }
            Self::BundleTooLong => {
                write!(f, "bundle longer than {BUNDLE_MAX} SAs")
            }
        }
    }
}

impl From<SaError> for KlipsError {
    fn from(err: SaError) -> Self {
        match err {
            SaError::Exists(said) => KlipsError::SaExists(said.to_string()),
            SaError::NotFound(said) => KlipsError::SaNotFound(said.to_string()),
            SaError::StillLinked(said) => {
                KlipsError::StillLinked(said.to_string())
            }
            SaError::AlreadyLinked(said) => {
                KlipsError::StillLinked(said.to_string())
            }
            SaError::StaleHandle | SaError::BundleTooLong => {
                KlipsError::System {
                    errno: crate::api::EINVAL,
                    msg: err.to_string(),
                }
            }
        }
    }
}

/// A generation-checked reference to an SA slot.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct SaHandle {
    idx: u32,
    generation: u32,
}

/// Anti-replay state. Outbound only ever advances `last_seq`.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ReplayState {
    pub last_seq: u32,
    pub window: u8,
    pub bitmap: u64,
}

impl ReplayState {
    pub fn at_wrap(&self) -> bool {
        self.last_seq == u32::MAX
    }

    /// Advance to and return the next outbound sequence number, or
    /// `None` if the counter would wrap.
    pub fn next_seq(&mut self) -> Option<u32> {
        if self.at_wrap() {
            return None;
        }
        self.last_seq += 1;
        Some(self.last_seq)
    }
}

/// The verdict of an SA's outbound pre-check.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SaCheck {
    Ok,
    /// Usable, but a soft lifetime has fired.
    SoftExpired(LifeKind),
    Larval,
    Dead,
    ReplayWrap,
    HardExpired(LifeKind),
}

/// A security association.
pub struct Sa {
    pub said: SaId,
    pub state: SaState,
    pub dir: Direction,
    pub replay: ReplayState,
    pub life: SaLifetimes,
    /// Outer tunnel addresses, used by IPIP.
    pub addr_s: Option<Ipv4Addr>,
    pub addr_d: Option<Ipv4Addr>,
    pub enc: Option<AlgBinding>,
    pub auth: Option<AlgBinding>,
    pub comp: Option<AlgBinding>,
    iv: Box<[u8]>,
    pub ident_s: Option<Identity>,
    pub ident_d: Option<Identity>,
    pub pid: u32,
    scrubbed: bool,
}

impl Sa {
    /// A new, larval SA.
    pub fn new(said: SaId, dir: Direction) -> Self {
        Self {
            said,
            state: SaState::Larval,
            dir,
            replay: ReplayState::default(),
            life: SaLifetimes::default(),
            addr_s: None,
            addr_d: None,
            enc: None,
            auth: None,
            comp: None,
            iv: Box::default(),
            ident_s: None,
            ident_d: None,
            pid: 0,
            scrubbed: false,
        }
    }

    pub fn with_state(mut self, state: SaState) -> Self {
        self.state = state;
        self
    }

    /// Bind a cipher. The IV is sized for it and seeded at random.
    pub fn with_enc(mut self, enc: AlgBinding) -> Self {
        let mut iv = alloc::vec![0u8; enc.desc().iv_len].into_boxed_slice();
        rand::rng().fill_bytes(&mut iv);
        self.iv.zeroize();
        self.iv = iv;
        self.enc = Some(enc);
        self
    }

    pub fn with_auth(mut self, auth: AlgBinding) -> Self {
        self.auth = Some(auth);
        self
    }

    pub fn with_comp(mut self, comp: AlgBinding) -> Self {
        self.comp = Some(comp);
        self
    }

    pub fn with_tunnel(mut self, src: Ipv4Addr, dst: Ipv4Addr) -> Self {
        self.addr_s = Some(src);
        self.addr_d = Some(dst);
        self
    }

    pub fn with_lifetime(mut self, kind: LifeKind, soft: u64, hard: u64) -> Self {
        let lt = self.life.get_mut(kind);
        lt.update_hard(hard);
        lt.update_soft(soft);
        self
    }

    pub fn with_replay_window(mut self, window: u8) -> Self {
        self.replay.window = window;
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

    /// Start the add-time clock.
    pub fn mark_added(&mut self, now_secs: u64) {
        self.life.addtime.touch(now_secs);
    }

    pub fn iv(&self) -> &[u8] {
        &self.iv
    }

    /// Replace the IV, e.g. with the last ciphertext block for
    /// chaining. The length is fixed by the bound cipher.
    pub fn set_iv(&mut self, iv: &[u8]) {
        if iv.len() == self.iv.len() {
            self.iv.copy_from_slice(iv);
        }
    }

    /// Does this SA carry a replay counter?
    pub fn has_replay(&self) -> bool {
        matches!(self.said.proto, SaProto::Esp | SaProto::Ah)
    }

    /// Check this SA for outbound use. `pending_bytes` is the length
    /// of the packet about to go through it.
    pub fn precheck(&self, now_secs: u64, pending_bytes: u64) -> SaCheck {
        match self.state {
            SaState::Larval => return SaCheck::Larval,
            SaState::Dead => return SaCheck::Dead,
            SaState::Mature | SaState::Dying => (),
        }

        if self.has_replay() && self.replay.at_wrap() {
            return SaCheck::ReplayWrap;
        }

        let mut soft = None;
        for kind in LifeKind::CHECKED {
            let pending = match kind {
                LifeKind::Bytes => pending_bytes,
                LifeKind::Packets => 1,
                _ => 0,
            };

            match self.life.get(kind).check(kind.basis(), now_secs, pending) {
                LifeStatus::HardExpired => return SaCheck::HardExpired(kind),
                LifeStatus::SoftExpired if soft.is_none() => soft = Some(kind),
                _ => (),
            }
        }

        match soft {
            Some(kind) => SaCheck::SoftExpired(kind),
            None => SaCheck::Ok,
        }
    }

    /// Mark the SA dying after a soft expiry. Returns true only for
    /// the transition, so the caller notifies exactly once.
    pub fn mark_dying(&mut self) -> bool {
        if self.state == SaState::Dying {
            return false;
        }
        self.state = SaState::Dying;
        true
    }

    /// Account for a packet that went through this SA.
    pub fn record_use(&mut self, len: u64, now_secs: u64) {
        self.life.bytes.consume(len);
        self.life.usetime.touch(now_secs);
        self.life.packets.consume(1);
    }

    /// Scrub every piece of key material: each bound provider's
    /// destroy hook runs, then the keys, the IV and the identities are
    /// zeroed. Only the first call does anything.
    pub fn scrub(&mut self) {
        if self.scrubbed {
            return;
        }
        self.scrubbed = true;

        for binding in [&mut self.enc, &mut self.auth, &mut self.comp]
            .into_iter()
            .flatten()
        {
            binding.destroy();
        }
        self.iv.zeroize();
        for ident in [&mut self.ident_s, &mut self.ident_d].into_iter().flatten()
        {
            ident.id.zeroize();
        }
    }

    /// Does every key buffer and the IV read as zero?
    pub fn key_material_is_zero(&self) -> bool {
        let keys_zero = [&self.enc, &self.auth, &self.comp]
            .into_iter()
            .flatten()
            .all(|b| b.key().is_zero());
        keys_zero && self.iv.iter().all(|b| *b == 0)
    }

    pub fn dump(&self, now_secs: u64) -> SaDump {
        SaDump {
            said: self.said,
            state: self.state,
            dir: self.dir,
            replay_seq: self.replay.last_seq,
            replay_window: self.replay.window,
            enc_alg: self.enc.as_ref().map(|b| b.desc().name.to_string()),
            auth_alg: self.auth.as_ref().map(|b| b.desc().name.to_string()),
            addr_s: self.addr_s,
            addr_d: self.addr_d,
            next: None,
            prev: None,
            lifetimes: LifeKind::ALL
                .iter()
                .map(|k| self.life.get(*k).dump(*k, now_secs))
                .collect(),
        }
    }
}

impl Drop for Sa {
    fn drop(&mut self) {
        self.scrub();
    }
}

impl fmt::Debug for Sa {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Sa")
            .field("said", &self.said)
            .field("state", &self.state)
            .field("dir", &self.dir)
            .field("replay", &self.replay)
            .field("enc", &self.enc)
            .field("auth", &self.auth)
            .finish_non_exhaustive()
    }
}

#[derive(KStatProvider)]
pub struct SaStats {
    pub inserts: KStatU64,
    pub removes: KStatU64,
    pub wipes: KStatU64,
    pub chain_teardowns: KStatU64,
}

/// The outcome of tearing down one or more bundles. Teardown never
/// stops early; everything that went wrong along the way is listed in
/// `errors`.
#[derive(Debug, Default)]
pub struct Teardown {
    pub removed: Vec<SaId>,
    pub errors: Vec<SaError>,
}

impl Teardown {
    fn merge(&mut self, other: Teardown) {
        self.removed.extend(other.removed);
        self.errors.extend(other.errors);
    }
}

struct Slot {
    generation: u32,
    sa: Option<Sa>,
    next: Option<SaHandle>,
    prev: Option<SaHandle>,
}

pub struct SaTable {
    slots: Vec<Slot>,
    free: Vec<u32>,
    buckets: Vec<Vec<SaHandle>>,
    len: usize,
    pub stats: SaStats,
}

impl SaTable {
    pub fn new(buckets: usize) -> Self {
        let n = buckets.max(1);
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            buckets: (0..n).map(|_| Vec::new()).collect(),
            len: 0,
            stats: SaStats::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn bucket_of(&self, said: &SaId) -> usize {
        let h = said
            .spi
            .wrapping_add(u32::from(said.dst))
            .wrapping_add(u32::from(u8::from(said.proto)));
        h as usize % self.buckets.len()
    }

    fn slot(&self, h: SaHandle) -> Option<&Slot> {
        self.slots
            .get(h.idx as usize)
            .filter(|s| s.generation == h.generation && s.sa.is_some())
    }

    fn slot_mut(&mut self, h: SaHandle) -> Option<&mut Slot> {
        self.slots
            .get_mut(h.idx as usize)
            .filter(|s| s.generation == h.generation && s.sa.is_some())
    }

    /// Add an SA at the head of its hash bucket.
    pub fn insert(&mut self, sa: Sa) -> Result<SaHandle, SaError> {
        if self.lookup(&sa.said).is_some() {
            return Err(SaError::Exists(sa.said));
        }

        let bucket = self.bucket_of(&sa.said);
        let h = match self.free.pop() {
            Some(idx) => {
                let slot = &mut self.slots[idx as usize];
                slot.sa = Some(sa);
                slot.next = None;
                slot.prev = None;
                SaHandle { idx, generation: slot.generation }
            }

            None => {
                let idx = self.slots.len() as u32;
                self.slots.push(Slot {
                    generation: 0,
                    sa: Some(sa),
                    next: None,
                    prev: None,
                });
                SaHandle { idx, generation: 0 }
            }
        };

        self.buckets[bucket].insert(0, h);
        self.len += 1;
        self.stats.inserts.incr(1);
        Ok(h)
    }

    /// Find the SA with exactly this (proto, SPI, destination).
    pub fn lookup(&self, said: &SaId) -> Option<SaHandle> {
        self.buckets[self.bucket_of(said)].iter().copied().find(|h| {
            self.get(*h).map(|sa| sa.said == *said).unwrap_or(false)
        })
    }

    pub fn get(&self, h: SaHandle) -> Option<&Sa> {
        self.slot(h).and_then(|s| s.sa.as_ref())
    }

    pub fn get_mut(&mut self, h: SaHandle) -> Option<&mut Sa> {
        self.slot_mut(h).and_then(|s| s.sa.as_mut())
    }

    pub fn next_of(&self, h: SaHandle) -> Option<SaHandle> {
        self.slot(h).and_then(|s| s.next)
    }

    pub fn prev_of(&self, h: SaHandle) -> Option<SaHandle> {
        self.slot(h).and_then(|s| s.prev)
    }

    fn said_of(&self, h: SaHandle) -> Result<SaId, SaError> {
        self.get(h).map(|sa| sa.said).ok_or(SaError::StaleHandle)
    }

    /// Make `next` the transform applied after `first`.
    pub fn link(&mut self, first: SaHandle, next: SaHandle) -> Result<(), SaError> {
        let first_said = self.said_of(first)?;
        let next_said = self.said_of(next)?;

        if first == next || self.next_of(first).is_some() {
            return Err(SaError::AlreadyLinked(first_said));
        }

        if self.prev_of(next).is_some() {
            return Err(SaError::AlreadyLinked(next_said));
        }

        // Refuse to close a loop: `first` must not already follow
        // `next`.
        let mut cur = Some(next);
        while let Some(h) = cur {
            if h == first {
                return Err(SaError::AlreadyLinked(next_said));
            }
            cur = self.next_of(h);
        }

        if let Some(s) = self.slot_mut(first) {
            s.next = Some(next);
        }
        if let Some(s) = self.slot_mut(next) {
            s.prev = Some(first);
        }
        Ok(())
    }

    /// The bundle starting at `h`, following "next transform" links.
    pub fn bundle(&self, h: SaHandle) -> Result<Bundle, SaError> {
        let mut bundle = Bundle::new();
        let mut cur = Some(h);
        while let Some(c) = cur {
            if self.get(c).is_none() {
                return Err(SaError::StaleHandle);
            }
            bundle.push(c).map_err(|_| SaError::BundleTooLong)?;
            cur = self.next_of(c);
        }
        Ok(bundle)
    }

    /// Remove an SA that is not part of a bundle and hand it back.
    /// The caller wipes it.
    pub fn remove(&mut self, h: SaHandle) -> Result<Sa, SaError> {
        let said = self.said_of(h)?;
        if self.next_of(h).is_some() || self.prev_of(h).is_some() {
            return Err(SaError::StillLinked(said));
        }

        let bucket = self.bucket_of(&said);
        self.buckets[bucket].retain(|b| *b != h);

        let slot = &mut self.slots[h.idx as usize];
        let sa = slot.sa.take().ok_or(SaError::StaleHandle)?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(h.idx);
        self.len -= 1;
        self.stats.removes.incr(1);
        Ok(sa)
    }

    /// Scrub and release an SA.
    pub fn wipe(&self, mut sa: Sa) {
        sa.scrub();
        self.stats.wipes.incr(1);
        drop(sa);
    }

    /// Remove and wipe the whole bundle `h` belongs to, from its head
    /// to its tail.
    pub fn remove_chain(&mut self, h: SaHandle) -> Teardown {
        let mut td = Teardown::default();

        if self.get(h).is_none() {
            td.errors.push(SaError::StaleHandle);
            return td;
        }

        // Walk back to the head. The walk is bounded by the number of
        // slots so a corrupted chain can't spin forever.
        let mut head = h;
        for _ in 0..self.slots.len() {
            match self.prev_of(head) {
                Some(p) => head = p,
                None => break,
            }
        }

        let mut cur = Some(head);
        let mut budget = self.slots.len();
        while let Some(c) = cur {
            if budget == 0 {
                td.errors.push(SaError::BundleTooLong);
                break;
            }
            budget -= 1;

            cur = self.next_of(c);
            self.unlink(c);

            match self.remove(c) {
                Ok(sa) => {
                    td.removed.push(sa.said);
                    self.wipe(sa);
                }
                Err(e) => td.errors.push(e),
            }
        }

        self.stats.chain_teardowns.incr(1);
        td
    }

    fn unlink(&mut self, h: SaHandle) {
        let (prev, next) = match self.slot_mut(h) {
            Some(s) => (s.prev.take(), s.next.take()),
            None => return,
        };

        if let Some(s) = prev.and_then(|p| self.slot_mut(p)) {
            s.next = None;
        }
        if let Some(s) = next.and_then(|n| self.slot_mut(n)) {
            s.prev = None;
        }
    }

    /// Tear down every bundle containing an SA of protocol `proto`, or
    /// every bundle when `proto` is `None`.
    pub fn cleanup(&mut self, proto: Option<SaProto>) -> Teardown {
        let mut td = Teardown::default();

        for b in 0..self.buckets.len() {
            // Rescan from the bucket head after every teardown: it
            // may have removed entries from this bucket.
            loop {
                let victim = self.buckets[b].iter().copied().find(|h| {
                    match (proto, self.get(*h)) {
                        (_, None) => false,
                        (None, Some(_)) => true,
                        (Some(p), Some(sa)) => sa.said.proto == p,
                    }
                });

                match victim {
                    Some(h) => td.merge(self.remove_chain(h)),
                    None => break,
                }
            }
        }

        td
    }

    pub fn dump(&self, now_secs: u64) -> DumpSaResp {
        let mut entries = Vec::with_capacity(self.len);
        for bucket in &self.buckets {
            for h in bucket {
                if let Some(sa) = self.get(*h) {
                    let mut d = sa.dump(now_secs);
                    d.next = self.next_of(*h).and_then(|n| self.said_of(n).ok());
                    d.prev = self.prev_of(*h).and_then(|p| self.said_of(p).ok());
                    entries.push(d);
                }
            }
        }
        entries.sort_by_key(|d| d.said);
        DumpSaResp { entries }
    }
}

/// The SA store: the table behind its lock.
pub struct SaStore {
    table: KMutex<SaTable>,
}

impl SaStore {
    pub fn new(buckets: usize) -> Self {
        Self { table: KMutex::new(SaTable::new(buckets)) }
    }

    pub fn lock(&self) -> KMutexGuard<'_, SaTable> {
        self.table.lock()
    }

    pub fn insert(&self, sa: Sa) -> Result<SaHandle, SaError> {
        self.table.lock().insert(sa)
    }

    pub fn lookup(&self, said: &SaId) -> Option<SaHandle> {
        self.table.lock().lookup(said)
    }

    /// Link two SAs, by id, into a bundle.
    pub fn link(&self, first: &SaId, next: &SaId) -> Result<(), SaError> {
        let mut t = self.table.lock();
        let f = t.lookup(first).ok_or(SaError::NotFound(*first))?;
        let n = t.lookup(next).ok_or(SaError::NotFound(*next))?;
        t.link(f, n)
    }

    /// Remove and wipe a single, unbundled SA.
    pub fn delete(&self, said: &SaId) -> Result<(), SaError> {
        let mut t = self.table.lock();
        let h = t.lookup(said).ok_or(SaError::NotFound(*said))?;
        let sa = t.remove(h)?;
        t.wipe(sa);
        Ok(())
    }

    /// Remove and wipe the bundle containing `said`.
    pub fn delete_chain(&self, said: &SaId) -> Result<Teardown, SaError> {
        let mut t = self.table.lock();
        let h = t.lookup(said).ok_or(SaError::NotFound(*said))?;
        Ok(t.remove_chain(h))
    }

    pub fn cleanup(&self, proto: Option<SaProto>) -> Teardown {
        self.table.lock().cleanup(proto)
    }

    pub fn dump(&self, now_secs: u64) -> DumpSaResp {
        self.table.lock().dump(now_secs)
    }

    /// Run `f` on the SA under the store lock.
    pub fn with_sa<F, R>(&self, said: &SaId, f: F) -> Option<R>
    where
        F: FnOnce(&mut Sa) -> R,
    {
        let mut t = self.table.lock();
        let h = t.lookup(said)?;
        t.get_mut(h).map(f)
    }

    pub fn stats(&self) -> SaStatsSnap {
        self.table.lock().stats.snapshot()
    }
}

impl Default for SaStore {
    fn default() -> Self {
        Self::new(SA_HASH_DEF_BUCKETS)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::engine::alg::AlgRegistry;
    use crate::engine::alg::AlgType;
    use crate::engine::alg::ESP_AES;

    fn said(proto: SaProto, spi: u32) -> SaId {
        SaId::new(proto, spi, "192.168.1.1".parse().unwrap())
    }

    fn mature(proto: SaProto, spi: u32) -> Sa {
        Sa::new(said(proto, spi), Direction::Out).with_state(SaState::Mature)
    }

    #[test]
    fn insert_lookup_remove() {
        let mut t = SaTable::new(SA_HASH_DEF_BUCKETS);
        let id = said(SaProto::Esp, 0x1000);
        let h = t.insert(mature(SaProto::Esp, 0x1000)).unwrap();
        assert_eq!(t.lookup(&id), Some(h));
        assert_eq!(t.get(h).unwrap().said, id);

        // Same SPI and destination, different proto: a different SA.
        assert!(t.lookup(&said(SaProto::Ah, 0x1000)).is_none());
        assert_eq!(
            t.insert(mature(SaProto::Esp, 0x1000)).unwrap_err(),
            SaError::Exists(id)
        );

        let sa = t.remove(h).unwrap();
        t.wipe(sa);
        assert!(t.lookup(&id).is_none());
        assert!(t.get(h).is_none());
        assert_eq!(t.remove(h).unwrap_err(), SaError::StaleHandle);
        assert_eq!(t.stats.snapshot().wipes, 1);
    }

    #[test]
    fn stale_handle_after_slot_reuse() {
        let mut t = SaTable::new(1);
        let h1 = t.insert(mature(SaProto::Esp, 1)).unwrap();
        let sa = t.remove(h1).unwrap();
        t.wipe(sa);
        let h2 = t.insert(mature(SaProto::Esp, 2)).unwrap();
        assert!(t.get(h1).is_none());
        assert_eq!(t.get(h2).unwrap().said.spi, 2);
    }

    #[test]
    fn linked_sa_refuses_remove() {
        let mut t = SaTable::new(7);
        let a = t.insert(mature(SaProto::Ipip, 1)).unwrap();
        let b = t.insert(mature(SaProto::Esp, 2)).unwrap();
        t.link(a, b).unwrap();
        assert!(matches!(t.remove(a), Err(SaError::StillLinked(_))));
        assert!(matches!(t.remove(b), Err(SaError::StillLinked(_))));
        assert!(matches!(t.link(b, a), Err(SaError::AlreadyLinked(_))));
        assert_eq!(t.bundle(a).unwrap().as_slice(), &[a, b]);
    }

    #[test]
    fn remove_chain_from_middle() {
        let mut t = SaTable::new(3);
        let a = t.insert(mature(SaProto::Ipip, 1)).unwrap();
        let b = t.insert(mature(SaProto::Esp, 2)).unwrap();
        let c = t.insert(mature(SaProto::Ah, 3)).unwrap();
        let other = t.insert(mature(SaProto::Esp, 4)).unwrap();
        t.link(a, b).unwrap();
        t.link(b, c).unwrap();

        let td = t.remove_chain(b);
        assert!(td.errors.is_empty());
        assert_eq!(td.removed.len(), 3);
        assert_eq!(td.removed[0].spi, 1);
        assert_eq!(t.len(), 1);
        assert!(t.get(other).is_some());
    }

    #[test]
    fn cleanup_by_proto() {
        let mut t = SaTable::new(2);
        for spi in 0..10 {
            t.insert(mature(SaProto::Esp, spi)).unwrap();
            t.insert(mature(SaProto::Ah, spi)).unwrap();
        }
        let x = t.lookup(&said(SaProto::Ah, 3)).unwrap();
        let y = t.lookup(&said(SaProto::Esp, 3)).unwrap();
        t.link(x, y).unwrap();

        let td = t.cleanup(Some(SaProto::Ah));
        assert!(td.errors.is_empty());
        // All AH plus the ESP bundled with one of them.
        assert_eq!(td.removed.len(), 11);
        assert_eq!(t.len(), 9);

        t.cleanup(None);
        assert!(t.is_empty());
    }

    #[test]
    fn scrub_zeroes_keys_and_iv() {
        let reg = AlgRegistry::with_builtins();
        let enc = reg.bind(AlgType::Encrypt, ESP_AES, &[0xAB; 16]).unwrap();
        let mut sa = mature(SaProto::Esp, 9).with_enc(enc).with_idents(
            Some(Identity { kind: 2, id: "east".into() }),
            None,
        );
        assert_eq!(sa.iv().len(), 16);
        assert!(!sa.key_material_is_zero());

        sa.scrub();
        assert!(sa.key_material_is_zero());
        assert_eq!(sa.iv().len(), 16);
        assert!(sa.ident_s.as_ref().unwrap().id.is_empty());
    }

    #[test]
    fn precheck_order() {
        let mut sa = mature(SaProto::Esp, 1)
            .with_lifetime(LifeKind::Bytes, 500, 1000)
            .with_lifetime(LifeKind::Packets, 0, 3);
        assert_eq!(sa.precheck(10, 100), SaCheck::Ok);

        sa.record_use(600, 10);
        assert_eq!(sa.precheck(10, 100), SaCheck::SoftExpired(LifeKind::Bytes));
        assert!(sa.mark_dying());
        assert!(!sa.mark_dying());
        assert_eq!(sa.precheck(10, 401), SaCheck::HardExpired(LifeKind::Bytes));

        sa.record_use(1, 10);
        sa.record_use(1, 10);
        assert_eq!(
            sa.precheck(10, 0),
            SaCheck::HardExpired(LifeKind::Packets)
        );

        sa.replay.last_seq = u32::MAX;
        assert_eq!(sa.precheck(10, 0), SaCheck::ReplayWrap);
        assert_eq!(sa.replay.next_seq(), None);

        let larval = Sa::new(said(SaProto::Esp, 2), Direction::Out);
        assert_eq!(larval.precheck(0, 0), SaCheck::Larval);
        let dead = mature(SaProto::Esp, 3).with_state(SaState::Dead);
        assert_eq!(dead.precheck(0, 0), SaCheck::Dead);

        // IPIP has no sequence number.
        let mut tun = mature(SaProto::Ipip, 4);
        tun.replay.last_seq = u32::MAX;
        assert_eq!(tun.precheck(0, 0), SaCheck::Ok);
    }

    #[test]
    fn dump_lists_links_and_lifetimes() {
        let store = SaStore::new(5);
        let mut a = mature(SaProto::Ipip, 1);
        a.life.bytes.consume(77);
        store.insert(a).unwrap();
        store.insert(mature(SaProto::Esp, 2)).unwrap();
        store
            .link(&said(SaProto::Ipip, 1), &said(SaProto::Esp, 2))
            .unwrap();

        let dump = store.dump(0);
        assert_eq!(dump.entries.len(), 2);
        let tun = dump.entries.iter().find(|d| d.said.spi == 1).unwrap();
        assert_eq!(tun.next, Some(said(SaProto::Esp, 2)));
        assert_eq!(tun.lifetimes[0].text, "bytes(77,0,0)");

        assert!(matches!(
            store.delete(&said(SaProto::Esp, 2)),
            Err(SaError::StillLinked(_))
        ));
        let td = store.delete_chain(&said(SaProto::Esp, 2)).unwrap();
        assert_eq!(td.removed.len(), 2);
        assert_eq!(store.stats().chain_teardowns, 1);
    }
}
