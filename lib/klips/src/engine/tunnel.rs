// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The outbound encapsulation pipeline.
//!
//! A [`Tunnel`] is the virtual interface outbound traffic is routed
//! into. Each packet handed to [`Tunnel::xmit()`] runs to completion
//! on the calling thread:
//!
//! 1. Extract the flow from the IPv4 header.
//! 2. Let local key-management traffic through untouched.
//! 3. Look the flow up in the eroute table and act on the shunt, or
//!    carry on with the SA it names.
//! 4. Pre-check every SA of the bundle: state, replay counter and
//!    lifetimes.
//! 5. Size the bundle's headers and trailers once, adjusting the
//!    advertised MTU and signalling the sender if needed.
//! 6. Apply the transforms in bundle order.
//! 7. Look the rewritten packet up again; if it now belongs to
//!    another gateway's tunnel, go around again.
//! 8. Put back the link-layer framing and hand the packet back.
//!
//! The eroute and SA locks are never held together. Anything destined
//! for key management or the ICMP sink is collected along the way and
//! delivered once the packet is done with both.

use super::alg::AlgError;
use super::eroute::Eroute;
use super::eroute::Eroutes;
use super::icmp;
use super::icmp::IcmpSignal;
use super::icmp::IcmpSink;
use super::ip4::AhHdrRaw;
use super::ip4::CompHdrRaw;
use super::ip4::EspHdrRaw;
use super::ip4::FlowId;
use super::ip4::IP_MAX_LEN;
use super::ip4::IPV4_HDR_LEN;
use super::ip4::Ipv4Error;
use super::ip4::Ipv4HdrRaw;
use super::life::LifeKind;
use super::notify::AcquireTemplate;
use super::notify::ExpireNotice;
use super::notify::ExpireReason;
use super::notify::KeyMgmt;
use super::packet::Packet;
use super::packet::PacketError;
use super::sa::BUNDLE_MAX;
use super::sa::Bundle;
use super::sa::Sa;
use super::sa::SaCheck;
use super::sa::SaError;
use super::sa::SaHandle;
use super::sa::SaStore;
use super::sa::SaTable;
use crate::ExecCtx;
use crate::api::AddrSpec;
use crate::api::PROTO_AH;
use crate::api::PROTO_COMP;
use crate::api::PROTO_ESP;
use crate::api::PROTO_ICMP;
use crate::api::PROTO_IPIP;
use crate::api::PROTO_UDP;
use crate::api::SaId;
use crate::api::SaProto;
use crate::api::SaTarget;
use crate::api::Selector;
use crate::api::Shunt;
use crate::cfg::TunnelCfg;
use crate::cfg::TunnelFlags;
use crate::ddi::kstat;
use crate::ddi::kstat::KStatNamed;
use crate::ddi::kstat::KStatProvider;
use crate::ddi::kstat::KStatU64;
use crate::ddi::time::Moment;
use crate::provider::LogLevel;
use alloc::format;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::fmt::Display;
use core::sync::atomic::AtomicU32;
use core::sync::atomic::Ordering;
use kstat_macro::KStatProvider;
use zerocopy::FromBytes;
use zerocopy::IntoBytes;

/// The pad length and next header bytes closing every ESP payload.
pub const ESP_TRAILER_LEN: usize = 2;

/// The padding alignment used when the cipher has no block structure.
pub const ESP_MIN_ALIGN: usize = 4;

/// The largest authenticator the pipeline will embed.
pub const MAX_ICV_LEN: usize = 64;

/// The number of ESP padding bytes needed to align `payload` plus the
/// trailer to the cipher's block size.
pub fn esp_pad_len(payload: usize, block_size: usize) -> usize {
    let bs = if block_size <= 1 { ESP_MIN_ALIGN } else { block_size };
    (bs - ((payload + ESP_TRAILER_LEN) % bs)) % bs
}

/// The outcome of pushing a packet through the tunnel.
#[derive(Debug)]
pub enum ProcessResult {
    /// Send the packet as it came in.
    Bypass(Packet),
    /// Send the encapsulated packet.
    Modified(Packet),
    /// The packet was consumed: dropped, or kept by a hold entry.
    Drop { reason: DropReason },
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DropReason {
    Policy(PolicyDrop),
    Error(XmitError),
}

/// Drops decided by policy rather than by a failure.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PolicyDrop {
    /// No eroute covers the packet.
    NoEroute,
    Drop,
    /// Dropped, and the sender told so with an ICMP.
    Reject,
    /// Kept by a hold entry, replacing whatever it held before.
    Hold,
    /// Kept by a newly installed hold entry while key management is
    /// asked for SAs.
    Trap,
    /// An internal SAId with an SPI outside the shunt range.
    UnknownShunt(u32),
    TtlExpired,
}

impl Display for PolicyDrop {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::NoEroute => write!(f, "no eroute"),
            Self::Drop => write!(f, "{}", Shunt::Drop),
            Self::Reject => write!(f, "{}", Shunt::Reject),
            Self::Hold => write!(f, "{}", Shunt::Hold),
            Self::Trap => write!(f, "{}", Shunt::Trap),
            Self::UnknownShunt(spi) => write!(f, "unknown shunt {spi:#x}"),
            Self::TtlExpired => write!(f, "ttl expired"),
        }
    }
}

/// Failures of the outbound path. Every one of them drops the packet.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum XmitError {
    /// The eroute names an SA the store doesn't have.
    LookupMiss(SaId),
    AllocationFailure(usize),
    MalformedHeader(Ipv4Error),
    /// The SA lacks a provider its transform needs, or the provider
    /// refused the operation.
    UnsupportedAlgorithm(SaId),
    LarvalSa(SaId),
    DeadSa(SaId),
    ReplayWrap(SaId),
    LifetimeHardExpired { said: SaId, kind: LifeKind },
    BufferTooSmall(usize),
    NestingTooDeep(usize),
}

impl Display for XmitError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::LookupMiss(said) => write!(f, "no SA {said}"),
            Self::AllocationFailure(sz) => {
                write!(f, "failed to allocate {sz} bytes")
            }
            Self::MalformedHeader(e) => write!(f, "malformed header: {e}"),
            Self::UnsupportedAlgorithm(said) => {
                write!(f, "unsupported algorithm on {said}")
            }
            Self::LarvalSa(said) => write!(f, "SA {said} is larval"),
            Self::DeadSa(said) => write!(f, "SA {said} is dead"),
            Self::ReplayWrap(said) => {
                write!(f, "replay counter of {said} would wrap")
            }
            Self::LifetimeHardExpired { said, kind } => {
                write!(f, "{kind} hard lifetime of {said} expired")
            }
            Self::BufferTooSmall(len) => {
                write!(f, "packet of {len} bytes does not fit")
            }
            Self::NestingTooDeep(depth) => {
                write!(f, "tunnel nesting deeper than {depth}")
            }
        }
    }
}

impl From<Ipv4Error> for XmitError {
    fn from(e: Ipv4Error) -> Self {
        Self::MalformedHeader(e)
    }
}

impl From<PacketError> for XmitError {
    fn from(e: PacketError) -> Self {
        match e {
            PacketError::AllocFailed(sz) => Self::AllocationFailure(sz),
            PacketError::NoRoom { want, .. } => Self::BufferTooSmall(want),
            PacketError::OutOfBounds { len, .. } => Self::BufferTooSmall(len),
        }
    }
}

#[derive(KStatProvider)]
pub struct TunnelStats {
    /// Packets handed to `xmit()`.
    pub out_pkts: KStatU64,
    pub out_bypass: KStatU64,
    pub out_modified: KStatU64,

    /// Packets dropped by policy, in total and by reason.
    pub out_drop: KStatU64,
    pub out_drop_no_eroute: KStatU64,
    pub out_drop_shunt: KStatU64,
    pub out_drop_reject: KStatU64,
    pub out_drop_hold: KStatU64,
    pub out_drop_trap: KStatU64,
    pub out_drop_unknown_shunt: KStatU64,
    pub out_drop_ttl: KStatU64,

    /// Packets dropped by an error, in total and by kind.
    pub out_err: KStatU64,
    pub out_err_lookup_miss: KStatU64,
    pub out_err_alloc: KStatU64,
    pub out_err_malformed: KStatU64,
    pub out_err_unsupported_alg: KStatU64,
    pub out_err_larval: KStatU64,
    pub out_err_dead: KStatU64,
    pub out_err_replay_wrap: KStatU64,
    pub out_err_hard_expired: KStatU64,
    pub out_err_too_big: KStatU64,
    pub out_err_nesting: KStatU64,

    pub acquire_sent: KStatU64,
    pub acquire_failed: KStatU64,
    pub expire_sent: KStatU64,
    pub expire_failed: KStatU64,
    pub icmp_sent: KStatU64,
    /// Signals withheld because of what they would answer.
    pub icmp_suppressed: KStatU64,
    pub mtu_shrinks: KStatU64,
    pub bundle_teardowns: KStatU64,
}

/// The room one transform needs, worked out before anything is
/// applied.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
struct XformPlan {
    head: usize,
    tail: usize,
    /// The length of the datagram entering the transform.
    in_len: usize,
}

#[derive(Debug, Default)]
struct BundlePlan {
    xforms: heapless::Vec<XformPlan, BUNDLE_MAX>,
    head: usize,
    tail: usize,
}

/// Messages produced while locks are held, delivered afterwards.
#[derive(Default)]
struct Outbox {
    expires: Vec<ExpireNotice>,
    icmp: Vec<Packet>,
}

impl Outbox {
    fn expire(&mut self, sa: &Sa, reason: ExpireReason, hard: bool) {
        self.expires.push(ExpireNotice {
            said: sa.said,
            reason,
            hard,
            lifetimes: sa.life.clone(),
        });
    }
}

/// What the first eroute lookup decided, carried out of the lock.
enum Verdict {
    Pass(Packet),
    Sa(SaId, Packet),
    Acquire { tmpl: AcquireTemplate, sel: Selector, subnet: bool },
    Done(ProcessResult),
}

/// The match data copied out of an eroute so the table can be used
/// again.
struct Hit {
    sel: Selector,
    said: SaId,
}

pub struct Tunnel {
    cfg: TunnelCfg,
    flags: TunnelFlags,
    /// The advertised MTU. It only ever shrinks.
    mtu: AtomicU32,
    ectx: Arc<ExecCtx>,
    sas: Arc<SaStore>,
    eroutes: Arc<Eroutes>,
    keymgmt: Arc<dyn KeyMgmt>,
    icmp: Arc<dyn IcmpSink>,
    stats: KStatNamed<TunnelStats>,
}

impl Tunnel {
    pub fn new(
        cfg: TunnelCfg,
        ectx: Arc<ExecCtx>,
        sas: Arc<SaStore>,
        eroutes: Arc<Eroutes>,
        keymgmt: Arc<dyn KeyMgmt>,
        icmp: Arc<dyn IcmpSink>,
    ) -> Result<Self, kstat::Error> {
        let stats = KStatNamed::new("klips", &cfg.name, TunnelStats::new())?;
        Ok(Self {
            flags: cfg.flags(),
            mtu: AtomicU32::new(u32::from(cfg.mtu)),
            cfg,
            ectx,
            sas,
            eroutes,
            keymgmt,
            icmp,
            stats,
        })
    }

    pub fn name(&self) -> &str {
        &self.cfg.name
    }

    pub fn cfg(&self) -> &TunnelCfg {
        &self.cfg
    }

    /// The MTU currently advertised for the tunnel.
    pub fn mtu(&self) -> u16 {
        self.mtu.load(Ordering::Relaxed) as u16
    }

    pub fn sas(&self) -> &Arc<SaStore> {
        &self.sas
    }

    pub fn eroutes(&self) -> &Arc<Eroutes> {
        &self.eroutes
    }

    pub fn stats(&self) -> TunnelStatsSnap {
        self.stats.vals.snapshot()
    }

    pub fn kstats(&self) -> &KStatNamed<TunnelStats> {
        &self.stats
    }

    /// Send one outbound packet through the tunnel.
    pub fn xmit(&self, pkt: Packet) -> ProcessResult {
        self.xmit_at(pkt, Moment::now())
    }

    /// Send one outbound packet, with lifetimes judged as of `now`.
    pub fn xmit_at(&self, pkt: Packet, now: Moment) -> ProcessResult {
        let mut outbox = Outbox::default();
        let res = self.process(pkt, now.secs(), &mut outbox);
        self.flush(outbox);
        self.update_stats(&res);

        match res {
            Ok(pr) => pr,
            Err(e) => {
                self.ectx.log.log(LogLevel::Note, &format!("xmit drop: {e}"));
                ProcessResult::Drop { reason: DropReason::Error(e) }
            }
        }
    }

    fn process(
        &self,
        mut pkt: Packet,
        now_secs: u64,
        outbox: &mut Outbox,
    ) -> Result<ProcessResult, XmitError> {
        let (total_len, ttl) = {
            let ip = Ipv4HdrRaw::parse(pkt.data())?;
            (usize::from(ip.total_len()), ip.ttl)
        };

        // Anything past the datagram is link padding.
        if pkt.len() > total_len {
            pkt.trim_tail(pkt.len() - total_len)?;
        }

        if ttl == 0 {
            self.queue_icmp(IcmpSignal::TtlExceeded, &pkt, outbox);
            return Ok(policy_drop(PolicyDrop::TtlExpired));
        }

        let flow = FlowId::from_ipv4(pkt.data())?;
        let (mut said, mut pkt) = match self.resolve(&flow, pkt, now_secs, outbox)
        {
            Verdict::Pass(pkt) => return self.emit(pkt, ProcessResult::Bypass),
            Verdict::Sa(said, pkt) => (said, pkt),
            Verdict::Acquire { tmpl, sel, subnet } => {
                return Ok(self.acquire(tmpl, sel, subnet));
            }
            Verdict::Done(pr) => return Ok(pr),
        };

        let max_nesting = usize::from(self.cfg.max_nesting);
        let mut depth = 1;
        loop {
            self.xmit_bundle(said, &mut pkt, now_secs, outbox)?;

            // The rewritten packet may itself fall under a tunnel to
            // another gateway.
            let flow = FlowId::from_ipv4(pkt.data())?;
            let next = {
                let mut tbl = self.eroutes.lock();
                tbl.find_mut(&flow).map(|er| {
                    er.hit(now_secs);
                    er.said
                })
            };

            match next {
                Some(n)
                    if !n.dst.is_any()
                        && n.dst != said.dst
                        && n.target() == SaTarget::Sa =>
                {
                    if depth >= max_nesting {
                        return Err(XmitError::NestingTooDeep(max_nesting));
                    }
                    depth += 1;
                    said = n;
                }

                _ => break,
            }
        }

        self.emit(pkt, ProcessResult::Modified)
    }

    fn emit(
        &self,
        mut pkt: Packet,
        wrap: fn(Packet) -> ProcessResult,
    ) -> Result<ProcessResult, XmitError> {
        pkt.restore_l2()?;
        Ok(wrap(pkt))
    }

    fn is_key_mgmt(&self, flow: &FlowId) -> bool {
        flow.proto == PROTO_UDP
            && self.cfg.key_mgmt_ports.contains(&flow.sport)
            && self.cfg.is_local(flow.src)
    }

    /// The first policy lookup. Everything that must happen under the
    /// eroute lock happens here; the lock is released on return.
    fn resolve(
        &self,
        flow: &FlowId,
        pkt: Packet,
        now_secs: u64,
        outbox: &mut Outbox,
    ) -> Verdict {
        let mut tbl = self.eroutes.lock();
        let found = tbl.find_mut(flow);

        // Our own key-management traffic goes out in the clear unless
        // it is already bound for a tunnel to some other peer.
        if self.is_key_mgmt(flow)
            && found
                .as_ref()
                .is_none_or(|er| er.said.dst.is_any() || er.said.dst == flow.dst)
        {
            return Verdict::Pass(pkt);
        }

        let hit = match found {
            Some(er) => {
                er.hit(now_secs);
                Hit { sel: er.sel, said: er.said }
            }

            None => return Verdict::Done(policy_drop(PolicyDrop::NoEroute)),
        };

        let shunt = match hit.said.target() {
            SaTarget::Sa => return Verdict::Sa(hit.said, pkt),
            SaTarget::UnknownShunt(spi) => {
                self.ectx.log.log(
                    LogLevel::Warn,
                    &format!("eroute {} has unknown shunt {spi:#x}", hit.sel),
                );
                return Verdict::Done(policy_drop(PolicyDrop::UnknownShunt(spi)));
            }
            SaTarget::Shunt(shunt) => shunt,
        };

        match shunt {
            Shunt::Pass => Verdict::Pass(pkt),

            Shunt::Drop => Verdict::Done(policy_drop(PolicyDrop::Drop)),

            Shunt::Reject => {
                self.queue_icmp(IcmpSignal::Filtered, &pkt, outbox);
                Verdict::Done(policy_drop(PolicyDrop::Reject))
            }

            Shunt::Hold => {
                if let Some(er) = tbl.get_mut(&hit.sel) {
                    // The packet it was holding is released here.
                    er.retain_packet(pkt);
                }
                Verdict::Done(policy_drop(PolicyDrop::Hold))
            }

            Shunt::Trap => {
                let Some(trap) = tbl.get(&hit.sel) else {
                    return Verdict::Done(policy_drop(PolicyDrop::Drop));
                };
                let tmpl = acquire_template(flow, trap);

                // Park the packet under an exact-match hold so the
                // rest of this flow waits on the same negotiation.
                let sel = Selector::new(
                    AddrSpec::host(flow.src),
                    AddrSpec::host(flow.dst),
                )
                .with_proto(flow.proto)
                .with_ports(flow.sport, flow.dport);
                let hold = Eroute::new(sel, SaId::shunt(Shunt::Hold))
                    .with_pid(tmpl.pid)
                    .with_idents(tmpl.ident_s.clone(), tmpl.ident_d.clone())
                    .with_packet(pkt);

                match tbl.replace(hold) {
                    Ok(_) => Verdict::Acquire { tmpl, sel, subnet: false },
                    Err(e) => {
                        self.ectx.log.log(
                            LogLevel::Warn,
                            &format!("failed to install hold for {flow}: {e}"),
                        );
                        Verdict::Done(policy_drop(PolicyDrop::Trap))
                    }
                }
            }

            Shunt::TrapSubnet => {
                let Some(er) = tbl.get_mut(&hit.sel) else {
                    return Verdict::Done(policy_drop(PolicyDrop::Drop));
                };
                let tmpl = acquire_template(flow, er);
                er.said = SaId::shunt(Shunt::Hold);
                er.retain_packet(pkt);
                Verdict::Acquire { tmpl, sel: hit.sel, subnet: true }
            }
        }
    }

    /// Ask key management for SAs on behalf of a trapped packet. The
    /// hold installed for it is rolled back if the request can't be
    /// delivered.
    fn acquire(
        &self,
        tmpl: AcquireTemplate,
        sel: Selector,
        subnet: bool,
    ) -> ProcessResult {
        let stats = &self.stats.vals;
        let err = match self.keymgmt.acquire(&tmpl) {
            Ok(()) => {
                stats.acquire_sent.incr(1);
                return policy_drop(PolicyDrop::Trap);
            }
            Err(e) => e,
        };

        stats.acquire_failed.incr(1);
        self.ectx.log.log(
            LogLevel::Note,
            &format!("acquire for {} failed: {err}", tmpl.flow),
        );

        let hold = SaId::shunt(Shunt::Hold);
        let mut tbl = self.eroutes.lock();
        if subnet {
            if let Some(er) = tbl.get_mut(&sel) {
                if er.said == hold {
                    er.said = SaId::shunt(Shunt::TrapSubnet);
                    er.take_packet();
                }
            }
        } else if tbl.get(&sel).is_some_and(|er| er.said == hold) {
            // Removal releases the retained packet.
            let _ = tbl.remove(&sel);
        }

        policy_drop(PolicyDrop::Trap)
    }

    /// Run `pkt` through the bundle headed by `said`. This is the one
    /// critical section on the SA store per bundle.
    fn xmit_bundle(
        &self,
        said: SaId,
        pkt: &mut Packet,
        now_secs: u64,
        outbox: &mut Outbox,
    ) -> Result<(), XmitError> {
        let mut tbl = self.sas.lock();
        let head = tbl.lookup(&said).ok_or(XmitError::LookupMiss(said))?;
        let bundle = tbl.bundle(head).map_err(|e| match e {
            SaError::BundleTooLong => XmitError::NestingTooDeep(BUNDLE_MAX),
            _ => XmitError::LookupMiss(said),
        })?;

        // Sizing is pure; work it out first so the lifetime check can
        // count the bytes each SA is about to see. Its failure only
        // matters once every SA has passed the pre-check.
        let sizing = size_bundle(&tbl, said, &bundle, pkt.len());
        let soft = self.precheck(
            &mut tbl, said, &bundle, head, &sizing, pkt.len(), now_secs, outbox,
        )?;
        let plan = sizing?;

        for (h, kind) in soft {
            if let Some(sa) = tbl.get_mut(h) {
                if sa.mark_dying() {
                    self.ectx.log.log(
                        LogLevel::Note,
                        &format!("SA {} soft {kind} lifetime expired", sa.said),
                    );
                    outbox.expire(sa, ExpireReason::Lifetime(kind), false);
                }
            }
        }

        self.check_mtu(pkt, &plan, outbox)?;
        pkt.grow(plan.head, plan.tail)?;

        for h in bundle.iter() {
            let sa = tbl.get_mut(*h).ok_or(XmitError::LookupMiss(said))?;
            let in_len = pkt.len();
            let proto = self.apply(sa, pkt)?;
            fix_ip_hdr(pkt, proto)?;
            sa.record_use(in_len as u64, now_secs);
        }

        Ok(())
    }

    /// Check every member of the bundle before any is touched. Returns
    /// the members whose soft lifetimes have fired.
    #[allow(clippy::too_many_arguments)]
    fn precheck(
        &self,
        tbl: &mut SaTable,
        said: SaId,
        bundle: &Bundle,
        head: SaHandle,
        sizing: &Result<BundlePlan, XmitError>,
        pkt_len: usize,
        now_secs: u64,
        outbox: &mut Outbox,
    ) -> Result<heapless::Vec<(SaHandle, LifeKind), BUNDLE_MAX>, XmitError> {
        let mut soft = heapless::Vec::new();

        for (i, h) in bundle.iter().enumerate() {
            let sa = tbl.get(*h).ok_or(XmitError::LookupMiss(said))?;
            let pending = match sizing {
                Ok(plan) => plan.xforms[i].in_len,
                Err(_) => pkt_len,
            };

            let err = match sa.precheck(now_secs, pending as u64) {
                SaCheck::Ok => continue,
                SaCheck::SoftExpired(kind) => {
                    // Bounded by the bundle length.
                    let _ = soft.push((*h, kind));
                    continue;
                }
                SaCheck::Larval => XmitError::LarvalSa(sa.said),
                SaCheck::Dead => XmitError::DeadSa(sa.said),
                SaCheck::ReplayWrap => {
                    outbox.expire(sa, ExpireReason::ReplayWrap, true);
                    XmitError::ReplayWrap(sa.said)
                }
                SaCheck::HardExpired(kind) => {
                    outbox.expire(sa, ExpireReason::Lifetime(kind), true);
                    XmitError::LifetimeHardExpired { said: sa.said, kind }
                }
            };

            self.teardown(tbl, head, &err);
            return Err(err);
        }

        Ok(soft)
    }

    fn teardown(&self, tbl: &mut SaTable, head: SaHandle, cause: &XmitError) {
        let td = tbl.remove_chain(head);
        self.stats.vals.bundle_teardowns.incr(1);
        self.ectx.log.log(
            LogLevel::Note,
            &format!("tore down bundle of {} SAs: {cause}", td.removed.len()),
        );
        for e in td.errors {
            self.ectx
                .log
                .log(LogLevel::Warn, &format!("bundle teardown: {e}"));
        }
    }

    /// Shrink the advertised MTU if the bundle's overhead no longer
    /// fits the physical link, and tell a path-MTU-discovering sender
    /// its packet is too big.
    fn check_mtu(
        &self,
        pkt: &Packet,
        plan: &BundlePlan,
        outbox: &mut Outbox,
    ) -> Result<(), XmitError> {
        let phys = usize::from(self.cfg.phys_mtu);
        let mut mtu = self.mtu.load(Ordering::Relaxed) as usize;

        if mtu + plan.head + plan.tail > phys {
            let newmtu =
                phys.saturating_sub(plan.head + ((plan.tail + 2) & !7) + 5);
            if newmtu < mtu {
                self.mtu.store(newmtu as u32, Ordering::Relaxed);
                self.stats.vals.mtu_shrinks.incr(1);
                self.ectx.log.log(
                    LogLevel::Warn,
                    &format!(
                        "{}: mtu shrunk from {mtu} to {newmtu} (overhead {}+{})",
                        self.cfg.name, plan.head, plan.tail
                    ),
                );
                mtu = newmtu;
            }
        }

        let ip = Ipv4HdrRaw::parse(pkt.data())?;
        let total_len = usize::from(ip.total_len());
        if !self.flags.contains(TunnelFlags::ICMP) || mtu >= total_len || !ip.is_df()
        {
            return Ok(());
        }

        if ip.proto != PROTO_ICMP {
            self.queue_icmp(IcmpSignal::FragNeeded { mtu: mtu as u16 }, pkt, outbox);
        }

        if self.flags.contains(TunnelFlags::OBEY_DF) {
            return Err(XmitError::BufferTooSmall(total_len));
        }

        Ok(())
    }

    /// Apply one SA's transform. Returns the protocol the outer header
    /// must now carry, if it changed.
    fn apply(&self, sa: &mut Sa, pkt: &mut Packet) -> Result<Option<u8>, XmitError> {
        match sa.said.proto {
            SaProto::Esp => {
                let seq = sa.replay.next_seq().ok_or(XmitError::ReplayWrap(sa.said))?;
                apply_esp(sa, pkt, seq)?;
                Ok(Some(PROTO_ESP))
            }

            SaProto::Ah => {
                let seq = sa.replay.next_seq().ok_or(XmitError::ReplayWrap(sa.said))?;
                apply_ah(sa, pkt, seq)?;
                Ok(Some(PROTO_AH))
            }

            SaProto::Ipip => {
                apply_ipip(sa, pkt, self.flags.contains(TunnelFlags::COPY_TOS))?;
                Ok(None)
            }

            SaProto::Comp => Ok(apply_comp(sa, pkt)?.then_some(PROTO_COMP)),

            SaProto::Int | SaProto::Unknown(_) => {
                Err(XmitError::UnsupportedAlgorithm(sa.said))
            }
        }
    }

    fn queue_icmp(&self, signal: IcmpSignal, pkt: &Packet, outbox: &mut Outbox) {
        let Ok(ip) = Ipv4HdrRaw::parse(pkt.data()) else {
            return;
        };
        let from = self.cfg.local_addrs.first().copied().unwrap_or(ip.dst());
        match icmp::build(signal, pkt.data(), from) {
            Some(msg) => outbox.icmp.push(msg),
            None => self.stats.vals.icmp_suppressed.incr(1),
        }
    }

    /// Deliver everything queued while processing a packet. No lock is
    /// held here.
    fn flush(&self, outbox: Outbox) {
        let stats = &self.stats.vals;

        for msg in outbox.icmp {
            self.icmp.send(msg);
            stats.icmp_sent.incr(1);
        }

        for notice in outbox.expires {
            match self.keymgmt.expire(&notice) {
                Ok(()) => stats.expire_sent.incr(1),
                Err(e) => {
                    stats.expire_failed.incr(1);
                    self.ectx.log.log(
                        LogLevel::Note,
                        &format!(
                            "{} expire for {} ({}) failed: {e}",
                            if notice.hard { "hard" } else { "soft" },
                            notice.said,
                            notice.reason,
                        ),
                    );
                }
            }
        }
    }

    fn update_stats(&self, res: &Result<ProcessResult, XmitError>) {
        let stats = &self.stats.vals;
        stats.out_pkts.incr(1);

        match res {
            Ok(ProcessResult::Bypass(_)) => stats.out_bypass.incr(1),
            Ok(ProcessResult::Modified(_)) => stats.out_modified.incr(1),

            Ok(ProcessResult::Drop { reason: DropReason::Policy(p) }) => {
                stats.out_drop.incr(1);
                match p {
                    PolicyDrop::NoEroute => stats.out_drop_no_eroute.incr(1),
                    PolicyDrop::Drop => stats.out_drop_shunt.incr(1),
                    PolicyDrop::Reject => stats.out_drop_reject.incr(1),
                    PolicyDrop::Hold => stats.out_drop_hold.incr(1),
                    PolicyDrop::Trap => stats.out_drop_trap.incr(1),
                    PolicyDrop::UnknownShunt(_) => {
                        stats.out_drop_unknown_shunt.incr(1)
                    }
                    PolicyDrop::TtlExpired => stats.out_drop_ttl.incr(1),
                }
            }

            // The pipeline itself never builds an error drop; those
            // come back as `Err`.
            Ok(ProcessResult::Drop { reason: DropReason::Error(_) }) => {
                stats.out_err.incr(1)
            }

            Err(e) => {
                stats.out_err.incr(1);
                match e {
                    XmitError::LookupMiss(_) => stats.out_err_lookup_miss.incr(1),
                    XmitError::AllocationFailure(_) => stats.out_err_alloc.incr(1),
                    XmitError::MalformedHeader(_) => {
                        stats.out_err_malformed.incr(1)
                    }
                    XmitError::UnsupportedAlgorithm(_) => {
                        stats.out_err_unsupported_alg.incr(1)
                    }
                    XmitError::LarvalSa(_) => stats.out_err_larval.incr(1),
                    XmitError::DeadSa(_) => stats.out_err_dead.incr(1),
                    XmitError::ReplayWrap(_) => stats.out_err_replay_wrap.incr(1),
                    XmitError::LifetimeHardExpired { .. } => {
                        stats.out_err_hard_expired.incr(1)
                    }
                    XmitError::BufferTooSmall(_) => stats.out_err_too_big.incr(1),
                    XmitError::NestingTooDeep(_) => stats.out_err_nesting.incr(1),
                }
            }
        }
    }
}

fn policy_drop(p: PolicyDrop) -> ProcessResult {
    ProcessResult::Drop { reason: DropReason::Policy(p) }
}

fn acquire_template(flow: &FlowId, er: &Eroute) -> AcquireTemplate {
    AcquireTemplate {
        flow: *flow,
        pid: er.pid,
        ident_s: er.ident_s.clone(),
        ident_d: er.ident_d.clone(),
    }
}

/// Work out the head and tail room of every transform in the bundle.
/// Each transform's payload is the previous one's output, so the
/// sizes accumulate.
fn size_bundle(
    tbl: &SaTable,
    said: SaId,
    bundle: &Bundle,
    pkt_len: usize,
) -> Result<BundlePlan, XmitError> {
    let mut plan = BundlePlan::default();
    let mut payload = pkt_len.saturating_sub(IPV4_HDR_LEN);

    for h in bundle.iter() {
        let sa = tbl.get(*h).ok_or(XmitError::LookupMiss(said))?;
        let x = size_xform(sa, payload)?;
        payload += x.head + x.tail;
        plan.head += x.head;
        plan.tail += x.tail;
        plan.xforms
            .push(x)
            .map_err(|_| XmitError::NestingTooDeep(BUNDLE_MAX))?;
    }

    let out_len = IPV4_HDR_LEN + payload;
    if out_len > IP_MAX_LEN {
        return Err(XmitError::BufferTooSmall(out_len));
    }

    Ok(plan)
}

fn size_xform(sa: &Sa, payload: usize) -> Result<XformPlan, XmitError> {
    let unsupported = || XmitError::UnsupportedAlgorithm(sa.said);
    let in_len = IPV4_HDR_LEN + payload;

    match sa.said.proto {
        SaProto::Esp => {
            let enc = sa.enc.as_ref().ok_or_else(unsupported)?.desc();
            let icv_len = sa.auth.as_ref().map_or(0, |a| a.desc().icv_len);
            let pad = esp_pad_len(payload, enc.block_size);
            Ok(XformPlan {
                head: EspHdrRaw::SIZE + enc.iv_len,
                tail: pad + ESP_TRAILER_LEN + icv_len,
                in_len,
            })
        }

        SaProto::Ah => {
            let auth = sa.auth.as_ref().ok_or_else(unsupported)?.desc();
            Ok(XformPlan { head: AhHdrRaw::SIZE + auth.icv_len, tail: 0, in_len })
        }

        SaProto::Ipip => Ok(XformPlan { head: IPV4_HDR_LEN, tail: 0, in_len }),

        // Compression is assumed never to grow the packet.
        SaProto::Comp => Ok(XformPlan { head: 0, tail: 0, in_len }),

        SaProto::Int | SaProto::Unknown(_) => Err(unsupported()),
    }
}

/// Rewrite the total length and checksum of the outer header after a
/// transform changed what follows it.
fn fix_ip_hdr(pkt: &mut Packet, proto: Option<u8>) -> Result<(), XmitError> {
    let len = pkt.len();
    if len > IP_MAX_LEN {
        return Err(XmitError::BufferTooSmall(len));
    }

    let (ip, _) = Ipv4HdrRaw::mut_from_prefix(pkt.data_mut()).map_err(|_| {
        Ipv4Error::Truncated { need: IPV4_HDR_LEN, have: len }
    })?;
    if let Some(p) = proto {
        ip.proto = p;
    }
    ip.set_total_len(len as u16);
    ip.fill_csum();
    Ok(())
}

fn ensure_tail(pkt: &mut Packet, n: usize) -> Result<(), XmitError> {
    if pkt.tailroom() < n {
        pkt.grow(0, n)?;
    }
    Ok(())
}

fn alg_err(said: SaId) -> impl FnOnce(AlgError) -> XmitError {
    move |_| XmitError::UnsupportedAlgorithm(said)
}

fn apply_esp(sa: &mut Sa, pkt: &mut Packet, seq: u32) -> Result<(), XmitError> {
    let said = sa.said;
    let enc = sa.enc.as_ref().ok_or(XmitError::UnsupportedAlgorithm(said))?;
    let block_size = enc.desc().block_size;
    let iv_len = enc.desc().iv_len;
    let icv_len = sa.auth.as_ref().map_or(0, |a| a.desc().icv_len);
    if icv_len > MAX_ICV_LEN {
        return Err(XmitError::UnsupportedAlgorithm(said));
    }

    let next_hdr = Ipv4HdrRaw::parse(pkt.data())?.proto;
    let payload = pkt.len() - IPV4_HDR_LEN;
    let pad = esp_pad_len(payload, block_size);
    let hdr_len = EspHdrRaw::SIZE + iv_len;

    // The plan reserved this already unless compression changed the
    // payload length underneath it.
    ensure_tail(pkt, pad + ESP_TRAILER_LEN + icv_len)?;

    let esp = EspHdrRaw { spi: said.spi.to_be_bytes(), seq: seq.to_be_bytes() };
    let hdr = pkt.insert_after(IPV4_HDR_LEN, hdr_len)?;
    hdr[..EspHdrRaw::SIZE].copy_from_slice(esp.as_bytes());
    hdr[EspHdrRaw::SIZE..].copy_from_slice(sa.iv());

    let trailer = pkt.put_tail(pad + ESP_TRAILER_LEN)?;
    for (i, b) in trailer[..pad].iter_mut().enumerate() {
        *b = (i + 1) as u8;
    }
    trailer[pad] = pad as u8;
    trailer[pad + 1] = next_hdr;

    let iv_start = IPV4_HDR_LEN + EspHdrRaw::SIZE;
    let enc_start = iv_start + iv_len;
    {
        let (front, body) = pkt.data_mut().split_at_mut(enc_start);
        enc.encrypt(&front[iv_start..], body).map_err(alg_err(said))?;
    }

    // Chain: the next packet's IV is this one's last ciphertext block.
    if iv_len > 0 {
        let data = pkt.data();
        if data.len() - enc_start >= iv_len {
            sa.set_iv(&data[data.len() - iv_len..]);
        }
    }

    if let Some(auth) = sa.auth.as_ref() {
        let covered = pkt.len() - IPV4_HDR_LEN;
        pkt.put_tail(icv_len)?;
        let (body, icv) = pkt.data_mut()[IPV4_HDR_LEN..].split_at_mut(covered);
        auth.digest(&[&*body], icv).map_err(alg_err(said))?;
    }

    Ok(())
}

fn apply_ah(sa: &Sa, pkt: &mut Packet, seq: u32) -> Result<(), XmitError> {
    let said = sa.said;
    let auth = sa.auth.as_ref().ok_or(XmitError::UnsupportedAlgorithm(said))?;
    let icv_len = auth.desc().icv_len;
    if icv_len > MAX_ICV_LEN {
        return Err(XmitError::UnsupportedAlgorithm(said));
    }

    let next_hdr = Ipv4HdrRaw::parse(pkt.data())?.proto;
    let ah = AhHdrRaw {
        next_hdr,
        len: AhHdrRaw::len_field(icv_len),
        reserved: [0; 2],
        spi: said.spi.to_be_bytes(),
        seq: seq.to_be_bytes(),
    };
    let hdr = pkt.insert_after(IPV4_HDR_LEN, AhHdrRaw::SIZE + icv_len)?;
    hdr[..AhHdrRaw::SIZE].copy_from_slice(ah.as_bytes());
    hdr[AhHdrRaw::SIZE..].fill(0);

    // The MAC covers the header as it will be sent, with the mutable
    // fields zeroed.
    fix_ip_hdr(pkt, Some(PROTO_AH))?;
    let pseudo = Ipv4HdrRaw::parse(pkt.data())?.ah_pseudo();

    let mut icv = [0u8; MAX_ICV_LEN];
    auth.digest(
        &[pseudo.as_bytes(), &pkt.data()[IPV4_HDR_LEN..]],
        &mut icv[..icv_len],
    )
    .map_err(alg_err(said))?;

    let off = IPV4_HDR_LEN + AhHdrRaw::SIZE;
    pkt.data_mut()[off..off + icv_len].copy_from_slice(&icv[..icv_len]);
    Ok(())
}

fn apply_ipip(sa: &Sa, pkt: &mut Packet, copy_tos: bool) -> Result<(), XmitError> {
    let inner = *Ipv4HdrRaw::parse(pkt.data())?;
    let src = sa.addr_s.unwrap_or(inner.src());
    let dst = sa.addr_d.unwrap_or(sa.said.dst);
    let mut outer =
        Ipv4HdrRaw::new(src, dst, PROTO_IPIP, (pkt.len() + IPV4_HDR_LEN) as u16);
    if copy_tos {
        outer.tos = inner.tos;
    }
    pkt.push_head(IPV4_HDR_LEN)?.copy_from_slice(outer.as_bytes());
    Ok(())
}

/// Compress the payload if the bound provider makes it smaller.
/// Returns whether it did.
fn apply_comp(sa: &Sa, pkt: &mut Packet) -> Result<bool, XmitError> {
    let Some(comp) = sa.comp.as_ref() else {
        return Ok(false);
    };

    let next_hdr = Ipv4HdrRaw::parse(pkt.data())?.proto;
    let payload = &pkt.data()[IPV4_HDR_LEN..];
    let out = match comp.compress(payload) {
        Ok(Some(out)) if out.len() + CompHdrRaw::SIZE < payload.len() => out,
        _ => return Ok(false),
    };

    let hdr = CompHdrRaw {
        next_hdr,
        flags: 0,
        cpi: (sa.said.spi as u16).to_be_bytes(),
    };
    let mut body = Vec::with_capacity(CompHdrRaw::SIZE + out.len());
    body.extend_from_slice(hdr.as_bytes());
    body.extend_from_slice(&out);
    pkt.replace_tail_from(IPV4_HDR_LEN, &body)?;
    Ok(true)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::api::Direction;
    use crate::api::Ipv4Cidr;
    use crate::api::PROTO_TCP;
    use crate::engine::alg::AlgRegistry;
    use crate::engine::alg::AlgType;
    use crate::engine::alg::ESP_NULL;
    use crate::engine::checksum;
    use crate::engine::icmp::DiscardIcmp;
    use crate::engine::notify::NoKeyMgmt;
    use crate::provider::PrintlnLog;
    use alloc::boxed::Box;
    use alloc::vec;

    fn ipv4(src: &str, dst: &str, proto: u8, payload: &[u8]) -> Packet {
        let hdr = Ipv4HdrRaw::new(
            src.parse().unwrap(),
            dst.parse().unwrap(),
            proto,
            (IPV4_HDR_LEN + payload.len()) as u16,
        );
        let mut bytes = hdr.as_bytes().to_vec();
        bytes.extend_from_slice(payload);
        Packet::new(bytes)
    }

    fn tunnel() -> Tunnel {
        let ectx = Arc::new(ExecCtx { log: Box::new(PrintlnLog) });
        Tunnel::new(
            TunnelCfg::default(),
            ectx,
            Arc::new(SaStore::default()),
            Arc::new(Eroutes::default()),
            Arc::new(NoKeyMgmt),
            Arc::new(DiscardIcmp),
        )
        .unwrap()
    }

    #[test]
    fn pad_lengths() {
        assert_eq!(esp_pad_len(0, 1), 2);
        assert_eq!(esp_pad_len(2, 1), 0);
        assert_eq!(esp_pad_len(14, 16), 0);
        assert_eq!(esp_pad_len(15, 16), 15);
        assert_eq!(esp_pad_len(40, 8), 6);
        for len in 0..64 {
            assert_eq!((len + esp_pad_len(len, 8) + 2) % 8, 0);
        }
    }

    #[test]
    fn no_eroute_drops() {
        let t = tunnel();
        let res = t.xmit(ipv4("10.0.0.5", "10.0.1.7", PROTO_TCP, &[0; 20]));
        assert!(matches!(
            res,
            ProcessResult::Drop { reason: DropReason::Policy(PolicyDrop::NoEroute) }
        ));
        let stats = t.stats();
        assert_eq!(stats.out_pkts, 1);
        assert_eq!(stats.out_drop, 1);
        assert_eq!(stats.out_drop_no_eroute, 1);
    }

    #[test]
    fn garbage_is_malformed() {
        let t = tunnel();
        let res = t.xmit(Packet::new(vec![0x60; 40]));
        assert!(matches!(
            res,
            ProcessResult::Drop {
                reason: DropReason::Error(XmitError::MalformedHeader(
                    Ipv4Error::BadVersion(6)
                ))
            }
        ));
        assert_eq!(t.stats().out_err_malformed, 1);
    }

    #[test]
    fn zero_ttl_is_dropped() {
        let t = tunnel();
        let mut pkt = ipv4("10.0.0.5", "10.0.1.7", PROTO_TCP, &[0; 20]);
        Ipv4HdrRaw::parse_mut(pkt.data_mut()).unwrap().ttl = 0;
        let res = t.xmit(pkt);
        assert!(matches!(
            res,
            ProcessResult::Drop { reason: DropReason::Policy(PolicyDrop::TtlExpired) }
        ));
        assert_eq!(t.stats().icmp_sent, 1);
    }

    #[test]
    fn null_esp_transport() {
        let t = tunnel();
        let algs = AlgRegistry::default();
        let said = SaId::new(SaProto::Esp, 0x1001, "10.0.1.7".parse().unwrap());
        let enc = algs.bind(AlgType::Encrypt, ESP_NULL, &[]).unwrap();
        let mut sa = Sa::new(said, Direction::Out)
            .with_state(crate::api::SaState::Mature)
            .with_enc(enc);
        sa.mark_added(1);
        t.sas().insert(sa).unwrap();
        t.eroutes()
            .add(Eroute::new(
                Selector::subnets(
                    "10.0.0.0/24".parse::<Ipv4Cidr>().unwrap(),
                    "10.0.1.0/24".parse::<Ipv4Cidr>().unwrap(),
                ),
                said,
            ))
            .unwrap();

        let payload = [0xAAu8; 21];
        let res = t.xmit_at(
            ipv4("10.0.0.5", "10.0.1.7", PROTO_TCP, &payload),
            Moment::from_secs(2),
        );
        let ProcessResult::Modified(pkt) = res else {
            panic!("expected modified, got {res:?}");
        };

        let out = pkt.data();
        let ip = Ipv4HdrRaw::parse(out).unwrap();
        assert_eq!(ip.proto, PROTO_ESP);
        assert_eq!(usize::from(ip.total_len()), out.len());
        assert!(checksum::verify(&out[..IPV4_HDR_LEN]));

        // 21 bytes of payload plus the trailer pad out to 24.
        let esp = &out[IPV4_HDR_LEN..];
        assert_eq!(&esp[0..4], &0x1001u32.to_be_bytes());
        assert_eq!(&esp[4..8], &1u32.to_be_bytes());
        assert_eq!(esp.len(), 8 + 24);
        assert_eq!(&esp[8..29], &payload);
        assert_eq!(&esp[29..30], &[1]);
        assert_eq!(esp[30], 1);
        assert_eq!(esp[31], PROTO_TCP);

        let (bytes, packets) = t
            .sas()
            .with_sa(&said, |sa| (sa.life.bytes.count(), sa.life.packets.count()))
            .unwrap();
        assert_eq!(bytes, 41);
        assert_eq!(packets, 1);
    }
}
