// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Common routines for integration tests.

// This type of pedantry is more trouble than it's worth here.
#![allow(dead_code)]

pub mod alg;
pub mod verify;

// Let's make our lives easier and pub use a bunch of stuff.
pub use klips::ExecCtx;
pub use klips::api::AddrSpec;
pub use klips::api::Direction;
pub use klips::api::Identity;
pub use klips::api::Ipv4Addr;
pub use klips::api::Ipv4Cidr;
pub use klips::api::PROTO_AH;
pub use klips::api::PROTO_COMP;
pub use klips::api::PROTO_ESP;
pub use klips::api::PROTO_ICMP;
pub use klips::api::PROTO_IPIP;
pub use klips::api::PROTO_TCP;
pub use klips::api::PROTO_UDP;
pub use klips::api::SaId;
pub use klips::api::SaProto;
pub use klips::api::SaState;
pub use klips::api::Selector;
pub use klips::api::Shunt;
pub use klips::cfg::TunnelCfg;
pub use klips::ddi::sync::KMutex;
pub use klips::ddi::time::Moment;
pub use klips::engine::alg::AlgRegistry;
pub use klips::engine::alg::AlgType;
pub use klips::engine::eroute::Eroute;
pub use klips::engine::eroute::Eroutes;
pub use klips::engine::icmp::IcmpSink;
pub use klips::engine::ip4::FlowId;
pub use klips::engine::ip4::IP_DF;
pub use klips::engine::ip4::IPV4_HDR_LEN;
pub use klips::engine::ip4::Ipv4HdrRaw;
pub use klips::engine::life::LifeKind;
pub use klips::engine::notify::AcquireTemplate;
pub use klips::engine::notify::ExpireNotice;
pub use klips::engine::notify::KeyMgmtMsg;
pub use klips::engine::notify::NoKeyMgmt;
pub use klips::engine::notify::QueuedKeyMgmt;
pub use klips::engine::packet::Packet;
pub use klips::engine::sa::Sa;
pub use klips::engine::sa::SaHandle;
pub use klips::engine::sa::SaStore;
pub use klips::engine::tunnel::DropReason;
pub use klips::engine::tunnel::PolicyDrop;
pub use klips::engine::tunnel::ProcessResult;
pub use klips::engine::tunnel::Tunnel;
pub use klips::engine::tunnel::XmitError;
pub use klips::provider::PrintlnLog;
pub use std::sync::Arc;
use zerocopy::IntoBytes;

/// The clock every harness packet is sent at, in seconds.
pub const T0: u64 = 100;

/// How many notices the harness queue holds before refusing more.
pub const KEYMGMT_DEPTH: usize = 64;

/// Expects that a packet result is modified, and yields the packet.
#[macro_export]
macro_rules! expect_modified {
    ($res:expr) => {
        match $res {
            $crate::ProcessResult::Modified(pkt) => pkt,
            other => panic!("expected Modified, got {:?}", other),
        }
    };
}

/// Expects that a packet result is a drop for the given reason.
#[macro_export]
macro_rules! assert_drop {
    ($res:expr, $reason:pat $(if $guard:expr)?) => {
        match $res {
            $crate::ProcessResult::Drop { reason: $reason } $(if $guard)? => (),
            other => panic!(
                "expected drop for {}, got {:?}",
                stringify!($reason),
                other
            ),
        }
    };
}

/// Keeps every ICMP message the tunnel sends.
#[derive(Default)]
pub struct RecordingIcmp {
    sent: KMutex<Vec<Packet>>,
}

impl RecordingIcmp {
    pub fn take(&self) -> Vec<Packet> {
        std::mem::take(&mut *self.sent.lock())
    }

    pub fn len(&self) -> usize {
        self.sent.lock().len()
    }
}

impl IcmpSink for RecordingIcmp {
    fn send(&self, pkt: Packet) {
        self.sent.lock().push(pkt);
    }
}

pub fn ip(s: &str) -> Ipv4Addr {
    s.parse().unwrap()
}

pub fn sel(src: &str, dst: &str) -> Selector {
    Selector::new(src.parse().unwrap(), dst.parse().unwrap())
}

/// An option-less IPv4 datagram around `l4`.
pub fn ipv4(src: &str, dst: &str, proto: u8, l4: &[u8]) -> Packet {
    let hdr =
        Ipv4HdrRaw::new(ip(src), ip(dst), proto, (IPV4_HDR_LEN + l4.len()) as u16);
    let mut bytes = hdr.as_bytes().to_vec();
    bytes.extend_from_slice(l4);
    Packet::new(bytes)
}

/// A TCP segment with a bare 20-byte header followed by `data`.
pub fn tcp4(src: &str, dst: &str, sport: u16, dport: u16, data: &[u8]) -> Packet {
    let mut l4 = vec![0u8; 20];
    l4[0..2].copy_from_slice(&sport.to_be_bytes());
    l4[2..4].copy_from_slice(&dport.to_be_bytes());
    // Data offset of five words.
    l4[12] = 5 << 4;
    l4.extend_from_slice(data);
    ipv4(src, dst, PROTO_TCP, &l4)
}

/// A UDP datagram. The checksum is left at zero.
pub fn udp4(src: &str, dst: &str, sport: u16, dport: u16, data: &[u8]) -> Packet {
    let mut l4 = vec![0u8; 8];
    l4[0..2].copy_from_slice(&sport.to_be_bytes());
    l4[2..4].copy_from_slice(&dport.to_be_bytes());
    l4[4..6].copy_from_slice(&((8 + data.len()) as u16).to_be_bytes());
    l4.extend_from_slice(data);
    ipv4(src, dst, PROTO_UDP, &l4)
}

/// Set the don't-fragment bit.
pub fn set_df(pkt: &mut Packet) {
    let hdr = Ipv4HdrRaw::parse_mut(pkt.data_mut()).unwrap();
    hdr.frag_and_flags = IP_DF.to_be_bytes();
    hdr.fill_csum();
}

pub fn set_tos(pkt: &mut Packet, tos: u8) {
    let hdr = Ipv4HdrRaw::parse_mut(pkt.data_mut()).unwrap();
    hdr.tos = tos;
    hdr.fill_csum();
}

/// A mature SA, its add time started at [`T0`].
pub fn mature(sa: Sa) -> Sa {
    let mut sa = sa.with_state(SaState::Mature);
    sa.mark_added(T0);
    sa
}

/// A tunnel wired to recording sinks.
pub struct TestTunnel {
    pub tunnel: Tunnel,
    pub keymgmt: Arc<QueuedKeyMgmt>,
    pub icmp: Arc<RecordingIcmp>,
    pub algs: AlgRegistry,
}

impl TestTunnel {
    pub fn new(cfg: TunnelCfg) -> Self {
        let ectx = Arc::new(ExecCtx { log: Box::new(PrintlnLog) });
        let keymgmt = Arc::new(QueuedKeyMgmt::new(KEYMGMT_DEPTH));
        let icmp = Arc::new(RecordingIcmp::default());
        let tunnel = Tunnel::new(
            cfg.clone(),
            ectx,
            Arc::new(SaStore::new(cfg.sa_hash_buckets)),
            Arc::new(Eroutes::new(cfg.eroute_limit)),
            keymgmt.clone(),
            icmp.clone(),
        )
        .unwrap();

        Self { tunnel, keymgmt, icmp, algs: AlgRegistry::with_builtins() }
    }

    pub fn sas(&self) -> &SaStore {
        self.tunnel.sas()
    }

    pub fn eroutes(&self) -> &Eroutes {
        self.tunnel.eroutes()
    }

    pub fn add_sa(&self, sa: Sa) -> SaHandle {
        self.sas().insert(sa).unwrap()
    }

    /// Group SAs, in order, into one bundle.
    pub fn bundle(&self, saids: &[SaId]) {
        for pair in saids.windows(2) {
            self.sas().link(&pair[0], &pair[1]).unwrap();
        }
    }

    pub fn add_eroute(&self, src: &str, dst: &str, said: SaId) {
        self.eroutes().add(Eroute::new(sel(src, dst), said)).unwrap();
    }

    /// Send at [`T0`].
    pub fn xmit(&self, pkt: Packet) -> ProcessResult {
        self.tunnel.xmit_at(pkt, Moment::from_secs(T0))
    }

    pub fn xmit_at(&self, pkt: Packet, secs: u64) -> ProcessResult {
        self.tunnel.xmit_at(pkt, Moment::from_secs(secs))
    }

    /// Everything queued for key management so far, split by kind.
    pub fn drain_notices(&self) -> (Vec<AcquireTemplate>, Vec<ExpireNotice>) {
        let mut acquires = vec![];
        let mut expires = vec![];
        for msg in self.keymgmt.drain() {
            match msg {
                KeyMgmtMsg::Acquire(t) => acquires.push(t),
                KeyMgmtMsg::Expire(n) => expires.push(n),
            }
        }
        (acquires, expires)
    }

    /// The bytes and packets counters of an SA.
    pub fn counters(&self, said: &SaId) -> (u64, u64) {
        self.sas()
            .with_sa(said, |sa| (sa.life.bytes.count(), sa.life.packets.count()))
            .unwrap()
    }
}

impl Default for TestTunnel {
    fn default() -> Self {
        Self::new(TunnelCfg::default())
    }
}
