// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! ICMP signals sent back to the originator of an outbound packet.

use super::checksum::Checksum;
use super::ip4::IcmpHdrRaw;
use super::ip4::Ipv4HdrRaw;
use super::ip4::IPV4_HDR_LEN;
use super::packet::Packet;
use crate::api::Ipv4Addr;
use crate::api::PROTO_ICMP;
use alloc::vec::Vec;
use zerocopy::IntoBytes;

pub const ICMP_DEST_UNREACH: u8 = 3;
pub const ICMP_SOURCE_QUENCH: u8 = 4;
pub const ICMP_REDIRECT: u8 = 5;
pub const ICMP_TIME_EXCEEDED: u8 = 11;
pub const ICMP_PARAMETER_PROB: u8 = 12;

pub const ICMP_FRAG_NEEDED: u8 = 4;
pub const ICMP_PKT_FILTERED: u8 = 13;
pub const ICMP_EXC_TTL: u8 = 0;

/// How much of the offending datagram beyond its IP header is quoted.
const QUOTE_LEN: usize = 8;

/// The signals the outbound path generates.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum IcmpSignal {
    /// Destination unreachable, communication administratively
    /// filtered: the packet hit a reject eroute.
    Filtered,
    /// Destination unreachable, fragmentation needed, with the
    /// advertised tunnel MTU.
    FragNeeded { mtu: u16 },
    /// Time exceeded in transit.
    TtlExceeded,
}

impl IcmpSignal {
    pub fn ty_code(&self) -> (u8, u8) {
        match self {
            Self::Filtered => (ICMP_DEST_UNREACH, ICMP_PKT_FILTERED),
            Self::FragNeeded { .. } => (ICMP_DEST_UNREACH, ICMP_FRAG_NEEDED),
            Self::TtlExceeded => (ICMP_TIME_EXCEEDED, ICMP_EXC_TTL),
        }
    }

    /// The second word of the ICMP header. Only frag-needed uses it,
    /// for the next-hop MTU (RFC 1191).
    fn rest(&self) -> [u8; 4] {
        match self {
            Self::FragNeeded { mtu } => {
                let m = mtu.to_be_bytes();
                [0, 0, m[0], m[1]]
            }
            _ => [0; 4],
        }
    }
}

/// Where generated ICMP messages go. The pipeline hands the finished
/// datagram over and forgets about it.
pub trait IcmpSink: Send + Sync {
    fn send(&self, pkt: Packet);
}

/// An [`IcmpSink`] that discards everything.
pub struct DiscardIcmp;

impl IcmpSink for DiscardIcmp {
    fn send(&self, _pkt: Packet) {}
}

fn is_icmp_error(ty: u8) -> bool {
    matches!(
        ty,
        ICMP_DEST_UNREACH
            | ICMP_SOURCE_QUENCH
            | ICMP_REDIRECT
            | ICMP_TIME_EXCEEDED
            | ICMP_PARAMETER_PROB
    )
}

/// Whether an error may be sent about `orig` at all (RFC 1122
/// 3.2.2). Never about another ICMP error, a later fragment, a
/// datagram sent to a broadcast or multicast group, or one whose
/// source does not name a single host.
fn may_signal(ip: &Ipv4HdrRaw, orig: &[u8]) -> bool {
    if !ip.is_first_frag() {
        return false;
    }

    let (src, dst) = (ip.src(), ip.dst());
    if src.is_any() || src.is_broadcast() || src.is_multicast() {
        return false;
    }
    if dst.is_broadcast() || dst.is_multicast() {
        return false;
    }

    if ip.proto == PROTO_ICMP {
        return match orig.get(IPV4_HDR_LEN) {
            Some(ty) => !is_icmp_error(*ty),
            None => false,
        };
    }

    true
}

/// Build `signal` in response to the datagram `orig`, addressed to its
/// source. `from` is the address the message is sent from.
///
/// Returns `None` when `orig` is too short to quote, or is something
/// no error may be sent about.
pub fn build(signal: IcmpSignal, orig: &[u8], from: Ipv4Addr) -> Option<Packet> {
    let ip = Ipv4HdrRaw::parse(orig).ok()?;
    if !may_signal(ip, orig) {
        return None;
    }
    let quote_end = usize::from(ip.total_len()).min(IPV4_HDR_LEN + QUOTE_LEN);
    let quote = &orig[..quote_end];

    let (ty, code) = signal.ty_code();
    let mut icmp = IcmpHdrRaw { ty, code, csum: [0; 2], rest: signal.rest() };
    let mut csum = Checksum::compute(icmp.as_bytes());
    csum.add_bytes(quote);
    icmp.csum = csum.header_bytes();

    let total = IPV4_HDR_LEN + IcmpHdrRaw::SIZE + quote.len();
    let outer = Ipv4HdrRaw::new(from, ip.src(), PROTO_ICMP, total as u16);

    let mut bytes = Vec::with_capacity(total);
    bytes.extend_from_slice(outer.as_bytes());
    bytes.extend_from_slice(icmp.as_bytes());
    bytes.extend_from_slice(quote);
    Some(Packet::new(bytes))
}
