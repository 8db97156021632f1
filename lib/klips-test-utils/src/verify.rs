// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Independent checks of emitted packets, done with smoltcp rather
//! than the engine's own header code.

use klips::api::Ipv4Addr;
use smoltcp::wire::Icmpv4Message;
use smoltcp::wire::Icmpv4Packet;
use smoltcp::wire::Ipv4Packet;

/// The parts of an IPv4 header the tests look at.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Ipv4Summary {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub proto: u8,
    pub ttl: u8,
    pub tos: u8,
    pub df: bool,
    pub total_len: usize,
    pub payload: Vec<u8>,
}

/// Parse `bytes` as one IPv4 datagram, insisting on a good header
/// checksum and a total length that covers the buffer exactly.
pub fn ipv4(bytes: &[u8]) -> Ipv4Summary {
    let ip = Ipv4Packet::new_checked(bytes).expect("valid IPv4 packet");
    assert!(ip.verify_checksum(), "bad IPv4 header checksum");
    assert_eq!(usize::from(ip.total_len()), bytes.len());

    Ipv4Summary {
        src: Ipv4Addr::from(ip.src_addr().0),
        dst: Ipv4Addr::from(ip.dst_addr().0),
        proto: u8::from(ip.next_header()),
        ttl: ip.hop_limit(),
        tos: bytes[1],
        df: ip.dont_frag(),
        total_len: usize::from(ip.total_len()),
        payload: ip.payload().to_vec(),
    }
}

/// The parts of an ICMP error the tests look at.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct IcmpSummary {
    pub ip: Ipv4Summary,
    pub msg: Icmpv4Message,
    pub code: u8,
    /// The next-hop MTU of a fragmentation-needed message.
    pub mtu: u16,
    /// The quoted datagram.
    pub quote: Vec<u8>,
}

pub fn icmp(bytes: &[u8]) -> IcmpSummary {
    let ip = ipv4(bytes);
    assert_eq!(ip.proto, klips::api::PROTO_ICMP);

    let (msg, code) = {
        let icmp = Icmpv4Packet::new_checked(&ip.payload[..])
            .expect("valid ICMP packet");
        assert!(icmp.verify_checksum(), "bad ICMP checksum");
        (icmp.msg_type(), icmp.msg_code())
    };
    let mtu = u16::from_be_bytes([ip.payload[6], ip.payload[7]]);
    let quote = ip.payload[8..].to_vec();

    IcmpSummary { ip, msg, code, mtu, quote }
}
