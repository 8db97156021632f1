// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! IPv4 and the IPsec headers that ride on it.
//!
//! The raw header types are plain byte layouts read and written in
//! place with `zerocopy`. Multi-byte fields are kept as byte arrays so
//! that every struct is `Unaligned` and can sit at any offset in a
//! packet buffer.

use super::checksum::Checksum;
use crate::api::Ipv4Addr;
use crate::api::PROTO_TCP;
use crate::api::PROTO_UDP;
use crate::api::SELECTOR_KEY_LEN;
use core::fmt;
use core::fmt::Display;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;
use zerocopy::Unaligned;

pub use crate::api::Ipv4Cidr;
pub use crate::api::Protocol;

pub const IPV4_HDR_LEN_MASK: u8 = 0x0F;
pub const IPV4_HDR_VER_SHIFT: u8 = 4;
pub const IPV4_VERSION: u8 = 4;

/// The only header length the outbound path accepts: no options.
pub const IPV4_HDR_LEN: usize = 20;

pub const IP_DF: u16 = 0x4000;
pub const IP_MF: u16 = 0x2000;
pub const IP_OFFMASK: u16 = 0x1FFF;

/// The largest datagram the pipeline will emit.
pub const IP_MAX_LEN: usize = 0xFFF0;

/// The TTL given to headers we originate.
pub const DEF_TTL: u8 = 64;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Ipv4Error {
    Truncated { need: usize, have: usize },
    BadVersion(u8),
    /// A header length other than 20 bytes.
    HasOptions(u8),
    BadTotalLen { total_len: u16, buf_len: usize },
}

impl Display for Ipv4Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Truncated { need, have } => {
                write!(f, "truncated: need {need} bytes, have {have}")
            }
            Self::BadVersion(v) => write!(f, "bad IP version: {v}"),
            Self::HasOptions(len) => {
                write!(f, "IP options not supported (hdr len {len})")
            }
            Self::BadTotalLen { total_len, buf_len } => {
                write!(f, "total length {total_len} exceeds buffer {buf_len}")
            }
        }
    }
}

#[repr(C)]
#[derive(
    Clone, Copy, Debug, FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned,
)]
pub struct Ipv4HdrRaw {
    pub ver_hdr_len: u8,
    pub tos: u8,
    pub total_len: [u8; 2],
    pub ident: [u8; 2],
    pub frag_and_flags: [u8; 2],
    pub ttl: u8,
    pub proto: u8,
    pub csum: [u8; 2],
    pub src: [u8; 4],
    pub dst: [u8; 4],
}

impl Ipv4HdrRaw {
    pub const SIZE: usize = IPV4_HDR_LEN;

    /// A fresh option-less header.
    pub fn new(src: Ipv4Addr, dst: Ipv4Addr, proto: u8, total_len: u16) -> Self {
        let mut hdr = Self {
            ver_hdr_len: (IPV4_VERSION << IPV4_HDR_VER_SHIFT)
                | (IPV4_HDR_LEN / 4) as u8,
            tos: 0,
            total_len: total_len.to_be_bytes(),
            ident: [0; 2],
            frag_and_flags: [0; 2],
            ttl: DEF_TTL,
            proto,
            csum: [0; 2],
            src: src.bytes(),
            dst: dst.bytes(),
        };
        hdr.fill_csum();
        hdr
    }

    /// View the option-less header at the front of `bytes`, checking
    /// version, header length and total length.
    pub fn parse(bytes: &[u8]) -> Result<&Self, Ipv4Error> {
        let (hdr, _) = Self::ref_from_prefix(bytes).map_err(|_| {
            Ipv4Error::Truncated { need: Self::SIZE, have: bytes.len() }
        })?;
        hdr.validate(bytes.len())?;
        Ok(hdr)
    }

    /// The mutable flavor of [`Self::parse()`].
    pub fn parse_mut(bytes: &mut [u8]) -> Result<&mut Self, Ipv4Error> {
        let have = bytes.len();
        let (hdr, _) = Self::mut_from_prefix(bytes)
            .map_err(|_| Ipv4Error::Truncated { need: Self::SIZE, have })?;
        hdr.validate(have)?;
        Ok(hdr)
    }

    fn validate(&self, buf_len: usize) -> Result<(), Ipv4Error> {
        if self.version() != IPV4_VERSION {
            return Err(Ipv4Error::BadVersion(self.version()));
        }

        if self.hdr_len() != IPV4_HDR_LEN {
            return Err(Ipv4Error::HasOptions(self.hdr_len() as u8));
        }

        let total_len = self.total_len();
        if usize::from(total_len) < IPV4_HDR_LEN
            || usize::from(total_len) > buf_len
        {
            return Err(Ipv4Error::BadTotalLen { total_len, buf_len });
        }

        Ok(())
    }

    pub fn version(&self) -> u8 {
        self.ver_hdr_len >> IPV4_HDR_VER_SHIFT
    }

    /// The header length, in bytes.
    pub fn hdr_len(&self) -> usize {
        usize::from(self.ver_hdr_len & IPV4_HDR_LEN_MASK) * 4
    }

    pub fn total_len(&self) -> u16 {
        u16::from_be_bytes(self.total_len)
    }

    pub fn set_total_len(&mut self, len: u16) {
        self.total_len = len.to_be_bytes();
    }

    pub fn frag(&self) -> u16 {
        u16::from_be_bytes(self.frag_and_flags)
    }

    pub fn is_df(&self) -> bool {
        self.frag() & IP_DF != 0
    }

    /// Is this an unfragmented datagram or its first fragment?
    pub fn is_first_frag(&self) -> bool {
        self.frag() & IP_OFFMASK == 0
    }

    pub fn src(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.src)
    }

    pub fn dst(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.dst)
    }

    /// Recompute the header checksum.
    pub fn fill_csum(&mut self) {
        self.csum = [0; 2];
        self.csum = Checksum::compute(self.as_bytes()).header_bytes();
    }

    /// The copy of this header authenticated by AH: the fields that
    /// change in transit (tos, fragment, ttl, checksum) are zeroed.
    pub fn ah_pseudo(&self) -> Self {
        let mut pseudo = *self;
        pseudo.tos = 0;
        pseudo.frag_and_flags = [0; 2];
        pseudo.ttl = 0;
        pseudo.csum = [0; 2];
        pseudo
    }
}

/// The source and destination ports at the front of a TCP or UDP
/// header.
#[repr(C)]
#[derive(
    Clone, Copy, Debug, FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned,
)]
pub struct PortsRaw {
    pub src: [u8; 2],
    pub dst: [u8; 2],
}

#[repr(C)]
#[derive(
    Clone, Copy, Debug, FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned,
)]
pub struct EspHdrRaw {
    pub spi: [u8; 4],
    pub seq: [u8; 4],
}

impl EspHdrRaw {
    pub const SIZE: usize = 8;
}

#[repr(C)]
#[derive(
    Clone, Copy, Debug, FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned,
)]
pub struct AhHdrRaw {
    pub next_hdr: u8,
    /// The AH length in 32-bit words, minus 2.
    pub len: u8,
    pub reserved: [u8; 2],
    pub spi: [u8; 4],
    pub seq: [u8; 4],
}

impl AhHdrRaw {
    pub const SIZE: usize = 12;

    /// The value of the length field for a header carrying an
    /// `icv_len`-byte authenticator.
    pub fn len_field(icv_len: usize) -> u8 {
        (((Self::SIZE + icv_len) >> 2) - 2) as u8
    }
}

#[repr(C)]
#[derive(
    Clone, Copy, Debug, FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned,
)]
pub struct CompHdrRaw {
    pub next_hdr: u8,
    pub flags: u8,
    pub cpi: [u8; 2],
}

impl CompHdrRaw {
    pub const SIZE: usize = 4;
}

#[repr(C)]
#[derive(
    Clone, Copy, Debug, FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned,
)]
pub struct IcmpHdrRaw {
    pub ty: u8,
    pub code: u8,
    pub csum: [u8; 2],
    pub rest: [u8; 4],
}

impl IcmpHdrRaw {
    pub const SIZE: usize = 8;
}

/// The selector of a single packet: the fields the eroute table is
/// searched with.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct FlowId {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub proto: u8,
    pub sport: u16,
    pub dport: u16,
}

impl FlowId {
    /// Extract the flow from an IPv4 datagram. Ports are read only
    /// for TCP and UDP, and only from the first fragment.
    pub fn from_ipv4(bytes: &[u8]) -> Result<Self, Ipv4Error> {
        let ip = Ipv4HdrRaw::parse(bytes)?;
        let mut flow = Self {
            src: ip.src(),
            dst: ip.dst(),
            proto: ip.proto,
            sport: 0,
            dport: 0,
        };

        if matches!(ip.proto, PROTO_TCP | PROTO_UDP) && ip.is_first_frag() {
            let body = &bytes[IPV4_HDR_LEN..usize::from(ip.total_len())];
            if let Ok((ports, _)) = PortsRaw::ref_from_prefix(body) {
                flow.sport = u16::from_be_bytes(ports.src);
                flow.dport = u16::from_be_bytes(ports.dst);
            }
        }

        Ok(flow)
    }

    pub fn protocol(&self) -> Protocol {
        Protocol::from(self.proto)
    }

    /// The flow laid out like [`crate::api::Selector::key()`].
    pub fn key(&self) -> [u8; SELECTOR_KEY_LEN] {
        let mut key = [0u8; SELECTOR_KEY_LEN];
        key[0..4].copy_from_slice(&self.src.bytes());
        key[4..8].copy_from_slice(&self.dst.bytes());
        key[8] = self.proto;
        key[9..11].copy_from_slice(&self.sport.to_be_bytes());
        key[11..13].copy_from_slice(&self.dport.to_be_bytes());
        key
    }
}

impl Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}:{} -> {}:{} {}",
            self.src,
            self.sport,
            self.dst,
            self.dport,
            self.protocol()
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::engine::checksum;

    fn udp_pkt(frag: u16) -> Vec<u8> {
        let mut hdr = Ipv4HdrRaw::new(
            "10.0.0.5".parse().unwrap(),
            "10.0.1.7".parse().unwrap(),
            PROTO_UDP,
            (IPV4_HDR_LEN + 12) as u16,
        );
        hdr.frag_and_flags = frag.to_be_bytes();
        hdr.fill_csum();
        let mut bytes = hdr.as_bytes().to_vec();
        bytes.extend_from_slice(&[0x01, 0xF4, 0x11, 0x94, 0, 12, 0, 0]);
        bytes.extend_from_slice(b"ping");
        bytes
    }

    #[test]
    fn built_header_is_valid() {
        let bytes = udp_pkt(IP_DF);
        assert!(checksum::verify(&bytes[..IPV4_HDR_LEN]));
        let ip = Ipv4HdrRaw::parse(&bytes).unwrap();
        assert!(ip.is_df());
        assert!(ip.is_first_frag());
        assert_eq!(ip.ttl, DEF_TTL);
        assert_eq!(ip.total_len(), 32);
    }

    #[test]
    fn flow_reads_ports() {
        let flow = FlowId::from_ipv4(&udp_pkt(0)).unwrap();
        assert_eq!(flow.sport, 500);
        assert_eq!(flow.dport, 4500);
        assert_eq!(flow.protocol(), Protocol::Udp);

        let sel = crate::api::Selector::new(
            "10.0.0.5".parse().unwrap(),
            "10.0.1.7".parse().unwrap(),
        )
        .with_proto(PROTO_UDP)
        .with_ports(500, 4500);
        assert_eq!(flow.key(), sel.key());
    }

    #[test]
    fn later_fragments_have_no_ports() {
        let flow = FlowId::from_ipv4(&udp_pkt(IP_MF | 3)).unwrap();
        assert_eq!((flow.sport, flow.dport), (0, 0));
    }

    #[test]
    fn reject_malformed() {
        let mut bytes = udp_pkt(0);
        assert!(matches!(
            Ipv4HdrRaw::parse(&bytes[..10]),
            Err(Ipv4Error::Truncated { .. })
        ));

        bytes[0] = 0x46;
        assert_eq!(
            Ipv4HdrRaw::parse(&bytes).unwrap_err(),
            Ipv4Error::HasOptions(24)
        );

        bytes[0] = 0x65;
        assert_eq!(Ipv4HdrRaw::parse(&bytes).unwrap_err(), Ipv4Error::BadVersion(6));

        bytes[0] = 0x45;
        bytes[2..4].copy_from_slice(&200u16.to_be_bytes());
        assert!(matches!(
            Ipv4HdrRaw::parse(&bytes),
            Err(Ipv4Error::BadTotalLen { total_len: 200, .. })
        ));
    }

    #[test]
    fn ah_len_field() {
        // 12-byte authenticator: 24 bytes total, 6 words, minus 2.
        assert_eq!(AhHdrRaw::len_field(12), 4);
        assert_eq!(AhHdrRaw::len_field(16), 5);
    }
}
