// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

use alloc::string::String;
use alloc::string::ToString;
use core::fmt;
use core::fmt::Debug;
use core::fmt::Display;
use core::str::FromStr;
use serde::Deserialize;
use serde::Serialize;

pub const PROTO_ICMP: u8 = 0x1;
pub const PROTO_IPIP: u8 = 0x4;
pub const PROTO_TCP: u8 = 0x6;
pub const PROTO_UDP: u8 = 0x11;
pub const PROTO_ESP: u8 = 0x32;
pub const PROTO_AH: u8 = 0x33;
/// The "any host internal protocol" value, used to tag shunt SAIds.
pub const PROTO_INT: u8 = 0x3D;
pub const PROTO_COMP: u8 = 0x6C;

/// An IP protocol number, named where the outbound path cares.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize,
)]
pub enum Protocol {
    Icmp,
    Ipip,
    Tcp,
    Udp,
    Esp,
    Ah,
    Comp,
    Other(u8),
}

const PROTO_NAMES: [(u8, Protocol, &str); 7] = [
    (PROTO_ICMP, Protocol::Icmp, "icmp"),
    (PROTO_IPIP, Protocol::Ipip, "ipip"),
    (PROTO_TCP, Protocol::Tcp, "tcp"),
    (PROTO_UDP, Protocol::Udp, "udp"),
    (PROTO_ESP, Protocol::Esp, "esp"),
    (PROTO_AH, Protocol::Ah, "ah"),
    (PROTO_COMP, Protocol::Comp, "comp"),
];

impl From<u8> for Protocol {
    fn from(num: u8) -> Self {
        PROTO_NAMES
            .iter()
            .find(|(n, _, _)| *n == num)
            .map(|(_, p, _)| *p)
            .unwrap_or(Self::Other(num))
    }
}

impl From<Protocol> for u8 {
    fn from(proto: Protocol) -> u8 {
        match proto {
            Protocol::Other(n) => n,
            named => PROTO_NAMES
                .iter()
                .find(|(_, p, _)| *p == named)
                .map_or(0, |(n, _, _)| *n),
        }
    }
}

impl Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match PROTO_NAMES.iter().find(|(_, p, _)| p == self) {
            Some((_, _, name)) => write!(f, "{name}"),
            None => write!(f, "proto{}", u8::from(*self)),
        }
    }
}

/// An IPv4 address in network order.
#[derive(
    Clone,
    Copy,
    Default,
    Deserialize,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
pub struct Ipv4Addr([u8; 4]);

impl Ipv4Addr {
    pub const ANY_ADDR: Self = Self([0; 4]);
    pub const BROADCAST: Self = Self([0xFF; 4]);

    pub fn bytes(&self) -> [u8; 4] {
        self.0
    }

    pub fn is_any(&self) -> bool {
        *self == Self::ANY_ADDR
    }

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    /// 224.0.0.0/4
    pub fn is_multicast(&self) -> bool {
        self.0[0] & 0xF0 == 0xE0
    }
}

impl From<[u8; 4]> for Ipv4Addr {
    fn from(bytes: [u8; 4]) -> Self {
        Self(bytes)
    }
}

impl From<u32> for Ipv4Addr {
    fn from(val: u32) -> Self {
        Self(val.to_be_bytes())
    }
}

impl From<Ipv4Addr> for u32 {
    fn from(ip: Ipv4Addr) -> u32 {
        u32::from_be_bytes(ip.0)
    }
}

impl FromStr for Ipv4Addr {
    type Err = String;

    fn from_str(val: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 4];
        let mut parts = val.split('.');
        for b in bytes.iter_mut() {
            let part = parts.next().ok_or_else(|| format!("short ip: {val}"))?;
            *b = part.parse().map_err(|e| format!("bad ip {val}: {e}"))?;
        }

        if parts.next().is_some() {
            return Err(format!("long ip: {val}"));
        }

        Ok(Self(bytes))
    }
}

impl Display for Ipv4Addr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let [a, b, c, d] = self.0;
        write!(f, "{a}.{b}.{c}.{d}")
    }
}

impl Debug for Ipv4Addr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Ipv4Addr({self})")
    }
}

/// An IPv4 subnet. The address is always stored masked.
#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
pub struct Ipv4Cidr {
    ip: Ipv4Addr,
    prefix: u8,
}

impl Ipv4Cidr {
    pub fn new(ip: Ipv4Addr, prefix: u8) -> Result<Self, String> {
        if prefix > 32 {
            return Err(format!("bad IPv4 prefix length: {prefix}"));
        }
        let mask = u32::from(Self::netmask(prefix));
        Ok(Self { ip: Ipv4Addr::from(u32::from(ip) & mask), prefix })
    }

    /// A subnet covering exactly one host.
    pub fn host(ip: Ipv4Addr) -> Self {
        Self { ip, prefix: 32 }
    }

    fn netmask(prefix: u8) -> Ipv4Addr {
        match prefix {
            0 => Ipv4Addr::ANY_ADDR,
            p => Ipv4Addr::from(u32::MAX << (32 - u32::from(p))),
        }
    }

    pub fn ip(&self) -> Ipv4Addr {
        self.ip
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    pub fn to_mask(&self) -> Ipv4Addr {
        Self::netmask(self.prefix)
    }

    pub fn is_default(&self) -> bool {
        self.prefix == 0
    }

    pub fn is_member(&self, ip: Ipv4Addr) -> bool {
        u32::from(ip) & u32::from(self.to_mask()) == u32::from(self.ip)
    }

    /// The last address in the subnet.
    pub fn last(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.ip) | !u32::from(self.to_mask()))
    }
}

impl FromStr for Ipv4Cidr {
    type Err = String;

    /// Parse a string like "192.168.2.0/24". Host bits are cleared.
    fn from_str(val: &str) -> Result<Self, Self::Err> {
        let (ip, prefix) =
            val.split_once('/').ok_or_else(|| "no '/' found".to_string())?;
        let prefix =
            prefix.parse().map_err(|e| format!("bad prefix length: {e}"))?;
        Self::new(ip.parse()?, prefix)
    }
}

impl Display for Ipv4Cidr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.ip, self.prefix)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn cidr_membership() {
        let cidr: Ipv4Cidr = "10.0.1.77/24".parse().unwrap();
        assert_eq!(cidr.ip(), "10.0.1.0".parse().unwrap());
        assert!(cidr.is_member("10.0.1.7".parse().unwrap()));
        assert!(!cidr.is_member("10.0.2.7".parse().unwrap()));
        assert_eq!(cidr.last(), "10.0.1.255".parse().unwrap());
        assert_eq!(cidr.to_string(), "10.0.1.0/24");

        let all: Ipv4Cidr = "0.0.0.0/0".parse().unwrap();
        assert!(all.is_default());
        assert!(all.is_member("192.168.9.9".parse().unwrap()));
        assert_eq!(all.to_mask(), Ipv4Addr::ANY_ADDR);

        let mcast: Ipv4Addr = "239.1.2.3".parse().unwrap();
        assert!(mcast.is_multicast());
        assert!(!"240.0.0.1".parse::<Ipv4Addr>().unwrap().is_multicast());

        let host = Ipv4Cidr::host("10.0.0.5".parse().unwrap());
        assert_eq!(host.to_mask(), Ipv4Addr::BROADCAST);
        assert_eq!(host.last(), host.ip());
    }

    #[test]
    fn bad_input() {
        assert!("10.0.0.0/33".parse::<Ipv4Cidr>().is_err());
        assert!("10.0.0.0".parse::<Ipv4Cidr>().is_err());
        assert!("10.0.0/8".parse::<Ipv4Cidr>().is_err());
        assert!("10.0.0.1.2".parse::<Ipv4Addr>().is_err());
        assert!("10.0.0.256".parse::<Ipv4Addr>().is_err());
    }

    #[test]
    fn protocol_numbers() {
        assert_eq!(Protocol::from(50), Protocol::Esp);
        assert_eq!(u8::from(Protocol::Ah), 51);
        assert_eq!(Protocol::from(99), Protocol::Other(99));
        assert_eq!(Protocol::Udp.to_string(), "udp");
        assert_eq!(Protocol::Other(99).to_string(), "proto99");
    }
}
