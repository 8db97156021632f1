// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Traffic selectors used to key eroutes.

use super::ip::Ipv4Addr;
use super::ip::Ipv4Cidr;
use alloc::string::String;
use core::fmt;
use core::fmt::Display;
use core::result;
use core::str::FromStr;
use serde::Deserialize;
use serde::Serialize;

/// The address half of a selector: either a subnet or an inclusive
/// range of addresses that does not fall on a CIDR boundary.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub enum AddrSpec {
    Cidr(Ipv4Cidr),
    Range { start: Ipv4Addr, end: Ipv4Addr },
}

impl AddrSpec {
    pub fn host(ip: Ipv4Addr) -> Self {
        Self::Cidr(Ipv4Cidr::host(ip))
    }

    pub fn range(start: Ipv4Addr, end: Ipv4Addr) -> Result<Self, String> {
        if u32::from(end) < u32::from(start) {
            return Err(format!("range end {end} is below start {start}"));
        }

        Ok(Self::Range { start, end })
    }

    pub fn is_range(&self) -> bool {
        matches!(self, Self::Range { .. })
    }

    pub fn start(&self) -> Ipv4Addr {
        match self {
            Self::Cidr(c) => c.ip(),
            Self::Range { start, .. } => *start,
        }
    }

    /// The inclusive end of the covered addresses.
    pub fn end(&self) -> Ipv4Addr {
        match self {
            Self::Cidr(c) => c.last(),
            Self::Range { end, .. } => *end,
        }
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        match self {
            Self::Cidr(c) => c.is_member(ip),
            Self::Range { start, end } => {
                let v = u32::from(ip);
                u32::from(*start) <= v && v <= u32::from(*end)
            }
        }
    }

    /// The number of addresses covered; smaller is more specific.
    pub fn span(&self) -> u64 {
        u64::from(u32::from(self.end())) - u64::from(u32::from(self.start()))
            + 1
    }

    /// The (address, mask) pair this side occupies in a fixed-width
    /// key. Ranges key on their start address with a full mask, so
    /// they only ever match that one address by key.
    pub fn key_parts(&self) -> (Ipv4Addr, Ipv4Addr) {
        match self {
            Self::Cidr(c) => (c.ip(), c.to_mask()),
            Self::Range { start, .. } => (*start, Ipv4Addr::BROADCAST),
        }
    }
}

impl Display for AddrSpec {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Cidr(c) => write!(f, "{c}"),
            Self::Range { start, end } => write!(f, "{start}-{end}"),
        }
    }
}

impl FromStr for AddrSpec {
    type Err = String;

    /// Accepts `10.0.0.0/24`, `10.0.0.5-10.0.0.9`, or a bare host.
    fn from_str(val: &str) -> result::Result<Self, Self::Err> {
        if let Some((s, e)) = val.split_once('-') {
            return AddrSpec::range(s.parse()?, e.parse()?);
        }

        if val.contains('/') {
            return Ok(AddrSpec::Cidr(val.parse()?));
        }

        Ok(AddrSpec::host(val.parse()?))
    }
}

/// An eroute selector. A zero protocol or port is a wildcard.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct Selector {
    pub src: AddrSpec,
    pub dst: AddrSpec,
    pub proto: u8,
    pub sport: u16,
    pub dport: u16,
}

/// The width of [`Selector::key()`].
pub const SELECTOR_KEY_LEN: usize = 13;

impl Selector {
    pub fn new(src: AddrSpec, dst: AddrSpec) -> Self {
        Self { src, dst, proto: 0, sport: 0, dport: 0 }
    }

    pub fn subnets(src: Ipv4Cidr, dst: Ipv4Cidr) -> Self {
        Self::new(AddrSpec::Cidr(src), AddrSpec::Cidr(dst))
    }

    pub fn with_proto(mut self, proto: u8) -> Self {
        self.proto = proto;
        self
    }

    pub fn with_ports(mut self, sport: u16, dport: u16) -> Self {
        self.sport = sport;
        self.dport = dport;
        self
    }

    /// The fixed-width key: src, dst, proto, sport, dport in network
    /// order.
    pub fn key(&self) -> [u8; SELECTOR_KEY_LEN] {
        let mut key = [0u8; SELECTOR_KEY_LEN];
        key[0..4].copy_from_slice(&self.src.start().bytes());
        key[4..8].copy_from_slice(&self.dst.start().bytes());
        key[8] = self.proto;
        key[9..11].copy_from_slice(&self.sport.to_be_bytes());
        key[11..13].copy_from_slice(&self.dport.to_be_bytes());
        key
    }

    /// The mask that pairs with [`Self::key()`].
    pub fn mask(&self) -> [u8; SELECTOR_KEY_LEN] {
        let mut mask = [0u8; SELECTOR_KEY_LEN];
        mask[0..4].copy_from_slice(&self.src.key_parts().1.bytes());
        mask[4..8].copy_from_slice(&self.dst.key_parts().1.bytes());
        if self.proto != 0 {
            mask[8] = 0xFF;
        }
        if self.sport != 0 {
            mask[9..11].copy_from_slice(&[0xFF, 0xFF]);
        }
        if self.dport != 0 {
            mask[11..13].copy_from_slice(&[0xFF, 0xFF]);
        }
        mask
    }
}

impl Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.src)?;
        if self.sport != 0 {
            write!(f, ":{}", self.sport)?;
        }
        write!(f, " -> {}", self.dst)?;
        if self.dport != 0 {
            write!(f, ":{}", self.dport)?;
        }
        if self.proto != 0 {
            write!(f, " proto {}", self.proto)?;
        }
        Ok(())
    }
}
