// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! SA identifiers and the shunt pseudo-SAs.

use super::ip::Ipv4Addr;
use super::ip::PROTO_AH;
use super::ip::PROTO_COMP;
use super::ip::PROTO_ESP;
use super::ip::PROTO_INT;
use super::ip::PROTO_IPIP;
use alloc::string::String;
use core::fmt;
use core::fmt::Display;
use core::result;
use core::str::FromStr;
use serde::Deserialize;
use serde::Serialize;

pub const SPI_PASS: u32 = 256;
pub const SPI_DROP: u32 = 257;
pub const SPI_REJECT: u32 = 258;
pub const SPI_HOLD: u32 = 259;
pub const SPI_TRAP: u32 = 260;
pub const SPI_TRAPSUBNET: u32 = 261;

/// The transform protocol of an SA.
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
pub enum SaProto {
    Esp,
    Ah,
    /// IP-in-IP, the tunnel-mode wrapper.
    Ipip,
    Comp,
    /// The internal protocol used by the shunt pseudo-SAs.
    Int,
    Unknown(u8),
}

impl SaProto {
    fn prefix(&self) -> &'static str {
        match self {
            Self::Esp => "esp",
            Self::Ah => "ah",
            Self::Ipip => "tun",
            Self::Comp => "comp",
            Self::Int => "int",
            Self::Unknown(_) => "unk",
        }
    }
}

impl From<u8> for SaProto {
    fn from(proto: u8) -> Self {
        match proto {
            PROTO_ESP => Self::Esp,
            PROTO_AH => Self::Ah,
            PROTO_IPIP => Self::Ipip,
            PROTO_COMP => Self::Comp,
            PROTO_INT => Self::Int,
            _ => Self::Unknown(proto),
        }
    }
}

impl From<SaProto> for u8 {
    fn from(proto: SaProto) -> u8 {
        match proto {
            SaProto::Esp => PROTO_ESP,
            SaProto::Ah => PROTO_AH,
            SaProto::Ipip => PROTO_IPIP,
            SaProto::Comp => PROTO_COMP,
            SaProto::Int => PROTO_INT,
            SaProto::Unknown(v) => v,
        }
    }
}

/// A shunt action: a pseudo-SA that bypasses real cryptography.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize,
)]
pub enum Shunt {
    Pass,
    Drop,
    Reject,
    Hold,
    Trap,
    TrapSubnet,
}

impl Shunt {
    pub fn spi(&self) -> u32 {
        match self {
            Self::Pass => SPI_PASS,
            Self::Drop => SPI_DROP,
            Self::Reject => SPI_REJECT,
            Self::Hold => SPI_HOLD,
            Self::Trap => SPI_TRAP,
            Self::TrapSubnet => SPI_TRAPSUBNET,
        }
    }

    pub fn from_spi(spi: u32) -> Option<Self> {
        match spi {
            SPI_PASS => Some(Self::Pass),
            SPI_DROP => Some(Self::Drop),
            SPI_REJECT => Some(Self::Reject),
            SPI_HOLD => Some(Self::Hold),
            SPI_TRAP => Some(Self::Trap),
            SPI_TRAPSUBNET => Some(Self::TrapSubnet),
            _ => None,
        }
    }
}

impl Display for Shunt {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Self::Pass => "%pass",
            Self::Drop => "%drop",
            Self::Reject => "%reject",
            Self::Hold => "%hold",
            Self::Trap => "%trap",
            Self::TrapSubnet => "%trapsubnet",
        };
        write!(f, "{s}")
    }
}

/// What an SAId resolves to, before any SA store lookup.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SaTarget {
    Shunt(Shunt),
    /// An internal-protocol SAId with an SPI outside the reserved
    /// set.
    UnknownShunt(u32),
    Sa,
}

/// The identity of an SA: (proto, SPI, destination).
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
pub struct SaId {
    pub proto: SaProto,
    pub spi: u32,
    pub dst: Ipv4Addr,
}

impl SaId {
    pub fn new(proto: SaProto, spi: u32, dst: Ipv4Addr) -> Self {
        Self { proto, spi, dst }
    }

    pub fn shunt(shunt: Shunt) -> Self {
        Self { proto: SaProto::Int, spi: shunt.spi(), dst: Ipv4Addr::ANY_ADDR }
    }

    pub fn target(&self) -> SaTarget {
        if self.proto != SaProto::Int {
            return SaTarget::Sa;
        }

        match Shunt::from_spi(self.spi) {
            Some(s) => SaTarget::Shunt(s),
            None => SaTarget::UnknownShunt(self.spi),
        }
    }

    pub fn is_shunt(&self) -> bool {
        self.proto == SaProto::Int
    }
}

impl Display for SaId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if let SaTarget::Shunt(s) = self.target() {
            return write!(f, "{s}");
        }

        write!(f, "{}0x{:x}@{}", self.proto.prefix(), self.spi, self.dst)
    }
}

impl FromStr for SaId {
    type Err = String;

    /// Parse either a shunt name (`%drop`) or `<proto>0x<spi>@<dst>`.
    fn from_str(val: &str) -> result::Result<Self, Self::Err> {
        let shunt = match val {
            "%pass" => Some(Shunt::Pass),
            "%drop" => Some(Shunt::Drop),
            "%reject" => Some(Shunt::Reject),
            "%hold" => Some(Shunt::Hold),
            "%trap" => Some(Shunt::Trap),
            "%trapsubnet" => Some(Shunt::TrapSubnet),
            _ => None,
        };

        if let Some(s) = shunt {
            return Ok(SaId::shunt(s));
        }

        let (head, dst_s) = val
            .split_once('@')
            .ok_or_else(|| format!("no '@' in SA name: {val}"))?;
        let (proto_s, spi_s) = head
            .split_once("0x")
            .ok_or_else(|| format!("no SPI in SA name: {val}"))?;

        let proto = match proto_s {
            "esp" => SaProto::Esp,
            "ah" => SaProto::Ah,
            "tun" => SaProto::Ipip,
            "comp" => SaProto::Comp,
            "int" => SaProto::Int,
            _ => return Err(format!("unknown SA protocol: {proto_s}")),
        };

        let spi = u32::from_str_radix(spi_s, 16)
            .map_err(|e| format!("bad SPI {spi_s}: {e}"))?;
        let dst = dst_s.parse()?;
        Ok(SaId { proto, spi, dst })
    }
}

/// A source or destination identity attached to an SA or eroute.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Identity {
    /// The identity type as understood by the key-management daemon
    /// (prefix, FQDN, user FQDN, ...).
    pub kind: u16,
    pub id: String,
}

impl Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}
