// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Control-surface errors and diagnostic dump responses.

use super::Direction;
use super::ip::Ipv4Addr;
use super::policy::Selector;
use super::said::Identity;
use super::said::SaId;
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;
use core::fmt::Display;
use serde::Deserialize;
use serde::Serialize;

// The handful of errno values the control surface maps onto.
pub const ENOENT: i32 = 2;
pub const ENOMEM: i32 = 12;
pub const EBUSY: i32 = 16;
pub const EEXIST: i32 = 17;
pub const EINVAL: i32 = 22;
pub const EMLINK: i32 = 31;
pub const ENOBUFS: i32 = 105;

/// An error surfaced to the control actor by the SA store, the
/// eroute table, or the algorithm registry.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum KlipsError {
    AlgExists { alg_type: String, id: u8 },
    AlgInUse { name: String, refs: usize },
    AlgNotFound { alg_type: String, id: u8 },
    BadKeyLen { name: String, bits: usize },
    ErouteExists(String),
    ErouteNotFound(String),
    MaxCapacity(u64),
    NotifyFailed(String),
    SaExists(String),
    SaNotFound(String),
    /// The SA is still part of a bundle and cannot be removed on its
    /// own.
    StillLinked(String),
    System { errno: i32, msg: String },
}

impl KlipsError {
    /// Convert to an errno value.
    pub fn to_errno(&self) -> i32 {
        match self {
            Self::AlgExists { .. } => EEXIST,
            Self::AlgInUse { .. } => EBUSY,
            Self::AlgNotFound { .. } => ENOENT,
            Self::BadKeyLen { .. } => EINVAL,
            Self::ErouteExists(_) => EEXIST,
            Self::ErouteNotFound(_) => ENOENT,
            Self::MaxCapacity(_) => ENOMEM,
            Self::NotifyFailed(_) => ENOBUFS,
            Self::SaExists(_) => EEXIST,
            Self::SaNotFound(_) => ENOENT,
            Self::StillLinked(_) => EMLINK,
            Self::System { errno, .. } => *errno,
        }
    }
}

impl Display for KlipsError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::AlgExists { alg_type, id } => {
                write!(f, "{alg_type} algorithm {id} already registered")
            }
            Self::AlgInUse { name, refs } => {
                write!(f, "algorithm {name} still has {refs} users")
            }
            Self::AlgNotFound { alg_type, id } => {
                write!(f, "no {alg_type} algorithm with id {id}")
            }
            Self::BadKeyLen { name, bits } => {
                write!(f, "{bits}-bit key is not valid for {name}")
            }
            Self::ErouteExists(sel) => write!(f, "eroute exists: {sel}"),
            Self::ErouteNotFound(sel) => write!(f, "eroute not found: {sel}"),
            Self::MaxCapacity(limit) => {
                write!(f, "table at max capacity: {limit}")
            }
            Self::NotifyFailed(msg) => {
                write!(f, "key management notify failed: {msg}")
            }
            Self::SaExists(said) => write!(f, "SA exists: {said}"),
            Self::SaNotFound(said) => write!(f, "SA not found: {said}"),
            Self::StillLinked(said) => {
                write!(f, "SA still linked into a bundle: {said}")
            }
            Self::System { errno, msg } => {
                write!(f, "system error {errno}: {msg}")
            }
        }
    }
}

/// The lifecycle state of an SA.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum SaState {
    Larval,
    Mature,
    Dying,
    Dead,
}

impl SaState {
    /// May the outbound path use an SA in this state?
    pub fn is_usable(&self) -> bool {
        matches!(self, Self::Mature | Self::Dying)
    }
}

impl Display for SaState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Self::Larval => "larval",
            Self::Mature => "mature",
            Self::Dying => "dying",
            Self::Dead => "dead",
        };
        write!(f, "{s}")
    }
}

/// One eroute as listed by a table dump.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ErouteDump {
    pub count: u64,
    pub sel: Selector,
    pub said: SaId,
    pub pid: u32,
    pub ident_s: Option<Identity>,
    pub ident_d: Option<Identity>,
    /// Is the entry holding a packet while negotiation completes?
    pub retained: bool,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct DumpErouteResp {
    pub limit: u64,
    pub entries: Vec<ErouteDump>,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct LifetimeDump {
    pub name: String,
    pub count: u64,
    pub soft: u64,
    pub hard: u64,
    pub last: u64,
    /// The compact `name(count,soft,hard)` rendering, empty for a
    /// lifetime still at its defaults.
    pub text: String,
}

/// One SA as listed by a store dump.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SaDump {
    pub said: SaId,
    pub state: SaState,
    pub dir: Direction,
    pub replay_seq: u32,
    pub replay_window: u8,
    pub enc_alg: Option<String>,
    pub auth_alg: Option<String>,
    pub addr_s: Option<Ipv4Addr>,
    pub addr_d: Option<Ipv4Addr>,
    pub next: Option<SaId>,
    pub prev: Option<SaId>,
    pub lifetimes: Vec<LifetimeDump>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct DumpSaResp {
    pub entries: Vec<SaDump>,
}

#[cfg(test)]
mod test {
    use super::*;
    use alloc::string::ToString;

    #[test]
    fn errno_mapping() {
        assert_eq!(KlipsError::StillLinked("x".to_string()).to_errno(), EMLINK);
        assert_eq!(KlipsError::SaNotFound("x".to_string()).to_errno(), ENOENT);
        assert_eq!(KlipsError::MaxCapacity(8).to_errno(), ENOMEM);
    }

    #[test]
    fn error_serde() {
        let err = KlipsError::AlgInUse { name: "aes".to_string(), refs: 2 };
        let json = serde_json::to_string(&err).unwrap();
        let back: KlipsError = serde_json::from_str(&json).unwrap();
        assert_eq!(back, err);
        assert_eq!(err.to_string(), "algorithm aes still has 2 users");
    }

    #[test]
    fn usable_states() {
        assert!(!SaState::Larval.is_usable());
        assert!(SaState::Mature.is_usable());
        assert!(SaState::Dying.is_usable());
        assert!(!SaState::Dead.is_usable());
    }
}
