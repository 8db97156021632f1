// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

#![no_std]
#![deny(unreachable_patterns)]
#![deny(unused_must_use)]

#[cfg(any(feature = "std", test))]
#[macro_use]
extern crate std;

#[macro_use]
extern crate alloc;

use alloc::string::String;
use core::fmt;
use core::fmt::Display;
use serde::Deserialize;
use serde::Serialize;

pub mod cmd;
pub mod ip;
pub mod policy;
pub mod said;

pub use cmd::*;
pub use ip::*;
pub use policy::*;
pub use said::*;

/// The overall version of the API. Anytime a request/response type
/// or an error variant is added, removed, or modified, this number
/// should increment.
pub const API_VERSION: u64 = 3;

/// The direction an SA (or a packet) travels relative to this host.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum Direction {
    In = 1,
    Out = 2,
}

impl core::str::FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> core::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "in" | "incoming" => Ok(Direction::In),
            "out" | "outgoing" => Ok(Direction::Out),
            _ => Err(format!("invalid direction: {}", s)),
        }
    }
}

impl Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let dirstr = match self {
            Direction::In => "incoming",
            Direction::Out => "outgoing",
        };

        write!(f, "{}", dirstr)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use alloc::string::ToString;

    #[test]
    fn direction_parse() {
        assert_eq!("IN".parse::<Direction>().unwrap(), Direction::In);
        assert_eq!("outgoing".parse::<Direction>().unwrap(), Direction::Out);
        assert!("sideways".parse::<Direction>().is_err());
        assert_eq!(Direction::Out.to_string(), "outgoing");
    }
}
