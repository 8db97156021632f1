// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The outbound engine.
//!
//! Policy lives in [`eroute`], keyed state in [`sa`], and [`tunnel`]
//! runs each outbound packet through both. Cryptography sits behind
//! [`alg`] and everything the engine says to key management goes
//! through [`notify`].
pub mod alg;
pub mod checksum;
pub mod eroute;
pub mod icmp;
pub mod ip4;
pub mod life;
pub mod notify;
pub mod packet;
pub mod sa;
pub mod tunnel;

pub use crate::api::Direction;
