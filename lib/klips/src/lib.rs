// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The outbound core of KLIPS: the eroute policy index, the SA store
//! with its lifetime and replay state, and the encapsulation pipeline
//! that ties them together.
//!
//! The pieces are plain service objects. A control actor builds an
//! [`engine::sa::SaStore`], an [`engine::eroute::Eroutes`] table and
//! an [`engine::alg::AlgRegistry`], then hands them to an
//! [`engine::tunnel::Tunnel`] which workers call once per outbound
//! packet.
//!
//! Unlike the api crate this one always links std: [`ddi`] carries only
//! the userland lock and clock substrate. The `std` feature adds the
//! consumer conveniences on top (TOML configuration, slog logging,
//! printing).

#![allow(clippy::len_without_is_empty)]
#![deny(unreachable_patterns)]
#![deny(unused_must_use)]

extern crate alloc;

#[macro_use]
extern crate cfg_if;

// This is needed so that the kstat-macro (`#[derive(KStatProvider)]`)
// can use fully-qualified type paths.
extern crate self as klips;

pub use klips_api as api;

pub mod cfg;
pub mod ddi;
pub mod engine;
#[cfg(feature = "std")]
pub mod print;
pub mod provider;

use alloc::boxed::Box;
use provider::LogProvider;

/// The execution context shared by the pipeline and the control
/// surface.
pub struct ExecCtx {
    pub log: Box<dyn LogProvider>,
}
