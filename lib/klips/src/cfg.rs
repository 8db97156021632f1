// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Tunnel configuration.
//!
//! A [`TunnelCfg`] is usually built in code, but std consumers may
//! also load one from TOML. Every field has a default, so an empty
//! document yields a working `ipsec0`.

use crate::api::Ipv4Addr;
use crate::engine::eroute::EROUTE_DEF_LIMIT;
use crate::engine::sa::SA_HASH_DEF_BUCKETS;
use alloc::string::String;
use alloc::string::ToString;
use alloc::vec::Vec;
use bitflags::bitflags;
use serde::Deserialize;
use serde::Serialize;

pub const DEF_MTU: u16 = 1500;
pub const DEF_MAX_NESTING: u8 = 4;
pub const IKE_PORT: u16 = 500;
pub const IKE_NATT_PORT: u16 = 4500;

bitflags! {
    /// The boolean knobs of a [`TunnelCfg`], folded together.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct TunnelFlags: u8 {
        /// Send ICMP fragmentation-needed for oversized DF packets.
        const ICMP = 1 << 0;
        /// Drop oversized DF packets instead of sending them anyway.
        const OBEY_DF = 1 << 1;
        /// Copy the inner TOS into IPIP outer headers.
        const COPY_TOS = 1 << 2;
    }
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct TunnelCfg {
    /// The virtual interface name, also used as the kstat name.
    pub name: String,
    /// The MTU of the underlying physical interface.
    pub phys_mtu: u16,
    /// The initial advertised tunnel MTU.
    pub mtu: u16,
    pub icmp: bool,
    pub obey_df: bool,
    pub copy_tos: bool,
    /// UDP source ports of local key-management traffic, which always
    /// bypasses policy.
    pub key_mgmt_ports: Vec<u16>,
    /// The addresses considered local for that bypass.
    #[serde(with = "addr_list")]
    pub local_addrs: Vec<Ipv4Addr>,
    /// How many eroute re-resolutions a packet may go through.
    pub max_nesting: u8,
    pub eroute_limit: usize,
    pub sa_hash_buckets: usize,
}

// Addresses are written as dotted quads in the config file.
mod addr_list {
    use crate::api::Ipv4Addr;
    use alloc::string::String;
    use alloc::string::ToString;
    use alloc::vec::Vec;
    use serde::Deserialize;
    use serde::Deserializer;
    use serde::Serializer;
    use serde::de::Error;

    pub fn serialize<S: Serializer>(
        addrs: &[Ipv4Addr],
        s: S,
    ) -> Result<S::Ok, S::Error> {
        s.collect_seq(addrs.iter().map(|a| a.to_string()))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> Result<Vec<Ipv4Addr>, D::Error> {
        Vec::<String>::deserialize(d)?
            .iter()
            .map(|s| s.parse().map_err(D::Error::custom))
            .collect()
    }
}

impl Default for TunnelCfg {
    fn default() -> Self {
        Self {
            name: "ipsec0".to_string(),
            phys_mtu: DEF_MTU,
            mtu: DEF_MTU,
            icmp: true,
            obey_df: false,
            copy_tos: false,
            key_mgmt_ports: vec![IKE_PORT, IKE_NATT_PORT],
            local_addrs: Vec::new(),
            max_nesting: DEF_MAX_NESTING,
            eroute_limit: EROUTE_DEF_LIMIT,
            sa_hash_buckets: SA_HASH_DEF_BUCKETS,
        }
    }
}

impl TunnelCfg {
    pub fn flags(&self) -> TunnelFlags {
        let mut flags = TunnelFlags::empty();
        flags.set(TunnelFlags::ICMP, self.icmp);
        flags.set(TunnelFlags::OBEY_DF, self.obey_df);
        flags.set(TunnelFlags::COPY_TOS, self.copy_tos);
        flags
    }

    pub fn is_local(&self, addr: Ipv4Addr) -> bool {
        self.local_addrs.contains(&addr)
    }
}

cfg_if! {
    if #[cfg(feature = "std")] {
        use std::path::Path;

        #[derive(Debug, thiserror::Error)]
        pub enum ConfigError {
            #[error("failed to read {path}: {err}")]
            Io { path: String, err: std::io::Error },

            #[error("failed to parse tunnel config: {0}")]
            Parse(#[from] toml::de::Error),

            #[error("invalid tunnel config: {0}")]
            Invalid(String),
        }

        impl TunnelCfg {
            /// Parse and validate a TOML document.
            pub fn from_toml(s: &str) -> Result<Self, ConfigError> {
                let cfg: Self = toml::from_str(s)?;
                cfg.validate()?;
                Ok(cfg)
            }

            pub fn load(path: &Path) -> Result<Self, ConfigError> {
                let s = std::fs::read_to_string(path).map_err(|err| {
                    ConfigError::Io { path: path.display().to_string(), err }
                })?;
                Self::from_toml(&s)
            }

            pub fn validate(&self) -> Result<(), ConfigError> {
                if self.name.is_empty() {
                    return Err(ConfigError::Invalid("empty name".to_string()));
                }

                if self.mtu > self.phys_mtu {
                    return Err(ConfigError::Invalid(format!(
                        "mtu {} exceeds phys_mtu {}",
                        self.mtu, self.phys_mtu
                    )));
                }

                if self.max_nesting == 0 {
                    return Err(ConfigError::Invalid(
                        "max_nesting must be at least 1".to_string(),
                    ));
                }

                if self.sa_hash_buckets == 0 {
                    return Err(ConfigError::Invalid(
                        "sa_hash_buckets must be at least 1".to_string(),
                    ));
                }

                Ok(())
            }
        }
    }
}
