// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The internet checksum (RFC 1071).
//!
//! The outbound path rewrites the IPv4 total length after every
//! transform and recomputes the header checksum from scratch; the
//! header is twenty bytes so there is nothing to gain from an
//! incremental update. ICMP messages built for reject and
//! fragmentation-needed signals are summed the same way.
//!
//! Each pair of bytes is summed as a native-endian `u16` and the
//! result stored with `to_ne_bytes()`. Since the bytes being summed
//! are in network order, so is the stored checksum.

/// A rolling one's complement sum, with carries folded on
/// [`Checksum::finalize()`].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Checksum {
    inner: u32,
}

impl Checksum {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a sum over `bytes`.
    pub fn compute(bytes: &[u8]) -> Self {
        let mut csum = Self::new();
        csum.add_bytes(bytes);
        csum
    }

    /// Add `bytes` to the sum. A trailing odd byte is padded with a
    /// zero byte.
    pub fn add_bytes(&mut self, bytes: &[u8]) {
        let mut chunks = bytes.chunks_exact(2);
        for pair in &mut chunks {
            self.inner += u32::from(u16::from_ne_bytes([pair[0], pair[1]]));
            self.fold_once();
        }

        if let [last] = chunks.remainder() {
            self.inner += u32::from(u16::from_ne_bytes([*last, 0]));
            self.fold_once();
        }
    }

    // Keep the accumulator from overflowing on long inputs.
    fn fold_once(&mut self) {
        if self.inner > 0xFFFF {
            self.inner = (self.inner >> 16) + (self.inner & 0xFFFF);
        }
    }

    /// Fold every carry and return the 16-bit sum.
    pub fn finalize(&self) -> u16 {
        let mut sum = self.inner;
        while (sum >> 16) != 0 {
            sum = (sum >> 16) + (sum & 0xFFFF);
        }
        sum as u16
    }

    /// The bytes to store in a header checksum field.
    pub fn header_bytes(&self) -> [u8; 2] {
        (!self.finalize()).to_ne_bytes()
    }
}

/// Does `bytes`, checksum field included, sum to all ones?
pub fn verify(bytes: &[u8]) -> bool {
    Checksum::compute(bytes).finalize() == 0xFFFF
}
