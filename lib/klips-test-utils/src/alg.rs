// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Algorithm providers for observing the engine from the outside.

use klips::ddi::sync::KMutex;
use klips::engine::alg::AlgDesc;
use klips::engine::alg::AlgError;
use klips::engine::alg::AlgProvider;
use klips::engine::alg::AlgType;
use klips::engine::alg::KeyCtx;
use zeroize::Zeroize;

pub const TRACE_CIPHER_ID: u8 = 250;
pub const RLE_COMP_ID: u8 = 251;

static TRACE_DESC: AlgDesc = AlgDesc {
    name: "trace",
    alg_type: AlgType::Encrypt,
    id: TRACE_CIPHER_ID,
    block_size: 8,
    iv_len: 8,
    icv_len: 0,
    key_bits_min: 64,
    key_bits_max: 256,
};

/// What [`TraceCipher`] saw when a key was destroyed.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DestroyRecord {
    /// The key as it was handed to the hook.
    pub key: Vec<u8>,
    /// Did the context read as zero once the hook was done?
    pub zeroed: bool,
}

/// A cipher that XORs with its key and keeps a record of every key it
/// is asked to destroy.
#[derive(Default)]
pub struct TraceCipher {
    destroyed: KMutex<Vec<DestroyRecord>>,
}

impl TraceCipher {
    pub fn destroyed(&self) -> Vec<DestroyRecord> {
        self.destroyed.lock().clone()
    }
}

impl AlgProvider for TraceCipher {
    fn desc(&self) -> &AlgDesc {
        &TRACE_DESC
    }

    fn encrypt(
        &self,
        ctx: &KeyCtx,
        _iv: &[u8],
        data: &mut [u8],
    ) -> Result<(), AlgError> {
        let key = ctx.bytes();
        for (i, b) in data.iter_mut().enumerate() {
            *b ^= key[i % key.len()];
        }
        Ok(())
    }

    fn destroy_key(&self, ctx: &mut KeyCtx) {
        let key = ctx.bytes().to_vec();
        ctx.zeroize();
        self.destroyed.lock().push(DestroyRecord { key, zeroed: ctx.is_zero() });
    }
}

static RLE_DESC: AlgDesc = AlgDesc {
    name: "rle",
    alg_type: AlgType::Comp,
    id: RLE_COMP_ID,
    block_size: 1,
    iv_len: 0,
    icv_len: 0,
    key_bits_min: 0,
    key_bits_max: 0,
};

/// Run-length coding as (count, byte) pairs. Only long runs shrink.
pub struct RleComp;

impl AlgProvider for RleComp {
    fn desc(&self) -> &AlgDesc {
        &RLE_DESC
    }

    fn compress(&self, data: &[u8]) -> Result<Option<Vec<u8>>, AlgError> {
        let out = rle_encode(data);
        Ok((out.len() < data.len()).then_some(out))
    }
}

pub fn rle_encode(data: &[u8]) -> Vec<u8> {
    let mut out = vec![];
    let mut iter = data.iter().peekable();
    while let Some(&b) = iter.next() {
        let mut run = 1u8;
        while run < u8::MAX && iter.peek() == Some(&&b) {
            iter.next();
            run += 1;
        }
        out.extend_from_slice(&[run, b]);
    }
    out
}

pub fn rle_decode(data: &[u8]) -> Vec<u8> {
    data.chunks_exact(2)
        .flat_map(|pair| std::iter::repeat_n(pair[1], usize::from(pair[0])))
        .collect()
}
