// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The algorithm registry.
//!
//! The pipeline never implements cryptography itself. Every cipher,
//! authenticator, and compressor is an [`AlgProvider`] registered
//! under its `(type, id)` pair; an SA binds to a provider by taking a
//! reference to it along with a keyed [`KeyCtx`].
//!
//! A provider implements the capabilities it has and leaves the rest
//! to the default methods, which refuse.

use crate::api::KlipsError;
use crate::ddi::sync::KRwLock;
use aes::Aes128;
use aes::Aes256;
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::string::ToString;
use alloc::sync::Arc;
use alloc::vec::Vec;
use cbc::cipher::block_padding::NoPadding;
use cbc::cipher::BlockEncryptMut;
use cbc::cipher::KeyIvInit;
use core::fmt;
use core::fmt::Display;
use des::TdesEde3;
use hmac::Hmac;
use hmac::Mac;
use serde::Deserialize;
use serde::Serialize;
use sha2::Sha256;
use zeroize::Zeroize;
use zeroize::ZeroizeOnDrop;

// Transform ids, as numbered by the key-management protocol.
pub const ESP_3DES: u8 = 3;
pub const ESP_NULL: u8 = 11;
pub const ESP_AES: u8 = 12;
pub const AH_SHA2_256: u8 = 5;

#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Ord, PartialEq, PartialOrd, Serialize,
)]
pub enum AlgType {
    Encrypt,
    Auth,
    Comp,
}

impl Display for AlgType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Self::Encrypt => "encrypt",
            Self::Auth => "auth",
            Self::Comp => "comp",
        };
        write!(f, "{s}")
    }
}

/// The static description of a provider.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct AlgDesc {
    pub name: &'static str,
    pub alg_type: AlgType,
    pub id: u8,
    /// The cipher block size; 1 for a stream or null cipher.
    pub block_size: usize,
    /// The IV carried in each ESP header.
    pub iv_len: usize,
    /// The authenticator appended to each packet.
    pub icv_len: usize,
    pub key_bits_min: usize,
    pub key_bits_max: usize,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum AlgError {
    BadKeyLen { name: &'static str, bits: usize },
    BadIvLen { want: usize, have: usize },
    NotBlockAligned { len: usize, block_size: usize },
    Unsupported { name: &'static str, op: &'static str },
    Cipher(&'static str),
}

impl Display for AlgError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::BadKeyLen { name, bits } => {
                write!(f, "{bits}-bit key is not valid for {name}")
            }
            Self::BadIvLen { want, have } => {
                write!(f, "IV must be {want} bytes, got {have}")
            }
            Self::NotBlockAligned { len, block_size } => {
                write!(f, "{len} bytes is not a multiple of {block_size}")
            }
            Self::Unsupported { name, op } => {
                write!(f, "{name} does not support {op}")
            }
            Self::Cipher(msg) => write!(f, "cipher failure: {msg}"),
        }
    }
}

impl From<AlgError> for KlipsError {
    fn from(err: AlgError) -> Self {
        match err {
            AlgError::BadKeyLen { name, bits } => {
                KlipsError::BadKeyLen { name: name.to_string(), bits }
            }
            _ => KlipsError::System {
                errno: crate::api::EINVAL,
                msg: err.to_string(),
            },
        }
    }
}

/// Keyed state for one SA's use of a provider. The key is scrubbed on
/// drop; scrubbing in place keeps the buffer's length.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct KeyCtx {
    key: Box<[u8]>,
}

impl KeyCtx {
    pub fn new(key: &[u8]) -> Self {
        Self { key: key.into() }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.key
    }

    pub fn is_zero(&self) -> bool {
        self.key.iter().all(|b| *b == 0)
    }
}

impl fmt::Debug for KeyCtx {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "KeyCtx {{ {} bytes }}", self.key.len())
    }
}

pub trait AlgProvider: Send + Sync {
    fn desc(&self) -> &AlgDesc;

    /// Validate `key` against the provider's bounds and build its
    /// keyed context.
    fn set_key(&self, key: &[u8]) -> Result<KeyCtx, AlgError> {
        let desc = self.desc();
        let bits = key.len() * 8;
        if bits < desc.key_bits_min || bits > desc.key_bits_max {
            return Err(AlgError::BadKeyLen { name: desc.name, bits });
        }
        Ok(KeyCtx::new(key))
    }

    /// Encrypt `data` in place. The length of `data` is a multiple of
    /// the block size.
    fn encrypt(
        &self,
        _ctx: &KeyCtx,
        _iv: &[u8],
        _data: &mut [u8],
    ) -> Result<(), AlgError> {
        Err(AlgError::Unsupported { name: self.desc().name, op: "encrypt" })
    }

    /// Compute the authenticator over `parts`, in order, writing the
    /// truncated result into `icv`.
    fn digest(
        &self,
        _ctx: &KeyCtx,
        _parts: &[&[u8]],
        _icv: &mut [u8],
    ) -> Result<(), AlgError> {
        Err(AlgError::Unsupported { name: self.desc().name, op: "digest" })
    }

    /// Compress `data`. `None` means the result would not be smaller.
    fn compress(&self, _data: &[u8]) -> Result<Option<Vec<u8>>, AlgError> {
        Err(AlgError::Unsupported { name: self.desc().name, op: "compress" })
    }

    /// Release any provider state held for `ctx`. The context must
    /// read as zero afterwards.
    fn destroy_key(&self, ctx: &mut KeyCtx) {
        ctx.zeroize();
    }
}

/// An SA's reference to a provider together with its key.
pub struct AlgBinding {
    provider: Arc<dyn AlgProvider>,
    key: KeyCtx,
}

impl AlgBinding {
    pub fn new(provider: Arc<dyn AlgProvider>, key: &[u8]) -> Result<Self, AlgError> {
        let key = provider.set_key(key)?;
        Ok(Self { provider, key })
    }

    pub fn desc(&self) -> &AlgDesc {
        self.provider.desc()
    }

    pub fn key(&self) -> &KeyCtx {
        &self.key
    }

    pub fn encrypt(&self, iv: &[u8], data: &mut [u8]) -> Result<(), AlgError> {
        self.provider.encrypt(&self.key, iv, data)
    }

    pub fn digest(&self, parts: &[&[u8]], icv: &mut [u8]) -> Result<(), AlgError> {
        self.provider.digest(&self.key, parts, icv)
    }

    pub fn compress(&self, data: &[u8]) -> Result<Option<Vec<u8>>, AlgError> {
        self.provider.compress(data)
    }

    /// Run the provider's destroy hook, then scrub what is left.
    pub fn destroy(&mut self) {
        self.provider.destroy_key(&mut self.key);
        self.key.zeroize();
    }
}

impl fmt::Debug for AlgBinding {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "AlgBinding {{ {} }}", self.desc().name)
    }
}

fn check_cbc_args(
    desc: &AlgDesc,
    iv: &[u8],
    data: &[u8],
) -> Result<(), AlgError> {
    if iv.len() != desc.iv_len {
        return Err(AlgError::BadIvLen { want: desc.iv_len, have: iv.len() });
    }

    if data.len() % desc.block_size != 0 {
        return Err(AlgError::NotBlockAligned {
            len: data.len(),
            block_size: desc.block_size,
        });
    }

    Ok(())
}

fn cbc_encrypt<C>(key: &[u8], iv: &[u8], data: &mut [u8]) -> Result<(), AlgError>
where
    cbc::Encryptor<C>: KeyIvInit + BlockEncryptMut,
    C: cbc::cipher::BlockCipher + cbc::cipher::BlockEncryptMut,
{
    let len = data.len();
    let enc = cbc::Encryptor::<C>::new_from_slices(key, iv)
        .map_err(|_| AlgError::Cipher("bad key or IV length"))?;
    enc.encrypt_padded_mut::<NoPadding>(data, len)
        .map_err(|_| AlgError::Cipher("unpadded input"))?;
    Ok(())
}

/// The null cipher: ESP framing without confidentiality.
pub struct NullCipher;

static NULL_DESC: AlgDesc = AlgDesc {
    name: "null",
    alg_type: AlgType::Encrypt,
    id: ESP_NULL,
    block_size: 1,
    iv_len: 0,
    icv_len: 0,
    key_bits_min: 0,
    key_bits_max: 512,
};

impl AlgProvider for NullCipher {
    fn desc(&self) -> &AlgDesc {
        &NULL_DESC
    }

    fn encrypt(
        &self,
        _ctx: &KeyCtx,
        _iv: &[u8],
        _data: &mut [u8],
    ) -> Result<(), AlgError> {
        Ok(())
    }
}

/// Triple DES (EDE3) in CBC mode.
pub struct TdesCbc;

static TDES_DESC: AlgDesc = AlgDesc {
    name: "3des",
    alg_type: AlgType::Encrypt,
    id: ESP_3DES,
    block_size: 8,
    iv_len: 8,
    icv_len: 0,
    key_bits_min: 192,
    key_bits_max: 192,
};

impl AlgProvider for TdesCbc {
    fn desc(&self) -> &AlgDesc {
        &TDES_DESC
    }

    fn encrypt(
        &self,
        ctx: &KeyCtx,
        iv: &[u8],
        data: &mut [u8],
    ) -> Result<(), AlgError> {
        check_cbc_args(&TDES_DESC, iv, data)?;
        cbc_encrypt::<TdesEde3>(ctx.bytes(), iv, data)
    }
}

/// AES in CBC mode, with a 128 or 256-bit key.
pub struct AesCbc;

static AES_DESC: AlgDesc = AlgDesc {
    name: "aes",
    alg_type: AlgType::Encrypt,
    id: ESP_AES,
    block_size: 16,
    iv_len: 16,
    icv_len: 0,
    key_bits_min: 128,
    key_bits_max: 256,
};

impl AlgProvider for AesCbc {
    fn desc(&self) -> &AlgDesc {
        &AES_DESC
    }

    fn set_key(&self, key: &[u8]) -> Result<KeyCtx, AlgError> {
        match key.len() {
            16 | 32 => Ok(KeyCtx::new(key)),
            n => Err(AlgError::BadKeyLen { name: AES_DESC.name, bits: n * 8 }),
        }
    }

    fn encrypt(
        &self,
        ctx: &KeyCtx,
        iv: &[u8],
        data: &mut [u8],
    ) -> Result<(), AlgError> {
        check_cbc_args(&AES_DESC, iv, data)?;
        match ctx.bytes().len() {
            16 => cbc_encrypt::<Aes128>(ctx.bytes(), iv, data),
            _ => cbc_encrypt::<Aes256>(ctx.bytes(), iv, data),
        }
    }
}

/// HMAC-SHA-256 truncated to 128 bits (RFC 4868).
pub struct HmacSha256;

static HMAC_SHA256_DESC: AlgDesc = AlgDesc {
    name: "hmac-sha2-256-128",
    alg_type: AlgType::Auth,
    id: AH_SHA2_256,
    block_size: 1,
    iv_len: 0,
    icv_len: 16,
    key_bits_min: 256,
    key_bits_max: 256,
};

impl AlgProvider for HmacSha256 {
    fn desc(&self) -> &AlgDesc {
        &HMAC_SHA256_DESC
    }

    fn digest(
        &self,
        ctx: &KeyCtx,
        parts: &[&[u8]],
        icv: &mut [u8],
    ) -> Result<(), AlgError> {
        let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(ctx.bytes())
            .map_err(|_| AlgError::BadKeyLen {
                name: HMAC_SHA256_DESC.name,
                bits: ctx.bytes().len() * 8,
            })?;
        for part in parts {
            mac.update(part);
        }
        let full = mac.finalize().into_bytes();
        let n = icv.len().min(HMAC_SHA256_DESC.icv_len);
        icv[..n].copy_from_slice(&full[..n]);
        Ok(())
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RegistryError {
    Exists { alg_type: AlgType, id: u8 },
    InUse { name: &'static str, refs: usize },
    NotFound { alg_type: AlgType, id: u8 },
}

impl From<RegistryError> for KlipsError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::Exists { alg_type, id } => {
                KlipsError::AlgExists { alg_type: alg_type.to_string(), id }
            }
            RegistryError::InUse { name, refs } => {
                KlipsError::AlgInUse { name: name.to_string(), refs }
            }
            RegistryError::NotFound { alg_type, id } => {
                KlipsError::AlgNotFound { alg_type: alg_type.to_string(), id }
            }
        }
    }
}

type AlgMap = BTreeMap<(AlgType, u8), Arc<dyn AlgProvider>>;

/// The set of registered providers, keyed by `(type, id)`.
pub struct AlgRegistry {
    algs: KRwLock<AlgMap>,
}

impl AlgRegistry {
    pub fn new() -> Self {
        Self { algs: KRwLock::new(BTreeMap::new()) }
    }

    /// A registry holding the built-in providers.
    pub fn with_builtins() -> Self {
        let mut algs: AlgMap = BTreeMap::new();
        let builtins: [Arc<dyn AlgProvider>; 4] = [
            Arc::new(NullCipher),
            Arc::new(TdesCbc),
            Arc::new(AesCbc),
            Arc::new(HmacSha256),
        ];
        for p in builtins {
            algs.insert((p.desc().alg_type, p.desc().id), p);
        }
        Self { algs: KRwLock::new(algs) }
    }

    pub fn register(
        &self,
        provider: Arc<dyn AlgProvider>,
    ) -> Result<(), RegistryError> {
        let key = (provider.desc().alg_type, provider.desc().id);
        let mut algs = self.algs.write();
        if algs.contains_key(&key) {
            return Err(RegistryError::Exists { alg_type: key.0, id: key.1 });
        }
        algs.insert(key, provider);
        Ok(())
    }

    /// Remove a provider. This fails while anything other than the
    /// registry still holds a reference to it.
    pub fn unregister(
        &self,
        alg_type: AlgType,
        id: u8,
    ) -> Result<(), RegistryError> {
        let mut algs = self.algs.write();
        let refs = match algs.get(&(alg_type, id)) {
            Some(p) => Arc::strong_count(p),
            None => return Err(RegistryError::NotFound { alg_type, id }),
        };

        if refs > 1 {
            let name = algs[&(alg_type, id)].desc().name;
            return Err(RegistryError::InUse { name, refs: refs - 1 });
        }

        algs.remove(&(alg_type, id));
        Ok(())
    }

    pub fn lookup(
        &self,
        alg_type: AlgType,
        id: u8,
    ) -> Option<Arc<dyn AlgProvider>> {
        self.algs.read().get(&(alg_type, id)).cloned()
    }

    /// Look up a provider and key it for an SA.
    pub fn bind(
        &self,
        alg_type: AlgType,
        id: u8,
        key: &[u8],
    ) -> Result<AlgBinding, KlipsError> {
        let provider = self
            .lookup(alg_type, id)
            .ok_or(RegistryError::NotFound { alg_type, id })?;
        Ok(AlgBinding::new(provider, key)?)
    }

    pub fn list(&self) -> Vec<AlgDesc> {
        self.algs.read().values().map(|p| p.desc().clone()).collect()
    }
}

impl Default for AlgRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use hmac::Mac;

    #[test]
    fn builtins_present() {
        let reg = AlgRegistry::with_builtins();
        assert_eq!(reg.list().len(), 4);
        let aes = reg.lookup(AlgType::Encrypt, ESP_AES).unwrap();
        assert_eq!(aes.desc().block_size, 16);
        assert!(reg.lookup(AlgType::Auth, ESP_AES).is_none());
    }

    #[test]
    fn key_bounds() {
        assert!(matches!(
            AesCbc.set_key(&[0u8; 24]),
            Err(AlgError::BadKeyLen { bits: 192, .. })
        ));
        assert!(AesCbc.set_key(&[0u8; 32]).is_ok());
        assert!(TdesCbc.set_key(&[0u8; 16]).is_err());
        assert!(HmacSha256.set_key(&[7u8; 32]).is_ok());
        assert!(NullCipher.set_key(&[]).is_ok());
    }

    #[test]
    fn aes_cbc_known_answer() {
        // NIST SP 800-38A F.2.1, first block.
        let key = [
            0x2b, 0x7e, 0x15, 0x16, 0x28, 0xae, 0xd2, 0xa6, 0xab, 0xf7, 0x15,
            0x88, 0x09, 0xcf, 0x4f, 0x3c,
        ];
        let iv: Vec<u8> = (0u8..16).collect();
        let mut data = [
            0x6b, 0xc1, 0xbe, 0xe2, 0x2e, 0x40, 0x9f, 0x96, 0xe9, 0x3d, 0x7e,
            0x11, 0x73, 0x93, 0x17, 0x2a,
        ];
        let ctx = AesCbc.set_key(&key).unwrap();
        AesCbc.encrypt(&ctx, &iv, &mut data).unwrap();
        assert_eq!(
            data,
            [
                0x76, 0x49, 0xab, 0xac, 0x81, 0x19, 0xb2, 0x46, 0xce, 0xe9,
                0x8e, 0x19, 0x7b, 0x9b, 0x72, 0x19
            ]
        );

        let mut ragged = [0u8; 15];
        assert!(matches!(
            AesCbc.encrypt(&ctx, &iv, &mut ragged),
            Err(AlgError::NotBlockAligned { .. })
        ));
    }

    #[test]
    fn tdes_changes_data() {
        let ctx = TdesCbc.set_key(&[0x11u8; 24]).unwrap();
        let mut data = [0u8; 16];
        TdesCbc.encrypt(&ctx, &[0u8; 8], &mut data).unwrap();
        assert_ne!(data, [0u8; 16]);
    }

    #[test]
    fn hmac_truncates() {
        let key = [0x0bu8; 32];
        let ctx = HmacSha256.set_key(&key).unwrap();
        let mut icv = [0u8; 16];
        HmacSha256.digest(&ctx, &[b"Hi ", b"There"], &mut icv).unwrap();

        let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(&key).unwrap();
        mac.update(b"Hi There");
        assert_eq!(&mac.finalize().into_bytes()[..16], &icv);
    }

    #[test]
    fn unsupported_defaults() {
        let ctx = HmacSha256.set_key(&[0u8; 32]).unwrap();
        assert!(matches!(
            HmacSha256.encrypt(&ctx, &[], &mut []),
            Err(AlgError::Unsupported { op: "encrypt", .. })
        ));
        assert!(NullCipher.compress(b"x").is_err());
    }

    #[test]
    fn register_refcounts() {
        let reg = AlgRegistry::new();
        reg.register(Arc::new(AesCbc)).unwrap();
        assert_eq!(
            reg.register(Arc::new(AesCbc)),
            Err(RegistryError::Exists { alg_type: AlgType::Encrypt, id: ESP_AES })
        );

        let mut binding = reg.bind(AlgType::Encrypt, ESP_AES, &[1u8; 16]).unwrap();
        assert_eq!(
            reg.unregister(AlgType::Encrypt, ESP_AES),
            Err(RegistryError::InUse { name: "aes", refs: 1 })
        );

        binding.destroy();
        assert!(binding.key().is_zero());
        assert_eq!(binding.key().bytes().len(), 16);
        drop(binding);

        reg.unregister(AlgType::Encrypt, ESP_AES).unwrap();
        assert!(matches!(
            reg.bind(AlgType::Encrypt, ESP_AES, &[1u8; 16]),
            Err(KlipsError::AlgNotFound { .. })
        ));
    }
}
