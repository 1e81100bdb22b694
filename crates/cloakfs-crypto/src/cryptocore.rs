//! AES-256-GCM AEAD with a configurable nonce size, plus the random source.
//!
//! The nonce size is frozen when the filesystem is created (`GCMIV128` flag)
//! and never varies afterwards. Nonces are always fresh random bytes: a
//! counter cannot work here because independent writers on independent files
//! all encrypt under the single master key.

use aes::Aes256;
use aes_gcm::aead::consts::U16;
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{AesGcm, Aes256Gcm};
use rand::rngs::OsRng;
use rand::RngCore;

use cloakfs_core::{CfsError, CfsResult};

use crate::KEY_LEN;

/// Nonce length with the stock 96-bit GCM IV.
pub const IV_LEN_96: usize = 12;

/// Nonce length with the `GCMIV128` feature flag.
pub const IV_LEN_128: usize = 16;

type Aes256GcmIv128 = AesGcm<Aes256, U16>;

enum Gcm {
    Iv96(Aes256Gcm),
    Iv128(Aes256GcmIv128),
}

/// An AEAD instance bound to one key and one nonce size.
///
/// Immutable after construction; safe to share across threads.
pub struct CryptoCore {
    gcm: Gcm,
    iv_len: usize,
}

impl CryptoCore {
    pub fn new(key: &[u8; KEY_LEN], gcm_iv128: bool) -> Self {
        if gcm_iv128 {
            CryptoCore {
                gcm: Gcm::Iv128(Aes256GcmIv128::new(key.into())),
                iv_len: IV_LEN_128,
            }
        } else {
            CryptoCore {
                gcm: Gcm::Iv96(Aes256Gcm::new(key.into())),
                iv_len: IV_LEN_96,
            }
        }
    }

    /// Nonce length in bytes, 12 or 16.
    pub fn iv_len(&self) -> usize {
        self.iv_len
    }

    /// Encrypt `plaintext`, returning `ciphertext || tag`.
    ///
    /// `nonce` must be exactly [`iv_len`](Self::iv_len) bytes.
    pub fn seal(&self, nonce: &[u8], aad: &[u8], plaintext: &[u8]) -> CfsResult<Vec<u8>> {
        debug_assert_eq!(nonce.len(), self.iv_len);
        let payload = Payload {
            msg: plaintext,
            aad,
        };
        let res = match &self.gcm {
            Gcm::Iv96(gcm) => gcm.encrypt(GenericArray::from_slice(nonce), payload),
            Gcm::Iv128(gcm) => gcm.encrypt(GenericArray::from_slice(nonce), payload),
        };
        res.map_err(|_| CfsError::Io(std::io::Error::other("AES-GCM seal failed")))
    }

    /// Decrypt `ciphertext || tag`. Any mismatch in key, nonce, associated
    /// data or ciphertext yields [`CfsError::AuthFailure`].
    pub fn open(&self, nonce: &[u8], aad: &[u8], ciphertext: &[u8]) -> CfsResult<Vec<u8>> {
        debug_assert_eq!(nonce.len(), self.iv_len);
        let payload = Payload {
            msg: ciphertext,
            aad,
        };
        let res = match &self.gcm {
            Gcm::Iv96(gcm) => gcm.decrypt(GenericArray::from_slice(nonce), payload),
            Gcm::Iv128(gcm) => gcm.decrypt(GenericArray::from_slice(nonce), payload),
        };
        res.map_err(|_| CfsError::AuthFailure)
    }

    /// Draw a fresh random nonce of the configured length.
    ///
    /// Random draws never repeat within the key's lifetime (2^-96 / 2^-128
    /// birthday bounds are accepted). `OsRng` is stateless and safe under
    /// concurrent calls.
    pub fn fresh_nonce(&self) -> Vec<u8> {
        random_bytes(self.iv_len)
    }
}

/// `n` bytes from the OS random source. Aborts the process if the source
/// fails; there is no safe way to continue without randomness.
pub fn random_bytes(n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    OsRng.fill_bytes(&mut buf);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; KEY_LEN] = [7u8; KEY_LEN];

    #[test]
    fn seal_open_roundtrip_both_nonce_sizes() {
        for gcm_iv128 in [false, true] {
            let cc = CryptoCore::new(&KEY, gcm_iv128);
            let nonce = cc.fresh_nonce();
            let sealed = cc.seal(&nonce, b"aad", b"payload").unwrap();
            assert_eq!(sealed.len(), 7 + crate::TAG_LEN);
            let opened = cc.open(&nonce, b"aad", &sealed).unwrap();
            assert_eq!(opened, b"payload");
        }
    }

    #[test]
    fn iv_len_follows_flag() {
        assert_eq!(CryptoCore::new(&KEY, false).iv_len(), IV_LEN_96);
        assert_eq!(CryptoCore::new(&KEY, true).iv_len(), IV_LEN_128);
    }

    #[test]
    fn open_rejects_wrong_aad() {
        let cc = CryptoCore::new(&KEY, true);
        let nonce = cc.fresh_nonce();
        let sealed = cc.seal(&nonce, b"aad", b"payload").unwrap();
        assert!(matches!(
            cc.open(&nonce, b"other", &sealed),
            Err(CfsError::AuthFailure)
        ));
    }

    #[test]
    fn nonces_do_not_repeat() {
        let cc = CryptoCore::new(&KEY, false);
        let a = cc.fresh_nonce();
        let b = cc.fresh_nonce();
        assert_ne!(a, b);
    }
}
