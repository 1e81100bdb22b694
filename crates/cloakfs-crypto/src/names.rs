//! Filename encryption.
//!
//! Each path component is encrypted with EME (a wide-block AES mode, so a
//! one-character change diffuses over the whole name), keyed with the master
//! key and tweaked with the 16-byte IV of the directory containing the entry.
//! The result is base64url-encoded without padding; that alphabet contains
//! neither `.` nor `/`, so encrypted names can never collide with `.`, `..`
//! or the reserved `cloakfs.*` files.
//!
//! Moving a ciphertext name into a different directory changes the tweak and
//! therefore fails decryption there; this is what makes cross-directory
//! tampering detectable.

use aes::cipher::KeyIvInit;
use aes::Aes256;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use eme_mode::cipher::block_padding::Pkcs7;
use eme_mode::DynamicEme;

use cloakfs_core::{CfsError, CfsResult};

use crate::kdf::MasterKey;
use crate::KEY_LEN;

/// Length of a directory IV, and of the EME tweak.
pub const DIR_IV_LEN: usize = 16;

/// EME processes at most 128 AES blocks in one call.
const EME_MAX_INPUT: usize = 128 * 16;

type EmeAes = DynamicEme<Aes256>;

/// Encrypts and decrypts single path components under the master key.
pub struct NameTransform {
    key: [u8; KEY_LEN],
}

impl NameTransform {
    pub fn new(master_key: &MasterKey) -> Self {
        NameTransform {
            key: *master_key.as_bytes(),
        }
    }

    /// Encrypt one path component under the IV of its directory.
    pub fn encrypt_name(&self, plain_name: &str, dir_iv: &[u8; DIR_IV_LEN]) -> CfsResult<String> {
        if plain_name.is_empty() {
            return Err(CfsError::corrupt("refusing to encrypt empty name"));
        }
        if plain_name.len() + 1 > EME_MAX_INPUT {
            return Err(CfsError::corrupt(format!(
                "name of {} bytes is too long for EME",
                plain_name.len()
            )));
        }
        let mut eme = EmeAes::new((&self.key).into(), dir_iv.into());
        let ciphertext = eme.encrypt_padded_vec_mut::<Pkcs7>(plain_name.as_bytes());
        Ok(URL_SAFE_NO_PAD.encode(ciphertext))
    }

    /// Decrypt one path component under the IV of its directory.
    ///
    /// EME is not authenticated; a wrong IV (a name moved between
    /// directories) surfaces as bad padding or an invalid decrypted name,
    /// both reported as corruption.
    pub fn decrypt_name(&self, cipher_name: &str, dir_iv: &[u8; DIR_IV_LEN]) -> CfsResult<String> {
        let bin = URL_SAFE_NO_PAD
            .decode(cipher_name)
            .map_err(|e| CfsError::corrupt(format!("name is not valid base64url: {e}")))?;
        if bin.is_empty() || bin.len() % 16 != 0 {
            return Err(CfsError::corrupt(format!(
                "encrypted name length {} is not a positive multiple of 16",
                bin.len()
            )));
        }
        if bin.len() > EME_MAX_INPUT {
            return Err(CfsError::corrupt(format!(
                "encrypted name of {} bytes is too long for EME",
                bin.len()
            )));
        }
        let eme = EmeAes::new((&self.key).into(), dir_iv.into());
        let plain = eme
            .decrypt_padded_vec_mut::<Pkcs7>(&bin)
            .map_err(|_| CfsError::corrupt("invalid padding in decrypted name"))?;
        let name = String::from_utf8(plain)
            .map_err(|_| CfsError::corrupt("decrypted name is not UTF-8"))?;
        validate_plain_name(&name)?;
        Ok(name)
    }

    /// Legacy component encryption for filesystems without `DirIV`: the
    /// tweak is a constant zero block.
    pub fn encrypt_name_no_iv(&self, plain_name: &str) -> CfsResult<String> {
        self.encrypt_name(plain_name, &[0u8; DIR_IV_LEN])
    }

    pub fn decrypt_name_no_iv(&self, cipher_name: &str) -> CfsResult<String> {
        self.decrypt_name(cipher_name, &[0u8; DIR_IV_LEN])
    }
}

fn validate_plain_name(name: &str) -> CfsResult<()> {
    if name.is_empty() || name == "." || name == ".." {
        return Err(CfsError::corrupt(format!(
            "decrypted name {name:?} is invalid"
        )));
    }
    if name.bytes().any(|b| b == b'/' || b == 0) {
        return Err(CfsError::corrupt(
            "decrypted name contains '/' or NUL".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nt() -> NameTransform {
        NameTransform::new(&MasterKey::from_bytes([0x55; KEY_LEN]))
    }

    const IV: [u8; DIR_IV_LEN] = [0xA0; DIR_IV_LEN];

    #[test]
    fn roundtrip() {
        let nt = nt();
        for name in ["a", "hello.txt", "ünïcödé-2026.pdf", &"x".repeat(200)] {
            let enc = nt.encrypt_name(name, &IV).unwrap();
            assert_eq!(nt.decrypt_name(&enc, &IV).unwrap(), name);
        }
    }

    #[test]
    fn encoding_is_filesystem_safe() {
        let nt = nt();
        let enc = nt.encrypt_name("some file name", &IV).unwrap();
        assert!(!enc.contains('.') && !enc.contains('/') && !enc.contains('='));
    }

    #[test]
    fn deterministic_within_a_directory() {
        let nt = nt();
        assert_eq!(
            nt.encrypt_name("a.txt", &IV).unwrap(),
            nt.encrypt_name("a.txt", &IV).unwrap()
        );
    }

    #[test]
    fn iv_changes_every_name() {
        let nt = nt();
        let other_iv = [0xB0; DIR_IV_LEN];
        let enc = nt.encrypt_name("a.txt", &IV).unwrap();
        assert_ne!(enc, nt.encrypt_name("a.txt", &other_iv).unwrap());

        // A name moved to a directory with a different IV must not decrypt
        // back to the original.
        match nt.decrypt_name(&enc, &other_iv) {
            Ok(name) => assert_ne!(name, "a.txt"),
            Err(_) => {}
        }
    }

    #[test]
    fn wide_block_diffusion() {
        let nt = nt();
        let a = nt.encrypt_name("file_a", &IV).unwrap();
        let b = nt.encrypt_name("file_b", &IV).unwrap();
        // Single-character difference must not produce a shared prefix the
        // way a narrow-block (CTR/CBC) mode would.
        assert_ne!(a[..4], b[..4]);
    }

    #[test]
    fn garbage_is_rejected() {
        let nt = nt();
        assert!(nt.decrypt_name("not valid base64 &&&", &IV).is_err());
        // Valid base64, wrong length.
        assert!(nt.decrypt_name("AAAA", &IV).is_err());
        assert!(nt.decrypt_name("", &IV).is_err());
    }

    #[test]
    fn no_iv_mode_roundtrip() {
        let nt = nt();
        let enc = nt.encrypt_name_no_iv("legacy.txt").unwrap();
        assert_eq!(nt.decrypt_name_no_iv(&enc).unwrap(), "legacy.txt");
        // Same as encrypting under the zero IV.
        assert_eq!(enc, nt.encrypt_name("legacy.txt", &[0; DIR_IV_LEN]).unwrap());
    }
}
