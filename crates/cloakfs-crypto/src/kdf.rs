//! Master key and scrypt password hashing.

use rand::rngs::OsRng;
use rand::RngCore;
use scrypt::{scrypt, Params};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use cloakfs_core::{CfsError, CfsResult};

use crate::KEY_LEN;

/// Default scrypt cost exponent. A derivation at this cost takes well over
/// 100 ms on contemporary hardware, which is the point: it rate-limits
/// password guessing against a stolen config file.
pub const DEFAULT_LOG_N: u8 = 16;

/// Smallest cost exponent accepted when creating a filesystem.
pub const MIN_LOG_N: u8 = 10;

const SALT_LEN: usize = 32;

/// The 256-bit root secret. Zeroized on drop.
pub struct MasterKey {
    bytes: [u8; KEY_LEN],
}

impl MasterKey {
    /// Generate a fresh random master key. Called once, at filesystem
    /// creation.
    pub fn random() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut bytes);
        MasterKey { bytes }
    }

    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        MasterKey { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.bytes
    }
}

impl Drop for MasterKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Scrypt parameters as stored in the config file.
///
/// Fixed at creation; `derive` must reproduce the exact same key for the
/// lifetime of the filesystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScryptKdf {
    #[serde(rename = "Salt", with = "base64_bytes")]
    pub salt: Vec<u8>,
    #[serde(rename = "N")]
    pub n: u64,
    #[serde(rename = "R")]
    pub r: u32,
    #[serde(rename = "P")]
    pub p: u32,
    #[serde(rename = "KeyLen")]
    pub key_len: u32,
}

impl ScryptKdf {
    /// Fresh parameters with a random salt and cost `2^log_n`.
    pub fn new(log_n: u8) -> CfsResult<Self> {
        if log_n < MIN_LOG_N {
            return Err(CfsError::corrupt(format!(
                "scrypt cost 2^{log_n} is too low (minimum 2^{MIN_LOG_N})"
            )));
        }
        let mut salt = vec![0u8; SALT_LEN];
        OsRng.fill_bytes(&mut salt);
        Ok(ScryptKdf {
            salt,
            n: 1u64 << log_n,
            r: 8,
            p: 1,
            key_len: KEY_LEN as u32,
        })
    }

    /// Hash `password` into a 256-bit key. The secret is exposed only for
    /// the duration of the scrypt call.
    pub fn derive(&self, password: &SecretString) -> CfsResult<[u8; KEY_LEN]> {
        if self.key_len as usize != KEY_LEN {
            return Err(CfsError::corrupt(format!(
                "scrypt KeyLen {} is unsupported",
                self.key_len
            )));
        }
        if !self.n.is_power_of_two() || self.n < (1 << MIN_LOG_N) {
            return Err(CfsError::corrupt(format!("invalid scrypt N {}", self.n)));
        }
        let log_n = self.n.trailing_zeros() as u8;
        let params = Params::new(log_n, self.r, self.p, KEY_LEN)
            .map_err(|e| CfsError::corrupt(format!("invalid scrypt parameters: {e}")))?;

        let mut key = [0u8; KEY_LEN];
        scrypt(
            password.expose_secret().as_bytes(),
            &self.salt,
            &params,
            &mut key,
        )
        .map_err(|e| CfsError::corrupt(format!("scrypt failed: {e}")))?;
        Ok(key)
    }
}

/// Serde adapter: byte slices as base64 strings, the way the on-disk JSON
/// stores them.
pub(crate) mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(de)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // log_n = 10 keeps the unit tests fast; the >= 100 ms property at the
    // default cost is asserted in the config tests.
    fn test_kdf() -> ScryptKdf {
        ScryptKdf {
            salt: vec![1u8; SALT_LEN],
            n: 1 << 10,
            r: 8,
            p: 1,
            key_len: KEY_LEN as u32,
        }
    }

    #[test]
    fn derive_is_deterministic() {
        let kdf = test_kdf();
        let foo = SecretString::from("foo");
        let bar = SecretString::from("bar");
        assert_eq!(kdf.derive(&foo).unwrap(), kdf.derive(&foo).unwrap());
        assert_ne!(kdf.derive(&foo).unwrap(), kdf.derive(&bar).unwrap());
    }

    #[test]
    fn fresh_salts_differ() {
        let a = ScryptKdf::new(MIN_LOG_N).unwrap();
        let b = ScryptKdf::new(MIN_LOG_N).unwrap();
        assert_ne!(a.salt, b.salt);
    }

    #[test]
    fn low_cost_is_rejected() {
        assert!(ScryptKdf::new(9).is_err());
    }

    #[test]
    fn bogus_on_disk_params_are_rejected() {
        let password = SecretString::from("x");
        let mut kdf = test_kdf();
        kdf.n = 1000; // not a power of two
        assert!(kdf.derive(&password).is_err());

        let mut kdf = test_kdf();
        kdf.key_len = 16;
        assert!(kdf.derive(&password).is_err());
    }

    #[test]
    fn master_key_debug_is_redacted() {
        let key = MasterKey::from_bytes([3u8; KEY_LEN]);
        assert!(!format!("{key:?}").contains('3'));
    }
}
