//! Long-name spillover.
//!
//! Base64url inflates encrypted names by 4/3, so a plaintext name that is
//! legal on the backing filesystem can encode to more than NAME_MAX bytes.
//! With the `LongNames` flag, such an entry is stored under
//! `cloakfs.longname.<base64url(sha256(encoded))>` and the full encoded name
//! lives in a `.name` sidecar next to it.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use sha2::{Digest, Sha256};

use cloakfs_core::{CfsError, CfsResult, LONGNAME_PREFIX, LONGNAME_SUFFIX, NAME_MAX};

/// Does this encoded name need the spillover path?
pub fn is_long_name(cipher_name: &str) -> bool {
    cipher_name.len() > NAME_MAX
}

/// Deterministic short directory entry for an over-long encoded name.
pub fn hash_long_name(cipher_name: &str) -> String {
    let digest = Sha256::digest(cipher_name.as_bytes());
    format!("{LONGNAME_PREFIX}{}", URL_SAFE_NO_PAD.encode(digest))
}

/// Name of the sidecar file storing the full encoded name.
pub fn sidecar_name(hashed_name: &str) -> String {
    format!("{hashed_name}{LONGNAME_SUFFIX}")
}

/// Is this directory entry a hashed long-name entry (not a sidecar)?
pub fn is_long_content(entry: &str) -> bool {
    entry.starts_with(LONGNAME_PREFIX) && !entry.ends_with(LONGNAME_SUFFIX)
}

/// Verify that `entry` is the hash of `cipher_name`. Used when resolving a
/// sidecar back to its directory entry.
pub fn matches_hash(entry: &str, cipher_name: &str) -> CfsResult<()> {
    if hash_long_name(cipher_name) == entry {
        Ok(())
    } else {
        Err(CfsError::corrupt(format!(
            "long-name sidecar does not match entry {entry:?}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn threshold_is_name_max() {
        assert!(!is_long_name(&"a".repeat(NAME_MAX)));
        assert!(is_long_name(&"a".repeat(NAME_MAX + 1)));
    }

    #[test]
    fn hashed_name_is_short_and_stable() {
        let long = "b".repeat(500);
        let hashed = hash_long_name(&long);
        assert!(hashed.len() <= NAME_MAX);
        assert!(hashed.starts_with(LONGNAME_PREFIX));
        assert_eq!(hashed, hash_long_name(&long));
        assert!(is_long_content(&hashed));
        assert!(!is_long_content(&sidecar_name(&hashed)));
    }

    #[test]
    fn hash_verification() {
        let long = "c".repeat(300);
        let hashed = hash_long_name(&long);
        assert!(matches_hash(&hashed, &long).is_ok());
        assert!(matches_hash(&hashed, "something else").is_err());
    }
}
