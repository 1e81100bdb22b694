//! Plaintext path ⇄ ciphertext path.
//!
//! Walks a relative plaintext path one component at a time, loading the IV
//! of each parent directory along the way. Also the home of the long-name
//! spillover bookkeeping and the reserved-name filter.

use std::path::{Path, PathBuf};

use parking_lot::{RwLock, RwLockWriteGuard};
use tracing::debug;

use cloakfs_core::{CfsResult, CONF_NAME, NAME_MAX};
use cloakfs_crypto::config::FeatureFlag;
use cloakfs_crypto::kdf::MasterKey;
use cloakfs_crypto::names::NameTransform;
use cloakfs_crypto::longnames;

use crate::diriv;

/// Path encryption for one mounted filesystem.
pub struct PathCrypter {
    cipher_root: PathBuf,
    nt: NameTransform,
    plaintext_names: bool,
    use_diriv: bool,
    long_names: bool,
    /// Held shared by every path transform, exclusively around directory
    /// renames and removals, so a lookup never observes a half-updated IV.
    iv_lock: RwLock<()>,
}

impl PathCrypter {
    pub fn new(cipher_root: PathBuf, master_key: &MasterKey, flags: &[FeatureFlag]) -> Self {
        PathCrypter {
            cipher_root,
            nt: NameTransform::new(master_key),
            plaintext_names: flags.contains(&FeatureFlag::PlaintextNames),
            use_diriv: flags.contains(&FeatureFlag::DirIv),
            long_names: flags.contains(&FeatureFlag::LongNames),
            iv_lock: RwLock::new(()),
        }
    }

    /// Is this plaintext path forbidden? Only meaningful with plaintext
    /// names, where a user file could otherwise shadow the config.
    pub fn is_reserved(&self, plain_path: &str) -> bool {
        self.plaintext_names && plain_path == CONF_NAME
    }

    /// Exclusive directory-IV lock, for the caller that renames or removes
    /// an encrypted directory.
    pub fn dir_iv_lock_exclusive(&self) -> RwLockWriteGuard<'_, ()> {
        self.iv_lock.write()
    }

    /// Encrypt a relative plaintext path. The empty path (the root itself)
    /// maps to itself.
    pub fn encrypt_path(&self, plain_path: &str) -> CfsResult<String> {
        if self.plaintext_names || plain_path.is_empty() {
            return Ok(plain_path.to_string());
        }
        let _guard = self.iv_lock.read();

        if !self.use_diriv {
            // Legacy filesystems: componentwise, constant tweak.
            let parts: CfsResult<Vec<String>> = plain_path
                .split('/')
                .map(|c| self.nt.encrypt_name_no_iv(c))
                .collect();
            return Ok(parts?.join("/"));
        }

        let mut cipher_dir = self.cipher_root.clone();
        let mut out = Vec::new();
        for comp in plain_path.split('/') {
            let iv = diriv::read_from(&cipher_dir)?;
            let mut cname = self.nt.encrypt_name(comp, &iv)?;
            if self.long_names && cname.len() > NAME_MAX {
                cname = longnames::hash_long_name(&cname);
            }
            cipher_dir.push(&cname);
            out.push(cname);
        }
        let cipher_path = out.join("/");
        debug!(plain = plain_path, cipher = %cipher_path, "encrypt_path");
        Ok(cipher_path)
    }

    /// Decrypt a relative ciphertext path.
    pub fn decrypt_path(&self, cipher_path: &str) -> CfsResult<String> {
        if self.plaintext_names || cipher_path.is_empty() {
            return Ok(cipher_path.to_string());
        }
        let _guard = self.iv_lock.read();

        if !self.use_diriv {
            let parts: CfsResult<Vec<String>> = cipher_path
                .split('/')
                .map(|c| self.nt.decrypt_name_no_iv(c))
                .collect();
            return Ok(parts?.join("/"));
        }

        let mut cipher_dir = self.cipher_root.clone();
        let mut out = Vec::new();
        for comp in cipher_path.split('/') {
            let iv = diriv::read_from(&cipher_dir)?;
            let full_name = if longnames::is_long_content(comp) {
                self.read_long_name_sidecar(&cipher_dir, comp)?
            } else {
                comp.to_string()
            };
            out.push(self.nt.decrypt_name(&full_name, &iv)?);
            cipher_dir.push(comp);
        }
        Ok(out.join("/"))
    }

    /// Absolute backing path of a relative plaintext path.
    pub fn backing_path(&self, plain_path: &str) -> CfsResult<PathBuf> {
        let cipher_path = self.encrypt_path(plain_path)?;
        Ok(self.cipher_root.join(cipher_path))
    }

    /// Store the sidecar for an over-long encoded name in `cipher_dir`.
    /// Returns the hashed entry name the caller should create. Invoked by
    /// the bridge when it creates a file or directory with a long name.
    pub fn write_long_name_sidecar(
        &self,
        cipher_dir: &Path,
        full_cipher_name: &str,
    ) -> CfsResult<String> {
        let hashed = longnames::hash_long_name(full_cipher_name);
        let sidecar = cipher_dir.join(longnames::sidecar_name(&hashed));
        std::fs::write(&sidecar, full_cipher_name)?;
        Ok(hashed)
    }

    fn read_long_name_sidecar(&self, cipher_dir: &Path, entry: &str) -> CfsResult<String> {
        let sidecar = cipher_dir.join(longnames::sidecar_name(entry));
        let full = std::fs::read_to_string(&sidecar)?;
        longnames::matches_hash(entry, &full)?;
        Ok(full)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cloakfs_crypto::KEY_LEN;

    const NORMAL_FLAGS: [FeatureFlag; 4] = [
        FeatureFlag::GcmIv128,
        FeatureFlag::DirIv,
        FeatureFlag::EmeNames,
        FeatureFlag::LongNames,
    ];

    fn key() -> MasterKey {
        MasterKey::from_bytes([0x77; KEY_LEN])
    }

    fn crypter(root: &Path, flags: &[FeatureFlag]) -> PathCrypter {
        PathCrypter::new(root.to_path_buf(), &key(), flags)
    }

    #[test]
    fn single_component_roundtrip() {
        let root = tempfile::tempdir().unwrap();
        diriv::create_in(root.path()).unwrap();
        let pc = crypter(root.path(), &NORMAL_FLAGS);

        let cipher = pc.encrypt_path("file.txt").unwrap();
        assert_ne!(cipher, "file.txt");
        assert!(!cipher.contains('.'));
        assert_eq!(pc.decrypt_path(&cipher).unwrap(), "file.txt");
        assert_eq!(pc.backing_path("file.txt").unwrap(), root.path().join(&cipher));
    }

    #[test]
    fn nested_path_uses_per_directory_ivs() {
        let root = tempfile::tempdir().unwrap();
        diriv::create_in(root.path()).unwrap();
        let pc = crypter(root.path(), &NORMAL_FLAGS);

        // Create the encrypted directory with its own IV, the way mkdir
        // would.
        let cipher_dir = pc.encrypt_path("subdir").unwrap();
        std::fs::create_dir(root.path().join(&cipher_dir)).unwrap();
        diriv::create_in(&root.path().join(&cipher_dir)).unwrap();

        let cipher = pc.encrypt_path("subdir/file.txt").unwrap();
        assert_eq!(pc.decrypt_path(&cipher).unwrap(), "subdir/file.txt");

        // The same plaintext name encrypts differently in the two
        // directories: the IV is bound in.
        let in_root = pc.encrypt_path("file.txt").unwrap();
        let in_sub = cipher.split('/').nth(1).unwrap();
        assert_ne!(in_root, in_sub);
    }

    #[test]
    fn moved_cipher_name_does_not_decrypt() {
        let root = tempfile::tempdir().unwrap();
        diriv::create_in(root.path()).unwrap();
        let pc = crypter(root.path(), &NORMAL_FLAGS);

        let cipher_dir = pc.encrypt_path("subdir").unwrap();
        std::fs::create_dir(root.path().join(&cipher_dir)).unwrap();
        diriv::create_in(&root.path().join(&cipher_dir)).unwrap();

        // Transplant a root entry into the subdirectory without
        // re-encrypting it.
        let in_root = pc.encrypt_path("file.txt").unwrap();
        let moved = format!("{cipher_dir}/{in_root}");
        match pc.decrypt_path(&moved) {
            Ok(plain) => assert_ne!(plain, "subdir/file.txt"),
            Err(_) => {}
        }
    }

    #[test]
    fn long_name_spillover() {
        let root = tempfile::tempdir().unwrap();
        diriv::create_in(root.path()).unwrap();
        let pc = crypter(root.path(), &NORMAL_FLAGS);

        let long_plain = "x".repeat(220);
        let cipher = pc.encrypt_path(&long_plain).unwrap();
        assert!(cipher.len() <= NAME_MAX);
        assert!(longnames::is_long_content(&cipher));

        // The bridge writes the sidecar at create time; reproduce that.
        let iv = diriv::read_from(root.path()).unwrap();
        let full = pc.nt.encrypt_name(&long_plain, &iv).unwrap();
        let hashed = pc.write_long_name_sidecar(root.path(), &full).unwrap();
        assert_eq!(hashed, cipher);

        assert_eq!(pc.decrypt_path(&cipher).unwrap(), long_plain);
    }

    #[test]
    fn plaintext_names_pass_through_but_config_is_reserved() {
        let root = tempfile::tempdir().unwrap();
        let pc = crypter(
            root.path(),
            &[FeatureFlag::GcmIv128, FeatureFlag::PlaintextNames],
        );

        assert_eq!(pc.encrypt_path("a/b.txt").unwrap(), "a/b.txt");
        assert_eq!(pc.decrypt_path("a/b.txt").unwrap(), "a/b.txt");
        assert!(pc.is_reserved(CONF_NAME));
        assert!(!pc.is_reserved("a/cloakfs.conf"));
    }

    #[test]
    fn legacy_no_iv_mode() {
        let root = tempfile::tempdir().unwrap();
        // No DirIV flag, no diriv files anywhere.
        let pc = crypter(
            root.path(),
            &[FeatureFlag::GcmIv128, FeatureFlag::EmeNames],
        );

        let cipher = pc.encrypt_path("a/b/c.txt").unwrap();
        assert_eq!(pc.decrypt_path(&cipher).unwrap(), "a/b/c.txt");

        // Without a per-directory IV the same name encrypts identically
        // everywhere, which is exactly the weakness DirIV fixes.
        let parts: Vec<&str> = cipher.split('/').collect();
        let again = pc.encrypt_path("c.txt").unwrap();
        assert_eq!(parts[2], again);
    }
}
