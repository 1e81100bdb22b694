//! The config file: wrapped master key, scrypt parameters, feature flags.
//!
//! One JSON document per filesystem, created by `init` and read at mount.
//! The master key is wrapped with the content-encryption layer itself,
//! keyed by the scrypt-derived password key, as block 0 with no file ID.
//! Rewrites (password change) go through write-temp-then-rename so a crash
//! never leaves a half-written config.

use std::fs::OpenOptions;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use tracing::warn;

use cloakfs_core::{CfsError, CfsResult};

use crate::content::{ContentEnc, DEFAULT_PLAIN_BS};
use crate::cryptocore::CryptoCore;
use crate::kdf::{MasterKey, ScryptKdf};
use crate::KEY_LEN;

/// Current on-disk format version. Version 1 filesystems predate the
/// authenticated name layer and are rejected.
pub const CURRENT_VERSION: u16 = 2;

/// The closed vocabulary of feature flags. An unknown flag in a config is a
/// hard load error: it gates an on-disk format branch this implementation
/// does not understand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeatureFlag {
    DirIv,
    PlaintextNames,
    EmeNames,
    GcmIv128,
    LongNames,
}

impl FeatureFlag {
    pub const ALL: [FeatureFlag; 5] = [
        FeatureFlag::DirIv,
        FeatureFlag::PlaintextNames,
        FeatureFlag::EmeNames,
        FeatureFlag::GcmIv128,
        FeatureFlag::LongNames,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            FeatureFlag::DirIv => "DirIV",
            FeatureFlag::PlaintextNames => "PlaintextNames",
            FeatureFlag::EmeNames => "EMENames",
            FeatureFlag::GcmIv128 => "GCMIV128",
            FeatureFlag::LongNames => "LongNames",
        }
    }

    pub fn from_name(name: &str) -> Option<FeatureFlag> {
        FeatureFlag::ALL.into_iter().find(|f| f.as_str() == name)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ConfFile {
    /// Human-readable creator string. Documentation for people who look at
    /// the file; the technical truth is in `FeatureFlags`.
    #[serde(rename = "Creator")]
    pub creator: String,

    /// Master key, wrapped with the password-derived key.
    #[serde(rename = "EncryptedKey", with = "crate::kdf::base64_bytes")]
    encrypted_key: Vec<u8>,

    /// Parameters for the password hash.
    #[serde(rename = "ScryptObject")]
    pub scrypt: ScryptKdf,

    /// On-disk format version.
    #[serde(rename = "Version")]
    pub version: u16,

    /// Enabled feature flags.
    #[serde(rename = "FeatureFlags")]
    feature_flags: Vec<String>,

    /// Where the config lives. Not part of the JSON.
    #[serde(skip)]
    path: PathBuf,
}

/// Create a new config at `path`: fresh master key, wrapped under
/// `password` at scrypt cost `2^log_n`. Returns the master key so the
/// caller can finish filesystem initialization (root directory IV).
pub fn create(
    path: &Path,
    password: &SecretString,
    plaintext_names: bool,
    log_n: u8,
    creator: &str,
) -> CfsResult<MasterKey> {
    let mut flags = vec![FeatureFlag::GcmIv128];
    if plaintext_names {
        flags.push(FeatureFlag::PlaintextNames);
    } else {
        flags.push(FeatureFlag::DirIv);
        flags.push(FeatureFlag::EmeNames);
        flags.push(FeatureFlag::LongNames);
    }

    let master_key = MasterKey::random();
    let mut cf = ConfFile {
        creator: creator.to_string(),
        encrypted_key: Vec::new(),
        scrypt: ScryptKdf::new(log_n)?,
        version: CURRENT_VERSION,
        feature_flags: flags.into_iter().map(|f| f.as_str().to_string()).collect(),
        path: path.to_path_buf(),
    };
    cf.encrypt_key(&master_key, password, log_n)?;
    cf.write_file()?;
    Ok(master_key)
}

/// Read and validate the config at `path` without touching the key. Used by
/// `load` and by anything that only needs the public fields.
pub fn load_public(path: &Path) -> CfsResult<ConfFile> {
    let js = std::fs::read(path)?;
    let mut cf: ConfFile = serde_json::from_slice(&js).map_err(|e| {
        warn!("failed to parse config file: {e}");
        CfsError::corrupt(format!("malformed config file: {e}"))
    })?;
    cf.path = path.to_path_buf();

    if cf.version != CURRENT_VERSION {
        return Err(CfsError::corrupt(format!(
            "unsupported on-disk format {}",
            cf.version
        )));
    }

    for name in &cf.feature_flags {
        if FeatureFlag::from_name(name).is_none() {
            return Err(CfsError::corrupt(format!(
                "unsupported feature flag {name:?}"
            )));
        }
    }
    if cf.is_flag_set(FeatureFlag::PlaintextNames)
        && (cf.is_flag_set(FeatureFlag::DirIv) || cf.is_flag_set(FeatureFlag::EmeNames))
    {
        return Err(CfsError::corrupt(
            "PlaintextNames is mutually exclusive with DirIV and EMENames".to_string(),
        ));
    }

    // Flags that current filesystems always carry. Old filesystems may lack
    // them; warn and keep going, never silently rewrite the config.
    let required: &[FeatureFlag] = if cf.is_flag_set(FeatureFlag::PlaintextNames) {
        &[FeatureFlag::GcmIv128]
    } else {
        &[
            FeatureFlag::GcmIv128,
            FeatureFlag::DirIv,
            FeatureFlag::EmeNames,
            FeatureFlag::LongNames,
        ]
    };
    for flag in required {
        if !cf.is_flag_set(*flag) {
            warn!(
                "deprecated filesystem: feature flag {:?} is missing",
                flag.as_str()
            );
        }
    }

    Ok(cf)
}

/// Load the config at `path` and unwrap the master key with `password`.
///
/// An unwrap failure is reported as [`CfsError::PasswordIncorrect`]; a wrong
/// password and a corrupted key blob are deliberately indistinguishable.
pub fn load(path: &Path, password: &SecretString) -> CfsResult<(MasterKey, ConfFile)> {
    let cf = load_public(path)?;

    let derived = cf.scrypt.derive(password)?;
    let enc = key_wrap_cipher(&derived);
    let key = enc
        .decrypt_block(&cf.encrypted_key, 0, &[])
        .map_err(|_| CfsError::PasswordIncorrect)?;

    let key: [u8; KEY_LEN] = key
        .try_into()
        .map_err(|_| CfsError::corrupt("unwrapped master key has wrong length"))?;
    Ok((MasterKey::from_bytes(key), cf))
}

/// Re-wrap the master key under a new password and atomically replace the
/// config file.
pub fn change_password(
    path: &Path,
    old_password: &SecretString,
    new_password: &SecretString,
    log_n: u8,
) -> CfsResult<()> {
    let (master_key, mut cf) = load(path, old_password)?;
    cf.encrypt_key(&master_key, new_password, log_n)?;
    cf.write_file()
}

/// The master key is wrapped with the content-encryption layer under a
/// 96-bit-nonce core, as plaintext block 0 with no file ID. Frozen: `load`
/// must reproduce this exactly, for every filesystem ever created.
fn key_wrap_cipher(derived_key: &[u8; KEY_LEN]) -> ContentEnc {
    ContentEnc::new(CryptoCore::new(derived_key, false), DEFAULT_PLAIN_BS)
}

impl ConfFile {
    pub fn is_flag_set(&self, flag: FeatureFlag) -> bool {
        self.feature_flags.iter().any(|f| f == flag.as_str())
    }

    /// The validated flag set.
    pub fn flags(&self) -> Vec<FeatureFlag> {
        self.feature_flags
            .iter()
            .filter_map(|f| FeatureFlag::from_name(f))
            .collect()
    }

    pub fn flag_names(&self) -> &[String] {
        &self.feature_flags
    }

    /// Wrap `key` under `password` and store the result plus the scrypt
    /// parameters used.
    fn encrypt_key(&mut self, key: &MasterKey, password: &SecretString, log_n: u8) -> CfsResult<()> {
        let scrypt = ScryptKdf::new(log_n)?;
        let derived = scrypt.derive(password)?;
        let enc = key_wrap_cipher(&derived);
        self.encrypted_key = enc.encrypt_block(key.as_bytes(), 0, &[])?;
        self.scrypt = scrypt;
        Ok(())
    }

    /// Serialize to `path + ".tmp"`, fsync, then rename over `path`.
    /// Readers either see the old config or the new one, never a mix; a
    /// stale `.tmp` from a crash is simply never read.
    fn write_file(&self) -> CfsResult<()> {
        let mut tmp_name = self.path.as_os_str().to_owned();
        tmp_name.push(".tmp");
        let tmp = PathBuf::from(tmp_name);

        // 0400: the config holds the wrapped key and should never be
        // casually written to.
        let mut fd = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o400)
            .open(&tmp)?;

        let mut buf = Vec::new();
        let fmt = serde_json::ser::PrettyFormatter::with_indent(b"\t");
        let mut ser = serde_json::Serializer::with_formatter(&mut buf, fmt);
        self.serialize(&mut ser)
            .map_err(|e| CfsError::corrupt(format!("config serialization failed: {e}")))?;
        buf.push(b'\n');

        fd.write_all(&buf)?;
        fd.sync_all()?;
        drop(fd);

        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::time::Instant;

    const TEST_LOG_N: u8 = 10;

    fn pw(s: &str) -> SecretString {
        SecretString::from(s)
    }

    #[test]
    fn create_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.conf");

        let created = create(&path, &pw("foo"), false, TEST_LOG_N, "v1.0").unwrap();
        let (loaded, cf) = load(&path, &pw("foo")).unwrap();

        assert_eq!(created.as_bytes(), loaded.as_bytes());
        assert_eq!(cf.creator, "v1.0");
        assert_eq!(cf.version, CURRENT_VERSION);
        assert_eq!(
            cf.flags(),
            vec![
                FeatureFlag::GcmIv128,
                FeatureFlag::DirIv,
                FeatureFlag::EmeNames,
                FeatureFlag::LongNames,
            ]
        );

        // Key unwrap is deterministic.
        let (again, _) = load(&path, &pw("foo")).unwrap();
        assert_eq!(loaded.as_bytes(), again.as_bytes());
    }

    #[test]
    fn wrong_password() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.conf");
        create(&path, &pw("foo"), false, TEST_LOG_N, "v1.0").unwrap();

        assert!(matches!(
            load(&path, &pw("bar")),
            Err(CfsError::PasswordIncorrect)
        ));
    }

    #[test]
    fn v1_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("v1.conf");
        std::fs::write(
            &path,
            r#"{
	"Creator": "oldtool v0.6",
	"EncryptedKey": "AAAA",
	"ScryptObject": {"Salt": "AAAA", "N": 65536, "R": 8, "P": 1, "KeyLen": 32},
	"Version": 1,
	"FeatureFlags": []
}"#,
        )
        .unwrap();

        match load(&path, &pw("test")) {
            Err(CfsError::Corrupt(msg)) => assert!(msg.contains("on-disk format")),
            other => panic!("expected Corrupt, got {other:?}"),
        }
    }

    #[test]
    fn unknown_flag_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("strange.conf");
        std::fs::write(
            &path,
            r#"{
	"Creator": "futuretool",
	"EncryptedKey": "AAAA",
	"ScryptObject": {"Salt": "AAAA", "N": 65536, "R": 8, "P": 1, "KeyLen": 32},
	"Version": 2,
	"FeatureFlags": ["GCMIV128", "StrangeFeature"]
}"#,
        )
        .unwrap();

        match load(&path, &pw("test")) {
            Err(CfsError::Corrupt(msg)) => assert!(msg.contains("StrangeFeature")),
            other => panic!("expected Corrupt, got {other:?}"),
        }
    }

    #[test]
    fn plaintext_names_fixture_loads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plain.conf");
        create(&path, &pw("test"), true, TEST_LOG_N, "v1.0").unwrap();

        let (_, cf) = load(&path, &pw("test")).unwrap();
        assert_eq!(
            cf.flags(),
            vec![FeatureFlag::GcmIv128, FeatureFlag::PlaintextNames]
        );
    }

    #[test]
    fn conflicting_flags_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conflict.conf");
        std::fs::write(
            &path,
            r#"{
	"Creator": "handmade",
	"EncryptedKey": "AAAA",
	"ScryptObject": {"Salt": "AAAA", "N": 65536, "R": 8, "P": 1, "KeyLen": 32},
	"Version": 2,
	"FeatureFlags": ["GCMIV128", "PlaintextNames", "DirIV"]
}"#,
        )
        .unwrap();
        assert!(matches!(load(&path, &pw("x")), Err(CfsError::Corrupt(_))));
    }

    // Brute-force protection: loading at the default cost must burn at
    // least 100 ms in scrypt.
    #[test]
    fn default_cost_takes_at_least_100ms() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("slow.conf");
        create(&path, &pw("foo"), false, crate::kdf::DEFAULT_LOG_N, "v1.0").unwrap();

        let t0 = Instant::now();
        load(&path, &pw("foo")).unwrap();
        assert!(
            t0.elapsed().as_millis() >= 100,
            "scrypt at the default cost ran in {:?}",
            t0.elapsed()
        );
    }

    #[test]
    fn on_disk_shape() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.conf");
        create(&path, &pw("foo"), false, TEST_LOG_N, "v1.0").unwrap();

        // Atomic write: no temp file left behind, file is read-only.
        assert!(!dir.path().join("t.conf.tmp").exists());
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o400);

        // Tab-indented JSON with the exact field names.
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("\t\"Creator\""));
        assert!(text.contains("\t\"EncryptedKey\""));
        assert!(text.contains("\t\"ScryptObject\""));
        assert!(text.contains("\"KeyLen\": 32"));
    }

    #[test]
    fn password_change() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.conf");
        let created = create(&path, &pw("old"), false, TEST_LOG_N, "v1.0").unwrap();

        change_password(&path, &pw("old"), &pw("new"), TEST_LOG_N).unwrap();

        let (loaded, _) = load(&path, &pw("new")).unwrap();
        assert_eq!(created.as_bytes(), loaded.as_bytes());
        assert!(matches!(
            load(&path, &pw("old")),
            Err(CfsError::PasswordIncorrect)
        ));
    }
}
