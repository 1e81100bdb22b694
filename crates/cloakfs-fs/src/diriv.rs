//! Directory IV persistence.
//!
//! Every encrypted directory carries a `cloakfs.diriv` file holding 16
//! random bytes, created with the directory and immutable afterwards. The
//! IV tweaks the name encryption of every entry in that directory.

use std::fs::OpenOptions;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use cloakfs_core::{CfsError, CfsResult, DIRIV_NAME};
use cloakfs_crypto::names::DIR_IV_LEN;
use cloakfs_crypto::random_bytes;

/// Create the IV file inside a freshly created encrypted directory.
pub fn create_in(dir: &Path) -> CfsResult<()> {
    let iv = random_bytes(DIR_IV_LEN);
    let path = dir.join(DIRIV_NAME);
    let mut fd = OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o400)
        .open(&path)?;
    fd.write_all(&iv)?;
    fd.sync_all()?;
    Ok(())
}

/// Read the IV of an encrypted directory.
pub fn read_from(dir: &Path) -> CfsResult<[u8; DIR_IV_LEN]> {
    let path = dir.join(DIRIV_NAME);
    let data = std::fs::read(&path)?;
    data.as_slice().try_into().map_err(|_| {
        CfsError::corrupt(format!(
            "directory IV file {} has length {}, want {DIR_IV_LEN}",
            path.display(),
            data.len()
        ))
    })
}
