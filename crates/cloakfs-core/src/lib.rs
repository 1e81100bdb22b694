//! cloakfs-core: shared error type and reserved on-disk names.

pub mod error;

pub use error::{CfsError, CfsResult};

/// Name of the config file in the root of the encrypted directory.
///
/// The dot is not part of the base64url alphabet, so this can never
/// collide with an encrypted name.
pub const CONF_NAME: &str = "cloakfs.conf";

/// Name of the per-directory IV file.
pub const DIRIV_NAME: &str = "cloakfs.diriv";

/// Prefix of hashed long-name directory entries.
pub const LONGNAME_PREFIX: &str = "cloakfs.longname.";

/// Suffix of the sidecar file that stores the full encoded name of a
/// long-name entry.
pub const LONGNAME_SUFFIX: &str = ".name";

/// Maximum length of a directory entry on the backing filesystem.
pub const NAME_MAX: usize = 255;
