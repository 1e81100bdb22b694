//! cloakfs-crypto: cryptographic engine and on-disk format
//!
//! Everything that persists on the backing store is authenticated
//! ciphertext produced by this crate:
//!
//! ```text
//! Master Key (256-bit random, created once per filesystem)
//!   ├── Content: AES-256-GCM per 4096-byte block
//!   │     block = nonce || ciphertext || tag, AAD = block_no (8 BE) || file_id (16)
//!   ├── Names: EME-AES-256, tweak = per-directory IV, base64url-no-pad
//!   └── Wrapped on disk under an scrypt-derived password key
//!         (content encryption of the key itself as block 0, no file ID)
//! ```

pub mod config;
pub mod content;
pub mod cryptocore;
pub mod kdf;
pub mod longnames;
pub mod names;

pub use config::ConfFile;
pub use content::{ContentEnc, FileHeader};
pub use cryptocore::{random_bytes, CryptoCore};
pub use kdf::{MasterKey, ScryptKdf};
pub use names::NameTransform;

/// Size of the master key and every derived key, in bytes (AES-256).
pub const KEY_LEN: usize = 32;

/// Size of a GCM authentication tag.
pub const TAG_LEN: usize = 16;
