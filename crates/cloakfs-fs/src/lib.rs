//! cloakfs-fs: the filesystem-facing half of the core.
//!
//! The bridge above this crate speaks in plaintext paths, byte ranges and
//! buffers. This crate turns paths into backing (ciphertext) paths, owns
//! the per-open-file state machine that performs block-aligned
//! read-modify-write through the content encryption layer, and serializes
//! writers per inode so concurrent partial-block writes cannot lose
//! updates.

pub mod diriv;
pub mod file;
pub mod paths;
pub mod write_lock;

pub use file::CryptFile;
pub use paths::PathCrypter;
pub use write_lock::WriteLockTable;
