//! Block-oriented content encryption.
//!
//! Encrypted data file layout:
//!
//! ```text
//! header (18 bytes) || block_0 || block_1 || ...
//! block_n = nonce || AES-256-GCM(plaintext_block_n) || tag
//! AAD     = block_no (8 bytes, big-endian) || file_id (16 bytes)
//! ```
//!
//! The AAD pins every block to its position and its file, so blocks cannot
//! be reordered within a file or transplanted between files. The last block
//! may be shorter than a full block. An empty file has zero bytes, not even
//! a header.

use tracing::warn;

use cloakfs_core::{CfsError, CfsResult};

use crate::cryptocore::CryptoCore;
use crate::TAG_LEN;

/// Plaintext block size. Fixed for the life of the filesystem.
pub const DEFAULT_PLAIN_BS: u64 = 4096;

/// On-disk format version carried in every file header.
pub const HEADER_VERSION: u16 = 2;

/// Length of the file header: 2-byte version plus 16-byte file ID.
pub const HEADER_LEN: usize = 18;

/// Length of the random per-file ID.
pub const FILE_ID_LEN: usize = 16;

/// Per-file header: a version tag and a random ID that is bound into the
/// associated data of every block in the file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHeader {
    pub id: [u8; FILE_ID_LEN],
}

impl FileHeader {
    /// Fresh header with a random file ID. Created when the first byte is
    /// written to an empty file.
    pub fn random() -> Self {
        let mut id = [0u8; FILE_ID_LEN];
        id.copy_from_slice(&crate::cryptocore::random_bytes(FILE_ID_LEN));
        FileHeader { id }
    }

    pub fn pack(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[..2].copy_from_slice(&HEADER_VERSION.to_be_bytes());
        buf[2..].copy_from_slice(&self.id);
        buf
    }

    pub fn parse(buf: &[u8]) -> CfsResult<Self> {
        if buf.len() != HEADER_LEN {
            return Err(CfsError::corrupt(format!(
                "file header has length {}, want {HEADER_LEN}",
                buf.len()
            )));
        }
        let version = u16::from_be_bytes([buf[0], buf[1]]);
        if version != HEADER_VERSION {
            return Err(CfsError::corrupt(format!(
                "unsupported file header version {version}"
            )));
        }
        let mut id = [0u8; FILE_ID_LEN];
        id.copy_from_slice(&buf[2..]);
        Ok(FileHeader { id })
    }
}

/// One plaintext block touched by a byte range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntraBlock {
    /// Zero-based block number, counted from the start of the file. The
    /// header is not a block.
    pub block_no: u64,
    /// Offset within the block at which the covered region begins.
    pub skip: u64,
    /// Length of the covered region within this block.
    pub length: u64,
}

impl IntraBlock {
    /// A partial block needs read-modify-write; a full one can be written
    /// straight out.
    pub fn is_partial(&self, enc: &ContentEnc) -> bool {
        self.skip > 0 || self.length < enc.plain_bs()
    }

    /// Plaintext byte range of the whole block: (block start, block size).
    pub fn plaintext_range(&self, enc: &ContentEnc) -> (u64, u64) {
        (enc.block_no_to_plain_off(self.block_no), enc.plain_bs())
    }

    /// Ciphertext byte range of the whole block: (block start, block size).
    pub fn ciphertext_range(&self, enc: &ContentEnc) -> (u64, u64) {
        (enc.block_no_to_cipher_off(self.block_no), enc.cipher_bs())
    }
}

/// Content encryption bound to one AEAD instance and one block size.
pub struct ContentEnc {
    core: CryptoCore,
    plain_bs: u64,
}

impl ContentEnc {
    pub fn new(core: CryptoCore, plain_bs: u64) -> Self {
        ContentEnc { core, plain_bs }
    }

    pub fn plain_bs(&self) -> u64 {
        self.plain_bs
    }

    /// Ciphertext block size: plaintext block plus nonce plus tag.
    pub fn cipher_bs(&self) -> u64 {
        self.plain_bs + self.block_overhead()
    }

    pub fn block_overhead(&self) -> u64 {
        (self.core.iv_len() + TAG_LEN) as u64
    }

    /// Encrypt one plaintext block. `plaintext` must not exceed the block
    /// size. Output is `nonce || ciphertext || tag`; empty in, empty out.
    pub fn encrypt_block(
        &self,
        plaintext: &[u8],
        block_no: u64,
        file_id: &[u8],
    ) -> CfsResult<Vec<u8>> {
        if plaintext.is_empty() {
            return Ok(Vec::new());
        }
        debug_assert!(plaintext.len() as u64 <= self.plain_bs);

        let nonce = self.core.fresh_nonce();
        let aad = build_aad(block_no, file_id);
        let sealed = self.core.seal(&nonce, &aad, plaintext)?;

        let mut out = Vec::with_capacity(nonce.len() + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    /// Decrypt one ciphertext block. Empty in, empty out.
    pub fn decrypt_block(
        &self,
        ciphertext: &[u8],
        block_no: u64,
        file_id: &[u8],
    ) -> CfsResult<Vec<u8>> {
        if ciphertext.is_empty() {
            return Ok(Vec::new());
        }
        let iv_len = self.core.iv_len();
        if ciphertext.len() <= iv_len + TAG_LEN {
            return Err(CfsError::corrupt(format!(
                "ciphertext block of {} bytes is too short",
                ciphertext.len()
            )));
        }
        let (nonce, rest) = ciphertext.split_at(iv_len);
        if nonce.iter().all(|&b| b == 0) {
            // A never-written (hole) or wiped block. GCM would reject it
            // anyway, but an all-zero nonce deserves its own message.
            return Err(CfsError::corrupt(format!(
                "all-zero nonce in block {block_no}"
            )));
        }
        let aad = build_aad(block_no, file_id);
        self.core.open(nonce, &aad, rest)
    }

    /// Decrypt a run of consecutive blocks starting at `first_block_no`.
    /// The run may end in a shorter final block.
    pub fn decrypt_blocks(
        &self,
        ciphertext: &[u8],
        first_block_no: u64,
        file_id: &[u8],
    ) -> CfsResult<Vec<u8>> {
        let cipher_bs = self.cipher_bs() as usize;
        let mut out = Vec::with_capacity(ciphertext.len());
        for (i, chunk) in ciphertext.chunks(cipher_bs).enumerate() {
            let block_no = first_block_no + i as u64;
            match self.decrypt_block(chunk, block_no, file_id) {
                Ok(plain) => out.extend_from_slice(&plain),
                Err(err) => {
                    warn!(
                        block_no,
                        plain_off = self.block_no_to_plain_off(block_no),
                        cipher_off = self.block_no_to_cipher_off(block_no),
                        "corrupt ciphertext block: {err}"
                    );
                    return Err(err);
                }
            }
        }
        Ok(out)
    }

    /// Split the plaintext byte range `[offset, offset+length)` into the
    /// blocks it touches.
    pub fn explode_plain_range(&self, offset: u64, length: u64) -> Vec<IntraBlock> {
        let mut blocks = Vec::new();
        let mut offset = offset;
        let mut length = length;
        while length > 0 {
            let skip = offset % self.plain_bs;
            let left = self.plain_bs - skip;
            let len = length.min(left);
            blocks.push(IntraBlock {
                block_no: offset / self.plain_bs,
                skip,
                length: len,
            });
            offset += len;
            length -= len;
        }
        blocks
    }

    /// Minimal contiguous ciphertext range covering `blocks`, plus the
    /// plaintext skip inside the first block.
    pub fn joint_ciphertext_range(&self, blocks: &[IntraBlock]) -> (u64, u64, u64) {
        debug_assert!(!blocks.is_empty());
        let first = &blocks[0];
        let last = &blocks[blocks.len() - 1];
        let offset = self.block_no_to_cipher_off(first.block_no);
        let length = self.block_no_to_cipher_off(last.block_no + 1) - offset;
        (offset, length, first.skip)
    }

    pub fn plain_off_to_block_no(&self, plain_off: u64) -> u64 {
        plain_off / self.plain_bs
    }

    pub fn cipher_off_to_block_no(&self, cipher_off: u64) -> u64 {
        // Offsets inside (or before the end of) the header belong to block 0.
        cipher_off.saturating_sub(HEADER_LEN as u64) / self.cipher_bs()
    }

    pub fn block_no_to_plain_off(&self, block_no: u64) -> u64 {
        block_no * self.plain_bs
    }

    pub fn block_no_to_cipher_off(&self, block_no: u64) -> u64 {
        HEADER_LEN as u64 + block_no * self.cipher_bs()
    }

    /// Plaintext size of a ciphertext file of `cipher_size` bytes.
    pub fn cipher_size_to_plain_size(&self, cipher_size: u64) -> u64 {
        if cipher_size == 0 {
            return 0;
        }
        // Block number of the last byte determines the block count.
        let block_count = self.cipher_off_to_block_no(cipher_size - 1) + 1;
        let overhead = self.block_overhead() * block_count + HEADER_LEN as u64;
        cipher_size.saturating_sub(overhead)
    }

    /// Ciphertext size of a plaintext file of `plain_size` bytes.
    pub fn plain_size_to_cipher_size(&self, plain_size: u64) -> u64 {
        if plain_size == 0 {
            return 0;
        }
        let block_count = self.plain_off_to_block_no(plain_size - 1) + 1;
        plain_size + self.block_overhead() * block_count + HEADER_LEN as u64
    }

    /// Overlay `new` onto `old` starting at `skip`, producing the merged
    /// plaintext block for read-modify-write.
    pub fn merge_blocks(&self, old: &[u8], new: &[u8], skip: usize) -> Vec<u8> {
        let out_len = old.len().max(skip + new.len());
        debug_assert!(out_len as u64 <= self.plain_bs);
        let mut out = vec![0u8; out_len];
        out[..old.len()].copy_from_slice(old);
        out[skip..skip + new.len()].copy_from_slice(new);
        out
    }
}

fn build_aad(block_no: u64, file_id: &[u8]) -> Vec<u8> {
    let mut aad = Vec::with_capacity(8 + file_id.len());
    aad.extend_from_slice(&block_no.to_be_bytes());
    aad.extend_from_slice(file_id);
    aad
}
