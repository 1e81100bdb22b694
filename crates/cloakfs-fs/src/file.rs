//! Per-open-file state machine.
//!
//! A `CryptFile` owns the backing descriptor of one open ciphertext file
//! and translates plaintext byte ranges into whole-block reads and writes
//! through the content layer. Locking discipline:
//!
//! - `fd` slot under a reader/writer lock. Every operation takes it shared;
//!   `release` takes it exclusive, closes the descriptor and empties the
//!   slot. Latecomers find the slot empty and fail with `BadHandle` instead
//!   of touching a closed descriptor.
//! - Writes and truncates additionally hold the per-inode write lock from
//!   the [`write_lock`](crate::write_lock) table, across all handles on the
//!   inode, so partial-block read-modify-write never loses updates.

use std::fs::File;
use std::io;
use std::os::unix::fs::{FileExt, MetadataExt, PermissionsExt};
use std::os::unix::io::AsRawFd;
use std::sync::Arc;
use std::sync::Once;
use std::time::SystemTime;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use cloakfs_core::{CfsError, CfsResult};
use cloakfs_crypto::content::{ContentEnc, FileHeader, HEADER_LEN};

use crate::write_lock::{InodeWriteLock, WriteLockTable};

pub struct CryptFile {
    /// Backing descriptor. `None` after release.
    fd: RwLock<Option<File>>,
    /// Was the file opened O_WRONLY? Reads are refused then.
    write_only: bool,
    /// Cached file header; read lazily, created on first write, dropped on
    /// truncate-to-zero.
    header: Mutex<Option<FileHeader>>,
    content: Arc<ContentEnc>,
    ino: u64,
    /// Stable reference into the write-lock table, held for the lifetime of
    /// the handle.
    wlock: Arc<InodeWriteLock>,
    locks: Arc<WriteLockTable>,
}

impl CryptFile {
    /// Wrap an already-opened backing file.
    pub fn new(
        fd: File,
        write_only: bool,
        content: Arc<ContentEnc>,
        locks: Arc<WriteLockTable>,
    ) -> CfsResult<CryptFile> {
        let ino = fd.metadata()?.ino();
        let wlock = locks.register(ino);
        Ok(CryptFile {
            fd: RwLock::new(Some(fd)),
            write_only,
            header: Mutex::new(None),
            content,
            ino,
            wlock,
            locks,
        })
    }

    pub fn ino(&self) -> u64 {
        self.ino
    }

    /// Read `length` plaintext bytes at plaintext offset `off`. A short
    /// result means the file ends there.
    pub fn read(&self, off: u64, length: u64) -> CfsResult<Vec<u8>> {
        let guard = self.fd.read();
        let fd = guard.as_ref().ok_or(CfsError::BadHandle)?;
        if self.write_only {
            warn!(ino = self.ino, "read on write-only handle");
            return Err(CfsError::BadHandle);
        }
        debug!(ino = self.ino, off, length, "read");
        let res = self.do_read(fd, off, length);
        if let Err(CfsError::AuthFailure) = &res {
            warn!(ino = self.ino, off, length, "read hit a corrupt block");
        }
        res
    }

    /// Encrypt `data` to plaintext offset `off`. Writing past the current
    /// end first materializes zero-filled blocks up to `off`: every
    /// plaintext byte must exist as authenticated ciphertext, so holes are
    /// written out, not skipped.
    pub fn write(&self, data: &[u8], off: u64) -> CfsResult<usize> {
        let guard = self.fd.read();
        let Some(fd) = guard.as_ref() else {
            warn!(ino = self.ino, "write on released handle");
            return Err(CfsError::BadHandle);
        };
        let _wl = self.wlock.lock();
        debug!(ino = self.ino, off, length = data.len(), "write");

        let plain_size = self.content.cipher_size_to_plain_size(fd.metadata()?.len());
        if off > plain_size {
            self.zero_pad(fd, plain_size, off)?;
        }
        self.do_write(fd, data, off)
    }

    /// Change the plaintext size of the file.
    pub fn truncate(&self, new_size: u64) -> CfsResult<()> {
        let guard = self.fd.read();
        let Some(fd) = guard.as_ref() else {
            warn!(ino = self.ino, "truncate on released handle");
            return Err(CfsError::BadHandle);
        };
        let _wl = self.wlock.lock();

        if new_size == 0 {
            fd.set_len(0)?;
            // Truncate to zero kills the file header.
            *self.header.lock() = None;
            return Ok(());
        }

        let old_size = self.content.cipher_size_to_plain_size(fd.metadata()?.len());
        debug!(ino = self.ino, old_size, new_size, "truncate");
        if new_size == old_size {
            return Ok(());
        }

        if new_size > old_size {
            // Grow. Every newly exposed block is written as zero-filled
            // plaintext; a bare ftruncate would leave unauthenticated
            // holes.
            return self.zero_pad(fd, old_size, new_size);
        }

        // Shrink. If the new end falls mid-block, the kept prefix of that
        // block is re-encrypted under a fresh nonce.
        let block_no = self.content.plain_off_to_block_no(new_size);
        let cipher_off = self.content.block_no_to_cipher_off(block_no);
        let plain_off = self.content.block_no_to_plain_off(block_no);
        let last_block_len = new_size - plain_off;

        let kept = if last_block_len > 0 {
            self.do_read(fd, plain_off, last_block_len)?
        } else {
            Vec::new()
        };
        fd.set_len(cipher_off)?;
        if !kept.is_empty() {
            self.do_write(fd, &kept, plain_off)?;
        }
        Ok(())
    }

    /// Flush for one dup'd descriptor: duplicate the fd and close the
    /// duplicate. The kernel calls this once per dup, so the real
    /// descriptor must stay open.
    pub fn flush(&self) -> CfsResult<()> {
        let guard = self.fd.read();
        let fd = guard.as_ref().ok_or(CfsError::BadHandle)?;
        let dup = unsafe { libc::dup(fd.as_raw_fd()) };
        if dup < 0 {
            return Err(io::Error::last_os_error().into());
        }
        let ret = unsafe { libc::close(dup) };
        if ret != 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(())
    }

    pub fn fsync(&self) -> CfsResult<()> {
        let guard = self.fd.read();
        let fd = guard.as_ref().ok_or(CfsError::BadHandle)?;
        fd.sync_all()?;
        Ok(())
    }

    pub fn chmod(&self, mode: u32) -> CfsResult<()> {
        let guard = self.fd.read();
        let fd = guard.as_ref().ok_or(CfsError::BadHandle)?;
        fd.set_permissions(PermissionsExt::from_mode(mode))?;
        Ok(())
    }

    pub fn chown(&self, uid: u32, gid: u32) -> CfsResult<()> {
        let guard = self.fd.read();
        let fd = guard.as_ref().ok_or(CfsError::BadHandle)?;
        let ret = unsafe { libc::fchown(fd.as_raw_fd(), uid, gid) };
        if ret != 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(())
    }

    pub fn utimens(
        &self,
        atime: Option<SystemTime>,
        mtime: Option<SystemTime>,
    ) -> CfsResult<()> {
        let guard = self.fd.read();
        let fd = guard.as_ref().ok_or(CfsError::BadHandle)?;
        let times = [to_timespec(atime), to_timespec(mtime)];
        let ret = unsafe { libc::futimens(fd.as_raw_fd(), times.as_ptr()) };
        if ret != 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(())
    }

    /// Backing metadata plus the plaintext size the user should see.
    pub fn getattr(&self) -> CfsResult<(std::fs::Metadata, u64)> {
        let guard = self.fd.read();
        let fd = guard.as_ref().ok_or(CfsError::BadHandle)?;
        let meta = fd.metadata()?;
        let plain_size = self.content.cipher_size_to_plain_size(meta.len());
        Ok((meta, plain_size))
    }

    /// fallocate(2) from user space. Preallocating plaintext ranges has no
    /// sensible ciphertext meaning here; the internal preallocation before
    /// block writes is a different thing and stays internal.
    pub fn allocate(&self, _off: u64, _length: u64, _mode: u32) -> CfsResult<()> {
        static WARN_ONCE: Once = Once::new();
        WARN_ONCE.call_once(|| {
            warn!("fallocate(2) is not supported, returning ENOSYS");
        });
        Err(CfsError::NotSupported)
    }

    /// Close the backing descriptor and unregister from the write-lock
    /// table. In-flight operations finish first (they hold the shared
    /// branch); operations arriving afterwards get `BadHandle`.
    pub fn release(&self) {
        let fd = {
            let mut guard = self.fd.write();
            match guard.take() {
                Some(fd) => fd,
                None => panic!("double release of handle on inode {}", self.ino),
            }
        };
        drop(fd);
        self.locks.unregister(self.ino);
    }

    /// Load the header from disk unless already cached. `None` means the
    /// file is empty.
    fn get_or_read_header(&self, fd: &File) -> CfsResult<Option<FileHeader>> {
        let mut cache = self.header.lock();
        if let Some(h) = cache.as_ref() {
            return Ok(Some(h.clone()));
        }
        let mut buf = [0u8; HEADER_LEN];
        let n = read_at_full(fd, &mut buf, 0)?;
        if n == 0 {
            return Ok(None);
        }
        if n < HEADER_LEN {
            return Err(CfsError::corrupt(format!(
                "file header truncated at {n} bytes"
            )));
        }
        let header = FileHeader::parse(&buf)?;
        *cache = Some(header.clone());
        Ok(Some(header))
    }

    /// Like `get_or_read_header`, but an empty file gets a fresh random
    /// header written to disk. First step of every write.
    fn get_or_create_header(&self, fd: &File) -> CfsResult<FileHeader> {
        if let Some(h) = self.get_or_read_header(fd)? {
            return Ok(h);
        }
        let header = FileHeader::random();
        let buf = header.pack();
        // No partially written headers: reserve the range first.
        prealloc(fd, 0, HEADER_LEN as u64).map_err(|e| {
            warn!(ino = self.ino, "header prealloc failed: {e}");
            CfsError::Io(e)
        })?;
        fd.write_all_at(&buf, 0)?;
        *self.header.lock() = Some(header.clone());
        Ok(header)
    }

    /// Read `length` plaintext bytes at `off`: map to ciphertext blocks,
    /// read the joint range in one call, decrypt, crop. Also the read half
    /// of read-modify-write.
    fn do_read(&self, fd: &File, off: u64, length: u64) -> CfsResult<Vec<u8>> {
        let Some(header) = self.get_or_read_header(fd)? else {
            return Ok(Vec::new());
        };
        if length == 0 {
            return Ok(Vec::new());
        }

        let blocks = self.content.explode_plain_range(off, length);
        let (aligned_off, aligned_len, skip) = self.content.joint_ciphertext_range(&blocks);
        let mut ciphertext = vec![0u8; aligned_len as usize];
        let n = read_at_full(fd, &mut ciphertext, aligned_off)?;
        // EOF mid-range is fine, the caller sees the short plaintext.
        ciphertext.truncate(n);

        let plaintext = self
            .content
            .decrypt_blocks(&ciphertext, blocks[0].block_no, &header.id)?;

        let have = plaintext.len() as u64;
        let want = skip + length;
        let out = if have > want {
            plaintext[skip as usize..want as usize].to_vec()
        } else if have > skip {
            plaintext[skip as usize..].to_vec()
        } else {
            // File was smaller than the requested offset.
            Vec::new()
        };
        Ok(out)
    }

    /// Encrypt `data` to `off`, block by block, with read-modify-write for
    /// partial blocks. Caller holds the per-inode write lock.
    fn do_write(&self, fd: &File, data: &[u8], off: u64) -> CfsResult<usize> {
        let header = self.get_or_create_header(fd)?;

        let blocks = self.content.explode_plain_range(off, data.len() as u64);
        let mut written = 0usize;
        let mut consumed = 0usize;
        for b in &blocks {
            let chunk = &data[consumed..consumed + b.length as usize];
            consumed += b.length as usize;

            let block_data = if b.is_partial(&self.content) {
                let (block_off, _) = b.plaintext_range(&self.content);
                let old = self.do_read(fd, block_off, self.content.plain_bs()).map_err(|e| {
                    warn!(ino = self.ino, block_no = b.block_no, "RMW read failed: {e}");
                    e
                })?;
                self.content.merge_blocks(&old, chunk, b.skip as usize)
            } else {
                chunk.to_vec()
            };

            let ciphertext = self
                .content
                .encrypt_block(&block_data, b.block_no, &header.id)?;
            let (cipher_off, _) = b.ciphertext_range(&self.content);

            // Reserve the target range before writing so a crash cannot
            // leave a partially written, unverifiable block.
            prealloc(fd, cipher_off, ciphertext.len() as u64).map_err(|e| {
                warn!(ino = self.ino, block_no = b.block_no, "prealloc failed: {e}");
                CfsError::Io(e)
            })?;
            fd.write_all_at(&ciphertext, cipher_off)?;
            written += b.length as usize;
        }
        Ok(written)
    }

    /// Materialize zero-filled plaintext for `[from, to)`, one block at a
    /// time.
    fn zero_pad(&self, fd: &File, from: u64, to: u64) -> CfsResult<()> {
        debug!(ino = self.ino, from, to, "zero-padding grown range");
        for b in self.content.explode_plain_range(from, to - from) {
            let (block_off, _) = b.plaintext_range(&self.content);
            let zeros = vec![0u8; b.length as usize];
            self.do_write(fd, &zeros, block_off + b.skip)?;
        }
        Ok(())
    }
}

impl Drop for CryptFile {
    fn drop(&mut self) {
        // A handle dropped without an explicit release still has to give
        // back its write-lock registration.
        if self.fd.get_mut().take().is_some() {
            self.locks.unregister(self.ino);
        }
    }
}

fn to_timespec(t: Option<SystemTime>) -> libc::timespec {
    match t {
        None => libc::timespec {
            tv_sec: 0,
            tv_nsec: libc::UTIME_OMIT,
        },
        Some(t) => {
            let d = t
                .duration_since(SystemTime::UNIX_EPOCH)
                .unwrap_or_default();
            libc::timespec {
                tv_sec: d.as_secs() as libc::time_t,
                tv_nsec: d.subsec_nanos() as _,
            }
        }
    }
}

/// Positional read that keeps going over short reads. Returns the number of
/// bytes actually read; less than `buf.len()` means EOF.
fn read_at_full(fd: &File, buf: &mut [u8], off: u64) -> io::Result<usize> {
    let mut done = 0;
    while done < buf.len() {
        match fd.read_at(&mut buf[done..], off + done as u64) {
            Ok(0) => break,
            Ok(n) => done += n,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(done)
}

/// fallocate with KEEP_SIZE: reserve the byte range without changing the
/// file size.
fn prealloc(fd: &File, off: u64, len: u64) -> io::Result<()> {
    let ret = unsafe {
        libc::fallocate(
            fd.as_raw_fd(),
            libc::FALLOC_FL_KEEP_SIZE,
            off as libc::off_t,
            len as libc::off_t,
        )
    };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
