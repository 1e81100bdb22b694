//! Inode-keyed write locks.
//!
//! The read-modify-write of a partial block must not interleave with
//! another writer on the same inode, and two handles on the same inode may
//! be opened independently. The lock therefore lives here, keyed by inode
//! number, outliving any single handle: each handle registers on open,
//! holds an `Arc` to its inode's lock, and unregisters on release. The
//! entry disappears when the last registration goes away.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

/// The write lock for one inode. Obtained via [`WriteLockTable::register`].
pub struct InodeWriteLock {
    mutex: Mutex<()>,
}

impl InodeWriteLock {
    /// Take the per-inode write lock for the duration of one write or
    /// truncate.
    pub fn lock(&self) -> MutexGuard<'_, ()> {
        self.mutex.lock()
    }
}

/// Process-wide map from inode number to a reference-counted write lock.
#[derive(Default)]
pub struct WriteLockTable {
    entries: Mutex<HashMap<u64, Entry>>,
}

struct Entry {
    refcount: usize,
    lock: Arc<InodeWriteLock>,
}

impl WriteLockTable {
    pub fn new() -> Arc<WriteLockTable> {
        Arc::new(WriteLockTable::default())
    }

    /// Register one handle on `ino`, creating the entry if needed.
    pub fn register(&self, ino: u64) -> Arc<InodeWriteLock> {
        let mut map = self.entries.lock();
        let entry = map.entry(ino).or_insert_with(|| Entry {
            refcount: 0,
            lock: Arc::new(InodeWriteLock {
                mutex: Mutex::new(()),
            }),
        });
        entry.refcount += 1;
        entry.lock.clone()
    }

    /// Drop one registration on `ino`; the last one removes the entry.
    pub fn unregister(&self, ino: u64) {
        let mut map = self.entries.lock();
        let Some(entry) = map.get_mut(&ino) else {
            debug_assert!(false, "unregister of unknown inode {ino}");
            return;
        };
        entry.refcount -= 1;
        if entry.refcount == 0 {
            map.remove(&ino);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
