//! Cached overlay directory entries.
//!
//! Dentries form a parent-pointing tree. A parent's `children` map owns
//! its instantiated children; the child keeps a weak back-reference for
//! navigation plus one counted reference on the parent, released when
//! the child is destroyed. The logical lifetime is the `refs` count,
//! not the `Arc` count: `Arc` only keeps the memory alive for stragglers
//! while `refs` drives cache residency and lower-handle ownership.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};

use crate::lower::{LowerStat, S_IFDIR, S_IFLNK, S_IFMT, S_IFREG, Vd};

use super::Filesystem;

pub struct Dentry {
    /// Name of this entry in its parent. Empty for the filesystem root.
    pub(crate) name: String,

    /// Weak back-reference; navigation only, never ownership.
    pub(crate) parent: Weak<Dentry>,

    /// Reference count. `>= 1` live, `0` unreferenced and about to be
    /// destroyed, `-1` destroyed. Incrementing from `-1` is a bug.
    refs: AtomicI64,

    // Loaded from the lower entry's metadata. Atomic because
    // permission checks race with refcount bookkeeping.
    mode: AtomicU32,
    uid: AtomicU32,
    gid: AtomicU32,

    /// Instantiated children by name. Guarded by this dentry's own
    /// lock, which is never held across lower-filesystem I/O.
    pub(crate) children: Mutex<HashMap<String, Arc<Dentry>>>,

    /// Handle to this entry in the lower filesystem.
    pub(crate) lower_vd: Vd,

    /// Handle to the sibling Merkle tree file.
    pub(crate) lower_merkle_vd: Vd,

    /// Expected root digest for this entry. Empty only while runtime
    /// enable is allowed and verity has not been turned on yet.
    pub(crate) hash: RwLock<Vec<u8>>,
}

impl Dentry {
    /// Creates a dentry with one reference, owned by the caller.
    pub(crate) fn new(
        name: String,
        parent: Weak<Dentry>,
        lower_vd: Vd,
        lower_merkle_vd: Vd,
        stat: LowerStat,
        hash: Vec<u8>,
    ) -> Arc<Dentry> {
        Arc::new(Dentry {
            name,
            parent,
            refs: AtomicI64::new(1),
            mode: AtomicU32::new(stat.mode),
            uid: AtomicU32::new(stat.uid),
            gid: AtomicU32::new(stat.gid),
            children: Mutex::new(HashMap::new()),
            lower_vd,
            lower_merkle_vd,
            hash: RwLock::new(hash),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> u32 {
        self.mode.load(Ordering::Relaxed)
    }

    pub fn uid(&self) -> u32 {
        self.uid.load(Ordering::Relaxed)
    }

    pub fn gid(&self) -> u32 {
        self.gid.load(Ordering::Relaxed)
    }

    pub fn is_dir(&self) -> bool {
        self.mode() & S_IFMT == S_IFDIR
    }

    pub fn is_regular(&self) -> bool {
        self.mode() & S_IFMT == S_IFREG
    }

    pub fn is_symlink(&self) -> bool {
        self.mode() & S_IFMT == S_IFLNK
    }

    pub(crate) fn is_root(&self) -> bool {
        self.parent.upgrade().is_none()
    }

    /// Current expected hash, empty if verity is not enabled yet.
    pub fn hash(&self) -> Vec<u8> {
        self.hash
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn set_hash(&self, hash: Vec<u8>) {
        *self.hash.write().unwrap_or_else(PoisonError::into_inner) = hash;
    }

    /// Takes an additional reference. The caller must already hold one.
    pub(crate) fn inc_ref(&self) {
        let old = self.refs.fetch_add(1, Ordering::SeqCst);
        debug_assert!(old > 0, "inc_ref on a dentry without a held reference");
    }

    /// Takes a reference unless the count already dropped to zero or
    /// below. Used by callers that do not hold one.
    pub(crate) fn try_inc_ref(&self) -> bool {
        let mut refs = self.refs.load(Ordering::SeqCst);
        loop {
            if refs <= 0 {
                return false;
            }
            match self.refs.compare_exchange_weak(
                refs,
                refs + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                Err(cur) => refs = cur,
            }
        }
    }

    /// Drops a reference. The last drop destroys the dentry under the
    /// filesystem rename lock.
    ///
    /// Must not be called with the rename lock held; path walks defer
    /// their drops for this reason. The caller's `Arc` keeps the
    /// dentry's memory alive through the destroy.
    pub(crate) fn dec_ref(&self, fs: &Filesystem) {
        let refs = self.refs.fetch_sub(1, Ordering::SeqCst) - 1;
        if refs == 0 {
            let _rename = fs
                .rename_mu
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            self.check_drop_locked(fs);
        } else if refs < 0 {
            panic!("dec_ref on a dentry without a held reference");
        }
    }

    /// Destroys the dentry if its count is still zero. Runs under the
    /// rename write lock; a concurrent walker may have revived the
    /// dentry between the drop to zero and the lock acquisition.
    pub(crate) fn check_drop_locked(&self, fs: &Filesystem) {
        if self.refs.load(Ordering::SeqCst) != 0 {
            return;
        }
        self.destroy_locked(fs);
    }

    /// Marks the dentry destroyed, releases its lower handles and
    /// unlinks it from the parent, dropping the parent reference it
    /// held. Preconditions: rename lock held for writing, refs == 0.
    fn destroy_locked(&self, fs: &Filesystem) {
        match self.refs.load(Ordering::SeqCst) {
            0 => self.refs.store(-1, Ordering::SeqCst),
            -1 => panic!("destroy of an already destroyed dentry"),
            _ => panic!("destroy of a dentry with live references"),
        }
        tracing::trace!(name = %self.name, "destroying dentry");

        // The lower handles are plain names into the lower filesystem;
        // dropping the dentry releases them. Open descriptors hold
        // their own lower files and keep the dentry alive, so neither
        // can be in use past this point.

        if let Some(parent) = self.parent.upgrade() {
            {
                let mut children = parent
                    .children
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                // A replacement dentry may already occupy the name;
                // only this dentry's own entry is evicted.
                if children
                    .get(&self.name)
                    .is_some_and(|entry| std::ptr::eq(Arc::as_ptr(entry), self))
                {
                    children.remove(&self.name);
                }
            }
            let refs = parent.refs.fetch_sub(1, Ordering::SeqCst) - 1;
            if refs == 0 {
                parent.check_drop_locked(fs);
            } else if refs < 0 {
                panic!("dec_ref on a dentry without a held reference");
            }
        }
    }

    /// Current reference count; test hook.
    #[cfg(test)]
    pub(crate) fn ref_count(&self) -> i64 {
        self.refs.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for Dentry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dentry")
            .field("name", &self.name)
            .field("refs", &self.refs.load(Ordering::SeqCst))
            .field("mode", &format_args!("{:o}", self.mode()))
            .finish_non_exhaustive()
    }
}
