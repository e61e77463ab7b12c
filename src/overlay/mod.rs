//! The verity overlay filesystem.
//!
//! Wraps a lower filesystem and verifies every path traversal and every
//! read against Merkle sibling files. Mounting captures the expected
//! root hash; path resolution chains the verification down from it, so
//! a dentry's hash is trusted only because its parent's tree said so,
//! all the way up to the mount-time root.

pub mod dentry;
pub mod fd;
#[cfg(test)]
pub mod tests;

use std::sync::{Arc, OnceLock, PoisonError, RwLock, Weak};

use crate::config::MountOptions;
use crate::error::{Error, Result};
use crate::lower::{self, LowerFd, LowerFs, LowerStat, OpenFlags, Vd};
use crate::merkle;

pub use dentry::Dentry;
pub use fd::{
    FS_IOC_ENABLE_VERITY, FS_IOC_GETFLAGS, FS_IOC_MEASURE_VERITY, FS_VERITY_FL, FileDescription,
    IoctlArg, VERITY_HASH_ALG_SHA256, VerityDigest,
};

/// Prefix of Merkle tree files: the tree for `foo` is
/// `.merkle.verity.foo` next to it.
pub const MERKLE_PREFIX: &str = ".merkle.verity.";

/// Xattr on a Merkle file recording the offset of the entry's hash in
/// its parent's Merkle file.
pub(crate) const MERKLE_OFFSET_XATTR: &str = "user.merkle.offset";

/// Xattr on a Merkle file recording the size of the hashed data. For a
/// regular file the file length; for a directory the cumulative length
/// of its children's hashes.
pub(crate) const MERKLE_SIZE_XATTR: &str = "user.merkle.size";

/// A 32-bit integer stored as a decimal xattr string is at most 10
/// digits.
pub(crate) const SIZE_OF_STRING_INT32: usize = 10;

/// Caller identity for permission checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Credentials {
    pub uid: u32,
    pub gid: u32,
}

impl Credentials {
    pub fn root() -> Self {
        Credentials { uid: 0, gid: 0 }
    }
}

/// Requested access for an open or permission check.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Access {
    pub read: bool,
    pub write: bool,
    pub exec: bool,
}

impl Access {
    pub const READ: Access = Access {
        read: true,
        write: false,
        exec: false,
    };
    pub const WRITE: Access = Access {
        read: false,
        write: true,
        exec: false,
    };
    pub const EXEC: Access = Access {
        read: false,
        write: false,
        exec: true,
    };

    fn mask(self) -> u32 {
        (u32::from(self.read) << 2) | (u32::from(self.write) << 1) | u32::from(self.exec)
    }
}

/// Standard UNIX permission bits against the caller's credentials.
/// Uid 0 bypasses read and write checks; exec still wants at least one
/// exec bit on the mode.
pub(crate) fn check_permissions(
    creds: &Credentials,
    access: Access,
    mode: u32,
    uid: u32,
    gid: u32,
) -> Result<()> {
    if creds.uid == 0 {
        if !access.exec || mode & 0o111 != 0 {
            return Ok(());
        }
        return Err(Error::PermissionDenied);
    }
    let class = if creds.uid == uid {
        mode >> 6
    } else if creds.gid == gid {
        mode >> 3
    } else {
        mode
    } & 0o7;
    if access.mask() & class == access.mask() {
        Ok(())
    } else {
        Err(Error::PermissionDenied)
    }
}

/// One mounted verity overlay.
pub struct Filesystem {
    lower: Arc<dyn LowerFs>,

    /// The mount creator's credentials; used for all lower-filesystem
    /// access.
    creds: Credentials,

    allow_runtime_enable: bool,
    panic_on_violation: bool,

    /// Orders structural mutation and dentry destruction against path
    /// walks. Walks hold it for reading; destruction takes it for
    /// writing. This is the outermost lock.
    pub(crate) rename_mu: RwLock<()>,

    /// Serializes tree building against verified reads: reads hold it
    /// for reading, enable holds it for writing. One builder at a time
    /// across the whole filesystem, because directory trees depend on
    /// their children's trees and builders would race on parent append
    /// offsets.
    pub(crate) verity_mu: RwLock<()>,

    /// Back-reference to the owning `Arc`, so descriptors can carry an
    /// owning handle to the filesystem.
    weak_self: Weak<Filesystem>,

    root: OnceLock<Arc<Dentry>>,
}

impl Filesystem {
    /// Mounts the overlay over `lower`.
    ///
    /// The lower filesystem must not be reachable by anything else;
    /// modifying it out of band is exactly what this overlay detects.
    /// In non-enable mode the root Merkle file must exist and the
    /// lower root's metadata must verify against the configured root
    /// hash.
    #[tracing::instrument(skip_all, fields(root_merkle = %opts.root_merkle_file_name))]
    pub fn mount(
        lower: Arc<dyn LowerFs>,
        creds: Credentials,
        opts: &MountOptions,
    ) -> Result<Arc<Filesystem>> {
        let root_hash = opts.root_hash_bytes()?;
        if root_hash.is_empty() && !opts.allow_runtime_enable {
            return Err(Error::InvalidArgument(
                "a root hash is required unless runtime enable is allowed".to_owned(),
            ));
        }

        let fs = Arc::new_cyclic(|weak_self| Filesystem {
            lower,
            creds,
            allow_runtime_enable: opts.allow_runtime_enable,
            panic_on_violation: opts.panic_on_violation,
            rename_mu: RwLock::new(()),
            verity_mu: RwLock::new(()),
            weak_self: weak_self.clone(),
            root: OnceLock::new(),
        });

        let root_vd = Vd::root();
        let merkle_name = format!("{MERKLE_PREFIX}{}", opts.root_merkle_file_name);
        let lower_merkle_vd = match fs.lower.lookup(&root_vd, &merkle_name) {
            Ok(vd) => vd,
            Err(Error::NotFound) if fs.allow_runtime_enable => {
                // First mount over an unverified tree; the root Merkle
                // file is created now and filled by a later enable.
                tracing::debug!(name = %merkle_name, "creating root merkle file");
                drop(
                    fs.lower
                        .open(&root_vd, &merkle_name, OpenFlags::CREATE_READ, 0o644)?,
                );
                fs.lower.lookup(&root_vd, &merkle_name)?
            }
            Err(Error::NotFound) => {
                return Err(fs.violation("root merkle file is missing"));
            }
            Err(e) => return Err(e),
        };

        let stat = fs.lower.stat(&root_vd)?;
        let root = Dentry::new(
            String::new(),
            Weak::new(),
            root_vd,
            lower_merkle_vd,
            stat,
            root_hash,
        );
        if !fs.allow_runtime_enable {
            fs.verify_stat(&root, stat)?;
        }

        tracing::debug!(root_hash = %hex::encode(root.hash()), "mounted verity overlay");
        fs.root.set(root).ok();
        Ok(fs)
    }

    /// Mounts with the lower backend built from
    /// `opts.lower_name`/`opts.lower_options`.
    pub fn mount_from_config(creds: Credentials, opts: &MountOptions) -> Result<Arc<Filesystem>> {
        let lower = lower::new_lower(&opts.lower_name, &opts.lower_options)?;
        Filesystem::mount(lower, creds, opts)
    }

    pub fn allow_runtime_enable(&self) -> bool {
        self.allow_runtime_enable
    }

    pub(crate) fn root_dentry(&self) -> &Arc<Dentry> {
        self.root.get().expect("filesystem is mounted")
    }

    /// Reports an integrity violation: an observation contradicting
    /// the expected hash chain. Depending on mount policy this aborts
    /// the process or surfaces an error; serving unverified bytes is
    /// never an option.
    pub(crate) fn violation(&self, msg: impl Into<String>) -> Error {
        let msg = msg.into();
        tracing::warn!(%msg, "integrity violation");
        if self.panic_on_violation {
            panic!("integrity violation: {msg}");
        }
        Error::IntegrityViolation(msg)
    }

    /// Whether `d` is served verified. Always true outside runtime
    /// enable mode; in enable mode, true once the dentry carries a
    /// hash.
    pub(crate) fn verity_enabled(&self, d: &Dentry) -> bool {
        !self.allow_runtime_enable || !d.hash().is_empty()
    }

    /// Reads and parses the data-size xattr of a Merkle file. Both a
    /// missing attribute and a non-numeric value mean the file system
    /// was modified unexpectedly.
    pub(crate) fn read_size_xattr(&self, merkle_fd: &dyn LowerFd) -> Result<u64> {
        let value = match merkle_fd.getxattr(MERKLE_SIZE_XATTR, SIZE_OF_STRING_INT32) {
            Ok(value) => value,
            Err(Error::NoAttr) => {
                return Err(self.violation(format!("missing xattr {MERKLE_SIZE_XATTR}")));
            }
            Err(e) => return Err(e),
        };
        value.parse().map_err(|_| {
            self.violation(format!("malformed xattr {MERKLE_SIZE_XATTR}: {value:?}"))
        })
    }

    /// Re-verifies an entry's metadata against its hash by running a
    /// zero-length verify with the fresh stat as the identity. Catches
    /// tampered mode, owner, group or file type.
    ///
    /// Callers racing with enable serialize through the verity lock;
    /// this function takes no lock itself so it can run under an
    /// already read-held one.
    pub(crate) fn verify_stat(&self, d: &Dentry, stat: LowerStat) -> Result<()> {
        let expected = d.hash();
        if expected.is_empty() {
            return Ok(());
        }
        let merkle_fd = self.lower.open(&d.lower_merkle_vd, "", OpenFlags::READ, 0)?;
        let size = self.read_size_xattr(merkle_fd.as_ref())?;
        let reader: &dyn LowerFd = merkle_fd.as_ref();
        let mut sink = std::io::sink();
        let res = merkle::verify(&mut merkle::VerifyParams {
            out: &mut sink,
            data: &reader,
            tree: &reader,
            size,
            name: d.name(),
            mode: stat.mode,
            uid: stat.uid,
            gid: stat.gid,
            read_offset: 0,
            read_size: 0,
            expected: &expected,
            data_and_tree_in_same_file: d.is_dir(),
        });
        match res {
            Ok(_) => Ok(()),
            Err(Error::VerificationFailed(m)) | Err(Error::MalformedTree(m)) => {
                Err(self.violation(format!("metadata mismatch for {:?}: {m}", d.name())))
            }
            Err(e) => Err(e),
        }
    }

    /// Resolves `path` from the root, verifying each component. The
    /// returned dentry carries a reference the caller must drop with
    /// [`Filesystem::put_dentry`].
    pub fn resolve(&self, creds: &Credentials, path: &str) -> Result<Arc<Dentry>> {
        let mut put = Vec::new();
        let res = {
            let _rename = self
                .rename_mu
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            self.walk_locked(creds, path, &mut put)
        };
        // Dropping walker references may destroy dentries, which needs
        // the rename write lock, so it waits until the guard is gone.
        for d in put {
            d.dec_ref(self);
        }
        res
    }

    /// Drops a reference obtained from [`Filesystem::resolve`].
    pub fn put_dentry(&self, d: &Arc<Dentry>) {
        d.dec_ref(self);
    }

    fn walk_locked(
        &self,
        creds: &Credentials,
        path: &str,
        put: &mut Vec<Arc<Dentry>>,
    ) -> Result<Arc<Dentry>> {
        let root = Arc::clone(self.root_dentry());
        root.inc_ref();
        let mut cur = root;
        let comps = match lower::split_components(path) {
            Ok(comps) => comps,
            Err(e) => {
                put.push(cur);
                return Err(e);
            }
        };
        for comp in comps {
            let step = (|| {
                if !cur.is_dir() {
                    return Err(Error::NotDirectory);
                }
                check_permissions(creds, Access::EXEC, cur.mode(), cur.uid(), cur.gid())?;
                self.get_child_locked(&cur, comp)
            })();
            match step {
                Ok(child) => put.push(std::mem::replace(&mut cur, child)),
                Err(e) => {
                    put.push(cur);
                    return Err(e);
                }
            }
        }
        Ok(cur)
    }

    /// Returns the child dentry of `parent` named `name`, from the
    /// cache if instantiated, otherwise by lower lookup and hash
    /// verification. The returned dentry carries a reference for the
    /// caller. Precondition: rename lock held for reading.
    fn get_child_locked(&self, parent: &Arc<Dentry>, name: &str) -> Result<Arc<Dentry>> {
        if let Some(child) = parent
            .children
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
        {
            if child.try_inc_ref() {
                return Ok(Arc::clone(child));
            }
            // The cached dentry lost its last reference and waits for
            // the rename write lock to be destroyed; instantiate a
            // replacement. Its removal guard checks pointer identity,
            // so it cannot evict the replacement.
        }

        // No dir lock across the lower I/O below; racing walkers may
        // both instantiate, the loser discards its copy.
        let child = self.lookup_and_verify(parent, name)?;

        let mut children = parent
            .children
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = children.get(name) {
            if existing.try_inc_ref() {
                return Ok(Arc::clone(existing));
            }
        }
        // A live child holds one reference on its parent until
        // destroyed.
        parent.inc_ref();
        children.insert(name.to_owned(), Arc::clone(&child));
        Ok(child)
    }

    /// Looks up `name` and its Merkle sibling in the lower filesystem,
    /// builds the dentry and verifies its hash against the parent's
    /// tree.
    fn lookup_and_verify(&self, parent: &Arc<Dentry>, name: &str) -> Result<Arc<Dentry>> {
        let merkle_name = format!("{MERKLE_PREFIX}{name}");
        let child_vd = self.lower.lookup(&parent.lower_vd, name)?;
        let child_merkle_vd = match self.lower.lookup(&parent.lower_vd, &merkle_name) {
            Ok(vd) => vd,
            Err(Error::NotFound) if self.allow_runtime_enable => {
                tracing::trace!(name, "creating merkle file on demand");
                drop(self.lower.open(
                    &parent.lower_vd,
                    &merkle_name,
                    OpenFlags::CREATE_READ,
                    0o644,
                )?);
                self.lower.lookup(&parent.lower_vd, &merkle_name)?
            }
            Err(Error::NotFound) => {
                return Err(self.violation(format!("missing merkle file for {name:?}")));
            }
            Err(e) => return Err(e),
        };

        let stat = self.lower.stat(&child_vd)?;
        let child = Dentry::new(
            name.to_owned(),
            Arc::downgrade(parent),
            child_vd,
            child_merkle_vd.clone(),
            stat,
            Vec::new(),
        );

        let parent_hash = parent.hash();
        if parent_hash.is_empty() {
            // Enable mode with an unanchored parent; there is nothing
            // to verify the child against yet.
            debug_assert!(self.allow_runtime_enable);
            return Ok(child);
        }

        // The checks below consult Merkle state that enable rewrites;
        // hold off builders for the whole verification.
        let _verity = self
            .verity_mu
            .read()
            .unwrap_or_else(PoisonError::into_inner);

        // The child's expected hash lives in the parent's Merkle data
        // region, at the offset recorded on the child's Merkle file.
        let offset_value = match self.lower.getxattr(
            &child_merkle_vd,
            MERKLE_OFFSET_XATTR,
            SIZE_OF_STRING_INT32,
        ) {
            Ok(value) => value,
            Err(Error::NoAttr) if self.allow_runtime_enable => return Ok(child),
            Err(Error::NoAttr) => {
                return Err(
                    self.violation(format!("missing xattr {MERKLE_OFFSET_XATTR} on {name:?}"))
                );
            }
            Err(e) => return Err(e),
        };
        let offset: u64 = offset_value.parse().map_err(|_| {
            self.violation(format!(
                "malformed xattr {MERKLE_OFFSET_XATTR} on {name:?}: {offset_value:?}"
            ))
        })?;

        let parent_merkle_fd = self
            .lower
            .open(&parent.lower_merkle_vd, "", OpenFlags::READ, 0)?;
        let parent_size = self.read_size_xattr(parent_merkle_fd.as_ref())?;
        let reader: &dyn LowerFd = parent_merkle_fd.as_ref();
        let mut child_hash = Vec::with_capacity(merkle::DIGEST_SIZE);
        let res = merkle::verify(&mut merkle::VerifyParams {
            out: &mut child_hash,
            data: &reader,
            tree: &reader,
            size: parent_size,
            name: parent.name(),
            mode: parent.mode(),
            uid: parent.uid(),
            gid: parent.gid(),
            read_offset: offset,
            read_size: merkle::DIGEST_SIZE as u64,
            expected: &parent_hash,
            data_and_tree_in_same_file: true,
        });
        match res {
            Ok(n) if n == merkle::DIGEST_SIZE as u64 => {}
            Ok(_) => {
                return Err(self.violation(format!(
                    "hash for {name:?} lies outside the parent merkle data"
                )));
            }
            Err(Error::VerificationFailed(m)) | Err(Error::MalformedTree(m)) => {
                return Err(self.violation(format!("failed to verify hash for {name:?}: {m}")));
            }
            Err(e) => return Err(e),
        }
        child.set_hash(child_hash);

        // The hash is anchored; now the entry's own metadata must
        // match it.
        self.verify_stat(&child, stat)?;
        tracing::trace!(name, hash = %hex::encode(child.hash()), "verified child");
        Ok(child)
    }

    /// Opens `path` for the given access, attaching the Merkle sibling
    /// handles the descriptor needs. Write access fails; the overlay
    /// is read-only.
    pub fn open(&self, creds: &Credentials, path: &str, access: Access) -> Result<FileDescription> {
        if access.write {
            return Err(Error::ReadOnly);
        }
        let d = self.resolve(creds, path)?;
        let lowers = (|| {
            check_permissions(creds, access, d.mode(), d.uid(), d.gid())?;
            if d.is_symlink() {
                return Err(Error::InvalidArgument(
                    "cannot open a symlink".to_owned(),
                ));
            }
            let data_fd = self.lower.open(&d.lower_vd, "", OpenFlags::READ, 0)?;
            let merkle_reader = self.lower.open(&d.lower_merkle_vd, "", OpenFlags::READ, 0)?;
            let (merkle_writer, parent_merkle_writer) = if self.allow_runtime_enable {
                let merkle_writer = self.lower.open(&d.lower_merkle_vd, "", OpenFlags::APPEND, 0)?;
                let parent_merkle_writer = match d.parent.upgrade() {
                    Some(parent) => Some(self.lower.open(
                        &parent.lower_merkle_vd,
                        "",
                        OpenFlags::APPEND,
                        0,
                    )?),
                    None => None,
                };
                (Some(merkle_writer), parent_merkle_writer)
            } else {
                (None, None)
            };
            Ok((data_fd, merkle_reader, merkle_writer, parent_merkle_writer))
        })();
        match lowers {
            Ok((data_fd, merkle_reader, merkle_writer, parent_merkle_writer)) => {
                let fs = self.weak_self.upgrade().expect("filesystem is alive");
                Ok(FileDescription::new(
                    fs,
                    d,
                    data_fd,
                    merkle_reader,
                    merkle_writer,
                    parent_merkle_writer,
                ))
            }
            Err(e) => {
                d.dec_ref(self);
                Err(e)
            }
        }
    }

    /// Reads a symlink target. Targets are not hash-verified.
    pub fn readlink(&self, creds: &Credentials, path: &str) -> Result<String> {
        let d = self.resolve(creds, path)?;
        let res = if d.is_symlink() {
            self.lower.readlink(&d.lower_vd)
        } else {
            Err(Error::InvalidArgument("not a symlink".to_owned()))
        };
        d.dec_ref(self);
        res
    }

    /// The mount creator's credentials, used for lower access.
    pub fn creds(&self) -> Credentials {
        self.creds
    }
}

// The overlay is read-only. Everything that would mutate it fails the
// same way; the single permitted mutation is the enable-verity ioctl
// on an open descriptor.
impl Filesystem {
    pub fn unlink(&self, _creds: &Credentials, _path: &str) -> Result<()> {
        Err(Error::ReadOnly)
    }

    pub fn rmdir(&self, _creds: &Credentials, _path: &str) -> Result<()> {
        Err(Error::ReadOnly)
    }

    pub fn mkdir(&self, _creds: &Credentials, _path: &str, _mode: u32) -> Result<()> {
        Err(Error::ReadOnly)
    }

    pub fn symlink(&self, _creds: &Credentials, _path: &str, _target: &str) -> Result<()> {
        Err(Error::ReadOnly)
    }

    pub fn link(&self, _creds: &Credentials, _old: &str, _new: &str) -> Result<()> {
        Err(Error::ReadOnly)
    }

    pub fn rename(&self, _creds: &Credentials, _old: &str, _new: &str) -> Result<()> {
        Err(Error::ReadOnly)
    }

    pub fn setxattr(&self, _creds: &Credentials, _path: &str, _name: &str, _value: &str) -> Result<()> {
        Err(Error::ReadOnly)
    }
}

impl Drop for Filesystem {
    fn drop(&mut self) {
        if let Some(root) = self.root.get() {
            let root = Arc::clone(root);
            root.dec_ref(self);
        }
    }
}
