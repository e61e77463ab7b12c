//! Open descriptors on the overlay.
//!
//! A descriptor wraps up to four lower descriptors: the data file, a
//! read handle on its Merkle sibling, and in runtime-enable mode an
//! append handle on the sibling plus one on the parent's sibling. Reads
//! stream through the Merkle codec; the only mutation that exists is
//! the enable-verity ioctl.

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::lower::{LockKind, LockRange, LowerFd, LowerStat};
use crate::merkle;

use super::dentry::Dentry;
use super::{Filesystem, MERKLE_OFFSET_XATTR, MERKLE_SIZE_XATTR};

/// `FS_IOC_ENABLE_VERITY` ioctl command.
pub const FS_IOC_ENABLE_VERITY: u32 = 0x4080_6685;

/// `FS_IOC_MEASURE_VERITY` ioctl command.
pub const FS_IOC_MEASURE_VERITY: u32 = 0xc004_6686;

/// `FS_IOC_GETFLAGS` ioctl command.
pub const FS_IOC_GETFLAGS: u32 = 0x8008_6601;

/// Inode flag reported for verity-enabled files.
pub const FS_VERITY_FL: u32 = 0x0010_0000;

/// Digest algorithm identifier carried in [`VerityDigest`].
pub const VERITY_HASH_ALG_SHA256: u16 = 1;

/// In/out argument of `FS_IOC_MEASURE_VERITY`: `size` carries the
/// caller's buffer capacity in and the digest length out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerityDigest {
    pub algorithm: u16,
    pub size: u16,
    pub digest: Vec<u8>,
}

impl VerityDigest {
    /// An empty digest with a buffer of `capacity` bytes.
    pub fn with_capacity(capacity: u16) -> Self {
        VerityDigest {
            algorithm: 0,
            size: capacity,
            digest: vec![0; capacity as usize],
        }
    }
}

/// Argument carrier for [`FileDescription::ioctl`].
pub enum IoctlArg<'a> {
    None,
    Digest(&'a mut VerityDigest),
    Flags(&'a mut u32),
}

/// Per-open state for one overlay file.
pub struct FileDescription {
    fs: Arc<Filesystem>,
    d: Arc<Dentry>,

    /// Read handle on the file's contents. Always present.
    data_fd: Box<dyn LowerFd>,

    /// Read handle on the sibling Merkle file. Always present.
    merkle_reader: Box<dyn LowerFd>,

    /// Append handle on the sibling Merkle file. Present iff the mount
    /// allows runtime enable.
    merkle_writer: Option<Box<dyn LowerFd>>,

    /// Append handle on the parent's Merkle file. Present iff the
    /// mount allows runtime enable and this is not the root.
    parent_merkle_writer: Option<Box<dyn LowerFd>>,
}

impl FileDescription {
    pub(crate) fn new(
        fs: Arc<Filesystem>,
        d: Arc<Dentry>,
        data_fd: Box<dyn LowerFd>,
        merkle_reader: Box<dyn LowerFd>,
        merkle_writer: Option<Box<dyn LowerFd>>,
        parent_merkle_writer: Option<Box<dyn LowerFd>>,
    ) -> Self {
        FileDescription {
            fs,
            d,
            data_fd,
            merkle_reader,
            merkle_writer,
            parent_merkle_writer,
        }
    }

    pub fn dentry(&self) -> &Arc<Dentry> {
        &self.d
    }

    /// Reads up to `buf.len()` bytes at `offset`, verified against the
    /// Merkle tree. Only a not-yet-enabled file under runtime enable
    /// is served unverified.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        if self.d.is_dir() {
            return Err(Error::Io(std::io::Error::from(
                std::io::ErrorKind::IsADirectory,
            )));
        }
        if !self.fs.verity_enabled(&self.d) {
            return self.data_fd.read_at(buf, offset);
        }

        // Hold off enable for the whole read so the tree cannot change
        // under the verification.
        let _verity = self
            .fs
            .verity_mu
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        let size = self.fs.read_size_xattr(self.merkle_reader.as_ref())?;
        let expected = self.d.hash();
        let read_size = buf.len() as u64;
        let data: &dyn LowerFd = self.data_fd.as_ref();
        let tree: &dyn LowerFd = self.merkle_reader.as_ref();
        let mut out: &mut [u8] = buf;
        let res = merkle::verify(&mut merkle::VerifyParams {
            out: &mut out,
            data: &data,
            tree: &tree,
            size,
            name: self.d.name(),
            mode: self.d.mode(),
            uid: self.d.uid(),
            gid: self.d.gid(),
            read_offset: offset,
            read_size,
            expected: &expected,
            data_and_tree_in_same_file: false,
        });
        match res {
            Ok(n) => Ok(n as usize),
            Err(Error::VerificationFailed(m)) => Err(self
                .fs
                .violation(format!("read of {:?} failed to verify: {m}", self.d.name()))),
            Err(e) => Err(e),
        }
    }

    /// Lower stat, re-verified against the hash when the file is
    /// verity-enabled. Size and times are returned verbatim; only
    /// mode, owner, group and type are covered by the tree.
    pub fn stat(&self) -> Result<LowerStat> {
        let stat = self.data_fd.stat()?;
        if self.fs.verity_enabled(&self.d) {
            let _verity = self
                .fs
                .verity_mu
                .read()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            self.fs.verify_stat(&self.d, stat)?;
        }
        Ok(stat)
    }

    pub fn set_stat(&self, _stat: LowerStat) -> Result<()> {
        Err(Error::ReadOnly)
    }

    pub fn write_at(&self, _buf: &[u8], _offset: u64) -> Result<usize> {
        Err(Error::ReadOnly)
    }

    /// Dispatches an ioctl command. Only the three verity commands are
    /// recognized.
    pub fn ioctl(&self, cmd: u32, arg: IoctlArg<'_>) -> Result<()> {
        match cmd {
            FS_IOC_ENABLE_VERITY => match arg {
                IoctlArg::None => self.enable_verity(),
                _ => Err(Error::InvalidArgument(
                    "FS_IOC_ENABLE_VERITY takes no argument".to_owned(),
                )),
            },
            FS_IOC_MEASURE_VERITY => match arg {
                IoctlArg::Digest(digest) => self.measure_verity(digest),
                _ => Err(Error::InvalidArgument(
                    "FS_IOC_MEASURE_VERITY needs a digest buffer".to_owned(),
                )),
            },
            FS_IOC_GETFLAGS => match arg {
                IoctlArg::Flags(flags) => {
                    *flags = self.verity_flags();
                    Ok(())
                }
                _ => Err(Error::InvalidArgument(
                    "FS_IOC_GETFLAGS needs a flags buffer".to_owned(),
                )),
            },
            _ => Err(Error::NotImplemented),
        }
    }

    /// Builds the Merkle tree for this file or directory, anchors its
    /// root hash in the parent's Merkle file and records the xattrs.
    ///
    /// Runs under an exclusive hold of the filesystem-wide verity
    /// lock: directory trees are built over their children's hashes,
    /// so exactly one build may run at a time. Callers enable
    /// bottom-up, children before parents.
    pub fn enable_verity(&self) -> Result<()> {
        if !self.fs.allow_runtime_enable() {
            return Err(Error::NotPermitted);
        }

        let _verity = self
            .fs
            .verity_mu
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        if !self.d.hash().is_empty() {
            return Err(Error::AlreadyEnabled);
        }

        // In runtime enable mode every descriptor carries the Merkle
        // writer, and all but the root carry the parent writer. A gap
        // here means the descriptor state is inconsistent with the
        // mount.
        let Some(merkle_writer) = self.merkle_writer.as_deref() else {
            return Err(self.fs.violation("enable without a merkle writer"));
        };
        if self.parent_merkle_writer.is_none() && !self.d.is_root() {
            return Err(self.fs.violation("enable without a parent merkle writer"));
        }

        let stat = self.data_fd.stat()?;
        let (data_fd, size, same_file) = if stat.is_regular() {
            (self.data_fd.as_ref(), stat.size, false)
        } else if stat.is_dir() {
            // A directory's data is its children's hashes, already
            // appended to the front of its Merkle file by earlier
            // child enables.
            (self.merkle_reader.as_ref(), self.merkle_reader.stat()?.size, true)
        } else {
            // The overlay itself never opens symlinks, but a lower
            // backend can hand out descriptors for other special
            // files; no such type carries a tree.
            return Err(Error::InvalidArgument(
                "verity can only be enabled on regular files and directories".to_owned(),
            ));
        };

        let data: &dyn LowerFd = data_fd;
        let mut tree: &dyn LowerFd = merkle_writer;
        let root_hash = merkle::generate(&mut merkle::GenerateParams {
            data: &data,
            size,
            name: self.d.name(),
            mode: stat.mode,
            uid: stat.uid,
            gid: stat.gid,
            tree: &mut tree,
            data_and_tree_in_same_file: same_file,
        })?;

        if let Some(parent_writer) = self.parent_merkle_writer.as_deref() {
            // The parent writer is in append mode; the current size is
            // where the hash lands.
            let append_offset = parent_writer.stat()?.size;
            let mut writer: &dyn LowerFd = parent_writer;
            merkle::Append::append(&mut writer, &root_hash)?;
            merkle_writer.setxattr(MERKLE_OFFSET_XATTR, &append_offset.to_string())?;
        }
        merkle_writer.setxattr(MERKLE_SIZE_XATTR, &size.to_string())?;

        self.d.set_hash(root_hash.clone());
        tracing::debug!(
            name = %self.d.name(),
            root = %hex::encode(&root_hash),
            size,
            "enabled verity"
        );
        Ok(())
    }

    /// Copies the dentry hash out as a digest. `digest.size` is the
    /// caller's buffer capacity going in and the digest length coming
    /// out.
    pub fn measure_verity(&self, digest: &mut VerityDigest) -> Result<()> {
        let hash = self.d.hash();
        if hash.is_empty() {
            // Without runtime enable every reachable file must carry a
            // hash; an empty one cannot be a benign state.
            if self.fs.allow_runtime_enable() {
                return Err(Error::NoData);
            }
            return Err(self
                .fs
                .violation(format!("no hash found for {:?}", self.d.name())));
        }
        if (digest.size as usize) < hash.len() {
            return Err(Error::BufferTooSmall);
        }
        digest.algorithm = VERITY_HASH_ALG_SHA256;
        digest.size = hash.len() as u16;
        digest.digest.clear();
        digest.digest.extend_from_slice(&hash);
        Ok(())
    }

    /// Inode flags: `FS_VERITY_FL` iff enabled. Not settable.
    pub fn verity_flags(&self) -> u32 {
        if self.d.hash().is_empty() { 0 } else { FS_VERITY_FL }
    }

    // Advisory locks forward to the data file untouched; they carry no
    // integrity weight.
    pub fn lock_posix(&self, owner: u64, kind: LockKind, range: LockRange) -> Result<()> {
        self.data_fd.lock_posix(owner, kind, range)
    }

    pub fn unlock_posix(&self, owner: u64, range: LockRange) -> Result<()> {
        self.data_fd.unlock_posix(owner, range)
    }
}

impl Drop for FileDescription {
    fn drop(&mut self) {
        self.d.dec_ref(&self.fs);
    }
}
