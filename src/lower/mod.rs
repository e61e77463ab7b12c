//! The lower filesystem wrapped by the overlay.
//!
//! The overlay never touches storage directly. Everything goes through
//! [`LowerFs`] (path-level operations) and [`LowerFd`] (per-open
//! operations), so the same overlay code runs over an in-memory tree in
//! tests and over a host directory in real deployments.

pub mod disk;
pub mod lock;
pub mod mem;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::merkle;

pub use lock::{LockKind, LockRange};

pub const S_IFMT: u32 = libc::S_IFMT as u32;
pub const S_IFREG: u32 = libc::S_IFREG as u32;
pub const S_IFDIR: u32 = libc::S_IFDIR as u32;
pub const S_IFLNK: u32 = libc::S_IFLNK as u32;

/// A handle naming one entry in a lower filesystem, relative to its
/// root. Cheap to clone; the overlay owns one per dentry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Vd {
    path: PathBuf,
}

impl Vd {
    pub fn root() -> Self {
        Vd {
            path: PathBuf::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn join(&self, name: &str) -> Self {
        Vd {
            path: self.path.join(name),
        }
    }
}

/// Metadata of one lower entry. The file type travels in the mode bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LowerStat {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
}

impl LowerStat {
    pub fn is_dir(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }

    pub fn is_regular(&self) -> bool {
        self.mode & S_IFMT == S_IFREG
    }

    pub fn is_symlink(&self) -> bool {
        self.mode & S_IFMT == S_IFLNK
    }
}

/// How to open a lower entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpenFlags {
    pub read: bool,
    pub write: bool,
    pub append: bool,
    pub create: bool,
}

impl OpenFlags {
    pub const READ: OpenFlags = OpenFlags {
        read: true,
        write: false,
        append: false,
        create: false,
    };

    /// Append-mode writer; every write lands at the current end.
    pub const APPEND: OpenFlags = OpenFlags {
        read: false,
        write: true,
        append: true,
        create: false,
    };

    /// Read handle, creating the file first if it does not exist.
    pub const CREATE_READ: OpenFlags = OpenFlags {
        read: true,
        write: false,
        append: false,
        create: true,
    };
}

/// Path-level operations on the lower filesystem.
///
/// `path` arguments are relative to `start` and may span several
/// components. An empty path names `start` itself.
pub trait LowerFs: Send + Sync {
    /// Resolves `path` to a handle. `Error::NotFound` if any component
    /// is missing.
    fn lookup(&self, start: &Vd, path: &str) -> Result<Vd>;

    /// Opens `path`, creating it with `mode` first if `flags.create`
    /// is set and it does not exist.
    fn open(&self, start: &Vd, path: &str, flags: OpenFlags, mode: u32) -> Result<Box<dyn LowerFd>>;

    fn stat(&self, vd: &Vd) -> Result<LowerStat>;

    /// Reads an extended attribute as a string. `Error::NoAttr` if the
    /// attribute is not set; values longer than `max_len` are an
    /// error.
    fn getxattr(&self, vd: &Vd, name: &str, max_len: usize) -> Result<String>;

    fn readlink(&self, vd: &Vd) -> Result<String>;
}

/// Per-open operations on a lower file.
pub trait LowerFd: Send + Sync {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize>;

    /// Writes `buf`, returning the number of bytes written. Append
    /// semantics when the file was opened append.
    fn write(&self, buf: &[u8]) -> Result<usize>;

    fn stat(&self) -> Result<LowerStat>;

    fn getxattr(&self, name: &str, max_len: usize) -> Result<String>;

    fn setxattr(&self, name: &str, value: &str) -> Result<()>;

    /// Takes a POSIX advisory lock on a byte range. Non-blocking; a
    /// conflicting lock fails with a `WouldBlock` I/O error.
    fn lock_posix(&self, owner: u64, kind: LockKind, range: LockRange) -> Result<()>;

    fn unlock_posix(&self, owner: u64, range: LockRange) -> Result<()>;
}

// The Merkle codec reads and appends through lower descriptors.
impl merkle::ReadAt for &dyn LowerFd {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        LowerFd::read_at(*self, buf, offset)
    }
}

impl merkle::Append for &dyn LowerFd {
    fn append(&mut self, mut buf: &[u8]) -> Result<()> {
        while !buf.is_empty() {
            let n = self.write(buf)?;
            if n == 0 {
                return Err(Error::Io(std::io::Error::from(
                    std::io::ErrorKind::WriteZero,
                )));
            }
            buf = &buf[n..];
        }
        Ok(())
    }
}

/// Constructs a lower backend from a mount-time name and an opaque
/// options string (a TOML fragment owned by the backend).
pub fn new_lower(name: &str, options: &str) -> Result<Arc<dyn LowerFs>> {
    match name {
        "mem" => Ok(Arc::new(mem::MemFs::new())),
        "disk" => Ok(Arc::new(disk::DiskFs::from_toml_str(options)?)),
        other => Err(Error::InvalidArgument(format!(
            "unknown lower filesystem {other:?}"
        ))),
    }
}

/// Splits a relative path into components. Empty components and `.`
/// are skipped; `..` is rejected, the layer above owns dot-dot
/// resolution.
pub(crate) fn split_components(path: &str) -> Result<Vec<&str>> {
    let mut out = Vec::new();
    for comp in path.split('/') {
        match comp {
            "" | "." => {}
            ".." => {
                return Err(Error::InvalidArgument(
                    "path escapes the lower root".to_owned(),
                ));
            }
            name => out.push(name),
        }
    }
    Ok(out)
}
