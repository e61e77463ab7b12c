//! Host-directory lower filesystem.
//!
//! Wraps a directory on the host, mapping lookups to paths under a
//! configured root, reads to positional file I/O and the Merkle xattrs
//! to real `user.*` extended attributes via rustix. The backing
//! filesystem must support user xattrs for verity state to stick.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write as _;
use std::os::unix::fs::{FileExt, MetadataExt};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use serde::Deserialize;

use crate::error::{Error, Result};

use super::lock::{LockKind, LockRange, LockTable};
use super::{LowerFd, LowerFs, LowerStat, OpenFlags, Vd};

#[derive(Debug, Clone, Deserialize)]
pub struct DiskOptions {
    /// Host directory serving as the lower root.
    pub root: PathBuf,
}

pub struct DiskFs {
    root: PathBuf,
    /// Advisory locks are kept in process, keyed by relative path.
    locks: Mutex<HashMap<PathBuf, Arc<LockTable>>>,
}

impl DiskFs {
    pub fn new(options: DiskOptions) -> Result<Self> {
        if !options.root.is_dir() {
            return Err(Error::InvalidArgument(format!(
                "lower root {:?} is not a directory",
                options.root
            )));
        }
        Ok(DiskFs {
            root: options.root,
            locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn from_toml_str(options: &str) -> Result<Self> {
        let opts: DiskOptions = toml::from_str(options)
            .map_err(|e| Error::InvalidArgument(format!("bad disk lower options: {e}")))?;
        DiskFs::new(opts)
    }

    fn host_path(&self, vd: &Vd) -> PathBuf {
        self.root.join(vd.path())
    }

    fn lock_table(&self, vd: &Vd) -> Arc<LockTable> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            locks
                .entry(vd.path().to_path_buf())
                .or_insert_with(|| Arc::new(LockTable::new())),
        )
    }
}

fn map_io(e: std::io::Error) -> Error {
    if e.kind() == std::io::ErrorKind::NotFound {
        Error::NotFound
    } else {
        Error::Io(e)
    }
}

fn map_errno(e: rustix::io::Errno) -> Error {
    if e == rustix::io::Errno::NODATA {
        Error::NoAttr
    } else if e == rustix::io::Errno::NOENT {
        Error::NotFound
    } else {
        Error::Io(e.into())
    }
}

fn stat_of(path: &Path) -> Result<LowerStat> {
    let meta = std::fs::symlink_metadata(path).map_err(map_io)?;
    Ok(LowerStat {
        mode: meta.mode(),
        uid: meta.uid(),
        gid: meta.gid(),
        size: meta.len(),
    })
}

impl LowerFs for DiskFs {
    fn lookup(&self, start: &Vd, path: &str) -> Result<Vd> {
        let mut vd = start.clone();
        for comp in super::split_components(path)? {
            vd = vd.join(comp);
        }
        std::fs::symlink_metadata(self.host_path(&vd)).map_err(map_io)?;
        Ok(vd)
    }

    fn open(&self, start: &Vd, path: &str, flags: OpenFlags, mode: u32) -> Result<Box<dyn LowerFd>> {
        let mut vd = start.clone();
        for comp in super::split_components(path)? {
            vd = vd.join(comp);
        }
        let host = self.host_path(&vd);
        let mut opts = OpenOptions::new();
        opts.read(flags.read)
            .write(flags.write)
            .append(flags.append);
        let file = match opts.open(&host) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && flags.create => {
                // std refuses O_CREAT on a read-only open, so create in
                // a separate step and reopen with the requested access.
                use std::os::unix::fs::OpenOptionsExt;
                OpenOptions::new()
                    .write(true)
                    .create(true)
                    .mode(mode)
                    .open(&host)
                    .map_err(map_io)?;
                opts.open(&host).map_err(map_io)?
            }
            Err(e) => return Err(map_io(e)),
        };
        Ok(Box::new(DiskFd {
            file,
            locks: self.lock_table(&vd),
        }))
    }

    fn stat(&self, vd: &Vd) -> Result<LowerStat> {
        stat_of(&self.host_path(vd))
    }

    fn getxattr(&self, vd: &Vd, name: &str, max_len: usize) -> Result<String> {
        let host = self.host_path(vd);
        let mut buf = vec![0u8; max_len];
        // The syscall fails with ERANGE by itself when the value does
        // not fit max_len.
        let n = rustix::fs::getxattr(&host, name, &mut buf[..]).map_err(map_errno)?;
        buf.truncate(n);
        String::from_utf8(buf)
            .map_err(|_| Error::Io(std::io::Error::other(format!("xattr {name} is not UTF-8"))))
    }

    fn readlink(&self, vd: &Vd) -> Result<String> {
        let target = std::fs::read_link(self.host_path(vd)).map_err(map_io)?;
        Ok(target.to_string_lossy().into_owned())
    }
}

struct DiskFd {
    file: File,
    locks: Arc<LockTable>,
}

impl LowerFd for DiskFd {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        self.file.read_at(buf, offset).map_err(Error::Io)
    }

    fn write(&self, buf: &[u8]) -> Result<usize> {
        (&self.file).write(buf).map_err(Error::Io)
    }

    fn stat(&self) -> Result<LowerStat> {
        let meta = self.file.metadata().map_err(Error::Io)?;
        Ok(LowerStat {
            mode: meta.mode(),
            uid: meta.uid(),
            gid: meta.gid(),
            size: meta.len(),
        })
    }

    fn getxattr(&self, name: &str, max_len: usize) -> Result<String> {
        let mut buf = vec![0u8; max_len];
        let n = rustix::fs::fgetxattr(&self.file, name, &mut buf[..]).map_err(map_errno)?;
        buf.truncate(n);
        String::from_utf8(buf)
            .map_err(|_| Error::Io(std::io::Error::other(format!("xattr {name} is not UTF-8"))))
    }

    fn setxattr(&self, name: &str, value: &str) -> Result<()> {
        rustix::fs::fsetxattr(
            &self.file,
            name,
            value.as_bytes(),
            rustix::fs::XattrFlags::empty(),
        )
        .map_err(map_errno)
    }

    fn lock_posix(&self, owner: u64, kind: LockKind, range: LockRange) -> Result<()> {
        self.locks.lock(owner, kind, range)
    }

    fn unlock_posix(&self, owner: u64, range: LockRange) -> Result<()> {
        self.locks.unlock(owner, range)
    }
}
