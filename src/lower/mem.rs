//! In-memory lower filesystem.
//!
//! Backs the overlay in tests and anywhere a real host directory is
//! unwanted. Since this *is* the lower layer, its direct mutation
//! helpers model out-of-band modification: writing through them after
//! a tree was built is exactly the tampering the overlay exists to
//! catch.

use std::collections::BTreeMap;
use std::io;
use std::sync::{Arc, Mutex, PoisonError};

use crate::error::{Error, Result};

use super::lock::{LockKind, LockRange, LockTable};
use super::{LowerFd, LowerFs, LowerStat, OpenFlags, S_IFDIR, S_IFLNK, S_IFMT, S_IFREG, Vd};

#[derive(Debug, Clone, Copy)]
struct Meta {
    mode: u32,
    uid: u32,
    gid: u32,
}

#[derive(Debug)]
enum NodeKind {
    File { data: Mutex<Vec<u8>> },
    Dir { children: Mutex<BTreeMap<String, Arc<Node>>> },
    Symlink { target: String },
}

#[derive(Debug)]
struct Node {
    meta: Mutex<Meta>,
    xattrs: Mutex<BTreeMap<String, String>>,
    locks: LockTable,
    kind: NodeKind,
}

impl Node {
    fn new(mode: u32, kind: NodeKind) -> Arc<Node> {
        Arc::new(Node {
            meta: Mutex::new(Meta {
                mode,
                uid: 0,
                gid: 0,
            }),
            xattrs: Mutex::new(BTreeMap::new()),
            locks: LockTable::new(),
            kind,
        })
    }

    fn meta(&self) -> Meta {
        *self.meta.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn stat(&self) -> LowerStat {
        let meta = self.meta();
        let size = match &self.kind {
            NodeKind::File { data } => {
                data.lock().unwrap_or_else(PoisonError::into_inner).len() as u64
            }
            NodeKind::Dir { .. } => 0,
            NodeKind::Symlink { target } => target.len() as u64,
        };
        LowerStat {
            mode: meta.mode,
            uid: meta.uid,
            gid: meta.gid,
            size,
        }
    }

    fn children(&self) -> Result<&Mutex<BTreeMap<String, Arc<Node>>>> {
        match &self.kind {
            NodeKind::Dir { children } => Ok(children),
            _ => Err(Error::NotDirectory),
        }
    }
}

/// An in-memory tree of files, directories and symlinks.
pub struct MemFs {
    root: Arc<Node>,
}

impl Default for MemFs {
    fn default() -> Self {
        MemFs::new()
    }
}

impl MemFs {
    pub fn new() -> Self {
        MemFs {
            root: Node::new(S_IFDIR | 0o755, NodeKind::Dir {
                children: Mutex::new(BTreeMap::new()),
            }),
        }
    }

    fn walk(&self, path: &str) -> Result<Arc<Node>> {
        let mut cur = Arc::clone(&self.root);
        for comp in super::split_components(path)? {
            let next = {
                let children = cur.children()?;
                let children = children.lock().unwrap_or_else(PoisonError::into_inner);
                children.get(comp).cloned().ok_or(Error::NotFound)?
            };
            cur = next;
        }
        Ok(cur)
    }

    fn node_at(&self, vd: &Vd) -> Result<Arc<Node>> {
        self.walk(&vd.path().to_string_lossy())
    }

    /// Splits `path` into its parent directory node and final name.
    fn parent_of(&self, path: &str) -> Result<(Arc<Node>, String)> {
        let comps = super::split_components(path)?;
        let (name, dir) = comps
            .split_last()
            .ok_or_else(|| Error::InvalidArgument("empty path".to_owned()))?;
        let mut cur = Arc::clone(&self.root);
        for comp in dir {
            let next = {
                let children = cur.children()?;
                let children = children.lock().unwrap_or_else(PoisonError::into_inner);
                children.get(*comp).cloned().ok_or(Error::NotFound)?
            };
            cur = next;
        }
        Ok((cur, (*name).to_owned()))
    }

    fn insert(&self, path: &str, node: Arc<Node>) -> Result<()> {
        let (parent, name) = self.parent_of(path)?;
        let children = parent.children()?;
        let mut children = children.lock().unwrap_or_else(PoisonError::into_inner);
        if children.contains_key(&name) {
            return Err(Error::InvalidArgument(format!("{path:?} already exists")));
        }
        children.insert(name, node);
        Ok(())
    }

    /// Creates a directory. The parent must already exist.
    pub fn mkdir(&self, path: &str, perm: u32) -> Result<()> {
        self.insert(
            path,
            Node::new(S_IFDIR | (perm & !S_IFMT), NodeKind::Dir {
                children: Mutex::new(BTreeMap::new()),
            }),
        )
    }

    /// Creates a regular file, or replaces the content of an existing
    /// one in place (metadata and xattrs are kept).
    pub fn put_file(&self, path: &str, perm: u32, content: &[u8]) -> Result<()> {
        if let Ok(node) = self.walk(path) {
            match &node.kind {
                NodeKind::File { data } => {
                    *data.lock().unwrap_or_else(PoisonError::into_inner) = content.to_vec();
                    return Ok(());
                }
                _ => {
                    return Err(Error::InvalidArgument(format!(
                        "{path:?} is not a regular file"
                    )));
                }
            }
        }
        self.insert(
            path,
            Node::new(S_IFREG | (perm & !S_IFMT), NodeKind::File {
                data: Mutex::new(content.to_vec()),
            }),
        )
    }

    pub fn symlink(&self, path: &str, target: &str) -> Result<()> {
        self.insert(
            path,
            Node::new(S_IFLNK | 0o777, NodeKind::Symlink {
                target: target.to_owned(),
            }),
        )
    }

    /// Overwrites bytes at `offset`, growing the file if needed.
    pub fn write_file_at(&self, path: &str, offset: u64, bytes: &[u8]) -> Result<()> {
        let node = self.walk(path)?;
        match &node.kind {
            NodeKind::File { data } => {
                let mut data = data.lock().unwrap_or_else(PoisonError::into_inner);
                let end = offset as usize + bytes.len();
                if data.len() < end {
                    data.resize(end, 0);
                }
                data[offset as usize..end].copy_from_slice(bytes);
                Ok(())
            }
            _ => Err(Error::InvalidArgument(format!(
                "{path:?} is not a regular file"
            ))),
        }
    }

    pub fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        let node = self.walk(path)?;
        match &node.kind {
            NodeKind::File { data } => {
                Ok(data.lock().unwrap_or_else(PoisonError::into_inner).clone())
            }
            _ => Err(Error::InvalidArgument(format!(
                "{path:?} is not a regular file"
            ))),
        }
    }

    /// Removes an entry from its parent directory.
    pub fn remove(&self, path: &str) -> Result<()> {
        let (parent, name) = self.parent_of(path)?;
        let children = parent.children()?;
        let mut children = children.lock().unwrap_or_else(PoisonError::into_inner);
        children.remove(&name).map(|_| ()).ok_or(Error::NotFound)
    }

    pub fn chmod(&self, path: &str, perm: u32) -> Result<()> {
        let node = self.walk(path)?;
        let mut meta = node.meta.lock().unwrap_or_else(PoisonError::into_inner);
        meta.mode = (meta.mode & S_IFMT) | (perm & !S_IFMT);
        Ok(())
    }

    pub fn chown(&self, path: &str, uid: u32, gid: u32) -> Result<()> {
        let node = self.walk(path)?;
        let mut meta = node.meta.lock().unwrap_or_else(PoisonError::into_inner);
        meta.uid = uid;
        meta.gid = gid;
        Ok(())
    }

    pub fn set_xattr(&self, path: &str, name: &str, value: &str) -> Result<()> {
        let node = self.walk(path)?;
        node.xattrs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_owned(), value.to_owned());
        Ok(())
    }
}

fn xattr_get(node: &Node, name: &str, max_len: usize) -> Result<String> {
    let xattrs = node.xattrs.lock().unwrap_or_else(PoisonError::into_inner);
    let value = xattrs.get(name).cloned().ok_or(Error::NoAttr)?;
    if value.len() > max_len {
        return Err(Error::Io(io::Error::other(format!(
            "xattr {name} exceeds {max_len} bytes"
        ))));
    }
    Ok(value)
}

impl LowerFs for MemFs {
    fn lookup(&self, start: &Vd, path: &str) -> Result<Vd> {
        let mut vd = start.clone();
        for comp in super::split_components(path)? {
            vd = vd.join(comp);
        }
        self.node_at(&vd)?;
        Ok(vd)
    }

    fn open(&self, start: &Vd, path: &str, flags: OpenFlags, mode: u32) -> Result<Box<dyn LowerFd>> {
        let mut vd = start.clone();
        for comp in super::split_components(path)? {
            vd = vd.join(comp);
        }
        let node = match self.node_at(&vd) {
            Ok(node) => node,
            Err(Error::NotFound) if flags.create => {
                let path = vd.path().to_string_lossy().into_owned();
                self.insert(
                    &path,
                    Node::new(S_IFREG | (mode & !S_IFMT), NodeKind::File {
                        data: Mutex::new(Vec::new()),
                    }),
                )?;
                self.node_at(&vd)?
            }
            Err(e) => return Err(e),
        };
        if flags.write && matches!(node.kind, NodeKind::Dir { .. }) {
            return Err(Error::Io(io::Error::from(io::ErrorKind::IsADirectory)));
        }
        Ok(Box::new(MemFd { node, flags }))
    }

    fn stat(&self, vd: &Vd) -> Result<LowerStat> {
        Ok(self.node_at(vd)?.stat())
    }

    fn getxattr(&self, vd: &Vd, name: &str, max_len: usize) -> Result<String> {
        xattr_get(&*self.node_at(vd)?, name, max_len)
    }

    fn readlink(&self, vd: &Vd) -> Result<String> {
        match &self.node_at(vd)?.kind {
            NodeKind::Symlink { target } => Ok(target.clone()),
            _ => Err(Error::InvalidArgument("not a symlink".to_owned())),
        }
    }
}

struct MemFd {
    node: Arc<Node>,
    flags: OpenFlags,
}

impl LowerFd for MemFd {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        if !self.flags.read {
            return Err(Error::Io(io::Error::from(io::ErrorKind::PermissionDenied)));
        }
        match &self.node.kind {
            NodeKind::File { data } => {
                let data = data.lock().unwrap_or_else(PoisonError::into_inner);
                if offset >= data.len() as u64 {
                    return Ok(0);
                }
                let avail = &data[offset as usize..];
                let n = buf.len().min(avail.len());
                buf[..n].copy_from_slice(&avail[..n]);
                Ok(n)
            }
            NodeKind::Dir { .. } => Err(Error::Io(io::Error::from(io::ErrorKind::IsADirectory))),
            NodeKind::Symlink { .. } => {
                Err(Error::Io(io::Error::from(io::ErrorKind::InvalidInput)))
            }
        }
    }

    fn write(&self, buf: &[u8]) -> Result<usize> {
        if !self.flags.write {
            return Err(Error::Io(io::Error::from(io::ErrorKind::PermissionDenied)));
        }
        if !self.flags.append {
            // Only append-mode writers exist in this overlay.
            return Err(Error::Io(io::Error::from(io::ErrorKind::Unsupported)));
        }
        match &self.node.kind {
            NodeKind::File { data } => {
                data.lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .extend_from_slice(buf);
                Ok(buf.len())
            }
            _ => Err(Error::Io(io::Error::from(io::ErrorKind::InvalidInput))),
        }
    }

    fn stat(&self) -> Result<LowerStat> {
        Ok(self.node.stat())
    }

    fn getxattr(&self, name: &str, max_len: usize) -> Result<String> {
        xattr_get(&self.node, name, max_len)
    }

    fn setxattr(&self, name: &str, value: &str) -> Result<()> {
        self.node
            .xattrs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_owned(), value.to_owned());
        Ok(())
    }

    fn lock_posix(&self, owner: u64, kind: LockKind, range: LockRange) -> Result<()> {
        self.node.locks.lock(owner, kind, range)
    }

    fn unlock_posix(&self, owner: u64, range: LockRange) -> Result<()> {
        self.node.locks.unlock(owner, range)
    }
}
