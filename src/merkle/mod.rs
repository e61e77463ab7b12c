//! Fixed-layout Merkle tree codec over a byte stream.
//!
//! Data is partitioned into page-sized blocks. Level 0 of the tree
//! stores the hash of every data block; each level above stores the
//! hashes of the blocks of the level below, packed into blocks of the
//! same size, until a level fits in a single block. The tree file
//! stores the levels top-down: the root-level block first, level 0
//! last.
//!
//! Two physical layouts exist. For regular files the data file is
//! untouched and the tree file holds only tree levels. For directories
//! the "data" is the list of child hashes already at the start of the
//! tree file, and the levels follow the data region, aligned to a block
//! boundary.
//!
//! The root digest mixes the entry's identity (name, mode, uid, gid)
//! with the root block hash, so identical bytes at different paths or
//! with different ownership produce distinct roots. The exact
//! descriptor layout is part of the on-disk contract and must match
//! between [`generate`] and [`verify`].

#[cfg(test)]
pub mod tests;

use sha2::{Digest, Sha256};
use std::io::Write;

use crate::error::{Error, Result};

/// Tree block size in bytes. Matches the host page size.
pub const BLOCK_SIZE: u64 = 4096;

/// Digest length of the mount-time hash algorithm (SHA-256).
pub const DIGEST_SIZE: usize = 32;

/// Hash entries that fit in one tree block.
const HASHES_PER_BLOCK: u64 = BLOCK_SIZE / DIGEST_SIZE as u64;

/// Positional reader over a data or tree stream.
pub trait ReadAt {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize>;
}

/// Append-only sink the generated tree is written to.
pub trait Append {
    fn append(&mut self, buf: &[u8]) -> Result<()>;
}

fn slice_read_at(src: &[u8], buf: &mut [u8], offset: u64) -> usize {
    if offset >= src.len() as u64 {
        return 0;
    }
    let avail = &src[offset as usize..];
    let n = buf.len().min(avail.len());
    buf[..n].copy_from_slice(&avail[..n]);
    n
}

impl ReadAt for &[u8] {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        Ok(slice_read_at(self, buf, offset))
    }
}

impl ReadAt for Vec<u8> {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        Ok(slice_read_at(self, buf, offset))
    }
}

impl Append for Vec<u8> {
    fn append(&mut self, buf: &[u8]) -> Result<()> {
        self.extend_from_slice(buf);
        Ok(())
    }
}

/// Block and level offset arithmetic for one tree.
///
/// Levels are numbered from the leaves up: level 0 holds the data-block
/// hashes, the highest level is the single root block. The file stores
/// them in the opposite order.
#[derive(Debug, Clone)]
pub struct Layout {
    data_size: u64,
    tree_start: u64,
    /// Tree blocks per level, leaf level first. Never empty.
    level_blocks: Vec<u64>,
}

impl Layout {
    pub fn new(data_size: u64, data_and_tree_in_same_file: bool) -> Self {
        let tree_start = if data_and_tree_in_same_file {
            data_size.div_ceil(BLOCK_SIZE) * BLOCK_SIZE
        } else {
            0
        };

        // A zero-length input still gets one level over one zero block.
        let mut entries = data_size.div_ceil(BLOCK_SIZE).max(1);
        let mut level_blocks = Vec::new();
        loop {
            let blocks = entries.div_ceil(HASHES_PER_BLOCK);
            level_blocks.push(blocks);
            if blocks == 1 {
                break;
            }
            entries = blocks;
        }

        Layout {
            data_size,
            tree_start,
            level_blocks,
        }
    }

    pub fn num_levels(&self) -> usize {
        self.level_blocks.len()
    }

    /// Byte offset of the first block of `level` in the tree file.
    /// Levels above it are stored before it.
    pub fn level_offset(&self, level: usize) -> u64 {
        let above: u64 = self.level_blocks[level + 1..].iter().sum();
        self.tree_start + above * BLOCK_SIZE
    }

    /// Total size of the tree region in bytes.
    pub fn tree_size(&self) -> u64 {
        self.level_blocks.iter().sum::<u64>() * BLOCK_SIZE
    }

    fn num_data_blocks(&self) -> u64 {
        self.data_size.div_ceil(BLOCK_SIZE).max(1)
    }
}

/// Hashes one block, zero-padded to the block size.
fn hash_block(block: &[u8]) -> [u8; DIGEST_SIZE] {
    debug_assert!(block.len() as u64 <= BLOCK_SIZE);
    static ZEROS: [u8; BLOCK_SIZE as usize] = [0u8; BLOCK_SIZE as usize];
    let mut hasher = Sha256::new();
    hasher.update(block);
    hasher.update(&ZEROS[..BLOCK_SIZE as usize - block.len()]);
    hasher.finalize().into()
}

/// Computes the identity-mixed root digest from the root block hash.
///
/// Descriptor layout (frozen): name bytes, then mode, uid and gid as
/// big-endian u32, then the root block hash.
fn root_digest(
    name: &str,
    mode: u32,
    uid: u32,
    gid: u32,
    root_block_hash: &[u8; DIGEST_SIZE],
) -> [u8; DIGEST_SIZE] {
    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    hasher.update(mode.to_be_bytes());
    hasher.update(uid.to_be_bytes());
    hasher.update(gid.to_be_bytes());
    hasher.update(root_block_hash);
    hasher.finalize().into()
}

/// Reads exactly `buf.len()` bytes at `offset`, failing with
/// [`Error::MalformedTree`] on a short read.
fn read_full_at(src: &dyn ReadAt, buf: &mut [u8], offset: u64, what: &str) -> Result<()> {
    let mut done = 0;
    while done < buf.len() {
        let n = src.read_at(&mut buf[done..], offset + done as u64)?;
        if n == 0 {
            return Err(Error::MalformedTree(format!(
                "short read of {what} at offset {}: wanted {} bytes, got {done}",
                offset,
                buf.len()
            )));
        }
        done += n;
    }
    Ok(())
}

/// Input to [`generate`].
pub struct GenerateParams<'a> {
    /// The data stream being hashed. For the same-file layout this is
    /// the tree file itself, whose data region starts at offset zero.
    pub data: &'a dyn ReadAt,
    /// Length of the data in bytes.
    pub size: u64,
    /// Identity mixed into the root digest.
    pub name: &'a str,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    /// Sink the tree is appended to. For the same-file layout the sink
    /// must already be positioned at the end of the data region.
    pub tree: &'a mut dyn Append,
    pub data_and_tree_in_same_file: bool,
}

/// Builds the Merkle tree over `params.data` and writes it to
/// `params.tree`, top level first. Returns the identity-mixed root
/// digest.
pub fn generate(params: &mut GenerateParams<'_>) -> Result<Vec<u8>> {
    let layout = Layout::new(params.size, params.data_and_tree_in_same_file);

    // Level 0: hash every data block. The final block may be short and
    // is padded; a zero-length input hashes one all-zero block.
    let num_blocks = layout.num_data_blocks();
    let mut current: Vec<[u8; DIGEST_SIZE]> = Vec::with_capacity(num_blocks as usize);
    let mut block = vec![0u8; BLOCK_SIZE as usize];
    for i in 0..num_blocks {
        let offset = i * BLOCK_SIZE;
        let want = (params.size.saturating_sub(offset)).min(BLOCK_SIZE) as usize;
        read_full_at(params.data, &mut block[..want], offset, "data")?;
        current.push(hash_block(&block[..want]));
    }

    // Upper levels: hash the serialized blocks of the level below until
    // a level fits in one block.
    let mut levels: Vec<Vec<[u8; DIGEST_SIZE]>> = vec![current];
    while levels.last().map_or(0, Vec::len) as u64 > HASHES_PER_BLOCK {
        let below = levels.last().expect("levels is never empty");
        let mut next = Vec::with_capacity(below.len().div_ceil(HASHES_PER_BLOCK as usize));
        for chunk in below.chunks(HASHES_PER_BLOCK as usize) {
            next.push(hash_block(chunk.concat().as_slice()));
        }
        levels.push(next);
    }
    debug_assert_eq!(levels.len(), layout.num_levels());

    let top = levels.last().expect("levels is never empty");
    let root_block_hash = hash_block(top.concat().as_slice());
    let digest = root_digest(
        params.name,
        params.mode,
        params.uid,
        params.gid,
        &root_block_hash,
    );

    // In the same-file layout the sink sits at the end of the data
    // region; pad out to the tree start first.
    if layout.tree_start > params.size {
        params
            .tree
            .append(&vec![0u8; (layout.tree_start - params.size) as usize])?;
    }

    // Emit levels top-down, each level padded to whole blocks.
    for level in levels.iter().rev() {
        for chunk in level.chunks(HASHES_PER_BLOCK as usize) {
            let mut out = chunk.concat();
            out.resize(BLOCK_SIZE as usize, 0);
            params.tree.append(&out)?;
        }
    }

    tracing::trace!(
        size = params.size,
        levels = layout.num_levels(),
        root = %hex::encode(digest),
        "generated merkle tree"
    );
    Ok(digest.to_vec())
}

/// Input to [`verify`].
pub struct VerifyParams<'a> {
    /// Sink for the verified bytes. Each block's slice of the
    /// requested range is written only after that block's hash chain
    /// checked out; a later block failing leaves earlier bytes in the
    /// sink with an error returned.
    pub out: &'a mut dyn Write,
    pub data: &'a dyn ReadAt,
    pub tree: &'a dyn ReadAt,
    /// Length of the hashed data in bytes.
    pub size: u64,
    /// Identity mixed into the root digest.
    pub name: &'a str,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub read_offset: u64,
    pub read_size: u64,
    /// The expected identity-mixed root digest.
    pub expected: &'a [u8],
    pub data_and_tree_in_same_file: bool,
}

/// Verifies the read range `[read_offset, read_offset + read_size)`
/// against the tree and the expected root digest, emitting exactly the
/// requested bytes to `params.out`. Returns the number of bytes
/// written.
///
/// The root block is authenticated on every call, even for an empty
/// range; a zero-length verify is the metadata check used at mount and
/// stat time.
pub fn verify(params: &mut VerifyParams<'_>) -> Result<u64> {
    if params.expected.len() != DIGEST_SIZE {
        return Err(Error::VerificationFailed(format!(
            "expected digest has length {}, want {DIGEST_SIZE}",
            params.expected.len()
        )));
    }

    let layout = Layout::new(params.size, params.data_and_tree_in_same_file);
    let top_level = layout.num_levels() - 1;

    // Authenticate the root block first. Everything below chains up to
    // this block, and metadata-only verifies stop here.
    let mut top_block = vec![0u8; BLOCK_SIZE as usize];
    read_full_at(
        params.tree,
        &mut top_block,
        layout.level_offset(top_level),
        "tree",
    )?;
    let digest = root_digest(
        params.name,
        params.mode,
        params.uid,
        params.gid,
        &hash_block(&top_block),
    );
    if digest.as_slice() != params.expected {
        return Err(Error::VerificationFailed(format!(
            "root digest mismatch: computed {}, expected {}",
            hex::encode(digest),
            hex::encode(params.expected)
        )));
    }

    // Clamp the range to the data size; reads at or past the end
    // verify the root only.
    let end = params
        .read_offset
        .saturating_add(params.read_size)
        .min(params.size);
    if params.read_offset >= end {
        return Ok(0);
    }

    let first_block = params.read_offset / BLOCK_SIZE;
    let last_block = end.div_ceil(BLOCK_SIZE);
    let mut written = 0u64;
    let mut data_block = vec![0u8; BLOCK_SIZE as usize];
    let mut tree_block = vec![0u8; BLOCK_SIZE as usize];

    for i in first_block..last_block {
        let block_off = i * BLOCK_SIZE;
        let want = (params.size - block_off).min(BLOCK_SIZE) as usize;
        read_full_at(params.data, &mut data_block[..want], block_off, "data")?;

        // Walk up the tree: at each level the running hash must match
        // the stored entry, then the covering tree block becomes the
        // next hash.
        let mut current = hash_block(&data_block[..want]);
        let mut index = i;
        for level in 0..layout.num_levels() {
            let block_index = index / HASHES_PER_BLOCK;
            let entry_index = (index % HASHES_PER_BLOCK) as usize;
            read_full_at(
                params.tree,
                &mut tree_block,
                layout.level_offset(level) + block_index * BLOCK_SIZE,
                "tree",
            )?;
            let entry = &tree_block[entry_index * DIGEST_SIZE..(entry_index + 1) * DIGEST_SIZE];
            if entry != current.as_slice() {
                return Err(Error::VerificationFailed(format!(
                    "hash mismatch for data block {i} at level {level}: computed {}, stored {}",
                    hex::encode(current),
                    hex::encode(entry)
                )));
            }
            current = hash_block(&tree_block);
            index = block_index;
        }

        // The chain ends at the root block, which was already
        // authenticated against the identity descriptor.
        if root_digest(params.name, params.mode, params.uid, params.gid, &current).as_slice()
            != params.expected
        {
            return Err(Error::VerificationFailed(format!(
                "root digest mismatch while verifying data block {i}"
            )));
        }

        // Surface only the requested slice of this block.
        let copy_start = params.read_offset.max(block_off) - block_off;
        let copy_end = end.min(block_off + BLOCK_SIZE) - block_off;
        params
            .out
            .write_all(&data_block[copy_start as usize..copy_end as usize])?;
        written += copy_end - copy_start;
    }

    Ok(written)
}
