//! Verifs is a read-only integrity overlay for an arbitrary lower
//! filesystem.
//!
//! For every file or directory in the lower filesystem, a sibling Merkle
//! tree file (`.merkle.verity.<name>`) stores the tree whose root hash
//! attests to the entry's contents and identity. A single root hash,
//! supplied out of band at mount time, transitively anchors the whole
//! tree: path resolution verifies each component against its parent's
//! tree, and every read is verified block by block before a single byte
//! reaches the caller.
//!
//! The overlay is read-only, with one exception: when a mount allows
//! runtime enable, the `FS_IOC_ENABLE_VERITY` ioctl builds Merkle trees
//! on demand, bottom-up, so an unverified lower tree can be promoted to
//! a verified one without remounting.
//!
//! Any observation that contradicts the expected hash chain (tampered
//! data, a missing Merkle sibling, a corrupted xattr) is an integrity
//! violation; depending on mount policy it is either surfaced as an
//! error or aborts the process.

pub mod config;
pub mod error;
pub mod lower;
pub mod merkle;
pub mod overlay;

pub use config::MountOptions;
pub use error::{Error, Result};
pub use overlay::{Access, Credentials, Filesystem};
