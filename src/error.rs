//! Error taxonomy for the overlay.
//!
//! Everything the crate can fail with is a variant here; nothing is
//! recovered internally. Lower-filesystem I/O errors pass through as
//! [`Error::Io`].

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// An observation contradicted the expected hash chain: tampered
    /// data, a missing Merkle sibling, a malformed xattr, or an
    /// unexpected descriptor state during enable.
    #[error("integrity violation: {0}")]
    IntegrityViolation(String),

    /// Any mutation of the overlay other than the enable ioctl.
    #[error("filesystem is read-only")]
    ReadOnly,

    /// Enable was requested on a mount that does not allow it.
    #[error("operation not permitted")]
    NotPermitted,

    /// UNIX permission bits denied the access.
    #[error("permission denied")]
    PermissionDenied,

    /// Measure was called on a file that has not been enabled yet.
    #[error("no verity data")]
    NoData,

    /// The caller's digest buffer is smaller than the hash length.
    #[error("digest buffer too small")]
    BufferTooSmall,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Unrecognized ioctl command.
    #[error("not implemented")]
    NotImplemented,

    /// Enable was called on a file that already carries verity state.
    #[error("verity already enabled")]
    AlreadyEnabled,

    /// The lower filesystem has no entry at the given path.
    #[error("no such file or directory")]
    NotFound,

    /// The lower filesystem has no such extended attribute.
    #[error("no such extended attribute")]
    NoAttr,

    /// A path component other than the last is not a directory.
    #[error("not a directory")]
    NotDirectory,

    /// A recomputed hash did not match the tree-stored or expected
    /// value.
    #[error("verification failed: {0}")]
    VerificationFailed(String),

    /// The tree or data stream ended before the layout said it would.
    #[error("malformed merkle tree: {0}")]
    MalformedTree(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
