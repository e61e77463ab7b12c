//! Mount options for a verity overlay.
//!
//! Options are plain data, deserializable from TOML. The root hash is
//! carried as a hex string at the serde boundary and decoded on demand,
//! the same way commit hashes travel through metadata files.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Configuration for one overlay mount. Set once at construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountOptions {
    /// Name of the root Merkle tree file, relative to the lower root.
    /// The file itself is `.merkle.verity.<root_merkle_file_name>`.
    pub root_merkle_file_name: String,

    /// Which lower backend to wrap ("mem" or "disk").
    pub lower_name: String,

    /// Backend-specific options, a TOML fragment handed to the lower
    /// backend's constructor untouched.
    #[serde(default)]
    pub lower_options: String,

    /// Expected hash of the root directory, hex encoded. May be empty
    /// only when `allow_runtime_enable` is set.
    #[serde(default)]
    pub root_hash: String,

    /// Whether `FS_IOC_ENABLE_VERITY` may build new Merkle trees at
    /// runtime. When false, only entries whose trees existed before the
    /// mount can be served.
    #[serde(default)]
    pub allow_runtime_enable: bool,

    /// Violation policy: abort the process on an integrity violation
    /// instead of returning an error. Production mounts want this on;
    /// tests leave it off.
    #[serde(default)]
    pub panic_on_violation: bool,
}

impl MountOptions {
    /// Parses mount options from a TOML document.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| Error::InvalidArgument(format!("bad mount options: {e}")))
    }

    /// Decodes the configured root hash.
    pub fn root_hash_bytes(&self) -> Result<Vec<u8>> {
        hex::decode(&self.root_hash)
            .map_err(|e| Error::InvalidArgument(format!("bad root hash: {e}")))
    }
}
