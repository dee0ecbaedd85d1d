//! Configuration layer: the persisted section store, per-remote VFS option
//! overrides, and the password obscuring passthrough.
//!
//! Submodules:
//! - `store`: section/key persistence with load/save and legacy migration
//! - `options`: `VfsOptions` defaults, override validation and rendering
//! - `obscure`: reversible password encoding

pub mod obscure;
pub mod options;
pub mod store;

pub use options::{CacheMode, VfsOptions};
pub use store::{ConfigStore, section_for_remote};

use std::io;

/// Reserved key prefix for options this crate stores inside a remote's
/// config section.
pub const CUSTOM_OPT_PREFIX: &str = "docfs:";

/// Prefix namespacing per-remote VFS option overrides.
pub const VFS_OPT_PREFIX: &str = "docfs:vfs:";

/// Deprecated boolean flag replaced by the `cache_mode` override.
pub(crate) const LEGACY_VFS_CACHING_KEY: &str = "docfs:vfs_caching";

/// Configuration failure: bad overrides, migration problems, or store I/O.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config file not found")]
    NotFound,
    #[error("unknown VFS option {0:?}")]
    UnknownOption(String),
    #[error("VFS option {0:?} must not be empty")]
    EmptyValue(String),
    #[error("invalid value {value:?} for {key:?}: {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },
    #[error("invalid obscured password: {0}")]
    Obscured(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
