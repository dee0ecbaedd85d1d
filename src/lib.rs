//! POSIX-like document access over remote storage backends.
//!
//! Remotes are named storage endpoints; a doc string `<remote><path>`
//! addresses one node and doubles as its stable external ID. The crate
//! resolves docs to long-lived per-remote VFS instances, translates
//! heterogeneous backend failures into a small errno taxonomy, and keeps a
//! runtime-rebuildable trust store for outbound TLS.

pub mod backend;
pub mod config;
pub mod doc;
pub mod error;
pub mod ops;
pub mod tls;
pub mod transfer;
pub mod vfs;

pub use backend::{BackendFactory, NodeInfo, NodeKind, RemoteBackend, StandardBackends, Usage};
pub use config::{CacheMode, ConfigError, ConfigStore, VfsOptions};
pub use doc::ParseError;
pub use error::{BackendError, OpError, VfsError};
pub use ops::{Authorizer, DirEntry, DocBridge, DocFile, RpcDispatcher, RpcResult};
pub use tls::{TrustStore, TrustStorePaths};
pub use vfs::{FileHandle, Vfs, VfsCache};
