//! Remote backend abstraction.
//!
//! A backend exposes one configured remote as open/list/stat/copy/move
//! primitives over paths relative to the remote root. Protocol
//! implementations live behind [`RemoteBackend`]; this crate ships a
//! local-disk backend and an in-memory backend.
//!
//! Submodules:
//! - `localfs`: local directory treated as a remote
//! - `memfs`: in-memory remote, primarily for tests

pub mod localfs;
pub mod memfs;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::BackendError;

/// Kind of a remote node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    File,
    Dir,
    Symlink,
}

/// Metadata for one remote node.
#[derive(Debug, Clone)]
pub struct NodeInfo {
    /// Leaf name; empty for the remote root.
    pub name: String,
    pub kind: NodeKind,
    pub size: u64,
    pub modified: SystemTime,
    /// Permission bits only; type bits are derived from `kind`.
    pub perms: u32,
}

impl NodeInfo {
    pub fn is_dir(&self) -> bool {
        self.kind == NodeKind::Dir
    }
}

/// Storage usage as far as the backend can report it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Usage {
    pub total: Option<u64>,
    pub used: Option<u64>,
    pub free: Option<u64>,
    pub objects: Option<u64>,
}

/// One configured remote.
///
/// Paths are relative to the remote root, `/`-separated, with no leading or
/// trailing slash; the empty path addresses the root itself. Implementations
/// must be safe to share across tasks.
#[async_trait]
pub trait RemoteBackend: Send + Sync + std::fmt::Debug {
    /// Remote identifier this backend serves, with the trailing colon.
    fn remote(&self) -> &str;

    /// Whether the remote accepts unbuffered sequential uploads.
    fn supports_streaming(&self) -> bool;

    fn supports_copy(&self) -> bool {
        false
    }

    fn supports_move(&self) -> bool {
        false
    }

    fn supports_about(&self) -> bool {
        false
    }

    /// Stat a node without following symlinks.
    async fn stat(&self, path: &str) -> Result<NodeInfo, BackendError>;

    /// List the children of a directory.
    async fn list(&self, path: &str) -> Result<Vec<NodeInfo>, BackendError>;

    async fn mkdir(&self, path: &str, perms: u32) -> Result<(), BackendError>;

    /// Remove an empty directory.
    async fn rmdir(&self, path: &str) -> Result<(), BackendError>;

    async fn remove_file(&self, path: &str) -> Result<(), BackendError>;

    /// Remove a directory and everything below it. This is a backend
    /// primitive, not client-side recursion.
    async fn purge(&self, path: &str) -> Result<(), BackendError>;

    /// Server-side move within this remote.
    async fn rename(&self, from: &str, to: &str) -> Result<(), BackendError>;

    /// Read up to `len` bytes at `offset`. A short or empty result at end
    /// of file is a valid outcome, not an error.
    async fn read_range(&self, path: &str, offset: u64, len: usize)
    -> Result<Bytes, BackendError>;

    /// Write a whole object, replacing any previous content.
    async fn put(&self, path: &str, data: Bytes) -> Result<(), BackendError>;

    /// Server-side copy within this remote.
    async fn copy_within(&self, _from: &str, _to: &str) -> Result<(), BackendError> {
        Err(BackendError::Unsupported)
    }

    async fn about(&self) -> Result<Usage, BackendError> {
        Err(BackendError::Unsupported)
    }
}

/// Creates backends from a remote's config section.
#[async_trait]
pub trait BackendFactory: Send + Sync {
    async fn new_backend(
        &self,
        remote: &str,
        section: &BTreeMap<String, String>,
    ) -> Result<Arc<dyn RemoteBackend>, BackendError>;
}

/// Factory for the backend types this crate ships.
///
/// The section's `type` key selects the implementation: `local` (requires
/// `root`) or `memory` (optional `streaming` flag).
pub struct StandardBackends;

#[async_trait]
impl BackendFactory for StandardBackends {
    async fn new_backend(
        &self,
        remote: &str,
        section: &BTreeMap<String, String>,
    ) -> Result<Arc<dyn RemoteBackend>, BackendError> {
        let kind = section
            .get("type")
            .ok_or_else(|| BackendError::Other(format!("{remote} has no backend type")))?;

        match kind.as_str() {
            "local" => {
                let root = section.get("root").ok_or_else(|| {
                    BackendError::Other(format!("{remote} local backend has no root"))
                })?;
                let backend = localfs::LocalFsBackend::new(remote, root).await?;
                Ok(Arc::new(backend))
            }
            "memory" => {
                let streaming = match section.get("streaming").map(String::as_str) {
                    None | Some("true") => true,
                    Some("false") => false,
                    Some(other) => {
                        return Err(BackendError::Other(format!(
                            "{remote} has invalid streaming flag {other:?}"
                        )));
                    }
                };
                Ok(Arc::new(memfs::MemBackend::new(remote, streaming)))
            }
            other => Err(BackendError::Other(format!(
                "unknown backend type {other:?} for {remote}"
            ))),
        }
    }
}

/// Canonical relative-path form: no leading, trailing, or doubled slashes.
pub(crate) fn normalize(path: &str) -> String {
    path.split('/')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

/// Join two relative paths in canonical form.
pub(crate) fn join_rel(base: &str, name: &str) -> String {
    let base = normalize(base);
    let name = normalize(name);
    if base.is_empty() {
        name
    } else if name.is_empty() {
        base
    } else {
        format!("{base}/{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_normalization() {
        assert_eq!(normalize("/a/b/"), "a/b");
        assert_eq!(normalize("a//b"), "a/b");
        assert_eq!(normalize(""), "");
        assert_eq!(normalize("/"), "");
    }

    #[test]
    fn relative_join() {
        assert_eq!(join_rel("", "x"), "x");
        assert_eq!(join_rel("a/b", "x"), "a/b/x");
        assert_eq!(join_rel("a/b", ""), "a/b");
        assert_eq!(join_rel("/a/", "/x/"), "a/x");
    }

    #[tokio::test]
    async fn factory_rejects_unknown_type() {
        let mut section = BTreeMap::new();
        section.insert("type".to_string(), "carrier-pigeon".to_string());
        let err = StandardBackends
            .new_backend("birds:", &section)
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Other(_)));
    }
}
