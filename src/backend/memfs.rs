//! In-memory remote.
//!
//! Nodes live in a flat path-keyed map. Failures use the sentinel error
//! variants rather than native codes, matching how string-error remotes
//! behave, which makes this backend double as the translation-table
//! exerciser in tests.

use std::collections::BTreeMap;
use std::sync::RwLock;
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;

use super::{NodeInfo, NodeKind, RemoteBackend, Usage, normalize};
use crate::error::BackendError;

const FILE_PERMS: u32 = 0o644;
const DIR_PERMS: u32 = 0o755;

#[derive(Debug, Clone)]
enum MemNode {
    Dir,
    File { data: Bytes, modified: SystemTime },
}

#[derive(Debug)]
pub struct MemBackend {
    remote: String,
    streaming: bool,
    // Normalized path -> node; the root is implicit.
    nodes: RwLock<BTreeMap<String, MemNode>>,
}

impl MemBackend {
    pub fn new(remote: impl Into<String>, streaming: bool) -> Self {
        Self {
            remote: remote.into(),
            streaming,
            nodes: RwLock::new(BTreeMap::new()),
        }
    }

    fn info(path: &str, node: &MemNode) -> NodeInfo {
        let name = path.rsplit('/').next().unwrap_or_default().to_string();
        match node {
            MemNode::Dir => NodeInfo {
                name,
                kind: NodeKind::Dir,
                size: 0,
                modified: SystemTime::UNIX_EPOCH,
                perms: DIR_PERMS,
            },
            MemNode::File { data, modified } => NodeInfo {
                name,
                kind: NodeKind::File,
                size: data.len() as u64,
                modified: *modified,
                perms: FILE_PERMS,
            },
        }
    }

    fn parent_of(path: &str) -> String {
        match path.rfind('/') {
            Some(idx) => path[..idx].to_string(),
            None => String::new(),
        }
    }

    fn require_dir(
        nodes: &BTreeMap<String, MemNode>,
        path: &str,
    ) -> Result<(), BackendError> {
        if path.is_empty() {
            return Ok(());
        }
        match nodes.get(path) {
            Some(MemNode::Dir) => Ok(()),
            Some(MemNode::File { .. }) => Err(BackendError::IsFile),
            None => Err(BackendError::DirNotFound),
        }
    }

    fn children<'a>(
        nodes: &'a BTreeMap<String, MemNode>,
        path: &str,
    ) -> Vec<(&'a String, &'a MemNode)> {
        let prefix = if path.is_empty() {
            String::new()
        } else {
            format!("{path}/")
        };
        nodes
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .filter(|(key, _)| {
                let rest = &key[prefix.len()..];
                !rest.is_empty() && !rest.contains('/')
            })
            .collect()
    }
}

#[async_trait]
impl RemoteBackend for MemBackend {
    fn remote(&self) -> &str {
        &self.remote
    }

    fn supports_streaming(&self) -> bool {
        self.streaming
    }

    fn supports_copy(&self) -> bool {
        true
    }

    fn supports_move(&self) -> bool {
        true
    }

    fn supports_about(&self) -> bool {
        true
    }

    async fn stat(&self, path: &str) -> Result<NodeInfo, BackendError> {
        let path = normalize(path);
        if path.is_empty() {
            return Ok(Self::info("", &MemNode::Dir));
        }
        let nodes = self.nodes.read().unwrap();
        let node = nodes.get(&path).ok_or(BackendError::NotFound)?;
        Ok(Self::info(&path, node))
    }

    async fn list(&self, path: &str) -> Result<Vec<NodeInfo>, BackendError> {
        let path = normalize(path);
        let nodes = self.nodes.read().unwrap();
        Self::require_dir(&nodes, &path)?;

        Ok(Self::children(&nodes, &path)
            .into_iter()
            .map(|(key, node)| Self::info(key, node))
            .collect())
    }

    async fn mkdir(&self, path: &str, _perms: u32) -> Result<(), BackendError> {
        let path = normalize(path);
        if path.is_empty() {
            return Err(BackendError::AlreadyExists);
        }
        let mut nodes = self.nodes.write().unwrap();
        Self::require_dir(&nodes, &Self::parent_of(&path))?;
        if nodes.contains_key(&path) {
            return Err(BackendError::AlreadyExists);
        }
        nodes.insert(path, MemNode::Dir);
        Ok(())
    }

    async fn rmdir(&self, path: &str) -> Result<(), BackendError> {
        let path = normalize(path);
        let mut nodes = self.nodes.write().unwrap();
        match nodes.get(&path) {
            Some(MemNode::Dir) => {}
            Some(MemNode::File { .. }) => return Err(BackendError::IsFile),
            None => return Err(BackendError::DirNotFound),
        }
        if !Self::children(&nodes, &path).is_empty() {
            return Err(BackendError::DirectoryNotEmpty);
        }
        nodes.remove(&path);
        Ok(())
    }

    async fn remove_file(&self, path: &str) -> Result<(), BackendError> {
        let path = normalize(path);
        let mut nodes = self.nodes.write().unwrap();
        match nodes.get(&path) {
            Some(MemNode::File { .. }) => {
                nodes.remove(&path);
                Ok(())
            }
            Some(MemNode::Dir) => Err(BackendError::IsDir),
            None => Err(BackendError::ObjectNotFound),
        }
    }

    async fn purge(&self, path: &str) -> Result<(), BackendError> {
        let path = normalize(path);
        let mut nodes = self.nodes.write().unwrap();
        match nodes.get(&path) {
            Some(MemNode::Dir) => {}
            Some(MemNode::File { .. }) => return Err(BackendError::IsFile),
            None => return Err(BackendError::DirNotFound),
        }
        let prefix = format!("{path}/");
        nodes.retain(|key, _| key != &path && !key.starts_with(&prefix));
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), BackendError> {
        let from = normalize(from);
        let to = normalize(to);
        let mut nodes = self.nodes.write().unwrap();

        let source = nodes.get(&from).ok_or(BackendError::NotFound)?.clone();
        Self::require_dir(&nodes, &Self::parent_of(&to))?;

        match (&source, nodes.get(&to)) {
            (MemNode::File { .. }, Some(MemNode::Dir)) => return Err(BackendError::IsDir),
            (MemNode::Dir, Some(_)) => return Err(BackendError::AlreadyExists),
            _ => {}
        }

        if matches!(source, MemNode::Dir) {
            let from_prefix = format!("{from}/");
            let moved: Vec<(String, MemNode)> = nodes
                .range(from_prefix.clone()..)
                .take_while(|(key, _)| key.starts_with(&from_prefix))
                .map(|(key, node)| {
                    (
                        format!("{to}/{}", &key[from_prefix.len()..]),
                        node.clone(),
                    )
                })
                .collect();
            nodes.retain(|key, _| key != &from && !key.starts_with(&from_prefix));
            nodes.extend(moved);
            nodes.insert(to, MemNode::Dir);
        } else {
            nodes.remove(&from);
            nodes.insert(to, source);
        }

        Ok(())
    }

    async fn read_range(
        &self,
        path: &str,
        offset: u64,
        len: usize,
    ) -> Result<Bytes, BackendError> {
        let path = normalize(path);
        let nodes = self.nodes.read().unwrap();
        match nodes.get(&path) {
            Some(MemNode::File { data, .. }) => {
                let start = (offset as usize).min(data.len());
                let end = start.saturating_add(len).min(data.len());
                Ok(data.slice(start..end))
            }
            Some(MemNode::Dir) => Err(BackendError::IsDir),
            None => Err(BackendError::ObjectNotFound),
        }
    }

    async fn put(&self, path: &str, data: Bytes) -> Result<(), BackendError> {
        let path = normalize(path);
        if path.is_empty() {
            return Err(BackendError::IsDir);
        }
        let mut nodes = self.nodes.write().unwrap();
        if matches!(nodes.get(&path), Some(MemNode::Dir)) {
            return Err(BackendError::IsDir);
        }

        // Parents appear implicitly, like object stores behave.
        let mut parent = Self::parent_of(&path);
        while !parent.is_empty() {
            match nodes.get(&parent) {
                Some(MemNode::Dir) => break,
                Some(MemNode::File { .. }) => return Err(BackendError::IsFile),
                None => {
                    nodes.insert(parent.clone(), MemNode::Dir);
                    parent = Self::parent_of(&parent);
                }
            }
        }

        nodes.insert(
            path,
            MemNode::File {
                data,
                modified: SystemTime::now(),
            },
        );
        Ok(())
    }

    async fn copy_within(&self, from: &str, to: &str) -> Result<(), BackendError> {
        let from = normalize(from);
        let to = normalize(to);
        let mut nodes = self.nodes.write().unwrap();

        let data = match nodes.get(&from) {
            Some(MemNode::File { data, .. }) => data.clone(),
            Some(MemNode::Dir) => return Err(BackendError::IsDir),
            None => return Err(BackendError::ObjectNotFound),
        };
        if matches!(nodes.get(&to), Some(MemNode::Dir)) {
            return Err(BackendError::IsDir);
        }

        nodes.insert(
            to,
            MemNode::File {
                data,
                modified: SystemTime::now(),
            },
        );
        Ok(())
    }

    async fn about(&self) -> Result<Usage, BackendError> {
        let nodes = self.nodes.read().unwrap();
        let mut used = 0u64;
        let mut objects = 0u64;
        for node in nodes.values() {
            if let MemNode::File { data, .. } = node {
                used += data.len() as u64;
                objects += 1;
            }
        }
        Ok(Usage {
            used: Some(used),
            objects: Some(objects),
            ..Usage::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn list_of_file_is_not_a_directory() {
        let backend = MemBackend::new("mem:", true);
        backend.put("f", Bytes::from_static(b"x")).await.unwrap();

        let err = backend.list("f").await.unwrap_err();
        assert_eq!(err.errno(), Some(libc::ENOTDIR));
    }

    #[tokio::test]
    async fn rmdir_distinguishes_occupied_and_missing() {
        let backend = MemBackend::new("mem:", true);
        backend.mkdir("d", 0o755).await.unwrap();
        backend.put("d/f", Bytes::from_static(b"x")).await.unwrap();

        assert!(matches!(
            backend.rmdir("d").await,
            Err(BackendError::DirectoryNotEmpty)
        ));
        assert!(matches!(
            backend.rmdir("ghost").await,
            Err(BackendError::DirNotFound)
        ));

        backend.purge("d").await.unwrap();
        assert!(backend.list("d").await.is_err());
    }

    #[tokio::test]
    async fn rename_moves_whole_subtree() {
        let backend = MemBackend::new("mem:", true);
        backend.mkdir("a", 0o755).await.unwrap();
        backend.put("a/x/f", Bytes::from_static(b"1")).await.unwrap();
        backend.put("a/g", Bytes::from_static(b"2")).await.unwrap();

        backend.rename("a", "b").await.unwrap();

        assert!(backend.stat("a").await.is_err());
        assert_eq!(
            &backend.read_range("b/x/f", 0, 10).await.unwrap()[..],
            b"1"
        );
        assert_eq!(&backend.read_range("b/g", 0, 10).await.unwrap()[..], b"2");
    }

    #[tokio::test]
    async fn put_creates_implicit_parents() {
        let backend = MemBackend::new("mem:", true);
        backend
            .put("deep/nested/file", Bytes::from_static(b"x"))
            .await
            .unwrap();
        assert!(backend.stat("deep/nested").await.unwrap().is_dir());
    }

    #[tokio::test]
    async fn usage_counts_objects() {
        let backend = MemBackend::new("mem:", true);
        backend.put("a", Bytes::from_static(b"abc")).await.unwrap();
        backend.put("b", Bytes::from_static(b"de")).await.unwrap();

        let usage = backend.about().await.unwrap();
        assert_eq!(usage.used, Some(5));
        assert_eq!(usage.objects, Some(2));
    }
}
