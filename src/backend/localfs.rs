//! Local directory treated as a remote.
//!
//! Every operation maps to `tokio::fs`; I/O errors keep their native OS
//! codes so errno translation passes them through verbatim.

use std::io::SeekFrom;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use super::{NodeInfo, NodeKind, RemoteBackend, normalize};
use crate::error::BackendError;

#[derive(Debug)]
pub struct LocalFsBackend {
    remote: String,
    root: PathBuf,
}

impl LocalFsBackend {
    /// Open a local backend rooted at `root`, which must be an existing
    /// directory.
    pub async fn new(
        remote: impl Into<String>,
        root: impl AsRef<Path>,
    ) -> Result<Self, BackendError> {
        let root = root.as_ref().to_path_buf();
        let meta = fs::metadata(&root).await?;
        if !meta.is_dir() {
            return Err(BackendError::IsFile);
        }

        Ok(Self {
            remote: remote.into(),
            root,
        })
    }

    fn abs(&self, path: &str) -> PathBuf {
        let rel = normalize(path);
        if rel.is_empty() {
            self.root.clone()
        } else {
            self.root.join(rel)
        }
    }
}

fn node_info(name: String, meta: &std::fs::Metadata) -> NodeInfo {
    let kind = if meta.file_type().is_dir() {
        NodeKind::Dir
    } else if meta.file_type().is_symlink() {
        NodeKind::Symlink
    } else {
        NodeKind::File
    };

    NodeInfo {
        name,
        kind,
        size: meta.len(),
        modified: meta.modified().unwrap_or(std::time::UNIX_EPOCH),
        perms: meta.permissions().mode() & 0o777,
    }
}

#[async_trait]
impl RemoteBackend for LocalFsBackend {
    fn remote(&self) -> &str {
        &self.remote
    }

    fn supports_streaming(&self) -> bool {
        true
    }

    fn supports_copy(&self) -> bool {
        true
    }

    fn supports_move(&self) -> bool {
        true
    }

    async fn stat(&self, path: &str) -> Result<NodeInfo, BackendError> {
        let abs = self.abs(path);
        let meta = fs::symlink_metadata(&abs).await?;
        let name = normalize(path)
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .to_string();
        Ok(node_info(name, &meta))
    }

    async fn list(&self, path: &str) -> Result<Vec<NodeInfo>, BackendError> {
        let mut dir = fs::read_dir(self.abs(path)).await?;
        let mut entries = Vec::new();

        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let meta = entry.metadata().await?;
            entries.push(node_info(name, &meta));
        }

        Ok(entries)
    }

    async fn mkdir(&self, path: &str, perms: u32) -> Result<(), BackendError> {
        let abs = self.abs(path);
        fs::create_dir(&abs).await?;
        fs::set_permissions(&abs, std::fs::Permissions::from_mode(perms & 0o777)).await?;
        Ok(())
    }

    async fn rmdir(&self, path: &str) -> Result<(), BackendError> {
        fs::remove_dir(self.abs(path)).await?;
        Ok(())
    }

    async fn remove_file(&self, path: &str) -> Result<(), BackendError> {
        fs::remove_file(self.abs(path)).await?;
        Ok(())
    }

    async fn purge(&self, path: &str) -> Result<(), BackendError> {
        fs::remove_dir_all(self.abs(path)).await?;
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), BackendError> {
        fs::rename(self.abs(from), self.abs(to)).await?;
        Ok(())
    }

    async fn read_range(
        &self,
        path: &str,
        offset: u64,
        len: usize,
    ) -> Result<Bytes, BackendError> {
        let mut file = fs::File::open(self.abs(path)).await?;
        file.seek(SeekFrom::Start(offset)).await?;

        let mut buf = vec![0u8; len];
        let mut filled = 0;
        while filled < len {
            let n = file.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);

        Ok(Bytes::from(buf))
    }

    async fn put(&self, path: &str, data: Bytes) -> Result<(), BackendError> {
        let abs = self.abs(path);
        if let Some(parent) = abs.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&abs, &data).await?;
        Ok(())
    }

    async fn copy_within(&self, from: &str, to: &str) -> Result<(), BackendError> {
        let target = self.abs(to);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::copy(self.abs(from), target).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn backend() -> (tempfile::TempDir, LocalFsBackend) {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalFsBackend::new("local:", dir.path()).await.unwrap();
        (dir, backend)
    }

    #[tokio::test]
    async fn stat_missing_carries_native_enoent() {
        let (_dir, backend) = backend().await;
        let err = backend.stat("nope").await.unwrap_err();
        assert_eq!(err.errno(), Some(libc::ENOENT));
    }

    #[tokio::test]
    async fn put_read_range_short_read() {
        let (_dir, backend) = backend().await;
        backend
            .put("sub/data.bin", Bytes::from_static(b"hello world"))
            .await
            .unwrap();

        let mid = backend.read_range("sub/data.bin", 6, 5).await.unwrap();
        assert_eq!(&mid[..], b"world");

        // Reading past the end is a short, non-error read.
        let tail = backend.read_range("sub/data.bin", 6, 100).await.unwrap();
        assert_eq!(&tail[..], b"world");
        let beyond = backend.read_range("sub/data.bin", 100, 10).await.unwrap();
        assert!(beyond.is_empty());
    }

    #[tokio::test]
    async fn rmdir_of_full_directory_fails_with_notempty() {
        let (_dir, backend) = backend().await;
        backend.mkdir("d", 0o755).await.unwrap();
        backend.put("d/f", Bytes::from_static(b"x")).await.unwrap();

        let err = backend.rmdir("d").await.unwrap_err();
        assert_eq!(err.errno(), Some(libc::ENOTEMPTY));

        backend.purge("d").await.unwrap();
        assert!(backend.stat("d").await.is_err());
    }
}
