//! Public document operations.
//!
//! Everything the host calls goes through [`DocBridge`]: doc-addressed
//! list/stat/mkdir/rename/remove/copy-move, POSIX-style open, cache
//! management, config helpers, and the opaque RPC/authorize/password
//! passthroughs. Each operation returns either a value or a
//! message-plus-errno pair; failures are never retried here.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use log::{LevelFilter, info};

use crate::backend::{NodeInfo, NodeKind, RemoteBackend, Usage, join_rel, normalize};
use crate::config::{CacheMode, ConfigStore, obscure, options, section_for_remote};
use crate::doc;
use crate::error::{
    BackendError, OpError, translate, translate_config, translate_parse, translate_vfs,
};
use crate::transfer;
use crate::vfs::{FileHandle, Vfs, VfsCache};

/// Result of an opaque RPC dispatch: serialized JSON plus an HTTP status.
#[derive(Debug, Clone)]
pub struct RpcResult {
    pub output: String,
    pub status: u16,
}

/// Opaque `(method, json) -> (json, status)` dispatcher collaborator.
#[async_trait]
pub trait RpcDispatcher: Send + Sync {
    async fn call(&self, method: &str, input: &str) -> RpcResult;
}

/// Opaque blocking authorization flow collaborator.
#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn authorize(&self, args: &[String]) -> Result<(), BackendError>;
}

/// One directory entry as the host sees it: a full child doc, a POSIX mode
/// word, size, and modification time in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub doc: String,
    pub name: String,
    pub size: u64,
    pub mode: u32,
    pub mod_time_ms: i64,
}

fn mode_word(info: &NodeInfo) -> u32 {
    let type_bits = match info.kind {
        NodeKind::Dir => libc::S_IFDIR,
        NodeKind::Symlink => libc::S_IFLNK,
        NodeKind::File => libc::S_IFREG,
    };
    type_bits | (info.perms & 0o777)
}

fn unix_millis(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(since) => since.as_millis() as i64,
        Err(before) => -(before.duration().as_millis() as i64),
    }
}

fn dir_entry(info: &NodeInfo, doc: &str, doc_is_parent: bool) -> DirEntry {
    let entry_doc = if doc_is_parent {
        doc::join(doc, &info.name)
    } else {
        doc.to_string()
    };
    DirEntry {
        doc: entry_doc,
        name: info.name.clone(),
        size: info.size,
        mode: mode_word(info),
        mod_time_ms: unix_millis(info.modified),
    }
}

/// The host-facing surface over the instance cache, resolver, and
/// translator.
pub struct DocBridge {
    store: Arc<ConfigStore>,
    cache: VfsCache,
    rpc: Option<Arc<dyn RpcDispatcher>>,
    authorizer: Option<Arc<dyn Authorizer>>,
}

impl DocBridge {
    pub fn new(store: Arc<ConfigStore>, cache: VfsCache) -> Self {
        Self {
            store,
            cache,
            rpc: None,
            authorizer: None,
        }
    }

    pub fn with_rpc(mut self, rpc: Arc<dyn RpcDispatcher>) -> Self {
        self.rpc = Some(rpc);
        self
    }

    pub fn with_authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = Some(authorizer);
        self
    }

    /// Library version string.
    pub fn version(&self) -> &'static str {
        env!("CARGO_PKG_VERSION")
    }

    /// Map a 0/1/2+ verbosity to the logger's level filter.
    pub fn set_log_verbosity(&self, verbosity: u32) {
        let level = match verbosity {
            0 => LevelFilter::Warn,
            1 => LevelFilter::Info,
            _ => LevelFilter::Debug,
        };
        log::set_max_level(level);
    }

    async fn vfs_for_doc(&self, doc: &str) -> Result<(Arc<Vfs>, String), OpError> {
        let (remote, path) = doc::split_remote(doc).map_err(|err| translate_parse(&err))?;
        let vfs = self
            .cache
            .get(&remote)
            .await
            .map_err(|err| translate_vfs(&err, libc::EINVAL))?;
        Ok((vfs, path))
    }

    /// List a directory's entries, sorted lexicographically by name.
    pub async fn list(&self, doc: &str) -> Result<Vec<DirEntry>, OpError> {
        let (vfs, path) = self.vfs_for_doc(doc).await?;
        let entries = vfs
            .list(&path)
            .await
            .map_err(|err| translate(&err, libc::EIO))?;
        Ok(entries
            .iter()
            .map(|info| dir_entry(info, doc, true))
            .collect())
    }

    /// Stat a single document without following symlinks.
    pub async fn stat(&self, doc: &str) -> Result<DirEntry, OpError> {
        let (vfs, path) = self.vfs_for_doc(doc).await?;
        let info = vfs
            .stat(&path)
            .await
            .map_err(|err| translate(&err, libc::EIO))?;
        Ok(dir_entry(&info, doc, false))
    }

    /// Create a directory with the given permission bits.
    pub async fn mkdir(&self, doc: &str, perms: u32) -> Result<(), OpError> {
        let (vfs, path) = self.vfs_for_doc(doc).await?;
        vfs.mkdir(&path, perms)
            .await
            .map_err(|err| translate(&err, libc::EIO))
    }

    /// Rename a document within one remote. Both docs must resolve to the
    /// same instance; the backend rename primitive cannot cross remotes.
    /// Beyond EEXIST, error codes from here are advisory only.
    pub async fn rename(&self, source_doc: &str, target_doc: &str) -> Result<(), OpError> {
        let (source_vfs, source_path) = self.vfs_for_doc(source_doc).await?;
        let (target_vfs, target_path) = self.vfs_for_doc(target_doc).await?;

        if !Arc::ptr_eq(&source_vfs, &target_vfs) {
            return Err(translate(&BackendError::InvalidArgument, libc::EINVAL));
        }

        source_vfs
            .rename(&source_path, &target_path)
            .await
            .map_err(|err| translate(&err, libc::EIO))
    }

    /// Delete a document, optionally recursively.
    pub async fn remove(&self, doc: &str, recursive: bool) -> Result<(), OpError> {
        let (vfs, path) = self.vfs_for_doc(doc).await?;
        vfs.remove(&path, recursive)
            .await
            .map_err(|err| translate(&err, libc::EIO))
    }

    /// Resolve a doc to its backend root and leaf name, probing the
    /// backend so an existing file is addressed through its parent.
    async fn resolved_root(
        &self,
        doc: &str,
        treat_as_file: bool,
    ) -> Result<(Arc<Vfs>, String, String), OpError> {
        let (root_doc, name) =
            doc::resolve_for_operation(doc, treat_as_file).map_err(|err| translate_parse(&err))?;
        let (remote, base) = doc::split_remote(&root_doc).map_err(|err| translate_parse(&err))?;
        let vfs = self
            .cache
            .get(&remote)
            .await
            .map_err(|err| translate_vfs(&err, libc::EINVAL))?;

        let mut base = normalize(&base);
        let mut name = name;
        if !treat_as_file {
            match vfs.backend().stat(&base).await {
                Ok(info) if !info.is_dir() => {
                    // The doc is an existing file: address its parent.
                    let (_, leaf) =
                        doc::split_parent_leaf(doc).map_err(|err| translate_parse(&err))?;
                    base = match base.rfind('/') {
                        Some(idx) => base[..idx].to_string(),
                        None => String::new(),
                    };
                    name = leaf;
                }
                _ => {}
            }
        }

        Ok((vfs, base, name))
    }

    /// Copy or move a document. Directory sources merge their contents
    /// into the target; file sources overwrite an existing target object
    /// in place. Server-side transfer is used where the backend offers it.
    pub async fn copy_or_move(
        &self,
        source_doc: &str,
        target_doc: &str,
        is_copy: bool,
    ) -> Result<(), OpError> {
        let (source_vfs, source_base, source_file) =
            self.resolved_root(source_doc, false).await?;
        // A file source forces the target to be addressed as parent+leaf,
        // even where the target doc alone would resolve ambiguously.
        let (target_vfs, target_base, target_file) = self
            .resolved_root(target_doc, !source_file.is_empty())
            .await?;

        let source = source_vfs.backend();
        let target = target_vfs.backend();

        if source_file.is_empty() {
            if !target_file.is_empty() {
                // A directory cannot be merged into a file.
                return Err(translate(&BackendError::IsFile, libc::EIO));
            }

            let result = if is_copy {
                transfer::copy_dir(&source, &source_base, &target, &target_base).await
            } else {
                let moved =
                    transfer::move_dir(&source, &source_base, &target, &target_base).await;
                if moved.is_ok() {
                    // A merge-move leaves the emptied source directory
                    // behind; remove it as an explicit follow-up.
                    let _ = source.rmdir(&source_base).await;
                }
                moved
            };
            result.map_err(|err| translate(&err, libc::EIO))?;
        } else {
            let source_path = join_rel(&source_base, &source_file);
            let target_path = join_rel(&target_base, &target_file);

            source
                .stat(&source_path)
                .await
                .map_err(|err| translate(&err, libc::EIO))?;
            let existing = match target.stat(&target_path).await {
                Ok(info) => Some(info),
                Err(err) if err.is_not_found() => None,
                Err(err) => return Err(translate(&err, libc::EIO)),
            };

            let result = if is_copy {
                transfer::copy_object(&source, &source_path, &target, &target_path, existing.as_ref())
                    .await
            } else {
                transfer::move_object(&source, &source_path, &target, &target_path, existing.as_ref())
                    .await
            };
            result.map_err(|err| translate(&err, libc::EIO))?;
        }

        source_vfs.invalidate_listing(&source_base);
        target_vfs.invalidate_listing(&target_base);
        Ok(())
    }

    /// Open a file like POSIX `open()`; `mode` supplies permission bits
    /// for files the open creates. On instances whose content cache cannot
    /// hold writes, a writable open is forced to truncate.
    pub async fn open(&self, doc: &str, flags: i32, mode: u32) -> Result<DocFile, OpError> {
        let (vfs, path) = self.vfs_for_doc(doc).await?;

        let mut flags = flags;
        let wants_write = flags & (libc::O_WRONLY | libc::O_RDWR) != 0;
        if vfs.opts().cache_mode < CacheMode::Writes && wants_write {
            info!("{}: forcing truncation for writable streaming open", vfs.remote());
            flags |= libc::O_TRUNC;
        }

        let handle = vfs
            .open(&path, flags, mode)
            .await
            .map_err(|err| translate(&err, libc::EIO))?;
        Ok(DocFile {
            handle: Arc::new(handle),
        })
    }

    /// Whether the remote supports streaming uploads.
    pub async fn can_stream(&self, remote: &str) -> Result<bool, OpError> {
        let vfs = self
            .cache
            .get(remote)
            .await
            .map_err(|err| translate_vfs(&err, libc::EIO))?;
        Ok(vfs.backend().supports_streaming())
    }

    /// Storage usage, where the backend can report it.
    pub async fn about(&self, remote: &str) -> Result<Usage, OpError> {
        let vfs = self
            .cache
            .get(remote)
            .await
            .map_err(|err| translate_vfs(&err, libc::EIO))?;
        let backend: Arc<dyn RemoteBackend> = vfs.backend();
        if !backend.supports_about() {
            return Err(translate(&BackendError::Unsupported, libc::EIO));
        }
        backend
            .about()
            .await
            .map_err(|err| translate(&err, libc::EIO))
    }

    /// Evict the instance for one remote, draining pending writes first.
    pub async fn evict_remote(&self, remote: &str, delete_cache_dir: bool) {
        self.cache.evict(remote, delete_cache_dir).await;
    }

    /// Evict every cached instance.
    pub async fn evict_all(&self, delete_cache_dir: bool) {
        self.cache.evict_all(delete_cache_dir).await;
    }

    /// Worst-case seconds until every cache-enabled instance has started a
    /// cleanup pass; how long the host should stay alive after the last
    /// interaction.
    pub async fn max_cleanup_wait_secs(&self) -> u64 {
        self.cache.max_cleanup_wait_secs().await
    }

    /// Reload the config file. Instances are all evicted on success so no
    /// instance keeps running with stale options.
    pub async fn config_load(&self) -> Result<(), OpError> {
        self.store
            .load()
            .await
            .map_err(|err| translate_config(&err, libc::EIO))?;
        self.evict_all(true).await;
        Ok(())
    }

    pub async fn config_save(&self) -> Result<(), OpError> {
        self.store
            .save()
            .await
            .map_err(|err| translate_config(&err, libc::EIO))
    }

    pub fn config_set_path(&self, path: &str) {
        self.store.set_path(path);
    }

    /// Validate a remote name for use as a config section.
    pub fn check_remote_name(&self, name: &str) -> Result<(), OpError> {
        doc::check_remote_name(name).map_err(|err| translate_parse(&err))
    }

    pub fn config_copy_section(&self, old: &str, new: &str) {
        self.store.copy_section(old, new);
    }

    pub fn config_delete_section_key(&self, section: &str, key: &str) {
        self.store.delete_key(section, key);
    }

    /// Effective VFS options for a remote, string-serialized for display.
    pub fn vfs_options_text(&self, remote: &str) -> Result<Vec<(String, String)>, OpError> {
        let overrides = self.store.vfs_overrides(section_for_remote(remote));
        options::describe(&overrides).map_err(|err| translate_config(&err, libc::EINVAL))
    }

    /// Obscure a plain-text password for storage.
    pub fn password_obscure(&self, plain: &str) -> String {
        obscure::obscure(plain)
    }

    /// Reveal an obscured password.
    pub fn password_reveal(&self, obscured: &str) -> Result<String, OpError> {
        obscure::reveal(obscured).map_err(|err| translate_config(&err, libc::EINVAL))
    }

    /// Opaque RPC passthrough.
    pub async fn rpc_call(&self, method: &str, input: &str) -> RpcResult {
        match &self.rpc {
            Some(rpc) => rpc.call(method, input).await,
            None => RpcResult {
                output: r#"{"error":"no rpc dispatcher configured"}"#.to_string(),
                status: 501,
            },
        }
    }

    /// Run the blocking authorization flow with a NUL-separated argument
    /// list.
    pub async fn authorize(&self, args_nul_separated: &str) -> Result<(), OpError> {
        let Some(authorizer) = &self.authorizer else {
            return Err(translate(&BackendError::Unsupported, libc::EIO));
        };
        let args: Vec<String> = args_nul_separated
            .split('\0')
            .map(str::to_string)
            .collect();
        authorizer
            .authorize(&args)
            .await
            .map_err(|err| translate(&err, libc::EIO))
    }
}

/// An open file as handed to the host. Close is terminal: the close error,
/// if any, is reported once, and the handle is unusable afterwards.
pub struct DocFile {
    handle: Arc<FileHandle>,
}

impl DocFile {
    /// Read like `pread()`: a short result means end of file.
    pub async fn read_at(&self, offset: u64, len: usize) -> Result<bytes::Bytes, OpError> {
        self.handle
            .read_at(offset, len)
            .await
            .map_err(|err| translate(&err, libc::EIO))
    }

    /// Write like `pwrite()`, returning the count actually written.
    pub async fn write_at(&self, offset: u64, data: &[u8]) -> Result<usize, OpError> {
        self.handle
            .write_at(offset, data)
            .await
            .map_err(|err| translate(&err, libc::EIO))
    }

    /// Request durability like `fsync()`; the backend may no-op it.
    pub async fn flush(&self) -> Result<(), OpError> {
        self.handle
            .flush()
            .await
            .map_err(|err| translate(&err, libc::EIO))
    }

    /// Size of the open file's content.
    pub async fn size(&self) -> Result<u64, OpError> {
        self.handle
            .size()
            .await
            .map_err(|err| translate(&err, libc::EIO))
    }

    pub async fn close(&self) -> Result<(), OpError> {
        self.handle
            .close()
            .await
            .map_err(|err| translate(&err, libc::EIO))
    }
}
