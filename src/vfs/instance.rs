//! Per-remote VFS instance.
//!
//! An instance owns the open handles, the directory-listing cache, the
//! on-disk content cache, and one background cleanup task. It is bound to
//! exactly one remote and lives in the instance cache until evicted.

use std::collections::HashSet;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use log::{debug, warn};
use sha2::{Digest, Sha256};
use tokio::sync::Notify;

use super::handle::{ChunkedReader, FileHandle};
use crate::backend::{NodeInfo, RemoteBackend, normalize};
use crate::config::{CacheMode, VfsOptions};
use crate::error::BackendError;

/// Write-back delay in force while an instance is constructing, so nothing
/// blocks on dirty-cache reconciliation mid-setup. Reset to zero (upload
/// synchronously on close) the moment construction completes.
const CONSTRUCTION_WRITE_BACK: Duration = Duration::from_millis(100);

/// Tracks in-flight writes so shutdown can drain them with a bound.
pub(crate) struct WriterTracker {
    count: AtomicUsize,
    notify: Notify,
}

impl WriterTracker {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            count: AtomicUsize::new(0),
            notify: Notify::new(),
        })
    }

    fn begin(self: &Arc<Self>) -> WriterGuard {
        self.count.fetch_add(1, Ordering::SeqCst);
        WriterGuard(self.clone())
    }

    async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before the recheck so a guard dropped in between
            // cannot be missed.
            notified.as_mut().enable();

            if self.count.load(Ordering::SeqCst) == 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.count.load(Ordering::SeqCst) == 0;
            }
        }
    }
}

/// RAII token for one in-flight write.
pub(crate) struct WriterGuard(Arc<WriterTracker>);

impl Drop for WriterGuard {
    fn drop(&mut self) {
        if self.0.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.notify.notify_waiters();
        }
    }
}

/// Stateful handle for one remote.
///
/// Never shared or aliased across remotes; the instance cache owns the
/// only mapping.
pub struct Vfs {
    remote: String,
    backend: Arc<dyn RemoteBackend>,
    opts: RwLock<VfsOptions>,
    cache_dir: PathBuf,
    dir_cache: Option<moka::sync::Cache<String, Arc<Vec<NodeInfo>>>>,
    writers: Arc<WriterTracker>,
    open_cache_files: Mutex<HashSet<PathBuf>>,
    shut_down: AtomicBool,
    cleaner: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl std::fmt::Debug for Vfs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vfs")
            .field("remote", &self.remote)
            .field("cache_dir", &self.cache_dir)
            .finish_non_exhaustive()
    }
}

impl Vfs {
    /// Construct an instance for `remote` with resolved options.
    ///
    /// Creates the content-cache directory and starts the cleanup task for
    /// cache-enabled modes.
    pub(crate) async fn new(
        remote: String,
        backend: Arc<dyn RemoteBackend>,
        mut opts: VfsOptions,
        cache_dir: PathBuf,
    ) -> Result<Arc<Self>, BackendError> {
        opts.write_back = CONSTRUCTION_WRITE_BACK;
        let caching = opts.cache_mode != CacheMode::Off;

        if caching {
            tokio::fs::create_dir_all(&cache_dir).await?;
        }

        let dir_cache = (!opts.dir_cache_time.is_zero()).then(|| {
            moka::sync::Cache::builder()
                .max_capacity(10_000)
                .time_to_live(opts.dir_cache_time)
                .build()
        });

        let vfs = Arc::new(Self {
            remote,
            backend,
            opts: RwLock::new(opts),
            cache_dir,
            dir_cache,
            writers: WriterTracker::new(),
            open_cache_files: Mutex::new(HashSet::new()),
            shut_down: AtomicBool::new(false),
            cleaner: Mutex::new(None),
        });

        if caching {
            let handle = tokio::spawn(cleanup_loop(vfs.clone()));
            *vfs.cleaner.lock().unwrap() = Some(handle);
        }

        vfs.opts.write().unwrap().write_back = Duration::ZERO;
        Ok(vfs)
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }

    pub fn backend(&self) -> Arc<dyn RemoteBackend> {
        self.backend.clone()
    }

    pub fn opts(&self) -> VfsOptions {
        self.opts.read().unwrap().clone()
    }

    /// Worst-case delay before this instance's cleanup pass has run at
    /// least once; `None` when content caching is disabled.
    pub fn cleanup_wait(&self) -> Option<Duration> {
        let opts = self.opts.read().unwrap();
        (opts.cache_mode != CacheMode::Off)
            .then(|| opts.cache_max_age + opts.cache_poll_interval)
    }

    fn ensure_live(&self) -> Result<(), BackendError> {
        if self.shut_down.load(Ordering::SeqCst) {
            Err(BackendError::ClosedHandle)
        } else {
            Ok(())
        }
    }

    pub(crate) fn begin_write(&self) -> WriterGuard {
        self.writers.begin()
    }

    /// Stat a node without following symlinks.
    pub async fn stat(&self, path: &str) -> Result<NodeInfo, BackendError> {
        self.ensure_live()?;
        self.backend.stat(&normalize(path)).await
    }

    /// List a directory, sorted lexicographically by name. Results are
    /// cached for the directory-cache TTL.
    pub async fn list(&self, path: &str) -> Result<Arc<Vec<NodeInfo>>, BackendError> {
        self.ensure_live()?;
        let path = normalize(path);

        if let Some(cache) = &self.dir_cache {
            if let Some(entries) = cache.get(&path) {
                return Ok(entries);
            }
        }

        let info = self.backend.stat(&path).await?;
        if !info.is_dir() {
            return Err(BackendError::Io(std::io::Error::from_raw_os_error(
                libc::ENOTDIR,
            )));
        }

        let mut entries = self.backend.list(&path).await?;
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        let entries = Arc::new(entries);

        if let Some(cache) = &self.dir_cache {
            cache.insert(path, entries.clone());
        }
        Ok(entries)
    }

    pub async fn mkdir(&self, path: &str, perms: u32) -> Result<(), BackendError> {
        self.ensure_live()?;
        let path = normalize(path);
        self.backend.mkdir(&path, perms & 0o777).await?;
        self.invalidate_parent_listing(&path);
        Ok(())
    }

    pub async fn rename(&self, from: &str, to: &str) -> Result<(), BackendError> {
        self.ensure_live()?;
        let from = normalize(from);
        let to = normalize(to);
        self.backend.rename(&from, &to).await?;
        self.invalidate_parent_listing(&from);
        self.invalidate_parent_listing(&to);
        Ok(())
    }

    /// Remove a node. Recursive removal of a directory is the backend's
    /// purge primitive, not recursion here.
    pub async fn remove(&self, path: &str, recursive: bool) -> Result<(), BackendError> {
        self.ensure_live()?;
        let path = normalize(path);

        let info = self.backend.stat(&path).await?;
        if info.is_dir() {
            if recursive {
                self.backend.purge(&path).await?;
            } else {
                self.backend.rmdir(&path).await?;
            }
            self.invalidate_listing(&path);
        } else {
            self.backend.remove_file(&path).await?;
        }
        self.invalidate_parent_listing(&path);
        Ok(())
    }

    /// Open a file; `mode` carries permission bits for created files.
    /// Streaming instances only accept writable opens that truncate, since
    /// they cannot materialize existing content for in-place updates.
    pub async fn open(
        self: &Arc<Self>,
        path: &str,
        flags: i32,
        mode: u32,
    ) -> Result<FileHandle, BackendError> {
        self.ensure_live()?;
        let path = normalize(path);

        let access = flags & libc::O_ACCMODE;
        let readable = access == libc::O_RDONLY || access == libc::O_RDWR;
        let writable = access == libc::O_WRONLY || access == libc::O_RDWR;
        let create = flags & libc::O_CREAT != 0;
        let excl = flags & libc::O_EXCL != 0;
        let trunc = flags & libc::O_TRUNC != 0;

        let existing = match self.backend.stat(&path).await {
            Ok(info) if info.is_dir() => return Err(BackendError::IsDir),
            Ok(info) => Some(info),
            Err(err) if err.is_not_found() => None,
            Err(err) => return Err(err),
        };

        if existing.is_some() && create && excl {
            return Err(BackendError::AlreadyExists);
        }
        if existing.is_none() && (!create || !writable) {
            return Err(BackendError::NotFound);
        }

        let opts = self.opts();
        if !writable {
            let reader = ChunkedReader::new(
                self.backend.clone(),
                path.clone(),
                opts.chunk_size,
                opts.chunk_size_limit,
            );
            return Ok(FileHandle::stream_read(self.clone(), path, reader));
        }

        match opts.cache_mode {
            CacheMode::Writes => {
                let cache_path = self.cache_file_path(&path);
                if let Some(parent) = cache_path.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }

                if trunc || existing.is_none() {
                    tokio::fs::write(&cache_path, b"").await?;
                    if existing.is_none() {
                        let perms = std::fs::Permissions::from_mode(mode & 0o777);
                        tokio::fs::set_permissions(&cache_path, perms).await?;
                    }
                } else {
                    self.materialize(&path, &cache_path, existing.as_ref()).await?;
                }

                let file = tokio::fs::OpenOptions::new()
                    .read(true)
                    .write(true)
                    .open(&cache_path)
                    .await?;

                self.open_cache_files
                    .lock()
                    .unwrap()
                    .insert(cache_path.clone());
                let guard = Some(self.begin_write());
                // Truncating an existing object is itself a modification
                // that must reach the backend even if nothing gets written.
                let dirty = trunc && existing.is_some();
                Ok(FileHandle::cached(
                    self.clone(),
                    path,
                    readable,
                    true,
                    file,
                    cache_path,
                    dirty,
                    guard,
                ))
            }
            CacheMode::Off => {
                if !trunc && existing.is_some() {
                    return Err(BackendError::Unsupported);
                }
                let guard = Some(self.begin_write());
                Ok(FileHandle::stream_write(self.clone(), path, readable, guard))
            }
        }
    }

    /// Download an object into its cache file.
    async fn materialize(
        &self,
        path: &str,
        cache_path: &PathBuf,
        info: Option<&NodeInfo>,
    ) -> Result<(), BackendError> {
        let size = match info {
            Some(info) => info.size,
            None => self.backend.stat(path).await?.size,
        };

        let chunk = self.opts().chunk_size.max(1) as usize;
        let mut data = Vec::with_capacity(size as usize);
        while (data.len() as u64) < size {
            let part = self
                .backend
                .read_range(path, data.len() as u64, chunk)
                .await?;
            if part.is_empty() {
                break;
            }
            data.extend_from_slice(&part);
        }

        tokio::fs::write(cache_path, &data).await?;
        Ok(())
    }

    fn cache_file_path(&self, path: &str) -> PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(path.as_bytes());
        let digest = hex::encode(hasher.finalize());
        self.cache_dir.join(&digest[..2]).join(&digest[2..])
    }

    pub(crate) fn release_cache_file(&self, cache_path: &PathBuf) {
        self.open_cache_files.lock().unwrap().remove(cache_path);
    }

    pub(crate) fn invalidate_parent_listing(&self, path: &str) {
        let parent = match path.rfind('/') {
            Some(idx) => &path[..idx],
            None => "",
        };
        self.invalidate_listing(parent);
    }

    pub(crate) fn invalidate_listing(&self, path: &str) {
        if let Some(cache) = &self.dir_cache {
            cache.invalidate(&normalize(path));
        }
    }

    /// Block until in-flight writes drain or the timeout passes. Returns
    /// whether the instance went idle.
    pub async fn wait_for_writers(&self, timeout: Duration) -> bool {
        self.writers.wait_idle(timeout).await
    }

    /// Stop the instance: reject new operations, drain writers for up to
    /// `drain_timeout`, then release background work regardless.
    pub async fn shutdown(&self, drain_timeout: Duration) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }

        if !self.writers.wait_idle(drain_timeout).await {
            warn!("{}: shutting down with writes still in flight", self.remote);
        }

        if let Some(cleaner) = self.cleaner.lock().unwrap().take() {
            cleaner.abort();
        }
        if let Some(cache) = &self.dir_cache {
            cache.invalidate_all();
        }
    }

    /// Delete the on-disk content cache. Best-effort companion to
    /// [`shutdown`](Self::shutdown).
    pub async fn delete_cache_dir(&self) -> Result<(), BackendError> {
        match tokio::fs::remove_dir_all(&self.cache_dir).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(BackendError::Io(err)),
        }
    }

    /// Remove cache files older than the configured max age, skipping ones
    /// with open handles.
    async fn sweep_cache(&self) {
        let max_age = self.opts().cache_max_age;

        let mut shards = match tokio::fs::read_dir(&self.cache_dir).await {
            Ok(shards) => shards,
            Err(_) => return,
        };

        while let Ok(Some(shard)) = shards.next_entry().await {
            let mut files = match tokio::fs::read_dir(shard.path()).await {
                Ok(files) => files,
                Err(_) => continue,
            };
            while let Ok(Some(file)) = files.next_entry().await {
                let path = file.path();
                if self.open_cache_files.lock().unwrap().contains(&path) {
                    continue;
                }
                let expired = file
                    .metadata()
                    .await
                    .and_then(|meta| meta.modified())
                    .ok()
                    .and_then(|modified| modified.elapsed().ok())
                    .is_some_and(|age| age > max_age);
                if expired {
                    debug!("{}: expiring cache file {}", self.remote, path.display());
                    let _ = tokio::fs::remove_file(&path).await;
                }
            }
        }
    }
}

async fn cleanup_loop(vfs: Arc<Vfs>) {
    let interval = vfs.opts().cache_poll_interval.max(Duration::from_secs(1));
    loop {
        tokio::time::sleep(interval).await;
        vfs.sweep_cache().await;
    }
}
