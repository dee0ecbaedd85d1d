//! Remote-to-instance cache.
//!
//! Exactly one VFS instance exists per remote. The whole get-or-create
//! path is serialized by one mutex over the map: construction is off the
//! hot path and must never run twice for the same remote, so the coarse
//! lock is the simplest correct shape. Operations against an instance that
//! already exists never touch this lock again.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use log::{info, warn};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use super::instance::Vfs;
use crate::backend::BackendFactory;
use crate::config::{CacheMode, ConfigStore, options, section_for_remote};
use crate::doc::{self, ParseError};
use crate::error::{BackendError, VfsError};

/// Bound on how long eviction waits for in-flight writes to drain.
const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(60);

pub struct VfsCache {
    factory: Arc<dyn BackendFactory>,
    store: Arc<ConfigStore>,
    cache_base: PathBuf,
    drain_timeout: Duration,
    instances: Mutex<HashMap<String, Arc<Vfs>>>,
}

impl VfsCache {
    pub fn new(store: Arc<ConfigStore>, factory: Arc<dyn BackendFactory>) -> Self {
        let cache_base = dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("docfs");
        Self {
            factory,
            store,
            cache_base,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            instances: Mutex::new(HashMap::new()),
        }
    }

    /// Root directory for per-instance content caches.
    pub fn with_cache_base(mut self, base: impl Into<PathBuf>) -> Self {
        self.cache_base = base.into();
        self
    }

    /// Bound for the eviction write-drain.
    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Get the instance for `remote`, constructing it on first access.
    ///
    /// Construction resolves the remote's option overrides, builds the
    /// backend, and inserts under the map lock; a failure anywhere leaves
    /// no entry behind.
    pub async fn get(&self, remote: &str) -> Result<Arc<Vfs>, VfsError> {
        let (parsed_remote, rest) = doc::split_remote(remote)?;
        if !rest.is_empty() || parsed_remote != remote {
            return Err(ParseError::InvalidName(remote.to_string()).into());
        }

        let mut instances = self.instances.lock().await;
        if let Some(vfs) = instances.get(remote) {
            return Ok(vfs.clone());
        }

        let section_name = section_for_remote(remote);
        let section = self
            .store
            .section(section_name)
            .ok_or(BackendError::ConfigNotFound)?;
        let mut opts = options::resolve_for_remote(&self.store, remote)?;
        let backend = self.factory.new_backend(remote, &section).await?;

        if opts.cache_mode == CacheMode::Off && !backend.supports_streaming() {
            info!("{remote}: streaming not supported, enabling write caching");
            opts.cache_mode = CacheMode::Writes;
        }

        let vfs = Vfs::new(
            remote.to_string(),
            backend,
            opts,
            self.instance_cache_dir(remote),
        )
        .await?;

        instances.insert(remote.to_string(), vfs.clone());
        Ok(vfs)
    }

    /// Drop the instance for `remote`: drain writers with a bound, stop its
    /// background work, and optionally delete its on-disk cache. The map
    /// entry is gone regardless of how the cleanup fares.
    pub async fn evict(&self, remote: &str, delete_cache_dir: bool) {
        let removed = self.instances.lock().await.remove(remote);
        if let Some(vfs) = removed {
            shutdown_instance(vfs, delete_cache_dir, self.drain_timeout).await;
        }
    }

    /// Evict every cached instance; used on configuration reload so stale
    /// options never linger.
    pub async fn evict_all(&self, delete_cache_dir: bool) {
        let drained: Vec<Arc<Vfs>> = {
            let mut instances = self.instances.lock().await;
            instances.drain().map(|(_, vfs)| vfs).collect()
        };

        join_all(
            drained
                .into_iter()
                .map(|vfs| shutdown_instance(vfs, delete_cache_dir, self.drain_timeout)),
        )
        .await;
    }

    /// Worst-case seconds before every cache-enabled instance has begun at
    /// least one cleanup pass. Zero when nothing qualifies.
    pub async fn max_cleanup_wait_secs(&self) -> u64 {
        let instances = self.instances.lock().await;
        instances
            .values()
            .filter_map(|vfs| vfs.cleanup_wait())
            .max()
            .map(|wait| wait.as_secs_f64().ceil() as u64)
            .unwrap_or(0)
    }

    /// Remotes with a live instance; mainly for introspection.
    pub async fn cached_remotes(&self) -> Vec<String> {
        let instances = self.instances.lock().await;
        let mut remotes: Vec<String> = instances.keys().cloned().collect();
        remotes.sort();
        remotes
    }

    fn instance_cache_dir(&self, remote: &str) -> PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(remote.as_bytes());
        let digest = hex::encode(hasher.finalize());
        self.cache_base.join(&digest[..2]).join(&digest[2..])
    }
}

async fn shutdown_instance(vfs: Arc<Vfs>, delete_cache_dir: bool, drain_timeout: Duration) {
    vfs.shutdown(drain_timeout).await;
    if delete_cache_dir {
        if let Err(err) = vfs.delete_cache_dir().await {
            warn!("{}: cache dir cleanup failed: {err}", vfs.remote());
        }
    }
}
