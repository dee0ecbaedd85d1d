//! Instance cache lifecycle: lazy construction, single-instance guarantees,
//! eviction, and cleanup-wait reporting.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use libdoc_fs::{
    BackendFactory, BackendError, ConfigError, ConfigStore, RemoteBackend, StandardBackends,
    VfsCache, VfsError,
};

struct CountingFactory {
    inner: StandardBackends,
    constructed: AtomicUsize,
}

impl CountingFactory {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: StandardBackends,
            constructed: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl BackendFactory for CountingFactory {
    async fn new_backend(
        &self,
        remote: &str,
        section: &BTreeMap<String, String>,
    ) -> Result<Arc<dyn RemoteBackend>, BackendError> {
        self.constructed.fetch_add(1, Ordering::SeqCst);
        self.inner.new_backend(remote, section).await
    }
}

fn store_with_memory_remote(name: &str, extra: &[(&str, &str)]) -> Arc<ConfigStore> {
    let store = Arc::new(ConfigStore::in_memory());
    store.set_value(name, "type", "memory");
    for (key, value) in extra {
        store.set_value(name, key, value);
    }
    store
}

fn cache_for(store: Arc<ConfigStore>, factory: Arc<dyn BackendFactory>) -> (tempfile::TempDir, VfsCache) {
    let _ = env_logger::builder().is_test(true).try_init();

    let tmp = tempfile::tempdir().unwrap();
    let cache = VfsCache::new(store, factory)
        .with_cache_base(tmp.path().join("cache"))
        .with_drain_timeout(Duration::from_secs(5));
    (tmp, cache)
}

#[tokio::test]
async fn concurrent_gets_share_one_instance() {
    let factory = CountingFactory::new();
    let store = store_with_memory_remote("remote1", &[]);
    let (_tmp, cache) = cache_for(store, factory.clone());
    let cache = Arc::new(cache);

    let a = {
        let cache = cache.clone();
        tokio::spawn(async move { cache.get("remote1:").await.unwrap() })
    };
    let b = {
        let cache = cache.clone();
        tokio::spawn(async move { cache.get("remote1:").await.unwrap() })
    };

    let (a, b) = (a.await.unwrap(), b.await.unwrap());
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(factory.constructed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn distinct_remotes_get_distinct_instances() {
    let factory = CountingFactory::new();
    let store = Arc::new(ConfigStore::in_memory());
    store.set_value("a", "type", "memory");
    store.set_value("b", "type", "memory");
    let (_tmp, cache) = cache_for(store, factory.clone());

    let a = cache.get("a:").await.unwrap();
    let b = cache.get("b:").await.unwrap();

    assert!(!Arc::ptr_eq(&a, &b));
    assert_eq!(factory.constructed.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn unknown_remote_fails_with_config_not_found() {
    let (_tmp, cache) = cache_for(Arc::new(ConfigStore::in_memory()), CountingFactory::new());

    let err = cache.get("ghost:").await.unwrap_err();
    assert!(matches!(
        err,
        VfsError::Backend(BackendError::ConfigNotFound)
    ));
    assert!(cache.cached_remotes().await.is_empty());
}

#[tokio::test]
async fn bad_override_fails_construction_and_leaves_no_entry() {
    let store = store_with_memory_remote("rem", &[("docfs:vfs:no_such_option", "1")]);
    let factory = CountingFactory::new();
    let (_tmp, cache) = cache_for(store.clone(), factory.clone());

    let err = cache.get("rem:").await.unwrap_err();
    assert!(matches!(
        err,
        VfsError::Config(ConfigError::UnknownOption(ref key)) if key == "no_such_option"
    ));
    assert!(cache.cached_remotes().await.is_empty());

    // Fixing the config makes the same remote constructible.
    store.delete_key("rem", "docfs:vfs:no_such_option");
    cache.get("rem:").await.unwrap();
    assert_eq!(cache.cached_remotes().await, vec!["rem:".to_string()]);
}

#[tokio::test]
async fn malformed_remote_identifier_is_rejected() {
    let (_tmp, cache) = cache_for(store_with_memory_remote("ok", &[]), CountingFactory::new());

    assert!(matches!(
        cache.get("no-delimiter").await.unwrap_err(),
        VfsError::Parse(_)
    ));
    assert!(matches!(
        cache.get("ok:subdir").await.unwrap_err(),
        VfsError::Parse(_)
    ));
}

#[tokio::test]
async fn evict_removes_entry_and_next_get_reconstructs() {
    let factory = CountingFactory::new();
    let store = store_with_memory_remote("rem", &[]);
    let (_tmp, cache) = cache_for(store, factory.clone());

    let first = cache.get("rem:").await.unwrap();
    cache.evict("rem:", true).await;
    assert!(cache.cached_remotes().await.is_empty());

    let second = cache.get("rem:").await.unwrap();
    assert!(!Arc::ptr_eq(&first, &second));
    assert_eq!(factory.constructed.load(Ordering::SeqCst), 2);

    // The evicted instance rejects new operations.
    assert!(first.stat("").await.is_err());
    assert!(second.stat("").await.is_ok());
}

#[tokio::test]
async fn evict_all_clears_every_instance() {
    let store = Arc::new(ConfigStore::in_memory());
    store.set_value("a", "type", "memory");
    store.set_value("b", "type", "memory");
    let (_tmp, cache) = cache_for(store, CountingFactory::new());

    cache.get("a:").await.unwrap();
    cache.get("b:").await.unwrap();
    assert_eq!(cache.cached_remotes().await.len(), 2);

    cache.evict_all(false).await;
    assert!(cache.cached_remotes().await.is_empty());
}

#[tokio::test]
async fn cleanup_wait_is_max_over_cache_enabled_instances() {
    let store = Arc::new(ConfigStore::in_memory());
    // Defaults: max age 15s + poll 20s = 35s.
    store.set_value("defaults", "type", "memory");
    // Overridden: 30s + 30s = 60s.
    store.set_value("slow", "type", "memory");
    store.set_value("slow", "docfs:vfs:cache_max_age", "30s");
    store.set_value("slow", "docfs:vfs:cache_poll_interval", "30s");
    // Streaming-capable with caching off: excluded from the wait.
    store.set_value("stream", "type", "memory");
    store.set_value("stream", "docfs:vfs:cache_mode", "off");
    let (_tmp, cache) = cache_for(store, CountingFactory::new());

    assert_eq!(cache.max_cleanup_wait_secs().await, 0);

    cache.get("stream:").await.unwrap();
    assert_eq!(cache.max_cleanup_wait_secs().await, 0);

    cache.get("defaults:").await.unwrap();
    assert_eq!(cache.max_cleanup_wait_secs().await, 35);

    cache.get("slow:").await.unwrap();
    assert_eq!(cache.max_cleanup_wait_secs().await, 60);
}

#[tokio::test]
async fn streaming_off_is_forced_to_caching_when_unsupported() {
    let store = Arc::new(ConfigStore::in_memory());
    store.set_value("solid", "type", "memory");
    store.set_value("solid", "streaming", "false");
    store.set_value("solid", "docfs:vfs:cache_mode", "off");
    let (_tmp, cache) = cache_for(store, CountingFactory::new());

    let vfs = cache.get("solid:").await.unwrap();
    assert_eq!(vfs.opts().cache_mode, libdoc_fs::CacheMode::Writes);
    // The forced instance counts toward the cleanup wait.
    assert_eq!(cache.max_cleanup_wait_secs().await, 35);
}

#[tokio::test]
async fn write_back_is_zero_after_construction() {
    let (_tmp, cache) = cache_for(store_with_memory_remote("rem", &[]), CountingFactory::new());
    let vfs = cache.get("rem:").await.unwrap();
    assert!(vfs.opts().write_back.is_zero());
}
