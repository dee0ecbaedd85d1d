//! Persisted configuration store.
//!
//! Remotes are stored as named sections of arbitrary key/value pairs, one
//! section per remote (section name = remote without the trailing colon).
//! The file is JSON on disk; load and save surface real I/O errors while a
//! missing file is reported distinctly so the host can treat it as the
//! normal empty-config case.

use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;
use std::sync::RwLock;

use log::info;
use serde::{Deserialize, Serialize};

use super::{ConfigError, LEGACY_VFS_CACHING_KEY, VFS_OPT_PREFIX};

/// Config section name for a remote identifier.
pub fn section_for_remote(remote: &str) -> &str {
    remote.trim_end_matches(':')
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct ConfigData {
    sections: BTreeMap<String, BTreeMap<String, String>>,
}

/// In-memory view of the config file, shared across the bridge.
///
/// Accessors lock only for the map operation itself; file I/O happens
/// outside the lock.
#[derive(Debug, Default)]
pub struct ConfigStore {
    path: RwLock<Option<PathBuf>>,
    data: RwLock<ConfigData>,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: RwLock::new(Some(path.into())),
            data: RwLock::new(ConfigData::default()),
        }
    }

    /// Store without a backing file; load/save report it as not found.
    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn set_path(&self, path: impl Into<PathBuf>) {
        *self.path.write().unwrap() = Some(path.into());
    }

    fn current_path(&self) -> Result<PathBuf, ConfigError> {
        self.path
            .read()
            .unwrap()
            .clone()
            .ok_or(ConfigError::NotFound)
    }

    /// Replace the in-memory data with the file contents and run the legacy
    /// option migration. A migration that changed anything is written back
    /// immediately so the deprecated keys never reappear.
    pub async fn load(&self) -> Result<(), ConfigError> {
        let path = self.current_path()?;
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(ConfigError::NotFound);
            }
            Err(err) => return Err(ConfigError::Io(err)),
        };

        let mut parsed: ConfigData = serde_json::from_slice(&bytes)?;
        let migrated = migrate_legacy_options(&mut parsed)?;
        *self.data.write().unwrap() = parsed;

        if migrated {
            self.save().await?;
        }

        Ok(())
    }

    pub async fn save(&self) -> Result<(), ConfigError> {
        let path = self.current_path()?;
        let bytes = {
            let data = self.data.read().unwrap();
            serde_json::to_vec_pretty(&*data)?
        };

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, bytes).await?;

        Ok(())
    }

    pub fn sections(&self) -> Vec<String> {
        self.data.read().unwrap().sections.keys().cloned().collect()
    }

    pub fn section(&self, name: &str) -> Option<BTreeMap<String, String>> {
        self.data.read().unwrap().sections.get(name).cloned()
    }

    pub fn get_value(&self, section: &str, key: &str) -> Option<String> {
        self.data
            .read()
            .unwrap()
            .sections
            .get(section)
            .and_then(|keys| keys.get(key).cloned())
    }

    pub fn set_value(&self, section: &str, key: &str, value: &str) {
        self.data
            .write()
            .unwrap()
            .sections
            .entry(section.to_string())
            .or_default()
            .insert(key.to_string(), value.to_string());
    }

    pub fn delete_key(&self, section: &str, key: &str) {
        let mut data = self.data.write().unwrap();
        if let Some(keys) = data.sections.get_mut(section) {
            keys.remove(key);
        }
    }

    pub fn delete_section(&self, section: &str) {
        self.data.write().unwrap().sections.remove(section);
    }

    /// Copy every key of `old` into `new`, merging over existing keys.
    pub fn copy_section(&self, old: &str, new: &str) {
        let mut data = self.data.write().unwrap();
        let Some(source) = data.sections.get(old).cloned() else {
            return;
        };
        let target = data.sections.entry(new.to_string()).or_default();
        for (key, value) in source {
            target.insert(key, value);
        }
    }

    /// VFS option overrides of a section, with the reserved prefix removed.
    pub fn vfs_overrides(&self, section: &str) -> BTreeMap<String, String> {
        let data = self.data.read().unwrap();
        let Some(keys) = data.sections.get(section) else {
            return BTreeMap::new();
        };
        keys.iter()
            .filter_map(|(key, value)| {
                key.strip_prefix(VFS_OPT_PREFIX)
                    .map(|stripped| (stripped.to_string(), value.clone()))
            })
            .collect()
    }
}

/// Rewrite the deprecated per-remote caching boolean into the modern
/// `cache_mode` override and delete it. Runs on every load; a no-op once
/// the flag is gone.
fn migrate_legacy_options(data: &mut ConfigData) -> Result<bool, ConfigError> {
    let mut changed = false;

    for (section, keys) in data.sections.iter_mut() {
        let Some(raw) = keys.get(LEGACY_VFS_CACHING_KEY).cloned() else {
            continue;
        };

        let caching = match raw.as_str() {
            "true" => true,
            "false" => false,
            _ => {
                return Err(ConfigError::InvalidValue {
                    key: LEGACY_VFS_CACHING_KEY.to_string(),
                    value: raw,
                    reason: "expected true or false".to_string(),
                });
            }
        };

        let modern_key = format!("{VFS_OPT_PREFIX}cache_mode");
        // An explicit modern override wins over the migrated flag.
        keys.entry(modern_key)
            .or_insert_with(|| if caching { "writes" } else { "off" }.to_string());
        keys.remove(LEGACY_VFS_CACHING_KEY);
        changed = true;

        info!("{section}: migrated legacy caching flag to cache_mode override");
    }

    Ok(changed)
}
