//! Local durable cache: namespaced string keys, JSON values.
//!
//! Used as the offline fallback when the remote store cannot be reached and
//! as a backup of the last known session state.

use std::collections::HashMap;
use std::future::Future;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::fs;
use tracing::warn;
use uuid::Uuid;

use crate::error::{CoreError, Result};

pub const TENANTS_KEY: &str = "ep_all_tenants";
pub const CURRENT_USER_KEY: &str = "ep_current_user";
pub const SELECTED_PROJECT_KEY: &str = "ep_selectedProject";

pub trait LocalCache: Send + Sync + 'static {
    fn get(&self, key: &str) -> impl Future<Output = Result<Option<String>>> + Send;
    fn set(&self, key: &str, value: &str) -> impl Future<Output = Result<()>> + Send;
    fn remove(&self, key: &str) -> impl Future<Output = Result<()>> + Send;
}

/// Reads and decodes `key`. A missing or undecodable entry is `None`.
pub async fn load_json<T: DeserializeOwned>(cache: &impl LocalCache, key: &str) -> Option<T> {
    let raw = match cache.get(key).await {
        Ok(Some(raw)) => raw,
        Ok(None) => return None,
        Err(e) => {
            warn!(key, error = %e, "Failed to read cache entry");
            return None;
        }
    };
    match serde_json::from_str(&raw) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(key, error = %e, "Discarding undecodable cache entry");
            None
        }
    }
}

pub async fn store_json<T: Serialize + ?Sized>(
    cache: &impl LocalCache,
    key: &str,
    value: &T,
) -> Result<()> {
    let raw = serde_json::to_string(value)?;
    cache.set(key, &raw).await
}

/// One file per key under a directory.
#[derive(Debug, Clone)]
pub struct FileCache {
    dir: PathBuf,
}

impl FileCache {
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| CoreError::Cache(format!("Failed to create cache directory: {e}")))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, key: &str) -> Result<PathBuf> {
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !valid {
            return Err(CoreError::Cache(format!("Invalid cache key: {key}")));
        }
        Ok(self.dir.join(format!("{key}.json")))
    }
}

impl LocalCache for FileCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        match fs::read_to_string(self.path(key)?).await {
            Ok(raw) => Ok(Some(raw)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CoreError::Cache(format!("Failed to read {key}: {e}"))),
        }
    }

    /// Writes next to the target and renames over it, so readers never see
    /// a partial entry.
    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let path = self.path(key)?;
        let tmp = self.dir.join(format!("{key}.{}.tmp", Uuid::new_v4().simple()));
        let written = match fs::write(&tmp, value).await {
            Ok(()) => fs::rename(&tmp, &path).await,
            Err(e) => Err(e),
        };
        if written.is_err() {
            let _ = fs::remove_file(&tmp).await;
        }
        written.map_err(|e| CoreError::Cache(format!("Failed to write {key}: {e}")))
    }

    async fn remove(&self, key: &str) -> Result<()> {
        match fs::remove_file(self.path(key)?).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CoreError::Cache(format!("Failed to remove {key}: {e}"))),
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<String, String>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LocalCache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let entries = self
            .entries
            .read()
            .map_err(|_| CoreError::Cache("cache lock poisoned".into()))?;
        Ok(entries.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| CoreError::Cache("cache lock poisoned".into()))?;
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| CoreError::Cache("cache lock poisoned".into()))?;
        entries.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn file_cache_round_trips_values() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::open(dir.path().join("cache")).await.unwrap();

        assert_eq!(cache.get("ep_projects").await.unwrap(), None);
        store_json(&cache, "ep_projects", &vec!["a", "b"]).await.unwrap();
        assert_eq!(
            load_json::<Vec<String>>(&cache, "ep_projects").await,
            Some(vec!["a".to_string(), "b".to_string()])
        );

        cache.remove("ep_projects").await.unwrap();
        cache.remove("ep_projects").await.unwrap();
        assert_eq!(cache.get("ep_projects").await.unwrap(), None);
    }

    #[tokio::test]
    async fn file_cache_rejects_path_like_keys() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::open(dir.path()).await.unwrap();
        assert!(cache.set("../escape", "x").await.is_err());
        assert!(cache.get("").await.is_err());
    }

    #[tokio::test]
    async fn overlapping_writes_leave_one_complete_entry() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::open(dir.path()).await.unwrap();

        let (first, second) = tokio::join!(
            cache.set("ep_tasks", "[1]"),
            cache.set("ep_tasks", "[1,2]"),
        );
        first.unwrap();
        second.unwrap();

        let stored = cache.get("ep_tasks").await.unwrap().unwrap();
        assert!(stored == "[1]" || stored == "[1,2]");
        let leftovers = std::fs::read_dir(dir.path())
            .unwrap()
            .filter(|entry| {
                entry
                    .as_ref()
                    .is_ok_and(|e| e.path().extension().is_some_and(|ext| ext == "tmp"))
            })
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn corrupt_entry_loads_as_none() {
        let cache = MemoryCache::new();
        cache.set("ep_tasks", "{not json").await.unwrap();
        assert_eq!(load_json::<Vec<String>>(&cache, "ep_tasks").await, None);
    }
}
