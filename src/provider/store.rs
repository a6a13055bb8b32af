//! Persisted endpoint records: one opaque load/save pair

use crate::config::EndpointConfig;
use crate::error::{GatewayError, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

/// Load/save interface for endpoint records
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Every stored endpoint
    async fn load(&self) -> Result<Vec<EndpointConfig>>;

    /// Insert or replace the record for `endpoint.key()`
    async fn save(&self, endpoint: &EndpointConfig) -> Result<()>;

    /// Delete the record for `key`; missing records are not an error
    async fn remove(&self, key: &str) -> Result<()>;
}

/// One JSON file per endpoint in a directory
#[derive(Debug, Clone)]
pub struct JsonDirStore {
    dir: PathBuf,
}

impl JsonDirStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", file_stem(key)))
    }
}

/// Filesystem-safe name for an endpoint key
fn file_stem(key: &str) -> String {
    if key == "/" {
        return "root".to_string();
    }
    key.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[async_trait]
impl ConfigStore for JsonDirStore {
    async fn load(&self) -> Result<Vec<EndpointConfig>> {
        if !tokio::fs::try_exists(&self.dir).await? {
            return Ok(Vec::new());
        }

        let mut paths = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                paths.push(path);
            }
        }
        paths.sort();

        let mut endpoints = Vec::with_capacity(paths.len());
        for path in paths {
            let content = tokio::fs::read_to_string(&path).await?;
            let endpoint: EndpointConfig = serde_json::from_str(&content).map_err(|e| {
                GatewayError::Config(format!(
                    "Malformed endpoint record {}: {}",
                    path.display(),
                    e
                ))
            })?;
            endpoints.push(endpoint);
        }
        Ok(endpoints)
    }

    async fn save(&self, endpoint: &EndpointConfig) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(&endpoint.key());
        let tmp = path.with_extension("json.tmp");
        let content = serde_json::to_string_pretty(endpoint)?;
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, &path).await?;
        tracing::debug!(path = %path.display(), "Endpoint record saved");
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-memory store
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: RwLock<BTreeMap<String, EndpointConfig>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, key: &str) -> Option<EndpointConfig> {
        self.records.read().unwrap().get(key).cloned()
    }
}

#[async_trait]
impl ConfigStore for MemoryStore {
    async fn load(&self) -> Result<Vec<EndpointConfig>> {
        Ok(self.records.read().unwrap().values().cloned().collect())
    }

    async fn save(&self, endpoint: &EndpointConfig) -> Result<()> {
        self.records
            .write()
            .unwrap()
            .insert(endpoint.key(), endpoint.clone());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.records.write().unwrap().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_stem() {
        assert_eq!(file_stem("/"), "root");
        assert_eq!(file_stem("a.example.com"), "a.example.com");
        assert_eq!(file_stem("*.example.com"), "_.example.com");
        assert_eq!(file_stem("[::1]:80"), "___1__80");
    }

    #[tokio::test]
    async fn test_json_dir_store_save_load_remove() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonDirStore::new(dir.path().join("proxy"));

        assert!(store.load().await.unwrap().is_empty());

        let a = EndpointConfig::host("a.example.com", "127.0.0.1:8001");
        let root = EndpointConfig::root("127.0.0.1:8000");
        store.save(&a).await.unwrap();
        store.save(&root).await.unwrap();

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert!(loaded.contains(&a));
        assert!(loaded.contains(&root));

        store.remove("a.example.com").await.unwrap();
        store.remove("a.example.com").await.unwrap();
        let loaded = store.load().await.unwrap();
        assert_eq!(loaded, vec![root]);
    }

    #[tokio::test]
    async fn test_json_dir_store_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonDirStore::new(dir.path());
        let mut a = EndpointConfig::host("a.example.com", "127.0.0.1:8001");
        store.save(&a).await.unwrap();
        a.rate_limit = 9;
        store.save(&a).await.unwrap();
        let loaded = store.load().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].rate_limit, 9);
    }

    #[tokio::test]
    async fn test_json_dir_store_malformed_record() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("bad.json"), "{not json").unwrap();
        let store = JsonDirStore::new(dir.path());
        let err = store.load().await.unwrap_err();
        assert!(err.to_string().contains("Malformed endpoint record"));
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryStore::new();
        let a = EndpointConfig::host("a.example.com", "127.0.0.1:8001");
        store.save(&a).await.unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("a.example.com"), Some(a));
        store.remove("a.example.com").await.unwrap();
        assert!(store.is_empty());
    }
}
