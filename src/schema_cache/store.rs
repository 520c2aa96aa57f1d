//! Durable key → JSON document store for schema snapshots.

use crate::error::{AgentError, Result};
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub trait CacheStore: Send + Sync {
    fn load(&self, key: &str) -> Result<Option<String>>;

    /// Replace the document for `key`. Readers see either the previous
    /// document or the new one, never a partial write.
    fn save(&self, key: &str, document: &str) -> Result<()>;
}

/// Cache identifier for a dataset, e.g. `schema_proj_dataset`.
pub fn cache_key(dataset: &str) -> String {
    format!("schema_{}", dataset.replace(&[':', '.', '-'][..], "_"))
}

/// One JSON file per key under a directory
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, key: &str) -> PathBuf {
        let safe: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
            .collect();
        self.dir.join(format!("{}.json", safe))
    }
}

impl CacheStore for JsonFileStore {
    fn load(&self, key: &str) -> Result<Option<String>> {
        let path = self.path_for(key);
        match fs::read_to_string(&path) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(AgentError::CacheStore(format!(
                "Failed to read {}: {}",
                path.display(),
                e
            ))),
        }
    }

    fn save(&self, key: &str, document: &str) -> Result<()> {
        fs::create_dir_all(&self.dir).map_err(|e| {
            AgentError::CacheStore(format!("Failed to create {}: {}", self.dir.display(), e))
        })?;

        let path = self.path_for(key);
        // Unique per writer so concurrent refreshes never share a temp file
        let temp_path = self
            .dir
            .join(format!(".{}.{}.tmp", key, uuid::Uuid::new_v4()));

        let write = || -> std::io::Result<()> {
            let mut file = fs::File::create(&temp_path)?;
            file.write_all(document.as_bytes())?;
            file.sync_all()?;
            fs::rename(&temp_path, &path)
        };

        write().map_err(|e| {
            let _ = fs::remove_file(&temp_path);
            AgentError::CacheStore(format!("Failed to write {}: {}", path.display(), e))
        })
    }
}

/// Process-local store, for tests and throwaway sessions
#[derive(Default)]
pub struct MemoryStore {
    documents: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CacheStore for MemoryStore {
    fn load(&self, key: &str) -> Result<Option<String>> {
        let documents = self
            .documents
            .lock()
            .map_err(|_| AgentError::CacheStore("memory store lock poisoned".to_string()))?;
        Ok(documents.get(key).cloned())
    }

    fn save(&self, key: &str, document: &str) -> Result<()> {
        let mut documents = self
            .documents
            .lock()
            .map_err(|_| AgentError::CacheStore("memory store lock poisoned".to_string()))?;
        documents.insert(key.to_string(), document.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_json_file_store_round_trip_and_overwrite() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::new(dir.path().join("cache"));

        assert!(store.load("schema_a").unwrap().is_none());
        store.save("schema_a", r#"{"v":1}"#).unwrap();
        store.save("schema_a", r#"{"v":2}"#).unwrap();
        assert_eq!(store.load("schema_a").unwrap().unwrap(), r#"{"v":2}"#);

        // No temp files left behind after a successful swap
        let leftovers: Vec<_> = fs::read_dir(store.dir())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_cache_key_is_file_safe() {
        assert_eq!(
            cache_key("bigquery-public-data.thelook_ecommerce"),
            "schema_bigquery_public_data_thelook_ecommerce"
        );
    }
}
