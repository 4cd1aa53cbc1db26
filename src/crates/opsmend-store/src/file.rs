//! File-backed document storage
//!
//! [`FileBlobStore`] keeps one `<key>.json` file per document under a base
//! directory. It is the durable backend for plan, state, and snapshot
//! records: a process restart finds every document where it was left.
//!
//! Writes go through a temporary file followed by a rename so a crash midway
//! never leaves a half-written document under the real key. All writes are
//! serialised by a single writer lock; reads share the lock.

use crate::{BlobStore, Result, StoreError};
use async_trait::async_trait;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::warn;

/// Durable [`BlobStore`] implementation over a directory of JSON files.
#[derive(Clone)]
pub struct FileBlobStore {
    base_dir: PathBuf,
    lock: Arc<RwLock<()>>,
}

impl FileBlobStore {
    /// Open a store rooted at `base_dir`, creating the directory if needed.
    pub async fn open(base_dir: impl Into<PathBuf>) -> Result<Self> {
        let base_dir = base_dir.into();
        tokio::fs::create_dir_all(&base_dir).await?;
        Ok(Self {
            base_dir,
            lock: Arc::new(RwLock::new(())),
        })
    }

    /// Directory the store writes into.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        if key.is_empty()
            || key.contains('/')
            || key.contains('\\')
            || key.contains("..")
            || key.starts_with('.')
        {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        Ok(self.base_dir.join(format!("{key}.json")))
    }
}

#[async_trait]
impl BlobStore for FileBlobStore {
    async fn put(&self, key: &str, value: Value) -> Result<()> {
        let path = self.path_for(key)?;
        let body = serde_json::to_vec_pretty(&value)?;

        let _guard = self.lock.write().await;
        let tmp = self.base_dir.join(format!(".{key}.json.tmp"));
        tokio::fs::write(&tmp, &body).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Value> {
        let path = self.path_for(key)?;

        let _guard = self.lock.read().await;
        let body = match tokio::fs::read(&path).await {
            Ok(body) => body,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(key.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_slice(&body)?)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;

        let _guard = self.lock.write().await;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<(String, Value)>> {
        let _guard = self.lock.read().await;
        let mut entries = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.base_dir).await?;

        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(key) = name.strip_suffix(".json") else {
                continue;
            };
            if key.starts_with('.') || !key.starts_with(prefix) {
                continue;
            }

            let body = match tokio::fs::read(entry.path()).await {
                Ok(body) => body,
                Err(e) => {
                    warn!(key, error = %e, "skipping unreadable document");
                    continue;
                }
            };
            match serde_json::from_slice(&body) {
                Ok(value) => entries.push((key.to_string(), value)),
                Err(e) => {
                    warn!(key, error = %e, "skipping corrupt document");
                }
            }
        }

        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    async fn open_store() -> (TempDir, FileBlobStore) {
        let dir = TempDir::new().unwrap();
        let store = FileBlobStore::open(dir.path()).await.unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let (_dir, store) = open_store().await;
        store
            .put("plan:p1", json!({"id": "p1", "steps": []}))
            .await
            .unwrap();

        let loaded = store.get("plan:p1").await.unwrap();
        assert_eq!(loaded["id"], "p1");
    }

    #[tokio::test]
    async fn test_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = FileBlobStore::open(dir.path()).await.unwrap();
            store.put("k", json!({"v": 7})).await.unwrap();
        }
        let store = FileBlobStore::open(dir.path()).await.unwrap();
        assert_eq!(store.get("k").await.unwrap()["v"], 7);
    }

    #[tokio::test]
    async fn test_missing_key_is_not_found() {
        let (_dir, store) = open_store().await;
        assert!(store.get("absent").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_rejects_path_escaping_keys() {
        let (_dir, store) = open_store().await;
        for key in ["../evil", "a/b", "", ".hidden"] {
            let err = store.put(key, json!(1)).await.unwrap_err();
            assert!(matches!(err, StoreError::InvalidKey(_)), "key {key:?}");
        }
    }

    #[tokio::test]
    async fn test_list_skips_corrupt_documents() {
        let (dir, store) = open_store().await;
        store.put("plan:good", json!({"ok": true})).await.unwrap();
        std::fs::write(dir.path().join("plan:bad.json"), b"{not json").unwrap();

        let entries = store.list("plan:").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0, "plan:good");
    }

    #[tokio::test]
    async fn test_delete_missing_is_ok() {
        let (_dir, store) = open_store().await;
        store.delete("never-written").await.unwrap();
    }
}
