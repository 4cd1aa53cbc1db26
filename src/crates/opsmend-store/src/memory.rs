//! In-memory document storage for development and testing
//!
//! [`MemoryBlobStore`] keeps every document in a `HashMap` behind a
//! read/write lock. Data is lost on restart; use [`crate::FileBlobStore`]
//! where documents must survive the process.

use crate::{BlobStore, Result, StoreError};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Thread-safe in-memory [`BlobStore`] implementation.
///
/// Cloning is cheap and clones share the same underlying map.
#[derive(Clone, Default)]
pub struct MemoryBlobStore {
    documents: Arc<RwLock<HashMap<String, Value>>>,
}

impl MemoryBlobStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored documents.
    pub fn len(&self) -> usize {
        self.documents.read().len()
    }

    /// True when no documents are stored.
    pub fn is_empty(&self) -> bool {
        self.documents.read().is_empty()
    }

    /// Remove every document. Intended for test isolation.
    pub fn clear(&self) {
        self.documents.write().clear();
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, key: &str, value: Value) -> Result<()> {
        self.documents.write().insert(key.to_string(), value);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Value> {
        self.documents
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.documents.write().remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<(String, Value)>> {
        let documents = self.documents.read();
        let mut entries: Vec<(String, Value)> = documents
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(entries)
    }
}
