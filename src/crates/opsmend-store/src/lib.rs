//! Storage abstractions for opsmend
//!
//! This crate provides the persistence layer the plan engine builds on: a
//! [`BlobStore`] trait describing a JSON-document key/value store with prefix
//! listing, an in-memory backend for development and tests, and a file-backed
//! backend that keeps one `<key>.json` document per key under a base
//! directory.
//!
//! Typed stores (plans, execution state, snapshots) live in `opsmend-core`
//! and are generic over any `BlobStore` implementation, so swapping the
//! backing (memory in tests, files in production, a database behind a custom
//! implementation) never touches engine code.

pub mod error;
pub mod file;
pub mod memory;

pub use error::{Result, StoreError};
pub use file::FileBlobStore;
pub use memory::MemoryBlobStore;

use async_trait::async_trait;
use serde_json::Value;

/// A JSON-document key/value store.
///
/// Keys are opaque UTF-8 strings; conventionally the engine namespaces them
/// with a prefix and a colon (`plan:<id>`, `snap:<id>`, `confirm:<id>`).
/// Values are complete JSON documents. Writes replace the whole document.
///
/// Implementations must serialise writers and allow concurrent readers; a
/// read started after a write returns must observe that write.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store a document under the key, replacing any existing document.
    async fn put(&self, key: &str, value: Value) -> Result<()>;

    /// Load the document stored under the key.
    ///
    /// Fails with [`StoreError::NotFound`] when the key is absent.
    async fn get(&self, key: &str) -> Result<Value>;

    /// Remove the document stored under the key. Removing an absent key is
    /// not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// List all `(key, document)` pairs whose key starts with the prefix.
    ///
    /// Documents that cannot be decoded are skipped, not fatal: a single
    /// corrupt blob must not hide the healthy ones.
    async fn list(&self, prefix: &str) -> Result<Vec<(String, Value)>>;

    /// True when a document exists under the key.
    async fn contains(&self, key: &str) -> Result<bool> {
        match self.get(key).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }
}
