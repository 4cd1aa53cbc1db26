//! Error types for storage operations

use thiserror::Error;

/// Result type for storage operations
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur during storage operations
#[derive(Error, Debug)]
pub enum StoreError {
    /// Document not found for the given key
    #[error("Document not found: {0}")]
    NotFound(String),

    /// Key contains characters the backend cannot represent
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Backend-specific storage error
    #[error("Storage error: {0}")]
    Storage(String),
}

impl StoreError {
    /// True when the error means the document simply does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}
