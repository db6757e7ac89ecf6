//! Error types for the store.

use crate::types::RecordId;
use thiserror::Error;

/// Main error type for store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Validation failed on {table}: {message}")]
    Validation { table: String, message: String },

    #[error("Record {id} not found in {table}")]
    NotFound { table: String, id: RecordId },

    #[error("Invalid query definition: {0}")]
    QueryDefinition(String),

    #[error("Unknown table: {0}")]
    UnknownTable(String),

    #[error("On-disk schema version {on_disk} is newer than the known version {known}")]
    SchemaTooNew { on_disk: u32, known: u32 },

    #[error("Invalid schema declaration: {0}")]
    InvalidSchema(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Invalid store format: {0}")]
    InvalidFormat(String),

    #[error("Checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: u32, got: u32 },

    #[error("Store is locked by another process")]
    Locked,

    #[error("Store not initialized")]
    NotInitialized,
}

impl StoreError {
    pub(crate) fn validation(table: &str, message: impl Into<String>) -> Self {
        StoreError::Validation {
            table: table.to_string(),
            message: message.into(),
        }
    }

    pub(crate) fn not_found(table: &str, id: RecordId) -> Self {
        StoreError::NotFound {
            table: table.to_string(),
            id,
        }
    }

    /// Underlying persistence is unavailable or corrupt.
    ///
    /// The store never retries these; the caller may reset and reseed.
    pub fn is_storage_fault(&self) -> bool {
        matches!(
            self,
            StoreError::Io(_)
                | StoreError::Serialization(_)
                | StoreError::Deserialization(_)
                | StoreError::Corruption(_)
                | StoreError::InvalidFormat(_)
                | StoreError::ChecksumMismatch { .. }
                | StoreError::Locked
        )
    }

    /// Errors the caller can correct and retry without touching the store.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            StoreError::Validation { .. }
                | StoreError::NotFound { .. }
                | StoreError::QueryDefinition(_)
                | StoreError::UnknownTable(_)
        )
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for StoreError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for StoreError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        StoreError::Deserialization(e.to_string())
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
