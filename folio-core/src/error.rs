//! Error types for cache operations

use std::path::Path;

use thiserror::Error;

/// Malformed input rejected at the facade boundary.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Required field is empty: {field}")]
    EmptyField { field: &'static str },

    #[error("Field {field} contains a NUL byte")]
    ForbiddenByte { field: &'static str },

    #[error("Content must not be empty")]
    EmptyContent,

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

/// Disk read or write failure. Callers at the fetch layer may retry.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("I/O error during {operation} on {path}: {reason}")]
pub struct IoError {
    pub operation: &'static str,
    pub path: String,
    pub reason: String,
}

impl IoError {
    pub fn new(operation: &'static str, path: &Path, err: &std::io::Error) -> Self {
        Self {
            operation,
            path: path.display().to_string(),
            reason: err.to_string(),
        }
    }
}

/// The durable index could not be trusted.
///
/// At open this triggers a fresh index and a full consistency sweep rather
/// than a hard failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CorruptionError {
    #[error("Index unreadable: {reason}")]
    IndexUnreadable { reason: String },

    #[error("Undecodable index record: {reason}")]
    UndecodableRecord { reason: String },

    #[error("Index schema version {found} does not match expected {expected}")]
    SchemaMismatch { found: u32, expected: u32 },
}

/// Failures of the storage machinery itself.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Transaction failed: {reason}")]
    TransactionFailed { reason: String },

    #[error("Background task failed: {reason}")]
    TaskFailed { reason: String },

    #[error("Cache is closed")]
    Closed,
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {reason}")]
    Io { path: String, reason: String },

    #[error("Failed to parse config TOML: {reason}")]
    Parse { reason: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

/// Master error type for cache operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("{0}")]
    Io(#[from] IoError),

    #[error("Corruption: {0}")]
    Corruption(#[from] CorruptionError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

impl CacheError {
    /// Whether the caller may reasonably retry the same operation later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CacheError::Io(_) | CacheError::Storage(StorageError::TransactionFailed { .. })
        )
    }
}

/// Result type alias for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;

/// Error returned by `put`.
///
/// Caching is best-effort: the fetch layer should still serve the bytes it
/// just fetched when this is returned.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Cache write failed for {key}: {source}")]
pub struct CacheWriteError {
    pub key: String,
    #[source]
    pub source: CacheError,
}

impl CacheWriteError {
    pub fn new(key: impl Into<String>, source: impl Into<CacheError>) -> Self {
        Self {
            key: key.into(),
            source: source.into(),
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
