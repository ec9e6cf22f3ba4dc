//! Error types for epkv
//!
//! Provides a unified error type for all operations.

use thiserror::Error;

/// Result type alias using EpError
pub type Result<T> = std::result::Result<T, EpError>;

/// Unified error type for epkv operations
#[derive(Debug, Error)]
pub enum EpError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // -------------------------------------------------------------------------
    // Storage Errors
    // -------------------------------------------------------------------------
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Invalid metadata: {len} bytes does not match any known version")]
    InvalidMetadata { len: usize },

    #[error("Commit failed for {pending} queued items")]
    CommitFailed { pending: usize },

    #[error("No such vbucket file: {0}")]
    NoSuchFile(u16),

    // -------------------------------------------------------------------------
    // Serialization Errors
    // -------------------------------------------------------------------------
    #[error("Serialization error: {0}")]
    Serialization(String),

    // -------------------------------------------------------------------------
    // Engine Errors
    // -------------------------------------------------------------------------
    #[error("Vbucket {0} is not managed by this node")]
    NotMyVbucket(u16),

    #[error("Engine is shutting down")]
    Shutdown,

    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<bincode::Error> for EpError {
    fn from(e: bincode::Error) -> Self {
        EpError::Serialization(e.to_string())
    }
}
