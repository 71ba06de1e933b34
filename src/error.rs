//! Error types for SaltKV
//!
//! Provides a unified error type for all store operations.

use std::time::Duration;

use thiserror::Error;

/// Result type alias using StoreError
pub type Result<T> = std::result::Result<T, StoreError>;

/// Unified error type for SaltKV operations
#[derive(Debug, Error)]
pub enum StoreError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Could not acquire every slot lock an operation needed within the
    /// configured budget. Reported as an I/O failure, never retried here.
    #[error("IO timeout: could not lock slots within {waited:?}")]
    LockTimeout { waited: Duration },

    // -------------------------------------------------------------------------
    // Store Errors
    // -------------------------------------------------------------------------
    /// A different block already occupies the only slot holding this key
    /// and overwriting was refused.
    #[error("Key collision: a different block is stored under this key")]
    KeyCollision,

    #[error("Store file corrupt: {0}")]
    Corrupt(String),

    /// Block bytes did not verify against the key they were stored under
    #[error("Block verification failed: {0}")]
    Verify(String),

    /// The store has been closed
    #[error("Store is closed")]
    Closed,

    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),
}
