//! Error types for the storage layer

use thiserror::Error;

/// Result type alias for storage operations
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors raised by the device catalog and lock backends
#[derive(Debug, Error)]
pub enum StoreError {
    /// Query or connection failure
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// The configured database host cannot be used
    #[error("Invalid database host '{0}'")]
    InvalidHost(String),

    /// The lock backend answered with an error instead of a lock state
    #[error("Lock backend error on '{name}': {message}")]
    Lock {
        /// Name of the lock involved
        name: String,
        /// What went wrong
        message: String,
    },
}

impl StoreError {
    pub fn lock(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Lock {
            name: name.into(),
            message: message.into(),
        }
    }
}
