//! Encryption storage error types.

use thiserror::Error;

/// Result type for encryption storage operations.
pub type EncryptionStorageResult<T> = Result<T, EncryptionStorageError>;

/// Failure reported by a key management service.
#[derive(Debug, Error)]
pub enum KmsError {
    #[error("failed to wrap data encryption key: {0}")]
    Wrap(String),

    #[error("failed to unwrap data encryption key: {0}")]
    Unwrap(String),
}

/// Errors that can occur in the encrypted key-value store.
#[derive(Debug, Error)]
pub enum EncryptionStorageError {
    /// Error from the underlying SQLite database.
    #[error("key-value store error: {0}")]
    Store(#[from] rusqlite::Error),

    /// The key management service failed.
    #[error("key management service error: {0}")]
    Kms(#[from] KmsError),

    /// Unwrapping a WDEK did not finish in time.
    #[error("timed out unwrapping the key of {project}/{repo} after {millis}ms")]
    Timeout {
        project: String,
        repo: String,
        millis: u64,
    },

    /// No wrapped key is stored for the repository.
    #[error("wrapped key not found for {project}/{repo}")]
    WdekNotFound { project: String, repo: String },

    /// A wrapped key is already stored for the repository.
    #[error("wrapped key already exists for {project}/{repo}")]
    WdekExists { project: String, repo: String },

    /// Encryption or decryption failed.
    #[error("cipher error: {0}")]
    Cipher(String),

    /// A key of the wrong length was supplied.
    #[error("invalid key size: expected {expected}, got {actual}")]
    InvalidKeySize { expected: usize, actual: usize },

    /// A stored record is malformed or its counterpart is missing.
    #[error("corrupted record: {0}")]
    Corrupted(String),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl EncryptionStorageError {
    /// Check if this error indicates a missing key.
    pub fn is_not_found(&self) -> bool {
        matches!(self, EncryptionStorageError::WdekNotFound { .. })
    }

    pub(crate) fn wdek_not_found(project: &str, repo: &str) -> Self {
        EncryptionStorageError::WdekNotFound {
            project: project.to_string(),
            repo: repo.to_string(),
        }
    }
}
