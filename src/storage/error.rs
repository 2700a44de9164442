//! Storage layer error types
//!
//! All errors that can occur while reading or writing the commit graph and
//! the commit-id index are defined here.

use std::path::PathBuf;

use thiserror::Error;

use crate::encryption::EncryptionStorageError;
use crate::storage::revision::Revision;
use crate::storage::types::InvalidNameError;

/// the main error type for storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    /// error from the underlying Git library
    #[error("git error: {0}")]
    Git(#[from] git2::Error),

    /// error from the encrypted key-value store or the key management service
    #[error("encryption storage error: {0}")]
    Encryption(#[from] EncryptionStorageError),

    /// JSON serialization or deserialization failed
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error (filesystem level)
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// invalid project or repository name
    #[error("invalid name: {0}")]
    InvalidName(#[from] InvalidNameError),

    /// the revision does not exist in this repository
    #[error("revision not found: {0}")]
    RevisionNotFound(Revision),

    /// the commit was not found
    #[error("commit not found: {0}")]
    CommitNotFound(String),

    /// a tree or blob was not found
    #[error("object not found: {0}")]
    ObjectNotFound(String),

    /// the ref was not found
    #[error("ref not found: {0}")]
    RefNotFound(String),

    /// ref update failed because its value changed since it was read
    #[error("concurrent modification: {reference} was updated by another writer")]
    ConcurrentModification { reference: String },

    /// data integrity check failed
    #[error("corrupted data at {location}: {reason}")]
    CorruptedData { location: String, reason: String },

    /// the object has an unexpected type
    #[error("unexpected object type for {id}: expected {expected}, found {found}")]
    UnexpectedObjectType {
        id: String,
        expected: String,
        found: String,
    },

    /// the commit-id index has no entries
    #[error("commit-id index is empty")]
    EmptyIndex,

    /// appending to the index skipped or repeated a revision
    #[error("commit-id index out of order: expected revision {expected}, got {actual}")]
    IndexOutOfOrder { expected: Revision, actual: Revision },

    /// repo is not initialized
    #[error("repository not initialized: {0}")]
    NotInitialized(PathBuf),

    /// internal error that shouldn't happen
    #[error("internal error: {0}")]
    Internal(String),
}

impl StorageError {
    /// check if this error indicates the resource doesn't exist
    pub fn is_not_found(&self) -> bool {
        match self {
            StorageError::RevisionNotFound(_)
            | StorageError::CommitNotFound(_)
            | StorageError::ObjectNotFound(_)
            | StorageError::RefNotFound(_) => true,
            StorageError::Encryption(e) => e.is_not_found(),
            _ => false,
        }
    }

    /// check if this error is a conflict
    pub fn is_conflict(&self) -> bool {
        matches!(self, StorageError::ConcurrentModification { .. })
    }

    /// check if this error is recoverable by retry
    pub fn is_retriable(&self) -> bool {
        matches!(self, StorageError::ConcurrentModification { .. })
    }

    pub(crate) fn corrupted(location: impl Into<String>, reason: impl Into<String>) -> Self {
        StorageError::CorruptedData {
            location: location.into(),
            reason: reason.into(),
        }
    }
}

/// result type alias for storage operations
pub type StorageResult<T> = Result<T, StorageError>;
