//! Repository layer error types.

use std::sync::Arc;

use thiserror::Error;

use crate::encryption::EncryptionStorageError;
use crate::repository::json_patch::PatchError;
use crate::storage::{Revision, StorageError};

/// Result type for repository operations.
pub type RepositoryResult<T> = Result<T, RepositoryError>;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("entry not found: {path} (revision: {revision})")]
    EntryNotFound { path: String, revision: Revision },

    /// the commit would not change anything
    #[error("redundant change: nothing changed")]
    RedundantChange,

    #[error("change conflict: {0}")]
    ChangeConflict(String),

    /// a query could not be evaluated against the entry it selected
    #[error("query execution failed: {0}")]
    QueryExecution(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("invalid path pattern: {0}")]
    InvalidPattern(String),

    /// an encrypted repository was opened without encryption configured
    #[error("encryption is not enabled; cannot open encrypted repository {0}")]
    EncryptionNotEnabled(String),

    /// a failure produced once and handed to every caller waiting on the same cached load
    #[error(transparent)]
    Shared(Arc<RepositoryError>),

    #[error("internal error: {0}")]
    Internal(String),
}

impl RepositoryError {
    pub fn is_not_found(&self) -> bool {
        match self {
            RepositoryError::EntryNotFound { .. } => true,
            RepositoryError::Storage(e) => e.is_not_found(),
            RepositoryError::Shared(e) => e.is_not_found(),
            _ => false,
        }
    }

    pub fn is_conflict(&self) -> bool {
        match self {
            RepositoryError::RedundantChange | RepositoryError::ChangeConflict(_) => true,
            RepositoryError::Storage(e) => e.is_conflict(),
            RepositoryError::Shared(e) => e.is_conflict(),
            _ => false,
        }
    }

    pub fn is_redundant(&self) -> bool {
        match self {
            RepositoryError::RedundantChange => true,
            RepositoryError::Shared(e) => e.is_redundant(),
            _ => false,
        }
    }

    /// a stale-base conflict or lost ref race; retrying against the new head may succeed
    pub fn is_retriable(&self) -> bool {
        match self {
            RepositoryError::ChangeConflict(_) => true,
            RepositoryError::Storage(e) => e.is_retriable(),
            RepositoryError::Shared(e) => e.is_retriable(),
            _ => false,
        }
    }

    pub(crate) fn entry_not_found(path: &str, revision: Revision) -> Self {
        RepositoryError::EntryNotFound {
            path: path.to_string(),
            revision,
        }
    }

    pub(crate) fn from_patch(path: &str, error: PatchError) -> Self {
        match error {
            PatchError::InvalidPointer(_) => RepositoryError::InvalidPath(format!("{}: {}", path, error)),
            PatchError::Conflict(_) | PatchError::NotApplicable(_) => {
                RepositoryError::ChangeConflict(format!("{}: {}", path, error))
            }
        }
    }
}

impl From<Arc<RepositoryError>> for RepositoryError {
    fn from(error: Arc<RepositoryError>) -> Self {
        RepositoryError::Shared(error)
    }
}

impl From<EncryptionStorageError> for RepositoryError {
    fn from(error: EncryptionStorageError) -> Self {
        RepositoryError::Storage(StorageError::Encryption(error))
    }
}

impl From<tokio::task::JoinError> for RepositoryError {
    fn from(error: tokio::task::JoinError) -> Self {
        RepositoryError::Internal(format!("blocking task failed: {}", error))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_survives_sharing() {
        let shared = RepositoryError::from(Arc::new(RepositoryError::entry_not_found("/a.json", Revision::new(2))));
        assert!(shared.is_not_found());
        assert!(!shared.is_conflict());

        let conflict = RepositoryError::Storage(StorageError::ConcurrentModification {
            reference: "refs/heads/master".to_string(),
        });
        assert!(conflict.is_conflict());
        assert!(RepositoryError::RedundantChange.is_redundant());
    }
}
