//! Project and repository lifecycle errors.

use thiserror::Error;

use crate::encryption::EncryptionStorageError;
use crate::repository::RepositoryError;
use crate::storage::InvalidNameError;

#[derive(Debug, Error)]
pub enum ProjectError {
    #[error("project not found: {0}")]
    ProjectNotFound(String),

    #[error("project already exists: {0}")]
    ProjectExists(String),

    #[error("repository not found: {project}/{repo}")]
    RepositoryNotFound { project: String, repo: String },

    #[error("repository already exists: {project}/{repo}")]
    RepositoryExists { project: String, repo: String },

    #[error("invalid name: {0}")]
    InvalidName(#[from] InvalidNameError),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error("encryption storage error: {0}")]
    Encryption(#[from] EncryptionStorageError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ProjectError {
    pub fn is_not_found(&self) -> bool {
        match self {
            ProjectError::ProjectNotFound(_) | ProjectError::RepositoryNotFound { .. } => true,
            ProjectError::Repository(e) => e.is_not_found(),
            _ => false,
        }
    }

    pub fn is_conflict(&self) -> bool {
        match self {
            ProjectError::ProjectExists(_) | ProjectError::RepositoryExists { .. } => true,
            ProjectError::Repository(e) => e.is_conflict(),
            _ => false,
        }
    }

    pub(crate) fn repository_not_found(project: &str, repo: &str) -> Self {
        ProjectError::RepositoryNotFound {
            project: project.to_string(),
            repo: repo.to_string(),
        }
    }

    pub(crate) fn repository_exists(project: &str, repo: &str) -> Self {
        ProjectError::RepositoryExists {
            project: project.to_string(),
            repo: repo.to_string(),
        }
    }
}

impl From<tokio::task::JoinError> for ProjectError {
    fn from(e: tokio::task::JoinError) -> Self {
        ProjectError::Internal(e.to_string())
    }
}

pub type ProjectResult<T> = Result<T, ProjectError>;
