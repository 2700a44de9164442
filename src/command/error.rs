use thiserror::Error;

use crate::project::ProjectError;
use crate::repository::RepositoryError;

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("the store is read-only")]
    ReadOnly,

    #[error("pushes to internal repository {project}/{repo} require privileges")]
    InvalidPush { project: String, repo: String },

    #[error(transparent)]
    Project(#[from] ProjectError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

impl CommandError {
    pub fn is_not_found(&self) -> bool {
        match self {
            CommandError::Project(e) => e.is_not_found(),
            CommandError::Repository(e) => e.is_not_found(),
            _ => false,
        }
    }

    pub fn is_conflict(&self) -> bool {
        match self {
            CommandError::Project(e) => e.is_conflict(),
            CommandError::Repository(e) => e.is_conflict(),
            _ => false,
        }
    }

    pub fn is_retriable(&self) -> bool {
        match self {
            CommandError::Repository(e) => e.is_retriable(),
            _ => false,
        }
    }
}

pub type CommandResult<T> = Result<T, CommandError>;
