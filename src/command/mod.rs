//! Mutating operations as values.
//!
//! Every change to the store goes through a [`CommandExecutor`], so a
//! replicating executor can order commands before they are applied. The
//! standalone executor applies them directly.

mod error;
mod standalone;

use async_trait::async_trait;

pub use error::{CommandError, CommandResult};
pub use standalone::StandaloneCommandExecutor;

use crate::repository::{CommitRequest, CommitResult};
use crate::storage::{Author, ProjectName, RepositoryName, Revision};

#[derive(Debug, Clone)]
pub enum Command {
    CreateProject {
        name: ProjectName,
        author: Author,
    },
    RemoveProject {
        name: ProjectName,
    },
    UnremoveProject {
        name: ProjectName,
    },
    PurgeProject {
        name: ProjectName,
    },
    CreateRepository {
        project: ProjectName,
        name: RepositoryName,
        author: Author,
        /// `None` follows the store default
        encrypt: Option<bool>,
    },
    RemoveRepository {
        project: ProjectName,
        name: RepositoryName,
    },
    UnremoveRepository {
        project: ProjectName,
        name: RepositoryName,
    },
    PurgeRepository {
        project: ProjectName,
        name: RepositoryName,
    },
    Push {
        project: ProjectName,
        repository: RepositoryName,
        request: CommitRequest,
        /// allows pushing to internal repositories
        privileged: bool,
    },
    UpdateServerStatus {
        writable: bool,
    },
}

impl Command {
    pub fn push(project: ProjectName, repository: RepositoryName, request: CommitRequest) -> Self {
        Command::Push {
            project,
            repository,
            request,
            privileged: false,
        }
    }

    /// whether a read-only store still accepts this command
    pub fn allowed_when_read_only(&self) -> bool {
        matches!(self, Command::UpdateServerStatus { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    Done,
    /// the head after a repository was created or restored
    Revision(Revision),
    Commit(CommitResult),
}

#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn execute(&self, command: Command) -> CommandResult<CommandOutcome>;

    fn is_writable(&self) -> bool;
}
