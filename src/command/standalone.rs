use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tracing::{debug, info};

use crate::command::{Command, CommandError, CommandExecutor, CommandOutcome, CommandResult};
use crate::project::ProjectManager;

/// Applies commands directly to the local store.
#[derive(Debug)]
pub struct StandaloneCommandExecutor {
    projects: ProjectManager,
    writable: AtomicBool,
}

impl StandaloneCommandExecutor {
    pub fn new(projects: ProjectManager) -> Self {
        Self {
            projects,
            writable: AtomicBool::new(true),
        }
    }

    pub fn projects(&self) -> &ProjectManager {
        &self.projects
    }

    async fn apply(&self, command: Command) -> CommandResult<CommandOutcome> {
        match command {
            Command::CreateProject { name, author } => {
                self.projects.create(name, author).await?;
                Ok(CommandOutcome::Done)
            }
            Command::RemoveProject { name } => {
                self.projects.remove(name.as_str()).await?;
                Ok(CommandOutcome::Done)
            }
            Command::UnremoveProject { name } => {
                self.projects.unremove(name.as_str()).await?;
                Ok(CommandOutcome::Done)
            }
            Command::PurgeProject { name } => {
                self.projects.mark_for_purge(name.as_str()).await?;
                Ok(CommandOutcome::Done)
            }
            Command::CreateRepository {
                project,
                name,
                author,
                encrypt,
            } => {
                let repo = self
                    .projects
                    .get(project.as_str())?
                    .repositories()
                    .create(name, author, encrypt)
                    .await?;
                Ok(CommandOutcome::Revision(repo.head_revision()))
            }
            Command::RemoveRepository { project, name } => {
                self.projects
                    .get(project.as_str())?
                    .repositories()
                    .remove(name.as_str())
                    .await?;
                Ok(CommandOutcome::Done)
            }
            Command::UnremoveRepository { project, name } => {
                let repo = self
                    .projects
                    .get(project.as_str())?
                    .repositories()
                    .unremove(name.as_str())
                    .await?;
                Ok(CommandOutcome::Revision(repo.head_revision()))
            }
            Command::PurgeRepository { project, name } => {
                self.projects
                    .get(project.as_str())?
                    .repositories()
                    .mark_for_purge(name.as_str())
                    .await?;
                Ok(CommandOutcome::Done)
            }
            Command::Push {
                project,
                repository,
                request,
                privileged,
            } => {
                if repository.is_internal() && !privileged {
                    return Err(CommandError::InvalidPush {
                        project: project.to_string(),
                        repo: repository.to_string(),
                    });
                }
                let repo = self.projects.get(project.as_str())?.repository(repository.as_str())?;
                let result = repo.commit(request).await?;
                Ok(CommandOutcome::Commit(result))
            }
            Command::UpdateServerStatus { writable } => {
                let previous = self.writable.swap(writable, Ordering::SeqCst);
                if previous != writable {
                    info!(writable, "server status changed");
                }
                Ok(CommandOutcome::Done)
            }
        }
    }
}

#[async_trait]
impl CommandExecutor for StandaloneCommandExecutor {
    async fn execute(&self, command: Command) -> CommandResult<CommandOutcome> {
        if !command.allowed_when_read_only() && !self.is_writable() {
            debug!(?command, "rejected command while read-only");
            return Err(CommandError::ReadOnly);
        }
        self.apply(command).await
    }

    fn is_writable(&self) -> bool {
        self.writable.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::repository::{Change, CommitRequest};
    use crate::storage::{Author, ProjectName, RepositoryName, Revision};
    use serde_json::json;
    use tempfile::TempDir;

    async fn executor(dir: &TempDir) -> StandaloneCommandExecutor {
        let projects = ProjectManager::open(&StoreConfig::new(dir.path()), None).await.unwrap();
        StandaloneCommandExecutor::new(projects)
    }

    fn names(project: &str, repo: &str) -> (ProjectName, RepositoryName) {
        (ProjectName::new(project).unwrap(), RepositoryName::new(repo).unwrap())
    }

    fn request() -> CommitRequest {
        CommitRequest::new(
            Revision::HEAD,
            vec![Change::upsert_json("/a.json", json!({"enabled": true})).unwrap()],
        )
        .summary("enable")
    }

    #[tokio::test]
    async fn create_and_push() {
        let dir = TempDir::new().unwrap();
        let executor = executor(&dir).await;
        let (project, repo) = names("alpha", "app");

        executor
            .execute(Command::CreateProject {
                name: project.clone(),
                author: Author::system(),
            })
            .await
            .unwrap();
        let created = executor
            .execute(Command::CreateRepository {
                project: project.clone(),
                name: repo.clone(),
                author: Author::system(),
                encrypt: None,
            })
            .await
            .unwrap();
        assert_eq!(created, CommandOutcome::Revision(Revision::INIT));

        let outcome = executor.execute(Command::push(project, repo, request())).await.unwrap();
        match outcome {
            CommandOutcome::Commit(result) => assert_eq!(result.revision, Revision::new(2)),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn internal_repositories_need_privileges() {
        let dir = TempDir::new().unwrap();
        let executor = executor(&dir).await;
        let (project, meta) = names("alpha", "meta");
        executor
            .execute(Command::CreateProject {
                name: project.clone(),
                author: Author::system(),
            })
            .await
            .unwrap();

        let err = executor
            .execute(Command::push(project.clone(), meta.clone(), request()))
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::InvalidPush { .. }));

        executor
            .execute(Command::Push {
                project,
                repository: meta,
                request: request(),
                privileged: true,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn read_only_rejects_mutations() {
        let dir = TempDir::new().unwrap();
        let executor = executor(&dir).await;
        let (project, _) = names("alpha", "app");

        executor
            .execute(Command::UpdateServerStatus { writable: false })
            .await
            .unwrap();
        assert!(!executor.is_writable());
        let err = executor
            .execute(Command::CreateProject {
                name: project.clone(),
                author: Author::system(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::ReadOnly));

        executor
            .execute(Command::UpdateServerStatus { writable: true })
            .await
            .unwrap();
        executor
            .execute(Command::CreateProject {
                name: project,
                author: Author::system(),
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn missing_targets_are_not_found() {
        let dir = TempDir::new().unwrap();
        let executor = executor(&dir).await;
        let (project, repo) = names("ghost", "app");

        let err = executor
            .execute(Command::RemoveRepository { project, name: repo })
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }
}
