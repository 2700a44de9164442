//! Projects and their repositories.
//!
//! A project is a directory under the data directory holding one directory
//! per repository. Every project starts with the internal repositories
//! `dogma` and `meta`. Removal is reversible until the entry is marked for
//! purge; purged entries are deleted by [`PurgeWorker`].

mod error;
mod layout;
mod purge;
mod repositories;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

pub use error::{ProjectError, ProjectResult};
pub use purge::PurgeWorker;
pub use repositories::RepositoryManager;

use crate::config::StoreConfig;
use crate::encryption::{EncryptionStorageManager, KeyManagementService};
use crate::project::layout::EntryState;
use crate::project::repositories::purge_directory;
use crate::repository::{Repository, RepositoryCache, RepositoryContext};
use crate::storage::{Author, ProjectName, RepositoryName};

/// A live project.
#[derive(Debug, Clone)]
pub struct Project {
    name: ProjectName,
    path: PathBuf,
    repositories: RepositoryManager,
}

impl Project {
    pub fn name(&self) -> &ProjectName {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn repositories(&self) -> &RepositoryManager {
        &self.repositories
    }

    /// Shorthand for `repositories().get(name)`.
    pub fn repository(&self, name: &str) -> ProjectResult<Repository> {
        self.repositories.get(name)
    }
}

struct Inner {
    data_dir: PathBuf,
    ctx: RepositoryContext,
    encrypt_new: bool,
    projects: RwLock<BTreeMap<ProjectName, Project>>,
    lifecycle: tokio::sync::Mutex<()>,
}

/// Entry point to every project of a store.
#[derive(Clone)]
pub struct ProjectManager {
    inner: Arc<Inner>,
}

impl fmt::Debug for ProjectManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProjectManager")
            .field("data_dir", &self.inner.data_dir)
            .field("projects", &self.inner.projects.read().len())
            .field("encryption", &self.inner.ctx.encryption.is_some())
            .finish()
    }
}

impl ProjectManager {
    /// Open the store described by `config`, loading every live project.
    ///
    /// `kms` is required when encryption is enabled.
    pub async fn open(config: &StoreConfig, kms: Option<Arc<dyn KeyManagementService>>) -> ProjectResult<Self> {
        let data_dir = config.data_dir.clone();
        tokio::fs::create_dir_all(&data_dir).await?;

        if config.encryption.encrypt_new_repositories && !config.encryption.enabled {
            return Err(ProjectError::InvalidConfig(
                "encrypt_new_repositories requires encryption to be enabled".to_string(),
            ));
        }
        let encryption = if config.encryption.enabled {
            let kms = kms.ok_or_else(|| {
                ProjectError::InvalidConfig("encryption is enabled but no key management service was given".to_string())
            })?;
            let path = config.encryption_store_path();
            let timeout = config.dek_unwrap_timeout();
            let manager =
                tokio::task::spawn_blocking(move || EncryptionStorageManager::open(path, kms, timeout)).await??;
            Some(Arc::new(manager))
        } else {
            None
        };

        let ctx = RepositoryContext {
            cache: RepositoryCache::new(
                config.repository_cache.max_weight_bytes,
                std::time::Duration::from_secs(config.repository_cache.expire_after_access_secs),
            ),
            encryption,
            options: config.repository_options(),
        };
        let encrypt_new = config.encryption.encrypt_new_repositories;

        let mut projects = BTreeMap::new();
        for (name, state, path) in layout::scan(&data_dir)? {
            if state != EntryState::Live {
                continue;
            }
            let name = match ProjectName::new(name.as_str()) {
                Ok(name) => name,
                Err(e) => {
                    debug!(dir = %path.display(), error = %e, "skipping directory");
                    continue;
                }
            };
            let repositories = RepositoryManager::open(name.clone(), path.clone(), ctx.clone(), encrypt_new).await?;
            projects.insert(
                name.clone(),
                Project {
                    name,
                    path,
                    repositories,
                },
            );
        }
        info!(data_dir = %data_dir.display(), projects = projects.len(), "opened project store");

        Ok(Self {
            inner: Arc::new(Inner {
                data_dir,
                ctx,
                encrypt_new,
                projects: RwLock::new(projects),
                lifecycle: tokio::sync::Mutex::new(()),
            }),
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.inner.data_dir
    }

    /// Collaborators shared by every repository of this store.
    pub fn context(&self) -> &RepositoryContext {
        &self.inner.ctx
    }

    /// Create a project together with its internal repositories.
    pub async fn create(&self, name: ProjectName, author: Author) -> ProjectResult<Project> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        let data_dir = &self.inner.data_dir;
        let path = layout::live_path(data_dir, name.as_str());
        let open = self.inner.projects.read().contains_key(&name);
        if open
            || path.exists()
            || layout::removed_path(data_dir, name.as_str()).exists()
        {
            return Err(ProjectError::ProjectExists(name.to_string()));
        }

        self.purge_projects(|candidate| candidate == name.as_str()).await?;

        tokio::fs::create_dir_all(&path).await?;
        let repositories =
            RepositoryManager::open(name.clone(), path.clone(), self.inner.ctx.clone(), self.inner.encrypt_new).await?;
        for internal in RepositoryName::INTERNAL {
            let repo = RepositoryName::new(*internal)?;
            if let Err(e) = repositories.create(repo, author.clone(), None).await {
                warn!(project = %name, error = %e, "failed to create internal repository, rolling back");
                let target = layout::purged_path(data_dir, name.as_str());
                if tokio::fs::rename(&path, &target).await.is_ok() {
                    if let Err(cleanup) = self.purge_projects(|candidate| candidate == name.as_str()).await {
                        warn!(project = %name, error = %cleanup, "rollback left data behind");
                    }
                }
                return Err(e);
            }
        }

        let project = Project {
            name: name.clone(),
            path,
            repositories,
        };
        self.inner.projects.write().insert(name.clone(), project.clone());
        info!(project = %name, "created project");
        Ok(project)
    }

    pub fn get(&self, name: &str) -> ProjectResult<Project> {
        let key = ProjectName::new(name).map_err(|_| ProjectError::ProjectNotFound(name.to_string()))?;
        self.inner
            .projects
            .read()
            .get(&key)
            .cloned()
            .ok_or_else(|| ProjectError::ProjectNotFound(name.to_string()))
    }

    pub fn exists(&self, name: &str) -> bool {
        self.get(name).is_ok()
    }

    /// Live projects, sorted by name.
    pub fn list(&self) -> BTreeMap<ProjectName, Project> {
        self.inner.projects.read().clone()
    }

    /// Names of removed projects that can still be restored.
    pub fn list_removed(&self) -> ProjectResult<BTreeSet<ProjectName>> {
        Ok(layout::scan(&self.inner.data_dir)?
            .into_iter()
            .filter(|(_, state, _)| *state == EntryState::Removed)
            .filter_map(|(name, _, _)| ProjectName::new(name).ok())
            .collect())
    }

    /// Remove a project; it can be restored with [`unremove`](Self::unremove).
    pub async fn remove(&self, name: &str) -> ProjectResult<()> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        let project = self.get(name)?;
        let removed = layout::removed_path(&self.inner.data_dir, name);
        if removed.exists() {
            return Err(ProjectError::ProjectExists(format!("{name} (removed)")));
        }

        tokio::fs::rename(&project.path, &removed).await?;
        self.inner.projects.write().remove(&project.name);
        info!(project = name, "removed project");
        Ok(())
    }

    /// Restore a removed project and reopen its repositories.
    pub async fn unremove(&self, name: &str) -> ProjectResult<Project> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        let key = ProjectName::new(name)?;
        let removed = layout::removed_path(&self.inner.data_dir, name);
        if !removed.exists() {
            return Err(ProjectError::ProjectNotFound(name.to_string()));
        }
        let path = layout::live_path(&self.inner.data_dir, name);
        if path.exists() {
            return Err(ProjectError::ProjectExists(name.to_string()));
        }

        tokio::fs::rename(&removed, &path).await?;
        let repositories =
            RepositoryManager::open(key.clone(), path.clone(), self.inner.ctx.clone(), self.inner.encrypt_new).await?;
        let project = Project {
            name: key.clone(),
            path,
            repositories,
        };
        self.inner.projects.write().insert(key, project.clone());
        info!(project = name, "restored project");
        Ok(project)
    }

    /// Mark a live or removed project for purging.
    pub async fn mark_for_purge(&self, name: &str) -> ProjectResult<()> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        let target = layout::purged_path(&self.inner.data_dir, name);

        if let Ok(project) = self.get(name) {
            tokio::fs::rename(&project.path, &target).await?;
            self.inner.projects.write().remove(&project.name);
        } else {
            let removed = layout::removed_path(&self.inner.data_dir, name);
            if !removed.exists() {
                return Err(ProjectError::ProjectNotFound(name.to_string()));
            }
            tokio::fs::rename(&removed, &target).await?;
        }
        info!(project = name, "marked project for purge");
        Ok(())
    }

    /// Delete every project and repository marked for purge. Returns the
    /// number of directories deleted.
    pub async fn purge_marked(&self) -> ProjectResult<usize> {
        let mut purged = {
            let _lifecycle = self.inner.lifecycle.lock().await;
            self.purge_projects(|_| true).await?
        };
        let projects: Vec<Project> = self.inner.projects.read().values().cloned().collect();
        for project in projects {
            purged += project.repositories.purge_marked().await?;
        }
        Ok(purged)
    }

    async fn purge_projects(&self, mut filter: impl FnMut(&str) -> bool) -> ProjectResult<usize> {
        let encryption = self.inner.ctx.encryption.as_ref();
        let mut purged = 0;
        for (name, state, path) in layout::scan(&self.inner.data_dir)? {
            if state != EntryState::Purged || !filter(name.as_str()) {
                continue;
            }
            // every repository inside, whatever its own state, carries key material under this project name
            for (repo, _, repo_path) in layout::scan(&path)? {
                purge_directory(encryption, &name, &repo, &repo_path).await?;
            }
            tokio::fs::remove_dir_all(&path).await?;
            info!(project = %name, "purged project");
            purged += 1;
        }
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encryption::LocalKeyManagementService;
    use crate::repository::{Change, CommitRequest, Query};
    use crate::storage::Revision;
    use serde_json::json;
    use tempfile::TempDir;

    fn project_name(name: &str) -> ProjectName {
        ProjectName::new(name).unwrap()
    }

    #[tokio::test]
    async fn create_makes_internal_repositories() {
        let dir = TempDir::new().unwrap();
        let manager = ProjectManager::open(&StoreConfig::new(dir.path()), None).await.unwrap();

        let project = manager.create(project_name("alpha"), Author::system()).await.unwrap();
        let names: Vec<String> = project
            .repositories()
            .list()
            .into_keys()
            .map(|n| n.as_str().to_string())
            .collect();
        assert_eq!(names, vec!["dogma".to_string(), "meta".to_string()]);

        assert!(manager
            .create(project_name("alpha"), Author::system())
            .await
            .unwrap_err()
            .is_conflict());
        assert!(manager.get("beta").unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn projects_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let config = StoreConfig::new(dir.path());
        {
            let manager = ProjectManager::open(&config, None).await.unwrap();
            let project = manager.create(project_name("alpha"), Author::system()).await.unwrap();
            let repo = project
                .repositories()
                .create(RepositoryName::new("app").unwrap(), Author::system(), None)
                .await
                .unwrap();
            repo.commit(CommitRequest::new(
                Revision::HEAD,
                vec![Change::upsert_json("/a.json", json!({"x": 1})).unwrap()],
            ))
            .await
            .unwrap();
            manager.create(project_name("beta"), Author::system()).await.unwrap();
            manager.remove("beta").await.unwrap();
        }

        let manager = ProjectManager::open(&config, None).await.unwrap();
        assert_eq!(manager.list().len(), 1);
        assert!(manager.list_removed().unwrap().contains(&project_name("beta")));

        let repo = manager.get("alpha").unwrap().repository("app").unwrap();
        assert_eq!(repo.head_revision(), Revision::new(2));
        let entry = repo.get(Revision::HEAD, &Query::identity("/a.json").unwrap()).await.unwrap();
        assert_eq!(entry.as_json(), Some(&json!({"x": 1})));

        manager.unremove("beta").await.unwrap();
        assert!(manager.get("beta").unwrap().repository("meta").is_ok());
    }

    #[tokio::test]
    async fn purge_marked_project() {
        let dir = TempDir::new().unwrap();
        let manager = ProjectManager::open(&StoreConfig::new(dir.path()), None).await.unwrap();
        manager.create(project_name("alpha"), Author::system()).await.unwrap();
        manager.remove("alpha").await.unwrap();
        manager.mark_for_purge("alpha").await.unwrap();
        assert!(manager.list_removed().unwrap().is_empty());

        assert_eq!(manager.purge_marked().await.unwrap(), 1);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
        assert!(manager.mark_for_purge("alpha").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn encryption_requires_a_key_service() {
        let dir = TempDir::new().unwrap();
        let config = StoreConfig::new(dir.path()).encryption(true, true);
        let err = ProjectManager::open(&config, None).await.unwrap_err();
        assert!(matches!(err, ProjectError::InvalidConfig(_)));

        let config = StoreConfig::new(dir.path()).encryption(false, true);
        assert!(ProjectManager::open(&config, None).await.is_err());
    }

    #[tokio::test]
    async fn purging_encrypted_repository_deletes_its_keys() {
        let dir = TempDir::new().unwrap();
        let config = StoreConfig::new(dir.path()).encryption(true, true);
        let kms: Arc<dyn KeyManagementService> = Arc::new(LocalKeyManagementService::generate());
        let manager = ProjectManager::open(&config, Some(kms)).await.unwrap();

        let project = manager.create(project_name("secret"), Author::system()).await.unwrap();
        let repo = project
            .repositories()
            .create(RepositoryName::new("app").unwrap(), Author::system(), None)
            .await
            .unwrap();
        assert!(repo.is_encrypted());

        let encryption = manager.context().encryption.clone().unwrap();
        assert!(encryption.has_wdek("secret", "app").unwrap());

        project.repositories().mark_for_purge("app").await.unwrap();
        assert_eq!(manager.purge_marked().await.unwrap(), 1);
        assert!(!encryption.has_wdek("secret", "app").unwrap());
        assert!(encryption.has_wdek("secret", "meta").unwrap());
    }
}
