//! Repositories of one project.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::encryption::EncryptionStorageManager;
use crate::project::error::{ProjectError, ProjectResult};
use crate::project::layout::{self, EntryState};
use crate::repository::{Repository, RepositoryContext};
use crate::storage::{is_encrypted, Author, ProjectName, RepositoryName};

struct Inner {
    project: ProjectName,
    dir: PathBuf,
    ctx: RepositoryContext,
    encrypt_new: bool,
    repos: RwLock<BTreeMap<RepositoryName, Repository>>,
    /// serializes create, remove, unremove and purge
    lifecycle: tokio::sync::Mutex<()>,
}

/// Creates, removes and looks up the repositories of a project.
#[derive(Clone)]
pub struct RepositoryManager {
    inner: Arc<Inner>,
}

impl fmt::Debug for RepositoryManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RepositoryManager")
            .field("project", &self.inner.project)
            .field("dir", &self.inner.dir)
            .field("repositories", &self.inner.repos.read().len())
            .finish()
    }
}

impl RepositoryManager {
    /// Open every live repository under `dir`.
    pub(crate) async fn open(
        project: ProjectName,
        dir: PathBuf,
        ctx: RepositoryContext,
        encrypt_new: bool,
    ) -> ProjectResult<Self> {
        let mut repos = BTreeMap::new();
        for (name, state, path) in layout::scan(&dir)? {
            if state != EntryState::Live {
                continue;
            }
            let name = match RepositoryName::new(name.as_str()) {
                Ok(name) => name,
                Err(e) => {
                    debug!(project = %project, dir = %path.display(), error = %e, "skipping directory");
                    continue;
                }
            };
            let repo = Repository::open(project.clone(), name.clone(), path, &ctx).await?;
            repos.insert(name, repo);
        }
        debug!(project = %project, repositories = repos.len(), "opened repositories");

        Ok(Self {
            inner: Arc::new(Inner {
                project,
                dir,
                ctx,
                encrypt_new,
                repos: RwLock::new(repos),
                lifecycle: tokio::sync::Mutex::new(()),
            }),
        })
    }

    pub fn project(&self) -> &ProjectName {
        &self.inner.project
    }

    /// Create a repository. `encrypt` overrides the store default.
    pub async fn create(&self, name: RepositoryName, author: Author, encrypt: Option<bool>) -> ProjectResult<Repository> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        let project = self.inner.project.as_str();
        let live = layout::live_path(&self.inner.dir, name.as_str());
        let open = self.inner.repos.read().contains_key(&name);
        if open
            || live.exists()
            || layout::removed_path(&self.inner.dir, name.as_str()).exists()
        {
            return Err(ProjectError::repository_exists(project, name.as_str()));
        }

        // data of an earlier repository with this name must go before the name is reused
        self.purge_matching(|candidate| candidate == name.as_str()).await?;

        let encrypt = encrypt.unwrap_or(self.inner.encrypt_new);
        let when = chrono::Utc::now().timestamp_millis();
        let created = Repository::create(
            self.inner.project.clone(),
            name.clone(),
            live.clone(),
            author,
            when,
            encrypt,
            &self.inner.ctx,
        )
        .await;

        match created {
            Ok(repo) => {
                self.inner.repos.write().insert(name, repo.clone());
                Ok(repo)
            }
            Err(e) => {
                warn!(project, repo = %name, error = %e, "repository creation failed, cleaning up");
                if live.exists() {
                    if let Err(cleanup) = tokio::fs::remove_dir_all(&live).await {
                        warn!(project, repo = %name, error = %cleanup, "failed to remove partial repository");
                    }
                }
                if encrypt {
                    if let Some(manager) = &self.inner.ctx.encryption {
                        if let Err(cleanup) = manager.delete_repository_data(project, name.as_str()).await {
                            warn!(project, repo = %name, error = %cleanup, "failed to remove partial key material");
                        }
                    }
                }
                Err(e.into())
            }
        }
    }

    pub fn get(&self, name: &str) -> ProjectResult<Repository> {
        let project = self.inner.project.as_str();
        let key = RepositoryName::new(name).map_err(|_| ProjectError::repository_not_found(project, name))?;
        self.inner
            .repos
            .read()
            .get(&key)
            .cloned()
            .ok_or_else(|| ProjectError::repository_not_found(project, name))
    }

    pub fn exists(&self, name: &str) -> bool {
        self.get(name).is_ok()
    }

    /// Live repositories, sorted by name.
    pub fn list(&self) -> BTreeMap<RepositoryName, Repository> {
        self.inner.repos.read().clone()
    }

    /// Names of removed repositories that can still be restored.
    pub fn list_removed(&self) -> ProjectResult<BTreeSet<RepositoryName>> {
        Ok(layout::scan(&self.inner.dir)?
            .into_iter()
            .filter(|(_, state, _)| *state == EntryState::Removed)
            .filter_map(|(name, _, _)| RepositoryName::new(name).ok())
            .collect())
    }

    /// Remove a repository; it can be restored with [`unremove`](Self::unremove).
    pub async fn remove(&self, name: &str) -> ProjectResult<()> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        let project = self.inner.project.as_str();
        let repo = self.get(name)?;
        let removed = layout::removed_path(&self.inner.dir, name);
        if removed.exists() {
            return Err(ProjectError::repository_exists(project, &format!("{name} (removed)")));
        }

        tokio::fs::rename(repo.path(), &removed).await?;
        self.inner.repos.write().remove(repo.name());
        info!(project, repo = name, "removed repository");
        Ok(())
    }

    /// Restore a removed repository.
    pub async fn unremove(&self, name: &str) -> ProjectResult<Repository> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        let project = self.inner.project.as_str();
        let key = RepositoryName::new(name)?;
        let removed = layout::removed_path(&self.inner.dir, name);
        if !removed.exists() {
            return Err(ProjectError::repository_not_found(project, name));
        }
        let live = layout::live_path(&self.inner.dir, name);
        if live.exists() {
            return Err(ProjectError::repository_exists(project, name));
        }

        tokio::fs::rename(&removed, &live).await?;
        let repo = Repository::open(self.inner.project.clone(), key.clone(), live, &self.inner.ctx).await?;
        self.inner.repos.write().insert(key, repo.clone());
        info!(project, repo = name, "restored repository");
        Ok(repo)
    }

    /// Mark a live or removed repository for purging. The purge worker
    /// deletes it later; the name is free immediately.
    pub async fn mark_for_purge(&self, name: &str) -> ProjectResult<()> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        let project = self.inner.project.as_str();
        let target = layout::purged_path(&self.inner.dir, name);

        if let Ok(repo) = self.get(name) {
            tokio::fs::rename(repo.path(), &target).await?;
            self.inner.repos.write().remove(repo.name());
        } else {
            let removed = layout::removed_path(&self.inner.dir, name);
            if !removed.exists() {
                return Err(ProjectError::repository_not_found(project, name));
            }
            tokio::fs::rename(&removed, &target).await?;
        }
        info!(project, repo = name, "marked repository for purge");
        Ok(())
    }

    /// Delete every repository marked for purge, returning how many were deleted.
    pub async fn purge_marked(&self) -> ProjectResult<usize> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        self.purge_matching(|_| true).await
    }

    async fn purge_matching(&self, mut filter: impl FnMut(&str) -> bool) -> ProjectResult<usize> {
        let mut purged = 0;
        for (name, state, path) in layout::scan(&self.inner.dir)? {
            if state != EntryState::Purged || !filter(name.as_str()) {
                continue;
            }
            purge_directory(self.inner.ctx.encryption.as_ref(), self.inner.project.as_str(), &name, &path).await?;
            purged += 1;
        }
        Ok(purged)
    }
}

/// Delete one repository directory and, when it was encrypted, its records
/// and wrapped key.
pub(crate) async fn purge_directory(
    encryption: Option<&Arc<EncryptionStorageManager>>,
    project: &str,
    repo: &str,
    path: &Path,
) -> ProjectResult<()> {
    if is_encrypted(path) {
        match encryption {
            Some(manager) => manager.delete_repository_data(project, repo).await?,
            None => warn!(project, repo, "encryption disabled, leaving encrypted records in place"),
        }
    }
    tokio::fs::remove_dir_all(path).await?;
    info!(project, repo, path = %path.display(), "purged repository");
    Ok(())
}
