//! Plain backend: a bare git repository per repository directory.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use git2::{ErrorCode, FileMode, ObjectType, Oid, Repository};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::storage::commit::{Commit, CommitRecord};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::refs::RefManager;
use crate::storage::types::{BlobId, CommitId, TreeEntry, TreeId};

pub struct GitBackend {
    repo: Mutex<Repository>,
    path: PathBuf,
}

impl std::fmt::Debug for GitBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitBackend").field("path", &self.path).finish()
    }
}

fn not_found(e: git2::Error, what: impl FnOnce() -> StorageError) -> StorageError {
    if e.code() == ErrorCode::NotFound {
        what()
    } else {
        StorageError::Git(e)
    }
}

impl GitBackend {
    pub fn init(path: &Path) -> StorageResult<Self> {
        let repo = Repository::init_bare(path)?;
        debug!(path = %path.display(), "initialized bare repository");
        Ok(Self {
            repo: Mutex::new(repo),
            path: path.to_path_buf(),
        })
    }

    pub fn open(path: &Path) -> StorageResult<Self> {
        let repo = Repository::open_bare(path)
            .map_err(|e| not_found(e, || StorageError::NotInitialized(path.to_path_buf())))?;
        Ok(Self {
            repo: Mutex::new(repo),
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read_commit(&self, id: CommitId) -> StorageResult<CommitRecord> {
        let repo = self.repo.lock();
        let commit = repo
            .find_commit(id.raw())
            .map_err(|e| not_found(e, || StorageError::CommitNotFound(id.to_string())))?;

        let message = commit
            .message()
            .ok_or_else(|| StorageError::corrupted(format!("commit {}", id), "message is not utf-8"))?;

        Ok(CommitRecord {
            id,
            parent: commit.parent_ids().next().map(CommitId::new),
            tree: TreeId::new(commit.tree_id()),
            commit: Commit::from_message(id, message)?,
        })
    }

    pub fn write_commit(&self, parent: Option<CommitId>, tree: TreeId, commit: &Commit) -> StorageResult<CommitId> {
        let repo = self.repo.lock();
        let tree = repo
            .find_tree(tree.raw())
            .map_err(|e| not_found(e, || StorageError::ObjectNotFound(tree.to_string())))?;
        let signature = commit.author.to_git2_signature(commit.when)?;

        let parents = match parent {
            Some(id) => vec![repo
                .find_commit(id.raw())
                .map_err(|e| not_found(e, || StorageError::CommitNotFound(id.to_string())))?],
            None => Vec::new(),
        };
        let parent_refs: Vec<&git2::Commit<'_>> = parents.iter().collect();

        let oid = repo.commit(
            None,
            &signature,
            &signature,
            &commit.to_message()?,
            &tree,
            &parent_refs,
        )?;
        Ok(CommitId::new(oid))
    }

    pub fn read_ref(&self, name: &str) -> StorageResult<Option<CommitId>> {
        RefManager::resolve(&self.repo.lock(), name)
    }

    pub fn update_ref(&self, name: &str, expected: Option<CommitId>, new: CommitId) -> StorageResult<()> {
        let repo = self.repo.lock();
        match expected {
            None => RefManager::create(&repo, name, new),
            Some(expected) => RefManager::compare_and_swap(&repo, name, expected, new),
        }
    }

    pub fn list_refs(&self) -> StorageResult<Vec<(String, CommitId)>> {
        RefManager::list(&self.repo.lock())
    }

    pub fn read_tree(&self, id: TreeId) -> StorageResult<Vec<TreeEntry>> {
        let repo = self.repo.lock();
        let tree = repo
            .find_tree(id.raw())
            .map_err(|e| not_found(e, || StorageError::ObjectNotFound(id.to_string())))?;

        tree.iter()
            .map(|entry| -> StorageResult<TreeEntry> {
                let name = entry
                    .name()
                    .ok_or_else(|| StorageError::corrupted(format!("tree {}", id), "entry name is not utf-8"))?
                    .to_string();
                match entry.kind() {
                    Some(ObjectType::Tree) => Ok(TreeEntry::Tree {
                        name,
                        id: TreeId::new(entry.id()),
                    }),
                    Some(ObjectType::Blob) => Ok(TreeEntry::Blob {
                        name,
                        id: BlobId::new(entry.id()),
                    }),
                    other => Err(StorageError::UnexpectedObjectType {
                        id: entry.id().to_string(),
                        expected: "tree or blob".to_string(),
                        found: format!("{:?}", other),
                    }),
                }
            })
            .collect()
    }

    pub fn write_tree(&self, entries: &[TreeEntry]) -> StorageResult<TreeId> {
        let repo = self.repo.lock();
        let mut builder = repo.treebuilder(None)?;
        for entry in entries {
            let mode = match entry {
                TreeEntry::Tree { .. } => FileMode::Tree,
                TreeEntry::Blob { .. } => FileMode::Blob,
            };
            builder.insert(entry.name(), entry.raw(), mode.into())?;
        }
        Ok(TreeId::new(builder.write()?))
    }

    pub fn read_blob(&self, id: BlobId) -> StorageResult<Vec<u8>> {
        let repo = self.repo.lock();
        let blob = repo
            .find_blob(id.raw())
            .map_err(|e| not_found(e, || StorageError::ObjectNotFound(id.to_string())))?;
        Ok(blob.content().to_vec())
    }

    pub fn write_blob(&self, content: &[u8]) -> StorageResult<BlobId> {
        let repo = self.repo.lock();
        Ok(BlobId::new(repo.blob(content)?))
    }

    /// Delete loose objects not in `reachable`.
    ///
    /// Packed objects are left alone; nothing in this crate packs.
    pub fn remove_unreachable(&self, reachable: &HashSet<Oid>) -> StorageResult<usize> {
        let repo = self.repo.lock();
        let odb = repo.odb()?;

        let mut all = Vec::new();
        odb.foreach(|oid| {
            all.push(*oid);
            true
        })?;

        let objects_dir = repo.path().join("objects");
        let mut removed = 0;
        for oid in all.into_iter().filter(|oid| !reachable.contains(oid)) {
            let hex = oid.to_string();
            let loose = objects_dir.join(&hex[..2]).join(&hex[2..]);
            match std::fs::remove_file(&loose) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(object = %hex, error = %e, "failed to remove unreachable object");
                }
            }
        }
        Ok(removed)
    }
}
