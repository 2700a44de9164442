//! Object store backends.
//!
//! Both backends store the same logical commit graph: blobs, trees listing
//! named blobs and subtrees, and commits pointing at a parent and a tree.
//! [`Backend`] picks one at open time from the marker file in the repository
//! directory and dispatches every call to it.

mod encrypted;
mod git;

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use git2::Oid;
use tracing::info;

pub use encrypted::EncryptedBackend;
pub use git::GitBackend;

use crate::encryption::{Dek, EncryptionStorageManager, RepositoryKeys};
use crate::storage::commit::{Commit, CommitRecord};
use crate::storage::error::StorageResult;
use crate::storage::types::{BlobId, CommitId, TreeEntry, TreeId};

/// the only branch of a repository
pub const MAIN_REF: &str = "refs/heads/master";

/// file whose presence in a repository directory selects the encrypted backend
pub const ENCRYPTION_MARKER: &str = ".encryption-repo-placeholder";

/// check whether the repository at `path` uses the encrypted backend
pub fn is_encrypted(path: &Path) -> bool {
    path.join(ENCRYPTION_MARKER).is_file()
}

/// A repository's object store.
#[derive(Debug)]
pub enum Backend {
    Git(GitBackend),
    Encrypted(EncryptedBackend),
}

impl Backend {
    /// create a plain repository at `path`
    pub fn init_git(path: &Path) -> StorageResult<Self> {
        Ok(Backend::Git(GitBackend::init(path)?))
    }

    /// create an encrypted repository whose directory is `path`
    ///
    /// The directory only holds the marker file; everything else lives in the
    /// shared encrypted store.
    pub fn init_encrypted(
        path: &Path,
        manager: Arc<EncryptionStorageManager>,
        dek: Dek,
        keys: RepositoryKeys,
    ) -> StorageResult<Self> {
        std::fs::create_dir_all(path)?;
        std::fs::write(path.join(ENCRYPTION_MARKER), b"")?;
        info!(path = %path.display(), "created encrypted repository");
        Ok(Backend::Encrypted(EncryptedBackend::new(manager, dek, keys)))
    }

    pub fn open_git(path: &Path) -> StorageResult<Self> {
        Ok(Backend::Git(GitBackend::open(path)?))
    }

    pub fn open_encrypted(manager: Arc<EncryptionStorageManager>, dek: Dek, keys: RepositoryKeys) -> Self {
        Backend::Encrypted(EncryptedBackend::new(manager, dek, keys))
    }

    pub fn is_encrypted(&self) -> bool {
        matches!(self, Backend::Encrypted(_))
    }

    /// the commit the main branch points to, if any
    pub fn resolve_head(&self) -> StorageResult<Option<CommitId>> {
        self.read_ref(MAIN_REF)
    }

    pub fn read_commit(&self, id: CommitId) -> StorageResult<CommitRecord> {
        match self {
            Backend::Git(b) => b.read_commit(id),
            Backend::Encrypted(b) => b.read_commit(id),
        }
    }

    pub fn write_commit(&self, parent: Option<CommitId>, tree: TreeId, commit: &Commit) -> StorageResult<CommitId> {
        match self {
            Backend::Git(b) => b.write_commit(parent, tree, commit),
            Backend::Encrypted(b) => b.write_commit(parent, tree, commit),
        }
    }

    pub fn read_ref(&self, name: &str) -> StorageResult<Option<CommitId>> {
        match self {
            Backend::Git(b) => b.read_ref(name),
            Backend::Encrypted(b) => b.read_ref(name),
        }
    }

    /// Point `name` at `new` if it still points at `expected`.
    ///
    /// `expected == None` requires the ref not to exist yet. A mismatch
    /// fails with `ConcurrentModification`.
    pub fn update_ref(&self, name: &str, expected: Option<CommitId>, new: CommitId) -> StorageResult<()> {
        match self {
            Backend::Git(b) => b.update_ref(name, expected, new),
            Backend::Encrypted(b) => b.update_ref(name, expected, new),
        }
    }

    pub fn list_refs(&self) -> StorageResult<Vec<(String, CommitId)>> {
        match self {
            Backend::Git(b) => b.list_refs(),
            Backend::Encrypted(b) => b.list_refs(),
        }
    }

    pub fn read_tree(&self, id: TreeId) -> StorageResult<Vec<TreeEntry>> {
        match self {
            Backend::Git(b) => b.read_tree(id),
            Backend::Encrypted(b) => b.read_tree(id),
        }
    }

    /// write a tree; entry names must be unique
    pub fn write_tree(&self, entries: &[TreeEntry]) -> StorageResult<TreeId> {
        match self {
            Backend::Git(b) => b.write_tree(entries),
            Backend::Encrypted(b) => b.write_tree(entries),
        }
    }

    pub fn read_blob(&self, id: BlobId) -> StorageResult<Vec<u8>> {
        match self {
            Backend::Git(b) => b.read_blob(id),
            Backend::Encrypted(b) => b.read_blob(id),
        }
    }

    pub fn write_blob(&self, content: &[u8]) -> StorageResult<BlobId> {
        match self {
            Backend::Git(b) => b.write_blob(content),
            Backend::Encrypted(b) => b.write_blob(content),
        }
    }

    /// remove objects unreachable from any ref, returning how many were removed
    pub fn collect_garbage(&self) -> StorageResult<usize> {
        let reachable = self.reachable_objects()?;
        let removed = match self {
            Backend::Git(b) => b.remove_unreachable(&reachable)?,
            Backend::Encrypted(b) => b.remove_unreachable(&reachable)?,
        };
        info!(reachable = reachable.len(), removed, "collected garbage");
        Ok(removed)
    }

    fn reachable_objects(&self) -> StorageResult<HashSet<Oid>> {
        let mut reachable = HashSet::new();
        let mut trees = Vec::new();

        for (_, head) in self.list_refs()? {
            let mut next = Some(head);
            while let Some(id) = next {
                if !reachable.insert(id.raw()) {
                    break;
                }
                let record = self.read_commit(id)?;
                trees.push(record.tree);
                next = record.parent;
            }
        }

        while let Some(tree) = trees.pop() {
            if !reachable.insert(tree.raw()) {
                continue;
            }
            for entry in self.read_tree(tree)? {
                match entry {
                    TreeEntry::Tree { id, .. } => trees.push(id),
                    TreeEntry::Blob { id, .. } => {
                        reachable.insert(id.raw());
                    }
                }
            }
        }

        Ok(reachable)
    }
}
