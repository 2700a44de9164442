//! Encrypted backend: the commit graph stored in the shared encrypted store.
//!
//! Objects are addressed by the SHA-1 of their serialized form, like git
//! objects. Blobs are stored as-is, trees and commits as JSON.

use std::collections::HashSet;
use std::sync::Arc;

use git2::Oid;
use serde::{Deserialize, Serialize};

use crate::encryption::{Dek, EncryptionStorageManager, RepositoryKeys, WriteBatch};
use crate::storage::commit::{Commit, CommitRecord};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::types::{BlobId, CommitId, ObjectKind, TreeEntry, TreeId};

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum EntryKind {
    Tree,
    Blob,
}

#[derive(Serialize, Deserialize)]
struct TreeEntryDto {
    name: String,
    kind: EntryKind,
    id: String,
}

#[derive(Serialize, Deserialize)]
struct CommitDto {
    parent: Option<String>,
    tree: String,
    commit: Commit,
}

fn parse_oid(hex: &str, location: &str) -> StorageResult<Oid> {
    Oid::from_str(hex).map_err(|e| StorageError::corrupted(location, e.to_string()))
}

pub struct EncryptedBackend {
    manager: Arc<EncryptionStorageManager>,
    dek: Dek,
    keys: RepositoryKeys,
}

impl std::fmt::Debug for EncryptedBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptedBackend")
            .field("prefix", &String::from_utf8_lossy(self.keys.prefix()))
            .finish()
    }
}

impl EncryptedBackend {
    pub fn new(manager: Arc<EncryptionStorageManager>, dek: Dek, keys: RepositoryKeys) -> Self {
        Self { manager, dek, keys }
    }

    pub fn manager(&self) -> &Arc<EncryptionStorageManager> {
        &self.manager
    }

    pub fn dek(&self) -> &Dek {
        &self.dek
    }

    pub fn keys(&self) -> &RepositoryKeys {
        &self.keys
    }

    fn read_object(&self, id: Oid, expected: ObjectKind) -> StorageResult<Vec<u8>> {
        let stored = self
            .manager
            .get_value(&self.dek, &self.keys.object(id.as_bytes()))?
            .ok_or_else(|| match expected {
                ObjectKind::Commit => StorageError::CommitNotFound(id.to_string()),
                _ => StorageError::ObjectNotFound(id.to_string()),
            })?;

        let found = stored.tag.and_then(ObjectKind::from_tag);
        if found != Some(expected) {
            return Err(StorageError::UnexpectedObjectType {
                id: id.to_string(),
                expected: expected.to_string(),
                found: found.map_or_else(|| "unknown".to_string(), |kind| kind.to_string()),
            });
        }
        Ok(stored.value)
    }

    fn write_object(&self, kind: ObjectKind, content: Vec<u8>) -> StorageResult<Oid> {
        let id = Oid::hash_object(kind.to_git2(), &content)?;
        let mut batch = WriteBatch::new();
        batch.put_if_absent(self.keys.object(id.as_bytes()), kind.tag(), content);
        self.manager.write(&self.dek, batch)?;
        Ok(id)
    }

    pub fn read_commit(&self, id: CommitId) -> StorageResult<CommitRecord> {
        let bytes = self.read_object(id.raw(), ObjectKind::Commit)?;
        let location = format!("commit {}", id);
        let dto: CommitDto =
            serde_json::from_slice(&bytes).map_err(|e| StorageError::corrupted(&location, e.to_string()))?;

        Ok(CommitRecord {
            id,
            parent: dto
                .parent
                .map(|hex| parse_oid(&hex, &location).map(CommitId::new))
                .transpose()?,
            tree: TreeId::new(parse_oid(&dto.tree, &location)?),
            commit: dto.commit,
        })
    }

    pub fn write_commit(&self, parent: Option<CommitId>, tree: TreeId, commit: &Commit) -> StorageResult<CommitId> {
        // the parent and tree must exist, as git2 checks for the plain backend
        if let Some(parent) = parent {
            self.read_object(parent.raw(), ObjectKind::Commit)?;
        }
        self.read_object(tree.raw(), ObjectKind::Tree)?;

        let dto = CommitDto {
            parent: parent.map(|id| id.to_string()),
            tree: tree.to_string(),
            commit: commit.clone(),
        };
        let id = self.write_object(ObjectKind::Commit, serde_json::to_vec(&dto)?)?;
        Ok(CommitId::new(id))
    }

    pub fn read_ref(&self, name: &str) -> StorageResult<Option<CommitId>> {
        match self.manager.get_value(&self.dek, &self.keys.reference(name))? {
            Some(stored) => {
                let id = CommitId::from_bytes(&stored.value)
                    .map_err(|e| StorageError::corrupted(format!("ref {}", name), e.to_string()))?;
                Ok(Some(id))
            }
            None => Ok(None),
        }
    }

    pub fn update_ref(&self, name: &str, expected: Option<CommitId>, new: CommitId) -> StorageResult<()> {
        let swapped = self.manager.compare_and_put(
            &self.dek,
            &self.keys.reference(name),
            expected.as_ref().map(|id| id.as_bytes()),
            new.as_bytes(),
        )?;
        if !swapped {
            return Err(StorageError::ConcurrentModification {
                reference: name.to_string(),
            });
        }
        Ok(())
    }

    pub fn list_refs(&self) -> StorageResult<Vec<(String, CommitId)>> {
        let mut refs = Vec::new();
        for key in self.manager.list_keys(&self.keys.refs_prefix())? {
            let Some(name) = self.keys.ref_name(&key) else {
                continue;
            };
            if let Some(id) = self.read_ref(name)? {
                refs.push((name.to_string(), id));
            }
        }
        Ok(refs)
    }

    pub fn read_tree(&self, id: TreeId) -> StorageResult<Vec<TreeEntry>> {
        let bytes = self.read_object(id.raw(), ObjectKind::Tree)?;
        let location = format!("tree {}", id);
        let entries: Vec<TreeEntryDto> =
            serde_json::from_slice(&bytes).map_err(|e| StorageError::corrupted(&location, e.to_string()))?;

        entries
            .into_iter()
            .map(|entry| -> StorageResult<TreeEntry> {
                let oid = parse_oid(&entry.id, &location)?;
                Ok(match entry.kind {
                    EntryKind::Tree => TreeEntry::Tree {
                        name: entry.name,
                        id: TreeId::new(oid),
                    },
                    EntryKind::Blob => TreeEntry::Blob {
                        name: entry.name,
                        id: BlobId::new(oid),
                    },
                })
            })
            .collect()
    }

    pub fn write_tree(&self, entries: &[TreeEntry]) -> StorageResult<TreeId> {
        let mut dtos: Vec<TreeEntryDto> = entries
            .iter()
            .map(|entry| TreeEntryDto {
                name: entry.name().to_string(),
                kind: match entry {
                    TreeEntry::Tree { .. } => EntryKind::Tree,
                    TreeEntry::Blob { .. } => EntryKind::Blob,
                },
                id: entry.raw().to_string(),
            })
            .collect();
        // sorted so equal trees hash equally
        dtos.sort_by(|a, b| a.name.cmp(&b.name));

        let id = self.write_object(ObjectKind::Tree, serde_json::to_vec(&dtos)?)?;
        Ok(TreeId::new(id))
    }

    pub fn read_blob(&self, id: BlobId) -> StorageResult<Vec<u8>> {
        self.read_object(id.raw(), ObjectKind::Blob)
    }

    pub fn write_blob(&self, content: &[u8]) -> StorageResult<BlobId> {
        Ok(BlobId::new(self.write_object(ObjectKind::Blob, content.to_vec())?))
    }

    pub fn remove_unreachable(&self, reachable: &HashSet<Oid>) -> StorageResult<usize> {
        let mut batch = WriteBatch::new();
        for key in self.manager.list_keys(&self.keys.objects_prefix())? {
            let Some(raw) = self.keys.object_id(&key) else {
                continue;
            };
            let oid = Oid::from_bytes(raw)?;
            if !reachable.contains(&oid) {
                batch.delete(key);
            }
        }
        let removed = batch.len();
        self.manager.write(&self.dek, batch)?;
        Ok(removed)
    }
}
