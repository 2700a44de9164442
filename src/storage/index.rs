//! Revision to commit-id index.
//!
//! The backend only knows commit ids and parent links, so finding revision N
//! would mean walking the chain. The index maps every retained revision to
//! its commit id. It is always written after the backend, so after a crash it
//! can only lag behind; [`CommitIdIndex::rebuild`] replays the chain to
//! catch up.
//!
//! Plain repositories keep the index in a file of fixed 24-byte records
//! (big-endian `i32` revision followed by the 20-byte id). Encrypted
//! repositories keep it in the shared encrypted store under `rev2sha/`.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{info, warn};

use crate::encryption::{Dek, EncryptionStorageManager, RepositoryKeys, WriteBatch};
use crate::storage::backend::Backend;
use crate::storage::commit::history;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::revision::Revision;
use crate::storage::types::CommitId;

/// name of the index file inside a plain repository directory
pub const INDEX_FILE_NAME: &str = "commit_ids.dat";

const RECORD_LEN: usize = 24;

/// in-memory mirror of the index: `ids[i]` is the id of revision `first + i`
#[derive(Debug, Default)]
struct Entries {
    first: Option<Revision>,
    ids: Vec<CommitId>,
}

impl Entries {
    fn head(&self) -> Option<Revision> {
        let first = self.first?;
        Some(first.forward(self.ids.len() as i32 - 1))
    }

    fn get(&self, revision: Revision) -> Option<CommitId> {
        let first = self.first?;
        let offset = usize::try_from(revision.major() - first.major()).ok()?;
        self.ids.get(offset).copied()
    }

    fn next_revision(&self) -> Option<Revision> {
        self.head().map(|head| head.forward(1))
    }
}

#[derive(Debug)]
struct FileStore {
    path: PathBuf,
    file: File,
}

impl FileStore {
    fn open(path: &Path) -> StorageResult<(Self, Entries)> {
        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(path)?;

        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;

        let complete = bytes.len() - bytes.len() % RECORD_LEN;
        if complete != bytes.len() {
            warn!(
                path = %path.display(),
                trailing = bytes.len() - complete,
                "truncating partial commit-id index record"
            );
            file.set_len(complete as u64)?;
        }

        let entries = match parse_records(&bytes[..complete]) {
            Ok(entries) => entries,
            Err(e) => {
                // left empty so the open-time check rebuilds it
                warn!(path = %path.display(), error = %e, "discarding unreadable commit-id index");
                file.set_len(0)?;
                Entries::default()
            }
        };

        Ok((
            Self {
                path: path.to_path_buf(),
                file,
            },
            entries,
        ))
    }

    fn append(&mut self, revision: Revision, id: CommitId) -> StorageResult<()> {
        self.file.write_all(&encode_record(revision, id))?;
        self.file.sync_data()?;
        Ok(())
    }

    /// replace the whole file with `records`
    fn rewrite(&mut self, records: &[(Revision, CommitId)]) -> StorageResult<()> {
        let tmp = self.path.with_extension("dat.tmp");
        {
            let mut out = File::create(&tmp)?;
            for (revision, id) in records {
                out.write_all(&encode_record(*revision, *id))?;
            }
            out.sync_all()?;
        }
        std::fs::rename(&tmp, &self.path)?;
        self.file = OpenOptions::new().read(true).append(true).open(&self.path)?;
        Ok(())
    }
}

fn encode_record(revision: Revision, id: CommitId) -> [u8; RECORD_LEN] {
    let mut record = [0u8; RECORD_LEN];
    record[..4].copy_from_slice(&revision.major().to_be_bytes());
    record[4..].copy_from_slice(id.as_bytes());
    record
}

fn parse_records(bytes: &[u8]) -> StorageResult<Entries> {
    let mut entries = Entries::default();
    for record in bytes.chunks_exact(RECORD_LEN) {
        let mut major = [0u8; 4];
        major.copy_from_slice(&record[..4]);
        let revision = Revision::new(i32::from_be_bytes(major));
        let id = CommitId::from_bytes(&record[4..])?;

        match entries.next_revision() {
            Some(expected) if expected != revision => {
                return Err(StorageError::IndexOutOfOrder {
                    expected,
                    actual: revision,
                })
            }
            None => entries.first = Some(revision),
            _ => {}
        }
        entries.ids.push(id);
    }
    Ok(entries)
}

#[derive(Debug)]
struct EncryptedStore {
    manager: Arc<EncryptionStorageManager>,
    dek: Dek,
    keys: RepositoryKeys,
}

impl EncryptedStore {
    fn open(manager: Arc<EncryptionStorageManager>, dek: Dek, keys: RepositoryKeys) -> StorageResult<(Self, Entries)> {
        let store = Self { manager, dek, keys };
        let mut records = Vec::new();
        // big-endian keys of non-negative revisions list in numeric order
        for key in store.manager.list_keys(&store.keys.revisions_prefix())? {
            let Some(major) = store.keys.revision_of(&key) else {
                continue;
            };
            let value = store
                .manager
                .get_value(&store.dek, &key)?
                .ok_or_else(|| StorageError::corrupted("rev2sha", format!("revision {} vanished", major)))?;
            records.push(encode_record(Revision::new(major), CommitId::from_bytes(&value.value)?));
        }

        let entries = match parse_records(&records.concat()) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "discarding unreadable commit-id index");
                Entries::default()
            }
        };
        Ok((store, entries))
    }

    fn append(&self, revision: Revision, id: CommitId) -> StorageResult<()> {
        let mut batch = WriteBatch::new();
        batch.put(self.keys.revision(revision.major()), id.as_bytes().to_vec());
        self.manager.write(&self.dek, batch)?;
        Ok(())
    }

    fn rewrite(&self, records: &[(Revision, CommitId)]) -> StorageResult<()> {
        let mut batch = WriteBatch::new();
        for key in self.manager.list_keys(&self.keys.revisions_prefix())? {
            batch.delete(key);
        }
        for (revision, id) in records {
            batch.put(self.keys.revision(revision.major()), id.as_bytes().to_vec());
        }
        self.manager.write(&self.dek, batch)?;
        Ok(())
    }
}

#[derive(Debug)]
enum Store {
    File(FileStore),
    Encrypted(EncryptedStore),
}

#[derive(Debug)]
struct State {
    store: Store,
    entries: Entries,
}

/// Maps revisions to commit ids.
#[derive(Debug)]
pub struct CommitIdIndex {
    state: RwLock<State>,
}

impl CommitIdIndex {
    /// open (or create) the index file of a plain repository
    pub fn open_file(repo_dir: &Path) -> StorageResult<Self> {
        let (store, entries) = FileStore::open(&repo_dir.join(INDEX_FILE_NAME))?;
        Ok(Self::new(Store::File(store), entries))
    }

    pub fn open_encrypted(manager: Arc<EncryptionStorageManager>, dek: Dek, keys: RepositoryKeys) -> StorageResult<Self> {
        let (store, entries) = EncryptedStore::open(manager, dek, keys)?;
        Ok(Self::new(Store::Encrypted(store), entries))
    }

    fn new(store: Store, entries: Entries) -> Self {
        Self {
            state: RwLock::new(State { store, entries }),
        }
    }

    /// the oldest indexed revision
    pub fn first_revision(&self) -> Option<Revision> {
        self.state.read().entries.first
    }

    /// the newest indexed revision
    pub fn head_revision(&self) -> Option<Revision> {
        self.state.read().entries.head()
    }

    /// the commit id of a concrete revision
    pub fn get(&self, revision: Revision) -> StorageResult<CommitId> {
        self.state
            .read()
            .entries
            .get(revision)
            .ok_or(StorageError::RevisionNotFound(revision))
    }

    /// Record the commit of the next revision.
    ///
    /// `revision` must be the current head plus one, or anything concrete
    /// when the index is empty.
    pub fn append(&self, revision: Revision, id: CommitId) -> StorageResult<Revision> {
        let mut state = self.state.write();
        match state.entries.next_revision() {
            Some(expected) if expected != revision => {
                return Err(StorageError::IndexOutOfOrder {
                    expected,
                    actual: revision,
                })
            }
            None if revision.is_relative() || revision.major() < 1 => {
                return Err(StorageError::IndexOutOfOrder {
                    expected: Revision::INIT,
                    actual: revision,
                })
            }
            _ => {}
        }

        match &mut state.store {
            Store::File(store) => store.append(revision, id)?,
            Store::Encrypted(store) => store.append(revision, id)?,
        }
        if state.entries.first.is_none() {
            state.entries.first = Some(revision);
        }
        state.entries.ids.push(id);
        Ok(revision)
    }

    /// check whether the indexed head is the backend's head commit
    pub fn is_consistent_with(&self, backend: &Backend) -> StorageResult<bool> {
        let Some(head) = backend.resolve_head()? else {
            return Ok(self.head_revision().is_none());
        };
        let record = backend.read_commit(head)?;
        let state = self.state.read();
        Ok(state.entries.head() == Some(record.commit.revision)
            && state.entries.get(record.commit.revision) == Some(head))
    }

    /// Replace every entry by replaying the backend's chain from its root.
    pub fn rebuild(&self, backend: &Backend) -> StorageResult<Option<Revision>> {
        let mut records = Vec::new();
        if let Some(head) = backend.resolve_head()? {
            for record in history(backend, head) {
                let record = record?;
                records.push((record.commit.revision, record.id));
            }
        }
        records.reverse();

        let mut state = self.state.write();
        match &mut state.store {
            Store::File(store) => store.rewrite(&records)?,
            Store::Encrypted(store) => store.rewrite(&records)?,
        }
        state.entries = Entries {
            first: records.first().map(|(revision, _)| *revision),
            ids: records.iter().map(|(_, id)| *id).collect(),
        };

        let head = state.entries.head();
        info!(
            first = ?state.entries.first.map(|r| r.major()),
            head = ?head.map(|r| r.major()),
            "rebuilt commit-id index"
        );
        Ok(head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encryption::LocalKeyManagementService;
    use crate::storage::backend::MAIN_REF;
    use crate::storage::commit::{create_initial_commit, CommitBuilder};
    use crate::storage::types::Author;
    use std::time::Duration;
    use tempfile::TempDir;

    /// a git backend with revisions 1..=n on the main branch
    fn chain(dir: &Path, n: i32) -> (Backend, Vec<CommitId>) {
        let backend = Backend::init_git(dir).unwrap();
        let mut ids = vec![create_initial_commit(&backend, Author::system(), 0).unwrap()];
        backend.update_ref(MAIN_REF, None, ids[0]).unwrap();
        for major in 2..=n {
            let parent = backend.read_commit(*ids.last().unwrap()).unwrap();
            let id = CommitBuilder::new(Revision::new(major))
                .parent(&parent)
                .tree(parent.tree)
                .when(major as i64)
                .write(&backend)
                .unwrap();
            backend.update_ref(MAIN_REF, Some(parent.id), id).unwrap();
            ids.push(id);
        }
        (backend, ids)
    }

    #[test]
    fn test_append_and_get() {
        let dir = TempDir::new().unwrap();
        let (_, ids) = chain(dir.path(), 3);
        let index = CommitIdIndex::open_file(dir.path()).unwrap();
        assert_eq!(index.head_revision(), None);

        for (i, id) in ids.iter().enumerate() {
            index.append(Revision::new(i as i32 + 1), *id).unwrap();
        }
        assert_eq!(index.first_revision(), Some(Revision::INIT));
        assert_eq!(index.head_revision(), Some(Revision::new(3)));
        assert_eq!(index.get(Revision::new(2)).unwrap(), ids[1]);
        assert!(index.get(Revision::new(4)).unwrap_err().is_not_found());

        // reopen from disk
        drop(index);
        let index = CommitIdIndex::open_file(dir.path()).unwrap();
        assert_eq!(index.head_revision(), Some(Revision::new(3)));
        assert_eq!(index.get(Revision::new(3)).unwrap(), ids[2]);
    }

    #[test]
    fn test_append_out_of_order() {
        let dir = TempDir::new().unwrap();
        let (_, ids) = chain(dir.path(), 2);
        let index = CommitIdIndex::open_file(dir.path()).unwrap();
        index.append(Revision::INIT, ids[0]).unwrap();

        let err = index.append(Revision::new(3), ids[1]).unwrap_err();
        assert!(matches!(err, StorageError::IndexOutOfOrder { .. }));
        assert_eq!(index.head_revision(), Some(Revision::INIT));
    }

    #[test]
    fn test_partial_record_is_truncated() {
        let dir = TempDir::new().unwrap();
        let (_, ids) = chain(dir.path(), 2);
        {
            let index = CommitIdIndex::open_file(dir.path()).unwrap();
            index.append(Revision::INIT, ids[0]).unwrap();
        }
        let mut file = OpenOptions::new()
            .append(true)
            .open(dir.path().join(INDEX_FILE_NAME))
            .unwrap();
        file.write_all(&[0, 0, 0, 2, 1, 2, 3]).unwrap();
        drop(file);

        let index = CommitIdIndex::open_file(dir.path()).unwrap();
        assert_eq!(index.head_revision(), Some(Revision::INIT));
        index.append(Revision::new(2), ids[1]).unwrap();
        let len = std::fs::metadata(dir.path().join(INDEX_FILE_NAME)).unwrap().len();
        assert_eq!(len, 2 * RECORD_LEN as u64);
    }

    #[test]
    fn test_rebuild_stale_index() {
        let dir = TempDir::new().unwrap();
        let (backend, ids) = chain(dir.path(), 5);
        let index = CommitIdIndex::open_file(dir.path()).unwrap();
        index.append(Revision::INIT, ids[0]).unwrap();
        index.append(Revision::new(2), ids[1]).unwrap();
        assert!(!index.is_consistent_with(&backend).unwrap());

        assert_eq!(index.rebuild(&backend).unwrap(), Some(Revision::new(5)));
        assert!(index.is_consistent_with(&backend).unwrap());
        for (i, id) in ids.iter().enumerate() {
            assert_eq!(index.get(Revision::new(i as i32 + 1)).unwrap(), *id);
        }

        drop(index);
        let index = CommitIdIndex::open_file(dir.path()).unwrap();
        assert_eq!(index.head_revision(), Some(Revision::new(5)));
    }

    #[tokio::test]
    async fn test_encrypted_index() {
        let dir = TempDir::new().unwrap();
        let (_, ids) = chain(&dir.path().join("repo"), 3);
        let manager = Arc::new(
            EncryptionStorageManager::open(
                dir.path().join("encryption.sqlite"),
                Arc::new(LocalKeyManagementService::generate()),
                Duration::from_secs(5),
            )
            .unwrap(),
        );
        let wdek = manager.generate_wdek().await.unwrap();
        manager.store_wdek("foo", "bar", &wdek).unwrap();
        let dek = manager.get_dek("foo", "bar").await.unwrap();
        let keys = RepositoryKeys::new("foo", "bar");

        let index = CommitIdIndex::open_encrypted(manager.clone(), dek.clone(), keys.clone()).unwrap();
        for (i, id) in ids.iter().enumerate() {
            index.append(Revision::new(i as i32 + 1), *id).unwrap();
        }
        drop(index);

        let index = CommitIdIndex::open_encrypted(manager, dek, keys).unwrap();
        assert_eq!(index.first_revision(), Some(Revision::INIT));
        assert_eq!(index.head_revision(), Some(Revision::new(3)));
        assert_eq!(index.get(Revision::new(2)).unwrap(), ids[1]);
    }
}
