//! Process-wide encrypted key-value store.
//!
//! One SQLite database holds three tables: `wdeks` maps `(project, repo)` to
//! the wrapped key, `metadata` maps each logical key to the nonce its physical
//! key is derived from (plus an optional type tag), and `data` holds the
//! sealed values under their physical keys. A metadata record and its data
//! record are always written and deleted in the same transaction.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info, warn};
use zeroize::Zeroize;

use crate::encryption::cipher::{generate_nonce, Dek, NONCE_SIZE};
use crate::encryption::error::{EncryptionStorageError, EncryptionStorageResult};
use crate::encryption::keys::{describe, prefix_upper_bound, KeyKind, RepositoryKeys};
use crate::encryption::kms::KeyManagementService;

/// A decrypted value and the tag stored alongside its metadata record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredValue {
    pub tag: Option<u8>,
    pub value: Vec<u8>,
}

#[derive(Debug)]
enum BatchOp {
    Put {
        key: Vec<u8>,
        tag: Option<u8>,
        value: Vec<u8>,
        if_absent: bool,
    },
    Delete {
        key: Vec<u8>,
    },
}

/// A set of logical writes applied in one transaction.
#[derive(Debug, Default)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>) -> &mut Self {
        self.ops.push(BatchOp::Put {
            key,
            tag: None,
            value,
            if_absent: false,
        });
        self
    }

    /// Put a tagged value unless the key already exists.
    ///
    /// Used for content-addressed objects, whose value never changes.
    pub fn put_if_absent(&mut self, key: Vec<u8>, tag: u8, value: Vec<u8>) -> &mut Self {
        self.ops.push(BatchOp::Put {
            key,
            tag: Some(tag),
            value,
            if_absent: true,
        });
        self
    }

    pub fn delete(&mut self, key: Vec<u8>) -> &mut Self {
        self.ops.push(BatchOp::Delete { key });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }
}

/// Owns wrapped keys and the encrypted records of every encrypted repository.
pub struct EncryptionStorageManager {
    conn: Mutex<Connection>,
    kms: Arc<dyn KeyManagementService>,
    deks: RwLock<HashMap<(String, String), Dek>>,
    unwrap_timeout: Duration,
}

impl std::fmt::Debug for EncryptionStorageManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionStorageManager")
            .field("cached_keys", &self.deks.read().len())
            .field("unwrap_timeout", &self.unwrap_timeout)
            .finish()
    }
}

impl EncryptionStorageManager {
    /// Open or create the store at `path`.
    pub fn open(
        path: impl AsRef<Path>,
        kms: Arc<dyn KeyManagementService>,
        unwrap_timeout: Duration,
    ) -> EncryptionStorageResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.execute_batch(
            r#"
                CREATE TABLE IF NOT EXISTS wdeks (
                    project TEXT NOT NULL,
                    repo TEXT NOT NULL,
                    wdek BLOB NOT NULL,
                    PRIMARY KEY (project, repo)
                );

                CREATE TABLE IF NOT EXISTS metadata (
                    key BLOB PRIMARY KEY,
                    value BLOB NOT NULL
                );

                CREATE TABLE IF NOT EXISTS data (
                    key BLOB PRIMARY KEY,
                    value BLOB NOT NULL
                );
            "#,
        )?;

        info!(path = %path.display(), "opened encryption storage");
        Ok(Self {
            conn: Mutex::new(conn),
            kms,
            deks: RwLock::new(HashMap::new()),
            unwrap_timeout,
        })
    }

    /// Generate a fresh DEK and return its wrapped form.
    pub async fn generate_wdek(&self) -> EncryptionStorageResult<Vec<u8>> {
        let dek = Dek::generate();
        Ok(self.kms.wrap_dek(dek.as_bytes()).await?)
    }

    /// Persist the wrapped key of a repository. Fails if one already exists.
    pub fn store_wdek(&self, project: &str, repo: &str, wdek: &[u8]) -> EncryptionStorageResult<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        if select_wdek(&tx, project, repo)?.is_some() {
            return Err(EncryptionStorageError::WdekExists {
                project: project.to_string(),
                repo: repo.to_string(),
            });
        }
        tx.execute(
            "INSERT INTO wdeks (project, repo, wdek) VALUES (?1, ?2, ?3)",
            params![project, repo, wdek],
        )?;
        tx.commit()?;
        debug!(project, repo, "stored wrapped key");
        Ok(())
    }

    pub fn get_wdek(&self, project: &str, repo: &str) -> EncryptionStorageResult<Vec<u8>> {
        let conn = self.conn.lock();
        select_wdek(&conn, project, repo)?
            .ok_or_else(|| EncryptionStorageError::wdek_not_found(project, repo))
    }

    pub fn has_wdek(&self, project: &str, repo: &str) -> EncryptionStorageResult<bool> {
        let conn = self.conn.lock();
        Ok(select_wdek(&conn, project, repo)?.is_some())
    }

    /// Unwrap the DEK of a repository, waiting at most the configured timeout.
    pub async fn get_dek(&self, project: &str, repo: &str) -> EncryptionStorageResult<Dek> {
        if let Some(dek) = self.cached_dek(project, repo) {
            return Ok(dek);
        }

        let wdek = self.get_wdek(project, repo)?;
        let mut raw = match tokio::time::timeout(self.unwrap_timeout, self.kms.unwrap_wdek(&wdek)).await {
            Ok(result) => result?,
            Err(_) => {
                let millis = self.unwrap_timeout.as_millis() as u64;
                warn!(project, repo, millis, "timed out unwrapping repository key");
                return Err(EncryptionStorageError::Timeout {
                    project: project.to_string(),
                    repo: repo.to_string(),
                    millis,
                });
            }
        };
        let dek = Dek::from_bytes(&raw);
        raw.zeroize();
        let dek = dek?;

        self.deks
            .write()
            .insert((project.to_string(), repo.to_string()), dek.clone());
        Ok(dek)
    }

    fn cached_dek(&self, project: &str, repo: &str) -> Option<Dek> {
        self.deks
            .read()
            .get(&(project.to_string(), repo.to_string()))
            .cloned()
    }

    /// Forget the unwrapped key of a repository.
    pub fn remove_dek_cache(&self, project: &str, repo: &str) {
        self.deks.write().remove(&(project.to_string(), repo.to_string()));
    }

    pub fn get_value(&self, dek: &Dek, key: &[u8]) -> EncryptionStorageResult<Option<StoredValue>> {
        let conn = self.conn.lock();
        read_value(&conn, dek, key)
    }

    pub fn contains_key(&self, key: &[u8]) -> EncryptionStorageResult<bool> {
        let conn = self.conn.lock();
        Ok(select_metadata(&conn, key)?.is_some())
    }

    /// Apply every operation of the batch atomically.
    pub fn write(&self, dek: &Dek, batch: WriteBatch) -> EncryptionStorageResult<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        for op in batch.ops {
            match op {
                BatchOp::Put {
                    key,
                    tag,
                    value,
                    if_absent,
                } => {
                    if if_absent && select_metadata(&tx, &key)?.is_some() {
                        continue;
                    }
                    put_value(&tx, dek, &key, tag, &value)?;
                }
                BatchOp::Delete { key } => delete_value(&tx, dek, &key)?,
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Replace the value under `key` only if it currently equals `expected`
    /// (`None` meaning absent). Returns whether the value was written.
    pub fn compare_and_put(
        &self,
        dek: &Dek,
        key: &[u8],
        expected: Option<&[u8]>,
        value: &[u8],
    ) -> EncryptionStorageResult<bool> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let current = read_value(&tx, dek, key)?;
        if current.as_ref().map(|v| v.value.as_slice()) != expected {
            return Ok(false);
        }
        put_value(&tx, dek, key, None, value)?;
        tx.commit()?;
        Ok(true)
    }

    /// Logical keys starting with `prefix`, in key order.
    pub fn list_keys(&self, prefix: &[u8]) -> EncryptionStorageResult<Vec<Vec<u8>>> {
        let conn = self.conn.lock();
        Ok(scan_metadata(&conn, prefix)?
            .into_iter()
            .map(|(key, _)| key)
            .collect())
    }

    /// Delete every record of a repository, then its wrapped key.
    ///
    /// Safe to re-run after a crash: the wrapped key is removed last, so a
    /// partial run leaves it in place and the next run finds what is left.
    pub async fn delete_repository_data(&self, project: &str, repo: &str) -> EncryptionStorageResult<()> {
        let dek = match self.get_dek(project, repo).await {
            Ok(dek) => dek,
            Err(e) if e.is_not_found() => {
                debug!(project, repo, "no wrapped key, nothing to delete");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let keys = RepositoryKeys::new(project, repo);
        let deleted = self.delete_records(&dek, &keys)?;

        {
            let conn = self.conn.lock();
            conn.execute(
                "DELETE FROM wdeks WHERE project = ?1 AND repo = ?2",
                params![project, repo],
            )?;
        }
        self.remove_dek_cache(project, repo);
        info!(project, repo, deleted, "deleted encrypted repository data");
        Ok(())
    }

    fn delete_records(&self, dek: &Dek, keys: &RepositoryKeys) -> EncryptionStorageResult<usize> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut deleted = 0;

        for (key, meta) in scan_metadata(&tx, keys.prefix())? {
            let printable = describe(&key);
            if keys.classify(&key) == KeyKind::Unknown {
                warn!(key = %printable, "skipping record with unexpected key layout");
                continue;
            }
            if meta.len() < NONCE_SIZE {
                warn!(key = %printable, "skipping record with truncated metadata");
                continue;
            }

            let physical = dek.encrypt_with_nonce(&meta[..NONCE_SIZE], &key)?;
            if tx.execute("DELETE FROM data WHERE key = ?1", params![physical])? == 0 {
                warn!(key = %printable, "metadata record has no data record");
            }
            tx.execute("DELETE FROM metadata WHERE key = ?1", params![key])?;
            deleted += 1;
        }

        tx.commit()?;
        Ok(deleted)
    }
}

fn select_wdek(conn: &Connection, project: &str, repo: &str) -> EncryptionStorageResult<Option<Vec<u8>>> {
    Ok(conn
        .query_row(
            "SELECT wdek FROM wdeks WHERE project = ?1 AND repo = ?2",
            params![project, repo],
            |row| row.get(0),
        )
        .optional()?)
}

fn select_metadata(conn: &Connection, key: &[u8]) -> EncryptionStorageResult<Option<Vec<u8>>> {
    Ok(conn
        .query_row(
            "SELECT value FROM metadata WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()?)
}

fn scan_metadata(conn: &Connection, prefix: &[u8]) -> EncryptionStorageResult<Vec<(Vec<u8>, Vec<u8>)>> {
    let rows = match prefix_upper_bound(prefix) {
        Some(upper) => {
            let mut stmt =
                conn.prepare("SELECT key, value FROM metadata WHERE key >= ?1 AND key < ?2 ORDER BY key")?;
            let rows = stmt
                .query_map(params![prefix, upper], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        }
        None => {
            let mut stmt = conn.prepare("SELECT key, value FROM metadata WHERE key >= ?1 ORDER BY key")?;
            let rows = stmt
                .query_map(params![prefix], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        }
    };
    Ok(rows)
}

fn split_metadata(key: &[u8], meta: &[u8]) -> EncryptionStorageResult<(Vec<u8>, Option<u8>)> {
    match meta.len() {
        NONCE_SIZE => Ok((meta.to_vec(), None)),
        n if n == NONCE_SIZE + 1 => Ok((meta[..NONCE_SIZE].to_vec(), Some(meta[NONCE_SIZE]))),
        n => Err(EncryptionStorageError::Corrupted(format!(
            "metadata of {} has length {}",
            describe(key),
            n
        ))),
    }
}

fn read_value(conn: &Connection, dek: &Dek, key: &[u8]) -> EncryptionStorageResult<Option<StoredValue>> {
    let Some(meta) = select_metadata(conn, key)? else {
        return Ok(None);
    };
    let (nonce, tag) = split_metadata(key, &meta)?;
    let physical = dek.encrypt_with_nonce(&nonce, key)?;

    let sealed: Option<Vec<u8>> = conn
        .query_row("SELECT value FROM data WHERE key = ?1", params![physical], |row| row.get(0))
        .optional()?;
    let sealed = sealed.ok_or_else(|| {
        EncryptionStorageError::Corrupted(format!(
            "metadata of {} has no data record",
            describe(key)
        ))
    })?;

    Ok(Some(StoredValue {
        tag,
        value: dek.open(&sealed)?,
    }))
}

fn put_value(conn: &Connection, dek: &Dek, key: &[u8], tag: Option<u8>, value: &[u8]) -> EncryptionStorageResult<()> {
    // an existing record keeps its key nonce so its physical key stays put
    let nonce = match select_metadata(conn, key)? {
        Some(meta) => split_metadata(key, &meta)?.0,
        None => generate_nonce().to_vec(),
    };
    let physical = dek.encrypt_with_nonce(&nonce, key)?;

    let mut meta = nonce;
    meta.extend(tag);

    conn.execute(
        "REPLACE INTO metadata (key, value) VALUES (?1, ?2)",
        params![key, meta],
    )?;
    conn.execute(
        "REPLACE INTO data (key, value) VALUES (?1, ?2)",
        params![physical, dek.seal(value)?],
    )?;
    Ok(())
}

fn delete_value(conn: &Connection, dek: &Dek, key: &[u8]) -> EncryptionStorageResult<()> {
    let Some(meta) = select_metadata(conn, key)? else {
        return Ok(());
    };
    let (nonce, _) = split_metadata(key, &meta)?;
    let physical = dek.encrypt_with_nonce(&nonce, key)?;
    conn.execute("DELETE FROM data WHERE key = ?1", params![physical])?;
    conn.execute("DELETE FROM metadata WHERE key = ?1", params![key])?;
    Ok(())
}
