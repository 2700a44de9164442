//! Repositories: versioned trees of JSON and text files.
//!
//! A [`Repository`] owns one object-store backend and its commit-id index.
//! Commits are serialized per repository; reads only take a short lock to
//! snapshot the head and then run against immutable history, so they never
//! wait for a commit in progress.
//!
//! All object-store work is blocking and runs on the tokio blocking pool.
//!
//! ```ignore
//! let repo = Repository::create(project, name, dir, Author::system(), now, false, &ctx).await?;
//! let change = Change::upsert_json("/x.json", json!({"a": "b"}))?;
//! let result = repo.commit(CommitRequest::new(Revision::HEAD, vec![change])).await?;
//! let entry = repo.get(result.revision, &Query::identity("/x.json")?).await?;
//! ```

mod apply;
mod cache;
mod change;
mod error;
pub mod json_patch;
mod merge;
mod path;
mod pattern;
mod watch;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::{debug, info, warn};
use ulid::Ulid;

pub use cache::RepositoryCache;
pub use change::{
    Change, ChangeContent, CommitRequest, CommitResult, Entry, EntryContent, EntryType, FindOptions, HistoryEntry,
    MergeQuery, MergeSource, MergedEntry, Query,
};
pub use error::{RepositoryError, RepositoryResult};
pub use json_patch::{generate_patch, JsonPatch, PatchError, PatchOperation};
pub use path::{is_json_path, validate_dir_path, validate_file_path};
pub use pattern::PathPattern;
pub use watch::{ListenerId, RepositoryListener};

use crate::encryption::{EncryptionStorageManager, RepositoryKeys};
use crate::repository::apply::{apply_changes, describe_edit, FileContent};
use crate::repository::cache::{CacheKey, CacheOp};
use crate::repository::change::select_pointers;
use crate::repository::merge::merge_into;
use crate::repository::watch::{ListenerRegistry, WatchRegistry};
use crate::storage::{
    bytes_to_json, bytes_to_text, create_initial_commit, diff_trees, flatten, is_encrypted, Author, Backend, BlobId,
    CommitBuilder, CommitId, CommitIdIndex, ProjectName, RepositoryName, Revision, RevisionRange, StorageError,
    TreeId, TreeMutator, MAIN_REF,
};

/// Limits applied to every repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RepositoryOptions {
    /// upper bound on the commits one history call returns
    pub max_commits: usize,
    /// upper bound on how long a watch may wait
    pub max_watch_timeout: Duration,
}

impl Default for RepositoryOptions {
    fn default() -> Self {
        Self {
            max_commits: 1000,
            max_watch_timeout: Duration::from_millis(120_000),
        }
    }
}

/// Process-wide collaborators shared by every repository.
#[derive(Debug, Clone)]
pub struct RepositoryContext {
    pub cache: RepositoryCache,
    pub encryption: Option<Arc<EncryptionStorageManager>>,
    pub options: RepositoryOptions,
}

#[derive(Debug, Clone, Copy)]
struct HeadState {
    first: Revision,
    head: Revision,
    head_id: CommitId,
}

struct Inner {
    project: ProjectName,
    name: RepositoryName,
    path: PathBuf,
    backend: Backend,
    index: CommitIdIndex,
    state: RwLock<HeadState>,
    /// identifies this repository's history in the shared cache
    cache_id: RwLock<Ulid>,
    /// the owned guard moves into the blocking task that performs the write
    write_lock: Arc<tokio::sync::Mutex<()>>,
    cache: RepositoryCache,
    watches: Arc<WatchRegistry>,
    listeners: ListenerRegistry,
    options: RepositoryOptions,
}

/// A handle to one repository. Cloning is cheap.
#[derive(Clone)]
pub struct Repository {
    inner: Arc<Inner>,
}

impl fmt::Debug for Repository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = *self.inner.state.read();
        f.debug_struct("Repository")
            .field("project", &self.inner.project)
            .field("name", &self.inner.name)
            .field("path", &self.inner.path)
            .field("encrypted", &self.inner.backend.is_encrypted())
            .field("first", &state.first)
            .field("head", &state.head)
            .finish()
    }
}

impl Repository {
    /// Create a repository at `path` with its initial empty commit.
    pub async fn create(
        project: ProjectName,
        name: RepositoryName,
        path: PathBuf,
        author: Author,
        when: i64,
        encrypt: bool,
        ctx: &RepositoryContext,
    ) -> RepositoryResult<Self> {
        let (backend, index) = if encrypt {
            let manager = ctx
                .encryption
                .clone()
                .ok_or_else(|| RepositoryError::EncryptionNotEnabled(path.display().to_string()))?;
            let wdek = manager.generate_wdek().await?;
            manager.store_wdek(project.as_str(), name.as_str(), &wdek)?;
            let dek = manager.get_dek(project.as_str(), name.as_str()).await?;
            let keys = RepositoryKeys::new(project.as_str(), name.as_str());
            let path = path.clone();
            tokio::task::spawn_blocking(move || -> RepositoryResult<(Backend, CommitIdIndex)> {
                let backend = Backend::init_encrypted(&path, manager.clone(), dek.clone(), keys.clone())?;
                let index = CommitIdIndex::open_encrypted(manager, dek, keys)?;
                Ok((backend, index))
            })
            .await??
        } else {
            let path = path.clone();
            tokio::task::spawn_blocking(move || -> RepositoryResult<(Backend, CommitIdIndex)> {
                let backend = Backend::init_git(&path)?;
                let index = CommitIdIndex::open_file(&path)?;
                Ok((backend, index))
            })
            .await??
        };

        let (backend, index, state) = tokio::task::spawn_blocking(move || -> RepositoryResult<(Backend, CommitIdIndex, HeadState)> {
            let id = create_initial_commit(&backend, author, when)?;
            backend.update_ref(MAIN_REF, None, id)?;
            index.append(Revision::INIT, id)?;
            let state = HeadState {
                first: Revision::INIT,
                head: Revision::INIT,
                head_id: id,
            };
            Ok((backend, index, state))
        })
        .await??;

        info!(project = %project, repo = %name, encrypted = encrypt, "created repository");
        Ok(Self::new(project, name, path, backend, index, state, ctx))
    }

    /// Open an existing repository, rebuilding its index if it lags behind.
    pub async fn open(
        project: ProjectName,
        name: RepositoryName,
        path: PathBuf,
        ctx: &RepositoryContext,
    ) -> RepositoryResult<Self> {
        let encrypted = is_encrypted(&path);
        let keys = if encrypted {
            let manager = ctx
                .encryption
                .clone()
                .ok_or_else(|| RepositoryError::EncryptionNotEnabled(path.display().to_string()))?;
            let dek = manager.get_dek(project.as_str(), name.as_str()).await?;
            Some((manager, dek, RepositoryKeys::new(project.as_str(), name.as_str())))
        } else {
            None
        };

        let dir = path.clone();
        let (backend, index, state) =
            tokio::task::spawn_blocking(move || -> RepositoryResult<(Backend, CommitIdIndex, HeadState)> {
                let (backend, index) = match keys {
                    Some((manager, dek, keys)) => {
                        let backend = Backend::open_encrypted(manager.clone(), dek.clone(), keys.clone());
                        (backend, CommitIdIndex::open_encrypted(manager, dek, keys)?)
                    }
                    None => (Backend::open_git(&dir)?, CommitIdIndex::open_file(&dir)?),
                };

                if !index.is_consistent_with(&backend)? {
                    warn!(path = %dir.display(), head = ?index.head_revision(), "commit-id index is stale");
                    index.rebuild(&backend)?;
                }
                let state = head_state(&index, &dir)?;
                Ok((backend, index, state))
            })
            .await??;

        debug!(project = %project, repo = %name, head = %state.head, "opened repository");
        Ok(Self::new(project, name, path, backend, index, state, ctx))
    }

    fn new(
        project: ProjectName,
        name: RepositoryName,
        path: PathBuf,
        backend: Backend,
        index: CommitIdIndex,
        state: HeadState,
        ctx: &RepositoryContext,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                project,
                name,
                path,
                backend,
                index,
                state: RwLock::new(state),
                cache_id: RwLock::new(Ulid::new()),
                write_lock: Arc::new(tokio::sync::Mutex::new(())),
                cache: ctx.cache.clone(),
                watches: Arc::new(WatchRegistry::default()),
                listeners: ListenerRegistry::default(),
                options: ctx.options,
            }),
        }
    }

    pub fn project(&self) -> &ProjectName {
        &self.inner.project
    }

    pub fn name(&self) -> &RepositoryName {
        &self.inner.name
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn is_encrypted(&self) -> bool {
        self.inner.backend.is_encrypted()
    }

    /// the oldest revision still in the history
    pub fn first_revision(&self) -> Revision {
        self.inner.state.read().first
    }

    pub fn head_revision(&self) -> Revision {
        self.inner.state.read().head
    }

    /// resolve a possibly relative revision against the current head
    pub fn normalize(&self, revision: Revision) -> RepositoryResult<Revision> {
        self.inner.normalize(revision)
    }

    pub fn normalize_range(&self, range: RevisionRange) -> RepositoryResult<RevisionRange> {
        let state = *self.inner.state.read();
        Ok(range.normalize_within(state.first, state.head)?)
    }

    async fn blocking<T, F>(&self, f: F) -> RepositoryResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Inner) -> RepositoryResult<T> + Send + 'static,
    {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || f(&inner)).await?
    }

    /// Apply `request.changes` on top of the head and record a new revision.
    pub async fn commit(&self, request: CommitRequest) -> RepositoryResult<CommitResult> {
        let guard = self.inner.write_lock.clone().lock_owned().await;
        let (result, changed_paths) = self
            .blocking(move |inner| {
                let _guard = guard;
                inner.commit(request)
            })
            .await?;

        self.inner.watches.notify(result.revision, &changed_paths);
        self.notify_listeners(changed_paths);
        Ok(result)
    }

    /// the changes a commit on top of `base` would apply, without committing
    pub async fn preview_diff(&self, base: Revision, changes: Vec<Change>) -> RepositoryResult<BTreeMap<String, Change>> {
        self.blocking(move |inner| {
            let base = inner.normalize(base)?;
            let files = inner.files_at(base)?;
            match apply_changes(&files, |path, blob| inner.read_content(path, blob), &changes) {
                Ok(applied) => Ok(applied
                    .changes
                    .into_iter()
                    .map(|change| (change.path.clone(), change))
                    .collect()),
                Err(RepositoryError::RedundantChange) => Ok(BTreeMap::new()),
                Err(e) => Err(e),
            }
        })
        .await
    }

    /// Read one entry; fails with `EntryNotFound` if nothing is at the path.
    pub async fn get(&self, revision: Revision, query: &Query) -> RepositoryResult<Entry> {
        let path = query.path().to_string();
        let revision = self.normalize(revision)?;
        self.get_or_none(revision, query)
            .await?
            .ok_or_else(|| RepositoryError::entry_not_found(&path, revision))
    }

    pub async fn get_or_none(&self, revision: Revision, query: &Query) -> RepositoryResult<Option<Entry>> {
        let query = query.clone();
        self.blocking(move |inner| {
            let revision = inner.normalize(revision)?;
            Ok(inner.get(revision, &query)?.map(|entry| Entry::clone(&entry)))
        })
        .await
    }

    /// Entries whose path matches `pattern`, sorted by path.
    pub async fn find(
        &self,
        revision: Revision,
        pattern: &str,
        options: FindOptions,
    ) -> RepositoryResult<BTreeMap<String, Entry>> {
        let pattern = PathPattern::new(pattern)?;
        self.blocking(move |inner| {
            let revision = inner.normalize(revision)?;
            Ok((*inner.find(revision, &pattern, options)?).clone())
        })
        .await
    }

    /// Commits between `from` and `to` (inclusive) that touch `pattern`,
    /// each with the changes it made.
    ///
    /// Commits come back in the direction of the range: newest first when
    /// `from` is the newer end.
    pub async fn history(
        &self,
        from: Revision,
        to: Revision,
        pattern: &str,
        max_commits: usize,
    ) -> RepositoryResult<Vec<HistoryEntry>> {
        let pattern = PathPattern::new(pattern)?;
        self.blocking(move |inner| {
            let range = RevisionRange::new(inner.normalize(from)?, inner.normalize(to)?);
            Ok((*inner.history(range, &pattern, max_commits)?).clone())
        })
        .await
    }

    /// Per-file changes turning revision `from` into revision `to`.
    pub async fn diff(&self, from: Revision, to: Revision, pattern: &str) -> RepositoryResult<BTreeMap<String, Change>> {
        let pattern = PathPattern::new(pattern)?;
        self.blocking(move |inner| {
            let (from, to) = (inner.normalize(from)?, inner.normalize(to)?);
            Ok((*inner.diff(from, to, &pattern)?).clone())
        })
        .await
    }

    /// Deep-merge several JSON files of one revision, later sources winning.
    pub async fn merge_files(&self, revision: Revision, query: &MergeQuery) -> RepositoryResult<MergedEntry> {
        let query = query.clone();
        self.blocking(move |inner| {
            let revision = inner.normalize(revision)?;
            let mut merged: Option<serde_json::Value> = None;
            let mut paths = Vec::new();

            for source in &query.sources {
                let entry = inner.get(revision, &Query::identity_json(source.path.as_str())?)?;
                let Some(value) = entry.as_ref().and_then(|entry| entry.as_json()) else {
                    if source.optional {
                        continue;
                    }
                    return Err(RepositoryError::entry_not_found(&source.path, revision));
                };
                match merged.as_mut() {
                    Some(merged) => merge_into(merged, value.clone(), "")?,
                    None => merged = Some(value.clone()),
                }
                paths.push(source.path.clone());
            }

            let Some(merged) = merged else {
                let wanted: Vec<&str> = query.sources.iter().map(|source| source.path.as_str()).collect();
                return Err(RepositoryError::entry_not_found(&wanted.join(","), revision));
            };
            let value = select_pointers(&merged, &query.pointers, &paths.join(","))?;
            Ok(MergedEntry { revision, value, paths })
        })
        .await
    }

    /// `head` if a file matching `pattern` changed after `last_known`.
    pub async fn find_latest_revision(&self, last_known: Revision, pattern: &str) -> RepositoryResult<Option<Revision>> {
        let pattern = PathPattern::new(pattern)?;
        self.blocking(move |inner| inner.find_latest_revision(last_known, &pattern))
            .await
    }

    /// Wait for a commit after `last_known` that touches `pattern`.
    ///
    /// Resolves to `None` when nothing qualifying happens within `timeout`,
    /// which is capped by the configured maximum. Dropping the future
    /// cancels the watch.
    pub async fn watch(&self, last_known: Revision, pattern: &str, timeout: Duration) -> RepositoryResult<Option<Revision>> {
        let pattern = PathPattern::new(pattern)?;
        let last_known = self.normalize(last_known)?;
        let timeout = timeout.min(self.inner.options.max_watch_timeout);

        let (_guard, rx) = self.inner.watches.register(pattern.clone(), last_known);
        let latest = {
            let pattern = pattern.clone();
            self.blocking(move |inner| inner.find_latest_revision(last_known, &pattern))
                .await?
        };
        if latest.is_some() {
            return Ok(latest);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(revision)) => Ok(Some(revision)),
            Ok(Err(_)) | Err(_) => Ok(None),
        }
    }

    /// Wait until the result of `query` differs from what it was at
    /// `last_known`, and return the new entry.
    pub async fn watch_file(&self, last_known: Revision, query: &Query, timeout: Duration) -> RepositoryResult<Option<Entry>> {
        let deadline = Instant::now() + timeout.min(self.inner.options.max_watch_timeout);
        let mut last_known = self.normalize(last_known)?;
        let old = self.get_or_none(last_known, query).await?;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            let Some(revision) = self.watch(last_known, query.path(), remaining).await? else {
                return Ok(None);
            };
            if let Some(entry) = self.get_or_none(revision, query).await? {
                let unchanged = old
                    .as_ref()
                    .is_some_and(|old| old.entry_type == entry.entry_type && old.content == entry.content);
                if !unchanged {
                    return Ok(Some(entry));
                }
            }
            last_known = revision;
        }
    }

    /// Register a listener and deliver the current entries under its pattern.
    pub async fn add_listener(&self, listener: Arc<dyn RepositoryListener>) -> RepositoryResult<ListenerId> {
        let pattern = PathPattern::new(listener.path_pattern())?;
        let id = self.inner.listeners.add(pattern.clone(), listener.clone());
        let entries = self
            .blocking(move |inner| {
                let _delivery = inner.listeners.delivery.lock();
                let head = inner.state.read().head;
                inner.find(head, &pattern, FindOptions::default())
            })
            .await?;
        listener.on_update(Entries::clone(&entries));
        Ok(id)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.inner.listeners.remove(id)
    }

    fn notify_listeners(&self, changed_paths: Vec<String>) {
        if self.inner.listeners.is_empty() {
            return;
        }
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let _delivery = inner.listeners.delivery.lock();
            let head = inner.state.read().head;
            for (pattern, listeners) in inner.listeners.interested(&changed_paths) {
                match inner.find(head, &pattern, FindOptions::default()) {
                    Ok(entries) => {
                        for listener in listeners {
                            listener.on_update(Entries::clone(&entries));
                        }
                    }
                    Err(e) => warn!(
                        project = %inner.project,
                        repo = %inner.name,
                        pattern = %pattern,
                        error = %e,
                        "failed to notify listeners"
                    ),
                }
            }
        });
    }

    /// Drop history older than what the retention rules require.
    ///
    /// At least `max(min_commits, 2)` commits are kept, plus every commit
    /// younger than `min_days`. Returns the new first revision.
    pub async fn remove_old_commits(&self, min_commits: usize, min_days: u32) -> RepositoryResult<Revision> {
        let guard = self.inner.write_lock.clone().lock_owned().await;
        self.blocking(move |inner| {
            let _guard = guard;
            inner.remove_old_commits(min_commits, min_days)
        })
        .await
    }

    /// remove objects no longer reachable from the branch
    pub async fn gc(&self) -> RepositoryResult<usize> {
        let guard = self.inner.write_lock.clone().lock_owned().await;
        self.blocking(move |inner| {
            let _guard = guard;
            Ok(inner.backend.collect_garbage()?)
        })
        .await
    }
}

type Files = Arc<BTreeMap<String, BlobId>>;
type Entries = BTreeMap<String, Entry>;

fn head_state(index: &CommitIdIndex, path: &Path) -> RepositoryResult<HeadState> {
    let (Some(first), Some(head)) = (index.first_revision(), index.head_revision()) else {
        return Err(StorageError::NotInitialized(path.to_path_buf()).into());
    };
    Ok(HeadState {
        first,
        head,
        head_id: index.get(head)?,
    })
}

impl Inner {
    fn normalize(&self, revision: Revision) -> RepositoryResult<Revision> {
        let state = *self.state.read();
        Ok(revision.normalize_within(state.first, state.head)?)
    }

    fn key(&self, op: CacheOp) -> CacheKey {
        CacheKey {
            repo: *self.cache_id.read(),
            op,
        }
    }

    fn tree_at(&self, revision: Revision) -> RepositoryResult<TreeId> {
        let id = self.index.get(revision)?;
        Ok(self.backend.read_commit(id)?.tree)
    }

    /// every file of a concrete revision
    fn files_at(&self, revision: Revision) -> RepositoryResult<Files> {
        self.cache.get_or_load(self.key(CacheOp::Tree { revision }), || {
            let tree = self.tree_at(revision)?;
            Ok(Arc::new(flatten(&self.backend, tree)?))
        })
    }

    fn read_content(&self, path: &str, blob: BlobId) -> RepositoryResult<FileContent> {
        let bytes = self.backend.read_blob(blob)?;
        if is_json_path(path) {
            Ok(FileContent::Json(bytes_to_json(&bytes, path)?))
        } else {
            Ok(FileContent::Text(bytes_to_text(&bytes, path)?))
        }
    }

    fn file_entry(&self, revision: Revision, path: &str, blob: BlobId, fetch_content: bool) -> RepositoryResult<Entry> {
        if !fetch_content {
            return Ok(Entry::without_content(revision, path, EntryType::guess_from_path(path)));
        }
        Ok(match self.read_content(path, blob)? {
            FileContent::Json(value) => Entry::json(revision, path, value),
            FileContent::Text(text) => Entry::text(revision, path, text),
        })
    }

    fn get(&self, revision: Revision, query: &Query) -> RepositoryResult<Option<Arc<Entry>>> {
        let key = self.key(CacheOp::Get {
            revision,
            query: query.clone(),
        });
        self.cache.get_or_load(key, || {
            let files = self.files_at(revision)?;
            let path = query.path();
            let entry = if let Some(&blob) = files.get(path) {
                self.file_entry(revision, path, blob, true)?
            } else {
                let prefix = format!("{}/", path);
                if files.range(prefix.clone()..).next().is_some_and(|(p, _)| p.starts_with(&prefix)) {
                    Entry::directory(revision, path)
                } else {
                    return Ok(None);
                }
            };
            Ok(Some(Arc::new(query.apply(entry)?)))
        })
    }

    fn find(&self, revision: Revision, pattern: &PathPattern, options: FindOptions) -> RepositoryResult<Arc<Entries>> {
        let key = self.key(CacheOp::Find {
            revision,
            pattern: pattern.as_str().to_string(),
            fetch_content: options.fetch_content,
            max_entries: options.max_entries,
        });
        self.cache.get_or_load(key, || {
            let files = self.files_at(revision)?;
            let mut paths: BTreeMap<String, Option<BlobId>> = BTreeMap::new();
            for (path, blob) in files.iter() {
                let mut end = 0;
                while let Some(offset) = path[end + 1..].find('/') {
                    end += offset + 1;
                    let dir = &path[..end];
                    if pattern.matches(dir) {
                        paths.entry(dir.to_string()).or_insert(None);
                    }
                }
                if pattern.matches(path) {
                    paths.insert(path.clone(), Some(*blob));
                }
            }

            let limit = options.max_entries.unwrap_or(usize::MAX);
            let mut entries = BTreeMap::new();
            for (path, blob) in paths.into_iter().take(limit) {
                let entry = match blob {
                    Some(blob) => self.file_entry(revision, &path, blob, options.fetch_content)?,
                    None => Entry::directory(revision, path.as_str()),
                };
                entries.insert(path, entry);
            }
            Ok(Arc::new(entries))
        })
    }

    /// check whether the commit at `revision` touched a path matching `pattern`
    fn touches(&self, revision: Revision, first: Revision, pattern: &PathPattern) -> RepositoryResult<bool> {
        if pattern.is_match_all() {
            return Ok(true);
        }
        if revision == first {
            return Ok(self.files_at(revision)?.keys().any(|path| pattern.matches(path)));
        }
        let old = self.tree_at(revision.backward(1))?;
        let new = self.tree_at(revision)?;
        Ok(diff_trees(&self.backend, old, new)?
            .iter()
            .any(|change| pattern.matches(&change.path)))
    }

    fn history(
        &self,
        range: RevisionRange,
        pattern: &PathPattern,
        max_commits: usize,
    ) -> RepositoryResult<Arc<Vec<HistoryEntry>>> {
        let max_commits = max_commits.min(self.options.max_commits);
        let key = self.key(CacheOp::History {
            from: range.from,
            to: range.to,
            pattern: pattern.as_str().to_string(),
            max_commits,
        });
        self.cache.get_or_load(key, || {
            let first = self.state.read().first;
            let descending = range.to_descending();
            let mut commits = Vec::new();
            let mut revision = descending.from;
            while revision >= descending.to && commits.len() < max_commits {
                if self.touches(revision, first, pattern)? {
                    let record = self.backend.read_commit(self.index.get(revision)?)?;
                    let parent = if revision > first {
                        Some(self.tree_at(revision.backward(1))?)
                    } else {
                        None
                    };
                    let changes = self.tree_changes(parent, record.tree, &PathPattern::all())?;
                    commits.push(HistoryEntry {
                        commit: record.commit,
                        changes: changes.into_values().collect(),
                    });
                }
                revision = revision.backward(1);
            }
            if range.is_ascending() {
                commits.reverse();
            }
            Ok(Arc::new(commits))
        })
    }

    fn diff(&self, from: Revision, to: Revision, pattern: &PathPattern) -> RepositoryResult<Arc<BTreeMap<String, Change>>> {
        let key = self.key(CacheOp::Diff {
            from,
            to,
            pattern: pattern.as_str().to_string(),
        });
        self.cache.get_or_load(key, || {
            let changes = self.tree_changes(Some(self.tree_at(from)?), self.tree_at(to)?, pattern)?;
            Ok(Arc::new(changes))
        })
    }

    /// Per-file changes turning `old` into `new`. Without `old` every file
    /// of `new` counts as added.
    fn tree_changes(
        &self,
        old: Option<TreeId>,
        new: TreeId,
        pattern: &PathPattern,
    ) -> RepositoryResult<BTreeMap<String, Change>> {
        let edited: Vec<(String, Option<BlobId>, Option<BlobId>)> = match old {
            Some(old) => diff_trees(&self.backend, old, new)?
                .into_iter()
                .map(|change| (change.path, change.old, change.new))
                .collect(),
            None => flatten(&self.backend, new)?
                .into_iter()
                .map(|(path, blob)| (path, None, Some(blob)))
                .collect(),
        };

        let mut changes = BTreeMap::new();
        for (path, old, new) in edited {
            if !pattern.matches(&path) {
                continue;
            }
            let new = new.map(|blob| self.read_content(&path, blob)).transpose()?;
            let old = match new {
                Some(_) => old.map(|blob| self.read_content(&path, blob)).transpose()?,
                None => None,
            };
            let change = describe_edit(&path, old.as_ref(), new.as_ref());
            changes.insert(path, change);
        }
        Ok(changes)
    }

    fn find_latest_revision(&self, last_known: Revision, pattern: &PathPattern) -> RepositoryResult<Option<Revision>> {
        let last_known = self.normalize(last_known)?;
        let head = self.state.read().head;
        if last_known >= head {
            return Ok(None);
        }
        if pattern.is_match_all() {
            return Ok(Some(head));
        }
        let changed = diff_trees(&self.backend, self.tree_at(last_known)?, self.tree_at(head)?)?;
        Ok(changed
            .iter()
            .any(|change| pattern.matches(&change.path))
            .then_some(head))
    }

    /// Build and record the next revision. The caller holds the write lock.
    fn commit(&self, request: CommitRequest) -> RepositoryResult<(CommitResult, Vec<String>)> {
        let state = *self.state.read();
        let base = request.base.normalize_within(state.first, state.head)?;

        if base != state.head {
            if !request.normalizing {
                return Err(RepositoryError::ChangeConflict(format!(
                    "base revision {} is not the head revision {}",
                    base, state.head
                )));
            }
            self.check_rebase(base, state.head, &request.changes)?;
        }

        let files = self.files_at(state.head)?;
        let applied = apply_changes(&files, |path, blob| self.read_content(path, blob), &request.changes)?;

        let head = self.backend.read_commit(state.head_id)?;
        let mut mutator = TreeMutator::new(&self.backend, head.tree);
        for (path, content) in &applied.edits {
            match content {
                Some(content) => {
                    let blob = self.backend.write_blob(&content.to_bytes()?)?;
                    mutator.upsert(path, blob);
                }
                None => mutator.remove(path),
            }
        }
        let tree = mutator.write()?;

        let revision = state.head.forward(1);
        let id = CommitBuilder::new(revision)
            .parent(&head)
            .tree(tree)
            .author(request.author)
            .when(request.when)
            .summary(request.summary)
            .detail(request.detail, request.markup)
            .write(&self.backend)?;

        // objects first, then the branch, then the index
        self.backend.update_ref(MAIN_REF, Some(state.head_id), id)?;
        self.index.append(revision, id)?;
        {
            let mut current = self.state.write();
            current.head = revision;
            current.head_id = id;
        }

        info!(
            project = %self.project,
            repo = %self.name,
            revision = %revision,
            changes = applied.changes.len(),
            "committed"
        );
        let changed_paths = applied.edits.into_keys().collect();
        Ok((
            CommitResult {
                revision,
                changes: applied.changes,
            },
            changed_paths,
        ))
    }

    /// Changes other than JSON patches may not touch paths that changed
    /// between `base` and `head`.
    fn check_rebase(&self, base: Revision, head: Revision, changes: &[Change]) -> RepositoryResult<()> {
        let changed: BTreeSet<String> = diff_trees(&self.backend, self.tree_at(base)?, self.tree_at(head)?)?
            .into_iter()
            .map(|change| change.path)
            .collect();
        let overlaps = |target: &str| {
            let prefix = format!("{}/", target);
            changed.contains(target) || changed.iter().any(|path| path.starts_with(&prefix))
        };

        for change in changes {
            let targets: Vec<&str> = match &change.content {
                ChangeContent::ApplyJsonPatch(_) => continue,
                ChangeContent::Rename(new_path) => vec![change.path.as_str(), new_path.as_str()],
                _ => vec![change.path.as_str()],
            };
            if let Some(target) = targets.into_iter().find(|target| overlaps(*target)) {
                return Err(RepositoryError::ChangeConflict(format!(
                    "{} was modified between revision {} and {}",
                    target, base, head
                )));
            }
        }
        Ok(())
    }

    fn remove_old_commits(&self, min_commits: usize, min_days: u32) -> RepositoryResult<Revision> {
        let state = *self.state.read();
        let keep = i32::try_from(min_commits.max(2)).unwrap_or(i32::MAX);
        let cutoff = chrono::Utc::now().timestamp_millis() - i64::from(min_days) * 86_400_000;

        let mut new_first = state.head.backward(keep - 1).max(state.first);
        while new_first > state.first {
            let previous = self.backend.read_commit(self.index.get(new_first.backward(1))?)?;
            if previous.commit.when < cutoff {
                break;
            }
            new_first = new_first.backward(1);
        }
        if new_first <= state.first {
            return Ok(state.first);
        }

        let root = self.backend.read_commit(self.index.get(new_first)?)?;
        let mut tip = self.backend.read_commit(
            CommitBuilder::from_commit(&root.commit)
                .tree(root.tree)
                .write(&self.backend)?,
        )?;
        let mut revision = new_first.forward(1);
        while revision <= state.head {
            let record = self.backend.read_commit(self.index.get(revision)?)?;
            let id = CommitBuilder::from_commit(&record.commit)
                .parent(&tip)
                .tree(record.tree)
                .write(&self.backend)?;
            tip = self.backend.read_commit(id)?;
            revision = revision.forward(1);
        }

        self.backend.update_ref(MAIN_REF, Some(state.head_id), tip.id)?;
        self.index.rebuild(&self.backend)?;
        {
            let mut current = self.state.write();
            current.first = new_first;
            current.head_id = tip.id;
        }
        let old_cache_id = std::mem::replace(&mut *self.cache_id.write(), Ulid::new());
        self.cache.invalidate_repository(old_cache_id);

        info!(
            project = %self.project,
            repo = %self.name,
            removed = new_first.major() - state.first.major(),
            first = %new_first,
            "removed old commits"
        );
        Ok(new_first)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encryption::LocalKeyManagementService;
    use crate::storage::INDEX_FILE_NAME;
    use parking_lot::Mutex;
    use serde_json::json;
    use tempfile::TempDir;

    fn context() -> RepositoryContext {
        RepositoryContext {
            cache: RepositoryCache::new(16 << 20, Duration::from_secs(300)),
            encryption: None,
            options: RepositoryOptions::default(),
        }
    }

    async fn create(dir: &TempDir, ctx: &RepositoryContext) -> Repository {
        Repository::create(
            ProjectName::new("foo").unwrap(),
            RepositoryName::new("bar").unwrap(),
            dir.path().join("bar"),
            Author::system(),
            0,
            false,
            ctx,
        )
        .await
        .unwrap()
    }

    async fn push(repo: &Repository, changes: Vec<Change>) -> RepositoryResult<CommitResult> {
        repo.commit(CommitRequest::new(Revision::HEAD, changes).summary("test"))
            .await
    }

    fn upsert(path: &str, value: serde_json::Value) -> Change {
        Change::upsert_json(path, value).unwrap()
    }

    #[tokio::test]
    async fn revisions_are_monotonic() {
        let dir = TempDir::new().unwrap();
        let ctx = context();
        let repo = create(&dir, &ctx).await;
        assert_eq!(repo.head_revision(), Revision::INIT);

        for i in 0..3 {
            let result = push(&repo, vec![upsert("/a.json", json!({ "i": i }))]).await.unwrap();
            assert_eq!(result.revision, Revision::new(i + 2));
        }
        assert_eq!(repo.head_revision(), Revision::new(4));

        let history = repo
            .history(Revision::HEAD, Revision::INIT, "/**", 100)
            .await
            .unwrap();
        let revisions: Vec<i32> = history.iter().map(|entry| entry.commit.revision.major()).collect();
        assert_eq!(revisions, vec![4, 3, 2, 1]);
    }

    #[tokio::test]
    async fn json_update_is_recorded_as_safe_replace() {
        let dir = TempDir::new().unwrap();
        let ctx = context();
        let repo = create(&dir, &ctx).await;

        let first = push(&repo, vec![upsert("/x.json", json!({"a": "b"}))]).await.unwrap();
        assert_eq!(first.revision, Revision::new(2));
        let second = push(&repo, vec![upsert("/x.json", json!({"a": "c"}))]).await.unwrap();
        assert_eq!(second.revision, Revision::new(3));

        let expected = json!([{"op": "safeReplace", "path": "/a", "oldValue": "b", "value": "c"}]);
        let ChangeContent::ApplyJsonPatch(patch) = &second.changes[0].content else {
            panic!("expected a patch, got {:?}", second.changes[0]);
        };
        assert_eq!(serde_json::to_value(patch).unwrap(), expected);

        let diff = repo
            .diff(Revision::new(2), Revision::new(3), "/x.json")
            .await
            .unwrap();
        assert_eq!(diff.len(), 1);
        let ChangeContent::ApplyJsonPatch(patch) = &diff["/x.json"].content else {
            panic!("expected a patch, got {:?}", diff["/x.json"]);
        };
        assert_eq!(serde_json::to_value(patch).unwrap(), expected);
    }

    #[tokio::test]
    async fn stale_base_conflicts() {
        let dir = TempDir::new().unwrap();
        let ctx = context();
        let repo = create(&dir, &ctx).await;
        push(&repo, vec![upsert("/x.json", json!({"a": 1}))]).await.unwrap();
        push(&repo, vec![upsert("/x.json", json!({"a": 2}))]).await.unwrap();

        let change = upsert("/x.json", json!({"a": 3}));
        let err = repo
            .commit(CommitRequest::new(Revision::new(2), vec![change.clone()]))
            .await
            .unwrap_err();
        assert!(err.is_conflict());

        let err = repo
            .commit(CommitRequest::new(Revision::new(2), vec![change]).normalizing(true))
            .await
            .unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(repo.head_revision(), Revision::new(3));
    }

    #[tokio::test]
    async fn rebased_patch_checks_old_values() {
        let dir = TempDir::new().unwrap();
        let ctx = context();
        let repo = create(&dir, &ctx).await;
        push(&repo, vec![upsert("/x.json", json!({"a": 1, "b": 1}))]).await.unwrap();
        push(&repo, vec![upsert("/x.json", json!({"a": 2, "b": 1}))]).await.unwrap();

        // written against revision 2, where "a" was still 1
        let stale = generate_patch(&json!({"a": 1, "b": 1}), &json!({"a": 5, "b": 1}));
        let err = repo
            .commit(
                CommitRequest::new(Revision::new(2), vec![Change::apply_json_patch("/x.json", stale).unwrap()])
                    .normalizing(true),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::ChangeConflict(_)));

        // an edit to a member nobody else touched still applies
        let fresh = generate_patch(&json!({"a": 1, "b": 1}), &json!({"a": 1, "b": 7}));
        let result = repo
            .commit(
                CommitRequest::new(Revision::new(2), vec![Change::apply_json_patch("/x.json", fresh).unwrap()])
                    .normalizing(true),
            )
            .await
            .unwrap();
        assert_eq!(result.revision, Revision::new(4));
        let entry = repo
            .get(Revision::HEAD, &Query::identity_json("/x.json").unwrap())
            .await
            .unwrap();
        assert_eq!(entry.as_json(), Some(&json!({"a": 2, "b": 7})));
    }

    #[tokio::test]
    async fn redundant_change_does_not_advance_head() {
        let dir = TempDir::new().unwrap();
        let ctx = context();
        let repo = create(&dir, &ctx).await;
        push(&repo, vec![upsert("/x.json", json!({"a": 1, "b": 2}))]).await.unwrap();

        let err = push(&repo, vec![upsert("/x.json", json!({"b": 2, "a": 1}))]).await.unwrap_err();
        assert!(err.is_redundant());
        assert_eq!(repo.head_revision(), Revision::new(2));
    }

    #[tokio::test]
    async fn stale_index_is_rebuilt_on_open() {
        let dir = TempDir::new().unwrap();
        let ctx = context();
        let repo = create(&dir, &ctx).await;
        for i in 0..3 {
            push(&repo, vec![upsert("/a.json", json!(i))]).await.unwrap();
        }
        let ids: Vec<CommitId> = (1..=4)
            .map(|major| repo.inner.index.get(Revision::new(major)).unwrap())
            .collect();
        drop(repo);

        // keep only the first two records
        let index_path = dir.path().join("bar").join(INDEX_FILE_NAME);
        let bytes = std::fs::read(&index_path).unwrap();
        std::fs::write(&index_path, &bytes[..48]).unwrap();

        let repo = Repository::open(
            ProjectName::new("foo").unwrap(),
            RepositoryName::new("bar").unwrap(),
            dir.path().join("bar"),
            &ctx,
        )
        .await
        .unwrap();
        assert_eq!(repo.head_revision(), Revision::new(4));
        for (major, id) in (1..=4).zip(ids) {
            assert_eq!(repo.inner.index.get(Revision::new(major)).unwrap(), id);
        }
    }

    #[tokio::test]
    async fn historical_reads_hit_the_cache() {
        let dir = TempDir::new().unwrap();
        let ctx = context();
        let repo = create(&dir, &ctx).await;
        push(&repo, vec![upsert("/a.json", json!({"v": 1}))]).await.unwrap();
        push(&repo, vec![upsert("/a.json", json!({"v": 2}))]).await.unwrap();

        let query = Query::identity("/a.json").unwrap();
        let first = repo.get(Revision::new(2), &query).await.unwrap();
        let loads = ctx.cache.loads();
        push(&repo, vec![upsert("/a.json", json!({"v": 3}))]).await.unwrap();
        let loads_after_commit = ctx.cache.loads();

        let second = repo.get(Revision::new(2), &query).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(ctx.cache.loads(), loads_after_commit);
        assert!(loads_after_commit >= loads);

        let head = repo.get(Revision::HEAD, &query).await.unwrap();
        assert_eq!(head.as_json(), Some(&json!({"v": 3})));
    }

    #[tokio::test]
    async fn watch_wakes_on_matching_change_only() {
        let dir = TempDir::new().unwrap();
        let ctx = context();
        let repo = create(&dir, &ctx).await;

        let watcher = {
            let repo = repo.clone();
            tokio::spawn(async move { repo.watch(Revision::INIT, "/foo/**", Duration::from_secs(10)).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        push(&repo, vec![Change::upsert_text("/bar/x", "x").unwrap()]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!watcher.is_finished());

        push(&repo, vec![Change::upsert_text("/foo/y", "y").unwrap()]).await.unwrap();
        let revision = watcher.await.unwrap().unwrap();
        assert_eq!(revision, Some(Revision::new(3)));
        assert_eq!(repo.inner.watches.pending(), 0);
    }

    #[tokio::test]
    async fn watch_times_out_and_sees_missed_commits() {
        let dir = TempDir::new().unwrap();
        let ctx = context();
        let repo = create(&dir, &ctx).await;
        push(&repo, vec![Change::upsert_text("/foo/a", "a").unwrap()]).await.unwrap();

        let missed = repo
            .watch(Revision::INIT, "/foo/**", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(missed, Some(Revision::new(2)));

        let none = repo
            .watch(Revision::HEAD, "/foo/**", Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(none, None);
        assert_eq!(repo.inner.watches.pending(), 0);
    }

    #[tokio::test]
    async fn watch_file_returns_new_content() {
        let dir = TempDir::new().unwrap();
        let ctx = context();
        let repo = create(&dir, &ctx).await;
        push(&repo, vec![upsert("/a.json", json!({"v": 1}))]).await.unwrap();

        let query = Query::json_pointer("/a.json", vec!["/v".to_string()]).unwrap();
        let watcher = {
            let repo = repo.clone();
            let query = query.clone();
            tokio::spawn(async move { repo.watch_file(Revision::HEAD, &query, Duration::from_secs(10)).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        push(&repo, vec![upsert("/a.json", json!({"v": 2}))]).await.unwrap();

        let entry = watcher.await.unwrap().unwrap().unwrap();
        assert_eq!(entry.revision, Revision::new(3));
        assert_eq!(entry.as_json(), Some(&json!(2)));
    }

    #[tokio::test]
    async fn find_lists_files_and_directories() {
        let dir = TempDir::new().unwrap();
        let ctx = context();
        let repo = create(&dir, &ctx).await;
        push(
            &repo,
            vec![
                upsert("/a/b.json", json!(1)),
                Change::upsert_text("/a/c/d.txt", "d").unwrap(),
                upsert("/e.json", json!(2)),
            ],
        )
        .await
        .unwrap();

        let all = repo.find(Revision::HEAD, "/**", FindOptions::default()).await.unwrap();
        let paths: Vec<&str> = all.keys().map(String::as_str).collect();
        assert_eq!(paths, vec!["/a", "/a/b.json", "/a/c", "/a/c/d.txt", "/e.json"]);
        assert_eq!(all["/a"].entry_type, EntryType::Directory);
        assert_eq!(all["/a/c/d.txt"].as_text(), Some("d\n"));

        let json = repo
            .find(Revision::HEAD, "*.json", FindOptions::without_content())
            .await
            .unwrap();
        assert_eq!(json.len(), 2);
        assert!(json.values().all(|entry| !entry.has_content()));

        let limited = repo
            .find(Revision::HEAD, "/**", FindOptions::default().max_entries(2))
            .await
            .unwrap();
        assert_eq!(limited.len(), 2);

        let dir_entry = repo.get(Revision::HEAD, &Query::identity("/a/c").unwrap()).await.unwrap();
        assert_eq!(dir_entry.entry_type, EntryType::Directory);
        let missing = repo
            .get(Revision::HEAD, &Query::identity("/nope.json").unwrap())
            .await
            .unwrap_err();
        assert!(missing.is_not_found());
    }

    #[tokio::test]
    async fn history_filters_by_pattern() {
        let dir = TempDir::new().unwrap();
        let ctx = context();
        let repo = create(&dir, &ctx).await;
        push(&repo, vec![upsert("/a.json", json!(1))]).await.unwrap();
        push(&repo, vec![upsert("/b.json", json!(1))]).await.unwrap();
        push(&repo, vec![upsert("/a.json", json!(2))]).await.unwrap();

        let history = repo
            .history(Revision::INIT, Revision::HEAD, "/a.json", 100)
            .await
            .unwrap();
        let revisions: Vec<i32> = history.iter().map(|entry| entry.commit.revision.major()).collect();
        assert_eq!(revisions, vec![2, 4]);

        let capped = repo.history(Revision::HEAD, Revision::INIT, "/**", 2).await.unwrap();
        let revisions: Vec<i32> = capped.iter().map(|entry| entry.commit.revision.major()).collect();
        assert_eq!(revisions, vec![4, 3]);
    }

    #[tokio::test]
    async fn files_and_directories_cannot_replace_each_other() {
        let dir = TempDir::new().unwrap();
        let ctx = context();
        let repo = create(&dir, &ctx).await;
        push(&repo, vec![Change::upsert_text("/a/b.txt", "b").unwrap()]).await.unwrap();

        let err = push(&repo, vec![Change::upsert_text("/a", "file").unwrap()]).await.unwrap_err();
        assert!(err.is_conflict());
        let err = push(&repo, vec![Change::upsert_text("/a/b.txt/c.txt", "c").unwrap()])
            .await
            .unwrap_err();
        assert!(err.is_conflict());

        assert_eq!(repo.head_revision(), Revision::new(2));
        let entry = repo.get(Revision::HEAD, &Query::identity("/a/b.txt").unwrap()).await.unwrap();
        assert_eq!(entry.as_text(), Some("b\n"));
    }

    #[tokio::test]
    async fn abandoned_commit_keeps_writes_serialized() {
        let dir = TempDir::new().unwrap();
        let ctx = context();
        let repo = create(&dir, &ctx).await;

        let abandoned = tokio::time::timeout(
            Duration::ZERO,
            repo.commit(CommitRequest::new(Revision::HEAD, vec![upsert("/a.json", json!(1))])),
        )
        .await;
        if let Ok(result) = abandoned {
            assert_eq!(result.unwrap().revision, Revision::new(2));
        }

        let result = push(&repo, vec![upsert("/b.json", json!(2))]).await.unwrap();
        assert_eq!(result.revision, Revision::new(3));
        assert_eq!(repo.head_revision(), Revision::new(3));

        let entries = repo.find(Revision::HEAD, "/**", FindOptions::default()).await.unwrap();
        let paths: Vec<&str> = entries.keys().map(String::as_str).collect();
        assert_eq!(paths, vec!["/a.json", "/b.json"]);
        repo.gc().await.unwrap();
    }

    #[tokio::test]
    async fn history_lists_changes_of_each_commit() {
        let dir = TempDir::new().unwrap();
        let ctx = context();
        let repo = create(&dir, &ctx).await;
        push(&repo, vec![upsert("/a.json", json!({"k": 1})), Change::upsert_text("/b.txt", "b").unwrap()])
            .await
            .unwrap();
        push(&repo, vec![upsert("/a.json", json!({"k": 2}))]).await.unwrap();
        push(&repo, vec![Change::remove("/b.txt").unwrap()]).await.unwrap();

        let history = repo
            .history(Revision::INIT, Revision::HEAD, "/**", 100)
            .await
            .unwrap();
        assert_eq!(history.len(), 4);
        assert!(history[0].changes.is_empty());

        let added: Vec<&str> = history[1].changes.iter().map(|change| change.path.as_str()).collect();
        assert_eq!(added, vec!["/a.json", "/b.txt"]);
        assert_eq!(history[1].changes[0].content, ChangeContent::UpsertJson(json!({"k": 1})));
        assert_eq!(history[1].changes[1].content, ChangeContent::UpsertText("b\n".to_string()));

        assert_eq!(history[2].changes.len(), 1);
        let ChangeContent::ApplyJsonPatch(patch) = &history[2].changes[0].content else {
            panic!("expected a patch, got {:?}", history[2].changes[0]);
        };
        assert_eq!(patch.apply(&json!({"k": 1})).unwrap(), json!({"k": 2}));

        assert_eq!(history[3].changes, vec![Change::remove("/b.txt").unwrap()]);

        let only_b = repo
            .history(Revision::HEAD, Revision::INIT, "/b.txt", 100)
            .await
            .unwrap();
        let revisions: Vec<i32> = only_b.iter().map(|entry| entry.commit.revision.major()).collect();
        assert_eq!(revisions, vec![4, 2]);
        assert_eq!(only_b[1].changes.len(), 2);
    }

    #[tokio::test]
    async fn removal_and_rename_diff() {
        let dir = TempDir::new().unwrap();
        let ctx = context();
        let repo = create(&dir, &ctx).await;
        push(&repo, vec![upsert("/d/a.json", json!(1)), Change::upsert_text("/d/b.txt", "b").unwrap()])
            .await
            .unwrap();
        push(&repo, vec![Change::rename("/d", "/e").unwrap()]).await.unwrap();

        let diff = repo.diff(Revision::new(2), Revision::new(3), "/**").await.unwrap();
        assert_eq!(diff["/d/a.json"].content, ChangeContent::Remove);
        assert_eq!(diff["/e/a.json"].content, ChangeContent::UpsertJson(json!(1)));
        assert_eq!(diff["/e/b.txt"].content, ChangeContent::UpsertText("b\n".to_string()));

        push(&repo, vec![Change::remove("/e").unwrap()]).await.unwrap();
        let left = repo.find(Revision::HEAD, "/**", FindOptions::default()).await.unwrap();
        assert!(left.is_empty());
    }

    #[tokio::test]
    async fn preview_diff_does_not_commit() {
        let dir = TempDir::new().unwrap();
        let ctx = context();
        let repo = create(&dir, &ctx).await;
        push(&repo, vec![upsert("/a.json", json!({"k": 1}))]).await.unwrap();

        let preview = repo
            .preview_diff(Revision::HEAD, vec![upsert("/a.json", json!({"k": 2}))])
            .await
            .unwrap();
        assert!(matches!(preview["/a.json"].content, ChangeContent::ApplyJsonPatch(_)));
        assert_eq!(repo.head_revision(), Revision::new(2));

        let redundant = repo
            .preview_diff(Revision::HEAD, vec![upsert("/a.json", json!({"k": 1}))])
            .await
            .unwrap();
        assert!(redundant.is_empty());
    }

    #[tokio::test]
    async fn merge_files_layers_documents() {
        let dir = TempDir::new().unwrap();
        let ctx = context();
        let repo = create(&dir, &ctx).await;
        push(
            &repo,
            vec![
                upsert("/base.json", json!({"a": 1, "n": {"x": 1}})),
                upsert("/prod.json", json!({"n": {"y": 2}})),
                upsert("/bad.json", json!({"n": 3})),
            ],
        )
        .await
        .unwrap();

        let query = MergeQuery::new(vec![
            MergeSource::required("/base.json"),
            MergeSource::optional("/missing.json"),
            MergeSource::required("/prod.json"),
        ]);
        let merged = repo.merge_files(Revision::HEAD, &query).await.unwrap();
        assert_eq!(merged.value, json!({"a": 1, "n": {"x": 1, "y": 2}}));
        assert_eq!(merged.paths, vec!["/base.json", "/prod.json"]);

        let narrowed = repo
            .merge_files(Revision::HEAD, &query.clone().pointer("/n/y"))
            .await
            .unwrap();
        assert_eq!(narrowed.value, json!(2));

        let required = MergeQuery::new(vec![MergeSource::required("/missing.json")]);
        assert!(repo.merge_files(Revision::HEAD, &required).await.unwrap_err().is_not_found());

        let conflicting = MergeQuery::new(vec![
            MergeSource::required("/base.json"),
            MergeSource::required("/bad.json"),
        ]);
        let err = repo.merge_files(Revision::HEAD, &conflicting).await.unwrap_err();
        assert!(matches!(err, RepositoryError::QueryExecution(_)));
    }

    #[tokio::test]
    async fn old_commits_are_removed() {
        let dir = TempDir::new().unwrap();
        let ctx = context();
        let repo = create(&dir, &ctx).await;
        for i in 0..5 {
            repo.commit(
                CommitRequest::new(Revision::HEAD, vec![upsert("/a.json", json!(i))])
                    .when(1_000)
                    .summary(format!("edit {}", i)),
            )
            .await
            .unwrap();
        }
        assert_eq!(repo.head_revision(), Revision::new(6));

        let first = repo.remove_old_commits(3, 0).await.unwrap();
        assert_eq!(first, Revision::new(4));
        assert_eq!(repo.first_revision(), Revision::new(4));
        assert_eq!(repo.head_revision(), Revision::new(6));

        let query = Query::identity_json("/a.json").unwrap();
        let err = repo.get(Revision::new(3), &query).await.unwrap_err();
        assert!(err.is_not_found());
        let entry = repo.get(Revision::new(4), &query).await.unwrap();
        assert_eq!(entry.as_json(), Some(&json!(2)));

        let history = repo.history(Revision::HEAD, Revision::new(4), "/**", 10).await.unwrap();
        assert_eq!(history.len(), 3);

        let result = push(&repo, vec![upsert("/a.json", json!(9))]).await.unwrap();
        assert_eq!(result.revision, Revision::new(7));
        assert!(repo.gc().await.unwrap() > 0);
    }

    #[tokio::test]
    async fn recent_commits_are_retained() {
        let dir = TempDir::new().unwrap();
        let ctx = context();
        let repo = create(&dir, &ctx).await;
        for i in 0..4 {
            push(&repo, vec![upsert("/a.json", json!(i))]).await.unwrap();
        }
        // only the initial commit (written at time 0) is older than a day
        let first = repo.remove_old_commits(2, 1).await.unwrap();
        assert_eq!(first, Revision::new(2));
        assert_eq!(repo.head_revision(), Revision::new(5));
    }

    struct Recorder {
        updates: Mutex<Vec<BTreeMap<String, Entry>>>,
    }

    impl RepositoryListener for Recorder {
        fn path_pattern(&self) -> &str {
            "/conf/**"
        }

        fn on_update(&self, entries: BTreeMap<String, Entry>) {
            self.updates.lock().push(entries);
        }
    }

    #[tokio::test]
    async fn listeners_receive_all_entries_under_their_pattern() {
        let dir = TempDir::new().unwrap();
        let ctx = context();
        let repo = create(&dir, &ctx).await;
        push(&repo, vec![upsert("/conf/a.json", json!(1))]).await.unwrap();

        let recorder = Arc::new(Recorder {
            updates: Mutex::new(Vec::new()),
        });
        let id = repo.add_listener(recorder.clone()).await.unwrap();
        assert_eq!(recorder.updates.lock().len(), 1);

        push(&repo, vec![upsert("/other.json", json!(1))]).await.unwrap();
        push(&repo, vec![upsert("/conf/b.json", json!(2))]).await.unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while recorder.updates.lock().len() < 2 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let updates = recorder.updates.lock().clone();
        assert_eq!(updates.len(), 2);
        let paths: Vec<&str> = updates[1].keys().map(String::as_str).collect();
        assert_eq!(paths, vec!["/conf/a.json", "/conf/b.json"]);

        assert!(repo.remove_listener(id));
    }

    #[tokio::test]
    async fn encrypted_repository_round_trip() {
        let dir = TempDir::new().unwrap();
        let manager = Arc::new(
            EncryptionStorageManager::open(
                dir.path().join("encryption.sqlite"),
                Arc::new(LocalKeyManagementService::generate()),
                Duration::from_secs(5),
            )
            .unwrap(),
        );
        let ctx = RepositoryContext {
            encryption: Some(manager.clone()),
            ..context()
        };
        let path = dir.path().join("secret");
        let repo = Repository::create(
            ProjectName::new("foo").unwrap(),
            RepositoryName::new("secret").unwrap(),
            path.clone(),
            Author::system(),
            0,
            true,
            &ctx,
        )
        .await
        .unwrap();
        assert!(repo.is_encrypted());
        push(&repo, vec![upsert("/x.json", json!({"a": "b"}))]).await.unwrap();
        push(&repo, vec![upsert("/x.json", json!({"a": "c"}))]).await.unwrap();
        drop(repo);

        let repo = Repository::open(
            ProjectName::new("foo").unwrap(),
            RepositoryName::new("secret").unwrap(),
            path.clone(),
            &ctx,
        )
        .await
        .unwrap();
        assert_eq!(repo.head_revision(), Revision::new(3));
        let entry = repo
            .get(Revision::HEAD, &Query::identity_json("/x.json").unwrap())
            .await
            .unwrap();
        assert_eq!(entry.as_json(), Some(&json!({"a": "c"})));

        let plain = RepositoryContext {
            encryption: None,
            ..context()
        };
        let err = Repository::open(
            ProjectName::new("foo").unwrap(),
            RepositoryName::new("secret").unwrap(),
            path,
            &plain,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, RepositoryError::EncryptionNotEnabled(_)));
    }
}
