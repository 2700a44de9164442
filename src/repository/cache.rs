//! The repository cache.
//!
//! One weight-bounded cache is shared by every repository of a process. Keys
//! always carry concrete revisions; a read at HEAD is normalized before the
//! lookup, so a new commit simply leads to new keys and nothing cached ever
//! goes stale. Concurrent misses on one key are coalesced into a single load.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use moka::sync::Cache;
use ulid::Ulid;

use crate::repository::change::{Change, Entry, HistoryEntry, Query};
use crate::repository::error::{RepositoryError, RepositoryResult};
use crate::storage::{BlobId, Revision};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct CacheKey {
    /// changes whenever a repository's history is rewritten
    pub repo: Ulid,
    pub op: CacheOp,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum CacheOp {
    Tree {
        revision: Revision,
    },
    Get {
        revision: Revision,
        query: Query,
    },
    Find {
        revision: Revision,
        pattern: String,
        fetch_content: bool,
        max_entries: Option<usize>,
    },
    Diff {
        from: Revision,
        to: Revision,
        pattern: String,
    },
    History {
        from: Revision,
        to: Revision,
        pattern: String,
        max_commits: usize,
    },
}

#[derive(Debug, Clone)]
pub(crate) enum CachedValue {
    Files(Arc<BTreeMap<String, BlobId>>),
    Entry(Option<Arc<Entry>>),
    Entries(Arc<BTreeMap<String, Entry>>),
    Changes(Arc<BTreeMap<String, Change>>),
    History(Arc<Vec<HistoryEntry>>),
}

impl CachedValue {
    fn weight(&self) -> usize {
        match self {
            CachedValue::Files(files) => files.keys().map(|path| path.len() + 20).sum(),
            CachedValue::Entry(entry) => entry.as_ref().map_or(0, |entry| entry.weight()),
            CachedValue::Entries(entries) => entries.values().map(Entry::weight).sum(),
            CachedValue::Changes(changes) => changes.values().map(change_weight).sum(),
            CachedValue::History(entries) => entries
                .iter()
                .map(|entry| {
                    let changes: usize = entry.changes.iter().map(change_weight).sum();
                    64 + entry.commit.summary.len() + entry.commit.detail.len() + changes
                })
                .sum(),
        }
    }
}

fn change_weight(change: &Change) -> usize {
    serde_json::to_string(change).map_or(0, |s| s.len())
}

/// conversion between a cached value and the type callers expect
pub(crate) trait Cached: Sized {
    fn into_cached(self) -> CachedValue;
    fn from_cached(value: CachedValue) -> Option<Self>;
}

macro_rules! cached {
    ($ty:ty, $variant:ident) => {
        impl Cached for $ty {
            fn into_cached(self) -> CachedValue {
                CachedValue::$variant(self)
            }

            fn from_cached(value: CachedValue) -> Option<Self> {
                match value {
                    CachedValue::$variant(inner) => Some(inner),
                    _ => None,
                }
            }
        }
    };
}

cached!(Arc<BTreeMap<String, BlobId>>, Files);
cached!(Option<Arc<Entry>>, Entry);
cached!(Arc<BTreeMap<String, Entry>>, Entries);
cached!(Arc<BTreeMap<String, Change>>, Changes);
cached!(Arc<Vec<HistoryEntry>>, History);

/// Cache of materialized trees, entries, diffs and histories.
#[derive(Clone)]
pub struct RepositoryCache {
    cache: Cache<CacheKey, CachedValue>,
    loads: Arc<AtomicU64>,
}

impl std::fmt::Debug for RepositoryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepositoryCache")
            .field("entries", &self.cache.entry_count())
            .field("weight", &self.cache.weighted_size())
            .field("loads", &self.loads())
            .finish()
    }
}

impl RepositoryCache {
    pub fn new(max_weight_bytes: u64, expire_after_access: Duration) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_weight_bytes)
            .weigher(|_key: &CacheKey, value: &CachedValue| -> u32 {
                value.weight().try_into().unwrap_or(u32::MAX)
            })
            .time_to_idle(expire_after_access)
            .build();
        Self {
            cache,
            loads: Arc::new(AtomicU64::new(0)),
        }
    }

    /// how many values were loaded because they were missing
    pub fn loads(&self) -> u64 {
        self.loads.load(Ordering::Relaxed)
    }

    /// Return the cached value for `key`, loading it on a miss.
    ///
    /// Callers racing on the same missing key wait for the first one's load;
    /// a failed load is shared with all of them and not cached.
    pub(crate) fn get_or_load<T, F>(&self, key: CacheKey, load: F) -> RepositoryResult<T>
    where
        T: Cached,
        F: FnOnce() -> RepositoryResult<T>,
    {
        let value = self.cache.try_get_with(key, || {
            self.loads.fetch_add(1, Ordering::Relaxed);
            load().map(Cached::into_cached)
        })?;
        T::from_cached(value).ok_or_else(|| RepositoryError::Internal("cached value has an unexpected type".to_string()))
    }

    /// drop every entry of a repository
    pub(crate) fn invalidate_repository(&self, repo: Ulid) {
        let entries: Vec<CacheKey> = self
            .cache
            .iter()
            .filter(|(key, _)| key.repo == repo)
            .map(|(key, _)| CacheKey::clone(&key))
            .collect();
        for key in entries {
            self.cache.invalidate(&key);
        }
    }
}
