//! Watches and listeners.
//!
//! A watch is a one-shot wait for the next commit touching a pattern. A
//! listener stays registered and receives the full set of entries under its
//! pattern after every commit that touches it.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::repository::change::Entry;
use crate::repository::pattern::PathPattern;
use crate::storage::Revision;

/// Receives the latest entries under a pattern.
///
/// `on_update` is always called with every entry matching the pattern at the
/// new head, not only the ones the triggering commit changed.
pub trait RepositoryListener: Send + Sync {
    fn path_pattern(&self) -> &str;

    fn on_update(&self, entries: BTreeMap<String, Entry>);
}

/// identifies a registered listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Watcher {
    pattern: PathPattern,
    last_known: Revision,
    tx: oneshot::Sender<Revision>,
}

/// pending watches of one repository
#[derive(Default)]
pub(crate) struct WatchRegistry {
    next_id: AtomicU64,
    watchers: Mutex<HashMap<u64, Watcher>>,
}

impl fmt::Debug for WatchRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchRegistry")
            .field("pending", &self.pending())
            .finish()
    }
}

impl WatchRegistry {
    /// Register a watch; dropping the guard cancels it.
    pub(crate) fn register(
        self: &Arc<Self>,
        pattern: PathPattern,
        last_known: Revision,
    ) -> (WatchGuard, oneshot::Receiver<Revision>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.watchers.lock().insert(
            id,
            Watcher {
                pattern,
                last_known,
                tx,
            },
        );
        let guard = WatchGuard {
            registry: Arc::downgrade(self),
            id,
        };
        (guard, rx)
    }

    /// wake every watch whose pattern matches one of the changed paths
    pub(crate) fn notify(&self, revision: Revision, changed_paths: &[String]) {
        let woken: Vec<Watcher> = {
            let mut watchers = self.watchers.lock();
            let ids: Vec<u64> = watchers
                .iter()
                .filter(|(_, watcher)| {
                    revision > watcher.last_known && changed_paths.iter().any(|path| watcher.pattern.matches(path))
                })
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter().filter_map(|id| watchers.remove(&id)).collect()
        };
        for watcher in woken {
            // the receiver is gone if the watch timed out meanwhile
            let _ = watcher.tx.send(revision);
        }
    }

    pub(crate) fn pending(&self) -> usize {
        self.watchers.lock().len()
    }
}

/// Deregisters a watch when dropped.
pub(crate) struct WatchGuard {
    registry: Weak<WatchRegistry>,
    id: u64,
}

impl Drop for WatchGuard {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.watchers.lock().remove(&self.id);
        }
    }
}

struct ListenerSlot {
    id: ListenerId,
    pattern: PathPattern,
    listener: Arc<dyn RepositoryListener>,
}

/// long-lived listeners of one repository
#[derive(Default)]
pub(crate) struct ListenerRegistry {
    next_id: AtomicU64,
    listeners: Mutex<Vec<ListenerSlot>>,
    /// keeps deliveries in commit order
    pub(crate) delivery: Mutex<()>,
}

impl fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("listeners", &self.listeners.lock().len())
            .finish()
    }
}

impl ListenerRegistry {
    pub(crate) fn add(&self, pattern: PathPattern, listener: Arc<dyn RepositoryListener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.lock().push(ListenerSlot { id, pattern, listener });
        id
    }

    pub(crate) fn remove(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|slot| slot.id != id);
        listeners.len() != before
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.listeners.lock().is_empty()
    }

    /// Listeners interested in any of the changed paths, grouped by pattern
    /// so each pattern is evaluated once.
    pub(crate) fn interested(&self, changed_paths: &[String]) -> Vec<(PathPattern, Vec<Arc<dyn RepositoryListener>>)> {
        let mut groups: BTreeMap<String, (PathPattern, Vec<Arc<dyn RepositoryListener>>)> = BTreeMap::new();
        for slot in self.listeners.lock().iter() {
            if !changed_paths.iter().any(|path| slot.pattern.matches(path)) {
                continue;
            }
            groups
                .entry(slot.pattern.as_str().to_string())
                .or_insert_with(|| (slot.pattern.clone(), Vec::new()))
                .1
                .push(slot.listener.clone());
        }
        groups.into_values().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop(&'static str);

    impl RepositoryListener for Noop {
        fn path_pattern(&self) -> &str {
            self.0
        }

        fn on_update(&self, _entries: BTreeMap<String, Entry>) {}
    }

    #[test]
    fn watch_wakes_on_matching_path_only() {
        let registry = Arc::new(WatchRegistry::default());
        let (_guard, mut rx) = registry.register(PathPattern::new("/foo/**").unwrap(), Revision::new(2));

        registry.notify(Revision::new(3), &["/bar/x".to_string()]);
        assert!(rx.try_recv().is_err());
        assert_eq!(registry.pending(), 1);

        registry.notify(Revision::new(4), &["/foo/y".to_string()]);
        assert_eq!(rx.try_recv().unwrap(), Revision::new(4));
        assert_eq!(registry.pending(), 0);
    }

    #[test]
    fn dropping_the_guard_cancels() {
        let registry = Arc::new(WatchRegistry::default());
        let (guard, _rx) = registry.register(PathPattern::all(), Revision::new(1));
        assert_eq!(registry.pending(), 1);
        drop(guard);
        assert_eq!(registry.pending(), 0);
    }

    #[test]
    fn listeners_grouped_by_pattern() {
        let registry = ListenerRegistry::default();
        let a = registry.add(PathPattern::new("/a/**").unwrap(), Arc::new(Noop("/a/**")));
        registry.add(PathPattern::new("/a/**").unwrap(), Arc::new(Noop("/a/**")));
        registry.add(PathPattern::new("/b.json").unwrap(), Arc::new(Noop("/b.json")));

        let groups = registry.interested(&["/a/x.json".to_string()]);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].1.len(), 2);

        assert!(registry.remove(a));
        assert!(!registry.remove(a));
        assert_eq!(registry.interested(&["/a/x.json".to_string()])[0].1.len(), 1);
    }
}
