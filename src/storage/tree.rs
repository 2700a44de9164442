//! Tree operations over the flat path space of a repository.
//!
//! Repository content is addressed by absolute paths like `/a/b.json`. In
//! the object store a tree is a directory, so a path maps onto a chain of
//! trees ending in a blob. Directories only exist while they contain files.
//!
//! this module converts between the two views, which is fiddly enough to keep
//! in one place.

use std::collections::BTreeMap;

use crate::storage::backend::Backend;
use crate::storage::error::StorageResult;
use crate::storage::types::{BlobId, TreeEntry, TreeId};

/// Every file under a tree, keyed by absolute path.
pub fn flatten(backend: &Backend, tree: TreeId) -> StorageResult<BTreeMap<String, BlobId>> {
    let mut files = BTreeMap::new();
    let mut pending = vec![(String::new(), tree)];

    while let Some((prefix, tree)) = pending.pop() {
        for entry in backend.read_tree(tree)? {
            let path = format!("{}/{}", prefix, entry.name());
            match entry {
                TreeEntry::Tree { id, .. } => pending.push((path, id)),
                TreeEntry::Blob { id, .. } => {
                    files.insert(path, id);
                }
            }
        }
    }
    Ok(files)
}

/// a file that differs between two trees
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeChange {
    pub path: String,
    pub old: Option<BlobId>,
    pub new: Option<BlobId>,
}

/// Files that differ between two trees, sorted by path.
///
/// Subtrees with equal ids are skipped without being read.
pub fn diff_trees(backend: &Backend, old: TreeId, new: TreeId) -> StorageResult<Vec<TreeChange>> {
    let mut changes = Vec::new();
    diff_into(backend, "", Some(old), Some(new), &mut changes)?;
    changes.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(changes)
}

fn entries_of(backend: &Backend, tree: Option<TreeId>) -> StorageResult<BTreeMap<String, TreeEntry>> {
    Ok(match tree {
        Some(id) => backend
            .read_tree(id)?
            .into_iter()
            .map(|entry| (entry.name().to_string(), entry))
            .collect(),
        None => BTreeMap::new(),
    })
}

fn diff_into(
    backend: &Backend,
    prefix: &str,
    old: Option<TreeId>,
    new: Option<TreeId>,
    out: &mut Vec<TreeChange>,
) -> StorageResult<()> {
    if old == new {
        return Ok(());
    }
    let old_entries = entries_of(backend, old)?;
    let mut new_entries = entries_of(backend, new)?;

    let mut blob = |path: &str, old: Option<BlobId>, new: Option<BlobId>| {
        if old != new {
            out.push(TreeChange {
                path: path.to_string(),
                old,
                new,
            });
        }
    };
    let mut subtrees = Vec::new();

    for (name, old_entry) in old_entries {
        let path = format!("{}/{}", prefix, name);
        let new_entry = new_entries.remove(&name);
        match (old_entry, new_entry) {
            (TreeEntry::Blob { id: a, .. }, Some(TreeEntry::Blob { id: b, .. })) => blob(&path, Some(a), Some(b)),
            (TreeEntry::Blob { id: a, .. }, Some(TreeEntry::Tree { id: b, .. })) => {
                blob(&path, Some(a), None);
                subtrees.push((path, None, Some(b)));
            }
            (TreeEntry::Blob { id: a, .. }, None) => blob(&path, Some(a), None),
            (TreeEntry::Tree { id: a, .. }, Some(TreeEntry::Tree { id: b, .. })) => {
                subtrees.push((path, Some(a), Some(b)))
            }
            (TreeEntry::Tree { id: a, .. }, Some(TreeEntry::Blob { id: b, .. })) => {
                blob(&path, None, Some(b));
                subtrees.push((path, Some(a), None));
            }
            (TreeEntry::Tree { id: a, .. }, None) => subtrees.push((path, Some(a), None)),
        }
    }
    for (name, new_entry) in new_entries {
        let path = format!("{}/{}", prefix, name);
        match new_entry {
            TreeEntry::Blob { id, .. } => blob(&path, None, Some(id)),
            TreeEntry::Tree { id, .. } => subtrees.push((path, None, Some(id))),
        }
    }

    for (path, old, new) in subtrees {
        diff_into(backend, &path, old, new, out)?;
    }
    Ok(())
}

/// a mutable view of a tree that produces a new tree when written
///
/// the base tree is not modified
///
/// # Usage Pattern
///
/// ```ignore
/// let mut mutator = TreeMutator::new(&backend, base_tree);
/// mutator.upsert("/a/b.json", blob_id);
/// mutator.remove("/c.txt");
/// let new_tree = mutator.write()?;
/// ```
pub struct TreeMutator<'a> {
    backend: &'a Backend,
    base: TreeId,
    /// path relative to the root (no leading `/`) -> new blob, `None` to remove
    edits: BTreeMap<String, Option<BlobId>>,
}

impl<'a> TreeMutator<'a> {
    pub fn new(backend: &'a Backend, base: TreeId) -> Self {
        Self {
            backend,
            base,
            edits: BTreeMap::new(),
        }
    }

    pub fn upsert(&mut self, path: &str, blob: BlobId) {
        self.edits.insert(path.trim_start_matches('/').to_string(), Some(blob));
    }

    pub fn remove(&mut self, path: &str) {
        self.edits.insert(path.trim_start_matches('/').to_string(), None);
    }

    pub fn is_empty(&self) -> bool {
        self.edits.is_empty()
    }

    /// write every modified tree and return the new root
    pub fn write(self) -> StorageResult<TreeId> {
        if self.edits.is_empty() {
            return Ok(self.base);
        }
        match rewrite(self.backend, Some(self.base), self.edits)? {
            Some(root) => Ok(root),
            None => self.backend.write_tree(&[]),
        }
    }
}

/// rewrite one directory; `None` when it ends up empty
fn rewrite(
    backend: &Backend,
    base: Option<TreeId>,
    edits: BTreeMap<String, Option<BlobId>>,
) -> StorageResult<Option<TreeId>> {
    let mut entries = entries_of(backend, base)?;
    let mut nested: BTreeMap<String, BTreeMap<String, Option<BlobId>>> = BTreeMap::new();

    for (path, blob) in edits {
        match path.split_once('/') {
            Some((dir, rest)) => {
                nested
                    .entry(dir.to_string())
                    .or_default()
                    .insert(rest.to_string(), blob);
            }
            None => match blob {
                Some(id) => {
                    entries.insert(path.clone(), TreeEntry::Blob { name: path, id });
                }
                None => {
                    entries.remove(&path);
                }
            },
        }
    }

    for (dir, edits) in nested {
        let base = match entries.get(&dir) {
            Some(TreeEntry::Tree { id, .. }) => Some(*id),
            _ => None,
        };
        match rewrite(backend, base, edits)? {
            Some(id) => {
                entries.insert(dir.clone(), TreeEntry::Tree { name: dir, id });
            }
            None => {
                entries.remove(&dir);
            }
        }
    }

    if entries.is_empty() {
        return Ok(None);
    }
    let entries: Vec<TreeEntry> = entries.into_values().collect();
    Ok(Some(backend.write_tree(&entries)?))
}
