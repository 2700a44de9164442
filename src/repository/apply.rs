//! Applying a list of changes to the files of a revision.
//!
//! The result is the set of files whose content actually changes plus the
//! changes rewritten to their literal effect. A full JSON upsert over an
//! existing JSON file comes back as a patch when that patch reproduces the
//! new content exactly.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;

use crate::repository::change::{Change, ChangeContent};
use crate::repository::error::{RepositoryError, RepositoryResult};
use crate::repository::json_patch::generate_patch;
use crate::repository::path::is_json_path;
use crate::storage::{json_to_bytes, sanitize_text, BlobId, StorageResult};

/// parsed content of one file
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum FileContent {
    Json(Value),
    Text(String),
}

impl FileContent {
    pub(crate) fn to_bytes(&self) -> StorageResult<Vec<u8>> {
        match self {
            FileContent::Json(value) => json_to_bytes(value),
            FileContent::Text(text) => Ok(text.as_bytes().to_vec()),
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct AppliedChanges {
    /// path -> new content, `None` for removal
    pub edits: BTreeMap<String, Option<FileContent>>,
    pub changes: Vec<Change>,
}

struct Workspace<'a, R> {
    files: &'a BTreeMap<String, BlobId>,
    read: R,
    originals: BTreeMap<String, FileContent>,
    working: BTreeMap<String, Option<FileContent>>,
}

impl<'a, R> Workspace<'a, R>
where
    R: FnMut(&str, BlobId) -> RepositoryResult<FileContent>,
{
    fn original(&mut self, path: &str) -> RepositoryResult<Option<FileContent>> {
        let Some(&blob) = self.files.get(path) else {
            return Ok(None);
        };
        if let Some(content) = self.originals.get(path) {
            return Ok(Some(content.clone()));
        }
        let content = (self.read)(path, blob)?;
        self.originals.insert(path.to_string(), content.clone());
        Ok(Some(content))
    }

    fn current(&mut self, path: &str) -> RepositoryResult<Option<FileContent>> {
        match self.working.get(path) {
            Some(content) => Ok(content.clone()),
            None => self.original(path),
        }
    }

    fn is_file(&self, path: &str) -> bool {
        match self.working.get(path) {
            Some(content) => content.is_some(),
            None => self.files.contains_key(path),
        }
    }

    /// files currently under the directory `dir`
    fn files_under(&self, dir: &str) -> Vec<String> {
        let prefix = format!("{}/", dir);
        let candidates: BTreeSet<&String> = self
            .files
            .keys()
            .chain(self.working.keys())
            .filter(|path| path.starts_with(&prefix))
            .collect();
        candidates
            .into_iter()
            .filter(|path| self.is_file(path))
            .cloned()
            .collect()
    }

    fn exists(&self, path: &str) -> bool {
        self.is_file(path) || !self.files_under(path).is_empty()
    }

    /// the first ancestor directory of `path` that is currently a file
    fn file_ancestor(&self, path: &str) -> Option<String> {
        path.match_indices('/')
            .map(|(at, _)| &path[..at])
            .filter(|ancestor| !ancestor.is_empty())
            .find(|ancestor| self.is_file(ancestor))
            .map(str::to_string)
    }

    /// Fail unless a file can be written at `path` without replacing a
    /// directory or turning an existing file into one.
    fn check_file_slot(&self, path: &str) -> RepositoryResult<()> {
        if !self.files_under(path).is_empty() {
            return Err(conflict(path, "a directory exists at this path"));
        }
        if let Some(ancestor) = self.file_ancestor(path) {
            return Err(conflict(path, &format!("{} is a file", ancestor)));
        }
        Ok(())
    }

    fn apply(&mut self, change: &Change) -> RepositoryResult<()> {
        let path = change.path.as_str();
        match &change.content {
            ChangeContent::UpsertJson(value) => {
                self.check_file_slot(path)?;
                self.working.insert(path.to_string(), Some(FileContent::Json(value.clone())));
            }
            ChangeContent::UpsertText(text) => {
                self.check_file_slot(path)?;
                self.working
                    .insert(path.to_string(), Some(FileContent::Text(sanitize_text(text))));
            }
            ChangeContent::Remove => {
                if self.is_file(path) {
                    self.working.insert(path.to_string(), None);
                } else {
                    let under = self.files_under(path);
                    if under.is_empty() {
                        return Err(conflict(path, "cannot remove a non-existent entry"));
                    }
                    for file in under {
                        self.working.insert(file, None);
                    }
                }
            }
            ChangeContent::Rename(new_path) => {
                if self.exists(new_path) {
                    return Err(conflict(new_path, "rename target already exists"));
                }
                if new_path.starts_with(&format!("{}/", path)) {
                    return Err(conflict(new_path, "cannot rename a directory into itself"));
                }
                if let Some(ancestor) = self.file_ancestor(new_path) {
                    return Err(conflict(new_path, &format!("{} is a file", ancestor)));
                }
                let moves: Vec<(String, String)> = if self.is_file(path) {
                    vec![(path.to_string(), new_path.clone())]
                } else {
                    self.files_under(path)
                        .into_iter()
                        .map(|file| {
                            let target = format!("{}{}", new_path, &file[path.len()..]);
                            (file, target)
                        })
                        .collect()
                };
                if moves.is_empty() {
                    return Err(conflict(path, "cannot rename a non-existent entry"));
                }
                for (from, to) in moves {
                    let content = self.current(&from)?;
                    let content = match content {
                        Some(FileContent::Json(value)) if !is_json_path(&to) => {
                            FileContent::Text(sanitize_text(&value.to_string()))
                        }
                        Some(FileContent::Text(text)) if is_json_path(&to) => {
                            FileContent::Json(serde_json::from_str(&text).map_err(|e| {
                                conflict(&to, &format!("renamed content is not valid JSON: {}", e))
                            })?)
                        }
                        Some(content) => content,
                        None => continue,
                    };
                    self.working.insert(from, None);
                    self.working.insert(to, Some(content));
                }
            }
            ChangeContent::ApplyJsonPatch(patch) => {
                self.check_file_slot(path)?;
                let base = match self.current(path)? {
                    Some(FileContent::Json(value)) => value,
                    Some(FileContent::Text(_)) => return Err(conflict(path, "cannot patch a text file")),
                    None => Value::Null,
                };
                let patched = patch
                    .apply(&base)
                    .map_err(|e| RepositoryError::from_patch(path, e))?;
                self.working.insert(path.to_string(), Some(FileContent::Json(patched)));
            }
        }
        Ok(())
    }
}

/// whether `a` and `b` are the same entry or one lies inside the other
pub(crate) fn overlaps(a: &str, b: &str) -> bool {
    fn inside(path: &str, dir: &str) -> bool {
        dir == "/" || path.strip_prefix(dir).is_some_and(|rest| rest.starts_with('/'))
    }
    a == b || inside(a, b) || inside(b, a)
}

fn conflict(path: &str, reason: &str) -> RepositoryError {
    RepositoryError::ChangeConflict(format!("{}: {}", path, reason))
}

/// Apply `changes` in order on top of `files`.
///
/// `read` loads and parses the content of an existing file. Two changes
/// whose paths are equal or nested inside each other conflict, and so does
/// writing a file over a directory or below an existing file. Fails with
/// `RedundantChange` when no file would end up different.
pub(crate) fn apply_changes<R>(
    files: &BTreeMap<String, BlobId>,
    read: R,
    changes: &[Change],
) -> RepositoryResult<AppliedChanges>
where
    R: FnMut(&str, BlobId) -> RepositoryResult<FileContent>,
{
    let mut touched: Vec<&str> = Vec::new();
    for change in changes {
        change.validate()?;
        let targets = match &change.content {
            ChangeContent::Rename(new_path) => vec![change.path.as_str(), new_path.as_str()],
            _ => vec![change.path.as_str()],
        };
        for target in targets {
            if let Some(other) = touched.iter().find(|other| overlaps(other, target)) {
                return Err(conflict(target, &format!("overlaps another change to {}", other)));
            }
            touched.push(target);
        }
    }

    let mut workspace = Workspace {
        files,
        read,
        originals: BTreeMap::new(),
        working: BTreeMap::new(),
    };
    for change in changes {
        workspace.apply(change)?;
    }

    let mut applied = AppliedChanges::default();
    let working = std::mem::take(&mut workspace.working);
    for (path, new) in working {
        let old = workspace.original(&path)?;
        if old == new {
            continue;
        }
        let change = describe_edit(&path, old.as_ref(), new.as_ref());
        applied.changes.push(change);
        applied.edits.insert(path, new);
    }

    if applied.edits.is_empty() {
        return Err(RepositoryError::RedundantChange);
    }
    Ok(applied)
}

/// The change that turns `old` into `new` at `path`.
///
/// JSON edits become a patch when the generated patch reproduces `new`
/// exactly, otherwise a full upsert.
pub(crate) fn describe_edit(path: &str, old: Option<&FileContent>, new: Option<&FileContent>) -> Change {
    let content = match (old, new) {
        (_, None) => ChangeContent::Remove,
        (Some(FileContent::Json(old)), Some(FileContent::Json(new))) => {
            let patch = generate_patch(old, new);
            match patch.apply(old) {
                Ok(ref result) if result == new => ChangeContent::ApplyJsonPatch(patch),
                _ => ChangeContent::UpsertJson(new.clone()),
            }
        }
        (_, Some(FileContent::Json(new))) => ChangeContent::UpsertJson(new.clone()),
        (_, Some(FileContent::Text(text))) => ChangeContent::UpsertText(text.clone()),
    };
    Change {
        path: path.to_string(),
        content,
    }
}
