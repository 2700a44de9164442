//! Value types flowing in and out of a repository: changes, entries,
//! queries and the results of commits and merges.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::repository::error::{RepositoryError, RepositoryResult};
use crate::repository::json_patch::JsonPatch;
use crate::repository::path::{is_json_path, validate_file_path, validate_json_path};
use crate::storage::{Author, Commit, Markup, Revision};

/// what a change does to its path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "content", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeContent {
    UpsertJson(Value),
    UpsertText(String),
    Remove,
    /// move the file (or directory) to the given path
    Rename(String),
    ApplyJsonPatch(JsonPatch),
}

/// a single file mutation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Change {
    pub path: String,
    #[serde(flatten)]
    pub content: ChangeContent,
}

impl Change {
    pub fn upsert_json(path: impl Into<String>, value: Value) -> RepositoryResult<Self> {
        let path = path.into();
        validate_json_path(&path)?;
        Ok(Self {
            path,
            content: ChangeContent::UpsertJson(value),
        })
    }

    pub fn upsert_text(path: impl Into<String>, text: impl Into<String>) -> RepositoryResult<Self> {
        let path = path.into();
        validate_file_path(&path)?;
        if is_json_path(&path) {
            return Err(RepositoryError::InvalidPath(format!(
                "{}: use a JSON upsert for JSON files",
                path
            )));
        }
        Ok(Self {
            path,
            content: ChangeContent::UpsertText(text.into()),
        })
    }

    pub fn remove(path: impl Into<String>) -> RepositoryResult<Self> {
        let path = path.into();
        validate_file_path(&path)?;
        Ok(Self {
            path,
            content: ChangeContent::Remove,
        })
    }

    pub fn rename(old_path: impl Into<String>, new_path: impl Into<String>) -> RepositoryResult<Self> {
        let (path, new_path) = (old_path.into(), new_path.into());
        validate_file_path(&path)?;
        validate_file_path(&new_path)?;
        if path == new_path {
            return Err(RepositoryError::InvalidPath(format!("{}: renamed onto itself", path)));
        }
        Ok(Self {
            path,
            content: ChangeContent::Rename(new_path),
        })
    }

    pub fn apply_json_patch(path: impl Into<String>, patch: JsonPatch) -> RepositoryResult<Self> {
        let path = path.into();
        validate_json_path(&path)?;
        Ok(Self {
            path,
            content: ChangeContent::ApplyJsonPatch(patch),
        })
    }

    /// validate a change that was built or deserialized without a constructor
    pub fn validate(&self) -> RepositoryResult<()> {
        match &self.content {
            ChangeContent::UpsertJson(_) | ChangeContent::ApplyJsonPatch(_) => validate_json_path(&self.path),
            ChangeContent::UpsertText(_) if is_json_path(&self.path) => Err(RepositoryError::InvalidPath(format!(
                "{}: use a JSON upsert for JSON files",
                self.path
            ))),
            ChangeContent::Rename(new_path) => {
                validate_file_path(&self.path)?;
                validate_file_path(new_path)
            }
            _ => validate_file_path(&self.path),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntryType {
    Json,
    Text,
    Directory,
}

impl EntryType {
    /// the type of a file at `path`
    pub fn guess_from_path(path: &str) -> Self {
        if is_json_path(path) {
            EntryType::Json
        } else {
            EntryType::Text
        }
    }
}

impl fmt::Display for EntryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EntryType::Json => "JSON",
            EntryType::Text => "TEXT",
            EntryType::Directory => "DIRECTORY",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EntryContent {
    Json(Value),
    Text(String),
}

/// a file or directory materialized at a revision
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub revision: Revision,
    pub path: String,
    #[serde(rename = "type")]
    pub entry_type: EntryType,
    /// `None` for directories and when content was not requested
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<EntryContent>,
}

impl Entry {
    pub fn json(revision: Revision, path: impl Into<String>, value: Value) -> Self {
        Self {
            revision,
            path: path.into(),
            entry_type: EntryType::Json,
            content: Some(EntryContent::Json(value)),
        }
    }

    pub fn text(revision: Revision, path: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            revision,
            path: path.into(),
            entry_type: EntryType::Text,
            content: Some(EntryContent::Text(text.into())),
        }
    }

    pub fn directory(revision: Revision, path: impl Into<String>) -> Self {
        Self {
            revision,
            path: path.into(),
            entry_type: EntryType::Directory,
            content: None,
        }
    }

    /// an entry whose content was not fetched
    pub fn without_content(revision: Revision, path: impl Into<String>, entry_type: EntryType) -> Self {
        Self {
            revision,
            path: path.into(),
            entry_type,
            content: None,
        }
    }

    pub fn has_content(&self) -> bool {
        self.content.is_some()
    }

    pub fn as_json(&self) -> Option<&Value> {
        match &self.content {
            Some(EntryContent::Json(value)) => Some(value),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match &self.content {
            Some(EntryContent::Text(text)) => Some(text),
            _ => None,
        }
    }

    /// rough in-memory size, used to weigh cache entries
    pub(crate) fn weight(&self) -> usize {
        let content = match &self.content {
            Some(EntryContent::Json(value)) => value.to_string().len(),
            Some(EntryContent::Text(text)) => text.len(),
            None => 0,
        };
        self.path.len() + content + 32
    }
}

/// how to read a single entry
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Query {
    /// any file or directory
    Identity(String),
    /// a JSON file
    IdentityJson(String),
    /// a text file
    IdentityText(String),
    /// a JSON file narrowed by RFC 6901 pointers, applied in order
    JsonPointer { path: String, pointers: Vec<String> },
}

impl Query {
    pub fn identity(path: impl Into<String>) -> RepositoryResult<Self> {
        let path = path.into();
        validate_file_path(&path)?;
        Ok(Query::Identity(path))
    }

    pub fn identity_json(path: impl Into<String>) -> RepositoryResult<Self> {
        let path = path.into();
        validate_json_path(&path)?;
        Ok(Query::IdentityJson(path))
    }

    pub fn identity_text(path: impl Into<String>) -> RepositoryResult<Self> {
        let path = path.into();
        validate_file_path(&path)?;
        Ok(Query::IdentityText(path))
    }

    pub fn json_pointer(path: impl Into<String>, pointers: Vec<String>) -> RepositoryResult<Self> {
        let path = path.into();
        validate_json_path(&path)?;
        Ok(Query::JsonPointer { path, pointers })
    }

    pub fn path(&self) -> &str {
        match self {
            Query::Identity(path) | Query::IdentityJson(path) | Query::IdentityText(path) => path,
            Query::JsonPointer { path, .. } => path,
        }
    }

    /// evaluate against an entry read at the query's path
    pub(crate) fn apply(&self, entry: Entry) -> RepositoryResult<Entry> {
        match self {
            Query::Identity(_) => Ok(entry),
            Query::IdentityJson(path) if entry.entry_type != EntryType::Json => Err(
                RepositoryError::QueryExecution(format!("{} is not a JSON file", path)),
            ),
            Query::IdentityText(path) if entry.entry_type == EntryType::Directory => Err(
                RepositoryError::QueryExecution(format!("{} is a directory", path)),
            ),
            Query::IdentityJson(_) | Query::IdentityText(_) => Ok(entry),
            Query::JsonPointer { path, pointers } => {
                let Some(value) = entry.as_json() else {
                    return Err(RepositoryError::QueryExecution(format!("{} is not a JSON file", path)));
                };
                let value = select_pointers(value, pointers, path)?;
                Ok(Entry::json(entry.revision, entry.path, value))
            }
        }
    }
}

/// apply RFC 6901 pointers in order
pub(crate) fn select_pointers(value: &Value, pointers: &[String], path: &str) -> RepositoryResult<Value> {
    let mut current = value.clone();
    for pointer in pointers {
        current = current.pointer(pointer).cloned().ok_or_else(|| {
            RepositoryError::QueryExecution(format!("{}: pointer {:?} selects nothing", path, pointer))
        })?;
    }
    Ok(current)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FindOptions {
    pub fetch_content: bool,
    /// `None` for no limit
    pub max_entries: Option<usize>,
}

impl Default for FindOptions {
    fn default() -> Self {
        Self {
            fetch_content: true,
            max_entries: None,
        }
    }
}

impl FindOptions {
    pub fn without_content() -> Self {
        Self {
            fetch_content: false,
            max_entries: None,
        }
    }

    pub fn max_entries(mut self, max: usize) -> Self {
        self.max_entries = Some(max);
        self
    }
}

/// Everything a commit needs besides the repository.
///
/// ```ignore
/// let request = CommitRequest::new(Revision::HEAD, vec![change])
///     .author(author)
///     .summary("Update /a.json");
/// repository.commit(request).await?;
/// ```
#[derive(Debug, Clone)]
pub struct CommitRequest {
    pub base: Revision,
    /// milliseconds since the epoch
    pub when: i64,
    pub author: Author,
    pub summary: String,
    pub detail: String,
    pub markup: Markup,
    pub changes: Vec<Change>,
    /// rebase the changes onto the head when `base` is older
    pub normalizing: bool,
}

impl CommitRequest {
    pub fn new(base: Revision, changes: Vec<Change>) -> Self {
        Self {
            base,
            when: chrono::Utc::now().timestamp_millis(),
            author: Author::system(),
            summary: String::new(),
            detail: String::new(),
            markup: Markup::PlainText,
            changes,
            normalizing: false,
        }
    }

    pub fn author(mut self, author: Author) -> Self {
        self.author = author;
        self
    }

    pub fn when(mut self, when: i64) -> Self {
        self.when = when;
        self
    }

    pub fn summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = summary.into();
        self
    }

    pub fn detail(mut self, detail: impl Into<String>, markup: Markup) -> Self {
        self.detail = detail.into();
        self.markup = markup;
        self
    }

    pub fn normalizing(mut self, normalizing: bool) -> Self {
        self.normalizing = normalizing;
        self
    }
}

/// the outcome of a successful commit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitResult {
    pub revision: Revision,
    /// the changes as actually applied, patches resolved to their effect
    pub changes: Vec<Change>,
}

/// One commit of a history listing together with what it changed.
///
/// `changes` covers every file the commit modified, sorted by path, in the
/// same form `Repository::diff` reports them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    #[serde(flatten)]
    pub commit: Commit,
    pub changes: Vec<Change>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MergeSource {
    pub path: String,
    pub optional: bool,
}

impl MergeSource {
    pub fn required(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            optional: false,
        }
    }

    pub fn optional(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            optional: true,
        }
    }
}

/// JSON files to merge, later sources overriding earlier ones
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MergeQuery {
    pub sources: Vec<MergeSource>,
    #[serde(default)]
    pub pointers: Vec<String>,
}

impl MergeQuery {
    pub fn new(sources: Vec<MergeSource>) -> Self {
        Self {
            sources,
            pointers: Vec::new(),
        }
    }

    pub fn pointer(mut self, pointer: impl Into<String>) -> Self {
        self.pointers.push(pointer.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergedEntry {
    pub revision: Revision,
    pub value: Value,
    /// the sources that were found and merged, in order
    pub paths: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn constructors_check_paths() {
        assert!(Change::upsert_json("/a.json", json!({})).is_ok());
        assert!(Change::upsert_json("/a.txt", json!({})).is_err());
        assert!(Change::upsert_text("/a.json", "x").is_err());
        assert!(Change::upsert_text("/a.txt", "x").is_ok());
        assert!(Change::rename("/a.txt", "/a.txt").is_err());
        assert!(Change::remove("relative").is_err());
    }

    #[test]
    fn change_serialization() {
        let change = Change::upsert_json("/a.json", json!({"a": 1})).unwrap();
        let encoded = serde_json::to_value(&change).unwrap();
        assert_eq!(encoded, json!({"path": "/a.json", "type": "UPSERT_JSON", "content": {"a": 1}}));

        let decoded: Change = serde_json::from_value(json!({"path": "/b.txt", "type": "REMOVE"})).unwrap();
        assert_eq!(decoded.content, ChangeContent::Remove);
    }

    #[test]
    fn json_pointer_query() {
        let entry = Entry::json(Revision::new(2), "/a.json", json!({"a": {"b": [1, 2]}}));
        let query = Query::json_pointer("/a.json", vec!["/a".to_string(), "/b/1".to_string()]).unwrap();
        assert_eq!(query.apply(entry.clone()).unwrap().as_json(), Some(&json!(2)));

        let missing = Query::json_pointer("/a.json", vec!["/nope".to_string()]).unwrap();
        assert!(matches!(missing.apply(entry), Err(RepositoryError::QueryExecution(_))));
    }

    #[test]
    fn identity_queries_check_type() {
        let text = Entry::text(Revision::new(2), "/a.txt", "hi\n");
        assert!(Query::Identity("/a.txt".into()).apply(text.clone()).is_ok());
        assert!(Query::IdentityJson("/a.txt".into()).apply(text.clone()).is_err());
        assert!(Query::IdentityText("/a.txt".into()).apply(text).is_ok());
    }
}
