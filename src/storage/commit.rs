//! Commit metadata, creation and history traversal.
//!
//! Every repository history is a single linear chain. Each commit carries its
//! revision number in its metadata; the number is not derivable from the
//! commit id, so it is checked against the parent on every write and on
//! every walk of the chain.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::storage::backend::Backend;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::revision::Revision;
use crate::storage::types::{Author, CommitId, Markup, TreeId};

/// one unit of history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub revision: Revision,
    pub author: Author,
    /// milliseconds since the epoch
    pub when: i64,
    pub summary: String,
    #[serde(default)]
    pub detail: String,
    #[serde(default)]
    pub markup: Markup,
}

impl Commit {
    pub fn new(
        revision: Revision,
        author: Author,
        when: i64,
        summary: impl Into<String>,
        detail: impl Into<String>,
        markup: Markup,
    ) -> Self {
        Self {
            revision,
            author,
            when,
            summary: summary.into(),
            detail: detail.into(),
            markup,
        }
    }

    /// the commit timestamp as a UTC date
    pub fn when_utc(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.when)
            .single()
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// encode as the message stored with the commit object
    pub(crate) fn to_message(&self) -> StorageResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub(crate) fn from_message(id: CommitId, message: &str) -> StorageResult<Self> {
        serde_json::from_str(message)
            .map_err(|e| StorageError::corrupted(format!("commit {}", id), e.to_string()))
    }
}

/// a commit as read back from a backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitRecord {
    pub id: CommitId,
    pub parent: Option<CommitId>,
    pub tree: TreeId,
    pub commit: Commit,
}

/// builder for creating commits with a fluent interface
///
/// ```ignore
/// let id = CommitBuilder::new(Revision::new(3))
///     .parent(&head)
///     .tree(tree_id)
///     .summary("Edit /a.json")
///     .write(&backend)?;
/// ```
#[derive(Debug, Clone)]
pub struct CommitBuilder {
    revision: Revision,
    parent: Option<(CommitId, Revision)>,
    tree: Option<TreeId>,
    author: Author,
    when: i64,
    summary: String,
    detail: String,
    markup: Markup,
}

impl CommitBuilder {
    pub fn new(revision: Revision) -> Self {
        Self {
            revision,
            parent: None,
            tree: None,
            author: Author::system(),
            when: Utc::now().timestamp_millis(),
            summary: String::new(),
            detail: String::new(),
            markup: Markup::PlainText,
        }
    }

    /// start from an existing commit's metadata, keeping its revision
    pub fn from_commit(commit: &Commit) -> Self {
        Self {
            revision: commit.revision,
            parent: None,
            tree: None,
            author: commit.author.clone(),
            when: commit.when,
            summary: commit.summary.clone(),
            detail: commit.detail.clone(),
            markup: commit.markup,
        }
    }

    pub fn parent(mut self, parent: &CommitRecord) -> Self {
        self.parent = Some((parent.id, parent.commit.revision));
        self
    }

    pub fn tree(mut self, tree: TreeId) -> Self {
        self.tree = Some(tree);
        self
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

    /// write the commit object and return its id
    ///
    /// A commit without a parent starts a chain and may carry any concrete
    /// revision; the compacted head of a history keeps its original number.
    pub fn write(self, backend: &Backend) -> StorageResult<CommitId> {
        let tree = self
            .tree
            .ok_or_else(|| StorageError::Internal("commit requires a tree".to_string()))?;

        if self.revision.is_relative() || self.revision.major() < 1 {
            return Err(StorageError::Internal(format!(
                "cannot write a commit at revision {}",
                self.revision
            )));
        }
        if let Some((_, parent_revision)) = self.parent {
            let expected = parent_revision.forward(1);
            if self.revision != expected {
                return Err(StorageError::IndexOutOfOrder {
                    expected,
                    actual: self.revision,
                });
            }
        }

        let commit = Commit {
            revision: self.revision,
            author: self.author,
            when: self.when,
            summary: self.summary,
            detail: self.detail,
            markup: self.markup,
        };
        backend.write_commit(self.parent.map(|(id, _)| id), tree, &commit)
    }
}

/// create the initial empty commit of a new repository
pub fn create_initial_commit(backend: &Backend, author: Author, when: i64) -> StorageResult<CommitId> {
    let tree = backend.write_tree(&[])?;
    CommitBuilder::new(Revision::INIT)
        .tree(tree)
        .author(author)
        .when(when)
        .summary("Create a new repository")
        .write(backend)
}

/// iterate over the chain from a commit back to its root
///
/// Fails if two adjacent commits are not numbered consecutively.
pub struct HistoryIterator<'a> {
    backend: &'a Backend,
    next: Option<CommitId>,
    expected: Option<Revision>,
}

impl<'a> HistoryIterator<'a> {
    pub fn new(backend: &'a Backend, start: CommitId) -> Self {
        Self {
            backend,
            next: Some(start),
            expected: None,
        }
    }
}

impl Iterator for HistoryIterator<'_> {
    type Item = StorageResult<CommitRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.next.take()?;
        let record = match self.backend.read_commit(id) {
            Ok(record) => record,
            Err(e) => return Some(Err(e)),
        };

        if let Some(expected) = self.expected {
            if record.commit.revision != expected {
                return Some(Err(StorageError::corrupted(
                    format!("commit {}", id),
                    format!(
                        "expected revision {}, found {}",
                        expected, record.commit.revision
                    ),
                )));
            }
        }

        self.expected = Some(record.commit.revision.backward(1));
        self.next = record.parent;
        Some(Ok(record))
    }
}

/// get history starting from a commit, newest first
pub fn history(backend: &Backend, start: CommitId) -> HistoryIterator<'_> {
    HistoryIterator::new(backend, start)
}
