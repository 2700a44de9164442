//! core type-safe wrappers around object ids and names for the storage layer.

use std::fmt;
use std::fmt::Formatter;

use git2::{ObjectType, Oid};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// This makes sure we don't accidentally pass a blob ID where a commit ID
/// is expected. The inner Oid is only accessible within the crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommitId(pub(crate) Oid);

impl CommitId {
    pub(crate) fn new(oid: Oid) -> Self {
        Self(oid)
    }

    /// raw Oid (for internal use only)
    pub(crate) fn raw(&self) -> Oid {
        self.0
    }

    /// parse CommitId from a hex string
    pub fn from_hex(hex: &str) -> Result<Self, git2::Error> {
        Oid::from_str(hex).map(CommitId)
    }

    /// parse CommitId from its 20 raw bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, git2::Error> {
        Oid::from_bytes(bytes).map(CommitId)
    }

    /// the 20 raw bytes of the id
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    /// short form of the commit ID
    pub fn short(&self) -> String {
        self.0.to_string()[..7].to_string()
    }
}

impl fmt::Display for CommitId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// blob identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlobId(pub(crate) Oid);

impl BlobId {
    pub(crate) fn new(oid: Oid) -> Self {
        Self(oid)
    }

    pub(crate) fn raw(&self) -> Oid {
        self.0
    }
}

impl fmt::Display for BlobId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// tree identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TreeId(pub(crate) Oid);

impl TreeId {
    pub(crate) fn new(oid: Oid) -> Self {
        Self(oid)
    }

    pub(crate) fn raw(&self) -> Oid {
        self.0
    }
}

impl fmt::Display for TreeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The kind of a stored object.
///
/// The tag values match git's object type numbers, which is also what the
/// encrypted backend writes into its metadata records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Commit,
    Tree,
    Blob,
}

impl ObjectKind {
    pub fn tag(self) -> u8 {
        match self {
            ObjectKind::Commit => 1,
            ObjectKind::Tree => 2,
            ObjectKind::Blob => 3,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(ObjectKind::Commit),
            2 => Some(ObjectKind::Tree),
            3 => Some(ObjectKind::Blob),
            _ => None,
        }
    }

    pub(crate) fn to_git2(self) -> ObjectType {
        match self {
            ObjectKind::Commit => ObjectType::Commit,
            ObjectKind::Tree => ObjectType::Tree,
            ObjectKind::Blob => ObjectType::Blob,
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ObjectKind::Commit => write!(f, "commit"),
            ObjectKind::Tree => write!(f, "tree"),
            ObjectKind::Blob => write!(f, "blob"),
        }
    }
}

/// one entry of a stored tree (a directory listing)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TreeEntry {
    Tree { name: String, id: TreeId },
    Blob { name: String, id: BlobId },
}

impl TreeEntry {
    pub fn name(&self) -> &str {
        match self {
            TreeEntry::Tree { name, .. } | TreeEntry::Blob { name, .. } => name,
        }
    }

    pub fn kind(&self) -> ObjectKind {
        match self {
            TreeEntry::Tree { .. } => ObjectKind::Tree,
            TreeEntry::Blob { .. } => ObjectKind::Blob,
        }
    }

    pub(crate) fn raw(&self) -> Oid {
        match self {
            TreeEntry::Tree { id, .. } => id.raw(),
            TreeEntry::Blob { id, .. } => id.raw(),
        }
    }
}

/// suffix of a removed project or repository directory
pub(crate) const REMOVED_SUFFIX: &str = ".removed";

/// suffix of a directory waiting to be purged
pub(crate) const PURGED_SUFFIX: &str = ".purged";

const RESERVED_SUFFIXES: &[&str] = &[REMOVED_SUFFIX, PURGED_SUFFIX];

/// Validate a project or repository name.
///
/// Valid names:
/// - 1-64 characters
/// - alphanumerics, hyphens, underscores and dots
/// - must start and end with an alphanumeric
/// - must not end with a removal/purge suffix
fn validate_name(name: &str) -> Result<(), InvalidNameError> {
    if name.is_empty() {
        return Err(InvalidNameError::Empty);
    }

    if name.len() > 64 {
        return Err(InvalidNameError::TooLong(name.len()));
    }

    let first = name.chars().next().ok_or(InvalidNameError::Empty)?;
    if !first.is_ascii_alphanumeric() {
        return Err(InvalidNameError::InvalidStart(first));
    }

    for (i, c) in name.chars().enumerate() {
        if !c.is_ascii_alphanumeric() && c != '_' && c != '-' && c != '.' {
            return Err(InvalidNameError::InvalidCharacter { char: c, position: i });
        }
    }

    let last = name.chars().last().ok_or(InvalidNameError::Empty)?;
    if !last.is_ascii_alphanumeric() {
        return Err(InvalidNameError::InvalidEnd(last));
    }

    if RESERVED_SUFFIXES.iter().any(|suffix| name.ends_with(suffix)) {
        return Err(InvalidNameError::Reserved(name.to_string()));
    }

    Ok(())
}

/// A validated project name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProjectName(String);

impl ProjectName {
    pub fn new(name: impl Into<String>) -> Result<Self, InvalidNameError> {
        let name = name.into();
        validate_name(&name)?;
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProjectName {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for ProjectName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A validated repository name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RepositoryName(String);

impl RepositoryName {
    /// repository holding project-level metadata documents
    pub const DOGMA: &'static str = "dogma";

    /// repository holding project-level settings
    pub const META: &'static str = "meta";

    /// internal repositories created with every project
    pub const INTERNAL: &'static [&'static str] = &[Self::DOGMA, Self::META];

    pub fn new(name: impl Into<String>) -> Result<Self, InvalidNameError> {
        let name = name.into();
        validate_name(&name)?;
        Ok(Self(name))
    }

    /// check whether pushes to this repository need elevated privileges
    pub fn is_internal(&self) -> bool {
        Self::INTERNAL.contains(&self.0.as_str())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RepositoryName {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for RepositoryName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// commit author
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Author {
    pub name: String,
    pub email: String,
}

impl Author {
    pub fn new(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            email: email.into(),
        }
    }

    /// author used for commits the store makes on its own behalf
    pub fn system() -> Self {
        Self::new("System", "system@localhost")
    }

    /// convert to a git2 signature at the given time (milliseconds since the epoch)
    pub(crate) fn to_git2_signature(&self, when_millis: i64) -> Result<git2::Signature<'static>, git2::Error> {
        let time = git2::Time::new(when_millis.div_euclid(1000), 0);
        git2::Signature::new(&self.name, &self.email, &time)
    }
}

impl Default for Author {
    fn default() -> Self {
        Self::system()
    }
}

/// markup language of a commit's detail text
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Markup {
    #[default]
    PlainText,
    Markdown,
    Unknown,
}

/// error type for invalid names (projects, repositories)
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidNameError {
    #[error("name is empty")]
    Empty,
    #[error("name has {0} characters, at most 64 are allowed")]
    TooLong(usize),
    #[error("name starts with '{0}'")]
    InvalidStart(char),
    #[error("name ends with '{0}'")]
    InvalidEnd(char),
    #[error("'{char}' at position {position} is not allowed in a name")]
    InvalidCharacter { char: char, position: usize },
    #[error("'{0}' ends with a reserved suffix")]
    Reserved(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_valid() {
        assert!(ProjectName::new("foo").is_ok());
        assert!(ProjectName::new("foo-bar_baz").is_ok());
        assert!(RepositoryName::new("app.settings").is_ok());
        assert!(RepositoryName::new("a").is_ok());
    }

    #[test]
    fn test_name_invalid() {
        assert!(ProjectName::new("").is_err());
        assert!(ProjectName::new("_private").is_err());
        assert!(ProjectName::new("foo/bar").is_err());
        assert!(ProjectName::new("foo.").is_err());
        assert!(RepositoryName::new("foo.removed").is_err());
        assert!(RepositoryName::new("foo.purged").is_err());
        assert!(RepositoryName::new("a".repeat(65)).is_err());
    }

    #[test]
    fn test_internal_repositories() {
        assert!(RepositoryName::new("dogma").unwrap().is_internal());
        assert!(RepositoryName::new("meta").unwrap().is_internal());
        assert!(!RepositoryName::new("settings").unwrap().is_internal());
    }

    #[test]
    fn test_object_kind_tags() {
        for kind in [ObjectKind::Commit, ObjectKind::Tree, ObjectKind::Blob] {
            assert_eq!(ObjectKind::from_tag(kind.tag()), Some(kind));
        }
        assert_eq!(ObjectKind::from_tag(9), None);
    }

    #[test]
    fn test_commit_id_bytes() {
        let oid = Oid::hash_object(ObjectType::Blob, b"hello").unwrap();
        let id = CommitId::new(oid);
        assert_eq!(CommitId::from_bytes(id.as_bytes()).unwrap(), id);
        assert_eq!(id.short().len(), 7);
    }
}
