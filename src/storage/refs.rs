//! Reference management for the plain backend.
//!
//! Git refs are pointers to commits. A repository only ever has one branch,
//! but refs are still addressed by full name (`refs/heads/master`) so the
//! encrypted backend can mirror them key for key.

use git2::{ErrorCode, Repository};

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::types::CommitId;

/// Manages Git references.
pub struct RefManager;

impl RefManager {
    /// Resolve a ref to the commit it points at, `None` if it doesn't exist.
    pub fn resolve(repo: &Repository, name: &str) -> StorageResult<Option<CommitId>> {
        let reference = match repo.find_reference(name) {
            Ok(reference) => reference,
            Err(e) if e.code() == ErrorCode::NotFound => return Ok(None),
            Err(e) => return Err(StorageError::Git(e)),
        };

        let target = reference
            .target()
            .ok_or_else(|| StorageError::corrupted(name, "symbolic reference"))?;
        Ok(Some(CommitId::new(target)))
    }

    /// Create a ref that must not exist yet.
    pub fn create(repo: &Repository, name: &str, target: CommitId) -> StorageResult<()> {
        match repo.reference(name, target.raw(), false, &format!("create {}", target.short())) {
            Ok(_) => Ok(()),
            Err(e) if e.code() == ErrorCode::Exists => Err(StorageError::ConcurrentModification {
                reference: name.to_string(),
            }),
            Err(e) => Err(StorageError::Git(e)),
        }
    }

    /// Update a ref only if it still points to the expected commit.
    ///
    /// Compare-and-swap is done by libgit2 under the ref lock, so a writer in
    /// another handle cannot slip in between the check and the update.
    pub fn compare_and_swap(repo: &Repository, name: &str, expected: CommitId, target: CommitId) -> StorageResult<()> {
        let message = format!("update {} -> {}", expected.short(), target.short());
        match repo.reference_matching(name, target.raw(), true, expected.raw(), &message) {
            Ok(_) => Ok(()),
            Err(e) if matches!(e.code(), ErrorCode::Modified | ErrorCode::NotFound | ErrorCode::Exists) => {
                Err(StorageError::ConcurrentModification {
                    reference: name.to_string(),
                })
            }
            Err(e) => Err(StorageError::Git(e)),
        }
    }

    /// List all direct refs.
    pub fn list(repo: &Repository) -> StorageResult<Vec<(String, CommitId)>> {
        let mut result = Vec::new();
        for reference in repo.references()? {
            let reference = reference?;
            if let (Some(name), Some(target)) = (reference.name(), reference.target()) {
                result.push((name.to_string(), CommitId::new(target)));
            }
        }
        result.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup_repo_with_commits() -> (TempDir, Repository, CommitId, CommitId) {
        let dir = TempDir::new().unwrap();
        let repo = Repository::init_bare(dir.path()).unwrap();
        let (a, b) = {
            let tree_id = repo.treebuilder(None).unwrap().write().unwrap();
            let tree = repo.find_tree(tree_id).unwrap();
            let sig = git2::Signature::now("test", "test@localhost").unwrap();
            let a = repo.commit(None, &sig, &sig, "a", &tree, &[]).unwrap();
            let parent = repo.find_commit(a).unwrap();
            let b = repo.commit(None, &sig, &sig, "b", &tree, &[&parent]).unwrap();
            (CommitId::new(a), CommitId::new(b))
        };
        (dir, repo, a, b)
    }

    #[test]
    fn test_resolve_missing() {
        let (_dir, repo, _, _) = setup_repo_with_commits();
        assert_eq!(RefManager::resolve(&repo, "refs/heads/master").unwrap(), None);
    }

    #[test]
    fn test_create_once() {
        let (_dir, repo, a, b) = setup_repo_with_commits();
        RefManager::create(&repo, "refs/heads/master", a).unwrap();
        assert_eq!(RefManager::resolve(&repo, "refs/heads/master").unwrap(), Some(a));

        let err = RefManager::create(&repo, "refs/heads/master", b).unwrap_err();
        assert!(err.is_conflict());
    }

    #[test]
    fn test_compare_and_swap() {
        let (_dir, repo, a, b) = setup_repo_with_commits();
        RefManager::create(&repo, "refs/heads/master", a).unwrap();

        RefManager::compare_and_swap(&repo, "refs/heads/master", a, b).unwrap();
        assert_eq!(RefManager::resolve(&repo, "refs/heads/master").unwrap(), Some(b));

        // stale expectation
        let err = RefManager::compare_and_swap(&repo, "refs/heads/master", a, b).unwrap_err();
        assert!(matches!(err, StorageError::ConcurrentModification { .. }));
    }

    #[test]
    fn test_list() {
        let (_dir, repo, a, b) = setup_repo_with_commits();
        RefManager::create(&repo, "refs/heads/master", b).unwrap();
        RefManager::create(&repo, "refs/heads/other", a).unwrap();

        let refs = RefManager::list(&repo).unwrap();
        assert_eq!(
            refs,
            vec![
                ("refs/heads/master".to_string(), b),
                ("refs/heads/other".to_string(), a)
            ]
        );
    }
}
