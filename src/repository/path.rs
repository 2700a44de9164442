//! Entry path validation.

use crate::repository::error::{RepositoryError, RepositoryResult};

const FORBIDDEN: &[char] = &['*', '?', ',', '\\', ':', '"', '<', '>', '|'];

/// check whether a file at `path` holds JSON
pub fn is_json_path(path: &str) -> bool {
    path.to_ascii_lowercase().ends_with(".json")
}

/// Validate an absolute file path such as `/a/b.json`.
pub fn validate_file_path(path: &str) -> RepositoryResult<()> {
    let invalid = |reason: &str| Err(RepositoryError::InvalidPath(format!("{}: {}", path, reason)));

    let Some(rest) = path.strip_prefix('/') else {
        return invalid("must start with '/'");
    };
    if rest.is_empty() || rest.ends_with('/') {
        return invalid("must not end with '/'");
    }
    for segment in rest.split('/') {
        if segment.is_empty() {
            return invalid("empty path segment");
        }
        if segment == "." || segment == ".." {
            return invalid("relative path segment");
        }
    }
    if let Some(c) = path.chars().find(|c| c.is_control() || FORBIDDEN.contains(c)) {
        return invalid(&format!("invalid character {:?}", c));
    }
    Ok(())
}

/// Validate an absolute directory path; `/` is the root.
pub fn validate_dir_path(path: &str) -> RepositoryResult<()> {
    if path == "/" {
        return Ok(());
    }
    validate_file_path(path.strip_suffix('/').unwrap_or(path))
}

pub fn validate_json_path(path: &str) -> RepositoryResult<()> {
    validate_file_path(path)?;
    if !is_json_path(path) {
        return Err(RepositoryError::InvalidPath(format!("{}: not a JSON file", path)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_paths() {
        assert!(validate_file_path("/a.json").is_ok());
        assert!(validate_file_path("/a/b-c_d.e/f.txt").is_ok());
        assert!(validate_dir_path("/").is_ok());
        assert!(validate_dir_path("/a/").is_ok());
    }

    #[test]
    fn invalid_paths() {
        for path in ["", "a.json", "/", "/a/", "//a", "/a/../b", "/./a", "/a*b", "/a,b", "/a\nb"] {
            assert!(validate_file_path(path).is_err(), "{:?}", path);
        }
        assert!(validate_json_path("/a.txt").is_err());
        assert!(validate_json_path("/a.JSON").is_ok());
    }
}
