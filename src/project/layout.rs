//! Directory naming of live, removed and purged entries.
//!
//! Projects live at `<data_dir>/<project>` and repositories at
//! `<data_dir>/<project>/<repo>`. Removal renames a directory to
//! `<name>.removed`; marking it for purge renames it to
//! `<name>.<ulid>.purged` so the same name can be reused right away.

use std::path::{Path, PathBuf};

use ulid::Ulid;

use crate::storage::{PURGED_SUFFIX, REMOVED_SUFFIX};

/// State of a directory as encoded in its name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EntryState {
    Live,
    Removed,
    Purged,
}

pub(crate) fn live_path(parent: &Path, name: &str) -> PathBuf {
    parent.join(name)
}

pub(crate) fn removed_path(parent: &Path, name: &str) -> PathBuf {
    parent.join(format!("{name}{REMOVED_SUFFIX}"))
}

/// a fresh purge target; never collides with an earlier one
pub(crate) fn purged_path(parent: &Path, name: &str) -> PathBuf {
    parent.join(format!("{name}.{}{PURGED_SUFFIX}", Ulid::new()))
}

/// Split a directory name into the entry name and its state.
pub(crate) fn parse(file_name: &str) -> (&str, EntryState) {
    if let Some(name) = file_name.strip_suffix(REMOVED_SUFFIX) {
        return (name, EntryState::Removed);
    }
    if let Some(rest) = file_name.strip_suffix(PURGED_SUFFIX) {
        let name = match rest.rsplit_once('.') {
            Some((name, id)) if Ulid::from_string(id).is_ok() => name,
            _ => rest,
        };
        return (name, EntryState::Purged);
    }
    (file_name, EntryState::Live)
}

/// Directories under `parent` with their parsed names and states.
///
/// Entries that are not directories or not valid UTF-8 are skipped.
pub(crate) fn scan(parent: &Path) -> std::io::Result<Vec<(String, EntryState, PathBuf)>> {
    let mut found = Vec::new();
    if !parent.exists() {
        return Ok(found);
    }
    for entry in std::fs::read_dir(parent)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let file_name = entry.file_name();
        let Some(file_name) = file_name.to_str() else {
            continue;
        };
        let (name, state) = parse(file_name);
        found.push((name.to_string(), state, entry.path()));
    }
    found.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn names_round_trip_through_paths() {
        let parent = Path::new("/data/proj");
        let removed = removed_path(parent, "settings");
        assert_eq!(removed, Path::new("/data/proj/settings.removed"));
        assert_eq!(parse("settings.removed"), ("settings", EntryState::Removed));

        let purged = purged_path(parent, "settings");
        let file_name = purged.file_name().unwrap().to_str().unwrap();
        assert_eq!(parse(file_name), ("settings", EntryState::Purged));

        assert_eq!(parse("a.b.c"), ("a.b.c", EntryState::Live));
    }

    #[test]
    fn purge_targets_are_unique() {
        let parent = Path::new("/data");
        assert_ne!(purged_path(parent, "p"), purged_path(parent, "p"));
    }

    #[test]
    fn scan_skips_files() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("b")).unwrap();
        std::fs::create_dir(dir.path().join("a.removed")).unwrap();
        std::fs::write(dir.path().join("c"), b"file").unwrap();

        let found = scan(dir.path()).unwrap();
        let names: Vec<_> = found.iter().map(|(n, s, _)| (n.as_str(), *s)).collect();
        assert_eq!(names, vec![("a", EntryState::Removed), ("b", EntryState::Live)]);
    }
}
