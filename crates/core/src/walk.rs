//! Deterministic directory enumeration.

use crate::Error;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// The result of a walk, including whether the batch limit truncated it.
#[derive(Debug)]
pub struct Walk {
    pub files: Vec<PathBuf>,
    pub truncated: bool,
}

/// Recursively enumerates the regular files under `root`.
///
/// Symlinks are followed; a link to a regular file is returned as that
/// file. The returned paths are absolute and sorted by a byte-wise,
/// locale-independent comparison so that leaf ordering is identical
/// across rebuilds of the same tree.
pub fn walk(root: impl AsRef<Path>) -> Result<Vec<PathBuf>, Error> {
    walk_with_limit(root, None).map(|walk| walk.files)
}

/// Like [`walk`], but truncates the sorted list to the first
/// `batch_limit` entries when a limit is given.
pub fn walk_with_limit(
    root: impl AsRef<Path>,
    batch_limit: Option<usize>,
) -> Result<Walk, Error> {
    let root = root.as_ref();
    let root = root.canonicalize().map_err(|source| Error::Io {
        path: root.to_path_buf(),
        source,
    })?;

    let mut files = Vec::new();
    for entry in WalkDir::new(&root).follow_links(true) {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(&root).to_path_buf();
            Error::Io {
                path,
                source: e.into(),
            }
        })?;
        if entry.file_type().is_file() {
            files.push(entry.into_path());
        }
    }

    if files.is_empty() {
        return Err(Error::Empty);
    }

    files.sort_by(|a, b| {
        a.as_os_str()
            .as_encoded_bytes()
            .cmp(b.as_os_str().as_encoded_bytes())
    });

    let truncated = batch_limit.is_some_and(|limit| files.len() > limit);
    if truncated {
        files.truncate(batch_limit.unwrap_or_default());
    }

    Ok(Walk { files, truncated })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn fixture() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("A")).unwrap();
        fs::create_dir(dir.path().join("B")).unwrap();
        fs::write(dir.path().join("A/x.txt"), "ax").unwrap();
        fs::write(dir.path().join("B/y.txt"), "by").unwrap();
        fs::write(dir.path().join("z.txt"), "z").unwrap();
        dir
    }

    #[test]
    fn walk_is_sorted_and_recursive() {
        let dir = fixture();
        let files = walk(dir.path()).unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|p| p.strip_prefix(dir.path().canonicalize().unwrap()).unwrap())
            .map(|p| p.to_str().unwrap().to_string())
            .collect();
        assert_eq!(names, ["A/x.txt", "B/y.txt", "z.txt"]);
    }

    #[test]
    fn directories_are_not_returned() {
        let dir = fixture();
        let files = walk(dir.path()).unwrap();
        assert!(files.iter().all(|p| p.is_file()));
    }

    #[test]
    fn batch_limit_truncates_after_sorting() {
        let dir = fixture();
        let walk = walk_with_limit(dir.path(), Some(2)).unwrap();
        assert_eq!(walk.files.len(), 2);
        assert!(walk.truncated);
        assert!(walk.files[0].ends_with("A/x.txt"));

        let walk = walk_with_limit(dir.path(), Some(10)).unwrap();
        assert_eq!(walk.files.len(), 3);
        assert!(!walk.truncated);
    }

    #[test]
    fn empty_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(walk(dir.path()), Err(Error::Empty)));
    }

    #[test]
    fn inaccessible_root_is_an_io_error() {
        assert!(matches!(
            walk("/nonexistent/treesnap-test"),
            Err(Error::Io { .. })
        ));
    }
}
