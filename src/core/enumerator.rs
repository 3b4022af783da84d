//! Recursive file enumeration for a job's source tree.

use filetime::FileTime;
use std::fs::{self, ReadDir};
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::error::{BackupError, Result, join_error};

/// A directory tree whose files can be listed any number of times.
#[derive(Debug, Clone)]
pub struct FileTree {
    root: PathBuf,
}

impl FileTree {
    /// Fails with `DirectoryNotFound` if `root` is not an existing directory.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        if !root.is_dir() {
            return Err(BackupError::DirectoryNotFound { path: root });
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Start a fresh lazy walk from the root.
    pub fn files(&self) -> Files {
        match fs::read_dir(&self.root) {
            Ok(entries) => Files {
                stack: vec![(self.root.clone(), entries)],
                pending: None,
            },
            Err(e) => Files {
                stack: Vec::new(),
                pending: Some(unreadable(&self.root, e)),
            },
        }
    }
}

impl<'a> IntoIterator for &'a FileTree {
    type Item = Result<PathBuf>;
    type IntoIter = Files;

    fn into_iter(self) -> Files {
        self.files()
    }
}

/// Lazy depth-first walk yielding every regular file below the root.
///
/// Symlinks are followed; cycles are not detected. An entry that cannot be
/// read is yielded as a `Transfer` error naming its path, and the walk goes on.
pub struct Files {
    stack: Vec<(PathBuf, ReadDir)>,
    pending: Option<BackupError>,
}

impl Iterator for Files {
    type Item = Result<PathBuf>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(e) = self.pending.take() {
            return Some(Err(e));
        }

        loop {
            let (dir, entries) = self.stack.last_mut()?;
            let entry = match entries.next() {
                Some(Ok(entry)) => entry,
                Some(Err(e)) => return Some(Err(unreadable(dir, e))),
                None => {
                    self.stack.pop();
                    continue;
                }
            };

            let path = entry.path();
            let metadata = match fs::metadata(&path) {
                Ok(m) => m,
                Err(e) => return Some(Err(unreadable(&path, e))),
            };

            if metadata.is_dir() {
                match fs::read_dir(&path) {
                    Ok(children) => self.stack.push((path, children)),
                    Err(e) => return Some(Err(unreadable(&path, e))),
                }
            } else if metadata.is_file() {
                return Some(Ok(path));
            }
        }
    }
}

/// A file captured by `scan`, with the metadata the engine needs later.
#[derive(Debug, Clone)]
pub struct SourceFile {
    pub path: PathBuf,
    pub size: u64,
    pub modified: FileTime,
}

fn unreadable(path: &Path, e: std::io::Error) -> BackupError {
    BackupError::transfer(path, format!("cannot read: {}", e))
}

/// Snapshot of a source tree taken before a run starts.
#[derive(Debug, Default)]
pub struct Scan {
    pub files: Vec<SourceFile>,
    pub total_bytes: u64,
    /// Entries that could not be listed. Their files are missing from `files`.
    pub errors: Vec<BackupError>,
}

/// Enumerate `root` and record sizes up front so progress denominators stay fixed.
pub async fn scan(root: &Path) -> Result<Scan> {
    let tree = FileTree::open(root)?;

    tokio::task::spawn_blocking(move || {
        let mut scan = Scan::default();

        for item in &tree {
            let path = match item {
                Ok(path) => path,
                Err(e) => {
                    warn!(root = %tree.root().display(), error = %e, "Skipping unreadable entry");
                    scan.errors.push(e);
                    continue;
                }
            };

            match fs::metadata(&path) {
                Ok(metadata) => {
                    scan.total_bytes += metadata.len();
                    scan.files.push(SourceFile {
                        path,
                        size: metadata.len(),
                        modified: FileTime::from_last_modification_time(&metadata),
                    });
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping file without metadata");
                    scan.errors.push(unreadable(&path, e));
                }
            }
        }

        scan
    })
    .await
    .map_err(join_error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use tempfile::tempdir;

    fn collect(tree: &FileTree) -> BTreeSet<PathBuf> {
        tree.files().map(|p| p.unwrap()).collect()
    }

    #[test]
    fn test_open_missing_root() {
        let temp = tempdir().unwrap();
        let err = FileTree::open(temp.path().join("nope")).unwrap_err();
        assert!(matches!(err, BackupError::DirectoryNotFound { .. }));
    }

    #[test]
    fn test_walk_is_recursive_and_restartable() {
        let temp = tempdir().unwrap();
        fs::write(temp.path().join("a.txt"), b"a").unwrap();
        fs::create_dir_all(temp.path().join("x/y")).unwrap();
        fs::write(temp.path().join("x/b.txt"), b"bb").unwrap();
        fs::write(temp.path().join("x/y/c.txt"), b"ccc").unwrap();

        let tree = FileTree::open(temp.path()).unwrap();
        let first = collect(&tree);
        let second = collect(&tree);

        assert_eq!(first.len(), 3);
        assert_eq!(first, second);
        assert!(first.contains(&temp.path().join("x/y/c.txt")));
    }

    #[test]
    fn test_empty_directories_yield_nothing() {
        let temp = tempdir().unwrap();
        fs::create_dir_all(temp.path().join("empty/nested")).unwrap();

        let tree = FileTree::open(temp.path()).unwrap();
        assert!(collect(&tree).is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_scan_reports_dangling_symlink() {
        let temp = tempdir().unwrap();
        fs::write(temp.path().join("ok.txt"), b"ok").unwrap();
        std::os::unix::fs::symlink(temp.path().join("gone"), temp.path().join("link")).unwrap();

        let scan = scan(temp.path()).await.unwrap();
        assert_eq!(scan.files.len(), 1);
        assert_eq!(scan.errors.len(), 1);
        assert!(scan.errors[0].to_string().contains("link"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_scan_reports_unreadable_directory() {
        use std::os::unix::fs::PermissionsExt;

        let temp = tempdir().unwrap();
        fs::write(temp.path().join("a.txt"), b"a").unwrap();
        let locked = temp.path().join("locked");
        fs::create_dir(&locked).unwrap();
        fs::write(locked.join("b.txt"), b"b").unwrap();
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o000)).unwrap();

        // Root ignores directory permissions.
        let enforced = fs::read_dir(&locked).is_err();
        let scan = scan(temp.path()).await.unwrap();
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();

        if enforced {
            assert_eq!(scan.files.len(), 1);
            assert_eq!(scan.errors.len(), 1);
            assert!(matches!(scan.errors[0], BackupError::Transfer { ref path, .. } if *path == locked));
        }
    }

    #[tokio::test]
    async fn test_scan_totals() {
        let temp = tempdir().unwrap();
        fs::write(temp.path().join("file1.txt"), b"hello").unwrap();
        fs::create_dir(temp.path().join("subdir")).unwrap();
        fs::write(temp.path().join("subdir/nested.txt"), b"nested").unwrap();

        let scan = scan(temp.path()).await.unwrap();
        assert_eq!(scan.files.len(), 2);
        assert_eq!(scan.total_bytes, 5 + 6);
        assert!(scan.errors.is_empty());
    }
}
