//! Directory traversal for backup sources.
//!
//! Walks are sorted by file name so the same tree always yields the same
//! file order. Unreadable entries are collected as issues instead of
//! aborting the walk.

use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

use super::filter::PathFilter;
use super::metadata::FileMetadata;

/// Information about a file discovered during walking
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    /// Full path to the file
    pub path: PathBuf,

    /// `/`-separated path relative to the walk root
    pub relative_path: String,

    pub size: u64,

    /// Seconds since the Unix epoch
    pub mtime: i64,

    pub permissions: Option<u32>,

    pub is_symlink: bool,
}

impl FileInfo {
    /// Create FileInfo from a DirEntry.
    /// For symlinks, resolves to the target to get the real file metadata.
    /// Returns None if the symlink target is a directory or cannot be resolved.
    fn from_entry(entry: &DirEntry, relative_path: String) -> std::io::Result<Option<Self>> {
        let path = entry.path().to_path_buf();
        let is_symlink = entry.path_is_symlink();

        let metadata = if is_symlink {
            match std::fs::metadata(&path) {
                Ok(resolved) if resolved.is_file() => resolved,
                // Symlink to a directory or broken symlink
                _ => return Ok(None),
            }
        } else {
            entry.metadata()?
        };

        if !metadata.is_file() {
            return Ok(None);
        }

        let meta = FileMetadata::from_metadata(&metadata);
        Ok(Some(Self {
            path,
            relative_path,
            size: meta.size,
            mtime: meta.modified,
            permissions: meta.permissions,
            is_symlink,
        }))
    }
}

/// An entry that could not be read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalkIssue {
    pub path: PathBuf,
    pub message: String,
}

#[derive(Debug, Default)]
pub struct WalkOutcome {
    /// Regular files in walk order
    pub files: Vec<FileInfo>,
    pub issues: Vec<WalkIssue>,
}

impl WalkOutcome {
    pub fn total_bytes(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }
}

/// Walk `root` and collect every selected regular file.
///
/// `root` may be a single file, in which case its file name becomes the
/// relative path. Excluded directories are pruned without descending.
pub fn walk_source(root: &Path, filter: &PathFilter) -> std::io::Result<WalkOutcome> {
    let root_meta = std::fs::metadata(root)?;
    let mut outcome = WalkOutcome::default();

    let walker = WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            if entry.depth() == 0 || !entry.file_type().is_dir() {
                return true;
            }
            !filter.is_excluded(&relative_of(entry.path(), root))
        });

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                outcome.issues.push(WalkIssue {
                    path: e.path().map(Path::to_path_buf).unwrap_or_else(|| root.to_path_buf()),
                    message: e.to_string(),
                });
                continue;
            }
        };

        if entry.file_type().is_dir() {
            continue;
        }

        let relative = if root_meta.is_file() {
            entry.file_name().to_string_lossy().to_string()
        } else {
            relative_of(entry.path(), root)
        };

        if !filter.selects(&relative) {
            continue;
        }

        match FileInfo::from_entry(&entry, relative) {
            Ok(Some(info)) => outcome.files.push(info),
            Ok(None) => {}
            Err(e) => outcome.issues.push(WalkIssue {
                path: entry.path().to_path_buf(),
                message: e.to_string(),
            }),
        }
    }

    Ok(outcome)
}

fn relative_of(path: &Path, root: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::filter::FilterRules;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_walk_empty_directory() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        let outcome = walk_source(temp_dir.path(), &PathFilter::all())?;
        assert!(outcome.files.is_empty());
        assert!(outcome.issues.is_empty());
        Ok(())
    }

    #[test]
    fn test_walk_is_sorted_and_relative() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        fs::create_dir(temp_dir.path().join("sub"))?;
        fs::write(temp_dir.path().join("b.txt"), b"12345")?;
        fs::write(temp_dir.path().join("a.txt"), b"1")?;
        fs::write(temp_dir.path().join("sub/c.txt"), b"1234567")?;

        let outcome = walk_source(temp_dir.path(), &PathFilter::all())?;
        let names: Vec<_> = outcome.files.iter().map(|f| f.relative_path.as_str()).collect();
        assert_eq!(names, vec!["a.txt", "b.txt", "sub/c.txt"]);
        assert_eq!(outcome.total_bytes(), 13);

        Ok(())
    }

    #[test]
    fn test_excluded_directories_are_pruned() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        fs::create_dir(temp_dir.path().join("node_modules"))?;
        fs::write(temp_dir.path().join("node_modules/x.js"), b"x")?;
        fs::write(temp_dir.path().join("keep.txt"), b"keep")?;
        fs::write(temp_dir.path().join("drop.tmp"), b"drop")?;

        let filter = PathFilter::new(&FilterRules {
            include: vec![],
            exclude: vec!["node_modules".into(), "*.tmp".into()],
        })
        .unwrap();
        let outcome = walk_source(temp_dir.path(), &filter)?;
        assert_eq!(outcome.files.len(), 1);
        assert_eq!(outcome.files[0].relative_path, "keep.txt");

        Ok(())
    }

    #[test]
    fn test_single_file_root() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        let file = temp_dir.path().join("only.txt");
        fs::write(&file, b"data")?;

        let outcome = walk_source(&file, &PathFilter::all())?;
        assert_eq!(outcome.files.len(), 1);
        assert_eq!(outcome.files[0].relative_path, "only.txt");
        Ok(())
    }

    #[test]
    fn test_missing_root_is_an_error() {
        assert!(walk_source(Path::new("/definitely/not/here"), &PathFilter::all()).is_err());
    }
}
