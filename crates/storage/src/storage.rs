//! Location abstraction used by partition writers and the commit validator.
//!
//! The core only needs existence checks, idempotent recursive directory creation and
//! whole-file create/overwrite. Row encoding is decided by the caller.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use ctas_common::{CtasError, Result};

/// One entry returned by [`Storage::list_dir`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// Absolute path of the entry.
    pub path: PathBuf,
    /// Final path component.
    pub name: String,
    /// Whether the entry is a directory.
    pub is_dir: bool,
}

/// Storage contract for table output locations.
///
/// Implementations must be safe to call concurrently from many writer tasks. Directory
/// creation must tolerate a sibling creating the same path first.
pub trait Storage: Send + Sync + std::fmt::Debug {
    fn exists(&self, path: &Path) -> Result<bool>;

    fn is_dir(&self, path: &Path) -> Result<bool>;

    /// Create `path` and missing parents. Succeeds if the directory already exists.
    fn create_dir_all(&self, path: &Path) -> Result<()>;

    /// Create or overwrite the file at `path` with `data`.
    fn write_file(&self, path: &Path, data: &[u8]) -> Result<()>;

    fn read_file(&self, path: &Path) -> Result<Vec<u8>>;

    /// Entries directly under `path`, sorted by name. Missing directories list as empty.
    fn list_dir(&self, path: &Path) -> Result<Vec<DirEntry>>;

    /// Remove a file. Missing files are not an error.
    fn remove_file(&self, path: &Path) -> Result<()>;

    /// Remove a directory tree. Missing directories are not an error.
    fn remove_dir_all(&self, path: &Path) -> Result<()>;
}

/// Local filesystem storage.
#[derive(Debug, Clone, Default)]
pub struct LocalStorage;

impl LocalStorage {
    pub fn new() -> Self {
        Self
    }
}

impl Storage for LocalStorage {
    fn exists(&self, path: &Path) -> Result<bool> {
        Ok(path.exists())
    }

    fn is_dir(&self, path: &Path) -> Result<bool> {
        Ok(path.is_dir())
    }

    fn create_dir_all(&self, path: &Path) -> Result<()> {
        match fs::create_dir_all(path) {
            Ok(()) => Ok(()),
            // A concurrent creator may win the race between the existence probe and mkdir.
            Err(e) if e.kind() == ErrorKind::AlreadyExists && path.is_dir() => Ok(()),
            Err(e) => Err(CtasError::WriteFailure(format!(
                "create dir {} failed: {e}",
                path.display()
            ))),
        }
    }

    fn write_file(&self, path: &Path, data: &[u8]) -> Result<()> {
        fs::write(path, data).map_err(|e| {
            CtasError::WriteFailure(format!("write {} failed: {e}", path.display()))
        })
    }

    fn read_file(&self, path: &Path) -> Result<Vec<u8>> {
        Ok(fs::read(path)?)
    }

    fn list_dir(&self, path: &Path) -> Result<Vec<DirEntry>> {
        if !path.is_dir() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for entry in fs::read_dir(path)? {
            let entry = entry?;
            out.push(DirEntry {
                path: entry.path(),
                name: entry.file_name().to_string_lossy().to_string(),
                is_dir: entry.file_type()?.is_dir(),
            });
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    fn remove_file(&self, path: &Path) -> Result<()> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn remove_dir_all(&self, path: &Path) -> Result<()> {
        match fs::remove_dir_all(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    use super::{LocalStorage, Storage};

    fn temp_root() -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        std::env::temp_dir().join(format!("ctas_storage_test_{nanos}"))
    }

    #[test]
    fn create_dir_all_is_idempotent() {
        let root = temp_root();
        let storage = LocalStorage::new();
        let dir = root.join("key=1.0").join("other=a");
        storage.create_dir_all(&dir).expect("first create");
        storage.create_dir_all(&dir).expect("second create");
        assert!(storage.is_dir(&dir).expect("is_dir"));
        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn write_overwrites_and_lists_sorted() {
        let root = temp_root();
        let storage = LocalStorage::new();
        storage.create_dir_all(&root).expect("mkdir");
        storage.write_file(&root.join("b"), b"first").expect("write b");
        storage.write_file(&root.join("a"), b"x").expect("write a");
        storage.write_file(&root.join("b"), b"second").expect("overwrite b");

        assert_eq!(storage.read_file(&root.join("b")).expect("read"), b"second");
        let names = storage
            .list_dir(&root)
            .expect("list")
            .into_iter()
            .map(|e| e.name)
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["a".to_string(), "b".to_string()]);
        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn removing_missing_paths_is_not_an_error() {
        let root = temp_root();
        let storage = LocalStorage::new();
        storage.remove_file(&root.join("nope")).expect("remove file");
        storage.remove_dir_all(&root).expect("remove dir");
        assert!(storage.list_dir(&root).expect("list").is_empty());
    }
}
