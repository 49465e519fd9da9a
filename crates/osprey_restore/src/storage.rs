//! Blob storage collaborator: lists and reads captured log files.
//!
//! Listings come back in lexicographic path order, matching the UTF-8
//! binary order of object-store list APIs that the DDL file naming scheme
//! relies on.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;

use osprey_common::error::RestoreResult;

/// One listed file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Path relative to the log root, `/`-separated.
    pub path: String,
    pub size: u64,
}

/// Read-only view of the captured log.
pub trait LogStorage: Send + Sync {
    /// List files directly under `subdir`, lexicographically by path.
    fn list(&self, subdir: &str) -> RestoreResult<Vec<FileEntry>>;

    /// Read a whole file.
    fn read(&self, path: &str) -> RestoreResult<Vec<u8>>;
}

/// Local-filesystem log directory.
pub struct LocalFsStorage {
    root: PathBuf,
}

impl LocalFsStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        let mut full = self.root.clone();
        for part in path.split('/') {
            full.push(part);
        }
        full
    }
}

impl LogStorage for LocalFsStorage {
    fn list(&self, subdir: &str) -> RestoreResult<Vec<FileEntry>> {
        let dir = self.resolve(subdir);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut entries = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let md = entry.metadata()?;
            if !md.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            let path = if subdir.is_empty() {
                name
            } else {
                format!("{}/{}", subdir, name)
            };
            entries.push(FileEntry {
                path,
                size: md.len(),
            });
        }
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }

    fn read(&self, path: &str) -> RestoreResult<Vec<u8>> {
        Ok(fs::read(self.resolve(path))?)
    }
}

/// Write files under a local root, building test fixtures.
pub fn write_local_file(root: &Path, rel: &str, data: &[u8]) -> std::io::Result<()> {
    let mut full = root.to_path_buf();
    for part in rel.split('/') {
        full.push(part);
    }
    if let Some(parent) = full.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(full, data)
}

/// In-memory log storage; the sorted map gives listings the same order an
/// object store would.
#[derive(Default)]
pub struct MemStorage {
    files: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, path: impl Into<String>, data: impl Into<Vec<u8>>) {
        self.files.write().insert(path.into(), data.into());
    }
}

impl LogStorage for MemStorage {
    fn list(&self, subdir: &str) -> RestoreResult<Vec<FileEntry>> {
        let prefix = if subdir.is_empty() {
            String::new()
        } else {
            format!("{}/", subdir)
        };
        let files = self.files.read();
        Ok(files
            .iter()
            .filter(|(path, _)| {
                path.starts_with(&prefix) && !path[prefix.len()..].contains('/')
            })
            .map(|(path, data)| FileEntry {
                path: path.clone(),
                size: data.len() as u64,
            })
            .collect())
    }

    fn read(&self, path: &str) -> RestoreResult<Vec<u8>> {
        self.files.read().get(path).cloned().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, path.to_string()).into()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mem_storage_list_is_sorted_and_shallow() {
        let storage = MemStorage::new();
        storage.put("ddls/ddl.9", b"b".to_vec());
        storage.put("ddls/ddl.1", b"a".to_vec());
        storage.put("ddls/sub/ddl.0", b"x".to_vec());
        storage.put("log.meta", b"m".to_vec());

        let listed = storage.list("ddls").unwrap();
        let paths: Vec<&str> = listed.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["ddls/ddl.1", "ddls/ddl.9"]);

        let root = storage.list("").unwrap();
        assert_eq!(root.len(), 1);
        assert_eq!(root[0].path, "log.meta");
    }

    #[test]
    fn test_mem_storage_read_missing_is_error() {
        let storage = MemStorage::new();
        assert!(storage.read("nope").is_err());
    }

    #[test]
    fn test_local_fs_storage_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        write_local_file(dir.path(), "t_1/cdclog.50", b"data").unwrap();
        write_local_file(dir.path(), "t_1/cdclog.20", b"older").unwrap();

        let storage = LocalFsStorage::new(dir.path());
        let listed = storage.list("t_1").unwrap();
        let paths: Vec<&str> = listed.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["t_1/cdclog.20", "t_1/cdclog.50"]);
        assert_eq!(storage.read("t_1/cdclog.50").unwrap(), b"data");
        assert!(storage.list("missing_dir").unwrap().is_empty());
    }
}
