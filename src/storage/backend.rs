//! Key/value byte storage underneath every other storage module.
//!
//! Keys are relative `/`-separated paths such as `data/ab/cdef...` or
//! `datasets/sales/<commit>/commit.json`. A backend is the "remote" side of
//! a dataset: it holds blobs, commit records, the consolidated index and
//! the mirrored refs. Working-copy state never lives here.

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use walkdir::WalkDir;

use crate::storage::error::{StorageError, StorageResult};

/// marker inside temporary file names written by [`FsBackend`]
const TMP_MARKER: &str = ".tmp-";

/// Byte storage addressed by layout keys.
pub trait Backend: Send + Sync {
    /// a stable URL-like description of where the data lives
    fn location(&self) -> String;

    /// read a whole object; missing keys fail with `KeyNotFound`
    fn read(&self, key: &str) -> StorageResult<Vec<u8>>;

    /// write a whole object, replacing any previous value
    ///
    /// readers never observe a partially written object
    fn write(&self, key: &str, bytes: &[u8]) -> StorageResult<()>;

    fn exists(&self, key: &str) -> StorageResult<bool>;

    /// object size in bytes; missing keys fail with `KeyNotFound`
    fn size(&self, key: &str) -> StorageResult<u64>;

    /// delete an object, returning whether it existed
    fn delete(&self, key: &str) -> StorageResult<bool>;

    /// every key starting with `prefix`, sorted
    fn list(&self, prefix: &str) -> StorageResult<Vec<String>>;

    /// delete every key starting with `prefix`
    fn delete_prefix(&self, prefix: &str) -> StorageResult<usize> {
        let mut deleted = 0;
        for key in self.list(prefix)? {
            if self.delete(&key)? {
                deleted += 1;
            }
        }
        Ok(deleted)
    }
}

fn check_key(key: &str) -> StorageResult<()> {
    let bad = key.is_empty()
        || key.starts_with('/')
        || key.split('/').any(|part| part.is_empty() || part == "." || part == "..");
    if bad {
        return Err(StorageError::InvalidArgument(format!("invalid storage key: '{}'", key)));
    }
    Ok(())
}

/// Backend rooted at a local directory.
#[derive(Debug, Clone)]
pub struct FsBackend {
    root: PathBuf,
    location: String,
}

impl FsBackend {
    /// open (creating if needed) a directory as a backend
    pub fn new(root: impl AsRef<Path>) -> StorageResult<Self> {
        let root = root.as_ref();
        fs::create_dir_all(root)?;
        let root = fs::canonicalize(root)?;
        let location = format!("file://{}", root.display());
        Ok(Self { root, location })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> StorageResult<PathBuf> {
        check_key(key)?;
        Ok(self.root.join(key))
    }

    fn not_found(key: &str, err: std::io::Error) -> StorageError {
        if err.kind() == ErrorKind::NotFound {
            StorageError::KeyNotFound(key.to_string())
        } else {
            StorageError::Io(err)
        }
    }
}

impl Backend for FsBackend {
    fn location(&self) -> String {
        self.location.clone()
    }

    fn read(&self, key: &str) -> StorageResult<Vec<u8>> {
        let path = self.path_for(key)?;
        fs::read(&path).map_err(|e| Self::not_found(key, e))
    }

    fn write(&self, key: &str, bytes: &[u8]) -> StorageResult<()> {
        let path = self.path_for(key)?;
        let parent = path
            .parent()
            .ok_or_else(|| StorageError::Internal(format!("key has no parent: {}", key)))?;
        fs::create_dir_all(parent)?;

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let tmp = parent.join(format!(".{}{}{}", file_name, TMP_MARKER, ulid::Ulid::new()));

        let written = fs::write(&tmp, bytes).and_then(|()| fs::rename(&tmp, &path));
        if let Err(e) = written {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok(())
    }

    fn exists(&self, key: &str) -> StorageResult<bool> {
        Ok(self.path_for(key)?.is_file())
    }

    fn size(&self, key: &str) -> StorageResult<u64> {
        let path = self.path_for(key)?;
        let meta = fs::metadata(&path).map_err(|e| Self::not_found(key, e))?;
        Ok(meta.len())
    }

    fn delete(&self, key: &str) -> StorageResult<bool> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        // walk only the directory part of the prefix
        let dir = match prefix.rfind('/') {
            Some(idx) => self.root.join(&prefix[..idx]),
            None => self.root.clone(),
        };
        if !dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut keys = Vec::new();
        for entry in WalkDir::new(&dir) {
            let entry = entry.map_err(|e| match e.into_io_error() {
                Some(io) => StorageError::Io(io),
                None => StorageError::Internal("filesystem loop while listing".to_string()),
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            if entry.file_name().to_string_lossy().contains(TMP_MARKER) {
                continue;
            }
            let Ok(relative) = entry.path().strip_prefix(&self.root) else {
                continue;
            };
            let key = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            if key.starts_with(prefix) {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }
}

/// Backend held entirely in memory.
pub struct MemoryBackend {
    objects: RwLock<BTreeMap<String, Vec<u8>>>,
    location: String,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            objects: RwLock::new(BTreeMap::new()),
            location: format!("memory://{}", ulid::Ulid::new().to_string().to_lowercase()),
        }
    }

    /// number of stored objects
    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for MemoryBackend {
    fn location(&self) -> String {
        self.location.clone()
    }

    fn read(&self, key: &str) -> StorageResult<Vec<u8>> {
        check_key(key)?;
        self.objects
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::KeyNotFound(key.to_string()))
    }

    fn write(&self, key: &str, bytes: &[u8]) -> StorageResult<()> {
        check_key(key)?;
        self.objects.write().insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    fn exists(&self, key: &str) -> StorageResult<bool> {
        check_key(key)?;
        Ok(self.objects.read().contains_key(key))
    }

    fn size(&self, key: &str) -> StorageResult<u64> {
        check_key(key)?;
        self.objects
            .read()
            .get(key)
            .map(|bytes| bytes.len() as u64)
            .ok_or_else(|| StorageError::KeyNotFound(key.to_string()))
    }

    fn delete(&self, key: &str) -> StorageResult<bool> {
        check_key(key)?;
        Ok(self.objects.write().remove(key).is_some())
    }

    fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        let objects = self.objects.read();
        Ok(objects
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect())
    }
}
