//! Content-addressed blob storage.
//!
//! Every file version is stored once under the SHA-256 of its bytes, in a
//! two-level shard (`data/<hash[0:2]>/<hash[2:]>`) so no directory grows
//! past 256 children. The store has no idea which commits use a blob;
//! liveness is decided by the caller and handed in as a [`LiveSet`].

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::storage::backend::Backend;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::snapshot::Snapshot;
use crate::storage::types::ContentHash;

const DATA_PREFIX: &str = "data/";

/// The set of blob hashes reachable from history.
///
/// Only built by walking commits (see `db::Store::live_hashes`), so garbage
/// collection can't be fed a hand-made list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LiveSet {
    hashes: BTreeSet<ContentHash>,
}

impl LiveSet {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// mark every hash referenced by a snapshot as live
    pub(crate) fn insert_snapshot(&mut self, snapshot: &Snapshot) {
        self.hashes.extend(snapshot.hashes().cloned());
    }

    pub fn contains(&self, hash: &ContentHash) -> bool {
        self.hashes.contains(hash)
    }

    pub fn len(&self) -> usize {
        self.hashes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ContentHash> {
        self.hashes.iter()
    }
}

/// Sharded content-addressed blob store.
#[derive(Clone)]
pub struct ContentStore {
    backend: Arc<dyn Backend>,
}

impl ContentStore {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self { backend }
    }

    /// storage key for a blob
    pub fn blob_key(hash: &ContentHash) -> String {
        let (dir, rest) = hash.shard();
        format!("{}{}/{}", DATA_PREFIX, dir, rest)
    }

    /// store bytes, returning their hash
    ///
    /// identical content is written only once
    pub fn put(&self, bytes: &[u8]) -> StorageResult<ContentHash> {
        let hash = ContentHash::of(bytes);
        let key = Self::blob_key(&hash);

        if self.backend.exists(&key)? {
            debug!(hash = hash.short(), "blob already stored");
            return Ok(hash);
        }

        self.backend.write(&key, bytes)?;
        debug!(hash = hash.short(), size = bytes.len(), "stored blob");
        Ok(hash)
    }

    /// read a blob's content, verifying it still hashes to its name
    pub fn get(&self, hash: &ContentHash) -> StorageResult<Vec<u8>> {
        let key = Self::blob_key(hash);
        let bytes = self.backend.read(&key).map_err(|e| match e {
            StorageError::KeyNotFound(_) => StorageError::BlobNotFound(hash.clone()),
            other => other,
        })?;

        let actual = ContentHash::of(&bytes);
        if &actual != hash {
            return Err(StorageError::corrupted(
                key,
                format!("content hashes to {}", actual),
            ));
        }
        Ok(bytes)
    }

    pub fn exists(&self, hash: &ContentHash) -> StorageResult<bool> {
        self.backend.exists(&Self::blob_key(hash))
    }

    /// size of a stored blob in bytes
    pub fn size(&self, hash: &ContentHash) -> StorageResult<u64> {
        self.backend
            .size(&Self::blob_key(hash))
            .map_err(|e| match e {
                StorageError::KeyNotFound(_) => StorageError::BlobNotFound(hash.clone()),
                other => other,
            })
    }

    /// every blob hash currently stored
    pub fn list_hashes(&self) -> StorageResult<Vec<ContentHash>> {
        let mut hashes = Vec::new();
        for key in self.backend.list(DATA_PREFIX)? {
            let digest: String = key[DATA_PREFIX.len()..].split('/').collect();
            match ContentHash::from_hex(&digest) {
                Ok(hash) => hashes.push(hash),
                Err(_) => warn!(key = %key, "ignoring stray object in blob storage"),
            }
        }
        Ok(hashes)
    }

    /// delete every stored blob not in `live`
    ///
    /// returns the number of blobs removed
    pub fn collect_garbage(&self, live: &LiveSet) -> StorageResult<usize> {
        let mut removed = 0;
        for hash in self.list_hashes()? {
            if live.contains(&hash) {
                continue;
            }
            if self.backend.delete(&Self::blob_key(&hash))? {
                debug!(hash = hash.short(), "collected blob");
                removed += 1;
            }
        }
        info!(removed, live = live.len(), "garbage collection finished");
        Ok(removed)
    }
}
