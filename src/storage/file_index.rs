//! Reverse file index: content hash -> datasets and commits using it.
//!
//! One small JSON document per hash under `index/files/<hash[0:2]>/<hash[2:]>.json`.
//! A commit is listed under the hashes it *introduces*: names that are new
//! or changed relative to its first parent (the root commit introduces its
//! whole snapshot). Content carried forward unchanged is not re-listed.
//!
//! Writes are not transactional with commits; the catalog of commit
//! records stays authoritative and the index can be verified or rebuilt
//! from it at any time.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::storage::backend::Backend;
use crate::storage::commit::{self, Commit};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::snapshot::Snapshot;
use crate::storage::types::{CommitId, ContentHash, DatasetName, FileName};

const FILE_INDEX_PREFIX: &str = "index/files/";

/// one commit that introduced a hash
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileReference {
    pub commit_hash: CommitId,
    pub timestamp: DateTime<Utc>,
    pub filenames: Vec<FileName>,
}

/// the stored document for one hash
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileIndexEntry {
    pub hash: ContentHash,
    #[serde(default)]
    pub datasets: BTreeMap<DatasetName, Vec<FileReference>>,
}

impl FileIndexEntry {
    fn new(hash: ContentHash) -> Self {
        Self {
            hash,
            datasets: BTreeMap::new(),
        }
    }
}

/// a single `(hash, dataset, commit)` reference, used when comparing the
/// index to the catalog
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IndexedRef {
    pub hash: ContentHash,
    pub dataset: DatasetName,
    pub commit: CommitId,
}

/// differences between the reverse index and the commit catalog
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerifyReport {
    /// in the catalog but not the index
    pub missing: Vec<IndexedRef>,
    /// in the index but not the catalog
    pub extra: Vec<IndexedRef>,
}

impl VerifyReport {
    pub fn is_consistent(&self) -> bool {
        self.missing.is_empty() && self.extra.is_empty()
    }
}

/// Hashes a commit introduces relative to its first parent's snapshot,
/// with the names carrying each one.
pub fn introduced_hashes(commit: &Commit, parent: &Snapshot) -> BTreeMap<ContentHash, Vec<FileName>> {
    let mut introduced: BTreeMap<ContentHash, Vec<FileName>> = BTreeMap::new();
    for (name, hash) in &commit.snapshot {
        if parent.get(name) != Some(hash) {
            introduced.entry(hash.clone()).or_default().push(name.clone());
        }
    }
    introduced
}

/// The reverse index over one backend.
#[derive(Clone)]
pub struct FileIndex {
    backend: Arc<dyn Backend>,
}

impl FileIndex {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self { backend }
    }

    /// storage key of a hash's entry
    pub fn entry_key(hash: &ContentHash) -> String {
        let (dir, rest) = hash.shard();
        format!("{}{}/{}.json", FILE_INDEX_PREFIX, dir, rest)
    }

    fn hash_from_key(key: &str) -> Option<ContentHash> {
        let rest = key.strip_prefix(FILE_INDEX_PREFIX)?.strip_suffix(".json")?;
        let (dir, tail) = rest.split_once('/')?;
        ContentHash::from_hex(&format!("{}{}", dir, tail)).ok()
    }

    /// read an entry; unreadable entries count as empty
    pub fn entry(&self, hash: &ContentHash) -> StorageResult<Option<FileIndexEntry>> {
        let key = Self::entry_key(hash);
        let bytes = match self.backend.read(&key) {
            Ok(bytes) => bytes,
            Err(StorageError::KeyNotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        match serde_json::from_slice::<FileIndexEntry>(&bytes) {
            Ok(entry) => Ok(Some(entry)),
            Err(e) => {
                warn!(key = %key, error = %e, "ignoring unreadable file index entry");
                Ok(None)
            }
        }
    }

    fn write_entry(&self, entry: &FileIndexEntry) -> StorageResult<()> {
        let key = Self::entry_key(&entry.hash);
        if entry.datasets.is_empty() {
            self.backend.delete(&key)?;
            return Ok(());
        }
        let bytes = serde_json::to_vec_pretty(entry)?;
        self.backend.write(&key, &bytes)
    }

    /// Record that `commit` in `dataset` introduced `hash` under `filenames`.
    ///
    /// Re-adding the same commit replaces its earlier reference.
    pub fn add_reference(
        &self,
        hash: &ContentHash,
        dataset: &DatasetName,
        commit: &CommitId,
        timestamp: DateTime<Utc>,
        filenames: Vec<FileName>,
    ) -> StorageResult<()> {
        let mut entry = self
            .entry(hash)?
            .unwrap_or_else(|| FileIndexEntry::new(hash.clone()));
        let refs = entry.datasets.entry(dataset.clone()).or_default();
        refs.retain(|r| &r.commit_hash != commit);
        refs.push(FileReference {
            commit_hash: commit.clone(),
            timestamp,
            filenames,
        });
        self.write_entry(&entry)
    }

    /// Drop one commit's reference, or every reference from `dataset` when
    /// `commit` is None. Returns whether anything was removed.
    pub fn remove_reference(
        &self,
        hash: &ContentHash,
        dataset: &DatasetName,
        commit: Option<&CommitId>,
    ) -> StorageResult<bool> {
        let Some(mut entry) = self.entry(hash)? else {
            return Ok(false);
        };

        let removed = match commit {
            None => entry.datasets.remove(dataset).is_some(),
            Some(id) => match entry.datasets.get_mut(dataset) {
                Some(refs) => {
                    let before = refs.len();
                    refs.retain(|r| &r.commit_hash != id);
                    let removed = refs.len() != before;
                    if refs.is_empty() {
                        entry.datasets.remove(dataset);
                    }
                    removed
                }
                None => false,
            },
        };

        if removed {
            self.write_entry(&entry)?;
        }
        Ok(removed)
    }

    /// datasets with at least one commit introducing `hash`
    pub fn datasets_with_file(&self, hash: &ContentHash) -> StorageResult<Vec<DatasetName>> {
        Ok(self
            .entry(hash)?
            .map(|entry| entry.datasets.into_keys().collect())
            .unwrap_or_default())
    }

    /// index a freshly written commit
    pub fn record_commit(&self, dataset: &DatasetName, commit: &Commit, parent: &Snapshot) -> StorageResult<()> {
        for (hash, filenames) in introduced_hashes(commit, parent) {
            self.add_reference(&hash, dataset, &commit.id, commit.timestamp, filenames)?;
        }
        Ok(())
    }

    /// Drop every reference a dataset holds.
    pub fn forget_dataset(&self, dataset: &DatasetName) -> StorageResult<usize> {
        let mut removed = 0;
        for (hash, _) in self.indexed_entries()? {
            if self.remove_reference(&hash, dataset, None)? {
                removed += 1;
            }
        }
        debug!(dataset = %dataset, removed, "dropped file index references");
        Ok(removed)
    }

    fn indexed_entries(&self) -> StorageResult<Vec<(ContentHash, FileIndexEntry)>> {
        let mut entries = Vec::new();
        for key in self.backend.list(FILE_INDEX_PREFIX)? {
            let Some(hash) = Self::hash_from_key(&key) else {
                warn!(key = %key, "stray object in file index");
                continue;
            };
            if let Some(entry) = self.entry(&hash)? {
                entries.push((hash, entry));
            }
        }
        Ok(entries)
    }

    /// Every reference the catalog implies, from the commit records.
    fn expected_entries(&self) -> StorageResult<BTreeMap<ContentHash, FileIndexEntry>> {
        let backend = self.backend.as_ref();
        let mut expected: BTreeMap<ContentHash, FileIndexEntry> = BTreeMap::new();

        for dataset in commit::list_dataset_names(backend)? {
            let mut commits = HashMap::new();
            for id in commit::list_commit_ids(backend, &dataset)? {
                match commit::read_record(backend, &dataset, &id) {
                    Ok(commit) => {
                        commits.insert(id, commit);
                    }
                    Err(e) if e.is_corrupt() || e.is_not_found() => {
                        warn!(dataset = %dataset, commit = %id, error = %e, "skipping unreadable commit record");
                    }
                    Err(e) => return Err(e),
                }
            }

            let empty = Snapshot::new();
            for commit in commits.values() {
                let parent = commit
                    .first_parent()
                    .and_then(|p| commits.get(p))
                    .map_or(&empty, |p| &p.snapshot);
                for (hash, filenames) in introduced_hashes(commit, parent) {
                    let entry = expected
                        .entry(hash.clone())
                        .or_insert_with(|| FileIndexEntry::new(hash));
                    entry.datasets.entry(dataset.clone()).or_default().push(FileReference {
                        commit_hash: commit.id.clone(),
                        timestamp: commit.timestamp,
                        filenames,
                    });
                }
            }
        }

        for entry in expected.values_mut() {
            for refs in entry.datasets.values_mut() {
                refs.sort_by(|a, b| {
                    a.timestamp
                        .cmp(&b.timestamp)
                        .then_with(|| a.commit_hash.cmp(&b.commit_hash))
                });
            }
        }
        Ok(expected)
    }

    /// Throw the index away and regenerate it from the commit records.
    /// Returns the number of entries written.
    pub fn rebuild_from_catalog(&self) -> StorageResult<usize> {
        let expected = self.expected_entries()?;
        self.backend.delete_prefix(FILE_INDEX_PREFIX)?;
        for entry in expected.values() {
            self.write_entry(entry)?;
        }
        info!(entries = expected.len(), "rebuilt file index");
        Ok(expected.len())
    }

    /// Compare the index against the commit records.
    pub fn verify_against_catalog(&self) -> StorageResult<VerifyReport> {
        let expected = self.expected_entries()?;
        let actual = self.indexed_entries()?;
        let expected = flatten(expected.values());
        let actual = flatten(actual.iter().map(|(_, entry)| entry));

        let report = VerifyReport {
            missing: expected.difference(&actual).cloned().collect(),
            extra: actual.difference(&expected).cloned().collect(),
        };
        if !report.is_consistent() {
            warn!(
                missing = report.missing.len(),
                extra = report.extra.len(),
                "file index differs from catalog"
            );
        }
        Ok(report)
    }
}

fn flatten<'a>(entries: impl Iterator<Item = &'a FileIndexEntry>) -> BTreeSet<IndexedRef> {
    let mut refs = BTreeSet::new();
    for entry in entries {
        for (dataset, commits) in &entry.datasets {
            for r in commits {
                refs.insert(IndexedRef {
                    hash: entry.hash.clone(),
                    dataset: dataset.clone(),
                    commit: r.commit_hash.clone(),
                });
            }
        }
    }
    refs
}
