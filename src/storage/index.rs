//! Consolidated per-dataset index.
//!
//! Answering "what is the history of this dataset" from the per-commit
//! records alone means reading one object per commit. The index keeps all
//! of them in one manifest at `datasets/<name>/.kirin-index`, together with
//! branch and tag pointers.
//!
//! The index is only a cache. If it is missing, unreadable or fails
//! validation it is rebuilt from the `commit.json` records and the mirrored
//! refs, and nothing above this module ever sees the corruption.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::storage::backend::Backend;
use crate::storage::commit::{self, Commit, CommitSource};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::snapshot::Snapshot;
use crate::storage::types::{BranchName, CommitId, DatasetName};

/// current on-disk schema version
pub const INDEX_VERSION: u32 = 1;

/// file name of the index inside a dataset directory
pub const INDEX_FILE: &str = ".kirin-index";

/// one commit as cached in the index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub message: String,
    pub parent: Option<CommitId>,
    #[serde(default)]
    pub parents: Vec<CommitId>,
    pub timestamp: DateTime<Utc>,
    pub files: Snapshot,
}

impl IndexEntry {
    fn from_commit(commit: &Commit) -> Self {
        Self {
            message: commit.message.clone(),
            parent: commit.first_parent().cloned(),
            parents: commit.parents.clone(),
            timestamp: commit.timestamp,
            files: commit.snapshot.clone(),
        }
    }

    fn to_commit(&self, id: &CommitId) -> Commit {
        let parents = if self.parents.is_empty() {
            self.parent.iter().cloned().collect()
        } else {
            self.parents.clone()
        };
        Commit {
            id: id.clone(),
            message: self.message.clone(),
            timestamp: self.timestamp,
            parents,
            snapshot: self.files.clone(),
        }
    }
}

/// serialized form of the index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexRecord {
    pub version: u32,
    pub commits: BTreeMap<CommitId, IndexEntry>,
    pub branches: BTreeMap<BranchName, CommitId>,
    #[serde(default)]
    pub tags: BTreeMap<String, CommitId>,
}

impl Default for IndexRecord {
    fn default() -> Self {
        Self {
            version: INDEX_VERSION,
            commits: BTreeMap::new(),
            branches: BTreeMap::new(),
            tags: BTreeMap::new(),
        }
    }
}

impl IndexRecord {
    /// schema checks beyond what serde enforces
    fn validate(&self) -> Result<(), String> {
        if self.version != INDEX_VERSION {
            return Err(format!("unsupported index version {}", self.version));
        }
        for (branch, target) in &self.branches {
            if !self.commits.contains_key(target) {
                return Err(format!("branch {} points at unknown commit {}", branch, target));
            }
        }
        for (tag, target) in &self.tags {
            if !self.commits.contains_key(target) {
                return Err(format!("tag {} points at unknown commit {}", tag, target));
            }
        }
        Ok(())
    }
}

pub(crate) fn refs_prefix(dataset: &DatasetName) -> String {
    format!("datasets/{}/refs/heads/", dataset)
}

pub(crate) fn tags_prefix(dataset: &DatasetName) -> String {
    format!("datasets/{}/refs/tags/", dataset)
}

/// The consolidated index of one dataset.
pub struct ConsolidatedIndex {
    backend: Arc<dyn Backend>,
    dataset: DatasetName,
    record: IndexRecord,
}

impl ConsolidatedIndex {
    /// storage key of a dataset's index
    pub fn index_key(dataset: &DatasetName) -> String {
        format!("datasets/{}/{}", dataset, INDEX_FILE)
    }

    /// Load the index, rebuilding it if it is missing or corrupt.
    pub fn load(backend: Arc<dyn Backend>, dataset: &DatasetName) -> StorageResult<Self> {
        match Self::read_validated(backend.as_ref(), dataset) {
            Ok(record) => Ok(Self {
                backend,
                dataset: dataset.clone(),
                record,
            }),
            Err(StorageError::KeyNotFound(_)) => {
                debug!(dataset = %dataset, "no index yet, building one");
                Self::rebuild(backend, dataset)
            }
            Err(e) if e.is_corrupt() => {
                warn!(dataset = %dataset, error = %e, "index failed validation, rebuilding");
                Self::rebuild(backend, dataset)
            }
            Err(e) => Err(e),
        }
    }

    fn read_validated(backend: &dyn Backend, dataset: &DatasetName) -> StorageResult<IndexRecord> {
        let key = Self::index_key(dataset);
        let bytes = backend.read(&key)?;
        let record: IndexRecord = serde_json::from_slice(&bytes)
            .map_err(|e| StorageError::corrupted(&key, e.to_string()))?;
        record
            .validate()
            .map_err(|reason| StorageError::corrupted(&key, reason))?;
        Ok(record)
    }

    /// Re-derive the index from the authoritative per-commit records.
    ///
    /// Unreadable records are skipped, so a damaged dataset still gets a
    /// partial index that passes validation.
    pub fn rebuild(backend: Arc<dyn Backend>, dataset: &DatasetName) -> StorageResult<Self> {
        let mut record = IndexRecord::default();

        for id in commit::list_commit_ids(backend.as_ref(), dataset)? {
            match commit::read_record(backend.as_ref(), dataset, &id) {
                Ok(commit) => {
                    record.commits.insert(id, IndexEntry::from_commit(&commit));
                }
                Err(e) if e.is_corrupt() || e.is_not_found() => {
                    warn!(dataset = %dataset, commit = %id, error = %e, "skipping unreadable commit record");
                }
                Err(e) => return Err(e),
            }
        }

        for (name, target) in read_ref_dir(backend.as_ref(), &refs_prefix(dataset))? {
            let Ok(branch) = BranchName::new(name) else { continue };
            if record.commits.contains_key(&target) {
                record.branches.insert(branch, target);
            }
        }
        for (name, target) in read_ref_dir(backend.as_ref(), &tags_prefix(dataset))? {
            if record.commits.contains_key(&target) {
                record.tags.insert(name, target);
            }
        }

        let index = Self {
            backend,
            dataset: dataset.clone(),
            record,
        };
        index.persist()?;
        info!(
            dataset = %dataset,
            commits = index.record.commits.len(),
            branches = index.record.branches.len(),
            "rebuilt consolidated index"
        );
        Ok(index)
    }

    fn persist(&self) -> StorageResult<()> {
        let bytes = serde_json::to_vec_pretty(&self.record)?;
        self.backend.write(&Self::index_key(&self.dataset), &bytes)
    }

    /// add a commit; callers write its record first
    pub fn record(&mut self, commit: &Commit) -> StorageResult<()> {
        self.record
            .commits
            .insert(commit.id.clone(), IndexEntry::from_commit(commit));
        self.persist()
    }

    /// point a branch at a known commit
    pub fn set_branch(&mut self, name: &BranchName, id: &CommitId) -> StorageResult<()> {
        if !self.record.commits.contains_key(id) {
            return Err(StorageError::CommitNotFound(id.to_string()));
        }
        self.record.branches.insert(name.clone(), id.clone());
        self.persist()
    }

    pub fn remove_branch(&mut self, name: &BranchName) -> StorageResult<()> {
        if self.record.branches.remove(name).is_some() {
            self.persist()?;
        }
        Ok(())
    }

    /// replace all branch pointers at once, skipping unknown targets
    pub fn sync_branches(&mut self, branches: &BTreeMap<BranchName, CommitId>) -> StorageResult<()> {
        let known: BTreeMap<BranchName, CommitId> = branches
            .iter()
            .filter(|(_, id)| self.record.commits.contains_key(*id))
            .map(|(name, id)| (name.clone(), id.clone()))
            .collect();
        if known != self.record.branches {
            self.record.branches = known;
            self.persist()?;
        }
        Ok(())
    }

    pub fn set_tag(&mut self, name: &str, id: &CommitId) -> StorageResult<()> {
        if !self.record.commits.contains_key(id) {
            return Err(StorageError::CommitNotFound(id.to_string()));
        }
        self.record.tags.insert(name.to_string(), id.clone());
        self.persist()
    }

    pub fn get(&self, id: &CommitId) -> Option<Commit> {
        self.record.commits.get(id).map(|entry| entry.to_commit(id))
    }

    pub fn contains(&self, id: &CommitId) -> bool {
        self.record.commits.contains_key(id)
    }

    pub fn commit_ids(&self) -> impl Iterator<Item = &CommitId> {
        self.record.commits.keys()
    }

    pub fn branches(&self) -> &BTreeMap<BranchName, CommitId> {
        &self.record.branches
    }

    pub fn tags(&self) -> &BTreeMap<String, CommitId> {
        &self.record.tags
    }

    pub fn len(&self) -> usize {
        self.record.commits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.record.commits.is_empty()
    }
}

impl CommitSource for ConsolidatedIndex {
    /// the index answers first; the record is the fallback
    fn load_commit(&self, id: &CommitId) -> StorageResult<Commit> {
        match self.get(id) {
            Some(commit) => Ok(commit),
            None => commit::read_record(self.backend.as_ref(), &self.dataset, id),
        }
    }
}

/// read `<prefix><name>` ref files holding a commit hash
pub(crate) fn read_ref_dir(backend: &dyn Backend, prefix: &str) -> StorageResult<Vec<(String, CommitId)>> {
    let mut refs = Vec::new();
    for key in backend.list(prefix)? {
        let Some(name) = key.strip_prefix(prefix) else { continue };
        let bytes = backend.read(&key)?;
        let text = String::from_utf8_lossy(&bytes);
        match CommitId::from_hex(text.trim()) {
            Ok(id) => refs.push((name.to_string(), id)),
            Err(_) => warn!(key = %key, "ignoring malformed ref"),
        }
    }
    Ok(refs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::backend::MemoryBackend;
    use crate::storage::commit::{write_record, CommitBuilder};
    use crate::storage::types::{ContentHash, FileName};

    fn setup() -> (Arc<MemoryBackend>, DatasetName, Vec<Commit>) {
        let backend = Arc::new(MemoryBackend::new());
        let dataset = DatasetName::new("weather").unwrap();

        let root = CommitBuilder::new().message("root").build().unwrap();
        let second = CommitBuilder::new()
            .snapshot(
                [(FileName::new("t.csv").unwrap(), ContentHash::of(b"t"))]
                    .into_iter()
                    .collect(),
            )
            .parent(root.id.clone())
            .message("add t")
            .build()
            .unwrap();
        for c in [&root, &second] {
            write_record(backend.as_ref(), &dataset, c).unwrap();
        }
        backend
            .write(
                &format!("{}main", refs_prefix(&dataset)),
                second.id.as_str().as_bytes(),
            )
            .unwrap();
        (backend, dataset, vec![root, second])
    }

    #[test]
    fn test_load_builds_missing_index() {
        let (backend, dataset, commits) = setup();
        let index = ConsolidatedIndex::load(backend.clone(), &dataset).unwrap();

        assert_eq!(index.len(), 2);
        assert_eq!(index.branches().get(&BranchName::main()), Some(&commits[1].id));
        assert!(backend.exists(&ConsolidatedIndex::index_key(&dataset)).unwrap());
    }

    #[test]
    fn test_entries_match_records() {
        let (backend, dataset, commits) = setup();
        let index = ConsolidatedIndex::load(backend.clone(), &dataset).unwrap();
        for c in &commits {
            let from_record = commit::read_record(backend.as_ref(), &dataset, &c.id).unwrap();
            assert_eq!(index.get(&c.id).unwrap(), from_record);
        }
    }

    #[test]
    fn test_corrupt_index_self_heals() {
        let (backend, dataset, _) = setup();
        let key = ConsolidatedIndex::index_key(&dataset);

        backend.write(&key, b"{ not json").unwrap();
        let index = ConsolidatedIndex::load(backend.clone(), &dataset).unwrap();
        assert_eq!(index.len(), 2);

        // schema-valid JSON with a dangling branch is still corrupt
        let mut record = index.record.clone();
        record
            .branches
            .insert(BranchName::new("ghost").unwrap(), CommitId::from_hex(&"f".repeat(64)).unwrap());
        backend.write(&key, &serde_json::to_vec(&record).unwrap()).unwrap();
        let index = ConsolidatedIndex::load(backend, &dataset).unwrap();
        assert!(!index.branches().contains_key(&BranchName::new("ghost").unwrap()));
    }

    #[test]
    fn test_rebuild_is_idempotent() {
        let (backend, dataset, _) = setup();
        let key = ConsolidatedIndex::index_key(&dataset);

        ConsolidatedIndex::rebuild(backend.clone(), &dataset).unwrap();
        let first = backend.read(&key).unwrap();
        ConsolidatedIndex::rebuild(backend.clone(), &dataset).unwrap();
        let second = backend.read(&key).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_partial_rebuild() {
        let (backend, dataset, commits) = setup();
        // lose the root record
        backend.delete(&commit::record_key(&dataset, &commits[0].id)).unwrap();

        let index = ConsolidatedIndex::rebuild(backend, &dataset).unwrap();
        assert_eq!(index.len(), 1);
        // parent link is kept as recorded
        assert_eq!(index.get(&commits[1].id).unwrap().parents, vec![commits[0].id.clone()]);
    }

    #[test]
    fn test_set_branch_requires_known_commit() {
        let (backend, dataset, commits) = setup();
        let mut index = ConsolidatedIndex::load(backend, &dataset).unwrap();
        let feature = BranchName::new("feature").unwrap();

        index.set_branch(&feature, &commits[0].id).unwrap();
        assert_eq!(index.branches().get(&feature), Some(&commits[0].id));

        let unknown = CommitId::from_hex(&"e".repeat(64)).unwrap();
        assert!(index.set_branch(&feature, &unknown).is_err());
        assert!(index.set_tag("v1", &unknown).is_err());

        index.set_tag("v1", &commits[1].id).unwrap();
        assert_eq!(index.tags().get("v1"), Some(&commits[1].id));
    }
}
