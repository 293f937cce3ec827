//!  Commit creation and history traversal
//!
//!  commits are the atomic units of change. In kirin:
//! - each commit is an immutable snapshot plus 0, 1 or 2 parents
//! - a commit names itself: its hash covers content, message, lineage and time
//! - the authoritative copy of every commit is its own `commit.json` record
//!
//! this module handles hashing, commit creation, the on-disk record format
//! and history walking.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

use crate::storage::backend::Backend;
use crate::storage::blob::ContentStore;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::snapshot::{Snapshot, SnapshotBuilder};
use crate::storage::types::{sha256_hex, CommitId, ContentHash, DatasetName, FileName};

/// A commit: one immutable dataset state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commit {
    pub id: CommitId,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub parents: Vec<CommitId>,
    pub snapshot: Snapshot,
}

impl Commit {
    /// check if this is the dataset's root commit
    pub fn is_root(&self) -> bool {
        self.parents.is_empty()
    }

    /// get the first (or only) parent
    pub fn first_parent(&self) -> Option<&CommitId> {
        self.parents.first()
    }
}

/// timestamps are kept at microsecond precision so they survive a trip
/// through JSON and hash the same afterwards
pub fn normalize_timestamp(timestamp: DateTime<Utc>) -> DateTime<Utc> {
    timestamp.trunc_subsecs(6)
}

fn timestamp_text(timestamp: &DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Compute a commit's identity.
///
/// `SHA256(sorted "name:hash" entries + message + ","-joined parents + timestamp)`
///
/// Entries carry the filename next to the content hash, so renaming a file
/// changes the id. A hash over content hashes alone would not.
pub fn compute_commit_hash(
    snapshot: &Snapshot,
    message: &str,
    parents: &[CommitId],
    timestamp: &DateTime<Utc>,
) -> CommitId {
    // BTreeMap iteration is already sorted by name
    let entries: String = snapshot
        .iter()
        .map(|(name, hash)| format!("{}:{}", name, hash))
        .collect::<Vec<_>>()
        .join("");
    let parents = parents
        .iter()
        .map(CommitId::as_str)
        .collect::<Vec<_>>()
        .join(",");

    let material = format!("{}{}{}{}", entries, message, parents, timestamp_text(timestamp));
    CommitId::from_digest(sha256_hex(material.as_bytes()))
}

/// builder for creating commits with a fluent interface
#[derive(Debug, Default)]
pub struct CommitBuilder {
    snapshot: Snapshot,
    parents: Vec<CommitId>,
    message: String,
    timestamp: Option<DateTime<Utc>>,
}

impl CommitBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// set the snapshot for this commit
    pub fn snapshot(mut self, snapshot: Snapshot) -> Self {
        self.snapshot = snapshot;
        self
    }

    /// add a parent commit
    pub fn parent(mut self, parent: CommitId) -> Self {
        self.parents.push(parent);
        self
    }

    /// set multiple parents (for merge commits)
    pub fn parents(mut self, parents: Vec<CommitId>) -> Self {
        self.parents = parents;
        self
    }

    /// set the commit message
    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    /// pin the timestamp (defaults to now)
    pub fn timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// hash and return the commit; nothing is written
    pub fn build(self) -> StorageResult<Commit> {
        if self.parents.len() > 2 {
            return Err(StorageError::InvalidArgument(format!(
                "a commit has at most 2 parents, got {}",
                self.parents.len()
            )));
        }
        let timestamp = normalize_timestamp(self.timestamp.unwrap_or_else(Utc::now));
        let id = compute_commit_hash(&self.snapshot, &self.message, &self.parents, &timestamp);
        Ok(Commit {
            id,
            message: self.message,
            timestamp,
            parents: self.parents,
            snapshot: self.snapshot,
        })
    }
}

/// a file to add in a commit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewFile {
    pub name: FileName,
    pub content: Vec<u8>,
}

impl NewFile {
    pub fn new(name: impl Into<String>, content: impl Into<Vec<u8>>) -> StorageResult<Self> {
        Ok(Self {
            name: FileName::new(name)?,
            content: content.into(),
        })
    }
}

/// Create a commit on top of `parent`.
///
/// All validation happens before any blob is stored. Adds are applied
/// before removes, and a later add of the same name wins.
pub fn create_commit(
    store: &ContentStore,
    parent: &Commit,
    adds: &[NewFile],
    removes: &[FileName],
    message: &str,
) -> StorageResult<Commit> {
    if adds.is_empty() && removes.is_empty() {
        return Err(StorageError::NothingToCommit);
    }
    if message.trim().is_empty() {
        return Err(StorageError::InvalidArgument("commit message is empty".to_string()));
    }
    for (i, name) in removes.iter().enumerate() {
        if removes[..i].contains(name) {
            return Err(StorageError::InvalidArgument(format!("{} removed twice", name)));
        }
        let present = parent.snapshot.contains(name) || adds.iter().any(|add| &add.name == name);
        if !present {
            return Err(StorageError::FileNotFound(name.to_string()));
        }
    }

    let mut builder = SnapshotBuilder::from_snapshot(&parent.snapshot);
    for add in adds {
        let hash = store.put(&add.content)?;
        builder.upsert(add.name.clone(), hash);
    }
    for name in removes {
        builder.remove(name)?;
    }

    CommitBuilder::new()
        .snapshot(builder.finish())
        .parent(parent.id.clone())
        .message(message)
        .build()
}

/// the root commit every dataset starts with
pub fn create_root_commit() -> StorageResult<Commit> {
    CommitBuilder::new().message(CommitMessage::root()).build()
}

/// Authoritative per-commit record, stored at
/// `datasets/<name>/<commit>/commit.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRecord {
    pub version_hash: CommitId,
    pub dataset_name: DatasetName,
    pub commit_message: String,
    pub parent_hash: Option<CommitId>,
    #[serde(default)]
    pub parent_hashes: Vec<CommitId>,
    pub timestamp: DateTime<Utc>,
    pub file_hashes: Vec<ContentHash>,
    pub files: Snapshot,
}

impl CommitRecord {
    pub fn from_commit(dataset: &DatasetName, commit: &Commit) -> Self {
        let mut file_hashes: Vec<ContentHash> = commit.snapshot.hashes().cloned().collect();
        file_hashes.sort();
        file_hashes.dedup();

        Self {
            version_hash: commit.id.clone(),
            dataset_name: dataset.clone(),
            commit_message: commit.message.clone(),
            parent_hash: commit.first_parent().cloned(),
            parent_hashes: commit.parents.clone(),
            timestamp: commit.timestamp,
            file_hashes,
            files: commit.snapshot.clone(),
        }
    }

    /// turn the record back into a commit, checking its hash
    pub fn into_commit(self) -> StorageResult<Commit> {
        let parents = if self.parent_hashes.is_empty() {
            self.parent_hash.into_iter().collect()
        } else {
            self.parent_hashes
        };
        let timestamp = normalize_timestamp(self.timestamp);
        let expected = compute_commit_hash(&self.files, &self.commit_message, &parents, &timestamp);
        if expected != self.version_hash {
            return Err(StorageError::corrupted(
                record_key(&self.dataset_name, &self.version_hash),
                format!("record content hashes to {}", expected.short()),
            ));
        }

        Ok(Commit {
            id: self.version_hash,
            message: self.commit_message,
            timestamp,
            parents,
            snapshot: self.files,
        })
    }
}

/// storage key of a commit's record
pub fn record_key(dataset: &DatasetName, id: &CommitId) -> String {
    format!("datasets/{}/{}/commit.json", dataset, id)
}

/// write the authoritative record for a commit
pub fn write_record(backend: &dyn Backend, dataset: &DatasetName, commit: &Commit) -> StorageResult<()> {
    let record = CommitRecord::from_commit(dataset, commit);
    let bytes = serde_json::to_vec_pretty(&record)?;
    backend.write(&record_key(dataset, &commit.id), &bytes)
}

/// read a commit from its record
pub fn read_record(backend: &dyn Backend, dataset: &DatasetName, id: &CommitId) -> StorageResult<Commit> {
    let key = record_key(dataset, id);
    let bytes = backend.read(&key).map_err(|e| match e {
        StorageError::KeyNotFound(_) => StorageError::CommitNotFound(id.to_string()),
        other => other,
    })?;
    let record: CommitRecord = serde_json::from_slice(&bytes)
        .map_err(|e| StorageError::corrupted(key, e.to_string()))?;
    record.into_commit()
}

/// every commit that has a record in the dataset
pub fn list_commit_ids(backend: &dyn Backend, dataset: &DatasetName) -> StorageResult<Vec<CommitId>> {
    let prefix = format!("datasets/{}/", dataset);
    let ids = backend
        .list(&prefix)?
        .into_iter()
        .filter_map(|key| {
            let rest = key.strip_prefix(&prefix)?;
            let id = rest.strip_suffix("/commit.json")?;
            CommitId::from_hex(id).ok()
        })
        .collect();
    Ok(ids)
}

/// every dataset with at least one commit record
pub fn list_dataset_names(backend: &dyn Backend) -> StorageResult<Vec<DatasetName>> {
    let mut names: Vec<DatasetName> = backend
        .list("datasets/")?
        .into_iter()
        .filter_map(|key| {
            let rest = key.strip_prefix("datasets/")?.strip_suffix("/commit.json")?;
            let (name, id) = rest.split_once('/')?;
            CommitId::from_hex(id).ok()?;
            DatasetName::new(name).ok()
        })
        .collect();
    names.dedup();
    Ok(names)
}

/// Resolve a full or partial commit hash against known commits.
pub fn resolve_prefix<'a>(
    prefix: &str,
    candidates: impl IntoIterator<Item = &'a CommitId>,
) -> StorageResult<CommitId> {
    let prefix = prefix.trim().to_ascii_lowercase();
    if prefix.is_empty() {
        return Err(StorageError::InvalidArgument("empty commit hash prefix".to_string()));
    }

    let matches: Vec<&CommitId> = candidates
        .into_iter()
        .filter(|id| id.as_str().starts_with(&prefix))
        .collect();

    match matches.as_slice() {
        [] => Err(StorageError::CommitNotFound(prefix)),
        [only] => Ok((*only).clone()),
        many => Err(StorageError::AmbiguousHash {
            prefix,
            matches: many.len(),
        }),
    }
}

/// Anything that can load a commit by id.
pub trait CommitSource {
    fn load_commit(&self, id: &CommitId) -> StorageResult<Commit>;
}

/// heap entry ordering newest first
struct Pending(Commit);

impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.0.id == other.0.id
    }
}

impl Eq for Pending {}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Pending {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .timestamp
            .cmp(&other.0.timestamp)
            .then_with(|| self.0.id.cmp(&other.0.id))
    }
}

/// iterate over commit history starting from a commit, newest first
pub struct HistoryIterator<'a, S: CommitSource + ?Sized> {
    source: &'a S,
    queue: BinaryHeap<Pending>,
    seen: HashSet<CommitId>,
    first_parent_only: bool,
    failed: bool,
}

impl<'a, S: CommitSource + ?Sized> HistoryIterator<'a, S> {
    /// create a new history iterator
    pub fn new(source: &'a S, start: &CommitId) -> StorageResult<Self> {
        let start = source.load_commit(start)?;
        let mut seen = HashSet::new();
        seen.insert(start.id.clone());
        let mut queue = BinaryHeap::new();
        queue.push(Pending(start));

        Ok(Self {
            source,
            queue,
            seen,
            first_parent_only: false,
            failed: false,
        })
    }

    /// only follow first parents (linear history through merges)
    pub fn first_parent_only(mut self) -> Self {
        self.first_parent_only = true;
        self
    }
}

impl<'a, S: CommitSource + ?Sized> Iterator for HistoryIterator<'a, S> {
    type Item = StorageResult<Commit>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let Pending(commit) = self.queue.pop()?;

        let parents: &[CommitId] = if self.first_parent_only {
            commit.parents.get(..1).unwrap_or(&[])
        } else {
            &commit.parents
        };
        for parent in parents {
            if !self.seen.insert(parent.clone()) {
                continue;
            }
            match self.source.load_commit(parent) {
                Ok(loaded) => self.queue.push(Pending(loaded)),
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e));
                }
            }
        }

        Some(Ok(commit))
    }
}

/// ids along the first-parent chain of `start`, newest first
pub fn first_parent_chain<S: CommitSource + ?Sized>(
    source: &S,
    start: &CommitId,
) -> StorageResult<Vec<Commit>> {
    HistoryIterator::new(source, start)?
        .first_parent_only()
        .collect()
}

/// message formatting for generated commits
pub struct CommitMessage;

impl CommitMessage {
    /// message of the automatic root commit
    pub fn root() -> String {
        "[kirin] Initialize dataset".to_string()
    }

    /// format a message for a two-parent merge
    pub fn merge(source: &str, target: &str) -> String {
        format!("[MERGE] {} into {}", source, target)
    }

    /// format a message for a rebase that squashes `count` commits
    pub fn rebase(source: &str, target: &str, count: usize) -> String {
        match count {
            1 => format!("[REBASE] {} onto {} (1 commit)", source, target),
            n => format!("[REBASE] {} onto {} ({} commits)", source, target, n),
        }
    }
}
