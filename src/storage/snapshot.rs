//! snapshot operations.
//!
//! a snapshot is the full state of a dataset at one commit: a flat map from
//! file name to content hash. several names may point at the same hash, and
//! because the mapping is explicit we never have to guess file names back
//! from blob storage.

use std::collections::btree_map::{self, BTreeMap};

use serde::{Deserialize, Serialize};

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::types::{Change, ChangeStatus, ContentHash, FileName};

/// An immutable filename → content-hash mapping.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Snapshot {
    files: BTreeMap<FileName, ContentHash>,
}

impl Snapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &FileName) -> Option<&ContentHash> {
        self.files.get(name)
    }

    pub fn contains(&self, name: &FileName) -> bool {
        self.files.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn iter(&self) -> btree_map::Iter<'_, FileName, ContentHash> {
        self.files.iter()
    }

    /// file names in sorted order
    pub fn names(&self) -> impl Iterator<Item = &FileName> {
        self.files.keys()
    }

    /// every referenced hash (with repeats for shared content)
    pub fn hashes(&self) -> impl Iterator<Item = &ContentHash> {
        self.files.values()
    }

    pub(crate) fn insert(&mut self, name: FileName, hash: ContentHash) -> Option<ContentHash> {
        self.files.insert(name, hash)
    }

    pub(crate) fn remove(&mut self, name: &FileName) -> Option<ContentHash> {
        self.files.remove(name)
    }

    /// changes that turn `self` into `newer`, sorted by file name
    pub fn diff(&self, newer: &Snapshot) -> Vec<Change> {
        let mut changes = Vec::new();

        for (name, old) in &self.files {
            match newer.files.get(name) {
                None => changes.push(Change {
                    file: name.clone(),
                    status: ChangeStatus::Deleted(old.clone()),
                }),
                Some(new) if new != old => changes.push(Change {
                    file: name.clone(),
                    status: ChangeStatus::Modified {
                        old: old.clone(),
                        new: new.clone(),
                    },
                }),
                Some(_) => {}
            }
        }
        for (name, new) in &newer.files {
            if !self.files.contains_key(name) {
                changes.push(Change {
                    file: name.clone(),
                    status: ChangeStatus::Added(new.clone()),
                });
            }
        }

        changes.sort_by(|a, b| a.file.cmp(&b.file));
        changes
    }

    /// apply a list of changes produced by [`Snapshot::diff`]
    pub(crate) fn apply(&mut self, changes: &[Change]) {
        for change in changes {
            match change.status.new_hash() {
                Some(hash) => {
                    self.files.insert(change.file.clone(), hash.clone());
                }
                None => {
                    self.files.remove(&change.file);
                }
            }
        }
    }
}

impl FromIterator<(FileName, ContentHash)> for Snapshot {
    fn from_iter<I: IntoIterator<Item = (FileName, ContentHash)>>(iter: I) -> Self {
        Self {
            files: iter.into_iter().collect(),
        }
    }
}

impl<'a> IntoIterator for &'a Snapshot {
    type Item = (&'a FileName, &'a ContentHash);
    type IntoIter = btree_map::Iter<'a, FileName, ContentHash>;

    fn into_iter(self) -> Self::IntoIter {
        self.files.iter()
    }
}

/// a mutable snapshot builder for making changes
///
/// this adds up changes and produces a new snapshot when its final;
/// the parent snapshot is not modified
///
/// # Usage Pattern
///
/// ```ignore
/// let mut builder = SnapshotBuilder::from_snapshot(&parent);
/// builder.upsert(name, hash);
/// builder.remove(&other)?;
/// let snapshot = builder.finish();
/// ```
#[derive(Debug, Clone)]
pub struct SnapshotBuilder {
    files: BTreeMap<FileName, ContentHash>,
}

impl SnapshotBuilder {
    pub fn from_snapshot(parent: &Snapshot) -> Self {
        Self {
            files: parent.files.clone(),
        }
    }

    pub fn empty() -> Self {
        Self {
            files: BTreeMap::new(),
        }
    }

    /// insert or replace a file; last write wins
    pub fn upsert(&mut self, name: FileName, hash: ContentHash) -> &mut Self {
        self.files.insert(name, hash);
        self
    }

    /// remove a file, which must exist
    pub fn remove(&mut self, name: &FileName) -> StorageResult<&mut Self> {
        if self.files.remove(name).is_none() {
            return Err(StorageError::FileNotFound(name.to_string()));
        }
        Ok(self)
    }

    pub fn finish(self) -> Snapshot {
        Snapshot { files: self.files }
    }
}
