//!  Branch and reference management.
//!
//!  Refs are pointers to commits. They are split in two places:
//! - the local state of one working copy (HEAD + branch pointers), kept in
//!   a local directory under a key derived from the remote location, so
//!   two working copies of different remotes never share it
//! - a mirrored copy on the remote (`refs/heads/<branch>`, `HEAD`), kept
//!   for compatibility and for seeding fresh working copies
//!
//! The local state is authoritative for the working copy. The remote copy
//! is only read once, to seed an empty local state.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::storage::backend::{Backend, FsBackend};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::index::{read_ref_dir, refs_prefix};
use crate::storage::types::{sha256_hex, BranchName, CommitId, DatasetName};

/// What HEAD points at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "target", rename_all = "snake_case")]
pub enum Head {
    Branch(BranchName),
    Detached(CommitId),
}

/// Serialized local ref state of one working copy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalRefState {
    pub head: Option<Head>,
    pub branches: BTreeMap<BranchName, CommitId>,
    pub remote_url: String,
    pub last_sync: Option<DateTime<Utc>>,
}

/// Manages the refs of one dataset in one working copy.
pub struct RefManager {
    local: FsBackend,
    key: String,
    dataset: DatasetName,
    state: LocalRefState,
}

impl RefManager {
    /// working-copy key for a remote location
    pub fn state_key(remote_url: &str) -> String {
        sha256_hex(remote_url.as_bytes())[..16].to_string()
    }

    /// Open (or start) the local state for `dataset` at `remote_url`.
    pub fn open(state_dir: impl AsRef<Path>, remote_url: &str, dataset: &DatasetName) -> StorageResult<Self> {
        let local = FsBackend::new(state_dir)?;
        let key = format!("{}/{}/refs.json", Self::state_key(remote_url), dataset);

        let state = match local.read(&key) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| StorageError::corrupted(&key, e.to_string()))?,
            Err(StorageError::KeyNotFound(_)) => LocalRefState {
                remote_url: remote_url.to_string(),
                ..Default::default()
            },
            Err(e) => return Err(e),
        };

        Ok(Self {
            local,
            key,
            dataset: dataset.clone(),
            state,
        })
    }

    fn persist(&self) -> StorageResult<()> {
        let bytes = serde_json::to_vec_pretty(&self.state)?;
        self.local.write(&self.key, &bytes)
    }

    /// true until the first branch is recorded
    pub fn is_empty(&self) -> bool {
        self.state.branches.is_empty()
    }

    pub fn state(&self) -> &LocalRefState {
        &self.state
    }

    pub fn head(&self) -> Option<&Head> {
        self.state.head.as_ref()
    }

    /// the checked-out branch, or None when HEAD is detached
    pub fn current_branch(&self) -> Option<&BranchName> {
        match &self.state.head {
            Some(Head::Branch(name)) => Some(name),
            _ => None,
        }
    }

    /// attach HEAD to an existing branch
    pub fn set_current_branch(&mut self, branch: &BranchName) -> StorageResult<()> {
        if !self.branch_exists(branch) {
            return Err(StorageError::RefNotFound(branch.to_string()));
        }
        self.state.head = Some(Head::Branch(branch.clone()));
        self.persist()
    }

    /// point HEAD straight at a commit
    pub fn detach(&mut self, id: &CommitId) -> StorageResult<()> {
        self.state.head = Some(Head::Detached(id.clone()));
        self.persist()
    }

    /// Get the current HEAD commit.
    pub fn head_commit(&self) -> StorageResult<CommitId> {
        match &self.state.head {
            Some(Head::Branch(name)) => self.branch_commit(name),
            Some(Head::Detached(id)) => Ok(id.clone()),
            None => Err(StorageError::RefNotFound("HEAD".to_string())),
        }
    }

    /// Check if a branch exists.
    pub fn branch_exists(&self, branch: &BranchName) -> bool {
        self.state.branches.contains_key(branch)
    }

    /// Resolve a branch name to its current commit ID.
    pub fn branch_commit(&self, branch: &BranchName) -> StorageResult<CommitId> {
        self.state
            .branches
            .get(branch)
            .cloned()
            .ok_or_else(|| StorageError::RefNotFound(branch.to_string()))
    }

    /// Move an existing branch. The commit's record must already be written.
    pub fn set_branch_commit(&mut self, branch: &BranchName, target: &CommitId) -> StorageResult<()> {
        let Some(slot) = self.state.branches.get_mut(branch) else {
            return Err(StorageError::RefNotFound(branch.to_string()));
        };
        *slot = target.clone();
        debug!(branch = %branch, commit = target.short(), "moved branch");
        self.persist()
    }

    /// Initialize the main branch and point HEAD at it.
    ///
    /// This should be called right after writing the root commit.
    pub fn init_main_branch(&mut self, root: &CommitId) -> StorageResult<()> {
        let main = BranchName::main();
        self.state.branches.insert(main.clone(), root.clone());
        self.state.head = Some(Head::Branch(main));
        self.persist()
    }

    /// Create a new branch pointing to the given commit.
    ///
    /// `main` can't be created again once the dataset has its root commit.
    pub fn create_branch(&mut self, branch: &BranchName, target: &CommitId, has_root: bool) -> StorageResult<()> {
        if self.branch_exists(branch) || (branch.is_main() && has_root) {
            return Err(StorageError::BranchAlreadyExists(branch.clone()));
        }
        if let Some(other) = self.state.branches.keys().find(|b| branch.nests_with(b.as_str())) {
            return Err(StorageError::InvalidArgument(format!(
                "branch {} clashes with existing branch {}",
                branch, other
            )));
        }
        self.state.branches.insert(branch.clone(), target.clone());
        self.persist()
    }

    /// Delete a branch.
    pub fn delete_branch(&mut self, branch: &BranchName) -> StorageResult<()> {
        if branch.is_main() {
            return Err(StorageError::InvalidArgument("the main branch cannot be deleted".to_string()));
        }
        if !self.branch_exists(branch) {
            return Err(StorageError::RefNotFound(branch.to_string()));
        }
        if self.current_branch() == Some(branch) {
            return Err(StorageError::InvalidArgument(format!(
                "branch {} is checked out",
                branch
            )));
        }
        self.state.branches.remove(branch);
        self.persist()
    }

    /// List all branches with their tips.
    pub fn list_branches(&self) -> &BTreeMap<BranchName, CommitId> {
        &self.state.branches
    }

    /// Seed an empty local state from the remote's mirrored refs.
    ///
    /// Fires only once: a local state that already has branches is left
    /// alone even if the remote has moved on. Returns whether anything
    /// was pulled.
    pub fn pull_from_remote(&mut self, remote: &dyn Backend) -> StorageResult<bool> {
        if !self.is_empty() {
            return Ok(false);
        }

        let mut branches = BTreeMap::new();
        for (name, target) in read_ref_dir(remote, &refs_prefix(&self.dataset))? {
            if let Ok(branch) = BranchName::new(name) {
                branches.insert(branch, target);
            }
        }
        if branches.is_empty() {
            return Ok(false);
        }

        let head = match remote.read(&head_key(&self.dataset)) {
            Ok(bytes) => parse_head(&String::from_utf8_lossy(&bytes)),
            Err(StorageError::KeyNotFound(_)) => None,
            Err(e) => return Err(e),
        };
        info!(dataset = %self.dataset, branches = branches.len(), "seeded local refs from remote");
        self.seed(branches, head)?;
        Ok(true)
    }

    /// Seed an empty local state from branch pointers found elsewhere,
    /// such as the consolidated index.
    pub fn seed_branches(&mut self, branches: &BTreeMap<BranchName, CommitId>) -> StorageResult<()> {
        if !self.is_empty() {
            return Err(StorageError::InvalidArgument(format!(
                "local refs of {} are already initialized",
                self.dataset
            )));
        }
        self.seed(branches.clone(), None)
    }

    fn seed(&mut self, branches: BTreeMap<BranchName, CommitId>, head: Option<Head>) -> StorageResult<()> {
        let head = match head {
            Some(Head::Branch(name)) if !branches.contains_key(&name) => None,
            other => other,
        };
        let head = head.or_else(|| {
            let main = BranchName::main();
            if branches.contains_key(&main) {
                Some(Head::Branch(main))
            } else {
                branches.keys().next().cloned().map(Head::Branch)
            }
        });

        self.state.branches = branches;
        self.state.head = head;
        self.state.last_sync = Some(Utc::now());
        self.persist()
    }

    /// Forget all local state for this dataset.
    pub fn reset(&mut self) -> StorageResult<()> {
        self.state = LocalRefState {
            remote_url: self.state.remote_url.clone(),
            ..Default::default()
        };
        self.local.delete(&self.key)?;
        Ok(())
    }

    /// Mirror the local refs onto the remote.
    ///
    /// Remote branches that no longer exist locally are removed.
    pub fn push_to_remote(&mut self, remote: &dyn Backend) -> StorageResult<()> {
        let prefix = refs_prefix(&self.dataset);
        for key in remote.list(&prefix)? {
            let stale = key
                .strip_prefix(&prefix)
                .and_then(|name| BranchName::new(name).ok())
                .map_or(true, |branch| !self.branch_exists(&branch));
            if stale {
                remote.delete(&key)?;
            }
        }
        for (branch, target) in &self.state.branches {
            remote.write(&format!("{}{}", prefix, branch), target.as_str().as_bytes())?;
        }
        if let Some(head) = &self.state.head {
            let text = match head {
                Head::Branch(name) => format!("ref: {}", name.as_ref_path()),
                Head::Detached(id) => id.to_string(),
            };
            remote.write(&head_key(&self.dataset), text.as_bytes())?;
        }

        self.state.last_sync = Some(Utc::now());
        self.persist()
    }
}

/// storage key of the mirrored HEAD
pub fn head_key(dataset: &DatasetName) -> String {
    format!("datasets/{}/HEAD", dataset)
}

fn parse_head(text: &str) -> Option<Head> {
    let text = text.trim();
    if let Some(path) = text.strip_prefix("ref: refs/heads/") {
        return BranchName::new(path).ok().map(Head::Branch);
    }
    CommitId::from_hex(text).ok().map(Head::Detached)
}
