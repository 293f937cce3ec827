//! Two-way merges between branches.
//!
//! Everything in here is pure: callers hand in the first-parent chains of
//! both branch tips and get back a [`Resolution`] describing the commit to
//! write (if any). Writing the commit and moving the target branch is the
//! dataset's job.
//!
//! Divergence only follows first parents. Merge commits therefore show up
//! as a single step on their branch, and branch history stays linear.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::storage::commit::{Commit, CommitMessage};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::snapshot::Snapshot;
use crate::storage::types::{CommitId, ContentHash, FileName};

/// How a merge picks winners and shapes history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeStrategy {
    /// keep the target's version of conflicting files
    Ours,
    /// keep the source's version of conflicting files
    Theirs,
    /// report conflicts and commit nothing
    Manual,
    /// two-parent merge commit
    Merge,
    /// squash the source's divergent commits into one commit on the target
    #[default]
    Rebase,
}

impl MergeStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            MergeStrategy::Ours => "ours",
            MergeStrategy::Theirs => "theirs",
            MergeStrategy::Manual => "manual",
            MergeStrategy::Merge => "merge",
            MergeStrategy::Rebase => "rebase",
        }
    }

    /// whether the source wins a conflict
    fn source_wins(&self) -> bool {
        matches!(self, MergeStrategy::Theirs)
    }

    fn is_linear(&self) -> bool {
        matches!(self, MergeStrategy::Rebase)
    }
}

impl fmt::Display for MergeStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MergeStrategy {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ours" => Ok(MergeStrategy::Ours),
            "theirs" => Ok(MergeStrategy::Theirs),
            "manual" => Ok(MergeStrategy::Manual),
            "merge" => Ok(MergeStrategy::Merge),
            "rebase" => Ok(MergeStrategy::Rebase),
            other => Err(StorageError::InvalidArgument(format!(
                "unknown merge strategy: {}",
                other
            ))),
        }
    }
}

/// a file present on both tips with different content
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conflict {
    pub file: FileName,
    pub target: ContentHash,
    pub source: ContentHash,
}

/// result of `Dataset::merge`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeOutcome {
    pub success: bool,
    pub conflicts: Vec<Conflict>,
    pub merge_commit: Option<CommitId>,
}

impl MergeOutcome {
    pub(crate) fn up_to_date() -> Self {
        Self {
            success: true,
            conflicts: Vec::new(),
            merge_commit: None,
        }
    }

    /// turn an unresolved merge into `StorageError::MergeConflict`
    pub fn into_result(self) -> StorageResult<Self> {
        if self.success {
            return Ok(self);
        }
        Err(StorageError::MergeConflict {
            conflicting_paths: self.conflicts.iter().map(|c| c.file.to_string()).collect(),
        })
    }
}

/// where two first-parent chains meet
#[derive(Debug, Clone)]
pub struct Divergence {
    /// shared commit, if the chains meet at all
    pub ancestor: Option<Commit>,
    /// source commits after the ancestor, oldest first
    pub source_commits: Vec<Commit>,
}

/// Find the common ancestor of two first-parent chains (newest first).
///
/// The ancestor is the first commit on the source chain that the target
/// chain also contains. This is not a true lowest common ancestor when
/// merge commits cross-link the branches.
pub fn find_divergence(source_chain: &[Commit], target_chain: &[Commit]) -> Divergence {
    let target_ids: HashSet<&CommitId> = target_chain.iter().map(|c| &c.id).collect();
    let split = source_chain
        .iter()
        .position(|c| target_ids.contains(&c.id))
        .unwrap_or(source_chain.len());

    let mut source_commits = source_chain[..split].to_vec();
    source_commits.reverse();
    Divergence {
        ancestor: source_chain.get(split).cloned(),
        source_commits,
    }
}

/// files present in both snapshots with different hashes, by name
pub fn detect_conflicts(target: &Snapshot, source: &Snapshot) -> Vec<Conflict> {
    target
        .iter()
        .filter_map(|(name, target_hash)| {
            let source_hash = source.get(name)?;
            (source_hash != target_hash).then(|| Conflict {
                file: name.clone(),
                target: target_hash.clone(),
                source: source_hash.clone(),
            })
        })
        .collect()
}

/// the commit a merge wants written
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergePlan {
    pub snapshot: Snapshot,
    pub parents: Vec<CommitId>,
    pub message: String,
}

/// what a merge should do
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// nothing to write; carries any conflicts the target won
    UpToDate(Vec<Conflict>),
    /// manual strategy hit conflicts
    Conflicted(Vec<Conflict>),
    /// write this commit and move the target to it
    Commit { plan: MergePlan, conflicts: Vec<Conflict> },
}

/// Decide how to merge `source` into `target`.
///
/// Both chains are first-parent chains, newest first, and must be
/// non-empty (every branch reaches at least the root commit).
pub fn plan_merge(
    source_name: &str,
    target_name: &str,
    source_chain: &[Commit],
    target_chain: &[Commit],
    strategy: MergeStrategy,
) -> StorageResult<Resolution> {
    let (Some(source_tip), Some(target_tip)) = (source_chain.first(), target_chain.first()) else {
        return Err(StorageError::Internal("merge needs both branch tips".to_string()));
    };

    // the source tip is on the target chain or was merged into it
    let merged = target_chain
        .iter()
        .any(|c| c.id == source_tip.id || c.parents.contains(&source_tip.id));
    if merged {
        return Ok(Resolution::UpToDate(Vec::new()));
    }

    let conflicts = detect_conflicts(&target_tip.snapshot, &source_tip.snapshot);
    if strategy == MergeStrategy::Manual && !conflicts.is_empty() {
        return Ok(Resolution::Conflicted(conflicts));
    }

    // every strategy applies the source's net change since the ancestor;
    // a rebase squashes its divergent commits into that one delta
    let divergence = find_divergence(source_chain, target_chain);
    let base = divergence
        .ancestor
        .as_ref()
        .map(|c| c.snapshot.clone())
        .unwrap_or_default();
    let mut snapshot = target_tip.snapshot.clone();
    snapshot.apply(&base.diff(&source_tip.snapshot));

    for conflict in &conflicts {
        let winner = if strategy.source_wins() {
            &conflict.source
        } else {
            &conflict.target
        };
        snapshot.insert(conflict.file.clone(), winner.clone());
    }

    // nothing would change, e.g. a source that was already rebased
    if strategy.is_linear() && snapshot == target_tip.snapshot {
        return Ok(Resolution::UpToDate(conflicts));
    }

    let plan = if strategy.is_linear() {
        MergePlan {
            snapshot,
            parents: vec![target_tip.id.clone()],
            message: CommitMessage::rebase(source_name, target_name, divergence.source_commits.len()),
        }
    } else {
        MergePlan {
            snapshot,
            parents: vec![target_tip.id.clone(), source_tip.id.clone()],
            message: CommitMessage::merge(source_name, target_name),
        }
    };

    Ok(Resolution::Commit { plan, conflicts })
}
