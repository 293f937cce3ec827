//! A single versioned dataset.
//!
//! This is the central component of the storage layer. A [`Dataset`] ties
//! the shared remote state (blobs, commit records, the consolidated index,
//! the reverse file index) to this working copy's refs, and provides the
//! high-level operations: commit, checkout, branches, merge.
//!
//! Reads take `&self`; anything that writes a commit or moves a ref takes
//! `&mut self`, so one handle never has two writers.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::TempDir;
use tracing::{debug, info};

use crate::storage::backend::Backend;
use crate::storage::blob::ContentStore;
use crate::storage::commit::{self, Commit, CommitBuilder, CommitSource, HistoryIterator, NewFile};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::file_index::FileIndex;
use crate::storage::index::{tags_prefix, ConsolidatedIndex};
use crate::storage::merge::{self, MergeOutcome, MergeStrategy, Resolution};
use crate::storage::refs::{Head, RefManager};
use crate::storage::snapshot::Snapshot;
use crate::storage::types::{BranchName, CommitId, DatasetName, FileName};

/// Handle on one dataset in one working copy.
pub struct Dataset {
    name: DatasetName,
    backend: Arc<dyn Backend>,
    blobs: ContentStore,
    index: ConsolidatedIndex,
    refs: RefManager,
    files: FileIndex,
    sync_refs: bool,
}

impl std::fmt::Debug for Dataset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dataset")
            .field("name", &self.name)
            .field("location", &self.backend.location())
            .field("head", &self.refs.head())
            .finish()
    }
}

impl Dataset {
    /// Create a new dataset with its root commit and `main` branch.
    pub(crate) fn create(
        backend: Arc<dyn Backend>,
        name: DatasetName,
        state_dir: &Path,
        sync_refs: bool,
    ) -> StorageResult<Self> {
        if !commit::list_commit_ids(backend.as_ref(), &name)?.is_empty() {
            return Err(StorageError::DatasetAlreadyExists(name.to_string()));
        }

        let root = commit::create_root_commit()?;
        commit::write_record(backend.as_ref(), &name, &root)?;
        let mut index = ConsolidatedIndex::rebuild(backend.clone(), &name)?;
        let files = FileIndex::new(backend.clone());
        files.record_commit(&name, &root, &Snapshot::new())?;

        // a previous dataset of the same name may have left local refs behind
        let mut refs = RefManager::open(state_dir, &backend.location(), &name)?;
        refs.reset()?;
        refs.init_main_branch(&root.id)?;
        index.sync_branches(refs.list_branches())?;

        let mut dataset = Self {
            blobs: ContentStore::new(backend.clone()),
            name,
            backend,
            index,
            refs,
            files,
            sync_refs,
        };
        dataset.push_if_synced()?;
        info!(dataset = %dataset.name, root = root.id.short(), "created dataset");
        Ok(dataset)
    }

    /// Open an existing dataset.
    ///
    /// A working copy with no local refs is seeded from the remote's
    /// mirrored refs, then from the index's branch pointers, and as a last
    /// resort gets a `main` branch at the root commit.
    pub(crate) fn open(
        backend: Arc<dyn Backend>,
        name: DatasetName,
        state_dir: &Path,
        sync_refs: bool,
    ) -> StorageResult<Self> {
        if commit::list_commit_ids(backend.as_ref(), &name)?.is_empty() {
            return Err(StorageError::DatasetNotFound(name.to_string()));
        }

        let mut index = ConsolidatedIndex::load(backend.clone(), &name)?;
        let mut refs = RefManager::open(state_dir, &backend.location(), &name)?;

        if refs.is_empty() && !refs.pull_from_remote(backend.as_ref())? {
            if !index.branches().is_empty() {
                debug!(dataset = %name, "seeding local refs from the index");
                refs.seed_branches(index.branches())?;
            } else {
                let root = index
                    .commit_ids()
                    .filter_map(|id| index.get(id))
                    .filter(Commit::is_root)
                    .min_by(|a, b| a.timestamp.cmp(&b.timestamp))
                    .ok_or_else(|| {
                        StorageError::corrupted(
                            ConsolidatedIndex::index_key(&name),
                            "dataset has no root commit",
                        )
                    })?;
                debug!(dataset = %name, "no refs anywhere, starting main at the root commit");
                refs.init_main_branch(&root.id)?;
            }
        }
        index.sync_branches(refs.list_branches())?;

        Ok(Self {
            blobs: ContentStore::new(backend.clone()),
            files: FileIndex::new(backend.clone()),
            name,
            backend,
            index,
            refs,
            sync_refs,
        })
    }

    pub fn name(&self) -> &DatasetName {
        &self.name
    }

    /// the consolidated index backing this handle
    pub fn index(&self) -> &ConsolidatedIndex {
        &self.index
    }

    pub fn head(&self) -> Option<&Head> {
        self.refs.head()
    }

    /// the commit HEAD points at
    pub fn head_commit(&self) -> StorageResult<Commit> {
        let id = self.refs.head_commit()?;
        self.load_commit(&id)
    }

    /// the checked-out branch, or None when HEAD is detached
    pub fn current_branch(&self) -> Option<&BranchName> {
        self.refs.current_branch()
    }

    /// Resolve a full or partial commit hash.
    pub fn resolve(&self, prefix: &str) -> StorageResult<CommitId> {
        commit::resolve_prefix(prefix, self.index.commit_ids())
    }

    /// a branch name if one matches, otherwise a hash prefix
    fn resolve_target(&self, target: &str) -> StorageResult<CommitId> {
        if let Ok(branch) = BranchName::new(target) {
            if self.refs.branch_exists(&branch) {
                return self.refs.branch_commit(&branch);
            }
        }
        self.resolve(target)
    }

    /// Commit adds and removes on top of HEAD and advance it.
    ///
    /// Returns the new commit's id. Nothing is written if validation fails.
    pub fn commit(&mut self, message: &str, adds: &[NewFile], removes: &[&str]) -> StorageResult<CommitId> {
        let removes = removes
            .iter()
            .map(|name| FileName::new(*name))
            .collect::<Result<Vec<_>, _>>()?;
        let parent = self.head_commit()?;

        let commit = commit::create_commit(&self.blobs, &parent, adds, &removes, message)?;
        self.write_commit(&commit, &parent.snapshot)?;
        self.advance_head(&commit.id)?;

        info!(
            dataset = %self.name,
            commit = commit.id.short(),
            added = adds.len(),
            removed = removes.len(),
            "committed"
        );
        Ok(commit.id)
    }

    /// record, index and reverse-index a commit
    fn write_commit(&mut self, commit: &Commit, parent: &Snapshot) -> StorageResult<()> {
        commit::write_record(self.backend.as_ref(), &self.name, commit)?;
        self.index.record(commit)?;
        self.files.record_commit(&self.name, commit, parent)
    }

    /// move the checked-out branch (or detached HEAD) to `id`
    fn advance_head(&mut self, id: &CommitId) -> StorageResult<()> {
        match self.refs.head().cloned() {
            Some(Head::Branch(branch)) => {
                self.refs.set_branch_commit(&branch, id)?;
                self.index.set_branch(&branch, id)?;
            }
            Some(Head::Detached(_)) => self.refs.detach(id)?,
            None => return Err(StorageError::RefNotFound("HEAD".to_string())),
        }
        self.push_if_synced()
    }

    fn push_if_synced(&mut self) -> StorageResult<()> {
        if self.sync_refs {
            self.refs.push_to_remote(self.backend.as_ref())?;
        }
        Ok(())
    }

    /// Move HEAD.
    ///
    /// `Some(hash)` detaches HEAD at that commit (prefixes allowed).
    /// `None` re-attaches HEAD to the current branch, or to `main` when
    /// HEAD is detached.
    pub fn checkout(&mut self, target: Option<&str>) -> StorageResult<Commit> {
        match target {
            Some(prefix) => {
                let id = self.resolve(prefix)?;
                self.refs.detach(&id)?;
                debug!(dataset = %self.name, commit = id.short(), "detached HEAD");
            }
            None => {
                let branch = self.refs.current_branch().cloned().unwrap_or_else(BranchName::main);
                self.refs.set_current_branch(&branch)?;
            }
        }
        self.push_if_synced()?;
        self.head_commit()
    }

    /// First-parent history from HEAD, newest first.
    pub fn history(&self, limit: Option<usize>) -> StorageResult<Vec<Commit>> {
        let head = self.refs.head_commit()?;
        HistoryIterator::new(self, &head)?
            .first_parent_only()
            .take(limit.unwrap_or(usize::MAX))
            .collect()
    }

    /// names in the HEAD snapshot, sorted
    pub fn list_files(&self) -> StorageResult<Vec<FileName>> {
        Ok(self.head_commit()?.snapshot.names().cloned().collect())
    }

    /// Read a file's bytes at HEAD.
    pub fn read_file(&self, name: &str) -> StorageResult<Vec<u8>> {
        let name = FileName::new(name)?;
        let head = self.head_commit()?;
        let hash = head
            .snapshot
            .get(&name)
            .ok_or_else(|| StorageError::FileNotFound(name.to_string()))?;
        self.blobs.get(hash)
    }

    /// Write a file from HEAD to `dest`.
    ///
    /// If `dest` is a directory the file keeps its name inside it.
    pub fn download_file(&self, name: &str, dest: impl AsRef<Path>) -> StorageResult<PathBuf> {
        let content = self.read_file(name)?;
        let dest = dest.as_ref();
        let path = if dest.is_dir() {
            dest.join(name)
        } else {
            dest.to_path_buf()
        };
        fs::write(&path, content)?;
        Ok(path)
    }

    /// Materialize every file at HEAD into a scoped temporary directory.
    pub fn local_files(&self) -> StorageResult<LocalFiles> {
        let dir = tempfile::Builder::new().prefix("kirin-").tempdir()?;
        let head = self.head_commit()?;

        let mut files = BTreeMap::new();
        for (name, hash) in &head.snapshot {
            let path = dir.path().join(name.as_str());
            fs::write(&path, self.blobs.get(hash)?)?;
            files.insert(name.clone(), path);
        }
        debug!(dataset = %self.name, files = files.len(), "materialized local files");
        Ok(LocalFiles { dir, files })
    }

    /// Create a branch at `at` (a branch name or commit hash), or at HEAD.
    pub fn create_branch(&mut self, name: &str, at: Option<&str>) -> StorageResult<CommitId> {
        let branch = BranchName::new(name)?;
        // branches other working copies pushed count too
        if let Some(other) = self.index.branches().keys().find(|b| branch.nests_with(b.as_str())) {
            return Err(StorageError::InvalidArgument(format!(
                "branch {} clashes with existing branch {}",
                branch, other
            )));
        }
        let target = match at {
            Some(target) => self.resolve_target(target)?,
            None => self.refs.head_commit()?,
        };
        self.refs.create_branch(&branch, &target, true)?;
        self.index.set_branch(&branch, &target)?;
        self.push_if_synced()?;
        info!(dataset = %self.name, branch = %branch, commit = target.short(), "created branch");
        Ok(target)
    }

    /// Delete a branch. `main` and the checked-out branch are refused.
    pub fn delete_branch(&mut self, name: &str) -> StorageResult<()> {
        let branch = BranchName::new(name)?;
        self.refs.delete_branch(&branch)?;
        self.index.remove_branch(&branch)?;
        self.push_if_synced()?;
        info!(dataset = %self.name, branch = %branch, "deleted branch");
        Ok(())
    }

    pub fn list_branches(&self) -> &BTreeMap<BranchName, CommitId> {
        self.refs.list_branches()
    }

    /// Check out an existing branch.
    pub fn switch_branch(&mut self, name: &str) -> StorageResult<Commit> {
        let branch = BranchName::new(name)?;
        self.refs.set_current_branch(&branch)?;
        self.push_if_synced()?;
        self.head_commit()
    }

    /// Tag a commit (branch name, hash, or HEAD). Tags never move.
    pub fn tag(&mut self, name: &str, at: Option<&str>) -> StorageResult<CommitId> {
        // same naming rules as branches
        let tag = BranchName::new(name)?;
        let name = tag.to_string();
        if self.index.tags().contains_key(&name) {
            return Err(StorageError::TagAlreadyExists(name));
        }
        if let Some(other) = self.index.tags().keys().find(|t| tag.nests_with(t.as_str())) {
            return Err(StorageError::InvalidArgument(format!(
                "tag {} clashes with existing tag {}",
                name, other
            )));
        }
        let target = match at {
            Some(target) => self.resolve_target(target)?,
            None => self.refs.head_commit()?,
        };

        self.backend.write(
            &format!("{}{}", tags_prefix(&self.name), name),
            target.as_str().as_bytes(),
        )?;
        self.index.set_tag(&name, &target)?;
        info!(dataset = %self.name, tag = %name, commit = target.short(), "tagged");
        Ok(target)
    }

    pub fn tags(&self) -> &BTreeMap<String, CommitId> {
        self.index.tags()
    }

    /// Merge branch `source` into branch `target`.
    ///
    /// Conflicts left unresolved by [`MergeStrategy::Manual`] come back as
    /// an unsuccessful outcome; use [`MergeOutcome::into_result`] to turn
    /// that into an error.
    pub fn merge(&mut self, source: &str, target: &str, strategy: MergeStrategy) -> StorageResult<MergeOutcome> {
        let source_branch = BranchName::new(source)?;
        let target_branch = BranchName::new(target)?;
        let source_tip = self.refs.branch_commit(&source_branch)?;
        let target_tip = self.refs.branch_commit(&target_branch)?;

        if source_branch == target_branch {
            return Ok(MergeOutcome::up_to_date());
        }

        let source_chain = commit::first_parent_chain(&*self, &source_tip)?;
        let target_chain = commit::first_parent_chain(&*self, &target_tip)?;

        match merge::plan_merge(source, target, &source_chain, &target_chain, strategy)? {
            Resolution::UpToDate(conflicts) => {
                debug!(dataset = %self.name, source, target, "already up to date");
                Ok(MergeOutcome {
                    success: true,
                    conflicts,
                    merge_commit: None,
                })
            }
            Resolution::Conflicted(conflicts) => {
                info!(
                    dataset = %self.name,
                    source,
                    target,
                    conflicts = conflicts.len(),
                    "merge stopped on conflicts"
                );
                Ok(MergeOutcome {
                    success: false,
                    conflicts,
                    merge_commit: None,
                })
            }
            Resolution::Commit { plan, conflicts } => {
                let commit = CommitBuilder::new()
                    .snapshot(plan.snapshot)
                    .parents(plan.parents)
                    .message(plan.message)
                    .build()?;
                let parent = target_chain
                    .first()
                    .map(|c| c.snapshot.clone())
                    .unwrap_or_default();
                self.write_commit(&commit, &parent)?;
                self.refs.set_branch_commit(&target_branch, &commit.id)?;
                self.index.set_branch(&target_branch, &commit.id)?;
                self.push_if_synced()?;

                info!(
                    dataset = %self.name,
                    source,
                    target,
                    %strategy,
                    commit = commit.id.short(),
                    conflicts = conflicts.len(),
                    "merged"
                );
                Ok(MergeOutcome {
                    success: true,
                    conflicts,
                    merge_commit: Some(commit.id),
                })
            }
        }
    }

    /// Rebuild the consolidated index from the commit records.
    pub fn rebuild_index(&mut self) -> StorageResult<()> {
        self.index = ConsolidatedIndex::rebuild(self.backend.clone(), &self.name)?;
        self.index.sync_branches(self.refs.list_branches())
    }

    /// Mirror local refs onto the remote.
    pub fn push_refs(&mut self) -> StorageResult<()> {
        self.refs.push_to_remote(self.backend.as_ref())
    }

    /// Seed empty local refs from the remote; returns whether anything was pulled.
    pub fn pull_refs(&mut self) -> StorageResult<bool> {
        let pulled = self.refs.pull_from_remote(self.backend.as_ref())?;
        if pulled {
            self.index.sync_branches(self.refs.list_branches())?;
        }
        Ok(pulled)
    }
}

impl CommitSource for Dataset {
    fn load_commit(&self, id: &CommitId) -> StorageResult<Commit> {
        self.index.load_commit(id)
    }
}

/// Files of one snapshot on local disk.
///
/// The directory and everything in it is removed when this is dropped.
#[derive(Debug)]
pub struct LocalFiles {
    dir: TempDir,
    files: BTreeMap<FileName, PathBuf>,
}

impl LocalFiles {
    /// the temporary directory holding the files
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn get(&self, name: &str) -> Option<&Path> {
        let name = FileName::new(name).ok()?;
        self.files.get(&name).map(PathBuf::as_path)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&FileName, &Path)> {
        self.files.iter().map(|(name, path)| (name, path.as_path()))
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::backend::{FsBackend, MemoryBackend};
    use crate::storage::types::ContentHash;

    fn setup() -> (TempDir, Arc<MemoryBackend>, Dataset) {
        let state = TempDir::new().unwrap();
        let backend = Arc::new(MemoryBackend::new());
        let name = DatasetName::new("sales").unwrap();
        let dataset = Dataset::create(backend.clone(), name, state.path(), true).unwrap();
        (state, backend, dataset)
    }

    fn add(name: &str, content: &str) -> NewFile {
        NewFile::new(name, content).unwrap()
    }

    fn hash_of(dataset: &Dataset, name: &str) -> ContentHash {
        dataset
            .head_commit()
            .unwrap()
            .snapshot
            .get(&FileName::new(name).unwrap())
            .cloned()
            .unwrap()
    }

    #[test]
    fn test_create_starts_at_root() {
        let (_state, _backend, dataset) = setup();
        let head = dataset.head_commit().unwrap();
        assert!(head.is_root());
        assert!(head.snapshot.is_empty());
        assert_eq!(dataset.current_branch(), Some(&BranchName::main()));
        assert_eq!(dataset.history(None).unwrap().len(), 1);
    }

    #[test]
    fn test_create_twice_fails() {
        let (state, backend, _dataset) = setup();
        let name = DatasetName::new("sales").unwrap();
        let err = Dataset::create(backend, name, state.path(), true).unwrap_err();
        assert!(err.is_already_exists());
    }

    #[test]
    fn test_open_missing_dataset() {
        let state = TempDir::new().unwrap();
        let backend = Arc::new(MemoryBackend::new());
        let name = DatasetName::new("nope").unwrap();
        let err = Dataset::open(backend, name, state.path(), true).unwrap_err();
        assert!(matches!(err, StorageError::DatasetNotFound(_)));
    }

    #[test]
    fn test_commit_and_read() {
        let (_state, _backend, mut dataset) = setup();
        let first = dataset
            .commit("add data", &[add("a.csv", "1,2,3"), add("b.csv", "4,5")], &[])
            .unwrap();
        assert_eq!(dataset.read_file("a.csv").unwrap(), b"1,2,3");
        assert_eq!(dataset.list_files().unwrap().len(), 2);

        let second = dataset.commit("drop b", &[], &["b.csv"]).unwrap();
        assert_eq!(dataset.list_files().unwrap(), vec![FileName::new("a.csv").unwrap()]);
        assert!(matches!(
            dataset.read_file("b.csv"),
            Err(StorageError::FileNotFound(_))
        ));

        let history = dataset.history(None).unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].id, second);
        assert_eq!(history[1].id, first);
        assert_eq!(dataset.history(Some(1)).unwrap().len(), 1);
    }

    #[test]
    fn test_failed_commit_changes_nothing() {
        let (_state, backend, mut dataset) = setup();
        let before = dataset.head_commit().unwrap().id;
        let objects = backend.len();

        assert!(matches!(
            dataset.commit("empty", &[], &[]),
            Err(StorageError::NothingToCommit)
        ));
        assert!(dataset.commit("bad", &[add("x", "1")], &["missing"]).is_err());
        assert!(dataset.commit("bad name", &[], &["../etc"]).unwrap_err().is_invalid_argument());

        assert_eq!(dataset.head_commit().unwrap().id, before);
        assert_eq!(backend.len(), objects);
    }

    #[test]
    fn test_identical_content_shares_one_blob() {
        let (_state, _backend, mut dataset) = setup();
        dataset.commit("a", &[add("a.txt", "x")], &[]).unwrap();
        dataset.commit("b", &[add("b.txt", "x")], &[]).unwrap();

        let head = dataset.head_commit().unwrap();
        let h = ContentHash::of(b"x");
        let expected: Snapshot = [
            (FileName::new("a.txt").unwrap(), h.clone()),
            (FileName::new("b.txt").unwrap(), h.clone()),
        ]
        .into_iter()
        .collect();
        assert_eq!(head.snapshot, expected);
        assert_eq!(dataset.blobs.list_hashes().unwrap(), vec![h]);
    }

    #[test]
    fn test_checkout_detaches_and_reattaches() {
        let (_state, _backend, mut dataset) = setup();
        let first = dataset.commit("one", &[add("a", "1")], &[]).unwrap();
        dataset.commit("two", &[add("a", "2")], &[]).unwrap();

        let commit = dataset.checkout(Some(&first.as_str()[..10])).unwrap();
        assert_eq!(commit.id, first);
        assert_eq!(dataset.current_branch(), None);
        assert_eq!(dataset.read_file("a").unwrap(), b"1");

        let commit = dataset.checkout(None).unwrap();
        assert_eq!(dataset.current_branch(), Some(&BranchName::main()));
        assert_eq!(commit.message, "two");

        assert!(dataset.checkout(Some("zzzz")).unwrap_err().is_not_found());
    }

    #[test]
    fn test_branch_operations() {
        let (_state, _backend, mut dataset) = setup();
        dataset.commit("one", &[add("a", "1")], &[]).unwrap();

        let at = dataset.create_branch("feature", None).unwrap();
        assert_eq!(dataset.list_branches().len(), 2);
        assert!(dataset.create_branch("feature", None).unwrap_err().is_already_exists());
        assert!(dataset.create_branch("main", None).unwrap_err().is_already_exists());

        dataset.switch_branch("feature").unwrap();
        dataset.commit("two", &[add("b", "2")], &[]).unwrap();
        assert_eq!(dataset.list_branches()[&BranchName::main()], at);

        assert!(dataset.delete_branch("feature").is_err());
        assert!(dataset.delete_branch("main").is_err());
        dataset.switch_branch("main").unwrap();
        dataset.delete_branch("feature").unwrap();
        assert!(dataset.delete_branch("feature").unwrap_err().is_not_found());
        assert_eq!(dataset.index().branches().len(), 1);
    }

    #[test]
    fn test_nested_branch_names_leave_dataset_usable() {
        let dir = TempDir::new().unwrap();
        let state = TempDir::new().unwrap();
        let backend: Arc<dyn Backend> = Arc::new(FsBackend::new(dir.path()).unwrap());
        let name = DatasetName::new("teams").unwrap();
        let mut dataset = Dataset::create(backend, name, state.path(), true).unwrap();

        dataset.create_branch("team", None).unwrap();
        assert!(dataset.create_branch("team/x", None).unwrap_err().is_invalid_argument());
        dataset.create_branch("squad/a", None).unwrap();
        assert!(dataset.create_branch("squad", None).unwrap_err().is_invalid_argument());

        let names: Vec<&str> = dataset.list_branches().keys().map(BranchName::as_str).collect();
        assert_eq!(names, vec!["main", "squad/a", "team"]);
        dataset.commit("still works", &[add("a", "1")], &[]).unwrap();

        dataset.tag("v1", None).unwrap();
        assert!(dataset.tag("v1/rc", None).unwrap_err().is_invalid_argument());
    }

    #[test]
    fn test_rebase_keeps_target_file_the_source_added_and_dropped() {
        let (_state, _backend, mut dataset) = setup();
        dataset.commit("A", &[add("f1.csv", "h1")], &[]).unwrap();
        dataset.create_branch("feat", None).unwrap();
        dataset.commit("T", &[add("x.csv", "main copy")], &[]).unwrap();

        dataset.switch_branch("feat").unwrap();
        dataset.commit("S1", &[add("x.csv", "feat copy")], &[]).unwrap();
        dataset.commit("S2", &[add("s.csv", "s")], &["x.csv"]).unwrap();
        dataset.switch_branch("main").unwrap();

        let outcome = dataset.merge("feat", "main", MergeStrategy::Rebase).unwrap();
        assert!(outcome.success);
        assert!(outcome.conflicts.is_empty());
        let names: Vec<String> = dataset.list_files().unwrap().iter().map(|f| f.to_string()).collect();
        assert_eq!(names, vec!["f1.csv", "s.csv", "x.csv"]);
        assert_eq!(dataset.read_file("x.csv").unwrap(), b"main copy");
    }

    #[test]
    fn test_rebase_without_change_still_reports_conflicts() {
        let (_state, _backend, mut dataset) = setup();
        dataset.commit("base", &[add("f1.csv", "v1")], &[]).unwrap();
        dataset.create_branch("feat", None).unwrap();
        dataset.switch_branch("feat").unwrap();
        dataset.commit("edit", &[add("f1.csv", "v2")], &[]).unwrap();
        dataset.switch_branch("main").unwrap();

        let outcome = dataset.merge("feat", "main", MergeStrategy::Rebase).unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.merge_commit, None);
        assert_eq!(outcome.conflicts.len(), 1);
        assert_eq!(outcome.conflicts[0].source, ContentHash::of(b"v2"));
    }

    #[test]
    fn test_repeated_merge_adds_no_commit() {
        let (_state, _backend, mut dataset) = setup();
        dataset.commit("base", &[add("a", "1")], &[]).unwrap();
        dataset.create_branch("side", None).unwrap();
        dataset.commit("main work", &[add("m", "m")], &[]).unwrap();
        dataset.switch_branch("side").unwrap();
        dataset.commit("side work", &[add("s", "s")], &[]).unwrap();
        dataset.switch_branch("main").unwrap();

        let first = dataset.merge("side", "main", MergeStrategy::Merge).unwrap();
        assert!(first.merge_commit.is_some());
        let len = dataset.history(None).unwrap().len();

        for strategy in [MergeStrategy::Merge, MergeStrategy::Ours, MergeStrategy::Theirs] {
            let again = dataset.merge("side", "main", strategy).unwrap();
            assert!(again.success);
            assert_eq!(again.merge_commit, None);
        }
        assert_eq!(dataset.history(None).unwrap().len(), len);
    }

    #[test]
    fn test_rebase_merge_scenario() {
        let (_state, _backend, mut dataset) = setup();
        dataset.commit("A", &[add("f1.csv", "h1")], &[]).unwrap();
        dataset.create_branch("feat", None).unwrap();
        dataset.switch_branch("feat").unwrap();
        let feat_tip = dataset.commit("B", &[add("f2.csv", "h2")], &[]).unwrap();
        dataset.switch_branch("main").unwrap();
        let main_len = dataset.history(None).unwrap().len();

        let outcome = dataset.merge("feat", "main", MergeStrategy::Rebase).unwrap();
        assert!(outcome.success);
        assert!(outcome.conflicts.is_empty());

        let head = dataset.head_commit().unwrap();
        assert_eq!(Some(head.id.clone()), outcome.merge_commit);
        assert_eq!(head.parents.len(), 1);
        assert_eq!(head.snapshot.len(), 2);
        assert_eq!(hash_of(&dataset, "f1.csv"), ContentHash::of(b"h1"));
        assert_eq!(hash_of(&dataset, "f2.csv"), ContentHash::of(b"h2"));
        assert_eq!(dataset.history(None).unwrap().len(), main_len + 1);
        assert_eq!(dataset.list_branches()[&BranchName::new("feat").unwrap()], feat_tip);

        // again: nothing left to do
        let again = dataset.merge("feat", "main", MergeStrategy::Rebase).unwrap();
        assert_eq!(again.merge_commit, None);
    }

    #[test]
    fn test_conflicting_merge_scenario() {
        let (_state, _backend, mut dataset) = setup();
        dataset.commit("base", &[add("shared.txt", "base")], &[]).unwrap();
        dataset.create_branch("other", None).unwrap();
        dataset.commit("ours", &[add("shared.txt", "main side")], &[]).unwrap();
        dataset.switch_branch("other").unwrap();
        let other_tip = dataset.commit("theirs", &[add("shared.txt", "other side")], &[]).unwrap();
        dataset.switch_branch("main").unwrap();
        let main_tip = dataset.head_commit().unwrap().id;

        let outcome = dataset.merge("other", "main", MergeStrategy::Manual).unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.conflicts.len(), 1);
        assert_eq!(outcome.conflicts[0].file.as_str(), "shared.txt");
        assert_eq!(outcome.merge_commit, None);
        assert_eq!(dataset.head_commit().unwrap().id, main_tip);
        assert!(outcome.into_result().unwrap_err().is_conflict());

        let outcome = dataset.merge("other", "main", MergeStrategy::Theirs).unwrap();
        assert!(outcome.success);
        let head = dataset.head_commit().unwrap();
        assert_eq!(head.parents, vec![main_tip, other_tip]);
        assert_eq!(hash_of(&dataset, "shared.txt"), ContentHash::of(b"other side"));
    }

    #[test]
    fn test_merge_edge_cases() {
        let (_state, _backend, mut dataset) = setup();
        dataset.commit("one", &[add("a", "1")], &[]).unwrap();

        let outcome = dataset.merge("main", "main", MergeStrategy::Merge).unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.merge_commit, None);

        let err = dataset.merge("ghost", "main", MergeStrategy::Merge).unwrap_err();
        assert!(err.is_not_found());
        let err = dataset.merge("main", "ghost", MergeStrategy::Manual).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_tags() {
        let (_state, backend, mut dataset) = setup();
        let first = dataset.commit("one", &[add("a", "1")], &[]).unwrap();
        dataset.commit("two", &[add("a", "2")], &[]).unwrap();

        assert_eq!(dataset.tag("v1", Some(first.as_str())).unwrap(), first);
        assert!(matches!(
            dataset.tag("v1", None),
            Err(StorageError::TagAlreadyExists(_))
        ));
        assert_eq!(dataset.tags()["v1"], first);
        assert!(backend.exists("datasets/sales/refs/tags/v1").unwrap());

        // tags survive an index rebuild
        dataset.rebuild_index().unwrap();
        assert_eq!(dataset.tags()["v1"], first);
    }

    #[test]
    fn test_reverse_index_follows_commits() {
        let (_state, _backend, mut dataset) = setup();
        let id = dataset.commit("one", &[add("a", "payload")], &[]).unwrap();
        let hash = ContentHash::of(b"payload");

        let entry = dataset.files.entry(&hash).unwrap().unwrap();
        assert_eq!(entry.datasets[dataset.name()][0].commit_hash, id);
        assert!(dataset.files.verify_against_catalog().unwrap().is_consistent());
    }

    #[test]
    fn test_local_files_are_scoped() {
        let (_state, _backend, mut dataset) = setup();
        dataset
            .commit("two", &[add("a.csv", "1"), add("b.csv", "2")], &[])
            .unwrap();

        let local = dataset.local_files().unwrap();
        let dir = local.path().to_path_buf();
        assert_eq!(local.len(), 2);
        let a = local.get("a.csv").unwrap();
        assert_eq!(fs::read(a).unwrap(), b"1");
        drop(local);
        assert!(!dir.exists());
    }

    #[test]
    fn test_download_file() {
        let (_state, _backend, mut dataset) = setup();
        dataset.commit("one", &[add("a.csv", "1,2")], &[]).unwrap();

        let out = TempDir::new().unwrap();
        let path = dataset.download_file("a.csv", out.path()).unwrap();
        assert_eq!(path, out.path().join("a.csv"));
        assert_eq!(fs::read(&path).unwrap(), b"1,2");

        let renamed = dataset
            .download_file("a.csv", out.path().join("copy.csv"))
            .unwrap();
        assert_eq!(fs::read(renamed).unwrap(), b"1,2");
    }

    #[test]
    fn test_second_working_copy_pulls_refs() {
        let (_state, backend, mut dataset) = setup();
        dataset.commit("one", &[add("a", "1")], &[]).unwrap();
        dataset.create_branch("dev", None).unwrap();
        let tip = dataset.head_commit().unwrap().id;

        let other_state = TempDir::new().unwrap();
        let name = DatasetName::new("sales").unwrap();
        let mut other = Dataset::open(backend, name, other_state.path(), true).unwrap();
        assert_eq!(other.head_commit().unwrap().id, tip);
        assert_eq!(other.list_branches().len(), 2);
        // already seeded, so a later pull leaves local refs alone
        assert!(!other.pull_refs().unwrap());
    }

    #[test]
    fn test_unsynced_refs_stay_local() {
        let state = TempDir::new().unwrap();
        let backend = Arc::new(MemoryBackend::new());
        let name = DatasetName::new("quiet").unwrap();
        let mut dataset = Dataset::create(backend.clone(), name.clone(), state.path(), false).unwrap();
        dataset.commit("one", &[add("a", "1")], &[]).unwrap();
        assert!(backend.list("datasets/quiet/refs/").unwrap().is_empty());

        dataset.push_refs().unwrap();
        assert_eq!(backend.list("datasets/quiet/refs/heads/").unwrap().len(), 1);
    }

    #[test]
    fn test_corrupt_index_heals_on_open() {
        let dir = TempDir::new().unwrap();
        let state = TempDir::new().unwrap();
        let backend: Arc<dyn Backend> = Arc::new(FsBackend::new(dir.path()).unwrap());
        let name = DatasetName::new("logs").unwrap();

        let mut dataset = Dataset::create(backend.clone(), name.clone(), state.path(), true).unwrap();
        let id = dataset.commit("one", &[add("a", "1")], &[]).unwrap();
        drop(dataset);

        backend
            .write(&ConsolidatedIndex::index_key(&name), b"{\"version\": 7")
            .unwrap();
        let reopened = Dataset::open(backend, name, state.path(), true).unwrap();
        assert!(reopened.index().contains(&id));
        assert_eq!(reopened.head_commit().unwrap().id, id);
    }
}
