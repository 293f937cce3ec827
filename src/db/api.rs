//! Store API - high-level interface for kirin.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::storage::{
    introduced_hashes, list_commit_ids, list_dataset_names, read_record, read_ref_dir,
    refs_prefix, tags_prefix, Backend, CommitId, CommitSource, ConsolidatedIndex, ContentHash,
    ContentStore, Dataset, DatasetName, FileIndex, FsBackend, Head, LiveSet, RefManager, Snapshot,
    StorageError, StorageResult, VerifyReport,
};

/// directory under the root that holds local ref state by default
pub const DEFAULT_STATE_DIR: &str = ".kirin-local";

/// Store configuration options.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Path to the storage root.
    pub root: PathBuf,
    /// Where this working copy keeps its refs. Defaults to `<root>/.kirin-local`.
    pub state_dir: Option<PathBuf>,
    /// Create the root if it doesn't exist.
    pub create_if_missing: bool,
    /// Mirror refs to the storage root after every ref change.
    pub sync_refs: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(".kirin"),
            state_dir: None,
            create_if_missing: true,
            sync_refs: true,
        }
    }
}

impl StoreConfig {
    /// Create a new configuration with the given root.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Default::default()
        }
    }

    /// Set the local state directory.
    pub fn state_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.state_dir = Some(path.into());
        self
    }

    /// Set create_if_missing flag.
    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    /// Set sync_refs flag.
    pub fn sync_refs(mut self, value: bool) -> Self {
        self.sync_refs = value;
        self
    }

    /// the state directory this configuration resolves to
    pub fn resolved_state_dir(&self) -> PathBuf {
        self.state_dir
            .clone()
            .unwrap_or_else(|| self.root.join(DEFAULT_STATE_DIR))
    }
}

/// The main store handle: one storage root shared by many datasets.
pub struct Store {
    backend: Arc<dyn Backend>,
    state_dir: PathBuf,
    sync_refs: bool,
    blobs: ContentStore,
    files: FileIndex,
}

impl Store {
    /// Open or create a store at the given path.
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        Self::open_with_config(StoreConfig::new(path.as_ref()))
    }

    /// Open or create a store with custom configuration.
    pub fn open_with_config(config: StoreConfig) -> StorageResult<Self> {
        if !config.root.exists() && !config.create_if_missing {
            return Err(StorageError::StoreNotFound(config.root.display().to_string()));
        }
        let backend = FsBackend::new(&config.root)?;
        let state_dir = config.resolved_state_dir();
        fs::create_dir_all(&state_dir)?;

        info!(location = %backend.location(), state_dir = %state_dir.display(), "opened store");
        Ok(Self::with_backend(Arc::new(backend), state_dir).with_sync_refs(config.sync_refs))
    }

    /// Build a store over any backend, keeping local refs in `state_dir`.
    pub fn with_backend(backend: Arc<dyn Backend>, state_dir: impl Into<PathBuf>) -> Self {
        Self {
            blobs: ContentStore::new(backend.clone()),
            files: FileIndex::new(backend.clone()),
            backend,
            state_dir: state_dir.into(),
            sync_refs: true,
        }
    }

    /// Set whether datasets mirror their refs after every change.
    pub fn with_sync_refs(mut self, value: bool) -> Self {
        self.sync_refs = value;
        self
    }

    /// where the shared state lives
    pub fn location(&self) -> String {
        self.backend.location()
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    pub fn blobs(&self) -> &ContentStore {
        &self.blobs
    }

    /// Create a new dataset. Fails if one with this name exists.
    pub fn create_dataset(&self, name: &str) -> StorageResult<Dataset> {
        let name = DatasetName::new(name)?;
        Dataset::create(self.backend.clone(), name, &self.state_dir, self.sync_refs)
    }

    /// Open an existing dataset.
    pub fn open_dataset(&self, name: &str) -> StorageResult<Dataset> {
        let name = DatasetName::new(name)?;
        Dataset::open(self.backend.clone(), name, &self.state_dir, self.sync_refs)
    }

    /// Open a dataset, creating it (with its root commit) on first use.
    pub fn open_or_create_dataset(&self, name: &str) -> StorageResult<Dataset> {
        match self.open_dataset(name) {
            Err(StorageError::DatasetNotFound(_)) => self.create_dataset(name),
            other => other,
        }
    }

    /// List all datasets.
    pub fn list_datasets(&self) -> StorageResult<Vec<DatasetName>> {
        list_dataset_names(self.backend.as_ref())
    }

    /// Delete a dataset's records, refs and reverse-index references.
    ///
    /// Blobs are left for [`Store::collect_garbage`], since other datasets
    /// may share them.
    pub fn delete_dataset(&self, name: &str) -> StorageResult<()> {
        let name = DatasetName::new(name)?;
        let backend = self.backend.as_ref();
        let ids = list_commit_ids(backend, &name)?;
        if ids.is_empty() {
            return Err(StorageError::DatasetNotFound(name.to_string()));
        }

        let mut commits = HashMap::new();
        let mut complete = true;
        for id in ids {
            match read_record(backend, &name, &id) {
                Ok(commit) => {
                    commits.insert(id, commit);
                }
                Err(e) if e.is_corrupt() || e.is_not_found() => {
                    warn!(dataset = %name, commit = %id, error = %e, "unreadable record while deleting");
                    complete = false;
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
            for hash in introduced_hashes(commit, parent).into_keys() {
                self.files.remove_reference(&hash, &name, None)?;
            }
        }
        if !complete {
            // references of unreadable commits can only be found by a sweep
            self.files.forget_dataset(&name)?;
        }

        let removed = backend.delete_prefix(&format!("datasets/{}/", name))?;
        RefManager::open(&self.state_dir, &self.location(), &name)?.reset()?;
        info!(dataset = %name, objects = removed, "deleted dataset");
        Ok(())
    }

    /// Datasets with a commit that introduced this content.
    pub fn find_datasets_with_file(&self, hash: &ContentHash) -> StorageResult<Vec<DatasetName>> {
        self.files.datasets_with_file(hash)
    }

    /// Regenerate the reverse file index from the commit records.
    pub fn rebuild_file_index(&self) -> StorageResult<usize> {
        self.files.rebuild_from_catalog()
    }

    /// Compare the reverse file index with the commit records.
    pub fn verify_file_index(&self) -> StorageResult<VerifyReport> {
        self.files.verify_against_catalog()
    }

    /// Every blob hash reachable from any dataset's branches, tags or a
    /// detached HEAD of this working copy, following all parents.
    ///
    /// Branch pointers come from the index, the mirrored refs and this
    /// working copy's local refs together. Refs that exist only in another
    /// working copy's unsynced local state are not visible here.
    pub fn live_hashes(&self) -> StorageResult<LiveSet> {
        let backend = self.backend.as_ref();
        let mut live = LiveSet::new();

        for name in self.list_datasets()? {
            let index = ConsolidatedIndex::load(self.backend.clone(), &name)?;

            let mut roots: Vec<CommitId> = index.branches().values().cloned().collect();
            roots.extend(index.tags().values().cloned());
            for prefix in [refs_prefix(&name), tags_prefix(&name)] {
                roots.extend(read_ref_dir(backend, &prefix)?.into_iter().map(|(_, id)| id));
            }
            let local = RefManager::open(&self.state_dir, &self.location(), &name)?;
            roots.extend(local.list_branches().values().cloned());
            if let Some(Head::Detached(id)) = local.head() {
                roots.push(id.clone());
            }

            // a missing commit aborts the walk: better no GC than a wrong one
            let mut seen = HashSet::new();
            let mut stack = roots;
            while let Some(id) = stack.pop() {
                if !seen.insert(id.clone()) {
                    continue;
                }
                let commit = index.load_commit(&id)?;
                live.insert_snapshot(&commit.snapshot);
                stack.extend(commit.parents);
            }
            debug!(dataset = %name, commits = seen.len(), "walked dataset history");
        }

        Ok(live)
    }

    /// Delete every blob no history references. Returns how many went.
    pub fn collect_garbage(&self) -> StorageResult<usize> {
        let live = self.live_hashes()?;
        info!(live = live.len(), "collecting garbage");
        self.blobs.collect_garbage(&live)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryBackend, MergeStrategy, NewFile};
    use tempfile::TempDir;

    fn setup() -> (TempDir, Store) {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path().join("store")).unwrap();
        (dir, store)
    }

    fn add(name: &str, content: &str) -> NewFile {
        NewFile::new(name, content).unwrap()
    }

    #[test]
    fn test_open_store() {
        let (_dir, store) = setup();
        assert!(store.list_datasets().unwrap().is_empty());
        assert!(store.location().starts_with("file://"));
        assert!(store.state_dir().ends_with(DEFAULT_STATE_DIR));
    }

    #[test]
    fn test_open_missing_root() {
        let dir = TempDir::new().unwrap();
        let config = StoreConfig::new(dir.path().join("absent")).create_if_missing(false);
        let err = Store::open_with_config(config).err().unwrap();
        assert!(matches!(err, StorageError::StoreNotFound(_)));
    }

    #[test]
    fn test_dataset_lifecycle() {
        let (_dir, store) = setup();
        store.create_dataset("sales").unwrap();
        assert!(store.create_dataset("sales").unwrap_err().is_already_exists());
        assert!(store.open_dataset("costs").unwrap_err().is_not_found());
        store.open_or_create_dataset("costs").unwrap();
        assert!(store.create_dataset("bad name!").unwrap_err().is_invalid_argument());

        let names: Vec<String> = store
            .list_datasets()
            .unwrap()
            .iter()
            .map(|n| n.to_string())
            .collect();
        assert_eq!(names, vec!["costs", "sales"]);
    }

    #[test]
    fn test_reopen_keeps_history() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("store");
        let id = {
            let store = Store::open(&root).unwrap();
            let mut sales = store.create_dataset("sales").unwrap();
            sales.commit("load", &[add("q1.csv", "a,b")], &[]).unwrap()
        };

        let store = Store::open(&root).unwrap();
        let sales = store.open_dataset("sales").unwrap();
        assert_eq!(sales.head_commit().unwrap().id, id);
        assert_eq!(sales.read_file("q1.csv").unwrap(), b"a,b");
    }

    #[test]
    fn test_find_datasets_with_file() {
        let (_dir, store) = setup();
        let mut sales = store.create_dataset("sales").unwrap();
        let mut costs = store.create_dataset("costs").unwrap();
        sales.commit("s", &[add("shared.csv", "same")], &[]).unwrap();
        costs.commit("c", &[add("copy.csv", "same")], &[]).unwrap();
        costs.commit("d", &[add("own.csv", "mine")], &[]).unwrap();

        let shared = store.find_datasets_with_file(&ContentHash::of(b"same")).unwrap();
        assert_eq!(shared.len(), 2);
        let own = store.find_datasets_with_file(&ContentHash::of(b"mine")).unwrap();
        assert_eq!(own, vec![DatasetName::new("costs").unwrap()]);
        assert!(store.verify_file_index().unwrap().is_consistent());
    }

    #[test]
    fn test_garbage_collection() {
        let (_dir, store) = setup();
        let mut sales = store.create_dataset("sales").unwrap();
        sales.commit("one", &[add("a.csv", "old")], &[]).unwrap();
        sales.commit("two", &[add("a.csv", "new")], &[]).unwrap();

        // an orphan nothing points at
        let orphan = store.blobs().put(b"orphan").unwrap();
        assert_eq!(store.blobs().list_hashes().unwrap().len(), 3);

        let live = store.live_hashes().unwrap();
        assert!(live.contains(&ContentHash::of(b"old")));
        assert!(live.contains(&ContentHash::of(b"new")));
        assert!(!live.contains(&orphan));

        assert_eq!(store.collect_garbage().unwrap(), 1);
        assert_eq!(store.collect_garbage().unwrap(), 0);
        assert_eq!(sales.read_file("a.csv").unwrap(), b"new");
    }

    #[test]
    fn test_gc_keeps_branch_and_tag_history() {
        let (_dir, store) = setup();
        let mut sales = store.create_dataset("sales").unwrap();
        let first = sales.commit("one", &[add("a.csv", "v1")], &[]).unwrap();
        sales.tag("v1", None).unwrap();
        sales.create_branch("side", None).unwrap();
        sales.switch_branch("side").unwrap();
        sales.commit("side only", &[add("side.csv", "side")], &[]).unwrap();
        sales.switch_branch("main").unwrap();
        sales.commit("replace", &[add("a.csv", "v2")], &[]).unwrap();
        sales.checkout(Some(first.as_str())).unwrap();

        assert_eq!(store.collect_garbage().unwrap(), 0);
        for content in ["v1", "v2", "side"] {
            assert!(store.blobs().exists(&ContentHash::of(content.as_bytes())).unwrap());
        }

        let outcome = sales.merge("side", "main", MergeStrategy::Merge).unwrap();
        assert!(outcome.success);
    }

    #[test]
    fn test_delete_dataset() {
        let (_dir, store) = setup();
        let mut sales = store.create_dataset("sales").unwrap();
        let mut costs = store.create_dataset("costs").unwrap();
        sales.commit("s", &[add("a.csv", "shared"), add("b.csv", "only sales")], &[]).unwrap();
        costs.commit("c", &[add("a.csv", "shared")], &[]).unwrap();
        drop(sales);

        store.delete_dataset("sales").unwrap();
        assert!(store.open_dataset("sales").unwrap_err().is_not_found());
        assert!(store.delete_dataset("sales").unwrap_err().is_not_found());

        let shared = store.find_datasets_with_file(&ContentHash::of(b"shared")).unwrap();
        assert_eq!(shared, vec![DatasetName::new("costs").unwrap()]);
        assert!(store
            .find_datasets_with_file(&ContentHash::of(b"only sales"))
            .unwrap()
            .is_empty());
        assert!(store.verify_file_index().unwrap().is_consistent());

        // only the blob unique to the deleted dataset goes
        assert_eq!(store.collect_garbage().unwrap(), 1);
        assert_eq!(costs.read_file("a.csv").unwrap(), b"shared");

        // the name can be reused from scratch
        let fresh = store.create_dataset("sales").unwrap();
        assert_eq!(fresh.history(None).unwrap().len(), 1);
        assert_eq!(fresh.list_branches().len(), 1);
    }

    #[test]
    fn test_rebuild_file_index() {
        let (_dir, store) = setup();
        let mut sales = store.create_dataset("sales").unwrap();
        sales.commit("s", &[add("a.csv", "1"), add("b.csv", "2")], &[]).unwrap();

        store.blobs().put(b"unrelated").unwrap();
        let hash = ContentHash::of(b"1");
        store.files.remove_reference(&hash, sales.name(), None).unwrap();
        let report = store.verify_file_index().unwrap();
        assert_eq!(report.missing.len(), 1);
        assert!(report.extra.is_empty());

        assert_eq!(store.rebuild_file_index().unwrap(), 2);
        assert!(store.verify_file_index().unwrap().is_consistent());
    }

    #[test]
    fn test_working_copies_keep_separate_refs() {
        let dir = TempDir::new().unwrap();
        let state = dir.path().join("shared-state");
        let a = Store::open_with_config(StoreConfig::new(dir.path().join("a")).state_dir(&state)).unwrap();
        let b = Store::open_with_config(StoreConfig::new(dir.path().join("b")).state_dir(&state)).unwrap();

        let mut in_a = a.create_dataset("sales").unwrap();
        in_a.create_branch("only-in-a", None).unwrap();
        let in_b = b.create_dataset("sales").unwrap();

        assert_eq!(in_a.list_branches().len(), 2);
        assert_eq!(in_b.list_branches().len(), 1);
    }

    #[test]
    fn test_memory_backend_store() {
        let state = TempDir::new().unwrap();
        let store = Store::with_backend(Arc::new(MemoryBackend::new()), state.path()).with_sync_refs(false);
        let mut data = store.open_or_create_dataset("scratch").unwrap();
        data.commit("x", &[add("x.bin", "xyz")], &[]).unwrap();

        assert_eq!(store.list_datasets().unwrap().len(), 1);
        let hashes = store.blobs().list_hashes().unwrap();
        assert_eq!(hashes, vec![ContentHash::of(b"xyz")]);
        assert_eq!(store.blobs().size(&hashes[0]).unwrap(), 3);
    }
}
