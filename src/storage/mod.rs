//! storage layer for kirin
//!
//! this module holds everything that touches stored bytes: content-addressed
//! blobs, commits and their records, the per-dataset index, refs, merges and
//! the reverse file index. The `db` layer on top only combines datasets.
//!
//!  # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          Dataset                            │
//! │   (commit, checkout, history, branches, tags, merge)        │
//! └─────────────────────────────────────────────────────────────┘
//!        │               │               │               │
//!        ▼               ▼               ▼               ▼
//!  ┌───────────┐   ┌───────────┐   ┌───────────┐   ┌────────────┐
//!  │   blob    │   │   index   │   │   refs    │   │ file_index │
//!  │ (content) │   │  (cache)  │   │ (local)   │   │ (reverse)  │
//!  └───────────┘   └───────────┘   └───────────┘   └────────────┘
//!        │               │               │               │
//!        └───────────────┴───────┬───────┴───────────────┘
//!                                ▼
//!                         ┌─────────────┐
//!                         │   backend   │
//!                         │ (fs / mem)  │
//!                         └─────────────┘
//!  ```
//!
//! # Usage
//!
//! ```ignore
//! use kirin::db::Store;
//! use kirin::storage::{MergeStrategy, NewFile};
//!
//! let store = Store::open("./data")?;
//! let mut sales = store.open_or_create_dataset("sales")?;
//!
//! sales.commit("first load", &[NewFile::new("q1.csv", "a,b\n1,2\n")?], &[])?;
//! sales.create_branch("cleanup", None)?;
//! sales.switch_branch("cleanup")?;
//! sales.commit("drop q1", &[], &["q1.csv"])?;
//!
//! sales.switch_branch("main")?;
//! let outcome = sales.merge("cleanup", "main", MergeStrategy::Rebase)?;
//! ```

mod backend;
mod blob;
mod commit;
mod dataset;
mod error;
mod file_index;
mod index;
mod merge;
mod refs;
mod snapshot;
mod types;

// Re-export public API
pub use backend::{Backend, FsBackend, MemoryBackend};
pub use blob::{ContentStore, LiveSet};
pub use commit::{
    compute_commit_hash, Commit, CommitBuilder, CommitMessage, CommitRecord, CommitSource,
    HistoryIterator, NewFile,
};
pub use dataset::{Dataset, LocalFiles};
pub use error::{ErrorKind, StorageError, StorageResult};
pub use file_index::{FileIndex, FileIndexEntry, FileReference, IndexedRef, VerifyReport};
pub use index::{ConsolidatedIndex, IndexEntry, IndexRecord, INDEX_FILE, INDEX_VERSION};
pub use merge::{Conflict, MergeOutcome, MergeStrategy};
pub use refs::{Head, LocalRefState};
pub use snapshot::{Snapshot, SnapshotBuilder};
pub use types::{
    BranchName, Change, ChangeStatus, CommitId, ContentHash, DatasetName, FileName,
    InvalidNameError,
};

// Re-export for internal use by the db layer
pub(crate) use commit::{list_commit_ids, list_dataset_names, read_record};
pub(crate) use file_index::introduced_hashes;
pub(crate) use index::{read_ref_dir, refs_prefix, tags_prefix};
pub(crate) use refs::RefManager;
