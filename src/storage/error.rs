//! Storage layer error types
//!
//! All errors that can occur during storage operations are defined here.
//! We use `thiserror` for ergonomic error definition and better error messages.

use thiserror::Error;

use crate::storage::types::{BranchName, ContentHash, InvalidNameError};

/// the main error type for storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    /// no blob is stored under this hash
    #[error("blob not found: {0}")]
    BlobNotFound(ContentHash),

    /// the commit (or commit prefix) was not found
    #[error("commit not found: {0}")]
    CommitNotFound(String),

    /// the specified branch/ref was not found
    #[error("ref not found: {0}")]
    RefNotFound(String),

    /// the file is not part of the snapshot
    #[error("file not found: {0}")]
    FileNotFound(String),

    /// the dataset has never been created under this root
    #[error("dataset not found: {0}")]
    DatasetNotFound(String),

    /// no store at this root and creation was not requested
    #[error("store not found: {0}")]
    StoreNotFound(String),

    /// raw backend key is missing
    #[error("key not found: {0}")]
    KeyNotFound(String),

    /// branch already exists
    #[error("branch already exists: {0}")]
    BranchAlreadyExists(BranchName),

    /// tags are immutable once created
    #[error("tag already exists: {0}")]
    TagAlreadyExists(String),

    /// dataset already exists
    #[error("dataset already exists: {0}")]
    DatasetAlreadyExists(String),

    /// a partial hash matched more than one commit
    #[error("ambiguous hash prefix '{prefix}': {matches} commits match")]
    AmbiguousHash { prefix: String, matches: usize },

    /// invalid file, branch or dataset name
    #[error("invalid name: {0}")]
    InvalidName(#[from] InvalidNameError),

    /// argument rejected before any write took place
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// commit with no adds and no removes
    #[error("nothing to commit")]
    NothingToCommit,

    /// overlapping changes left unresolved by a manual merge
    #[error("merge conflict: {conflicting_paths:?}")]
    MergeConflict { conflicting_paths: Vec<String> },

    /// data integrity check failed
    #[error("corrupted data at {path}: {reason}")]
    CorruptedData { path: String, reason: String },

    /// I/O error (filesystem or transport level)
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization or deserialization failed
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// internal error that shouldn't happen
    #[error("internal error: {0}")]
    Internal(String),
}

/// coarse classification of a [`StorageError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    Ambiguous,
    InvalidArgument,
    Conflict,
    Corrupt,
    Io,
}

impl StorageError {
    /// map this error onto the coarse taxonomy
    pub fn kind(&self) -> ErrorKind {
        match self {
            StorageError::BlobNotFound(_)
            | StorageError::CommitNotFound(_)
            | StorageError::RefNotFound(_)
            | StorageError::FileNotFound(_)
            | StorageError::DatasetNotFound(_)
            | StorageError::StoreNotFound(_)
            | StorageError::KeyNotFound(_) => ErrorKind::NotFound,
            StorageError::BranchAlreadyExists(_)
            | StorageError::TagAlreadyExists(_)
            | StorageError::DatasetAlreadyExists(_) => ErrorKind::AlreadyExists,
            StorageError::AmbiguousHash { .. } => ErrorKind::Ambiguous,
            StorageError::InvalidName(_)
            | StorageError::InvalidArgument(_)
            | StorageError::NothingToCommit => ErrorKind::InvalidArgument,
            StorageError::MergeConflict { .. } => ErrorKind::Conflict,
            StorageError::CorruptedData { .. }
            | StorageError::Serialization(_)
            | StorageError::Internal(_) => ErrorKind::Corrupt,
            StorageError::Io(_) => ErrorKind::Io,
        }
    }

    /// check if this error indicates the resource doesn't exist
    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    /// check if this error is a name collision
    pub fn is_already_exists(&self) -> bool {
        self.kind() == ErrorKind::AlreadyExists
    }

    /// check if the call was rejected during validation
    pub fn is_invalid_argument(&self) -> bool {
        self.kind() == ErrorKind::InvalidArgument
    }

    /// check if this error is a conflict
    pub fn is_conflict(&self) -> bool {
        self.kind() == ErrorKind::Conflict
    }

    /// check if stored data failed an integrity check
    pub fn is_corrupt(&self) -> bool {
        self.kind() == ErrorKind::Corrupt
    }

    pub(crate) fn corrupted(path: impl Into<String>, reason: impl Into<String>) -> Self {
        StorageError::CorruptedData {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

/// result type alias for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let not_found = StorageError::RefNotFound("feature".to_string());
        assert!(not_found.is_not_found());
        assert!(!not_found.is_conflict());

        let conflict = StorageError::MergeConflict {
            conflicting_paths: vec!["shared.txt".to_string()],
        };
        assert!(!conflict.is_not_found());
        assert!(conflict.is_conflict());

        let exists = StorageError::BranchAlreadyExists(BranchName::main());
        assert!(exists.is_already_exists());

        assert!(StorageError::NothingToCommit.is_invalid_argument());
        assert_eq!(
            StorageError::AmbiguousHash { prefix: "ab".into(), matches: 2 }.kind(),
            ErrorKind::Ambiguous
        );
        assert!(StorageError::corrupted(".kirin-index", "bad version").is_corrupt());
    }

    #[test]
    fn test_invalid_name_converts() {
        let err: StorageError = InvalidNameError::Empty.into();
        assert!(err.is_invalid_argument());
        assert_eq!(err.to_string(), "invalid name: name cannot be empty");
    }
}
