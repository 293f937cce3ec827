//! core type-safe wrappers for the storage layer.

use std::fmt;
use std::fmt::Formatter;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// length of a hex-encoded SHA-256 digest
pub const HASH_HEX_LEN: usize = 64;

fn validate_hex(value: &str) -> Result<(), InvalidNameError> {
    if value.len() != HASH_HEX_LEN
        || !value.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
    {
        return Err(InvalidNameError::InvalidHash(value.to_string()));
    }
    Ok(())
}

/// SHA-256 of some bytes, lowercase hex
pub(crate) fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Content hash of a blob: SHA-256 over its bytes, lowercase hex.
///
/// A blob hash and a commit hash are both 64 hex chars, but keeping them
/// as distinct types means we can't hand a file hash to checkout.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentHash(String);

impl ContentHash {
    /// hash some content
    pub fn of(bytes: &[u8]) -> Self {
        Self(sha256_hex(bytes))
    }

    /// parse a full 64-char hex digest
    pub fn from_hex(hex: &str) -> Result<Self, InvalidNameError> {
        validate_hex(hex)?;
        Ok(Self(hex.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// the two-level shard: (first two hex chars, remainder)
    pub fn shard(&self) -> (&str, &str) {
        self.0.split_at(2)
    }

    /// short form for log lines
    pub fn short(&self) -> &str {
        &self.0[..8]
    }
}

impl TryFrom<String> for ContentHash {
    type Error = InvalidNameError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        validate_hex(&value)?;
        Ok(Self(value))
    }
}

impl From<ContentHash> for String {
    fn from(hash: ContentHash) -> Self {
        hash.0
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Commit identifier (see `commit::compute_commit_hash`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CommitId(String);

impl CommitId {
    /// parse CommitId from a full hex string
    pub fn from_hex(hex: &str) -> Result<Self, InvalidNameError> {
        validate_hex(hex)?;
        Ok(Self(hex.to_string()))
    }

    pub(crate) fn from_digest(hex: String) -> Self {
        Self(hex)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// short form of the commit ID
    pub fn short(&self) -> &str {
        &self.0[..7]
    }
}

impl TryFrom<String> for CommitId {
    type Error = InvalidNameError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        validate_hex(&value)?;
        Ok(Self(value))
    }
}

impl From<CommitId> for String {
    fn from(id: CommitId) -> Self {
        id.0
    }
}

impl fmt::Display for CommitId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A validated file name inside a snapshot.
///
/// Snapshots are flat, so names can't contain path separators. Names under
/// the reserved `.kirin` prefix belong to the storage layout.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FileName(String);

impl FileName {
    /// prefix reserved for metadata objects
    pub const RESERVED_PREFIX: &'static str = ".kirin";

    pub fn new(name: impl Into<String>) -> Result<Self, InvalidNameError> {
        let name = name.into();
        Self::validate(&name)?;
        Ok(Self(name))
    }

    fn validate(name: &str) -> Result<(), InvalidNameError> {
        if name.is_empty() {
            return Err(InvalidNameError::Empty);
        }
        if name.len() > 255 {
            return Err(InvalidNameError::TooLong(name.len()));
        }
        if name == "." || name == ".." {
            return Err(InvalidNameError::InvalidPath(name.to_string()));
        }
        for (i, c) in name.chars().enumerate() {
            if c == '/' || c == '\\' || c == '\0' {
                return Err(InvalidNameError::InvalidCharacter { char: c, position: i });
            }
        }
        if name.starts_with(Self::RESERVED_PREFIX) {
            return Err(InvalidNameError::Reserved(name.to_string()));
        }
        Ok(())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for FileName {
    type Error = InvalidNameError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<FileName> for String {
    fn from(name: FileName) -> Self {
        name.0
    }
}

impl fmt::Display for FileName {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for FileName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A validated dataset name.
///
/// Valid names:
/// - 1-128 characters
/// - Alphanumeric, underscores, hyphens, dots
/// - Must start with a letter or digit
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DatasetName(String);

impl DatasetName {
    pub fn new(name: impl Into<String>) -> Result<Self, InvalidNameError> {
        let name = name.into();
        Self::validate(&name)?;
        Ok(Self(name))
    }

    fn validate(name: &str) -> Result<(), InvalidNameError> {
        let Some(first_char) = name.chars().next() else {
            return Err(InvalidNameError::Empty);
        };
        if name.len() > 128 {
            return Err(InvalidNameError::TooLong(name.len()));
        }
        if !first_char.is_ascii_alphanumeric() {
            return Err(InvalidNameError::InvalidStart(first_char));
        }
        for (i, c) in name.chars().enumerate() {
            if !c.is_ascii_alphanumeric() && c != '_' && c != '-' && c != '.' {
                return Err(InvalidNameError::InvalidCharacter { char: c, position: i });
            }
        }
        Ok(())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for DatasetName {
    type Error = InvalidNameError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<DatasetName> for String {
    fn from(name: DatasetName) -> Self {
        name.0
    }
}

impl fmt::Display for DatasetName {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// a branch name
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BranchName(String);

impl BranchName {
    /// the main branch name
    pub const MAIN: &'static str = "main";

    /// create a new BranchName
    pub fn new(name: impl Into<String>) -> Result<Self, InvalidNameError> {
        let name = name.into();
        if name.is_empty() {
            return Err(InvalidNameError::Empty);
        }
        if name.contains("..") || name.split('/').any(|part| part.is_empty() || part == ".") {
            return Err(InvalidNameError::InvalidPath(name));
        }
        if let Some((i, c)) = name
            .chars()
            .enumerate()
            .find(|(_, c)| c.is_whitespace() || c.is_control())
        {
            return Err(InvalidNameError::InvalidCharacter { char: c, position: i });
        }
        Ok(Self(name))
    }

    /// create the main branch reference
    pub fn main() -> Self {
        Self(Self::MAIN.to_string())
    }

    pub fn is_main(&self) -> bool {
        self.0 == Self::MAIN
    }

    /// Whether one name is a directory of the other (`team` and `team/x`).
    ///
    /// Refs are stored as paths, so such names can't coexist.
    pub fn nests_with(&self, other: &str) -> bool {
        let (a, b) = (self.as_str(), other);
        let nested = |outer: &str, inner: &str| {
            inner.len() > outer.len() && inner.starts_with(outer) && inner.as_bytes()[outer.len()] == b'/'
        };
        nested(a, b) || nested(b, a)
    }

    /// get the full ref path (e.g., "refs/heads/main")
    pub fn as_ref_path(&self) -> String {
        format!("refs/heads/{}", self.0)
    }

    /// get the short name
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for BranchName {
    type Error = InvalidNameError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<BranchName> for String {
    fn from(name: BranchName) -> Self {
        name.0
    }
}

impl fmt::Display for BranchName {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// error type for invalid names (files, branches, datasets, hashes)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidNameError {
    Empty,
    TooLong(usize),
    InvalidStart(char),
    InvalidCharacter { char: char, position: usize },
    Reserved(String),
    InvalidPath(String),
    InvalidHash(String),
}

impl fmt::Display for InvalidNameError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "name cannot be empty"),
            Self::TooLong(len) => write!(f, "name too long: {} characters", len),
            Self::InvalidStart(c) => write!(f, "name cannot start with '{}'", c),
            Self::InvalidCharacter { char, position } => {
                write!(f, "invalid character '{}' at position {}", char, position)
            }
            Self::Reserved(name) => write!(f, "'{}' uses a reserved prefix", name),
            Self::InvalidPath(path) => write!(f, "invalid path: '{}'", path),
            Self::InvalidHash(hash) => write!(f, "not a sha-256 hex digest: '{}'", hash),
        }
    }
}

impl std::error::Error for InvalidNameError {}

/// a change to one file between two snapshots
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub file: FileName,
    pub status: ChangeStatus,
}

/// the type of change in a snapshot diff
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeStatus {
    Added(ContentHash),
    Modified { old: ContentHash, new: ContentHash },
    Deleted(ContentHash),
}

impl ChangeStatus {
    /// the hash present after the change, if any
    pub fn new_hash(&self) -> Option<&ContentHash> {
        match self {
            ChangeStatus::Added(hash) => Some(hash),
            ChangeStatus::Modified { new, .. } => Some(new),
            ChangeStatus::Deleted(_) => None,
        }
    }
}
