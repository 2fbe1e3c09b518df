//! Error types for the Rewind library
//!
//! Every fallible operation in the crate returns [`Result`], whose error side
//! is [`RewindError`]. Variants fall into a few families that callers treat
//! differently:
//!
//! - **Structural**: the repository or its increment chain cannot be read
//!   (`RepositoryNotFound`, `CorruptChain`). Fatal, never retried.
//! - **Caller input**: the requested path or time does not exist in the chain
//!   (`InvalidTimestamp`, `NoSuchTime`, `NoSuchPath`, `InvalidPath`).
//! - **Transient**: a backup is being written (`BackupInProgress`). The caller
//!   may retry later.
//! - **Entry-local**: one file's content could not be rebuilt (`ObjectNotFound`,
//!   `ObjectUnreadable`, `HashMismatch`, `Decompression`, `Delta`,
//!   `CorruptContent`). While an archive is streaming these degrade to a
//!   placeholder entry.
//! - **Stream**: the archive could not be completed (`FatalStream`).

use crate::types::Timestamp;
use std::path::PathBuf;
use thiserror::Error;

/// Type alias for Results in the Rewind library
pub type Result<T> = std::result::Result<T, RewindError>;

/// Main error type for all Rewind operations
#[derive(Debug, Error)]
pub enum RewindError {
    /// I/O errors during file operations
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Errors during JSON serialization/deserialization
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Walk directory error from walkdir crate
    #[error("Walk directory error: {0}")]
    WalkDir(#[from] walkdir::Error),

    /// Repository root does not exist or has no backup data
    #[error("Repository not found: {0:?}")]
    RepositoryNotFound(PathBuf),

    /// On-disk increment chain is unreadable or inconsistent
    #[error("Corrupt increment chain: {0}")]
    CorruptChain(String),

    /// Requested time is older than the base snapshot
    #[error("Invalid timestamp {requested}: the oldest backup is {base}")]
    InvalidTimestamp {
        /// Requested point in time
        requested: Timestamp,
        /// Timestamp of the base snapshot
        base: Timestamp,
    },

    /// A date could not be parsed
    #[error("Invalid date: {0:?}")]
    InvalidDate(String),

    /// Requested time does not match any recorded backup
    #[error("No backup recorded at {0}")]
    NoSuchTime(Timestamp),

    /// Path never existed in the chain up to the requested time
    #[error("No such path {path:?} at {timestamp}")]
    NoSuchPath {
        /// Repository-relative path
        path: String,
        /// Point in time that was resolved
        timestamp: Timestamp,
    },

    /// Path is not a normalized repository-relative path
    #[error("Invalid path: {0:?}")]
    InvalidPath(String),

    /// A backup is currently being written to the repository
    #[error("A backup is currently in progress to {0:?}. Restores are disabled until this backup is complete.")]
    BackupInProgress(PathBuf),

    /// One archive entry could not be reconstructed
    #[error("Could not reconstruct {path:?}: {reason}")]
    PartialReconstruction {
        /// Repository-relative path of the failed entry
        path: String,
        /// Underlying failure
        reason: String,
    },

    /// Archive stream aborted before completion
    #[error("Archive stream aborted: {0}")]
    FatalStream(String),

    /// A file's recorded history cannot yield its content
    #[error("Corrupt content for {path:?}: {reason}")]
    CorruptContent {
        /// Repository-relative path
        path: String,
        /// What is wrong with the recorded history
        reason: String,
    },

    /// Object not found in the object store
    #[error("Object not found: {0}")]
    ObjectNotFound(String),

    /// Object exists but could not be read
    #[error("Cannot read object {hash}: {reason}")]
    ObjectUnreadable {
        /// Object id
        hash: String,
        /// Underlying I/O failure
        reason: String,
    },

    /// Hash mismatch while reading an object
    #[error("Hash mismatch - expected: {expected}, actual: {actual}")]
    HashMismatch {
        /// Expected hash value
        expected: String,
        /// Actual computed hash value
        actual: String,
    },

    /// Decompression errors
    #[error("Decompression error: {0}")]
    Decompression(String),

    /// A stored diff could not be applied
    #[error("Delta application failed: {0}")]
    Delta(String),

    /// Archive encoder failure
    #[error("Archive error: {0}")]
    Archive(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Pattern parsing error
    #[error("Invalid exclude pattern: {0}")]
    InvalidPattern(String),

    /// Generic error for unexpected conditions
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<zip::result::ZipError> for RewindError {
    fn from(err: zip::result::ZipError) -> Self {
        match err {
            zip::result::ZipError::Io(io) => RewindError::Io(io),
            other => RewindError::Archive(other.to_string()),
        }
    }
}

impl From<globset::Error> for RewindError {
    fn from(err: globset::Error) -> Self {
        RewindError::InvalidPattern(err.to_string())
    }
}

impl RewindError {
    /// Create a corrupt chain error with a custom message
    pub fn corrupt_chain(msg: impl Into<String>) -> Self {
        RewindError::CorruptChain(msg.into())
    }

    /// Create a corrupt content error for a path
    pub fn corrupt_content(path: impl Into<String>, reason: impl Into<String>) -> Self {
        RewindError::CorruptContent {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create a decompression error with a custom message
    pub fn decompression(msg: impl Into<String>) -> Self {
        RewindError::Decompression(msg.into())
    }

    /// Create an internal error with a custom message
    pub fn internal(msg: impl Into<String>) -> Self {
        RewindError::Internal(msg.into())
    }

    /// Check if this error is recoverable by retrying later
    pub fn is_recoverable(&self) -> bool {
        matches!(self, RewindError::BackupInProgress(_))
    }

    /// Check if this error was caused by the request rather than the repository
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            RewindError::InvalidTimestamp { .. }
                | RewindError::InvalidDate(_)
                | RewindError::NoSuchTime(_)
                | RewindError::NoSuchPath { .. }
                | RewindError::InvalidPath(_)
                | RewindError::InvalidPattern(_)
        )
    }

    /// Check if this error indicates corruption
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            RewindError::CorruptChain(_)
                | RewindError::CorruptContent { .. }
                | RewindError::HashMismatch { .. }
                | RewindError::Decompression(_)
                | RewindError::Delta(_)
        )
    }

    /// Check if this error only affects a single archive entry
    ///
    /// Entry-local failures are turned into placeholder entries while an
    /// archive is streaming; anything else aborts the stream.
    pub fn is_entry_local(&self) -> bool {
        matches!(
            self,
            RewindError::ObjectNotFound(_)
                | RewindError::ObjectUnreadable { .. }
                | RewindError::HashMismatch { .. }
                | RewindError::Decompression(_)
                | RewindError::Delta(_)
                | RewindError::CorruptContent { .. }
                | RewindError::PartialReconstruction { .. }
        )
    }

    /// Get a user-friendly error message with suggestions
    pub fn user_message(&self) -> String {
        match self {
            RewindError::RepositoryNotFound(path) => {
                format!("No repository found at {:?}. Check the path points at a backup destination.", path)
            }
            RewindError::InvalidTimestamp { requested, base } => {
                format!(
                    "{} is before the first backup ({}). Use 'history' to list restorable dates.",
                    requested, base
                )
            }
            RewindError::NoSuchTime(ts) => {
                format!("No backup was taken at {}. Use 'history' to list restorable dates.", ts)
            }
            RewindError::NoSuchPath { path, timestamp } => {
                format!("{:?} did not exist at {}. Try an earlier or later date.", path, timestamp)
            }
            RewindError::BackupInProgress(_) => {
                "A backup is currently in progress to this repository. Restores are disabled until this backup is complete.".to_string()
            }
            RewindError::CorruptChain(msg) => {
                format!("The backup history is damaged ({}). Run 'verify' for details.", msg)
            }
            _ => self.to_string(),
        }
    }
}
