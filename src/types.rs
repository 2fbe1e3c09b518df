//! Core data types used throughout the Rewind library
//!
//! This module contains the value types shared by the chain reader, the
//! history model, the path resolver and the archive streamer.
//!
//! ## Overview
//!
//! - **Time**: [`Timestamp`] - whole seconds since the Unix epoch, the key of
//!   every increment
//! - **History**: [`SessionStatistics`], [`HistoryEntry`] - per-backup counters
//!   and their time-ordered projection
//! - **Restore**: [`RestoreRequest`], [`RestoreOptions`], [`ArchiveKind`],
//!   [`RestoreReport`], [`RestorePhase`] - parameters and outcome of a restore
//! - **Repository**: [`RepositoryInfo`], [`RepositoryStatus`] - summary for
//!   listings
//! - **Configuration**: [`RewindConfig`] - tunables for streaming and lookup
//!
//! ## Examples
//!
//! ```rust
//! use rewind::types::{ArchiveKind, RestoreRequest, Timestamp};
//!
//! let request = RestoreRequest::new("docs/report.txt", Timestamp::new(1_700_000_000), ArchiveKind::TarGz)
//!     .exclude(vec!["*.tmp".to_string()]);
//! assert_eq!(request.kind.extension(), "tar.gz");
//! ```

use crate::error::{Result, RewindError};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// Point in time of a backup, in whole seconds since the Unix epoch
///
/// Timestamps are the identity of increments: no two increments of one
/// repository share a timestamp, and increments are totally ordered by it.
///
/// # Examples
///
/// ```rust
/// use rewind::types::Timestamp;
///
/// let ts: Timestamp = "1700000000".parse()?;
/// assert_eq!(ts.as_secs(), 1_700_000_000);
/// assert_eq!(ts.to_string(), "2023-11-14 22:13:20");
///
/// let same: Timestamp = "2023-11-14T22:13:20Z".parse()?;
/// assert_eq!(ts, same);
/// # Ok::<(), rewind::RewindError>(())
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(i64);

impl Timestamp {
    /// Create a timestamp from seconds since the epoch
    pub const fn new(secs: i64) -> Self {
        Self(secs)
    }

    /// Current wall-clock time, truncated to whole seconds
    pub fn now() -> Self {
        Self(Utc::now().timestamp())
    }

    /// Seconds since the epoch
    pub const fn as_secs(self) -> i64 {
        self.0
    }

    /// Convert to a UTC date-time, if representable
    pub fn to_datetime(self) -> Option<DateTime<Utc>> {
        Utc.timestamp_opt(self.0, 0).single()
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(dt: DateTime<Utc>) -> Self {
        Self(dt.timestamp())
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_datetime() {
            Some(dt) => write!(f, "{}", dt.format("%Y-%m-%d %H:%M:%S")),
            None => write!(f, "{}", self.0),
        }
    }
}

impl FromStr for Timestamp {
    type Err = RewindError;

    /// Accepts whole seconds since the epoch or an RFC 3339 date-time
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if let Ok(secs) = s.parse::<i64>() {
            return Ok(Self(secs));
        }
        DateTime::parse_from_rfc3339(s)
            .map(|dt| Self(dt.timestamp()))
            .map_err(|_| RewindError::InvalidDate(s.to_string()))
    }
}

/// Aggregate counters recorded by one backup run
///
/// These are stored verbatim with each increment; nothing in this crate
/// recomputes them. Missing fields in the stored record default to zero.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionStatistics {
    /// Run start, seconds since the epoch
    pub start_time: f64,
    /// Run end, seconds since the epoch
    pub end_time: f64,
    /// Wall-clock duration in seconds
    pub elapsed_time: f64,
    /// Files seen in the source tree
    pub source_files: u64,
    /// Total size of the source tree
    pub source_file_size: u64,
    /// Files in the mirror after the run
    pub mirror_files: u64,
    /// Total size of the mirror after the run
    pub mirror_file_size: u64,
    /// Files added by the run
    pub new_files: u64,
    /// Bytes added by the run
    pub new_file_size: u64,
    /// Files removed by the run
    pub deleted_files: u64,
    /// Bytes removed by the run
    pub deleted_file_size: u64,
    /// Files modified by the run
    pub changed_files: u64,
    /// Source-side size of modified files
    pub changed_source_size: u64,
    /// Mirror-side size of modified files
    pub changed_mirror_size: u64,
    /// Increment files written
    pub increment_files: u64,
    /// Size of increment files written
    pub increment_file_size: u64,
    /// Net change of the destination size
    pub total_destination_size_change: i64,
    /// Errors reported by the run
    pub errors: u64,
}

impl SessionStatistics {
    /// Column names of the delimited statistics export, in output order
    pub const CSV_ATTRIBUTES: [&'static str; 18] = [
        "starttime",
        "endtime",
        "elapsedtime",
        "sourcefiles",
        "sourcefilesize",
        "mirrorfiles",
        "mirrorfilesize",
        "newfiles",
        "newfilesize",
        "deletedfiles",
        "deletedfilesize",
        "changedfiles",
        "changedsourcesize",
        "changedmirrorsize",
        "incrementfiles",
        "incrementfilesize",
        "totaldestinationsizechange",
        "errors",
    ];

    /// Values in [`Self::CSV_ATTRIBUTES`] order
    pub fn csv_values(&self) -> [String; 18] {
        [
            self.start_time.to_string(),
            self.end_time.to_string(),
            self.elapsed_time.to_string(),
            self.source_files.to_string(),
            self.source_file_size.to_string(),
            self.mirror_files.to_string(),
            self.mirror_file_size.to_string(),
            self.new_files.to_string(),
            self.new_file_size.to_string(),
            self.deleted_files.to_string(),
            self.deleted_file_size.to_string(),
            self.changed_files.to_string(),
            self.changed_source_size.to_string(),
            self.changed_mirror_size.to_string(),
            self.increment_files.to_string(),
            self.increment_file_size.to_string(),
            self.total_destination_size_change.to_string(),
            self.errors.to_string(),
        ]
    }
}

/// One restorable point in a repository's history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// When the backup completed
    pub timestamp: Timestamp,
    /// Whether this is the base snapshot of the chain
    pub is_base: bool,
    /// Counters recorded by that backup run
    pub statistics: SessionStatistics,
}

/// Container format of a restore
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ArchiveKind {
    /// Zip archive (default)
    #[default]
    #[serde(rename = "zip")]
    Zip,
    /// Gzip-compressed tarball
    #[serde(rename = "tar.gz")]
    TarGz,
}

impl ArchiveKind {
    /// File extension without the leading dot
    pub fn extension(self) -> &'static str {
        match self {
            ArchiveKind::Zip => "zip",
            ArchiveKind::TarGz => "tar.gz",
        }
    }

    /// MIME type suitable for a Content-Type header
    pub fn mime_type(self) -> &'static str {
        match self {
            ArchiveKind::Zip => "application/zip",
            ArchiveKind::TarGz => "application/gzip",
        }
    }
}

impl fmt::Display for ArchiveKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for ArchiveKind {
    type Err = RewindError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "zip" => Ok(ArchiveKind::Zip),
            "tar.gz" | "tgz" => Ok(ArchiveKind::TarGz),
            other => Err(RewindError::InvalidConfiguration(format!(
                "unknown archive kind {:?}, expected \"zip\" or \"tar.gz\"",
                other
            ))),
        }
    }
}

/// Options controlling what goes into a restore archive
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreOptions {
    /// Glob patterns matched against repository-relative paths; matching
    /// entries (and everything below a matching directory) are skipped
    pub exclude_patterns: Vec<String>,
}

/// A single restore call
///
/// Constructed per call and discarded once the stream completes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreRequest {
    /// Repository-relative path; empty for the repository root
    pub path: String,
    /// Point in time to restore
    pub timestamp: Timestamp,
    /// Container format
    pub kind: ArchiveKind,
    /// Additional options
    #[serde(default)]
    pub options: RestoreOptions,
}

impl RestoreRequest {
    /// Create a request with default options
    pub fn new(path: impl Into<String>, timestamp: Timestamp, kind: ArchiveKind) -> Self {
        Self {
            path: path.into(),
            timestamp,
            kind,
            options: RestoreOptions::default(),
        }
    }

    /// Skip entries matching these glob patterns
    pub fn exclude(mut self, patterns: Vec<String>) -> Self {
        self.options.exclude_patterns = patterns;
        self
    }
}

/// Lifecycle of a restore operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RestorePhase {
    /// Request accepted, nothing read yet
    Requested,
    /// Locating the path in the increment chain
    Resolving,
    /// Archive bytes are being produced
    Streaming,
    /// Archive finished cleanly
    Completed,
    /// Archive stopped early (consumer gone or fatal error)
    Aborted,
}

impl RestorePhase {
    /// Whether the restore has reached a terminal state
    pub fn is_terminal(self) -> bool {
        matches!(self, RestorePhase::Completed | RestorePhase::Aborted)
    }
}

/// An archive entry replaced by a placeholder
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryFailure {
    /// Repository-relative path of the entry
    pub path: String,
    /// Why the content could not be rebuilt
    pub reason: String,
}

/// Outcome of an archive stream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreReport {
    /// Container format that was produced
    pub kind: ArchiveKind,
    /// File entries written (placeholders included)
    pub files_written: usize,
    /// Directory entries visited
    pub directories_written: usize,
    /// Reconstructed content bytes handed to the encoder
    pub bytes_written: u64,
    /// Encoded archive bytes delivered to the consumer channel
    pub archive_bytes: u64,
    /// Entries that were replaced by placeholders
    pub failures: Vec<EntryFailure>,
    /// Terminal phase of the stream
    pub phase: RestorePhase,
    /// Fatal error that aborted the stream, if any
    pub error: Option<String>,
    /// Whether the consumer stopped reading before the end
    pub cancelled: bool,
    /// Duration of the stream in milliseconds
    pub duration_ms: u64,
}

impl RestoreReport {
    pub(crate) fn new(kind: ArchiveKind) -> Self {
        Self {
            kind,
            files_written: 0,
            directories_written: 0,
            bytes_written: 0,
            archive_bytes: 0,
            failures: Vec::new(),
            phase: RestorePhase::Streaming,
            error: None,
            cancelled: false,
            duration_ms: 0,
        }
    }

    /// Whether the archive ended cleanly with every entry intact
    pub fn is_complete(&self) -> bool {
        self.phase == RestorePhase::Completed && self.failures.is_empty()
    }
}

/// Health of a repository as seen by the reader
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepositoryStatus {
    /// Chain readable, no backup running
    Ok,
    /// A backup is being written
    InProgress,
    /// Chain cannot be read
    Failed(String),
}

impl RepositoryStatus {
    /// Short status keyword
    pub fn as_str(&self) -> &'static str {
        match self {
            RepositoryStatus::Ok => "ok",
            RepositoryStatus::InProgress => "in_progress",
            RepositoryStatus::Failed(_) => "failed",
        }
    }
}

/// Summary of a repository for listings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepositoryInfo {
    /// Directory name of the repository root
    pub name: String,
    /// Name shown to users (name without a trailing slash)
    pub display_name: String,
    /// Timestamp of the newest readable backup
    pub last_backup_date: Option<Timestamp>,
    /// Current status
    pub status: RepositoryStatus,
    /// Number of restorable points
    pub increment_count: usize,
}

/// Configuration for a [`crate::Rewind`] instance
///
/// # Examples
///
/// ```rust
/// use rewind::types::RewindConfig;
///
/// let config = RewindConfig {
///     chunk_size: 16 * 1024,
///     exact_time_match: true,
///     ..Default::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RewindConfig {
    /// Size of each archive chunk handed to the consumer
    pub chunk_size: usize,
    /// Number of chunks buffered between producer and consumer
    pub channel_capacity: usize,
    /// Deepest directory nesting walked by an archive
    pub max_tree_depth: usize,
    /// Gzip level for tar.gz archives (0-9)
    pub gzip_level: u32,
    /// Deflate zip entries instead of storing them
    pub zip_deflate: bool,
    /// Only accept timestamps of recorded backups
    pub exact_time_match: bool,
    /// Verify object hashes while reading
    pub verify_objects: bool,
    /// Share parsed chains through the process-wide cache
    pub use_global_cache: bool,
}

impl Default for RewindConfig {
    fn default() -> Self {
        Self {
            chunk_size: 64 * 1024,
            channel_capacity: 16,
            max_tree_depth: 256,
            gzip_level: 6,
            zip_deflate: true,
            exact_time_match: false,
            verify_objects: true,
            use_global_cache: true,
        }
    }
}

impl RewindConfig {
    /// Load a configuration from a JSON file
    ///
    /// Missing fields take their default values.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, is not valid JSON, or
    /// holds out-of-range values.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: RewindConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check that every value is usable
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(RewindError::InvalidConfiguration("chunk_size must be positive".to_string()));
        }
        if self.channel_capacity == 0 {
            return Err(RewindError::InvalidConfiguration(
                "channel_capacity must be positive".to_string(),
            ));
        }
        if self.max_tree_depth == 0 {
            return Err(RewindError::InvalidConfiguration(
                "max_tree_depth must be positive".to_string(),
            ));
        }
        if self.gzip_level > 9 {
            return Err(RewindError::InvalidConfiguration(format!(
                "gzip_level must be between 0 and 9, got {}",
                self.gzip_level
            )));
        }
        Ok(())
    }
}
