//! Repository handle and on-disk layout
//!
//! A repository is a backup destination written by an external backup
//! process. Everything this crate reads lives under its data directory:
//!
//! ```text
//! <root>/
//! └── rewind-data/
//!     ├── current_mirror.<ts>.data   # one per completed head
//!     ├── increments/<ts>/
//!     │   ├── increment.json         # header + statistics
//!     │   └── deltas.json            # per-path deltas
//!     └── objects/                   # content-addressable blobs
//! ```
//!
//! The backup process adds a second `current_mirror` marker when it starts
//! writing a new increment and removes the older one when it finishes, so two
//! or more markers mean a backup is in progress.

use crate::error::{Result, RewindError};
use crate::types::Timestamp;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

/// Name of the data directory inside a repository root
pub const DATA_DIR: &str = "rewind-data";
/// Directory holding one sub-directory per increment
pub const INCREMENTS_DIR: &str = "increments";
/// Directory holding content objects
pub const OBJECTS_DIR: &str = "objects";
/// Per-increment header file
pub const HEADER_FILE: &str = "increment.json";
/// Per-increment delta file
pub const DELTAS_FILE: &str = "deltas.json";

const MARKER_PREFIX: &str = "current_mirror.";
const MARKER_SUFFIX: &str = ".data";

const SECONDS_PER_DAY: i64 = 24 * 60 * 60;

/// Handle on a repository root
///
/// Opening a repository only checks that its data directory exists; the
/// increment chain is read by [`crate::chain::IncrementChain::load`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Repository {
    root: PathBuf,
    name: String,
}

impl Repository {
    /// Open a repository root
    ///
    /// # Errors
    ///
    /// Returns [`RewindError::RepositoryNotFound`] if the root or its data
    /// directory does not exist.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        if !root.join(DATA_DIR).is_dir() {
            return Err(RewindError::RepositoryNotFound(root));
        }

        let name = root
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| root.to_string_lossy().to_string());

        debug!("Opened repository {:?} at {:?}", name, root);
        Ok(Self { root, name })
    }

    /// Repository root
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory name of the repository
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name shown to users
    pub fn display_name(&self) -> String {
        self.name.trim_matches('/').to_string()
    }

    /// `rewind-data` directory
    pub fn data_dir(&self) -> PathBuf {
        self.root.join(DATA_DIR)
    }

    /// Directory holding increment sub-directories
    pub fn increments_dir(&self) -> PathBuf {
        self.data_dir().join(INCREMENTS_DIR)
    }

    /// Directory holding content objects
    pub fn objects_dir(&self) -> PathBuf {
        self.data_dir().join(OBJECTS_DIR)
    }

    /// Timestamps of all `current_mirror` markers, oldest first
    ///
    /// # Errors
    ///
    /// Returns [`RewindError::CorruptChain`] if a marker name does not carry
    /// an integer timestamp.
    pub fn mirror_markers(&self) -> Result<Vec<Timestamp>> {
        let data_dir = self.data_dir();
        let entries = fs::read_dir(&data_dir).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => RewindError::RepositoryNotFound(self.root.clone()),
            _ => RewindError::Io(e),
        })?;

        let mut markers = Vec::new();
        for entry in entries {
            let entry = entry?;
            let file_name = entry.file_name();
            let file_name = file_name.to_string_lossy();
            if let Some(ts) = parse_marker(&file_name)? {
                markers.push(ts);
            }
        }

        markers.sort();
        trace!("Mirror markers for {:?}: {:?}", self.name, markers);
        Ok(markers)
    }

    /// Whether a backup is currently being written
    ///
    /// Read from disk on every call.
    pub fn in_progress(&self) -> Result<bool> {
        Ok(self.mirror_markers()?.len() > 1)
    }
}

/// Parse a `current_mirror.<ts>.data` file name
///
/// Returns `Ok(None)` for unrelated file names.
fn parse_marker(file_name: &str) -> Result<Option<Timestamp>> {
    let Some(rest) = file_name.strip_prefix(MARKER_PREFIX) else {
        return Ok(None);
    };
    let Some(ts) = rest.strip_suffix(MARKER_SUFFIX) else {
        return Ok(None);
    };
    ts.parse::<i64>()
        .map(|secs| Some(Timestamp::new(secs)))
        .map_err(|_| RewindError::corrupt_chain(format!("unparsable mirror marker {:?}", file_name)))
}

/// File name of the marker for a head timestamp
pub fn marker_file_name(ts: Timestamp) -> String {
    format!("{}{}{}", MARKER_PREFIX, ts.as_secs(), MARKER_SUFFIX)
}

/// Whether a repository has been backed up recently enough
///
/// `max_age_days <= 0` disables the check. A repository without any
/// readable backup is never active.
pub fn check_activity(last_backup: Option<Timestamp>, max_age_days: i64, now: Timestamp) -> bool {
    if max_age_days <= 0 {
        return true;
    }
    match last_backup {
        Some(last) => now.as_secs() - last.as_secs() <= max_age_days.saturating_mul(SECONDS_PER_DAY),
        None => false,
    }
}
