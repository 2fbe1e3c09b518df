//! Increments and their per-path deltas
//!
//! An increment is the immutable record one backup run left behind: a header
//! with its timestamp, its predecessor and its statistics, plus the set of
//! paths it touched. Headers are small and read eagerly when a chain is
//! loaded; the delta set can be large and is only read the first time a
//! path lookup needs it.
//!
//! ## Delta format
//!
//! ```json
//! {
//!   "entries": {
//!     "docs": { "change": "added", "kind": "directory", "mode": 493 },
//!     "docs/a.txt": {
//!       "change": "changed", "kind": "file", "size": 11, "mode": 420,
//!       "mtime": 1700000000, "content": { "diff": "9f86d0..." }
//!     }
//!   }
//! }
//! ```
//!
//! File content is referenced either as a full copy (`snapshot`) or as an
//! rsync-style delta against the previous version (`diff`). A
//! [`ContentPlan`] lists the objects needed to rebuild one version and
//! applies them in order.

use crate::error::{Result, RewindError};
use crate::repository::{DELTAS_FILE, HEADER_FILE};
use crate::storage::ObjectStore;
use crate::types::{SessionStatistics, Timestamp};
use crate::utils::{parent_and_name, validate_path};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, trace};

/// What an increment did to a path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    /// Path appeared
    Added,
    /// Content changed
    Changed,
    /// Path was removed
    Deleted,
    /// Only permissions or times changed
    Metadata,
}

/// Type of a path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    /// Regular file
    File,
    /// Directory
    Directory,
}

/// Where the content of a file version is stored
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentRef {
    /// Full copy of the content
    Snapshot(String),
    /// Delta against the previous version
    Diff(String),
}

impl ContentRef {
    /// Object id referenced
    pub fn object(&self) -> &str {
        match self {
            ContentRef::Snapshot(hash) | ContentRef::Diff(hash) => hash,
        }
    }
}

fn default_mode() -> u32 {
    0o644
}

/// One path's change within an increment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathDelta {
    /// What happened
    pub change: ChangeKind,
    /// Type of the path after the change (or before, for deletions)
    pub kind: EntryKind,
    /// Content size after the change
    #[serde(default)]
    pub size: u64,
    /// Unix permission bits
    #[serde(default = "default_mode")]
    pub mode: u32,
    /// Modification time, seconds since the epoch
    #[serde(default)]
    pub mtime: i64,
    /// Content reference for added or changed files
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<ContentRef>,
}

impl PathDelta {
    /// A file version stored as a full copy
    pub fn file(change: ChangeKind, size: u64, snapshot: impl Into<String>) -> Self {
        Self {
            change,
            kind: EntryKind::File,
            size,
            mode: default_mode(),
            mtime: 0,
            content: Some(ContentRef::Snapshot(snapshot.into())),
        }
    }

    /// A file version stored as a diff against the previous one
    pub fn file_diff(size: u64, diff: impl Into<String>) -> Self {
        Self {
            change: ChangeKind::Changed,
            kind: EntryKind::File,
            size,
            mode: default_mode(),
            mtime: 0,
            content: Some(ContentRef::Diff(diff.into())),
        }
    }

    /// A directory change
    pub fn directory(change: ChangeKind) -> Self {
        Self {
            change,
            kind: EntryKind::Directory,
            size: 0,
            mode: 0o755,
            mtime: 0,
            content: None,
        }
    }

    /// Removal of a path
    pub fn deleted(kind: EntryKind) -> Self {
        Self {
            change: ChangeKind::Deleted,
            kind,
            size: 0,
            mode: default_mode(),
            mtime: 0,
            content: None,
        }
    }

    /// Set permission bits
    pub fn with_mode(mut self, mode: u32) -> Self {
        self.mode = mode;
        self
    }

    /// Set modification time
    pub fn with_mtime(mut self, mtime: i64) -> Self {
        self.mtime = mtime;
        self
    }

    /// Whether the path exists after this change
    pub fn is_present(&self) -> bool {
        self.change != ChangeKind::Deleted
    }
}

/// On-disk shape of `deltas.json`
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct DeltaFile {
    /// Deltas keyed by repository-relative path
    pub entries: BTreeMap<String, PathDelta>,
}

/// All deltas of one increment, indexed by path and by parent directory
#[derive(Debug, Default)]
pub struct DeltaSet {
    entries: BTreeMap<String, PathDelta>,
    children: HashMap<String, BTreeSet<String>>,
}

impl DeltaSet {
    /// Build a delta set, validating every path
    ///
    /// # Errors
    ///
    /// Returns [`RewindError::CorruptChain`] if a key is not a normalized,
    /// non-empty relative path.
    pub fn new(entries: BTreeMap<String, PathDelta>) -> Result<Self> {
        let mut children: HashMap<String, BTreeSet<String>> = HashMap::new();
        for path in entries.keys() {
            if path.is_empty() || validate_path(path).is_err() {
                return Err(RewindError::corrupt_chain(format!("invalid delta path {:?}", path)));
            }
            let (parent, name) = parent_and_name(path);
            children.entry(parent.to_string()).or_default().insert(name.to_string());
        }
        Ok(Self { entries, children })
    }

    /// Delta recorded for a path, if any
    pub fn get(&self, path: &str) -> Option<&PathDelta> {
        self.entries.get(path)
    }

    /// Names of direct children of `dir` touched by this increment
    pub fn children_of<'a>(&'a self, dir: &str) -> impl Iterator<Item = &'a str> + 'a {
        self.children
            .get(dir)
            .into_iter()
            .flat_map(|names| names.iter().map(String::as_str))
    }

    /// Iterate over all deltas in path order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &PathDelta)> {
        self.entries.iter().map(|(path, delta)| (path.as_str(), delta))
    }

    /// Number of touched paths
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the increment touched nothing
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Header of an increment, stored in `increment.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncrementHeader {
    /// Completion time of the backup run
    pub timestamp: Timestamp,
    /// Timestamp of the previous increment; `None` for the base snapshot
    #[serde(default)]
    pub parent: Option<Timestamp>,
    /// Counters recorded by the run
    #[serde(default)]
    pub statistics: SessionStatistics,
}

/// An immutable increment with lazily loaded deltas
#[derive(Debug)]
pub struct Increment {
    header: IncrementHeader,
    dir: Option<PathBuf>,
    deltas: Mutex<Option<Arc<DeltaSet>>>,
}

impl Increment {
    /// Read an increment header from its directory
    ///
    /// Deltas are not read until [`Increment::deltas`] is called.
    ///
    /// # Errors
    ///
    /// Returns [`RewindError::CorruptChain`] if the header is missing or
    /// unparsable.
    pub fn open(dir: &Path) -> Result<Self> {
        let header_path = dir.join(HEADER_FILE);
        let content = fs::read(&header_path)
            .map_err(|e| RewindError::corrupt_chain(format!("cannot read {:?}: {}", header_path, e)))?;
        let header: IncrementHeader = serde_json::from_slice(&content)
            .map_err(|e| RewindError::corrupt_chain(format!("cannot parse {:?}: {}", header_path, e)))?;

        trace!("Read increment header {}", header.timestamp.as_secs());
        Ok(Self {
            header,
            dir: Some(dir.to_path_buf()),
            deltas: Mutex::new(None),
        })
    }

    /// Build an increment whose deltas are already in memory
    pub fn in_memory(header: IncrementHeader, deltas: DeltaSet) -> Self {
        Self {
            header,
            dir: None,
            deltas: Mutex::new(Some(Arc::new(deltas))),
        }
    }

    /// Header of this increment
    pub fn header(&self) -> &IncrementHeader {
        &self.header
    }

    /// Timestamp of this increment
    pub fn timestamp(&self) -> Timestamp {
        self.header.timestamp
    }

    /// Timestamp of the previous increment
    pub fn parent(&self) -> Option<Timestamp> {
        self.header.parent
    }

    /// Recorded statistics
    pub fn statistics(&self) -> &SessionStatistics {
        &self.header.statistics
    }

    /// Whether the deltas have been read
    pub fn is_loaded(&self) -> bool {
        self.deltas.lock().is_some()
    }

    /// Deltas of this increment, read from disk on first use
    ///
    /// # Errors
    ///
    /// Returns [`RewindError::CorruptChain`] if the delta file is missing or
    /// unparsable.
    pub fn deltas(&self) -> Result<Arc<DeltaSet>> {
        let mut slot = self.deltas.lock();
        if let Some(deltas) = slot.as_ref() {
            return Ok(Arc::clone(deltas));
        }

        let dir = self.dir.as_ref().ok_or_else(|| {
            RewindError::internal(format!("increment {} has no delta source", self.timestamp().as_secs()))
        })?;
        let deltas_path = dir.join(DELTAS_FILE);
        let content = fs::read(&deltas_path)
            .map_err(|e| RewindError::corrupt_chain(format!("cannot read {:?}: {}", deltas_path, e)))?;
        let file: DeltaFile = serde_json::from_slice(&content)
            .map_err(|e| RewindError::corrupt_chain(format!("cannot parse {:?}: {}", deltas_path, e)))?;
        let deltas = Arc::new(DeltaSet::new(file.entries)?);

        debug!(
            "Loaded {} deltas for increment {}",
            deltas.len(),
            self.timestamp().as_secs()
        );
        *slot = Some(Arc::clone(&deltas));
        Ok(deltas)
    }
}

/// Objects needed to rebuild one version of a file
///
/// `base` is the nearest full copy at or before the version (or `None` when
/// the file started out empty); `diffs` are applied to it oldest first.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContentPlan {
    /// Repository-relative path, for error reporting
    pub path: String,
    /// Full copy the diffs start from
    pub base: Option<String>,
    /// Diffs in chain order
    pub diffs: Vec<String>,
    /// Expected size of the rebuilt content
    pub size: u64,
}

impl ContentPlan {
    /// All object ids referenced by this plan
    pub fn objects(&self) -> impl Iterator<Item = &str> {
        self.base.iter().chain(self.diffs.iter()).map(String::as_str)
    }

    /// Rebuild the file content
    ///
    /// Holds at most two versions of the file in memory at a time.
    ///
    /// # Errors
    ///
    /// - Object store errors for missing or corrupt objects
    /// - [`RewindError::Delta`] if a diff does not apply
    /// - [`RewindError::CorruptContent`] if the result has the wrong size
    pub fn reconstruct(&self, store: &ObjectStore) -> Result<Vec<u8>> {
        let mut content = match &self.base {
            Some(hash) => store.load_object(hash)?,
            None => Vec::new(),
        };

        for hash in &self.diffs {
            let delta = store.load_object(hash)?;
            content = apply_diff(&content, &delta)?;
        }

        if content.len() as u64 != self.size {
            return Err(RewindError::corrupt_content(
                self.path.clone(),
                format!("rebuilt {} bytes, expected {}", content.len(), self.size),
            ));
        }

        trace!(
            "Rebuilt {:?} from {} object(s), {} bytes",
            self.path,
            self.diffs.len() + usize::from(self.base.is_some()),
            content.len()
        );
        Ok(content)
    }
}

/// Apply an rsync-style delta to a base version
pub fn apply_diff(base: &[u8], delta: &[u8]) -> Result<Vec<u8>> {
    let mut output = Vec::with_capacity(base.len());
    fast_rsync::apply(base, delta, &mut output).map_err(|e| RewindError::Delta(e.to_string()))?;
    Ok(output)
}
