//! Path resolution at a point in time
//!
//! Given a repository-relative path and a timestamp, the resolver finds the
//! increment in effect at that time (the newest one at or before it) and
//! walks backward from there, stopping at the first increment that recorded
//! something for the path. Increments after the requested time are never
//! consulted.
//!
//! ## Rules
//!
//! - A path whose newest delta is a deletion is [`PathState::Absent`].
//! - A path under a directory that was deleted, or replaced by a file, after
//!   the path was last touched is also absent.
//! - A path with no delta at all up to the resolved increment does not
//!   exist: [`RewindError::NoSuchPath`].
//! - The repository root (`""`) is always a directory.
//!
//! Directory children are the union of names recorded under the directory
//! across the visible increments, each resolved on its own and kept only if
//! present, sorted by name.
//!
//! ## Examples
//!
//! ```rust,no_run
//! use rewind::chain::IncrementChain;
//! use rewind::repository::Repository;
//! use rewind::resolver::{PathResolver, PathState};
//! use rewind::types::Timestamp;
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let chain = Arc::new(IncrementChain::load(&Repository::open("/backups/laptop")?)?);
//! let resolver = PathResolver::new(chain);
//!
//! match resolver.resolve("docs", Timestamp::new(1_700_000_000))? {
//!     PathState::Directory(dir) => {
//!         for child in &dir.children {
//!             println!("{} ({:?})", child.name, child.kind);
//!         }
//!     }
//!     PathState::File(file) => println!("file of {} bytes", file.size),
//!     PathState::Absent => println!("deleted by then"),
//! }
//! # Ok(())
//! # }
//! ```

use crate::chain::IncrementChain;
use crate::error::{Result, RewindError};
use crate::increment::{ChangeKind, ContentPlan, ContentRef, EntryKind, PathDelta};
use crate::types::Timestamp;
use crate::utils::{ancestors, join_path, validate_path};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::trace;

/// Resolved state of one path at one point in time
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathState {
    /// A regular file with a plan to rebuild its content
    File(FileState),
    /// A directory with its present children
    Directory(DirectoryState),
    /// Deleted by the requested time
    Absent,
}

impl PathState {
    /// Kind of the entry, if present
    pub fn kind(&self) -> Option<EntryKind> {
        match self {
            PathState::File(_) => Some(EntryKind::File),
            PathState::Directory(_) => Some(EntryKind::Directory),
            PathState::Absent => None,
        }
    }

    /// Whether the path did not exist at the requested time
    pub fn is_absent(&self) -> bool {
        matches!(self, PathState::Absent)
    }
}

/// A file as of a point in time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileState {
    /// Repository-relative path
    pub path: String,
    /// Timestamp of the increment in effect
    pub timestamp: Timestamp,
    /// Timestamp of the increment that last touched the file
    pub modified_at: Timestamp,
    /// Content size
    pub size: u64,
    /// Unix permission bits
    pub mode: u32,
    /// Modification time, seconds since the epoch
    pub mtime: i64,
    /// Objects to rebuild the content from
    pub plan: ContentPlan,
}

/// A directory as of a point in time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryState {
    /// Repository-relative path, empty for the root
    pub path: String,
    /// Timestamp of the increment in effect
    pub timestamp: Timestamp,
    /// Unix permission bits
    pub mode: u32,
    /// Modification time, seconds since the epoch
    pub mtime: i64,
    /// Present children, sorted by name
    pub children: Vec<ChildEntry>,
}

/// A child of a directory
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ChildEntry {
    /// Final path segment
    pub name: String,
    /// File or directory
    pub kind: EntryKind,
}

enum Located {
    Missing,
    Absent,
    Present { index: usize, delta: PathDelta },
}

/// Resolves paths against a shared chain snapshot
#[derive(Debug, Clone)]
pub struct PathResolver {
    chain: Arc<IncrementChain>,
    exact_time_match: bool,
}

impl PathResolver {
    /// Create a resolver over a chain
    pub fn new(chain: Arc<IncrementChain>) -> Self {
        Self {
            chain,
            exact_time_match: false,
        }
    }

    /// Only accept timestamps of recorded increments
    pub fn exact_time_match(mut self, exact: bool) -> Self {
        self.exact_time_match = exact;
        self
    }

    /// The chain being resolved against
    pub fn chain(&self) -> &Arc<IncrementChain> {
        &self.chain
    }

    /// Arena position of the increment in effect at `ts`
    ///
    /// # Errors
    ///
    /// - [`RewindError::InvalidTimestamp`] if `ts` is before the base snapshot
    /// - [`RewindError::NoSuchTime`] in exact mode when no increment has `ts`
    pub fn resolve_point(&self, ts: Timestamp) -> Result<usize> {
        let base = self.chain.base().timestamp();
        if ts < base {
            return Err(RewindError::InvalidTimestamp { requested: ts, base });
        }
        if self.exact_time_match {
            return self.chain.index_of(ts).ok_or(RewindError::NoSuchTime(ts));
        }
        self.chain.index_at_or_before(ts).ok_or(RewindError::NoSuchTime(ts))
    }

    /// Resolve a path at a point in time
    ///
    /// # Errors
    ///
    /// - [`RewindError::InvalidPath`] if `path` is not normalized
    /// - [`RewindError::InvalidTimestamp`] / [`RewindError::NoSuchTime`] for bad times
    /// - [`RewindError::NoSuchPath`] if the path was never recorded
    /// - [`RewindError::CorruptContent`] if a file's history has no full copy
    /// - [`RewindError::CorruptChain`] if deltas cannot be read
    pub fn resolve(&self, path: &str, ts: Timestamp) -> Result<PathState> {
        validate_path(path)?;
        let index = self.resolve_point(ts)?;
        self.resolve_at(path, index)
    }

    /// Resolve a validated path at an arena position
    pub fn resolve_at(&self, path: &str, index: usize) -> Result<PathState> {
        let timestamp = self.timestamp_at(index)?;

        if path.is_empty() {
            return Ok(PathState::Directory(DirectoryState {
                path: String::new(),
                timestamp,
                mode: 0o755,
                mtime: timestamp.as_secs(),
                children: self.children_at("", index)?,
            }));
        }

        match self.locate(path, index)? {
            Located::Missing => Err(RewindError::NoSuchPath {
                path: path.to_string(),
                timestamp,
            }),
            Located::Absent => {
                trace!("{:?} is absent at {}", path, timestamp);
                Ok(PathState::Absent)
            }
            Located::Present { index: touched, delta } => match delta.kind {
                EntryKind::Directory => Ok(PathState::Directory(DirectoryState {
                    path: path.to_string(),
                    timestamp,
                    mode: delta.mode,
                    mtime: delta.mtime,
                    children: self.children_at(path, index)?,
                })),
                EntryKind::File => {
                    let plan = self.content_plan(path, index)?;
                    Ok(PathState::File(FileState {
                        path: path.to_string(),
                        timestamp,
                        modified_at: self.timestamp_at(touched)?,
                        size: plan.size,
                        mode: delta.mode,
                        mtime: delta.mtime,
                        plan,
                    }))
                }
            },
        }
    }

    /// Present children of a directory at a point in time
    ///
    /// # Errors
    ///
    /// Resolution errors for `path`, or [`RewindError::InvalidPath`] if it is
    /// not a directory at that time.
    pub fn list_children(&self, path: &str, ts: Timestamp) -> Result<Vec<ChildEntry>> {
        match self.resolve(path, ts)? {
            PathState::Directory(dir) => Ok(dir.children),
            PathState::File(_) => Err(RewindError::InvalidPath(format!("{} is not a directory", path))),
            PathState::Absent => Err(RewindError::NoSuchPath {
                path: path.to_string(),
                timestamp: ts,
            }),
        }
    }

    /// Objects needed to rebuild a file as of an arena position
    ///
    /// Walks back from `index` collecting diffs until a full copy is found.
    ///
    /// # Errors
    ///
    /// Returns [`RewindError::CorruptContent`] if the walk reaches a deletion,
    /// a directory, a delta without content, or the base snapshot before a
    /// full copy.
    pub fn content_plan(&self, path: &str, index: usize) -> Result<ContentPlan> {
        let mut diffs = Vec::new();
        let mut size = None;
        let mut base = None;
        let mut found = false;

        for k in (0..=index).rev() {
            let deltas = self.chain.deltas(k)?;
            let Some(delta) = deltas.get(path) else {
                continue;
            };
            let at = self.timestamp_at(k)?;

            if delta.kind != EntryKind::File {
                return Err(RewindError::corrupt_content(
                    path,
                    format!("history reaches a directory at {} before a full copy", at.as_secs()),
                ));
            }

            match delta.change {
                ChangeKind::Metadata => continue,
                ChangeKind::Deleted => {
                    return Err(RewindError::corrupt_content(
                        path,
                        format!("history reaches a deletion at {} before a full copy", at.as_secs()),
                    ));
                }
                ChangeKind::Added | ChangeKind::Changed => {}
            }

            size.get_or_insert(delta.size);
            match &delta.content {
                Some(ContentRef::Snapshot(hash)) => {
                    base = Some(hash.clone());
                    found = true;
                    break;
                }
                Some(ContentRef::Diff(hash)) => diffs.push(hash.clone()),
                None if delta.size == 0 => {
                    found = true;
                    break;
                }
                None => {
                    return Err(RewindError::corrupt_content(
                        path,
                        format!("change at {} has no content reference", at.as_secs()),
                    ));
                }
            }
        }

        if !found {
            return Err(RewindError::corrupt_content(path, "no full copy at or after the base snapshot"));
        }

        diffs.reverse();
        Ok(ContentPlan {
            path: path.to_string(),
            base,
            diffs,
            size: size.unwrap_or(0),
        })
    }

    fn timestamp_at(&self, index: usize) -> Result<Timestamp> {
        self.chain
            .get(index)
            .map(|inc| inc.timestamp())
            .ok_or_else(|| RewindError::internal(format!("increment index {} out of range", index)))
    }

    /// Newest delta for `path` at or before `index`, with ancestor checks
    fn locate(&self, path: &str, index: usize) -> Result<Located> {
        for k in (0..=index).rev() {
            let deltas = self.chain.deltas(k)?;
            let Some(delta) = deltas.get(path) else {
                continue;
            };
            if !delta.is_present() || self.ancestor_removed(path, k, index)? {
                return Ok(Located::Absent);
            }
            return Ok(Located::Present {
                index: k,
                delta: delta.clone(),
            });
        }
        Ok(Located::Missing)
    }

    /// Whether an ancestor of `path` was deleted or turned into a file in
    /// `(since, index]`
    fn ancestor_removed(&self, path: &str, since: usize, index: usize) -> Result<bool> {
        for k in (since + 1)..=index {
            let deltas = self.chain.deltas(k)?;
            for ancestor in ancestors(path) {
                if let Some(delta) = deltas.get(ancestor) {
                    if !delta.is_present() || delta.kind == EntryKind::File {
                        return Ok(true);
                    }
                }
            }
        }
        Ok(false)
    }

    fn children_at(&self, dir: &str, index: usize) -> Result<Vec<ChildEntry>> {
        let mut names = BTreeSet::new();
        for k in 0..=index {
            let deltas = self.chain.deltas(k)?;
            names.extend(deltas.children_of(dir).map(str::to_string));
        }

        let mut children = Vec::with_capacity(names.len());
        for name in names {
            let full = join_path(dir, &name);
            if let Located::Present { delta, .. } = self.locate(&full, index)? {
                children.push(ChildEntry { name, kind: delta.kind });
            }
        }
        Ok(children)
    }
}
