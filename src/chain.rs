//! Increment chain reader
//!
//! A repository's history is a strictly ordered chain: a base snapshot
//! followed by increments, each naming its predecessor. The chain is kept as
//! an arena (`Vec<Increment>`) sorted by timestamp, so point-in-time lookups
//! are binary searches rather than pointer walks.
//!
//! ## Loading
//!
//! [`IncrementChain::load`] reads every `increment.json` header (in
//! parallel) and validates the structure:
//!
//! - every increment directory is named by its header's timestamp
//! - no two increments share a timestamp
//! - the base has no parent, every other increment's parent is its
//!   predecessor
//! - the newest increment matches the repository's mirror marker
//!
//! Increments newer than the oldest `current_mirror` marker belong to a
//! backup still being written and are left out. Deltas are not read here.
//!
//! ## Examples
//!
//! ```rust,no_run
//! use rewind::chain::IncrementChain;
//! use rewind::repository::Repository;
//! use rewind::types::Timestamp;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let repo = Repository::open("/backups/laptop")?;
//! let chain = IncrementChain::load(&repo)?;
//!
//! let t = Timestamp::new(1_700_000_000);
//! let visible = chain.up_to(t);
//! println!("{} increments at or before {}", visible.len(), t);
//! if let Some(next) = chain.following(t) {
//!     println!("next backup at {}", next.timestamp());
//! }
//! # Ok(())
//! # }
//! ```

use crate::error::{Result, RewindError};
use crate::increment::{DeltaSet, Increment};
use crate::repository::Repository;
use crate::types::Timestamp;
use rayon::prelude::*;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, trace};

/// Time-ordered, validated chain of increments
///
/// Immutable once built. Share it behind an `Arc`; concurrent readers only
/// ever see a fully constructed chain.
#[derive(Debug)]
pub struct IncrementChain {
    increments: Vec<Increment>,
}

impl IncrementChain {
    /// Load and validate the chain of a repository
    ///
    /// # Errors
    ///
    /// - [`RewindError::RepositoryNotFound`] if the repository vanished
    /// - [`RewindError::CorruptChain`] if markers, directory names or headers
    ///   are unparsable, duplicated, or out of order
    pub fn load(repository: &Repository) -> Result<Self> {
        let markers = repository.mirror_markers()?;
        let head = *markers.first().ok_or_else(|| {
            RewindError::corrupt_chain(format!("no current_mirror marker in {:?}", repository.data_dir()))
        })?;

        let increments_dir = repository.increments_dir();
        let entries = fs::read_dir(&increments_dir).map_err(|e| {
            RewindError::corrupt_chain(format!("cannot read {:?}: {}", increments_dir, e))
        })?;

        let mut dirs: Vec<(Timestamp, PathBuf)> = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            let ts = name
                .parse::<i64>()
                .map(Timestamp::new)
                .map_err(|_| RewindError::corrupt_chain(format!("unparsable increment directory {:?}", name)))?;
            if ts > head {
                debug!("Skipping increment {} written by a backup in progress", ts.as_secs());
                continue;
            }
            dirs.push((ts, entry.path()));
        }

        dirs.sort_by_key(|(ts, _)| *ts);
        if let Some(pair) = dirs.windows(2).find(|pair| pair[0].0 == pair[1].0) {
            return Err(RewindError::corrupt_chain(format!(
                "duplicate increment timestamp {} ({:?} and {:?})",
                pair[0].0.as_secs(),
                pair[0].1,
                pair[1].1
            )));
        }

        let increments = dirs
            .par_iter()
            .map(|(ts, dir)| {
                let increment = Increment::open(dir)?;
                if increment.timestamp() != *ts {
                    return Err(RewindError::corrupt_chain(format!(
                        "increment {:?} records timestamp {}",
                        dir,
                        increment.timestamp().as_secs()
                    )));
                }
                Ok(increment)
            })
            .collect::<Result<Vec<_>>>()?;

        let chain = Self::from_increments(increments)?;
        if chain.latest().timestamp() != head {
            return Err(RewindError::corrupt_chain(format!(
                "newest increment {} does not match mirror marker {}",
                chain.latest().timestamp().as_secs(),
                head.as_secs()
            )));
        }

        info!(
            "Loaded chain of {} increments for {:?} ({} .. {})",
            chain.len(),
            repository.name(),
            chain.base().timestamp(),
            chain.latest().timestamp()
        );
        Ok(chain)
    }

    /// Build a chain from increments already in chronological order
    ///
    /// # Errors
    ///
    /// Returns [`RewindError::CorruptChain`] if the list is empty, not
    /// strictly increasing, or the parent links do not form a single line
    /// back to the base.
    pub fn from_increments(increments: Vec<Increment>) -> Result<Self> {
        let Some(base) = increments.first() else {
            return Err(RewindError::corrupt_chain("repository has no increments"));
        };
        if let Some(parent) = base.parent() {
            return Err(RewindError::corrupt_chain(format!(
                "base snapshot {} names parent {}",
                base.timestamp().as_secs(),
                parent.as_secs()
            )));
        }

        for pair in increments.windows(2) {
            let (prev, next) = (&pair[0], &pair[1]);
            if next.timestamp() == prev.timestamp() {
                return Err(RewindError::corrupt_chain(format!(
                    "duplicate increment timestamp {}",
                    next.timestamp().as_secs()
                )));
            }
            if next.timestamp() < prev.timestamp() {
                return Err(RewindError::corrupt_chain(format!(
                    "increment {} is out of order after {}",
                    next.timestamp().as_secs(),
                    prev.timestamp().as_secs()
                )));
            }
            if next.parent() != Some(prev.timestamp()) {
                return Err(RewindError::corrupt_chain(format!(
                    "increment {} names parent {:?}, expected {}",
                    next.timestamp().as_secs(),
                    next.parent().map(Timestamp::as_secs),
                    prev.timestamp().as_secs()
                )));
            }
        }

        trace!("Validated chain of {} increments", increments.len());
        Ok(Self { increments })
    }

    /// Number of increments, base included
    pub fn len(&self) -> usize {
        self.increments.len()
    }

    /// Always false; a chain has at least its base
    pub fn is_empty(&self) -> bool {
        self.increments.is_empty()
    }

    /// The base snapshot
    pub fn base(&self) -> &Increment {
        &self.increments[0]
    }

    /// The newest increment
    pub fn latest(&self) -> &Increment {
        &self.increments[self.increments.len() - 1]
    }

    /// Increment at an arena position
    pub fn get(&self, index: usize) -> Option<&Increment> {
        self.increments.get(index)
    }

    /// All increments, oldest first
    pub fn increments(&self) -> &[Increment] {
        &self.increments
    }

    /// Iterate over increments, oldest first
    pub fn iter(&self) -> std::slice::Iter<'_, Increment> {
        self.increments.iter()
    }

    /// All timestamps, oldest first
    pub fn timestamps(&self) -> impl Iterator<Item = Timestamp> + '_ {
        self.increments.iter().map(Increment::timestamp)
    }

    /// Position of the newest increment at or before `ts`
    pub fn index_at_or_before(&self, ts: Timestamp) -> Option<usize> {
        self.increments
            .partition_point(|inc| inc.timestamp() <= ts)
            .checked_sub(1)
    }

    /// Position of the increment recorded exactly at `ts`
    pub fn index_of(&self, ts: Timestamp) -> Option<usize> {
        self.increments
            .binary_search_by_key(&ts, Increment::timestamp)
            .ok()
    }

    /// All increments with timestamp `<= ts`
    pub fn up_to(&self, ts: Timestamp) -> &[Increment] {
        let end = self.increments.partition_point(|inc| inc.timestamp() <= ts);
        &self.increments[..end]
    }

    /// The increment immediately following `ts`
    pub fn following(&self, ts: Timestamp) -> Option<&Increment> {
        let idx = self.increments.partition_point(|inc| inc.timestamp() <= ts);
        self.increments.get(idx)
    }

    /// Deltas of the increment at an arena position
    pub fn deltas(&self, index: usize) -> Result<Arc<DeltaSet>> {
        self.increments
            .get(index)
            .ok_or_else(|| RewindError::internal(format!("increment index {} out of range", index)))?
            .deltas()
    }
}
