//! Process-wide cache of parsed increment chains
//!
//! Parsing a chain means reading one header per increment, so chains are
//! cached per repository and shared as `Arc<IncrementChain>` snapshots.
//!
//! Each cached chain is keyed by the repository data directory and stamped
//! with the repository's `current_mirror` markers at load time. Every lookup
//! re-reads the markers (a directory listing). A finished backup always
//! changes them (`[t1]` becomes `[t1, t2]` while writing, then `[t2]`), and a
//! changed fingerprint triggers a reload into a fresh `Arc`. Readers still
//! holding the old snapshot keep using it undisturbed; chains are never
//! mutated in place.

use crate::chain::IncrementChain;
use crate::error::Result;
use crate::repository::Repository;
use crate::types::Timestamp;
use dashmap::DashMap;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use tracing::{debug, trace};

#[derive(Debug, Clone)]
struct CachedChain {
    markers: Vec<Timestamp>,
    chain: Arc<IncrementChain>,
}

/// Cache of increment chains keyed by repository
///
/// # Examples
///
/// ```rust,no_run
/// use rewind::cache::ChainCache;
/// use rewind::repository::Repository;
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let repo = Repository::open("/backups/laptop")?;
/// let first = ChainCache::global().get_or_load(&repo)?;
/// let second = ChainCache::global().get_or_load(&repo)?;
/// assert!(std::sync::Arc::ptr_eq(&first, &second));
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Default)]
pub struct ChainCache {
    entries: DashMap<PathBuf, CachedChain>,
}

impl ChainCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// The cache shared by the whole process
    pub fn global() -> Arc<ChainCache> {
        static GLOBAL: OnceLock<Arc<ChainCache>> = OnceLock::new();
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(ChainCache::new())))
    }

    /// Chain of a repository, loading or reloading it when needed
    ///
    /// # Errors
    ///
    /// Propagates [`IncrementChain::load`] errors. A failed reload leaves the
    /// previous snapshot cached.
    pub fn get_or_load(&self, repository: &Repository) -> Result<Arc<IncrementChain>> {
        let key = repository.data_dir();
        let markers = repository.mirror_markers()?;

        if let Some(cached) = self.entries.get(&key) {
            if cached.markers == markers {
                trace!("Chain cache hit for {:?}", repository.name());
                return Ok(Arc::clone(&cached.chain));
            }
            debug!(
                "Mirror markers of {:?} changed ({:?} -> {:?}), reloading chain",
                repository.name(),
                cached.markers,
                markers
            );
        }

        let chain = Arc::new(IncrementChain::load(repository)?);
        self.entries.insert(
            key,
            CachedChain {
                markers,
                chain: Arc::clone(&chain),
            },
        );
        Ok(chain)
    }

    /// Drop the cached chain of a repository
    pub fn invalidate(&self, repository: &Repository) -> bool {
        self.entries.remove(&repository.data_dir()).is_some()
    }

    /// Drop every cached chain
    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Number of cached repositories
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is cached
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
