//! Main Rewind implementation
//!
//! The `Rewind` struct is the entry point for reading a backup repository:
//! listing its history, resolving paths at a point in time, and streaming
//! restores as zip or tar.gz archives.
//!
//! ## Overview
//!
//! `Rewind` coordinates several subsystems:
//!
//! - **Repository**: on-disk layout and the backup-in-progress markers
//! - **Chain Cache**: parsed increment chains shared across calls
//! - **Path Resolver**: the state of a path at a point in time
//! - **Archive Builder**: lazy, bounded-memory archive streams
//! - **Verification**: whole-chain integrity checks
//!
//! ## Thread Safety
//!
//! `Rewind` is `Send + Sync` and every method takes `&self`. Each call works
//! on an immutable chain snapshot, so restores and history listings can run
//! concurrently against the same repository.
//!
//! ## Examples
//!
//! ```rust,no_run
//! use rewind::{ArchiveKind, RestoreRequest, Rewind, Timestamp};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let rewind = Rewind::open("/backups/laptop")?;
//!
//! for entry in rewind.history()? {
//!     println!("{}  {} changed", entry.timestamp, entry.statistics.changed_files);
//! }
//!
//! let request = RestoreRequest::new("docs", Timestamp::new(1_700_000_000), ArchiveKind::Zip);
//! let mut restore = rewind.restore(request)?;
//! println!("Content-Disposition: {}", restore.content_disposition);
//!
//! let mut out = std::fs::File::create(&restore.filename)?;
//! std::io::copy(&mut restore.stream, &mut out)?;
//! restore.stream.finish()?;
//! # Ok(())
//! # }
//! ```

use crate::archive::{ArchiveBuilder, ArchiveStream};
use crate::cache::ChainCache;
use crate::chain::IncrementChain;
use crate::disposition::{archive_filename, content_disposition};
use crate::error::{Result, RewindError};
use crate::history::{list_history, write_statistics_csv};
use crate::repository::{Repository, check_activity};
use crate::resolver::{ChildEntry, PathResolver, PathState};
use crate::storage::ObjectStore;
use crate::types::*;
use crate::utils::normalize_path;
use crate::verification::{ChainVerifier, VerificationReport};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Read-only access to one backup repository
pub struct Rewind {
    repository: Repository,
    store: Arc<ObjectStore>,
    cache: Option<Arc<ChainCache>>,
    config: RewindConfig,
}

impl std::fmt::Debug for Rewind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rewind")
            .field("root", &self.repository.root())
            .field("cached", &self.cache.is_some())
            .field("config", &self.config)
            .finish()
    }
}

/// A restore that has been resolved and started
#[derive(Debug)]
pub struct Restore {
    /// Download filename, `<name>.<zip|tar.gz>`
    pub filename: String,
    /// Ready-made `Content-Disposition` header value
    pub content_disposition: String,
    /// Timestamp of the increment the restore reads from
    pub timestamp: Timestamp,
    /// Archive bytes
    pub stream: ArchiveStream,
}

impl Rewind {
    /// Open a repository with default settings
    ///
    /// # Errors
    ///
    /// Returns [`RewindError::RepositoryNotFound`] if `root` has no
    /// `rewind-data` directory.
    #[instrument(skip(root))]
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        RewindBuilder::new().build(root)
    }

    /// Repository handle
    pub fn repository(&self) -> &Repository {
        &self.repository
    }

    /// Active configuration
    pub fn config(&self) -> &RewindConfig {
        &self.config
    }

    /// Current chain snapshot
    ///
    /// Served from the chain cache when one is configured; reloaded when the
    /// repository's markers changed since the last load.
    pub fn chain(&self) -> Result<Arc<IncrementChain>> {
        match &self.cache {
            Some(cache) => cache.get_or_load(&self.repository),
            None => Ok(Arc::new(IncrementChain::load(&self.repository)?)),
        }
    }

    fn resolver(&self) -> Result<PathResolver> {
        Ok(PathResolver::new(self.chain()?).exact_time_match(self.config.exact_time_match))
    }

    /// All restorable points, oldest first
    pub fn history(&self) -> Result<Vec<HistoryEntry>> {
        let chain = self.chain()?;
        Ok(list_history(&chain).collect())
    }

    /// Write the per-run statistics as CSV
    pub fn write_statistics_csv<W: Write>(&self, writer: W) -> Result<()> {
        let chain = self.chain()?;
        write_statistics_csv(&chain, writer)
    }

    /// State of a path at a point in time
    ///
    /// `path` may carry leading or trailing slashes; `""` and `"/"` name the
    /// repository root.
    ///
    /// # Errors
    ///
    /// See [`PathResolver::resolve`].
    pub fn resolve(&self, path: &str, timestamp: Timestamp) -> Result<PathState> {
        let path = normalize_path(path)?;
        self.resolver()?.resolve(&path, timestamp)
    }

    /// Children of a directory at a point in time
    pub fn list_children(&self, path: &str, timestamp: Timestamp) -> Result<Vec<ChildEntry>> {
        let path = normalize_path(path)?;
        self.resolver()?.list_children(&path, timestamp)
    }

    /// Start a restore
    ///
    /// Checks that no backup is running, resolves the path, and starts the
    /// archive producer. Every error is reported here, before the first
    /// archive byte; once this returns, only a fatal stream error can end
    /// the archive early.
    ///
    /// # Errors
    ///
    /// - [`RewindError::BackupInProgress`] while a backup is being written
    /// - [`RewindError::InvalidPath`], [`RewindError::InvalidTimestamp`],
    ///   [`RewindError::NoSuchTime`] or [`RewindError::NoSuchPath`] for bad
    ///   requests, including paths deleted by the requested time
    /// - [`RewindError::CorruptChain`] if the chain cannot be read
    /// - [`RewindError::CorruptContent`] if a single-file target has no full copy
    /// - [`RewindError::InvalidPattern`] for a malformed exclude pattern
    #[instrument(skip(self, request), fields(path = %request.path, ts = request.timestamp.as_secs(), kind = %request.kind))]
    pub fn restore(&self, request: RestoreRequest) -> Result<Restore> {
        debug!("Restore phase: Requested");
        if self.repository.in_progress()? {
            warn!("Rejecting restore, backup in progress");
            return Err(RewindError::BackupInProgress(self.repository.root().to_path_buf()));
        }

        debug!("Restore phase: Resolving");
        let path = normalize_path(&request.path)?;
        let resolver = self.resolver()?;
        let state = resolver.resolve(&path, request.timestamp)?;
        let timestamp = match &state {
            PathState::File(file) => file.timestamp,
            PathState::Directory(dir) => dir.timestamp,
            PathState::Absent => {
                return Err(RewindError::NoSuchPath {
                    path,
                    timestamp: request.timestamp,
                });
            }
        };

        let filename = archive_filename(&path, &self.repository.display_name(), request.kind);
        let builder = ArchiveBuilder::new(resolver, Arc::clone(&self.store), self.config.clone())
            .exclude(&request.options.exclude_patterns)?;
        let stream = builder.stream(state, request.kind)?;

        info!("Restore phase: Streaming {} from increment {}", filename, timestamp.as_secs());
        Ok(Restore {
            content_disposition: content_disposition(&filename),
            filename,
            timestamp,
            stream,
        })
    }

    /// Summary of the repository
    ///
    /// Never fails; an unreadable chain is reported as
    /// [`RepositoryStatus::Failed`].
    pub fn repository_info(&self) -> RepositoryInfo {
        let in_progress = self.repository.in_progress();
        let chain = self.chain();

        let status = match (&in_progress, &chain) {
            (Err(e), _) | (_, Err(e)) => RepositoryStatus::Failed(e.to_string()),
            (Ok(true), _) => RepositoryStatus::InProgress,
            (Ok(false), Ok(_)) => RepositoryStatus::Ok,
        };
        let (last_backup_date, increment_count) = match &chain {
            Ok(chain) => (Some(chain.latest().timestamp()), chain.len()),
            Err(_) => (None, 0),
        };

        RepositoryInfo {
            name: self.repository.name().to_string(),
            display_name: self.repository.display_name(),
            last_backup_date,
            status,
            increment_count,
        }
    }

    /// Whether the newest backup is at most `max_age_days` old at `now`
    ///
    /// `max_age_days <= 0` disables the check. A repository whose chain
    /// cannot be read counts as inactive.
    pub fn check_activity(&self, max_age_days: i64, now: Timestamp) -> bool {
        let last = match self.chain() {
            Ok(chain) => Some(chain.latest().timestamp()),
            Err(e) => {
                debug!("No readable backup for activity check: {}", e);
                None
            }
        };
        check_activity(last, max_age_days, now)
    }

    /// Verify the whole chain against the object store
    #[instrument(skip(self))]
    pub fn verify(&self) -> Result<VerificationReport> {
        ChainVerifier::new(self.chain()?, &self.store).verify_complete()
    }
}

/// Builder pattern for Rewind configuration
///
/// # Examples
///
/// ```rust,no_run
/// use rewind::RewindBuilder;
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let rewind = RewindBuilder::new()
///     .chunk_size(256 * 1024)
///     .gzip_level(9)
///     .exact_time_match(true)
///     .build("/backups/laptop")?;
/// # Ok(())
/// # }
/// ```
///
/// # Default Values
///
/// See [`RewindConfig::default`]. The process-wide chain cache is used
/// unless `use_global_cache(false)` is set or a cache is supplied.
#[derive(Debug, Default)]
pub struct RewindBuilder {
    config: RewindConfig,
    cache: Option<Arc<ChainCache>>,
}

impl RewindBuilder {
    /// Create a new builder with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole configuration
    pub fn config(mut self, config: RewindConfig) -> Self {
        self.config = config;
        self
    }

    /// Use a specific chain cache instead of the process-wide one
    pub fn cache(mut self, cache: Arc<ChainCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Size of archive chunks handed to the consumer
    ///
    /// # Arguments
    ///
    /// * `size` - Chunk size in bytes (must be non-zero)
    pub fn chunk_size(mut self, size: usize) -> Self {
        self.config.chunk_size = size;
        self
    }

    /// Number of chunks buffered between producer and consumer
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.config.channel_capacity = capacity;
        self
    }

    /// Deepest directory nesting walked by a restore
    pub fn max_tree_depth(mut self, depth: usize) -> Self {
        self.config.max_tree_depth = depth;
        self
    }

    /// Gzip level for tar.gz archives (0-9)
    pub fn gzip_level(mut self, level: u32) -> Self {
        self.config.gzip_level = level;
        self
    }

    /// Deflate zip entries instead of storing them
    pub fn zip_deflate(mut self, deflate: bool) -> Self {
        self.config.zip_deflate = deflate;
        self
    }

    /// Only accept timestamps of recorded increments
    pub fn exact_time_match(mut self, exact: bool) -> Self {
        self.config.exact_time_match = exact;
        self
    }

    /// Check object hashes on every load
    pub fn verify_objects(mut self, verify: bool) -> Self {
        self.config.verify_objects = verify;
        self
    }

    /// Share parsed chains through the process-wide cache
    pub fn use_global_cache(mut self, enabled: bool) -> Self {
        self.config.use_global_cache = enabled;
        self
    }

    /// Build the Rewind instance
    ///
    /// # Errors
    ///
    /// - [`RewindError::InvalidConfiguration`] for invalid settings
    /// - [`RewindError::RepositoryNotFound`] if `root` is not a repository
    pub fn build(self, root: impl Into<PathBuf>) -> Result<Rewind> {
        self.config.validate()?;
        let repository = Repository::open(root)?;
        let store = Arc::new(ObjectStore::new(repository.objects_dir(), self.config.verify_objects));
        let cache = self
            .cache
            .or_else(|| self.config.use_global_cache.then(ChainCache::global));

        info!("Opened repository {:?}", repository.root());
        Ok(Rewind {
            repository,
            store,
            cache,
            config: self.config,
        })
    }
}
