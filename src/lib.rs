//! # Rewind - Point-in-time restores from incremental backups
//!
//! A read-only engine over backup repositories stored as a base snapshot
//! plus a chronological chain of increments. It lists the restorable points
//! of a repository and rebuilds any file or directory tree as it was at one
//! of them, streamed out as a zip or tar.gz archive.
//!
//! ## Overview
//!
//! Rewind never writes to a repository. It lets you:
//! - List the history of a repository with the statistics of every backup run
//! - Export those statistics as CSV
//! - Resolve any path at any point in time (file, directory, or deleted)
//! - Stream a restore of a file or a whole tree without staging it on disk
//! - Verify that every file version in a chain can still be rebuilt
//!
//! ## Architecture
//!
//! - **Increment Chain Reader**: parses and validates the chain into a
//!   time-ordered arena with binary-search lookups, cached per repository
//! - **History Entry Model**: projects the chain into history entries
//! - **Path Resolver**: walks back from the increment in effect at a time to
//!   find the newest state of a path
//! - **Archive Builder**: rebuilds files one at a time (full copy plus
//!   rsync-style diffs) and pushes archive chunks through a bounded channel
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use rewind::{ArchiveKind, RestoreRequest, Rewind, Timestamp};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let rewind = Rewind::open("/backups/laptop")?;
//!
//! // What can be restored?
//! for entry in rewind.history()? {
//!     println!("{} (new: {}, deleted: {})", entry.timestamp,
//!         entry.statistics.new_files, entry.statistics.deleted_files);
//! }
//!
//! // Restore a directory as it was at a given time
//! let request = RestoreRequest::new("projects/site", Timestamp::new(1_700_000_000), ArchiveKind::TarGz);
//! let mut restore = rewind.restore(request)?;
//! let mut out = std::fs::File::create(&restore.filename)?;
//! std::io::copy(&mut restore.stream, &mut out)?;
//!
//! let report = restore.stream.finish()?;
//! println!("Restored {} files ({} could not be rebuilt)",
//!     report.files_written, report.failures.len());
//! # Ok(())
//! # }
//! ```
//!
//! ## Async Consumers
//!
//! ```rust,no_run
//! # use rewind::{ArchiveKind, RestoreRequest, Rewind, Timestamp};
//! # async fn serve() -> Result<(), Box<dyn std::error::Error>> {
//! let rewind = Rewind::open("/backups/laptop")?;
//! let mut restore = rewind.restore(RestoreRequest::new("", Timestamp::now(), ArchiveKind::Zip))?;
//! while let Some(chunk) = restore.stream.next_chunk().await {
//!     let bytes = chunk?;
//!     // send bytes to the client...
//! #   let _ = bytes;
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Key Concepts
//!
//! ### Increments
//!
//! Each backup run leaves an immutable increment: a timestamp, a link to
//! the previous increment, the run's statistics, and the per-path changes
//! (added, changed, deleted, metadata-only). The oldest increment is the
//! base snapshot.
//!
//! ### Backups in progress
//!
//! While a backup is being written the repository carries more than one
//! `current_mirror` marker. Restores are refused until it finishes; history
//! listings only show completed increments.
//!
//! ### Partial failures
//!
//! A file that cannot be rebuilt inside a directory restore becomes an empty
//! entry and is listed in the [`RestoreReport`]; the rest of the archive is
//! still produced.
//!
//! ## Error Handling
//!
//! All operations return `Result<T, RewindError>`. Errors are classified as
//! caller errors, transient conditions, or corruption; see
//! [`RewindError::is_caller_error`] and [`RewindError::is_recoverable`].
//!
//! ## Module Organization
//!
//! - [`chain`]: increment chain loading and point-in-time lookup
//! - [`history`]: history entries and statistics export
//! - [`resolver`]: path resolution at a point in time
//! - [`archive`]: zip / tar.gz streaming
//! - [`disposition`]: download filenames and `Content-Disposition`
//! - [`verification`]: chain integrity checks
//! - [`types`]: common types and configuration
//! - [`error`]: error types and handling

// Public API modules
pub mod archive;
pub mod cache;
pub mod chain;
pub mod compression;
pub mod disposition;
pub mod error;
pub mod history;
pub mod increment;
pub mod repository;
pub mod resolver;
pub mod rewind;
pub mod storage;
pub mod types;
pub mod utils;
pub mod verification;

// Re-export main types for convenience
pub use archive::{ArchiveBuilder, ArchiveStream};
pub use cache::ChainCache;
pub use chain::IncrementChain;
pub use error::{Result, RewindError};
pub use repository::Repository;
pub use resolver::{ChildEntry, DirectoryState, FileState, PathResolver, PathState};
pub use rewind::{Restore, Rewind, RewindBuilder};
pub use types::*;
pub use verification::{ChainVerifier, VerificationReport};
