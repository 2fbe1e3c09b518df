//! Content-addressable object store
//!
//! File contents and diffs referenced by increments live in a sharded
//! object directory, addressed by the SHA-256 of their decoded bytes:
//!
//! ```text
//! rewind-data/objects/
//! └── <prefix>/          # First 2 chars of hash
//!     └── <suffix>       # Remaining 62 hash chars
//! ```
//!
//! Each object is framed by the [`ObjectCodec`]. The store is read-only:
//! the backup process writes objects, this crate only loads and checks them.
//!
//! ## Thread Safety
//!
//! `ObjectStore` is `Send + Sync`. It keeps no per-object state and the
//! codec's counters are atomic, so many restores can read concurrently.

use crate::compression::{CodecStats, ObjectCodec};
use crate::error::{Result, RewindError};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, trace};
use walkdir::WalkDir;

/// Read-only view of a repository's object directory
///
/// # Examples
///
/// ```rust,no_run
/// use rewind::storage::ObjectStore;
/// use std::path::PathBuf;
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let store = ObjectStore::new(PathBuf::from("/backups/laptop/rewind-data/objects"), true);
/// let hash = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";
/// let content = store.load_object(hash)?;
/// assert_eq!(content, b"hello");
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct ObjectStore {
    root: PathBuf,
    codec: ObjectCodec,
    verify: bool,
}

impl ObjectStore {
    /// Create a store over an object directory
    ///
    /// # Arguments
    ///
    /// * `root` - The `objects` directory of a repository
    /// * `verify` - Re-hash decoded content and reject mismatches
    pub fn new(root: PathBuf, verify: bool) -> Self {
        Self {
            root,
            codec: ObjectCodec::new(),
            verify,
        }
    }

    /// Object directory this store reads from
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Load and decode an object
    ///
    /// # Errors
    ///
    /// - [`RewindError::ObjectNotFound`] if the id is malformed or the object is missing
    /// - [`RewindError::ObjectUnreadable`] if the object exists but cannot be read
    /// - [`RewindError::Decompression`] if the frame is corrupt
    /// - [`RewindError::HashMismatch`] if verification is on and the content
    ///   does not hash to its id
    pub fn load_object(&self, hash: &str) -> Result<Vec<u8>> {
        let object_path = self.object_path(hash)?;
        let framed = match fs::read(&object_path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(RewindError::ObjectNotFound(hash.to_string()));
            }
            Err(e) => {
                return Err(RewindError::ObjectUnreadable {
                    hash: hash.to_string(),
                    reason: e.to_string(),
                });
            }
        };

        let content = self.codec.decode(&framed)?;

        if self.verify {
            let actual = compute_hash(&content);
            if actual != hash {
                return Err(RewindError::HashMismatch {
                    expected: hash.to_string(),
                    actual,
                });
            }
        }

        trace!("Loaded object {} ({} bytes)", &hash[..8], content.len());
        Ok(content)
    }

    /// Check if an object exists
    ///
    /// Always asks the filesystem; nothing about objects is cached.
    pub fn object_exists(&self, hash: &str) -> bool {
        self.object_path(hash).map(|p| p.is_file()).unwrap_or(false)
    }

    /// Framed (on-disk) size of an object
    pub fn object_size(&self, hash: &str) -> Result<u64> {
        let object_path = self.object_path(hash)?;
        let metadata = fs::metadata(&object_path).map_err(|e| match e.kind() {
            ErrorKind::NotFound => RewindError::ObjectNotFound(hash.to_string()),
            _ => RewindError::ObjectUnreadable {
                hash: hash.to_string(),
                reason: e.to_string(),
            },
        })?;
        Ok(metadata.len())
    }

    /// List all object ids present on disk
    pub fn list_objects(&self) -> Result<Vec<String>> {
        let mut objects = Vec::new();
        if !self.root.exists() {
            return Ok(objects);
        }

        for entry in WalkDir::new(&self.root).min_depth(2).max_depth(2) {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let shard = entry
                .path()
                .parent()
                .and_then(|p| p.file_name())
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            let hash = format!("{}{}", shard, entry.file_name().to_string_lossy());
            if is_object_id(&hash) {
                objects.push(hash);
            }
        }

        objects.sort();
        debug!("Found {} objects under {:?}", objects.len(), self.root);
        Ok(objects)
    }

    /// Decode counters accumulated by this store
    pub fn codec_stats(&self) -> CodecStats {
        self.codec.stats()
    }

    /// Get path for an object (with sharding)
    fn object_path(&self, hash: &str) -> Result<PathBuf> {
        if !is_object_id(hash) {
            return Err(RewindError::ObjectNotFound(format!("malformed object id {:?}", hash)));
        }
        let (prefix, suffix) = hash.split_at(2);
        Ok(self.root.join(prefix).join(suffix))
    }
}

/// Whether a string is a lowercase hex SHA-256 digest
pub fn is_object_id(hash: &str) -> bool {
    hash.len() == 64 && hash.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// Compute the object id of some content
///
/// # Examples
///
/// ```rust
/// use rewind::storage::compute_hash;
///
/// let hash = compute_hash(b"hello");
/// assert_eq!(hash, "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824");
/// ```
pub fn compute_hash(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    hex::encode(hasher.finalize())
}
