//! Chain verification and integrity checking
//!
//! Restores degrade gracefully when an object is missing or a diff does not
//! apply, which also means damage can go unnoticed until someone needs the
//! file. The verifier walks a whole chain up front and reports every problem
//! it can find without reconstructing any file.
//!
//! ## Checks
//!
//! 1. **Increment level**: every increment's delta file can be read
//! 2. **Object level**: every referenced object exists, decodes, and hashes
//!    to its id
//! 3. **Plan level**: every file version in the chain has a full copy to
//!    rebuild from
//! 4. **Store level**: objects nobody references are listed as orphans
//!
//! Orphans are reported but do not make a chain invalid; a backup being
//! written leaves objects that no readable increment references yet.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use rewind::chain::IncrementChain;
//! use rewind::repository::Repository;
//! use rewind::storage::ObjectStore;
//! use rewind::verification::ChainVerifier;
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let repo = Repository::open("/backups/laptop")?;
//! let chain = Arc::new(IncrementChain::load(&repo)?);
//! let store = ObjectStore::new(repo.objects_dir(), true);
//!
//! let report = ChainVerifier::new(chain, &store).verify_complete()?;
//! if !report.is_valid() {
//!     println!("Issues found: {}", report.summary());
//! }
//! # Ok(())
//! # }
//! ```

use crate::chain::IncrementChain;
use crate::error::{Result, RewindError};
use crate::increment::{ChangeKind, EntryKind};
use crate::resolver::PathResolver;
use crate::storage::{ObjectStore, compute_hash};
use crate::types::Timestamp;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Verifier for a loaded chain and its object store
#[derive(Debug)]
pub struct ChainVerifier<'a> {
    resolver: PathResolver,
    store: &'a ObjectStore,
}

impl<'a> ChainVerifier<'a> {
    /// Create a new verifier
    ///
    /// # Arguments
    ///
    /// * `chain` - Chain to verify
    /// * `store` - Object store the chain's deltas reference
    pub fn new(chain: Arc<IncrementChain>, store: &'a ObjectStore) -> Self {
        Self {
            resolver: PathResolver::new(chain),
            store,
        }
    }

    /// Run every check over the whole chain
    ///
    /// # Errors
    ///
    /// Returns an error only if the object directory cannot be listed.
    /// Problems with the chain itself are reported in the result.
    pub fn verify_complete(&self) -> Result<VerificationReport> {
        let start = Instant::now();
        let mut report = VerificationReport::default();
        let mut referenced = BTreeSet::new();

        let chain = Arc::clone(self.resolver.chain());
        for (index, increment) in chain.iter().enumerate() {
            let timestamp = increment.timestamp();
            debug!("Verifying increment {}", timestamp.as_secs());
            report.increments_checked += 1;

            let deltas = match increment.deltas() {
                Ok(deltas) => deltas,
                Err(e) => {
                    report.errors.push(format!("Increment {}: {}", timestamp.as_secs(), e));
                    continue;
                }
            };

            for (path, delta) in deltas.iter() {
                if delta.kind != EntryKind::File || !delta.is_present() {
                    continue;
                }
                report.files_checked += 1;
                if let Some(content) = &delta.content {
                    referenced.insert(content.object().to_string());
                }
                if delta.change == ChangeKind::Metadata {
                    continue;
                }
                if let Err(e) = self.resolver.content_plan(path, index) {
                    report.unbuildable.push(PlanFailure {
                        path: path.to_string(),
                        timestamp,
                        reason: e.to_string(),
                    });
                }
            }
        }

        let checks: Vec<(String, ObjectCheck)> = referenced
            .par_iter()
            .map(|hash| (hash.clone(), self.check_object(hash)))
            .collect();
        for (hash, check) in checks {
            report.objects_checked += 1;
            match check {
                ObjectCheck::Valid => {}
                ObjectCheck::Missing => report.missing_objects.push(hash),
                ObjectCheck::Corrupt(reason) => {
                    warn!("Object {} is corrupt: {}", &hash[..hash.len().min(8)], reason);
                    report.corrupt_objects.push(hash);
                }
            }
        }

        report.orphaned_objects = self
            .store
            .list_objects()?
            .into_iter()
            .filter(|hash| !referenced.contains(hash))
            .collect();

        report.verification_time_ms = start.elapsed().as_millis() as u64;
        info!(
            "Verified {} increments in {}ms: {} files, {} objects, {} problems",
            report.increments_checked,
            report.verification_time_ms,
            report.files_checked,
            report.objects_checked,
            report.problem_count()
        );
        Ok(report)
    }

    fn check_object(&self, hash: &str) -> ObjectCheck {
        match self.store.load_object(hash) {
            Ok(content) => {
                let actual = compute_hash(&content);
                if actual == hash {
                    ObjectCheck::Valid
                } else {
                    ObjectCheck::Corrupt(format!("content hashes to {}", actual))
                }
            }
            Err(RewindError::ObjectNotFound(_)) => ObjectCheck::Missing,
            Err(e) => ObjectCheck::Corrupt(e.to_string()),
        }
    }
}

enum ObjectCheck {
    Valid,
    Missing,
    Corrupt(String),
}

/// A file version that cannot be rebuilt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanFailure {
    /// Repository-relative path
    pub path: String,
    /// Increment recording the version
    pub timestamp: Timestamp,
    /// Why no plan could be built
    pub reason: String,
}

/// Result of verifying a chain
///
/// # Examples
///
/// ```rust
/// # use rewind::verification::VerificationReport;
/// let report = VerificationReport::default();
/// assert!(report.is_valid());
/// println!("{}", report.summary());
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VerificationReport {
    /// Increments visited
    pub increments_checked: usize,
    /// File deltas visited
    pub files_checked: usize,
    /// Distinct objects checked
    pub objects_checked: usize,
    /// Referenced objects that do not exist
    pub missing_objects: Vec<String>,
    /// Referenced objects that do not decode or hash correctly
    pub corrupt_objects: Vec<String>,
    /// File versions without a full copy to start from
    pub unbuildable: Vec<PlanFailure>,
    /// Objects nobody references
    pub orphaned_objects: Vec<String>,
    /// Increments whose deltas could not be read
    pub errors: Vec<String>,
    /// Time taken in milliseconds
    pub verification_time_ms: u64,
}

impl VerificationReport {
    /// Whether every file version in the chain can be restored
    pub fn is_valid(&self) -> bool {
        self.problem_count() == 0
    }

    /// Number of problems found, orphans excluded
    pub fn problem_count(&self) -> usize {
        self.missing_objects.len() + self.corrupt_objects.len() + self.unbuildable.len() + self.errors.len()
    }

    /// Get a summary of the verification
    pub fn summary(&self) -> String {
        if self.is_valid() {
            return format!(
                "Chain is valid ({} increments, {} files, {} objects verified in {}ms, {} orphaned)",
                self.increments_checked,
                self.files_checked,
                self.objects_checked,
                self.verification_time_ms,
                self.orphaned_objects.len()
            );
        }

        let issues = [
            (!self.errors.is_empty()).then(|| format!("{} unreadable increments", self.errors.len())),
            (!self.missing_objects.is_empty()).then(|| format!("{} missing objects", self.missing_objects.len())),
            (!self.corrupt_objects.is_empty()).then(|| format!("{} corrupt objects", self.corrupt_objects.len())),
            (!self.unbuildable.is_empty()).then(|| format!("{} unbuildable files", self.unbuildable.len())),
        ]
        .into_iter()
        .flatten()
        .collect::<Vec<_>>()
        .join(", ");

        format!(
            "Chain is invalid: {} ({} increments, {} files checked)",
            issues, self.increments_checked, self.files_checked
        )
    }
}
