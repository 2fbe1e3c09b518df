//! Chaos testing for Rewind
//!
//! Damages repositories the way crashed backups, bad disks, and careless
//! hands do, and checks that restores degrade entry by entry instead of
//! failing wholesale, that a damaged chain is reported as corrupt, and that
//! an interrupted stream never delivers a finished-looking archive.

use crate::common::*;
use ::rewind::increment::{ChangeKind, EntryKind, IncrementHeader, PathDelta};
use ::rewind::storage::ObjectStore;
use ::rewind::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::fs;
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

/// Seeded source of damage
pub struct ChaosEngine {
    rng: StdRng,
}

impl ChaosEngine {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Flip bytes in the payload of `count` distinct objects
    ///
    /// Returns the ids of the objects that were damaged.
    pub fn corrupt_objects(
        &mut self,
        fixture: &ChainFixture,
        candidates: &[String],
        count: usize,
    ) -> anyhow::Result<Vec<String>> {
        let mut pool = candidates.to_vec();
        let mut corrupted = Vec::new();

        for _ in 0..count.min(pool.len()) {
            let idx = self.rng.random_range(0..pool.len());
            let hash = pool.remove(idx);
            let path = object_path(fixture, &hash);

            let mut framed = fs::read(&path)?;
            if framed.len() <= 4 {
                continue;
            }
            let byte_idx = self.rng.random_range(4..framed.len());
            framed[byte_idx] ^= self.rng.random_range(1..=255u8);
            fs::write(&path, framed)?;
            corrupted.push(hash);
        }

        Ok(corrupted)
    }

    /// Random printable content of a given length
    pub fn content(&mut self, len: usize) -> Vec<u8> {
        (0..len).map(|_| self.rng.random_range(b'a'..=b'z')).collect()
    }
}

pub fn object_path(fixture: &ChainFixture, hash: &str) -> PathBuf {
    fixture.objects_dir().join(&hash[..2]).join(&hash[2..])
}

/// Run a restore, reading until the end or the first stream error
pub fn drain(rewind: &Rewind, request: RestoreRequest) -> (ArchiveStream, std::io::Result<Vec<u8>>) {
    let mut restore = rewind.restore(request).unwrap();
    let mut bytes = Vec::new();
    let result = restore.stream.read_to_end(&mut bytes).map(|_| bytes);
    (restore.stream, result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[test]
    #[traced_test]
    fn test_random_object_corruption_becomes_placeholders() {
        let mut chaos = ChaosEngine::new(42);
        let mut fixture = ChainFixture::new();

        let mut expected = BTreeMap::new();
        let mut hashes = Vec::new();
        let mut deltas = Vec::new();
        for i in 0..30 {
            let content = chaos.content(20 + i);
            let delta = fixture.file(ChangeKind::Added, &content);
            let name = format!("file_{:02}.txt", i);
            if let Some(content_ref) = &delta.content {
                hashes.push(content_ref.object().to_string());
            }
            expected.insert(name.clone(), content);
            deltas.push((name, delta));
        }
        fixture.add_increment(100, deltas.iter().map(|(p, d)| (p.as_str(), d.clone())).collect());

        let corrupted = chaos.corrupt_objects(&fixture, &hashes, 5).unwrap();
        assert_eq!(corrupted.len(), 5);

        let rewind = fixture.open();
        let (stream, bytes) = drain(&rewind, RestoreRequest::new("", Timestamp::new(100), ArchiveKind::TarGz));
        let bytes = bytes.unwrap();
        let report = stream.finish().unwrap();

        assert_eq!(report.phase, RestorePhase::Completed);
        assert_eq!(report.files_written, 30);
        assert_eq!(report.failures.len(), 5);
        assert!(!report.is_complete());

        let files = files_of(&read_tar_gz(&bytes));
        assert_eq!(files.len(), 30);
        let failed: Vec<&str> = report.failures.iter().map(|f| f.path.as_str()).collect();
        for (name, content) in &expected {
            if failed.contains(&name.as_str()) {
                assert!(files[name].is_empty(), "{} should be a placeholder", name);
            } else {
                assert_eq!(&files[name], content, "{} should be intact", name);
            }
        }
    }

    #[test]
    fn test_invalid_diff_becomes_placeholder() {
        let mut fixture = ChainFixture::new();
        let a0 = fixture.file(ChangeKind::Added, b"hello");
        let b0 = fixture.file(ChangeKind::Added, b"fine");
        fixture.add_increment(100, vec![("a.txt", a0), ("b.txt", b0)]);
        let not_a_delta = fixture.put_object(b"this is not an rsync delta");
        fixture.add_increment(200, vec![("a.txt", PathDelta::file_diff(11, not_a_delta))]);
        let rewind = fixture.open();

        let (stream, bytes) = drain(&rewind, RestoreRequest::new("", Timestamp::new(200), ArchiveKind::Zip));
        let report = stream.finish().unwrap();
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].path, "a.txt");

        let files = files_of(&read_zip(&bytes.unwrap()));
        assert!(files["a.txt"].is_empty());
        assert_eq!(files["b.txt"], b"fine");

        // The version before the bad diff is unaffected
        let (stream, bytes) = drain(&rewind, RestoreRequest::new("a.txt", Timestamp::new(100), ArchiveKind::Zip));
        assert!(stream.finish().unwrap().is_complete());
        assert_eq!(files_of(&read_zip(&bytes.unwrap()))["a.txt"], b"hello");
    }

    #[test]
    fn test_missing_object_in_single_file_restore() {
        let mut fixture = ChainFixture::new();
        let a0 = fixture.file(ChangeKind::Added, b"soon gone");
        let hash = a0.content.as_ref().map(|c| c.object().to_string()).unwrap();
        fixture.add_increment(100, vec![("a.txt", a0)]);
        fs::remove_file(object_path(&fixture, &hash)).unwrap();
        let rewind = fixture.open();

        let (stream, bytes) = drain(&rewind, RestoreRequest::new("a.txt", Timestamp::new(100), ArchiveKind::TarGz));
        let report = stream.finish().unwrap();
        assert_eq!(report.failures.len(), 1);
        assert_eq!(read_tar_gz(&bytes.unwrap()), vec![("a.txt".to_string(), false, Vec::new())]);
    }

    #[test]
    fn test_diff_without_full_copy_fails_before_streaming() {
        let mut fixture = ChainFixture::new();
        let orphan = fixture.put_object(b"a diff whose base was never stored");
        fixture.add_increment(100, vec![("a.txt", PathDelta::file_diff(7, orphan))]);
        let rewind = fixture.open();

        let err = rewind
            .restore(RestoreRequest::new("a.txt", Timestamp::new(100), ArchiveKind::Zip))
            .unwrap_err();
        assert!(matches!(err, RewindError::CorruptContent { .. }), "{:?}", err);
        assert!(err.is_corruption());

        // Inside a directory restore the same file becomes a placeholder
        let (stream, _) = drain(&rewind, RestoreRequest::new("", Timestamp::new(100), ArchiveKind::Zip));
        assert_eq!(stream.finish().unwrap().failures.len(), 1);
    }

    #[test]
    #[traced_test]
    fn test_unreadable_object_becomes_placeholder() {
        let fixture = example_chain();
        let b_hash = ::rewind::storage::compute_hash(b"new");
        let path = object_path(&fixture, &b_hash);
        fs::remove_file(&path).unwrap();
        fs::create_dir(&path).unwrap();
        let rewind = fixture.open();

        let (stream, bytes) = drain(&rewind, RestoreRequest::new("", Timestamp::new(2000), ArchiveKind::TarGz));
        let bytes = bytes.unwrap();
        let report = stream.finish().unwrap();

        assert_eq!(report.phase, RestorePhase::Completed);
        assert_eq!(report.files_written, 2);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].path, "b.txt");

        let files = files_of(&read_tar_gz(&bytes));
        assert_eq!(files["a.txt"], b"hello world");
        assert!(files["b.txt"].is_empty());
    }

    #[test]
    fn test_chain_unreadable_mid_stream_aborts() {
        let fixture = example_chain();
        let repo = Repository::open(fixture.root()).unwrap();
        let chain = Arc::new(IncrementChain::load(&repo).unwrap());

        // Deltas are read lazily, so damage shows up once the walk needs them
        fs::write(fixture.increment_dir(3000).join("deltas.json"), b"[]").unwrap();
        let root = PathState::Directory(DirectoryState {
            path: String::new(),
            timestamp: Timestamp::new(3000),
            mode: 0o755,
            mtime: 3000,
            children: vec![ChildEntry {
                name: "a.txt".to_string(),
                kind: EntryKind::File,
            }],
        });
        let store = Arc::new(ObjectStore::new(repo.objects_dir(), true));
        let mut stream = ArchiveBuilder::new(PathResolver::new(chain), store, RewindConfig::default())
            .stream(root, ArchiveKind::TarGz)
            .unwrap();

        let mut bytes = Vec::new();
        assert!(stream.read_to_end(&mut bytes).is_err());
        // The error sticks instead of turning into a clean end of stream
        let mut buf = [0u8; 16];
        assert!(stream.read(&mut buf).is_err());
        assert_eq!(stream.phase(), RestorePhase::Aborted);
        assert!(matches!(stream.finish(), Err(RewindError::FatalStream(_))));
    }

    #[test]
    fn test_unparsable_header_is_corrupt_chain() {
        let fixture = example_chain();
        fs::write(fixture.increment_dir(2000).join("increment.json"), b"{ not json").unwrap();
        let rewind = fixture.open();

        assert!(matches!(rewind.history(), Err(RewindError::CorruptChain(_))));
        assert!(matches!(
            rewind.restore(RestoreRequest::new("a.txt", Timestamp::new(1000), ArchiveKind::Zip)),
            Err(RewindError::CorruptChain(_))
        ));
        assert_eq!(rewind.repository_info().status.as_str(), "failed");
        assert!(!rewind.check_activity(365, Timestamp::new(3000)));
    }

    #[test]
    fn test_mismatched_header_timestamp() {
        let fixture = example_chain();
        let header = IncrementHeader {
            timestamp: Timestamp::new(2500),
            parent: Some(Timestamp::new(1000)),
            statistics: SessionStatistics::default(),
        };
        fs::write(
            fixture.increment_dir(2000).join("increment.json"),
            serde_json::to_vec(&header).unwrap(),
        )
        .unwrap();

        let err = fixture.open().history().unwrap_err();
        assert!(matches!(err, RewindError::CorruptChain(_)));
        assert!(err.is_corruption());
    }

    #[test]
    fn test_broken_parent_link() {
        let fixture = example_chain();
        let header = IncrementHeader {
            timestamp: Timestamp::new(3000),
            parent: Some(Timestamp::new(1000)),
            statistics: SessionStatistics::default(),
        };
        fs::write(
            fixture.increment_dir(3000).join("increment.json"),
            serde_json::to_vec(&header).unwrap(),
        )
        .unwrap();

        assert!(matches!(fixture.open().history(), Err(RewindError::CorruptChain(_))));
    }

    #[test]
    fn test_foreign_increment_directory() {
        let fixture = example_chain();
        fs::create_dir(fixture.increments_dir().join("lost+found")).unwrap();
        assert!(matches!(fixture.open().history(), Err(RewindError::CorruptChain(_))));
    }

    #[test]
    fn test_missing_marker() {
        let fixture = example_chain();
        fs::remove_file(fixture.data_dir().join(::rewind::repository::marker_file_name(Timestamp::new(3000)))).unwrap();
        assert!(matches!(fixture.open().history(), Err(RewindError::CorruptChain(_))));
    }

    #[test]
    fn test_unreadable_deltas_only_fail_lookups_that_need_them() {
        let fixture = example_chain();
        fs::write(fixture.increment_dir(3000).join("deltas.json"), b"[]").unwrap();
        let rewind = fixture.open();

        // Headers are intact, so history still works
        assert_eq!(rewind.history().unwrap().len(), 3);
        assert!(matches!(
            rewind.resolve("a.txt", Timestamp::new(3000)),
            Err(RewindError::CorruptChain(_))
        ));
        assert!(matches!(rewind.resolve("a.txt", Timestamp::new(2000)), Ok(PathState::File(_))));

        let report = rewind.verify().unwrap();
        assert_eq!(report.errors.len(), 1);
        assert!(!report.is_valid());
    }

    #[test]
    fn test_cancel_mid_stream() {
        let mut chaos = ChaosEngine::new(7);
        let mut fixture = ChainFixture::new();
        let deltas: Vec<(String, PathDelta)> = (0..200)
            .map(|i| {
                let content = chaos.content(4096);
                (format!("bulk/{:03}.bin", i), fixture.file(ChangeKind::Added, &content))
            })
            .collect();
        let mut all: Vec<(&str, PathDelta)> = vec![("bulk", PathDelta::directory(ChangeKind::Added))];
        all.extend(deltas.iter().map(|(p, d)| (p.as_str(), d.clone())));
        fixture.add_increment(100, all);

        let rewind = RewindBuilder::new()
            .use_global_cache(false)
            .chunk_size(1024)
            .channel_capacity(1)
            .gzip_level(0)
            .build(fixture.root())
            .unwrap();

        let mut restore = rewind
            .restore(RestoreRequest::new("", Timestamp::new(100), ArchiveKind::TarGz))
            .unwrap();
        let mut first = [0u8; 512];
        restore.stream.read_exact(&mut first).unwrap();

        let report = restore.stream.cancel();
        assert!(report.cancelled);
        assert_eq!(report.phase, RestorePhase::Aborted);
        assert!(report.error.is_none());
        assert!(report.files_written < 200);
    }

    #[test]
    fn test_verify_reports_corruption() {
        let mut chaos = ChaosEngine::new(99);
        let fixture = example_chain();
        let hashes = vec![
            ::rewind::storage::compute_hash(b"hello"),
            ::rewind::storage::compute_hash(b"new"),
        ];
        chaos.corrupt_objects(&fixture, &hashes, 1).unwrap();

        let report = fixture.open().verify().unwrap();
        assert!(!report.is_valid());
        assert_eq!(report.corrupt_objects.len(), 1);
        assert!(report.missing_objects.is_empty());
    }
}
