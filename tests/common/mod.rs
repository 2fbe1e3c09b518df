//! Shared fixtures for the Rewind test suites
//!
//! [`ChainFixture`] writes repositories in the on-disk layout a backup
//! process leaves behind: mirror markers, one directory per increment with
//! its header and deltas, and framed objects.

#![allow(dead_code)]

use fast_rsync::{Signature, SignatureOptions};
use flate2::read::GzDecoder;
use rewind::compression::ObjectCodec;
use rewind::increment::{ChangeKind, DeltaFile, EntryKind, IncrementHeader, PathDelta};
use rewind::repository::{marker_file_name, DATA_DIR, DELTAS_FILE, HEADER_FILE, INCREMENTS_DIR, OBJECTS_DIR};
use rewind::storage::compute_hash;
use rewind::{Rewind, RewindBuilder, SessionStatistics, Timestamp};
use std::collections::BTreeMap;
use std::fs;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Repository written to a temporary directory
pub struct ChainFixture {
    pub dir: TempDir,
    head: Option<Timestamp>,
}

impl ChainFixture {
    /// Create an empty repository (no increments, no marker)
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let fixture = Self { dir, head: None };
        fs::create_dir_all(fixture.increments_dir()).unwrap();
        fs::create_dir_all(fixture.objects_dir()).unwrap();
        fixture
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn data_dir(&self) -> PathBuf {
        self.root().join(DATA_DIR)
    }

    pub fn increments_dir(&self) -> PathBuf {
        self.data_dir().join(INCREMENTS_DIR)
    }

    pub fn objects_dir(&self) -> PathBuf {
        self.data_dir().join(OBJECTS_DIR)
    }

    pub fn increment_dir(&self, ts: i64) -> PathBuf {
        self.increments_dir().join(ts.to_string())
    }

    /// Store content as a framed object and return its id
    pub fn put_object(&self, content: &[u8]) -> String {
        let hash = compute_hash(content);
        self.put_raw(&hash, &ObjectCodec::new().encode(content));
        hash
    }

    /// Write framed bytes under an arbitrary id
    pub fn put_raw(&self, hash: &str, framed: &[u8]) {
        let shard = self.objects_dir().join(&hash[..2]);
        fs::create_dir_all(&shard).unwrap();
        fs::write(shard.join(&hash[2..]), framed).unwrap();
    }

    /// Store the rsync delta turning `old` into `new` and return its id
    pub fn put_diff(&self, old: &[u8], new: &[u8]) -> String {
        self.put_object(&make_diff(old, new))
    }

    /// A file version stored as a full copy
    pub fn file(&self, change: ChangeKind, content: &[u8]) -> PathDelta {
        PathDelta::file(change, content.len() as u64, self.put_object(content))
    }

    /// A file version stored as a diff against `old`
    pub fn diff(&self, old: &[u8], new: &[u8]) -> PathDelta {
        PathDelta::file_diff(new.len() as u64, self.put_diff(old, new))
    }

    /// Append a completed increment with default statistics
    pub fn add_increment(&mut self, ts: i64, deltas: Vec<(&str, PathDelta)>) -> &mut Self {
        self.add_increment_with_stats(ts, SessionStatistics::default(), deltas)
    }

    /// Append a completed increment and move the mirror marker to it
    pub fn add_increment_with_stats(
        &mut self,
        ts: i64,
        statistics: SessionStatistics,
        deltas: Vec<(&str, PathDelta)>,
    ) -> &mut Self {
        let header = IncrementHeader {
            timestamp: Timestamp::new(ts),
            parent: self.head,
            statistics,
        };
        self.write_increment(ts, &header, deltas);

        if let Some(previous) = self.head {
            fs::remove_file(self.data_dir().join(marker_file_name(previous))).unwrap();
        }
        self.write_marker(ts);
        self.head = Some(Timestamp::new(ts));
        self
    }

    /// Write an increment directory without touching the markers
    pub fn write_increment(&self, ts: i64, header: &IncrementHeader, deltas: Vec<(&str, PathDelta)>) {
        let dir = self.increment_dir(ts);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(HEADER_FILE), serde_json::to_vec_pretty(header).unwrap()).unwrap();

        let file = DeltaFile {
            entries: deltas
                .into_iter()
                .map(|(path, delta)| (path.to_string(), delta))
                .collect::<BTreeMap<_, _>>(),
        };
        fs::write(dir.join(DELTAS_FILE), serde_json::to_vec_pretty(&file).unwrap()).unwrap();
    }

    pub fn write_marker(&self, ts: i64) {
        fs::write(self.data_dir().join(marker_file_name(Timestamp::new(ts))), b"").unwrap();
    }

    /// Simulate a backup run that has started but not finished
    ///
    /// Adds a second marker and a partially written increment directory.
    pub fn begin_backup(&self, ts: i64) {
        self.write_marker(ts);
        let dir = self.increment_dir(ts);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(HEADER_FILE), b"{ \"timestamp\": ").unwrap();
    }

    /// Finish a backup started with [`ChainFixture::begin_backup`]
    pub fn finish_backup(&mut self, ts: i64, deltas: Vec<(&str, PathDelta)>) {
        fs::remove_file(self.data_dir().join(marker_file_name(Timestamp::new(ts)))).unwrap();
        self.add_increment(ts, deltas);
    }

    /// Open the repository with a private chain cache
    pub fn open(&self) -> Rewind {
        RewindBuilder::new()
            .use_global_cache(false)
            .build(self.root())
            .unwrap()
    }
}

/// The three-increment history used throughout the suites
///
/// - t0 = 1000: `a.txt = "hello"`
/// - t1 = 2000: `a.txt = "hello world"` (diff), `b.txt = "new"`
/// - t2 = 3000: `b.txt` deleted
pub fn example_chain() -> ChainFixture {
    let mut fixture = ChainFixture::new();
    let a0 = fixture.file(ChangeKind::Added, b"hello");
    fixture.add_increment_with_stats(1000, stats(1, 0, 0), vec![("a.txt", a0)]);

    let a1 = fixture.diff(b"hello", b"hello world");
    let b1 = fixture.file(ChangeKind::Added, b"new");
    fixture.add_increment_with_stats(2000, stats(1, 1, 0), vec![("a.txt", a1), ("b.txt", b1)]);

    fixture.add_increment_with_stats(3000, stats(0, 0, 1), vec![("b.txt", PathDelta::deleted(EntryKind::File))]);
    fixture
}

/// Statistics with only the file counters set
pub fn stats(new_files: u64, changed_files: u64, deleted_files: u64) -> SessionStatistics {
    SessionStatistics {
        new_files,
        changed_files,
        deleted_files,
        ..Default::default()
    }
}

pub fn make_diff(old: &[u8], new: &[u8]) -> Vec<u8> {
    let signature = Signature::calculate(
        old,
        SignatureOptions {
            block_size: 64,
            crypto_hash_size: 8,
        },
    );
    let mut delta = Vec::new();
    fast_rsync::diff(&signature.index(), new, &mut delta).unwrap();
    delta
}

/// Entries of a tar.gz archive as `(name, is_dir, content)`
pub fn read_tar_gz(bytes: &[u8]) -> Vec<(String, bool, Vec<u8>)> {
    let mut archive = tar::Archive::new(GzDecoder::new(bytes));
    archive
        .entries()
        .unwrap()
        .map(|entry| {
            let mut entry = entry.unwrap();
            let name = entry.path().unwrap().to_string_lossy().trim_end_matches('/').to_string();
            let is_dir = entry.header().entry_type().is_dir();
            let mut content = Vec::new();
            entry.read_to_end(&mut content).unwrap();
            (name, is_dir, content)
        })
        .collect()
}

/// Entries of a zip archive as `(name, is_dir, content)`
pub fn read_zip(bytes: &[u8]) -> Vec<(String, bool, Vec<u8>)> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).unwrap();
    (0..archive.len())
        .map(|i| {
            let mut file = archive.by_index(i).unwrap();
            let is_dir = file.is_dir();
            let name = file.name().trim_end_matches('/').to_string();
            let mut content = Vec::new();
            file.read_to_end(&mut content).unwrap();
            (name, is_dir, content)
        })
        .collect()
}

/// File entries only, as `name -> content`
pub fn files_of(entries: &[(String, bool, Vec<u8>)]) -> BTreeMap<String, Vec<u8>> {
    entries
        .iter()
        .filter(|(_, is_dir, _)| !is_dir)
        .map(|(name, _, content)| (name.clone(), content.clone()))
        .collect()
}
