//! Main test module for Rewind
//!
//! This module includes all test suites:
//! - Integration tests for restore and history scenarios
//! - Chaos tests for damaged repositories and interrupted streams
//! - Property-based tests for chain and resolver invariants

pub mod common;
pub mod chaos;
pub mod property;

#[cfg(test)]
mod edge_cases {
    use crate::common::*;
    use ::rewind::increment::{ChangeKind, EntryKind, PathDelta};
    use ::rewind::*;
    use std::io::Read;

    fn restore_bytes(rewind: &Rewind, path: &str, ts: i64, kind: ArchiveKind) -> (Restore, Vec<u8>) {
        let mut restore = rewind
            .restore(RestoreRequest::new(path, Timestamp::new(ts), kind))
            .unwrap();
        let mut bytes = Vec::new();
        restore.stream.read_to_end(&mut bytes).unwrap();
        (restore, bytes)
    }

    #[test]
    fn test_empty_file() {
        let mut fixture = ChainFixture::new();
        fixture.add_increment(100, vec![("empty.txt", PathDelta {
            content: None,
            ..PathDelta::file(ChangeKind::Added, 0, "")
        })]);
        let rewind = fixture.open();

        let (restore, bytes) = restore_bytes(&rewind, "", 100, ArchiveKind::TarGz);
        let report = restore.stream.finish().unwrap();
        assert!(report.is_complete());

        let files = files_of(&read_tar_gz(&bytes));
        assert_eq!(files.get("empty.txt").map(Vec::len), Some(0));
    }

    #[test]
    fn test_empty_root_directory() {
        let mut fixture = ChainFixture::new();
        fixture.add_increment(100, vec![]);
        let rewind = fixture.open();

        let (restore, bytes) = restore_bytes(&rewind, "/", 100, ArchiveKind::Zip);
        let report = restore.stream.finish().unwrap();
        assert_eq!(report.files_written, 0);
        assert!(read_zip(&bytes).is_empty());
    }

    #[test]
    fn test_special_filenames() {
        let names = [
            "file with spaces.txt",
            "file-with-dashes.txt",
            "file@with#special$chars.txt",
            "file(with)parens.txt",
            "Übersicht.txt",
            "50%.txt",
        ];

        let mut fixture = ChainFixture::new();
        let deltas: Vec<(&str, PathDelta)> = names
            .iter()
            .map(|name| (*name, fixture.file(ChangeKind::Added, name.as_bytes())))
            .collect();
        fixture.add_increment(100, deltas);
        let rewind = fixture.open();

        let (restore, bytes) = restore_bytes(&rewind, "", 100, ArchiveKind::Zip);
        restore.stream.finish().unwrap();
        let files = files_of(&read_zip(&bytes));
        for name in names {
            assert_eq!(files.get(name).map(Vec::as_slice), Some(name.as_bytes()), "{}", name);
        }

        let restore = rewind
            .restore(RestoreRequest::new("50%.txt", Timestamp::new(100), ArchiveKind::Zip))
            .unwrap();
        assert_eq!(restore.content_disposition, "attachment; filename*=UTF-8''50%25.txt.zip");
        restore.stream.cancel();
    }

    #[test]
    fn test_deep_nesting() {
        let mut fixture = ChainFixture::new();
        let mut path = String::new();
        let mut deltas = Vec::new();
        for depth in 0..20 {
            if depth > 0 {
                path.push('/');
            }
            path.push_str(&format!("d{}", depth));
            deltas.push((path.clone(), PathDelta::directory(ChangeKind::Added)));
        }
        let leaf = format!("{}/leaf.txt", path);
        deltas.push((leaf.clone(), fixture.file(ChangeKind::Added, b"deep")));
        fixture.add_increment(100, deltas.iter().map(|(p, d)| (p.as_str(), d.clone())).collect());
        let rewind = fixture.open();

        let (restore, bytes) = restore_bytes(&rewind, "", 100, ArchiveKind::TarGz);
        let report = restore.stream.finish().unwrap();
        assert_eq!(report.directories_written, 20);
        assert_eq!(files_of(&read_tar_gz(&bytes)).get(&leaf).map(Vec::as_slice), Some(&b"deep"[..]));
    }

    #[test]
    fn test_resurrected_file() {
        let mut fixture = ChainFixture::new();
        let v1 = fixture.file(ChangeKind::Added, b"first life");
        fixture.add_increment(100, vec![("phoenix.txt", v1)]);
        fixture.add_increment(200, vec![("phoenix.txt", PathDelta::deleted(EntryKind::File))]);
        let v2 = fixture.file(ChangeKind::Added, b"second life");
        fixture.add_increment(300, vec![("phoenix.txt", v2)]);
        let rewind = fixture.open();

        assert!(rewind.resolve("phoenix.txt", Timestamp::new(250)).unwrap().is_absent());
        let (restore, bytes) = restore_bytes(&rewind, "", 300, ArchiveKind::TarGz);
        restore.stream.finish().unwrap();
        assert_eq!(
            files_of(&read_tar_gz(&bytes)).get("phoenix.txt").map(Vec::as_slice),
            Some(&b"second life"[..])
        );
    }
}
