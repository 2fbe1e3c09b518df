//! Property-based testing for Rewind
//!
//! Uses proptest to check restores against a simple model of the backed-up
//! tree: whatever sequence of writes and deletions the increments record,
//! restoring any point in time yields exactly the files the model held then.

use crate::common::*;
use ::rewind::disposition::content_disposition;
use ::rewind::increment::{ChangeKind, EntryKind, PathDelta};
use ::rewind::utils::normalize_path;
use ::rewind::*;
use proptest::prelude::*;
use std::collections::BTreeMap;
use std::io::Read;

/// Paths the generated histories touch; `d` always exists
const FILES: [&str; 4] = ["a.txt", "b.txt", "d/c.txt", "d/e.txt"];

/// One change to one file: new content (as a full copy or a diff), or removal
#[derive(Debug, Clone)]
pub struct FileChange {
    pub file: usize,
    pub content: Option<Vec<u8>>,
    pub as_diff: bool,
}

fn change_strategy() -> impl Strategy<Value = FileChange> {
    (
        0..FILES.len(),
        prop::option::weighted(0.75, prop::collection::vec(any::<u8>(), 1..300)),
        any::<bool>(),
    )
        .prop_map(|(file, content, as_diff)| FileChange { file, content, as_diff })
}

fn history_strategy() -> impl Strategy<Value = Vec<Vec<FileChange>>> {
    prop::collection::vec(prop::collection::vec(change_strategy(), 0..5), 1..5)
}

/// Write a generated history to disk and return the model state after each increment
///
/// A path touched more than once in one run keeps only its last change, as
/// a backup run records one delta per path.
pub fn build_history(history: &[Vec<FileChange>]) -> (ChainFixture, Vec<(i64, BTreeMap<String, Vec<u8>>)>) {
    let mut fixture = ChainFixture::new();
    let mut model: BTreeMap<String, Vec<u8>> = BTreeMap::new();
    let mut states = Vec::new();

    for (i, changes) in history.iter().enumerate() {
        let ts = 1000 * (i as i64 + 1);
        let mut deltas: BTreeMap<String, PathDelta> = BTreeMap::new();
        if i == 0 {
            deltas.insert("d".to_string(), PathDelta::directory(ChangeKind::Added));
        }

        let last_changes: BTreeMap<&str, &FileChange> =
            changes.iter().map(|change| (FILES[change.file], change)).collect();
        for (path, change) in last_changes {
            match (&change.content, model.get(path)) {
                (Some(content), Some(old)) if change.as_diff => {
                    let delta = fixture.diff(old, content);
                    deltas.insert(path.to_string(), delta);
                    model.insert(path.to_string(), content.clone());
                }
                (Some(content), old) => {
                    let kind = if old.is_some() { ChangeKind::Changed } else { ChangeKind::Added };
                    deltas.insert(path.to_string(), fixture.file(kind, content));
                    model.insert(path.to_string(), content.clone());
                }
                (None, Some(_)) => {
                    deltas.insert(path.to_string(), PathDelta::deleted(EntryKind::File));
                    model.remove(path);
                }
                (None, None) => {}
            }
        }

        fixture.add_increment(ts, deltas.iter().map(|(p, d)| (p.as_str(), d.clone())).collect());
        states.push((ts, model.clone()));
    }

    (fixture, states)
}

fn restore_files(rewind: &Rewind, ts: i64) -> BTreeMap<String, Vec<u8>> {
    let mut restore = rewind
        .restore(RestoreRequest::new("", Timestamp::new(ts), ArchiveKind::TarGz))
        .unwrap();
    let mut bytes = Vec::new();
    restore.stream.read_to_end(&mut bytes).unwrap();
    let report = restore.stream.finish().unwrap();
    assert!(report.failures.is_empty(), "{:?}", report.failures);
    files_of(&read_tar_gz(&bytes))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_restore_matches_model(history in history_strategy()) {
        let (fixture, states) = build_history(&history);
        let rewind = fixture.open();

        for (ts, expected) in &states {
            let restored = restore_files(&rewind, *ts);
            prop_assert_eq!(&restored, expected, "mismatch at {}", ts);
        }
    }

    #[test]
    fn prop_history_is_strictly_increasing(history in history_strategy()) {
        let (fixture, states) = build_history(&history);
        let rewind = fixture.open();

        let entries = rewind.history().unwrap();
        prop_assert_eq!(entries.len(), states.len());
        prop_assert!(entries[0].is_base);
        prop_assert!(entries.windows(2).all(|w| w[0].timestamp < w[1].timestamp));

        // Listing twice yields the same entries
        prop_assert_eq!(entries, rewind.history().unwrap());
    }

    #[test]
    fn prop_time_between_increments_resolves_to_earlier(
        history in history_strategy(),
        offset in 0i64..1000,
    ) {
        let (fixture, states) = build_history(&history);
        let rewind = fixture.open();

        for (ts, _) in &states {
            for path in FILES {
                let at = rewind.resolve(path, Timestamp::new(*ts)).ok();
                let between = rewind.resolve(path, Timestamp::new(ts + offset)).ok();
                prop_assert_eq!(at, between);
            }
        }
    }

    #[test]
    fn prop_children_match_model(history in history_strategy()) {
        let (fixture, states) = build_history(&history);
        let rewind = fixture.open();

        for (ts, files) in &states {
            let children: Vec<String> = rewind
                .list_children("d", Timestamp::new(*ts))
                .unwrap()
                .into_iter()
                .map(|child| child.name)
                .collect();
            let expected: Vec<String> = files
                .keys()
                .filter_map(|path| path.strip_prefix("d/").map(str::to_string))
                .collect();
            prop_assert_eq!(children, expected);
        }
    }

    #[test]
    fn prop_content_disposition_is_header_safe(name in "[\\PC\\r\\n\\t\"]{1,40}") {
        let value = content_disposition(&name);
        prop_assert!(value.starts_with("attachment; filename"));
        if let Some(encoded) = value.strip_prefix("attachment; filename*=UTF-8''") {
            prop_assert!(encoded
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || "%_.-~?".contains(c)));
        } else {
            prop_assert!(name.is_ascii());
            prop_assert!(!name.contains(';') && !name.contains('%') && !name.contains('\\'));
            prop_assert!(!name.chars().any(|c| c.is_ascii_control()));
            prop_assert_eq!(&value, &format!("attachment; filename=\"{}\"", name.replace('"', "\\\"")));
        }
        prop_assert!(!value.contains(['\r', '\n']));
    }

    #[test]
    fn prop_normalize_path_is_idempotent(segments in prop::collection::vec("[a-z0-9._-]{1,8}", 0..5)) {
        let raw = format!("/{}/", segments.join("/"));
        if let Ok(normalized) = normalize_path(&raw) {
            prop_assert_eq!(normalize_path(&normalized).unwrap(), normalized.clone());
            prop_assert!(!normalized.starts_with('/') && !normalized.ends_with('/'));
        }
    }
}
