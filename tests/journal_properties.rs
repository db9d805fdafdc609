//! Property-based tests for journal replay.
//!
//! Whatever a transaction does to the store files after its journal is
//! written, replaying the journal brings every covered file back to the
//! exact bytes it had before.

use std::collections::BTreeMap;
use std::fs;

use proptest::prelude::*;
use tempfile::TempDir;

use vcstore::core::ops::{BackupSet, Journal};
use vcstore::core::paths::RepoPaths;
use vcstore::core::types::TxnId;

const LOGS: [&str; 2] = ["changelog", "filelog"];
const SMALL: [&str; 2] = ["bookmarks", "phaseroots"];

/// One mutation a transaction may apply.
#[derive(Debug, Clone)]
enum Mutation {
    Append { log: usize, data: Vec<u8> },
    Rewrite { file: usize, data: Vec<u8> },
    Delete { file: usize },
}

fn line() -> impl Strategy<Value = Vec<u8>> {
    "[a-z0-9{}\":,]{0,40}".prop_map(|s| {
        let mut bytes = s.into_bytes();
        bytes.push(b'\n');
        bytes
    })
}

fn mutation() -> impl Strategy<Value = Mutation> {
    prop_oneof![
        (0..LOGS.len(), line()).prop_map(|(log, data)| Mutation::Append { log, data }),
        (0..SMALL.len(), prop::collection::vec(any::<u8>(), 0..64))
            .prop_map(|(file, data)| Mutation::Rewrite { file, data }),
        (0..SMALL.len()).prop_map(|file| Mutation::Delete { file }),
    ]
}

/// Initial contents: every log exists, small files may be absent.
fn initial_state() -> impl Strategy<Value = (Vec<Vec<u8>>, Vec<Option<Vec<u8>>>)> {
    (
        prop::collection::vec(prop::collection::vec(line(), 0..4).prop_map(|l| l.concat()), 2),
        prop::collection::vec(prop::option::of(prop::collection::vec(any::<u8>(), 0..64)), 2),
    )
}

fn snapshot(paths: &RepoPaths) -> BTreeMap<&'static str, Option<Vec<u8>>> {
    LOGS.iter()
        .chain(SMALL.iter())
        .map(|name| (*name, fs::read(paths.store_file(name)).ok()))
        .collect()
}

fn setup(logs: &[Vec<u8>], small: &[Option<Vec<u8>>]) -> (TempDir, RepoPaths) {
    let temp = TempDir::new().expect("temp dir");
    let paths = RepoPaths::new(temp.path());
    fs::create_dir_all(paths.store_dir()).expect("mkdir");
    for (name, data) in LOGS.iter().zip(logs) {
        fs::write(paths.store_file(name), data).expect("write log");
    }
    for (name, data) in SMALL.iter().zip(small) {
        if let Some(data) = data {
            fs::write(paths.store_file(name), data).expect("write small file");
        }
    }
    (temp, paths)
}

fn begin(paths: &RepoPaths) -> Journal {
    let mut journal = Journal::new(TxnId::generate(), "prop");
    for name in LOGS {
        journal.record_truncate(paths, name).expect("truncate entry");
    }
    for name in SMALL {
        journal.record_backup(paths, name).expect("backup entry");
    }
    journal.write(paths).expect("write journal");
    journal
}

fn apply(paths: &RepoPaths, mutations: &[Mutation]) {
    for m in mutations {
        match m {
            Mutation::Append { log, data } => {
                let path = paths.store_file(LOGS[*log]);
                let mut bytes = fs::read(&path).unwrap_or_default();
                bytes.extend_from_slice(data);
                fs::write(&path, bytes).expect("append");
            }
            Mutation::Rewrite { file, data } => {
                fs::write(paths.store_file(SMALL[*file]), data).expect("rewrite");
            }
            Mutation::Delete { file } => {
                let _ = fs::remove_file(paths.store_file(SMALL[*file]));
            }
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn restore_is_byte_identical(
        (logs, small) in initial_state(),
        mutations in prop::collection::vec(mutation(), 0..12),
    ) {
        let (_temp, paths) = setup(&logs, &small);
        let before = snapshot(&paths);

        let journal = begin(&paths);
        apply(&paths, &mutations);
        journal.restore(&paths, BackupSet::Journal).expect("restore");

        prop_assert_eq!(snapshot(&paths), before);
    }

    #[test]
    fn restore_from_disk_after_crash(
        (logs, small) in initial_state(),
        mutations in prop::collection::vec(mutation(), 1..12),
    ) {
        let (_temp, paths) = setup(&logs, &small);
        let before = snapshot(&paths);

        // The in-memory journal is lost with the crashed process
        drop(begin(&paths));
        apply(&paths, &mutations);

        let recovered = vcstore::core::ops::recover(&paths).expect("recover");
        prop_assert!(recovered.is_some());
        prop_assert_eq!(snapshot(&paths), before);
        prop_assert!(!Journal::exists(&paths, BackupSet::Journal));
    }

    #[test]
    fn undo_generation_restores_pre_transaction_bytes(
        (logs, small) in initial_state(),
        mutations in prop::collection::vec(mutation(), 0..12),
    ) {
        let (_temp, paths) = setup(&logs, &small);
        let before = snapshot(&paths);

        let journal = begin(&paths);
        apply(&paths, &mutations);
        journal.promote(&paths).expect("promote");
        prop_assert!(Journal::exists(&paths, BackupSet::Undo));

        let undo = Journal::read(&paths, BackupSet::Undo)
            .expect("read undo")
            .expect("undo present");
        undo.restore(&paths, BackupSet::Undo).expect("rollback");
        prop_assert_eq!(snapshot(&paths), before);
    }
}
