//! core::ops::recovery
//!
//! Rollback of an abandoned transaction journal.
//!
//! A `store/journal` that exists while nobody holds the store lock belongs
//! to a process that died before its transaction closed. [`recover`]
//! replays it and deletes it. Callers must hold the store lock.

use crate::core::ops::journal::{BackupSet, Journal, JournalError, RestoreSummary};
use crate::core::paths::RepoPaths;
use crate::core::types::TxnId;

/// What a recovery pass rolled back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recovered {
    pub txn_id: TxnId,
    pub desc: String,
    pub summary: RestoreSummary,
}

/// Roll back the pending journal if there is one.
///
/// Returns `None` when no journal exists.
pub fn recover(paths: &RepoPaths) -> Result<Option<Recovered>, JournalError> {
    let Some(journal) = Journal::read(paths, BackupSet::Journal)? else {
        return Ok(None);
    };

    tracing::info!(
        txn = %journal.txn_id,
        desc = %journal.desc,
        "rolling back interrupted transaction"
    );
    let summary = journal.restore(paths, BackupSet::Journal)?;
    Journal::discard(paths, BackupSet::Journal)?;
    tracing::debug!(
        truncated = summary.truncated.len(),
        restored = summary.restored.len(),
        removed = summary.removed.len(),
        "recovery complete"
    );

    Ok(Some(Recovered {
        txn_id: journal.txn_id,
        desc: journal.desc,
        summary,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn nothing_to_recover() {
        let temp = TempDir::new().expect("temp dir");
        let paths = RepoPaths::new(temp.path());
        assert_eq!(recover(&paths).expect("recover"), None);
    }

    #[test]
    fn recovers_and_discards_journal() {
        let temp = TempDir::new().expect("temp dir");
        let paths = RepoPaths::new(temp.path());
        fs::create_dir_all(paths.store_dir()).expect("mkdir");
        fs::write(paths.store_file("changelog"), b"a\n").expect("write");
        fs::write(paths.store_file("phaseroots"), b"{}").expect("write");

        let mut journal = Journal::new(TxnId::generate(), "commit");
        journal.record_truncate(&paths, "changelog").expect("entry");
        journal.record_backup(&paths, "phaseroots").expect("backup");
        journal.write(&paths).expect("write");

        fs::write(paths.store_file("changelog"), b"a\nb\n").expect("append");
        fs::write(paths.store_file("phaseroots"), b"{\"draft\":[]}").expect("write");

        let recovered = recover(&paths).expect("recover").expect("had journal");
        assert_eq!(recovered.txn_id, journal.txn_id);
        assert_eq!(recovered.desc, "commit");
        assert_eq!(fs::read(paths.store_file("changelog")).expect("read"), b"a\n");
        assert_eq!(fs::read(paths.store_file("phaseroots")).expect("read"), b"{}");
        assert!(!Journal::exists(&paths, BackupSet::Journal));
        assert!(!paths.journal_backup_path("phaseroots").exists());

        // Second pass is a no-op
        assert_eq!(recover(&paths).expect("recover"), None);
    }
}
