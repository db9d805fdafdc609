//! core::ops::journal
//!
//! Write-ahead journal for store transactions.
//!
//! # Crash Safety Contract
//!
//! 1. **Backup before mutation:** when a transaction begins, every store file
//!    it may touch is recorded: append-only logs by their current length,
//!    small files by a full copy in `journal.backup.<file>`. Backups are
//!    fsynced before the journal itself is written.
//!
//! 2. **Journal present means not committed:** while `store/journal` exists,
//!    the transaction is not committed. Recovery truncates every log back to
//!    its recorded length and copies every backup back into place.
//!
//! 3. **Promotion is the commit point:** on close the backups are renamed to
//!    `undo.backup.<file>`, local snapshots to `.vcs/undo.<name>`, and
//!    finally `journal` is renamed to `undo`. A crash before the last rename
//!    is rolled back (falling back to `undo.backup.<file>` for backups that
//!    were already moved); a crash after it leaves a clean commit.
//!
//! # Storage
//!
//! - `.vcs/store/journal` - pending transaction (JSON, fsynced)
//! - `.vcs/store/journal.backup.<file>` - small-file backups
//! - `.vcs/journal.<name>` - instance-local snapshots (`dirstate`, `desc`)
//! - `.vcs/store/undo`, `undo.backup.<file>`, `.vcs/undo.<name>` - retained
//!   copies of the last committed transaction, used by rollback
//!
//! # Usage
//!
//! ```ignore
//! use vcstore::core::ops::journal::Journal;
//!
//! let mut journal = Journal::new(TxnId::generate(), "commit");
//! journal.record_truncate(&paths, "changelog")?;
//! journal.record_backup(&paths, "bookmarks")?;
//! journal.write(&paths)?;
//!
//! // ... mutate the store ...
//!
//! journal.promote(&paths)?; // commit point
//! ```

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::paths::RepoPaths;
use crate::core::types::{TxnId, UtcTimestamp};
use crate::core::vfs;

/// Errors from journal operations.
#[derive(Debug, Error)]
pub enum JournalError {
    /// I/O error reading or writing journal files.
    #[error("journal i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("journal json error: {0}")]
    Json(#[from] serde_json::Error),

    /// A backup the journal refers to is missing.
    #[error("journal backup missing for '{0}'")]
    MissingBackup(String),

    /// Invalid journal state.
    #[error("invalid journal state: {0}")]
    InvalidState(String),
}

/// One store file covered by a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JournalEntry {
    /// An append-only log; rollback truncates it to `offset`.
    Truncate { file: String, offset: u64 },

    /// A small file; rollback copies the backup back, or removes the file
    /// if it did not exist.
    Backup { file: String, existed: bool },
}

impl JournalEntry {
    pub fn file(&self) -> &str {
        match self {
            JournalEntry::Truncate { file, .. } | JournalEntry::Backup { file, .. } => file,
        }
    }
}

/// A snapshot of an instance-local file taken at transaction start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalSnapshot {
    pub name: String,
    pub existed: bool,
}

/// Which generation of backups to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupSet {
    /// The pending transaction (`journal*`).
    Journal,
    /// The last committed transaction (`undo*`).
    Undo,
}

impl BackupSet {
    fn journal_file(&self, paths: &RepoPaths) -> PathBuf {
        match self {
            BackupSet::Journal => paths.journal_path(),
            BackupSet::Undo => paths.undo_path(),
        }
    }

    fn backup_file(&self, paths: &RepoPaths, file: &str) -> PathBuf {
        match self {
            BackupSet::Journal => paths.journal_backup_path(file),
            BackupSet::Undo => paths.undo_backup_path(file),
        }
    }

    /// Path of a local snapshot in this generation.
    pub fn local_file(&self, paths: &RepoPaths, name: &str) -> PathBuf {
        match self {
            BackupSet::Journal => paths.local_journal_path(name),
            BackupSet::Undo => paths.local_undo_path(name),
        }
    }
}

/// Description retained with every transaction (`journal.desc`/`undo.desc`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UndoDesc {
    /// Number of changelog entries before the transaction.
    pub changelog_len: usize,
    /// Transaction description ("commit", "bookmark", ...).
    pub desc: String,
}

impl UndoDesc {
    pub const NAME: &'static str = "desc";

    pub fn read(paths: &RepoPaths, set: BackupSet) -> Result<Option<Self>, JournalError> {
        match vfs::read_optional(&set.local_file(paths, Self::NAME))? {
            Some(data) => Ok(Some(serde_json::from_slice(&data)?)),
            None => Ok(None),
        }
    }
}

/// Outcome of replaying a journal.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RestoreSummary {
    /// Logs truncated back to their recorded length.
    pub truncated: Vec<String>,
    /// Small files restored from a backup.
    pub restored: Vec<String>,
    /// Small files removed because they did not exist before.
    pub removed: Vec<String>,
}

/// The journal of one transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Journal {
    pub txn_id: TxnId,
    pub desc: String,
    pub started_at: UtcTimestamp,
    pub entries: Vec<JournalEntry>,
    #[serde(default)]
    pub local: Vec<LocalSnapshot>,
}

impl Journal {
    pub fn new(txn_id: TxnId, desc: impl Into<String>) -> Self {
        Self {
            txn_id,
            desc: desc.into(),
            started_at: UtcTimestamp::now(),
            entries: Vec::new(),
            local: Vec::new(),
        }
    }

    /// Record the current length of an append-only store file.
    pub fn record_truncate(&mut self, paths: &RepoPaths, file: &str) -> Result<(), JournalError> {
        let offset = match fs::metadata(paths.store_file(file)) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };
        self.entries.push(JournalEntry::Truncate {
            file: file.to_string(),
            offset,
        });
        Ok(())
    }

    /// Copy a small store file to `journal.backup.<file>`.
    pub fn record_backup(&mut self, paths: &RepoPaths, file: &str) -> Result<(), JournalError> {
        let source = paths.store_file(file);
        let existed = source.exists();
        if existed {
            vfs::copy_synced(&source, &paths.journal_backup_path(file))?;
        }
        self.entries.push(JournalEntry::Backup {
            file: file.to_string(),
            existed,
        });
        Ok(())
    }

    /// Write an instance-local snapshot to `.vcs/journal.<name>`.
    pub fn snapshot_local(
        &mut self,
        paths: &RepoPaths,
        name: &str,
        data: Option<&[u8]>,
    ) -> Result<(), JournalError> {
        let target = paths.local_journal_path(name);
        match data {
            Some(bytes) => vfs::atomic_write(&target, bytes)?,
            None => vfs::remove_optional(&target)?,
        }
        self.local.push(LocalSnapshot {
            name: name.to_string(),
            existed: data.is_some(),
        });
        Ok(())
    }

    /// Persist the journal with fsync.
    ///
    /// When compiled with `cfg(test)` or the `fault_injection` feature, this
    /// counts as one journal step for [`fault_injection`].
    pub fn write(&self, paths: &RepoPaths) -> Result<(), JournalError> {
        check_fault()?;
        let content = serde_json::to_vec_pretty(self)?;
        vfs::atomic_write(&paths.journal_path(), &content)?;
        Ok(())
    }

    /// Read the pending journal or the retained undo journal.
    pub fn read(paths: &RepoPaths, set: BackupSet) -> Result<Option<Self>, JournalError> {
        match vfs::read_optional(&set.journal_file(paths))? {
            Some(data) => Ok(Some(serde_json::from_slice(&data)?)),
            None => Ok(None),
        }
    }

    pub fn exists(paths: &RepoPaths, set: BackupSet) -> bool {
        set.journal_file(paths).exists()
    }

    /// Restore every covered file, last entry first.
    ///
    /// For [`BackupSet::Journal`], a backup already renamed by an
    /// interrupted promotion is read from its `undo.backup.<file>` name.
    pub fn restore(&self, paths: &RepoPaths, set: BackupSet) -> Result<RestoreSummary, JournalError> {
        let mut summary = RestoreSummary::default();
        for entry in self.entries.iter().rev() {
            match entry {
                JournalEntry::Truncate { file, offset } => {
                    if truncate_to(&paths.store_file(file), *offset)? {
                        summary.truncated.push(file.clone());
                    }
                }
                JournalEntry::Backup { file, existed: true } => {
                    let backup = self.locate_backup(paths, set, file)?;
                    let data = fs::read(&backup)?;
                    let target = paths.store_file(file);
                    if vfs::read_optional(&target)?.as_deref() != Some(data.as_slice()) {
                        vfs::atomic_write(&target, &data)?;
                        summary.restored.push(file.clone());
                    }
                }
                JournalEntry::Backup { file, existed: false } => {
                    let target = paths.store_file(file);
                    if target.exists() {
                        vfs::remove_optional(&target)?;
                        summary.removed.push(file.clone());
                    }
                }
            }
        }
        Ok(summary)
    }

    fn locate_backup(
        &self,
        paths: &RepoPaths,
        set: BackupSet,
        file: &str,
    ) -> Result<PathBuf, JournalError> {
        let primary = set.backup_file(paths, file);
        if primary.exists() {
            return Ok(primary);
        }
        if set == BackupSet::Journal {
            let moved = paths.undo_backup_path(file);
            if moved.exists() {
                return Ok(moved);
            }
        }
        Err(JournalError::MissingBackup(file.to_string()))
    }

    /// Read a local snapshot of this generation.
    pub fn local_snapshot(
        &self,
        paths: &RepoPaths,
        set: BackupSet,
        name: &str,
    ) -> Result<Option<Vec<u8>>, JournalError> {
        let Some(snapshot) = self.local.iter().find(|s| s.name == name) else {
            return Ok(None);
        };
        if !snapshot.existed {
            return Ok(None);
        }
        let primary = set.local_file(paths, name);
        if let Some(data) = vfs::read_optional(&primary)? {
            return Ok(Some(data));
        }
        if set == BackupSet::Journal {
            return Ok(vfs::read_optional(&paths.local_undo_path(name))?);
        }
        Ok(None)
    }

    /// Promote this journal to the retained undo generation.
    ///
    /// The final rename of `journal` to `undo` is the commit point.
    pub fn promote(&self, paths: &RepoPaths) -> Result<(), JournalError> {
        remove_generation(paths, BackupSet::Undo)?;

        for entry in &self.entries {
            if let JournalEntry::Backup { file, existed: true } = entry {
                check_fault()?;
                fs::rename(paths.journal_backup_path(file), paths.undo_backup_path(file))?;
            }
        }
        for snapshot in self.local.iter().filter(|s| s.existed) {
            check_fault()?;
            fs::rename(
                paths.local_journal_path(&snapshot.name),
                paths.local_undo_path(&snapshot.name),
            )?;
        }
        vfs::sync_dir(&paths.local_dir())?;

        check_fault()?;
        fs::rename(paths.journal_path(), paths.undo_path())?;
        vfs::sync_dir(&paths.store_dir())?;
        Ok(())
    }

    /// Delete the journal file, its backups and its local snapshots.
    pub fn discard(paths: &RepoPaths, set: BackupSet) -> Result<(), JournalError> {
        remove_generation(paths, set)?;
        if set == BackupSet::Journal {
            // Backups an interrupted promotion had already moved
            if !Journal::exists(paths, BackupSet::Undo) {
                remove_generation(paths, BackupSet::Undo)?;
            }
        }
        Ok(())
    }
}

/// Truncate `path` to `offset`. Returns `true` if anything was cut.
fn truncate_to(path: &Path, offset: u64) -> Result<bool, JournalError> {
    let len = match fs::metadata(path) {
        Ok(meta) => meta.len(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e.into()),
    };
    if len < offset {
        tracing::warn!(
            file = %path.display(),
            len,
            offset,
            "file is shorter than its journaled length"
        );
        return Ok(false);
    }
    if len == offset {
        return Ok(false);
    }
    let file = OpenOptions::new().write(true).open(path)?;
    file.set_len(offset)?;
    file.sync_all()?;
    Ok(true)
}

/// Remove every file of one generation (journal file, backups, local snapshots).
fn remove_generation(paths: &RepoPaths, set: BackupSet) -> Result<(), JournalError> {
    let (backup_prefix, local_prefix) = match set {
        BackupSet::Journal => ("journal.backup.", "journal."),
        BackupSet::Undo => ("undo.backup.", "undo."),
    };
    // Backups go first; the journal file itself is removed last
    remove_prefixed(&paths.store_dir(), backup_prefix)?;
    remove_prefixed(&paths.local_dir(), local_prefix)?;
    vfs::remove_optional(&set.journal_file(paths))?;
    Ok(())
}

fn remove_prefixed(dir: &Path, prefix: &str) -> Result<(), JournalError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with(prefix) && entry.file_type()?.is_file() {
            vfs::remove_optional(&entry.path())?;
        }
    }
    Ok(())
}

fn check_fault() -> Result<(), JournalError> {
    #[cfg(any(test, feature = "fault_injection"))]
    if fault_injection::should_crash() {
        return Err(JournalError::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            "simulated crash for fault injection testing",
        )));
    }
    Ok(())
}

/// Fault injection for crash-safety tests.
///
/// Every journal write and every promotion rename is one step. After the
/// configured number of steps, the next one fails with a simulated I/O
/// error, leaving the files exactly as a crash at that point would.
#[cfg(any(test, feature = "fault_injection"))]
pub mod fault_injection {
    use std::cell::Cell;

    // Thread-local so parallel tests do not interfere
    thread_local! {
        /// Fail at this step (1-based). 0 disables the simulation.
        static CRASH_AT_STEP: Cell<usize> = const { Cell::new(0) };

        static STEP_COUNT: Cell<usize> = const { Cell::new(0) };
    }

    /// Fail the `n`th journal step from now. `0` disables.
    ///
    /// ```ignore
    /// // Crash on the 3rd step (journal write, then two promotion renames)
    /// fault_injection::set_crash_after(3);
    /// ```
    pub fn set_crash_after(n: usize) {
        CRASH_AT_STEP.with(|c| c.set(n));
        STEP_COUNT.with(|c| c.set(0));
    }

    /// Count one step and report whether it should fail.
    pub fn should_crash() -> bool {
        CRASH_AT_STEP.with(|threshold_cell| {
            let threshold = threshold_cell.get();
            if threshold == 0 {
                return false;
            }
            STEP_COUNT.with(|count_cell| {
                let count = count_cell.get() + 1;
                count_cell.set(count);
                count >= threshold
            })
        })
    }

    /// Disable fault injection.
    pub fn reset() {
        CRASH_AT_STEP.with(|c| c.set(0));
        STEP_COUNT.with(|c| c.set(0));
    }
}
