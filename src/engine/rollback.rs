//! engine::rollback
//!
//! Recovery of interrupted transactions and rollback of the last committed
//! one.
//!
//! # Recovery vs rollback
//!
//! - `recover` replays `store/journal`, the write-ahead record of a
//!   transaction that never closed. It is also run implicitly at open and
//!   whenever the store lock is newly acquired.
//! - `rollback` replays `store/undo`, the promoted journal of the last
//!   transaction that did close. It exists for exactly one generation.
//!
//! Both replay the same entries: append-only logs are truncated to their
//! recorded length and small files are copied back from their backups.
//!
//! # Working copy
//!
//! Rollback only rewrites the tracking state when a working parent no
//! longer exists afterwards; the state saved when the undone transaction
//! opened is then restored and any merge state is dropped.

use crate::core::ops::{recover, BackupSet, Journal, UndoDesc};
use crate::core::types::Node;
use crate::store::{GraphStore, Stores};
use crate::workingcopy::MergeState;

use super::repository::{finish_with_release, Repository};
use super::transaction::DIRSTATE_SNAPSHOT;
use super::RepoError;

/// What a rollback undid (or would undo, for a dry run).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollbackInfo {
    /// Description of the undone transaction.
    pub desc: String,
    /// Changelog length after the rollback.
    pub changelog_len: usize,
    /// Commits removed, oldest first.
    pub removed: Vec<Node>,
    pub dry_run: bool,
}

impl Repository {
    /// Roll back an interrupted transaction.
    ///
    /// Returns `false` if there was nothing to recover.
    pub fn recover(&mut self) -> Result<bool, RepoError> {
        if self.txn.is_some() {
            return Err(RepoError::programming(
                "cannot recover while a transaction is open",
            ));
        }
        let guard = self.acquire_store_lock(true, false)?;
        let result = self.recover_locked();
        finish_with_release(result, self.release_lock(guard))
    }

    fn recover_locked(&mut self) -> Result<bool, RepoError> {
        match recover(&self.paths)? {
            Some(recovered) => {
                self.stores = Stores::load(&self.paths)?;
                self.caches.invalidate_all();
                tracing::info!(
                    txn = %recovered.txn_id,
                    desc = %recovered.desc,
                    "recovered interrupted transaction"
                );
                Ok(true)
            }
            None => {
                if !self.stores.refresh(&self.paths)?.is_empty() {
                    self.caches.invalidate_all();
                }
                tracing::warn!("no interrupted transaction available");
                Ok(false)
            }
        }
    }

    /// Undo the last committed transaction.
    ///
    /// Refuses to undo a commit that is not checked out unless `force`,
    /// since the working directory would keep changes that no longer have a
    /// parent to diff against.
    pub fn rollback(&mut self, dry_run: bool, force: bool) -> Result<RollbackInfo, RepoError> {
        if self.txn.is_some() {
            return Err(RepoError::programming(
                "cannot roll back while a transaction is open",
            ));
        }
        self.with_locks(|repo| repo.rollback_locked(dry_run, force))
    }

    fn rollback_locked(&mut self, dry_run: bool, force: bool) -> Result<RollbackInfo, RepoError> {
        let Some(journal) = Journal::read(&self.paths, BackupSet::Undo)? else {
            return Err(RepoError::abort("no rollback information available"));
        };
        let undo = UndoDesc::read(&self.paths, BackupSet::Undo)?.unwrap_or_else(|| UndoDesc {
            changelog_len: self.stores.changelog.len(),
            desc: journal.desc.clone(),
        });

        if undo.desc == "commit" && !force && Some(self.dirstate.p1()) != self.stores.changelog.tip()
        {
            return Err(RepoError::abort_with_hint(
                "rollback of last commit while not checked out may lose data",
                "use force",
            ));
        }

        let removed: Vec<Node> = self
            .stores
            .changelog
            .entries()
            .iter()
            .skip(undo.changelog_len)
            .map(|e| e.node.clone())
            .collect();
        let info = RollbackInfo {
            desc: undo.desc.clone(),
            changelog_len: undo.changelog_len.min(self.stores.changelog.len()),
            removed,
            dry_run,
        };
        if dry_run {
            tracing::info!(
                desc = %info.desc,
                removed = info.removed.len(),
                "would roll back last transaction"
            );
            return Ok(info);
        }

        let summary = journal.restore(&self.paths, BackupSet::Undo)?;
        self.stores = Stores::load(&self.paths)?;

        let parents_gone = self
            .dirstate
            .parents()
            .iter()
            .any(|p| !p.is_null() && !self.stores.changelog.contains(p));
        if parents_gone {
            match journal.local_snapshot(&self.paths, BackupSet::Undo, DIRSTATE_SNAPSHOT)? {
                Some(bytes) => self.dirstate.restore_bytes(&bytes)?,
                None => {
                    tracing::warn!("no saved tracking state; resetting working parents");
                    self.dirstate.set_parents(Node::null(), Node::null());
                }
            }
            MergeState::clear(&self.paths)?;
        }

        Journal::discard(&self.paths, BackupSet::Undo)?;
        self.caches.invalidate_all();
        tracing::info!(
            desc = %info.desc,
            removed = info.removed.len(),
            truncated = summary.truncated.len(),
            restored = summary.restored.len(),
            "rolled back last transaction"
        );
        Ok(info)
    }
}
