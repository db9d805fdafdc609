//! engine::transaction
//!
//! Journaled store transactions.
//!
//! # Architecture
//!
//! A [`Transaction`] is owned by the repository (`Repository::txn`). Opening
//! one while another is open returns a nested [`TxnHandle`] sharing the same
//! journal; only the outermost close finalizes.
//!
//! ```text
//! transaction() -> [pretxnopen] -> journal written
//!      |
//!  mutations (recorded in TxnChanges)
//!      |
//! close_transaction() -> pending -> [pretxnclose-*] -> finalize
//!      |                                                  |
//!      |                              promote journal to undo (commit point)
//!      |                                                  |
//!      |                                 release txn lock ref -> postclose
//!      |
//!   any error -> restore journal -> reload stores -> abort callbacks
//! ```
//!
//! Callbacks live in named slots and run in registration order. They
//! receive the repository and a [`TxnReport`] as parameters.
//!
//! # Lock-free transactions
//!
//! A lock-free transaction does not take the store lock, and lock requests
//! made while it is open return [`LockGuard::LockFree`]. Its journal is kept
//! in memory: an abort restores the files it covers, but a crash leaves
//! nothing for recovery to replay, and a successful close leaves no undo
//! information. This is weaker isolation than the locked path.

use std::collections::BTreeMap;
use std::fmt;

use crate::core::ops::{BackupSet, Journal, JournalError, LockGuard, LockHandle, LockKind, UndoDesc};
use crate::core::types::{BookmarkName, Node, Phase, TxnId};
use crate::core::vfs;
use crate::store::{GraphStore, PhaseMove, Stores};

use super::hooks::{BookmarkArgs, PhaseArgs, TxnArgs};
use super::repository::{finish_with_release, Repository};
use super::RepoError;

/// Local snapshot name of the working-copy tracking state.
pub(crate) const DIRSTATE_SNAPSHOT: &str = "dirstate";

pub type PendingFn = Box<dyn FnMut(&mut Repository, &TxnReport) -> Result<bool, RepoError>>;
pub type FinalizeFn = Box<dyn FnOnce(&mut Repository, &TxnReport) -> Result<(), RepoError>>;
pub type PostCloseFn = Box<dyn FnOnce(&mut Repository, &TxnReport) -> Result<(), RepoError>>;
pub type AbortFn = Box<dyn FnOnce(&mut Repository, &TxnReport)>;

/// Named callbacks in registration order.
struct CallbackSlot<F> {
    entries: Vec<(String, F)>,
}

impl<F> CallbackSlot<F> {
    fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Re-registering a name replaces the callback in place.
    fn add(&mut self, name: String, callback: F) {
        match self.entries.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = callback,
            None => self.entries.push((name, callback)),
        }
    }

    fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|(n, _)| n == name)
    }

    fn take(&mut self) -> Vec<(String, F)> {
        std::mem::take(&mut self.entries)
    }

    fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|(n, _)| n.as_str()).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    Open,
    /// The outermost close is running its callbacks.
    Committing,
    Aborting,
    Closed,
}

/// How a transaction holds the store.
#[derive(Debug, PartialEq, Eq)]
pub enum TxnLocking {
    /// One reference on the store lock, released when the transaction ends.
    Locked(LockHandle),
    LockFree,
}

impl TxnLocking {
    fn into_guard(self) -> LockGuard {
        match self {
            TxnLocking::Locked(handle) => LockGuard::Locked(handle),
            TxnLocking::LockFree => LockGuard::LockFree,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookmarkMove {
    pub old: Option<Node>,
    pub new: Option<Node>,
}

/// What a transaction changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TxnChanges {
    /// Commits added, in order.
    pub nodes: Vec<Node>,
    /// Net bookmark moves; `old` is the value before the transaction.
    pub bookmarks: BTreeMap<BookmarkName, BookmarkMove>,
    /// Net phase moves as `(before, after)`; `before` is `None` for new
    /// commits.
    pub phases: BTreeMap<Node, (Option<Phase>, Phase)>,
}

impl TxnChanges {
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.bookmarks.is_empty() && self.phases.is_empty()
    }
}

/// Context handed to transaction callbacks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxnReport {
    pub name: String,
    pub id: TxnId,
    pub changes: TxnChanges,
}

impl TxnReport {
    pub fn args(&self) -> TxnArgs {
        TxnArgs {
            txn_name: self.name.clone(),
            txn_id: self.id.clone(),
        }
    }
}

enum TxnJournal {
    /// Written to `store/journal`; promoted to undo on close.
    Disk(Journal),
    /// Lock-free: append-only lengths in `journal`, small files in `backups`.
    Memory {
        journal: Journal,
        backups: Vec<(&'static str, Option<Vec<u8>>)>,
    },
}

/// Nesting reference to the open transaction.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "transaction handles must be closed or released"]
pub struct TxnHandle {
    id: TxnId,
    depth: usize,
}

impl TxnHandle {
    pub fn id(&self) -> &TxnId {
        &self.id
    }

    /// 1 for the outermost handle.
    pub fn depth(&self) -> usize {
        self.depth
    }
}

/// The open transaction of a repository.
pub struct Transaction {
    id: TxnId,
    name: String,
    depth: usize,
    state: TxnState,
    locking: Option<TxnLocking>,
    journal: TxnJournal,
    dirstate_snapshot: Vec<u8>,
    changes: TxnChanges,
    pending: CallbackSlot<PendingFn>,
    finalize: CallbackSlot<FinalizeFn>,
    abort: CallbackSlot<AbortFn>,
    postclose: CallbackSlot<PostCloseFn>,
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("depth", &self.depth)
            .field("state", &self.state)
            .field("lock_free", &self.is_lock_free())
            .field("changes", &self.changes)
            .field("pending", &self.pending.names())
            .field("finalize", &self.finalize.names())
            .field("abort", &self.abort.names())
            .field("postclose", &self.postclose.names())
            .finish()
    }
}

impl Transaction {
    pub fn id(&self) -> &TxnId {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn state(&self) -> TxnState {
        self.state
    }

    pub fn is_lock_free(&self) -> bool {
        matches!(self.locking, Some(TxnLocking::LockFree))
    }

    pub fn changes(&self) -> &TxnChanges {
        &self.changes
    }

    pub fn report(&self) -> TxnReport {
        TxnReport {
            name: self.name.clone(),
            id: self.id.clone(),
            changes: self.changes.clone(),
        }
    }

    /// Whether a callback is registered under `name` in any slot.
    pub fn has_callback(&self, name: &str) -> bool {
        self.pending.contains(name)
            || self.finalize.contains(name)
            || self.abort.contains(name)
            || self.postclose.contains(name)
    }
}

impl Repository {
    /// Open a transaction, or nest into the open one.
    ///
    /// A locked transaction requires the store lock to be held by this
    /// instance; a lock-free one does not take it.
    pub fn transaction(&mut self, desc: &str, lockfree: bool) -> Result<TxnHandle, RepoError> {
        if let Some(txn) = self.txn.as_mut() {
            if txn.state != TxnState::Open {
                return Err(RepoError::programming(format!(
                    "cannot nest into transaction '{}' while it is closing",
                    txn.name
                )));
            }
            txn.depth += 1;
            tracing::debug!(txn = %txn.id, depth = txn.depth, "nested transaction");
            return Ok(TxnHandle {
                id: txn.id.clone(),
                depth: txn.depth,
            });
        }

        let locking = if lockfree {
            if Journal::exists(&self.paths, BackupSet::Journal) {
                return Err(RepoError::abort_with_hint(
                    "abandoned transaction found",
                    "run recover",
                ));
            }
            TxnLocking::LockFree
        } else {
            if !self.holds_lock(LockKind::Store) {
                return Err(RepoError::programming("transaction requires locking"));
            }
            match self.lock(false)? {
                LockGuard::Locked(handle) => TxnLocking::Locked(handle),
                LockGuard::LockFree => TxnLocking::LockFree,
            }
        };

        match self.open_transaction(desc, lockfree) {
            Ok(mut txn) => {
                txn.locking = Some(locking);
                let handle = TxnHandle {
                    id: txn.id.clone(),
                    depth: 1,
                };
                tracing::debug!(txn = %txn.id, desc, lockfree, "transaction opened");
                self.txn = Some(txn);
                Ok(handle)
            }
            Err(err) => {
                // Backups written before the journal itself are orphans
                if !lockfree && !Journal::exists(&self.paths, BackupSet::Journal) {
                    if let Err(cleanup) = Journal::discard(&self.paths, BackupSet::Journal) {
                        tracing::warn!(error = %cleanup, "failed to remove partial journal");
                    }
                }
                finish_with_release(Err(err), self.release_lock(locking.into_guard()))
            }
        }
    }

    fn open_transaction(&mut self, desc: &str, lockfree: bool) -> Result<Transaction, RepoError> {
        if !lockfree && crate::core::ops::recover(&self.paths)?.is_some() {
            self.stores = Stores::load(&self.paths)?;
            self.caches.invalidate_all();
        }

        let id = TxnId::generate();
        self.hooks.pretxnopen.fire(&TxnArgs {
            txn_name: desc.to_string(),
            txn_id: id.clone(),
        })?;

        let mut journal = Journal::new(id.clone(), desc);
        for file in Stores::APPEND_ONLY {
            journal.record_truncate(&self.paths, file)?;
        }
        let dirstate_snapshot = self.dirstate.to_bytes()?;

        let journal = if lockfree {
            let mut backups = Vec::new();
            for file in Stores::SMALL_FILES {
                backups.push((file, vfs::read_optional(&self.paths.store_file(file))?));
            }
            TxnJournal::Memory { journal, backups }
        } else {
            for file in Stores::SMALL_FILES {
                journal.record_backup(&self.paths, file)?;
            }
            let undo = UndoDesc {
                changelog_len: self.stores.changelog.len(),
                desc: desc.to_string(),
            };
            let undo = serde_json::to_vec(&undo).map_err(JournalError::from)?;
            journal.snapshot_local(&self.paths, DIRSTATE_SNAPSHOT, Some(&dirstate_snapshot))?;
            journal.snapshot_local(&self.paths, UndoDesc::NAME, Some(&undo))?;
            journal.write(&self.paths)?;
            TxnJournal::Disk(journal)
        };

        let mut txn = Transaction {
            id,
            name: desc.to_string(),
            depth: 1,
            state: TxnState::Open,
            locking: None,
            journal,
            dirstate_snapshot,
            changes: TxnChanges::default(),
            pending: CallbackSlot::new(),
            finalize: CallbackSlot::new(),
            abort: CallbackSlot::new(),
            postclose: CallbackSlot::new(),
        };
        register_builtin_callbacks(&mut txn);
        Ok(txn)
    }

    /// The open transaction, if any.
    pub fn current_transaction(&self) -> Option<&Transaction> {
        self.txn.as_ref()
    }

    fn open_txn_mut(&mut self) -> Result<&mut Transaction, RepoError> {
        match self.txn.as_mut() {
            Some(txn) if matches!(txn.state, TxnState::Open | TxnState::Committing) => Ok(txn),
            _ => Err(RepoError::programming("no transaction is open")),
        }
    }

    fn check_handle(&self, handle: &TxnHandle) -> Result<(), RepoError> {
        match self.txn.as_ref() {
            None => Err(RepoError::programming("no transaction is open")),
            Some(txn) if txn.id != handle.id => Err(RepoError::programming(format!(
                "transaction handle {} does not belong to the open transaction {}",
                handle.id, txn.id
            ))),
            Some(_) => Ok(()),
        }
    }

    // =========================================================================
    // Callback registration
    // =========================================================================

    /// Register a callback that makes buffered data visible to other
    /// processes without closing. Returning `Ok(true)` keeps it registered
    /// for the next [`Repository::write_pending`].
    pub fn add_pending<F>(&mut self, name: impl Into<String>, callback: F) -> Result<(), RepoError>
    where
        F: FnMut(&mut Repository, &TxnReport) -> Result<bool, RepoError> + 'static,
    {
        self.open_txn_mut()?.pending.add(name.into(), Box::new(callback));
        Ok(())
    }

    /// Register a callback run before the transaction commits. An error
    /// aborts the transaction.
    pub fn add_finalize<F>(&mut self, name: impl Into<String>, callback: F) -> Result<(), RepoError>
    where
        F: FnOnce(&mut Repository, &TxnReport) -> Result<(), RepoError> + 'static,
    {
        self.open_txn_mut()?.finalize.add(name.into(), Box::new(callback));
        Ok(())
    }

    pub fn add_abort<F>(&mut self, name: impl Into<String>, callback: F) -> Result<(), RepoError>
    where
        F: FnOnce(&mut Repository, &TxnReport) + 'static,
    {
        self.open_txn_mut()?.abort.add(name.into(), Box::new(callback));
        Ok(())
    }

    /// Register a callback run after a successful close. Errors are logged.
    pub fn add_postclose<F>(&mut self, name: impl Into<String>, callback: F) -> Result<(), RepoError>
    where
        F: FnOnce(&mut Repository, &TxnReport) -> Result<(), RepoError> + 'static,
    {
        self.open_txn_mut()?.postclose.add(name.into(), Box::new(callback));
        Ok(())
    }

    // =========================================================================
    // Change ledger
    // =========================================================================

    pub(crate) fn record_node(&mut self, node: &Node) {
        if let Some(txn) = self.txn.as_mut() {
            txn.changes.nodes.push(node.clone());
        }
    }

    pub(crate) fn record_bookmark_move(
        &mut self,
        name: &BookmarkName,
        old: Option<Node>,
        new: Option<Node>,
    ) {
        let Some(txn) = self.txn.as_mut() else {
            return;
        };
        match txn.changes.bookmarks.get_mut(name) {
            Some(mv) => mv.new = new,
            None => {
                txn.changes
                    .bookmarks
                    .insert(name.clone(), BookmarkMove { old, new });
            }
        }
    }

    pub(crate) fn record_phase_move(&mut self, mv: PhaseMove) {
        let Some(txn) = self.txn.as_mut() else {
            return;
        };
        txn.changes
            .phases
            .entry(mv.node)
            .and_modify(|(_, to)| *to = mv.to)
            .or_insert((mv.from, mv.to));
    }

    // =========================================================================
    // Pending / close / abort
    // =========================================================================

    /// Run the pending callbacks. Returns whether any ran.
    pub fn write_pending(&mut self) -> Result<bool, RepoError> {
        let txn = self.open_txn_mut()?;
        let callbacks = txn.pending.take();
        let report = txn.report();
        let ran = !callbacks.is_empty();

        let mut keep = Vec::new();
        for (name, mut callback) in callbacks {
            if callback(self, &report)? {
                keep.push((name, callback));
            }
        }
        if let Some(txn) = self.txn.as_mut() {
            for (name, callback) in keep {
                // A callback re-registered during the run wins
                if !txn.pending.contains(&name) {
                    txn.pending.add(name, callback);
                }
            }
        }
        Ok(ran)
    }

    /// Close one level of the transaction. The outermost close commits.
    pub fn close_transaction(&mut self, handle: TxnHandle) -> Result<(), RepoError> {
        self.check_handle(&handle)?;
        let Some(txn) = self.txn.as_mut() else {
            return Err(RepoError::programming("no transaction is open"));
        };
        if txn.state != TxnState::Open {
            return Err(RepoError::programming(format!(
                "transaction '{}' is not open",
                txn.name
            )));
        }
        if handle.depth != txn.depth {
            return Err(RepoError::programming(format!(
                "transaction handles closed out of order (closing depth {}, open depth {})",
                handle.depth, txn.depth
            )));
        }
        if txn.depth > 1 {
            txn.depth -= 1;
            tracing::debug!(txn = %txn.id, depth = txn.depth, "nested transaction closed");
            return Ok(());
        }

        txn.state = TxnState::Committing;
        if let Err(err) = self.commit_open_transaction() {
            tracing::warn!(error = %err, "transaction failed to close; rolling back");
            if let Err(abort_err) = self.abort_open_transaction() {
                tracing::error!(error = %abort_err, "rollback after failed close also failed");
            }
            return Err(err);
        }

        let Some(mut txn) = self.txn.take() else {
            return Ok(());
        };
        txn.state = TxnState::Closed;
        let report = txn.report();
        tracing::info!(
            txn = %txn.id,
            desc = %txn.name,
            nodes = report.changes.nodes.len(),
            "transaction closed"
        );
        let released = match txn.locking.take() {
            Some(locking) => self.release_lock(locking.into_guard()),
            None => Ok(()),
        };

        for (name, callback) in txn.postclose.take() {
            if let Err(err) = callback(self, &report) {
                tracing::warn!(callback = %name, error = %err, "postclose callback failed");
            }
        }
        released
    }

    fn commit_open_transaction(&mut self) -> Result<(), RepoError> {
        self.write_pending()?;

        let report = self.open_txn_mut()?.report();
        let args = report.args();
        for (bookmark, mv) in &report.changes.bookmarks {
            self.hooks.pretxnclose_bookmark.fire(&BookmarkArgs {
                txn: args.clone(),
                bookmark: bookmark.clone(),
                old: mv.old.clone(),
                new: mv.new.clone(),
            })?;
        }
        for (node, (old, new)) in &report.changes.phases {
            self.hooks.pretxnclose_phase.fire(&PhaseArgs {
                txn: args.clone(),
                node: node.clone(),
                old: *old,
                new: *new,
            })?;
        }
        self.hooks.pretxnclose.fire(&args)?;

        loop {
            let txn = self.open_txn_mut()?;
            let callbacks = txn.finalize.take();
            if callbacks.is_empty() {
                break;
            }
            let report = txn.report();
            for (name, callback) in callbacks {
                tracing::trace!(callback = %name, "running finalize callback");
                callback(self, &report)?;
            }
        }

        self.stores.flush()?;

        let paths = self.paths.clone();
        match &self.open_txn_mut()?.journal {
            TxnJournal::Disk(journal) => journal.promote(&paths)?,
            // No undo information for lock-free transactions
            TxnJournal::Memory { .. } => Journal::discard(&paths, BackupSet::Undo)?,
        }
        Ok(())
    }

    /// Abort the transaction `handle` belongs to, whatever its depth.
    pub fn abort_transaction(&mut self, handle: TxnHandle) -> Result<(), RepoError> {
        self.check_handle(&handle)?;
        self.abort_open_transaction()
    }

    /// Abort if the transaction is still open; otherwise do nothing.
    pub fn release_transaction(&mut self, handle: TxnHandle) -> Result<(), RepoError> {
        match self.txn.as_ref() {
            Some(txn) if txn.id == handle.id => self.abort_open_transaction(),
            _ => Ok(()),
        }
    }

    fn abort_open_transaction(&mut self) -> Result<(), RepoError> {
        let Some(mut txn) = self.txn.take() else {
            return Ok(());
        };
        txn.state = TxnState::Aborting;
        tracing::info!(txn = %txn.id, desc = %txn.name, "transaction aborted");

        let restored = self.restore_journal(&txn);
        if let Err(err) = &restored {
            tracing::error!(error = %err, "failed to restore journaled files");
        }
        let reloaded = Stores::load(&self.paths).map(|stores| self.stores = stores);
        self.caches.invalidate_all();

        let report = txn.report();
        for (_, callback) in txn.abort.take() {
            callback(self, &report);
        }
        txn.state = TxnState::Closed;

        let released = match txn.locking.take() {
            Some(locking) => self.release_lock(locking.into_guard()),
            None => Ok(()),
        };
        restored?;
        reloaded?;
        released
    }

    fn restore_journal(&mut self, txn: &Transaction) -> Result<(), RepoError> {
        match &txn.journal {
            TxnJournal::Disk(journal) => {
                journal.restore(&self.paths, BackupSet::Journal)?;
                Journal::discard(&self.paths, BackupSet::Journal)?;
            }
            TxnJournal::Memory { journal, backups } => {
                // Only truncate entries; backups are held here
                journal.restore(&self.paths, BackupSet::Journal)?;
                for (file, data) in backups {
                    let target = self.paths.store_file(file);
                    match data {
                        Some(data) => {
                            if vfs::read_optional(&target)?.as_deref() != Some(data.as_slice()) {
                                vfs::atomic_write(&target, data)?;
                            }
                        }
                        None => vfs::remove_optional(&target)?,
                    }
                }
            }
        }
        if self.dirstate.to_bytes()? != txn.dirstate_snapshot {
            self.dirstate.restore_bytes(&txn.dirstate_snapshot)?;
        }
        Ok(())
    }

    /// Run `f` in a locked transaction: close on `Ok`, abort on `Err`.
    pub fn with_transaction<T, F>(&mut self, desc: &str, f: F) -> Result<T, RepoError>
    where
        F: FnOnce(&mut Repository) -> Result<T, RepoError>,
    {
        self.run_transaction(desc, false, f)
    }

    /// Run `f` in a lock-free transaction.
    pub fn with_lockfree_transaction<T, F>(&mut self, desc: &str, f: F) -> Result<T, RepoError>
    where
        F: FnOnce(&mut Repository) -> Result<T, RepoError>,
    {
        self.run_transaction(desc, true, f)
    }

    fn run_transaction<T, F>(&mut self, desc: &str, lockfree: bool, f: F) -> Result<T, RepoError>
    where
        F: FnOnce(&mut Repository) -> Result<T, RepoError>,
    {
        let handle = self.transaction(desc, lockfree)?;
        match f(self) {
            Ok(value) => {
                self.close_transaction(handle)?;
                Ok(value)
            }
            Err(err) => {
                if let Err(abort_err) = self.release_transaction(handle) {
                    tracing::error!(error = %abort_err, "transaction abort failed");
                }
                Err(err)
            }
        }
    }
}

fn register_builtin_callbacks(txn: &mut Transaction) {
    txn.pending.add(
        "flush-stores".into(),
        Box::new(|repo: &mut Repository, _: &TxnReport| {
            repo.stores.flush()?;
            Ok(true)
        }),
    );
    txn.abort.add(
        "txnabort-hook".into(),
        Box::new(|repo: &mut Repository, report: &TxnReport| {
            // Best-effort; never fails
            let _ = repo.hooks.txnabort.fire(&report.args());
        }),
    );
    txn.postclose.add(
        "warm-caches".into(),
        Box::new(|repo: &mut Repository, _: &TxnReport| {
            repo.heads()?;
            Ok(())
        }),
    );
    txn.postclose.add(
        "txnclose-hook".into(),
        Box::new(|repo: &mut Repository, report: &TxnReport| {
            let report = report.clone();
            repo.after_lock(move |repo| {
                fire_txnclose_hooks(repo, &report);
                Ok(())
            })
        }),
    );
}

fn fire_txnclose_hooks(repo: &Repository, report: &TxnReport) {
    let args = report.args();
    // Best-effort hooks log their own failures
    let _ = repo.hooks.txnclose.fire(&args);
    for (bookmark, mv) in &report.changes.bookmarks {
        let _ = repo.hooks.txnclose_bookmark.fire(&BookmarkArgs {
            txn: args.clone(),
            bookmark: bookmark.clone(),
            old: mv.old.clone(),
            new: mv.new.clone(),
        });
    }
    for (node, (old, new)) in &report.changes.phases {
        let _ = repo.hooks.txnclose_phase.fire(&PhaseArgs {
            txn: args.clone(),
            node: node.clone(),
            old: *old,
            new: *new,
        });
    }
}
