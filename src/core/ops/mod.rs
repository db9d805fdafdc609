//! core::ops
//!
//! Locking, journaling and crash recovery.
//!
//! # Modules
//!
//! - [`lock`] - Reentrant advisory locks for the store and working copy
//! - [`journal`] - Write-ahead journal and undo promotion
//! - [`recovery`] - Rollback of abandoned journals
//!
//! # Architecture
//!
//! Every store mutation:
//! 1. Holds the store lock (working-copy lock first, if both are needed)
//! 2. Writes a journal covering every file it may touch
//! 3. Mutates the store
//! 4. On success: promotes the journal to `undo`
//! 5. On failure: restores from the journal
//!
//! A process that dies between 2 and 4 leaves the journal behind; the next
//! store-lock acquisition replays it through [`recovery::recover`].

pub mod journal;
pub mod lock;
pub mod recovery;

pub use journal::{BackupSet, Journal, JournalEntry, JournalError, RestoreSummary, UndoDesc};
pub use lock::{FileLock, HeldLock, LockError, LockGuard, LockHandle, LockKind, LockWait, OwnerId};
pub use recovery::{recover, Recovered};
