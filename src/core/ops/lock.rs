//! core::ops::lock
//!
//! Advisory file locks for the store and the working copy.
//!
//! # Architecture
//!
//! A repository has two named locks, each stored in the directory it
//! protects:
//!
//! - `.vcs/wlock` - working-copy lock (tracking state, merge state)
//! - `.vcs/store/lock` - store lock (everything under `.vcs/store`)
//!
//! Cross-process exclusion uses OS-level locks via `fs2`. Within one
//! repository instance a lock is reentrant: [`HeldLock`] counts nested
//! acquisitions and keeps the callbacks to run after the outermost release.
//! The instance that owns a lock is identified by an [`OwnerId`] carried in
//! every [`LockHandle`].
//!
//! # Invariants
//!
//! - The working-copy lock is acquired before the store lock
//! - Only the outermost release unlocks the file
//! - A blocking acquire never waits longer than its timeout
//! - Lock contention is retryable; see [`LockError::is_retryable`]
//!
//! # Example
//!
//! ```ignore
//! use vcstore::core::ops::lock::{FileLock, LockWait};
//!
//! let lock = FileLock::acquire(&paths.store_lock_path(), LockWait::NoWait, "pid:42")?;
//! assert!(lock.is_held());
//! // released on drop
//! ```

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use fs2::FileExt;
use thiserror::Error;
use uuid::Uuid;

/// Errors from locking operations.
#[derive(Debug, Error)]
pub enum LockError {
    /// Another process holds the lock and the caller asked not to wait.
    #[error("repository busy: {} is held by {holder}", .path.display())]
    Busy { path: PathBuf, holder: String },

    /// The lock stayed held for the whole timeout.
    #[error("repository busy: timed out after {}s waiting for {} held by {holder}", .waited.as_secs(), .path.display())]
    Timeout {
        path: PathBuf,
        holder: String,
        waited: Duration,
    },

    /// Working-copy lock requested while the store lock is held.
    #[error("lock order violation: \"wlock\" acquired after \"lock\"")]
    OrderViolation,

    /// Failed to create lock file or directory.
    #[error("failed to create lock: {0}")]
    CreateFailed(String),

    /// Failed to acquire the OS lock.
    #[error("failed to acquire lock: {0}")]
    AcquireFailed(String),

    /// Failed to release the lock.
    #[error("failed to release lock: {0}")]
    ReleaseFailed(String),

    /// I/O error during lock operations.
    #[error("lock i/o error: {0}")]
    IoError(#[from] std::io::Error),
}

impl LockError {
    /// Contention errors can be retried by the caller; everything else
    /// indicates a real failure.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LockError::Busy { .. } | LockError::Timeout { .. })
    }
}

/// The two named repository locks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockKind {
    /// `.vcs/store/lock`
    Store,
    /// `.vcs/wlock`
    WorkingCopy,
}

impl LockKind {
    pub fn name(&self) -> &'static str {
        match self {
            LockKind::Store => "lock",
            LockKind::WorkingCopy => "wlock",
        }
    }
}

/// Identity of a repository instance holding locks.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OwnerId(String);

impl OwnerId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for OwnerId {
    fn default() -> Self {
        Self::new()
    }
}

/// How long an acquire may block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockWait {
    /// Fail with [`LockError::Busy`] on contention.
    NoWait,
    /// Poll until `timeout`, logging once after `warn_after`.
    Wait { timeout: Duration, warn_after: Duration },
}

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// An OS-level exclusive lock on one lock file.
///
/// Released when dropped.
#[derive(Debug)]
pub struct FileLock {
    path: PathBuf,
    file: Option<File>,
}

impl FileLock {
    /// Acquire the lock at `path`, writing `holder` into the file for
    /// diagnostics.
    ///
    /// # Errors
    ///
    /// - [`LockError::Busy`] on contention with [`LockWait::NoWait`]
    /// - [`LockError::Timeout`] if the wait expires
    /// - [`LockError::CreateFailed`] if the lock file cannot be created
    pub fn acquire(path: &Path, wait: LockWait, holder: &str) -> Result<Self, LockError> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(|e| {
                LockError::CreateFailed(format!("cannot create {}: {}", dir.display(), e))
            })?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| {
                LockError::CreateFailed(format!("cannot open {}: {}", path.display(), e))
            })?;

        let start = Instant::now();
        let mut warned = false;
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => break,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(LockError::AcquireFailed(e.to_string())),
            }

            let holder_info = Self::read_holder(path);
            let (timeout, warn_after) = match wait {
                LockWait::NoWait => {
                    return Err(LockError::Busy {
                        path: path.to_path_buf(),
                        holder: holder_info,
                    })
                }
                LockWait::Wait {
                    timeout,
                    warn_after,
                } => (timeout, warn_after),
            };

            let waited = start.elapsed();
            if waited >= timeout {
                return Err(LockError::Timeout {
                    path: path.to_path_buf(),
                    holder: holder_info,
                    waited,
                });
            }
            if !warned && waited >= warn_after {
                tracing::warn!(
                    lock = %path.display(),
                    holder = %holder_info,
                    "waiting for lock held by another process"
                );
                warned = true;
            }
            std::thread::sleep(POLL_INTERVAL.min(timeout - waited));
        }

        let mut lock = Self {
            path: path.to_path_buf(),
            file: Some(file),
        };
        lock.write_holder(holder)?;
        tracing::debug!(lock = %path.display(), "lock acquired");
        Ok(lock)
    }

    /// Try to acquire without waiting, returning `None` on contention.
    pub fn try_acquire(path: &Path, holder: &str) -> Result<Option<Self>, LockError> {
        match Self::acquire(path, LockWait::NoWait, holder) {
            Ok(lock) => Ok(Some(lock)),
            Err(LockError::Busy { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn write_holder(&mut self, holder: &str) -> Result<(), LockError> {
        if let Some(file) = self.file.as_mut() {
            file.set_len(0)?;
            file.seek(SeekFrom::Start(0))?;
            file.write_all(holder.as_bytes())?;
        }
        Ok(())
    }

    /// Best-effort read of the holder description stored in a lock file.
    pub fn read_holder(path: &Path) -> String {
        let mut contents = String::new();
        match File::open(path).and_then(|mut f| f.read_to_string(&mut contents)) {
            Ok(_) if !contents.trim().is_empty() => contents.trim().to_string(),
            _ => "unknown".to_string(),
        }
    }

    pub fn is_held(&self) -> bool {
        self.file.is_some()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Release the lock explicitly. Safe to call more than once.
    pub fn release(&mut self) -> Result<(), LockError> {
        if let Some(file) = self.file.take() {
            // Clear the holder so stale diagnostics are not reported
            let _ = file.set_len(0);
            file.unlock()
                .map_err(|e| LockError::ReleaseFailed(e.to_string()))?;
        }
        Ok(())
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            let _ = file.unlock();
        }
    }
}

/// A lock held by one repository instance, with its reentrancy count and
/// post-release callbacks.
#[derive(Debug)]
pub struct HeldLock<F> {
    file: FileLock,
    count: usize,
    postrelease: Vec<F>,
}

impl<F> HeldLock<F> {
    pub fn new(file: FileLock) -> Self {
        Self {
            file,
            count: 1,
            postrelease: Vec::new(),
        }
    }

    /// Record a nested acquisition.
    pub fn enter(&mut self) {
        self.count += 1;
    }

    /// Record a release. Returns `true` when this was the outermost one.
    pub fn exit(&mut self) -> bool {
        self.count = self.count.saturating_sub(1);
        self.count == 0
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn push_postrelease(&mut self, f: F) {
        self.postrelease.push(f);
    }

    /// Unlock the file and hand back the callbacks, in registration order.
    pub fn unlock(mut self) -> Result<Vec<F>, LockError> {
        self.file.release()?;
        Ok(std::mem::take(&mut self.postrelease))
    }
}

/// Proof that an instance holds one reference to a lock.
///
/// Handles are returned to the repository to release them; the
/// `with_lock` helpers guarantee that on every exit path.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "lock handles must be released"]
pub struct LockHandle {
    kind: LockKind,
    owner: OwnerId,
}

impl LockHandle {
    pub fn new(kind: LockKind, owner: OwnerId) -> Self {
        Self { kind, owner }
    }

    pub fn kind(&self) -> LockKind {
        self.kind
    }

    pub fn owner(&self) -> &OwnerId {
        &self.owner
    }
}

/// Result of a lock request.
///
/// Inside a lock-free transaction, lock requests do not touch disk and
/// return [`LockGuard::LockFree`].
#[derive(Debug, PartialEq, Eq)]
#[must_use = "lock guards must be released"]
pub enum LockGuard {
    Locked(LockHandle),
    LockFree,
}

impl LockGuard {
    pub fn is_lock_free(&self) -> bool {
        matches!(self, LockGuard::LockFree)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn lock_path(temp: &TempDir) -> PathBuf {
        temp.path().join("store").join("lock")
    }

    #[test]
    fn acquire_creates_directory_and_file() {
        let temp = TempDir::new().expect("temp dir");
        let path = lock_path(&temp);
        let lock = FileLock::acquire(&path, LockWait::NoWait, "pid:1").expect("acquire");
        assert!(lock.is_held());
        assert!(path.exists());
        assert_eq!(FileLock::read_holder(&path), "pid:1");
    }

    #[test]
    fn second_acquire_is_busy() {
        let temp = TempDir::new().expect("temp dir");
        let path = lock_path(&temp);
        let _lock = FileLock::acquire(&path, LockWait::NoWait, "pid:1").expect("acquire");

        match FileLock::acquire(&path, LockWait::NoWait, "pid:2") {
            Err(err @ LockError::Busy { .. }) => {
                assert!(err.is_retryable());
                assert!(err.to_string().contains("pid:1"));
            }
            other => panic!("expected Busy, got {:?}", other),
        }
    }

    #[test]
    fn blocking_acquire_times_out() {
        let temp = TempDir::new().expect("temp dir");
        let path = lock_path(&temp);
        let _lock = FileLock::acquire(&path, LockWait::NoWait, "pid:1").expect("acquire");

        let wait = LockWait::Wait {
            timeout: Duration::from_millis(120),
            warn_after: Duration::from_millis(10),
        };
        let start = Instant::now();
        let result = FileLock::acquire(&path, wait, "pid:2");
        assert!(matches!(result, Err(LockError::Timeout { .. })));
        assert!(start.elapsed() >= Duration::from_millis(120));
    }

    #[test]
    fn blocking_acquire_succeeds_after_release() {
        let temp = TempDir::new().expect("temp dir");
        let path = lock_path(&temp);
        let holder = FileLock::acquire(&path, LockWait::NoWait, "pid:1").expect("acquire");

        let releaser = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            drop(holder);
        });
        let wait = LockWait::Wait {
            timeout: Duration::from_secs(5),
            warn_after: Duration::from_secs(5),
        };
        let lock = FileLock::acquire(&path, wait, "pid:2").expect("acquire after wait");
        assert!(lock.is_held());
        releaser.join().expect("join");
    }

    #[test]
    fn try_acquire_returns_none_when_locked() {
        let temp = TempDir::new().expect("temp dir");
        let path = lock_path(&temp);
        let _lock = FileLock::acquire(&path, LockWait::NoWait, "pid:1").expect("acquire");
        assert!(FileLock::try_acquire(&path, "pid:2").expect("try").is_none());
    }

    #[test]
    fn release_is_idempotent_and_frees_lock() {
        let temp = TempDir::new().expect("temp dir");
        let path = lock_path(&temp);
        let mut lock = FileLock::acquire(&path, LockWait::NoWait, "pid:1").expect("acquire");
        lock.release().expect("first release");
        lock.release().expect("second release");
        assert!(!lock.is_held());
        assert_eq!(FileLock::read_holder(&path), "unknown");

        let again = FileLock::acquire(&path, LockWait::NoWait, "pid:2").expect("reacquire");
        assert!(again.is_held());
    }

    #[test]
    fn held_lock_counts_and_returns_callbacks_in_order() {
        let temp = TempDir::new().expect("temp dir");
        let path = lock_path(&temp);
        let file = FileLock::acquire(&path, LockWait::NoWait, "pid:1").expect("acquire");

        let mut held: HeldLock<&'static str> = HeldLock::new(file);
        held.enter();
        assert_eq!(held.count(), 2);
        held.push_postrelease("first");
        held.push_postrelease("second");

        assert!(!held.exit());
        assert!(held.exit());
        let callbacks = held.unlock().expect("unlock");
        assert_eq!(callbacks, vec!["first", "second"]);

        assert!(FileLock::try_acquire(&path, "pid:2").expect("try").is_some());
    }

    #[test]
    fn error_classification() {
        assert!(!LockError::OrderViolation.is_retryable());
        assert!(!LockError::CreateFailed("x".into()).is_retryable());
        assert!(LockError::OrderViolation.to_string().contains("wlock"));
    }
}
