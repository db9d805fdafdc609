//! engine
//!
//! The repository instance and everything that mutates it.
//!
//! # Architecture
//!
//! A [`Repository`] exclusively owns its locks, its open transaction, its
//! sub-stores and its caches. Mutations follow one path:
//!
//! ```text
//! wlock -> lock -> transaction -> mutate stores -> close (promote) -> release
//! ```
//!
//! - [`repository`] - open/init, lock management, working-copy operations
//! - [`transaction`] - journaled transactions with staged callbacks
//! - [`caches`] - derived state (heads, phases, metadata root)
//! - [`commit`] / [`filecommit`] - the commit pipeline
//! - [`rollback`] - explicit recovery and rollback of the last transaction
//! - [`hooks`] - typed hook events
//!
//! # Invariants
//!
//! - At most one transaction is open per instance; nested opens share it
//! - A transaction that does not close leaves every journaled file as it
//!   was before it began
//! - Callbacks receive the repository as a parameter; nothing holds a
//!   reference back to it
//!
//! # Example
//!
//! ```ignore
//! use vcstore::engine::{CommitRequest, Repository};
//!
//! let mut repo = Repository::init(&root)?;
//! repo.add(&[RepoPath::new("a")?])?;
//! let node = repo.commit(CommitRequest::new("init").user("alice"))?;
//! assert_eq!(repo.heads()?, node.into_iter().collect::<Vec<_>>());
//! ```

pub mod caches;
pub mod commit;
pub mod filecommit;
pub mod hooks;
pub mod repository;
pub mod rollback;
pub mod transaction;

pub use commit::{CommitContext, CommitRequest, FileChange, FileSource, MutationInfo};
pub use hooks::{
    BookmarkArgs, CommitArgs, HookKind, HookList, HookPolicy, HookVeto, Hooks, PhaseArgs,
    PreCommitArgs, TxnArgs,
};
pub use repository::{PostRelease, Repository};
pub use rollback::RollbackInfo;
pub use transaction::{
    BookmarkMove, Transaction, TxnChanges, TxnHandle, TxnLocking, TxnReport, TxnState,
};

use thiserror::Error;

use crate::core::cache::CacheError;
use crate::core::config::ConfigError;
use crate::core::ops::{JournalError, LockError};
use crate::core::requirements::RequirementError;
use crate::core::types::TypeError;
use crate::store::StoreError;
use crate::workingcopy::WorkingCopyError;

/// Errors from repository operations.
#[derive(Debug, Error)]
pub enum RepoError {
    /// Lock contention or lock file failure.
    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Journal(#[from] JournalError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Unsupported on-disk format.
    #[error(transparent)]
    Requirement(#[from] RequirementError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    WorkingCopy(#[from] WorkingCopyError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Type(#[from] TypeError),

    /// A veto hook refused the operation; nothing was persisted.
    #[error(transparent)]
    HookVeto(#[from] HookVeto),

    /// The caller broke an API contract.
    #[error("programming error: {0}")]
    Programming(String),

    /// The operation was refused; nothing was persisted.
    #[error("abort: {message}")]
    Abort {
        message: String,
        hint: Option<String>,
    },

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl RepoError {
    pub fn abort(message: impl Into<String>) -> Self {
        RepoError::Abort {
            message: message.into(),
            hint: None,
        }
    }

    pub fn abort_with_hint(message: impl Into<String>, hint: impl Into<String>) -> Self {
        RepoError::Abort {
            message: message.into(),
            hint: Some(hint.into()),
        }
    }

    pub(crate) fn programming(message: impl Into<String>) -> Self {
        RepoError::Programming(message.into())
    }

    /// Lock contention; the caller may retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RepoError::Lock(e) if e.is_retryable())
    }

    pub fn hint(&self) -> Option<&str> {
        match self {
            RepoError::Abort { hint, .. } => hint.as_deref(),
            _ => None,
        }
    }
}
