//! workingcopy
//!
//! The minimal working-copy tracking needed to commit.
//!
//! # Modules
//!
//! - [`dirstate`] - tracked files, working parents, copy records
//! - [`matcher`] - which paths a commit covers
//! - [`status`] - working-copy changes against the first parent
//! - [`mergestate`] - an in-progress merge and its conflicts
//!
//! All state lives under `.vcs/` and is guarded by the working-copy lock.

pub mod dirstate;
pub mod matcher;
pub mod mergestate;
pub mod status;

pub use dirstate::{Dirstate, FileState};
pub use matcher::Matcher;
pub use mergestate::{MergeFileState, MergeState};
pub use status::{Status, WorkingFile};

use thiserror::Error;

use crate::core::types::TypeError;
use crate::store::StoreError;

/// Errors from working-copy operations.
#[derive(Debug, Error)]
pub enum WorkingCopyError {
    #[error("working copy i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("working copy json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("'{0}' is not tracked")]
    NotTracked(String),

    #[error("'{0}' does not exist in the working copy")]
    Missing(String),

    #[error(transparent)]
    Type(#[from] TypeError),

    #[error(transparent)]
    Store(#[from] StoreError),
}
