//! core::paths
//!
//! Centralized path routing for repository storage locations.
//!
//! # Storage Layout
//!
//! ```text
//! <root>/                        working files
//! <root>/.vcs/                   instance-local area
//!     requires                   local requirements
//!     config.toml                repository configuration
//!     wlock                      working-copy lock
//!     dirstate                   working-copy tracking state
//!     bookmarks.current          active bookmark
//!     merge/state                in-progress merge
//!     last-message.txt           saved commit message
//!     journal.<name> / undo.<name>
//! <root>/.vcs/store/             shared store area
//!     requires                   store requirements
//!     lock                       store lock
//!     changelog manifests filelog mutation      append-only logs
//!     bookmarks phaseroots visibleheads         small metadata files
//!     journal journal.backup.<f> undo undo.backup.<f>
//! ```
//!
//! **Hard rule:** no code outside this module joins `.vcs` or `store`
//! onto a path by hand.
//!
//! # Example
//!
//! ```
//! use vcstore::core::paths::RepoPaths;
//! use std::path::PathBuf;
//!
//! let paths = RepoPaths::new("/repo");
//! assert_eq!(paths.store_lock_path(), PathBuf::from("/repo/.vcs/store/lock"));
//! assert_eq!(paths.wlock_path(), PathBuf::from("/repo/.vcs/wlock"));
//! ```

use std::path::{Path, PathBuf};

use crate::core::types::RepoPath;

/// Name of the metadata directory under the working root.
pub const LOCAL_DIR: &str = ".vcs";

/// Centralized path routing for one repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoPaths {
    /// The working directory root.
    pub root: PathBuf,
}

impl RepoPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    // =========================================================================
    // Instance-local area
    // =========================================================================

    pub fn local_dir(&self) -> PathBuf {
        self.root.join(LOCAL_DIR)
    }

    pub fn local_file(&self, name: &str) -> PathBuf {
        self.local_dir().join(name)
    }

    pub fn requires_path(&self) -> PathBuf {
        self.local_file("requires")
    }

    pub fn config_path(&self) -> PathBuf {
        self.local_file("config.toml")
    }

    /// The working-copy lock protects the local area.
    pub fn wlock_path(&self) -> PathBuf {
        self.local_file("wlock")
    }

    pub fn dirstate_path(&self) -> PathBuf {
        self.local_file("dirstate")
    }

    pub fn active_bookmark_path(&self) -> PathBuf {
        self.local_file("bookmarks.current")
    }

    pub fn merge_state_path(&self) -> PathBuf {
        self.local_dir().join("merge").join("state")
    }

    pub fn last_message_path(&self) -> PathBuf {
        self.local_file("last-message.txt")
    }

    /// `journal.<name>` snapshot of a local file.
    pub fn local_journal_path(&self, name: &str) -> PathBuf {
        self.local_file(&format!("journal.{}", name))
    }

    /// `undo.<name>` retained copy of a local snapshot.
    pub fn local_undo_path(&self, name: &str) -> PathBuf {
        self.local_file(&format!("undo.{}", name))
    }

    // =========================================================================
    // Store area
    // =========================================================================

    pub fn store_dir(&self) -> PathBuf {
        self.local_dir().join("store")
    }

    pub fn store_file(&self, name: &str) -> PathBuf {
        self.store_dir().join(name)
    }

    pub fn store_requires_path(&self) -> PathBuf {
        self.store_file("requires")
    }

    /// The store lock protects the store area.
    pub fn store_lock_path(&self) -> PathBuf {
        self.store_file("lock")
    }

    pub fn journal_path(&self) -> PathBuf {
        self.store_file("journal")
    }

    pub fn undo_path(&self) -> PathBuf {
        self.store_file("undo")
    }

    pub fn journal_backup_path(&self, file: &str) -> PathBuf {
        self.store_file(&format!("journal.backup.{}", file))
    }

    pub fn undo_backup_path(&self, file: &str) -> PathBuf {
        self.store_file(&format!("undo.backup.{}", file))
    }

    // =========================================================================
    // Working files
    // =========================================================================

    /// Absolute path of a tracked working file.
    pub fn wfile(&self, path: &RepoPath) -> PathBuf {
        let mut full = self.root.clone();
        for component in path.as_str().split('/') {
            full.push(component);
        }
        full
    }

    /// Convert an absolute working path back to a [`RepoPath`].
    pub fn relativize(&self, path: &Path) -> Option<RepoPath> {
        let rel = path.strip_prefix(&self.root).ok()?;
        let joined = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/");
        RepoPath::new(joined).ok()
    }
}
