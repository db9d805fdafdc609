//! store
//!
//! File-backed sub-stores under `.vcs/store`.
//!
//! # Modules
//!
//! - [`changelog`] - append-only commit graph
//! - [`manifest`] - manifests written as deltas against a base
//! - [`filelog`] - file revisions
//! - [`phases`] - phase roots
//! - [`bookmarks`] - bookmark pointers
//! - [`visibility`] - visible heads
//! - [`mutation`] - history-rewrite provenance
//!
//! # Architecture
//!
//! Two kinds of files, matching the two kinds of journal entries:
//!
//! - **Append-only logs** (`changelog`, `manifests`, `filelog`, `mutation`)
//!   buffer new entries in memory; [`Stores::flush`] appends them. Rollback
//!   truncates to the pre-transaction length.
//! - **Small files** (`bookmarks`, `phaseroots`, `visibleheads`) are
//!   rewritten atomically on every change. Rollback copies a backup back.
//!
//! The engine talks to the stores through the narrow collaborator traits
//! defined here.

pub mod bookmarks;
pub mod changelog;
pub mod filelog;
pub mod log;
pub mod manifest;
pub mod mutation;
pub mod phases;
pub mod visibility;

pub use bookmarks::Bookmarks;
pub use changelog::{Changelog, ChangelogEntry, NewCommit};
pub use filelog::{CopySource, FileRevision, Filelog};
pub use manifest::{manifest_id, Manifest, ManifestDelta, ManifestEntry, ManifestLog};
pub use mutation::{MutationEntry, MutationLog};
pub use phases::{PhaseMove, PhaseRoots};
pub use visibility::VisibleHeads;

use std::collections::HashSet;

use thiserror::Error;

use crate::core::paths::RepoPaths;
use crate::core::types::{Node, Phase, TypeError};

/// Errors from store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("corrupt store file '{file}': {message}")]
    Corrupt { file: String, message: String },

    #[error("unknown node {0}")]
    UnknownNode(Node),

    #[error("unknown manifest {0}")]
    UnknownManifest(Node),

    #[error("unknown revision {node} of '{path}'")]
    UnknownFileRevision { path: String, node: Node },

    #[error(transparent)]
    Type(#[from] TypeError),
}

/// The commit graph.
pub trait GraphStore {
    /// Append a commit and return its node. Appending a commit that already
    /// exists returns the existing node.
    fn append(&mut self, commit: NewCommit) -> Result<Node, StoreError>;

    fn parents(&self, node: &Node) -> Option<&[Node]>;

    fn contains(&self, node: &Node) -> bool;

    /// Number of commits, including buffered ones.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The most recently appended commit.
    fn tip(&self) -> Option<&Node>;

    /// Whether `ancestor` is `node` or one of its ancestors.
    fn is_ancestor(&self, ancestor: &Node, node: &Node) -> bool {
        let mut seen = HashSet::new();
        let mut stack = vec![node.clone()];
        while let Some(current) = stack.pop() {
            if &current == ancestor {
                return true;
            }
            if !seen.insert(current.clone()) {
                continue;
            }
            if let Some(parents) = self.parents(&current) {
                stack.extend(parents.iter().cloned());
            }
        }
        false
    }
}

/// Manifest storage.
pub trait ManifestStore {
    /// Write `delta` applied to `base`; returns the new manifest id.
    fn write(&mut self, base: &Node, delta: &ManifestDelta) -> Result<Node, StoreError>;

    /// Read a full manifest. The null id is the empty manifest.
    fn read(&self, id: &Node) -> Result<Manifest, StoreError>;
}

/// Phase storage.
pub trait PhaseStore {
    /// Record the phase of a newly added commit.
    fn register(
        &mut self,
        graph: &dyn GraphStore,
        node: &Node,
        phase: Phase,
    ) -> Result<Option<PhaseMove>, StoreError>;

    fn phase_of(&self, graph: &dyn GraphStore, node: &Node) -> Phase;
}

/// Mutation provenance storage.
pub trait MutationStore {
    fn record(&mut self, entry: MutationEntry) -> Result<(), StoreError>;

    fn predecessors(&self, successor: &Node) -> Option<&[Node]>;
}

/// Every sub-store of one repository.
#[derive(Debug)]
pub struct Stores {
    pub changelog: Changelog,
    pub manifests: ManifestLog,
    pub filelog: Filelog,
    pub phases: PhaseRoots,
    pub bookmarks: Bookmarks,
    pub visibility: VisibleHeads,
    pub mutation: MutationLog,
}

impl Stores {
    /// Store files truncated on rollback.
    pub const APPEND_ONLY: [&'static str; 4] = ["changelog", "manifests", "filelog", "mutation"];

    /// Store files restored from a backup on rollback.
    pub const SMALL_FILES: [&'static str; 3] = ["bookmarks", "phaseroots", "visibleheads"];

    /// Create empty store files for a new repository.
    pub fn create(paths: &RepoPaths) -> Result<(), StoreError> {
        std::fs::create_dir_all(paths.store_dir())?;
        for name in Self::APPEND_ONLY {
            let path = paths.store_file(name);
            if !path.exists() {
                crate::core::vfs::atomic_write(&path, b"")?;
            }
        }
        Bookmarks::load(paths)?.write()?;
        PhaseRoots::load(paths)?.write()?;
        VisibleHeads::load(paths)?.write()?;
        Ok(())
    }

    pub fn load(paths: &RepoPaths) -> Result<Self, StoreError> {
        Ok(Self {
            changelog: Changelog::open(paths)?,
            manifests: ManifestLog::open(paths)?,
            filelog: Filelog::open(paths)?,
            phases: PhaseRoots::load(paths)?,
            bookmarks: Bookmarks::load(paths)?,
            visibility: VisibleHeads::load(paths)?,
            mutation: MutationLog::open(paths)?,
        })
    }

    /// Append every buffered entry to disk. Returns the number written.
    pub fn flush(&mut self) -> Result<usize, StoreError> {
        // Dependencies first: file revisions, manifests, then the changelog
        let mut written = self.filelog.flush()?;
        written += self.manifests.flush()?;
        written += self.changelog.flush()?;
        written += self.mutation.flush()?;
        Ok(written)
    }

    pub fn has_pending(&self) -> bool {
        self.filelog.pending_len() > 0
            || self.manifests.pending_len() > 0
            || self.changelog.pending_len() > 0
            || self.mutation.pending_len() > 0
    }

    /// Reload every store whose file changed on disk. Returns their names.
    pub fn refresh(&mut self, paths: &RepoPaths) -> Result<Vec<&'static str>, StoreError> {
        let mut reloaded = Vec::new();
        if self.changelog.is_stale()? {
            self.changelog = Changelog::open(paths)?;
            reloaded.push("changelog");
        }
        if self.manifests.is_stale()? {
            self.manifests = ManifestLog::open(paths)?;
            reloaded.push("manifests");
        }
        if self.filelog.is_stale()? {
            self.filelog = Filelog::open(paths)?;
            reloaded.push("filelog");
        }
        if self.mutation.is_stale()? {
            self.mutation = MutationLog::open(paths)?;
            reloaded.push("mutation");
        }
        if self.phases.is_stale()? {
            self.phases = PhaseRoots::load(paths)?;
            reloaded.push("phaseroots");
        }
        if self.bookmarks.is_stale()? {
            self.bookmarks = Bookmarks::load(paths)?;
            reloaded.push("bookmarks");
        }
        if self.visibility.is_stale()? {
            self.visibility = VisibleHeads::load(paths)?;
            reloaded.push("visibleheads");
        }
        Ok(reloaded)
    }
}
