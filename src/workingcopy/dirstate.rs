//! workingcopy::dirstate
//!
//! Tracking state of the working copy: its parents, the state of every
//! tracked file, and pending copy records.
//!
//! # Invariants
//!
//! - Changes stay in memory until [`Dirstate::write`]; the working-copy lock
//!   release writes a dirty state
//! - While a parent change is in progress the in-memory state is not
//!   written; releasing the lock in that state discards it instead
//!
//! # Storage
//!
//! `.vcs/dirstate`, JSON, rewritten atomically.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::WorkingCopyError;
use crate::core::paths::RepoPaths;
use crate::core::types::{Node, RepoPath};
use crate::core::vfs::{self, FileStamp};

/// State of one tracked path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileState {
    /// Tracked and present in the first parent.
    Normal,
    /// Scheduled for addition.
    Added,
    /// Scheduled for removal.
    Removed,
    /// Taken from the second parent during a merge.
    Merged,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct DirstateData {
    parents: [Node; 2],
    #[serde(default)]
    entries: BTreeMap<RepoPath, FileState>,
    /// destination -> source
    #[serde(default)]
    copies: BTreeMap<RepoPath, RepoPath>,
}

impl Default for DirstateData {
    fn default() -> Self {
        Self {
            parents: [Node::null(), Node::null()],
            entries: BTreeMap::new(),
            copies: BTreeMap::new(),
        }
    }
}

#[derive(Debug)]
pub struct Dirstate {
    path: PathBuf,
    data: DirstateData,
    dirty: bool,
    parent_change: usize,
    stamp: FileStamp,
}

impl Dirstate {
    pub fn load(paths: &RepoPaths) -> Result<Self, WorkingCopyError> {
        let path = paths.dirstate_path();
        let stamp = FileStamp::of(&path)?;
        let data = match vfs::read_optional(&path)? {
            Some(bytes) => serde_json::from_slice(&bytes)?,
            None => DirstateData::default(),
        };
        Ok(Self {
            path,
            data,
            dirty: false,
            parent_change: 0,
            stamp,
        })
    }

    /// Serialized form, as written to disk.
    pub fn to_bytes(&self) -> Result<Vec<u8>, WorkingCopyError> {
        Ok(serde_json::to_vec_pretty(&self.data)?)
    }

    /// Replace the on-disk state with `bytes` (a snapshot taken earlier)
    /// and reload.
    pub fn restore_bytes(&mut self, bytes: &[u8]) -> Result<(), WorkingCopyError> {
        let data: DirstateData = serde_json::from_slice(bytes)?;
        vfs::atomic_write(&self.path, bytes)?;
        self.data = data;
        self.dirty = false;
        self.parent_change = 0;
        self.stamp = FileStamp::of(&self.path)?;
        Ok(())
    }

    /// Write the state if it changed.
    pub fn write(&mut self) -> Result<(), WorkingCopyError> {
        if !self.dirty {
            return Ok(());
        }
        if self.parent_change > 0 {
            tracing::debug!("dirstate write skipped during parent change");
            return Ok(());
        }
        let bytes = self.to_bytes()?;
        vfs::atomic_write(&self.path, &bytes)?;
        self.stamp = FileStamp::of(&self.path)?;
        self.dirty = false;
        Ok(())
    }

    /// Drop in-memory changes and reload from disk.
    pub fn discard(&mut self) -> Result<(), WorkingCopyError> {
        let path = self.path.clone();
        let stamp = FileStamp::of(&path)?;
        self.data = match vfs::read_optional(&path)? {
            Some(bytes) => serde_json::from_slice(&bytes)?,
            None => DirstateData::default(),
        };
        self.dirty = false;
        self.parent_change = 0;
        self.stamp = stamp;
        Ok(())
    }

    pub fn is_stale(&self) -> Result<bool, WorkingCopyError> {
        Ok(FileStamp::of(&self.path)? != self.stamp)
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn begin_parent_change(&mut self) {
        self.parent_change += 1;
    }

    pub fn end_parent_change(&mut self) {
        self.parent_change = self.parent_change.saturating_sub(1);
    }

    pub fn has_pending_parent_change(&self) -> bool {
        self.parent_change > 0
    }

    pub fn p1(&self) -> &Node {
        &self.data.parents[0]
    }

    pub fn p2(&self) -> &Node {
        &self.data.parents[1]
    }

    pub fn parents(&self) -> [Node; 2] {
        self.data.parents.clone()
    }

    pub fn is_merge(&self) -> bool {
        !self.p2().is_null()
    }

    pub fn set_parents(&mut self, p1: Node, p2: Node) {
        self.data.parents = [p1, p2];
        self.dirty = true;
    }

    pub fn state(&self, path: &RepoPath) -> Option<FileState> {
        self.data.entries.get(path).copied()
    }

    pub fn entries(&self) -> impl Iterator<Item = (&RepoPath, FileState)> {
        self.data.entries.iter().map(|(p, s)| (p, *s))
    }

    /// Whether any tracked path lives under `dir`.
    pub fn has_dir(&self, dir: &str) -> bool {
        self.data.entries.keys().any(|p| p.is_under(dir))
    }

    pub fn copy_source(&self, path: &RepoPath) -> Option<&RepoPath> {
        self.data.copies.get(path)
    }

    /// Schedule `path` for addition. Re-adding a removed file restores it.
    pub fn add(&mut self, path: RepoPath) {
        let next = match self.state(&path) {
            Some(FileState::Removed) => FileState::Normal,
            Some(existing) => existing,
            None => FileState::Added,
        };
        self.data.entries.insert(path, next);
        self.dirty = true;
    }

    /// Schedule `path` for removal. Removing an added file forgets it.
    pub fn remove(&mut self, path: &RepoPath) -> Result<(), WorkingCopyError> {
        match self.state(path) {
            None => return Err(WorkingCopyError::NotTracked(path.to_string())),
            Some(FileState::Added) => {
                self.data.entries.remove(path);
            }
            Some(_) => {
                self.data.entries.insert(path.clone(), FileState::Removed);
            }
        }
        self.data.copies.remove(path);
        self.dirty = true;
        Ok(())
    }

    /// Record `dest` as a copy of `source`, adding `dest` if needed.
    pub fn copy(&mut self, source: RepoPath, dest: RepoPath) {
        if self.state(&dest).is_none() {
            self.data.entries.insert(dest.clone(), FileState::Added);
        }
        self.data.copies.insert(dest, source);
        self.dirty = true;
    }

    /// Mark `path` as taken from the second parent.
    pub fn merge(&mut self, path: RepoPath) {
        self.data.entries.insert(path, FileState::Merged);
        self.dirty = true;
    }

    /// Record that `node` was committed from `files`.
    ///
    /// Parents become `(node, null)`; committed files become clean and
    /// their copy records are dropped.
    pub fn mark_committed(&mut self, node: &Node, files: &[RepoPath]) {
        self.data.parents = [node.clone(), Node::null()];
        for path in files {
            match self.state(path) {
                Some(FileState::Removed) => {
                    self.data.entries.remove(path);
                }
                Some(_) => {
                    self.data.entries.insert(path.clone(), FileState::Normal);
                }
                None => {}
            }
            self.data.copies.remove(path);
        }
        // Merged entries are committed with the merge as a whole
        for state in self.data.entries.values_mut() {
            if *state == FileState::Merged {
                *state = FileState::Normal;
            }
        }
        self.dirty = true;
    }
}
