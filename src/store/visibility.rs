//! store::visibility
//!
//! Visible heads. Commits not reachable from a visible head are hidden.
//! Adding a commit replaces its parents in the set.

use std::collections::BTreeSet;
use std::path::PathBuf;

use super::StoreError;
use crate::core::paths::RepoPaths;
use crate::core::types::Node;
use crate::core::vfs::{self, FileStamp};

#[derive(Debug)]
pub struct VisibleHeads {
    path: PathBuf,
    heads: BTreeSet<Node>,
    stamp: FileStamp,
}

impl VisibleHeads {
    pub fn load(paths: &RepoPaths) -> Result<Self, StoreError> {
        let path = paths.store_file("visibleheads");
        let stamp = FileStamp::of(&path)?;
        let heads = match vfs::read_optional(&path)? {
            Some(data) => serde_json::from_slice(&data)?,
            None => BTreeSet::new(),
        };
        Ok(Self { path, heads, stamp })
    }

    pub fn write(&mut self) -> Result<(), StoreError> {
        let data = serde_json::to_vec(&self.heads)?;
        vfs::atomic_write(&self.path, &data)?;
        self.stamp = FileStamp::of(&self.path)?;
        Ok(())
    }

    pub fn is_stale(&self) -> Result<bool, StoreError> {
        Ok(FileStamp::of(&self.path)? != self.stamp)
    }

    pub fn heads(&self) -> &BTreeSet<Node> {
        &self.heads
    }

    pub fn contains(&self, node: &Node) -> bool {
        self.heads.contains(node)
    }

    /// Make `node` visible, replacing its parents.
    pub fn add(&mut self, node: &Node, parents: &[Node]) -> Result<(), StoreError> {
        let mut changed = false;
        for parent in parents {
            changed |= self.heads.remove(parent);
        }
        changed |= self.heads.insert(node.clone());
        if changed {
            self.write()?;
        }
        Ok(())
    }

    /// Hide `node`, exposing `replacements` instead.
    pub fn remove(&mut self, node: &Node, replacements: &[Node]) -> Result<(), StoreError> {
        let mut changed = self.heads.remove(node);
        for replacement in replacements.iter().filter(|n| !n.is_null()) {
            changed |= self.heads.insert(replacement.clone());
        }
        if changed {
            self.write()?;
        }
        Ok(())
    }
}
