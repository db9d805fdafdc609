//! workingcopy::mergestate
//!
//! An in-progress merge: the other side and the conflict state of each
//! merged file. Stored in `.vcs/merge/state`; absent when no merge is in
//! progress.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::WorkingCopyError;
use crate::core::paths::RepoPaths;
use crate::core::types::{Node, RepoPath};
use crate::core::vfs;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeFileState {
    Unresolved,
    Resolved,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeState {
    pub other: Node,
    #[serde(default)]
    pub files: BTreeMap<RepoPath, MergeFileState>,
}

impl MergeState {
    pub fn new(other: Node) -> Self {
        Self {
            other,
            files: BTreeMap::new(),
        }
    }

    /// The merge in progress, if any.
    pub fn load(paths: &RepoPaths) -> Result<Option<Self>, WorkingCopyError> {
        match vfs::read_optional(&paths.merge_state_path())? {
            Some(data) => Ok(Some(serde_json::from_slice(&data)?)),
            None => Ok(None),
        }
    }

    pub fn write(&self, paths: &RepoPaths) -> Result<(), WorkingCopyError> {
        let data = serde_json::to_vec_pretty(self)?;
        vfs::atomic_write(&paths.merge_state_path(), &data)?;
        Ok(())
    }

    /// Forget the merge in progress.
    pub fn clear(paths: &RepoPaths) -> Result<(), WorkingCopyError> {
        vfs::remove_optional(&paths.merge_state_path())?;
        Ok(())
    }

    pub fn mark(&mut self, path: RepoPath, state: MergeFileState) {
        self.files.insert(path, state);
    }

    pub fn unresolved(&self) -> Vec<&RepoPath> {
        self.files
            .iter()
            .filter(|(_, s)| **s == MergeFileState::Unresolved)
            .map(|(p, _)| p)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn write_load_clear() {
        let temp = TempDir::new().expect("temp dir");
        let paths = RepoPaths::new(temp.path());
        assert_eq!(MergeState::load(&paths).expect("load"), None);

        let a = RepoPath::new("a").expect("path");
        let mut ms = MergeState::new(Node::hash(&[b"other"]));
        ms.mark(a.clone(), MergeFileState::Unresolved);
        ms.write(&paths).expect("write");

        let back = MergeState::load(&paths).expect("load").expect("present");
        assert_eq!(back.unresolved(), vec![&a]);

        MergeState::clear(&paths).expect("clear");
        assert_eq!(MergeState::load(&paths).expect("load"), None);
    }
}
