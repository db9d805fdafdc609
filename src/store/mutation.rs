//! store::mutation
//!
//! History-rewrite provenance: which commits a rewritten commit replaces,
//! and by which operation.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::log::AppendLog;
use super::{MutationStore, StoreError};
use crate::core::paths::RepoPaths;
use crate::core::types::{Node, UtcTimestamp};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationEntry {
    pub successor: Node,
    pub predecessors: Vec<Node>,
    /// Operation name ("amend", "rebase", ...).
    pub op: String,
    pub user: String,
    pub date: UtcTimestamp,
}

#[derive(Debug)]
pub struct MutationLog {
    log: AppendLog<MutationEntry>,
    by_successor: HashMap<Node, usize>,
}

impl MutationLog {
    pub fn open(paths: &RepoPaths) -> Result<Self, StoreError> {
        let log: AppendLog<MutationEntry> = AppendLog::open(paths.store_file("mutation"))?;
        let by_successor = log
            .entries()
            .iter()
            .enumerate()
            .map(|(idx, e)| (e.successor.clone(), idx))
            .collect();
        Ok(Self { log, by_successor })
    }

    pub fn get(&self, successor: &Node) -> Option<&MutationEntry> {
        self.by_successor
            .get(successor)
            .map(|idx| &self.log.entries()[*idx])
    }

    pub fn len(&self) -> usize {
        self.log.len()
    }

    pub fn is_empty(&self) -> bool {
        self.log.is_empty()
    }

    pub fn pending_len(&self) -> usize {
        self.log.pending_len()
    }

    pub fn flush(&mut self) -> Result<usize, StoreError> {
        self.log.flush()
    }

    pub fn is_stale(&self) -> Result<bool, StoreError> {
        self.log.is_stale()
    }
}

impl MutationStore for MutationLog {
    fn record(&mut self, entry: MutationEntry) -> Result<(), StoreError> {
        if self.by_successor.contains_key(&entry.successor) {
            return Ok(());
        }
        let successor = entry.successor.clone();
        let idx = self.log.push(entry);
        self.by_successor.insert(successor, idx);
        Ok(())
    }

    fn predecessors(&self, successor: &Node) -> Option<&[Node]> {
        self.get(successor).map(|e| e.predecessors.as_slice())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn record_and_reload() {
        let temp = TempDir::new().expect("temp dir");
        let paths = RepoPaths::new(temp.path());
        std::fs::create_dir_all(paths.store_dir()).expect("mkdir");
        let mut log = MutationLog::open(&paths).expect("open");
        let old = Node::hash(&[b"old"]);
        let new = Node::hash(&[b"new"]);
        let entry = MutationEntry {
            successor: new.clone(),
            predecessors: vec![old.clone()],
            op: "amend".into(),
            user: "test".into(),
            date: UtcTimestamp::now(),
        };
        log.record(entry.clone()).expect("record");
        log.record(entry).expect("record twice");
        assert_eq!(log.len(), 1);
        log.flush().expect("flush");

        let reopened = MutationLog::open(&paths).expect("reopen");
        assert_eq!(reopened.predecessors(&new), Some(std::slice::from_ref(&old)));
        assert_eq!(reopened.predecessors(&old), None);
    }
}
