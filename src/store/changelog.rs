//! store::changelog
//!
//! The append-only commit graph.
//!
//! Every line of `store/changelog` is one [`ChangelogEntry`]. A commit's
//! node is derived from all of its content, so appending the same commit
//! twice yields the same node and a single entry.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};

use super::log::AppendLog;
use super::{GraphStore, StoreError};
use crate::core::paths::RepoPaths;
use crate::core::types::{Node, RepoPath, UtcTimestamp};

/// One commit as stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangelogEntry {
    pub node: Node,
    /// Non-null parents, first parent first.
    pub parents: Vec<Node>,
    pub manifest: Node,
    pub user: String,
    pub date: UtcTimestamp,
    pub description: String,
    /// Paths touched by the commit, sorted.
    pub files: Vec<RepoPath>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

/// A commit about to be appended.
#[derive(Debug, Clone)]
pub struct NewCommit {
    pub parents: Vec<Node>,
    pub manifest: Node,
    pub user: String,
    pub date: UtcTimestamp,
    pub description: String,
    pub files: Vec<RepoPath>,
    pub extra: BTreeMap<String, String>,
}

impl NewCommit {
    /// The node this commit will get.
    pub fn node(&self) -> Node {
        let parents = self
            .parents
            .iter()
            .map(Node::as_str)
            .collect::<Vec<_>>()
            .join(",");
        let files = self
            .files
            .iter()
            .map(RepoPath::as_str)
            .collect::<Vec<_>>()
            .join("\n");
        let extra = self
            .extra
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("\0");
        let date = self.date.to_rfc3339();
        Node::hash(&[
            parents.as_bytes(),
            self.manifest.as_str().as_bytes(),
            self.user.as_bytes(),
            date.as_bytes(),
            self.description.as_bytes(),
            files.as_bytes(),
            extra.as_bytes(),
        ])
    }
}

#[derive(Debug)]
pub struct Changelog {
    log: AppendLog<ChangelogEntry>,
    index: HashMap<Node, usize>,
}

impl Changelog {
    pub fn open(paths: &RepoPaths) -> Result<Self, StoreError> {
        let log: AppendLog<ChangelogEntry> = AppendLog::open(paths.store_file("changelog"))?;
        let index = log
            .entries()
            .iter()
            .enumerate()
            .map(|(rev, entry)| (entry.node.clone(), rev))
            .collect();
        Ok(Self { log, index })
    }

    pub fn get(&self, node: &Node) -> Option<&ChangelogEntry> {
        self.index.get(node).map(|rev| &self.log.entries()[*rev])
    }

    /// Entry number of `node`, in append order.
    pub fn rev(&self, node: &Node) -> Option<usize> {
        self.index.get(node).copied()
    }

    pub fn entries(&self) -> &[ChangelogEntry] {
        self.log.entries()
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

    /// Commits without children.
    pub fn heads(&self) -> Vec<Node> {
        let mut has_child = HashSet::new();
        for entry in self.entries() {
            has_child.extend(entry.parents.iter().cloned());
        }
        self.entries()
            .iter()
            .filter(|e| !has_child.contains(&e.node))
            .map(|e| e.node.clone())
            .collect()
    }

    /// `node` and every commit reachable through parents.
    pub fn ancestors(&self, node: &Node) -> HashSet<Node> {
        let mut seen = HashSet::new();
        let mut stack = vec![node.clone()];
        while let Some(current) = stack.pop() {
            if !seen.insert(current.clone()) {
                continue;
            }
            if let Some(entry) = self.get(&current) {
                stack.extend(entry.parents.iter().cloned());
            }
        }
        seen
    }

    /// The members of `nodes` that are not ancestors of another member.
    ///
    /// Unknown and null nodes are skipped. The result is sorted.
    pub fn heads_of<'a, I>(&self, nodes: I) -> Vec<Node>
    where
        I: IntoIterator<Item = &'a Node>,
    {
        let candidates: HashSet<Node> = nodes
            .into_iter()
            .filter(|n| !n.is_null() && self.index.contains_key(*n))
            .cloned()
            .collect();
        let mut covered = HashSet::new();
        for node in &candidates {
            if let Some(entry) = self.get(node) {
                for parent in &entry.parents {
                    covered.extend(self.ancestors(parent));
                }
            }
        }
        let mut heads: Vec<Node> = candidates
            .into_iter()
            .filter(|n| !covered.contains(n))
            .collect();
        heads.sort();
        heads
    }
}

impl GraphStore for Changelog {
    fn append(&mut self, commit: NewCommit) -> Result<Node, StoreError> {
        let node = commit.node();
        if self.index.contains_key(&node) {
            return Ok(node);
        }
        let parents: Vec<Node> = commit
            .parents
            .into_iter()
            .filter(|p| !p.is_null())
            .collect();
        for parent in &parents {
            if !self.index.contains_key(parent) {
                return Err(StoreError::UnknownNode(parent.clone()));
            }
        }
        let rev = self.log.push(ChangelogEntry {
            node: node.clone(),
            parents,
            manifest: commit.manifest,
            user: commit.user,
            date: commit.date,
            description: commit.description,
            files: commit.files,
            extra: commit.extra,
        });
        self.index.insert(node.clone(), rev);
        tracing::trace!(node = %node, rev, "changelog entry buffered");
        Ok(node)
    }

    fn parents(&self, node: &Node) -> Option<&[Node]> {
        self.get(node).map(|e| e.parents.as_slice())
    }

    fn contains(&self, node: &Node) -> bool {
        self.index.contains_key(node)
    }

    fn len(&self) -> usize {
        self.log.len()
    }

    fn tip(&self) -> Option<&Node> {
        self.log.entries().last().map(|e| &e.node)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tempfile::TempDir;

    pub(crate) fn commit(parents: &[&Node], description: &str) -> NewCommit {
        NewCommit {
            parents: parents.iter().map(|p| (*p).clone()).collect(),
            manifest: Node::null(),
            user: "test".into(),
            date: UtcTimestamp::from_datetime(chrono::DateTime::<chrono::Utc>::UNIX_EPOCH),
            description: description.into(),
            files: Vec::new(),
            extra: BTreeMap::new(),
        }
    }

    fn open() -> (TempDir, RepoPaths, Changelog) {
        let temp = TempDir::new().expect("temp dir");
        let paths = RepoPaths::new(temp.path());
        std::fs::create_dir_all(paths.store_dir()).expect("mkdir");
        let log = Changelog::open(&paths).expect("open");
        (temp, paths, log)
    }

    #[test]
    fn append_is_idempotent() {
        let (_temp, _paths, mut log) = open();
        let a = log.append(commit(&[], "a")).expect("append");
        let again = log.append(commit(&[], "a")).expect("append");
        assert_eq!(a, again);
        assert_eq!(log.len(), 1);
        assert_eq!(log.tip(), Some(&a));
    }

    #[test]
    fn unknown_parent_is_rejected() {
        let (_temp, _paths, mut log) = open();
        let ghost = Node::hash(&[b"ghost"]);
        assert!(matches!(
            log.append(commit(&[&ghost], "x")),
            Err(StoreError::UnknownNode(_))
        ));
    }

    #[test]
    fn null_parents_are_dropped() {
        let (_temp, _paths, mut log) = open();
        let a = log
            .append(commit(&[&Node::null(), &Node::null()], "root"))
            .expect("append");
        assert_eq!(log.parents(&a), Some(&[][..]));
    }

    #[test]
    fn graph_queries() {
        let (_temp, _paths, mut log) = open();
        let a = log.append(commit(&[], "a")).expect("a");
        let b = log.append(commit(&[&a], "b")).expect("b");
        let c = log.append(commit(&[&a], "c")).expect("c");

        assert!(log.is_ancestor(&a, &b));
        assert!(!log.is_ancestor(&b, &c));
        let mut heads = log.heads();
        heads.sort();
        let mut expected = vec![b.clone(), c.clone()];
        expected.sort();
        assert_eq!(heads, expected);
        assert_eq!(log.heads_of([&a, &b]), vec![b.clone()]);
        assert_eq!(log.heads_of([&Node::null()]), Vec::<Node>::new());
    }

    #[test]
    fn flush_and_reopen() {
        let (_temp, paths, mut log) = open();
        let a = log.append(commit(&[], "a")).expect("a");
        assert_eq!(log.pending_len(), 1);
        log.flush().expect("flush");

        let reopened = Changelog::open(&paths).expect("reopen");
        assert_eq!(reopened.len(), 1);
        assert_eq!(reopened.get(&a).map(|e| e.description.as_str()), Some("a"));
        assert_eq!(reopened.rev(&a), Some(0));
    }
}
