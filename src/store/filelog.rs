//! store::filelog
//!
//! File revisions. Every revision of every tracked path is one line of
//! `store/filelog`, keyed by `(path, node)`. The node covers the content,
//! both parents and the copy source, so unchanged content on an unchanged
//! history maps to the revision already stored.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use super::log::AppendLog;
use super::StoreError;
use crate::core::paths::RepoPaths;
use crate::core::types::{Node, RepoPath};

/// Where a copied or renamed file came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopySource {
    pub path: RepoPath,
    pub node: Node,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRevision {
    pub path: RepoPath,
    pub node: Node,
    pub p1: Node,
    pub p2: Node,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub copy: Option<CopySource>,
    /// Content, hex encoded.
    pub data: String,
}

/// Node of a file revision.
pub fn revision_node(data: &[u8], p1: &Node, p2: &Node, copy: Option<&CopySource>) -> Node {
    let (low, high) = if p1 <= p2 { (p1, p2) } else { (p2, p1) };
    let meta = match copy {
        Some(source) => format!("copy:{}\ncopyrev:{}\n", source.path, source.node),
        None => String::new(),
    };
    Node::hash(&[
        low.as_str().as_bytes(),
        high.as_str().as_bytes(),
        meta.as_bytes(),
        data,
    ])
}

#[derive(Debug)]
pub struct Filelog {
    log: AppendLog<FileRevision>,
    index: HashMap<(RepoPath, Node), usize>,
}

impl Filelog {
    pub fn open(paths: &RepoPaths) -> Result<Self, StoreError> {
        let log: AppendLog<FileRevision> = AppendLog::open(paths.store_file("filelog"))?;
        let index = log
            .entries()
            .iter()
            .enumerate()
            .map(|(idx, rev)| ((rev.path.clone(), rev.node.clone()), idx))
            .collect();
        Ok(Self { log, index })
    }

    pub fn get(&self, path: &RepoPath, node: &Node) -> Option<&FileRevision> {
        self.index
            .get(&(path.clone(), node.clone()))
            .map(|idx| &self.log.entries()[*idx])
    }

    pub fn contains(&self, path: &RepoPath, node: &Node) -> bool {
        self.index.contains_key(&(path.clone(), node.clone()))
    }

    /// Store a revision of `path`. Returns the existing node if an identical
    /// revision is already stored.
    pub fn add(
        &mut self,
        path: &RepoPath,
        data: &[u8],
        p1: &Node,
        p2: &Node,
        copy: Option<CopySource>,
    ) -> Result<Node, StoreError> {
        let node = revision_node(data, p1, p2, copy.as_ref());
        if self.contains(path, &node) {
            return Ok(node);
        }
        for parent in [p1, p2] {
            if !parent.is_null() && !self.contains(path, parent) {
                return Err(StoreError::UnknownFileRevision {
                    path: path.to_string(),
                    node: parent.clone(),
                });
            }
        }
        let idx = self.log.push(FileRevision {
            path: path.clone(),
            node: node.clone(),
            p1: p1.clone(),
            p2: p2.clone(),
            copy,
            data: hex::encode(data),
        });
        self.index.insert((path.clone(), node.clone()), idx);
        Ok(node)
    }

    /// Content of a revision.
    pub fn read(&self, path: &RepoPath, node: &Node) -> Result<Vec<u8>, StoreError> {
        let rev = self.get(path, node).ok_or_else(|| StoreError::UnknownFileRevision {
            path: path.to_string(),
            node: node.clone(),
        })?;
        hex::decode(&rev.data).map_err(|e| StoreError::Corrupt {
            file: "filelog".into(),
            message: format!("{}@{}: {}", path, node.short(12), e),
        })
    }

    /// Copy source of a revision, if it was copied.
    pub fn renamed(&self, path: &RepoPath, node: &Node) -> Option<&CopySource> {
        self.get(path, node).and_then(|rev| rev.copy.as_ref())
    }

    pub fn parents(&self, path: &RepoPath, node: &Node) -> Option<(&Node, &Node)> {
        self.get(path, node).map(|rev| (&rev.p1, &rev.p2))
    }

    /// Whether `data` differs from the stored content of a revision.
    pub fn content_differs(
        &self,
        path: &RepoPath,
        node: &Node,
        data: &[u8],
    ) -> Result<bool, StoreError> {
        Ok(self.read(path, node)? != data)
    }

    fn ancestors(&self, path: &RepoPath, node: &Node) -> HashSet<Node> {
        let mut seen = HashSet::new();
        let mut stack = vec![node.clone()];
        while let Some(current) = stack.pop() {
            if current.is_null() || !seen.insert(current.clone()) {
                continue;
            }
            if let Some((p1, p2)) = self.parents(path, &current) {
                stack.push(p1.clone());
                stack.push(p2.clone());
            }
        }
        seen
    }

    /// Heads of the common ancestors of two revisions of `path`.
    pub fn common_ancestor_heads(&self, path: &RepoPath, a: &Node, b: &Node) -> Vec<Node> {
        let left = self.ancestors(path, a);
        let right = self.ancestors(path, b);
        let common: HashSet<&Node> = left.intersection(&right).collect();
        let mut covered = HashSet::new();
        for node in &common {
            if let Some((p1, p2)) = self.parents(path, node) {
                covered.extend(self.ancestors(path, p1));
                covered.extend(self.ancestors(path, p2));
            }
        }
        let mut heads: Vec<Node> = common
            .into_iter()
            .filter(|n| !covered.contains(*n))
            .cloned()
            .collect();
        heads.sort();
        heads
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

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open() -> (TempDir, RepoPaths, Filelog) {
        let temp = TempDir::new().expect("temp dir");
        let paths = RepoPaths::new(temp.path());
        std::fs::create_dir_all(paths.store_dir()).expect("mkdir");
        let log = Filelog::open(&paths).expect("open");
        (temp, paths, log)
    }

    fn path(p: &str) -> RepoPath {
        RepoPath::new(p).expect("path")
    }

    #[test]
    fn add_read_and_dedupe() {
        let (_temp, paths, mut log) = open();
        let a = path("a.txt");
        let null = Node::null();
        let n1 = log.add(&a, b"hello\n", &null, &null, None).expect("add");
        let again = log.add(&a, b"hello\n", &null, &null, None).expect("add");
        assert_eq!(n1, again);
        assert_eq!(log.len(), 1);
        assert_eq!(log.read(&a, &n1).expect("read"), b"hello\n");
        assert!(!log.content_differs(&a, &n1, b"hello\n").expect("cmp"));
        assert!(log.content_differs(&a, &n1, b"bye\n").expect("cmp"));

        log.flush().expect("flush");
        let reopened = Filelog::open(&paths).expect("reopen");
        assert_eq!(reopened.read(&a, &n1).expect("read"), b"hello\n");
    }

    #[test]
    fn parent_order_does_not_change_node() {
        let x = Node::hash(&[b"x"]);
        let y = Node::hash(&[b"y"]);
        assert_eq!(revision_node(b"d", &x, &y, None), revision_node(b"d", &y, &x, None));
    }

    #[test]
    fn copy_metadata_is_kept() {
        let (_temp, _paths, mut log) = open();
        let null = Node::null();
        let src = path("src");
        let s1 = log.add(&src, b"data", &null, &null, None).expect("add");
        let copy = CopySource {
            path: src.clone(),
            node: s1.clone(),
        };
        let dst = path("dst");
        let d1 = log
            .add(&dst, b"data", &null, &null, Some(copy.clone()))
            .expect("add");
        assert_ne!(s1, d1);
        assert_eq!(log.renamed(&dst, &d1), Some(&copy));
        assert_eq!(log.renamed(&src, &s1), None);
    }

    #[test]
    fn unknown_parent_is_rejected() {
        let (_temp, _paths, mut log) = open();
        let ghost = Node::hash(&[b"ghost"]);
        assert!(matches!(
            log.add(&path("a"), b"x", &ghost, &Node::null(), None),
            Err(StoreError::UnknownFileRevision { .. })
        ));
    }

    #[test]
    fn common_ancestor_heads_of_diverged_revisions() {
        let (_temp, _paths, mut log) = open();
        let a = path("a");
        let null = Node::null();
        let base = log.add(&a, b"0", &null, &null, None).expect("base");
        let left = log.add(&a, b"1", &base, &null, None).expect("left");
        let right = log.add(&a, b"2", &base, &null, None).expect("right");
        assert_eq!(log.common_ancestor_heads(&a, &left, &right), vec![base.clone()]);
        assert_eq!(log.common_ancestor_heads(&a, &base, &left), vec![base]);
    }
}
