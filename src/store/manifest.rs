//! store::manifest
//!
//! Manifests map every tracked path to the file revision it holds in one
//! commit. Each record in `store/manifests` is a delta against a base
//! manifest; the log is replayed on open.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use super::log::AppendLog;
use super::{ManifestStore, StoreError};
use crate::core::paths::RepoPaths;
use crate::core::types::{Node, RepoPath};

/// The revision of one path in a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub node: Node,
    /// `""`, `"x"` (executable) or `"l"` (symlink).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub flags: String,
}

impl ManifestEntry {
    pub fn new(node: Node, flags: impl Into<String>) -> Self {
        Self {
            node,
            flags: flags.into(),
        }
    }
}

pub type Manifest = BTreeMap<RepoPath, ManifestEntry>;

/// Changes relative to a base manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManifestDelta {
    pub set: BTreeMap<RepoPath, ManifestEntry>,
    pub removed: BTreeSet<RepoPath>,
}

impl ManifestDelta {
    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.removed.is_empty()
    }

    fn apply(&self, manifest: &mut Manifest) {
        for path in &self.removed {
            manifest.remove(path);
        }
        for (path, entry) in &self.set {
            manifest.insert(path.clone(), entry.clone());
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ManifestRecord {
    id: Node,
    base: Node,
    #[serde(default)]
    set: BTreeMap<RepoPath, ManifestEntry>,
    #[serde(default)]
    removed: BTreeSet<RepoPath>,
}

/// Id of a manifest's content. The empty manifest is the null id.
pub fn manifest_id(manifest: &Manifest) -> Node {
    if manifest.is_empty() {
        return Node::null();
    }
    let mut content = String::new();
    for (path, entry) in manifest {
        content.push_str(path.as_str());
        content.push('\0');
        content.push_str(entry.node.as_str());
        content.push_str(&entry.flags);
        content.push('\n');
    }
    Node::hash(&[b"manifest", content.as_bytes()])
}

#[derive(Debug)]
pub struct ManifestLog {
    log: AppendLog<ManifestRecord>,
    materialized: HashMap<Node, Manifest>,
}

impl ManifestLog {
    pub fn open(paths: &RepoPaths) -> Result<Self, StoreError> {
        let log: AppendLog<ManifestRecord> = AppendLog::open(paths.store_file("manifests"))?;
        let mut materialized: HashMap<Node, Manifest> = HashMap::new();
        for record in log.entries() {
            let mut manifest = if record.base.is_null() {
                Manifest::new()
            } else {
                materialized
                    .get(&record.base)
                    .cloned()
                    .ok_or_else(|| StoreError::Corrupt {
                        file: "manifests".into(),
                        message: format!("record {} has unknown base {}", record.id, record.base),
                    })?
            };
            let delta = ManifestDelta {
                set: record.set.clone(),
                removed: record.removed.clone(),
            };
            delta.apply(&mut manifest);
            materialized.insert(record.id.clone(), manifest);
        }
        Ok(Self { log, materialized })
    }

    pub fn contains(&self, id: &Node) -> bool {
        id.is_null() || self.materialized.contains_key(id)
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

impl ManifestStore for ManifestLog {
    fn write(&mut self, base: &Node, delta: &ManifestDelta) -> Result<Node, StoreError> {
        let mut manifest = self.read(base)?;
        delta.apply(&mut manifest);
        let id = manifest_id(&manifest);
        if self.contains(&id) {
            return Ok(id);
        }
        self.log.push(ManifestRecord {
            id: id.clone(),
            base: base.clone(),
            set: delta.set.clone(),
            removed: delta.removed.clone(),
        });
        self.materialized.insert(id.clone(), manifest);
        Ok(id)
    }

    fn read(&self, id: &Node) -> Result<Manifest, StoreError> {
        if id.is_null() {
            return Ok(Manifest::new());
        }
        self.materialized
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::UnknownManifest(id.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn path(p: &str) -> RepoPath {
        RepoPath::new(p).expect("path")
    }

    fn entry(data: &[u8]) -> ManifestEntry {
        ManifestEntry::new(Node::hash(&[data]), "")
    }

    fn open() -> (TempDir, RepoPaths, ManifestLog) {
        let temp = TempDir::new().expect("temp dir");
        let paths = RepoPaths::new(temp.path());
        std::fs::create_dir_all(paths.store_dir()).expect("mkdir");
        let log = ManifestLog::open(&paths).expect("open");
        (temp, paths, log)
    }

    #[test]
    fn null_is_empty() {
        let (_temp, _paths, log) = open();
        assert!(log.read(&Node::null()).expect("read").is_empty());
        assert!(matches!(
            log.read(&Node::hash(&[b"x"])),
            Err(StoreError::UnknownManifest(_))
        ));
    }

    #[test]
    fn deltas_chain_and_replay() {
        let (_temp, paths, mut log) = open();
        let mut first = ManifestDelta::default();
        first.set.insert(path("a"), entry(b"a1"));
        first.set.insert(path("b"), entry(b"b1"));
        let m1 = log.write(&Node::null(), &first).expect("write");

        let mut second = ManifestDelta::default();
        second.set.insert(path("a"), entry(b"a2"));
        second.removed.insert(path("b"));
        let m2 = log.write(&m1, &second).expect("write");
        log.flush().expect("flush");

        let reopened = ManifestLog::open(&paths).expect("reopen");
        let manifest = reopened.read(&m2).expect("read");
        assert_eq!(manifest.len(), 1);
        assert_eq!(manifest.get(&path("a")), Some(&entry(b"a2")));
        assert_eq!(reopened.read(&m1).expect("read").len(), 2);
    }

    #[test]
    fn identical_content_is_not_rewritten() {
        let (_temp, _paths, mut log) = open();
        let mut delta = ManifestDelta::default();
        delta.set.insert(path("a"), entry(b"a1"));
        let m1 = log.write(&Node::null(), &delta).expect("write");
        let again = log.write(&m1, &delta).expect("write");
        assert_eq!(m1, again);
        assert_eq!(log.len(), 1);

        let mut clear = ManifestDelta::default();
        clear.removed.insert(path("a"));
        assert_eq!(log.write(&m1, &clear).expect("write"), Node::null());
    }
}
