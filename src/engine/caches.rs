//! engine::caches
//!
//! Derived repository state, memoized in the repository's cache registry.
//!
//! | Cache          | Key                                               |
//! |----------------|---------------------------------------------------|
//! | `metadataroot` | stat signatures of the three small store files    |
//! | `phasesets`    | metadata root + changelog length                  |
//! | `heads`        | working parents + metadata root + changelog length |
//!
//! Every store mutation goes through a transaction, whose abort path
//! invalidates everything and whose close changes at least one key input.

use std::collections::HashMap;
use std::collections::HashSet;

use crate::core::cache::{CacheRegistry, KeyStrategy, VersionKey};
use crate::core::paths::RepoPaths;
use crate::core::types::{Node, Phase};
use crate::store::{GraphStore, Stores};

use super::repository::Repository;
use super::RepoError;

pub const METADATA_ROOT: &str = "metadataroot";
pub const HEADS: &str = "heads";
pub const PHASE_SETS: &str = "phasesets";

pub(crate) fn register(caches: &mut CacheRegistry<Repository, RepoError>, paths: &RepoPaths) {
    caches.register(
        METADATA_ROOT,
        KeyStrategy::Files(
            Stores::SMALL_FILES
                .iter()
                .map(|name| paths.store_file(name))
                .collect(),
        ),
    );
    caches.register(
        PHASE_SETS,
        KeyStrategy::Custom(Box::new(|repo: &Repository| {
            Ok::<_, RepoError>(VersionKey::from_parts([
                repo.metadata_root()?.to_string(),
                repo.stores.changelog.len().to_string(),
            ]))
        })),
    );
    caches.register(
        HEADS,
        KeyStrategy::Custom(Box::new(|repo: &Repository| {
            Ok::<_, RepoError>(VersionKey::from_parts([
                repo.dirstate.p1().to_string(),
                repo.dirstate.p2().to_string(),
                repo.metadata_root()?.to_string(),
                repo.stores.changelog.len().to_string(),
            ]))
        })),
    );
}

impl Repository {
    /// Hash over the bookmarks, phase roots and visible heads files.
    pub fn metadata_root(&self) -> Result<Node, RepoError> {
        let root = self.caches.get(self, METADATA_ROOT, |repo| {
            let mut parts = Vec::new();
            for name in Stores::SMALL_FILES {
                let data = crate::core::vfs::read_optional(&repo.paths.store_file(name))?;
                parts.push(data.unwrap_or_default());
            }
            let slices: Vec<&[u8]> = parts.iter().map(Vec::as_slice).collect();
            Ok(Node::hash(&slices))
        })?;
        Ok((*root).clone())
    }

    fn phase_sets(&self) -> Result<std::rc::Rc<HashMap<Node, Phase>>, RepoError> {
        self.caches.get(self, PHASE_SETS, |repo| {
            Ok(repo.stores.phases.compute_all(&repo.stores.changelog))
        })
    }

    /// Phase of `node`. Unknown nodes are public.
    pub fn phase(&self, node: &Node) -> Result<Phase, RepoError> {
        Ok(self
            .phase_sets()?
            .get(node)
            .copied()
            .unwrap_or(Phase::Public))
    }

    /// Visible heads, sorted.
    ///
    /// Candidates are the recorded visible heads, bookmark targets, the
    /// working parents and the heads of public history; the result keeps
    /// the ones that are not ancestors of another candidate.
    pub fn heads(&self) -> Result<Vec<Node>, RepoError> {
        let heads = self.caches.get(self, HEADS, |repo| {
            let phases = repo.phase_sets()?;
            let changelog = &repo.stores.changelog;
            let mut candidates: HashSet<Node> = repo.stores.visibility.heads().iter().cloned().collect();
            candidates.extend(repo.stores.bookmarks.iter().map(|(_, node)| node.clone()));
            candidates.extend(
                repo.dirstate
                    .parents()
                    .into_iter()
                    .filter(|p| !p.is_null()),
            );
            let public: Vec<&Node> = changelog
                .entries()
                .iter()
                .map(|e| &e.node)
                .filter(|n| phases.get(*n).copied().unwrap_or(Phase::Public) == Phase::Public)
                .collect();
            candidates.extend(changelog.heads_of(public));
            Ok(changelog.heads_of(candidates.iter()))
        })?;
        Ok((*heads).clone())
    }

    /// Whether `name` holds a value computed against its live key.
    pub fn is_cache_fresh(&self, name: &str) -> Result<bool, RepoError> {
        self.caches.is_fresh(self, name)
    }

    /// The stored value of cache `name` without checking its key.
    pub fn peek_cache<V: 'static>(&self, name: &str) -> Option<std::rc::Rc<V>> {
        self.caches.peek(name)
    }

    pub fn invalidate(&self, name: &str) {
        self.caches.invalidate(name);
    }

    pub fn invalidate_all(&self) {
        self.caches.invalidate_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::Config;
    use crate::store::changelog::tests::commit;
    use tempfile::TempDir;

    fn repo() -> (TempDir, Repository) {
        let temp = TempDir::new().expect("temp dir");
        let repo = Repository::init_with_config(temp.path(), Config::default()).expect("init");
        (temp, repo)
    }

    #[test]
    fn heads_follow_commits() {
        let (_temp, mut repo) = repo();
        assert!(repo.heads().expect("heads").is_empty());
        assert!(repo.is_cache_fresh(HEADS).expect("fresh"));

        let node = repo
            .with_lock(|repo| {
                repo.with_transaction("t", |repo| {
                    let node = repo.stores.changelog.append(commit(&[], "x"))?;
                    repo.stores.visibility.add(&node, &[])?;
                    Ok(node)
                })
            })
            .expect("txn");
        assert_eq!(repo.heads().expect("heads"), vec![node]);
    }

    #[test]
    fn metadata_root_tracks_small_files() {
        let (_temp, mut repo) = repo();
        let before = repo.metadata_root().expect("root");
        let name = crate::core::types::BookmarkName::new("main").expect("name");
        let node = Node::hash(&[b"x"]);
        repo.stores.bookmarks.set(name, node).expect("set");
        assert!(!repo.is_cache_fresh(METADATA_ROOT).expect("fresh"));
        assert_ne!(repo.metadata_root().expect("root"), before);
    }

    #[test]
    fn unknown_nodes_are_public() {
        let (_temp, repo) = repo();
        assert_eq!(repo.phase(&Node::hash(&[b"nope"])).expect("phase"), Phase::Public);
    }
}
