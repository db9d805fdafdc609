//! store::phases
//!
//! Phase roots. A commit's phase is the highest phase among its own root
//! membership and its parents' phases, so only the commits where the phase
//! rises need to be stored. `store/phaseroots` holds those roots as JSON and
//! is rewritten atomically on every change.

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::changelog::Changelog;
use super::{GraphStore, PhaseStore, StoreError};
use crate::core::paths::RepoPaths;
use crate::core::types::{Node, Phase};
use crate::core::vfs::{self, FileStamp};

/// One commit changing phase. `from` is `None` for a new commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseMove {
    pub node: Node,
    pub from: Option<Phase>,
    pub to: Phase,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct RootsFile {
    #[serde(default)]
    draft: BTreeSet<Node>,
    #[serde(default)]
    secret: BTreeSet<Node>,
}

#[derive(Debug)]
pub struct PhaseRoots {
    path: PathBuf,
    roots: RootsFile,
    stamp: FileStamp,
}

impl PhaseRoots {
    pub fn load(paths: &RepoPaths) -> Result<Self, StoreError> {
        let path = paths.store_file("phaseroots");
        let stamp = FileStamp::of(&path)?;
        let roots = match vfs::read_optional(&path)? {
            Some(data) => serde_json::from_slice(&data)?,
            None => RootsFile::default(),
        };
        Ok(Self { path, roots, stamp })
    }

    pub fn write(&mut self) -> Result<(), StoreError> {
        let data = serde_json::to_vec(&self.roots)?;
        vfs::atomic_write(&self.path, &data)?;
        self.stamp = FileStamp::of(&self.path)?;
        Ok(())
    }

    pub fn is_stale(&self) -> Result<bool, StoreError> {
        Ok(FileStamp::of(&self.path)? != self.stamp)
    }

    /// Roots of one non-public phase.
    pub fn roots(&self, phase: Phase) -> Option<&BTreeSet<Node>> {
        match phase {
            Phase::Public => None,
            Phase::Draft => Some(&self.roots.draft),
            Phase::Secret => Some(&self.roots.secret),
        }
    }

    fn root_phase(&self, node: &Node) -> Phase {
        if self.roots.secret.contains(node) {
            Phase::Secret
        } else if self.roots.draft.contains(node) {
            Phase::Draft
        } else {
            Phase::Public
        }
    }

    /// Phase of every commit, in one pass over the changelog.
    pub fn compute_all(&self, changelog: &Changelog) -> HashMap<Node, Phase> {
        let mut phases: HashMap<Node, Phase> = HashMap::with_capacity(changelog.len());
        for entry in changelog.entries() {
            let inherited = entry
                .parents
                .iter()
                .filter_map(|p| phases.get(p).copied())
                .max()
                .unwrap_or(Phase::Public);
            phases.insert(entry.node.clone(), inherited.max(self.root_phase(&entry.node)));
        }
        phases
    }

    /// Lower `nodes` and their ancestors to at most `target`.
    pub fn advance(
        &mut self,
        changelog: &Changelog,
        target: Phase,
        nodes: &[Node],
    ) -> Result<Vec<PhaseMove>, StoreError> {
        let mut phases = self.compute_all(changelog);
        let mut moves = Vec::new();
        for node in nodes {
            if !changelog.contains(node) {
                return Err(StoreError::UnknownNode(node.clone()));
            }
            for ancestor in changelog.ancestors(node) {
                if let Some(phase) = phases.get_mut(&ancestor) {
                    if *phase > target {
                        moves.push(PhaseMove {
                            node: ancestor.clone(),
                            from: Some(*phase),
                            to: target,
                        });
                        *phase = target;
                    }
                }
            }
        }
        self.rebuild(changelog, &phases)?;
        moves.sort_by(|a, b| a.node.cmp(&b.node));
        Ok(moves)
    }

    /// Raise `nodes` and their descendants to at least `target`.
    pub fn retract(
        &mut self,
        changelog: &Changelog,
        target: Phase,
        nodes: &[Node],
    ) -> Result<Vec<PhaseMove>, StoreError> {
        let mut phases = self.compute_all(changelog);
        for node in nodes {
            if !changelog.contains(node) {
                return Err(StoreError::UnknownNode(node.clone()));
            }
        }
        let mut raise: BTreeSet<Node> = nodes.iter().cloned().collect();
        let mut moves = Vec::new();
        // Entries are in topological order, so descendants follow their parents
        for entry in changelog.entries() {
            let selected = raise.contains(&entry.node)
                || entry.parents.iter().any(|p| raise.contains(p));
            if !selected {
                continue;
            }
            raise.insert(entry.node.clone());
            if let Some(phase) = phases.get_mut(&entry.node) {
                if *phase < target {
                    moves.push(PhaseMove {
                        node: entry.node.clone(),
                        from: Some(*phase),
                        to: target,
                    });
                    *phase = target;
                }
            }
        }
        self.rebuild(changelog, &phases)?;
        Ok(moves)
    }

    /// Recompute the root sets from a full phase assignment and write them.
    fn rebuild(
        &mut self,
        changelog: &Changelog,
        phases: &HashMap<Node, Phase>,
    ) -> Result<(), StoreError> {
        let mut roots = RootsFile::default();
        for entry in changelog.entries() {
            let phase = phases.get(&entry.node).copied().unwrap_or(Phase::Public);
            let inherited = entry
                .parents
                .iter()
                .filter_map(|p| phases.get(p).copied())
                .max()
                .unwrap_or(Phase::Public);
            if phase > inherited {
                match phase {
                    Phase::Draft => roots.draft.insert(entry.node.clone()),
                    Phase::Secret => roots.secret.insert(entry.node.clone()),
                    Phase::Public => false,
                };
            }
        }
        if roots != self.roots {
            self.roots = roots;
            self.write()?;
        }
        Ok(())
    }
}

impl PhaseStore for PhaseRoots {
    fn register(
        &mut self,
        graph: &dyn GraphStore,
        node: &Node,
        phase: Phase,
    ) -> Result<Option<PhaseMove>, StoreError> {
        let Some(parents) = graph.parents(node) else {
            return Err(StoreError::UnknownNode(node.clone()));
        };
        if self.roots.draft.contains(node) || self.roots.secret.contains(node) {
            return Ok(None);
        }
        let inherited = parents
            .iter()
            .map(|p| self.phase_of(graph, p))
            .max()
            .unwrap_or(Phase::Public);
        let effective = phase.max(inherited);
        if phase > inherited {
            match phase {
                Phase::Draft => self.roots.draft.insert(node.clone()),
                Phase::Secret => self.roots.secret.insert(node.clone()),
                Phase::Public => false,
            };
            self.write()?;
        }
        Ok(Some(PhaseMove {
            node: node.clone(),
            from: None,
            to: effective,
        }))
    }

    fn phase_of(&self, graph: &dyn GraphStore, node: &Node) -> Phase {
        for phase in [Phase::Secret, Phase::Draft] {
            let roots = match phase {
                Phase::Secret => &self.roots.secret,
                _ => &self.roots.draft,
            };
            if roots.iter().any(|root| graph.is_ancestor(root, node)) {
                return phase;
            }
        }
        Phase::Public
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::changelog::tests::commit;
    use tempfile::TempDir;

    struct Fixture {
        _temp: TempDir,
        paths: RepoPaths,
        changelog: Changelog,
        phases: PhaseRoots,
    }

    fn fixture() -> Fixture {
        let temp = TempDir::new().expect("temp dir");
        let paths = RepoPaths::new(temp.path());
        std::fs::create_dir_all(paths.store_dir()).expect("mkdir");
        let changelog = Changelog::open(&paths).expect("changelog");
        let phases = PhaseRoots::load(&paths).expect("phases");
        Fixture {
            _temp: temp,
            paths,
            changelog,
            phases,
        }
    }

    #[test]
    fn register_adds_root_only_when_phase_rises() {
        let mut f = fixture();
        let a = f.changelog.append(commit(&[], "a")).expect("a");
        let b = f.changelog.append(commit(&[&a], "b")).expect("b");

        let moved = f
            .phases
            .register(&f.changelog, &a, Phase::Draft)
            .expect("register");
        assert_eq!(moved.map(|m| m.to), Some(Phase::Draft));

        // b inherits draft without becoming a root
        let moved = f
            .phases
            .register(&f.changelog, &b, Phase::Draft)
            .expect("register");
        assert_eq!(moved.map(|m| m.to), Some(Phase::Draft));
        assert_eq!(f.phases.roots(Phase::Draft).map(|r| r.len()), Some(1));
        assert_eq!(f.phases.phase_of(&f.changelog, &b), Phase::Draft);
    }

    #[test]
    fn secret_parent_wins() {
        let mut f = fixture();
        let a = f.changelog.append(commit(&[], "a")).expect("a");
        let b = f.changelog.append(commit(&[&a], "b")).expect("b");
        f.phases
            .register(&f.changelog, &a, Phase::Secret)
            .expect("register");
        let moved = f
            .phases
            .register(&f.changelog, &b, Phase::Draft)
            .expect("register")
            .expect("move");
        assert_eq!(moved.to, Phase::Secret);
    }

    #[test]
    fn advance_and_retract_recompute_roots() {
        let mut f = fixture();
        let a = f.changelog.append(commit(&[], "a")).expect("a");
        let b = f.changelog.append(commit(&[&a], "b")).expect("b");
        let c = f.changelog.append(commit(&[&b], "c")).expect("c");
        f.phases
            .register(&f.changelog, &a, Phase::Draft)
            .expect("register");

        let moves = f
            .phases
            .advance(&f.changelog, Phase::Public, &[b.clone()])
            .expect("advance");
        assert_eq!(moves.len(), 2);
        let all = f.phases.compute_all(&f.changelog);
        assert_eq!(all[&a], Phase::Public);
        assert_eq!(all[&b], Phase::Public);
        assert_eq!(all[&c], Phase::Draft);
        assert_eq!(
            f.phases.roots(Phase::Draft).cloned(),
            Some(BTreeSet::from([c.clone()]))
        );

        let moves = f
            .phases
            .retract(&f.changelog, Phase::Secret, &[b.clone()])
            .expect("retract");
        assert_eq!(moves.len(), 2);
        assert_eq!(f.phases.phase_of(&f.changelog, &c), Phase::Secret);
        assert_eq!(f.phases.phase_of(&f.changelog, &a), Phase::Public);

        let reloaded = PhaseRoots::load(&f.paths).expect("reload");
        assert_eq!(reloaded.roots(Phase::Secret), f.phases.roots(Phase::Secret));
    }
}
