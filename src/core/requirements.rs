//! core::requirements
//!
//! On-disk format requirements, resolved once when a repository is opened.
//!
//! # Architecture
//!
//! Every requirement the engine understands is listed in a fixed registry
//! ([`Requirement::ALL`]). Opening a repository reads `.vcs/requires` and
//! `.vcs/store/requires`; any name outside the registry is fatal, and no
//! partial repair is attempted. The resulting [`RequirementSet`] is
//! immutable for the lifetime of the repository instance.
//!
//! # Example
//!
//! ```
//! use vcstore::core::requirements::{Requirement, RequirementSet};
//!
//! let set = RequirementSet::default_set();
//! assert!(set.has(Requirement::VisibleHeads));
//! assert!(set.missing(&[Requirement::Mutation]).is_empty());
//! ```

use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::core::paths::RepoPaths;
use crate::core::vfs;

/// Errors from reading or writing requirement files.
#[derive(Debug, Error)]
pub enum RequirementError {
    /// The repository uses features this build does not understand.
    #[error("repository requires features unknown to this build: {}", .0.join(", "))]
    Unsupported(Vec<String>),

    /// No repository at the given location.
    #[error("repository not found: {} does not exist", .0.display())]
    NotFound(PathBuf),

    #[error("requirements i/o error: {0}")]
    Io(#[from] io::Error),
}

/// Where a requirement is recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Local,
    Store,
}

/// A format feature the repository depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Requirement {
    /// Shared data lives under `.vcs/store`.
    Store,
    /// JSON tracking state in `.vcs/dirstate`.
    DirstateV1,
    /// Append-only stores are JSON lines.
    JsonLog,
    /// Visibility is tracked through `visibleheads`.
    VisibleHeads,
    /// Mutation records are kept.
    Mutation,
}

impl Requirement {
    /// The fixed registry of supported requirements.
    pub const ALL: [Requirement; 5] = [
        Requirement::Store,
        Requirement::DirstateV1,
        Requirement::JsonLog,
        Requirement::VisibleHeads,
        Requirement::Mutation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Requirement::Store => "store",
            Requirement::DirstateV1 => "dirstate-v1",
            Requirement::JsonLog => "jsonlog",
            Requirement::VisibleHeads => "visibleheads",
            Requirement::Mutation => "mutation",
        }
    }

    pub fn scope(&self) -> Scope {
        match self {
            Requirement::Store | Requirement::DirstateV1 => Scope::Local,
            _ => Scope::Store,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|r| r.as_str() == name)
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The resolved, immutable set of requirements of one repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequirementSet {
    reqs: BTreeSet<Requirement>,
}

impl RequirementSet {
    /// Requirements written by `init`.
    pub fn default_set() -> Self {
        Self {
            reqs: Requirement::ALL.into_iter().collect(),
        }
    }

    pub fn has(&self, req: Requirement) -> bool {
        self.reqs.contains(&req)
    }

    pub fn missing(&self, required: &[Requirement]) -> Vec<Requirement> {
        required
            .iter()
            .copied()
            .filter(|r| !self.has(*r))
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = Requirement> + '_ {
        self.reqs.iter().copied()
    }

    /// Read both requirement files.
    ///
    /// # Errors
    ///
    /// - [`RequirementError::NotFound`] if `.vcs/requires` does not exist
    /// - [`RequirementError::Unsupported`] listing every unknown name
    pub fn load(paths: &RepoPaths) -> Result<Self, RequirementError> {
        let local_path = paths.requires_path();
        let local = vfs::read_optional(&local_path)?
            .ok_or(RequirementError::NotFound(local_path))?;
        let store = vfs::read_optional(&paths.store_requires_path())?.unwrap_or_default();

        let mut reqs = BTreeSet::new();
        let mut unknown = Vec::new();
        for line in String::from_utf8_lossy(&local)
            .lines()
            .chain(String::from_utf8_lossy(&store).lines())
        {
            let name = line.trim();
            if name.is_empty() {
                continue;
            }
            match Requirement::from_name(name) {
                Some(req) => {
                    reqs.insert(req);
                }
                None => unknown.push(name.to_string()),
            }
        }

        if !unknown.is_empty() {
            unknown.sort();
            unknown.dedup();
            return Err(RequirementError::Unsupported(unknown));
        }
        Ok(Self { reqs })
    }

    /// Write both requirement files, one name per line, sorted.
    pub fn write(&self, paths: &RepoPaths) -> Result<(), RequirementError> {
        fs::create_dir_all(paths.store_dir())?;
        let render = |scope: Scope| {
            self.reqs
                .iter()
                .filter(|r| r.scope() == scope)
                .map(|r| format!("{}\n", r.as_str()))
                .collect::<String>()
        };
        vfs::atomic_write(&paths.requires_path(), render(Scope::Local).as_bytes())?;
        vfs::atomic_write(&paths.store_requires_path(), render(Scope::Store).as_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (TempDir, RepoPaths) {
        let temp = TempDir::new().expect("temp dir");
        let paths = RepoPaths::new(temp.path());
        (temp, paths)
    }

    #[test]
    fn write_then_load() {
        let (_temp, paths) = setup();
        let set = RequirementSet::default_set();
        set.write(&paths).expect("write");

        let local = fs::read_to_string(paths.requires_path()).expect("read");
        assert_eq!(local, "store\ndirstate-v1\n");

        assert_eq!(RequirementSet::load(&paths).expect("load"), set);
    }

    #[test]
    fn unknown_requirement_is_fatal() {
        let (_temp, paths) = setup();
        RequirementSet::default_set().write(&paths).expect("write");
        fs::write(paths.store_requires_path(), "jsonlog\ntreemanifest\nlfs\n").expect("write");

        match RequirementSet::load(&paths) {
            Err(RequirementError::Unsupported(names)) => {
                assert_eq!(names, vec!["lfs".to_string(), "treemanifest".to_string()]);
            }
            other => panic!("expected Unsupported, got {:?}", other),
        }
    }

    #[test]
    fn missing_repository() {
        let (_temp, paths) = setup();
        assert!(matches!(
            RequirementSet::load(&paths),
            Err(RequirementError::NotFound(_))
        ));
    }

    #[test]
    fn missing_reports_absent() {
        let (_temp, paths) = setup();
        fs::create_dir_all(paths.store_dir()).expect("mkdir");
        fs::write(paths.requires_path(), "store\n").expect("write");
        let set = RequirementSet::load(&paths).expect("load");
        assert_eq!(
            set.missing(&[Requirement::Store, Requirement::Mutation]),
            vec![Requirement::Mutation]
        );
    }
}
