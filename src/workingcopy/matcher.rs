//! workingcopy::matcher
//!
//! Selects the paths a commit covers. A matcher narrower than
//! [`Matcher::Always`] is a partial commit.

use std::collections::BTreeSet;

use crate::core::types::RepoPath;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Matcher {
    /// Every path.
    #[default]
    Always,
    /// Exactly the named files.
    Exact(BTreeSet<RepoPath>),
    /// Named files plus everything under the named directories.
    Patterns {
        files: BTreeSet<RepoPath>,
        dirs: BTreeSet<String>,
    },
}

impl Matcher {
    pub fn exact<I: IntoIterator<Item = RepoPath>>(paths: I) -> Self {
        Matcher::Exact(paths.into_iter().collect())
    }

    /// Build from path arguments; an argument ending in `/` names a
    /// directory.
    pub fn patterns<I, S>(args: I) -> Result<Self, crate::core::types::TypeError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut files = BTreeSet::new();
        let mut dirs = BTreeSet::new();
        for arg in args {
            let arg = arg.as_ref();
            match arg.strip_suffix('/') {
                Some(dir) => {
                    // Validates the directory name as a path
                    RepoPath::new(dir)?;
                    dirs.insert(dir.to_string());
                }
                None => {
                    files.insert(RepoPath::new(arg)?);
                }
            }
        }
        Ok(Matcher::Patterns { files, dirs })
    }

    pub fn is_always(&self) -> bool {
        matches!(self, Matcher::Always)
    }

    pub fn matches(&self, path: &RepoPath) -> bool {
        match self {
            Matcher::Always => true,
            Matcher::Exact(files) => files.contains(path),
            Matcher::Patterns { files, dirs } => {
                files.contains(path) || dirs.iter().any(|d| path.is_under(d))
            }
        }
    }

    /// Files named explicitly.
    pub fn files(&self) -> Vec<&RepoPath> {
        match self {
            Matcher::Always => Vec::new(),
            Matcher::Exact(files) | Matcher::Patterns { files, .. } => files.iter().collect(),
        }
    }

    /// Directories named explicitly.
    pub fn dirs(&self) -> Vec<&str> {
        match self {
            Matcher::Patterns { dirs, .. } => dirs.iter().map(String::as_str).collect(),
            _ => Vec::new(),
        }
    }
}
