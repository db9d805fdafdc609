//! workingcopy::status
//!
//! Working-copy changes relative to the first parent.

use std::fs;

use super::{Dirstate, FileState, Matcher, WorkingCopyError};
use crate::core::paths::RepoPaths;
use crate::core::types::RepoPath;
use crate::store::{Filelog, Manifest};

/// Content and flags of a file in the working directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkingFile {
    pub data: Vec<u8>,
    pub flags: String,
}

impl WorkingFile {
    /// Read `path` from the working directory. `None` if it is missing.
    pub fn read(paths: &RepoPaths, path: &RepoPath) -> Result<Option<Self>, WorkingCopyError> {
        let full = paths.wfile(path);
        let meta = match fs::symlink_metadata(&full) {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if meta.file_type().is_symlink() {
            let target = fs::read_link(&full)?;
            return Ok(Some(Self {
                data: target.to_string_lossy().into_owned().into_bytes(),
                flags: "l".into(),
            }));
        }
        if !meta.is_file() {
            return Ok(None);
        }
        Ok(Some(Self {
            data: fs::read(&full)?,
            flags: exec_flag(&meta).into(),
        }))
    }
}

#[cfg(unix)]
fn exec_flag(meta: &fs::Metadata) -> &'static str {
    use std::os::unix::fs::PermissionsExt;
    if meta.permissions().mode() & 0o111 != 0 {
        "x"
    } else {
        ""
    }
}

#[cfg(not(unix))]
fn exec_flag(_meta: &fs::Metadata) -> &'static str {
    ""
}

/// Changed paths, each list sorted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Status {
    pub modified: Vec<RepoPath>,
    pub added: Vec<RepoPath>,
    pub removed: Vec<RepoPath>,
    /// Tracked but missing from the working directory.
    pub deleted: Vec<RepoPath>,
}

impl Status {
    /// Compare the tracked files selected by `matcher` against `manifest`,
    /// the manifest of the first parent.
    pub fn compute(
        paths: &RepoPaths,
        dirstate: &Dirstate,
        manifest: &Manifest,
        filelog: &Filelog,
        matcher: &Matcher,
    ) -> Result<Self, WorkingCopyError> {
        let mut status = Status::default();
        for (path, state) in dirstate.entries() {
            if !matcher.matches(path) {
                continue;
            }
            if state == FileState::Removed {
                status.removed.push(path.clone());
                continue;
            }
            let Some(file) = WorkingFile::read(paths, path)? else {
                status.deleted.push(path.clone());
                continue;
            };
            match (state, manifest.get(path)) {
                (FileState::Added, _) | (_, None) => status.added.push(path.clone()),
                (FileState::Merged, _) => status.modified.push(path.clone()),
                (_, Some(entry)) => {
                    if entry.flags != file.flags
                        || filelog.content_differs(path, &entry.node, &file.data)?
                        || dirstate.copy_source(path).is_some()
                    {
                        status.modified.push(path.clone());
                    }
                }
            }
        }
        Ok(status)
    }

    /// Paths that go into a commit: modified, added and removed.
    pub fn changed(&self) -> Vec<RepoPath> {
        let mut files: Vec<RepoPath> = self
            .modified
            .iter()
            .chain(&self.added)
            .chain(&self.removed)
            .cloned()
            .collect();
        files.sort();
        files
    }

    pub fn is_clean(&self) -> bool {
        self.modified.is_empty()
            && self.added.is_empty()
            && self.removed.is_empty()
            && self.deleted.is_empty()
    }

    pub fn contains(&self, path: &RepoPath) -> bool {
        self.modified.contains(path) || self.added.contains(path) || self.removed.contains(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Node;
    use crate::store::ManifestEntry;
    use tempfile::TempDir;

    fn path(p: &str) -> RepoPath {
        RepoPath::new(p).expect("path")
    }

    struct Fixture {
        _temp: TempDir,
        paths: RepoPaths,
        dirstate: Dirstate,
        filelog: Filelog,
        manifest: Manifest,
    }

    fn fixture() -> Fixture {
        let temp = TempDir::new().expect("temp dir");
        let paths = RepoPaths::new(temp.path());
        fs::create_dir_all(paths.store_dir()).expect("mkdir");
        let dirstate = Dirstate::load(&paths).expect("dirstate");
        let filelog = Filelog::open(&paths).expect("filelog");
        Fixture {
            _temp: temp,
            paths,
            dirstate,
            filelog,
            manifest: Manifest::new(),
        }
    }

    #[test]
    fn classifies_changes() {
        let mut f = fixture();
        let null = Node::null();
        for (name, data) in [("same", "1"), ("edited", "1"), ("gone", "1"), ("dropped", "1")] {
            let p = path(name);
            let node = f.filelog.add(&p, data.as_bytes(), &null, &null, None).expect("add");
            f.manifest.insert(p.clone(), ManifestEntry::new(node, ""));
            f.dirstate.add(p);
        }
        f.dirstate.mark_committed(
            &Node::hash(&[b"c"]),
            &["same", "edited", "gone", "dropped"].map(path),
        );
        fs::write(f.paths.wfile(&path("same")), "1").expect("write");
        fs::write(f.paths.wfile(&path("edited")), "2").expect("write");
        fs::write(f.paths.wfile(&path("dropped")), "1").expect("write");
        fs::write(f.paths.wfile(&path("new")), "n").expect("write");
        f.dirstate.add(path("new"));
        f.dirstate.remove(&path("dropped")).expect("remove");

        let status = Status::compute(&f.paths, &f.dirstate, &f.manifest, &f.filelog, &Matcher::Always)
            .expect("status");
        assert_eq!(status.modified, vec![path("edited")]);
        assert_eq!(status.added, vec![path("new")]);
        assert_eq!(status.removed, vec![path("dropped")]);
        assert_eq!(status.deleted, vec![path("gone")]);
        assert_eq!(status.changed(), vec![path("dropped"), path("edited"), path("new")]);
    }

    #[test]
    fn matcher_filters() {
        let mut f = fixture();
        fs::write(f.paths.wfile(&path("a")), "a").expect("write");
        fs::write(f.paths.wfile(&path("b")), "b").expect("write");
        f.dirstate.add(path("a"));
        f.dirstate.add(path("b"));
        let status = Status::compute(
            &f.paths,
            &f.dirstate,
            &f.manifest,
            &f.filelog,
            &Matcher::exact([path("b")]),
        )
        .expect("status");
        assert_eq!(status.added, vec![path("b")]);
    }
}
